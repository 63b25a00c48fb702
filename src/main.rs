mod catalog;
mod config;
mod downloads;
mod engine;
mod error;
mod events;
mod handlers;
mod installer;
mod payload;
mod prefs;
mod registry;
mod state;
mod tasks;
mod transport;
mod update;

use axum::{
    Router,
    routing::{get, post, put},
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Level, info, warn};

use crate::catalog::Catalog;
use crate::config::Settings;
use crate::downloads::DownloadCoordinator;
use crate::engine::{CommandEngine, UpdateEngine};
use crate::events::Notifier;
use crate::handlers::{api, events as events_h};
use crate::installer::Installer;
use crate::prefs::{Preferences, PreferencesData};
use crate::registry::Registry;
use crate::state::AppState;
use crate::transport::{ReqwestTransport, Transport};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let settings = Settings::new().expect("Failed to load configuration");

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting updaterd...");

    if !settings.updates_dir().exists() {
        std::fs::create_dir_all(settings.updates_dir())
            .expect("Failed to create updates directory");
    }

    let client = reqwest::Client::new();
    let transport = Arc::new(ReqwestTransport::new(client.clone()));
    let engine = Arc::new(CommandEngine::new(
        settings.engine_command.clone(),
        settings.engine_args.clone(),
        settings.engine_perf_args.clone(),
    ));
    let state = build_state(settings.clone(), client, transport, engine);

    let perf_mode = state.registry.prefs().ab_perf_mode();
    if let Err(e) = state.installer.set_performance_mode(perf_mode) {
        warn!("Could not apply performance mode: {}", e);
    }

    // Start background tasks (Catalog, Speed)
    tasks::start_background_tasks(state.clone());

    // --- Router Setup ---
    let app = create_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.server_port));
    info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

pub fn build_state(
    settings: Settings,
    client: reqwest::Client,
    transport: Arc<dyn Transport>,
    engine: Arc<dyn UpdateEngine>,
) -> AppState {
    let defaults = PreferencesData {
        auto_delete_updates: settings.auto_delete_updates,
        ab_perf_mode: settings.ab_perf_mode,
        ..Default::default()
    };
    let prefs = Preferences::load(settings.preferences_path(), defaults);
    let registry = Registry::new(settings.updates_dir(), Notifier::new(), prefs);
    let downloads = DownloadCoordinator::new(
        registry.clone(),
        transport,
        settings.max_concurrent_downloads,
    );
    let installer = Installer::new(registry.clone(), engine);
    let catalog = Catalog::new(
        registry.clone(),
        client,
        settings.catalog_url.clone(),
        settings.data_dir.clone(),
    );

    AppState {
        settings,
        registry,
        downloads,
        installer,
        catalog,
    }
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/updates", get(api::list_updates))
        .route(
            "/api/updates/{id}",
            get(api::get_update).delete(api::delete_update),
        )
        .route("/api/updates/{id}/download", post(api::start_download))
        .route("/api/updates/{id}/pause", post(api::pause_download))
        .route("/api/updates/{id}/resume", post(api::resume_download))
        .route("/api/updates/{id}/install", post(api::install_update))
        .route("/api/updates/{id}/mirror", put(api::set_mirror))
        .route("/api/refresh", post(api::refresh_catalog))
        .route("/api/status", get(api::server_status))
        .route(
            "/api/preferences",
            get(api::get_preferences).put(api::put_preferences),
        )
        .route("/events", get(events_h::sse_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
