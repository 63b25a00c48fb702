use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::downloads::DownloadSession;
use crate::error::UpdaterError;
use crate::prefs::{PreferencesData, PreferencesPatch};
use crate::state::AppState;
use crate::update::Update;

pub struct ApiError(UpdaterError);

impl From<UpdaterError> for ApiError {
    fn from(e: UpdaterError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            UpdaterError::NotFound(_) => StatusCode::NOT_FOUND,
            UpdaterError::AlreadyInProgress(_)
            | UpdaterError::TooManyDownloads(_)
            | UpdaterError::IllegalTransition { .. } => StatusCode::CONFLICT,
            UpdaterError::StaleResource(_)
            | UpdaterError::ChecksumMismatch(_)
            | UpdaterError::MissingPayload(_)
            | UpdaterError::InstallPrepare(_)
            | UpdaterError::InvalidCatalog(_) => StatusCode::UNPROCESSABLE_ENTITY,
            UpdaterError::Network(_) | UpdaterError::EngineReported(_) => StatusCode::BAD_GATEWAY,
            UpdaterError::Io(_) | UpdaterError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct UpdateView {
    pub id: String,
    pub version: String,
    pub timestamp: u64,
    pub url: String,
    pub size: u64,
    pub filename: Option<String>,
    pub status: String,
    pub downloaded: u64,
    pub download_progress: u32,
    pub install_progress: u32,
    pub available_online: bool,
    pub selected_mirror: Option<String>,
}

impl From<Update> for UpdateView {
    fn from(update: Update) -> Self {
        let progress = update.download_progress();
        let status = update.status();
        UpdateView {
            status: status.name().to_string(),
            downloaded: progress.downloaded,
            download_progress: progress.percent(),
            install_progress: status.install_progress(),
            available_online: update.available_online,
            selected_mirror: update.selected_mirror,
            id: update.info.id,
            version: update.info.version,
            timestamp: update.info.timestamp,
            url: update.info.url,
            size: update.info.size,
            filename: update.info.filename,
        }
    }
}

fn view(state: &AppState, id: &str) -> ApiResult<UpdateView> {
    Ok(Json(state.registry.get(id)?.into()))
}

pub async fn list_updates(State(state): State<AppState>) -> Json<Vec<UpdateView>> {
    Json(state.registry.list().into_iter().map(Into::into).collect())
}

pub async fn get_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<UpdateView> {
    view(&state, &id)
}

pub async fn start_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<UpdateView> {
    state.downloads.start_download(&id)?;
    view(&state, &id)
}

pub async fn pause_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let paused = state.downloads.pause(&id)?;
    Ok(Json(serde_json::json!({ "paused": paused })))
}

pub async fn resume_download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<UpdateView> {
    state.downloads.resume(&id).await?;
    view(&state, &id)
}

pub async fn install_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<UpdateView> {
    info!("Installation of {} requested", id);
    state.installer.start(&id).await?;
    view(&state, &id)
}

pub async fn delete_update(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.installer.is_installing_update(&id) {
        return Err(UpdaterError::AlreadyInProgress(id).into());
    }
    state.registry.remove(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MirrorRequest {
    pub mirror: Option<String>,
}

pub async fn set_mirror(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<MirrorRequest>,
) -> ApiResult<UpdateView> {
    let mirror = req.mirror.filter(|m| !m.trim().is_empty());
    state.registry.set_selected_mirror(&id, mirror)?;
    view(&state, &id)
}

pub async fn refresh_catalog(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    info!("Manual update check requested.");
    let new_updates = state.catalog.refresh().await?;
    Ok(Json(serde_json::json!({ "new_updates": new_updates })))
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub installing: bool,
    pub installing_update: Option<String>,
    pub active_downloads: usize,
    pub downloads: Vec<DownloadSession>,
    pub last_update_check: Option<u64>,
    pub subscribers: usize,
}

pub async fn server_status(State(state): State<AppState>) -> Json<StatusView> {
    let downloads = state.downloads.sessions();
    Json(StatusView {
        installing: state.installer.is_installing(),
        installing_update: state.installer.current(),
        active_downloads: downloads.len(),
        downloads,
        last_update_check: state.registry.prefs().snapshot().last_update_check,
        subscribers: state.registry.notifier().subscriber_count(),
    })
}

pub async fn get_preferences(State(state): State<AppState>) -> Json<PreferencesData> {
    Json(state.registry.prefs().snapshot())
}

pub async fn put_preferences(
    State(state): State<AppState>,
    Json(patch): Json<PreferencesPatch>,
) -> ApiResult<PreferencesData> {
    let perf_mode = patch.ab_perf_mode;
    let data = state.registry.prefs().apply(patch)?;
    if let Some(enabled) = perf_mode
        && let Err(e) = state.installer.set_performance_mode(enabled)
    {
        warn!("Could not switch performance mode: {}", e);
    }
    Ok(Json(data))
}

