use crate::state::AppState;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info};

pub fn start_background_tasks(state: AppState) {
    // 1. Catalog Task: cached catalog first, then periodic refresh
    let state_catalog = state.clone();
    tokio::spawn(async move {
        match state_catalog.catalog.load_cached().await {
            Ok(count) => info!("Loaded {} updates from the cached catalog", count),
            Err(e) => error!("Failed to load cached catalog: {}", e),
        }

        if state_catalog.settings.catalog_url.is_none() {
            info!("No catalog URL configured, automatic update checks disabled");
            return;
        }

        let secs = state_catalog.settings.catalog_refresh_secs;
        if secs == 0 {
            if let Err(e) = state_catalog.catalog.refresh().await {
                error!("Failed to check for updates: {}", e);
            }
            return;
        }

        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        loop {
            interval.tick().await;
            info!("Starting periodic update check...");
            if let Err(e) = state_catalog.catalog.refresh().await {
                error!("Failed to check for updates: {}", e);
            }
        }
    });

    // 2. Download Speed Calculator Task
    let state_speed = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut last_bytes_map: HashMap<String, u64> = HashMap::new();

        loop {
            interval.tick().await;
            for session in state_speed.downloads.sample_speeds(&mut last_bytes_map) {
                debug!(
                    "{}: {}/{} bytes at {} B/s",
                    session.id, session.downloaded, session.total, session.speed
                );
            }
        }
    });
}
