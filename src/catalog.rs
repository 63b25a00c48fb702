use futures::StreamExt;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{Result, UpdaterError};
use crate::events::UpdateEvent;
use crate::registry::Registry;
use crate::update::UpdateInfo;

pub const CACHE_FILE: &str = "updates.json";

#[derive(Deserialize)]
struct CatalogDocument {
    response: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct CatalogEntry {
    id: String,
    version: String,
    #[serde(deserialize_with = "timestamp")]
    datetime: u64,
    url: String,
    size: u64,
    sha256: String,
    #[serde(default)]
    filename: Option<String>,
}

// Some servers emit the build time as a string.
fn timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

impl From<CatalogEntry> for UpdateInfo {
    fn from(entry: CatalogEntry) -> Self {
        UpdateInfo {
            id: entry.id,
            version: entry.version,
            timestamp: entry.datetime,
            url: entry.url,
            size: entry.size,
            sha256: entry.sha256.to_ascii_lowercase(),
            filename: entry.filename,
        }
    }
}

/// Parses a catalog document. Entries that do not deserialize are skipped.
pub fn parse(text: &str) -> Result<Vec<UpdateInfo>> {
    let document: CatalogDocument =
        serde_json::from_str(text).map_err(|e| UpdaterError::InvalidCatalog(e.to_string()))?;

    let mut updates = Vec::with_capacity(document.response.len());
    for (index, value) in document.response.into_iter().enumerate() {
        match serde_json::from_value::<CatalogEntry>(value) {
            Ok(entry) => updates.push(entry.into()),
            Err(e) => warn!("Skipping catalog entry {}: {}", index, e),
        }
    }
    Ok(updates)
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Keeps the registry in line with the remote catalog and its local cache.
#[derive(Clone)]
pub struct Catalog {
    registry: Registry,
    client: reqwest::Client,
    url: Option<String>,
    data_dir: PathBuf,
}

impl Catalog {
    pub fn new(
        registry: Registry,
        client: reqwest::Client,
        url: Option<String>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            client,
            url,
            data_dir: data_dir.into(),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE)
    }

    /// Loads the catalog saved by the last successful refresh, if any.
    pub async fn load_cached(&self) -> Result<usize> {
        let path = self.cache_path();
        if !path.exists() {
            debug!("No cached catalog at {:?}", path);
            return Ok(0);
        }
        info!("Loading cached catalog from {:?}", path);
        let content = tokio::fs::read_to_string(&path).await?;
        let updates = parse(&content)?;
        Ok(self.apply(updates))
    }

    /// Merges catalog entries into the registry and returns how many were new.
    pub fn apply(&self, updates: Vec<UpdateInfo>) -> usize {
        let mut new_updates = 0;
        let mut listed = Vec::with_capacity(updates.len());
        for info in updates {
            let id = info.id.clone();
            match self.registry.add_or_update(info) {
                Ok(true) => {
                    new_updates += 1;
                    listed.push(id);
                }
                Ok(false) => listed.push(id),
                Err(e) => warn!("Ignoring catalog entry {}: {}", id, e),
            }
        }

        let online: HashSet<&String> = listed.iter().collect();
        let offline: Vec<String> = self
            .registry
            .list()
            .into_iter()
            .map(|u| u.info.id)
            .filter(|id| !online.contains(id))
            .collect();
        self.registry.set_available_online(&listed, true);
        self.registry.set_available_online(&offline, false);
        self.registry.prune_unavailable();
        new_updates
    }

    /// Fetches the remote catalog, applies it and replaces the cache.
    pub async fn refresh(&self) -> Result<usize> {
        let url = self
            .url
            .as_deref()
            .ok_or_else(|| UpdaterError::InvalidCatalog("no catalog url configured".to_string()))?;
        info!("Checking for updates at {}", url);

        let temp = self
            .data_dir
            .join(format!("{}.json.tmp", uuid::Uuid::new_v4()));
        let result = self.fetch_to(url, &temp).await;
        let updates = match result {
            Ok(()) => {
                let content = tokio::fs::read_to_string(&temp).await;
                content.map_err(UpdaterError::from).and_then(|c| parse(&c))
            }
            Err(e) => Err(e),
        };
        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Catalog refresh failed: {}", e);
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };

        let new_updates = self.apply(updates);
        if let Err(e) = self.registry.prefs().set_last_update_check(now()) {
            warn!("Could not record update check time: {}", e);
        }
        tokio::fs::rename(&temp, self.cache_path()).await?;

        info!("Catalog refreshed, {} new updates", new_updates);
        self.registry
            .notifier()
            .publish(UpdateEvent::CatalogRefreshed { new_updates });
        Ok(new_updates)
    }

    async fn fetch_to(&self, url: &str, dest: &Path) -> Result<()> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(UpdaterError::Network(format!(
                "catalog request returned {}",
                resp.status()
            )));
        }
        let mut file = File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            file.write_all(&item?).await?;
        }
        file.flush().await?;
        Ok(())
    }
}
