use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferencesData {
    #[serde(default)]
    pub auto_delete_updates: bool,
    #[serde(default)]
    pub ab_perf_mode: bool,
    #[serde(default)]
    pub mirrors: BTreeMap<String, String>,
    #[serde(default)]
    pub last_update_check: Option<u64>,
}

/// Partial update of the user-facing flags.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct PreferencesPatch {
    pub auto_delete_updates: Option<bool>,
    pub ab_perf_mode: Option<bool>,
}

/// User preferences persisted as JSON next to the staged updates.
#[derive(Clone)]
pub struct Preferences {
    path: PathBuf,
    data: Arc<Mutex<PreferencesData>>,
}

impl Preferences {
    /// Loads `path`, falling back to `defaults` when the file is absent or unreadable.
    pub fn load(path: impl Into<PathBuf>, defaults: PreferencesData) -> Self {
        let path = path.into();
        let data = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(data) => {
                    info!("Loaded preferences from {:?}", path);
                    data
                }
                Err(e) => {
                    warn!("Ignoring malformed preferences {:?}: {}", path, e);
                    defaults
                }
            },
            Err(_) => defaults,
        };
        Self {
            path,
            data: Arc::new(Mutex::new(data)),
        }
    }

    pub fn snapshot(&self) -> PreferencesData {
        self.lock().clone()
    }

    pub fn auto_delete_updates(&self) -> bool {
        self.lock().auto_delete_updates
    }

    pub fn ab_perf_mode(&self) -> bool {
        self.lock().ab_perf_mode
    }

    pub fn mirror(&self, id: &str) -> Option<String> {
        self.lock().mirrors.get(id).cloned()
    }

    pub fn set_mirror(&self, id: &str, mirror: Option<String>) -> Result<()> {
        let mut data = self.lock();
        match mirror {
            Some(name) => data.mirrors.insert(id.to_string(), name),
            None => data.mirrors.remove(id),
        };
        write_atomic(&self.path, &data)
    }

    pub fn set_last_update_check(&self, timestamp: u64) -> Result<()> {
        let mut data = self.lock();
        data.last_update_check = Some(timestamp);
        write_atomic(&self.path, &data)
    }

    pub fn apply(&self, patch: PreferencesPatch) -> Result<PreferencesData> {
        let mut data = self.lock();
        if let Some(v) = patch.auto_delete_updates {
            data.auto_delete_updates = v;
        }
        if let Some(v) = patch.ab_perf_mode {
            data.ab_perf_mode = v;
        }
        write_atomic(&self.path, &data)?;
        Ok(data.clone())
    }

    fn lock(&self) -> MutexGuard<'_, PreferencesData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_atomic(path: &Path, data: &PreferencesData) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
