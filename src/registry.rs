use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use crate::error::{Result, UpdaterError};
use crate::events::{Notifier, ProgressKind, UpdateEvent};
use crate::installer::InstallSession;
use crate::prefs::Preferences;
use crate::update::{Update, UpdateInfo, UpdateStatus};

/// Everything guarded by the registry lock: the records and the
/// installation session marker.
#[derive(Default)]
pub struct RegistryState {
    records: HashMap<String, Update>,
    session: InstallSession,
    /// Ids whose staging file is being deleted outside the lock.
    removing: HashSet<String>,
    /// Bumped whenever a removal finishes deleting its file.
    removals: u64,
}

/// Locked view of the registry. Mutations publish their event before the
/// lock is released, so subscribers see changes in the order they happened.
pub struct RegistryGuard<'a> {
    state: MutexGuard<'a, RegistryState>,
    notifier: &'a Notifier,
}

impl RegistryGuard<'_> {
    pub fn get(&self, id: &str) -> Result<&Update> {
        self.state
            .records
            .get(id)
            .ok_or_else(|| UpdaterError::NotFound(id.to_string()))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Update> {
        self.state
            .records
            .get_mut(id)
            .ok_or_else(|| UpdaterError::NotFound(id.to_string()))
    }

    pub fn session(&self) -> &InstallSession {
        &self.state.session
    }

    pub fn session_mut(&mut self) -> &mut InstallSession {
        &mut self.state.session
    }

    pub fn transition(&mut self, id: &str, next: UpdateStatus) -> Result<()> {
        let update = self.get_mut(id)?;
        update.transition(next)?;
        let status = update.status();
        debug!("{} -> {}", id, status);
        self.notifier.publish(UpdateEvent::StatusChanged {
            id: id.to_string(),
            status,
        });
        Ok(())
    }

    pub fn begin_download(&mut self, id: &str, offset: u64) -> Result<()> {
        let update = self.get_mut(id)?;
        update.begin_download(offset)?;
        let percent = update.download_progress().percent();
        self.notifier.publish(UpdateEvent::StatusChanged {
            id: id.to_string(),
            status: UpdateStatus::Downloading,
        });
        self.notifier.publish(UpdateEvent::ProgressChanged {
            id: id.to_string(),
            kind: ProgressKind::Download,
            value: percent,
        });
        Ok(())
    }

    pub fn set_download_progress(&mut self, id: &str, downloaded: u64, total: u64) -> Result<bool> {
        let update = self.get_mut(id)?;
        let before = update.download_progress().percent();
        if !update.advance_download(downloaded, total) {
            return Ok(false);
        }
        let after = update.download_progress().percent();
        if after != before {
            self.notifier.publish(UpdateEvent::ProgressChanged {
                id: id.to_string(),
                kind: ProgressKind::Download,
                value: after,
            });
        }
        Ok(true)
    }

    pub fn restart_download(&mut self, id: &str) -> Result<bool> {
        if !self.get_mut(id)?.restart_download() {
            return Ok(false);
        }
        self.notifier.publish(UpdateEvent::ProgressChanged {
            id: id.to_string(),
            kind: ProgressKind::Download,
            value: 0,
        });
        Ok(true)
    }

    pub fn set_install_progress(&mut self, id: &str, percent: u32) -> Result<bool> {
        let update = self.get_mut(id)?;
        if !update.advance_install(percent) {
            return Ok(false);
        }
        let value = update.install_progress();
        self.notifier.publish(UpdateEvent::ProgressChanged {
            id: id.to_string(),
            kind: ProgressKind::Install,
            value,
        });
        Ok(true)
    }

    fn take(&mut self, id: &str) -> Result<Option<Update>> {
        match self.state.records.get(id) {
            None => return Ok(None),
            Some(update) if update.status().is_busy() => {
                return Err(UpdaterError::AlreadyInProgress(id.to_string()));
            }
            Some(_) => {}
        }
        let removed = self.state.records.remove(id);
        self.notifier.publish(UpdateEvent::UpdateRemoved { id: id.to_string() });
        Ok(removed)
    }
}

/// Owner of every update record. Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
    notifier: Notifier,
    prefs: Preferences,
    updates_dir: PathBuf,
}

impl Registry {
    pub fn new(updates_dir: impl Into<PathBuf>, notifier: Notifier, prefs: Preferences) -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState::default())),
            notifier,
            prefs,
            updates_dir: updates_dir.into(),
        }
    }

    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
            notifier: &self.notifier,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn prefs(&self) -> &Preferences {
        &self.prefs
    }

    pub fn staging_path(&self, id: &str) -> PathBuf {
        self.updates_dir.join(format!("{}.zip", id))
    }

    /// Inserts a catalog entry or merges its metadata into the existing
    /// record. Returns true when the update was not known before.
    pub fn add_or_update(&self, info: UpdateInfo) -> Result<bool> {
        if !is_valid_id(&info.id) {
            return Err(UpdaterError::InvalidCatalog(format!(
                "invalid update id {:?}",
                info.id
            )));
        }
        let id = info.id.clone();
        let file = self.staging_path(&id);
        loop {
            let epoch = {
                let mut guard = self.lock();
                if let Some(existing) = guard.state.records.get_mut(&id) {
                    existing.merge_info(info);
                    return Ok(false);
                }
                guard.state.removals
            };

            let on_disk = std::fs::metadata(&file).ok().map(|m| m.len());

            let mut guard = self.lock();
            if guard.state.removing.contains(&id) {
                debug!("Skipping {} while its files are being deleted", id);
                return Ok(false);
            }
            if guard.state.removals != epoch {
                // A removal finished while we looked at the disk.
                continue;
            }
            if let Some(existing) = guard.state.records.get_mut(&id) {
                existing.merge_info(info);
                return Ok(false);
            }

            let mut update = Update::new(info, file);
            update.selected_mirror = self.prefs.mirror(&id);
            if let Some(len) = on_disk {
                // A staging file from an earlier session can be resumed.
                update.begin_download(len)?;
                update.transition(UpdateStatus::Paused)?;
                info!("Found partial download for {} ({} bytes)", id, len);
            }
            guard.state.records.insert(id.clone(), update);
            debug!("Added update {}", id);
            return Ok(true);
        }
    }

    pub fn get(&self, id: &str) -> Result<Update> {
        self.lock().get(id).cloned()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.lock().state.records.contains_key(id)
    }

    /// All updates, newest build first.
    pub fn list(&self) -> Vec<Update> {
        let mut updates: Vec<Update> = self.lock().state.records.values().cloned().collect();
        updates.sort_by(|a, b| {
            b.info
                .timestamp
                .cmp(&a.info.timestamp)
                .then_with(|| a.info.id.cmp(&b.info.id))
        });
        updates
    }

    pub fn set_available_online(&self, ids: &[String], online: bool) {
        let mut guard = self.lock();
        for id in ids {
            if let Some(update) = guard.state.records.get_mut(id) {
                update.available_online = online;
            }
        }
    }

    /// Drops records the catalog no longer lists and that have nothing on disk.
    pub fn prune_unavailable(&self) -> Vec<String> {
        let candidates: Vec<(String, PathBuf, UpdateStatus)> = self
            .lock()
            .state
            .records
            .values()
            .filter(|u| !u.available_online && !u.status().is_busy())
            .map(|u| (u.id().to_string(), u.file.clone(), u.status()))
            .collect();
        let missing: Vec<(String, UpdateStatus)> = candidates
            .into_iter()
            .filter(|(_, file, _)| !file.exists())
            .map(|(id, _, status)| (id, status))
            .collect();

        let mut guard = self.lock();
        let mut pruned = Vec::new();
        for (id, status) in missing {
            // Skip records that came back online or moved on since the scan.
            let unchanged = guard
                .state
                .records
                .get(&id)
                .is_some_and(|u| !u.available_online && u.status() == status);
            if !unchanged {
                continue;
            }
            guard.state.records.remove(&id);
            self.notifier
                .publish(UpdateEvent::UpdateRemoved { id: id.clone() });
            info!("Pruned update {} no longer offered by the catalog", id);
            pruned.push(id);
        }
        pruned
    }

    /// Deletes the record and its staging file. Absent ids are not an error.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let Some(update) = self.begin_remove(id)? else {
            return Ok(false);
        };
        self.finish_remove(&update);
        Ok(true)
    }

    /// Takes the record out and keeps its id reserved until
    /// `finish_remove` has deleted the staging file.
    fn begin_remove(&self, id: &str) -> Result<Option<Update>> {
        let mut guard = self.lock();
        let removed = guard.take(id)?;
        if removed.is_some() {
            guard.state.removing.insert(id.to_string());
        }
        Ok(removed)
    }

    fn finish_remove(&self, update: &Update) {
        match std::fs::remove_file(&update.file) {
            Ok(()) => info!("Deleted {:?}", update.file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete {:?}: {}", update.file, e),
        }
        let mut guard = self.lock();
        guard.state.removing.remove(update.id());
        guard.state.removals += 1;
    }

    pub fn set_status(&self, id: &str, status: UpdateStatus) -> Result<()> {
        self.lock().transition(id, status)
    }

    pub fn set_download_progress(&self, id: &str, downloaded: u64, total: u64) -> Result<bool> {
        self.lock().set_download_progress(id, downloaded, total)
    }

    pub fn set_install_progress(&self, id: &str, percent: u32) -> Result<bool> {
        self.lock().set_install_progress(id, percent)
    }

    pub fn set_selected_mirror(&self, id: &str, mirror: Option<String>) -> Result<()> {
        {
            let mut guard = self.lock();
            guard.get_mut(id)?.selected_mirror = mirror.clone();
        }
        self.prefs.set_mirror(id, mirror)
    }
}

/// Ids name the staging file, so they are kept to a file-name-safe alphabet.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
pub(crate) fn test_registry(dir: &std::path::Path) -> Registry {
    use crate::prefs::PreferencesData;

    let updates_dir = dir.join("updates");
    std::fs::create_dir_all(&updates_dir).unwrap();
    let prefs = Preferences::load(dir.join("preferences.json"), PreferencesData::default());
    Registry::new(updates_dir, Notifier::new(), prefs)
}

/// Waits until `id` reaches a status of the same kind as `status`.
#[cfg(test)]
pub(crate) async fn wait_for_status(
    sub: &mut crate::events::Subscription,
    id: &str,
    status: UpdateStatus,
) {
    let deadline = std::time::Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        while let Some(event) = sub.recv().await {
            if let UpdateEvent::StatusChanged { id: got, status: s } = &event
                && got == id
                && s.same_kind(&status)
            {
                return;
            }
        }
        panic!("event stream closed before {} reached {}", id, status);
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {} to reach {}", id, status));
}

/// Drives a fresh record to `Verified` without a transport.
#[cfg(test)]
pub(crate) fn force_verified(registry: &Registry, id: &str) {
    let mut guard = registry.lock();
    guard.begin_download(id, 0).unwrap();
    guard.transition(id, UpdateStatus::Verifying).unwrap();
    guard.transition(id, UpdateStatus::Verified).unwrap();
}
