//! A/B installation driver.
//!
//! Once `start` hands the payload to the update engine the installation can
//! no longer be cancelled from here; the only intervention point is before
//! `start` succeeds. Only one payload may be applied at a time, tracked by
//! the [`InstallSession`] marker kept inside the registry lock.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::{EngineEvent, EngineStatus, PayloadRequest, UpdateEngine};
use crate::error::{Result, UpdaterError};
use crate::payload;
use crate::registry::Registry;
use crate::update::UpdateStatus;

const PATH_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'<')
    .add(b'>')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Which update, if any, the engine is currently applying.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallSession {
    download_id: Option<String>,
}

impl InstallSession {
    pub fn current(&self) -> Option<&str> {
        self.download_id.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.download_id.is_some()
    }

    pub fn is_for(&self, id: &str) -> bool {
        self.download_id.as_deref() == Some(id)
    }

    fn begin(&mut self, id: &str) {
        self.download_id = Some(id.to_string());
    }

    /// Clears the marker if it belongs to `id`.
    fn finish(&mut self, id: &str) -> bool {
        if !self.is_for(id) {
            return false;
        }
        self.download_id = None;
        true
    }
}

#[derive(Clone)]
pub struct Installer {
    registry: Registry,
    engine: Arc<dyn UpdateEngine>,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Installer {
    pub fn new(registry: Registry, engine: Arc<dyn UpdateEngine>) -> Self {
        Self {
            registry,
            engine,
            gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn is_installing(&self) -> bool {
        self.registry.lock().session().is_active()
    }

    pub fn is_installing_update(&self, id: &str) -> bool {
        self.registry.lock().session().is_for(id)
    }

    pub fn current(&self) -> Option<String> {
        self.registry.lock().session().current().map(str::to_string)
    }

    pub fn set_performance_mode(&self, enabled: bool) -> Result<()> {
        self.engine.set_performance_mode(enabled)
    }

    /// Validates the package and hands its payload to the engine.
    pub async fn start(&self, id: &str) -> Result<()> {
        let _gate = self.gate.lock().await;

        let file = {
            let guard = self.registry.lock();
            if let Some(current) = guard.session().current() {
                warn!("Refusing to install {} while {} is installing", id, current);
                return Err(UpdaterError::AlreadyInProgress(current.to_string()));
            }
            let update = guard.get(id)?;
            if !update.status().can_transition_to(&UpdateStatus::INSTALLING) {
                return Err(UpdaterError::IllegalTransition {
                    id: id.to_string(),
                    from: update.status(),
                    to: UpdateStatus::INSTALLING,
                });
            }
            update.file.clone()
        };

        if !tokio::fs::try_exists(&file).await.unwrap_or(false) {
            error!("The update {} has no payload at {:?}", id, file);
            self.fail_preflight(id);
            return Err(UpdaterError::MissingPayload(file));
        }

        let package = file.clone();
        let prepared = tokio::task::spawn_blocking(move || payload::prepare(&package))
            .await
            .unwrap_or_else(|e| Err(UpdaterError::InstallPrepare(e.to_string())));
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                error!("Could not prepare {:?}: {}", file, e);
                self.fail_preflight(id);
                return Err(e);
            }
        };

        {
            let mut guard = self.registry.lock();
            guard.transition(id, UpdateStatus::INSTALLING)?;
            guard.session_mut().begin(id);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.engine.bind(tx);
        let perf_mode = self.registry.prefs().ab_perf_mode();
        if let Err(e) = self.engine.set_performance_mode(perf_mode) {
            warn!("Could not set performance mode: {}", e);
        }

        let request = PayloadRequest {
            uri: file_uri(&file),
            offset: prepared.offset,
            size: 0,
            headers: prepared.headers,
        };
        if let Err(e) = self.engine.apply_payload(&request) {
            error!("Update engine refused {}: {}", id, e);
            self.finish(id, UpdateStatus::InstallationFailed);
            return Err(match e {
                UpdaterError::EngineReported(_) => e,
                other => UpdaterError::EngineReported(other.to_string()),
            });
        }

        info!(
            "Applying payload of {} ({} bytes at offset {})",
            id, prepared.size, prepared.offset
        );
        tokio::spawn(self.clone().follow(id.to_string(), rx));
        Ok(())
    }

    fn fail_preflight(&self, id: &str) {
        if let Err(e) = self
            .registry
            .set_status(id, UpdateStatus::InstallationFailed)
        {
            warn!("Could not mark {} as failed: {}", id, e);
        }
    }

    /// Clears the marker and records the outcome. Returns false if the
    /// session for `id` was already closed.
    fn finish(&self, id: &str, outcome: UpdateStatus) -> bool {
        let mut guard = self.registry.lock();
        if !guard.session_mut().finish(id) {
            return false;
        }
        if let Err(e) = guard.transition(id, outcome) {
            warn!("Could not record {} for {}: {}", outcome, id, e);
        }
        true
    }

    /// Translates engine callbacks for one session into registry changes.
    async fn follow(self, id: String, mut rx: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::StatusUpdate {
                    status: EngineStatus::Downloading | EngineStatus::Finalizing,
                    percent,
                } => {
                    let progress = (percent * 100.0).round().clamp(0.0, 100.0) as u32;
                    if let Err(e) = self.registry.set_install_progress(&id, progress) {
                        warn!("Dropping install progress for {}: {}", id, e);
                    }
                }
                EngineEvent::StatusUpdate {
                    status: EngineStatus::ReportingErrorEvent,
                    ..
                } => {
                    if self.finish(&id, UpdateStatus::InstallationFailed) {
                        error!("Installation of {} failed", id);
                    }
                    return;
                }
                EngineEvent::StatusUpdate {
                    status: EngineStatus::UpdatedNeedReboot,
                    ..
                } => {
                    if self.finish(&id, UpdateStatus::Installed) {
                        info!("Installed {}, reboot required", id);
                        self.cleanup(&id);
                    }
                    return;
                }
                EngineEvent::StatusUpdate { status, percent } => {
                    debug!("Engine status {:?} ({}) for {}", status, percent, id);
                }
                EngineEvent::PayloadApplicationComplete { error_code: 0 } => {
                    debug!("Payload application of {} complete", id);
                }
                EngineEvent::PayloadApplicationComplete { error_code } => {
                    if self.finish(&id, UpdateStatus::InstallationFailed) {
                        error!("Installation of {} failed with code {}", id, error_code);
                    }
                    return;
                }
            }
        }

        if self.finish(&id, UpdateStatus::InstallationFailed) {
            error!("Update engine went away while installing {}", id);
        }
    }

    fn cleanup(&self, id: &str) {
        if !self.registry.prefs().auto_delete_updates() {
            return;
        }
        match self.registry.remove(id) {
            Ok(_) => info!("Deleted installed update {}", id),
            Err(e) => warn!("Could not delete installed update {}: {}", id, e),
        }
    }
}

pub fn file_uri(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    format!(
        "file://{}",
        utf8_percent_encode(&absolute.to_string_lossy(), PATH_SET)
    )
}
