use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Result, UpdaterError};
use crate::registry::Registry;
use crate::transport::{FetchRequest, Transport, TransportEvent, TransportSink, mirror_url};
use crate::update::UpdateStatus;

#[derive(Clone, Debug, Serialize)]
pub struct DownloadSession {
    pub id: String,
    pub downloaded: u64,
    pub total: u64,
    pub speed: u64, // bytes per second
    #[serde(skip)]
    offset: u64,
    #[serde(skip)]
    cancel: CancellationToken,
}

type Sessions = Arc<Mutex<HashMap<String, DownloadSession>>>;

/// Runs transport sessions and feeds their callbacks into the registry.
///
/// Lock order is sessions, then registry.
#[derive(Clone)]
pub struct DownloadCoordinator {
    registry: Registry,
    transport: Arc<dyn Transport>,
    sessions: Sessions,
    max_concurrent: usize,
}

impl DownloadCoordinator {
    pub fn new(registry: Registry, transport: Arc<dyn Transport>, max_concurrent: usize) -> Self {
        Self {
            registry,
            transport,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent,
        }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, DownloadSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_downloading(&self, id: &str) -> bool {
        self.lock_sessions().contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn sessions(&self) -> Vec<DownloadSession> {
        let mut sessions: Vec<DownloadSession> = self.lock_sessions().values().cloned().collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Fetches the package from scratch, discarding any previous staging file.
    pub fn start_download(&self, id: &str) -> Result<()> {
        self.launch(id, 0)
    }

    fn launch(&self, id: &str, offset: u64) -> Result<()> {
        let mut sessions = self.lock_sessions();
        if sessions.contains_key(id) {
            return Err(UpdaterError::AlreadyInProgress(id.to_string()));
        }
        if self.max_concurrent > 0 && sessions.len() >= self.max_concurrent {
            warn!("Not starting {}: {} downloads active", id, sessions.len());
            return Err(UpdaterError::TooManyDownloads(self.max_concurrent));
        }

        let (request, total) = {
            let mut guard = self.registry.lock();
            let update = guard.get(id)?;
            let request = FetchRequest {
                id: id.to_string(),
                url: update.info.url.clone(),
                destination: update.file.clone(),
                offset,
                mirror: update.selected_mirror.clone(),
            };
            let total = update.info.size;
            guard.begin_download(id, offset)?;
            (request, total)
        };

        if offset == 0
            && let Err(e) = std::fs::File::create(&request.destination)
        {
            error!("Could not create {:?}: {}", request.destination, e);
            if let Err(e) = self.registry.set_status(id, UpdateStatus::PausedError) {
                warn!("Could not mark {} as failed: {}", id, e);
            }
            return Err(e.into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        sessions.insert(
            id.to_string(),
            DownloadSession {
                id: id.to_string(),
                downloaded: offset,
                total,
                speed: 0,
                offset,
                cancel: cancel.clone(),
            },
        );
        drop(sessions);

        info!(
            "Downloading {} from {} (offset {})",
            id,
            mirror_url(&request.url, request.mirror.as_deref()),
            offset
        );
        tokio::spawn(self.transport.fetch(request, TransportSink::new(tx, cancel)));
        tokio::spawn(self.clone().follow(id.to_string(), offset, rx));
        Ok(())
    }

    /// Asks the active session to stop. The record becomes `Paused` once the
    /// transport acknowledges. Returns false if nothing was downloading.
    pub fn pause(&self, id: &str) -> Result<bool> {
        if let Some(session) = self.lock_sessions().get(id) {
            info!("Pausing download of {}", id);
            session.cancel.cancel();
            return Ok(true);
        }
        self.registry.get(id)?;
        Ok(false)
    }

    /// Continues a paused download after checking the partial file still
    /// matches what the server offers.
    pub async fn resume(&self, id: &str) -> Result<()> {
        if self.is_downloading(id) {
            return Err(UpdaterError::AlreadyInProgress(id.to_string()));
        }
        let update = self.registry.get(id)?;
        if !matches!(
            update.status(),
            UpdateStatus::Paused | UpdateStatus::PausedError
        ) {
            return Err(UpdaterError::IllegalTransition {
                id: id.to_string(),
                from: update.status(),
                to: UpdateStatus::Downloading,
            });
        }

        let expected = update.info.size;
        let partial = tokio::fs::metadata(&update.file)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        // A complete package is settled by its checksum, no server needed.
        if partial > 0 && partial == expected {
            info!("Partial download of {} is complete, verifying", id);
            self.registry.set_status(id, UpdateStatus::Verifying)?;
            self.verify(id, update.file).await;
            return Ok(());
        }

        let url = mirror_url(&update.info.url, update.selected_mirror.as_deref());
        let remote = self.transport.probe(url).await?;

        if let Some(length) = remote.length
            && length != expected
        {
            warn!(
                "Remote package for {} is {} bytes, expected {}; discarding partial download",
                id, length, expected
            );
            remove_staging(&update.file).await;
            self.registry.set_status(id, UpdateStatus::PausedError)?;
            return Err(UpdaterError::StaleResource(id.to_string()));
        }

        let offset = if remote.length.is_some() && remote.accepts_ranges && partial < expected {
            partial
        } else {
            debug!("Restarting {} from zero", id);
            0
        };
        self.launch(id, offset)
    }

    async fn follow(self, id: String, offset: u64, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                TransportEvent::Response {
                    status,
                    url,
                    headers,
                } => self.on_response(&id, offset, status, &url, &headers),
                TransportEvent::Progress { downloaded, total } => {
                    self.on_progress(&id, downloaded, total)
                }
                TransportEvent::Success { file } => {
                    self.on_complete(&id, file).await;
                    return;
                }
                TransportEvent::Failure { cancelled, reason } => {
                    self.on_failure(&id, cancelled, reason);
                    return;
                }
            }
        }
        self.on_failure(&id, false, Some("transport ended without a result".to_string()));
    }

    fn on_response(&self, id: &str, offset: u64, status: u16, url: &str, headers: &[(String, String)]) {
        debug!("{} responded {} for {} ({} headers)", url, status, id, headers.len());
        if offset > 0 && status == 200 {
            warn!("Server ignored the range request for {}, restarting", id);
            if let Some(session) = self.lock_sessions().get_mut(id) {
                session.downloaded = 0;
            }
            if let Err(e) = self.registry.lock().restart_download(id) {
                warn!("Could not reset progress of {}: {}", id, e);
            }
        }
    }

    fn on_progress(&self, id: &str, downloaded: u64, total: u64) {
        if let Some(session) = self.lock_sessions().get_mut(id)
            && downloaded >= session.downloaded
        {
            session.downloaded = downloaded;
            if total > 0 {
                session.total = total;
            }
        }
        if let Err(e) = self.registry.set_download_progress(id, downloaded, total) {
            debug!("Dropping progress for {}: {}", id, e);
        }
    }

    async fn on_complete(&self, id: &str, file: PathBuf) {
        self.lock_sessions().remove(id);
        if let Err(e) = self.registry.set_status(id, UpdateStatus::Verifying) {
            warn!("Could not verify {}: {}", id, e);
            return;
        }
        self.verify(id, file).await;
    }

    /// Checks size and digest of a record that is `Verifying`.
    async fn verify(&self, id: &str, file: PathBuf) {
        let info = match self.registry.get(id) {
            Ok(update) => update.info,
            Err(e) => {
                warn!("Update {} vanished before verification: {}", id, e);
                return;
            }
        };
        let path = file.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            verify_file(&path, &info.id, info.size, &info.sha256)
        })
        .await
        .unwrap_or_else(|e| Err(UpdaterError::Io(std::io::Error::other(e))));

        let status = match outcome {
            Ok(()) => {
                info!("Verified {}", id);
                UpdateStatus::Verified
            }
            Err(e) => {
                error!("Verification of {} failed: {}", id, e);
                remove_staging(&file).await;
                UpdateStatus::VerificationFailed
            }
        };
        if let Err(e) = self.registry.set_status(id, status) {
            warn!("Could not record {} for {}: {}", status, id, e);
        }
    }

    fn on_failure(&self, id: &str, cancelled: bool, reason: Option<String>) {
        self.lock_sessions().remove(id);
        let status = if cancelled {
            info!("Download of {} paused", id);
            UpdateStatus::Paused
        } else {
            warn!(
                "Download of {} failed: {}",
                id,
                reason.as_deref().unwrap_or("unknown error")
            );
            UpdateStatus::PausedError
        };
        if let Err(e) = self.registry.set_status(id, status) {
            warn!("Could not record {} for {}: {}", status, id, e);
        }
    }

    /// Recomputes per-session speeds from the byte counts seen at the previous tick.
    pub fn sample_speeds(&self, last_bytes: &mut HashMap<String, u64>) -> Vec<DownloadSession> {
        let mut sessions = self.lock_sessions();
        for (id, session) in sessions.iter_mut() {
            let last = last_bytes.get(id).copied().unwrap_or(session.offset);
            let current = session.downloaded;

            if current >= last {
                session.speed = current - last;
            }

            last_bytes.insert(id.clone(), current);
        }

        // Forget finished sessions
        last_bytes.retain(|k, _| sessions.contains_key(k));

        let mut snapshot: Vec<DownloadSession> = sessions.values().cloned().collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }
}

fn verify_file(path: &Path, id: &str, expected_size: u64, expected_sha256: &str) -> Result<()> {
    let mut file = std::fs::File::open(path)?;
    let size = file.metadata()?.len();
    if size != expected_size {
        return Err(UpdaterError::ChecksumMismatch(format!(
            "{}: {} bytes, expected {}",
            id, size, expected_size
        )));
    }
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    let digest = format!("{:x}", hasher.finalize());
    if !digest.eq_ignore_ascii_case(expected_sha256) {
        return Err(UpdaterError::ChecksumMismatch(id.to_string()));
    }
    Ok(())
}

async fn remove_staging(file: &Path) {
    match tokio::fs::remove_file(file).await {
        Ok(()) => debug!("Deleted {:?}", file),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Could not delete {:?}: {}", file, e),
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeTransport, Script};
    use super::*;
    use crate::events::{EventFilter, ProgressKind, Subscription, UpdateEvent};
    use crate::registry::{test_registry, wait_for_status};
    use crate::transport::RemoteResource;
    use crate::update::{UpdateInfo, sample_info};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        _tmp: TempDir,
        registry: Registry,
        transport: Arc<FakeTransport>,
        downloads: DownloadCoordinator,
        events: Subscription,
    }

    fn fixture(max_concurrent: usize) -> Fixture {
        let tmp = tempdir().unwrap();
        let registry = test_registry(tmp.path());
        let transport = Arc::new(FakeTransport::default());
        let downloads = DownloadCoordinator::new(registry.clone(), transport.clone(), max_concurrent);
        let events = registry.notifier().subscribe(EventFilter::All);
        Fixture {
            _tmp: tmp,
            registry,
            transport,
            downloads,
            events,
        }
    }

    fn payload() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 251) as u8).collect()
    }

    fn info_for(id: &str, body: &[u8]) -> UpdateInfo {
        UpdateInfo {
            size: body.len() as u64,
            sha256: format!("{:x}", Sha256::digest(body)),
            ..sample_info(id, 1)
        }
    }

    fn status(fx: &Fixture, id: &str) -> UpdateStatus {
        fx.registry.get(id).unwrap().status()
    }

    async fn wait_for_download_progress(sub: &mut Subscription, id: &str, value: u32) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Some(event) = sub.recv().await {
                if let UpdateEvent::ProgressChanged {
                    id: got,
                    kind: ProgressKind::Download,
                    value: v,
                } = &event
                    && got == id
                    && *v >= value
                {
                    return;
                }
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_download_completes_and_verifies() {
        let mut fx = fixture(0);
        let body = payload();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.push(Script::Complete(body.clone()));

        fx.downloads.start_download("abc123").unwrap();
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::Verifying).await;
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::Verified).await;

        let update = fx.registry.get("abc123").unwrap();
        assert_eq!(update.download_progress().percent(), 100);
        assert_eq!(std::fs::read(&update.file).unwrap(), body);
        assert!(!fx.downloads.is_downloading("abc123"));
        assert_eq!(fx.downloads.active_count(), 0);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_file() {
        let mut fx = fixture(0);
        let body = payload();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        let mut corrupt = body.clone();
        corrupt[500] ^= 0xff;
        fx.transport.push(Script::Complete(corrupt));

        fx.downloads.start_download("abc123").unwrap();
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::VerificationFailed).await;

        let update = fx.registry.get("abc123").unwrap();
        assert!(!update.file.exists());
        assert_eq!(update.download_progress().downloaded, 0);
    }

    #[test]
    fn test_verify_file_checks_size() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("abc123.zip");
        let body = payload();
        std::fs::write(&path, &body).unwrap();
        let sha = format!("{:x}", Sha256::digest(&body));

        assert!(verify_file(&path, "abc123", 1000, &sha).is_ok());
        assert!(verify_file(&path, "abc123", 1000, &sha.to_uppercase()).is_ok());
        assert!(matches!(
            verify_file(&path, "abc123", 999, &sha),
            Err(UpdaterError::ChecksumMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_network_failure_keeps_partial() {
        let mut fx = fixture(0);
        let body = payload();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.push(Script::PartialThenFail(body));

        fx.downloads.start_download("abc123").unwrap();
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::PausedError).await;

        let update = fx.registry.get("abc123").unwrap();
        assert_eq!(std::fs::metadata(&update.file).unwrap().len(), 500);
        assert_eq!(update.download_progress().downloaded, 500);
        assert!(!fx.downloads.is_downloading("abc123"));
    }

    #[tokio::test]
    async fn test_start_truncates_previous_file() {
        let mut fx = fixture(0);
        let body = payload();
        std::fs::write(fx.registry.staging_path("abc123"), vec![9u8; 300]).unwrap();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.push(Script::Complete(body.clone()));

        fx.downloads.start_download("abc123").unwrap();
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::Verified).await;
        assert_eq!(fx.transport.requests()[0].offset, 0);
        assert_eq!(std::fs::read(fx.registry.staging_path("abc123")).unwrap(), body);
    }

    #[tokio::test]
    async fn test_pause_then_resume_appends() {
        let mut fx = fixture(0);
        let body = payload();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.push(Script::WaitForCancel(body.clone()));

        fx.downloads.start_download("abc123").unwrap();
        assert!(fx.downloads.is_downloading("abc123"));
        wait_for_download_progress(&mut fx.events, "abc123", 50).await;
        assert!(fx.downloads.pause("abc123").unwrap());
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::Paused).await;
        assert_eq!(fx.registry.get("abc123").unwrap().download_progress().downloaded, 500);

        fx.transport.set_remote(Some(RemoteResource {
            length: Some(1000),
            accepts_ranges: true,
        }));
        fx.transport.push(Script::Complete(body.clone()));
        fx.downloads.resume("abc123").await.unwrap();
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::Verified).await;

        let requests = fx.transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].offset, 500);
        assert_eq!(std::fs::read(fx.registry.staging_path("abc123")).unwrap(), body);
    }

    #[tokio::test]
    async fn test_resume_without_ranges_restarts() {
        let mut fx = fixture(0);
        let body = payload();
        std::fs::write(fx.registry.staging_path("abc123"), &body[..400]).unwrap();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.set_remote(Some(RemoteResource {
            length: Some(1000),
            accepts_ranges: false,
        }));
        fx.transport.push(Script::Complete(body.clone()));

        fx.downloads.resume("abc123").await.unwrap();
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::Verified).await;
        assert_eq!(fx.transport.requests()[0].offset, 0);
        assert_eq!(std::fs::read(fx.registry.staging_path("abc123")).unwrap(), body);
    }

    #[tokio::test]
    async fn test_resume_when_server_ignores_range() {
        let mut fx = fixture(0);
        let body = payload();
        std::fs::write(fx.registry.staging_path("abc123"), &body[..400]).unwrap();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.set_remote(Some(RemoteResource {
            length: Some(1000),
            accepts_ranges: true,
        }));
        fx.transport.push(Script::IgnoreRange(body.clone()));

        fx.downloads.resume("abc123").await.unwrap();
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::Verified).await;
        assert_eq!(fx.transport.requests()[0].offset, 400);
        let update = fx.registry.get("abc123").unwrap();
        assert_eq!(update.download_progress().downloaded, 1000);
        assert_eq!(std::fs::read(&update.file).unwrap(), body);
    }

    #[tokio::test]
    async fn test_resume_detects_changed_resource() {
        let fx = fixture(0);
        let body = payload();
        std::fs::write(fx.registry.staging_path("abc123"), &body[..400]).unwrap();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.set_remote(Some(RemoteResource {
            length: Some(2048),
            accepts_ranges: true,
        }));

        let err = fx.downloads.resume("abc123").await.unwrap_err();
        assert!(matches!(err, UpdaterError::StaleResource(_)));
        let update = fx.registry.get("abc123").unwrap();
        assert_eq!(update.status(), UpdateStatus::PausedError);
        assert_eq!(update.download_progress().downloaded, 0);
        assert!(!update.file.exists());
        assert!(fx.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_resume_complete_partial_goes_to_verification() {
        let fx = fixture(0);
        let body = payload();
        std::fs::write(fx.registry.staging_path("abc123"), &body).unwrap();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.set_remote(Some(RemoteResource {
            length: Some(1000),
            accepts_ranges: true,
        }));

        fx.downloads.resume("abc123").await.unwrap();
        assert_eq!(status(&fx, "abc123"), UpdateStatus::Verified);
        assert!(fx.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_resume_complete_package_while_offline() {
        let fx = fixture(0);
        let body = payload();
        std::fs::write(fx.registry.staging_path("abc123"), &body).unwrap();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.set_remote(None);

        fx.downloads.resume("abc123").await.unwrap();
        assert_eq!(status(&fx, "abc123"), UpdateStatus::Verified);
        assert!(fx.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_resume_probe_failure_leaves_record() {
        let fx = fixture(0);
        let body = payload();
        std::fs::write(fx.registry.staging_path("abc123"), &body[..400]).unwrap();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();

        let err = fx.downloads.resume("abc123").await.unwrap_err();
        assert!(matches!(err, UpdaterError::Network(_)));
        let update = fx.registry.get("abc123").unwrap();
        assert_eq!(update.status(), UpdateStatus::Paused);
        assert_eq!(update.download_progress().downloaded, 400);
    }

    #[tokio::test]
    async fn test_resume_requires_paused_record() {
        let fx = fixture(0);
        fx.registry.add_or_update(sample_info("abc123", 1)).unwrap();
        assert!(matches!(
            fx.downloads.resume("abc123").await,
            Err(UpdaterError::IllegalTransition { .. })
        ));
        assert!(matches!(
            fx.downloads.resume("nope").await,
            Err(UpdaterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_start_is_refused() {
        let fx = fixture(0);
        let body = payload();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.push(Script::WaitForCancel(body));

        fx.downloads.start_download("abc123").unwrap();
        assert!(matches!(
            fx.downloads.start_download("abc123"),
            Err(UpdaterError::AlreadyInProgress(_))
        ));
        assert_eq!(fx.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_serial_policy_refuses_second_download() {
        let fx = fixture(1);
        let body = payload();
        for id in ["abc123", "xyz789"] {
            fx.registry.add_or_update(info_for(id, &body)).unwrap();
            fx.transport.push(Script::WaitForCancel(body.clone()));
        }

        fx.downloads.start_download("abc123").unwrap();
        assert!(matches!(
            fx.downloads.start_download("xyz789"),
            Err(UpdaterError::TooManyDownloads(1))
        ));
        assert_eq!(status(&fx, "xyz789"), UpdateStatus::Unknown);
        assert_eq!(fx.downloads.active_count(), 1);
    }

    #[tokio::test]
    async fn test_unlimited_policy_runs_both() {
        let fx = fixture(0);
        let body = payload();
        for id in ["abc123", "xyz789"] {
            fx.registry.add_or_update(info_for(id, &body)).unwrap();
            fx.transport.push(Script::WaitForCancel(body.clone()));
        }

        fx.downloads.start_download("abc123").unwrap();
        fx.downloads.start_download("xyz789").unwrap();
        assert_eq!(fx.downloads.active_count(), 2);
        let ids: Vec<String> = fx.downloads.sessions().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec!["abc123", "xyz789"]);
    }

    #[tokio::test]
    async fn test_pause_idle_and_unknown() {
        let fx = fixture(0);
        fx.registry.add_or_update(sample_info("abc123", 1)).unwrap();
        assert!(!fx.downloads.pause("abc123").unwrap());
        assert!(matches!(
            fx.downloads.pause("nope"),
            Err(UpdaterError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_without_route_fails() {
        let mut fx = fixture(0);
        fx.registry.add_or_update(sample_info("abc123", 1)).unwrap();

        fx.downloads.start_download("abc123").unwrap();
        wait_for_status(&mut fx.events, "abc123", UpdateStatus::PausedError).await;
        assert_eq!(fx.downloads.active_count(), 0);
    }

    #[tokio::test]
    async fn test_sample_speeds() {
        let fx = fixture(0);
        let body = payload();
        fx.registry.add_or_update(info_for("abc123", &body)).unwrap();
        fx.transport.push(Script::WaitForCancel(body));
        fx.downloads.start_download("abc123").unwrap();

        let mut last = HashMap::new();
        fx.downloads.on_progress("abc123", 300, 1000);
        let sessions = fx.downloads.sample_speeds(&mut last);
        assert_eq!(sessions[0].speed, 300);
        fx.downloads.on_progress("abc123", 700, 1000);
        let sessions = fx.downloads.sample_speeds(&mut last);
        assert_eq!(sessions[0].speed, 400);
        assert_eq!(last.get("abc123"), Some(&700));
    }
}
