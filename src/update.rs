use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;

use crate::error::{Result, UpdaterError};

/// Catalog metadata of an update package.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub id: String,
    pub version: String,
    pub timestamp: u64,
    pub url: String,
    pub size: u64,
    pub sha256: String,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Lifecycle state of an update.
///
/// The install percentage only exists while the engine is applying the
/// payload, so it lives inside `Installing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UpdateStatus {
    #[default]
    Unknown,
    Downloading,
    Paused,
    PausedError,
    Verifying,
    VerificationFailed,
    Verified,
    Installing {
        progress: u32,
    },
    InstallationFailed,
    Installed,
}

impl UpdateStatus {
    pub const INSTALLING: UpdateStatus = UpdateStatus::Installing { progress: 0 };

    pub fn name(&self) -> &'static str {
        match self {
            UpdateStatus::Unknown => "UNKNOWN",
            UpdateStatus::Downloading => "DOWNLOADING",
            UpdateStatus::Paused => "PAUSED",
            UpdateStatus::PausedError => "PAUSED_ERROR",
            UpdateStatus::Verifying => "VERIFYING",
            UpdateStatus::VerificationFailed => "VERIFICATION_FAILED",
            UpdateStatus::Verified => "VERIFIED",
            UpdateStatus::Installing { .. } => "INSTALLING",
            UpdateStatus::InstallationFailed => "INSTALLATION_FAILED",
            UpdateStatus::Installed => "INSTALLED",
        }
    }

    /// Same state regardless of the install percentage.
    pub fn same_kind(&self, other: &UpdateStatus) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// States where a task outside the registry is working on the staging file.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            UpdateStatus::Downloading | UpdateStatus::Verifying | UpdateStatus::Installing { .. }
        )
    }

    pub fn install_progress(&self) -> u32 {
        match self {
            UpdateStatus::Installing { progress } => *progress,
            _ => 0,
        }
    }

    pub fn can_transition_to(&self, next: &UpdateStatus) -> bool {
        use UpdateStatus::*;
        match (self, next) {
            (Installing { .. } | Installed | Downloading | Verifying, Downloading) => false,
            (_, Downloading) => true,
            (Downloading, Paused | PausedError | Verifying) => true,
            (Paused | PausedError, Verifying | PausedError) => true,
            (Verifying, Verified | VerificationFailed) => true,
            (Verified, Installing { .. } | InstallationFailed) => true,
            (Installing { .. }, Installed | InstallationFailed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for UpdateStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DownloadProgress {
    pub downloaded: u64,
    pub total: u64,
}

impl DownloadProgress {
    pub fn percent(&self) -> u32 {
        if self.total == 0 {
            return 0;
        }
        (self.downloaded.min(self.total) * 100 / self.total) as u32
    }
}

/// An update as tracked by the registry: catalog metadata plus runtime state.
#[derive(Clone, Debug)]
pub struct Update {
    pub info: UpdateInfo,
    pub file: PathBuf,
    pub available_online: bool,
    pub selected_mirror: Option<String>,
    status: UpdateStatus,
    download_progress: DownloadProgress,
}

impl Update {
    pub fn new(info: UpdateInfo, file: PathBuf) -> Self {
        Self {
            download_progress: DownloadProgress {
                downloaded: 0,
                total: info.size,
            },
            info,
            file,
            available_online: false,
            selected_mirror: None,
            status: UpdateStatus::Unknown,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn download_progress(&self) -> DownloadProgress {
        self.download_progress
    }

    pub fn install_progress(&self) -> u32 {
        self.status.install_progress()
    }

    /// Applies a status change. All field resets tied to a status live here.
    pub fn transition(&mut self, next: UpdateStatus) -> Result<()> {
        if !self.status.can_transition_to(&next) {
            return Err(UpdaterError::IllegalTransition {
                id: self.info.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = match next {
            UpdateStatus::Installing { .. } => UpdateStatus::INSTALLING,
            UpdateStatus::VerificationFailed => {
                self.download_progress.downloaded = 0;
                next
            }
            // Only reachable when a resume finds the partial file unusable.
            UpdateStatus::PausedError if self.status != UpdateStatus::Downloading => {
                self.download_progress.downloaded = 0;
                next
            }
            other => other,
        };
        Ok(())
    }

    /// Enters `Downloading` with the session starting at `offset` bytes.
    pub fn begin_download(&mut self, offset: u64) -> Result<()> {
        self.transition(UpdateStatus::Downloading)?;
        self.download_progress = DownloadProgress {
            downloaded: offset,
            total: self.info.size,
        };
        Ok(())
    }

    /// The server ignored a range request and is resending from byte 0.
    pub fn restart_download(&mut self) -> bool {
        if self.status != UpdateStatus::Downloading {
            return false;
        }
        self.download_progress.downloaded = 0;
        true
    }

    /// Returns false when the value would move progress backwards.
    pub fn advance_download(&mut self, downloaded: u64, total: u64) -> bool {
        if downloaded < self.download_progress.downloaded {
            return false;
        }
        self.download_progress.downloaded = downloaded;
        if total > 0 {
            self.download_progress.total = total;
        }
        true
    }

    /// Returns false outside `Installing` or when the value does not move
    /// progress forward.
    pub fn advance_install(&mut self, percent: u32) -> bool {
        let percent = percent.min(100);
        match &mut self.status {
            UpdateStatus::Installing { progress } if percent > *progress => {
                *progress = percent;
                true
            }
            _ => false,
        }
    }

    /// Replaces catalog metadata, leaving runtime state alone.
    pub fn merge_info(&mut self, info: UpdateInfo) {
        if self.download_progress.downloaded == 0 {
            self.download_progress.total = info.size;
        }
        self.info = info;
    }
}

#[cfg(test)]
pub(crate) fn sample_info(id: &str, timestamp: u64) -> UpdateInfo {
    UpdateInfo {
        id: id.to_string(),
        version: "14.0".to_string(),
        timestamp,
        url: format!("https://updates.example.com/{}.zip", id),
        size: 1000,
        sha256: "0".repeat(64),
        filename: Some(format!("{}.zip", id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(status: UpdateStatus) -> Update {
        let mut u = Update::new(sample_info("abc123", 1), PathBuf::from("/tmp/abc123.zip"));
        u.status = status;
        u
    }

    #[test]
    fn test_download_lifecycle_edges() {
        let mut u = update(UpdateStatus::Unknown);
        u.begin_download(0).unwrap();
        u.transition(UpdateStatus::Verifying).unwrap();
        u.transition(UpdateStatus::Verified).unwrap();
        u.transition(UpdateStatus::INSTALLING).unwrap();
        u.transition(UpdateStatus::Installed).unwrap();
        assert_eq!(u.status(), UpdateStatus::Installed);
    }

    #[test]
    fn test_installed_is_terminal() {
        let mut u = update(UpdateStatus::Installed);
        for next in [
            UpdateStatus::Downloading,
            UpdateStatus::INSTALLING,
            UpdateStatus::InstallationFailed,
            UpdateStatus::Paused,
        ] {
            assert!(matches!(
                u.transition(next),
                Err(UpdaterError::IllegalTransition { .. })
            ));
        }
    }

    #[test]
    fn test_install_requires_verified() {
        for from in [
            UpdateStatus::Unknown,
            UpdateStatus::Paused,
            UpdateStatus::VerificationFailed,
            UpdateStatus::InstallationFailed,
        ] {
            let mut u = update(from);
            assert!(u.transition(UpdateStatus::INSTALLING).is_err(), "{}", from);
            assert_eq!(u.status(), from);
        }
    }

    #[test]
    fn test_download_not_restartable_while_installing() {
        let mut u = update(UpdateStatus::Installing { progress: 30 });
        assert!(u.begin_download(0).is_err());
        assert_eq!(u.install_progress(), 30);
    }

    #[test]
    fn test_terminal_install_states_drop_progress() {
        for end in [UpdateStatus::Installed, UpdateStatus::InstallationFailed] {
            let mut u = update(UpdateStatus::Verified);
            u.transition(UpdateStatus::Installing { progress: 77 }).unwrap();
            assert_eq!(u.install_progress(), 0);
            assert!(u.advance_install(64));
            u.transition(end).unwrap();
            assert_eq!(u.install_progress(), 0);
        }
    }

    #[test]
    fn test_install_progress_is_monotonic() {
        let mut u = update(UpdateStatus::INSTALLING);
        assert!(u.advance_install(10));
        assert!(u.advance_install(55));
        assert!(!u.advance_install(40));
        assert!(u.advance_install(80));
        assert!(!u.advance_install(80));
        assert!(u.advance_install(250));
        assert!(!u.advance_install(101));
        assert_eq!(u.install_progress(), 100);
    }

    #[test]
    fn test_install_progress_ignored_outside_installing() {
        let mut u = update(UpdateStatus::Verified);
        assert!(!u.advance_install(50));
        assert_eq!(u.install_progress(), 0);
    }

    #[test]
    fn test_download_progress_is_monotonic() {
        let mut u = update(UpdateStatus::Downloading);
        for tick in [100, 550, 400, 800] {
            u.advance_download(tick, 1000);
        }
        assert_eq!(u.download_progress().downloaded, 800);
        assert_eq!(u.download_progress().percent(), 80);
    }

    #[test]
    fn test_verification_failure_resets_download_progress() {
        let mut u = update(UpdateStatus::Downloading);
        u.advance_download(1000, 1000);
        u.transition(UpdateStatus::Verifying).unwrap();
        u.transition(UpdateStatus::VerificationFailed).unwrap();
        assert_eq!(u.download_progress().downloaded, 0);
    }

    #[test]
    fn test_stale_resume_resets_download_progress() {
        let mut u = update(UpdateStatus::Downloading);
        u.advance_download(400, 1000);
        u.transition(UpdateStatus::Paused).unwrap();
        assert_eq!(u.download_progress().downloaded, 400);
        u.transition(UpdateStatus::PausedError).unwrap();
        assert_eq!(u.download_progress().downloaded, 0);
    }

    #[test]
    fn test_network_failure_keeps_download_progress() {
        let mut u = update(UpdateStatus::Downloading);
        u.advance_download(400, 1000);
        u.transition(UpdateStatus::PausedError).unwrap();
        assert_eq!(u.download_progress().downloaded, 400);
    }

    #[test]
    fn test_restart_download_only_while_downloading() {
        let mut u = update(UpdateStatus::Downloading);
        u.advance_download(400, 1000);
        assert!(u.restart_download());
        assert_eq!(u.download_progress().downloaded, 0);
        let mut paused = update(UpdateStatus::Paused);
        assert!(!paused.restart_download());
    }

    #[test]
    fn test_merge_info_keeps_runtime_state() {
        let mut u = update(UpdateStatus::Paused);
        u.advance_download(300, 1000);
        let mut info = sample_info("abc123", 2);
        info.version = "15.0".to_string();
        u.merge_info(info);
        assert_eq!(u.status(), UpdateStatus::Paused);
        assert_eq!(u.download_progress().downloaded, 300);
        assert_eq!(u.info.version, "15.0");
    }

    #[test]
    fn test_status_serializes_as_name() {
        let json = serde_json::to_string(&UpdateStatus::Installing { progress: 12 }).unwrap();
        assert_eq!(json, "\"INSTALLING\"");
        assert_eq!(UpdateStatus::PausedError.to_string(), "PAUSED_ERROR");
    }
}
