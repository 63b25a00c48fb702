use std::path::PathBuf;
use thiserror::Error;

use crate::update::UpdateStatus;

#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("update {0} not found")]
    NotFound(String),

    #[error("an operation is already in progress for {0}")]
    AlreadyInProgress(String),

    #[error("download limit of {0} concurrent sessions reached")]
    TooManyDownloads(usize),

    #[error("illegal transition for {id}: {from} -> {to}")]
    IllegalTransition {
        id: String,
        from: UpdateStatus,
        to: UpdateStatus,
    },

    #[error("remote resource for {0} changed, partial download discarded")]
    StaleResource(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("payload file {0:?} does not exist")]
    MissingPayload(PathBuf),

    #[error("could not prepare installation: {0}")]
    InstallPrepare(String),

    #[error("update engine error: {0}")]
    EngineReported(String),

    #[error("invalid catalog: {0}")]
    InvalidCatalog(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for UpdaterError {
    fn from(e: reqwest::Error) -> Self {
        UpdaterError::Network(e.to_string())
    }
}

impl From<zip::result::ZipError> for UpdaterError {
    fn from(e: zip::result::ZipError) -> Self {
        UpdaterError::InstallPrepare(e.to_string())
    }
}

pub type Result<T, E = UpdaterError> = std::result::Result<T, E>;
