use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Remote query failed: {0}")]
    RemoteQuery(String),

    #[error("Artifact download failed: {0}")]
    ArtifactDownload(String),

    #[error("Installer execution failed: {0}")]
    InstallerExecution(String),

    #[error("Store error: {0}")]
    StoreIo(String),

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InstallError {
    /// Short machine-readable name used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            InstallError::RemoteQuery(_) => "remote_query",
            InstallError::ArtifactDownload(_) => "artifact_download",
            InstallError::InstallerExecution(_) => "installer_execution",
            InstallError::StoreIo(_) => "store_io",
            InstallError::Notification(_) => "notification",
            InstallError::NotFound(_) => "not_found",
            InstallError::Validation(_) => "validation",
            InstallError::Timeout(_) => "timeout",
            InstallError::Internal(_) => "internal_error",
        }
    }
}

impl From<std::io::Error> for InstallError {
    fn from(err: std::io::Error) -> Self {
        InstallError::StoreIo(err.to_string())
    }
}

impl From<serde_json::Error> for InstallError {
    fn from(err: serde_json::Error) -> Self {
        InstallError::StoreIo(err.to_string())
    }
}

impl From<reqwest::Error> for InstallError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            InstallError::Timeout(err.to_string())
        } else {
            InstallError::RemoteQuery(err.to_string())
        }
    }
}
