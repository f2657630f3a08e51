//! Scoped network-share mapping.
//!
//! Artifacts may live on a UNC share that needs credentials. The share is
//! mapped for the duration of a batch (download, install, uninstall) through
//! a [`MappedDrive`] guard. The batch hands the guard back with
//! [`MappedDrive::release`]; a guard dropped on an early return unmaps in a
//! background task instead.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;

use crate::errors::InstallError;
use crate::models::NetworkDriveConfig;

#[async_trait]
pub trait DriveMapper: Send + Sync {
    async fn map(&self, drive: &NetworkDriveConfig) -> Result<(), InstallError>;
    async fn unmap(&self, drive: &NetworkDriveConfig) -> Result<(), InstallError>;
}

/// Maps shares with `net use` (Windows).
pub struct NetUseMapper;

impl NetUseMapper {
    async fn run(args: &[String]) -> Result<(), InstallError> {
        let output = Command::new("net")
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| InstallError::Internal(format!("Failed to run net use: {}", e)))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(InstallError::Internal(format!(
                "net use exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }
}

#[async_trait]
impl DriveMapper for NetUseMapper {
    async fn map(&self, drive: &NetworkDriveConfig) -> Result<(), InstallError> {
        let mut args = vec!["use".to_string(), drive.share.clone()];
        if let Some(ref password) = drive.password {
            args.push(password.clone());
        }
        if let Some(ref user) = drive.username {
            args.push(format!("/user:{}", user));
        }
        Self::run(&args).await
    }

    async fn unmap(&self, drive: &NetworkDriveConfig) -> Result<(), InstallError> {
        Self::run(&[
            "use".to_string(),
            drive.share.clone(),
            "/delete".to_string(),
            "/y".to_string(),
        ])
        .await
    }
}

/// For platforms where shares are mounted by the operator.
pub struct NoopDriveMapper;

#[async_trait]
impl DriveMapper for NoopDriveMapper {
    async fn map(&self, _drive: &NetworkDriveConfig) -> Result<(), InstallError> {
        Ok(())
    }

    async fn unmap(&self, _drive: &NetworkDriveConfig) -> Result<(), InstallError> {
        Ok(())
    }
}

pub fn default_drive_mapper() -> Arc<dyn DriveMapper> {
    if cfg!(target_os = "windows") {
        Arc::new(NetUseMapper)
    } else {
        Arc::new(NoopDriveMapper)
    }
}

/// Whether `path` lies on `share` (case-insensitive, either slash style).
pub fn is_on_share(share: &str, path: &Path) -> bool {
    let normalize = |s: &str| s.replace('/', "\\").trim_end_matches('\\').to_lowercase();
    let share = normalize(share);
    if share.is_empty() {
        return false;
    }
    let path = normalize(&path.to_string_lossy());
    path == share || path.starts_with(&format!("{}\\", share))
}

async fn unmap_logged(mapper: &dyn DriveMapper, drive: &NetworkDriveConfig) {
    match mapper.unmap(drive).await {
        Ok(()) => tracing::debug!("Unmapped network share {}", drive.share),
        Err(e) => tracing::warn!("Failed to unmap network share {}: {}", drive.share, e),
    }
}

/// Guard holding a mapped share.
pub struct MappedDrive {
    mapper: Arc<dyn DriveMapper>,
    drive: Option<NetworkDriveConfig>,
}

impl MappedDrive {
    /// Map the configured share if `target` lives on it. Otherwise returns
    /// an inert guard.
    pub async fn acquire(
        mapper: Arc<dyn DriveMapper>,
        drive: Option<&NetworkDriveConfig>,
        target: &Path,
    ) -> Result<Self, InstallError> {
        let drive = match drive {
            Some(d) if is_on_share(&d.share, target) => d.clone(),
            _ => {
                return Ok(Self {
                    mapper,
                    drive: None,
                })
            }
        };

        mapper.map(&drive).await?;
        tracing::debug!("Mapped network share {}", drive.share);
        Ok(Self {
            mapper,
            drive: Some(drive),
        })
    }

    pub fn is_mapped(&self) -> bool {
        self.drive.is_some()
    }

    /// Unmap the share now. Failures are logged.
    pub async fn release(mut self) {
        if let Some(drive) = self.drive.take() {
            unmap_logged(self.mapper.as_ref(), &drive).await;
        }
    }
}

impl Drop for MappedDrive {
    fn drop(&mut self) {
        let drive = match self.drive.take() {
            Some(drive) => drive,
            None => return,
        };
        // Never block the executor here; the unmap runs as its own task.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let mapper = Arc::clone(&self.mapper);
                handle.spawn(async move {
                    unmap_logged(mapper.as_ref(), &drive).await;
                });
            }
            Err(_) => tracing::warn!(
                "Network share {} left mapped: no runtime to unmap it",
                drive.share
            ),
        }
    }
}
