pub mod netdrive;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::errors::InstallError;
use crate::models::{Artifact, Build, NetworkDriveConfig};
use crate::remote::BuildSource;

use self::netdrive::{DriveMapper, MappedDrive};

/// Downloads build artifacts into local directories.
pub struct ArtifactFetcher {
    source: Arc<dyn BuildSource>,
    max_concurrent: usize,
    mapper: Arc<dyn DriveMapper>,
    network_drive: Option<NetworkDriveConfig>,
}

impl ArtifactFetcher {
    pub fn new(
        source: Arc<dyn BuildSource>,
        max_concurrent: usize,
        mapper: Arc<dyn DriveMapper>,
        network_drive: Option<NetworkDriveConfig>,
    ) -> Self {
        Self {
            source,
            max_concurrent: max_concurrent.max(1),
            mapper,
            network_drive,
        }
    }

    /// Map the configured share for `target` until the guard is released.
    pub async fn map_drive(&self, target: &Path) -> Result<MappedDrive, InstallError> {
        MappedDrive::acquire(
            Arc::clone(&self.mapper),
            self.network_drive.as_ref(),
            target,
        )
        .await
    }

    /// Download every artifact of `build` into `target_dir`, returning the
    /// local paths in artifact-list order.
    ///
    /// The first failure is returned; files that finished before it stay on
    /// disk.
    pub async fn download_all(
        &self,
        build: &Build,
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>, InstallError> {
        let drive = self.map_drive(target_dir).await?;
        let result = self.download_into(build, target_dir).await;
        drive.release().await;
        result
    }

    async fn download_into(
        &self,
        build: &Build,
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>, InstallError> {
        tokio::fs::create_dir_all(target_dir).await.map_err(|e| {
            InstallError::ArtifactDownload(format!(
                "Failed to create {}: {}",
                target_dir.display(),
                e
            ))
        })?;

        // Owned (url, dest) pairs so the download futures borrow nothing.
        let jobs: Vec<(String, Result<PathBuf, InstallError>)> = build
            .artifacts
            .iter()
            .map(|artifact| {
                (
                    build.artifact_url(artifact),
                    local_file_name(artifact).map(|name| target_dir.join(name)),
                )
            })
            .collect();

        let downloads = jobs.into_iter().map(|(url, dest)| {
            let source = Arc::clone(&self.source);
            async move {
                let dest = dest?;
                download_one(source, url, &dest).await?;
                Ok::<PathBuf, InstallError>(dest)
            }
        });

        let results: Vec<Result<PathBuf, InstallError>> = stream::iter(downloads)
            .buffered(self.max_concurrent)
            .collect()
            .await;

        let paths = results.into_iter().collect::<Result<Vec<_>, _>>()?;
        tracing::info!(
            "Downloaded {} artifact(s) of build #{} into {}",
            paths.len(),
            build.number,
            target_dir.display()
        );
        Ok(paths)
    }
}

async fn download_one(
    source: Arc<dyn BuildSource>,
    url: String,
    dest: &Path,
) -> Result<(), InstallError> {
    tracing::debug!("Downloading {} -> {}", url, dest.display());

    let mut body = source
        .open_artifact(&url)
        .await
        .map_err(|e| as_download_error(&url, e))?;

    let mut file = tokio::fs::File::create(dest).await.map_err(|e| {
        InstallError::ArtifactDownload(format!("Failed to create {}: {}", dest.display(), e))
    })?;

    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| as_download_error(&url, e))?;
        file.write_all(&chunk).await.map_err(|e| {
            InstallError::ArtifactDownload(format!("Failed to write {}: {}", dest.display(), e))
        })?;
        written += chunk.len() as u64;
    }
    file.flush().await.map_err(|e| {
        InstallError::ArtifactDownload(format!("Failed to write {}: {}", dest.display(), e))
    })?;

    tracing::debug!("Wrote {} bytes to {}", written, dest.display());
    Ok(())
}

fn as_download_error(url: &str, err: InstallError) -> InstallError {
    match err {
        InstallError::ArtifactDownload(_) => err,
        other => InstallError::ArtifactDownload(format!("{}: {}", url, other)),
    }
}

/// Artifact file names come from the server; only the final component is used.
fn local_file_name(artifact: &Artifact) -> Result<PathBuf, InstallError> {
    Path::new(&artifact.file_name)
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| {
            InstallError::ArtifactDownload(format!(
                "Invalid artifact file name '{}'",
                artifact.file_name
            ))
        })
}

/// `<root>/<job>-<hash>/<number>`. Folder separators in the job name are
/// flattened; the hash of the raw name keeps `team/app` and `team_app` apart.
pub fn build_dir(root: &Path, job: &str, number: u64) -> PathBuf {
    let job_dir: String = job
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c => c,
        })
        .collect();
    let job_dir = if job_dir.trim_matches('.').is_empty() {
        "_".to_string()
    } else {
        job_dir
    };
    let digest = Sha256::digest(job.as_bytes());
    let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
    root.join(format!("{}-{}", job_dir, suffix))
        .join(number.to_string())
}

/// Recorded paths that are no longer on disk.
pub fn missing_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths.iter().filter(|p| !p.exists()).cloned().collect()
}

/// Delete downloaded files, then their directory if it ended up empty.
/// Failures are logged.
pub async fn remove_artifacts(paths: &[PathBuf]) {
    let mut dirs: Vec<&Path> = Vec::new();
    for path in paths {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove artifact {}: {}", path.display(), e),
        }
        if let Some(parent) = path.parent() {
            if !dirs.contains(&parent) {
                dirs.push(parent);
            }
        }
    }
    for dir in dirs {
        // Fails while other files remain, which is fine.
        let _ = tokio::fs::remove_dir(dir).await;
    }
}
