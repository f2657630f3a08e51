use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs4::fs_std::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::InstallError;
use crate::models::Package;
use crate::storage::{ensure_unique_jobs, PackageStore};

/// Exclusive advisory lock on `packages.lock`, released on drop.
struct RegistryLock {
    file: std::fs::File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to unlock package registry: {}", e);
        }
    }
}

/// Package registry stored as a single pretty-printed JSON array.
///
/// The file on disk is the source of truth: every operation re-reads it, so
/// a CLI invocation and the daemon can share one registry. Mutations are
/// serialized by an in-process mutex plus an exclusive file lock, and
/// written through a temp file that is renamed over the original.
pub struct JsonPackageStore {
    file_path: PathBuf,
    lock_path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonPackageStore {
    /// Open (or prepare) the registry at `<data_dir>/packages.json`.
    pub async fn new(data_dir: PathBuf) -> Result<Self, InstallError> {
        tokio::fs::create_dir_all(&data_dir).await.map_err(|e| {
            InstallError::StoreIo(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            file_path: data_dir.join("packages.json"),
            lock_path: data_dir.join("packages.lock"),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    async fn acquire_file_lock(&self) -> Result<RegistryLock, InstallError> {
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(RegistryLock { file })
        })
        .await
        .map_err(|e| InstallError::Internal(format!("Registry lock task failed: {}", e)))?
        .map_err(|e| InstallError::StoreIo(format!("Failed to lock package registry: {}", e)))
    }

    async fn read_packages(&self) -> Result<Vec<Package>, InstallError> {
        let content = match tokio::fs::read_to_string(&self.file_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(InstallError::StoreIo(format!(
                    "Failed to read {}: {}",
                    self.file_path.display(),
                    e
                )))
            }
        };

        // Only a missing file means "no packages"; an empty one is damage.
        serde_json::from_str::<Vec<Package>>(&content).map_err(|e| {
            InstallError::StoreIo(format!(
                "Package registry {} is corrupted: {}",
                self.file_path.display(),
                e
            ))
        })
    }

    /// Atomically write the registry to disk.
    /// Writes and syncs a .tmp file first, then renames to the actual file.
    async fn persist(&self, packages: &[Package]) -> Result<(), InstallError> {
        ensure_unique_jobs(packages)?;

        let tmp_path = self.file_path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(packages)?;
        let tmp_err = |e: std::io::Error| {
            InstallError::StoreIo(format!("Failed to write temporary registry file: {}", e))
        };

        let mut file = tokio::fs::File::create(&tmp_path).await.map_err(tmp_err)?;
        file.write_all(json.as_bytes()).await.map_err(tmp_err)?;
        file.sync_all().await.map_err(tmp_err)?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.file_path)
            .await
            .map_err(|e| {
                InstallError::StoreIo(format!("Failed to replace package registry: {}", e))
            })?;

        tracing::debug!(
            "Persisted {} package(s) to {}",
            packages.len(),
            self.file_path.display()
        );
        Ok(())
    }

    /// Run one locked read-modify-write cycle. The closure returns the value
    /// handed back to the caller and whether the collection must be written.
    async fn modify<T, F>(&self, f: F) -> Result<T, InstallError>
    where
        F: FnOnce(&mut Vec<Package>) -> (T, bool),
    {
        let _guard = self.write_lock.lock().await;
        let _file_lock = self.acquire_file_lock().await?;

        let mut packages = self.read_packages().await?;
        let (value, changed) = f(&mut packages);
        if changed {
            self.persist(&packages).await?;
        }
        Ok(value)
    }
}

#[async_trait]
impl PackageStore for JsonPackageStore {
    async fn load_all(&self) -> Result<Vec<Package>, InstallError> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = self.acquire_file_lock().await?;
        self.read_packages().await
    }

    async fn save(&self, packages: &[Package]) -> Result<(), InstallError> {
        let _guard = self.write_lock.lock().await;
        let _file_lock = self.acquire_file_lock().await?;
        self.persist(packages).await
    }

    async fn find(&self, job: &str) -> Result<Option<Package>, InstallError> {
        let packages = self.load_all().await?;
        Ok(packages.into_iter().find(|p| p.job == job))
    }

    async fn upsert(&self, package: Package) -> Result<(), InstallError> {
        self.modify(move |packages| {
            match packages.iter_mut().find(|p| p.job == package.job) {
                Some(existing) => *existing = package,
                None => packages.push(package),
            }
            ((), true)
        })
        .await
    }

    async fn remove(&self, job: &str) -> Result<Option<Package>, InstallError> {
        self.modify(|packages| match packages.iter().position(|p| p.job == job) {
            Some(idx) => (Some(packages.remove(idx)), true),
            None => (None, false),
        })
        .await
    }
}
