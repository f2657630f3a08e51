pub mod events;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::errors::InstallError;
use crate::fetcher::{build_dir, missing_paths, remove_artifacts, ArtifactFetcher};
use crate::installer::InstallRunner;
use crate::models::{
    AgentConfig, Build, InstallOutcome, InstallReport, ItemOutcome, JobStatus, Package,
};
use crate::notify::Notifier;
use crate::remote::BuildSource;
use crate::storage::PackageStore;

pub use events::OrchestratorEvent;

/// Keeps the installed build of each job in step with the CI server.
///
/// Every public operation is serialized per job; different jobs may run
/// concurrently and only meet in the package store and the installer lock.
pub struct Orchestrator {
    config: Arc<AgentConfig>,
    source: Arc<dyn BuildSource>,
    store: Arc<dyn PackageStore>,
    fetcher: Arc<ArtifactFetcher>,
    installer: Arc<InstallRunner>,
    notifier: Arc<dyn Notifier>,
    event_tx: broadcast::Sender<OrchestratorEvent>,
    job_locks: std::sync::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<AgentConfig>,
        source: Arc<dyn BuildSource>,
        store: Arc<dyn PackageStore>,
        fetcher: Arc<ArtifactFetcher>,
        installer: Arc<InstallRunner>,
        notifier: Arc<dyn Notifier>,
        event_tx: broadcast::Sender<OrchestratorEvent>,
    ) -> Self {
        Self {
            config,
            source,
            store,
            fetcher,
            installer,
            notifier,
            event_tx,
            job_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn PackageStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Install the job's last successful build unless it is already installed.
    pub async fn install_latest_successful_build(
        &self,
        job: &str,
    ) -> Result<InstallOutcome, InstallError> {
        let lock = self.job_lock(job);
        let _guard = lock.lock().await;
        self.emit(OrchestratorEvent::CheckStarted {
            job: job.to_string(),
            timestamp: Utc::now(),
        });

        let result = async {
            let build = self.source.last_successful_build(job).await?;
            self.install_locked(job, build).await
        }
        .await;
        self.report("Install", job, result)
    }

    /// Install a specific build of the job, e.g. to pin or roll back.
    pub async fn install_build(
        &self,
        job: &str,
        number: u64,
    ) -> Result<InstallOutcome, InstallError> {
        let lock = self.job_lock(job);
        let _guard = lock.lock().await;
        self.emit(OrchestratorEvent::CheckStarted {
            job: job.to_string(),
            timestamp: Utc::now(),
        });

        let result = async {
            let build = self.source.get_build(job, number).await?;
            if !build.is_installable() {
                let state = match build.result {
                    _ if build.building => "still building".to_string(),
                    Some(result) => format!("{:?}", result).to_uppercase(),
                    None => "without result".to_string(),
                };
                return Err(InstallError::Validation(format!(
                    "Build '{}' #{} is {} and cannot be installed",
                    job, number, state
                )));
            }
            self.install_locked(job, build).await
        }
        .await;
        self.report("Install", job, result)
    }

    /// Uninstall the job's package. Returns `false` when nothing was installed.
    pub async fn uninstall_build(&self, job: &str) -> Result<bool, InstallError> {
        let lock = self.job_lock(job);
        let _guard = lock.lock().await;

        let result = async {
            match self.store.find(job).await? {
                Some(package) => {
                    self.uninstall_package(job, package).await?;
                    Ok(true)
                }
                None => {
                    tracing::info!("No package recorded for job '{}', nothing to uninstall", job);
                    Ok(false)
                }
            }
        }
        .await;
        self.report("Uninstall", job, result)
    }

    /// Compare the installed build with the server's last successful build.
    /// Changes nothing.
    pub async fn check(&self, job: &str) -> Result<JobStatus, InstallError> {
        let installed = self.store.find(job).await?;
        let remote = self.source.get_job(job).await?;
        Ok(JobStatus {
            job: job.to_string(),
            installed_build: installed.as_ref().map(Package::build_number),
            installed_at: installed.as_ref().map(|p| p.date),
            latest_successful_build: remote.last_successful_build.map(|b| b.number),
        })
    }

    fn job_lock(&self, job: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .job_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(job.to_string()).or_default())
    }

    fn emit(&self, event: OrchestratorEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn report<T>(
        &self,
        action: &str,
        job: &str,
        result: Result<T, InstallError>,
    ) -> Result<T, InstallError> {
        if let Err(ref e) = result {
            tracing::error!("{} of job '{}' failed: {}", action, job, e);
            self.emit(OrchestratorEvent::Failed {
                job: job.to_string(),
                error: e.to_string(),
                timestamp: Utc::now(),
            });
        }
        result
    }

    async fn install_locked(&self, job: &str, build: Build) -> Result<InstallOutcome, InstallError> {
        let current = self.store.find(job).await?;
        if let Some(ref installed) = current {
            if installed.build_number() == build.number {
                tracing::info!("Job '{}' is up to date at build #{}", job, build.number);
                self.emit(OrchestratorEvent::NoChange {
                    job: job.to_string(),
                    build_number: build.number,
                    timestamp: Utc::now(),
                });
                return Ok(InstallOutcome::NoChange {
                    job: job.to_string(),
                    build_number: build.number,
                });
            }
        }

        let previous_build = current.as_ref().map(Package::build_number);
        match previous_build {
            Some(previous) => tracing::info!(
                "Job '{}' has build #{} installed, replacing it with #{}",
                job,
                previous,
                build.number
            ),
            None => tracing::info!("Installing job '{}' build #{}", job, build.number),
        }

        // Nothing is touched until the new build is fully on disk.
        let target = build_dir(&self.config.artifacts_root(), job, build.number);
        let paths = self.fetcher.download_all(&build, &target).await?;
        self.emit(OrchestratorEvent::Downloaded {
            job: job.to_string(),
            build_number: build.number,
            paths: paths.clone(),
            timestamp: Utc::now(),
        });

        let uninstalled = match current {
            Some(package) => self.uninstall_package(job, package).await?,
            None => Vec::new(),
        };

        let drive = self.fetcher.map_drive(&target).await?;
        let installed = self.installer.install(&paths).await;
        drive.release().await;
        let failures = installed.iter().filter(|o| o.is_failed()).count();
        if failures > 0 {
            tracing::warn!(
                "{} of {} package(s) of '{}' #{} failed to install",
                failures,
                installed.len(),
                job,
                build.number
            );
        }

        let package = Package::new(job, build.clone(), paths.clone(), Utc::now());
        self.store.upsert(package.clone()).await?;
        tracing::info!("Recorded job '{}' at build #{}", job, build.number);

        self.emit(OrchestratorEvent::Installed {
            job: job.to_string(),
            build_number: build.number,
            previous: previous_build,
            outcomes: installed.clone(),
            timestamp: Utc::now(),
        });

        if let Err(e) = self.notifier.notify(&package).await {
            tracing::warn!("Notification for job '{}' #{} failed: {}", job, build.number, e);
        }

        Ok(InstallOutcome::Installed(InstallReport {
            job: job.to_string(),
            build,
            previous_build,
            paths,
            uninstalled,
            installed,
        }))
    }

    async fn uninstall_package(
        &self,
        job: &str,
        package: Package,
    ) -> Result<Vec<ItemOutcome>, InstallError> {
        let number = package.build_number();
        let root = self.config.artifacts_root();

        let mut paths = package.paths.clone();
        let missing = missing_paths(&paths);
        if !missing.is_empty() {
            tracing::warn!(
                "{} recorded file(s) of '{}' #{} are missing, downloading the build again",
                missing.len(),
                job,
                number
            );
            paths = self
                .fetcher
                .download_all(&package.build, &build_dir(&root, job, number))
                .await?;
        }

        let drive_target: PathBuf = paths
            .first()
            .and_then(|p| p.parent())
            .map(Path::to_path_buf)
            .unwrap_or(root);
        let drive = self.fetcher.map_drive(&drive_target).await?;

        // The record goes first so a failing uninstaller never leaves it behind.
        self.store.remove(job).await?;
        tracing::info!("Removed package record of '{}' #{}", job, number);

        let outcomes = self.installer.uninstall(&paths).await;
        drive.release().await;
        self.emit(OrchestratorEvent::Uninstalled {
            job: job.to_string(),
            build_number: number,
            outcomes: outcomes.clone(),
            timestamp: Utc::now(),
        });

        if self.config.cleanup_artifacts {
            remove_artifacts(&paths).await;
        }
        Ok(outcomes)
    }
}
