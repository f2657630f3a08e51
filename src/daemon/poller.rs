use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};

use crate::errors::InstallError;
use crate::models::InstallOutcome;
use crate::orchestrator::Orchestrator;

/// What the poller drives for each watched job.
#[async_trait]
pub trait PollTarget: Send + Sync {
    async fn poll_job(&self, job: &str) -> Result<InstallOutcome, InstallError>;
}

#[async_trait]
impl PollTarget for Orchestrator {
    async fn poll_job(&self, job: &str) -> Result<InstallOutcome, InstallError> {
        self.install_latest_successful_build(job).await
    }
}

/// Timer loop that installs the latest successful build of every watched job.
pub struct Poller {
    target: Arc<dyn PollTarget>,
    jobs: Vec<String>,
    interval: Duration,
    notify: Arc<Notify>,
}

impl Poller {
    pub fn new(
        target: Arc<dyn PollTarget>,
        jobs: Vec<String>,
        interval: Duration,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            target,
            jobs,
            interval,
            notify,
        }
    }

    /// One pass over the watched jobs, in configured order. A failing job
    /// does not stop the others.
    pub async fn poll_once(&self) -> Vec<(String, Result<InstallOutcome, InstallError>)> {
        let mut results = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let result = self.target.poll_job(job).await;
            match result {
                Ok(InstallOutcome::Installed(ref report)) => tracing::info!(
                    "Poll: job '{}' installed build #{}",
                    job,
                    report.build.number
                ),
                Ok(InstallOutcome::NoChange { build_number, .. }) => {
                    tracing::debug!("Poll: job '{}' unchanged at #{}", job, build_number)
                }
                Err(ref e) => tracing::warn!("Poll: job '{}' failed, retrying next poll: {}", job, e),
            }
            results.push((job.clone(), result));
        }
        results
    }

    /// Poll until `shutdown` fires. A notification on the poller's `Notify`
    /// starts the next pass immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<()>) {
        if self.jobs.is_empty() {
            tracing::warn!("No jobs configured; the poller will only idle");
        }
        tracing::info!(
            "Poller started: {} job(s), every {}s",
            self.jobs.len(),
            self.interval.as_secs()
        );

        loop {
            self.poll_once().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = self.notify.notified() => {
                    tracing::info!("Poll requested");
                }
                _ = shutdown.changed() => {
                    break;
                }
            }
        }
        tracing::info!("Poller stopped");
    }
}
