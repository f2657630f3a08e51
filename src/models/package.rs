use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::build::{Build, ChangeSet};

/// Install record for one job: which build is on this machine and where
/// its package files live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub url: String,
    pub job: String,
    pub date: DateTime<Utc>,
    pub paths: Vec<PathBuf>,
    pub build: Build,
    #[serde(rename = "changeSet", default)]
    pub change_set: ChangeSet,
}

impl Package {
    pub fn new(job: &str, build: Build, paths: Vec<PathBuf>, date: DateTime<Utc>) -> Self {
        Self {
            url: build.url.clone(),
            job: job.to_string(),
            date,
            paths,
            change_set: build.merged_change_set(),
            build,
        }
    }

    pub fn build_number(&self) -> u64 {
        self.build.number
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failed(String),
    Skipped(String),
}

/// Result of running the installer or uninstaller for a single package file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemOutcome {
    pub path: PathBuf,
    pub outcome: Outcome,
}

impl ItemOutcome {
    pub fn success(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome: Outcome::Success,
        }
    }

    pub fn failed(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome: Outcome::Failed(reason.into()),
        }
    }

    pub fn skipped(path: &Path, reason: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            outcome: Outcome::Skipped(reason.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.outcome, Outcome::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstallReport {
    pub job: String,
    pub build: Build,
    pub previous_build: Option<u64>,
    pub paths: Vec<PathBuf>,
    pub uninstalled: Vec<ItemOutcome>,
    pub installed: Vec<ItemOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstallOutcome {
    Installed(InstallReport),
    NoChange { job: String, build_number: u64 },
}

impl InstallOutcome {
    pub fn build_number(&self) -> u64 {
        match self {
            InstallOutcome::Installed(report) => report.build.number,
            InstallOutcome::NoChange { build_number, .. } => *build_number,
        }
    }

    pub fn is_no_change(&self) -> bool {
        matches!(self, InstallOutcome::NoChange { .. })
    }
}

/// Installed build versus the server's latest successful build.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub job: String,
    pub installed_build: Option<u64>,
    pub installed_at: Option<DateTime<Utc>>,
    pub latest_successful_build: Option<u64>,
}

impl JobStatus {
    pub fn up_to_date(&self) -> bool {
        self.installed_build.is_some() && self.installed_build == self.latest_successful_build
    }
}
