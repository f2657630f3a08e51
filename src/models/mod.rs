pub mod build;
pub mod config;
pub mod package;

pub use build::{Artifact, Build, BuildRef, BuildResult, ChangeSet, ChangeSetItem, Job, User};
pub use config::{AgentConfig, NetworkDriveConfig, NotificationConfig};
pub use package::{InstallOutcome, InstallReport, ItemOutcome, JobStatus, Outcome, Package};
