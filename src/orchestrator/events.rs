use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::ItemOutcome;

/// Progress of an orchestrator run, broadcast to the event logger and SSE clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum OrchestratorEvent {
    CheckStarted {
        job: String,
        timestamp: DateTime<Utc>,
    },
    NoChange {
        job: String,
        build_number: u64,
        timestamp: DateTime<Utc>,
    },
    Downloaded {
        job: String,
        build_number: u64,
        paths: Vec<PathBuf>,
        timestamp: DateTime<Utc>,
    },
    Uninstalled {
        job: String,
        build_number: u64,
        outcomes: Vec<ItemOutcome>,
        timestamp: DateTime<Utc>,
    },
    Installed {
        job: String,
        build_number: u64,
        previous: Option<u64>,
        outcomes: Vec<ItemOutcome>,
        timestamp: DateTime<Utc>,
    },
    Failed {
        job: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl OrchestratorEvent {
    pub fn job(&self) -> &str {
        match self {
            OrchestratorEvent::CheckStarted { job, .. }
            | OrchestratorEvent::NoChange { job, .. }
            | OrchestratorEvent::Downloaded { job, .. }
            | OrchestratorEvent::Uninstalled { job, .. }
            | OrchestratorEvent::Installed { job, .. }
            | OrchestratorEvent::Failed { job, .. } => job,
        }
    }

    /// Variant name as it appears in the serialized `event` field.
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::CheckStarted { .. } => "CheckStarted",
            OrchestratorEvent::NoChange { .. } => "NoChange",
            OrchestratorEvent::Downloaded { .. } => "Downloaded",
            OrchestratorEvent::Uninstalled { .. } => "Uninstalled",
            OrchestratorEvent::Installed { .. } => "Installed",
            OrchestratorEvent::Failed { .. } => "Failed",
        }
    }
}
