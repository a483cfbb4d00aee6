//! Run records: one row per supervisor or worker execution.

use crate::ids::{CorrelationId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What flavor of execution a run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Supervisor,
    Worker,
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    /// Suspended while waiting for a worker group to join.
    Deferred,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Durable row describing one run.
///
/// A worker run always has exactly one parent supervisor run; a supervisor
/// run has none. The constructors enforce this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub kind: RunKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<RunId>,
    pub status: RunStatus,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Create a fresh supervisor run.
    pub fn supervisor(correlation_id: CorrelationId) -> Self {
        Self {
            run_id: RunId::new_uuid(),
            kind: RunKind::Supervisor,
            parent_run_id: None,
            status: RunStatus::Active,
            correlation_id,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Create a fresh worker run owned by `parent`.
    pub fn worker(parent: RunId, correlation_id: CorrelationId) -> Self {
        Self {
            run_id: RunId::new_uuid(),
            kind: RunKind::Worker,
            parent_run_id: Some(parent),
            status: RunStatus::Active,
            correlation_id,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move the run into a terminal or non-terminal status, stamping
    /// `completed_at` on terminal transitions.
    pub fn transition(&mut self, status: RunStatus) {
        self.status = status;
        if status.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }
}
