//! Evidence budgets: strict caps on assembled evidence size.
//!
//! A budget must always be supplied by configuration — there is no default
//! baked into compiler logic, and constructors reject zero caps. Token caps
//! are the caller's business to map onto bytes before building a budget.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Half-open eligibility window for candidate events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        if let Some(since) = self.since
            && at < since
        {
            return false;
        }
        if let Some(until) = self.until
            && at >= until
        {
            return false;
        }
        true
    }
}

/// Strict numeric caps consumed by the evidence compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceBudget {
    /// Total bytes of fragment content allowed in a bundle.
    pub max_bytes: usize,
    /// Total content lines allowed in a bundle.
    pub max_lines: usize,
    /// Maximum number of fragments in a bundle.
    pub max_fragments: usize,
    #[serde(default)]
    pub window: TimeWindow,
}

impl EvidenceBudget {
    pub fn new(max_bytes: usize, max_lines: usize, max_fragments: usize) -> CoreResult<Self> {
        if max_bytes == 0 || max_lines == 0 || max_fragments == 0 {
            return Err(CoreError::InvalidBudget(format!(
                "all caps must be positive: bytes={max_bytes}, lines={max_lines}, fragments={max_fragments}"
            )));
        }
        Ok(Self {
            max_bytes,
            max_lines,
            max_fragments,
            window: TimeWindow::unbounded(),
        })
    }

    pub fn with_window(mut self, window: TimeWindow) -> Self {
        self.window = window;
        self
    }
}
