//! Evidence markers: small structured pointers that travel inside free-form
//! message text in place of raw worker output.
//!
//! Wire syntax: `[EVIDENCE:run_id=<id>,job_id=<id>,worker_id=<id>]`.
//! The parser is defensive — a malformed token is reported, never assumed
//! well-formed, and treated as absent evidence by callers.

use crate::ids::{GroupId, RunId, WorkerId};
use serde::{Deserialize, Serialize};
use std::fmt;

const MARKER_PREFIX: &str = "[EVIDENCE:";

/// Persisted pointer to one worker's trace.
///
/// `run_id` names the worker run whose trace the evidence compiler reads,
/// `job_id` the owning worker group, `worker_id` the spawn identifier
/// within that group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvidenceMarker {
    pub run_id: RunId,
    pub job_id: GroupId,
    pub worker_id: WorkerId,
}

impl EvidenceMarker {
    pub fn new(run_id: RunId, job_id: GroupId, worker_id: WorkerId) -> Self {
        Self {
            run_id,
            job_id,
            worker_id,
        }
    }

    /// Parse a single marker token. Returns `None` for anything that is not
    /// a complete, well-formed token with all three keys present.
    pub fn parse(token: &str) -> Option<Self> {
        let body = token
            .strip_prefix(MARKER_PREFIX)?
            .strip_suffix(']')?;
        let mut run_id = None;
        let mut job_id = None;
        let mut worker_id = None;
        for pair in body.split(',') {
            let (key, value) = pair.split_once('=')?;
            if value.is_empty() || value.contains(['[', ']']) {
                return None;
            }
            match key {
                "run_id" => run_id = Some(RunId::from_string(value)),
                "job_id" => job_id = Some(GroupId::from_string(value)),
                "worker_id" => worker_id = Some(WorkerId::from_string(value)),
                _ => return None,
            }
        }
        Some(Self {
            run_id: run_id?,
            job_id: job_id?,
            worker_id: worker_id?,
        })
    }
}

impl fmt::Display for EvidenceMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{MARKER_PREFIX}run_id={},job_id={},worker_id={}]",
            self.run_id, self.job_id, self.worker_id
        )
    }
}

/// Result of scanning a free-text payload for marker tokens.
#[derive(Debug, Default, Clone)]
pub struct MarkerScan {
    pub markers: Vec<EvidenceMarker>,
    /// Token-shaped substrings that failed to parse. Callers log these as
    /// contract violations and carry on.
    pub malformed: Vec<String>,
}

impl MarkerScan {
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty() && self.malformed.is_empty()
    }
}

/// Scan `text` for every marker token, well-formed or not.
pub fn scan_markers(text: &str) -> MarkerScan {
    let mut scan = MarkerScan::default();
    let mut rest = text;
    while let Some(start) = rest.find(MARKER_PREFIX) {
        let candidate = &rest[start..];
        match candidate.find(']') {
            Some(end) => {
                let token = &candidate[..=end];
                match EvidenceMarker::parse(token) {
                    Some(marker) => scan.markers.push(marker),
                    None => scan.malformed.push(token.to_owned()),
                }
                rest = &candidate[end + 1..];
            }
            None => {
                // Unterminated token; everything to end-of-text is suspect.
                scan.malformed.push(candidate.to_owned());
                break;
            }
        }
    }
    scan
}
