//! Outward-facing stream projection of the trace.
//!
//! Every durable append is mirrored to subscribers as a [`StreamEnvelope`]
//! in non-decreasing sequence order per run. The streaming layer holds no
//! state the trace store does not already durably have.

use crate::event::{TraceEvent, TraceEventKind};
use crate::ids::{CorrelationId, RunId, SeqNo};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Subscriber-facing view of one trace event. Payload content stays behind
/// in the store; only kind, identifiers, and execution metadata go outward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnvelope {
    /// Per-run monotonic id, the resumption cursor.
    pub event_id: SeqNo,
    pub run_id: RunId,
    pub correlation_id: CorrelationId,
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    /// Flat, insertion-ordered metadata so serialized envelopes are
    /// byte-stable.
    #[serde(default)]
    pub metadata: IndexMap<String, String>,
}

impl StreamEnvelope {
    /// Project a stored event into its outward envelope.
    pub fn from_event(event: &TraceEvent) -> Self {
        let mut metadata = IndexMap::new();
        match &event.kind {
            TraceEventKind::ToolCallStarted { tool_name, .. } => {
                metadata.insert("tool_name".to_owned(), tool_name.clone());
            }
            TraceEventKind::ToolCallCompleted {
                tool_name, meta, ..
            } => {
                metadata.insert("tool_name".to_owned(), tool_name.clone());
                if let Some(code) = meta.exit_code {
                    metadata.insert("exit_code".to_owned(), code.to_string());
                }
                metadata.insert("duration_ms".to_owned(), meta.duration_ms.to_string());
                metadata.insert("bytes".to_owned(), meta.bytes.to_string());
            }
            TraceEventKind::ToolCallFailed {
                tool_name, meta, ..
            } => {
                metadata.insert("tool_name".to_owned(), tool_name.clone());
                if let Some(code) = meta.exit_code {
                    metadata.insert("exit_code".to_owned(), code.to_string());
                }
                metadata.insert("duration_ms".to_owned(), meta.duration_ms.to_string());
            }
            TraceEventKind::WorkerSpawned {
                group_id,
                worker_run_id,
                ..
            }
            | TraceEventKind::WorkerCompleted {
                group_id,
                worker_run_id,
                ..
            }
            | TraceEventKind::WorkerFailed {
                group_id,
                worker_run_id,
                ..
            } => {
                metadata.insert("group_id".to_owned(), group_id.to_string());
                metadata.insert("worker_run_id".to_owned(), worker_run_id.to_string());
            }
            TraceEventKind::GroupJoined {
                group_id,
                completed,
                failed,
            } => {
                metadata.insert("group_id".to_owned(), group_id.to_string());
                metadata.insert("completed".to_owned(), completed.to_string());
                metadata.insert("failed".to_owned(), failed.to_string());
            }
            TraceEventKind::ContinuationEnqueued { group_id, .. } => {
                metadata.insert("group_id".to_owned(), group_id.to_string());
            }
            _ => {}
        }
        Self {
            event_id: event.sequence,
            run_id: event.run_id.clone(),
            correlation_id: event.correlation_id.clone(),
            kind: event.kind.name().to_owned(),
            timestamp: event.timestamp,
            metadata,
        }
    }
}

/// One item on a subscription stream: either a real envelope or a heartbeat
/// proving the channel is alive while no events flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Event(StreamEnvelope),
    Heartbeat {
        run_id: RunId,
        at: DateTime<Utc>,
        /// Highest sequence delivered so far on this subscription.
        last_event_id: SeqNo,
    },
}

/// Timeline projection entry: an envelope plus computed offsets for
/// observability tooling. Purely a read projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub envelope: StreamEnvelope,
    /// Milliseconds since the run's first event.
    pub offset_ms: u64,
    /// Milliseconds since the previous event in the run, i.e. the duration
    /// of the phase that ended here.
    pub delta_ms: u64,
}
