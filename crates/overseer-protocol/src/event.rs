//! Trace event taxonomy for the overseer core.
//!
//! Every action, tool result, message, and lifecycle transition lands in the
//! trace as one of these records. Payloads carry raw content as opaque
//! strings; the only structured view of a tool result is [`ExecMeta`]
//! (exit code, duration, size), which the core never domain-parses.
//!
//! Forward-compatible: unknown `"type"` tags deserialize into
//! `Custom { event_type, data }` instead of failing, so old traces stay
//! replayable across versions.

use crate::ids::{
    CorrelationId, EventId, GroupId, RunId, SeqNo, ToolCallId, WorkerId,
};
use crate::run::RunKind;
use serde::{Deserialize, Serialize};

/// Execution metadata recorded alongside raw tool output. This is the only
/// structure the core ever reads out of a tool result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
    /// Payload size in bytes, as produced by the tool.
    #[serde(default)]
    pub bytes: u64,
}

impl ExecMeta {
    pub fn succeeded(&self) -> bool {
        self.exit_code.is_none_or(|code| code == 0)
    }
}

/// Why a worker reached a terminal failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerFailureKind {
    Error,
    Timeout,
    Cancelled,
}

/// Discriminated union of all trace event payloads.
#[derive(Debug, Clone, Serialize)]
#[non_exhaustive]
#[serde(tag = "type")]
pub enum TraceEventKind {
    // ── Run lifecycle ──
    RunStarted {
        kind: RunKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_run_id: Option<RunId>,
    },
    RunCompleted {
        #[serde(skip_serializing_if = "Option::is_none")]
        final_answer: Option<String>,
    },
    RunFailed {
        error: String,
    },
    RunCancelled {
        reason: String,
    },

    // ── Conversation ──
    Message {
        role: String,
        content: String,
    },

    // ── Tool lifecycle ──
    ToolCallStarted {
        tool_call_id: ToolCallId,
        tool_name: String,
        /// Raw tool arguments; opaque to the core.
        arguments: String,
        user_visible: bool,
    },
    ToolCallCompleted {
        tool_call_id: ToolCallId,
        tool_name: String,
        /// Raw tool output; opaque to the core.
        output: String,
        user_visible: bool,
        meta: ExecMeta,
    },
    ToolCallFailed {
        tool_call_id: ToolCallId,
        tool_name: String,
        error: String,
        user_visible: bool,
        meta: ExecMeta,
    },

    // ── Worker fan-out / fan-in ──
    WorkerSpawned {
        group_id: GroupId,
        worker_run_id: RunId,
        worker_id: WorkerId,
        /// Opaque task description; the core does not interpret it.
        task: String,
    },
    WorkerCompleted {
        group_id: GroupId,
        worker_run_id: RunId,
        worker_id: WorkerId,
        summary: String,
        meta: ExecMeta,
    },
    WorkerFailed {
        group_id: GroupId,
        worker_run_id: RunId,
        worker_id: WorkerId,
        reason: WorkerFailureKind,
        detail: String,
    },
    GroupJoined {
        group_id: GroupId,
        completed: u32,
        failed: u32,
    },
    ContinuationEnqueued {
        group_id: GroupId,
        /// Continuation message text embedding one evidence marker per
        /// worker in the group.
        message: String,
    },

    // ── Forward-compatible catch-all ──
    Custom {
        event_type: String,
        data: serde_json::Value,
    },
}

impl TraceEventKind {
    /// Stable snake_case name used in stream envelopes and timelines.
    pub fn name(&self) -> &str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
            Self::Message { .. } => "message",
            Self::ToolCallStarted { .. } => "tool_call_started",
            Self::ToolCallCompleted { .. } => "tool_call_completed",
            Self::ToolCallFailed { .. } => "tool_call_failed",
            Self::WorkerSpawned { .. } => "worker_spawned",
            Self::WorkerCompleted { .. } => "worker_completed",
            Self::WorkerFailed { .. } => "worker_failed",
            Self::GroupJoined { .. } => "group_joined",
            Self::ContinuationEnqueued { .. } => "continuation_enqueued",
            Self::Custom { event_type, .. } => event_type.as_str(),
        }
    }

    /// Whether this event records a failure outcome. Evidence compilation
    /// ranks these first.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::ToolCallFailed { .. }
                | Self::WorkerFailed { .. }
                | Self::RunFailed { .. }
                | Self::RunCancelled { .. }
        )
    }

    /// Whether this is a tool call the user explicitly saw happen.
    pub fn is_user_visible_tool_call(&self) -> bool {
        matches!(
            self,
            Self::ToolCallStarted { user_visible: true, .. }
                | Self::ToolCallCompleted { user_visible: true, .. }
                | Self::ToolCallFailed { user_visible: true, .. }
        )
    }
}

/// One appended, immutable trace record.
///
/// `sequence` is assigned by the trace store and is strictly monotonic per
/// run; it is the resumption cursor for subscribers. Events are never
/// mutated or deleted once written — corrections are new events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub event_id: EventId,
    pub run_id: RunId,
    pub sequence: SeqNo,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub correlation_id: CorrelationId,
    /// Client-supplied idempotency key. A retried append with the same key
    /// returns the original event instead of duplicating it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    pub kind: TraceEventKind,
}

// ─── Forward-compatible deserializer ───────────────────────────────

/// Internal helper enum for the forward-compatible deserializer.
/// Mirrors TraceEventKind exactly but derives Deserialize.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum TraceEventKindKnown {
    RunStarted {
        kind: RunKind,
        #[serde(default)]
        parent_run_id: Option<RunId>,
    },
    RunCompleted {
        #[serde(default)]
        final_answer: Option<String>,
    },
    RunFailed {
        error: String,
    },
    RunCancelled {
        reason: String,
    },
    Message {
        role: String,
        content: String,
    },
    ToolCallStarted {
        tool_call_id: ToolCallId,
        tool_name: String,
        arguments: String,
        user_visible: bool,
    },
    ToolCallCompleted {
        tool_call_id: ToolCallId,
        tool_name: String,
        output: String,
        user_visible: bool,
        meta: ExecMeta,
    },
    ToolCallFailed {
        tool_call_id: ToolCallId,
        tool_name: String,
        error: String,
        user_visible: bool,
        meta: ExecMeta,
    },
    WorkerSpawned {
        group_id: GroupId,
        worker_run_id: RunId,
        worker_id: WorkerId,
        task: String,
    },
    WorkerCompleted {
        group_id: GroupId,
        worker_run_id: RunId,
        worker_id: WorkerId,
        summary: String,
        meta: ExecMeta,
    },
    WorkerFailed {
        group_id: GroupId,
        worker_run_id: RunId,
        worker_id: WorkerId,
        reason: WorkerFailureKind,
        detail: String,
    },
    GroupJoined {
        group_id: GroupId,
        completed: u32,
        failed: u32,
    },
    ContinuationEnqueued {
        group_id: GroupId,
        message: String,
    },
    Custom {
        event_type: String,
        data: serde_json::Value,
    },
}

/// Forward-compatible deserializer: unknown variants become `Custom`.
impl<'de> Deserialize<'de> for TraceEventKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match serde_json::from_value::<TraceEventKindKnown>(raw.clone()) {
            Ok(known) => Ok(known.into()),
            Err(_) => {
                let event_type = raw
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("Unknown")
                    .to_string();
                let mut data = raw;
                if let Some(obj) = data.as_object_mut() {
                    obj.remove("type");
                }
                Ok(TraceEventKind::Custom { event_type, data })
            }
        }
    }
}

impl From<TraceEventKindKnown> for TraceEventKind {
    fn from(k: TraceEventKindKnown) -> Self {
        match k {
            TraceEventKindKnown::RunStarted {
                kind,
                parent_run_id,
            } => Self::RunStarted {
                kind,
                parent_run_id,
            },
            TraceEventKindKnown::RunCompleted { final_answer } => {
                Self::RunCompleted { final_answer }
            }
            TraceEventKindKnown::RunFailed { error } => Self::RunFailed { error },
            TraceEventKindKnown::RunCancelled { reason } => Self::RunCancelled { reason },
            TraceEventKindKnown::Message { role, content } => Self::Message { role, content },
            TraceEventKindKnown::ToolCallStarted {
                tool_call_id,
                tool_name,
                arguments,
                user_visible,
            } => Self::ToolCallStarted {
                tool_call_id,
                tool_name,
                arguments,
                user_visible,
            },
            TraceEventKindKnown::ToolCallCompleted {
                tool_call_id,
                tool_name,
                output,
                user_visible,
                meta,
            } => Self::ToolCallCompleted {
                tool_call_id,
                tool_name,
                output,
                user_visible,
                meta,
            },
            TraceEventKindKnown::ToolCallFailed {
                tool_call_id,
                tool_name,
                error,
                user_visible,
                meta,
            } => Self::ToolCallFailed {
                tool_call_id,
                tool_name,
                error,
                user_visible,
                meta,
            },
            TraceEventKindKnown::WorkerSpawned {
                group_id,
                worker_run_id,
                worker_id,
                task,
            } => Self::WorkerSpawned {
                group_id,
                worker_run_id,
                worker_id,
                task,
            },
            TraceEventKindKnown::WorkerCompleted {
                group_id,
                worker_run_id,
                worker_id,
                summary,
                meta,
            } => Self::WorkerCompleted {
                group_id,
                worker_run_id,
                worker_id,
                summary,
                meta,
            },
            TraceEventKindKnown::WorkerFailed {
                group_id,
                worker_run_id,
                worker_id,
                reason,
                detail,
            } => Self::WorkerFailed {
                group_id,
                worker_run_id,
                worker_id,
                reason,
                detail,
            },
            TraceEventKindKnown::GroupJoined {
                group_id,
                completed,
                failed,
            } => Self::GroupJoined {
                group_id,
                completed,
                failed,
            },
            TraceEventKindKnown::ContinuationEnqueued { group_id, message } => {
                Self::ContinuationEnqueued { group_id, message }
            }
            TraceEventKindKnown::Custom { event_type, data } => {
                Self::Custom { event_type, data }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_call_completed_roundtrip() {
        let kind = TraceEventKind::ToolCallCompleted {
            tool_call_id: ToolCallId::from_string("tc1"),
            tool_name: "shell".into(),
            output: "total 0\n".into(),
            user_visible: true,
            meta: ExecMeta {
                exit_code: Some(0),
                duration_ms: 12,
                bytes: 8,
            },
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert!(json.contains("\"type\":\"ToolCallCompleted\""));
        let back: TraceEventKind = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, TraceEventKind::ToolCallCompleted { .. }));
    }

    #[test]
    fn unknown_variant_becomes_custom() {
        let json = r#"{"type":"FutureFeature","key":"value","num":42}"#;
        let kind: TraceEventKind = serde_json::from_str(json).unwrap();
        if let TraceEventKind::Custom { event_type, data } = kind {
            assert_eq!(event_type, "FutureFeature");
            assert_eq!(data["key"], "value");
            assert_eq!(data["num"], 42);
        } else {
            panic!("should be Custom");
        }
    }

    #[test]
    fn failure_classification() {
        let failed = TraceEventKind::WorkerFailed {
            group_id: GroupId::from_string("g1"),
            worker_run_id: RunId::from_string("r1"),
            worker_id: WorkerId::from_string("w1"),
            reason: WorkerFailureKind::Timeout,
            detail: "deadline exceeded".into(),
        };
        assert!(failed.is_failure());
        let message = TraceEventKind::Message {
            role: "assistant".into(),
            content: "done".into(),
        };
        assert!(!message.is_failure());
    }

    #[test]
    fn user_visible_classification() {
        let visible = TraceEventKind::ToolCallCompleted {
            tool_call_id: ToolCallId::from_string("tc1"),
            tool_name: "web_search".into(),
            output: "results".into(),
            user_visible: true,
            meta: ExecMeta::default(),
        };
        assert!(visible.is_user_visible_tool_call());
        let hidden = TraceEventKind::ToolCallCompleted {
            tool_call_id: ToolCallId::from_string("tc2"),
            tool_name: "scratch".into(),
            output: "junk".into(),
            user_visible: false,
            meta: ExecMeta::default(),
        };
        assert!(!hidden.is_user_visible_tool_call());
    }

    #[test]
    fn exec_meta_success_includes_missing_exit_code() {
        assert!(ExecMeta::default().succeeded());
        assert!(
            !ExecMeta {
                exit_code: Some(2),
                ..ExecMeta::default()
            }
            .succeeded()
        );
    }

    #[test]
    fn trace_event_roundtrip_preserves_dedupe_key() {
        let event = TraceEvent {
            event_id: EventId::from_string("e1"),
            run_id: RunId::from_string("r1"),
            sequence: 7,
            timestamp: chrono::Utc::now(),
            correlation_id: CorrelationId::from_string("c1"),
            dedupe_key: Some("retry-abc".into()),
            kind: TraceEventKind::Message {
                role: "user".into(),
                content: "hi".into(),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: TraceEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sequence, 7);
        assert_eq!(back.dedupe_key.as_deref(), Some("retry-abc"));
    }
}
