//! # overseer-protocol — Core Contract Crate
//!
//! Shared types, trace-event taxonomy, and trait interfaces for the
//! overseer evidence-lifecycle core.
//!
//! It is intentionally dependency-light (no runtime deps like tokio) so it
//! can be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`] — Typed ID wrappers (RunId, EventId, GroupId, CorrelationId, …)
//! - [`run`] — RunRecord, RunKind, RunStatus
//! - [`event`] — TraceEvent + TraceEventKind (forward-compatible), ExecMeta
//! - [`marker`] — EvidenceMarker token type and defensive free-text scanner
//! - [`budget`] — EvidenceBudget, TimeWindow
//! - [`envelope`] — StreamEnvelope, StreamMessage, TimelineEntry
//! - [`ports`] — Runtime boundary ports (trace store, reasoner, launcher)
//! - [`error`] — CoreError, CoreResult

pub mod budget;
pub mod envelope;
pub mod error;
pub mod event;
pub mod ids;
pub mod marker;
pub mod ports;
pub mod run;

// Re-export the most commonly used types at the crate root.
pub use budget::{EvidenceBudget, TimeWindow};
pub use envelope::{StreamEnvelope, StreamMessage, TimelineEntry};
pub use error::{CoreError, CoreResult};
pub use event::{ExecMeta, TraceEvent, TraceEventKind, WorkerFailureKind};
pub use ids::{CorrelationId, EventId, GroupId, RunId, SeqNo, ToolCallId, WorkerId};
pub use marker::{EvidenceMarker, MarkerScan, scan_markers};
pub use ports::{
    AppendRequest, ConversationTurn, ReasonDirective, ReasonReply, ReasonRequest, ReasonerPort,
    StreamMessageStream, TraceStorePort, WorkerAssignment, WorkerLauncherPort, WorkerSpec,
    WorkerVerdict,
};
pub use run::{RunKind, RunRecord, RunStatus};
