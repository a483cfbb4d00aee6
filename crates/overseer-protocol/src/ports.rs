//! Runtime boundary ports.
//!
//! These traits define the only allowed runtime boundary between the core
//! and external implementations: the durable trace store, the opaque
//! reasoning capability, and whatever actually performs worker tasks.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.
//! - Streaming uses boxed trait objects (`StreamMessageStream`).

use crate::envelope::StreamMessage;
use crate::error::CoreResult;
use crate::event::{ExecMeta, TraceEvent, TraceEventKind};
use crate::ids::{CorrelationId, GroupId, RunId, SeqNo, WorkerId};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub type StreamMessageStream = BoxStream<'static, CoreResult<StreamMessage>>;

/// Append request: everything the caller decides, nothing the store
/// assigns. The store supplies event id, sequence, and timestamp.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub run_id: RunId,
    pub correlation_id: CorrelationId,
    /// Idempotency key for retried appends.
    pub dedupe_key: Option<String>,
    pub kind: TraceEventKind,
}

impl AppendRequest {
    pub fn new(run_id: RunId, correlation_id: CorrelationId, kind: TraceEventKind) -> Self {
        Self {
            run_id,
            correlation_id,
            dedupe_key: None,
            kind,
        }
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Durable, append-only trace storage.
#[async_trait]
pub trait TraceStorePort: Send + Sync {
    /// Durably append one event and return it with its assigned sequence.
    /// Idempotent under retry when `dedupe_key` is set.
    async fn append(&self, request: AppendRequest) -> CoreResult<TraceEvent>;

    /// Read events of one run with sequence strictly greater than
    /// `since_sequence`, in sequence order, up to `limit`.
    async fn read(
        &self,
        run_id: RunId,
        since_sequence: SeqNo,
        limit: usize,
    ) -> CoreResult<Vec<TraceEvent>>;

    /// Highest sequence written for the run (0 when empty).
    async fn head(&self, run_id: RunId) -> CoreResult<SeqNo>;
}

/// One worker's task description as produced by the reasoning capability.
/// Opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub task: String,
    #[serde(default)]
    pub worker_type: Option<String>,
}

impl WorkerSpec {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            worker_type: None,
        }
    }
}

/// A persistent-context entry handed to the reasoning capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

/// Input to one reasoning call: the persistent conversation plus an
/// ephemeral mounted-evidence layer that is never written back.
#[derive(Debug, Clone)]
pub struct ReasonRequest {
    pub run_id: RunId,
    pub objective: String,
    pub conversation: Vec<ConversationTurn>,
    /// Rendered evidence bundle, or an explicit placeholder when mounting
    /// degraded. `None` only when the step had no evidence in scope.
    pub mounted_evidence: Option<String>,
}

/// What a reasoning call decided to do next.
#[derive(Debug, Clone)]
pub enum ReasonDirective {
    /// Fan out to parallel workers and suspend until they converge.
    SpawnWorkers { specs: Vec<WorkerSpec> },
    /// Produce the user-facing answer and finish the run.
    FinalAnswer { text: String },
}

#[derive(Debug, Clone, Default)]
pub struct ReasonReply {
    pub directives: Vec<ReasonDirective>,
}

/// The opaque natural-language reasoning capability.
#[async_trait]
pub trait ReasonerPort: Send + Sync {
    async fn reason(&self, request: ReasonRequest) -> CoreResult<ReasonReply>;
}

/// Everything a launcher needs to execute one worker's task.
#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    pub group_id: GroupId,
    pub worker_run_id: RunId,
    pub worker_id: WorkerId,
    pub correlation_id: CorrelationId,
    pub spec: WorkerSpec,
}

/// Terminal outcome of a worker's task as observed by its launcher.
#[derive(Debug, Clone)]
pub enum WorkerVerdict {
    Completed { summary: String, meta: ExecMeta },
    Failed { detail: String },
}

/// Executes worker tasks. Implementations write their own tool-level trace
/// events through a journal handle they hold; the coordinator owns the
/// spawn/terminal events.
#[async_trait]
pub trait WorkerLauncherPort: Send + Sync {
    async fn execute(&self, assignment: WorkerAssignment) -> CoreResult<WorkerVerdict>;
}
