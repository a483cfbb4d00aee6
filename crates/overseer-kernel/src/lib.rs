//! # overseer-kernel — Facade
//!
//! Wires the trace store, evidence compiler, cycle controller, and join
//! coordinator into one handle. The kernel owns the supervisor drive loop:
//! reason, fan out, suspend until the worker group converges, resume with
//! the continuation, repeat until a final answer or a failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use overseer_evidence::EvidenceCompiler;
use overseer_protocol::{
    AppendRequest, ConversationTurn, CorrelationId, EvidenceBudget, GroupId, ReasonDirective,
    ReasonerPort, RunId, RunRecord, RunStatus, SeqNo, StreamMessageStream, TimelineEntry,
    TraceEvent, TraceEventKind, WorkerLauncherPort,
};
use overseer_runtime::{
    Continuation, ConversationStore, CycleController, GroupLedger, JoinCoordinator,
};
use overseer_trace::{FileTraceStore, RunRegistry, StreamHub, TraceJournal};
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use tracing::{info, instrument, warn};

/// Grace period granted after a group deadline for the sweep-forced join
/// to land before the drive loop gives up.
const SWEEP_GRACE: Duration = Duration::from_secs(5);
const MAILBOX_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct KernelBuilder {
    root: PathBuf,
    budget: EvidenceBudget,
    worker_ttl: Duration,
    max_cycles: u32,
    heartbeat_every: Duration,
    stream_buffer: usize,
}

impl KernelBuilder {
    /// A budget must always be supplied; there is no built-in default cap.
    pub fn new(root: impl Into<PathBuf>, budget: EvidenceBudget) -> Self {
        Self {
            root: root.into(),
            budget,
            worker_ttl: Duration::from_secs(300),
            max_cycles: 16,
            heartbeat_every: Duration::from_secs(15),
            stream_buffer: 1024,
        }
    }

    /// Per-group join deadline for spawned workers.
    pub fn worker_ttl(mut self, ttl: Duration) -> Self {
        self.worker_ttl = ttl;
        self
    }

    pub fn max_cycles(mut self, max_cycles: u32) -> Self {
        self.max_cycles = max_cycles;
        self
    }

    pub fn heartbeat_every(mut self, period: Duration) -> Self {
        self.heartbeat_every = period;
        self
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer;
        self
    }

    /// Assemble the kernel. Spawns the continuation dispatcher task, so
    /// this must run inside a tokio runtime.
    pub fn build(
        self,
        reasoner: Arc<dyn ReasonerPort>,
        launcher: Arc<dyn WorkerLauncherPort>,
    ) -> OverseerKernel {
        let store = Arc::new(FileTraceStore::new(&self.root));
        let hub = StreamHub::new(self.stream_buffer);
        let journal =
            TraceJournal::new(store.clone(), hub).with_heartbeat_every(self.heartbeat_every);

        let registry = Arc::new(RunRegistry::new(&self.root));
        let ledger = Arc::new(GroupLedger::new(&self.root));
        let conversations = Arc::new(ConversationStore::new(&self.root));

        let controller = Arc::new(CycleController::new(
            conversations.clone(),
            EvidenceCompiler::new(store),
            reasoner,
        ));
        let (coordinator, continuations) = JoinCoordinator::new(
            journal.clone(),
            registry.clone(),
            ledger.clone(),
            launcher,
        );

        let mailbox = Arc::new(ContinuationMailbox::default());
        mailbox.clone().dispatch(continuations);

        OverseerKernel {
            budget: self.budget,
            worker_ttl: self.worker_ttl,
            max_cycles: self.max_cycles,
            journal,
            registry,
            conversations,
            ledger,
            controller,
            coordinator,
            mailbox,
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Routes continuations from the coordinator to whichever drive loop is
/// suspended on the matching supervisor run.
#[derive(Default)]
struct ContinuationMailbox {
    pending: Mutex<HashMap<RunId, Vec<Continuation>>>,
    notify: Notify,
}

impl ContinuationMailbox {
    fn dispatch(self: Arc<Self>, mut continuations: mpsc::Receiver<Continuation>) {
        tokio::spawn(async move {
            while let Some(continuation) = continuations.recv().await {
                self.pending
                    .lock()
                    .entry(continuation.supervisor_run_id.clone())
                    .or_default()
                    .push(continuation);
                self.notify.notify_waiters();
            }
        });
    }

    fn take(&self, run_id: &RunId) -> Option<Continuation> {
        let mut pending = self.pending.lock();
        let queue = pending.get_mut(run_id)?;
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

/// Terminal result of one submitted objective.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub answer: Option<String>,
}

#[derive(Clone)]
pub struct OverseerKernel {
    budget: EvidenceBudget,
    worker_ttl: Duration,
    max_cycles: u32,
    journal: TraceJournal,
    registry: Arc<RunRegistry>,
    conversations: Arc<ConversationStore>,
    ledger: Arc<GroupLedger>,
    controller: Arc<CycleController>,
    coordinator: JoinCoordinator,
    mailbox: Arc<ContinuationMailbox>,
    cancels: Arc<Mutex<HashMap<RunId, String>>>,
}

impl OverseerKernel {
    /// Drive one objective to completion: reasoning cycles interleaved
    /// with worker fan-out/fan-in, until a final answer, a failure, or
    /// cancellation.
    #[instrument(skip(self, objective), fields(correlation_id = %correlation_id))]
    pub async fn submit(
        &self,
        correlation_id: CorrelationId,
        objective: &str,
    ) -> Result<RunOutcome> {
        let run = self
            .registry
            .create(RunRecord::supervisor(correlation_id.clone()))
            .await
            .context("failed creating supervisor run")?;
        info!(run_id = %run.run_id, "supervisor run started");

        self.journal
            .append_and_publish(AppendRequest::new(
                run.run_id.clone(),
                correlation_id.clone(),
                TraceEventKind::RunStarted {
                    kind: run.kind,
                    parent_run_id: None,
                },
            ))
            .await?;
        self.journal
            .append_and_publish(AppendRequest::new(
                run.run_id.clone(),
                correlation_id.clone(),
                TraceEventKind::Message {
                    role: "user".to_owned(),
                    content: objective.to_owned(),
                },
            ))
            .await?;
        self.conversations
            .append(
                &run.run_id,
                ConversationTurn {
                    role: "user".to_owned(),
                    content: objective.to_owned(),
                },
            )
            .await?;

        for _ in 0..self.max_cycles {
            if let Some(reason) = self.cancel_reason(&run.run_id) {
                return self.finish_cancelled(&run, &reason).await;
            }

            let reply = match self.controller.run_cycle(&run, objective, &self.budget).await {
                Ok(reply) => reply,
                Err(error) => {
                    self.finish_failed(&run, &error.to_string()).await?;
                    return Err(error);
                }
            };

            let mut resumed = false;
            for directive in reply.directives {
                match directive {
                    ReasonDirective::FinalAnswer { text } => {
                        return self.finish_completed(&run, text).await;
                    }
                    ReasonDirective::SpawnWorkers { specs } => {
                        self.coordinator
                            .spawn_workers(
                                run.run_id.clone(),
                                correlation_id.clone(),
                                specs,
                                self.worker_ttl,
                            )
                            .await?;
                        let continuation = self.await_continuation(&run.run_id).await?;
                        self.resume_with(&run, continuation).await?;
                        resumed = true;
                    }
                }
            }
            if resumed {
                continue;
            }
            // A reply with no directives makes no progress; treat it like
            // a reasoning failure rather than spinning.
            self.finish_failed(&run, "reasoning produced no directive")
                .await?;
            bail!("reasoning produced no directive");
        }
        self.finish_failed(&run, "reasoning did not converge").await?;
        bail!("reasoning did not converge within {} cycles", self.max_cycles)
    }

    /// Suspend until the group for this run joins. Past the group deadline
    /// the sweep forces stragglers to timeout failures, which makes the
    /// join fire; this is the only blocking wait in the design.
    async fn await_continuation(&self, run_id: &RunId) -> Result<Continuation> {
        let mut deadline =
            tokio::time::Instant::now() + self.worker_ttl + Duration::from_millis(250);
        let mut swept = false;
        loop {
            if let Some(continuation) = self.mailbox.take(run_id) {
                return Ok(continuation);
            }
            if tokio::time::Instant::now() >= deadline {
                if swept {
                    bail!("worker group did not join after deadline sweep");
                }
                self.coordinator.sweep_deadlines(Utc::now()).await?;
                swept = true;
                deadline = tokio::time::Instant::now() + SWEEP_GRACE;
                continue;
            }
            let notified = self.mailbox.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(MAILBOX_POLL) => {}
            }
        }
    }

    /// Commit the continuation into the persistent conversation and bring
    /// the supervisor back to active. Partial results survive even when
    /// the run was cancelled mid-wait.
    async fn resume_with(&self, run: &RunRecord, continuation: Continuation) -> Result<()> {
        self.conversations
            .append(
                &run.run_id,
                ConversationTurn {
                    role: "system".to_owned(),
                    content: continuation.message,
                },
            )
            .await?;
        self.registry
            .transition(&run.run_id, RunStatus::Active)
            .await?;
        Ok(())
    }

    async fn finish_completed(&self, run: &RunRecord, answer: String) -> Result<RunOutcome> {
        self.journal
            .append_and_publish(AppendRequest::new(
                run.run_id.clone(),
                run.correlation_id.clone(),
                TraceEventKind::RunCompleted {
                    final_answer: Some(answer.clone()),
                },
            ))
            .await?;
        self.registry
            .transition(&run.run_id, RunStatus::Completed)
            .await?;
        info!(run_id = %run.run_id, "supervisor run completed");
        Ok(RunOutcome {
            run_id: run.run_id.clone(),
            status: RunStatus::Completed,
            answer: Some(answer),
        })
    }

    async fn finish_failed(&self, run: &RunRecord, error: &str) -> Result<()> {
        warn!(run_id = %run.run_id, error, "supervisor run failed");
        self.journal
            .append_and_publish(AppendRequest::new(
                run.run_id.clone(),
                run.correlation_id.clone(),
                TraceEventKind::RunFailed {
                    error: error.to_owned(),
                },
            ))
            .await?;
        self.registry
            .transition(&run.run_id, RunStatus::Failed)
            .await?;
        Ok(())
    }

    async fn finish_cancelled(&self, run: &RunRecord, reason: &str) -> Result<RunOutcome> {
        self.journal
            .append_and_publish(AppendRequest::new(
                run.run_id.clone(),
                run.correlation_id.clone(),
                TraceEventKind::RunCancelled {
                    reason: reason.to_owned(),
                },
            ))
            .await?;
        self.registry
            .transition(&run.run_id, RunStatus::Failed)
            .await?;
        info!(run_id = %run.run_id, reason, "supervisor run cancelled");
        Ok(RunOutcome {
            run_id: run.run_id.clone(),
            status: RunStatus::Failed,
            answer: None,
        })
    }

    fn cancel_reason(&self, run_id: &RunId) -> Option<String> {
        self.cancels.lock().get(run_id).cloned()
    }

    /// Cancel a run: no further reasoning calls are issued, every pending
    /// worker in its open groups is marked cancelled, and the join still
    /// fires so partial results reach the conversation.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn cancel(&self, run_id: &RunId, reason: &str) -> Result<()> {
        self.cancels
            .lock()
            .insert(run_id.clone(), reason.to_owned());
        self.coordinator.cancel_groups_of(run_id, reason).await?;
        Ok(())
    }

    /// Ordered, resumable subscription to one run's envelope stream.
    pub fn subscribe(&self, run_id: RunId, since_event_id: SeqNo) -> StreamMessageStream {
        self.journal.subscribe_from(run_id, since_event_id)
    }

    /// Read projection with per-event offsets for observability tooling.
    pub async fn timeline(&self, run_id: RunId) -> Result<Vec<TimelineEntry>> {
        Ok(self.journal.timeline(run_id).await?)
    }

    pub async fn read_trace(
        &self,
        run_id: RunId,
        since_sequence: SeqNo,
        limit: usize,
    ) -> Result<Vec<TraceEvent>> {
        Ok(self.journal.read(run_id, since_sequence, limit).await?)
    }

    pub async fn run_record(&self, run_id: &RunId) -> Result<RunRecord> {
        self.registry.load(run_id).await
    }

    /// Supervisor runs currently suspended on at least one open worker
    /// group, in group-creation order.
    pub async fn suspended_supervisors(&self) -> Result<Vec<RunId>> {
        let mut out: Vec<RunId> = Vec::new();
        for group in self.ledger.open_groups().await? {
            if !out.contains(&group.supervisor_run_id) {
                out.push(group.supervisor_run_id);
            }
        }
        Ok(out)
    }

    /// Re-commit joins for groups whose durable counters already reached
    /// their target before a restart.
    pub async fn recover(&self) -> Result<Vec<GroupId>> {
        self.coordinator.recover().await
    }

    /// Force-fail stragglers in every group past its deadline.
    pub async fn sweep_now(&self) -> Result<usize> {
        self.coordinator.sweep_deadlines(Utc::now()).await
    }

    /// Background sweep for deployments where nothing else drives the
    /// deadline check.
    pub fn start_sweeper(&self, period: Duration) -> tokio::task::JoinHandle<()> {
        let kernel = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(error) = kernel.sweep_now().await {
                    warn!(%error, "deadline sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::StreamExt;
    use overseer_protocol::{
        CoreResult, ExecMeta, ReasonReply, ReasonRequest, StreamMessage, WorkerAssignment,
        WorkerSpec, WorkerVerdict, scan_markers,
    };
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::fs;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    /// Reasoner that fans out once, then synthesizes a final answer
    /// embedding every marker it finds in the conversation.
    struct FanOutReasoner {
        specs: Vec<WorkerSpec>,
    }

    #[async_trait]
    impl ReasonerPort for FanOutReasoner {
        async fn reason(&self, request: ReasonRequest) -> CoreResult<ReasonReply> {
            let markers: Vec<String> = request
                .conversation
                .iter()
                .flat_map(|turn| scan_markers(&turn.content).markers)
                .map(|m| m.to_string())
                .collect();
            let directive = if markers.is_empty() {
                ReasonDirective::SpawnWorkers {
                    specs: self.specs.clone(),
                }
            } else {
                ReasonDirective::FinalAnswer {
                    text: format!("synthesis of worker evidence\n{}", markers.join("\n")),
                }
            };
            Ok(ReasonReply {
                directives: vec![directive],
            })
        }
    }

    /// Completes "ok" tasks, fails "fail" tasks, hangs on anything else.
    struct ScriptedLauncher;

    #[async_trait]
    impl WorkerLauncherPort for ScriptedLauncher {
        async fn execute(&self, assignment: WorkerAssignment) -> CoreResult<WorkerVerdict> {
            let task = assignment.spec.task;
            if task.contains("ok") {
                Ok(WorkerVerdict::Completed {
                    summary: format!("raw findings for {task}"),
                    meta: ExecMeta::default(),
                })
            } else if task.contains("fail") {
                Ok(WorkerVerdict::Failed {
                    detail: format!("broke during {task}"),
                })
            } else {
                std::future::pending().await
            }
        }
    }

    fn budget() -> EvidenceBudget {
        EvidenceBudget::new(10_000, 200, 20).unwrap()
    }

    fn kernel(root: &PathBuf, specs: Vec<WorkerSpec>, ttl: Duration) -> OverseerKernel {
        KernelBuilder::new(root, budget())
            .worker_ttl(ttl)
            .heartbeat_every(Duration::from_secs(60))
            .build(
                Arc::new(FanOutReasoner { specs }),
                Arc::new(ScriptedLauncher),
            )
    }

    #[tokio::test]
    async fn single_worker_run_completes_with_marker() -> Result<()> {
        let root = unique_test_root("overseer-kernel-single");
        let kernel = kernel(
            &root,
            vec![WorkerSpec::new("ok inspect logs")],
            Duration::from_secs(30),
        );

        let outcome = kernel
            .submit(CorrelationId::from_string("corr-1"), "inspect the logs")
            .await?;
        assert_eq!(outcome.status, RunStatus::Completed);
        let answer = outcome.answer.unwrap();
        assert_eq!(scan_markers(&answer).markers.len(), 1);

        let events = kernel.read_trace(outcome.run_id.clone(), 0, 100).await?;
        let kinds: Vec<_> = events.iter().map(|e| e.kind.name().to_owned()).collect();
        assert!(kinds.contains(&"worker_spawned".to_owned()));
        assert!(kinds.contains(&"group_joined".to_owned()));
        assert!(kinds.contains(&"continuation_enqueued".to_owned()));
        assert_eq!(kinds.last().unwrap(), "run_completed");

        assert_eq!(
            kernel.run_record(&outcome.run_id).await?.status,
            RunStatus::Completed
        );

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn partial_failure_still_synthesizes_with_three_markers() -> Result<()> {
        let root = unique_test_root("overseer-kernel-partial");
        let kernel = kernel(
            &root,
            vec![
                WorkerSpec::new("ok check configs"),
                WorkerSpec::new("fail probe network"),
                WorkerSpec::new("ok read metrics"),
            ],
            Duration::from_secs(30),
        );

        let outcome = kernel
            .submit(CorrelationId::from_string("corr-2"), "diagnose outage")
            .await?;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(scan_markers(&outcome.answer.unwrap()).markers.len(), 3);

        let events = kernel.read_trace(outcome.run_id, 0, 100).await?;
        let joined = events
            .iter()
            .find_map(|e| match &e.kind {
                TraceEventKind::GroupJoined {
                    completed, failed, ..
                } => Some((*completed, *failed)),
                _ => None,
            })
            .unwrap();
        assert_eq!(joined, (2, 1));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn straggler_is_timed_out_and_run_still_completes() -> Result<()> {
        let root = unique_test_root("overseer-kernel-straggler");
        let kernel = kernel(
            &root,
            vec![WorkerSpec::new("ok quick probe"), WorkerSpec::new("hang")],
            Duration::from_millis(100),
        );

        let outcome = kernel
            .submit(CorrelationId::from_string("corr-3"), "probe the host")
            .await?;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(scan_markers(&outcome.answer.unwrap()).markers.len(), 2);

        let events = kernel.read_trace(outcome.run_id, 0, 100).await?;
        let joined = events
            .iter()
            .find_map(|e| match &e.kind {
                TraceEventKind::GroupJoined {
                    completed, failed, ..
                } => Some((*completed, *failed)),
                _ => None,
            })
            .unwrap();
        assert_eq!(joined, (1, 1));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn raw_worker_output_never_reaches_the_conversation() -> Result<()> {
        let root = unique_test_root("overseer-kernel-prune");
        let kernel = kernel(
            &root,
            vec![WorkerSpec::new("ok gather data")],
            Duration::from_secs(30),
        );

        let outcome = kernel
            .submit(CorrelationId::from_string("corr-4"), "gather data")
            .await?;
        let turns = kernel.conversations.load(&outcome.run_id).await?;
        assert!(turns.len() >= 3);
        assert!(
            turns
                .iter()
                .all(|t| !t.content.contains("raw findings for")),
            "raw worker output leaked into persistent state"
        );
        // But the markers pointing at that output did land.
        assert!(
            turns
                .iter()
                .any(|t| !scan_markers(&t.content).markers.is_empty())
        );

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_mid_wait_preserves_partial_results() -> Result<()> {
        let root = unique_test_root("overseer-kernel-cancel");
        let kernel = kernel(
            &root,
            vec![WorkerSpec::new("ok fast"), WorkerSpec::new("hang slow")],
            Duration::from_secs(60),
        );

        let canceller = kernel.clone();
        let correlation = CorrelationId::from_string("corr-5");
        let submit = {
            let kernel = kernel.clone();
            let correlation = correlation.clone();
            tokio::spawn(async move { kernel.submit(correlation, "long objective").await })
        };

        // Let the fan-out happen, then cancel while the drive loop is
        // suspended on the join.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let suspended = canceller.suspended_supervisors().await?;
        assert_eq!(suspended.len(), 1);
        let run_id = suspended[0].clone();
        canceller.cancel(&run_id, "operator abort").await?;

        let outcome = submit.await??;
        assert_eq!(outcome.status, RunStatus::Failed);

        let turns = kernel.conversations.load(&run_id).await?;
        let continuation_turn = turns
            .iter()
            .find(|t| t.content.contains("converged"))
            .expect("partial results committed before cancellation finalized");
        assert_eq!(scan_markers(&continuation_turn.content).markers.len(), 2);

        let events = kernel.read_trace(run_id, 0, 100).await?;
        assert!(matches!(
            events.last().unwrap().kind,
            TraceEventKind::RunCancelled { .. }
        ));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn stream_subscription_replays_the_whole_run_in_order() -> Result<()> {
        let root = unique_test_root("overseer-kernel-stream");
        let kernel = kernel(
            &root,
            vec![WorkerSpec::new("ok scan")],
            Duration::from_secs(30),
        );

        let outcome = kernel
            .submit(CorrelationId::from_string("corr-6"), "scan")
            .await?;
        let head = kernel.journal.head(outcome.run_id.clone()).await?;
        assert!(head > 0);

        let mut stream = kernel.subscribe(outcome.run_id.clone(), 0);
        let mut seen = Vec::new();
        while (seen.len() as u64) < head {
            match stream.next().await.unwrap()? {
                StreamMessage::Event(envelope) => seen.push(envelope.event_id),
                StreamMessage::Heartbeat { .. } => {}
            }
        }
        assert_eq!(seen, (1..=head).collect::<Vec<_>>());

        let timeline = kernel.timeline(outcome.run_id).await?;
        assert_eq!(timeline.len(), head as usize);
        assert!(timeline.windows(2).all(|w| w[0].offset_ms <= w[1].offset_ms));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
