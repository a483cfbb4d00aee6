//! Continuation and join coordination.
//!
//! Decides exactly when a supervisor resumes after fanning out to workers.
//! Every worker reports its terminal outcome under the group's critical
//! section; the report that makes `completed + failed == target` true is
//! the sole trigger of the continuation. Duplicate reports are no-ops, and
//! a single-worker group takes the same path as a ten-worker one.
//!
//! Durability order inside a report: terminal trace event (idempotent by
//! dedupe key), then counters, then the join commit, then the `joined`
//! flag. A crash between the last two leaves a group whose durable counts
//! already equal the target, which `recover` re-commits idempotently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use chrono::{DateTime, TimeDelta, Utc};
use overseer_protocol::{
    AppendRequest, CorrelationId, EvidenceMarker, ExecMeta, GroupId, RunId, RunRecord, RunStatus,
    TraceEventKind, WorkerAssignment, WorkerFailureKind, WorkerId, WorkerLauncherPort, WorkerSpec,
    WorkerVerdict,
};
use overseer_trace::{RunRegistry, TraceJournal};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::group::{GroupLedger, WorkerGroup, WorkerOutcome};

/// A "resume the supervisor" action, enqueued at most once per group.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub group_id: GroupId,
    pub supervisor_run_id: RunId,
    /// Continuation text embedding one evidence marker per worker.
    pub message: String,
}

/// Terminal outcome as reported to the coordinator.
#[derive(Debug, Clone)]
pub enum WorkerReport {
    Completed { summary: String, meta: ExecMeta },
    Failed {
        kind: WorkerFailureKind,
        detail: String,
    },
}

#[derive(Clone)]
pub struct JoinCoordinator {
    journal: TraceJournal,
    registry: Arc<RunRegistry>,
    ledger: Arc<GroupLedger>,
    launcher: Arc<dyn WorkerLauncherPort>,
    continuations: mpsc::Sender<Continuation>,
}

impl JoinCoordinator {
    pub fn new(
        journal: TraceJournal,
        registry: Arc<RunRegistry>,
        ledger: Arc<GroupLedger>,
        launcher: Arc<dyn WorkerLauncherPort>,
    ) -> (Self, mpsc::Receiver<Continuation>) {
        let (continuations, receiver) = mpsc::channel(32);
        (
            Self {
                journal,
                registry,
                ledger,
                launcher,
                continuations,
            },
            receiver,
        )
    }

    /// Fan out: create one group with target = specs.len(), a worker run
    /// per spec, and launch every task. The supervisor run is deferred
    /// until the group joins.
    #[instrument(skip(self, specs), fields(supervisor = %supervisor_run_id, count = specs.len()))]
    pub async fn spawn_workers(
        &self,
        supervisor_run_id: RunId,
        correlation_id: CorrelationId,
        specs: Vec<WorkerSpec>,
        ttl: Duration,
    ) -> Result<GroupId> {
        ensure!(!specs.is_empty(), "cannot spawn an empty worker group");

        let deadline =
            Utc::now() + TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::days(365));
        let mut group = WorkerGroup::new(supervisor_run_id.clone(), correlation_id.clone(), deadline);

        let mut assignments = Vec::with_capacity(specs.len());
        for spec in specs {
            let record = self
                .registry
                .create(RunRecord::worker(
                    supervisor_run_id.clone(),
                    correlation_id.clone(),
                ))
                .await
                .context("failed creating worker run")?;
            let slot = group.add_worker(record.run_id.clone(), spec.task.clone());
            let worker_id = slot.worker_id.clone();

            self.journal
                .append_and_publish(AppendRequest::new(
                    record.run_id.clone(),
                    correlation_id.clone(),
                    TraceEventKind::RunStarted {
                        kind: record.kind,
                        parent_run_id: record.parent_run_id.clone(),
                    },
                ))
                .await?;
            self.journal
                .append_and_publish(AppendRequest::new(
                    supervisor_run_id.clone(),
                    correlation_id.clone(),
                    TraceEventKind::WorkerSpawned {
                        group_id: group.group_id.clone(),
                        worker_run_id: record.run_id.clone(),
                        worker_id: worker_id.clone(),
                        task: spec.task.clone(),
                    },
                ))
                .await?;

            assignments.push(WorkerAssignment {
                group_id: group.group_id.clone(),
                worker_run_id: record.run_id,
                worker_id,
                correlation_id: correlation_id.clone(),
                spec,
            });
        }

        self.ledger.save(&group).await?;
        self.registry
            .transition(&supervisor_run_id, RunStatus::Deferred)
            .await
            .context("failed deferring supervisor run")?;
        info!(group_id = %group.group_id, target = group.target, "worker group spawned");

        for assignment in assignments {
            let coordinator = self.clone();
            tokio::spawn(async move {
                let group_id = assignment.group_id.clone();
                let worker_id = assignment.worker_id.clone();
                let report = match coordinator.launcher.execute(assignment).await {
                    Ok(WorkerVerdict::Completed { summary, meta }) => {
                        WorkerReport::Completed { summary, meta }
                    }
                    Ok(WorkerVerdict::Failed { detail }) => WorkerReport::Failed {
                        kind: WorkerFailureKind::Error,
                        detail,
                    },
                    Err(error) => WorkerReport::Failed {
                        kind: WorkerFailureKind::Error,
                        detail: error.to_string(),
                    },
                };
                if let Err(error) = coordinator.report(&group_id, &worker_id, report).await {
                    warn!(%group_id, %worker_id, %error, "worker report failed");
                }
            });
        }
        Ok(group.group_id)
    }

    /// Record one worker's terminal outcome. Returns true when this report
    /// committed the join. Reports for workers that already have an
    /// outcome, or for groups already joined, are no-ops.
    #[instrument(skip(self, report), fields(group_id = %group_id, worker_id = %worker_id))]
    pub async fn report(
        &self,
        group_id: &GroupId,
        worker_id: &WorkerId,
        report: WorkerReport,
    ) -> Result<bool> {
        let lock = self.ledger.lock_for(group_id);
        let _guard = lock.lock().await;

        let mut group = self.ledger.load(group_id).await?;
        if group.joined {
            debug!("report after join ignored");
            return Ok(false);
        }
        let Some(slot) = group.slot(worker_id) else {
            warn!("report for unknown worker ignored");
            return Ok(false);
        };
        if slot.outcome.is_some() {
            debug!("duplicate report ignored");
            return Ok(false);
        }

        let worker_run_id = slot.worker_run_id.clone();
        let dedupe = format!("terminal:{group_id}:{worker_id}");
        let marker = EvidenceMarker::new(worker_run_id.clone(), group_id.clone(), worker_id.clone());

        let outcome = match report {
            WorkerReport::Completed { summary, meta } => {
                let event = self
                    .journal
                    .append_and_publish(
                        AppendRequest::new(
                            worker_run_id.clone(),
                            group.correlation_id.clone(),
                            TraceEventKind::WorkerCompleted {
                                group_id: group_id.clone(),
                                worker_run_id: worker_run_id.clone(),
                                worker_id: worker_id.clone(),
                                summary: format!("{summary}\n{marker}"),
                                meta,
                            },
                        )
                        .with_dedupe_key(&dedupe),
                    )
                    .await?;
                self.registry
                    .transition(&worker_run_id, RunStatus::Completed)
                    .await?;
                group.completed += 1;
                WorkerOutcome::Completed {
                    terminal_sequence: event.sequence,
                }
            }
            WorkerReport::Failed { kind, detail } => {
                let event = self
                    .journal
                    .append_and_publish(
                        AppendRequest::new(
                            worker_run_id.clone(),
                            group.correlation_id.clone(),
                            TraceEventKind::WorkerFailed {
                                group_id: group_id.clone(),
                                worker_run_id: worker_run_id.clone(),
                                worker_id: worker_id.clone(),
                                reason: kind,
                                detail: format!("{detail}\n{marker}"),
                            },
                        )
                        .with_dedupe_key(&dedupe),
                    )
                    .await?;
                self.registry
                    .transition(&worker_run_id, RunStatus::Failed)
                    .await?;
                group.failed += 1;
                WorkerOutcome::Failed {
                    kind,
                    terminal_sequence: event.sequence,
                }
            }
        };
        if let Some(slot) = group.slot_mut(worker_id) {
            slot.outcome = Some(outcome);
        }

        // Counters hit disk before the join commit; recovery recomputes
        // joinability from these durable counts.
        self.ledger.save(&group).await?;

        if group.is_joinable() {
            self.commit_join(&mut group).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Commit the single continuation for a joinable group: GroupJoined and
    /// ContinuationEnqueued trace events (idempotent by dedupe key), the
    /// continuation handoff, then the durable `joined` flag.
    async fn commit_join(&self, group: &mut WorkerGroup) -> Result<()> {
        let group_id = group.group_id.clone();
        self.journal
            .append_and_publish(
                AppendRequest::new(
                    group.supervisor_run_id.clone(),
                    group.correlation_id.clone(),
                    TraceEventKind::GroupJoined {
                        group_id: group_id.clone(),
                        completed: group.completed,
                        failed: group.failed,
                    },
                )
                .with_dedupe_key(format!("joined:{group_id}")),
            )
            .await?;

        let message = continuation_message(group);
        self.journal
            .append_and_publish(
                AppendRequest::new(
                    group.supervisor_run_id.clone(),
                    group.correlation_id.clone(),
                    TraceEventKind::ContinuationEnqueued {
                        group_id: group_id.clone(),
                        message: message.clone(),
                    },
                )
                .with_dedupe_key(format!("continuation:{group_id}")),
            )
            .await?;

        if self
            .continuations
            .send(Continuation {
                group_id: group_id.clone(),
                supervisor_run_id: group.supervisor_run_id.clone(),
                message,
            })
            .await
            .is_err()
        {
            warn!(%group_id, "continuation receiver dropped");
        }

        group.joined = true;
        self.ledger.save(group).await?;
        info!(%group_id, completed = group.completed, failed = group.failed, "group joined");
        Ok(())
    }

    /// Force-fail every pending worker of every group whose deadline has
    /// passed, allowing the group to join despite stragglers. Returns the
    /// number of groups swept.
    #[instrument(skip(self))]
    pub async fn sweep_deadlines(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut swept = 0;
        for group in self.ledger.open_groups().await? {
            if !group.is_past_deadline(now) {
                continue;
            }
            swept += 1;
            for slot in group.workers.iter().filter(|s| s.outcome.is_none()) {
                self.report(
                    &group.group_id,
                    &slot.worker_id,
                    WorkerReport::Failed {
                        kind: WorkerFailureKind::Timeout,
                        detail: "no report before group deadline".to_owned(),
                    },
                )
                .await?;
            }
        }
        Ok(swept)
    }

    /// Cancel every pending worker in every open group of one supervisor.
    /// The join protocol still runs, so partial results are preserved.
    #[instrument(skip(self), fields(supervisor = %supervisor_run_id))]
    pub async fn cancel_groups_of(&self, supervisor_run_id: &RunId, reason: &str) -> Result<usize> {
        let mut cancelled = 0;
        for group in self.ledger.open_groups().await? {
            if &group.supervisor_run_id != supervisor_run_id {
                continue;
            }
            cancelled += 1;
            for slot in group.workers.iter().filter(|s| s.outcome.is_none()) {
                self.report(
                    &group.group_id,
                    &slot.worker_id,
                    WorkerReport::Failed {
                        kind: WorkerFailureKind::Cancelled,
                        detail: reason.to_owned(),
                    },
                )
                .await?;
            }
        }
        Ok(cancelled)
    }

    /// Crash recovery: re-commit the join for any group whose durable
    /// counts already equal its target. Idempotent thanks to the dedupe
    /// keys on the join events.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<GroupId>> {
        let mut committed = Vec::new();
        for open in self.ledger.open_groups().await? {
            let lock = self.ledger.lock_for(&open.group_id);
            let _guard = lock.lock().await;
            let mut group = self.ledger.load(&open.group_id).await?;
            if group.is_joinable() {
                self.commit_join(&mut group).await?;
                committed.push(group.group_id);
            }
        }
        if !committed.is_empty() {
            info!(count = committed.len(), "joins re-committed after restart");
        }
        Ok(committed)
    }
}

fn continuation_message(group: &WorkerGroup) -> String {
    let mut message = format!(
        "Worker group {} converged: {} completed, {} failed of {} spawned.",
        group.group_id, group.completed, group.failed, group.target
    );
    for (slot, marker) in group.workers.iter().zip(group.markers()) {
        let status = match &slot.outcome {
            Some(WorkerOutcome::Completed { .. }) => "completed".to_owned(),
            Some(WorkerOutcome::Failed { kind, .. }) => {
                format!("failed ({})", failure_label(*kind))
            }
            None => "unreported".to_owned(),
        };
        message.push_str(&format!("\n- worker {} {}: {}", slot.worker_id, status, marker));
    }
    message
}

fn failure_label(kind: WorkerFailureKind) -> &'static str {
    match kind {
        WorkerFailureKind::Error => "error",
        WorkerFailureKind::Timeout => "timeout",
        WorkerFailureKind::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use overseer_protocol::{CoreResult, scan_markers};
    use overseer_trace::{FileTraceStore, StreamHub};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tokio::fs;
    use tokio::time::timeout;

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    /// Launcher that completes tasks containing "ok", fails tasks
    /// containing "fail", and hangs forever otherwise.
    struct ScriptedLauncher;

    #[async_trait]
    impl WorkerLauncherPort for ScriptedLauncher {
        async fn execute(&self, assignment: WorkerAssignment) -> CoreResult<WorkerVerdict> {
            let task = assignment.spec.task;
            if task.contains("ok") {
                Ok(WorkerVerdict::Completed {
                    summary: format!("done: {task}"),
                    meta: ExecMeta::default(),
                })
            } else if task.contains("fail") {
                Ok(WorkerVerdict::Failed {
                    detail: format!("broke: {task}"),
                })
            } else {
                std::future::pending().await
            }
        }
    }

    struct Fixture {
        coordinator: JoinCoordinator,
        continuations: mpsc::Receiver<Continuation>,
        registry: Arc<RunRegistry>,
        ledger: Arc<GroupLedger>,
        journal: TraceJournal,
        root: PathBuf,
    }

    async fn fixture(name: &str) -> Fixture {
        let root = unique_test_root(name);
        let journal = TraceJournal::new(
            Arc::new(FileTraceStore::new(&root)),
            StreamHub::new(64),
        );
        let registry = Arc::new(RunRegistry::new(&root));
        let ledger = Arc::new(GroupLedger::new(&root));
        let (coordinator, continuations) = JoinCoordinator::new(
            journal.clone(),
            registry.clone(),
            ledger.clone(),
            Arc::new(ScriptedLauncher),
        );
        Fixture {
            coordinator,
            continuations,
            registry,
            ledger,
            journal,
            root,
        }
    }

    async fn supervisor(registry: &RunRegistry) -> RunRecord {
        registry
            .create(RunRecord::supervisor(CorrelationId::from_string("corr")))
            .await
            .unwrap()
    }

    async fn recv(continuations: &mut mpsc::Receiver<Continuation>) -> Continuation {
        timeout(Duration::from_secs(5), continuations.recv())
            .await
            .expect("continuation within deadline")
            .expect("channel open")
    }

    #[tokio::test]
    async fn single_worker_success_fires_one_continuation() -> Result<()> {
        let mut fx = fixture("overseer-join-single").await;
        let sup = supervisor(&fx.registry).await;

        let group_id = fx
            .coordinator
            .spawn_workers(
                sup.run_id.clone(),
                sup.correlation_id.clone(),
                vec![WorkerSpec::new("ok task")],
                Duration::from_secs(60),
            )
            .await?;

        let continuation = recv(&mut fx.continuations).await;
        assert_eq!(continuation.group_id, group_id);
        assert_eq!(continuation.supervisor_run_id, sup.run_id);
        let scan = scan_markers(&continuation.message);
        assert_eq!(scan.markers.len(), 1);
        assert_eq!(scan.markers[0].job_id, group_id);

        // Exactly one continuation, ever.
        assert!(fx.continuations.try_recv().is_err());
        assert!(fx.ledger.load(&group_id).await?.joined);

        let _ = fs::remove_dir_all(fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn partial_failure_joins_with_marker_per_worker() -> Result<()> {
        let mut fx = fixture("overseer-join-partial").await;
        let sup = supervisor(&fx.registry).await;

        let group_id = fx
            .coordinator
            .spawn_workers(
                sup.run_id.clone(),
                sup.correlation_id.clone(),
                vec![
                    WorkerSpec::new("ok one"),
                    WorkerSpec::new("fail two"),
                    WorkerSpec::new("ok three"),
                ],
                Duration::from_secs(60),
            )
            .await?;

        let continuation = recv(&mut fx.continuations).await;
        let scan = scan_markers(&continuation.message);
        assert_eq!(scan.markers.len(), 3);
        assert!(continuation.message.contains("2 completed, 1 failed"));

        let group = fx.ledger.load(&group_id).await?;
        assert_eq!((group.completed, group.failed), (2, 1));

        // The failed worker's trace ends in a failure event carrying its
        // own marker.
        let failed_slot = group
            .workers
            .iter()
            .find(|s| matches!(s.outcome, Some(WorkerOutcome::Failed { .. })))
            .unwrap();
        let events = fx
            .journal
            .read(failed_slot.worker_run_id.clone(), 0, 100)
            .await?;
        let last = events.last().unwrap();
        assert!(matches!(last.kind, TraceEventKind::WorkerFailed { .. }));

        let _ = fs::remove_dir_all(fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn straggler_is_swept_to_timeout_failure() -> Result<()> {
        let mut fx = fixture("overseer-join-straggler").await;
        let sup = supervisor(&fx.registry).await;

        let group_id = fx
            .coordinator
            .spawn_workers(
                sup.run_id.clone(),
                sup.correlation_id.clone(),
                vec![WorkerSpec::new("ok quick"), WorkerSpec::new("hang forever")],
                Duration::from_millis(10),
            )
            .await?;

        // Give the quick worker a moment to report, then sweep past the
        // deadline.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let swept = fx
            .coordinator
            .sweep_deadlines(Utc::now() + TimeDelta::seconds(1))
            .await?;
        assert_eq!(swept, 1);

        let continuation = recv(&mut fx.continuations).await;
        assert!(continuation.message.contains("1 completed, 1 failed"));
        assert!(continuation.message.contains("timeout"));

        let group = fx.ledger.load(&group_id).await?;
        assert!(group.joined);
        assert!(group.workers.iter().any(|s| matches!(
            s.outcome,
            Some(WorkerOutcome::Failed {
                kind: WorkerFailureKind::Timeout,
                ..
            })
        )));

        let _ = fs::remove_dir_all(fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_reports_are_no_ops() -> Result<()> {
        let mut fx = fixture("overseer-join-duplicate").await;
        let sup = supervisor(&fx.registry).await;

        let group_id = fx
            .coordinator
            .spawn_workers(
                sup.run_id.clone(),
                sup.correlation_id.clone(),
                vec![WorkerSpec::new("hang a"), WorkerSpec::new("hang b")],
                Duration::from_secs(60),
            )
            .await?;

        let w0 = WorkerId::from_string("w0");
        let report = || WorkerReport::Completed {
            summary: "done".to_owned(),
            meta: ExecMeta::default(),
        };
        assert!(!fx.coordinator.report(&group_id, &w0, report()).await?);
        // Retried delivery of the same report changes nothing.
        assert!(!fx.coordinator.report(&group_id, &w0, report()).await?);
        assert_eq!(fx.ledger.load(&group_id).await?.completed, 1);

        let triggered = fx
            .coordinator
            .report(&group_id, &WorkerId::from_string("w1"), report())
            .await?;
        assert!(triggered);
        recv(&mut fx.continuations).await;
        assert!(fx.continuations.try_recv().is_err());

        // Late report after the join is also a no-op.
        assert!(!fx.coordinator.report(&group_id, &w0, report()).await?);

        let _ = fs::remove_dir_all(fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn recovery_recommits_join_from_durable_counts() -> Result<()> {
        let mut fx = fixture("overseer-join-recover").await;
        let sup = supervisor(&fx.registry).await;

        // A group that crashed after its counters were persisted but
        // before the join was committed.
        let mut group = WorkerGroup::new(
            sup.run_id.clone(),
            sup.correlation_id.clone(),
            Utc::now() + TimeDelta::minutes(5),
        );
        group.add_worker(RunId::new_uuid(), "done before crash".to_owned());
        group.completed = 1;
        if let Some(slot) = group.workers.first_mut() {
            slot.outcome = Some(WorkerOutcome::Completed {
                terminal_sequence: 1,
            });
        }
        fx.ledger.save(&group).await?;

        let committed = fx.coordinator.recover().await?;
        assert_eq!(committed, vec![group.group_id.clone()]);
        let continuation = recv(&mut fx.continuations).await;
        assert_eq!(scan_markers(&continuation.message).markers.len(), 1);

        // A second recovery pass finds nothing open.
        assert!(fx.coordinator.recover().await?.is_empty());
        assert!(fx.continuations.try_recv().is_err());

        let _ = fs::remove_dir_all(fx.root).await;
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_preserves_partial_results() -> Result<()> {
        let mut fx = fixture("overseer-join-cancel").await;
        let sup = supervisor(&fx.registry).await;

        let group_id = fx
            .coordinator
            .spawn_workers(
                sup.run_id.clone(),
                sup.correlation_id.clone(),
                vec![WorkerSpec::new("hang a"), WorkerSpec::new("hang b")],
                Duration::from_secs(60),
            )
            .await?;

        fx.coordinator
            .report(
                &group_id,
                &WorkerId::from_string("w0"),
                WorkerReport::Completed {
                    summary: "partial result".to_owned(),
                    meta: ExecMeta::default(),
                },
            )
            .await?;

        let cancelled = fx
            .coordinator
            .cancel_groups_of(&sup.run_id, "user requested stop")
            .await?;
        assert_eq!(cancelled, 1);

        let continuation = recv(&mut fx.continuations).await;
        assert!(continuation.message.contains("1 completed, 1 failed"));
        assert!(continuation.message.contains("cancelled"));
        assert_eq!(scan_markers(&continuation.message).markers.len(), 2);

        let _ = fs::remove_dir_all(fx.root).await;
        Ok(())
    }
}
