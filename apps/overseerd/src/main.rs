use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use futures_util::StreamExt;
use overseer_kernel::KernelBuilder;
use overseer_protocol::{
    CoreResult, CorrelationId, EvidenceBudget, ExecMeta, ReasonDirective, ReasonReply,
    ReasonRequest, ReasonerPort, StreamMessage, WorkerAssignment, WorkerLauncherPort, WorkerSpec,
    WorkerVerdict, scan_markers,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "overseerd")]
#[command(about = "Overseer convergence-core demo daemon")]
struct Cli {
    #[arg(long, default_value = ".overseer")]
    root: PathBuf,
    #[arg(long, default_value = "Investigate the elevated error rate")]
    objective: String,
    /// How many workers the demo reasoner fans out to.
    #[arg(long, default_value_t = 3)]
    workers: u32,
    /// Make one worker fail, to demonstrate partial-failure convergence.
    #[arg(long, default_value_t = false)]
    simulate_failure: bool,
    #[arg(long, default_value_t = 16_384)]
    budget_bytes: usize,
    #[arg(long, default_value_t = 256)]
    budget_lines: usize,
    #[arg(long, default_value_t = 32)]
    budget_fragments: usize,
    #[arg(long, default_value_t = 60)]
    worker_ttl_secs: u64,
}

/// Demo reasoner: fans out once, then synthesizes an answer that embeds
/// the evidence marker of every worker it sees in the conversation.
struct DemoReasoner {
    specs: Vec<WorkerSpec>,
}

#[async_trait]
impl ReasonerPort for DemoReasoner {
    async fn reason(&self, request: ReasonRequest) -> CoreResult<ReasonReply> {
        let markers: Vec<String> = request
            .conversation
            .iter()
            .flat_map(|turn| scan_markers(&turn.content).markers)
            .map(|marker| marker.to_string())
            .collect();
        let directive = if markers.is_empty() {
            ReasonDirective::SpawnWorkers {
                specs: self.specs.clone(),
            }
        } else {
            let evidence_note = match request.mounted_evidence {
                Some(mounted) => format!("{} bytes of evidence mounted", mounted.len()),
                None => "no evidence mounted".to_owned(),
            };
            ReasonDirective::FinalAnswer {
                text: format!(
                    "Findings synthesized from {} workers ({evidence_note}).\n{}",
                    markers.len(),
                    markers.join("\n")
                ),
            }
        };
        Ok(ReasonReply {
            directives: vec![directive],
        })
    }
}

/// Demo launcher: pretends to do exploratory work, then reports a summary
/// (or a failure for tasks marked flaky).
struct DemoLauncher;

#[async_trait]
impl WorkerLauncherPort for DemoLauncher {
    async fn execute(&self, assignment: WorkerAssignment) -> CoreResult<WorkerVerdict> {
        let task = assignment.spec.task;
        tokio::time::sleep(Duration::from_millis(150)).await;
        if task.contains("flaky") {
            return Ok(WorkerVerdict::Failed {
                detail: format!("probe crashed during: {task}"),
            });
        }
        Ok(WorkerVerdict::Completed {
            summary: format!("simulated findings for: {task}"),
            meta: ExecMeta {
                exit_code: Some(0),
                duration_ms: 150,
                bytes: 64,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .compact()
        .init();

    let cli = Cli::parse();

    let budget =
        EvidenceBudget::new(cli.budget_bytes, cli.budget_lines, cli.budget_fragments)?;
    let specs: Vec<WorkerSpec> = (0..cli.workers)
        .map(|i| {
            let flaky = cli.simulate_failure && i == 0;
            let label = if flaky { "flaky" } else { "steady" };
            WorkerSpec::new(format!("{label} probe shard {i}"))
        })
        .collect();

    let kernel = KernelBuilder::new(&cli.root, budget)
        .worker_ttl(Duration::from_secs(cli.worker_ttl_secs))
        .build(Arc::new(DemoReasoner { specs }), Arc::new(DemoLauncher));

    let recovered = kernel.recover().await?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "joins re-committed from a previous crash");
    }
    let sweeper = kernel.start_sweeper(Duration::from_secs(1));

    let correlation_id = CorrelationId::new_uuid();
    let outcome = kernel.submit(correlation_id, &cli.objective).await?;
    info!(run_id = %outcome.run_id, status = ?outcome.status, "run finished");
    if let Some(answer) = &outcome.answer {
        info!(answer = %answer, "final answer");
    }

    // Replay the whole run from the stream projection, then show the
    // timeline offsets external tooling would see.
    let head = kernel
        .read_trace(outcome.run_id.clone(), 0, usize::MAX)
        .await?
        .len() as u64;
    let mut stream = kernel.subscribe(outcome.run_id.clone(), 0);
    let mut replayed = 0;
    while replayed < head {
        match stream.next().await.transpose()? {
            Some(StreamMessage::Event(envelope)) => {
                replayed = envelope.event_id;
                info!(
                    event_id = envelope.event_id,
                    kind = %envelope.kind,
                    "event.replayed"
                );
            }
            Some(StreamMessage::Heartbeat { last_event_id, .. }) => {
                info!(last_event_id, "heartbeat");
            }
            None => break,
        }
    }

    for entry in kernel.timeline(outcome.run_id).await? {
        info!(
            event_id = entry.envelope.event_id,
            kind = %entry.envelope.kind,
            offset_ms = entry.offset_ms,
            delta_ms = entry.delta_ms,
            "timeline"
        );
    }

    sweeper.abort();
    if let Err(error) = sweeper.await {
        if !error.is_cancelled() {
            warn!(%error, "sweeper stopped");
        }
    }
    Ok(())
}
