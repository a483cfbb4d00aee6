//! Deterministic evidence compilation.
//!
//! `compile` is a trace query, not a guess: identical (scope, budget,
//! underlying trace) always yields a byte-identical bundle. Candidates are
//! ranked by a fixed order — failures first, then user-visible tool calls,
//! then recency — and included greedily until the budget runs out, tail
//! truncating the fragment that straddles the limit. The compiler never
//! interprets payload content; it only orders and truncates.

use std::sync::Arc;

use overseer_protocol::{
    CoreResult, EvidenceBudget, EvidenceMarker, RunId, TraceEvent, TraceEventKind, TraceStorePort,
};
use tracing::{debug, instrument};

use crate::bundle::{EvidenceBundle, EvidenceFragment, FragmentPriority};

const READ_PAGE: usize = 256;

/// Which worker runs are eligible for one compile call.
#[derive(Debug, Clone, Default)]
pub struct EvidenceScope {
    pub worker_runs: Vec<RunId>,
}

impl EvidenceScope {
    pub fn for_runs(worker_runs: impl IntoIterator<Item = RunId>) -> Self {
        let mut worker_runs: Vec<RunId> = worker_runs.into_iter().collect();
        worker_runs.sort();
        worker_runs.dedup();
        Self { worker_runs }
    }

    pub fn from_markers<'a>(markers: impl IntoIterator<Item = &'a EvidenceMarker>) -> Self {
        Self::for_runs(markers.into_iter().map(|m| m.run_id.clone()))
    }
}

/// Raw payload content of an event, if it carries any. Events without
/// payload content are never evidence candidates.
fn content_of(kind: &TraceEventKind) -> Option<&str> {
    match kind {
        TraceEventKind::Message { content, .. } => Some(content),
        TraceEventKind::ToolCallStarted { arguments, .. } => Some(arguments),
        TraceEventKind::ToolCallCompleted { output, .. } => Some(output),
        TraceEventKind::ToolCallFailed { error, .. } => Some(error),
        TraceEventKind::WorkerCompleted { summary, .. } => Some(summary),
        TraceEventKind::WorkerFailed { detail, .. } => Some(detail),
        TraceEventKind::RunFailed { error } => Some(error),
        TraceEventKind::RunCancelled { reason } => Some(reason),
        _ => None,
    }
}

fn priority_of(kind: &TraceEventKind) -> FragmentPriority {
    if kind.is_failure() {
        FragmentPriority::Failure
    } else if kind.is_user_visible_tool_call() {
        FragmentPriority::UserVisibleTool
    } else {
        FragmentPriority::Recent
    }
}

fn truncate_to(content: &str, max_bytes: usize, max_lines: usize) -> (String, bool) {
    let mut truncated = false;
    let mut text = content.to_owned();

    if text.lines().count() > max_lines {
        text = text
            .lines()
            .take(max_lines)
            .collect::<Vec<_>>()
            .join("\n");
        truncated = true;
    }
    if text.len() > max_bytes {
        let mut cut = max_bytes;
        while cut > 0 && !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
        truncated = true;
    }
    (text, truncated)
}

/// Pure assembly step: rank the given candidates and pack them into a
/// bundle under the budget. Deterministic for a fixed input slice.
pub fn assemble(events: Vec<TraceEvent>, budget: &EvidenceBudget) -> EvidenceBundle {
    let mut candidates: Vec<(FragmentPriority, TraceEvent)> = events
        .into_iter()
        .filter(|event| budget.window.contains(event.timestamp))
        .filter(|event| content_of(&event.kind).is_some())
        .map(|event| (priority_of(&event.kind), event))
        .collect();

    // Fixed order: priority class, then recency, with run id and sequence
    // as total tie-breakers so the order is reproducible across calls.
    candidates.sort_by(|(pa, a), (pb, b)| {
        pa.cmp(pb)
            .then(b.timestamp.cmp(&a.timestamp))
            .then(a.run_id.cmp(&b.run_id))
            .then(b.sequence.cmp(&a.sequence))
    });

    let mut bundle = EvidenceBundle::default();
    let mut remaining_bytes = budget.max_bytes;
    let mut remaining_lines = budget.max_lines;

    for (priority, event) in candidates {
        if bundle.fragments.len() >= budget.max_fragments
            || remaining_bytes == 0
            || remaining_lines == 0
        {
            bundle.dropped += 1;
            continue;
        }
        let content = content_of(&event.kind).unwrap_or_default();
        let (text, truncated) = truncate_to(content, remaining_bytes, remaining_lines);
        if text.is_empty() && !content.is_empty() {
            // Whatever budget is left cannot hold even the first character.
            bundle.dropped += 1;
            remaining_bytes = 0;
            continue;
        }
        let lines = text.lines().count();
        remaining_bytes -= text.len();
        remaining_lines = remaining_lines.saturating_sub(lines);
        bundle.bytes_used += text.len();
        bundle.lines_used += lines;
        bundle.fragments.push(EvidenceFragment {
            run_id: event.run_id,
            sequence: event.sequence,
            kind: event.kind.name().to_owned(),
            priority,
            content: text,
            truncated,
        });
    }
    bundle
}

/// Store-backed compiler: gathers in-scope events, then runs the pure
/// assembly. Read-only; callable any number of times.
#[derive(Clone)]
pub struct EvidenceCompiler {
    store: Arc<dyn TraceStorePort>,
}

impl EvidenceCompiler {
    pub fn new(store: Arc<dyn TraceStorePort>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, scope, budget), fields(runs = scope.worker_runs.len()))]
    pub async fn compile(
        &self,
        scope: &EvidenceScope,
        budget: &EvidenceBudget,
    ) -> CoreResult<EvidenceBundle> {
        let mut events = Vec::new();
        for run_id in &scope.worker_runs {
            let mut cursor = 0;
            loop {
                let batch = self.store.read(run_id.clone(), cursor, READ_PAGE).await?;
                let done = batch.len() < READ_PAGE;
                for event in batch {
                    cursor = event.sequence;
                    events.push(event);
                }
                if done {
                    break;
                }
            }
        }
        let bundle = assemble(events, budget);
        debug!(
            fragments = bundle.fragments.len(),
            bytes_used = bundle.bytes_used,
            dropped = bundle.dropped,
            "evidence compiled"
        );
        Ok(bundle)
    }

    /// Compile the evidence a set of markers points at. Marker identity
    /// beyond the run id is informational; the trace is keyed by run.
    pub async fn resolve_markers(
        &self,
        markers: &[EvidenceMarker],
        budget: &EvidenceBudget,
    ) -> CoreResult<EvidenceBundle> {
        self.compile(&EvidenceScope::from_markers(markers), budget)
            .await
    }
}
