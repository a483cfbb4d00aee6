//! The mount/reason/prune cycle.
//!
//! Every reasoning call, not just the first of a run, goes through the full
//! cycle: resolve the markers present in the persistent conversation into a
//! freshly compiled evidence bundle, mount it as an ephemeral layer, invoke
//! the reasoning capability, then commit only answer text back. The bundle
//! itself dies with the call scope, on every path including errors.
//!
//! Mount failures degrade to an explicit placeholder instead of blocking
//! the run; reasoning failures abort the cycle before anything is pruned,
//! so no partial persistent write can occur.

use std::sync::Arc;

use anyhow::{Context, Result};
use overseer_evidence::EvidenceCompiler;
use overseer_protocol::{
    ConversationTurn, EvidenceBudget, EvidenceMarker, ReasonDirective, ReasonReply, ReasonRequest,
    ReasonerPort, RunRecord, scan_markers,
};
use tracing::{debug, instrument, warn};

use crate::conversation::ConversationStore;

/// Placeholder mounted when evidence cannot be compiled. The reasoning
/// capability sees that evidence was expected and is missing, rather than
/// silently reasoning over nothing.
pub const EVIDENCE_UNAVAILABLE: &str = "[evidence unavailable]";

pub struct CycleController {
    conversations: Arc<ConversationStore>,
    compiler: EvidenceCompiler,
    reasoner: Arc<dyn ReasonerPort>,
}

impl CycleController {
    pub fn new(
        conversations: Arc<ConversationStore>,
        compiler: EvidenceCompiler,
        reasoner: Arc<dyn ReasonerPort>,
    ) -> Self {
        Self {
            conversations,
            compiler,
            reasoner,
        }
    }

    /// Run one full cycle for `run`. Returns the reasoning directives; the
    /// caller decides what fan-out or completion they imply.
    #[instrument(skip(self, run, budget), fields(run_id = %run.run_id))]
    pub async fn run_cycle(
        &self,
        run: &RunRecord,
        objective: &str,
        budget: &EvidenceBudget,
    ) -> Result<ReasonReply> {
        debug!(phase = "mounting");
        let conversation = self.conversations.load(&run.run_id).await?;
        let markers = self.collect_markers(&conversation);
        let mounted = self.mount(&markers, budget).await;

        debug!(phase = "reasoning", markers = markers.len());
        let request = ReasonRequest {
            run_id: run.run_id.clone(),
            objective: objective.to_owned(),
            conversation,
            mounted_evidence: mounted,
        };
        // On error the mounted layer is dropped with this scope and the
        // conversation is left exactly as loaded.
        let reply = self
            .reasoner
            .reason(request)
            .await
            .context("reasoning call failed")?;

        debug!(phase = "pruning", directives = reply.directives.len());
        for directive in &reply.directives {
            if let ReasonDirective::FinalAnswer { text } = directive {
                self.conversations
                    .append(
                        &run.run_id,
                        ConversationTurn {
                            role: "assistant".to_owned(),
                            content: text.clone(),
                        },
                    )
                    .await?;
            }
        }
        Ok(reply)
    }

    fn collect_markers(&self, conversation: &[ConversationTurn]) -> Vec<EvidenceMarker> {
        let mut markers = Vec::new();
        for turn in conversation {
            let scan = scan_markers(&turn.content);
            if !scan.malformed.is_empty() {
                // Contract violation by whoever wrote the turn; treated as
                // absent evidence, kept visible for later inspection.
                warn!(
                    role = %turn.role,
                    malformed = scan.malformed.len(),
                    "malformed evidence markers in conversation"
                );
            }
            markers.extend(scan.markers);
        }
        markers
    }

    async fn mount(&self, markers: &[EvidenceMarker], budget: &EvidenceBudget) -> Option<String> {
        if markers.is_empty() {
            return None;
        }
        match self.compiler.resolve_markers(markers, budget).await {
            // Markers whose runs carry no evidence in window resolve to an
            // empty bundle; mounting an empty block would be noise.
            Ok(bundle) if bundle.is_empty() => None,
            Ok(bundle) => {
                debug!(
                    fragments = bundle.fragments.len(),
                    bytes_used = bundle.bytes_used,
                    fingerprint = %bundle.fingerprint(),
                    "evidence mounted"
                );
                Some(bundle.render())
            }
            Err(error) => {
                warn!(%error, "evidence mount failed, degrading to placeholder");
                Some(EVIDENCE_UNAVAILABLE.to_owned())
            }
        }
    }
}
