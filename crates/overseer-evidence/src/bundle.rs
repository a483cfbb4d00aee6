//! Ephemeral evidence bundles.
//!
//! A bundle is call-scoped: it is compiled, mounted for one reasoning call,
//! and discarded. Nothing here is ever persisted. Budget accounting counts
//! fragment content only; the rendered headers are presentation.

use overseer_protocol::{RunId, SeqNo};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

/// Fixed, explainable inclusion order. Ranking never looks at content, only
/// at execution outcome and visibility flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentPriority {
    Failure,
    UserVisibleTool,
    Recent,
}

impl FragmentPriority {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Failure => "failure",
            Self::UserVisibleTool => "user_visible_tool",
            Self::Recent => "recent",
        }
    }
}

/// One expanded piece of evidence included in a bundle.
#[derive(Debug, Clone, Serialize)]
pub struct EvidenceFragment {
    pub run_id: RunId,
    pub sequence: SeqNo,
    /// Stable snake_case event kind name.
    pub kind: String,
    pub priority: FragmentPriority,
    /// Raw payload content, possibly tail-truncated to fit the budget.
    pub content: String,
    pub truncated: bool,
}

/// Ordered, bounded result of one compile call. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvidenceBundle {
    pub fragments: Vec<EvidenceFragment>,
    pub bytes_used: usize,
    pub lines_used: usize,
    /// Candidates that were eligible but dropped outright because the
    /// budget was already spent. Truncation outcomes, not errors.
    pub dropped: usize,
}

impl EvidenceBundle {
    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Deterministic text rendering, suitable for mounting as an ephemeral
    /// context layer. Identical bundles render byte-identically.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for fragment in &self.fragments {
            let marker = if fragment.truncated { " truncated" } else { "" };
            let _ = writeln!(
                out,
                "--- evidence {} run={} seq={} priority={}{} ---",
                fragment.kind,
                fragment.run_id,
                fragment.sequence,
                fragment.priority.label(),
                marker,
            );
            out.push_str(&fragment.content);
            if !fragment.content.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }

    /// Content fingerprint of the rendered bundle. Two compile calls over
    /// the same trace and budget produce the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.render().as_bytes());
        hex::encode(digest)
    }
}
