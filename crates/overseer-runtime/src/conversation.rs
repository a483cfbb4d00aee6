//! Persistent conversation log, one append-only JSONL file per supervisor
//! run lineage.
//!
//! There is no mutable "current context" anywhere; the log is the
//! conversation. Only the prune step of a reasoning cycle (and the
//! continuation handoff) ever appends here, and raw tool output never
//! does — that is what evidence markers are for.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use overseer_protocol::{ConversationTurn, RunId};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};

#[derive(Debug)]
pub struct ConversationStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, run_id: &RunId) -> PathBuf {
        self.root
            .join("conversations")
            .join(format!("{run_id}.jsonl"))
    }

    fn lock_for(&self, run_id: &RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[instrument(skip(self, turn), fields(run_id = %run_id, role = %turn.role))]
    pub async fn append(&self, run_id: &RunId, turn: ConversationTurn) -> Result<()> {
        let path = self.file_path(run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating conversations dir {parent:?}"))?;
        }
        let line = serde_json::to_string(&turn).context("failed serializing turn")?;

        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed opening conversation log {path:?}"))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        debug!("turn committed");
        Ok(())
    }

    pub async fn load(&self, run_id: &RunId) -> Result<Vec<ConversationTurn>> {
        let path = self.file_path(run_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let payload = fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed reading conversation log {path:?}"))?;
        let mut turns = Vec::new();
        for line in payload.lines().filter(|l| !l.trim().is_empty()) {
            turns.push(
                serde_json::from_str(line)
                    .with_context(|| format!("corrupt turn in {path:?}"))?,
            );
        }
        Ok(turns)
    }

    /// Content hash of the persisted conversation. Lets callers check that
    /// a reasoning cycle left the durable state untouched except through
    /// the prune step.
    pub async fn snapshot_hash(&self, run_id: &RunId) -> Result<String> {
        let mut hasher = Sha256::new();
        for turn in self.load(run_id).await? {
            hasher.update(turn.role.as_bytes());
            hasher.update([0]);
            hasher.update(turn.content.as_bytes());
            hasher.update([0]);
        }
        Ok(hex::encode(hasher.finalize()))
    }
}
