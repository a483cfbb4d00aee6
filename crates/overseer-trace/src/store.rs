//! File-backed trace store: one append-only JSONL file per run.
//!
//! The store assigns sequences under a per-run write lock, which makes
//! idempotent retry with dedupe keys natural: a retried append with a known
//! key returns the originally written event without touching the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use overseer_protocol::{
    AppendRequest, CoreError, CoreResult, EventId, RunId, SeqNo, TraceEvent, TraceStorePort,
};
use parking_lot::Mutex;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument, warn};

/// Cached per-run append state, rebuilt by scanning the log on first touch.
#[derive(Debug, Default, Clone)]
struct RunTraceState {
    head: SeqNo,
    dedupe: HashMap<String, SeqNo>,
}

#[derive(Debug)]
pub struct FileTraceStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<RunId, Arc<tokio::sync::Mutex<()>>>>,
    state_cache: Mutex<HashMap<RunId, RunTraceState>>,
}

impl FileTraceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            state_cache: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join("trace").join(format!("{run_id}.jsonl"))
    }

    fn lock_for(&self, run_id: &RunId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(run_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn ensure_parent(path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Io(format!("failed creating trace dir {parent:?}: {e}")))?;
        }
        Ok(())
    }

    /// Rebuild head and dedupe index from the log, checking that sequences
    /// are gap-free and strictly increasing.
    async fn scan_state(path: &Path) -> CoreResult<RunTraceState> {
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(RunTraceState::default());
        }

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("failed opening {path:?}: {e}")))?;
        let mut reader = BufReader::new(file).lines();
        let mut state = RunTraceState::default();

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| CoreError::Io(e.to_string()))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let event: TraceEvent = serde_json::from_str(&line).map_err(|e| {
                CoreError::Serialization(format!("failed parsing event line in {path:?}: {e}"))
            })?;
            let expected = state.head + 1;
            if event.sequence != expected {
                return Err(CoreError::SequenceConflict {
                    expected,
                    actual: event.sequence,
                });
            }
            state.head = event.sequence;
            if let Some(key) = &event.dedupe_key {
                state.dedupe.insert(key.clone(), event.sequence);
            }
        }
        Ok(state)
    }

    async fn state_for(&self, run_id: &RunId) -> CoreResult<RunTraceState> {
        if let Some(state) = self.state_cache.lock().get(run_id) {
            return Ok(state.clone());
        }
        let state = Self::scan_state(&self.file_path(run_id)).await?;
        self.state_cache.lock().insert(run_id.clone(), state.clone());
        Ok(state)
    }

    async fn find_by_sequence(&self, run_id: &RunId, sequence: SeqNo) -> CoreResult<TraceEvent> {
        let events = self.read_events(run_id, sequence.saturating_sub(1), 1).await?;
        events
            .into_iter()
            .find(|event| event.sequence == sequence)
            .ok_or_else(|| {
                CoreError::InvalidState(format!(
                    "dedupe index points at missing event {sequence} in run {run_id}"
                ))
            })
    }

    async fn read_events(
        &self,
        run_id: &RunId,
        since_sequence: SeqNo,
        limit: usize,
    ) -> CoreResult<Vec<TraceEvent>> {
        let path = self.file_path(run_id);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new()
            .read(true)
            .open(&path)
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("failed opening {path:?}: {e}")))?;
        let mut reader = BufReader::new(file).lines();
        let mut out = Vec::new();

        while let Some(line) = reader
            .next_line()
            .await
            .map_err(|e| CoreError::Io(e.to_string()))?
        {
            if line.trim().is_empty() {
                continue;
            }
            let event: TraceEvent = serde_json::from_str(&line).map_err(|e| {
                CoreError::Serialization(format!("failed parsing event line in {path:?}: {e}"))
            })?;
            if event.sequence > since_sequence {
                out.push(event);
            }
            if out.len() >= limit {
                break;
            }
        }
        debug!(run_id = %run_id, count = out.len(), "events loaded from store");
        Ok(out)
    }
}

#[async_trait]
impl TraceStorePort for FileTraceStore {
    #[instrument(
        skip(self, request),
        fields(run_id = %request.run_id, kind = request.kind.name())
    )]
    async fn append(&self, request: AppendRequest) -> CoreResult<TraceEvent> {
        let path = self.file_path(&request.run_id);
        Self::ensure_parent(&path).await?;

        let lock = self.lock_for(&request.run_id);
        let _guard = lock.lock().await;

        let state = self.state_for(&request.run_id).await?;

        if let Some(key) = &request.dedupe_key
            && let Some(&sequence) = state.dedupe.get(key)
        {
            debug!(sequence, dedupe_key = %key, "append deduplicated");
            return self.find_by_sequence(&request.run_id, sequence).await;
        }

        let event = TraceEvent {
            event_id: EventId::new_uuid(),
            run_id: request.run_id.clone(),
            sequence: state.head + 1,
            timestamp: chrono::Utc::now(),
            correlation_id: request.correlation_id,
            dedupe_key: request.dedupe_key,
            kind: request.kind,
        };

        let line = serde_json::to_string(&event)
            .map_err(|e| CoreError::Serialization(format!("failed serializing event: {e}")))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                warn!(error = %e, "trace log open failed");
                CoreError::StoreUnavailable(format!("failed opening trace log {path:?}: {e}"))
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;
        file.flush()
            .await
            .map_err(|e| CoreError::StoreUnavailable(e.to_string()))?;

        {
            let mut cache = self.state_cache.lock();
            let entry = cache.entry(request.run_id.clone()).or_default();
            entry.head = event.sequence;
            if let Some(key) = &event.dedupe_key {
                entry.dedupe.insert(key.clone(), event.sequence);
            }
        }
        debug!(sequence = event.sequence, "event appended to store");
        Ok(event)
    }

    #[instrument(skip(self), fields(run_id = %run_id, since_sequence, limit))]
    async fn read(
        &self,
        run_id: RunId,
        since_sequence: SeqNo,
        limit: usize,
    ) -> CoreResult<Vec<TraceEvent>> {
        self.read_events(&run_id, since_sequence, limit).await
    }

    async fn head(&self, run_id: RunId) -> CoreResult<SeqNo> {
        let lock = self.lock_for(&run_id);
        let _guard = lock.lock().await;
        Ok(self.state_for(&run_id).await?.head)
    }
}
