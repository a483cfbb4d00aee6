//! Durable worker-group state.
//!
//! A group tracks one cohort of workers spawned together by one supervisor
//! reasoning step. Counters and the `joined` flag are persisted on every
//! mutation so joinability is always recomputable from disk after a crash,
//! never from memory alone.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use overseer_protocol::{
    CoreError, CoreResult, CorrelationId, EvidenceMarker, GroupId, RunId, SeqNo, WorkerFailureKind,
    WorkerId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, instrument};

/// Terminal outcome of one worker slot, pointing at the worker's terminal
/// trace event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Completed { terminal_sequence: SeqNo },
    Failed {
        kind: WorkerFailureKind,
        terminal_sequence: SeqNo,
    },
}

/// One worker within a group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSlot {
    pub worker_id: WorkerId,
    pub worker_run_id: RunId,
    pub task: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<WorkerOutcome>,
}

/// Durable cohort row. `joined` flips to true exactly once, in the same
/// persisted write that makes `completed + failed == target` observable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerGroup {
    pub group_id: GroupId,
    pub supervisor_run_id: RunId,
    pub correlation_id: CorrelationId,
    pub target: u32,
    pub completed: u32,
    pub failed: u32,
    pub joined: bool,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub workers: Vec<WorkerSlot>,
}

impl WorkerGroup {
    pub fn new(
        supervisor_run_id: RunId,
        correlation_id: CorrelationId,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            group_id: GroupId::new_uuid(),
            supervisor_run_id,
            correlation_id,
            target: 0,
            completed: 0,
            failed: 0,
            joined: false,
            deadline,
            created_at: Utc::now(),
            workers: Vec::new(),
        }
    }

    pub fn add_worker(&mut self, worker_run_id: RunId, task: String) -> &WorkerSlot {
        let worker_id = WorkerId::from_string(format!("w{}", self.workers.len()));
        self.workers.push(WorkerSlot {
            worker_id,
            worker_run_id,
            task,
            outcome: None,
        });
        self.target = self.workers.len() as u32;
        self.workers.last().expect("just pushed")
    }

    pub fn slot(&self, worker_id: &WorkerId) -> Option<&WorkerSlot> {
        self.workers.iter().find(|s| &s.worker_id == worker_id)
    }

    pub fn slot_mut(&mut self, worker_id: &WorkerId) -> Option<&mut WorkerSlot> {
        self.workers.iter_mut().find(|s| &s.worker_id == worker_id)
    }

    /// True the instant every worker has a terminal outcome and no join has
    /// been committed yet.
    pub fn is_joinable(&self) -> bool {
        !self.joined && self.completed + self.failed == self.target
    }

    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// One marker per worker in the group, in spawn order. Failed workers'
    /// markers point at their failure events.
    pub fn markers(&self) -> Vec<EvidenceMarker> {
        self.workers
            .iter()
            .map(|slot| {
                EvidenceMarker::new(
                    slot.worker_run_id.clone(),
                    self.group_id.clone(),
                    slot.worker_id.clone(),
                )
            })
            .collect()
    }
}

/// File-backed group persistence: one JSON row per group, a per-group async
/// lock for the report critical section, and a read cache.
#[derive(Debug)]
pub struct GroupLedger {
    root: PathBuf,
    locks: Mutex<HashMap<GroupId, Arc<tokio::sync::Mutex<()>>>>,
    cache: Mutex<HashMap<GroupId, WorkerGroup>>,
}

impl GroupLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, group_id: &GroupId) -> PathBuf {
        self.root.join("groups").join(format!("{group_id}.json"))
    }

    /// Per-group critical-section lock. Groups never contend with each
    /// other; unrelated cohorts proceed in parallel.
    pub fn lock_for(&self, group_id: &GroupId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.locks.lock();
        guard
            .entry(group_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    #[instrument(skip(self, group), fields(group_id = %group.group_id, target = group.target))]
    pub async fn save(&self, group: &WorkerGroup) -> CoreResult<()> {
        let path = self.file_path(&group.group_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CoreError::Io(format!("failed creating groups dir {parent:?}: {e}")))?;
        }
        let payload = serde_json::to_string_pretty(group)
            .map_err(|e| CoreError::Serialization(format!("failed serializing group: {e}")))?;
        fs::write(&path, payload)
            .await
            .map_err(|e| CoreError::StoreUnavailable(format!("failed writing group {path:?}: {e}")))?;
        self.cache.lock().insert(group.group_id.clone(), group.clone());
        debug!("group row persisted");
        Ok(())
    }

    pub async fn load(&self, group_id: &GroupId) -> CoreResult<WorkerGroup> {
        if let Some(group) = self.cache.lock().get(group_id) {
            return Ok(group.clone());
        }
        let path = self.file_path(group_id);
        let payload = fs::read_to_string(&path)
            .await
            .map_err(|_| CoreError::GroupNotFound(group_id.clone()))?;
        let group: WorkerGroup = serde_json::from_str(&payload)
            .map_err(|e| CoreError::Serialization(format!("corrupt group row {path:?}: {e}")))?;
        self.cache.lock().insert(group_id.clone(), group.clone());
        Ok(group)
    }

    /// All not-yet-joined groups, from disk. Used by the deadline sweep and
    /// crash recovery, so the cache is deliberately not consulted.
    pub async fn open_groups(&self) -> CoreResult<Vec<WorkerGroup>> {
        let dir = self.root.join("groups");
        if !fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| CoreError::Io(format!("failed listing groups dir {dir:?}: {e}")))?;
        let mut out = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::Io(e.to_string()))?
        {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let payload = fs::read_to_string(entry.path())
                .await
                .map_err(|e| CoreError::Io(e.to_string()))?;
            let group: WorkerGroup = serde_json::from_str(&payload).map_err(|e| {
                CoreError::Serialization(format!("corrupt group row {:?}: {e}", entry.path()))
            })?;
            if !group.joined {
                out.push(group);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}
