//! Durable run registry: one JSON file per run row.
//!
//! Status transitions go through the registry so joinability and recovery
//! decisions are always made from durable state, never memory alone.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use overseer_protocol::{RunId, RunRecord, RunStatus};
use parking_lot::Mutex;
use tokio::fs;
use tracing::{debug, instrument};

#[derive(Debug)]
pub struct RunRegistry {
    root: PathBuf,
    cache: Mutex<HashMap<RunId, RunRecord>>,
}

impl RunRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join("runs").join(format!("{run_id}.json"))
    }

    async fn persist(&self, record: &RunRecord) -> Result<()> {
        let path = self.file_path(&record.run_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed creating runs dir {parent:?}"))?;
        }
        let payload = serde_json::to_string_pretty(record).context("failed serializing run")?;
        fs::write(&path, payload)
            .await
            .with_context(|| format!("failed writing run row {path:?}"))?;
        Ok(())
    }

    #[instrument(skip(self, record), fields(run_id = %record.run_id, kind = ?record.kind))]
    pub async fn create(&self, record: RunRecord) -> Result<RunRecord> {
        self.persist(&record).await?;
        self.cache
            .lock()
            .insert(record.run_id.clone(), record.clone());
        debug!("run row created");
        Ok(record)
    }

    pub async fn load(&self, run_id: &RunId) -> Result<RunRecord> {
        if let Some(record) = self.cache.lock().get(run_id) {
            return Ok(record.clone());
        }
        let path = self.file_path(run_id);
        let payload = fs::read_to_string(&path)
            .await
            .with_context(|| format!("run not found: {run_id}"))?;
        let record: RunRecord =
            serde_json::from_str(&payload).with_context(|| format!("corrupt run row {path:?}"))?;
        self.cache.lock().insert(run_id.clone(), record.clone());
        Ok(record)
    }

    #[instrument(skip(self), fields(run_id = %run_id, status = ?status))]
    pub async fn transition(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord> {
        let mut record = self.load(run_id).await?;
        record.transition(status);
        self.persist(&record).await?;
        self.cache
            .lock()
            .insert(run_id.clone(), record.clone());
        debug!("run status updated");
        Ok(record)
    }
}
