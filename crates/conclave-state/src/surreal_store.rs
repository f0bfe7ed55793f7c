//! SurrealDB-backed repositories
//!
//! Records are stored as JSON documents (`body`) next to the columns the
//! queries filter and sort on, converting to/from `storage_traits` types at
//! the boundary.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::storage_traits::{
    AgentRun, CandidateRecord, CheckpointId, CheckpointRepository, CheckpointState,
    DecisionRecord, RunId, RunRepository, StorageResult,
};

const NAMESPACE: &str = "conclave";
const DATABASE: &str = "main";

/// One stored row. The SurrealDB record id is not mapped.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocRow {
    key: String,
    run_id: String,
    ord: u64,
    body: String,
}

impl DocRow {
    fn new<T: Serialize>(key: &str, run_id: &RunId, ord: u64, record: &T) -> StorageResult<Self> {
        Ok(Self {
            key: key.to_string(),
            run_id: run_id.0.clone(),
            ord,
            body: serde_json::to_string(record)?,
        })
    }

    fn decode<T: DeserializeOwned>(&self) -> StorageResult<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// SurrealDB implementation of [`RunRepository`] and [`CheckpointRepository`].
pub struct SurrealStore {
    db: Surreal<Any>,
    ord: AtomicU64,
}

impl SurrealStore {
    /// Create an in-memory instance.
    ///
    /// Connects to `mem://`, selects `conclave/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Connect to any SurrealDB endpoint understood by `engine::any`
    /// (`mem://`, `surrealkv://path`, `ws://host:port`).
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {}: {}", url, e)))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;

        info!("SurrealStore connected ({})", url);
        Ok(Self {
            db,
            ord: AtomicU64::new(0),
        })
    }

    // -- private helpers -----------------------------------------------------

    /// Wall-clock nanoseconds, forced strictly increasing within this handle
    /// so rows written across reconnects to a persistent store still sort.
    fn next_ord(&self) -> u64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0) as u64;
        match self
            .ord
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(now.max(prev + 1))
            }) {
            Ok(prev) | Err(prev) => now.max(prev + 1),
        }
    }

    async fn fetch(&self, table: &'static str, key: &str) -> StorageResult<Option<DocRow>> {
        let key_owned = key.to_string();
        let mut res = self
            .db
            .query(format!("SELECT * FROM {table} WHERE key = $key"))
            .bind(("key", key_owned))
            .await?;
        let rows: Vec<DocRow> = res.take(0)?;
        Ok(rows.into_iter().next())
    }

    async fn fetch_by_run(&self, table: &'static str, run_id: &RunId) -> StorageResult<Vec<DocRow>> {
        let rid_owned = run_id.0.clone();
        let mut res = self
            .db
            .query(format!(
                "SELECT * FROM {table} WHERE run_id = $rid ORDER BY ord ASC"
            ))
            .bind(("rid", rid_owned))
            .await?;
        Ok(res.take(0)?)
    }

    async fn insert(&self, table: &'static str, row: DocRow) -> StorageResult<()> {
        debug!(table, key = %row.key, "inserting row");
        let _created: Option<DocRow> = self.db.create(table).content(row).await?;
        Ok(())
    }

    async fn replace_body(&self, table: &'static str, key: &str, body: String) -> StorageResult<()> {
        let key_owned = key.to_string();
        self.db
            .query(format!("UPDATE {table} SET body = $body WHERE key = $key"))
            .bind(("body", body))
            .bind(("key", key_owned))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RunRepository for SurrealStore {
    async fn create_run(&self, run: &AgentRun) -> StorageResult<()> {
        if self.fetch("runs", run.id.as_str()).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: "run",
                id: run.id.to_string(),
            });
        }
        let row = DocRow::new(run.id.as_str(), &run.id, self.next_ord(), run)?;
        self.insert("runs", row).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<AgentRun> {
        self.fetch("runs", run_id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("run", run_id.as_str()))?
            .decode()
    }

    async fn update_run(&self, run: &AgentRun) -> StorageResult<()> {
        if self.fetch("runs", run.id.as_str()).await?.is_none() {
            return Err(StorageError::not_found("run", run.id.as_str()));
        }
        self.replace_body("runs", run.id.as_str(), serde_json::to_string(run)?)
            .await
    }

    async fn list_runs(&self) -> StorageResult<Vec<AgentRun>> {
        let mut res = self.db.query("SELECT * FROM runs ORDER BY ord ASC").await?;
        let rows: Vec<DocRow> = res.take(0)?;
        rows.iter().map(DocRow::decode).collect()
    }

    async fn upsert_candidate(&self, candidate: &CandidateRecord) -> StorageResult<()> {
        if self.fetch("candidates", &candidate.id).await?.is_some() {
            return self
                .replace_body("candidates", &candidate.id, serde_json::to_string(candidate)?)
                .await;
        }
        let row = DocRow::new(&candidate.id, &candidate.run_id, self.next_ord(), candidate)?;
        self.insert("candidates", row).await
    }

    async fn list_candidates(&self, run_id: &RunId) -> StorageResult<Vec<CandidateRecord>> {
        let rows = self.fetch_by_run("candidates", run_id).await?;
        rows.iter().map(DocRow::decode).collect()
    }

    async fn save_decision(&self, decision: &DecisionRecord) -> StorageResult<()> {
        if self.fetch("decisions", &decision.id).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: "decision",
                id: decision.id.clone(),
            });
        }
        let row = DocRow::new(&decision.id, &decision.run_id, self.next_ord(), decision)?;
        self.insert("decisions", row).await
    }

    async fn list_decisions(&self, run_id: &RunId) -> StorageResult<Vec<DecisionRecord>> {
        let rows = self.fetch_by_run("decisions", run_id).await?;
        rows.iter().map(DocRow::decode).collect()
    }
}

#[async_trait]
impl CheckpointRepository for SurrealStore {
    async fn insert_checkpoint(&self, checkpoint: &CheckpointState) -> StorageResult<()> {
        if self.fetch("checkpoints", checkpoint.id.as_str()).await?.is_some() {
            return Err(StorageError::AlreadyExists {
                kind: "checkpoint",
                id: checkpoint.id.to_string(),
            });
        }
        let row = DocRow::new(
            checkpoint.id.as_str(),
            &checkpoint.run_id,
            checkpoint.seq,
            checkpoint,
        )?;
        self.insert("checkpoints", row).await
    }

    async fn get_checkpoint(&self, id: &CheckpointId) -> StorageResult<CheckpointState> {
        self.fetch("checkpoints", id.as_str())
            .await?
            .ok_or_else(|| StorageError::not_found("checkpoint", id.as_str()))?
            .decode()
    }

    async fn update_checkpoint(&self, checkpoint: &CheckpointState) -> StorageResult<()> {
        if self.fetch("checkpoints", checkpoint.id.as_str()).await?.is_none() {
            return Err(StorageError::not_found("checkpoint", checkpoint.id.as_str()));
        }
        self.replace_body(
            "checkpoints",
            checkpoint.id.as_str(),
            serde_json::to_string(checkpoint)?,
        )
        .await
    }

    async fn delete_checkpoint(&self, id: &CheckpointId) -> StorageResult<()> {
        let key_owned = id.0.clone();
        self.db
            .query("DELETE checkpoints WHERE key = $key")
            .bind(("key", key_owned))
            .await?;
        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &RunId) -> StorageResult<Vec<CheckpointState>> {
        let rows = self.fetch_by_run("checkpoints", run_id).await?;
        rows.iter().map(DocRow::decode).collect()
    }
}

