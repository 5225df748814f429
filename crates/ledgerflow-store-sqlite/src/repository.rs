//! The sqlite checkpoint store.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use ledgerflow_core::{
    Checkpoint, CheckpointStore, CheckpointSummary, Codec, CoreError, FlowId, FlowStatus,
};
use sqlx::Row;
use tracing::debug;

use crate::connection::SqliteConnection;

// The sequence guard and the insert evaluate in one statement, under
// sqlite's writer lock, so two workers racing to append the same
// successor see exactly one winner.
const SAVE: &str = "
    INSERT INTO checkpoints (flow_id, seq, status, blob, created_at)
    SELECT ?1, ?2, ?3, ?4, ?5
    WHERE ?2 = (SELECT COALESCE(MAX(seq) + 1, 0) FROM checkpoints WHERE flow_id = ?1)
";

const LIST_ALL: &str = "
    SELECT blob FROM checkpoints AS c
    WHERE seq = (SELECT MAX(seq) FROM checkpoints WHERE flow_id = c.flow_id)
    ORDER BY created_at ASC, flow_id ASC
";

const LIST_BY_STATUS: &str = "
    SELECT blob FROM checkpoints AS c
    WHERE seq = (SELECT MAX(seq) FROM checkpoints WHERE flow_id = c.flow_id)
      AND status = ?
    ORDER BY created_at ASC, flow_id ASC
";

fn stamp(at: DateTime<Utc>) -> String {
    // Fixed-width text keeps lexicographic order chronological.
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn store_fault(context: &str) -> impl FnOnce(sqlx::Error) -> CoreError + '_ {
    move |err| CoreError::StoreError(format!("{context}: {err}"))
}

/// Checkpoints in a sqlite database file.
///
/// The blob column holds each checkpoint as a versioned canonical JSON
/// document, so records written by an older compatible release remain
/// readable and decoding rejects anything outside the schema window.
pub struct SqliteCheckpointStore {
    conn: SqliteConnection,
    codec: Codec,
}

impl SqliteCheckpointStore {
    /// Store over an already-opened connection.
    pub fn new(conn: SqliteConnection) -> Self {
        SqliteCheckpointStore {
            conn,
            codec: Codec::new(),
        }
    }

    /// Opens (creating if missing) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Ok(Self::new(SqliteConnection::open(path).await?))
    }

    /// The underlying connection, for sharing one pool across stores.
    pub fn connection(&self) -> &SqliteConnection {
        &self.conn
    }

    fn encode(&self, checkpoint: &Checkpoint) -> Result<String, CoreError> {
        let bytes = self.codec.encode(checkpoint)?;
        String::from_utf8(bytes)
            .map_err(|err| CoreError::SerializationError(format!("checkpoint blob: {err}")))
    }

    fn decode(&self, blob: &str) -> Result<Checkpoint, CoreError> {
        self.codec
            .decode(blob.as_bytes())
            .map_err(|err| CoreError::SerializationError(format!("stored checkpoint: {err}")))
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CoreError> {
        let blob = self.encode(checkpoint)?;
        let outcome = sqlx::query(SAVE)
            .bind(&checkpoint.flow_id.0)
            .bind(checkpoint.sequence as i64)
            .bind(checkpoint.status.to_string())
            .bind(&blob)
            .bind(stamp(checkpoint.created_at))
            .execute(self.conn.pool())
            .await
            .map_err(store_fault("save checkpoint"))?;
        if outcome.rows_affected() == 0 {
            let latest: Option<i64> =
                sqlx::query_scalar("SELECT MAX(seq) FROM checkpoints WHERE flow_id = ?")
                    .bind(&checkpoint.flow_id.0)
                    .fetch_one(self.conn.pool())
                    .await
                    .map_err(store_fault("save sequence check"))?;
            return Err(CoreError::StaleCheckpoint {
                flow_id: checkpoint.flow_id.clone(),
                attempted: checkpoint.sequence,
                latest: latest.map_or(0, |n| n as u64),
            });
        }
        debug!(flow = %checkpoint.flow_id, sequence = checkpoint.sequence,
            status = %checkpoint.status, "checkpoint saved");
        Ok(())
    }

    async fn load(&self, flow_id: &FlowId) -> Result<Option<Checkpoint>, CoreError> {
        let blob: Option<String> = sqlx::query_scalar(
            "SELECT blob FROM checkpoints WHERE flow_id = ? ORDER BY seq DESC LIMIT 1",
        )
        .bind(&flow_id.0)
        .fetch_optional(self.conn.pool())
        .await
        .map_err(store_fault("load checkpoint"))?;
        blob.as_deref().map(|blob| self.decode(blob)).transpose()
    }

    async fn delete(&self, flow_id: &FlowId) -> Result<(), CoreError> {
        let latest = match self.load(flow_id).await? {
            None => return Ok(()),
            Some(checkpoint) => checkpoint,
        };
        if !latest.is_terminal() {
            return Err(CoreError::InvalidState(format!(
                "flow {flow_id} is not terminal"
            )));
        }

        let mut tx = self
            .conn
            .pool()
            .begin()
            .await
            .map_err(store_fault("delete begin"))?;
        sqlx::query("DELETE FROM checkpoints WHERE flow_id = ?")
            .bind(&flow_id.0)
            .execute(&mut *tx)
            .await
            .map_err(store_fault("delete checkpoints"))?;
        sqlx::query("DELETE FROM flow_leases WHERE flow_id = ?")
            .bind(&flow_id.0)
            .execute(&mut *tx)
            .await
            .map_err(store_fault("delete lease"))?;
        tx.commit().await.map_err(store_fault("delete commit"))?;
        Ok(())
    }

    async fn list(&self, status: Option<FlowStatus>) -> Result<Vec<CheckpointSummary>, CoreError> {
        let rows = match status {
            Some(wanted) => {
                sqlx::query(LIST_BY_STATUS)
                    .bind(wanted.to_string())
                    .fetch_all(self.conn.pool())
                    .await
            }
            None => sqlx::query(LIST_ALL).fetch_all(self.conn.pool()).await,
        }
        .map_err(store_fault("list checkpoints"))?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: String = row
                .try_get("blob")
                .map_err(store_fault("list row"))?;
            summaries.push(self.decode(&blob)?.summary());
        }
        Ok(summaries)
    }

    async fn acquire_lease(
        &self,
        flow_id: &FlowId,
        owner: &str,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| CoreError::ConfigError("lease ttl out of range".into()))?;
        let now = Utc::now();

        let outcome = sqlx::query(
            "INSERT INTO flow_leases (flow_id, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(flow_id) DO UPDATE SET owner = ?2, expires_at = ?3
             WHERE flow_leases.owner = ?2 OR flow_leases.expires_at <= ?4",
        )
        .bind(&flow_id.0)
        .bind(owner)
        .bind(stamp(now + ttl))
        .bind(stamp(now))
        .execute(self.conn.pool())
        .await
        .map_err(store_fault("acquire lease"))?;
        Ok(outcome.rows_affected() > 0)
    }

    async fn release_lease(&self, flow_id: &FlowId, owner: &str) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM flow_leases WHERE flow_id = ? AND owner = ?")
            .bind(&flow_id.0)
            .bind(owner)
            .execute(self.conn.pool())
            .await
            .map_err(store_fault("release lease"))?;
        Ok(())
    }
}
