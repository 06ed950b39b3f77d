//! store.rs — embedded SQLite persistence.
//!
//! Exclusive owner of durability: messages (which double as the dedup
//! window), extracted events, cluster states, and the authority ledger.
//! Every write is acknowledged only after the statement committed; batch
//! writes (event + cluster) go through one transaction. In-memory copies
//! held by the pipeline and correlation engine are caches reconstructible
//! from here.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{ClusterState, Event, NormalizedMessage, SourceAuthority, TrendCluster};

const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS messages (
        source_id  TEXT NOT NULL,
        message_id INTEGER NOT NULL,
        arrived_at INTEGER NOT NULL,
        hash       TEXT NOT NULL,
        text_norm  TEXT NOT NULL,
        PRIMARY KEY (source_id, message_id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_hash ON messages(hash, arrived_at)",
    "CREATE TABLE IF NOT EXISTS events (
        event_id        TEXT PRIMARY KEY,
        cluster_id      TEXT NOT NULL,
        kind            TEXT NOT NULL,
        location        TEXT,
        entities_json   TEXT NOT NULL,
        time_hint       INTEGER,
        summary         TEXT NOT NULL,
        confidence_self REAL NOT NULL,
        created_at      INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_events_created ON events(created_at)",
    "CREATE TABLE IF NOT EXISTS clusters (
        cluster_id   TEXT PRIMARY KEY,
        state        TEXT NOT NULL,
        first_seen   INTEGER NOT NULL,
        last_updated INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS authority (
        source_id      TEXT PRIMARY KEY,
        score          REAL NOT NULL,
        corroborations INTEGER NOT NULL DEFAULT 0,
        contradictions INTEGER NOT NULL DEFAULT 0,
        last_update    INTEGER NOT NULL
    )",
];

#[derive(Debug, Error)]
pub enum StoreError {
    /// Structural failure; treated as fatal by the supervisor.
    #[error("store failure: {0}")]
    Corruption(#[from] sqlx::Error),
    #[error("store write timed out after {0:?}")]
    Timeout(Duration),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    New,
    Dup,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(db_path: &str) -> StoreResult<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(WRITE_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!(target: "store", path = db_path, "database ready");
        Ok(store)
    }

    /// Single-connection in-memory database for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Idempotent on `(source_id, message_id)`; also `Dup` when the content
    /// hash was stored within `dedup_window_secs` before `now`.
    pub async fn put_message(
        &self,
        msg: &NormalizedMessage,
        dedup_window_secs: u64,
        now: u64,
    ) -> StoreResult<PutOutcome> {
        let pool = self.pool.clone();
        let msg = msg.clone();
        timed(async move {
            let mut tx = pool.begin().await?;

            let by_id: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM messages WHERE source_id = ? AND message_id = ?")
                    .bind(&msg.raw.source_id)
                    .bind(msg.raw.message_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            if by_id.is_some() {
                return Ok(PutOutcome::Dup);
            }

            let window_start = now.saturating_sub(dedup_window_secs) as i64;
            let by_hash: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM messages WHERE hash = ? AND arrived_at >= ? LIMIT 1",
            )
            .bind(&msg.hash)
            .bind(window_start)
            .fetch_optional(&mut *tx)
            .await?;
            if by_hash.is_some() {
                return Ok(PutOutcome::Dup);
            }

            sqlx::query(
                "INSERT INTO messages (source_id, message_id, arrived_at, hash, text_norm)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&msg.raw.source_id)
            .bind(msg.raw.message_id)
            .bind(msg.raw.arrived_at as i64)
            .bind(&msg.hash)
            .bind(&msg.text_norm)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;
            Ok(PutOutcome::New)
        })
        .await
    }

    pub async fn put_event(&self, ev: &Event, cluster_id: &str) -> StoreResult<()> {
        let pool = self.pool.clone();
        let ev = ev.clone();
        let cluster_id = cluster_id.to_string();
        timed(async move {
            insert_event(&pool, &ev, &cluster_id).await?;
            Ok(())
        })
        .await
    }

    /// Transactional event append + cluster upsert; commits entirely or not
    /// at all.
    pub async fn put_cluster_update(
        &self,
        cluster: &TrendCluster,
        new_event: Option<&Event>,
    ) -> StoreResult<()> {
        let pool = self.pool.clone();
        let cluster = cluster.clone();
        let new_event = new_event.cloned();
        timed(async move {
            let mut tx = pool.begin().await?;
            if let Some(ev) = &new_event {
                sqlx::query(
                    "INSERT OR REPLACE INTO events
                     (event_id, cluster_id, kind, location, entities_json, time_hint,
                      summary, confidence_self, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&ev.event_id)
                .bind(&cluster.cluster_id)
                .bind(ev.kind.as_str())
                .bind(&ev.location)
                .bind(serde_json::to_string(&ev.entities).unwrap_or_else(|_| "[]".into()))
                .bind(ev.time_hint.map(|t| t as i64))
                .bind(&ev.summary)
                .bind(ev.confidence_self as f64)
                .bind(ev.ingested_at as i64)
                .execute(&mut *tx)
                .await?;
            }
            sqlx::query(
                "INSERT INTO clusters (cluster_id, state, first_seen, last_updated)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(cluster_id) DO UPDATE SET
                   state = excluded.state,
                   last_updated = excluded.last_updated",
            )
            .bind(&cluster.cluster_id)
            .bind(cluster.state.as_str())
            .bind(cluster.first_seen as i64)
            .bind(cluster.last_updated as i64)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    pub async fn put_cluster(&self, cluster: &TrendCluster) -> StoreResult<()> {
        self.put_cluster_update(cluster, None).await
    }

    pub async fn get_events_since(&self, t: u64) -> StoreResult<Vec<StoredEvent>> {
        let rows = sqlx::query(
            "SELECT event_id, cluster_id, kind, location, summary, created_at
             FROM events WHERE created_at >= ? ORDER BY created_at",
        )
        .bind(t as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| StoredEvent {
                event_id: r.get("event_id"),
                cluster_id: r.get("cluster_id"),
                kind: r.get("kind"),
                location: r.get("location"),
                summary: r.get("summary"),
                created_at: r.get::<i64, _>("created_at") as u64,
            })
            .collect())
    }

    pub async fn update_authority(&self, source_id: &str, a: &SourceAuthority) -> StoreResult<()> {
        let pool = self.pool.clone();
        let source_id = source_id.to_string();
        let a = a.clone();
        timed(async move {
            sqlx::query(
                "INSERT INTO authority (source_id, score, corroborations, contradictions, last_update)
                 VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(source_id) DO UPDATE SET
                   score = excluded.score,
                   corroborations = excluded.corroborations,
                   contradictions = excluded.contradictions,
                   last_update = excluded.last_update",
            )
            .bind(&source_id)
            .bind(a.score)
            .bind(a.corroborations as i64)
            .bind(a.contradictions as i64)
            .bind(a.last_update as i64)
            .execute(&pool)
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn read_authority(&self, source_id: &str) -> StoreResult<Option<SourceAuthority>> {
        let row = sqlx::query(
            "SELECT score, corroborations, contradictions, last_update
             FROM authority WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| SourceAuthority {
            score: r.get("score"),
            corroborations: r.get::<i64, _>("corroborations") as u32,
            contradictions: r.get::<i64, _>("contradictions") as u32,
            last_update: r.get::<i64, _>("last_update") as u64,
        }))
    }

    pub async fn load_authorities(&self) -> StoreResult<HashMap<String, SourceAuthority>> {
        let rows = sqlx::query(
            "SELECT source_id, score, corroborations, contradictions, last_update FROM authority",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                (
                    r.get::<String, _>("source_id"),
                    SourceAuthority {
                        score: r.get("score"),
                        corroborations: r.get::<i64, _>("corroborations") as u32,
                        contradictions: r.get::<i64, _>("contradictions") as u32,
                        last_update: r.get::<i64, _>("last_update") as u64,
                    },
                )
            })
            .collect())
    }

    /// Prune the dedup window and terminal clusters/events, then compact
    /// the WAL. Called from the maintenance tick.
    pub async fn cleanup_old(&self, max_age_secs: u64) -> StoreResult<()> {
        let cutoff = crate::now_unix().saturating_sub(max_age_secs) as i64;
        sqlx::query("DELETE FROM messages WHERE arrived_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "DELETE FROM events WHERE cluster_id IN
             (SELECT cluster_id FROM clusters WHERE last_updated < ? AND state != 'open')",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        sqlx::query("DELETE FROM clusters WHERE last_updated < ? AND state != 'open'")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await;
        debug!(target: "store", max_age_secs, "cleanup done");
        Ok(())
    }

    /// Idle clusters dropped unemitted keep their rows for audit, tagged
    /// distinctly from the supersession path.
    pub async fn mark_cluster_discarded(&self, cluster_id: &str, now: u64) -> StoreResult<()> {
        let pool = self.pool.clone();
        let cluster_id = cluster_id.to_string();
        timed(async move {
            sqlx::query("UPDATE clusters SET state = 'discarded', last_updated = ? WHERE cluster_id = ?")
                .bind(now as i64)
                .bind(&cluster_id)
                .execute(&pool)
                .await?;
            Ok(())
        })
        .await
    }

    /// Open clusters persisted before a restart, for audit/inspection.
    pub async fn open_cluster_ids(&self) -> StoreResult<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT cluster_id FROM clusters WHERE state = ? ORDER BY first_seen",
        )
        .bind(ClusterState::Open.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

/// Audit projection of a stored event.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event_id: String,
    pub cluster_id: String,
    pub kind: String,
    pub location: Option<String>,
    pub summary: String,
    pub created_at: u64,
}

async fn insert_event(pool: &SqlitePool, ev: &Event, cluster_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT OR REPLACE INTO events
         (event_id, cluster_id, kind, location, entities_json, time_hint,
          summary, confidence_self, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&ev.event_id)
    .bind(cluster_id)
    .bind(ev.kind.as_str())
    .bind(&ev.location)
    .bind(serde_json::to_string(&ev.entities).unwrap_or_else(|_| "[]".into()))
    .bind(ev.time_hint.map(|t| t as i64))
    .bind(&ev.summary)
    .bind(ev.confidence_self as f64)
    .bind(ev.ingested_at as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Bound every write with the store timeout so a wedged disk surfaces as an
/// error instead of stalling the pipeline.
async fn timed<T>(fut: impl Future<Output = Result<T, sqlx::Error>>) -> StoreResult<T> {
    match tokio::time::timeout(WRITE_TIMEOUT, fut).await {
        Ok(res) => res.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(WRITE_TIMEOUT)),
    }
}
