//! Persistent record of every check, keyed by candidate.
//!
//! The store doubles as the long-lived dedup guard: a candidate resolved inside its
//! cooldown window is answered from here instead of the network. Definitive results
//! (available or taken) use the long window; error results only block re-checks for
//! the much shorter `error_retry` window, so a transient failure never buries a
//! candidate for days.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, SqlitePool,
};
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::info;

use crate::types::{secs, CheckOutcome};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Corrupt record for {candidate}: {reason}")]
    Corrupt { candidate: String, reason: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CooldownPolicy {
    #[serde(with = "secs")]
    pub cooldown: Duration,
    #[serde(with = "secs")]
    pub error_retry: Duration,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(3 * 24 * 60 * 60),
            error_retry: Duration::from_secs(10 * 60),
        }
    }
}

impl CooldownPolicy {
    fn window_for(&self, status_code: u16) -> Duration {
        if is_definitive_status(status_code) {
            self.cooldown
        } else {
            self.error_retry
        }
    }

    pub fn is_active(&self, checked_at: DateTime<Utc>, status_code: u16, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::from_std(self.window_for(status_code))
            .unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(checked_at) < window
    }
}

/// Only a parsed 200 response counts as an answer from the upstream.
fn is_definitive_status(status_code: u16) -> bool {
    status_code == 200
}

fn outcome_from_parts(
    candidate: String,
    checked_at: DateTime<Utc>,
    is_available: bool,
    status_code: u16,
    message: String,
) -> CheckOutcome {
    CheckOutcome {
        candidate,
        is_available,
        status_code,
        message,
        timestamp: checked_at,
        is_error: !is_definitive_status(status_code),
    }
}

#[async_trait]
pub trait CheckStore: Send + Sync {
    /// Upserts the latest result for `candidate`.
    async fn record_check(
        &self,
        candidate: &str,
        is_available: bool,
        status_code: u16,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn is_in_cooldown(&self, candidate: &str) -> Result<bool, StoreError>;

    async fn get_status(&self, candidate: &str) -> Result<Option<CheckOutcome>, StoreError>;

    /// Available candidates, most recent first.
    async fn list_recently_available(&self, limit: usize) -> Result<Vec<CheckOutcome>, StoreError>;

    /// Deletes records older than `age`; returns how many went.
    async fn cleanup_old_records(&self, age: Duration) -> Result<u64, StoreError>;
}

/// Process-local store. Nothing survives a restart.
pub struct MemoryStore {
    records: DashMap<String, CheckOutcome>,
    policy: CooldownPolicy,
}

impl MemoryStore {
    pub fn new(policy: CooldownPolicy) -> Self {
        Self {
            records: DashMap::new(),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(CooldownPolicy::default())
    }
}

#[async_trait]
impl CheckStore for MemoryStore {
    async fn record_check(
        &self,
        candidate: &str,
        is_available: bool,
        status_code: u16,
        message: &str,
    ) -> Result<(), StoreError> {
        let outcome = outcome_from_parts(
            candidate.to_string(),
            Utc::now(),
            is_available,
            status_code,
            message.to_string(),
        );
        self.records.insert(candidate.to_string(), outcome);
        Ok(())
    }

    async fn is_in_cooldown(&self, candidate: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        Ok(self
            .records
            .get(candidate)
            .is_some_and(|r| self.policy.is_active(r.timestamp, r.status_code, now)))
    }

    async fn get_status(&self, candidate: &str) -> Result<Option<CheckOutcome>, StoreError> {
        Ok(self.records.get(candidate).map(|r| r.value().clone()))
    }

    async fn list_recently_available(&self, limit: usize) -> Result<Vec<CheckOutcome>, StoreError> {
        let mut available: Vec<CheckOutcome> = self
            .records
            .iter()
            .filter(|r| r.is_available)
            .map(|r| r.value().clone())
            .collect();
        available.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        available.truncate(limit);
        Ok(available)
    }

    async fn cleanup_old_records(&self, age: Duration) -> Result<u64, StoreError> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(0);
        };
        let before = self.records.len();
        self.records.retain(|_, r| r.timestamp >= cutoff);
        Ok(before.saturating_sub(self.records.len()) as u64)
    }
}

const CREATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS checked_names (
    candidate TEXT PRIMARY KEY,
    checked_at INTEGER NOT NULL,
    is_available INTEGER NOT NULL,
    status_code INTEGER NOT NULL,
    message TEXT NOT NULL
)";

const CREATE_INDEXES_SQL: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS idx_available_checked_at ON checked_names (is_available, checked_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_checked_at ON checked_names (checked_at)",
];

/// SQLite-backed store; the cooldown record survives restarts.
pub struct SqliteStore {
    pool: SqlitePool,
    policy: CooldownPolicy,
}

impl SqliteStore {
    pub async fn open(path: &Path, policy: CooldownPolicy) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE_SQL).execute(&pool).await?;
        for sql in CREATE_INDEXES_SQL {
            sqlx::query(sql).execute(&pool).await?;
        }
        info!("Opened check store at {}", path.display());

        Ok(Self { pool, policy })
    }

    async fn fetch(&self, candidate: &str) -> Result<Option<CheckOutcome>, StoreError> {
        let row = sqlx::query(
            "SELECT candidate, checked_at, is_available, status_code, message
             FROM checked_names WHERE candidate = ?",
        )
        .bind(candidate)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| decode_row(&r)).transpose()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn decode_row(row: &sqlx::sqlite::SqliteRow) -> Result<CheckOutcome, StoreError> {
    let candidate: String = row.try_get("candidate")?;
    let millis: i64 = row.try_get("checked_at")?;
    let is_available: bool = row.try_get("is_available")?;
    let status_code: i64 = row.try_get("status_code")?;
    let message: String = row.try_get("message")?;

    let checked_at = DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        candidate: candidate.clone(),
        reason: format!("timestamp {} out of range", millis),
    })?;
    let status_code = u16::try_from(status_code).map_err(|_| StoreError::Corrupt {
        candidate: candidate.clone(),
        reason: format!("status code {} out of range", status_code),
    })?;

    Ok(outcome_from_parts(
        candidate,
        checked_at,
        is_available,
        status_code,
        message,
    ))
}

#[async_trait]
impl CheckStore for SqliteStore {
    async fn record_check(
        &self,
        candidate: &str,
        is_available: bool,
        status_code: u16,
        message: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO checked_names (candidate, checked_at, is_available, status_code, message)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (candidate) DO UPDATE SET
                checked_at = excluded.checked_at,
                is_available = excluded.is_available,
                status_code = excluded.status_code,
                message = excluded.message",
        )
        .bind(candidate)
        .bind(Utc::now().timestamp_millis())
        .bind(is_available)
        .bind(i64::from(status_code))
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn is_in_cooldown(&self, candidate: &str) -> Result<bool, StoreError> {
        let now = Utc::now();
        Ok(self
            .fetch(candidate)
            .await?
            .is_some_and(|r| self.policy.is_active(r.timestamp, r.status_code, now)))
    }

    async fn get_status(&self, candidate: &str) -> Result<Option<CheckOutcome>, StoreError> {
        self.fetch(candidate).await
    }

    async fn list_recently_available(&self, limit: usize) -> Result<Vec<CheckOutcome>, StoreError> {
        let rows = sqlx::query(
            "SELECT candidate, checked_at, is_available, status_code, message
             FROM checked_names
             WHERE is_available = 1
             ORDER BY checked_at DESC
             LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_row).collect()
    }

    async fn cleanup_old_records(&self, age: Duration) -> Result<u64, StoreError> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .map_or(i64::MIN, |t| t.timestamp_millis());
        let result = sqlx::query("DELETE FROM checked_names WHERE checked_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
