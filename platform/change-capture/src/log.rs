//! The append-only change log and its readers.
//!
//! Every entity write appends one row holding the entity state at commit
//! time. Row ids come from the log's own strictly-increasing sequence; the
//! capture service relies on that ordering and nothing else.

use crate::CaptureError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// What happened to the entity in this row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Created,
    Updated,
    Deleted,
}

impl ChangeOp {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(Self::Created),
            "updated" => Some(Self::Updated),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// Suffix of the event type this operation produces, e.g.
    /// `Order` + `created` → `OrderCreated`.
    pub fn event_suffix(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
            Self::Deleted => "Deleted",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

/// One appended change-log row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChangeRow {
    /// Strictly increasing log id; the cursor bookmarks these
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    /// "created" | "updated" | "deleted"
    pub operation: String,
    /// Entity state at commit time; becomes the event `data` verbatim
    pub snapshot: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

/// Read access to the change log.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Rows for `entity_type` with `id > after`, ascending by id, at most
    /// `limit`. `after = None` means nothing has been seen yet.
    async fn fetch_after(
        &self,
        entity_type: &str,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Vec<ChangeRow>, CaptureError>;
}

/// Postgres-backed change log reader.
pub struct PgChangeLog {
    pool: PgPool,
}

impl PgChangeLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChangeLog for PgChangeLog {
    async fn fetch_after(
        &self,
        entity_type: &str,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Vec<ChangeRow>, CaptureError> {
        sqlx::query_as::<_, ChangeRow>(
            r#"
            SELECT id, entity_type, entity_id, operation, snapshot, recorded_at
            FROM change_log
            WHERE entity_type = $1 AND id > $2
            ORDER BY id ASC
            LIMIT $3
            "#,
        )
        .bind(entity_type)
        .bind(after.unwrap_or(0))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| CaptureError::Log(e.to_string()))
    }
}

/// In-memory change log for tests and local development.
pub struct InMemoryChangeLog {
    rows: Mutex<Vec<ChangeRow>>,
    next_id: AtomicI64,
}

impl Default for InMemoryChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChangeLog {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Append a row with the next sequential id; returns the id.
    pub fn record(
        &self,
        entity_type: &str,
        entity_id: &str,
        operation: ChangeOp,
        snapshot: serde_json::Value,
    ) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().unwrap().push(ChangeRow {
            id,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            operation: operation.as_str().to_string(),
            snapshot,
            recorded_at: Utc::now(),
        });
        id
    }

    /// Append a row verbatim, explicit id included.
    pub fn insert(&self, row: ChangeRow) {
        let floor = row.id + 1;
        self.next_id.fetch_max(floor, Ordering::SeqCst);
        self.rows.lock().unwrap().push(row);
    }
}

#[async_trait]
impl ChangeLog for InMemoryChangeLog {
    async fn fetch_after(
        &self,
        entity_type: &str,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Vec<ChangeRow>, CaptureError> {
        let after = after.unwrap_or(0);
        let mut rows: Vec<ChangeRow> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| row.entity_type == entity_type && row.id > after)
            .cloned()
            .collect();
        rows.sort_by_key(|row| row.id);
        rows.truncate(limit as usize);
        Ok(rows)
    }
}
