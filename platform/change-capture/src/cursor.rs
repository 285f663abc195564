//! Per-entity-type capture cursors.
//!
//! One row per entity type bookmarks the last change-log id already
//! translated into an event. `last_seen_id` is monotonically non-decreasing;
//! both stores enforce that even if an advance arrives out of order.

use crate::CaptureError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;

/// Bookmark for one entity type.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Cursor {
    pub entity_type: String,
    pub last_seen_id: i64,
    pub last_sync_time: DateTime<Utc>,
}

/// Durable storage for capture cursors. Single-writer per entity type:
/// only the capture service's poll loop touches these rows.
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, entity_type: &str) -> Result<Option<Cursor>, CaptureError>;

    /// Record that everything up to `last_seen_id` has been published.
    /// Never moves a cursor backwards.
    async fn advance(&self, entity_type: &str, last_seen_id: i64) -> Result<(), CaptureError>;
}

/// Postgres-backed cursor store.
pub struct PgCursorStore {
    pool: PgPool,
}

impl PgCursorStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CursorStore for PgCursorStore {
    async fn load(&self, entity_type: &str) -> Result<Option<Cursor>, CaptureError> {
        sqlx::query_as::<_, Cursor>(
            r#"
            SELECT entity_type, last_seen_id, last_sync_time
            FROM capture_cursors
            WHERE entity_type = $1
            "#,
        )
        .bind(entity_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CaptureError::Cursor(e.to_string()))
    }

    async fn advance(&self, entity_type: &str, last_seen_id: i64) -> Result<(), CaptureError> {
        sqlx::query(
            r#"
            INSERT INTO capture_cursors (entity_type, last_seen_id, last_sync_time)
            VALUES ($1, $2, NOW())
            ON CONFLICT (entity_type) DO UPDATE
            SET last_seen_id = GREATEST(capture_cursors.last_seen_id, EXCLUDED.last_seen_id),
                last_sync_time = NOW()
            "#,
        )
        .bind(entity_type)
        .bind(last_seen_id)
        .execute(&self.pool)
        .await
        .map_err(|e| CaptureError::Cursor(e.to_string()))?;

        Ok(())
    }
}

/// In-memory cursor store for tests and local development.
#[derive(Default)]
pub struct InMemoryCursorStore {
    cursors: Mutex<HashMap<String, Cursor>>,
}

impl InMemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self, entity_type: &str) -> Result<Option<Cursor>, CaptureError> {
        Ok(self.cursors.lock().unwrap().get(entity_type).cloned())
    }

    async fn advance(&self, entity_type: &str, last_seen_id: i64) -> Result<(), CaptureError> {
        let mut cursors = self.cursors.lock().unwrap();
        cursors
            .entry(entity_type.to_string())
            .and_modify(|cursor| {
                cursor.last_seen_id = cursor.last_seen_id.max(last_seen_id);
                cursor.last_sync_time = Utc::now();
            })
            .or_insert_with(|| Cursor {
                entity_type: entity_type.to_string(),
                last_seen_id,
                last_sync_time: Utc::now(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cursor_starts_absent() {
        let store = InMemoryCursorStore::new();
        assert!(store.load("Order").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advance_never_moves_backwards() {
        let store = InMemoryCursorStore::new();
        store.advance("Order", 10).await.unwrap();
        store.advance("Order", 7).await.unwrap();

        let cursor = store.load("Order").await.unwrap().unwrap();
        assert_eq!(cursor.last_seen_id, 10);

        store.advance("Order", 12).await.unwrap();
        let cursor = store.load("Order").await.unwrap().unwrap();
        assert_eq!(cursor.last_seen_id, 12);
    }

    #[tokio::test]
    async fn test_entity_types_are_independent() {
        let store = InMemoryCursorStore::new();
        store.advance("Order", 5).await.unwrap();
        store.advance("Customer", 9).await.unwrap();

        assert_eq!(store.load("Order").await.unwrap().unwrap().last_seen_id, 5);
        assert_eq!(
            store.load("Customer").await.unwrap().unwrap().last_seen_id,
            9
        );
    }
}
