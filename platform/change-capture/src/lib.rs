//! # Change Capture
//!
//! Converts an append-only relational change log into an ordered,
//! deduplicated event stream, without a native replication feed.
//!
//! A [`CaptureService`] polls the log on a fixed interval. For each tracked
//! entity type it reads the rows past its stored cursor in commit order,
//! publishes one envelope per row through the bus, and advances the cursor
//! only after the publish succeeded. A crash between publish and cursor
//! write duplicates that event on the next tick: delivery is at-least-once,
//! and consumers dedupe on the envelope id.
//!
//! Ordering guarantee: per entity type, events reach the bus in the order
//! the log recorded them. There is no cross-entity-type ordering.

mod cursor;
mod log;
mod service;

pub use cursor::{Cursor, CursorStore, InMemoryCursorStore, PgCursorStore};
pub use log::{ChangeLog, ChangeOp, ChangeRow, InMemoryChangeLog, PgChangeLog};
pub use service::{CaptureConfig, CaptureService, CycleSummary};

/// Errors raised while capturing change rows.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("change log query failed: {0}")]
    Log(String),

    #[error("cursor store failed: {0}")]
    Cursor(String),

    #[error(transparent)]
    Publish(#[from] message_bus::BusError),
}
