//! The poll loop: scan every tracked entity type, publish unseen rows in
//! commit order, advance cursors as each publish lands.

use crate::{CaptureError, ChangeLog, ChangeOp, ChangeRow, CursorStore};
use message_bus::{MessageEnvelope, MessageMetadata, Publisher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Tuning for one capture service instance.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Entity types scanned each tick, in this order
    pub entity_types: Vec<String>,
    pub poll_interval: Duration,
    /// Rows fetched per entity type per tick
    pub batch_limit: i64,
    /// Stamped into `metadata.source` of every published envelope
    pub source: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            entity_types: Vec::new(),
            poll_interval: Duration::from_secs(5),
            batch_limit: 500,
            source: "change-capture".to_string(),
        }
    }
}

/// What one full scan cycle did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub published: usize,
    /// Rows that can never translate (unrecognized operation); cursor
    /// advanced past them so they are not retried forever
    pub skipped: usize,
    pub failed_entity_types: usize,
}

/// Polls the change log and republishes rows as domain events.
pub struct CaptureService {
    log: Arc<dyn ChangeLog>,
    cursors: Arc<dyn CursorStore>,
    publisher: Publisher,
    config: CaptureConfig,
}

impl CaptureService {
    pub fn new(
        log: Arc<dyn ChangeLog>,
        cursors: Arc<dyn CursorStore>,
        publisher: Publisher,
        config: CaptureConfig,
    ) -> Self {
        Self {
            log,
            cursors,
            publisher,
            config,
        }
    }

    /// Run until `stop` turns true. Ticks never overlap: the next tick
    /// starts only after the previous cycle fully completed, and an
    /// in-flight cycle runs to completion before the loop exits.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            entity_types = ?self.config.entity_types,
            interval_ms = self.config.poll_interval.as_millis(),
            "capture service started"
        );

        loop {
            if *stop.borrow() {
                break;
            }

            let summary = self.run_cycle().await;
            if summary.published > 0 || summary.failed_entity_types > 0 {
                tracing::info!(
                    published = summary.published,
                    skipped = summary.skipped,
                    failed_entity_types = summary.failed_entity_types,
                    "capture cycle finished"
                );
            }

            tokio::select! {
                _ = stop.changed() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        tracing::info!("capture service stopped");
    }

    /// One full scan across all tracked entity types.
    ///
    /// A failure in one entity type (query error, publish error) is logged
    /// and does not abort the cycle for the others; that entity type's
    /// cursor stays put and the same rows are retried next tick.
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary::default();

        for entity_type in &self.config.entity_types {
            match self.capture_entity(entity_type).await {
                Ok((published, skipped)) => {
                    summary.published += published;
                    summary.skipped += skipped;
                }
                Err(e) => {
                    tracing::error!(
                        entity_type = %entity_type,
                        error = %e,
                        "capture failed; cursor not advanced, retrying next tick"
                    );
                    summary.failed_entity_types += 1;
                }
            }
        }

        summary
    }

    async fn capture_entity(&self, entity_type: &str) -> Result<(usize, usize), CaptureError> {
        let cursor = self.cursors.load(entity_type).await?;
        let after = cursor.as_ref().map(|c| c.last_seen_id);
        let rows = self
            .log
            .fetch_after(entity_type, after, self.config.batch_limit)
            .await?;

        let mut published = 0;
        let mut skipped = 0;

        for row in rows {
            match self.envelope_for(&row) {
                Some(envelope) => {
                    // publish first; the cursor moves only once the broker
                    // has the event. A crash in between duplicates the event
                    // next tick, which consumers dedupe on envelope id.
                    self.publisher.publish(&envelope).await?;
                    self.cursors.advance(entity_type, row.id).await?;
                    published += 1;

                    tracing::debug!(
                        row_id = row.id,
                        entity_type = %entity_type,
                        message_type = %envelope.message_type,
                        id = %envelope.id,
                        "change row published"
                    );
                }
                None => {
                    tracing::warn!(
                        row_id = row.id,
                        entity_type = %entity_type,
                        operation = %row.operation,
                        "unrecognized change operation, skipping row"
                    );
                    self.cursors.advance(entity_type, row.id).await?;
                    skipped += 1;
                }
            }
        }

        Ok((published, skipped))
    }

    fn envelope_for(&self, row: &ChangeRow) -> Option<MessageEnvelope> {
        let op = ChangeOp::parse(&row.operation)?;
        let message_type = format!("{}{}", row.entity_type, op.event_suffix());

        // a captured row starts its own causal chain
        Some(MessageEnvelope::new(
            row.entity_type.clone(),
            message_type,
            row.snapshot.clone(),
            MessageMetadata::new(self.config.source.clone()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryChangeLog, InMemoryCursorStore};
    use async_trait::async_trait;
    use message_bus::{Broker, ConnectionManager, InMemoryConnector, QueueSpec, Topology};
    use serde_json::json;

    struct Harness {
        manager: Arc<ConnectionManager>,
        log: Arc<InMemoryChangeLog>,
        cursors: Arc<InMemoryCursorStore>,
    }

    impl Harness {
        async fn new() -> Self {
            let manager = Arc::new(ConnectionManager::new(
                Box::new(InMemoryConnector::default()),
                Topology::default(),
            ));
            manager.connect().await.unwrap();
            Self {
                manager,
                log: Arc::new(InMemoryChangeLog::new()),
                cursors: Arc::new(InMemoryCursorStore::new()),
            }
        }

        fn service(&self, entity_types: &[&str]) -> CaptureService {
            CaptureService::new(
                self.log.clone(),
                self.cursors.clone(),
                Publisher::new(self.manager.clone()),
                CaptureConfig {
                    entity_types: entity_types.iter().map(|s| s.to_string()).collect(),
                    ..CaptureConfig::default()
                },
            )
        }

        /// Tap the bus with a wildcard-bound queue so tests can read what
        /// was published, in order.
        async fn tap(&self, name: &str, binding_key: &str) -> Arc<dyn Broker> {
            let broker = self.manager.broker().await.unwrap();
            broker
                .declare_queue(&QueueSpec {
                    name: name.to_string(),
                    exchange: self.manager.topology().exchange.clone(),
                    binding_key: binding_key.to_string(),
                    message_ttl: None,
                    dead_letter_exchange: None,
                })
                .await
                .unwrap();
            broker
        }

        async fn last_seen(&self, entity_type: &str) -> Option<i64> {
            self.cursors
                .load(entity_type)
                .await
                .unwrap()
                .map(|c| c.last_seen_id)
        }
    }

    #[tokio::test]
    async fn test_second_cycle_publishes_nothing_new() {
        let harness = Harness::new().await;
        harness
            .log
            .record("Order", "ord_1", ChangeOp::Created, json!({"id": "ord_1"}));
        harness
            .log
            .record("Order", "ord_1", ChangeOp::Updated, json!({"id": "ord_1"}));
        let service = harness.service(&["Order"]);

        let first = service.run_cycle().await;
        assert_eq!(first.published, 2);

        let second = service.run_cycle().await;
        assert_eq!(second.published, 0);
        assert_eq!(second.failed_entity_types, 0);
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic_across_cycles() {
        let harness = Harness::new().await;
        harness
            .log
            .record("Order", "ord_1", ChangeOp::Created, json!({"id": "ord_1"}));
        let service = harness.service(&["Order"]);

        service.run_cycle().await;
        let after_first = harness.last_seen("Order").await.unwrap();

        service.run_cycle().await;
        let after_second = harness.last_seen("Order").await.unwrap();
        assert!(after_second >= after_first);

        harness
            .log
            .record("Order", "ord_2", ChangeOp::Created, json!({"id": "ord_2"}));
        service.run_cycle().await;
        let after_third = harness.last_seen("Order").await.unwrap();
        assert!(after_third > after_second);
    }

    #[tokio::test]
    async fn test_rows_publish_in_commit_order() {
        let harness = Harness::new().await;
        let broker = harness.tap("tap.orders", "Order.#").await;
        for n in 1..=4 {
            harness.log.record(
                "Order",
                &format!("ord_{n}"),
                ChangeOp::Created,
                json!({"id": format!("ord_{n}")}),
            );
        }

        harness.service(&["Order"]).run_cycle().await;

        let messages = broker.peek("tap.orders", 10).await.unwrap();
        assert_eq!(messages.len(), 4);
        for (n, message) in messages.iter().enumerate() {
            let envelope: MessageEnvelope = serde_json::from_slice(&message.payload).unwrap();
            assert_eq!(envelope.data["id"], format!("ord_{}", n + 1));
            assert_eq!(envelope.message_type, "OrderCreated");
            assert_eq!(envelope.metadata.source, "change-capture");
        }
    }

    #[tokio::test]
    async fn test_publish_failure_leaves_cursor_for_next_tick() {
        let harness = Harness::new().await;
        harness
            .log
            .record("Order", "ord_1", ChangeOp::Created, json!({"id": "ord_1"}));
        let service = harness.service(&["Order"]);

        // drop the connection out from under the publisher
        harness.manager.disconnect().await.unwrap();
        let summary = service.run_cycle().await;
        assert_eq!(summary.published, 0);
        assert_eq!(summary.failed_entity_types, 1);
        assert_eq!(harness.last_seen("Order").await, None);

        // reconnect: the same row publishes on the next tick
        harness.manager.connect().await.unwrap();
        let summary = service.run_cycle().await;
        assert_eq!(summary.published, 1);
        assert!(harness.last_seen("Order").await.is_some());
    }

    /// Change log that fails queries for one entity type.
    struct PartiallyBrokenLog {
        inner: Arc<InMemoryChangeLog>,
        broken_entity_type: String,
    }

    #[async_trait]
    impl ChangeLog for PartiallyBrokenLog {
        async fn fetch_after(
            &self,
            entity_type: &str,
            after: Option<i64>,
            limit: i64,
        ) -> Result<Vec<ChangeRow>, CaptureError> {
            if entity_type == self.broken_entity_type {
                return Err(CaptureError::Log("simulated query failure".to_string()));
            }
            self.inner.fetch_after(entity_type, after, limit).await
        }
    }

    #[tokio::test]
    async fn test_one_entity_type_failing_does_not_abort_the_cycle() {
        let harness = Harness::new().await;
        harness
            .log
            .record("Order", "ord_1", ChangeOp::Created, json!({"id": "ord_1"}));
        harness
            .log
            .record("Customer", "cus_1", ChangeOp::Created, json!({"id": "cus_1"}));

        let service = CaptureService::new(
            Arc::new(PartiallyBrokenLog {
                inner: harness.log.clone(),
                broken_entity_type: "Customer".to_string(),
            }),
            harness.cursors.clone(),
            Publisher::new(harness.manager.clone()),
            CaptureConfig {
                entity_types: vec!["Customer".to_string(), "Order".to_string()],
                ..CaptureConfig::default()
            },
        );

        let summary = service.run_cycle().await;
        assert_eq!(summary.failed_entity_types, 1);
        assert_eq!(summary.published, 1);
        assert!(harness.last_seen("Order").await.is_some());
        assert_eq!(harness.last_seen("Customer").await, None);
    }

    #[tokio::test]
    async fn test_unrecognized_operation_is_skipped_not_poisonous() {
        let harness = Harness::new().await;
        harness.log.insert(ChangeRow {
            id: 1,
            entity_type: "Order".to_string(),
            entity_id: "ord_1".to_string(),
            operation: "vacuumed".to_string(),
            snapshot: json!({}),
            recorded_at: chrono::Utc::now(),
        });
        harness
            .log
            .record("Order", "ord_2", ChangeOp::Created, json!({"id": "ord_2"}));
        let service = harness.service(&["Order"]);

        let summary = service.run_cycle().await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.published, 1);

        // the bad row does not come back next tick
        let summary = service.run_cycle().await;
        assert_eq!(summary, CycleSummary::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_flag_after_finishing_cycle() {
        let harness = Harness::new().await;
        harness
            .log
            .record("Order", "ord_1", ChangeOp::Created, json!({"id": "ord_1"}));
        let service = harness.service(&["Order"]);

        let (stop_tx, stop_rx) = watch::channel(false);
        let run = tokio::spawn(async move { service.run(stop_rx).await });

        // let the first cycle complete, then stop
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        run.await.unwrap();

        assert_eq!(harness.last_seen("Order").await, Some(1));
    }
}
