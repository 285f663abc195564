//! # Publisher
//!
//! Serializes envelopes and hands them to the broker for at-least-once
//! delivery. `publish` resolves once the broker has taken the message
//! locally; it never waits for any consumer. Retry on local send failure is
//! deliberately the caller's job (the cursor service, for example, must not
//! advance its cursor until publish succeeds).

use crate::{
    BusMessage, BusResult, ConnectionManager, MessageEnvelope, HEADER_COMMAND_ID,
    HEADER_CORRELATION_ID, HEADER_EVENT_ID,
};
use std::sync::Arc;
use uuid::Uuid;

/// Whether envelopes published through a [`Publisher`] are events or
/// commands; the only difference on the wire is the tracing id header name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Event,
    Command,
}

impl MessageKind {
    fn id_header(self) -> &'static str {
        match self {
            MessageKind::Event => HEADER_EVENT_ID,
            MessageKind::Command => HEADER_COMMAND_ID,
        }
    }
}

/// One failed item of a [`Publisher::publish_batch`] call.
#[derive(Debug)]
pub struct BatchFailure {
    pub id: Uuid,
    pub error: crate::BusError,
}

/// Outcome of a batch publish: sends are independent per item, one failure
/// neither blocks nor rolls back the others, and every failure is reported.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub published: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Publishes envelopes to the main exchange with durability flags and
/// tracing headers.
pub struct Publisher {
    connection: Arc<ConnectionManager>,
    kind: MessageKind,
}

impl Publisher {
    /// Publisher for events (the common case).
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            kind: MessageKind::Event,
        }
    }

    /// Publisher for commands; identical except for the id header name.
    pub fn for_commands(connection: Arc<ConnectionManager>) -> Self {
        Self {
            connection,
            kind: MessageKind::Command,
        }
    }

    /// Publish one envelope under routing key `{entity}.{type}`.
    ///
    /// Headers carry the envelope id and correlation id so the message can
    /// be traced at the broker without deserializing the body. Errors
    /// (connection not ready, encoding failure, local send failure)
    /// propagate to the caller; this layer never retries.
    pub async fn publish(&self, envelope: &MessageEnvelope) -> BusResult<()> {
        let broker = self.connection.broker().await?;

        let payload = serde_json::to_vec(envelope)
            .map_err(|e| crate::BusError::Serialization(e.to_string()))?;

        let message = BusMessage::new(envelope.routing_key(), payload)
            .with_header("content-type", "application/json")
            .with_header(self.kind.id_header(), envelope.id.to_string())
            .with_header(HEADER_CORRELATION_ID, envelope.metadata.correlation_id.clone());

        broker
            .publish(&self.connection.topology().exchange, message)
            .await?;

        tracing::debug!(
            id = %envelope.id,
            routing_key = %envelope.routing_key(),
            correlation_id = %envelope.metadata.correlation_id,
            "message published"
        );

        Ok(())
    }

    /// Best-effort batch publish, independent per item.
    pub async fn publish_batch(&self, envelopes: &[MessageEnvelope]) -> BatchReport {
        let mut report = BatchReport::default();

        for envelope in envelopes {
            match self.publish(envelope).await {
                Ok(()) => report.published += 1,
                Err(e) => {
                    tracing::warn!(
                        id = %envelope.id,
                        routing_key = %envelope.routing_key(),
                        error = %e,
                        "batch item failed to publish"
                    );
                    report.failures.push(BatchFailure {
                        id: envelope.id,
                        error: e,
                    });
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Acknowledge, Broker, BusError, BusResult, Delivery, InMemoryBroker, InMemoryConnector,
        MessageMetadata, QueueSpec, Topology,
    };
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use serde_json::json;
    use std::time::Duration;

    async fn connected_manager() -> Arc<ConnectionManager> {
        let manager = Arc::new(ConnectionManager::new(
            Box::new(InMemoryConnector::default()),
            Topology::default(),
        ));
        manager.connect().await.unwrap();
        manager
    }

    fn order_created(metadata: MessageMetadata) -> MessageEnvelope {
        MessageEnvelope::new(
            "Order",
            "OrderCreated",
            json!({"id": "ord_1"}),
            metadata,
        )
    }

    #[tokio::test]
    async fn test_publish_attaches_tracing_headers() {
        let manager = connected_manager().await;
        let broker = manager.broker().await.unwrap();
        let topology = manager.topology().clone();
        broker
            .declare_queue(&topology.queue_for("audit", "Order", "OrderCreated"))
            .await
            .unwrap();

        let envelope = order_created(MessageMetadata::new("order-service"));
        Publisher::new(manager.clone()).publish(&envelope).await.unwrap();

        let mut deliveries = broker.consume("audit.Order.OrderCreated").await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(1), deliveries.next())
            .await
            .expect("timeout")
            .expect("stream ended");

        assert_eq!(delivery.message.routing_key, "Order.OrderCreated");
        assert_eq!(
            delivery.message.header(HEADER_EVENT_ID),
            Some(envelope.id.to_string().as_str())
        );
        assert_eq!(
            delivery.message.header(HEADER_CORRELATION_ID),
            Some(envelope.metadata.correlation_id.as_str())
        );
        assert_eq!(
            delivery.message.header("content-type"),
            Some("application/json")
        );

        let parsed: MessageEnvelope = serde_json::from_slice(&delivery.message.payload).unwrap();
        assert_eq!(parsed.id, envelope.id);
        delivery.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_command_publisher_uses_command_header() {
        let manager = connected_manager().await;
        let broker = manager.broker().await.unwrap();
        let topology = manager.topology().clone();
        broker
            .declare_queue(&topology.queue_for("crud", "Order", "CancelOrder"))
            .await
            .unwrap();

        let envelope = MessageEnvelope::new(
            "Order",
            "CancelOrder",
            json!({"id": "ord_1"}),
            MessageMetadata::new("api-gateway"),
        );
        Publisher::for_commands(manager.clone())
            .publish(&envelope)
            .await
            .unwrap();

        let mut deliveries = broker.consume("crud.Order.CancelOrder").await.unwrap();
        let delivery = deliveries.next().await.unwrap();

        assert_eq!(
            delivery.message.header(HEADER_COMMAND_ID),
            Some(envelope.id.to_string().as_str())
        );
        assert_eq!(delivery.message.header(HEADER_EVENT_ID), None);
        delivery.acker.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_is_an_error() {
        let manager = Arc::new(ConnectionManager::new(
            Box::new(InMemoryConnector::default()),
            Topology::default(),
        ));

        let envelope = order_created(MessageMetadata::new("order-service"));
        let result = Publisher::new(manager).publish(&envelope).await;

        assert!(matches!(result, Err(BusError::NotConnected)));
    }

    /// Broker wrapper that fails publishes for one routing key.
    struct RejectingBroker {
        inner: InMemoryBroker,
        poisoned_key: String,
    }

    #[async_trait]
    impl Broker for RejectingBroker {
        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        async fn declare_topology(&self, topology: &Topology) -> BusResult<()> {
            self.inner.declare_topology(topology).await
        }

        async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<()> {
            self.inner.declare_queue(spec).await
        }

        async fn publish(&self, exchange: &str, message: crate::BusMessage) -> BusResult<()> {
            if message.routing_key == self.poisoned_key {
                return Err(BusError::Publish("simulated send failure".to_string()));
            }
            self.inner.publish(exchange, message).await
        }

        async fn consume(&self, queue: &str) -> BusResult<BoxStream<'static, Delivery>> {
            self.inner.consume(queue).await
        }

        async fn peek(&self, queue: &str, limit: usize) -> BusResult<Vec<crate::BusMessage>> {
            self.inner.peek(queue, limit).await
        }

        async fn close(&self) -> BusResult<()> {
            self.inner.close().await
        }
    }

    struct RejectingConnector {
        poisoned_key: String,
    }

    #[async_trait]
    impl crate::BrokerConnector for RejectingConnector {
        async fn dial(&self) -> BusResult<Arc<dyn Broker>> {
            Ok(Arc::new(RejectingBroker {
                inner: InMemoryBroker::new(),
                poisoned_key: self.poisoned_key.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_batch_reports_failures_without_blocking_others() {
        let manager = Arc::new(ConnectionManager::new(
            Box::new(RejectingConnector {
                poisoned_key: "Order.OrderUpdated".to_string(),
            }),
            Topology::default(),
        ));
        manager.connect().await.unwrap();

        let good_before = order_created(MessageMetadata::new("order-service"));
        let bad = MessageEnvelope::new(
            "Order",
            "OrderUpdated",
            json!({"id": "ord_2"}),
            MessageMetadata::new("order-service"),
        );
        let good_after = order_created(MessageMetadata::new("order-service"));

        let report = Publisher::new(manager)
            .publish_batch(&[good_before, bad.clone(), good_after])
            .await;

        assert_eq!(report.published, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].id, bad.id);
        assert!(!report.is_complete());
    }
}
