//! Broker topology: exchange and queue naming, retention, dead-letter wiring.

use std::time::Duration;

/// Names and retention for the exchanges this process asserts on connect.
///
/// One durable topic exchange carries normal traffic; a second exchange and
/// a single durable queue bound to it form the dead-letter sink. Messages
/// that exhaust their retry budget, fail to parse, or expire past a queue's
/// TTL all land there, unmodified, for manual inspection and replay.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Durable topic exchange for normal delivery
    pub exchange: String,
    /// Exchange receiving permanently failed messages
    pub dead_letter_exchange: String,
    /// Catch-all durable queue bound to the dead-letter exchange
    pub dead_letter_queue: String,
    /// Default per-queue message TTL; orphaned messages dead-letter instead
    /// of growing a queue unbounded
    pub message_ttl: Duration,
    /// How long dead-lettered messages are retained for inspection
    pub dead_letter_retention: Duration,
    /// Upper bound on unacknowledged deliveries outstanding per consumer
    pub prefetch: u16,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "platform.events".to_string(),
            dead_letter_exchange: "platform.dlq".to_string(),
            dead_letter_queue: "platform.dlq.store".to_string(),
            message_ttl: Duration::from_secs(60 * 60 * 24), // 24h
            dead_letter_retention: Duration::from_secs(60 * 60 * 24 * 30), // 30 days
            prefetch: 32,
        }
    }
}

impl Topology {
    /// Queue spec for one (consumer, entity, message type) subscription.
    ///
    /// Queue name is `{consumer_identity}.{entity}.{type}`; the binding key
    /// `{entity}.{type}` matches the publisher's routing key exactly.
    pub fn queue_for(&self, consumer_identity: &str, entity: &str, message_type: &str) -> QueueSpec {
        QueueSpec {
            name: format!("{consumer_identity}.{entity}.{message_type}"),
            exchange: self.exchange.clone(),
            binding_key: format!("{entity}.{message_type}"),
            message_ttl: Some(self.message_ttl),
            dead_letter_exchange: Some(self.dead_letter_exchange.clone()),
        }
    }

    /// Spec for the catch-all dead-letter queue itself: bound to everything
    /// on the dead-letter exchange, no TTL, no further dead-lettering.
    pub fn dead_letter_queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.dead_letter_queue.clone(),
            exchange: self.dead_letter_exchange.clone(),
            binding_key: "#".to_string(),
            message_ttl: None,
            dead_letter_exchange: None,
        }
    }
}

/// A durable queue bound to an exchange on a routing-key pattern.
#[derive(Debug, Clone)]
pub struct QueueSpec {
    pub name: String,
    pub exchange: String,
    /// Topic pattern: `*` matches one dot-separated token, `#` the rest
    pub binding_key: String,
    pub message_ttl: Option<Duration>,
    /// Where expired or rejected messages are routed; `None` only for the
    /// dead-letter queue itself
    pub dead_letter_exchange: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_naming() {
        let topology = Topology::default();
        let spec = topology.queue_for("search-indexer", "Order", "OrderCreated");

        assert_eq!(spec.name, "search-indexer.Order.OrderCreated");
        assert_eq!(spec.binding_key, "Order.OrderCreated");
        assert_eq!(spec.exchange, "platform.events");
        assert_eq!(spec.dead_letter_exchange.as_deref(), Some("platform.dlq"));
        assert_eq!(spec.message_ttl, Some(Duration::from_secs(86_400)));
    }

    #[test]
    fn test_dead_letter_queue_spec_is_catch_all() {
        let topology = Topology::default();
        let spec = topology.dead_letter_queue_spec();

        assert_eq!(spec.name, "platform.dlq.store");
        assert_eq!(spec.binding_key, "#");
        assert!(spec.message_ttl.is_none());
        assert!(spec.dead_letter_exchange.is_none());
    }
}
