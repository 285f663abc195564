//! # Message Envelope
//!
//! The shared wire shape for events and commands crossing the bus.
//!
//! ## Envelope Fields
//!
//! - `id`: unique identifier, generated once, used for idempotency and tracing
//! - `type`: string discriminator (e.g. "OrderCreated")
//! - `entity`: owning aggregate name (e.g. "Order"); `entity.type` forms the
//!   routing key
//! - `timestamp`: creation time, never delivery or processing time
//! - `data`: type-specific payload, decoded on demand via [`MessagePayload`]
//! - `metadata`: source, correlation id, optional user/tenant, schema version
//!
//! `correlationId` is propagated unchanged by every hop that re-publishes a
//! derived message; use [`MessageMetadata::derived`] when doing so.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Immutable message envelope carrying an event or command.
///
/// # Examples
///
/// ```rust
/// use message_bus::{MessageEnvelope, MessageMetadata};
/// use serde_json::json;
///
/// let envelope = MessageEnvelope::new(
///     "Order",
///     "OrderCreated",
///     json!({"id": "ord_123", "status": "pending"}),
///     MessageMetadata::new("order-service"),
/// );
/// assert_eq!(envelope.routing_key(), "Order.OrderCreated");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message identifier (idempotency key)
    pub id: Uuid,

    /// Message type discriminator, e.g. "OrderCreated"
    #[serde(rename = "type")]
    pub message_type: String,

    /// Owning aggregate name, e.g. "Order"
    pub entity: String,

    /// Creation time (ISO 8601 on the wire), set once, never mutated
    pub timestamp: DateTime<Utc>,

    /// Type-specific payload; shape is keyed by `type`
    pub data: serde_json::Value,

    pub metadata: MessageMetadata,
}

/// Routing and tracing metadata carried by every envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    /// Service that produced the message
    pub source: String,

    /// Threads a causal chain of messages across asynchronous hops
    pub correlation_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    /// Payload schema version, for safe evolution
    pub version: u32,
}

impl MessageMetadata {
    /// Metadata for a message that starts a new causal chain.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            correlation_id: Uuid::new_v4().to_string(),
            user_id: None,
            tenant_id: None,
            version: 1,
        }
    }

    /// Metadata for a message derived from `parent`: the correlation id is
    /// carried over unchanged, everything else belongs to the new hop.
    pub fn derived(parent: &MessageMetadata, source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            correlation_id: parent.correlation_id.clone(),
            user_id: parent.user_id.clone(),
            tenant_id: parent.tenant_id.clone(),
            version: 1,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }
}

impl MessageEnvelope {
    /// Create a new envelope with a generated id and creation timestamp.
    pub fn new(
        entity: impl Into<String>,
        message_type: impl Into<String>,
        data: serde_json::Value,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            message_type: message_type.into(),
            entity: entity.into(),
            timestamp: Utc::now(),
            data,
            metadata,
        }
    }

    /// Create an envelope with an explicit id (useful for testing).
    pub fn with_id(
        id: Uuid,
        entity: impl Into<String>,
        message_type: impl Into<String>,
        data: serde_json::Value,
        metadata: MessageMetadata,
    ) -> Self {
        Self {
            id,
            message_type: message_type.into(),
            entity: entity.into(),
            timestamp: Utc::now(),
            data,
            metadata,
        }
    }

    /// The broker routing key, `{entity}.{type}`, casing as given.
    pub fn routing_key(&self) -> String {
        format!("{}.{}", self.entity, self.message_type)
    }

    /// Decode `data` into the closed payload sum type keyed by `type`.
    ///
    /// Unrecognized type strings decode to [`MessagePayload::Unknown`];
    /// a known type whose data does not match its shape is an error.
    pub fn payload(&self) -> Result<MessagePayload, serde_json::Error> {
        MessagePayload::decode(&self.message_type, &self.data)
    }
}

/// Closed sum of the payload shapes this platform knows how to carry.
///
/// Keyed by the envelope `type` discriminator. The `Unknown` variant keeps
/// forward compatibility: a consumer built before a new type shipped can
/// still route, dead-letter, and log the message without understanding it.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    OrderCreated(OrderSnapshot),
    OrderUpdated(OrderSnapshot),
    OrderDeleted(DeletionNotice),
    CustomerCreated(CustomerSnapshot),
    CustomerUpdated(CustomerSnapshot),
    CustomerDeleted(DeletionNotice),
    ProductCreated(ProductSnapshot),
    ProductUpdated(ProductSnapshot),
    ProductDeleted(DeletionNotice),
    Unknown {
        message_type: String,
        data: serde_json::Value,
    },
}

impl MessagePayload {
    pub fn decode(message_type: &str, data: &serde_json::Value) -> Result<Self, serde_json::Error> {
        fn parse<T: serde::de::DeserializeOwned>(
            data: &serde_json::Value,
        ) -> Result<T, serde_json::Error> {
            serde_json::from_value(data.clone())
        }

        Ok(match message_type {
            "OrderCreated" => Self::OrderCreated(parse(data)?),
            "OrderUpdated" => Self::OrderUpdated(parse(data)?),
            "OrderDeleted" => Self::OrderDeleted(parse(data)?),
            "CustomerCreated" => Self::CustomerCreated(parse(data)?),
            "CustomerUpdated" => Self::CustomerUpdated(parse(data)?),
            "CustomerDeleted" => Self::CustomerDeleted(parse(data)?),
            "ProductCreated" => Self::ProductCreated(parse(data)?),
            "ProductUpdated" => Self::ProductUpdated(parse(data)?),
            "ProductDeleted" => Self::ProductDeleted(parse(data)?),
            other => Self::Unknown {
                message_type: other.to_string(),
                data: data.clone(),
            },
        })
    }
}

/// Order state at commit time, as recorded in the change log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderSnapshot {
    pub id: String,
    pub customer_id: String,
    pub status: String,
    pub total_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerSnapshot {
    pub id: String,
    pub email: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub id: String,
    pub sku: String,
    pub name: String,
    pub price_cents: i64,
}

/// Payload for `*Deleted` messages: only the identity survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionNotice {
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_creation() {
        let envelope = MessageEnvelope::new(
            "Order",
            "OrderCreated",
            json!({"id": "ord_1"}),
            MessageMetadata::new("order-service"),
        );

        assert_eq!(envelope.entity, "Order");
        assert_eq!(envelope.message_type, "OrderCreated");
        assert_eq!(envelope.routing_key(), "Order.OrderCreated");
        assert_eq!(envelope.metadata.source, "order-service");
        assert_eq!(envelope.metadata.version, 1);
        assert!(envelope.metadata.user_id.is_none());
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let envelope = MessageEnvelope::new(
            "Order",
            "OrderCreated",
            json!({"id": "ord_1"}),
            MessageMetadata::new("order-service").with_tenant_id("tenant-9"),
        );

        let wire = serde_json::to_value(&envelope).unwrap();

        assert!(wire.get("type").is_some());
        assert!(wire.get("id").is_some());
        assert!(wire.get("timestamp").is_some());
        let metadata = wire.get("metadata").unwrap();
        assert!(metadata.get("correlationId").is_some());
        assert_eq!(
            metadata.get("tenantId").and_then(|v| v.as_str()),
            Some("tenant-9")
        );
        // absent options are omitted, not null
        assert!(metadata.get("userId").is_none());
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = MessageEnvelope::new(
            "Customer",
            "CustomerUpdated",
            json!({"id": "cus_7", "email": "a@b.test", "name": "Ada"}),
            MessageMetadata::new("crud-service").with_user_id("usr_1"),
        );

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let parsed: MessageEnvelope = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed.id, envelope.id);
        assert_eq!(parsed.timestamp, envelope.timestamp);
        assert_eq!(parsed.metadata.correlation_id, envelope.metadata.correlation_id);
        assert_eq!(parsed.metadata.user_id.as_deref(), Some("usr_1"));
    }

    #[test]
    fn test_derived_metadata_propagates_correlation_id() {
        let origin = MessageMetadata::new("order-service").with_tenant_id("tenant-1");
        let hop = MessageMetadata::derived(&origin, "cache-updater");

        assert_eq!(hop.correlation_id, origin.correlation_id);
        assert_eq!(hop.source, "cache-updater");
        assert_eq!(hop.tenant_id.as_deref(), Some("tenant-1"));
    }

    #[test]
    fn test_payload_decodes_known_type() {
        let envelope = MessageEnvelope::new(
            "Order",
            "OrderCreated",
            json!({
                "id": "ord_42",
                "customerId": "cus_1",
                "status": "pending",
                "totalCents": 12_50,
                "currency": "USD"
            }),
            MessageMetadata::new("order-service"),
        );

        match envelope.payload().unwrap() {
            MessagePayload::OrderCreated(order) => {
                assert_eq!(order.id, "ord_42");
                assert_eq!(order.total_cents, 1250);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_payload_unknown_type_falls_back() {
        let envelope = MessageEnvelope::new(
            "Shipment",
            "ShipmentDispatched",
            json!({"id": "shp_1"}),
            MessageMetadata::new("shipping"),
        );

        match envelope.payload().unwrap() {
            MessagePayload::Unknown { message_type, data } => {
                assert_eq!(message_type, "ShipmentDispatched");
                assert_eq!(data, json!({"id": "shp_1"}));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_payload_known_type_with_bad_shape_is_error() {
        let envelope = MessageEnvelope::new(
            "Order",
            "OrderCreated",
            json!({"id": 42}),
            MessageMetadata::new("order-service"),
        );

        assert!(envelope.payload().is_err());
    }
}
