//! # Message Bus Client
//!
//! A platform-level client for event-driven messaging between services.
//!
//! ## Why This Lives in Tier 1
//!
//! Every service talks to the broker through this crate. Placing it in
//! `platform/` allows:
//! - Services to depend on the bus without depending on each other
//! - Config-driven swap between NATS (production) and InMemory (dev/test)
//! - One place that owns topology, retry policy, and dead-letter routing
//!
//! ## Pieces
//!
//! - [`ConnectionManager`]: owns the single logical broker connection,
//!   bounded reconnect backoff, and topology bootstrap
//! - [`Publisher`]: serializes envelopes and hands them to the broker with
//!   durability flags and tracing headers
//! - [`Dispatcher`]: binds one durable queue per handler and runs handlers
//!   with bounded in-process retry before ack or dead-letter
//! - [`DeadLetterSink`]: peek-only inspection of permanently failed messages
//!
//! ## Usage
//!
//! ```rust,no_run
//! use message_bus::{ConnectionManager, InMemoryConnector, Publisher, Topology};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = Arc::new(ConnectionManager::new(
//!     Box::new(InMemoryConnector::default()),
//!     Topology::default(),
//! ));
//! manager.connect().await?;
//!
//! let publisher = Publisher::new(manager.clone());
//! # Ok(())
//! # }
//! ```

mod connection;
mod dead_letter;
mod dispatcher;
mod envelope;
mod inmemory_broker;
mod nats_broker;
mod publisher;
mod topology;

pub mod retry;

pub use connection::{
    BrokerConnector, ConnectionManager, ConnectionState, InMemoryConnector, NatsConnector,
};
pub use dead_letter::{DeadLetter, DeadLetterSink};
pub use dispatcher::{Dispatcher, HandlerError, MessageHandler};
pub use envelope::{
    CustomerSnapshot, DeletionNotice, MessageEnvelope, MessageMetadata, MessagePayload,
    OrderSnapshot, ProductSnapshot,
};
pub use inmemory_broker::InMemoryBroker;
pub use nats_broker::NatsBroker;
pub use publisher::{BatchFailure, BatchReport, MessageKind, Publisher};
pub use topology::{QueueSpec, Topology};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Header carrying the envelope id for broker-level tracing.
pub const HEADER_EVENT_ID: &str = "x-event-id";
/// Header carrying the envelope id when the message is a command.
pub const HEADER_COMMAND_ID: &str = "x-command-id";
/// Header mirroring `metadata.correlationId`.
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";
/// Dead-letter header: why the message was routed here.
pub const HEADER_DEATH_REASON: &str = "x-death-reason";
/// Dead-letter header: in-process attempts made before routing here.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Dead-letter header: routing key the message was originally published with.
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";

/// A message as it travels through the broker: routing key, headers, bytes.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The `entity.type` routing key the message was published with
    pub routing_key: String,
    /// Transport headers (tracing ids, content type, dead-letter metadata)
    pub headers: HashMap<String, String>,
    /// The message payload (raw envelope bytes, never mutated in transit)
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(routing_key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            routing_key: routing_key.into(),
            headers: HashMap::new(),
            payload,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A single delivery pulled from a queue, awaiting exactly one ack or reject.
pub struct Delivery {
    pub message: BusMessage,
    /// True when the broker has delivered this message before (crash recovery)
    pub redelivered: bool,
    pub acker: DeliveryAck,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.message.routing_key)
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Terminal-outcome handle for one delivery.
///
/// Exactly one of `ack` or `reject` must be invoked per delivery. Dropping
/// the handle without either (a crash mid-handler) leaves the message
/// unacknowledged, and the broker redelivers it.
#[async_trait]
pub trait Acknowledge: Send {
    /// Confirm successful processing; the broker discards the message.
    async fn ack(self: Box<Self>) -> BusResult<()>;

    /// Negatively acknowledge without requeue; the broker routes the
    /// message, unmodified, to the queue's dead-letter target.
    async fn reject(self: Box<Self>, reason: &str, attempts: u32) -> BusResult<()>;
}

pub type DeliveryAck = Box<dyn Acknowledge>;

/// Errors that can occur when using the message bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),

    #[error("connection attempts exhausted after {attempts} tries: {last_error}")]
    ConnectExhausted { attempts: u32, last_error: String },

    #[error("not connected to broker")]
    NotConnected,

    #[error("topology setup failed: {0}")]
    Topology(String),

    #[error("failed to publish message: {0}")]
    Publish(String),

    #[error("failed to subscribe to queue: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl BusError {
    /// Fatal errors are not worth retrying; the process should fail fast.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::ConnectExhausted { .. })
    }
}

/// Result type for message bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Client-side view of a broker: topology declaration, publish, consume.
///
/// The broker itself (durable exchanges, queues, per-message acks) is an
/// external collaborator; implementations of this trait speak its protocol.
/// Production uses [`NatsBroker`]; tests and local dev use [`InMemoryBroker`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Whether the underlying transport is still usable. A broker that
    /// reports false is treated as a lost connection by the
    /// [`ConnectionManager`].
    fn is_open(&self) -> bool;

    /// Assert the durable main exchange plus the dead-letter exchange and
    /// its catch-all queue. Idempotent; run once per successful connect.
    async fn declare_topology(&self, topology: &Topology) -> BusResult<()>;

    /// Idempotently create a durable queue and bind it to its exchange.
    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<()>;

    /// Hand one message to an exchange for at-least-once delivery. Resolves
    /// when the broker has taken responsibility for the message (local send
    /// plus publish confirm where the transport supports it).
    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()>;

    /// Consume deliveries from a previously declared queue, one at a time.
    async fn consume(&self, queue: &str) -> BusResult<BoxStream<'static, Delivery>>;

    /// Retrieve up to `limit` messages without removing them (peek).
    async fn peek(&self, queue: &str, limit: usize) -> BusResult<Vec<BusMessage>>;

    /// Release transport resources. Safe to call multiple times.
    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Broker")
    }
}
