//! NATS JetStream implementation of the [`Broker`] trait.
//!
//! Mapping onto JetStream primitives:
//! - exchange → stream (subjects `{exchange}.>`, retention = message TTL)
//! - queue → durable pull consumer filtered on `{exchange}.{binding}`
//! - routing key → subject suffix under the exchange prefix
//! - reject → publish the unmodified payload to the dead-letter stream,
//!   then ack the source delivery
//!
//! Publishes go through JetStream publish acks, so `publish` resolves only
//! once the server has accepted responsibility for the message.

use crate::{
    Acknowledge, Broker, BusError, BusMessage, BusResult, Delivery, DeliveryAck, QueueSpec,
    Topology, HEADER_DEATH_REASON, HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use async_nats::jetstream::{self, consumer, stream};
use async_nats::Client;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Production [`Broker`] backed by a NATS JetStream server.
///
/// # Example
/// ```rust,no_run
/// use message_bus::NatsBroker;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = async_nats::connect("nats://localhost:4222").await?;
/// let broker = NatsBroker::new(client);
/// # Ok(())
/// # }
/// ```
pub struct NatsBroker {
    client: Client,
    jetstream: jetstream::Context,
    prefetch: AtomicU16,
    queues: Mutex<HashMap<String, QueueSpec>>,
}

impl NatsBroker {
    /// Wrap an already-connected NATS client.
    pub fn new(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            prefetch: AtomicU16::new(32),
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// JetStream stream names cannot contain dots.
    fn stream_name(exchange: &str) -> String {
        exchange.replace('.', "_").to_uppercase()
    }

    /// Durable consumer names cannot contain dots either.
    fn consumer_name(queue: &str) -> String {
        queue.replace('.', "_")
    }

    /// Binding patterns use topic wildcards; NATS spells "rest" as `>`.
    fn filter_subject(spec: &QueueSpec) -> String {
        let pattern = spec
            .binding_key
            .split('.')
            .map(|token| if token == "#" { ">" } else { token })
            .collect::<Vec<_>>()
            .join(".");
        format!("{}.{}", spec.exchange, pattern)
    }

    async fn ensure_stream(&self, exchange: &str, retention: Duration) -> BusResult<()> {
        let name = Self::stream_name(exchange);
        let config = stream::Config {
            name: name.clone(),
            subjects: vec![format!("{exchange}.>")],
            max_age: retention,
            ..Default::default()
        };

        if self.jetstream.get_stream(&name).await.is_err() {
            self.jetstream
                .create_stream(config)
                .await
                .map_err(|e| BusError::Topology(e.to_string()))?;
            tracing::info!(stream = %name, "created stream");
        }

        Ok(())
    }

    fn spec_for(&self, queue: &str) -> BusResult<QueueSpec> {
        self.queues
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .ok_or_else(|| BusError::Subscribe(format!("unknown queue '{queue}'")))
    }

    fn header_map(headers: &HashMap<String, String>) -> async_nats::HeaderMap {
        let mut map = async_nats::HeaderMap::new();
        for (name, value) in headers {
            map.insert(name.as_str(), value.as_str());
        }
        map
    }

    fn bus_message(exchange: &str, message: &async_nats::Message) -> BusMessage {
        let routing_key = message
            .subject
            .as_str()
            .strip_prefix(&format!("{exchange}."))
            .unwrap_or(message.subject.as_str())
            .to_string();

        let mut headers = HashMap::new();
        if let Some(nats_headers) = &message.headers {
            for (name, values) in nats_headers.iter() {
                if let Some(value) = values.first() {
                    headers.insert(name.to_string(), value.to_string());
                }
            }
        }

        BusMessage {
            routing_key,
            headers,
            payload: message.payload.to_vec(),
        }
    }
}

struct NatsAcker {
    message: jetstream::Message,
    jetstream: jetstream::Context,
    dead_letter_exchange: Option<String>,
    bus_message: BusMessage,
}

#[async_trait]
impl Acknowledge for NatsAcker {
    async fn ack(self: Box<Self>) -> BusResult<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Internal(e.to_string()))
    }

    async fn reject(self: Box<Self>, reason: &str, attempts: u32) -> BusResult<()> {
        if let Some(dlx) = &self.dead_letter_exchange {
            let mut headers = self.bus_message.headers.clone();
            headers.insert(HEADER_DEATH_REASON.to_string(), reason.to_string());
            headers.insert(HEADER_RETRY_COUNT.to_string(), attempts.to_string());
            headers.insert(
                HEADER_ORIGINAL_ROUTING_KEY.to_string(),
                self.bus_message.routing_key.clone(),
            );

            let subject = format!("{dlx}.{}", self.bus_message.routing_key);
            self.jetstream
                .publish_with_headers(
                    subject,
                    NatsBroker::header_map(&headers),
                    self.bus_message.payload.clone().into(),
                )
                .await
                .map_err(|e| BusError::Publish(e.to_string()))?
                .await
                .map_err(|e| BusError::Publish(e.to_string()))?;
        }

        // remove from the source queue only once the dead-letter write stuck
        self.message
            .ack()
            .await
            .map_err(|e| BusError::Internal(e.to_string()))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn is_open(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    async fn declare_topology(&self, topology: &Topology) -> BusResult<()> {
        self.prefetch.store(topology.prefetch, Ordering::SeqCst);
        self.ensure_stream(&topology.exchange, topology.message_ttl)
            .await?;
        self.ensure_stream(
            &topology.dead_letter_exchange,
            topology.dead_letter_retention,
        )
        .await?;
        self.declare_queue(&topology.dead_letter_queue_spec()).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<()> {
        let stream = self
            .jetstream
            .get_stream(Self::stream_name(&spec.exchange))
            .await
            .map_err(|e| BusError::Topology(e.to_string()))?;

        let name = Self::consumer_name(&spec.name);
        let config = consumer::pull::Config {
            durable_name: Some(name.clone()),
            filter_subject: Self::filter_subject(spec),
            ack_policy: consumer::AckPolicy::Explicit,
            max_ack_pending: self.prefetch.load(Ordering::SeqCst) as i64,
            ..Default::default()
        };

        stream
            .get_or_create_consumer(&name, config)
            .await
            .map_err(|e| BusError::Topology(e.to_string()))?;

        self.queues
            .lock()
            .unwrap()
            .insert(spec.name.clone(), spec.clone());

        Ok(())
    }

    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()> {
        let subject = format!("{exchange}.{}", message.routing_key);
        self.jetstream
            .publish_with_headers(
                subject,
                Self::header_map(&message.headers),
                message.payload.into(),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        Ok(())
    }

    async fn consume(&self, queue: &str) -> BusResult<BoxStream<'static, Delivery>> {
        let spec = self.spec_for(queue)?;
        let stream = self
            .jetstream
            .get_stream(Self::stream_name(&spec.exchange))
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        let consumer: consumer::Consumer<consumer::pull::Config> = stream
            .get_consumer(&Self::consumer_name(&spec.name))
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let jetstream = self.jetstream.clone();
        let exchange = spec.exchange.clone();
        let dead_letter_exchange = spec.dead_letter_exchange.clone();

        let deliveries = async_stream::stream! {
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(error = %e, "consumer stream error, stopping");
                        break;
                    }
                };

                let bus_message = NatsBroker::bus_message(&exchange, &message);
                let redelivered = message
                    .info()
                    .map(|info| info.delivered > 1)
                    .unwrap_or(false);

                let acker: DeliveryAck = Box::new(NatsAcker {
                    message,
                    jetstream: jetstream.clone(),
                    dead_letter_exchange: dead_letter_exchange.clone(),
                    bus_message: bus_message.clone(),
                });

                yield Delivery {
                    message: bus_message,
                    redelivered,
                    acker,
                };
            }
        };

        Ok(deliveries.boxed())
    }

    async fn peek(&self, queue: &str, limit: usize) -> BusResult<Vec<BusMessage>> {
        let spec = self.spec_for(queue)?;
        let stream = self
            .jetstream
            .get_stream(Self::stream_name(&spec.exchange))
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        // ephemeral consumer, nothing acked: the messages stay in place
        let consumer = stream
            .create_consumer(consumer::pull::Config {
                filter_subject: Self::filter_subject(&spec),
                ack_policy: consumer::AckPolicy::None,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let mut batch = consumer
            .fetch()
            .max_messages(limit)
            .messages()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        let mut peeked = Vec::new();
        while let Some(next) = batch.next().await {
            match next {
                Ok(message) => peeked.push(Self::bus_message(&spec.exchange, &message)),
                Err(e) => {
                    tracing::warn!(error = %e, "fetch error while peeking");
                    break;
                }
            }
        }

        Ok(peeked)
    }

    async fn close(&self) -> BusResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Internal(e.to_string()))
    }
}
