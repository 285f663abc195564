//! In-memory implementation of the [`Broker`] trait for testing and development.

use crate::{
    Acknowledge, Broker, BusError, BusMessage, BusResult, Delivery, DeliveryAck, QueueSpec,
    Topology, HEADER_DEATH_REASON, HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Broker implementation backed by in-process queues.
///
/// Suitable for unit tests, local development without a broker container,
/// and integration tests that need fast, isolated delivery. It models the
/// parts of a real broker this crate relies on: topic bindings, per-message
/// ack/reject, dead-letter routing, message TTL, and redelivery of
/// deliveries that were dropped without a terminal outcome.
///
/// # Example
/// ```rust
/// use message_bus::{Acknowledge, Broker, BusMessage, InMemoryBroker, Topology};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let topology = Topology::default();
/// broker.declare_topology(&topology).await?;
/// broker
///     .declare_queue(&topology.queue_for("audit", "Order", "OrderCreated"))
///     .await?;
///
/// broker
///     .publish(&topology.exchange, BusMessage::new("Order.OrderCreated", b"{}".to_vec()))
///     .await?;
///
/// let mut deliveries = broker.consume("audit.Order.OrderCreated").await?;
/// let delivery = deliveries.next().await.unwrap();
/// delivery.acker.ack().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    closed: AtomicBool,
    exchanges: Mutex<HashMap<String, Vec<Binding>>>,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
}

#[derive(Clone)]
struct Binding {
    pattern: String,
    queue: String,
}

struct QueueState {
    spec: QueueSpec,
    ready: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

#[derive(Clone)]
struct StoredMessage {
    message: BusMessage,
    enqueued_at: Instant,
    delivery_count: u32,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring a closed broker back up; queues and their contents survive.
    /// Used by the in-memory connector, where a re-dial is a reopen.
    pub(crate) fn reopen(&self) {
        self.inner.closed.store(false, Ordering::SeqCst);
    }

    /// Check whether a routing key matches a binding pattern.
    ///
    /// Topic semantics over dot-separated tokens:
    /// - `*` matches exactly one token
    /// - `#` matches zero or more tokens
    fn matches_topic(routing_key: &str, pattern: &str) -> bool {
        let key: Vec<&str> = routing_key.split('.').collect();
        let pat: Vec<&str> = pattern.split('.').collect();

        let mut k = 0;
        let mut p = 0;

        while k < key.len() && p < pat.len() {
            match pat[p] {
                "#" => return true,
                "*" => {
                    k += 1;
                    p += 1;
                }
                token if token == key[k] => {
                    k += 1;
                    p += 1;
                }
                _ => return false,
            }
        }

        // trailing `#` matches zero remaining tokens
        if k == key.len() && p == pat.len() - 1 && pat[p] == "#" {
            return true;
        }

        k == key.len() && p == pat.len()
    }
}

impl BrokerInner {
    /// Fan a message out to every queue whose binding matches its routing key.
    fn route(&self, exchange: &str, message: BusMessage) -> BusResult<()> {
        let bindings = self
            .exchanges
            .lock()
            .unwrap()
            .get(exchange)
            .cloned()
            .ok_or_else(|| BusError::Publish(format!("unknown exchange '{exchange}'")))?;

        let queues = self.queues.lock().unwrap();
        for binding in &bindings {
            if !InMemoryBroker::matches_topic(&message.routing_key, &binding.pattern) {
                continue;
            }
            if let Some(queue) = queues.get(&binding.queue) {
                queue.ready.lock().unwrap().push_back(StoredMessage {
                    message: message.clone(),
                    enqueued_at: Instant::now(),
                    delivery_count: 0,
                });
                queue.notify.notify_one();
            }
        }

        Ok(())
    }

    /// Route a message to the queue's dead-letter exchange, payload
    /// unmodified, delivery metadata added as headers.
    fn dead_letter(&self, spec: &QueueSpec, stored: StoredMessage, reason: &str, attempts: u32) {
        let Some(dlx) = &spec.dead_letter_exchange else {
            tracing::warn!(
                queue = %spec.name,
                routing_key = %stored.message.routing_key,
                reason = %reason,
                "message dropped: queue has no dead-letter exchange"
            );
            return;
        };

        let original_key = stored.message.routing_key.clone();
        let message = stored
            .message
            .with_header(HEADER_DEATH_REASON, reason)
            .with_header(HEADER_RETRY_COUNT, attempts.to_string())
            .with_header(HEADER_ORIGINAL_ROUTING_KEY, original_key);

        if let Err(e) = self.route(dlx, message) {
            tracing::error!(
                queue = %spec.name,
                dead_letter_exchange = %dlx,
                error = %e,
                "failed to dead-letter message"
            );
        } else {
            tracing::warn!(
                queue = %spec.name,
                reason = %reason,
                attempts = attempts,
                "message routed to dead-letter exchange"
            );
        }
    }

    /// Pop the next live message, dead-lettering any expired ones in front.
    fn pop_ready(&self, queue: &QueueState) -> Option<StoredMessage> {
        let (expired, next) = {
            let mut ready = queue.ready.lock().unwrap();
            let mut expired = Vec::new();
            let mut next = None;

            while let Some(front) = ready.front() {
                let past_ttl = queue
                    .spec
                    .message_ttl
                    .is_some_and(|ttl| front.enqueued_at.elapsed() >= ttl);
                if past_ttl {
                    expired.push(ready.pop_front().unwrap());
                } else {
                    next = ready.pop_front();
                    break;
                }
            }

            (expired, next)
        };

        for stored in expired {
            self.dead_letter(&queue.spec, stored, "expired", 0);
        }

        next.map(|mut stored| {
            stored.delivery_count += 1;
            stored
        })
    }
}

struct InMemoryAcker {
    inner: Arc<BrokerInner>,
    queue: Arc<QueueState>,
    stored: Option<StoredMessage>,
}

#[async_trait]
impl Acknowledge for InMemoryAcker {
    async fn ack(mut self: Box<Self>) -> BusResult<()> {
        self.stored.take();
        Ok(())
    }

    async fn reject(mut self: Box<Self>, reason: &str, attempts: u32) -> BusResult<()> {
        if let Some(stored) = self.stored.take() {
            self.inner.dead_letter(&self.queue.spec, stored, reason, attempts);
        }
        Ok(())
    }
}

impl Drop for InMemoryAcker {
    fn drop(&mut self) {
        // Delivery dropped without a terminal outcome: put the message back
        // at the front so the broker redelivers it.
        if let Some(stored) = self.stored.take() {
            self.queue.ready.lock().unwrap().push_front(stored);
            self.queue.notify.notify_one();
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    async fn declare_topology(&self, topology: &Topology) -> BusResult<()> {
        {
            let mut exchanges = self.inner.exchanges.lock().unwrap();
            exchanges.entry(topology.exchange.clone()).or_default();
            exchanges
                .entry(topology.dead_letter_exchange.clone())
                .or_default();
        }
        self.declare_queue(&topology.dead_letter_queue_spec()).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> BusResult<()> {
        self.inner
            .queues
            .lock()
            .unwrap()
            .entry(spec.name.clone())
            .or_insert_with(|| {
                Arc::new(QueueState {
                    spec: spec.clone(),
                    ready: Mutex::new(VecDeque::new()),
                    notify: Notify::new(),
                })
            });

        let mut exchanges = self.inner.exchanges.lock().unwrap();
        let bindings = exchanges.entry(spec.exchange.clone()).or_default();
        let already_bound = bindings
            .iter()
            .any(|b| b.pattern == spec.binding_key && b.queue == spec.name);
        if !already_bound {
            bindings.push(Binding {
                pattern: spec.binding_key.clone(),
                queue: spec.name.clone(),
            });
        }

        Ok(())
    }

    async fn publish(&self, exchange: &str, message: BusMessage) -> BusResult<()> {
        if !self.is_open() {
            return Err(BusError::Publish("broker is closed".to_string()));
        }
        self.inner.route(exchange, message)
    }

    async fn consume(&self, queue: &str) -> BusResult<BoxStream<'static, Delivery>> {
        let queue = self
            .inner
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .ok_or_else(|| BusError::Subscribe(format!("unknown queue '{queue}'")))?;
        let inner = self.inner.clone();

        let stream = async_stream::stream! {
            loop {
                let notified = queue.notify.notified();
                if let Some(stored) = inner.pop_ready(&queue) {
                    let message = stored.message.clone();
                    let redelivered = stored.delivery_count > 1;
                    let acker: DeliveryAck = Box::new(InMemoryAcker {
                        inner: inner.clone(),
                        queue: queue.clone(),
                        stored: Some(stored),
                    });
                    yield Delivery { message, redelivered, acker };
                    continue;
                }
                notified.await;
            }
        };

        Ok(stream.boxed())
    }

    async fn peek(&self, queue: &str, limit: usize) -> BusResult<Vec<BusMessage>> {
        let queue = self
            .inner
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .cloned()
            .ok_or_else(|| BusError::Subscribe(format!("unknown queue '{queue}'")))?;

        let ready = queue.ready.lock().unwrap();
        Ok(ready
            .iter()
            .take(limit)
            .map(|stored| stored.message.clone())
            .collect())
    }

    async fn close(&self) -> BusResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
