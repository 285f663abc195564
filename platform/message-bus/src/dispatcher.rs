//! # Dispatcher
//!
//! Binds one durable queue per (consumer, entity, message type) and runs the
//! registered handler for each delivery with bounded in-process retry.
//!
//! Every delivery reaches exactly one terminal outcome: acknowledged after a
//! successful handler run, or rejected to the dead-letter exchange after the
//! retry budget is spent. A crash mid-handler leaves the delivery
//! unacknowledged and the broker redelivers it, so handlers must be
//! idempotent on the envelope `id`.
//!
//! The handler registry is owned by the dispatcher instance and torn down
//! with it; it is never process-global state.

use crate::retry::{run_with_retry, RetryPolicy};
use crate::{BusResult, ConnectionManager, Delivery, MessageEnvelope};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Business-logic failure while processing one delivery. Retried up to the
/// dispatcher's attempt budget, then dead-lettered.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A consumer's entry point: one handler per message type it cares about.
///
/// Must be safe to invoke more than once for the same envelope `id`;
/// at-least-once delivery and in-process retry both cause duplicates.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<(), HandlerError>;
}

struct Subscription {
    handler: Arc<dyn MessageHandler>,
    // dropping the sender stops that queue's consume loop
    stop: watch::Sender<bool>,
}

struct DispatcherInner {
    connection: Arc<ConnectionManager>,
    identity: String,
    retry: RetryPolicy,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Subscribes handlers to queues and drives their consume loops.
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// `consumer_identity` prefixes every queue this dispatcher declares,
    /// e.g. "search-indexer".
    pub fn new(connection: Arc<ConnectionManager>, consumer_identity: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connection,
                identity: consumer_identity.into(),
                retry: RetryPolicy::default(),
                subscriptions: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_retry_policy(
        connection: Arc<ConnectionManager>,
        consumer_identity: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                connection,
                identity: consumer_identity.into(),
                retry,
                subscriptions: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register `handler` for `{entity}.{message_type}`.
    ///
    /// Idempotently declares the durable queue
    /// `{consumer_identity}.{entity}.{message_type}`, binds it to the main
    /// exchange, and starts its consume loop. Subscribing the same key again
    /// replaces the handler.
    pub async fn subscribe(
        &self,
        entity: &str,
        message_type: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> BusResult<()> {
        let broker = self.inner.connection.broker().await?;
        let spec = self
            .inner
            .connection
            .topology()
            .queue_for(&self.inner.identity, entity, message_type);

        broker.declare_queue(&spec).await?;
        let stream = broker.consume(&spec.name).await?;

        let (stop_tx, stop_rx) = watch::channel(false);
        self.inner.subscriptions.lock().unwrap().insert(
            spec.name.clone(),
            Subscription {
                handler,
                stop: stop_tx,
            },
        );

        tracing::info!(
            queue = %spec.name,
            binding_key = %spec.binding_key,
            "handler subscribed"
        );

        let inner = self.inner.clone();
        let queue_name = spec.name.clone();
        let task = tokio::spawn(async move {
            inner.consume_loop(queue_name, stream, stop_rx).await;
        });
        self.inner.tasks.lock().unwrap().push(task);

        Ok(())
    }

    /// Remove the handler and stop its consume loop. The queue and its
    /// binding survive: queue lifecycle is independent of one process's
    /// registration state.
    pub fn unsubscribe(&self, entity: &str, message_type: &str) {
        let queue_name = format!("{}.{entity}.{message_type}", self.inner.identity);
        let removed = self
            .inner
            .subscriptions
            .lock()
            .unwrap()
            .remove(&queue_name);

        if removed.is_some() {
            tracing::info!(queue = %queue_name, "handler unsubscribed");
        }
    }

    /// Stop pulling new deliveries on every queue, let in-flight handler
    /// invocations finish, and tear the registry down.
    pub async fn shutdown(&self) {
        {
            let subscriptions = self.inner.subscriptions.lock().unwrap();
            for subscription in subscriptions.values() {
                let _ = subscription.stop.send(true);
            }
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }

        self.inner.subscriptions.lock().unwrap().clear();
        tracing::info!(identity = %self.inner.identity, "dispatcher stopped");
    }
}

impl DispatcherInner {
    async fn consume_loop(
        self: Arc<Self>,
        queue_name: String,
        mut stream: BoxStream<'static, Delivery>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    // stop requested, or the subscription was dropped
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
                maybe_delivery = stream.next() => {
                    let Some(delivery) = maybe_delivery else { break };

                    let handler = self
                        .subscriptions
                        .lock()
                        .unwrap()
                        .get(&queue_name)
                        .map(|s| s.handler.clone());
                    let Some(handler) = handler else {
                        // unregistered between pull and dispatch; leave the
                        // delivery unresolved so the broker redelivers it
                        drop(delivery);
                        break;
                    };

                    self.process_delivery(&queue_name, handler, delivery).await;
                }
            }
        }

        tracing::debug!(queue = %queue_name, "consume loop stopped");
    }

    /// Drive one delivery to its terminal outcome.
    async fn process_delivery(
        &self,
        queue_name: &str,
        handler: Arc<dyn MessageHandler>,
        delivery: Delivery,
    ) {
        let Delivery {
            message,
            redelivered,
            acker,
        } = delivery;

        // Malformed payloads are permanent failures: retrying garbage
        // wastes cycles, so they go straight to the dead-letter queue.
        let envelope: MessageEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    queue = %queue_name,
                    routing_key = %message.routing_key,
                    error = %e,
                    "malformed message, dead-lettering without retry"
                );
                if let Err(reject_err) = acker.reject("malformed message", 1).await {
                    tracing::error!(queue = %queue_name, error = %reject_err, "reject failed");
                }
                return;
            }
        };

        let span = tracing::info_span!(
            "handle_message",
            id = %envelope.id,
            queue = %queue_name,
            routing_key = %message.routing_key,
            correlation_id = %envelope.metadata.correlation_id,
            redelivered = redelivered
        );

        async {
            let result = run_with_retry(&self.retry, queue_name, || {
                let handler = handler.clone();
                let envelope = envelope.clone();
                async move { handler.handle(&envelope).await }
            })
            .await;

            match result {
                Ok(()) => {
                    if let Err(e) = acker.ack().await {
                        tracing::error!(error = %e, "ack failed");
                    }
                }
                Err(exhausted) => {
                    tracing::error!(
                        error = %exhausted.last_error,
                        attempts = exhausted.attempts,
                        "handler failed after retries, dead-lettering"
                    );
                    let reason = exhausted.last_error.to_string();
                    if let Err(e) = acker.reject(&reason, exhausted.attempts).await {
                        tracing::error!(error = %e, "reject failed");
                    }
                }
            }
        }
        .instrument(span)
        .await;
    }
}
