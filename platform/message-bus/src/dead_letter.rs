//! # Dead-Letter Sink
//!
//! Peek-only inspection of permanently failed messages.
//!
//! Messages land here after exhausting their retry budget, failing to
//! parse, or expiring past a queue TTL. Nothing is reprocessed
//! automatically: an operator inspects via [`DeadLetterSink::drain`],
//! remediates, and replays by re-publishing through the normal
//! [`crate::Publisher`].

use crate::{
    BusResult, ConnectionManager, MessageEnvelope, HEADER_DEATH_REASON,
    HEADER_ORIGINAL_ROUTING_KEY, HEADER_RETRY_COUNT,
};
use std::sync::Arc;

/// One dead-lettered message: the original envelope plus the delivery
/// metadata the broker attached when routing it here.
#[derive(Debug)]
pub struct DeadLetter {
    pub envelope: MessageEnvelope,
    /// Routing key the message was originally published with
    pub original_routing_key: Option<String>,
    /// Why it was dead-lettered (handler error, "malformed message", "expired")
    pub reason: Option<String>,
    /// In-process attempts made before it was routed here
    pub retry_count: Option<u32>,
}

pub struct DeadLetterSink {
    connection: Arc<ConnectionManager>,
}

impl DeadLetterSink {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Retrieve up to `limit` dead-lettered messages without removing them.
    ///
    /// Entries whose payload no longer parses as an envelope are logged and
    /// skipped, never fatal: the sink must stay inspectable even when it
    /// holds garbage (that is often why a message is here at all).
    pub async fn drain(&self, limit: usize) -> BusResult<Vec<DeadLetter>> {
        let broker = self.connection.broker().await?;
        let queue = &self.connection.topology().dead_letter_queue;
        let messages = broker.peek(queue, limit).await?;

        let mut letters = Vec::with_capacity(messages.len());
        for message in messages {
            let envelope: MessageEnvelope = match serde_json::from_slice(&message.payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(
                        routing_key = %message.routing_key,
                        error = %e,
                        "skipping unparseable dead-letter entry"
                    );
                    continue;
                }
            };

            letters.push(DeadLetter {
                envelope,
                original_routing_key: message
                    .header(HEADER_ORIGINAL_ROUTING_KEY)
                    .map(str::to_string),
                reason: message.header(HEADER_DEATH_REASON).map(str::to_string),
                retry_count: message
                    .header(HEADER_RETRY_COUNT)
                    .and_then(|v| v.parse().ok()),
            });
        }

        Ok(letters)
    }
}
