//! # Connection Manager
//!
//! Owns the single logical broker connection for a process.
//!
//! `connect()` dials with bounded exponential backoff and asserts topology
//! once per successful connect. Reconnection is caller-driven: when the
//! connection drops asynchronously, the manager flips to `Disconnected` and
//! callers see [`BusError::NotConnected`] on their next publish or subscribe;
//! it never spins a background retry loop of its own.

use crate::{Broker, BusError, BusResult, InMemoryBroker, NatsBroker, Topology};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Dial attempts before `connect()` gives up with a fatal error.
const MAX_DIAL_ATTEMPTS: u32 = 6;
/// Cap on the exponential reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// `Disconnected → Connecting → Connected → Disconnected`, with
/// `Disconnecting` on graceful stop. No other transitions exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Establishes one transport connection per call.
///
/// The seam between the manager's retry/state discipline and the actual
/// transport, so the backoff policy is testable and the transport is
/// config-swappable.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn dial(&self) -> BusResult<Arc<dyn Broker>>;
}

/// Connects to a NATS server and wraps it in a [`NatsBroker`].
pub struct NatsConnector {
    url: String,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl BrokerConnector for NatsConnector {
    async fn dial(&self) -> BusResult<Arc<dyn Broker>> {
        let client = async_nats::connect(&self.url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Arc::new(NatsBroker::new(client)))
    }
}

/// Hands out the same [`InMemoryBroker`] on every dial, so reconnects keep
/// previously queued messages. Never fails.
#[derive(Default)]
pub struct InMemoryConnector {
    broker: InMemoryBroker,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(broker: InMemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryConnector {
    async fn dial(&self) -> BusResult<Arc<dyn Broker>> {
        self.broker.reopen();
        Ok(Arc::new(self.broker.clone()))
    }
}

struct ManagerInner {
    state: ConnectionState,
    broker: Option<Arc<dyn Broker>>,
}

/// Maintains exactly one live logical connection to the broker.
///
/// One instance per process; [`crate::Publisher`], [`crate::Dispatcher`], and
/// [`crate::DeadLetterSink`] each hold a handle to it and never the
/// connection itself.
pub struct ConnectionManager {
    connector: Box<dyn BrokerConnector>,
    topology: Topology,
    inner: Mutex<ManagerInner>,
}

impl ConnectionManager {
    pub fn new(connector: Box<dyn BrokerConnector>, topology: Topology) -> Self {
        Self {
            connector,
            topology,
            inner: Mutex::new(ManagerInner {
                state: ConnectionState::Disconnected,
                broker: None,
            }),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.state == ConnectionState::Connected
            && inner.broker.as_ref().is_some_and(|b| b.is_open())
    }

    /// Establish the connection and assert topology. Idempotent: a call
    /// while already connected is a no-op.
    ///
    /// Dials up to a fixed attempt ceiling, waiting
    /// `min(1s * 2^failures, 30s)` between attempts; exhausting the ceiling
    /// returns the fatal [`BusError::ConnectExhausted`]. The process is
    /// expected to fail fast on it, not spin.
    pub async fn connect(&self) -> BusResult<()> {
        let mut inner = self.inner.lock().await;

        if inner.state == ConnectionState::Connected
            && inner.broker.as_ref().is_some_and(|b| b.is_open())
        {
            return Ok(());
        }

        inner.state = ConnectionState::Connecting;
        inner.broker = None;

        let mut failures = 0u32;
        loop {
            match self.connector.dial().await {
                Ok(broker) => {
                    if let Err(e) = broker.declare_topology(&self.topology).await {
                        inner.state = ConnectionState::Disconnected;
                        return Err(e);
                    }
                    inner.broker = Some(broker);
                    inner.state = ConnectionState::Connected;
                    tracing::info!(exchange = %self.topology.exchange, "connected to broker");
                    return Ok(());
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_DIAL_ATTEMPTS {
                        inner.state = ConnectionState::Disconnected;
                        tracing::error!(
                            attempts = failures,
                            error = %e,
                            "broker connection attempts exhausted"
                        );
                        return Err(BusError::ConnectExhausted {
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }

                    let backoff = Self::backoff_after(failures);
                    tracing::warn!(
                        attempt = failures,
                        backoff_ms = backoff.as_millis(),
                        error = %e,
                        "broker connection failed, backing off"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    /// `min(1s * 2^(failures-1), 30s)`: 1s, 2s, 4s, 8s, 16s, then capped.
    fn backoff_after(failures: u32) -> Duration {
        let factor = 1u32 << (failures - 1).min(16);
        std::cmp::min(Duration::from_secs(1).saturating_mul(factor), MAX_BACKOFF)
    }

    /// Close channel then connection, releasing resources. Safe to call
    /// multiple times.
    pub async fn disconnect(&self) -> BusResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(broker) = inner.broker.take() else {
            inner.state = ConnectionState::Disconnected;
            return Ok(());
        };

        inner.state = ConnectionState::Disconnecting;
        let result = broker.close().await;
        inner.state = ConnectionState::Disconnected;
        tracing::info!("disconnected from broker");
        result
    }

    /// Handle to the live broker, or [`BusError::NotConnected`].
    ///
    /// Detects asynchronous connection loss here: a broker that reports
    /// itself closed flips the manager to `Disconnected`, and the caller
    /// may re-invoke [`Self::connect`].
    pub async fn broker(&self) -> BusResult<Arc<dyn Broker>> {
        let mut inner = self.inner.lock().await;

        if inner.state != ConnectionState::Connected {
            return Err(BusError::NotConnected);
        }

        match &inner.broker {
            Some(broker) if broker.is_open() => Ok(broker.clone()),
            _ => {
                inner.state = ConnectionState::Disconnected;
                inner.broker = None;
                tracing::warn!("broker connection lost");
                Err(BusError::NotConnected)
            }
        }
    }
}
