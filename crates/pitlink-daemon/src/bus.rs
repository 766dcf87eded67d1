//! Message-bus transport.
//!
//! Accepted packets leave the daemon through a durable fan-out exchange;
//! every bound consumer (persistence, live dashboard) gets every message.
//! The pipeline talks to the bus through the [`BusTransport`] /
//! [`BusChannel`] seams so tests can capture traffic in memory.
//!
//! Channels are per-worker and never shared: AMQP client channels are not
//! safe for concurrent publishing.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ExchangeKind};
use thiserror::Error;

/// The fan-out exchange all packet traffic goes through.
pub const EXCHANGE_NAME: &str = "full_packets";

/// Content type of every published message.
pub const CONTENT_TYPE: &str = "application/octet-stream";

/// Errors from the bus transport.
#[derive(Debug, Error)]
pub enum BusError {
    /// The initial connection failed.
    #[error("bus connection failed: {0}")]
    Connect(String),

    /// Channel or exchange setup failed.
    #[error("bus channel setup failed: {0}")]
    ChannelSetup(String),

    /// A publish failed; the packet is dropped, never retried.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// A connection that can hand out publish channels.
#[async_trait]
pub trait BusTransport: Send + Sync {
    /// Opens a fresh channel bound to the fan-out exchange. Called once per
    /// worker.
    async fn open_channel(&self) -> Result<Box<dyn BusChannel>, BusError>;
}

/// A single worker's publish channel.
#[async_trait]
pub trait BusChannel: Send {
    /// Publishes one envelope body to the exchange with an empty routing
    /// key.
    async fn publish(&mut self, body: Vec<u8>) -> Result<(), BusError>;
}

/// AMQP transport backed by lapin.
pub struct LapinTransport {
    conn: lapin::Connection,
}

impl LapinTransport {
    /// Connects to the broker at `url`.
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let conn = lapin::Connection::connect(url, lapin::ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl BusTransport for LapinTransport {
    async fn open_channel(&self) -> Result<Box<dyn BusChannel>, BusError> {
        let channel = self
            .conn
            .create_channel()
            .await
            .map_err(|e| BusError::ChannelSetup(e.to_string()))?;

        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::ChannelSetup(e.to_string()))?;

        Ok(Box::new(LapinChannel { channel }))
    }
}

struct LapinChannel {
    channel: lapin::Channel,
}

#[async_trait]
impl BusChannel for LapinChannel {
    async fn publish(&mut self, body: Vec<u8>) -> Result<(), BusError> {
        self.channel
            .basic_publish(
                EXCHANGE_NAME,
                "",
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &body,
                BasicProperties::default().with_content_type(CONTENT_TYPE.into()),
            )
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;

        Ok(())
    }
}

/// In-memory transport: published bodies land in a shared vector. For tests
/// and local runs without a broker.
#[derive(Default)]
pub struct MemoryTransport {
    published: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_publishes: bool,
}

impl MemoryTransport {
    /// A transport that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose channels fail every publish.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            published: Arc::default(),
            fail_publishes: true,
        }
    }

    /// Everything published so far, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl BusTransport for MemoryTransport {
    async fn open_channel(&self) -> Result<Box<dyn BusChannel>, BusError> {
        Ok(Box::new(MemoryChannel {
            published: Arc::clone(&self.published),
            fail_publishes: self.fail_publishes,
        }))
    }
}

struct MemoryChannel {
    published: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_publishes: bool,
}

#[async_trait]
impl BusChannel for MemoryChannel {
    async fn publish(&mut self, body: Vec<u8>) -> Result<(), BusError> {
        if self.fail_publishes {
            return Err(BusError::Publish("memory transport set to fail".into()));
        }

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(body);
        Ok(())
    }
}
