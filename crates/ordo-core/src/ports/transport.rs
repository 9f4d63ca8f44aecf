//! Transport port: an AMQP-shaped message broker connection.
//!
//! One `Transport` value is one connection with one channel. The queue
//! layer on top decides routing, delays and envelopes; the transport only
//! moves bytes with the following guarantees:
//! - Durable queues and persistent messages survive a broker restart.
//! - Priority queues deliver highest priority first, FIFO within a level.
//! - A queue with a message TTL dead-letters expired messages to its
//!   dead-letter routing key.
//! - A queue declared with an expiry is deleted once it has gone unused
//!   (not redeclared, not consumed) for that long and holds no messages.
//! - Deliveries are never auto-acknowledged; an unsettled delivery returns
//!   to its queue when the connection goes away.
//! - In transaction mode, publishes become visible only on commit.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::TransportError;

/// Arguments a queue is declared with. Redeclaring with different
/// arguments fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub max_priority: Option<u8>,
    pub message_ttl: Option<Duration>,
    pub dead_letter_routing_key: Option<String>,
    /// Idle time after which the broker drops the queue (`x-expires`).
    pub expires: Option<Duration>,
}

impl QueueDeclaration {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_priority: None,
            message_ttl: None,
            dead_letter_routing_key: None,
            expires: None,
        }
    }

    pub fn with_max_priority(mut self, levels: u8) -> Self {
        self.max_priority = Some(levels);
        self
    }

    /// Hold messages for `ttl`, then move them to `routing_key`.
    pub fn with_dead_letter(mut self, ttl: Duration, routing_key: impl Into<String>) -> Self {
        self.message_ttl = Some(ttl);
        self.dead_letter_routing_key = Some(routing_key.into());
        self
    }

    pub fn with_expiry(mut self, idle: Duration) -> Self {
        self.expires = Some(idle);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub priority: u8,
    /// Delivery mode 2: written to disk by the broker.
    pub persistent: bool,
}

impl OutboundMessage {
    pub fn persistent(body: Vec<u8>, priority: u8) -> Self {
        Self {
            body,
            priority,
            persistent: true,
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. No-op when already open.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection. Safe to call repeatedly.
    async fn close(&self) -> Result<(), TransportError>;

    async fn is_open(&self) -> bool;

    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), TransportError>;

    /// Put the channel into transaction mode.
    async fn tx_select(&self) -> Result<(), TransportError>;

    async fn tx_commit(&self) -> Result<(), TransportError>;

    async fn tx_rollback(&self) -> Result<(), TransportError>;

    /// Publish through the default exchange: the routing key is the queue
    /// name.
    async fn publish(&self, routing_key: &str, message: OutboundMessage)
    -> Result<(), TransportError>;

    /// Start consuming with manual acknowledgement and at most `prefetch`
    /// unsettled deliveries.
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn Subscription>, TransportError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` once the connection is gone.
    async fn next(&mut self) -> Option<Box<dyn Delivery>>;
}

/// A delivered message. Must be settled with `ack` or `reject`.
#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    /// The broker delivered this message before without a settlement.
    fn redelivered(&self) -> bool;

    /// Remove the message permanently.
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;

    /// Give the message back (`requeue`) or drop it.
    async fn reject(self: Box<Self>, requeue: bool) -> Result<(), TransportError>;
}
