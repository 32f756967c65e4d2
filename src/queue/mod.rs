//! Bounded priority job queues
//!
//! Queues carry opaque JSON bodies with a priority. Ready messages are handed
//! out highest priority first, oldest first among equals. A publish that
//! finds the queue at capacity is rejected, never blocked. Delivered messages
//! stay in flight until acked or requeued; in-flight messages whose consumer
//! died are returned to the ready set by [`JobQueue::recover`], which every
//! running consumer triggers periodically through a [`Reclaimer`].
//!
//! Producers publish through an [`Exchange`], which routes by key to one or
//! more bound queues. [`TypedQueue`] layers the message schema on top.

pub mod exchange;
pub mod memory;
pub mod reclaim;
pub mod redis;
pub mod typed;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::models::JobError;

pub use exchange::{topic_matches, Exchange, ExchangeKind};
pub use memory::MemoryQueue;
pub use reclaim::Reclaimer;
pub use self::redis::RedisQueue;
pub use typed::{TypedDelivery, TypedQueue};

/// Queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Broker unavailable or command failed
    #[error("Queue backend error: {0}")]
    Backend(String),

    /// Ack or requeue for a delivery that is not in flight
    #[error("Delivery {id} is not in flight on queue '{queue}'")]
    UnknownDelivery { queue: String, id: String },

    /// No queue bound for the routing key
    #[error("Exchange '{exchange}' has no binding for routing key '{routing_key}'")]
    Unroutable {
        exchange: String,
        routing_key: String,
    },

    /// Message could not be encoded for the wire
    #[error("Failed to encode message: {0}")]
    Encode(#[from] JobError),
}

impl QueueError {
    pub fn backend(msg: impl ToString) -> Self {
        Self::Backend(msg.to_string())
    }
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Result of a publish attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Message is queued
    Accepted,
    /// Queue was at capacity; the message was dropped
    Rejected,
}

impl PublishOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
        }
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id
    pub id: String,
    /// Raw message document
    pub body: String,
    /// Priority the message was published with
    pub priority: u8,
    /// Whether this message was delivered before
    pub redelivered: bool,
}

/// A bounded, priority-ordered, at-least-once queue
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Queue name, used in logs and routing
    fn name(&self) -> &str;

    /// Maximum number of ready messages
    fn capacity(&self) -> usize;

    /// Enqueue a message, rejecting it when the queue is full
    async fn publish(&self, body: String, priority: u8) -> QueueResult<PublishOutcome>;

    /// Wait for the next ready message and mark it in flight
    async fn consume(&self) -> QueueResult<Delivery>;

    /// Take the next ready message without waiting
    async fn try_consume(&self) -> QueueResult<Option<Delivery>>;

    /// Settle a delivery for good
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Return a delivery to the ready set at its original position
    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Drop every ready message; returns how many were dropped
    async fn purge(&self) -> QueueResult<usize>;

    /// Number of ready messages
    async fn len(&self) -> QueueResult<usize>;

    /// Return deliveries in flight for longer than `stale_after` to the ready set
    async fn recover(&self, stale_after: Duration) -> QueueResult<usize>;
}
