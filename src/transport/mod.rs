//! The message transport seam.
//!
//! The protocol only needs per-destination FIFO queues named after agents;
//! the broker behind them is pluggable. `RedisTransport` is the production
//! backend, `InMemoryHub` serves tests and single-process simulations.

pub mod memory;
pub mod redis;

pub use memory::InMemoryHub;
pub use redis::RedisTransport;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::bidding::BiddingMessageWire;
use crate::error::Result;

/// Receiving side of an agent's queue.
pub type Inbox = mpsc::UnboundedReceiver<BiddingMessageWire>;

/// A per-destination FIFO message transport.
///
/// Delivery may be at-least-once; coalescing on the consumer side drops
/// stale messages but never reorders them.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append a message to the destination agent's queue.
    async fn send(&self, destination: &str, message: &BiddingMessageWire) -> Result<()>;

    /// Open the queue named after an agent; inbound messages flow into the
    /// returned inbox until the transport or the inbox is dropped.
    async fn subscribe(&self, queue: &str) -> Result<Inbox>;
}
