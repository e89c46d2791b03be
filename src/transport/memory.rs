//! In-process transport hub for tests and single-process simulations.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::bidding::BiddingMessageWire;
use crate::error::Result;
use crate::transport::{Inbox, Transport};

enum Queue {
    /// Messages sent before the owner subscribed.
    Pending(Vec<BiddingMessageWire>),
    Live(mpsc::UnboundedSender<BiddingMessageWire>),
}

/// A shared hub of per-agent queues.
#[derive(Default)]
pub struct InMemoryHub {
    queues: Mutex<HashMap<String, Queue>>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for InMemoryHub {
    async fn send(&self, destination: &str, message: &BiddingMessageWire) -> Result<()> {
        let mut queues = self.queues.lock();
        match queues
            .entry(destination.to_string())
            .or_insert_with(|| Queue::Pending(Vec::new()))
        {
            Queue::Pending(pending) => pending.push(message.clone()),
            Queue::Live(tx) => {
                // a dropped inbox just discards further traffic
                let _ = tx.send(message.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut queues = self.queues.lock();
        if let Some(Queue::Pending(pending)) = queues.get_mut(queue) {
            for message in pending.drain(..) {
                let _ = tx.send(message);
            }
        }
        queues.insert(queue.to_string(), Queue::Live(tx));
        Ok(rx)
    }
}
