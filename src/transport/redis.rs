//! Redis list broker backend.
//!
//! One Redis list per agent (`concord:inbox:<agent>`): `send` RPUSHes the
//! serialized message, `subscribe` spawns a reader task that blocking-pops
//! the list and feeds the inbox channel. Per-destination FIFO falls out of
//! the list semantics.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bidding::BiddingMessageWire;
use crate::error::{ConcordError, ErrorCode, Result};
use crate::transport::{Inbox, Transport};

/// Blocking-pop timeout; bounds how long the reader task takes to notice a
/// dropped inbox.
const POP_TIMEOUT_SECS: u64 = 1;

mod keys {
    pub fn inbox(agent: &str) -> String {
        format!("concord:inbox:{agent}")
    }
}

/// Redis-backed transport.
pub struct RedisTransport {
    client: redis::Client,
}

impl RedisTransport {
    /// Create a transport against the given broker URL.
    pub fn connect(broker_url: &str) -> Result<Self> {
        let client = redis::Client::open(broker_url).map_err(|e| {
            ConcordError::with_internal(
                ErrorCode::TransportConnectionFailed,
                format!("Cannot open broker connection to {broker_url}"),
                e.to_string(),
            )
        })?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                ConcordError::with_internal(
                    ErrorCode::TransportConnectionFailed,
                    "Failed to get broker connection",
                    e.to_string(),
                )
            })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn send(&self, destination: &str, message: &BiddingMessageWire) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.connection().await?;
        redis::cmd("RPUSH")
            .arg(keys::inbox(destination))
            .arg(&payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| {
                ConcordError::with_internal(
                    ErrorCode::TransportSendFailed,
                    format!("Failed to enqueue message for {destination}"),
                    e.to_string(),
                )
            })?;
        debug!(destination, "message enqueued");
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Inbox> {
        let (tx, rx) = mpsc::unbounded_channel();
        let key = keys::inbox(queue);
        let mut conn = self.connection().await?;

        tokio::spawn(async move {
            loop {
                if tx.is_closed() {
                    break;
                }
                let popped: std::result::Result<Option<(String, String)>, redis::RedisError> =
                    redis::cmd("BLPOP")
                        .arg(&key)
                        .arg(POP_TIMEOUT_SECS)
                        .query_async(&mut conn)
                        .await;
                match popped {
                    Ok(Some((_key, payload))) => {
                        match serde_json::from_str::<BiddingMessageWire>(&payload) {
                            Ok(message) => {
                                if tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "ignoring malformed message");
                            }
                        }
                    }
                    Ok(None) => {
                        // pop timeout, re-check the inbox and poll again
                    }
                    Err(e) => {
                        warn!(error = %e, "broker receive failed, stopping reader");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}
