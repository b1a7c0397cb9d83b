//! Message bus abstraction shared by every service.
//!
//! Two implementations:
//! - [`NatsBus`] — production adapter over a NATS connection.
//! - [`MemoryBus`] — in-process bus with the same semantics (wildcard
//!   subjects, queue groups, request/reply), used by tests and single-node
//!   runs.
//!
//! Subjects are dot-separated strings; subscription patterns may use `*`
//! (one token) and `>` (remainder). A `queue_group` subscription delivers
//! each message to exactly one member of the group.

pub mod memory;
pub mod nats;

pub use memory::MemoryBus;
pub use nats::NatsBus;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// A message delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    /// Reply subject for request/reply exchanges.
    pub reply: Option<String>,
}

/// Receiving half of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<BusMessage>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to a subject. Fire-and-forget.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to a subject pattern. With `queue_group`, each message is
    /// delivered to exactly one subscriber in the group.
    async fn subscribe(&self, pattern: &str, queue_group: Option<&str>) -> Result<Subscription>;

    /// Synchronous request/reply with a caller-supplied timeout.
    async fn request(&self, subject: &str, payload: Vec<u8>, timeout: Duration)
        -> Result<Vec<u8>>;

    /// Whether the underlying transport is currently usable.
    fn is_connected(&self) -> bool;
}
