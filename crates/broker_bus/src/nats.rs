//! NATS-backed bus adapter.

use crate::{Bus, BusMessage, Subscription};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;

pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    /// Connect to a NATS server.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", url))?;
        tracing::info!("Connected to NATS at {}", url);
        Ok(Self { client })
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .with_context(|| format!("Failed to publish to {}", subject))?;
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, queue_group: Option<&str>) -> Result<Subscription> {
        let mut sub = match queue_group {
            Some(group) => self
                .client
                .queue_subscribe(pattern.to_string(), group.to_string())
                .await
                .with_context(|| format!("Failed to queue-subscribe to {}", pattern))?,
            None => self
                .client
                .subscribe(pattern.to_string())
                .await
                .with_context(|| format!("Failed to subscribe to {}", pattern))?,
        };

        // Forward into a channel so all Bus impls hand out the same
        // Subscription type. The forwarder exits when the receiver drops.
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let delivered = BusMessage {
                    subject: msg.subject.to_string(),
                    payload: msg.payload.to_vec(),
                    reply: msg.reply.map(|r| r.to_string()),
                };
                if tx.send(delivered).await.is_err() {
                    break;
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let response = tokio::time::timeout(
            timeout,
            self.client.request(subject.to_string(), payload.into()),
        )
        .await
        .with_context(|| format!("Request to {} timed out", subject))?
        .with_context(|| format!("Request to {} failed", subject))?;
        Ok(response.payload.to_vec())
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }
}
