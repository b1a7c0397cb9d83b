//! In-process bus with NATS-compatible semantics.
//!
//! Wildcard subscriptions, competing-consumer queue groups (round-robin
//! within a group), and inbox-based request/reply. Used by tests and by
//! single-node runs where an external broker is unavailable.

use crate::{Bus, BusMessage, Subscription};
use anyhow::{bail, Result};
use async_trait::async_trait;
use broker_core::subject_matches;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

struct SubEntry {
    id: u64,
    pattern: String,
    queue_group: Option<String>,
    tx: mpsc::Sender<BusMessage>,
}

#[derive(Default)]
struct Shared {
    subs: Mutex<Vec<SubEntry>>,
    /// Round-robin cursor per (pattern, group).
    group_cursors: Mutex<HashMap<(String, String), usize>>,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    shared: Arc<Shared>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn deliver(&self, msg: &BusMessage) {
        let mut subs = self.shared.subs.lock().unwrap();
        // Drop subscriptions whose receivers are gone.
        subs.retain(|s| !s.tx.is_closed());

        // Plain subscribers: every match receives the message.
        for entry in subs
            .iter()
            .filter(|s| s.queue_group.is_none() && subject_matches(&s.pattern, &msg.subject))
        {
            let _ = entry.tx.try_send(msg.clone());
        }

        // Queue groups: exactly one member per (pattern, group) receives it.
        let mut groups: HashMap<(String, String), Vec<&SubEntry>> = HashMap::new();
        for entry in subs.iter().filter(|s| s.queue_group.is_some()) {
            if subject_matches(&entry.pattern, &msg.subject) {
                let key = (
                    entry.pattern.clone(),
                    entry.queue_group.clone().unwrap_or_default(),
                );
                groups.entry(key).or_default().push(entry);
            }
        }
        let mut cursors = self.shared.group_cursors.lock().unwrap();
        for (key, members) in groups {
            let cursor = cursors.entry(key).or_insert(0);
            let chosen = &members[*cursor % members.len()];
            *cursor = cursor.wrapping_add(1);
            let _ = chosen.tx.try_send(msg.clone());
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<()> {
        self.deliver(&BusMessage {
            subject: subject.to_string(),
            payload,
            reply: None,
        });
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, queue_group: Option<&str>) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(256);
        let entry = SubEntry {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            pattern: pattern.to_string(),
            queue_group: queue_group.map(|g| g.to_string()),
            tx,
        };
        tracing::debug!("MemoryBus subscription {} on {}", entry.id, pattern);
        self.shared.subs.lock().unwrap().push(entry);
        Ok(Subscription::new(rx))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let inbox = format!("_INBOX.{}", uuid::Uuid::new_v4().simple());
        let mut reply_sub = self.subscribe(&inbox, None).await?;

        self.deliver(&BusMessage {
            subject: subject.to_string(),
            payload,
            reply: Some(inbox.clone()),
        });

        match tokio::time::timeout(timeout, reply_sub.next()).await {
            Ok(Some(msg)) => Ok(msg.payload),
            Ok(None) => bail!("Reply subscription closed for {}", subject),
            Err(_) => bail!("Request to {} timed out", subject),
        }
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_wildcard_subscriber() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("story.events.>", None).await.unwrap();

        bus.publish("story.events.arc.started", b"x".to_vec())
            .await
            .unwrap();

        let msg = sub.next().await.unwrap();
        assert_eq!(msg.subject, "story.events.arc.started");
        assert_eq!(msg.payload, b"x");
    }

    #[tokio::test]
    async fn queue_group_delivers_to_exactly_one_member() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("work.items", Some("workers")).await.unwrap();
        let mut b = bus.subscribe("work.items", Some("workers")).await.unwrap();

        for i in 0..4u8 {
            bus.publish("work.items", vec![i]).await.unwrap();
        }

        // Round-robin: each member sees exactly half.
        let mut got_a = Vec::new();
        let mut got_b = Vec::new();
        for _ in 0..2 {
            got_a.push(a.next().await.unwrap().payload[0]);
            got_b.push(b.next().await.unwrap().payload[0]);
        }
        let mut all: Vec<u8> = got_a.iter().chain(got_b.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = MemoryBus::new();
        let mut server = bus.subscribe("echo", None).await.unwrap();
        let bus_clone = bus.clone();
        tokio::spawn(async move {
            while let Some(msg) = server.next().await {
                if let Some(reply) = msg.reply {
                    bus_clone.publish(&reply, msg.payload).await.unwrap();
                }
            }
        });

        let reply = bus
            .request("echo", b"ping".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply, b"ping");
    }

    #[tokio::test]
    async fn request_times_out_without_responder() {
        let bus = MemoryBus::new();
        let err = bus
            .request("nobody.home", b"?".to_vec(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn dropped_subscription_stops_receiving() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("topic", None).await.unwrap();
        drop(sub);
        // Publishing after drop must not error or deliver anywhere.
        bus.publish("topic", b"x".to_vec()).await.unwrap();
        assert!(bus.shared.subs.lock().unwrap().is_empty());
    }
}
