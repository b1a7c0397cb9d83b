//! Periodic health publisher.
//!
//! Emits the service's health record to its own subject every interval, and
//! mirrors degraded/unhealthy records to a system-wide subject for the
//! coordinator.

use broker_bus::Bus;
use broker_core::health::HealthRecord;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct HealthPublisher {
    bus: Arc<dyn Bus>,
    subject: String,
    system_subject: String,
    interval: Duration,
}

impl HealthPublisher {
    pub fn new(
        bus: Arc<dyn Bus>,
        subject: impl Into<String>,
        system_subject: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            bus,
            subject: subject.into(),
            system_subject: system_subject.into(),
            interval,
        }
    }

    /// Publish until cancelled. `collect` assembles the current record on
    /// each tick; collection errors are logged and the loop keeps going.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, collect: F)
    where
        F: Fn() -> Fut,
        Fut: Future<Output = HealthRecord>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let record = collect().await;
                    self.publish(&record).await;
                }
            }
        }
        tracing::debug!("Health publisher for {} stopped", self.subject);
    }

    async fn publish(&self, record: &HealthRecord) {
        let bytes = match serde_json::to_vec(record) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Failed to serialize health record: {}", e);
                return;
            }
        };

        if let Err(e) = self.bus.publish(&self.subject, bytes.clone()).await {
            tracing::warn!("Failed to publish health to {}: {}", self.subject, e);
        }
        if record.needs_escalation() {
            if let Err(e) = self.bus.publish(&self.system_subject, bytes).await {
                tracing::warn!(
                    "Failed to escalate health to {}: {}",
                    self.system_subject,
                    e
                );
            }
        }
    }
}
