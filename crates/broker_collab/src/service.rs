//! Training orchestrator service: request/reply over the bus plus health.

use crate::clients::{LoreClient, RulesClient};
use crate::http::HttpClient;
use crate::llm::HttpLlmClient;
use crate::orchestrator::CollaborationOrchestrator;
use crate::planner::TeacherPlanner;
use crate::retriever::LoreRetriever;
use crate::verifier::Verifier;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_bus::Bus;
use broker_core::health::{HealthRecord, HealthStatus};
use broker_core::subjects;
use broker_core::BrokerConfig;
use broker_runtime::{drain_tasks, HealthPublisher, Service};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct CollabService {
    bus: Arc<dyn Bus>,
    orchestrator: Arc<CollaborationOrchestrator>,
    grace_period: Duration,
    health_interval: Duration,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl CollabService {
    /// Wire the three-model collaboration from configuration. Every
    /// outbound dependency gets its own breaker-guarded client.
    pub fn build(config: &BrokerConfig, bus: Arc<dyn Bus>) -> Result<Arc<Self>> {
        let collab = &config.collab;
        let control_timeout = Duration::from_secs(collab.control_timeout_secs);
        let llm_timeout = Duration::from_secs(collab.llm_timeout_secs);
        let breaker_timeout = Duration::from_secs(collab.breaker_timeout_secs);

        let rules_client = Arc::new(RulesClient::new(HttpClient::new(
            &collab.rules_url,
            control_timeout,
            collab.breaker_threshold,
            breaker_timeout,
        )?));
        let lore_client = Arc::new(LoreClient::new(HttpClient::new(
            &collab.lore_url,
            control_timeout,
            collab.breaker_threshold,
            breaker_timeout,
        )?));
        let llm = Arc::new(HttpLlmClient::new(
            HttpClient::new(
                &collab.llm_url,
                llm_timeout,
                collab.breaker_threshold,
                breaker_timeout,
            )?,
            &collab.llm_model,
        ));

        let retriever = LoreRetriever::new(rules_client.clone(), lore_client);
        let planner = TeacherPlanner::new(llm.clone());
        let verifier = Arc::new(Verifier::new(
            llm,
            Some(rules_client),
            collab.min_verification_score,
        ));
        let orchestrator = Arc::new(CollaborationOrchestrator::new(
            retriever,
            planner,
            verifier,
            collab.max_regeneration_attempts,
        ));

        Ok(Arc::new(Self {
            bus,
            orchestrator,
            grace_period: Duration::from_secs(config.service.grace_period_seconds),
            health_interval: Duration::from_secs(config.service.health_interval_seconds),
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    pub fn orchestrator(&self) -> Arc<CollaborationOrchestrator> {
        self.orchestrator.clone()
    }

    async fn handle_request(&self, payload: &[u8]) -> serde_json::Value {
        match self.generate(payload).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Error handling generate request: {:#}", e);
                serde_json::json!({"success": false, "error": e.to_string()})
            }
        }
    }

    async fn generate(&self, payload: &[u8]) -> Result<serde_json::Value> {
        let data: serde_json::Value = serde_json::from_slice(payload)?;
        let species = data
            .get("species")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing species"))?;
        let model_type = data
            .get("model_type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("Missing model_type"))?;
        let count = data.get("count").and_then(|v| v.as_u64()).unwrap_or(10) as usize;
        let rules = data.get("rules").cloned();

        let result = self
            .orchestrator
            .generate_training_examples(species, model_type, count, rules)
            .await;
        Ok(serde_json::json!({
            "success": true,
            "trajectories": result.trajectories,
            "validated_count": result.validated_count,
            "invalid_count": result.invalid_count,
            "metadata": result.metadata,
        }))
    }

    async fn collect_health(&self) -> HealthRecord {
        let bus_connected = self.bus.is_connected();
        let (active, total) = {
            let tasks = self.tasks.lock().unwrap();
            let active = tasks.iter().filter(|t| !t.is_finished()).count();
            (active, tasks.len())
        };

        let mut issues = Vec::new();
        if !bus_connected {
            issues.push("Bus connection lost".to_string());
        }
        if active < total {
            issues.push(format!("Only {}/{} tasks active", active, total));
        }

        let status = if !bus_connected {
            HealthStatus::Unhealthy
        } else if active < total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthRecord::new("srl_training", status)
            .with_details(serde_json::json!({
                "bus": if bus_connected { "connected" } else { "disconnected" },
                "tasks": {"active": active, "total": total},
            }))
            .with_issues(issues)
    }

    pub fn spawn_health_publisher(self: Arc<Self>) {
        let publisher = HealthPublisher::new(
            self.bus.clone(),
            subjects::TRAINING_HEALTH,
            subjects::SYS_HEALTH_TRAINING,
            self.health_interval,
        );
        let service = self.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            publisher
                .run(cancel, || {
                    let service = service.clone();
                    async move { service.collect_health().await }
                })
                .await;
        });
        self.tasks.lock().unwrap().push(handle);
    }
}

#[async_trait]
impl Service for Arc<CollabService> {
    fn name(&self) -> &str {
        "srl_training"
    }

    async fn start(&self) -> Result<()> {
        tracing::info!("Starting training orchestrator service");

        let mut sub = self.bus.subscribe(subjects::TRAINING_GENERATE, None).await?;
        let service = self.clone();
        let bus = self.bus.clone();
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        let reply_body = service.handle_request(&msg.payload).await;
                        if let Some(reply) = msg.reply {
                            match serde_json::to_vec(&reply_body) {
                                Ok(bytes) => {
                                    if let Err(e) = bus.publish(&reply, bytes).await {
                                        tracing::warn!("Failed to send reply: {}", e);
                                    }
                                }
                                Err(e) => tracing::error!("Failed to serialize reply: {}", e),
                            }
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);

        tracing::info!("Training orchestrator service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        drain_tasks(tasks, self.grace_period).await
    }
}
