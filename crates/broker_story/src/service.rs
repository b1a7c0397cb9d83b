//! Story Memory service assembly and lifecycle.

use crate::api::StoryApi;
use crate::cache::SnapshotCache;
use crate::drift::{AlwaysOnTheme, DriftDetector};
use crate::ingest::EventIngestor;
use crate::kv::KvStore;
use crate::repo::StoryRepo;
use crate::state::StoryStateManager;
use anyhow::Result;
use async_trait::async_trait;
use broker_bus::Bus;
use broker_core::health::{HealthRecord, HealthStatus, WorkerHealth};
use broker_core::subjects;
use broker_core::BrokerConfig;
use broker_runtime::{drain_tasks, HealthPublisher, Service};
use prometheus::Registry;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct StoryService {
    bus: Arc<dyn Bus>,
    repo: Arc<dyn StoryRepo>,
    manager: Arc<StoryStateManager>,
    cache: Arc<SnapshotCache>,
    drift: Arc<DriftDetector>,
    ingestor: Arc<EventIngestor>,
    api: Arc<StoryApi>,
    grace_period: Duration,
    health_interval: Duration,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl StoryService {
    /// Wire the component graph from injected infrastructure.
    pub fn build(
        config: &BrokerConfig,
        bus: Arc<dyn Bus>,
        repo: Arc<dyn StoryRepo>,
        kv: Arc<dyn KvStore>,
        registry: &Registry,
    ) -> Result<Arc<Self>> {
        let manager = Arc::new(StoryStateManager::new(
            repo.clone(),
            bus.clone(),
            config.story.families.clone(),
        ));
        let cache = Arc::new(SnapshotCache::new(
            manager.clone(),
            kv,
            Duration::from_secs(config.cache.ttl_seconds),
            config.cache.l1_max,
            &config.cache.key_prefix,
            registry,
        )?);
        manager.set_invalidator(cache.clone());

        let drift = Arc::new(DriftDetector::new(
            repo.clone(),
            bus.clone(),
            config.drift.clone(),
            Arc::new(AlwaysOnTheme),
        ));
        let ingestor = Arc::new(EventIngestor::new(manager.clone(), bus.clone()));
        let api = Arc::new(StoryApi::new(manager.clone(), cache.clone(), drift.clone()));

        Ok(Arc::new(Self {
            bus,
            repo,
            manager,
            cache,
            drift,
            ingestor,
            api,
            grace_period: Duration::from_secs(config.service.grace_period_seconds),
            health_interval: Duration::from_secs(config.service.health_interval_seconds),
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    pub fn manager(&self) -> Arc<StoryStateManager> {
        self.manager.clone()
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        self.cache.clone()
    }

    pub fn drift(&self) -> Arc<DriftDetector> {
        self.drift.clone()
    }

    async fn spawn_api_loops(&self) -> Result<()> {
        for subject in StoryApi::subjects() {
            let mut sub = self.bus.subscribe(subject, None).await?;
            let api = self.api.clone();
            let bus = self.bus.clone();
            let cancel = self.cancel.child_token();

            let handle = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = sub.next() => {
                            let Some(msg) = msg else { break };
                            let reply_body = api.handle(&msg.subject, &msg.payload).await;
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
        }
        Ok(())
    }

    async fn collect_health(&self) -> HealthRecord {
        let db_healthy = self.repo.healthy().await;
        let bus_connected = self.bus.is_connected();

        let (active, total) = {
            let tasks = self.tasks.lock().unwrap();
            let active = tasks.iter().filter(|t| !t.is_finished()).count();
            (active, tasks.len())
        };

        let mut issues = Vec::new();
        if !db_healthy {
            issues.push("Database connection lost".to_string());
        }
        if !bus_connected {
            issues.push("Bus connection lost".to_string());
        }
        if active < total {
            issues.push(format!("Only {}/{} tasks active", active, total));
        }

        let status = if !db_healthy || !bus_connected {
            HealthStatus::Unhealthy
        } else if active < total {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let stats = self.cache.stats();
        HealthRecord::new("story_memory", status)
            .with_details(serde_json::json!({
                "database": if db_healthy { "connected" } else { "disconnected" },
                "bus": if bus_connected { "connected" } else { "disconnected" },
                "tasks": WorkerHealth { active, total },
                "cache": stats,
            }))
            .with_issues(issues)
    }
}

#[async_trait]
impl Service for StoryService {
    fn name(&self) -> &str {
        "story_memory"
    }

    async fn start(&self) -> Result<()> {
        tracing::info!("Starting Story Memory service");

        // Event ingestion.
        let events_sub = self
            .bus
            .subscribe(subjects::STORY_EVENTS_WILDCARD, None)
            .await?;
        let ingestor = self.ingestor.clone();
        let cancel = self.cancel.child_token();
        self.tasks.lock().unwrap().push(tokio::spawn(async move {
            ingestor.run(events_sub, cancel).await;
        }));

        // Request/reply API.
        self.spawn_api_loops().await?;

        // Periodic drift sweep.
        let drift = self.drift.clone();
        let cancel = self.cancel.child_token();
        self.tasks.lock().unwrap().push(tokio::spawn(async move {
            drift.run(cancel).await;
        }));

        tracing::info!("Story Memory service started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        drain_tasks(tasks, self.grace_period).await
    }
}

impl StoryService {
    /// Spawn the health publisher; separate from `start` so the runtime can
    /// decide where the loop lives.
    pub fn spawn_health_publisher(self: Arc<Self>) {
        let publisher = HealthPublisher::new(
            self.bus.clone(),
            subjects::STORY_HEALTH,
            subjects::SYS_HEALTH_STORY,
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
