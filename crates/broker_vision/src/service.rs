//! Analyzer service: queue admission, the worker pool, and health.

use crate::detector::Detector;
use crate::metrics::AnalyzerMetrics;
use crate::quality::{handle_degraded_input, DataQualityAnalyzer};
use crate::repo::{QueueEntry, QueueStatus, SegmentStatus, VisionRepo};
use crate::segment::{Finding, SegmentContext};
use crate::summary::{summarize_segment, SceneSummary};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_bus::Bus;
use broker_core::health::{HealthRecord, HealthStatus, WorkerHealth};
use broker_core::subjects;
use broker_core::BrokerConfig;
use broker_runtime::{drain_tasks, HealthPublisher, Service};
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sleep between polls when the queue is empty.
const EMPTY_QUEUE_BACKOFF: Duration = Duration::from_secs(1);
/// Sleep after an unexpected worker error.
const WORKER_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How one segment's analysis ended when nothing went wrong internally.
enum AnalysisOutcome {
    Completed,
    /// Input quality was too poor to analyze; the segment is failed with a
    /// quality finding on record.
    Rejected,
}

pub struct AnalyzerService {
    bus: Arc<dyn Bus>,
    repo: Arc<dyn VisionRepo>,
    detectors: Vec<Arc<dyn Detector>>,
    quality: DataQualityAnalyzer,
    metrics: Arc<AnalyzerMetrics>,
    worker_count: usize,
    queue_high_watermark: i64,
    grace_period: Duration,
    health_interval: Duration,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl AnalyzerService {
    pub fn build(
        config: &BrokerConfig,
        bus: Arc<dyn Bus>,
        repo: Arc<dyn VisionRepo>,
        registry: &Registry,
    ) -> Result<Arc<Self>> {
        let detectors = crate::detectors::shipped_registry().build_all(&config.analyzer.detectors)?;
        let metrics = Arc::new(AnalyzerMetrics::new(registry)?);

        Ok(Arc::new(Self {
            bus,
            repo,
            detectors,
            quality: DataQualityAnalyzer::new(),
            metrics,
            worker_count: config.analyzer.worker_count,
            queue_high_watermark: config.analyzer.queue_high_watermark,
            grace_period: Duration::from_secs(config.service.grace_period_seconds),
            health_interval: Duration::from_secs(config.service.health_interval_seconds),
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            workers: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    // ========================================================================
    // Segment analysis
    // ========================================================================

    /// Analyze one leased queue entry end to end. Worker loops call this and
    /// never abandon an entry mid-flight.
    pub async fn process_entry(&self, entry: &QueueEntry) {
        match self.analyze_segment(entry.segment_id).await {
            Ok(AnalysisOutcome::Completed) => {
                if let Err(e) = self
                    .repo
                    .finish_queue_entry(entry.queue_id, QueueStatus::Completed)
                    .await
                {
                    tracing::error!("Failed to complete queue entry: {:#}", e);
                }
            }
            // Quality rejection: the segment is already marked failed with
            // its reason; the queue row fails too.
            Ok(AnalysisOutcome::Rejected) => {
                if let Err(e) = self
                    .repo
                    .finish_queue_entry(entry.queue_id, QueueStatus::Failed)
                    .await
                {
                    tracing::error!("Failed to fail queue entry: {:#}", e);
                }
            }
            Err(e) => {
                tracing::error!("Segment {} analysis failed: {:#}", entry.segment_id, e);
                let _ = self
                    .repo
                    .update_segment_status(entry.segment_id, SegmentStatus::Failed, Some(&e.to_string()))
                    .await;
                if let Err(e) = self
                    .repo
                    .finish_queue_entry(entry.queue_id, QueueStatus::Failed)
                    .await
                {
                    tracing::error!("Failed to fail queue entry: {:#}", e);
                }
            }
        }
    }

    async fn analyze_segment(&self, segment_id: Uuid) -> Result<AnalysisOutcome> {
        let segment = self
            .repo
            .load_segment(segment_id)
            .await?
            .ok_or_else(|| anyhow!("Segment {} not found", segment_id))?;

        self.repo
            .update_segment_status(segment_id, SegmentStatus::Analyzing, None)
            .await?;

        // Quality gate.
        let assessment = self.quality.assess(&segment);
        tracing::info!(
            "Segment {} data quality: {}",
            segment_id,
            assessment.overall_level.as_str()
        );
        if !assessment.can_analyze {
            tracing::warn!("Segment {} data quality too poor to analyze", segment_id);
            if let Some(finding) = self.quality.quality_finding(&segment, &assessment) {
                self.repo.insert_finding(segment_id, &finding).await?;
                self.publish_issue(&segment, &finding).await;
            }
            self.repo
                .update_segment_status(
                    segment_id,
                    SegmentStatus::Failed,
                    Some("Data quality too poor"),
                )
                .await?;
            self.metrics
                .segments_analyzed
                .with_label_values(&["rejected"])
                .inc();
            return Ok(AnalysisOutcome::Rejected);
        }

        // Detector fan-out, serial so publish order is well defined. One
        // detector blowing up must not stop the others.
        let mut all_findings: Vec<Finding> = Vec::new();
        let mut detector_results: HashMap<String, String> = HashMap::new();

        for detector in &self.detectors {
            let name = detector.detector_type().to_string();
            let timer = self
                .metrics
                .analysis_duration
                .with_label_values(&[&name])
                .start_timer();

            match detector.analyze(&segment).await {
                Ok(findings) => {
                    let adjusted = handle_degraded_input(findings, &assessment);
                    self.metrics.record_findings(&name, &adjusted);
                    for finding in &adjusted {
                        self.repo.insert_finding(segment_id, finding).await?;
                        self.publish_issue(&segment, finding).await;
                    }
                    detector_results.insert(name, adjusted.len().to_string());
                    all_findings.extend(adjusted);
                }
                Err(e) => {
                    tracing::error!("Error in {} detector: {:#}", name, e);
                    self.metrics
                        .analysis_errors
                        .with_label_values(&[&name])
                        .inc();
                    detector_results.insert(name, "error".to_string());
                }
            }
            timer.observe_duration();
        }

        // Quality finding rides along on every non-good segment.
        if let Some(finding) = self.quality.quality_finding(&segment, &assessment) {
            self.repo.insert_finding(segment_id, &finding).await?;
            self.publish_issue(&segment, &finding).await;
            all_findings.push(finding);
        }

        let summary = summarize_segment(&segment, &all_findings);
        self.repo.upsert_scene_summary(&summary).await?;
        self.publish_summary(&summary).await;

        self.repo
            .update_segment_status(segment_id, SegmentStatus::Completed, None)
            .await?;
        self.metrics
            .segments_analyzed
            .with_label_values(&["success"])
            .inc();

        tracing::info!(
            "Analyzed segment {}: {} findings across {} detectors",
            segment_id,
            all_findings.len(),
            detector_results.len()
        );
        Ok(AnalysisOutcome::Completed)
    }

    async fn worker_loop(self: Arc<Self>, worker_id: usize, cancel: CancellationToken) {
        tracing::info!("Analyzer worker {} started", worker_id);
        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.repo.lease_next().await {
                Ok(Some(entry)) => {
                    tracing::debug!(
                        "Worker {} processing segment {} (attempt {})",
                        worker_id,
                        entry.segment_id,
                        entry.attempts
                    );
                    self.process_entry(&entry).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(EMPTY_QUEUE_BACKOFF) => {}
                    }
                }
                Err(e) => {
                    tracing::error!("Worker {} lease error: {:#}", worker_id, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(WORKER_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        tracing::info!("Analyzer worker {} stopped", worker_id);
    }

    // ========================================================================
    // Bus I/O
    // ========================================================================

    /// Admission: translate analyze requests into queue rows. Workers only
    /// ever consume the queue, never this subject.
    async fn admission_loop(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut sub = self
            .bus
            .subscribe(
                subjects::VISION_ANALYZE_REQUEST,
                Some(subjects::VISION_WORKER_GROUP),
            )
            .await?;

        let service = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = sub.next() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = service.admit(&msg.payload).await {
                            tracing::error!("Error handling analysis request: {:#}", e);
                        }
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    async fn admit(&self, payload: &[u8]) -> Result<()> {
        let data: serde_json::Value = serde_json::from_slice(payload)?;
        let segment_id = data
            .get("segment_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| anyhow!("Analysis request missing segment_id"))?;
        let priority = data.get("priority").and_then(|v| v.as_i64()).unwrap_or(5);
        self.repo.enqueue(segment_id, priority).await
    }

    async fn publish_issue(&self, segment: &SegmentContext, finding: &Finding) {
        let trace_id = segment
            .metadata_str("trace_id")
            .map(String::from)
            .unwrap_or_else(|| segment.segment_id.to_string());
        let event = serde_json::json!({
            "envelope": {
                "trace_id": trace_id,
                "session_id": segment.metadata_str("session_id"),
                "player_id": segment.metadata_str("player_id"),
                "build_id": segment.build_id,
                "start_timestamp": segment.start_timestamp.to_rfc3339(),
                "end_timestamp": segment.end_timestamp.to_rfc3339(),
                "domain": "4D",
                "goal_tags": finding.affected_goals,
            },
            "segment_id": segment.segment_id.to_string(),
            "finding": finding,
            "affected_goals": finding.affected_goals,
            "player_impact": finding.player_impact,
        });
        match serde_json::to_vec(&event) {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(subjects::VISION_ISSUE, bytes).await {
                    tracing::warn!("Failed to publish vision issue: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize vision issue: {}", e),
        }
    }

    async fn publish_summary(&self, summary: &SceneSummary) {
        match serde_json::to_vec(summary) {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(subjects::VISION_SCENE_SUMMARY, bytes).await {
                    tracing::warn!("Failed to publish scene summary: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize scene summary: {}", e),
        }
    }

    // ========================================================================
    // Health
    // ========================================================================

    async fn collect_health(&self) -> HealthRecord {
        let db_healthy = self.repo.healthy().await;
        let bus_connected = self.bus.is_connected();
        let queue_depth = self.repo.pending_queue_depth().await.unwrap_or(-1);

        let (active, total) = {
            let workers = self.workers.lock().unwrap();
            let active = workers.iter().filter(|w| !w.is_finished()).count();
            (active, workers.len())
        };

        // A detector that cannot even describe itself is out of rotation.
        let detector_status: HashMap<&str, &str> = self
            .detectors
            .iter()
            .map(|d| {
                let caps = d.capabilities();
                let status = if caps.supported_issue_types.is_empty() {
                    "failed"
                } else {
                    "operational"
                };
                (d.detector_type(), status)
            })
            .collect();
        let failed_detectors: Vec<&str> = detector_status
            .iter()
            .filter(|(_, status)| **status == "failed")
            .map(|(name, _)| *name)
            .collect();

        let mut issues = Vec::new();
        if !db_healthy {
            issues.push("Database connection lost".to_string());
        }
        if !bus_connected {
            issues.push("Bus connection lost".to_string());
        }
        if active < total {
            issues.push(format!("Only {}/{} workers active", active, total));
        }
        if queue_depth > self.queue_high_watermark {
            issues.push(format!("High queue backlog: {}", queue_depth));
        }
        if !failed_detectors.is_empty() {
            issues.push(format!("Failed detectors: {}", failed_detectors.join(", ")));
        }

        // Dead workers degrade the service only once half the pool is gone.
        let status = if !db_healthy || !bus_connected {
            HealthStatus::Unhealthy
        } else if !failed_detectors.is_empty()
            || queue_depth > self.queue_high_watermark
            || active * 2 < total
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthRecord::new("vision_analyzer", status)
            .with_details(serde_json::json!({
                "database": if db_healthy { "connected" } else { "disconnected" },
                "bus": if bus_connected { "connected" } else { "disconnected" },
                "workers": WorkerHealth { active, total },
                "queue_depth": queue_depth,
                "detectors": detector_status,
            }))
            .with_issues(issues)
    }

    pub fn spawn_health_publisher(self: Arc<Self>) {
        let publisher = HealthPublisher::new(
            self.bus.clone(),
            subjects::VISION_HEALTH,
            subjects::SYS_HEALTH_4D_VISION,
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
impl Service for Arc<AnalyzerService> {
    fn name(&self) -> &str {
        "vision_analyzer"
    }

    async fn start(&self) -> Result<()> {
        tracing::info!("Starting 4D Vision Analyzer service");

        self.clone().admission_loop(self.cancel.child_token()).await?;

        for worker_id in 0..self.worker_count {
            let service = self.clone();
            let cancel = self.cancel.child_token();
            let handle = tokio::spawn(service.worker_loop(worker_id, cancel));
            self.workers.lock().unwrap().push(handle);
        }

        tracing::info!("Started with {} workers", self.worker_count);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.cancel.cancel();
        let mut tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().unwrap());
        tasks.extend(std::mem::take(&mut *self.workers.lock().unwrap()));
        drain_tasks(tasks, self.grace_period).await
    }
}
