//! End-to-end analyzer scenarios against the SQLite repository and the
//! in-process bus.

use broker_bus::{Bus, MemoryBus};
use broker_core::{subjects, BrokerConfig};
use broker_vision::{
    AnalyzerService, QueueStatus, SegmentContext, SegmentStatus, SqliteVisionRepo, VisionRepo,
};
use chrono::Utc;
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

async fn repo() -> Arc<SqliteVisionRepo> {
    Arc::new(
        SqliteVisionRepo::connect("sqlite::memory:")
            .await
            .expect("Failed to open in-memory repo"),
    )
}

fn service(
    repo: Arc<SqliteVisionRepo>,
    bus: Arc<MemoryBus>,
) -> Arc<AnalyzerService> {
    AnalyzerService::build(&BrokerConfig::default(), bus, repo, &Registry::new())
        .expect("Failed to build analyzer service")
}

fn healthy_segment() -> SegmentContext {
    let mut media = HashMap::new();
    media.insert("cam_front".to_string(), "s3://cap/front.mp4".to_string());
    media.insert("cam_rear".to_string(), "s3://cap/rear.mp4".to_string());
    let mut depth = HashMap::new();
    depth.insert("cam_front".to_string(), "s3://cap/front_depth.bin".to_string());
    let mut perf = HashMap::new();
    perf.insert("avg_fps".to_string(), 55.0);
    perf.insert("min_fps".to_string(), 12.0);
    perf.insert("max_fps".to_string(), 60.0);

    SegmentContext {
        segment_id: Uuid::new_v4(),
        build_id: "build-2077".to_string(),
        scene_id: "flesh_market".to_string(),
        level_name: "market_district".to_string(),
        scene_type: Some("traversal".to_string()),
        start_timestamp: Utc::now(),
        end_timestamp: Utc::now(),
        duration_seconds: 60.0,
        frame_count: 3600,
        camera_configs: vec![],
        media_uris: media,
        depth_uris: depth,
        gameplay_events: vec![serde_json::json!({
            "type": "physics_warning",
            "issue": "clipping",
            "severity": 0.75,
            "confidence": 0.9,
        })],
        performance_metrics: perf,
        metadata: serde_json::json!({
            "player_id": "p1", "session_id": "s1", "test_scenario": "nightly",
            "depth_sensor_type": "lidar",
        }),
    }
}

fn unusable_segment() -> SegmentContext {
    SegmentContext {
        segment_id: Uuid::new_v4(),
        build_id: "build-2077".to_string(),
        scene_id: "void".to_string(),
        level_name: "void".to_string(),
        scene_type: None,
        start_timestamp: Utc::now(),
        end_timestamp: Utc::now(),
        duration_seconds: 0.5,
        frame_count: 0,
        camera_configs: vec![],
        media_uris: HashMap::new(),
        depth_uris: HashMap::new(),
        gameplay_events: vec![],
        performance_metrics: HashMap::new(),
        metadata: serde_json::json!({}),
    }
}

#[tokio::test]
async fn quality_gate_fails_unusable_segment_with_single_quality_finding() {
    let repo = repo().await;
    let bus = Arc::new(MemoryBus::new());
    let service = service(repo.clone(), bus);

    let segment = unusable_segment();
    let segment_id = segment.segment_id;
    repo.insert_segment(&segment).await.unwrap();
    repo.enqueue(segment_id, 5).await.unwrap();

    let entry = repo.lease_next().await.unwrap().expect("entry leased");
    service.process_entry(&entry).await;

    assert_eq!(
        repo.segment_status(segment_id).await.unwrap(),
        Some(SegmentStatus::Failed)
    );
    // The queue row fails alongside the segment.
    assert_eq!(
        repo.queue_status(entry.queue_id).await.unwrap(),
        Some(QueueStatus::Failed)
    );

    let findings = repo.fetch_findings(segment_id).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].detector_type, "data_quality");
    assert!(findings[0].severity >= 0.9);
}

#[tokio::test]
async fn clean_segment_completes_with_detector_findings_and_summary() {
    let repo = repo().await;
    let bus = Arc::new(MemoryBus::new());
    let mut issues = bus.subscribe(subjects::VISION_ISSUE, None).await.unwrap();
    let mut summaries = bus
        .subscribe(subjects::VISION_SCENE_SUMMARY, None)
        .await
        .unwrap();
    let service = service(repo.clone(), bus);

    let segment = healthy_segment();
    let segment_id = segment.segment_id;
    repo.insert_segment(&segment).await.unwrap();
    repo.enqueue(segment_id, 5).await.unwrap();

    let entry = repo.lease_next().await.unwrap().unwrap();
    service.process_entry(&entry).await;

    assert_eq!(
        repo.segment_status(segment_id).await.unwrap(),
        Some(SegmentStatus::Completed)
    );
    assert_eq!(
        repo.queue_status(entry.queue_id).await.unwrap(),
        Some(QueueStatus::Completed)
    );

    // Physics marker plus low-fps rollup survive their thresholds.
    let findings = repo.fetch_findings(segment_id).await.unwrap();
    let detectors: Vec<&str> = findings.iter().map(|f| f.detector_type.as_str()).collect();
    assert!(detectors.contains(&"physics"));
    assert!(detectors.contains(&"performance"));

    // Each persisted finding was also published.
    let issue = issues.next().await.unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&issue.payload).unwrap();
    assert_eq!(payload["envelope"]["domain"], "4D");
    assert_eq!(payload["segment_id"], segment_id.to_string());

    // Scene summary was stored and published.
    let summary = repo
        .fetch_scene_summary("build-2077", "flesh_market")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.total_segments, 1);
    assert!(summary.issue_counts.contains_key("physics"));
    let published = summaries.next().await.unwrap();
    assert!(!published.payload.is_empty());
}

#[tokio::test]
async fn persisted_findings_respect_thresholds() {
    let repo = repo().await;
    let bus = Arc::new(MemoryBus::new());
    let service = service(repo.clone(), bus);

    let mut segment = healthy_segment();
    // One marker below the confidence threshold, one above.
    segment.gameplay_events = vec![
        serde_json::json!({
            "type": "rendering_warning", "issue": "z_fighting",
            "severity": 0.5, "confidence": 0.4,
        }),
        serde_json::json!({
            "type": "rendering_warning", "issue": "texture_missing",
            "severity": 0.5, "confidence": 0.95,
        }),
    ];
    segment.performance_metrics.insert("min_fps".to_string(), 60.0);
    let segment_id = segment.segment_id;
    repo.insert_segment(&segment).await.unwrap();
    repo.enqueue(segment_id, 5).await.unwrap();

    let entry = repo.lease_next().await.unwrap().unwrap();
    service.process_entry(&entry).await;

    let findings = repo.fetch_findings(segment_id).await.unwrap();
    for finding in &findings {
        assert!(finding.confidence >= 0.7, "below-threshold finding persisted");
        assert!(finding.severity >= 0.3);
    }
    assert!(findings.iter().any(|f| f.issue_type == "texture_missing"));
    assert!(!findings.iter().any(|f| f.issue_type == "z_fighting"));
}

#[tokio::test]
async fn scene_summary_upsert_increments_totals() {
    let repo = repo().await;
    let bus = Arc::new(MemoryBus::new());
    let service = service(repo.clone(), bus);

    for _ in 0..2 {
        let segment = healthy_segment();
        repo.insert_segment(&segment).await.unwrap();
        repo.enqueue(segment.segment_id, 5).await.unwrap();
        let entry = repo.lease_next().await.unwrap().unwrap();
        service.process_entry(&entry).await;
    }

    let summary = repo
        .fetch_scene_summary("build-2077", "flesh_market")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(summary.total_segments, 2);
    assert_eq!(summary.analyzed_segments, 2);
}

#[tokio::test]
async fn missing_segment_fails_queue_entry() {
    let repo = repo().await;
    let bus = Arc::new(MemoryBus::new());
    let service = service(repo.clone(), bus);

    let phantom = Uuid::new_v4();
    repo.enqueue(phantom, 5).await.unwrap();
    let entry = repo.lease_next().await.unwrap().unwrap();
    service.process_entry(&entry).await;

    assert_eq!(
        repo.queue_status(entry.queue_id).await.unwrap(),
        Some(QueueStatus::Failed)
    );
    assert!(repo.lease_next().await.unwrap().is_none());
}

#[tokio::test]
async fn lease_is_exclusive_under_concurrent_workers() {
    let repo = repo().await;

    for _ in 0..3 {
        let segment = healthy_segment();
        repo.insert_segment(&segment).await.unwrap();
        repo.enqueue(segment.segment_id, 5).await.unwrap();
    }

    // Five workers race for three entries; exactly three leases succeed.
    let mut handles = Vec::new();
    for _ in 0..5 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            repo.lease_next().await.unwrap()
        }));
    }
    let mut leased = Vec::new();
    for handle in handles {
        if let Some(entry) = handle.await.unwrap() {
            leased.push(entry);
        }
    }

    assert_eq!(leased.len(), 3);
    let mut segment_ids: Vec<Uuid> = leased.iter().map(|e| e.segment_id).collect();
    segment_ids.sort();
    segment_ids.dedup();
    assert_eq!(segment_ids.len(), 3, "a segment was leased twice");
    for entry in &leased {
        assert_eq!(entry.attempts, 1);
    }
}

#[tokio::test]
async fn lease_order_is_priority_then_fifo() {
    let repo = repo().await;

    let low = healthy_segment();
    let high = healthy_segment();
    let mid = healthy_segment();
    repo.insert_segment(&low).await.unwrap();
    repo.insert_segment(&high).await.unwrap();
    repo.insert_segment(&mid).await.unwrap();

    repo.enqueue(low.segment_id, 1).await.unwrap();
    repo.enqueue(high.segment_id, 9).await.unwrap();
    repo.enqueue(mid.segment_id, 5).await.unwrap();

    let order: Vec<Uuid> = [
        repo.lease_next().await.unwrap().unwrap().segment_id,
        repo.lease_next().await.unwrap().unwrap().segment_id,
        repo.lease_next().await.unwrap().unwrap().segment_id,
    ]
    .to_vec();
    assert_eq!(order, vec![high.segment_id, mid.segment_id, low.segment_id]);
}

#[tokio::test]
async fn duplicate_admission_bumps_priority_on_pending_row() {
    let repo = repo().await;
    let segment = healthy_segment();
    repo.insert_segment(&segment).await.unwrap();

    repo.enqueue(segment.segment_id, 3).await.unwrap();
    repo.enqueue(segment.segment_id, 7).await.unwrap();
    // Lower re-admission never demotes.
    repo.enqueue(segment.segment_id, 2).await.unwrap();

    let entry = repo.lease_next().await.unwrap().unwrap();
    assert_eq!(entry.priority, 7);
    assert!(repo.lease_next().await.unwrap().is_none());

    repo.finish_queue_entry(entry.queue_id, QueueStatus::Completed)
        .await
        .unwrap();
    assert_eq!(repo.pending_queue_depth().await.unwrap(), 0);
}
