//! Property tests for quality scoring and severity bucketing.

use broker_vision::{severity_bucket, DataQualityAnalyzer, SegmentContext};
use chrono::Utc;
use proptest::prelude::*;
use std::collections::HashMap;
use uuid::Uuid;

fn arbitrary_segment() -> impl Strategy<Value = SegmentContext> {
    (
        0usize..4,                 // camera count
        prop::bool::ANY,           // depth present
        prop::bool::ANY,           // perf present
        0.1f64..600.0,             // duration
        prop::bool::ANY,           // scene type present
    )
        .prop_map(|(cameras, depth, perf, duration, scene_type)| {
            let mut media = HashMap::new();
            for i in 0..cameras {
                media.insert(format!("cam_{}", i), format!("s3://cap/{}.mp4", i));
            }
            let mut depth_uris = HashMap::new();
            if depth {
                depth_uris.insert("cam_0".to_string(), "s3://cap/depth.bin".to_string());
            }
            let mut performance = HashMap::new();
            if perf {
                performance.insert("avg_fps".to_string(), 48.0);
                performance.insert("min_fps".to_string(), 22.0);
                performance.insert("max_fps".to_string(), 60.0);
            }
            SegmentContext {
                segment_id: Uuid::nil(),
                build_id: "build".to_string(),
                scene_id: "scene".to_string(),
                level_name: "level".to_string(),
                scene_type: scene_type.then(|| "combat".to_string()),
                start_timestamp: Utc::now(),
                end_timestamp: Utc::now(),
                duration_seconds: duration,
                frame_count: 100,
                camera_configs: vec![],
                media_uris: media,
                depth_uris,
                gameplay_events: vec![],
                performance_metrics: performance,
                metadata: serde_json::json!({}),
            }
        })
}

proptest! {
    /// Factor scores, the overall score, and the confidence adjustment stay
    /// inside their documented ranges for any input shape.
    #[test]
    fn quality_scores_stay_in_range(segment in arbitrary_segment()) {
        let assessment = DataQualityAnalyzer::new().assess(&segment);
        for (factor, score) in &assessment.factors {
            prop_assert!((0.0..=1.0).contains(score), "factor {} out of range", factor);
        }
        prop_assert!((0.0..=1.0).contains(&assessment.overall_score));
        prop_assert!(assessment.confidence_adjustment >= 0.1);
        prop_assert!(assessment.confidence_adjustment <= 1.0);
    }

    /// Unusable never co-occurs with can_analyze.
    #[test]
    fn unusable_blocks_analysis(segment in arbitrary_segment()) {
        let assessment = DataQualityAnalyzer::new().assess(&segment);
        if !assessment.can_analyze {
            prop_assert!(assessment.overall_score < 0.4);
        }
    }

    /// Buckets partition [0, 1] with no gaps.
    #[test]
    fn severity_buckets_cover_unit_interval(severity in 0.0f64..=1.0) {
        let bucket = severity_bucket(severity);
        prop_assert!(["low", "medium", "high", "critical"].contains(&bucket));
        // Band edges are monotonic.
        let order = |b: &str| match b {
            "low" => 0,
            "medium" => 1,
            "high" => 2,
            _ => 3,
        };
        prop_assert!(order(severity_bucket(severity)) <= order(severity_bucket(1.0)));
    }
}
