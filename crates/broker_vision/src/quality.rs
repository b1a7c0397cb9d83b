//! Data quality assessment and degraded-input handling.
//!
//! Five factor scores in [0, 1] are averaged into an overall level. Segments
//! rated unusable never reach the detectors; everything below `good` reduces
//! downstream finding confidence.

use crate::segment::{Finding, SegmentContext};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const REQUIRED_PERF_METRICS: [&str; 3] = ["avg_fps", "min_fps", "max_fps"];
const OPTIONAL_METADATA_FIELDS: [&str; 3] = ["player_id", "session_id", "test_scenario"];
/// Event gaps longer than this reduce temporal consistency.
const EVENT_GAP_SECONDS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Good,
    Degraded,
    Poor,
    Unusable,
}

impl QualityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Degraded => "degraded",
            Self::Poor => "poor",
            Self::Unusable => "unusable",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QualityAssessment {
    pub overall_level: QualityLevel,
    pub overall_score: f64,
    pub factors: HashMap<String, f64>,
    pub missing_data: Vec<String>,
    pub degraded_data: Vec<String>,
    pub recommendations: Vec<String>,
    pub can_analyze: bool,
    /// Multiplier applied to detector confidence, floored at 0.1.
    pub confidence_adjustment: f64,
}

#[derive(Debug, Default)]
pub struct DataQualityAnalyzer;

impl DataQualityAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn assess(&self, segment: &SegmentContext) -> QualityAssessment {
        let mut factors = HashMap::new();
        let mut missing = Vec::new();
        let mut degraded = Vec::new();

        let media = self.media_availability(segment, &mut missing);
        factors.insert("media_availability".to_string(), media);

        let depth = self.depth_quality(segment, &mut missing, &mut degraded);
        factors.insert("depth_quality".to_string(), depth);

        let perf = self.performance_data(segment, &mut degraded);
        factors.insert("performance_data".to_string(), perf);

        let temporal = self.temporal_consistency(segment, &mut degraded);
        factors.insert("temporal_consistency".to_string(), temporal);

        let metadata = self.metadata_completeness(segment, &mut missing);
        factors.insert("metadata_completeness".to_string(), metadata);

        let overall_score = factors.values().sum::<f64>() / factors.len() as f64;
        let overall_level = level_for(overall_score);
        let can_analyze = overall_level != QualityLevel::Unusable;

        let mut adjustment = overall_score;
        if media < 0.5 {
            adjustment *= 0.7;
        }
        if temporal < 0.5 {
            adjustment *= 0.8;
        }
        adjustment = adjustment.max(0.1);

        let recommendations = self.recommendations(&factors);

        QualityAssessment {
            overall_level,
            overall_score,
            factors,
            missing_data: missing,
            degraded_data: degraded,
            recommendations,
            can_analyze,
            confidence_adjustment: adjustment,
        }
    }

    /// Fraction of camera views whose URI is non-empty.
    fn media_availability(&self, segment: &SegmentContext, missing: &mut Vec<String>) -> f64 {
        if segment.media_uris.is_empty() {
            missing.push("No media URIs provided".to_string());
            return 0.0;
        }
        let total = segment.media_uris.len();
        let available = segment
            .media_uris
            .iter()
            .filter(|(camera_id, uri)| {
                if uri.is_empty() {
                    missing.push(format!("Media URI missing for {}", camera_id));
                    false
                } else {
                    true
                }
            })
            .count();
        available as f64 / total as f64
    }

    fn depth_quality(
        &self,
        segment: &SegmentContext,
        missing: &mut Vec<String>,
        degraded: &mut Vec<String>,
    ) -> f64 {
        if segment.depth_uris.is_empty() {
            missing.push("Depth data not available".to_string());
            return 0.0;
        }
        match segment.metadata_str("depth_sensor_type") {
            Some("estimated") => {
                degraded.push("Depth data is estimated, not measured".to_string());
                0.6
            }
            Some("lidar") => 1.0,
            _ => 0.8,
        }
    }

    fn performance_data(&self, segment: &SegmentContext, degraded: &mut Vec<String>) -> f64 {
        let perf = &segment.performance_metrics;
        if perf.is_empty() {
            // Analysis can continue, just with reduced confidence.
            return 0.5;
        }

        let mut score: f64 = 1.0;
        for metric in REQUIRED_PERF_METRICS {
            if !perf.contains_key(metric) {
                score -= 0.2;
            }
        }
        if perf.get("min_fps").copied().unwrap_or(30.0) < 10.0 {
            degraded.push("Extremely low FPS may affect analysis accuracy".to_string());
            score -= 0.3;
        }
        score.max(0.0)
    }

    fn temporal_consistency(&self, segment: &SegmentContext, degraded: &mut Vec<String>) -> f64 {
        let mut score: f64 = 1.0;

        if segment.duration_seconds < 1.0 {
            degraded.push("Segment too short for reliable analysis".to_string());
            score -= 0.5;
        } else if segment.duration_seconds > 300.0 {
            degraded.push("Segment very long, may have varying conditions".to_string());
            score -= 0.2;
        }

        let timestamps = segment.event_timestamps();
        for pair in timestamps.windows(2) {
            let gap = (pair[1] - pair[0]).num_seconds();
            if gap > EVENT_GAP_SECONDS {
                degraded.push(format!("Large gap ({}s) in gameplay events", gap));
                score -= 0.1;
            }
        }
        score.max(0.0)
    }

    fn metadata_completeness(&self, segment: &SegmentContext, missing: &mut Vec<String>) -> f64 {
        let mut score: f64 = 1.0;

        let required = [
            ("build_id", !segment.build_id.is_empty()),
            ("level_name", !segment.level_name.is_empty()),
            ("scene_type", segment.scene_type.is_some()),
        ];
        for (field, present) in required {
            if !present {
                missing.push(format!("Required field '{}' is missing", field));
                score -= 0.3;
            }
        }
        for field in OPTIONAL_METADATA_FIELDS {
            if segment.metadata_str(field).is_none() {
                score -= 0.1;
            }
        }
        score.max(0.0)
    }

    fn recommendations(&self, factors: &HashMap<String, f64>) -> Vec<String> {
        let factor = |name: &str| factors.get(name).copied().unwrap_or(1.0);
        let mut out = Vec::new();
        if factor("media_availability") < 0.8 {
            out.push("Ensure all camera views are properly captured and uploaded".to_string());
        }
        if factor("depth_quality") < 0.7 {
            out.push("Consider using hardware depth sensors for better accuracy".to_string());
        }
        if factor("performance_data") < 0.7 {
            out.push("Enable comprehensive performance metrics collection".to_string());
        }
        if factor("temporal_consistency") < 0.8 {
            out.push("Use consistent segment durations (30-120 seconds recommended)".to_string());
        }
        out
    }

    /// Quality finding emitted for every non-good segment.
    pub fn quality_finding(
        &self,
        segment: &SegmentContext,
        assessment: &QualityAssessment,
    ) -> Option<Finding> {
        let severity = match assessment.overall_level {
            QualityLevel::Good => return None,
            QualityLevel::Degraded => 0.3,
            QualityLevel::Poor => 0.6,
            QualityLevel::Unusable => 0.9,
        };

        let mut finding = Finding::new(
            "data_quality",
            format!("quality_{}", segment.segment_id),
            "data_quality",
            severity,
            0.95,
            segment.start_timestamp,
        )
        .with_description(format!(
            "Input data quality is {}",
            assessment.overall_level.as_str()
        ))
        .with_metric("overall_quality_score", assessment.overall_score);

        for (factor, score) in &assessment.factors {
            finding.metrics.insert(factor.clone(), *score);
        }
        finding.affected_goals = vec!["G-RELIABILITY".to_string()];
        finding.player_impact = 0.0;
        Some(finding)
    }
}

fn level_for(score: f64) -> QualityLevel {
    if score >= 0.9 {
        QualityLevel::Good
    } else if score >= 0.7 {
        QualityLevel::Degraded
    } else if score >= 0.4 {
        QualityLevel::Poor
    } else {
        QualityLevel::Unusable
    }
}

/// Adjust detector findings for degraded input: drop unreliable findings on
/// poor data, scale confidence by the adjustment, and note the quality level
/// in descriptions.
pub fn handle_degraded_input(
    findings: Vec<Finding>,
    assessment: &QualityAssessment,
) -> Vec<Finding> {
    if assessment.overall_level == QualityLevel::Good {
        return findings;
    }

    findings
        .into_iter()
        .filter(|finding| {
            let unreliable =
                assessment.overall_level == QualityLevel::Poor && finding.confidence < 0.7;
            if unreliable {
                tracing::debug!(
                    "Filtering low-confidence finding {} due to poor data quality",
                    finding.issue_id
                );
            }
            !unreliable
        })
        .map(|mut finding| {
            finding.confidence =
                (finding.confidence * assessment.confidence_adjustment).clamp(0.0, 1.0);
            finding.description = format!(
                "{} (Note: {} data quality)",
                finding.description,
                assessment.overall_level.as_str()
            );
            finding
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn segment() -> SegmentContext {
        let mut media = HashMap::new();
        media.insert("cam_front".to_string(), "s3://bucket/front.mp4".to_string());
        media.insert("cam_rear".to_string(), "s3://bucket/rear.mp4".to_string());
        let mut depth = HashMap::new();
        depth.insert("cam_front".to_string(), "s3://bucket/front_depth.bin".to_string());
        let mut perf = HashMap::new();
        perf.insert("avg_fps".to_string(), 58.0);
        perf.insert("min_fps".to_string(), 41.0);
        perf.insert("max_fps".to_string(), 60.0);

        SegmentContext {
            segment_id: Uuid::new_v4(),
            build_id: "build-1042".to_string(),
            scene_id: "scene_market".to_string(),
            level_name: "flesh_market".to_string(),
            scene_type: Some("combat".to_string()),
            start_timestamp: Utc::now(),
            end_timestamp: Utc::now(),
            duration_seconds: 45.0,
            frame_count: 2700,
            camera_configs: vec![],
            media_uris: media,
            depth_uris: depth,
            gameplay_events: vec![],
            performance_metrics: perf,
            metadata: serde_json::json!({
                "player_id": "p1", "session_id": "s1", "test_scenario": "t1",
                "depth_sensor_type": "lidar",
            }),
        }
    }

    #[test]
    fn clean_segment_is_good() {
        let assessment = DataQualityAnalyzer::new().assess(&segment());
        assert_eq!(assessment.overall_level, QualityLevel::Good);
        assert!(assessment.can_analyze);
        assert!(assessment.missing_data.is_empty());
        assert!((assessment.overall_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn empty_media_is_unusable() {
        let mut seg = segment();
        seg.media_uris.clear();
        seg.depth_uris.clear();
        seg.performance_metrics.clear();
        seg.metadata = serde_json::json!({});
        seg.duration_seconds = 0.5;
        seg.scene_type = None;

        let assessment = DataQualityAnalyzer::new().assess(&seg);
        assert_eq!(assessment.overall_level, QualityLevel::Unusable);
        assert!(!assessment.can_analyze);
    }

    #[test]
    fn estimated_depth_scores_lower_than_lidar() {
        let analyzer = DataQualityAnalyzer::new();
        let lidar = analyzer.assess(&segment());

        let mut seg = segment();
        seg.metadata["depth_sensor_type"] = serde_json::json!("estimated");
        let estimated = analyzer.assess(&seg);

        assert!(estimated.factors["depth_quality"] < lidar.factors["depth_quality"]);
        assert!((estimated.factors["depth_quality"] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn low_fps_penalizes_performance_factor() {
        let mut seg = segment();
        seg.performance_metrics.insert("min_fps".to_string(), 6.0);
        let assessment = DataQualityAnalyzer::new().assess(&seg);
        assert!((assessment.factors["performance_data"] - 0.7).abs() < 1e-9);
        assert!(!assessment.degraded_data.is_empty());
    }

    #[test]
    fn event_gaps_reduce_temporal_score() {
        let mut seg = segment();
        let base = seg.start_timestamp;
        seg.gameplay_events = vec![
            serde_json::json!({"timestamp": base.to_rfc3339()}),
            serde_json::json!({"timestamp": (base + chrono::Duration::seconds(45)).to_rfc3339()}),
        ];
        let assessment = DataQualityAnalyzer::new().assess(&seg);
        assert!((assessment.factors["temporal_consistency"] - 0.9).abs() < 1e-9);
    }

    #[test]
    fn adjustment_floors_at_one_tenth() {
        let mut seg = segment();
        seg.media_uris.clear();
        seg.depth_uris.clear();
        seg.performance_metrics.clear();
        seg.metadata = serde_json::json!({});
        seg.scene_type = None;
        seg.duration_seconds = 0.2;

        let assessment = DataQualityAnalyzer::new().assess(&seg);
        assert!(assessment.confidence_adjustment >= 0.1);
    }

    #[test]
    fn quality_finding_severity_tracks_level() {
        let analyzer = DataQualityAnalyzer::new();
        assert!(analyzer
            .quality_finding(&segment(), &analyzer.assess(&segment()))
            .is_none());

        let mut seg = segment();
        seg.media_uris.clear();
        seg.depth_uris.clear();
        seg.performance_metrics.clear();
        seg.metadata = serde_json::json!({});
        seg.scene_type = None;
        seg.duration_seconds = 0.2;
        let assessment = analyzer.assess(&seg);
        let finding = analyzer.quality_finding(&seg, &assessment).unwrap();
        assert_eq!(finding.detector_type, "data_quality");
        assert!((finding.severity - 0.9).abs() < 1e-9);
        assert!((finding.confidence - 0.95).abs() < 1e-9);
    }

    #[test]
    fn poor_quality_drops_low_confidence_findings() {
        let assessment = QualityAssessment {
            overall_level: QualityLevel::Poor,
            overall_score: 0.5,
            factors: HashMap::new(),
            missing_data: vec![],
            degraded_data: vec![],
            recommendations: vec![],
            can_analyze: true,
            confidence_adjustment: 0.5,
        };
        let keep = Finding::new("physics", "f1".to_string(), "clipping", 0.5, 0.9, Utc::now())
            .with_description("mesh clipping");
        let drop = Finding::new("physics", "f2".to_string(), "clipping", 0.5, 0.6, Utc::now());

        let out = handle_degraded_input(vec![keep, drop], &assessment);
        assert_eq!(out.len(), 1);
        assert!((out[0].confidence - 0.45).abs() < 1e-9);
        assert!(out[0].description.contains("poor data quality"));
    }
}
