//! Scene summary aggregation.
//!
//! Each completed segment analysis folds its findings into a summary keyed
//! by `(build_id, scene_id)`; repeated segments for the same scene increment
//! the totals and overwrite the rolling figures.

use crate::segment::{Finding, SegmentContext};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Findings at or above this severity make the critical list.
const CRITICAL_SEVERITY: f64 = 0.8;
const CRITICAL_LIST_CAP: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSummary {
    pub build_id: String,
    pub scene_id: String,
    pub total_segments: i64,
    pub analyzed_segments: i64,
    pub issue_counts: HashMap<String, i64>,
    pub avg_severities: HashMap<String, f64>,
    /// Up to five `"<issue_type> (<detector>)"` entries.
    pub critical_issues: Vec<String>,
    pub visual_quality_score: f64,
    pub horror_atmosphere_score: f64,
    pub technical_stability_score: f64,
    pub last_updated: DateTime<Utc>,
}

/// Fold one segment's findings into a single-segment summary.
pub fn summarize_segment(segment: &SegmentContext, findings: &[Finding]) -> SceneSummary {
    let mut issue_counts: HashMap<String, i64> = HashMap::new();
    let mut severity_sums: HashMap<String, f64> = HashMap::new();

    for finding in findings {
        *issue_counts.entry(finding.detector_type.clone()).or_insert(0) += 1;
        *severity_sums
            .entry(finding.detector_type.clone())
            .or_insert(0.0) += finding.severity;
    }

    let avg_severities: HashMap<String, f64> = issue_counts
        .iter()
        .map(|(detector, count)| (detector.clone(), severity_sums[detector] / *count as f64))
        .collect();

    let critical_issues: Vec<String> = findings
        .iter()
        .filter(|f| f.severity >= CRITICAL_SEVERITY)
        .take(CRITICAL_LIST_CAP)
        .map(|f| format!("{} ({})", f.issue_type, f.detector_type))
        .collect();

    let avg = |detector: &str| avg_severities.get(detector).copied().unwrap_or(0.0);

    let visual_quality =
        1.0 - (0.5 * avg("rendering") + 0.3 * avg("animation") + 0.2 * avg("physics"));
    let horror_atmosphere = 1.0 - avg("lighting");
    let technical_stability = 1.0 - (0.6 * avg("performance") + 0.4 * avg("flow"));

    SceneSummary {
        build_id: segment.build_id.clone(),
        scene_id: segment.scene_id.clone(),
        total_segments: 1,
        analyzed_segments: 1,
        issue_counts,
        avg_severities,
        critical_issues,
        visual_quality_score: visual_quality.clamp(0.0, 1.0),
        horror_atmosphere_score: horror_atmosphere.clamp(0.0, 1.0),
        technical_stability_score: technical_stability.clamp(0.0, 1.0),
        last_updated: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn segment() -> SegmentContext {
        SegmentContext {
            segment_id: Uuid::new_v4(),
            build_id: "build-9".to_string(),
            scene_id: "crypt".to_string(),
            level_name: "crypt_depths".to_string(),
            scene_type: None,
            start_timestamp: Utc::now(),
            end_timestamp: Utc::now(),
            duration_seconds: 30.0,
            frame_count: 1800,
            camera_configs: vec![],
            media_uris: HashMap::new(),
            depth_uris: HashMap::new(),
            gameplay_events: vec![],
            performance_metrics: HashMap::new(),
            metadata: serde_json::json!({}),
        }
    }

    fn finding(detector: &str, issue: &str, severity: f64) -> Finding {
        Finding::new(
            detector,
            format!("{}_{}", detector, issue),
            issue,
            severity,
            0.9,
            Utc::now(),
        )
    }

    #[test]
    fn composite_scores_weight_detectors() {
        let findings = vec![
            finding("rendering", "z_fighting", 0.4),
            finding("rendering", "texture_missing", 0.6),
            finding("animation", "t_pose", 1.0),
            finding("performance", "low_fps", 0.5),
        ];
        let summary = summarize_segment(&segment(), &findings);

        assert_eq!(summary.issue_counts["rendering"], 2);
        // rendering avg 0.5, animation avg 1.0, physics absent → 0.
        let expected_visual = 1.0 - (0.5 * 0.5 + 0.3 * 1.0 + 0.2 * 0.0);
        assert!((summary.visual_quality_score - expected_visual).abs() < 1e-9);
        // No lighting findings → perfect horror atmosphere.
        assert!((summary.horror_atmosphere_score - 1.0).abs() < 1e-9);
        let expected_stability = 1.0 - (0.6 * 0.5 + 0.4 * 0.0);
        assert!((summary.technical_stability_score - expected_stability).abs() < 1e-9);
    }

    #[test]
    fn critical_list_caps_at_five() {
        let findings: Vec<Finding> = (0..8)
            .map(|i| finding("physics", &format!("clip_{}", i), 0.85))
            .collect();
        let summary = summarize_segment(&segment(), &findings);
        assert_eq!(summary.critical_issues.len(), 5);
        assert!(summary.critical_issues[0].contains("(physics)"));
    }

    #[test]
    fn scores_clamp_to_unit_interval() {
        let findings = vec![
            finding("lighting", "overexposed_scene", 1.0),
            finding("performance", "low_fps", 1.0),
            finding("flow", "dead_air", 1.0),
        ];
        let summary = summarize_segment(&segment(), &findings);
        assert_eq!(summary.horror_atmosphere_score, 0.0);
        assert_eq!(summary.technical_stability_score, 0.0);
        assert_eq!(summary.visual_quality_score, 1.0);
    }

    #[test]
    fn empty_findings_yield_perfect_scores() {
        let summary = summarize_segment(&segment(), &[]);
        assert!(summary.issue_counts.is_empty());
        assert_eq!(summary.visual_quality_score, 1.0);
        assert_eq!(summary.horror_atmosphere_score, 1.0);
        assert_eq!(summary.technical_stability_score, 1.0);
    }
}
