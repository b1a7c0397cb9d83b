//! The six shipped detectors.
//!
//! Signal extraction is data-driven: the capture pipeline annotates segments
//! with typed warning markers in `gameplay_events` and rolls up numeric
//! signals into `performance_metrics`. Detectors turn those into findings
//! deterministically; none of the heavy CV work happens in this service.

use crate::detector::{
    BatchAnalyzer, BatchDetector, DetectorCapabilities, DetectorRegistry, FrameRef,
    PerformanceImpact, StreamAnalyzer, StreamingDetector,
};
use crate::segment::{Finding, SegmentContext};
use std::sync::Arc;

/// Registry with all six shipped detector types.
pub fn shipped_registry() -> DetectorRegistry {
    let mut registry = DetectorRegistry::new();
    registry.register("animation", |thresholds| {
        Arc::new(BatchDetector::new(AnimationAnalyzer, thresholds))
    });
    registry.register("physics", |thresholds| {
        Arc::new(BatchDetector::new(PhysicsAnalyzer, thresholds))
    });
    registry.register("rendering", |thresholds| {
        Arc::new(BatchDetector::new(RenderingAnalyzer, thresholds))
    });
    registry.register("lighting", |thresholds| {
        Arc::new(BatchDetector::new(LightingAnalyzer, thresholds))
    });
    registry.register("performance", |thresholds| {
        Arc::new(BatchDetector::new(PerformanceAnalyzer, thresholds))
    });
    registry.register("flow", |thresholds| {
        Arc::new(StreamingDetector::new(FlowAnalyzer, thresholds))
    });
    registry
}

/// Convert capture-pipeline warning markers of one kind into findings.
fn marker_findings(
    frames: &[FrameRef<'_>],
    segment: &SegmentContext,
    detector_type: &str,
    marker_type: &str,
    default_issue: &str,
) -> Vec<Finding> {
    frames
        .iter()
        .filter(|frame| {
            frame.data.get("type").and_then(|v| v.as_str()) == Some(marker_type)
        })
        .map(|frame| {
            let issue_type = frame
                .data
                .get("issue")
                .and_then(|v| v.as_str())
                .unwrap_or(default_issue);
            let severity = frame
                .data
                .get("severity")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.5);
            let confidence = frame
                .data
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.75);

            let mut finding = Finding::new(
                detector_type,
                format!("{}_{}_{}", detector_type, segment.segment_id, frame.index),
                issue_type,
                severity,
                confidence,
                frame.timestamp.unwrap_or(segment.start_timestamp),
            )
            .with_description(
                frame
                    .data
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or(issue_type)
                    .to_string(),
            );
            finding.camera_id = frame
                .data
                .get("camera_id")
                .and_then(|v| v.as_str())
                .map(String::from);
            finding.with_default_goal_impact()
        })
        .collect()
}

// ============================================================================
// Animation
// ============================================================================

pub struct AnimationAnalyzer;

impl BatchAnalyzer for AnimationAnalyzer {
    fn detector_type(&self) -> &'static str {
        "animation"
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            supported_issue_types: vec![
                "t_pose".to_string(),
                "foot_sliding".to_string(),
                "blend_pop".to_string(),
            ],
            requires_depth: false,
            performance_impact: PerformanceImpact::Medium,
            configuration: serde_json::json!({"marker_type": "animation_warning"}),
        }
    }

    fn analyze_batch(&self, frames: &[FrameRef<'_>], segment: &SegmentContext) -> Vec<Finding> {
        marker_findings(frames, segment, "animation", "animation_warning", "t_pose")
    }
}

// ============================================================================
// Physics
// ============================================================================

pub struct PhysicsAnalyzer;

impl BatchAnalyzer for PhysicsAnalyzer {
    fn detector_type(&self) -> &'static str {
        "physics"
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            supported_issue_types: vec![
                "clipping".to_string(),
                "ragdoll_explosion".to_string(),
                "object_jitter".to_string(),
            ],
            requires_depth: true,
            performance_impact: PerformanceImpact::High,
            configuration: serde_json::json!({"marker_type": "physics_warning"}),
        }
    }

    fn analyze_batch(&self, frames: &[FrameRef<'_>], segment: &SegmentContext) -> Vec<Finding> {
        marker_findings(frames, segment, "physics", "physics_warning", "clipping")
    }
}

// ============================================================================
// Rendering
// ============================================================================

pub struct RenderingAnalyzer;

impl BatchAnalyzer for RenderingAnalyzer {
    fn detector_type(&self) -> &'static str {
        "rendering"
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            supported_issue_types: vec![
                "z_fighting".to_string(),
                "texture_missing".to_string(),
                "lod_pop".to_string(),
            ],
            requires_depth: false,
            performance_impact: PerformanceImpact::Medium,
            configuration: serde_json::json!({"marker_type": "rendering_warning"}),
        }
    }

    fn analyze_batch(&self, frames: &[FrameRef<'_>], segment: &SegmentContext) -> Vec<Finding> {
        marker_findings(frames, segment, "rendering", "rendering_warning", "z_fighting")
    }
}

// ============================================================================
// Lighting
// ============================================================================

/// The horror read of a scene lives in its exposure: washed-out frames kill
/// the atmosphere, fully crushed blacks hide the threat.
pub struct LightingAnalyzer;

const LUMINANCE_CEILING: f64 = 0.55;
const LUMINANCE_FLOOR: f64 = 0.02;

impl BatchAnalyzer for LightingAnalyzer {
    fn detector_type(&self) -> &'static str {
        "lighting"
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            supported_issue_types: vec![
                "overexposed_scene".to_string(),
                "crushed_blacks".to_string(),
            ],
            requires_depth: false,
            performance_impact: PerformanceImpact::Low,
            configuration: serde_json::json!({
                "luminance_ceiling": LUMINANCE_CEILING,
                "luminance_floor": LUMINANCE_FLOOR,
            }),
        }
    }

    fn analyze_batch(&self, _frames: &[FrameRef<'_>], segment: &SegmentContext) -> Vec<Finding> {
        let Some(luminance) = segment.performance_metrics.get("avg_luminance").copied() else {
            return Vec::new();
        };

        let mut findings = Vec::new();
        if luminance > LUMINANCE_CEILING {
            let severity = ((luminance - LUMINANCE_CEILING) / (1.0 - LUMINANCE_CEILING)).min(1.0);
            findings.push(
                Finding::new(
                    "lighting",
                    format!("lighting_{}_over", segment.segment_id),
                    "overexposed_scene",
                    severity.max(0.3),
                    0.85,
                    segment.start_timestamp,
                )
                .with_description("Scene luminance above horror target range")
                .with_metric("avg_luminance", luminance)
                .with_default_goal_impact(),
            );
        } else if luminance < LUMINANCE_FLOOR {
            findings.push(
                Finding::new(
                    "lighting",
                    format!("lighting_{}_under", segment.segment_id),
                    "crushed_blacks",
                    0.4,
                    0.8,
                    segment.start_timestamp,
                )
                .with_description("Scene luminance below readability floor")
                .with_metric("avg_luminance", luminance)
                .with_default_goal_impact(),
            );
        }
        findings
    }
}

// ============================================================================
// Performance
// ============================================================================

pub struct PerformanceAnalyzer;

const TARGET_FPS: f64 = 30.0;
const FRAME_SPIKE_MS: f64 = 50.0;

impl BatchAnalyzer for PerformanceAnalyzer {
    fn detector_type(&self) -> &'static str {
        "performance"
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            supported_issue_types: vec!["low_fps".to_string(), "frame_spikes".to_string()],
            requires_depth: false,
            performance_impact: PerformanceImpact::Low,
            configuration: serde_json::json!({
                "target_fps": TARGET_FPS,
                "frame_spike_ms": FRAME_SPIKE_MS,
            }),
        }
    }

    fn analyze_batch(&self, _frames: &[FrameRef<'_>], segment: &SegmentContext) -> Vec<Finding> {
        let perf = &segment.performance_metrics;
        let mut findings = Vec::new();

        if let Some(min_fps) = perf.get("min_fps").copied() {
            if min_fps < TARGET_FPS {
                let severity = ((TARGET_FPS - min_fps) / TARGET_FPS).clamp(0.0, 1.0);
                findings.push(
                    Finding::new(
                        "performance",
                        format!("performance_{}_fps", segment.segment_id),
                        "low_fps",
                        severity.max(0.3),
                        0.95,
                        segment.start_timestamp,
                    )
                    .with_description(format!("Minimum FPS {:.1} below target", min_fps))
                    .with_metric("min_fps", min_fps)
                    .with_default_goal_impact(),
                );
            }
        }

        if let Some(spike) = perf.get("frame_time_spike_ms").copied() {
            if spike > FRAME_SPIKE_MS {
                let severity = ((spike - FRAME_SPIKE_MS) / 200.0).clamp(0.3, 1.0);
                findings.push(
                    Finding::new(
                        "performance",
                        format!("performance_{}_spike", segment.segment_id),
                        "frame_spikes",
                        severity,
                        0.9,
                        segment.start_timestamp,
                    )
                    .with_description(format!("Frame time spike of {:.0} ms", spike))
                    .with_metric("frame_time_spike_ms", spike)
                    .with_default_goal_impact(),
                );
            }
        }
        findings
    }
}

// ============================================================================
// Flow (streaming)
// ============================================================================

/// Stretches of gameplay with no events at all read as dead air; the flow
/// analyzer walks the event stream and flags long silences.
pub struct FlowAnalyzer;

const DEAD_AIR_SECONDS: i64 = 10;

#[derive(Default)]
pub struct FlowState {
    last_timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

impl StreamAnalyzer for FlowAnalyzer {
    type State = FlowState;

    fn detector_type(&self) -> &'static str {
        "flow"
    }

    fn capabilities(&self) -> DetectorCapabilities {
        DetectorCapabilities {
            supported_issue_types: vec!["dead_air".to_string()],
            requires_depth: false,
            performance_impact: PerformanceImpact::Low,
            configuration: serde_json::json!({"dead_air_seconds": DEAD_AIR_SECONDS}),
        }
    }

    fn analyze_frame(
        &self,
        frame: &FrameRef<'_>,
        segment: &SegmentContext,
        state: &mut Self::State,
    ) -> Vec<Finding> {
        let Some(timestamp) = frame.timestamp else {
            return Vec::new();
        };

        let mut findings = Vec::new();
        if let Some(last) = state.last_timestamp {
            let gap = (timestamp - last).num_seconds();
            if gap > DEAD_AIR_SECONDS {
                let severity = (gap as f64 / 60.0).clamp(0.3, 1.0);
                findings.push(
                    Finding::new(
                        "flow",
                        format!("flow_{}_{}", segment.segment_id, frame.index),
                        "dead_air",
                        severity,
                        0.8,
                        last,
                    )
                    .with_description(format!("{}s of gameplay with no events", gap))
                    .with_metric("gap_seconds", gap as f64)
                    .with_default_goal_impact(),
                );
            }
        }
        state.last_timestamp = Some(timestamp);
        findings
    }
}
