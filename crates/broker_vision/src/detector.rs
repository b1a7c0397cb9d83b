//! Detector framework: the contract every detector satisfies, batch and
//! streaming adapters, and the type registry.
//!
//! There is no inheritance here: a detector is anything implementing
//! [`Detector`]. The [`BatchDetector`] and [`StreamingDetector`] adapters
//! wrap narrower analyzers that want frames delivered all at once or one by
//! one with per-segment state. Streaming state is rebuilt per `analyze`
//! call, so a new segment always starts clean.

use crate::segment::{Finding, SegmentContext};
use anyhow::{bail, Result};
use async_trait::async_trait;
use broker_core::config::DetectorThresholds;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceImpact {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize)]
pub struct DetectorCapabilities {
    pub supported_issue_types: Vec<String>,
    pub requires_depth: bool,
    pub performance_impact: PerformanceImpact,
    pub configuration: serde_json::Value,
}

/// One frame of segment content handed to batch/streaming analyzers.
///
/// Media decoding lives outside this crate; frames are ordered descriptors
/// over the segment's gameplay events.
#[derive(Debug, Clone)]
pub struct FrameRef<'a> {
    pub index: usize,
    pub timestamp: Option<DateTime<Utc>>,
    pub data: &'a serde_json::Value,
}

impl<'a> FrameRef<'a> {
    pub fn from_segment(segment: &'a SegmentContext) -> Vec<FrameRef<'a>> {
        segment
            .gameplay_events
            .iter()
            .enumerate()
            .map(|(index, data)| FrameRef {
                index,
                timestamp: data
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
                data,
            })
            .collect()
    }
}

/// The contract every detector satisfies.
#[async_trait]
pub trait Detector: Send + Sync {
    fn detector_type(&self) -> &str;
    fn capabilities(&self) -> DetectorCapabilities;
    fn thresholds(&self) -> DetectorThresholds;

    /// Analyze a segment. Returned findings have already passed this
    /// detector's thresholds.
    async fn analyze(&self, segment: &SegmentContext) -> Result<Vec<Finding>>;
}

/// Drop findings below the confidence or severity threshold.
pub fn filter_findings(findings: Vec<Finding>, thresholds: DetectorThresholds) -> Vec<Finding> {
    findings
        .into_iter()
        .filter(|f| {
            f.confidence >= thresholds.confidence_threshold
                && f.severity >= thresholds.severity_threshold
        })
        .collect()
}

// ============================================================================
// Batch adapter
// ============================================================================

/// Narrow contract for detectors that want the whole frame list at once.
pub trait BatchAnalyzer: Send + Sync {
    fn detector_type(&self) -> &'static str;
    fn capabilities(&self) -> DetectorCapabilities;
    fn analyze_batch(&self, frames: &[FrameRef<'_>], segment: &SegmentContext) -> Vec<Finding>;
}

pub struct BatchDetector<A: BatchAnalyzer> {
    analyzer: A,
    thresholds: DetectorThresholds,
}

impl<A: BatchAnalyzer> BatchDetector<A> {
    pub fn new(analyzer: A, thresholds: DetectorThresholds) -> Self {
        Self {
            analyzer,
            thresholds,
        }
    }
}

#[async_trait]
impl<A: BatchAnalyzer> Detector for BatchDetector<A> {
    fn detector_type(&self) -> &str {
        self.analyzer.detector_type()
    }

    fn capabilities(&self) -> DetectorCapabilities {
        self.analyzer.capabilities()
    }

    fn thresholds(&self) -> DetectorThresholds {
        self.thresholds
    }

    async fn analyze(&self, segment: &SegmentContext) -> Result<Vec<Finding>> {
        let frames = FrameRef::from_segment(segment);
        let findings = self.analyzer.analyze_batch(&frames, segment);
        Ok(filter_findings(findings, self.thresholds))
    }
}

// ============================================================================
// Streaming adapter
// ============================================================================

/// Narrow contract for detectors that process frames one by one and keep
/// state across a segment.
pub trait StreamAnalyzer: Send + Sync {
    type State: Default + Send;

    fn detector_type(&self) -> &'static str;
    fn capabilities(&self) -> DetectorCapabilities;
    fn analyze_frame(
        &self,
        frame: &FrameRef<'_>,
        segment: &SegmentContext,
        state: &mut Self::State,
    ) -> Vec<Finding>;

    /// Called after the last frame; emit anything the accumulated state
    /// still holds.
    fn finish(&self, _segment: &SegmentContext, _state: Self::State) -> Vec<Finding> {
        Vec::new()
    }
}

pub struct StreamingDetector<A: StreamAnalyzer> {
    analyzer: A,
    thresholds: DetectorThresholds,
}

impl<A: StreamAnalyzer> StreamingDetector<A> {
    pub fn new(analyzer: A, thresholds: DetectorThresholds) -> Self {
        Self {
            analyzer,
            thresholds,
        }
    }
}

#[async_trait]
impl<A: StreamAnalyzer> Detector for StreamingDetector<A> {
    fn detector_type(&self) -> &str {
        self.analyzer.detector_type()
    }

    fn capabilities(&self) -> DetectorCapabilities {
        self.analyzer.capabilities()
    }

    fn thresholds(&self) -> DetectorThresholds {
        self.thresholds
    }

    async fn analyze(&self, segment: &SegmentContext) -> Result<Vec<Finding>> {
        let mut state = A::State::default();
        let mut findings = Vec::new();
        for frame in FrameRef::from_segment(segment) {
            findings.extend(self.analyzer.analyze_frame(&frame, segment, &mut state));
        }
        findings.extend(self.analyzer.finish(segment, state));
        Ok(filter_findings(findings, self.thresholds))
    }
}

// ============================================================================
// Registry
// ============================================================================

type DetectorFactory = Box<dyn Fn(DetectorThresholds) -> Arc<dyn Detector> + Send + Sync>;

/// Maps detector type names to factories. Configuration keyed by detector
/// type is applied at construction.
#[derive(Default)]
pub struct DetectorRegistry {
    factories: HashMap<String, DetectorFactory>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, detector_type: &str, factory: F)
    where
        F: Fn(DetectorThresholds) -> Arc<dyn Detector> + Send + Sync + 'static,
    {
        self.factories
            .insert(detector_type.to_string(), Box::new(factory));
    }

    pub fn known_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.factories.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Build every registered detector, applying per-type threshold
    /// overrides. An override naming an unknown detector type is a
    /// configuration error.
    pub fn build_all(
        &self,
        overrides: &HashMap<String, DetectorThresholds>,
    ) -> Result<Vec<Arc<dyn Detector>>> {
        for key in overrides.keys() {
            if !self.factories.contains_key(key) {
                bail!("Unknown detector type in configuration: {}", key);
            }
        }

        let mut detectors = Vec::new();
        for detector_type in self.known_types() {
            let thresholds = overrides
                .get(detector_type)
                .copied()
                .unwrap_or_default();
            let factory = &self.factories[detector_type];
            detectors.push(factory(thresholds));
            tracing::info!("Initialized {} detector", detector_type);
        }
        Ok(detectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_enforces_both_thresholds() {
        let now = Utc::now();
        let findings = vec![
            Finding::new("test", "a".into(), "x", 0.5, 0.9, now),
            Finding::new("test", "b".into(), "x", 0.2, 0.9, now),
            Finding::new("test", "c".into(), "x", 0.5, 0.5, now),
        ];
        let kept = filter_findings(findings, DetectorThresholds::default());
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].issue_id, "a");
    }

    #[test]
    fn unknown_override_is_rejected() {
        let registry = DetectorRegistry::new();
        let mut overrides = HashMap::new();
        overrides.insert("seismic".to_string(), DetectorThresholds::default());
        assert!(registry.build_all(&overrides).is_err());
    }
}
