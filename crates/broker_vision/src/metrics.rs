//! Prometheus metrics for the analyzer.

use crate::segment::Finding;
use anyhow::Result;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};

/// Bucket a severity value for metric labels.
pub fn severity_bucket(severity: f64) -> &'static str {
    if severity < 0.3 {
        "low"
    } else if severity < 0.6 {
        "medium"
    } else if severity < 0.8 {
        "high"
    } else {
        "critical"
    }
}

pub struct AnalyzerMetrics {
    pub segments_analyzed: IntCounterVec,
    pub analysis_duration: HistogramVec,
    pub issues_detected: IntCounterVec,
    pub analysis_errors: IntCounterVec,
    pub detector_confidence: HistogramVec,
    pub findings_per_segment: HistogramVec,
    pub goal_impacts: IntCounterVec,
}

impl AnalyzerMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let segments_analyzed = IntCounterVec::new(
            Opts::new("vision_segments_analyzed_total", "Segments analyzed"),
            &["status"],
        )?;
        let analysis_duration = HistogramVec::new(
            HistogramOpts::new("vision_analysis_duration_seconds", "Segment analysis time")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
            &["detector_type"],
        )?;
        let issues_detected = IntCounterVec::new(
            Opts::new("vision_issues_detected_total", "Issues detected"),
            &["issue_type", "severity_category", "detector_type"],
        )?;
        let analysis_errors = IntCounterVec::new(
            Opts::new("vision_analysis_errors_total", "Analysis errors"),
            &["detector_type"],
        )?;
        let detector_confidence = HistogramVec::new(
            HistogramOpts::new("vision_detector_confidence", "Finding confidence")
                .buckets(vec![0.1, 0.3, 0.5, 0.7, 0.8, 0.9, 0.95, 1.0]),
            &["detector_type", "issue_type"],
        )?;
        let findings_per_segment = HistogramVec::new(
            HistogramOpts::new("vision_detector_finding_rate", "Findings per segment")
                .buckets(vec![0.0, 1.0, 2.0, 5.0, 10.0, 20.0, 50.0]),
            &["detector_type"],
        )?;
        let goal_impacts = IntCounterVec::new(
            Opts::new("vision_goal_impacts_total", "Issues impacting goals"),
            &["goal", "severity_category"],
        )?;

        for collector in [
            Box::new(segments_analyzed.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(analysis_duration.clone()),
            Box::new(issues_detected.clone()),
            Box::new(analysis_errors.clone()),
            Box::new(detector_confidence.clone()),
            Box::new(findings_per_segment.clone()),
            Box::new(goal_impacts.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Self {
            segments_analyzed,
            analysis_duration,
            issues_detected,
            analysis_errors,
            detector_confidence,
            findings_per_segment,
            goal_impacts,
        })
    }

    /// Record one detector's pass over a segment.
    pub fn record_findings(&self, detector_type: &str, findings: &[Finding]) {
        self.findings_per_segment
            .with_label_values(&[detector_type])
            .observe(findings.len() as f64);

        for finding in findings {
            let bucket = severity_bucket(finding.severity);
            self.issues_detected
                .with_label_values(&[&finding.issue_type, bucket, detector_type])
                .inc();
            self.detector_confidence
                .with_label_values(&[detector_type, &finding.issue_type])
                .observe(finding.confidence);
            for goal in &finding.affected_goals {
                self.goal_impacts.with_label_values(&[goal, bucket]).inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn severity_buckets_match_bands() {
        assert_eq!(severity_bucket(0.0), "low");
        assert_eq!(severity_bucket(0.29), "low");
        assert_eq!(severity_bucket(0.3), "medium");
        assert_eq!(severity_bucket(0.59), "medium");
        assert_eq!(severity_bucket(0.6), "high");
        assert_eq!(severity_bucket(0.79), "high");
        assert_eq!(severity_bucket(0.8), "critical");
        assert_eq!(severity_bucket(1.0), "critical");
    }

    #[test]
    fn record_findings_counts_by_labels() {
        let registry = Registry::new();
        let metrics = AnalyzerMetrics::new(&registry).unwrap();

        let mut finding = Finding::new(
            "physics",
            "f1".to_string(),
            "clipping",
            0.85,
            0.9,
            Utc::now(),
        );
        finding.affected_goals = vec!["G-IMMERSION".to_string()];
        metrics.record_findings("physics", &[finding]);

        let families = registry.gather();
        let issues = families
            .iter()
            .find(|f| f.get_name() == "vision_issues_detected_total")
            .unwrap();
        assert_eq!(issues.get_metric()[0].get_counter().get_value(), 1.0);
    }
}
