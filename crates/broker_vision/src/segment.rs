//! Segment and finding models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A time-bounded gameplay recording with media, depth, events, and
/// performance data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentContext {
    pub segment_id: Uuid,
    pub build_id: String,
    pub scene_id: String,
    pub level_name: String,
    pub scene_type: Option<String>,

    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    pub duration_seconds: f64,
    pub frame_count: i64,

    pub camera_configs: Vec<serde_json::Value>,
    /// camera_id -> media URI.
    pub media_uris: HashMap<String, String>,
    /// camera_id -> depth URI.
    pub depth_uris: HashMap<String, String>,

    pub gameplay_events: Vec<serde_json::Value>,
    pub performance_metrics: HashMap<String, f64>,

    pub metadata: serde_json::Value,
}

impl SegmentContext {
    /// Gameplay event timestamps in segment order.
    pub fn event_timestamps(&self) -> Vec<DateTime<Utc>> {
        let mut timestamps: Vec<DateTime<Utc>> = self
            .gameplay_events
            .iter()
            .filter_map(|event| event.get("timestamp"))
            .filter_map(|v| v.as_str())
            .filter_map(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .collect();
        timestamps.sort();
        timestamps
    }

    pub fn metadata_str(&self, field: &str) -> Option<&str> {
        self.metadata.get(field).and_then(|v| v.as_str())
    }
}

/// One output record from one detector on one segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub detector_type: String,
    pub issue_id: String,
    pub issue_type: String,

    /// Both in [0, 1].
    pub severity: f64,
    pub confidence: f64,

    pub timestamp: DateTime<Utc>,
    pub camera_id: Option<String>,
    /// Normalized screen coordinates.
    pub screen_coords: Option<(f64, f64)>,
    pub world_coords: Option<(f64, f64, f64)>,

    pub description: String,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,

    #[serde(default)]
    pub affected_goals: Vec<String>,
    pub player_impact: f64,
}

impl Finding {
    pub fn new(
        detector_type: &str,
        issue_id: String,
        issue_type: &str,
        severity: f64,
        confidence: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            detector_type: detector_type.to_string(),
            issue_id,
            issue_type: issue_type.to_string(),
            severity: severity.clamp(0.0, 1.0),
            confidence: confidence.clamp(0.0, 1.0),
            timestamp,
            camera_id: None,
            screen_coords: None,
            world_coords: None,
            description: String::new(),
            evidence_refs: Vec::new(),
            metrics: HashMap::new(),
            affected_goals: Vec::new(),
            player_impact: 0.0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_metric(mut self, key: &str, value: f64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    /// Default goal tagging: severe issues hurt immersion. Detectors may
    /// replace this with their own mapping.
    pub fn with_default_goal_impact(mut self) -> Self {
        if self.severity >= 0.7 && !self.affected_goals.iter().any(|g| g == "G-IMMERSION") {
            self.affected_goals.push("G-IMMERSION".to_string());
        }
        self.player_impact = self.severity * 0.7 + self.confidence * 0.3;
        self
    }
}
