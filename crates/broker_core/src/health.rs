//! Cross-service health reporting model.
//!
//! Every service publishes one of these records every 30 seconds to its own
//! health subject, and additionally to the system-wide subject when degraded
//! or unhealthy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealth {
    pub active: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub service: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub details: serde_json::Value,
    /// Human-readable problem list; empty when healthy.
    pub issues: Vec<String>,
}

impl HealthRecord {
    pub fn new(service: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            service: service.into(),
            status,
            timestamp: Utc::now(),
            details: serde_json::Value::Null,
            issues: Vec::new(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_issues(mut self, issues: Vec<String>) -> Self {
        self.issues = issues;
        self
    }

    /// Whether this record must also go to the system-wide health subject.
    pub fn needs_escalation(&self) -> bool {
        self.status != HealthStatus::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escalation_on_non_healthy() {
        assert!(!HealthRecord::new("story", HealthStatus::Healthy).needs_escalation());
        assert!(HealthRecord::new("story", HealthStatus::Degraded).needs_escalation());
        assert!(HealthRecord::new("story", HealthStatus::Unhealthy).needs_escalation());
    }

    #[test]
    fn status_serializes_lowercase() {
        let record = HealthRecord::new("analyzer", HealthStatus::Degraded)
            .with_issues(vec!["queue backlog".to_string()]);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["issues"][0], "queue backlog");
    }
}
