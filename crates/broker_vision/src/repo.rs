//! Typed repository interface for segments, findings, the analysis queue,
//! and scene summaries.

use crate::segment::{Finding, SegmentContext};
use crate::summary::SceneSummary;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "analyzing" => Some(Self::Analyzing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub queue_id: Uuid,
    pub segment_id: Uuid,
    pub priority: i64,
    pub status: QueueStatus,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait VisionRepo: Send + Sync {
    async fn insert_segment(&self, segment: &SegmentContext) -> Result<()>;
    async fn load_segment(&self, segment_id: Uuid) -> Result<Option<SegmentContext>>;

    /// Transition segment analysis status. `analyzed_at` is stamped when the
    /// status is terminal.
    async fn update_segment_status(
        &self,
        segment_id: Uuid,
        status: SegmentStatus,
        error: Option<&str>,
    ) -> Result<()>;
    async fn segment_status(&self, segment_id: Uuid) -> Result<Option<SegmentStatus>>;

    /// Queue admission: bump priority to `max(existing, new)` on an
    /// already-pending row, or insert a fresh pending row.
    async fn enqueue(&self, segment_id: Uuid, priority: i64) -> Result<()>;

    /// Atomic lease: select the next pending entry ordered by priority then
    /// age, mark it processing, bump attempts. Two workers can never win the
    /// same entry.
    async fn lease_next(&self) -> Result<Option<QueueEntry>>;

    async fn finish_queue_entry(&self, queue_id: Uuid, status: QueueStatus) -> Result<()>;
    async fn queue_status(&self, queue_id: Uuid) -> Result<Option<QueueStatus>>;
    async fn pending_queue_depth(&self) -> Result<i64>;

    async fn insert_finding(&self, segment_id: Uuid, finding: &Finding) -> Result<()>;
    async fn fetch_findings(&self, segment_id: Uuid) -> Result<Vec<Finding>>;

    async fn upsert_scene_summary(&self, summary: &SceneSummary) -> Result<()>;
    async fn fetch_scene_summary(
        &self,
        build_id: &str,
        scene_id: &str,
    ) -> Result<Option<SceneSummary>>;

    async fn healthy(&self) -> bool;
}
