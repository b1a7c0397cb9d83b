//! Request/reply API over the bus.
//!
//! Every reply has the shape `{success, error?, <payload>}`; handler
//! exceptions surface as `{success: false, error}`.

use crate::cache::SnapshotCache;
use crate::drift::DriftDetector;
use crate::schemas::{ArcRole, EntityType, ProgressState, CANONICAL_REMINDER};
use crate::state::{StandingDeltas, StoryStateManager};
use anyhow::{anyhow, Result};
use broker_core::subjects;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub struct StoryApi {
    manager: Arc<StoryStateManager>,
    cache: Arc<SnapshotCache>,
    drift: Arc<DriftDetector>,
}

impl StoryApi {
    pub fn new(
        manager: Arc<StoryStateManager>,
        cache: Arc<SnapshotCache>,
        drift: Arc<DriftDetector>,
    ) -> Self {
        Self {
            manager,
            cache,
            drift,
        }
    }

    /// Subjects this API answers on.
    pub fn subjects() -> [&'static str; 8] {
        [
            subjects::STORY_GET_SNAPSHOT,
            subjects::STORY_GET_ARC_PROGRESS,
            subjects::STORY_GET_RELATIONSHIPS,
            subjects::STORY_GET_STANDINGS,
            subjects::STORY_CHECK_DRIFT,
            subjects::STORY_UPDATE_ARC_PROGRESS,
            subjects::STORY_UPDATE_RELATIONSHIP,
            subjects::STORY_UPDATE_STANDING,
        ]
    }

    /// Handle one request; never fails, errors become error replies.
    pub async fn handle(&self, subject: &str, payload: &[u8]) -> Value {
        match self.dispatch(subject, payload).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::error!("Error handling {}: {:#}", subject, e);
                json!({"success": false, "error": e.to_string()})
            }
        }
    }

    async fn dispatch(&self, subject: &str, payload: &[u8]) -> Result<Value> {
        let data: Value = serde_json::from_slice(payload)?;
        match subject {
            subjects::STORY_GET_SNAPSHOT => self.get_snapshot(&data).await,
            subjects::STORY_GET_ARC_PROGRESS => self.get_arc_progress(&data).await,
            subjects::STORY_GET_RELATIONSHIPS => self.get_relationships(&data).await,
            subjects::STORY_GET_STANDINGS => self.get_standings(&data).await,
            subjects::STORY_CHECK_DRIFT => self.check_drift(&data).await,
            subjects::STORY_UPDATE_ARC_PROGRESS => self.update_arc_progress(&data).await,
            subjects::STORY_UPDATE_RELATIONSHIP => self.update_relationship(&data).await,
            subjects::STORY_UPDATE_STANDING => self.update_standing(&data).await,
            other => Err(anyhow!("Unknown API subject: {}", other)),
        }
    }

    async fn get_snapshot(&self, data: &Value) -> Result<Value> {
        let player_id = player_id(data)?;
        let snapshot = self.cache.get(player_id, false).await?;
        Ok(json!({"success": true, "snapshot": snapshot}))
    }

    async fn get_arc_progress(&self, data: &Value) -> Result<Value> {
        let player_id = player_id(data)?;
        let snapshot = self.cache.get(player_id, false).await?;

        match data.get("arc_id").and_then(|v| v.as_str()) {
            Some(arc_id) => {
                let arc = snapshot
                    .arc_progress
                    .iter()
                    .find(|a| a.arc_id == arc_id)
                    .ok_or_else(|| anyhow!("Arc {} not found", arc_id))?;
                Ok(json!({"success": true, "arc_progress": arc}))
            }
            None => Ok(json!({"success": true, "arc_progress": snapshot.arc_progress})),
        }
    }

    async fn get_relationships(&self, data: &Value) -> Result<Value> {
        let player_id = player_id(data)?;
        let snapshot = self.cache.get(player_id, false).await?;

        match data.get("entity_id").and_then(|v| v.as_str()) {
            Some(entity_id) => {
                let relationship = snapshot
                    .relationships
                    .iter()
                    .find(|r| r.entity_id == entity_id)
                    .ok_or_else(|| anyhow!("No relationship found with {}", entity_id))?;
                Ok(json!({"success": true, "relationship": relationship}))
            }
            None => Ok(json!({"success": true, "relationships": snapshot.relationships})),
        }
    }

    async fn get_standings(&self, data: &Value) -> Result<Value> {
        let player_id = player_id(data)?;
        let snapshot = self.cache.get(player_id, false).await?;
        Ok(json!({"success": true, "standings": snapshot.dark_world_standings}))
    }

    async fn check_drift(&self, data: &Value) -> Result<Value> {
        let player_id = player_id(data)?;
        let window_hours = data.get("window_hours").and_then(|v| v.as_i64()).unwrap_or(3);

        match self.drift.check_drift(player_id, window_hours, true).await? {
            Some(report) => Ok(json!({
                "success": true,
                "drift_detected": true,
                "drift_type": report.drift_type,
                "drift_score": report.drift_score,
                "severity": report.severity,
                "details": {
                    "time_allocation": report.time_allocation,
                    "quest_allocation": report.quest_allocation,
                    "theme_consistency": report.theme_consistency,
                },
                "recommended_remediation": report.recommended_correction,
                "canonical_theme_reminder": report.canonical_reminder,
            })),
            None => Ok(json!({
                "success": true,
                "drift_detected": false,
                "canonical_theme_reminder": CANONICAL_REMINDER,
            })),
        }
    }

    async fn update_arc_progress(&self, data: &Value) -> Result<Value> {
        let player_id = player_id(data)?;
        let arc_id = required_str(data, "arc_id")?;
        let arc_role = required_str(data, "arc_role")
            .ok()
            .and_then(ArcRole::parse_str)
            .ok_or_else(|| anyhow!("Invalid or missing arc_role"))?;
        let progress_state = required_str(data, "progress_state")
            .ok()
            .and_then(ProgressState::parse_str)
            .ok_or_else(|| anyhow!("Invalid or missing progress_state"))?;
        let last_beat_id = data
            .get("last_beat_id")
            .and_then(|v| v.as_str())
            .map(String::from);

        self.manager
            .update_arc_progress(player_id, arc_id, arc_role, progress_state, last_beat_id)
            .await?;
        Ok(json!({"success": true}))
    }

    async fn update_relationship(&self, data: &Value) -> Result<Value> {
        let player_id = player_id(data)?;
        let entity_id = required_str(data, "entity_id")?;
        let entity_type = required_str(data, "entity_type")
            .ok()
            .and_then(EntityType::parse_str)
            .ok_or_else(|| anyhow!("Invalid or missing entity_type"))?;
        let score_delta = data.get("score_delta").and_then(|v| v.as_f64());
        let new_flags: Option<Vec<String>> = data
            .get("new_flags")
            .and_then(|v| serde_json::from_value(v.clone()).ok());
        let interaction = data
            .get("interaction")
            .and_then(|v| v.as_str())
            .map(String::from);

        let relationship = self
            .manager
            .update_relationship(player_id, entity_id, entity_type, score_delta, new_flags, interaction)
            .await?;
        Ok(json!({"success": true, "relationship": relationship}))
    }

    async fn update_standing(&self, data: &Value) -> Result<Value> {
        let player_id = player_id(data)?;
        let family = required_str(data, "family")?;
        let deltas = StandingDeltas {
            score: data.get("standing_delta").and_then(|v| v.as_f64()),
            favors: data.get("favor_delta").and_then(|v| v.as_i64()),
            debts: data.get("debt_delta").and_then(|v| v.as_i64()),
        };
        let betrayal = data.get("betrayal").and_then(|v| v.as_bool()).unwrap_or(false);
        let special_status: Option<Vec<String>> = data
            .get("special_status")
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        let standing = self
            .manager
            .update_dark_world_standing(player_id, family, deltas, betrayal, special_status)
            .await?;
        Ok(json!({"success": true, "standing": standing}))
    }
}

fn player_id(data: &Value) -> Result<Uuid> {
    data.get("player_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| anyhow!("Missing or invalid player_id"))
}

fn required_str<'a>(data: &'a Value, field: &str) -> Result<&'a str> {
    data.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Missing {}", field))
}
