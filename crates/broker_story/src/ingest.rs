//! Event Ingestor - consumes `story.events.>` and writes through the state
//! manager.
//!
//! Malformed or unroutable events are logged and dropped; a per-event failure
//! never takes the subscription down. Replayed deliveries are detected by the
//! producer-assigned `event_id` and absorbed without state change or a
//! duplicate audit row.

use crate::schemas::{ArcRole, ProgressState, StoredEvent, StoryDecision};
use crate::state::StoryStateManager;
use anyhow::{anyhow, Context, Result};
use broker_bus::{Bus, BusMessage, Subscription};
use broker_core::subjects;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Relationship deltas larger than this are logged as suspicious.
const LARGE_RELATIONSHIP_DELTA: f64 = 20.0;
/// Interactions with an NPC within this window of its death are a conflict.
const DEAD_NPC_GRACE_MINUTES: i64 = 10;

pub struct EventIngestor {
    manager: Arc<StoryStateManager>,
    bus: Arc<dyn Bus>,
    /// Next sequence number per player, hydrated from the repository on
    /// first use and resynced on insert collision.
    sequence_counters: Mutex<HashMap<Uuid, i64>>,
}

impl EventIngestor {
    pub fn new(manager: Arc<StoryStateManager>, bus: Arc<dyn Bus>) -> Self {
        Self {
            manager,
            bus,
            sequence_counters: Mutex::new(HashMap::new()),
        }
    }

    /// Consume events until cancelled. Per-event errors are logged and
    /// absorbed.
    pub async fn run(&self, mut subscription: Subscription, cancel: CancellationToken) {
        tracing::info!("Story event ingestor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = subscription.next() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = self.handle_message(&msg).await {
                        tracing::error!("Error processing event on {}: {:#}", msg.subject, e);
                    }
                }
            }
        }
        tracing::info!("Story event ingestor stopped");
    }

    pub async fn handle_message(&self, msg: &BusMessage) -> Result<()> {
        let event_type = msg
            .subject
            .strip_prefix(subjects::STORY_EVENTS_PREFIX)
            .ok_or_else(|| anyhow!("Unexpected event subject: {}", msg.subject))?
            .to_string();

        let data: serde_json::Value =
            serde_json::from_slice(&msg.payload).context("Malformed event payload")?;
        self.handle_event(&event_type, data).await
    }

    /// Route one parsed event. Public so tests can drive the routing table
    /// without a bus.
    pub async fn handle_event(&self, event_type: &str, data: serde_json::Value) -> Result<()> {
        let player_id = parse_player_id(&data)?;
        let event_id = data.get("event_id").and_then(|v| v.as_str()).map(String::from);

        // Replay detection: an already-audited event id is a duplicate
        // delivery, not new information.
        if let Some(ref id) = event_id {
            if self.manager.repo().has_event(player_id, id).await? {
                tracing::debug!("Dropping replayed event {} for {}", id, player_id);
                return Ok(());
            }
        }

        match event_type {
            "arc.beat.reached" => self.handle_arc_beat(player_id, &data).await?,
            "arc.started" => self.handle_arc_started(player_id, &data).await?,
            "arc.completed" => self.handle_arc_completed(player_id, &data).await?,
            "quest.completed" => self.handle_quest_completed(player_id, &data).await?,
            "experience.completed" => self.handle_experience_completed(player_id, &data).await?,
            "relationship.changed" => self.handle_relationship_changed(player_id, &data).await?,
            "decision.made" | "moral.choice" => self.handle_decision(player_id, &data).await?,
            "player.death" => self.manager.increment_death_count(player_id).await?,
            "soul.echo.encounter" => self.handle_soul_echo(player_id, &data).await?,
            "world.state.changed" => self.handle_world_state_changed(player_id, &data).await?,
            other => tracing::debug!("Storing generic event {} for {}", other, player_id),
        }

        self.store_event(player_id, event_id, event_type, &data).await?;
        Ok(())
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    async fn handle_arc_beat(&self, player_id: Uuid, data: &serde_json::Value) -> Result<()> {
        let arc_id = required_str(data, "arc_id")?;
        let beat_id = required_str(data, "beat_id")?;
        let role = parse_arc_role(data);

        // Prefer an explicit progress_state over the beat-id heuristic.
        let state = data
            .get("progress_state")
            .and_then(|v| v.as_str())
            .and_then(ProgressState::parse_str)
            .unwrap_or_else(|| progress_state_from_beat(beat_id));

        self.manager
            .update_arc_progress(player_id, arc_id, role, state, Some(beat_id.to_string()))
            .await?;
        tracing::info!("Processed arc beat {}/{} for {}", arc_id, beat_id, player_id);
        Ok(())
    }

    async fn handle_arc_started(&self, player_id: Uuid, data: &serde_json::Value) -> Result<()> {
        let arc_id = required_str(data, "arc_id")?;
        let beat_id = data
            .get("start_beat_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        self.manager
            .update_arc_progress(player_id, arc_id, parse_arc_role(data), ProgressState::Early, beat_id)
            .await
    }

    async fn handle_arc_completed(&self, player_id: Uuid, data: &serde_json::Value) -> Result<()> {
        let arc_id = required_str(data, "arc_id")?;
        let beat_id = data
            .get("final_beat_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        self.manager
            .update_arc_progress(
                player_id,
                arc_id,
                parse_arc_role(data),
                ProgressState::Completed,
                beat_id,
            )
            .await?;

        let payload = serde_json::json!({
            "player_id": player_id.to_string(),
            "arc_id": arc_id,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(e) = self
            .bus
            .publish(subjects::STORY_ARC_COMPLETED, serde_json::to_vec(&payload)?)
            .await
        {
            tracing::warn!("Failed to publish arc completion: {}", e);
        }
        Ok(())
    }

    async fn handle_quest_completed(&self, player_id: Uuid, data: &serde_json::Value) -> Result<()> {
        let quest_id = required_str(data, "quest_id")?;
        if let Some(arc_id) = data.get("arc_id").and_then(|v| v.as_str()) {
            if quest_advances_arc(quest_id) {
                tracing::info!("Quest {} advanced arc {} for {}", quest_id, arc_id, player_id);
            }
        }
        Ok(())
    }

    async fn handle_experience_completed(
        &self,
        player_id: Uuid,
        data: &serde_json::Value,
    ) -> Result<()> {
        let experience_id = required_str(data, "experience_id")?;
        let emotional_impact: HashMap<String, f64> = data
            .get("emotional_impact")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let completed_at = parse_timestamp(data).unwrap_or_else(Utc::now);
        self.manager
            .complete_experience(player_id, experience_id, completed_at, &emotional_impact)
            .await
    }

    async fn handle_relationship_changed(
        &self,
        player_id: Uuid,
        data: &serde_json::Value,
    ) -> Result<()> {
        let entity_id = required_str(data, "entity_id")?;
        let entity_type = data
            .get("entity_type")
            .and_then(|v| v.as_str())
            .and_then(crate::schemas::EntityType::parse_str)
            .unwrap_or(crate::schemas::EntityType::Npc);
        let old_score = data.get("old_score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let new_score = data.get("new_score").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let delta = new_score - old_score;
        let interaction = data.get("reason").and_then(|v| v.as_str()).map(String::from);

        self.manager
            .update_relationship(player_id, entity_id, entity_type, Some(delta), None, interaction)
            .await?;

        if delta.abs() > LARGE_RELATIONSHIP_DELTA {
            tracing::warn!(
                "Significant relationship change: {} ({} -> {}) for {}",
                entity_id,
                old_score,
                new_score,
                player_id
            );
        }
        Ok(())
    }

    async fn handle_decision(&self, player_id: Uuid, data: &serde_json::Value) -> Result<()> {
        let decision = StoryDecision {
            decision_id: required_str(data, "decision_id")?.to_string(),
            arc_id: data.get("arc_id").and_then(|v| v.as_str()).map(String::from),
            npc_id: data.get("npc_id").and_then(|v| v.as_str()).map(String::from),
            choice_label: data
                .get("choice_label")
                .or_else(|| data.get("choice"))
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            outcome_tags: data
                .get("outcome_tags")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            moral_weight: data.get("moral_weight").and_then(|v| v.as_f64()).unwrap_or(0.0),
            timestamp: parse_timestamp(data).unwrap_or_else(Utc::now),
        };
        let session_id = data
            .get("session_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        self.manager
            .record_decision(player_id, decision, session_id)
            .await
    }

    async fn handle_soul_echo(&self, player_id: Uuid, data: &serde_json::Value) -> Result<()> {
        let echo = serde_json::json!({
            "echo_id": data.get("echo_id").cloned().unwrap_or(serde_json::Value::Null),
            "encountered_at": data.get("timestamp").cloned().unwrap_or(serde_json::Value::Null),
            "resolved": data.get("resolved").and_then(|v| v.as_bool()).unwrap_or(false),
        });
        self.manager.record_soul_echo(player_id, echo).await
    }

    /// Cross-check world changes against story memory: a dead NPC the player
    /// interacted with in the last few minutes is a narrative conflict.
    async fn handle_world_state_changed(
        &self,
        player_id: Uuid,
        data: &serde_json::Value,
    ) -> Result<()> {
        let Some(changes) = data.get("changes") else {
            return Ok(());
        };
        let Some(npc_deaths) = changes.get("npc_deaths").and_then(|v| v.as_array()) else {
            return Ok(());
        };

        let snapshot = self.manager.get_snapshot(player_id).await?;
        let cutoff = Utc::now() - Duration::minutes(DEAD_NPC_GRACE_MINUTES);

        for npc_id in npc_deaths.iter().filter_map(|v| v.as_str()) {
            let recent = snapshot.relationships.iter().any(|rel| {
                rel.entity_id == npc_id
                    && rel.last_interaction_at.map(|at| at > cutoff).unwrap_or(false)
            });
            if recent {
                let payload = serde_json::json!({
                    "player_id": player_id.to_string(),
                    "conflict": {
                        "type": "dead_npc_interaction",
                        "npc_id": npc_id,
                        "severity": "high",
                    },
                    "timestamp": Utc::now().to_rfc3339(),
                });
                if let Err(e) = self
                    .bus
                    .publish(subjects::STORY_CONFLICT_DETECTED, serde_json::to_vec(&payload)?)
                    .await
                {
                    tracing::warn!("Failed to publish conflict alert: {}", e);
                }
                tracing::warn!(
                    "Story conflict: dead NPC {} recently interacted with {}",
                    npc_id,
                    player_id
                );
            }
        }
        Ok(())
    }

    // ========================================================================
    // Audit log
    // ========================================================================

    async fn store_event(
        &self,
        player_id: Uuid,
        event_id: Option<String>,
        event_type: &str,
        data: &serde_json::Value,
    ) -> Result<()> {
        let session_id = data
            .get("session_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());
        let created_at = parse_timestamp(data).unwrap_or_else(Utc::now);

        let mut counters = self.sequence_counters.lock().await;
        let repo = self.manager.repo();

        if !counters.contains_key(&player_id) {
            let max = repo.max_sequence_num(player_id).await?;
            counters.insert(player_id, max);
        }
        let next = counters[&player_id] + 1;

        let mut event = StoredEvent {
            player_id,
            session_id,
            event_id,
            event_type: event_type.to_string(),
            event_data: data.clone(),
            sequence_num: next,
            created_at,
        };

        if repo.insert_event(&event).await? {
            counters.insert(player_id, next);
            return Ok(());
        }

        // Another writer claimed the number; resync from the repository and
        // take the following slot so the per-player sequence stays gap-free.
        let resynced = repo.max_sequence_num(player_id).await? + 1;
        event.sequence_num = resynced;
        if repo.insert_event(&event).await? {
            counters.insert(player_id, resynced);
            Ok(())
        } else {
            tracing::error!(
                "Duplicate sequence number {} for {} after resync; dropping event",
                resynced,
                player_id
            );
            Ok(())
        }
    }
}

// ============================================================================
// Parsing helpers
// ============================================================================

fn parse_player_id(data: &serde_json::Value) -> Result<Uuid> {
    data.get("player_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| anyhow!("Event missing player_id"))
}

fn required_str<'a>(data: &'a serde_json::Value, field: &str) -> Result<&'a str> {
    data.get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("Event missing {}", field))
}

fn parse_arc_role(data: &serde_json::Value) -> ArcRole {
    data.get("arc_role")
        .and_then(|v| v.as_str())
        .and_then(ArcRole::parse_str)
        .unwrap_or(ArcRole::MainArc)
}

fn parse_timestamp(data: &serde_json::Value) -> Option<DateTime<Utc>> {
    data.get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Heuristic mapping from beat id to progress, used when the event does not
/// carry an explicit progress_state. TODO: drop once beat metadata carries an
/// explicit stage upstream.
fn progress_state_from_beat(beat_id: &str) -> ProgressState {
    let lower = beat_id.to_lowercase();
    if lower.contains("intro") || lower.contains("start") {
        ProgressState::Early
    } else if lower.contains("climax") || lower.contains("finale") {
        ProgressState::Late
    } else if lower.contains("complete") || lower.contains("end") {
        ProgressState::Completed
    } else {
        ProgressState::Mid
    }
}

fn quest_advances_arc(quest_id: &str) -> bool {
    let lower = quest_id.to_lowercase();
    lower.contains("main") || lower.contains("arc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beat_heuristic_maps_stages() {
        assert_eq!(progress_state_from_beat("arc1_intro"), ProgressState::Early);
        assert_eq!(progress_state_from_beat("the_start"), ProgressState::Early);
        assert_eq!(progress_state_from_beat("climax_battle"), ProgressState::Late);
        assert_eq!(progress_state_from_beat("grand_finale"), ProgressState::Late);
        assert_eq!(progress_state_from_beat("arc_complete"), ProgressState::Completed);
        assert_eq!(progress_state_from_beat("the_end"), ProgressState::Completed);
        assert_eq!(progress_state_from_beat("negotiation_2"), ProgressState::Mid);
    }

    #[test]
    fn earlier_markers_win_on_ambiguous_beat_ids() {
        // "endless_intro_corridor" matches both "intro" and "end"; the
        // early marker is checked first.
        assert_eq!(
            progress_state_from_beat("endless_intro_corridor"),
            ProgressState::Early
        );
    }

    #[test]
    fn quest_advancement_markers() {
        assert!(quest_advances_arc("main_harvest_3"));
        assert!(quest_advances_arc("ARC_negotiation"));
        assert!(!quest_advances_arc("fishing_derby"));
    }
}
