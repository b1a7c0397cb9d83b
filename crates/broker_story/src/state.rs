//! Story State Manager - owns all reads and writes of per-player story state.
//!
//! Write paths serialize per player through an in-process lock so concurrent
//! mutations for the same player are equivalent to some serial order. Every
//! successful mutation invalidates the snapshot cache for the player and
//! publishes a domain event after commit (at-least-once; consumers are
//! idempotent).

use crate::cache::SnapshotInvalidator;
use crate::repo::StoryRepo;
use crate::schemas::{
    ArcProgress, ArcRole, DarkWorldStanding, EntityRelationship, EntityType, Experience,
    ProgressState, StoryDecision, StorySnapshot,
};
use anyhow::Result;
use broker_bus::Bus;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Domain event subjects for state mutations.
pub const SUBJECT_ARC_PROGRESS: &str = "events.story.v1.arc_progress";
pub const SUBJECT_DECISION: &str = "events.story.v1.decision";
pub const SUBJECT_RELATIONSHIP: &str = "events.story.v1.relationship";
pub const SUBJECT_STANDING: &str = "events.story.v1.standing";

/// Moral weights below this magnitude do not move the surgeon-butcher score.
const MORAL_WEIGHT_EPSILON: f64 = 0.01;
/// Snapshot retains this many most-recent decisions.
const RECENT_DECISION_LIMIT: i64 = 20;

/// Deltas applied to a dark-world standing in one call.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandingDeltas {
    pub score: Option<f64>,
    pub favors: Option<i64>,
    pub debts: Option<i64>,
}

pub struct StoryStateManager {
    repo: Arc<dyn StoryRepo>,
    bus: Arc<dyn Bus>,
    families: Vec<String>,
    player_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    invalidator: RwLock<Option<Arc<dyn SnapshotInvalidator>>>,
}

impl StoryStateManager {
    pub fn new(repo: Arc<dyn StoryRepo>, bus: Arc<dyn Bus>, families: Vec<String>) -> Self {
        Self {
            repo,
            bus,
            families,
            player_locks: Mutex::new(HashMap::new()),
            invalidator: RwLock::new(None),
        }
    }

    /// Wire the snapshot cache in after construction (the cache wraps this
    /// manager, so it cannot be passed to the constructor).
    pub fn set_invalidator(&self, invalidator: Arc<dyn SnapshotInvalidator>) {
        *self.invalidator.write().unwrap() = Some(invalidator);
    }

    pub fn repo(&self) -> &Arc<dyn StoryRepo> {
        &self.repo
    }

    fn player_lock(&self, player_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.player_locks
            .lock()
            .unwrap()
            .entry(player_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn invalidate(&self, player_id: Uuid) {
        let invalidator = self.invalidator.read().unwrap().clone();
        if let Some(inv) = invalidator {
            inv.invalidate(player_id).await;
        }
    }

    /// Best-effort post-commit publish. Failures are logged, never raised;
    /// consumers tolerate duplicates so redelivery after a crash is fine.
    async fn publish_domain_event(&self, subject: &str, payload: serde_json::Value) {
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(subject, bytes).await {
                    tracing::warn!("Failed to publish domain event on {}: {}", subject, e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize domain event for {}: {}", subject, e),
        }
    }

    async fn ensure_player(&self, player_id: Uuid) -> Result<()> {
        if self.repo.fetch_player(player_id).await?.is_none() {
            tracing::info!("Initializing new player {}", player_id);
            self.repo.init_player(player_id, &self.families).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Assemble a full snapshot, lazily initializing the player on first
    /// access (idempotent under concurrent first reads).
    pub async fn get_snapshot(&self, player_id: Uuid) -> Result<StorySnapshot> {
        let books = match self.repo.fetch_player(player_id).await? {
            Some(books) => books,
            None => {
                self.ensure_player(player_id).await?;
                self.repo
                    .fetch_player(player_id)
                    .await?
                    .expect("player row exists after initialization")
            }
        };

        let arc_progress = self.repo.fetch_arcs(player_id).await?;
        let recent_decisions = self
            .repo
            .fetch_recent_decisions(player_id, RECENT_DECISION_LIMIT)
            .await?;
        let relationships = self.repo.fetch_relationships(player_id).await?;
        let standings = self.repo.fetch_standings(player_id).await?;

        let (active_experiences, completed_experiences) =
            split_experiences(self.repo.fetch_experiences(player_id).await?);

        Ok(StorySnapshot {
            player_id,
            surgeon_butcher_score: books.surgeon_butcher_score,
            broker_book_state: books.broker_book_state,
            debt_of_flesh_state: books.debt_of_flesh_state,
            arc_progress,
            recent_decisions,
            relationships,
            active_experiences,
            completed_experiences,
            dark_world_standings: standings,
        })
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    pub async fn update_arc_progress(
        &self,
        player_id: Uuid,
        arc_id: &str,
        arc_role: ArcRole,
        progress_state: ProgressState,
        last_beat_id: Option<String>,
    ) -> Result<()> {
        let lock = self.player_lock(player_id);
        let _guard = lock.lock().await;

        self.ensure_player(player_id).await?;
        let arc = ArcProgress {
            arc_id: arc_id.to_string(),
            arc_role,
            progress_state,
            last_beat_id,
            updated_at: Utc::now(),
        };
        self.repo.upsert_arc(player_id, &arc).await?;

        self.invalidate(player_id).await;
        self.publish_domain_event(
            SUBJECT_ARC_PROGRESS,
            serde_json::json!({
                "player_id": player_id.to_string(),
                "arc_id": arc.arc_id,
                "arc_role": arc.arc_role,
                "progress_state": arc.progress_state,
                "timestamp": arc.updated_at.to_rfc3339(),
            }),
        )
        .await;
        Ok(())
    }

    /// Append a decision. Moral weights above the epsilon also move the
    /// surgeon-butcher score, clamped to [-1, 1], in the same transaction.
    pub async fn record_decision(
        &self,
        player_id: Uuid,
        decision: StoryDecision,
        session_id: Option<Uuid>,
    ) -> Result<()> {
        let lock = self.player_lock(player_id);
        let _guard = lock.lock().await;

        self.ensure_player(player_id).await?;
        let moral_delta =
            (decision.moral_weight.abs() > MORAL_WEIGHT_EPSILON).then_some(decision.moral_weight);
        self.repo
            .insert_decision(player_id, session_id, &decision, moral_delta)
            .await?;

        self.invalidate(player_id).await;
        self.publish_domain_event(
            SUBJECT_DECISION,
            serde_json::json!({
                "player_id": player_id.to_string(),
                "decision_id": decision.decision_id,
                "moral_weight": decision.moral_weight,
                "timestamp": decision.timestamp.to_rfc3339(),
            }),
        )
        .await;
        Ok(())
    }

    pub async fn update_relationship(
        &self,
        player_id: Uuid,
        entity_id: &str,
        entity_type: EntityType,
        score_delta: Option<f64>,
        new_flags: Option<Vec<String>>,
        interaction: Option<String>,
    ) -> Result<EntityRelationship> {
        let lock = self.player_lock(player_id);
        let _guard = lock.lock().await;

        self.ensure_player(player_id).await?;
        let current = self.repo.fetch_relationship(player_id, entity_id).await?;

        let base_score = current.as_ref().map(|r| r.score).unwrap_or(0.0);
        let score = match score_delta {
            Some(delta) => (base_score + delta).clamp(-100.0, 100.0),
            None => base_score,
        };

        let mut flags = current.map(|r| r.flags).unwrap_or_default();
        if let Some(new_flags) = new_flags {
            flags = merge_string_set(flags, new_flags);
        }

        let last_interaction_at = interaction.as_ref().map(|_| Utc::now());
        let relationship = EntityRelationship {
            entity_id: entity_id.to_string(),
            entity_type,
            score,
            flags,
            last_interaction: interaction,
            last_interaction_at,
        };
        self.repo
            .upsert_relationship(player_id, &relationship)
            .await?;

        self.invalidate(player_id).await;
        self.publish_domain_event(
            SUBJECT_RELATIONSHIP,
            serde_json::json!({
                "player_id": player_id.to_string(),
                "entity_id": relationship.entity_id,
                "score": relationship.score,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        Ok(relationship)
    }

    pub async fn update_dark_world_standing(
        &self,
        player_id: Uuid,
        family: &str,
        deltas: StandingDeltas,
        betrayal: bool,
        special_status: Option<Vec<String>>,
    ) -> Result<DarkWorldStanding> {
        let lock = self.player_lock(player_id);
        let _guard = lock.lock().await;

        self.ensure_player(player_id).await?;
        let current = self
            .repo
            .fetch_standing(player_id, family)
            .await?
            .unwrap_or_else(|| DarkWorldStanding::neutral(family));

        let mut standing = current;
        if let Some(delta) = deltas.score {
            standing.score = (standing.score + delta).clamp(-100.0, 100.0);
        }
        standing.favors_owed = (standing.favors_owed + deltas.favors.unwrap_or(0)).max(0);
        standing.debts_owed = (standing.debts_owed + deltas.debts.unwrap_or(0)).max(0);
        if betrayal {
            standing.betrayal_count += 1;
        }
        if let Some(statuses) = special_status {
            standing.special_status = merge_string_set(standing.special_status, statuses);
        }
        standing.last_interaction = Some(Utc::now());

        self.repo.upsert_standing(player_id, &standing).await?;

        self.invalidate(player_id).await;
        self.publish_domain_event(
            SUBJECT_STANDING,
            serde_json::json!({
                "player_id": player_id.to_string(),
                "family": standing.family,
                "score": standing.score,
                "betrayal": betrayal,
                "timestamp": Utc::now().to_rfc3339(),
            }),
        )
        .await;
        Ok(standing)
    }

    pub async fn complete_experience(
        &self,
        player_id: Uuid,
        experience_id: &str,
        completed_at: DateTime<Utc>,
        emotional_impact: &HashMap<String, f64>,
    ) -> Result<()> {
        let lock = self.player_lock(player_id);
        let _guard = lock.lock().await;

        self.ensure_player(player_id).await?;
        self.repo
            .complete_experience(player_id, experience_id, completed_at, emotional_impact)
            .await?;
        self.invalidate(player_id).await;
        Ok(())
    }

    /// Bump `debt_of_flesh_state.death_count`.
    pub async fn increment_death_count(&self, player_id: Uuid) -> Result<()> {
        let lock = self.player_lock(player_id);
        let _guard = lock.lock().await;

        self.ensure_player(player_id).await?;
        let mut books = self
            .repo
            .fetch_player(player_id)
            .await?
            .expect("player row exists after initialization");
        let count = books
            .debt_of_flesh_state
            .get("death_count")
            .and_then(|v| v.as_i64())
            .unwrap_or(0);
        books.debt_of_flesh_state["death_count"] = serde_json::json!(count + 1);
        self.repo
            .update_player_books(player_id, &books.broker_book_state, &books.debt_of_flesh_state)
            .await?;
        self.invalidate(player_id).await;
        Ok(())
    }

    /// Append a soul-echo record to `debt_of_flesh_state.soul_echoes`.
    pub async fn record_soul_echo(&self, player_id: Uuid, echo: serde_json::Value) -> Result<()> {
        let lock = self.player_lock(player_id);
        let _guard = lock.lock().await;

        self.ensure_player(player_id).await?;
        let mut books = self
            .repo
            .fetch_player(player_id)
            .await?
            .expect("player row exists after initialization");
        match books.debt_of_flesh_state.get_mut("soul_echoes") {
            Some(serde_json::Value::Array(echoes)) => echoes.push(echo),
            _ => {
                books.debt_of_flesh_state["soul_echoes"] = serde_json::json!([echo]);
            }
        }
        self.repo
            .update_player_books(player_id, &books.broker_book_state, &books.debt_of_flesh_state)
            .await?;
        self.invalidate(player_id).await;
        Ok(())
    }
}

/// Set-merge two flag lists, sorted so snapshots serialize deterministically.
fn merge_string_set(mut base: Vec<String>, extra: Vec<String>) -> Vec<String> {
    for item in extra {
        if !base.contains(&item) {
            base.push(item);
        }
    }
    base.sort();
    base
}

/// Split experiences into (active, completed) the way snapshots expose them.
fn split_experiences(all: Vec<Experience>) -> (Vec<Experience>, Vec<Experience>) {
    all.into_iter().partition(|e| !e.status.is_terminal())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_string_set_dedupes_and_sorts() {
        let merged = merge_string_set(
            vec!["hostile".to_string(), "ally".to_string()],
            vec!["ally".to_string(), "blood_debt".to_string()],
        );
        assert_eq!(merged, vec!["ally", "blood_debt", "hostile"]);
    }
}
