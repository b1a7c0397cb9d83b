//! Typed repository interface for the story entities.
//!
//! The state manager only ever talks to this trait; the shipped backend is
//! [`crate::sqlite::SqliteStoryRepo`]. Tests may substitute fakes.

use crate::schemas::{
    ArcProgress, DarkWorldStanding, DriftReport, EntityRelationship, Experience, StoredEvent,
    StoryConflict, StoryDecision,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Player-level bookkeeping blobs plus the moral score.
#[derive(Debug, Clone)]
pub struct PlayerBooks {
    pub surgeon_butcher_score: f64,
    pub broker_book_state: serde_json::Value,
    pub debt_of_flesh_state: serde_json::Value,
}

#[async_trait]
pub trait StoryRepo: Send + Sync {
    /// Fetch the player row, or `None` for an uninitialized player.
    async fn fetch_player(&self, player_id: Uuid) -> Result<Option<PlayerBooks>>;

    /// Create the player row with zeroed scores and one neutral standing per
    /// family. Idempotent under concurrent first access.
    async fn init_player(&self, player_id: Uuid, families: &[String]) -> Result<()>;

    /// Overwrite the player's bookkeeping blobs.
    async fn update_player_books(
        &self,
        player_id: Uuid,
        broker_book_state: &serde_json::Value,
        debt_of_flesh_state: &serde_json::Value,
    ) -> Result<()>;

    async fn fetch_arcs(&self, player_id: Uuid) -> Result<Vec<ArcProgress>>;
    async fn upsert_arc(&self, player_id: Uuid, arc: &ArcProgress) -> Result<()>;

    /// Append a decision and, when `moral_delta` is set, apply it to the
    /// surgeon-butcher score (clamped) in the same transaction.
    async fn insert_decision(
        &self,
        player_id: Uuid,
        session_id: Option<Uuid>,
        decision: &StoryDecision,
        moral_delta: Option<f64>,
    ) -> Result<()>;

    /// Most recent decisions first.
    async fn fetch_recent_decisions(
        &self,
        player_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StoryDecision>>;

    async fn fetch_relationship(
        &self,
        player_id: Uuid,
        entity_id: &str,
    ) -> Result<Option<EntityRelationship>>;
    async fn fetch_relationships(&self, player_id: Uuid) -> Result<Vec<EntityRelationship>>;
    async fn upsert_relationship(
        &self,
        player_id: Uuid,
        relationship: &EntityRelationship,
    ) -> Result<()>;

    async fn fetch_standing(
        &self,
        player_id: Uuid,
        family: &str,
    ) -> Result<Option<DarkWorldStanding>>;
    async fn fetch_standings(&self, player_id: Uuid) -> Result<Vec<DarkWorldStanding>>;
    async fn upsert_standing(&self, player_id: Uuid, standing: &DarkWorldStanding) -> Result<()>;

    async fn fetch_experiences(&self, player_id: Uuid) -> Result<Vec<Experience>>;
    async fn complete_experience(
        &self,
        player_id: Uuid,
        experience_id: &str,
        completed_at: DateTime<Utc>,
        emotional_impact: &HashMap<String, f64>,
    ) -> Result<()>;

    /// Highest sequence number persisted for the player (0 when none).
    async fn max_sequence_num(&self, player_id: Uuid) -> Result<i64>;

    /// Idempotent append. Returns `false` when `(player_id, sequence_num)`
    /// already exists and the insert was a no-op.
    async fn insert_event(&self, event: &StoredEvent) -> Result<bool>;

    /// Whether an event with this producer-assigned id was already audited.
    async fn has_event(&self, player_id: Uuid, event_id: &str) -> Result<bool>;

    /// Audit-log events for the player newer than `since`, oldest first,
    /// optionally filtered by event type.
    async fn fetch_events_since(
        &self,
        player_id: Uuid,
        since: DateTime<Utc>,
        event_type: Option<&str>,
    ) -> Result<Vec<StoredEvent>>;

    /// Players with at least one audit-log event newer than `since`.
    async fn active_players_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>>;

    async fn insert_drift_alert(&self, player_id: Uuid, report: &DriftReport) -> Result<()>;
    async fn insert_conflict(&self, player_id: Uuid, conflict: &StoryConflict) -> Result<()>;

    /// Connectivity probe for health reporting.
    async fn healthy(&self) -> bool;
}
