//! Story Memory entity types and wire schemas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArcRole {
    MainArc,
    SideArc,
    Experience,
    Ambient,
}

impl ArcRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MainArc => "main_arc",
            Self::SideArc => "side_arc",
            Self::Experience => "experience",
            Self::Ambient => "ambient",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "main_arc" => Some(Self::MainArc),
            "side_arc" => Some(Self::SideArc),
            "experience" => Some(Self::Experience),
            "ambient" => Some(Self::Ambient),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressState {
    NotStarted,
    Early,
    Mid,
    Late,
    Completed,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Early => "early",
            Self::Mid => "mid",
            Self::Late => "late",
            Self::Completed => "completed",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "not_started" => Some(Self::NotStarted),
            "early" => Some(Self::Early),
            "mid" => Some(Self::Mid),
            "late" => Some(Self::Late),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Npc,
    Faction,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Npc => "npc",
            Self::Faction => "faction",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "npc" => Some(Self::Npc),
            "faction" => Some(Self::Faction),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceStatus {
    Active,
    Completed,
    Failed,
    Abandoned,
}

impl ExperienceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    TimeAllocation,
    QuestAllocation,
    ThemeConsistency,
}

impl DriftType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimeAllocation => "time_allocation",
            Self::QuestAllocation => "quest_allocation",
            Self::ThemeConsistency => "theme_consistency",
        }
    }
}

/// Ordered minor < moderate < major so overall severity is a plain max.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftSeverity {
    Minor,
    Moderate,
    Major,
}

impl DriftSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minor => "minor",
            Self::Moderate => "moderate",
            Self::Major => "major",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// ============================================================================
// Entities
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArcProgress {
    pub arc_id: String,
    pub arc_role: ArcRole,
    pub progress_state: ProgressState,
    pub last_beat_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoryDecision {
    pub decision_id: String,
    pub arc_id: Option<String>,
    pub npc_id: Option<String>,
    pub choice_label: String,
    #[serde(default)]
    pub outcome_tags: Vec<String>,
    #[serde(default)]
    pub moral_weight: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub entity_id: String,
    pub entity_type: EntityType,
    /// Clamped to [-100, 100] on every mutation.
    pub score: f64,
    #[serde(default)]
    pub flags: Vec<String>,
    pub last_interaction: Option<String>,
    /// Non-null iff `last_interaction` is non-null.
    pub last_interaction_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarkWorldStanding {
    pub family: String,
    /// Clamped to [-100, 100].
    pub score: f64,
    pub favors_owed: i64,
    pub debts_owed: i64,
    pub betrayal_count: i64,
    #[serde(default)]
    pub special_status: Vec<String>,
    pub last_interaction: Option<DateTime<Utc>>,
}

impl DarkWorldStanding {
    /// Neutral standing a fresh player starts with.
    pub fn neutral(family: &str) -> Self {
        Self {
            family: family.to_string(),
            score: 0.0,
            favors_owed: 0,
            debts_owed: 0,
            betrayal_count: 0,
            special_status: Vec::new(),
            last_interaction: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experience {
    pub experience_id: String,
    pub status: ExperienceStatus,
    #[serde(default)]
    pub emotional_impact: HashMap<String, f64>,
    #[serde(default)]
    pub cross_references: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row in the append-only per-player audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub player_id: Uuid,
    pub session_id: Option<Uuid>,
    /// Producer-assigned identity, used to drop replayed deliveries.
    pub event_id: Option<String>,
    pub event_type: String,
    pub event_data: serde_json::Value,
    /// Strictly increasing per player, assigned at persistence time.
    pub sequence_num: i64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Snapshot
// ============================================================================

/// Full derived story state for one player. Never persisted except as a
/// cache entry; serialization must be deterministic so repeated reads of the
/// same state compare byte-for-byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySnapshot {
    pub player_id: Uuid,
    pub surgeon_butcher_score: f64,
    pub broker_book_state: serde_json::Value,
    pub debt_of_flesh_state: serde_json::Value,
    pub arc_progress: Vec<ArcProgress>,
    /// The 20 most recent decisions, newest first.
    pub recent_decisions: Vec<StoryDecision>,
    pub relationships: Vec<EntityRelationship>,
    pub active_experiences: Vec<Experience>,
    pub completed_experiences: Vec<Experience>,
    pub dark_world_standings: Vec<DarkWorldStanding>,
}

// ============================================================================
// Drift & conflict reports
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftReport {
    pub drift_type: DriftType,
    pub severity: DriftSeverity,
    pub drift_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_allocation: Option<HashMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quest_allocation: Option<HashMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theme_consistency: Option<f64>,
    pub recommended_correction: String,
    pub canonical_reminder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoryConflict {
    pub conflict_type: String,
    pub involved_entities: Vec<String>,
    pub conflicting_facts: serde_json::Value,
    pub severity: ConflictSeverity,
}

/// The fixed reminder attached to every drift report.
pub const CANONICAL_REMINDER: &str = "Core game loop: Kill → Harvest → Negotiate → Get Drugs → \
     Build Empire. Dark fantasy body brokering, not side activities.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_orders_for_max() {
        assert!(DriftSeverity::Major > DriftSeverity::Moderate);
        assert!(DriftSeverity::Moderate > DriftSeverity::Minor);
        let worst = [DriftSeverity::Minor, DriftSeverity::Major, DriftSeverity::Moderate]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(worst, DriftSeverity::Major);
    }

    #[test]
    fn enums_round_trip_through_str() {
        for role in [
            ArcRole::MainArc,
            ArcRole::SideArc,
            ArcRole::Experience,
            ArcRole::Ambient,
        ] {
            assert_eq!(ArcRole::parse_str(role.as_str()), Some(role));
        }
        for state in [
            ProgressState::NotStarted,
            ProgressState::Early,
            ProgressState::Mid,
            ProgressState::Late,
            ProgressState::Completed,
        ] {
            assert_eq!(ProgressState::parse_str(state.as_str()), Some(state));
        }
        assert_eq!(ArcRole::parse_str("villain_arc"), None);
    }

    #[test]
    fn snapshot_serialization_is_deterministic() {
        let snapshot = StorySnapshot {
            player_id: Uuid::nil(),
            surgeon_butcher_score: 0.25,
            broker_book_state: serde_json::json!({}),
            debt_of_flesh_state: serde_json::json!({"death_count": 2}),
            arc_progress: vec![],
            recent_decisions: vec![],
            relationships: vec![],
            active_experiences: vec![],
            completed_experiences: vec![],
            dark_world_standings: vec![DarkWorldStanding::neutral("carrion_kin")],
        };
        let a = serde_json::to_vec(&snapshot).unwrap();
        let b = serde_json::to_vec(&snapshot).unwrap();
        assert_eq!(a, b);
    }
}
