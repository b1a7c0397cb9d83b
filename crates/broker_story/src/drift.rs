//! Drift & Conflict Detector - watches player stories for divergence from
//! the canonical theme and for narrative inconsistencies.
//!
//! Three drift analyzers run in a fixed order (time allocation, quest
//! allocation, theme consistency); any one triggering produces a report.
//! A per-player suppression window keeps on-demand checks from re-running
//! within the periodic interval unless forced.

use crate::repo::StoryRepo;
use crate::schemas::{
    ConflictSeverity, DriftReport, DriftSeverity, DriftType, ProgressState, StoryConflict,
    CANONICAL_REMINDER,
};
use anyhow::Result;
use async_trait::async_trait;
use broker_bus::Bus;
use broker_core::config::DriftConfig;
use broker_core::subjects;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Interactions with an entity flagged dead within this window conflict.
const DEAD_NPC_GRACE_MINUTES: i64 = 10;
/// Faction standings and relationship scores disagreeing by sign beyond this
/// magnitude are contradictory.
const FACTION_CONTRADICTION_MIN: f64 = 25.0;

/// Theme-consistency contract: score recent content identifiers against the
/// canonical theme, in [0, 1].
#[async_trait]
pub trait ThemeScorer: Send + Sync {
    async fn score(&self, player_id: Uuid, content_ids: &[String]) -> Result<f64>;
}

/// Stub scorer: treats all content as on-theme, so the theme analyzer never
/// triggers. Swap in an embedding-based scorer to activate the third axis.
pub struct AlwaysOnTheme;

#[async_trait]
impl ThemeScorer for AlwaysOnTheme {
    async fn score(&self, _player_id: Uuid, _content_ids: &[String]) -> Result<f64> {
        Ok(1.0)
    }
}

pub struct DriftDetector {
    repo: Arc<dyn StoryRepo>,
    bus: Arc<dyn Bus>,
    config: DriftConfig,
    theme: Arc<dyn ThemeScorer>,
    analysis_cache: Mutex<HashMap<Uuid, Instant>>,
}

impl DriftDetector {
    pub fn new(
        repo: Arc<dyn StoryRepo>,
        bus: Arc<dyn Bus>,
        config: DriftConfig,
        theme: Arc<dyn ThemeScorer>,
    ) -> Self {
        Self {
            repo,
            bus,
            config,
            theme,
            analysis_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Periodic sweep over every player active in the configured window.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.analysis_interval_minutes * 60);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("Drift detector started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::error!("Periodic drift sweep failed: {:#}", e);
                    }
                }
            }
        }
        tracing::info!("Drift detector stopped");
    }

    async fn sweep(&self) -> Result<()> {
        let since = Utc::now() - ChronoDuration::hours(self.config.active_window_hours);
        let players = self.repo.active_players_since(since).await?;
        tracing::debug!("Drift sweep over {} active players", players.len());

        for player_id in players {
            if let Err(e) = self.check_drift(player_id, 3, false).await {
                tracing::error!("Drift check failed for {}: {:#}", player_id, e);
            }
            if let Err(e) = self.check_conflicts(player_id).await {
                tracing::error!("Conflict check failed for {}: {:#}", player_id, e);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Drift
    // ========================================================================

    /// Analyze recent gameplay for drift. Returns `None` when nothing
    /// triggered or the suppression window is still open.
    pub async fn check_drift(
        &self,
        player_id: Uuid,
        window_hours: i64,
        force: bool,
    ) -> Result<Option<DriftReport>> {
        if !force && self.recently_checked(player_id) {
            return Ok(None);
        }
        tracing::info!(
            "Analyzing drift for {} (last {} hours)",
            player_id,
            window_hours
        );

        let time_drift = self.check_time_allocation(player_id, window_hours).await?;
        let quest_drift = self.check_quest_allocation(player_id, window_hours).await?;
        let theme_drift = self.check_theme_consistency(player_id, window_hours).await?;

        let mut scores = Vec::new();
        let mut severities = Vec::new();
        let mut drift_type = None;

        if let Some((_, score, severity)) = &time_drift {
            scores.push(*score);
            severities.push(*severity);
            drift_type.get_or_insert(DriftType::TimeAllocation);
        }
        if let Some((_, score, severity)) = &quest_drift {
            scores.push(*score);
            severities.push(*severity);
            drift_type.get_or_insert(DriftType::QuestAllocation);
        }
        if let Some((_, score, severity)) = &theme_drift {
            scores.push(*score);
            severities.push(*severity);
            drift_type.get_or_insert(DriftType::ThemeConsistency);
        }

        self.mark_checked(player_id);
        let Some(drift_type) = drift_type else {
            return Ok(None);
        };

        let severity = severities.into_iter().max().unwrap_or(DriftSeverity::Minor);
        let drift_score = scores.iter().cloned().fold(0.0_f64, f64::max);

        let mut report = DriftReport {
            drift_type,
            severity,
            drift_score,
            time_allocation: time_drift.map(|(dist, _, _)| dist),
            quest_allocation: quest_drift.map(|(dist, _, _)| dist),
            theme_consistency: theme_drift.map(|(score, _, _)| score),
            recommended_correction: String::new(),
            canonical_reminder: CANONICAL_REMINDER.to_string(),
        };
        report.recommended_correction = self.generate_correction(&report);

        self.repo.insert_drift_alert(player_id, &report).await?;
        self.publish_drift(player_id, &report).await;
        Ok(Some(report))
    }

    fn recently_checked(&self, player_id: Uuid) -> bool {
        let window = Duration::from_secs(self.config.analysis_interval_minutes * 60);
        self.analysis_cache
            .lock()
            .unwrap()
            .get(&player_id)
            .map(|at| at.elapsed() < window)
            .unwrap_or(false)
    }

    fn mark_checked(&self, player_id: Uuid) {
        self.analysis_cache
            .lock()
            .unwrap()
            .insert(player_id, Instant::now());
    }

    /// Activity distribution over the window; triggers when the combined
    /// share of off-theme activities exceeds the threshold.
    async fn check_time_allocation(
        &self,
        player_id: Uuid,
        window_hours: i64,
    ) -> Result<Option<(HashMap<String, f64>, f64, DriftSeverity)>> {
        let since = Utc::now() - ChronoDuration::hours(window_hours);
        let events = self
            .repo
            .fetch_events_since(player_id, since, Some("activity_logged"))
            .await?;
        if events.is_empty() {
            return Ok(None);
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for event in &events {
            let activity = event
                .event_data
                .get("activity_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            *counts.entry(activity).or_insert(0) += 1;
        }
        let total = events.len() as f64;
        let distribution: HashMap<String, f64> = counts
            .into_iter()
            .map(|(activity, count)| (activity, count as f64 / total))
            .collect();

        let off_theme_ratio: f64 = distribution
            .iter()
            .filter(|(activity, _)| self.config.off_theme_activities.contains(activity))
            .map(|(_, ratio)| ratio)
            .sum();

        if off_theme_ratio > self.config.off_theme_threshold {
            let severity = severity_from_ratio(off_theme_ratio / self.config.off_theme_threshold);
            Ok(Some((distribution, off_theme_ratio, severity)))
        } else {
            Ok(None)
        }
    }

    /// Quest-type distribution over the window; the tangential share is the
    /// signal.
    async fn check_quest_allocation(
        &self,
        player_id: Uuid,
        window_hours: i64,
    ) -> Result<Option<(HashMap<String, f64>, f64, DriftSeverity)>> {
        let since = Utc::now() - ChronoDuration::hours(window_hours);
        let events = self
            .repo
            .fetch_events_since(player_id, since, Some("quest.completed"))
            .await?;
        if events.is_empty() {
            return Ok(None);
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for event in &events {
            let quest_type = event
                .event_data
                .get("quest_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            *counts.entry(quest_type).or_insert(0) += 1;
        }
        let total = events.len() as f64;
        let distribution: HashMap<String, f64> = counts
            .into_iter()
            .map(|(quest_type, count)| (quest_type, count as f64 / total))
            .collect();

        let tangential_ratio = distribution.get("tangential").copied().unwrap_or(0.0);
        if tangential_ratio > self.config.tangential_threshold {
            let severity =
                severity_from_ratio(tangential_ratio / self.config.tangential_threshold);
            Ok(Some((distribution, tangential_ratio, severity)))
        } else {
            Ok(None)
        }
    }

    /// Theme consistency over the window's content identifiers; triggers
    /// below the configured minimum. The signal is the shortfall (1 - score).
    async fn check_theme_consistency(
        &self,
        player_id: Uuid,
        window_hours: i64,
    ) -> Result<Option<(f64, f64, DriftSeverity)>> {
        let since = Utc::now() - ChronoDuration::hours(window_hours);
        let events = self.repo.fetch_events_since(player_id, since, None).await?;
        let content_ids: Vec<String> = events
            .iter()
            .filter_map(|e| e.event_data.get("content_id").and_then(|v| v.as_str()))
            .map(String::from)
            .collect();
        if content_ids.is_empty() {
            return Ok(None);
        }

        let score = self.theme.score(player_id, &content_ids).await?;
        if score < self.config.theme_consistency_min {
            let severity =
                severity_from_ratio(self.config.theme_consistency_min / score.max(0.01));
            Ok(Some((score, 1.0 - score, severity)))
        } else {
            Ok(None)
        }
    }

    fn generate_correction(&self, report: &DriftReport) -> String {
        let mut corrections: Vec<String> = Vec::new();

        if let Some(quest) = &report.quest_allocation {
            if quest.get("tangential").copied().unwrap_or(0.0) > self.config.tangential_threshold {
                corrections.push(
                    "Increase main story quest opportunities. \
                     Reduce tangential quest generation."
                        .to_string(),
                );
            }
        }

        if let Some(time) = &report.time_allocation {
            let mut off_theme: Vec<&str> = self
                .config
                .off_theme_activities
                .iter()
                .filter(|activity| time.get(*activity).copied().unwrap_or(0.0) > 0.1)
                .map(|s| s.as_str())
                .collect();
            off_theme.sort_unstable();
            if !off_theme.is_empty() {
                corrections.push(format!(
                    "Reduce {} content. Steer back to body brokering core loop.",
                    off_theme.join(", ")
                ));
            }
        }

        if report.severity == DriftSeverity::Major {
            corrections
                .push("Consider hard constraints on off-theme content generation.".to_string());
        }

        if corrections.is_empty() {
            "Soft steering recommended.".to_string()
        } else {
            corrections.join(" ")
        }
    }

    async fn publish_drift(&self, player_id: Uuid, report: &DriftReport) {
        let payload = serde_json::json!({
            "player_id": player_id.to_string(),
            "drift_type": report.drift_type,
            "severity": report.severity,
            "drift_score": report.drift_score,
            "metrics": report,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(subjects::STORY_DRIFT, bytes).await {
                    tracing::warn!("Failed to publish drift alert: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize drift alert: {}", e),
        }
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    /// Run the three conflict rule families; every hit is persisted and
    /// published.
    pub async fn check_conflicts(&self, player_id: Uuid) -> Result<Vec<StoryConflict>> {
        let mut conflicts = Vec::new();
        conflicts.extend(self.npc_state_conflicts(player_id).await?);
        conflicts.extend(self.quest_logic_conflicts(player_id).await?);
        conflicts.extend(self.faction_conflicts(player_id).await?);

        for conflict in &conflicts {
            self.repo.insert_conflict(player_id, conflict).await?;
            self.publish_conflict(player_id, conflict).await;
            tracing::warn!(
                "Story conflict {} for {}",
                conflict.conflict_type,
                player_id
            );
        }
        Ok(conflicts)
    }

    /// Entities flagged dead that the player interacted with inside the
    /// grace window.
    async fn npc_state_conflicts(&self, player_id: Uuid) -> Result<Vec<StoryConflict>> {
        let cutoff = Utc::now() - ChronoDuration::minutes(DEAD_NPC_GRACE_MINUTES);
        let relationships = self.repo.fetch_relationships(player_id).await?;

        Ok(relationships
            .into_iter()
            .filter(|rel| {
                rel.flags.iter().any(|f| f == "dead")
                    && rel.last_interaction_at.map(|at| at > cutoff).unwrap_or(false)
            })
            .map(|rel| StoryConflict {
                conflict_type: "dead_npc_interaction".to_string(),
                involved_entities: vec![rel.entity_id.clone()],
                conflicting_facts: serde_json::json!({
                    "flagged_dead": true,
                    "last_interaction": rel.last_interaction,
                    "last_interaction_at": rel.last_interaction_at,
                }),
                severity: ConflictSeverity::Critical,
            })
            .collect())
    }

    /// Arcs marked completed whose last beat still reads as introductory.
    async fn quest_logic_conflicts(&self, player_id: Uuid) -> Result<Vec<StoryConflict>> {
        let arcs = self.repo.fetch_arcs(player_id).await?;

        Ok(arcs
            .into_iter()
            .filter(|arc| {
                arc.progress_state == ProgressState::Completed
                    && arc
                        .last_beat_id
                        .as_deref()
                        .map(|beat| {
                            let lower = beat.to_lowercase();
                            lower.contains("intro") || lower.contains("start")
                        })
                        .unwrap_or(false)
            })
            .map(|arc| StoryConflict {
                conflict_type: "quest_state_mismatch".to_string(),
                involved_entities: vec![arc.arc_id.clone()],
                conflicting_facts: serde_json::json!({
                    "progress_state": arc.progress_state,
                    "last_beat_id": arc.last_beat_id,
                }),
                severity: ConflictSeverity::High,
            })
            .collect())
    }

    /// Faction relationships whose score sign contradicts the dark-world
    /// standing for the same family.
    async fn faction_conflicts(&self, player_id: Uuid) -> Result<Vec<StoryConflict>> {
        let relationships = self.repo.fetch_relationships(player_id).await?;
        let standings = self.repo.fetch_standings(player_id).await?;
        let standing_scores: HashMap<&str, f64> = standings
            .iter()
            .map(|s| (s.family.as_str(), s.score))
            .collect();

        Ok(relationships
            .iter()
            .filter(|rel| rel.entity_type == crate::schemas::EntityType::Faction)
            .filter_map(|rel| {
                let standing = standing_scores.get(rel.entity_id.as_str())?;
                let contradictory = rel.score.abs() > FACTION_CONTRADICTION_MIN
                    && standing.abs() > FACTION_CONTRADICTION_MIN
                    && (rel.score > 0.0) != (*standing > 0.0);
                contradictory.then(|| StoryConflict {
                    conflict_type: "faction_contradiction".to_string(),
                    involved_entities: vec![rel.entity_id.clone()],
                    conflicting_facts: serde_json::json!({
                        "relationship_score": rel.score,
                        "standing_score": standing,
                    }),
                    severity: ConflictSeverity::Medium,
                })
            })
            .collect())
    }

    async fn publish_conflict(&self, player_id: Uuid, conflict: &StoryConflict) {
        let payload = serde_json::json!({
            "player_id": player_id.to_string(),
            "conflict": conflict,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_vec(&payload) {
            Ok(bytes) => {
                if let Err(e) = self.bus.publish(subjects::STORY_CONFLICT_ALERT, bytes).await {
                    tracing::warn!("Failed to publish conflict alert: {}", e);
                }
            }
            Err(e) => tracing::error!("Failed to serialize conflict alert: {}", e),
        }
    }
}

/// Severity scales with how far past its threshold a signal landed.
fn severity_from_ratio(ratio: f64) -> DriftSeverity {
    if ratio < 1.5 {
        DriftSeverity::Minor
    } else if ratio < 2.0 {
        DriftSeverity::Moderate
    } else {
        DriftSeverity::Major
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(severity_from_ratio(1.0), DriftSeverity::Minor);
        assert_eq!(severity_from_ratio(1.49), DriftSeverity::Minor);
        assert_eq!(severity_from_ratio(1.5), DriftSeverity::Moderate);
        assert_eq!(severity_from_ratio(1.99), DriftSeverity::Moderate);
        assert_eq!(severity_from_ratio(2.0), DriftSeverity::Major);
        assert_eq!(severity_from_ratio(4.0), DriftSeverity::Major);
    }
}
