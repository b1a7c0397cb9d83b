//! SQLite-backed story repository.

use crate::repo::{PlayerBooks, StoryRepo};
use crate::schemas::{
    ArcProgress, ArcRole, DarkWorldStanding, DriftReport, EntityRelationship, EntityType,
    Experience, ExperienceStatus, ProgressState, StoredEvent, StoryConflict, StoryDecision,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteStoryRepo {
    pool: Pool<Sqlite>,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn json_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

impl SqliteStoryRepo {
    pub async fn connect(url: &str) -> Result<Self> {
        // An in-memory database is per-connection; cap the pool at one so
        // every caller sees the same data.
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");
        let mut options = SqlitePoolOptions::new();
        options = if in_memory {
            options.max_connections(1)
        } else {
            options.min_connections(5).max_connections(20)
        };
        let pool = options
            .connect(url)
            .await
            .context("Failed to connect to story database")?;

        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS story_players (
                player_id TEXT PRIMARY KEY,
                broker_book_state TEXT NOT NULL,
                debt_of_flesh_state TEXT NOT NULL,
                surgeon_butcher_score REAL NOT NULL DEFAULT 0.0,
                updated_at INTEGER NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS story_arc_progress (
                player_id TEXT NOT NULL,
                arc_id TEXT NOT NULL,
                arc_role TEXT NOT NULL,
                progress_state TEXT NOT NULL,
                last_beat_id TEXT,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (player_id, arc_id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS story_decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player_id TEXT NOT NULL,
                session_id TEXT,
                decision_id TEXT NOT NULL,
                arc_id TEXT,
                npc_id TEXT,
                choice_label TEXT NOT NULL,
                outcome_tags TEXT NOT NULL,
                moral_weight REAL NOT NULL,
                timestamp INTEGER NOT NULL
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_decisions_player_ts
                ON story_decisions(player_id, timestamp DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS story_relationships (
                player_id TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                score REAL NOT NULL,
                flags TEXT NOT NULL,
                last_interaction TEXT,
                last_interaction_at INTEGER,
                PRIMARY KEY (player_id, entity_id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS dark_world_standings (
                player_id TEXT NOT NULL,
                family TEXT NOT NULL,
                score REAL NOT NULL DEFAULT 0.0,
                favors_owed INTEGER NOT NULL DEFAULT 0,
                debts_owed INTEGER NOT NULL DEFAULT 0,
                betrayal_count INTEGER NOT NULL DEFAULT 0,
                special_status TEXT NOT NULL DEFAULT '[]',
                last_interaction INTEGER,
                PRIMARY KEY (player_id, family)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS story_experiences (
                player_id TEXT NOT NULL,
                experience_id TEXT NOT NULL,
                status TEXT NOT NULL,
                emotional_impact TEXT NOT NULL DEFAULT '{}',
                cross_references TEXT NOT NULL DEFAULT '[]',
                started_at INTEGER NOT NULL,
                completed_at INTEGER,
                PRIMARY KEY (player_id, experience_id)
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS story_events (
                player_id TEXT NOT NULL,
                session_id TEXT,
                event_id TEXT,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                sequence_num INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (player_id, sequence_num)
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_events_created
                ON story_events(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_player_type
                ON story_events(player_id, event_type, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_player_event_id
                ON story_events(player_id, event_id)",
            r#"
            CREATE TABLE IF NOT EXISTS story_drift_alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player_id TEXT NOT NULL,
                drift_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                drift_score REAL NOT NULL,
                metrics TEXT NOT NULL,
                recommended_correction TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS story_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                player_id TEXT NOT NULL,
                conflict_type TEXT NOT NULL,
                involved_entities TEXT NOT NULL,
                conflicting_facts TEXT NOT NULL,
                severity TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Failed to run story schema migration")?;
        }
        Ok(())
    }
}

#[async_trait]
impl StoryRepo for SqliteStoryRepo {
    async fn fetch_player(&self, player_id: Uuid) -> Result<Option<PlayerBooks>> {
        let row = sqlx::query(
            "SELECT broker_book_state, debt_of_flesh_state, surgeon_butcher_score
             FROM story_players WHERE player_id = ?",
        )
        .bind(player_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch player row")?;

        Ok(row.map(|r| PlayerBooks {
            surgeon_butcher_score: r.get("surgeon_butcher_score"),
            broker_book_state: serde_json::from_str(r.get::<String, _>("broker_book_state").as_str())
                .unwrap_or_else(|_| serde_json::json!({})),
            debt_of_flesh_state: serde_json::from_str(
                r.get::<String, _>("debt_of_flesh_state").as_str(),
            )
            .unwrap_or_else(|_| serde_json::json!({})),
        }))
    }

    async fn init_player(&self, player_id: Uuid, families: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO story_players
                 (player_id, broker_book_state, debt_of_flesh_state, surgeon_butcher_score, updated_at)
             VALUES (?, '{}', '{}', 0.0, ?)
             ON CONFLICT (player_id) DO NOTHING",
        )
        .bind(player_id.to_string())
        .bind(to_millis(Utc::now()))
        .execute(&mut *tx)
        .await
        .context("Failed to initialize player row")?;

        for family in families {
            sqlx::query(
                "INSERT INTO dark_world_standings (player_id, family, score)
                 VALUES (?, ?, 0.0)
                 ON CONFLICT (player_id, family) DO NOTHING",
            )
            .bind(player_id.to_string())
            .bind(family)
            .execute(&mut *tx)
            .await
            .context("Failed to initialize standing row")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_player_books(
        &self,
        player_id: Uuid,
        broker_book_state: &serde_json::Value,
        debt_of_flesh_state: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE story_players
             SET broker_book_state = ?, debt_of_flesh_state = ?, updated_at = ?
             WHERE player_id = ?",
        )
        .bind(broker_book_state.to_string())
        .bind(debt_of_flesh_state.to_string())
        .bind(to_millis(Utc::now()))
        .bind(player_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update player books")?;
        Ok(())
    }

    async fn fetch_arcs(&self, player_id: Uuid) -> Result<Vec<ArcProgress>> {
        let rows = sqlx::query(
            "SELECT arc_id, arc_role, progress_state, last_beat_id, updated_at
             FROM story_arc_progress WHERE player_id = ?
             ORDER BY updated_at DESC, arc_id",
        )
        .bind(player_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch arc progress")?;

        Ok(rows
            .into_iter()
            .map(|r| ArcProgress {
                arc_id: r.get("arc_id"),
                arc_role: ArcRole::parse_str(r.get::<String, _>("arc_role").as_str())
                    .unwrap_or(ArcRole::Ambient),
                progress_state: ProgressState::parse_str(
                    r.get::<String, _>("progress_state").as_str(),
                )
                .unwrap_or(ProgressState::NotStarted),
                last_beat_id: r.get("last_beat_id"),
                updated_at: from_millis(r.get("updated_at")),
            })
            .collect())
    }

    async fn upsert_arc(&self, player_id: Uuid, arc: &ArcProgress) -> Result<()> {
        sqlx::query(
            "INSERT INTO story_arc_progress
                 (player_id, arc_id, arc_role, progress_state, last_beat_id, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (player_id, arc_id) DO UPDATE SET
                 arc_role = excluded.arc_role,
                 progress_state = excluded.progress_state,
                 last_beat_id = excluded.last_beat_id,
                 updated_at = excluded.updated_at",
        )
        .bind(player_id.to_string())
        .bind(&arc.arc_id)
        .bind(arc.arc_role.as_str())
        .bind(arc.progress_state.as_str())
        .bind(&arc.last_beat_id)
        .bind(to_millis(arc.updated_at))
        .execute(&self.pool)
        .await
        .context("Failed to upsert arc progress")?;
        Ok(())
    }

    async fn insert_decision(
        &self,
        player_id: Uuid,
        session_id: Option<Uuid>,
        decision: &StoryDecision,
        moral_delta: Option<f64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO story_decisions
                 (player_id, session_id, decision_id, arc_id, npc_id,
                  choice_label, outcome_tags, moral_weight, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(player_id.to_string())
        .bind(session_id.map(|s| s.to_string()))
        .bind(&decision.decision_id)
        .bind(&decision.arc_id)
        .bind(&decision.npc_id)
        .bind(&decision.choice_label)
        .bind(serde_json::to_string(&decision.outcome_tags)?)
        .bind(decision.moral_weight)
        .bind(to_millis(decision.timestamp))
        .execute(&mut *tx)
        .await
        .context("Failed to insert decision")?;

        if let Some(delta) = moral_delta {
            sqlx::query(
                "UPDATE story_players
                 SET surgeon_butcher_score =
                         MAX(-1.0, MIN(1.0, surgeon_butcher_score + ?)),
                     updated_at = ?
                 WHERE player_id = ?",
            )
            .bind(delta)
            .bind(to_millis(Utc::now()))
            .bind(player_id.to_string())
            .execute(&mut *tx)
            .await
            .context("Failed to apply moral score delta")?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch_recent_decisions(
        &self,
        player_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StoryDecision>> {
        let rows = sqlx::query(
            "SELECT decision_id, arc_id, npc_id, choice_label, outcome_tags,
                    moral_weight, timestamp
             FROM story_decisions WHERE player_id = ?
             ORDER BY timestamp DESC, id DESC
             LIMIT ?",
        )
        .bind(player_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch decisions")?;

        Ok(rows
            .into_iter()
            .map(|r| StoryDecision {
                decision_id: r.get("decision_id"),
                arc_id: r.get("arc_id"),
                npc_id: r.get("npc_id"),
                choice_label: r.get("choice_label"),
                outcome_tags: json_list(r.get("outcome_tags")),
                moral_weight: r.get("moral_weight"),
                timestamp: from_millis(r.get("timestamp")),
            })
            .collect())
    }

    async fn fetch_relationship(
        &self,
        player_id: Uuid,
        entity_id: &str,
    ) -> Result<Option<EntityRelationship>> {
        let row = sqlx::query(
            "SELECT entity_id, entity_type, score, flags, last_interaction, last_interaction_at
             FROM story_relationships WHERE player_id = ? AND entity_id = ?",
        )
        .bind(player_id.to_string())
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch relationship")?;

        Ok(row.map(row_to_relationship))
    }

    async fn fetch_relationships(&self, player_id: Uuid) -> Result<Vec<EntityRelationship>> {
        let rows = sqlx::query(
            "SELECT entity_id, entity_type, score, flags, last_interaction, last_interaction_at
             FROM story_relationships WHERE player_id = ?
             ORDER BY entity_id",
        )
        .bind(player_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch relationships")?;

        Ok(rows.into_iter().map(row_to_relationship).collect())
    }

    async fn upsert_relationship(
        &self,
        player_id: Uuid,
        relationship: &EntityRelationship,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO story_relationships
                 (player_id, entity_id, entity_type, score, flags,
                  last_interaction, last_interaction_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (player_id, entity_id) DO UPDATE SET
                 entity_type = excluded.entity_type,
                 score = excluded.score,
                 flags = excluded.flags,
                 last_interaction = excluded.last_interaction,
                 last_interaction_at = excluded.last_interaction_at",
        )
        .bind(player_id.to_string())
        .bind(&relationship.entity_id)
        .bind(relationship.entity_type.as_str())
        .bind(relationship.score)
        .bind(serde_json::to_string(&relationship.flags)?)
        .bind(&relationship.last_interaction)
        .bind(relationship.last_interaction_at.map(to_millis))
        .execute(&self.pool)
        .await
        .context("Failed to upsert relationship")?;
        Ok(())
    }

    async fn fetch_standing(
        &self,
        player_id: Uuid,
        family: &str,
    ) -> Result<Option<DarkWorldStanding>> {
        let row = sqlx::query(
            "SELECT family, score, favors_owed, debts_owed, betrayal_count,
                    special_status, last_interaction
             FROM dark_world_standings WHERE player_id = ? AND family = ?",
        )
        .bind(player_id.to_string())
        .bind(family)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch standing")?;

        Ok(row.map(row_to_standing))
    }

    async fn fetch_standings(&self, player_id: Uuid) -> Result<Vec<DarkWorldStanding>> {
        let rows = sqlx::query(
            "SELECT family, score, favors_owed, debts_owed, betrayal_count,
                    special_status, last_interaction
             FROM dark_world_standings WHERE player_id = ?
             ORDER BY family",
        )
        .bind(player_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch standings")?;

        Ok(rows.into_iter().map(row_to_standing).collect())
    }

    async fn upsert_standing(&self, player_id: Uuid, standing: &DarkWorldStanding) -> Result<()> {
        sqlx::query(
            "INSERT INTO dark_world_standings
                 (player_id, family, score, favors_owed, debts_owed,
                  betrayal_count, special_status, last_interaction)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (player_id, family) DO UPDATE SET
                 score = excluded.score,
                 favors_owed = excluded.favors_owed,
                 debts_owed = excluded.debts_owed,
                 betrayal_count = excluded.betrayal_count,
                 special_status = excluded.special_status,
                 last_interaction = excluded.last_interaction",
        )
        .bind(player_id.to_string())
        .bind(&standing.family)
        .bind(standing.score)
        .bind(standing.favors_owed)
        .bind(standing.debts_owed)
        .bind(standing.betrayal_count)
        .bind(serde_json::to_string(&standing.special_status)?)
        .bind(standing.last_interaction.map(to_millis))
        .execute(&self.pool)
        .await
        .context("Failed to upsert standing")?;
        Ok(())
    }

    async fn fetch_experiences(&self, player_id: Uuid) -> Result<Vec<Experience>> {
        let rows = sqlx::query(
            "SELECT experience_id, status, emotional_impact, cross_references,
                    started_at, completed_at
             FROM story_experiences WHERE player_id = ?
             ORDER BY started_at DESC, experience_id",
        )
        .bind(player_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch experiences")?;

        Ok(rows
            .into_iter()
            .map(|r| Experience {
                experience_id: r.get("experience_id"),
                status: ExperienceStatus::parse_str(r.get::<String, _>("status").as_str())
                    .unwrap_or(ExperienceStatus::Active),
                emotional_impact: r
                    .get::<Option<String>, _>("emotional_impact")
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                cross_references: json_list(r.get("cross_references")),
                started_at: from_millis(r.get("started_at")),
                completed_at: r.get::<Option<i64>, _>("completed_at").map(from_millis),
            })
            .collect())
    }

    async fn complete_experience(
        &self,
        player_id: Uuid,
        experience_id: &str,
        completed_at: DateTime<Utc>,
        emotional_impact: &HashMap<String, f64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO story_experiences
                 (player_id, experience_id, status, emotional_impact, started_at, completed_at)
             VALUES (?, ?, 'completed', ?, ?, ?)
             ON CONFLICT (player_id, experience_id) DO UPDATE SET
                 status = 'completed',
                 emotional_impact = excluded.emotional_impact,
                 completed_at = excluded.completed_at",
        )
        .bind(player_id.to_string())
        .bind(experience_id)
        .bind(serde_json::to_string(emotional_impact)?)
        .bind(to_millis(completed_at))
        .bind(to_millis(completed_at))
        .execute(&self.pool)
        .await
        .context("Failed to complete experience")?;
        Ok(())
    }

    async fn max_sequence_num(&self, player_id: Uuid) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(sequence_num) FROM story_events WHERE player_id = ?",
        )
        .bind(player_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context("Failed to fetch max sequence number")?;
        Ok(max.unwrap_or(0))
    }

    async fn insert_event(&self, event: &StoredEvent) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO story_events
                 (player_id, session_id, event_id, event_type, event_data, sequence_num, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (player_id, sequence_num) DO NOTHING",
        )
        .bind(event.player_id.to_string())
        .bind(event.session_id.map(|s| s.to_string()))
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(event.event_data.to_string())
        .bind(event.sequence_num)
        .bind(to_millis(event.created_at))
        .execute(&self.pool)
        .await
        .context("Failed to insert event")?;
        Ok(result.rows_affected() > 0)
    }

    async fn has_event(&self, player_id: Uuid, event_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM story_events WHERE player_id = ? AND event_id = ?",
        )
        .bind(player_id.to_string())
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check event identity")?;
        Ok(count > 0)
    }

    async fn fetch_events_since(
        &self,
        player_id: Uuid,
        since: DateTime<Utc>,
        event_type: Option<&str>,
    ) -> Result<Vec<StoredEvent>> {
        let rows = match event_type {
            Some(kind) => {
                sqlx::query(
                    "SELECT player_id, session_id, event_id, event_type, event_data,
                            sequence_num, created_at
                     FROM story_events
                     WHERE player_id = ? AND created_at > ? AND event_type = ?
                     ORDER BY sequence_num",
                )
                .bind(player_id.to_string())
                .bind(to_millis(since))
                .bind(kind)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT player_id, session_id, event_id, event_type, event_data,
                            sequence_num, created_at
                     FROM story_events
                     WHERE player_id = ? AND created_at > ?
                     ORDER BY sequence_num",
                )
                .bind(player_id.to_string())
                .bind(to_millis(since))
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to fetch events")?;

        Ok(rows
            .into_iter()
            .map(|r| StoredEvent {
                player_id,
                session_id: r
                    .get::<Option<String>, _>("session_id")
                    .and_then(|s| Uuid::parse_str(&s).ok()),
                event_id: r.get("event_id"),
                event_type: r.get("event_type"),
                event_data: serde_json::from_str(r.get::<String, _>("event_data").as_str())
                    .unwrap_or(serde_json::Value::Null),
                sequence_num: r.get("sequence_num"),
                created_at: from_millis(r.get("created_at")),
            })
            .collect())
    }

    async fn active_players_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT DISTINCT player_id FROM story_events WHERE created_at > ?",
        )
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch active players")?;

        Ok(rows
            .into_iter()
            .filter_map(|r| Uuid::parse_str(r.get::<String, _>("player_id").as_str()).ok())
            .collect())
    }

    async fn insert_drift_alert(&self, player_id: Uuid, report: &DriftReport) -> Result<()> {
        sqlx::query(
            "INSERT INTO story_drift_alerts
                 (player_id, drift_type, severity, drift_score, metrics,
                  recommended_correction, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(player_id.to_string())
        .bind(report.drift_type.as_str())
        .bind(report.severity.as_str())
        .bind(report.drift_score)
        .bind(serde_json::to_string(report)?)
        .bind(&report.recommended_correction)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to insert drift alert")?;
        Ok(())
    }

    async fn insert_conflict(&self, player_id: Uuid, conflict: &StoryConflict) -> Result<()> {
        sqlx::query(
            "INSERT INTO story_conflicts
                 (player_id, conflict_type, involved_entities, conflicting_facts,
                  severity, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(player_id.to_string())
        .bind(&conflict.conflict_type)
        .bind(serde_json::to_string(&conflict.involved_entities)?)
        .bind(conflict.conflicting_facts.to_string())
        .bind(conflict.severity.as_str())
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await
        .context("Failed to insert conflict")?;
        Ok(())
    }

    async fn healthy(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}

fn row_to_relationship(r: sqlx::sqlite::SqliteRow) -> EntityRelationship {
    EntityRelationship {
        entity_id: r.get("entity_id"),
        entity_type: EntityType::parse_str(r.get::<String, _>("entity_type").as_str())
            .unwrap_or(EntityType::Npc),
        score: r.get("score"),
        flags: json_list(r.get("flags")),
        last_interaction: r.get("last_interaction"),
        last_interaction_at: r.get::<Option<i64>, _>("last_interaction_at").map(from_millis),
    }
}

fn row_to_standing(r: sqlx::sqlite::SqliteRow) -> DarkWorldStanding {
    DarkWorldStanding {
        family: r.get("family"),
        score: r.get("score"),
        favors_owed: r.get("favors_owed"),
        debts_owed: r.get("debts_owed"),
        betrayal_count: r.get("betrayal_count"),
        special_status: json_list(r.get("special_status")),
        last_interaction: r.get::<Option<i64>, _>("last_interaction").map(from_millis),
    }
}
