//! SQLite-backed vision repository.
//!
//! The queue lease is a single atomic UPDATE against the selected pending
//! row; SQLite serializes writers, so two workers can never claim the same
//! entry.

use crate::repo::{QueueEntry, QueueStatus, SegmentStatus, VisionRepo};
use crate::segment::{Finding, SegmentContext};
use crate::summary::SceneSummary;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use uuid::Uuid;

#[derive(Clone)]
pub struct SqliteVisionRepo {
    pool: Pool<Sqlite>,
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

impl SqliteVisionRepo {
    pub async fn connect(url: &str) -> Result<Self> {
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
            .context("Failed to connect to vision database")?;

        let repo = Self { pool };
        repo.migrate().await?;
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        for ddl in [
            r#"
            CREATE TABLE IF NOT EXISTS vision_segments (
                segment_id TEXT PRIMARY KEY,
                build_id TEXT NOT NULL,
                scene_id TEXT NOT NULL,
                level_name TEXT NOT NULL,
                scene_type TEXT,
                start_timestamp INTEGER NOT NULL,
                end_timestamp INTEGER NOT NULL,
                duration_seconds REAL NOT NULL,
                frame_count INTEGER NOT NULL,
                camera_configs TEXT NOT NULL DEFAULT '[]',
                media_uris TEXT NOT NULL DEFAULT '{}',
                depth_uris TEXT NOT NULL DEFAULT '{}',
                gameplay_events TEXT NOT NULL DEFAULT '[]',
                performance_metrics TEXT NOT NULL DEFAULT '{}',
                metadata TEXT NOT NULL DEFAULT '{}',
                analysis_status TEXT NOT NULL DEFAULT 'pending',
                analysis_error TEXT,
                analyzed_at INTEGER
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS vision_issues (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                segment_id TEXT NOT NULL,
                detector_type TEXT NOT NULL,
                issue_id TEXT NOT NULL,
                issue_type TEXT NOT NULL,
                severity REAL NOT NULL,
                confidence REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                camera_id TEXT,
                screen_coords TEXT,
                world_coords TEXT,
                description TEXT NOT NULL DEFAULT '',
                evidence_refs TEXT NOT NULL DEFAULT '[]',
                metrics TEXT NOT NULL DEFAULT '{}',
                affected_goals TEXT NOT NULL DEFAULT '[]',
                player_impact REAL NOT NULL DEFAULT 0.0
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_issues_segment
                ON vision_issues(segment_id)",
            r#"
            CREATE TABLE IF NOT EXISTS vision_analysis_queue (
                queue_id TEXT PRIMARY KEY,
                segment_id TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 5,
                status TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                last_attempt_at INTEGER,
                completed_at INTEGER
            );
            "#,
            "CREATE INDEX IF NOT EXISTS idx_queue_pending
                ON vision_analysis_queue(status, priority DESC, created_at ASC)",
            r#"
            CREATE TABLE IF NOT EXISTS vision_scene_summaries (
                build_id TEXT NOT NULL,
                scene_id TEXT NOT NULL,
                total_segments INTEGER NOT NULL,
                analyzed_segments INTEGER NOT NULL,
                issue_counts TEXT NOT NULL,
                avg_severities TEXT NOT NULL,
                critical_issues TEXT NOT NULL,
                visual_quality_score REAL NOT NULL,
                horror_atmosphere_score REAL NOT NULL,
                technical_stability_score REAL NOT NULL,
                last_updated INTEGER NOT NULL,
                PRIMARY KEY (build_id, scene_id)
            );
            "#,
        ] {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("Failed to run vision schema migration")?;
        }
        Ok(())
    }
}

#[async_trait]
impl VisionRepo for SqliteVisionRepo {
    async fn insert_segment(&self, segment: &SegmentContext) -> Result<()> {
        sqlx::query(
            "INSERT INTO vision_segments
                 (segment_id, build_id, scene_id, level_name, scene_type,
                  start_timestamp, end_timestamp, duration_seconds, frame_count,
                  camera_configs, media_uris, depth_uris, gameplay_events,
                  performance_metrics, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (segment_id) DO NOTHING",
        )
        .bind(segment.segment_id.to_string())
        .bind(&segment.build_id)
        .bind(&segment.scene_id)
        .bind(&segment.level_name)
        .bind(&segment.scene_type)
        .bind(to_millis(segment.start_timestamp))
        .bind(to_millis(segment.end_timestamp))
        .bind(segment.duration_seconds)
        .bind(segment.frame_count)
        .bind(serde_json::to_string(&segment.camera_configs)?)
        .bind(serde_json::to_string(&segment.media_uris)?)
        .bind(serde_json::to_string(&segment.depth_uris)?)
        .bind(serde_json::to_string(&segment.gameplay_events)?)
        .bind(serde_json::to_string(&segment.performance_metrics)?)
        .bind(segment.metadata.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to insert segment")?;
        Ok(())
    }

    async fn load_segment(&self, segment_id: Uuid) -> Result<Option<SegmentContext>> {
        let row = sqlx::query(
            "SELECT * FROM vision_segments WHERE segment_id = ?",
        )
        .bind(segment_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load segment")?;

        let Some(r) = row else {
            return Ok(None);
        };

        Ok(Some(SegmentContext {
            segment_id,
            build_id: r.get("build_id"),
            scene_id: r.get("scene_id"),
            level_name: r.get("level_name"),
            scene_type: r.get("scene_type"),
            start_timestamp: from_millis(r.get("start_timestamp")),
            end_timestamp: from_millis(r.get("end_timestamp")),
            duration_seconds: r.get("duration_seconds"),
            frame_count: r.get("frame_count"),
            camera_configs: serde_json::from_str(r.get::<String, _>("camera_configs").as_str())
                .unwrap_or_default(),
            media_uris: serde_json::from_str(r.get::<String, _>("media_uris").as_str())
                .unwrap_or_default(),
            depth_uris: serde_json::from_str(r.get::<String, _>("depth_uris").as_str())
                .unwrap_or_default(),
            gameplay_events: serde_json::from_str(r.get::<String, _>("gameplay_events").as_str())
                .unwrap_or_default(),
            performance_metrics: serde_json::from_str(
                r.get::<String, _>("performance_metrics").as_str(),
            )
            .unwrap_or_default(),
            metadata: serde_json::from_str(r.get::<String, _>("metadata").as_str())
                .unwrap_or(serde_json::Value::Null),
        }))
    }

    async fn update_segment_status(
        &self,
        segment_id: Uuid,
        status: SegmentStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let analyzed_at = status.is_terminal().then(|| to_millis(Utc::now()));
        sqlx::query(
            "UPDATE vision_segments
             SET analysis_status = ?, analysis_error = ?, analyzed_at = ?
             WHERE segment_id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(analyzed_at)
        .bind(segment_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update segment status")?;
        Ok(())
    }

    async fn segment_status(&self, segment_id: Uuid) -> Result<Option<SegmentStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT analysis_status FROM vision_segments WHERE segment_id = ?",
        )
        .bind(segment_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch segment status")?;
        Ok(status.as_deref().and_then(SegmentStatus::parse_str))
    }

    async fn enqueue(&self, segment_id: Uuid, priority: i64) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE vision_analysis_queue
             SET priority = MAX(priority, ?)
             WHERE segment_id = ? AND status = 'pending'",
        )
        .bind(priority)
        .bind(segment_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to bump queue priority")?;

        if updated.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO vision_analysis_queue
                     (queue_id, segment_id, priority, status, created_at)
                 VALUES (?, ?, ?, 'pending', ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(segment_id.to_string())
            .bind(priority)
            .bind(to_millis(Utc::now()))
            .execute(&self.pool)
            .await
            .context("Failed to enqueue segment")?;
        }
        Ok(())
    }

    async fn lease_next(&self) -> Result<Option<QueueEntry>> {
        let row = sqlx::query(
            "UPDATE vision_analysis_queue
             SET status = 'processing',
                 attempts = attempts + 1,
                 last_attempt_at = ?
             WHERE queue_id = (
                 SELECT queue_id FROM vision_analysis_queue
                 WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, queue_id ASC
                 LIMIT 1
             ) AND status = 'pending'
             RETURNING queue_id, segment_id, priority, status, attempts,
                       created_at, last_attempt_at, completed_at",
        )
        .bind(to_millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await
        .context("Failed to lease queue entry")?;

        Ok(row.map(|r| QueueEntry {
            queue_id: Uuid::parse_str(r.get::<String, _>("queue_id").as_str())
                .unwrap_or_default(),
            segment_id: Uuid::parse_str(r.get::<String, _>("segment_id").as_str())
                .unwrap_or_default(),
            priority: r.get("priority"),
            status: QueueStatus::parse_str(r.get::<String, _>("status").as_str())
                .unwrap_or(QueueStatus::Processing),
            attempts: r.get("attempts"),
            created_at: from_millis(r.get("created_at")),
            last_attempt_at: r.get::<Option<i64>, _>("last_attempt_at").map(from_millis),
            completed_at: r.get::<Option<i64>, _>("completed_at").map(from_millis),
        }))
    }

    async fn finish_queue_entry(&self, queue_id: Uuid, status: QueueStatus) -> Result<()> {
        let completed_at =
            matches!(status, QueueStatus::Completed).then(|| to_millis(Utc::now()));
        sqlx::query(
            "UPDATE vision_analysis_queue
             SET status = ?, completed_at = ?
             WHERE queue_id = ?",
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(queue_id.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to finish queue entry")?;
        Ok(())
    }

    async fn queue_status(&self, queue_id: Uuid) -> Result<Option<QueueStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            "SELECT status FROM vision_analysis_queue WHERE queue_id = ?",
        )
        .bind(queue_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch queue status")?;
        Ok(status.as_deref().and_then(QueueStatus::parse_str))
    }

    async fn pending_queue_depth(&self) -> Result<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM vision_analysis_queue WHERE status = 'pending'",
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to count pending queue entries")
    }

    async fn insert_finding(&self, segment_id: Uuid, finding: &Finding) -> Result<()> {
        sqlx::query(
            "INSERT INTO vision_issues
                 (segment_id, detector_type, issue_id, issue_type, severity,
                  confidence, timestamp, camera_id, screen_coords, world_coords,
                  description, evidence_refs, metrics, affected_goals, player_impact)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(segment_id.to_string())
        .bind(&finding.detector_type)
        .bind(&finding.issue_id)
        .bind(&finding.issue_type)
        .bind(finding.severity)
        .bind(finding.confidence)
        .bind(to_millis(finding.timestamp))
        .bind(&finding.camera_id)
        .bind(finding.screen_coords.map(|c| serde_json::json!([c.0, c.1]).to_string()))
        .bind(
            finding
                .world_coords
                .map(|c| serde_json::json!([c.0, c.1, c.2]).to_string()),
        )
        .bind(&finding.description)
        .bind(serde_json::to_string(&finding.evidence_refs)?)
        .bind(serde_json::to_string(&finding.metrics)?)
        .bind(serde_json::to_string(&finding.affected_goals)?)
        .bind(finding.player_impact)
        .execute(&self.pool)
        .await
        .context("Failed to insert finding")?;
        Ok(())
    }

    async fn fetch_findings(&self, segment_id: Uuid) -> Result<Vec<Finding>> {
        let rows = sqlx::query(
            "SELECT detector_type, issue_id, issue_type, severity, confidence,
                    timestamp, camera_id, screen_coords, world_coords, description,
                    evidence_refs, metrics, affected_goals, player_impact
             FROM vision_issues WHERE segment_id = ?
             ORDER BY id",
        )
        .bind(segment_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch findings")?;

        Ok(rows
            .into_iter()
            .map(|r| Finding {
                detector_type: r.get("detector_type"),
                issue_id: r.get("issue_id"),
                issue_type: r.get("issue_type"),
                severity: r.get("severity"),
                confidence: r.get("confidence"),
                timestamp: from_millis(r.get("timestamp")),
                camera_id: r.get("camera_id"),
                screen_coords: r
                    .get::<Option<String>, _>("screen_coords")
                    .and_then(|s| serde_json::from_str::<(f64, f64)>(&s).ok()),
                world_coords: r
                    .get::<Option<String>, _>("world_coords")
                    .and_then(|s| serde_json::from_str::<(f64, f64, f64)>(&s).ok()),
                description: r.get("description"),
                evidence_refs: r
                    .get::<Option<String>, _>("evidence_refs")
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                metrics: r
                    .get::<Option<String>, _>("metrics")
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                affected_goals: r
                    .get::<Option<String>, _>("affected_goals")
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or_default(),
                player_impact: r.get("player_impact"),
            })
            .collect())
    }

    async fn upsert_scene_summary(&self, summary: &SceneSummary) -> Result<()> {
        sqlx::query(
            "INSERT INTO vision_scene_summaries
                 (build_id, scene_id, total_segments, analyzed_segments,
                  issue_counts, avg_severities, critical_issues,
                  visual_quality_score, horror_atmosphere_score,
                  technical_stability_score, last_updated)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (build_id, scene_id) DO UPDATE SET
                 total_segments = vision_scene_summaries.total_segments + 1,
                 analyzed_segments = vision_scene_summaries.analyzed_segments + 1,
                 issue_counts = excluded.issue_counts,
                 avg_severities = excluded.avg_severities,
                 critical_issues = excluded.critical_issues,
                 visual_quality_score = excluded.visual_quality_score,
                 horror_atmosphere_score = excluded.horror_atmosphere_score,
                 technical_stability_score = excluded.technical_stability_score,
                 last_updated = excluded.last_updated",
        )
        .bind(&summary.build_id)
        .bind(&summary.scene_id)
        .bind(summary.total_segments)
        .bind(summary.analyzed_segments)
        .bind(serde_json::to_string(&summary.issue_counts)?)
        .bind(serde_json::to_string(&summary.avg_severities)?)
        .bind(serde_json::to_string(&summary.critical_issues)?)
        .bind(summary.visual_quality_score)
        .bind(summary.horror_atmosphere_score)
        .bind(summary.technical_stability_score)
        .bind(to_millis(summary.last_updated))
        .execute(&self.pool)
        .await
        .context("Failed to upsert scene summary")?;
        Ok(())
    }

    async fn fetch_scene_summary(
        &self,
        build_id: &str,
        scene_id: &str,
    ) -> Result<Option<SceneSummary>> {
        let row = sqlx::query(
            "SELECT * FROM vision_scene_summaries WHERE build_id = ? AND scene_id = ?",
        )
        .bind(build_id)
        .bind(scene_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch scene summary")?;

        Ok(row.map(|r| SceneSummary {
            build_id: r.get("build_id"),
            scene_id: r.get("scene_id"),
            total_segments: r.get("total_segments"),
            analyzed_segments: r.get("analyzed_segments"),
            issue_counts: serde_json::from_str(r.get::<String, _>("issue_counts").as_str())
                .unwrap_or_default(),
            avg_severities: serde_json::from_str(r.get::<String, _>("avg_severities").as_str())
                .unwrap_or_default(),
            critical_issues: serde_json::from_str(r.get::<String, _>("critical_issues").as_str())
                .unwrap_or_default(),
            visual_quality_score: r.get("visual_quality_score"),
            horror_atmosphere_score: r.get("horror_atmosphere_score"),
            technical_stability_score: r.get("technical_stability_score"),
            last_updated: from_millis(r.get("last_updated")),
        }))
    }

    async fn healthy(&self) -> bool {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
