//! Two-stage training pipeline: supervised step-wise rewards (SRL) followed
//! by outcome-based reinforcement (RLVR), driven against opaque trainers
//! with checkpointing and failure recovery. The training math lives behind
//! the [`Trainer`] trait.

use crate::planner::ExpertTrajectory;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type TrainMetrics = HashMap<String, f64>;

/// Opaque training step: `train_step(batch) → metrics`.
#[async_trait]
pub trait Trainer: Send + Sync {
    fn stage(&self) -> &str;
    async fn train_step(&self, step: u64, batch: &[ExpertTrajectory]) -> Result<TrainMetrics>;
}

// ============================================================================
// Checkpoints
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub job_name: String,
    pub stage: String,
    pub step: u64,
    pub timestamp: String,
    pub metrics: TrainMetrics,
}

/// Filesystem checkpoint store: one directory per checkpoint with a
/// `metadata.json`, listable and latest-resolvable per (job, stage).
pub struct CheckpointManager {
    root: PathBuf,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn stage_dir(&self, job_name: &str, stage: &str) -> PathBuf {
        self.root.join(job_name).join(stage)
    }

    pub fn save(&self, meta: &CheckpointMeta) -> Result<PathBuf> {
        let dir = self
            .stage_dir(&meta.job_name, &meta.stage)
            .join(format!("step-{:08}", meta.step));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create checkpoint dir {}", dir.display()))?;
        let path = dir.join("metadata.json");
        std::fs::write(&path, serde_json::to_vec_pretty(meta)?)
            .with_context(|| format!("Failed to write checkpoint {}", path.display()))?;
        tracing::info!("Checkpoint written: {}", dir.display());
        Ok(dir)
    }

    /// All checkpoint steps for a (job, stage), ascending.
    pub fn list(&self, job_name: &str, stage: &str) -> Result<Vec<u64>> {
        let dir = self.stage_dir(job_name, stage);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut steps = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let name = entry?.file_name();
            if let Some(step) = name
                .to_str()
                .and_then(|n| n.strip_prefix("step-"))
                .and_then(|n| n.parse().ok())
            {
                steps.push(step);
            }
        }
        steps.sort_unstable();
        Ok(steps)
    }

    /// The newest valid checkpoint, skipping any with unreadable metadata.
    pub fn latest(&self, job_name: &str, stage: &str) -> Result<Option<CheckpointMeta>> {
        for step in self.list(job_name, stage)?.into_iter().rev() {
            match self.load(job_name, stage, step) {
                Ok(meta) => return Ok(Some(meta)),
                Err(e) => {
                    tracing::warn!("Skipping corrupt checkpoint at step {}: {}", step, e)
                }
            }
        }
        Ok(None)
    }

    pub fn load(&self, job_name: &str, stage: &str, step: u64) -> Result<CheckpointMeta> {
        let path = self
            .stage_dir(job_name, stage)
            .join(format!("step-{:08}", step))
            .join("metadata.json");
        let bytes = std::fs::read(&path)
            .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt checkpoint metadata {}", path.display()))
    }
}

// ============================================================================
// Failure handling
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network blips, throttling, timeouts.
    Transient,
    /// Capacity and memory pressure.
    Resource,
    /// Corrupt or unparseable batch input.
    Data,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    RetryAfter(Duration),
    ResumeFromCheckpoint,
    Abort,
}

pub struct FailureHandler {
    max_retries: u32,
    retry_base: Duration,
}

impl Default for FailureHandler {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base: Duration::from_secs(5),
        }
    }
}

impl FailureHandler {
    pub fn new(max_retries: u32, retry_base: Duration) -> Self {
        Self {
            max_retries,
            retry_base,
        }
    }

    pub fn classify(&self, error: &anyhow::Error) -> FailureKind {
        let message = format!("{:#}", error).to_lowercase();
        if ["timeout", "connection", "unavailable", "throttl", "rate limit"]
            .iter()
            .any(|needle| message.contains(needle))
        {
            FailureKind::Transient
        } else if ["out of memory", "oom", "resource", "capacity"]
            .iter()
            .any(|needle| message.contains(needle))
        {
            FailureKind::Resource
        } else if ["corrupt", "parse", "schema", "malformed"]
            .iter()
            .any(|needle| message.contains(needle))
        {
            FailureKind::Data
        } else {
            FailureKind::Fatal
        }
    }

    pub fn decide(&self, kind: FailureKind, attempt: u32) -> RecoveryAction {
        match kind {
            FailureKind::Transient if attempt < self.max_retries => {
                RecoveryAction::RetryAfter(self.retry_base * (1 << attempt.min(4)))
            }
            FailureKind::Resource if attempt < self.max_retries => {
                RecoveryAction::ResumeFromCheckpoint
            }
            // A bad batch cannot be retried into goodness.
            FailureKind::Data => RecoveryAction::Abort,
            _ => RecoveryAction::Abort,
        }
    }
}

// ============================================================================
// Pipeline
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: String,
    pub steps_completed: u64,
    pub resumed_from_step: Option<u64>,
    pub checkpoints_written: u32,
    pub final_metrics: TrainMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub job_name: String,
    pub stages: Vec<StageReport>,
}

pub struct TrainingPipeline {
    srl: Box<dyn Trainer>,
    rlvr: Box<dyn Trainer>,
    checkpoints: CheckpointManager,
    failures: FailureHandler,
    checkpoint_every: u64,
}

impl TrainingPipeline {
    pub fn new(
        srl: Box<dyn Trainer>,
        rlvr: Box<dyn Trainer>,
        checkpoints: CheckpointManager,
        failures: FailureHandler,
        checkpoint_every: u64,
    ) -> Self {
        Self {
            srl,
            rlvr,
            checkpoints,
            failures,
            checkpoint_every: checkpoint_every.max(1),
        }
    }

    /// Run stage 1 then stage 2 over the batch. Each stage resumes from its
    /// latest checkpoint when one exists.
    pub async fn run(
        &self,
        job_name: &str,
        batch: &[ExpertTrajectory],
        steps_per_stage: u64,
    ) -> Result<PipelineReport> {
        if batch.is_empty() {
            return Err(anyhow!("Refusing to train on an empty batch"));
        }

        let mut stages = Vec::new();
        for trainer in [&self.srl, &self.rlvr] {
            stages.push(
                self.run_stage(trainer.as_ref(), job_name, batch, steps_per_stage)
                    .await?,
            );
        }
        Ok(PipelineReport {
            job_name: job_name.to_string(),
            stages,
        })
    }

    async fn run_stage(
        &self,
        trainer: &dyn Trainer,
        job_name: &str,
        batch: &[ExpertTrajectory],
        total_steps: u64,
    ) -> Result<StageReport> {
        let stage = trainer.stage().to_string();
        let resumed = self.checkpoints.latest(job_name, &stage)?;
        let start_step = resumed.as_ref().map(|c| c.step + 1).unwrap_or(1);
        if let Some(meta) = &resumed {
            tracing::info!(
                "Resuming {} stage {} from checkpoint step {}",
                job_name,
                stage,
                meta.step
            );
        }

        let mut checkpoints_written = 0;
        let mut last_metrics = TrainMetrics::new();
        let mut step = start_step;

        while step <= total_steps {
            let mut attempt = 0;
            let metrics = loop {
                match trainer.train_step(step, batch).await {
                    Ok(metrics) => break metrics,
                    Err(e) => {
                        let kind = self.failures.classify(&e);
                        tracing::error!(
                            "{} step {} failed ({:?}): {:#}",
                            stage,
                            step,
                            kind,
                            e
                        );
                        match self.failures.decide(kind, attempt) {
                            RecoveryAction::RetryAfter(delay) => {
                                attempt += 1;
                                tokio::time::sleep(delay).await;
                            }
                            RecoveryAction::ResumeFromCheckpoint => {
                                let checkpoint = self
                                    .checkpoints
                                    .latest(job_name, &stage)?
                                    .ok_or_else(|| {
                                        anyhow!("No checkpoint to resume {} from", stage)
                                    })?;
                                tracing::warn!(
                                    "Rewinding {} to checkpoint step {}",
                                    stage,
                                    checkpoint.step
                                );
                                step = checkpoint.step + 1;
                                attempt += 1;
                            }
                            RecoveryAction::Abort => {
                                return Err(e.context(format!(
                                    "{} stage aborted at step {}",
                                    stage, step
                                )));
                            }
                        }
                    }
                }
            };

            last_metrics = metrics.clone();
            if step % self.checkpoint_every == 0 {
                self.checkpoints.save(&CheckpointMeta {
                    job_name: job_name.to_string(),
                    stage: stage.clone(),
                    step,
                    timestamp: Utc::now().to_rfc3339(),
                    metrics,
                })?;
                checkpoints_written += 1;
            }
            step += 1;
        }

        Ok(StageReport {
            stage,
            steps_completed: total_steps.saturating_sub(start_step - 1),
            resumed_from_step: resumed.map(|c| c.step),
            checkpoints_written,
            final_metrics: last_metrics,
        })
    }
}

/// Convenience for wiring checkpoints under a system temp-adjacent root.
pub fn default_checkpoint_root() -> PathBuf {
    Path::new("checkpoints").to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_keys_off_message() {
        let handler = FailureHandler::default();
        assert_eq!(
            handler.classify(&anyhow!("connection reset by peer")),
            FailureKind::Transient
        );
        assert_eq!(
            handler.classify(&anyhow!("CUDA out of memory")),
            FailureKind::Resource
        );
        assert_eq!(
            handler.classify(&anyhow!("failed to parse batch record")),
            FailureKind::Data
        );
        assert_eq!(
            handler.classify(&anyhow!("segfault in kernel")),
            FailureKind::Fatal
        );
    }

    #[test]
    fn decisions_respect_retry_budget() {
        let handler = FailureHandler::new(2, Duration::from_millis(1));
        assert!(matches!(
            handler.decide(FailureKind::Transient, 0),
            RecoveryAction::RetryAfter(_)
        ));
        assert_eq!(
            handler.decide(FailureKind::Transient, 2),
            RecoveryAction::Abort
        );
        assert_eq!(
            handler.decide(FailureKind::Resource, 0),
            RecoveryAction::ResumeFromCheckpoint
        );
        assert_eq!(handler.decide(FailureKind::Data, 0), RecoveryAction::Abort);
    }
}
