//! Two-stage pipeline: checkpoint cadence, resume, and failure recovery.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use broker_collab::{
    CheckpointManager, ExpertTrajectory, FailureHandler, Trainer, TrainingPipeline, TrajectoryStep,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn batch() -> Vec<ExpertTrajectory> {
    vec![ExpertTrajectory {
        problem: "p".to_string(),
        steps: vec![
            TrajectoryStep {
                action: "a".to_string(),
                reasoning: "r".to_string(),
                reward: 0.5,
            },
            TrajectoryStep {
                action: "b".to_string(),
                reasoning: "r".to_string(),
                reward: 0.5,
            },
        ],
        expected_outcome: "done".to_string(),
        metadata: serde_json::json!({}),
    }]
}

/// Trainer that fails with the scripted error on the scripted calls.
struct FlakyTrainer {
    stage: &'static str,
    calls: Arc<AtomicU32>,
    fail_on_calls: Vec<u32>,
    error: &'static str,
}

impl FlakyTrainer {
    fn steady(stage: &'static str, calls: Arc<AtomicU32>) -> Self {
        Self {
            stage,
            calls,
            fail_on_calls: vec![],
            error: "",
        }
    }
}

#[async_trait]
impl Trainer for FlakyTrainer {
    fn stage(&self) -> &str {
        self.stage
    }

    async fn train_step(&self, step: u64, _batch: &[ExpertTrajectory]) -> Result<HashMap<String, f64>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_calls.contains(&call) {
            return Err(anyhow!("{}", self.error));
        }
        let mut metrics = HashMap::new();
        metrics.insert("loss".to_string(), 1.0 / step as f64);
        Ok(metrics)
    }
}

fn pipeline(
    srl: FlakyTrainer,
    rlvr: FlakyTrainer,
    root: &std::path::Path,
    checkpoint_every: u64,
) -> TrainingPipeline {
    TrainingPipeline::new(
        Box::new(srl),
        Box::new(rlvr),
        CheckpointManager::new(root),
        FailureHandler::new(3, Duration::from_millis(1)),
        checkpoint_every,
    )
}

#[tokio::test]
async fn both_stages_run_and_checkpoint_on_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let srl_calls = Arc::new(AtomicU32::new(0));
    let rlvr_calls = Arc::new(AtomicU32::new(0));
    let pipeline = pipeline(
        FlakyTrainer::steady("srl", srl_calls.clone()),
        FlakyTrainer::steady("rlvr", rlvr_calls.clone()),
        dir.path(),
        2,
    );

    let report = pipeline.run("job-1", &batch(), 5).await.unwrap();

    assert_eq!(report.stages.len(), 2);
    assert_eq!(report.stages[0].stage, "srl");
    assert_eq!(report.stages[1].stage, "rlvr");
    for stage in &report.stages {
        assert_eq!(stage.steps_completed, 5);
        // Steps 2 and 4.
        assert_eq!(stage.checkpoints_written, 2);
        assert!(stage.resumed_from_step.is_none());
        assert!(stage.final_metrics.contains_key("loss"));
    }
    assert_eq!(srl_calls.load(Ordering::SeqCst), 5);
    assert_eq!(rlvr_calls.load(Ordering::SeqCst), 5);

    let manager = CheckpointManager::new(dir.path());
    assert_eq!(manager.list("job-1", "srl").unwrap(), vec![2, 4]);
    assert_eq!(manager.latest("job-1", "rlvr").unwrap().unwrap().step, 4);
}

#[tokio::test]
async fn second_run_resumes_from_latest_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let first = pipeline(
        FlakyTrainer::steady("srl", Arc::new(AtomicU32::new(0))),
        FlakyTrainer::steady("rlvr", Arc::new(AtomicU32::new(0))),
        dir.path(),
        2,
    );
    first.run("job-2", &batch(), 4).await.unwrap();

    // Extend to 6 steps; each stage picks up after its step-4 checkpoint.
    let srl_calls = Arc::new(AtomicU32::new(0));
    let second = pipeline(
        FlakyTrainer::steady("srl", srl_calls.clone()),
        FlakyTrainer::steady("rlvr", Arc::new(AtomicU32::new(0))),
        dir.path(),
        2,
    );
    let report = second.run("job-2", &batch(), 6).await.unwrap();

    assert_eq!(report.stages[0].resumed_from_step, Some(4));
    assert_eq!(report.stages[0].steps_completed, 2);
    assert_eq!(srl_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn transient_failures_retry_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let srl = FlakyTrainer {
        stage: "srl",
        calls: calls.clone(),
        fail_on_calls: vec![2, 3],
        error: "connection reset while pushing gradients",
    };
    let pipeline = pipeline(
        srl,
        FlakyTrainer::steady("rlvr", Arc::new(AtomicU32::new(0))),
        dir.path(),
        10,
    );

    let report = pipeline.run("job-3", &batch(), 3).await.unwrap();
    assert_eq!(report.stages[0].steps_completed, 3);
    // Three productive steps plus two retried failures.
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn data_failures_abort_the_stage() {
    let dir = tempfile::tempdir().unwrap();
    let srl = FlakyTrainer {
        stage: "srl",
        calls: Arc::new(AtomicU32::new(0)),
        fail_on_calls: vec![2],
        error: "malformed trajectory in batch",
    };
    let pipeline = pipeline(
        srl,
        FlakyTrainer::steady("rlvr", Arc::new(AtomicU32::new(0))),
        dir.path(),
        10,
    );

    let err = pipeline.run("job-4", &batch(), 3).await.unwrap_err();
    assert!(err.to_string().contains("aborted"));
}

#[tokio::test]
async fn resource_failure_resumes_from_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let calls = Arc::new(AtomicU32::new(0));
    let srl = FlakyTrainer {
        stage: "srl",
        calls: calls.clone(),
        // Step 3 hits an OOM once; the stage rewinds to the step-2
        // checkpoint and replays.
        fail_on_calls: vec![3],
        error: "CUDA out of memory",
    };
    let pipeline = pipeline(
        srl,
        FlakyTrainer::steady("rlvr", Arc::new(AtomicU32::new(0))),
        dir.path(),
        2,
    );

    let report = pipeline.run("job-5", &batch(), 4).await.unwrap();
    assert_eq!(report.stages[0].steps_completed, 4);
    // 4 productive calls + 1 failed call.
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn empty_batch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(
        FlakyTrainer::steady("srl", Arc::new(AtomicU32::new(0))),
        FlakyTrainer::steady("rlvr", Arc::new(AtomicU32::new(0))),
        dir.path(),
        2,
    );
    assert!(pipeline.run("job-6", &[], 3).await.is_err());
}

#[test]
fn corrupt_checkpoints_are_skipped_by_latest() {
    let dir = tempfile::tempdir().unwrap();
    let manager = CheckpointManager::new(dir.path());

    manager
        .save(&broker_collab::pipeline::CheckpointMeta {
            job_name: "job-7".to_string(),
            stage: "srl".to_string(),
            step: 2,
            timestamp: "2026-01-01T00:00:00Z".to_string(),
            metrics: HashMap::new(),
        })
        .unwrap();

    // A later checkpoint with mangled metadata.
    let bad_dir = dir.path().join("job-7/srl/step-00000004");
    std::fs::create_dir_all(&bad_dir).unwrap();
    std::fs::write(bad_dir.join("metadata.json"), b"{not json").unwrap();

    let latest = manager.latest("job-7", "srl").unwrap().unwrap();
    assert_eq!(latest.step, 2);
}
