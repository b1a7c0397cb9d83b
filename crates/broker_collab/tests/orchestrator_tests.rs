//! Collaboration pipeline scenarios with a scripted LLM.
//!
//! The mock distinguishes planner, validator, and corrector calls by their
//! system prompts, mirroring how the three roles share one gateway.

use anyhow::Result;
use async_trait::async_trait;
use broker_collab::{
    CollaborationOrchestrator, HttpClient, LlmClient, LoreClient, LoreRetriever, RulesClient,
    TeacherPlanner, Verifier,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Scripted LLM: the first `invalid_planner_calls` of every
/// `planner_period` planner calls produce structurally broken trajectories.
struct ScriptedLlm {
    planner_calls: AtomicUsize,
    valid_before_invalid: usize,
    invalid_count: usize,
}

impl ScriptedLlm {
    fn new(valid_before_invalid: usize, invalid_count: usize) -> Self {
        Self {
            planner_calls: AtomicUsize::new(0),
            valid_before_invalid,
            invalid_count,
        }
    }

    fn valid_trajectory() -> String {
        r#"{"steps": [
            {"action": "scout", "reasoning": "know the terrain", "reward": 0.3},
            {"action": "stalk", "reasoning": "close the distance", "reward": 0.3},
            {"action": "strike", "reasoning": "finish decisively", "reward": 0.4}
        ], "expected_outcome": "prey taken"}"#
            .to_string()
    }

    /// Empty action in step 2 draws a critical structure issue.
    fn invalid_trajectory() -> String {
        r#"{"steps": [
            {"action": "scout", "reasoning": "know the terrain", "reward": 0.3},
            {"action": "", "reasoning": "lost the plot", "reward": 0.3},
            {"action": "strike", "reasoning": "finish", "reward": 0.4}
        ], "expected_outcome": "prey taken"}"#
            .to_string()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, system: &str, _prompt: &str) -> Result<String> {
        if system.contains("expert validator") {
            return Ok(r#"{"score": 0.95, "issues": [], "critical_issues": []}"#.to_string());
        }
        if system.contains("trajectory corrector") {
            return Ok(Self::valid_trajectory());
        }

        // Planner call.
        let call = self.planner_calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.valid_before_invalid
            && call < self.valid_before_invalid + self.invalid_count
        {
            Ok(Self::invalid_trajectory())
        } else {
            Ok(Self::valid_trajectory())
        }
    }
}

fn retriever_with_dead_backends() -> LoreRetriever {
    // Both context services are unreachable; the pipeline must continue on
    // empty slots.
    let rules = RulesClient::new(
        HttpClient::new("http://127.0.0.1:9", Duration::from_millis(200), 5, Duration::from_secs(60))
            .unwrap()
            .with_retry_base(Duration::from_millis(1)),
    );
    let lore = LoreClient::new(
        HttpClient::new("http://127.0.0.1:9", Duration::from_millis(200), 5, Duration::from_secs(60))
            .unwrap()
            .with_retry_base(Duration::from_millis(1)),
    );
    LoreRetriever::new(Arc::new(rules), Arc::new(lore))
}

fn orchestrator(llm: Arc<dyn LlmClient>) -> CollaborationOrchestrator {
    let planner = TeacherPlanner::new(llm.clone());
    let verifier = Arc::new(Verifier::new(llm, None, 0.7));
    CollaborationOrchestrator::new(retriever_with_dead_backends(), planner, verifier, 3)
}

#[tokio::test]
async fn regeneration_replaces_invalid_trajectories() {
    // First pass: 3 valid, 2 invalid. Regeneration fills the gap.
    let llm = Arc::new(ScriptedLlm::new(3, 2));
    let orchestrator = orchestrator(llm.clone());

    let result = orchestrator
        .generate_training_examples("X", "personality", 5, None)
        .await;

    assert_eq!(result.validated_count, 5);
    assert_eq!(result.trajectories.len(), 5);
    assert!(result.invalid_count >= 2);

    let attempts = result.metadata["regeneration_attempts"].as_u64().unwrap();
    assert!(attempts >= 1 && attempts <= 3);

    // Every returned trajectory passes the structural invariants.
    for trajectory in &result.trajectories {
        assert!(trajectory.steps.len() >= 3 && trajectory.steps.len() <= 20);
        assert!((trajectory.reward_sum() - 1.0).abs() <= 0.2);
        for step in &trajectory.steps {
            assert!(!step.action.is_empty());
            assert!((0.0..=1.0).contains(&step.reward));
        }
    }
}

#[tokio::test]
async fn all_valid_first_pass_needs_no_regeneration() {
    let llm = Arc::new(ScriptedLlm::new(usize::MAX, 0));
    let orchestrator = orchestrator(llm);

    let result = orchestrator
        .generate_training_examples("Werewolf", "personality", 4, None)
        .await;

    assert_eq!(result.validated_count, 4);
    assert_eq!(result.invalid_count, 0);
    assert_eq!(result.metadata["regeneration_attempts"], 0);
    assert_eq!(result.metadata["species"], "Werewolf");
    assert_eq!(result.metadata["lore_context_used"], false);
}

#[tokio::test]
async fn exhausted_attempts_return_partial_results() {
    // Every planner call is invalid; regeneration can never fill the quota.
    let llm = Arc::new(ScriptedLlm::new(0, usize::MAX));
    let orchestrator = orchestrator(llm);

    let result = orchestrator
        .generate_training_examples("X", "personality", 3, None)
        .await;

    assert_eq!(result.validated_count, 0);
    assert!(result.trajectories.is_empty());
    // Initial 3 plus three regen rounds of (3 - 0) * 2 each.
    assert!(result.invalid_count >= 3);
    assert_eq!(result.metadata["regeneration_attempts"], 3);
}

struct FailingLlm;

#[async_trait]
impl LlmClient for FailingLlm {
    async fn generate(&self, system: &str, _prompt: &str) -> Result<String> {
        if system.contains("expert validator") {
            return Ok(r#"{"score": 1.0, "issues": []}"#.to_string());
        }
        anyhow::bail!("gateway unavailable")
    }
}

#[tokio::test]
async fn planner_failures_surface_as_fallback_trajectories() {
    let llm: Arc<dyn LlmClient> = Arc::new(FailingLlm);
    let planner = TeacherPlanner::new(llm);
    let context = broker_collab::LoreContext::default();

    let batch = planner.generate_batch(&context, "personality", 2, None).await;
    assert_eq!(batch.len(), 2);
    for trajectory in &batch {
        assert!(trajectory.is_fallback());
        assert_eq!(trajectory.steps.len(), 3);
        assert!((trajectory.reward_sum() - 1.0).abs() < 1e-9);
    }
}
