//! Verifier - gates trajectories on structure, rules compliance, and
//! LLM-judged quality. The combined score is the minimum of the three
//! checks; a trajectory is valid at or above the configured minimum with
//! zero critical issues.

use crate::clients::RulesClient;
use crate::llm::{extract_json, LlmClient};
use crate::planner::ExpertTrajectory;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Reward sums may drift this far from 1.0 before drawing a warning.
const REWARD_SUM_TOLERANCE: f64 = 0.2;
const MIN_STEPS: usize = 3;
const MAX_STEPS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct VerificationResult {
    pub valid: bool,
    pub score: f64,
    pub issues: Vec<String>,
    pub corrected_trajectory: Option<Value>,
}

pub struct Verifier {
    llm: Arc<dyn LlmClient>,
    rules_client: Option<Arc<RulesClient>>,
    min_score: f64,
}

impl Verifier {
    pub fn new(llm: Arc<dyn LlmClient>, rules_client: Option<Arc<RulesClient>>, min_score: f64) -> Self {
        tracing::info!("Verifier initialized with min_score={}", min_score);
        Self {
            llm,
            rules_client,
            min_score,
        }
    }

    pub async fn verify(
        &self,
        trajectory: &ExpertTrajectory,
        model_type: &str,
        rules: Option<&Value>,
        species: Option<&str>,
    ) -> VerificationResult {
        let mut issues = Vec::new();
        let mut score: f64 = 1.0;

        // 1. Structure.
        let (structure_issues, structure_score) = validate_structure(trajectory);
        issues.extend(structure_issues);
        score = score.min(structure_score);

        // 2. Rules compliance. Missing rules are fetched when a species is
        // known; fetch failures just skip the check.
        let fetched;
        let effective_rules = match (rules, species, &self.rules_client) {
            (Some(rules), _, _) => Some(rules),
            (None, Some(species), Some(client)) => {
                match client.get_rules(species, model_type).await {
                    Ok(value) => {
                        fetched = value;
                        Some(&fetched)
                    }
                    Err(e) => {
                        tracing::warn!("Could not fetch rules: {}", e);
                        None
                    }
                }
            }
            _ => None,
        };
        if let Some(rules) = effective_rules {
            let (rules_issues, rules_score) = validate_rules(trajectory, rules, model_type);
            issues.extend(rules_issues);
            score = score.min(rules_score);
        }

        // 3. LLM quality judgement.
        let (quality_issues, quality_score) = self.validate_quality(trajectory, model_type).await;
        issues.extend(quality_issues);
        score = score.min(quality_score);

        let score = score.max(0.0);
        let has_critical = issues.iter().any(|i| i.to_lowercase().contains("critical"));
        let valid = score >= self.min_score && !has_critical;

        let corrected_trajectory = if !valid {
            self.correct(trajectory, &issues).await
        } else {
            None
        };

        tracing::info!(
            "Verification complete: valid={}, score={:.2}, issues={}",
            valid,
            score,
            issues.len()
        );
        VerificationResult {
            valid,
            score,
            issues,
            corrected_trajectory,
        }
    }

    /// Verify a batch concurrently, preserving input order.
    pub async fn verify_batch(
        &self,
        trajectories: &[ExpertTrajectory],
        model_type: &str,
        rules: Option<&Value>,
        species: Option<&str>,
    ) -> Vec<VerificationResult> {
        tracing::info!("Verifying batch of {} trajectories", trajectories.len());
        let futures = trajectories
            .iter()
            .map(|t| self.verify(t, model_type, rules, species));
        let results = futures_util::future::join_all(futures).await;

        let valid = results.iter().filter(|r| r.valid).count();
        tracing::info!(
            "Batch verification complete: {}/{} valid",
            valid,
            results.len()
        );
        results
    }

    async fn validate_quality(
        &self,
        trajectory: &ExpertTrajectory,
        model_type: &str,
    ) -> (Vec<String>, f64) {
        let prompt = quality_prompt(trajectory, model_type);
        match self.llm.generate(QUALITY_SYSTEM_PROMPT, &prompt).await {
            Ok(text) => parse_quality_response(&text),
            Err(e) => {
                tracing::error!("Error in LLM validation: {:#}", e);
                (
                    vec!["Warning: LLM validation error".to_string()],
                    0.9,
                )
            }
        }
    }

    /// Ask the LLM for a corrected version; failures are non-fatal.
    async fn correct(&self, trajectory: &ExpertTrajectory, issues: &[String]) -> Option<Value> {
        tracing::info!("Attempting to correct trajectory with {} issues", issues.len());
        let mut prompt = vec![
            "Original Trajectory:".to_string(),
            serde_json::to_string_pretty(trajectory).ok()?,
            format!("\nIssues to fix ({}):", issues.len()),
        ];
        for issue in issues {
            prompt.push(format!("- {}", issue));
        }
        prompt.push(
            "\nGenerate a corrected version of this trajectory that fixes all issues \
             while maintaining the same structure and core approach."
                .to_string(),
        );

        match self
            .llm
            .generate(
                "You are an expert trajectory corrector. Fix issues in trajectories while \
                 maintaining their core structure.",
                &prompt.join("\n"),
            )
            .await
        {
            Ok(text) => extract_json(&text),
            Err(e) => {
                tracing::error!("Error correcting trajectory: {:#}", e);
                None
            }
        }
    }
}

// ============================================================================
// Checks
// ============================================================================

fn validate_structure(trajectory: &ExpertTrajectory) -> (Vec<String>, f64) {
    let mut issues = Vec::new();
    let mut score: f64 = 1.0;

    if trajectory.steps.is_empty() {
        issues.push("CRITICAL: Trajectory has no steps".to_string());
        return (issues, 0.5);
    }
    if trajectory.steps.len() < MIN_STEPS {
        issues.push(format!(
            "Warning: Trajectory has fewer than {} steps",
            MIN_STEPS
        ));
        score -= 0.1;
    }
    if trajectory.steps.len() > MAX_STEPS {
        issues.push(format!(
            "Warning: Trajectory has more than {} steps (may be too verbose)",
            MAX_STEPS
        ));
        score -= 0.1;
    }

    let mut total_reward = 0.0;
    for (i, step) in trajectory.steps.iter().enumerate() {
        if step.action.is_empty() {
            issues.push(format!("CRITICAL: Step {} missing action", i + 1));
            score -= 0.2;
        }
        if step.reasoning.is_empty() {
            issues.push(format!("Warning: Step {} missing reasoning", i + 1));
            score -= 0.05;
        }
        if !(0.0..=1.0).contains(&step.reward) {
            issues.push(format!(
                "Warning: Step {} reward out of range [0,1]: {}",
                i + 1,
                step.reward
            ));
            score -= 0.05;
        }
        total_reward += step.reward;
    }

    if (total_reward - 1.0).abs() > REWARD_SUM_TOLERANCE {
        issues.push(format!(
            "Warning: Total reward sum is {:.2}, expected ~1.0",
            total_reward
        ));
        score -= 0.1;
    }
    if trajectory.expected_outcome.is_empty() {
        issues.push("Warning: Missing expected outcome".to_string());
        score -= 0.05;
    }

    (issues, score.max(0.0))
}

fn validate_rules(
    trajectory: &ExpertTrajectory,
    rules: &Value,
    model_type: &str,
) -> (Vec<String>, f64) {
    let mut issues = Vec::new();
    let mut score: f64 = 1.0;

    let Some(required) = rules
        .pointer(&format!("/rules/{}/required_fields", model_type))
        .and_then(|v| v.as_array())
    else {
        return (issues, score);
    };

    for field in required.iter().filter_map(|v| v.as_str()) {
        if trajectory.metadata.get(field).is_none() {
            issues.push(format!("Missing required field: {}", field));
            score -= 0.1;
        }
    }
    (issues, score.max(0.0))
}

const QUALITY_SYSTEM_PROMPT: &str = "You are an expert validator for AI training trajectories.\n\n\
     Evaluate logical flow, completeness, correctness, relevance, and reward \
     distribution.\n\n\
     Output format (JSON):\n\
     {\"score\": 0.85, \"issues\": [\"minor issue\"], \"critical_issues\": []}";

fn quality_prompt(trajectory: &ExpertTrajectory, model_type: &str) -> String {
    let mut parts = vec![
        format!("Model Type: {}", model_type),
        format!("Problem: {}", trajectory.problem),
        format!("Expected Outcome: {}", trajectory.expected_outcome),
        format!("\nTrajectory Steps ({}):", trajectory.steps.len()),
    ];
    for (i, step) in trajectory.steps.iter().enumerate() {
        parts.push(format!(
            "\nStep {}:\n  Action: {}\n  Reasoning: {}\n  Reward: {}",
            i + 1,
            step.action,
            step.reasoning,
            step.reward
        ));
    }
    parts.push("\nEvaluate this trajectory and provide a score (0.0-1.0) and any issues.".to_string());
    parts.join("\n")
}

fn parse_quality_response(text: &str) -> (Vec<String>, f64) {
    let Some(parsed) = extract_json(text) else {
        tracing::warn!("Could not parse validation response");
        return (vec!["Warning: Unparseable LLM validation reply".to_string()], 0.9);
    };

    let score = parsed
        .get("score")
        .and_then(|v| v.as_f64())
        .unwrap_or(1.0)
        .clamp(0.0, 1.0);
    let mut issues: Vec<String> = parsed
        .get("issues")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if let Some(critical) = parsed.get("critical_issues").and_then(|v| v.as_array()) {
        issues.extend(
            critical
                .iter()
                .filter_map(|v| v.as_str())
                .map(|s| format!("CRITICAL: {}", s)),
        );
    }
    (issues, score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::TrajectoryStep;

    fn trajectory(steps: Vec<TrajectoryStep>) -> ExpertTrajectory {
        ExpertTrajectory {
            problem: "test".to_string(),
            steps,
            expected_outcome: "solved".to_string(),
            metadata: serde_json::json!({"model_type": "personality"}),
        }
    }

    fn step(reward: f64) -> TrajectoryStep {
        TrajectoryStep {
            action: "act".to_string(),
            reasoning: "because".to_string(),
            reward,
        }
    }

    #[test]
    fn wellformed_structure_scores_full() {
        let t = trajectory(vec![step(0.3), step(0.3), step(0.4)]);
        let (issues, score) = validate_structure(&t);
        assert!(issues.is_empty());
        assert_eq!(score, 1.0);
    }

    #[test]
    fn stepless_trajectory_is_critical() {
        let t = trajectory(vec![]);
        let (issues, score) = validate_structure(&t);
        assert!(issues[0].contains("CRITICAL"));
        assert!(score <= 0.5);
    }

    #[test]
    fn reward_sum_outside_tolerance_is_warned() {
        let t = trajectory(vec![step(0.5), step(0.5), step(0.5)]);
        let (issues, score) = validate_structure(&t);
        assert!(issues.iter().any(|i| i.contains("Total reward sum")));
        assert!(score < 1.0);
    }

    #[test]
    fn out_of_range_reward_is_warned() {
        let t = trajectory(vec![step(0.4), step(0.4), step(1.4)]);
        let (issues, _) = validate_structure(&t);
        assert!(issues.iter().any(|i| i.contains("out of range")));
    }

    #[test]
    fn missing_action_is_critical() {
        let mut bad = step(0.4);
        bad.action = String::new();
        let t = trajectory(vec![step(0.3), bad, step(0.3)]);
        let (issues, _) = validate_structure(&t);
        assert!(issues.iter().any(|i| i.contains("CRITICAL")));
    }

    #[test]
    fn rules_check_penalizes_missing_fields() {
        let t = trajectory(vec![step(0.3), step(0.3), step(0.4)]);
        let rules = serde_json::json!({
            "rules": {"personality": {"required_fields": ["model_type", "blood_type"]}}
        });
        let (issues, score) = validate_rules(&t, &rules, "personality");
        assert_eq!(issues.len(), 1);
        assert!(issues[0].contains("blood_type"));
        assert!((score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn quality_reply_parsing_collects_critical_issues() {
        let (issues, score) = parse_quality_response(
            r#"{"score": 0.6, "issues": ["weak reasoning"], "critical_issues": ["incoherent"]}"#,
        );
        assert!((score - 0.6).abs() < 1e-9);
        assert_eq!(issues.len(), 2);
        assert!(issues[1].starts_with("CRITICAL:"));
    }
}
