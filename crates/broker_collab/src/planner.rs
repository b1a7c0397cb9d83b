//! Teacher Planner - generates expert step-by-step trajectories.
//!
//! Parse failures never surface: a deterministic fallback trajectory with
//! three canonical steps (rewards summing to 1.0) stands in, flagged in its
//! metadata so downstream consumers can discount it.

use crate::llm::{extract_json, LlmClient};
use crate::retriever::LoreContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub action: String,
    pub reasoning: String,
    pub reward: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertTrajectory {
    pub problem: String,
    pub steps: Vec<TrajectoryStep>,
    pub expected_outcome: String,
    pub metadata: Value,
}

impl ExpertTrajectory {
    pub fn reward_sum(&self) -> f64 {
        self.steps.iter().map(|s| s.reward).sum()
    }

    pub fn is_fallback(&self) -> bool {
        self.metadata
            .get("fallback")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

#[derive(Clone)]
pub struct TeacherPlanner {
    llm: Arc<dyn LlmClient>,
}

impl TeacherPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Generate one trajectory. LLM or parse failures yield the fallback.
    pub async fn generate_trajectory(
        &self,
        context: &LoreContext,
        model_type: &str,
        problem: &str,
    ) -> ExpertTrajectory {
        tracing::info!("Generating expert trajectory for {}: {}", model_type, problem);

        let system = system_prompt(model_type);
        let prompt = build_prompt(context, model_type, problem);

        let text = match self.llm.generate(&system, &prompt).await {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Trajectory generation failed: {:#}", e);
                return fallback_trajectory(problem, model_type, context);
            }
        };

        parse_trajectory(&text, problem, model_type, context)
            .unwrap_or_else(|| fallback_trajectory(problem, model_type, context))
    }

    /// Generate a batch concurrently, one LLM call per trajectory.
    pub async fn generate_batch(
        &self,
        context: &LoreContext,
        model_type: &str,
        count: usize,
        problems: Option<Vec<String>>,
    ) -> Vec<ExpertTrajectory> {
        tracing::info!("Generating batch of {} trajectories for {}", count, model_type);
        let problems =
            problems.unwrap_or_else(|| problem_descriptions(model_type, &context.species, count));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..count {
            let planner = self.clone();
            let context = context.clone();
            let model_type = model_type.to_string();
            let problem = problems
                .get(i)
                .cloned()
                .unwrap_or_else(|| format!("Problem {}", i + 1));
            tasks.spawn(async move {
                planner
                    .generate_trajectory(&context, &model_type, &problem)
                    .await
            });
        }

        let mut trajectories = Vec::new();
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok(trajectory) => trajectories.push(trajectory),
                Err(e) => tracing::error!("Trajectory task panicked: {}", e),
            }
        }
        tracing::info!("Generated {}/{} trajectories", trajectories.len(), count);
        trajectories
    }
}

fn system_prompt(model_type: &str) -> String {
    format!(
        "You are an expert AI trainer generating step-by-step expert trajectories \
         for training {model_type} models in a gaming system.\n\n\
         Requirements:\n\
         1. Generate 5-15 detailed steps\n\
         2. Each step must have an action, reasoning, and a reward in [0.0, 1.0]; \
            rewards should sum to about 1.0\n\
         3. Steps should build on each other logically\n\
         4. The final step should produce the expected outcome\n\n\
         Output format (JSON):\n\
         {{\"steps\": [{{\"action\": \"...\", \"reasoning\": \"...\", \"reward\": 0.15}}], \
         \"expected_outcome\": \"...\"}}"
    )
}

fn build_prompt(context: &LoreContext, model_type: &str, problem: &str) -> String {
    let mut parts = vec![
        format!("Problem: {}", problem),
        format!("Model Type: {}", model_type),
    ];
    if !context.species.is_empty() {
        parts.push(format!("Species: {}", context.species));
    }
    if context.rules_count() > 0 {
        parts.push(format!(
            "\nGame Rules:\n{}",
            serde_json::to_string_pretty(&context.game_rules).unwrap_or_default()
        ));
    }
    if !context.related_lore.is_empty() {
        parts.push(format!(
            "\nRelated Lore ({} entries):",
            context.related_lore.len()
        ));
        for (i, entry) in context.related_lore.iter().take(5).enumerate() {
            parts.push(format!("{}. {}", i + 1, entry));
        }
    }
    parts.push(
        "\nGenerate an expert trajectory (steps with actions, reasoning, and rewards) \
         that demonstrates the correct approach to solving this problem."
            .to_string(),
    );
    parts.join("\n")
}

fn parse_trajectory(
    text: &str,
    problem: &str,
    model_type: &str,
    context: &LoreContext,
) -> Option<ExpertTrajectory> {
    let parsed = extract_json(text)?;
    let raw_steps = parsed.get("steps")?.as_array()?;

    let steps: Vec<TrajectoryStep> = raw_steps
        .iter()
        .filter_map(|step| {
            Some(TrajectoryStep {
                action: step.get("action")?.as_str()?.to_string(),
                reasoning: step
                    .get("reasoning")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                reward: step.get("reward").and_then(|v| v.as_f64()).unwrap_or(0.1),
            })
        })
        .collect();

    if steps.is_empty() {
        tracing::warn!("No valid steps parsed - using fallback");
        return None;
    }

    Some(ExpertTrajectory {
        problem: problem.to_string(),
        steps,
        expected_outcome: parsed
            .get("expected_outcome")
            .and_then(|v| v.as_str())
            .unwrap_or("Generated solution")
            .to_string(),
        metadata: serde_json::json!({
            "model_type": model_type,
            "species": context.species,
            "num_steps": raw_steps.len(),
        }),
    })
}

/// Deterministic stand-in when generation or parsing fails.
fn fallback_trajectory(
    problem: &str,
    model_type: &str,
    context: &LoreContext,
) -> ExpertTrajectory {
    tracing::warn!("Creating fallback trajectory");
    ExpertTrajectory {
        problem: problem.to_string(),
        steps: vec![
            TrajectoryStep {
                action: "analyze_context".to_string(),
                reasoning: "Understanding the problem context and game rules".to_string(),
                reward: 0.2,
            },
            TrajectoryStep {
                action: "apply_game_rules".to_string(),
                reasoning: "Applying game-specific rules and constraints".to_string(),
                reward: 0.3,
            },
            TrajectoryStep {
                action: "generate_solution".to_string(),
                reasoning: "Generating the solution based on context and rules".to_string(),
                reward: 0.5,
            },
        ],
        expected_outcome: "Correct solution generated".to_string(),
        metadata: serde_json::json!({
            "model_type": model_type,
            "species": context.species,
            "fallback": true,
        }),
    }
}

fn problem_descriptions(model_type: &str, species: &str, count: usize) -> Vec<String> {
    let species = if species.is_empty() { "monster" } else { species };
    let templates: Vec<String> = match model_type {
        "personality" => vec![
            format!("Generate emotional response for a {species} character feeling anger"),
            format!("Create personality trait expression for {species} showing fear"),
            format!("Design emotional state transition for {species} from neutral to aggressive"),
            format!("Generate personality-appropriate action for {species} encountering a threat"),
            format!("Create emotional dialogue response for {species} in negotiation"),
        ],
        "facial" => vec![
            format!("Generate facial expression for {species} showing surprise"),
            format!("Create emotion blend for {species} (anger + fear)"),
            format!("Design facial animation sequence for {species} emotional transition"),
            format!("Generate micro-expression for {species} subtle emotion"),
        ],
        other => vec![
            format!("Generate {other} output for a {species} scenario"),
            format!("Create {other} response for a {species} situation"),
        ],
    };

    (0..count)
        .map(|i| {
            let template = &templates[i % templates.len()];
            format!("{} (variant {})", template, i + 1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> LoreContext {
        LoreContext {
            species: "Vampire".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn parse_accepts_wellformed_steps() {
        let text = r#"{"steps": [
            {"action": "a", "reasoning": "r", "reward": 0.4},
            {"action": "b", "reasoning": "r", "reward": 0.6}
        ], "expected_outcome": "done"}"#;
        let trajectory = parse_trajectory(text, "p", "personality", &context()).unwrap();
        assert_eq!(trajectory.steps.len(), 2);
        assert!((trajectory.reward_sum() - 1.0).abs() < 1e-9);
        assert!(!trajectory.is_fallback());
    }

    #[test]
    fn parse_drops_stepless_output() {
        assert!(parse_trajectory(r#"{"steps": []}"#, "p", "m", &context()).is_none());
        assert!(parse_trajectory("nonsense", "p", "m", &context()).is_none());
    }

    #[test]
    fn fallback_sums_to_one_and_is_flagged() {
        let trajectory = fallback_trajectory("p", "personality", &context());
        assert_eq!(trajectory.steps.len(), 3);
        assert!((trajectory.reward_sum() - 1.0).abs() < 1e-9);
        assert!(trajectory.is_fallback());
    }

    #[test]
    fn problem_descriptions_are_distinct() {
        let problems = problem_descriptions("personality", "Werewolf", 7);
        assert_eq!(problems.len(), 7);
        let unique: std::collections::HashSet<&String> = problems.iter().collect();
        assert_eq!(unique.len(), 7);
        assert!(problems[0].contains("Werewolf"));
    }
}
