//! Collaboration Orchestrator - retrieve → plan → verify → regenerate.

use crate::planner::{ExpertTrajectory, TeacherPlanner};
use crate::retriever::LoreRetriever;
use crate::verifier::Verifier;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct CollaborationResult {
    pub trajectories: Vec<ExpertTrajectory>,
    pub validated_count: usize,
    pub invalid_count: usize,
    pub metadata: Value,
}

pub struct CollaborationOrchestrator {
    retriever: LoreRetriever,
    planner: TeacherPlanner,
    verifier: Arc<Verifier>,
    max_regeneration_attempts: u32,
}

impl CollaborationOrchestrator {
    pub fn new(
        retriever: LoreRetriever,
        planner: TeacherPlanner,
        verifier: Arc<Verifier>,
        max_regeneration_attempts: u32,
    ) -> Self {
        tracing::info!("CollaborationOrchestrator initialized");
        Self {
            retriever,
            planner,
            verifier,
            max_regeneration_attempts,
        }
    }

    /// Generate `count` validated trajectories. Invalid ones feed the
    /// regeneration loop; after exhausting attempts, whatever was
    /// accumulated is returned with the invalid tally in metadata.
    pub async fn generate_training_examples(
        &self,
        species: &str,
        model_type: &str,
        count: usize,
        rules: Option<Value>,
    ) -> CollaborationResult {
        tracing::info!(
            "Generating {} training examples for {} ({})",
            count,
            species,
            model_type
        );

        // Step 1: retrieve context (partial failures yield empty slots).
        let context = self.retriever.retrieve(species, model_type).await;
        let rules_ref = rules.as_ref();

        // Step 2 + 3: plan then verify.
        let trajectories = self
            .planner
            .generate_batch(&context, model_type, count, None)
            .await;
        let results = self
            .verifier
            .verify_batch(&trajectories, model_type, rules_ref, Some(species))
            .await;

        let mut valid: Vec<ExpertTrajectory> = Vec::new();
        let mut invalid_count = 0;
        for (trajectory, result) in trajectories.into_iter().zip(results) {
            if result.valid {
                valid.push(trajectory);
            } else {
                invalid_count += 1;
                tracing::warn!(
                    "Invalid trajectory (score={:.2}): {} issues",
                    result.score,
                    result.issues.len()
                );
            }
        }

        // Step 4: regenerate while short, doubling the ask to absorb the
        // expected invalid share.
        let mut regeneration_attempts = 0;
        while valid.len() < count && regeneration_attempts < self.max_regeneration_attempts {
            let needed = count - valid.len();
            regeneration_attempts += 1;
            tracing::info!(
                "Regenerating {} examples (have {}, need {}, attempt {})",
                needed,
                valid.len(),
                count,
                regeneration_attempts
            );

            let additional = self
                .planner
                .generate_batch(&context, model_type, needed * 2, None)
                .await;
            let additional_results = self
                .verifier
                .verify_batch(&additional, model_type, rules_ref, Some(species))
                .await;

            for (trajectory, result) in additional.into_iter().zip(additional_results) {
                if result.valid && valid.len() < count {
                    valid.push(trajectory);
                } else {
                    invalid_count += 1;
                }
            }
        }

        let validated_count = valid.len();
        let result = CollaborationResult {
            trajectories: valid,
            validated_count,
            invalid_count,
            metadata: serde_json::json!({
                "species": species,
                "model_type": model_type,
                "lore_context_used": context.rules_count() > 0 || !context.related_lore.is_empty(),
                "regeneration_attempts": regeneration_attempts,
                "lore_entries": context.related_lore.len(),
                "rules_count": context.rules_count(),
            }),
        };
        tracing::info!(
            "Generated {}/{} valid trajectories (invalid: {})",
            result.validated_count,
            count,
            result.invalid_count
        );
        result
    }
}
