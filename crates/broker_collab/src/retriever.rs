//! Lore Retriever - gathers rules, historical examples, and related lore for
//! trajectory generation. Sub-fetch failures degrade to empty slots; the
//! pipeline always continues.

use crate::clients::{LoreClient, RulesClient};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct LoreContext {
    pub species: String,
    pub game_rules: Value,
    pub historical_examples: Vec<Value>,
    pub related_lore: Vec<String>,
}

impl LoreContext {
    pub fn rules_count(&self) -> usize {
        self.game_rules.as_object().map(|o| o.len()).unwrap_or(0)
    }
}

pub struct LoreRetriever {
    rules: Arc<RulesClient>,
    lore: Arc<LoreClient>,
}

impl LoreRetriever {
    pub fn new(rules: Arc<RulesClient>, lore: Arc<LoreClient>) -> Self {
        Self { rules, lore }
    }

    /// Fetch all three context slots concurrently.
    pub async fn retrieve(&self, species: &str, model_type: &str) -> LoreContext {
        tracing::info!("Retrieving lore for {} ({})", species, model_type);

        let (rules, examples, lore) = tokio::join!(
            self.rules.get_rules(species, model_type),
            self.lore.get_historical_examples(species, model_type),
            self.lore.get_lore(species),
        );

        let game_rules = rules.unwrap_or_else(|e| {
            tracing::error!("Error fetching rules: {}", e);
            Value::Object(Default::default())
        });
        let historical_examples = examples.unwrap_or_else(|e| {
            tracing::error!("Error fetching historical examples: {}", e);
            Vec::new()
        });
        let related_lore = lore.unwrap_or_else(|e| {
            tracing::error!("Error fetching lore: {}", e);
            Vec::new()
        });

        let context = LoreContext {
            species: species.to_string(),
            game_rules,
            historical_examples,
            related_lore,
        };
        tracing::info!(
            "Retrieved lore context: {} rules, {} examples, {} lore entries",
            context.rules_count(),
            context.historical_examples.len(),
            context.related_lore.len()
        );
        context
    }
}
