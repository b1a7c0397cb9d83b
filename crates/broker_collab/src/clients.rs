//! Thin service clients over the shared HTTP core: URL building and
//! response parsing only.

use crate::http::{HttpClient, HttpError};
use serde_json::Value;

/// Dynamic rules engine.
pub struct RulesClient {
    http: HttpClient,
}

impl RulesClient {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Rules for a species/model pair; absent rules are an empty object.
    pub async fn get_rules(&self, species: &str, model_type: &str) -> Result<Value, HttpError> {
        let result = self
            .http
            .get_json(
                "/api/v1/rules",
                &[("species", species), ("model_type", model_type)],
            )
            .await?;
        Ok(result.unwrap_or_else(|| Value::Object(Default::default())))
    }

    pub fn http(&self) -> &HttpClient {
        &self.http
    }
}

/// Lore database.
pub struct LoreClient {
    http: HttpClient,
}

impl LoreClient {
    pub fn new(http: HttpClient) -> Self {
        Self { http }
    }

    /// Lore entries for a species; 404 means no lore yet.
    pub async fn get_lore(&self, species: &str) -> Result<Vec<String>, HttpError> {
        let result = self
            .http
            .get_json("/api/v1/lore", &[("species", species)])
            .await?;
        Ok(result
            .and_then(|v| {
                v.get("entries")
                    .and_then(|e| serde_json::from_value(e.clone()).ok())
            })
            .unwrap_or_default())
    }

    /// Previously accepted training examples for grounding new ones.
    pub async fn get_historical_examples(
        &self,
        species: &str,
        model_type: &str,
    ) -> Result<Vec<Value>, HttpError> {
        let result = self
            .http
            .get_json(
                "/api/v1/examples",
                &[("species", species), ("model_type", model_type)],
            )
            .await?;
        Ok(result
            .and_then(|v| {
                v.get("examples")
                    .and_then(|e| serde_json::from_value(e.clone()).ok())
            })
            .unwrap_or_default())
    }
}
