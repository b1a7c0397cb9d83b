use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

// ============================================================================
// Top-level config
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub bus_url: BusUrl,
    pub repo_url: RepoUrl,
    pub cache: CacheConfig,
    pub story: StoryConfig,
    pub drift: DriftConfig,
    pub analyzer: AnalyzerConfig,
    pub collab: CollabConfig,
    pub service: ServiceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BusUrl(pub String);

impl Default for BusUrl {
    fn default() -> Self {
        Self("nats://localhost:4222".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoUrl(pub String);

impl Default for RepoUrl {
    fn default() -> Self {
        Self("sqlite://broker.db?mode=rwc".to_string())
    }
}

impl BrokerConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: BrokerConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Try to load from path; if file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BUS_URL") {
            self.bus_url = BusUrl(v);
        }
        if let Ok(v) = std::env::var("REPO_URL") {
            self.repo_url = RepoUrl(v);
        }
        if let Ok(v) = std::env::var("CACHE_L2_URL") {
            self.cache.l2_url = v;
        }
        override_parse(&mut self.cache.ttl_seconds, "CACHE_TTL_SECONDS");
        override_parse(&mut self.cache.l1_max, "CACHE_L1_MAX");
        override_parse(&mut self.analyzer.worker_count, "WORKER_COUNT");
        override_parse(&mut self.service.grace_period_seconds, "GRACE_PERIOD_SECONDS");
        override_parse(&mut self.drift.tangential_threshold, "DRIFT_TANGENTIAL");
        override_parse(&mut self.drift.off_theme_threshold, "DRIFT_OFF_THEME");
        override_parse(&mut self.drift.theme_consistency_min, "DRIFT_THEME_MIN");
        override_parse(&mut self.collab.breaker_threshold, "BREAKER_THRESHOLD");
        override_parse(&mut self.collab.breaker_timeout_secs, "BREAKER_TIMEOUT_SEC");
        if let Ok(v) = std::env::var("RULES_URL") {
            self.collab.rules_url = v;
        }
        if let Ok(v) = std::env::var("LORE_URL") {
            self.collab.lore_url = v;
        }
        if let Ok(v) = std::env::var("LLM_URL") {
            self.collab.llm_url = v;
        }
        if let Ok(v) = std::env::var("LLM_MODEL") {
            self.collab.llm_model = v;
        }
    }
}

fn override_parse<T: std::str::FromStr>(field: &mut T, var: &str) {
    if let Ok(v) = std::env::var(var) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub l2_url: String,
    pub ttl_seconds: u64,
    pub l1_max: usize,
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l2_url: "redis://localhost:6379".to_string(),
            ttl_seconds: 3600,
            l1_max: 10_000,
            key_prefix: "story:snapshot:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoryConfig {
    /// The dark-world client families. Every player gets exactly one
    /// standing row per entry at initialization.
    pub families: Vec<String>,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            families: [
                "carrion_kin",
                "chatter_swarm",
                "stitch_guild",
                "moon_clans",
                "vampiric_houses",
                "obsidian_synod",
                "silent_court",
                "leviathan_conclave",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub tangential_threshold: f64,
    pub off_theme_threshold: f64,
    pub theme_consistency_min: f64,
    pub off_theme_activities: Vec<String>,
    /// Minutes between periodic checks, and the per-player analysis
    /// suppression window for on-demand checks.
    pub analysis_interval_minutes: u64,
    /// Players with any event inside this window are scanned periodically.
    pub active_window_hours: i64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            tangential_threshold: 0.30,
            off_theme_threshold: 0.25,
            theme_consistency_min: 0.70,
            off_theme_activities: [
                "racing",
                "fishing",
                "gambling",
                "sports",
                "farming",
                "cooking",
                "dating_sim",
                "puzzle_solving",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            analysis_interval_minutes: 30,
            active_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DetectorThresholds {
    pub confidence_threshold: f64,
    pub severity_threshold: f64,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            severity_threshold: 0.3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub worker_count: usize,
    /// Pending queue depth beyond which the service reports degraded.
    pub queue_high_watermark: i64,
    /// Per-detector threshold overrides, keyed by detector type name.
    pub detectors: HashMap<String, DetectorThresholds>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            queue_high_watermark: 100,
            detectors: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub rules_url: String,
    pub lore_url: String,
    pub llm_url: String,
    pub llm_model: String,
    pub min_verification_score: f64,
    pub max_regeneration_attempts: u32,
    pub breaker_threshold: u32,
    pub breaker_timeout_secs: u64,
    /// Control-plane request timeout (rules, lore).
    pub control_timeout_secs: u64,
    /// LLM generation timeout.
    pub llm_timeout_secs: u64,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            rules_url: "http://localhost:8070".to_string(),
            lore_url: "http://localhost:8071".to_string(),
            llm_url: "http://localhost:8072".to_string(),
            llm_model: "teacher-planner-large".to_string(),
            min_verification_score: 0.7,
            max_regeneration_attempts: 3,
            breaker_threshold: 5,
            breaker_timeout_secs: 60,
            control_timeout_secs: 5,
            llm_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub grace_period_seconds: u64,
    pub health_interval_seconds: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            grace_period_seconds: 30,
            health_interval_seconds: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.cache.ttl_seconds, 3600);
        assert_eq!(cfg.cache.l1_max, 10_000);
        assert_eq!(cfg.analyzer.worker_count, 3);
        assert_eq!(cfg.service.grace_period_seconds, 30);
        assert!((cfg.drift.tangential_threshold - 0.30).abs() < f64::EPSILON);
        assert!((cfg.drift.off_theme_threshold - 0.25).abs() < f64::EPSILON);
        assert_eq!(cfg.collab.breaker_threshold, 5);
        assert_eq!(cfg.story.families.len(), 8);
    }

    #[test]
    fn toml_partial_override() {
        let cfg: BrokerConfig = toml::from_str(
            r#"
            [analyzer]
            worker_count = 5

            [drift]
            tangential_threshold = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.analyzer.worker_count, 5);
        assert!((cfg.drift.tangential_threshold - 0.5).abs() < f64::EPSILON);
        // Untouched sections keep defaults
        assert_eq!(cfg.cache.l1_max, 10_000);
    }
}
