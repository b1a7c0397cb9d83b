pub mod config;
pub mod health;
pub mod subjects;

pub use config::{
    AnalyzerConfig, BrokerConfig, CacheConfig, CollabConfig, DetectorThresholds, DriftConfig,
    ServiceConfig, StoryConfig,
};
pub use health::{HealthRecord, HealthStatus, WorkerHealth};
pub use subjects::subject_matches;
