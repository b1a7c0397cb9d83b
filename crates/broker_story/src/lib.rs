//! Story Memory service.
//!
//! Owns long-term per-player narrative state: arcs, decisions, relationships,
//! dark-world standings, experiences, and the append-only event audit log.
//! Detects narrative drift and conflicts, and serves snapshots through a
//! two-tier cache.

pub mod api;
pub mod cache;
pub mod drift;
pub mod ingest;
pub mod kv;
pub mod repo;
pub mod schemas;
pub mod service;
pub mod sqlite;
pub mod state;

pub use api::StoryApi;
pub use cache::{CacheStats, SnapshotCache, SnapshotInvalidator};
pub use drift::{AlwaysOnTheme, DriftDetector, ThemeScorer};
pub use ingest::EventIngestor;
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use repo::{PlayerBooks, StoryRepo};
pub use schemas::{
    ArcProgress, ArcRole, ConflictSeverity, DarkWorldStanding, DriftReport, DriftSeverity,
    DriftType, EntityRelationship, EntityType, Experience, ExperienceStatus, ProgressState,
    StoredEvent, StoryConflict, StoryDecision, StorySnapshot,
};
pub use service::StoryService;
pub use sqlite::SqliteStoryRepo;
pub use state::{StandingDeltas, StoryStateManager};
