//! SRL→RLVR training collaboration.
//!
//! Three models cooperate to produce validated expert trajectories: the lore
//! retriever gathers context, the teacher planner generates step-wise
//! strategies, and the verifier gates them on structure, rules compliance,
//! and quality. A two-stage pipeline then drives opaque trainers with
//! checkpointing and failure recovery. Every outbound HTTP dependency rides
//! the shared circuit-breaker client.

pub mod clients;
pub mod http;
pub mod llm;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod retriever;
pub mod service;
pub mod verifier;

pub use clients::{LoreClient, RulesClient};
pub use http::{CircuitBreaker, HttpClient, HttpError};
pub use llm::{HttpLlmClient, LlmClient};
pub use orchestrator::{CollaborationOrchestrator, CollaborationResult};
pub use pipeline::{
    CheckpointManager, CheckpointMeta, FailureHandler, FailureKind, PipelineReport,
    RecoveryAction, StageReport, TrainMetrics, Trainer, TrainingPipeline,
};
pub use planner::{ExpertTrajectory, TeacherPlanner, TrajectoryStep};
pub use retriever::{LoreContext, LoreRetriever};
pub use service::CollabService;
pub use verifier::{VerificationResult, Verifier};
