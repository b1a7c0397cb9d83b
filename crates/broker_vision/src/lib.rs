//! 4D Vision Analyzer service.
//!
//! Consumes recorded gameplay segments from a work queue, gates them on input
//! quality, fans out to the registered detectors, aggregates findings into
//! scene summaries, and publishes issues with health and backpressure
//! signals.

pub mod detector;
pub mod detectors;
pub mod metrics;
pub mod quality;
pub mod repo;
pub mod segment;
pub mod service;
pub mod sqlite;
pub mod summary;

pub use detector::{
    BatchAnalyzer, BatchDetector, Detector, DetectorCapabilities, DetectorRegistry, FrameRef,
    PerformanceImpact, StreamAnalyzer, StreamingDetector,
};
pub use detectors::shipped_registry;
pub use metrics::{severity_bucket, AnalyzerMetrics};
pub use quality::{handle_degraded_input, DataQualityAnalyzer, QualityAssessment, QualityLevel};
pub use repo::{QueueEntry, QueueStatus, SegmentStatus, VisionRepo};
pub use segment::{Finding, SegmentContext};
pub use service::AnalyzerService;
pub use sqlite::SqliteVisionRepo;
pub use summary::{summarize_segment, SceneSummary};
