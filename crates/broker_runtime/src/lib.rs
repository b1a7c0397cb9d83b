//! Service skeleton shared by every back-end service: the lifecycle
//! contract, graceful shutdown, and the periodic health publisher.

pub mod health;
pub mod service;

pub use health::HealthPublisher;
pub use service::{drain_tasks, run_until_shutdown, Service};
