pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod telemetry;

pub use config::{AppConfig, ExtractionMode, LogFormat, OperationMode};
pub use error::PipelineError;
pub use metrics::{MetricsSnapshot, PipelineMetrics};
pub use orchestrator::{BatchReport, ExtractionJob, Orchestrator, SkippedUnit};
pub use telemetry::init_tracing;
