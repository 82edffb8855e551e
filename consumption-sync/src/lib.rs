pub mod cli;
pub mod config;
pub mod metrics_export;
pub mod observability;
pub mod pipeline;
pub mod sinks;
pub mod sources;

pub use pipeline::{RunReport, RunSettings, SyncError, SyncPipeline};
