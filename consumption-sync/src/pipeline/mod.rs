use std::{pin::Pin, time::Duration};

use futures::Stream;
use meter_client::domain::{FuelKind, MeterPoint, Reading, Watermark};
use time::OffsetDateTime;

mod coordinator;
mod fan_in;
mod scope;
mod writer;

#[cfg(test)]
pub(crate) mod testing;

pub use coordinator::{RunReport, RunSettings, RunState, StreamReport, SyncPipeline};
pub use scope::RunScope;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("querying last {fuel} reading failed: {message}")]
    Query { fuel: FuelKind, message: String },
    #[error("fetching {fuel} consumption failed: {message}")]
    Fetch { fuel: FuelKind, message: String },
    #[error("malformed {fuel} consumption record: {message}")]
    Format { fuel: FuelKind, message: String },
    #[error("writing {fuel} point failed: {message}")]
    Write { fuel: FuelKind, message: String },
    #[error("run did not finish within {0:?}")]
    Timeout(Duration),
    #[error("run cancelled")]
    Cancelled,
    #[error("delivery queue closed")]
    QueueClosed,
    #[error("task failed: {0}")]
    Task(String),
}

impl SyncError {
    /// Errors that only ever follow another participant's failure. They never
    /// become the terminal result of a run on their own.
    pub fn is_consequence(&self) -> bool {
        matches!(self, SyncError::Cancelled | SyncError::QueueClosed)
    }
}

pub type ReadingStream = Pin<Box<dyn Stream<Item = Result<Reading, SyncError>> + Send>>;

/// Where the newest already-persisted reading of each stream is looked up.
#[async_trait::async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn last_reading_time(&self, fuel: FuelKind) -> Result<Option<OffsetDateTime>, SyncError>;
}

/// Produces the readings of one meter point that are newer than `watermark`.
///
/// The returned stream is lazy, ordered by period start, finite, and hides
/// any upstream pagination. It can only be consumed once.
#[async_trait::async_trait]
pub trait ReadingSource: Send + Sync {
    async fn fetch(&self, meter: &MeterPoint, watermark: Watermark) -> ReadingStream;
}

/// Commits one reading as one point in the time-series store.
#[async_trait::async_trait]
pub trait PointSink: Send + Sync {
    async fn write_point(&self, reading: &Reading) -> Result<(), SyncError>;
}
