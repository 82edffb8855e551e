use std::{collections::BTreeMap, sync::Arc};

use meter_client::domain::{FuelKind, Reading};
use tokio::sync::mpsc;

use super::{PointSink, RunScope, SyncError};

/// Per-fuel count of readings the writer consumed from the queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct WriteTally {
    pub committed: BTreeMap<FuelKind, u64>,
    pub suppressed: BTreeMap<FuelKind, u64>,
}

impl WriteTally {
    pub fn committed(&self, fuel: FuelKind) -> u64 {
        self.committed.get(&fuel).copied().unwrap_or(0)
    }

    pub fn suppressed(&self, fuel: FuelKind) -> u64 {
        self.suppressed.get(&fuel).copied().unwrap_or(0)
    }
}

pub(crate) struct SinkWriter {
    sink: Arc<dyn PointSink>,
    dry_run: bool,
}

impl SinkWriter {
    pub fn new(sink: Arc<dyn PointSink>, dry_run: bool) -> Self {
        Self { sink, dry_run }
    }

    /// Consume the delivery queue until it is closed and empty.
    ///
    /// The first failed write closes the queue, so producers blocked on a full
    /// queue wake up, and fails the scope.
    pub async fn drain(
        self,
        mut rx: mpsc::Receiver<Reading>,
        scope: RunScope,
    ) -> Result<WriteTally, SyncError> {
        let mut tally = WriteTally::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = scope.cancelled() => {
                    rx.close();
                    return Err(SyncError::Cancelled);
                }
                next = rx.recv() => next,
            };

            let Some(reading) = next else {
                return Ok(tally);
            };

            if self.dry_run {
                tracing::info!(
                    fuel_type = %reading.fuel,
                    consumption = reading.consumption,
                    time = %reading.period_start,
                    "[dry-run] Would submit consumption"
                );
                metrics::counter!("consumption_dry_run_points_total", "fuel_type" => reading.fuel.as_str())
                    .increment(1);
                *tally.suppressed.entry(reading.fuel).or_default() += 1;
                continue;
            }

            match scope.run(self.sink.write_point(&reading)).await {
                Ok(()) => {
                    metrics::counter!("consumption_points_written_total", "fuel_type" => reading.fuel.as_str())
                        .increment(1);
                    *tally.committed.entry(reading.fuel).or_default() += 1;
                }
                Err(e) => {
                    rx.close();
                    if !e.is_consequence() {
                        tracing::error!(error = %e, "error writing point");
                        metrics::counter!("consumption_write_errors_total").increment(1);
                    }
                    scope.fail(e.clone());
                    return Err(e);
                }
            }
        }
    }
}
