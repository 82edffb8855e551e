use std::sync::Arc;

use futures::StreamExt;
use meter_client::domain::{FuelKind, MeterPoint, Reading, Watermark};
use tokio::{
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};

use super::{ReadingSource, RunScope, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchOutcome {
    pub fuel: FuelKind,
    pub delivered: u64,
}

/// Spawn one fetch task per stream plus the completion watcher.
///
/// The returned handle resolves once every fetch task has finished and the
/// delivery queue has been closed for reads.
pub(crate) fn start(
    source: Arc<dyn ReadingSource>,
    streams: Vec<(MeterPoint, Watermark)>,
    tx: mpsc::Sender<Reading>,
    scope: &RunScope,
) -> JoinHandle<Vec<FetchOutcome>> {
    let mut fetchers = JoinSet::new();

    for (meter, watermark) in streams {
        fetchers.spawn(fetch_stream(
            source.clone(),
            meter,
            watermark,
            tx.clone(),
            scope.clone(),
        ));
    }

    tokio::spawn(watch_completion(fetchers, tx, scope.clone()))
}

async fn fetch_stream(
    source: Arc<dyn ReadingSource>,
    meter: MeterPoint,
    watermark: Watermark,
    tx: mpsc::Sender<Reading>,
    scope: RunScope,
) -> Result<FetchOutcome, SyncError> {
    let fuel = meter.fuel;
    tracing::debug!(fuel_type = %fuel, since = %watermark, "getting consumption");

    let mut readings = scope.run(async { Ok(source.fetch(&meter, watermark).await) }).await?;
    let mut delivered: u64 = 0;

    loop {
        let Some(item) = scope.run(async { Ok(readings.next().await) }).await? else {
            break;
        };
        let reading = item?;

        tracing::debug!(
            fuel_type = %fuel,
            consumption = reading.consumption,
            period = %reading.period_start,
            "got consumption"
        );
        metrics::counter!("consumption_readings_fetched_total", "fuel_type" => fuel.as_str()).increment(1);

        // Blocks while the queue is full; a closed queue means the writer gave up.
        scope
            .run(async { tx.send(reading).await.map_err(|_| SyncError::QueueClosed) })
            .await?;
        delivered += 1;
    }

    if delivered == 0 {
        tracing::info!(fuel_type = %fuel, "no new {fuel} records to fetch");
    }

    Ok(FetchOutcome { fuel, delivered })
}

/// Join every fetch task, success or failure, then release the last sender.
/// The delivery queue therefore closes exactly once and only after all
/// producers are done.
async fn watch_completion(
    mut fetchers: JoinSet<Result<FetchOutcome, SyncError>>,
    tx: mpsc::Sender<Reading>,
    scope: RunScope,
) -> Vec<FetchOutcome> {
    let mut outcomes = Vec::with_capacity(fetchers.len());

    while let Some(joined) = fetchers.join_next().await {
        match joined {
            Ok(Ok(outcome)) => {
                tracing::info!(
                    fuel_type = %outcome.fuel,
                    readings = outcome.delivered,
                    "finished getting consumption"
                );
                outcomes.push(outcome);
            }
            Ok(Err(e)) => {
                if !e.is_consequence() {
                    tracing::error!(error = %e, "error getting consumption");
                }
                scope.fail(e);
            }
            Err(e) => {
                tracing::error!(error = %e, "fetch task did not complete");
                scope.fail(SyncError::Task(format!("fetch task join error: {e}")));
            }
        }
    }

    drop(tx);
    tracing::info!("done getting consumption");

    outcomes
}
