use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use meter_client::domain::{FuelKind, MeterPoint, Watermark};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{
    fan_in::{self, FetchOutcome},
    writer::{SinkWriter, WriteTally},
    PointSink, ReadingSource, RunScope, SyncError, WatermarkStore,
};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;
pub const DEFAULT_EXCLUSION_TICK: Duration = Duration::from_secs(1);

/// Immutable parameters of one run, built once from configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub meter_points: Vec<MeterPoint>,
    pub dry_run: bool,
    pub deadline: Duration,
    pub queue_capacity: usize,
    pub exclusion_tick: Duration,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            meter_points: Vec::new(),
            dry_run: false,
            deadline: DEFAULT_DEADLINE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            exclusion_tick: DEFAULT_EXCLUSION_TICK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    WatermarksLoaded,
    Running,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, WatermarksLoaded)
                | (WatermarksLoaded, Running)
                | (Running, Succeeded)
                | (Idle | WatermarksLoaded | Running, Failed)
        )
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(self.can_advance_to(next), "illegal run transition {self} -> {next}");
        tracing::debug!(from = %self, to = %next, "run state");
        *self = next;
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::WatermarksLoaded => "watermarks_loaded",
            RunState::Running => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub fuel: FuelKind,
    pub watermark: Watermark,
    pub fetched: u64,
    pub committed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub streams: Vec<StreamReport>,
    pub dry_run: bool,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn total_fetched(&self) -> u64 {
        self.streams.iter().map(|s| s.fetched).sum()
    }

    pub fn total_committed(&self) -> u64 {
        self.streams.iter().map(|s| s.committed).sum()
    }

    pub fn stream(&self, fuel: FuelKind) -> Option<&StreamReport> {
        self.streams.iter().find(|s| s.fuel == fuel)
    }
}

/// Incremental synchronization of every configured meter point into the sink.
pub struct SyncPipeline {
    pub watermarks: Arc<dyn WatermarkStore>,
    pub source: Arc<dyn ReadingSource>,
    pub sink: Arc<dyn PointSink>,
    pub settings: RunSettings,
}

impl SyncPipeline {
    /// Run once. `shutdown` cancels the run from outside (e.g. Ctrl-C).
    pub async fn run(self, shutdown: CancellationToken) -> Result<RunReport, SyncError> {
        let started = Instant::now();
        let mut state = RunState::Idle;

        let result = self.execute(&shutdown, &mut state, started).await;

        let outcome = match &result {
            Ok(_) => {
                state.advance(RunState::Succeeded);
                "succeeded"
            }
            Err(_) => {
                state.advance(RunState::Failed);
                "failed"
            }
        };
        metrics::counter!("consumption_sync_runs_total", "outcome" => outcome).increment(1);
        metrics::histogram!("consumption_sync_run_duration_seconds").record(started.elapsed().as_secs_f64());

        result
    }

    async fn execute(
        self,
        shutdown: &CancellationToken,
        state: &mut RunState,
        started: Instant,
    ) -> Result<RunReport, SyncError> {
        let SyncPipeline {
            watermarks,
            source,
            sink,
            settings,
        } = self;

        if settings.meter_points.is_empty() {
            return Err(SyncError::Configuration(
                "no active meter points; configure electricity and/or gas".to_string(),
            ));
        }

        if settings.dry_run {
            tracing::info!("[dry-run] Running in dry-run mode, nothing will be written");
        }

        let scope = RunScope::new(shutdown);
        let deadline = arm_deadline(&scope, settings.deadline);

        let result = async {
            let streams = load_watermarks(watermarks.as_ref(), &settings, &scope).await?;
            state.advance(RunState::WatermarksLoaded);

            state.advance(RunState::Running);
            let (outcomes, tally) = transfer(source, sink, &streams, &settings, &scope).await;
            scope.finish()?;

            Ok::<_, SyncError>(build_report(&streams, &outcomes, &tally, &settings, started))
        }
        .await;

        deadline.abort();
        result
    }
}

fn arm_deadline(scope: &RunScope, deadline: Duration) -> JoinHandle<()> {
    let scope = scope.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = scope.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(?deadline, "run deadline elapsed, cancelling");
                scope.fail(SyncError::Timeout(deadline));
            }
        }
    })
}

/// Read the watermark of every stream before any fetch starts. A failed
/// lookup aborts the run, since guessing a watermark risks duplicate points.
async fn load_watermarks(
    store: &dyn WatermarkStore,
    settings: &RunSettings,
    scope: &RunScope,
) -> Result<Vec<(MeterPoint, Watermark)>, SyncError> {
    let mut streams = Vec::with_capacity(settings.meter_points.len());

    for meter in &settings.meter_points {
        let fuel = meter.fuel;
        let last = match scope.run(store.last_reading_time(fuel)).await {
            Ok(last) => last,
            Err(e) => {
                if !e.is_consequence() {
                    tracing::error!(error = %e, "Error getting last {fuel} submission");
                }
                scope.fail(e);
                return Err(scope.terminal_error());
            }
        };

        let watermark = match last {
            Some(ts) => {
                tracing::info!(fuel_type = %fuel, last_submission = %ts, "Last {fuel} submission in database");
                Watermark::after(ts, settings.exclusion_tick)
            }
            None => {
                tracing::info!(fuel_type = %fuel, "No previous {fuel} submission found");
                Watermark::empty()
            }
        };
        streams.push((meter.clone(), watermark));
    }

    Ok(streams)
}

/// Fan the fetchers into one bounded queue and drain it into the sink. Both
/// sides report failures to `scope`; the caller reads the verdict from there.
async fn transfer(
    source: Arc<dyn ReadingSource>,
    sink: Arc<dyn PointSink>,
    streams: &[(MeterPoint, Watermark)],
    settings: &RunSettings,
    scope: &RunScope,
) -> (Vec<FetchOutcome>, WriteTally) {
    let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));

    let watcher = fan_in::start(source, streams.to_vec(), tx, scope);
    let writer = tokio::spawn(SinkWriter::new(sink, settings.dry_run).drain(rx, scope.clone()));

    let (fetched, written) = tokio::join!(watcher, writer);

    let outcomes = fetched.unwrap_or_else(|e| {
        scope.fail(SyncError::Task(format!("completion watcher join error: {e}")));
        Vec::new()
    });
    let tally = match written {
        Ok(Ok(tally)) => tally,
        // Already reported to the scope by the writer.
        Ok(Err(_)) => WriteTally::default(),
        Err(e) => {
            scope.fail(SyncError::Task(format!("writer join error: {e}")));
            WriteTally::default()
        }
    };

    (outcomes, tally)
}

fn build_report(
    streams: &[(MeterPoint, Watermark)],
    outcomes: &[FetchOutcome],
    tally: &WriteTally,
    settings: &RunSettings,
    started: Instant,
) -> RunReport {
    let streams = streams
        .iter()
        .map(|(meter, watermark)| {
            let fuel = meter.fuel;
            let fetched = outcomes
                .iter()
                .filter(|o| o.fuel == fuel)
                .map(|o| o.delivered)
                .sum();
            StreamReport {
                fuel,
                watermark: *watermark,
                fetched,
                committed: tally.committed(fuel),
            }
        })
        .collect();

    RunReport {
        streams,
        dry_run: settings.dry_run,
        elapsed: started.elapsed(),
    }
}
