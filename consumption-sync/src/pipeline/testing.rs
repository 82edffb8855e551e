//! In-memory stand-ins for the store, the metering API and the sink.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use meter_client::domain::{FuelKind, MeterPoint, Reading, Watermark};
use time::{macros::datetime, OffsetDateTime};

use super::{PointSink, ReadingSource, ReadingStream, RunSettings, SyncError, WatermarkStore};

/// `2024-01-01T00:00Z` plus `hours`.
pub fn at(hours: i64) -> OffsetDateTime {
    datetime!(2024-01-01 00:00:00 UTC) + time::Duration::hours(hours)
}

pub fn reading(fuel: FuelKind, hours: i64, consumption: f64) -> Reading {
    Reading {
        fuel,
        consumption,
        period_start: at(hours),
    }
}

pub fn meter(fuel: FuelKind) -> MeterPoint {
    MeterPoint {
        fuel,
        mpn: format!("{fuel}-mpn"),
        serial: format!("{fuel}-serial"),
    }
}

pub fn settings(fuels: &[FuelKind]) -> RunSettings {
    RunSettings {
        meter_points: fuels.iter().copied().map(meter).collect(),
        ..RunSettings::default()
    }
}

/// Watermark store and point sink backed by one vector of committed readings.
#[derive(Default)]
pub struct MemoryStore {
    points: Mutex<Vec<Reading>>,
    seeded: usize,
    fail_watermark: Option<FuelKind>,
    fail_write_at: Option<usize>,
    write_attempts: AtomicUsize,
    watermark_queries: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points already in the store before the run.
    pub fn seeded(mut self, points: Vec<Reading>) -> Self {
        self.seeded = points.len();
        self.points = Mutex::new(points);
        self
    }

    pub fn failing_watermark(mut self, fuel: FuelKind) -> Self {
        self.fail_watermark = Some(fuel);
        self
    }

    /// Fail the write attempt with this zero-based index.
    pub fn failing_write_at(mut self, attempt: usize) -> Self {
        self.fail_write_at = Some(attempt);
        self
    }

    /// Points written by runs, excluding seeded ones.
    pub fn committed(&self) -> Vec<Reading> {
        self.points.lock().unwrap()[self.seeded..].to_vec()
    }

    pub fn last(&self, fuel: FuelKind) -> Option<OffsetDateTime> {
        self.points
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.fuel == fuel)
            .map(|r| r.period_start)
            .max()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn watermark_queries(&self) -> usize {
        self.watermark_queries.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl WatermarkStore for MemoryStore {
    async fn last_reading_time(&self, fuel: FuelKind) -> Result<Option<OffsetDateTime>, SyncError> {
        self.watermark_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_watermark == Some(fuel) {
            return Err(SyncError::Query {
                fuel,
                message: "store unavailable".to_string(),
            });
        }
        Ok(self.last(fuel))
    }
}

#[async_trait::async_trait]
impl PointSink for MemoryStore {
    async fn write_point(&self, reading: &Reading) -> Result<(), SyncError> {
        let attempt = self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_write_at == Some(attempt) {
            return Err(SyncError::Write {
                fuel: reading.fuel,
                message: "write rejected".to_string(),
            });
        }
        self.points.lock().unwrap().push(reading.clone());
        Ok(())
    }
}

#[derive(Default, Clone)]
struct Script {
    readings: Vec<Reading>,
    delay: Duration,
    fail_after: Option<(usize, SyncError)>,
    hang: bool,
}

/// Metering API stand-in. Honors the watermark the same way the real API's
/// `period_from` does.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: HashMap<FuelKind, Script>,
    fetch_calls: AtomicUsize,
    seen: Mutex<Vec<(MeterPoint, Watermark)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_readings(mut self, fuel: FuelKind, readings: Vec<Reading>) -> Self {
        self.scripts.entry(fuel).or_default().readings = readings;
        self
    }

    /// Sleep before every item of this stream.
    pub fn with_delay(mut self, fuel: FuelKind, delay: Duration) -> Self {
        self.scripts.entry(fuel).or_default().delay = delay;
        self
    }

    /// Yield `n` readings, then `err`.
    pub fn failing_after(mut self, fuel: FuelKind, n: usize, err: SyncError) -> Self {
        self.scripts.entry(fuel).or_default().fail_after = Some((n, err));
        self
    }

    /// Never finish after the scripted readings, like a stalled page request.
    pub fn hanging(mut self, fuel: FuelKind) -> Self {
        self.scripts.entry(fuel).or_default().hang = true;
        self
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn seen_watermarks(&self) -> Vec<(MeterPoint, Watermark)> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ReadingSource for ScriptedSource {
    async fn fetch(&self, meter: &MeterPoint, watermark: Watermark) -> ReadingStream {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push((meter.clone(), watermark));

        let script = self.scripts.get(&meter.fuel).cloned().unwrap_or_default();
        let Script {
            readings,
            delay,
            fail_after,
            hang,
        } = script;

        let readings: Vec<Reading> = readings
            .into_iter()
            .filter(|r| watermark.admits(r.period_start))
            .collect();
        let take = fail_after.as_ref().map_or(readings.len(), |(n, _)| *n);

        Box::pin(async_stream::stream! {
            for r in readings.into_iter().take(take) {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(r);
            }
            if let Some((_, err)) = fail_after {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Err(err);
                return;
            }
            if hang {
                futures::future::pending::<()>().await;
            }
        })
    }
}
