use std::{fmt, time::Duration};

use time::OffsetDateTime;

/// Kind of fuel a meter measures. Each kind is synchronized as its own stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FuelKind {
    Electricity,
    Gas,
}

impl FuelKind {
    pub const ALL: [FuelKind; 2] = [FuelKind::Electricity, FuelKind::Gas];

    pub fn as_str(self) -> &'static str {
        match self {
            FuelKind::Electricity => "electricity",
            FuelKind::Gas => "gas",
        }
    }
}

impl fmt::Display for FuelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifiers of one metered supply: the meter point number (MPAN for
/// electricity, MPRN for gas) and the serial of the meter installed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterPoint {
    pub fuel: FuelKind,
    pub mpn: String,
    pub serial: String,
}

/// One interval of consumption as reported by the metering API.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub fuel: FuelKind,
    pub consumption: f64,
    pub period_start: OffsetDateTime,
}

/// Boundary between readings already stored for a stream and readings still
/// to be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    last_committed: Option<OffsetDateTime>,
    tick: Duration,
}

impl Watermark {
    /// A stream with no stored history; every reading is admitted.
    pub fn empty() -> Self {
        Self {
            last_committed: None,
            tick: Duration::ZERO,
        }
    }

    /// Watermark for a stream whose newest stored reading starts at `last`.
    ///
    /// The fetch start is `last + tick` so the boundary reading already in the
    /// store is not requested again.
    pub fn after(last: OffsetDateTime, tick: Duration) -> Self {
        Self {
            last_committed: Some(last),
            tick,
        }
    }

    pub fn last_committed(&self) -> Option<OffsetDateTime> {
        self.last_committed
    }

    pub fn is_empty(&self) -> bool {
        self.last_committed.is_none()
    }

    /// First instant to request from the source, or `None` for "from the
    /// beginning".
    pub fn fetch_from(&self) -> Option<OffsetDateTime> {
        self.last_committed.map(|last| last + self.tick)
    }

    /// Whether a reading starting at `period_start` is new for this stream.
    pub fn admits(&self, period_start: OffsetDateTime) -> bool {
        match self.last_committed {
            Some(last) => period_start > last,
            None => true,
        }
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fetch_from() {
            Some(from) => write!(f, "{from}"),
            None => f.write_str("<no history>"),
        }
    }
}
