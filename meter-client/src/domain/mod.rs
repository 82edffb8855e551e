mod reading;

pub use reading::{FuelKind, MeterPoint, Reading, Watermark};
