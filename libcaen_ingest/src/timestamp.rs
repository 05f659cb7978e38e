//! Conversion of digitizer-relative event time into absolute calendar time.
//!
//! The digitizer reports each event as picoseconds since the start of the acquisition.
//! The counter passes 2^53 within a few hours of running, so it can never be pushed
//! through an `f64` without losing precision. Everything here stays in `i128` until the
//! final rendering.
use time::{Duration, OffsetDateTime, PrimitiveDateTime, UtcOffset};

use super::constants::{PS_PER_MICROSECOND, PS_PER_SECOND};
use super::epoch::AcquisitionEpoch;
use super::error::TimestampError;

/// An absolute point in time split into whole Unix seconds and the picosecond remainder.
///
/// `subsecond_ps` is always in `[0, 10^12)`. Ordering is chronological.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsoluteTime {
    pub epoch_seconds: i64,
    pub subsecond_ps: i64,
}

impl AbsoluteTime {
    /// Split an absolute picosecond count (since the Unix epoch) into seconds and remainder
    pub fn from_picoseconds(absolute_ps: i128) -> Result<Self, TimestampError> {
        let seconds = absolute_ps.div_euclid(PS_PER_SECOND);
        let subsecond = absolute_ps.rem_euclid(PS_PER_SECOND);
        let epoch_seconds =
            i64::try_from(seconds).map_err(|_| TimestampError::OutOfRange(absolute_ps))?;
        Ok(Self {
            epoch_seconds,
            subsecond_ps: subsecond as i64,
        })
    }

    /// The exact picosecond count this time represents
    pub fn as_picoseconds(&self) -> i128 {
        self.epoch_seconds as i128 * PS_PER_SECOND + self.subsecond_ps as i128
    }

    /// Render to a calendar time at the given offset, truncated to microseconds.
    ///
    /// This is the value stored in the `time` column. Display/storage only.
    pub fn to_primitive(&self, offset: UtcOffset) -> Option<PrimitiveDateTime> {
        let base = OffsetDateTime::from_unix_timestamp(self.epoch_seconds).ok()?;
        let micros = self.subsecond_ps / PS_PER_MICROSECOND;
        let shifted = (base + Duration::microseconds(micros)).to_offset(offset);
        Some(PrimitiveDateTime::new(shifted.date(), shifted.time()))
    }
}

impl std::fmt::Display for AbsoluteTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match OffsetDateTime::from_unix_timestamp(self.epoch_seconds) {
            Ok(t) => write!(
                f,
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:012} UTC",
                t.year(),
                t.month() as u8,
                t.day(),
                t.hour(),
                t.minute(),
                t.second(),
                self.subsecond_ps
            ),
            Err(_) => write!(f, "{}s+{}ps", self.epoch_seconds, self.subsecond_ps),
        }
    }
}

/// Reconstruct the absolute time of an event from the run epoch and its relative timestamp.
///
/// Negative relative timestamps only come from corrupt records and are rejected, never clamped.
pub fn reconstruct(
    epoch: &AcquisitionEpoch,
    relative_timestamp_ps: i64,
) -> Result<AbsoluteTime, TimestampError> {
    if relative_timestamp_ps < 0 {
        return Err(TimestampError::NegativeRelative(relative_timestamp_ps));
    }
    AbsoluteTime::from_picoseconds(epoch.epoch_ps + relative_timestamp_ps as i128)
}
