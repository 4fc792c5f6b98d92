// SPDX-License-Identifier: GPL-2.0-or-later

use serde::{Deserialize, Serialize};
use std::ops::Deref;

pub const MICROSECOND: i64 = 1;
pub const MILLISECOND: i64 = MICROSECOND * 1000;
pub const SECOND: i64 = MILLISECOND * 1000;
pub const MINUTE: i64 = SECOND * 60;

// Microseconds since the start of the presentation.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Micros(i64);

impl Micros {
    #[must_use]
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    pub fn checked_add(&self, duration: DurationMicros) -> Option<Self> {
        Some(Self(self.0.checked_add(*duration)?))
    }

    pub fn checked_sub(&self, other: Self) -> Option<DurationMicros> {
        Some(DurationMicros(self.0.checked_sub(other.0)?))
    }

    // Returns the instant in `timescale` ticks per second.
    #[must_use]
    pub fn as_timescale(&self, timescale: u32) -> i64 {
        micros_to_timescale(self.0, timescale.into())
    }

    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0 / MILLISECOND
    }

    pub const MAX: Micros = Micros(i64::MAX);
}

impl From<i64> for Micros {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl Deref for Micros {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// Microsecond span. `std::time::Duration` is unsigned and the
// pipeline needs signed arithmetic for composition offsets.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DurationMicros(i64);

impl DurationMicros {
    #[must_use]
    pub const fn new(v: i64) -> Self {
        Self(v)
    }

    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        Self(millis * MILLISECOND)
    }

    #[must_use]
    pub fn from_secs(secs: i64) -> Self {
        Self(secs * SECOND)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_add(rhs.0)?))
    }

    pub fn checked_sub(&self, rhs: Self) -> Option<Self> {
        Some(Self(self.0.checked_sub(rhs.0)?))
    }

    pub fn as_u32(&self) -> Result<u32, std::num::TryFromIntError> {
        u32::try_from(self.0)
    }

    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0 / MILLISECOND
    }

    #[must_use]
    pub fn as_timescale(&self, timescale: u32) -> i64 {
        micros_to_timescale(self.0, timescale.into())
    }

    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        #[allow(clippy::as_conversions, clippy::cast_precision_loss)]
        {
            (self.0 as f64) / (SECOND as f64)
        }
    }
}

impl From<i64> for DurationMicros {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

impl From<u32> for DurationMicros {
    fn from(v: u32) -> Self {
        Self(i64::from(v))
    }
}

impl From<Micros> for DurationMicros {
    fn from(time: Micros) -> Self {
        Self(time.0)
    }
}

impl Deref for DurationMicros {
    type Target = i64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for DurationMicros {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// Converts a value in `timescale` ticks per second into microseconds.
// Split into whole seconds and remainder so large inputs don't overflow.
#[must_use]
pub fn timescale_to_micros(value: i64, timescale: i64) -> i64 {
    let secs = value / timescale;
    let dec = value % timescale;
    (secs * SECOND) + (dec * SECOND / timescale)
}

// Converts a value in microseconds into `timescale` ticks per second.
#[must_use]
pub fn micros_to_timescale(value: i64, timescale: i64) -> i64 {
    let secs = value / SECOND;
    let dec = value % SECOND;
    (secs * timescale) + (dec * timescale / SECOND)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(90000, 90000, 1_000_000; "one second")]
    #[test_case(3000, 90000, 33_333; "one frame")]
    #[test_case(48048, 48000, 1_001_000; "audio")]
    #[test_case(90000 * 86400 * 30, 90000, 1_000_000 * 86400 * 30; "30 days")]
    fn test_timescale_to_micros(input: i64, scale: i64, want: i64) {
        assert_eq!(want, timescale_to_micros(input, scale));
    }

    #[test_case(1_000_000, 90000, 90000; "one second")]
    #[test_case(33_333, 90000, 2999; "one frame rounds down")]
    #[test_case(1_000_000 * 86400 * 30, 1000, 1000 * 86400 * 30; "30 days in millis")]
    fn test_micros_to_timescale(input: i64, scale: i64, want: i64) {
        assert_eq!(want, micros_to_timescale(input, scale));
    }

    #[test]
    fn test_round_trip() {
        let micros = timescale_to_micros(123_000, 90000);
        assert_eq!(123_000, micros_to_timescale(micros, 90000));
    }
}
