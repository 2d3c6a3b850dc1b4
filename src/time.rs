use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Add;

/// Length of one broadcast interval.
pub const SECONDS_PER_INTERVAL: i64 = 60 * 10;
/// Rolling proximity identifiers derived per temporary exposure key, i.e.
/// intervals per day.
pub const IDS_PER_KEY: u32 = 144;

/// The global 10-minute window counter, `unix_seconds / 600`.
///
/// Serialized as an unsigned 32-bit integer; little-endian where it enters
/// key-derivation material.
#[derive(
    Copy, Clone, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(transparent)]
pub struct IntervalNumber(u32);

impl IntervalNumber {
    pub fn new(interval: u32) -> Self {
        Self(interval)
    }

    pub fn from_unix_seconds(seconds: i64) -> Self {
        Self((seconds / SECONDS_PER_INTERVAL) as u32)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// Epoch seconds at which this interval starts.
    pub fn unix_seconds(&self) -> i64 {
        i64::from(self.0) * SECONDS_PER_INTERVAL
    }

    /// Epoch milliseconds at which this interval starts.
    pub fn unix_millis(&self) -> i64 {
        self.unix_seconds() * 1000
    }

    pub fn day_number(&self) -> u32 {
        self.0 / IDS_PER_KEY
    }

    /// Largest day-aligned interval not greater than `self`.
    pub fn floor_to_day(&self) -> Self {
        Self(self.0 - self.0 % IDS_PER_KEY)
    }

    pub fn is_day_aligned(&self) -> bool {
        self.0 % IDS_PER_KEY == 0
    }

    /// Encoding used in the RPI padded-data block.
    pub fn le_bytes(&self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub fn saturating_sub(&self, intervals: u32) -> Self {
        Self(self.0.saturating_sub(intervals))
    }
}

impl From<DateTime<Utc>> for IntervalNumber {
    fn from(utc: DateTime<Utc>) -> Self {
        Self::from_unix_seconds(utc.timestamp())
    }
}

impl Add<u32> for IntervalNumber {
    type Output = IntervalNumber;

    fn add(self, intervals: u32) -> Self::Output {
        IntervalNumber(self.0 + intervals)
    }
}
