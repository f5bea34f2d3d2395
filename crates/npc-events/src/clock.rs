//! Day-clock types.
//!
//! NPC schedules are expressed as daily time windows; the simulation clock
//! wraps every 24 hours. Times parse from and display as `"HH:MM"` strings
//! so they can be written directly in config files.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Number of minutes in a simulated day.
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// A time of day, stored as minutes past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DayTime(u32);

impl DayTime {
    /// Creates a time of day; minutes wrap modulo one day.
    pub fn from_minutes(minutes: u32) -> Self {
        Self(minutes % MINUTES_PER_DAY)
    }

    /// Creates a time of day from an hour/minute pair.
    pub fn new(hour: u32, minute: u32) -> Self {
        Self::from_minutes(hour * 60 + minute)
    }

    /// Minutes past midnight.
    pub fn minutes(self) -> u32 {
        self.0
    }

    /// Hour component (0..24).
    pub fn hour(self) -> u32 {
        self.0 / 60
    }

    /// Minute component (0..60).
    pub fn minute(self) -> u32 {
        self.0 % 60
    }
}

impl fmt::Display for DayTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// Error parsing a `"HH:MM"` time string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseTimeError {
    /// The string was not of the form `HH:MM`.
    InvalidFormat(String),
    /// Hour or minute was out of range.
    OutOfRange(String),
}

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseTimeError::InvalidFormat(s) => write!(f, "invalid time format: {:?}", s),
            ParseTimeError::OutOfRange(s) => write!(f, "time out of range: {:?}", s),
        }
    }
}

impl std::error::Error for ParseTimeError {}

impl FromStr for DayTime {
    type Err = ParseTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| ParseTimeError::InvalidFormat(s.to_string()))?;
        let hour: u32 = h
            .parse()
            .map_err(|_| ParseTimeError::InvalidFormat(s.to_string()))?;
        let minute: u32 = m
            .parse()
            .map_err(|_| ParseTimeError::InvalidFormat(s.to_string()))?;
        if hour >= 24 || minute >= 60 {
            return Err(ParseTimeError::OutOfRange(s.to_string()));
        }
        Ok(DayTime::new(hour, minute))
    }
}

impl Serialize for DayTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DayTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A daily time window, inclusive of the start and exclusive of the end.
///
/// Windows may wrap past midnight (`start > end`), e.g. `22:00..06:00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DayTime,
    pub end: DayTime,
}

impl TimeRange {
    pub fn new(start: DayTime, end: DayTime) -> Self {
        Self { start, end }
    }

    /// Whether the given time falls within the window.
    pub fn contains(&self, time: DayTime) -> bool {
        if self.start <= self.end {
            time >= self.start && time < self.end
        } else {
            // Wraps midnight
            time >= self.start || time < self.end
        }
    }

    /// Whether the window's start has been reached at the given time.
    ///
    /// Equivalent to `contains` for the common non-wrapping case but reads
    /// better at call sites that gate day-start behavior.
    pub fn started_at(&self, time: DayTime) -> bool {
        self.contains(time)
    }

    /// Whether the window has already closed for the current day.
    ///
    /// A midnight-wrapping window never counts as passed: before its start
    /// the day's opening is still ahead, and after midnight `contains`
    /// already reports it open.
    pub fn passed_today(&self, time: DayTime) -> bool {
        self.start <= self.end && time >= self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
