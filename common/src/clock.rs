use chrono::{DateTime, TimeZone, Timelike};

use crate::types::UnixTime;

/// 2020-01-01T00:00:00Z. Readings earlier than this come from a clock that
/// has not been synchronized yet.
const PLAUSIBLE_EPOCH: UnixTime = 1_577_836_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockReading {
    pub unix: UnixTime,
    pub hour: u8,
    pub minute: u8,
}

impl ClockReading {
    pub fn from_datetime<Tz: TimeZone>(now: &DateTime<Tz>) -> Self {
        Self {
            unix: now.timestamp(),
            hour: now.hour() as u8,
            minute: now.minute() as u8,
        }
    }

    pub fn is_plausible(&self) -> bool {
        self.unix >= PLAUSIBLE_EPOCH
    }

    pub fn local_time(&self) -> String {
        format!("{:02}:{:02}", self.hour, self.minute)
    }
}

pub trait Clock {
    fn now(&self) -> ClockReading;
}
