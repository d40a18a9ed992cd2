use chrono::{Offset, Utc};
use chrono_tz::Tz;
use loadctl_common::{Clock, ClockReading};

/// Wall clock read in the configured IANA timezone. Unknown zone names fall
/// back to UTC.
#[derive(Debug, Clone, Copy)]
pub struct TimezoneClock {
    tz: Tz,
}

impl TimezoneClock {
    pub fn new(timezone: &str) -> Self {
        Self {
            tz: timezone.parse().unwrap_or(Tz::UTC),
        }
    }

    pub fn name(&self) -> &'static str {
        self.tz.name()
    }
}

impl Clock for TimezoneClock {
    fn now(&self) -> ClockReading {
        let local = Utc::now().with_timezone(&self.tz);
        ClockReading::from_datetime(&local.with_timezone(&local.offset().fix()))
    }
}
