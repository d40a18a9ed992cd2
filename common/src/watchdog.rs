use crate::types::UnixTime;

/// Requests a reboot once the loaded schedule's validity window has run out.
/// The request latches until the window is extended again.
#[derive(Debug, Clone, Default)]
pub struct StalenessWatchdog {
    tripped: bool,
}

impl StalenessWatchdog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped
    }

    pub fn check(
        &mut self,
        now: UnixTime,
        schedule_loaded: bool,
        valid_until: Option<UnixTime>,
    ) -> bool {
        let Some(valid_until) = valid_until.filter(|_| schedule_loaded) else {
            return false;
        };

        if now < valid_until {
            self.tripped = false;
            return false;
        }

        if self.tripped {
            return false;
        }
        self.tripped = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_when_window_elapses() {
        let mut watchdog = StalenessWatchdog::new();

        assert!(!watchdog.check(999, true, Some(1_000)));
        assert!(watchdog.check(1_000, true, Some(1_000)));
        assert!(!watchdog.check(1_015, true, Some(1_000)));
        assert!(watchdog.is_tripped());
    }

    #[test]
    fn never_fires_without_loaded_schedule() {
        let mut watchdog = StalenessWatchdog::new();

        assert!(!watchdog.check(1_000, false, Some(1_000)));
        assert!(!watchdog.check(5_000, false, None));
        assert!(!watchdog.check(5_000, true, None));
        assert!(!watchdog.is_tripped());
    }

    #[test]
    fn rearms_after_window_is_extended() {
        let mut watchdog = StalenessWatchdog::new();

        assert!(watchdog.check(1_000, true, Some(1_000)));
        assert!(!watchdog.check(1_100, true, Some(2_000)));
        assert!(!watchdog.is_tripped());
        assert!(watchdog.check(2_000, true, Some(2_000)));
    }
}
