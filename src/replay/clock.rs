//! The `(playStart, origStart, speed)` triple that maps original capture
//! timestamps onto replay wall-clock times (spec §4.E, §9).

use std::time::{Duration, Instant};

/// Shared by every worker in one replay run. Built once by the scheduler
/// from the smallest `firstTs` across all session files, then handed out
/// as `Arc<VirtualClock>` — read-only after construction (spec §5).
#[derive(Debug)]
pub struct VirtualClock {
    play_start: Instant,
    orig_start: i64,
    speed: f64,
}

impl VirtualClock {
    pub fn new(orig_start: i64, speed: f64) -> Self {
        Self {
            play_start: Instant::now(),
            orig_start,
            speed,
        }
    }

    /// `speed <= 0` disables pacing entirely (spec §4.E).
    pub fn paced(&self) -> bool {
        self.speed > 0.0
    }

    /// The wall-clock instant at which `event_ts_ms` should be submitted,
    /// or `None` when pacing is disabled.
    pub fn scheduled_at(&self, event_ts_ms: i64) -> Option<Instant> {
        if !self.paced() {
            return None;
        }
        let delta_ms = (event_ts_ms - self.orig_start) as f64 / self.speed;
        if delta_ms <= 0.0 {
            Some(self.play_start)
        } else {
            Some(self.play_start + Duration::from_secs_f64(delta_ms / 1000.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpaced_clock_has_no_schedule() {
        let clock = VirtualClock::new(1_000, 0.0);
        assert!(!clock.paced());
        assert!(clock.scheduled_at(5_000).is_none());
    }

    #[test]
    fn events_at_orig_start_schedule_immediately() {
        let clock = VirtualClock::new(1_000, 1.0);
        let scheduled = clock.scheduled_at(1_000).unwrap();
        assert!(scheduled <= Instant::now());
    }

    #[test]
    fn double_speed_halves_the_scheduled_offset() {
        let clock = VirtualClock::new(0, 2.0);
        let at_1x = clock.scheduled_at(1_000).unwrap();
        let clock_1x = VirtualClock::new(0, 1.0);
        let at_2x_equivalent = clock_1x.scheduled_at(500).unwrap();
        // Both should land the same ~250ms after play_start (within test jitter).
        let diff = if at_1x > at_2x_equivalent {
            at_1x - at_2x_equivalent
        } else {
            at_2x_equivalent - at_1x
        };
        assert!(diff < Duration::from_millis(50));
    }
}
