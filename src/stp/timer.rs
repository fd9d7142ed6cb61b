//! Restartable one-shot timer driven by the bridge's tick thread. A timer
//! is due when `started + period <= now`; the callback re-arms it.

use std::time::{Duration, Instant};

pub struct Timer {
    period: Duration,
    started: Option<Instant>,
}

impl Timer {
    pub fn new(period: Duration) -> Self {
        Timer {
            period,
            started: None,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.started = Some(now);
    }

    pub fn stop(&mut self) {
        self.started = None;
    }

    pub fn is_running(&self) -> bool {
        self.started.is_some()
    }

    /// True when the timer is running and its period has elapsed.
    pub fn due(&self, now: Instant) -> bool {
        match self.started {
            Some(t) => now.duration_since(t) >= self.period,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_after_period_and_rearms() {
        let now = Instant::now();
        let mut timer = Timer::new(Duration::from_millis(100));
        assert!(!timer.due(now));

        timer.start(now);
        assert!(!timer.due(now));
        assert!(timer.due(now + Duration::from_millis(100)));

        timer.start(now + Duration::from_millis(100));
        assert!(!timer.due(now + Duration::from_millis(150)));
        assert!(timer.due(now + Duration::from_millis(200)));

        timer.stop();
        assert!(!timer.due(now + Duration::from_secs(10)));
        assert!(!timer.is_running());
    }
}
