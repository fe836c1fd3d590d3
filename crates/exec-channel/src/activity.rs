use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_ACTIVITY_INTERVAL: Duration = Duration::from_secs(60);

/// Throttles workspace activity notifications to one per interval.
#[derive(Debug, Clone)]
pub struct ActivityTicker {
    interval: Duration,
    last: Option<Instant>,
}

impl ActivityTicker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// Records activity at `now`; true when a tick should be sent.
    pub fn record(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

impl Default for ActivityTicker {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_INTERVAL)
    }
}
