use std::time::Duration;
use tokio::time::Instant;

use crate::config::SyncConfig;

/// Decides when the next snapshot poll is due. At most one poll is in
/// flight; polling pauses while push is authoritative unless a fallback
/// interval is configured.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    interval: Duration,
    fallback: Option<Duration>,
    last_started: Option<Instant>,
    in_flight: bool,
}

impl PollSchedule {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            interval: config.poll_interval,
            fallback: config.fallback_poll_interval,
            last_started: None,
            in_flight: false,
        }
    }

    pub fn next_due(&self, now: Instant, push_authoritative: bool) -> Option<Instant> {
        if self.in_flight {
            return None;
        }
        let interval = if push_authoritative {
            self.fallback?
        } else {
            self.interval
        };
        Some(match self.last_started {
            Some(started) => started + interval,
            None => now,
        })
    }

    pub fn begin(&mut self, now: Instant) {
        self.in_flight = true;
        self.last_started = Some(now);
    }

    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }
}
