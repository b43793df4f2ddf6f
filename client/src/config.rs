//! Timing and capacity settings for a sync session

use std::time::Duration;

/// Liveness ping cadence while the push channel is open
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
/// Silence on the push channel longer than this counts as a lost connection
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(10);
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll cadence while push is not authoritative
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Poll cadence while push is authoritative, when the fallback poll is enabled
pub const DEFAULT_FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_LOG_CAPACITY: usize = 500;
/// Push events held while no view exists yet
pub const DEFAULT_PENDING_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Fraction in `0.0..=1.0` by which a backoff delay may be shortened at random
    pub backoff_jitter: f64,
    /// `None` retries forever
    pub max_reconnect_attempts: Option<u32>,
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    /// `None` stops polling once push is authoritative
    pub fallback_poll_interval: Option<Duration>,
    pub command_timeout: Duration,
    pub debounce: Duration,
    pub log_capacity: usize,
    pub pending_event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
            backoff_jitter: DEFAULT_BACKOFF_JITTER,
            max_reconnect_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            fallback_poll_interval: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            debounce: DEFAULT_DEBOUNCE,
            log_capacity: DEFAULT_LOG_CAPACITY,
            pending_event_capacity: DEFAULT_PENDING_EVENT_CAPACITY,
        }
    }
}

impl SyncConfig {
    /// Same settings without backoff jitter, for reproducible timing
    pub fn deterministic() -> Self {
        Self {
            backoff_jitter: 0.0,
            ..Self::default()
        }
    }

    pub fn with_fallback_poll(mut self) -> Self {
        self.fallback_poll_interval = Some(DEFAULT_FALLBACK_POLL_INTERVAL);
        self
    }
}
