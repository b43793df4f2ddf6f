//! Push-channel connection lifecycle as an explicit state machine
//!
//! The machine never performs I/O or reads the clock itself. Callers feed it
//! instants and transport outcomes and execute the [`Action`]s it returns; the
//! async driver in [`crate::network`] does this on tokio, tests do it by hand.
//!
//! ```text
//!   Idle ──open──▶ Connecting ──connected──▶ Open ◀──────────┐
//!                      │                      │ lost/idle     │ connected
//!                      └──failed──▶ Reconnecting ──retry due──┘
//!                                       │
//!  Unauthorized / bad endpoint / retries ▼         close() from any state
//!                                    Failed                 ▼
//!                                                         Closed
//! ```

use log::{debug, info, warn};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    /// Gave up; no further attempts are made
    Failed,
    /// Closed by the caller
    Closed,
}

impl ConnectionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionStatus::Failed | ConnectionStatus::Closed)
    }
}

/// Why the machine ended in [`ConnectionStatus::Failed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Unauthorized,
    /// The endpoint itself is unusable; retrying cannot help
    InvalidEndpoint,
    RetriesExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Consecutive failed attempts since the channel was last open
    pub attempt: u32,
    pub last_error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Idle,
            attempt: 0,
            last_error: None,
            failure: None,
        }
    }
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Open
    }
}

/// Side effects requested by the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start a transport connection attempt
    Dial,
    /// Send a liveness ping on the open link
    Ping,
    /// Discard the current link, if any
    DropLink,
}

/// Exponential backoff with a ceiling and optional downward jitter
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: f64,
}

impl Backoff {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base: config.backoff_base,
            max: config.backoff_max,
            jitter: config.backoff_jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before attempt `attempt` (1-based) without jitter
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter <= 0.0 {
            return ceiling;
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter);
        ceiling.mul_f64(1.0 - spread)
    }
}

pub struct ConnectionMachine {
    state: ConnectionState,
    ping_interval: Duration,
    idle_timeout: Duration,
    backoff: Backoff,
    max_attempts: Option<u32>,
    dialing: bool,
    retry_at: Option<Instant>,
    next_ping: Option<Instant>,
    last_inbound: Option<Instant>,
}

impl ConnectionMachine {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            state: ConnectionState::default(),
            ping_interval: config.ping_interval,
            idle_timeout: config.idle_timeout,
            backoff: Backoff::from_config(config),
            max_attempts: config.max_reconnect_attempts,
            dialing: false,
            retry_at: None,
            next_ping: None,
            last_inbound: None,
        }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status
    }

    /// Idle → Connecting. Has no effect in any other state.
    pub fn open(&mut self) -> Vec<Action> {
        if self.state.status != ConnectionStatus::Idle {
            return Vec::new();
        }
        self.state.status = ConnectionStatus::Connecting;
        self.dialing = true;
        vec![Action::Dial]
    }

    pub fn on_connected(&mut self, now: Instant) -> Vec<Action> {
        if self.state.status.is_terminal() {
            // Close raced the dial; the fresh link is not wanted.
            return vec![Action::DropLink];
        }
        if self.state.attempt > 0 {
            info!("Push channel reopened after {} attempt(s)", self.state.attempt);
        } else {
            info!("Push channel open");
        }
        self.state.status = ConnectionStatus::Open;
        self.state.attempt = 0;
        self.state.last_error = None;
        self.dialing = false;
        self.retry_at = None;
        self.last_inbound = Some(now);
        self.next_ping = Some(now + self.ping_interval);
        Vec::new()
    }

    /// Any inbound traffic proves the link alive
    pub fn on_inbound(&mut self, now: Instant) {
        if self.state.status == ConnectionStatus::Open {
            self.last_inbound = Some(now);
        }
    }

    /// A dial failed or an open link was lost
    pub fn on_disconnect(&mut self, error: &SyncError, now: Instant) -> Vec<Action> {
        if self.state.status.is_terminal() || self.state.status == ConnectionStatus::Idle {
            return Vec::new();
        }

        self.dialing = false;
        self.next_ping = None;
        self.last_inbound = None;
        self.state.last_error = Some(error.to_string());

        match error {
            SyncError::Unauthorized(reason) => {
                warn!("Push channel refused credentials: {}", reason);
                return self.fail(FailureKind::Unauthorized);
            }
            SyncError::InvalidEndpoint(reason) => {
                warn!("Push channel endpoint unusable: {}", reason);
                return self.fail(FailureKind::InvalidEndpoint);
            }
            _ => {}
        }

        self.state.attempt += 1;
        if let Some(max) = self.max_attempts {
            if self.state.attempt > max {
                warn!("Giving up on push channel after {} attempts", max);
                return self.fail(FailureKind::RetriesExhausted);
            }
        }

        let delay = self.backoff.delay(self.state.attempt);
        info!(
            "Push channel lost ({}), retry {} in {:?}",
            error, self.state.attempt, delay
        );
        self.state.status = ConnectionStatus::Reconnecting;
        self.retry_at = Some(now + delay);
        vec![Action::DropLink]
    }

    /// Caller no longer wants the session; terminal
    pub fn close(&mut self) -> Vec<Action> {
        if self.state.status == ConnectionStatus::Closed {
            return Vec::new();
        }
        debug!("Push channel closed by caller");
        self.state.status = ConnectionStatus::Closed;
        self.clear_timers();
        vec![Action::DropLink]
    }

    /// Earliest instant at which [`Self::on_timer`] has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state.status {
            ConnectionStatus::Open => {
                let idle_at = self.last_inbound.map(|at| at + self.idle_timeout);
                match (self.next_ping, idle_at) {
                    (Some(ping), Some(idle)) => Some(ping.min(idle)),
                    (ping, idle) => ping.or(idle),
                }
            }
            ConnectionStatus::Reconnecting if !self.dialing => self.retry_at,
            _ => None,
        }
    }

    pub fn on_timer(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        match self.state.status {
            ConnectionStatus::Open => {
                if let Some(ping_at) = self.next_ping {
                    if ping_at <= now {
                        actions.push(Action::Ping);
                        self.next_ping = Some(now + self.ping_interval);
                    }
                }
                if let Some(last) = self.last_inbound {
                    if last + self.idle_timeout <= now {
                        let silence = now.duration_since(last);
                        let error = SyncError::ConnectionLost(format!(
                            "no traffic for {}s",
                            silence.as_secs()
                        ));
                        actions.extend(self.on_disconnect(&error, now));
                    }
                }
            }
            ConnectionStatus::Reconnecting => {
                if let Some(retry_at) = self.retry_at {
                    if retry_at <= now && !self.dialing {
                        debug!("Reconnect attempt {}", self.state.attempt);
                        self.retry_at = None;
                        self.dialing = true;
                        actions.push(Action::Dial);
                    }
                }
            }
            _ => {}
        }

        actions
    }

    fn fail(&mut self, kind: FailureKind) -> Vec<Action> {
        self.state.status = ConnectionStatus::Failed;
        self.state.failure = Some(kind);
        self.clear_timers();
        vec![Action::DropLink]
    }

    fn clear_timers(&mut self) {
        self.dialing = false;
        self.retry_at = None;
        self.next_ping = None;
        self.last_inbound = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> ConnectionMachine {
        ConnectionMachine::new(&SyncConfig::deterministic())
    }

    fn lost() -> SyncError {
        SyncError::ConnectionLost("reset by peer".to_string())
    }

    #[test]
    fn test_open_then_connected() {
        let mut machine = machine();
        assert_eq!(machine.status(), ConnectionStatus::Idle);

        assert_eq!(machine.open(), vec![Action::Dial]);
        assert_eq!(machine.status(), ConnectionStatus::Connecting);

        machine.on_connected(Instant::now());
        assert_eq!(machine.status(), ConnectionStatus::Open);
        assert_eq!(machine.state().attempt, 0);

        // Second open is a no-op
        assert!(machine.open().is_empty());
    }

    #[test]
    fn test_reconnect_cycle_attempts_increase_then_reset() {
        let mut machine = machine();
        let mut now = Instant::now();
        machine.open();
        machine.on_connected(now);

        let mut observed = vec![machine.status()];
        let mut attempts = Vec::new();

        assert_eq!(machine.on_disconnect(&lost(), now), vec![Action::DropLink]);
        observed.push(machine.status());
        attempts.push(machine.state().attempt);

        for _ in 0..3 {
            now = machine.next_deadline().unwrap();
            assert_eq!(machine.on_timer(now), vec![Action::Dial]);
            assert_eq!(machine.next_deadline(), None, "no timer while dialing");
            machine.on_disconnect(&lost(), now);
            attempts.push(machine.state().attempt);
        }

        assert_eq!(observed, vec![ConnectionStatus::Open, ConnectionStatus::Reconnecting]);
        assert_eq!(attempts, vec![1, 2, 3, 4]);

        now = machine.next_deadline().unwrap();
        machine.on_timer(now);
        machine.on_connected(now);
        assert_eq!(machine.status(), ConnectionStatus::Open);
        assert_eq!(machine.state().attempt, 0);
        assert_eq!(machine.state().last_error, None);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = Backoff::from_config(&SyncConfig::deterministic());
        assert_eq!(backoff.delay(1), Duration::from_millis(500));
        assert_eq!(backoff.delay(2), Duration::from_secs(1));
        assert_eq!(backoff.delay(3), Duration::from_secs(2));
        assert_eq!(backoff.delay(6), Duration::from_secs(10));
        assert_eq!(backoff.delay(60), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_never_exceeds_ceiling() {
        let backoff = Backoff {
            base: Duration::from_millis(500),
            max: Duration::from_secs(10),
            jitter: 0.5,
        };
        for attempt in 1..8 {
            let delay = backoff.delay(attempt);
            assert!(delay <= backoff.ceiling(attempt));
            assert!(delay >= backoff.ceiling(attempt) / 2);
        }
    }

    #[test]
    fn test_retry_waits_for_backoff() {
        let mut machine = machine();
        let start = Instant::now();
        machine.open();
        machine.on_disconnect(&lost(), start);
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);

        assert!(machine.on_timer(start + Duration::from_millis(499)).is_empty());
        assert_eq!(
            machine.on_timer(start + Duration::from_millis(500)),
            vec![Action::Dial]
        );
    }

    #[test]
    fn test_close_is_terminal() {
        let mut machine = machine();
        let now = Instant::now();
        machine.open();
        machine.on_disconnect(&lost(), now);

        assert_eq!(machine.close(), vec![Action::DropLink]);
        assert_eq!(machine.status(), ConnectionStatus::Closed);
        assert_eq!(machine.next_deadline(), None);
        assert!(machine.on_timer(now + Duration::from_secs(60)).is_empty());
        assert!(machine.on_disconnect(&lost(), now).is_empty());
        assert_eq!(machine.on_connected(now), vec![Action::DropLink]);
        assert_eq!(machine.status(), ConnectionStatus::Closed);
    }

    #[test]
    fn test_unauthorized_fails_without_retry() {
        let mut machine = machine();
        machine.open();
        machine.on_disconnect(
            &SyncError::Unauthorized("token expired".to_string()),
            Instant::now(),
        );

        assert_eq!(machine.status(), ConnectionStatus::Failed);
        assert_eq!(machine.state().failure, Some(FailureKind::Unauthorized));
        assert_eq!(machine.next_deadline(), None);
    }

    #[test]
    fn test_invalid_endpoint_fails_without_retry() {
        let mut machine = machine();
        machine.open();
        let actions = machine.on_disconnect(
            &SyncError::InvalidEndpoint("relative URL without a base".to_string()),
            Instant::now(),
        );

        assert_eq!(actions, vec![Action::DropLink]);
        assert_eq!(machine.status(), ConnectionStatus::Failed);
        assert_eq!(machine.state().failure, Some(FailureKind::InvalidEndpoint));
        assert_eq!(machine.state().attempt, 0);
        assert_eq!(machine.next_deadline(), None);
    }

    #[test]
    fn test_retries_are_bounded() {
        let config = SyncConfig {
            max_reconnect_attempts: Some(2),
            ..SyncConfig::deterministic()
        };
        let mut machine = ConnectionMachine::new(&config);
        let mut now = Instant::now();
        machine.open();

        machine.on_disconnect(&lost(), now);
        now = machine.next_deadline().unwrap();
        machine.on_timer(now);
        machine.on_disconnect(&lost(), now);
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);

        now = machine.next_deadline().unwrap();
        machine.on_timer(now);
        machine.on_disconnect(&lost(), now);
        assert_eq!(machine.status(), ConnectionStatus::Failed);
        assert_eq!(machine.state().failure, Some(FailureKind::RetriesExhausted));
    }

    #[test]
    fn test_idle_timeout_after_three_unanswered_pings() {
        let mut machine = machine();
        let mut now = Instant::now();
        machine.open();
        machine.on_connected(now);

        let mut pings = 0;
        while machine.status() == ConnectionStatus::Open {
            now = machine.next_deadline().unwrap();
            for action in machine.on_timer(now) {
                if action == Action::Ping {
                    pings += 1;
                }
            }
        }

        assert_eq!(pings, 3);
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);
        assert_eq!(machine.state().attempt, 1);
        assert!(machine
            .state()
            .last_error
            .as_deref()
            .unwrap()
            .contains("no traffic"));
    }

    #[test]
    fn test_inbound_traffic_defers_idle_timeout() {
        let mut machine = machine();
        let start = Instant::now();
        machine.open();
        machine.on_connected(start);

        machine.on_inbound(start + Duration::from_secs(25));
        machine.on_timer(start + Duration::from_secs(30));
        assert_eq!(machine.status(), ConnectionStatus::Open);

        machine.on_timer(start + Duration::from_secs(55));
        assert_eq!(machine.status(), ConnectionStatus::Reconnecting);
    }
}
