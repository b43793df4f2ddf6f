//! Turns raw push frames into reconciler input and user-facing notices

use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{decode, Envelope, ServerEvent};
use std::sync::Arc;
use tokio::time::Instant;

use crate::log_buffer::{LogEntry, LogStreamBuffer, Severity};
use crate::reconciler::{EventOutcome, StateReconciler};

/// One-off happenings the rendering side should surface, beyond the view itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Countdown { seconds: u32 },
    Started { session_id: String },
    /// The local participant was removed from the session
    Kicked { reason: String },
    ServerError { code: String, message: String },
    /// The authority refused our credentials; the session cannot continue
    Unauthorized(String),
}

#[derive(Debug)]
pub struct Dispatched {
    pub outcome: EventOutcome,
    pub notices: Vec<Notice>,
}

pub struct Dispatcher {
    player_id: String,
    logs: Arc<Mutex<LogStreamBuffer>>,
    decode_failures: u64,
}

impl Dispatcher {
    pub fn new(player_id: &str, logs: Arc<Mutex<LogStreamBuffer>>) -> Self {
        Self {
            player_id: player_id.to_string(),
            logs,
            decode_failures: 0,
        }
    }

    /// Decodes a frame. Failures are logged and counted, never fatal.
    pub fn decode(&mut self, raw: &str) -> Option<Envelope> {
        match decode(raw) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                self.decode_failures += 1;
                warn!("Discarding frame: {}", e);
                None
            }
        }
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures
    }

    pub fn dispatch(
        &mut self,
        envelope: &Envelope,
        reconciler: &mut StateReconciler,
        now: Instant,
    ) -> Dispatched {
        let own_slot = reconciler
            .current()
            .and_then(|view| view.slot_of(&self.player_id))
            .map(|slot| slot.index);

        let outcome = reconciler.apply_event(envelope, now);
        let applied = outcome == EventOutcome::Applied;
        let mut notices = Vec::new();

        match &envelope.event {
            ServerEvent::LogLine(line) => {
                self.logs.lock().append(LogEntry::from_line(line));
            }
            ServerEvent::Error(err) => {
                self.log(
                    Severity::Error,
                    format!("Server error {}: {}", err.code, err.message),
                );
                if err.is_unauthorized() {
                    notices.push(Notice::Unauthorized(err.message.clone()));
                } else {
                    notices.push(Notice::ServerError {
                        code: err.code.clone(),
                        message: err.message.clone(),
                    });
                }
            }
            ServerEvent::SessionStarting(countdown) if applied => {
                info!("Session starting in {}s", countdown.countdown_seconds);
                self.log(
                    Severity::System,
                    format!("Starting in {} seconds", countdown.countdown_seconds),
                );
                notices.push(Notice::Countdown {
                    seconds: countdown.countdown_seconds,
                });
            }
            ServerEvent::SessionStarted(start) if applied => {
                info!("Session started: {}", start.session_id);
                self.log(Severity::System, "Game started".to_string());
                notices.push(Notice::Started {
                    session_id: start.session_id.clone(),
                });
            }
            ServerEvent::ParticipantKicked(kick) if applied => {
                let targets_me = kick.player_id.as_deref() == Some(self.player_id.as_str())
                    || own_slot == Some(kick.index);
                if targets_me {
                    warn!("Kicked from session: {}", kick.reason);
                    self.log(Severity::System, format!("You were kicked: {}", kick.reason));
                    notices.push(Notice::Kicked {
                        reason: kick.reason.clone(),
                    });
                } else {
                    debug!("Slot {} kicked", kick.index);
                }
            }
            ServerEvent::HeartbeatAck => debug!("Heartbeat acknowledged"),
            _ => {}
        }

        Dispatched {
            outcome,
            notices,
        }
    }

    fn log(&self, severity: Severity, text: String) {
        self.logs.lock().append(LogEntry::new(&text, severity));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use shared::{Kick, SessionSnapshot, Slot};

    fn setup() -> (Dispatcher, StateReconciler, Arc<Mutex<LogStreamBuffer>>) {
        let logs = Arc::new(Mutex::new(LogStreamBuffer::new(10)));
        let dispatcher = Dispatcher::new("alice", logs.clone());
        let mut reconciler = StateReconciler::new("lobby-1", &SyncConfig::default());
        reconciler.apply_snapshot(
            SessionSnapshot {
                session_id: "lobby-1".to_string(),
                slots: vec![Slot::human(0, "bob", "Bob"), Slot::human(1, "alice", "Alice")],
                ..SessionSnapshot::default()
            },
            Instant::now(),
        );
        (dispatcher, reconciler, logs)
    }

    #[test]
    fn test_bad_frames_are_counted_not_fatal() {
        let (mut dispatcher, _, _) = setup();
        assert!(dispatcher.decode("{oops").is_none());
        assert!(dispatcher.decode(r#"{"type":"confetti"}"#).is_none());
        assert!(dispatcher.decode(r#"{"type":"pong"}"#).is_some());
        assert_eq!(dispatcher.decode_failures(), 2);
    }

    #[test]
    fn test_countdown_then_started_notices() {
        let (mut dispatcher, mut reconciler, logs) = setup();
        let now = Instant::now();

        let starting = dispatcher
            .decode(r#"{"type":"session_starting","data":{"countdown_seconds":5}}"#)
            .unwrap();
        let result = dispatcher.dispatch(&starting, &mut reconciler, now);
        assert_eq!(result.notices, vec![Notice::Countdown { seconds: 5 }]);

        let started = dispatcher
            .decode(r#"{"type":"session_started","data":{"session_id":"game-3"}}"#)
            .unwrap();
        let result = dispatcher.dispatch(&started, &mut reconciler, now);
        assert_eq!(
            result.notices,
            vec![Notice::Started {
                session_id: "game-3".to_string()
            }]
        );
        assert_eq!(reconciler.current().unwrap().countdown(), None);
        assert_eq!(logs.lock().len(), 2);
    }

    #[test]
    fn test_log_lines_go_to_buffer_not_view() {
        let (mut dispatcher, mut reconciler, logs) = setup();
        let before = reconciler.current().cloned();

        let line = dispatcher
            .decode(r#"{"type":"log_line","data":{"text":"[WARN] bob is lagging"}}"#)
            .unwrap();
        dispatcher.dispatch(&line, &mut reconciler, Instant::now());

        assert_eq!(reconciler.current().cloned(), before);
        let logs = logs.lock();
        assert_eq!(logs.latest().unwrap().severity, Severity::Warning);
    }

    #[test]
    fn test_kick_of_own_slot_is_flagged() {
        let (mut dispatcher, mut reconciler, logs) = setup();
        let kick = Envelope::new(ServerEvent::ParticipantKicked(Kick {
            index: 1,
            player_id: None,
            reason: "afk".to_string(),
        }));

        let result = dispatcher.dispatch(&kick, &mut reconciler, Instant::now());
        assert_eq!(
            result.notices,
            vec![Notice::Kicked {
                reason: "afk".to_string()
            }]
        );
        assert!(reconciler.current().unwrap().slot_of("alice").is_none());
        assert_eq!(logs.lock().latest().unwrap().severity, Severity::System);
    }

    #[test]
    fn test_kick_of_other_slot_is_silent() {
        let (mut dispatcher, mut reconciler, _) = setup();
        let kick = Envelope::new(ServerEvent::ParticipantKicked(Kick {
            index: 0,
            player_id: Some("bob".to_string()),
            reason: String::new(),
        }));

        let result = dispatcher.dispatch(&kick, &mut reconciler, Instant::now());
        assert!(result.notices.is_empty());
    }

    #[test]
    fn test_unauthorized_error_notice() {
        let (mut dispatcher, mut reconciler, _) = setup();
        let err = dispatcher
            .decode(r#"{"type":"error","data":{"code":"forbidden","message":"not in lobby"}}"#)
            .unwrap();

        let result = dispatcher.dispatch(&err, &mut reconciler, Instant::now());
        assert_eq!(
            result.notices,
            vec![Notice::Unauthorized("not in lobby".to_string())]
        );
    }
}
