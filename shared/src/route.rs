//! Pure reducer from (view, event) to the next view

use thiserror::Error;

use crate::protocol::ServerEvent;
use crate::view::AuthoritativeView;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("slot {0} does not exist")]
    UnknownSlot(u32),
    #[error("slot {0} is empty")]
    EmptySlot(u32),
    #[error("slot index {0} is out of range")]
    SlotOutOfRange(u32),
    #[error("snapshot belongs to session `{got}`, expected `{expected}`")]
    SessionMismatch { expected: String, got: String },
}

/// Applies one event to a view, producing the next view
///
/// On error the input view is untouched. Events that carry no session state
/// (log lines, heartbeat acks, errors) return an unchanged copy.
pub fn route(view: &AuthoritativeView, event: &ServerEvent) -> Result<AuthoritativeView, RouteError> {
    let mut next = view.clone();

    match event {
        ServerEvent::SessionSnapshot(snapshot) => {
            if !snapshot.session_id.is_empty()
                && !view.session_id().is_empty()
                && snapshot.session_id != view.session_id()
            {
                return Err(RouteError::SessionMismatch {
                    expected: view.session_id().to_string(),
                    got: snapshot.session_id.clone(),
                });
            }
            let mut snapshot = snapshot.clone();
            if snapshot.session_id.is_empty() {
                snapshot.session_id = view.session_id().to_string();
            }
            next = AuthoritativeView::from_snapshot(snapshot);
            if next.revision().is_none() {
                if let Some(revision) = view.revision() {
                    next.set_revision(revision);
                }
            }
        }
        ServerEvent::SlotUpdated(slot) | ServerEvent::ParticipantJoined(slot) => {
            next.place(slot.clone())?;
        }
        ServerEvent::ParticipantLeft(departure) => {
            next.vacate(departure.index)?;
        }
        ServerEvent::ParticipantKicked(kick) => {
            next.vacate(kick.index)?;
        }
        ServerEvent::ReadinessChanged(change) => {
            next.set_ready(change.index, change.ready)?;
        }
        ServerEvent::ConfigChanged(config) => {
            next.set_config(config.clone());
        }
        ServerEvent::SessionStarting(countdown) => {
            next.begin_countdown(countdown.countdown_seconds);
        }
        ServerEvent::SessionStarted(start) => {
            next.mark_started(&start.session_id);
        }
        ServerEvent::LogLine(_) | ServerEvent::HeartbeatAck | ServerEvent::Error(_) => {}
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Countdown, Departure, Kick, ReadinessChange, SessionStart};
    use crate::view::{SessionConfig, SessionSnapshot, SessionStatus, Slot, SlotKind};

    fn lobby(slots: Vec<Slot>) -> AuthoritativeView {
        AuthoritativeView::from_snapshot(SessionSnapshot {
            session_id: "lobby-1".to_string(),
            slots,
            ..SessionSnapshot::default()
        })
    }

    fn assert_invariants(view: &AuthoritativeView) {
        for (position, slot) in view.slots().iter().enumerate() {
            assert_eq!(slot.index as usize, position, "slot indices must be contiguous");
        }

        let mut participants: Vec<&str> = view
            .slots()
            .iter()
            .filter_map(|slot| slot.player_id.as_deref())
            .collect();
        let total = participants.len();
        participants.sort();
        participants.dedup();
        assert_eq!(participants.len(), total, "participant seated twice");

        let expected = view
            .slots()
            .iter()
            .filter(|slot| slot.kind == SlotKind::Human && slot.ready)
            .count();
        assert_eq!(view.ready_count(), expected);
    }

    #[test]
    fn test_readiness_scenario() {
        let mut seat = Slot::human(0, "alice", "Alice");
        seat.ready = false;
        let view = lobby(vec![seat]);

        let next = route(
            &view,
            &ServerEvent::ReadinessChanged(ReadinessChange {
                index: 0,
                ready: true,
            }),
        )
        .unwrap();

        assert_eq!(next.ready_count(), 1);
        assert_eq!(next.status(), SessionStatus::Waiting);
    }

    #[test]
    fn test_slot_update_for_unseen_index_extends_view() {
        let view = lobby(vec![Slot::human(0, "alice", "Alice")]);

        let next = route(&view, &ServerEvent::SlotUpdated(Slot::human(4, "bob", "Bob"))).unwrap();

        assert_eq!(next.slots().len(), 5);
        assert_eq!(next.slot(4).unwrap().player_id.as_deref(), Some("bob"));
        assert_invariants(&next);
    }

    #[test]
    fn test_slot_update_is_full_overwrite() {
        let mut seat = Slot::human(0, "alice", "Alice");
        seat.ready = true;
        seat.is_host = true;
        let view = lobby(vec![seat]);

        let replacement = Slot::human(0, "alice", "Alice");
        let next = route(&view, &ServerEvent::SlotUpdated(replacement.clone())).unwrap();

        assert_eq!(next.slot(0), Some(&replacement));
        assert!(!next.slot(0).unwrap().is_host);
    }

    #[test]
    fn test_readiness_on_empty_slot_leaves_view_unchanged() {
        let view = lobby(vec![Slot::empty(0)]);
        let event = ServerEvent::ReadinessChanged(ReadinessChange {
            index: 0,
            ready: true,
        });

        assert_eq!(route(&view, &event), Err(RouteError::EmptySlot(0)));
        assert_eq!(view.ready_count(), 0);
    }

    #[test]
    fn test_departure_and_kick_vacate() {
        let view = lobby(vec![
            Slot::human(0, "alice", "Alice"),
            Slot::human(1, "bob", "Bob"),
        ]);

        let next = route(
            &view,
            &ServerEvent::ParticipantLeft(Departure {
                index: 0,
                player_id: Some("alice".to_string()),
            }),
        )
        .unwrap();
        let next = route(
            &next,
            &ServerEvent::ParticipantKicked(Kick {
                index: 1,
                player_id: Some("bob".to_string()),
                reason: "afk".to_string(),
            }),
        )
        .unwrap();

        assert_eq!(next.occupied_count(), 0);
        assert_eq!(next.slots().len(), 2);
    }

    #[test]
    fn test_countdown_then_started() {
        let view = lobby(vec![]);
        let starting = route(
            &view,
            &ServerEvent::SessionStarting(Countdown {
                countdown_seconds: 5,
            }),
        )
        .unwrap();
        assert_eq!(starting.status(), SessionStatus::Starting);
        assert_eq!(starting.countdown(), Some(5));

        let started = route(
            &starting,
            &ServerEvent::SessionStarted(SessionStart {
                session_id: "game-1".to_string(),
            }),
        )
        .unwrap();
        assert_eq!(started.status(), SessionStatus::InProgress);
        assert_eq!(started.countdown(), None);
        assert_eq!(started.started_session(), Some("game-1"));
    }

    #[test]
    fn test_snapshot_for_other_session_is_rejected() {
        let view = lobby(vec![]);
        let other = SessionSnapshot {
            session_id: "lobby-2".to_string(),
            ..SessionSnapshot::default()
        };

        assert!(matches!(
            route(&view, &ServerEvent::SessionSnapshot(other)),
            Err(RouteError::SessionMismatch { .. })
        ));
    }

    #[test]
    fn test_config_changed() {
        let view = lobby(vec![]);
        let mut config = SessionConfig::default();
        config.traitor_count = 3;

        let next = route(&view, &ServerEvent::ConfigChanged(config.clone())).unwrap();
        assert_eq!(next.config(), &config);
    }

    #[test]
    fn test_invariants_hold_over_long_event_sequence() {
        let players = ["alice", "bob", "carol", "dave", "erin"];
        let mut view = lobby(vec![]);
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;

        for _ in 0..2_000 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;

            let index = (seed % 10) as u32;
            let player = players[((seed >> 8) % players.len() as u64) as usize];
            let event = match (seed >> 16) % 5 {
                0 => ServerEvent::ParticipantJoined(Slot::human(index, player, player)),
                1 => ServerEvent::SlotUpdated(Slot::automated(index, "bot")),
                2 => ServerEvent::ParticipantLeft(Departure {
                    index,
                    player_id: None,
                }),
                _ => ServerEvent::ReadinessChanged(ReadinessChange {
                    index,
                    ready: (seed >> 24) % 2 == 0,
                }),
            };

            if let Ok(next) = route(&view, &event) {
                view = next;
            }
            assert_invariants(&view);
        }
    }
}
