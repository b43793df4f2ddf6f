//! Merges polled snapshots and pushed events into one authoritative view
//!
//! Two sources describe the same session. The poll endpoint delivers full
//! snapshots on a timer; the push channel delivers incremental events as they
//! happen. At any instant exactly one of them is authoritative:
//!
//! - **Poll** until the push channel is open *and* has delivered a stateful
//!   event, and again whenever the channel drops.
//! - **Push** from then on. Polled snapshots are discarded unless they carry a
//!   revision newer than anything push has delivered, which means push missed
//!   something; authority then returns to poll until push catches up.
//!
//! Under poll authority a snapshot is still refused if push applied an event
//! at or after the moment the poll request was issued and adopting the
//! snapshot would undo progress (readiness, occupancy or status).
//!
//! Local intents never touch the authoritative copy. They live in a
//! provisional overlay that [`StateReconciler::rendered`] lays over the view
//! until the authority confirms or the command fails.

use log::{debug, info, warn};
use shared::{route, AuthoritativeView, Envelope, RouteError, ServerEvent, SessionConfig, SessionSnapshot};
use std::collections::VecDeque;
use tokio::time::Instant;

use crate::commands::CommandId;
use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    Poll,
    Push,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// Push is authoritative and the snapshot is not newer than push
    Superseded,
    /// The snapshot predates a push event and would undo it
    Stale,
    /// The snapshot belongs to another session
    Mismatch(RouteError),
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Accepted,
    Discarded(DiscardReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Revision at or below the view's revision
    AlreadyReflected,
    /// No view exists yet; held until the first snapshot
    Buffered,
    /// Log lines, acks and errors carry no session state
    Stateless,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    Skipped(SkipReason),
    Rejected(RouteError),
}

/// Optimistic local effect of a pending command
#[derive(Debug, Clone, PartialEq)]
pub enum Provisional {
    Ready { player_id: String, ready: bool },
    Vacate { index: u32 },
    Config(SessionConfig),
}

impl Provisional {
    fn apply(&self, view: &mut AuthoritativeView) {
        match self {
            Provisional::Ready { player_id, ready } => {
                if let Some(index) = view.slot_of(player_id).map(|slot| slot.index) {
                    let _ = view.set_ready(index, *ready);
                }
            }
            Provisional::Vacate { index } => {
                let _ = view.vacate(*index);
            }
            Provisional::Config(config) => view.set_config(config.clone()),
        }
    }

    fn reflected_in(&self, view: &AuthoritativeView) -> bool {
        match self {
            Provisional::Ready { player_id, ready } => view
                .slot_of(player_id)
                .map(|slot| slot.ready == *ready)
                .unwrap_or(true),
            Provisional::Vacate { index } => view
                .slot(*index)
                .map(|slot| !slot.is_occupied())
                .unwrap_or(true),
            Provisional::Config(config) => view.config() == config,
        }
    }
}

struct OverlayEntry {
    id: CommandId,
    effect: Provisional,
    acknowledged: bool,
}

#[derive(Debug, Clone, Copy)]
struct PushMark {
    at: Instant,
    rev: Option<u64>,
}

pub struct StateReconciler {
    session_id: String,
    view: Option<AuthoritativeView>,
    authority: Authority,
    live: bool,
    last_push: Option<PushMark>,
    pending: VecDeque<Envelope>,
    pending_capacity: usize,
    overlay: Vec<OverlayEntry>,
    closed: bool,
}

impl StateReconciler {
    pub fn new(session_id: &str, config: &SyncConfig) -> Self {
        Self {
            session_id: session_id.to_string(),
            view: None,
            authority: Authority::Poll,
            live: false,
            last_push: None,
            pending: VecDeque::new(),
            pending_capacity: config.pending_event_capacity.max(1),
            overlay: Vec::new(),
            closed: false,
        }
    }

    /// The authoritative view, without local provisional effects
    pub fn current(&self) -> Option<&AuthoritativeView> {
        self.view.as_ref()
    }

    /// The authoritative view with the provisional overlay applied
    pub fn rendered(&self) -> Option<AuthoritativeView> {
        let mut view = self.view.clone()?;
        for entry in &self.overlay {
            entry.effect.apply(&mut view);
        }
        Some(view)
    }

    pub fn authority(&self) -> Authority {
        self.authority
    }

    pub fn is_push_authoritative(&self) -> bool {
        self.authority == Authority::Push
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Tracks whether the push channel is open. Dropping it hands authority
    /// back to polling; reopening does not claim authority until an event
    /// arrives.
    pub fn set_live(&mut self, open: bool) {
        self.live = open;
        if !open && self.authority == Authority::Push {
            info!("Push channel down, polling is authoritative");
            self.authority = Authority::Poll;
        }
    }

    /// Offers a polled snapshot. `requested_at` is when the poll request was
    /// issued, which is the snapshot's logical time when it has no revision.
    pub fn apply_snapshot(
        &mut self,
        snapshot: SessionSnapshot,
        requested_at: Instant,
    ) -> SnapshotOutcome {
        if self.closed {
            return SnapshotOutcome::Discarded(DiscardReason::Closed);
        }

        let snapshot_rev = snapshot.revision;
        let base = self.base_view();
        let candidate = match route(&base, &ServerEvent::SessionSnapshot(snapshot)) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!("Ignoring polled snapshot: {}", err);
                return SnapshotOutcome::Discarded(DiscardReason::Mismatch(err));
            }
        };

        let current = match &self.view {
            None => {
                debug!("Bootstrapped view from poll");
                self.install_first(candidate);
                return SnapshotOutcome::Accepted;
            }
            Some(current) => current,
        };

        let push_rev = self.last_push.and_then(|mark| mark.rev);
        let newer_than_push = matches!((snapshot_rev, push_rev), (Some(s), Some(p)) if s > p);

        match self.authority {
            Authority::Push => {
                if !newer_than_push {
                    debug!("Discarding polled snapshot, push is authoritative");
                    return SnapshotOutcome::Discarded(DiscardReason::Superseded);
                }
                info!(
                    "Polled snapshot rev {:?} is ahead of push rev {:?}, polling takes over",
                    snapshot_rev, push_rev
                );
                self.authority = Authority::Poll;
            }
            Authority::Poll => {
                if let Some(mark) = self.last_push {
                    let stale = match (snapshot_rev, mark.rev) {
                        (Some(s), Some(p)) => s < p || (s == p && candidate.rolls_back(current)),
                        _ => mark.at >= requested_at && candidate.rolls_back(current),
                    };
                    if stale {
                        debug!("Discarding polled snapshot that would roll back pushed state");
                        return SnapshotOutcome::Discarded(DiscardReason::Stale);
                    }
                }
            }
        }

        self.view = Some(candidate);
        self.prune_overlay();
        SnapshotOutcome::Accepted
    }

    /// Applies one decoded push event, in delivery order
    pub fn apply_event(&mut self, envelope: &Envelope, now: Instant) -> EventOutcome {
        if self.closed {
            return EventOutcome::Skipped(SkipReason::Closed);
        }
        if !envelope.event.is_stateful() {
            return EventOutcome::Skipped(SkipReason::Stateless);
        }

        let view = match &self.view {
            Some(view) => view,
            None => {
                if matches!(envelope.event, ServerEvent::SessionSnapshot(_)) {
                    let base = AuthoritativeView::new(&self.session_id);
                    return match route(&base, &envelope.event) {
                        Ok(mut first) => {
                            if let Some(rev) = envelope.rev {
                                first.set_revision(rev);
                            }
                            self.mark_push(envelope.rev, now);
                            self.install_first(first);
                            EventOutcome::Applied
                        }
                        Err(err) => EventOutcome::Rejected(err),
                    };
                }
                if self.pending.len() == self.pending_capacity {
                    self.pending.pop_front();
                }
                self.pending.push_back(envelope.clone());
                return EventOutcome::Skipped(SkipReason::Buffered);
            }
        };

        if let (Some(rev), Some(seen)) = (envelope.rev, view.revision()) {
            if rev < seen {
                debug!("Push rev {} lags view rev {}", rev, seen);
                return EventOutcome::Skipped(SkipReason::AlreadyReflected);
            }
            if rev == seen {
                // Push has caught up with the view
                self.mark_push(envelope.rev, now);
                return EventOutcome::Skipped(SkipReason::AlreadyReflected);
            }
        }

        match route(view, &envelope.event) {
            Ok(mut next) => {
                if let Some(rev) = envelope.rev {
                    next.set_revision(rev);
                }
                self.view = Some(next);
                self.mark_push(envelope.rev, now);
                self.prune_overlay();
                EventOutcome::Applied
            }
            Err(err) => {
                warn!("Dropping {} event: {}", envelope.event.kind(), err);
                EventOutcome::Rejected(err)
            }
        }
    }

    /// Shows a command's effect locally until the authority settles it
    pub fn propose(&mut self, id: CommandId, effect: Provisional) {
        if self.closed {
            return;
        }
        self.overlay.retain(|entry| entry.id != id);
        self.overlay.push(OverlayEntry {
            id,
            effect,
            acknowledged: false,
        });
    }

    /// Rolls back a rejected or timed-out command's local effect
    pub fn withdraw(&mut self, id: CommandId) {
        self.overlay.retain(|entry| entry.id != id);
    }

    /// The endpoint accepted the command; its effect stays visible until the
    /// next authoritative update replaces it
    pub fn acknowledge_provisional(&mut self, id: CommandId) {
        for entry in self.overlay.iter_mut().filter(|entry| entry.id == id) {
            entry.acknowledged = true;
        }
    }

    pub fn provisional_len(&self) -> usize {
        self.overlay.len()
    }

    /// Refuses all further input
    pub fn close(&mut self) {
        self.closed = true;
        self.live = false;
        self.authority = Authority::Poll;
        self.pending.clear();
        self.overlay.clear();
    }

    fn base_view(&self) -> AuthoritativeView {
        self.view
            .clone()
            .unwrap_or_else(|| AuthoritativeView::new(&self.session_id))
    }

    fn mark_push(&mut self, rev: Option<u64>, now: Instant) {
        let rev = rev.or(self.last_push.and_then(|mark| mark.rev));
        self.last_push = Some(PushMark { at: now, rev });
        if self.live && self.authority == Authority::Poll {
            info!("Push channel confirmed, push is authoritative");
            self.authority = Authority::Push;
        }
    }

    /// Installs the first view and replays events buffered before it
    fn install_first(&mut self, view: AuthoritativeView) {
        let base_rev = view.revision();
        self.view = Some(view);

        let buffered: Vec<Envelope> = self.pending.drain(..).collect();
        let mut replayed = 0;
        for envelope in buffered {
            let newer = matches!((envelope.rev, base_rev), (Some(e), Some(b)) if e > b);
            if !newer {
                continue;
            }
            let Some(current) = self.view.as_ref() else {
                break;
            };
            match route(current, &envelope.event) {
                Ok(mut next) => {
                    if let Some(rev) = envelope.rev {
                        next.set_revision(rev);
                    }
                    self.view = Some(next);
                    replayed += 1;
                }
                Err(err) => warn!("Dropping buffered {} event: {}", envelope.event.kind(), err),
            }
        }
        if replayed > 0 {
            debug!("Replayed {} buffered event(s) onto first view", replayed);
        }
        self.prune_overlay();
    }

    fn prune_overlay(&mut self) {
        let Some(view) = self.view.as_ref() else {
            return;
        };
        self.overlay
            .retain(|entry| !entry.acknowledged && !entry.effect.reflected_in(view));
    }
}
