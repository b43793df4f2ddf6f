//! Outbound user intents and their in-flight bookkeeping
//!
//! The submitter only tracks commands; sending them is the session's job. A
//! command leaves the pending set when it is acknowledged (by the endpoint, a
//! matching push event, or the view reflecting it), rejected, or timed out.

use log::{debug, warn};
use serde_json::{json, Value};
use shared::{AuthoritativeView, ServerEvent, Session, SessionConfig, SessionStatus};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::reconciler::Provisional;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    SetReady,
    Kick,
    UpdateConfig,
    Start,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandKind::SetReady => "set-ready",
            CommandKind::Kick => "kick",
            CommandKind::UpdateConfig => "update-config",
            CommandKind::Start => "start",
        };
        f.write_str(name)
    }
}

/// Something the local participant asks the authority to do
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    SetReady { ready: bool },
    Kick { slot: u32 },
    UpdateConfig(SessionConfig),
    Start,
}

impl Intent {
    pub fn kind(&self) -> CommandKind {
        match self {
            Intent::SetReady { .. } => CommandKind::SetReady,
            Intent::Kick { .. } => CommandKind::Kick,
            Intent::UpdateConfig(_) => CommandKind::UpdateConfig,
            Intent::Start => CommandKind::Start,
        }
    }

    pub fn target(&self, session: &Session) -> CommandTarget {
        match self {
            Intent::SetReady { .. } => CommandTarget::Participant(session.player_id.clone()),
            Intent::Kick { slot } => CommandTarget::Slot(*slot),
            Intent::UpdateConfig(_) | Intent::Start => {
                CommandTarget::Session(session.session_id.clone())
            }
        }
    }

    /// Last path segment of the REST command endpoint
    pub fn action(&self) -> &'static str {
        match self {
            Intent::SetReady { .. } => "ready",
            Intent::Kick { .. } => "kick",
            Intent::UpdateConfig(_) => "config",
            Intent::Start => "start",
        }
    }

    /// JSON body for the REST command endpoint
    pub fn body(&self) -> Value {
        match self {
            Intent::SetReady { ready } => json!({ "ready": ready }),
            Intent::Kick { slot } => json!({ "slot": slot }),
            Intent::UpdateConfig(config) => json!(config),
            Intent::Start => json!({}),
        }
    }

    /// Optimistic local effect shown until the authority answers
    pub fn provisional(&self, player_id: &str) -> Option<Provisional> {
        match self {
            Intent::SetReady { ready } => Some(Provisional::Ready {
                player_id: player_id.to_string(),
                ready: *ready,
            }),
            Intent::Kick { slot } => Some(Provisional::Vacate { index: *slot }),
            Intent::UpdateConfig(config) => Some(Provisional::Config(config.clone())),
            Intent::Start => None,
        }
    }

    /// Whether `event` carries the effect of this intent
    fn acknowledged_by(&self, event: &ServerEvent, own_slot: Option<u32>) -> bool {
        match (self, event) {
            (Intent::SetReady { ready }, ServerEvent::ReadinessChanged(change)) => {
                own_slot == Some(change.index) && change.ready == *ready
            }
            (Intent::Kick { slot }, ServerEvent::ParticipantLeft(departure)) => {
                departure.index == *slot
            }
            (Intent::Kick { slot }, ServerEvent::ParticipantKicked(kick)) => kick.index == *slot,
            (Intent::UpdateConfig(_), ServerEvent::ConfigChanged(_)) => true,
            (Intent::Start, ServerEvent::SessionStarting(_))
            | (Intent::Start, ServerEvent::SessionStarted(_)) => true,
            _ => false,
        }
    }

    fn reflected_in(&self, view: &AuthoritativeView, player_id: &str) -> bool {
        match self {
            Intent::SetReady { ready } => view
                .slot_of(player_id)
                .map(|slot| slot.ready == *ready)
                .unwrap_or(false),
            Intent::Kick { slot } => view
                .slot(*slot)
                .map(|seat| !seat.is_occupied())
                .unwrap_or(true),
            Intent::UpdateConfig(config) => view.config() == config,
            Intent::Start => view.status() >= SessionStatus::Starting,
        }
    }
}

/// What a command acts upon; identical commands share kind and target
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandTarget {
    Participant(String),
    Slot(u32),
    Session(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub id: CommandId,
    pub intent: Intent,
    pub target: CommandTarget,
    pub submitted_at: Instant,
}

impl PendingCommand {
    pub fn kind(&self) -> CommandKind {
        self.intent.kind()
    }
}

pub struct CommandSubmitter {
    session: Session,
    timeout: Duration,
    debounce: Duration,
    next_id: u64,
    pending: Vec<PendingCommand>,
    last_submitted: HashMap<(CommandKind, CommandTarget), Instant>,
}

impl CommandSubmitter {
    pub fn new(session: &Session, config: &SyncConfig) -> Self {
        Self {
            session: session.clone(),
            timeout: config.command_timeout,
            debounce: config.debounce,
            next_id: 1,
            pending: Vec::new(),
            last_submitted: HashMap::new(),
        }
    }

    /// Registers a new command, or refuses it if an identical one is in
    /// flight or was submitted within the debounce window
    pub fn submit(&mut self, intent: Intent, now: Instant) -> Result<PendingCommand, SyncError> {
        let kind = intent.kind();
        let target = intent.target(&self.session);
        let key = (kind, target.clone());

        if self
            .pending
            .iter()
            .any(|pending| pending.kind() == kind && pending.target == target)
        {
            debug!("Refusing {} for {:?}: already in flight", kind, target);
            return Err(SyncError::AlreadyPending(kind));
        }
        if let Some(previous) = self.last_submitted.get(&key) {
            if now.duration_since(*previous) < self.debounce {
                debug!("Refusing {} for {:?}: debounced", kind, target);
                return Err(SyncError::AlreadyPending(kind));
            }
        }

        let command = PendingCommand {
            id: CommandId(self.next_id),
            intent,
            target,
            submitted_at: now,
        };
        self.next_id += 1;
        self.last_submitted.insert(key, now);
        self.pending.push(command.clone());
        debug!("Submitted {} {}", command.kind(), command.id);
        Ok(command)
    }

    /// Clears a command after its ack or rejection arrived
    pub fn settle(&mut self, id: CommandId) -> Option<PendingCommand> {
        let position = self.pending.iter().position(|pending| pending.id == id)?;
        Some(self.pending.remove(position))
    }

    /// Removes and returns every command whose acknowledgment is overdue
    pub fn expire(&mut self, now: Instant) -> Vec<PendingCommand> {
        let timeout = self.timeout;
        let (expired, live): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|pending| pending.submitted_at + timeout <= now);
        self.pending = live;
        for command in &expired {
            warn!(
                "{} {} got no acknowledgment within {:?}",
                command.kind(),
                command.id,
                timeout
            );
        }
        expired
    }

    /// Settles commands whose effect a push event carries
    pub fn acknowledged_by_event(
        &mut self,
        event: &ServerEvent,
        view: Option<&AuthoritativeView>,
    ) -> Vec<PendingCommand> {
        let own_slot = view
            .and_then(|view| view.slot_of(&self.session.player_id))
            .map(|slot| slot.index);
        self.take_where(|intent| intent.acknowledged_by(event, own_slot))
    }

    /// Settles commands the authoritative view already reflects
    pub fn confirmed_by_view(&mut self, view: &AuthoritativeView) -> Vec<PendingCommand> {
        let player_id = self.session.player_id.clone();
        self.take_where(|intent| intent.reflected_in(view, &player_id))
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .iter()
            .map(|pending| pending.submitted_at + self.timeout)
            .min()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_pending(&self, id: CommandId) -> bool {
        self.pending.iter().any(|pending| pending.id == id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take_where<F>(&mut self, mut matches: F) -> Vec<PendingCommand>
    where
        F: FnMut(&Intent) -> bool,
    {
        let (settled, live): (Vec<_>, Vec<_>) = self
            .pending
            .drain(..)
            .partition(|pending| matches(&pending.intent));
        self.pending = live;
        settled
    }
}
