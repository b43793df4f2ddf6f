//! Session state as reported by the remote authority
//!
//! [`SessionSnapshot`] is the wire shape delivered by both the poll endpoint and
//! the `session_snapshot` push event. [`AuthoritativeView`] is the normalized form
//! the client keeps: slot indices are unique and contiguous `0..N`, a participant
//! occupies at most one slot, and the ready count is always derived from slots.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::route::RouteError;

/// Hard upper bound on slot indices accepted from the wire
pub const MAX_SLOTS: u32 = 64;

pub const DEFAULT_PLAYER_COUNT: u32 = 8;
pub const DEFAULT_TRAITOR_COUNT: u32 = 2;
pub const DEFAULT_DISCUSSION_SECONDS: u32 = 120;
pub const DEFAULT_VOTING_SECONDS: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    #[default]
    Empty,
    Human,
    #[serde(alias = "ai", alias = "bot")]
    Automated,
}

/// One fixed-index seat in a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    #[serde(alias = "idx")]
    pub index: u32,
    #[serde(default, alias = "type")]
    pub kind: SlotKind,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub is_host: bool,
    #[serde(default)]
    pub player_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Slot {
    pub fn empty(index: u32) -> Self {
        Self {
            index,
            kind: SlotKind::Empty,
            ready: false,
            connected: false,
            is_host: false,
            player_id: None,
            name: None,
        }
    }

    pub fn human(index: u32, player_id: &str, name: &str) -> Self {
        Self {
            index,
            kind: SlotKind::Human,
            ready: false,
            connected: true,
            is_host: false,
            player_id: Some(player_id.to_string()),
            name: Some(name.to_string()),
        }
    }

    pub fn automated(index: u32, name: &str) -> Self {
        Self {
            index,
            kind: SlotKind::Automated,
            ready: true,
            connected: true,
            is_host: false,
            player_id: None,
            name: Some(name.to_string()),
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.kind != SlotKind::Empty
    }

    /// Only ready humans count towards the lobby's ready total
    pub fn counts_as_ready(&self) -> bool {
        self.kind == SlotKind::Human && self.ready
    }

    /// Empty seats never carry participant data
    fn scrubbed(mut self) -> Self {
        if self.kind == SlotKind::Empty {
            let index = self.index;
            self = Slot::empty(index);
        }
        self
    }
}

/// Session lifecycle, ordered by progression
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    #[serde(alias = "lobby")]
    Waiting,
    #[serde(alias = "countdown")]
    Starting,
    #[serde(alias = "in-progress", alias = "playing", alias = "active")]
    InProgress,
    #[serde(alias = "finished")]
    Ended,
}

/// Lobby settings editable by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_player_count")]
    pub player_count: u32,
    #[serde(default = "default_traitor_count")]
    pub traitor_count: u32,
    #[serde(default = "default_discussion_seconds")]
    pub discussion_seconds: u32,
    #[serde(default = "default_voting_seconds")]
    pub voting_seconds: u32,
    /// Named rule toggles, e.g. `reveal_roles_on_death`
    #[serde(default)]
    pub rules: BTreeMap<String, bool>,
}

fn default_player_count() -> u32 {
    DEFAULT_PLAYER_COUNT
}

fn default_traitor_count() -> u32 {
    DEFAULT_TRAITOR_COUNT
}

fn default_discussion_seconds() -> u32 {
    DEFAULT_DISCUSSION_SECONDS
}

fn default_voting_seconds() -> u32 {
    DEFAULT_VOTING_SECONDS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            player_count: DEFAULT_PLAYER_COUNT,
            traitor_count: DEFAULT_TRAITOR_COUNT,
            discussion_seconds: DEFAULT_DISCUSSION_SECONDS,
            voting_seconds: DEFAULT_VOTING_SECONDS,
            rules: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn rule(&self, name: &str) -> bool {
        self.rules.get(name).copied().unwrap_or(false)
    }
}

/// Full session state as transmitted by the authority
///
/// A transmitted `ready_count` is deliberately not modelled; unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default, alias = "lobby_id", alias = "game_id")]
    pub session_id: String,
    #[serde(default)]
    pub slots: Vec<Slot>,
    #[serde(default)]
    pub status: SessionStatus,
    #[serde(default)]
    pub config: SessionConfig,
    #[serde(default)]
    pub countdown_seconds: Option<u32>,
    #[serde(default)]
    pub started_session_id: Option<String>,
    #[serde(default, alias = "rev", skip_serializing_if = "Option::is_none")]
    pub revision: Option<u64>,
}

/// The reconciled state consumers read
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AuthoritativeView {
    session_id: String,
    slots: Vec<Slot>,
    status: SessionStatus,
    config: SessionConfig,
    countdown: Option<u32>,
    started_session: Option<String>,
    revision: Option<u64>,
}

impl AuthoritativeView {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            ..Self::default()
        }
    }

    /// Builds a normalized view from a wire snapshot
    ///
    /// Slots are sorted by index, gaps are filled with empty seats, a repeated index
    /// keeps the later record, and a participant listed twice keeps only the lowest
    /// seat. Indices at or beyond [`MAX_SLOTS`] are dropped.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        let mut by_index: BTreeMap<u32, Slot> = BTreeMap::new();
        for slot in snapshot.slots {
            if slot.index < MAX_SLOTS {
                by_index.insert(slot.index, slot.scrubbed());
            }
        }

        let len = by_index.keys().next_back().map(|max| max + 1).unwrap_or(0);
        let mut slots: Vec<Slot> = (0..len)
            .map(|index| by_index.remove(&index).unwrap_or_else(|| Slot::empty(index)))
            .collect();

        let mut seen = HashSet::new();
        for slot in slots.iter_mut() {
            if let Some(player_id) = &slot.player_id {
                if !seen.insert(player_id.clone()) {
                    *slot = Slot::empty(slot.index);
                }
            }
        }

        let countdown = match snapshot.status {
            SessionStatus::Starting => snapshot.countdown_seconds,
            _ => None,
        };

        Self {
            session_id: snapshot.session_id,
            slots,
            status: snapshot.status,
            config: snapshot.config,
            countdown,
            started_session: snapshot.started_session_id,
            revision: snapshot.revision,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn slot(&self, index: u32) -> Option<&Slot> {
        self.slots.get(index as usize)
    }

    pub fn slot_of(&self, player_id: &str) -> Option<&Slot> {
        self.slots
            .iter()
            .find(|slot| slot.player_id.as_deref() == Some(player_id))
    }

    pub fn host(&self) -> Option<&Slot> {
        self.slots.iter().find(|slot| slot.is_host && slot.is_occupied())
    }

    pub fn is_host(&self, player_id: &str) -> bool {
        self.slot_of(player_id).map(|slot| slot.is_host).unwrap_or(false)
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn countdown(&self) -> Option<u32> {
        self.countdown
    }

    pub fn started_session(&self) -> Option<&str> {
        self.started_session.as_deref()
    }

    pub fn revision(&self) -> Option<u64> {
        self.revision
    }

    /// Number of ready, human-occupied slots
    pub fn ready_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.counts_as_ready()).count()
    }

    pub fn human_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.kind == SlotKind::Human)
            .count()
    }

    pub fn occupied_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_occupied()).count()
    }

    pub fn all_ready(&self) -> bool {
        self.human_count() > 0 && self.ready_count() == self.human_count()
    }

    /// True if adopting `self` in place of `current` would undo progress:
    /// a status moving backwards, a seat being emptied, or a seated
    /// participant losing readiness.
    pub fn rolls_back(&self, current: &AuthoritativeView) -> bool {
        if self.status < current.status {
            return true;
        }

        current.slots.iter().any(|seen| match self.slot(seen.index) {
            None => seen.is_occupied(),
            Some(next) => {
                (seen.is_occupied() && !next.is_occupied())
                    || (seen.ready && !next.ready && seen.player_id == next.player_id)
            }
        })
    }

    /// Overwrites a slot with a full record, growing the seat list if the
    /// index has not been seen yet. Any other seat held by the same
    /// participant is vacated.
    pub fn place(&mut self, slot: Slot) -> Result<(), RouteError> {
        if slot.index >= MAX_SLOTS {
            return Err(RouteError::SlotOutOfRange(slot.index));
        }

        let slot = slot.scrubbed();
        while self.slots.len() <= slot.index as usize {
            let index = self.slots.len() as u32;
            self.slots.push(Slot::empty(index));
        }

        if let Some(player_id) = &slot.player_id {
            for other in self.slots.iter_mut() {
                if other.index != slot.index && other.player_id.as_ref() == Some(player_id) {
                    *other = Slot::empty(other.index);
                }
            }
        }

        let index = slot.index as usize;
        self.slots[index] = slot;
        Ok(())
    }

    pub fn vacate(&mut self, index: u32) -> Result<(), RouteError> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(RouteError::UnknownSlot(index))?;
        *slot = Slot::empty(index);
        Ok(())
    }

    pub fn set_ready(&mut self, index: u32, ready: bool) -> Result<(), RouteError> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(RouteError::UnknownSlot(index))?;
        if !slot.is_occupied() {
            return Err(RouteError::EmptySlot(index));
        }
        slot.ready = ready;
        Ok(())
    }

    pub fn set_config(&mut self, config: SessionConfig) {
        self.config = config;
    }

    pub fn begin_countdown(&mut self, seconds: u32) {
        self.status = SessionStatus::Starting;
        self.countdown = Some(seconds);
    }

    pub fn mark_started(&mut self, session_id: &str) {
        self.status = SessionStatus::InProgress;
        self.countdown = None;
        self.started_session = Some(session_id.to_string());
    }

    pub fn set_revision(&mut self, revision: u64) {
        self.revision = Some(revision);
    }
}
