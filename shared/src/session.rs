use std::fmt;

/// Which kind of session a client is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionScope {
    #[default]
    Lobby,
    Game,
}

impl SessionScope {
    /// Path segment used by the push channel (`/ws/lobby/..`)
    pub fn channel_segment(self) -> &'static str {
        match self {
            SessionScope::Lobby => "lobby",
            SessionScope::Game => "game",
        }
    }

    /// Collection name used by the REST endpoints (`/api/lobbies/..`)
    pub fn resource_segment(self) -> &'static str {
        match self {
            SessionScope::Lobby => "lobbies",
            SessionScope::Game => "games",
        }
    }
}

/// Identity of one participant in one session, plus the capability token
/// proving they may act in it
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub session_id: String,
    pub player_id: String,
    pub token: String,
    pub scope: SessionScope,
}

impl Session {
    pub fn lobby(session_id: &str, player_id: &str, token: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            player_id: player_id.to_string(),
            token: token.to_string(),
            scope: SessionScope::Lobby,
        }
    }

    pub fn game(session_id: &str, player_id: &str, token: &str) -> Self {
        Self {
            scope: SessionScope::Game,
            ..Self::lobby(session_id, player_id, token)
        }
    }
}

// The token stays out of logs.
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("player_id", &self.player_id)
            .field("token", &"<redacted>")
            .field("scope", &self.scope)
            .finish()
    }
}
