//! # Lobby Sync Client Library
//!
//! This library keeps a local view of a multiplayer lobby (or a live game) in
//! step with a remote authority. The authority is reachable two ways: a
//! long-lived push channel that streams events, and a REST endpoint that
//! returns full snapshots. Neither is reliable on its own, so the client
//! listens to both and decides, moment by moment, which one to believe.
//!
//! ## Architecture Overview
//!
//! Everything a session owns lives on one task. Network I/O happens in
//! spawned tasks whose results come back over channels, which gives the
//! reconciler a single, ordered timeline to work with.
//!
//! ### Dual-Source Reconciliation
//! Until the push channel is open and has delivered an event, the latest
//! polled snapshot is authoritative. Once push is confirmed, snapshots are
//! only accepted if they prove push missed something; a snapshot that would
//! roll back readiness, occupancy or status already advanced by push is
//! discarded.
//!
//! ### Connection Resilience
//! The push channel is driven by an explicit state machine: liveness pings on
//! a fixed interval, an idle timeout that treats silence as loss, exponential
//! backoff with jitter between attempts, and a bounded number of retries.
//!
//! ### Optimistic Intents
//! Ready toggles, kicks and config edits show up locally straight away through
//! a provisional overlay. The authoritative copy is never touched by a local
//! intent; the overlay is dropped when the authority confirms or the command
//! fails.
//!
//! ## Module Organization
//!
//! ### Connection (`connection`, `network`)
//! - Pure connection state machine with backoff and heartbeat timers
//! - Async driver executing the machine's actions on tokio
//! - `Transport` trait and its WebSocket implementation
//!
//! ### Dispatch and Reconciliation (`dispatcher`, `reconciler`)
//! - Frame decoding with malformed frames logged and dropped
//! - Authority tracking between poll and push
//! - Buffering of events that arrive before the first snapshot
//! - Provisional overlay for pending intents
//!
//! ### Commands (`commands`, `rest`)
//! - At most one in-flight identical command, with debounce
//! - Acknowledgment by endpoint reply, push event, or view change
//! - HTTP poll and command endpoints
//!
//! ### Logs (`log_buffer`)
//! - Capped, ordered log stream with follow/pin viewing modes
//!
//! ### Session (`session`)
//! - The orchestrating task and the `SessionHandle` given to renderers
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{Collaborators, Intent, SyncConfig, SyncSession};
//! use client::network::push_endpoint;
//! use shared::Session;
//!
//! # async fn demo() -> Result<(), client::SyncError> {
//! let session = Session::lobby("abc123", "player-1", "token");
//! let config = SyncConfig::default();
//! let endpoint = push_endpoint("https://play.example.com", &session)?;
//! let collaborators = Collaborators::http("https://play.example.com", &config)?;
//!
//! let (handle, mut notices) = SyncSession::spawn(session, config, &endpoint, collaborators);
//!
//! // Resolves once the authority acknowledges the toggle
//! handle.submit(Intent::SetReady { ready: true }).await?;
//!
//! while let Some(notice) = notices.recv().await {
//!     println!("{:?}", notice);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Design Philosophy
//!
//! ### Never Roll Back
//! A participant who sees themselves ready, or a game that has started, must
//! not flicker back because an old poll response arrived late.
//!
//! ### Degrade, Don't Die
//! Malformed frames, failed polls and dropped connections are logged and
//! survived. A refused token is the exception: whether the push channel, the
//! poll endpoint or the command endpoint reports it, the session raises one
//! `Unauthorized` notice and shuts down, since retrying cannot succeed.

pub mod commands;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod log_buffer;
pub mod network;
pub mod poller;
pub mod reconciler;
pub mod rest;
pub mod session;

pub use commands::{CommandId, CommandKind, Intent};
pub use config::SyncConfig;
pub use connection::{ConnectionState, ConnectionStatus};
pub use dispatcher::Notice;
pub use error::SyncError;
pub use log_buffer::{LogEntry, LogStreamBuffer, Severity, ViewMode};
pub use session::{Collaborators, SessionHandle, SyncSession};
