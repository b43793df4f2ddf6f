//! One sync session: the single task that owns all session state
//!
//! Connection events, poll results, command results and timers all funnel
//! into one `select!` loop, so the reconciler sees a single ordered timeline.
//! I/O runs in spawned tasks that report back over channels; closing the
//! session aborts them and drops anything that arrives late.

use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::{AuthoritativeView, ClientFrame, Envelope, Session, SessionSnapshot};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::commands::{CommandId, CommandSubmitter, Intent, PendingCommand};
use crate::config::SyncConfig;
use crate::connection::{ConnectionState, ConnectionStatus, FailureKind};
use crate::dispatcher::{Dispatcher, Notice};
use crate::error::SyncError;
use crate::log_buffer::{LogEntry, LogStreamBuffer, Severity};
use crate::network::{self, wait_deadline, ConnectionEvent, ConnectionHandle, Transport, WebSocketTransport};
use crate::poller::PollSchedule;
use crate::reconciler::{EventOutcome, SkipReason, SnapshotOutcome, StateReconciler};
use crate::rest::{CommandEndpoint, HttpCommandEndpoint, HttpSnapshotSource, SnapshotSource};

/// The external parties a session talks to
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub snapshots: Arc<dyn SnapshotSource>,
    pub commands: Arc<dyn CommandEndpoint>,
}

impl Collaborators {
    /// WebSocket push channel plus HTTP poll and command endpoints under `base`
    pub fn http(base: &str, config: &SyncConfig) -> Result<Self, SyncError> {
        Ok(Self {
            transport: Arc::new(WebSocketTransport),
            snapshots: Arc::new(HttpSnapshotSource::new(base, config.connect_timeout)?),
            commands: Arc::new(HttpCommandEndpoint::new(base, config.command_timeout)?),
        })
    }
}

type Reply = oneshot::Sender<Result<CommandId, SyncError>>;

enum Control {
    Submit { intent: Intent, reply: Reply },
    Close,
}

/// Read-only access to a running session, plus intent submission
#[derive(Clone)]
pub struct SessionHandle {
    control: mpsc::UnboundedSender<Control>,
    view: watch::Receiver<Option<AuthoritativeView>>,
    connection: watch::Receiver<ConnectionState>,
    logs: Arc<Mutex<LogStreamBuffer>>,
}

impl SessionHandle {
    /// Rendered view (authoritative state plus pending local intents)
    pub fn view(&self) -> watch::Receiver<Option<AuthoritativeView>> {
        self.view.clone()
    }

    pub fn current_view(&self) -> Option<AuthoritativeView> {
        self.view.borrow().clone()
    }

    pub fn connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    /// Submits an intent and waits until the authority settles it
    ///
    /// Resolves with the command id once acknowledged, or with
    /// `AlreadyPending`, `CommandRejected`, `CommandTimeout` or
    /// `SessionClosed`.
    pub async fn submit(&self, intent: Intent) -> Result<CommandId, SyncError> {
        let (reply, settled) = oneshot::channel();
        self.control
            .send(Control::Submit { intent, reply })
            .map_err(|_| SyncError::SessionClosed)?;
        settled.await.map_err(|_| SyncError::SessionClosed)?
    }

    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    pub fn with_logs<R>(&self, read: impl FnOnce(&LogStreamBuffer) -> R) -> R {
        read(&self.logs.lock())
    }

    pub fn set_scrolled_to_bottom(&self, at_bottom: bool) {
        self.logs.lock().set_scrolled_to_bottom(at_bottom);
    }
}

type PollResult = (Instant, Result<SessionSnapshot, SyncError>);
type CommandResult = (CommandId, Result<(), SyncError>);

struct Inputs {
    connection: mpsc::UnboundedReceiver<ConnectionEvent>,
    control: mpsc::UnboundedReceiver<Control>,
    polls: mpsc::UnboundedReceiver<PollResult>,
    results: mpsc::UnboundedReceiver<CommandResult>,
}

pub struct SyncSession {
    session: Session,
    collaborators: Collaborators,
    connection: ConnectionHandle,
    reconciler: StateReconciler,
    dispatcher: Dispatcher,
    commands: CommandSubmitter,
    schedule: PollSchedule,
    logs: Arc<Mutex<LogStreamBuffer>>,
    replies: HashMap<CommandId, Reply>,
    command_tasks: HashMap<CommandId, JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
    view_tx: watch::Sender<Option<AuthoritativeView>>,
    notices: mpsc::UnboundedSender<Notice>,
    poll_tx: mpsc::UnboundedSender<PollResult>,
    results_tx: mpsc::UnboundedSender<CommandResult>,
    /// Set once the authority refuses our credentials; ends the session
    refused: bool,
}

impl SyncSession {
    /// Starts a session on the current tokio runtime
    pub fn spawn(
        session: Session,
        config: SyncConfig,
        push_endpoint: &str,
        collaborators: Collaborators,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Notice>) {
        let (connection, connection_events) =
            network::open(push_endpoint, collaborators.transport.clone(), &config);
        let logs = Arc::new(Mutex::new(LogStreamBuffer::new(config.log_capacity)));

        let (view_tx, view_rx) = watch::channel(None);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let (poll_tx, poll_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            control: control_tx,
            view: view_rx,
            connection: connection.subscribe(),
            logs: logs.clone(),
        };

        let task = SyncSession {
            reconciler: StateReconciler::new(&session.session_id, &config),
            dispatcher: Dispatcher::new(&session.player_id, logs.clone()),
            commands: CommandSubmitter::new(&session, &config),
            schedule: PollSchedule::new(&config),
            session,
            collaborators,
            connection,
            logs,
            replies: HashMap::new(),
            command_tasks: HashMap::new(),
            poll_task: None,
            view_tx,
            notices: notice_tx,
            poll_tx,
            results_tx,
            refused: false,
        };
        let inputs = Inputs {
            connection: connection_events,
            control: control_rx,
            polls: poll_rx,
            results: results_rx,
        };
        tokio::spawn(task.run(inputs));

        (handle, notice_rx)
    }

    async fn run(mut self, mut inputs: Inputs) {
        info!(
            "Session {} started for {}",
            self.session.session_id, self.session.player_id
        );
        let mut connection_alive = true;

        loop {
            let poll_due = self
                .schedule
                .next_due(Instant::now(), self.reconciler.is_push_authoritative());
            let command_due = self.commands.next_deadline();

            tokio::select! {
                event = inputs.connection.recv(), if connection_alive => match event {
                    Some(event) => self.on_connection_event(event),
                    None => connection_alive = false,
                },
                control = inputs.control.recv() => match control {
                    Some(Control::Submit { intent, reply }) => self.on_submit(intent, reply),
                    Some(Control::Close) | None => break,
                },
                Some((requested_at, result)) = inputs.polls.recv() => {
                    self.on_poll_result(requested_at, result);
                }
                Some((id, result)) = inputs.results.recv() => {
                    self.on_command_result(id, result);
                }
                _ = wait_deadline(poll_due) => self.start_poll(),
                _ = wait_deadline(command_due) => self.expire_commands(),
            }

            self.publish_view();
            if self.refused {
                break;
            }
        }

        self.shutdown();
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::State(state) => {
                self.reconciler.set_live(state.is_open());
                match state.status {
                    ConnectionStatus::Open => self.log_system("Connected"),
                    ConnectionStatus::Reconnecting => self.log_system(&format!(
                        "Connection lost ({}), reconnect attempt {}",
                        state.last_error.as_deref().unwrap_or("unknown"),
                        state.attempt
                    )),
                    ConnectionStatus::Failed => {
                        let reason = state.last_error.clone().unwrap_or_default();
                        self.log(Severity::Error, &format!("Connection failed: {}", reason));
                        if state.failure == Some(FailureKind::Unauthorized) {
                            self.refuse(reason);
                        }
                    }
                    _ => {}
                }
            }
            ConnectionEvent::Frame(raw) => {
                if let Some(envelope) = self.dispatcher.decode(&raw) {
                    self.on_envelope(envelope);
                }
            }
        }
    }

    fn on_envelope(&mut self, envelope: Envelope) {
        let dispatched = self
            .dispatcher
            .dispatch(&envelope, &mut self.reconciler, Instant::now());

        let counts = !matches!(
            dispatched.outcome,
            EventOutcome::Rejected(_) | EventOutcome::Skipped(SkipReason::Closed)
        );
        if counts {
            let settled = self
                .commands
                .acknowledged_by_event(&envelope.event, self.reconciler.current());
            self.complete(settled);
        }
        if dispatched.outcome == EventOutcome::Applied {
            self.confirm_from_view();
        }

        for notice in dispatched.notices {
            match notice {
                Notice::Unauthorized(reason) => self.refuse(reason),
                notice => {
                    let _ = self.notices.send(notice);
                }
            }
        }
    }

    fn on_submit(&mut self, intent: Intent, reply: Reply) {
        let command = match self.commands.submit(intent, Instant::now()) {
            Ok(command) => command,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let id = command.id;
        if let Some(effect) = command.intent.provisional(&self.session.player_id) {
            self.reconciler.propose(id, effect);
        }
        self.replies.insert(id, reply);

        let mut pushed = false;
        if let Intent::SetReady { ready } = command.intent {
            if self.connection.state().is_open() {
                match self.connection.send_frame(&ClientFrame::SetReady { ready }) {
                    Ok(()) => {
                        debug!("Sent {} {} over push channel", command.kind(), id);
                        pushed = true;
                    }
                    Err(e) => debug!("Push send failed ({}), using command endpoint", e),
                }
            }
        }
        if !pushed {
            self.spawn_command(command);
        }

        // A no-op intent gets no event back; the view already confirms it
        self.confirm_from_view();
    }

    fn spawn_command(&mut self, command: PendingCommand) {
        let endpoint = self.collaborators.commands.clone();
        let session = self.session.clone();
        let results = self.results_tx.clone();
        let id = command.id;
        let intent = command.intent;

        let task = tokio::spawn(async move {
            let result = endpoint.execute(&session, &intent).await;
            let _ = results.send((id, result));
        });
        self.command_tasks.insert(id, task);
    }

    fn on_command_result(&mut self, id: CommandId, result: Result<(), SyncError>) {
        self.command_tasks.remove(&id);
        let Some(command) = self.commands.settle(id) else {
            debug!("Ignoring late result for command {}", id);
            return;
        };

        match result {
            Ok(()) => {
                info!("{} {} accepted", command.kind(), id);
                self.reconciler.acknowledge_provisional(id);
                self.reply(id, Ok(id));
            }
            Err(e) => {
                warn!("{} {} failed: {}", command.kind(), id, e);
                self.reconciler.withdraw(id);
                self.log(Severity::Error, &format!("{} failed: {}", command.kind(), e));
                let refused = match &e {
                    SyncError::Unauthorized(reason) => Some(reason.clone()),
                    _ => None,
                };
                self.reply(id, Err(e));
                if let Some(reason) = refused {
                    self.refuse(reason);
                }
            }
        }
    }

    fn expire_commands(&mut self) {
        let timeout = self.commands.timeout();
        for command in self.commands.expire(Instant::now()) {
            if let Some(task) = self.command_tasks.remove(&command.id) {
                task.abort();
            }
            self.reconciler.withdraw(command.id);
            self.reply(command.id, Err(SyncError::CommandTimeout(timeout)));
        }
    }

    fn start_poll(&mut self) {
        let requested_at = Instant::now();
        self.schedule.begin(requested_at);

        let source = self.collaborators.snapshots.clone();
        let session = self.session.clone();
        let polls = self.poll_tx.clone();
        self.poll_task = Some(tokio::spawn(async move {
            let result = source.fetch(&session).await;
            let _ = polls.send((requested_at, result));
        }));
    }

    fn on_poll_result(&mut self, requested_at: Instant, result: Result<SessionSnapshot, SyncError>) {
        self.schedule.finish();
        self.poll_task = None;

        match result {
            Ok(snapshot) => match self.reconciler.apply_snapshot(snapshot, requested_at) {
                SnapshotOutcome::Accepted => self.confirm_from_view(),
                SnapshotOutcome::Discarded(reason) => {
                    debug!("Polled snapshot discarded: {:?}", reason)
                }
            },
            Err(SyncError::Unauthorized(reason)) => {
                warn!("Poll refused: {}", reason);
                self.refuse(reason);
            }
            Err(e) => warn!("Poll failed: {}", e),
        }
    }

    /// Settles commands whose effect the authoritative view now shows
    fn confirm_from_view(&mut self) {
        let settled = match self.reconciler.current() {
            Some(view) => self.commands.confirmed_by_view(view),
            None => return,
        };
        self.complete(settled);
    }

    fn complete(&mut self, settled: Vec<PendingCommand>) {
        for command in settled {
            debug!("{} {} acknowledged by authority", command.kind(), command.id);
            self.command_tasks.remove(&command.id);
            self.reconciler.acknowledge_provisional(command.id);
            self.reply(command.id, Ok(command.id));
        }
    }

    fn reply(&mut self, id: CommandId, result: Result<CommandId, SyncError>) {
        if let Some(reply) = self.replies.remove(&id) {
            let _ = reply.send(result);
        }
    }

    fn publish_view(&mut self) {
        let rendered = self.reconciler.rendered();
        self.view_tx.send_if_modified(|current| {
            if *current == rendered {
                return false;
            }
            *current = rendered;
            true
        });
    }

    /// Credentials were refused. Raises a single notice; the loop then ends
    /// the session.
    fn refuse(&mut self, reason: String) {
        if self.refused {
            return;
        }
        warn!("Credentials refused, ending session: {}", reason);
        self.refused = true;
        let _ = self.notices.send(Notice::Unauthorized(reason));
    }

    fn log_system(&self, text: &str) {
        self.logs.lock().append(LogEntry::system(text));
    }

    fn log(&self, severity: Severity, text: &str) {
        self.logs.lock().append(LogEntry::new(text, severity));
    }

    fn shutdown(&mut self) {
        info!("Closing session {}", self.session.session_id);
        self.connection.close();
        self.reconciler.close();

        if let Some(task) = self.poll_task.take() {
            if self.schedule.in_flight() {
                debug!("Abandoning in-flight poll");
            }
            task.abort();
        }
        for (_, task) in self.command_tasks.drain() {
            task.abort();
        }
        for (_, reply) in self.replies.drain() {
            let _ = reply.send(Err(SyncError::SessionClosed));
        }
        self.publish_view();
        self.log_system("Session closed");
    }
}
