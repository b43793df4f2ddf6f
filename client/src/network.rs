use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use reqwest::Url;
use shared::{ClientFrame, Session};
use std::future::{pending, Future};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::config::SyncConfig;
use crate::connection::{Action, ConnectionMachine, ConnectionState};
use crate::error::SyncError;

/// Close codes the authority uses to refuse a token
const CLOSE_UNAUTHORIZED: u16 = 4001;
const CLOSE_FORBIDDEN: u16 = 4003;

/// Traffic arriving on an established link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    /// Transport-level ping/pong; proves liveness, carries no event
    Keepalive,
}

/// An established link. Dropping `outbound` asks the transport to close.
/// `inbound` ends with an error or closes when the link is gone.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<Result<Inbound, SyncError>>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Link, SyncError>;
}

pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, endpoint: &str) -> Result<Link, SyncError> {
        let (stream, _response) = connect_async(endpoint).await.map_err(handshake_error)?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => match outgoing {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                let _ = inbound_tx.send(Err(SyncError::ConnectionLost(e.to_string())));
                                break;
                            }
                        }
                        None => {
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    incoming = source.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if inbound_tx.send(Ok(Inbound::Text(text))).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            let _ = inbound_tx.send(Ok(Inbound::Keepalive));
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let _ = inbound_tx.send(Err(close_error(frame)));
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let _ = inbound_tx.send(Err(SyncError::ConnectionLost(e.to_string())));
                            break;
                        }
                        None => {
                            let _ = inbound_tx.send(Err(SyncError::ConnectionLost(
                                "stream ended".to_string(),
                            )));
                            break;
                        }
                    }
                }
            }
            debug!("WebSocket pump stopped");
        });

        Ok(Link { outbound, inbound })
    }
}

fn handshake_error(err: WsError) -> SyncError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                SyncError::Unauthorized(format!("handshake returned HTTP {}", status))
            } else {
                SyncError::ConnectionLost(format!("handshake returned HTTP {}", status))
            }
        }
        WsError::Url(e) => SyncError::InvalidEndpoint(e.to_string()),
        other => SyncError::ConnectionLost(other.to_string()),
    }
}

fn close_error(frame: Option<CloseFrame<'_>>) -> SyncError {
    match frame {
        Some(frame) => {
            let code = u16::from(frame.code);
            if code == CLOSE_UNAUTHORIZED || code == CLOSE_FORBIDDEN {
                SyncError::Unauthorized(frame.reason.to_string())
            } else {
                SyncError::ConnectionLost(format!("closed by peer ({}) {}", code, frame.reason))
            }
        }
        None => SyncError::ConnectionLost("closed by peer".to_string()),
    }
}

/// Rewrites an `http(s)` base URL into its `ws(s)` counterpart
pub fn websocket_base(base: &str) -> Result<Url, SyncError> {
    let mut url = Url::parse(base).map_err(|e| SyncError::InvalidEndpoint(format!("{base}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidEndpoint(format!(
                "unsupported scheme `{other}`"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidEndpoint(base.to_string()))?;
    Ok(url)
}

/// Push channel URL for a session:
/// `ws(s)://host/ws/{lobby|game}/{id}?player_id=..&token=..`
pub fn push_endpoint(base: &str, session: &Session) -> Result<String, SyncError> {
    let mut url = websocket_base(base)?;
    let prefix = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!(
        "{}/ws/{}/{}",
        prefix,
        session.scope.channel_segment(),
        session.session_id
    ));
    url.query_pairs_mut()
        .clear()
        .append_pair("player_id", &session.player_id)
        .append_pair("token", &session.token);
    Ok(url.into())
}

/// Everything the connection reports, in the order it happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    State(ConnectionState),
    Frame(String),
}

/// Owned handle to one live connection. Cloning shares the connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    state: watch::Receiver<ConnectionState>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    close: mpsc::UnboundedSender<()>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Sends one raw frame; fails unless the connection is open
    pub fn send(&self, raw: String) -> Result<(), SyncError> {
        if !self.state.borrow().is_open() {
            return Err(SyncError::NotConnected);
        }
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(raw).map_err(|_| SyncError::NotConnected),
            None => Err(SyncError::NotConnected),
        }
    }

    pub fn send_frame(&self, frame: &ClientFrame) -> Result<(), SyncError> {
        self.send(frame.encode()?)
    }

    /// Stops the connection for good; no further retries
    pub fn close(&self) {
        let _ = self.close.send(());
    }
}

/// Opens a connection and returns its handle plus the ordered event stream
///
/// Must be called within a tokio runtime; the connection is driven by a
/// spawned task that ends once the connection is closed or has failed.
pub fn open(
    endpoint: &str,
    transport: Arc<dyn Transport>,
    config: &SyncConfig,
) -> (ConnectionHandle, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (state_tx, state_rx) = watch::channel(ConnectionState::default());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = mpsc::unbounded_channel();
    let outbound = Arc::new(Mutex::new(None));

    let driver = Driver {
        endpoint: endpoint.to_string(),
        transport,
        connect_timeout: config.connect_timeout,
        machine: ConnectionMachine::new(config),
        published: ConnectionState::default(),
        state_tx,
        events_tx,
        outbound: outbound.clone(),
        inbound: None,
        dial: None,
    };
    tokio::spawn(driver.run(close_rx));

    let handle = ConnectionHandle {
        state: state_rx,
        outbound,
        close: close_tx,
    };
    (handle, events_rx)
}

type DialFuture = Pin<Box<dyn Future<Output = Result<Link, SyncError>> + Send>>;

struct Driver {
    endpoint: String,
    transport: Arc<dyn Transport>,
    connect_timeout: std::time::Duration,
    machine: ConnectionMachine,
    published: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
    inbound: Option<mpsc::UnboundedReceiver<Result<Inbound, SyncError>>>,
    dial: Option<DialFuture>,
}

impl Driver {
    async fn run(mut self, mut close_rx: mpsc::UnboundedReceiver<()>) {
        info!("Connecting to {}", redact(&self.endpoint));
        let actions = self.machine.open();
        self.execute(actions);
        self.publish();

        while !self.machine.status().is_terminal() {
            let deadline = self.machine.next_deadline();

            tokio::select! {
                _ = close_rx.recv() => {
                    let actions = self.machine.close();
                    self.execute(actions);
                }
                result = wait_dial(&mut self.dial) => {
                    self.dial = None;
                    let now = Instant::now();
                    match result {
                        Ok(link) => {
                            *self.outbound.lock() = Some(link.outbound);
                            self.inbound = Some(link.inbound);
                            let actions = self.machine.on_connected(now);
                            self.execute(actions);
                        }
                        Err(e) => {
                            warn!("Connect attempt failed: {}", e);
                            let actions = self.machine.on_disconnect(&e, now);
                            self.execute(actions);
                        }
                    }
                }
                received = next_inbound(&mut self.inbound) => {
                    let now = Instant::now();
                    match received {
                        Some(Ok(Inbound::Text(raw))) => {
                            self.machine.on_inbound(now);
                            let _ = self.events_tx.send(ConnectionEvent::Frame(raw));
                        }
                        Some(Ok(Inbound::Keepalive)) => self.machine.on_inbound(now),
                        Some(Err(e)) => {
                            let actions = self.machine.on_disconnect(&e, now);
                            self.execute(actions);
                        }
                        None => {
                            let e = SyncError::ConnectionLost("link closed".to_string());
                            let actions = self.machine.on_disconnect(&e, now);
                            self.execute(actions);
                        }
                    }
                }
                _ = wait_deadline(deadline) => {
                    let actions = self.machine.on_timer(Instant::now());
                    self.execute(actions);
                }
            }

            self.publish();
        }

        debug!("Connection driver finished: {:?}", self.machine.status());
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Dial => self.dial = Some(self.dial_future()),
                Action::Ping => match ClientFrame::Ping.encode() {
                    Ok(ping) => {
                        if let Some(tx) = self.outbound.lock().as_ref() {
                            let _ = tx.send(ping);
                        }
                    }
                    Err(e) => error!("Could not encode ping: {}", e),
                },
                Action::DropLink => {
                    self.outbound.lock().take();
                    self.inbound = None;
                    self.dial = None;
                }
            }
        }
    }

    fn dial_future(&self) -> DialFuture {
        let transport = self.transport.clone();
        let endpoint = self.endpoint.clone();
        let limit = self.connect_timeout;
        Box::pin(async move {
            match timeout(limit, transport.connect(&endpoint)).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::ConnectionLost(format!(
                    "connect timed out after {:?}",
                    limit
                ))),
            }
        })
    }

    /// Reports the machine's state if it changed since the last report
    fn publish(&mut self) {
        let state = self.machine.state();
        if *state == self.published {
            return;
        }
        self.published = state.clone();
        self.state_tx.send_replace(state.clone());
        let _ = self.events_tx.send(ConnectionEvent::State(state.clone()));
    }
}

async fn wait_dial(dial: &mut Option<DialFuture>) -> Result<Link, SyncError> {
    match dial {
        Some(fut) => fut.as_mut().await,
        None => pending().await,
    }
}

async fn next_inbound(
    inbound: &mut Option<mpsc::UnboundedReceiver<Result<Inbound, SyncError>>>,
) -> Option<Result<Inbound, SyncError>> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

pub(crate) async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => pending().await,
    }
}

/// Strips the query string, which carries the token
fn redact(endpoint: &str) -> &str {
    endpoint.split('?').next().unwrap_or(endpoint)
}
