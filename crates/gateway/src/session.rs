//! The gateway session client.
//!
//! One `SessionClient` maintains one logical session. All mutable session
//! state (the lifecycle state machine, the pending-request map, the active
//! chat run, the history log) is confined to a single actor task; public
//! methods and background timers talk to it over a command channel, so
//! inbound-frame handling and outbound bookkeeping are serialized by
//! construction.
//!
//! Callers suspend on oneshot waiters. Every waiter is resolved exactly once,
//! by whichever of {response, deadline, disconnect} fires first; the losing
//! paths find the waiter already gone and do nothing.

use crate::protocol::{
    Attachment, AuthBlock, ChallengePayload, ChatAbortParams, ChatAckPayload, ChatEventPayload,
    ChatHistoryParams, ChatSendParams, ClientInfo, ConnectParams, DeviceBlock, ErrorBody, Frame,
    GatewayEvent, HELLO_OK, HelloPayload, HistoryPayload, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN, RequestCall,
};
use crate::transport::{Connector, FrameSink, FrameStream, WsConnector};
use sage_core::credentials::{BEARER_TOKEN_KEY, CredentialStore, DEVICE_TOKEN_KEY};
use sage_core::error::Error;
use sage_core::history::{self, HistoryEntry, Role};
use sage_core::identity::DeviceIdentity;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// How many history entries to pull when a connection is (re)established.
const HISTORY_RELOAD_LIMIT: u32 = 50;

/// Tuning knobs for a session. `new` fills in the defaults the gateway
/// expects; services override what their environment dictates.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket URL of the gateway.
    pub url: String,
    pub client_name: String,
    pub client_version: String,
    pub platform: String,
    pub role: String,
    pub scopes: Vec<String>,
    pub locale: String,
    pub user_agent: String,
    /// How long to wait for the server's challenge after the channel opens.
    pub handshake_timeout: Duration,
    /// Per-request deadline for correlated calls.
    pub request_timeout: Duration,
    /// Overall deadline for one chat turn, measured from `chat.send`.
    pub chat_timeout: Duration,
    /// First reconnection delay; doubles on each further attempt.
    pub reconnect_base: Duration,
    /// Unintentional disconnects tolerated before giving up.
    pub max_reconnect_attempts: u32,
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_name: "sage".into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            platform: std::env::consts::OS.into(),
            role: "assistant".into(),
            scopes: vec!["chat".into()],
            locale: "en-US".into(),
            user_agent: format!("sage/{} ({})", env!("CARGO_PKG_VERSION"), std::env::consts::OS),
            handshake_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            chat_timeout: Duration::from_secs(90),
            reconnect_base: Duration::from_millis(500),
            max_reconnect_attempts: 5,
        }
    }
}

/// Lifecycle phase of the session. Exactly one is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingChallenge,
    Handshaking,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for SessionState {
    /// Human-readable status for the presentation layer.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting…",
            SessionState::AwaitingChallenge | SessionState::Handshaking => "Authenticating…",
            SessionState::Connected => "Connected",
            SessionState::Reconnecting => "Reconnecting…",
            SessionState::Failed => "Connection Failed",
        })
    }
}

/// Delay before reconnection attempt number `attempt` (zero-based).
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt)
}

/// Handle to a running session. Cheap to clone; the actor stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct SessionClient {
    commands: mpsc::Sender<Command>,
    state_rx: watch::Receiver<SessionState>,
    log: Arc<RwLock<Vec<HistoryEntry>>>,
}

impl SessionClient {
    /// Creates a client that dials the gateway over a real WebSocket.
    pub fn new(
        config: SessionConfig,
        credentials: Arc<dyn CredentialStore>,
        identity: DeviceIdentity,
    ) -> Self {
        Self::with_connector(config, credentials, identity, Arc::new(WsConnector))
    }

    /// Creates a client over an injected transport. This is the seam the
    /// tests use; production code wants [`SessionClient::new`].
    pub fn with_connector(
        config: SessionConfig,
        credentials: Arc<dyn CredentialStore>,
        identity: DeviceIdentity,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let log = Arc::new(RwLock::new(Vec::new()));

        let actor = SessionActor {
            config,
            connector,
            credentials,
            identity,
            commands: commands.downgrade(),
            state: SessionState::Disconnected,
            state_tx,
            log: log.clone(),
            sink: None,
            reader: None,
            epoch: 0,
            next_id: 0,
            pending: HashMap::new(),
            chat: None,
            chat_seq: 0,
            connect_waiters: Vec::new(),
            retries: 0,
            intentional: false,
        };
        tokio::spawn(actor.run(command_rx).instrument(info_span!("gateway_session")));

        Self {
            commands,
            state_rx,
            log,
        }
    }

    /// Establishes the session, waiting through the handshake (and any
    /// transparent retries) until it is Connected or has deterministically
    /// failed. Idempotent while a session is already up or underway.
    pub async fn connect(&self) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Connect { reply }).await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Tears the session down intentionally: no reconnection, all in-flight
    /// work failed with [`Error::Disconnected`]. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .send_command(Command::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = rx.await;
        }
    }

    /// Issues a correlated request and suspends until whichever of its
    /// response, its deadline, or a disconnect comes first.
    pub async fn request(&self, call: RequestCall) -> Result<Value, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Request { call, reply }).await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Sends one chat message and resolves with the complete (or, at the
    /// turn deadline, partial) assistant reply.
    pub async fn send_message(&self, message: impl Into<String>) -> Result<String, Error> {
        self.chat(message.into(), Vec::new()).await
    }

    /// Like [`SessionClient::send_message`], with attachments.
    pub async fn send_image_message(
        &self,
        message: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Result<String, Error> {
        self.chat(message.into(), attachments).await
    }

    async fn chat(
        &self,
        message: String,
        attachments: Vec<Attachment>,
    ) -> Result<String, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Chat {
            message,
            attachments,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Aborts the active chat turn. Best-effort on the wire, but the local
    /// waiter is always resolved with whatever streamed so far.
    pub async fn abort(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send_command(Command::Abort { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Fetches history from the gateway and replaces the local log with it.
    pub async fn load_history(&self, limit: u32) -> Result<Vec<HistoryEntry>, Error> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::LoadHistory { limit, reply })
            .await?;
        rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Read-only snapshot of the conversation log.
    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.log.read().await.clone()
    }

    /// The trailing `limit` entries of the log, as a read-time projection.
    pub async fn recent_history(&self, limit: usize) -> Vec<HistoryEntry> {
        let log = self.log.read().await;
        history::recent(&log, limit).to_vec()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch channel for state transitions, for the presentation layer.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn send_command(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::Disconnected)
    }
}

// --- Actor internals ---

enum Command {
    Connect {
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    Request {
        call: RequestCall,
        reply: oneshot::Sender<Result<Value, Error>>,
    },
    Chat {
        message: String,
        attachments: Vec<Attachment>,
        reply: oneshot::Sender<Result<String, Error>>,
    },
    Abort {
        reply: oneshot::Sender<()>,
    },
    LoadHistory {
        limit: u32,
        reply: oneshot::Sender<Result<Vec<HistoryEntry>, Error>>,
    },
    // Internal: channel lifecycle.
    Opened {
        epoch: u64,
        sink: Box<dyn FrameSink>,
        stream: Box<dyn FrameStream>,
    },
    OpenFailed {
        epoch: u64,
        reason: String,
    },
    Inbound {
        epoch: u64,
        frame: Frame,
    },
    ChannelClosed {
        epoch: u64,
        reason: String,
    },
    // Internal: timers. Each is a safe no-op once its target is gone.
    HandshakeDeadline {
        epoch: u64,
    },
    RequestDeadline {
        epoch: u64,
        id: String,
    },
    ChatDeadline {
        epoch: u64,
        seq: u64,
    },
    Retry,
}

/// What resolves when a response (or its deadline, or a disconnect) lands.
enum Waiter {
    /// A caller suspended in `request`.
    Call(oneshot::Sender<Result<Value, Error>>),
    /// The handshake acknowledgement.
    Connect,
    /// The `chat.send` acknowledgement; the run waiter is separate.
    ChatAck,
    /// A history fetch; `None` is the reload triggered on (re)connect.
    History(Option<oneshot::Sender<Result<Vec<HistoryEntry>, Error>>>),
    /// Fire-and-forget (`chat.abort`).
    Discard,
}

struct PendingRequest {
    issued_at: Instant,
    waiter: Waiter,
}

struct ChatRun {
    seq: u64,
    run_id: Option<String>,
    buffer: String,
    started: Instant,
    reply: oneshot::Sender<Result<String, Error>>,
}

struct SessionActor {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialStore>,
    identity: DeviceIdentity,
    /// Weak self-reference for timers and readers; once every public handle
    /// is gone the channel closes and the actor winds down.
    commands: mpsc::WeakSender<Command>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    log: Arc<RwLock<Vec<HistoryEntry>>>,
    sink: Option<Box<dyn FrameSink>>,
    reader: Option<JoinHandle<()>>,
    /// Connection epoch. Bumped whenever the channel is replaced or dropped;
    /// reader and timer messages from older epochs are ignored.
    epoch: u64,
    next_id: u64,
    pending: HashMap<String, PendingRequest>,
    chat: Option<ChatRun>,
    chat_seq: u64,
    connect_waiters: Vec<oneshot::Sender<Result<(), Error>>>,
    retries: u32,
    intentional: bool,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
        }
        debug!("all client handles dropped; session actor stopping");
        self.drop_channel();
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => match self.state {
                SessionState::Connected => {
                    let _ = reply.send(Ok(()));
                }
                SessionState::Disconnected | SessionState::Failed => {
                    self.connect_waiters.push(reply);
                    self.intentional = false;
                    self.retries = 0;
                    self.begin_connect();
                }
                // An attempt is already underway; ride along.
                _ => self.connect_waiters.push(reply),
            },

            Command::Disconnect { reply } => {
                if self.state != SessionState::Disconnected {
                    info!("disconnecting at caller request");
                    self.intentional = true;
                    self.drop_channel();
                    self.fail_in_flight();
                    self.resolve_connect(Err(Error::Disconnected));
                    self.retries = 0;
                    self.set_state(SessionState::Disconnected);
                }
                let _ = reply.send(());
            }

            Command::Request { call, reply } => {
                if self.state == SessionState::Connected {
                    self.issue(call, Waiter::Call(reply)).await;
                } else {
                    let _ = reply.send(Err(Error::Disconnected));
                }
            }

            Command::Chat {
                message,
                attachments,
                reply,
            } => {
                if self.state != SessionState::Connected {
                    let _ = reply.send(Err(Error::Disconnected));
                    return;
                }
                if self.chat.is_some() {
                    let _ = reply.send(Err(Error::TurnActive));
                    return;
                }
                self.log
                    .write()
                    .await
                    .push(HistoryEntry::new(Role::User, message.clone()));
                self.chat_seq += 1;
                let seq = self.chat_seq;
                self.chat = Some(ChatRun {
                    seq,
                    run_id: None,
                    buffer: String::new(),
                    started: Instant::now(),
                    reply,
                });
                let params = ChatSendParams {
                    message,
                    idempotency_key: Uuid::new_v4().to_string(),
                    attachments,
                };
                self.issue(RequestCall::ChatSend(params), Waiter::ChatAck)
                    .await;
                let commands = self.commands.clone();
                let epoch = self.epoch;
                let deadline = self.config.chat_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    if let Some(commands) = commands.upgrade() {
                        let _ = commands.send(Command::ChatDeadline { epoch, seq }).await;
                    }
                });
            }

            Command::Abort { reply } => {
                if let Some(run) = self.chat.take() {
                    info!(
                        elapsed_ms = run.started.elapsed().as_millis() as u64,
                        "aborting chat turn"
                    );
                    if self.state == SessionState::Connected {
                        let params = ChatAbortParams {
                            run_id: run.run_id.clone(),
                        };
                        self.issue(RequestCall::ChatAbort(params), Waiter::Discard)
                            .await;
                    }
                    self.finish_chat(run).await;
                }
                let _ = reply.send(());
            }

            Command::LoadHistory { limit, reply } => {
                if self.state == SessionState::Connected {
                    self.issue(
                        RequestCall::ChatHistory(ChatHistoryParams { limit }),
                        Waiter::History(Some(reply)),
                    )
                    .await;
                } else {
                    let _ = reply.send(Err(Error::Disconnected));
                }
            }

            Command::Opened {
                epoch,
                sink,
                stream,
            } => {
                if epoch != self.epoch {
                    // A connection raced an intervening teardown; discard it.
                    let mut sink = sink;
                    tokio::spawn(async move {
                        let _ = sink.close().await;
                    });
                    return;
                }
                self.sink = Some(sink);
                self.spawn_reader(epoch, stream);
                self.set_state(SessionState::AwaitingChallenge);
                let commands = self.commands.clone();
                let deadline = self.config.handshake_timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(deadline).await;
                    if let Some(commands) = commands.upgrade() {
                        let _ = commands.send(Command::HandshakeDeadline { epoch }).await;
                    }
                });
            }

            Command::OpenFailed { epoch, reason } => {
                if epoch == self.epoch {
                    self.on_connection_lost(&reason).await;
                }
            }

            Command::Inbound { epoch, frame } => {
                if epoch == self.epoch {
                    self.on_frame(frame).await;
                }
            }

            Command::ChannelClosed { epoch, reason } => {
                if epoch == self.epoch {
                    self.on_connection_lost(&reason).await;
                }
            }

            Command::HandshakeDeadline { epoch } => {
                if epoch == self.epoch && self.state == SessionState::AwaitingChallenge {
                    warn!("no challenge within the handshake window");
                    self.on_connection_lost("challenge not received").await;
                }
            }

            Command::RequestDeadline { epoch, id } => {
                if epoch != self.epoch {
                    return;
                }
                if let Some(request) = self.pending.remove(&id) {
                    match request.waiter {
                        // The turn's own deadline governs; a late ack is moot.
                        Waiter::ChatAck => {
                            debug!(%id, "chat acknowledgement still outstanding")
                        }
                        Waiter::Connect => {
                            warn!(%id, "handshake acknowledgement timed out");
                            self.on_connection_lost("handshake timed out").await;
                        }
                        waiter => {
                            warn!(
                                %id,
                                elapsed_ms = request.issued_at.elapsed().as_millis() as u64,
                                "request deadline elapsed"
                            );
                            self.fail_waiter(waiter, Error::Timeout);
                        }
                    }
                }
            }

            Command::ChatDeadline { epoch, seq } => {
                if epoch != self.epoch {
                    return;
                }
                if self.chat.as_ref().map(|run| run.seq) != Some(seq) {
                    return;
                }
                if let Some(run) = self.chat.take() {
                    if run.buffer.is_empty() {
                        warn!("chat turn deadline elapsed with nothing streamed");
                        let _ = run.reply.send(Err(Error::Timeout));
                    } else {
                        // Partial answers beat no answer.
                        warn!(
                            chars = run.buffer.len(),
                            "chat turn deadline elapsed; returning partial reply"
                        );
                        self.finish_chat(run).await;
                    }
                }
            }

            Command::Retry => {
                if self.state == SessionState::Reconnecting {
                    self.begin_connect();
                }
            }
        }
    }

    // --- Channel lifecycle ---

    fn begin_connect(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.set_state(SessionState::Connecting);
        let connector = self.connector.clone();
        let url = self.config.url.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let outcome = connector.connect(&url).await;
            let Some(commands) = commands.upgrade() else {
                return;
            };
            match outcome {
                Ok((sink, stream)) => {
                    let _ = commands
                        .send(Command::Opened {
                            epoch,
                            sink,
                            stream,
                        })
                        .await;
                }
                Err(err) => {
                    let _ = commands
                        .send(Command::OpenFailed {
                            epoch,
                            reason: err.to_string(),
                        })
                        .await;
                }
            }
        });
    }

    fn spawn_reader(&mut self, epoch: u64, mut stream: Box<dyn FrameStream>) {
        let weak = self.commands.clone();
        self.reader = Some(tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                let Some(commands) = weak.upgrade() else {
                    return;
                };
                match item {
                    Ok(text) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => {
                            if commands.send(Command::Inbound { epoch, frame }).await.is_err() {
                                return;
                            }
                        }
                        // Protocol-level garbage is dropped locally, never
                        // surfaced to callers.
                        Err(err) => warn!(error = %err, "dropping malformed frame"),
                    },
                    Err(err) => {
                        let _ = commands
                            .send(Command::ChannelClosed {
                                epoch,
                                reason: err.to_string(),
                            })
                            .await;
                        return;
                    }
                }
            }
            if let Some(commands) = weak.upgrade() {
                let _ = commands
                    .send(Command::ChannelClosed {
                        epoch,
                        reason: "closed by remote".into(),
                    })
                    .await;
            }
        }));
    }

    fn drop_channel(&mut self) {
        self.epoch += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut sink) = self.sink.take() {
            tokio::spawn(async move {
                let _ = sink.close().await;
            });
        }
    }

    /// Unintentional loss of the channel (or a failed open / failed
    /// handshake): fail in-flight work, then back off and retry until the
    /// budget runs out.
    async fn on_connection_lost(&mut self, reason: &str) {
        self.drop_channel();
        self.fail_in_flight();
        if self.intentional {
            self.set_state(SessionState::Disconnected);
            return;
        }
        self.retries += 1;
        if self.retries > self.config.max_reconnect_attempts {
            error!(reason, "reconnection budget exhausted");
            self.set_state(SessionState::Failed);
            self.resolve_connect(Err(Error::Disconnected));
            return;
        }
        let delay = backoff_delay(self.config.reconnect_base, self.retries - 1);
        warn!(
            reason,
            attempt = self.retries,
            delay_ms = delay.as_millis() as u64,
            "connection lost; scheduling reconnect"
        );
        self.set_state(SessionState::Reconnecting);
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Retry).await;
            }
        });
    }

    /// Callers must never wait across a dropped connection.
    fn fail_in_flight(&mut self) {
        let waiters: Vec<Waiter> = self
            .pending
            .drain()
            .map(|(_, request)| request.waiter)
            .collect();
        for waiter in waiters {
            self.fail_waiter(waiter, Error::Disconnected);
        }
        if let Some(run) = self.chat.take() {
            let _ = run.reply.send(Err(Error::Disconnected));
        }
    }

    fn fail_waiter(&mut self, waiter: Waiter, error: Error) {
        match waiter {
            Waiter::Call(reply) => {
                let _ = reply.send(Err(error));
            }
            Waiter::History(Some(reply)) => {
                let _ = reply.send(Err(error));
            }
            Waiter::History(None) | Waiter::Discard => {}
            // Connect waiters ride across reconnection attempts; they are
            // resolved on Connected, on Failed, or on intentional disconnect.
            Waiter::Connect => {}
            Waiter::ChatAck => {
                if let Some(run) = self.chat.take() {
                    let _ = run.reply.send(Err(error));
                }
            }
        }
    }

    fn resolve_connect(&mut self, outcome: Result<(), Error>) {
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn set_state(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "session state");
            self.state = next;
            let _ = self.state_tx.send(next);
        }
    }

    // --- Outbound ---

    async fn issue(&mut self, call: RequestCall, waiter: Waiter) {
        self.next_id += 1;
        let id = self.next_id.to_string();
        let frame = Frame::Req {
            id: id.clone(),
            call,
        };
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(err) => {
                error!(error = %err, "could not encode request frame");
                self.fail_waiter(waiter, Error::InvalidResponse(err.to_string()));
                return;
            }
        };
        let Some(sink) = self.sink.as_mut() else {
            self.fail_waiter(waiter, Error::Disconnected);
            return;
        };
        if let Err(err) = sink.send(text).await {
            warn!(error = %err, "write failed");
            self.fail_waiter(waiter, Error::Disconnected);
            self.on_connection_lost("write failed").await;
            return;
        }
        self.pending.insert(
            id.clone(),
            PendingRequest {
                issued_at: Instant::now(),
                waiter,
            },
        );
        let commands = self.commands.clone();
        let epoch = self.epoch;
        let deadline = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::RequestDeadline { epoch, id }).await;
            }
        });
    }

    // --- Inbound ---

    async fn on_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Res {
                id,
                ok,
                payload,
                error,
            } => self.on_response(id, ok, payload, error).await,
            Frame::Event { event } => match event {
                GatewayEvent::Challenge(ChallengePayload { nonce }) => {
                    self.on_challenge(nonce).await;
                }
                GatewayEvent::Chat(payload) => self.on_chat_event(payload).await,
                GatewayEvent::Unknown => debug!("ignoring unrecognized event"),
            },
            Frame::Req { id, .. } => {
                warn!(%id, "unexpected request frame from gateway dropped");
            }
        }
    }

    async fn on_response(
        &mut self,
        id: String,
        ok: bool,
        payload: Option<Value>,
        error: Option<ErrorBody>,
    ) {
        let Some(request) = self.pending.remove(&id) else {
            // Late (post-deadline) or unsolicited; either way not ours to act on.
            debug!(%id, "response without a matching request dropped");
            return;
        };
        let outcome: Result<Value, Error> = if ok {
            Ok(payload.unwrap_or(Value::Null))
        } else {
            Err(Error::Gateway(
                error
                    .map(|body| body.message)
                    .unwrap_or_else(|| "unspecified gateway error".into()),
            ))
        };
        match request.waiter {
            Waiter::Call(reply) => {
                let _ = reply.send(outcome);
            }
            Waiter::Discard => {}
            Waiter::Connect => match outcome {
                Ok(payload) => self.finish_handshake(payload).await,
                Err(err) => {
                    warn!(error = %err, "handshake rejected by gateway");
                    self.resolve_connect(Err(err));
                    self.on_connection_lost("handshake rejected").await;
                }
            },
            Waiter::ChatAck => match outcome {
                Ok(payload) => {
                    if let Ok(ack) = serde_json::from_value::<ChatAckPayload>(payload) {
                        if let (Some(run), Some(run_id)) = (self.chat.as_mut(), ack.run_id) {
                            run.run_id.get_or_insert(run_id);
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "gateway refused the chat turn");
                    if let Some(run) = self.chat.take() {
                        let _ = run.reply.send(Err(err));
                    }
                }
            },
            Waiter::History(reply) => match outcome {
                Ok(payload) => match serde_json::from_value::<HistoryPayload>(payload) {
                    Ok(body) => {
                        debug!(entries = body.messages.len(), "history loaded");
                        *self.log.write().await = body.messages.clone();
                        if let Some(reply) = reply {
                            let _ = reply.send(Ok(body.messages));
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "malformed history payload");
                        if let Some(reply) = reply {
                            let _ = reply.send(Err(Error::InvalidResponse(err.to_string())));
                        }
                    }
                },
                Err(err) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(err));
                    }
                }
            },
        }
    }

    // --- Handshake ---

    async fn on_challenge(&mut self, nonce: String) {
        if self.state != SessionState::AwaitingChallenge {
            debug!(state = ?self.state, "challenge out of phase; ignoring");
            return;
        }
        self.set_state(SessionState::Handshaking);
        let auth = self.auth_block().await;
        let params = ConnectParams {
            min_protocol_version: PROTOCOL_VERSION_MIN,
            max_protocol_version: PROTOCOL_VERSION_MAX,
            client: ClientInfo {
                name: self.config.client_name.clone(),
                version: self.config.client_version.clone(),
                platform: self.config.platform.clone(),
            },
            role: self.config.role.clone(),
            scopes: self.config.scopes.clone(),
            auth,
            device: DeviceBlock {
                id: self.identity.device_id.clone(),
                nonce,
            },
            locale: self.config.locale.clone(),
            user_agent: self.config.user_agent.clone(),
        };
        self.issue(RequestCall::Connect(params), Waiter::Connect)
            .await;
    }

    /// Prefer the most specific, longest-lived credential: the gateway-issued
    /// device token, then the bearer credential, then nothing.
    async fn auth_block(&self) -> AuthBlock {
        match self.credentials.get(DEVICE_TOKEN_KEY).await {
            Ok(Some(token)) => {
                return AuthBlock {
                    device_token: Some(token),
                    bearer_token: None,
                };
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "credential store read failed; trying bearer"),
        }
        match self.credentials.get(BEARER_TOKEN_KEY).await {
            Ok(token) => AuthBlock {
                device_token: None,
                bearer_token: token,
            },
            Err(err) => {
                warn!(error = %err, "credential store read failed; handshaking unauthenticated");
                AuthBlock::default()
            }
        }
    }

    async fn finish_handshake(&mut self, payload: Value) {
        let hello: HelloPayload = match serde_json::from_value(payload) {
            Ok(hello) => hello,
            Err(err) => {
                warn!(error = %err, "malformed handshake acknowledgement");
                self.on_connection_lost("malformed handshake acknowledgement")
                    .await;
                return;
            }
        };
        if hello.kind != HELLO_OK {
            warn!(kind = %hello.kind, "unexpected handshake acknowledgement");
            self.on_connection_lost("unexpected handshake acknowledgement")
                .await;
            return;
        }
        if let Some(token) = &hello.device_token {
            // Supersedes the bearer credential from the next handshake on.
            match self.credentials.set(DEVICE_TOKEN_KEY, token).await {
                Ok(()) => info!("device token issued and persisted"),
                Err(err) => warn!(error = %err, "could not persist issued device token"),
            }
        }
        self.retries = 0;
        self.set_state(SessionState::Connected);
        info!(protocol = ?hello.protocol_version, "session established");
        self.resolve_connect(Ok(()));
        self.issue(
            RequestCall::ChatHistory(ChatHistoryParams {
                limit: HISTORY_RELOAD_LIMIT,
            }),
            Waiter::History(None),
        )
        .await;
    }

    // --- Chat aggregation ---

    async fn on_chat_event(&mut self, event: ChatEventPayload) {
        let Some(run) = self.chat.as_mut() else {
            debug!("chat event without an active run dropped");
            return;
        };
        if let Some(run_id) = event.run_id {
            run.run_id.get_or_insert(run_id);
        }
        if let Some(delta) = event.delta {
            run.buffer.push_str(&delta);
        } else if let Some(content) = event.content {
            // Full snapshot: the latest one wins outright.
            run.buffer = content;
        } else if let Some(message) = event.message {
            if let Some(content) = message.content {
                run.buffer = content;
            }
        }
        if matches!(
            event.status.as_deref(),
            Some("done" | "complete" | "finished")
        ) {
            if let Some(run) = self.chat.take() {
                self.finish_chat(run).await;
            }
        }
    }

    /// Resolves a run successfully with whatever is in its buffer, recording
    /// the assistant turn when there is one.
    async fn finish_chat(&mut self, run: ChatRun) {
        let text = run.buffer;
        if !text.is_empty() {
            self.log
                .write()
                .await
                .push(HistoryEntry::new(Role::Assistant, text.clone()));
        }
        info!(
            chars = text.len(),
            elapsed_ms = run.started.elapsed().as_millis() as u64,
            "chat turn resolved"
        );
        let _ = run.reply.send(Ok(text));
    }
}
