//! Socket runtime.
//!
//! One owner task holds the [`Connection`] state machine and the live
//! transport; every mutation arrives as a [`Command`] on its queue, so state
//! writes are serialized by construction. Published states and events go to
//! a second task that calls listeners one at a time. Listener code therefore
//! never runs on the owner task or a transport's I/O task, and a slow listener
//! delays other listeners but never the network.
//!
//! The owner task never awaits the network either. Each live transport is
//! moved into a writer task that drains an outbound queue; closing it is a
//! signal to that task, which interrupts a write still in flight.
//!
//! ```text
//!  SocketHandle ─┐                              ┌─> listener A
//!  TransportSink ┼─> owner task ──> delivery ───┼─> listener B
//!  timers ───────┘   (Connection)    task       └─> ...
//!                         │
//!                         └──> writer task ──> Transport
//! ```

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tether_core::{
    ChatError, Connection, ConnectionAction, ConnectionConfig, ConnectionState, Environment,
    ErrorCause, SessionInfo, message::OutboundMessage,
};
use tether_proto::{ChatEvent, Payload};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::{
    error::TransportError,
    send::{Connectivity, MessageTransmitter},
    transport::{ConnectRequest, Transport, TransportFactory, TransportSignal, TransportSink},
};

/// Connection lifecycle and event callbacks.
///
/// All methods run on the socket's delivery task, in publish order. Default
/// implementations ignore the callback.
pub trait SocketListener: Send + Sync {
    /// A connection attempt started.
    fn on_connecting(&self) {}

    /// The handshake completed.
    fn on_connected(&self, _session: &SessionInfo) {}

    /// The connection is down.
    fn on_disconnected(&self, _will_reconnect: bool) {}

    /// The connection failed; `on_disconnected` follows.
    fn on_error(&self, _cause: &ErrorCause) {}

    /// A chat event arrived.
    fn on_event(&self, _event: &ChatEvent) {}
}

/// Obtains fresh auth tokens when the server rejects the current one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// New token for `user_id`.
    async fn refresh(&self, user_id: &str) -> Result<String, ChatError>;
}

/// Registration handle for [`SocketHandle::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Id from a raw value, for [`EventSource`](crate::hub::EventSource)
    /// implementations that keep their own registry.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub fn into_raw(self) -> u64 {
        self.0
    }
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn SocketListener>)>>,
}

impl ListenerRegistry {
    fn add(&self, listener: Arc<dyn SocketListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn snapshot(&self) -> Vec<Arc<dyn SocketListener>> {
        self.listeners.lock().iter().map(|(_, l)| Arc::clone(l)).collect()
    }
}

type SendReply = oneshot::Sender<Result<(), TransportError>>;

struct Outbound {
    frame: Bytes,
    reply: Option<SendReply>,
}

/// Outbound half of a live transport.
///
/// The transport itself lives on the writer task; frames are written in
/// queue order.
struct Writer {
    frames: mpsc::UnboundedSender<Outbound>,
    close: oneshot::Sender<(u16, String)>,
}

impl Writer {
    fn spawn(attempt: u64, transport: Box<dyn Transport>) -> Self {
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let (close, close_rx) = oneshot::channel();
        tokio::spawn(write_loop(attempt, transport, frames_rx, close_rx));
        Self { frames, close }
    }

    fn send(&self, frame: Bytes, reply: Option<SendReply>) {
        if let Err(mpsc::error::SendError(Outbound { reply: Some(reply), .. })) =
            self.frames.send(Outbound { frame, reply })
        {
            let _ = reply.send(Err(TransportError::Closed));
        }
    }

    fn close(self, code: u16, reason: String) {
        let _ = self.close.send((code, reason));
    }
}

enum Write {
    Done(Result<(), TransportError>),
    Interrupted(Option<(u16, String)>),
}

async fn write_loop(
    attempt: u64,
    mut transport: Box<dyn Transport>,
    mut frames: mpsc::UnboundedReceiver<Outbound>,
    mut close: oneshot::Receiver<(u16, String)>,
) {
    loop {
        let Outbound { frame, reply } = tokio::select! {
            biased;
            closing = &mut close => return shut(attempt, transport, closing.ok()).await,
            outbound = frames.recv() => match outbound {
                Some(outbound) => outbound,
                None => return,
            },
        };

        let write = tokio::select! {
            biased;
            closing = &mut close => Write::Interrupted(closing.ok()),
            result = transport.send(frame) => Write::Done(result),
        };

        match write {
            Write::Done(result) => {
                if let Err(e) = &result {
                    warn!(attempt, error = %e, "transport write failed");
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            },
            Write::Interrupted(closing) => {
                debug!(attempt, "write interrupted by close");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(TransportError::Closed));
                }
                return shut(attempt, transport, closing).await;
            },
        }
    }
}

async fn shut(attempt: u64, mut transport: Box<dyn Transport>, closing: Option<(u16, String)>) {
    let Some((code, reason)) = closing else { return };
    debug!(attempt, code, %reason, "closing transport");
    transport.close(code, &reason).await;
}

/// Work for the owner task.
pub(crate) enum Command {
    Connect(ConnectRequest),
    Disconnect(oneshot::Sender<()>),
    Transport { attempt: u64, signal: TransportSignal },
    Opened { attempt: u64, result: Result<Box<dyn Transport>, TransportError> },
    Send { frame: Bytes, reply: oneshot::Sender<Result<(), TransportError>> },
    TokenRefreshed(Result<String, ChatError>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(request) => f.debug_tuple("Connect").field(&request.endpoint).finish(),
            Self::Disconnect(_) => f.write_str("Disconnect"),
            Self::Transport { attempt, signal } => f
                .debug_struct("Transport")
                .field("attempt", attempt)
                .field("signal", signal)
                .finish(),
            Self::Opened { attempt, result } => f
                .debug_struct("Opened")
                .field("attempt", attempt)
                .field("ok", &result.is_ok())
                .finish(),
            Self::Send { frame, .. } => f.debug_struct("Send").field("len", &frame.len()).finish(),
            Self::TokenRefreshed(result) => {
                f.debug_tuple("TokenRefreshed").field(&result.is_ok()).finish()
            },
        }
    }
}

enum Delivery {
    State(ConnectionState),
    Event(ChatEvent),
}

/// Handle to a running socket. Cheap to clone.
///
/// The socket stops when the last handle is dropped.
#[derive(Clone)]
pub struct SocketHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    listeners: Arc<ListenerRegistry>,
}

impl fmt::Debug for SocketHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandle").field("state", &*self.state.borrow()).finish_non_exhaustive()
    }
}

/// Start a socket on the current tokio runtime.
///
/// Starts in [`ConnectionState::INITIAL`]; nothing happens until
/// [`SocketHandle::connect`]. Without a `token_refresher`, token rejections
/// leave the socket `Disconnected { will_reconnect: false }` until the
/// application supplies a token via [`SocketHandle::token_refreshed`].
pub fn spawn<E: Environment>(
    env: E,
    factory: Arc<dyn TransportFactory>,
    config: ConnectionConfig,
    token_refresher: Option<Arc<dyn TokenRefresher>>,
) -> SocketHandle {
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
    let (state_tx, state_rx) = watch::channel(ConnectionState::INITIAL);
    let listeners = Arc::new(ListenerRegistry::default());

    let driver = Driver {
        connection: Connection::new(env.clone(), config),
        env,
        factory,
        token_refresher,
        request: None,
        writer: None,
        attempts: 0,
        live_attempt: None,
        commands: commands_tx.downgrade(),
        state: state_tx,
        delivery: delivery_tx,
    };

    tokio::spawn(run(driver, commands_rx));
    tokio::spawn(deliver(delivery_rx, Arc::clone(&listeners)));

    SocketHandle { commands: commands_tx, state: state_rx, listeners }
}

impl SocketHandle {
    /// Start a fresh session with `request`.
    ///
    /// If already connecting or connected the current session is torn down
    /// first. Returns once the request is queued; watch the state or a
    /// listener for the outcome.
    pub fn connect(&self, request: ConnectRequest) -> Result<(), TransportError> {
        self.command(Command::Connect(request))
    }

    /// End the session and wait until every timer is cancelled and
    /// `Disconnected { will_reconnect: false }` has been published.
    pub async fn disconnect(&self) -> Result<(), TransportError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Disconnect(tx))?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Supply a new auth token, e.g. after a refresh done by the application.
    ///
    /// Resumes connecting if the socket was waiting for one.
    pub fn token_refreshed(&self, token: impl Into<String>) -> Result<(), TransportError> {
        self.command(Command::TokenRefreshed(Ok(token.into())))
    }

    /// Register a listener. Takes effect from the next delivery.
    pub fn add_listener(&self, listener: Arc<dyn SocketListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Latest published state.
    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every state publish.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Whether the latest published state is `Connected`.
    pub fn is_connected(&self) -> bool {
        matches!(*self.state.borrow(), ConnectionState::Connected(_))
    }

    /// Write an encoded frame to the live transport.
    pub async fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { frame, reply })?;
        rx.await.map_err(|_| TransportError::Closed)?
    }

    fn command(&self, command: Command) -> Result<(), TransportError> {
        self.commands.send(command).map_err(|_| TransportError::Closed)
    }
}

impl Connectivity for SocketHandle {
    fn is_online(&self) -> bool {
        self.is_connected()
    }
}

#[async_trait]
impl MessageTransmitter for SocketHandle {
    async fn transmit(&self, message: &OutboundMessage) -> Result<(), ChatError> {
        let frame = Payload::SendMessage(message.envelope())
            .to_wire()
            .map_err(|e| ChatError::Network(e.to_string()))?;
        self.send_frame(Bytes::from(frame)).await.map_err(ChatError::from)
    }
}

struct Driver<E: Environment> {
    env: E,
    connection: Connection<E>,
    factory: Arc<dyn TransportFactory>,
    token_refresher: Option<Arc<dyn TokenRefresher>>,
    request: Option<ConnectRequest>,
    writer: Option<Writer>,
    attempts: u64,
    live_attempt: Option<u64>,
    // Weak so that dropping every SocketHandle ends the owner loop.
    commands: mpsc::WeakUnboundedSender<Command>,
    state: watch::Sender<ConnectionState>,
    delivery: mpsc::UnboundedSender<Delivery>,
}

async fn run<E: Environment>(mut driver: Driver<E>, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        let env = driver.env.clone();
        let wait = driver.connection.next_deadline().map(|deadline| {
            let now = env.now();
            if deadline > now { deadline - now } else { Duration::ZERO }
        });

        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => driver.handle(command),
                None => break,
            },
            () = env.sleep(wait.unwrap_or_default()), if wait.is_some() => {
                let actions = driver.connection.tick();
                driver.execute(actions);
            },
        }
    }

    debug!("socket handles dropped, shutting down");
    let actions = driver.connection.disconnect();
    driver.execute(actions);
}

impl<E: Environment> Driver<E> {
    fn handle(&mut self, command: Command) {
        match command {
            Command::Connect(request) => {
                info!(endpoint = %request.endpoint, "connect requested");
                self.request = Some(request);
                let actions = self.connection.connect();
                self.execute(actions);
            },
            Command::Disconnect(ack) => {
                let actions = self.connection.disconnect();
                self.execute(actions);
                let _ = ack.send(());
            },
            Command::Transport { attempt, signal } => {
                if self.live_attempt != Some(attempt) {
                    debug!(attempt, live = ?self.live_attempt, "dropping stale transport signal");
                    return;
                }
                self.on_signal(signal);
            },
            Command::Opened { attempt, result } => self.on_opened(attempt, result),
            Command::Send { frame, reply } => match self.writer.as_ref() {
                Some(writer) if self.connection.is_connected() => writer.send(frame, Some(reply)),
                _ => {
                    let _ = reply.send(Err(TransportError::NotConnected));
                },
            },
            Command::TokenRefreshed(Ok(token)) => {
                if let Some(user) = self.request.as_mut().and_then(|r| r.user.as_mut()) {
                    user.token = token;
                }
                let actions = self.connection.on_token_refreshed();
                self.execute(actions);
            },
            Command::TokenRefreshed(Err(e)) => {
                error!(error = %e, "token refresh failed, staying disconnected");
            },
        }
    }

    fn on_signal(&mut self, signal: TransportSignal) {
        let result = match signal {
            TransportSignal::SessionEstablished(session) => {
                info!(connection_id = %session.connection_id, "session established");
                self.connection.on_session_established(session)
            },
            TransportSignal::Event(event) => self.connection.on_raw_event(event),
            TransportSignal::Error(cause) => {
                if cause.is_permanent() {
                    error!(%cause, "connection rejected permanently");
                } else {
                    warn!(%cause, "transport error");
                }
                Ok(self.connection.on_transport_error(cause))
            },
        };

        match result {
            Ok(actions) => self.execute(actions),
            Err(e) => debug!(error = %e, "ignoring transport signal"),
        }
    }

    fn on_opened(
        &mut self,
        attempt: u64,
        result: Result<Box<dyn Transport>, TransportError>,
    ) {
        match result {
            Ok(transport) if self.live_attempt != Some(attempt) => {
                debug!(attempt, "closing transport from superseded attempt");
                Writer::spawn(attempt, transport)
                    .close(tether_core::connection::CLOSE_NORMAL, "superseded".to_string());
            },
            Ok(transport) => {
                debug!(attempt, "transport open");
                self.writer = Some(Writer::spawn(attempt, transport));
            },
            Err(e) if self.live_attempt != Some(attempt) => {
                debug!(attempt, error = %e, "superseded attempt failed to open");
            },
            Err(e) => {
                warn!(attempt, error = %e, "transport failed to open");
                let actions = self.connection.on_transport_error(e.into_cause());
                self.execute(actions);
            },
        }
    }

    fn execute(&mut self, actions: Vec<ConnectionAction>) {
        for action in actions {
            match action {
                ConnectionAction::Publish(state) => {
                    debug!(?state, "state");
                    self.state.send_replace(state.clone());
                    let _ = self.delivery.send(Delivery::State(state));
                },
                ConnectionAction::Deliver(event) => {
                    let _ = self.delivery.send(Delivery::Event(event));
                },
                ConnectionAction::OpenTransport => self.open_transport(),
                ConnectionAction::CloseTransport { code, reason } => {
                    self.live_attempt = None;
                    if let Some(writer) = self.writer.take() {
                        writer.close(code, reason);
                    }
                },
                ConnectionAction::SendHealthCheck => {
                    let Some(writer) = self.writer.as_ref() else { continue };
                    let event = ChatEvent::health_check(self.env.wall_clock_millis());
                    match Payload::Event(event).to_wire() {
                        Ok(frame) => writer.send(Bytes::from(frame), None),
                        Err(e) => warn!(error = %e, "health check encode failed"),
                    }
                },
                ConnectionAction::RefreshToken => self.refresh_token(),
                ConnectionAction::ReconnectScheduled { delay, attempt } => {
                    info!(delay_ms = delay.as_millis() as u64, attempt, "reconnect scheduled");
                },
            }
        }
    }

    fn open_transport(&mut self) {
        let (Some(request), Some(commands)) = (self.request.clone(), self.commands.upgrade())
        else {
            error!("open requested without a connect request");
            return;
        };

        self.attempts += 1;
        let attempt = self.attempts;
        self.live_attempt = Some(attempt);
        debug!(attempt, endpoint = %request.endpoint, "opening transport");

        let sink = TransportSink::new(attempt, self.commands.clone());
        let factory = Arc::clone(&self.factory);
        tokio::spawn(async move {
            let result = factory.open(&request, sink).await;
            let _ = commands.send(Command::Opened { attempt, result });
        });
    }

    fn refresh_token(&self) {
        let (Some(refresher), Some(commands)) =
            (self.token_refresher.clone(), self.commands.upgrade())
        else {
            warn!("token rejected and no refresher configured, waiting for a new token");
            return;
        };
        let user_id = self.request.as_ref().and_then(|r| r.user.as_ref()).map(|u| u.user_id.clone());
        let Some(user_id) = user_id else {
            warn!("token rejected on an anonymous connection");
            return;
        };

        info!(%user_id, "refreshing token");
        tokio::spawn(async move {
            let result = refresher.refresh(&user_id).await;
            let _ = commands.send(Command::TokenRefreshed(result));
        });
    }
}

async fn deliver(mut rx: mpsc::UnboundedReceiver<Delivery>, listeners: Arc<ListenerRegistry>) {
    while let Some(delivery) = rx.recv().await {
        for listener in listeners.snapshot() {
            match &delivery {
                Delivery::State(ConnectionState::Connecting) => listener.on_connecting(),
                Delivery::State(ConnectionState::Connected(session)) => {
                    listener.on_connected(session);
                },
                Delivery::State(ConnectionState::Disconnected { will_reconnect }) => {
                    listener.on_disconnected(*will_reconnect);
                },
                Delivery::State(ConnectionState::Error(cause)) => listener.on_error(cause),
                Delivery::Event(event) => listener.on_event(event),
            }
        }
    }
}
