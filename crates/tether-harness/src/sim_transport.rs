//! Scripted transport factory and a listener that records callbacks.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tether_client::{
    ConnectRequest, SessionInfo, SocketListener, Transport, TransportError, TransportFactory,
    TransportSink,
};
use tether_core::ErrorCause;
use tether_proto::{ChatEvent, Frame, Payload};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Transport factory whose transports only record what the socket does.
///
/// Every `open` succeeds unless [`fail_next_open`](Self::fail_next_open)
/// was called; the test then drives the session through the recorded
/// [`TransportSink`]s. With [`auto_accept`](Self::auto_accept) each open is
/// immediately answered with a session. Clones share state.
#[derive(Clone, Default)]
pub struct SimTransportFactory {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    opened: watch::Sender<usize>,
    closed: watch::Sender<usize>,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            opened: watch::channel(0).0,
            closed: watch::channel(0).0,
        }
    }
}

#[derive(Default)]
struct State {
    auto_accept: bool,
    fail_next: Option<String>,
    stall_writes: bool,
    requests: Vec<ConnectRequest>,
    sinks: Vec<TransportSink>,
    sent: Vec<(usize, Bytes)>,
    closes: Vec<(usize, u16, String)>,
}

impl SimTransportFactory {
    /// Factory that leaves handshakes to the test.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory that establishes a session on every successful open.
    pub fn auto_accept() -> Self {
        let factory = Self::default();
        factory.inner.state.lock().auto_accept = true;
        factory
    }

    /// Fail the next open with a connection error.
    pub fn fail_next_open(&self, reason: impl Into<String>) {
        self.inner.state.lock().fail_next = Some(reason.into());
    }

    /// Make every write on every transport hang until it is cancelled.
    pub fn stall_writes(&self) {
        self.inner.state.lock().stall_writes = true;
    }

    /// Opens attempted so far, including failed ones.
    pub fn open_count(&self) -> usize {
        *self.inner.opened.borrow()
    }

    /// Wait until at least `count` opens were attempted.
    pub async fn wait_for_open(&self, count: usize) {
        let mut opened = self.inner.opened.subscribe();
        let _ = opened.wait_for(|n| *n >= count).await;
    }

    /// Wait until at least `count` transports were closed.
    pub async fn wait_for_close(&self, count: usize) {
        let mut closed = self.inner.closed.subscribe();
        let _ = closed.wait_for(|n| *n >= count).await;
    }

    /// Request of open number `index` (zero-based).
    pub fn request(&self, index: usize) -> Option<ConnectRequest> {
        self.inner.state.lock().requests.get(index).cloned()
    }

    /// Sink handed to open number `index`.
    pub fn sink(&self, index: usize) -> Option<TransportSink> {
        self.inner.state.lock().sinks.get(index).cloned()
    }

    /// Sink of the most recent open.
    pub fn last_sink(&self) -> Option<TransportSink> {
        self.inner.state.lock().sinks.last().cloned()
    }

    /// Answer open number `index` with a session `conn-<index>`.
    pub fn accept(&self, index: usize) -> bool {
        let Some(sink) = self.sink(index) else { return false };
        let user_id = self.request(index).and_then(|r| r.user.map(|u| u.user_id));
        sink.on_session_established(session(index, user_id));
        true
    }

    /// Payloads written to transport `index`, decoded.
    pub fn sent_payloads(&self, index: usize) -> Vec<Payload> {
        self.inner
            .state
            .lock()
            .sent
            .iter()
            .filter(|(i, _)| *i == index)
            .filter_map(|(_, bytes)| {
                Frame::decode(bytes).and_then(|frame| Payload::from_frame(&frame)).ok()
            })
            .collect()
    }

    /// Frames written across all transports.
    pub fn sent_count(&self) -> usize {
        self.inner.state.lock().sent.len()
    }

    /// `(transport index, code, reason)` for every close.
    pub fn closes(&self) -> Vec<(usize, u16, String)> {
        self.inner.state.lock().closes.clone()
    }
}

fn session(index: usize, user_id: Option<String>) -> SessionInfo {
    SessionInfo { connection_id: format!("conn-{index}"), user_id }
}

#[async_trait]
impl TransportFactory for SimTransportFactory {
    async fn open(
        &self,
        request: &ConnectRequest,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let (index, accept, failure) = {
            let mut state = self.inner.state.lock();
            let index = state.requests.len();
            state.requests.push(request.clone());
            state.sinks.push(sink.clone());
            (index, state.auto_accept, state.fail_next.take())
        };
        self.inner.opened.send_modify(|n| *n += 1);
        debug!(index, attempt = sink.attempt(), "sim transport open");

        if let Some(reason) = failure {
            return Err(TransportError::Connection(reason));
        }
        if accept {
            let user_id = request.user.as_ref().map(|u| u.user_id.clone());
            sink.on_session_established(session(index, user_id));
        }
        Ok(Box::new(SimTransport { index, inner: Arc::clone(&self.inner) }))
    }
}

struct SimTransport {
    index: usize,
    inner: Arc<Inner>,
}

#[async_trait]
impl Transport for SimTransport {
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        let stalled = self.inner.state.lock().stall_writes;
        if stalled {
            std::future::pending::<()>().await;
        }
        self.inner.state.lock().sent.push((self.index, frame));
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) {
        self.inner.state.lock().closes.push((self.index, code, reason.to_string()));
        self.inner.closed.send_modify(|n| *n += 1);
    }
}

/// Socket listener that turns callbacks into short labels.
///
/// Labels: `connecting`, `connected:<connection id>`,
/// `disconnected:<will_reconnect>`, `error:<cause>`, `event:<type>`.
pub struct EventRecorder {
    tx: mpsc::UnboundedSender<String>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl Default for EventRecorder {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: tokio::sync::Mutex::new(rx) }
    }
}

impl EventRecorder {
    /// Recorder behind an `Arc`, ready to register.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Next label, waiting for it.
    pub async fn next(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    /// Next `count` labels.
    pub async fn take(&self, count: usize) -> Vec<String> {
        let mut rx = self.rx.lock().await;
        let mut labels = Vec::with_capacity(count);
        while labels.len() < count {
            match rx.recv().await {
                Some(label) => labels.push(label),
                None => break,
            }
        }
        labels
    }

    /// Labels already delivered, without waiting.
    pub fn drain(&self) -> Vec<String> {
        let Ok(mut rx) = self.rx.try_lock() else { return Vec::new() };
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn record(&self, label: String) {
        let _ = self.tx.send(label);
    }
}

impl SocketListener for EventRecorder {
    fn on_connecting(&self) {
        self.record("connecting".into());
    }

    fn on_connected(&self, session: &SessionInfo) {
        self.record(format!("connected:{}", session.connection_id));
    }

    fn on_disconnected(&self, will_reconnect: bool) {
        self.record(format!("disconnected:{will_reconnect}"));
    }

    fn on_error(&self, cause: &ErrorCause) {
        self.record(format!("error:{cause}"));
    }

    fn on_event(&self, event: &ChatEvent) {
        self.record(format!("event:{}", event.event_type));
    }
}
