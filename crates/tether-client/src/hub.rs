//! Event distribution hub.
//!
//! Fans connection lifecycle changes and chat events out to filtered
//! subscriptions. Lifecycle changes arrive as [`HubEvent`] pseudo-events on
//! the same stream as chat events, so subscribers see them in the order the
//! socket published them.
//!
//! The subscription set is copy-on-write: each dispatch works on a snapshot,
//! so subscribing or disposing from inside a callback is safe. A subscription
//! checks its disposed flag under a per-subscription gate immediately before
//! calling its listener, and [`Disposable::dispose`] takes the same gate, so
//! once `dispose` returns the listener is never called again.
//!
//! The hub only registers with its [`EventSource`] while it has at least one
//! live subscription.

use std::{
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::{Mutex, ReentrantMutex};
use tether_core::{ErrorCause, SessionInfo};
use tether_proto::ChatEvent;
use tracing::{debug, trace};

use crate::socket::{ListenerId, SocketHandle, SocketListener};

/// Something the hub can register a listener with.
pub trait EventSource: Send + Sync {
    /// Register `listener` for connection and event callbacks.
    fn add_listener(&self, listener: Arc<dyn SocketListener>) -> ListenerId;

    /// Deregister a listener. Returns whether it was registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

impl EventSource for SocketHandle {
    fn add_listener(&self, listener: Arc<dyn SocketListener>) -> ListenerId {
        SocketHandle::add_listener(self, listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        SocketHandle::remove_listener(self, id)
    }
}

/// Event seen by hub subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    /// Connection attempt started
    Connecting,
    /// Handshake completed
    Connected(SessionInfo),
    /// Connection is down
    Disconnected {
        /// Whether a reconnect is scheduled
        will_reconnect: bool,
    },
    /// Connection failed
    Error(ErrorCause),
    /// Chat event from the server
    Chat(ChatEvent),
}

impl HubEvent {
    /// Type tag used by [`EventFilter::event_type`].
    pub fn event_type(&self) -> &str {
        match self {
            Self::Connecting => "connection.connecting",
            Self::Connected(_) => "connection.connected",
            Self::Disconnected { .. } => "connection.disconnected",
            Self::Error(_) => "connection.error",
            Self::Chat(event) => &event.event_type,
        }
    }

    /// Channel the event belongs to, if any.
    pub fn cid(&self) -> Option<&str> {
        match self {
            Self::Chat(event) => event.cid.as_deref(),
            _ => None,
        }
    }

    /// Whether this is a connection lifecycle pseudo-event.
    pub fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::Chat(_))
    }
}

/// Predicate over hub events.
#[derive(Clone)]
pub struct EventFilter(Arc<dyn Fn(&HubEvent) -> bool + Send + Sync>);

impl EventFilter {
    /// Filter from an arbitrary predicate.
    pub fn new(predicate: impl Fn(&HubEvent) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Matches everything.
    pub fn any() -> Self {
        Self::new(|_| true)
    }

    /// Matches events with this type tag.
    pub fn event_type(event_type: impl Into<String>) -> Self {
        let event_type = event_type.into();
        Self::new(move |event| event.event_type() == event_type)
    }

    /// Matches chat events for one channel.
    pub fn channel(cid: impl Into<String>) -> Self {
        let cid = cid.into();
        Self::new(move |event| event.cid() == Some(cid.as_str()))
    }

    /// Matches connection lifecycle pseudo-events.
    pub fn lifecycle() -> Self {
        Self::new(HubEvent::is_lifecycle)
    }

    /// Apply the predicate.
    pub fn matches(&self, event: &HubEvent) -> bool {
        (self.0)(event)
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventFilter(..)")
    }
}

type Listener = Box<dyn Fn(&HubEvent) + Send + Sync>;

struct Subscription {
    filters: Vec<EventFilter>,
    listener: Listener,
    once: bool,
    // Reentrant so a listener may dispose its own subscription.
    gate: ReentrantMutex<()>,
    disposed: AtomicBool,
}

impl Subscription {
    fn matches(&self, event: &HubEvent) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(event))
    }

    fn deliver(&self, event: &HubEvent) {
        if !self.matches(event) {
            return;
        }

        let _gate = self.gate.lock();
        if self.once {
            if self.disposed.swap(true, Ordering::AcqRel) {
                return;
            }
        } else if self.disposed.load(Ordering::Acquire) {
            return;
        }
        (self.listener)(event);
    }

    fn dispose(&self) {
        let _gate = self.gate.lock();
        self.disposed.store(true, Ordering::Release);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

struct HubState {
    subscriptions: Arc<Vec<Arc<Subscription>>>,
    registration: Option<ListenerId>,
}

struct HubInner {
    source: Arc<dyn EventSource>,
    state: Mutex<HubState>,
}

impl HubInner {
    fn dispatch(&self, event: &HubEvent) {
        let snapshot = Arc::clone(&self.state.lock().subscriptions);
        trace!(event_type = event.event_type(), subscribers = snapshot.len(), "dispatch");

        for subscription in snapshot.iter() {
            subscription.deliver(event);
        }

        if snapshot.iter().any(|s| s.is_disposed()) {
            self.prune();
        }
    }

    fn prune(&self) {
        let mut state = self.state.lock();
        if state.subscriptions.iter().any(|s| s.is_disposed()) {
            let live: Vec<_> =
                state.subscriptions.iter().filter(|s| !s.is_disposed()).cloned().collect();
            state.subscriptions = Arc::new(live);
        }

        if state.subscriptions.is_empty() {
            if let Some(id) = state.registration.take() {
                debug!("last subscription gone, detaching hub");
                self.source.remove_listener(id);
            }
        }
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        // Outstanding Disposables only hold weak references.
        if let Some(id) = self.state.get_mut().registration.take() {
            debug!("hub dropped with live subscriptions, detaching");
            self.source.remove_listener(id);
        }
    }
}

/// Socket listener that forwards into the hub without keeping it alive.
struct HubListener(Weak<HubInner>);

impl HubListener {
    fn forward(&self, event: HubEvent) {
        if let Some(hub) = self.0.upgrade() {
            hub.dispatch(&event);
        }
    }
}

impl SocketListener for HubListener {
    fn on_connecting(&self) {
        self.forward(HubEvent::Connecting);
    }

    fn on_connected(&self, session: &SessionInfo) {
        self.forward(HubEvent::Connected(session.clone()));
    }

    fn on_disconnected(&self, will_reconnect: bool) {
        self.forward(HubEvent::Disconnected { will_reconnect });
    }

    fn on_error(&self, cause: &ErrorCause) {
        self.forward(HubEvent::Error(cause.clone()));
    }

    fn on_event(&self, event: &ChatEvent) {
        self.forward(HubEvent::Chat(event.clone()));
    }
}

/// Fan-out of socket events to filtered subscriptions. Cheap to clone.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("subscriptions", &self.subscription_count())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl EventHub {
    /// Hub over `source`. Registers nothing until the first subscription.
    pub fn new(source: Arc<dyn EventSource>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                source,
                state: Mutex::new(HubState {
                    subscriptions: Arc::new(Vec::new()),
                    registration: None,
                }),
            }),
        }
    }

    /// Deliver matching events to `listener` until the handle is disposed.
    ///
    /// An event matches if any filter accepts it; no filters matches
    /// everything. Each event is delivered at most once per subscription.
    pub fn subscribe(
        &self,
        filters: impl IntoIterator<Item = EventFilter>,
        listener: impl Fn(&HubEvent) + Send + Sync + 'static,
    ) -> Disposable {
        self.add(filters.into_iter().collect(), Box::new(listener), false)
    }

    /// Like [`subscribe`](Self::subscribe), but disposes itself after the
    /// first matching event.
    pub fn subscribe_once(
        &self,
        filters: impl IntoIterator<Item = EventFilter>,
        listener: impl Fn(&HubEvent) + Send + Sync + 'static,
    ) -> Disposable {
        self.add(filters.into_iter().collect(), Box::new(listener), true)
    }

    /// Live subscriptions. Disposed ones count until the next prune.
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscriptions.len()
    }

    /// Whether the hub is registered with its source.
    pub fn is_attached(&self) -> bool {
        self.inner.state.lock().registration.is_some()
    }

    fn add(&self, filters: Vec<EventFilter>, listener: Listener, once: bool) -> Disposable {
        let subscription = Arc::new(Subscription {
            filters,
            listener,
            once,
            gate: ReentrantMutex::new(()),
            disposed: AtomicBool::new(false),
        });

        let mut state = self.inner.state.lock();
        let mut next = Vec::with_capacity(state.subscriptions.len() + 1);
        next.extend(state.subscriptions.iter().cloned());
        next.push(Arc::clone(&subscription));
        state.subscriptions = Arc::new(next);

        if state.registration.is_none() {
            debug!("first subscription, attaching hub");
            let listener = Arc::new(HubListener(Arc::downgrade(&self.inner)));
            state.registration = Some(self.inner.source.add_listener(listener));
        }

        Disposable { hub: Arc::downgrade(&self.inner), subscription }
    }
}

/// Handle to a hub subscription.
#[must_use = "dropping the handle does not unsubscribe; call dispose()"]
pub struct Disposable {
    hub: Weak<HubInner>,
    subscription: Arc<Subscription>,
}

impl fmt::Debug for Disposable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposable").field("disposed", &self.is_disposed()).finish()
    }
}

impl Disposable {
    /// Stop delivery. Once this returns the listener is not called again.
    ///
    /// If a delivery is in progress on another thread, waits for it.
    pub fn dispose(&self) {
        self.subscription.dispose();
        if let Some(hub) = self.hub.upgrade() {
            hub.prune();
        }
    }

    /// Whether the subscription is disposed, explicitly or after a
    /// single-shot delivery.
    pub fn is_disposed(&self) -> bool {
        self.subscription.is_disposed()
    }
}
