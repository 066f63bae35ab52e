//! Transport boundary.
//!
//! The socket never deals with TLS, framing or streams directly. It asks a
//! [`TransportFactory`] for a [`Transport`] and hands it a [`TransportSink`];
//! the transport reports the handshake, inbound events and failures through
//! the sink. Each sink is bound to one connection attempt, so signals from a
//! transport the socket has since replaced are discarded.

#[cfg(feature = "transport")]
pub mod quic;

use async_trait::async_trait;
use bytes::Bytes;
use tether_core::{ErrorCause, SessionInfo};
use tether_proto::{ChatEvent, Frame, Payload};
use tokio::sync::mpsc;

use crate::{error::TransportError, socket::Command};

/// User credentials for an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCredentials {
    /// User id
    pub user_id: String,
    /// Auth token
    pub token: String,
}

/// Everything a factory needs to open a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Server address
    pub endpoint: String,
    /// Application API key
    pub api_key: String,
    /// Connecting user; `None` for anonymous connections
    pub user: Option<UserCredentials>,
}

impl ConnectRequest {
    /// Handshake payload for this request.
    pub fn connect_payload(&self) -> Payload {
        Payload::Connect(tether_proto::Connect {
            api_key: self.api_key.clone(),
            user_id: self.user.as_ref().map(|u| u.user_id.clone()),
            token: self.user.as_ref().map(|u| u.token.clone()),
        })
    }
}

/// A connected, bidirectional channel to the server.
#[async_trait]
pub trait Transport: Send {
    /// Write one encoded frame.
    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError>;

    /// Close with a code and reason. Must not block on the network or
    /// report an error to the sink.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Opens transports.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport for `request`, reporting inbound traffic to `sink`.
    ///
    /// Implementations send the handshake themselves; the server's answer
    /// comes back through [`TransportSink::on_session_established`] or
    /// [`TransportSink::on_transport_error`].
    async fn open(
        &self,
        request: &ConnectRequest,
        sink: TransportSink,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// What a transport reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TransportSignal {
    SessionEstablished(SessionInfo),
    Event(ChatEvent),
    Error(ErrorCause),
}

/// Callback injection point handed to each transport.
///
/// Cheap to clone; methods never block. A sink does not keep the socket
/// alive: once every [`SocketHandle`](crate::SocketHandle) is dropped its
/// signals go nowhere.
#[derive(Debug, Clone)]
pub struct TransportSink {
    attempt: u64,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl TransportSink {
    pub(crate) fn new(attempt: u64, commands: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self { attempt, commands }
    }

    /// Connection attempt this sink belongs to.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// The server accepted the handshake.
    pub fn on_session_established(&self, session: SessionInfo) {
        self.signal(TransportSignal::SessionEstablished(session));
    }

    /// An event arrived.
    pub fn on_raw_event(&self, event: ChatEvent) {
        self.signal(TransportSignal::Event(event));
    }

    /// The transport failed.
    pub fn on_transport_error(&self, cause: ErrorCause) {
        self.signal(TransportSignal::Error(cause));
    }

    /// Decode one wire frame and report it.
    ///
    /// Undecodable frames are reported as protocol errors. Server error
    /// frames are classified by code and goodbyes count as network drops.
    pub fn on_frame(&self, bytes: &[u8]) {
        let payload = Frame::decode(bytes).and_then(|frame| Payload::from_frame(&frame));

        match payload {
            Ok(Payload::Connected(connected)) => self.on_session_established(SessionInfo {
                connection_id: connected.connection_id,
                user_id: connected.user_id,
            }),
            Ok(Payload::Event(event)) => self.on_raw_event(event),
            Ok(Payload::Error(error)) => self.on_transport_error(ErrorCause::from(&error)),
            Ok(Payload::Goodbye(goodbye)) => self.on_transport_error(ErrorCause::Network(
                format!("server closed ({}): {}", goodbye.code, goodbye.reason),
            )),
            Ok(other) => self.on_transport_error(ErrorCause::Protocol(format!(
                "unexpected {:?} frame from server",
                other.opcode()
            ))),
            Err(e) => self.on_transport_error(ErrorCause::Protocol(e.to_string())),
        }
    }

    fn signal(&self, signal: TransportSignal) {
        let Some(commands) = self.commands.upgrade() else { return };
        let _ = commands.send(Command::Transport { attempt: self.attempt, signal });
    }
}

#[cfg(test)]
mod tests {
    use tether_proto::{Connected, ErrorPayload};

    use super::*;

    struct Harness {
        sink: TransportSink,
        rx: mpsc::UnboundedReceiver<Command>,
        _tx: mpsc::UnboundedSender<Command>,
    }

    fn harness() -> Harness {
        let (tx, rx) = mpsc::unbounded_channel();
        Harness { sink: TransportSink::new(7, tx.downgrade()), rx, _tx: tx }
    }

    fn next_signal(rx: &mut mpsc::UnboundedReceiver<Command>) -> TransportSignal {
        match rx.try_recv() {
            Ok(Command::Transport { attempt: 7, signal }) => signal,
            other => panic!("expected transport signal, got {other:?}"),
        }
    }

    #[test]
    fn frames_are_routed_by_opcode() {
        let Harness { sink, mut rx, _tx } = harness();

        let connected = Payload::Connected(Connected {
            connection_id: "c1".into(),
            user_id: Some("alice".into()),
        });
        sink.on_frame(&connected.to_wire().unwrap());
        assert_eq!(
            next_signal(&mut rx),
            TransportSignal::SessionEstablished(SessionInfo {
                connection_id: "c1".into(),
                user_id: Some("alice".into()),
            })
        );

        let error = Payload::Error(ErrorPayload::new(ErrorPayload::TOKEN_EXPIRED, "expired", 401));
        sink.on_frame(&error.to_wire().unwrap());
        let TransportSignal::Error(cause) = next_signal(&mut rx) else {
            panic!("expected error signal");
        };
        assert!(cause.requires_token_refresh());
    }

    #[test]
    fn garbage_is_a_protocol_error() {
        let Harness { sink, mut rx, _tx } = harness();
        sink.on_frame(b"definitely not a frame");
        assert!(matches!(next_signal(&mut rx), TransportSignal::Error(ErrorCause::Protocol(_))));
    }

    #[test]
    fn dropped_socket_silences_sink() {
        let Harness { sink, mut rx, _tx: tx } = harness();
        drop(tx);

        sink.on_raw_event(ChatEvent::new("message.new", None, 0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn connect_payload_carries_credentials() {
        let request = ConnectRequest {
            endpoint: "127.0.0.1:4433".into(),
            api_key: "key".into(),
            user: Some(UserCredentials { user_id: "alice".into(), token: "tok".into() }),
        };
        let Payload::Connect(connect) = request.connect_payload() else {
            panic!("expected connect payload");
        };
        assert_eq!(connect.user_id.as_deref(), Some("alice"));
        assert_eq!(connect.token.as_deref(), Some("tok"));
    }
}
