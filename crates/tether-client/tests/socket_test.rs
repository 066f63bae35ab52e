//! Socket runtime against the scripted transport, on a paused tokio clock.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tether_client::{
    ChatError, ConnectRequest, ConnectionConfig, ConnectionState, ErrorCause, MessageTransmitter,
    SocketHandle, SystemEnv, TokenRefresher, UserCredentials, socket,
};
use tether_core::{OutboundMessage, connection::CLOSE_NORMAL};
use tether_harness::{EventRecorder, SimTransportFactory};
use tether_proto::{ChatEvent, ErrorPayload, Payload};

fn request() -> ConnectRequest {
    ConnectRequest {
        endpoint: "127.0.0.1:4433".into(),
        api_key: "key".into(),
        user: Some(UserCredentials { user_id: "alice".into(), token: "stale".into() }),
    }
}

fn start(
    factory: &SimTransportFactory,
    refresher: Option<Arc<dyn TokenRefresher>>,
) -> (SocketHandle, Arc<EventRecorder>) {
    let socket =
        socket::spawn(SystemEnv, Arc::new(factory.clone()), ConnectionConfig::default(), refresher);
    let recorder = EventRecorder::shared();
    socket.add_listener(recorder.clone());
    (socket, recorder)
}

async fn connected(factory: &SimTransportFactory, recorder: &EventRecorder) {
    factory.wait_for_open(1).await;
    assert!(factory.accept(0));
    assert_eq!(recorder.take(2).await, ["connecting", "connected:conn-0"]);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_is_published_in_order() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, None);
    assert_eq!(socket.state(), ConnectionState::INITIAL);

    socket.connect(request()).unwrap();
    connected(&factory, &recorder).await;
    assert!(socket.is_connected());
    assert_eq!(factory.request(0).unwrap().api_key, "key");

    socket.disconnect().await.unwrap();
    assert_eq!(socket.state(), ConnectionState::Disconnected { will_reconnect: false });
    assert_eq!(recorder.take(1).await, ["disconnected:false"]);
    factory.wait_for_close(1).await;
    assert_eq!(factory.closes().len(), 1);
    assert_eq!(factory.closes()[0].1, CLOSE_NORMAL);

    // No timers survive a disconnect.
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(factory.open_count(), 1);
    assert!(recorder.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn transient_errors_reconnect_after_backoff() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, None);
    socket.connect(request()).unwrap();
    connected(&factory, &recorder).await;

    factory.sink(0).unwrap().on_transport_error(ErrorCause::Network("reset".into()));
    assert_eq!(recorder.take(2).await, ["error:network: reset", "disconnected:true"]);
    assert_eq!(socket.state(), ConnectionState::Disconnected { will_reconnect: true });

    factory.wait_for_open(2).await;
    assert_eq!(recorder.next().await.as_deref(), Some("connecting"));
    assert!(factory.accept(1));
    assert_eq!(recorder.next().await.as_deref(), Some("connected:conn-1"));
}

#[tokio::test(start_paused = true)]
async fn failed_open_is_a_transient_error() {
    let factory = SimTransportFactory::new();
    factory.fail_next_open("refused");
    let (socket, recorder) = start(&factory, None);

    socket.connect(request()).unwrap();
    let labels = recorder.take(3).await;
    assert_eq!(labels[0], "connecting");
    assert!(labels[1].starts_with("error:network"), "{labels:?}");
    assert_eq!(labels[2], "disconnected:true");

    factory.wait_for_open(2).await;
    assert!(factory.accept(1));
    assert_eq!(recorder.take(2).await, ["connecting", "connected:conn-1"]);
}

#[tokio::test(start_paused = true)]
async fn signals_from_replaced_transports_are_dropped() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, None);

    socket.connect(request()).unwrap();
    factory.wait_for_open(1).await;
    socket.connect(request()).unwrap();
    factory.wait_for_open(2).await;

    let stale = factory.sink(0).unwrap();
    stale.on_session_established(tether_client::SessionInfo {
        connection_id: "old".into(),
        user_id: None,
    });
    stale.on_raw_event(ChatEvent::new("message.new", Some("messaging:general".into()), 1));
    stale.on_transport_error(ErrorCause::Network("late".into()));

    assert!(factory.accept(1));
    assert_eq!(
        recorder.take(4).await,
        ["connecting", "disconnected:true", "connecting", "connected:conn-1"]
    );
    assert!(recorder.drain().is_empty());
    factory.wait_for_close(1).await;
    assert_eq!(factory.closes()[0].0, 0);
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn chat_events_reach_listeners_but_health_checks_do_not() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, None);
    socket.connect(request()).unwrap();
    connected(&factory, &recorder).await;

    let sink = factory.sink(0).unwrap();
    sink.on_raw_event(ChatEvent::health_check(1));
    sink.on_raw_event(ChatEvent::new("message.new", Some("messaging:general".into()), 2));
    assert_eq!(recorder.next().await.as_deref(), Some("event:message.new"));
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn health_checks_are_sent_and_silence_reconnects() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, None);
    socket.connect(request()).unwrap();
    connected(&factory, &recorder).await;

    tokio::time::sleep(Duration::from_millis(10_500)).await;
    let sent = factory.sent_payloads(0);
    assert_eq!(sent.len(), 1);
    assert!(matches!(&sent[0], Payload::Event(e) if e.is_health_check()));

    // Nothing ever answers: silence is detected once, then a reconnect.
    let labels = recorder.take(2).await;
    assert!(labels[0].starts_with("error:no events for"), "{labels:?}");
    assert_eq!(labels[1], "disconnected:true");
    factory.wait_for_open(2).await;
}

#[tokio::test(start_paused = true)]
async fn server_errors_are_classified() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, None);
    socket.connect(request()).unwrap();
    connected(&factory, &recorder).await;

    let rejected = Payload::Error(ErrorPayload::new(ErrorPayload::API_KEY_NOT_FOUND, "no key", 401));
    factory.sink(0).unwrap().on_frame(&rejected.to_wire().unwrap());

    let labels = recorder.take(2).await;
    assert!(labels[0].starts_with("error:invalid credentials"), "{labels:?}");
    assert_eq!(labels[1], "disconnected:false");

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(factory.open_count(), 1);
}

struct FixedRefresher;

#[async_trait]
impl TokenRefresher for FixedRefresher {
    async fn refresh(&self, user_id: &str) -> Result<String, ChatError> {
        Ok(format!("fresh-{user_id}"))
    }
}

#[tokio::test(start_paused = true)]
async fn token_rejection_refreshes_and_resumes() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, Some(Arc::new(FixedRefresher)));
    socket.connect(request()).unwrap();
    connected(&factory, &recorder).await;

    let expired = Payload::Error(ErrorPayload::new(ErrorPayload::TOKEN_EXPIRED, "expired", 401));
    factory.sink(0).unwrap().on_frame(&expired.to_wire().unwrap());

    assert_eq!(
        recorder.take(3).await,
        ["error:token rejected (40): expired", "disconnected:false", "connecting"]
    );
    factory.wait_for_open(2).await;
    assert_eq!(factory.request(1).unwrap().user.unwrap().token, "fresh-alice");
}

#[tokio::test(start_paused = true)]
async fn token_rejection_without_refresher_waits_for_the_application() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, None);
    socket.connect(request()).unwrap();
    connected(&factory, &recorder).await;

    let invalid = Payload::Error(ErrorPayload::new(ErrorPayload::TOKEN_NOT_VALID, "bad", 401));
    factory.sink(0).unwrap().on_frame(&invalid.to_wire().unwrap());
    assert_eq!(recorder.take(2).await[1], "disconnected:false");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(factory.open_count(), 1);

    socket.token_refreshed("manual").unwrap();
    factory.wait_for_open(2).await;
    assert_eq!(factory.request(1).unwrap().user.unwrap().token, "manual");
}

#[tokio::test(start_paused = true)]
async fn messages_are_written_only_while_connected() {
    let factory = SimTransportFactory::auto_accept();
    let (socket, recorder) = start(&factory, None);

    let mut message = OutboundMessage::new("messaging:general", "hello");
    message.id = "m1".into();
    assert_eq!(socket.transmit(&message).await, Err(ChatError::Offline));

    socket.connect(request()).unwrap();
    assert_eq!(recorder.take(2).await, ["connecting", "connected:conn-0"]);

    socket.transmit(&message).await.unwrap();
    let sent = factory.sent_payloads(0);
    let Some(Payload::SendMessage(envelope)) = sent.last() else {
        panic!("expected a message frame, got {sent:?}");
    };
    assert_eq!(envelope.id, "m1");
    assert_eq!(envelope.text, "hello");
}

#[tokio::test(start_paused = true)]
async fn removed_listeners_stop_receiving() {
    let factory = SimTransportFactory::auto_accept();
    let socket =
        socket::spawn(SystemEnv, Arc::new(factory.clone()), ConnectionConfig::default(), None);
    let kept = EventRecorder::shared();
    let removed = EventRecorder::shared();
    socket.add_listener(kept.clone());
    let id = socket.add_listener(removed.clone());

    assert!(socket.remove_listener(id));
    assert!(!socket.remove_listener(id));

    socket.connect(request()).unwrap();
    assert_eq!(kept.take(2).await, ["connecting", "connected:conn-0"]);
    assert!(removed.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_closes_the_transport() {
    let factory = SimTransportFactory::new();
    let (socket, recorder) = start(&factory, None);
    socket.connect(request()).unwrap();
    connected(&factory, &recorder).await;

    // The live transport still holds its sink; that must not keep the socket up.
    drop(socket);
    assert_eq!(recorder.take(1).await, ["disconnected:false"]);
    factory.wait_for_close(1).await;
    assert_eq!(factory.closes().len(), 1);
    assert_eq!(factory.closes()[0].1, CLOSE_NORMAL);
}

#[tokio::test(start_paused = true)]
async fn stalled_write_does_not_hold_up_the_socket() {
    let factory = SimTransportFactory::auto_accept();
    factory.stall_writes();
    let (socket, recorder) = start(&factory, None);
    socket.connect(request()).unwrap();
    assert_eq!(recorder.take(2).await, ["connecting", "connected:conn-0"]);

    let mut message = OutboundMessage::new("messaging:general", "stuck");
    message.id = "m1".into();
    let writer = socket.clone();
    let stuck = tokio::spawn(async move { writer.transmit(&message).await });

    // Health monitoring keeps running behind the stuck write.
    let labels = tokio::time::timeout(Duration::from_secs(60), recorder.take(2)).await.unwrap();
    assert!(labels[0].starts_with("error:no events for"), "{labels:?}");
    assert_eq!(labels[1], "disconnected:true");

    // Closing the silent transport cancels the write in flight.
    assert!(stuck.await.unwrap().is_err());
    factory.wait_for_close(1).await;
    factory.wait_for_open(2).await;
    assert_eq!(recorder.take(2).await, ["connecting", "connected:conn-1"]);

    tokio::time::timeout(Duration::from_secs(60), socket.disconnect()).await.unwrap().unwrap();
    assert_eq!(socket.state(), ConnectionState::Disconnected { will_reconnect: false });
    factory.wait_for_close(2).await;
    assert_eq!(factory.sent_count(), 0);
}
