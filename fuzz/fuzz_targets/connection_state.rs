//! Fuzz target for the connection state machine.
//!
//! Drives `Connection` with arbitrary operation sequences on a simulated
//! clock and checks after every step:
//!
//! - `Error` is never a resting state
//! - a session exists exactly while connected
//! - every `Error` publish is followed by a `Disconnected` publish
//! - the last published state is the current state

#![no_main]

use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_core::{
    Connection, ConnectionAction, ConnectionConfig, ConnectionState, ErrorCause, SessionInfo,
};
use tether_harness::SimEnv;
use tether_proto::ChatEvent;

#[derive(Debug, Arbitrary)]
enum Op {
    Connect,
    Disconnect,
    Established,
    Event { health_check: bool },
    Error { code: u8 },
    NetworkDrop,
    TokenRefreshed,
    Advance { millis: u16 },
}

#[derive(Debug, Arbitrary)]
struct Input {
    seed: u64,
    ops: Vec<Op>,
}

fuzz_target!(|input: Input| {
    let env = SimEnv::with_seed(input.seed);
    let mut conn = Connection::new(env.clone(), ConnectionConfig::default());

    for op in input.ops.iter().take(256) {
        let actions = match op {
            Op::Connect => conn.connect(),
            Op::Disconnect => conn.disconnect(),
            Op::Established => conn
                .on_session_established(SessionInfo { connection_id: "c".into(), user_id: None })
                .unwrap_or_default(),
            Op::Event { health_check } => {
                let event = if *health_check {
                    ChatEvent::health_check(0)
                } else {
                    ChatEvent::new("message.new", None, 0)
                };
                conn.on_raw_event(event).unwrap_or_default()
            },
            Op::Error { code } => {
                conn.on_transport_error(ErrorCause::from_code(u32::from(*code), "fuzz"))
            },
            Op::NetworkDrop => conn.on_transport_error(ErrorCause::Network("drop".into())),
            Op::TokenRefreshed => conn.on_token_refreshed(),
            Op::Advance { millis } => {
                env.advance(Duration::from_millis(u64::from(*millis)));
                conn.tick()
            },
        };

        assert!(!matches!(conn.state(), ConnectionState::Error(_)));
        assert_eq!(conn.session().is_some(), conn.is_connected());

        let published: Vec<&ConnectionState> = actions
            .iter()
            .filter_map(|a| match a {
                ConnectionAction::Publish(state) => Some(state),
                _ => None,
            })
            .collect();
        for pair in published.windows(2) {
            if matches!(pair[0], ConnectionState::Error(_)) {
                assert!(matches!(pair[1], ConnectionState::Disconnected { .. }));
            }
        }
        if let Some(last) = published.last() {
            assert_eq!(*last, conn.state());
        }
    }
});
