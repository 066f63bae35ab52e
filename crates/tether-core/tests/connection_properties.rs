//! Property-based tests for the connection state machine and backoff.
//!
//! Arbitrary sequences of lifecycle calls must keep the machine in a resting
//! state after every call, and a new session is never established without
//! passing through `Disconnected` first.

use std::time::Duration;

use proptest::prelude::*;
use tether_core::{
    Backoff, Connection, ConnectionAction, ConnectionConfig, ConnectionState, ErrorCause,
    SessionInfo,
};
use tether_harness::SimEnv;
use tether_proto::ChatEvent;

#[derive(Debug, Clone)]
enum Op {
    Connect,
    Disconnect,
    Established(u8),
    Event,
    NetworkError,
    TokenError,
    CredentialsError,
    TokenRefreshed,
    Advance(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Connect),
        1 => Just(Op::Disconnect),
        3 => any::<u8>().prop_map(Op::Established),
        2 => Just(Op::Event),
        2 => Just(Op::NetworkError),
        1 => Just(Op::TokenError),
        1 => Just(Op::CredentialsError),
        1 => Just(Op::TokenRefreshed),
        3 => (0u16..30_000).prop_map(Op::Advance),
    ]
}

fn apply(conn: &mut Connection<SimEnv>, env: &SimEnv, op: &Op) -> Vec<ConnectionAction> {
    match op {
        Op::Connect => conn.connect(),
        Op::Disconnect => conn.disconnect(),
        Op::Established(n) => conn
            .on_session_established(SessionInfo {
                connection_id: format!("conn-{n}"),
                user_id: None,
            })
            .unwrap_or_default(),
        Op::Event => conn
            .on_raw_event(ChatEvent::new("message.new", None, 0))
            .unwrap_or_default(),
        Op::NetworkError => conn.on_transport_error(ErrorCause::Network("reset".into())),
        Op::TokenError => conn.on_transport_error(ErrorCause::from_code(40, "expired")),
        Op::CredentialsError => conn.on_transport_error(ErrorCause::from_code(2, "bad key")),
        Op::TokenRefreshed => conn.on_token_refreshed(),
        Op::Advance(ms) => {
            env.advance(Duration::from_millis(u64::from(*ms)));
            conn.tick()
        },
    }
}

proptest! {
    #[test]
    fn prop_state_totality(seed in any::<u64>(), ops in prop::collection::vec(op_strategy(), 0..80)) {
        let env = SimEnv::with_seed(seed);
        let mut conn = Connection::new(env.clone(), ConnectionConfig::default());

        let mut published = vec![conn.state().clone()];
        for op in &ops {
            for action in apply(&mut conn, &env, op) {
                if let ConnectionAction::Publish(state) = action {
                    published.push(state);
                }
            }

            // PROPERTY: Error is never a resting state
            let resting = !matches!(conn.state(), ConnectionState::Error(_));
            prop_assert!(resting, "resting in {:?} after {:?}", conn.state(), op);

            // PROPERTY: session exists exactly while connected
            prop_assert_eq!(conn.session().is_some(), conn.is_connected());

            // PROPERTY: the last publish is the current state
            prop_assert_eq!(published.last(), Some(conn.state()));
        }

        // PROPERTY: no Connected -> Connected without Disconnected in between
        let mut seen_disconnect = true;
        for state in &published {
            match state {
                ConnectionState::Connected(_) => {
                    prop_assert!(seen_disconnect, "two sessions without a disconnect: {:?}", published);
                    seen_disconnect = false;
                },
                ConnectionState::Disconnected { .. } => seen_disconnect = true,
                ConnectionState::Connecting | ConnectionState::Error(_) => {},
            }
        }

        // PROPERTY: Error is always immediately followed by Disconnected
        for pair in published.windows(2) {
            if matches!(pair[0], ConnectionState::Error(_)) {
                let followed = matches!(pair[1], ConnectionState::Disconnected { .. });
                prop_assert!(followed);
            }
        }
    }

    #[test]
    fn prop_backoff_bounds(failures in 1u32..200, entropy in any::<u64>()) {
        let backoff = Backoff::default();
        let (lo, hi) = backoff.bounds(failures);
        let delay = backoff.delay(failures, entropy);

        // PROPERTY: delay in [lo, hi), or pinned to the cap once the window closes
        if lo < hi {
            prop_assert!(lo <= delay && delay < hi, "{:?} not in [{:?}, {:?})", delay, lo, hi);
        } else {
            prop_assert_eq!(delay, backoff.cap);
        }

        // PROPERTY: hi is non-decreasing and never exceeds the cap
        let (_, next_hi) = backoff.bounds(failures + 1);
        prop_assert!(hi <= next_hi);
        prop_assert!(hi <= backoff.cap);
    }
}

#[test]
fn reconnect_attempts_back_off() {
    let env = SimEnv::with_seed(7);
    let mut conn = Connection::new(env.clone(), ConnectionConfig::default());
    conn.connect();

    let mut delays = Vec::new();
    for _ in 0..5 {
        let actions = conn.on_transport_error(ErrorCause::Network("refused".into()));
        let Some(ConnectionAction::ReconnectScheduled { delay, .. }) = actions.last().cloned()
        else {
            panic!("no reconnect scheduled: {actions:?}");
        };
        delays.push(delay);

        env.advance(delay);
        let actions = conn.tick();
        assert!(actions.contains(&ConnectionAction::OpenTransport));
    }

    assert_eq!(conn.consecutive_failures(), 5);
    for (n, delay) in delays.iter().enumerate() {
        let (lo, hi) = Backoff::default().bounds(n as u32 + 1);
        assert!(lo <= *delay && *delay < hi);
    }
}
