//! Scripted transmitter and connectivity flag for the send pipeline.

use std::{
    collections::{HashSet, VecDeque},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_client::{Connectivity, MessageTransmitter};
use tether_core::{ChatError, message::OutboundMessage};
use tokio::sync::watch;

/// Records transmitted messages; fails or holds on demand.
pub struct SimTransmitter {
    transmitted: Mutex<Vec<OutboundMessage>>,
    failures: Mutex<VecDeque<ChatError>>,
    held: watch::Sender<HashSet<String>>,
    parked: watch::Sender<usize>,
}

impl Default for SimTransmitter {
    fn default() -> Self {
        Self {
            transmitted: Mutex::default(),
            failures: Mutex::default(),
            held: watch::channel(HashSet::new()).0,
            parked: watch::channel(0).0,
        }
    }
}

impl SimTransmitter {
    /// Transmitter that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next transmit with `error`. Queued failures apply in order.
    pub fn fail_next(&self, error: ChatError) {
        self.failures.lock().push_back(error);
    }

    /// Park transmits of `id` until [`release`](Self::release).
    pub fn hold(&self, id: &str) {
        self.held.send_modify(|held| {
            held.insert(id.to_string());
        });
    }

    /// Let parked and future transmits of `id` through.
    pub fn release(&self, id: &str) {
        self.held.send_modify(|held| {
            held.remove(id);
        });
    }

    /// Wait until at least `count` transmits have been parked.
    pub async fn wait_for_parked(&self, count: usize) {
        let mut parked = self.parked.subscribe();
        let _ = parked.wait_for(|n| *n >= count).await;
    }

    /// Messages accepted so far, in order.
    pub fn transmitted(&self) -> Vec<OutboundMessage> {
        self.transmitted.lock().clone()
    }

    /// How many times `id` was accepted.
    pub fn count_of(&self, id: &str) -> usize {
        self.transmitted.lock().iter().filter(|m| m.id == id).count()
    }
}

#[async_trait]
impl MessageTransmitter for SimTransmitter {
    async fn transmit(&self, message: &OutboundMessage) -> Result<(), ChatError> {
        let mut held = self.held.subscribe();
        if held.borrow().contains(&message.id) {
            self.parked.send_modify(|n| *n += 1);
            let _ = held.wait_for(|held| !held.contains(&message.id)).await;
        }
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        self.transmitted.lock().push(message.clone());
        Ok(())
    }
}

/// Connectivity flag the test flips.
#[derive(Debug)]
pub struct SimConnectivity(AtomicBool);

impl SimConnectivity {
    /// Flag starting at `online`.
    pub fn new(online: bool) -> Self {
        Self(AtomicBool::new(online))
    }

    /// Change the flag.
    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl Connectivity for SimConnectivity {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
