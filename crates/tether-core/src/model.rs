//! Cached domain objects served by offline recovery.
//!
//! Only the fields the offline handlers need are modelled; full domain
//! objects belong to the state layer above this crate.

use crate::message::SyncStatus;

/// A channel as known locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    /// Full id, `type:id`
    pub cid: String,
    /// Display name
    pub name: Option<String>,
    /// Members added at creation
    pub member_ids: Vec<String>,
    /// Reconciliation state
    pub sync_status: SyncStatus,
}

impl Channel {
    /// Channel created locally and not yet confirmed by the server.
    pub fn local(cid: impl Into<String>, member_ids: Vec<String>) -> Self {
        Self { cid: cid.into(), name: None, member_ids, sync_status: SyncStatus::SyncNeeded }
    }
}

/// A channel member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    /// Member's user id
    pub user_id: String,
    /// Channel role
    pub role: String,
}

/// A reaction on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reaction {
    /// Reacted-to message
    pub message_id: String,
    /// Reacting user
    pub user_id: String,
    /// Reaction type, e.g. `like`
    pub kind: String,
    /// Score for cumulative reactions
    pub score: u32,
    /// Deletion time, ms since the Unix epoch, for locally deleted reactions
    pub deleted_at: Option<u64>,
    /// Reconciliation state
    pub sync_status: SyncStatus,
}

impl Reaction {
    /// New reaction with score 1.
    pub fn new(
        message_id: impl Into<String>,
        user_id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            user_id: user_id.into(),
            kind: kind.into(),
            score: 1,
            deleted_at: None,
            sync_status: SyncStatus::Idle,
        }
    }
}
