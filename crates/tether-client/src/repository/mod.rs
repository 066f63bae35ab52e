//! Persistence boundary.
//!
//! The send pipeline writes every message here before touching the network,
//! and offline error handlers serve cached channels, members and reactions
//! from it. The trait is synchronous; implementations that need I/O should
//! keep it short or hand it to a blocking pool behind the trait.

mod memory;

pub use memory::MemoryRepository;
use tether_core::{
    message::{Attachment, OutboundMessage},
    model::{Channel, Member, Reaction},
};
use tokio::sync::watch;

use crate::error::RepositoryError;

/// Local store for messages and the cached domain objects offline recovery
/// needs.
///
/// Implementations are shared behind `Arc` and must be safe to call from
/// any task.
pub trait MessageRepository: Send + Sync {
    /// Insert or replace a message, including its attachments.
    ///
    /// # Invariants
    ///
    /// - Post: `select_message(&message.id)` returns this message
    /// - Post: feeds from `observe_attachments(&message.id)` see its
    ///   attachment list
    fn insert_message(&self, message: &OutboundMessage) -> Result<(), RepositoryError>;

    /// Message by id. `None` if unknown.
    fn select_message(&self, id: &str) -> Result<Option<OutboundMessage>, RepositoryError>;

    /// Feed of a message's attachment list.
    ///
    /// The current value is the latest known list; it is empty for unknown
    /// ids and fills in once the message is inserted.
    fn observe_attachments(&self, message_id: &str) -> watch::Receiver<Vec<Attachment>>;

    /// Replace one attachment of a stored message, matched by attachment id.
    ///
    /// Uploaders report progress through this.
    fn update_attachment(
        &self,
        message_id: &str,
        attachment: Attachment,
    ) -> Result<(), RepositoryError>;

    /// Insert or replace a channel.
    fn insert_channel(&self, channel: &Channel) -> Result<(), RepositoryError>;

    /// Channel by cid. `None` if unknown.
    fn select_channel(&self, cid: &str) -> Result<Option<Channel>, RepositoryError>;

    /// Replace the cached member list of a channel.
    fn insert_members(&self, cid: &str, members: &[Member]) -> Result<(), RepositoryError>;

    /// Cached members of a channel in insertion order.
    fn select_members(&self, cid: &str) -> Result<Vec<Member>, RepositoryError>;

    /// Insert or replace a reaction, keyed by message, user and kind.
    fn insert_reaction(&self, reaction: &Reaction) -> Result<(), RepositoryError>;

    /// Reactions on a message, including locally deleted ones.
    fn select_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, RepositoryError>;
}
