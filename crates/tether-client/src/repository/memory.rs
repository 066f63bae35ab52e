use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tether_core::{
    message::{Attachment, OutboundMessage},
    model::{Channel, Member, Reaction},
};
use tokio::sync::watch;

use super::MessageRepository;
use crate::error::RepositoryError;

/// In-memory repository for tests and short-lived clients.
///
/// Clones share the same state. Attachment feeds are `watch` channels keyed
/// by message id, created on first observe or insert.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    messages: HashMap<String, OutboundMessage>,
    feeds: HashMap<String, watch::Sender<Vec<Attachment>>>,
    channels: HashMap<String, Channel>,
    members: HashMap<String, Vec<Member>>,
    /// Per message, unique by (user id, kind)
    reactions: HashMap<String, Vec<Reaction>>,
}

impl Inner {
    fn publish(&mut self, message_id: &str, attachments: Vec<Attachment>) {
        self.feeds
            .entry(message_id.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .send_replace(attachments);
    }
}

impl MemoryRepository {
    /// Empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored messages.
    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }
}

impl MessageRepository for MemoryRepository {
    fn insert_message(&self, message: &OutboundMessage) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock();
        inner.messages.insert(message.id.clone(), message.clone());
        inner.publish(&message.id, message.attachments.clone());
        Ok(())
    }

    fn select_message(&self, id: &str) -> Result<Option<OutboundMessage>, RepositoryError> {
        Ok(self.inner.lock().messages.get(id).cloned())
    }

    fn observe_attachments(&self, message_id: &str) -> watch::Receiver<Vec<Attachment>> {
        let mut inner = self.inner.lock();
        let current =
            inner.messages.get(message_id).map(|m| m.attachments.clone()).unwrap_or_default();
        inner
            .feeds
            .entry(message_id.to_string())
            .or_insert_with(|| watch::channel(current).0)
            .subscribe()
    }

    fn update_attachment(
        &self,
        message_id: &str,
        attachment: Attachment,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock();
        let message = inner
            .messages
            .get_mut(message_id)
            .ok_or_else(|| RepositoryError::NotFound { kind: "message", id: message_id.into() })?;
        let slot = message
            .attachments
            .iter_mut()
            .find(|a| a.id == attachment.id)
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "attachment",
                id: attachment.id.clone(),
            })?;
        *slot = attachment;

        let attachments = message.attachments.clone();
        inner.publish(message_id, attachments);
        Ok(())
    }

    fn insert_channel(&self, channel: &Channel) -> Result<(), RepositoryError> {
        self.inner.lock().channels.insert(channel.cid.clone(), channel.clone());
        Ok(())
    }

    fn select_channel(&self, cid: &str) -> Result<Option<Channel>, RepositoryError> {
        Ok(self.inner.lock().channels.get(cid).cloned())
    }

    fn insert_members(&self, cid: &str, members: &[Member]) -> Result<(), RepositoryError> {
        self.inner.lock().members.insert(cid.to_string(), members.to_vec());
        Ok(())
    }

    fn select_members(&self, cid: &str) -> Result<Vec<Member>, RepositoryError> {
        Ok(self.inner.lock().members.get(cid).cloned().unwrap_or_default())
    }

    fn insert_reaction(&self, reaction: &Reaction) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock();
        let reactions = inner.reactions.entry(reaction.message_id.clone()).or_default();
        match reactions.iter_mut().find(|r| r.user_id == reaction.user_id && r.kind == reaction.kind)
        {
            Some(existing) => *existing = reaction.clone(),
            None => reactions.push(reaction.clone()),
        }
        Ok(())
    }

    fn select_reactions(&self, message_id: &str) -> Result<Vec<Reaction>, RepositoryError> {
        Ok(self.inner.lock().reactions.get(message_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use tether_core::message::UploadState;

    use super::*;

    fn message_with_upload() -> OutboundMessage {
        let mut message = OutboundMessage::new("messaging:general", "hi")
            .with_attachment(Attachment::local("a1", "/tmp/a1.png"));
        message.id = "m1".into();
        message
    }

    #[test]
    fn feed_follows_attachment_updates() {
        let repo = MemoryRepository::new();
        let mut feed = repo.observe_attachments("m1");
        assert!(feed.borrow().is_empty());

        let message = message_with_upload();
        repo.insert_message(&message).unwrap();
        assert!(feed.has_changed().unwrap());
        assert_eq!(feed.borrow_and_update().len(), 1);

        let mut done = message.attachments[0].clone();
        done.upload_state = UploadState::Success;
        repo.update_attachment("m1", done).unwrap();

        assert_eq!(feed.borrow_and_update()[0].upload_state, UploadState::Success);
        let stored = repo.select_message("m1").unwrap().unwrap();
        assert!(stored.attachments[0].is_uploaded());
    }

    #[test]
    fn late_observer_sees_current_attachments() {
        let repo = MemoryRepository::new();
        repo.insert_message(&message_with_upload()).unwrap();
        let feed = repo.observe_attachments("m1");
        assert_eq!(feed.borrow()[0].id, "a1");
    }

    #[test]
    fn updating_unknown_attachment_fails() {
        let repo = MemoryRepository::new();
        assert!(matches!(
            repo.update_attachment("missing", Attachment::local("a1", "x")),
            Err(RepositoryError::NotFound { kind: "message", .. })
        ));

        repo.insert_message(&message_with_upload()).unwrap();
        assert!(matches!(
            repo.update_attachment("m1", Attachment::local("other", "x")),
            Err(RepositoryError::NotFound { kind: "attachment", .. })
        ));
    }

    #[test]
    fn reactions_replace_by_user_and_kind() {
        let repo = MemoryRepository::new();
        repo.insert_reaction(&Reaction::new("m1", "alice", "like")).unwrap();
        repo.insert_reaction(&Reaction::new("m1", "bob", "like")).unwrap();

        let mut deleted = Reaction::new("m1", "alice", "like");
        deleted.deleted_at = Some(5);
        repo.insert_reaction(&deleted).unwrap();

        let reactions = repo.select_reactions("m1").unwrap();
        assert_eq!(reactions.len(), 2);
        assert_eq!(reactions[0].deleted_at, Some(5));
    }
}
