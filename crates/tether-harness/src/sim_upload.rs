//! Scripted attachment uploader.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_client::{AttachmentUploader, RepositoryError, repository::MessageRepository};
use tether_core::{
    ChatError,
    message::{Attachment, OutboundMessage, UploadState},
};
use tokio::sync::watch;

/// Uploader whose uploads finish only when the test says so.
///
/// Progress is written through the repository, exactly like a real
/// uploader reporting into the store the pipeline observes.
pub struct SimUploader {
    repository: Arc<dyn MessageRepository>,
    auto_complete: bool,
    enqueued: Mutex<Vec<(String, Vec<String>)>>,
    cancelled: Mutex<Vec<String>>,
    enqueue_count: watch::Sender<usize>,
}

impl SimUploader {
    /// Uploader reporting into `repository`.
    pub fn new(repository: Arc<dyn MessageRepository>) -> Self {
        Self {
            repository,
            auto_complete: false,
            enqueued: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            enqueue_count: watch::channel(0).0,
        }
    }

    /// Uploader that completes every attachment as soon as it is enqueued.
    pub fn auto_complete(repository: Arc<dyn MessageRepository>) -> Self {
        Self { auto_complete: true, ..Self::new(repository) }
    }

    /// `(message id, attachment ids)` per enqueue call.
    pub fn enqueued(&self) -> Vec<(String, Vec<String>)> {
        self.enqueued.lock().clone()
    }

    /// Message ids passed to `cancel`.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().clone()
    }

    /// Wait until at least `count` enqueue calls happened.
    pub async fn wait_for_enqueue(&self, count: usize) {
        let mut rx = self.enqueue_count.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    /// Report progress on an attachment.
    pub fn progress(
        &self,
        message_id: &str,
        attachment_id: &str,
        bytes_sent: u64,
        total_bytes: u64,
    ) -> Result<(), RepositoryError> {
        self.report(message_id, attachment_id, |attachment| {
            attachment.upload_state = UploadState::InProgress { bytes_sent, total_bytes };
        })
    }

    /// Finish an attachment successfully with a CDN url.
    pub fn complete(&self, message_id: &str, attachment_id: &str) -> Result<(), RepositoryError> {
        self.report(message_id, attachment_id, |attachment| {
            attachment.asset_url = Some(format!("https://cdn.example/{}", attachment.id));
            attachment.upload_state = UploadState::Success;
        })
    }

    /// Fail an attachment.
    pub fn fail(
        &self,
        message_id: &str,
        attachment_id: &str,
        error: impl Into<String>,
    ) -> Result<(), RepositoryError> {
        let error = error.into();
        self.report(message_id, attachment_id, move |attachment| {
            attachment.upload_state = UploadState::Failed { error };
        })
    }

    fn report(
        &self,
        message_id: &str,
        attachment_id: &str,
        update: impl FnOnce(&mut Attachment),
    ) -> Result<(), RepositoryError> {
        let message = self.repository.select_message(message_id)?.ok_or_else(|| {
            RepositoryError::NotFound { kind: "message", id: message_id.to_string() }
        })?;
        let mut attachment = message
            .attachments
            .into_iter()
            .find(|a| a.id == attachment_id)
            .ok_or_else(|| RepositoryError::NotFound {
                kind: "attachment",
                id: attachment_id.to_string(),
            })?;
        update(&mut attachment);
        self.repository.update_attachment(message_id, attachment)
    }
}

#[async_trait]
impl AttachmentUploader for SimUploader {
    async fn enqueue(
        &self,
        message: &OutboundMessage,
        attachments: &[Attachment],
    ) -> Result<(), ChatError> {
        let ids: Vec<String> = attachments.iter().map(|a| a.id.clone()).collect();
        self.enqueued.lock().push((message.id.clone(), ids.clone()));
        self.enqueue_count.send_modify(|n| *n += 1);

        if self.auto_complete {
            for id in &ids {
                self.complete(&message.id, id)?;
            }
        }
        Ok(())
    }

    async fn cancel(&self, message_id: &str) {
        self.cancelled.lock().push(message_id.to_string());
    }
}
