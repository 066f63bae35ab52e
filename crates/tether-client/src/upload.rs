//! Attachment uploader boundary.

use async_trait::async_trait;
use tether_core::{
    ChatError,
    message::{Attachment, OutboundMessage},
};

/// Drives attachment uploads outside the send pipeline.
///
/// Implementations report progress by writing each attachment's
/// [`UploadState`](tether_core::UploadState) through
/// [`MessageRepository::update_attachment`](crate::repository::MessageRepository::update_attachment);
/// the pipeline watches the repository feed, so uploads may outlive the
/// pipeline task (e.g. a durable job queue).
#[async_trait]
pub trait AttachmentUploader: Send + Sync {
    /// Queue `attachments` of `message` for upload. Returns once queued.
    async fn enqueue(
        &self,
        message: &OutboundMessage,
        attachments: &[Attachment],
    ) -> Result<(), ChatError>;

    /// Stop any uploads still running for `message_id`.
    async fn cancel(&self, message_id: &str);
}
