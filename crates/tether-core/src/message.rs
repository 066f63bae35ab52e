//! Outbound message and attachment model.
//!
//! `sync_status` is the single source of truth for whether a message still
//! needs network work. It only moves forward, except `Failed -> SyncNeeded`
//! when a send is retried:
//!
//! ```text
//! Idle ──> AwaitingAttachments ──> InProgress ──> Synced
//!   │              │                   │
//!   └──> SyncNeeded <──────────────────┤
//!           │   ^                      v
//!           └───┴──── (retry) ─────  Failed
//! ```

use std::collections::BTreeMap;

use tether_proto::{AttachmentRef, MessageEnvelope};

use crate::{env::Environment, error::SyncError};

/// Local-versus-server reconciliation state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Not yet prepared
    Idle,
    /// Waiting for attachment uploads
    AwaitingAttachments,
    /// Being transmitted
    InProgress,
    /// Stored locally, must be sent when connectivity returns
    SyncNeeded,
    /// Accepted by the server
    Synced,
    /// Send failed; retry moves it back to `SyncNeeded`
    Failed,
}

impl SyncStatus {
    /// Whether moving from `self` to `to` is allowed.
    ///
    /// Staying in the same status is always allowed.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use SyncStatus::{AwaitingAttachments, Failed, Idle, InProgress, SyncNeeded, Synced};

        if self == to {
            return true;
        }
        match self {
            Idle => matches!(to, AwaitingAttachments | InProgress | SyncNeeded | Failed),
            AwaitingAttachments => matches!(to, InProgress | SyncNeeded | Failed),
            InProgress => matches!(to, Synced | SyncNeeded | Failed),
            SyncNeeded => matches!(to, AwaitingAttachments | InProgress | Failed),
            Failed => to == SyncNeeded,
            Synced => false,
        }
    }

    /// `Synced` and `Failed` end a send attempt.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Synced | Self::Failed)
    }
}

/// Progress of one attachment upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadState {
    /// Queued, not started
    Idle,
    /// Uploading
    InProgress {
        /// Bytes sent so far
        bytes_sent: u64,
        /// Total size
        total_bytes: u64,
    },
    /// Uploaded; remote URLs are set
    Success,
    /// Upload failed
    Failed {
        /// Uploader's reason
        error: String,
    },
}

/// A file attached to an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Attachment id, stable across retries
    pub id: String,
    /// Id of the current upload job, assigned when an upload is queued
    pub upload_id: Option<String>,
    /// Local file reference
    pub local_source: Option<String>,
    /// Remote URL, set after upload
    pub asset_url: Option<String>,
    /// Remote thumbnail URL, set after upload
    pub thumb_url: Option<String>,
    /// MIME type
    pub mime_type: Option<String>,
    /// Size in bytes
    pub file_size: u64,
    /// Upload progress
    pub upload_state: UploadState,
}

impl Attachment {
    /// Local file awaiting upload.
    pub fn local(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            upload_id: None,
            local_source: Some(source.into()),
            asset_url: None,
            thumb_url: None,
            mime_type: None,
            file_size: 0,
            upload_state: UploadState::Idle,
        }
    }

    /// Attachment that already lives on the server.
    pub fn remote(id: impl Into<String>, asset_url: impl Into<String>) -> Self {
        Self {
            asset_url: Some(asset_url.into()),
            local_source: None,
            upload_state: UploadState::Success,
            ..Self::local(id, String::new())
        }
    }

    /// Still has to go through the uploader.
    #[must_use]
    pub fn needs_upload(&self) -> bool {
        self.asset_url.is_none() && self.upload_state != UploadState::Success
    }

    /// Uploaded successfully.
    #[must_use]
    pub fn is_uploaded(&self) -> bool {
        self.upload_state == UploadState::Success
    }
}

/// Combined state of a message's attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentAggregate {
    /// At least one upload is still running and none has failed
    Pending,
    /// Every attachment is uploaded (vacuously true for none)
    Ready,
    /// An upload failed; the first failure in list order
    Failed {
        /// Failing attachment
        attachment_id: String,
        /// Uploader's reason
        error: String,
    },
}

/// Fold attachment states: any failure wins, then all-success, else pending.
#[must_use]
pub fn aggregate(attachments: &[Attachment]) -> AttachmentAggregate {
    let mut all_done = true;
    for attachment in attachments {
        match &attachment.upload_state {
            UploadState::Failed { error } => {
                return AttachmentAggregate::Failed {
                    attachment_id: attachment.id.clone(),
                    error: error.clone(),
                };
            },
            UploadState::Success => {},
            UploadState::Idle | UploadState::InProgress { .. } => all_done = false,
        }
    }

    if all_done { AttachmentAggregate::Ready } else { AttachmentAggregate::Pending }
}

/// A message the user is sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Client-assigned id, empty until prepared
    pub id: String,
    /// Target channel (`type:id`)
    pub channel_id: String,
    /// Message text
    pub text: String,
    /// Structured extra data
    pub extra: BTreeMap<String, String>,
    /// Attachments in display order
    pub attachments: Vec<Attachment>,
    /// Reconciliation state
    pub sync_status: SyncStatus,
    /// Creation time, ms since the Unix epoch
    pub created_at: Option<u64>,
    /// Last local modification, ms since the Unix epoch
    pub updated_at: Option<u64>,
}

impl OutboundMessage {
    /// Unprepared message for `channel_id`.
    pub fn new(channel_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            channel_id: channel_id.into(),
            text: text.into(),
            extra: BTreeMap::new(),
            attachments: Vec::new(),
            sync_status: SyncStatus::Idle,
            created_at: None,
            updated_at: None,
        }
    }

    /// Builder-style attachment.
    #[must_use]
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Assign identity and timestamps if absent and stamp the initial sync
    /// status.
    ///
    /// Attachments that still need uploading get a fresh upload id and go to
    /// `Idle`; the rest are marked `Success`. The status becomes
    /// `AwaitingAttachments` if anything needs uploading, otherwise
    /// `InProgress` when `online` and `SyncNeeded` when not.
    pub fn prepare<E: Environment>(&mut self, env: &E, online: bool) {
        if self.id.is_empty() {
            self.id = env.random_id();
        }
        let now = env.wall_clock_millis();
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);

        let mut pending = false;
        for attachment in &mut self.attachments {
            if attachment.needs_upload() {
                attachment.upload_id = Some(env.random_id());
                attachment.upload_state = UploadState::Idle;
                pending = true;
            } else {
                attachment.upload_state = UploadState::Success;
            }
        }

        self.sync_status = match (pending, online) {
            (true, _) => SyncStatus::AwaitingAttachments,
            (false, true) => SyncStatus::InProgress,
            (false, false) => SyncStatus::SyncNeeded,
        };
    }

    /// Move to `to`, enforcing the transition rules.
    ///
    /// # Errors
    ///
    /// - `SyncError::InvalidTransition` if the rules forbid it
    /// - `SyncError::AttachmentsPending` for `Synced` while any attachment is
    ///   not uploaded
    pub fn set_sync_status(&mut self, to: SyncStatus) -> Result<(), SyncError> {
        if !self.sync_status.can_transition_to(to) {
            return Err(SyncError::InvalidTransition { from: self.sync_status, to });
        }

        if to == SyncStatus::Synced {
            let pending = self.attachments.iter().filter(|a| !a.is_uploaded()).count();
            if pending > 0 {
                return Err(SyncError::AttachmentsPending { pending });
            }
        }

        self.sync_status = to;
        Ok(())
    }

    /// Shorthand for `set_sync_status(Synced)`.
    ///
    /// # Errors
    ///
    /// Same as [`Self::set_sync_status`].
    pub fn mark_synced(&mut self) -> Result<(), SyncError> {
        self.set_sync_status(SyncStatus::Synced)
    }

    /// Re-queue failed uploads for a retry. Uploaded attachments are left
    /// alone. Returns how many were reset.
    pub fn reset_failed_attachments<E: Environment>(&mut self, env: &E) -> usize {
        let mut reset = 0;
        for attachment in &mut self.attachments {
            if matches!(attachment.upload_state, UploadState::Failed { .. }) {
                attachment.upload_id = Some(env.random_id());
                attachment.upload_state = UploadState::Idle;
                reset += 1;
            }
        }
        reset
    }

    /// Attachments the uploader still has to process.
    pub fn pending_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.iter().filter(|a| !a.is_uploaded())
    }

    /// Wire form for transmission.
    #[must_use]
    pub fn envelope(&self) -> MessageEnvelope {
        MessageEnvelope {
            id: self.id.clone(),
            channel_id: self.channel_id.clone(),
            text: self.text.clone(),
            extra: self.extra.clone(),
            attachments: self
                .attachments
                .iter()
                .map(|a| AttachmentRef {
                    id: a.id.clone(),
                    asset_url: a.asset_url.clone().unwrap_or_default(),
                    thumb_url: a.thumb_url.clone(),
                    mime_type: a.mime_type.clone(),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::test_utils::MockEnv;

    fn uploaded(id: &str) -> Attachment {
        Attachment::remote(id, format!("https://cdn.example/{id}"))
    }

    fn failed(id: &str, error: &str) -> Attachment {
        let mut a = Attachment::local(id, format!("/tmp/{id}"));
        a.upload_state = UploadState::Failed { error: error.into() };
        a
    }

    #[test]
    fn prepare_offline_without_attachments() {
        let env = MockEnv::default();
        let mut message = OutboundMessage::new("messaging:general", "hi");
        message.prepare(&env, false);

        assert!(!message.id.is_empty());
        assert!(message.created_at.is_some());
        assert_eq!(message.sync_status, SyncStatus::SyncNeeded);
    }

    #[test]
    fn prepare_partitions_attachments() {
        let env = MockEnv::default();
        let mut message = OutboundMessage::new("messaging:general", "pics")
            .with_attachment(uploaded("a"))
            .with_attachment(Attachment::local("b", "/tmp/b.png"));
        message.prepare(&env, true);

        assert_eq!(message.sync_status, SyncStatus::AwaitingAttachments);
        assert_eq!(message.attachments[0].upload_state, UploadState::Success);
        assert_eq!(message.attachments[0].upload_id, None);
        assert_eq!(message.attachments[1].upload_state, UploadState::Idle);
        assert!(message.attachments[1].upload_id.is_some());
        assert_eq!(message.pending_attachments().count(), 1);
    }

    #[test]
    fn prepare_keeps_existing_identity() {
        let env = MockEnv::default();
        let mut message = OutboundMessage::new("messaging:general", "hi");
        message.id = "fixed".into();
        message.created_at = Some(5);
        message.prepare(&env, true);

        assert_eq!(message.id, "fixed");
        assert_eq!(message.created_at, Some(5));
        assert_eq!(message.sync_status, SyncStatus::InProgress);
    }

    #[test]
    fn synced_requires_all_uploaded() {
        let mut message = OutboundMessage::new("messaging:general", "x")
            .with_attachment(uploaded("a"))
            .with_attachment(Attachment::local("b", "/tmp/b"));
        message.sync_status = SyncStatus::InProgress;

        assert_eq!(message.mark_synced(), Err(SyncError::AttachmentsPending { pending: 1 }));
        assert_eq!(message.sync_status, SyncStatus::InProgress);

        message.attachments[1] = uploaded("b");
        message.mark_synced().unwrap();
        assert_eq!(message.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn only_retry_moves_backwards() {
        use SyncStatus::{Failed, InProgress, SyncNeeded, Synced};

        assert!(Failed.can_transition_to(SyncNeeded));
        assert!(!Failed.can_transition_to(InProgress));
        assert!(!Synced.can_transition_to(Failed));
        assert!(!InProgress.can_transition_to(SyncStatus::AwaitingAttachments));

        let mut message = OutboundMessage::new("c", "t");
        message.sync_status = Synced;
        assert_eq!(
            message.set_sync_status(SyncNeeded),
            Err(SyncError::InvalidTransition { from: Synced, to: SyncNeeded })
        );
    }

    #[test]
    fn first_failure_wins() {
        let attachments = vec![
            uploaded("a"),
            failed("b", "disk full"),
            Attachment::local("c", "/tmp/c"),
            failed("d", "timeout"),
        ];
        assert_eq!(aggregate(&attachments), AttachmentAggregate::Failed {
            attachment_id: "b".into(),
            error: "disk full".into(),
        });
    }

    #[test]
    fn aggregate_pending_and_ready() {
        assert_eq!(aggregate(&[]), AttachmentAggregate::Ready);
        assert_eq!(aggregate(&[uploaded("a"), uploaded("b")]), AttachmentAggregate::Ready);
        assert_eq!(
            aggregate(&[uploaded("a"), Attachment::local("b", "/tmp/b")]),
            AttachmentAggregate::Pending
        );
    }

    #[test]
    fn reset_only_touches_failures() {
        let env = MockEnv::default();
        let mut message = OutboundMessage::new("c", "t")
            .with_attachment(uploaded("a"))
            .with_attachment(failed("b", "disk full"));

        assert_eq!(message.reset_failed_attachments(&env), 1);
        assert_eq!(message.attachments[0], uploaded("a"));
        assert_eq!(message.attachments[1].upload_state, UploadState::Idle);
    }
}
