//! Outbound message envelope.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Message as transmitted once all attachments are uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Client-assigned message id
    pub id: String,
    /// Target channel (`type:id`)
    pub channel_id: String,
    /// Message text
    pub text: String,
    /// Structured extra data
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
    /// Uploaded attachments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
}

/// Remote reference to an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Attachment id
    pub id: String,
    /// Remote URL of the uploaded asset
    pub asset_url: String,
    /// Remote thumbnail URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumb_url: Option<String>,
    /// MIME type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}
