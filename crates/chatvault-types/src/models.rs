use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author id used when the remote record names neither a user nor a bot.
pub const UNKNOWN_AUTHOR: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Public,
    Private,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public_channel",
            Self::Private => "private_channel",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public_channel" => Some(Self::Public),
            "private_channel" => Some(Self::Private),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub kind: ChannelKind,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub topic: String,
    pub purpose: String,
}

/// A message author. Profile fields are captured on first sighting only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: String,
    pub first_seen: DateTime<Utc>,
}

/// A channel message or thread reply.
///
/// `id` is the source timestamp string, unique within its channel only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub channel_id: String,
    pub author_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub thread_id: Option<String>,
    pub kind: String,
    pub is_deleted: bool,
    pub last_edited: Option<DateTime<Utc>>,
}

impl Message {
    /// A thread root carries its own id as thread reference.
    pub fn is_thread_root(&self) -> bool {
        self.thread_id.as_deref() == Some(self.id.as_str())
    }
}

/// A file attachment as discovered on a remote message, before any local
/// storage decision has been made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub id: String,
    pub message_id: String,
    pub channel_id: String,
    pub url: String,
    pub name: String,
    pub file_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    /// Checksum declared by the source, when it provides one.
    pub expected_checksum: Option<String>,
}

/// Stored file metadata. An empty `checksum` marks a registration whose
/// content has not been resolved yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    pub message_id: String,
    pub channel_id: String,
    pub original_url: String,
    pub local_path: String,
    pub name: String,
    pub file_type: String,
    pub size_bytes: u64,
    pub uploaded_at: DateTime<Utc>,
    pub checksum: String,
}

impl FileRecord {
    pub fn pending(file: &FileRef, local_path: String) -> Self {
        Self {
            id: file.id.clone(),
            message_id: file.message_id.clone(),
            channel_id: file.channel_id.clone(),
            original_url: file.url.clone(),
            local_path,
            name: file.name.clone(),
            file_type: file.file_type.clone(),
            size_bytes: file.size_bytes,
            uploaded_at: file.uploaded_at,
            checksum: String::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.checksum.is_empty()
    }
}
