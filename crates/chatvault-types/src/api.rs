use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -- Envelope --

/// Every Web API response carries `ok` and, on failure, an `error` code.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default)]
    pub next_cursor: String,
}

/// Cursor of the next page, `None` once the listing is exhausted.
pub fn next_cursor(meta: &Option<ResponseMetadata>) -> Option<String> {
    meta.as_ref()
        .map(|m| m.next_cursor.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

// -- Auth --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthIdentity {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub team_id: String,
}

// -- Channels --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextValue {
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelDto {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub is_archived: bool,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub topic: Option<TextValue>,
    #[serde(default)]
    pub purpose: Option<TextValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelListResponse {
    #[serde(default)]
    pub channels: Vec<ChannelDto>,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

// -- Messages --

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EditedDto {
    #[serde(default)]
    pub user: Option<String>,
    pub ts: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfileDto {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub real_name: String,
    #[serde(default)]
    pub image_72: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileDto {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub filetype: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub url_private_download: Option<String>,
    #[serde(default)]
    pub url_private: Option<String>,
    /// `tombstone` and `external` files have no downloadable content.
    #[serde(default)]
    pub mode: Option<String>,
    /// Not sent by every source; used for download verification when present.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl FileDto {
    pub fn download_url(&self) -> Option<&str> {
        if matches!(self.mode.as_deref(), Some("tombstone") | Some("external")) {
            return None;
        }
        self.url_private_download
            .as_deref()
            .or(self.url_private.as_deref())
            .filter(|u| !u.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageDto {
    pub ts: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub bot_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub edited: Option<EditedDto>,
    #[serde(default)]
    pub files: Vec<FileDto>,
    #[serde(default)]
    pub user_profile: Option<UserProfileDto>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub messages: Vec<MessageDto>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub response_metadata: Option<ResponseMetadata>,
}

/// One page of channel history.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<MessageDto>,
    pub next_cursor: Option<String>,
}

// -- Source timestamps --

/// Parse a source timestamp such as `1700000000.123456`.
pub fn parse_ts(ts: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = match ts.split_once('.') {
        Some((s, f)) => (s, f),
        None => (ts, ""),
    };
    let secs: i64 = secs.parse().ok()?;
    let mut micros: u32 = 0;
    for (i, c) in frac.chars().take(6).enumerate() {
        let digit = c.to_digit(10)?;
        micros += digit * 10u32.pow(5 - i as u32);
    }
    DateTime::from_timestamp(secs, micros * 1000)
}

/// Inverse of [`parse_ts`], used for `oldest` watermarks.
pub fn format_ts(at: DateTime<Utc>) -> String {
    format!("{}.{:06}", at.timestamp(), at.timestamp_subsec_micros())
}
