use chrono::{DateTime, Utc};

use chatvault_types::api::{MessageDto, parse_ts};
use chatvault_types::models::UNKNOWN_AUTHOR;
use chatvault_types::{FileRef, Message, User};

/// A wire message split into the rows it produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub message: Message,
    pub author: User,
    pub files: Vec<FileRef>,
}

/// Map a wire message to store records. `None` when the message timestamp,
/// which doubles as its id, cannot be parsed.
pub fn normalize(channel_id: &str, dto: &MessageDto) -> Option<Normalized> {
    let timestamp = parse_ts(&dto.ts)?;
    let author = author(dto, timestamp);

    let message = Message {
        id: dto.ts.clone(),
        channel_id: channel_id.to_string(),
        author_id: author.id.clone(),
        content: dto.text.clone(),
        timestamp,
        thread_id: dto.thread_ts.clone().filter(|t| !t.is_empty()),
        kind: dto.subtype.clone().unwrap_or_else(|| "message".to_string()),
        is_deleted: dto.subtype.as_deref() == Some("tombstone"),
        last_edited: dto.edited.as_ref().and_then(|e| parse_ts(&e.ts)),
    };

    let files = dto
        .files
        .iter()
        .map(|f| FileRef {
            id: f.id.clone(),
            message_id: dto.ts.clone(),
            channel_id: channel_id.to_string(),
            url: f.download_url().unwrap_or_default().to_string(),
            name: f.name.clone(),
            file_type: f.filetype.clone(),
            size_bytes: f.size,
            uploaded_at: DateTime::from_timestamp(f.created, 0)
                .filter(|_| f.created > 0)
                .unwrap_or(timestamp),
            expected_checksum: f.sha256.clone().filter(|s| !s.is_empty()),
        })
        .collect();

    Some(Normalized {
        message,
        author,
        files,
    })
}

/// Messages without a user are attributed to their bot, or to a shared
/// placeholder author. `first_seen` is the message time so repeated
/// normalization yields identical rows.
fn author(dto: &MessageDto, seen: DateTime<Utc>) -> User {
    let profile = dto.user_profile.as_ref();
    let id = dto
        .user
        .as_deref()
        .or(dto.bot_id.as_deref())
        .filter(|id| !id.is_empty())
        .unwrap_or(UNKNOWN_AUTHOR)
        .to_string();

    let username = profile
        .map(|p| p.name.as_str())
        .filter(|n| !n.is_empty())
        .or(dto.username.as_deref())
        .unwrap_or(id.as_str())
        .to_string();
    let display_name = profile
        .map(|p| if p.display_name.is_empty() { &p.real_name } else { &p.display_name })
        .cloned()
        .unwrap_or_default();
    let avatar_url = profile.and_then(|p| p.image_72.clone()).unwrap_or_default();

    User {
        id,
        username,
        display_name,
        avatar_url,
        first_seen: seen,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatvault_types::api::{EditedDto, FileDto, UserProfileDto};

    #[test]
    fn user_message_with_thread_edit_and_file() {
        let dto = MessageDto {
            ts: "1700000000.000100".into(),
            user: Some("U1".into()),
            text: "hello".into(),
            thread_ts: Some("1700000000.000100".into()),
            edited: Some(EditedDto {
                user: Some("U1".into()),
                ts: "1700000100.000000".into(),
            }),
            user_profile: Some(UserProfileDto {
                name: "ann".into(),
                real_name: "Ann Example".into(),
                ..Default::default()
            }),
            files: vec![FileDto {
                id: "F1".into(),
                name: "a.png".into(),
                filetype: "png".into(),
                size: 10,
                created: 1700000000,
                url_private_download: Some("https://files/a.png".into()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let n = normalize("C1", &dto).unwrap();
        assert_eq!(n.message.id, "1700000000.000100");
        assert_eq!(n.message.author_id, "U1");
        assert_eq!(n.message.kind, "message");
        assert!(n.message.is_thread_root());
        assert_eq!(n.message.last_edited.unwrap().timestamp(), 1700000100);
        assert_eq!(n.author.username, "ann");
        assert_eq!(n.author.display_name, "Ann Example");
        assert_eq!(n.author.first_seen, n.message.timestamp);
        assert_eq!(n.files.len(), 1);
        assert_eq!(n.files[0].message_id, n.message.id);
        assert_eq!(n.files[0].url, "https://files/a.png");
    }

    #[test]
    fn bot_and_anonymous_authors() {
        let bot = MessageDto {
            ts: "1.0".into(),
            bot_id: Some("B1".into()),
            username: Some("deploybot".into()),
            subtype: Some("bot_message".into()),
            ..Default::default()
        };
        let n = normalize("C1", &bot).unwrap();
        assert_eq!(n.author.id, "B1");
        assert_eq!(n.author.username, "deploybot");
        assert_eq!(n.message.kind, "bot_message");

        let anon = MessageDto {
            ts: "2.0".into(),
            subtype: Some("tombstone".into()),
            ..Default::default()
        };
        let n = normalize("C1", &anon).unwrap();
        assert_eq!(n.author.id, UNKNOWN_AUTHOR);
        assert!(n.message.is_deleted);
    }

    #[test]
    fn unparseable_timestamp_is_rejected() {
        let dto = MessageDto {
            ts: "yesterday".into(),
            ..Default::default()
        };
        assert!(normalize("C1", &dto).is_none());
    }
}
