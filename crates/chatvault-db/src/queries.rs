use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Params, Row, params};

use chatvault_types::{Channel, ChannelKind, FileRecord, Message, User};

use crate::Database;
use crate::error::ReferentialError;

/// Outcome of a message upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageWrite {
    Inserted,
    Updated,
    Unchanged,
}

const FILE_COLUMNS: &str = "f.id, f.channel_id, f.message_id, f.original_url, f.local_path, \
     f.file_name, f.file_type, f.size_bytes, f.upload_timestamp, f.checksum";

impl Database {
    // -- Channels --

    /// Insert or refresh a channel. Returns `false` when the stored row
    /// already matched, in which case nothing was written.
    pub fn upsert_channel(&self, ch: &Channel) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO channels (id, name, channel_type, is_archived, created_at, topic, purpose)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    channel_type = excluded.channel_type,
                    is_archived = excluded.is_archived,
                    topic = excluded.topic,
                    purpose = excluded.purpose
                 WHERE channels.name IS NOT excluded.name
                    OR channels.channel_type IS NOT excluded.channel_type
                    OR channels.is_archived IS NOT excluded.is_archived
                    OR channels.topic IS NOT excluded.topic
                    OR channels.purpose IS NOT excluded.purpose",
                params![
                    ch.id,
                    ch.name,
                    ch.kind.as_str(),
                    ch.is_archived,
                    fmt_time(&ch.created_at),
                    ch.topic,
                    ch.purpose
                ],
            )?;
            Ok(changed > 0)
        })
    }

    pub fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, name, channel_type, is_archived, created_at, topic, purpose
                     FROM channels WHERE id = ?1",
                    [id],
                    map_channel,
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Users --

    /// Insert a user on first sighting. Later sightings are ignored, so a
    /// profile change at the source is not reflected here.
    pub fn insert_user(&self, user: &User) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO users (id, username, display_name, avatar_url, first_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    user.id,
                    user.username,
                    user.display_name,
                    user.avatar_url,
                    fmt_time(&user.first_seen)
                ],
            )?;
            Ok(inserted > 0)
        })
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, username, display_name, avatar_url, first_seen FROM users WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(User {
                            id: row.get(0)?,
                            username: row.get(1)?,
                            display_name: row.get(2)?,
                            avatar_url: row.get(3)?,
                            first_seen: parse_time(4, row.get(4)?)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    // -- Messages --

    /// Insert a message or apply newer content to an existing one.
    ///
    /// The channel and author must already be stored; otherwise a
    /// [`ReferentialError`] is returned and nothing is written. Timestamp,
    /// channel and author of an existing row are never changed. Content
    /// fields are only replaced by a copy that is at least as recently
    /// edited as the stored one.
    pub fn upsert_message(&self, msg: &Message) -> Result<MessageWrite> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            if !exists(&tx, "SELECT 1 FROM channels WHERE id = ?1", [&msg.channel_id])? {
                return Err(ReferentialError::UnknownChannel {
                    message_id: msg.id.clone(),
                    channel_id: msg.channel_id.clone(),
                }
                .into());
            }
            if !exists(&tx, "SELECT 1 FROM users WHERE id = ?1", [&msg.author_id])? {
                return Err(ReferentialError::UnknownAuthor {
                    message_id: msg.id.clone(),
                    author_id: msg.author_id.clone(),
                }
                .into());
            }

            let existed = exists(
                &tx,
                "SELECT 1 FROM messages WHERE channel_id = ?1 AND id = ?2",
                [&msg.channel_id, &msg.id],
            )?;

            let changed = tx.execute(
                "INSERT INTO messages
                    (channel_id, id, user_id, content, timestamp, thread_ts, message_type, is_deleted, last_edited)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(channel_id, id) DO UPDATE SET
                    content = excluded.content,
                    thread_ts = excluded.thread_ts,
                    message_type = excluded.message_type,
                    is_deleted = excluded.is_deleted,
                    last_edited = excluded.last_edited
                 WHERE (messages.last_edited IS NULL
                        OR excluded.is_deleted = 1
                        OR (excluded.last_edited IS NOT NULL AND excluded.last_edited >= messages.last_edited))
                   AND (messages.content IS NOT excluded.content
                        OR messages.thread_ts IS NOT excluded.thread_ts
                        OR messages.message_type IS NOT excluded.message_type
                        OR messages.is_deleted IS NOT excluded.is_deleted
                        OR messages.last_edited IS NOT excluded.last_edited)",
                params![
                    msg.channel_id,
                    msg.id,
                    msg.author_id,
                    msg.content,
                    fmt_time(&msg.timestamp),
                    msg.thread_id,
                    msg.kind,
                    msg.is_deleted,
                    msg.last_edited.as_ref().map(fmt_time)
                ],
            )?;

            tx.commit()?;

            Ok(match (existed, changed) {
                (false, _) => MessageWrite::Inserted,
                (true, 0) => MessageWrite::Unchanged,
                (true, _) => MessageWrite::Updated,
            })
        })
    }

    pub fn message_exists(&self, channel_id: &str, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(exists(
                conn,
                "SELECT 1 FROM messages WHERE channel_id = ?1 AND id = ?2",
                [channel_id, id],
            )?)
        })
    }

    pub fn get_message(&self, channel_id: &str, id: &str) -> Result<Option<Message>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT channel_id, id, user_id, content, timestamp, thread_ts, message_type, is_deleted, last_edited
                     FROM messages WHERE channel_id = ?1 AND id = ?2",
                    [channel_id, id],
                    map_message,
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Messages of a channel in timestamp order.
    pub fn channel_messages(&self, channel_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT channel_id, id, user_id, content, timestamp, thread_ts, message_type, is_deleted, last_edited
                 FROM messages WHERE channel_id = ?1
                 ORDER BY timestamp, id",
            )?;
            let rows = stmt
                .query_map([channel_id], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn count_messages(&self, channel_id: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE channel_id = ?1",
                [channel_id],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Timestamp of the newest stored message of a channel, replies included.
    pub fn last_message_timestamp(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn.query_row(
                "SELECT MAX(timestamp) FROM messages WHERE channel_id = ?1",
                [channel_id],
                |r| r.get(0),
            )?;
            Ok(raw.map(|s| parse_time(0, s)).transpose()?)
        })
    }

    // -- Sync progress --

    /// Where the next incremental walk of a channel starts. Only moved by a
    /// walk that reached the end of the history, so anything older that a
    /// broken walk left behind is fetched again.
    pub fn channel_watermark(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.with_conn(|conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT watermark FROM channel_sync WHERE channel_id = ?1",
                    [channel_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(raw.map(|s| parse_time(0, s)).transpose()?)
        })
    }

    /// Record a completed walk whose newest top-level message is `at`.
    /// The watermark never moves backwards; returns whether it moved.
    pub fn advance_watermark(&self, channel_id: &str, at: &DateTime<Utc>) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO channel_sync (channel_id, watermark, completed_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(channel_id) DO UPDATE SET
                    watermark = excluded.watermark,
                    completed_at = excluded.completed_at
                 WHERE excluded.watermark > channel_sync.watermark",
                params![channel_id, fmt_time(at), fmt_time(&Utc::now())],
            )?;
            Ok(changed > 0)
        })
    }

    /// Remember a thread whose replies still have to be fetched.
    pub fn mark_thread_pending(&self, channel_id: &str, root_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO pending_threads (channel_id, root_id, marked_at)
                 VALUES (?1, ?2, ?3)",
                params![channel_id, root_id, fmt_time(&Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn clear_thread_pending(&self, channel_id: &str, root_id: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM pending_threads WHERE channel_id = ?1 AND root_id = ?2",
                params![channel_id, root_id],
            )?;
            Ok(())
        })
    }

    /// Roots of the channel's unfinished threads, oldest first.
    pub fn pending_threads(&self, channel_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT root_id FROM pending_threads WHERE channel_id = ?1 ORDER BY root_id",
            )?;
            let roots = stmt
                .query_map([channel_id], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(roots)
        })
    }

    // -- Files --

    /// Insert or refresh a file row. An empty checksum never overwrites a
    /// known one, so re-registering a resolved file leaves it resolved.
    pub fn upsert_file(&self, file: &FileRecord) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO files
                    (id, channel_id, message_id, original_url, local_path, file_name, file_type,
                     size_bytes, upload_timestamp, checksum)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id, channel_id, message_id) DO UPDATE SET
                    original_url = excluded.original_url,
                    local_path = excluded.local_path,
                    file_name = excluded.file_name,
                    file_type = excluded.file_type,
                    size_bytes = excluded.size_bytes,
                    upload_timestamp = excluded.upload_timestamp,
                    checksum = CASE WHEN excluded.checksum = '' THEN files.checksum ELSE excluded.checksum END
                 WHERE files.original_url IS NOT excluded.original_url
                    OR files.local_path IS NOT excluded.local_path
                    OR files.file_name IS NOT excluded.file_name
                    OR files.file_type IS NOT excluded.file_type
                    OR files.size_bytes IS NOT excluded.size_bytes
                    OR files.upload_timestamp IS NOT excluded.upload_timestamp
                    OR (excluded.checksum != '' AND files.checksum IS NOT excluded.checksum)",
                params![
                    file.id,
                    file.channel_id,
                    file.message_id,
                    file.original_url,
                    file.local_path,
                    file.name,
                    file.file_type,
                    file.size_bytes as i64,
                    fmt_time(&file.uploaded_at),
                    file.checksum
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_file(&self, id: &str, channel_id: &str, message_id: &str) -> Result<Option<FileRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {FILE_COLUMNS} FROM files f
                 WHERE f.id = ?1 AND f.channel_id = ?2 AND f.message_id = ?3"
            );
            let row = conn
                .query_row(&sql, [id, channel_id, message_id], map_file)
                .optional()?;
            Ok(row)
        })
    }

    /// Checksum recorded for any earlier registration of the same remote file.
    pub fn known_checksum(&self, file_id: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT checksum FROM files WHERE id = ?1 AND checksum != '' LIMIT 1",
                    [file_id],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Every resolved file whose content hashes to `checksum`.
    pub fn files_with_checksum(&self, checksum: &str) -> Result<Vec<FileRecord>> {
        if checksum.is_empty() {
            return Ok(vec![]);
        }
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {FILE_COLUMNS} FROM files f
                 WHERE f.checksum = ?1
                 ORDER BY f.upload_timestamp, f.id"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([checksum], map_file)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// File rows whose owning message no longer exists.
    pub fn orphaned_files(&self) -> Result<Vec<FileRecord>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {FILE_COLUMNS} FROM files f
                 LEFT JOIN messages m ON m.channel_id = f.channel_id AND m.id = f.message_id
                 WHERE m.id IS NULL
                 ORDER BY f.local_path"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], map_file)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Whether a row other than `file` with a live owning message still
    /// points at `file.local_path`.
    pub fn path_shared_with_live_file(&self, file: &FileRecord) -> Result<bool> {
        self.with_conn(|conn| {
            Ok(exists(
                conn,
                "SELECT 1 FROM files f
                 JOIN messages m ON m.channel_id = f.channel_id AND m.id = f.message_id
                 WHERE f.local_path = ?1
                   AND NOT (f.id = ?2 AND f.channel_id = ?3 AND f.message_id = ?4)",
                [&file.local_path, &file.id, &file.channel_id, &file.message_id],
            )?)
        })
    }

    pub fn delete_file(&self, file: &FileRecord) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM files WHERE id = ?1 AND channel_id = ?2 AND message_id = ?3",
                [&file.id, &file.channel_id, &file.message_id],
            )?;
            Ok(deleted > 0)
        })
    }

    pub fn count_files(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
            Ok(n as usize)
        })
    }
}

fn exists<P: Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<bool> {
    conn.query_row(sql, params, |_| Ok(()))
        .optional()
        .map(|r| r.is_some())
}

/// Fixed-width RFC 3339 in UTC, so text ordering is chronological ordering.
pub(crate) fn fmt_time(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(idx: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn map_channel(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let kind: String = row.get(2)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: ChannelKind::parse(&kind).unwrap_or(ChannelKind::Public),
        is_archived: row.get(3)?,
        created_at: parse_time(4, row.get(4)?)?,
        topic: row.get(5)?,
        purpose: row.get(6)?,
    })
}

fn map_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        channel_id: row.get(0)?,
        id: row.get(1)?,
        author_id: row.get(2)?,
        content: row.get(3)?,
        timestamp: parse_time(4, row.get(4)?)?,
        thread_id: row.get(5)?,
        kind: row.get(6)?,
        is_deleted: row.get(7)?,
        last_edited: row
            .get::<_, Option<String>>(8)?
            .map(|s| parse_time(8, s))
            .transpose()?,
    })
}

fn map_file(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        message_id: row.get(2)?,
        original_url: row.get(3)?,
        local_path: row.get(4)?,
        name: row.get(5)?,
        file_type: row.get(6)?,
        size_bytes: row.get::<_, i64>(7)?.max(0) as u64,
        uploaded_at: parse_time(8, row.get(8)?)?,
        checksum: row.get(9)?,
    })
}
