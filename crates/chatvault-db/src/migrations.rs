use anyhow::{Context, Result};
use rusqlite::Connection;
use tracing::info;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial schema",
        sql: "
        CREATE TABLE IF NOT EXISTS channels (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL,
            channel_type    TEXT NOT NULL,
            is_archived     INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL,
            topic           TEXT NOT NULL DEFAULT '',
            purpose         TEXT NOT NULL DEFAULT ''
        );

        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            username        TEXT NOT NULL,
            display_name    TEXT NOT NULL DEFAULT '',
            avatar_url      TEXT NOT NULL DEFAULT '',
            first_seen      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            channel_id      TEXT NOT NULL REFERENCES channels(id),
            id              TEXT NOT NULL,
            user_id         TEXT NOT NULL REFERENCES users(id),
            content         TEXT NOT NULL DEFAULT '',
            timestamp       TEXT NOT NULL,
            thread_ts       TEXT,
            message_type    TEXT NOT NULL,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            last_edited     TEXT,
            PRIMARY KEY (channel_id, id)
        );

        -- No foreign key to messages: a file whose message is gone is an
        -- orphan for the sweep to reclaim, not a constraint violation.
        CREATE TABLE IF NOT EXISTS files (
            id                  TEXT NOT NULL,
            channel_id          TEXT NOT NULL,
            message_id          TEXT NOT NULL,
            original_url        TEXT NOT NULL,
            local_path          TEXT NOT NULL,
            file_name           TEXT NOT NULL,
            file_type           TEXT NOT NULL,
            size_bytes          INTEGER NOT NULL,
            upload_timestamp    TEXT NOT NULL,
            checksum            TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (id, channel_id, message_id)
        );
        ",
    },
    Migration {
        version: 2,
        name: "lookup indexes",
        sql: "
        CREATE INDEX IF NOT EXISTS idx_messages_channel_ts
            ON messages(channel_id, timestamp);

        CREATE INDEX IF NOT EXISTS idx_files_checksum
            ON files(checksum) WHERE checksum != '';

        CREATE INDEX IF NOT EXISTS idx_files_message
            ON files(channel_id, message_id);

        CREATE INDEX IF NOT EXISTS idx_files_path
            ON files(local_path);
        ",
    },
    Migration {
        version: 3,
        name: "per-channel sync progress",
        sql: "
        CREATE TABLE IF NOT EXISTS channel_sync (
            channel_id      TEXT PRIMARY KEY,
            watermark       TEXT NOT NULL,
            completed_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_threads (
            channel_id      TEXT NOT NULL,
            root_id         TEXT NOT NULL,
            marked_at       TEXT NOT NULL,
            PRIMARY KEY (channel_id, root_id)
        );
        ",
    },
];

/// Apply every migration newer than the recorded schema version.
///
/// Each migration runs in its own transaction together with its
/// `schema_migrations` record, so a failed step leaves the previous version
/// intact and the next start retries it.
pub fn run(conn: &mut Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );",
    )?;

    let current = current_version(conn)?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        info!("Database: running migration v{} ({})", migration.version, migration.name);

        let tx = conn.transaction()?;
        tx.execute_batch(migration.sql)
            .with_context(|| format!("failed to apply migration {}", migration.version))?;
        tx.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, datetime('now'))",
            [migration.version],
        )?;
        tx.commit()
            .with_context(|| format!("failed to commit migration {}", migration.version))?;
    }

    Ok(())
}

pub fn current_version(conn: &Connection) -> Result<i64> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |r| r.get(0),
    )?;
    Ok(version)
}

/// Highest version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}
