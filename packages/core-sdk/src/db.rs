use anyhow::{Context, Result};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::{path::Path, thread, time::Duration};
use time::{macros::format_description, OffsetDateTime};

use crate::models::{
    Conversation, GenerationSettings, NewProfile, Profile, ProfilePatch, Role, StoredMessage,
};

impl ToSql for Role {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Role {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Role::parse(text).ok_or_else(|| FromSqlError::Other(format!("unknown role {text}").into()))
    }
}

/**
 * \brief Opens the database file, creating its parent directory if needed.
 */
pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create database dir {}", dir.display()))?;
        }
    }
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

/**
 * \brief In-memory database with the schema applied.
 */
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    migrate(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/**
 * \brief Creates the schema. Safe to run on every start.
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            api_base_url TEXT NOT NULL,
            api_key TEXT NOT NULL,
            settings_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS conversations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            profile_id INTEGER NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
            title TEXT,
            model TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            token_count INTEGER,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id);
        "#,
        )
    })?;
    Ok(())
}

/**
 * \brief UTC timestamp with fixed-width microseconds so text ordering matches time ordering.
 */
pub fn now_timestamp() -> String {
    let fmt = format_description!(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
    );
    OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

fn row_to_profile(row: &rusqlite::Row<'_>) -> rusqlite::Result<(Profile, String)> {
    Ok((
        Profile {
            id: row.get(0)?,
            name: row.get(1)?,
            api_base_url: row.get(2)?,
            api_key: row.get(3)?,
            settings: GenerationSettings::default(),
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
        },
        row.get(4)?,
    ))
}

fn with_settings((mut profile, settings_json): (Profile, String)) -> Result<Profile> {
    profile.settings = serde_json::from_str(&settings_json)
        .with_context(|| format!("profile {} has unreadable settings", profile.id))?;
    Ok(profile)
}

const PROFILE_COLUMNS: &str =
    "id, name, api_base_url, api_key, settings_json, created_at, updated_at";

/**
 * \brief Inserts a profile and returns its id.
 */
pub fn insert_profile(conn: &Connection, input: &NewProfile) -> Result<i64> {
    let settings_json = serde_json::to_string(&input.settings)?;
    let now = now_timestamp();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO profiles (name, api_base_url, api_key, settings_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            params![input.name, input.api_base_url, input.api_key, settings_json, now],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

/**
 * \brief Applies a partial update. Returns `false` when the profile does not exist.
 */
pub fn update_profile(conn: &Connection, id: i64, patch: &ProfilePatch) -> Result<bool> {
    let Some(current) = get_profile(conn, id)? else {
        return Ok(false);
    };
    let name = patch.name.as_deref().unwrap_or(&current.name);
    let api_base_url = patch
        .api_base_url
        .as_deref()
        .unwrap_or(&current.api_base_url);
    let api_key = patch.api_key.as_deref().unwrap_or(&current.api_key);
    let settings = patch.settings.as_ref().unwrap_or(&current.settings);
    let settings_json = serde_json::to_string(settings)?;
    let now = now_timestamp();
    retry_on_locked(|| {
        conn.execute(
            "UPDATE profiles SET name=?1, api_base_url=?2, api_key=?3, settings_json=?4, updated_at=?5 WHERE id=?6",
            params![name, api_base_url, api_key, settings_json, now, id],
        )
    })?;
    Ok(true)
}

/**
 * \brief Deletes a profile together with its conversations and messages.
 */
pub fn delete_profile(conn: &Connection, id: i64) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM profiles WHERE id=?1", params![id]))?;
    Ok(())
}

/**
 * \brief All profiles, newest first.
 */
pub fn list_profiles(conn: &Connection) -> Result<Vec<Profile>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY id DESC"
    ))?;
    let rows = stmt
        .query_map([], row_to_profile)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.into_iter().map(with_settings).collect()
}

pub fn get_profile(conn: &Connection, id: i64) -> Result<Option<Profile>> {
    let row = conn
        .query_row(
            &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id=?1"),
            params![id],
            row_to_profile,
        )
        .optional()?;
    row.map(with_settings).transpose()
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        profile_id: row.get(1)?,
        title: row.get(2)?,
        model: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

/**
 * \brief Creates a conversation and returns its id.
 */
pub fn create_conversation(
    conn: &Connection,
    profile_id: i64,
    title: Option<&str>,
    model: Option<&str>,
) -> Result<i64> {
    let now = now_timestamp();
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO conversations (profile_id, title, model, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![profile_id, title, model, now],
        )
    })?;
    Ok(conn.last_insert_rowid())
}

pub fn get_conversation(conn: &Connection, id: i64) -> Result<Option<Conversation>> {
    conn.query_row(
        "SELECT id, profile_id, title, model, created_at, updated_at FROM conversations WHERE id=?1",
        params![id],
        row_to_conversation,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief Conversations ordered by most recent activity, optionally for one profile.
 */
pub fn list_conversations(conn: &Connection, profile_id: Option<i64>) -> Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT id, profile_id, title, model, created_at, updated_at FROM conversations
         WHERE (?1 IS NULL OR profile_id = ?1)
         ORDER BY updated_at DESC, id DESC",
    )?;
    let rows = stmt
        .query_map(params![profile_id], row_to_conversation)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief Renames a conversation. Returns `false` when it does not exist.
 */
pub fn rename_conversation(conn: &Connection, id: i64, title: &str) -> Result<bool> {
    let rows = retry_on_locked(|| {
        conn.execute(
            "UPDATE conversations SET title=?1, updated_at=?2 WHERE id=?3",
            params![title, now_timestamp(), id],
        )
    })?;
    Ok(rows > 0)
}

pub fn set_conversation_model(conn: &Connection, id: i64, model: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "UPDATE conversations SET model=?1 WHERE id=?2",
            params![model, id],
        )
    })?;
    Ok(())
}

pub fn delete_conversation(conn: &Connection, id: i64) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM conversations WHERE id=?1", params![id]))?;
    Ok(())
}

fn touch_conversation(conn: &Connection, id: i64) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "UPDATE conversations SET updated_at=?1 WHERE id=?2",
            params![now_timestamp(), id],
        )
    })?;
    Ok(())
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        role: row.get(2)?,
        content: row.get(3)?,
        token_count: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/**
 * \brief Appends one message and bumps the conversation's `updated_at`.
 */
pub fn insert_message(
    conn: &Connection,
    conversation_id: i64,
    role: Role,
    content: &str,
) -> Result<i64> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO messages (conversation_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![conversation_id, role, content, now_timestamp()],
        )
    })?;
    let id = conn.last_insert_rowid();
    touch_conversation(conn, conversation_id)?;
    Ok(id)
}

pub fn get_message(conn: &Connection, id: i64) -> Result<Option<StoredMessage>> {
    conn.query_row(
        "SELECT id, conversation_id, role, content, token_count, created_at FROM messages WHERE id=?1",
        params![id],
        row_to_message,
    )
    .optional()
    .map_err(Into::into)
}

/**
 * \brief Messages of a conversation in creation order.
 */
pub fn load_messages(conn: &Connection, conversation_id: i64) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, content, token_count, created_at FROM messages
         WHERE conversation_id=?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![conversation_id], row_to_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/**
 * \brief Edits a message's content and role. Returns `false` when it does not exist.
 */
pub fn update_message(conn: &Connection, id: i64, content: &str, role: Role) -> Result<bool> {
    let Some(current) = get_message(conn, id)? else {
        return Ok(false);
    };
    retry_on_locked(|| {
        conn.execute(
            "UPDATE messages SET content=?1, role=?2 WHERE id=?3",
            params![content, role, id],
        )
    })?;
    touch_conversation(conn, current.conversation_id)?;
    Ok(true)
}

/**
 * \brief Deletes a message. Returns `false` when it does not exist.
 */
pub fn delete_message(conn: &Connection, id: i64) -> Result<bool> {
    let Some(current) = get_message(conn, id)? else {
        return Ok(false);
    };
    retry_on_locked(|| conn.execute("DELETE FROM messages WHERE id=?1", params![id]))?;
    touch_conversation(conn, current.conversation_id)?;
    Ok(true)
}

/**
 * \brief Retries `SQLITE_BUSY`/`SQLITE_LOCKED` with linear backoff, at most 6 attempts.
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                tracing::debug!(attempt, "database locked, retrying");
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
