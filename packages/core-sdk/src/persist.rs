use rusqlite::Connection;

use crate::db;
use crate::error::ChatError;
use crate::models::{conversation_title, InputMessage, Role, StoredMessage};

/**
 * \brief Reuses `conversation_id` when given, otherwise creates a conversation
 *        titled from the first user turn.
 * \details An existing id must belong to `profile_id`. Nothing is written when
 *          the lookup fails.
 */
pub fn ensure_conversation(
    conn: &Connection,
    profile_id: i64,
    conversation_id: Option<i64>,
    model: &str,
    first_user_text: &str,
) -> Result<i64, ChatError> {
    if let Some(id) = conversation_id {
        check_conversation(conn, profile_id, Some(id))?;
        return Ok(id);
    }
    let title = conversation_title(first_user_text);
    let id = db::create_conversation(conn, profile_id, Some(&title), Some(model))?;
    tracing::info!(conversation_id = id, profile_id, "conversation created");
    Ok(id)
}

/**
 * \brief Fails with not-found unless `conversation_id` exists under `profile_id`.
 *        Read-only; used to reject a request before anything is written.
 */
pub fn check_conversation(
    conn: &Connection,
    profile_id: i64,
    conversation_id: Option<i64>,
) -> Result<(), ChatError> {
    let Some(id) = conversation_id else {
        return Ok(());
    };
    match db::get_conversation(conn, id)? {
        Some(conv) if conv.profile_id == profile_id => Ok(()),
        _ => Err(ChatError::NotFound(format!(
            "conversation {id} not found for profile {profile_id}"
        ))),
    }
}

/**
 * \brief Appends one turn; the conversation's `updated_at` moves with it.
 */
pub fn record_turn(
    conn: &Connection,
    conversation_id: i64,
    role: Role,
    content: &str,
) -> Result<i64, ChatError> {
    Ok(db::insert_message(conn, conversation_id, role, content)?)
}

/**
 * \brief Input messages that are not yet stored.
 * \details Clients replay the whole thread on every turn. Input that starts
 *          with the complete stored thread (role and flattened text, in order)
 *          is a replay and only its tail is new. Anything else, including a
 *          lone message that happens to repeat an earlier turn, is written in
 *          full.
 */
pub fn pending_turns<'a>(stored: &[StoredMessage], input: &'a [InputMessage]) -> &'a [InputMessage] {
    let replayed = stored
        .iter()
        .zip(input)
        .take_while(|(s, i)| s.role == i.role && s.content == i.flattened_text())
        .count();
    if replayed == stored.len() {
        &input[replayed..]
    } else {
        input
    }
}

/**
 * \brief Writes every not-yet-stored input message, in order. Returns how many
 *        were written.
 */
pub fn record_input_turns(
    conn: &Connection,
    conversation_id: i64,
    input: &[InputMessage],
) -> Result<usize, ChatError> {
    let stored = db::load_messages(conn, conversation_id)?;
    let pending = pending_turns(&stored, input);
    for message in pending {
        record_turn(conn, conversation_id, message.role, &message.flattened_text())?;
    }
    Ok(pending.len())
}

/**
 * \brief Stores the assistant reply (possibly empty, possibly partial) and,
 *        when the upstream reported one, the model that actually answered.
 */
pub fn record_reply(
    conn: &Connection,
    conversation_id: i64,
    reply: &str,
    upstream_model: Option<&str>,
) -> Result<i64, ChatError> {
    let id = record_turn(conn, conversation_id, Role::Assistant, reply)?;
    if let Some(model) = upstream_model {
        db::set_conversation_model(conn, conversation_id, model)?;
    }
    Ok(id)
}
