use reqwest::Client;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::endpoint::{self, Resolved};
use crate::error::ChatError;
use crate::extract::{extract_model, extract_reply};
use crate::models::{ChatRequest, GenerationSettings, InputMessage, Profile, Role};
use crate::relay::{RelayEvent, StreamRelay};
use crate::request::{build_upstream_body, effective_model, wants_stream};
use crate::transcode::{transcode_messages, SkippedPart};
use crate::{db, persist};

/** \brief Relay events in flight between the relay task and the caller. */
const RELAY_BUFFER: usize = 1;

/**
 * \brief Everything checked and resolved before any side effect.
 */
#[derive(Debug, Clone)]
pub struct ChatPlan {
    pub profile: Profile,
    pub conversation_id: Option<i64>,
    pub model: String,
    pub merged: GenerationSettings,
    pub messages: Vec<InputMessage>,
}

/**
 * \brief A plan with its upstream body built.
 */
#[derive(Debug, Clone)]
pub struct PreparedChat {
    pub plan: ChatPlan,
    pub body: Value,
    pub skipped: Vec<SkippedPart>,
}

impl PreparedChat {
    pub fn stream(&self) -> bool {
        wants_stream(&self.body)
    }

    pub fn debug(&self) -> bool {
        self.plan.merged.debug_enabled()
    }

    /* Outgoing request as shown on the debug channel. The key lives in a
     * header, never in the body, so the body is safe to echo. */
    fn debug_payload(&self, url: &str) -> Option<Value> {
        self.debug().then(|| json!({"url": url, "body": self.body}))
    }
}

/**
 * \brief Non-streaming result: the upstream body passed through untouched.
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReply {
    pub conversation_id: i64,
    pub response: Value,
}

pub enum ChatOutcome {
    Completed(CompletionReply),
    /** \brief Relay events; the relay runs on its own task until `done`/`error`. */
    Streaming(mpsc::Receiver<RelayEvent>),
}

/**
 * \brief Validation and lookups. Read-only.
 */
pub fn plan(conn: &Connection, request: ChatRequest) -> Result<ChatPlan, ChatError> {
    request.validate().map_err(ChatError::Validation)?;
    let profile = db::get_profile(conn, request.profile_id)?
        .ok_or_else(|| ChatError::NotFound(format!("profile {} not found", request.profile_id)))?;
    persist::check_conversation(conn, profile.id, request.conversation_id)?;

    let merged = profile.settings.overlay(&request.params);
    let model = effective_model(request.model.as_deref(), &merged).ok_or_else(|| {
        ChatError::Validation("no model given and the profile has no default model".into())
    })?;

    Ok(ChatPlan {
        profile,
        conversation_id: request.conversation_id,
        model,
        merged,
        messages: request.messages,
    })
}

/**
 * \brief Transcodes messages and builds the upstream body.
 */
pub async fn prepare(plan: ChatPlan) -> PreparedChat {
    let transcoded = transcode_messages(&plan.messages, plan.merged.system_prompt.as_deref()).await;
    let body = build_upstream_body(&plan.model, transcoded.messages, &plan.merged);
    PreparedChat {
        plan,
        body,
        skipped: transcoded.skipped,
    }
}

/**
 * \brief Creates or reuses the conversation and stores the caller's new turns.
 *        Runs before the upstream is contacted.
 */
pub fn commit_user_turns(conn: &Connection, prepared: &PreparedChat) -> Result<i64, ChatError> {
    let plan = &prepared.plan;
    let first_user_text = plan
        .messages
        .iter()
        .find(|m| m.role == Role::User)
        .map(InputMessage::flattened_text)
        .unwrap_or_default();
    let conversation_id = persist::ensure_conversation(
        conn,
        plan.profile.id,
        plan.conversation_id,
        &plan.model,
        &first_user_text,
    )?;
    let written = persist::record_input_turns(conn, conversation_id, &plan.messages)?;
    tracing::debug!(conversation_id, written, "user turns recorded");
    Ok(conversation_id)
}

/**
 * \brief Runs one chat request end to end.
 * \details Validation and not-found failures return before anything is stored.
 *          Once the user turns are stored they stay, whatever the upstream does.
 */
pub async fn run_chat(
    conn: Connection,
    client: Client,
    request: ChatRequest,
) -> Result<ChatOutcome, ChatError> {
    let plan = plan(&conn, request)?;
    let prepared = prepare(plan).await;
    tracing::info!(
        profile_id = prepared.plan.profile.id,
        conversation_id = ?prepared.plan.conversation_id,
        model = %prepared.plan.model,
        messages = prepared.plan.messages.len(),
        stream = prepared.stream(),
        skipped_parts = prepared.skipped.len(),
        "chat request"
    );
    let conversation_id = commit_user_turns(&conn, &prepared)?;

    if prepared.stream() {
        let (tx, rx) = mpsc::channel(RELAY_BUFFER);
        let relay = StreamRelay::new(tx, prepared.debug());
        tokio::spawn(relay_chat(conn, client, prepared, conversation_id, relay));
        return Ok(ChatOutcome::Streaming(rx));
    }

    let reply = complete_chat(conn, &client, &prepared, conversation_id).await?;
    Ok(ChatOutcome::Completed(reply))
}

async fn send_upstream(
    client: &Client,
    prepared: &PreparedChat,
    event_stream: bool,
) -> Result<Resolved, ChatError> {
    let profile = &prepared.plan.profile;
    let resolved = endpoint::post_first_live(
        client,
        &profile.api_base_url,
        &profile.api_key,
        &prepared.body,
        event_stream,
    )
    .await
    .map_err(|e| ChatError::Transport {
        message: e.to_string(),
        debug: prepared.debug_payload(&e.url),
    })?;

    let status = resolved.response.status();
    if !status.is_success() {
        let debug = prepared.debug_payload(&resolved.url);
        let body = resolved.response.text().await.unwrap_or_default();
        return Err(ChatError::Upstream {
            status,
            body,
            debug,
        });
    }
    tracing::info!(url = %resolved.url, %status, "upstream accepted request");
    Ok(resolved)
}

/* Takes the connection by value: a borrowed `Connection` held across an
 * await would make the future `!Send`. */
async fn complete_chat(
    conn: Connection,
    client: &Client,
    prepared: &PreparedChat,
    conversation_id: i64,
) -> Result<CompletionReply, ChatError> {
    let resolved = send_upstream(client, prepared, false).await?;
    let url = resolved.url;
    let response: Value = resolved.response.json().await.map_err(|e| ChatError::Transport {
        message: format!("upstream returned an unreadable body: {e}"),
        debug: prepared.debug_payload(&url),
    })?;

    let reply = extract_reply(&response);
    persist::record_reply(&conn, conversation_id, &reply, extract_model(&response).as_deref())?;
    tracing::info!(conversation_id, reply_len = reply.len(), "chat completed");
    Ok(CompletionReply {
        conversation_id,
        response,
    })
}

async fn relay_chat(
    conn: Connection,
    client: Client,
    prepared: PreparedChat,
    conversation_id: i64,
    mut relay: StreamRelay,
) {
    relay.announce(conversation_id, &prepared.plan.model).await;
    for skip in &prepared.skipped {
        relay
            .debug_event(json!({"stage": "transcode", "skipped": skip}))
            .await;
    }

    let resolved = match send_upstream(&client, &prepared, true).await {
        Ok(resolved) => resolved,
        Err(err) => {
            tracing::warn!(conversation_id, error = %err, "stream could not be opened");
            relay.fail(&err).await;
            return;
        }
    };
    relay
        .debug_event(json!({"stage": "request", "url": resolved.url, "body": prepared.body}))
        .await;

    relay.pump(resolved.response.bytes_stream()).await;

    if let Err(err) =
        persist::record_reply(&conn, conversation_id, relay.reply(), relay.upstream_model())
    {
        tracing::error!(conversation_id, error = %err, "assistant reply not stored");
        relay.fail(&err).await;
        return;
    }
    relay.close(conversation_id).await;
    tracing::info!(
        conversation_id,
        deltas = relay.deltas(),
        reply_len = relay.reply().len(),
        disconnected = relay.is_disconnected(),
        "relay closed"
    );
}
