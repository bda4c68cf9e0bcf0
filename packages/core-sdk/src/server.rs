use std::convert::Infallible;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, patch, post, put},
    Json, Router,
};
use reqwest::Client;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

use crate::chat::{self, ChatOutcome};
use crate::config::Config;
use crate::error::ChatError;
use crate::models::{ChatRequest, NewProfile, ProfilePatch, Role};
use crate::relay::RelayEvent;
use crate::{db, llm};

/**
 * \brief Shared handler state. Each request opens its own database connection.
 */
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub client: Client,
}

impl AppState {
    /**
     * \brief Prepares the database schema, the upload dir and the upstream HTTP client.
     */
    pub fn new(config: Config) -> Result<Self> {
        let conn = db::open_db(&config.database_path)?;
        db::migrate(&conn)?;
        std::fs::create_dir_all(&config.upload_dir)
            .with_context(|| format!("create upload dir {}", config.upload_dir.display()))?;
        let client = Client::builder()
            .user_agent(concat!("chatrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self {
            config: Arc::new(config),
            client,
        })
    }

    pub fn open_db(&self) -> Result<Connection, ChatError> {
        Ok(db::open_db(&self.config.database_path)?)
    }
}

/**
 * \brief Builds the full router: JSON API, chat relay and the static UI fallback.
 */
pub fn router(state: AppState) -> Router {
    let static_service =
        ServeDir::new(&state.config.ui_dir).append_index_html_on_directories(true);
    let body_limit = state.config.upload_limit;

    Router::new()
        .route("/api/health", get(health))
        .route("/api/profiles", get(list_profiles).post(create_profile))
        .route(
            "/api/profiles/{id}",
            get(get_profile).put(update_profile).delete(delete_profile),
        )
        .route("/api/profiles/{id}/models", get(list_models))
        .route("/api/conversations", get(list_conversations))
        .route("/api/conversations/{id}/messages", get(conversation_messages))
        .route(
            "/api/conversations/{id}",
            patch(rename_conversation).delete(delete_conversation),
        )
        .route("/api/messages/{id}", put(update_message).delete(delete_message))
        .route("/api/upload", post(upload))
        .route("/api/chat", post(chat_handler))
        .route("/chat", post(chat_handler))
        .fallback_service(static_service)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief Serves until Ctrl-C or SIGTERM.
 */
pub async fn run(config: Config) -> Result<()> {
    let addr = config.bind_address.clone();
    let state = AppState::new(config)?;
    tracing::info!(
        database = %state.config.database_path.display(),
        uploads = %state.config.upload_dir.display(),
        ui = %state.config.ui_dir.display(),
        "database ready"
    );

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "chat relay listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("chat relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to install CTRL+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => tracing::warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
}

fn ok() -> Json<Value> {
    Json(json!({"ok": true}))
}

fn not_found(what: &str, id: i64) -> ChatError {
    ChatError::NotFound(format!("{what} {id} not found"))
}

async fn health() -> Json<Value> {
    ok()
}

fn check_base_url(raw: &str) -> Result<(), ChatError> {
    let parsed = url::Url::parse(raw.trim())
        .map_err(|e| ChatError::Validation(format!("api_base_url is not a valid URL: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ChatError::Validation(format!(
            "api_base_url must use http or https, got {other}"
        ))),
    }
}

fn check_required(field: &str, value: &str) -> Result<(), ChatError> {
    if value.trim().is_empty() {
        return Err(ChatError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/** \brief Maps axum's body rejection onto the relay's 400. */
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ChatError> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| ChatError::Validation(e.body_text()))
}

async fn list_profiles(State(state): State<AppState>) -> Result<impl IntoResponse, ChatError> {
    let conn = state.open_db()?;
    Ok(Json(db::list_profiles(&conn)?))
}

async fn get_profile(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.open_db()?;
    let profile = db::get_profile(&conn, id)?.ok_or_else(|| not_found("profile", id))?;
    Ok(Json(profile))
}

async fn create_profile(
    State(state): State<AppState>,
    payload: Result<Json<NewProfile>, JsonRejection>,
) -> Result<impl IntoResponse, ChatError> {
    let input = json_body(payload)?;
    check_required("name", &input.name)?;
    check_required("api_key", &input.api_key)?;
    check_base_url(&input.api_base_url)?;
    input.settings.validate().map_err(ChatError::Validation)?;

    let conn = state.open_db()?;
    let id = db::insert_profile(&conn, &input)?;
    tracing::info!(profile_id = id, name = %input.name, "profile created");
    Ok(Json(json!({"id": id})))
}

async fn update_profile(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<ProfilePatch>, JsonRejection>,
) -> Result<impl IntoResponse, ChatError> {
    let patch = json_body(payload)?;
    if let Some(name) = &patch.name {
        check_required("name", name)?;
    }
    if let Some(key) = &patch.api_key {
        check_required("api_key", key)?;
    }
    if let Some(base) = &patch.api_base_url {
        check_base_url(base)?;
    }
    if let Some(settings) = &patch.settings {
        settings.validate().map_err(ChatError::Validation)?;
    }

    let conn = state.open_db()?;
    if !db::update_profile(&conn, id, &patch)? {
        return Err(not_found("profile", id));
    }
    tracing::info!(profile_id = id, "profile updated");
    Ok(ok())
}

async fn delete_profile(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.open_db()?;
    db::get_profile(&conn, id)?.ok_or_else(|| not_found("profile", id))?;
    db::delete_profile(&conn, id)?;
    tracing::info!(profile_id = id, "profile deleted");
    Ok(ok())
}

async fn list_models(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let profile = {
        let conn = state.open_db()?;
        db::get_profile(&conn, id)?.ok_or_else(|| not_found("profile", id))?
    };
    let models = llm::list_models(&state.client, &profile).await?;
    Ok(Json(models))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ConversationQuery {
    profile_id: Option<i64>,
}

async fn list_conversations(
    State(state): State<AppState>,
    Query(q): Query<ConversationQuery>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.open_db()?;
    Ok(Json(db::list_conversations(&conn, q.profile_id)?))
}

async fn conversation_messages(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.open_db()?;
    let conversation =
        db::get_conversation(&conn, id)?.ok_or_else(|| not_found("conversation", id))?;
    let messages = db::load_messages(&conn, id)?;
    Ok(Json(json!({"conversation": conversation, "messages": messages})))
}

#[derive(Deserialize, Debug)]
struct RenameRequest {
    title: String,
}

async fn rename_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ChatError> {
    let input = json_body(payload)?;
    let title = input.title.trim();
    check_required("title", title)?;

    let conn = state.open_db()?;
    if !db::rename_conversation(&conn, id, title)? {
        return Err(not_found("conversation", id));
    }
    Ok(ok())
}

async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.open_db()?;
    db::get_conversation(&conn, id)?.ok_or_else(|| not_found("conversation", id))?;
    db::delete_conversation(&conn, id)?;
    tracing::info!(conversation_id = id, "conversation deleted");
    Ok(ok())
}

#[derive(Deserialize, Debug, Default)]
struct MessageEdit {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

async fn update_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    payload: Result<Json<MessageEdit>, JsonRejection>,
) -> Result<impl IntoResponse, ChatError> {
    let edit = json_body(payload)?;
    let conn = state.open_db()?;
    let current = db::get_message(&conn, id)?.ok_or_else(|| not_found("message", id))?;
    let content = edit.content.unwrap_or(current.content);
    let role = edit
        .role
        .as_deref()
        .and_then(Role::parse)
        .unwrap_or(current.role);
    if !db::update_message(&conn, id, &content, role)? {
        return Err(not_found("message", id));
    }
    Ok(ok())
}

async fn delete_message(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ChatError> {
    let conn = state.open_db()?;
    if !db::delete_message(&conn, id)? {
        return Err(not_found("message", id));
    }
    Ok(ok())
}

/**
 * \brief Stored upload, as returned to the caller. `path` is what an
 *        `image_path` part references.
 */
#[derive(Serialize, Debug)]
struct UploadedFile {
    filename: String,
    mimetype: String,
    path: String,
    size: usize,
}

/**
 * \brief Keeps `[A-Za-z0-9_.-]` and replaces everything else with `_`.
 */
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ChatError> {
    let bad_form = |e: axum::extract::multipart::MultipartError| {
        ChatError::Validation(format!("invalid multipart body: {e}"))
    };

    while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
        if field.name() != Some("file") {
            continue;
        }
        let original = field.file_name().unwrap_or("upload").to_string();
        let mimetype = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field.bytes().await.map_err(bad_form)?;

        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        let filename = format!("{millis}-{}", sanitize_filename(&original));
        let dir = &state.config.upload_dir;
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create upload dir {}", dir.display()))?;
        let target = dir.join(&filename);
        tokio::fs::write(&target, &bytes)
            .await
            .with_context(|| format!("write upload {}", target.display()))?;

        tracing::info!(%filename, %mimetype, size = bytes.len(), "file uploaded");
        return Ok(Json(UploadedFile {
            filename,
            mimetype,
            path: target.to_string_lossy().into_owned(),
            size: bytes.len(),
        }));
    }
    Err(ChatError::Validation("multipart field `file` is required".into()))
}

async fn chat_handler(
    State(state): State<AppState>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Response, ChatError> {
    let request = json_body(payload)?;
    let conn = state.open_db()?;
    match chat::run_chat(conn, state.client.clone(), request).await? {
        ChatOutcome::Completed(reply) => Ok(Json(reply).into_response()),
        ChatOutcome::Streaming(rx) => Ok(relay_response(rx)),
    }
}

/**
 * \brief Turns relay events into a `text/event-stream` response. The stream
 *        ends when the relay task drops its sender.
 */
fn relay_response(rx: mpsc::Receiver<RelayEvent>) -> Response {
    let events = ReceiverStream::new(rx).map(|ev| {
        Ok::<_, Infallible>(Event::default().event(ev.name()).data(ev.data().to_string()))
    });
    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-transform"),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("my photo (1).png"), "my_photo__1_.png");
        assert_eq!(sanitize_filename("../etc/passwd"), ".._etc_passwd");
        assert_eq!(sanitize_filename("ok_name-2.jpeg"), "ok_name-2.jpeg");
    }

    #[test]
    fn base_url_must_be_http() {
        assert!(check_base_url("https://api.openai.com/v1").is_ok());
        assert!(check_base_url("http://localhost:11434").is_ok());
        assert!(matches!(
            check_base_url("ftp://example.com"),
            Err(ChatError::Validation(_))
        ));
        assert!(matches!(check_base_url("not a url"), Err(ChatError::Validation(_))));
    }
}
