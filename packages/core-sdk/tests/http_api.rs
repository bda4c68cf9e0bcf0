use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use chatrelay_core_sdk::config::Config;
use chatrelay_core_sdk::server::{router, AppState};

struct Harness {
    _dir: tempfile::TempDir,
    app: Router,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = AppState::new(Config::rooted_at(dir.path())).expect("app state");
    Harness {
        app: router(state),
        _dir: dir,
    }
}

impl Harness {
    async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Bytes) {
        let resp = self.app.clone().oneshot(req).await.expect("response");
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = resp.into_body().collect().await.expect("body").to_bytes();
        (status, headers, body)
    }

    async fn json(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let req = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let (status, _, bytes) = self.send(req).await;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes)))
        };
        (status, value)
    }

    async fn add_profile(&self, base: &str, settings: Value) -> i64 {
        let (status, body) = self
            .json(
                Method::POST,
                "/api/profiles",
                Some(json!({
                    "name": "local",
                    "api_base_url": base,
                    "api_key": "sk-secret",
                    "settings": settings,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        body["id"].as_i64().expect("profile id")
    }
}

/* Splits a text/event-stream body into (event, data) pairs; comments are dropped. */
fn sse_events(body: &[u8]) -> Vec<(String, Value)> {
    String::from_utf8_lossy(body)
        .split("\n\n")
        .filter_map(|block| {
            let mut name = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(v) = line.strip_prefix("event:") {
                    name = Some(v.trim_start().to_string());
                } else if let Some(v) = line.strip_prefix("data:") {
                    data = serde_json::from_str::<Value>(v.trim_start()).ok();
                }
            }
            Some((name?, data?))
        })
        .collect()
}

async fn upstream_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter_map(|r| serde_json::from_slice(&r.body).ok())
        .collect()
}

#[tokio::test]
async fn health_reports_ok() {
    let h = harness();
    let (status, body) = h.json(Method::GET, "/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}

#[tokio::test]
async fn profiles_hide_key_and_validate_urls() {
    let h = harness();
    let id = h.add_profile("https://api.example.com/v1", json!({"model": "gpt-4o"})).await;

    let (status, list) = h.json(Method::GET, "/api/profiles", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list[0]["id"], id);
    assert_eq!(list[0]["settings"]["model"], "gpt-4o");
    assert!(list[0].get("api_key").is_none());
    assert!(!list.to_string().contains("sk-secret"));

    let (status, _) = h
        .json(
            Method::POST,
            "/api/profiles",
            Some(json!({"name": "x", "api_base_url": "ftp://nope", "api_key": "k"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .json(
            Method::PUT,
            &format!("/api/profiles/{id}"),
            Some(json!({"name": "renamed"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, profile) = h.json(Method::GET, &format!("/api/profiles/{id}"), None).await;
    assert_eq!(profile["name"], "renamed");
    assert_eq!(profile["api_base_url"], "https://api.example.com/v1");

    let (status, _) = h.json(Method::DELETE, &format!("/api/profiles/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h.json(Method::GET, &format!("/api/profiles/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn non_streaming_chat_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}}]
        })))
        .mount(&server)
        .await;
    let h = harness();
    let pid = h.add_profile(&server.uri(), json!({"model": "gpt-test"})).await;

    let (status, reply) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(json!({
                "profileId": pid,
                "messages": [{"role": "user", "content": "Hello"}],
                "params": {"stream": false, "temperature": 0.3},
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{reply}");
    assert_eq!(reply["response"]["id"], "cmpl-1");
    let conv_id = reply["conversationId"].as_i64().expect("conversation id");

    let sent = upstream_bodies(&server).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0]["model"], "gpt-test");
    assert_eq!(sent[0]["temperature"], 0.3);
    assert_eq!(sent[0]["messages"], json!([{"role": "user", "content": "Hello"}]));

    let (_, convs) = h
        .json(Method::GET, &format!("/api/conversations?profileId={pid}"), None)
        .await;
    assert_eq!(convs.as_array().map(Vec::len), Some(1));
    assert_eq!(convs[0]["title"], "Hello");

    let (status, thread) = h
        .json(Method::GET, &format!("/api/conversations/{conv_id}/messages"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let messages = thread["messages"].as_array().expect("messages");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "Hi there");
}

#[tokio::test]
async fn streaming_chat_over_http() {
    let server = MockServer::start().await;
    let frames = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
        ": keep-alive\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: [DONE]\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(frames),
        )
        .mount(&server)
        .await;
    let h = harness();
    let pid = h.add_profile(&server.uri(), json!({"model": "gpt-test", "stream": true})).await;

    let req = Request::builder()
        .method(Method::POST)
        .uri("/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"profileId": pid, "messages": [{"role": "user", "content": "Hello"}]})
                .to_string(),
        ))
        .expect("request");
    let (status, headers, body) = h.send(req).await;
    assert_eq!(status, StatusCode::OK);
    let content_type = headers[header::CONTENT_TYPE].to_str().expect("content type");
    assert!(content_type.starts_with("text/event-stream"));
    assert_eq!(headers[header::CACHE_CONTROL], "no-cache, no-transform");

    let events = sse_events(&body);
    let names: Vec<&str> = events.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["meta", "chunk", "chunk", "done"]);
    assert_eq!(events[0].1["model"], "gpt-test");
    assert_eq!(events[1].1, json!({"content": "Hel"}));
    assert_eq!(events[2].1, json!({"content": "lo"}));
    let conv_id = events[3].1["conversationId"].as_i64().expect("conversation id");
    assert_eq!(events[0].1["conversationId"], conv_id);

    let (_, thread) = h
        .json(Method::GET, &format!("/api/conversations/{conv_id}/messages"), None)
        .await;
    assert_eq!(thread["messages"][1]["content"], "Hello");
}

#[tokio::test]
async fn rejected_requests_write_nothing() {
    let h = harness();
    let pid = h.add_profile("http://127.0.0.1:9", json!({"model": "m"})).await;

    let (status, body) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(json!({"profileId": pid + 100, "messages": [{"role": "user", "content": "x"}]})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(json!({"profileId": pid, "messages": []})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(json!({"profileId": pid, "messages": [{"role": "user", "content": "x"}], "params": {"top_p": 3}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .expect("request");
    let (status, _, _) = h.send(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, convs) = h.json(Method::GET, "/api/conversations", None).await;
    assert_eq!(convs, json!([]));
}

#[tokio::test]
async fn upload_then_reference_image() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "a cat"}}]
        })))
        .mount(&server)
        .await;
    let h = harness();
    let pid = h.add_profile(&server.uri(), json!({"model": "vision"})).await;

    let mut form = Vec::new();
    form.extend_from_slice(
        b"--XBOUNDARY\r\nContent-Disposition: form-data; name=\"file\"; filename=\"cat pic.png\"\r\nContent-Type: image/png\r\n\r\n",
    );
    form.extend_from_slice(&[0x89, b'P', b'N', b'G']);
    form.extend_from_slice(b"\r\n--XBOUNDARY--\r\n");
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/upload")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=XBOUNDARY")
        .body(Body::from(form))
        .expect("request");
    let (status, _, body) = h.send(req).await;
    assert_eq!(status, StatusCode::OK);
    let uploaded: Value = serde_json::from_slice(&body).expect("upload json");
    assert!(uploaded["filename"].as_str().expect("filename").ends_with("-cat_pic.png"));
    assert_eq!(uploaded["mimetype"], "image/png");
    assert_eq!(uploaded["size"], 4);

    let (status, _) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(json!({
                "profileId": pid,
                "messages": [{
                    "role": "user",
                    "content": "what is this?",
                    "parts": [{"type": "image_path", "path": uploaded["path"], "mimetype": "image/png"}],
                }],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let sent = upstream_bodies(&server).await;
    let content = &sent[0]["messages"][0]["content"];
    assert_eq!(content[0], json!({"type": "text", "text": "what is this?"}));
    assert_eq!(content[1]["image_url"]["url"], "data:image/png;base64,iVBORw==");
}

#[tokio::test]
async fn missing_image_is_skipped_not_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "text only"}}]
        })))
        .mount(&server)
        .await;
    let h = harness();
    let pid = h.add_profile(&server.uri(), json!({"model": "vision"})).await;

    let (status, _) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(json!({
                "profileId": pid,
                "messages": [{
                    "role": "user",
                    "parts": [
                        {"type": "text", "text": "describe"},
                        {"type": "image_path", "path": "/definitely/not/here.png"},
                    ],
                }],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let sent = upstream_bodies(&server).await;
    assert_eq!(
        sent[0]["messages"][0]["content"],
        json!([{"type": "text", "text": "describe"}])
    );
}

#[tokio::test]
async fn upload_without_file_field_is_rejected() {
    let h = harness();
    let form = b"--B\r\nContent-Disposition: form-data; name=\"other\"\r\n\r\nvalue\r\n--B--\r\n".to_vec();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/upload")
        .header(header::CONTENT_TYPE, "multipart/form-data; boundary=B")
        .body(Body::from(form))
        .expect("request");
    let (status, _, _) = h.send(req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn message_and_conversation_management() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "reply"}}]
        })))
        .mount(&server)
        .await;
    let h = harness();
    let pid = h.add_profile(&server.uri(), json!({"model": "m"})).await;
    let (_, reply) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(json!({"profileId": pid, "messages": [{"role": "user", "content": "first"}]})),
        )
        .await;
    let conv_id = reply["conversationId"].as_i64().expect("conversation id");
    let (_, thread) = h
        .json(Method::GET, &format!("/api/conversations/{conv_id}/messages"), None)
        .await;
    let assistant_id = thread["messages"][1]["id"].as_i64().expect("message id");

    let (status, _) = h
        .json(
            Method::PUT,
            &format!("/api/messages/{assistant_id}"),
            Some(json!({"content": "edited", "role": "not-a-role"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, thread) = h
        .json(Method::GET, &format!("/api/conversations/{conv_id}/messages"), None)
        .await;
    assert_eq!(thread["messages"][1]["content"], "edited");
    assert_eq!(thread["messages"][1]["role"], "assistant");

    let (status, _) = h
        .json(Method::PUT, "/api/messages/99999", Some(json!({"content": "x"})))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = h
        .json(Method::DELETE, &format!("/api/messages/{assistant_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = h
        .json(
            Method::PATCH,
            &format!("/api/conversations/{conv_id}"),
            Some(json!({"title": "  "})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = h
        .json(
            Method::PATCH,
            &format!("/api/conversations/{conv_id}"),
            Some(json!({"title": "Renamed"})),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, thread) = h
        .json(Method::GET, &format!("/api/conversations/{conv_id}/messages"), None)
        .await;
    assert_eq!(thread["conversation"]["title"], "Renamed");
    assert_eq!(thread["messages"].as_array().map(Vec::len), Some(1));

    let (status, _) = h
        .json(Method::DELETE, &format!("/api/conversations/{conv_id}"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = h
        .json(Method::GET, &format!("/api/conversations/{conv_id}/messages"), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn models_endpoint_passes_entries_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "models": [{"name": "llama3"}]
        })))
        .mount(&server)
        .await;
    let h = harness();
    let pid = h.add_profile(&server.uri(), json!({})).await;

    let (status, models) = h
        .json(Method::GET, &format!("/api/profiles/{pid}/models"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(models, json!([{"name": "llama3"}]));

    let (status, _) = h.json(Method::GET, "/api/profiles/4242/models", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn follow_up_turns_are_never_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "Hi there"}}]
        })))
        .mount(&server)
        .await;
    let h = harness();
    let pid = h.add_profile(&server.uri(), json!({"model": "gpt-test"})).await;

    let chat = |conversation: Option<i64>, messages: Value| {
        json!({
            "profileId": pid,
            "conversationId": conversation,
            "messages": messages,
            "params": {"stream": false},
        })
    };
    let (status, reply) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(chat(None, json!([{"role": "user", "content": "Hello"}]))),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{reply}");
    let conv_id = reply["conversationId"].as_i64().expect("conversation id");

    let full_replay = json!([
        {"role": "user", "content": "Hello"},
        {"role": "assistant", "content": "Hi there"},
        {"role": "user", "content": "Again"},
    ]);
    let (status, _) = h
        .json(Method::POST, "/api/chat", Some(chat(Some(conv_id), full_replay)))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = h
        .json(
            Method::POST,
            "/api/chat",
            Some(chat(Some(conv_id), json!([{"role": "user", "content": "Hello"}]))),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, thread) = h
        .json(Method::GET, &format!("/api/conversations/{conv_id}/messages"), None)
        .await;
    let turns: Vec<(String, String)> = thread["messages"]
        .as_array()
        .expect("messages")
        .iter()
        .map(|m| {
            (
                m["role"].as_str().unwrap_or_default().to_string(),
                m["content"].as_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let expected = [
        ("user", "Hello"),
        ("assistant", "Hi there"),
        ("user", "Again"),
        ("assistant", "Hi there"),
        ("user", "Hello"),
        ("assistant", "Hi there"),
    ];
    assert_eq!(
        turns,
        expected
            .iter()
            .map(|(r, c)| (r.to_string(), c.to_string()))
            .collect::<Vec<_>>()
    );
}
