use std::fmt::Display;

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc::Sender;

use crate::error::ChatError;
use crate::extract::{extract_delta, extract_model};
use crate::sse::{Frame, FrameBuffer, SseBlock};

/**
 * \brief Lifecycle of one upstream streaming call.
 * \details `Opening -> Relaying -> Draining -> Closed`; `Errored` is absorbing
 *          and reachable from `Opening` or `Relaying`.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Opening,
    Relaying,
    Draining,
    Closed,
    Errored,
}

/**
 * \brief Normalized downstream event.
 * \details `Meta` and `Debug` are control events; callers that do not know
 *          them can ignore them and still rebuild the reply from `Chunk`s.
 */
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Meta { conversation_id: i64, model: String },
    Debug(Value),
    /** \brief One delta, never the accumulated text. */
    Chunk(String),
    Error(Value),
    Done { conversation_id: i64 },
}

impl RelayEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RelayEvent::Meta { .. } => "meta",
            RelayEvent::Debug(_) => "debug",
            RelayEvent::Chunk(_) => "chunk",
            RelayEvent::Error(_) => "error",
            RelayEvent::Done { .. } => "done",
        }
    }

    pub fn data(&self) -> Value {
        match self {
            RelayEvent::Meta {
                conversation_id,
                model,
            } => json!({"conversationId": conversation_id, "model": model}),
            RelayEvent::Debug(v) | RelayEvent::Error(v) => v.clone(),
            RelayEvent::Chunk(content) => json!({ "content": content }),
            RelayEvent::Done { conversation_id } => json!({ "conversationId": conversation_id }),
        }
    }
}

/**
 * \brief Reassembles an upstream event stream, forwards deltas in order and
 *        accumulates the full reply.
 */
pub struct StreamRelay {
    sink: Sender<RelayEvent>,
    debug: bool,
    state: RelayState,
    frames: FrameBuffer,
    reply: String,
    upstream_model: Option<String>,
    deltas: usize,
    disconnected: bool,
}

impl StreamRelay {
    /**
     * \brief `sink` should be a small bounded channel: a full channel holds the
     *        relay back, so upstream is read no faster than the caller consumes.
     */
    pub fn new(sink: Sender<RelayEvent>, debug: bool) -> Self {
        Self {
            sink,
            debug,
            state: RelayState::Opening,
            frames: FrameBuffer::new(),
            reply: String::new(),
            upstream_model: None,
            deltas: 0,
            disconnected: false,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn reply(&self) -> &str {
        &self.reply
    }

    pub fn upstream_model(&self) -> Option<&str> {
        self.upstream_model.as_deref()
    }

    pub fn deltas(&self) -> usize {
        self.deltas
    }

    /** \brief True once the caller went away; no further events are sent. */
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    fn mark_disconnected(&mut self) {
        if !self.disconnected {
            tracing::info!(deltas = self.deltas, "downstream disconnected");
            self.disconnected = true;
        }
    }

    async fn emit(&mut self, event: RelayEvent) -> bool {
        if self.disconnected {
            return false;
        }
        if self.sink.send(event).await.is_err() {
            self.mark_disconnected();
        }
        !self.disconnected
    }

    /** \brief Sends the `meta` control event. */
    pub async fn announce(&mut self, conversation_id: i64, model: &str) {
        self.emit(RelayEvent::Meta {
            conversation_id,
            model: model.to_string(),
        })
        .await;
    }

    /** \brief Sends a `debug` event, only when the caller asked for them. */
    pub async fn debug_event(&mut self, payload: Value) {
        if self.debug {
            self.emit(RelayEvent::Debug(payload)).await;
        }
    }

    /**
     * \brief `Opening`/`Relaying` -> `Errored`: relays the error and stops.
     */
    pub async fn fail(&mut self, error: &ChatError) {
        let mut payload = error.body();
        if let ChatError::Upstream { status, .. } = error {
            payload["status"] = json!(status.as_u16());
        }
        if !self.debug {
            if let Some(obj) = payload.as_object_mut() {
                obj.remove("debug");
            }
        }
        self.state = RelayState::Errored;
        self.emit(RelayEvent::Error(payload)).await;
    }

    /**
     * \brief `Opening -> Relaying -> Draining`: reads the upstream body until it
     *        ends, a `[DONE]` sentinel arrives, or the caller goes away.
     * \details A failed read ends relaying like end-of-body does; what was
     *          accumulated so far is kept. A caller that goes away is noticed
     *          even while upstream is idle. The body is dropped on return, which
     *          releases the upstream connection.
     */
    pub async fn pump<S, B, E>(&mut self, body: S)
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        if self.state != RelayState::Opening {
            return;
        }
        self.state = RelayState::Relaying;
        futures_util::pin_mut!(body);

        let mut sentinel = false;
        'read: loop {
            let next = tokio::select! {
                biased;
                next = body.next() => Some(next),
                _ = self.sink.closed() => None,
            };
            let Some(next) = next else {
                self.mark_disconnected();
                break;
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!(error = %err, deltas = self.deltas, "upstream read failed");
                    self.debug_event(json!({"stage": "read_error", "error": err.to_string()}))
                        .await;
                    break;
                }
            };
            for block in self.frames.push(chunk.as_ref()) {
                if !self.dispatch(&block).await {
                    sentinel = true;
                    break 'read;
                }
                if self.disconnected {
                    break 'read;
                }
            }
        }

        self.state = RelayState::Draining;
        if !sentinel && !self.disconnected {
            if let Some(block) = self.frames.finish() {
                self.dispatch(&block).await;
            }
        }
    }

    /* Returns false when the block ends the stream. */
    async fn dispatch(&mut self, block: &SseBlock) -> bool {
        match block.classify() {
            Frame::End => false,
            Frame::Payload(payload) => {
                if self.upstream_model.is_none() {
                    self.upstream_model = extract_model(&payload);
                }
                if let Some(delta) = extract_delta(&payload) {
                    self.reply.push_str(&delta);
                    self.deltas += 1;
                    self.emit(RelayEvent::Chunk(delta)).await;
                }
                true
            }
            Frame::Malformed { error, raw } => {
                tracing::debug!(event = %block.event, %error, "skipping undecodable frame");
                self.debug_event(json!({"stage": "frame_error", "error": error, "raw": raw}))
                    .await;
                true
            }
        }
    }

    /**
     * \brief `Draining -> Closed`: emits the terminal `done`. The reply must
     *        already be stored.
     */
    pub async fn close(&mut self, conversation_id: i64) {
        if self.state != RelayState::Draining {
            return;
        }
        self.state = RelayState::Closed;
        self.emit(RelayEvent::Done { conversation_id }).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use futures_util::stream;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn body(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, Infallible>> {
        let owned: Vec<Result<Vec<u8>, Infallible>> =
            parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(owned)
    }

    fn drain(rx: &mut mpsc::Receiver<RelayEvent>) -> Vec<RelayEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn relays_deltas_in_order_and_accumulates() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut relay = StreamRelay::new(tx, false);
        relay.announce(7, "gpt-4o").await;
        relay
            .pump(body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
                "data: [DONE]\n\n",
            ]))
            .await;
        assert_eq!(relay.state(), RelayState::Draining);
        relay.close(7).await;
        assert_eq!(relay.state(), RelayState::Closed);

        let events = drain(&mut rx);
        assert_eq!(
            events,
            vec![
                RelayEvent::Meta { conversation_id: 7, model: "gpt-4o".into() },
                RelayEvent::Chunk("Hel".into()),
                RelayEvent::Chunk("lo".into()),
                RelayEvent::Done { conversation_id: 7 },
            ]
        );
        assert_eq!(relay.reply(), "Hello");
    }

    #[tokio::test]
    async fn chunk_concatenation_matches_reply_across_split_frames() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut relay = StreamRelay::new(tx, false);
        relay
            .pump(body(&[
                "data: {\"choices\":[{\"del",
                "ta\":{\"content\":\"a\"}}]}\n\ndata: {\"choices\":[{\"text\":\"b\"}]}\n",
                "\ndata: {\"delta\":{\"content\":\"c\"}}",
            ]))
            .await;
        let chunks: String = drain(&mut rx)
            .into_iter()
            .filter_map(|ev| match ev {
                RelayEvent::Chunk(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, "abc");
        assert_eq!(relay.reply(), chunks);
    }

    #[tokio::test]
    async fn malformed_and_heartbeat_frames_do_not_abort() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut relay = StreamRelay::new(tx, true);
        relay
            .pump(body(&[
                "data: {broken\n\n",
                ": ping\n\n",
                "data: {\"choices\":[{\"delta\":{}}]}\n\n",
                "data: {\"model\":\"m-1\",\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
            ]))
            .await;
        assert_eq!(relay.reply(), "ok");
        assert_eq!(relay.upstream_model(), Some("m-1"));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "debug");
        assert_eq!(events[0].data()["stage"], "frame_error");
        assert_eq!(events[1], RelayEvent::Chunk("ok".into()));
    }

    #[tokio::test]
    async fn frame_errors_are_silent_without_debug() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut relay = StreamRelay::new(tx, false);
        relay.pump(body(&["data: nope\n\n"])).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn nothing_after_done_sentinel_is_relayed() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut relay = StreamRelay::new(tx, false);
        relay
            .pump(body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n\n",
            ]))
            .await;
        assert_eq!(relay.reply(), "x");
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn read_error_keeps_partial_reply() {
        let (tx, _rx) = mpsc::channel(64);
        let mut relay = StreamRelay::new(tx, false);
        let parts: Vec<Result<Vec<u8>, String>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"part\"}}]}\n\n".to_vec()),
            Err("connection reset".to_string()),
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"never\"}}]}\n\n".to_vec()),
        ];
        relay.pump(stream::iter(parts)).await;
        assert_eq!(relay.reply(), "part");
        assert_eq!(relay.state(), RelayState::Draining);
    }

    #[tokio::test]
    async fn disconnect_stops_reading_but_keeps_what_arrived() {
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let mut relay = StreamRelay::new(tx, false);
        relay
            .pump(body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"first\"}}]}\n\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"second\"}}]}\n\n",
            ]))
            .await;
        assert!(relay.is_disconnected());
        assert_eq!(relay.reply(), "first");
    }

    #[tokio::test]
    async fn opening_failure_relays_error_with_status() {
        let (tx, mut rx) = mpsc::channel(64);
        let mut relay = StreamRelay::new(tx, false);
        relay
            .fail(&ChatError::Upstream {
                status: StatusCode::UNAUTHORIZED,
                body: "bad key".into(),
                debug: Some(json!({"url": "u"})),
            })
            .await;
        assert_eq!(relay.state(), RelayState::Errored);
        relay.close(1).await;
        assert_eq!(relay.state(), RelayState::Errored);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data(), json!({"error": "bad key", "status": 401}));
    }

    #[tokio::test]
    async fn slow_caller_holds_back_upstream_reads() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = pulled.clone();
        let frames: Vec<Result<Vec<u8>, Infallible>> = (0..1000)
            .map(|i| {
                let frame = json!({"choices": [{"delta": {"content": i.to_string()}}]});
                Ok(format!("data: {frame}\n\n").into_bytes())
            })
            .collect();
        let upstream = stream::iter(frames).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (tx, mut rx) = mpsc::channel(1);
        let mut relay = StreamRelay::new(tx, false);
        let task = tokio::spawn(async move {
            relay.pump(upstream).await;
            relay
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(pulled.load(Ordering::SeqCst) <= 2, "read ahead of the caller");

        assert_eq!(rx.recv().await, Some(RelayEvent::Chunk("0".into())));
        drop(rx);
        let relay = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("relay stops once the caller is gone")
            .expect("join");
        assert!(relay.is_disconnected());
        assert!(pulled.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn disconnect_is_noticed_while_upstream_is_idle() {
        let upstream = stream::iter(vec![Ok::<_, Infallible>(b": ping\n\n".to_vec())])
            .chain(stream::pending());
        let (tx, rx) = mpsc::channel(1);
        let mut relay = StreamRelay::new(tx, false);
        let task = tokio::spawn(async move {
            relay.pump(upstream).await;
            relay
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(rx);

        let relay = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("pump returns after the caller left")
            .expect("join");
        assert!(relay.is_disconnected());
        assert_eq!(relay.state(), RelayState::Draining);
        assert_eq!(relay.reply(), "");
    }
}
