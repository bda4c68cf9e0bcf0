use serde_json::Value;

/** \brief Sentinel some providers send as the last `data:` payload. */
pub const DONE_SENTINEL: &str = "[DONE]";

/**
 * \brief One event block: everything up to a blank line.
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseBlock {
    /** \brief `event:` field, `message` when absent. */
    pub event: String,
    /** \brief All `data:` lines joined by `\n`. */
    pub data: String,
}

/**
 * \brief What one block means to the relay.
 */
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /** \brief Provider end-of-stream marker. */
    End,
    Payload(Value),
    /** \brief Undecodable data; skipped by the relay. */
    Malformed { error: String, raw: String },
}

impl SseBlock {
    pub fn classify(&self) -> Frame {
        let data = self.data.trim();
        if data == DONE_SENTINEL {
            return Frame::End;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(v) => Frame::Payload(v),
            Err(e) => Frame::Malformed {
                error: e.to_string(),
                raw: self.data.clone(),
            },
        }
    }
}

/**
 * \brief Pending-bytes buffer that splits an upstream body into event blocks.
 * \details Bytes may arrive split anywhere, including inside a UTF-8 sequence;
 *          nothing is decoded until a whole block is buffered.
 */
#[derive(Debug, Default)]
pub struct FrameBuffer {
    pending: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /**
     * \brief Appends bytes and returns every block completed by them, in order.
     */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseBlock> {
        self.pending
            .extend(chunk.iter().copied().filter(|b| *b != b'\r'));
        let mut blocks = Vec::new();
        while let Some(pos) = find_double_newline(&self.pending) {
            let raw = self.pending.drain(..pos + 2).collect::<Vec<u8>>();
            if let Some(block) = parse_block(&raw) {
                blocks.push(block);
            }
        }
        blocks
    }

    /**
     * \brief Parses whatever is left once the body is exhausted.
     */
    pub fn finish(&mut self) -> Option<SseBlock> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        parse_block(&raw)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

/* Blocks without any `data:` line (comments, bare `event:`) carry nothing to relay. */
fn parse_block(raw: &[u8]) -> Option<SseBlock> {
    let text = String::from_utf8_lossy(raw);
    let mut event = None;
    let mut data_lines = Vec::new();
    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => event = Some(value.trim().to_string()),
            "data" => data_lines.push(value),
            _ => {}
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseBlock {
        event: event
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "message".to_string()),
        data: data_lines.join("\n"),
    })
}
