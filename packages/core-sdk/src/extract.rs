use serde_json::Value;

/** \brief Pulls a text fragment out of one decoded payload, if this shape matches. */
pub type Probe = fn(&Value) -> Option<String>;

/**
 * \brief Probes for streamed frames, highest priority first.
 * \details One entry per provider shape.
 */
pub const DELTA_PROBES: &[(&str, Probe)] = &[
    ("choices[0].delta.content", choice_delta_content),
    ("choices[0].text", choice_text),
    ("choices[0].message.content", choice_message_content),
    ("delta.content", top_level_delta_content),
];

/** \brief Probes for complete (non-streamed) responses. */
pub const REPLY_PROBES: &[(&str, Probe)] = &[
    ("choices[0].message.content", choice_message_content),
    ("choices[0].text", choice_text),
    ("choices[0].delta.content", choice_delta_content),
    ("delta.content", top_level_delta_content),
];

/** \brief First non-empty match across `probes`. */
pub fn first_match(probes: &[(&str, Probe)], payload: &Value) -> Option<String> {
    probes
        .iter()
        .filter_map(|(_, probe)| probe(payload))
        .find(|text| !text.is_empty())
}

/** \brief Incremental text carried by one stream frame. */
pub fn extract_delta(payload: &Value) -> Option<String> {
    first_match(DELTA_PROBES, payload)
}

/** \brief Full assistant text of a non-streamed response; empty when nothing matches. */
pub fn extract_reply(payload: &Value) -> String {
    first_match(REPLY_PROBES, payload).unwrap_or_default()
}

/** \brief Top-level `model` tag reported by the upstream, if any. */
pub fn extract_model(payload: &Value) -> Option<String> {
    payload
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

fn first_choice(payload: &Value) -> Option<&Value> {
    payload.get("choices")?.get(0)
}

fn choice_delta_content(payload: &Value) -> Option<String> {
    first_choice(payload)?
        .get("delta")?
        .get("content")?
        .as_str()
        .map(str::to_string)
}

fn choice_text(payload: &Value) -> Option<String> {
    first_choice(payload)?
        .get("text")?
        .as_str()
        .map(str::to_string)
}

fn choice_message_content(payload: &Value) -> Option<String> {
    content_text(first_choice(payload)?.get("message")?.get("content")?)
}

fn top_level_delta_content(payload: &Value) -> Option<String> {
    content_text(payload.get("delta")?.get("content")?)
}

/** \brief A content field is either a plain string or a list of blocks with `text`. */
fn content_text(content: &Value) -> Option<String> {
    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => Some(
            blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect::<String>(),
        ),
        _ => None,
    }
}
