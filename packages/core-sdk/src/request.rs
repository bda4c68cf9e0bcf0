use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::models::GenerationSettings;

/** \brief Body keys no inclusion toggle can remove. */
pub const PINNED_KEYS: &[&str] = &["model", "messages"];

/**
 * \brief Model precedence: explicit override, then merged params/profile default.
 */
pub fn effective_model(model_override: Option<&str>, merged: &GenerationSettings) -> Option<String> {
    model_override
        .or(merged.model.as_deref())
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
}

/**
 * \brief Builds the upstream body from the merged settings.
 * \details Absent parameters are omitted, then `include_settings` toggles set to
 *          `false` strip their keys. Request-only knobs (`system_prompt`,
 *          `debug`, `include_settings`) never reach the upstream.
 */
pub fn build_upstream_body(model: &str, messages: Vec<Value>, merged: &GenerationSettings) -> Value {
    let mut body = Map::new();
    body.insert("model".into(), Value::from(model));
    body.insert("messages".into(), Value::Array(messages));

    let optional = [
        ("max_context", merged.max_context.map(Value::from)),
        ("max_tokens", merged.max_output_tokens.map(Value::from)),
        ("temperature", merged.temperature.map(Value::from)),
        ("top_p", merged.top_p.map(Value::from)),
        ("top_k", merged.top_k.map(Value::from)),
        ("frequency_penalty", merged.frequency_penalty.map(Value::from)),
        ("presence_penalty", merged.presence_penalty.map(Value::from)),
        ("stream", merged.stream.map(Value::from)),
    ];
    for (key, value) in optional {
        if let Some(value) = value {
            body.insert(key.to_string(), value);
        }
    }

    apply_inclusion_toggles(&mut body, merged.include_settings.as_ref());
    Value::Object(body)
}

/**
 * \brief Drops every key whose toggle is explicitly `false`; absent means include.
 */
pub fn apply_inclusion_toggles(body: &mut Map<String, Value>, include: Option<&BTreeMap<String, bool>>) {
    let Some(include) = include else {
        return;
    };
    body.retain(|key, _| PINNED_KEYS.contains(&key.as_str()) || include.get(key) != Some(&false));
}

/**
 * \brief Whether the final body asks the upstream for an event stream.
 */
pub fn wants_stream(body: &Value) -> bool {
    body.get("stream").and_then(Value::as_bool).unwrap_or(false)
}
