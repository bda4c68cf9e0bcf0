use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::{ContentPart, InputMessage, Role};

const DEFAULT_IMAGE_MIME: &str = "image/png";

/**
 * \brief A part left out of the upstream payload because it could not be rendered.
 */
#[derive(Debug, Clone, Serialize)]
pub struct SkippedPart {
    pub message_index: usize,
    pub path: String,
    pub error: String,
}

/**
 * \brief Upstream message array plus the parts that degraded away.
 */
#[derive(Debug, Clone, Default)]
pub struct Transcoded {
    pub messages: Vec<Value>,
    pub skipped: Vec<SkippedPart>,
}

/**
 * \brief Converts caller messages into the OpenAI Chat wire shape.
 * \details A `system_prompt` is prepended unless the first message already is a
 *          system message. Unreadable `image_path` parts are dropped from their
 *          message; the rest of the message still goes out.
 */
pub async fn transcode_messages(messages: &[InputMessage], system_prompt: Option<&str>) -> Transcoded {
    let mut out = Transcoded::default();

    let prompt = system_prompt.map(str::trim).filter(|p| !p.is_empty());
    let starts_with_system = messages.first().map(|m| m.role == Role::System).unwrap_or(false);
    if let Some(prompt) = prompt {
        if !starts_with_system {
            out.messages
                .push(json!({"role": Role::System.as_str(), "content": prompt}));
        }
    }

    for (index, message) in messages.iter().enumerate() {
        if message.parts.is_empty() {
            out.messages.push(json!({
                "role": message.role.as_str(),
                "content": message.content.as_deref().unwrap_or(""),
            }));
            continue;
        }

        let mut blocks = Vec::with_capacity(message.parts.len() + 1);
        if let Some(text) = message.content.as_deref().filter(|t| !t.is_empty()) {
            blocks.push(json!({"type": "text", "text": text}));
        }
        for part in &message.parts {
            match render_part(part).await {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    let path = match part {
                        ContentPart::ImagePath { path, .. } => path.clone(),
                        _ => String::new(),
                    };
                    tracing::warn!(message_index = index, %path, error = %err, "image part skipped");
                    out.skipped.push(SkippedPart {
                        message_index: index,
                        path,
                        error: format!("{err:#}"),
                    });
                }
            }
        }
        out.messages
            .push(json!({"role": message.role.as_str(), "content": blocks}));
    }

    out
}

async fn render_part(part: &ContentPart) -> Result<Value> {
    match part {
        ContentPart::Text { text } => Ok(json!({"type": "text", "text": text})),
        ContentPart::ImageUrl { image_url } => {
            Ok(json!({"type": "image_url", "image_url": {"url": image_url.url}}))
        }
        ContentPart::ImagePath { path, mimetype } => {
            let url = image_data_url(path, mimetype.as_deref()).await?;
            Ok(json!({"type": "image_url", "image_url": {"url": url}}))
        }
    }
}

/**
 * \brief Reads a local image and encodes it as a `data:` URL.
 */
pub async fn image_data_url(path: &str, mimetype: Option<&str>) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("read image {path}"))?;
    let mime = mimetype.filter(|m| !m.is_empty()).unwrap_or(DEFAULT_IMAGE_MIME);
    Ok(format!("data:{};base64,{}", mime, BASE64.encode(bytes)))
}
