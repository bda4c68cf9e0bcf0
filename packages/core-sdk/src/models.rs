use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/** \brief Longest title derived from the first user turn, in characters. */
pub const TITLE_MAX_CHARS: usize = 80;

/** \brief Title used when the first user turn has no text. */
pub const DEFAULT_TITLE: &str = "New Chat";

/**
 * \brief Message author, aligned with the OpenAI Chat message roles.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Role> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/**
 * \brief Generation parameters. Used both as a profile's stored defaults and as
 *        the per-request `params` bag; request values overlay profile values.
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    /** \brief Default model tag (profile) or model hint (request). */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /** \brief Upstream body key -> include flag. An explicit `false` drops the key. */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_settings: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

impl GenerationSettings {
    /**
     * \brief Returns a copy where every value present in `over` replaces ours.
     * \details `include_settings` is replaced wholesale, not merged key by key.
     */
    pub fn overlay(&self, over: &GenerationSettings) -> GenerationSettings {
        GenerationSettings {
            model: over.model.clone().or_else(|| self.model.clone()),
            max_context: over.max_context.or(self.max_context),
            max_output_tokens: over.max_output_tokens.or(self.max_output_tokens),
            temperature: over.temperature.or(self.temperature),
            top_p: over.top_p.or(self.top_p),
            top_k: over.top_k.or(self.top_k),
            frequency_penalty: over.frequency_penalty.or(self.frequency_penalty),
            presence_penalty: over.presence_penalty.or(self.presence_penalty),
            stream: over.stream.or(self.stream),
            include_settings: over
                .include_settings
                .clone()
                .or_else(|| self.include_settings.clone()),
            system_prompt: over
                .system_prompt
                .clone()
                .or_else(|| self.system_prompt.clone()),
            debug: over.debug.or(self.debug),
        }
    }

    /**
     * \brief Range checks shared by profile settings and request params.
     */
    pub fn validate(&self) -> Result<(), String> {
        fn positive(name: &str, value: Option<i64>, min: i64) -> Result<(), String> {
            match value {
                Some(v) if v < min => Err(format!("{name} must be >= {min}, got {v}")),
                _ => Ok(()),
            }
        }
        fn within(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<(), String> {
            match value {
                Some(v) if !(min..=max).contains(&v) => {
                    Err(format!("{name} must be between {min} and {max}, got {v}"))
                }
                _ => Ok(()),
            }
        }

        positive("max_context", self.max_context, 1)?;
        positive("max_output_tokens", self.max_output_tokens, 1)?;
        positive("top_k", self.top_k, 1)?;
        within("temperature", self.temperature, 0.0, 2.0)?;
        within("top_p", self.top_p, 0.0, 1.0)?;
        within("frequency_penalty", self.frequency_penalty, -2.0, 2.0)?;
        within("presence_penalty", self.presence_penalty, -2.0, 2.0)?;
        if matches!(self.model.as_deref(), Some(m) if m.trim().is_empty()) {
            return Err("model must not be empty".to_string());
        }
        Ok(())
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.unwrap_or(false)
    }
}

/**
 * \brief Saved upstream endpoint configuration.
 */
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    pub id: i64,
    pub name: String,
    pub api_base_url: String,
    /** \brief Bearer key. Never serialized back to callers. */
    #[serde(skip_serializing)]
    pub api_key: String,
    pub settings: GenerationSettings,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief Input for creating a profile.
 */
#[derive(Debug, Clone, Deserialize)]
pub struct NewProfile {
    pub name: String,
    pub api_base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub settings: GenerationSettings,
}

/**
 * \brief Partial profile update; absent fields keep their stored value.
 */
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub api_base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub settings: Option<GenerationSettings>,
}

/**
 * \brief A titled, ordered thread of messages owned by one profile.
 */
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub profile_id: i64,
    pub title: Option<String>,
    pub model: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/**
 * \brief Persisted message row.
 */
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub token_count: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/**
 * \brief One typed piece of an input message.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: ImageUrl,
    },
    /** \brief Local file (usually an upload) inlined as a data URL. */
    ImagePath {
        path: String,
        #[serde(default)]
        mimetype: Option<String>,
    },
}

/**
 * \brief Caller-supplied chat message.
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub parts: Vec<ContentPart>,
}

impl InputMessage {
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(content.into()),
            parts: Vec::new(),
        }
    }

    /**
     * \brief Text that gets persisted: inline content followed by text parts.
     *        Image parts are dropped.
     */
    pub fn flattened_text(&self) -> String {
        let inline = self.content.as_deref().into_iter();
        let parts = self.parts.iter().filter_map(|p| match p {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        });
        inline
            .chain(parts)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/**
 * \brief Normalized chat submission.
 */
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub profile_id: i64,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<InputMessage>,
    #[serde(default)]
    pub params: GenerationSettings,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<(), String> {
        if self.messages.is_empty() {
            return Err("messages must contain at least one entry".to_string());
        }
        if matches!(self.model.as_deref(), Some(m) if m.trim().is_empty()) {
            return Err("model must not be empty".to_string());
        }
        self.params.validate()
    }
}

/**
 * \brief Title for a new conversation, derived from its first user turn.
 */
pub fn conversation_title(first_user_text: &str) -> String {
    let trimmed = first_user_text.trim();
    if trimmed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    trimmed.chars().take(TITLE_MAX_CHARS).collect()
}
