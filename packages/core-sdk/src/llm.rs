use reqwest::header::AUTHORIZATION;
use reqwest::Client;
use serde_json::Value;

use crate::endpoint::models_url;
use crate::error::ChatError;
use crate::models::Profile;

/**
 * \brief Lists the models the profile's upstream offers.
 * \details Entries are passed through as the upstream sent them.
 */
pub async fn list_models(client: &Client, profile: &Profile) -> Result<Vec<Value>, ChatError> {
    let url = models_url(&profile.api_base_url);
    let resp = client
        .get(&url)
        .header(AUTHORIZATION, format!("Bearer {}", profile.api_key))
        .send()
        .await
        .map_err(|e| ChatError::Transport {
            message: e.to_string(),
            debug: None,
        })?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        tracing::warn!(%url, %status, "list models failed");
        return Err(ChatError::Upstream {
            status,
            body,
            debug: None,
        });
    }
    let payload = match resp.json::<Value>().await {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(%url, error = %e, "models payload is not JSON");
            Value::Null
        }
    };
    let models = parse_model_list(payload);
    tracing::debug!(%url, count = models.len(), "models listed");
    Ok(models)
}

/**
 * \brief Accepts a bare array, `{data: [...]}` or `{models: [...]}`; anything
 *        else is an empty list.
 */
pub fn parse_model_list(payload: Value) -> Vec<Value> {
    match payload {
        Value::Array(items) => items,
        Value::Object(mut obj) => ["data", "models"]
            .iter()
            .find_map(|key| match obj.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
