use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;

/** \brief Completion path suffixes, tried in this order. */
pub const COMPLETION_PATHS: &[&str] = &["/chat/completions", "/completions"];

const DEFAULT_VERSION: &str = "/v1";

/**
 * \brief Canonical API root: trailing slashes stripped, `/v1` appended unless
 *        the URL already ends in a version segment (`/v2`, `/openai/v1`, ...).
 */
pub fn api_root(raw_base: &str) -> String {
    let trimmed = raw_base.trim().trim_end_matches('/');
    if ends_with_version(trimmed) {
        trimmed.to_string()
    } else {
        format!("{trimmed}{DEFAULT_VERSION}")
    }
}

fn ends_with_version(base: &str) -> bool {
    let Some((_, last)) = base.rsplit_once('/') else {
        return false;
    };
    match last.strip_prefix('v') {
        Some(digits) => !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

/**
 * \brief Every completion URL to probe, in precedence order.
 */
pub fn completion_candidates(raw_base: &str) -> Vec<String> {
    let root = api_root(raw_base);
    COMPLETION_PATHS
        .iter()
        .map(|suffix| format!("{root}{suffix}"))
        .collect()
}

/**
 * \brief Model-listing URL for a profile base.
 */
pub fn models_url(raw_base: &str) -> String {
    format!("{}/models", api_root(raw_base))
}

/**
 * \brief The candidate that answered and its (unread) response.
 */
#[derive(Debug)]
pub struct Resolved {
    pub url: String,
    pub response: Response,
}

/**
 * \brief A candidate that could not be reached at all.
 */
#[derive(Debug, Error)]
#[error("{url}: {source}")]
pub struct ProbeError {
    pub url: String,
    #[source]
    pub source: reqwest::Error,
}

/**
 * \brief POSTs `body` to each completion candidate of `raw_base` in order and
 *        keeps the first response that is not a 404.
 * \details When every candidate 404s, the last 404 response is returned as is.
 *          A transport error stops the probe immediately. Candidates are never
 *          raced; order defines precedence.
 */
pub async fn post_first_live(
    client: &Client,
    raw_base: &str,
    api_key: &str,
    body: &Value,
    event_stream: bool,
) -> Result<Resolved, ProbeError> {
    let candidates = completion_candidates(raw_base);
    let last_index = candidates.len() - 1;
    for (index, url) in candidates.into_iter().enumerate() {
        let mut request = client
            .post(url.as_str())
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {api_key}"))
            .json(body);
        if event_stream {
            request = request.header(ACCEPT, "text/event-stream");
        }
        let response = match request.send().await {
            Ok(response) => response,
            Err(source) => return Err(ProbeError { url, source }),
        };
        if response.status() == StatusCode::NOT_FOUND && index < last_index {
            tracing::debug!(%url, "completion endpoint 404, trying next candidate");
            continue;
        }
        tracing::debug!(%url, status = %response.status(), "completion endpoint resolved");
        return Ok(Resolved { url, response });
    }
    unreachable!("COMPLETION_PATHS is never empty");
}
