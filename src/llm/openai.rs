use super::{ChatMessage, LlmError};
use crate::config::ProfileConfig;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
}

pub fn endpoint(config: &ProfileConfig) -> String {
    format!("{}/chat/completions", config.base_url.trim_end_matches('/'))
}

/// Open a streaming chat completion.
///
/// A non-success status is turned into `LlmError::Api` carrying the raw
/// upstream body; callers decide what, if anything, to forward.
pub async fn chat_stream(
    client: &Client,
    config: &ProfileConfig,
    messages: &[ChatMessage],
) -> Result<reqwest::Response, LlmError> {
    let body = OpenAiRequest {
        model: &config.model,
        messages,
        stream: true,
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    };

    let resp = client
        .post(endpoint(config))
        .header("Content-Type", "application/json")
        .header("Authorization", format!("Bearer {}", config.api_key))
        .json(&body)
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::Api {
            status,
            message: text,
        });
    }

    Ok(resp)
}

/// Empty deltas (role-only or finish chunks) yield `None`.
pub fn extract_delta<'a>(payload: &'a Value, pointer: &str) -> Option<&'a str> {
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
}
