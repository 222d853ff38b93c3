use super::{ApiError, AppState};
use crate::llm::{ChatMessage, ChatRequest, LlmError, Provider};
use crate::relay::{self, RelayEvent};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::convert::Infallible;
use tracing::{error, info, instrument};

#[derive(Debug, Serialize)]
pub struct ProfileInfo {
    pub profile: &'static str,
    pub model: String,
}

/// Accept `{messages: [{role, content}], systemPrompt?}`; anything else is a
/// validation failure.
pub fn parse_chat_request(body: &[u8]) -> Result<ChatRequest, ApiError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| ApiError::Validation)?;
    let messages = value
        .get("messages")
        .filter(|m| m.is_array())
        .cloned()
        .ok_or(ApiError::Validation)?;
    let messages: Vec<ChatMessage> =
        serde_json::from_value(messages).map_err(|_| ApiError::Validation)?;
    let system_prompt = value
        .get("systemPrompt")
        .and_then(Value::as_str)
        .map(str::to_owned);

    Ok(ChatRequest {
        messages,
        system_prompt,
    })
}

fn to_sse_event(event: &RelayEvent) -> Result<Event, Infallible> {
    Ok(Event::default().data(event.payload()))
}

/// `POST /api/chat`: forward one turn upstream and re-stream the reply.
#[instrument(skip_all)]
pub async fn relay_chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request = parse_chat_request(&body)?;
    let provider = Provider::select(&state.config).map_err(|_| ApiError::Configuration)?;
    let messages = relay::upstream_messages(request, &state.config.default_system_prompt);

    info!(
        profile = provider.kind(),
        model = %provider.profile().model,
        messages = messages.len(),
        "Relaying chat request"
    );

    let upstream = provider
        .chat_stream(&state.http, &messages)
        .await
        .map_err(|err| match err {
            LlmError::Api { status, message } => {
                error!(
                    profile = provider.profile().name.as_str(),
                    status,
                    body = %message,
                    "Upstream API error"
                );
                ApiError::Upstream { status }
            }
            other => {
                error!(error = %other, "Upstream request failed");
                ApiError::Internal
            }
        })?;

    let events = relay::relay_events(provider, upstream.bytes_stream())
        .map(|event| to_sse_event(&event));

    let headers = [
        (header::CACHE_CONTROL, "no-cache, no-transform"),
        (header::CONNECTION, "keep-alive"),
    ];
    let keep_alive = KeepAlive::new()
        .interval(state.config.keep_alive)
        .text("keep-alive");
    Ok((headers, Sse::new(events).keep_alive(keep_alive)).into_response())
}

/// `GET /api/profile`: which upstream a chat request would use right now.
pub async fn active_profile(State(state): State<AppState>) -> Result<Json<ProfileInfo>, ApiError> {
    let provider = Provider::select(&state.config).map_err(|_| ApiError::Configuration)?;
    Ok(Json(ProfileInfo {
        profile: provider.kind(),
        model: provider.profile().model.clone(),
    }))
}
