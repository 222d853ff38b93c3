pub mod openai;

use crate::config::{ProfileConfig, RelayConfig};
use reqwest::Client;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Body of one turn sent from the client to the relay.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(
        rename = "systemPrompt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub system_prompt: Option<String>,
}

/// Upstream profile selected once per relayed request.
#[derive(Debug, Clone)]
pub enum Provider {
    Primary(ProfileConfig),
    Fallback(ProfileConfig),
}

impl Provider {
    /// Prefer the primary profile whenever its credential is configured.
    pub fn select(config: &RelayConfig) -> Result<Self, LlmError> {
        if let Some(primary) = config.primary.as_ref().filter(|p| p.has_credentials()) {
            return Ok(Provider::Primary(primary.clone()));
        }
        if let Some(fallback) = config.fallback.as_ref().filter(|p| p.has_credentials()) {
            return Ok(Provider::Fallback(fallback.clone()));
        }
        Err(LlmError::MissingCredentials)
    }

    pub fn profile(&self) -> &ProfileConfig {
        match self {
            Provider::Primary(profile) | Provider::Fallback(profile) => profile,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Provider::Primary(_) => "primary",
            Provider::Fallback(_) => "fallback",
        }
    }

    pub async fn chat_stream(
        &self,
        client: &Client,
        messages: &[ChatMessage],
    ) -> Result<reqwest::Response, LlmError> {
        openai::chat_stream(client, self.profile(), messages).await
    }

    /// Pull the incremental text out of one parsed stream payload.
    pub fn extract_delta<'a>(&self, payload: &'a serde_json::Value) -> Option<&'a str> {
        openai::extract_delta(payload, &self.profile().delta_pointer)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("API key not configured")]
    MissingCredentials,
}
