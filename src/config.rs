use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Q, an AI assistant.";
pub const DEFAULT_DELTA_POINTER: &str = "/choices/0/delta/content";
pub const DEFAULT_BIND: &str = "127.0.0.1:3000";
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 1;

pub const THESYS_BASE_URL: &str = "https://api.thesys.dev/v1/embed";
pub const THESYS_MODEL: &str = "c1/anthropic/claude-sonnet-4/v-20251230";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const GROQ_MODEL: &str = "llama-3.3-70b-versatile";

/// Everything needed to talk to one OpenAI-compatible upstream.
#[derive(Clone)]
pub struct ProfileConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// JSON pointer to the incremental text inside one streamed payload.
    pub delta_pointer: String,
}

impl ProfileConfig {
    pub fn thesys(api_key: impl Into<String>) -> Self {
        Self {
            name: "thesys".to_string(),
            base_url: THESYS_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: THESYS_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            delta_pointer: DEFAULT_DELTA_POINTER.to_string(),
        }
    }

    pub fn groq(api_key: impl Into<String>) -> Self {
        Self {
            name: "groq".to_string(),
            base_url: GROQ_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: GROQ_MODEL.to_string(),
            temperature: 0.7,
            max_tokens: 4096,
            delta_pointer: DEFAULT_DELTA_POINTER.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// An empty or whitespace-only key counts as not configured.
    pub fn has_credentials(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl fmt::Debug for ProfileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_secret(&self.api_key))
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("delta_pointer", &self.delta_pointer)
            .finish()
    }
}

/// Mask a credential for display: keys longer than 8 characters keep their
/// first and last four, anything shorter is hidden entirely.
pub fn mask_secret(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else if chars.is_empty() {
        String::new()
    } else {
        "***".to_string()
    }
}

/// Server-side settings for the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind: SocketAddr,
    pub primary: Option<ProfileConfig>,
    pub fallback: Option<ProfileConfig>,
    /// Used when an inbound request carries no system prompt of its own.
    pub default_system_prompt: String,
    /// Idle interval between keep-alive comments on a relayed stream. A
    /// client that went away is only noticed on a write, so this bounds how
    /// long a silent upstream request outlives it.
    pub keep_alive: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            primary: None,
            fallback: None,
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            keep_alive: Duration::from_secs(DEFAULT_KEEP_ALIVE_SECS),
        }
    }
}

impl RelayConfig {
    /// Build the usual Thesys-then-Groq pair from whichever keys are present.
    pub fn from_keys(thesys_key: Option<String>, groq_key: Option<String>) -> Self {
        Self {
            primary: thesys_key.map(ProfileConfig::thesys),
            fallback: groq_key.map(ProfileConfig::groq),
            ..Self::default()
        }
    }
}

/// Client-side settings for the stream consumer and the local store.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub database_path: PathBuf,
    pub system_prompt: Option<String>,
}
