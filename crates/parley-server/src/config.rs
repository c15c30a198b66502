//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_CHAT_ID_DIGITS, DEFAULT_HISTORY_LIMIT, DEFAULT_HTTP_PORT, DEFAULT_SEND_QUEUE,
    MAX_CHAT_ID_DIGITS,
};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:3000`
    pub http_addr: SocketAddr,

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// API key for the Gemini reply generator.
    /// Env: `GEMINI_API_KEY`
    /// Default: empty (AI chats answer with a fixed apology).
    pub gemini_api_key: Option<String>,

    /// Gemini model used for replies.
    /// Env: `GEMINI_MODEL`
    /// Default: `gemini-2.0-flash`
    pub gemini_model: String,

    /// HTTP timeout for one reply generation request.
    /// Env: `REPLY_TIMEOUT_SECS`
    /// Default: `30`
    pub reply_timeout: Duration,

    /// Width of the numeric join codes handed out for new chats.
    /// Env: `CHAT_ID_DIGITS` (1..=9)
    /// Default: `5`
    pub chat_id_digits: u32,

    /// Messages returned by a history request without a limit.
    /// Env: `HISTORY_LIMIT`
    /// Default: `50`
    pub history_limit: usize,

    /// Outbound events buffered per connection.
    /// Env: `SEND_QUEUE`
    /// Default: `256`
    pub send_queue: usize,

    /// Take the client address from `X-Forwarded-For` / `X-Real-IP`.
    /// Only enable behind a reverse proxy that sets these headers.
    /// Env: `TRUST_FORWARDED_FOR` (true/false)
    /// Default: `false`
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            admin_token: None,
            gemini_api_key: None,
            gemini_model: "gemini-2.0-flash".to_string(),
            reply_timeout: Duration::from_secs(30),
            chat_id_digits: DEFAULT_CHAT_ID_DIGITS,
            history_limit: DEFAULT_HISTORY_LIMIT,
            send_queue: DEFAULT_SEND_QUEUE,
            trust_forwarded_for: false,
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<set>"))
            .field("gemini_api_key", &self.gemini_api_key.as_ref().map(|_| "<set>"))
            .field("gemini_model", &self.gemini_model)
            .field("reply_timeout", &self.reply_timeout)
            .field("chat_id_digits", &self.chat_id_digits)
            .field("history_limit", &self.history_limit)
            .field("send_queue", &self.send_queue)
            .field("trust_forwarded_for", &self.trust_forwarded_for)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(key) = lookup("GEMINI_API_KEY") {
            if !key.is_empty() {
                config.gemini_api_key = Some(key);
            }
        }

        if let Some(model) = lookup("GEMINI_MODEL") {
            if !model.is_empty() {
                config.gemini_model = model;
            }
        }

        if let Some(secs) = parse_number::<u64>(&lookup, "REPLY_TIMEOUT_SECS") {
            config.reply_timeout = Duration::from_secs(secs.max(1));
        }

        if let Some(digits) = parse_number::<u32>(&lookup, "CHAT_ID_DIGITS") {
            if (1..=MAX_CHAT_ID_DIGITS).contains(&digits) {
                config.chat_id_digits = digits;
            } else {
                tracing::warn!(value = digits, "CHAT_ID_DIGITS out of range, using default");
            }
        }

        if let Some(limit) = parse_number::<usize>(&lookup, "HISTORY_LIMIT") {
            config.history_limit = limit.max(1);
        }

        if let Some(queue) = parse_number::<usize>(&lookup, "SEND_QUEUE") {
            config.send_queue = queue.max(1);
        }

        if let Some(val) = lookup("TRUST_FORWARDED_FOR") {
            config.trust_forwarded_for = val == "true" || val == "1";
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid number, using default");
            None
        }
    }
}
