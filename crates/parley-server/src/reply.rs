//! Reply generation for chats with the AI participant.
//!
//! The relay only sees [`ReplyGenerator`]: a function from message text to
//! reply text that never fails. Failures inside a generator are logged and
//! replaced with [`AI_APOLOGY`].

use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use parley_shared::constants::AI_APOLOGY;

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta";

pub trait ReplyGenerator: Send + Sync + 'static {
    /// Produce a reply for `text`. Resolves to the apology text on failure.
    fn generate(&self, text: String) -> BoxFuture<'static, String>;
}

/// Generator used when no backend is configured: always apologises.
#[derive(Debug, Default, Clone, Copy)]
pub struct FallbackReplyGenerator;

impl ReplyGenerator for FallbackReplyGenerator {
    fn generate(&self, _text: String) -> BoxFuture<'static, String> {
        Box::pin(async { AI_APOLOGY.to_string() })
    }
}

#[derive(Debug, Error)]
pub enum ReplyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Backend returned no text")]
    Empty,
}

/// Replies from Google's Gemini `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct GeminiReplyGenerator {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GeminiReplyGenerator {
    pub fn new(api_key: String, model: &str, timeout: Duration) -> Result<Self, ReplyError> {
        Self::with_endpoint(GEMINI_ENDPOINT, api_key, model, timeout)
    }

    pub fn with_endpoint(
        endpoint: &str,
        api_key: String,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ReplyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let url = format!(
            "{}/models/{}:generateContent",
            endpoint.trim_end_matches('/'),
            model
        );
        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    async fn request(
        client: &reqwest::Client,
        url: &str,
        api_key: &str,
        text: &str,
    ) -> Result<String, ReplyError> {
        let body = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text }],
            }],
        };

        let response = client
            .post(url)
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplyError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateResponse = response.json().await?;
        extract_text(parsed).ok_or(ReplyError::Empty)
    }
}

impl ReplyGenerator for GeminiReplyGenerator {
    fn generate(&self, text: String) -> BoxFuture<'static, String> {
        let client = self.client.clone();
        let url = self.url.clone();
        let api_key = self.api_key.clone();

        Box::pin(async move {
            match Self::request(&client, &url, &api_key, &text).await {
                Ok(reply) => {
                    debug!(len = reply.len(), "Generated AI reply");
                    reply
                }
                Err(e) => {
                    warn!(error = %e, "AI reply generation failed");
                    AI_APOLOGY.to_string()
                }
            }
        })
    }
}

/// Concatenated text parts of the first candidate.
fn extract_text(response: GenerateResponse) -> Option<String> {
    let content = response.candidates.into_iter().next()?.content?;
    let text: String = content
        .parts
        .into_iter()
        .filter_map(|part| part.text)
        .collect();
    (!text.trim().is_empty()).then_some(text)
}
