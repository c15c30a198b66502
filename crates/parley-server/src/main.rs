//! # parley-server
//!
//! Realtime chat relay for Parley.
//!
//! This binary provides:
//! - **WebSocket relay** that binds each connection to an identity, keeps
//!   chat threads in memory and fans messages out to every live participant
//! - **AI participant** answering in chats it is part of, backed by Gemini
//!   when an API key is configured
//! - **Admin API** (axum) for listing identities and chats and managing bans

mod api;
mod config;
mod error;
mod relay;
mod reply;
mod ws;

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parley_store::{ChatStore, SessionRegistry};

use crate::api::AppState;
use crate::config::ServerConfig;
use crate::relay::Relay;
use crate::reply::{FallbackReplyGenerator, GeminiReplyGenerator, ReplyGenerator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parley_server=debug")),
        )
        .init();

    info!("Starting Parley relay server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(
        admin_enabled = config.admin_token.is_some(),
        ai_enabled = config.gemini_api_key.is_some(),
        "Instance settings"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let replies = reply_generator(&config);
    let chats = ChatStore::with_settings(config.chat_id_digits, config.history_limit);
    let relay = Relay::new(SessionRegistry::new(), chats, replies);

    let http_addr = config.http_addr;
    let app_state = AppState {
        relay,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 4. Run the HTTP + WebSocket server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

fn reply_generator(config: &ServerConfig) -> Arc<dyn ReplyGenerator> {
    let Some(api_key) = config.gemini_api_key.clone() else {
        warn!("GEMINI_API_KEY not set, AI chats will only apologise");
        return Arc::new(FallbackReplyGenerator);
    };

    match GeminiReplyGenerator::new(api_key, &config.gemini_model, config.reply_timeout) {
        Ok(generator) => {
            info!(model = %config.gemini_model, "Gemini reply generator ready");
            Arc::new(generator)
        }
        Err(e) => {
            warn!(error = %e, "Could not build Gemini client, falling back");
            Arc::new(FallbackReplyGenerator)
        }
    }
}
