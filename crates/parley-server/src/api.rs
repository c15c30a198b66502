use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, Method},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use parley_shared::UserId;
use parley_store::{BannedAddress, ChatSnapshot, IdentityInfo};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::relay::Relay;
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/admin/users", get(admin_users))
        .route("/admin/banned", get(admin_banned))
        .route("/admin/ban", post(admin_ban))
        .route("/admin/unban", post(admin_unban))
        .route("/admin/ban-user", post(admin_ban_user))
        .route("/admin/unban-user", post(admin_unban_user))
        .route("/admin/chats", get(admin_chats))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Admin endpoints
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct AddressRequest {
    address: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRequest {
    user_id: UserId,
}

#[derive(Serialize)]
struct BanResponse {
    banned: bool,
    closed: usize,
}

#[derive(Serialize)]
struct UserBanResponse {
    banned: bool,
}

#[derive(Serialize)]
struct UnbanResponse {
    unbanned: bool,
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

fn required(value: &str, field: &str) -> Result<String, ServerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ServerError::BadRequest(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

async fn admin_users(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<IdentityInfo>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.relay.list_identities().await))
}

async fn admin_banned(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<BannedAddress>>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.relay.list_banned_addresses_with_owners().await))
}

async fn admin_ban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<BanResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let address = required(&req.address, "address")?;

    let closed = state.relay.ban(&address).await;
    info!(address = %address, closed, "Admin banned address");

    Ok(Json(BanResponse {
        banned: true,
        closed,
    }))
}

async fn admin_unban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<AddressRequest>,
) -> Result<Json<UnbanResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let address = required(&req.address, "address")?;

    let unbanned = state.relay.unban(&address).await;
    info!(address = %address, unbanned, "Admin unbanned address");

    Ok(Json(UnbanResponse { unbanned }))
}

async fn admin_ban_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UserRequest>,
) -> Result<Json<UserBanResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let user_id = UserId::from(required(req.user_id.as_str(), "userId")?.as_str());

    let banned = state.relay.ban_user(&user_id).await;
    info!(user = %user_id, banned, "Admin banned identity");

    Ok(Json(UserBanResponse { banned }))
}

async fn admin_unban_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<UserRequest>,
) -> Result<Json<UnbanResponse>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    let user_id = UserId::from(required(req.user_id.as_str(), "userId")?.as_str());

    let unbanned = state.relay.unban_user(&user_id).await;
    info!(user = %user_id, unbanned, "Admin unbanned identity");

    Ok(Json(UnbanResponse { unbanned }))
}

async fn admin_chats(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<ChatSnapshot>, ServerError> {
    verify_admin_token(&headers, &state.config)?;
    Ok(Json(state.relay.snapshot().await))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
