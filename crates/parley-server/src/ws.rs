//! WebSocket glue between axum sockets and the relay.
//!
//! Each socket gets a [`Transport`] whose queue is drained by a writer task;
//! the reader feeds text frames to [`Relay::handle_frame`]. When either side
//! ends, the connection is detached and the writer flushes what is left.

use std::net::{IpAddr, SocketAddr};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures::{Sink, SinkExt, StreamExt};
use tracing::{debug, warn};

use parley_shared::{Transport, TransportReceiver};

use crate::api::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let address = client_address(&headers, peer, state.config.trust_forwarded_for);
    ws.on_upgrade(move |socket| handle_socket(socket, state, address))
}

/// Network address used for identity lookup and bans.
///
/// Forwarding headers are only honoured when the server runs behind a
/// trusted proxy; otherwise any client could pick its own address.
pub fn client_address(headers: &HeaderMap, peer: SocketAddr, trust_forwarded: bool) -> String {
    if trust_forwarded {
        if let Some(ip) = forwarded_ip(headers) {
            return ip.to_string();
        }
    }
    peer.ip().to_string()
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

async fn handle_socket(socket: WebSocket, state: AppState, address: String) {
    let (transport, outbound) = Transport::channel(state.config.send_queue);
    let (mut ws_tx, mut ws_rx) = socket.split();

    let Some(mut conn) = state.relay.open(transport, address).await else {
        // Flush the `banned` notice before hanging up.
        write_events(&mut ws_tx, outbound).await;
        return;
    };

    let mut writer = tokio::spawn(async move { write_events(&mut ws_tx, outbound).await });

    let relay = state.relay.clone();
    let reader = async {
        while let Some(frame) = ws_rx.next().await {
            match frame {
                Ok(Message::Text(text)) => relay.handle_frame(&mut conn, &text).await,
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => relay.handle_frame(&mut conn, text).await,
                    Err(_) => debug!(address = %conn.address(), "Ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(address = %conn.address(), user = ?conn.user(), error = %e, "WebSocket read error");
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = reader => {}
        _ = &mut writer => {}
    }

    state.relay.close(conn).await;

    // Closing the transport ends the writer once the queue is drained.
    if !writer.is_finished() {
        let _ = writer.await;
    }
}

async fn write_events<S>(ws_tx: &mut S, mut outbound: TransportReceiver)
where
    S: Sink<Message> + Unpin,
{
    while let Some(event) = outbound.recv().await {
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = event.kind(), error = %e, "Failed to encode event");
                continue;
            }
        };
        if ws_tx.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}
