use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use tracing::{debug, warn};

use crate::hub::Hub;
use crate::sessions::Outbound;

// ── WebSocket handler ────────────────────────────────────────────────────────

pub async fn ws_handler(ws: WebSocketUpgrade, State(hub): State<Hub>) -> Response {
    // Oversized frames must reach the hub to be dropped there; a transport
    // limit would kill the whole connection instead.
    let limit = (hub.config().max_payload_bytes * 4).max(1 << 20);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(mut socket: WebSocket, hub: Hub) {
    let (conn, mut outbound) = hub.connect().await;

    loop {
        tokio::select! {
            out = outbound.recv() => {
                let frame = match out {
                    Some(Outbound::Message(msg)) => match serde_json::to_string(&msg) {
                        Ok(text) => Message::Text(text),
                        Err(e) => {
                            warn!("Failed to encode {} for {conn}: {e}", msg.kind());
                            continue;
                        }
                    },
                    Some(Outbound::Ping) => Message::Ping(Vec::new()),
                    Some(Outbound::Close) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                };
                if socket.send(frame).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => hub.handle_text(conn, &text).await,
                    Some(Ok(Message::Pong(_))) => hub.mark_alive(conn).await,
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Binary(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!("Socket error for {conn}: {e}");
                        break;
                    }
                }
            }
        }
    }

    hub.disconnect(conn).await;
}
