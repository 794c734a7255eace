//! Accepting WebSocket peers with axum.
//!
//! [`router`] returns a router with a single `/sync` route that upgrades
//! to a WebSocket and feeds the connection into the runtime behind the
//! given [`AdapterHandle`]. Mount it in any axum app; the relay binary
//! does exactly that.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tether_core::fragment::{self, Reassembler, WS_FRAGMENT_THRESHOLD};
use tether_core::AdapterHandle;

/// A router exposing the sync endpoint at `/sync`.
pub fn router(handle: AdapterHandle) -> Router {
    Router::new()
        .route("/sync", get(ws_upgrade))
        .with_state(handle)
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(handle): State<AdapterHandle>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, handle))
}

/// Drive one accepted socket against the runtime.
pub async fn serve_socket(socket: WebSocket, handle: AdapterHandle) {
    let (mut sink, mut source) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let channel_id = handle.open_channel(out_tx).await;
    let mut reassembler = Reassembler::new();

    'link: loop {
        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => {
                    for part in fragment::split(&frame, WS_FRAGMENT_THRESHOLD) {
                        if sink.send(WsMessage::Binary(part.into())).await.is_err() {
                            warn!(channel = %channel_id, "websocket send failed");
                            break 'link;
                        }
                    }
                }
                None => break 'link,
            },
            message = source.next() => match message {
                Some(Ok(WsMessage::Binary(bytes))) => match reassembler.accept(&bytes) {
                    Ok(Some(frame)) => handle.deliver(channel_id, frame).await,
                    Ok(None) => {}
                    Err(e) => warn!(channel = %channel_id, error = %e, "dropping bad fragment"),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    debug!(channel = %channel_id, "websocket closed by peer");
                    break 'link;
                }
                Some(Ok(_)) => {} // text/ping/pong handled by axum
                Some(Err(e)) => {
                    warn!(channel = %channel_id, "websocket receive failed: {e}");
                    break 'link;
                }
            },
        }
    }

    let _ = sink.close().await;
    handle.close_channel(channel_id).await;
}
