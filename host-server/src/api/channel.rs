//! Relay channel server (C6)
//!
//! Accepts one relay channel per WebSocket upgrade and instantiates a
//! fresh C7 `RelayManager` for it. Frame parse errors are logged and the
//! offending frame is dropped; the channel itself stays open. On channel
//! close or error the manager is torn down, which destroys every real
//! socket it owned.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tunnel_core::frame::Request;

use crate::manager::RelayManager;
use crate::state::AppState;

pub async fn upgrade(State(_state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(handle_channel)
}

async fn handle_channel(socket: WebSocket) {
    info!("relay channel connected");
    let (mut sink, mut stream) = socket.split();

    let (requests_tx, requests_rx) = mpsc::unbounded_channel::<Request>();
    let (responses_tx, mut responses_rx) = mpsc::unbounded_channel();

    let manager = RelayManager::new(responses_tx);
    let manager_task = tokio::spawn(manager.run(requests_rx));

    let writer_task = tokio::spawn(async move {
        while let Some(response) = responses_rx.recv().await {
            let bytes = response.encode().to_vec();
            if sink.send(Message::Binary(bytes)).await.is_err() {
                break;
            }
        }
        let _ = sink
            .send(Message::Close(Some(CloseFrame {
                code: 1000,
                reason: "shutdown".into(),
            })))
            .await;
    });

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "relay channel read error");
                break;
            }
        };
        match msg {
            Message::Binary(bytes) => match Request::decode(&bytes) {
                Ok(req) => {
                    if requests_tx.send(req).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "malformed relay frame, dropping");
                }
            },
            Message::Close(_) => {
                debug!("relay channel closed by peer");
                break;
            }
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    drop(requests_tx);
    let _ = manager_task.await;
    let _ = writer_task.await;
    info!("relay channel disconnected");
}
