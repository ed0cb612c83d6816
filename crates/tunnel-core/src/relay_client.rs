//! Relay channel client (C2)
//!
//! Holds the single persistent duplex WebSocket connection to the Relay
//! Host. `connect_flow` looks synchronous to its caller: it registers a
//! one-shot waiter keyed by connection id, sends the `Connect` frame, and
//! awaits either the matching reply or a 10s timeout. Everything else is
//! fire-and-forget. A background task owns the socket and is the only
//! place frames are read from or written to it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};
use crate::frame::{Request, Response};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of a `connect_flow` call.
#[derive(Debug, Clone)]
pub enum ConnectOutcome {
    Connected,
    Error(String),
}

/// Invoked for every response frame not claimed by a pending connect
/// waiter: `Data`, `Disconnected`, and stray `Connected`/`Error` frames.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    async fn handle(&self, response: Response);
}

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<ConnectOutcome>>>>;

/// The C2 contract the synthesizer depends on, kept as a trait so it can
/// be driven by a fake in tests without a live socket.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    async fn connect_flow(&self, id: &str, dest_ip: &str, dest_port: u16) -> ConnectOutcome;
    fn send_data(&self, id: &str, payload: bytes::Bytes);
    fn send_disconnect(&self, id: &str);
    fn send_shutdown_write(&self, id: &str);
}

/// Tunnel-side handle to the relay channel.
pub struct RelayClient {
    outbox: mpsc::UnboundedSender<Message>,
    waiters: Waiters,
}

impl RelayClient {
    /// Connects to `url`, spawning the reader/writer task that owns the
    /// socket. `handler` receives every frame not consumed by a waiter.
    pub async fn connect(
        url: &str,
        handler: Arc<dyn ResponseHandler>,
    ) -> Result<Self> {
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| TunnelError::RelayConnectFailed(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));

        // Writer half: drains fire-and-forget frames and the 30s keepalive ping.
        tokio::spawn(async move {
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    msg = outbox_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = keepalive.tick() => {
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        // Reader half: dispatches every incoming frame to a waiter or the handler.
        let reader_waiters = waiters.clone();
        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(error = %e, "relay channel read error");
                        break;
                    }
                };
                let bytes = match msg {
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => break,
                    _ => continue,
                };
                let response = match Response::decode(&bytes) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "malformed relay frame, dropping");
                        continue;
                    }
                };
                dispatch(&reader_waiters, &handler, response).await;
            }
            fail_all_waiters(&reader_waiters).await;
        });

        Ok(RelayClient {
            outbox: outbox_tx,
            waiters,
        })
    }

    fn send_request(&self, req: Request) -> std::result::Result<(), ()> {
        self.outbox
            .send(Message::Binary(req.encode().to_vec()))
            .map_err(|_| ())
    }
}

#[async_trait]
impl RelayChannel for RelayClient {
    /// Synchronous-from-the-caller's-perspective connect request with a
    /// hard 10s timeout.
    async fn connect_flow(
        &self,
        id: &str,
        dest_ip: &str,
        dest_port: u16,
    ) -> ConnectOutcome {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(id.to_string(), tx);

        let req = Request::Connect {
            id: id.to_string(),
            dest_ip: dest_ip.to_string(),
            dest_port,
        };
        if self.send_request(req).is_err() {
            self.waiters.lock().await.remove(id);
            return ConnectOutcome::Error("channel closed".into());
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ConnectOutcome::Error("channel closed".into()),
            Err(_) => {
                self.waiters.lock().await.remove(id);
                ConnectOutcome::Error("timeout".into())
            }
        }
    }

    fn send_data(&self, id: &str, payload: bytes::Bytes) {
        let req = Request::Data {
            id: id.to_string(),
            payload,
        };
        if self.send_request(req).is_err() {
            debug!(id, "dropping send_data: channel closed");
        }
    }

    fn send_disconnect(&self, id: &str) {
        let req = Request::Disconnect { id: id.to_string() };
        if self.send_request(req).is_err() {
            debug!(id, "dropping send_disconnect: channel closed");
        }
    }

    fn send_shutdown_write(&self, id: &str) {
        let req = Request::ShutdownWrite { id: id.to_string() };
        if self.send_request(req).is_err() {
            debug!(id, "dropping send_shutdown_write: channel closed");
        }
    }
}

async fn dispatch(waiters: &Waiters, handler: &Arc<dyn ResponseHandler>, response: Response) {
    match &response {
        Response::Connected { id } => {
            if let Some(waiter) = waiters.lock().await.remove(id) {
                let _ = waiter.send(ConnectOutcome::Connected);
                return;
            }
        }
        Response::Error { id, message } => {
            if let Some(waiter) = waiters.lock().await.remove(id) {
                let _ = waiter.send(ConnectOutcome::Error(message.clone()));
                return;
            }
        }
        _ => {}
    }
    handler.handle(response).await;
}

async fn fail_all_waiters(waiters: &Waiters) {
    let mut guard = waiters.lock().await;
    for (_, waiter) in guard.drain() {
        let _ = waiter.send(ConnectOutcome::Error("channel closed".into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl ResponseHandler for NoopHandler {
        async fn handle(&self, _response: Response) {}
    }

    #[tokio::test]
    async fn dispatch_resolves_matching_waiter() {
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        waiters.lock().await.insert("flow-1".to_string(), tx);

        let handler: Arc<dyn ResponseHandler> = Arc::new(NoopHandler);
        dispatch(
            &waiters,
            &handler,
            Response::Connected {
                id: "flow-1".into(),
            },
        )
        .await;

        assert!(matches!(rx.await.unwrap(), ConnectOutcome::Connected));
        assert!(waiters.lock().await.is_empty());
    }

    #[tokio::test]
    async fn fail_all_waiters_resolves_with_channel_closed() {
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        waiters.lock().await.insert("flow-1".to_string(), tx);

        fail_all_waiters(&waiters).await;

        match rx.await.unwrap() {
            ConnectOutcome::Error(msg) => assert_eq!(msg, "channel closed"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
