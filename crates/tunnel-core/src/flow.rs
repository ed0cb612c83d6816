//! Per-connection flow tracking
//!
//! A `Flow` is keyed by the client application's 4-tuple and carries just
//! enough TCP state for the synthesizer to answer SYNs and keep its own
//! sequence numbers consistent, without congestion control, SACK, or
//! window scaling.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::RwLock;

/// Client-side 4-tuple identifying a flow, plus the destination the
/// client is dialing. This doubles as the relay connection id once
/// rendered via `FlowKey::connection_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub dest_ip: Ipv4Addr,
    pub dest_port: u16,
}

impl FlowKey {
    /// Stable textual id shared with the Relay Host over the frame codec.
    pub fn connection_id(&self) -> String {
        format!(
            "{}:{}-{}:{}",
            self.client_ip, self.client_port, self.dest_ip, self.dest_port
        )
    }
}

/// Lifecycle state of a tracked flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// SYN observed locally, SYN-ACK synthesized, awaiting the client's ACK.
    SynReceived,
    /// Handshake complete; relay Connect request sent, payload flows freely.
    Established,
    /// FIN/RST seen from either side, or Disconnected response received.
    Closed,
}

/// Mutable per-flow sequence-number bookkeeping.
#[derive(Debug, Clone)]
pub struct Flow {
    pub key: FlowKey,
    pub state: FlowState,
    /// Next sequence number we expect from the client application.
    pub app_seq: u32,
    /// Next sequence number we will use in segments we synthesize.
    pub our_seq: u32,
    /// Client's initial sequence number, captured from the opening SYN.
    pub client_isn: u32,
}

impl Flow {
    pub fn new(key: FlowKey, client_isn: u32, our_isn: u32) -> Self {
        Flow {
            key,
            state: FlowState::SynReceived,
            app_seq: client_isn.wrapping_add(1),
            our_seq: our_isn,
            client_isn,
        }
    }
}

/// Concurrent flow table shared between the interface reader task (which
/// inserts/advances flows on inbound SYNs and data) and the relay-response
/// dispatcher task (which advances/removes flows on relay responses).
#[derive(Debug, Clone, Default)]
pub struct FlowTable {
    inner: Arc<RwLock<HashMap<FlowKey, Flow>>>,
}

impl FlowTable {
    pub fn new() -> Self {
        FlowTable {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, flow: Flow) {
        self.inner.write().await.insert(flow.key, flow);
    }

    pub async fn get(&self, key: &FlowKey) -> Option<Flow> {
        self.inner.read().await.get(key).cloned()
    }

    /// Responses only carry the connection id string; recover the key by
    /// scanning the table. The table holds one entry per live flow on a
    /// single tunnel, so a linear scan is cheap.
    pub async fn find_by_id(&self, id: &str) -> Option<FlowKey> {
        self.inner
            .read()
            .await
            .keys()
            .find(|k| k.connection_id() == id)
            .copied()
    }

    pub async fn update<F>(&self, key: &FlowKey, f: F) -> bool
    where
        F: FnOnce(&mut Flow),
    {
        let mut guard = self.inner.write().await;
        if let Some(flow) = guard.get_mut(key) {
            f(flow);
            true
        } else {
            false
        }
    }

    pub async fn remove(&self, key: &FlowKey) -> Option<Flow> {
        self.inner.write().await.remove(key)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}
