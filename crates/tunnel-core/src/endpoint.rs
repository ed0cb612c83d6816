//! Tunnel endpoint loop (C5)
//!
//! Wires together the virtual interface, the relay channel, and the
//! synthesizer, and owns the lifecycle: `start` brings all three up and
//! spawns the reader task; `stop` unwinds them in the order the interface
//! read can actually be interrupted.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::flow::FlowTable;
use crate::frame::Response;
use crate::iface::{SerializedInterface, VirtualInterface};
use crate::packet::TcpSegment;
use crate::relay_client::{RelayClient, ResponseHandler};
use crate::synth::Synthesizer;

/// Aggregate tunnel state published for observers (UI, CLI, logs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Configuration the external collaborator supplies at start time.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub relay_url: String,
    pub iface_name: String,
}

/// Owns the running tunnel's tasks and publishes its aggregate state.
pub struct TunnelEndpoint {
    config: EndpointConfig,
    state_tx: watch::Sender<TunnelState>,
    reader_task: Option<JoinHandle<()>>,
    iface: Option<Arc<VirtualInterface>>,
    flows: FlowTable,
}

impl TunnelEndpoint {
    pub fn new(config: EndpointConfig) -> Self {
        let (state_tx, _rx) = watch::channel(TunnelState::Disconnected);
        TunnelEndpoint {
            config,
            state_tx,
            reader_task: None,
            iface: None,
            flows: FlowTable::new(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// Obtains the virtual-interface fd, opens the relay channel, and
    /// begins the reader task. Publishes `Connected` on success, `Error`
    /// on failure to establish the interface.
    pub async fn start(&mut self) -> Result<()> {
        let _ = self.state_tx.send(TunnelState::Connecting);

        let iface = match VirtualInterface::open(&self.config.iface_name) {
            Ok(iface) => Arc::new(iface),
            Err(e) => {
                error!(error = %e, "failed to open virtual interface");
                let _ = self.state_tx.send(TunnelState::Error);
                return Err(e);
            }
        };
        let writer = Arc::new(SerializedInterface::new(iface.clone()));

        let synth_cell: Arc<tokio::sync::OnceCell<Arc<Synthesizer<RelayClient, SerializedInterface>>>> =
            Arc::new(tokio::sync::OnceCell::new());
        let handler = Arc::new(DeferredHandler {
            synth: synth_cell.clone(),
        });

        let relay = match RelayClient::connect(&self.config.relay_url, handler).await {
            Ok(relay) => Arc::new(relay),
            Err(e) => {
                error!(error = %e, "failed to open relay channel");
                let _ = self.state_tx.send(TunnelState::Error);
                return Err(e);
            }
        };

        let synth = Arc::new(Synthesizer::new(self.flows.clone(), relay, writer));
        let _ = synth_cell.set(synth.clone());

        let reader_iface = iface.clone();
        let reader_synth = synth.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader_iface.read_packet().await {
                    Ok(Some(raw)) => match TcpSegment::parse(&raw) {
                        Ok(segment) => reader_synth.handle_inbound(segment).await,
                        Err(e) => {
                            // NonIPv4OrNonTcp / malformed: silently dropped per §7.
                            tracing::trace!(error = %e, "dropping non-tcp/ipv4 packet");
                        }
                    },
                    Ok(None) => {
                        info!("virtual interface closed, stopping reader");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "virtual interface read error, stopping reader");
                        break;
                    }
                }
            }
        });

        self.iface = Some(iface);
        self.reader_task = Some(reader_task);
        let _ = self.state_tx.send(TunnelState::Connected);
        Ok(())
    }

    /// Publishes `Disconnected`, closes the interface (unblocking the
    /// reader), interrupts the reader task, and clears the flow table.
    pub async fn stop(&mut self) {
        let _ = self.state_tx.send(TunnelState::Disconnected);

        self.iface = None; // dropping the device closes the fd

        if let Some(task) = self.reader_task.take() {
            task.abort();
        }

        // Replacing the table (rather than draining it) is sufficient: no
        // new inbound packets can arrive once the interface is closed and
        // the reader task aborted above.
        self.flows = FlowTable::new();
    }
}

/// Bridges the relay client's handler callback (registered before the
/// synthesizer exists) to the synthesizer once it is constructed.
struct DeferredHandler {
    synth: Arc<tokio::sync::OnceCell<Arc<Synthesizer<RelayClient, SerializedInterface>>>>,
}

#[async_trait]
impl ResponseHandler for DeferredHandler {
    async fn handle(&self, response: Response) {
        if let Some(synth) = self.synth.get() {
            synth.handle_response(response).await;
        } else {
            warn!("response arrived before synthesizer was ready, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn initial_state_is_disconnected() {
        let endpoint = TunnelEndpoint::new(EndpointConfig {
            relay_url: "ws://127.0.0.1:3000/tunnel".into(),
            iface_name: "tun-test".into(),
        });
        assert_eq!(*endpoint.subscribe().borrow(), TunnelState::Disconnected);
    }
}
