//! Flow table & TCP synthesizer (C4)
//!
//! Fabricates the server half of every TCP connection the client
//! application opens: answers SYNs with a synthesized SYN-ACK once the
//! Relay Host confirms a real connection, ACKs client payload to suppress
//! retransmission, and fragments relayed response bytes into MSS-sized
//! segments.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::flow::{Flow, FlowKey, FlowState, FlowTable};
use crate::frame::Response;
use crate::packet::{build_segment, IpIdCounter, TcpFlags, TcpSegment, MSS};
use crate::relay_client::{ConnectOutcome, RelayChannel};

/// Serializes outbound writes to the virtual interface, as required by
/// the single-writer contract shared with C5.
#[async_trait]
pub trait SegmentWriter: Send + Sync {
    async fn write_segment(&self, segment: Bytes) -> Result<()>;
}

/// The tunnel's own address on the virtual interface (10.0.0.2/24).
pub const TUNNEL_ADDR: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const TCP_WINDOW: u16 = 65535;

pub struct Synthesizer<R: RelayChannel, W: SegmentWriter> {
    flows: FlowTable,
    relay: Arc<R>,
    writer: Arc<W>,
    ip_id: tokio::sync::Mutex<IpIdCounter>,
}

impl<R: RelayChannel, W: SegmentWriter> Synthesizer<R, W> {
    pub fn new(flows: FlowTable, relay: Arc<R>, writer: Arc<W>) -> Self {
        Synthesizer {
            flows,
            relay,
            writer,
            ip_id: tokio::sync::Mutex::new(IpIdCounter::default()),
        }
    }

    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// Dispatch on an inbound client-application segment, per case 1-5.
    pub async fn handle_inbound(&self, segment: TcpSegment) {
        let key = FlowKey {
            client_ip: segment.src_ip,
            client_port: segment.src_port,
            dest_ip: segment.dst_ip,
            dest_port: segment.dst_port,
        };

        let is_pure_syn =
            segment.flags.contains(TcpFlags::SYN) && !segment.flags.contains(TcpFlags::ACK);
        let existing = self.flows.get(&key).await;

        if is_pure_syn {
            if existing.is_some() {
                trace!(id = %key.connection_id(), "duplicate SYN on established flow, dropping");
                return;
            }
            self.handle_syn(key, segment.seq).await;
            return;
        }

        let Some(flow) = existing else {
            trace!(id = %key.connection_id(), "segment on unknown flow, dropping");
            return;
        };

        if segment.payload.is_empty() {
            // Pure ACK, window update, or FIN: the synthesizer does not react.
            return;
        }

        self.handle_payload(flow, segment).await;
    }

    async fn handle_syn(&self, key: FlowKey, client_isn: u32) {
        let id = key.connection_id();
        let outcome = self
            .relay
            .connect_flow(&id, &key.dest_ip.to_string(), key.dest_port)
            .await;

        match outcome {
            ConnectOutcome::Connected => {
                let flow = Flow::new(key, client_isn, 2);
                self.flows.insert(flow).await;
                self.flows
                    .update(&key, |f| f.state = FlowState::Established)
                    .await;

                let synack = self
                    .build_segment_for(
                        &key,
                        1,
                        client_isn.wrapping_add(1),
                        TcpFlags::SYN | TcpFlags::ACK,
                        &[],
                    )
                    .await;
                if let Err(e) = self.writer.write_segment(synack).await {
                    warn!(id, error = %e, "failed to write synthesized SYN-ACK");
                }
            }
            ConnectOutcome::Error(reason) => {
                debug!(id, reason, "relay connect failed, dropping SYN");
            }
        }
    }

    async fn handle_payload(&self, flow: Flow, segment: TcpSegment) {
        let id = flow.key.connection_id();
        let payload_len = segment.payload.len() as u32;
        let new_app_seq = segment.seq.wrapping_add(payload_len);

        self.flows
            .update(&flow.key, |f| f.app_seq = new_app_seq)
            .await;

        self.relay.send_data(&id, segment.payload);

        let ack = self
            .build_segment_for(&flow.key, flow.our_seq, new_app_seq, TcpFlags::ACK, &[])
            .await;
        if let Err(e) = self.writer.write_segment(ack).await {
            warn!(id, error = %e, "failed to write ACK segment");
        }
    }

    /// Dispatch on a response frame arriving from the Relay Host.
    pub async fn handle_response(&self, response: Response) {
        match response {
            Response::Data { id, payload } => self.handle_data_response(&id, payload).await,
            Response::Disconnected { id } => self.teardown(&id).await,
            Response::Error { id, message } => {
                debug!(id, message, "relay reported error, tearing down flow");
                self.teardown(&id).await;
            }
            Response::Connected { id } => {
                trace!(id, "stray Connected reached handler, ignoring");
            }
        }
    }

    async fn teardown(&self, id: &str) {
        if let Some(key) = self.flows.find_by_id(id).await {
            self.flows.remove(&key).await;
        }
    }

    async fn handle_data_response(&self, id: &str, payload: Bytes) {
        let Some(key) = self.flows.find_by_id(id).await else {
            trace!(id, "Data response for unknown flow, dropping");
            return;
        };
        let Some(flow) = self.flows.get(&key).await else {
            trace!(id, "Data response for unknown flow, dropping");
            return;
        };

        let mut seq = flow.our_seq;
        for chunk in payload.chunks(MSS) {
            let segment = self
                .build_segment_for(
                    &flow.key,
                    seq,
                    flow.app_seq,
                    TcpFlags::PSH | TcpFlags::ACK,
                    chunk,
                )
                .await;
            if let Err(e) = self.writer.write_segment(segment).await {
                warn!(id, error = %e, "failed to write PSH+ACK segment");
                return;
            }
            seq = seq.wrapping_add(chunk.len() as u32);
        }

        let total = seq;
        self.flows.update(&flow.key, |f| f.our_seq = total).await;
    }

    async fn build_segment_for(
        &self,
        key: &FlowKey,
        seq: u32,
        ack: u32,
        flags: TcpFlags,
        payload: &[u8],
    ) -> Bytes {
        let ip_id = self.ip_id.lock().await.next();
        build_segment(
            key.dest_ip,
            TUNNEL_ADDR,
            key.dest_port,
            key.client_port,
            seq,
            ack,
            flags,
            TCP_WINDOW,
            ip_id,
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingWriter {
        segments: tokio::sync::Mutex<Vec<Bytes>>,
    }

    impl RecordingWriter {
        fn new() -> Self {
            RecordingWriter {
                segments: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SegmentWriter for RecordingWriter {
        async fn write_segment(&self, segment: Bytes) -> Result<()> {
            self.segments.lock().await.push(segment);
            Ok(())
        }
    }

    /// A relay double whose connect_flow outcome is fixed at construction,
    /// recording everything sent through the fire-and-forget methods.
    struct FakeRelay {
        outcome: ConnectOutcome,
        sent_data: StdMutex<Vec<(String, Bytes)>>,
    }

    impl FakeRelay {
        fn always(outcome: ConnectOutcome) -> Self {
            FakeRelay {
                outcome,
                sent_data: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RelayChannel for FakeRelay {
        async fn connect_flow(&self, _id: &str, _dest_ip: &str, _dest_port: u16) -> ConnectOutcome {
            self.outcome.clone()
        }
        fn send_data(&self, id: &str, payload: Bytes) {
            self.sent_data.lock().unwrap().push((id.to_string(), payload));
        }
        fn send_disconnect(&self, _id: &str) {}
        fn send_shutdown_write(&self, _id: &str) {}
    }

    fn sample_key() -> FlowKey {
        FlowKey {
            client_ip: Ipv4Addr::new(10, 0, 0, 2),
            client_port: 51000,
            dest_ip: Ipv4Addr::new(93, 184, 216, 34),
            dest_port: 443,
        }
    }

    fn syn_segment(seq: u32) -> TcpSegment {
        TcpSegment {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_ip: Ipv4Addr::new(93, 184, 216, 34),
            src_port: 51000,
            dst_port: 443,
            seq,
            ack: 0,
            flags: TcpFlags::SYN,
            window: 65535,
            payload: Bytes::new(),
        }
    }

    #[tokio::test]
    async fn syn_handshake_builds_synack_on_connected() {
        let flows = FlowTable::new();
        let relay = Arc::new(FakeRelay::always(ConnectOutcome::Connected));
        let writer = Arc::new(RecordingWriter::new());
        let synth = Synthesizer::new(flows.clone(), relay, writer.clone());

        synth.handle_inbound(syn_segment(1000)).await;

        let flow = flows.get(&sample_key()).await.expect("flow created");
        assert_eq!(flow.state, FlowState::Established);
        assert_eq!(flow.app_seq, 1001);
        assert_eq!(flow.our_seq, 2);

        let segments = writer.segments.lock().await;
        assert_eq!(segments.len(), 1);
        let parsed = TcpSegment::parse(&segments[0]).unwrap();
        assert_eq!(parsed.seq, 1);
        assert_eq!(parsed.ack, 1001);
        assert!(parsed.flags.contains(TcpFlags::SYN) && parsed.flags.contains(TcpFlags::ACK));
    }

    #[tokio::test]
    async fn syn_dropped_on_relay_error_no_flow_no_segment() {
        let flows = FlowTable::new();
        let relay = Arc::new(FakeRelay::always(ConnectOutcome::Error("refused".into())));
        let writer = Arc::new(RecordingWriter::new());
        let synth = Synthesizer::new(flows.clone(), relay, writer.clone());

        synth.handle_inbound(syn_segment(1000)).await;

        assert!(flows.get(&sample_key()).await.is_none());
        assert!(writer.segments.lock().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_syn_on_established_flow_is_dropped() {
        let flows = FlowTable::new();
        let relay = Arc::new(FakeRelay::always(ConnectOutcome::Connected));
        let writer = Arc::new(RecordingWriter::new());
        let synth = Synthesizer::new(flows.clone(), relay, writer.clone());

        synth.handle_inbound(syn_segment(1000)).await;
        synth.handle_inbound(syn_segment(1000)).await;

        assert_eq!(writer.segments.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn payload_segment_acks_and_forwards_data() {
        let flows = FlowTable::new();
        let relay = Arc::new(FakeRelay::always(ConnectOutcome::Connected));
        let writer = Arc::new(RecordingWriter::new());
        let synth = Synthesizer::new(flows.clone(), relay.clone(), writer.clone());

        synth.handle_inbound(syn_segment(1000)).await;
        writer.segments.lock().await.clear();

        let payload = Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n");
        let data_segment = TcpSegment {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_ip: Ipv4Addr::new(93, 184, 216, 34),
            src_port: 51000,
            dst_port: 443,
            seq: 1001,
            ack: 2,
            flags: TcpFlags::PSH | TcpFlags::ACK,
            window: 65535,
            payload: payload.clone(),
        };
        synth.handle_inbound(data_segment).await;

        let sent = relay.sent_data.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, payload);

        let segments = writer.segments.lock().await;
        assert_eq!(segments.len(), 1);
        let parsed = TcpSegment::parse(&segments[0]).unwrap();
        assert_eq!(parsed.ack, 1001 + payload.len() as u32);
        assert!(parsed.flags.contains(TcpFlags::ACK) && parsed.payload.is_empty());

        let flow = flows.get(&sample_key()).await.unwrap();
        assert_eq!(flow.app_seq, 1001 + payload.len() as u32);
    }

    #[tokio::test]
    async fn zero_payload_segment_is_ignored() {
        let flows = FlowTable::new();
        let relay = Arc::new(FakeRelay::always(ConnectOutcome::Connected));
        let writer = Arc::new(RecordingWriter::new());
        let synth = Synthesizer::new(flows.clone(), relay, writer.clone());

        synth.handle_inbound(syn_segment(1000)).await;
        writer.segments.lock().await.clear();

        let pure_ack = TcpSegment {
            src_ip: Ipv4Addr::new(10, 0, 0, 2),
            dst_ip: Ipv4Addr::new(93, 184, 216, 34),
            src_port: 51000,
            dst_port: 443,
            seq: 1001,
            ack: 2,
            flags: TcpFlags::ACK,
            window: 65535,
            payload: Bytes::new(),
        };
        synth.handle_inbound(pure_ack).await;

        assert!(writer.segments.lock().await.is_empty());
    }

    #[tokio::test]
    async fn mss_fragmentation_splits_and_advances_seq() {
        let flows = FlowTable::new();
        let key = sample_key();
        let mut flow = Flow::new(key, 1000, 2);
        flow.state = FlowState::Established;
        flow.app_seq = 1019;
        flows.insert(flow).await;

        let relay = Arc::new(FakeRelay::always(ConnectOutcome::Connected));
        let writer = Arc::new(RecordingWriter::new());
        let synth = Synthesizer::new(flows.clone(), relay, writer.clone());

        let n = 3000usize;
        let payload = Bytes::from(vec![7u8; n]);
        synth
            .handle_response(Response::Data {
                id: key.connection_id(),
                payload: payload.clone(),
            })
            .await;

        let segments = writer.segments.lock().await;
        assert_eq!(segments.len(), 2);

        let first = TcpSegment::parse(&segments[0]).unwrap();
        let second = TcpSegment::parse(&segments[1]).unwrap();
        assert_eq!(first.payload.len(), 1460);
        assert_eq!(second.payload.len(), 1540);
        assert_eq!(first.seq, 2);
        assert_eq!(second.seq, 2u32.wrapping_add(1460));

        let mut concatenated = first.payload.to_vec();
        concatenated.extend_from_slice(&second.payload);
        assert_eq!(concatenated, payload.to_vec());

        let updated = flows.get(&key).await.unwrap();
        assert_eq!(updated.our_seq, 2u32.wrapping_add(n as u32));
    }

    #[tokio::test]
    async fn disconnected_response_removes_flow() {
        let flows = FlowTable::new();
        let key = sample_key();
        flows.insert(Flow::new(key, 1000, 2)).await;

        let relay = Arc::new(FakeRelay::always(ConnectOutcome::Connected));
        let writer = Arc::new(RecordingWriter::new());
        let synth = Synthesizer::new(flows.clone(), relay, writer);

        synth
            .handle_response(Response::Disconnected {
                id: key.connection_id(),
            })
            .await;

        assert!(flows.get(&key).await.is_none());
    }
}
