//! IPv4/TCP segment parsing and synthesis (C3)
//!
//! We only ever see IPv4-over-TCP traffic routed through the virtual
//! interface; anything else is rejected at parse time. Checksums are
//! computed the standard way: sum as big-endian 16-bit words with
//! one's-complement end-around carry, then complement.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, TunnelError};

pub const MSS: usize = 1460;

const IP_VERSION_IHL: u8 = 0x45; // version 4, 5 x 32-bit words, no options
const PROTO_TCP: u8 = 6;

bitflags::bitflags! {
    /// TCP control bits, as laid out in the flags octet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// A parsed IPv4/TCP segment borrowed from a packet buffer.
#[derive(Debug, Clone)]
pub struct TcpSegment {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub payload: Bytes,
}

impl TcpSegment {
    /// Parse a raw IPv4 packet, returning the embedded TCP segment.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < 20 {
            return Err(TunnelError::MalformedFrame("ipv4 header too short".into()));
        }
        let version = raw[0] >> 4;
        if version != 4 {
            return Err(TunnelError::MalformedFrame(format!(
                "unsupported ip version {version}"
            )));
        }
        let ihl = (raw[0] & 0x0f) as usize * 4;
        if ihl < 20 || raw.len() < ihl {
            return Err(TunnelError::MalformedFrame("invalid ip ihl".into()));
        }
        let protocol = raw[9];
        if protocol != PROTO_TCP {
            return Err(TunnelError::MalformedFrame(format!(
                "unsupported ip protocol {protocol}"
            )));
        }
        let total_len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
        if raw.len() < total_len {
            return Err(TunnelError::MalformedFrame("truncated ip packet".into()));
        }
        let src_ip = Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]);
        let dst_ip = Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]);

        let tcp = &raw[ihl..total_len];
        if tcp.len() < 20 {
            return Err(TunnelError::MalformedFrame("tcp header too short".into()));
        }
        let src_port = u16::from_be_bytes([tcp[0], tcp[1]]);
        let dst_port = u16::from_be_bytes([tcp[2], tcp[3]]);
        let seq = u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]);
        let ack = u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]);
        let data_offset = (tcp[12] >> 4) as usize * 4;
        if data_offset < 20 || tcp.len() < data_offset {
            return Err(TunnelError::MalformedFrame("invalid tcp data offset".into()));
        }
        let flags = TcpFlags::from_bits_truncate(tcp[13]);
        let window = u16::from_be_bytes([tcp[14], tcp[15]]);
        let payload = Bytes::copy_from_slice(&tcp[data_offset..]);

        Ok(TcpSegment {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            seq,
            ack,
            flags,
            window,
            payload,
        })
    }
}

/// Builds a single IPv4/TCP segment with the given parameters, computing
/// both the IPv4 header checksum and the TCP checksum over the pseudo
/// header.
#[allow(clippy::too_many_arguments)]
pub fn build_segment(
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    ip_id: u16,
    payload: &[u8],
) -> Bytes {
    let tcp_len = 20 + payload.len();
    let total_len = 20 + tcp_len;

    let mut buf = BytesMut::with_capacity(total_len);
    // IPv4 header
    buf.put_u8(IP_VERSION_IHL);
    buf.put_u8(0); // DSCP/ECN
    buf.put_u16(total_len as u16);
    buf.put_u16(ip_id);
    buf.put_u16(0x4000); // flags=DF, fragment offset 0
    buf.put_u8(64); // TTL
    buf.put_u8(PROTO_TCP);
    buf.put_u16(0); // checksum placeholder
    buf.put_slice(&src_ip.octets());
    buf.put_slice(&dst_ip.octets());

    // TCP header
    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u32(seq);
    buf.put_u32(ack);
    buf.put_u8(5 << 4); // data offset, no options
    buf.put_u8(flags.bits());
    buf.put_u16(window);
    buf.put_u16(0); // checksum placeholder
    buf.put_u16(0); // urgent pointer
    buf.put_slice(payload);

    let mut out = buf;

    let ip_checksum = checksum16(&out[0..20]);
    out[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    let tcp_checksum = tcp_checksum(src_ip, dst_ip, &out[20..]);
    out[20 + 16..20 + 18].copy_from_slice(&tcp_checksum.to_be_bytes());

    out.freeze()
}

/// One's-complement checksum over `data`, treated as big-endian 16-bit
/// words with a zero pad byte if the length is odd.
fn checksum16(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn tcp_checksum(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, tcp_segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + tcp_segment.len() + 1);
    pseudo.extend_from_slice(&src_ip.octets());
    pseudo.extend_from_slice(&dst_ip.octets());
    pseudo.push(0);
    pseudo.push(PROTO_TCP);
    pseudo.extend_from_slice(&(tcp_segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(tcp_segment);
    checksum16(&pseudo)
}

/// Monotonically increasing IPv4 identification counter, wrapping at u16::MAX.
#[derive(Debug, Default)]
pub struct IpIdCounter(u16);

impl IpIdCounter {
    pub fn next(&mut self) -> u16 {
        let id = self.0;
        self.0 = self.0.wrapping_add(1);
        id
    }
}
