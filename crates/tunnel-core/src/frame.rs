//! Binary framing for the relay channel (C1)
//!
//! Requests travel tunnel -> host, responses travel host -> tunnel. Each
//! frame is carried as exactly one WebSocket binary message, so encoding
//! and decoding work on a single complete buffer rather than an
//! incremental stream decoder.
//!
//! ```text
//!  Request:
//!   0                   1
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  tag  |   id_len      |  id bytes...
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  Connect:  id ++ u16 ip_len ++ ip bytes ++ u16 dest_port
//!  Data:     id ++ u32 payload_len ++ payload bytes
//!  Disconnect / ShutdownWrite: id only
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TunnelError};

/// Request sent from the Tunnel Endpoint to the Relay Host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect {
        id: String,
        dest_ip: String,
        dest_port: u16,
    },
    Data {
        id: String,
        payload: Bytes,
    },
    Disconnect {
        id: String,
    },
    ShutdownWrite {
        id: String,
    },
}

/// Response sent from the Relay Host to the Tunnel Endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Connected { id: String },
    Data { id: String, payload: Bytes },
    Disconnected { id: String },
    Error { id: String, message: String },
}

const REQ_CONNECT: u8 = 0x01;
const REQ_DATA: u8 = 0x02;
const REQ_DISCONNECT: u8 = 0x03;
const REQ_SHUTDOWN_WRITE: u8 = 0x04;

const RESP_CONNECTED: u8 = 0x01;
const RESP_DATA: u8 = 0x02;
const RESP_DISCONNECTED: u8 = 0x03;
const RESP_ERROR: u8 = 0x04;

fn put_id(dst: &mut BytesMut, id: &str) {
    dst.put_u16(id.len() as u16);
    dst.put_slice(id.as_bytes());
}

fn take_string(src: &mut Bytes, len: usize) -> Result<String> {
    if src.len() < len {
        return Err(TunnelError::MalformedFrame(
            "buffer too short for string field".into(),
        ));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| TunnelError::MalformedFrame(format!("invalid utf-8: {e}")))
}

fn take_id(src: &mut Bytes) -> Result<String> {
    if src.len() < 2 {
        return Err(TunnelError::MalformedFrame("missing id_len".into()));
    }
    let len = src.get_u16() as usize;
    take_string(src, len)
}

impl Request {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Request::Connect {
                id,
                dest_ip,
                dest_port,
            } => {
                buf.put_u8(REQ_CONNECT);
                put_id(&mut buf, id);
                buf.put_u16(dest_ip.len() as u16);
                buf.put_slice(dest_ip.as_bytes());
                buf.put_u16(*dest_port);
            }
            Request::Data { id, payload } => {
                buf.put_u8(REQ_DATA);
                put_id(&mut buf, id);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Request::Disconnect { id } => {
                buf.put_u8(REQ_DISCONNECT);
                put_id(&mut buf, id);
            }
            Request::ShutdownWrite { id } => {
                buf.put_u8(REQ_SHUTDOWN_WRITE);
                put_id(&mut buf, id);
            }
        }
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut src = Bytes::copy_from_slice(bytes);
        if src.is_empty() {
            return Err(TunnelError::MalformedFrame("empty frame".into()));
        }
        let tag = src.get_u8();
        let id = take_id(&mut src)?;
        match tag {
            REQ_CONNECT => {
                if src.len() < 2 {
                    return Err(TunnelError::MalformedFrame("missing ip_len".into()));
                }
                let ip_len = src.get_u16() as usize;
                let dest_ip = take_string(&mut src, ip_len)?;
                if src.len() < 2 {
                    return Err(TunnelError::MalformedFrame("missing dest_port".into()));
                }
                let dest_port = src.get_u16();
                Ok(Request::Connect {
                    id,
                    dest_ip,
                    dest_port,
                })
            }
            REQ_DATA => {
                if src.len() < 4 {
                    return Err(TunnelError::MalformedFrame("missing payload_len".into()));
                }
                let payload_len = src.get_u32() as usize;
                if src.len() < payload_len {
                    return Err(TunnelError::MalformedFrame("truncated payload".into()));
                }
                let payload = src.split_to(payload_len);
                Ok(Request::Data { id, payload })
            }
            REQ_DISCONNECT => Ok(Request::Disconnect { id }),
            REQ_SHUTDOWN_WRITE => Ok(Request::ShutdownWrite { id }),
            other => Err(TunnelError::MalformedFrame(format!(
                "unknown request tag {other:#x}"
            ))),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Request::Connect { id, .. }
            | Request::Data { id, .. }
            | Request::Disconnect { id }
            | Request::ShutdownWrite { id } => id,
        }
    }
}

impl Response {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Response::Connected { id } => {
                buf.put_u8(RESP_CONNECTED);
                put_id(&mut buf, id);
            }
            Response::Data { id, payload } => {
                buf.put_u8(RESP_DATA);
                put_id(&mut buf, id);
                buf.put_u32(payload.len() as u32);
                buf.put_slice(payload);
            }
            Response::Disconnected { id } => {
                buf.put_u8(RESP_DISCONNECTED);
                put_id(&mut buf, id);
            }
            Response::Error { id, message } => {
                buf.put_u8(RESP_ERROR);
                put_id(&mut buf, id);
                buf.put_u16(message.len() as u16);
                buf.put_slice(message.as_bytes());
            }
        }
        buf.freeze()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut src = Bytes::copy_from_slice(bytes);
        if src.is_empty() {
            return Err(TunnelError::MalformedFrame("empty frame".into()));
        }
        let tag = src.get_u8();
        let id = take_id(&mut src)?;
        match tag {
            RESP_CONNECTED => Ok(Response::Connected { id }),
            RESP_DATA => {
                if src.len() < 4 {
                    return Err(TunnelError::MalformedFrame("missing payload_len".into()));
                }
                let payload_len = src.get_u32() as usize;
                if src.len() < payload_len {
                    return Err(TunnelError::MalformedFrame("truncated payload".into()));
                }
                let payload = src.split_to(payload_len);
                Ok(Response::Data { id, payload })
            }
            RESP_DISCONNECTED => Ok(Response::Disconnected { id }),
            RESP_ERROR => {
                if src.len() < 2 {
                    return Err(TunnelError::MalformedFrame("missing msg_len".into()));
                }
                let msg_len = src.get_u16() as usize;
                let message = take_string(&mut src, msg_len)?;
                Ok(Response::Error { id, message })
            }
            other => Err(TunnelError::MalformedFrame(format!(
                "unknown response tag {other:#x}"
            ))),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Response::Connected { id }
            | Response::Data { id, .. }
            | Response::Disconnected { id }
            | Response::Error { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_round_trip() {
        let req = Request::Connect {
            id: "10.0.0.2:51000-93.184.216.34:443".into(),
            dest_ip: "93.184.216.34".into(),
            dest_port: 443,
        };
        let encoded = req.encode();
        assert_eq!(Request::decode(&encoded).unwrap(), req);
    }

    #[test]
    fn data_round_trip_empty_id() {
        let req = Request::Data {
            id: String::new(),
            payload: Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"),
        };
        let encoded = req.encode();
        assert_eq!(Request::decode(&encoded).unwrap(), req);
    }

    #[test]
    fn disconnect_and_shutdown_write_round_trip() {
        for req in [
            Request::Disconnect { id: "flow-1".into() },
            Request::ShutdownWrite { id: "flow-1".into() },
        ] {
            let encoded = req.encode();
            assert_eq!(Request::decode(&encoded).unwrap(), req);
        }
    }

    #[test]
    fn response_round_trip() {
        for resp in [
            Response::Connected { id: "flow-1".into() },
            Response::Data {
                id: "flow-1".into(),
                payload: Bytes::from_static(&[0u8; 4096]),
            },
            Response::Disconnected { id: "flow-1".into() },
            Response::Error {
                id: "flow-1".into(),
                message: "unknown connection".into(),
            },
        ] {
            let encoded = resp.encode();
            assert_eq!(Response::decode(&encoded).unwrap(), resp);
        }
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let req = Request::Data {
            id: "flow-1".into(),
            payload: Bytes::from_static(b"hello"),
        };
        let mut encoded = req.encode().to_vec();
        encoded.truncate(encoded.len() - 2);
        assert!(matches!(
            Request::decode(&encoded),
            Err(TunnelError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xff);
        buf.put_u16(0);
        assert!(matches!(
            Request::decode(&buf),
            Err(TunnelError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_rejects_empty_buffer() {
        assert!(matches!(
            Response::decode(&[]),
            Err(TunnelError::MalformedFrame(_))
        ));
    }
}
