//! Tunnel Core Library
//!
//! Provides the Tunnel Endpoint side of a split-tunnel TCP relay: a
//! userspace TCP synthesizer that answers a client application's SYNs
//! locally and forwards each flow's payload across a persistent relay
//! channel to a Relay Host, which owns the real outbound sockets.

pub mod endpoint;
pub mod error;
pub mod flow;
pub mod frame;
pub mod iface;
pub mod packet;
pub mod relay_client;
pub mod synth;

pub use error::{Result, TunnelError};
