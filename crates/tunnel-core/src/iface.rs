//! Virtual network interface (external collaborator boundary, §6)
//!
//! The interface itself — opening the TUN device, configuring its address
//! and route, and exempting a socket from the tunnel's own routing — is an
//! OS call the specification treats as an external collaborator. This
//! module owns exactly the two contracted operations: blocking reads of
//! complete IPv4 datagrams and blocking writes of complete IPv4 datagrams,
//! serialized behind a single write lock as required by §5.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{Result, TunnelError};
use crate::synth::SegmentWriter;

pub const TUNNEL_ADDRESS: &str = "10.0.0.2";
pub const TUNNEL_NETMASK: &str = "255.255.255.0";
const READ_BUF_SIZE: usize = 32_768;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, FromRawFd};
    use tun::platform::Device;

    /// Opens and configures the TUN device at `10.0.0.2/24` with the
    /// default route pointed through it.
    pub fn open(name: &str) -> Result<Device> {
        let mut config = tun::Configuration::default();
        config
            .name(name)
            .address(TUNNEL_ADDRESS)
            .netmask(TUNNEL_NETMASK)
            .up();
        config.platform(|platform_config| {
            platform_config.packet_information(false);
        });
        tun::create(&config)
            .map_err(|e| TunnelError::InvalidConfig(format!("failed to open tun device: {e}")))
    }

    /// Duplicates the device's file descriptor into an independent handle.
    /// A TUN fd supports concurrent reads and writes; calling this twice
    /// gives the interface one handle to block reads on and a separate one
    /// to write through, so neither direction stalls the other.
    pub fn dup_handle(device: &Device) -> Result<File> {
        let fd = device.as_raw_fd();
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(TunnelError::InvalidConfig(format!(
                "failed to duplicate tun fd: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(unsafe { File::from_raw_fd(dup_fd) })
    }

    pub fn read_packet(handle: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
        handle.read(buf)
    }

    pub fn write_packet(handle: &mut File, data: &[u8]) -> std::io::Result<usize> {
        handle.write(data)
    }
}

#[cfg(target_os = "linux")]
type PlatformHandle = std::fs::File;
#[cfg(not(target_os = "linux"))]
type PlatformHandle = ();

/// The tunnel's virtual interface. Reads and writes go through independent
/// duplicated handles onto the same underlying TUN fd, so a blocking read
/// waiting for the next inbound datagram never holds up an outbound write.
pub struct VirtualInterface {
    read_handle: Arc<std::sync::Mutex<PlatformHandle>>,
    write_handle: Arc<std::sync::Mutex<PlatformHandle>>,
    #[cfg(target_os = "linux")]
    _device: tun::platform::Device,
}

impl VirtualInterface {
    #[cfg(target_os = "linux")]
    pub fn open(name: &str) -> Result<Self> {
        let device = linux::open(name)?;
        let read_handle = linux::dup_handle(&device)?;
        let write_handle = linux::dup_handle(&device)?;
        Ok(VirtualInterface {
            read_handle: Arc::new(std::sync::Mutex::new(read_handle)),
            write_handle: Arc::new(std::sync::Mutex::new(write_handle)),
            _device: device,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn open(_name: &str) -> Result<Self> {
        Err(TunnelError::InvalidConfig(
            "virtual interface is only available on Linux".into(),
        ))
    }

    /// Blocks on the device until one complete IPv4 datagram is read, or
    /// returns `Ok(None)` on EOF/interruption signalling the loop should stop.
    #[cfg(target_os = "linux")]
    pub async fn read_packet(&self) -> Result<Option<Bytes>> {
        let handle = self.read_handle.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; READ_BUF_SIZE];
            let mut guard = handle.lock().unwrap();
            match linux::read_packet(&mut guard, &mut buf) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buf.truncate(n);
                    Ok(Some(Bytes::from(buf)))
                }
                Err(e) => Err(TunnelError::NetworkError(e)),
            }
        })
        .await
        .map_err(|e| TunnelError::Internal(e.to_string()))?
    }

    #[cfg(not(target_os = "linux"))]
    pub async fn read_packet(&self) -> Result<Option<Bytes>> {
        Ok(None)
    }

    #[cfg(target_os = "linux")]
    fn write_packet_blocking(&self, data: Bytes) -> Result<()> {
        let mut guard = self.write_handle.lock().unwrap();
        linux::write_packet(&mut guard, &data).map_err(|e| TunnelError::InterfaceWriteFailed(e.to_string()))?;
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn write_packet_blocking(&self, _data: Bytes) -> Result<()> {
        Err(TunnelError::InterfaceWriteFailed(
            "virtual interface is only available on Linux".into(),
        ))
    }
}

/// `write_segment` takes `&Mutex<()>` as the write-serialization point:
/// the synthesizer and the relay-response handler both call through
/// `VirtualInterface::write_segment`, but the OS device itself is only
/// ever touched from a blocking task, one at a time.
pub struct SerializedInterface {
    iface: Arc<VirtualInterface>,
    write_lock: Mutex<()>,
}

impl SerializedInterface {
    pub fn new(iface: Arc<VirtualInterface>) -> Self {
        SerializedInterface {
            iface,
            write_lock: Mutex::new(()),
        }
    }

    pub fn iface(&self) -> &Arc<VirtualInterface> {
        &self.iface
    }
}

#[async_trait]
impl SegmentWriter for SerializedInterface {
    async fn write_segment(&self, segment: Bytes) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let iface = self.iface.clone();
        tokio::task::spawn_blocking(move || iface.write_packet_blocking(segment))
            .await
            .map_err(|e| TunnelError::Internal(e.to_string()))?
    }
}

/// Marks a TCP socket's traffic as exempt from the tunnel's own capture,
/// so the relay channel itself does not loop back through the virtual
/// interface. The mechanism is platform-specific (SO_MARK / a bound
/// routing table on Linux); callers apply it to the socket underlying the
/// relay channel before it connects.
#[cfg(target_os = "linux")]
pub fn exempt_from_tunnel(socket: &tokio::net::TcpSocket) -> Result<()> {
    use std::os::fd::AsRawFd;
    const SO_MARK: libc::c_int = 36;
    let fd = socket.as_raw_fd();
    let mark: libc::c_int = 0xCAFE;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            SO_MARK,
            &mark as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(error = %std::io::Error::last_os_error(), "failed to mark relay socket as non-tunneled");
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn exempt_from_tunnel(_socket: &tokio::net::TcpSocket) -> Result<()> {
    Ok(())
}
