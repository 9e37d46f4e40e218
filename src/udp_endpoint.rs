//! Thin wrapper around a connected `tokio::net::UdpSocket` (§4.2).
//!
//! Each of the three sessions (Control/CI-V/Audio) owns one `UdpEndpoint`
//! bound to an ephemeral local port and `connect()`-ed to the radio's
//! per-session remote port, so `send`/`recv` never need to carry or check
//! a peer address.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{RadioError, Result};

/// Datagrams larger than this are rejected before being handed to the
/// codec; the protocol's largest fixed packet (Capabilities) is 0xA8
/// bytes and audio frames cap at `codec::AUDIO_MAX_PAYLOAD` + header.
pub const MAX_DATAGRAM_SIZE: usize = 2100;

pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    remote_addr: Mutex<SocketAddr>,
}

impl UdpEndpoint {
    /// Bind an ephemeral local socket and connect it to `remote_addr`.
    pub async fn connect(remote_addr: SocketAddr, recv_buf_size: usize) -> Result<Self> {
        let bind_addr: SocketAddr = if remote_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse().unwrap();
        let socket = bind_tuned(bind_addr, recv_buf_size)?;
        socket.connect(remote_addr).await?;
        let local_addr = socket.local_addr()?;
        debug!(%local_addr, %remote_addr, "udp endpoint connected");
        Ok(UdpEndpoint { socket, local_addr, remote_addr: Mutex::new(remote_addr) })
    }

    /// Bind a local socket without connecting it to any peer yet. Used for
    /// the CI-V/Audio sub-session sockets, whose remote port isn't known
    /// until the radio reports it in `Status` — the local port must still
    /// exist earlier, to answer `ConnInfo` during the handshake.
    pub async fn bind_unconnected(bind_host: &str, recv_buf_size: usize) -> Result<Self> {
        let bind_addr: SocketAddr = format!("{bind_host}:0")
            .parse()
            .map_err(|_| RadioError::Protocol(format!("invalid bind host {bind_host}")))?;
        let socket = bind_tuned(bind_addr, recv_buf_size)?;
        let local_addr = socket.local_addr()?;
        let unspecified: SocketAddr = if local_addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse().unwrap();
        debug!(%local_addr, "udp endpoint bound, unconnected");
        Ok(UdpEndpoint { socket, local_addr, remote_addr: Mutex::new(unspecified) })
    }

    /// Connect (or reconnect) this already-bound socket to `addr`, once the
    /// radio's dynamic sub-session port is known.
    pub async fn set_remote(&self, addr: SocketAddr) -> Result<()> {
        self.socket.connect(addr).await?;
        *self.remote_addr.lock().unwrap() = addr;
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        *self.remote_addr.lock().unwrap()
    }

    pub async fn send(&self, buf: &[u8]) -> Result<()> {
        self.socket.send(buf).await?;
        Ok(())
    }

    /// Receive one datagram, oversized datagrams are reported as a
    /// protocol error rather than silently truncated.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.socket.recv(buf).await?;
        if n == buf.len() && buf.len() < MAX_DATAGRAM_SIZE {
            // Can't happen with a buffer sized >= MAX_DATAGRAM_SIZE; kept
            // as a guard in case a caller passes a smaller scratch buffer.
            return Err(RadioError::Protocol("datagram filled receive buffer".into()));
        }
        Ok(n)
    }
}

fn bind_tuned(addr: SocketAddr, recv_buf_size: usize) -> Result<UdpSocket> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_recv_buffer_size(recv_buf_size)?;
    socket.bind(&addr.into())?;
    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}
