use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::warn;

use crate::raft::NodeAddr;

/// Largest payload a single datagram can carry.
pub const MAX_DATAGRAM: usize = 65536;

/// The cluster-facing UDP socket. Sends are best effort: a lost or failed
/// datagram is only logged, because the heartbeat cycle retransmits
/// anything that matters.
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind udp socket on 127.0.0.1:{}", port))?;
        Ok(UdpTransport { socket })
    }

    /// Awaits the next datagram, returning its length and sender.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    pub async fn send(&self, payload: &str, dest: &NodeAddr) {
        if let Err(e) = self
            .socket
            .send_to(payload.as_bytes(), (dest.host.as_str(), dest.port))
            .await
        {
            warn!(dest = %dest, "failed to send rpc: {}", e);
        }
    }
}
