//! Bare datagram echo, the baseline the WebRTC numbers are compared against.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tracing::{debug, info};

const MAX_DATAGRAM: usize = 65_535;

pub struct UdpEcho {
    socket: UdpSocket,
}

impl UdpEcho {
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(target = "udp_echo", addr = %socket.local_addr()?, "udp echo listening");
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Echoes every datagram to its sender until the task is dropped.
    pub async fn run(self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    // ICMP port-unreachable from a vanished peer surfaces here on some platforms.
                    debug!(target = "udp_echo", error = %err, "recv failed");
                    continue;
                }
            };
            if let Err(err) = self.socket.send_to(&buf[..len], peer).await {
                debug!(target = "udp_echo", peer = %peer, error = %err, "send failed");
            }
        }
    }
}
