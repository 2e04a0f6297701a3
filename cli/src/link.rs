// Non-blocking UDP socket as an SM network link

use anyhow::{Context, Result};
use cloudlink_core::{NetworkLink, NetworkStatus};
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use tracing::{debug, error};

pub struct UdpLink {
    socket: UdpSocket,
    remote: SocketAddr,
}

impl UdpLink {
    /// Bind locally and only accept datagrams from `remote`.
    pub fn connect(bind: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind).with_context(|| format!("Failed to bind {}", bind))?;
        socket
            .connect(remote)
            .with_context(|| format!("Failed to connect to {}", remote))?;
        socket
            .set_nonblocking(true)
            .context("Failed to make socket non-blocking")?;
        Ok(Self { socket, remote })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Socket has no local address")
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl NetworkLink for UdpLink {
    fn receive(&self, buf: &mut [u8]) -> NetworkStatus {
        match self.socket.recv(buf) {
            Ok(len) => {
                debug!(len, from = %self.remote, "datagram received");
                NetworkStatus::Continue(len)
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => NetworkStatus::Busy,
            // ICMP port unreachable from the last send; the cloud may not be up yet
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => NetworkStatus::Busy,
            Err(e) => {
                error!(error = %e, "UDP receive failed");
                NetworkStatus::Abort
            }
        }
    }

    fn send(&self, datagram: &[u8]) -> std::result::Result<(), String> {
        match self.socket.send(datagram) {
            Ok(sent) if sent == datagram.len() => Ok(()),
            Ok(sent) => Err(format!("short send: {} of {} bytes", sent, datagram.len())),
            Err(e) => Err(e.to_string()),
        }
    }
}
