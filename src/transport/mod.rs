/// Transport module for the TURN relay
///
/// This module provides:
/// - The `PacketConn` abstraction shared by the listening socket and relay sockets
/// - The injected `RelayConnFactory` used to obtain a relay socket per allocation
/// - A UDP factory binding relay sockets inside a configured port range
use crate::config::ServerConfig;
use async_trait::async_trait;
use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Maximum size for STUN/TURN datagrams
pub const MAX_MESSAGE_SIZE: usize = 65535;

// Bound on random port probes before giving up
const MAX_BIND_ATTEMPTS: usize = 64;

/// A datagram socket
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Sends one datagram to `target`
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Waits until the socket may accept a datagram
    async fn writable(&self) -> io::Result<()>;

    /// Sends one datagram without waiting, failing with `WouldBlock` when
    /// the socket is not ready
    fn try_send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receives one datagram and its sender
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// The local address the socket is bound on
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

fn check_size(data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Message too large (max size: {} bytes)", MAX_MESSAGE_SIZE),
        ));
    }
    Ok(())
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        check_size(data)?;
        UdpSocket::send_to(self, data, target).await
    }

    async fn writable(&self) -> io::Result<()> {
        UdpSocket::writable(self).await
    }

    fn try_send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        check_size(data)?;
        UdpSocket::try_send_to(self, data, target)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Produces the relay socket owned by a new allocation
#[async_trait]
pub trait RelayConnFactory: Send + Sync {
    async fn allocate_conn(&self, username: &str, realm: &str) -> io::Result<Arc<dyn PacketConn>>;
}

/// Binds UDP relay sockets on a fixed address within a port range
#[derive(Debug, Clone)]
pub struct UdpRelayFactory {
    address: IpAddr,
    min_port: u16,
    max_port: u16,
}

impl UdpRelayFactory {
    pub fn new(address: IpAddr, min_port: u16, max_port: u16) -> Self {
        Self {
            address,
            min_port,
            max_port,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.turn.relay_address, config.turn.min_port, config.turn.max_port)
    }
}

#[async_trait]
impl RelayConnFactory for UdpRelayFactory {
    async fn allocate_conn(&self, username: &str, realm: &str) -> io::Result<Arc<dyn PacketConn>> {
        let mut last_error = None;

        for _ in 0..MAX_BIND_ATTEMPTS {
            // Generate a port inside the configured range
            let port = rand::thread_rng().gen_range(self.min_port..=self.max_port);
            match UdpSocket::bind(SocketAddr::new(self.address, port)).await {
                Ok(socket) => {
                    log::debug!(
                        "Bound relay socket {} for '{}' in {}",
                        socket.local_addr()?,
                        username,
                        realm
                    );
                    return Ok(Arc::new(socket));
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "relay port range exhausted")
        }))
    }
}
