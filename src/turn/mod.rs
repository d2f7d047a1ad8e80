//! TURN Relay Implementation (RFC 5766)
//!
//! This module implements the relay engine:
//! - Datagram demultiplexing and dispatch
//! - Allocation lifecycle and relay sockets
//! - Permission handling
//! - Channel binding
//! - Throttled logging of escalated failures

mod allocation;
mod channel;
mod dispatch;
mod handlers;
mod message;
mod permission;
mod request;

#[cfg(test)]
mod test_util;

pub use allocation::{Allocation, AllocationManager, TransactionId};
pub use channel::ChannelData;
pub use dispatch::{Class, Method};

use dispatch::Dispatcher;
use request::{handle_request, RelayContext, Request};

use crate::auth::{AuthHandler, NonceAuthority, StaticCredentials};
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::transport::{PacketConn, RelayConnFactory, UdpRelayFactory};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// A TURN relay serving one listening socket.
///
/// Every received datagram is handled on its own task, so a slow relay
/// socket bind for one client never stalls the others.
pub struct TurnServer {
    conn: Arc<dyn PacketConn>,
    local_addr: SocketAddr,
    context: Arc<RelayContext>,
    config: Arc<ServerConfig>,
    rate_limiter: Arc<RateLimiter>,
    shutdown: watch::Sender<bool>,
}

impl TurnServer {
    /// Creates a relay listening on the configured address, with static
    /// credentials and UDP relay sockets.
    ///
    /// # Errors
    /// Returns error if:
    /// - The configuration is invalid
    /// - Unable to bind to the configured address
    pub async fn new(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let socket = UdpSocket::bind(config.get_bind_address()).await?;

        Self::with_collaborators(
            config,
            Arc::new(socket),
            Arc::new(StaticCredentials::from_config(&config.auth)?),
            Arc::new(UdpRelayFactory::from_config(config)),
        )
    }

    /// Creates a relay over an existing listening socket, credential
    /// backend and relay socket factory
    pub fn with_collaborators(
        config: &ServerConfig,
        conn: Arc<dyn PacketConn>,
        auth: Arc<dyn AuthHandler>,
        factory: Arc<dyn RelayConnFactory>,
    ) -> Result<Self> {
        // Surface a broken dispatch table at startup rather than on first datagram
        Dispatcher::global();

        let local_addr = conn.local_addr()?;
        let context = RelayContext {
            allocations: AllocationManager::new(config, factory),
            nonces: NonceAuthority::new(config.get_nonce_timeout()),
            auth,
            realm: config.get_realm().to_string(),
            default_lifetime: config.get_allocation_lifetime(),
            max_lifetime: config.get_max_allocation_lifetime(),
            denied_peers: config.get_denied_peer_ranges()?,
        };
        let rate_limiter = RateLimiter::new(
            config.logging.error_log_limit,
            config.logging.error_log_window,
        );
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            conn,
            local_addr,
            context: Arc::new(context),
            config: Arc::new(config.clone()),
            rate_limiter: Arc::new(rate_limiter),
            shutdown,
        })
    }

    /// Address of the listening socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn allocations(&self) -> &AllocationManager {
        &self.context.allocations
    }

    /// Receives and handles datagrams until [`TurnServer::close`] is called.
    ///
    /// Expired allocations are swept on the configured cleanup interval.
    ///
    /// # Returns
    /// Returns error if the listening socket fails
    pub async fn run(&self) -> Result<()> {
        log::info!("TURN relay running on {}", self.local_addr);

        let mut cleanup_timer = tokio::time::interval(self.config.get_cleanup_interval());
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = vec![0u8; self.config.get_buffer_size()];

        while !*shutdown.borrow() {
            tokio::select! {
                received = self.conn.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src_addr)) => self.spawn_request(buf[..len].to_vec(), src_addr),
                        // ICMP errors from earlier sends surface here on some platforms
                        Err(e) if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                        ) => {
                            log::debug!("Ignoring receive error on {}: {}", self.local_addr, e);
                        }
                        Err(e) => {
                            log::error!("Receive failed on {}: {}", self.local_addr, e);
                            return Err(Error::Io(e));
                        }
                    }
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup().await;
                }
                _ = shutdown.changed() => {}
            }
        }

        log::info!("TURN relay on {} stopped", self.local_addr);
        Ok(())
    }

    /// Stops [`TurnServer::run`] and closes every allocation
    pub fn close(&self) {
        self.shutdown.send_replace(true);
        self.context.allocations.close_all();
    }

    /// Returns statistics about error log throttling
    pub async fn get_rate_limit_stats(&self) -> RateLimitStats {
        self.rate_limiter.get_stats().await
    }

    fn spawn_request(&self, raw: Vec<u8>, src_addr: SocketAddr) {
        let request = Request {
            conn: Arc::clone(&self.conn),
            local_addr: self.local_addr,
            src_addr,
            raw,
            context: Arc::clone(&self.context),
        };
        let rate_limiter = Arc::clone(&self.rate_limiter);

        tokio::spawn(async move {
            if let Err(e) = handle_request(request).await {
                if rate_limiter.allow(src_addr.ip()).await {
                    log::warn!("Failed to handle datagram from {}: {}", src_addr, e);
                }
            }
        });
    }

    async fn cleanup(&self) {
        let removed = self.context.allocations.cleanup_expired();
        if removed > 0 {
            log::debug!("Swept {} expired allocations", removed);
        }
        self.rate_limiter.cleanup().await;
    }
}

impl Drop for TurnServer {
    fn drop(&mut self) {
        self.close();
    }
}
