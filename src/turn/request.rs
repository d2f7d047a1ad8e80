//! Per-datagram entry point
//!
//! Every datagram is classified as channel data or a STUN control message,
//! decoded, dispatched to its handler, and the outcome is classified:
//! routine failures are swallowed here, everything else is returned to the
//! server loop with the request context attached.

use crate::auth::{AuthHandler, NonceAuthority};
use crate::error::{Error, Result};
use crate::transport::PacketConn;
use crate::turn::allocation::{AllocationManager, TransactionId};
use crate::turn::channel::ChannelData;
use crate::turn::dispatch::{Class, Dispatcher, Method};
use crate::turn::handlers;
use crate::types::FiveTuple;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use stun_rs::{DecoderContextBuilder, MessageDecoderBuilder, StunMessage};

/// State shared by every request
pub struct RelayContext {
    pub allocations: AllocationManager,
    pub nonces: NonceAuthority,
    pub auth: Arc<dyn AuthHandler>,
    pub realm: String,
    /// Lifetime granted when Allocate or Refresh carries no LIFETIME
    pub default_lifetime: Duration,
    /// Upper bound on any granted lifetime
    pub max_lifetime: Duration,
    pub denied_peers: Vec<IpNetwork>,
}

impl RelayContext {
    /// Whether a peer IP falls into a denied range
    pub fn is_denied(&self, ip: IpAddr) -> bool {
        self.denied_peers.iter().any(|range| range.contains(ip))
    }
}

/// A single datagram and everything needed to handle it
pub struct Request {
    pub conn: Arc<dyn PacketConn>,
    /// Address the datagram arrived on
    pub local_addr: SocketAddr,
    pub src_addr: SocketAddr,
    pub raw: Vec<u8>,
    pub context: Arc<RelayContext>,
}

impl Request {
    /// The 5-tuple keying the client's allocation
    pub fn five_tuple(&self) -> FiveTuple {
        FiveTuple::udp(self.src_addr, self.local_addr)
    }

    /// Transaction id of a decoded control message
    pub fn transaction_id(&self) -> TransactionId {
        let mut id = TransactionId::default();
        if let Some(raw) = self.raw.get(8..20) {
            id.copy_from_slice(raw);
        }
        id
    }

    /// Sends a datagram back to the requester
    pub async fn reply(&self, bytes: &[u8]) -> Result<()> {
        self.conn.send_to(bytes, self.src_addr).await?;
        Ok(())
    }
}

/// Handles one datagram.
///
/// Returns `Ok` for handled and suppressed outcomes; any error returned must
/// be surfaced to the operator.
pub async fn handle_request(request: Request) -> Result<()> {
    log::debug!(
        "Received {} bytes from {} on {}",
        request.raw.len(),
        request.src_addr,
        request.local_addr
    );

    if ChannelData::is_channel_data(&request.raw) {
        return handle_channel_data(&request).await;
    }
    handle_message(&request).await
}

async fn handle_channel_data(request: &Request) -> Result<()> {
    let data = ChannelData::decode(&request.raw)?;

    let outcome = request
        .context
        .allocations
        .forward_channel_data(&request.five_tuple(), data.number, data.payload)
        .await;

    match outcome {
        Err(e @ (Error::NoAllocationFound | Error::NoChannelBinding(_))) => {
            log::debug!("Dropping channel data from {}: {}", request.src_addr, e);
            Ok(())
        }
        other => other,
    }
}

async fn handle_message(request: &Request) -> Result<()> {
    let decoder = MessageDecoderBuilder::default()
        .with_context(DecoderContextBuilder::default().build())
        .build();
    let (message, _) = decoder.decode(&request.raw)?;

    let handler = Dispatcher::global().resolve(message.class(), message.method())?;
    let outcome = handlers::handle(handler, request, &message).await;

    classify(outcome, request, &message)
}

// Swallows routine failures and attaches the request context to the rest
fn classify(outcome: Result<()>, request: &Request, message: &StunMessage) -> Result<()> {
    match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_suppressed() => {
            log::debug!("Suppressed failure for {}: {}", request.src_addr, e);
            Ok(())
        }
        Err(e) => {
            let method = Method::from_stun(&message.method());
            match method {
                Some(method) => Err(Error::handling(
                    method,
                    Class::from(&message.class()),
                    request.src_addr,
                    e,
                )),
                None => Err(e),
            }
        }
    }
}
