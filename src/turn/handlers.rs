//! TURN protocol handlers (RFC 5766 Sections 6 to 11)
//!
//! Each handler answers a request with exactly one response datagram and
//! returns the outcome. Indications are never answered. A handler that
//! rejects a request sends the error response first and then returns the
//! error, so that the caller can decide separately whether to log it.

use crate::auth::NonceValidity;
use crate::error::{Error, Result};
use crate::turn::dispatch::Handler;
use crate::turn::message;
use crate::turn::request::Request;
use crate::types::ChannelNumber;
use std::net::SocketAddr;
use std::time::Duration;
use stun_rs::attributes::stun::{MessageIntegrity, Nonce, Realm, UserName, XorMappedAddress};
use stun_rs::attributes::turn::{
    ChannelNumber as ChannelNumberAttribute, Data, LifeTime, RequestedTrasport, XorPeerAddress,
    XorRelayedAddress,
};
use stun_rs::protocols::UDP;
use stun_rs::{DecoderContextBuilder, HMACKey, MessageDecoderBuilder, StunMessage};

/// Credentials of an authenticated request
struct Credentials {
    username: String,
    realm: String,
    key: HMACKey,
}

/// Runs the handler selected by the dispatcher
pub async fn handle(handler: Handler, request: &Request, message: &StunMessage) -> Result<()> {
    match handler {
        Handler::Allocate => handle_allocate(request, message).await,
        Handler::Refresh => handle_refresh(request, message).await,
        Handler::CreatePermission => handle_create_permission(request, message).await,
        Handler::ChannelBind => handle_channel_bind(request, message).await,
        Handler::Binding => handle_binding(request, message).await,
        Handler::SendIndication => handle_send_indication(request, message).await,
    }
}

/// Sends the error response matching `error`, then fails with it
async fn reject<T>(request: &Request, message: &StunMessage, error: Error) -> Result<T> {
    let response = message::error(
        message,
        error.to_stun_error_code(),
        error.to_stun_error_message(),
        vec![],
    )?;
    request.reply(&response).await?;
    Err(error)
}

/// Long-term credential check (RFC 5389 Section 10.2)
///
/// # Returns
/// * `Ok(Some(credentials))` - The request is authenticated
/// * `Ok(None)` - A 401 or 438 challenge was sent; the client retries
/// * `Err(Error)` - The request was rejected with an error response
async fn authenticate(request: &Request, message: &StunMessage) -> Result<Option<Credentials>> {
    let context = &request.context;

    if message.get::<MessageIntegrity>().is_none() {
        let nonce = context.nonces.issue(request.src_addr);
        let challenge = message::challenge(message, 401, &nonce, &context.realm)?;
        request.reply(&challenge).await?;
        return Ok(None);
    }

    let nonce = message
        .get::<Nonce>()
        .and_then(|attr| attr.as_nonce().ok())
        .map(|nonce| AsRef::<str>::as_ref(nonce));
    let Some(nonce) = nonce else {
        return reject(request, message, Error::BadRequest("missing NONCE".into())).await;
    };

    match context.nonces.validate(nonce, request.src_addr) {
        NonceValidity::Fresh => {}
        validity => {
            log::debug!("{:?} nonce from {}, challenging again", validity, request.src_addr);
            let nonce = context.nonces.issue(request.src_addr);
            let challenge = message::challenge(message, 438, &nonce, &context.realm)?;
            request.reply(&challenge).await?;
            return Ok(None);
        }
    }

    let realm = message
        .get::<Realm>()
        .and_then(|attr| attr.as_realm().ok())
        .map(|realm| AsRef::<str>::as_ref(realm));
    let username = message
        .get::<UserName>()
        .and_then(|attr| attr.as_user_name().ok())
        .map(|username| AsRef::<str>::as_ref(username));
    let (Some(realm), Some(username)) = (realm, username) else {
        return reject(request, message, Error::BadRequest("missing REALM or USERNAME".into())).await;
    };

    let Some(key) = context.auth.authenticate(username, realm, request.src_addr) else {
        return reject(request, message, Error::NoSuchUser(username.to_string())).await;
    };

    if !integrity_holds(&request.raw, &key) {
        return reject(request, message, Error::IntegrityCheckFailed).await;
    }

    Ok(Some(Credentials {
        username: username.to_string(),
        realm: realm.to_string(),
        key,
    }))
}

// Decodes the request again, this time validating MESSAGE-INTEGRITY with `key`
fn integrity_holds(raw: &[u8], key: &HMACKey) -> bool {
    let context = DecoderContextBuilder::default()
        .with_key(key.clone())
        .with_validation()
        .build();
    MessageDecoderBuilder::default()
        .with_context(context)
        .build()
        .decode(raw)
        .is_ok()
}

fn requested_lifetime(message: &StunMessage) -> Option<Duration> {
    message
        .get::<LifeTime>()
        .and_then(|lifetime| lifetime.as_life_time().ok())
        .map(|lifetime| Duration::from_secs(lifetime.as_u32() as u64))
}

fn peer_address(message: &StunMessage) -> Option<SocketAddr> {
    message
        .get::<XorPeerAddress>()
        .and_then(|attr| attr.as_xor_peer_address().ok())
        .map(|peer| *peer.socket_address())
}

fn lifetime_seconds(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}

/// Allocate (RFC 5766 Section 6.2)
async fn handle_allocate(request: &Request, message: &StunMessage) -> Result<()> {
    let Some(credentials) = authenticate(request, message).await? else {
        return Ok(());
    };
    let context = &request.context;
    let five_tuple = request.five_tuple();

    if let Some(existing) = context.allocations.get_allocation(&five_tuple) {
        return match existing.cached_response(&request.transaction_id()) {
            Some(response) => {
                log::debug!("Retransmitting Allocate response to {}", request.src_addr);
                request.reply(&response).await
            }
            None => reject(request, message, Error::FiveTupleConflict).await,
        };
    }

    let transport = message
        .get::<RequestedTrasport>()
        .and_then(|attr| attr.as_requested_trasport().ok())
        .map(|transport| transport.protocol());
    match transport {
        Some(protocol) if protocol == UDP => {}
        Some(protocol) => {
            return reject(request, message, Error::UnsupportedTransport(protocol.as_u8())).await;
        }
        None => {
            return reject(
                request,
                message,
                Error::BadRequest("missing REQUESTED-TRANSPORT".into()),
            )
            .await;
        }
    }

    let lifetime = requested_lifetime(message)
        .filter(|lifetime| !lifetime.is_zero())
        .map_or(context.default_lifetime, |lifetime| lifetime.min(context.max_lifetime));

    let allocation = match context
        .allocations
        .create_allocation(
            five_tuple,
            &credentials.username,
            &credentials.realm,
            lifetime,
            request.conn.clone(),
        )
        .await
    {
        Ok(allocation) => allocation,
        Err(e) => return reject(request, message, e).await,
    };

    let response = message::success(
        message,
        vec![
            XorRelayedAddress::from(allocation.relay_addr()).into(),
            LifeTime::new(lifetime_seconds(lifetime)).into(),
            XorMappedAddress::from(request.src_addr).into(),
        ],
        Some(&credentials.key),
    )?;
    allocation.cache_response(request.transaction_id(), response.clone());
    request.reply(&response).await
}

/// Refresh (RFC 5766 Section 7.2)
async fn handle_refresh(request: &Request, message: &StunMessage) -> Result<()> {
    let Some(credentials) = authenticate(request, message).await? else {
        return Ok(());
    };
    let context = &request.context;

    let lifetime = requested_lifetime(message).unwrap_or(context.default_lifetime);
    let granted = match context
        .allocations
        .refresh_allocation(&request.five_tuple(), lifetime)
    {
        Ok(granted) => granted,
        Err(e) => return reject(request, message, e).await,
    };

    let response = message::success(
        message,
        vec![LifeTime::new(lifetime_seconds(granted)).into()],
        Some(&credentials.key),
    )?;
    request.reply(&response).await
}

/// CreatePermission (RFC 5766 Section 9.2)
async fn handle_create_permission(request: &Request, message: &StunMessage) -> Result<()> {
    let Some(credentials) = authenticate(request, message).await? else {
        return Ok(());
    };
    let context = &request.context;
    let five_tuple = request.five_tuple();

    if context.allocations.get_allocation(&five_tuple).is_none() {
        return reject(request, message, Error::NoAllocationFound).await;
    }

    let peers: Vec<SocketAddr> = message
        .attributes()
        .iter()
        .filter_map(|attr| attr.as_xor_peer_address().ok())
        .map(|peer| *peer.socket_address())
        .collect();
    if peers.is_empty() {
        return reject(
            request,
            message,
            Error::BadRequest("missing XOR-PEER-ADDRESS".into()),
        )
        .await;
    }
    if let Some(denied) = peers.iter().find(|peer| context.is_denied(peer.ip())) {
        return reject(request, message, Error::PeerForbidden(denied.ip())).await;
    }

    for peer in &peers {
        if let Err(e) = context.allocations.create_permission(&five_tuple, peer.ip()) {
            return reject(request, message, e).await;
        }
        log::debug!("Permission for {} on {}", peer.ip(), five_tuple);
    }

    let response = message::success(message, vec![], Some(&credentials.key))?;
    request.reply(&response).await
}

/// ChannelBind (RFC 5766 Section 11.2)
async fn handle_channel_bind(request: &Request, message: &StunMessage) -> Result<()> {
    let Some(credentials) = authenticate(request, message).await? else {
        return Ok(());
    };
    let context = &request.context;

    let number = message
        .get::<ChannelNumberAttribute>()
        .and_then(|attr| attr.as_channel_number().ok())
        .map(|number| number.number());
    let (Some(number), Some(peer)) = (number, peer_address(message)) else {
        return reject(
            request,
            message,
            Error::BadRequest("missing CHANNEL-NUMBER or XOR-PEER-ADDRESS".into()),
        )
        .await;
    };
    let Some(number) = ChannelNumber::new(number) else {
        return reject(request, message, Error::InvalidChannelNumber(number)).await;
    };
    if context.is_denied(peer.ip()) {
        return reject(request, message, Error::PeerForbidden(peer.ip())).await;
    }

    if let Err(e) = context
        .allocations
        .bind_channel(&request.five_tuple(), number, peer)
    {
        return reject(request, message, e).await;
    }
    log::debug!("Channel {} bound to {} for {}", number, peer, request.src_addr);

    let response = message::success(message, vec![], Some(&credentials.key))?;
    request.reply(&response).await
}

/// Binding (RFC 5389 Section 7.3.1)
async fn handle_binding(request: &Request, message: &StunMessage) -> Result<()> {
    let response = message::success(
        message,
        vec![XorMappedAddress::from(request.src_addr).into()],
        None,
    )?;
    request.reply(&response).await
}

/// Send indication (RFC 5766 Section 10.2), never answered
async fn handle_send_indication(request: &Request, message: &StunMessage) -> Result<()> {
    let payload = message
        .get::<Data>()
        .and_then(|attr| attr.as_data().ok())
        .map(|data| AsRef::<[u8]>::as_ref(data));
    let (Some(payload), Some(peer)) = (payload, peer_address(message)) else {
        return Err(Error::BadRequest(
            "Send indication without DATA or XOR-PEER-ADDRESS".into(),
        ));
    };

    request
        .context
        .allocations
        .forward(&request.five_tuple(), peer, payload)
        .await
}
