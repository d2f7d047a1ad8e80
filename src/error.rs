//! Error types and handling for the TURN relay
//!
//! This module provides the error taxonomy of the request engine together
//! with the two independent policies applied to every outcome:
//! - which STUN error code (if any) the client is answered with
//! - whether the operator sees the failure (escalated) or not (suppressed)
//!
//! The error codes follow RFC 5389 and RFC 5766.

use crate::turn::{Class, Method};
use crate::types::ChannelNumber;
use std::io;
use std::net::{IpAddr, SocketAddr};
use stun_rs::error::StunDecodeError;
use stun_rs::error::StunEncodeError;
use stun_rs::StunError;
use thiserror::Error;

/// The main error type for the TURN relay
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from std::io
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed datagram, either framing
    #[error("Failed to decode datagram: {0}")]
    Decode(String),

    /// No handler is registered for the (class, method) pair
    #[error("Unhandled STUN packet {method}-{class}")]
    Dispatch { class: String, method: String },

    /// The 5-tuple has no live allocation
    #[error("No allocation found")]
    NoAllocationFound,

    /// The authentication lookup does not know the user
    #[error("No such user: {0}")]
    NoSuchUser(String),

    /// Channel data arrived on a number without a live binding
    #[error("No channel binding for {0}")]
    NoChannelBinding(ChannelNumber),

    /// Resource limits prevent a new allocation
    #[error("Allocation quota reached")]
    QuotaExceeded,

    /// A live allocation already exists for the 5-tuple
    #[error("Relay already allocated for 5-tuple")]
    FiveTupleConflict,

    /// Channel number already bound to a different peer
    #[error("Channel {0} is bound to another peer")]
    ChannelInUse(ChannelNumber),

    /// Peer already bound to a different channel number
    #[error("Peer {0} is bound to another channel")]
    PeerAlreadyBound(SocketAddr),

    /// No unexpired permission exists for the peer
    #[error("No permission for peer {0}")]
    NoPermission(IpAddr),

    /// The peer address falls into a denied range
    #[error("Peer {0} is forbidden")]
    PeerForbidden(IpAddr),

    /// Channel number outside 0x4000-0x7FFF
    #[error("Invalid channel number {0:#06x}")]
    InvalidChannelNumber(u16),

    /// Missing or invalid attribute in a request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// MESSAGE-INTEGRITY did not match the user's key
    #[error("Message integrity check failed")]
    IntegrityCheckFailed,

    /// REQUESTED-TRANSPORT other than UDP
    #[error("Unsupported transport protocol {0}")]
    UnsupportedTransport(u8),

    /// The relay socket factory failed
    #[error("Failed to create relay socket: {0}")]
    RelaySocket(#[source] io::Error),

    /// STUN codec errors
    #[error("STUN protocol error: {0}")]
    Stun(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A handler failure, wrapped with the context it happened in
    #[error("Failed to handle {method}-{class} from {src_addr}: {source}")]
    Handling {
        method: Method,
        class: Class,
        src_addr: SocketAddr,
        #[source]
        source: Box<Error>,
    },
}

/// Result type alias for TURN relay operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the outcome is routine and must not reach operator logs.
    ///
    /// Applied at the outermost boundary only; the client-facing response
    /// has already been decided by the handler.
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Error::NoAllocationFound | Error::NoSuchUser(_))
    }

    /// Wraps a handler failure with its request context
    pub fn handling(method: Method, class: Class, src_addr: SocketAddr, source: Error) -> Self {
        Error::Handling {
            method,
            class,
            src_addr,
            source: Box::new(source),
        }
    }

    /// Convert the error to a STUN error code
    ///
    /// - 400: Bad Request
    /// - 403: Forbidden
    /// - 437: Allocation Mismatch
    /// - 442: Unsupported Transport Protocol
    /// - 486: Allocation Quota Reached
    /// - 500: Server Error
    /// - 508: Insufficient Capacity
    pub fn to_stun_error_code(&self) -> u16 {
        match self {
            Error::Decode(_) => 400,
            Error::Dispatch { .. } => 400,
            Error::NoAllocationFound => 437,
            Error::NoSuchUser(_) => 400,
            Error::NoChannelBinding(_) => 400,
            Error::QuotaExceeded => 486,
            Error::FiveTupleConflict => 437,
            Error::ChannelInUse(_) => 400,
            Error::PeerAlreadyBound(_) => 400,
            Error::NoPermission(_) => 403,
            Error::PeerForbidden(_) => 403,
            Error::InvalidChannelNumber(_) => 400,
            Error::BadRequest(_) => 400,
            Error::IntegrityCheckFailed => 400,
            Error::UnsupportedTransport(_) => 442,
            Error::RelaySocket(_) => 508,
            Error::Io(_) => 500,
            Error::Stun(_) => 500,
            Error::Config(_) => 500,
            Error::Handling { source, .. } => source.to_stun_error_code(),
        }
    }

    /// Reason phrase sent to the client.
    ///
    /// Internal detail never leaves the server, only the standard phrase.
    pub fn to_stun_error_message(&self) -> &'static str {
        match self {
            Error::NoSuchUser(_) => "Unknown user",
            _ => reason_phrase(self.to_stun_error_code()),
        }
    }
}

/// Standard reason phrase for a STUN error code
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        437 => "Allocation Mismatch",
        438 => "Stale Nonce",
        442 => "Unsupported Transport Protocol",
        486 => "Allocation Quota Reached",
        508 => "Insufficient Capacity",
        _ => "Server Error",
    }
}

// Error conversion implementations
impl From<StunError> for Error {
    fn from(err: StunError) -> Self {
        Error::Stun(err.to_string())
    }
}

impl From<StunEncodeError> for Error {
    fn from(err: StunEncodeError) -> Self {
        Error::Stun(err.to_string())
    }
}

impl From<StunDecodeError> for Error {
    fn from(err: StunDecodeError) -> Self {
        Error::Decode(err.to_string())
    }
}
