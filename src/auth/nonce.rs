//! Nonce issuance and validation
//!
//! Nonces are stateless: the token carries its issuance time and an
//! HMAC-SHA1 over that time and the requester address, keyed by a secret
//! generated at startup. Nothing has to be stored or swept.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as BASE64, Engine as _};
use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

const TIMESTAMP_SIZE: usize = 8;
const TAG_SIZE: usize = 20;

/// Outcome of checking a nonce presented by a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceValidity {
    /// Issued by us, to this address, within the freshness window
    Fresh,
    /// Issued by us, to this address, but too old
    Stale,
    /// Malformed, forged, or issued to another address
    Unknown,
}

/// Issues and validates freshness tokens
pub struct NonceAuthority {
    secret: [u8; 32],
    lifetime: Duration,
}

impl NonceAuthority {
    /// Creates an authority with a random secret
    pub fn new(lifetime: Duration) -> Self {
        Self::with_secret(rand::thread_rng().gen(), lifetime)
    }

    pub fn with_secret(secret: [u8; 32], lifetime: Duration) -> Self {
        Self { secret, lifetime }
    }

    /// Issues a nonce scoped to `addr`
    pub fn issue(&self, addr: SocketAddr) -> String {
        self.issue_at(addr, now_millis())
    }

    /// Issues a nonce as if at `timestamp` milliseconds since the epoch
    pub(crate) fn issue_at(&self, addr: SocketAddr, timestamp: u64) -> String {
        let mut token = [0u8; TIMESTAMP_SIZE + TAG_SIZE];
        BigEndian::write_u64(&mut token[..TIMESTAMP_SIZE], timestamp);
        let tag = self.mac(&token[..TIMESTAMP_SIZE], addr).finalize().into_bytes();
        token[TIMESTAMP_SIZE..].copy_from_slice(&tag);
        BASE64.encode(token)
    }

    /// Checks a nonce presented by `addr`
    pub fn validate(&self, nonce: &str, addr: SocketAddr) -> NonceValidity {
        let token = match BASE64.decode(nonce) {
            Ok(token) if token.len() == TIMESTAMP_SIZE + TAG_SIZE => token,
            _ => return NonceValidity::Unknown,
        };

        let (timestamp, tag) = token.split_at(TIMESTAMP_SIZE);
        if self.mac(timestamp, addr).verify_slice(tag).is_err() {
            return NonceValidity::Unknown;
        }

        let issued = BigEndian::read_u64(timestamp);
        let now = now_millis();
        if issued > now {
            return NonceValidity::Unknown;
        }
        if Duration::from_millis(now - issued) > self.lifetime {
            return NonceValidity::Stale;
        }
        NonceValidity::Fresh
    }

    fn mac(&self, timestamp: &[u8], addr: SocketAddr) -> HmacSha1 {
        let mut mac = HmacSha1::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(timestamp);
        mac.update(addr.to_string().as_bytes());
        mac
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
