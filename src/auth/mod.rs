// Authentication module for the TURN relay
//
// The credential backend is injected: the engine only ever asks an
// `AuthHandler` for the integrity key of a (username, realm, source) triple.
pub mod nonce;

use crate::config::AuthConfig;
use crate::error::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use stun_rs::{Algorithm, AlgorithmId, HMACKey};

pub use nonce::{NonceAuthority, NonceValidity};

/// Credential lookup consulted for every authenticated request
pub trait AuthHandler: Send + Sync {
    /// Returns the MESSAGE-INTEGRITY key for the user, or `None` if the user
    /// is unknown.
    fn authenticate(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Option<HMACKey>;
}

impl<F> AuthHandler for F
where
    F: Fn(&str, &str, SocketAddr) -> Option<HMACKey> + Send + Sync,
{
    fn authenticate(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Option<HMACKey> {
        self(username, realm, src_addr)
    }
}

/// Fixed username/password table
///
/// Keys are derived once with the long-term credential mechanism
/// (RFC 5389 Section 15.4): MD5(username ":" realm ":" password).
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    realm: String,
    keys: HashMap<String, HMACKey>,
}

impl StaticCredentials {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            keys: HashMap::new(),
        }
    }

    /// Builds the table from the configured users
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut credentials = Self::new(config.realm.clone());
        for (username, password) in &config.users {
            credentials.add_credentials(username.clone(), password)?;
        }
        Ok(credentials)
    }

    /// Adds or replaces a user
    ///
    /// Fails if the realm or password is rejected by the OpaqueString profile.
    pub fn add_credentials(&mut self, username: String, password: &str) -> Result<()> {
        let key = HMACKey::new_long_term(
            &username,
            &self.realm,
            password,
            Algorithm::from(AlgorithmId::MD5),
        )?;
        self.keys.insert(username, key);
        Ok(())
    }
}

impl AuthHandler for StaticCredentials {
    fn authenticate(&self, username: &str, realm: &str, src_addr: SocketAddr) -> Option<HMACKey> {
        if realm != self.realm {
            log::debug!("Realm mismatch for '{}' from {}: {}", username, src_addr, realm);
            return None;
        }
        self.keys.get(username).cloned()
    }
}
