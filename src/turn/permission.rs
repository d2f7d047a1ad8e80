//! Permission Management Module
//!
//! This module implements permission handling as specified in RFC 5766 Section 8.
//! Permissions authorize traffic between an allocation and a peer IP address;
//! the peer port is not part of the permission. Without an unexpired
//! permission the relay drops data in both directions.

use crate::types::Expiration;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

/// A permission for one peer IP address, keyed by that IP in its table
#[derive(Debug, Clone)]
pub struct Permission {
    /// When this permission expires
    expiration: Expiration,
}

impl Permission {
    /// Creates a new permission lasting `lifetime`
    pub fn new(lifetime: Duration) -> Self {
        Self {
            expiration: Expiration::new(lifetime),
        }
    }

    /// Checks if this permission has expired
    pub fn is_expired(&self) -> bool {
        self.expiration.is_expired()
    }

    /// Refreshes the permission with a new lifetime
    pub fn refresh(&mut self, lifetime: Duration) {
        self.expiration.refresh(lifetime);
    }
}

/// Permissions held by a single allocation, keyed by peer IP
#[derive(Debug, Default)]
pub struct PermissionTable {
    permissions: HashMap<IpAddr, Permission>,
}

impl PermissionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a permission, or refreshes the existing one
    pub fn install(&mut self, peer_ip: IpAddr, lifetime: Duration) {
        self.permissions
            .entry(peer_ip)
            .and_modify(|permission| permission.refresh(lifetime))
            .or_insert_with(|| Permission::new(lifetime));
    }

    /// Whether an unexpired permission exists for the peer
    pub fn is_permitted(&self, peer_ip: IpAddr) -> bool {
        self.permissions
            .get(&peer_ip)
            .map_or(false, |permission| !permission.is_expired())
    }

    /// Extends a permission only if it is still valid.
    ///
    /// Returns whether the permission was refreshed.
    pub fn refresh_if_valid(&mut self, peer_ip: IpAddr, lifetime: Duration) -> bool {
        match self.permissions.get_mut(&peer_ip) {
            Some(permission) if !permission.is_expired() => {
                permission.refresh(lifetime);
                true
            }
            _ => false,
        }
    }

    /// Removes expired permissions
    pub fn prune(&mut self) -> usize {
        let before = self.permissions.len();
        self.permissions.retain(|_, permission| !permission.is_expired());
        before - self.permissions.len()
    }

    pub fn clear(&mut self) {
        self.permissions.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.permissions.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.permissions.is_empty()
    }
}
