//! Core type definitions for the TURN relay
//!
//! This module provides fundamental types used throughout the relay engine:
//! - Channel numbers and their reserved range
//! - The client 5-tuple that keys every allocation
//! - Timing and expiration handling

use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Channel number for TURN channel bindings (0x4000 through 0x7FFF)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelNumber(pub u16);

impl ChannelNumber {
    /// Lowest channel number a client may bind
    pub const MIN: u16 = 0x4000;
    /// Highest channel number a client may bind
    pub const MAX: u16 = 0x7FFF;

    /// Creates a new channel number if within valid range
    ///
    /// # Returns
    /// * `Some(ChannelNumber)` if value is valid
    /// * `None` if value is outside valid range
    pub fn new(value: u16) -> Option<Self> {
        if Self::is_valid(value) {
            Some(Self(value))
        } else {
            None
        }
    }

    /// Checks if a raw channel number is in the bindable range
    pub fn is_valid(value: u16) -> bool {
        (Self::MIN..=Self::MAX).contains(&value)
    }

    /// Gets the raw channel number value
    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ChannelNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Transport protocol between the client and the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

/// The client's transport context: source address, protocol and the
/// server-local address the datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub protocol: Protocol,
    pub src_addr: SocketAddr,
    pub dst_addr: SocketAddr,
}

impl FiveTuple {
    pub fn udp(src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self {
            protocol: Protocol::Udp,
            src_addr,
            dst_addr,
        }
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}->{}", self.protocol, self.src_addr, self.dst_addr)
    }
}

/// Point in time when a resource expires
#[derive(Debug, Clone, Copy)]
pub struct Expiration(pub Instant);

impl Expiration {
    /// Creates a new expiration time from a duration
    pub fn new(duration: Duration) -> Self {
        Self(Instant::now() + duration)
    }

    /// Checks if the expiration time has passed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.0
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// Refreshes the expiration with a new duration from now
    pub fn refresh(&mut self, duration: Duration) {
        self.0 = Instant::now() + duration;
    }
}
