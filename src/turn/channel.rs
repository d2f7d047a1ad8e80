//! Channel Management Module
//!
//! This module implements channel binding functionality as specified in RFC 5766 Section 11.
//! Channels replace the full STUN header of relayed data with a 4-byte prefix:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         Channel Number        |            Length             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! /                       Application Data                        /
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Within one allocation a channel number maps to exactly one peer address
//! and back, for as long as the binding is unexpired.

use crate::error::{Error, Result};
use crate::types::{ChannelNumber, Expiration};
use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Size of the channel data header
pub const CHANNEL_DATA_HEADER_SIZE: usize = 4;

/// A single channel binding between a channel number and a peer
#[derive(Debug, Clone)]
pub struct ChannelBind {
    /// The bound channel number
    number: ChannelNumber,
    /// The peer's address this channel is bound to
    peer: SocketAddr,
    /// When this channel binding expires
    expiration: Expiration,
}

impl ChannelBind {
    pub fn new(number: ChannelNumber, peer: SocketAddr, lifetime: Duration) -> Self {
        Self {
            number,
            peer,
            expiration: Expiration::new(lifetime),
        }
    }

    /// Checks if this channel binding has expired
    pub fn is_expired(&self) -> bool {
        self.expiration.is_expired()
    }

    /// Gets the peer address this channel is bound to
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Gets the channel number
    pub fn number(&self) -> ChannelNumber {
        self.number
    }
}

/// Channel bindings held by a single allocation
#[derive(Debug, Default)]
pub struct ChannelTable {
    /// Maps channel numbers to bindings
    by_number: HashMap<ChannelNumber, ChannelBind>,
    /// Maps peer addresses to channel numbers for quick lookup
    by_peer: HashMap<SocketAddr, ChannelNumber>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `number` to `peer`, or refreshes the identical binding.
    ///
    /// # Errors
    /// * `ChannelInUse` - The number is bound to a different peer
    /// * `PeerAlreadyBound` - The peer is bound to a different number
    pub fn bind(&mut self, number: ChannelNumber, peer: SocketAddr, lifetime: Duration) -> Result<()> {
        if let Some(bound_peer) = self.live(number).map(ChannelBind::peer) {
            if bound_peer != peer {
                return Err(Error::ChannelInUse(number));
            }
        }
        if let Some(bound_number) = self.number_for(peer) {
            if bound_number != number {
                return Err(Error::PeerAlreadyBound(peer));
            }
        }

        // Drop expired leftovers on either side before rebinding
        self.unbind(number);
        if let Some(stale) = self.by_peer.get(&peer).copied() {
            self.unbind(stale);
        }

        self.by_number.insert(number, ChannelBind::new(number, peer, lifetime));
        self.by_peer.insert(peer, number);
        Ok(())
    }

    /// Peer bound to `number`, if the binding is live
    pub fn peer_for(&self, number: ChannelNumber) -> Option<SocketAddr> {
        self.live(number).map(ChannelBind::peer)
    }

    /// Channel number bound to `peer`, if the binding is live
    pub fn number_for(&self, peer: SocketAddr) -> Option<ChannelNumber> {
        self.by_peer
            .get(&peer)
            .and_then(|number| self.live(*number))
            .map(ChannelBind::number)
    }

    /// Removes expired channel bindings
    pub fn prune(&mut self) -> usize {
        let expired: Vec<_> = self
            .by_number
            .values()
            .filter(|bind| bind.is_expired())
            .map(ChannelBind::number)
            .collect();

        for number in &expired {
            self.unbind(*number);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.by_number.clear();
        self.by_peer.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    fn live(&self, number: ChannelNumber) -> Option<&ChannelBind> {
        self.by_number.get(&number).filter(|bind| !bind.is_expired())
    }

    fn unbind(&mut self, number: ChannelNumber) {
        if let Some(bind) = self.by_number.remove(&number) {
            self.by_peer.remove(&bind.peer);
        }
    }
}

/// A decoded channel data datagram
#[derive(Debug, PartialEq, Eq)]
pub struct ChannelData<'a> {
    pub number: ChannelNumber,
    pub payload: &'a [u8],
}

impl<'a> ChannelData<'a> {
    /// Whether a datagram uses channel framing rather than STUN framing
    pub fn is_channel_data(raw: &[u8]) -> bool {
        raw.len() >= CHANNEL_DATA_HEADER_SIZE && ChannelNumber::is_valid(BigEndian::read_u16(&raw[..2]))
    }

    /// Decodes a channel data datagram.
    ///
    /// Bytes past the declared length are padding and ignored.
    pub fn decode(raw: &'a [u8]) -> Result<Self> {
        if raw.len() < CHANNEL_DATA_HEADER_SIZE {
            return Err(Error::Decode(format!(
                "channel data too short: {} bytes",
                raw.len()
            )));
        }
        let number = BigEndian::read_u16(&raw[..2]);
        let number = ChannelNumber::new(number).ok_or(Error::InvalidChannelNumber(number))?;

        let length = BigEndian::read_u16(&raw[2..4]) as usize;
        let payload = &raw[CHANNEL_DATA_HEADER_SIZE..];
        if length > payload.len() {
            return Err(Error::Decode(format!(
                "channel data declares {} bytes but carries {}",
                length,
                payload.len()
            )));
        }

        Ok(Self {
            number,
            payload: &payload[..length],
        })
    }

    /// Frames `payload` for `number`
    pub fn encode(number: ChannelNumber, payload: &[u8]) -> Result<Vec<u8>> {
        let length = u16::try_from(payload.len())
            .map_err(|_| Error::BadRequest(format!("channel payload too large: {}", payload.len())))?;

        let mut buf = BytesMut::with_capacity(CHANNEL_DATA_HEADER_SIZE + payload.len());
        buf.put_u16(number.value());
        buf.put_u16(length);
        buf.put_slice(payload);
        Ok(buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn test_channel_binding() {
        let mut table = ChannelTable::new();
        let number = ChannelNumber(0x4001);

        table.bind(number, peer(9000), Duration::from_secs(600)).unwrap();
        assert_eq!(table.peer_for(number), Some(peer(9000)));
        assert_eq!(table.number_for(peer(9000)), Some(number));

        // Rebinding the identical pair refreshes
        table.bind(number, peer(9000), Duration::from_secs(600)).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_channel_in_use() {
        let mut table = ChannelTable::new();
        let number = ChannelNumber(0x4001);

        table.bind(number, peer(9000), Duration::from_secs(600)).unwrap();
        assert!(matches!(
            table.bind(number, peer(9001), Duration::from_secs(600)),
            Err(Error::ChannelInUse(n)) if n == number
        ));
        assert_eq!(table.peer_for(number), Some(peer(9000)));
    }

    #[test]
    fn test_peer_already_bound() {
        let mut table = ChannelTable::new();

        table.bind(ChannelNumber(0x4001), peer(9000), Duration::from_secs(600)).unwrap();
        assert!(matches!(
            table.bind(ChannelNumber(0x4002), peer(9000), Duration::from_secs(600)),
            Err(Error::PeerAlreadyBound(p)) if p == peer(9000)
        ));
        assert_eq!(table.peer_for(ChannelNumber(0x4002)), None);
    }

    #[test]
    fn test_expired_binding_can_be_reused() {
        let mut table = ChannelTable::new();
        let number = ChannelNumber(0x4001);

        table.bind(number, peer(9000), Duration::ZERO).unwrap();
        assert_eq!(table.peer_for(number), None);
        assert_eq!(table.number_for(peer(9000)), None);

        table.bind(number, peer(9001), Duration::from_secs(600)).unwrap();
        assert_eq!(table.peer_for(number), Some(peer(9001)));
        // The old peer mapping went away with the expired binding
        table.bind(ChannelNumber(0x4002), peer(9000), Duration::from_secs(600)).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_prune() {
        let mut table = ChannelTable::new();

        table.bind(ChannelNumber(0x4001), peer(9000), Duration::ZERO).unwrap();
        table.bind(ChannelNumber(0x4002), peer(9001), Duration::from_secs(600)).unwrap();

        assert_eq!(table.prune(), 1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.number_for(peer(9000)), None);
    }

    #[test]
    fn test_channel_data_detection() {
        assert!(ChannelData::is_channel_data(&[0x40, 0x00, 0x00, 0x00]));
        assert!(ChannelData::is_channel_data(&[0x7F, 0xFF, 0x00, 0x00]));
        assert!(!ChannelData::is_channel_data(&[0x40, 0x00, 0x00]));
        // STUN messages start with two zero bits
        assert!(!ChannelData::is_channel_data(&[0x00, 0x01, 0x00, 0x00]));
        assert!(!ChannelData::is_channel_data(&[0x80, 0x00, 0x00, 0x00]));
    }

    #[test]
    fn test_channel_data_decode() {
        let raw = [0x40, 0x01, 0x00, 0x03, b'a', b'b', b'c', 0x00];
        let data = ChannelData::decode(&raw).unwrap();
        assert_eq!(data.number, ChannelNumber(0x4001));
        assert_eq!(data.payload, b"abc");

        let encoded = ChannelData::encode(ChannelNumber(0x4001), b"abc").unwrap();
        assert_eq!(encoded, &raw[..7]);
    }

    #[test]
    fn test_channel_data_length_overrun() {
        let raw = [0x40, 0x01, 0x00, 0x08, b'a', b'b'];
        assert!(matches!(ChannelData::decode(&raw), Err(Error::Decode(_))));
        assert!(matches!(ChannelData::decode(&raw[..3]), Err(Error::Decode(_))));
    }
}
