//! Test doubles and wire helpers shared by the turn unit tests

use crate::transport::{PacketConn, RelayConnFactory};
use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha1::Sha1;
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stun_rs::{Algorithm, AlgorithmId, DecoderContextBuilder, HMACKey, MessageDecoderBuilder};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
pub const HEADER_SIZE: usize = 20;

pub const BINDING: u16 = 0x0001;
pub const ALLOCATE: u16 = 0x0003;
pub const REFRESH: u16 = 0x0004;
pub const SEND: u16 = 0x0006;
pub const CREATE_PERMISSION: u16 = 0x0008;
pub const CHANNEL_BIND: u16 = 0x0009;

pub const REQUEST: u16 = 0x0000;
pub const INDICATION: u16 = 0x0010;
pub const SUCCESS: u16 = 0x0100;
pub const ERROR: u16 = 0x0110;

pub const ATTR_USERNAME: u16 = 0x0006;
pub const ATTR_MESSAGE_INTEGRITY: u16 = 0x0008;
pub const ATTR_ERROR_CODE: u16 = 0x0009;
pub const ATTR_CHANNEL_NUMBER: u16 = 0x000C;
pub const ATTR_LIFETIME: u16 = 0x000D;
pub const ATTR_XOR_PEER_ADDRESS: u16 = 0x0012;
pub const ATTR_REQUESTED_TRANSPORT: u16 = 0x0019;
pub const ATTR_DATA: u16 = 0x0013;
pub const ATTR_REALM: u16 = 0x0014;
pub const ATTR_NONCE: u16 = 0x0015;
pub const ATTR_XOR_RELAYED_ADDRESS: u16 = 0x0016;
pub const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

/// Records every datagram sent through it; never receives anything
pub struct RecordingConn {
    addr: SocketAddr,
    sent: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    notify: Notify,
}

impl RecordingConn {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            sent: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    /// Datagrams sent so far, oldest first
    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().iter().cloned().collect()
    }

    /// Takes the oldest datagram, failing the test if none arrives in time
    pub async fn next_sent(&self) -> (Vec<u8>, SocketAddr) {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                if let Some(datagram) = self.sent.lock().pop_front() {
                    return datagram;
                }
                notified.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("no datagram sent")
    }
}

#[async_trait]
impl PacketConn for RecordingConn {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.try_send_to(data, target)
    }

    async fn writable(&self) -> io::Result<()> {
        Ok(())
    }

    fn try_send_to(&self, data: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push_back((data.to_vec(), target));
        self.notify.notify_waiters();
        Ok(data.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        std::future::pending().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// Relay factory binding loopback sockets, with optional delay and failure
pub struct ScriptedFactory {
    delay: Duration,
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        })
    }

    /// Makes the next call fail
    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnFactory for ScriptedFactory {
    async fn allocate_conn(&self, _username: &str, _realm: &str) -> io::Result<Arc<dyn PacketConn>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::AddrNotAvailable, "no relay ports"));
        }
        Ok(Arc::new(UdpSocket::bind("127.0.0.1:0").await?))
    }
}

/// Builds raw STUN messages attribute by attribute
pub struct RawMessage {
    message_type: u16,
    transaction_id: [u8; 12],
    body: Vec<u8>,
}

impl RawMessage {
    pub fn new(method: u16, class: u16) -> Self {
        Self {
            message_type: method | class,
            transaction_id: rand::random(),
            body: Vec::new(),
        }
    }

    pub fn request(method: u16) -> Self {
        Self::new(method, REQUEST)
    }

    pub fn attribute(mut self, kind: u16, value: &[u8]) -> Self {
        let mut header = [0u8; 4];
        BigEndian::write_u16(&mut header[..2], kind);
        BigEndian::write_u16(&mut header[2..], value.len() as u16);
        self.body.extend_from_slice(&header);
        self.body.extend_from_slice(value);
        while self.body.len() % 4 != 0 {
            self.body.push(0);
        }
        self
    }

    pub fn username(self, username: &str) -> Self {
        self.attribute(ATTR_USERNAME, username.as_bytes())
    }

    pub fn realm(self, realm: &str) -> Self {
        self.attribute(ATTR_REALM, realm.as_bytes())
    }

    pub fn nonce(self, nonce: &str) -> Self {
        self.attribute(ATTR_NONCE, nonce.as_bytes())
    }

    pub fn credentials(self, username: &str, realm: &str, nonce: &str) -> Self {
        self.username(username).realm(realm).nonce(nonce)
    }

    pub fn requested_transport(self, protocol: u8) -> Self {
        self.attribute(ATTR_REQUESTED_TRANSPORT, &[protocol, 0, 0, 0])
    }

    pub fn lifetime(self, seconds: u32) -> Self {
        let mut value = [0u8; 4];
        BigEndian::write_u32(&mut value, seconds);
        self.attribute(ATTR_LIFETIME, &value)
    }

    pub fn channel_number(self, number: u16) -> Self {
        let mut value = [0u8; 4];
        BigEndian::write_u16(&mut value[..2], number);
        self.attribute(ATTR_CHANNEL_NUMBER, &value)
    }

    pub fn xor_peer_address(self, addr: SocketAddr) -> Self {
        let value = xor_address(addr);
        self.attribute(ATTR_XOR_PEER_ADDRESS, &value)
    }

    pub fn data(self, payload: &[u8]) -> Self {
        self.attribute(ATTR_DATA, payload)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut raw = vec![0u8; HEADER_SIZE];
        BigEndian::write_u16(&mut raw[..2], self.message_type);
        BigEndian::write_u16(&mut raw[2..4], self.body.len() as u16);
        BigEndian::write_u32(&mut raw[4..8], MAGIC_COOKIE);
        raw[8..HEADER_SIZE].copy_from_slice(&self.transaction_id);
        raw.extend_from_slice(&self.body);
        raw
    }

    /// Builds the message and appends MESSAGE-INTEGRITY computed with `key`
    pub fn signed(&self, key: &HMACKey) -> Vec<u8> {
        let mut raw = self.build();
        // The length covers the attribute being appended
        let length = raw.len() + 24 - HEADER_SIZE;
        BigEndian::write_u16(&mut raw[2..4], length as u16);

        let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(&raw);
        let tag = mac.finalize().into_bytes();

        let mut header = [0u8; 4];
        BigEndian::write_u16(&mut header[..2], ATTR_MESSAGE_INTEGRITY);
        BigEndian::write_u16(&mut header[2..], tag.len() as u16);
        raw.extend_from_slice(&header);
        raw.extend_from_slice(&tag);
        raw
    }
}

/// Long-term credential key, MD5(username:realm:password)
pub fn long_term_key(username: &str, realm: &str, password: &str) -> HMACKey {
    HMACKey::new_long_term(username, realm, password, Algorithm::from(AlgorithmId::MD5)).unwrap()
}

/// Whether `raw` carries a MESSAGE-INTEGRITY that validates with `key`
pub fn verify_integrity(raw: &[u8], key: &HMACKey) -> bool {
    attribute(raw, ATTR_MESSAGE_INTEGRITY).is_some()
        && MessageDecoderBuilder::default()
            .with_context(
                DecoderContextBuilder::default()
                    .with_key(key.clone())
                    .with_validation()
                    .build(),
            )
            .build()
            .decode(raw)
            .is_ok()
}

/// XOR-encoded IPv4 address attribute value
pub fn xor_address(addr: SocketAddr) -> Vec<u8> {
    let IpAddr::V4(ip) = addr.ip() else {
        panic!("only IPv4 is used in tests");
    };
    let mut value = vec![0u8; 8];
    value[1] = 0x01;
    BigEndian::write_u16(&mut value[2..4], addr.port() ^ (MAGIC_COOKIE >> 16) as u16);
    BigEndian::write_u32(&mut value[4..8], u32::from(ip) ^ MAGIC_COOKIE);
    value
}

/// Decodes an XOR-encoded IPv4 address attribute value
pub fn parse_xor_address(value: &[u8]) -> SocketAddr {
    let port = BigEndian::read_u16(&value[2..4]) ^ (MAGIC_COOKIE >> 16) as u16;
    let ip = BigEndian::read_u32(&value[4..8]) ^ MAGIC_COOKIE;
    SocketAddr::from((ip.to_be_bytes(), port))
}

/// Message type of a raw STUN message
pub fn message_type(raw: &[u8]) -> u16 {
    BigEndian::read_u16(&raw[..2])
}

/// Value of the first attribute of `kind`
pub fn attribute(raw: &[u8], kind: u16) -> Option<Vec<u8>> {
    let end = (HEADER_SIZE + BigEndian::read_u16(&raw[2..4]) as usize).min(raw.len());
    let mut offset = HEADER_SIZE;
    while offset + 4 <= end {
        let k = BigEndian::read_u16(&raw[offset..offset + 2]);
        let len = BigEndian::read_u16(&raw[offset + 2..offset + 4]) as usize;
        let value = raw.get(offset + 4..offset + 4 + len)?;
        if k == kind {
            return Some(value.to_vec());
        }
        // values are padded to a 4 byte boundary
        offset += 4 + ((len + 3) & !3);
    }
    None
}

/// Numeric code of the ERROR-CODE attribute
pub fn error_code(raw: &[u8]) -> Option<u16> {
    attribute(raw, ATTR_ERROR_CODE).map(|value| value[2] as u16 * 100 + value[3] as u16)
}

pub fn nonce(raw: &[u8]) -> Option<String> {
    attribute(raw, ATTR_NONCE).map(|value| String::from_utf8(value).unwrap())
}

pub fn lifetime(raw: &[u8]) -> Option<u32> {
    attribute(raw, ATTR_LIFETIME).map(|value| BigEndian::read_u32(&value))
}
