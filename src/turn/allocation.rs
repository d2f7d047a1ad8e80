//! TURN Allocation Management Module
//!
//! This module implements the allocation table of the relay (RFC 5766 Section 5).
//! It handles:
//! - Creating allocations without holding any lock across the relay factory
//! - Refreshing and deleting allocations
//! - Permission and channel binding tracking per allocation
//! - Forwarding client data to peers and peer data back to the client
//! - Periodic cleanup of expired resources
//!
//! The table is a sharded map keyed by the client 5-tuple. Each allocation
//! guards its own permissions and bindings with a dedicated mutex, so
//! operations on different allocations never contend.

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::transport::{PacketConn, RelayConnFactory, MAX_MESSAGE_SIZE};
use crate::turn::channel::{ChannelData, ChannelTable};
use crate::turn::message;
use crate::turn::permission::PermissionTable;
use crate::types::{ChannelNumber, Expiration, FiveTuple};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// STUN transaction id, used to recognise Allocate retransmissions
pub type TransactionId = [u8; 12];

/// Mutable part of an allocation
struct AllocationState {
    expiration: Expiration,
    permissions: PermissionTable,
    channels: ChannelTable,
    closed: bool,
}

/// Success response kept for Allocate retransmissions
struct CachedResponse {
    transaction_id: TransactionId,
    bytes: Vec<u8>,
}

/// Represents a single TURN allocation
pub struct Allocation {
    /// Client 5-tuple owning the allocation
    five_tuple: FiveTuple,

    /// Credentials the allocation was created with
    username: String,
    realm: String,

    /// Relay socket, exclusively owned by this allocation
    relay_conn: Arc<dyn PacketConn>,

    /// Server-assigned relay address
    relay_addr: SocketAddr,

    state: Mutex<AllocationState>,
    response: Mutex<Option<CachedResponse>>,

    /// Task relaying peer traffic back to the client
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Allocation {
    fn new(
        five_tuple: FiveTuple,
        username: &str,
        realm: &str,
        relay_conn: Arc<dyn PacketConn>,
        relay_addr: SocketAddr,
        lifetime: Duration,
    ) -> Self {
        Self {
            five_tuple,
            username: username.to_string(),
            realm: realm.to_string(),
            relay_conn,
            relay_addr,
            state: Mutex::new(AllocationState {
                expiration: Expiration::new(lifetime),
                permissions: PermissionTable::new(),
                channels: ChannelTable::new(),
                closed: false,
            }),
            response: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn five_tuple(&self) -> FiveTuple {
        self.five_tuple
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    /// Gets the relayed transport address
    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    /// Whether the allocation is closed or past its lifetime
    pub fn is_expired(&self) -> bool {
        let state = self.state.lock();
        state.closed || state.expiration.is_expired()
    }

    /// Time left before the allocation expires
    pub fn remaining(&self) -> Duration {
        self.state.lock().expiration.remaining()
    }

    /// Whether an unexpired permission exists for the peer IP
    pub fn is_permitted(&self, peer_ip: IpAddr) -> bool {
        let state = self.state.lock();
        !state.closed && state.permissions.is_permitted(peer_ip)
    }

    /// Remembers the success response sent for the creating transaction
    pub fn cache_response(&self, transaction_id: TransactionId, bytes: Vec<u8>) {
        *self.response.lock() = Some(CachedResponse {
            transaction_id,
            bytes,
        });
    }

    /// The cached success response, if `transaction_id` created this allocation
    pub fn cached_response(&self, transaction_id: &TransactionId) -> Option<Vec<u8>> {
        self.response
            .lock()
            .as_ref()
            .filter(|cached| &cached.transaction_id == transaction_id)
            .map(|cached| cached.bytes.clone())
    }

    // Runs `f` on the state of a live allocation
    fn with_live<T>(&self, f: impl FnOnce(&mut AllocationState) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock();
        if state.closed || state.expiration.is_expired() {
            return Err(Error::NoAllocationFound);
        }
        f(&mut state)
    }

    fn refresh(&self, lifetime: Duration) -> Result<()> {
        self.with_live(|state| {
            state.expiration.refresh(lifetime);
            Ok(())
        })
    }

    fn add_permission(&self, peer_ip: IpAddr, lifetime: Duration) -> Result<()> {
        self.with_live(|state| {
            state.permissions.install(peer_ip, lifetime);
            Ok(())
        })
    }

    fn refresh_permission(&self, peer_ip: IpAddr, lifetime: Duration) {
        let mut state = self.state.lock();
        if !state.closed {
            state.permissions.refresh_if_valid(peer_ip, lifetime);
        }
    }

    fn bind_channel(
        &self,
        number: ChannelNumber,
        peer: SocketAddr,
        channel_lifetime: Duration,
        permission_lifetime: Duration,
    ) -> Result<()> {
        self.with_live(|state| {
            state.channels.bind(number, peer, channel_lifetime)?;
            state.permissions.install(peer.ip(), permission_lifetime);
            Ok(())
        })
    }

    /// Sends client data to a permitted peer through the relay socket
    async fn send_to_peer(&self, peer: SocketAddr, payload: &[u8]) -> Result<()> {
        self.write_locked(self.relay_conn.as_ref(), |state| {
            if !state.permissions.is_permitted(peer.ip()) {
                return Err(Error::NoPermission(peer.ip()));
            }
            Ok((peer, Cow::Borrowed(payload)))
        })
        .await
    }

    /// Sends channel data to the peer bound to `number`
    ///
    /// The binding alone is not enough: the peer's permission must be live too.
    async fn send_on_channel(&self, number: ChannelNumber, payload: &[u8]) -> Result<()> {
        self.write_locked(self.relay_conn.as_ref(), |state| {
            let peer = state
                .channels
                .peer_for(number)
                .ok_or(Error::NoChannelBinding(number))?;
            if !state.permissions.is_permitted(peer.ip()) {
                return Err(Error::NoPermission(peer.ip()));
            }
            Ok((peer, Cow::Borrowed(payload)))
        })
        .await
    }

    /// Delivers peer traffic to the client, as channel data when the peer
    /// has a binding and as a Data indication otherwise
    async fn deliver_to_client(
        &self,
        client_conn: &dyn PacketConn,
        client_addr: SocketAddr,
        peer: SocketAddr,
        payload: &[u8],
    ) -> Result<()> {
        self.write_locked(client_conn, |state| {
            if !state.permissions.is_permitted(peer.ip()) {
                return Err(Error::NoPermission(peer.ip()));
            }
            let framed = match state.channels.number_for(peer) {
                Some(number) => ChannelData::encode(number, payload)?,
                None => message::data_indication(peer, payload)?,
            };
            Ok((client_addr, Cow::Owned(framed)))
        })
        .await
    }

    // Waits for `conn` outside the lock, then routes and writes under it
    async fn write_locked<'p, F>(&self, conn: &dyn PacketConn, route: F) -> Result<()>
    where
        F: Fn(&AllocationState) -> Result<(SocketAddr, Cow<'p, [u8]>)>,
    {
        loop {
            conn.writable().await?;
            if self.try_write(conn, &route)? {
                return Ok(());
            }
        }
    }

    // One write attempt; `false` when the socket was not ready after all
    fn try_write<'p, F>(&self, conn: &dyn PacketConn, route: &F) -> Result<bool>
    where
        F: Fn(&AllocationState) -> Result<(SocketAddr, Cow<'p, [u8]>)>,
    {
        let state = self.state.lock();
        if state.closed || state.expiration.is_expired() {
            return Err(Error::NoAllocationFound);
        }
        let (dst, bytes) = route(&*state)?;
        match conn.try_send_to(&bytes, dst) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn prune(&self) {
        let mut state = self.state.lock();
        let permissions = state.permissions.prune();
        let channels = state.channels.prune();
        if permissions + channels > 0 {
            log::debug!(
                "Pruned {} permissions and {} channel bindings from {}",
                permissions,
                channels,
                self.five_tuple
            );
        }
    }

    fn set_reader(&self, reader: JoinHandle<()>) {
        let closed = self.state.lock().closed;
        if closed {
            reader.abort();
        } else {
            *self.reader.lock() = Some(reader);
        }
    }

    // Releases the relay socket and every dependent resource at once
    fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.permissions.clear();
            state.channels.clear();
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
    }
}

enum Slot {
    /// Reserved while the relay socket is being created
    Pending(u64),
    Live(Arc<Allocation>),
}

/// Manages TURN allocations for the server
pub struct AllocationManager {
    /// Maps client 5-tuples to their allocations
    allocations: DashMap<FiveTuple, Slot>,
    /// Number of slots in the map, reservations included
    count: AtomicUsize,
    next_token: AtomicU64,
    factory: Arc<dyn RelayConnFactory>,
    max_allocations: usize,
    max_lifetime: Duration,
    permission_lifetime: Duration,
    channel_lifetime: Duration,
}

impl AllocationManager {
    /// Creates a new allocation manager
    pub fn new(config: &ServerConfig, factory: Arc<dyn RelayConnFactory>) -> Self {
        Self {
            allocations: DashMap::new(),
            count: AtomicUsize::new(0),
            next_token: AtomicU64::new(0),
            factory,
            max_allocations: config.get_max_allocations(),
            max_lifetime: config.get_max_allocation_lifetime(),
            permission_lifetime: config.get_permission_lifetime(),
            channel_lifetime: config.get_channel_bind_timeout(),
        }
    }

    /// Creates a new allocation for a client
    ///
    /// The 5-tuple is reserved before the relay factory is awaited, so a
    /// concurrent request for the same 5-tuple fails fast while requests for
    /// other 5-tuples proceed in parallel. If the factory fails the
    /// reservation is removed and nothing is left behind.
    ///
    /// # Arguments
    /// * `key` - The client 5-tuple
    /// * `username`, `realm` - Credentials of the authenticated request
    /// * `lifetime` - Granted lifetime
    /// * `client_conn` - Socket used to deliver peer traffic to the client
    ///
    /// # Errors
    /// * `FiveTupleConflict` - A live or in-creation allocation exists
    /// * `QuotaExceeded` - `max_allocations` is reached
    /// * `RelaySocket` - The relay factory failed
    pub async fn create_allocation(
        &self,
        key: FiveTuple,
        username: &str,
        realm: &str,
        lifetime: Duration,
        client_conn: Arc<dyn PacketConn>,
    ) -> Result<Arc<Allocation>> {
        let token = self.reserve(key)?;

        let relay_conn = match self.factory.allocate_conn(username, realm).await {
            Ok(conn) => conn,
            Err(e) => {
                self.release(&key, token);
                return Err(Error::RelaySocket(e));
            }
        };
        let relay_addr = match relay_conn.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.release(&key, token);
                return Err(Error::RelaySocket(e));
            }
        };

        let allocation = Arc::new(Allocation::new(
            key,
            username,
            realm,
            Arc::clone(&relay_conn),
            relay_addr,
            lifetime,
        ));

        match self.allocations.get_mut(&key) {
            Some(mut slot) if matches!(*slot, Slot::Pending(t) if t == token) => {
                *slot = Slot::Live(Arc::clone(&allocation));
            }
            _ => {
                // Reservation torn down while the factory was running
                allocation.close();
                return Err(Error::NoAllocationFound);
            }
        }

        allocation.set_reader(tokio::spawn(relay_to_client(
            Arc::downgrade(&allocation),
            relay_conn,
            client_conn,
            key.src_addr,
        )));

        log::info!(
            "Created allocation {} for '{}' relaying on {} ({:?})",
            key,
            username,
            relay_addr,
            lifetime
        );
        Ok(allocation)
    }

    /// Gets the live allocation for a 5-tuple
    pub fn get_allocation(&self, key: &FiveTuple) -> Option<Arc<Allocation>> {
        self.allocations.get(key).and_then(|slot| match slot.value() {
            Slot::Live(allocation) if !allocation.is_expired() => Some(Arc::clone(allocation)),
            _ => None,
        })
    }

    /// Refreshes an existing allocation
    ///
    /// A zero lifetime deletes the allocation. Other lifetimes are clamped
    /// to the configured maximum.
    ///
    /// # Returns
    /// * `Ok(Duration)` - The lifetime granted
    /// * `Err(NoAllocationFound)` - If no live allocation exists
    pub fn refresh_allocation(&self, key: &FiveTuple, lifetime: Duration) -> Result<Duration> {
        if lifetime.is_zero() {
            self.delete_allocation(key)?;
            return Ok(Duration::ZERO);
        }

        let allocation = self.get_allocation(key).ok_or(Error::NoAllocationFound)?;
        let granted = lifetime.min(self.max_lifetime);
        allocation.refresh(granted)?;
        log::debug!("Refreshed allocation {} for {:?}", key, granted);
        Ok(granted)
    }

    /// Deletes an allocation, releasing its relay socket, permissions and bindings
    pub fn delete_allocation(&self, key: &FiveTuple) -> Result<()> {
        let removed = self.allocations.remove_if(key, |_, slot| {
            matches!(slot, Slot::Live(allocation) if !allocation.is_expired())
        });

        match removed {
            Some((_, Slot::Live(allocation))) => {
                self.count.fetch_sub(1, Ordering::SeqCst);
                allocation.close();
                log::info!("Deleted allocation {}", key);
                Ok(())
            }
            _ => Err(Error::NoAllocationFound),
        }
    }

    /// Installs or refreshes a permission for a peer IP
    pub fn create_permission(&self, key: &FiveTuple, peer_ip: IpAddr) -> Result<()> {
        let allocation = self.get_allocation(key).ok_or(Error::NoAllocationFound)?;
        allocation.add_permission(peer_ip, self.permission_lifetime)
    }

    /// Binds a channel number to a peer, installing the peer's permission
    ///
    /// # Errors
    /// * `NoAllocationFound`
    /// * `ChannelInUse` - The number is bound to another peer
    /// * `PeerAlreadyBound` - The peer is bound to another number
    pub fn bind_channel(&self, key: &FiveTuple, number: ChannelNumber, peer: SocketAddr) -> Result<()> {
        let allocation = self.get_allocation(key).ok_or(Error::NoAllocationFound)?;
        allocation.bind_channel(number, peer, self.channel_lifetime, self.permission_lifetime)
    }

    /// Sends client data to a peer through the relay socket
    ///
    /// Liveness and permission are checked in the same step as the write. A
    /// successful send refreshes the peer's permission.
    pub async fn forward(&self, key: &FiveTuple, peer: SocketAddr, payload: &[u8]) -> Result<()> {
        let allocation = self.get_allocation(key).ok_or(Error::NoAllocationFound)?;
        allocation.send_to_peer(peer, payload).await?;
        allocation.refresh_permission(peer.ip(), self.permission_lifetime);
        Ok(())
    }

    /// Sends channel data to the peer bound to `number`
    ///
    /// # Errors
    /// * `NoAllocationFound`
    /// * `NoChannelBinding` - The number is not bound
    /// * `NoPermission` - The bound peer's permission has expired
    pub async fn forward_channel_data(
        &self,
        key: &FiveTuple,
        number: ChannelNumber,
        payload: &[u8],
    ) -> Result<()> {
        let allocation = self.get_allocation(key).ok_or(Error::NoAllocationFound)?;
        allocation.send_on_channel(number, payload).await
    }

    /// Removes expired allocations and prunes expired permissions and bindings
    ///
    /// Returns the number of allocations removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = 0;
        self.allocations.retain(|key, slot| match slot {
            Slot::Pending(_) => true,
            Slot::Live(allocation) if allocation.is_expired() => {
                allocation.close();
                log::info!("Allocation {} expired", key);
                removed += 1;
                false
            }
            Slot::Live(allocation) => {
                allocation.prune();
                true
            }
        });
        self.count.fetch_sub(removed, Ordering::SeqCst);
        removed
    }

    /// Tears down every allocation, including reservations in flight
    pub fn close_all(&self) {
        let mut removed = 0;
        self.allocations.retain(|_, slot| {
            if let Slot::Live(allocation) = slot {
                allocation.close();
            }
            removed += 1;
            false
        });
        self.count.fetch_sub(removed, Ordering::SeqCst);
        log::info!("Closed {} allocations", removed);
    }

    /// Number of allocations, reservations in flight included
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Reserves `key`, replacing an expired allocation left for the sweep
    fn reserve(&self, key: FiveTuple) -> Result<u64> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        match self.allocations.entry(key) {
            Entry::Occupied(mut occupied) => {
                let stale = matches!(occupied.get(), Slot::Live(allocation) if allocation.is_expired());
                if !stale {
                    return Err(Error::FiveTupleConflict);
                }
                if let Slot::Live(old) = occupied.insert(Slot::Pending(token)) {
                    old.close();
                }
            }
            Entry::Vacant(vacant) => {
                self.count
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        (n < self.max_allocations).then(|| n + 1)
                    })
                    .map_err(|_| Error::QuotaExceeded)?;
                vacant.insert(Slot::Pending(token));
            }
        }
        Ok(token)
    }

    fn release(&self, key: &FiveTuple, token: u64) {
        let removed = self
            .allocations
            .remove_if(key, |_, slot| matches!(slot, Slot::Pending(t) if *t == token));
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

// Relays peer datagrams to the client until the allocation goes away
async fn relay_to_client(
    allocation: Weak<Allocation>,
    relay_conn: Arc<dyn PacketConn>,
    client_conn: Arc<dyn PacketConn>,
    client_addr: SocketAddr,
) {
    let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
    loop {
        let (len, peer) = match relay_conn.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                ) =>
            {
                continue
            }
            Err(e) => {
                log::debug!("Relay socket for {} stopped: {}", client_addr, e);
                return;
            }
        };

        let Some(live) = allocation.upgrade() else {
            return;
        };
        match live
            .deliver_to_client(client_conn.as_ref(), client_addr, peer, &buf[..len])
            .await
        {
            Ok(()) => {}
            Err(Error::NoAllocationFound) => return,
            Err(Error::NoPermission(_)) => {
                log::debug!("Dropping {} bytes from {} without permission", len, peer);
            }
            Err(e) => {
                log::warn!("Failed to relay data from {} to {}: {}", peer, client_addr, e);
            }
        }
    }
}
