//! The connection table (§4.2, §3): two 255-bucket hash indexes over a
//! `Slab`-backed arena. Matches the teacher's own `Slab<Connection>` +
//! `FnvHashMap` side-index idiom; `ConnectionHandle` is the stable integer
//! handle that spec §9's design notes recommend over a back-pointer from
//! each watcher into its connection.

use std::hash::Hasher;
use std::net::SocketAddrV4;

use fnv::FnvHasher;
use slab::Slab;

use crate::connection::Connection;
use crate::mac::MacAddr;

const BUCKETS: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub usize);

/// Bucketed on IP address and session id only, deliberately excluding the
/// UDP port: §4.3's last bullet requires a packet whose session id matches
/// an existing connection but whose source port differs (NAT rebinding) to
/// resolve to that same connection so its stored peer can be updated, not
/// spawn a fresh one. The original's `get_conn` + `memcmp(&client->addr,
/// &peer)` reconcile relies on the same relaxed match.
fn hash_peer(peer: SocketAddrV4, session_id: u16) -> usize {
    let mut h = FnvHasher::default();
    h.write(&peer.ip().octets());
    h.write_u16(session_id);
    (h.finish() % BUCKETS as u64) as usize
}

fn peer_matches<C>(conn: &Connection<C>, peer: SocketAddrV4, session_id: u16) -> bool {
    conn.peer.ip() == peer.ip() && conn.session_id == session_id
}

fn hash_mac(mac: &MacAddr) -> usize {
    let mut h = FnvHasher::default();
    h.write(&mac.0);
    (h.finish() % BUCKETS as u64) as usize
}

/// A bucket is a small chain of handles; `Vec` stands in for the original
/// singly-linked list (the manual `ip_next`/`ether_next` pointers are an
/// implementation detail of the C arena, not of the data structure itself).
type Bucket = Vec<ConnectionHandle>;

pub struct ConnectionTable<C> {
    connections: Slab<Connection<C>>,
    ip_index: Vec<Bucket>,
    ether_index: Vec<Bucket>,
}

impl<C> ConnectionTable<C> {
    pub fn new() -> Self {
        ConnectionTable {
            connections: Slab::new(),
            ip_index: (0..BUCKETS).map(|_| Vec::new()).collect(),
            ether_index: (0..BUCKETS).map(|_| Vec::new()).collect(),
        }
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection<C>> {
        self.connections.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection<C>> {
        self.connections.get_mut(handle.0)
    }

    /// Look up by the IP index; if absent, allocate with zeroed MAC and
    /// insert (§4.2). Matching ignores the UDP port (see `hash_peer`), so a
    /// session id that resurfaces from a new port on the same IP resolves to
    /// its existing connection rather than minting a new one; the caller is
    /// responsible for reconciling the stored peer afterwards (§4.3). Returns
    /// the handle and whether it was newly created.
    pub fn get_or_create(
        &mut self,
        peer: SocketAddrV4,
        session_id: u16,
        new: impl FnOnce(SocketAddrV4, u16) -> Connection<C>,
    ) -> (ConnectionHandle, bool) {
        let bucket_idx = hash_peer(peer, session_id);
        for &handle in &self.ip_index[bucket_idx] {
            let conn = &self.connections[handle.0];
            if peer_matches(conn, peer, session_id) {
                return (handle, false);
            }
        }
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        entry.insert(new(peer, session_id));
        self.ip_index[bucket_idx].push(handle);
        (handle, true)
    }

    /// Look up by the IP index without creating (§4.6's `rekey_needed` path
    /// needs to find an existing connection, not conjure a fresh one). Same
    /// port-agnostic match as `get_or_create`.
    pub fn find_by_peer(&self, peer: SocketAddrV4, session_id: u16) -> Option<ConnectionHandle> {
        let bucket_idx = hash_peer(peer, session_id);
        self.ip_index[bucket_idx]
            .iter()
            .copied()
            .find(|&h| peer_matches(&self.connections[h.0], peer, session_id))
    }

    pub fn find_by_mac(&self, mac: &MacAddr) -> Option<ConnectionHandle> {
        if mac.is_broadcast() || mac.is_zero() {
            return None;
        }
        let bucket_idx = hash_mac(mac);
        self.ether_index[bucket_idx]
            .iter()
            .copied()
            .find(|&handle| self.connections[handle.0].mac == *mac)
    }

    /// Re-learn a connection's MAC, relinking the Ethernet index (§4.2).
    /// A broadcast MAC is never stored in the Ethernet index.
    pub fn relearn_mac(&mut self, handle: ConnectionHandle, new_mac: MacAddr) {
        let old_mac = self.connections[handle.0].mac;
        if old_mac == new_mac {
            return;
        }
        if !old_mac.is_zero() && !old_mac.is_broadcast() {
            let old_bucket = hash_mac(&old_mac);
            self.ether_index[old_bucket].retain(|&h| h != handle);
        }
        self.connections[handle.0].mac = new_mac;
        if !new_mac.is_zero() && !new_mac.is_broadcast() {
            let new_bucket = hash_mac(&new_mac);
            self.ether_index[new_bucket].push(handle);
        }
    }

    pub fn unlink_ip(&mut self, handle: ConnectionHandle) {
        if let Some(conn) = self.connections.get(handle.0) {
            let bucket_idx = hash_peer(conn.peer, conn.session_id);
            self.ip_index[bucket_idx].retain(|&h| h != handle);
        }
    }

    pub fn unlink_ether(&mut self, handle: ConnectionHandle) {
        if let Some(conn) = self.connections.get(handle.0) {
            if !conn.mac.is_zero() {
                let bucket_idx = hash_mac(&conn.mac);
                self.ether_index[bucket_idx].retain(|&h| h != handle);
            }
        }
    }

    /// Unlink from both indexes and free the connection's storage. Callers
    /// are responsible for cancelling watchers/timers and releasing the
    /// context before calling this (§3 destruction order).
    pub fn destroy(&mut self, handle: ConnectionHandle) {
        self.unlink_ip(handle);
        self.unlink_ether(handle);
        if self.connections.contains(handle.0) {
            self.connections.remove(handle.0);
        }
    }

    /// All handles currently in the IP index, for the supervisor's walk (§4.8)
    /// and for broadcast fan-out (§4.5). Collected eagerly so the caller may
    /// freely destroy entries while iterating (§9 design notes).
    pub fn all_handles(&self) -> Vec<ConnectionHandle> {
        self.ip_index.iter().flatten().copied().collect()
    }

    /// Every handle currently reachable in the Ethernet index, established
    /// or not — used by the broadcast path to log which connections it
    /// skipped (§4.5).
    pub fn ether_handles(&self) -> Vec<ConnectionHandle> {
        self.ether_index.iter().flatten().copied().collect()
    }
}
