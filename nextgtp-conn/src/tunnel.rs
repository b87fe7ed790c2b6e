//! Tunnel table
//!
//! TEID-keyed table of the tunnels owned by one connection. The map is split
//! into shards by TEID so the receive loop, the path manager and senders do
//! not contend on a single lock.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::TunnelError;

/// Number of shards the table is split into
const SHARDS: usize = 16;

/// Random draws before allocation gives up
const ALLOCATION_ATTEMPTS: usize = 64;

/// One data-plane tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tunnel {
    /// TEID allocated by this node; G-PDUs addressed to it belong to this tunnel
    pub local_teid: u32,
    /// TEID the peer expects on G-PDUs sent to it
    pub peer_teid: u32,
    /// Peer GTP endpoint
    pub peer_addr: SocketAddr,
    /// Owning session, if any
    pub session_id: Option<u64>,
    /// Subscriber address carried inside the tunnel (needed for kernel GTP)
    pub ms_addr: Option<IpAddr>,
}

impl Tunnel {
    /// Create a tunnel
    pub fn new(local_teid: u32, peer_teid: u32, peer_addr: SocketAddr) -> Self {
        Self {
            local_teid,
            peer_teid,
            peer_addr,
            session_id: None,
            ms_addr: None,
        }
    }

    /// Attach the tunnel to a session
    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Set the subscriber address
    pub fn with_ms_addr(mut self, ms_addr: IpAddr) -> Self {
        self.ms_addr = Some(ms_addr);
        self
    }
}

#[derive(Debug)]
enum Slot {
    /// TEID handed out by `allocate_teid` but not yet filled
    Reserved,
    Active(Tunnel),
}

/// Sharded TEID table
#[derive(Debug)]
pub struct TunnelTable {
    shards: Vec<RwLock<HashMap<u32, Slot>>>,
}

impl Default for TunnelTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, teid: u32) -> &RwLock<HashMap<u32, Slot>> {
        &self.shards[teid as usize % SHARDS]
    }

    fn read(&self, teid: u32) -> RwLockReadGuard<'_, HashMap<u32, Slot>> {
        self.shard(teid).read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, teid: u32) -> RwLockWriteGuard<'_, HashMap<u32, Slot>> {
        self.shard(teid).write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a random, non-zero TEID that is not in use.
    ///
    /// The TEID is reserved until it is filled by [`insert`](Self::insert)
    /// or given back with [`release`](Self::release).
    pub fn allocate_teid(&self) -> Result<u32, TunnelError> {
        for _ in 0..ALLOCATION_ATTEMPTS {
            let teid = rand::random::<u32>();
            if teid == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.write(teid).entry(teid) {
                slot.insert(Slot::Reserved);
                return Ok(teid);
            }
        }
        Err(TunnelError::TeidSpaceExhausted)
    }

    /// Give back a TEID reserved by `allocate_teid` that was never used
    pub fn release(&self, teid: u32) -> bool {
        let mut shard = self.write(teid);
        if matches!(shard.get(&teid), Some(Slot::Reserved)) {
            shard.remove(&teid);
            true
        } else {
            false
        }
    }

    /// Insert a tunnel into a reserved or free slot
    pub fn insert(&self, tunnel: Tunnel) -> Result<(), TunnelError> {
        let teid = tunnel.local_teid;
        if teid == 0 {
            return Err(TunnelError::InvalidTeid(teid));
        }
        let mut shard = self.write(teid);
        match shard.get(&teid) {
            Some(Slot::Active(_)) => Err(TunnelError::DuplicateTeid(teid)),
            _ => {
                shard.insert(teid, Slot::Active(tunnel));
                Ok(())
            }
        }
    }

    /// Remove a tunnel
    pub fn remove(&self, teid: u32) -> Result<Tunnel, TunnelError> {
        let mut shard = self.write(teid);
        match shard.remove(&teid) {
            Some(Slot::Active(tunnel)) => Ok(tunnel),
            Some(Slot::Reserved) => {
                shard.insert(teid, Slot::Reserved);
                Err(TunnelError::TunnelNotFound(teid))
            }
            None => Err(TunnelError::TunnelNotFound(teid)),
        }
    }

    /// Look up a tunnel by local TEID
    pub fn get(&self, teid: u32) -> Option<Tunnel> {
        match self.read(teid).get(&teid) {
            Some(Slot::Active(tunnel)) => Some(tunnel.clone()),
            _ => None,
        }
    }

    /// Whether an active tunnel uses this TEID
    pub fn contains(&self, teid: u32) -> bool {
        matches!(self.read(teid).get(&teid), Some(Slot::Active(_)))
    }

    fn collect(&self, mut pred: impl FnMut(&Tunnel) -> bool) -> Vec<Tunnel> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().unwrap_or_else(PoisonError::into_inner);
            out.extend(shard.values().filter_map(|slot| match slot {
                Slot::Active(t) if pred(t) => Some(t.clone()),
                _ => None,
            }));
        }
        out
    }

    /// Tunnels towards a peer node
    pub fn for_peer(&self, ip: IpAddr) -> Vec<Tunnel> {
        self.collect(|t| t.peer_addr.ip() == ip)
    }

    /// Find the tunnel a peer reaches with `peer_teid`
    pub fn find_by_peer_teid(&self, ip: IpAddr, peer_teid: u32) -> Option<Tunnel> {
        self.collect(|t| t.peer_addr.ip() == ip && t.peer_teid == peer_teid)
            .into_iter()
            .next()
    }

    /// Whether any tunnel points at a peer node
    pub fn has_peer(&self, ip: IpAddr) -> bool {
        self.shards.iter().any(|shard| {
            shard
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .any(|slot| matches!(slot, Slot::Active(t) if t.peer_addr.ip() == ip))
        })
    }

    /// Remove every tunnel towards a peer node
    pub fn remove_by_peer(&self, ip: IpAddr) -> Vec<Tunnel> {
        self.remove_where(|t| t.peer_addr.ip() == ip)
    }

    /// Remove every tunnel matching `pred`
    pub fn remove_where(&self, pred: impl Fn(&Tunnel) -> bool) -> Vec<Tunnel> {
        let mut removed = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.write().unwrap_or_else(PoisonError::into_inner);
            let teids: Vec<u32> = shard
                .iter()
                .filter_map(|(teid, slot)| match slot {
                    Slot::Active(t) if pred(t) => Some(*teid),
                    _ => None,
                })
                .collect();
            for teid in teids {
                if let Some(Slot::Active(tunnel)) = shard.remove(&teid) {
                    removed.push(tunnel);
                }
            }
        }
        removed
    }

    /// Snapshot of every active tunnel
    pub fn all(&self) -> Vec<Tunnel> {
        self.collect(|_| true)
    }

    /// Number of active tunnels
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| {
                s.read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .filter(|slot| matches!(slot, Slot::Active(_)))
                    .count()
            })
            .sum()
    }

    /// Whether the table has no active tunnels
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
