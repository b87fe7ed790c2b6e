//! Path management
//!
//! Tracks every known peer node with Echo keepalives. A peer goes
//! `Unknown -> Alive` on its first Echo Response, `Alive -> Dead` after
//! `max_missed` consecutive unanswered Echo Requests, and back to `Alive` on
//! the next response. A Restart Counter that increases between two
//! observations means the peer rebooted and lost its state.
//!
//! The manager only keeps the bookkeeping and raises [`PathEvent`]s; the
//! connection runs the ticker and tears down tunnels on restart.
//!
//! Peers added with [`PathManager::monitor`] stay until forgotten. Peers
//! learned from traffic are evicted by [`PathManager::evict_idle`] once
//! nothing refers to them.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Capacity of the path event channel
pub const EVENT_QUEUE_SIZE: usize = 256;

/// Liveness of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No Echo Response seen yet
    #[default]
    Unknown,
    /// Answered the last Echo Request
    Alive,
    /// Missed too many Echo Requests
    Dead,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerState::Unknown => write!(f, "unknown"),
            PeerState::Alive => write!(f, "alive"),
            PeerState::Dead => write!(f, "dead"),
        }
    }
}

/// Remote GTP node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Last address the peer was seen at
    pub addr: SocketAddr,
    /// Last observed Restart Counter
    pub restart_counter: Option<u8>,
    /// Liveness state
    pub state: PeerState,
    /// Consecutive unanswered Echo Requests
    pub missed: u32,
    /// Time of the last Echo Response
    pub last_echo: Option<Instant>,
    /// Whether an Echo Request is outstanding
    pub echo_in_flight: bool,
    /// Added explicitly; never evicted as idle
    pub monitored: bool,
}

impl Peer {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            restart_counter: None,
            state: PeerState::Unknown,
            missed: 0,
            last_echo: None,
            echo_in_flight: false,
            monitored: false,
        }
    }
}

/// Notification raised by the path manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathEvent {
    /// Peer answered an Echo Request after being Unknown or Dead
    PeerUp {
        /// Peer address
        peer: SocketAddr,
    },
    /// Peer missed `missed` consecutive Echo Requests
    PathDown {
        /// Peer address
        peer: SocketAddr,
        /// Consecutive misses
        missed: u32,
    },
    /// Peer restarted; its tunnels and sessions have been removed
    PeerRestarted {
        /// Peer address
        peer: SocketAddr,
        /// Restart Counter before the restart
        old_counter: u8,
        /// Restart Counter after the restart
        new_counter: u8,
        /// Local TEIDs of the removed tunnels
        removed_tunnels: Vec<u32>,
        /// Identifiers of the removed sessions
        removed_sessions: Vec<u64>,
    },
}

/// Result of comparing a received Restart Counter with the stored one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryCheck {
    /// First counter seen from this peer
    First,
    /// Same counter, or an older one arriving late
    Unchanged,
    /// Counter increased: the peer restarted
    Restarted {
        /// Previous counter
        old: u8,
        /// New counter
        new: u8,
    },
}

/// Whether `new` is ahead of `old` in 8-bit serial number arithmetic
pub fn counter_increased(old: u8, new: u8) -> bool {
    let diff = new.wrapping_sub(old);
    diff != 0 && diff < 128
}

/// Per-peer liveness bookkeeping
#[derive(Debug)]
pub struct PathManager {
    peers: Mutex<HashMap<IpAddr, Peer>>,
    max_missed: u32,
    /// Port Echo Requests go to for peers first seen as a sender
    echo_port: u16,
    events: mpsc::Sender<PathEvent>,
}

impl PathManager {
    /// Create a manager and the receiving end of its event channel.
    ///
    /// `echo_port` is where keepalives go for a peer known only from a
    /// message it sent, whose source port may be ephemeral.
    pub fn new(max_missed: u32, echo_port: u16) -> (Self, mpsc::Receiver<PathEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let manager = Self {
            peers: Mutex::new(HashMap::new()),
            max_missed: max_missed.max(1),
            echo_port,
            events: tx,
        };
        (manager, rx)
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<IpAddr, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a peer; a peer already known keeps its address
    pub fn observe(&self, addr: SocketAddr) {
        self.peers()
            .entry(addr.ip())
            .or_insert_with(|| Peer::new(addr));
    }

    /// Track a peer until it is forgotten, echoing it at `addr`
    pub fn monitor(&self, addr: SocketAddr) {
        let mut peers = self.peers();
        let peer = peers
            .entry(addr.ip())
            .or_insert_with(|| Peer::new(addr));
        peer.addr = addr;
        peer.monitored = true;
    }

    /// Remove peers that are not monitored, have no Echo outstanding and
    /// for which `in_use` is false
    pub fn evict_idle(&self, in_use: impl Fn(IpAddr) -> bool) -> Vec<Peer> {
        let mut peers = self.peers();
        let idle: Vec<IpAddr> = peers
            .values()
            .filter(|p| !p.monitored && !p.echo_in_flight && !in_use(p.addr.ip()))
            .map(|p| p.addr.ip())
            .collect();
        idle.into_iter().filter_map(|ip| peers.remove(&ip)).collect()
    }

    /// Stop tracking a peer
    pub fn forget(&self, ip: IpAddr) -> Option<Peer> {
        self.peers().remove(&ip)
    }

    /// Snapshot of a peer
    pub fn peer(&self, ip: IpAddr) -> Option<Peer> {
        self.peers().get(&ip).cloned()
    }

    /// Liveness state of a peer
    pub fn state(&self, ip: IpAddr) -> Option<PeerState> {
        self.peers().get(&ip).map(|p| p.state)
    }

    /// Snapshot of every known peer
    pub fn all(&self) -> Vec<Peer> {
        self.peers().values().cloned().collect()
    }

    /// Mark an Echo Request as outstanding.
    ///
    /// Returns `false` when one is already in flight, so a slow peer never
    /// accumulates overlapping keepalives.
    pub fn begin_echo(&self, ip: IpAddr) -> bool {
        match self.peers().get_mut(&ip) {
            Some(peer) if !peer.echo_in_flight => {
                peer.echo_in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Clear the outstanding Echo flag without counting a miss
    pub fn abort_echo(&self, ip: IpAddr) {
        if let Some(peer) = self.peers().get_mut(&ip) {
            peer.echo_in_flight = false;
        }
    }

    /// Compare and store a Restart Counter received from `addr`.
    ///
    /// A peer not yet known is added with the echo port, not the sender's
    /// source port.
    pub fn record_recovery(&self, addr: SocketAddr, counter: u8) -> RecoveryCheck {
        let echo_addr = SocketAddr::new(addr.ip(), self.echo_port);
        let mut peers = self.peers();
        let peer = peers
            .entry(addr.ip())
            .or_insert_with(|| Peer::new(echo_addr));
        match peer.restart_counter {
            None => {
                peer.restart_counter = Some(counter);
                RecoveryCheck::First
            }
            Some(old) if counter_increased(old, counter) => {
                peer.restart_counter = Some(counter);
                RecoveryCheck::Restarted { old, new: counter }
            }
            Some(_) => RecoveryCheck::Unchanged,
        }
    }

    /// Record an answered Echo Request
    pub fn echo_succeeded(&self, addr: SocketAddr) {
        let came_up = {
            let mut peers = self.peers();
            let peer = peers
                .entry(addr.ip())
                .or_insert_with(|| Peer::new(addr));
            peer.addr = addr;
            peer.missed = 0;
            peer.echo_in_flight = false;
            peer.last_echo = Some(Instant::now());
            let came_up = peer.state != PeerState::Alive;
            peer.state = PeerState::Alive;
            came_up
        };
        if came_up {
            info!(peer = %addr, "path up");
            self.emit(PathEvent::PeerUp { peer: addr });
        }
    }

    /// Record an unanswered Echo Request
    pub fn echo_failed(&self, addr: SocketAddr) {
        let went_down = {
            let mut peers = self.peers();
            let Some(peer) = peers.get_mut(&addr.ip()) else {
                return;
            };
            peer.echo_in_flight = false;
            peer.missed = peer.missed.saturating_add(1);
            if peer.missed >= self.max_missed && peer.state != PeerState::Dead {
                peer.state = PeerState::Dead;
                Some(peer.missed)
            } else {
                None
            }
        };
        if let Some(missed) = went_down {
            warn!(peer = %addr, missed, "path down");
            self.emit(PathEvent::PathDown { peer: addr, missed });
        }
    }

    /// Queue an event; dropped with a warning if nobody drains the channel
    pub fn emit(&self, event: PathEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!(error = %e, "path event dropped");
        }
    }
}
