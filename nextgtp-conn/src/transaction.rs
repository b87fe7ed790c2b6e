//! Transaction tracker
//!
//! Matches responses to outstanding requests by `(peer, sequence number)` and
//! owns retransmission. Each transaction moves through
//! `Pending(0) -> Pending(1) -> ... -> Matched | TimedOut | Cancelled` and is
//! resolved exactly once through a oneshot channel.
//!
//! Sequence numbers are scoped per peer socket address. Each peer starts at a
//! random value and wraps at the protocol width (16 bits for GTPv1, 24 bits
//! for GTPv2), skipping numbers that are still in flight. A peer's cursor is
//! dropped when its last transaction ends.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use nextgtp_codec::{GtpMessage, Message};
use nextgtp_common::{log_gtp_message, Direction, GtpVersion, RetryConfig, UdpTransport};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::{ConnError, TransactionError};

/// Number of shards the pending map is split into
const SHARDS: usize = 16;

/// Retransmission policy for one request
///
/// The interval is fixed: a request that never gets an answer is sent
/// `max_retries + 1` times and times out `(max_retries + 1) * interval`
/// after the first send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time between transmissions
    pub interval: Duration,
    /// Retransmissions after the initial send
    pub max_retries: u32,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(interval: Duration, max_retries: u32) -> Self {
        Self {
            interval,
            max_retries,
        }
    }

    /// Total time before a silent peer causes a timeout
    pub fn deadline(&self) -> Duration {
        self.interval * (self.max_retries + 1)
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.interval(), config.max_retries)
    }
}

type TxKey = (SocketAddr, u32);
type TxResult = Result<GtpMessage, TransactionError>;

struct Pending {
    /// Distinguishes this transaction from a later one reusing the key
    id: u64,
    request: Bytes,
    retries: u32,
    resolve: oneshot::Sender<TxResult>,
    timer: Option<JoinHandle<()>>,
}

impl Pending {
    fn finish(self, result: TxResult) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // The caller may already have gone away
        let _ = self.resolve.send(result);
    }
}

enum RetryStep {
    Resend(Bytes),
    Expired(Pending),
}

/// Sequence state for one peer
#[derive(Debug, Default)]
struct Cursor {
    next: u32,
    in_flight: usize,
}

/// A transaction that has been assigned a sequence number and is pending
pub struct Registration {
    /// Peer the request is addressed to
    pub peer: SocketAddr,
    /// Sequence number written into the request
    pub sequence: u32,
    /// Encoded request, transmitted as-is on every retry
    pub bytes: Bytes,
    id: u64,
    rx: oneshot::Receiver<TxResult>,
}

/// Transaction tracker shared by the receive loop, retry timers and senders
pub struct TransactionTracker {
    version: GtpVersion,
    transport: UdpTransport,
    shards: Vec<Mutex<HashMap<TxKey, Pending>>>,
    /// Sequence cursor per peer with transactions in flight; lock before any shard
    sequences: Mutex<HashMap<SocketAddr, Cursor>>,
    next_id: AtomicU64,
    retransmissions: AtomicU64,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TransactionTracker {
    /// Create a tracker sending retransmissions through `transport`
    pub fn new(version: GtpVersion, transport: UdpTransport) -> Self {
        Self {
            version,
            transport,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            sequences: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            retransmissions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn shard(&self, seq: u32) -> &Mutex<HashMap<TxKey, Pending>> {
        &self.shards[seq as usize % SHARDS]
    }

    /// Allocate a sequence number for `peer`, write it into `msg` and record
    /// the transaction as pending.
    ///
    /// Allocation and insertion happen under the same lock, so two
    /// concurrent registrations towards one peer never share a number.
    pub fn register(&self, peer: SocketAddr, msg: &mut GtpMessage) -> Result<Registration, ConnError> {
        let max = self.version.max_sequence();

        let mut sequences = lock(&self.sequences);
        if self.closed.load(Ordering::Acquire) {
            return Err(TransactionError::Closed.into());
        }
        let cursor = sequences.entry(peer).or_insert_with(|| Cursor {
            next: rand::random::<u32>() & max,
            in_flight: 0,
        });

        let start = cursor.next;
        let mut seq = start;
        loop {
            let mut shard = lock(self.shard(seq));
            if !shard.contains_key(&(peer, seq)) {
                let encoded = msg
                    .set_sequence(seq)
                    .and_then(|()| msg.marshal())
                    .map_err(ConnError::from);
                let bytes = match encoded {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        if cursor.in_flight == 0 {
                            sequences.remove(&peer);
                        }
                        return Err(e);
                    }
                };
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                shard.insert(
                    (peer, seq),
                    Pending {
                        id,
                        request: bytes.clone(),
                        retries: 0,
                        resolve: tx,
                        timer: None,
                    },
                );
                cursor.next = seq.wrapping_add(1) & max;
                cursor.in_flight += 1;
                trace!(peer = %peer, seq, "transaction registered");
                return Ok(Registration {
                    peer,
                    sequence: seq,
                    bytes,
                    id,
                    rx,
                });
            }
            drop(shard);

            seq = seq.wrapping_add(1) & max;
            if seq == start {
                return Err(TransactionError::SequenceExhausted(peer).into());
            }
        }
    }

    /// Start the retransmission timer for a registered transaction.
    ///
    /// Does nothing if the transaction already reached a terminal state,
    /// which happens when the response beats the call to `arm`.
    pub fn arm(self: &Arc<Self>, reg: &Registration, policy: RetryPolicy) {
        let key = (reg.peer, reg.sequence);
        let mut shard = lock(self.shard(reg.sequence));
        let Some(pending) = shard.get_mut(&key).filter(|p| p.id == reg.id) else {
            return;
        };

        let tracker = Arc::clone(self);
        let id = reg.id;
        pending.timer = Some(tokio::spawn(async move {
            tracker.retry_loop(key, id, policy).await;
        }));
    }

    async fn retry_loop(&self, key: TxKey, id: u64, policy: RetryPolicy) {
        loop {
            tokio::time::sleep(policy.interval).await;

            let step = {
                let mut shard = lock(self.shard(key.1));
                let Some(pending) = shard.get_mut(&key).filter(|p| p.id == id) else {
                    return;
                };
                if pending.retries < policy.max_retries {
                    pending.retries += 1;
                    RetryStep::Resend(pending.request.clone())
                } else {
                    let Some(pending) = shard.remove(&key) else {
                        return;
                    };
                    RetryStep::Expired(pending)
                }
            };
            let request = match step {
                RetryStep::Resend(request) => request,
                RetryStep::Expired(mut pending) => {
                    // Resolving ourselves; aborting our own handle is pointless
                    pending.timer = None;
                    let retransmissions = pending.retries;
                    debug!(peer = %key.0, seq = key.1, retransmissions, "transaction timed out");
                    pending.finish(Err(TransactionError::TimedOut { retransmissions }));
                    self.retire(key.0);
                    return;
                }
            };

            self.retransmissions.fetch_add(1, Ordering::Relaxed);
            debug!(peer = %key.0, seq = key.1, "retransmitting request");
            if let Err(e) = self.transport.send_to(&request, key.0).await {
                warn!(peer = %key.0, seq = key.1, error = %e, "retransmission failed");
            }
        }
    }

    /// Account for a transaction of `peer` that reached a terminal state.
    ///
    /// Must be called without holding a shard lock.
    fn retire(&self, peer: SocketAddr) {
        let mut sequences = lock(&self.sequences);
        if let Some(cursor) = sequences.get_mut(&peer) {
            cursor.in_flight = cursor.in_flight.saturating_sub(1);
            if cursor.in_flight == 0 {
                sequences.remove(&peer);
            }
        }
    }

    fn guard(&self, reg: &Registration) -> CancelOnDrop<'_> {
        CancelOnDrop {
            tracker: self,
            key: (reg.peer, reg.sequence),
            id: reg.id,
            active: true,
        }
    }

    /// Wait for the transaction to reach a terminal state
    ///
    /// Dropping the returned future cancels the transaction.
    pub async fn wait(&self, reg: Registration) -> TxResult {
        let mut guard = self.guard(&reg);
        let result = reg.rx.await.unwrap_or(Err(TransactionError::Cancelled));
        guard.active = false;
        result
    }

    /// Register, transmit and arm a request, then wait for its outcome.
    ///
    /// Dropping the returned future at any point cancels the transaction.
    pub async fn send(
        self: &Arc<Self>,
        peer: SocketAddr,
        mut msg: GtpMessage,
        policy: RetryPolicy,
    ) -> Result<GtpMessage, ConnError> {
        let reg = self.register(peer, &mut msg)?;
        let mut guard = self.guard(&reg);

        log_gtp_message(Direction::Tx, msg.version(), msg.name(), &reg.bytes);
        self.transport.send_to(&reg.bytes, peer).await?;
        self.arm(&reg, policy);

        let result = reg.rx.await.unwrap_or(Err(TransactionError::Cancelled));
        guard.active = false;
        Ok(result?)
    }

    /// Resolve the pending transaction matching a received response.
    ///
    /// Returns `false` when nothing was pending for `(peer, sequence)`;
    /// duplicate or late responses end up here and are ignored.
    pub fn on_response(&self, peer: SocketAddr, msg: &GtpMessage) -> bool {
        let Some(seq) = msg.sequence() else {
            return false;
        };
        let pending = lock(self.shard(seq)).remove(&(peer, seq));
        match pending {
            Some(pending) => {
                trace!(peer = %peer, seq, retries = pending.retries, "transaction matched");
                pending.finish(Ok(msg.clone()));
                self.retire(peer);
                true
            }
            None => {
                debug!(peer = %peer, seq, "no pending transaction for response");
                false
            }
        }
    }

    fn cancel_id(&self, key: TxKey, id: u64) {
        let mut shard = lock(self.shard(key.1));
        if shard.get(&key).is_some_and(|p| p.id == id) {
            if let Some(pending) = shard.remove(&key) {
                drop(shard);
                trace!(peer = %key.0, seq = key.1, "transaction cancelled");
                pending.finish(Err(TransactionError::Cancelled));
                self.retire(key.0);
            }
        }
    }

    /// Cancel the transaction pending for `(peer, seq)`, if any
    pub fn cancel(&self, peer: SocketAddr, seq: u32) -> bool {
        let pending = lock(self.shard(seq)).remove(&(peer, seq));
        match pending {
            Some(pending) => {
                pending.finish(Err(TransactionError::Cancelled));
                self.retire(peer);
                true
            }
            None => false,
        }
    }

    /// Cancel everything pending and refuse new registrations
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Pending> = {
            let mut sequences = lock(&self.sequences);
            self.closed.store(true, Ordering::Release);
            let drained = self
                .shards
                .iter()
                .flat_map(|shard| lock(shard).drain().map(|(_, p)| p).collect::<Vec<_>>())
                .collect();
            sequences.clear();
            drained
        };
        let cancelled = drained.len();
        for pending in drained {
            pending.finish(Err(TransactionError::Cancelled));
        }
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending transactions");
        }
        cancelled
    }

    /// Whether a transaction is pending for `(peer, seq)`
    pub fn is_pending(&self, peer: SocketAddr, seq: u32) -> bool {
        lock(self.shard(seq)).contains_key(&(peer, seq))
    }

    /// Number of transactions currently pending
    pub fn pending_count(&self) -> usize {
        self.shards.iter().map(|s| lock(s).len()).sum()
    }

    /// Number of peers with sequence state, i.e. with requests in flight
    pub fn tracked_peers(&self) -> usize {
        lock(&self.sequences).len()
    }

    /// Total retransmissions sent since creation
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions.load(Ordering::Relaxed)
    }
}

struct CancelOnDrop<'a> {
    tracker: &'a TransactionTracker,
    key: TxKey,
    id: u64,
    active: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.active {
            self.tracker.cancel_id(self.key, self.id);
        }
    }
}
