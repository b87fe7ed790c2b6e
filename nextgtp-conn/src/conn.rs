//! GTP connection
//!
//! A [`Conn`] owns one UDP socket and everything attached to it: the handler
//! table, the transaction tracker, the tunnel and session tables, the path
//! manager and, optionally, a kernel GTP bridge.
//!
//! One task runs [`Conn::listen_and_serve`]; any number of tasks may send
//! requests, manage tunnels or read user-plane packets concurrently.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use bytes::Bytes;
use nextgtp_codec::{parse, GtpMessage, Gtpv1Message, Message};
use nextgtp_common::{
    format_hex_dump, log_gtp_message, validate_conn_config, ConnConfig, Direction, GtpRole,
    GtpVersion, UdpTransport,
};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ConnError, HandlerError, KernelError, TransactionError};
use crate::handler::{self, Handler};
use crate::kernel::{IpCommandControl, KernelBridge, KernelControl, KernelTunnel, MemoryControl};
use crate::path::{PathEvent, PathManager, RecoveryCheck};
use crate::session::{Session, SessionTable};
use crate::transaction::{RetryPolicy, TransactionTracker};
use crate::tunnel::{Tunnel, TunnelTable};

/// G-PDU received on a known tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPacket {
    /// Local TEID the packet arrived on
    pub teid: u32,
    /// Sender
    pub peer: SocketAddr,
    /// T-PDU
    pub payload: Bytes,
}

struct Relay {
    target: Conn,
    teid_out: u32,
    peer: SocketAddr,
}

struct ConnInner {
    config: ConnConfig,
    local_addr: SocketAddr,
    transport: UdpTransport,
    transactions: Arc<TransactionTracker>,
    tunnels: TunnelTable,
    sessions: SessionTable,
    path: PathManager,
    path_events: Mutex<Option<mpsc::Receiver<PathEvent>>>,
    handlers: RwLock<HashMap<u8, Handler>>,
    default_handler: RwLock<Handler>,
    relays: RwLock<HashMap<u32, Relay>>,
    user_tx: mpsc::Sender<UserPacket>,
    user_rx: tokio::sync::Mutex<mpsc::Receiver<UserPacket>>,
    kernel: RwLock<Option<Arc<KernelBridge>>>,
    shutdown: watch::Sender<bool>,
    /// Held by the running receive loop
    serving: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// GTP connection bound to one local UDP address
///
/// Cloning is cheap; every clone refers to the same connection.
///
/// # Example
///
/// ```ignore
/// use nextgtp_common::{ConnConfig, GtpVersion};
/// use nextgtp_codec::GtpMessage;
/// use nextgtp_conn::Conn;
///
/// let conn = Conn::bind(ConnConfig::new("0.0.0.0:2123".parse()?, GtpVersion::V2)).await?;
/// let (_stop, stop_rx) = tokio::sync::watch::channel(false);
/// tokio::spawn({
///     let conn = conn.clone();
///     async move { conn.listen_and_serve(stop_rx).await }
/// });
///
/// let echo = GtpMessage::echo_request(GtpVersion::V2, 0, conn.restart_counter());
/// let response = conn.send_request("192.0.2.1:2123".parse()?, echo).await?;
/// conn.close().await?;
/// ```
#[derive(Clone)]
pub struct Conn {
    inner: Arc<ConnInner>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("local_addr", &self.inner.local_addr)
            .field("version", &self.inner.config.version)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Conn {
    /// Bind a connection to `config.local_addr`.
    ///
    /// Installs the built-in handlers, starts the path manager ticker when
    /// enabled, starts monitoring the configured peers and creates the
    /// kernel GTP device when configured.
    pub async fn bind(config: ConnConfig) -> Result<Self, ConnError> {
        validate_conn_config(&config)?;

        let transport = UdpTransport::bind(config.local_addr).await?;
        let local_addr = transport.local_addr()?;
        let transactions = Arc::new(TransactionTracker::new(config.version, transport.clone()));
        let (path, path_events) = PathManager::new(config.path.max_missed, local_addr.port());
        let (user_tx, user_rx) = mpsc::channel(config.user_plane_queue);
        let (shutdown, _) = watch::channel(false);

        let handlers: HashMap<u8, Handler> = handler::defaults(config.version).into_iter().collect();

        let conn = Self {
            inner: Arc::new(ConnInner {
                local_addr,
                transport,
                transactions,
                tunnels: TunnelTable::new(),
                sessions: SessionTable::new(),
                path,
                path_events: Mutex::new(Some(path_events)),
                handlers: RwLock::new(handlers),
                default_handler: RwLock::new(handler::default_handler()),
                relays: RwLock::new(HashMap::new()),
                user_tx,
                user_rx: tokio::sync::Mutex::new(user_rx),
                kernel: RwLock::new(None),
                shutdown,
                serving: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
                config,
            }),
        };

        info!(
            local = %local_addr,
            version = %conn.version(),
            restart_counter = conn.restart_counter(),
            "GTP connection bound"
        );

        for peer in conn.inner.config.peers.clone() {
            conn.monitor_peer(peer);
        }
        if conn.inner.config.path.enabled {
            conn.start_path_ticker();
        }
        if let Some(kernel) = conn.inner.config.kernel.clone() {
            let control: Arc<dyn KernelControl> = if kernel.dry_run {
                Arc::new(MemoryControl::new())
            } else {
                Arc::new(IpCommandControl::new())
            };
            conn.enable_kernel_gtp_with(control, &kernel.device, kernel.role)
                .await?;
        }

        Ok(conn)
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// GTP version spoken on this connection
    pub fn version(&self) -> GtpVersion {
        self.inner.config.version
    }

    /// Configuration the connection was bound with
    pub fn config(&self) -> &ConnConfig {
        &self.inner.config
    }

    /// Restart Counter advertised in Recovery IEs
    pub fn restart_counter(&self) -> u8 {
        self.inner.config.restart_counter
    }

    /// Retry policy used by [`send_request`](Self::send_request)
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.inner.config.retry)
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Handlers and receive loop
    // ========================================================================

    /// Register a handler for a message type, replacing any previous one
    pub fn add_handler<F>(&self, msg_type: u8, handler: F)
    where
        F: Fn(&Conn, SocketAddr, GtpMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(msg_type, Arc::new(handler));
    }

    /// Remove the handler for a message type; returns whether one was set
    pub fn remove_handler(&self, msg_type: u8) -> bool {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&msg_type)
            .is_some()
    }

    /// Replace the handler used for message types nobody registered
    pub fn set_default_handler<F>(&self, handler: F)
    where
        F: Fn(&Conn, SocketAddr, GtpMessage) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        *self
            .inner
            .default_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    fn handler_for(&self, msg_type: u8) -> Handler {
        let registered = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&msg_type)
            .cloned();
        registered.unwrap_or_else(|| {
            self.inner
                .default_handler
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Receive and dispatch datagrams until `shutdown` turns true, the
    /// connection is closed, or the socket fails.
    ///
    /// Only one receive loop may run per connection.
    pub async fn listen_and_serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        let Ok(_serving) = self.inner.serving.try_lock() else {
            return Err(ConnError::AlreadyServing);
        };

        let mut closed = self.inner.shutdown.subscribe();
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        let mut buf = vec![0u8; self.inner.config.recv_buffer_size];
        info!(local = %self.inner.local_addr, "GTP receive loop started");

        let result = loop {
            tokio::select! {
                received = self.inner.transport.recv_from(&mut buf) => {
                    match received {
                        Ok((len, src)) => self.dispatch(&buf[..len], src),
                        Err(e) => {
                            if self.is_closed() {
                                break Ok(());
                            }
                            error!(local = %self.inner.local_addr, error = %e, "socket receive failed");
                            break Err(ConnError::Transport(e));
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
                _ = closed.changed() => break Ok(()),
            }
        };

        info!(local = %self.inner.local_addr, "GTP receive loop stopped");
        result
    }

    /// Decode one datagram and route it
    fn dispatch(&self, data: &[u8], src: SocketAddr) {
        let msg = match parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %src, len = data.len(), error = %e, "dropping undecodable datagram");
                trace!(peer = %src, "undecodable datagram:\n{}", format_hex_dump(data));
                return;
            }
        };
        log_gtp_message(Direction::Rx, msg.version(), msg.name(), data);

        if msg.version() != self.version() {
            self.reject_version(src, &msg);
            return;
        }

        if msg.is_response() && self.inner.transactions.on_response(src, &msg) {
            return;
        }

        let msg_type = msg.message_type();
        let handler = self.handler_for(msg_type);
        match catch_unwind(AssertUnwindSafe(|| handler(self, src, msg))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(peer = %src, msg_type, error = %e, "handler failed"),
            Err(_) => error!(peer = %src, msg_type, "handler panicked"),
        }
    }

    fn reject_version(&self, src: SocketAddr, msg: &GtpMessage) {
        let Some(seq) = msg.sequence() else {
            debug!(peer = %src, version = %msg.version(), "dropping message of foreign version");
            return;
        };
        if msg.is_response() {
            debug!(peer = %src, version = %msg.version(), "dropping response of foreign version");
            return;
        }
        let reply = GtpMessage::version_not_supported(self.version(), seq & self.version().max_sequence());
        if let Err(e) = self.reply(src, &reply) {
            warn!(peer = %src, error = %e, "failed to send Version Not Supported");
        }
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn ensure_sendable(&self, msg: &GtpMessage) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        if msg.version() != self.version() {
            return Err(ConnError::VersionMismatch {
                expected: self.version(),
                actual: msg.version(),
            });
        }
        Ok(())
    }

    /// Send a request and wait for the matching response, retransmitting
    /// with the configured policy.
    ///
    /// The sequence number is allocated here and overwrites whatever `msg`
    /// carried. Dropping the future cancels the request.
    pub async fn send_request(&self, peer: SocketAddr, msg: GtpMessage) -> Result<GtpMessage, ConnError> {
        self.send_request_with(peer, msg, self.retry_policy()).await
    }

    /// [`send_request`](Self::send_request) with an explicit retry policy
    pub async fn send_request_with(
        &self,
        peer: SocketAddr,
        msg: GtpMessage,
        policy: RetryPolicy,
    ) -> Result<GtpMessage, ConnError> {
        self.ensure_sendable(&msg)?;
        self.inner.path.observe(peer);
        self.inner.transactions.send(peer, msg, policy).await
    }

    /// Send a message without waiting for an answer
    pub async fn send_message(&self, peer: SocketAddr, msg: &GtpMessage) -> Result<(), ConnError> {
        self.ensure_sendable(msg)?;
        let bytes = msg.marshal()?;
        log_gtp_message(Direction::Tx, msg.version(), msg.name(), &bytes);
        self.inner.transport.send_to(&bytes, peer).await?;
        Ok(())
    }

    /// Send a message without suspending; for use inside handlers
    pub fn reply(&self, peer: SocketAddr, msg: &GtpMessage) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        let bytes = msg.marshal()?;
        log_gtp_message(Direction::Tx, msg.version(), msg.name(), &bytes);
        self.inner.transport.try_send_to(&bytes, peer)?;
        Ok(())
    }

    /// Number of requests waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.transactions.pending_count()
    }

    /// Retransmissions sent since the connection was bound
    pub fn retransmissions(&self) -> u64 {
        self.inner.transactions.retransmissions()
    }

    // ========================================================================
    // User plane
    // ========================================================================

    /// Send a T-PDU through a tunnel as a G-PDU
    pub async fn write_to_gtp(&self, teid: u32, payload: Bytes, peer: SocketAddr) -> Result<usize, ConnError> {
        let len = payload.len();
        self.send_message(peer, &GtpMessage::V1(Gtpv1Message::g_pdu(teid, payload)))
            .await?;
        Ok(len)
    }

    /// Wait for the next G-PDU received on a known tunnel
    pub async fn read_from_gtp(&self) -> Result<UserPacket, ConnError> {
        let mut closed = self.inner.shutdown.subscribe();
        if *closed.borrow_and_update() {
            return Err(ConnError::Closed);
        }
        let mut rx = self.inner.user_rx.lock().await;
        tokio::select! {
            packet = rx.recv() => packet.ok_or(ConnError::Closed),
            _ = closed.changed() => Err(ConnError::Closed),
        }
    }

    pub(crate) fn deliver(&self, packet: UserPacket) {
        if let Err(e) = self.inner.user_tx.try_send(packet) {
            warn!(error = %e, "user-plane queue full, dropping G-PDU");
        }
    }

    /// Forward G-PDUs arriving on `teid_in` out of `target` to `peer` with `teid_out`
    pub fn relay_to(&self, target: &Conn, teid_in: u32, teid_out: u32, peer: SocketAddr) {
        debug!(teid_in, teid_out, peer = %peer, "relay added");
        self.inner
            .relays
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                teid_in,
                Relay {
                    target: target.clone(),
                    teid_out,
                    peer,
                },
            );
    }

    /// Stop relaying `teid_in`; returns whether a relay existed
    pub fn remove_relay(&self, teid_in: u32) -> bool {
        self.inner
            .relays
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&teid_in)
            .is_some()
    }

    pub(crate) fn relay_for(&self, teid_in: u32) -> Option<(Conn, u32, SocketAddr)> {
        self.inner
            .relays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&teid_in)
            .map(|r| (r.target.clone(), r.teid_out, r.peer))
    }

    // ========================================================================
    // Tunnels and sessions
    // ========================================================================

    /// Tunnel table of this connection
    pub fn tunnels(&self) -> &TunnelTable {
        &self.inner.tunnels
    }

    /// Session table of this connection
    pub fn sessions(&self) -> &SessionTable {
        &self.inner.sessions
    }

    /// Allocate an unused, non-zero local TEID
    pub fn allocate_teid(&self) -> Result<u32, ConnError> {
        Ok(self.inner.tunnels.allocate_teid()?)
    }

    /// Give back a TEID that was allocated but never used for a tunnel
    pub fn release_teid(&self, teid: u32) -> bool {
        self.inner.tunnels.release(teid)
    }

    /// Add a tunnel, mirroring it into the kernel when kernel GTP is enabled.
    ///
    /// Tunnels without a subscriber address stay in user space. If kernel
    /// programming fails the table insert is rolled back.
    pub async fn add_tunnel(&self, tunnel: Tunnel) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        let teid = tunnel.local_teid;
        let kernel_tunnel = tunnel.ms_addr.map(|ms_addr| KernelTunnel {
            local_teid: teid,
            peer_teid: tunnel.peer_teid,
            peer_ip: tunnel.peer_addr.ip(),
            ms_addr,
        });
        let peer = tunnel.peer_addr;
        self.inner.tunnels.insert(tunnel)?;

        if let (Some(bridge), Some(kt)) = (self.kernel_bridge(), kernel_tunnel) {
            if let Err(e) = bridge.add_tunnel(kt).await {
                warn!(teid, error = %e, "kernel tunnel failed, rolling back");
                self.roll_back_tunnel(teid);
                return Err(match e {
                    KernelError::Closed => ConnError::Closed,
                    e => e.into(),
                });
            }
        }
        // Closed while the kernel was being programmed; close removes the objects
        if self.is_closed() {
            self.roll_back_tunnel(teid);
            return Err(ConnError::Closed);
        }
        self.inner.path.observe(peer);
        debug!(teid, "tunnel added");
        Ok(())
    }

    fn roll_back_tunnel(&self, teid: u32) {
        if let Err(e) = self.inner.tunnels.remove(teid) {
            debug!(teid, error = %e, "tunnel already gone during rollback");
        }
    }

    /// Remove a tunnel and its kernel objects.
    ///
    /// A missing TEID is reported as `TunnelNotFound`. When the kernel
    /// cannot follow, the tunnel is gone from the table and
    /// [`ConnError::Degraded`] is returned; the leftovers are retried on close.
    pub async fn del_tunnel_by_teid(&self, teid: u32) -> Result<Tunnel, ConnError> {
        let tunnel = self.inner.tunnels.remove(teid)?;
        self.remove_relay(teid);

        if tunnel.ms_addr.is_some() {
            if let Some(bridge) = self.kernel_bridge() {
                bridge
                    .del_tunnel(teid)
                    .await
                    .map_err(|source| ConnError::Degraded { tunnel: teid, source })?;
            }
        }
        debug!(teid, "tunnel removed");
        Ok(tunnel)
    }

    /// Look up a tunnel by local TEID
    pub fn tunnel(&self, teid: u32) -> Option<Tunnel> {
        self.inner.tunnels.get(teid)
    }

    /// Tunnels towards a peer node
    pub fn tunnels_for_peer(&self, ip: IpAddr) -> Vec<Tunnel> {
        self.inner.tunnels.for_peer(ip)
    }

    /// Add a session; returns its identifier
    pub fn add_session(&self, session: Session) -> Result<u64, ConnError> {
        let peer = session.peer_addr;
        let id = self.inner.sessions.insert(session)?;
        self.inner.path.observe(peer);
        Ok(id)
    }

    /// Update a session in place; IMSI and TEID indexes follow the change
    pub fn modify_session(&self, id: u64, f: impl FnOnce(&mut Session)) -> Result<Session, ConnError> {
        Ok(self.inner.sessions.modify(id, f)?)
    }

    /// Look up a session by identifier
    pub fn session(&self, id: u64) -> Option<Session> {
        self.inner.sessions.get(id)
    }

    /// Remove a session; its tunnels are left alone
    pub fn remove_session(&self, id: u64) -> Result<Session, ConnError> {
        Ok(self.inner.sessions.remove(id)?)
    }

    /// Look up a session by IMSI
    pub fn session_by_imsi(&self, imsi: &str) -> Option<Session> {
        self.inner.sessions.by_imsi(imsi)
    }

    /// Look up a session by one of its local TEIDs
    pub fn session_by_teid(&self, teid: u32) -> Option<Session> {
        self.inner.sessions.by_teid(teid)
    }

    // ========================================================================
    // Kernel GTP
    // ========================================================================

    /// Create a kernel GTP device driven through `ip` and `gtp-tunnel`
    pub async fn enable_kernel_gtp(&self, device: &str, role: GtpRole) -> Result<(), ConnError> {
        self.enable_kernel_gtp_with(Arc::new(IpCommandControl::new()), device, role)
            .await
    }

    /// Create a kernel GTP device through a given control channel.
    ///
    /// Tunnels already in the table are programmed as well.
    pub async fn enable_kernel_gtp_with(
        &self,
        control: Arc<dyn KernelControl>,
        device: &str,
        role: GtpRole,
    ) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        if let Some(bridge) = self.kernel_bridge() {
            return Err(KernelError::AlreadyEnabled(bridge.device().to_string()).into());
        }

        let bridge = Arc::new(KernelBridge::enable(control, device, role).await?);
        let raced = {
            let mut slot = self.inner.kernel.write().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some(existing) => Some(existing.device().to_string()),
                None => {
                    *slot = Some(Arc::clone(&bridge));
                    None
                }
            }
        };
        if let Some(existing) = raced {
            if let Err(e) = bridge.close().await {
                warn!(device, error = %e, "cleanup of duplicate kernel device failed");
            }
            return Err(KernelError::AlreadyEnabled(existing).into());
        }

        let mut first_failure = None;
        for tunnel in self.inner.tunnels.all() {
            let Some(ms_addr) = tunnel.ms_addr else {
                continue;
            };
            let kt = KernelTunnel {
                local_teid: tunnel.local_teid,
                peer_teid: tunnel.peer_teid,
                peer_ip: tunnel.peer_addr.ip(),
                ms_addr,
            };
            if let Err(source) = bridge.add_tunnel(kt).await {
                warn!(teid = tunnel.local_teid, error = %source, "existing tunnel not programmed");
                first_failure.get_or_insert(ConnError::Degraded {
                    tunnel: tunnel.local_teid,
                    source,
                });
            }
        }
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Kernel bridge, if kernel GTP is enabled
    pub fn kernel_bridge(&self) -> Option<Arc<KernelBridge>> {
        self.inner
            .kernel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // ========================================================================
    // Path management
    // ========================================================================

    /// Path manager of this connection
    pub fn path_manager(&self) -> &PathManager {
        &self.inner.path
    }

    /// Take the path event receiver; only the first call gets it
    pub fn take_path_events(&self) -> Option<mpsc::Receiver<PathEvent>> {
        self.inner
            .path_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Start keepalive monitoring of a peer.
    ///
    /// Monitored peers are echoed until the connection closes. Peers learned
    /// from traffic are dropped once no tunnel or session refers to them.
    pub fn monitor_peer(&self, peer: SocketAddr) {
        debug!(peer = %peer, "monitoring peer");
        self.inner.path.monitor(peer);
    }

    /// Compare a Restart Counter received from `peer` and tear down its
    /// state if it restarted.
    ///
    /// Table entries are removed before this returns; kernel objects are
    /// removed by a spawned task.
    pub(crate) fn note_recovery(&self, peer: SocketAddr, counter: u8) {
        if let Some(removed) = self.check_recovery(peer, counter) {
            if removed.iter().any(|t| t.ms_addr.is_some()) && self.kernel_bridge().is_some() {
                let conn = self.clone();
                tokio::spawn(async move { conn.unprogram(removed).await });
            }
        }
    }

    fn check_recovery(&self, peer: SocketAddr, counter: u8) -> Option<Vec<Tunnel>> {
        let RecoveryCheck::Restarted { old, new } = self.inner.path.record_recovery(peer, counter) else {
            return None;
        };

        let ip = peer.ip();
        let sessions = self.inner.sessions.remove_by_peer(ip);
        let session_ids: HashSet<u64> = sessions.iter().map(|s| s.id).collect();
        let session_teids: HashSet<u32> = sessions.iter().flat_map(|s| s.teids.iter().copied()).collect();
        // A session's user plane may point at a different node than its control plane
        let tunnels = self.inner.tunnels.remove_where(|t| {
            t.peer_addr.ip() == ip
                || session_teids.contains(&t.local_teid)
                || t.session_id.is_some_and(|id| session_ids.contains(&id))
        });
        for tunnel in &tunnels {
            self.remove_relay(tunnel.local_teid);
        }

        warn!(
            peer = %peer,
            old_counter = old,
            new_counter = new,
            tunnels = tunnels.len(),
            sessions = sessions.len(),
            "peer restarted, state removed"
        );
        self.inner.path.emit(PathEvent::PeerRestarted {
            peer,
            old_counter: old,
            new_counter: new,
            removed_tunnels: tunnels.iter().map(|t| t.local_teid).collect(),
            removed_sessions: sessions.iter().map(|s| s.id).collect(),
        });
        Some(tunnels)
    }

    async fn unprogram(&self, tunnels: Vec<Tunnel>) {
        let Some(bridge) = self.kernel_bridge() else {
            return;
        };
        for tunnel in tunnels.iter().filter(|t| t.ms_addr.is_some()) {
            if let Err(e) = bridge.del_tunnel(tunnel.local_teid).await {
                warn!(teid = tunnel.local_teid, error = %e, "kernel tunnel removal failed");
            }
        }
    }

    fn start_path_ticker(&self) {
        let weak: Weak<ConnInner> = Arc::downgrade(&self.inner);
        let mut closed = self.inner.shutdown.subscribe();
        let period = self.inner.config.path.echo_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = closed.changed() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Conn { inner }.path_tick();
            }
            debug!("path ticker stopped");
        });
    }

    /// Send one Echo Request to every known peer without one outstanding
    fn path_tick(&self) {
        if self.is_closed() {
            return;
        }
        let idle = self.inner.path.evict_idle(|ip| {
            self.inner.tunnels.has_peer(ip) || self.inner.sessions.has_peer(ip)
        });
        for peer in idle {
            debug!(peer = %peer.addr, state = %peer.state, "forgetting idle peer");
        }
        for peer in self.inner.path.all() {
            if !self.inner.path.begin_echo(peer.addr.ip()) {
                continue;
            }
            let conn = self.clone();
            tokio::spawn(async move { conn.echo_peer(peer.addr).await });
        }
    }

    /// Echo one peer and feed the outcome to the path manager
    pub async fn echo_peer(&self, peer: SocketAddr) {
        let echo = GtpMessage::echo_request(self.version(), 0, self.restart_counter());
        let policy = RetryPolicy::new(self.inner.config.path.echo_timeout(), 0);

        match self.send_request_with(peer, echo, policy).await {
            Ok(response) => {
                let removed = response
                    .recovery()
                    .and_then(|counter| self.check_recovery(peer, counter));
                self.inner.path.echo_succeeded(peer);
                if let Some(removed) = removed {
                    self.unprogram(removed).await;
                }
            }
            Err(ConnError::Transaction(TransactionError::TimedOut { .. })) => {
                debug!(peer = %peer, "Echo Request unanswered");
                self.inner.path.echo_failed(peer);
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Echo Request not completed");
                self.inner.path.abort_echo(peer.ip());
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop the receive loop and path ticker, cancel pending requests,
    /// remove every kernel object and release the socket.
    ///
    /// Waits for a running receive loop to stop. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), ConnError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.shutdown.send_replace(true);

        let cancelled = self.inner.transactions.cancel_all();
        self.inner
            .relays
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let bridge = self
            .inner
            .kernel
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let cleanup = match bridge {
            Some(bridge) => bridge.close().await,
            None => Ok(()),
        };

        drop(self.inner.serving.lock().await);
        self.inner.transport.close();

        info!(
            local = %self.inner.local_addr,
            cancelled,
            tunnels = self.inner.tunnels.len(),
            "GTP connection closed"
        );
        cleanup.map_err(ConnError::from)
    }
}
