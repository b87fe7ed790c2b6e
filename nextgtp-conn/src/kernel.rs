//! Kernel GTP bridge
//!
//! Mirrors tunnel table changes into the Linux GTP module. The control
//! channel is a trait so the same bridge drives either the real kernel
//! (through `ip` and `gtp-tunnel`) or an in-memory recorder.
//!
//! The bridge keeps a ledger of every object it created. `close` waits for
//! mutations in progress, removes every object in reverse creation order and
//! reports every failure together. Nothing is programmed after that.

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use nextgtp_common::GtpRole;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{CleanupError, KernelError};

/// Routing table used for per-subscriber source routing rules
pub const DEFAULT_RULE_TABLE: u32 = 100;

/// One PDP context / tunnel as programmed into the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelTunnel {
    /// TEID of incoming G-PDUs
    pub local_teid: u32,
    /// TEID put on outgoing G-PDUs
    pub peer_teid: u32,
    /// Peer GTP-U endpoint
    pub peer_ip: IpAddr,
    /// Subscriber address routed through the tunnel
    pub ms_addr: IpAddr,
}

/// Anything the bridge creates in the kernel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KernelObject {
    /// GTP network device
    Device {
        /// Link name
        name: String,
    },
    /// Tunnel on the GTP device
    Tunnel {
        /// GTP device the tunnel lives on
        device: String,
        /// Tunnel parameters
        tunnel: KernelTunnel,
    },
    /// Address on a link
    Address {
        /// Link name
        link: String,
        /// Address
        addr: IpAddr,
        /// Prefix length
        prefix_len: u8,
    },
    /// Route through a link
    Route {
        /// Link name
        link: String,
        /// Destination prefix
        dest: IpAddr,
        /// Prefix length
        prefix_len: u8,
    },
    /// Source routing policy rule
    Rule {
        /// Source address
        from: IpAddr,
        /// Routing table
        table: u32,
    },
}

impl fmt::Display for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelObject::Device { name } => write!(f, "device {name}"),
            KernelObject::Tunnel { device, tunnel } => write!(
                f,
                "tunnel {device} i_tei {:#x} o_tei {:#x} ms {} peer {}",
                tunnel.local_teid, tunnel.peer_teid, tunnel.ms_addr, tunnel.peer_ip
            ),
            KernelObject::Address {
                link,
                addr,
                prefix_len,
            } => write!(f, "address {addr}/{prefix_len} dev {link}"),
            KernelObject::Route {
                link,
                dest,
                prefix_len,
            } => write!(f, "route {dest}/{prefix_len} dev {link}"),
            KernelObject::Rule { from, table } => write!(f, "rule from {from} table {table}"),
        }
    }
}

/// Kernel control channel
#[async_trait]
pub trait KernelControl: Send + Sync + fmt::Debug {
    /// Create a GTP device
    async fn create_device(&self, name: &str, role: GtpRole) -> Result<(), KernelError>;
    /// Delete a GTP device
    async fn delete_device(&self, name: &str) -> Result<(), KernelError>;
    /// Add a tunnel on a GTP device
    async fn add_tunnel(&self, device: &str, tunnel: &KernelTunnel) -> Result<(), KernelError>;
    /// Delete a tunnel from a GTP device
    async fn del_tunnel(&self, device: &str, tunnel: &KernelTunnel) -> Result<(), KernelError>;
    /// Add an address to a link
    async fn add_address(&self, link: &str, addr: IpAddr, prefix_len: u8) -> Result<(), KernelError>;
    /// Remove an address from a link
    async fn del_address(&self, link: &str, addr: IpAddr, prefix_len: u8) -> Result<(), KernelError>;
    /// Route a prefix through a link
    async fn add_route(&self, link: &str, dest: IpAddr, prefix_len: u8) -> Result<(), KernelError>;
    /// Remove a route
    async fn del_route(&self, link: &str, dest: IpAddr, prefix_len: u8) -> Result<(), KernelError>;
    /// Add a source routing rule
    async fn add_rule(&self, from: IpAddr, table: u32) -> Result<(), KernelError>;
    /// Remove a source routing rule
    async fn del_rule(&self, from: IpAddr, table: u32) -> Result<(), KernelError>;
}

// ============================================================================
// iproute2 / libgtpnl
// ============================================================================

/// Drives the kernel through the `ip` (iproute2) and `gtp-tunnel` (libgtpnl) tools
#[derive(Debug, Clone)]
pub struct IpCommandControl {
    ip: String,
    gtp_tunnel: String,
}

impl Default for IpCommandControl {
    fn default() -> Self {
        Self::new()
    }
}

impl IpCommandControl {
    /// Use `ip` and `gtp-tunnel` from `PATH`
    pub fn new() -> Self {
        Self {
            ip: "ip".to_string(),
            gtp_tunnel: "gtp-tunnel".to_string(),
        }
    }

    /// Use explicit tool paths
    pub fn with_tools(ip: impl Into<String>, gtp_tunnel: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            gtp_tunnel: gtp_tunnel.into(),
        }
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<(), KernelError> {
        let command = format!("{program} {}", args.join(" "));
        debug!(command = %command, "running kernel command");

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| KernelError::Spawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(KernelError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr,
            });
        }
        Ok(())
    }

    async fn ip(&self, args: &[&str]) -> Result<(), KernelError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run(&self.ip, &args).await
    }
}

#[async_trait]
impl KernelControl for IpCommandControl {
    async fn create_device(&self, name: &str, role: GtpRole) -> Result<(), KernelError> {
        let role = role.to_string();
        self.ip(&["link", "add", name, "type", "gtp", "role", &role]).await?;
        if let Err(e) = self.ip(&["link", "set", name, "up"]).await {
            // Leave nothing half-created behind
            let _ = self.ip(&["link", "del", name]).await;
            return Err(e);
        }
        Ok(())
    }

    async fn delete_device(&self, name: &str) -> Result<(), KernelError> {
        self.ip(&["link", "del", name]).await
    }

    async fn add_tunnel(&self, device: &str, tunnel: &KernelTunnel) -> Result<(), KernelError> {
        let args = vec![
            "add".to_string(),
            device.to_string(),
            "v1".to_string(),
            tunnel.local_teid.to_string(),
            tunnel.peer_teid.to_string(),
            tunnel.ms_addr.to_string(),
            tunnel.peer_ip.to_string(),
        ];
        self.run(&self.gtp_tunnel, &args).await
    }

    async fn del_tunnel(&self, device: &str, tunnel: &KernelTunnel) -> Result<(), KernelError> {
        let args = vec![
            "delete".to_string(),
            device.to_string(),
            "v1".to_string(),
            tunnel.local_teid.to_string(),
        ];
        self.run(&self.gtp_tunnel, &args).await
    }

    async fn add_address(&self, link: &str, addr: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        let cidr = format!("{addr}/{prefix_len}");
        self.ip(&["addr", "add", &cidr, "dev", link]).await
    }

    async fn del_address(&self, link: &str, addr: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        let cidr = format!("{addr}/{prefix_len}");
        self.ip(&["addr", "del", &cidr, "dev", link]).await
    }

    async fn add_route(&self, link: &str, dest: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        let cidr = format!("{dest}/{prefix_len}");
        self.ip(&["route", "add", &cidr, "dev", link]).await
    }

    async fn del_route(&self, link: &str, dest: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        let cidr = format!("{dest}/{prefix_len}");
        self.ip(&["route", "del", &cidr, "dev", link]).await
    }

    async fn add_rule(&self, from: IpAddr, table: u32) -> Result<(), KernelError> {
        let from = from.to_string();
        let table = table.to_string();
        self.ip(&["rule", "add", "from", &from, "table", &table]).await
    }

    async fn del_rule(&self, from: IpAddr, table: u32) -> Result<(), KernelError> {
        let from = from.to_string();
        let table = table.to_string();
        self.ip(&["rule", "del", "from", &from, "table", &table]).await
    }
}

// ============================================================================
// In-memory control channel
// ============================================================================

#[derive(Debug, Default)]
struct MemoryState {
    objects: HashSet<KernelObject>,
    fail_add: HashSet<String>,
    fail_remove: HashSet<String>,
}

/// In-process control channel that records objects instead of touching the kernel
///
/// Used for dry-run nodes and tests. Failures can be injected per object
/// kind (`"device"`, `"tunnel"`, `"address"`, `"route"`, `"rule"`).
#[derive(Debug, Default, Clone)]
pub struct MemoryControl {
    state: Arc<Mutex<MemoryState>>,
}

fn kind(object: &KernelObject) -> &'static str {
    match object {
        KernelObject::Device { .. } => "device",
        KernelObject::Tunnel { .. } => "tunnel",
        KernelObject::Address { .. } => "address",
        KernelObject::Route { .. } => "route",
        KernelObject::Rule { .. } => "rule",
    }
}

impl MemoryControl {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Objects currently present
    pub fn objects(&self) -> Vec<KernelObject> {
        self.state().objects.iter().cloned().collect()
    }

    /// Whether an object is present
    pub fn contains(&self, object: &KernelObject) -> bool {
        self.state().objects.contains(object)
    }

    /// Number of objects present
    pub fn len(&self) -> usize {
        self.state().objects.len()
    }

    /// Whether nothing is present
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every later creation of `kind` fail
    pub fn fail_add(&self, kind: &str) {
        self.state().fail_add.insert(kind.to_string());
    }

    /// Make every later removal of `kind` fail
    pub fn fail_remove(&self, kind: &str) {
        self.state().fail_remove.insert(kind.to_string());
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.fail_add.clear();
        state.fail_remove.clear();
    }

    fn add(&self, object: KernelObject) -> Result<(), KernelError> {
        let mut state = self.state();
        if state.fail_add.contains(kind(&object)) {
            return Err(KernelError::CommandFailed {
                command: format!("add {object}"),
                status: "injected".to_string(),
                stderr: String::new(),
            });
        }
        if state.objects.contains(&object) {
            return Err(KernelError::Exists(object.to_string()));
        }
        state.objects.insert(object);
        Ok(())
    }

    fn remove(&self, object: KernelObject) -> Result<(), KernelError> {
        let mut state = self.state();
        if state.fail_remove.contains(kind(&object)) {
            return Err(KernelError::CommandFailed {
                command: format!("del {object}"),
                status: "injected".to_string(),
                stderr: String::new(),
            });
        }
        if !state.objects.remove(&object) {
            return Err(KernelError::NotFound(object.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KernelControl for MemoryControl {
    async fn create_device(&self, name: &str, _role: GtpRole) -> Result<(), KernelError> {
        self.add(KernelObject::Device {
            name: name.to_string(),
        })
    }

    async fn delete_device(&self, name: &str) -> Result<(), KernelError> {
        self.remove(KernelObject::Device {
            name: name.to_string(),
        })
    }

    async fn add_tunnel(&self, device: &str, tunnel: &KernelTunnel) -> Result<(), KernelError> {
        self.add(KernelObject::Tunnel {
            device: device.to_string(),
            tunnel: *tunnel,
        })
    }

    async fn del_tunnel(&self, device: &str, tunnel: &KernelTunnel) -> Result<(), KernelError> {
        self.remove(KernelObject::Tunnel {
            device: device.to_string(),
            tunnel: *tunnel,
        })
    }

    async fn add_address(&self, link: &str, addr: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        self.add(KernelObject::Address {
            link: link.to_string(),
            addr,
            prefix_len,
        })
    }

    async fn del_address(&self, link: &str, addr: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        self.remove(KernelObject::Address {
            link: link.to_string(),
            addr,
            prefix_len,
        })
    }

    async fn add_route(&self, link: &str, dest: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        self.add(KernelObject::Route {
            link: link.to_string(),
            dest,
            prefix_len,
        })
    }

    async fn del_route(&self, link: &str, dest: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        self.remove(KernelObject::Route {
            link: link.to_string(),
            dest,
            prefix_len,
        })
    }

    async fn add_rule(&self, from: IpAddr, table: u32) -> Result<(), KernelError> {
        self.add(KernelObject::Rule { from, table })
    }

    async fn del_rule(&self, from: IpAddr, table: u32) -> Result<(), KernelError> {
        self.remove(KernelObject::Rule { from, table })
    }
}

// ============================================================================
// Bridge
// ============================================================================

#[derive(Debug, Clone)]
struct LedgerEntry {
    object: KernelObject,
    /// Local TEID of the tunnel the object was created for
    owner: Option<u32>,
}

fn host_prefix(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

/// Kernel GTP device plus every object created on behalf of a connection
#[derive(Debug)]
pub struct KernelBridge {
    control: Arc<dyn KernelControl>,
    device: String,
    role: GtpRole,
    ledger: Mutex<Vec<LedgerEntry>>,
    /// Mutations hold it shared, `close` exclusively; true once closed
    closed: RwLock<bool>,
}

impl KernelBridge {
    /// Create the GTP device and start a ledger with it
    pub async fn enable(
        control: Arc<dyn KernelControl>,
        device: &str,
        role: GtpRole,
    ) -> Result<Self, KernelError> {
        control.create_device(device, role).await?;
        info!(device, role = %role, "kernel GTP device created");
        Ok(Self {
            control,
            device: device.to_string(),
            role,
            ledger: Mutex::new(vec![LedgerEntry {
                object: KernelObject::Device {
                    name: device.to_string(),
                },
                owner: None,
            }]),
            closed: RwLock::new(false),
        })
    }

    fn ledger(&self) -> MutexGuard<'_, Vec<LedgerEntry>> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, object: KernelObject, owner: Option<u32>) {
        self.ledger().push(LedgerEntry { object, owner });
    }

    /// GTP device name
    pub fn device(&self) -> &str {
        &self.device
    }

    /// GTP device role
    pub fn role(&self) -> GtpRole {
        self.role
    }

    /// Objects created and not yet removed, in creation order
    pub fn objects(&self) -> Vec<KernelObject> {
        self.ledger().iter().map(|e| e.object.clone()).collect()
    }

    /// Objects belonging to one tunnel
    pub fn tunnel_objects(&self, local_teid: u32) -> Vec<KernelObject> {
        self.ledger()
            .iter()
            .filter(|e| e.owner == Some(local_teid))
            .map(|e| e.object.clone())
            .collect()
    }

    async fn remove_object(&self, object: &KernelObject) -> Result<(), KernelError> {
        match object {
            KernelObject::Device { name } => self.control.delete_device(name).await,
            KernelObject::Tunnel { device, tunnel } => self.control.del_tunnel(device, tunnel).await,
            KernelObject::Address {
                link,
                addr,
                prefix_len,
            } => self.control.del_address(link, *addr, *prefix_len).await,
            KernelObject::Route {
                link,
                dest,
                prefix_len,
            } => self.control.del_route(link, *dest, *prefix_len).await,
            KernelObject::Rule { from, table } => self.control.del_rule(*from, *table).await,
        }
    }

    /// Program a tunnel and a host route for its subscriber address.
    ///
    /// Either both objects end up in the kernel or neither does.
    pub async fn add_tunnel(&self, tunnel: KernelTunnel) -> Result<(), KernelError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(KernelError::Closed);
        }
        let owner = Some(tunnel.local_teid);
        self.control.add_tunnel(&self.device, &tunnel).await?;

        let prefix_len = host_prefix(tunnel.ms_addr);
        if let Err(e) = self
            .control
            .add_route(&self.device, tunnel.ms_addr, prefix_len)
            .await
        {
            if let Err(rollback) = self.control.del_tunnel(&self.device, &tunnel).await {
                warn!(teid = tunnel.local_teid, error = %rollback, "tunnel rollback failed");
                self.record(
                    KernelObject::Tunnel {
                        device: self.device.clone(),
                        tunnel,
                    },
                    owner,
                );
            }
            return Err(e);
        }

        self.record(
            KernelObject::Tunnel {
                device: self.device.clone(),
                tunnel,
            },
            owner,
        );
        self.record(
            KernelObject::Route {
                link: self.device.clone(),
                dest: tunnel.ms_addr,
                prefix_len,
            },
            owner,
        );
        debug!(teid = tunnel.local_teid, ms = %tunnel.ms_addr, "kernel tunnel added");
        Ok(())
    }

    /// Remove every object created for a tunnel.
    ///
    /// Objects that fail to go away stay in the ledger so `close` retries
    /// them; the first failure is returned.
    pub async fn del_tunnel(&self, local_teid: u32) -> Result<(), KernelError> {
        let closed = self.closed.read().await;
        if *closed {
            // Already removed by close
            return Ok(());
        }
        let entries: Vec<LedgerEntry> = {
            let mut ledger = self.ledger();
            let (owned, rest): (Vec<_>, Vec<_>) = ledger
                .drain(..)
                .partition(|e| e.owner == Some(local_teid));
            *ledger = rest;
            owned
        };

        let mut first_error = None;
        for entry in entries.into_iter().rev() {
            if let Err(e) = self.remove_object(&entry.object).await {
                warn!(object = %entry.object, error = %e, "kernel removal failed");
                self.record(entry.object, entry.owner);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Add an address to a link
    pub async fn add_address(&self, link: &str, addr: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(KernelError::Closed);
        }
        self.control.add_address(link, addr, prefix_len).await?;
        self.record(
            KernelObject::Address {
                link: link.to_string(),
                addr,
                prefix_len,
            },
            None,
        );
        Ok(())
    }

    /// Route a prefix through a link
    pub async fn add_route(&self, link: &str, dest: IpAddr, prefix_len: u8) -> Result<(), KernelError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(KernelError::Closed);
        }
        self.control.add_route(link, dest, prefix_len).await?;
        self.record(
            KernelObject::Route {
                link: link.to_string(),
                dest,
                prefix_len,
            },
            None,
        );
        Ok(())
    }

    /// Add a source routing rule
    pub async fn add_rule(&self, from: IpAddr, table: u32) -> Result<(), KernelError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(KernelError::Closed);
        }
        self.control.add_rule(from, table).await?;
        self.record(KernelObject::Rule { from, table }, None);
        Ok(())
    }

    /// Remove every recorded object, newest first, collecting failures.
    ///
    /// Waits for mutations already running; later ones fail with
    /// [`KernelError::Closed`].
    pub async fn close(&self) -> Result<(), CleanupError> {
        let mut closed = self.closed.write().await;
        *closed = true;
        let entries: Vec<LedgerEntry> = self.ledger().drain(..).collect();
        let total = entries.len();
        let mut errors = CleanupError::default();

        for entry in entries.into_iter().rev() {
            if let Err(e) = self.remove_object(&entry.object).await {
                warn!(object = %entry.object, error = %e, "kernel cleanup failed");
                errors.push(entry.object, e);
            }
        }

        info!(
            device = %self.device,
            removed = total - errors.len(),
            failed = errors.len(),
            "kernel GTP cleanup finished"
        );
        errors.into_result()
    }
}
