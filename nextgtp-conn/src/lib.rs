//! GTP connection engine
//!
//! This crate turns a UDP socket into a GTP endpoint:
//! - [`Conn`]: receive loop, handler dispatch, requests and user plane
//! - [`TransactionTracker`]: sequence allocation, retransmission and response matching
//! - [`TunnelTable`] and [`SessionTable`]: TEID-keyed tunnel and subscriber state
//! - [`PathManager`]: Echo keepalives, liveness and restart detection
//! - [`KernelBridge`]: mirroring tunnels into a Linux GTP device

pub mod conn;
pub mod error;
pub mod handler;
pub mod kernel;
pub mod path;
pub mod session;
pub mod transaction;
pub mod tunnel;

pub use conn::{Conn, UserPacket};
pub use error::{CleanupError, ConnError, HandlerError, KernelError, TransactionError, TunnelError};
pub use handler::Handler;
pub use kernel::{
    IpCommandControl, KernelBridge, KernelControl, KernelObject, KernelTunnel, MemoryControl,
    DEFAULT_RULE_TABLE,
};
pub use path::{counter_increased, PathEvent, PathManager, Peer, PeerState, RecoveryCheck};
pub use session::{Session, SessionTable};
pub use transaction::{RetryPolicy, TransactionTracker};
pub use tunnel::{Tunnel, TunnelTable};
