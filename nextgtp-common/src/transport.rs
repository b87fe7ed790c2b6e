//! Network transport utilities
//!
//! Provides the shared UDP socket wrapper used by a GTP connection. The socket
//! has a single reader (the connection's receive loop) and any number of
//! concurrent writers. Closing it through any clone releases the port once
//! the operations already in progress return.

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::net::UdpSocket;

use crate::Error;

/// Async UDP socket wrapper for GTP-C and GTP-U.
///
/// Cloning is cheap; all clones share the same socket, and
/// [`close`](Self::close) on one closes it for all.
///
/// # Example
///
/// ```ignore
/// use std::net::SocketAddr;
/// use nextgtp_common::UdpTransport;
///
/// async fn example() -> Result<(), nextgtp_common::Error> {
///     let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
///     let transport = UdpTransport::bind(addr).await?;
///
///     let dest: SocketAddr = "127.0.0.1:2152".parse().unwrap();
///     transport.send_to(b"hello", dest).await?;
///
///     let mut buf = vec![0u8; 65535];
///     let (len, src) = transport.recv_from(&mut buf).await?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct UdpTransport {
    socket: Arc<RwLock<Option<Arc<UdpSocket>>>>,
}

impl UdpTransport {
    /// Binds a UDP socket to the specified address.
    ///
    /// Use port 0 for automatic port assignment.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound to the specified address.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(RwLock::new(Some(Arc::new(socket)))),
        })
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, Error> {
        self.socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::Closed)
    }

    /// Drops the socket; later operations fail with [`Error::Closed`].
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        self.socket
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Sends a datagram to the specified destination address.
    ///
    /// # Errors
    ///
    /// Returns an error if the send operation fails.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), Error> {
        self.socket()?.send_to(data, addr).await?;
        Ok(())
    }

    /// Sends a datagram without waiting for socket readiness.
    ///
    /// Intended for callers that must not suspend, such as message handlers
    /// running on the receive loop.
    ///
    /// # Errors
    ///
    /// Returns `WouldBlock` as a network error when the socket send buffer is full.
    pub fn try_send_to(&self, data: &[u8], addr: SocketAddr) -> Result<(), Error> {
        self.socket()?.try_send_to(data, addr)?;
        Ok(())
    }

    /// Receives a datagram into `buf`.
    ///
    /// Returns the number of bytes received and the source address.
    ///
    /// # Errors
    ///
    /// Returns an error if the receive operation fails.
    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        let (len, addr) = self.socket()?.recv_from(buf).await?;
        Ok((len, addr))
    }

    /// Returns the local address this socket is bound to.
    ///
    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket()?.local_addr()?)
    }
}
