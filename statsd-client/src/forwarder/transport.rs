use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket},
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::RemoteAddr;
use crate::Error;

/// The outbound UDP socket.
///
/// A `Transport` owns at most one open socket at a time. Sends never hold the socket lock across the write itself, so
/// a `close` racing a `send` either lets that single write complete or fails it with [`Error::NotConnected`], and never
/// blocks on it. The socket's write timeout bounds how long any one write can take.
pub(crate) struct Transport {
    remote_addr: RemoteAddr,
    write_timeout: Option<Duration>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl Transport {
    /// Creates a new, unopened `Transport` for the given remote address.
    pub fn new(remote_addr: RemoteAddr, write_timeout: Option<Duration>) -> Self {
        Self { remote_addr, write_timeout, socket: RwLock::new(None) }
    }

    /// Resolves the remote address and opens a socket connected to it.
    pub fn open(&self) -> Result<(), Error> {
        let mut socket_slot = self.socket.write();
        if socket_slot.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let addrs = self
            .remote_addr
            .resolve()
            .map_err(|source| Error::Resolution { address: self.remote_addr.to_string(), source })?;

        // Only try addresses from the same family as the first one, since that's what we bind to.
        let is_ipv6 = addrs[0].is_ipv6();
        let addrs = addrs.into_iter().filter(|addr| addr.is_ipv6() == is_ipv6).collect::<Vec<_>>();
        let local_addr = if is_ipv6 {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(local_addr)
            .and_then(|socket| {
                socket.connect(&addrs[..])?;
                socket.set_write_timeout(self.write_timeout)?;
                Ok(socket)
            })
            .map_err(|source| Error::Socket { source })?;

        debug!(remote_addr = %self.remote_addr, local_addr = ?socket.local_addr().ok(), "Opened socket.");
        *socket_slot = Some(Arc::new(socket));
        Ok(())
    }

    /// Sends a single datagram.
    ///
    /// The write is attempted exactly once.
    pub fn send(&self, payload: &[u8]) -> Result<usize, Error> {
        let socket = self.socket.read().as_ref().map(Arc::clone).ok_or(Error::NotConnected)?;

        let sent = socket.send(payload).map_err(|source| Error::Write { len: payload.len(), source })?;
        trace!(len = sent, "Sent datagram.");
        Ok(sent)
    }

    /// Closes the socket.
    ///
    /// Returns `true` if a socket was open. Closing a transport that was never opened, or was already closed, does
    /// nothing.
    pub fn close(&self) -> bool {
        let closed = self.socket.write().take().is_some();
        if closed {
            debug!(remote_addr = %self.remote_addr, "Closed socket.");
        }

        closed
    }

    /// Returns `true` if the socket is open.
    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.socket.read().is_some()
    }
}
