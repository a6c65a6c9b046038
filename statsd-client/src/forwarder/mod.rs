use std::{
    fmt,
    io,
    net::{SocketAddr, ToSocketAddrs as _},
    time::Duration,
};

pub mod sync;

mod transport;
pub(crate) use self::transport::Transport;

/// Address of the remote collector, in the form `<host>:<port>`.
///
/// The address is only checked for shape when it is parsed. Resolution happens when the socket is created, so that a
/// client can be configured before the collector's hostname is resolvable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct RemoteAddr {
    host: String,
    port: u16,
}

impl RemoteAddr {
    /// Resolves the address to one or more socket addresses.
    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        let addrs = (self.host.as_str(), self.port).to_socket_addrs()?.collect::<Vec<_>>();
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "address resolved to no socket addresses"));
        }

        Ok(addrs)
    }
}

impl Default for RemoteAddr {
    fn default() -> Self {
        RemoteAddr { host: "127.0.0.1".to_string(), port: 8125 }
    }
}

impl TryFrom<&str> for RemoteAddr {
    type Error = String;

    fn try_from(addr: &str) -> Result<Self, Self::Error> {
        let (host, port) =
            addr.rsplit_once(':').ok_or_else(|| format!("'{addr}' is missing a port (expected '<host>:<port>')"))?;

        // Bracketed IPv6 literals, like `[::1]:8125`, are passed to the resolver without their brackets.
        let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
        if host.is_empty() {
            return Err(format!("'{addr}' is missing a host (expected '<host>:<port>')"));
        }

        let port = port.parse::<u16>().map_err(|e| format!("invalid port '{port}': {e}"))?;

        Ok(RemoteAddr { host: host.to_string(), port })
    }
}

impl fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Forwarder configuration.
#[derive(Clone, Debug)]
pub(crate) struct ForwarderConfiguration {
    pub max_payload_len: usize,
    pub flush_interval: Duration,
    pub idle_eviction: Option<u32>,
}
