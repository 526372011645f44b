//! Listener factory: bind fresh or adopt positionally.
//!
//! Adoption is purely positional. The n-th `listen`/`listen_packet` call of a
//! generation adopts the n-th inherited descriptor, whatever address it asks
//! for. A new generation must therefore create its listeners in exactly the
//! same order as the generation that reloaded it. This is a caller contract;
//! the factory only checks that the inherited socket has the requested kind.

use std::net::{SocketAddr, TcpListener, ToSocketAddrs, UdpSocket};
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{RespawnError, Result};
use crate::fd;
use crate::inherit::InheritedFds;
use crate::listener::{Listener, Network, PacketConn};

static GLOBAL: OnceLock<std::result::Result<ListenerFactory, String>> = OnceLock::new();

/// Creates listener handles for one generation.
///
/// Holds the inherited descriptor block and the adoption cursor. The cursor
/// advances exactly once per successful network lookup, whether the call
/// adopts or binds, so calls stay aligned with the parent's sequence.
#[derive(Debug)]
pub struct ListenerFactory {
    inherited: InheritedFds,
    cursor: Mutex<usize>,
}

impl ListenerFactory {
    /// Factory over an explicit inherited block.
    pub fn new(inherited: InheritedFds) -> Self {
        Self {
            inherited,
            cursor: Mutex::new(0),
        }
    }

    /// Factory over the block described by this process's environment.
    ///
    /// Marks the whole block close-on-exec, so sockets this generation never
    /// adopts do not leak into its own children, and removes the markers
    /// from the environment.
    pub fn from_env() -> Result<Self> {
        let inherited = InheritedFds::from_env()?;
        InheritedFds::clear_env();
        if !inherited.is_empty() {
            info!(
                start = inherited.start(),
                count = inherited.count(),
                "Found inherited descriptors from parent generation"
            );
            for fd in (0..inherited.count()).filter_map(|index| inherited.fd(index)) {
                if let Err(e) = fd::set_cloexec(fd, true) {
                    warn!(fd, error = %e, "Inherited descriptor is not open");
                }
            }
        }
        Ok(Self::new(inherited))
    }

    /// The process-wide factory, initialized from the environment on first use.
    ///
    /// Also pins the current executable path for later respawns.
    pub fn global() -> Result<&'static ListenerFactory> {
        let factory = GLOBAL.get_or_init(|| {
            if let Err(e) = crate::spawn::current_executable() {
                debug!(error = %e, "Could not resolve current executable yet");
            }
            ListenerFactory::from_env().map_err(|e| e.to_string())
        });
        factory
            .as_ref()
            .map_err(|msg| RespawnError::Descriptor(msg.clone()))
    }

    pub fn inherited(&self) -> InheritedFds {
        self.inherited
    }

    /// Inherited descriptors not yet claimed.
    pub fn remaining(&self) -> usize {
        let cursor = *self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        self.inherited.count().saturating_sub(cursor)
    }

    /// Close every inherited socket not claimed yet and move the cursor past
    /// the block. Returns how many were closed.
    ///
    /// Call it once startup has created all listeners: an unclaimed socket
    /// would otherwise keep its address bound for as long as this
    /// generation lives.
    pub fn close_unclaimed(&self) -> usize {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let mut closed = 0;
        while let Some(fd) = self.inherited.fd(*cursor) {
            *cursor += 1;
            if fd::is_socket(fd) {
                // SAFETY: the position was never handed out, so this is the
                // only owner of the inherited descriptor.
                drop(unsafe { OwnedFd::from_raw_fd(fd) });
                closed += 1;
            }
        }
        if closed > 0 {
            info!(closed, "Closed unclaimed inherited descriptors");
        }
        closed
    }

    /// Create a stream listener (`tcp`, `tcp4`, `tcp6`, `unix`).
    pub fn listen(&self, network: &str, address: &str) -> Result<Listener> {
        let kind = Network::from_name(network)
            .filter(Network::is_stream)
            .ok_or_else(|| RespawnError::address(network, address, "unknown stream network"))?;

        if let Some(fd) = self.claim_next() {
            let owned = adopt(fd, kind)?;
            info!(fd, network = %kind, address, "Adopted inherited listener");
            return Ok(Listener::adopted(kind, owned));
        }

        let listener = match kind {
            Network::Unix => {
                let path = unix_path(kind, address)?;
                let listener =
                    UnixListener::bind(&path).map_err(|e| bind_error(kind, address, e))?;
                Listener::fresh_unix(listener, path)
            }
            _ => {
                let addrs = resolve(kind, address)?;
                let listener = bind_first(kind, address, &addrs, TcpListener::bind)?;
                Listener::fresh_tcp(kind, listener)
            }
        };
        debug!(network = %kind, address, "Bound fresh listener");
        Ok(listener)
    }

    /// Create a datagram socket (`udp`, `udp4`, `udp6`, `unixgram`).
    pub fn listen_packet(&self, network: &str, address: &str) -> Result<PacketConn> {
        let kind = Network::from_name(network)
            .filter(|n| !n.is_stream())
            .ok_or_else(|| RespawnError::address(network, address, "unknown datagram network"))?;

        if let Some(fd) = self.claim_next() {
            let owned = adopt(fd, kind)?;
            info!(fd, network = %kind, address, "Adopted inherited packet socket");
            return Ok(PacketConn::adopted(kind, owned));
        }

        let conn = match kind {
            Network::Unixgram => {
                let path = unix_path(kind, address)?;
                let socket = UnixDatagram::bind(&path).map_err(|e| bind_error(kind, address, e))?;
                PacketConn::fresh_unix(socket, path)
            }
            _ => {
                let addrs = resolve(kind, address)?;
                let socket = bind_first(kind, address, &addrs, UdpSocket::bind)?;
                PacketConn::fresh_udp(kind, socket)
            }
        };
        debug!(network = %kind, address, "Bound fresh packet socket");
        Ok(conn)
    }

    /// Advance the cursor and return the inherited descriptor at its old
    /// position, if any. The lock covers bookkeeping only, never a bind.
    fn claim_next(&self) -> Option<RawFd> {
        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let index = *cursor;
        *cursor += 1;
        self.inherited.fd(index)
    }
}

/// Take ownership of inherited `fd` after checking it backs `network`.
fn adopt(fd: RawFd, network: Network) -> Result<OwnedFd> {
    // Children of this generation must not see the descriptor unless it is
    // reloaded, whether or not it turns out to be usable here.
    let cloexec = fd::set_cloexec(fd, true);

    let kind = fd::probe_socket(fd).map_err(|e| {
        RespawnError::Descriptor(format!("fd {} is not an open socket: {}", fd, e))
    })?;

    if !network.accepts(kind) {
        return Err(RespawnError::Descriptor(format!(
            "fd {} (type {}, family {}) cannot back a {} listener",
            fd, kind.sock_type, kind.family, network
        )));
    }

    cloexec.map_err(|e| RespawnError::Descriptor(format!("fd {}: {}", fd, e)))?;

    // SAFETY: the descriptor was validated as an open socket and the cursor
    // hands each inherited position out once, so nothing else owns it.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Resolve `address` for an IP network, honoring the family restriction.
/// An empty host binds the wildcard address.
fn resolve(network: Network, address: &str) -> Result<Vec<SocketAddr>> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| RespawnError::address(network.as_str(), address, "missing port"))?;

    let target = if host.is_empty() {
        let wildcard = match network {
            Network::Tcp6 | Network::Udp6 => "[::]",
            _ => "0.0.0.0",
        };
        format!("{}:{}", wildcard, port)
    } else {
        address.to_string()
    };

    let addrs: Vec<SocketAddr> = target
        .to_socket_addrs()
        .map_err(|e| RespawnError::address(network.as_str(), address, e.to_string()))?
        .filter(|addr| match network {
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
            _ => true,
        })
        .collect();

    if addrs.is_empty() {
        return Err(RespawnError::address(
            network.as_str(),
            address,
            "no address of the requested family",
        ));
    }
    Ok(addrs)
}

/// Bind the first address that works, reporting the last failure.
fn bind_first<T>(
    network: Network,
    address: &str,
    addrs: &[SocketAddr],
    bind: impl Fn(SocketAddr) -> std::io::Result<T>,
) -> Result<T> {
    let mut last_error = None;
    for addr in addrs {
        match bind(*addr) {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                debug!(%addr, error = %e, "Bind attempt failed");
                last_error = Some(e);
            }
        }
    }
    let error = last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no address to bind")
    });
    Err(bind_error(network, address, error))
}

fn unix_path(network: Network, address: &str) -> Result<PathBuf> {
    if address.is_empty() {
        return Err(RespawnError::address(
            network.as_str(),
            address,
            "empty socket path",
        ));
    }
    Ok(PathBuf::from(address))
}

fn bind_error(network: Network, address: &str, source: std::io::Error) -> RespawnError {
    RespawnError::Bind {
        network: network.to_string(),
        address: address.to_string(),
        source,
    }
}
