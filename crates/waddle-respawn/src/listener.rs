//! Listener handles: bound stream and datagram sockets, fresh or adopted.
//!
//! Every handle exposes [`Inheritable::duplicate_fd`], the only capability
//! [`reload`](crate::reload) needs. Duplicates share the kernel socket with
//! the original, so both generations can accept on it at the same time.
//! File status flags such as `O_NONBLOCK` live on that shared socket too.

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixDatagram, UnixListener};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::fd::SocketKind;

/// Network kinds accepted by the listener factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    /// TCP over IPv4 or IPv6.
    Tcp,
    /// TCP over IPv4 only.
    Tcp4,
    /// TCP over IPv6 only.
    Tcp6,
    /// Unix-domain stream socket.
    Unix,
    /// UDP over IPv4 or IPv6.
    Udp,
    /// UDP over IPv4 only.
    Udp4,
    /// UDP over IPv6 only.
    Udp6,
    /// Unix-domain datagram socket.
    Unixgram,
}

impl Network {
    /// Parse a network name (`tcp`, `udp6`, `unixgram`, ...).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "tcp" => Some(Network::Tcp),
            "tcp4" => Some(Network::Tcp4),
            "tcp6" => Some(Network::Tcp6),
            "unix" => Some(Network::Unix),
            "udp" => Some(Network::Udp),
            "udp4" => Some(Network::Udp4),
            "udp6" => Some(Network::Udp6),
            "unixgram" => Some(Network::Unixgram),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Tcp4 => "tcp4",
            Network::Tcp6 => "tcp6",
            Network::Unix => "unix",
            Network::Udp => "udp",
            Network::Udp4 => "udp4",
            Network::Udp6 => "udp6",
            Network::Unixgram => "unixgram",
        }
    }

    /// Stream kinds go through `listen`, datagram kinds through `listen_packet`.
    pub fn is_stream(&self) -> bool {
        matches!(
            self,
            Network::Tcp | Network::Tcp4 | Network::Tcp6 | Network::Unix
        )
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Network::Unix | Network::Unixgram)
    }

    /// Whether an inherited socket of `kind` can back a handle of this network.
    pub(crate) fn accepts(&self, kind: SocketKind) -> bool {
        let sock_type = if self.is_stream() {
            libc::SOCK_STREAM
        } else {
            libc::SOCK_DGRAM
        };
        if kind.sock_type != sock_type {
            return false;
        }
        match self {
            Network::Tcp | Network::Udp => {
                kind.family == libc::AF_INET || kind.family == libc::AF_INET6
            }
            Network::Tcp4 | Network::Udp4 => kind.family == libc::AF_INET,
            Network::Tcp6 | Network::Udp6 => kind.family == libc::AF_INET6,
            Network::Unix | Network::Unixgram => kind.family == libc::AF_UNIX,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a handle came to own its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Bound by this generation.
    Fresh,
    /// Inherited from the previous generation.
    Adopted,
}

/// Local address of a listener handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Inet(SocketAddr),
    /// Unix-domain socket; `None` for unnamed sockets.
    Unix(Option<PathBuf>),
}

impl ListenAddr {
    pub fn as_inet(&self) -> Option<SocketAddr> {
        match self {
            ListenAddr::Inet(addr) => Some(*addr),
            ListenAddr::Unix(_) => None,
        }
    }

    fn from_unix(addr: std::os::unix::net::SocketAddr) -> Self {
        ListenAddr::Unix(addr.as_pathname().map(Path::to_path_buf))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Inet(addr) => write!(f, "{}", addr),
            ListenAddr::Unix(Some(path)) => write!(f, "{}", path.display()),
            ListenAddr::Unix(None) => f.write_str("(unnamed)"),
        }
    }
}

/// Capability shared by every handle that can be passed to a new generation.
pub trait Inheritable {
    /// Duplicate the underlying descriptor.
    ///
    /// The duplicate is close-on-exec; the spawner places it into the
    /// child's inherited block, where it becomes inheritable. The original
    /// handle stays fully usable.
    fn duplicate_fd(&self) -> io::Result<OwnedFd>;

    /// Called once a child generation holding the duplicate has started.
    fn handed_over(&self) {}
}

impl<T: Inheritable + ?Sized> Inheritable for &T {
    fn duplicate_fd(&self) -> io::Result<OwnedFd> {
        (**self).duplicate_fd()
    }

    fn handed_over(&self) {
        (**self).handed_over()
    }
}

/// Removes a Unix socket path when the owning handle is dropped.
#[derive(Debug)]
struct UnlinkOnClose {
    path: PathBuf,
    armed: AtomicBool,
}

impl UnlinkOnClose {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            armed: AtomicBool::new(true),
        }
    }

    fn set(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }
}

impl Drop for UnlinkOnClose {
    fn drop(&mut self) {
        if self.armed.load(Ordering::SeqCst) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[derive(Debug)]
enum StreamSocket {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// A bound stream listener (TCP or Unix-domain).
///
/// Dropping the handle closes this generation's reference to the socket.
/// A fresh Unix listener also removes its path, unless it was handed to a
/// respawned generation: the path then belongs to that generation.
#[derive(Debug)]
pub struct Listener {
    network: Network,
    origin: Origin,
    // Declared before `unlink` so the socket closes before the path goes.
    socket: StreamSocket,
    unlink: Option<UnlinkOnClose>,
}

impl Listener {
    pub(crate) fn fresh_tcp(network: Network, listener: TcpListener) -> Self {
        Self {
            network,
            origin: Origin::Fresh,
            socket: StreamSocket::Tcp(listener),
            unlink: None,
        }
    }

    pub(crate) fn fresh_unix(listener: UnixListener, path: PathBuf) -> Self {
        Self {
            network: Network::Unix,
            origin: Origin::Fresh,
            socket: StreamSocket::Unix(listener),
            unlink: Some(UnlinkOnClose::new(path)),
        }
    }

    pub(crate) fn adopted(network: Network, fd: OwnedFd) -> Self {
        let socket = if network.is_unix() {
            StreamSocket::Unix(UnixListener::from(fd))
        } else {
            StreamSocket::Tcp(TcpListener::from(fd))
        };
        Self {
            network,
            origin: Origin::Adopted,
            socket,
            unlink: None,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_adopted(&self) -> bool {
        self.origin == Origin::Adopted
    }

    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match &self.socket {
            StreamSocket::Tcp(l) => l.local_addr().map(ListenAddr::Inet),
            StreamSocket::Unix(l) => l.local_addr().map(ListenAddr::from_unix),
        }
    }

    pub fn as_tcp(&self) -> Option<&TcpListener> {
        match &self.socket {
            StreamSocket::Tcp(l) => Some(l),
            StreamSocket::Unix(_) => None,
        }
    }

    pub fn as_unix(&self) -> Option<&UnixListener> {
        match &self.socket {
            StreamSocket::Unix(l) => Some(l),
            StreamSocket::Tcp(_) => None,
        }
    }

    /// Toggle `O_NONBLOCK`. Affects every generation sharing the socket.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match &self.socket {
            StreamSocket::Tcp(l) => l.set_nonblocking(nonblocking),
            StreamSocket::Unix(l) => l.set_nonblocking(nonblocking),
        }
    }

    /// Control whether a fresh Unix listener removes its path on close.
    /// No effect on TCP or adopted listeners.
    pub fn set_unlink_on_close(&self, unlink: bool) {
        if let Some(guard) = &self.unlink {
            guard.set(unlink);
        }
    }
}

impl Inheritable for Listener {
    fn duplicate_fd(&self) -> io::Result<OwnedFd> {
        self.as_fd().try_clone_to_owned()
    }

    fn handed_over(&self) {
        self.set_unlink_on_close(false);
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.socket {
            StreamSocket::Tcp(l) => l.as_fd(),
            StreamSocket::Unix(l) => l.as_fd(),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

#[derive(Debug)]
enum DatagramSocket {
    Udp(UdpSocket),
    Unix(UnixDatagram),
}

/// A bound datagram socket (UDP or Unix-domain).
///
/// Same ownership and unlinking rules as [`Listener`].
#[derive(Debug)]
pub struct PacketConn {
    network: Network,
    origin: Origin,
    socket: DatagramSocket,
    unlink: Option<UnlinkOnClose>,
}

impl PacketConn {
    pub(crate) fn fresh_udp(network: Network, socket: UdpSocket) -> Self {
        Self {
            network,
            origin: Origin::Fresh,
            socket: DatagramSocket::Udp(socket),
            unlink: None,
        }
    }

    pub(crate) fn fresh_unix(socket: UnixDatagram, path: PathBuf) -> Self {
        Self {
            network: Network::Unixgram,
            origin: Origin::Fresh,
            socket: DatagramSocket::Unix(socket),
            unlink: Some(UnlinkOnClose::new(path)),
        }
    }

    pub(crate) fn adopted(network: Network, fd: OwnedFd) -> Self {
        let socket = if network.is_unix() {
            DatagramSocket::Unix(UnixDatagram::from(fd))
        } else {
            DatagramSocket::Udp(UdpSocket::from(fd))
        };
        Self {
            network,
            origin: Origin::Adopted,
            socket,
            unlink: None,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn is_adopted(&self) -> bool {
        self.origin == Origin::Adopted
    }

    pub fn local_addr(&self) -> io::Result<ListenAddr> {
        match &self.socket {
            DatagramSocket::Udp(s) => s.local_addr().map(ListenAddr::Inet),
            DatagramSocket::Unix(s) => s.local_addr().map(ListenAddr::from_unix),
        }
    }

    pub fn as_udp(&self) -> Option<&UdpSocket> {
        match &self.socket {
            DatagramSocket::Udp(s) => Some(s),
            DatagramSocket::Unix(_) => None,
        }
    }

    pub fn as_unix(&self) -> Option<&UnixDatagram> {
        match &self.socket {
            DatagramSocket::Unix(s) => Some(s),
            DatagramSocket::Udp(_) => None,
        }
    }

    /// Toggle `O_NONBLOCK`. Affects every generation sharing the socket.
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match &self.socket {
            DatagramSocket::Udp(s) => s.set_nonblocking(nonblocking),
            DatagramSocket::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    /// Control whether a fresh Unix datagram socket removes its path on close.
    pub fn set_unlink_on_close(&self, unlink: bool) {
        if let Some(guard) = &self.unlink {
            guard.set(unlink);
        }
    }
}

impl Inheritable for PacketConn {
    fn duplicate_fd(&self) -> io::Result<OwnedFd> {
        self.as_fd().try_clone_to_owned()
    }

    fn handed_over(&self) {
        self.set_unlink_on_close(false);
    }
}

impl AsFd for PacketConn {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match &self.socket {
            DatagramSocket::Udp(s) => s.as_fd(),
            DatagramSocket::Unix(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for PacketConn {
    fn as_raw_fd(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_network_names() {
        for name in ["tcp", "tcp4", "tcp6", "unix", "udp", "udp4", "udp6", "unixgram"] {
            let network = Network::from_name(name).unwrap();
            assert_eq!(network.as_str(), name);
            assert_eq!(network.to_string(), name);
        }
        assert_eq!(Network::from_name("unixpacket"), None);
        assert_eq!(Network::from_name("TCP"), None);

        assert!(Network::Tcp6.is_stream());
        assert!(Network::Unix.is_stream());
        assert!(!Network::Udp.is_stream());
        assert!(!Network::Unixgram.is_stream());
    }

    #[test]
    fn test_network_accepts_socket_kinds() {
        let v4_stream = SocketKind {
            sock_type: libc::SOCK_STREAM,
            family: libc::AF_INET,
        };
        let v6_dgram = SocketKind {
            sock_type: libc::SOCK_DGRAM,
            family: libc::AF_INET6,
        };
        let unix_stream = SocketKind {
            sock_type: libc::SOCK_STREAM,
            family: libc::AF_UNIX,
        };

        assert!(Network::Tcp.accepts(v4_stream));
        assert!(Network::Tcp4.accepts(v4_stream));
        assert!(!Network::Tcp6.accepts(v4_stream));
        assert!(!Network::Udp4.accepts(v4_stream));
        assert!(!Network::Unix.accepts(v4_stream));

        assert!(Network::Udp.accepts(v6_dgram));
        assert!(Network::Udp6.accepts(v6_dgram));
        assert!(!Network::Tcp6.accepts(v6_dgram));

        assert!(Network::Unix.accepts(unix_stream));
        assert!(!Network::Unixgram.accepts(unix_stream));
    }

    #[test]
    fn test_duplicate_keeps_original_usable() {
        let tcp = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = tcp.local_addr().unwrap();
        let listener = Listener::fresh_tcp(Network::Tcp, tcp);

        let dup = listener.duplicate_fd().unwrap();
        assert_ne!(dup.as_raw_fd(), listener.as_raw_fd());
        let flags = unsafe { libc::fcntl(dup.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let other = TcpListener::from(dup);
        assert_eq!(other.local_addr().unwrap(), addr);
        drop(other);

        // Closing the duplicate leaves the original accepting.
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        let (mut server, _) = listener.as_tcp().unwrap().accept().unwrap();
        std::io::Write::write_all(&mut server, b"ok").unwrap();
        drop(server);
        let mut buf = String::new();
        client.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "ok");
    }

    #[test]
    fn test_unix_listener_unlinks_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.sock");

        let listener = Listener::fresh_unix(UnixListener::bind(&path).unwrap(), path.clone());
        assert_eq!(
            listener.local_addr().unwrap(),
            ListenAddr::Unix(Some(path.clone()))
        );
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_unix_listener_keeps_path_after_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("handed-over.sock");

        let listener = Listener::fresh_unix(UnixListener::bind(&path).unwrap(), path.clone());
        let dup = listener.duplicate_fd().unwrap();
        listener.handed_over();
        drop(listener);
        assert!(path.exists());

        let next = Listener::adopted(Network::Unix, dup);
        assert!(next.is_adopted());
        let _client = std::os::unix::net::UnixStream::connect(&path).unwrap();
        assert!(next.as_unix().unwrap().accept().is_ok());
    }

    #[test]
    fn test_packet_conn_accessors() {
        let udp = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = udp.local_addr().unwrap();
        let conn = PacketConn::fresh_udp(Network::Udp4, udp);

        assert_eq!(conn.network(), Network::Udp4);
        assert_eq!(conn.origin(), Origin::Fresh);
        assert_eq!(conn.local_addr().unwrap().as_inet(), Some(addr));
        assert!(conn.as_udp().is_some());
        assert!(conn.as_unix().is_none());

        let dup = conn.duplicate_fd().unwrap();
        let adopted = PacketConn::adopted(Network::Udp4, dup);
        assert!(adopted.is_adopted());

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"ping", addr).unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = adopted.as_udp().unwrap().recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }
}
