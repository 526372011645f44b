//! Raw descriptor plumbing: socket probing, close-on-exec control and
//! duplication above a floor.

use std::io;
use std::os::unix::io::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Kernel view of an open socket descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SocketKind {
    /// `SOCK_STREAM`, `SOCK_DGRAM`, ...
    pub sock_type: libc::c_int,
    /// `AF_INET`, `AF_INET6`, `AF_UNIX`, ...
    pub family: libc::c_int,
}

/// Whether `fd` is open and refers to a socket, using fstat.
pub(crate) fn is_socket(fd: RawFd) -> bool {
    if fd < 0 {
        return false;
    }
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::fstat(fd, &mut stat) };
    if result != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Read the socket type and address family of `fd`.
///
/// Fails with `ENOTSOCK` (or `EBADF`) if `fd` is not an open socket.
pub(crate) fn probe_socket(fd: RawFd) -> io::Result<SocketKind> {
    if !is_socket(fd) {
        return Err(io::Error::from_raw_os_error(libc::ENOTSOCK));
    }

    let mut sock_type: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut sock_type as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let result = unsafe {
        libc::getsockname(
            fd,
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
        )
    };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(SocketKind {
        sock_type,
        family: libc::c_int::from(storage.ss_family),
    })
}

/// Set or clear `FD_CLOEXEC` on `fd`.
pub(crate) fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let wanted = if cloexec {
        flags | libc::FD_CLOEXEC
    } else {
        flags & !libc::FD_CLOEXEC
    };
    if wanted != flags && unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Duplicate `fd` onto the lowest free descriptor `>= floor`, close-on-exec.
pub(crate) fn dup_above(fd: BorrowedFd<'_>, floor: RawFd) -> io::Result<OwnedFd> {
    let new_fd = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, floor) };
    if new_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl just returned a fresh descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(new_fd) })
}

/// Occupy descriptor `slot` with a close-on-exec duplicate of `placeholder`
/// if the slot is free. Returns the duplicate when it landed on `slot`.
pub(crate) fn fill_slot(placeholder: BorrowedFd<'_>, slot: RawFd) -> io::Result<Option<OwnedFd>> {
    if unsafe { libc::fcntl(slot, libc::F_GETFD) } >= 0 {
        return Ok(None);
    }
    let error = io::Error::last_os_error();
    if error.raw_os_error() != Some(libc::EBADF) {
        return Err(error);
    }
    let dup = dup_above(placeholder, slot)?;
    // Anything else means another thread took the slot first.
    Ok((dup.as_raw_fd() == slot).then_some(dup))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;

    #[test]
    fn test_probe_tcp_and_udp() {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let kind = probe_socket(tcp.as_raw_fd()).unwrap();
        assert_eq!(kind.sock_type, libc::SOCK_STREAM);
        assert_eq!(kind.family, libc::AF_INET);

        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let kind = probe_socket(udp.as_raw_fd()).unwrap();
        assert_eq!(kind.sock_type, libc::SOCK_DGRAM);
        assert_eq!(kind.family, libc::AF_INET);
    }

    #[test]
    fn test_probe_rejects_non_sockets() {
        let file = tempfile::tempfile().unwrap();
        assert!(!is_socket(file.as_raw_fd()));
        assert!(probe_socket(file.as_raw_fd()).is_err());
        assert!(!is_socket(9999));
        assert!(!is_socket(-1));
    }

    #[test]
    fn test_cloexec_toggle() {
        let udp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = udp.as_raw_fd();

        set_cloexec(fd, false).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);

        set_cloexec(fd, true).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_dup_above_floor() {
        let tcp = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let high = dup_above(tcp.as_fd(), 200).unwrap();
        assert!(high.as_raw_fd() >= 200);

        let flags = unsafe { libc::fcntl(high.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let dup = std::net::TcpListener::from(high);
        assert_eq!(dup.local_addr().unwrap(), tcp.local_addr().unwrap());
    }

    #[test]
    fn test_fill_slot_only_takes_free_slots() {
        let placeholder = std::fs::File::open("/dev/null").unwrap();

        // Occupied slot: left alone.
        let taken = dup_above(placeholder.as_fd(), 820).unwrap();
        let slot = taken.as_raw_fd();
        assert!(fill_slot(placeholder.as_fd(), slot).unwrap().is_none());

        // Free slot: filled, close-on-exec.
        drop(taken);
        let filled = fill_slot(placeholder.as_fd(), slot).unwrap().unwrap();
        assert_eq!(filled.as_raw_fd(), slot);
        let flags = unsafe { libc::fcntl(slot, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);
    }
}
