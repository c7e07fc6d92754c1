//! Typed wrappers over OS sockets: a pipe for the wake-up channel, TCP
//! stream/accept sockets, and a UDP datagram socket, plus the scoped
//! guard that is the only correct way to hand a freshly created socket
//! off to a manager.

use crate::error::{Error, Result};
use socket2::{Domain, Protocol, SockAddr, Socket as Socket2, Type};
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};

/// Default backlog for listening sockets.
pub const MAX_CONN_BACKLOG: i32 = 10;

/// A raw socket handle. Copyable as a value, but only one [`SocketGuard`]
/// may own (i.e. be responsible for closing) a given handle at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Socket {
    fd: RawFd,
}

/// Sentinel for "no socket".
pub const INVALID_SOCKET: Socket = Socket { fd: -1 };

impl Socket {
    /// Wrap a raw fd.
    pub fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// The underlying fd.
    pub fn raw_fd(&self) -> RawFd {
        self.fd
    }

    /// Whether this is the invalid sentinel.
    pub fn is_invalid(&self) -> bool {
        self.fd < 0
    }
}

/// Marker for a connected byte-stream socket (TCP or pipe end).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamSocket(pub Socket);

/// Marker for a connected TCP stream socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpStreamSocket(pub Socket);

/// Marker for a listening TCP socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpAcceptSocket(pub Socket);

/// Marker for a UDP datagram socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpDatagramSocket(pub Socket);

/// One end of a pipe. The reactor itself drives wake-ups through an
/// `mio::Waker` (see `pollset.rs`), but the pipe primitives are kept
/// here as a core socket operation in their own right, independent of
/// which mechanism ultimately consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeSocket(pub Socket);

/// Closes `x`. No-op on the invalid sentinel.
pub fn close(x: Socket) {
    if !x.is_invalid() {
        unsafe {
            libc::close(x.fd);
        }
    }
}

/// Shuts down both directions of `x`. Errors are intentionally ignored:
/// by the time this is called the manager is tearing down regardless.
pub fn shutdown(x: Socket) {
    if !x.is_invalid() {
        unsafe {
            libc::shutdown(x.fd, libc::SHUT_RDWR);
        }
    }
}

/// Sets nonblocking I/O on `x`.
pub fn nonblocking(x: Socket, enabled: bool) -> Result<()> {
    with_borrowed(x, |s| s.set_nonblocking(enabled))
}

/// Sets `SO_REUSEADDR` on `x`.
pub fn reuseaddr(x: Socket, enabled: bool) -> Result<()> {
    with_borrowed(x, |s| s.set_reuse_address(enabled))
}

/// Sets `TCP_NODELAY` on a stream socket.
pub fn nodelay(x: StreamSocket, enabled: bool) -> Result<()> {
    with_borrowed(x.0, |s| s.set_nodelay(enabled))
}

/// Sets `SO_KEEPALIVE` on a stream socket.
pub fn keepalive(x: StreamSocket, enabled: bool) -> Result<()> {
    with_borrowed(x.0, |s| s.set_keepalive(enabled))
}

/// Returns the locally bound port of `x`, if any.
pub fn port_of(x: Socket) -> Result<u16> {
    let addr = with_borrowed(x, |s| s.local_addr())?;
    addr.as_socket()
        .map(|a| a.port())
        .ok_or_else(|| Error::invalid_argument("socket is not bound to an IP endpoint"))
}

/// The last OS-reported error for the calling thread.
pub fn last_socket_error() -> io::Error {
    io::Error::last_os_error()
}

/// Whether `last_socket_error()` indicates a transient condition
/// (`EAGAIN`/`EWOULDBLOCK`/`EINTR`) the caller should just retry later.
pub fn last_socket_error_is_temporary() -> bool {
    let err = last_socket_error();
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// `last_socket_error()` rendered as a human-readable string.
pub fn last_socket_error_as_string() -> String {
    last_socket_error().to_string()
}

/// Runs `f` against a temporary, non-owning [`Socket2`] view of `x`.
/// The temporary is leaked back to a raw fd afterward so `x` keeps
/// exclusive ownership semantics.
fn with_borrowed<T>(x: Socket, f: impl FnOnce(&Socket2) -> io::Result<T>) -> Result<T> {
    if x.is_invalid() {
        return Err(Error::invalid_argument("operation on invalid socket"));
    }
    let owned = unsafe { Socket2::from_raw_fd(x.fd) };
    let result = f(&owned);
    let _ = owned.into_raw_fd();
    result.map_err(Error::from)
}

/// Creates the read/write ends of a pipe used for cross-thread wake-ups.
pub fn make_pipe() -> Result<(PipeSocket, PipeSocket)> {
    let mut fds = [0i32; 2];
    let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if res != 0 {
        return Err(Error::from(io::Error::last_os_error()));
    }
    Ok((
        PipeSocket(Socket::from_raw_fd(fds[0])),
        PipeSocket(Socket::from_raw_fd(fds[1])),
    ))
}

/// Creates a TCP stream socket connected to `addr`.
pub fn make_connected_tcp_stream_socket(addr: SocketAddr) -> Result<TcpStreamSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket2::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    // Nonblocking *before* connecting: otherwise `connect` blocks the
    // calling thread until the TCP handshake completes or times out,
    // which on the reactor thread itself would stall every other
    // connection for as long as the peer takes to respond.
    socket.set_nonblocking(true)?;
    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(Error::from(e)),
    }
    let fd = socket.into_raw_fd();
    Ok(TcpStreamSocket(Socket::from_raw_fd(fd)))
}

/// Creates, binds (`SO_REUSEADDR`), and listens on a TCP accept socket.
/// Returns the socket and the bound port (useful when `addr`'s port is 0).
pub fn make_tcp_accept_socket(addr: SocketAddr, backlog: i32) -> Result<(TcpAcceptSocket, u16)> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket2::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    let bound_port = socket
        .local_addr()?
        .as_socket()
        .map(|a| a.port())
        .unwrap_or(0);
    let fd = socket.into_raw_fd();
    Ok((TcpAcceptSocket(Socket::from_raw_fd(fd)), bound_port))
}

/// Accepts one pending connection. Returns `None` if the accept would
/// block or otherwise failed; the caller distinguishes via
/// `last_socket_error_is_temporary`.
pub fn accept(sock: TcpAcceptSocket) -> Option<TcpStreamSocket> {
    let accepted_fd = unsafe { libc::accept(sock.0.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
    if accepted_fd < 0 {
        None
    } else {
        Some(TcpStreamSocket(Socket::from_raw_fd(accepted_fd)))
    }
}

/// Creates a UDP datagram socket bound to `addr`.
pub fn make_udp_datagram_socket(addr: SocketAddr) -> Result<UdpDatagramSocket> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket2::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.set_nonblocking(true)?;
    let fd = socket.into_raw_fd();
    Ok(UdpDatagramSocket(Socket::from_raw_fd(fd)))
}

/// Exclusively owns a socket handle; on drop, closes it unless
/// [`SocketGuard::release`] was called. This is the only correct way to
/// transfer ownership of a freshly created socket into a manager.
pub struct SocketGuard {
    sock: Socket,
}

impl SocketGuard {
    /// Take ownership of `sock`.
    pub fn new(sock: Socket) -> Self {
        Self { sock }
    }

    /// Release ownership: returns the held socket and leaves this guard
    /// holding the invalid sentinel, so its `Drop` becomes a no-op.
    pub fn release(&mut self) -> Socket {
        std::mem::replace(&mut self.sock, INVALID_SOCKET)
    }

    /// Peek at the held socket without transferring ownership.
    pub fn get(&self) -> Socket {
        self.sock
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if !self.sock.is_invalid() {
            close(self.sock);
        }
    }
}

/// Convenience constructor mirroring `net::make_socket_guard` in the
/// original design.
pub fn make_socket_guard(sock: Socket) -> SocketGuard {
    SocketGuard::new(sock)
}
