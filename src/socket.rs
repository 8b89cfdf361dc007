use std::io;
use std::mem::size_of;
use std::net::SocketAddrV4;
use std::os::unix::io::{AsRawFd, RawFd};

use crate::inet_address::InetAddress;

/// An owned, non-blocking, close-on-exec socket file descriptor.
///
/// Grounded on muduo's `Socket` class: a thin RAII wrapper that guarantees
/// the fd is closed on every exit path, including unwinding. Both
/// [`Acceptor`](crate::Acceptor) and
/// [`TcpConnection`](crate::TcpConnection) own one of these.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Wrap an already-open fd (e.g. one just returned by `accept4`).
    ///
    /// # Safety
    ///
    /// `fd` must be a valid, open file descriptor that nothing else owns.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Socket {
        Socket { fd }
    }

    /// Create a new non-blocking, close-on-exec IPv4 TCP socket.
    pub fn new_tcp_nonblocking() -> io::Result<Socket> {
        let fd = syscall!(socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        Ok(Socket { fd })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_sock_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    fn set_sock_opt(&self, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
        let val: libc::c_int = on as libc::c_int;
        syscall!(setsockopt(
            self.fd,
            level,
            name,
            &val as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub fn bind(&self, addr: &InetAddress) -> io::Result<()> {
        let raw = addr.to_sockaddr_in();
        syscall!(bind(
            self.fd,
            &raw as *const libc::sockaddr_in as *const libc::sockaddr,
            size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub fn listen(&self) -> io::Result<()> {
        const BACKLOG: libc::c_int = 1024;
        syscall!(listen(self.fd, BACKLOG)).map(|_| ())
    }

    /// Accept one pending connection. Returns `Ok(None)` on `EWOULDBLOCK` so
    /// callers can loop until the backlog drains without special-casing the
    /// error kind themselves.
    pub fn accept(&self) -> io::Result<Option<(Socket, InetAddress)>> {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let res = syscall!(accept4(
            self.fd,
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ));
        match res {
            Ok(connfd) => Ok(Some((
                Socket { fd: connfd },
                InetAddress::from_sockaddr_in(raw),
            ))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// The local address this socket is bound to. Used by `TcpServer` to
    /// discover the address a freshly-accepted connection landed on.
    pub fn local_addr(&self) -> io::Result<InetAddress> {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        syscall!(getsockname(
            self.fd,
            &mut raw as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        ))?;
        Ok(InetAddress::from_sockaddr_in(raw))
    }

    /// Half-close the write side, leaving reads open until the peer's FIN.
    pub fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd, libc::SHUT_WR)).map(|_| ())
    }

    /// Read `SO_ERROR` and clear it, per `getsockopt(2)`.
    pub fn take_error(&self) -> io::Result<i32> {
        let mut val: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut val as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        ))?;
        Ok(val)
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Convert a `std::net::SocketAddrV4` into the fields our raw `bind` needs,
/// used only by callers that already hold a standard-library address (e.g.
/// tests). The core public API speaks [`InetAddress`] directly.
#[allow(dead_code)]
pub(crate) fn sockaddr_v4_to_inet(addr: SocketAddrV4) -> InetAddress {
    InetAddress::new(*addr.ip(), addr.port())
}
