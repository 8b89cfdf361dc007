use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::token::Token;

/// Delivers a freshly-accepted connection's socket and peer address.
pub type NewConnectionCallback = Box<dyn FnMut(Socket, InetAddress) + Send>;

/// Owns the listening socket on the main loop.
///
/// Grounded on muduo's `Acceptor.h`/`.cc`. On construction the
/// socket is made non-blocking and close-on-exec, `SO_REUSEADDR` is always
/// set, `SO_REUSEPORT` only if requested, and the socket is bound to
/// `listen_addr`; [`listen`](Self::listen) then calls `listen(2)` and
/// registers the accept channel for readability.
pub struct Acceptor {
    loop_: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    listening: Mutex<bool>,
    spare_fd: Mutex<Option<RawFd>>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        loop_: Arc<EventLoop>,
        listen_addr: &InetAddress,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let accept_socket = Socket::new_tcp_nonblocking()?;
        accept_socket.set_reuse_addr(true)?;
        if reuse_port {
            accept_socket.set_reuse_port(true)?;
        }
        accept_socket.bind(listen_addr)?;

        let accept_channel = Channel::new(
            Arc::downgrade(&loop_),
            accept_socket.fd(),
            Token(accept_socket.fd() as usize),
        );

        let acceptor = Arc::new(Acceptor {
            loop_,
            accept_socket,
            accept_channel,
            listening: Mutex::new(false),
            spare_fd: Mutex::new(open_spare_fd()),
            new_connection_callback: Mutex::new(None),
        });

        let handler_target = Arc::downgrade(&acceptor);
        acceptor.accept_channel.set_read_callback(move |_receive_time| {
            if let Some(acceptor) = handler_target.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(Socket, InetAddress) + Send + 'static) {
        *self.new_connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    /// Start listening: `listen(2)` the socket, then register for
    /// readability. Grounded on `Acceptor::listen`.
    pub fn listen(&self) -> io::Result<()> {
        self.loop_.assert_in_loop_thread();
        *self.listening.lock().unwrap() = true;
        self.accept_socket.listen()?;
        self.accept_channel.enable_reading();
        Ok(())
    }

    /// Accept exactly one pending connection (the multiplexer is
    /// level-triggered, so a fuller backlog is simply reported again on the
    /// next poll). Grounded on `Acceptor::handleRead`.
    fn handle_read(&self) {
        match self.accept_socket.accept() {
            Ok(Some((socket, peer_addr))) => {
                let mut cb_slot = self.new_connection_callback.lock().unwrap();
                if let Some(cb) = cb_slot.as_mut() {
                    cb(socket, peer_addr);
                }
                // else: `socket` drops here, closing the accepted fd, matching
                // the source's explicit `::close(connfd)` when no callback is set.
            }
            Ok(None) => {}
            Err(err) if is_fd_exhaustion(&err) => {
                error!("Acceptor::handle_read sockfd reached limit: {}", err);
                self.drain_one_with_spare_fd();
            }
            Err(err) => {
                error!("Acceptor::handle_read accept err: {}", err);
            }
        }
    }

    /// Free the spare fd, accept-and-drop one connection to clear the
    /// backlog entry that would otherwise spin the loop at 100% CPU
    /// (readable forever, unacceptable forever), then reopen the spare.
    /// Not present in the source; permitted by spec as an addition.
    fn drain_one_with_spare_fd(&self) {
        if let Some(fd) = self.spare_fd.lock().unwrap().take() {
            unsafe {
                libc::close(fd);
            }
        }
        match self.accept_socket.accept() {
            Ok(Some(_)) => {}
            Ok(None) => {}
            Err(err) => error!("Acceptor spare-fd drain accept failed: {}", err),
        }
        *self.spare_fd.lock().unwrap() = open_spare_fd();
    }

    /// Deregister the accept channel from the poller and close the spare
    /// fd. Must run on the owning loop's thread (`disable_all`/`remove`
    /// assert this via the channel).
    ///
    /// `TcpServer` posts this through `run_in_loop` before its last
    /// `Arc<Acceptor>` drops, the same way `TcpServer::drop` posts
    /// `connect_destroyed` for every live connection instead of relying on
    /// field-drop order: `Drop::drop` only ever gets `&mut self`, and by
    /// the time an `Acceptor`'s last strong reference goes away the caller
    /// holding it may be on a thread other than the owning loop's.
    pub(crate) fn close(&self) {
        self.loop_.assert_in_loop_thread();
        self.accept_channel.disable_all();
        self.accept_channel.remove();
        if let Some(fd) = self.spare_fd.lock().unwrap().take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

impl Drop for Acceptor {
    /// `close` already deregisters the channel and closes the spare fd when
    /// `TcpServer` tears down normally; this only catches the spare fd for
    /// an `Acceptor` dropped without ever going through `close` (e.g. a
    /// failed `TcpServer::new`). It deliberately does not touch the channel:
    /// that requires the owning loop's thread, which `Drop::drop` cannot
    /// arrange for.
    fn drop(&mut self) {
        if let Some(fd) = self.spare_fd.lock().unwrap().take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

fn open_spare_fd() -> Option<RawFd> {
    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        error!(
            "Acceptor failed to open spare fd: {}",
            io::Error::last_os_error()
        );
        None
    } else {
        Some(fd)
    }
}
