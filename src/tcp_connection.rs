use std::any::Any;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{debug, error, warn};

use crate::buffer::Buffer;
use crate::callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::token::Token;

/// Grounded on muduo's `TcpConnection::highWaterMark_` default.
pub(crate) const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Lifecycle state of a [`TcpConnection`], progressing monotonically
/// `Connecting -> Connected -> Disconnecting -> Disconnected`.
///
/// Grounded on muduo's `TcpConnection::StateE`. Stored as an `AtomicU8`
/// rather than `std::atomic_int` because `connected()`/`disconnected()` may
/// be queried from any thread.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl From<u8> for ConnState {
    fn from(val: u8) -> ConnState {
        match val {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

/// A single accepted connection's state machine: the socket, its channel,
/// read/write buffers, and the user callback set, all owned and driven by
/// exactly one [`EventLoop`] (the sub-loop it was assigned to).
///
/// Grounded on muduo's `TcpConnection.h`/`.cc`. `handle_write`
/// implements the *intended* comparison of the source's disconnect
/// interleaving (`state == Disconnecting`), not the source's
/// assignment-in-conditional bug.
pub struct TcpConnection {
    loop_: Arc<EventLoop>,
    name: String,
    weak_self: Weak<TcpConnection>,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: InetAddress,
    peer_addr: InetAddress,
    high_water_mark: AtomicUsize,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<HighWaterMarkCallback>>,
    close_callback: Mutex<Option<CloseCallback>>,
}

impl TcpConnection {
    /// Construct a connection bound to `loop_` (the sub-loop it was
    /// assigned to), wiring all four `Channel` callbacks and enabling
    /// `SO_KEEPALIVE`. Does not register for readability yet; that happens
    /// in [`connect_established`](Self::connect_established), mirroring
    /// the source's split between constructor and `connectEstablished`.
    pub(crate) fn new(
        loop_: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: InetAddress,
        peer_addr: InetAddress,
    ) -> io::Result<Arc<TcpConnection>> {
        let fd = socket.fd();
        let channel = Channel::new(Arc::downgrade(&loop_), fd, Token(fd as usize));

        let conn = Arc::new_cyclic(|weak_self| TcpConnection {
            loop_,
            name,
            weak_self: weak_self.clone(),
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel: Arc::clone(&channel),
            local_addr,
            peer_addr,
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            close_callback: Mutex::new(None),
        });

        conn.socket.set_keep_alive(true)?;

        let read_target = Arc::downgrade(&conn);
        channel.set_read_callback(move |receive_time| {
            if let Some(conn) = read_target.upgrade() {
                conn.handle_read(receive_time);
            }
        });
        let write_target = Arc::downgrade(&conn);
        channel.set_write_callback(move || {
            if let Some(conn) = write_target.upgrade() {
                conn.handle_write();
            }
        });
        let close_target = Arc::downgrade(&conn);
        channel.set_close_callback(move || {
            if let Some(conn) = close_target.upgrade() {
                conn.handle_close();
            }
        });
        let error_target = Arc::downgrade(&conn);
        channel.set_error_callback(move || {
            if let Some(conn) = error_target.upgrade() {
                conn.handle_error();
            }
        });

        debug!("TcpConnection::new [{}] at fd={}", conn.name, fd);
        Ok(conn)
    }

    pub fn get_loop(&self) -> Arc<EventLoop> {
        Arc::clone(&self.loop_)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> InetAddress {
        self.local_addr
    }

    pub fn peer_address(&self) -> InetAddress {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        *self.message_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, high_water_mark: usize) {
        *self.high_water_mark_callback.lock().unwrap() = Some(cb);
        self.high_water_mark.store(high_water_mark, Ordering::Relaxed);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        *self.close_callback.lock().unwrap() = Some(cb);
    }

    /// Thread-safe: if called off the owning loop, posts a copy of `data`
    /// onto it. Drops silently if the connection is not `Connected`.
    /// Grounded on `TcpConnection::send(const std::string&)`.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        let Some(self_arc) = self.weak_self.upgrade() else {
            return;
        };
        let owned = data.to_vec();
        self.loop_.run_in_loop(move || {
            self_arc.send_in_loop(&owned);
        });
    }

    /// Half-close the write side once buffered output drains.
    /// Grounded on `TcpConnection::shutdown`.
    pub fn shutdown(&self) {
        if self.compare_and_set_state(ConnState::Connected, ConnState::Disconnecting) {
            if let Some(self_arc) = self.weak_self.upgrade() {
                self.loop_.run_in_loop(move || self_arc.shutdown_in_loop());
            }
        }
    }

    /// Grounded on `TcpConnection::connectEstablished`: runs on the owning
    /// loop once the connection has been assigned there. Installs the tie
    /// so the channel can detect this connection's liveness, enables
    /// reading, and fires the user connection callback.
    pub(crate) fn connect_established(&self) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);

        if let Some(self_arc) = self.weak_self.upgrade() {
            let tie: Arc<dyn Any + Send + Sync> = Arc::clone(&self_arc);
            self.channel.tie(&tie);
            self.channel.enable_reading();

            if let Some(cb) = self.connection_callback.lock().unwrap().clone() {
                cb(&self_arc);
            }
        }
    }

    /// Grounded on `TcpConnection::connectDestroyed`. Idempotent: a
    /// connection whose state already left `Connected` (e.g. via
    /// `handle_close`) only removes its channel here.
    pub(crate) fn connect_destroyed(&self) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            if let Some(self_arc) = self.weak_self.upgrade() {
                if let Some(cb) = self.connection_callback.lock().unwrap().clone() {
                    cb(&self_arc);
                }
            }
        }
        self.channel.remove();
    }

    fn handle_read(&self, receive_time: Instant) {
        let result = self.input_buffer.lock().unwrap().read_fd(self.channel.fd());
        match result {
            Ok(0) => self.handle_close(),
            Ok(_n) => {
                let cb = self.message_callback.lock().unwrap().clone();
                if let (Some(cb), Some(self_arc)) = (cb, self.weak_self.upgrade()) {
                    cb(&self_arc, &mut self.input_buffer.lock().unwrap(), receive_time);
                }
            }
            Err(err) => {
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error();
            }
        }
    }

    /// Grounded on `TcpConnection::sendInLoop`. Attempts a direct write
    /// when the channel is not already mid-write and the output buffer is
    /// empty; anything left over (or the whole payload, if the direct
    /// attempt was skipped) is buffered and write interest enabled.
    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();

        let len = data.len();
        let mut nwrote = 0usize;
        let mut remaining = len;
        let mut fault_error = false;

        if self.state() == ConnState::Disconnected {
            warn!("TcpConnection::send_in_loop [{}] disconnected, give up writing", self.name);
            return;
        }

        let should_write_direct =
            !self.channel.is_writing() && self.output_buffer.lock().unwrap().readable_bytes() == 0;
        if should_write_direct {
            match write_once(self.channel.fd(), data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = len - n;
                    if remaining == 0 {
                        self.post_write_complete();
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(err) => {
                    error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                    if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault_error = true;
                    }
                }
            }
        }

        if !fault_error && remaining > 0 {
            let old_len = self.output_buffer.lock().unwrap().readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                if let Some(cb) = self.high_water_mark_callback.lock().unwrap().clone() {
                    if let Some(self_arc) = self.weak_self.upgrade() {
                        let total = old_len + remaining;
                        self.loop_.queue_in_loop(move || cb(&self_arc, total));
                    }
                }
            }
            self.output_buffer.lock().unwrap().append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Grounded on `TcpConnection::handleWrite`.
    fn handle_write(&self) {
        if !self.channel.is_writing() {
            warn!("TcpConnection fd={} is down, no more writing", self.channel.fd());
            return;
        }

        let written = self.output_buffer.lock().unwrap().write_fd(self.channel.fd());
        match written {
            Ok(n) => {
                self.output_buffer.lock().unwrap().retrieve(n);
                if self.output_buffer.lock().unwrap().readable_bytes() == 0 {
                    self.channel.disable_writing();
                    self.post_write_complete();
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(err) => {
                error!("TcpConnection::handle_write [{}]: {}", self.name, err);
            }
        }
    }

    fn post_write_complete(&self) {
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            if let Some(self_arc) = self.weak_self.upgrade() {
                self.loop_.queue_in_loop(move || cb(&self_arc));
            }
        }
    }

    /// Grounded on `TcpConnection::shutdownInLoop`: only half-closes once
    /// the output buffer has fully drained; otherwise `handle_write`'s
    /// drain path calls this again when it empties the buffer.
    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(err) = self.socket.shutdown_write() {
                error!("TcpConnection::shutdown_in_loop [{}]: {}", self.name, err);
            }
        }
    }

    /// Grounded on `TcpConnection::handleClose`. Takes a strong reference
    /// before invoking callbacks so the connection outlives its own close
    /// notification even if every other holder drops it mid-callback.
    fn handle_close(&self) {
        debug!("TcpConnection::handle_close [{}] fd={}", self.name, self.channel.fd());
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        if let Some(self_arc) = self.weak_self.upgrade() {
            if let Some(cb) = self.connection_callback.lock().unwrap().clone() {
                cb(&self_arc);
            }
            if let Some(cb) = self.close_callback.lock().unwrap().clone() {
                cb(&self_arc);
            }
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(err) => error!("TcpConnection::handle_error [{}] - SO_ERROR: {}", self.name, err),
            Err(err) => error!(
                "TcpConnection::handle_error [{}] - getsockopt failed: {}",
                self.name, err
            ),
        }
    }

    fn state(&self) -> ConnState {
        ConnState::from(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn compare_and_set_state(&self, expected: ConnState, new: ConnState) -> bool {
        self.state
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.channel.fd(),
            self.state()
        );
    }
}

/// A single `write(2)` of an arbitrary byte slice, used only by the direct
/// first-attempt path in `send_in_loop` (the buffered drain path in
/// `handle_write` instead writes the output `Buffer`'s own readable region
/// via `Buffer::write_fd`). Grounded on muduo's raw `::write(fd, data, len)`
/// call in `TcpConnection::sendInLoop`.
fn write_once(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = syscall!(write(fd, data.as_ptr() as *const libc::c_void, data.len()))?;
    Ok(n as usize)
}
