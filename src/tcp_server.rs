use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error};

use crate::acceptor::Acceptor;
use crate::callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, ThreadInitCallback,
    WriteCompleteCallback,
};
use crate::event_loop::EventLoop;
use crate::event_loop_thread_pool::EventLoopThreadPool;
use crate::inet_address::InetAddress;
use crate::socket::Socket;
use crate::tcp_connection::TcpConnection;

/// Whether the listening socket sets `SO_REUSEPORT` in addition to the
/// always-on `SO_REUSEADDR`. Grounded on muduo's `TcpServer::Option` enum
/// (`kNoReusePort` / `kReusePort`).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct ServerOptions {
    pub reuse_port: bool,
}

impl ServerOptions {
    pub const NO_REUSE_PORT: ServerOptions = ServerOptions { reuse_port: false };
    pub const REUSE_PORT: ServerOptions = ServerOptions { reuse_port: true };
}

/// Top-level façade wiring the [`Acceptor`], the sub-loop
/// [`EventLoopThreadPool`], the application's callback set, and the
/// connection-name -> [`TcpConnection`] table.
///
/// Grounded on muduo's `TcpServer.h`/`.cc`. Runs on a base loop
/// supplied by the caller (typically the process's main thread); every
/// accepted connection is handed to a sub-loop chosen round-robin and all
/// of its I/O then happens there.
pub struct TcpServer {
    weak_self: Weak<TcpServer>,
    loop_: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Mutex<EventLoopThreadPool>,
    num_threads: AtomicUsize,
    connection_callback: Mutex<Option<ConnectionCallback>>,
    message_callback: Mutex<Option<MessageCallback>>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    high_water_mark_callback: Mutex<Option<(HighWaterMarkCallback, usize)>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicUsize,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
}

impl TcpServer {
    pub fn new(
        loop_: Arc<EventLoop>,
        listen_addr: InetAddress,
        name: impl Into<String>,
        options: ServerOptions,
    ) -> io::Result<Arc<TcpServer>> {
        let name = name.into();
        let ip_port = listen_addr.to_string();
        let acceptor = Acceptor::new(Arc::clone(&loop_), &listen_addr, options.reuse_port)?;
        let thread_pool = EventLoopThreadPool::new(Arc::clone(&loop_));

        let server = Arc::new_cyclic(|weak_self| TcpServer {
            weak_self: weak_self.clone(),
            loop_,
            ip_port,
            name,
            acceptor: Arc::clone(&acceptor),
            thread_pool: Mutex::new(thread_pool),
            num_threads: AtomicUsize::new(0),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            high_water_mark_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicUsize::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let new_conn_target = Arc::downgrade(&server);
        acceptor.set_new_connection_callback(move |socket, peer_addr| {
            if let Some(server) = new_conn_target.upgrade() {
                server.new_connection(socket, peer_addr);
            }
        });

        Ok(server)
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

    /// `high_water_mark` is copied into every connection assigned after
    /// this call; in-flight connections keep whatever mark they were
    /// constructed with. Grounded on
    /// `TcpConnection::setHighWaterMarkCallback(cb, highWaterMark)`, hoisted
    /// to server scope since the source never actually wires a per-server
    /// default in `TcpServer::newConnection`; this crate closes that gap
    /// so the server-level setter actually takes effect.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, high_water_mark: usize) {
        *self.high_water_mark_callback.lock().unwrap() = Some((cb, high_water_mark));
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        *self.thread_init_callback.lock().unwrap() = Some(cb);
    }

    /// Configure the number of sub-loops; must be called before
    /// [`start`](Self::start). Grounded on `TcpServer::setThreadNum`.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn get_loop(&self) -> Arc<EventLoop> {
        Arc::clone(&self.loop_)
    }

    /// Idempotent: only the first call spins up the sub-loop pool and
    /// posts `Acceptor::listen` onto the base loop. Grounded on
    /// `TcpServer::start`'s `started_++ == 0` guard.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let thread_init_cb = self.thread_init_callback.lock().unwrap().clone();
        let num_threads = self.num_threads.load(Ordering::Relaxed);
        self.thread_pool.lock().unwrap().start(num_threads, thread_init_cb);

        let acceptor = Arc::clone(&self.acceptor);
        self.loop_.run_in_loop(move || {
            if let Err(err) = acceptor.listen() {
                error!("TcpServer::start failed to listen: {}", err);
            }
        });
    }

    /// Grounded on `TcpServer::newConnection`: runs on the base loop
    /// (delivered by `Acceptor::handle_read`). Assigns a sub-loop
    /// round-robin, builds a unique connection name, looks up the local
    /// address via `getsockname`, constructs the `TcpConnection`, wires the
    /// server's callbacks plus the internal close callback into it, and
    /// posts `connect_established` onto the assigned sub-loop.
    fn new_connection(&self, socket: Socket, peer_addr: InetAddress) {
        self.loop_.assert_in_loop_thread();

        let io_loop = self.thread_pool.lock().unwrap().get_next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        debug!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpServer::new_connection getsockname failed: {}", err);
                return;
            }
        };

        let conn = match TcpConnection::new(
            Arc::clone(&io_loop),
            conn_name.clone(),
            socket,
            local_addr,
            peer_addr,
        ) {
            Ok(conn) => conn,
            Err(err) => {
                error!("TcpServer::new_connection failed to construct connection: {}", err);
                return;
            }
        };

        if let Some(cb) = self.connection_callback.lock().unwrap().clone() {
            conn.set_connection_callback(cb);
        }
        if let Some(cb) = self.message_callback.lock().unwrap().clone() {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        if let Some((cb, mark)) = self.high_water_mark_callback.lock().unwrap().clone() {
            conn.set_high_water_mark_callback(cb, mark);
        }
        if let Some(server) = self.weak_self.upgrade() {
            conn.set_close_callback(Arc::new(move |conn: &Arc<TcpConnection>| {
                server.remove_connection(conn);
            }));
        }

        self.connections.lock().unwrap().insert(conn_name, Arc::clone(&conn));

        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Grounded on `TcpServer::removeConnection`: bounces onto the base
    /// loop so the connection table is only ever mutated there.
    fn remove_connection(&self, conn: &Arc<TcpConnection>) {
        let conn = Arc::clone(conn);
        if let Some(server) = self.weak_self.upgrade() {
            self.loop_.run_in_loop(move || server.remove_connection_in_loop(&conn));
        }
    }

    /// Grounded on `TcpServer::removeConnectionInLoop`. Erases the table
    /// entry, then posts `connect_destroyed` onto the connection's own
    /// loop; the closure keeps the connection alive until that completes.
    fn remove_connection_in_loop(&self, conn: &Arc<TcpConnection>) {
        self.loop_.assert_in_loop_thread();
        debug!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        self.connections.lock().unwrap().remove(conn.name());

        let io_loop = conn.get_loop();
        let conn = Arc::clone(conn);
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    /// Grounded on `~TcpServer`: every live connection is handed a final
    /// `connect_destroyed` on its own loop. Sub-loops join as the pool's
    /// `EventLoopThread`s drop along with `self`.
    ///
    /// The acceptor's teardown is posted onto the base loop the same way:
    /// `TcpServer` holds the acceptor's last strong reference, so letting
    /// it simply fall out of scope here would run `Acceptor`'s `Drop` (and
    /// therefore any same-thread channel teardown) on whatever thread drops
    /// the last `Arc<TcpServer>`, not necessarily the base loop's own
    /// thread. Cloning it into the posted closure keeps it alive until
    /// `close()` actually runs there.
    fn drop(&mut self) {
        let conns: Vec<Arc<TcpConnection>> = self.connections.lock().unwrap().drain().map(|(_, c)| c).collect();
        for conn in conns {
            let io_loop = conn.get_loop();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }

        let acceptor = Arc::clone(&self.acceptor);
        self.loop_.run_in_loop(move || acceptor.close());
    }
}
