//! `netreactor` is a non-blocking, multi-reactor TCP server framework built
//! on the "one loop per thread" pattern: a per-thread [`EventLoop`] owns an
//! epoll-backed [`Poller`] and drives registered [`Channel`]s; a main loop
//! accepts connections and hands each one to a round-robin pool of sub-loops
//! via [`EventLoopThreadPool`]; application code reacts to connection and
//! message events through the callbacks registered on [`TcpServer`].
//!
//! The crate only targets Linux (`epoll`/`eventfd`); there is no portable
//! fallback, matching the scope of the reactor core this is built from.

#![cfg(unix)]

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod callbacks;
mod channel;
mod event_loop;
mod event_loop_thread;
mod event_loop_thread_pool;
mod inet_address;
mod interest;
mod poller;
mod socket;
mod tcp_connection;
mod tcp_server;
mod token;
mod waker;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use callbacks::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use channel::Channel;
pub use event_loop::EventLoop;
pub use event_loop_thread::EventLoopThread;
pub use event_loop_thread_pool::EventLoopThreadPool;
pub use inet_address::InetAddress;
pub use interest::Interest;
pub use poller::Poller;
pub use tcp_connection::{ConnState, TcpConnection};
pub use tcp_server::{ServerOptions, TcpServer};
pub use token::Token;
