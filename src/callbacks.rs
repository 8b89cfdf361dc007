use std::sync::Arc;
use std::time::Instant;

use crate::{Buffer, EventLoop, TcpConnection};

/// Fires on every `connected()` transition, both up (`connectEstablished`)
/// and down (`connectDestroyed`). Grounded on muduo's `ConnectionCallback`
/// (muduo's `Callbacks.h`).
pub type ConnectionCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fires once per `handleRead` with data available, carrying the input
/// buffer and the receive timestamp. Grounded on muduo's `MessageCallback`.
pub type MessageCallback = Arc<dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync>;

/// Fires once all buffered output has drained, grounded on muduo's
/// `WriteCompleteCallback`.
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fires when the output buffer crosses the high-water mark, carrying the
/// total buffered byte count. Grounded on muduo's `HighWaterMarkCallback`.
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync>;

/// Internal close notification routed from `TcpConnection::handle_close` to
/// `TcpServer::remove_connection`. Not part of muduo's public
/// `Callbacks.h`; muduo wires this with a raw member-function `bind`, which
/// has no portable equivalent as a type alias, so this crate names it
/// explicitly instead.
pub type CloseCallback = Arc<dyn Fn(&Arc<TcpConnection>) + Send + Sync>;

/// Fires once per sub-loop, on that sub-loop, right after construction.
/// Grounded on muduo's `ThreadInitCallback`.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;
