use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{error, warn};

use crate::event_loop::EventLoop;
use crate::interest::Interest;
use crate::token::Token;

/// Registration state with the [`Poller`](crate::Poller), private to it.
/// Grounded on muduo's `Channel::index_`/`Channel::States` enum.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PollState {
    New,
    Added,
    Deleted,
}

type ReadCallback = Box<dyn FnMut(Instant) + Send>;
type SimpleCallback = Box<dyn FnMut() + Send>;

struct ChannelInner {
    interest: Interest,
    revents: u32,
    poll_state: PollState,
    event_handling: bool,
    tie: Option<Weak<dyn Any + Send + Sync>>,
    read_callback: Option<ReadCallback>,
    write_callback: Option<SimpleCallback>,
    close_callback: Option<SimpleCallback>,
    error_callback: Option<SimpleCallback>,
}

/// Binds one fd, its interest mask, the last-observed ready mask, and four
/// event callbacks (read/write/close/error).
///
/// Grounded on muduo's `Channel` (`include/Channel.h`). The
/// owning higher-level object ([`TcpConnection`](crate::TcpConnection),
/// [`Acceptor`](crate::Acceptor), or [`EventLoop`]'s own wakeup channel)
/// holds an `Arc<Channel>`; the [`Poller`](crate::Poller) holds only a
/// `Weak<Channel>` keyed by [`Token`], matching the source's ownership
/// direction (`loop_->updateChannel(this)` with a raw, non-owning back
/// pointer the other way).
pub struct Channel {
    fd: RawFd,
    token: Token,
    weak_self: Weak<Channel>,
    owning_loop: Weak<EventLoop>,
    inner: Mutex<ChannelInner>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(owning_loop: Weak<EventLoop>, fd: RawFd, token: Token) -> Arc<Channel> {
        Arc::new_cyclic(|weak_self| Channel {
            fd,
            token,
            weak_self: weak_self.clone(),
            owning_loop,
            inner: Mutex::new(ChannelInner {
                interest: Interest::NONE,
                revents: 0,
                poll_state: PollState::New,
                event_handling: false,
                tie: None,
                read_callback: None,
                write_callback: None,
                close_callback: None,
                error_callback: None,
            }),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn set_read_callback(&self, cb: impl FnMut(Instant) + Send + 'static) {
        self.inner.lock().unwrap().read_callback = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.inner.lock().unwrap().write_callback = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.inner.lock().unwrap().close_callback = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.inner.lock().unwrap().error_callback = Some(Box::new(cb));
    }

    /// Install a weak back-reference to the owning object. Checked on every
    /// `handle_event`; if it no longer upgrades, the event is discarded.
    pub fn tie(&self, owner: &Arc<(dyn Any + Send + Sync)>) {
        self.inner.lock().unwrap().tie = Some(Arc::downgrade(owner));
    }

    pub fn is_reading(&self) -> bool {
        self.inner.lock().unwrap().interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.inner.lock().unwrap().interest.is_writable()
    }

    pub fn is_none_interest(&self) -> bool {
        self.inner.lock().unwrap().interest.is_none()
    }

    pub fn enable_reading(&self) {
        self.assert_in_loop_thread();
        self.inner.lock().unwrap().interest = self.interest().with_readable(true);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.assert_in_loop_thread();
        self.inner.lock().unwrap().interest = self.interest().with_readable(false);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.assert_in_loop_thread();
        self.inner.lock().unwrap().interest = self.interest().with_writable(true);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.assert_in_loop_thread();
        self.inner.lock().unwrap().interest = self.interest().with_writable(false);
        self.update();
    }

    pub fn disable_all(&self) {
        self.assert_in_loop_thread();
        self.inner.lock().unwrap().interest = Interest::NONE;
        self.update();
    }

    /// Deregister from the owning loop's poller entirely.
    pub fn remove(&self) {
        self.assert_in_loop_thread();
        if let (Some(loop_), Some(self_arc)) = (self.owning_loop.upgrade(), self.weak_self.upgrade())
        {
            loop_.remove_channel(&self_arc);
        }
    }

    pub(crate) fn interest(&self) -> Interest {
        self.inner.lock().unwrap().interest
    }

    pub(crate) fn poll_state(&self) -> PollState {
        self.inner.lock().unwrap().poll_state
    }

    pub(crate) fn set_poll_state(&self, state: PollState) {
        self.inner.lock().unwrap().poll_state = state;
    }

    /// Record the raw `epoll_event.events` bits for the upcoming
    /// `handle_event` call. Written only by the `Poller`.
    pub(crate) fn set_revents(&self, revents: u32) {
        self.inner.lock().unwrap().revents = revents;
    }

    fn update(&self) {
        if let (Some(loop_), Some(self_arc)) = (self.owning_loop.upgrade(), self.weak_self.upgrade())
        {
            loop_.update_channel(&self_arc);
        }
    }

    fn assert_in_loop_thread(&self) {
        if let Some(loop_) = self.owning_loop.upgrade() {
            loop_.assert_in_loop_thread();
        }
    }

    /// Dispatch the ready events recorded by `set_revents` to the
    /// registered callbacks, in the fixed order close -> error -> read ->
    /// write. Grounded on `Channel::handleEventWithGuard`.
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        if let Some(tie) = self.inner.lock().unwrap().tie.clone() {
            if tie.upgrade().is_none() {
                return;
            }
        }

        self.inner.lock().unwrap().event_handling = true;
        let revents = self.inner.lock().unwrap().revents;

        if (revents & libc::EPOLLHUP as u32) != 0 && (revents & libc::EPOLLIN as u32) == 0 {
            warn!("Channel::handle_event fd = {} EPOLLHUP", self.fd);
            if let Some(cb) = &mut self.inner.lock().unwrap().close_callback {
                cb();
            }
        }

        if (revents & libc::EPOLLERR as u32) != 0 {
            if let Some(cb) = &mut self.inner.lock().unwrap().error_callback {
                cb();
            }
        }

        if (revents
            & (libc::EPOLLIN as u32 | libc::EPOLLPRI as u32 | libc::EPOLLRDHUP as u32))
            != 0
        {
            let cb = self.inner.lock().unwrap().read_callback.take();
            if let Some(mut cb) = cb {
                cb(receive_time);
                self.inner.lock().unwrap().read_callback = Some(cb);
            }
        }

        if (revents & libc::EPOLLOUT as u32) != 0 {
            let cb = self.inner.lock().unwrap().write_callback.take();
            if let Some(mut cb) = cb {
                cb();
                self.inner.lock().unwrap().write_callback = Some(cb);
            }
        }

        self.inner.lock().unwrap().event_handling = false;
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        if inner.event_handling {
            error!("Channel dropped for fd = {} while handling an event", self.fd);
        }
    }
}
