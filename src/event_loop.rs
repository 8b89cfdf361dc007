use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::token::Token;
use crate::waker::Waker;

thread_local! {
    /// Guards against a second `EventLoop` on the same OS thread. Grounded
    /// on `EventLoop.cc`'s `t_loopInThisThread`, simplified: the source
    /// resets this on destruction because it's a stack-local pointer. This
    /// crate's `EventLoop` is reference-counted and may outlive the loop
    /// thread (e.g. another thread holding a stale `Arc` after `quit()`),
    /// so clearing the flag on `Drop` could run on the wrong thread; since
    /// every loop thread is created by `EventLoopThread` and constructs
    /// exactly one `EventLoop` for its entire lifetime, the flag never
    /// needs to be cleared.
    static CURRENT_LOOP: Cell<bool> = const { Cell::new(false) };
}

type PendingFunctor = Box<dyn FnOnce() + Send>;

/// A single-threaded reactor: owns an epoll-backed [`Poller`], the channels
/// registered with it, and a mutex-guarded queue of closures deferred onto
/// this loop's thread from elsewhere.
///
/// Grounded on muduo's `EventLoop.h`/`.cc`. Constructed with
/// [`EventLoop::new`] and driven with [`EventLoop::run`] on the thread that
/// created it; every other method may be called from any thread, following
/// the source's "most methods check `isInLoopThread`, a few are genuinely
/// thread-safe" split.
pub struct EventLoop {
    thread_id: ThreadId,
    poller: Mutex<Poller>,
    quit: AtomicBool,
    calling_pending_functors: AtomicBool,
    pending_functors: Mutex<Vec<PendingFunctor>>,
    waker: Waker,
    wakeup_channel: Arc<Channel>,
}

impl EventLoop {
    /// Construct an `EventLoop` for the calling thread.
    ///
    /// Fatal per spec §7: failure to create the epoll fd or the wakeup
    /// eventfd, like a duplicate `EventLoop` on the same thread, is a
    /// programmer/environmental error, not a recoverable runtime condition,
    /// and `panic!`s with a diagnostic rather than returning an `Err` a
    /// caller might plausibly retry from.
    pub fn new() -> Arc<EventLoop> {
        CURRENT_LOOP.with(|flag| {
            if flag.get() {
                panic!("another EventLoop already exists in this thread");
            }
            flag.set(true);
        });

        let thread_id = thread::current().id();
        let poller = Poller::new().unwrap_or_else(|err| {
            panic!("EventLoop::new failed to create epoll instance: {}", err)
        });
        let waker = Waker::new()
            .unwrap_or_else(|err| panic!("EventLoop::new failed to create wakeup eventfd: {}", err));
        let waker_fd = waker.fd();

        let event_loop = Arc::new_cyclic(|weak_self| {
            let wakeup_channel = Channel::new(weak_self.clone(), waker_fd, Token(waker_fd as usize));
            EventLoop {
                thread_id,
                poller: Mutex::new(poller),
                quit: AtomicBool::new(false),
                calling_pending_functors: AtomicBool::new(false),
                pending_functors: Mutex::new(Vec::new()),
                waker,
                wakeup_channel,
            }
        });

        let ack_target = Arc::downgrade(&event_loop);
        event_loop.wakeup_channel.set_read_callback(move |_receive_time| {
            if let Some(event_loop) = ack_target.upgrade() {
                if let Err(err) = event_loop.waker.ack() {
                    error!("EventLoop wakeup ack failed: {}", err);
                }
            }
        });
        event_loop.wakeup_channel.enable_reading();

        event_loop
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Grounded on `EventLoop::assertInLoopThread`.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "EventLoop used from a thread other than its own"
        );
    }

    /// Drive the reactor until [`quit`](Self::quit) is called. Named `run`
    /// rather than the source's `loop()`, which is a reserved word in Rust;
    /// same operation.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        let mut active_channels = Vec::new();

        while !self.quit.load(Ordering::Acquire) {
            let poll_timeout = Duration::from_secs(10);
            let receive_time = {
                let mut poller = self.poller.lock().unwrap();
                match poller.poll(Some(poll_timeout), &mut active_channels) {
                    Ok(now) => now,
                    Err(err) => {
                        error!("EventLoop::run poll failed: {}", err);
                        Instant::now()
                    }
                }
            };

            for channel in &active_channels {
                channel.handle_event(receive_time);
            }
            self.do_pending_functors();
        }
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `cb` now if called from the loop thread, otherwise defer it.
    pub fn run_in_loop(&self, cb: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            cb();
        } else {
            self.queue_in_loop(cb);
        }
    }

    /// Defer `cb` to run on the loop thread during the next (or current, if
    /// mid-drain) pass over the pending-functor queue.
    pub fn queue_in_loop(&self, cb: impl FnOnce() + Send + 'static) {
        self.pending_functors.lock().unwrap().push(Box::new(cb));

        if !self.is_in_loop_thread() || self.calling_pending_functors.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn wakeup(&self) {
        if let Err(err) = self.waker.wake() {
            error!("EventLoop::wakeup failed: {}", err);
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if let Err(err) = self.poller.lock().unwrap().update_channel(channel) {
            error!("EventLoop::update_channel failed: {}", err);
        }
    }

    pub(crate) fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        if let Err(err) = self.poller.lock().unwrap().remove_channel(channel) {
            error!("EventLoop::remove_channel failed: {}", err);
        }
    }

    pub fn has_channel(&self, token: Token) -> bool {
        self.poller.lock().unwrap().has_channel(token)
    }

    /// Swap the pending queue into a local vector and run it without
    /// holding the lock, so a queued closure enqueuing more work doesn't
    /// deadlock. Grounded on `EventLoop::doPendingFunctors`.
    fn do_pending_functors(&self) {
        self.calling_pending_functors.store(true, Ordering::Release);

        let functors = std::mem::take(&mut *self.pending_functors.lock().unwrap());
        trace!("EventLoop::do_pending_functors running {} functors", functors.len());
        for functor in functors {
            functor();
        }

        self.calling_pending_functors.store(false, Ordering::Release);
    }
}
