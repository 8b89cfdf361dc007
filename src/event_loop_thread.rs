use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;

/// What `start_loop` is waiting to observe from the spawned thread.
///
/// The `Failed` state exists so that a panic during `EventLoop::new()` (the
/// construction failures spec §7 calls fatal: the epoll fd or wakeup
/// eventfd couldn't be created) still reaches the condvar before the
/// thread dies. Without it, the spawned thread could panic and unwind
/// straight through the publish step, leaving `start_loop` parked on
/// `condvar.wait` forever since nobody ever calls `notify_one`.
enum LoopSlot {
    Pending,
    Ready(Arc<EventLoop>),
    Failed,
}

/// Spawns a thread that owns exactly one [`EventLoop`] for its lifetime.
///
/// Grounded on muduo's `EventLoopThread.h`/`.cc`: the loop is
/// constructed on the new thread (not handed in from the caller) and
/// published back to the caller of [`start_loop`](Self::start_loop) through
/// a mutex + condition variable, since the caller must block until the
/// child thread's `EventLoop` exists before it can hand it work.
pub struct EventLoopThread {
    published: Arc<(Mutex<LoopSlot>, Condvar)>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(thread_init_callback: Option<ThreadInitCallback>) -> EventLoopThread {
        let published = Arc::new((Mutex::new(LoopSlot::Pending), Condvar::new()));
        let published_for_thread = Arc::clone(&published);

        let handle = thread::spawn(move || {
            let constructed = panic::catch_unwind(AssertUnwindSafe(|| {
                let event_loop = EventLoop::new();
                if let Some(cb) = &thread_init_callback {
                    cb(&event_loop);
                }
                event_loop
            }));

            let event_loop = match constructed {
                Ok(event_loop) => event_loop,
                Err(payload) => {
                    let (lock, condvar) = &*published_for_thread;
                    *lock.lock().unwrap() = LoopSlot::Failed;
                    condvar.notify_one();
                    panic::resume_unwind(payload);
                }
            };

            {
                let (lock, condvar) = &*published_for_thread;
                *lock.lock().unwrap() = LoopSlot::Ready(Arc::clone(&event_loop));
                condvar.notify_one();
            }

            event_loop.run();
        });

        EventLoopThread {
            published,
            handle: Some(handle),
        }
    }

    /// Block until the spawned thread's `EventLoop` is constructed, then
    /// return a handle to it. Grounded on `EventLoopThread::startLoop`.
    ///
    /// # Panics
    ///
    /// Panics if the spawned thread failed to construct its `EventLoop`
    /// (the fatal construction errors documented on [`EventLoop::new`]):
    /// that failure already panicked the spawned thread, so surfacing it
    /// here too keeps it visible instead of leaving the caller hanging.
    pub fn start_loop(&self) -> Arc<EventLoop> {
        let (lock, condvar) = &*self.published;
        let mut slot = lock.lock().unwrap();
        loop {
            match &*slot {
                LoopSlot::Pending => slot = condvar.wait(slot).unwrap(),
                LoopSlot::Ready(event_loop) => return Arc::clone(event_loop),
                LoopSlot::Failed => panic!("EventLoopThread failed to construct its EventLoop"),
            }
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        let (lock, _condvar) = &*self.published;
        let event_loop = match &*lock.lock().unwrap() {
            LoopSlot::Ready(event_loop) => Some(Arc::clone(event_loop)),
            LoopSlot::Pending | LoopSlot::Failed => None,
        };
        if let Some(event_loop) = event_loop {
            event_loop.quit();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
