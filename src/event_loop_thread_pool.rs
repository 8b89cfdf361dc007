use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::callbacks::ThreadInitCallback;
use crate::event_loop::EventLoop;
use crate::event_loop_thread::EventLoopThread;

/// A pool of sub-loops selected round-robin, fronting one base loop.
///
/// Grounded on muduo's `EventLoopThreadPool.h`/`.cc`. The base loop
/// (typically the main loop running the [`Acceptor`](crate::Acceptor)) is
/// supplied at construction; `start` spawns `n` additional
/// [`EventLoopThread`]s, each with its own `EventLoop`.
pub struct EventLoopThreadPool {
    base_loop: Arc<EventLoop>,
    threads: Vec<EventLoopThread>,
    sub_loops: Vec<Arc<EventLoop>>,
    next: AtomicUsize,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop,
            threads: Vec::new(),
            sub_loops: Vec::new(),
            next: AtomicUsize::new(0),
        }
    }

    /// Spawn `n` sub-loop threads. If `n == 0`, no threads are spawned and
    /// `get_next_loop` always returns the base loop; the init callback, if
    /// any, runs once on the base loop inline, matching the source's
    /// single-threaded-server behavior.
    pub fn start(&mut self, n: usize, thread_init_callback: Option<ThreadInitCallback>) {
        for _ in 0..n {
            let thread = EventLoopThread::new(thread_init_callback.clone());
            let sub_loop = thread.start_loop();
            self.threads.push(thread);
            self.sub_loops.push(sub_loop);
        }

        if n == 0 {
            if let Some(cb) = thread_init_callback {
                cb(&self.base_loop);
            }
        }
    }

    /// Round-robin the next sub-loop, or the base loop if the pool has no
    /// sub-loops. Grounded on `EventLoopThreadPool::getNextLoop`.
    pub fn get_next_loop(&self) -> Arc<EventLoop> {
        if self.sub_loops.is_empty() {
            return Arc::clone(&self.base_loop);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.sub_loops.len();
        Arc::clone(&self.sub_loops[index])
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.sub_loops.is_empty() {
            vec![Arc::clone(&self.base_loop)]
        } else {
            self.sub_loops.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop_thread::EventLoopThread;

    #[test]
    fn zero_threads_always_returns_the_base_loop() {
        let base_thread = EventLoopThread::new(None);
        let base_loop = base_thread.start_loop();
        let mut pool = EventLoopThreadPool::new(Arc::clone(&base_loop));
        pool.start(0, None);

        assert!(Arc::ptr_eq(&pool.get_next_loop(), &base_loop));
        assert!(Arc::ptr_eq(&pool.get_next_loop(), &base_loop));
    }

    #[test]
    fn n_threads_round_robin_with_period_n() {
        let base_thread = EventLoopThread::new(None);
        let base_loop = base_thread.start_loop();
        let mut pool = EventLoopThreadPool::new(base_loop);
        pool.start(3, None);

        let picks: Vec<_> = (0..6).map(|_| pool.get_next_loop()).collect();
        for i in 0..3 {
            assert!(Arc::ptr_eq(&picks[i], &picks[i + 3]));
        }
        assert!(!Arc::ptr_eq(&picks[0], &picks[1]));
        assert!(!Arc::ptr_eq(&picks[1], &picks[2]));
    }
}
