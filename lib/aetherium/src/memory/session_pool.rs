//! Two-tier session pool: a pre-allocated pool of reusable session objects plus a hard cap on
//! total sessions ever constructed, matching the original pool/factory contract without a hidden
//! process-wide singleton (the pool is an explicit, `Arc`-shared service).
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Implemented by the pooled type to reset itself before being handed out again.
pub trait Recyclable: Send {
    /// Closes sockets, clears queues, resets state. Called by `SessionPool::release` before the
    /// object re-enters the pool.
    fn on_recycle(&mut self);
}

#[derive(Debug, Clone, Copy)]
pub struct SessionPoolConfig {
    /// Sessions constructed and pushed onto the pool at startup.
    pub pre_count: usize,
    /// Hard cap on total sessions ever constructed (`pre_count` plus on-demand growth).
    pub max_sessions: usize,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        SessionPoolConfig {
            pre_count: 256,
            max_sessions: 10_000,
        }
    }
}

pub struct SessionPool<T: Recyclable> {
    config: SessionPoolConfig,
    pool: SegQueue<Box<T>>,
    factory: Box<dyn Fn() -> T + Send + Sync>,
    total_created: AtomicUsize,
    rejected: AtomicUsize,
}

impl<T: Recyclable> SessionPool<T> {
    pub fn new(config: SessionPoolConfig, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        let pool = SegQueue::new();
        let pre_count = config.pre_count.min(config.max_sessions);

        for _ in 0..pre_count {
            pool.push(Box::new(factory()));
        }

        SessionPool {
            config,
            pool,
            factory: Box::new(factory),
            total_created: AtomicUsize::new(pre_count),
            rejected: AtomicUsize::new(0),
        }
    }

    /// Pops a recycled session, or grows the pool by one (up to `max_sessions`), or returns
    /// `None` and records a rejection once the hard cap is reached.
    pub fn acquire(&self) -> Option<Box<T>> {
        if let Some(session) = self.pool.pop() {
            return Some(session);
        }

        loop {
            let current = self.total_created.load(Ordering::Relaxed);
            if current >= self.config.max_sessions {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return None;
            }

            if self
                .total_created
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Some(Box::new((self.factory)()));
            }
        }
    }

    pub fn release(&self, mut session: Box<T>) {
        session.on_recycle();
        self.pool.push(session);
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn total_created(&self) -> usize {
        self.total_created.load(Ordering::Relaxed)
    }

    pub fn idle_count(&self) -> usize {
        self.pool.len()
    }
}
