//! Fixed-size worker pool: `N` threads started explicitly, gated by a counting semaphore so a
//! parked worker wakes exactly once per submitted task (or once per stop signal). Grounded on the
//! dispatcher's own wake-one-waiter pattern in `crate::dispatcher`, generalized into a reusable
//! primitive for [`crate::concurrency::strand::Strand`] and for direct task submission.
use crossbeam_queue::SegQueue;
use flux::logging;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicIsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A boxed unit of work. `FnOnce` rather than `Fn`: a task runs exactly once.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

struct Semaphore {
    count: AtomicIsize,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Semaphore {
            count: AtomicIsize::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn release(&self, n: usize) {
        self.count.fetch_add(n as isize, Ordering::SeqCst);
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Blocks until the count is positive, then decrements it by one.
    fn acquire(&self) {
        loop {
            let current = self.count.load(Ordering::SeqCst);
            if current > 0
                && self
                    .count
                    .compare_exchange(current, current - 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                return;
            }
            let mut guard = self.lock.lock();
            if self.count.load(Ordering::SeqCst) <= 0 {
                self.cond.wait(&mut guard);
            }
        }
    }
}

/// A fixed-N worker pool with a lock-free task queue. Shared via `Arc` and referenced weakly by
/// [`crate::concurrency::strand::Strand`] to avoid pool-strand reference cycles through captured
/// tasks.
pub struct ThreadPool {
    queue: SegQueue<Task>,
    semaphore: Semaphore,
    stop: AtomicBool,
    log: logging::Logger,
}

impl ThreadPool {
    pub fn new(worker_count: usize, log: logging::Logger) -> Arc<ThreadPool> {
        let pool = Arc::new(ThreadPool {
            queue: SegQueue::new(),
            semaphore: Semaphore::new(),
            stop: AtomicBool::new(false),
            log,
        });

        let handles: Vec<JoinHandle<()>> = (0..worker_count)
            .map(|idx| {
                let worker_pool = Arc::clone(&pool);
                std::thread::Builder::new()
                    .name(format!("pool-worker-{}", idx))
                    .spawn(move || worker_pool.run_worker())
                    .expect("failed to spawn thread pool worker")
            })
            .collect();

        // Workers outlive this constructor; detach the handles rather than keep them, matching
        // the original's fire-and-forget worker threads. `stop()` is the only coordinated join
        // point callers need.
        for handle in handles {
            std::mem::drop(handle);
        }

        pool
    }

    /// Enqueues `task` lock-free and wakes exactly one parked worker.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.queue.push(Box::new(task));
        self.semaphore.release(1);
    }

    /// Sets the stop flag and wakes every worker so each can observe it and exit.
    pub fn stop(&self, worker_count: usize) {
        self.stop.store(true, Ordering::SeqCst);
        self.semaphore.release(worker_count);
    }

    fn run_worker(&self) {
        loop {
            self.semaphore.acquire();

            match self.queue.pop() {
                Some(task) => {
                    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)).is_err() {
                        logging::error!(self.log, "pool task panicked"; "context" => "threadpool");
                    }
                }
                None => {
                    if self.stop.load(Ordering::SeqCst) {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn submitted_tasks_all_run() {
        let pool = ThreadPool::new(4, logging::discard());
        let counter = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(101));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let barrier = Arc::clone(&barrier);
            pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                barrier.wait();
            });
        }
        barrier.wait();

        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn a_panicking_task_does_not_kill_the_worker() {
        let pool = ThreadPool::new(2, logging::discard());
        let counter = Arc::new(AtomicUsize::new(0));

        pool.submit(|| panic!("boom"));

        let counter2 = Arc::clone(&counter);
        let barrier = Arc::new(Barrier::new(2));
        let barrier2 = Arc::clone(&barrier);
        pool.submit(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
            barrier2.wait();
        });
        barrier.wait();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
