//! Serial, single-flight execution context layered over a shared [`ThreadPool`]. Tasks posted to
//! the same strand run strictly in submission order and never concurrently; tasks on different
//! strands may run in parallel on different pool workers. Grounded on the `isScheduled` CAS latch
//! described for per-entity (per-room, per-session) execution ordering.
use super::threadpool::{Task, ThreadPool};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

struct Inner {
    queue: Mutex<VecDeque<Task>>,
    scheduled: AtomicBool,
    pool: Weak<ThreadPool>,
}

/// A serial task queue. Cheap to clone (`Arc` underneath); clones share the same queue and
/// ordering guarantee.
#[derive(Clone)]
pub struct Strand(Arc<Inner>);

impl Strand {
    /// Borrows `pool` weakly, so a strand never keeps its pool alive — matching the original's
    /// cycle-avoidance rationale when a captured task closes over its own strand.
    pub fn new(pool: &Arc<ThreadPool>) -> Strand {
        Strand(Arc::new(Inner {
            queue: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
            pool: Arc::downgrade(pool),
        }))
    }

    /// Pushes `task` onto the strand's queue. If no drain job is currently scheduled, enqueues
    /// exactly one onto the backing pool to drive it; otherwise the task rides along with the
    /// job already in flight.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.0.queue.lock().push_back(Box::new(task));

        if self
            .0
            .scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            if let Some(pool) = self.0.pool.upgrade() {
                let inner = Arc::clone(&self.0);
                pool.submit(move || Strand::drain(&inner));
            } else {
                // Pool already shut down; clear the latch so a later `post` (if the pool is ever
                // replaced) can re-arm. Nothing left to drive the queue.
                self.0.scheduled.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Runs on a pool worker: pops and executes one task at a time under the strand's own lock
    /// discipline (lock, pop, unlock, execute) until the queue is empty, then clears the latch.
    fn drain(inner: &Arc<Inner>) {
        loop {
            let task = {
                let mut queue = inner.queue.lock();
                match queue.pop_front() {
                    Some(task) => task,
                    None => {
                        inner.scheduled.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            };
            task();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.0.queue.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux::logging;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn tasks_on_one_strand_run_in_submission_order() {
        let pool = ThreadPool::new(8, logging::discard());
        let strand = Strand::new(&pool);
        let order = Arc::new(StdMutex::new(Vec::new()));

        for i in 0..200 {
            let order = Arc::clone(&order);
            strand.post(move || order.lock().unwrap().push(i));
        }

        // Give the pool time to drain; this is a coordination-free wait since there is no
        // blocking primitive exposed for "strand is idle" (intentionally — strands don't expose
        // a flush/join, only post, matching the cancellation model in §4.7).
        thread::sleep(Duration::from_millis(200));

        let recorded = order.lock().unwrap();
        let expected: Vec<usize> = (0..200).collect();
        assert_eq!(*recorded, expected);
    }

    #[test]
    fn different_strands_may_run_concurrently() {
        let pool = ThreadPool::new(4, logging::discard());
        let a = Strand::new(&pool);
        let b = Strand::new(&pool);
        let counter = Arc::new(AtomicUsize::new(0));

        let barrier = Arc::new(std::sync::Barrier::new(2));
        let (c1, b1) = (Arc::clone(&counter), Arc::clone(&barrier));
        a.post(move || {
            b1.wait();
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let (c2, b2) = (Arc::clone(&counter), Arc::clone(&barrier));
        b.post(move || {
            b2.wait();
            c2.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn strand_outlives_a_dropped_pool_without_panicking() {
        let pool = ThreadPool::new(2, logging::discard());
        let strand = Strand::new(&pool);
        drop(pool);
        // No backing pool left to drive the drain; post must not panic, it just never runs.
        strand.post(|| {});
        assert_eq!(strand.pending_len(), 1);
    }
}
