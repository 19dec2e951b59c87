//! Timer service: the `SetTimer`/`CancelTimer`/`Unregister` contract on top of the timing wheel.
//! Like the wheel itself, every method here is meant to be invoked only from the dispatcher
//! thread (typically from inside a `LOGIC_TIMER_*` message handler); callers on other threads go
//! through `Dispatcher::post_lambda` to get onto that thread first.
use super::wheel::{TimerNode as WheelNode, TimingWheel};
use flux::time::millis_to_ticks;
use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Weak};

pub trait TimerListener: Send + Sync {
    fn on_timer(&self, timer_id: u64, param: u64);
}

enum ListenerRef {
    Strong(Arc<dyn TimerListener>),
    Weak(Weak<dyn TimerListener>),
}

impl ListenerRef {
    fn identity(&self) -> usize {
        match self {
            ListenerRef::Strong(arc) => Arc::as_ptr(arc) as *const () as usize,
            ListenerRef::Weak(weak) => weak.as_ptr() as *const () as usize,
        }
    }

    /// Resolves a callable listener, returning `None` for a weak reference whose target has
    /// already been dropped.
    fn resolve(&self) -> Option<Arc<dyn TimerListener>> {
        match self {
            ListenerRef::Strong(arc) => Some(Arc::clone(arc)),
            ListenerRef::Weak(weak) => weak.upgrade(),
        }
    }
}

struct Entry {
    listener: ListenerRef,
    param: u64,
}

/// Hierarchical timer scheduler. Listener lookup for a fired timer id is separate from the
/// wheel's own id/expiry bookkeeping so that interval re-insertion only needs to touch the wheel.
pub struct TimerService {
    wheel: TimingWheel,
    entries: HashMap<u64, Entry>,
    listener_index: HashMap<usize, HashSet<u64>>,
    next_id: u64,
}

impl TimerService {
    pub fn new() -> Self {
        TimerService {
            wheel: TimingWheel::new(),
            entries: HashMap::new(),
            listener_index: HashMap::new(),
            next_id: 1,
        }
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn register(&mut self, id: u64, listener: ListenerRef, param: u64, delay_ms: u64, interval_ticks: u64) {
        let identity = listener.identity();
        self.listener_index.entry(identity).or_insert_with(HashSet::new).insert(id);

        let expiry_tick = self.wheel.current_tick() + millis_to_ticks(delay_ms).max(1);
        self.entries.insert(id, Entry { listener, param });
        self.wheel.insert(
            id,
            WheelNode {
                expiry_tick,
                interval_ticks,
                cancelled: false,
            },
        );
    }

    /// One-shot timer firing `delay_ms` from now (rounded up to the next tick).
    pub fn set_timer(&mut self, delay_ms: u64, listener: Arc<dyn TimerListener>, param: u64) -> u64 {
        let id = self.alloc_id();
        self.register(id, ListenerRef::Strong(listener), param, delay_ms, 0);
        id
    }

    /// Interval timer with a weak listener reference: a dropped listener silently cancels the
    /// interval the next time the wheel would have fired it.
    pub fn set_interval(&mut self, interval_ms: u64, listener: Weak<dyn TimerListener>, param: u64) -> u64 {
        let id = self.alloc_id();
        let ticks = millis_to_ticks(interval_ms).max(1);
        self.register(id, ListenerRef::Weak(listener), param, interval_ms, ticks);
        id
    }

    /// Soft-deletes the timer; a listener fires at most once more if its expiry message is
    /// already in flight when this returns, but never again after that.
    pub fn cancel_timer(&mut self, handle: u64) {
        if !self.wheel.cancel(handle) {
            return; // TimerMisuse: cancelling an unknown handle is silently ignored.
        }
        if let Some(entry) = self.entries.remove(&handle) {
            let identity = entry.listener.identity();
            if let Some(set) = self.listener_index.get_mut(&identity) {
                set.remove(&handle);
            }
        }
    }

    /// Cancels every timer still registered to `listener`.
    pub fn unregister(&mut self, listener: &Arc<dyn TimerListener>) {
        let identity = Arc::as_ptr(listener) as *const () as usize;
        if let Some(ids) = self.listener_index.remove(&identity) {
            for id in ids {
                self.wheel.cancel(id);
                self.entries.remove(&id);
            }
        }
    }

    /// Advances the wheel by one 10 ms tick, firing every listener whose timer expired and was
    /// not cancelled, re-inserting interval timers whose listener is still alive.
    pub fn advance(&mut self) {
        for id in self.wheel.advance() {
            let entry = match self.entries.remove(&id) {
                Some(entry) => entry,
                None => continue,
            };

            let listener = match entry.listener.resolve() {
                Some(l) => l,
                None => continue, // weak reference died; interval cancelled silently
            };

            listener.on_timer(id, entry.param);

            if let Some(node) = self.wheel.remove(id) {
                if node.interval_ticks > 0 {
                    let identity = entry.listener.identity();
                    let next_expiry = self.wheel.current_tick() + node.interval_ticks;
                    self.entries.insert(
                        id,
                        Entry {
                            listener: entry.listener,
                            param: entry.param,
                        },
                    );
                    self.listener_index.entry(identity).or_insert_with(HashSet::new).insert(id);
                    self.wheel.insert(
                        id,
                        WheelNode {
                            expiry_tick: next_expiry,
                            interval_ticks: node.interval_ticks,
                            cancelled: false,
                        },
                    );
                }
            }
        }
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        fires: AtomicUsize,
    }

    impl TimerListener for CountingListener {
        fn on_timer(&self, _timer_id: u64, _param: u64) {
            self.fires.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn one_shot_fires_exactly_once_at_the_expected_tick() {
        let mut svc = TimerService::new();
        let listener = Arc::new(CountingListener { fires: AtomicUsize::new(0) });
        svc.set_timer(50, listener.clone() as Arc<dyn TimerListener>, 0);

        for _ in 0..4 {
            svc.advance();
        }
        assert_eq!(listener.fires.load(Ordering::SeqCst), 0);

        svc.advance();
        assert_eq!(listener.fires.load(Ordering::SeqCst), 1);

        for _ in 0..10 {
            svc.advance();
        }
        assert_eq!(listener.fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut svc = TimerService::new();
        let listener = Arc::new(CountingListener { fires: AtomicUsize::new(0) });
        let handle = svc.set_timer(50, listener.clone() as Arc<dyn TimerListener>, 0);
        svc.cancel_timer(handle);

        for _ in 0..20 {
            svc.advance();
        }
        assert_eq!(listener.fires.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelling_an_unknown_handle_is_a_silent_no_op() {
        let mut svc = TimerService::new();
        svc.cancel_timer(9999);
        svc.advance();
    }

    #[test]
    fn interval_timer_fires_repeatedly_at_stable_period() {
        let mut svc = TimerService::new();
        let listener = Arc::new(CountingListener { fires: AtomicUsize::new(0) });
        svc.set_interval(100, Arc::downgrade(&(listener.clone() as Arc<dyn TimerListener>)), 0);

        for _ in 0..1000 {
            svc.advance();
        }
        // 100ms / 10ms-per-tick => fires every 10 ticks; 1000 ticks => ~100 fires.
        let fires = listener.fires.load(Ordering::SeqCst);
        assert!((95..=100).contains(&fires), "fires = {}", fires);
    }

    #[test]
    fn dead_weak_listener_silently_cancels_the_interval() {
        let mut svc = TimerService::new();
        let listener = Arc::new(CountingListener { fires: AtomicUsize::new(0) });
        let weak: Weak<dyn TimerListener> = Arc::downgrade(&(listener.clone() as Arc<dyn TimerListener>));
        svc.set_interval(10, weak, 0);
        drop(listener);

        for _ in 0..50 {
            svc.advance();
        }
        // No panic, no further bookkeeping growth; nothing to assert on a dropped listener
        // beyond "this does not fire or loop forever", which completing the loop demonstrates.
    }

    #[test]
    fn unregister_cancels_every_timer_owned_by_a_listener() {
        let mut svc = TimerService::new();
        let listener = Arc::new(CountingListener { fires: AtomicUsize::new(0) });
        let dyn_listener = listener.clone() as Arc<dyn TimerListener>;
        svc.set_timer(10, dyn_listener.clone(), 1);
        svc.set_timer(20, dyn_listener.clone(), 2);

        svc.unregister(&dyn_listener);

        for _ in 0..10 {
            svc.advance();
        }
        assert_eq!(listener.fires.load(Ordering::SeqCst), 0);
    }
}
