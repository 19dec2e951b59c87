//! MPMC dispatch fabric: the single funnel that network I/O, the timing wheel and deferred
//! lambda work all post onto, and that a bounded pool of worker threads drains. Grounded on the
//! thread-cache/bulk-transfer shape already used by [`crate::memory::packet_pool`], extended with
//! the waiter-gated condvar wakeup and pending-destroy sweep described in §4.5.
use crate::memory::{MessageTag, PacketMessage};
use crate::timer::{TimerListener, TimerService};
use crossbeam_queue::SegQueue;
use flux::logging;
use flux::SessionId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A read-only view over one packet's identifier and payload, valid only for the duration of the
/// handler call that receives it (§6 `PacketView`).
pub struct PacketView<'a> {
    pub id: u16,
    pub payload: &'a [u8],
}

/// A session handle the dispatcher can poll for quiescence before releasing it back to its pool.
/// `aetherium::net::Session` is the sole production implementor; tests use lightweight fakes.
pub trait Quiescent: Send + Sync {
    fn session_id(&self) -> SessionId;
    /// `true` once `connected == false && ioRef == 0` (§3 Session invariant).
    fn is_quiescent(&self) -> bool;
    /// Invoked once quiescence is observed, right before the handle is dropped by the sweep.
    fn on_reclaim(&self);
}

/// Application-supplied packet/session handler contract (§6).
pub trait NetworkHandler: Send + Sync {
    fn on_connect(&self, session_id: SessionId);
    /// Called exactly once per connected session.
    fn on_disconnect(&self, session_id: SessionId);
    fn on_data(&self, session_id: SessionId, view: PacketView<'_>);
}

enum DispatchMessage {
    NetworkConnect(Arc<dyn Quiescent>),
    NetworkDisconnect(Arc<dyn Quiescent>),
    NetworkData(PacketMessage),
    TimerAdd(Box<dyn FnOnce(&mut TimerService) + Send>),
    TimerCancel(u64),
    TimerUnregister(Arc<dyn TimerListener>),
    TimerTick,
    LambdaJob(Box<dyn FnOnce() + Send>),
}

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    pub worker_count: usize,
    /// Bulk-dequeue batch size per `Process()` iteration.
    pub batch_size: usize,
    /// Queue depth above which `is_overloaded()` reports true.
    pub high_water: usize,
    /// Queue depth below which `is_recovered()` reports true. Must be `< high_water` — the gap
    /// is the hysteresis band that prevents backpressure flapping (P8).
    pub low_water: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        DispatcherConfig {
            worker_count: 4,
            batch_size: 64,
            high_water: 8192,
            low_water: 2048,
        }
    }
}

/// Process-wide message dispatch fabric, shared via `Arc` and explicitly started/stopped rather
/// than hidden behind a singleton (§9 "Singletons").
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: SegQueue<DispatchMessage>,
    queue_len: AtomicUsize,
    waiters: AtomicUsize,
    wake_lock: Mutex<()>,
    wake_cond: Condvar,
    stop: AtomicBool,
    pending_destroy: Mutex<Vec<Arc<dyn Quiescent>>>,
    timer: Mutex<TimerService>,
    handler: Mutex<Option<Arc<dyn NetworkHandler>>>,
    log: logging::Logger,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, log: logging::Logger) -> Arc<Dispatcher> {
        Arc::new(Dispatcher {
            config,
            queue: SegQueue::new(),
            queue_len: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            wake_lock: Mutex::new(()),
            wake_cond: Condvar::new(),
            stop: AtomicBool::new(false),
            pending_destroy: Mutex::new(Vec::new()),
            timer: Mutex::new(TimerService::new()),
            handler: Mutex::new(None),
            log,
        })
    }

    pub fn set_handler(&self, handler: Arc<dyn NetworkHandler>) {
        *self.handler.lock() = Some(handler);
    }

    /// Spawns `worker_count` threads, each running [`Dispatcher::run_worker`] until `stop` is
    /// called.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|idx| {
                let me = Arc::clone(self);
                std::thread::Builder::new()
                    .name(format!("dispatch-{}", idx))
                    .spawn(move || me.run_worker())
                    .expect("failed to spawn dispatcher worker")
            })
            .collect()
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        let _guard = self.wake_lock.lock();
        self.wake_cond.notify_all();
    }

    #[inline]
    fn push(&self, msg: DispatchMessage) {
        self.queue.push(msg);
        self.queue_len.fetch_add(1, Ordering::Relaxed);
        // Only pay for the notify when a worker is actually parked, matching the original's
        // waiter-counter gate on `Post`.
        if self.waiters.load(Ordering::Relaxed) > 0 {
            let _guard = self.wake_lock.lock();
            self.wake_cond.notify_one();
        }
    }

    pub fn post_connect(&self, session: Arc<dyn Quiescent>) {
        self.push(DispatchMessage::NetworkConnect(session));
    }

    pub fn post_disconnect(&self, session: Arc<dyn Quiescent>) {
        self.push(DispatchMessage::NetworkDisconnect(session));
    }

    /// Posts a parsed wire frame for `session_id`. `packet` must already carry `MessageTag::NetworkData`
    /// and a stamped packet id (see `PacketPool::allocate_for_session` + `with_packet_id`).
    pub fn post_data(&self, packet: PacketMessage) {
        self.push(DispatchMessage::NetworkData(packet));
    }

    pub fn post_lambda(&self, job: impl FnOnce() + Send + 'static) {
        self.push(DispatchMessage::LambdaJob(Box::new(job)));
    }

    /// Called by a dedicated 10ms driver thread; advancing the wheel happens on a dispatcher
    /// worker, preserving "timers are owned by the dispatcher thread" (§4.6).
    pub fn post_timer_tick(&self) {
        self.push(DispatchMessage::TimerTick);
    }

    pub fn set_timer(&self, delay_ms: u64, listener: Arc<dyn TimerListener>, param: u64) {
        self.push(DispatchMessage::TimerAdd(Box::new(move |svc| {
            svc.set_timer(delay_ms, listener, param);
        })));
    }

    pub fn set_interval(
        &self,
        interval_ms: u64,
        listener: std::sync::Weak<dyn TimerListener>,
        param: u64,
    ) {
        self.push(DispatchMessage::TimerAdd(Box::new(move |svc| {
            svc.set_interval(interval_ms, listener, param);
        })));
    }

    pub fn cancel_timer(&self, handle: u64) {
        self.push(DispatchMessage::TimerCancel(handle));
    }

    pub fn unregister_timer_listener(&self, listener: Arc<dyn TimerListener>) {
        self.push(DispatchMessage::TimerUnregister(listener));
    }

    pub fn queue_len(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    /// `HIGH_WATER` threshold crossed: callers should pause reads (§4.5 backpressure, P8).
    pub fn is_overloaded(&self) -> bool {
        self.queue_len() > self.config.high_water
    }

    /// `LOW_WATER` threshold crossed: callers may resume reads.
    pub fn is_recovered(&self) -> bool {
        self.queue_len() < self.config.low_water
    }

    fn run_worker(self: Arc<Self>) {
        loop {
            let drained = self.process_batch();

            if drained == 0 {
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
                self.park();
            }
        }
    }

    fn park(&self) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.wake_lock.lock();
        // Re-check under the lock: a `push` that happened between the empty-dequeue and here
        // would otherwise be missed.
        if self.queue_len.load(Ordering::SeqCst) == 0 && !self.stop.load(Ordering::SeqCst) {
            self.wake_cond
                .wait_for(&mut guard, std::time::Duration::from_millis(10));
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
    }

    /// Bulk-dequeues up to `batch_size` messages and dispatches each by tag (§4.5). Returns the
    /// number of messages processed. Public so tests (and the console's synchronous drain in its
    /// own tests) can pump the dispatcher without a worker thread; production code drives this
    /// exclusively through `start()`'s worker loop.
    pub fn process_batch(&self) -> usize {
        let mut processed = 0;
        for _ in 0..self.config.batch_size {
            let msg = match self.queue.pop() {
                Some(msg) => msg,
                None => break,
            };
            self.queue_len.fetch_sub(1, Ordering::Relaxed);
            self.dispatch_one(msg);
            processed += 1;
        }

        if processed > 0 {
            self.process_pending_destroys();
        }

        processed
    }

    fn dispatch_one(&self, msg: DispatchMessage) {
        match msg {
            DispatchMessage::NetworkConnect(session) => {
                let handler = self.handler.lock().clone();
                if let Some(handler) = handler {
                    handler.on_connect(session.session_id());
                }
            }
            DispatchMessage::NetworkDisconnect(session) => {
                let handler = self.handler.lock().clone();
                if let Some(handler) = handler {
                    handler.on_disconnect(session.session_id());
                }
                self.pending_destroy.lock().push(session);
            }
            DispatchMessage::NetworkData(packet) => {
                let session_id = match packet.session_id() {
                    Some(id) => id,
                    None => {
                        logging::warn!(self.log, "network data with no session id"; "context" => "dispatch");
                        return;
                    }
                };
                let handler = self.handler.lock().clone();
                if let Some(handler) = handler {
                    let view = PacketView {
                        id: packet.packet_id().unwrap_or(0),
                        payload: packet.payload(),
                    };
                    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        handler.on_data(session_id, view)
                    })) {
                        Ok(()) => {}
                        Err(_) => {
                            // HandlerFailure (§7): logged and swallowed at the dispatcher
                            // boundary, worker continues; the session may already be closed.
                            logging::error!(self.log, "packet handler panicked";
                                "context" => "dispatch", "session_id" => session_id);
                        }
                    }
                }
                // ioRef is released only now, after the handler call above has actually run
                // (or panicked) against this message — not at post time — so a disconnect can't
                // race ahead of in-flight processing and get swept while this is still live (§4.3
                // ioRef invariant, P2).
                if let Some(handle) = packet.io_ref_handle() {
                    handle.dec_io_ref();
                }
            }
            DispatchMessage::TimerAdd(install) => {
                install(&mut self.timer.lock());
            }
            DispatchMessage::TimerCancel(handle) => {
                self.timer.lock().cancel_timer(handle);
            }
            DispatchMessage::TimerUnregister(listener) => {
                self.timer.lock().unregister(&listener);
            }
            DispatchMessage::TimerTick => {
                self.timer.lock().advance();
            }
            DispatchMessage::LambdaJob(job) => {
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)).is_err() {
                    logging::error!(self.log, "lambda job panicked"; "context" => "dispatch");
                }
            }
        }
    }

    /// Swap-and-pop sweep of sessions that became quiescent since the last pass (§4.5).
    fn process_pending_destroys(&self) {
        let mut pending = self.pending_destroy.lock();
        let mut i = 0;
        while i < pending.len() {
            if pending[i].is_quiescent() {
                let session = pending.swap_remove(i);
                session.on_reclaim();
            } else {
                i += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as AU;
    use std::sync::Mutex as StdMutex;

    struct FakeSession {
        id: SessionId,
        connected: AtomicBool,
        io_ref: AU,
        reclaimed: AtomicBool,
    }

    impl Quiescent for FakeSession {
        fn session_id(&self) -> SessionId {
            self.id
        }
        fn is_quiescent(&self) -> bool {
            !self.connected.load(Ordering::SeqCst) && self.io_ref.load(Ordering::SeqCst) == 0
        }
        fn on_reclaim(&self) {
            self.reclaimed.store(true, Ordering::SeqCst);
        }
    }

    struct RecordingHandler {
        connects: StdMutex<Vec<SessionId>>,
        disconnects: StdMutex<Vec<SessionId>>,
        data: StdMutex<Vec<(SessionId, u16, Vec<u8>)>>,
    }

    impl NetworkHandler for RecordingHandler {
        fn on_connect(&self, session_id: SessionId) {
            self.connects.lock().unwrap().push(session_id);
        }
        fn on_disconnect(&self, session_id: SessionId) {
            self.disconnects.lock().unwrap().push(session_id);
        }
        fn on_data(&self, session_id: SessionId, view: PacketView<'_>) {
            self.data
                .lock()
                .unwrap()
                .push((session_id, view.id, view.payload.to_vec()));
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        Dispatcher::new(DispatcherConfig::default(), logging::discard())
    }

    #[test]
    fn network_data_is_delivered_in_fifo_order_for_a_session() {
        let dispatcher = dispatcher();
        let handler = Arc::new(RecordingHandler {
            connects: StdMutex::new(Vec::new()),
            disconnects: StdMutex::new(Vec::new()),
            data: StdMutex::new(Vec::new()),
        });
        dispatcher.set_handler(handler.clone());

        let pool = crate::memory::PacketPool::new(Default::default());
        let a = pool
            .allocate_for_session(MessageTag::NetworkData, 1, b"A")
            .unwrap()
            .with_packet_id(1);
        let b = pool
            .allocate_for_session(MessageTag::NetworkData, 1, b"B")
            .unwrap()
            .with_packet_id(2);

        dispatcher.post_data(a);
        dispatcher.post_data(b);

        while dispatcher.process_batch() > 0 {}

        let received = handler.data.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].2, b"A");
        assert_eq!(received[1].2, b"B");
    }

    #[test]
    fn pending_destroy_sweeps_only_quiescent_sessions() {
        let dispatcher = dispatcher();
        let handler = Arc::new(RecordingHandler {
            connects: StdMutex::new(Vec::new()),
            disconnects: StdMutex::new(Vec::new()),
            data: StdMutex::new(Vec::new()),
        });
        dispatcher.set_handler(handler);

        let still_busy = Arc::new(FakeSession {
            id: 1,
            connected: AtomicBool::new(false),
            io_ref: AU::new(1),
            reclaimed: AtomicBool::new(false),
        });
        let quiescent = Arc::new(FakeSession {
            id: 2,
            connected: AtomicBool::new(false),
            io_ref: AU::new(0),
            reclaimed: AtomicBool::new(false),
        });

        dispatcher.post_disconnect(still_busy.clone());
        dispatcher.post_disconnect(quiescent.clone());

        while dispatcher.process_batch() > 0 {}

        assert!(!still_busy.reclaimed.load(Ordering::SeqCst));
        assert!(quiescent.reclaimed.load(Ordering::SeqCst));
        assert_eq!(dispatcher.pending_destroy.lock().len(), 1);
    }

    #[test]
    fn backpressure_hysteresis_requires_dropping_below_low_water() {
        let config = DispatcherConfig {
            high_water: 4,
            low_water: 2,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config, logging::discard());

        for _ in 0..5 {
            dispatcher.post_lambda(|| {});
        }
        assert!(dispatcher.is_overloaded());
        assert!(!dispatcher.is_recovered());

        for _ in 0..2 {
            dispatcher.process_batch();
        }
        assert!(!dispatcher.is_overloaded());
        assert!(!dispatcher.is_recovered());

        for _ in 0..2 {
            dispatcher.process_batch();
        }
        assert!(dispatcher.is_recovered());
    }

    #[test]
    fn a_panicking_handler_does_not_poison_the_dispatcher() {
        struct PanicHandler;
        impl NetworkHandler for PanicHandler {
            fn on_connect(&self, _: SessionId) {}
            fn on_disconnect(&self, _: SessionId) {}
            fn on_data(&self, _: SessionId, _: PacketView<'_>) {
                panic!("boom");
            }
        }

        let dispatcher = dispatcher();
        dispatcher.set_handler(Arc::new(PanicHandler));

        let pool = crate::memory::PacketPool::new(Default::default());
        let msg = pool
            .allocate_for_session(MessageTag::NetworkData, 1, b"x")
            .unwrap()
            .with_packet_id(1);
        dispatcher.post_data(msg);

        assert_eq!(dispatcher.process_batch(), 1);
        dispatcher.post_lambda(|| {});
        assert_eq!(dispatcher.process_batch(), 1);
    }
}
