//! TCP session: one socket driving recv, send and heartbeat, via `ioRef` accounting and an
//! `isSending` CAS latch for lock-free single-flight sends (§4.3). The socket, recv buffer and
//! pool slot each still need a short-held critical section around the underlying I/O object, so
//! they use the same `parking_lot::Mutex` the rest of the crate standardizes on (`acceptor.rs`,
//! `udp.rs`, `dispatcher/mod.rs`). Grounded on the teacher's buffer/framing split
//! ([`crate::net::buffer::Buffer`], [`crate::net::frame`]), rebuilt around the current
//! `Dispatcher`/`PacketPool` pair instead of the teacher's retired handshake-era `Channel`.
use crate::dispatcher::{Dispatcher, Quiescent};
use crate::memory::{IoRefHandle, MessageTag, PacketMessage, PacketPool};
use crate::memory::{Recyclable, SessionPool};
use crate::net::buffer::Buffer;
use crate::net::frame::{FrameHeader, Packet, HEADER_SIZE};
use crate::timer::TimerListener;
use crossbeam_queue::SegQueue;
use flux::crypto::EncryptionAdapter;
use flux::logging;
use flux::SessionId;
use mio::net::TcpStream;
use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// The pooled control-block `SessionPool` hands out (§4.2). Unlike the original's in-place
/// socket reuse, a Rust `Session` owns a live `TcpStream` that can't be reset and reattached
/// safely, so the pool here only reserves an id/slot against the hard cap; the heavier `Session`
/// itself is still constructed fresh per accept and released back through `on_reclaim` once
/// quiescent (see DESIGN.md).
pub struct SessionSlot {
    pub id: SessionId,
}

impl Recyclable for SessionSlot {
    fn on_recycle(&mut self) {}
}

/// Re-armed every second; compares `now - lastRecv` against the configured timeout and invokes
/// the configured ping function otherwise (§4.3 heartbeat).
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub timeout_ms: u64,
    pub ping_interval_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            timeout_ms: 30_000,
            ping_interval_ms: 10_000,
        }
    }
}

const FLUSH_BATCH: usize = 1000;
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Initial delay before re-checking an overloaded dispatcher for buffered-but-unparsed frames
/// (§4.3 backpressure).
const BACKPRESSURE_RETRY_MS: u64 = 10;
/// Backoff applied on each subsequent re-check while the dispatcher remains overloaded.
const BACKPRESSURE_RETRY_BACKOFF_MS: u64 = 50;

/// Recv-side outcome of pumping the socket once: either some frames were parsed and posted, or
/// the peer closed / errored and the session should be torn down.
pub enum RecvOutcome {
    Progressed,
    WouldBlock,
    Closed,
}

pub struct Session {
    id: SessionId,
    peer: SocketAddr,
    stream: Mutex<TcpStream>,
    recv_buffer: Mutex<Buffer>,
    send_queue: SegQueue<PacketMessage>,
    is_sending: AtomicBool,
    connected: AtomicBool,
    io_ref: AtomicUsize,
    send_seq: AtomicU64,
    recv_seq: AtomicU64,
    last_recv_millis: AtomicU64,
    last_ping_millis: AtomicU64,
    cipher: Box<dyn EncryptionAdapter>,
    pool: Arc<PacketPool>,
    heartbeat: HeartbeatConfig,
    log: logging::Logger,
    slot: Mutex<Option<Box<SessionSlot>>>,
    session_pool: Arc<SessionPool<SessionSlot>>,
}

impl Session {
    pub fn new(
        slot: Box<SessionSlot>,
        session_pool: Arc<SessionPool<SessionSlot>>,
        stream: TcpStream,
        peer: SocketAddr,
        cipher: Box<dyn EncryptionAdapter>,
        pool: Arc<PacketPool>,
        heartbeat: HeartbeatConfig,
        log: logging::Logger,
    ) -> Arc<Session> {
        let _ = stream.set_nodelay(true);
        let id = slot.id;
        Arc::new(Session {
            id,
            peer,
            stream: Mutex::new(stream),
            recv_buffer: Mutex::new(Buffer::new(RECV_BUFFER_SIZE)),
            send_queue: SegQueue::new(),
            is_sending: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            io_ref: AtomicUsize::new(0),
            send_seq: AtomicU64::new(0),
            recv_seq: AtomicU64::new(0),
            last_recv_millis: AtomicU64::new(flux::time::timestamp_millis()),
            last_ping_millis: AtomicU64::new(flux::time::timestamp_millis()),
            cipher,
            pool,
            heartbeat,
            log,
            slot: Mutex::new(Some(slot)),
            session_pool,
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The TCP peer address captured at accept time; used to bootstrap a companion UDP side
    /// channel for this session (§4.4).
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn inc_ref(&self) {
        self.io_ref.fetch_add(1, Ordering::SeqCst);
    }

    fn dec_ref(&self) {
        self.io_ref.fetch_sub(1, Ordering::SeqCst);
    }

    /// Reads everything currently available, parses complete frames out of the recv buffer,
    /// decrypts each body in place, and posts a `NetworkData` message per frame. Each posted
    /// message carries an `IoRefHandle` back to this session (`self.clone()`), so `ioRef` is
    /// incremented at post time but only decremented once a dispatcher worker has actually run
    /// the handler against it — not when the lock-free post itself returns (§4.3, P2). Stops
    /// posting once the dispatcher reports overload (`is_overloaded`) and arms a one-shot
    /// `BackpressureRetry` timer that re-invokes this method once the dispatcher has drained —
    /// `mio` is edge-triggered, so a socket that goes quiet after the break would otherwise never
    /// surface the bytes already sitting in `recv_buffer` again (§4.3 backpressure).
    pub fn on_readable(self: &Arc<Self>, dispatcher: &Arc<Dispatcher>) -> RecvOutcome {
        let read_result = {
            let mut stream = self.stream.lock();
            let mut recv_buffer = self.recv_buffer.lock();
            recv_buffer.ingress(&mut *stream)
        };

        match read_result {
            // `ingress` only returns `Ok(0)` when an inner `read` returned 0, which for a
            // stream socket means the peer closed its write half.
            Ok(0) => return RecvOutcome::Closed,
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return RecvOutcome::WouldBlock,
            Err(err) if err.kind() == io::ErrorKind::Other => {
                // Buffer overrun: the peer is violating the protocol by exceeding the recv
                // window before a full frame could be parsed out.
                logging::warn!(self.log, "protocol violation: recv buffer overrun"; "session_id" => self.id, "error" => %err);
                return RecvOutcome::Closed;
            }
            Err(_) => return RecvOutcome::Closed,
        }

        self.last_recv_millis
            .store(flux::time::timestamp_millis(), Ordering::Relaxed);

        let mut posted_any = false;
        loop {
            if dispatcher.is_overloaded() {
                self.arm_backpressure_retry(dispatcher, BACKPRESSURE_RETRY_MS);
                break;
            }

            let mut recv_buffer = self.recv_buffer.lock();
            if recv_buffer.len() < HEADER_SIZE {
                break;
            }

            let header = {
                let head = recv_buffer.read_slice();
                FrameHeader::parse(&head[..HEADER_SIZE])
            };

            if !header.is_valid() {
                logging::warn!(self.log, "protocol violation: invalid frame header";
                    "session_id" => self.id, "size" => header.size);
                return RecvOutcome::Closed;
            }

            if recv_buffer.len() < header.size as usize {
                break;
            }

            let frame = {
                let head = recv_buffer.read_slice();
                head[..header.size as usize].to_vec()
            };
            recv_buffer.move_head(header.size as usize);
            drop(recv_buffer);

            let mut body = frame[HEADER_SIZE..].to_vec();
            let nonce = self.recv_seq.fetch_add(1, Ordering::SeqCst);
            self.cipher.decrypt(&mut body, nonce);

            match self
                .pool
                .allocate_for_session(MessageTag::NetworkData, self.id, &body)
            {
                Some(packet) => {
                    self.inc_ref();
                    let packet = packet
                        .with_packet_id(header.id)
                        .with_io_ref_handle(self.clone() as Arc<dyn IoRefHandle>);
                    dispatcher.post_data(packet);
                    posted_any = true;
                }
                None => {
                    logging::warn!(self.log, "packet pool exhausted, dropping frame";
                        "session_id" => self.id);
                }
            }
        }

        if posted_any {
            RecvOutcome::Progressed
        } else {
            RecvOutcome::WouldBlock
        }
    }

    fn arm_backpressure_retry(self: &Arc<Self>, dispatcher: &Arc<Dispatcher>, delay_ms: u64) {
        let listener: Arc<dyn TimerListener> = Arc::new(BackpressureRetry {
            session: Arc::downgrade(self),
            dispatcher: Arc::clone(dispatcher),
        });
        dispatcher.set_timer(delay_ms, listener, 0);
    }

    /// Serializes `packet`, encrypts the body, and enqueues it on the send path (§4.3).
    pub fn send_packet(self: &Arc<Self>, packet: &dyn Packet) {
        let mut buf = crate::net::frame::encode(packet);
        let nonce = self.send_seq.fetch_add(1, Ordering::SeqCst);
        self.cipher.encrypt(&mut buf[HEADER_SIZE..], nonce);

        match self.pool.allocate_for_session(MessageTag::NetworkData, self.id, &buf) {
            Some(message) => self.enqueue(message),
            None => {
                logging::warn!(self.log, "packet pool exhausted on send"; "session_id" => self.id);
            }
        }
    }

    /// Broadcast fast path: takes a shared allocation, `add_ref`s it, and enqueues without
    /// re-serializing (§4.3, ties to P9). The payload must already be framed and, if this session
    /// uses encryption, already encrypted under a nonce the receiver can independently derive —
    /// in practice broadcasts are only used for the `none` cipher configuration.
    pub fn send_pre_serialized(self: &Arc<Self>, message: &PacketMessage) {
        self.enqueue(message.add_ref());
    }

    fn enqueue(self: &Arc<Self>, message: PacketMessage) {
        self.send_queue.push(message);
        if self
            .is_sending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.flush();
        }
    }

    /// Bulk-dequeues up to `FLUSH_BATCH` messages, writes them sequentially, and re-enters until
    /// the queue empties, then releases the `isSending` latch with a double-check against a
    /// straggler enqueue (§4.3).
    fn flush(self: &Arc<Self>) {
        loop {
            let mut batch = Vec::with_capacity(FLUSH_BATCH);
            for _ in 0..FLUSH_BATCH {
                match self.send_queue.pop() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }

            if batch.is_empty() {
                self.is_sending.store(false, Ordering::SeqCst);
                if self.send_queue.is_empty() {
                    return;
                }
                if self
                    .is_sending
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    // Another flush already re-acquired the latch; it will drain the straggler.
                    return;
                }
                continue;
            }

            let mut stream = self.stream.lock();
            for message in &batch {
                if let Err(err) = stream.write_all(message.payload()) {
                    logging::warn!(self.log, "transient io error on send";
                        "session_id" => self.id, "error" => %err);
                    drop(stream);
                    self.mark_disconnected();
                    self.is_sending.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Called by the acceptor when the socket reports an error or EOF, and from the heartbeat
    /// timer on timeout.
    pub fn disconnect(self: &Arc<Self>, dispatcher: &Dispatcher) {
        if self.connected.swap(false, Ordering::SeqCst) {
            dispatcher.post_disconnect(self.clone() as Arc<dyn Quiescent>);
        }
    }

    /// Registers the 1s heartbeat interval through the dispatcher (timers are dispatcher-thread
    /// owned, §4.6) rather than holding a private `TimerService`.
    pub fn register_heartbeat(self: &Arc<Self>, dispatcher: &Dispatcher) {
        let weak: std::sync::Weak<dyn TimerListener> = Arc::downgrade(self) as _;
        dispatcher.set_interval(1000, weak, self.id);
    }
}

impl TimerListener for Session {
    fn on_timer(&self, _timer_id: u64, _param: u64) {
        let now = flux::time::timestamp_millis();
        let last_recv = self.last_recv_millis.load(Ordering::Relaxed);
        if now.saturating_sub(last_recv) > self.heartbeat.timeout_ms {
            self.mark_disconnected();
            return;
        }

        let last_ping = self.last_ping_millis.load(Ordering::Relaxed);
        if now.saturating_sub(last_ping) >= self.heartbeat.ping_interval_ms {
            self.last_ping_millis.store(now, Ordering::Relaxed);
            // Application-supplied ping bytes are out of scope for the core; a zero-length
            // keepalive frame with id 0 is sent directly so the wire stays active even without an
            // application-level ping packet.
            let mut buf = vec![0u8; HEADER_SIZE];
            FrameHeader {
                size: HEADER_SIZE as u16,
                id: 0,
            }
            .write(&mut buf);
            if let Some(message) =
                self.pool.allocate_for_session(MessageTag::NetworkData, self.id, &buf)
            {
                self.send_queue.push(message);
                if self
                    .is_sending
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    // `flush` needs `Arc<Self>`, but `TimerListener::on_timer` only hands us
                    // `&self`; keepalive writes are best-effort, so write the frame inline rather
                    // than threading an `Arc` through the timer contract.
                    let mut stream = self.stream.lock();
                    if let Some(message) = self.send_queue.pop() {
                        let _ = stream.write_all(message.payload());
                    }
                    drop(stream);
                    self.is_sending.store(false, Ordering::SeqCst);
                }
            }
        }
    }
}

impl IoRefHandle for Session {
    fn dec_io_ref(&self) {
        self.dec_ref();
    }
}

impl Quiescent for Session {
    fn session_id(&self) -> SessionId {
        self.id
    }

    fn is_quiescent(&self) -> bool {
        !self.connected.load(Ordering::SeqCst) && self.io_ref.load(Ordering::SeqCst) == 0
    }

    fn on_reclaim(&self) {
        let _ = self.stream.lock().shutdown(std::net::Shutdown::Both);
        while self.send_queue.pop().is_some() {}

        if let Some(slot) = self.slot.lock().take() {
            self.session_pool.release(slot);
        }
    }
}

/// One-shot timer that re-invokes [`Session::on_readable`] once the dispatcher has recovered from
/// overload; re-arms itself at [`BACKPRESSURE_RETRY_BACKOFF_MS`] if it fires while the dispatcher
/// is still overloaded (§4.3 backpressure). A dead `Weak<Session>` (the session was torn down
/// while the timer was pending) is a silent no-op.
struct BackpressureRetry {
    session: std::sync::Weak<Session>,
    dispatcher: Arc<Dispatcher>,
}

impl TimerListener for BackpressureRetry {
    fn on_timer(&self, _timer_id: u64, _param: u64) {
        let session = match self.session.upgrade() {
            Some(session) => session,
            None => return,
        };
        if !session.is_connected() {
            return;
        }
        if self.dispatcher.is_overloaded() {
            session.arm_backpressure_retry(&self.dispatcher, BACKPRESSURE_RETRY_BACKOFF_MS);
            return;
        }
        match session.on_readable(&self.dispatcher) {
            RecvOutcome::Closed => session.disconnect(&self.dispatcher),
            RecvOutcome::Progressed | RecvOutcome::WouldBlock => {}
        }
    }
}
