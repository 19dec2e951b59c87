//! Fixed-block packet memory pool with per-thread LIFO caches, grounded on the thread-cache /
//! bulk-transfer design outlined for the dispatcher's message pool. The manual `AddRef`/`DecRef`
//! contract is realized as `Arc<PacketMessageInner>`: cloning the handle is `AddRef`, dropping the
//! last clone is `DecRef`, and reaching a zero strong count returns pooled blocks to the pool from
//! `Drop` rather than through an explicit `Free` call the caller must remember to make.
use crossbeam_queue::SegQueue;
use flux::SessionId;
use std::cell::RefCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Discriminates the payload carried by a `PacketMessage`, mirroring the dispatcher's message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTag {
    NetworkConnect,
    NetworkDisconnect,
    NetworkData,
    LogicTimerAdd,
    LogicTimerCancel,
    LogicTimerExpired,
    LogicTimerTick,
    LambdaJob,
}

#[derive(Debug, Clone, Copy)]
pub struct PacketPoolConfig {
    /// Size of one pooled block; requests larger than this fall through to a heap allocation.
    pub block_size: usize,
    /// Depth of the per-thread LIFO cache before it bulk-transfers half its contents to the
    /// global queue.
    pub thread_cache_depth: usize,
    /// Number of blocks moved per bulk transfer between the thread cache and the global queue.
    pub bulk_transfer: usize,
    /// Hard cap on total bytes outstanding across pooled and oversize allocations. `None` means
    /// unbounded (heap fallback always available).
    pub max_outstanding_bytes: Option<usize>,
}

impl Default for PacketPoolConfig {
    fn default() -> Self {
        PacketPoolConfig {
            block_size: 4096,
            thread_cache_depth: 1024,
            bulk_transfer: 512,
            max_outstanding_bytes: None,
        }
    }
}

/// Lets a `NetworkData` message carry back a handle that releases the owning session's I/O
/// refcount once a dispatcher worker has actually finished running the handler against it (§4.3
/// ioRef invariant, P2), rather than at post time. Defined here rather than on `net::Session`
/// directly so the memory pool doesn't need to depend on the net crate.
pub trait IoRefHandle: Send + Sync {
    fn dec_io_ref(&self);
}

struct PacketMessageInner {
    tag: MessageTag,
    session_id: Option<SessionId>,
    packet_id: Option<u16>,
    block: Vec<u8>,
    is_pooled: bool,
    pool: Arc<PacketPool>,
    io_ref_handle: Option<Arc<dyn IoRefHandle>>,
}

impl Drop for PacketMessageInner {
    fn drop(&mut self) {
        let block = std::mem::take(&mut self.block);
        let len = block.len();
        if self.is_pooled {
            self.pool.release_block(block);
        }
        self.pool.outstanding_bytes.fetch_sub(len, Ordering::Relaxed);
    }
}

/// A reference-counted handle to pooled (or oversize heap) packet storage. Cloning is the
/// `AddRef` of the original design; the last clone to be dropped is the matching `Free`.
#[derive(Clone)]
pub struct PacketMessage(Arc<PacketMessageInner>);

impl PacketMessage {
    pub fn tag(&self) -> MessageTag {
        self.0.tag
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.0.session_id
    }

    pub fn packet_id(&self) -> Option<u16> {
        self.0.packet_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.0.block
    }

    pub fn len(&self) -> usize {
        self.0.block.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.block.is_empty()
    }

    pub fn is_pooled(&self) -> bool {
        self.0.is_pooled
    }

    /// Number of outstanding handles to this allocation; 1 means this is the sole owner.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Equivalent to the original `AddRef`: produces another owning handle to the same block.
    pub fn add_ref(&self) -> PacketMessage {
        self.clone()
    }

    fn with_session(mut self, session_id: SessionId) -> Self {
        match Arc::get_mut(&mut self.0) {
            Some(inner) => inner.session_id = Some(session_id),
            None => unreachable!("with_session called on a shared PacketMessage"),
        }
        self
    }

    /// Stamps the wire packet id carried by a `NetworkData` message. Must be called before the
    /// message is shared (broadcast `add_ref`s happen after this).
    pub fn with_packet_id(mut self, packet_id: u16) -> Self {
        match Arc::get_mut(&mut self.0) {
            Some(inner) => inner.packet_id = Some(packet_id),
            None => unreachable!("with_packet_id called on a shared PacketMessage"),
        }
        self
    }

    /// Attaches the `IoRefHandle` the dispatcher should decrement once its `NetworkData` handler
    /// call returns, instead of at post time (§4.3 ioRef invariant, P2).
    pub fn with_io_ref_handle(mut self, handle: Arc<dyn IoRefHandle>) -> Self {
        match Arc::get_mut(&mut self.0) {
            Some(inner) => inner.io_ref_handle = Some(handle),
            None => unreachable!("with_io_ref_handle called on a shared PacketMessage"),
        }
        self
    }

    pub fn io_ref_handle(&self) -> Option<Arc<dyn IoRefHandle>> {
        self.0.io_ref_handle.clone()
    }
}

thread_local! {
    static THREAD_CACHE: RefCell<Vec<Vec<u8>>> = RefCell::new(Vec::new());
}

/// Process-wide packet memory pool. Constructed once at startup and shared via `Arc`, per the
/// "explicitly-initialized process-wide service" policy rather than a hidden global singleton.
pub struct PacketPool {
    config: PacketPoolConfig,
    global: SegQueue<Vec<u8>>,
    outstanding_bytes: AtomicUsize,
    rejected: AtomicUsize,
}

impl PacketPool {
    pub fn new(config: PacketPoolConfig) -> Arc<PacketPool> {
        Arc::new(PacketPool {
            config,
            global: SegQueue::new(),
            outstanding_bytes: AtomicUsize::new(0),
            rejected: AtomicUsize::new(0),
        })
    }

    /// Pre-fills the global queue with `n` freshly allocated blocks so the first wave of
    /// connections does not pay an allocation cost on the hot path.
    pub fn prepare(&self, n: usize) {
        for _ in 0..n {
            self.global.push(vec_with_capacity(self.config.block_size));
        }
    }

    pub fn rejected_count(&self) -> usize {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Relaxed)
    }

    /// Allocates a packet message carrying a copy of `body`. Returns `None` only when a hard
    /// cap is configured and has been reached (`PoolExhaustion`).
    pub fn allocate(self: &Arc<Self>, tag: MessageTag, body: &[u8]) -> Option<PacketMessage> {
        if let Some(max) = self.config.max_outstanding_bytes {
            if self.outstanding_bytes.load(Ordering::Relaxed) + body.len() > max {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        let is_pooled = body.len() <= self.config.block_size;
        let mut block = if is_pooled {
            self.acquire_block()
        } else {
            vec_with_capacity(body.len())
        };
        block.clear();
        block.extend_from_slice(body);

        self.outstanding_bytes.fetch_add(block.len(), Ordering::Relaxed);

        Some(PacketMessage(Arc::new(PacketMessageInner {
            tag,
            session_id: None,
            packet_id: None,
            block,
            is_pooled,
            pool: Arc::clone(self),
            io_ref_handle: None,
        })))
    }

    pub fn allocate_for_session(
        self: &Arc<Self>,
        tag: MessageTag,
        session_id: SessionId,
        body: &[u8],
    ) -> Option<PacketMessage> {
        self.allocate(tag, body).map(|m| m.with_session(session_id))
    }

    fn acquire_block(&self) -> Vec<u8> {
        if let Some(block) = THREAD_CACHE.with(|c| c.borrow_mut().pop()) {
            return block;
        }

        let mut acquired = None;
        for _ in 0..self.config.bulk_transfer {
            match self.global.pop() {
                Some(block) => {
                    if acquired.is_none() {
                        acquired = Some(block);
                    } else {
                        THREAD_CACHE.with(|c| c.borrow_mut().push(block));
                    }
                }
                None => break,
            }
        }

        acquired.unwrap_or_else(|| vec_with_capacity(self.config.block_size))
    }

    fn release_block(&self, block: Vec<u8>) {
        THREAD_CACHE.with(|c| {
            let mut cache = c.borrow_mut();
            cache.push(block);
            if cache.len() > self.config.thread_cache_depth {
                let half = cache.len() / 2;
                for b in cache.drain(..half) {
                    self.global.push(b);
                }
            }
        });
    }
}

fn vec_with_capacity(n: usize) -> Vec<u8> {
    Vec::with_capacity(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_copies_payload_and_preserves_length() {
        let pool = PacketPool::new(PacketPoolConfig::default());
        let msg = pool.allocate(MessageTag::NetworkData, b"hello").unwrap();
        assert_eq!(msg.payload(), b"hello");
        assert_eq!(msg.len(), 5);
        assert!(msg.is_pooled());
    }

    #[test]
    fn oversize_allocation_is_not_pooled() {
        let cfg = PacketPoolConfig {
            block_size: 8,
            ..Default::default()
        };
        let pool = PacketPool::new(cfg);
        let body = vec![1u8; 64];
        let msg = pool.allocate(MessageTag::NetworkData, &body).unwrap();
        assert!(!msg.is_pooled());
        assert_eq!(msg.len(), 64);
    }

    #[test]
    fn add_ref_shares_one_allocation_across_recipients() {
        let pool = PacketPool::new(PacketPoolConfig::default());
        let msg = pool.allocate(MessageTag::NetworkData, b"broadcast").unwrap();
        let recipients: Vec<PacketMessage> = (0..16).map(|_| msg.add_ref()).collect();
        assert_eq!(msg.ref_count(), 17);
        drop(recipients);
        assert_eq!(msg.ref_count(), 1);
    }

    #[test]
    fn repeated_alloc_free_from_one_thread_reuses_a_small_set_of_blocks() {
        let pool = PacketPool::new(PacketPoolConfig::default());
        let mut seen = std::collections::HashSet::new();

        for _ in 0..100_000 {
            let msg = pool.allocate(MessageTag::NetworkData, b"x").unwrap();
            seen.insert(msg.payload().as_ptr() as usize);
        }

        assert!(seen.len() <= PacketPoolConfig::default().thread_cache_depth + 8);
    }

    #[test]
    fn hard_cap_rejects_once_exceeded() {
        let cfg = PacketPoolConfig {
            max_outstanding_bytes: Some(16),
            ..Default::default()
        };
        let pool = PacketPool::new(cfg);
        let a = pool.allocate(MessageTag::NetworkData, &[0u8; 10]).unwrap();
        let b = pool.allocate(MessageTag::NetworkData, &[0u8; 10]);
        assert!(b.is_none());
        assert_eq!(pool.rejected_count(), 1);
        drop(a);
    }
}
