//! Memory and transfer backend.
//!
//! The runtime never touches device memory directly: it allocates, frees
//! and copies through a [`MemoryBackend`]. [`HostMemory`] is the in-process
//! implementation where every memory node is plain host RAM; it can hold
//! transfers in flight and inject failures.

use crate::error::{DataError, DataResult};
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_core::MemoryNode;

/// A node-local buffer, possibly a view into a larger allocation
///
/// Partition children share their parent's allocation through views.
#[derive(Clone)]
pub struct NodeBuffer {
    node: MemoryNode,
    storage: Arc<Mutex<Vec<u8>>>,
    offset: usize,
    len: usize,
}

impl NodeBuffer {
    /// Wrap existing contents as a buffer living on `node`
    #[must_use]
    pub fn wrap(node: MemoryNode, data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            node,
            storage: Arc::new(Mutex::new(data)),
            offset: 0,
            len,
        }
    }

    /// Zero-filled buffer on `node`
    #[must_use]
    pub fn zeroed(node: MemoryNode, len: usize) -> Self {
        Self::wrap(node, vec![0; len])
    }

    /// Node the buffer lives on
    #[must_use]
    pub const fn node(&self) -> MemoryNode {
        self.node
    }

    /// Length of the view in bytes
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of the view inside its allocation
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// A sub-view sharing this buffer's allocation
    #[must_use]
    pub fn view(&self, offset: usize, len: usize) -> Self {
        assert!(offset + len <= self.len, "view out of bounds");
        Self {
            node: self.node,
            storage: Arc::clone(&self.storage),
            offset: self.offset + offset,
            len,
        }
    }

    /// Whether both buffers share one allocation
    #[must_use]
    pub fn shares_storage(&self, other: &NodeBuffer) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Run `f` over the contents
    pub fn with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.storage.lock();
        f(&data[self.offset..self.offset + self.len])
    }

    /// Run `f` over the contents mutably
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.storage.lock();
        f(&mut data[self.offset..self.offset + self.len])
    }

    /// Copy the contents out
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.with(<[u8]>::to_vec)
    }

    /// Overwrite the contents with another buffer's
    ///
    /// Goes through a temporary so overlapping views of one allocation
    /// never lock the same mutex twice.
    pub fn copy_from(&self, src: &NodeBuffer) {
        let bytes = src.to_vec();
        let n = bytes.len().min(self.len);
        self.with_mut(|dst| dst[..n].copy_from_slice(&bytes[..n]));
    }
}

impl std::fmt::Debug for NodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuffer")
            .field("node", &self.node)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Completion token returned by an asynchronous copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferToken(u64);

impl TransferToken {
    /// Create from raw value
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Raw value
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// Status of an asynchronous copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    /// Still moving
    Pending,
    /// Landed; reported exactly once per token
    Done,
    /// Failed; reported exactly once per token
    Failed(String),
}

/// Node-local allocation and node-to-node copies
pub trait MemoryBackend: Send + Sync {
    /// Number of memory nodes
    fn nnodes(&self) -> usize;

    /// Allocate `size` bytes on `node`
    ///
    /// # Errors
    ///
    /// Returns error if the node is unknown or out of memory
    fn allocate(&self, node: MemoryNode, size: usize) -> DataResult<NodeBuffer>;

    /// Return an allocation to its node
    fn free(&self, buffer: NodeBuffer);

    /// Start copying `src` into `dst`
    ///
    /// # Errors
    ///
    /// Returns error if the copy cannot even be started
    fn copy_async(&self, src: &NodeBuffer, dst: &NodeBuffer) -> DataResult<TransferToken>;

    /// Poll a copy started by [`MemoryBackend::copy_async`]
    fn test(&self, token: TransferToken) -> TransferStatus;
}

struct PendingCopy {
    src: NodeBuffer,
    dst: NodeBuffer,
    fail: bool,
}

/// Host-RAM backend: every memory node is a region of process memory
///
/// Copies happen when they are polled. While transfers are held, polling
/// reports them pending, which keeps requests in flight for as long as a
/// test needs.
pub struct HostMemory {
    nnodes: usize,
    capacity: Option<usize>,
    used: Vec<AtomicUsize>,
    copies: Mutex<IndexMap<u64, PendingCopy>>,
    next_token: AtomicU64,
    hold: AtomicBool,
    fail_next: AtomicU32,
    copies_started: AtomicU64,
}

impl HostMemory {
    /// Create a backend with `nnodes` unbounded memory nodes
    #[must_use]
    pub fn new(nnodes: usize) -> Self {
        Self {
            nnodes: nnodes.max(1),
            capacity: None,
            used: (0..nnodes.max(1)).map(|_| AtomicUsize::new(0)).collect(),
            copies: Mutex::new(IndexMap::new()),
            next_token: AtomicU64::new(0),
            hold: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            copies_started: AtomicU64::new(0),
        }
    }

    /// Limit every node to `bytes` of automatic allocations
    #[must_use]
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Keep every transfer pending until [`HostMemory::release_transfers`]
    pub fn hold_transfers(&self) {
        self.hold.store(true, Ordering::Release);
    }

    /// Let held transfers land on their next poll
    pub fn release_transfers(&self) {
        self.hold.store(false, Ordering::Release);
    }

    /// Make the next `n` copies fail
    pub fn fail_next_copies(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// Number of copies started so far
    #[must_use]
    pub fn copies_started(&self) -> u64 {
        self.copies_started.load(Ordering::Acquire)
    }

    /// Number of copies not yet reported
    #[must_use]
    pub fn copies_in_flight(&self) -> usize {
        self.copies.lock().len()
    }

    /// Bytes currently allocated on `node`
    #[must_use]
    pub fn used(&self, node: MemoryNode) -> usize {
        self.used
            .get(node.index())
            .map_or(0, |u| u.load(Ordering::Acquire))
    }
}

impl MemoryBackend for HostMemory {
    fn nnodes(&self) -> usize {
        self.nnodes
    }

    fn allocate(&self, node: MemoryNode, size: usize) -> DataResult<NodeBuffer> {
        let used = self.used.get(node.index()).ok_or(DataError::UnknownNode(node))?;
        if let Some(capacity) = self.capacity {
            if used.load(Ordering::Acquire) + size > capacity {
                return Err(DataError::OutOfMemory {
                    node,
                    requested: size,
                });
            }
        }
        used.fetch_add(size, Ordering::AcqRel);
        Ok(NodeBuffer::zeroed(node, size))
    }

    fn free(&self, buffer: NodeBuffer) {
        if let Some(used) = self.used.get(buffer.node().index()) {
            let _ = used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |u| {
                Some(u.saturating_sub(buffer.len()))
            });
        }
    }

    fn copy_async(&self, src: &NodeBuffer, dst: &NodeBuffer) -> DataResult<TransferToken> {
        let fail = self
            .fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let token = self.next_token.fetch_add(1, Ordering::AcqRel);
        self.copies_started.fetch_add(1, Ordering::AcqRel);
        self.copies.lock().insert(
            token,
            PendingCopy {
                src: src.clone(),
                dst: dst.clone(),
                fail,
            },
        );
        Ok(TransferToken(token))
    }

    fn test(&self, token: TransferToken) -> TransferStatus {
        if self.hold.load(Ordering::Acquire) {
            return if self.copies.lock().contains_key(&token.0) {
                TransferStatus::Pending
            } else {
                TransferStatus::Done
            };
        }

        let Some(copy) = self.copies.lock().shift_remove(&token.0) else {
            return TransferStatus::Done;
        };
        if copy.fail {
            return TransferStatus::Failed(format!(
                "injected failure copying {} -> {}",
                copy.src.node(),
                copy.dst.node()
            ));
        }
        copy.dst.copy_from(&copy.src);
        TransferStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: usize) -> MemoryNode {
        MemoryNode::from_index(i)
    }

    #[test]
    fn test_buffer_views_share_storage() {
        let parent = NodeBuffer::wrap(node(0), vec![1, 2, 3, 4]);
        let child = parent.view(2, 2);
        assert!(child.shares_storage(&parent));
        assert_eq!(child.to_vec(), vec![3, 4]);

        child.with_mut(|b| b[0] = 9);
        assert_eq!(parent.to_vec(), vec![1, 2, 9, 4]);
    }

    #[test]
    fn test_copy_between_overlapping_views() {
        let parent = NodeBuffer::wrap(node(0), vec![1, 2, 3, 4]);
        parent.view(2, 2).copy_from(&parent.view(0, 2));
        assert_eq!(parent.to_vec(), vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_allocate_and_free_accounting() {
        let mem = HostMemory::new(2);
        let buf = mem.allocate(node(1), 64).unwrap();
        assert_eq!(mem.used(node(1)), 64);
        mem.free(buf);
        assert_eq!(mem.used(node(1)), 0);
        assert!(matches!(
            mem.allocate(node(5), 1),
            Err(DataError::UnknownNode(_))
        ));
    }

    #[test]
    fn test_capacity_limit() {
        let mem = HostMemory::new(1).with_capacity(10);
        assert!(mem.allocate(node(0), 8).is_ok());
        assert!(matches!(
            mem.allocate(node(0), 8),
            Err(DataError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn test_copy_lands_on_poll() {
        let mem = HostMemory::new(2);
        let src = NodeBuffer::wrap(node(0), vec![7; 4]);
        let dst = mem.allocate(node(1), 4).unwrap();

        let token = mem.copy_async(&src, &dst).unwrap();
        assert_eq!(dst.to_vec(), vec![0; 4]);
        assert_eq!(mem.test(token), TransferStatus::Done);
        assert_eq!(dst.to_vec(), vec![7; 4]);
        assert_eq!(mem.copies_started(), 1);
    }

    #[test]
    fn test_hold_keeps_copy_pending() {
        let mem = HostMemory::new(2);
        let src = NodeBuffer::wrap(node(0), vec![7; 4]);
        let dst = mem.allocate(node(1), 4).unwrap();

        mem.hold_transfers();
        let token = mem.copy_async(&src, &dst).unwrap();
        assert_eq!(mem.test(token), TransferStatus::Pending);
        assert_eq!(mem.copies_in_flight(), 1);

        mem.release_transfers();
        assert_eq!(mem.test(token), TransferStatus::Done);
        assert_eq!(dst.to_vec(), vec![7; 4]);
        assert_eq!(mem.copies_in_flight(), 0);
    }

    #[test]
    fn test_injected_failure() {
        let mem = HostMemory::new(2);
        let src = NodeBuffer::wrap(node(0), vec![7; 4]);
        let dst = mem.allocate(node(1), 4).unwrap();

        mem.fail_next_copies(1);
        let first = mem.copy_async(&src, &dst).unwrap();
        let second = mem.copy_async(&src, &dst).unwrap();
        assert!(matches!(mem.test(first), TransferStatus::Failed(_)));
        assert_eq!(mem.test(second), TransferStatus::Done);
    }
}
