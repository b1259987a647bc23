//! # Large Temp Table Blocks
//!
//! A [`Block`] is a wrapper around an 8 MiB buffer used to store tuples
//! that may not fit in executor memory.
//!
//! ## Buffer Layout
//!
//! The lower-addressed memory stores tuples of fixed stored length, the
//! higher-addressed memory stores the non-inlined, variable-length objects
//! the tuples reference. Both regions grow towards the middle:
//!
//! ```text
//! +-----------------------------+------------+--------------------------+
//! | tuples (L+1 bytes each)  -> |    free    | <-  non-inlined objects  |
//! +-----------------------------+------------+--------------------------+
//! 0                tuple_insertion_offset    non_inlined_insertion_offset
//!                                                            BLOCK_SIZE
//! ```
//!
//! The block is full when the gap in the middle cannot hold the next
//! tuple plus its non-inlined data. This layout is chosen so the whole
//! block can be written to disk as one self-contained unit and reloaded
//! later: the buffer may come back at a different address, so string refs
//! inside the tuples are repaired by a single pointer-arithmetic pass
//! ([`Block::set_data`]).
//!
//! ## Pin Protocol
//!
//! A pinned block may not be evicted; inserts and iteration happen while
//! pinned. `pin`/`unpin` must be matched. The protocol is an advisory
//! single-owner discipline enforced by assertions, not a lock.
//!
//! ## Residency
//!
//! `release_data` hands the storage out for persistence and marks the
//! block stored; `set_data` installs a reloaded buffer and relocates every
//! string ref by the base-address delta. While evicted, only metadata
//! accessors are meaningful.

pub mod iter;

use std::sync::Arc;

use crate::config::{BLOCK_SIZE, TUPLE_HEADER_SIZE};
use crate::records::schema::TupleSchema;
use crate::records::tuple::{object_total_size, read_ref, write_ref, TupleRef};

pub use iter::{BlockIter, BlockIterMut, Tuples};

/// Unique block identifier, assigned monotonically by the block cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Block {
    id: BlockId,
    schema: Arc<TupleSchema>,
    storage: Option<Box<[u8]>>,
    tuple_insertion_offset: usize,
    non_inlined_insertion_offset: usize,
    active_tuple_count: usize,
    pinned: bool,
    stored: bool,
}

impl Block {
    pub fn new(id: BlockId, schema: Arc<TupleSchema>) -> Self {
        Self {
            id,
            schema,
            storage: Some(vec![0u8; BLOCK_SIZE].into_boxed_slice()),
            tuple_insertion_offset: 0,
            non_inlined_insertion_offset: BLOCK_SIZE,
            active_tuple_count: 0,
            pinned: false,
            stored: false,
        }
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn schema(&self) -> &TupleSchema {
        &self.schema
    }

    pub fn schema_handle(&self) -> &Arc<TupleSchema> {
        &self.schema
    }

    pub fn active_tuple_count(&self) -> usize {
        self.active_tuple_count
    }

    /// Ordinal position of the next free tuple slot.
    pub fn unused_tuple_boundary(&self) -> usize {
        self.active_tuple_count
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Mark this block pinned and un-evictable.
    pub fn pin(&mut self) {
        assert!(!self.pinned, "block {} is already pinned", self.id);
        self.pinned = true;
    }

    /// Mark this block unpinned and evictable.
    pub fn unpin(&mut self) {
        assert!(self.pinned, "block {} is not pinned", self.id);
        self.pinned = false;
    }

    /// True if the block's storage is currently in memory.
    pub fn is_resident(&self) -> bool {
        self.storage.is_some()
    }

    /// True if the block has been handed to the cache for persistence at
    /// least once (it may or may not also be resident).
    pub fn is_stored(&self) -> bool {
        self.stored
    }

    fn storage(&self) -> &[u8] {
        self.storage.as_deref().expect("block is not resident")
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        self.storage.as_deref_mut().expect("block is not resident")
    }

    /// Base address of the block's storage. Exposed for the relocation
    /// path (`insert_relocating` needs the source block's base); not part
    /// of the general read API.
    pub fn address(&self) -> *const u8 {
        self.storage().as_ptr()
    }

    pub(crate) fn tuple_insertion_offset(&self) -> usize {
        self.tuple_insertion_offset
    }

    pub(crate) fn non_inlined_insertion_offset(&self) -> usize {
        self.non_inlined_insertion_offset
    }

    /// Free bytes in the gap between the two regions.
    pub fn free_space(&self) -> usize {
        self.non_inlined_insertion_offset - self.tuple_insertion_offset
    }

    /// Memory held by this block: `BLOCK_SIZE` while resident, zero when
    /// evicted. May exceed tuple + pool memory because of the unused gap.
    pub fn allocated_memory(&self) -> usize {
        if self.is_resident() {
            BLOCK_SIZE
        } else {
            0
        }
    }

    /// Bytes used to store tuples.
    pub fn allocated_tuple_memory(&self) -> usize {
        self.tuple_insertion_offset
    }

    /// Bytes used to store non-inlined objects.
    pub fn allocated_pool_memory(&self) -> usize {
        BLOCK_SIZE - self.non_inlined_insertion_offset
    }

    /// Insert a tuple, copying its inline body and every non-inlined
    /// object it references into this block. Returns false (leaving the
    /// block unchanged) when the free gap cannot hold the tuple plus its
    /// non-inlined data.
    pub fn insert(&mut self, src: TupleRef<'_>) -> bool {
        let tuple_len = self.schema.tuple_length();
        debug_assert_eq!(tuple_len, src.schema().tuple_length(), "schema mismatch");

        if self.free_space() < tuple_len + src.non_inlined_size() {
            return false;
        }

        let dst_off = self.tuple_insertion_offset;
        self.storage_mut()[dst_off..dst_off + tuple_len].copy_from_slice(src.as_bytes());

        // Move each referenced object into this block and point the copied
        // tuple's refs at the new locations.
        let schema = Arc::clone(&self.schema);
        for &slot in schema.var_ref_offsets() {
            let ref_pos = dst_off + TUPLE_HEADER_SIZE + slot;
            // SAFETY: ref_pos is inside the tuple image just written.
            let r = unsafe { read_ref(self.storage().as_ptr().add(ref_pos)) };
            if r == 0 {
                continue;
            }
            // SAFETY: non-zero source refs point at live length-prefixed objects.
            let total = unsafe { object_total_size(r) };
            let dst = self.allocate(total);
            // SAFETY: the allocation came from this block's free gap, which
            // cannot overlap a live object, and both pointers are valid for
            // `total` bytes.
            unsafe {
                std::ptr::copy_nonoverlapping(r as *const u8, dst, total);
                write_ref(self.storage_mut().as_mut_ptr().add(ref_pos), dst as u64);
            }
        }

        self.tuple_insertion_offset += tuple_len;
        self.active_tuple_count += 1;
        self.audit_tuple_refs(dst_off);
        true
    }

    /// Insert a tuple whose non-inlined data is already present in this
    /// block at the same offsets it had in a buffer based at `orig_base`
    /// (see [`Block::copy_non_inlined`]). Only the inline body is copied;
    /// each string ref is rewritten by the base-address delta. Returns
    /// false when the inline region is full.
    pub fn insert_relocating(&mut self, src: TupleRef<'_>, orig_base: *const u8) -> bool {
        let tuple_len = self.schema.tuple_length();
        debug_assert_eq!(tuple_len, src.schema().tuple_length(), "schema mismatch");

        if self.free_space() < tuple_len {
            return false;
        }

        let dst_off = self.tuple_insertion_offset;
        let new_base = self.storage().as_ptr() as u64;
        self.storage_mut()[dst_off..dst_off + tuple_len].copy_from_slice(src.as_bytes());

        let schema = Arc::clone(&self.schema);
        for &slot in schema.var_ref_offsets() {
            // SAFETY: slot offsets come from the schema and lie inside the
            // tuple image just written.
            unsafe {
                let p = self.storage_mut().as_mut_ptr().add(dst_off + TUPLE_HEADER_SIZE + slot);
                let r = read_ref(p);
                if r != 0 {
                    write_ref(p, r.wrapping_sub(orig_base as u64).wrapping_add(new_base));
                }
            }
        }

        self.tuple_insertion_offset += tuple_len;
        self.active_tuple_count += 1;
        self.audit_tuple_refs(dst_off);
        true
    }

    /// Carve `size` bytes out of the non-inlined region and return their
    /// address. The caller (`insert`) has already verified the gap; the
    /// result is undefined when it has not.
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        debug_assert!(self.free_space() >= size, "non-inlined allocation overruns the gap");
        self.non_inlined_insertion_offset -= size;
        let off = self.non_inlined_insertion_offset;
        // SAFETY: off is in-bounds of the resident storage.
        unsafe { self.storage_mut().as_mut_ptr().add(off) }
    }

    /// Copy another block's non-inlined region verbatim into the
    /// corresponding high bytes of this block. This block's non-inlined
    /// region must be empty.
    pub fn copy_non_inlined(&mut self, src: &Block) {
        assert_eq!(
            self.non_inlined_insertion_offset, BLOCK_SIZE,
            "target non-inlined region must be empty"
        );
        let src_off = src.non_inlined_insertion_offset;
        self.storage_mut()[src_off..].copy_from_slice(&src.storage()[src_off..]);
        self.non_inlined_insertion_offset = src_off;
    }

    /// Release the storage so it can be persisted. Marks the block stored.
    /// The block must be unpinned.
    pub fn release_data(&mut self) -> Box<[u8]> {
        assert!(!self.pinned, "cannot release the storage of a pinned block");
        self.stored = true;
        self.storage.take().expect("block is not resident")
    }

    /// Install reloaded storage. `orig_base` is the address the buffer had
    /// when it was released; every non-null string ref in every tuple is
    /// shifted by the delta to the new address.
    pub fn set_data(&mut self, orig_base: usize, storage: Box<[u8]>) {
        assert_eq!(storage.len(), BLOCK_SIZE, "block payload must be BLOCK_SIZE bytes");
        assert!(self.storage.is_none(), "block is already resident");

        let new_base = storage.as_ptr() as usize;
        self.storage = Some(storage);
        if new_base == orig_base {
            return;
        }

        let schema = Arc::clone(&self.schema);
        let tuple_len = schema.tuple_length();
        let count = self.active_tuple_count;
        let data = self.storage_mut();
        for t in 0..count {
            let body = t * tuple_len + TUPLE_HEADER_SIZE;
            for &slot in schema.var_ref_offsets() {
                // SAFETY: body + slot addresses a ref slot inside tuple t.
                unsafe {
                    let p = data.as_mut_ptr().add(body + slot);
                    let r = read_ref(p);
                    if r != 0 {
                        write_ref(
                            p,
                            r.wrapping_add(new_base as u64).wrapping_sub(orig_base as u64),
                        );
                    }
                }
            }
        }

        for t in 0..count {
            self.audit_tuple_refs(t * tuple_len);
        }
    }

    /// Debug-only audit: every non-null ref in the tuple at `tuple_off`
    /// must point into this block's own non-inlined region. Cross-block
    /// references are forbidden.
    fn audit_tuple_refs(&self, tuple_off: usize) {
        if cfg!(debug_assertions) {
            let base = self.storage().as_ptr() as u64;
            let lo = base + self.non_inlined_insertion_offset as u64;
            let hi = base + BLOCK_SIZE as u64;
            for &slot in self.schema.var_ref_offsets() {
                // SAFETY: tuple_off is a valid tuple start; slot is in-body.
                let r = unsafe {
                    read_ref(self.storage().as_ptr().add(tuple_off + TUPLE_HEADER_SIZE + slot))
                };
                debug_assert!(
                    r == 0 || (lo..hi).contains(&r),
                    "string ref {r:#x} escapes block {} non-inlined region [{lo:#x}, {hi:#x})",
                    self.id
                );
            }
        }
    }

    /// Cursor at the first tuple.
    pub fn begin(&self) -> BlockIter<'_> {
        BlockIter::new(self.schema.tuple_length(), self.storage().as_ptr())
    }

    /// Cursor one past the last tuple.
    pub fn end(&self) -> BlockIter<'_> {
        // SAFETY: tuple_insertion_offset <= BLOCK_SIZE.
        let addr = unsafe { self.storage().as_ptr().add(self.tuple_insertion_offset) };
        BlockIter::new(self.schema.tuple_length(), addr)
    }

    /// Mutable cursor at the first tuple. The end cursor is
    /// `begin_mut() + active_tuple_count`.
    pub fn begin_mut(&mut self) -> BlockIterMut<'_> {
        let tuple_len = self.schema.tuple_length();
        BlockIterMut::new(tuple_len, self.storage_mut().as_mut_ptr())
    }

    /// Forward iterator over the stored tuples, in insertion order (or
    /// sorted order after an in-place sort).
    pub fn tuples(&self) -> Tuples<'_> {
        Tuples::new(self.begin(), self.end(), &self.schema)
    }

    /// View of the tuple at ordinal `idx`.
    pub fn tuple_at(&self, idx: usize) -> TupleRef<'_> {
        debug_assert!(idx < self.active_tuple_count, "tuple index out of range");
        let addr = unsafe {
            // SAFETY: idx is within the tuple region.
            self.storage().as_ptr().add(idx * self.schema.tuple_length())
        };
        // SAFETY: addr points at a stored tuple of this block's schema.
        unsafe { TupleRef::from_raw(addr, &self.schema) }
    }

    /// Drop all data from the block, keeping its storage. Benchmark and
    /// test support.
    pub fn clear(&mut self) {
        self.tuple_insertion_offset = 0;
        self.non_inlined_insertion_offset = BLOCK_SIZE;
        self.active_tuple_count = 0;
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("id", &self.id)
            .field("active_tuple_count", &self.active_tuple_count)
            .field("tuple_insertion_offset", &self.tuple_insertion_offset)
            .field(
                "non_inlined_insertion_offset",
                &self.non_inlined_insertion_offset,
            )
            .field("pinned", &self.pinned)
            .field("stored", &self.stored)
            .field("resident", &self.is_resident())
            .finish()
    }
}
