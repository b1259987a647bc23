//! # Block Cache
//!
//! The executor-scoped directory of every live temp table block. The cache
//! assigns block ids, bounds how many blocks stay resident, and moves
//! block payloads to and from the spill topend.
//!
//! ## Pin/Unpin Protocol
//!
//! Blocks must be pinned before access to prevent eviction:
//!
//! 1. `new_block` / `fetch` return the block pinned and resident
//! 2. The caller inserts into or iterates over the block
//! 3. `unpin` makes the block eviction-eligible again
//!
//! Pinning is an advisory single-owner discipline: a block is pinned by
//! exactly one user at a time and double-pin asserts. This is not a lock;
//! the whole engine is single-threaded cooperative.
//!
//! ## Eviction
//!
//! Eviction is least-recently-unpinned: `unpin` appends the block to a
//! recency queue, and when the resident budget is exceeded the front-most
//! unpinned resident block is evicted. Evicting releases the block's
//! storage (`Block::release_data`) and hands the payload plus its metadata
//! header to the topend. A later `fetch` reloads the payload (possibly at
//! a different address) and `Block::set_data` repairs the string refs by
//! the base delta.
//!
//! When every resident block is pinned and the budget is exhausted,
//! `new_block` and `fetch` fail; the caller (typically the sort driver)
//! surfaces this as an unrecoverable allocation failure.
//!
//! ## Sharing Model
//!
//! Blocks are handed out as `Rc<RefCell<Block>>`. The cache is passed by
//! `&mut` into every operation that may fault a block in; nothing here is
//! process-global and nothing locks.

pub mod topend;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use tracing::{debug, trace};

use crate::block::{Block, BlockId};
use crate::records::schema::TupleSchema;

pub use topend::{payload_checksum, BlockImageHeader, FileTopend, Topend};

/// Shared handle to a cached block.
pub type BlockRef = Rc<RefCell<Block>>;

pub struct BlockCache {
    blocks: HashMap<BlockId, BlockRef>,
    /// Least-recently-unpinned block ids, front first. Pinned blocks are
    /// never in this queue.
    lru: VecDeque<BlockId>,
    next_id: u64,
    capacity: usize,
    resident: usize,
    topend: Box<dyn Topend>,
}

impl BlockCache {
    /// A cache that keeps at most `capacity` blocks resident.
    pub fn new(capacity: usize, topend: Box<dyn Topend>) -> Self {
        assert!(capacity > 0, "block cache capacity must be positive");
        Self {
            blocks: HashMap::new(),
            lru: VecDeque::new(),
            next_id: 0,
            capacity,
            resident: 0,
            topend,
        }
    }

    /// Total blocks tracked, resident or not.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn resident_count(&self) -> usize {
        self.resident
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create a new empty block with the next id. Returned pinned and
    /// resident; fails when the budget is full of pinned blocks.
    pub fn new_block(&mut self, schema: Arc<TupleSchema>) -> Result<BlockRef> {
        self.make_room()?;

        let id = BlockId(self.next_id);
        self.next_id += 1;

        let mut block = Block::new(id, schema);
        block.pin();
        let handle: BlockRef = Rc::new(RefCell::new(block));
        self.blocks.insert(id, Rc::clone(&handle));
        self.resident += 1;

        trace!(block_id = id.0, resident = self.resident, "new block");
        Ok(handle)
    }

    /// Fetch a block by id, reloading it from the topend when evicted.
    /// Always returned pinned and resident.
    pub fn fetch(&mut self, id: BlockId) -> Result<BlockRef> {
        let handle = match self.blocks.get(&id) {
            Some(h) => Rc::clone(h),
            None => bail!("unknown block {id}"),
        };

        if !handle.borrow().is_resident() {
            self.make_room()?;
            let (header, payload) = self
                .topend
                .load_block(id)
                .wrap_err_with(|| format!("failed to reload block {id}"))?;

            let mut block = handle.borrow_mut();
            ensure!(
                header.schema_fingerprint == block.schema().fingerprint(),
                "block {id} was stored under a different schema"
            );
            ensure!(
                header.active_tuple_count as usize == block.active_tuple_count(),
                "block {id} image holds {} tuples, cache expects {}",
                header.active_tuple_count,
                block.active_tuple_count()
            );
            block.set_data(header.orig_base as usize, payload);
            drop(block);

            self.resident += 1;
            debug!(block_id = id.0, resident = self.resident, "block reloaded");
        }

        handle.borrow_mut().pin();
        self.lru.retain(|&x| x != id);
        Ok(handle)
    }

    /// Make a block eviction-eligible again. Must match a prior pin.
    pub fn unpin(&mut self, id: BlockId) {
        let handle = self.blocks.get(&id).expect("unknown block");
        handle.borrow_mut().unpin();
        debug_assert!(!self.lru.contains(&id));
        self.lru.push_back(id);
    }

    /// Destroy a block: drop it from the directory and delete any
    /// persisted copy.
    pub fn release(&mut self, id: BlockId) -> Result<()> {
        let handle = match self.blocks.remove(&id) {
            Some(h) => h,
            None => bail!("unknown block {id}"),
        };

        let block = handle.borrow();
        debug_assert!(!block.is_pinned(), "released block {id} is still pinned");
        if block.is_resident() {
            self.resident -= 1;
        }
        let stored = block.is_stored();
        drop(block);

        self.lru.retain(|&x| x != id);
        if stored {
            self.topend.remove_block(id)?;
        }
        trace!(block_id = id.0, "block released");
        Ok(())
    }

    fn make_room(&mut self) -> Result<()> {
        while self.resident >= self.capacity {
            self.evict_one()?;
        }
        Ok(())
    }

    fn evict_one(&mut self) -> Result<()> {
        let victim_idx = self.lru.iter().position(|id| {
            let block = self.blocks[id].borrow();
            !block.is_pinned() && block.is_resident()
        });
        let victim = victim_idx.and_then(|idx| self.lru.remove(idx));

        let Some(id) = victim else {
            bail!(
                "block cache exhausted: {} of {} resident blocks, all pinned",
                self.resident,
                self.capacity
            );
        };

        let handle = Rc::clone(&self.blocks[&id]);
        let mut block = handle.borrow_mut();
        let fingerprint = block.schema().fingerprint();
        let (count, tuple_off, non_inlined_off) = (
            block.active_tuple_count(),
            block.tuple_insertion_offset(),
            block.non_inlined_insertion_offset(),
        );

        let payload = block.release_data();
        let orig_base = payload.as_ptr() as usize;
        let header = BlockImageHeader::new(
            id,
            fingerprint,
            count,
            tuple_off,
            non_inlined_off,
            orig_base,
            payload_checksum(&payload),
        );

        if let Err(e) = self.topend.store_block(&header, &payload) {
            // Keep the block usable: re-adopt the payload at its old address.
            block.set_data(orig_base, payload);
            return Err(e).wrap_err_with(|| format!("failed to evict block {id}"));
        }

        self.resident -= 1;
        debug!(block_id = id.0, resident = self.resident, "block evicted");
        Ok(())
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("blocks", &self.blocks.len())
            .field("resident", &self.resident)
            .field("capacity", &self.capacity)
            .finish()
    }
}
