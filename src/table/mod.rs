//! # Large Temp Tables
//!
//! A [`TempTable`] is an ordered list of block ids plus a pinned tail
//! block that inserts stream into. When the tail refuses an insert
//! (capacity refusal), the table unpins it and allocates the next block
//! from the cache; capacity refusal never escapes as an error.
//!
//! Tables do not own a cache; every operation that may touch a block takes
//! the executor's cache by `&mut`. Destruction is explicit
//! ([`TempTable::destroy`]) for the same reason.

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::block::BlockId;
use crate::cache::{BlockCache, BlockRef};
use crate::records::schema::TupleSchema;
use crate::records::tuple::TupleRef;

#[derive(Debug)]
pub struct TempTable {
    schema: Arc<TupleSchema>,
    block_ids: Vec<BlockId>,
    tail: Option<BlockRef>,
    tuple_count: usize,
}

impl TempTable {
    pub fn new(schema: Arc<TupleSchema>) -> Self {
        Self {
            schema,
            block_ids: Vec::new(),
            tail: None,
            tuple_count: 0,
        }
    }

    pub fn schema(&self) -> &TupleSchema {
        &self.schema
    }

    pub fn schema_handle(&self) -> &Arc<TupleSchema> {
        &self.schema
    }

    pub fn active_tuple_count(&self) -> usize {
        self.tuple_count
    }

    pub fn allocated_block_count(&self) -> usize {
        self.block_ids.len()
    }

    pub fn block_ids(&self) -> &[BlockId] {
        &self.block_ids
    }

    /// Append a tuple, rolling over to a fresh block when the tail is
    /// full. Fails only when the cache cannot allocate, or when a single
    /// tuple exceeds an empty block.
    pub fn insert(&mut self, cache: &mut BlockCache, tuple: TupleRef<'_>) -> Result<()> {
        if self.tail.is_none() {
            self.push_block(cache)?;
        }

        let tail = self.tail.as_ref().expect("tail block just ensured");
        if !tail.borrow_mut().insert(tuple) {
            self.finish_inserts(cache);
            self.push_block(cache)?;
            let tail = self.tail.as_ref().expect("tail block just ensured");
            ensure!(
                tail.borrow_mut().insert(tuple),
                "tuple of {} non-inlined bytes cannot fit an empty block",
                tuple.non_inlined_size()
            );
        }

        self.tuple_count += 1;
        Ok(())
    }

    fn push_block(&mut self, cache: &mut BlockCache) -> Result<()> {
        let block = cache.new_block(Arc::clone(&self.schema))?;
        self.block_ids.push(block.borrow().id());
        self.tail = Some(block);
        Ok(())
    }

    /// Unpin the tail block. Call when the table's content is complete;
    /// scans and sorts require it.
    pub fn finish_inserts(&mut self, cache: &mut BlockCache) {
        if let Some(tail) = self.tail.take() {
            let id = tail.borrow().id();
            drop(tail);
            cache.unpin(id);
        }
    }

    /// Remove a block from this table without destroying it. The caller
    /// takes over the block's lifetime (sort runs do this).
    pub fn disown_block(&mut self, id: BlockId) -> Option<BlockId> {
        let idx = self.block_ids.iter().position(|&x| x == id)?;
        self.block_ids.remove(idx);
        Some(id)
    }

    /// Disown every block at once, in table order.
    pub fn take_block_ids(&mut self) -> Vec<BlockId> {
        std::mem::take(&mut self.block_ids)
    }

    /// Adopt a block disowned from another table of the same schema.
    pub fn inherit_block(&mut self, id: BlockId) {
        self.block_ids.push(id);
    }

    /// Visit every tuple in table order. Blocks are fetched (and faulted
    /// in) one at a time and unpinned before moving on; `finish_inserts`
    /// must have been called.
    pub fn for_each_tuple<F>(&self, cache: &mut BlockCache, mut f: F) -> Result<()>
    where
        F: FnMut(TupleRef<'_>) -> Result<()>,
    {
        assert!(self.tail.is_none(), "scan while inserts are unfinished");
        for &id in &self.block_ids {
            let handle = cache.fetch(id)?;
            let block = handle.borrow();
            let mut result = Ok(());
            for tuple in block.tuples() {
                if let Err(e) = f(tuple) {
                    result = Err(e);
                    break;
                }
            }
            drop(block);
            cache.unpin(id);
            result?;
        }
        Ok(())
    }

    /// Destroy the table: release every block (and any persisted copy).
    pub fn destroy(mut self, cache: &mut BlockCache) -> Result<()> {
        self.finish_inserts(cache);
        for id in std::mem::take(&mut self.block_ids) {
            cache.release(id)?;
        }
        Ok(())
    }
}
