//! # K-Way Merge of Sorted Blocks
//!
//! The external half of the table sort. Phase 1 turns every input block
//! into a [`SortRun`] (a pinned, in-place-sorted block with a cursor) and
//! seeds a min-heap keyed by each run's current tuple. Phase 2 pops
//! the minimum run, appends its tuple to the output table, advances the
//! run and re-heaps it, destroying runs as they drain.
//!
//! The only thing that can fail is the cache (block allocation or spill
//! I/O). On any error the driver unpins and releases every live run,
//! destroys the partial output, and propagates.

use std::cmp::Ordering;
use std::sync::Arc;

use binary_heap_plus::BinaryHeap;
use eyre::{Result, WrapErr};
use tracing::debug;

use crate::block::BlockId;
use crate::cache::{BlockCache, BlockRef};
use crate::records::schema::TupleSchema;
use crate::records::tuple::TupleRef;
use crate::sort::block_sort::BlockSorter;
use crate::table::TempTable;

/// One sorted block participating in the merge. Owns the block's pin and
/// its cache lifetime: draining or abandoning the run releases both the
/// block and any spilled copy.
pub struct SortRun {
    id: BlockId,
    block: BlockRef,
    schema: Arc<TupleSchema>,
    pos: usize,
    count: usize,
}

impl SortRun {
    fn new(id: BlockId, block: BlockRef, schema: Arc<TupleSchema>) -> Self {
        let count = block.borrow().active_tuple_count();
        Self {
            id,
            block,
            schema,
            pos: 0,
            count,
        }
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The run's current tuple.
    pub fn current(&self) -> TupleRef<'_> {
        debug_assert!(self.pos < self.count, "run {} is drained", self.id);
        let block = self.block.borrow();
        debug_assert!(block.is_pinned() && block.is_resident());
        // SAFETY: the block stays pinned (so resident, so its boxed storage
        // does not move) for as long as this run exists, and pos indexes a
        // stored tuple. The view borrows self, not the RefCell guard.
        unsafe {
            let addr = block.address().add(self.pos * self.schema.tuple_length());
            TupleRef::from_raw(addr, &self.schema)
        }
    }

    /// Step to the next tuple; false once the run is drained.
    pub fn advance(&mut self) -> bool {
        self.pos += 1;
        self.pos < self.count
    }

    fn release(self, cache: &mut BlockCache) -> Result<()> {
        cache.unpin(self.id);
        drop(self.block);
        cache.release(self.id)
    }
}

/// Sort `input` under `compare` (a strict-weak less-than) and return the
/// sorted table. The input table is consumed; its blocks become the
/// output's building material and are destroyed as they drain.
pub fn sort_table<C>(cache: &mut BlockCache, mut input: TempTable, compare: C) -> Result<TempTable>
where
    C: Fn(&TupleRef<'_>, &TupleRef<'_>) -> bool,
{
    let schema = Arc::clone(input.schema_handle());
    let block_ids = input.take_block_ids();
    // Drops the input's tail pin; it owns no blocks anymore.
    input.destroy(cache)?;

    debug!(blocks = block_ids.len(), "sort phase 1: per-block sort");
    let mut sorter = BlockSorter::new(&schema, &compare);
    let mut runs: Vec<SortRun> = Vec::with_capacity(block_ids.len());
    for id in block_ids {
        let handle = match cache.fetch(id).wrap_err("sort aborted fetching input block") {
            Ok(handle) => handle,
            Err(e) => {
                release_all(cache, runs);
                return Err(e);
            }
        };
        sorter.sort_block(&mut handle.borrow_mut());
        let run = SortRun::new(id, handle, Arc::clone(&schema));
        if run.is_empty() {
            if let Err(e) = run.release(cache) {
                release_all(cache, runs);
                return Err(e);
            }
        } else {
            runs.push(run);
        }
    }

    debug!(runs = runs.len(), "sort phase 2: k-way merge");
    let mut heap = BinaryHeap::with_capacity_by(runs.len(), |a: &SortRun, b: &SortRun| {
        // Min-heap: the tuple-wise smaller run must surface first.
        let (ta, tb) = (a.current(), b.current());
        if compare(&ta, &tb) {
            Ordering::Greater
        } else if compare(&tb, &ta) {
            Ordering::Less
        } else {
            Ordering::Equal
        }
    });
    for run in runs {
        heap.push(run);
    }

    let mut output = TempTable::new(Arc::clone(&schema));
    loop {
        let Some(mut run) = heap.pop() else { break };

        let appended = {
            let tuple = run.current();
            output.insert(cache, tuple)
        };
        if let Err(e) = appended {
            let _ = run.release(cache);
            release_all(cache, heap.into_vec());
            let _ = output.destroy(cache);
            return Err(e).wrap_err("k-way merge aborted");
        }

        if run.advance() {
            heap.push(run);
        } else if let Err(e) = run.release(cache) {
            release_all(cache, heap.into_vec());
            let _ = output.destroy(cache);
            return Err(e);
        }
    }

    output.finish_inserts(cache);
    Ok(output)
}

fn release_all(cache: &mut BlockCache, runs: Vec<SortRun>) {
    for run in runs {
        let _ = run.release(cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FileTopend;
    use crate::records::types::{ColumnDef, DataType};
    use crate::records::value::Value;
    use crate::records::OwnedTuple;
    use std::borrow::Cow;
    use tempfile::tempdir;

    fn schema() -> Arc<TupleSchema> {
        Arc::new(TupleSchema::new(vec![
            ColumnDef::new("key", DataType::Text),
            ColumnDef::new("n", DataType::Int8),
        ]))
    }

    fn by_key(a: &TupleRef<'_>, b: &TupleRef<'_>) -> bool {
        a.value(0).as_str() < b.value(0).as_str()
    }

    fn cache(dir: &std::path::Path, capacity: usize) -> BlockCache {
        BlockCache::new(capacity, Box::new(FileTopend::new(dir.join("spill"))))
    }

    #[test]
    fn merge_of_empty_table_is_empty() {
        let dir = tempdir().unwrap();
        let mut cache = cache(dir.path(), 4);
        let table = TempTable::new(schema());

        let sorted = sort_table(&mut cache, table, by_key).unwrap();
        assert_eq!(sorted.active_tuple_count(), 0);
        sorted.destroy(&mut cache).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn merge_of_empty_runs_is_empty() {
        let dir = tempdir().unwrap();
        let mut cache = cache(dir.path(), 4);
        let schema = schema();
        let mut table = TempTable::new(Arc::clone(&schema));

        // Three blocks with no tuples at all.
        for _ in 0..3 {
            let block = cache.new_block(Arc::clone(&schema)).unwrap();
            let id = block.borrow().id();
            cache.unpin(id);
            table.inherit_block(id);
        }

        let sorted = sort_table(&mut cache, table, by_key).unwrap();
        assert_eq!(sorted.active_tuple_count(), 0);
        assert_eq!(sorted.allocated_block_count(), 0);
        sorted.destroy(&mut cache).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn merge_across_blocks_is_globally_sorted() {
        let dir = tempdir().unwrap();
        let mut cache = cache(dir.path(), 8);
        let schema = schema();
        let mut table = TempTable::new(Arc::clone(&schema));

        // Payload size forces a handful of blocks.
        let filler = "f".repeat(1 << 19);
        let mut tuple = OwnedTuple::new(Arc::clone(&schema));
        for i in 0..48i64 {
            tuple.reset();
            let key = format!("{:04}_{filler}", (i * 37) % 100);
            tuple.set_value(0, &Value::Text(Cow::Owned(key)));
            tuple.set_value(1, &Value::Int(i));
            table.insert(&mut cache, tuple.as_tuple()).unwrap();
        }
        table.finish_inserts(&mut cache);
        assert!(table.allocated_block_count() > 2);

        let before = table.active_tuple_count();
        let sorted = sort_table(&mut cache, table, by_key).unwrap();
        assert_eq!(sorted.active_tuple_count(), before);

        let mut last: Option<String> = None;
        sorted
            .for_each_tuple(&mut cache, |t| {
                let key = t.value(0).as_str().unwrap().to_string();
                if let Some(prev) = &last {
                    assert!(*prev <= key);
                }
                last = Some(key);
                Ok(())
            })
            .unwrap();

        sorted.destroy(&mut cache).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn allocation_failure_tears_down_runs() {
        let dir = tempdir().unwrap();
        // Too small to hold the input runs plus an output block.
        let mut cache = cache(dir.path(), 2);
        let schema = schema();
        let mut table = TempTable::new(Arc::clone(&schema));

        let filler = "g".repeat(1 << 20);
        let mut tuple = OwnedTuple::new(Arc::clone(&schema));
        for i in 0..14i64 {
            tuple.reset();
            tuple.set_value(0, &Value::Text(Cow::Owned(format!("{i:03}_{filler}"))));
            tuple.set_value(1, &Value::Int(i));
            table.insert(&mut cache, tuple.as_tuple()).unwrap();
        }
        table.finish_inserts(&mut cache);
        assert_eq!(table.allocated_block_count(), 2);

        let err = sort_table(&mut cache, table, by_key).unwrap_err();
        assert!(err.to_string().contains("aborted"));
        // Teardown released everything it had pinned or produced.
        assert!(cache.is_empty());
    }
}
