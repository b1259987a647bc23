//! # External Sort
//!
//! Cache-aware sort of a multi-block temp table:
//!
//! 1. **Per-block sort**: every input block is fetched pinned and sorted
//!    in place by [`BlockSorter`] (see [`block_sort`]).
//! 2. **K-way merge**: the sorted blocks become [`SortRun`]s merged
//!    through a min-heap into the output table (see [`merge`]).
//!
//! [`repack_sorted`] is the alternative phase-1 strategy: sort a vector of
//! tuple handles with a general sort, copy the non-inlined region
//! wholesale into a fresh block, and re-insert each tuple with
//! [`Block::insert_relocating`]. Both strategies order identically under
//! the same comparator; both move the non-inlined data unmodified.
//!
//! Sorting is a pure rearrangement; it cannot fail except by exhausting
//! the block cache, which aborts with the partial output discarded.

pub mod block_sort;
pub mod merge;

use std::cmp::Ordering;

use eyre::{ensure, Result};

use crate::block::Block;
use crate::records::tuple::TupleRef;

pub use block_sort::BlockSorter;
pub use merge::{sort_table, SortRun};

/// Sort-and-repack phase-1 strategy: produce `output` holding `input`'s
/// tuples in sorted order, with the non-inlined region copied verbatim.
/// `output` must be an empty block of the same schema.
pub fn repack_sorted<C>(input: &Block, output: &mut Block, compare: C) -> Result<()>
where
    C: Fn(&TupleRef<'_>, &TupleRef<'_>) -> bool,
{
    ensure!(
        output.active_tuple_count() == 0 && output.allocated_pool_memory() == 0,
        "repack target must be an empty block"
    );
    ensure!(
        input.schema().fingerprint() == output.schema().fingerprint(),
        "repack blocks must share a schema"
    );

    let mut handles: Vec<TupleRef<'_>> = input.tuples().collect();
    handles.sort_unstable_by(|a, b| {
        if compare(a, b) {
            Ordering::Less
        } else if compare(b, a) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    });

    output.copy_non_inlined(input);
    let orig_base = input.address();
    for tuple in handles {
        ensure!(
            output.insert_relocating(tuple, orig_base),
            "repack target overflowed"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockId;
    use crate::records::types::{ColumnDef, DataType};
    use crate::records::value::Value;
    use crate::records::{OwnedTuple, TupleSchema};
    use std::borrow::Cow;
    use std::sync::Arc;

    fn by_key(a: &TupleRef<'_>, b: &TupleRef<'_>) -> bool {
        a.value(0).as_str() < b.value(0).as_str()
    }

    #[test]
    fn repack_matches_in_place_sort() {
        let schema = Arc::new(TupleSchema::new(vec![
            ColumnDef::new("key", DataType::Text),
            ColumnDef::new("n", DataType::Int8),
        ]));

        let mut in_place = Block::new(BlockId(0), Arc::clone(&schema));
        let mut repack_src = Block::new(BlockId(1), Arc::clone(&schema));
        let mut tuple = OwnedTuple::new(Arc::clone(&schema));
        for i in 0..500i64 {
            tuple.reset();
            // Distinct keys so both strategies produce one valid order.
            tuple.set_value(0, &Value::Text(Cow::Owned(format!("{:03}", (i * 211) % 1000))));
            tuple.set_value(1, &Value::Int(i));
            assert!(in_place.insert(tuple.as_tuple()));
            assert!(repack_src.insert(tuple.as_tuple()));
        }

        BlockSorter::new(&schema, by_key).sort_block(&mut in_place);

        let mut repacked = Block::new(BlockId(2), Arc::clone(&schema));
        repack_sorted(&repack_src, &mut repacked, by_key).unwrap();

        assert_eq!(in_place.active_tuple_count(), repacked.active_tuple_count());
        for (a, b) in in_place.tuples().zip(repacked.tuples()) {
            assert_eq!(a.value(0), b.value(0));
            assert_eq!(a.value(1), b.value(1));
        }
    }

    #[test]
    fn repack_rejects_nonempty_target() {
        let schema = Arc::new(TupleSchema::new(vec![ColumnDef::new(
            "key",
            DataType::Text,
        )]));
        let input = Block::new(BlockId(0), Arc::clone(&schema));
        let mut output = Block::new(BlockId(1), Arc::clone(&schema));
        let mut tuple = OwnedTuple::new(Arc::clone(&schema));
        tuple.set_value(0, &Value::Text(Cow::Borrowed("x")));
        assert!(output.insert(tuple.as_tuple()));

        assert!(repack_sorted(&input, &mut output, by_key).is_err());
    }
}
