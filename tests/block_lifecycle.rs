//! Block-level lifecycle scenarios: iterator walks, fill-and-overflow
//! boundaries, and the release/reload relocation round-trip through the
//! cache and spill topend.

use std::borrow::Cow;
use std::sync::Arc;

use spillblock::config::{BLOCK_SIZE, OBJECT_LENGTH_PREFIX};
use spillblock::{
    Block, BlockCache, BlockId, ColumnDef, DataType, FileTopend, OwnedTuple, TempTable,
    TupleSchema, Value,
};
use tempfile::tempdir;

fn walk_schema() -> Arc<TupleSchema> {
    Arc::new(TupleSchema::new(vec![
        ColumnDef::new("id", DataType::Int8),
        ColumnDef::new("name", DataType::Text),
        ColumnDef::new("score", DataType::Int4),
    ]))
}

/// Varchar key plus 49 one-byte padding columns: 7-byte null bitmap +
/// 8-byte string ref + 49 padding bytes = 64 inline bytes, 65 stored.
fn padded_schema() -> Arc<TupleSchema> {
    let mut columns = vec![ColumnDef::new("strfld", DataType::Text)];
    for i in 0..49 {
        columns.push(ColumnDef::new(format!("{}", i + 1), DataType::Bool));
    }
    Arc::new(TupleSchema::new(columns))
}

fn padded_tuple(tuple: &mut OwnedTuple, key: &str) {
    tuple.reset();
    tuple.set_value(0, &Value::Text(Cow::Owned(key.to_string())));
    for i in 0..49 {
        tuple.set_value(i + 1, &Value::Bool(i % 2 == 0));
    }
}

#[test]
fn iterator_walk() {
    let schema = walk_schema();
    let mut block = Block::new(BlockId(0), Arc::clone(&schema));
    assert_eq!(block.begin(), block.end());

    let rows: [(i64, &str, Option<i64>); 4] = [
        (0, "foo", None),
        (1, "bar", Some(37)),
        (2, "baz", Some(49)),
        (3, "bugs", Some(96)),
    ];
    let mut tuple = OwnedTuple::new(Arc::clone(&schema));
    for (id, name, score) in rows {
        tuple.reset();
        tuple.set_value(0, &Value::Int(id));
        tuple.set_value(1, &Value::Text(Cow::Borrowed(name)));
        match score {
            Some(v) => tuple.set_value(2, &Value::Int(v)),
            None => tuple.set_value(2, &Value::Null),
        }
        assert!(block.insert(tuple.as_tuple()));
    }

    // Walk in insertion order.
    let mut it = block.begin();
    let end = block.end();
    let mut i = 0usize;
    while it != end {
        let t = it.tuple(&schema);
        assert_eq!(t.value(0), Value::Int(rows[i].0));
        assert_eq!(t.value(1).as_str(), Some(rows[i].1));
        match rows[i].2 {
            Some(v) => assert_eq!(t.value(2), Value::Int(v)),
            None => assert_eq!(t.value(2), Value::Null),
        }
        it.advance();
        i += 1;
    }
    assert_eq!(i, rows.len());

    // end() - begin() == active_tuple_count
    assert_eq!(block.end() - block.begin(), 4);

    // Indexed access: begin()[3] is the fourth row.
    assert_eq!(block.begin().at(3, &schema).value(1).as_str(), Some("bugs"));

    // begin() + 3 - 2 == begin() + 1
    assert_eq!(block.begin() + 3 - 2, block.begin() + 1);

    // Iterator laws.
    let a = block.begin();
    let b = block.begin() + 2;
    assert_eq!((a + 2) - 2, a);
    assert!(a < b);
    assert!(b - a > 0);

    // Relational operators.
    assert!(block.end() > block.begin());
    assert!(block.end() >= block.end());
    assert!(block.begin() <= block.begin());
}

#[test]
fn fill_and_overflow_at_65_byte_tuples() {
    let schema = padded_schema();
    assert_eq!(schema.tuple_length(), 65);

    let mut block = Block::new(BlockId(0), Arc::clone(&schema));
    let mut tuple = OwnedTuple::new(Arc::clone(&schema));
    let key = "k".repeat(256);
    let per_tuple_non_inlined = OBJECT_LENGTH_PREFIX + 256;
    assert_eq!(per_tuple_non_inlined, 260);

    let mut inserted = 0usize;
    loop {
        padded_tuple(&mut tuple, &key);
        if !block.insert(tuple.as_tuple()) {
            break;
        }
        inserted += 1;
    }

    // Inserts succeed until the gap drops below 65 + 260 = 325 bytes.
    assert!(block.free_space() < 325);
    assert_eq!(inserted, BLOCK_SIZE / 325);
    assert_eq!(block.active_tuple_count(), inserted);

    // The refused insert left the block unchanged.
    let count = block.active_tuple_count();
    let tuple_mem = block.allocated_tuple_memory();
    let pool_mem = block.allocated_pool_memory();
    padded_tuple(&mut tuple, &key);
    assert!(!block.insert(tuple.as_tuple()));
    assert_eq!(block.active_tuple_count(), count);
    assert_eq!(block.allocated_tuple_memory(), tuple_mem);
    assert_eq!(block.allocated_pool_memory(), pool_mem);
}

#[test]
fn relocation_round_trip_through_cache() {
    let dir = tempdir().unwrap();
    let mut cache = BlockCache::new(2, Box::new(FileTopend::new(dir.path().join("spill"))));
    let schema = walk_schema();

    let block = cache.new_block(Arc::clone(&schema)).unwrap();
    let id = block.borrow().id();

    let mut expected = Vec::new();
    {
        let mut tuple = OwnedTuple::new(Arc::clone(&schema));
        let mut b = block.borrow_mut();
        for i in 0..500i64 {
            tuple.reset();
            let name = format!("row_{i:05}_{}", "x".repeat((i % 40) as usize));
            tuple.set_value(0, &Value::Int(i));
            tuple.set_value(1, &Value::Text(Cow::Borrowed(&name)));
            tuple.set_value(2, &Value::Int(i * 3));
            assert!(b.insert(tuple.as_tuple()));
            expected.push((i, name, i * 3));
        }
    }
    cache.unpin(id);
    drop(block);

    // Evict the block by filling the cache with fresh pinned blocks.
    let spare_a = cache.new_block(Arc::clone(&schema)).unwrap();
    let spare_b = cache.new_block(Arc::clone(&schema)).unwrap();
    cache.unpin(spare_a.borrow().id());
    cache.unpin(spare_b.borrow().id());

    // Fetch reloads the payload at a (very likely) different address and
    // relocates every string ref; all values must read back byte-for-byte.
    let reloaded = cache.fetch(id).unwrap();
    let b = reloaded.borrow();
    assert!(b.is_resident());
    assert!(b.is_stored());
    assert_eq!(b.active_tuple_count(), expected.len());
    for (t, (i, name, score)) in b.tuples().zip(&expected) {
        assert_eq!(t.value(0), Value::Int(*i));
        assert_eq!(t.value(1).as_str(), Some(name.as_str()));
        assert_eq!(t.value(2), Value::Int(*score));
    }
}

#[test]
fn repeated_evict_fetch_cycles_stay_intact() {
    let dir = tempdir().unwrap();
    let mut cache = BlockCache::new(1, Box::new(FileTopend::new(dir.path().join("spill"))));
    let schema = walk_schema();

    let block = cache.new_block(Arc::clone(&schema)).unwrap();
    let id = block.borrow().id();
    {
        let mut tuple = OwnedTuple::new(Arc::clone(&schema));
        let mut b = block.borrow_mut();
        for i in 0..100i64 {
            tuple.reset();
            tuple.set_value(0, &Value::Int(i));
            tuple.set_value(1, &Value::Text(Cow::Owned(format!("v{i}"))));
            tuple.set_value(2, &Value::Null);
            assert!(b.insert(tuple.as_tuple()));
        }
    }
    cache.unpin(id);
    drop(block);

    for _ in 0..3 {
        // Capacity 1: the next allocation forces an eviction each round.
        let spare = cache.new_block(Arc::clone(&schema)).unwrap();
        let spare_id = spare.borrow().id();
        cache.unpin(spare_id);
        drop(spare);

        let reloaded = cache.fetch(id).unwrap();
        {
            let b = reloaded.borrow();
            for (i, t) in b.tuples().enumerate() {
                assert_eq!(t.value(0), Value::Int(i as i64));
                assert_eq!(t.value(1).as_str().unwrap(), format!("v{i}"));
                assert_eq!(t.value(2), Value::Null);
            }
        }
        cache.unpin(id);
        cache.release(spare_id).unwrap();
    }
}

#[test]
fn table_rollover_matches_capacity_refusal() {
    let dir = tempdir().unwrap();
    let mut cache = BlockCache::new(4, Box::new(FileTopend::new(dir.path().join("spill"))));
    let schema = padded_schema();
    let mut table = TempTable::new(Arc::clone(&schema));

    // Exactly one block's worth, then one more tuple.
    let per_block = BLOCK_SIZE / 325;
    let key = "r".repeat(256);
    let mut tuple = OwnedTuple::new(Arc::clone(&schema));
    for _ in 0..per_block {
        padded_tuple(&mut tuple, &key);
        table.insert(&mut cache, tuple.as_tuple()).unwrap();
    }
    assert_eq!(table.allocated_block_count(), 1);

    padded_tuple(&mut tuple, &key);
    table.insert(&mut cache, tuple.as_tuple()).unwrap();
    assert_eq!(table.allocated_block_count(), 2);
    assert_eq!(table.active_tuple_count(), per_block + 1);

    table.finish_inserts(&mut cache);
    table.destroy(&mut cache).unwrap();
}
