//! # blockbench: Block Sort Self-Test and Benchmark
//!
//! Run with no arguments for a quick self-test (exit 0 on success).
//! For a benchmark, specify the number of sorts to perform:
//!
//! ```bash
//! blockbench -n 100          # 100 in-place sorts of a full block
//! blockbench -n 10 -v 512    # 512-byte varchar field
//! blockbench -i 128          # 128 bytes of inline padding columns
//! ```

use std::borrow::Cow;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{ensure, Result, WrapErr};
use rand::distributions::Alphanumeric;
use rand::Rng;

use spillblock::{
    sort_table, Block, BlockCache, BlockId, BlockSorter, ColumnDef, DataType, FileTopend,
    OwnedTuple, TempTable, TupleRef, TupleSchema, Value,
};

struct Options {
    num_sorts: usize,
    varchar_length: usize,
    inline_padding: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_sorts: 1,
            varchar_length: 256,
            inline_padding: 64,
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = match parse_args() {
        Ok(Some(opts)) => opts,
        Ok(None) => return,
        Err(e) => {
            eprintln!("Error: {e}");
            print_usage();
            std::process::exit(2);
        }
    };

    if let Err(e) = run(&opts) {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

fn parse_args() -> Result<Option<Options>> {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" => {
                print_usage();
                return Ok(None);
            }
            "-n" => {
                opts.num_sorts = parse_value(&args, &mut i)?;
            }
            "-v" => {
                opts.varchar_length = parse_value(&args, &mut i)?;
            }
            "-i" => {
                opts.inline_padding = parse_value(&args, &mut i)?;
            }
            arg => eyre::bail!("unknown option: {arg}"),
        }
        i += 1;
    }

    ensure!(opts.num_sorts > 0, "-n must be positive");
    ensure!(opts.varchar_length > 0, "-v must be positive");
    Ok(Some(opts))
}

fn parse_value(args: &[String], i: &mut usize) -> Result<usize> {
    let flag = &args[*i];
    *i += 1;
    let value = args
        .get(*i)
        .ok_or_else(|| eyre::eyre!("{flag} requires a value"))?;
    value
        .parse()
        .wrap_err_with(|| format!("invalid value for {flag}: {value}"))
}

fn print_usage() {
    println!(
        "\nblockbench:\n\
         \x20   Run with no arguments, performs a self-test.\n\
         \x20   To run a performance benchmark, specify the number of sorts to perform:\n\
         \x20       -n <number>\n\
         \x20       -v <length in bytes of varchar field>\n\
         \x20       -i <length in bytes of inline fields>\n"
    );
}

/// Varchar key column followed by `inline_padding` one-byte columns.
fn build_schema(inline_padding: usize) -> Arc<TupleSchema> {
    let mut columns = vec![ColumnDef::new("strfld", DataType::Text)];
    for i in 0..inline_padding {
        columns.push(ColumnDef::new(format!("{}", i + 1), DataType::Bool));
    }
    Arc::new(TupleSchema::new(columns))
}

fn random_string(rng: &mut impl Rng, length: usize) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn fill_tuple(tuple: &mut OwnedTuple, key: String, padding: usize) {
    tuple.reset();
    tuple.set_value(0, &Value::Text(Cow::Owned(key)));
    for i in 0..padding {
        tuple.set_value(i + 1, &Value::Bool(i % 2 == 0));
    }
}

fn fill_block(block: &mut Block, opts: &Options, rng: &mut impl Rng) {
    let mut tuple = OwnedTuple::new(Arc::clone(block.schema_handle()));
    loop {
        fill_tuple(&mut tuple, random_string(rng, opts.varchar_length), opts.inline_padding);
        if !block.insert(tuple.as_tuple()) {
            break;
        }
    }
}

fn by_key(a: &TupleRef<'_>, b: &TupleRef<'_>) -> bool {
    a.value(0).as_str() < b.value(0).as_str()
}

fn verify_sorted_block(block: &Block) -> Result<()> {
    let mut last: Option<String> = None;
    for tuple in block.tuples() {
        let key = tuple
            .value(0)
            .as_str()
            .ok_or_else(|| eyre::eyre!("missing key column"))?
            .to_string();
        if let Some(prev) = &last {
            ensure!(*prev <= key, "block not sorted: {prev:?} before {key:?}");
        }
        last = Some(key);
    }
    Ok(())
}

fn run(opts: &Options) -> Result<()> {
    let schema = build_schema(opts.inline_padding);
    let mut rng = rand::thread_rng();

    let mut block = Block::new(BlockId(0), Arc::clone(&schema));
    let mut sorter = BlockSorter::new(&schema, by_key);

    let mut total = Duration::ZERO;
    for i in 0..opts.num_sorts {
        block.clear();
        fill_block(&mut block, opts, &mut rng);

        let start = Instant::now();
        sorter.sort_block(&mut block);
        total += start.elapsed();

        if i == opts.num_sorts - 1 {
            verify_sorted_block(&block)?;
        }
    }

    if opts.num_sorts > 1 {
        summarize(&block, opts, total);
    }

    merge_self_test(opts)?;
    println!("OK");
    Ok(())
}

fn summarize(block: &Block, opts: &Options, total: Duration) {
    let millis_per_sort = total.as_secs_f64() * 1000.0 / opts.num_sorts as f64;
    println!(
        "\nPerformed {} sorts of {} tuples:",
        opts.num_sorts,
        block.active_tuple_count()
    );
    println!("    Inline tuple length: {}", block.schema().tuple_length());
    if let Some(first) = block.tuples().next() {
        println!("    Non-inlined data per tuple: {}", first.non_inlined_size());
    }
    println!("Total time: {:.3} seconds", total.as_secs_f64());
    println!("    -->  Time per sort: {millis_per_sort:.3} ms\n");
}

/// End-to-end check: fill a table past several blocks, sort it through
/// the cache, verify global order and tuple count.
fn merge_self_test(opts: &Options) -> Result<()> {
    let spill_dir = env::temp_dir().join(format!("blockbench-{}", std::process::id()));
    let mut cache = BlockCache::new(8, Box::new(FileTopend::new(spill_dir)));
    let schema = build_schema(opts.inline_padding);
    let mut rng = rand::thread_rng();

    let mut table = TempTable::new(Arc::clone(&schema));
    let mut tuple = OwnedTuple::new(Arc::clone(&schema));
    let mut inserted = 0usize;
    while table.allocated_block_count() < 3 {
        fill_tuple(&mut tuple, random_string(&mut rng, opts.varchar_length), opts.inline_padding);
        table.insert(&mut cache, tuple.as_tuple())?;
        inserted += 1;
    }
    table.finish_inserts(&mut cache);

    let sorted = sort_table(&mut cache, table, by_key)?;
    ensure!(
        sorted.active_tuple_count() == inserted,
        "merge changed tuple count: {} != {inserted}",
        sorted.active_tuple_count()
    );

    let mut last: Option<String> = None;
    let mut seen = 0usize;
    sorted.for_each_tuple(&mut cache, |t| {
        let key = t
            .value(0)
            .as_str()
            .ok_or_else(|| eyre::eyre!("missing key column"))?
            .to_string();
        if let Some(prev) = &last {
            ensure!(*prev <= key, "merge output not sorted");
        }
        last = Some(key);
        seen += 1;
        Ok(())
    })?;
    ensure!(seen == inserted, "merge scan saw {seen} of {inserted} tuples");

    sorted.destroy(&mut cache)?;
    println!("merge self-test: {inserted} tuples across blocks, globally sorted");
    Ok(())
}
