//! # Block Engine Configuration Constants
//!
//! This module centralizes all configuration constants, grouping
//! interdependent values together and documenting their relationships.
//!
//! ## Dependency Graph
//!
//! ```text
//! BLOCK_SIZE (8 MiB)
//!       │
//!       ├─> Every spilled block image is exactly BLOCK_SIZE payload bytes;
//!       │   the spill file is SPILL_HEADER_SIZE + BLOCK_SIZE long.
//!       │
//!       └─> Tuple capacity of a block is BLOCK_SIZE / (inline size + 1)
//!           when no variable-length data is present.
//!
//! TUPLE_HEADER_SIZE (1 byte)
//!       │
//!       └─> A stored tuple is TUPLE_HEADER_SIZE + schema inline size bytes.
//!           Iterator stride and all in-block offsets derive from this.
//!
//! STRING_REF_SIZE (8 bytes)
//!       │
//!       └─> String refs are persisted as 64-bit addresses regardless of
//!           the host pointer width, so a block image written on a 32-bit
//!           host reloads identically on a 64-bit host.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `SPILL_HEADER_SIZE` matches the zerocopy header struct exactly
//!    (asserted in `cache::topend`).
//! 2. `STRING_REF_SIZE == size_of::<u64>()` (asserted below).

/// Size of every large temp table block in bytes (8 MiB).
///
/// The maximum row the executor produces is 2 MiB; a small block size
/// wastes space when tuples are large, a large one wastes space when
/// tables are small. 8 MiB holds a few rows of the maximum size.
pub const BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Size of the per-tuple status header in bytes.
/// Bit 0 of the status byte marks the tuple active.
pub const TUPLE_HEADER_SIZE: usize = 1;

/// Status byte flag: tuple slot holds a live tuple.
pub const TUPLE_FLAG_ACTIVE: u8 = 0x01;

/// Width of an inline string ref (the absolute address of a non-inlined
/// object in the same block), in bytes.
pub const STRING_REF_SIZE: usize = 8;

/// Width of the length prefix in front of every non-inlined object.
pub const OBJECT_LENGTH_PREFIX: usize = 4;

/// Size of the spill file header preceding the block payload.
pub const SPILL_HEADER_SIZE: usize = 64;

/// Default number of resident blocks a cache will hold before evicting.
/// 16 blocks = 128 MiB of block storage.
pub const DEFAULT_CACHE_CAPACITY: usize = 16;

const _: () = assert!(
    STRING_REF_SIZE == core::mem::size_of::<u64>(),
    "string refs are persisted as u64 addresses"
);

const _: () = assert!(
    BLOCK_SIZE % 4096 == 0,
    "BLOCK_SIZE must stay page-aligned for whole-block disk I/O"
);
