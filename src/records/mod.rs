//! # Tuple Records
//!
//! This module defines the tuple data model consumed by the block engine:
//!
//! - [`types`]: column data types and definitions
//! - [`schema`]: `TupleSchema` with precomputed column offsets
//! - [`value`]: `Value`, a borrowed or owned column value
//! - [`tuple`]: `TupleRef` raw tuple views and `OwnedTuple` scratch tuples
//!
//! ## Stored Tuple Layout
//!
//! Every tuple occupies `TUPLE_HEADER_SIZE + inline_size` bytes:
//!
//! ```text
//! +--------+-------------+----------------------------------+
//! | status | null bitmap | column slots at schema offsets   |
//! | 1 byte | ceil(n/8)   | fixed bytes or 8-byte string ref |
//! +--------+-------------+----------------------------------+
//! ```
//!
//! Fixed-width columns store little-endian values directly in their slot.
//! Variable-width columns store a string ref: the absolute address (as a
//! `u64`) of a length-prefixed object in the same block's non-inlined
//! region. A null column has its bitmap bit set; a null variable column
//! additionally stores a zero ref.

pub mod schema;
pub mod tuple;
pub mod types;
pub mod value;

pub use schema::TupleSchema;
pub use tuple::{OwnedTuple, TupleRef};
pub use types::{ColumnDef, DataType};
pub use value::Value;
