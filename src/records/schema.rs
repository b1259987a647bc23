//! # Tuple Schema
//!
//! `TupleSchema` describes the structure of every tuple in a block and
//! pre-computes the offsets needed for O(1) column access.
//!
//! ## Schema Internals
//!
//! - `columns`: column definitions
//! - `offsets`: byte offset of each column slot within the inline body
//! - `var_ref_offsets`: offsets of the string-ref slots, in column order,
//!   used by the relocation walk after a block is reloaded from disk
//! - `inline_size`: null bitmap plus all column slots; the stored tuple is
//!   `TUPLE_HEADER_SIZE + inline_size` bytes
//!
//! Schemas are immutable, shared via `Arc`, and outlive every block that
//! references them. Blocks never own their schema.

use crc::{Crc, CRC_32_ISO_HDLC};
use smallvec::SmallVec;

use crate::config::TUPLE_HEADER_SIZE;
use crate::records::types::ColumnDef;

const FINGERPRINT: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug)]
pub struct TupleSchema {
    columns: Vec<ColumnDef>,
    offsets: Vec<usize>,
    var_ref_offsets: SmallVec<[usize; 8]>,
    null_bitmap_size: usize,
    inline_size: usize,
}

impl TupleSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        let null_bitmap_size = Self::null_bitmap_size(columns.len());
        let mut offsets = Vec::with_capacity(columns.len());
        let mut var_ref_offsets = SmallVec::new();
        let mut offset = null_bitmap_size;

        for col in &columns {
            offsets.push(offset);
            if col.data_type.is_variable() {
                var_ref_offsets.push(offset);
            }
            offset += col.data_type.inline_size();
        }

        Self {
            columns,
            offsets,
            var_ref_offsets,
            null_bitmap_size,
            inline_size: offset,
        }
    }

    pub fn null_bitmap_size(column_count: usize) -> usize {
        column_count.div_ceil(8)
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column(&self, idx: usize) -> &ColumnDef {
        &self.columns[idx]
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    /// Offset of a column's slot within the inline body (bitmap included).
    pub fn column_offset(&self, idx: usize) -> usize {
        self.offsets[idx]
    }

    pub fn var_column_count(&self) -> usize {
        self.var_ref_offsets.len()
    }

    /// Offsets of every string-ref slot within the inline body, in column
    /// order. This is the enumeration the relocation walk iterates.
    pub fn var_ref_offsets(&self) -> &[usize] {
        &self.var_ref_offsets
    }

    /// Width of the inline body: null bitmap plus all column slots.
    pub fn inline_size(&self) -> usize {
        self.inline_size
    }

    /// Full stored length of one tuple: status byte plus inline body.
    pub fn tuple_length(&self) -> usize {
        TUPLE_HEADER_SIZE + self.inline_size
    }

    /// CRC32 over the column type layout. Persisted with every spilled
    /// block and checked on reload so a block image is never reinterpreted
    /// under a different schema.
    pub fn fingerprint(&self) -> u32 {
        let mut digest = FINGERPRINT.digest();
        for col in &self.columns {
            digest.update(&[col.data_type as u8, col.data_type.is_variable() as u8]);
        }
        digest.finalize()
    }
}
