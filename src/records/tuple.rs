//! # Tuple Views and Scratch Tuples
//!
//! Two ways to hold a tuple:
//!
//! - [`TupleRef`]: a borrowed, zero-copy view over one stored tuple. The
//!   view is a raw address plus a schema; dereferencing a string ref reads
//!   the length-prefixed object it points at without copying.
//! - [`OwnedTuple`]: a standalone scratch tuple with its own storage and an
//!   arena-backed string pool. This is the insert source used to build
//!   blocks: callers fill it column by column, then pass `as_tuple()` to
//!   `Block::insert`, which copies the inline body and every referenced
//!   object into the block.
//!
//! ## Safety Model
//!
//! A `TupleRef` is as unchecked as the raw tuple pointer it wraps: the
//! caller constructing one guarantees the address points at a stored tuple
//! of the right schema, and that the backing storage outlives `'a`. Blocks
//! and iterators uphold this by construction; the pin discipline keeps
//! storage from being evicted underneath a live view.

use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::Arc;

use bumpalo::Bump;

use crate::config::{OBJECT_LENGTH_PREFIX, TUPLE_FLAG_ACTIVE, TUPLE_HEADER_SIZE};
use crate::records::schema::TupleSchema;
use crate::records::types::DataType;
use crate::records::value::Value;

/// Read a string ref (unaligned little-endian u64) at `p`.
///
/// # Safety
/// `p` must be valid for 8 bytes of reads.
pub(crate) unsafe fn read_ref(p: *const u8) -> u64 {
    u64::from_le_bytes(*(p as *const [u8; 8]))
}

/// Write a string ref (unaligned little-endian u64) at `p`.
///
/// # Safety
/// `p` must be valid for 8 bytes of writes.
pub(crate) unsafe fn write_ref(p: *mut u8, value: u64) {
    (p as *mut [u8; 8]).write(value.to_le_bytes());
}

/// Total bytes occupied by the non-inlined object a ref points at
/// (length prefix included).
///
/// # Safety
/// `r` must be a non-zero ref produced by this crate, pointing at a live
/// length-prefixed object.
pub(crate) unsafe fn object_total_size(r: u64) -> usize {
    let p = r as *const u8;
    let len = u32::from_le_bytes(*(p as *const [u8; 4])) as usize;
    OBJECT_LENGTH_PREFIX + len
}

/// Payload bytes of the non-inlined object a ref points at.
///
/// # Safety
/// As [`object_total_size`]; additionally the object must outlive `'a`.
pub(crate) unsafe fn object_payload<'a>(r: u64) -> &'a [u8] {
    let p = r as *const u8;
    let len = u32::from_le_bytes(*(p as *const [u8; 4])) as usize;
    std::slice::from_raw_parts(p.add(OBJECT_LENGTH_PREFIX), len)
}

/// Borrowed view over one stored tuple.
#[derive(Clone, Copy)]
pub struct TupleRef<'a> {
    addr: *const u8,
    schema: &'a TupleSchema,
    _storage: PhantomData<&'a [u8]>,
}

impl<'a> TupleRef<'a> {
    /// # Safety
    /// `addr` must point at a stored tuple of `schema`'s layout whose
    /// backing storage (and referenced non-inlined objects) outlive `'a`.
    pub unsafe fn from_raw(addr: *const u8, schema: &'a TupleSchema) -> Self {
        Self {
            addr,
            schema,
            _storage: PhantomData,
        }
    }

    pub fn schema(&self) -> &'a TupleSchema {
        self.schema
    }

    pub fn raw(&self) -> *const u8 {
        self.addr
    }

    /// The full stored image: status byte plus inline body.
    pub fn as_bytes(&self) -> &'a [u8] {
        // SAFETY: from_raw's contract guarantees tuple_length() readable bytes.
        unsafe { std::slice::from_raw_parts(self.addr, self.schema.tuple_length()) }
    }

    pub fn status(&self) -> u8 {
        self.as_bytes()[0]
    }

    pub fn is_active(&self) -> bool {
        self.status() & TUPLE_FLAG_ACTIVE != 0
    }

    pub fn is_null(&self, idx: usize) -> bool {
        let bitmap = &self.as_bytes()[TUPLE_HEADER_SIZE..];
        bitmap[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// The string ref stored in a variable column's slot, by slot offset
    /// within the inline body.
    pub(crate) fn ref_at(&self, slot_offset: usize) -> u64 {
        // SAFETY: slot_offset comes from the schema, so it lies inside the
        // inline body; as_bytes() covers it.
        unsafe { read_ref(self.addr.add(TUPLE_HEADER_SIZE + slot_offset)) }
    }

    /// Decode one column.
    pub fn value(&self, idx: usize) -> Value<'a> {
        let col = self.schema.column(idx);
        if self.is_null(idx) {
            return Value::Null;
        }
        let off = TUPLE_HEADER_SIZE + self.schema.column_offset(idx);
        let bytes = self.as_bytes();
        match col.data_type {
            DataType::Bool => Value::Bool(bytes[off] != 0),
            DataType::Int2 => {
                Value::Int(i16::from_le_bytes([bytes[off], bytes[off + 1]]) as i64)
            }
            DataType::Int4 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&bytes[off..off + 4]);
                Value::Int(i32::from_le_bytes(b) as i64)
            }
            DataType::Int8 | DataType::Timestamp => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[off..off + 8]);
                Value::Int(i64::from_le_bytes(b))
            }
            DataType::Float4 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(&bytes[off..off + 4]);
                Value::Float(f32::from_le_bytes(b) as f64)
            }
            DataType::Float8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[off..off + 8]);
                Value::Float(f64::from_le_bytes(b))
            }
            DataType::Text => {
                let r = self.ref_at(self.schema.column_offset(idx));
                if r == 0 {
                    return Value::Null;
                }
                // SAFETY: non-zero refs point at live objects in the same
                // block; text columns are written from &str, so the payload
                // is valid UTF-8.
                let payload = unsafe { object_payload(r) };
                Value::Text(Cow::Borrowed(unsafe {
                    std::str::from_utf8_unchecked(payload)
                }))
            }
            DataType::Blob => {
                let r = self.ref_at(self.schema.column_offset(idx));
                if r == 0 {
                    return Value::Null;
                }
                // SAFETY: non-zero refs point at live objects in the same block.
                Value::Blob(Cow::Borrowed(unsafe { object_payload(r) }))
            }
        }
    }

    /// Total non-inlined bytes this tuple references, length prefixes
    /// included. This is the `V` term of the block's space check.
    pub fn non_inlined_size(&self) -> usize {
        let mut total = 0;
        for &off in self.schema.var_ref_offsets() {
            let r = self.ref_at(off);
            if r != 0 {
                // SAFETY: non-zero refs point at live length-prefixed objects.
                total += unsafe { object_total_size(r) };
            }
        }
        total
    }
}

impl std::fmt::Debug for TupleRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut t = f.debug_tuple("TupleRef");
        for idx in 0..self.schema.column_count() {
            t.field(&self.value(idx));
        }
        t.finish()
    }
}

/// A standalone tuple with its own inline storage and string pool.
///
/// The analog of a single-tuple staging buffer: fill it once per row, hand
/// `as_tuple()` to `Block::insert`, refill, repeat. Variable-length values
/// are copied into the arena so the produced refs stay valid until
/// [`reset`](OwnedTuple::reset) or drop.
pub struct OwnedTuple {
    schema: Arc<TupleSchema>,
    data: Box<[u8]>,
    pool: Bump,
}

impl OwnedTuple {
    pub fn new(schema: Arc<TupleSchema>) -> Self {
        let mut data = vec![0u8; schema.tuple_length()].into_boxed_slice();
        data[0] = TUPLE_FLAG_ACTIVE;
        Self {
            schema,
            data,
            pool: Bump::new(),
        }
    }

    pub fn schema(&self) -> &TupleSchema {
        &self.schema
    }

    /// Zero the tuple image and reclaim the string pool. Existing
    /// `TupleRef`s into this tuple are invalidated.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.data[0] = TUPLE_FLAG_ACTIVE;
        self.pool.reset();
    }

    pub fn as_tuple(&self) -> TupleRef<'_> {
        // SAFETY: data is a live tuple image of self.schema's layout and
        // every ref points into self.pool, which lives as long as self.
        unsafe { TupleRef::from_raw(self.data.as_ptr(), &self.schema) }
    }

    fn set_null_bit(&mut self, idx: usize, null: bool) {
        let byte = &mut self.data[TUPLE_HEADER_SIZE + idx / 8];
        if null {
            *byte |= 1 << (idx % 8);
        } else {
            *byte &= !(1 << (idx % 8));
        }
    }

    /// Store one column value. Panics if the value's type does not match
    /// the column's declared type.
    pub fn set_value(&mut self, idx: usize, value: &Value<'_>) {
        let col_type = self.schema.column(idx).data_type;
        let off = TUPLE_HEADER_SIZE + self.schema.column_offset(idx);

        if value.is_null() {
            self.set_null_bit(idx, true);
            let width = col_type.inline_size();
            self.data[off..off + width].fill(0);
            return;
        }
        self.set_null_bit(idx, false);

        match (col_type, value) {
            (DataType::Bool, Value::Bool(v)) => self.data[off] = *v as u8,
            (DataType::Int2, Value::Int(v)) => {
                self.data[off..off + 2].copy_from_slice(&(*v as i16).to_le_bytes())
            }
            (DataType::Int4, Value::Int(v)) => {
                self.data[off..off + 4].copy_from_slice(&(*v as i32).to_le_bytes())
            }
            (DataType::Int8 | DataType::Timestamp, Value::Int(v)) => {
                self.data[off..off + 8].copy_from_slice(&v.to_le_bytes())
            }
            (DataType::Float4, Value::Float(v)) => {
                self.data[off..off + 4].copy_from_slice(&(*v as f32).to_le_bytes())
            }
            (DataType::Float8, Value::Float(v)) => {
                self.data[off..off + 8].copy_from_slice(&v.to_le_bytes())
            }
            (DataType::Text, Value::Text(v)) => self.set_object(off, v.as_bytes()),
            (DataType::Blob, Value::Blob(v)) => self.set_object(off, v),
            (t, v) => panic!("column {idx} holds {t:?}, cannot store {v:?}"),
        }
    }

    fn set_object(&mut self, ref_off: usize, payload: &[u8]) {
        let total = OBJECT_LENGTH_PREFIX + payload.len();
        let obj = self.pool.alloc_slice_fill_copy(total, 0u8);
        obj[..OBJECT_LENGTH_PREFIX].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        obj[OBJECT_LENGTH_PREFIX..].copy_from_slice(payload);
        let addr = obj.as_ptr() as u64;
        // SAFETY: ref_off is a schema slot offset inside self.data.
        unsafe { write_ref(self.data.as_mut_ptr().add(ref_off), addr) };
    }
}
