//! # Block Cursors
//!
//! Random-access cursors over the tuple region of one block. Tuples have a
//! fixed stored length, so a cursor is just an address and a stride; every
//! movement is pointer arithmetic.
//!
//! Two variants share the same layout: [`BlockIter`] exposes read-only
//! tuple views, [`BlockIterMut`] additionally exposes the raw mutable
//! address the in-place sort swaps through. A mutable cursor converts to a
//! const cursor, never the reverse.
//!
//! ## Contract
//!
//! Cursors are invalidated by any insert into the block (`end()` moves).
//! Cursors from different blocks must not be compared or subtracted.
//! Dereferencing does not check bounds; `begin()`/`end()` delimit the
//! valid range. These rules are the caller's responsibility, exactly like
//! the raw tuple addresses the cursors wrap.

use std::marker::PhantomData;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::records::schema::TupleSchema;
use crate::records::tuple::TupleRef;

/// Read-only random-access cursor over a block's tuple region.
#[derive(Clone, Copy, Debug)]
pub struct BlockIter<'a> {
    tuple_length: usize,
    addr: *const u8,
    _block: PhantomData<&'a [u8]>,
}

/// Mutable random-access cursor over a block's tuple region.
#[derive(Clone, Copy, Debug)]
pub struct BlockIterMut<'a> {
    tuple_length: usize,
    addr: *mut u8,
    _block: PhantomData<&'a [u8]>,
}

impl<'a> BlockIter<'a> {
    pub(crate) fn new(tuple_length: usize, addr: *const u8) -> Self {
        Self {
            tuple_length,
            addr,
            _block: PhantomData,
        }
    }

    pub fn raw(&self) -> *const u8 {
        self.addr
    }

    /// View of the tuple under the cursor.
    pub fn tuple(&self, schema: &'a TupleSchema) -> TupleRef<'a> {
        // SAFETY: per the module contract the cursor is within
        // [begin, end) of a block whose storage outlives 'a.
        unsafe { TupleRef::from_raw(self.addr, schema) }
    }

    /// View of the tuple `n` positions away.
    pub fn at(&self, n: isize, schema: &'a TupleSchema) -> TupleRef<'a> {
        (*self + n).tuple(schema)
    }

    /// Move one tuple forward.
    pub fn advance(&mut self) {
        *self += 1;
    }

    /// Move one tuple backward.
    pub fn retreat(&mut self) {
        *self -= 1;
    }
}

impl<'a> BlockIterMut<'a> {
    pub(crate) fn new(tuple_length: usize, addr: *mut u8) -> Self {
        Self {
            tuple_length,
            addr,
            _block: PhantomData,
        }
    }

    pub fn raw(&self) -> *mut u8 {
        self.addr
    }

    pub fn tuple_length(&self) -> usize {
        self.tuple_length
    }

    /// Read-only view of the tuple under the cursor.
    pub fn tuple(&self, schema: &'a TupleSchema) -> TupleRef<'a> {
        // SAFETY: as for BlockIter::tuple.
        unsafe { TupleRef::from_raw(self.addr, schema) }
    }

    pub fn at(&self, n: isize, schema: &'a TupleSchema) -> TupleRef<'a> {
        (*self + n).tuple(schema)
    }

    pub fn advance(&mut self) {
        *self += 1;
    }

    pub fn retreat(&mut self) {
        *self -= 1;
    }
}

/// Mutable cursors convert to const cursors, never the reverse.
impl<'a> From<BlockIterMut<'a>> for BlockIter<'a> {
    fn from(it: BlockIterMut<'a>) -> Self {
        BlockIter::new(it.tuple_length, it.addr)
    }
}

macro_rules! cursor_arithmetic {
    ($name:ident, $ptr:ty) => {
        impl Add<isize> for $name<'_> {
            type Output = Self;
            fn add(mut self, n: isize) -> Self {
                self += n;
                self
            }
        }

        impl Sub<isize> for $name<'_> {
            type Output = Self;
            fn sub(mut self, n: isize) -> Self {
                self -= n;
                self
            }
        }

        impl AddAssign<isize> for $name<'_> {
            fn add_assign(&mut self, n: isize) {
                // SAFETY: arithmetic within one block's tuple region per the
                // module contract; out-of-range cursors may only be compared.
                self.addr = unsafe { self.addr.offset(n * self.tuple_length as isize) };
            }
        }

        impl SubAssign<isize> for $name<'_> {
            fn sub_assign(&mut self, n: isize) {
                *self += -n;
            }
        }

        /// Distance in tuples between two cursors of the same block.
        impl Sub for $name<'_> {
            type Output = isize;
            fn sub(self, other: Self) -> isize {
                debug_assert_eq!(self.tuple_length, other.tuple_length);
                let bytes = (self.addr as isize) - (other.addr as isize);
                bytes / self.tuple_length as isize
            }
        }

        impl PartialEq for $name<'_> {
            fn eq(&self, other: &Self) -> bool {
                std::ptr::eq(self.addr, other.addr)
            }
        }

        impl Eq for $name<'_> {}

        impl PartialOrd for $name<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        impl Ord for $name<'_> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                (self.addr as usize).cmp(&(other.addr as usize))
            }
        }
    };
}

cursor_arithmetic!(BlockIter, *const u8);
cursor_arithmetic!(BlockIterMut, *mut u8);

/// Forward iterator over a block's tuples, built from a cursor pair.
pub struct Tuples<'a> {
    cur: BlockIter<'a>,
    end: BlockIter<'a>,
    schema: &'a TupleSchema,
}

impl<'a> Tuples<'a> {
    pub(crate) fn new(cur: BlockIter<'a>, end: BlockIter<'a>, schema: &'a TupleSchema) -> Self {
        Self { cur, end, schema }
    }
}

impl<'a> Iterator for Tuples<'a> {
    type Item = TupleRef<'a>;

    fn next(&mut self) -> Option<TupleRef<'a>> {
        if self.cur == self.end {
            return None;
        }
        let tuple = self.cur.tuple(self.schema);
        self.cur.advance();
        Some(tuple)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.cur) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Tuples<'_> {}
