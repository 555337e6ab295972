//! Ordered Array
//!
//! A fixed-capacity array kept sorted by a caller-supplied ordering. The
//! backing storage is not owned: the heap places it at the bottom of its own
//! address range, so no allocation is needed to create it.
//!
//! # Design
//! - Insertion is stable: an item goes after every item it is not less than
//! - Removal is by position; callers locate a value with [`OrderedArray::position`]
//! - Out-of-range positions are invariant violations and panic

use core::fmt;
use core::ptr;

/// The array is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexFull {
    /// Capacity of the array that rejected the insert.
    pub capacity: usize,
}

impl fmt::Display for IndexFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ordered array full ({} entries)", self.capacity)
    }
}

/// Sorted array of `T` over external storage.
pub struct OrderedArray<T: Copy> {
    items: *mut T,
    len: usize,
    capacity: usize,
    less_than: fn(&T, &T) -> bool,
}

impl<T: Copy> OrderedArray<T> {
    /// Place an empty array over `storage`.
    ///
    /// # Safety
    /// `storage` must be valid for reads and writes of `capacity` elements of
    /// `T`, suitably aligned, and not accessed through any other path for as
    /// long as the array is in use.
    pub unsafe fn place(storage: *mut T, capacity: usize, less_than: fn(&T, &T) -> bool) -> Self {
        debug_assert!(storage.is_aligned());
        Self {
            items: storage,
            len: 0,
            capacity,
            less_than,
        }
    }

    /// Number of items currently stored.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no items.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of items.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether another insert would fail.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Insert `item` at its sorted position.
    pub fn insert(&mut self, item: T) -> Result<(), IndexFull> {
        if self.is_full() {
            return Err(IndexFull {
                capacity: self.capacity,
            });
        }

        let mut pos = 0;
        while pos < self.len && !(self.less_than)(&item, &self.get(pos)) {
            pos += 1;
        }

        // SAFETY: pos <= len < capacity, so both the shifted range
        // [pos, len] and the write at pos stay inside the storage.
        unsafe {
            let slot = self.items.add(pos);
            ptr::copy(slot, slot.add(1), self.len - pos);
            slot.write(item);
        }
        self.len += 1;
        Ok(())
    }

    /// Get the item at position `i`.
    ///
    /// # Panics
    /// Panics if `i` is out of range.
    #[inline]
    pub fn get(&self, i: usize) -> T {
        assert!(i < self.len, "ordered array index {} out of range ({})", i, self.len);
        // SAFETY: i < len <= capacity and every slot below len is initialized.
        unsafe { self.items.add(i).read() }
    }

    /// Remove and return the item at position `i`, shifting later items down.
    ///
    /// # Panics
    /// Panics if `i` is out of range.
    pub fn remove_at(&mut self, i: usize) -> T {
        let item = self.get(i);
        // SAFETY: i < len, so [i + 1, len) is initialized and in bounds.
        unsafe {
            let slot = self.items.add(i);
            ptr::copy(slot.add(1), slot, self.len - i - 1);
        }
        self.len -= 1;
        item
    }

    /// Position of the first item matching `pred`.
    pub fn position(&self, mut pred: impl FnMut(T) -> bool) -> Option<usize> {
        (0..self.len).find(|&i| pred(self.get(i)))
    }

    /// Iterate over the items in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = T> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }
}
