/*!
 * Offset Pointer
 * An offset that knows how to become a pointer again
 *
 * The only legal persistent reference inside the heap is a byte offset from
 * the segment base; the base itself usually differs between attaches.
 * `OffsetPtr` packages that convention: store it in-heap, re-anchor it at
 * the current base to dereference.
 */

use crate::core::types::Offset;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

const NULL_OFFSET: Offset = Offset::MIN;

/// Fancy pointer: a typed offset relative to an explicit anchor
#[derive(Debug, Serialize, Deserialize)]
pub struct OffsetPtr<T> {
    offset: Offset,
    #[serde(skip)]
    _marker: PhantomData<*mut T>,
}

impl<T> OffsetPtr<T> {
    /// The null pointer value
    pub const fn null() -> Self {
        Self {
            offset: NULL_OFFSET,
            _marker: PhantomData,
        }
    }

    pub const fn from_offset(offset: Offset) -> Self {
        Self {
            offset,
            _marker: PhantomData,
        }
    }

    /// Capture `ptr` relative to `base`.
    ///
    /// `ptr` must point into the segment anchored at `base` (or be null).
    pub fn from_raw(base: *const u8, ptr: *const T) -> Self {
        if ptr.is_null() {
            return Self::null();
        }
        Self {
            offset: ptr as Offset - base as Offset,
            _marker: PhantomData,
        }
    }

    pub const fn is_null(&self) -> bool {
        self.offset == NULL_OFFSET
    }

    pub const fn offset(&self) -> Offset {
        self.offset
    }

    /// Re-anchor at the current segment base
    pub fn resolve(&self, base: *const u8) -> *mut T {
        if self.is_null() {
            return std::ptr::null_mut();
        }
        // SAFETY: callers anchor with the base of the segment the offset
        // was captured against; the result is inside that mapping.
        unsafe { (base as *mut u8).offset(self.offset as isize) as *mut T }
    }
}

impl<T> Clone for OffsetPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for OffsetPtr<T> {}

impl<T> PartialEq for OffsetPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for OffsetPtr<T> {}

impl<T> Default for OffsetPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}
