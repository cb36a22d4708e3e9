// Single-slot atomic container for reference-counted values.
//
// The cell deliberately has no `load`: cloning an `Arc` out of a slot that
// another thread may concurrently swap cannot be done with a bare
// `AtomicPtr`, so every operation here transfers ownership instead. That is
// all the swap pipeline needs from its `active`/`retired` slots.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

pub(crate) struct AtomicCell<T> {
    ptr: AtomicPtr<T>,
}

impl<T> AtomicCell<T> {
    pub(crate) fn new() -> Self {
        AtomicCell {
            ptr: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Put `value` into the cell, returning the previous occupant.
    pub(crate) fn swap(&self, value: Option<Arc<T>>) -> Option<Arc<T>> {
        let new = match value {
            Some(value) => Arc::into_raw(value) as *mut T,
            None => ptr::null_mut(),
        };
        let old = self.ptr.swap(new, Ordering::AcqRel);
        // SAFETY: a non-null pointer in the cell always originates from
        // `Arc::into_raw` above and is read out exactly once.
        (!old.is_null()).then(|| unsafe { Arc::from_raw(old) })
    }

    /// Empty the cell, returning the previous occupant.
    pub(crate) fn take(&self) -> Option<Arc<T>> {
        self.swap(None)
    }

    /// Empty the cell only if it currently holds `expected`.
    pub(crate) fn take_if(&self, expected: &Arc<T>) -> Option<Arc<T>> {
        let expected_ptr = Arc::as_ptr(expected) as *mut T;
        match self.ptr.compare_exchange(
            expected_ptr,
            ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // SAFETY: see `swap`; the exchanged pointer was owned by the cell.
            Ok(old) => Some(unsafe { Arc::from_raw(old) }),
            Err(_) => None,
        }
    }
}

impl<T> Drop for AtomicCell<T> {
    fn drop(&mut self) {
        self.take();
    }
}

impl<T> std::fmt::Debug for AtomicCell<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let occupied = !self.ptr.load(Ordering::Acquire).is_null();
        f.debug_struct("AtomicCell").field("occupied", &occupied).finish()
    }
}

// SAFETY: the cell hands out owned `Arc`s only; `T` itself crosses threads.
unsafe impl<T: Send + Sync> Send for AtomicCell<T> {}
unsafe impl<T: Send + Sync> Sync for AtomicCell<T> {}
