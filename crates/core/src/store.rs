//! Page-sized arenas of trampoline slots.
//!
//! A store owns one page of executable memory, carved into fixed-size
//! trampoline slots and filled low-to-high. Once any slot has been vended
//! the page is pinned for the life of the process: the patched target and
//! the relocated code both embed slot addresses, so nothing may ever be
//! freed or reused. A store that never vended a slot (a failed placement
//! probe) releases its page on drop.

use std::ptr;

use tracing::debug;

use crate::os;
use crate::trampoline::{Trampoline, TRAMPOLINE_SIZE};

pub struct TrampolineStore {
    base: *mut Trampoline,
    count: usize,
}

// SAFETY: the raw base pointer is only dereferenced by the registry, which
// serializes every store access behind its process-wide lock.
unsafe impl Send for TrampolineStore {}
unsafe impl Sync for TrampolineStore {}

impl TrampolineStore {
    /// Bytes of executable memory per store: one system page.
    pub fn store_size() -> usize {
        os::page_size()
    }

    /// Number of trampoline slots per store.
    pub fn capacity() -> usize {
        Self::store_size() / TRAMPOLINE_SIZE
    }

    /// Creates a store wherever the OS finds room.
    pub fn new() -> Self {
        Self::allocate(None)
    }

    /// Creates a store at `base`, rounded down to a store-size multiple.
    /// Check [`Self::is_initialized`]: the placement is allowed to fail.
    pub fn with_base(base: usize) -> Self {
        Self::allocate(Some(base & !(Self::store_size() - 1)))
    }

    fn allocate(preferred: Option<usize>) -> Self {
        let base = os::alloc_executable(preferred, Self::store_size())
            .map(|addr| addr as *mut Trampoline)
            .unwrap_or(ptr::null_mut());
        if !base.is_null() {
            debug!(
                "trampoline store mapped at {:#x} with {} slot(s)",
                base as usize,
                Self::capacity()
            );
        }
        Self { base, count: 0 }
    }

    /// Whether the backing page was successfully mapped.
    pub fn is_initialized(&self) -> bool {
        !self.base.is_null()
    }

    pub fn base_address(&self) -> usize {
        self.base as usize
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Remaining free slots.
    pub fn free_count(&self) -> usize {
        Self::capacity() - self.count
    }

    /// Whether `addr` points into this store's page.
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        !self.base.is_null() && addr >= base && addr < base + Self::store_size()
    }

    /// Vends the next slot, reset to its initial byte pattern, and returns
    /// its index.
    pub fn allocate_slot(&mut self) -> Option<usize> {
        if self.base.is_null() || self.count >= Self::capacity() {
            return None;
        }
        let index = self.count;
        // SAFETY: the index is in bounds of the page this store owns.
        unsafe { (*self.base.add(index)).reset() };
        self.count += 1;
        Some(index)
    }

    /// Returns the most recently vended slot. Only valid immediately after
    /// a failed hook construction, before the slot address has escaped.
    pub fn deallocate_last(&mut self) {
        debug_assert!(self.count > 0);
        self.count -= 1;
    }

    /// Raw pointer to the trampoline in `index`.
    pub fn get(&self, index: usize) -> *mut Trampoline {
        debug_assert!(index < self.count);
        self.base.wrapping_add(index)
    }
}

impl Drop for TrampolineStore {
    fn drop(&mut self) {
        // Only an untouched page may be returned; see the module docs.
        if !self.base.is_null() && self.count == 0 {
            os::free_executable(self.base as usize, Self::store_size());
        }
    }
}
