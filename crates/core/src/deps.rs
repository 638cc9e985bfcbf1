//! Protected dependency table.
//!
//! The engine patches live code, and the OS routines it uses to do so are
//! themselves legitimate hook targets. Every such routine is therefore
//! called through a process-wide cell. When a hook lands on one of the
//! registered addresses, [`update`] re-points the cell at the hook's
//! relocated-prologue entry, so the engine's own calls keep reaching the
//! unhooked behavior and never recurse into user code.

use std::collections::HashMap;
use std::ptr;
use std::sync::atomic::{fence, AtomicPtr, Ordering};
use std::sync::LazyLock;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::os;

/// A single protected function pointer. Reads are SeqCst loads, so the
/// compiler cannot cache the value across calls; updates are followed by a
/// full fence so other cores observe the new pointer.
pub(crate) struct Cell {
    name: &'static str,
    target: AtomicPtr<()>,
}

impl Cell {
    pub(crate) const fn new(name: &'static str) -> Self {
        Self {
            name,
            target: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// The address the engine should call today.
    pub(crate) fn get(&self) -> *mut () {
        initialize();
        self.target.load(Ordering::SeqCst)
    }
}

#[cfg(windows)]
pub(crate) static VIRTUAL_PROTECT: Cell = Cell::new("VirtualProtect");
#[cfg(windows)]
pub(crate) static VIRTUAL_ALLOC: Cell = Cell::new("VirtualAlloc");
#[cfg(windows)]
pub(crate) static VIRTUAL_FREE: Cell = Cell::new("VirtualFree");
#[cfg(windows)]
pub(crate) static VIRTUAL_QUERY: Cell = Cell::new("VirtualQuery");
#[cfg(windows)]
pub(crate) static FLUSH_INSTRUCTION_CACHE: Cell = Cell::new("FlushInstructionCache");
#[cfg(windows)]
pub(crate) static GET_MODULE_HANDLE_EX_W: Cell = Cell::new("GetModuleHandleExW");
#[cfg(windows)]
pub(crate) static GET_LAST_ERROR: Cell = Cell::new("GetLastError");

#[cfg(unix)]
pub(crate) static MPROTECT: Cell = Cell::new("mprotect");
#[cfg(unix)]
pub(crate) static MMAP: Cell = Cell::new("mmap");
#[cfg(unix)]
pub(crate) static MUNMAP: Cell = Cell::new("munmap");
#[cfg(unix)]
pub(crate) static DLADDR: Cell = Cell::new("dladdr");

/// Reverse index: current address of each protected routine to its cell.
/// Seeding happens once, on first use of any cell.
static TABLE: LazyLock<Mutex<HashMap<usize, &'static Cell>>> = LazyLock::new(|| {
    let mut table: HashMap<usize, &'static Cell> = HashMap::new();
    for (cell, address) in os::protected_seed_addresses() {
        cell.target.store(address as *mut (), Ordering::SeqCst);
        if let Some(previous) = table.insert(address, cell) {
            // Two dependencies resolving to one address would make updates
            // ambiguous; keep the first registration.
            error!(
                "rejected duplicate protected dependency '{}' at {:#x}, already '{}'",
                cell.name, address, previous.name
            );
            table.insert(address, previous);
            continue;
        }
        debug!("registered protected dependency '{}' at {:#x}", cell.name, address);
    }
    fence(Ordering::SeqCst);
    Mutex::new(table)
});

/// Seeds every cell with its OS address. Idempotent.
pub(crate) fn initialize() {
    LazyLock::force(&TABLE);
}

/// Whether `address` is one of the currently registered dependency
/// addresses.
pub(crate) fn is_registered(address: usize) -> bool {
    TABLE.lock().contains_key(&address)
}

/// Re-points the cell whose value is `old` at `new` and fixes the reverse
/// index. Returns `true` when a cell was updated, `false` when `old` is not
/// registered or `new` would alias another registered address.
pub(crate) fn update(old: usize, new: usize) -> bool {
    let mut table = TABLE.lock();

    if !table.contains_key(&old) {
        return false;
    }
    if table.contains_key(&new) {
        error!(
            "protected dependency update {:#x} -> {:#x} would alias an existing entry",
            old, new
        );
        return false;
    }

    let Some(cell) = table.remove(&old) else {
        return false;
    };
    table.insert(new, cell);
    cell.target.store(new as *mut (), Ordering::SeqCst);
    fence(Ordering::SeqCst);

    debug!(
        "protected dependency '{}' re-pointed from {:#x} to {:#x}",
        cell.name, old, new
    );
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cells_are_seeded() {
        initialize();
        #[cfg(unix)]
        {
            assert!(!MPROTECT.get().is_null());
            assert!(!MMAP.get().is_null());
            assert!(is_registered(MPROTECT.get() as usize));
        }
        #[cfg(windows)]
        {
            assert!(!VIRTUAL_PROTECT.get().is_null());
            assert!(is_registered(VIRTUAL_PROTECT.get() as usize));
        }
    }

    #[test]
    fn test_update_unknown_address_is_noop() {
        initialize();
        assert!(!update(0xdead_0000, 0xbeef_0000));
        assert!(!is_registered(0xbeef_0000));
    }

    #[test]
    fn test_update_rejects_aliasing() {
        initialize();
        #[cfg(unix)]
        let (a, b) = (MPROTECT.get() as usize, MMAP.get() as usize);
        #[cfg(windows)]
        let (a, b) = (VIRTUAL_PROTECT.get() as usize, VIRTUAL_ALLOC.get() as usize);

        // Moving one dependency onto another's address must be refused and
        // must leave both cells untouched.
        assert!(!update(a, b));
        assert!(is_registered(a));
        assert!(is_registered(b));
    }

    #[cfg(unix)]
    #[test]
    fn test_update_repoints_cell_and_reverse_index() {
        use std::ffi::{c_int, c_void};
        use std::sync::atomic::AtomicUsize;

        static REAL_DLADDR: AtomicUsize = AtomicUsize::new(0);

        // Forwards to the saved real dladdr, so concurrent tests keep
        // working while the cell is re-pointed.
        unsafe extern "C" fn dladdr_shim(addr: *const c_void, info: *mut libc::Dl_info) -> c_int {
            let real: unsafe extern "C" fn(*const c_void, *mut libc::Dl_info) -> c_int =
                std::mem::transmute(REAL_DLADDR.load(Ordering::SeqCst));
            real(addr, info)
        }

        initialize();
        let old = DLADDR.get() as usize;
        REAL_DLADDR.store(old, Ordering::SeqCst);

        assert!(update(old, dladdr_shim as usize));
        assert_eq!(DLADDR.get() as usize, dladdr_shim as usize);
        assert!(is_registered(dladdr_shim as usize));
        assert!(!is_registered(old));

        // The old address is gone from the index, so a second move fails
        assert!(!update(old, 0x1234));

        // Restore for the rest of the test run
        assert!(update(dladdr_shim as usize, old));
        assert_eq!(DLADDR.get() as usize, old);
    }
}
