//! Operating-system services behind the protected-dependency cells.
//!
//! Everything here that maps to a hookable OS entry point (protection
//! changes, executable mappings, module lookups, cache flushes) loads the
//! routine's address from [`crate::deps`] at each call, so a user hooking
//! one of those routines does not turn the engine back on itself.

use std::io;

#[cfg(unix)]
pub(crate) use self::posix::*;
#[cfg(windows)]
pub(crate) use self::win32::*;

/// System page size; also the size of one trampoline store.
pub(crate) fn page_size() -> usize {
    region::page::size()
}

/// Previous protection of a patched range, handed back to
/// [`restore_protection`] verbatim.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PriorProtection(NativeProtection);

#[cfg(unix)]
mod posix {
    use std::ffi::{c_int, c_void};
    use std::mem;
    use std::sync::atomic::{fence, Ordering};

    use super::*;
    use crate::deps;

    pub(crate) type NativeProtection = c_int;

    type MprotectFn = unsafe extern "C" fn(*mut c_void, usize, c_int) -> c_int;
    type MmapFn =
        unsafe extern "C" fn(*mut c_void, usize, c_int, c_int, c_int, libc::off_t) -> *mut c_void;
    type MunmapFn = unsafe extern "C" fn(*mut c_void, usize) -> c_int;
    type DladdrFn = unsafe extern "C" fn(*const c_void, *mut libc::Dl_info) -> c_int;

    const PROT_RWX: c_int = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;

    /// `MAP_FIXED_NOREPLACE` makes a hinted mapping fail rather than land
    /// elsewhere; on other systems the result address is verified instead.
    #[cfg(target_os = "linux")]
    const HINTED_MAP_FLAGS: c_int =
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE;
    #[cfg(not(target_os = "linux"))]
    const HINTED_MAP_FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;

    unsafe fn protected_mprotect(addr: *mut c_void, len: usize, prot: c_int) -> c_int {
        let f: MprotectFn = mem::transmute(deps::MPROTECT.get());
        f(addr, len, prot)
    }

    unsafe fn protected_mmap(
        addr: *mut c_void,
        len: usize,
        prot: c_int,
        flags: c_int,
    ) -> *mut c_void {
        let f: MmapFn = mem::transmute(deps::MMAP.get());
        f(addr, len, prot, flags, -1, 0)
    }

    unsafe fn protected_munmap(addr: *mut c_void, len: usize) -> c_int {
        let f: MunmapFn = mem::transmute(deps::MUNMAP.get());
        f(addr, len)
    }

    unsafe fn protected_dladdr(addr: *const c_void, info: *mut libc::Dl_info) -> c_int {
        let f: DladdrFn = mem::transmute(deps::DLADDR.get());
        f(addr, info)
    }

    /// Initial addresses for the protected-dependency table. Resolved via
    /// `dlsym` so the cell holds the canonical libc entry point rather than
    /// this binary's PLT stub; the linked symbol is the fallback.
    pub(crate) fn protected_seed_addresses() -> Vec<(&'static deps::Cell, usize)> {
        fn resolve(name: &'static [u8], fallback: usize) -> usize {
            let sym = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr().cast()) };
            if sym.is_null() {
                fallback
            } else {
                sym as usize
            }
        }

        vec![
            (&deps::MPROTECT, resolve(b"mprotect\0", libc::mprotect as usize)),
            (&deps::MMAP, resolve(b"mmap\0", libc::mmap as usize)),
            (&deps::MUNMAP, resolve(b"munmap\0", libc::munmap as usize)),
            (&deps::DLADDR, resolve(b"dladdr\0", libc::dladdr as usize)),
        ]
    }

    fn page_span(addr: usize, len: usize) -> (usize, usize) {
        let page = page_size();
        let start = addr & !(page - 1);
        (start, addr + len - start)
    }

    /// Makes `[addr, addr + len)` writable and executable, returning the
    /// protection it had before.
    pub(crate) fn unprotect(addr: usize, len: usize) -> io::Result<PriorProtection> {
        let current = region::query(addr as *const u8).map_err(io::Error::other)?;
        let prior = protection_to_native(current.protection());

        let (start, span) = page_span(addr, len);
        let rc = unsafe { protected_mprotect(start as *mut c_void, span, PROT_RWX) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(PriorProtection(prior))
    }

    pub(crate) fn restore_protection(
        addr: usize,
        len: usize,
        prior: PriorProtection,
    ) -> io::Result<()> {
        let (start, span) = page_span(addr, len);
        let rc = unsafe { protected_mprotect(start as *mut c_void, span, prior.0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Maps `size` bytes of read-write-execute memory, at exactly
    /// `preferred` when given. A hinted mapping that lands anywhere else is
    /// released and reported as a failure, since it is useless for near
    /// placement.
    pub(crate) fn alloc_executable(preferred: Option<usize>, size: usize) -> Option<usize> {
        let flags = match preferred {
            Some(_) => HINTED_MAP_FLAGS,
            None => libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        };
        let hint = preferred.unwrap_or(0) as *mut c_void;

        let mapped = unsafe { protected_mmap(hint, size, PROT_RWX, flags) };
        if mapped == libc::MAP_FAILED {
            return None;
        }
        let address = mapped as usize;
        if let Some(want) = preferred {
            if address != want {
                unsafe { protected_munmap(mapped, size) };
                return None;
            }
        }
        Some(address)
    }

    pub(crate) fn free_executable(addr: usize, size: usize) {
        unsafe { protected_munmap(addr as *mut c_void, size) };
    }

    /// Base address of the memory region holding `addr`: the containing
    /// module's load base when the address belongs to a mapped object,
    /// otherwise the start of its mapping.
    pub(crate) fn allocation_base(addr: usize) -> Option<usize> {
        let mut info: libc::Dl_info = unsafe { mem::zeroed() };
        let rc = unsafe { protected_dladdr(addr as *const c_void, &mut info) };
        if rc != 0 && !info.dli_fbase.is_null() {
            return Some(info.dli_fbase as usize);
        }
        region::query(addr as *const u8)
            .ok()
            .map(|r| r.as_ptr::<u8>() as usize)
    }

    /// x86 keeps instruction fetch coherent with same-process stores; all
    /// that is needed is that the patch is globally visible before anyone
    /// jumps through it.
    pub(crate) fn flush_instruction_cache(_addr: usize, _len: usize) {
        fence(Ordering::SeqCst);
    }

    fn protection_to_native(protection: region::Protection) -> c_int {
        let mut native = libc::PROT_NONE;
        if protection.contains(region::Protection::READ) {
            native |= libc::PROT_READ;
        }
        if protection.contains(region::Protection::WRITE) {
            native |= libc::PROT_WRITE;
        }
        if protection.contains(region::Protection::EXECUTE) {
            native |= libc::PROT_EXEC;
        }
        native
    }
}

#[cfg(windows)]
mod win32 {
    use std::ffi::c_void;
    use std::mem;

    use windows_sys::Win32::Foundation::HMODULE;
    use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows_sys::Win32::System::LibraryLoader::{
        GetModuleHandleExW, GetModuleHandleW, GetProcAddress,
        GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS, GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
    };
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION,
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };
    use windows_sys::Win32::System::Threading::GetCurrentProcess;

    use super::*;
    use crate::deps;

    pub(crate) type NativeProtection = u32;

    type VirtualProtectFn =
        unsafe extern "system" fn(*const c_void, usize, u32, *mut u32) -> i32;
    type VirtualAllocFn = unsafe extern "system" fn(*const c_void, usize, u32, u32) -> *mut c_void;
    type VirtualFreeFn = unsafe extern "system" fn(*mut c_void, usize, u32) -> i32;
    type VirtualQueryFn =
        unsafe extern "system" fn(*const c_void, *mut MEMORY_BASIC_INFORMATION, usize) -> usize;
    type FlushInstructionCacheFn =
        unsafe extern "system" fn(*mut c_void, *const c_void, usize) -> i32;
    type GetModuleHandleExWFn =
        unsafe extern "system" fn(u32, *const u16, *mut HMODULE) -> i32;
    type GetLastErrorFn = unsafe extern "system" fn() -> u32;

    /// Initial addresses for the protected-dependency table, resolved from
    /// kernel32 via `GetProcAddress` so the cell value matches what a user
    /// hooking the export would pass as a target; the import-table address
    /// is the fallback.
    pub(crate) fn protected_seed_addresses() -> Vec<(&'static deps::Cell, usize)> {
        let kernel32: Vec<u16> = "kernel32.dll\0".encode_utf16().collect();
        let module = unsafe { GetModuleHandleW(kernel32.as_ptr()) };

        let resolve = |name: &'static [u8], fallback: usize| -> usize {
            if module.is_null() {
                return fallback;
            }
            match unsafe { GetProcAddress(module, name.as_ptr()) } {
                Some(f) => f as usize,
                None => fallback,
            }
        };

        vec![
            (
                &deps::VIRTUAL_PROTECT,
                resolve(b"VirtualProtect\0", VirtualProtect as usize),
            ),
            (
                &deps::VIRTUAL_ALLOC,
                resolve(b"VirtualAlloc\0", VirtualAlloc as usize),
            ),
            (
                &deps::VIRTUAL_FREE,
                resolve(b"VirtualFree\0", VirtualFree as usize),
            ),
            (
                &deps::VIRTUAL_QUERY,
                resolve(b"VirtualQuery\0", VirtualQuery as usize),
            ),
            (
                &deps::FLUSH_INSTRUCTION_CACHE,
                resolve(b"FlushInstructionCache\0", FlushInstructionCache as usize),
            ),
            (
                &deps::GET_MODULE_HANDLE_EX_W,
                resolve(b"GetModuleHandleExW\0", GetModuleHandleExW as usize),
            ),
            (
                &deps::GET_LAST_ERROR,
                resolve(
                    b"GetLastError\0",
                    windows_sys::Win32::Foundation::GetLastError as usize,
                ),
            ),
        ]
    }

    fn last_error() -> io::Error {
        let get_last_error: GetLastErrorFn =
            unsafe { mem::transmute(deps::GET_LAST_ERROR.get()) };
        io::Error::from_raw_os_error(unsafe { get_last_error() } as i32)
    }

    pub(crate) fn unprotect(addr: usize, len: usize) -> io::Result<PriorProtection> {
        let virtual_protect: VirtualProtectFn =
            unsafe { mem::transmute(deps::VIRTUAL_PROTECT.get()) };
        let mut prior = 0u32;
        let ok = unsafe {
            virtual_protect(addr as *const c_void, len, PAGE_EXECUTE_READWRITE, &mut prior)
        };
        if ok == 0 {
            return Err(last_error());
        }
        Ok(PriorProtection(prior))
    }

    pub(crate) fn restore_protection(
        addr: usize,
        len: usize,
        prior: PriorProtection,
    ) -> io::Result<()> {
        let virtual_protect: VirtualProtectFn =
            unsafe { mem::transmute(deps::VIRTUAL_PROTECT.get()) };
        let mut unused = 0u32;
        let ok = unsafe { virtual_protect(addr as *const c_void, len, prior.0, &mut unused) };
        if ok == 0 {
            return Err(last_error());
        }
        Ok(())
    }

    /// Commits `size` bytes of read-write-execute memory, near `preferred`
    /// when given. The kernel rounds a preferred base down to the
    /// allocation granularity, so the returned address may differ from the
    /// hint; the caller decides whether it is close enough.
    pub(crate) fn alloc_executable(preferred: Option<usize>, size: usize) -> Option<usize> {
        let virtual_alloc: VirtualAllocFn = unsafe { mem::transmute(deps::VIRTUAL_ALLOC.get()) };
        let base = unsafe {
            virtual_alloc(
                preferred.unwrap_or(0) as *const c_void,
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            )
        };
        if base.is_null() {
            None
        } else {
            Some(base as usize)
        }
    }

    pub(crate) fn free_executable(addr: usize, _size: usize) {
        let virtual_free: VirtualFreeFn = unsafe { mem::transmute(deps::VIRTUAL_FREE.get()) };
        unsafe { virtual_free(addr as *mut c_void, 0, MEM_RELEASE) };
    }

    /// Base address of the memory region holding `addr`: the module base
    /// when the address is inside a loaded image, otherwise the allocation
    /// base reported by `VirtualQuery`.
    pub(crate) fn allocation_base(addr: usize) -> Option<usize> {
        let get_module_handle_ex: GetModuleHandleExWFn =
            unsafe { mem::transmute(deps::GET_MODULE_HANDLE_EX_W.get()) };
        let mut module: HMODULE = std::ptr::null_mut();
        let ok = unsafe {
            get_module_handle_ex(
                GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
                addr as *const u16,
                &mut module,
            )
        };
        if ok != 0 && !module.is_null() {
            return Some(module as usize);
        }

        let virtual_query: VirtualQueryFn = unsafe { mem::transmute(deps::VIRTUAL_QUERY.get()) };
        let mut info: MEMORY_BASIC_INFORMATION = unsafe { mem::zeroed() };
        let written =
            unsafe { virtual_query(addr as *const c_void, &mut info, mem::size_of_val(&info)) };
        if written == mem::size_of::<MEMORY_BASIC_INFORMATION>() {
            Some(info.AllocationBase as usize)
        } else {
            None
        }
    }

    pub(crate) fn flush_instruction_cache(addr: usize, len: usize) {
        let flush: FlushInstructionCacheFn =
            unsafe { mem::transmute(deps::FLUSH_INSTRUCTION_CACHE.get()) };
        unsafe { flush(GetCurrentProcess(), addr as *const c_void, len) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(size.is_power_of_two());
        assert!(size >= 4096);
    }

    #[test]
    fn test_alloc_executable_anywhere() {
        let size = page_size();
        let addr = alloc_executable(None, size).expect("mapping failed");
        assert_ne!(addr, 0);

        // The fresh page must be writable and executable
        let info = region::query(addr as *const u8).unwrap();
        assert!(info.protection().contains(region::Protection::EXECUTE));
        assert!(info.protection().contains(region::Protection::WRITE));

        free_executable(addr, size);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_alloc_executable_honors_hint() {
        let size = page_size();
        // Pick a hole well away from anything mapped by picking an address
        // relative to a fresh anonymous mapping.
        let probe = alloc_executable(None, size).unwrap();
        let hint = probe + size * 16;

        if let Some(addr) = alloc_executable(Some(hint), size) {
            assert_eq!(addr, hint);
            free_executable(addr, size);
        }
        free_executable(probe, size);
    }

    #[test]
    fn test_unprotect_restore_roundtrip() {
        let size = page_size();
        let addr = alloc_executable(None, size).unwrap();

        let prior = unprotect(addr, 5).expect("unprotect failed");
        // Still writable afterwards
        unsafe { (addr as *mut u8).write(0x90) };
        restore_protection(addr, 5, prior).expect("restore failed");

        free_executable(addr, size);
    }

    #[test]
    fn test_allocation_base_of_function() {
        // A function in this test binary resolves to the binary's image base
        let base = allocation_base(test_allocation_base_of_function as usize);
        assert!(base.is_some());
        assert!(base.unwrap() <= test_allocation_base_of_function as usize);
    }

    #[test]
    fn test_allocation_base_of_anonymous_mapping() {
        let size = page_size();
        let addr = alloc_executable(None, size).unwrap();
        // Adjacent anonymous mappings with equal permissions may be
        // reported as one region, so the base can sit below our page.
        let base = allocation_base(addr + 16).expect("no base for mapping");
        assert!(base <= addr);
        free_executable(addr, size);
    }
}
