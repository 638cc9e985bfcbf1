//! The process-wide hook registry.
//!
//! One reader/writer lock guards every map and every trampoline store.
//! Writers (`create_hook`, `replace_hook_function`, `disable_hook_function`)
//! hold it across all of their side effects, page-protection changes and
//! cache flushes included, so a reader (`get_original_function`) observes
//! either the pre- or post-operation state and never a torn one.

use std::collections::HashMap;
use std::io;
use std::ptr::NonNull;
use std::slice;
use std::sync::LazyLock;

use graft_arch::{jump, JumpError};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::deps;
use crate::os;
use crate::result::HookStatus;
use crate::store::TrampolineStore;
use crate::trampoline::Trampoline;

static REGISTRY: LazyLock<RwLock<Registry>> = LazyLock::new(|| {
    deps::initialize();
    RwLock::new(Registry::new())
});

/// Forces lazy initialization of the registry and the protected-dependency
/// table. All operations also do this on first use.
pub(crate) fn warm_up() {
    LazyLock::force(&REGISTRY);
}

struct Registry {
    /// Both the target and the current replacement of each live hook map to
    /// the trampoline serving it.
    functions: HashMap<usize, usize>,
    /// Trampoline back to the target it was built for.
    originals: HashMap<usize, usize>,
    stores: Vec<TrampolineStore>,
    /// 64-bit placement: allocation base of hooked targets to the store
    /// indices serving that base, in placement order.
    #[cfg(target_pointer_width = "64")]
    stores_by_base: HashMap<usize, Vec<usize>>,
}

/// Installs a hook from `target` to `replacement`.
///
/// On success any thread entering `target` afterwards executes
/// `replacement`, and [`get_original_function`] yields a callable pointer
/// to the displaced original behavior.
///
/// # Safety
///
/// `target` must be the entry of a function whose first bytes may be
/// rewritten: readable, executable machine code not concurrently executed
/// past recognition. `replacement` must stay callable for the life of the
/// process.
pub unsafe fn create_hook(target: *mut u8, replacement: *const u8) -> HookStatus {
    let target = target as usize;
    let replacement = replacement as usize;

    if !is_hook_spec_valid(target, replacement) {
        return HookStatus::BadArg;
    }

    REGISTRY.write().create(target, replacement)
}

/// Callable pointer to the original behavior of a hooked function. `addr`
/// may be either side of the hook: the target or the current replacement.
pub fn get_original_function(addr: *const u8) -> Option<NonNull<u8>> {
    let registry = REGISTRY.read();
    let trampoline = *registry.functions.get(&(addr as usize))?;
    // SAFETY: indexed trampolines are never freed or moved.
    let trampoline = unsafe { &*(trampoline as *const Trampoline) };
    NonNull::new(trampoline.original_entry() as *mut u8)
}

/// Re-points an existing hook at `new_replacement`. `addr` may be either
/// side of the hook.
pub fn replace_hook_function(addr: *const u8, new_replacement: *const u8) -> HookStatus {
    REGISTRY
        .write()
        .replace(addr as usize, new_replacement as usize)
}

/// Makes invocations of the hooked target behave as if unhooked, by
/// re-pointing the hook stub at the trampoline's relocated prologue. The
/// hook stays registered and can be re-enabled with
/// [`replace_hook_function`].
pub fn disable_hook_function(addr: *const u8) -> HookStatus {
    let original = match get_original_function(addr) {
        Some(ptr) => ptr.as_ptr() as usize,
        None => return HookStatus::NotFound,
    };
    replace_hook_function(addr, original as *const u8)
}

impl Registry {
    fn new() -> Self {
        Self {
            functions: HashMap::new(),
            originals: HashMap::new(),
            stores: Vec::new(),
            #[cfg(target_pointer_width = "64")]
            stores_by_base: HashMap::new(),
        }
    }

    unsafe fn create(&mut self, target: usize, replacement: usize) -> HookStatus {
        if self.functions.contains_key(&target) || self.functions.contains_key(&replacement) {
            return HookStatus::Duplicate;
        }

        // Hooking a trampoline would corrupt the engine's own code.
        if self.stores.iter().any(|store| store.contains(target)) {
            return HookStatus::BadArg;
        }

        let store_index = match self.store_for_target(target) {
            Ok(index) => index,
            Err(status) => return status,
        };
        let store = &mut self.stores[store_index];
        if !store.is_initialized() {
            return HookStatus::Internal;
        }
        let Some(slot) = store.allocate_slot() else {
            return HookStatus::AllocFail;
        };
        let trampoline_ptr = store.get(slot);
        // SAFETY: the slot was just vended; nothing else references it yet.
        let trampoline = &mut *trampoline_ptr;

        trampoline.set_hook_function(replacement);
        if let Err(error) = trampoline.set_original_function(target) {
            debug!("failed to build a trampoline for {:#x}: {}", target, error);
            self.stores[store_index].deallocate_last();
            return HookStatus::CannotSet;
        }

        // If the target is one of the engine's own OS dependencies, keep
        // internal calls on the unhooked path from now on.
        let original_entry = trampoline.original_entry() as usize;
        let dependency_updated = deps::update(target, original_entry);

        if let Err(error) = redirect_execution(target, trampoline.hook_entry() as usize) {
            warn!("failed to redirect {:#x}: {}", target, error);
            if dependency_updated {
                deps::update(original_entry, target);
            }
            self.stores[store_index].deallocate_last();
            return HookStatus::CannotSet;
        }

        let trampoline_addr = trampoline_ptr as usize;
        self.functions.insert(target, trampoline_addr);
        self.functions.insert(replacement, trampoline_addr);
        self.originals.insert(trampoline_addr, target);

        info!(
            "hooked {:#x} -> {:#x} via trampoline at {:#x}",
            target, replacement, trampoline_addr
        );
        HookStatus::Success
    }

    fn replace(&mut self, addr: usize, new_replacement: usize) -> HookStatus {
        let Some(&trampoline_addr) = self.functions.get(&addr) else {
            return HookStatus::NotFound;
        };
        let Some(&target) = self.originals.get(&trampoline_addr) else {
            return HookStatus::Internal;
        };
        // SAFETY: indexed trampolines are never freed or moved; the write
        // lock makes this the only live reference.
        let trampoline = unsafe { &mut *(trampoline_addr as *mut Trampoline) };

        let old_replacement = trampoline.hook_target();
        if old_replacement == new_replacement {
            return HookStatus::NoEffect;
        }
        if !self.functions.contains_key(&target) || !self.functions.contains_key(&old_replacement)
        {
            return HookStatus::Internal;
        }
        if self.functions.contains_key(&new_replacement) {
            return HookStatus::Duplicate;
        }
        if !is_hook_spec_valid(target, new_replacement) {
            return HookStatus::BadArg;
        }

        trampoline.set_hook_function(new_replacement);
        self.functions.remove(&old_replacement);
        self.functions.insert(new_replacement, trampoline_addr);

        info!("hook on {:#x} re-pointed to {:#x}", target, new_replacement);
        HookStatus::Success
    }

    /// Index of a store with a free slot able to serve `target`.
    ///
    /// Trampolines must sit within rel32 reach of their targets, so stores
    /// are placed just below the allocation base of the region being
    /// hooked: propose `base - store_size` rounded down to a store-size
    /// multiple, then walk downward page by page — skipping proposals a
    /// previous placement already consumed — for a bounded number of
    /// attempts.
    #[cfg(target_pointer_width = "64")]
    fn store_for_target(&mut self, target: usize) -> Result<usize, HookStatus> {
        let Some(base) = os::allocation_base(target) else {
            return Err(HookStatus::Internal);
        };

        if let Some(&last) = self.stores_by_base.get(&base).and_then(|v| v.last()) {
            if self.stores[last].free_count() > 0 {
                return Ok(last);
            }
        }

        let store_size = TrampolineStore::store_size();
        let attempt_limit = (i32::MAX as usize / store_size) / 4;

        let mut candidate = base.wrapping_sub(store_size) & !(store_size - 1);
        let mut attempts = 0usize;
        if let Some(&last) = self.stores_by_base.get(&base).and_then(|v| v.last()) {
            let lowest = self.stores[last].base_address();
            attempts = 1 + candidate.saturating_sub(lowest) / store_size;
            candidate = lowest.wrapping_sub(store_size);
        }

        while attempts < attempt_limit && candidate >= store_size {
            let store = TrampolineStore::with_base(candidate);
            if store.is_initialized() && jump::can_reach(target, store.base_address()) {
                let index = self.stores.len();
                debug!(
                    "placed trampoline store at {:#x} for base {:#x} after {} attempt(s)",
                    store.base_address(),
                    base,
                    attempts
                );
                self.stores.push(store);
                self.stores_by_base.entry(base).or_default().push(index);
                return Ok(index);
            }
            attempts += 1;
            candidate -= store_size;
        }

        warn!(
            "no trampoline store within rel32 reach of {:#x} (base {:#x})",
            target, base
        );
        Err(HookStatus::AllocFail)
    }

    /// 32-bit: every address is within rel32 reach of every other, so all
    /// stores live in one growing list.
    #[cfg(target_pointer_width = "32")]
    fn store_for_target(&mut self, _target: usize) -> Result<usize, HookStatus> {
        let needs_new = match self.stores.last() {
            Some(store) => store.free_count() == 0,
            None => true,
        };
        if needs_new {
            self.stores.push(TrampolineStore::new());
        }
        Ok(self.stores.len() - 1)
    }
}

#[derive(Debug, Error)]
enum RedirectError {
    #[error(transparent)]
    Jump(#[from] JumpError),

    #[error(transparent)]
    Os(#[from] io::Error),
}

/// Overwrites the first five bytes of `from` with a jump to `to`:
/// unprotect, write, restore, flush, all under the registry's write lock.
/// On failure the original bytes are back in place.
unsafe fn redirect_execution(from: usize, to: usize) -> Result<(), RedirectError> {
    let prior = os::unprotect(from, jump::JMP_REL32_LEN)?;
    let patch = slice::from_raw_parts_mut(from as *mut u8, jump::JMP_REL32_LEN);
    let mut saved = [0u8; jump::JMP_REL32_LEN];
    saved.copy_from_slice(patch);

    let written = jump::write_jmp_rel32(patch, to);

    if let Err(error) = os::restore_protection(from, jump::JMP_REL32_LEN, prior) {
        // The page is still writable; put the original bytes back so a
        // failed create leaves the target untouched.
        patch.copy_from_slice(&saved);
        os::flush_instruction_cache(from, jump::JMP_REL32_LEN);
        return Err(error.into());
    }

    os::flush_instruction_cache(from, jump::JMP_REL32_LEN);
    written?;
    Ok(())
}

/// Validity and safety checks shared by create and replace.
fn is_hook_spec_valid(target: usize, replacement: usize) -> bool {
    if target == 0 || replacement == 0 {
        return false;
    }
    // The replacement may not live inside the bytes the redirect overwrites
    if replacement >= target && replacement < target + jump::JMP_REL32_LEN {
        return false;
    }
    // Hooking the engine itself is forbidden
    if let (Some(target_base), Some(own_base)) =
        (os::allocation_base(target), engine_base())
    {
        if target_base == own_base {
            return false;
        }
    }
    true
}

fn engine_base() -> Option<usize> {
    os::allocation_base(engine_marker as usize)
}

fn engine_marker() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::HookStatus;

    #[test]
    fn test_null_arguments_are_rejected() {
        let status = unsafe { create_hook(std::ptr::null_mut(), 0x1000 as *const u8) };
        assert_eq!(status, HookStatus::BadArg);
        let status = unsafe { create_hook(0x1000 as *mut u8, std::ptr::null()) };
        assert_eq!(status, HookStatus::BadArg);
    }

    #[test]
    fn test_replacement_inside_patch_window_is_rejected() {
        let target = 0x40_0000usize;
        for offset in 0..jump::JMP_REL32_LEN {
            let status = unsafe {
                create_hook(target as *mut u8, (target + offset) as *const u8)
            };
            assert_eq!(status, HookStatus::BadArg);
        }
    }

    #[test]
    fn test_hooking_the_engine_is_rejected() {
        let status = unsafe {
            create_hook(engine_marker as usize as *mut u8, 0x1000 as *const u8)
        };
        assert_eq!(status, HookStatus::BadArg);
    }

    #[test]
    fn test_lookup_of_unknown_address() {
        assert!(get_original_function(0x7777_0000 as *const u8).is_none());
        assert_eq!(
            replace_hook_function(0x7777_0000 as *const u8, 0x7777_1000 as *const u8),
            HookStatus::NotFound
        );
        assert_eq!(
            disable_hook_function(0x7777_0000 as *const u8),
            HookStatus::NotFound
        );
    }

    // Everything below builds real machine code, hooks it, and runs it.
    #[cfg(target_arch = "x86_64")]
    mod exec {
        use std::mem;
        use std::ptr;
        use std::slice;

        use super::super::*;
        use crate::result::HookStatus;

        type IntFn = unsafe extern "C" fn() -> i32;

        /// Maps a fresh executable page holding `bytes` followed by `int 3`
        /// padding.
        fn make_code(bytes: &[u8]) -> usize {
            let page = os::page_size();
            let addr = os::alloc_executable(None, page).expect("executable page");
            unsafe {
                ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
                slice::from_raw_parts_mut((addr as *mut u8).add(bytes.len()), page - bytes.len())
                    .fill(0xcc);
            }
            os::flush_instruction_cache(addr, page);
            addr
        }

        /// `mov eax, value; ret`
        fn ret_const(value: i32) -> Vec<u8> {
            let mut code = vec![0xb8];
            code.extend_from_slice(&value.to_le_bytes());
            code.push(0xc3);
            code
        }

        fn make_replacement(value: i32) -> usize {
            make_code(&ret_const(value))
        }

        unsafe fn call(addr: usize) -> i32 {
            let f: IntFn = mem::transmute(addr);
            f()
        }

        #[test]
        fn test_create_hook_redirects_and_preserves_original() {
            let target = make_code(&ret_const(7));
            let replacement = make_replacement(4242);
            assert_eq!(unsafe { call(target) }, 7);

            let status = unsafe { create_hook(target as *mut u8, replacement as *const u8) };
            assert_eq!(status, HookStatus::Success);
            assert_eq!(unsafe { call(target) }, 4242);

            let original = get_original_function(target as *const u8).expect("original");
            assert_eq!(unsafe { call(original.as_ptr() as usize) }, 7);

            // Either side of the hook resolves to the same trampoline
            let via_replacement =
                get_original_function(replacement as *const u8).expect("original via replacement");
            assert_eq!(original, via_replacement);

            // The redirect is a rel32 jump, so the trampoline must be
            // within signed 32-bit reach of the target
            let distance = (original.as_ptr() as i64) - (target as i64);
            assert!(distance.abs() <= i32::MAX as i64);
        }

        #[test]
        fn test_duplicate_create_is_rejected_and_harmless() {
            let target = make_code(&ret_const(1));
            let replacement = make_replacement(2);

            assert_eq!(
                unsafe { create_hook(target as *mut u8, replacement as *const u8) },
                HookStatus::Success
            );
            assert_eq!(
                unsafe { create_hook(target as *mut u8, make_replacement(3) as *const u8) },
                HookStatus::Duplicate
            );
            // Reusing the replacement is just as much of a duplicate
            assert_eq!(
                unsafe { create_hook(make_code(&ret_const(4)) as *mut u8, replacement as *const u8) },
                HookStatus::Duplicate
            );
            assert_eq!(unsafe { call(target) }, 2);
        }

        #[test]
        fn test_short_padded_prologue_hooks_end_to_end() {
            // xor eax, eax; ret -- only three bytes of code; the patch
            // window is completed by the int3 padding that follows.
            let target = make_code(&[0x31, 0xc0, 0xc3]);
            let replacement = make_replacement(555);
            assert_eq!(unsafe { call(target) }, 0);

            assert_eq!(
                unsafe { create_hook(target as *mut u8, replacement as *const u8) },
                HookStatus::Success
            );
            assert_eq!(unsafe { call(target) }, 555);

            let original = get_original_function(target as *const u8).unwrap();
            assert_eq!(unsafe { call(original.as_ptr() as usize) }, 0);
        }

        #[test]
        fn test_disable_and_replace_roundtrip() {
            let target = make_code(&ret_const(10));
            let first = make_replacement(11);
            let second = make_replacement(12);

            assert_eq!(
                unsafe { create_hook(target as *mut u8, first as *const u8) },
                HookStatus::Success
            );
            assert_eq!(unsafe { call(target) }, 11);

            // Disable: the target behaves as if unhooked
            assert_eq!(
                disable_hook_function(target as *const u8),
                HookStatus::Success
            );
            assert_eq!(unsafe { call(target) }, 10);
            assert_eq!(
                disable_hook_function(target as *const u8),
                HookStatus::NoEffect
            );

            // The original pointer stays valid while disabled
            let original = get_original_function(target as *const u8).unwrap();
            assert_eq!(unsafe { call(original.as_ptr() as usize) }, 10);

            // Replace restores the post-create state
            assert_eq!(
                replace_hook_function(target as *const u8, first as *const u8),
                HookStatus::Success
            );
            assert_eq!(unsafe { call(target) }, 11);
            assert_eq!(
                replace_hook_function(target as *const u8, first as *const u8),
                HookStatus::NoEffect
            );

            // Re-pointing at a different replacement, addressed by the old
            // replacement
            assert_eq!(
                replace_hook_function(first as *const u8, second as *const u8),
                HookStatus::Success
            );
            assert_eq!(unsafe { call(target) }, 12);
        }

        #[test]
        fn test_unrelocatable_target_fails_cleanly() {
            // A bare `ret` cannot donate five bytes, and the real code
            // right behind it means there is no padding to absorb.
            let mut bytes = vec![0xc3];
            bytes.extend_from_slice(&ret_const(9));
            let target = make_code(&bytes);
            let replacement = make_replacement(13);

            assert_eq!(
                unsafe { create_hook(target as *mut u8, replacement as *const u8) },
                HookStatus::CannotSet
            );
            assert!(get_original_function(target as *const u8).is_none());

            // Not a single byte of the target was altered
            let after = unsafe { slice::from_raw_parts(target as *const u8, bytes.len()) };
            assert_eq!(after, &bytes[..]);
        }

        #[test]
        fn test_rip_relative_load_survives_relocation() {
            // mov eax, [rip + disp]; ret -- reads a constant placed later
            // in the same page, so relocating the load must re-aim it at
            // the same absolute address.
            const CONSTANT_OFFSET: usize = 0x40;
            const CONSTANT: u32 = 0x1234_5678;

            let target = {
                let disp = (CONSTANT_OFFSET as i32 - 6).to_le_bytes();
                let code = [0x8b, 0x05, disp[0], disp[1], disp[2], disp[3], 0xc3];
                let addr = make_code(&code);
                unsafe {
                    ((addr + CONSTANT_OFFSET) as *mut u32).write(CONSTANT);
                }
                addr
            };
            assert_eq!(unsafe { call(target) }, CONSTANT as i32);

            let replacement = make_replacement(77);
            assert_eq!(
                unsafe { create_hook(target as *mut u8, replacement as *const u8) },
                HookStatus::Success
            );
            assert_eq!(unsafe { call(target) }, 77);

            let original = get_original_function(target as *const u8).unwrap();
            assert_eq!(unsafe { call(original.as_ptr() as usize) }, CONSTANT as i32);
        }

        #[test]
        fn test_replace_validates_the_new_replacement() {
            let target = make_code(&ret_const(20));
            let replacement = make_replacement(21);
            assert_eq!(
                unsafe { create_hook(target as *mut u8, replacement as *const u8) },
                HookStatus::Success
            );

            // Inside the patch window
            assert_eq!(
                replace_hook_function(target as *const u8, (target + 2) as *const u8),
                HookStatus::BadArg
            );
            // Already part of this hook
            assert_eq!(
                replace_hook_function(target as *const u8, target as *const u8),
                HookStatus::Duplicate
            );
            assert_eq!(unsafe { call(target) }, 21);
        }

        #[test]
        fn test_concurrent_creates() {
            let pairs: Vec<(usize, usize)> = (0..8)
                .map(|i| (make_code(&ret_const(100 + i)), make_replacement(200 + i)))
                .collect();

            std::thread::scope(|scope| {
                for &(target, replacement) in &pairs {
                    scope.spawn(move || {
                        let status =
                            unsafe { create_hook(target as *mut u8, replacement as *const u8) };
                        assert_eq!(status, HookStatus::Success);
                    });
                }
            });

            for (i, &(target, _)) in pairs.iter().enumerate() {
                assert_eq!(unsafe { call(target) }, 200 + i as i32);
                let original = get_original_function(target as *const u8).unwrap();
                assert_eq!(unsafe { call(original.as_ptr() as usize) }, 100 + i as i32);
            }
        }

        /// Hooking the page-protection routine itself must not break the
        /// engine: its own calls go through the protected-dependency cell.
        #[cfg(unix)]
        #[test]
        fn test_hooking_the_protection_routine_keeps_engine_working() {
            use std::ffi::{c_int, c_void};
            use std::sync::atomic::{AtomicUsize, Ordering};

            static DENY_PAGE: AtomicUsize = AtomicUsize::new(0);

            unsafe extern "C" fn deny_mprotect(
                addr: *mut c_void,
                len: usize,
                prot: c_int,
            ) -> c_int {
                if addr as usize == DENY_PAGE.load(Ordering::SeqCst) {
                    return -1;
                }
                let original = get_original_function(deny_mprotect as *const u8)
                    .expect("hook must be registered");
                let f: unsafe extern "C" fn(*mut c_void, usize, c_int) -> c_int =
                    mem::transmute(original.as_ptr());
                f(addr, len, prot)
            }

            crate::initialize();
            let mprotect_entry = crate::deps::MPROTECT.get() as usize;
            let status = unsafe {
                create_hook(mprotect_entry as *mut u8, deny_mprotect as *const u8)
            };
            assert_eq!(status, HookStatus::Success);

            // The public entry point now runs the replacement...
            let page = os::page_size();
            let target = make_code(&ret_const(40));
            DENY_PAGE.store(target & !(page - 1), Ordering::SeqCst);
            let denied = unsafe {
                libc::mprotect(
                    target as *mut c_void,
                    page,
                    libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                )
            };
            assert_eq!(denied, -1, "the hook should have denied this call");

            // ...but the engine reaches the real routine through its cell,
            // so hooking code in the denied page still succeeds.
            let replacement = make_replacement(41);
            assert_eq!(
                unsafe { create_hook(target as *mut u8, replacement as *const u8) },
                HookStatus::Success
            );
            assert_eq!(unsafe { call(target) }, 41);

            DENY_PAGE.store(0, Ordering::SeqCst);
        }
    }
}
