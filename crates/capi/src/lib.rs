//! C-compatible exports for the graft hooking engine.
//!
//! Status codes cross the boundary as the `i32` values of
//! [`graft_core::HookStatus`]; a code is success-like when it is less than
//! or equal to `GRAFT_NO_EFFECT` (1).

use std::ffi::c_void;
use std::ptr;

use graft_core::HookStatus;

/// Initializes logging and seeds the engine's internal tables.
///
/// Optional: every operation initializes the engine lazily. Logging is
/// configured from the `RUST_LOG` environment variable and is a no-op if
/// the host already installed a subscriber.
#[no_mangle]
pub extern "C" fn graft_initialize() -> bool {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    graft_core::initialize();
    tracing::debug!("graft initialized");
    true
}

/// Hooks `target` so that invoking it executes `replacement`.
///
/// # Safety
/// - `target` must be the entry of a function whose first bytes may be
///   rewritten
/// - `replacement` must remain a callable function of the same signature
///   for the life of the process
#[no_mangle]
pub unsafe extern "C" fn graft_create_hook(
    target: *mut c_void,
    replacement: *const c_void,
) -> HookStatus {
    graft_core::create_hook(target.cast(), replacement.cast())
}

/// Returns a callable pointer to the original behavior of a hooked
/// function, or null when `addr` (target or replacement) is not part of
/// any hook.
#[no_mangle]
pub extern "C" fn graft_get_original_function(addr: *const c_void) -> *const c_void {
    match graft_core::get_original_function(addr.cast()) {
        Some(original) => original.as_ptr() as *const c_void,
        None => ptr::null(),
    }
}

/// Re-points the hook identified by `addr` (target or current replacement)
/// at `new_replacement`.
#[no_mangle]
pub extern "C" fn graft_replace_hook_function(
    addr: *const c_void,
    new_replacement: *const c_void,
) -> HookStatus {
    graft_core::replace_hook_function(addr.cast(), new_replacement.cast())
}

/// Makes the hook identified by `addr` behave as if unhooked while keeping
/// it registered.
#[no_mangle]
pub extern "C" fn graft_disable_hook_function(addr: *const c_void) -> HookStatus {
    graft_core::disable_hook_function(addr.cast())
}
