//! graft core - in-process function hooking for x86/x86-64.
//!
//! Callers hand the engine pairs of machine-code addresses: a *target* to
//! intercept and a *replacement* to run instead. [`create_hook`] rewrites
//! the head of the target with a 5-byte relative jump and relocates the
//! displaced instructions into a per-hook [`trampoline::Trampoline`], so
//! [`get_original_function`] can hand back a callable pointer to the
//! unaltered behavior. The whole engine runs inside the hooked process.
//!
//! # Example
//!
//! ```ignore
//! unsafe {
//!     let status = graft_core::create_hook(target_addr, my_replacement as *const u8);
//!     assert!(status.is_success());
//!     let original: extern "C" fn() -> i32 = std::mem::transmute(
//!         graft_core::get_original_function(target_addr).unwrap().as_ptr(),
//!     );
//! }
//! ```
//!
//! Targets and replacements are raw code addresses; nothing here can check
//! their signatures. Wrap the pointer returned by [`get_original_function`]
//! in the correct function-pointer type at the call site.

mod deps;
mod os;

pub mod registry;
pub mod result;
pub mod store;
pub mod trampoline;

pub use registry::{
    create_hook, disable_hook_function, get_original_function, replace_hook_function,
};
pub use result::HookStatus;

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("graft-core supports x86 and x86-64 only");

/// Seeds the protected-dependency table and the registry. Idempotent, and
/// performed lazily by every operation anyway; calling it up front just
/// moves the one-time cost out of the first hook.
pub fn initialize() {
    registry::warm_up();
}
