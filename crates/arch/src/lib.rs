//! x86 instruction analysis for the graft hooking engine.
//!
//! Wraps the iced-x86 decoder and encoder with the small query surface the
//! trampoline builder needs: instruction length, control-flow class,
//! position-dependent operand introspection, and length-preserving
//! re-encoding at a new address. Everything here operates on byte slices
//! and addresses; nothing in this crate touches page protections or
//! executes code.

pub mod insn;
pub mod jump;

pub use insn::{Insn, InsnError};
pub use jump::{can_reach, fill_nop, write_jmp_rel32, JumpError, JMP_REL32_LEN, NOP};

/// Maximum length of a single x86 instruction, per the Intel SDM.
pub const MAX_INSN_LEN: usize = 15;

/// Decoder/encoder bitness matching the current process.
#[cfg(target_pointer_width = "64")]
pub(crate) const BITNESS: u32 = 64;
#[cfg(target_pointer_width = "32")]
pub(crate) const BITNESS: u32 = 32;

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("graft-arch supports x86 and x86-64 only");
