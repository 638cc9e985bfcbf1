//! Executable trampoline records.
//!
//! A trampoline is a 64-byte, 16-byte-aligned block of executable memory
//! with two regions. The *hook stub* (16 bytes) transfers control to the
//! current replacement function; only its trailing address word is ever
//! rewritten after construction. The *relocated prologue* (48 bytes) holds
//! the instructions displaced from the head of the hooked function,
//! re-encoded for their new location, and — unless the transplant ended in
//! a terminal instruction — a jump back into the rest of the original
//! function. Jump-assist stubs for short branches grow down from the high
//! end of that region.

use std::slice;

use graft_arch::{insn::Insn, jump, InsnError, JumpError, MAX_INSN_LEN};
use thiserror::Error;
use tracing::{debug, warn};

use crate::os;

/// Total size of a trampoline, in bytes.
pub const TRAMPOLINE_SIZE: usize = 64;

/// Size of the hook-stub region. Must be divisible by the pointer size.
pub const HOOK_REGION_SIZE: usize = TRAMPOLINE_SIZE / 4;

/// Size of the relocated-prologue region.
pub const ORIGINAL_REGION_SIZE: usize = TRAMPOLINE_SIZE - HOOK_REGION_SIZE;

/// Loaded into the hook region at reset. The replacement address word is
/// filled in afterwards, directly behind these bytes.
#[cfg(target_pointer_width = "64")]
const HOOK_PREAMBLE: [u8; 8] = [
    0x66, 0x90, // nop
    0xff, 0x25, 0x00, 0x00, 0x00, 0x00, // jmp qword ptr [rip]
];
#[cfg(target_pointer_width = "32")]
const HOOK_PREAMBLE: [u8; 12] = [
    0x66, 0x0f, 0x1f, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00, // nop word ptr [eax+eax]
    0x66, 0x90, // nop
    0xe9, // jmp rel32
];

/// `int 3`. Poisons unused trampoline bytes so executing an uninitialized
/// region traps instead of running garbage.
const POISON: u8 = 0xcc;

// The preamble plus the address word must exactly fill the hook region;
// any gap would put unexecutable bytes in the instruction stream.
const _: () = assert!(HOOK_PREAMBLE.len() + std::mem::size_of::<usize>() == HOOK_REGION_SIZE);
const _: () = assert!(HOOK_REGION_SIZE % std::mem::size_of::<usize>() == 0);

#[derive(Debug, Error)]
pub enum TrampolineError {
    #[error("target {target:#x} is out of rel32 range of the trampoline")]
    TargetOutOfReach { target: usize },

    #[error("prologue at {target:#x} ends before {needed} byte(s) and is not followed by padding")]
    InsufficientPrologue { target: usize, needed: usize },

    #[error("relocated prologue and jump assists overflow the trampoline")]
    OutOfSpace,

    #[error("rip-relative operand at {address:#x} cannot be relocated")]
    RipDisplacementOutOfRange { address: usize },

    #[error(transparent)]
    BadInstruction(#[from] InsnError),

    #[error(transparent)]
    Jump(#[from] JumpError),
}

/// One trampoline record. Lives inside a [`crate::store::TrampolineStore`]
/// page and never moves: both the patched target and the relocated code
/// embed its address.
#[repr(C, align(16))]
pub struct Trampoline {
    hook: [u8; HOOK_REGION_SIZE],
    original: [u8; ORIGINAL_REGION_SIZE],
}

const _: () = assert!(std::mem::size_of::<Trampoline>() == TRAMPOLINE_SIZE);

impl Trampoline {
    /// Loads the hook preamble and poisons everything else. Only permitted
    /// before the trampoline is first used; the store calls this when a
    /// slot is vended.
    pub(crate) fn reset(&mut self) {
        self.hook[..HOOK_PREAMBLE.len()].copy_from_slice(&HOOK_PREAMBLE);
        self.hook[HOOK_PREAMBLE.len()..].fill(POISON);
        self.original.fill(POISON);
    }

    /// Entry point that transfers to the current replacement. This is what
    /// gets written into the head of the hooked function.
    pub fn hook_entry(&self) -> *const u8 {
        self.hook.as_ptr()
    }

    /// Entry point that executes the original behavior: the relocated
    /// prologue followed by a jump back into the target.
    pub fn original_entry(&self) -> *const u8 {
        self.original.as_ptr()
    }

    /// Offset of the mutable address word within the hook region.
    const fn word_offset() -> usize {
        HOOK_REGION_SIZE - std::mem::size_of::<usize>()
    }

    /// Address just past the hook region; the 32-bit stub's rel32
    /// displacement is relative to this.
    fn hook_end(&self) -> usize {
        self.hook.as_ptr() as usize + HOOK_REGION_SIZE
    }

    /// Points the hook stub at `replacement` and flushes the stub bytes.
    /// May be called again later to re-point, disable, or replace.
    pub fn set_hook_function(&mut self, replacement: usize) {
        debug!(
            "trampoline at {:#x} taking hook function {:#x}",
            self.hook.as_ptr() as usize,
            replacement
        );
        let value = self.value_for_hook_address(replacement);
        self.hook[Self::word_offset()..].copy_from_slice(&value.to_le_bytes());
        os::flush_instruction_cache(self.hook.as_ptr() as usize, HOOK_REGION_SIZE);
    }

    /// Address the hook stub currently transfers to.
    pub fn hook_target(&self) -> usize {
        let mut raw = [0u8; std::mem::size_of::<usize>()];
        raw.copy_from_slice(&self.hook[Self::word_offset()..]);
        self.hook_address_for_value(usize::from_le_bytes(raw))
    }

    #[cfg(target_pointer_width = "64")]
    fn value_for_hook_address(&self, replacement: usize) -> usize {
        // The stub jumps through an absolute qword
        replacement
    }

    #[cfg(target_pointer_width = "32")]
    fn value_for_hook_address(&self, replacement: usize) -> usize {
        // rel32 displacement for the stub's trailing `jmp rel32`
        replacement.wrapping_sub(self.hook_end())
    }

    #[cfg(target_pointer_width = "64")]
    fn hook_address_for_value(&self, value: usize) -> usize {
        value
    }

    #[cfg(target_pointer_width = "32")]
    fn hook_address_for_value(&self, value: usize) -> usize {
        value.wrapping_add(self.hook_end())
    }

    /// Transplants the head of the function at `target` into the
    /// relocated-prologue region so that invoking [`Self::original_entry`]
    /// behaves like the unhooked function.
    ///
    /// On failure the target is untouched; the trampoline contents are
    /// unspecified and the slot should be returned to its store.
    ///
    /// # Safety
    ///
    /// `target` must be the address of readable machine code with at least
    /// [`MAX_INSN_LEN`] addressable bytes beyond each decoded instruction.
    pub unsafe fn set_original_function(&mut self, target: usize) -> Result<(), TrampolineError> {
        debug!(
            "trampoline at {:#x} transplanting prologue of {:#x}",
            self.hook.as_ptr() as usize,
            target
        );

        // The redirect at the target is a rel32 jump to the hook stub; if
        // that cannot reach, the hook can never be installed.
        if !jump::can_reach(target, self.hook.as_ptr() as usize) {
            warn!("target {:#x} is too far from its trampoline", target);
            return Err(TrampolineError::TargetOutOfReach { target });
        }

        // Decode until enough bytes are covered to overwrite with the
        // redirect jump, or until the function ends on its own.
        let mut insns: Vec<Insn> = Vec::new();
        let mut consumed = 0usize;
        while consumed < jump::JMP_REL32_LEN {
            let insn = decode_at(target + consumed)?;
            debug!(
                "instruction {}: decoded {}-byte \"{}\", terminal: {}",
                insns.len(),
                insn.len(),
                insn.disassembly(),
                insn.is_terminal()
            );
            consumed += insn.len();
            let terminal = insn.is_terminal();
            insns.push(insn);
            if terminal {
                break;
            }
        }

        if consumed < jump::JMP_REL32_LEN {
            // The function ended early. Alignment padding after the
            // terminal instruction may absorb the shortfall; padding is
            // never executed, so it is not transplanted.
            let shortfall = jump::JMP_REL32_LEN - consumed;
            let padding = decode_at(target + consumed)?;
            if !padding.is_padding_run(shortfall) {
                debug!(
                    "decoded {} byte(s), short {} and not followed by padding",
                    consumed, shortfall
                );
                return Err(TrampolineError::InsufficientPrologue {
                    target,
                    needed: jump::JMP_REL32_LEN,
                });
            }
            debug!(
                "decoded {} byte(s), absorbing {} byte(s) of padding",
                consumed, shortfall
            );
        }

        let original_base = self.original.as_ptr() as usize;
        let mut written = 0usize;
        let mut assist_bytes = 0usize;

        for (index, insn) in insns.iter_mut().enumerate() {
            let new_address = original_base + written;

            if insn.has_position_dependent_operand() {
                let disp = insn.displacement();

                // A displacement that lands on another transplanted byte
                // moves with the code and needs no adjustment. Both
                // directions must be checked.
                let fwd_limit = (consumed - (written + insn.len())) as i64;
                let back_limit = -((written + insn.len()) as i64);

                if disp >= fwd_limit || disp < back_limit {
                    let new_disp = disp
                        .wrapping_add((insn.address() as i64).wrapping_sub(new_address as i64));

                    if insn.set_displacement(new_disp).is_err() {
                        if !insn.has_relative_branch_displacement() {
                            // A data access through the instruction pointer
                            // cannot be rerouted through a stub.
                            debug!("instruction {}: rip-relative displacement out of range", index);
                            return Err(TrampolineError::RipDisplacementOutOfRange {
                                address: insn.address(),
                            });
                        }

                        // Jump assist: reserve a rel32 jump at the high end
                        // of the region and aim the short branch at it.
                        assist_bytes += jump::JMP_REL32_LEN;
                        if written + insn.len() + assist_bytes > ORIGINAL_REGION_SIZE {
                            return Err(TrampolineError::OutOfSpace);
                        }

                        let assist_offset = ORIGINAL_REGION_SIZE - assist_bytes;
                        let assist_address = original_base + assist_offset;
                        let assist_target = insn.absolute_target();
                        let disp_to_assist = (assist_address as i64)
                            .wrapping_sub((new_address + insn.len()) as i64);

                        debug!(
                            "instruction {}: extending short branch through a jump assist at {:#x} to {:#x}",
                            index, assist_address, assist_target
                        );
                        insn.set_displacement(disp_to_assist)?;
                        jump::write_jmp_rel32(
                            &mut self.original[assist_offset..assist_offset + jump::JMP_REL32_LEN],
                            assist_target,
                        )?;
                    }
                }
            }

            let limit = ORIGINAL_REGION_SIZE - assist_bytes;
            let encoded = insn.encode(new_address, &mut self.original[written..limit])?;
            debug!("instruction {}: encoded {} byte(s) at {:#x}", index, encoded, new_address);
            written += encoded;
        }

        // Unless the transplant ended the function, execution must continue
        // at the first byte that was not displaced.
        let ended_in_terminal = insns.last().is_some_and(Insn::is_terminal);
        if !ended_in_terminal {
            let limit = ORIGINAL_REGION_SIZE - assist_bytes;
            if written + jump::JMP_REL32_LEN > limit {
                return Err(TrampolineError::OutOfSpace);
            }
            jump::write_jmp_rel32(&mut self.original[written..limit], target + consumed)?;
        }

        os::flush_instruction_cache(original_base, ORIGINAL_REGION_SIZE);
        Ok(())
    }
}

/// Decodes one instruction from live memory.
unsafe fn decode_at(address: usize) -> Result<Insn, InsnError> {
    let bytes = slice::from_raw_parts(address as *const u8, MAX_INSN_LEN);
    Insn::decode(bytes, address)
}
