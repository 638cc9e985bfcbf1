//! Decoding, classification, and relocation of single x86 instructions.
//!
//! An [`Insn`] is one decoded instruction pinned to its original address.
//! Beyond length and control-flow queries, it knows whether the instruction
//! carries a *position-dependent operand* — a relative branch displacement
//! (`jmp`/`jcc`/`call rel`/`loop`/`xbegin`, …) or, in 64-bit mode, a
//! RIP-relative memory reference — and can rewrite that displacement and
//! re-encode the instruction at a new address without changing its length.

use iced_x86::{
    ConstantOffsets, Decoder, DecoderOptions, Encoder, FlowControl, Formatter, Instruction,
    IntelFormatter, OpKind,
};
use thiserror::Error;

use crate::jump::NOP;
use crate::{BITNESS, MAX_INSN_LEN};

/// Smallest run of identical bytes accepted as a padding buffer.
const MIN_PADDING_RUN: usize = 4;

#[derive(Debug, Error)]
pub enum InsnError {
    #[error("undecodable instruction at {address:#x}")]
    Decode { address: usize },

    #[error("displacement {value:#x} does not fit in {width_bits} bits")]
    DisplacementRange { value: i64, width_bits: u32 },

    #[error("instruction has no position-dependent operand")]
    NoPositionDependentOperand,

    #[error("buffer of {available} byte(s) cannot hold a {needed}-byte instruction")]
    BufferTooSmall { available: usize, needed: usize },

    #[error("re-encoding at {address:#x} failed: {reason}")]
    Encode { address: usize, reason: String },
}

/// Which operand, if any, makes the instruction position-dependent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionDependent {
    None,
    /// A relative branch displacement; the effective target is
    /// `next_ip + displacement`.
    Branch,
    /// A RIP-relative memory reference (64-bit mode only).
    IpRelMemory,
}

/// One decoded x86 instruction and the address it was decoded from.
#[derive(Debug, Clone, Copy)]
pub struct Insn {
    instr: Instruction,
    /// Byte offsets and sizes of the encoded displacement/immediate fields.
    offsets: ConstantOffsets,
    address: usize,
    /// The input window as given to [`Insn::decode`]; bytes beyond the
    /// instruction itself are kept for padding-run checks.
    raw: [u8; MAX_INSN_LEN],
    raw_len: usize,
    pos_dep: PositionDependent,
    /// Current displacement of the position-dependent operand. Updated by
    /// [`Insn::set_displacement`] and applied on encode.
    displacement: i64,
    /// Leading byte when it is a REX prefix; reinserted if the encoder
    /// drops it as redundant.
    rex_prefix: Option<u8>,
}

impl Insn {
    /// Decodes one instruction from `bytes`, the contents of memory at
    /// `address`. At most [`MAX_INSN_LEN`] bytes are examined.
    pub fn decode(bytes: &[u8], address: usize) -> Result<Self, InsnError> {
        let window = &bytes[..bytes.len().min(MAX_INSN_LEN)];
        let mut decoder = Decoder::with_ip(BITNESS, window, address as u64, DecoderOptions::NONE);
        let instr = decoder.decode();
        if instr.is_invalid() {
            return Err(InsnError::Decode { address });
        }
        let offsets = decoder.get_constant_offsets(&instr);

        let mut raw = [0u8; MAX_INSN_LEN];
        raw[..window.len()].copy_from_slice(window);

        let pos_dep = classify(&instr);
        let next_ip = address.wrapping_add(instr.len());
        let displacement = match pos_dep {
            PositionDependent::None => 0,
            PositionDependent::Branch => address_diff(instr.near_branch_target(), next_ip),
            PositionDependent::IpRelMemory => address_diff(instr.ip_rel_memory_address(), next_ip),
        };

        let rex_prefix = match window[0] {
            byte if BITNESS == 64 && is_rex_prefix(byte) => Some(byte),
            _ => None,
        };

        Ok(Self {
            instr,
            offsets,
            address,
            raw,
            raw_len: window.len(),
            pos_dep,
            displacement,
            rex_prefix,
        })
    }

    /// Encoded length in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.instr.len()
    }

    /// The address the instruction was decoded from.
    pub fn address(&self) -> usize {
        self.address
    }

    /// Whether the instruction ends a linear control flow: `ret` or an
    /// unconditional (direct or indirect) jump.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.instr.flow_control(),
            FlowControl::Return | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        )
    }

    /// Whether this is a single-byte instruction commonly used as padding
    /// between functions (`nop` or `int 3`).
    pub fn is_padding(&self) -> bool {
        self.len() == 1 && matches!(self.raw[0], 0x90 | 0xcc)
    }

    /// Whether this instruction starts a padding buffer at least
    /// `max(len_bytes, 4)` identical bytes long. Returns `false` when the
    /// decode window was too short to tell.
    pub fn is_padding_run(&self, len_bytes: usize) -> bool {
        if !self.is_padding() {
            return false;
        }
        let needed = len_bytes.max(MIN_PADDING_RUN);
        if needed > self.raw_len {
            return false;
        }
        let expected = self.raw[0];
        self.raw[1..needed].iter().all(|&b| b == expected)
    }

    pub fn has_position_dependent_operand(&self) -> bool {
        self.pos_dep != PositionDependent::None
    }

    /// Whether the position-dependent operand is a relative branch
    /// displacement (as opposed to a RIP-relative data access).
    pub fn has_relative_branch_displacement(&self) -> bool {
        self.pos_dep == PositionDependent::Branch
    }

    /// Current displacement of the position-dependent operand. Zero when
    /// the instruction has none.
    pub fn displacement(&self) -> i64 {
        self.displacement
    }

    /// Width in bits of the encoded displacement field, or `None` when the
    /// instruction has no position-dependent operand.
    pub fn displacement_width_bits(&self) -> Option<u32> {
        let bytes = match self.pos_dep {
            PositionDependent::None => return None,
            PositionDependent::Branch => self.offsets.immediate_size(),
            PositionDependent::IpRelMemory => self.offsets.displacement_size(),
        };
        match bytes {
            0 => None,
            n => Some(n as u32 * 8),
        }
    }

    /// Smallest displacement representable at the operand's encoded width.
    pub fn min_displacement(&self) -> Option<i64> {
        let width = self.displacement_width_bits()?;
        Some(i64::MIN >> (64 - width))
    }

    /// Largest displacement representable at the operand's encoded width.
    pub fn max_displacement(&self) -> Option<i64> {
        let width = self.displacement_width_bits()?;
        Some(((1u64 << (width - 1)) - 1) as i64)
    }

    /// Absolute effective target of the position-dependent operand. Zero
    /// when the instruction has none.
    pub fn absolute_target(&self) -> usize {
        match self.pos_dep {
            PositionDependent::None => 0,
            PositionDependent::Branch => self.instr.near_branch_target() as usize,
            PositionDependent::IpRelMemory => self.instr.ip_rel_memory_address() as usize,
        }
    }

    /// Intel-syntax disassembly of the instruction, for diagnostics.
    pub fn disassembly(&self) -> String {
        let mut formatter = IntelFormatter::new();
        let mut text = String::new();
        formatter.format(&self.instr, &mut text);
        text
    }

    /// Whether `value` fits the encoded width of the position-dependent
    /// operand.
    pub fn can_set_displacement(&self, value: i64) -> bool {
        match (self.min_displacement(), self.max_displacement()) {
            (Some(min), Some(max)) => value >= min && value <= max,
            _ => false,
        }
    }

    /// Replaces the displacement of the position-dependent operand.
    ///
    /// Fails when there is no such operand or when `value` does not fit its
    /// encoded width; the instruction's length never changes.
    pub fn set_displacement(&mut self, value: i64) -> Result<(), InsnError> {
        let width_bits = self
            .displacement_width_bits()
            .ok_or(InsnError::NoPositionDependentOperand)?;
        if !self.can_set_displacement(value) {
            return Err(InsnError::DisplacementRange { value, width_bits });
        }
        self.displacement = value;
        Ok(())
    }

    /// Re-encodes this instruction for execution at `new_address`, writing
    /// exactly [`Insn::len`] bytes into `buf` and returning that length.
    ///
    /// The encoder may emit a shorter form when it deems prefix bytes
    /// redundant. The slot is then padded with `nop` on the low side so the
    /// instruction's right edge stays aligned — shortening would invalidate
    /// the displacement — and a dropped leading REX prefix is reinserted
    /// just ahead of the opcode, since REX bytes can carry meaning beyond
    /// instruction semantics (unwind-info markers).
    pub fn encode(&self, new_address: usize, buf: &mut [u8]) -> Result<usize, InsnError> {
        let len = self.len();
        if buf.len() < len {
            return Err(InsnError::BufferTooSmall {
                available: buf.len(),
                needed: len,
            });
        }

        let mut instr = self.instr;
        self.apply_displacement(&mut instr, new_address);

        let encoded = encode_once(&instr, new_address)?;
        if encoded.len() > len {
            return Err(InsnError::Encode {
                address: new_address,
                reason: format!("encoding grew from {} to {} bytes", len, encoded.len()),
            });
        }
        if encoded.len() == len {
            buf[..len].copy_from_slice(&encoded);
            return Ok(len);
        }

        // Shorter form. Re-encode right-aligned so the displacement stays
        // relative to the slot's end, then pad the low side.
        let pad = len - encoded.len();
        let encoded = encode_once(&instr, new_address.wrapping_add(pad))?;
        if encoded.len() + pad != len {
            return Err(InsnError::Encode {
                address: new_address,
                reason: "unstable encoding length".into(),
            });
        }
        buf[..pad].fill(NOP);
        buf[pad..len].copy_from_slice(&encoded);

        if let Some(rex) = self.rex_prefix {
            if !is_rex_prefix(buf[pad]) {
                buf[pad - 1] = rex;
            }
        }

        Ok(len)
    }

    /// Installs the current displacement into the iced instruction as an
    /// absolute target, so that encoding at `new_address` reproduces the
    /// displacement bit-for-bit.
    fn apply_displacement(&self, instr: &mut Instruction, new_address: usize) {
        let target = truncate_address(
            (new_address as u64)
                .wrapping_add(self.len() as u64)
                .wrapping_add(self.displacement as u64),
        );
        match self.pos_dep {
            PositionDependent::None => {}
            PositionDependent::Branch => set_branch_target(instr, target),
            PositionDependent::IpRelMemory => instr.set_memory_displacement64(target),
        }
    }
}

fn classify(instr: &Instruction) -> PositionDependent {
    for operand in 0..instr.op_count() {
        if matches!(
            instr.op_kind(operand),
            OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
        ) {
            return PositionDependent::Branch;
        }
    }
    if instr.is_ip_rel_memory_operand() {
        return PositionDependent::IpRelMemory;
    }
    PositionDependent::None
}

fn set_branch_target(instr: &mut Instruction, target: u64) {
    for operand in 0..instr.op_count() {
        match instr.op_kind(operand) {
            OpKind::NearBranch16 => return instr.set_near_branch16(target as u16),
            OpKind::NearBranch32 => return instr.set_near_branch32(target as u32),
            OpKind::NearBranch64 => return instr.set_near_branch64(target),
            _ => {}
        }
    }
}

fn encode_once(instr: &Instruction, address: usize) -> Result<Vec<u8>, InsnError> {
    let mut encoder = Encoder::new(BITNESS);
    encoder
        .encode(instr, address as u64)
        .map_err(|e| InsnError::Encode {
            address,
            reason: e.to_string(),
        })?;
    Ok(encoder.take_buffer())
}

fn is_rex_prefix(byte: u8) -> bool {
    byte & 0xf0 == 0x40
}

/// Signed difference `target - next_ip` at the machine's address width.
#[cfg(target_pointer_width = "64")]
fn address_diff(target: u64, next_ip: usize) -> i64 {
    (target as i64).wrapping_sub(next_ip as i64)
}

#[cfg(target_pointer_width = "32")]
fn address_diff(target: u64, next_ip: usize) -> i64 {
    i64::from((target as u32).wrapping_sub(next_ip as u32) as i32)
}

#[cfg(target_pointer_width = "64")]
fn truncate_address(value: u64) -> u64 {
    value
}

#[cfg(target_pointer_width = "32")]
fn truncate_address(value: u64) -> u64 {
    value & 0xffff_ffff
}
