//! Instruction fetch and resolve.
//!
//! The first word at PC selects the descriptor. For two-word forms (LDS, STS,
//! JMP, CALL on this device) the second word carries operand bits only and
//! is folded into the opcode as its low half: `opcode = first << 16 | second`.
//! One-word opcodes are the word itself.

use crate::error::Fault;
use crate::memory::Memory;
use crate::opcodes::{Descriptor, InstructionTable};
use crate::PC_MASK;

/// A fetched instruction ready for dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    /// Word address the instruction was fetched from
    pub pc: u16,
    /// Full opcode (32-bit for two-word instructions)
    pub opcode: u32,
    pub descriptor: &'static Descriptor,
}

impl Decoded {
    /// First (or only) instruction word.
    #[inline(always)]
    pub fn word(&self) -> u16 {
        if self.descriptor.length == 2 {
            (self.opcode >> 16) as u16
        } else {
            self.opcode as u16
        }
    }

    /// Word address of the following instruction.
    #[inline(always)]
    pub fn next_pc(&self) -> u16 {
        self.pc.wrapping_add(self.descriptor.length as u16) & PC_MASK
    }
}

/// Fetch and resolve the instruction at word address `pc`.
pub fn fetch(mem: &Memory, table: &InstructionTable, pc: u16) -> Result<Decoded, Fault> {
    let word = mem.read_program_word(pc)?;
    let descriptor = table.resolve(word).ok_or(Fault::Decode { pc, opcode: word })?;
    let opcode = if descriptor.length == 2 {
        let second = mem.read_program_word(pc.wrapping_add(1) & PC_MASK)?;
        (word as u32) << 16 | second as u32
    } else {
        word as u32
    };
    Ok(Decoded { pc, opcode, descriptor })
}
