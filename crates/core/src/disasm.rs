//! AVR instruction disassembler.
//!
//! Formats opcodes as assembly text by resolving them through the same
//! [`InstructionTable`] the core executes from, then extracting operands with
//! the shared [`operands`](crate::operands) helpers. Used by `step_one`,
//! `disasm_at_pc` and trace logging.

use crate::decoder::Decoded;
use crate::memory::{AddressMode, Pointer};
use crate::opcodes::{Descriptor, Handler, InstructionTable};
use crate::operands::*;
use crate::PC_MASK;

/// Format an opcode as an assembly string.
///
/// `opcode` is the one-word encoding, or `first << 16 | second` for the
/// two-word forms. `pc` (word address) resolves relative branch targets.
/// Words that decode to nothing are shown as `.dw`.
pub fn disassemble(opcode: u32, pc: u16) -> String {
    let word = if opcode > 0xFFFF { first_word(opcode) } else { opcode as u16 };
    let table = match InstructionTable::global() {
        Ok(t) => t,
        Err(_) => return format!(".dw 0x{:04X}", word),
    };
    match table.resolve(word) {
        Some(d) => format_instruction(d, word, opcode, pc),
        None => format!(".dw 0x{:04X}", word),
    }
}

/// Format an already fetched instruction.
pub fn disassemble_decoded(inst: &Decoded) -> String {
    format_instruction(inst.descriptor, inst.word(), inst.opcode, inst.pc)
}

fn pointer_name(p: Pointer) -> char {
    match p {
        Pointer::X => 'X',
        Pointer::Y => 'Y',
        Pointer::Z => 'Z',
    }
}

fn indirect(p: Pointer, mode: AddressMode) -> String {
    let n = pointer_name(p);
    match mode {
        AddressMode::Indirect | AddressMode::Displacement(0) => n.to_string(),
        AddressMode::PostIncrement => format!("{}+", n),
        AddressMode::PreDecrement => format!("-{}", n),
        AddressMode::Displacement(q) => format!("{}+{}", n, q),
    }
}

fn relative_target(pc: u16, k: i16) -> u16 {
    (pc as i32 + 1 + k as i32) as u16 & PC_MASK
}

fn format_instruction(d: &Descriptor, w: u16, op: u32, pc: u16) -> String {
    let name = d.name;
    match d.handler {
        Handler::Nop
        | Handler::Ret
        | Handler::Reti
        | Handler::Ijmp
        | Handler::Icall
        | Handler::Sleep
        | Handler::Break
        | Handler::Wdr
        | Handler::Bset
        | Handler::Bclr
        | Handler::Lpm => name.into(),
        Handler::Add
        | Handler::Adc
        | Handler::Sub
        | Handler::Sbc
        | Handler::And
        | Handler::Or
        | Handler::Eor
        | Handler::Cp
        | Handler::Cpc
        | Handler::Cpse
        | Handler::Mov
        | Handler::Mul => format!("{} R{}, R{}", name, rd5(w), rr5(w)),
        Handler::Muls => format!("{} R{}, R{}", name, rd4(w), rr4(w)),
        Handler::Mulsu | Handler::Fmul | Handler::Fmuls | Handler::Fmulsu => {
            format!("{} R{}, R{}", name, rd3(w), rr3(w))
        }
        Handler::Subi | Handler::Sbci | Handler::Andi | Handler::Ori | Handler::Cpi | Handler::Ldi => {
            format!("{} R{}, 0x{:02X}", name, rd4(w), k8(w))
        }
        Handler::Adiw | Handler::Sbiw => {
            let (r, k) = adiw_operands(w);
            format!("{} R{}:R{}, {}", name, r + 1, r, k)
        }
        Handler::Com
        | Handler::Neg
        | Handler::Inc
        | Handler::Dec
        | Handler::Lsr
        | Handler::Asr
        | Handler::Ror
        | Handler::Swap
        | Handler::Push
        | Handler::Pop => format!("{} R{}", name, rd5(w)),
        Handler::Movw => {
            let (dd, rr) = movw_pair(w);
            format!("MOVW R{}:R{}, R{}:R{}", dd + 1, dd, rr + 1, rr)
        }
        Handler::Lds => format!("LDS R{}, 0x{:04X}", rd5(w), k16(op)),
        Handler::Sts => format!("STS 0x{:04X}, R{}", k16(op), rd5(w)),
        Handler::Ld(p, mode) => format!("LD R{}, {}", rd5(w), indirect(p, mode)),
        Handler::St(p, mode) => format!("ST {}, R{}", indirect(p, mode), rd5(w)),
        Handler::Ldd(p) => {
            let q = q6(w);
            let mn = if q == 0 { "LD" } else { "LDD" };
            format!("{} R{}, {}", mn, rd5(w), indirect(p, AddressMode::Displacement(q)))
        }
        Handler::Std(p) => {
            let q = q6(w);
            let mn = if q == 0 { "ST" } else { "STD" };
            format!("{} {}, R{}", mn, indirect(p, AddressMode::Displacement(q)), rd5(w))
        }
        Handler::LpmRd { post_increment } => {
            format!("LPM R{}, Z{}", rd5(w), if post_increment { "+" } else { "" })
        }
        Handler::In => format!("IN R{}, 0x{:02X}", rd5(w), io6(w)),
        Handler::Out => format!("OUT 0x{:02X}, R{}", io6(w), rd5(w)),
        Handler::Bst | Handler::Bld | Handler::Sbrc | Handler::Sbrs => {
            format!("{} R{}, {}", name, rd5(w), bit3(w))
        }
        Handler::Sbi | Handler::Cbi | Handler::Sbic | Handler::Sbis => {
            format!("{} 0x{:02X}, {}", name, io5(w), bit3(w))
        }
        Handler::Rjmp | Handler::Rcall => {
            let k = k12(w);
            format!("{} .{:+} ; 0x{:04X}", name, k, relative_target(pc, k) as u32 * 2)
        }
        Handler::Jmp | Handler::Call => format!("{} 0x{:04X}", name, (k22(op) & PC_MASK as u32) * 2),
        Handler::Brbs | Handler::Brbc => {
            let k = k7(w) as i16;
            format!("{} .{:+} ; 0x{:04X}", name, k, relative_target(pc, k) as u32 * 2)
        }
    }
}

/// Disassemble a range of program memory.
///
/// Returns lines of `"0xAAAA: OPCODE  MNEMONIC"` for the given byte-address range.
pub fn disassemble_range(flash: &[u8], start_byte: usize, end_byte: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut addr = start_byte & !1;
    let word_at = |a: usize| flash.get(a..a + 2).map(|b| b[0] as u16 | (b[1] as u16) << 8);
    while addr < end_byte {
        let Some(word) = word_at(addr) else { break };
        let pc = (addr / 2) as u16;
        let two_words = InstructionTable::global()
            .ok()
            .and_then(|t| t.resolve(word))
            .is_some_and(|d| d.length == 2);
        match word_at(addr + 2) {
            Some(next) if two_words => {
                let op = (word as u32) << 16 | next as u32;
                lines.push(format!("0x{:04X}: {:04X} {:04X}  {}", addr, word, next, disassemble(op, pc)));
                addr += 4;
            }
            _ => {
                lines.push(format!("0x{:04X}: {:04X}       {}", addr, word, disassemble(word as u32, pc)));
                addr += 2;
            }
        }
    }
    lines
}
