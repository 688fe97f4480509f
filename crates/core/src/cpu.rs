//! AVR CPU core for ATmega328P.
//!
//! Holds the CPU registers that live outside data memory (PC, SP, SREG,
//! MCUSR, cycle counter and run-state latches) and the instruction handlers.
//! Handlers run on [`Atmega328p`] so that data-bus accesses see the
//! CPU-mapped I/O registers through [`read_data`](Atmega328p::read_data) and
//! [`write_data`](Atmega328p::write_data).
//!
//! Flag computation follows the AVR instruction set manual, including the
//! carry-chain behavior of SBC/SBCI/CPC where Z is only ever cleared so that
//! multi-byte comparisons work.

use crate::decoder::Decoded;
use crate::error::Fault;
use crate::memory::AddressMode;
use crate::operands::*;
use crate::opcodes::Handler;
use crate::sreg::{ResetStatus, StatusRegister};
use crate::{Atmega328p, IO_BASE, PC_MASK, RAMEND, SREG_I};

/// CPU state for ATmega328P.
///
/// The register file R0–R31 lives in [`Memory::data`](crate::Memory::data)
/// at 0x00–0x1F.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cpu {
    /// Program counter (word address, 14 bits)
    pub pc: u16,
    /// Stack pointer (byte address in data space)
    pub sp: u16,
    pub sreg: StatusRegister,
    /// MCUSR reset-source flags
    pub reset_status: ResetStatus,
    /// Monotonic cycle counter
    pub tick: u64,
    /// Set by SLEEP, cleared when an interrupt is taken
    pub sleeping: bool,
    /// Set by BREAK, a fault or a stop request; cleared by `resume`
    pub stopped: bool,
    /// Skip latch: the next fetched instruction is not executed
    pub skip_next: bool,
    /// The instruction after SEI/RETI runs before any interrupt
    pub interrupt_delay: bool,
}

impl Cpu {
    /// Power-on state.
    pub fn new() -> Self {
        Cpu {
            pc: 0,
            sp: RAMEND,
            sreg: StatusRegister::new(),
            reset_status: ResetStatus::power_on(),
            tick: 0,
            sleeping: false,
            stopped: false,
            skip_next: false,
            interrupt_delay: false,
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

// --- Flag helpers ---

#[inline(always)]
fn bit(v: u8, n: u8) -> bool {
    (v >> n) & 1 != 0
}

/// SREG flags for ADD/ADC. `r` already includes the carry-in.
pub fn flags_add(s: &mut StatusRegister, rd: u8, rr: u8, r: u8) {
    let (rd3, rr3, r3) = (bit(rd, 3), bit(rr, 3), bit(r, 3));
    let (rd7, rr7, r7) = (bit(rd, 7), bit(rr, 7), bit(r, 7));
    s.h = (rd3 && rr3) || (rr3 && !r3) || (!r3 && rd3);
    s.v = (rd7 && rr7 && !r7) || (!rd7 && !rr7 && r7);
    s.c = (rd7 && rr7) || (rr7 && !r7) || (!r7 && rd7);
    s.n = r7;
    s.z = r == 0;
    s.s = s.n ^ s.v;
}

/// SREG flags for SUB/SUBI/SBC/SBCI/CP/CPC/CPI/NEG.
///
/// With `keep_z` (SBC, SBCI, CPC) a zero result leaves Z unchanged and a
/// non-zero result clears it.
pub fn flags_sub(s: &mut StatusRegister, rd: u8, rr: u8, r: u8, keep_z: bool) {
    let (rd3, rr3, r3) = (bit(rd, 3), bit(rr, 3), bit(r, 3));
    let (rd7, rr7, r7) = (bit(rd, 7), bit(rr, 7), bit(r, 7));
    s.h = (!rd3 && rr3) || (rr3 && r3) || (r3 && !rd3);
    s.v = (rd7 && !rr7 && !r7) || (!rd7 && rr7 && r7);
    s.c = (!rd7 && rr7) || (rr7 && r7) || (r7 && !rd7);
    s.n = r7;
    s.z = if keep_z { r == 0 && s.z } else { r == 0 };
    s.s = s.n ^ s.v;
}

/// SREG flags for AND/OR/EOR and their immediates. V is cleared.
pub fn flags_logic(s: &mut StatusRegister, r: u8) {
    s.v = false;
    s.n = bit(r, 7);
    s.z = r == 0;
    s.s = s.n;
}

/// SREG flags for LSR/ASR/ROR: `c` is the bit shifted out.
fn flags_shift(s: &mut StatusRegister, r: u8, c: bool) {
    s.c = c;
    s.n = bit(r, 7);
    s.z = r == 0;
    s.v = s.n ^ s.c;
    s.s = s.n ^ s.v;
}

fn flags_mul(s: &mut StatusRegister, product: u16, carry: bool) {
    s.c = carry;
    s.z = product == 0;
}

#[inline(always)]
fn relative(pc: u16, k: i32) -> u16 {
    (pc as i32 + k) as u16 & PC_MASK
}

// ---- Instruction execution on Atmega328p ----

impl Atmega328p {
    /// Execute one decoded instruction and return its cycle cost.
    ///
    /// PC already points past the instruction. Jumps, calls and returns
    /// overwrite it; conditional skips set the skip latch so that the next
    /// fetch is consumed without side effects.
    pub(crate) fn execute(&mut self, inst: &Decoded) -> Result<u8, Fault> {
        let w = inst.word();
        let op = inst.opcode;
        let mut extra = 0u8;

        match inst.descriptor.handler {
            Handler::Nop => {}

            // -- Arithmetic --
            Handler::Add | Handler::Adc => {
                let (d, r) = (rd5(w), rr5(w));
                let rd = self.mem.reg(d);
                let rr = self.mem.reg(r);
                let c = inst.descriptor.handler == Handler::Adc && self.cpu.sreg.c;
                let res = rd.wrapping_add(rr).wrapping_add(c as u8);
                self.mem.set_reg(d, res);
                flags_add(&mut self.cpu.sreg, rd, rr, res);
            }
            Handler::Sub | Handler::Sbc => {
                let (d, r) = (rd5(w), rr5(w));
                let rd = self.mem.reg(d);
                let rr = self.mem.reg(r);
                let sbc = inst.descriptor.handler == Handler::Sbc;
                let c = sbc && self.cpu.sreg.c;
                let res = rd.wrapping_sub(rr).wrapping_sub(c as u8);
                self.mem.set_reg(d, res);
                // Flags use Rr as read; the result already has the borrow in it.
                flags_sub(&mut self.cpu.sreg, rd, rr, res, sbc);
            }
            Handler::Subi | Handler::Sbci => {
                let (d, k) = (rd4(w), k8(w));
                let rd = self.mem.reg(d);
                let sbci = inst.descriptor.handler == Handler::Sbci;
                let c = sbci && self.cpu.sreg.c;
                let res = rd.wrapping_sub(k).wrapping_sub(c as u8);
                self.mem.set_reg(d, res);
                flags_sub(&mut self.cpu.sreg, rd, k, res, sbci);
            }
            Handler::Adiw => {
                let (d, k) = adiw_operands(w);
                let val = self.mem.word_reg(d);
                let res = val.wrapping_add(k as u16);
                self.mem.set_word_reg(d, res);
                let (rdh7, r15) = (val & 0x8000 != 0, res & 0x8000 != 0);
                let s = &mut self.cpu.sreg;
                s.v = !rdh7 && r15;
                s.c = !r15 && rdh7;
                s.n = r15;
                s.z = res == 0;
                s.s = s.n ^ s.v;
            }
            Handler::Sbiw => {
                let (d, k) = adiw_operands(w);
                let val = self.mem.word_reg(d);
                let res = val.wrapping_sub(k as u16);
                self.mem.set_word_reg(d, res);
                let (rdh7, r15) = (val & 0x8000 != 0, res & 0x8000 != 0);
                let s = &mut self.cpu.sreg;
                s.v = rdh7 && !r15;
                s.c = r15 && !rdh7;
                s.n = r15;
                s.z = res == 0;
                s.s = s.n ^ s.v;
            }
            Handler::And | Handler::Or | Handler::Eor => {
                let (d, r) = (rd5(w), rr5(w));
                let (a, b) = (self.mem.reg(d), self.mem.reg(r));
                let res = match inst.descriptor.handler {
                    Handler::And => a & b,
                    Handler::Or => a | b,
                    _ => a ^ b,
                };
                self.mem.set_reg(d, res);
                flags_logic(&mut self.cpu.sreg, res);
            }
            Handler::Andi | Handler::Ori => {
                let (d, k) = (rd4(w), k8(w));
                let rd = self.mem.reg(d);
                let res = if inst.descriptor.handler == Handler::Andi { rd & k } else { rd | k };
                self.mem.set_reg(d, res);
                flags_logic(&mut self.cpu.sreg, res);
            }
            Handler::Com => {
                let d = rd5(w);
                let res = !self.mem.reg(d);
                self.mem.set_reg(d, res);
                flags_logic(&mut self.cpu.sreg, res);
                self.cpu.sreg.c = true;
            }
            Handler::Neg => {
                let d = rd5(w);
                let rd = self.mem.reg(d);
                let res = 0u8.wrapping_sub(rd);
                self.mem.set_reg(d, res);
                flags_sub(&mut self.cpu.sreg, 0, rd, res, false);
            }
            Handler::Inc | Handler::Dec => {
                let d = rd5(w);
                let rd = self.mem.reg(d);
                let (res, overflow_from) = if inst.descriptor.handler == Handler::Inc {
                    (rd.wrapping_add(1), 0x7F)
                } else {
                    (rd.wrapping_sub(1), 0x80)
                };
                self.mem.set_reg(d, res);
                let s = &mut self.cpu.sreg;
                s.v = rd == overflow_from;
                s.n = bit(res, 7);
                s.z = res == 0;
                s.s = s.n ^ s.v;
            }
            Handler::Mul => {
                let res = self.mem.reg(rd5(w)) as u16 * self.mem.reg(rr5(w)) as u16;
                self.mem.set_word_reg(0, res);
                flags_mul(&mut self.cpu.sreg, res, res & 0x8000 != 0);
            }
            Handler::Muls => {
                let a = self.mem.reg(rd4(w)) as i8 as i16;
                let b = self.mem.reg(rr4(w)) as i8 as i16;
                let res = (a * b) as u16;
                self.mem.set_word_reg(0, res);
                flags_mul(&mut self.cpu.sreg, res, res & 0x8000 != 0);
            }
            Handler::Mulsu => {
                let a = self.mem.reg(rd3(w)) as i8 as i16;
                let b = self.mem.reg(rr3(w)) as i16;
                let res = (a * b) as u16;
                self.mem.set_word_reg(0, res);
                flags_mul(&mut self.cpu.sreg, res, res & 0x8000 != 0);
            }
            Handler::Fmul | Handler::Fmuls | Handler::Fmulsu => {
                let (rd, rr) = (self.mem.reg(rd3(w)), self.mem.reg(rr3(w)));
                let product = match inst.descriptor.handler {
                    Handler::Fmul => rd as u16 * rr as u16,
                    Handler::Fmuls => (rd as i8 as i16 * rr as i8 as i16) as u16,
                    _ => (rd as i8 as i16 * rr as i16) as u16,
                };
                let res = product << 1;
                self.mem.set_word_reg(0, res);
                // C is bit 15 before the shift
                flags_mul(&mut self.cpu.sreg, res, product & 0x8000 != 0);
            }

            // -- Compare --
            Handler::Cp | Handler::Cpc => {
                let rd = self.mem.reg(rd5(w));
                let rr = self.mem.reg(rr5(w));
                let cpc = inst.descriptor.handler == Handler::Cpc;
                let c = cpc && self.cpu.sreg.c;
                let res = rd.wrapping_sub(rr).wrapping_sub(c as u8);
                flags_sub(&mut self.cpu.sreg, rd, rr, res, cpc);
            }
            Handler::Cpi => {
                let rd = self.mem.reg(rd4(w));
                let k = k8(w);
                flags_sub(&mut self.cpu.sreg, rd, k, rd.wrapping_sub(k), false);
            }

            // -- Data transfer --
            Handler::Mov => {
                let v = self.mem.reg(rr5(w));
                self.mem.set_reg(rd5(w), v);
            }
            Handler::Movw => {
                let (d, r) = movw_pair(w);
                let v = self.mem.word_reg(r);
                self.mem.set_word_reg(d, v);
            }
            Handler::Ldi => self.mem.set_reg(rd4(w), k8(w)),
            Handler::Lds => {
                let v = self.read_data(k16(op))?;
                self.mem.set_reg(rd5(w), v);
            }
            Handler::Sts => {
                let v = self.mem.reg(rd5(w));
                self.write_data(k16(op), v)?;
            }
            Handler::Ld(ptr, mode) => {
                let addr = self.mem.resolve(ptr, mode)?;
                let v = self.read_data(addr)?;
                self.mem.set_reg(rd5(w), v);
            }
            Handler::Ldd(ptr) => {
                let addr = self.mem.resolve(ptr, AddressMode::Displacement(q6(w)))?;
                let v = self.read_data(addr)?;
                self.mem.set_reg(rd5(w), v);
            }
            Handler::St(ptr, mode) => {
                let v = self.mem.reg(rd5(w));
                let addr = self.mem.resolve(ptr, mode)?;
                self.write_data(addr, v)?;
            }
            Handler::Std(ptr) => {
                let v = self.mem.reg(rd5(w));
                let addr = self.mem.resolve(ptr, AddressMode::Displacement(q6(w)))?;
                self.write_data(addr, v)?;
            }
            Handler::Lpm => {
                let v = self.mem.read_program_byte(self.mem.z())?;
                self.mem.set_reg(0, v);
            }
            Handler::LpmRd { post_increment } => {
                let z = self.mem.z();
                let v = self.mem.read_program_byte(z)?;
                self.mem.set_reg(rd5(w), v);
                if post_increment {
                    self.mem.set_z(z.wrapping_add(1));
                }
            }
            Handler::Push => {
                let v = self.mem.reg(rd5(w));
                self.push8(v)?;
            }
            Handler::Pop => {
                let v = self.pop8()?;
                self.mem.set_reg(rd5(w), v);
            }
            Handler::In => {
                let v = self.read_data(IO_BASE + io6(w) as u16)?;
                self.mem.set_reg(rd5(w), v);
            }
            Handler::Out => {
                let v = self.mem.reg(rd5(w));
                self.write_data(IO_BASE + io6(w) as u16, v)?;
            }

            // -- Shift and bit --
            Handler::Lsr => {
                let d = rd5(w);
                let rd = self.mem.reg(d);
                let res = rd >> 1;
                self.mem.set_reg(d, res);
                flags_shift(&mut self.cpu.sreg, res, rd & 1 != 0);
            }
            Handler::Asr => {
                let d = rd5(w);
                let rd = self.mem.reg(d);
                let res = ((rd as i8) >> 1) as u8;
                self.mem.set_reg(d, res);
                flags_shift(&mut self.cpu.sreg, res, rd & 1 != 0);
            }
            Handler::Ror => {
                let d = rd5(w);
                let rd = self.mem.reg(d);
                let res = (rd >> 1) | ((self.cpu.sreg.c as u8) << 7);
                self.mem.set_reg(d, res);
                flags_shift(&mut self.cpu.sreg, res, rd & 1 != 0);
            }
            Handler::Swap => {
                let d = rd5(w);
                let rd = self.mem.reg(d);
                self.mem.set_reg(d, rd.rotate_left(4));
            }
            Handler::Bset => {
                let b = sreg_bit(w);
                self.cpu.sreg.set(b, true);
                if b == SREG_I {
                    self.cpu.interrupt_delay = true;
                }
            }
            Handler::Bclr => self.cpu.sreg.set(sreg_bit(w), false),
            Handler::Bst => {
                self.cpu.sreg.t = bit(self.mem.reg(rd5(w)), bit3(w));
            }
            Handler::Bld => {
                let d = rd5(w);
                let mask = 1 << bit3(w);
                let rd = self.mem.reg(d);
                let res = if self.cpu.sreg.t { rd | mask } else { rd & !mask };
                self.mem.set_reg(d, res);
            }
            Handler::Sbi | Handler::Cbi => {
                let addr = IO_BASE + io5(w) as u16;
                let mask = 1 << bit3(w);
                let v = self.read_data(addr)?;
                let res = if inst.descriptor.handler == Handler::Sbi { v | mask } else { v & !mask };
                self.write_data(addr, res)?;
            }

            // -- Control flow --
            Handler::Rjmp => self.cpu.pc = relative(self.cpu.pc, k12(w) as i32),
            Handler::Rcall => {
                let ret = self.cpu.pc;
                self.push16(ret)?;
                self.cpu.pc = relative(ret, k12(w) as i32);
            }
            Handler::Ijmp => self.cpu.pc = self.mem.z() & PC_MASK,
            Handler::Icall => {
                self.push16(self.cpu.pc)?;
                self.cpu.pc = self.mem.z() & PC_MASK;
            }
            Handler::Jmp => self.cpu.pc = k22(op) as u16 & PC_MASK,
            Handler::Call => {
                self.push16(self.cpu.pc)?;
                self.cpu.pc = k22(op) as u16 & PC_MASK;
            }
            Handler::Ret => self.cpu.pc = self.pop16()? & PC_MASK,
            Handler::Reti => {
                self.cpu.pc = self.pop16()? & PC_MASK;
                self.cpu.sreg.i = true;
                self.cpu.interrupt_delay = true;
            }
            Handler::Cpse => {
                self.cpu.skip_next = self.mem.reg(rd5(w)) == self.mem.reg(rr5(w));
            }
            Handler::Sbrc => self.cpu.skip_next = !bit(self.mem.reg(rd5(w)), bit3(w)),
            Handler::Sbrs => self.cpu.skip_next = bit(self.mem.reg(rd5(w)), bit3(w)),
            Handler::Sbic | Handler::Sbis => {
                let v = self.read_data(IO_BASE + io5(w) as u16)?;
                let set = bit(v, bit3(w));
                self.cpu.skip_next = set == (inst.descriptor.handler == Handler::Sbis);
            }
            Handler::Brbs | Handler::Brbc => {
                let flag = self.cpu.sreg.get(bit3(w));
                if flag == (inst.descriptor.handler == Handler::Brbs) {
                    self.cpu.pc = relative(self.cpu.pc, k7(w) as i32);
                    extra = 1;
                }
            }

            // -- MCU control --
            Handler::Sleep => {
                self.cpu.sleeping = true;
                log::debug!("sleep at pc=0x{:04X}", inst.pc);
            }
            Handler::Break => {
                self.cpu.stopped = true;
                log::debug!("break at pc=0x{:04X}", inst.pc);
            }
            Handler::Wdr => {}
        }

        Ok(inst.descriptor.cycles + extra)
    }
}
