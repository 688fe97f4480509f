//! ATmega328P memory subsystem.
//!
//! The data space is one linear byte array. Registers, I/O and RAM are
//! offset views into it, never separate allocations:
//!
//! | Address Range | Content                          |
//! |---------------|----------------------------------|
//! | 0x0000–0x001F | General registers R0–R31         |
//! | 0x0020–0x005F | I/O registers (64)               |
//! | 0x0060–0x00FF | Extended I/O registers (160)     |
//! | 0x0100–0x08FF | SRAM (2048 bytes)                |
//!
//! Program memory (32 KB flash) is a separate space; its last 512 bytes are
//! also exposed as the boot section, an alias over the same storage.

use std::ops::Range;

use crate::error::Fault;
use crate::{BOOT_SECTION_SIZE, DATA_SIZE, FLASH_SIZE, IO_SIZE, EXT_IO_SIZE, REG_COUNT, SRAM_SIZE};

pub const REGISTERS: Range<usize> = 0..REG_COUNT;
pub const IO: Range<usize> = REG_COUNT..REG_COUNT + IO_SIZE;
pub const EXT_IO: Range<usize> = IO.end..IO.end + EXT_IO_SIZE;
pub const RAM: Range<usize> = EXT_IO.end..EXT_IO.end + SRAM_SIZE;
pub const BOOT_SECTION: Range<usize> = FLASH_SIZE - BOOT_SECTION_SIZE..FLASH_SIZE;

/// One of the three indirect-addressing pointer registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pointer {
    /// R27:R26
    X,
    /// R29:R28
    Y,
    /// R31:R30
    Z,
}

impl Pointer {
    /// Index of the low-byte register.
    pub fn low_reg(self) -> u8 {
        match self {
            Pointer::X => 26,
            Pointer::Y => 28,
            Pointer::Z => 30,
        }
    }
}

/// Indirect addressing mode used by LD/ST/LDD/STD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    /// `X`: pointer value as-is
    Indirect,
    /// `X+`: use pointer, then increment it
    PostIncrement,
    /// `-X`: decrement pointer, then use it
    PreDecrement,
    /// `Y+q`: pointer plus unsigned displacement, pointer unchanged
    Displacement(u8),
}

/// ATmega328P memory model containing data space and flash.
#[derive(Clone)]
pub struct Memory {
    /// Unified data space: registers + I/O + extended I/O + SRAM
    pub data: Vec<u8>,
    /// Program memory (flash)
    pub flash: Vec<u8>,
}

impl Memory {
    pub fn new() -> Self {
        Memory {
            data: vec![0u8; DATA_SIZE],
            flash: vec![0u8; FLASH_SIZE],
        }
    }

    /// Zero the data space. Flash is left alone.
    pub fn clear_data(&mut self) {
        self.data.fill(0);
    }

    // --- Views ---

    pub fn registers(&self) -> &[u8] {
        &self.data[REGISTERS]
    }

    pub fn io(&self) -> &[u8] {
        &self.data[IO]
    }

    pub fn ext_io(&self) -> &[u8] {
        &self.data[EXT_IO]
    }

    pub fn ram(&self) -> &[u8] {
        &self.data[RAM]
    }

    /// Last 512 bytes of flash.
    pub fn boot_section(&self) -> &[u8] {
        &self.flash[BOOT_SECTION]
    }

    // --- Data space ---

    /// Read one byte of data space.
    #[inline(always)]
    pub fn read(&self, addr: u16) -> Result<u8, Fault> {
        self.data
            .get(addr as usize)
            .copied()
            .ok_or(Fault::DataAddress { address: addr as u32 })
    }

    /// Write one byte of data space.
    #[inline(always)]
    pub fn write(&mut self, addr: u16, v: u8) -> Result<(), Fault> {
        match self.data.get_mut(addr as usize) {
            Some(b) => {
                *b = v;
                Ok(())
            }
            None => Err(Fault::DataAddress { address: addr as u32 }),
        }
    }

    /// Compute the effective address for `mode` through `ptr`, applying the
    /// pointer side effect of the increment/decrement modes.
    ///
    /// The pointer is only updated when the address is in range; a faulting
    /// access leaves it untouched.
    pub fn resolve(&mut self, ptr: Pointer, mode: AddressMode) -> Result<u16, Fault> {
        let base = self.pointer(ptr);
        let (addr, updated) = match mode {
            AddressMode::Indirect => (base as u32, None),
            AddressMode::PostIncrement => (base as u32, Some(base.wrapping_add(1))),
            AddressMode::PreDecrement => {
                let a = base.wrapping_sub(1);
                (a as u32, Some(a))
            }
            AddressMode::Displacement(q) => (base as u32 + q as u32, None),
        };
        if addr >= DATA_SIZE as u32 {
            return Err(Fault::DataAddress { address: addr });
        }
        if let Some(v) = updated {
            self.set_pointer(ptr, v);
        }
        Ok(addr as u16)
    }

    // --- Register file ---

    #[inline(always)]
    pub fn reg(&self, r: u8) -> u8 {
        self.data[(r & 0x1F) as usize]
    }

    #[inline(always)]
    pub fn set_reg(&mut self, r: u8, v: u8) {
        self.data[(r & 0x1F) as usize] = v;
    }

    /// Read the 16-bit pseudo-register Rd+1:Rd (low byte at the lower address).
    #[inline(always)]
    pub fn word_reg(&self, d: u8) -> u16 {
        let base = (d & 0x1E) as usize;
        self.data[base] as u16 | ((self.data[base + 1] as u16) << 8)
    }

    /// Write the 16-bit pseudo-register Rd+1:Rd.
    #[inline(always)]
    pub fn set_word_reg(&mut self, d: u8, v: u16) {
        let base = (d & 0x1E) as usize;
        self.data[base] = v as u8;
        self.data[base + 1] = (v >> 8) as u8;
    }

    #[inline(always)]
    pub fn pointer(&self, ptr: Pointer) -> u16 {
        self.word_reg(ptr.low_reg())
    }

    #[inline(always)]
    pub fn set_pointer(&mut self, ptr: Pointer, v: u16) {
        self.set_word_reg(ptr.low_reg(), v)
    }

    /// Read X register (R26:R27)
    #[inline(always)]
    pub fn x(&self) -> u16 {
        self.pointer(Pointer::X)
    }

    /// Read Y register (R28:R29)
    #[inline(always)]
    pub fn y(&self) -> u16 {
        self.pointer(Pointer::Y)
    }

    /// Read Z register (R30:R31)
    #[inline(always)]
    pub fn z(&self) -> u16 {
        self.pointer(Pointer::Z)
    }

    #[inline(always)]
    pub fn set_x(&mut self, v: u16) {
        self.set_pointer(Pointer::X, v)
    }

    #[inline(always)]
    pub fn set_y(&mut self, v: u16) {
        self.set_pointer(Pointer::Y, v)
    }

    #[inline(always)]
    pub fn set_z(&mut self, v: u16) {
        self.set_pointer(Pointer::Z, v)
    }

    // --- Program memory ---

    /// Read 16-bit word from flash at word address
    #[inline(always)]
    pub fn read_program_word(&self, word_addr: u16) -> Result<u16, Fault> {
        let byte_addr = word_addr as usize * 2;
        match self.flash.get(byte_addr..byte_addr + 2) {
            Some(w) => Ok(w[0] as u16 | ((w[1] as u16) << 8)),
            None => Err(Fault::ProgramAddress { address: byte_addr as u32 }),
        }
    }

    /// Read single byte from flash at byte address (LPM)
    #[inline(always)]
    pub fn read_program_byte(&self, byte_addr: u16) -> Result<u8, Fault> {
        self.flash
            .get(byte_addr as usize)
            .copied()
            .ok_or(Fault::ProgramAddress { address: byte_addr as u32 })
    }

    /// Replace flash with `image` starting at byte 0; the remainder is erased
    /// to 0xFF.
    pub fn load_program(&mut self, image: &[u8]) -> crate::Result<()> {
        if image.len() > self.flash.len() {
            return Err(crate::Error::ProgramTooLarge { len: image.len(), capacity: self.flash.len() });
        }
        self.flash[..image.len()].copy_from_slice(image);
        self.flash[image.len()..].fill(0xFF);
        Ok(())
    }
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}
