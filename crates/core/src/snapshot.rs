//! Point-in-time copy of the full core state.
//!
//! A [`Snapshot`] is what a debugger front-end renders: SREG, MCUSR, the
//! whole data space, program memory, PC, SP, cycle counter and the run-state
//! flags. Taking one never mutates the core. The CPU-mapped registers (SREG,
//! SPH/SPL, MCUSR) in `data` agree with the dedicated fields.

use serde::{Deserialize, Serialize};

use crate::memory::{EXT_IO, IO, RAM, REGISTERS};
use crate::sreg::{ResetStatus, StatusRegister};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sreg: u8,
    pub reset_status: u8,
    /// Full data space (registers + I/O + extended I/O + SRAM)
    pub data: Vec<u8>,
    /// Full program memory
    pub program: Vec<u8>,
    /// Word address
    pub pc: u16,
    pub sp: u16,
    pub tick: u64,
    pub sleeping: bool,
    pub stopped: bool,
    pub skip_next: bool,
    pub interrupt_delay: bool,
}

impl Snapshot {
    pub fn status_register(&self) -> StatusRegister {
        StatusRegister::from_byte(self.sreg)
    }

    pub fn reset_flags(&self) -> ResetStatus {
        ResetStatus::from_byte(self.reset_status)
    }

    /// General register Rn.
    pub fn register(&self, n: u8) -> u8 {
        self.data[REGISTERS][(n & 0x1F) as usize]
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Atmega328p;

    #[test]
    fn test_snapshot_copies_state() {
        let mut a = Atmega328p::new().unwrap();
        a.mem.set_reg(17, 0x5A);
        a.mem.data[0x100] = 0xEE;
        a.cpu.sreg.z = true;
        a.cpu.pc = 0x42;
        let snap = a.snapshot();
        assert_eq!(snap.register(17), 0x5A);
        assert_eq!(snap.ram()[0], 0xEE);
        assert!(snap.status_register().z);
        assert_eq!(snap.pc, 0x42);
        assert_eq!(snap.sp, 0x08FF);
        assert!(snap.reset_flags().power_on);
        assert_eq!(snap.program.len(), 32 * 1024);
        // Mapped registers are visible in the data copy
        assert_eq!(snap.io()[0x3F], 0x02);
        assert_eq!(snap.io()[0x3E], 0x08);
        assert_eq!(snap.io()[0x3D], 0xFF);
        assert_eq!(snap.io()[0x34], 0x01);
        assert_eq!(snap.ext_io().len(), 160);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let mut a = Atmega328p::new().unwrap();
        let snap = a.snapshot();
        a.mem.set_reg(0, 1);
        a.cpu.tick = 99;
        assert_eq!(snap.register(0), 0);
        assert_eq!(snap.tick, 0);
    }
}
