//! Status register (SREG) and MCU reset-status register (MCUSR).
//!
//! Both registers are kept as named boolean flags and packed to a byte only
//! when the data bus or a snapshot needs the raw value. Bit order follows the
//! ATmega328P datasheet: the first named flag is bit 0.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{SREG_C, SREG_H, SREG_I, SREG_N, SREG_S, SREG_T, SREG_V, SREG_Z};

/// AVR status register: `I T H S V N Z C` (bits 7..0).
///
/// `s` is not derived automatically. Handlers that touch N or V are
/// responsible for writing `s = n ^ v` themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRegister {
    /// Carry
    pub c: bool,
    /// Zero
    pub z: bool,
    /// Negative
    pub n: bool,
    /// Two's complement overflow
    pub v: bool,
    /// Sign, N XOR V
    pub s: bool,
    /// Half carry
    pub h: bool,
    /// Bit copy storage (BST/BLD)
    pub t: bool,
    /// Global interrupt enable
    pub i: bool,
}

impl StatusRegister {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_byte(v: u8) -> Self {
        StatusRegister {
            c: v & (1 << SREG_C) != 0,
            z: v & (1 << SREG_Z) != 0,
            n: v & (1 << SREG_N) != 0,
            v: v & (1 << SREG_V) != 0,
            s: v & (1 << SREG_S) != 0,
            h: v & (1 << SREG_H) != 0,
            t: v & (1 << SREG_T) != 0,
            i: v & (1 << SREG_I) != 0,
        }
    }

    pub fn to_byte(&self) -> u8 {
        (self.c as u8) << SREG_C
            | (self.z as u8) << SREG_Z
            | (self.n as u8) << SREG_N
            | (self.v as u8) << SREG_V
            | (self.s as u8) << SREG_S
            | (self.h as u8) << SREG_H
            | (self.t as u8) << SREG_T
            | (self.i as u8) << SREG_I
    }

    /// Read a flag by SREG bit number (0 = C ... 7 = I).
    pub fn get(&self, bit: u8) -> bool {
        match bit & 7 {
            SREG_C => self.c,
            SREG_Z => self.z,
            SREG_N => self.n,
            SREG_V => self.v,
            SREG_S => self.s,
            SREG_H => self.h,
            SREG_T => self.t,
            _ => self.i,
        }
    }

    /// Write a flag by SREG bit number.
    pub fn set(&mut self, bit: u8, value: bool) {
        match bit & 7 {
            SREG_C => self.c = value,
            SREG_Z => self.z = value,
            SREG_N => self.n = value,
            SREG_V => self.v = value,
            SREG_S => self.s = value,
            SREG_H => self.h = value,
            SREG_T => self.t = value,
            _ => self.i = value,
        }
    }
}

/// Flag string like `ithsvnzc` (lowercase = clear, uppercase = set).
impl fmt::Display for StatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let byte = self.to_byte();
        for (i, flag) in "ITHSVNZC".chars().enumerate() {
            let set = byte & (0x80 >> i) != 0;
            write!(f, "{}", if set { flag } else { flag.to_ascii_lowercase() })?;
        }
        Ok(())
    }
}

/// Reset-source flags (MCUSR).
///
/// | Bit | Flag  | Source      |
/// |-----|-------|-------------|
/// | 0   | PORF  | power-on    |
/// | 1   | EXTRF | external    |
/// | 2   | BORF  | brown-out   |
/// | 3   | WDRF  | watchdog    |
/// | 4–7 | -     | reserved    |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetStatus {
    pub power_on: bool,
    pub external: bool,
    pub brown_out: bool,
    pub watchdog: bool,
    /// Reserved bits 4..7, kept so that byte conversion round-trips.
    pub reserved: u8,
}

pub const PORF: u8 = 0;
pub const EXTRF: u8 = 1;
pub const BORF: u8 = 2;
pub const WDRF: u8 = 3;

impl ResetStatus {
    /// State after a power-on reset: only PORF set.
    pub fn power_on() -> Self {
        ResetStatus { power_on: true, ..Self::default() }
    }

    pub fn from_byte(v: u8) -> Self {
        ResetStatus {
            power_on: v & (1 << PORF) != 0,
            external: v & (1 << EXTRF) != 0,
            brown_out: v & (1 << BORF) != 0,
            watchdog: v & (1 << WDRF) != 0,
            reserved: v >> 4,
        }
    }

    pub fn to_byte(&self) -> u8 {
        (self.power_on as u8) << PORF
            | (self.external as u8) << EXTRF
            | (self.brown_out as u8) << BORF
            | (self.watchdog as u8) << WDRF
            | (self.reserved & 0x0F) << 4
    }

    /// Acknowledge reset flags: every flag whose bit is 1 in `mask` is cleared.
    /// Returns the value before clearing.
    pub fn acknowledge(&mut self, mask: u8) -> u8 {
        let before = self.to_byte();
        *self = Self::from_byte(before & !(mask & 0x0F));
        before
    }

    /// Apply a firmware write through the data bus. Flags are cleared by
    /// writing 0 and cannot be set from software.
    pub fn bus_write(&mut self, v: u8) {
        let kept = self.to_byte() & (v | 0xF0);
        *self = Self::from_byte(kept);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sreg_byte_packing() {
        let mut s = StatusRegister::new();
        s.c = true;
        s.i = true;
        assert_eq!(s.to_byte(), 0b1000_0001);
        let back = StatusRegister::from_byte(0b0101_1010);
        assert!(back.z && back.v && back.s && back.t);
        assert!(!back.c && !back.n && !back.h && !back.i);
        assert_eq!(back.to_byte(), 0b0101_1010);
    }

    #[test]
    fn test_sreg_every_byte_round_trips() {
        for v in 0..=255u8 {
            assert_eq!(StatusRegister::from_byte(v).to_byte(), v);
        }
    }

    #[test]
    fn test_sreg_get_set_by_bit() {
        let mut s = StatusRegister::new();
        for bit in 0..8 {
            s.set(bit, true);
            assert!(s.get(bit));
            assert_eq!(s.to_byte(), 1 << bit);
            s.set(bit, false);
        }
        assert_eq!(s.to_byte(), 0);
    }

    #[test]
    fn test_sreg_display() {
        assert_eq!(StatusRegister::from_byte(0xFF).to_string(), "ITHSVNZC");
        assert_eq!(StatusRegister::from_byte(0x00).to_string(), "ithsvnzc");
        // 0x83 = I, Z, C
        assert_eq!(StatusRegister::from_byte(0x83).to_string(), "IthsvnZC");
    }

    #[test]
    fn test_reset_status_acknowledge() {
        let mut r = ResetStatus::power_on();
        r.external = true;
        assert_eq!(r.to_byte(), 0b0000_0011);
        let before = r.acknowledge(1 << PORF);
        assert_eq!(before, 0b0000_0011);
        assert!(!r.power_on);
        assert!(r.external);
        // Writing zeros to the mask leaves flags alone
        r.acknowledge(0);
        assert!(r.external);
    }

    #[test]
    fn test_reset_status_bus_write_clears_with_zero() {
        let mut r = ResetStatus::from_byte(0x0F);
        r.bus_write(0b1111_1101);
        assert!(!r.external);
        assert!(r.power_on && r.brown_out && r.watchdog);
        // Software cannot set a flag
        let mut r = ResetStatus::default();
        r.bus_write(0xFF);
        assert_eq!(r.to_byte(), 0);
    }
}
