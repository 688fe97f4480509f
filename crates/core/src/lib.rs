//! # atmega328p-core
//!
//! Cycle-level emulation core for the ATmega328P microcontroller (Arduino
//! Uno class): 16 MHz clock, 32 KB flash, 2 KB SRAM, 26-entry interrupt
//! vector table.
//!
//! The crate covers the instruction fetch-decode-execute engine, the unified
//! data-space memory model and the interrupt controller. Peripherals (timers,
//! USART, ADC and so on) are outside the core: they read and write their
//! registers through the data space and raise interrupts through a
//! [`CoreHandle`].
//!
//! ## Architecture
//!
//! - [`Atmega328p`]: Execution core wiring CPU, memory, instruction table and interrupts
//! - [`Cpu`]: Registers that live outside data memory (PC, SP, SREG, MCUSR, cycle counter)
//! - [`Memory`]: Unified data space (registers + I/O + extended I/O + SRAM) and flash
//! - [`opcodes`]: Instruction catalog and the 64K-entry lookup table built from it
//! - [`decoder`]: One- and two-word instruction fetch
//! - [`interrupt`]: Vector table, pending requests, cross-thread [`CoreHandle`]
//! - [`disasm`]: Instruction disassembler for debug views
//! - [`snapshot`] / [`savestate`]: State inspection and compressed save files
//!
//! ## Example
//!
//! ```
//! use atmega328p_core::Atmega328p;
//!
//! let mut core = Atmega328p::new().unwrap();
//! // LDI R16, 0x2A ; BREAK
//! core.load_program(&[0x0A, 0xE2, 0x98, 0x95]).unwrap();
//! core.run_until_stopped();
//! assert_eq!(core.mem.reg(16), 0x2A);
//! ```

pub mod config;
pub mod cpu;
pub mod decoder;
pub mod disasm;
pub mod error;
pub mod interrupt;
pub mod memory;
pub mod opcodes;
pub mod operands;
pub mod savestate;
pub mod snapshot;
pub mod sreg;

use std::thread;
use std::time::{Duration, Instant};

pub use config::{CoreConfig, Pacing};
pub use cpu::Cpu;
pub use decoder::Decoded;
pub use error::{CatalogError, Error, Fault, FaultHandler, LogFaultHandler, Result};
pub use interrupt::{CoreHandle, Vector};
pub use memory::{AddressMode, Memory, Pointer};
pub use snapshot::Snapshot;
pub use sreg::{ResetStatus, StatusRegister};

use interrupt::InterruptController;
use opcodes::InstructionTable;

// ATmega328P constants
/// Flash memory size: 32 KB
pub const FLASH_SIZE: usize = 32 * 1024;
/// Boot section: last 512 bytes of flash
pub const BOOT_SECTION_SIZE: usize = 512;
/// SRAM size: 2 KB
pub const SRAM_SIZE: usize = 2 * 1024;
/// CPU clock frequency: 16 MHz
pub const CLOCK_HZ: u32 = 16_000_000;

/// Number of general-purpose registers (R0–R31)
pub const REG_COUNT: usize = 32;
/// I/O register space reachable by IN/OUT (0x20..0x5F)
pub const IO_SIZE: usize = 64;
/// Extended I/O register space (0x60..0xFF)
pub const EXT_IO_SIZE: usize = 160;
/// Total data space: registers + I/O + extended I/O + SRAM
pub const DATA_SIZE: usize = REG_COUNT + IO_SIZE + EXT_IO_SIZE + SRAM_SIZE;
/// Last SRAM address, the power-on stack pointer
pub const RAMEND: u16 = (DATA_SIZE - 1) as u16;
/// Data-space address of I/O register 0
pub const IO_BASE: u16 = REG_COUNT as u16;
/// Program counter width: 16K words
pub const PC_MASK: u16 = (FLASH_SIZE / 2 - 1) as u16;

/// Interrupt entry cost
pub const INTERRUPT_CYCLES: u64 = 4;
/// Additional cost when the interrupt wakes the CPU from sleep
pub const WAKE_CYCLES: u64 = 4;

// SREG bit positions
pub const SREG_C: u8 = 0;
pub const SREG_Z: u8 = 1;
pub const SREG_N: u8 = 2;
pub const SREG_V: u8 = 3;
pub const SREG_S: u8 = 4;
pub const SREG_H: u8 = 5;
pub const SREG_T: u8 = 6;
pub const SREG_I: u8 = 7;

// CPU-mapped I/O registers (data space addresses, not I/O addresses)
pub const SREG_ADDR: u16 = 0x5F;
pub const SPH_ADDR: u16 = 0x5E;
pub const SPL_ADDR: u16 = 0x5D;
pub const MCUSR_ADDR: u16 = 0x54;

/// ATmega328P execution core.
///
/// Owns all mutable state; there are no globals, so independent instances can
/// run side by side. The instruction table is shared read-only.
pub struct Atmega328p {
    pub cpu: Cpu,
    pub mem: Memory,
    table: &'static InstructionTable,
    interrupts: InterruptController,
    fault_handler: Box<dyn FaultHandler>,
    config: CoreConfig,
    /// Instruction executed by the most recent step
    current: Option<Decoded>,
    last_fault: Option<Fault>,
}

impl Atmega328p {
    /// Create a core with the default configuration in power-on state.
    pub fn new() -> Result<Self> {
        Self::with_config(CoreConfig::default())
    }

    pub fn with_config(config: CoreConfig) -> Result<Self> {
        let mut core = Atmega328p {
            cpu: Cpu::new(),
            mem: Memory::new(),
            table: InstructionTable::global()?,
            interrupts: InterruptController::new(),
            fault_handler: Box::new(LogFaultHandler),
            config,
            current: None,
            last_fault: None,
        };
        core.initialize();
        Ok(core)
    }

    /// Power-on reset: CPU state and data memory return to their initial
    /// values and pending interrupts are dropped. Program memory is kept.
    pub fn initialize(&mut self) {
        self.cpu = Cpu::new();
        self.mem.clear_data();
        self.interrupts.clear_pending();
        self.interrupts.take_stop_request();
        self.current = None;
        self.last_fault = None;
        self.interrupts.set_global_enable(false);
        self.sync_mapped_registers();
        log::debug!("power-on reset");
    }

    /// Copy a program image into flash at address 0.
    pub fn load_program(&mut self, image: &[u8]) -> Result<()> {
        self.mem.load_program(image)?;
        log::info!("loaded {} bytes of program memory", image.len());
        Ok(())
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn instruction_table(&self) -> &'static InstructionTable {
        self.table
    }

    /// Handle for requesting interrupts or a stop from other threads.
    pub fn handle(&self) -> CoreHandle {
        self.interrupts.handle()
    }

    /// Register the collaborator invoked when execution faults.
    pub fn set_fault_handler(&mut self, handler: Box<dyn FaultHandler>) {
        self.fault_handler = handler;
    }

    /// Fault that stopped the core, if any.
    pub fn last_fault(&self) -> Option<&Fault> {
        self.last_fault.as_ref()
    }

    /// Instruction executed by the most recent step.
    pub fn current(&self) -> Option<&Decoded> {
        self.current.as_ref()
    }

    // --- Data bus ---

    /// Read from data space. SREG, SPH/SPL and MCUSR come from the CPU.
    pub fn read_data(&self, addr: u16) -> std::result::Result<u8, Fault> {
        match addr {
            SREG_ADDR => Ok(self.cpu.sreg.to_byte()),
            SPH_ADDR => Ok((self.cpu.sp >> 8) as u8),
            SPL_ADDR => Ok(self.cpu.sp as u8),
            MCUSR_ADDR => Ok(self.cpu.reset_status.to_byte()),
            _ => self.mem.read(addr),
        }
    }

    /// Write to data space. Writes to SREG, SPH/SPL and MCUSR update the CPU.
    pub fn write_data(&mut self, addr: u16, value: u8) -> std::result::Result<(), Fault> {
        match addr {
            SREG_ADDR => self.cpu.sreg = StatusRegister::from_byte(value),
            SPH_ADDR => self.cpu.sp = (self.cpu.sp & 0x00FF) | (value as u16) << 8,
            SPL_ADDR => self.cpu.sp = (self.cpu.sp & 0xFF00) | value as u16,
            MCUSR_ADDR => self.cpu.reset_status.bus_write(value),
            _ => return self.mem.write(addr, value),
        }
        self.sync_mapped_registers();
        Ok(())
    }

    fn mapped_registers(&self) -> [(u16, u8); 4] {
        [
            (SREG_ADDR, self.cpu.sreg.to_byte()),
            (SPH_ADDR, (self.cpu.sp >> 8) as u8),
            (SPL_ADDR, self.cpu.sp as u8),
            (MCUSR_ADDR, self.cpu.reset_status.to_byte()),
        ]
    }

    /// Mirror CPU-held registers into their data-space bytes.
    fn sync_mapped_registers(&mut self) {
        for (addr, v) in self.mapped_registers() {
            self.mem.data[addr as usize] = v;
        }
    }

    // --- Stack ---

    /// Store at SP, then decrement SP.
    pub fn push8(&mut self, v: u8) -> std::result::Result<(), Fault> {
        self.mem.write(self.cpu.sp, v)?;
        self.cpu.sp = self.cpu.sp.wrapping_sub(1);
        Ok(())
    }

    /// Increment SP, then load from it.
    pub fn pop8(&mut self) -> std::result::Result<u8, Fault> {
        let sp = self.cpu.sp.wrapping_add(1);
        let v = self.mem.read(sp)?;
        self.cpu.sp = sp;
        Ok(v)
    }

    /// Push a return address: low byte first, so it ends up at the higher address.
    /// Both stack slots are checked before anything is written.
    pub fn push16(&mut self, v: u16) -> std::result::Result<(), Fault> {
        self.check_stack(self.cpu.sp.wrapping_sub(1))?;
        self.push8(v as u8)?;
        self.push8((v >> 8) as u8)
    }

    pub fn pop16(&mut self) -> std::result::Result<u16, Fault> {
        self.check_stack(self.cpu.sp.wrapping_add(2))?;
        let hi = self.pop8()?;
        let lo = self.pop8()?;
        Ok((hi as u16) << 8 | lo as u16)
    }

    fn check_stack(&self, addr: u16) -> std::result::Result<(), Fault> {
        self.mem.read(addr).map(|_| ())
    }

    // --- Execution ---

    /// Run one instruction boundary: take a pending interrupt, idle one
    /// cycle while sleeping, or fetch and execute one instruction.
    ///
    /// Returns `false` once the core is stopped (BREAK, fault or stop
    /// request). A fault leaves the CPU registers as they were before the
    /// faulting instruction and is handed to the fault handler exactly once.
    pub fn step(&mut self) -> bool {
        if self.interrupts.take_snapshot_request() {
            self.interrupts.publish_snapshot(self.snapshot());
        }
        if self.cpu.stopped {
            return false;
        }
        if self.interrupts.take_stop_request() {
            self.cpu.stopped = true;
            log::debug!("stop requested at pc=0x{:04X}", self.cpu.pc);
            return false;
        }

        let before = self.cpu.clone();
        if let Err(fault) = self.try_step() {
            self.cpu = Cpu { stopped: true, ..before };
            self.current = None;
            self.fault_handler.on_fault(&fault);
            self.last_fault = Some(fault);
        }
        self.interrupts.set_global_enable(self.cpu.sreg.i);
        self.sync_mapped_registers();
        !self.cpu.stopped
    }

    fn try_step(&mut self) -> std::result::Result<(), Fault> {
        self.current = None;
        if self.service_interrupt()? {
            return Ok(());
        }
        if self.cpu.sleeping {
            self.cpu.tick += 1;
            return Ok(());
        }

        let fetched = decoder::fetch(&self.mem, self.table, self.cpu.pc);
        if self.cpu.skip_next {
            // The skipped word only has to be sized, never executed.
            self.cpu.skip_next = false;
            let len = fetched.map(|inst| inst.descriptor.length).unwrap_or(1);
            self.cpu.pc = self.cpu.pc.wrapping_add(len as u16) & PC_MASK;
            self.cpu.tick += len as u64;
            return Ok(());
        }

        let inst = fetched?;
        self.current = Some(inst);
        self.cpu.pc = inst.next_pc();
        let cycles = self.execute(&inst)?;
        self.cpu.tick += cycles as u64;
        log::trace!(
            "0x{:04X}: {:08X} {:<6} [{}] +{}",
            inst.pc as u32 * 2,
            inst.opcode,
            inst.descriptor.name,
            self.cpu.sreg,
            cycles
        );
        Ok(())
    }

    /// Enter the highest-priority pending interrupt, if one may be taken now.
    fn service_interrupt(&mut self) -> std::result::Result<bool, Fault> {
        if self.cpu.skip_next {
            return Ok(false);
        }
        if self.cpu.interrupt_delay {
            self.cpu.interrupt_delay = false;
            return Ok(false);
        }
        let Some(vector) = self.interrupts.next_pending(self.cpu.sreg.i) else {
            return Ok(false);
        };
        self.interrupts.acknowledge(vector);
        if vector == Vector::Reset {
            self.external_reset();
            return Ok(true);
        }

        let woke = self.cpu.sleeping;
        self.cpu.sleeping = false;
        self.cpu.sreg.i = false;
        let ret = self.cpu.pc;
        self.push16(ret)?;
        self.cpu.pc = vector.address();
        self.cpu.tick += INTERRUPT_CYCLES + if woke { WAKE_CYCLES } else { 0 };
        log::debug!(
            "interrupt {:?} at pc=0x{:04X}{}",
            vector,
            ret as u32 * 2,
            if woke { " (wake)" } else { "" }
        );
        Ok(true)
    }

    /// RESET request: like power-on, but the external-reset flag is added to
    /// the reset status and the cycle counter keeps running.
    fn external_reset(&mut self) {
        let mut reset_status = self.cpu.reset_status;
        reset_status.external = true;
        self.cpu = Cpu { reset_status, tick: self.cpu.tick, ..Cpu::new() };
        self.mem.clear_data();
        self.interrupts.clear_pending();
        log::debug!("external reset");
    }

    /// Step until the core stops. Returns the number of cycles run.
    ///
    /// With [`Pacing::RealTime`] the loop sleeps every
    /// `pacing_quantum_cycles` so that simulated time keeps pace with
    /// `clock_hz`.
    pub fn run_until_stopped(&mut self) -> u64 {
        let start_tick = self.cpu.tick;
        let started = Instant::now();
        let quantum = self.config.pacing_quantum_cycles.max(1);
        let mut next_check = start_tick + quantum;

        while self.step() {
            if self.config.pacing == Pacing::RealTime && self.cpu.tick >= next_check {
                next_check = self.cpu.tick + quantum;
                self.pace(started, self.cpu.tick - start_tick);
            }
        }
        if self.config.pacing == Pacing::RealTime {
            self.pace(started, self.cpu.tick - start_tick);
        }

        let ran = self.cpu.tick - start_tick;
        log::info!("stopped at 0x{:04X} after {} cycles", self.cpu.pc as u32 * 2, ran);
        ran
    }

    fn pace(&self, started: Instant, cycles: u64) {
        let target = Duration::from_secs_f64(cycles as f64 / self.config.clock_hz.max(1) as f64);
        if let Some(ahead) = target.checked_sub(started.elapsed()) {
            thread::sleep(ahead);
        }
    }

    /// Clear the sleeping and stopped flags.
    pub fn resume(&mut self) {
        self.cpu.sleeping = false;
        self.cpu.stopped = false;
        self.last_fault = None;
    }

    /// Signal an interrupt. See [`CoreHandle::request_interrupt`].
    pub fn request_interrupt(&self, vector: Vector) -> bool {
        self.interrupts.set_global_enable(self.cpu.sreg.i);
        self.interrupts.request(vector)
    }

    // --- State inspection ---

    /// Copy out the full core state.
    ///
    /// While the core runs on another thread, use
    /// [`CoreHandle::request_snapshot`] instead; the copy is taken at the next
    /// instruction boundary and execution carries on.
    pub fn snapshot(&self) -> Snapshot {
        let mut data = self.mem.data.clone();
        for (addr, v) in self.mapped_registers() {
            data[addr as usize] = v;
        }
        Snapshot {
            sreg: self.cpu.sreg.to_byte(),
            reset_status: self.cpu.reset_status.to_byte(),
            data,
            program: self.mem.flash.clone(),
            pc: self.cpu.pc,
            sp: self.cpu.sp,
            tick: self.cpu.tick,
            sleeping: self.cpu.sleeping,
            stopped: self.cpu.stopped,
            skip_next: self.cpu.skip_next,
            interrupt_delay: self.cpu.interrupt_delay,
        }
    }

    /// Load a snapshot back into the core. Pending interrupts are dropped.
    pub fn restore(&mut self, snap: &Snapshot) -> Result<()> {
        if snap.data.len() != DATA_SIZE || snap.program.len() != FLASH_SIZE {
            return Err(Error::InvalidSaveState(format!(
                "snapshot memory sizes {}/{} do not match the device",
                snap.data.len(),
                snap.program.len()
            )));
        }
        self.mem.data.copy_from_slice(&snap.data);
        self.mem.flash.copy_from_slice(&snap.program);
        self.cpu = Cpu {
            pc: snap.pc & PC_MASK,
            sp: snap.sp,
            sreg: StatusRegister::from_byte(snap.sreg),
            reset_status: ResetStatus::from_byte(snap.reset_status),
            tick: snap.tick,
            sleeping: snap.sleeping,
            stopped: snap.stopped,
            skip_next: snap.skip_next,
            interrupt_delay: snap.interrupt_delay,
        };
        self.interrupts.clear_pending();
        self.interrupts.set_global_enable(self.cpu.sreg.i);
        self.current = None;
        self.last_fault = None;
        self.sync_mapped_registers();
        Ok(())
    }

    /// Execute a single step and return the disassembly of what ran.
    ///
    /// Used by debuggers for step-by-step execution.
    pub fn step_one(&mut self) -> String {
        let pc = self.cpu.pc;
        if self.cpu.stopped {
            return format!("0x{:04X}: (stopped)", pc as u32 * 2);
        }
        let skipping = self.cpu.skip_next;
        self.step();
        match (&self.current, &self.last_fault) {
            (_, Some(fault)) => format!("0x{:04X}: {}", pc as u32 * 2, fault),
            (Some(inst), None) => format!("0x{:04X}: {}", inst.pc as u32 * 2, disasm::disassemble_decoded(inst)),
            (None, None) if skipping => format!("0x{:04X}: (skipped)", pc as u32 * 2),
            (None, None) => format!("0x{:04X}: -> 0x{:04X}", pc as u32 * 2, self.cpu.pc as u32 * 2),
        }
    }

    /// Disassemble the instruction at the current PC without executing it.
    pub fn disasm_at_pc(&self) -> String {
        let pc = self.cpu.pc;
        let asm = match decoder::fetch(&self.mem, self.table, pc) {
            Ok(inst) => disasm::disassemble_decoded(&inst),
            Err(fault) => fault.to_string(),
        };
        format!("0x{:04X}: {}", pc as u32 * 2, asm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn program(words: &[u16]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    fn core_with(words: &[u16]) -> Atmega328p {
        let mut a = Atmega328p::new().unwrap();
        a.load_program(&program(words)).unwrap();
        a
    }

    fn capture_faults(a: &mut Atmega328p) -> Arc<Mutex<Vec<Fault>>> {
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        a.set_fault_handler(Box::new(move |f: &Fault| sink.lock().unwrap().push(f.clone())));
        faults
    }

    const NOP: u16 = 0x0000;
    const SEI: u16 = 0x9478;
    const RETI: u16 = 0x9518;
    const SLEEP: u16 = 0x9588;
    const BREAK: u16 = 0x9598;

    #[test]
    fn test_power_on_state() {
        let a = Atmega328p::new().unwrap();
        assert_eq!(a.cpu.pc, 0);
        assert_eq!(a.cpu.sp, RAMEND);
        assert_eq!(a.cpu.sreg.to_byte(), 0);
        assert!(a.cpu.reset_status.power_on);
        assert_eq!(a.read_data(SPL_ADDR).unwrap(), 0xFF);
        assert_eq!(a.read_data(SPH_ADDR).unwrap(), 0x08);
        assert_eq!(a.mem.data[MCUSR_ADDR as usize], 0x01);
        assert_eq!(DATA_SIZE, 0x900);
        assert_eq!(PC_MASK, 0x3FFF);
    }

    #[test]
    fn test_add_then_break_scenario() {
        // ADD R0, R1 ; BREAK
        let mut a = core_with(&[0x0C01, BREAK]);
        a.mem.set_reg(0, 0x80);
        a.mem.set_reg(1, 0x80);
        assert!(a.step());
        assert!(!a.step());
        assert_eq!(a.mem.reg(0), 0x00);
        // C, Z, V, S
        assert_eq!(a.cpu.sreg.to_byte(), 0x1B);
        assert_eq!(a.cpu.tick, 2);
        assert_eq!(a.cpu.pc, 2);
        assert!(a.cpu.stopped);
        assert!(a.last_fault().is_none());
    }

    #[test]
    fn test_decode_fault_reported_once() {
        // NOP, then erased flash (0xFFFF)
        let mut a = core_with(&[NOP]);
        let faults = capture_faults(&mut a);
        assert_eq!(a.run_until_stopped(), 1);
        assert_eq!(a.cpu.pc, 1);
        assert!(a.cpu.stopped);
        assert!(!a.step());
        assert_eq!(a.cpu.pc, 1);
        let faults = faults.lock().unwrap();
        assert_eq!(faults.as_slice(), &[Fault::Decode { pc: 1, opcode: 0xFFFF }]);
        assert_eq!(a.last_fault(), Some(&Fault::Decode { pc: 1, opcode: 0xFFFF }));
    }

    #[test]
    fn test_data_fault_does_not_advance_pc() {
        // LDI R31, 0x09 ; LD R0, Z
        let mut a = core_with(&[0xE0F9, 0x8000]);
        let faults = capture_faults(&mut a);
        a.run_until_stopped();
        assert_eq!(a.cpu.pc, 1);
        assert_eq!(faults.lock().unwrap().as_slice(), &[Fault::DataAddress { address: 0x0900 }]);
    }

    #[test]
    fn test_resume_after_break() {
        let mut a = core_with(&[BREAK, 0xE021, BREAK]); // BREAK ; LDI R18, 1 ; BREAK
        a.run_until_stopped();
        assert_eq!(a.cpu.pc, 1);
        a.resume();
        a.run_until_stopped();
        assert_eq!(a.mem.reg(18), 1);
        assert_eq!(a.cpu.pc, 3);
    }

    #[test]
    fn test_interrupt_priority() {
        let mut a = core_with(&[NOP; 8]);
        a.cpu.sreg.i = true;
        assert!(a.request_interrupt(Vector::Timer0Ovf));
        assert!(a.request_interrupt(Vector::Int1));
        a.step();
        assert_eq!(a.cpu.pc, Vector::Int1.address());
        assert!(!a.cpu.sreg.i);
        assert_eq!(a.cpu.tick, INTERRUPT_CYCLES);
        assert_eq!(a.cpu.sp, RAMEND - 2);
        assert!(a.handle().is_pending(Vector::Timer0Ovf));
        assert!(!a.handle().is_pending(Vector::Int1));

        // I is clear inside the ISR, so the next boundary runs an instruction
        a.step();
        assert_eq!(a.cpu.pc, Vector::Int1.address() + 1);
        a.cpu.sreg.i = true;
        a.step();
        assert_eq!(a.cpu.pc, Vector::Timer0Ovf.address());
        assert!(!a.handle().is_pending(Vector::Timer0Ovf));
    }

    #[test]
    fn test_interrupt_follows_instruction_after_sei() {
        let mut a = core_with(&[SEI, NOP, NOP, NOP, RETI]);
        a.step(); // SEI
        assert!(a.request_interrupt(Vector::Int1));
        a.step(); // NOP at 1 still runs
        assert_eq!(a.cpu.pc, 2);
        a.step(); // enter INT1
        assert_eq!(a.cpu.pc, 4);
        assert_eq!(a.cpu.tick, 2 + INTERRUPT_CYCLES);
        a.step(); // RETI
        assert_eq!(a.cpu.pc, 2);
        assert!(a.cpu.sreg.i);
        assert_eq!(a.cpu.sp, RAMEND);
    }

    #[test]
    fn test_sleep_wakes_on_interrupt() {
        let mut a = core_with(&[SEI, SLEEP, NOP, NOP, RETI]);
        a.step();
        a.step();
        assert!(a.cpu.sleeping);
        assert!(a.step());
        assert_eq!(a.cpu.pc, 2);
        assert_eq!(a.cpu.tick, 3);
        a.request_interrupt(Vector::Int1);
        a.step();
        assert!(!a.cpu.sleeping);
        assert_eq!(a.cpu.pc, 4);
        assert_eq!(a.cpu.tick, 3 + INTERRUPT_CYCLES + WAKE_CYCLES);
    }

    #[test]
    fn test_interrupt_dropped_while_disabled() {
        let mut a = core_with(&[NOP, NOP]);
        assert!(!a.request_interrupt(Vector::Int0));
        a.step();
        assert_eq!(a.cpu.pc, 1);
        a.cpu.sreg.i = true;
        a.handle().set_vector_enabled(Vector::Int0, false);
        assert!(!a.request_interrupt(Vector::Int0));
    }

    #[test]
    fn test_no_interrupt_while_skip_latched() {
        // LDI R16, 1 ; SBRS R16, 0 ; NOP ; NOP
        let mut a = core_with(&[0xE001, 0xFF00, NOP, NOP]);
        a.cpu.sreg.i = true;
        a.step();
        a.step();
        assert!(a.cpu.skip_next);
        a.request_interrupt(Vector::Int0);
        a.step(); // skip consumes the NOP at 2
        assert_eq!(a.cpu.pc, 3);
        a.step();
        assert_eq!(a.cpu.pc, Vector::Int0.address());
        // Return address is the instruction after the skipped one
        assert_eq!(a.pop16().unwrap(), 3);
    }

    #[test]
    fn test_skip_two_word_instruction() {
        // LDI R16, 1 ; SBRS R16, 0 ; JMP 0x0100 ; LDI R17, 5 ; BREAK
        let mut a = core_with(&[0xE001, 0xFF00, 0x940C, 0x0100, 0xE015, BREAK]);
        assert_eq!(a.run_until_stopped(), 1 + 1 + 2 + 1 + 1);
        assert_eq!(a.mem.reg(17), 5);
        assert_eq!(a.cpu.pc, 6);
    }

    #[test]
    fn test_skip_one_word_instruction() {
        // CPSE R0, R0 ; LDI R18, 2 ; BREAK
        let mut a = core_with(&[0x1000, 0xE022, BREAK]);
        assert_eq!(a.run_until_stopped(), 3);
        assert_eq!(a.mem.reg(18), 0);
    }

    #[test]
    fn test_stack_symmetry() {
        let mut a = Atmega328p::new().unwrap();
        let sp0 = a.cpu.sp;
        for i in 0..10u8 {
            a.push8(i).unwrap();
        }
        assert_eq!(a.cpu.sp, sp0 - 10);
        for i in (0..10u8).rev() {
            assert_eq!(a.pop8().unwrap(), i);
        }
        assert_eq!(a.cpu.sp, sp0);

        a.push16(0xBEEF).unwrap();
        assert_eq!(a.cpu.sp, sp0 - 2);
        assert_eq!(a.pop16().unwrap(), 0xBEEF);
        assert_eq!(a.cpu.sp, sp0);
    }

    #[test]
    fn test_stack_overflow_past_data_space_faults() {
        let mut a = Atmega328p::new().unwrap();
        a.cpu.sp = RAMEND;
        assert_eq!(a.pop8(), Err(Fault::DataAddress { address: 0x0900 }));
        assert_eq!(a.cpu.sp, RAMEND);
    }

    #[test]
    fn test_external_reset() {
        let mut a = core_with(&[NOP, NOP, NOP]);
        a.step();
        a.step();
        a.mem.data[0x300] = 0xAA;
        a.cpu.reset_status.acknowledge(0xFF);
        assert!(a.request_interrupt(Vector::Reset));
        a.step();
        assert_eq!(a.cpu.pc, 0);
        assert_eq!(a.cpu.sp, RAMEND);
        assert_eq!(a.mem.data[0x300], 0);
        assert!(a.cpu.reset_status.external);
        assert!(!a.cpu.reset_status.power_on);
        assert_eq!(a.cpu.tick, 2);
        assert_eq!(a.mem.read_program_word(1).unwrap(), NOP);
    }

    #[test]
    fn test_handle_from_another_thread() {
        let mut a = core_with(&[NOP; 4]);
        a.cpu.sreg.i = true;
        a.step();
        let h = a.handle();
        thread::spawn(move || assert!(h.request_interrupt(Vector::Int0)))
            .join()
            .unwrap();
        a.step();
        assert_eq!(a.cpu.pc, Vector::Int0.address());
    }

    #[test]
    fn test_faulting_post_increment_keeps_pointer() {
        // LD R0, X+
        let mut a = core_with(&[0x900D]);
        let faults = capture_faults(&mut a);
        a.mem.set_x(0x0900);
        assert!(!a.step());
        assert_eq!(a.cpu.pc, 0);
        assert_eq!(a.mem.x(), 0x0900);
        assert_eq!(faults.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_faulting_pre_decrement_keeps_pointer() {
        // LD R0, -X
        let mut a = core_with(&[0x900E]);
        capture_faults(&mut a);
        a.mem.set_x(0);
        assert!(!a.step());
        assert_eq!(a.mem.x(), 0);
        assert_eq!(a.last_fault(), Some(&Fault::DataAddress { address: 0xFFFF }));
    }

    #[test]
    fn test_faulting_call_leaves_stack_untouched() {
        // RCALL .+0
        let mut a = core_with(&[0xD000]);
        capture_faults(&mut a);
        a.cpu.sp = 0;
        a.mem.set_reg(0, 0xAA);
        assert!(!a.step());
        assert_eq!(a.cpu.pc, 0);
        assert_eq!(a.cpu.sp, 0);
        assert_eq!(a.cpu.tick, 0);
        assert_eq!(a.mem.reg(0), 0xAA);

        // Retried after resume, the same fault is raised from the same state
        a.resume();
        assert!(!a.step());
        assert_eq!(a.cpu.sp, 0);
        assert_eq!(a.mem.reg(0), 0xAA);
    }

    #[test]
    fn test_faulting_ret_leaves_stack_untouched() {
        let mut a = core_with(&[0x9508]); // RET
        capture_faults(&mut a);
        a.cpu.sp = RAMEND - 1;
        assert!(!a.step());
        assert_eq!(a.cpu.sp, RAMEND - 1);
    }

    #[test]
    fn test_step_one_reports_execute_fault() {
        let mut a = core_with(&[0x900D]);
        capture_faults(&mut a);
        a.mem.set_x(0x0900);
        assert_eq!(a.step_one(), "0x0000: data address 0x0900 is outside data memory");
        assert!(a.current().is_none());
    }

    #[test]
    fn test_snapshot_while_running_on_another_thread() {
        // RJMP .-1
        let mut a = core_with(&[0xCFFF]);
        let h = a.handle();
        let runner = thread::spawn(move || {
            a.run_until_stopped();
            a
        });

        h.request_snapshot();
        let started = Instant::now();
        let snap = loop {
            if let Some(snap) = h.take_snapshot() {
                break snap;
            }
            assert!(started.elapsed() < Duration::from_secs(5));
            thread::yield_now();
        };
        assert_eq!(snap.pc, 0);
        assert!(!snap.stopped);

        h.request_stop();
        let a = runner.join().unwrap();
        assert!(a.cpu.stopped);
        assert!(a.cpu.tick >= snap.tick);
    }

    #[test]
    fn test_stop_request_and_resume() {
        let mut a = core_with(&[NOP; 4]);
        a.handle().request_stop();
        assert!(!a.step());
        assert_eq!(a.cpu.pc, 0);
        a.resume();
        assert!(a.step());
        assert_eq!(a.cpu.pc, 1);
    }

    // LDI R24, 0xFF ; LDI R25, 0x0F ; SBIW R24, 1 ; BRNE .-2 ; BREAK
    const DELAY_LOOP: [u16; 5] = [0xEF8F, 0xE09F, 0x9701, 0xF7F1, BREAK];
    const DELAY_CYCLES: u64 = 2 + 4095 * 2 + 4094 * 2 + 1 + 1;

    #[test]
    fn test_run_until_stopped_counts_cycles() {
        let mut a = core_with(&DELAY_LOOP);
        assert_eq!(a.run_until_stopped(), DELAY_CYCLES);
        assert_eq!(a.mem.word_reg(24), 0);
    }

    #[test]
    fn test_real_time_pacing() {
        let mut a = Atmega328p::with_config(CoreConfig::real_time()).unwrap();
        a.load_program(&program(&DELAY_LOOP)).unwrap();
        let started = Instant::now();
        assert_eq!(a.run_until_stopped(), DELAY_CYCLES);
        // 16382 cycles at 16 MHz is just over 1 ms
        assert!(started.elapsed() >= Duration::from_micros(1000));
    }

    #[test]
    fn test_mapped_registers_follow_cpu() {
        // SEC ; LDI R16, 0x40 ; OUT SPL, R16
        let mut a = core_with(&[0x9408, 0xE400, 0xBF0D]);
        a.step();
        assert_eq!(a.mem.data[SREG_ADDR as usize], 0x01);
        a.step();
        a.step();
        assert_eq!(a.cpu.sp, 0x0840);
        assert_eq!(a.mem.data[SPL_ADDR as usize], 0x40);
    }

    #[test]
    fn test_mcusr_write_zero_clears() {
        let mut a = Atmega328p::new().unwrap();
        a.write_data(MCUSR_ADDR, 0x00).unwrap();
        assert!(!a.cpu.reset_status.power_on);
        assert_eq!(a.read_data(MCUSR_ADDR).unwrap(), 0);
    }

    #[test]
    fn test_step_one_and_disasm_at_pc() {
        let mut a = core_with(&[0xEF0F, 0x940C, 0x0034]);
        assert_eq!(a.disasm_at_pc(), "0x0000: LDI R16, 0xFF");
        assert_eq!(a.step_one(), "0x0000: LDI R16, 0xFF");
        assert_eq!(a.step_one(), "0x0002: JMP 0x0068");
        assert_eq!(a.cpu.pc, 0x34);
        assert!(a.step_one().contains("no instruction matches"));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut a = core_with(&[0xEF0F, NOP]);
        a.step();
        let snap = a.snapshot();
        a.step();
        a.mem.set_reg(16, 0);
        a.restore(&snap).unwrap();
        assert_eq!(a.mem.reg(16), 0xFF);
        assert_eq!(a.cpu.pc, 1);
        assert_eq!(a.snapshot(), snap);

        let mut bad = snap.clone();
        bad.data.truncate(10);
        assert!(a.restore(&bad).is_err());
    }

    #[test]
    fn test_independent_instances() {
        let mut a = core_with(&[0xEF0F, BREAK]);
        let b = core_with(&[BREAK]);
        a.run_until_stopped();
        assert_eq!(a.mem.reg(16), 0xFF);
        assert_eq!(b.mem.reg(16), 0);
        assert!(std::ptr::eq(a.instruction_table(), b.instruction_table()));
    }

    #[test]
    fn test_load_program_too_large() {
        let mut a = Atmega328p::new().unwrap();
        assert!(matches!(
            a.load_program(&vec![0u8; FLASH_SIZE + 2]),
            Err(Error::ProgramTooLarge { .. })
        ));
    }
}
