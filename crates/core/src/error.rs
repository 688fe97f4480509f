//! Fault and error types.
//!
//! Everything that can go wrong inside the fetch-decode-execute path is a
//! [`Fault`]. Faults are never swallowed: the execution core stops and hands
//! the fault to the registered [`FaultHandler`], which decides whether to log,
//! abort or inspect state. Construction-time problems in the instruction
//! catalog surface as [`CatalogError`].

use thiserror::Error;

/// Fatal condition raised while executing firmware.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// No descriptor matches the fetched opcode.
    #[error("no instruction matches opcode 0x{opcode:04X} at pc=0x{pc:04X}")]
    Decode { pc: u16, opcode: u16 },
    /// An effective data address fell outside data memory.
    #[error("data address 0x{address:04X} is outside data memory")]
    DataAddress { address: u32 },
    /// A byte address fell outside program memory.
    #[error("program address 0x{address:05X} is outside program memory")]
    ProgramAddress { address: u32 },
}

/// Defect in the static instruction catalog, detected while building the
/// lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("opcode 0x{opcode:04X} matches both {first} and {second}")]
    Ambiguous { opcode: u16, first: &'static str, second: &'static str },
    #[error("descriptor {name} is malformed")]
    InvalidDescriptor { name: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error for fallible setup, loading and save-state operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("instruction catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error("program image of {len} bytes exceeds {capacity} bytes of program memory")]
    ProgramTooLarge { len: usize, capacity: usize },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serde(#[from] bincode::Error),
    #[error("save state: {0}")]
    InvalidSaveState(String),
}

/// Collaborator invoked synchronously when execution faults.
///
/// The core has already stopped when `on_fault` runs; it does not resume
/// until the host calls [`Atmega328p::resume`](crate::Atmega328p::resume).
pub trait FaultHandler: Send {
    fn on_fault(&mut self, fault: &Fault);
}

impl<F> FaultHandler for F
where
    F: FnMut(&Fault) + Send,
{
    fn on_fault(&mut self, fault: &Fault) {
        (*self)(fault)
    }
}

/// Default handler: reports the fault through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFaultHandler;

impl FaultHandler for LogFaultHandler {
    fn on_fault(&mut self, fault: &Fault) {
        log::error!("CPU fault: {}", fault);
    }
}
