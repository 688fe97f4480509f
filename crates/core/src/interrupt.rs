//! Interrupt controller for the ATmega328P vector table.
//!
//! Pending requests live in an atomic bitmask shared with every
//! [`CoreHandle`], so peripheral models running on other threads can raise
//! interrupts while the core is stepping. The core polls the mask at each
//! instruction boundary and services the lowest-numbered pending vector.
//!
//! The same handle lets another thread ask for a [`Snapshot`]: the core
//! publishes one at its next instruction boundary without stopping.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::snapshot::Snapshot;

/// ATmega328P interrupt vectors in priority order (lower = higher priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Vector {
    Reset = 0,
    Int0,
    Int1,
    Pcint0,
    Pcint1,
    Pcint2,
    Wdt,
    Timer2CompA,
    Timer2CompB,
    Timer2Ovf,
    Timer1Capt,
    Timer1CompA,
    Timer1CompB,
    Timer1Ovf,
    Timer0CompA,
    Timer0CompB,
    Timer0Ovf,
    SpiStc,
    UsartRx,
    UsartUdre,
    UsartTx,
    Adc,
    EeReady,
    AnalogComp,
    Twi,
    SpmReady,
}

/// Number of vectors in the table.
pub const VECTOR_COUNT: usize = 26;

/// Words per vector slot (a JMP fits in each).
pub const VECTOR_STRIDE: u16 = 2;

impl Vector {
    pub const ALL: [Vector; VECTOR_COUNT] = [
        Vector::Reset,
        Vector::Int0,
        Vector::Int1,
        Vector::Pcint0,
        Vector::Pcint1,
        Vector::Pcint2,
        Vector::Wdt,
        Vector::Timer2CompA,
        Vector::Timer2CompB,
        Vector::Timer2Ovf,
        Vector::Timer1Capt,
        Vector::Timer1CompA,
        Vector::Timer1CompB,
        Vector::Timer1Ovf,
        Vector::Timer0CompA,
        Vector::Timer0CompB,
        Vector::Timer0Ovf,
        Vector::SpiStc,
        Vector::UsartRx,
        Vector::UsartUdre,
        Vector::UsartTx,
        Vector::Adc,
        Vector::EeReady,
        Vector::AnalogComp,
        Vector::Twi,
        Vector::SpmReady,
    ];

    #[inline(always)]
    pub fn number(self) -> u8 {
        self as u8
    }

    pub fn from_number(n: u8) -> Option<Vector> {
        Self::ALL.get(n as usize).copied()
    }

    /// Entry point (word address) in program memory.
    #[inline(always)]
    pub fn address(self) -> u16 {
        self.number() as u16 * VECTOR_STRIDE
    }

    #[inline(always)]
    fn bit(self) -> u32 {
        1 << self.number()
    }
}

const ALL_VECTORS: u32 = (1 << VECTOR_COUNT) - 1;

#[derive(Debug)]
struct Shared {
    pending: AtomicU32,
    enabled: AtomicU32,
    global_enable: AtomicBool,
    stop: AtomicBool,
    snapshot_request: AtomicBool,
    published: Mutex<Option<Snapshot>>,
}

impl Shared {
    fn published(&self) -> MutexGuard<'_, Option<Snapshot>> {
        self.published.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable, thread-safe handle to a running core.
///
/// Obtained from [`Atmega328p::handle`](crate::Atmega328p::handle).
#[derive(Debug, Clone)]
pub struct CoreHandle {
    shared: Arc<Shared>,
}

impl CoreHandle {
    /// Signal an interrupt. Accepted when the global interrupt flag and the
    /// vector's enable bit are set (RESET is always accepted). A vector that
    /// is already pending is coalesced. Returns whether the request is now
    /// pending.
    pub fn request_interrupt(&self, vector: Vector) -> bool {
        let s = &self.shared;
        if vector != Vector::Reset {
            let enabled = s.enabled.load(Ordering::Acquire) & vector.bit() != 0;
            if !enabled || !s.global_enable.load(Ordering::Acquire) {
                log::warn!(
                    "interrupt {:?} dropped (I={} enabled={})",
                    vector,
                    s.global_enable.load(Ordering::Relaxed),
                    enabled
                );
                return false;
            }
        }
        s.pending.fetch_or(vector.bit(), Ordering::AcqRel);
        true
    }

    /// Set or clear a vector's individual enable bit. RESET cannot be masked.
    pub fn set_vector_enabled(&self, vector: Vector, enabled: bool) {
        if vector == Vector::Reset {
            return;
        }
        if enabled {
            self.shared.enabled.fetch_or(vector.bit(), Ordering::AcqRel);
        } else {
            self.shared.enabled.fetch_and(!vector.bit(), Ordering::AcqRel);
        }
    }

    pub fn is_pending(&self, vector: Vector) -> bool {
        self.shared.pending.load(Ordering::Acquire) & vector.bit() != 0
    }

    /// Ask the core to stop at the next instruction boundary.
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Ask the core to publish a snapshot at its next instruction boundary.
    /// Collect it with [`take_snapshot`](Self::take_snapshot).
    pub fn request_snapshot(&self) {
        self.shared.snapshot_request.store(true, Ordering::Release);
    }

    /// Most recently published snapshot, if one arrived since the last take.
    pub fn take_snapshot(&self) -> Option<Snapshot> {
        self.shared.published().take()
    }
}

/// Core-side view of the interrupt state.
#[derive(Debug)]
pub struct InterruptController {
    handle: CoreHandle,
}

impl InterruptController {
    pub fn new() -> Self {
        InterruptController {
            handle: CoreHandle {
                shared: Arc::new(Shared {
                    pending: AtomicU32::new(0),
                    enabled: AtomicU32::new(ALL_VECTORS),
                    global_enable: AtomicBool::new(false),
                    stop: AtomicBool::new(false),
                    snapshot_request: AtomicBool::new(false),
                    published: Mutex::new(None),
                }),
            },
        }
    }

    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    /// Same as [`CoreHandle::request_interrupt`].
    pub fn request(&self, vector: Vector) -> bool {
        self.handle.request_interrupt(vector)
    }

    /// Publish the CPU's I flag to requesters.
    #[inline(always)]
    pub fn set_global_enable(&self, i: bool) {
        self.handle.shared.global_enable.store(i, Ordering::Release);
    }

    /// Highest-priority vector that may be serviced now. Only RESET is
    /// eligible while `i` is clear.
    #[inline]
    pub fn next_pending(&self, i: bool) -> Option<Vector> {
        let s = &self.handle.shared;
        let mut mask = s.pending.load(Ordering::Acquire) & s.enabled.load(Ordering::Acquire);
        if !i {
            mask &= Vector::Reset.bit();
        }
        if mask == 0 {
            return None;
        }
        Vector::from_number(mask.trailing_zeros() as u8)
    }

    /// Clear `vector` from the pending set once it is being serviced.
    pub fn acknowledge(&self, vector: Vector) {
        self.handle.shared.pending.fetch_and(!vector.bit(), Ordering::AcqRel);
    }

    /// Drop every pending request.
    pub fn clear_pending(&self) {
        self.handle.shared.pending.store(0, Ordering::Release);
    }

    pub fn pending_mask(&self) -> u32 {
        self.handle.shared.pending.load(Ordering::Acquire)
    }

    /// Consume a stop request, if one was made.
    pub fn take_stop_request(&self) -> bool {
        self.handle.shared.stop.swap(false, Ordering::AcqRel)
    }

    /// Consume a snapshot request, if one was made.
    #[inline]
    pub fn take_snapshot_request(&self) -> bool {
        self.handle.shared.snapshot_request.load(Ordering::Relaxed)
            && self.handle.shared.snapshot_request.swap(false, Ordering::AcqRel)
    }

    /// Hand a snapshot to whichever handle asked for it.
    pub fn publish_snapshot(&self, snap: Snapshot) {
        *self.handle.shared.published() = Some(snap);
    }
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new()
    }
}
