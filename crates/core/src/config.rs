//! Core configuration.

use serde::{Deserialize, Serialize};

use crate::CLOCK_HZ;

/// How [`run_until_stopped`](crate::Atmega328p::run_until_stopped) paces
/// itself against wall-clock time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pacing {
    /// Run as fast as possible (deterministic tests, batch runs)
    #[default]
    Unthrottled,
    /// Sleep so that elapsed cycles track `clock_hz`
    RealTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Simulated clock frequency, used only for real-time pacing
    pub clock_hz: u32,
    pub pacing: Pacing,
    /// Cycles executed between wall-clock checks (16 000 = 1 ms at 16 MHz)
    pub pacing_quantum_cycles: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            clock_hz: CLOCK_HZ,
            pacing: Pacing::Unthrottled,
            pacing_quantum_cycles: 16_000,
        }
    }
}

impl CoreConfig {
    /// Default configuration with real-time pacing.
    pub fn real_time() -> Self {
        CoreConfig { pacing: Pacing::RealTime, ..Self::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = CoreConfig::default();
        assert_eq!(c.clock_hz, 16_000_000);
        assert_eq!(c.pacing, Pacing::Unthrottled);
        assert_eq!(CoreConfig::real_time().pacing, Pacing::RealTime);
    }

    #[test]
    fn test_config_serializes() {
        let bytes = bincode::serialize(&CoreConfig::real_time()).unwrap();
        let back: CoreConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, CoreConfig::real_time());
    }
}
