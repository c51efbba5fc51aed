//! Clock fabric: the 14.318 MHz master oscillator and the CPU core clock.
//!
//! All conversions are integer product-accumulators (value × rate carried
//! forward, divided out on demand) so that no fractional nanoseconds are
//! ever dropped. Sub-tick remainders persist across calls.

use crate::config::{ClockingMode, CpuModel, MachineConfig};

/// Master oscillator frequency shared by the whole board.
pub const MHZ14: u64 = 14_318_180;

/// Nanoseconds per second, the common denominator of the accumulators.
const NS_PER_SEC: u64 = 1_000_000_000;

/// Converts elapsed wall time into 14 MHz ticks without drift.
#[derive(Debug, Clone, Default)]
pub struct MasterClock {
    /// Accumulated ns × MHZ14 product not yet converted into ticks
    acc: u64,
    /// Total ticks handed out since reset
    total_ticks: u64,
}

impl MasterClock {
    /// Create a master clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by `ns` nanoseconds, returning the number of whole 14 MHz
    /// ticks that elapsed. The sub-tick remainder carries to the next call.
    pub fn advance_ns(&mut self, ns: u64) -> u64 {
        self.acc += ns * MHZ14;
        let ticks = self.acc / NS_PER_SEC;
        self.acc %= NS_PER_SEC;
        self.total_ticks += ticks;
        ticks
    }

    /// Total ticks since reset.
    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    /// Reset to time zero, dropping any partial tick.
    pub fn reset(&mut self) {
        self.acc = 0;
        self.total_ticks = 0;
    }
}

/// Rational frequency divider hanging off a parent tick stream.
///
/// Devices that do not run at 14 MHz (PIT at master/12, UART at its own
/// 1.8432 MHz crystal) feed master ticks in and take their own ticks out.
#[derive(Debug, Clone)]
pub struct SubClock {
    num: u64,
    den: u64,
    acc: u64,
}

impl SubClock {
    /// A divider producing `num`/`den` output ticks per input tick.
    pub fn new(num: u64, den: u64) -> Self {
        debug_assert!(den != 0);
        Self { num, den, acc: 0 }
    }

    /// Feed `ticks` parent ticks, returning whole output ticks.
    pub fn feed(&mut self, ticks: u64) -> u64 {
        self.acc += ticks * self.num;
        let out = self.acc / self.den;
        self.acc %= self.den;
        out
    }

    /// Drop any partial output tick.
    pub fn reset(&mut self) {
        self.acc = 0;
    }
}

/// Inboard 386 speed level, set by writes to port 0x670.
///
/// The byte written encodes the level: 0x00 selects level 1 (30 wait
/// states) up through 0x1E for level 4 (none).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InboardLevel {
    /// 30 wait states
    #[default]
    Level1,
    /// 16 wait states
    Level2,
    /// 8 wait states
    Level3,
    /// 0 wait states
    Level4,
}

impl InboardLevel {
    /// Decode a port 0x670 write. Unknown values leave the level unchanged.
    pub fn from_port_value(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(InboardLevel::Level1),
            0x0E => Some(InboardLevel::Level2),
            0x16 => Some(InboardLevel::Level3),
            0x1E => Some(InboardLevel::Level4),
            _ => None,
        }
    }

    /// Stall cycles charged per instruction at this level.
    pub fn wait_state_cycles(self) -> u64 {
        match self {
            InboardLevel::Level1 => 30,
            InboardLevel::Level2 => 16,
            InboardLevel::Level3 => 8,
            InboardLevel::Level4 => 0,
        }
    }
}

/// Converts executed CPU cycles into nanoseconds at the emulated speed.
#[derive(Debug, Clone)]
pub struct CpuClock {
    hz: u64,
    acc: u64,
    /// TSC multiplier for Pentium-class parts (1 when no TSC)
    tsc_multiplier: u64,
    /// Partial TSC increments carried between steps
    tsc_acc: u64,
}

impl CpuClock {
    /// Build the core clock for `config`, honoring Turbo and clocking mode.
    pub fn new(config: &MachineConfig) -> Self {
        Self {
            hz: effective_cpu_hz(config),
            acc: 0,
            tsc_multiplier: config.cpu_model.tsc_multiplier(),
            tsc_acc: 0,
        }
    }

    /// Effective core frequency in Hz.
    pub fn hz(&self) -> u64 {
        self.hz
    }

    /// Replace the core frequency (Inboard level change, Turbo toggle).
    pub fn set_hz(&mut self, hz: u64) {
        if hz != 0 {
            self.hz = hz;
        }
    }

    /// Convert `cycles` executed cycles into elapsed nanoseconds. Partial
    /// nanoseconds carry to the next call.
    pub fn cycles_to_ns(&mut self, cycles: u64) -> u64 {
        self.acc += cycles * NS_PER_SEC;
        let ns = self.acc / self.hz;
        self.acc %= self.hz;
        ns
    }

    /// TSC increment for `cycles` core cycles (core clock × multiplier).
    pub fn tsc_increment(&mut self, cycles: u64) -> u64 {
        self.tsc_acc += cycles * self.tsc_multiplier;
        let ticks = self.tsc_acc;
        self.tsc_acc = 0;
        ticks
    }

    /// Drop partial accumulators (hard reset).
    pub fn reset(&mut self) {
        self.acc = 0;
        self.tsc_acc = 0;
    }
}

/// Compute the effective core clock from the configuration.
///
/// XT-class boards derive the CPU clock from the master oscillator
/// (14.318/3 MHz, ×2.1 with Turbo engaged); later boards run the
/// configured frequency directly. IPS mode keeps the nominal rate and the
/// flat per-instruction charge is applied by the executor instead.
pub fn effective_cpu_hz(config: &MachineConfig) -> u64 {
    let base = match config.cpu_model {
        CpuModel::I8086 | CpuModel::NecV30 => {
            let xtal = MHZ14 / 3;
            if config.turbo {
                xtal * 21 / 10
            } else {
                xtal
            }
        }
        _ => config.cpu_hz,
    };
    match config.clocking {
        ClockingMode::CycleAccurate | ClockingMode::Ips => base.max(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_clock_exact_rate() {
        let mut clock = MasterClock::new();
        // One full second must produce exactly MHZ14 ticks, regardless of
        // how the second is sliced.
        let mut ticks = 0;
        for _ in 0..1000 {
            ticks += clock.advance_ns(1_000_000);
        }
        assert_eq!(ticks, MHZ14);
    }

    #[test]
    fn test_master_clock_remainder_carries() {
        let mut clock = MasterClock::new();
        // 69 ns is just under one tick period (~69.84 ns): no tick yet.
        assert_eq!(clock.advance_ns(69), 0);
        // The next nanosecond pushes it over.
        assert_eq!(clock.advance_ns(1), 1);
    }

    #[test]
    fn test_subclock_divides() {
        // PIT clock: master / 12.
        let mut pit = SubClock::new(1, 12);
        assert_eq!(pit.feed(11), 0);
        assert_eq!(pit.feed(1), 1);
        assert_eq!(pit.feed(24), 2);
    }

    #[test]
    fn test_subclock_rational_rate() {
        // UART crystal: 1.8432 MHz derived from master ticks.
        let mut uart = SubClock::new(1_843_200, MHZ14);
        let out = uart.feed(MHZ14);
        assert_eq!(out, 1_843_200);
    }

    #[test]
    fn test_inboard_levels() {
        assert_eq!(InboardLevel::from_port_value(0x00), Some(InboardLevel::Level1));
        assert_eq!(InboardLevel::from_port_value(0x0E), Some(InboardLevel::Level2));
        assert_eq!(InboardLevel::from_port_value(0x16), Some(InboardLevel::Level3));
        assert_eq!(InboardLevel::from_port_value(0x1E), Some(InboardLevel::Level4));
        assert_eq!(InboardLevel::from_port_value(0x42), None);
        assert_eq!(InboardLevel::Level1.wait_state_cycles(), 30);
        assert_eq!(InboardLevel::Level4.wait_state_cycles(), 0);
    }

    #[test]
    fn test_cpu_clock_conversion() {
        let config = MachineConfig::default();
        let mut clock = CpuClock::new(&config);
        // 4.772727 MHz 8086: one second of cycles is one second of time.
        let hz = clock.hz();
        let ns = clock.cycles_to_ns(hz);
        assert_eq!(ns, 1_000_000_000);
    }

    #[test]
    fn test_turbo_speedup() {
        let normal = MachineConfig::default();
        let turbo = MachineConfig {
            turbo: true,
            ..MachineConfig::default()
        };
        assert!(effective_cpu_hz(&turbo) > effective_cpu_hz(&normal));
        assert_eq!(effective_cpu_hz(&turbo), effective_cpu_hz(&normal) * 21 / 10);
    }

    #[test]
    fn test_tsc_multiplier_applied() {
        let config = MachineConfig {
            cpu_model: CpuModel::PentiumPro,
            cpu_hz: 200_000_000,
            ..MachineConfig::default()
        };
        let mut clock = CpuClock::new(&config);
        assert_eq!(clock.tsc_increment(10), 30);
    }
}
