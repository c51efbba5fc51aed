//! Host-supplied machine configuration.
//!
//! Consumed once when the machine is constructed. Everything here mirrors
//! what the host menu exposes: emulated CPU model, clocking mode, memory
//! size, and the board architecture the peripherals adapt to.

use thiserror::Error;

/// Emulated CPU generation, ordered so comparisons express "model or later".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum CpuModel {
    /// 8086/8088 (bus width decides which)
    #[default]
    I8086 = 0,
    /// NEC V30/V20
    NecV30 = 1,
    /// 80286
    I80286 = 2,
    /// 80386
    I80386 = 3,
    /// 80486
    I80486 = 4,
    /// Pentium
    Pentium = 5,
    /// Pentium Pro
    PentiumPro = 6,
    /// Pentium II
    PentiumII = 7,
}

impl CpuModel {
    /// TSC clock multiplier applied on top of the CPU clock (Pentium+ only).
    pub fn tsc_multiplier(self) -> u64 {
        match self {
            CpuModel::Pentium => 2,
            CpuModel::PentiumPro => 3,
            CpuModel::PentiumII => 5,
            _ => 1,
        }
    }

    /// Does this model have a TSC at all?
    pub fn has_tsc(self) -> bool {
        self >= CpuModel::Pentium
    }

    /// Test registers TR3..TR7 exist on the 486 and Pentium only.
    pub fn has_test_registers(self) -> bool {
        matches!(self, CpuModel::I80486 | CpuModel::Pentium)
    }

    /// 386+ parts decode FS/GS/66/67 as prefixes.
    pub fn has_386_prefixes(self) -> bool {
        self >= CpuModel::I80386
    }
}

/// Board architecture the machine emulates. Decides I/O decode widths,
/// CMOS size and the keyboard BAT timing among other details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Architecture {
    /// PC/XT
    Xt,
    /// PC/AT
    #[default]
    At,
    /// Compaq Deskpro 386
    Compaq,
    /// PS/2 (MCA-less model 30 style)
    Ps2,
    /// Pentium board with i430fx chipset
    I430fx,
    /// Pentium II board with i440fx chipset
    I440fx,
}

impl Architecture {
    /// CMOS RAM size in bytes for this board.
    pub fn cmos_size(self) -> usize {
        match self {
            Architecture::Xt | Architecture::At | Architecture::Compaq => 128,
            Architecture::Ps2 | Architecture::I430fx | Architecture::I440fx => 256,
        }
    }

    /// The i430fx/i440fx keyboard controller completes the keyboard BAT in
    /// about 100 microseconds; older boards take the nominal 600 ms.
    pub fn keyboard_bat_ns(self) -> u64 {
        match self {
            Architecture::I430fx | Architecture::I440fx => 100_000,
            _ => 600_000_000,
        }
    }

    /// XT game ports decode 16 bytes at 0x200, AT boards 8.
    pub fn joystick_decode_len(self) -> u16 {
        match self {
            Architecture::Xt => 16,
            _ => 8,
        }
    }
}

/// How CPUID reports itself to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuidMode {
    /// Full modern leaves
    #[default]
    Modern,
    /// Maximum leaf limited to 1
    Limited,
    /// DX-on-start: report family/model via DX at reset, no CPUID
    DxOnStart,
}

/// How instruction time is charged against the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockingMode {
    /// Documented per-instruction cycle counts
    #[default]
    CycleAccurate,
    /// Flat instructions-per-second budget
    Ips,
}

/// Validated machine configuration.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Emulated CPU model
    pub cpu_model: CpuModel,
    /// Data bus width in bits: 8 (8088/80188 class) or 16+
    pub data_bus_width: u8,
    /// CPU clock in Hz (before Turbo)
    pub cpu_hz: u64,
    /// Turbo multiplier engaged (XT-class 4.77→~10 MHz boards)
    pub turbo: bool,
    /// Cycle-accurate vs IPS clocking
    pub clocking: ClockingMode,
    /// CPUID reporting mode
    pub cpuid_mode: CpuidMode,
    /// Memory size in KB
    pub memory_kb: u32,
    /// Board architecture
    pub architecture: Architecture,
    /// Number of logical CPUs (1 BSP, optionally 1 AP)
    pub cpu_count: u8,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            cpu_model: CpuModel::I8086,
            data_bus_width: 16,
            cpu_hz: 4_772_727, // 14.318 MHz / 3
            turbo: false,
            clocking: ClockingMode::CycleAccurate,
            cpuid_mode: CpuidMode::Modern,
            memory_kb: 640,
            architecture: Architecture::At,
            cpu_count: 1,
        }
    }
}

/// Configuration rejected at machine construction.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("data bus width {0} is not 8 or 16")]
    BadBusWidth(u8),
    #[error("8-bit data bus requires an 8086-class CPU")]
    BusWidthModelMismatch,
    #[error("cpu count {0} outside 1..=2")]
    BadCpuCount(u8),
    #[error("memory size {0} KB is below the 64 KB minimum")]
    MemoryTooSmall(u32),
    #[error("cpu clock of 0 Hz")]
    ZeroClock,
}

impl MachineConfig {
    /// Maximum logical processors (BSP + one AP).
    pub const MAX_CPUS: u8 = 2;

    /// Validate the configuration, returning it unchanged on success.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.data_bus_width != 8 && self.data_bus_width != 16 {
            return Err(ConfigError::BadBusWidth(self.data_bus_width));
        }
        if self.data_bus_width == 8 && self.cpu_model > CpuModel::NecV30 {
            return Err(ConfigError::BusWidthModelMismatch);
        }
        if self.cpu_count == 0 || self.cpu_count > Self::MAX_CPUS {
            return Err(ConfigError::BadCpuCount(self.cpu_count));
        }
        if self.memory_kb < 64 {
            return Err(ConfigError::MemoryTooSmall(self.memory_kb));
        }
        if self.cpu_hz == 0 {
            return Err(ConfigError::ZeroClock);
        }
        Ok(self)
    }

    /// Prefetch queue depth for the configured CPU: 4 bytes on the 8088
    /// through 16 bytes on 486 and later parts.
    pub fn prefetch_depth(&self) -> usize {
        match self.cpu_model {
            CpuModel::I8086 | CpuModel::NecV30 => {
                if self.data_bus_width == 8 {
                    4
                } else {
                    6
                }
            }
            CpuModel::I80286 => 6,
            CpuModel::I80386 => 12,
            _ => 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(MachineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_bus_width_checks() {
        let cfg = MachineConfig {
            data_bus_width: 12,
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::BadBusWidth(12));

        let cfg = MachineConfig {
            data_bus_width: 8,
            cpu_model: CpuModel::I80386,
            ..Default::default()
        };
        assert_eq!(
            cfg.validate().unwrap_err(),
            ConfigError::BusWidthModelMismatch
        );
    }

    #[test]
    fn test_cpu_count_limits() {
        let cfg = MachineConfig {
            cpu_count: 3,
            ..Default::default()
        };
        assert_eq!(cfg.validate().unwrap_err(), ConfigError::BadCpuCount(3));
    }

    #[test]
    fn test_prefetch_depth_by_model() {
        let mut cfg = MachineConfig {
            data_bus_width: 8,
            ..Default::default()
        };
        assert_eq!(cfg.prefetch_depth(), 4);
        cfg.data_bus_width = 16;
        assert_eq!(cfg.prefetch_depth(), 6);
        cfg.cpu_model = CpuModel::I80386;
        assert_eq!(cfg.prefetch_depth(), 12);
        cfg.cpu_model = CpuModel::Pentium;
        assert_eq!(cfg.prefetch_depth(), 16);
    }

    #[test]
    fn test_tsc_multipliers() {
        assert_eq!(CpuModel::Pentium.tsc_multiplier(), 2);
        assert_eq!(CpuModel::PentiumPro.tsc_multiplier(), 3);
        assert_eq!(CpuModel::PentiumII.tsc_multiplier(), 5);
        assert_eq!(CpuModel::I80486.tsc_multiplier(), 1);
        assert!(!CpuModel::I80486.has_tsc());
    }

    #[test]
    fn test_architecture_details() {
        assert_eq!(Architecture::At.cmos_size(), 128);
        assert_eq!(Architecture::I430fx.cmos_size(), 256);
        assert_eq!(Architecture::I430fx.keyboard_bat_ns(), 100_000);
        assert_eq!(Architecture::At.keyboard_bat_ns(), 600_000_000);
        assert_eq!(Architecture::Xt.joystick_decode_len(), 16);
        assert_eq!(Architecture::At.joystick_decode_len(), 8);
    }
}
