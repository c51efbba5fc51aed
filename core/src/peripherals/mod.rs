//! The device complement behind the BIU's I/O dispatch.
//!
//! `Devices` owns every emulated peripheral and fans the 14 MHz master
//! ticks out to each one in its own clock domain: the PIT at master/12,
//! the byte-pipeline devices (8042, PS/2, UART, CMOS, game port) in
//! nanoseconds. IRQ activity funnels into the dual PIC, which the CPU
//! polls at instruction boundaries.

pub mod cmos;
pub mod i8042;
pub mod joystick;
pub mod keyboard;
pub mod mouse;
pub mod pic;
pub mod pit;
pub mod uart;

use log::trace;

use crate::clock::{InboardLevel, SubClock, MHZ14};
use crate::config::{Architecture, CpuModel, MachineConfig};
use crate::memory::Memory;
use cmos::Cmos;
use i8042::I8042;
use joystick::Joystick;
use pic::DualPic;
use pit::Pit;
use uart::{UartBank, UART_IRQS};

/// Every device on the I/O bus.
pub struct Devices {
    pub pic: DualPic,
    pub pit: Pit,
    pub i8042: I8042,
    pub uarts: UartBank,
    pub cmos: Cmos,
    pub joystick: Joystick,
    /// Inboard 386 speed level, written through port 0x670
    pub inboard_level: InboardLevel,
    /// Level change not yet consumed by the outer loop
    inboard_dirty: bool,
    /// Reset request from port 0x92 bit 0
    fast_reset_requested: bool,
    /// Master ticks -> PIT clocks (divide by 12)
    pit_clock: SubClock,
    /// Master ticks -> nanoseconds for the byte-pipeline devices
    ns_clock: SubClock,
    /// Port 0x670 is decoded only on pre-PCI boards
    has_inboard: bool,
    /// Current UART IRQ line levels for edge bookkeeping
    uart_levels: [bool; 4],
}

impl Devices {
    pub fn new(config: &MachineConfig) -> Self {
        let arch = config.architecture;
        Self {
            pic: DualPic::new(),
            pit: Pit::new(),
            i8042: I8042::new(arch.keyboard_bat_ns()),
            uarts: UartBank::new(),
            cmos: Cmos::new(arch.cmos_size()),
            joystick: Joystick::new(arch.joystick_decode_len()),
            inboard_level: InboardLevel::default(),
            inboard_dirty: false,
            fast_reset_requested: false,
            pit_clock: SubClock::new(1, 12),
            ns_clock: SubClock::new(1_000_000_000, MHZ14),
            has_inboard: config.cpu_model >= CpuModel::I80386
                && !matches!(arch, Architecture::I430fx | Architecture::I440fx),
            uart_levels: [false; 4],
        }
    }

    /// Advance all devices by `ticks` master-clock ticks.
    pub fn tick_14mhz(&mut self, ticks: u64) {
        // PIT channel 0 drives IRQ0 with a pulse per expiry.
        let pit_ticks = self.pit_clock.feed(ticks);
        let pulses = self.pit.tick(pit_ticks);
        for _ in 0..pulses {
            self.pic.raise_irq(0);
            self.pic.lower_irq(0);
        }

        let ns = self.ns_clock.feed(ticks);
        if ns == 0 {
            return;
        }

        // 8042 and its PS/2 devices.
        let irqs = self.i8042.tick_ns(ns);
        if irqs.irq1 {
            self.pic.raise_irq(1);
            self.pic.lower_irq(1);
        }
        if irqs.irq12 {
            self.pic.raise_irq(12);
            self.pic.lower_irq(12);
        }

        // UART IRQ lines are level-driven.
        let levels = self.uarts.tick_ns(ns);
        for (i, &level) in levels.iter().enumerate() {
            if level != self.uart_levels[i] {
                if level {
                    self.pic.raise_irq(UART_IRQS[i]);
                } else {
                    self.pic.lower_irq(UART_IRQS[i]);
                }
                self.uart_levels[i] = level;
            }
        }

        self.cmos.tick_ns(ns);
        self.joystick.tick_ns(ns);
    }

    /// Refresh UART IRQ levels after a register access changed the
    /// pending causes outside of a tick.
    fn sync_uart_irqs(&mut self) {
        for (i, port) in self.uarts.ports.iter().enumerate() {
            let level = port.irq_pending();
            if level != self.uart_levels[i] {
                if level {
                    self.pic.raise_irq(UART_IRQS[i]);
                } else {
                    self.pic.lower_irq(UART_IRQS[i]);
                }
                self.uart_levels[i] = level;
            }
        }
    }

    /// Any device requested a machine reset?
    pub fn take_reset_request(&mut self) -> bool {
        let requested = self.i8042.reset_requested || self.fast_reset_requested;
        self.i8042.reset_requested = false;
        self.fast_reset_requested = false;
        requested
    }

    /// Inboard speed level changed since the last check?
    pub fn take_inboard_change(&mut self) -> Option<InboardLevel> {
        if self.inboard_dirty {
            self.inboard_dirty = false;
            Some(self.inboard_level)
        } else {
            None
        }
    }

    /// I/O port read dispatch.
    pub fn io_read8(&mut self, port: u16, mem: &mut Memory) -> u8 {
        match port {
            0x20 | 0x21 | 0xA0 | 0xA1 => self.pic.io_read(port),
            0x40 => self.pit.read_data(),
            0x41 | 0x42 => 0,
            0x43 => 0xFF, // control word is write-only
            0x60 => {
                let value = self.i8042.read_data();
                // Draining the buffer lets the next queued byte move up.
                let irqs = self.i8042.service();
                if irqs.irq1 {
                    self.pic.raise_irq(1);
                    self.pic.lower_irq(1);
                }
                if irqs.irq12 {
                    self.pic.raise_irq(12);
                    self.pic.lower_irq(12);
                }
                value
            }
            0x61 => self.i8042.read_port_b(),
            0x64 => self.i8042.read_status(),
            0x70 => 0xFF, // index register is write-only
            0x71 => self.cmos.read_data(),
            0x92 => (mem.a20_enabled() as u8) << 1,
            _ => {
                if let Some(value) = self.uarts.io_read(port) {
                    self.sync_uart_irqs();
                    return value;
                }
                if self.joystick.decodes(port) {
                    return self.joystick.io_read();
                }
                trace!("io: read from unhandled port {port:#06X}");
                0xFF
            }
        }
    }

    /// I/O port write dispatch.
    pub fn io_write8(&mut self, port: u16, value: u8, mem: &mut Memory) {
        match port {
            0x20 | 0x21 | 0xA0 | 0xA1 => self.pic.io_write(port, value),
            0x40 => self.pit.write_data(value),
            0x41 | 0x42 => {}
            0x43 => self.pit.write_control(value),
            0x60 => {
                self.i8042.write_data(value, mem);
                let irqs = self.i8042.service();
                if irqs.irq1 {
                    self.pic.raise_irq(1);
                    self.pic.lower_irq(1);
                }
                if irqs.irq12 {
                    self.pic.raise_irq(12);
                    self.pic.lower_irq(12);
                }
            }
            0x61 => self.i8042.write_port_b(value),
            0x64 => self.i8042.write_command(value, mem),
            0x70 => self.cmos.write_index(value),
            0x71 => self.cmos.write_data(value),
            0x92 => {
                mem.set_a20(value & 0x02 != 0);
                if value & 0x01 != 0 {
                    self.fast_reset_requested = true;
                }
            }
            0x670 if self.has_inboard => {
                if let Some(level) = InboardLevel::from_port_value(value) {
                    self.inboard_level = level;
                    self.inboard_dirty = true;
                } else {
                    log::debug!("inboard: unknown port 0x670 command {value:#04X}");
                }
            }
            _ => {
                if self.uarts.io_write(port, value) {
                    self.sync_uart_irqs();
                    return;
                }
                if self.joystick.decodes(port) {
                    self.joystick.io_write(value);
                    return;
                }
                trace!("io: write {value:#04X} to unhandled port {port:#06X}");
            }
        }
    }

    /// Reset every device (guest reboot). CMOS contents survive.
    pub fn reset(&mut self) {
        self.pic.reset();
        self.pit.reset();
        self.i8042.reset();
        self.uarts.reset();
        self.joystick.reset();
        self.pit_clock.reset();
        self.ns_clock.reset();
        self.uart_levels = [false; 4];
        self.fast_reset_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn devices() -> (Devices, Memory) {
        let config = MachineConfig::default().validate().unwrap();
        (Devices::new(&config), Memory::new(640))
    }

    #[test]
    fn test_pit_drives_irq0() {
        let (mut dev, mut mem) = devices();
        // Unmask IRQ0, program a short divisor.
        dev.io_write8(0x21, 0xFE, &mut mem);
        dev.io_write8(0x43, 0x34, &mut mem);
        dev.io_write8(0x40, 0x10, &mut mem);
        dev.io_write8(0x40, 0x00, &mut mem);
        // 0x10 PIT clocks = 0xC0 master ticks.
        dev.tick_14mhz(0x10 * 12);
        assert_eq!(dev.pic.pending_vector(), Some(0x08));
    }

    #[test]
    fn test_keyboard_byte_raises_irq1() {
        let (mut dev, mut mem) = devices();
        dev.io_write8(0x21, 0x00, &mut mem);
        dev.i8042.keyboard.key_event(0x1E, true);
        dev.tick_14mhz(100);
        assert_eq!(dev.pic.pending_vector(), Some(0x09));
        // Scancode arrives translated to set 1.
        assert_eq!(dev.io_read8(0x60, &mut mem), 0x1E);
    }

    #[test]
    fn test_port_92_fast_a20() {
        let (mut dev, mut mem) = devices();
        dev.io_write8(0x92, 0x02, &mut mem);
        assert!(mem.a20_enabled());
        assert_eq!(dev.io_read8(0x92, &mut mem), 0x02);
        dev.io_write8(0x92, 0x01, &mut mem);
        assert!(dev.take_reset_request());
        assert!(!dev.take_reset_request());
    }

    #[test]
    fn test_inboard_speed_register() {
        let config = MachineConfig {
            cpu_model: CpuModel::I80386,
            cpu_hz: 16_000_000,
            ..MachineConfig::default()
        }
        .validate()
        .unwrap();
        let mut dev = Devices::new(&config);
        let mut mem = Memory::new(640);
        dev.io_write8(0x670, 0x1E, &mut mem);
        assert_eq!(dev.take_inboard_change(), Some(InboardLevel::Level4));
        assert_eq!(dev.take_inboard_change(), None);
    }

    #[test]
    fn test_inboard_absent_on_i430fx() {
        let config = MachineConfig {
            cpu_model: CpuModel::Pentium,
            cpu_hz: 100_000_000,
            architecture: Architecture::I430fx,
            ..MachineConfig::default()
        }
        .validate()
        .unwrap();
        let mut dev = Devices::new(&config);
        let mut mem = Memory::new(640);
        dev.io_write8(0x670, 0x1E, &mut mem);
        assert_eq!(dev.take_inboard_change(), None);
    }

    #[test]
    fn test_uart_rx_irq_level() {
        let (mut dev, mut mem) = devices();
        dev.io_write8(0x21, 0x00, &mut mem);
        // Enable RX interrupt on COM1.
        dev.io_write8(0x3F9, 0x01, &mut mem);
        dev.uarts.ports[0].receive_byte(0x7E);
        dev.tick_14mhz(100);
        assert_eq!(dev.pic.pending_vector(), Some(0x0C)); // IRQ4
        // Reading RBR drops the level.
        assert_eq!(dev.io_read8(0x3F8, &mut mem), 0x7E);
        dev.pic.acknowledge();
    }

    #[test]
    fn test_cmos_via_ports() {
        let (mut dev, mut mem) = devices();
        dev.io_write8(0x70, 0x20, &mut mem);
        dev.io_write8(0x71, 0x5A, &mut mem);
        dev.io_write8(0x70, 0x20, &mut mem);
        assert_eq!(dev.io_read8(0x71, &mut mem), 0x5A);
    }

    #[test]
    fn test_keyboard_reset_bat_at_timing() {
        // Guest-visible reset sequence: write 0xFF to port 0x60, read an
        // immediate ACK, then 0xAA only after the 600 ms AT-class BAT.
        let (mut dev, mut mem) = devices();
        dev.io_write8(0x21, 0x00, &mut mem);
        dev.io_write8(0x60, 0xFF, &mut mem);

        assert_eq!(dev.pic.pending_vector(), Some(0x09));
        dev.pic.acknowledge();
        dev.io_write8(0x20, 0x20, &mut mem); // EOI
        assert_eq!(dev.io_read8(0x60, &mut mem), 0xFA);

        // Just short of the BAT timeout: nothing yet.
        let ticks_599ms = 599 * MHZ14 / 1000;
        dev.tick_14mhz(ticks_599ms);
        assert_eq!(dev.i8042.read_status() & 0x01, 0);

        // Crossing 600 ms delivers the BAT result with another IRQ1.
        dev.tick_14mhz(2 * MHZ14 / 1000);
        assert_eq!(dev.pic.pending_vector(), Some(0x09));
        assert_eq!(dev.io_read8(0x60, &mut mem), 0xAA);
    }

    #[test]
    fn test_joystick_ports() {
        let (mut dev, mut mem) = devices();
        dev.io_write8(0x201, 0xFF, &mut mem);
        // One-shots running right after the fire.
        assert_eq!(dev.io_read8(0x201, &mut mem) & 0x0F, 0x0F);
    }
}
