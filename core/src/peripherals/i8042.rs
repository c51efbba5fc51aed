//! 8042 keyboard controller.
//!
//! Ports 0x60 (data) and 0x64 (status/command), plus the PPI port B image
//! at 0x61. The controller multiplexes two PS/2 device ports (keyboard and
//! mouse), owns a 32-byte RAM bank whose first byte is the command byte,
//! drives the A20 gate and reset line through its output port, and
//! optionally translates set-2 scancodes to set-1 for the first port.

use bitflags::bitflags;

use crate::memory::Memory;
use crate::peripherals::keyboard::{Keyboard, SET2_FROM_SET1};
use crate::peripherals::mouse::Mouse;

bitflags! {
    /// Status register at port 0x64.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Output buffer full (data waiting at 0x60)
        const OBF = 1 << 0;
        /// Input buffer full (host byte not yet consumed)
        const IBF = 1 << 1;
        /// System flag (set by self-test)
        const SYSTEM = 1 << 2;
        /// Last host write went to 0x64 rather than 0x60
        const COMMAND = 1 << 3;
        /// Keyboard not inhibited
        const UNLOCKED = 1 << 4;
        /// Output data came from the aux (mouse) port
        const AUX_DATA = 1 << 5;
        /// Receive timeout
        const TIMEOUT = 1 << 6;
        /// Parity error
        const PARITY = 1 << 7;
    }
}

/// Command-byte bits (controller RAM byte 0).
pub mod command_byte {
    pub const FIRST_PORT_IRQ: u8 = 1 << 0;
    pub const SECOND_PORT_IRQ: u8 = 1 << 1;
    pub const SYSTEM_FLAG: u8 = 1 << 2;
    pub const FIRST_PORT_DISABLE: u8 = 1 << 4;
    pub const SECOND_PORT_DISABLE: u8 = 1 << 5;
    pub const TRANSLATION: u8 = 1 << 6;
}

/// Where the next 0x60 write is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteTarget {
    /// First PS/2 port (keyboard)
    FirstPort,
    /// Second PS/2 port (mouse), after command 0xD4
    SecondPort,
    /// Controller RAM slot, after command 0x60-0x7F
    Ram(u8),
    /// Output port, after command 0xD1
    OutputPort,
    /// Inject into the output buffer as first-port data (0xD2)
    InjectFirst,
    /// Inject into the output buffer as second-port data (0xD3)
    InjectSecond,
}

/// IRQ events the controller produced during a service pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct I8042Irqs {
    pub irq1: bool,
    pub irq12: bool,
}

/// The 8042 controller with its two PS/2 devices.
pub struct I8042 {
    /// Controller RAM; byte 0 is the command byte
    ram: [u8; 0x20],
    status: Status,
    /// Single output buffer latch and its source
    output: Option<u8>,
    output_from_aux: bool,
    write_target: WriteTarget,
    /// Output port image: bit 0 = reset line, bit 1 = A20
    output_port: u8,
    /// Host-visible reset request latched from the output port / 0xFE
    pub reset_requested: bool,
    /// PPI port B image (0x61): speaker gate, refresh toggle
    port_b: u8,
    /// Pending set-2 break prefix while translating
    translate_break: bool,
    pub keyboard: Keyboard,
    pub mouse: Mouse,
}

impl I8042 {
    pub fn new(bat_duration_ns: u64) -> Self {
        Self {
            ram: {
                let mut ram = [0u8; 0x20];
                ram[0] = command_byte::FIRST_PORT_IRQ
                    | command_byte::SYSTEM_FLAG
                    | command_byte::TRANSLATION;
                ram
            },
            status: Status::SYSTEM | Status::UNLOCKED,
            output: None,
            output_from_aux: false,
            write_target: WriteTarget::FirstPort,
            output_port: 0x01, // reset line high (inactive)
            reset_requested: false,
            port_b: 0,
            translate_break: false,
            keyboard: Keyboard::new(bat_duration_ns),
            mouse: Mouse::new(bat_duration_ns),
        }
    }

    /// The command byte (RAM byte 0).
    #[inline]
    fn command_byte(&self) -> u8 {
        self.ram[0]
    }

    /// Status register read (port 0x64).
    pub fn read_status(&self) -> u8 {
        let mut status = self.status;
        status.set(Status::OBF, self.output.is_some());
        status.set(Status::AUX_DATA, self.output_from_aux);
        status.bits()
    }

    /// Data register read (port 0x60): drain the output buffer.
    pub fn read_data(&mut self) -> u8 {
        let value = self.output.take().unwrap_or(0);
        self.output_from_aux = false;
        value
    }

    /// Data register write (port 0x60).
    pub fn write_data(&mut self, value: u8, mem: &mut Memory) {
        self.status.remove(Status::COMMAND);
        match self.write_target {
            WriteTarget::FirstPort => {
                if self.command_byte() & command_byte::FIRST_PORT_DISABLE == 0 {
                    self.keyboard.receive(value);
                }
            }
            WriteTarget::SecondPort => {
                self.write_target = WriteTarget::FirstPort;
                if self.command_byte() & command_byte::SECOND_PORT_DISABLE == 0 {
                    self.mouse.receive(value);
                }
            }
            WriteTarget::Ram(index) => {
                self.write_target = WriteTarget::FirstPort;
                self.ram[index as usize & 0x1F] = value;
                if index == 0 {
                    self.status
                        .set(Status::SYSTEM, value & command_byte::SYSTEM_FLAG != 0);
                }
            }
            WriteTarget::OutputPort => {
                self.write_target = WriteTarget::FirstPort;
                self.set_output_port(value, mem);
            }
            WriteTarget::InjectFirst => {
                self.write_target = WriteTarget::FirstPort;
                self.output = Some(value);
                self.output_from_aux = false;
            }
            WriteTarget::InjectSecond => {
                self.write_target = WriteTarget::FirstPort;
                self.output = Some(value);
                self.output_from_aux = true;
            }
        }
    }

    /// Command register write (port 0x64).
    pub fn write_command(&mut self, value: u8, mem: &mut Memory) {
        self.status.insert(Status::COMMAND);
        match value {
            0x20..=0x3F => {
                // Read RAM slot into the output buffer.
                self.output = Some(self.ram[(value & 0x1F) as usize]);
                self.output_from_aux = false;
            }
            0x60..=0x7F => {
                self.write_target = WriteTarget::Ram(value & 0x1F);
            }
            0xA7 => self.ram[0] |= command_byte::SECOND_PORT_DISABLE,
            0xA8 => self.ram[0] &= !command_byte::SECOND_PORT_DISABLE,
            0xA9 => {
                // Aux interface test: pass.
                self.output = Some(0x00);
                self.output_from_aux = false;
            }
            0xAA => {
                // Controller self-test.
                self.status.insert(Status::SYSTEM);
                self.ram[0] |= command_byte::SYSTEM_FLAG;
                self.output = Some(0x55);
                self.output_from_aux = false;
            }
            0xAB => {
                // First-port interface test: pass.
                self.output = Some(0x00);
                self.output_from_aux = false;
            }
            0xAD => self.ram[0] |= command_byte::FIRST_PORT_DISABLE,
            0xAE => self.ram[0] &= !command_byte::FIRST_PORT_DISABLE,
            0xC0 => {
                // Input port: keyboard not inhibited, extra RAM present.
                self.output = Some(0xFF);
                self.output_from_aux = false;
            }
            0xD0 => {
                self.output = Some(self.output_port);
                self.output_from_aux = false;
            }
            0xD1 => self.write_target = WriteTarget::OutputPort,
            0xD2 => self.write_target = WriteTarget::InjectFirst,
            0xD3 => self.write_target = WriteTarget::InjectSecond,
            0xD4 => self.write_target = WriteTarget::SecondPort,
            0xFE => {
                // Pulse the reset line.
                self.reset_requested = true;
            }
            0xF0..=0xFD | 0xFF => {
                // Other line pulses are no-ops here.
            }
            _ => {
                log::debug!("8042: unhandled command {value:#04X}");
            }
        }
    }

    /// Output-port write: bit 0 low resets the machine, bit 1 is A20.
    fn set_output_port(&mut self, value: u8, mem: &mut Memory) {
        self.output_port = value;
        mem.set_a20(value & 0x02 != 0);
        if value & 0x01 == 0 {
            self.reset_requested = true;
        }
    }

    /// PPI port B read (0x61). Bit 4 toggles on every read to mimic the
    /// RAM refresh detect line.
    pub fn read_port_b(&mut self) -> u8 {
        self.port_b ^= 0x10;
        self.port_b
    }

    /// PPI port B write (0x61): speaker gate and enable bits stick.
    pub fn write_port_b(&mut self, value: u8) {
        self.port_b = (self.port_b & 0x10) | (value & 0x0F);
    }

    /// Translate one set-2 byte to set-1 per the controller ROM table.
    /// Returns `None` while holding the 0xF0 break prefix.
    fn translate(&mut self, byte: u8) -> Option<u8> {
        if byte == 0xF0 {
            self.translate_break = true;
            return None;
        }
        let translated = SET2_FROM_SET1
            .iter()
            .position(|&set2| set2 == byte && byte != 0)
            .map(|set1| set1 as u8)
            .unwrap_or(byte);
        let result = if self.translate_break {
            translated | 0x80
        } else {
            translated
        };
        self.translate_break = false;
        Some(result)
    }

    /// Advance device time and move device bytes into the output buffer.
    /// Returns which IRQ lines should pulse.
    pub fn tick_ns(&mut self, ns: u64) -> I8042Irqs {
        self.keyboard.tick_ns(ns);
        self.mouse.tick_ns(ns);
        self.service()
    }

    /// Fill the output buffer from whichever device has data (aux first
    /// only when the keyboard stream is idle or disabled).
    pub fn service(&mut self) -> I8042Irqs {
        let mut irqs = I8042Irqs::default();
        if self.output.is_some() {
            return irqs;
        }
        let cmd = self.command_byte();

        let kb_allowed = cmd & command_byte::FIRST_PORT_DISABLE == 0;
        if kb_allowed && !self.keyboard.output.is_empty() {
            while let Some(byte) = self.keyboard.output.pop() {
                let byte = if cmd & command_byte::TRANSLATION != 0 {
                    match self.translate(byte) {
                        Some(b) => b,
                        None => continue, // swallowed break prefix
                    }
                } else {
                    byte
                };
                self.output = Some(byte);
                self.output_from_aux = false;
                if cmd & command_byte::FIRST_PORT_IRQ != 0 {
                    irqs.irq1 = true;
                }
                return irqs;
            }
        }

        let aux_allowed = cmd & command_byte::SECOND_PORT_DISABLE == 0;
        if aux_allowed {
            if let Some(byte) = self.mouse.output.pop() {
                self.output = Some(byte);
                self.output_from_aux = true;
                if cmd & command_byte::SECOND_PORT_IRQ != 0 {
                    irqs.irq12 = true;
                }
            }
        }
        irqs
    }

    pub fn reset(&mut self) {
        // Devices keep their configured BAT duration across reset.
        self.keyboard.reset(false);
        self.mouse.reset(false);
        self.ram = [0u8; 0x20];
        self.ram[0] = command_byte::FIRST_PORT_IRQ
            | command_byte::SYSTEM_FLAG
            | command_byte::TRANSLATION;
        self.status = Status::SYSTEM | Status::UNLOCKED;
        self.output = None;
        self.output_from_aux = false;
        self.write_target = WriteTarget::FirstPort;
        self.output_port = 0x01;
        self.reset_requested = false;
        self.translate_break = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> (I8042, Memory) {
        (I8042::new(100_000), Memory::new(640))
    }

    /// Step time until the next output byte is available, then read it.
    fn next_byte(ctl: &mut I8042) -> (u8, I8042Irqs) {
        let irqs = ctl.service();
        assert!(ctl.read_status() & Status::OBF.bits() != 0, "no output");
        (ctl.read_data(), irqs)
    }

    #[test]
    fn test_self_test() {
        let (mut ctl, mut mem) = controller();
        ctl.write_command(0xAA, &mut mem);
        assert_eq!(ctl.read_data(), 0x55);
    }

    #[test]
    fn test_ram_read_write() {
        let (mut ctl, mut mem) = controller();
        ctl.write_command(0x61, &mut mem); // write RAM slot 1
        ctl.write_data(0x42, &mut mem);
        ctl.write_command(0x21, &mut mem); // read RAM slot 1
        assert_eq!(ctl.read_data(), 0x42);
    }

    #[test]
    fn test_keyboard_reset_bat_irq() {
        let (mut ctl, mut mem) = controller();
        // Guest sends keyboard reset through the data port.
        ctl.write_data(0xFF, &mut mem);
        let (ack, irqs) = next_byte(&mut ctl);
        assert_eq!(ack, 0xFA);
        assert!(irqs.irq1);

        // BAT result appears after the timeout.
        let irqs = ctl.tick_ns(100_000);
        assert!(irqs.irq1);
        assert_eq!(ctl.read_data(), 0xAA);
    }

    #[test]
    fn test_aux_routing_and_status_bit() {
        let (mut ctl, mut mem) = controller();
        ctl.write_command(0xD4, &mut mem);
        ctl.write_data(0xF2, &mut mem); // mouse identify
        let (ack, irqs) = next_byte(&mut ctl);
        assert_eq!(ack, 0xFA);
        assert!(irqs.irq12);
        assert!(ctl.read_status() & Status::AUX_DATA.bits() == 0); // drained
        let (id, _) = next_byte(&mut ctl);
        assert_eq!(id, 0x00);
    }

    #[test]
    fn test_aux_data_status_flag_while_full() {
        let (mut ctl, mut mem) = controller();
        ctl.write_command(0xD4, &mut mem);
        ctl.write_data(0xF2, &mut mem);
        let _ = ctl.service();
        assert!(ctl.read_status() & Status::AUX_DATA.bits() != 0);
        assert!(ctl.read_status() & Status::OBF.bits() != 0);
    }

    #[test]
    fn test_translation_set2_to_set1() {
        let (mut ctl, _mem) = controller();
        // 'A': set-2 make 0x1C translates to set-1 0x1E.
        ctl.keyboard.key_event(0x1E, true);
        let (make, _) = next_byte(&mut ctl);
        assert_eq!(make, 0x1E);
        // Break: F0 1C becomes 9E.
        ctl.keyboard.key_event(0x1E, false);
        let (brk, _) = next_byte(&mut ctl);
        assert_eq!(brk, 0x9E);
    }

    #[test]
    fn test_translation_disabled() {
        let (mut ctl, mut mem) = controller();
        ctl.write_command(0x60, &mut mem);
        ctl.write_data(command_byte::FIRST_PORT_IRQ | command_byte::SYSTEM_FLAG, &mut mem);
        ctl.keyboard.key_event(0x1E, true);
        let (make, _) = next_byte(&mut ctl);
        assert_eq!(make, 0x1C); // raw set-2
    }

    #[test]
    fn test_irq_gated_by_command_byte() {
        let (mut ctl, mut mem) = controller();
        // Clear first-port interrupt enable.
        ctl.write_command(0x60, &mut mem);
        ctl.write_data(command_byte::SYSTEM_FLAG | command_byte::TRANSLATION, &mut mem);
        ctl.keyboard.key_event(0x1E, true);
        let irqs = ctl.service();
        assert!(!irqs.irq1);
        assert!(ctl.read_status() & Status::OBF.bits() != 0);
    }

    #[test]
    fn test_output_port_a20_and_reset() {
        let (mut ctl, mut mem) = controller();
        assert!(!mem.a20_enabled());
        ctl.write_command(0xD1, &mut mem);
        ctl.write_data(0x03, &mut mem); // A20 on, reset line high
        assert!(mem.a20_enabled());
        assert!(!ctl.reset_requested);

        ctl.write_command(0xD1, &mut mem);
        ctl.write_data(0x02, &mut mem); // reset line low
        assert!(ctl.reset_requested);
    }

    #[test]
    fn test_pulse_reset() {
        let (mut ctl, mut mem) = controller();
        ctl.write_command(0xFE, &mut mem);
        assert!(ctl.reset_requested);
    }

    #[test]
    fn test_port_b_refresh_toggle() {
        let (mut ctl, _mem) = controller();
        let a = ctl.read_port_b() & 0x10;
        let b = ctl.read_port_b() & 0x10;
        assert_ne!(a, b);
    }

    #[test]
    fn test_disable_first_port_blocks_data() {
        let (mut ctl, mut mem) = controller();
        ctl.write_command(0xAD, &mut mem);
        ctl.keyboard.key_event(0x1E, true);
        let irqs = ctl.service();
        assert!(!irqs.irq1);
        assert!(ctl.read_status() & Status::OBF.bits() == 0);
    }
}
