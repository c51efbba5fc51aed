//! 8253/8254 timer, channel 0 only: the IRQ0 rate generator.
//!
//! The counter runs at the master clock divided by 12 (1.193182 MHz).
//! Modes 2 and 3 reload automatically and pulse IRQ0 on every expiry;
//! the other modes degrade to one-shot behavior, which is all the BIOS
//! paths exercised here require.

/// Access sequence selected by the control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    LatchOnly,
    LoByte,
    HiByte,
    LoHi,
}

/// Channel 0 state.
pub struct Pit {
    reload: u16,
    counter: u32,
    mode: u8,
    access: AccessMode,
    /// Next data-port write is the high byte of a lo/hi pair
    writing_hi: bool,
    /// Next data-port read is the high byte
    reading_hi: bool,
    latch: Option<u16>,
    running: bool,
}

impl Pit {
    pub fn new() -> Self {
        Self {
            reload: 0, // 0 counts as 65536
            counter: 0x1_0000,
            mode: 2,
            access: AccessMode::LoHi,
            writing_hi: false,
            reading_hi: false,
            latch: None,
            running: false,
        }
    }

    #[inline]
    fn reload_value(&self) -> u32 {
        if self.reload == 0 {
            0x1_0000
        } else {
            self.reload as u32
        }
    }

    /// Control-word write (port 0x43). Only channel 0 is decoded.
    pub fn write_control(&mut self, value: u8) {
        let channel = value >> 6;
        if channel != 0 {
            return;
        }
        let access = (value >> 4) & 3;
        if access == 0 {
            // Counter latch command.
            self.latch = Some(self.counter as u16);
            return;
        }
        self.access = match access {
            1 => AccessMode::LoByte,
            2 => AccessMode::HiByte,
            _ => AccessMode::LoHi,
        };
        self.mode = (value >> 1) & 7;
        self.writing_hi = false;
        self.reading_hi = false;
        self.running = false;
    }

    /// Data write (port 0x40).
    pub fn write_data(&mut self, value: u8) {
        match self.access {
            AccessMode::LoByte => {
                self.reload = (self.reload & 0xFF00) | value as u16;
                self.start();
            }
            AccessMode::HiByte => {
                self.reload = (self.reload & 0x00FF) | (value as u16) << 8;
                self.start();
            }
            AccessMode::LoHi | AccessMode::LatchOnly => {
                if self.writing_hi {
                    self.reload = (self.reload & 0x00FF) | (value as u16) << 8;
                    self.writing_hi = false;
                    self.start();
                } else {
                    self.reload = (self.reload & 0xFF00) | value as u16;
                    self.writing_hi = true;
                }
            }
        }
    }

    fn start(&mut self) {
        self.counter = self.reload_value();
        self.running = true;
    }

    /// Data read (port 0x40): latched or live counter.
    pub fn read_data(&mut self) -> u8 {
        let value = self.latch.unwrap_or(self.counter as u16);
        match self.access {
            AccessMode::LoByte => {
                self.latch = None;
                (value & 0xFF) as u8
            }
            AccessMode::HiByte => {
                self.latch = None;
                (value >> 8) as u8
            }
            _ => {
                if self.reading_hi {
                    self.reading_hi = false;
                    self.latch = None;
                    (value >> 8) as u8
                } else {
                    self.reading_hi = true;
                    (value & 0xFF) as u8
                }
            }
        }
    }

    /// Advance by `ticks` PIT clocks; returns the number of IRQ0 pulses.
    pub fn tick(&mut self, ticks: u64) -> u32 {
        if !self.running {
            return 0;
        }
        let mut pulses = 0;
        let mut remaining = ticks;
        while remaining > 0 {
            if (self.counter as u64) > remaining {
                self.counter -= remaining as u32;
                break;
            }
            remaining -= self.counter as u64;
            pulses += 1;
            match self.mode {
                2 | 3 => self.counter = self.reload_value(),
                _ => {
                    // One-shot: stay expired.
                    self.counter = 0x1_0000;
                    self.running = false;
                    break;
                }
            }
        }
        pulses
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for Pit {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_generator_pulses() {
        let mut pit = Pit::new();
        pit.write_control(0x34); // ch0, lo/hi, mode 2
        pit.write_data(0x00);
        pit.write_data(0x10); // reload 0x1000
        assert_eq!(pit.tick(0x0FFF), 0);
        assert_eq!(pit.tick(1), 1);
        assert_eq!(pit.tick(0x2000), 2);
    }

    #[test]
    fn test_reload_zero_is_65536() {
        let mut pit = Pit::new();
        pit.write_control(0x34);
        pit.write_data(0x00);
        pit.write_data(0x00);
        assert_eq!(pit.tick(0xFFFF), 0);
        assert_eq!(pit.tick(1), 1);
    }

    #[test]
    fn test_latch_read() {
        let mut pit = Pit::new();
        pit.write_control(0x34);
        pit.write_data(0x34);
        pit.write_data(0x12);
        pit.tick(0x100);
        pit.write_control(0x00); // latch
        let lo = pit.read_data() as u16;
        let hi = pit.read_data() as u16;
        assert_eq!(lo | hi << 8, 0x1234 - 0x100);
    }

    #[test]
    fn test_one_shot_stops() {
        let mut pit = Pit::new();
        pit.write_control(0x30); // mode 0
        pit.write_data(0x10);
        pit.write_data(0x00);
        assert_eq!(pit.tick(0x10), 1);
        assert_eq!(pit.tick(0x1_0000), 0);
    }
}
