//! CMOS RAM and real-time clock behind ports 0x70/0x71.
//!
//! The RAM bank is 128 bytes on AT-class boards, 256 on PS/2 and PCI
//! chipset boards. Registers 0x00-0x09 are the BCD clock, 0x0A-0x0D the
//! status registers. Bit 7 of the index write masks NMI. The packed
//! persisted image keeps the 64-byte low RAM exactly, plus the divergence
//! counter tracking how far emulated time has drifted from the host.

/// Clock/status register indices.
mod reg {
    pub const SECONDS: u8 = 0x00;
    pub const MINUTES: u8 = 0x02;
    pub const HOURS: u8 = 0x04;
    pub const DAY: u8 = 0x07;
    pub const MONTH: u8 = 0x08;
    pub const YEAR: u8 = 0x09;
    pub const STATUS_A: u8 = 0x0A;
    pub const STATUS_B: u8 = 0x0B;
    pub const STATUS_C: u8 = 0x0C;
    pub const STATUS_D: u8 = 0x0D;
}

/// Standard checksummed range (0x10-0x2D, summed into 0x2E/0x2F).
const CHECKSUM_RANGE: std::ops::RangeInclusive<usize> = 0x10..=0x2D;

fn to_bcd(value: u8) -> u8 {
    (value / 10) << 4 | (value % 10)
}

/// The CMOS/RTC device.
pub struct Cmos {
    ram: Vec<u8>,
    index: u8,
    /// NMI masked via bit 7 of the index write
    pub nmi_masked: bool,
    /// Sub-second accumulator in ns
    subsecond_ns: u64,
    /// Seconds since midnight, driving the BCD clock registers
    seconds_today: u32,
    /// Signed drift between emulated and host time, in seconds
    divergence: i64,
}

impl Cmos {
    /// `size` is 128 or 256 bytes depending on the board.
    pub fn new(size: usize) -> Self {
        let mut cmos = Self {
            ram: vec![0; size.max(128)],
            index: 0,
            nmi_masked: false,
            subsecond_ns: 0,
            seconds_today: 0,
            divergence: 0,
        };
        cmos.ram[reg::STATUS_A as usize] = 0x26; // 32.768 kHz, divider on
        cmos.ram[reg::STATUS_B as usize] = 0x02; // 24-hour, BCD
        cmos.ram[reg::STATUS_D as usize] = 0x80; // battery good
        cmos
    }

    /// Index write (port 0x70): low 7 bits select, bit 7 masks NMI.
    pub fn write_index(&mut self, value: u8) {
        self.index = value & 0x7F;
        self.nmi_masked = value & 0x80 != 0;
    }

    /// Data read (port 0x71).
    pub fn read_data(&mut self) -> u8 {
        let index = self.index;
        match index {
            reg::SECONDS => to_bcd((self.seconds_today % 60) as u8),
            reg::MINUTES => to_bcd((self.seconds_today / 60 % 60) as u8),
            reg::HOURS => to_bcd((self.seconds_today / 3600 % 24) as u8),
            reg::STATUS_C => {
                // Interrupt flags clear on read.
                let value = self.ram[index as usize];
                self.ram[index as usize] = 0;
                value
            }
            _ => self
                .ram
                .get(index as usize)
                .copied()
                .unwrap_or(0xFF),
        }
    }

    /// Data write (port 0x71). Clock registers write through to the
    /// second counter; everything else is plain RAM.
    pub fn write_data(&mut self, value: u8) {
        let index = self.index as usize;
        match self.index {
            reg::SECONDS | reg::MINUTES | reg::HOURS => {
                let bcd = |v: u8| (v >> 4) as u32 * 10 + (v & 0xF) as u32;
                let mut s = self.seconds_today;
                match self.index {
                    reg::SECONDS => s = s / 60 * 60 + bcd(value).min(59),
                    reg::MINUTES => {
                        s = s / 3600 * 3600 + bcd(value).min(59) * 60 + s % 60;
                    }
                    _ => s = bcd(value).min(23) * 3600 + s % 3600,
                }
                self.seconds_today = s;
                self.ram[index] = value;
            }
            reg::STATUS_D => {} // read-only
            _ => {
                if index < self.ram.len() {
                    self.ram[index] = value;
                }
            }
        }
    }

    /// Advance the wall clock.
    pub fn tick_ns(&mut self, ns: u64) {
        self.subsecond_ns += ns;
        while self.subsecond_ns >= 1_000_000_000 {
            self.subsecond_ns -= 1_000_000_000;
            self.seconds_today = (self.seconds_today + 1) % 86_400;
            // Update-ended flag in status C.
            self.ram[reg::STATUS_C as usize] |= 0x10;
        }
    }

    /// Note drift between emulated and host time.
    pub fn add_divergence(&mut self, seconds: i64) {
        self.divergence += seconds;
    }

    /// Current drift in seconds.
    pub fn divergence(&self) -> i64 {
        self.divergence
    }

    /// Set the clock (host wall time converted by the frontend).
    pub fn set_time(&mut self, hours: u8, minutes: u8, seconds: u8, day: u8, month: u8, year: u8) {
        self.seconds_today =
            hours as u32 % 24 * 3600 + minutes as u32 % 60 * 60 + seconds as u32 % 60;
        self.ram[reg::DAY as usize] = to_bcd(day);
        self.ram[reg::MONTH as usize] = to_bcd(month);
        self.ram[reg::YEAR as usize] = to_bcd(year);
    }

    /// Recompute the standard checksum over 0x10-0x2D into 0x2E/0x2F.
    pub fn update_checksum(&mut self) {
        let sum: u16 = self.ram[CHECKSUM_RANGE]
            .iter()
            .map(|&b| b as u16)
            .sum();
        self.ram[0x2E] = (sum >> 8) as u8;
        self.ram[0x2F] = (sum & 0xFF) as u8;
    }

    /// Does the stored checksum match the contents?
    pub fn checksum_ok(&self) -> bool {
        let sum: u16 = self.ram[CHECKSUM_RANGE]
            .iter()
            .map(|&b| b as u16)
            .sum();
        self.ram[0x2E] == (sum >> 8) as u8 && self.ram[0x2F] == (sum & 0xFF) as u8
    }

    // ========== State persistence ==========

    /// Packed image: full RAM bank, divergence counter, clock state.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.ram.len() + 16);
        buf.extend_from_slice(&self.ram);
        buf.extend_from_slice(&self.divergence.to_le_bytes());
        buf.extend_from_slice(&self.seconds_today.to_le_bytes());
        buf
    }

    /// Restore from a packed image; the 64-byte low RAM must survive
    /// byte-for-byte.
    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<(), i32> {
        if buf.len() < self.ram.len() + 12 {
            return Err(-105);
        }
        let ram_len = self.ram.len();
        self.ram.copy_from_slice(&buf[..ram_len]);
        self.divergence = i64::from_le_bytes(buf[ram_len..ram_len + 8].try_into().unwrap());
        self.seconds_today =
            u32::from_le_bytes(buf[ram_len + 8..ram_len + 12].try_into().unwrap());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_read_write() {
        let mut cmos = Cmos::new(128);
        cmos.write_index(0x15);
        cmos.write_data(0x80);
        cmos.write_index(0x15);
        assert_eq!(cmos.read_data(), 0x80);
    }

    #[test]
    fn test_nmi_mask_bit() {
        let mut cmos = Cmos::new(128);
        cmos.write_index(0x8F);
        assert!(cmos.nmi_masked);
        assert_eq!(cmos.index, 0x0F);
        cmos.write_index(0x0F);
        assert!(!cmos.nmi_masked);
    }

    #[test]
    fn test_clock_advances_bcd() {
        let mut cmos = Cmos::new(128);
        cmos.set_time(12, 34, 56, 1, 7, 99);
        cmos.tick_ns(5_000_000_000);
        cmos.write_index(0x00);
        assert_eq!(cmos.read_data(), 0x01); // 56 + 5 = 61 -> :01
        cmos.write_index(0x02);
        assert_eq!(cmos.read_data(), 0x35);
        cmos.write_index(0x04);
        assert_eq!(cmos.read_data(), 0x12);
    }

    #[test]
    fn test_status_c_clears_on_read() {
        let mut cmos = Cmos::new(128);
        cmos.tick_ns(1_000_000_000);
        cmos.write_index(0x0C);
        assert_ne!(cmos.read_data(), 0);
        cmos.write_index(0x0C);
        assert_eq!(cmos.read_data(), 0);
    }

    #[test]
    fn test_checksum() {
        let mut cmos = Cmos::new(128);
        cmos.write_index(0x10);
        cmos.write_data(0x40);
        assert!(!cmos.checksum_ok());
        cmos.update_checksum();
        assert!(cmos.checksum_ok());
    }

    #[test]
    fn test_persistence_round_trip() {
        let mut cmos = Cmos::new(128);
        for i in 0..64u8 {
            cmos.write_index(i);
            cmos.write_data(i ^ 0xA5);
        }
        cmos.add_divergence(-42);
        let image = cmos.to_bytes();

        let mut restored = Cmos::new(128);
        restored.from_bytes(&image).unwrap();
        assert_eq!(restored.divergence(), -42);
        // The low 64 bytes are preserved exactly (clock registers
        // included, since they were written as RAM).
        for i in 0x0E..64u8 {
            restored.write_index(i);
            assert_eq!(restored.read_data(), i ^ 0xA5, "byte {i:#04X}");
        }
    }

    #[test]
    fn test_256_byte_bank() {
        let mut cmos = Cmos::new(256);
        cmos.write_index(0x7F);
        cmos.write_data(0x77);
        cmos.write_index(0x7F);
        assert_eq!(cmos.read_data(), 0x77);
    }
}
