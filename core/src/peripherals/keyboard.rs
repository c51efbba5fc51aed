//! PS/2 keyboard device state machine.
//!
//! The keyboard answers controller-routed command bytes (ACK-first for
//! most, parameter byte for 0xED/0xF0/0xF3), generates make/break codes
//! from one of the three scan-code sets, runs typematic repeat from the
//! programmed rate/delay byte, and times its BAT self-test in nanoseconds
//! so the reset response (0xAA) appears after the board-appropriate delay.

use crate::fifo::Fifo;

/// Keyboard output queue depth (scancodes + command responses).
const OUTPUT_DEPTH: usize = 32;

/// Command responses.
const ACK: u8 = 0xFA;
const RESEND: u8 = 0xFE;
const BAT_OK: u8 = 0xAA;
const ECHO: u8 = 0xEE;

/// Number of key slots addressed by set-1 make codes.
pub const NUM_KEYS: usize = 0x80;

/// Set-1 -> set-2 make-code translation for the standard key block.
/// Index is the set-1 make code; 0 marks an unused slot.
pub(crate) const SET2_FROM_SET1: [u8; 0x59] = [
    0x00, 0x76, 0x16, 0x1E, 0x26, 0x25, 0x2E, 0x36, 0x3D, 0x3E, 0x46, 0x45, 0x4E, 0x55, 0x66,
    0x0D, 0x15, 0x1D, 0x24, 0x2D, 0x2C, 0x35, 0x3C, 0x43, 0x44, 0x4D, 0x54, 0x5B, 0x5A, 0x14,
    0x1C, 0x1B, 0x23, 0x2B, 0x34, 0x33, 0x3B, 0x42, 0x4B, 0x4C, 0x52, 0x0E, 0x12, 0x5D, 0x1A,
    0x22, 0x21, 0x2A, 0x32, 0x31, 0x3A, 0x41, 0x49, 0x4A, 0x59, 0x7C, 0x11, 0x29, 0x58, 0x05,
    0x06, 0x04, 0x0C, 0x03, 0x0B, 0x02, 0x0A, 0x01, 0x09, 0x77, 0x7E, 0x6C, 0x75, 0x7D, 0x7B,
    0x6B, 0x73, 0x74, 0x79, 0x69, 0x72, 0x7A, 0x70, 0x71, 0x00, 0x00, 0x00, 0x78, 0x07,
];

/// Typematic repeat rates in milliseconds per repeat, indexed by the low
/// five bits of the rate/delay byte.
const REPEAT_RATE_MS: [u32; 32] = [
    33, 37, 42, 46, 48, 54, 58, 63, 67, 75, 83, 92, 100, 109, 116, 125, 133, 149, 167, 182, 200,
    217, 233, 250, 270, 303, 333, 370, 400, 435, 476, 500,
];

/// Typematic initial delays in milliseconds, indexed by bits 5-6.
const REPEAT_DELAY_MS: [u32; 4] = [250, 500, 750, 1000];

/// Scan-code set selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSet {
    Set1,
    Set2,
    Set3,
}

impl ScanSet {
    fn code(self) -> u8 {
        match self {
            ScanSet::Set1 => 1,
            ScanSet::Set2 => 2,
            ScanSet::Set3 => 3,
        }
    }
}

/// Commands that wait for a parameter byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingParam {
    SetLeds,
    ScanSet,
    Typematic,
}

/// The keyboard device.
pub struct Keyboard {
    /// Bytes headed to the 8042
    pub output: Fifo,
    pending: Option<PendingParam>,
    scan_set: ScanSet,
    scanning: bool,
    leds: u8,
    typematic_rate_delay: u8,
    /// Per-key typematic enable (set-3 category commands)
    typematic_enable: [bool; NUM_KEYS],
    /// Per-key break-code enable (set-3 category commands)
    break_enable: [bool; NUM_KEYS],
    /// BAT completion countdown in ns; 0 = idle
    bat_timer_ns: u64,
    /// Configured BAT duration
    bat_duration_ns: u64,
    /// Currently held key for typematic, with its repeat countdown
    held_key: Option<u8>,
    repeat_timer_ns: u64,
    last_sent: u8,
}

impl Keyboard {
    /// Create the keyboard; `bat_duration_ns` comes from the board
    /// architecture (600 ms nominal, 100 us on i430fx-class boards).
    pub fn new(bat_duration_ns: u64) -> Self {
        Self {
            output: Fifo::new(OUTPUT_DEPTH),
            pending: None,
            scan_set: ScanSet::Set2,
            scanning: true,
            leds: 0,
            typematic_rate_delay: 0x2B, // 10.9 cps / 500 ms
            typematic_enable: [true; NUM_KEYS],
            break_enable: [true; NUM_KEYS],
            bat_timer_ns: 0,
            bat_duration_ns,
            held_key: None,
            repeat_timer_ns: 0,
            last_sent: 0,
        }
    }

    /// Power-on / 0xFF reset to defaults, arming the BAT timer.
    pub fn reset(&mut self, run_bat: bool) {
        self.output.clear();
        self.pending = None;
        self.scan_set = ScanSet::Set2;
        self.scanning = true;
        self.leds = 0;
        self.typematic_rate_delay = 0x2B;
        self.typematic_enable = [true; NUM_KEYS];
        self.break_enable = [true; NUM_KEYS];
        self.held_key = None;
        self.bat_timer_ns = if run_bat { self.bat_duration_ns.max(1) } else { 0 };
    }

    fn send(&mut self, byte: u8) {
        self.last_sent = byte;
        self.output.push(byte);
    }

    /// Byte routed to the keyboard from port 0x60.
    pub fn receive(&mut self, byte: u8) {
        if let Some(pending) = self.pending.take() {
            match pending {
                PendingParam::SetLeds => {
                    self.leds = byte & 0x07;
                    self.send(ACK);
                }
                PendingParam::ScanSet => {
                    match byte {
                        0 => {
                            // Report the current set.
                            self.send(ACK);
                            let code = self.scan_set.code();
                            self.send(code);
                        }
                        1 => {
                            self.scan_set = ScanSet::Set1;
                            self.send(ACK);
                        }
                        2 => {
                            self.scan_set = ScanSet::Set2;
                            self.send(ACK);
                        }
                        3 => {
                            self.scan_set = ScanSet::Set3;
                            self.send(ACK);
                        }
                        _ => self.send(RESEND),
                    }
                }
                PendingParam::Typematic => {
                    self.typematic_rate_delay = byte & 0x7F;
                    self.send(ACK);
                }
            }
            return;
        }

        match byte {
            0xFF => {
                // Reset: immediate ACK, BAT result after the timeout.
                self.reset(true);
                self.send(ACK);
            }
            0xFE => {
                let last = self.last_sent;
                self.send(last);
            }
            0xF6 => {
                // Set defaults without BAT.
                self.scan_set = ScanSet::Set2;
                self.typematic_rate_delay = 0x2B;
                self.typematic_enable = [true; NUM_KEYS];
                self.break_enable = [true; NUM_KEYS];
                self.send(ACK);
            }
            0xF5 => {
                self.scanning = false;
                self.held_key = None;
                self.send(ACK);
            }
            0xF4 => {
                self.scanning = true;
                self.send(ACK);
            }
            0xF3 => {
                self.pending = Some(PendingParam::Typematic);
                self.send(ACK);
            }
            0xF2 => {
                // Identify: ACK then the MF2 id.
                self.send(ACK);
                self.send(0xAB);
                self.send(0x83);
            }
            0xF0 => {
                self.pending = Some(PendingParam::ScanSet);
                self.send(ACK);
            }
            0xEE => self.send(ECHO),
            0xED => {
                self.pending = Some(PendingParam::SetLeds);
                self.send(ACK);
            }
            // Set-3 category commands mask whole key classes.
            0xF7 => {
                self.typematic_enable = [true; NUM_KEYS];
                self.break_enable = [false; NUM_KEYS];
                self.send(ACK);
            }
            0xF8 => {
                self.typematic_enable = [false; NUM_KEYS];
                self.break_enable = [true; NUM_KEYS];
                self.send(ACK);
            }
            0xF9 => {
                self.typematic_enable = [false; NUM_KEYS];
                self.break_enable = [false; NUM_KEYS];
                self.send(ACK);
            }
            0xFA => {
                self.typematic_enable = [true; NUM_KEYS];
                self.break_enable = [true; NUM_KEYS];
                self.send(ACK);
            }
            _ => self.send(RESEND),
        }
    }

    /// Host key event, keyed by the set-1 make code.
    pub fn key_event(&mut self, set1_code: u8, pressed: bool) {
        if !self.scanning || set1_code as usize >= NUM_KEYS {
            return;
        }
        if pressed {
            self.emit_make(set1_code);
            if self.typematic_enable[set1_code as usize] {
                self.held_key = Some(set1_code);
                self.repeat_timer_ns = self.repeat_delay_ns();
            }
        } else {
            if self.held_key == Some(set1_code) {
                self.held_key = None;
            }
            if self.break_enable[set1_code as usize] || self.scan_set != ScanSet::Set3 {
                self.emit_break(set1_code);
            }
        }
    }

    fn emit_make(&mut self, set1_code: u8) {
        match self.scan_set {
            ScanSet::Set1 => self.send(set1_code),
            ScanSet::Set2 | ScanSet::Set3 => {
                let code = translate_set2(set1_code);
                if code != 0 {
                    self.send(code);
                }
            }
        }
    }

    fn emit_break(&mut self, set1_code: u8) {
        match self.scan_set {
            ScanSet::Set1 => self.send(set1_code | 0x80),
            ScanSet::Set2 | ScanSet::Set3 => {
                let code = translate_set2(set1_code);
                if code != 0 {
                    self.send(0xF0);
                    self.send(code);
                }
            }
        }
    }

    /// Nanoseconds before the first typematic repeat.
    fn repeat_delay_ns(&self) -> u64 {
        REPEAT_DELAY_MS[((self.typematic_rate_delay >> 5) & 3) as usize] as u64 * 1_000_000
    }

    /// Nanoseconds between repeats.
    fn repeat_rate_ns(&self) -> u64 {
        REPEAT_RATE_MS[(self.typematic_rate_delay & 0x1F) as usize] as u64 * 1_000_000
    }

    /// Advance device time: BAT completion and typematic repeats.
    pub fn tick_ns(&mut self, ns: u64) {
        if self.bat_timer_ns > 0 {
            if self.bat_timer_ns <= ns {
                self.bat_timer_ns = 0;
                self.send(BAT_OK);
            } else {
                self.bat_timer_ns -= ns;
            }
        }

        if let Some(key) = self.held_key {
            if self.scanning {
                let mut remaining = ns;
                while remaining >= self.repeat_timer_ns {
                    remaining -= self.repeat_timer_ns;
                    self.emit_make(key);
                    self.repeat_timer_ns = self.repeat_rate_ns().max(1);
                }
                self.repeat_timer_ns -= remaining;
            }
        }
    }

    /// Current LED state (for host indicators).
    pub fn leds(&self) -> u8 {
        self.leds
    }

    /// Current scan-code set.
    pub fn scan_set(&self) -> ScanSet {
        self.scan_set
    }
}

/// Set-1 -> set-2 translation with out-of-table codes suppressed.
fn translate_set2(set1_code: u8) -> u8 {
    SET2_FROM_SET1
        .get(set1_code as usize)
        .copied()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(kb: &mut Keyboard) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = kb.output.pop() {
            out.push(b);
        }
        out
    }

    #[test]
    fn test_reset_ack_then_bat() {
        let mut kb = Keyboard::new(600_000_000);
        kb.receive(0xFF);
        assert_eq!(drain(&mut kb), vec![ACK]);
        // BAT completes only after the timeout.
        kb.tick_ns(599_999_999);
        assert!(kb.output.is_empty());
        kb.tick_ns(1);
        assert_eq!(drain(&mut kb), vec![BAT_OK]);
    }

    #[test]
    fn test_short_bat_on_i430fx_timing() {
        let mut kb = Keyboard::new(100_000);
        kb.receive(0xFF);
        let _ = drain(&mut kb);
        kb.tick_ns(100_000);
        assert_eq!(drain(&mut kb), vec![BAT_OK]);
    }

    #[test]
    fn test_echo_and_identify() {
        let mut kb = Keyboard::new(100_000);
        kb.receive(0xEE);
        assert_eq!(drain(&mut kb), vec![ECHO]);
        kb.receive(0xF2);
        assert_eq!(drain(&mut kb), vec![ACK, 0xAB, 0x83]);
    }

    #[test]
    fn test_scan_set_switch_and_report() {
        let mut kb = Keyboard::new(100_000);
        kb.receive(0xF0);
        kb.receive(0x01);
        assert_eq!(drain(&mut kb), vec![ACK, ACK]);
        assert_eq!(kb.scan_set(), ScanSet::Set1);

        kb.receive(0xF0);
        kb.receive(0x00);
        assert_eq!(drain(&mut kb), vec![ACK, ACK, 1]);
    }

    #[test]
    fn test_set2_make_break() {
        let mut kb = Keyboard::new(100_000);
        // Set-1 code 0x1E = 'A'; set-2 make is 0x1C.
        kb.key_event(0x1E, true);
        kb.key_event(0x1E, false);
        assert_eq!(drain(&mut kb), vec![0x1C, 0xF0, 0x1C]);
    }

    #[test]
    fn test_set1_make_break() {
        let mut kb = Keyboard::new(100_000);
        kb.receive(0xF0);
        kb.receive(0x01);
        let _ = drain(&mut kb);
        kb.key_event(0x1E, true);
        kb.key_event(0x1E, false);
        assert_eq!(drain(&mut kb), vec![0x1E, 0x9E]);
    }

    #[test]
    fn test_typematic_repeat() {
        let mut kb = Keyboard::new(100_000);
        kb.receive(0xF3);
        kb.receive(0x00); // fastest rate, 250 ms delay
        let _ = drain(&mut kb);

        kb.key_event(0x1E, true);
        assert_eq!(drain(&mut kb), vec![0x1C]);
        // Before the initial delay: silence.
        kb.tick_ns(249_000_000);
        assert!(kb.output.is_empty());
        // After the delay the key repeats.
        kb.tick_ns(1_000_000);
        assert_eq!(drain(&mut kb), vec![0x1C]);
        // And again at the repeat rate (33 ms).
        kb.tick_ns(33_000_000);
        assert_eq!(drain(&mut kb), vec![0x1C]);

        kb.key_event(0x1E, false);
        let _ = drain(&mut kb);
        kb.tick_ns(1_000_000_000);
        assert!(kb.output.is_empty());
    }

    #[test]
    fn test_make_only_mode() {
        let mut kb = Keyboard::new(100_000);
        kb.receive(0xF0);
        kb.receive(0x03); // set 3
        kb.receive(0xF9); // make-only
        let _ = drain(&mut kb);

        kb.key_event(0x1E, true);
        kb.key_event(0x1E, false);
        // Make code only; the break is masked.
        assert_eq!(drain(&mut kb), vec![0x1C]);
        // Typematic also masked: holding produces nothing more.
        kb.tick_ns(2_000_000_000);
        assert!(kb.output.is_empty());
    }

    #[test]
    fn test_disable_enable_scanning() {
        let mut kb = Keyboard::new(100_000);
        kb.receive(0xF5);
        let _ = drain(&mut kb);
        kb.key_event(0x1E, true);
        assert!(kb.output.is_empty());
        kb.receive(0xF4);
        let _ = drain(&mut kb);
        kb.key_event(0x1E, true);
        assert_eq!(drain(&mut kb), vec![0x1C]);
    }

    #[test]
    fn test_resend() {
        let mut kb = Keyboard::new(100_000);
        kb.receive(0xEE);
        let _ = drain(&mut kb);
        kb.receive(0xFE);
        assert_eq!(drain(&mut kb), vec![ECHO]);
    }
}
