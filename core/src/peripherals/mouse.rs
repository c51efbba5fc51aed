//! PS/2 mouse device state machine.
//!
//! Three operating modes: stream (autonomous packets at the sample rate),
//! remote (packets only on 0xEB poll), and wrap (every received byte is
//! echoed until 0xEC or reset). Movement accumulates in device counts at
//! the programmed resolution; stream mode optionally applies the 2:1
//! scaling curve before packing the 3-byte report.

use crate::fifo::Fifo;

const OUTPUT_DEPTH: usize = 48;

const ACK: u8 = 0xFA;
const BAT_OK: u8 = 0xAA;
const MOUSE_ID: u8 = 0x00;

/// Operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseMode {
    Stream,
    Remote,
    Wrap,
}

/// Commands that take a parameter byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingParam {
    SampleRate,
    Resolution,
}

/// The mouse device.
pub struct Mouse {
    /// Bytes headed to the 8042 aux port
    pub output: Fifo,
    mode: MouseMode,
    /// Mode to restore when wrap mode ends
    saved_mode: MouseMode,
    pending: Option<PendingParam>,
    data_reporting: bool,
    /// Resolution selector 0-3: 1/2/4/8 counts per mm
    resolution: u8,
    /// 2:1 scaling engaged
    scaling_2to1: bool,
    sample_rate: u8,
    /// Accumulated movement in counts
    dx: i32,
    dy: i32,
    buttons: u8,
    buttons_dirty: bool,
    /// Stream-mode sample countdown
    sample_timer_ns: u64,
    /// BAT completion countdown; 0 = idle
    bat_timer_ns: u64,
    bat_duration_ns: u64,
}

impl Mouse {
    pub fn new(bat_duration_ns: u64) -> Self {
        Self {
            output: Fifo::new(OUTPUT_DEPTH),
            mode: MouseMode::Stream,
            saved_mode: MouseMode::Stream,
            pending: None,
            data_reporting: false,
            resolution: 2, // 4 counts/mm
            scaling_2to1: false,
            sample_rate: 100,
            dx: 0,
            dy: 0,
            buttons: 0,
            buttons_dirty: false,
            sample_timer_ns: 0,
            bat_timer_ns: 0,
            bat_duration_ns,
        }
    }

    /// Reset to defaults; a full reset (0xFF) also runs the BAT.
    pub fn reset(&mut self, run_bat: bool) {
        self.output.clear();
        self.mode = MouseMode::Stream;
        self.saved_mode = MouseMode::Stream;
        self.pending = None;
        self.data_reporting = false;
        self.resolution = 2;
        self.scaling_2to1 = false;
        self.sample_rate = 100;
        self.dx = 0;
        self.dy = 0;
        self.buttons = 0;
        self.buttons_dirty = false;
        self.bat_timer_ns = if run_bat { self.bat_duration_ns.max(1) } else { 0 };
    }

    fn send(&mut self, byte: u8) {
        self.output.push(byte);
    }

    /// Byte routed to the mouse from port 0x60 (via 0x64 command 0xD4).
    pub fn receive(&mut self, byte: u8) {
        if self.mode == MouseMode::Wrap && byte != 0xEC && byte != 0xFF {
            self.send(byte);
            return;
        }

        if let Some(pending) = self.pending.take() {
            match pending {
                PendingParam::SampleRate => {
                    if matches!(byte, 10 | 20 | 40 | 60 | 80 | 100 | 200) {
                        self.sample_rate = byte;
                        self.send(ACK);
                    } else {
                        self.send(0xFE);
                    }
                }
                PendingParam::Resolution => {
                    if byte <= 3 {
                        self.resolution = byte;
                        self.send(ACK);
                    } else {
                        self.send(0xFE);
                    }
                }
            }
            return;
        }

        match byte {
            0xFF => {
                self.reset(true);
                self.send(ACK);
            }
            0xF6 => {
                self.resolution = 2;
                self.sample_rate = 100;
                self.scaling_2to1 = false;
                self.data_reporting = false;
                self.mode = MouseMode::Stream;
                self.send(ACK);
            }
            0xF5 => {
                self.data_reporting = false;
                self.send(ACK);
            }
            0xF4 => {
                self.data_reporting = true;
                self.send(ACK);
            }
            0xF3 => {
                self.pending = Some(PendingParam::SampleRate);
                self.send(ACK);
            }
            0xF2 => {
                self.send(ACK);
                self.send(MOUSE_ID);
            }
            0xF0 => {
                self.mode = MouseMode::Remote;
                self.send(ACK);
            }
            0xEE => {
                self.saved_mode = self.mode;
                self.mode = MouseMode::Wrap;
                self.send(ACK);
            }
            0xEC => {
                if self.mode == MouseMode::Wrap {
                    self.mode = self.saved_mode;
                }
                self.send(ACK);
            }
            0xEB => {
                // Remote poll: ACK then one packet.
                self.send(ACK);
                self.emit_packet();
            }
            0xEA => {
                self.mode = MouseMode::Stream;
                self.send(ACK);
            }
            0xE9 => {
                // Status request.
                self.send(ACK);
                let status = ((self.mode == MouseMode::Remote) as u8) << 6
                    | (self.data_reporting as u8) << 5
                    | (self.scaling_2to1 as u8) << 4
                    | (self.buttons & 7);
                self.send(status);
                let resolution = self.resolution;
                self.send(resolution);
                let rate = self.sample_rate;
                self.send(rate);
            }
            0xE8 => {
                self.pending = Some(PendingParam::Resolution);
                self.send(ACK);
            }
            0xE7 => {
                self.scaling_2to1 = true;
                self.send(ACK);
            }
            0xE6 => {
                self.scaling_2to1 = false;
                self.send(ACK);
            }
            _ => self.send(0xFE),
        }
    }

    /// Host movement event in millimeter-scaled units; converted to
    /// counts at the programmed resolution.
    pub fn movement(&mut self, dx_mm: i32, dy_mm: i32) {
        let counts_per_mm = 1i32 << self.resolution;
        self.dx += dx_mm * counts_per_mm;
        self.dy += dy_mm * counts_per_mm;
    }

    /// Host button event: bit 0 left, bit 1 right, bit 2 middle.
    pub fn set_buttons(&mut self, buttons: u8) {
        if self.buttons != buttons & 7 {
            self.buttons = buttons & 7;
            self.buttons_dirty = true;
        }
    }

    /// The 2:1 scaling curve applied to stream-mode deltas.
    fn scale(&self, delta: i32) -> i32 {
        if !self.scaling_2to1 || self.mode != MouseMode::Stream {
            return delta;
        }
        let magnitude = delta.unsigned_abs() as i32;
        let scaled = match magnitude {
            0 => 0,
            1 => 1,
            2 => 1,
            3 => 3,
            4 => 6,
            5 => 9,
            n => n * 2,
        };
        if delta < 0 {
            -scaled
        } else {
            scaled
        }
    }

    /// Pack and queue one 3-byte report from the accumulated state.
    fn emit_packet(&mut self) {
        let dx = self.scale(self.dx);
        let dy = self.scale(self.dy);
        self.dx = 0;
        self.dy = 0;
        self.buttons_dirty = false;

        let x_overflow = !(-256..=255).contains(&dx);
        let y_overflow = !(-256..=255).contains(&dy);
        let dx = dx.clamp(-256, 255);
        let dy = dy.clamp(-256, 255);

        let header = 0x08
            | (self.buttons & 7)
            | ((dx < 0) as u8) << 4
            | ((dy < 0) as u8) << 5
            | (x_overflow as u8) << 6
            | (y_overflow as u8) << 7;
        self.send(header);
        self.send(dx as u8);
        self.send(dy as u8);
    }

    /// Anything worth reporting in stream mode?
    fn has_activity(&self) -> bool {
        self.dx != 0 || self.dy != 0 || self.buttons_dirty
    }

    /// Advance device time: BAT completion and stream sampling.
    pub fn tick_ns(&mut self, ns: u64) {
        if self.bat_timer_ns > 0 {
            if self.bat_timer_ns <= ns {
                self.bat_timer_ns = 0;
                self.send(BAT_OK);
                self.send(MOUSE_ID);
            } else {
                self.bat_timer_ns -= ns;
            }
        }

        if self.mode == MouseMode::Stream && self.data_reporting {
            let period = 1_000_000_000u64 / self.sample_rate.max(10) as u64;
            self.sample_timer_ns += ns;
            while self.sample_timer_ns >= period {
                self.sample_timer_ns -= period;
                if self.has_activity() && self.output.free() >= 3 {
                    self.emit_packet();
                }
            }
        }
    }

    /// Current mode (for tests and the debugger).
    pub fn mode(&self) -> MouseMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(mouse: &mut Mouse) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(b) = mouse.output.pop() {
            out.push(b);
        }
        out
    }

    #[test]
    fn test_reset_bat_sequence() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xFF);
        assert_eq!(drain(&mut mouse), vec![ACK]);
        mouse.tick_ns(100_000);
        assert_eq!(drain(&mut mouse), vec![BAT_OK, MOUSE_ID]);
    }

    #[test]
    fn test_identify() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xF2);
        assert_eq!(drain(&mut mouse), vec![ACK, MOUSE_ID]);
    }

    #[test]
    fn test_remote_poll() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xF0); // remote mode
        let _ = drain(&mut mouse);
        mouse.movement(1, 0);
        mouse.set_buttons(0x1);
        mouse.receive(0xEB);
        let bytes = drain(&mut mouse);
        assert_eq!(bytes[0], ACK);
        // Header: sync bit, left button; dx = 4 counts (4/mm resolution).
        assert_eq!(bytes[1], 0x09);
        assert_eq!(bytes[2], 4);
        assert_eq!(bytes[3], 0);
    }

    #[test]
    fn test_wrap_mode_echo() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xEE);
        let _ = drain(&mut mouse);
        assert_eq!(mouse.mode(), MouseMode::Wrap);
        mouse.receive(0x42);
        assert_eq!(drain(&mut mouse), vec![0x42]);
        mouse.receive(0xEC);
        let _ = drain(&mut mouse);
        assert_eq!(mouse.mode(), MouseMode::Stream);
    }

    #[test]
    fn test_stream_reporting() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xF4); // enable reporting
        let _ = drain(&mut mouse);
        mouse.movement(0, 1);
        // One sample period at the default 100 Hz.
        mouse.tick_ns(10_000_000);
        let bytes = drain(&mut mouse);
        assert_eq!(bytes.len(), 3);
        assert_eq!(bytes[0] & 0x08, 0x08);
        assert_eq!(bytes[2], 4); // dy = 4 counts
    }

    #[test]
    fn test_no_packet_without_reporting() {
        let mut mouse = Mouse::new(100_000);
        mouse.movement(5, 5);
        mouse.tick_ns(100_000_000);
        assert!(mouse.output.is_empty());
    }

    #[test]
    fn test_resolution_changes_counts() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xE8);
        mouse.receive(0x00); // 1 count/mm
        mouse.receive(0xF0);
        let _ = drain(&mut mouse);
        mouse.movement(3, 0);
        mouse.receive(0xEB);
        let bytes = drain(&mut mouse);
        assert_eq!(bytes[2], 3);
    }

    #[test]
    fn test_scaling_2to1_in_stream_only() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xE8);
        mouse.receive(0x00); // 1 count/mm
        mouse.receive(0xE7); // 2:1
        mouse.receive(0xF4);
        let _ = drain(&mut mouse);

        mouse.movement(5, 0);
        mouse.tick_ns(10_000_000);
        let bytes = drain(&mut mouse);
        // Piecewise curve maps 5 to 9.
        assert_eq!(bytes[1] & 0x10, 0); // positive
        assert_eq!(bytes[2], 9);

        // Remote polls bypass the curve.
        mouse.receive(0xF0);
        let _ = drain(&mut mouse);
        mouse.movement(5, 0);
        mouse.receive(0xEB);
        let bytes = drain(&mut mouse);
        assert_eq!(bytes[2], 5);
    }

    #[test]
    fn test_status_request() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xE7);
        mouse.receive(0xF4);
        let _ = drain(&mut mouse);
        mouse.set_buttons(0x2);
        mouse.receive(0xE9);
        let bytes = drain(&mut mouse);
        assert_eq!(bytes[0], ACK);
        // Reporting on, 2:1 scaling, right button.
        assert_eq!(bytes[1], 0x20 | 0x10 | 0x02);
        assert_eq!(bytes[2], 2); // resolution selector
        assert_eq!(bytes[3], 100); // sample rate
    }

    #[test]
    fn test_negative_motion_sign_bits() {
        let mut mouse = Mouse::new(100_000);
        mouse.receive(0xE8);
        mouse.receive(0x00);
        mouse.receive(0xF0);
        let _ = drain(&mut mouse);
        mouse.movement(-2, -3);
        mouse.receive(0xEB);
        let bytes = drain(&mut mouse);
        assert_ne!(bytes[1] & 0x10, 0); // x sign
        assert_ne!(bytes[1] & 0x20, 0); // y sign
        assert_eq!(bytes[2], 0xFE); // -2
        assert_eq!(bytes[3], 0xFD); // -3
    }
}
