//! 8250/16450 UARTs, four channels at the PC base addresses.
//!
//! Each port carries the classic register file (THR/RBR, IER, IIR, LCR,
//! MCR, LSR, MSR, SCR plus the DLAB divisor pair), a byte pipeline whose
//! transfer time derives from the divisor (16 clocks per bit against the
//! 1.8432 MHz crystal, times the frame length), and an MCR loopback mode
//! that short-circuits TX to RX. Four interrupt causes are tracked per
//! port; IIR reports them in the fixed priority RLS > RX > THRE > MSR.

use bitflags::bitflags;

use crate::fifo::Fifo;

/// UART crystal in Hz.
const UART_CLOCK: u64 = 1_843_200;

/// Channel base addresses in PC order (COM1..COM4).
pub const UART_BASES: [u16; 4] = [0x3F8, 0x2F8, 0x3E8, 0x2E8];

/// IRQ line per channel (COM1/3 share 4, COM2/4 share 3).
pub const UART_IRQS: [u8; 4] = [4, 3, 4, 3];

bitflags! {
    /// Interrupt-enable register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ier: u8 {
        const RX_AVAIL = 1 << 0;
        const THRE = 1 << 1;
        const RX_LINE_STATUS = 1 << 2;
        const MODEM_STATUS = 1 << 3;
    }
}

bitflags! {
    /// Line-status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Lsr: u8 {
        const DATA_READY = 1 << 0;
        const OVERRUN = 1 << 1;
        const PARITY_ERROR = 1 << 2;
        const FRAMING_ERROR = 1 << 3;
        const BREAK = 1 << 4;
        const THRE = 1 << 5;
        const TRANSMITTER_EMPTY = 1 << 6;
    }
}

/// Interrupt causes in priority order (index 0 highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    ReceiverLineStatus = 0,
    RxAvailable = 1,
    ThrEmpty = 2,
    ModemStatus = 3,
}

/// One serial channel.
pub struct UartPort {
    /// Received bytes waiting for the guest
    rx_queue: Fifo,
    /// Bytes the guest transmitted, for host consumption
    pub tx_output: Fifo,
    /// Transmit holding register
    thr: Option<u8>,
    /// Byte currently on the wire and its remaining ns
    shifting: Option<(u8, u64)>,
    ier: Ier,
    lcr: u8,
    mcr: u8,
    lsr: Lsr,
    msr: u8,
    scratch: u8,
    divisor: u16,
    /// Latched interrupt causes; `interrupt_causes[cause]`
    interrupt_causes: [bool; 4],
}

impl UartPort {
    fn new() -> Self {
        Self {
            rx_queue: Fifo::new(16),
            tx_output: Fifo::new(64),
            thr: None,
            shifting: None,
            ier: Ier::empty(),
            lcr: 0,
            mcr: 0,
            lsr: Lsr::THRE | Lsr::TRANSMITTER_EMPTY,
            msr: 0,
            scratch: 0,
            divisor: 1,
            interrupt_causes: [false; 4],
        }
    }

    #[inline]
    fn dlab(&self) -> bool {
        self.lcr & 0x80 != 0
    }

    #[inline]
    fn loopback(&self) -> bool {
        self.mcr & 0x10 != 0
    }

    /// Frame length in bit times for the current LCR.
    fn frame_bits(&self) -> u64 {
        let data = 5 + (self.lcr & 3) as u64;
        let stop = if self.lcr & 0x04 != 0 { 2 } else { 1 };
        let parity = if self.lcr & 0x08 != 0 { 1 } else { 0 };
        1 + data + parity + stop
    }

    /// Nanoseconds to move one byte: divisor x 16 clocks per bit.
    fn byte_time_ns(&self) -> u64 {
        let bit_clocks = self.divisor.max(1) as u64 * 16;
        bit_clocks * self.frame_bits() * 1_000_000_000 / UART_CLOCK
    }

    fn raise_cause(&mut self, cause: Cause) {
        let enabled = match cause {
            Cause::ReceiverLineStatus => self.ier.contains(Ier::RX_LINE_STATUS),
            Cause::RxAvailable => self.ier.contains(Ier::RX_AVAIL),
            Cause::ThrEmpty => self.ier.contains(Ier::THRE),
            Cause::ModemStatus => self.ier.contains(Ier::MODEM_STATUS),
        };
        if enabled {
            self.interrupt_causes[cause as usize] = true;
        }
    }

    /// Any cause pending (drives the IRQ line level)?
    pub fn irq_pending(&self) -> bool {
        self.interrupt_causes.iter().any(|&c| c)
    }

    /// Feed a received byte into the channel (host side or loopback).
    pub fn receive_byte(&mut self, byte: u8) {
        if !self.rx_queue.push(byte) {
            self.lsr.insert(Lsr::OVERRUN);
            self.raise_cause(Cause::ReceiverLineStatus);
            return;
        }
        self.lsr.insert(Lsr::DATA_READY);
        self.raise_cause(Cause::RxAvailable);
    }

    /// Register read at `offset` (0-7).
    pub fn read(&mut self, offset: u16) -> u8 {
        match offset {
            0 => {
                if self.dlab() {
                    return (self.divisor & 0xFF) as u8;
                }
                let value = self.rx_queue.pop().unwrap_or(0);
                if self.rx_queue.is_empty() {
                    self.lsr.remove(Lsr::DATA_READY);
                    self.interrupt_causes[Cause::RxAvailable as usize] = false;
                }
                value
            }
            1 => {
                if self.dlab() {
                    (self.divisor >> 8) as u8
                } else {
                    self.ier.bits()
                }
            }
            2 => {
                // IIR: highest-priority pending cause; reading clears THRE.
                let value = if self.interrupt_causes[Cause::ReceiverLineStatus as usize] {
                    0x06
                } else if self.interrupt_causes[Cause::RxAvailable as usize] {
                    0x04
                } else if self.interrupt_causes[Cause::ThrEmpty as usize] {
                    self.interrupt_causes[Cause::ThrEmpty as usize] = false;
                    0x02
                } else if self.interrupt_causes[Cause::ModemStatus as usize] {
                    0x00
                } else {
                    0x01
                };
                value
            }
            3 => self.lcr,
            4 => self.mcr,
            5 => {
                let value = self.lsr.bits();
                // Error bits clear on read.
                self.lsr
                    .remove(Lsr::OVERRUN | Lsr::PARITY_ERROR | Lsr::FRAMING_ERROR | Lsr::BREAK);
                self.interrupt_causes[Cause::ReceiverLineStatus as usize] = false;
                value
            }
            6 => {
                let value = self.msr;
                // Delta bits clear on read.
                self.msr &= 0xF0;
                self.interrupt_causes[Cause::ModemStatus as usize] = false;
                value
            }
            _ => self.scratch,
        }
    }

    /// Register write at `offset` (0-7).
    pub fn write(&mut self, offset: u16, value: u8) {
        match offset {
            0 => {
                if self.dlab() {
                    self.divisor = (self.divisor & 0xFF00) | value as u16;
                    return;
                }
                self.thr = Some(value);
                self.lsr.remove(Lsr::THRE | Lsr::TRANSMITTER_EMPTY);
                self.interrupt_causes[Cause::ThrEmpty as usize] = false;
            }
            1 => {
                if self.dlab() {
                    self.divisor = (self.divisor & 0x00FF) | (value as u16) << 8;
                    return;
                }
                let old = self.ier;
                self.ier = Ier::from_bits_truncate(value & 0x0F);
                // Enabling THRE with an empty holding register re-arms the
                // interrupt immediately.
                if !old.contains(Ier::THRE)
                    && self.ier.contains(Ier::THRE)
                    && self.lsr.contains(Lsr::THRE)
                {
                    self.raise_cause(Cause::ThrEmpty);
                }
            }
            2 => {} // no FIFO control on a 16450
            3 => self.lcr = value,
            4 => {
                let entering_loopback = value & 0x10 != 0 && !self.loopback();
                let leaving_loopback = value & 0x10 == 0 && self.loopback();
                self.mcr = value & 0x1F;
                if entering_loopback || leaving_loopback {
                    // A transfer in flight is torn down by the mode flip.
                    self.shifting = None;
                }
                if self.loopback() {
                    self.update_loopback_msr();
                }
            }
            5 => {} // LSR is read-only
            6 => {} // MSR is read-only
            _ => self.scratch = value,
        }
    }

    /// In loopback mode the modem outputs fold back into MSR inputs.
    fn update_loopback_msr(&mut self) {
        let old = self.msr;
        let mut lines = 0u8;
        if self.mcr & 0x01 != 0 {
            lines |= 0x20; // DTR -> DSR
        }
        if self.mcr & 0x02 != 0 {
            lines |= 0x10; // RTS -> CTS
        }
        if self.mcr & 0x04 != 0 {
            lines |= 0x40; // OUT1 -> RI
        }
        if self.mcr & 0x08 != 0 {
            lines |= 0x80; // OUT2 -> DCD
        }
        let deltas = ((old ^ lines) >> 4) & 0x0F;
        self.msr = lines | deltas;
        if deltas != 0 {
            self.raise_cause(Cause::ModemStatus);
        }
    }

    /// Advance the byte pipeline.
    pub fn tick_ns(&mut self, ns: u64) {
        let mut remaining = ns;
        while remaining > 0 {
            if let Some((byte, left)) = self.shifting {
                if left > remaining {
                    self.shifting = Some((byte, left - remaining));
                    break;
                }
                remaining -= left;
                self.shifting = None;
                if self.loopback() {
                    self.receive_byte(byte);
                } else {
                    self.tx_output.push(byte);
                }
                if self.thr.is_none() {
                    self.lsr.insert(Lsr::TRANSMITTER_EMPTY);
                }
            } else {
                match self.thr.take() {
                    Some(byte) => {
                        self.shifting = Some((byte, self.byte_time_ns().max(1)));
                        self.lsr.insert(Lsr::THRE);
                        self.raise_cause(Cause::ThrEmpty);
                    }
                    None => break,
                }
            }
        }
    }
}

/// All four channels.
pub struct UartBank {
    pub ports: [UartPort; 4],
}

impl UartBank {
    pub fn new() -> Self {
        Self {
            ports: std::array::from_fn(|_| UartPort::new()),
        }
    }

    /// Map an I/O port to (channel, register offset).
    pub fn decode(port: u16) -> Option<(usize, u16)> {
        UART_BASES
            .iter()
            .position(|&base| (base..base + 8).contains(&port))
            .map(|index| (index, port - UART_BASES[index]))
    }

    pub fn io_read(&mut self, port: u16) -> Option<u8> {
        let (index, offset) = Self::decode(port)?;
        Some(self.ports[index].read(offset))
    }

    pub fn io_write(&mut self, port: u16, value: u8) -> bool {
        match Self::decode(port) {
            Some((index, offset)) => {
                self.ports[index].write(offset, value);
                true
            }
            None => false,
        }
    }

    /// Advance all channels; returns the per-channel IRQ levels.
    pub fn tick_ns(&mut self, ns: u64) -> [bool; 4] {
        let mut levels = [false; 4];
        for (i, port) in self.ports.iter_mut().enumerate() {
            port.tick_ns(ns);
            levels[i] = port.irq_pending();
        }
        levels
    }

    pub fn reset(&mut self) {
        self.ports = std::array::from_fn(|_| UartPort::new());
    }
}

impl Default for UartBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Program a divisor with DLAB gymnastics.
    fn set_divisor(port: &mut UartPort, divisor: u16) {
        port.write(3, 0x83); // DLAB + 8N1
        port.write(0, (divisor & 0xFF) as u8);
        port.write(1, (divisor >> 8) as u8);
        port.write(3, 0x03); // clear DLAB
    }

    #[test]
    fn test_decode_bases() {
        assert_eq!(UartBank::decode(0x3F8), Some((0, 0)));
        assert_eq!(UartBank::decode(0x3FD), Some((0, 5)));
        assert_eq!(UartBank::decode(0x2F8), Some((1, 0)));
        assert_eq!(UartBank::decode(0x3E8), Some((2, 0)));
        assert_eq!(UartBank::decode(0x2EF), Some((3, 7)));
        assert_eq!(UartBank::decode(0x400), None);
    }

    #[test]
    fn test_divisor_readback() {
        let mut port = UartPort::new();
        set_divisor(&mut port, 12); // 9600 baud
        port.write(3, 0x83);
        assert_eq!(port.read(0), 12);
        assert_eq!(port.read(1), 0);
    }

    #[test]
    fn test_transmit_timing() {
        let mut port = UartPort::new();
        set_divisor(&mut port, 12); // 9600 baud, 10-bit frame
        port.write(0, 0x41);
        // The byte moves THR -> shift immediately on the first tick.
        port.tick_ns(1);
        assert!(port.lsr.contains(Lsr::THRE));
        assert!(port.tx_output.is_empty());
        // One frame at 9600 baud is ~1.0417 ms.
        port.tick_ns(1_050_000);
        assert_eq!(port.tx_output.pop(), Some(0x41));
    }

    #[test]
    fn test_rx_data_ready() {
        let mut port = UartPort::new();
        port.receive_byte(0x55);
        assert!(port.lsr.contains(Lsr::DATA_READY));
        assert_eq!(port.read(0), 0x55);
        assert!(!port.lsr.contains(Lsr::DATA_READY));
    }

    #[test]
    fn test_rx_interrupt_priority() {
        let mut port = UartPort::new();
        port.write(1, 0x0F); // all interrupt enables
        port.receive_byte(0x01);
        // RX pending: IIR reports 0x04.
        assert_eq!(port.read(2), 0x04);
        // Overrun outranks RX.
        for _ in 0..20 {
            port.receive_byte(0xEE);
        }
        assert_eq!(port.read(2), 0x06);
        // LSR read clears the line-status cause.
        let _ = port.read(5);
        assert_eq!(port.read(2), 0x04);
    }

    #[test]
    fn test_thre_interrupt_on_ier_write() {
        let mut port = UartPort::new();
        assert!(!port.irq_pending());
        // Enabling THRE with an empty THR raises the cause at once.
        port.write(1, 0x02);
        assert!(port.irq_pending());
        assert_eq!(port.read(2), 0x02);
        // IIR read cleared it.
        assert_eq!(port.read(2), 0x01);
    }

    #[test]
    fn test_loopback_round_trip() {
        let mut port = UartPort::new();
        set_divisor(&mut port, 1);
        port.write(4, 0x10); // loopback
        port.write(0, 0xA5);
        port.tick_ns(1_000_000);
        assert!(port.lsr.contains(Lsr::DATA_READY));
        assert_eq!(port.read(0), 0xA5);
        assert!(port.tx_output.is_empty());
    }

    #[test]
    fn test_loopback_modem_status() {
        let mut port = UartPort::new();
        port.write(1, 0x08); // modem-status interrupt
        port.write(4, 0x10 | 0x01); // loopback + DTR
        assert!(port.msr & 0x20 != 0); // DSR mirrors DTR
        assert!(port.irq_pending());
        let _ = port.read(6);
        assert!(!port.irq_pending());
    }

    #[test]
    fn test_scratch_register() {
        let mut port = UartPort::new();
        port.write(7, 0x5A);
        assert_eq!(port.read(7), 0x5A);
    }
}
