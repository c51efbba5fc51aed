//! Bus Interface Unit: all memory and I/O traffic goes through here.
//!
//! Every CPU access is a two-step dialog: issue a request (which fails when
//! the single transaction slot is full or another master holds the bus
//! lock), then collect the response. Requests from one CPU complete in FIFO
//! order because only one may be outstanding at a time.
//!
//! The prefetch queue models the speculative code reads the real BIU issues
//! while the external bus is idle. It is transparent to correctness; hits
//! and misses only change cycle accounting. Branches flush it.

use crate::config::MachineConfig;
use crate::memory::Memory;
use crate::peripherals::Devices;

/// Simple LFSR used for bus-lock arbitration between contending masters.
/// Seedable so multi-CPU tests stay deterministic.
struct BusRng {
    state: [u8; 3],
}

impl BusRng {
    fn new() -> Self {
        Self {
            state: [0x9A, 0x59, 0xC6],
        }
    }

    fn seed(&mut self, s1: u8, s2: u8, s3: u8) {
        self.state = [s1, s2, s3];
    }

    fn next(&mut self) -> u8 {
        let bit = ((self.state[0] >> 7)
            ^ (self.state[0] >> 5)
            ^ (self.state[0] >> 4)
            ^ (self.state[0] >> 3))
            & 1;
        let result = self.state[0];
        self.state[0] = (self.state[0] << 1) | ((self.state[1] >> 7) & 1);
        self.state[1] = (self.state[1] << 1) | ((self.state[2] >> 7) & 1);
        self.state[2] = (self.state[2] << 1) | bit;
        result
    }
}

/// What a pending transaction does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionKind {
    MemRead,
    MemWrite,
    IoRead,
    IoWrite,
}

/// One in-flight bus transaction.
#[derive(Debug, Clone, Copy)]
struct Transaction {
    kind: TransactionKind,
    addr: u32,
    /// Access width in bytes: 1, 2 or 4
    width: u8,
    /// Write data (ignored for reads)
    value: u32,
}

/// Prefetch queue state for one CPU.
///
/// Tracks the linear address the queue front corresponds to and how many
/// bytes are buffered. `note_fetch` reports whether the fetch hit the
/// queue; misses flush it.
#[derive(Debug, Clone)]
struct PrefetchQueue {
    depth: usize,
    next_linear: u32,
    level: usize,
}

impl PrefetchQueue {
    fn new(depth: usize) -> Self {
        Self {
            depth,
            next_linear: 0,
            level: 0,
        }
    }

    fn flush(&mut self, new_linear: u32) {
        self.next_linear = new_linear;
        self.level = 0;
    }

    /// Consume one code byte at `linear`. Returns true on a queue hit.
    fn note_fetch(&mut self, linear: u32) -> bool {
        if self.level > 0 && linear == self.next_linear {
            self.level -= 1;
            self.next_linear = self.next_linear.wrapping_add(1);
            true
        } else {
            self.flush(linear.wrapping_add(1));
            false
        }
    }

    /// Speculatively buffer up to `count` bytes while the bus is idle.
    fn idle_fill(&mut self, count: usize) -> usize {
        let free = self.depth - self.level;
        let added = free.min(count);
        self.level += added;
        added
    }
}

/// Per-CPU BIU state: the transaction slot, its response, and prefetch.
struct BiuPort {
    pending: Option<Transaction>,
    response: Option<u32>,
    prefetch: PrefetchQueue,
    /// Cycles spent stalled waiting for the bus lock
    stall_cycles: u64,
    /// Cycles spent on prefetch bus activity
    prefetch_cycles: u64,
}

impl BiuPort {
    fn new(prefetch_depth: usize) -> Self {
        Self {
            pending: None,
            response: None,
            prefetch: PrefetchQueue::new(prefetch_depth),
            stall_cycles: 0,
            prefetch_cycles: 0,
        }
    }
}

/// The machine bus: physical memory, I/O devices, and per-CPU BIU ports.
pub struct Bus {
    /// Physical memory behind the BIU
    pub mem: Memory,
    /// I/O devices behind the BIU
    pub devices: Devices,
    ports: Vec<BiuPort>,
    /// Which CPU currently owns the bus lock
    locked_by: Option<usize>,
    /// CPUs waiting for the lock
    lock_requested: Vec<bool>,
    rng: BusRng,
    /// Total bus cycles charged (memory wait states etc.)
    cycles: u64,
}

/// Bus cycle costs (AT-class timings).
impl Bus {
    pub const MEM_CYCLES: u64 = 4;
    pub const IO_CYCLES: u64 = 6;
    const PREFETCH_CYCLES_PER_BYTE: u64 = 4;
}

impl Bus {
    /// Build the bus for `config` with fresh memory and devices.
    pub fn new(config: &MachineConfig) -> Self {
        let cpu_count = config.cpu_count as usize;
        Self {
            mem: Memory::new(config.memory_kb),
            devices: Devices::new(config),
            ports: (0..cpu_count)
                .map(|_| BiuPort::new(config.prefetch_depth()))
                .collect(),
            locked_by: None,
            lock_requested: vec![false; cpu_count],
            rng: BusRng::new(),
            cycles: 0,
        }
    }

    /// Number of BIU ports (CPUs) on this bus.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    // ========== Lock arbitration ==========

    /// May `cpu` drive a transaction right now?
    pub fn ready(&self, cpu: usize) -> bool {
        match self.locked_by {
            Some(owner) => owner == cpu,
            None => true,
        }
    }

    /// Record that `cpu` wants the bus lock (LOCK prefix, XCHG with memory).
    pub fn request_lock(&mut self, cpu: usize) {
        if self.locked_by != Some(cpu) {
            self.lock_requested[cpu] = true;
        }
    }

    /// Any lock requests waiting for a grant?
    pub fn lock_requests_pending(&self) -> bool {
        self.lock_requested.iter().any(|&r| r)
    }

    /// Release the lock held by `cpu`, if any.
    pub fn release_lock(&mut self, cpu: usize) {
        if self.locked_by == Some(cpu) {
            self.locked_by = None;
        }
    }

    /// Does `cpu` currently hold the lock?
    pub fn holds_lock(&self, cpu: usize) -> bool {
        self.locked_by == Some(cpu)
    }

    /// Grant the lock to one pending requester, chosen uniformly at random
    /// among contenders. Called by the outer loop when the bus is free.
    pub fn service_lock_requests(&mut self) {
        if self.locked_by.is_some() {
            return;
        }
        let contenders: Vec<usize> = self
            .lock_requested
            .iter()
            .enumerate()
            .filter_map(|(i, &req)| req.then_some(i))
            .collect();
        if contenders.is_empty() {
            return;
        }
        let winner = contenders[self.rng.next() as usize % contenders.len()];
        self.lock_requested[winner] = false;
        self.locked_by = Some(winner);
    }

    /// Seed the arbitration generator (deterministic tests).
    pub fn seed_rng(&mut self, s1: u8, s2: u8, s3: u8) {
        self.rng.seed(s1, s2, s3);
    }

    // ========== Request / response ==========

    fn request(&mut self, cpu: usize, txn: Transaction) -> bool {
        if !self.ready(cpu) || self.ports[cpu].pending.is_some() {
            self.ports[cpu].stall_cycles += 1;
            return false;
        }
        self.ports[cpu].pending = Some(txn);
        true
    }

    /// Request a physical memory read of `width` bytes at `addr`.
    pub fn request_mem_read(&mut self, cpu: usize, addr: u32, width: u8) -> bool {
        self.request(
            cpu,
            Transaction {
                kind: TransactionKind::MemRead,
                addr,
                width,
                value: 0,
            },
        )
    }

    /// Request a physical memory write of `width` bytes at `addr`.
    pub fn request_mem_write(&mut self, cpu: usize, addr: u32, width: u8, value: u32) -> bool {
        self.request(
            cpu,
            Transaction {
                kind: TransactionKind::MemWrite,
                addr,
                width,
                value,
            },
        )
    }

    /// Request an I/O port read of `width` bytes.
    pub fn request_io_read(&mut self, cpu: usize, port: u16, width: u8) -> bool {
        self.request(
            cpu,
            Transaction {
                kind: TransactionKind::IoRead,
                addr: port as u32,
                width,
                value: 0,
            },
        )
    }

    /// Request an I/O port write of `width` bytes.
    pub fn request_io_write(&mut self, cpu: usize, port: u16, width: u8, value: u32) -> bool {
        self.request(
            cpu,
            Transaction {
                kind: TransactionKind::IoWrite,
                addr: port as u32,
                width,
                value,
            },
        )
    }

    /// Execute `cpu`'s pending transaction, making its response available.
    pub fn service(&mut self, cpu: usize) {
        let Some(txn) = self.ports[cpu].pending.take() else {
            return;
        };
        let width = txn.width as u32;
        let result = match txn.kind {
            TransactionKind::MemRead => {
                self.cycles += Self::MEM_CYCLES;
                let mut value: u32 = 0;
                for i in 0..width {
                    value |= (self.mem.read_byte(txn.addr.wrapping_add(i)) as u32) << (8 * i);
                }
                value
            }
            TransactionKind::MemWrite => {
                self.cycles += Self::MEM_CYCLES;
                for i in 0..width {
                    self.mem
                        .write_byte(txn.addr.wrapping_add(i), (txn.value >> (8 * i)) as u8);
                }
                0
            }
            TransactionKind::IoRead => {
                self.cycles += Self::IO_CYCLES;
                let mut value: u32 = 0;
                for i in 0..width {
                    let port = (txn.addr as u16).wrapping_add(i as u16);
                    value |= (self.devices.io_read8(port, &mut self.mem) as u32) << (8 * i);
                }
                value
            }
            TransactionKind::IoWrite => {
                self.cycles += Self::IO_CYCLES;
                for i in 0..width {
                    let port = (txn.addr as u16).wrapping_add(i as u16);
                    self.devices
                        .io_write8(port, (txn.value >> (8 * i)) as u8, &mut self.mem);
                }
                0
            }
        };
        self.ports[cpu].response = Some(result);
    }

    /// Collect the response for `cpu`'s last serviced transaction.
    pub fn response(&mut self, cpu: usize) -> Option<u32> {
        self.ports[cpu].response.take()
    }

    // ========== Prefetch ==========

    /// Record a code-byte fetch at `linear`; charges prefetch-miss cycles
    /// when the byte was not buffered.
    pub fn prefetch_note_fetch(&mut self, cpu: usize, linear: u32) {
        let port = &mut self.ports[cpu];
        if !port.prefetch.note_fetch(linear) {
            port.prefetch_cycles += Self::PREFETCH_CYCLES_PER_BYTE;
        }
    }

    /// Flush `cpu`'s prefetch queue (branch taken, far transfer, fault).
    pub fn prefetch_flush(&mut self, cpu: usize, new_linear: u32) {
        self.ports[cpu].prefetch.flush(new_linear);
    }

    /// Let `cpu`'s BIU fill its queue during idle bus time.
    pub fn prefetch_idle_fill(&mut self, cpu: usize, bytes: usize) {
        let added = self.ports[cpu].prefetch.idle_fill(bytes);
        self.ports[cpu].prefetch_cycles += added as u64 * Self::PREFETCH_CYCLES_PER_BYTE;
    }

    // ========== Accounting ==========

    /// Total bus cycles charged so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Drain the stall-cycle counter for `cpu`.
    pub fn take_stall_cycles(&mut self, cpu: usize) -> u64 {
        std::mem::take(&mut self.ports[cpu].stall_cycles)
    }

    /// Drain the prefetch-cycle counter for `cpu`.
    pub fn take_prefetch_cycles(&mut self, cpu: usize) -> u64 {
        std::mem::take(&mut self.ports[cpu].prefetch_cycles)
    }

    /// Reset bus state. Memory ROMs and device wiring survive; pending
    /// transactions, locks, and prefetch queues do not.
    pub fn reset(&mut self) {
        for port in &mut self.ports {
            port.pending = None;
            port.response = None;
            port.prefetch.flush(0);
            port.stall_cycles = 0;
            port.prefetch_cycles = 0;
        }
        self.locked_by = None;
        self.lock_requested.fill(false);
        self.cycles = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_bus() -> Bus {
        let config = MachineConfig {
            cpu_count: 2,
            ..MachineConfig::default()
        };
        Bus::new(&config.validate().unwrap())
    }

    #[test]
    fn test_mem_request_response() {
        let mut bus = test_bus();
        bus.mem.poke_byte(0x100, 0x34);
        bus.mem.poke_byte(0x101, 0x12);

        assert!(bus.request_mem_read(0, 0x100, 2));
        bus.service(0);
        assert_eq!(bus.response(0), Some(0x1234));
        assert_eq!(bus.response(0), None);
    }

    #[test]
    fn test_single_outstanding_transaction() {
        let mut bus = test_bus();
        assert!(bus.request_mem_read(0, 0x100, 1));
        // Second request while one is pending must fail.
        assert!(!bus.request_mem_read(0, 0x200, 1));
        bus.service(0);
        let _ = bus.response(0);
        assert!(bus.request_mem_read(0, 0x200, 1));
    }

    #[test]
    fn test_mem_write() {
        let mut bus = test_bus();
        assert!(bus.request_mem_write(0, 0x500, 4, 0xDEADBEEF));
        bus.service(0);
        assert_eq!(bus.mem.peek_byte(0x500), 0xEF);
        assert_eq!(bus.mem.peek_byte(0x503), 0xDE);
    }

    #[test]
    fn test_lock_blocks_other_cpu() {
        let mut bus = test_bus();
        bus.request_lock(0);
        bus.service_lock_requests();
        assert!(bus.holds_lock(0));
        assert!(bus.ready(0));
        assert!(!bus.ready(1));
        assert!(!bus.request_mem_read(1, 0x100, 1));

        bus.release_lock(0);
        assert!(bus.ready(1));
        assert!(bus.request_mem_read(1, 0x100, 1));
    }

    #[test]
    fn test_lock_arbitration_single_winner() {
        let mut bus = test_bus();
        bus.seed_rng(0x12, 0x34, 0x56);
        bus.request_lock(0);
        bus.request_lock(1);
        bus.service_lock_requests();
        let winner = bus.locked_by.unwrap();
        // Only one wins; the other stays queued.
        assert!(bus.lock_requested[1 - winner]);
        assert!(!bus.lock_requested[winner]);

        bus.release_lock(winner);
        bus.service_lock_requests();
        assert_eq!(bus.locked_by, Some(1 - winner));
    }

    #[test]
    fn test_stall_cycles_counted() {
        let mut bus = test_bus();
        bus.request_lock(0);
        bus.service_lock_requests();
        assert!(!bus.request_mem_read(1, 0x100, 1));
        assert!(!bus.request_mem_read(1, 0x100, 1));
        assert_eq!(bus.take_stall_cycles(1), 2);
        assert_eq!(bus.take_stall_cycles(1), 0);
    }

    #[test]
    fn test_prefetch_hit_miss() {
        let mut bus = test_bus();
        // Empty queue: first fetch misses.
        bus.prefetch_note_fetch(0, 0x1000);
        let miss = bus.take_prefetch_cycles(0);
        assert!(miss > 0);

        // Sequential fetch after idle fill hits for free.
        bus.prefetch_idle_fill(0, 4);
        let _fill = bus.take_prefetch_cycles(0);
        bus.prefetch_note_fetch(0, 0x1001);
        assert_eq!(bus.take_prefetch_cycles(0), 0);
    }

    #[test]
    fn test_prefetch_flush_on_branch() {
        let mut bus = test_bus();
        bus.prefetch_note_fetch(0, 0x1000);
        bus.prefetch_idle_fill(0, 4);
        let _ = bus.take_prefetch_cycles(0);

        // A branch flushes; the next fetch at the target misses.
        bus.prefetch_flush(0, 0x2000);
        bus.prefetch_note_fetch(0, 0x2000);
        assert!(bus.take_prefetch_cycles(0) > 0);
    }
}
