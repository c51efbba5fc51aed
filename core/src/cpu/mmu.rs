//! CPU-facing memory access: segmentation, alignment, paging, then the bus.
//!
//! Every access runs the check order the silicon uses:
//! 1. segment level: bounds against the precalculated limit/roof and the
//!    rights-decision table (#GP / #SS / #NP),
//! 2. alignment: #AC when CPL 3, CR0.AM and EFLAGS.AC agree and the access
//!    straddles its natural boundary,
//! 3. paging: TLB/table walk per byte (#PF on the exact failing byte).
//!
//! Multi-byte accesses are decomposed into per-byte checks first and only
//! then performed, so a dword crossing into a not-present page faults
//! before any byte of it is written.

use super::descriptor::{AccessKind, RIGHTS_FAULT, RIGHTS_NP, RIGHTS_OK};
use super::interrupts::{Fault, EXC_AC, EXC_GP, EXC_NP, EXC_SS};
use super::registers::{CpuMode, SegReg, CR0_AM};
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::cpu::flags;

/// How an access names its segment. Mirrors the special segdesc selector
/// values of the original interface: a real segment register, a raw
/// segment value used as `value << 4`, no segmentation, an ES-literal that
/// ignores overrides (string destinations), direct linear with paging, and
/// direct linear bypassing paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemSeg {
    /// Through the descriptor cache of this register
    Desc(SegReg),
    /// Real-mode convenience: base = raw << 4, no checks
    Raw(u16),
    /// Offset is already linear; paging applies
    Linear,
    /// ES exactly, segment overrides do not apply (string stores)
    EsLiteral,
    /// Offset is physical; paging bypassed (descriptor table walks in
    /// LOADALL, debug accessors)
    LinearUnpaged,
}

impl Cpu {
    // ========== Public read/write entry points ==========

    /// Read a byte through `seg`.
    pub fn mmu_rb(
        &mut self,
        bus: &mut Bus,
        seg: MemSeg,
        offset: u32,
        opcode_fetch: bool,
        addr16: bool,
    ) -> ExecResult<u8> {
        let mut phys = [0u32; 4];
        self.mem_check(bus, seg, offset, 1, read_kind(opcode_fetch), addr16, &mut phys)?;
        if opcode_fetch {
            bus.prefetch_note_fetch(self.index, phys[0]);
        }
        Ok(self.biu_read(bus, &phys[..1]) as u8)
    }

    /// Read a word through `seg`.
    pub fn mmu_rw(
        &mut self,
        bus: &mut Bus,
        seg: MemSeg,
        offset: u32,
        opcode_fetch: bool,
        addr16: bool,
    ) -> ExecResult<u16> {
        let mut phys = [0u32; 4];
        self.mem_check(bus, seg, offset, 2, read_kind(opcode_fetch), addr16, &mut phys)?;
        Ok(self.biu_read(bus, &phys[..2]) as u16)
    }

    /// Read a dword through `seg`.
    pub fn mmu_rdw(
        &mut self,
        bus: &mut Bus,
        seg: MemSeg,
        offset: u32,
        opcode_fetch: bool,
        addr16: bool,
    ) -> ExecResult<u32> {
        let mut phys = [0u32; 4];
        self.mem_check(bus, seg, offset, 4, read_kind(opcode_fetch), addr16, &mut phys)?;
        Ok(self.biu_read(bus, &phys[..4]))
    }

    /// Write a byte through `seg`.
    pub fn mmu_wb(
        &mut self,
        bus: &mut Bus,
        seg: MemSeg,
        offset: u32,
        value: u8,
        addr16: bool,
    ) -> ExecResult<()> {
        let mut phys = [0u32; 4];
        self.mem_check(bus, seg, offset, 1, AccessKind::Write, addr16, &mut phys)?;
        self.biu_write(bus, &phys[..1], value as u32);
        Ok(())
    }

    /// Write a word through `seg`.
    pub fn mmu_ww(
        &mut self,
        bus: &mut Bus,
        seg: MemSeg,
        offset: u32,
        value: u16,
        addr16: bool,
    ) -> ExecResult<()> {
        let mut phys = [0u32; 4];
        self.mem_check(bus, seg, offset, 2, AccessKind::Write, addr16, &mut phys)?;
        self.biu_write(bus, &phys[..2], value as u32);
        Ok(())
    }

    /// Write a dword through `seg`.
    pub fn mmu_wdw(
        &mut self,
        bus: &mut Bus,
        seg: MemSeg,
        offset: u32,
        value: u32,
        addr16: bool,
    ) -> ExecResult<()> {
        let mut phys = [0u32; 4];
        self.mem_check(bus, seg, offset, 4, AccessKind::Write, addr16, &mut phys)?;
        self.biu_write(bus, &phys[..4], value);
        Ok(())
    }

    /// Linear-space byte read (descriptor tables, TSS fields, IDT).
    pub fn linear_read_byte(&mut self, bus: &mut Bus, linear: u32) -> ExecResult<u8> {
        self.mmu_rb(bus, MemSeg::Linear, linear, false, false)
    }

    /// Linear-space byte write.
    pub fn linear_write_byte(&mut self, bus: &mut Bus, linear: u32, value: u8) -> ExecResult<()> {
        self.mmu_wb(bus, MemSeg::Linear, linear, value, false)
    }

    /// Linear-space word read.
    pub fn linear_read_word(&mut self, bus: &mut Bus, linear: u32) -> ExecResult<u16> {
        self.mmu_rw(bus, MemSeg::Linear, linear, false, false)
    }

    /// Linear-space dword read.
    pub fn linear_read_dword(&mut self, bus: &mut Bus, linear: u32) -> ExecResult<u32> {
        self.mmu_rdw(bus, MemSeg::Linear, linear, false, false)
    }

    /// Linear-space word write.
    pub fn linear_write_word(&mut self, bus: &mut Bus, linear: u32, value: u16) -> ExecResult<()> {
        self.mmu_ww(bus, MemSeg::Linear, linear, value, false)
    }

    /// Linear-space dword write.
    pub fn linear_write_dword(&mut self, bus: &mut Bus, linear: u32, value: u32) -> ExecResult<()> {
        self.mmu_wdw(bus, MemSeg::Linear, linear, value, false)
    }

    // ========== Check pipeline ==========

    /// Run the segment/alignment/paging checks for an access, producing
    /// the physical address of every byte. Nothing is read or written.
    fn mem_check(
        &mut self,
        bus: &mut Bus,
        seg: MemSeg,
        offset: u32,
        len: u32,
        kind: AccessKind,
        addr16: bool,
        phys: &mut [u32; 4],
    ) -> ExecResult<()> {
        let mask = if addr16 { 0xFFFF } else { 0xFFFF_FFFF };
        let offset = offset & mask;

        // 1. Segment level.
        let (base, paged) = match seg {
            MemSeg::Desc(seg_reg) => {
                self.segment_check(seg_reg, offset, len, kind)?;
                (self.descriptors[seg_reg as usize].base, true)
            }
            MemSeg::EsLiteral => {
                self.segment_check(SegReg::Es, offset, len, kind)?;
                (self.descriptors[SegReg::Es as usize].base, true)
            }
            MemSeg::Raw(value) => ((value as u32) << 4, true),
            MemSeg::Linear => (0, true),
            MemSeg::LinearUnpaged => (0, false),
        };

        // 2. Alignment.
        if self.alignment_check_active() && len > 1 && offset & (len - 1) != 0 {
            return Err(Fault::with_code(EXC_AC, 0));
        }

        // 3. Paging, byte by byte: a misaligned access faults on the exact
        // byte whose page is bad, with nothing committed.
        let user = self.cpl == 3;
        for i in 0..len {
            let linear = base.wrapping_add((offset.wrapping_add(i)) & mask);
            phys[i as usize] = if paged {
                self.translate(bus, linear, kind, user)?
            } else {
                linear
            };
        }
        Ok(())
    }

    /// Segment-level bounds and rights for an access through `seg`.
    fn segment_check(
        &self,
        seg: SegReg,
        offset: u32,
        len: u32,
        kind: AccessKind,
    ) -> ExecResult<()> {
        let desc = &self.descriptors[seg as usize];
        let opsize = match len {
            1 => 0u8,
            2 => 1,
            _ => 2,
        };
        let verdict = desc.rights_verdict(kind, self.cpl, self.alignment_check_active(), opsize);
        if verdict != RIGHTS_OK {
            let vector = match (verdict, seg) {
                (RIGHTS_NP, SegReg::Ss) => EXC_SS,
                (RIGHTS_NP, _) => EXC_NP,
                (RIGHTS_FAULT, SegReg::Ss) => EXC_SS,
                _ => EXC_GP,
            };
            return Err(Fault::with_code(vector, 0));
        }
        if !desc.limit_check(offset, len) {
            let vector = if seg == SegReg::Ss { EXC_SS } else { EXC_GP };
            return Err(Fault::with_code(vector, 0));
        }
        Ok(())
    }

    /// Alignment checking is live when CPL 3, CR0.AM and EFLAGS.AC.
    #[inline]
    pub fn alignment_check_active(&self) -> bool {
        self.cpl == 3
            && self.regs.cr[0] & CR0_AM != 0
            && self.regs.eflags & flags::AC != 0
    }

    // ========== BIU transactions ==========

    /// Read checked bytes through the BIU. Contiguous runs go out as one
    /// transaction; a page-split access issues one per byte.
    fn biu_read(&mut self, bus: &mut Bus, phys: &[u32]) -> u32 {
        if contiguous(phys) {
            return self.biu_txn_read(bus, phys[0], phys.len() as u8);
        }
        let mut value = 0u32;
        for (i, &addr) in phys.iter().enumerate() {
            value |= self.biu_txn_read(bus, addr, 1) << (8 * i);
        }
        value
    }

    /// Write checked bytes through the BIU.
    fn biu_write(&mut self, bus: &mut Bus, phys: &[u32], value: u32) {
        if contiguous(phys) {
            self.biu_txn_write(bus, phys[0], phys.len() as u8, value);
            return;
        }
        for (i, &addr) in phys.iter().enumerate() {
            self.biu_txn_write(bus, addr, 1, (value >> (8 * i)) & 0xFF);
        }
    }

    fn biu_txn_read(&mut self, bus: &mut Bus, addr: u32, width: u8) -> u32 {
        while !bus.request_mem_read(self.index, addr, width) {
            // Pipeline full: drain the stale slot and retry next cycle.
            bus.service(self.index);
            let _ = bus.response(self.index);
        }
        bus.service(self.index);
        self.cycles.stall_biu += bus.take_stall_cycles(self.index);
        bus.response(self.index).unwrap_or(0)
    }

    fn biu_txn_write(&mut self, bus: &mut Bus, addr: u32, width: u8, value: u32) {
        while !bus.request_mem_write(self.index, addr, width, value) {
            bus.service(self.index);
            let _ = bus.response(self.index);
        }
        bus.service(self.index);
        self.cycles.stall_biu += bus.take_stall_cycles(self.index);
        let _ = bus.response(self.index);
    }

    // ========== I/O ==========

    /// IN: read `width` bytes from an I/O port, with permission checks.
    pub fn io_read(&mut self, bus: &mut Bus, port: u16, width: u8) -> ExecResult<u32> {
        self.check_io_permission(bus, port, width)?;
        while !bus.request_io_read(self.index, port, width) {
            bus.service(self.index);
            let _ = bus.response(self.index);
        }
        bus.service(self.index);
        Ok(bus.response(self.index).unwrap_or(0))
    }

    /// OUT: write `width` bytes to an I/O port, with permission checks.
    pub fn io_write(&mut self, bus: &mut Bus, port: u16, width: u8, value: u32) -> ExecResult<()> {
        self.check_io_permission(bus, port, width)?;
        while !bus.request_io_write(self.index, port, width, value) {
            bus.service(self.index);
            let _ = bus.response(self.index);
        }
        bus.service(self.index);
        let _ = bus.response(self.index);
        Ok(())
    }

    /// I/O permission: free in real mode; protected mode compares CPL to
    /// IOPL and falls back to the TSS I/O bitmap; V86 always consults the
    /// bitmap.
    fn check_io_permission(&mut self, bus: &mut Bus, port: u16, width: u8) -> ExecResult<()> {
        match self.mode {
            CpuMode::Real => Ok(()),
            CpuMode::Protected if self.cpl <= self.regs.iopl() => Ok(()),
            _ => self.check_io_bitmap(bus, port, width),
        }
    }

    /// Bit-test `width` consecutive port bits in the TSS I/O bitmap.
    fn check_io_bitmap(&mut self, bus: &mut Bus, port: u16, width: u8) -> ExecResult<()> {
        let tss = &self.descriptors[SegReg::Tr as usize];
        // Only a 32-bit TSS carries an I/O map.
        if !matches!(tss.type_field(), 0x9 | 0xB) {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let tss_base = tss.base;
        let tss_limit = tss.limit;
        let iomap_base = self.linear_read_word(bus, tss_base.wrapping_add(0x66))? as u32;
        for i in 0..width as u32 {
            let bit = port as u32 + i;
            let byte_off = iomap_base + bit / 8;
            if byte_off > tss_limit {
                return Err(Fault::with_code(EXC_GP, 0));
            }
            let map = self.linear_read_byte(bus, tss_base.wrapping_add(byte_off))?;
            if map >> (bit % 8) & 1 != 0 {
                return Err(Fault::with_code(EXC_GP, 0));
            }
        }
        Ok(())
    }
}

#[inline]
fn read_kind(opcode_fetch: bool) -> AccessKind {
    if opcode_fetch {
        AccessKind::Execute
    } else {
        AccessKind::Read
    }
}

/// Are the checked byte addresses one contiguous physical run?
fn contiguous(phys: &[u32]) -> bool {
    phys.windows(2).all(|w| w[1] == w[0].wrapping_add(1))
}
