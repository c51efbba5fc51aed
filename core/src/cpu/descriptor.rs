//! Segment descriptors, the per-register descriptor cache, and the
//! protection checks that run when a segment register is written.
//!
//! Every cache entry keeps the raw 8-byte descriptor next to precalculated
//! fields: effective linear base, effective byte-granular limit, the roof
//! for top-down data segments, a top-down flag, a not-present flag, and a
//! 256-entry rights-decision table keyed on (access kind, CPL, alignment
//! bit, operand size). `Cpu::segment_written` rebuilds all of it atomically
//! so no access ever sees stale precalcs.

use super::interrupts::{Fault, EXC_GP, EXC_NP, EXC_SS};
use super::registers::{CpuMode, SegReg};
use super::{Cpu, ExecResult};
use crate::bus::Bus;

/// Memory access kinds as the rights table keys them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessKind {
    Read = 0,
    Write = 1,
    Execute = 2,
}

/// Rights-table verdicts.
pub const RIGHTS_OK: u8 = 0;
/// General protection violation (#GP, or #SS when the segment is SS)
pub const RIGHTS_FAULT: u8 = 1;
/// Segment not present (#NP, or #SS when the segment is SS)
pub const RIGHTS_NP: u8 = 2;

/// Descriptor access-rights byte accessors (bits 40-47 of the raw qword).
#[inline]
fn ar(raw: u64) -> u8 {
    (raw >> 40) as u8
}

/// One cached segment descriptor with its precalculated fields.
#[derive(Debug, Clone)]
pub struct SegmentDescriptor {
    /// Raw 8-byte descriptor as it sits in the table
    pub raw: u64,
    /// Effective linear base
    pub base: u32,
    /// Effective byte-granular limit
    pub limit: u32,
    /// Highest addressable offset for top-down segments
    pub roof: u32,
    /// Expand-down data segment
    pub topdown: bool,
    /// P bit clear
    pub notpresent: bool,
    /// Rights verdict per (kind | cpl<<2 | align<<4 | opsize<<5)
    pub rights: [u8; 256],
}

impl SegmentDescriptor {
    /// A real-mode style descriptor: base = selector << 4, 64 KB limit,
    /// everything readable/writable/executable at any CPL.
    pub fn real_mode(selector: u16) -> Self {
        let mut desc = Self {
            raw: 0x0000_93FF_0000_FFFF,
            base: (selector as u32) << 4,
            limit: 0xFFFF,
            roof: 0xFFFF,
            topdown: false,
            notpresent: false,
            rights: [RIGHTS_OK; 256],
        };
        desc.raw |= ((desc.base as u64 & 0xFF_FFFF) << 16) | ((desc.base as u64 >> 24) << 56);
        desc
    }

    /// The power-on CS descriptor: selector F000 with the base high bits
    /// set so the first fetch reads the top of the address space (386+).
    pub fn reset_cs(high_base: bool) -> Self {
        let mut desc = Self::real_mode(0xF000);
        if high_base {
            desc.base = 0xFFFF_0000;
        }
        desc
    }

    /// Decode a raw descriptor into a cache entry with fresh precalcs.
    pub fn from_raw(raw: u64) -> Self {
        let access = ar(raw);
        let base =
            ((raw >> 16) & 0xFF_FFFF) as u32 | ((((raw >> 56) & 0xFF) as u32) << 24);
        let mut limit = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xF) as u32) << 16;
        let granular = raw >> 55 & 1 != 0;
        if granular {
            limit = (limit << 12) | 0xFFF;
        }
        let big = raw >> 54 & 1 != 0;
        let s = access >> 4 & 1 != 0;
        let is_code = s && access >> 3 & 1 != 0;
        let expand_down = s && !is_code && access >> 2 & 1 != 0;
        let present = access >> 7 & 1 != 0;

        let roof = if expand_down {
            if big {
                0xFFFF_FFFF
            } else {
                0xFFFF
            }
        } else {
            limit
        };

        let mut desc = Self {
            raw,
            base,
            limit,
            roof,
            topdown: expand_down,
            notpresent: !present,
            rights: [RIGHTS_OK; 256],
        };
        desc.precalc_rights();
        desc
    }

    fn precalc_rights(&mut self) {
        let access = ar(self.raw);
        let s = access >> 4 & 1 != 0;
        let present = access >> 7 & 1 != 0;
        let dpl = access >> 5 & 3;
        let is_code = s && access >> 3 & 1 != 0;
        let code_readable = access >> 1 & 1 != 0;
        let conforming = access >> 2 & 1 != 0;
        let data_writable = access >> 1 & 1 != 0;

        for index in 0..256usize {
            let kind = (index & 3) as u8;
            let cpl = ((index >> 2) & 3) as u8;
            // Alignment bit and operand size complete the key but do not
            // change the verdict; alignment faults are decided per access.
            let verdict = if kind == 3 {
                RIGHTS_FAULT
            } else if !present {
                RIGHTS_NP
            } else if !s {
                // System segments are never accessed through the cache.
                RIGHTS_FAULT
            } else if is_code {
                match kind {
                    k if k == AccessKind::Write as u8 => RIGHTS_FAULT,
                    k if k == AccessKind::Read as u8 => {
                        if !code_readable {
                            RIGHTS_FAULT
                        } else if !conforming && cpl > dpl {
                            RIGHTS_FAULT
                        } else {
                            RIGHTS_OK
                        }
                    }
                    _ => RIGHTS_OK, // execute
                }
            } else {
                // Data segment: execute never reaches here (CS can only
                // hold code), so only privilege and writability matter.
                if cpl > dpl {
                    RIGHTS_FAULT
                } else if kind == AccessKind::Write as u8 && !data_writable {
                    RIGHTS_FAULT
                } else {
                    RIGHTS_OK
                }
            };
            self.rights[index] = verdict;
        }
    }

    // ========== Raw field accessors ==========

    /// Descriptor type field (low 4 bits of the AR byte).
    #[inline]
    pub fn type_field(&self) -> u8 {
        ar(self.raw) & 0xF
    }

    /// S bit: 1 = code/data, 0 = system.
    #[inline]
    pub fn is_code_or_data(&self) -> bool {
        ar(self.raw) >> 4 & 1 != 0
    }

    /// Descriptor privilege level.
    #[inline]
    pub fn dpl(&self) -> u8 {
        ar(self.raw) >> 5 & 3
    }

    /// P bit.
    #[inline]
    pub fn present(&self) -> bool {
        ar(self.raw) >> 7 & 1 != 0
    }

    /// Executable code segment?
    #[inline]
    pub fn is_code(&self) -> bool {
        self.is_code_or_data() && ar(self.raw) >> 3 & 1 != 0
    }

    /// Conforming code segment?
    #[inline]
    pub fn is_conforming(&self) -> bool {
        self.is_code() && ar(self.raw) >> 2 & 1 != 0
    }

    /// Writable data segment?
    #[inline]
    pub fn is_writable_data(&self) -> bool {
        self.is_code_or_data() && !self.is_code() && ar(self.raw) >> 1 & 1 != 0
    }

    /// Readable code segment?
    #[inline]
    pub fn is_readable_code(&self) -> bool {
        self.is_code() && ar(self.raw) >> 1 & 1 != 0
    }

    /// D/B bit: default operand/address size (code) or stack width (data).
    #[inline]
    pub fn is_32bit(&self) -> bool {
        self.raw >> 54 & 1 != 0
    }

    /// Rights verdict for an access.
    #[inline]
    pub fn rights_verdict(&self, kind: AccessKind, cpl: u8, align: bool, opsize: u8) -> u8 {
        let index = kind as usize
            | ((cpl as usize & 3) << 2)
            | ((align as usize) << 4)
            | ((opsize as usize & 3) << 5);
        self.rights[index]
    }

    /// Is `offset..offset+len` inside the segment bounds?
    ///
    /// Up-growing segments allow `[0, limit]`; expand-down segments allow
    /// `(limit, roof]`. Matches the silicon rule that a misaligned access
    /// may fault on its last byte.
    pub fn limit_check(&self, offset: u32, len: u32) -> bool {
        let last = offset.wrapping_add(len - 1);
        if last < offset {
            return false; // wrap past the top of the offset space
        }
        if self.topdown {
            offset > self.limit && last <= self.roof
        } else {
            last <= self.limit
        }
    }
}

/// Where a segment write came from; the check rules differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegSource {
    /// MOV Sreg / POP Sreg / LDS-LES-LFS-LGS
    Load,
    /// Stack segment load (MOV SS / POP SS / task switch SS)
    StackLoad,
    /// CS load where privilege checks already ran (far transfer, gate,
    /// task switch); the descriptor is installed as handed in
    Checked,
}

impl Cpu {
    /// Fetch the 8-byte descriptor that `selector` names from the GDT or
    /// LDT, faulting with #GP(selector) when it is outside the table.
    pub fn fetch_descriptor(&mut self, bus: &mut Bus, selector: u16) -> ExecResult<u64> {
        let index = (selector & !7) as u32;
        let (table_base, table_limit) = if selector & 4 != 0 {
            let ldt = &self.descriptors[SegReg::Ldtr as usize];
            (ldt.base, ldt.limit)
        } else {
            (self.regs.gdtr.base, self.regs.gdtr.limit as u32)
        };
        if index + 7 > table_limit {
            return Err(Fault::with_selector(EXC_GP, selector));
        }
        let mut raw: u64 = 0;
        for i in 0..8 {
            let byte = self.linear_read_byte(bus, table_base.wrapping_add(index + i))?;
            raw |= (byte as u64) << (8 * i);
        }
        Ok(raw)
    }

    /// Set the accessed bit of `selector`'s descriptor in its table.
    pub fn mark_descriptor_accessed(&mut self, bus: &mut Bus, selector: u16) -> ExecResult<()> {
        let index = (selector & !7) as u32;
        let table_base = if selector & 4 != 0 {
            self.descriptors[SegReg::Ldtr as usize].base
        } else {
            self.regs.gdtr.base
        };
        let ar_addr = table_base.wrapping_add(index + 5);
        let ar_byte = self.linear_read_byte(bus, ar_addr)?;
        if ar_byte & 1 == 0 {
            self.linear_write_byte(bus, ar_addr, ar_byte | 1)?;
        }
        Ok(())
    }

    /// Install a descriptor into the cache without checks (real mode,
    /// already-verified far transfers, task switch, LOADALL).
    pub fn install_descriptor(&mut self, seg: SegReg, selector: u16, desc: SegmentDescriptor) {
        self.regs.set_seg(seg, selector);
        self.descriptors[seg as usize] = desc;
    }

    /// Architectural segment register write.
    ///
    /// Real mode and V86 rebuild the selector<<4 shadow. Protected mode
    /// runs the full check sequence for the register class and faults
    /// without touching the cache. The cache entry and selector update
    /// together or not at all.
    pub fn segment_written(
        &mut self,
        bus: &mut Bus,
        seg: SegReg,
        selector: u16,
        source: SegSource,
    ) -> ExecResult<()> {
        if self.mode != CpuMode::Protected || source == SegSource::Checked {
            let desc = if source == SegSource::Checked {
                self.descriptors[seg as usize].clone()
            } else {
                SegmentDescriptor::real_mode(selector)
            };
            self.install_descriptor(seg, selector, desc);
            return Ok(());
        }

        let is_null = selector & !3 == 0;
        match seg {
            SegReg::Ss => {
                if is_null {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let rpl = (selector & 3) as u8;
                if rpl != self.cpl {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
                let raw = self.fetch_descriptor(bus, selector)?;
                let desc = SegmentDescriptor::from_raw(raw);
                if !desc.is_writable_data() || desc.dpl() != self.cpl {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
                if desc.notpresent {
                    return Err(Fault::with_selector(EXC_SS, selector));
                }
                self.mark_descriptor_accessed(bus, selector)?;
                self.install_descriptor(seg, selector, desc);
            }
            SegReg::Cs => {
                // Direct MOV/POP to CS is rejected upstream (#UD); only
                // checked far-transfer paths may land here.
                debug_assert!(source == SegSource::Checked);
            }
            SegReg::Tr | SegReg::Ldtr => {
                // LTR/LLDT run their own system-descriptor checks first.
                let raw = self.fetch_descriptor(bus, selector)?;
                let desc = SegmentDescriptor::from_raw(raw);
                self.install_descriptor(seg, selector, desc);
            }
            _ => {
                if is_null {
                    // A null data segment loads fine and faults on use.
                    let mut desc = SegmentDescriptor::from_raw(0);
                    desc.notpresent = true;
                    desc.rights = [RIGHTS_FAULT; 256];
                    self.install_descriptor(seg, selector, desc);
                    return Ok(());
                }
                let rpl = (selector & 3) as u8;
                let raw = self.fetch_descriptor(bus, selector)?;
                let desc = SegmentDescriptor::from_raw(raw);
                let readable = desc.is_code_or_data()
                    && (!desc.is_code() || desc.is_readable_code());
                if !readable {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
                // Privilege: data and non-conforming code require
                // max(CPL, RPL) <= DPL.
                if !desc.is_conforming() && rpl.max(self.cpl) > desc.dpl() {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
                if desc.notpresent {
                    return Err(Fault::with_selector(EXC_NP, selector));
                }
                self.mark_descriptor_accessed(bus, selector)?;
                self.install_descriptor(seg, selector, desc);
            }
        }
        Ok(())
    }

    /// Borrow the cached descriptor for `seg`.
    #[inline]
    pub fn descriptor(&self, seg: SegReg) -> &SegmentDescriptor {
        &self.descriptors[seg as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a raw descriptor from its fields.
    pub(crate) fn make_raw(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
        (limit as u64 & 0xFFFF)
            | ((base as u64 & 0xFF_FFFF) << 16)
            | ((access as u64) << 40)
            | (((limit as u64 >> 16) & 0xF) << 48)
            | ((flags as u64 & 0xF) << 52)
            | ((base as u64 >> 24) << 56)
    }

    #[test]
    fn test_decode_byte_granular() {
        // Present, DPL 0, code, readable; base 0x00120000 limit 0xFFFF.
        let desc = SegmentDescriptor::from_raw(make_raw(0x0012_0000, 0xFFFF, 0x9A, 0x0));
        assert_eq!(desc.base, 0x0012_0000);
        assert_eq!(desc.limit, 0xFFFF);
        assert!(!desc.topdown);
        assert!(!desc.notpresent);
        assert!(desc.is_code());
        assert!(desc.is_readable_code());
    }

    #[test]
    fn test_decode_page_granular() {
        // G bit set: limit 0xFFFFF becomes 4 GB - 1.
        let desc = SegmentDescriptor::from_raw(make_raw(0, 0xFFFFF, 0x92, 0xC));
        assert_eq!(desc.limit, 0xFFFF_FFFF);
        assert!(desc.is_32bit());
    }

    #[test]
    fn test_expand_down_roof() {
        // Expand-down data, D/B clear: valid offsets are (limit, FFFF].
        let desc = SegmentDescriptor::from_raw(make_raw(0, 0x1000, 0x96, 0x0));
        assert!(desc.topdown);
        assert_eq!(desc.roof, 0xFFFF);
        assert!(!desc.limit_check(0x0500, 1));
        assert!(desc.limit_check(0x1001, 1));

        // D/B set lifts the roof to 4 GB - 1.
        let desc32 = SegmentDescriptor::from_raw(make_raw(0, 0x1000, 0x96, 0x4));
        assert_eq!(desc32.roof, 0xFFFF_FFFF);
    }

    #[test]
    fn test_limit_check_up() {
        let desc = SegmentDescriptor::from_raw(make_raw(0, 0xFF, 0x92, 0));
        assert!(desc.limit_check(0, 1));
        assert!(desc.limit_check(0xFC, 4));
        assert!(!desc.limit_check(0xFD, 4)); // last byte out of bounds
        assert!(!desc.limit_check(0x100, 1));
    }

    #[test]
    fn test_rights_code_not_writable() {
        let desc = SegmentDescriptor::from_raw(make_raw(0, 0xFFFF, 0x9A, 0));
        assert_eq!(
            desc.rights_verdict(AccessKind::Write, 0, false, 1),
            RIGHTS_FAULT
        );
        assert_eq!(desc.rights_verdict(AccessKind::Read, 0, false, 1), RIGHTS_OK);
        assert_eq!(
            desc.rights_verdict(AccessKind::Execute, 0, false, 1),
            RIGHTS_OK
        );
    }

    #[test]
    fn test_rights_privilege() {
        // DPL 0 data: CPL 3 read faults.
        let desc = SegmentDescriptor::from_raw(make_raw(0, 0xFFFF, 0x92, 0));
        assert_eq!(desc.rights_verdict(AccessKind::Read, 0, false, 1), RIGHTS_OK);
        assert_eq!(
            desc.rights_verdict(AccessKind::Read, 3, false, 1),
            RIGHTS_FAULT
        );

        // Conforming code readable from any CPL.
        let conf = SegmentDescriptor::from_raw(make_raw(0, 0xFFFF, 0x9E, 0));
        assert_eq!(conf.rights_verdict(AccessKind::Read, 3, false, 1), RIGHTS_OK);
    }

    #[test]
    fn test_rights_not_present() {
        let desc = SegmentDescriptor::from_raw(make_raw(0, 0xFFFF, 0x12, 0));
        assert_eq!(desc.rights_verdict(AccessKind::Read, 0, false, 1), RIGHTS_NP);
    }

    #[test]
    fn test_real_mode_shadow() {
        let desc = SegmentDescriptor::real_mode(0x3000);
        assert_eq!(desc.base, 0x30000);
        assert_eq!(desc.limit, 0xFFFF);
        assert_eq!(desc.rights_verdict(AccessKind::Write, 3, false, 2), RIGHTS_OK);
    }

    #[test]
    fn test_reset_cs_high_base() {
        let desc = SegmentDescriptor::reset_cs(true);
        assert_eq!(desc.base, 0xFFFF_0000);
        let low = SegmentDescriptor::reset_cs(false);
        assert_eq!(low.base, 0xF0000);
    }

    #[test]
    fn test_precalc_matches_raw() {
        // The precalc invariant: decoding the raw bytes again reproduces
        // the cached fields.
        let raw = make_raw(0xABCD_E012, 0x1F00F, 0xF2, 0x8);
        let desc = SegmentDescriptor::from_raw(raw);
        let redecoded = SegmentDescriptor::from_raw(desc.raw);
        assert_eq!(desc.base, redecoded.base);
        assert_eq!(desc.limit, redecoded.limit);
        assert_eq!(desc.roof, redecoded.roof);
        assert_eq!(desc.topdown, redecoded.topdown);
        assert_eq!(desc.notpresent, redecoded.notpresent);
    }
}
