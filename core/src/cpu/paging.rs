//! Paging: the TLB and the PDE/PTE table walk.
//!
//! The TLB is a direct-mapped cache of linear page -> physical page plus
//! the collapsed rights of both table levels. `init_tlb` wipes everything;
//! `clear_tlb` is the CR3-write variant that keeps global entries on
//! Pentium Pro and later when CR4.PGE is enabled.
//!
//! Page faults carry the standard 4-bit error code: bit 0 = the page was
//! present (protection violation), bit 1 = write access, bit 2 = user
//! mode, bit 3 = reserved bit set in a table entry. CR2 receives the
//! faulting linear address at delivery time.

use super::descriptor::AccessKind;
use super::interrupts::Fault;
use super::registers::{CpuMode, CR0_PG, CR0_WP, CR4_PSE};
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::config::CpuModel;

/// Page-fault error-code bits.
pub const PF_PRESENT: u32 = 1 << 0;
pub const PF_WRITE: u32 = 1 << 1;
pub const PF_USER: u32 = 1 << 2;
pub const PF_RESERVED: u32 = 1 << 3;

/// PDE/PTE bits.
const PTE_P: u32 = 1 << 0;
const PTE_RW: u32 = 1 << 1;
const PTE_US: u32 = 1 << 2;
const PTE_A: u32 = 1 << 5;
const PTE_D: u32 = 1 << 6;
const PDE_PS: u32 = 1 << 7;
const PTE_G: u32 = 1 << 8;

/// Number of direct-mapped TLB slots.
const TLB_ENTRIES: usize = 64;

/// One TLB entry: a linear page mapped to a physical page with collapsed
/// rights from both table levels.
#[derive(Debug, Clone, Copy, Default)]
struct TlbEntry {
    valid: bool,
    linear_page: u32,
    phys_page: u32,
    writable: bool,
    user: bool,
    global: bool,
    dirty: bool,
}

/// Direct-mapped translation cache.
#[derive(Debug, Clone)]
pub struct Tlb {
    entries: [TlbEntry; TLB_ENTRIES],
}

impl Tlb {
    pub fn new() -> Self {
        Self {
            entries: [TlbEntry::default(); TLB_ENTRIES],
        }
    }

    #[inline]
    fn slot(linear_page: u32) -> usize {
        (linear_page as usize) % TLB_ENTRIES
    }

    /// Look up a linear page. Returns (physical page, writable, user, dirty).
    fn lookup(&self, linear_page: u32) -> Option<(u32, bool, bool, bool)> {
        let entry = &self.entries[Self::slot(linear_page)];
        if entry.valid && entry.linear_page == linear_page {
            Some((entry.phys_page, entry.writable, entry.user, entry.dirty))
        } else {
            None
        }
    }

    fn insert(
        &mut self,
        linear_page: u32,
        phys_page: u32,
        writable: bool,
        user: bool,
        global: bool,
        dirty: bool,
    ) {
        self.entries[Self::slot(linear_page)] = TlbEntry {
            valid: true,
            linear_page,
            phys_page,
            writable,
            user,
            global,
            dirty,
        };
    }

    /// Wipe every entry (power-on, mode change).
    pub fn clear_all(&mut self) {
        self.entries = [TlbEntry::default(); TLB_ENTRIES];
    }

    /// CR3-write flush: drop everything except global entries when the
    /// model honors the global bit.
    pub fn clear_nonglobal(&mut self, keep_global: bool) {
        for entry in &mut self.entries {
            if !(keep_global && entry.global) {
                entry.valid = false;
            }
        }
    }

    /// Drop the entry covering one linear address (INVLPG).
    pub fn invalidate_page(&mut self, linear: u32) {
        let page = linear >> 12;
        let entry = &mut self.entries[Self::slot(page)];
        if entry.linear_page == page {
            entry.valid = false;
        }
    }
}

impl Cpu {
    /// Is the paging unit active for the current mode?
    #[inline]
    pub fn paging_enabled(&self) -> bool {
        self.regs.cr[0] & CR0_PG != 0 && self.mode != CpuMode::Real
    }

    /// Full TLB wipe.
    pub fn paging_init_tlb(&mut self) {
        self.tlb.clear_all();
    }

    /// CR3-write flush; global entries survive on Pentium Pro+ with PGE.
    pub fn paging_clear_tlb(&mut self) {
        let keep_global = self.model >= CpuModel::PentiumPro
            && self.regs.cr[4] & super::registers::CR4_PGE != 0;
        self.tlb.clear_nonglobal(keep_global);
    }

    /// Translate a linear address for an access of `kind` performed at the
    /// current privilege. Returns the physical address; faults with #PF.
    pub fn translate(
        &mut self,
        bus: &mut Bus,
        linear: u32,
        kind: AccessKind,
        user: bool,
    ) -> ExecResult<u32> {
        if !self.paging_enabled() {
            return Ok(linear);
        }
        let is_write = kind == AccessKind::Write;
        let page = linear >> 12;
        let offset = linear & 0xFFF;

        if let Some((phys_page, writable, user_ok, dirty)) = self.tlb.lookup(page) {
            let rights_ok = (!user || user_ok)
                && (!is_write || writable || (!user && self.regs.cr[0] & CR0_WP == 0));
            // A cached clean mapping cannot satisfy a write: the walk must
            // set the dirty bit in the PTE.
            if rights_ok && (!is_write || dirty) {
                return Ok((phys_page << 12) | offset);
            }
        }

        self.page_walk(bus, linear, is_write, user)
            .map(|phys_page| (phys_page << 12) | offset)
    }

    /// Walk the page tables for `linear`, filling the TLB on success.
    fn page_walk(
        &mut self,
        bus: &mut Bus,
        linear: u32,
        is_write: bool,
        user: bool,
    ) -> ExecResult<u32> {
        let err_base = (if is_write { PF_WRITE } else { 0 }) | (if user { PF_USER } else { 0 });
        let page_fault = |code: u32| Fault::page_fault(linear, code);

        let pde_addr = (self.regs.cr[3] & 0xFFFF_F000) + ((linear >> 22) << 2);
        let pde = self.phys_read32(bus, pde_addr);
        if pde & PTE_P == 0 {
            return Err(page_fault(err_base));
        }

        let pse_4m = self.regs.cr[4] & CR4_PSE != 0 && pde & PDE_PS != 0;
        let (entry, entry_addr, phys_page) = if pse_4m {
            let phys_page = ((pde & 0xFFC0_0000) >> 12) | ((linear >> 12) & 0x3FF);
            (pde, pde_addr, phys_page)
        } else {
            let pte_addr = (pde & 0xFFFF_F000) + (((linear >> 12) & 0x3FF) << 2);
            let pte = self.phys_read32(bus, pte_addr);
            if pte & PTE_P == 0 {
                return Err(page_fault(err_base));
            }
            (pte, pte_addr, pte >> 12)
        };

        // Collapse rights across both levels.
        let writable = pde & PTE_RW != 0 && entry & PTE_RW != 0;
        let user_ok = pde & PTE_US != 0 && entry & PTE_US != 0;

        if user && !user_ok {
            return Err(page_fault(err_base | PF_PRESENT));
        }
        if is_write && !writable {
            let supervisor_override = !user && self.regs.cr[0] & CR0_WP == 0;
            if !supervisor_override {
                return Err(page_fault(err_base | PF_PRESENT));
            }
        }

        // Accessed/dirty bookkeeping.
        let mut updated = entry | PTE_A;
        if is_write {
            updated |= PTE_D;
        }
        if updated != entry {
            self.phys_write32(bus, entry_addr, updated);
        }
        if !pse_4m && pde & PTE_A == 0 {
            self.phys_write32(bus, pde_addr, pde | PTE_A);
        }

        let global = self.model >= CpuModel::PentiumPro && entry & PTE_G != 0;
        self.tlb.insert(
            linear >> 12,
            phys_page,
            writable,
            user_ok,
            global,
            updated & PTE_D != 0,
        );
        Ok(phys_page)
    }

    /// Raw physical dword read used by the walker (bypasses segmentation
    /// and paging, honors A20).
    fn phys_read32(&self, bus: &Bus, addr: u32) -> u32 {
        let mut value = 0u32;
        for i in 0..4 {
            value |= (bus.mem.read_byte(addr.wrapping_add(i)) as u32) << (8 * i);
        }
        value
    }

    /// Raw physical dword write used by the walker.
    fn phys_write32(&self, bus: &mut Bus, addr: u32, value: u32) {
        for i in 0..4 {
            bus.mem.write_byte(addr.wrapping_add(i), (value >> (8 * i)) as u8);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tlb_direct_mapped() {
        let mut tlb = Tlb::new();
        tlb.insert(0x10, 0x99, true, true, false, false);
        assert_eq!(tlb.lookup(0x10), Some((0x99, true, true, false)));
        // Conflicting slot evicts.
        tlb.insert(0x10 + TLB_ENTRIES as u32, 0x55, true, true, false, false);
        assert_eq!(tlb.lookup(0x10), None);
    }

    #[test]
    fn test_tlb_clear_all() {
        let mut tlb = Tlb::new();
        tlb.insert(1, 2, true, true, true, false);
        tlb.clear_all();
        assert_eq!(tlb.lookup(1), None);
    }

    #[test]
    fn test_tlb_global_preserved() {
        let mut tlb = Tlb::new();
        tlb.insert(1, 2, true, true, true, false);
        tlb.insert(2, 3, true, true, false, false);
        tlb.clear_nonglobal(true);
        assert!(tlb.lookup(1).is_some());
        assert!(tlb.lookup(2).is_none());

        // Without PGE the globals go too.
        tlb.clear_nonglobal(false);
        assert!(tlb.lookup(1).is_none());
    }

    #[test]
    fn test_invlpg_single_page() {
        let mut tlb = Tlb::new();
        tlb.insert(0x123, 0x456, true, true, true, false);
        tlb.invalidate_page(0x123 << 12);
        assert!(tlb.lookup(0x123).is_none());
    }
}
