//! System instructions: descriptor-table management, machine status word,
//! control/debug/test register moves, CPUID/MSR/TSC, HLT and the
//! coprocessor gates, plus the undocumented LOADALL pair.

use super::descriptor::SegmentDescriptor;
use super::interrupts::{Fault, EXC_GP, EXC_NM, EXC_NP, EXC_UD};
use super::registers::{
    derive_mode, msr_readonly_mask, CpuMode, Msr, SegReg, TableReg, CR0_EM, CR0_MP, CR0_PE,
    CR0_PG, CR0_TS, CR4_TSD, NUM_MSRS,
};
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::config::{CpuModel, CpuidMode};
use crate::cpu::flags;
use crate::cpu::mmu::MemSeg;

impl Cpu {
    /// HLT (F4): privileged outside ring 0.
    pub fn exec_hlt(&mut self) -> ExecResult<()> {
        if self.mode != CpuMode::Real && self.cpl != 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        self.halted = true;
        Ok(())
    }

    /// WAIT/FWAIT (9B): #NM when TS and MP are both set.
    pub fn exec_wait(&mut self) -> ExecResult<()> {
        let cr0 = self.regs.cr[0];
        if cr0 & CR0_TS != 0 && cr0 & CR0_MP != 0 {
            return Err(Fault::new(EXC_NM));
        }
        Ok(())
    }

    /// Coprocessor escape (D8-DF). No FPU is modeled: EM or TS raises
    /// #NM, otherwise the opcode is a long NOP.
    pub fn exec_fpu_escape(&mut self, _bus: &mut Bus) -> ExecResult<()> {
        let cr0 = self.regs.cr[0];
        if cr0 & (CR0_EM | CR0_TS) != 0 {
            return Err(Fault::new(EXC_NM));
        }
        Ok(())
    }

    /// CLTS (0F06): clear the task-switched flag, ring 0 only.
    pub fn exec_clts(&mut self) -> ExecResult<()> {
        if self.mode != CpuMode::Real && self.cpl != 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        self.regs.cr[0] &= !CR0_TS;
        Ok(())
    }

    /// INVD (0F08) / WBINVD (0F09): privileged cache flushes; the cache
    /// model is flat so only the checks remain.
    pub fn exec_cache_flush(&mut self) -> ExecResult<()> {
        if self.model < CpuModel::I80486 {
            return Err(Fault::new(EXC_UD));
        }
        if self.mode != CpuMode::Real && self.cpl != 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        Ok(())
    }

    // ========== Group 6 (0F00) ==========

    /// SLDT/STR/LLDT/LTR/VERR/VERW.
    pub fn exec_group6(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.mode != CpuMode::Protected {
            return Err(Fault::new(EXC_UD));
        }
        match self.modrm.reg_field() {
            0 => {
                let value = self.regs.seg(SegReg::Ldtr);
                self.write_op16(bus, self.modrm.rm16(), value)
            }
            1 => {
                let value = self.regs.seg(SegReg::Tr);
                self.write_op16(bus, self.modrm.rm16(), value)
            }
            2 => {
                // LLDT
                if self.cpl != 0 {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let selector = self.read_op16(bus, self.modrm.rm16())?;
                if selector & !3 == 0 {
                    self.install_descriptor(SegReg::Ldtr, 0, SegmentDescriptor::from_raw(0));
                    return Ok(());
                }
                if selector & 4 != 0 {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
                let raw = self.fetch_descriptor(bus, selector)?;
                let desc = SegmentDescriptor::from_raw(raw);
                if desc.is_code_or_data() || desc.type_field() != 0x2 {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
                if desc.notpresent {
                    return Err(Fault::with_selector(EXC_NP, selector));
                }
                self.install_descriptor(SegReg::Ldtr, selector, desc);
                Ok(())
            }
            3 => {
                // LTR
                if self.cpl != 0 {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let selector = self.read_op16(bus, self.modrm.rm16())?;
                if selector & !3 == 0 || selector & 4 != 0 {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
                let raw = self.fetch_descriptor(bus, selector)?;
                let desc = SegmentDescriptor::from_raw(raw);
                if desc.is_code_or_data() || !matches!(desc.type_field(), 0x1 | 0x9) {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
                if desc.notpresent {
                    return Err(Fault::with_selector(EXC_NP, selector));
                }
                // Mark the TSS busy in the table and the cache.
                let ar_addr = self.regs.gdtr.base.wrapping_add((selector & !7) as u32 + 5);
                let ar = self.linear_read_byte(bus, ar_addr)?;
                self.linear_write_byte(bus, ar_addr, ar | 2)?;
                let mut busy = desc;
                busy.raw |= 2u64 << 40;
                self.install_descriptor(SegReg::Tr, selector, busy);
                Ok(())
            }
            4 | 5 => {
                // VERR/VERW: set ZF when the selector is usable.
                let want_write = self.modrm.reg_field() == 5;
                let selector = self.read_op16(bus, self.modrm.rm16())?;
                let usable = self.selector_verifies(bus, selector, want_write);
                self.regs.set_flag(flags::ZF, usable);
                Ok(())
            }
            _ => Err(Fault::new(EXC_UD)),
        }
    }

    /// Non-faulting descriptor probe for VERR/VERW/LAR/LSL.
    fn selector_verifies(&mut self, bus: &mut Bus, selector: u16, want_write: bool) -> bool {
        if selector & !3 == 0 {
            return false;
        }
        let Ok(raw) = self.fetch_descriptor(bus, selector) else {
            return false;
        };
        let desc = SegmentDescriptor::from_raw(raw);
        if !desc.is_code_or_data() || desc.notpresent {
            return false;
        }
        let rpl = (selector & 3) as u8;
        if !desc.is_conforming() && rpl.max(self.cpl) > desc.dpl() {
            return false;
        }
        if want_write {
            desc.is_writable_data()
        } else {
            !desc.is_code() || desc.is_readable_code()
        }
    }

    // ========== Group 7 (0F01) ==========

    /// SGDT/SIDT/LGDT/LIDT/SMSW/LMSW/INVLPG.
    pub fn exec_group7(&mut self, bus: &mut Bus) -> ExecResult<()> {
        match self.modrm.reg_field() {
            0 | 1 => {
                // SGDT/SIDT m16&32
                let Some(mem) = self.modrm.mem else {
                    return Err(Fault::new(EXC_UD));
                };
                let table = if self.modrm.reg_field() == 0 {
                    self.regs.gdtr
                } else {
                    self.regs.idtr
                };
                self.mmu_ww(bus, MemSeg::Desc(mem.seg), mem.offset, table.limit, mem.addr16)?;
                // 16-bit form stores only 24 base bits (top byte
                // undefined-as-zero on 286, set on 386).
                let base = if self.fetch.operand_size32 {
                    table.base
                } else {
                    table.base & 0x00FF_FFFF
                };
                self.mmu_wdw(
                    bus,
                    MemSeg::Desc(mem.seg),
                    mem.offset.wrapping_add(2),
                    base,
                    mem.addr16,
                )
            }
            2 | 3 => {
                // LGDT/LIDT m16&32
                if self.mode != CpuMode::Real && self.cpl != 0 {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let Some(mem) = self.modrm.mem else {
                    return Err(Fault::new(EXC_UD));
                };
                let limit = self.mmu_rw(bus, MemSeg::Desc(mem.seg), mem.offset, false, mem.addr16)?;
                let mut base = self.mmu_rdw(
                    bus,
                    MemSeg::Desc(mem.seg),
                    mem.offset.wrapping_add(2),
                    false,
                    mem.addr16,
                )?;
                if !self.fetch.operand_size32 {
                    base &= 0x00FF_FFFF;
                }
                let table = TableReg { base, limit };
                if self.modrm.reg_field() == 2 {
                    self.regs.gdtr = table;
                } else {
                    self.regs.idtr = table;
                }
                Ok(())
            }
            4 => {
                // SMSW
                let msw = self.regs.cr[0] as u16;
                self.write_op16(bus, self.modrm.rm16(), msw)
            }
            6 => {
                // LMSW: sets PE/MP/EM/TS; cannot clear PE.
                if self.mode != CpuMode::Real && self.cpl != 0 {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let value = self.read_op16(bus, self.modrm.rm16())? as u32;
                let keep_pe = self.regs.cr[0] & CR0_PE;
                let low = (value & 0xF) | keep_pe;
                self.regs
                    .write_cr0((self.regs.cr[0] & !0xFu32) | low);
                self.mode = derive_mode(self.regs.cr[0], self.regs.eflags);
                Ok(())
            }
            7 => {
                // INVLPG m
                if self.model < CpuModel::I80486 {
                    return Err(Fault::new(EXC_UD));
                }
                if self.mode != CpuMode::Real && self.cpl != 0 {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let Some(mem) = self.modrm.mem else {
                    return Err(Fault::new(EXC_UD));
                };
                let linear = self.descriptors[mem.seg as usize]
                    .base
                    .wrapping_add(mem.offset);
                self.tlb.invalidate_page(linear);
                Ok(())
            }
            _ => Err(Fault::new(EXC_UD)),
        }
    }

    /// LAR (0F02): load access rights when the selector verifies.
    pub fn exec_lar(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.mode != CpuMode::Protected {
            return Err(Fault::new(EXC_UD));
        }
        let selector = self.read_op16(bus, self.modrm.rm16())?;
        if selector & !3 == 0 {
            self.regs.set_flag(flags::ZF, false);
            return Ok(());
        }
        let Ok(raw) = self.fetch_descriptor(bus, selector) else {
            self.regs.set_flag(flags::ZF, false);
            return Ok(());
        };
        let desc = SegmentDescriptor::from_raw(raw);
        let rpl = (selector & 3) as u8;
        let visible = if desc.is_code_or_data() {
            desc.is_conforming() || rpl.max(self.cpl) <= desc.dpl()
        } else {
            // System types LAR accepts.
            matches!(desc.type_field(), 0x1 | 0x2 | 0x3 | 0x4 | 0x5 | 0x9 | 0xB | 0xC)
                && rpl.max(self.cpl) <= desc.dpl()
        };
        if !visible {
            self.regs.set_flag(flags::ZF, false);
            return Ok(());
        }
        self.regs.set_flag(flags::ZF, true);
        let ar = ((raw >> 32) & 0x00FF_FF00) as u32;
        let value = if self.fetch.operand_size32 {
            ar & 0x00FF_FF00
        } else {
            ar & 0xFF00
        };
        self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), value)
    }

    /// LSL (0F03): load the effective segment limit when visible.
    pub fn exec_lsl(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.mode != CpuMode::Protected {
            return Err(Fault::new(EXC_UD));
        }
        let selector = self.read_op16(bus, self.modrm.rm16())?;
        if selector & !3 == 0 {
            self.regs.set_flag(flags::ZF, false);
            return Ok(());
        }
        let Ok(raw) = self.fetch_descriptor(bus, selector) else {
            self.regs.set_flag(flags::ZF, false);
            return Ok(());
        };
        let desc = SegmentDescriptor::from_raw(raw);
        let rpl = (selector & 3) as u8;
        let visible = if desc.is_code_or_data() {
            desc.is_conforming() || rpl.max(self.cpl) <= desc.dpl()
        } else {
            matches!(desc.type_field(), 0x1 | 0x2 | 0x3 | 0x9 | 0xB)
                && rpl.max(self.cpl) <= desc.dpl()
        };
        if !visible {
            self.regs.set_flag(flags::ZF, false);
            return Ok(());
        }
        self.regs.set_flag(flags::ZF, true);
        self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), desc.limit)
    }

    // ========== Control/debug/test register moves ==========

    /// MOV r32,CRn / MOV CRn,r32 / MOV r32,DRn / MOV DRn,r32 (0F20-23).
    pub fn exec_mov_control(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.model < CpuModel::I80386 {
            return Err(Fault::new(EXC_UD));
        }
        if self.mode != CpuMode::Real && self.cpl != 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        // These encodings always use the register form of r/m.
        let reg = self.modrm.rm_field();
        let which = self.modrm.reg_field();
        let is_debug = self.fetch.opcode & 1 != 0;
        let to_register = self.fetch.opcode & 2 == 0;
        let _ = bus;

        if is_debug {
            let Some(index) = self.regs.dr_effective_index(which) else {
                return Err(Fault::new(EXC_UD));
            };
            if to_register {
                self.regs.write32(reg, self.regs.dr[index as usize]);
            } else {
                self.regs.dr[index as usize] = self.regs.read32(reg);
                self.refresh_breakpoints();
            }
            return Ok(());
        }

        if to_register {
            let value = match which {
                0 => self.regs.cr[0],
                2 => self.regs.cr[2],
                3 => self.regs.cr[3],
                4 if self.model >= CpuModel::Pentium => self.regs.cr[4],
                _ => return Err(Fault::new(EXC_UD)),
            };
            self.regs.write32(reg, value);
        } else {
            let value = self.regs.read32(reg);
            match which {
                0 => {
                    let old = self.regs.cr[0];
                    self.regs.write_cr0(value);
                    self.mode = derive_mode(self.regs.cr[0], self.regs.eflags);
                    if (old ^ self.regs.cr[0]) & (CR0_PG | CR0_PE) != 0 {
                        self.paging_init_tlb();
                    }
                }
                2 => self.regs.cr[2] = value,
                3 => {
                    self.regs.cr[3] = value;
                    self.paging_clear_tlb();
                }
                4 if self.model >= CpuModel::Pentium => self.regs.write_cr4(value),
                _ => return Err(Fault::new(EXC_UD)),
            }
        }
        Ok(())
    }

    /// MOV r32,TRn / MOV TRn,r32 (0F24/0F26): 486 and Pentium only.
    pub fn exec_mov_test_reg(&mut self, _bus: &mut Bus) -> ExecResult<()> {
        if !self.model.has_test_registers() {
            return Err(Fault::new(EXC_UD));
        }
        if self.mode != CpuMode::Real && self.cpl != 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let reg = self.modrm.rm_field();
        let which = self.modrm.reg_field() as usize;
        if self.fetch.opcode == 0x24 {
            self.regs.write32(reg, self.regs.tr[which]);
        } else {
            self.regs.tr[which] = self.regs.read32(reg);
        }
        Ok(())
    }

    // ========== TSC / MSR / CPUID ==========

    /// RDTSC (0F31).
    pub fn exec_rdtsc(&mut self) -> ExecResult<()> {
        if !self.model.has_tsc() {
            return Err(Fault::new(EXC_UD));
        }
        if self.regs.cr[4] & CR4_TSD != 0 && self.cpl != 0 && self.mode != CpuMode::Real {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        self.regs.set_eax(self.tsc as u32);
        self.regs.write32(2, (self.tsc >> 32) as u32);
        Ok(())
    }

    /// RDMSR (0F32).
    pub fn exec_rdmsr(&mut self) -> ExecResult<()> {
        if !self.model.has_tsc() {
            return Err(Fault::new(EXC_UD));
        }
        if self.mode != CpuMode::Real && self.cpl != 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let index = self.regs.ecx();
        let msr = self.read_msr(index)?;
        self.regs.set_eax(msr.lo);
        self.regs.write32(2, msr.hi);
        Ok(())
    }

    /// WRMSR (0F30).
    pub fn exec_wrmsr(&mut self) -> ExecResult<()> {
        if !self.model.has_tsc() {
            return Err(Fault::new(EXC_UD));
        }
        if self.mode != CpuMode::Real && self.cpl != 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let index = self.regs.ecx();
        let value = ((self.regs.read32(2) as u64) << 32) | self.regs.eax() as u64;
        self.write_msr(index, value)
    }

    fn read_msr(&mut self, index: u32) -> ExecResult<Msr> {
        match index {
            0x10 => Ok(Msr {
                lo: self.tsc as u32,
                hi: (self.tsc >> 32) as u32,
            }),
            _ if (index as usize) < NUM_MSRS => Ok(self.regs.msrs[index as usize]),
            _ => Err(Fault::with_code(EXC_GP, 0)),
        }
    }

    fn write_msr(&mut self, index: u32, value: u64) -> ExecResult<()> {
        match index {
            0x10 => {
                self.tsc = value;
                Ok(())
            }
            _ if (index as usize) < NUM_MSRS => {
                let slot = &mut self.regs.msrs[index as usize];
                let current = ((slot.hi as u64) << 32) | slot.lo as u64;
                let ro = msr_readonly_mask(index);
                let merged = (current & ro) | (value & !ro);
                slot.lo = merged as u32;
                slot.hi = (merged >> 32) as u32;
                Ok(())
            }
            _ => Err(Fault::with_code(EXC_GP, 0)),
        }
    }

    /// CPUID (0FA2).
    pub fn exec_cpuid(&mut self) -> ExecResult<()> {
        if self.model < CpuModel::Pentium || self.cpuid_mode == CpuidMode::DxOnStart {
            return Err(Fault::new(EXC_UD));
        }
        let leaf = self.regs.eax();
        let max_leaf = match self.cpuid_mode {
            CpuidMode::Limited => 1,
            _ => 2,
        };
        match leaf {
            0 => {
                self.regs.set_eax(max_leaf);
                // "GenuineIntel" in the usual EBX/EDX/ECX order.
                self.regs.write32(3, u32::from_le_bytes(*b"Genu"));
                self.regs.write32(2, u32::from_le_bytes(*b"ineI"));
                self.regs.write32(1, u32::from_le_bytes(*b"ntel"));
            }
            1 => {
                let (family, model_id) = match self.model {
                    CpuModel::Pentium => (5, 2),
                    CpuModel::PentiumPro => (6, 1),
                    _ => (6, 3),
                };
                self.regs.set_eax(family << 8 | model_id << 4);
                self.regs.write32(3, 0);
                self.regs.write32(1, 0);
                // TSC and MSR support; no on-chip FPU is reported.
                self.regs.write32(2, 1 << 4 | 1 << 5);
            }
            _ => {
                // Leaf 2 returns a bare 0x01 descriptor header and no TLB
                // descriptor bytes, diverging from real silicon.
                self.regs.set_eax(0x0000_0001);
                self.regs.write32(3, 0);
                self.regs.write32(1, 0);
                self.regs.write32(2, 0);
            }
        }
        Ok(())
    }

    // ========== LOADALL ==========

    /// LOADALL (0F05, 80286): load the whole machine state from the fixed
    /// physical image at 0x800. Field order follows the silicon layout.
    pub fn exec_loadall286(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.model != CpuModel::I80286 {
            return Err(Fault::new(EXC_UD));
        }
        let base = 0x800u32;
        fn word(cpu: &mut Cpu, bus: &mut Bus, base: u32, index: u32) -> ExecResult<u16> {
            cpu.mmu_rw(bus, MemSeg::LinearUnpaged, base + index * 2, false, false)
        }

        let msw = word(self, bus, base, 3)?;
        let tr = word(self, bus, base, 11)?;
        let fl = word(self, bus, base, 12)?;
        let ip = word(self, bus, base, 13)?;
        let ldt = word(self, bus, base, 14)?;
        let ds = word(self, bus, base, 15)?;
        let ss = word(self, bus, base, 16)?;
        let cs = word(self, bus, base, 17)?;
        let es = word(self, bus, base, 18)?;
        for (i, reg) in [7u8, 6, 5, 4, 3, 2, 1, 0].iter().enumerate() {
            // DI, SI, BP, SP, BX, DX, CX, AX
            let value = word(self, bus, base, 19 + i as u32)?;
            self.regs.write16(*reg, value);
        }

        // Descriptor caches: ES, CS, SS, DS then GDTR, LDT, IDTR, TSS.
        let mut caches = [(SegReg::Es, 0u32); 4];
        caches[0] = (SegReg::Es, 27);
        caches[1] = (SegReg::Cs, 30);
        caches[2] = (SegReg::Ss, 33);
        caches[3] = (SegReg::Ds, 36);
        for (seg, index) in caches {
            let desc = self.read_cache286(bus, base + index * 2)?;
            let selector = match seg {
                SegReg::Es => es,
                SegReg::Cs => cs,
                SegReg::Ss => ss,
                _ => ds,
            };
            self.install_descriptor(seg, selector, desc);
        }
        let gdtr = self.read_dtr286(bus, base + 39 * 2)?;
        let ldt_desc = self.read_cache286(bus, base + 42 * 2)?;
        let idtr = self.read_dtr286(bus, base + 45 * 2)?;
        let tss_desc = self.read_cache286(bus, base + 48 * 2)?;

        self.regs.gdtr = gdtr;
        self.regs.idtr = idtr;
        self.install_descriptor(SegReg::Ldtr, ldt, ldt_desc);
        self.install_descriptor(SegReg::Tr, tr, tss_desc);

        self.regs.write_cr0((self.regs.cr[0] & !0xFu32) | (msw as u32 & 0xF));
        self.regs.write_eflags(fl as u32);
        self.regs.eip = ip as u32;
        self.mode = derive_mode(self.regs.cr[0], self.regs.eflags);
        self.cpl = if self.mode == CpuMode::Protected {
            (ss & 3) as u8
        } else {
            0
        };
        bus.prefetch_flush(
            self.index,
            self.descriptors[SegReg::Cs as usize]
                .base
                .wrapping_add(self.regs.eip),
        );
        Ok(())
    }

    /// One 286 descriptor-cache triplet: base-low, base-high/AR, limit.
    fn read_cache286(&mut self, bus: &mut Bus, addr: u32) -> ExecResult<SegmentDescriptor> {
        let baselow = self.mmu_rw(bus, MemSeg::LinearUnpaged, addr, false, false)?;
        let high = self.mmu_rw(bus, MemSeg::LinearUnpaged, addr + 2, false, false)?;
        let limit = self.mmu_rw(bus, MemSeg::LinearUnpaged, addr + 4, false, false)?;
        let base = baselow as u32 | ((high as u32 & 0xFF) << 16);
        let access = (high >> 8) as u8;
        let raw = (limit as u64)
            | ((base as u64 & 0xFF_FFFF) << 16)
            | ((access as u64) << 40);
        let mut desc = SegmentDescriptor::from_raw(raw);
        desc.base = base;
        Ok(desc)
    }

    fn read_dtr286(&mut self, bus: &mut Bus, addr: u32) -> ExecResult<TableReg> {
        let baselow = self.mmu_rw(bus, MemSeg::LinearUnpaged, addr, false, false)?;
        let high = self.mmu_rw(bus, MemSeg::LinearUnpaged, addr + 2, false, false)?;
        let limit = self.mmu_rw(bus, MemSeg::LinearUnpaged, addr + 4, false, false)?;
        Ok(TableReg {
            base: baselow as u32 | ((high as u32 & 0xFF) << 16),
            limit,
        })
    }

    /// LOADALL (0F07, 80386): load the machine state image at ES:EDI.
    /// Field order follows the 386 layout: CR0 first, then the register
    /// file high-to-low, selectors, and the descriptor caches.
    pub fn exec_loadall386(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.model != CpuModel::I80386 {
            return Err(Fault::new(EXC_UD));
        }
        let base = self.descriptors[SegReg::Es as usize]
            .base
            .wrapping_add(self.regs.gpr[7]); // EDI
        fn dword(cpu: &mut Cpu, bus: &mut Bus, base: u32, index: u32) -> ExecResult<u32> {
            cpu.mmu_rdw(bus, MemSeg::LinearUnpaged, base + index * 4, false, false)
        }

        let cr0 = dword(self, bus, base, 0)?;
        let fl = dword(self, bus, base, 1)?;
        let eip = dword(self, bus, base, 2)?;
        // EDI..EAX in layout order.
        for (i, reg) in [7u8, 6, 5, 4, 3, 2, 1, 0].iter().enumerate() {
            let value = dword(self, bus, base, 3 + i as u32)?;
            self.regs.write32(*reg, value);
        }
        let dr6 = dword(self, bus, base, 11)?;
        let dr7 = dword(self, bus, base, 12)?;
        let tr = dword(self, bus, base, 13)? as u16;
        let ldt = dword(self, bus, base, 14)? as u16;
        let mut sels = [0u16; 6];
        for (i, slot) in sels.iter_mut().enumerate() {
            // GS, FS, DS, SS, CS, ES
            *slot = dword(self, bus, base, 15 + i as u32)? as u16;
        }

        // Descriptor caches: TSS, IDT, GDT, LDT, GS, FS, DS, SS, CS, ES.
        let tss_desc = self.read_cache386(bus, base + 21 * 4)?;
        let idtr = self.read_dtr386(bus, base + 24 * 4)?;
        let gdtr = self.read_dtr386(bus, base + 27 * 4)?;
        let ldt_desc = self.read_cache386(bus, base + 30 * 4)?;
        let seg_descs = [
            (SegReg::Gs, 33u32),
            (SegReg::Fs, 36),
            (SegReg::Ds, 39),
            (SegReg::Ss, 42),
            (SegReg::Cs, 45),
            (SegReg::Es, 48),
        ];

        self.regs.write_cr0(cr0);
        self.regs.write_eflags(fl);
        self.regs.eip = eip;
        self.regs.dr[6] = dr6;
        self.regs.dr[7] = dr7;
        self.refresh_breakpoints();
        self.regs.idtr = idtr;
        self.regs.gdtr = gdtr;
        self.install_descriptor(SegReg::Tr, tr, tss_desc);
        self.install_descriptor(SegReg::Ldtr, ldt, ldt_desc);
        for (i, (seg, index)) in seg_descs.iter().enumerate() {
            let desc = self.read_cache386(bus, base + index * 4)?;
            self.install_descriptor(*seg, sels[i], desc);
        }

        self.mode = derive_mode(self.regs.cr[0], self.regs.eflags);
        self.cpl = match self.mode {
            CpuMode::Protected => (sels[3] & 3) as u8,
            CpuMode::Virtual8086 => 3,
            CpuMode::Real => 0,
        };
        bus.prefetch_flush(
            self.index,
            self.descriptors[SegReg::Cs as usize]
                .base
                .wrapping_add(self.regs.eip),
        );
        Ok(())
    }

    /// One 386 descriptor-cache triplet: AR, base, limit dwords.
    fn read_cache386(&mut self, bus: &mut Bus, addr: u32) -> ExecResult<SegmentDescriptor> {
        let ar = self.mmu_rdw(bus, MemSeg::LinearUnpaged, addr, false, false)?;
        let base = self.mmu_rdw(bus, MemSeg::LinearUnpaged, addr + 4, false, false)?;
        let limit = self.mmu_rdw(bus, MemSeg::LinearUnpaged, addr + 8, false, false)?;
        let raw = ((ar as u64 & 0xFF) << 40)
            | ((base as u64 & 0xFF_FFFF) << 16)
            | ((base as u64 >> 24) << 56)
            | (limit as u64 & 0xFFFF)
            | (((limit as u64 >> 16) & 0xF) << 48);
        let mut desc = SegmentDescriptor::from_raw(raw);
        desc.base = base;
        desc.limit = limit;
        desc.roof = desc.roof.max(limit);
        Ok(desc)
    }

    fn read_dtr386(&mut self, bus: &mut Bus, addr: u32) -> ExecResult<TableReg> {
        let _ar = self.mmu_rdw(bus, MemSeg::LinearUnpaged, addr, false, false)?;
        let base = self.mmu_rdw(bus, MemSeg::LinearUnpaged, addr + 4, false, false)?;
        let limit = self.mmu_rdw(bus, MemSeg::LinearUnpaged, addr + 8, false, false)?;
        Ok(TableReg {
            base,
            limit: limit as u16,
        })
    }
}
