//! Hardware task switching through 286 and 386 TSS segments.
//!
//! The switch is decomposed into explicit phases (verify, save outgoing,
//! busy-bit flips, load incoming, segment reloads) so each step's faults
//! surface exactly where the silicon raises them: verification faults in
//! the old task (#GP/#TS against the selector), segment reload faults in
//! the new task. `phase` is updated as the machine advances; a page miss
//! inside any step aborts with the fault and the machine unwinds.
//!
//! Field offsets for both layouts are fixed; the 386 TSS additionally
//! carries CR3, the 32-bit registers, FS/GS and the I/O map base.

use super::descriptor::{SegSource, SegmentDescriptor};
use super::interrupts::{Fault, EXC_GP, EXC_NP, EXC_TS};
use super::registers::{derive_mode, SegReg, CR0_TS};
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::cpu::flags;

/// Why a task switch happens; busy-bit and NT handling differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchReason {
    /// JMP to a TSS descriptor
    Jmp,
    /// CALL to a TSS descriptor
    Call,
    /// Interrupt through a task gate
    Gate,
    /// IRET with NT set
    Iret,
}

/// Progress marker for the switch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskSwitchPhase {
    #[default]
    Idle,
    VerifyDescriptor,
    CheckLimit,
    SaveOutgoing,
    FlipBusyBits,
    LoadTr,
    LoadRegisters,
    LoadLdt,
    LoadSegments,
    PushErrorCode,
    Done,
}

/// TSS type field values (available/busy, 286/386).
const TSS286_AVAILABLE: u8 = 0x1;
const TSS286_BUSY: u8 = 0x3;
const TSS386_AVAILABLE: u8 = 0x9;
const TSS386_BUSY: u8 = 0xB;

/// Minimum TSS limits.
const TSS286_MIN_LIMIT: u32 = 0x2B;
const TSS386_MIN_LIMIT: u32 = 0x67;

impl Cpu {
    /// Switch to the task named by `selector`. `error_code`, when present,
    /// is pushed on the incoming task's stack (exception task gates).
    pub fn task_switch_to(
        &mut self,
        bus: &mut Bus,
        selector: u16,
        reason: TaskSwitchReason,
        error_code: Option<u32>,
    ) -> ExecResult<()> {
        self.task_phase = TaskSwitchPhase::VerifyDescriptor;

        // TSS descriptors live in the GDT only.
        if selector & 4 != 0 || selector & !7 == 0 {
            return Err(Fault::with_selector(EXC_GP, selector));
        }
        let raw = self.fetch_descriptor(bus, selector)?;
        let desc = SegmentDescriptor::from_raw(raw);
        let tss_type = desc.type_field();
        let is_386 = matches!(tss_type & !2, TSS386_AVAILABLE);
        let busy = matches!(tss_type, TSS286_BUSY | TSS386_BUSY);
        let is_tss = !desc.is_code_or_data()
            && matches!(tss_type & !2, TSS286_AVAILABLE | TSS386_AVAILABLE);
        if !is_tss {
            return Err(Fault::with_selector(EXC_GP, selector));
        }
        match reason {
            TaskSwitchReason::Iret => {
                if !busy {
                    return Err(Fault::with_selector(EXC_TS, selector));
                }
            }
            _ => {
                if busy {
                    return Err(Fault::with_selector(EXC_GP, selector));
                }
            }
        }
        if desc.notpresent {
            return Err(Fault::with_selector(EXC_NP, selector));
        }

        self.task_phase = TaskSwitchPhase::CheckLimit;
        let min_limit = if is_386 { TSS386_MIN_LIMIT } else { TSS286_MIN_LIMIT };
        if desc.limit < min_limit {
            return Err(Fault::with_selector(EXC_TS, selector));
        }

        self.task_phase = TaskSwitchPhase::SaveOutgoing;
        let old_tr = self.regs.seg(SegReg::Tr);
        let old_base = self.descriptors[SegReg::Tr as usize].base;
        let old_is_386 = matches!(
            self.descriptors[SegReg::Tr as usize].type_field() & !2,
            TSS386_AVAILABLE
        );
        if old_is_386 {
            self.save_tss386(bus, old_base)?;
        } else {
            self.save_tss286(bus, old_base)?;
        }

        self.task_phase = TaskSwitchPhase::FlipBusyBits;
        match reason {
            TaskSwitchReason::Jmp | TaskSwitchReason::Iret => {
                self.set_tss_busy(bus, old_tr, false)?;
            }
            _ => {} // CALL/Gate leave the old task busy (nesting)
        }
        match reason {
            TaskSwitchReason::Iret => {}
            _ => self.set_tss_busy(bus, selector, true)?,
        }

        self.task_phase = TaskSwitchPhase::LoadTr;
        let mut new_desc = desc.clone();
        if reason != TaskSwitchReason::Iret {
            // Cache reflects the busy form.
            new_desc.raw |= 2u64 << 40;
        }
        self.install_descriptor(SegReg::Tr, selector, new_desc);
        self.regs.cr[0] |= CR0_TS;

        self.task_phase = TaskSwitchPhase::LoadRegisters;
        let backlink_needed = matches!(reason, TaskSwitchReason::Call | TaskSwitchReason::Gate);
        if is_386 {
            self.load_tss386(bus, desc.base, old_tr, backlink_needed)?;
        } else {
            self.load_tss286(bus, desc.base, old_tr, backlink_needed)?;
        }

        self.task_phase = TaskSwitchPhase::PushErrorCode;
        if let Some(code) = error_code {
            if is_386 {
                self.push32(bus, code)?;
            } else {
                self.push16(bus, code as u16)?;
            }
        }

        self.task_phase = TaskSwitchPhase::Done;
        bus.prefetch_flush(
            self.index,
            self.descriptors[SegReg::Cs as usize]
                .base
                .wrapping_add(self.regs.eip),
        );
        Ok(())
    }

    /// Save the outgoing machine state into a 386 TSS.
    fn save_tss386(&mut self, bus: &mut Bus, base: u32) -> ExecResult<()> {
        self.linear_write_dword(bus, base + 0x20, self.regs.eip)?;
        self.linear_write_dword(bus, base + 0x24, self.regs.eflags)?;
        for (i, offset) in (0x28..=0x44).step_by(4).enumerate() {
            self.linear_write_dword(bus, base + offset, self.regs.gpr[i])?;
        }
        let segs = [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds, SegReg::Fs, SegReg::Gs];
        for (i, seg) in segs.iter().enumerate() {
            self.linear_write_word(bus, base + 0x48 + i as u32 * 4, self.regs.seg(*seg))?;
        }
        Ok(())
    }

    /// Save the outgoing machine state into a 286 TSS.
    fn save_tss286(&mut self, bus: &mut Bus, base: u32) -> ExecResult<()> {
        self.linear_write_word(bus, base + 0x0E, self.regs.eip as u16)?;
        self.linear_write_word(bus, base + 0x10, self.regs.eflags as u16)?;
        for i in 0..8 {
            self.linear_write_word(bus, base + 0x12 + i as u32 * 2, self.regs.gpr[i] as u16)?;
        }
        let segs = [SegReg::Es, SegReg::Cs, SegReg::Ss, SegReg::Ds];
        for (i, seg) in segs.iter().enumerate() {
            self.linear_write_word(bus, base + 0x22 + i as u32 * 2, self.regs.seg(*seg))?;
        }
        Ok(())
    }

    /// Load the incoming 386 TSS image and reload the segment registers.
    fn load_tss386(
        &mut self,
        bus: &mut Bus,
        base: u32,
        old_tr: u16,
        set_backlink: bool,
    ) -> ExecResult<()> {
        if set_backlink {
            self.linear_write_word(bus, base, old_tr)?;
        }
        let cr3 = self.linear_read_dword(bus, base + 0x1C)?;
        let eip = self.linear_read_dword(bus, base + 0x20)?;
        let mut eflags = self.linear_read_dword(bus, base + 0x24)?;
        let mut gpr = [0u32; 8];
        for (i, slot) in gpr.iter_mut().enumerate() {
            *slot = self.linear_read_dword(bus, base + 0x28 + i as u32 * 4)?;
        }
        let mut sel = [0u16; 6];
        for (i, slot) in sel.iter_mut().enumerate() {
            *slot = self.linear_read_word(bus, base + 0x48 + i as u32 * 4)?;
        }
        let ldt = self.linear_read_word(bus, base + 0x60)?;

        if set_backlink {
            eflags |= flags::NT;
        }

        self.regs.cr[3] = cr3;
        self.paging_clear_tlb();
        self.regs.eip = eip;
        self.regs.write_eflags(eflags);
        self.regs.gpr = gpr;
        self.mode = derive_mode(self.regs.cr[0], self.regs.eflags);

        self.task_phase = TaskSwitchPhase::LoadLdt;
        if ldt & !7 != 0 {
            let ldt_raw = self.fetch_descriptor(bus, ldt & !4)?;
            let ldt_desc = SegmentDescriptor::from_raw(ldt_raw);
            if ldt_desc.is_code_or_data() || ldt_desc.type_field() != 0x2 {
                return Err(Fault::with_selector(EXC_TS, ldt));
            }
            self.install_descriptor(SegReg::Ldtr, ldt, ldt_desc);
        } else {
            self.install_descriptor(SegReg::Ldtr, 0, SegmentDescriptor::from_raw(0));
        }

        self.task_phase = TaskSwitchPhase::LoadSegments;
        // CPL comes from the incoming CS RPL before the loads check it.
        self.cpl = (sel[1] & 3) as u8;
        self.reload_task_cs(bus, sel[1])?;
        self.segment_written(bus, SegReg::Ss, sel[2], SegSource::StackLoad)?;
        for (seg, selector) in [
            (SegReg::Es, sel[0]),
            (SegReg::Ds, sel[3]),
            (SegReg::Fs, sel[4]),
            (SegReg::Gs, sel[5]),
        ] {
            self.segment_written(bus, seg, selector, SegSource::Load)?;
        }
        Ok(())
    }

    /// Load the incoming 286 TSS image and reload the segment registers.
    fn load_tss286(
        &mut self,
        bus: &mut Bus,
        base: u32,
        old_tr: u16,
        set_backlink: bool,
    ) -> ExecResult<()> {
        if set_backlink {
            self.linear_write_word(bus, base, old_tr)?;
        }
        let ip = self.linear_read_word(bus, base + 0x0E)?;
        let mut fl = self.linear_read_word(bus, base + 0x10)? as u32;
        let mut gpr = [0u16; 8];
        for (i, slot) in gpr.iter_mut().enumerate() {
            *slot = self.linear_read_word(bus, base + 0x12 + i as u32 * 2)?;
        }
        let mut sel = [0u16; 4];
        for (i, slot) in sel.iter_mut().enumerate() {
            *slot = self.linear_read_word(bus, base + 0x22 + i as u32 * 2)?;
        }
        let ldt = self.linear_read_word(bus, base + 0x2A)?;

        if set_backlink {
            fl |= flags::NT;
        }

        self.regs.eip = ip as u32;
        self.regs.write_eflags(fl);
        for (i, value) in gpr.iter().enumerate() {
            self.regs.write16(i as u8, *value);
        }
        self.mode = derive_mode(self.regs.cr[0], self.regs.eflags);

        self.task_phase = TaskSwitchPhase::LoadLdt;
        if ldt & !7 != 0 {
            let ldt_raw = self.fetch_descriptor(bus, ldt & !4)?;
            let ldt_desc = SegmentDescriptor::from_raw(ldt_raw);
            if ldt_desc.is_code_or_data() || ldt_desc.type_field() != 0x2 {
                return Err(Fault::with_selector(EXC_TS, ldt));
            }
            self.install_descriptor(SegReg::Ldtr, ldt, ldt_desc);
        } else {
            self.install_descriptor(SegReg::Ldtr, 0, SegmentDescriptor::from_raw(0));
        }

        self.task_phase = TaskSwitchPhase::LoadSegments;
        self.cpl = (sel[1] & 3) as u8;
        self.reload_task_cs(bus, sel[1])?;
        self.segment_written(bus, SegReg::Ss, sel[2], SegSource::StackLoad)?;
        self.segment_written(bus, SegReg::Es, sel[0], SegSource::Load)?;
        self.segment_written(bus, SegReg::Ds, sel[3], SegSource::Load)?;
        Ok(())
    }

    /// CS reload during a task switch: code segment, DPL matched to RPL.
    fn reload_task_cs(&mut self, bus: &mut Bus, selector: u16) -> ExecResult<()> {
        if self.mode != super::registers::CpuMode::Protected {
            self.install_descriptor(SegReg::Cs, selector, SegmentDescriptor::real_mode(selector));
            return Ok(());
        }
        if selector & !3 == 0 {
            return Err(Fault::with_selector(EXC_TS, selector));
        }
        let raw = self.fetch_descriptor(bus, selector)?;
        let desc = SegmentDescriptor::from_raw(raw);
        if !desc.is_code() {
            return Err(Fault::with_selector(EXC_TS, selector));
        }
        let rpl = (selector & 3) as u8;
        if desc.is_conforming() {
            if desc.dpl() > rpl {
                return Err(Fault::with_selector(EXC_TS, selector));
            }
        } else if desc.dpl() != rpl {
            return Err(Fault::with_selector(EXC_TS, selector));
        }
        if desc.notpresent {
            return Err(Fault::with_selector(EXC_NP, selector));
        }
        self.install_descriptor(SegReg::Cs, selector, desc);
        Ok(())
    }

    /// Flip the busy type bit of a TSS descriptor in the GDT.
    fn set_tss_busy(&mut self, bus: &mut Bus, selector: u16, busy: bool) -> ExecResult<()> {
        let ar_addr = self
            .regs
            .gdtr
            .base
            .wrapping_add((selector & !7) as u32 + 5);
        let ar = self.linear_read_byte(bus, ar_addr)?;
        let updated = if busy { ar | 2 } else { ar & !2 };
        if updated != ar {
            self.linear_write_byte(bus, ar_addr, updated)?;
        }
        Ok(())
    }
}
