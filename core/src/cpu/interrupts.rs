//! Exception and interrupt delivery.
//!
//! Entry is a multi-phase sequence: snapshot restore, IDT entry fetch
//! (which may itself fault), gate dispatch, optional stack switch for an
//! inner ring, the push sequence, target CS checks, and commit. Nested
//! faults escalate: a fault while delivering becomes #DF, a fault while
//! delivering #DF becomes a triple fault and latches the reset-pending
//! flag. `fault_raised` returns `false` once escalation has taken over so
//! callers abandon recovery.

use log::{debug, warn};

use super::descriptor::{SegSource, SegmentDescriptor};
use super::registers::{CpuMode, SegReg, CR4_VME};
use super::{Cpu, ExecResult, RESET_PENDING_TRIPLE};
use crate::bus::Bus;
use crate::cpu::flags;

/// Architectural exception vectors.
pub const EXC_DE: u8 = 0;
pub const EXC_DB: u8 = 1;
pub const EXC_NMI: u8 = 2;
pub const EXC_BP: u8 = 3;
pub const EXC_OF: u8 = 4;
pub const EXC_BR: u8 = 5;
pub const EXC_UD: u8 = 6;
pub const EXC_NM: u8 = 7;
pub const EXC_DF: u8 = 8;
pub const EXC_TS: u8 = 10;
pub const EXC_NP: u8 = 11;
pub const EXC_SS: u8 = 12;
pub const EXC_GP: u8 = 13;
pub const EXC_PF: u8 = 14;
pub const EXC_MF: u8 = 16;
pub const EXC_AC: u8 = 17;

/// Vectors that push an error code.
pub const ERROR_CODE_VECTORS: [u8; 7] = [8, 10, 11, 12, 13, 14, 17];

/// Does `vector` push an error code?
pub fn has_error_code(vector: u8) -> bool {
    ERROR_CODE_VECTORS.contains(&vector)
}

/// An architectural exception in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub vector: u8,
    /// Error code to push, when the vector takes one
    pub error_code: Option<u32>,
    /// Linear address for CR2 (#PF only)
    pub cr2: Option<u32>,
}

impl Fault {
    /// A fault with no error code.
    pub fn new(vector: u8) -> Self {
        Self {
            vector,
            error_code: None,
            cr2: None,
        }
    }

    /// A fault with an explicit error code.
    pub fn with_code(vector: u8, code: u32) -> Self {
        Self {
            vector,
            error_code: Some(code),
            cr2: None,
        }
    }

    /// A selector-indexed fault: the error code is the selector with its
    /// RPL bits cleared (table-indicator bit preserved).
    pub fn with_selector(vector: u8, selector: u16) -> Self {
        Self::with_code(vector, (selector & !3) as u32)
    }

    /// A page fault against `linear` with the 4-bit error code.
    pub fn page_fault(linear: u32, code: u32) -> Self {
        Self {
            vector: EXC_PF,
            error_code: Some(code),
            cr2: Some(linear),
        }
    }
}

/// How an interrupt entered the CPU; gates and privilege checks differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntSource {
    /// Architectural exception
    Exception,
    /// INT n / INT3 / INTO
    Software,
    /// INTR or NMI line
    External,
}

impl Cpu {
    /// Handle a raised fault: roll back to the instruction checkpoint,
    /// classify nesting, and deliver. Returns `false` when the fault
    /// escalated past recovery (double-fault path already armed or triple
    /// fault latched) and the caller must abandon the instruction.
    pub fn fault_raised(&mut self, bus: &mut Bus, fault: Fault) -> bool {
        self.fault_raised_flag = true;

        if self.fault_level >= 2 {
            // Fault while delivering #DF: triple fault, reset the machine.
            warn!(
                "cpu{}: triple fault (vector {:#04X}), requesting reset",
                self.index, fault.vector
            );
            self.reset_pending |= RESET_PENDING_TRIPLE;
            return false;
        }

        let fault = if self.fault_level == 1 {
            debug!(
                "cpu{}: fault {:#04X} during delivery escalates to #DF",
                self.index, fault.vector
            );
            Fault::with_code(EXC_DF, 0)
        } else {
            fault
        };
        self.fault_level += if fault.vector == EXC_DF { 2 } else { 1 };

        // Unwind to the pre-instruction state before dispatching.
        self.restore_checkpoint();

        if let Some(linear) = fault.cr2 {
            self.regs.cr[2] = linear;
        }

        let source = IntSource::Exception;
        match self.interrupt_entry(bus, fault.vector, source, fault.error_code) {
            Ok(()) => {
                self.fault_level = 0;
                true
            }
            Err(nested) => {
                // Recurse: this either delivers #DF or latches the reset.
                self.cycles.exception += 8;
                self.fault_raised(bus, nested)
            }
        }
    }

    /// Poll the hardware interrupt lines at an instruction boundary.
    /// Returns true when an interrupt entry sequence ran.
    pub fn poll_hardware_interrupts(&mut self, bus: &mut Bus) -> bool {
        if self.inhibit_interrupts {
            // MOV SS / POP SS window: skip exactly one boundary.
            self.inhibit_interrupts = false;
            return false;
        }

        // Pentium V86 virtual-interrupt emulation: VIP and VIF together
        // raise #GP(0) at the boundary.
        if self.model >= crate::config::CpuModel::Pentium
            && self.mode == CpuMode::Virtual8086
            && self.regs.cr[4] & CR4_VME != 0
            && self.regs.flag(flags::VIF)
            && self.regs.flag(flags::VIP)
        {
            let fault = Fault::with_code(EXC_GP, 0);
            self.fault_raised(bus, fault);
            return true;
        }

        if self.nmi_pending && !self.nmi_masked {
            self.nmi_pending = false;
            self.nmi_masked = true;
            self.halted = false;
            self.repeating = false;
            self.checkpoint_now();
            let result = self.interrupt_entry(bus, EXC_NMI, IntSource::External, None);
            if let Err(fault) = result {
                self.fault_raised(bus, fault);
            }
            self.cycles.hwop += 50;
            return true;
        }

        if self.regs.flag(flags::IF) {
            if let Some(vector) = bus.devices.pic.pending_vector() {
                bus.devices.pic.acknowledge();
                self.halted = false;
                if self.repeating {
                    // Resume the REP at its prefix byte after IRET.
                    self.regs.eip = self.fetch.rep_resume_eip;
                    self.repeating = false;
                }
                self.checkpoint_now();
                let result = self.interrupt_entry(bus, vector, IntSource::External, None);
                if let Err(fault) = result {
                    self.fault_raised(bus, fault);
                }
                self.cycles.hwop += 61;
                return true;
            }
        }
        false
    }

    /// The interrupt entry sequence proper. Faults bubble up as `Err` for
    /// `fault_raised` to escalate.
    pub fn interrupt_entry(
        &mut self,
        bus: &mut Bus,
        vector: u8,
        source: IntSource,
        error_code: Option<u32>,
    ) -> ExecResult<()> {
        match self.mode {
            CpuMode::Real => self.interrupt_entry_real(bus, vector),
            _ => self.interrupt_entry_protected(bus, vector, source, error_code),
        }
    }

    /// Real-mode entry: IVT lookup, three pushes, vector load.
    fn interrupt_entry_real(&mut self, bus: &mut Bus, vector: u8) -> ExecResult<()> {
        let entry = vector as u32 * 4;
        if entry + 3 > self.regs.idtr.limit as u32 {
            return Err(Fault::with_code(EXC_GP, vector as u32 * 4 + 2));
        }
        let base = self.regs.idtr.base;
        let new_ip = self.linear_read_word(bus, base + entry)?;
        let new_cs = self.linear_read_word(bus, base + entry + 2)?;

        let eflags = self.regs.eflags;
        self.push16(bus, (eflags & 0xFFFF) as u16)?;
        self.push16(bus, self.regs.seg(SegReg::Cs))?;
        self.push16(bus, (self.regs.eip & 0xFFFF) as u16)?;

        self.regs.set_flag(flags::IF | flags::TF, false);
        self.install_descriptor(SegReg::Cs, new_cs, SegmentDescriptor::real_mode(new_cs));
        self.regs.eip = new_ip as u32;
        bus.prefetch_flush(self.index, self.descriptors[SegReg::Cs as usize].base + new_ip as u32);
        Ok(())
    }

    /// Protected-mode entry through the IDT.
    fn interrupt_entry_protected(
        &mut self,
        bus: &mut Bus,
        vector: u8,
        source: IntSource,
        error_code: Option<u32>,
    ) -> ExecResult<()> {
        // External/selector-style error code for IDT-stage faults.
        let idt_index = (vector as u32) << 3;
        let ext = (source == IntSource::External) as u32;

        // Phase 2: fetch the 8-byte IDT entry.
        if idt_index + 7 > self.regs.idtr.limit as u32 {
            return Err(Fault::with_code(EXC_GP, idt_index | 2 | ext));
        }
        let mut raw: u64 = 0;
        for i in 0..8 {
            let byte = self.linear_read_byte(bus, self.regs.idtr.base + idt_index + i)?;
            raw |= (byte as u64) << (8 * i);
        }

        let gate_type = ((raw >> 40) & 0xF) as u8;
        let gate_dpl = ((raw >> 45) & 3) as u8;
        let gate_present = raw >> 47 & 1 != 0;

        // Phase 3: dispatch on gate type.
        let is_32bit_gate = gate_type & 0x8 != 0;
        let is_interrupt_gate = matches!(gate_type & 0x7, 0x6);
        let is_trap_gate = matches!(gate_type & 0x7, 0x7);
        let is_task_gate = gate_type == 0x5;

        if !is_task_gate && !is_interrupt_gate && !is_trap_gate {
            return Err(Fault::with_code(EXC_GP, idt_index | 2 | ext));
        }
        // Software INT checks gate DPL against CPL.
        if source == IntSource::Software && gate_dpl < self.cpl {
            return Err(Fault::with_code(EXC_GP, idt_index | 2));
        }
        if !gate_present {
            return Err(Fault::with_code(EXC_NP, idt_index | 2 | ext));
        }

        if is_task_gate {
            let tss_selector = ((raw >> 16) & 0xFFFF) as u16;
            self.task_switch_to(bus, tss_selector, super::tasking::TaskSwitchReason::Gate, error_code)?;
            return Ok(());
        }

        let target_selector = ((raw >> 16) & 0xFFFF) as u16;
        let offset = (raw & 0xFFFF) as u32 | (((raw >> 48) & 0xFFFF) as u32) << 16;
        let offset = if is_32bit_gate { offset } else { offset & 0xFFFF };

        if target_selector & !3 == 0 {
            return Err(Fault::with_code(EXC_GP, ext));
        }

        // Phase 5: load and verify the target CS descriptor.
        let cs_raw = self.fetch_descriptor(bus, target_selector)?;
        let cs_desc = SegmentDescriptor::from_raw(cs_raw);
        if !cs_desc.is_code() {
            return Err(Fault::with_code(EXC_GP, (target_selector & !3) as u32 | ext));
        }
        if cs_desc.dpl() > self.cpl {
            return Err(Fault::with_code(EXC_GP, (target_selector & !3) as u32 | ext));
        }
        if cs_desc.notpresent {
            return Err(Fault::with_code(EXC_NP, (target_selector & !3) as u32 | ext));
        }

        let from_v86 = self.mode == CpuMode::Virtual8086;
        let old_eflags = self.regs.eflags;
        let old_cs = self.regs.seg(SegReg::Cs);
        let old_eip = self.regs.eip;
        let old_ss = self.regs.seg(SegReg::Ss);
        let old_esp = self.regs.esp();

        // Phase 4: inner-ring stack switch when the handler is more
        // privileged (always out of V86). A conforming handler runs at
        // the interrupted privilege.
        let target_dpl = if cs_desc.is_conforming() {
            self.cpl
        } else {
            cs_desc.dpl()
        };
        let switching_stacks = from_v86 || (!cs_desc.is_conforming() && cs_desc.dpl() < self.cpl);

        if from_v86 && target_dpl != 0 {
            return Err(Fault::with_code(EXC_GP, (target_selector & !3) as u32 | ext));
        }

        if switching_stacks {
            let (new_ss, new_esp) = self.tss_stack_for_ring(bus, target_dpl)?;
            // Install the inner stack before pushing.
            self.cpl = target_dpl;
            self.segment_written(bus, SegReg::Ss, new_ss, SegSource::StackLoad)?;
            self.regs.set_esp(new_esp);

            if from_v86 {
                // V86 entry saves the data segments and loads them null.
                self.push_op(bus, is_32bit_gate, self.regs.seg(SegReg::Gs) as u32)?;
                self.push_op(bus, is_32bit_gate, self.regs.seg(SegReg::Fs) as u32)?;
                self.push_op(bus, is_32bit_gate, self.regs.seg(SegReg::Ds) as u32)?;
                self.push_op(bus, is_32bit_gate, self.regs.seg(SegReg::Es) as u32)?;
                for seg in [SegReg::Gs, SegReg::Fs, SegReg::Ds, SegReg::Es] {
                    let mut null = SegmentDescriptor::from_raw(0);
                    null.notpresent = true;
                    self.install_descriptor(seg, 0, null);
                }
            }
            self.push_op(bus, is_32bit_gate, old_ss as u32)?;
            self.push_op(bus, is_32bit_gate, old_esp)?;
        }

        // Clear VM/NT/TF (and RF in the saved copy) before the pushes of
        // EFLAGS so the handler sees the outgoing values.
        let mut pushed_eflags = old_eflags;
        pushed_eflags &= !flags::RF;

        self.regs.set_flag(flags::VM, false);
        self.mode = super::registers::derive_mode(self.regs.cr[0], self.regs.eflags);

        self.push_op(bus, is_32bit_gate, pushed_eflags)?;
        self.push_op(bus, is_32bit_gate, old_cs as u32)?;
        self.push_op(bus, is_32bit_gate, old_eip)?;

        // Error code push only for the architectural error-code vectors.
        if source == IntSource::Exception && has_error_code(vector) {
            self.push_op(bus, is_32bit_gate, error_code.unwrap_or(0))?;
        }

        // Phase 6: commit.
        self.cpl = target_dpl;
        let selector = (target_selector & !3) | target_dpl as u16;
        self.install_descriptor(SegReg::Cs, selector, cs_desc);
        self.regs.eip = offset;

        self.regs.set_flag(flags::TF | flags::NT | flags::RF, false);
        if is_interrupt_gate {
            self.regs.set_flag(flags::IF, false);
        }
        bus.prefetch_flush(
            self.index,
            self.descriptors[SegReg::Cs as usize].base.wrapping_add(offset),
        );
        Ok(())
    }

    /// Read the ring-`dpl` stack pointer pair from the current TSS.
    pub fn tss_stack_for_ring(&mut self, bus: &mut Bus, dpl: u8) -> ExecResult<(u16, u32)> {
        let tss = &self.descriptors[SegReg::Tr as usize];
        let tss_base = tss.base;
        let is_32 = matches!(tss.type_field(), 0x9 | 0xB);
        let tr_sel = self.regs.seg(SegReg::Tr);
        if is_32 {
            let offset = 4 + dpl as u32 * 8;
            if offset + 5 > tss.limit {
                return Err(Fault::with_selector(EXC_TS, tr_sel));
            }
            let esp = self.linear_read_dword(bus, tss_base + offset)?;
            let ss = self.linear_read_word(bus, tss_base + offset + 4)?;
            Ok((ss, esp))
        } else {
            let offset = 2 + dpl as u32 * 4;
            if offset + 3 > tss.limit {
                return Err(Fault::with_selector(EXC_TS, tr_sel));
            }
            let sp = self.linear_read_word(bus, tss_base + offset)?;
            let ss = self.linear_read_word(bus, tss_base + offset + 2)?;
            Ok((ss, sp as u32))
        }
    }

    /// Push a value sized by the gate width during interrupt entry.
    fn push_op(&mut self, bus: &mut Bus, wide: bool, value: u32) -> ExecResult<()> {
        if wide {
            self.push32(bus, value)
        } else {
            self.push16(bus, value as u16)
        }
    }

    /// Software interrupt helper shared by INT n / INT3 / INTO.
    pub fn software_interrupt(&mut self, bus: &mut Bus, vector: u8) -> ExecResult<()> {
        // V86 with IOPL < 3 refuses INT n (#GP) unless VME redirects it.
        if self.mode == CpuMode::Virtual8086 && self.regs.iopl() < 3 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        self.interrupt_entry(bus, vector, IntSource::Software, None)
    }

    /// Latch the NMI line (edge-triggered).
    pub fn raise_nmi(&mut self) {
        self.nmi_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_vectors() {
        for v in ERROR_CODE_VECTORS {
            assert!(has_error_code(v));
        }
        assert!(!has_error_code(EXC_DE));
        assert!(!has_error_code(EXC_UD));
        assert!(!has_error_code(EXC_NMI));
        assert!(has_error_code(EXC_DF));
        assert!(has_error_code(EXC_AC));
    }

    #[test]
    fn test_fault_constructors() {
        let f = Fault::with_selector(EXC_NP, 0x0043);
        assert_eq!(f.error_code, Some(0x0040));
        let f = Fault::page_fault(0x2000, 0x2);
        assert_eq!(f.vector, EXC_PF);
        assert_eq!(f.cr2, Some(0x2000));
        assert_eq!(f.error_code, Some(2));
    }
}
