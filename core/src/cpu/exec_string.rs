//! String instructions and the REP repeat machine.
//!
//! Each `step` executes at most one element. Under a REP prefix the
//! instruction re-enters itself by parking EIP on the last prefix byte and
//! setting `repeating`; the outer loop polls interrupts between
//! iterations, so an IRQ taken mid-loop IRETs straight back into the REP
//! with (E)CX holding the remaining count. A REP with (E)CX already zero
//! performs no iteration, touches no memory, and changes no flags.

use super::decode::RepKind;
use super::registers::{SegReg, REG_EDI, REG_ESI};
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::cpu::flags;
use crate::cpu::mmu::MemSeg;

impl Cpu {
    /// Element size in bytes for the current string opcode.
    fn string_width(&self) -> u32 {
        if self.fetch.opcode & 1 == 0 {
            1
        } else if self.fetch.operand_size32 {
            4
        } else {
            2
        }
    }

    #[inline]
    fn addr_mask(&self) -> u32 {
        if self.fetch.address_size32 {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    /// Step an index register by the element width, honoring DF.
    fn advance_index(&mut self, reg: usize, width: u32) {
        let mask = self.addr_mask();
        let value = self.regs.gpr[reg];
        let stepped = if self.regs.flag(flags::DF) {
            value.wrapping_sub(width)
        } else {
            value.wrapping_add(width)
        };
        self.regs.gpr[reg] = (value & !mask) | (stepped & mask);
    }

    /// The source segment: DS unless overridden.
    fn source_seg(&self) -> SegReg {
        self.fetch.prefixes.seg_override.unwrap_or(SegReg::Ds)
    }

    /// Dispatch a string opcode (A4-A7, AA-AF, 6C-6F), running one
    /// iteration and managing the REP state.
    pub fn exec_string(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let rep = self.fetch.prefixes.rep;
        let mask = self.addr_mask();

        if rep.is_some() && self.regs.ecx() & mask == 0 {
            // Blocked REP: no iteration, no memory access, no flags.
            self.repeating = false;
            return Ok(());
        }

        let compares = matches!(opcode, 0xA6 | 0xA7 | 0xAE | 0xAF);
        self.string_iteration(bus)?;

        if let Some(rep) = rep {
            let count = self.regs.ecx().wrapping_sub(1);
            self.regs
                .set_ecx((self.regs.ecx() & !mask) | (count & mask));

            let mut keep_going = count & mask != 0;
            if compares {
                let zf = self.regs.flag(flags::ZF);
                keep_going &= match rep {
                    RepKind::Repe => zf,
                    RepKind::Repne => !zf,
                };
            }
            if keep_going {
                // Park EIP on the prefix so the next step re-enters, and
                // so an interrupt return resumes the loop.
                self.regs.eip = self.fetch.rep_resume_eip;
                self.repeating = true;
            } else {
                self.repeating = false;
            }
        }
        Ok(())
    }

    /// One element of the current string opcode.
    fn string_iteration(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let width = self.string_width();
        let addr16 = !self.fetch.address_size32;
        let mask = self.addr_mask();
        let si = self.regs.gpr[REG_ESI] & mask;
        let di = self.regs.gpr[REG_EDI] & mask;
        let src_seg = self.source_seg();

        match self.fetch.opcode {
            // MOVS: DS:(E)SI -> ES:(E)DI
            0xA4 | 0xA5 => {
                let value = self.read_string_element(bus, src_seg, si, width, addr16)?;
                self.write_string_element(bus, di, width, addr16, value)?;
                self.advance_index(REG_ESI, width);
                self.advance_index(REG_EDI, width);
            }
            // CMPS: compare DS:(E)SI with ES:(E)DI
            0xA6 | 0xA7 => {
                let a = self.read_string_element(bus, src_seg, si, width, addr16)?;
                let b = self.read_string_element_es(bus, di, width, addr16)?;
                self.string_compare(a, b, width);
                self.advance_index(REG_ESI, width);
                self.advance_index(REG_EDI, width);
            }
            // STOS: AL/eAX -> ES:(E)DI
            0xAA | 0xAB => {
                let value = self.acc_value(width);
                self.write_string_element(bus, di, width, addr16, value)?;
                self.advance_index(REG_EDI, width);
            }
            // LODS: DS:(E)SI -> AL/eAX
            0xAC | 0xAD => {
                let value = self.read_string_element(bus, src_seg, si, width, addr16)?;
                self.set_acc_value(width, value);
                self.advance_index(REG_ESI, width);
            }
            // SCAS: compare AL/eAX with ES:(E)DI
            0xAE | 0xAF => {
                let a = self.acc_value(width);
                let b = self.read_string_element_es(bus, di, width, addr16)?;
                self.string_compare(a, b, width);
                self.advance_index(REG_EDI, width);
            }
            // INS: port DX -> ES:(E)DI
            0x6C | 0x6D => {
                let port = self.regs.read16(2);
                let value = self.io_read(bus, port, width as u8)?;
                self.write_string_element(bus, di, width, addr16, value)?;
                self.advance_index(REG_EDI, width);
            }
            // OUTS: DS:(E)SI -> port DX
            _ => {
                let port = self.regs.read16(2);
                let value = self.read_string_element(bus, src_seg, si, width, addr16)?;
                self.io_write(bus, port, width as u8, value)?;
                self.advance_index(REG_ESI, width);
            }
        }
        Ok(())
    }

    fn read_string_element(
        &mut self,
        bus: &mut Bus,
        seg: SegReg,
        offset: u32,
        width: u32,
        addr16: bool,
    ) -> ExecResult<u32> {
        match width {
            1 => Ok(self.mmu_rb(bus, MemSeg::Desc(seg), offset, false, addr16)? as u32),
            2 => Ok(self.mmu_rw(bus, MemSeg::Desc(seg), offset, false, addr16)? as u32),
            _ => self.mmu_rdw(bus, MemSeg::Desc(seg), offset, false, addr16),
        }
    }

    /// ES-relative read ignoring overrides (string destination rule).
    fn read_string_element_es(
        &mut self,
        bus: &mut Bus,
        offset: u32,
        width: u32,
        addr16: bool,
    ) -> ExecResult<u32> {
        match width {
            1 => Ok(self.mmu_rb(bus, MemSeg::EsLiteral, offset, false, addr16)? as u32),
            2 => Ok(self.mmu_rw(bus, MemSeg::EsLiteral, offset, false, addr16)? as u32),
            _ => self.mmu_rdw(bus, MemSeg::EsLiteral, offset, false, addr16),
        }
    }

    fn write_string_element(
        &mut self,
        bus: &mut Bus,
        offset: u32,
        width: u32,
        addr16: bool,
        value: u32,
    ) -> ExecResult<()> {
        match width {
            1 => self.mmu_wb(bus, MemSeg::EsLiteral, offset, value as u8, addr16),
            2 => self.mmu_ww(bus, MemSeg::EsLiteral, offset, value as u16, addr16),
            _ => self.mmu_wdw(bus, MemSeg::EsLiteral, offset, value, addr16),
        }
    }

    fn string_compare(&mut self, a: u32, b: u32, width: u32) {
        match width {
            1 => {
                let (a, b) = (a as u8, b as u8);
                self.alu.flag_sub8(&mut self.regs.eflags, a, b);
            }
            2 => {
                let (a, b) = (a as u16, b as u16);
                self.alu.flag_sub16(&mut self.regs.eflags, a, b);
            }
            _ => {
                self.alu.flag_sub32(&mut self.regs.eflags, a, b);
            }
        }
    }

    fn acc_value(&self, width: u32) -> u32 {
        match width {
            1 => self.regs.al() as u32,
            2 => self.regs.ax() as u32,
            _ => self.regs.eax(),
        }
    }

    fn set_acc_value(&mut self, width: u32, value: u32) {
        match width {
            1 => self.regs.set_al(value as u8),
            2 => self.regs.set_ax(value as u16),
            _ => self.regs.set_eax(value),
        }
    }
}
