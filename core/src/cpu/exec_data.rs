//! Data movement and stack instructions: MOV in all forms, XCHG, LEA,
//! PUSH/POP and their block forms, flag transfers, ENTER/LEAVE, the
//! far-pointer loads, MOVZX/MOVSX, XLAT, I/O port moves, BOUND and ARPL.

use super::descriptor::SegSource;
use super::interrupts::{Fault, EXC_BR, EXC_GP, EXC_UD};
use super::modrm::Operand;
use super::registers::{CpuMode, SegReg, REG_EBP, REG_EBX, REG_ESP};
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::cpu::flags;
use crate::cpu::mmu::MemSeg;

impl Cpu {
    /// MOV r/m,r and r,r/m (88-8B).
    pub fn exec_mov_modrm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let byte_op = opcode & 1 == 0;
        let reg_is_dest = opcode & 2 != 0;
        if byte_op {
            let reg = Operand::Reg8(self.modrm.reg_field());
            let rm = self.modrm.rm8();
            let (dst, src) = if reg_is_dest { (reg, rm) } else { (rm, reg) };
            let value = self.read_op8(bus, src)?;
            self.write_op8(bus, dst, value)?;
        } else {
            let reg = self.modrm.reg_op(self.fetch.operand_size32);
            let rm = self.modrm.rm_op(self.fetch.operand_size32);
            let (dst, src) = if reg_is_dest { (reg, rm) } else { (rm, reg) };
            let value = self.read_op(bus, src)?;
            self.write_op(bus, dst, value)?;
        }
        Ok(())
    }

    /// MOV r/m,imm (C6/C7); the reg field must be 0.
    pub fn exec_mov_imm_rm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.modrm.reg_field() != 0 {
            return Err(Fault::new(EXC_UD));
        }
        if self.fetch.opcode == 0xC6 {
            self.write_op8(bus, self.modrm.rm8(), self.fetch.imm as u8)
        } else {
            let dst = self.modrm.rm_op(self.fetch.operand_size32);
            self.write_op(bus, dst, self.fetch.imm)
        }
    }

    /// MOV reg,imm (B0-BF).
    pub fn exec_mov_reg_imm(&mut self) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        if opcode < 0xB8 {
            self.regs.write8(opcode & 7, self.fetch.imm as u8);
        } else if self.fetch.operand_size32 {
            self.regs.write32(opcode & 7, self.fetch.imm);
        } else {
            self.regs.write16(opcode & 7, self.fetch.imm as u16);
        }
        Ok(())
    }

    /// MOV moffs forms (A0-A3): AL/eAX against a direct offset.
    pub fn exec_mov_moffs(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let seg = self
            .fetch
            .prefixes
            .seg_override
            .unwrap_or(SegReg::Ds);
        let offset = self.fetch.imm;
        let addr16 = !self.fetch.address_size32;
        match opcode {
            0xA0 => {
                let value = self.mmu_rb(bus, MemSeg::Desc(seg), offset, false, addr16)?;
                self.regs.set_al(value);
            }
            0xA1 => {
                if self.fetch.operand_size32 {
                    let value = self.mmu_rdw(bus, MemSeg::Desc(seg), offset, false, addr16)?;
                    self.regs.set_eax(value);
                } else {
                    let value = self.mmu_rw(bus, MemSeg::Desc(seg), offset, false, addr16)?;
                    self.regs.set_ax(value);
                }
            }
            0xA2 => {
                self.mmu_wb(bus, MemSeg::Desc(seg), offset, self.regs.al(), addr16)?;
            }
            _ => {
                if self.fetch.operand_size32 {
                    self.mmu_wdw(bus, MemSeg::Desc(seg), offset, self.regs.eax(), addr16)?;
                } else {
                    self.mmu_ww(bus, MemSeg::Desc(seg), offset, self.regs.ax(), addr16)?;
                }
            }
        }
        Ok(())
    }

    /// MOV r/m16,Sreg (8C) and MOV Sreg,r/m16 (8E).
    pub fn exec_mov_sreg(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let Some(seg) = SegReg::from_sreg_field(self.modrm.reg_field()) else {
            return Err(Fault::new(EXC_UD));
        };
        if self.fetch.opcode == 0x8C {
            let value = self.regs.seg(seg);
            // Register destinations zero-extend on 386+.
            match self.modrm.rm_op(self.fetch.operand_size32) {
                Operand::Reg32(r) => self.regs.write32(r, value as u32),
                op => self.write_op16(bus, op, value)?,
            }
            Ok(())
        } else {
            if seg == SegReg::Cs {
                return Err(Fault::new(EXC_UD));
            }
            let selector = self.read_op16(bus, self.modrm.rm16())?;
            let source = if seg == SegReg::Ss {
                SegSource::StackLoad
            } else {
                SegSource::Load
            };
            self.segment_written(bus, seg, selector, source)?;
            if seg == SegReg::Ss {
                // MOV SS inhibits interrupts for one instruction.
                self.inhibit_interrupts = true;
            }
            Ok(())
        }
    }

    /// XCHG r/m,r (86/87). The memory form asserts the bus lock.
    pub fn exec_xchg(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.modrm.rm_is_mem() && !bus.holds_lock(self.index) {
            bus.request_lock(self.index);
            bus.service_lock_requests();
        }
        if self.fetch.opcode == 0x86 {
            let rm = self.modrm.rm8();
            let reg = self.modrm.reg_field();
            let a = self.read_op8(bus, rm)?;
            let b = self.regs.read8(reg);
            self.write_op8(bus, rm, b)?;
            self.regs.write8(reg, a);
        } else {
            let rm = self.modrm.rm_op(self.fetch.operand_size32);
            let reg = self.modrm.reg_op(self.fetch.operand_size32);
            let a = self.read_op(bus, rm)?;
            let b = self.read_op(bus, reg)?;
            self.write_op(bus, rm, b)?;
            self.write_op(bus, reg, a)?;
        }
        if !self.fetch.prefixes.lock {
            bus.release_lock(self.index);
        }
        Ok(())
    }

    /// XCHG eAX,reg (91-97; 90 is NOP).
    pub fn exec_xchg_acc(&mut self) -> ExecResult<()> {
        let reg = self.fetch.opcode & 7;
        if self.fetch.operand_size32 {
            let a = self.regs.eax();
            let b = self.regs.read32(reg);
            self.regs.set_eax(b);
            self.regs.write32(reg, a);
        } else {
            let a = self.regs.ax();
            let b = self.regs.read16(reg);
            self.regs.set_ax(b);
            self.regs.write16(reg, a);
        }
        Ok(())
    }

    /// LEA r,m (8D). A register r/m is undefined.
    pub fn exec_lea(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let Some(mem) = self.modrm.mem else {
            return Err(Fault::new(EXC_UD));
        };
        let offset = if mem.addr16 {
            mem.offset & 0xFFFF
        } else {
            mem.offset
        };
        self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), offset)
    }

    // ========== Stack ==========

    /// PUSH reg (50-57).
    pub fn exec_push_reg(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let reg = self.fetch.opcode & 7;
        let value = if self.fetch.operand_size32 {
            self.regs.read32(reg)
        } else {
            self.regs.read16(reg) as u32
        };
        self.push_val(bus, value)
    }

    /// POP reg (58-5F).
    pub fn exec_pop_reg(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let reg = self.fetch.opcode & 7;
        let value = self.pop_val(bus)?;
        if self.fetch.operand_size32 {
            self.regs.write32(reg, value);
        } else {
            self.regs.write16(reg, value as u16);
        }
        Ok(())
    }

    /// PUSH imm (68/6A).
    pub fn exec_push_imm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let value = if self.fetch.opcode == 0x6A {
            self.fetch.imm as u8 as i8 as i32 as u32
        } else {
            self.fetch.imm
        };
        self.push_val(bus, value)
    }

    /// PUSH Sreg (06/0E/16/1E, 0FA0/0FA8).
    pub fn exec_push_sreg(&mut self, bus: &mut Bus, seg: SegReg) -> ExecResult<()> {
        let value = self.regs.seg(seg) as u32;
        self.push_val(bus, value)
    }

    /// POP Sreg (07/17/1F, 0FA1/0FA9). POP CS does not exist past the
    /// 8086; the dispatcher never routes it here on later models.
    pub fn exec_pop_sreg(&mut self, bus: &mut Bus, seg: SegReg) -> ExecResult<()> {
        let selector = self.pop_val(bus)? as u16;
        let source = if seg == SegReg::Ss {
            SegSource::StackLoad
        } else {
            SegSource::Load
        };
        self.segment_written(bus, seg, selector, source)?;
        if seg == SegReg::Ss {
            self.inhibit_interrupts = true;
        }
        Ok(())
    }

    /// POP r/m (8F /0).
    pub fn exec_pop_rm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.modrm.reg_field() != 0 {
            return Err(Fault::new(EXC_UD));
        }
        let value = self.pop_val(bus)?;
        let dst = self.modrm.rm_op(self.fetch.operand_size32);
        self.write_op(bus, dst, value)
    }

    /// PUSHA/PUSHAD (60).
    pub fn exec_pusha(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let sp_before = if self.fetch.operand_size32 {
            self.regs.esp()
        } else {
            self.regs.esp() & 0xFFFF
        };
        for reg in 0..8u8 {
            let value = if reg == REG_ESP as u8 {
                sp_before
            } else if self.fetch.operand_size32 {
                self.regs.read32(reg)
            } else {
                self.regs.read16(reg) as u32
            };
            self.push_val(bus, value)?;
        }
        Ok(())
    }

    /// POPA/POPAD (61); the SP slot is discarded.
    pub fn exec_popa(&mut self, bus: &mut Bus) -> ExecResult<()> {
        for reg in (0..8u8).rev() {
            let value = self.pop_val(bus)?;
            if reg == REG_ESP as u8 {
                continue;
            }
            if self.fetch.operand_size32 {
                self.regs.write32(reg, value);
            } else {
                self.regs.write16(reg, value as u16);
            }
        }
        Ok(())
    }

    /// PUSHF/PUSHFD (9C).
    pub fn exec_pushf(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.mode == CpuMode::Virtual8086 && self.regs.iopl() < 3 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        // VM and RF never appear in the pushed image.
        let image = self.regs.eflags & !(flags::VM | flags::RF);
        self.push_val(bus, image)
    }

    /// POPF/POPFD (9D) with the privilege-sensitive bit rules.
    pub fn exec_popf(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.mode == CpuMode::Virtual8086 && self.regs.iopl() < 3 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let popped = self.pop_val(bus)?;
        let old = self.regs.eflags;
        let mut value = if self.fetch.operand_size32 {
            popped
        } else {
            (old & 0xFFFF_0000) | (popped & 0xFFFF)
        };

        // IOPL changes only at CPL 0; IF only at CPL <= IOPL.
        if self.mode != CpuMode::Real {
            if self.cpl > 0 {
                value = (value & !flags::IOPL) | (old & flags::IOPL);
            }
            if self.cpl as u32 > (old & flags::IOPL) >> 12 {
                value = (value & !flags::IF) | (old & flags::IF);
            }
        }
        // VM cannot be set from POPF.
        value = (value & !flags::VM) | (old & flags::VM);
        self.regs.write_eflags(value);
        Ok(())
    }

    /// SAHF (9E) / LAHF (9F).
    pub fn exec_sahf_lahf(&mut self) -> ExecResult<()> {
        if self.fetch.opcode == 0x9E {
            let ah = self.regs.read8(4) as u32;
            let keep = self.regs.eflags & !0xFF;
            self.regs.eflags =
                flags::filter_eflags(self.model, keep | (ah & 0xD5) | flags::RESERVED1);
        } else {
            let low = (self.regs.eflags & 0xFF) as u8;
            self.regs.write8(4, low);
        }
        Ok(())
    }

    /// Flag instructions: CMC/CLC/STC/CLI/STI/CLD/STD (F5, F8-FD).
    pub fn exec_flag_op(&mut self) -> ExecResult<()> {
        match self.fetch.opcode {
            0xF5 => {
                let cf = self.regs.flag(flags::CF);
                self.regs.set_flag(flags::CF, !cf);
            }
            0xF8 => self.regs.set_flag(flags::CF, false),
            0xF9 => self.regs.set_flag(flags::CF, true),
            0xFA | 0xFB => {
                // CLI/STI: IOPL-gated outside real mode.
                if self.mode != CpuMode::Real && self.cpl > self.regs.iopl() {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let enable = self.fetch.opcode == 0xFB;
                if enable && !self.regs.flag(flags::IF) {
                    // STI shadow: the next instruction runs first.
                    self.inhibit_interrupts = true;
                }
                self.regs.set_flag(flags::IF, enable);
            }
            0xFC => self.regs.set_flag(flags::DF, false),
            _ => self.regs.set_flag(flags::DF, true),
        }
        Ok(())
    }

    /// CBW/CWDE (98) and CWD/CDQ (99).
    pub fn exec_sign_extend_acc(&mut self) -> ExecResult<()> {
        if self.fetch.opcode == 0x98 {
            if self.fetch.operand_size32 {
                self.regs.set_eax(self.regs.ax() as i16 as i32 as u32);
            } else {
                self.regs.set_ax(self.regs.al() as i8 as i16 as u16);
            }
        } else if self.fetch.operand_size32 {
            let sign = (self.regs.eax() as i32) >> 31;
            self.regs.write32(2, sign as u32);
        } else {
            let sign = (self.regs.ax() as i16) >> 15;
            self.regs.write16(2, sign as u16);
        }
        Ok(())
    }

    /// XLAT (D7): AL = [seg:(E)BX + AL].
    pub fn exec_xlat(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let seg = self.fetch.prefixes.seg_override.unwrap_or(SegReg::Ds);
        let base = if self.fetch.address_size32 {
            self.regs.read32(REG_EBX as u8)
        } else {
            self.regs.read16(REG_EBX as u8) as u32
        };
        let offset = base.wrapping_add(self.regs.al() as u32);
        let value = self.mmu_rb(bus, MemSeg::Desc(seg), offset, false, !self.fetch.address_size32)?;
        self.regs.set_al(value);
        Ok(())
    }

    /// LDS/LES (C5/C4) and LSS/LFS/LGS (0FB2/B4/B5): load a far pointer
    /// into a segment:register pair.
    pub fn exec_load_far_pointer(&mut self, bus: &mut Bus, seg: SegReg) -> ExecResult<()> {
        let Some(mem) = self.modrm.mem else {
            return Err(Fault::new(EXC_UD));
        };
        let offset = self.read_op(bus, Operand::Mem(mem))?;
        let sel_off = mem
            .offset
            .wrapping_add(if self.fetch.operand_size32 { 4 } else { 2 });
        let selector = self.mmu_rw(bus, MemSeg::Desc(mem.seg), sel_off, false, mem.addr16)?;

        let source = if seg == SegReg::Ss {
            SegSource::StackLoad
        } else {
            SegSource::Load
        };
        self.segment_written(bus, seg, selector, source)?;
        self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), offset)?;
        if seg == SegReg::Ss {
            self.inhibit_interrupts = true;
        }
        Ok(())
    }

    /// MOVZX (0FB6/B7) / MOVSX (0FBE/BF).
    pub fn exec_movzx_movsx(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let sign = opcode >= 0xBE;
        let from_byte = opcode & 1 == 0;
        let value = if from_byte {
            let v = self.read_op8(bus, self.modrm.rm8())?;
            if sign {
                v as i8 as i32 as u32
            } else {
                v as u32
            }
        } else {
            let v = self.read_op16(bus, self.modrm.rm16())?;
            if sign {
                v as i16 as i32 as u32
            } else {
                v as u32
            }
        };
        self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), value)
    }

    /// ENTER (C8): build a stack frame, copying `level` enclosing frame
    /// pointers through the 16- or 32-bit stack.
    pub fn exec_enter(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let alloc = self.fetch.imm as u16;
        let level = (self.fetch.imm2 as u8 & 0x1F) as u32;
        let op32 = self.fetch.operand_size32;

        let bp = self.regs.gpr[REG_EBP];
        self.push_val(bus, if op32 { bp } else { bp & 0xFFFF })?;
        let frame = self.regs.esp();

        if level > 0 {
            let step = if op32 { 4u32 } else { 2 };
            let mut source_bp = bp;
            for _ in 1..level {
                source_bp = source_bp.wrapping_sub(step);
                let slot_off = if self.stack_is_32() {
                    source_bp
                } else {
                    source_bp & 0xFFFF
                };
                let value = if op32 {
                    self.mmu_rdw(bus, MemSeg::Desc(SegReg::Ss), slot_off, false, !self.stack_is_32())?
                } else {
                    self.mmu_rw(bus, MemSeg::Desc(SegReg::Ss), slot_off, false, !self.stack_is_32())?
                        as u32
                };
                self.push_val(bus, value)?;
            }
            self.push_val(bus, frame)?;
        }

        if op32 {
            self.regs.gpr[REG_EBP] = frame;
        } else {
            self.regs.write16(REG_EBP as u8, frame as u16);
        }
        let sp = self.regs.esp().wrapping_sub(alloc as u32);
        if self.stack_is_32() {
            self.regs.set_esp(sp);
        } else {
            self.regs.write16(REG_ESP as u8, sp as u16);
        }
        Ok(())
    }

    /// LEAVE (C9).
    pub fn exec_leave(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let bp = self.regs.gpr[REG_EBP];
        if self.stack_is_32() {
            self.regs.set_esp(bp);
        } else {
            self.regs.write16(REG_ESP as u8, bp as u16);
        }
        let value = self.pop_val(bus)?;
        if self.fetch.operand_size32 {
            self.regs.gpr[REG_EBP] = value;
        } else {
            self.regs.write16(REG_EBP as u8, value as u16);
        }
        Ok(())
    }

    // ========== I/O ==========

    /// IN AL/eAX,imm8 or DX (E4/E5/EC/ED).
    pub fn exec_in(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let port = if opcode & 0x08 != 0 {
            self.regs.read16(2) // DX
        } else {
            self.fetch.imm as u16
        };
        if opcode & 1 == 0 {
            let value = self.io_read(bus, port, 1)?;
            self.regs.set_al(value as u8);
        } else if self.fetch.operand_size32 {
            let value = self.io_read(bus, port, 4)?;
            self.regs.set_eax(value);
        } else {
            let value = self.io_read(bus, port, 2)?;
            self.regs.set_ax(value as u16);
        }
        Ok(())
    }

    /// OUT imm8/DX,AL/eAX (E6/E7/EE/EF).
    pub fn exec_out(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let port = if opcode & 0x08 != 0 {
            self.regs.read16(2)
        } else {
            self.fetch.imm as u16
        };
        if opcode & 1 == 0 {
            self.io_write(bus, port, 1, self.regs.al() as u32)?;
        } else if self.fetch.operand_size32 {
            self.io_write(bus, port, 4, self.regs.eax())?;
        } else {
            self.io_write(bus, port, 2, self.regs.ax() as u32)?;
        }
        Ok(())
    }

    // ========== Checks ==========

    /// BOUND r,m (62): #BR when the index is outside [lower, upper].
    pub fn exec_bound(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let Some(mem) = self.modrm.mem else {
            return Err(Fault::new(EXC_UD));
        };
        if self.fetch.operand_size32 {
            let index = self.regs.read32(self.modrm.reg_field()) as i32;
            let lower = self.read_op32(bus, Operand::Mem(mem))? as i32;
            let upper = self.mmu_rdw(
                bus,
                MemSeg::Desc(mem.seg),
                mem.offset.wrapping_add(4),
                false,
                mem.addr16,
            )? as i32;
            if index < lower || index > upper {
                return Err(Fault::new(EXC_BR));
            }
        } else {
            let index = self.regs.read16(self.modrm.reg_field()) as i16;
            let lower = self.read_op16(bus, Operand::Mem(mem))? as i16;
            let upper = self.mmu_rw(
                bus,
                MemSeg::Desc(mem.seg),
                mem.offset.wrapping_add(2),
                false,
                mem.addr16,
            )? as i16;
            if index < lower || index > upper {
                return Err(Fault::new(EXC_BR));
            }
        }
        Ok(())
    }

    /// ARPL r/m16,r16 (63): protected mode only.
    pub fn exec_arpl(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.mode != CpuMode::Protected {
            return Err(Fault::new(EXC_UD));
        }
        let dst = self.modrm.rm16();
        let dest = self.read_op16(bus, dst)?;
        let src = self.regs.read16(self.modrm.reg_field());
        if dest & 3 < src & 3 {
            self.regs.set_flag(flags::ZF, true);
            self.write_op16(bus, dst, (dest & !3) | (src & 3))?;
        } else {
            self.regs.set_flag(flags::ZF, false);
        }
        Ok(())
    }
}
