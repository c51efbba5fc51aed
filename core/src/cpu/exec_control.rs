//! Control transfers and the instruction dispatcher.
//!
//! Near branches are simple EIP arithmetic. Far transfers dispatch on the
//! target descriptor type: plain code segment, call gate (with the
//! parameter-copy staging buffer on inner-ring calls), TSS descriptor, or
//! task gate. IRET additionally unwinds nested tasks (NT) and the V86
//! save area.

use super::descriptor::{SegSource, SegmentDescriptor};
use super::interrupts::{Fault, IntSource, EXC_GP, EXC_NP, EXC_OF, EXC_SS, EXC_UD};
use super::registers::{derive_mode, CpuMode, SegReg};
use super::tasking::TaskSwitchReason;
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::cpu::flags;
use crate::cpu::mmu::MemSeg;

impl Cpu {
    /// Execute the instruction currently held in `fetch`/`modrm`.
    pub(crate) fn execute_instruction(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.fetch.is_0f {
            return self.execute_0f(bus);
        }
        match self.fetch.opcode {
            0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B | 0x20..=0x23
            | 0x28..=0x2B | 0x30..=0x33 | 0x38..=0x3B => self.exec_alu_modrm(bus),
            0x04 | 0x05 | 0x0C | 0x0D | 0x14 | 0x15 | 0x1C | 0x1D | 0x24 | 0x25 | 0x2C
            | 0x2D | 0x34 | 0x35 | 0x3C | 0x3D => self.exec_alu_acc_imm(bus),
            0x06 => self.exec_push_sreg(bus, SegReg::Es),
            0x07 => self.exec_pop_sreg(bus, SegReg::Es),
            0x0E => self.exec_push_sreg(bus, SegReg::Cs),
            // POP CS exists on the 8086 alone; 286+ turned 0F into the
            // escape byte before decode reaches here.
            0x0F => self.exec_pop_sreg(bus, SegReg::Cs),
            0x16 => self.exec_push_sreg(bus, SegReg::Ss),
            0x17 => self.exec_pop_sreg(bus, SegReg::Ss),
            0x1E => self.exec_push_sreg(bus, SegReg::Ds),
            0x1F => self.exec_pop_sreg(bus, SegReg::Ds),
            0x27 => self.exec_daa_das(false),
            0x2F => self.exec_daa_das(true),
            0x37 => self.exec_aaa_aas(false),
            0x3F => self.exec_aaa_aas(true),
            0x40..=0x4F => self.exec_inc_dec_reg(bus),
            0x50..=0x57 => self.exec_push_reg(bus),
            0x58..=0x5F => self.exec_pop_reg(bus),
            0x60 => self.exec_pusha(bus),
            0x61 => self.exec_popa(bus),
            0x62 => self.exec_bound(bus),
            0x63 => self.exec_arpl(bus),
            0x68 | 0x6A => self.exec_push_imm(bus),
            0x69 | 0x6B => self.exec_imul_two_three(bus),
            0x6C..=0x6F => self.exec_string(bus),
            0x70..=0x7F => self.exec_jcc_short(bus),
            0x80..=0x83 => self.exec_group1(bus),
            0x84 | 0x85 | 0xA8 | 0xA9 => self.exec_test(bus),
            0x86 | 0x87 => self.exec_xchg(bus),
            0x88..=0x8B => self.exec_mov_modrm(bus),
            0x8C | 0x8E => self.exec_mov_sreg(bus),
            0x8D => self.exec_lea(bus),
            0x8F => self.exec_pop_rm(bus),
            0x90..=0x97 => self.exec_xchg_acc(),
            0x98 | 0x99 => self.exec_sign_extend_acc(),
            0x9A => self.exec_call_far_imm(bus),
            0x9B => self.exec_wait(),
            0x9C => self.exec_pushf(bus),
            0x9D => self.exec_popf(bus),
            0x9E | 0x9F => self.exec_sahf_lahf(),
            0xA0..=0xA3 => self.exec_mov_moffs(bus),
            0xA4..=0xA7 | 0xAA..=0xAF => self.exec_string(bus),
            0xB0..=0xBF => self.exec_mov_reg_imm(),
            0xC0 | 0xC1 | 0xD0..=0xD3 => self.exec_group2(bus),
            0xC2 | 0xC3 => self.exec_ret_near(bus),
            0xC4 => self.exec_load_far_pointer(bus, SegReg::Es),
            0xC5 => self.exec_load_far_pointer(bus, SegReg::Ds),
            0xC6 | 0xC7 => self.exec_mov_imm_rm(bus),
            0xC8 => self.exec_enter(bus),
            0xC9 => self.exec_leave(bus),
            0xCA | 0xCB => self.exec_ret_far(bus),
            0xCC => self.software_interrupt(bus, 3),
            0xCD => self.software_interrupt(bus, self.fetch.imm as u8),
            0xCE => self.exec_into(bus),
            0xCF => self.exec_iret(bus),
            0xD4 => self.exec_aam(),
            0xD5 => self.exec_aad(),
            0xD6 => self.exec_salc(),
            0xD7 => self.exec_xlat(bus),
            0xD8..=0xDF => self.exec_fpu_escape(bus),
            0xE0..=0xE2 => self.exec_loop(bus),
            0xE3 => self.exec_jcxz(bus),
            0xE4 | 0xE5 | 0xEC | 0xED => self.exec_in(bus),
            0xE6 | 0xE7 | 0xEE | 0xEF => self.exec_out(bus),
            0xE8 => self.exec_call_near_rel(bus),
            0xE9 | 0xEB => self.exec_jmp_rel(bus),
            0xEA => self.exec_jmp_far_imm(bus),
            0xF1 => self.software_interrupt(bus, 1),
            0xF4 => self.exec_hlt(),
            0xF5 | 0xF8..=0xFD => self.exec_flag_op(),
            0xF6 | 0xF7 => self.exec_group3(bus),
            0xFE => self.exec_inc_dec_rm8(bus),
            0xFF => self.exec_group5(bus),
            _ => Err(Fault::new(EXC_UD)),
        }
    }

    /// 0F-map dispatcher.
    fn execute_0f(&mut self, bus: &mut Bus) -> ExecResult<()> {
        use crate::config::CpuModel;
        match self.fetch.opcode {
            0x00 => self.exec_group6(bus),
            0x01 => self.exec_group7(bus),
            0x02 => self.exec_lar(bus),
            0x03 => self.exec_lsl(bus),
            0x05 => self.exec_loadall286(bus),
            0x06 => self.exec_clts(),
            0x07 => self.exec_loadall386(bus),
            0x08 | 0x09 => self.exec_cache_flush(),
            0x20..=0x23 => self.exec_mov_control(bus),
            0x24 | 0x26 => self.exec_mov_test_reg(bus),
            0x30 => self.exec_wrmsr(),
            0x31 => self.exec_rdtsc(),
            0x32 => self.exec_rdmsr(),
            0x40..=0x4F if self.model >= CpuModel::PentiumPro => self.exec_cmov(bus),
            0x80..=0x8F => self.exec_jcc_near(bus),
            0x90..=0x9F => self.exec_setcc(bus),
            0xA0 => self.exec_push_sreg(bus, SegReg::Fs),
            0xA1 => self.exec_pop_sreg(bus, SegReg::Fs),
            0xA2 => self.exec_cpuid(),
            0xA3 => self.exec_bit_op(bus, 0, false),
            0xA4 | 0xA5 => self.exec_shift_double(bus, false),
            0xA8 => self.exec_push_sreg(bus, SegReg::Gs),
            0xA9 => self.exec_pop_sreg(bus, SegReg::Gs),
            0xAB => self.exec_bit_op(bus, 1, false),
            0xAC | 0xAD => self.exec_shift_double(bus, true),
            0xAF => self.exec_imul_two_three(bus),
            0xB0 | 0xB1 if self.model >= CpuModel::I80486 => self.exec_cmpxchg(bus),
            0xB2 => self.exec_load_far_pointer(bus, SegReg::Ss),
            0xB3 => self.exec_bit_op(bus, 2, false),
            0xB4 => self.exec_load_far_pointer(bus, SegReg::Fs),
            0xB5 => self.exec_load_far_pointer(bus, SegReg::Gs),
            0xB6 | 0xB7 | 0xBE | 0xBF => self.exec_movzx_movsx(bus),
            0xBA => self.exec_group8(bus),
            0xBB => self.exec_bit_op(bus, 3, false),
            0xBC => self.exec_bit_scan(bus, false),
            0xBD => self.exec_bit_scan(bus, true),
            0xC0 | 0xC1 if self.model >= CpuModel::I80486 => self.exec_xadd(bus),
            0xC7 if self.model >= CpuModel::Pentium => self.exec_cmpxchg8b(bus),
            0xC8..=0xCF => self.exec_bswap(),
            _ => Err(Fault::new(EXC_UD)),
        }
    }

    /// Group 8 (0FBA): BT/BTS/BTR/BTC with an immediate index.
    fn exec_group8(&mut self, bus: &mut Bus) -> ExecResult<()> {
        match self.modrm.reg_field() {
            4 => self.exec_bit_op(bus, 0, true),
            5 => self.exec_bit_op(bus, 1, true),
            6 => self.exec_bit_op(bus, 2, true),
            7 => self.exec_bit_op(bus, 3, true),
            _ => Err(Fault::new(EXC_UD)),
        }
    }

    /// Group 5 (FF): INC/DEC/CALL/JMP/PUSH on r/m.
    fn exec_group5(&mut self, bus: &mut Bus) -> ExecResult<()> {
        match self.modrm.reg_field() {
            0 => self.exec_inc_dec_rm(bus, false),
            1 => self.exec_inc_dec_rm(bus, true),
            2 => {
                // CALL near r/m
                let target = self.read_op(bus, self.modrm.rm_op(self.fetch.operand_size32))?;
                self.push_val(bus, self.regs.eip)?;
                self.jump_near(bus, target)
            }
            3 => {
                // CALL far m16:16/32
                let (selector, offset) = self.read_far_operand(bus)?;
                self.far_call(bus, selector, offset)
            }
            4 => {
                let target = self.read_op(bus, self.modrm.rm_op(self.fetch.operand_size32))?;
                self.jump_near(bus, target)
            }
            5 => {
                let (selector, offset) = self.read_far_operand(bus)?;
                self.far_jump(bus, selector, offset)
            }
            6 => {
                let value = self.read_op(bus, self.modrm.rm_op(self.fetch.operand_size32))?;
                self.push_val(bus, value)
            }
            _ => Err(Fault::new(EXC_UD)),
        }
    }

    /// Read the m16:16/m16:32 operand of a far CALL/JMP through memory.
    fn read_far_operand(&mut self, bus: &mut Bus) -> ExecResult<(u16, u32)> {
        let Some(mem) = self.modrm.mem else {
            return Err(Fault::new(EXC_UD));
        };
        let offset = if self.fetch.operand_size32 {
            self.mmu_rdw(bus, MemSeg::Desc(mem.seg), mem.offset, false, mem.addr16)?
        } else {
            self.mmu_rw(bus, MemSeg::Desc(mem.seg), mem.offset, false, mem.addr16)? as u32
        };
        let sel_off = mem
            .offset
            .wrapping_add(if self.fetch.operand_size32 { 4 } else { 2 });
        let selector = self.mmu_rw(bus, MemSeg::Desc(mem.seg), sel_off, false, mem.addr16)?;
        Ok((selector, offset))
    }

    // ========== Conditions ==========

    /// Evaluate condition code `cc` (low nibble of the opcode).
    pub fn cond(&self, cc: u8) -> bool {
        let f = self.regs.eflags;
        let of = f & flags::OF != 0;
        let cf = f & flags::CF != 0;
        let zf = f & flags::ZF != 0;
        let sf = f & flags::SF != 0;
        let pf = f & flags::PF != 0;
        let result = match cc >> 1 {
            0 => of,
            1 => cf,
            2 => zf,
            3 => cf || zf,
            4 => sf,
            5 => pf,
            6 => sf != of,
            _ => zf || sf != of,
        };
        result ^ (cc & 1 != 0)
    }

    /// Jcc rel8 (70-7F).
    fn exec_jcc_short(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.cond(self.fetch.opcode & 0xF) {
            let target = self
                .regs
                .eip
                .wrapping_add(self.fetch.imm as u8 as i8 as i32 as u32);
            self.jump_near(bus, target)?;
            self.cycles.op += 4;
        }
        Ok(())
    }

    /// Jcc rel16/32 (0F80-8F).
    fn exec_jcc_near(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.cond(self.fetch.opcode & 0xF) {
            let disp = if self.fetch.operand_size32 {
                self.fetch.imm
            } else {
                self.fetch.imm as u16 as i16 as i32 as u32
            };
            let target = self.regs.eip.wrapping_add(disp);
            self.jump_near(bus, target)?;
            self.cycles.op += 4;
        }
        Ok(())
    }

    /// SETcc r/m8 (0F90-9F).
    fn exec_setcc(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let value = self.cond(self.fetch.opcode & 0xF) as u8;
        self.write_op8(bus, self.modrm.rm8(), value)
    }

    /// CMOVcc (0F40-4F), Pentium Pro+.
    fn exec_cmov(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let value = self.read_op(bus, self.modrm.rm_op(self.fetch.operand_size32))?;
        if self.cond(self.fetch.opcode & 0xF) {
            self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), value)?;
        }
        Ok(())
    }

    /// LOOP/LOOPE/LOOPNE (E2/E1/E0).
    fn exec_loop(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let mask = if self.fetch.address_size32 {
            0xFFFF_FFFF
        } else {
            0xFFFF
        };
        let count = self.regs.ecx().wrapping_sub(1);
        self.regs
            .set_ecx((self.regs.ecx() & !mask) | (count & mask));
        let mut taken = count & mask != 0;
        match self.fetch.opcode {
            0xE0 => taken &= !self.regs.flag(flags::ZF),
            0xE1 => taken &= self.regs.flag(flags::ZF),
            _ => {}
        }
        if taken {
            let target = self
                .regs
                .eip
                .wrapping_add(self.fetch.imm as u8 as i8 as i32 as u32);
            self.jump_near(bus, target)?;
        }
        Ok(())
    }

    /// JCXZ/JECXZ (E3).
    fn exec_jcxz(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let count = if self.fetch.address_size32 {
            self.regs.ecx()
        } else {
            self.regs.ecx() & 0xFFFF
        };
        if count == 0 {
            let target = self
                .regs
                .eip
                .wrapping_add(self.fetch.imm as u8 as i8 as i32 as u32);
            self.jump_near(bus, target)?;
        }
        Ok(())
    }

    /// JMP rel8/rel16/rel32 (EB/E9).
    fn exec_jmp_rel(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let disp = if self.fetch.opcode == 0xEB {
            self.fetch.imm as u8 as i8 as i32 as u32
        } else if self.fetch.operand_size32 {
            self.fetch.imm
        } else {
            self.fetch.imm as u16 as i16 as i32 as u32
        };
        let target = self.regs.eip.wrapping_add(disp);
        self.jump_near(bus, target)
    }

    /// CALL rel16/32 (E8).
    fn exec_call_near_rel(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let disp = if self.fetch.operand_size32 {
            self.fetch.imm
        } else {
            self.fetch.imm as u16 as i16 as i32 as u32
        };
        self.push_val(bus, self.regs.eip)?;
        let target = self.regs.eip.wrapping_add(disp);
        self.jump_near(bus, target)
    }

    /// Commit a near jump: mask by operand size, bounds-check against CS,
    /// flush the prefetch queue.
    pub fn jump_near(&mut self, bus: &mut Bus, target: u32) -> ExecResult<()> {
        let target = if self.fetch.operand_size32 {
            target
        } else {
            target & 0xFFFF
        };
        let cs_base = self.descriptors[SegReg::Cs as usize].base;
        if !self.descriptors[SegReg::Cs as usize].limit_check(target, 1) {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        self.regs.eip = target;
        bus.prefetch_flush(self.index, cs_base.wrapping_add(target));
        Ok(())
    }

    /// JMP ptr16:16/32 (EA).
    fn exec_jmp_far_imm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let selector = self.fetch.imm2 as u16;
        let offset = self.fetch.imm;
        self.far_jump(bus, selector, offset)
    }

    /// CALL ptr16:16/32 (9A).
    fn exec_call_far_imm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let selector = self.fetch.imm2 as u16;
        let offset = self.fetch.imm;
        self.far_call(bus, selector, offset)
    }

    // ========== Far transfer machinery ==========

    /// Far JMP to selector:offset with full descriptor-type dispatch.
    pub fn far_jump(&mut self, bus: &mut Bus, selector: u16, offset: u32) -> ExecResult<()> {
        if self.mode != CpuMode::Protected {
            self.install_descriptor(SegReg::Cs, selector, SegmentDescriptor::real_mode(selector));
            self.regs.eip = if self.fetch.operand_size32 {
                offset
            } else {
                offset & 0xFFFF
            };
            bus.prefetch_flush(
                self.index,
                self.descriptors[SegReg::Cs as usize]
                    .base
                    .wrapping_add(self.regs.eip),
            );
            return Ok(());
        }

        if selector & !3 == 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let raw = self.fetch_descriptor(bus, selector)?;
        let desc = SegmentDescriptor::from_raw(raw);

        if desc.is_code() {
            self.check_cs_target(&desc, selector)?;
            self.load_cs_checked(bus, selector, desc, offset)?;
            return Ok(());
        }

        match desc.type_field() {
            0x1 | 0x9 => self.task_switch_to(bus, selector, TaskSwitchReason::Jmp, None),
            0x5 => {
                let tss_selector = ((raw >> 16) & 0xFFFF) as u16;
                self.task_switch_to(bus, tss_selector, TaskSwitchReason::Jmp, None)
            }
            0x4 | 0xC => {
                // Jump through a call gate: same-privilege entry only.
                let (target_sel, target_off, _params, _wide) =
                    self.read_call_gate(&desc, selector)?;
                let raw = self.fetch_descriptor(bus, target_sel)?;
                let target = SegmentDescriptor::from_raw(raw);
                self.check_cs_target(&target, target_sel)?;
                if !target.is_conforming() && target.dpl() != self.cpl {
                    return Err(Fault::with_selector(EXC_GP, target_sel));
                }
                self.load_cs_checked(bus, target_sel, target, target_off)
            }
            _ => Err(Fault::with_selector(EXC_GP, selector)),
        }
    }

    /// Far CALL to selector:offset, including inner-ring call gates with
    /// parameter copying through the staging buffer.
    pub fn far_call(&mut self, bus: &mut Bus, selector: u16, offset: u32) -> ExecResult<()> {
        if self.mode != CpuMode::Protected {
            self.push_val(bus, self.regs.seg(SegReg::Cs) as u32)?;
            self.push_val(bus, self.regs.eip)?;
            self.install_descriptor(SegReg::Cs, selector, SegmentDescriptor::real_mode(selector));
            self.regs.eip = if self.fetch.operand_size32 {
                offset
            } else {
                offset & 0xFFFF
            };
            bus.prefetch_flush(
                self.index,
                self.descriptors[SegReg::Cs as usize]
                    .base
                    .wrapping_add(self.regs.eip),
            );
            return Ok(());
        }

        if selector & !3 == 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let raw = self.fetch_descriptor(bus, selector)?;
        let desc = SegmentDescriptor::from_raw(raw);

        if desc.is_code() {
            self.check_cs_target(&desc, selector)?;
            self.push_val(bus, self.regs.seg(SegReg::Cs) as u32)?;
            self.push_val(bus, self.regs.eip)?;
            self.load_cs_checked(bus, selector, desc, offset)?;
            return Ok(());
        }

        match desc.type_field() {
            0x1 | 0x9 => self.task_switch_to(bus, selector, TaskSwitchReason::Call, None),
            0x5 => {
                let tss_selector = ((raw >> 16) & 0xFFFF) as u16;
                self.task_switch_to(bus, tss_selector, TaskSwitchReason::Call, None)
            }
            0x4 | 0xC => self.call_through_gate(bus, &desc, selector),
            _ => Err(Fault::with_selector(EXC_GP, selector)),
        }
    }

    /// Validate a call-gate descriptor against CPL/RPL and unpack it.
    fn read_call_gate(
        &self,
        gate: &SegmentDescriptor,
        selector: u16,
    ) -> ExecResult<(u16, u32, u8, bool)> {
        let rpl = (selector & 3) as u8;
        if gate.dpl() < self.cpl || gate.dpl() < rpl {
            return Err(Fault::with_selector(EXC_GP, selector));
        }
        if gate.notpresent {
            return Err(Fault::with_selector(EXC_NP, selector));
        }
        let raw = gate.raw;
        let wide = gate.type_field() == 0xC;
        let target_sel = ((raw >> 16) & 0xFFFF) as u16;
        let mut target_off = (raw & 0xFFFF) as u32;
        if wide {
            target_off |= (((raw >> 48) & 0xFFFF) as u32) << 16;
        }
        let params = ((raw >> 32) & 0x1F) as u8;
        if target_sel & !3 == 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        Ok((target_sel, target_off, params, wide))
    }

    /// CALL through a call gate, switching stacks when the target ring is
    /// more privileged.
    fn call_through_gate(
        &mut self,
        bus: &mut Bus,
        gate: &SegmentDescriptor,
        gate_selector: u16,
    ) -> ExecResult<()> {
        let (target_sel, target_off, param_count, wide) =
            self.read_call_gate(gate, gate_selector)?;
        let raw = self.fetch_descriptor(bus, target_sel)?;
        let target = SegmentDescriptor::from_raw(raw);
        self.check_cs_target(&target, target_sel)?;

        let entering_inner = !target.is_conforming() && target.dpl() < self.cpl;
        if entering_inner {
            let old_ss = self.regs.seg(SegReg::Ss);
            let old_esp = self.regs.esp();
            let old_cs = self.regs.seg(SegReg::Cs);
            let old_eip = self.regs.eip;

            // Stage the parameters from the outgoing stack.
            let param_count = param_count as usize & 0x1F;
            for i in 0..param_count {
                let offset = old_esp.wrapping_add(
                    (i as u32) * if wide { 4 } else { 2 },
                );
                let value = if wide {
                    self.mmu_rdw(bus, MemSeg::Desc(SegReg::Ss), offset, false, !self.stack_is_32())?
                } else {
                    self.mmu_rw(bus, MemSeg::Desc(SegReg::Ss), offset, false, !self.stack_is_32())?
                        as u32
                };
                self.call_gate_stack[i] = value;
            }

            let target_dpl = target.dpl();
            let (new_ss, new_esp) = self.tss_stack_for_ring(bus, target_dpl)?;
            if new_ss & !3 == 0 {
                return Err(Fault::with_code(EXC_SS, 0));
            }
            self.cpl = target_dpl;
            self.segment_written(bus, SegReg::Ss, new_ss, SegSource::StackLoad)?;
            self.regs.set_esp(new_esp);

            // Old stack pointer, staged parameters, then the return far
            // pointer, all on the inner stack.
            self.push_gate(bus, wide, old_ss as u32)?;
            self.push_gate(bus, wide, old_esp)?;
            for i in (0..param_count).rev() {
                let value = self.call_gate_stack[i];
                self.push_gate(bus, wide, value)?;
            }
            self.push_gate(bus, wide, old_cs as u32)?;
            self.push_gate(bus, wide, old_eip)?;

            let selector = (target_sel & !3) | target_dpl as u16;
            self.install_descriptor(SegReg::Cs, selector, target);
            self.regs.eip = if wide { target_off } else { target_off & 0xFFFF };
            bus.prefetch_flush(
                self.index,
                self.descriptors[SegReg::Cs as usize]
                    .base
                    .wrapping_add(self.regs.eip),
            );
            Ok(())
        } else {
            if !target.is_conforming() && target.dpl() != self.cpl {
                return Err(Fault::with_selector(EXC_GP, target_sel));
            }
            self.push_gate(bus, wide, self.regs.seg(SegReg::Cs) as u32)?;
            self.push_gate(bus, wide, self.regs.eip)?;
            self.load_cs_checked(bus, target_sel, target, target_off)
        }
    }

    fn push_gate(&mut self, bus: &mut Bus, wide: bool, value: u32) -> ExecResult<()> {
        if wide {
            self.push32(bus, value)
        } else {
            self.push16(bus, value as u16)
        }
    }

    /// Shared checks for a far-transfer code-segment target.
    fn check_cs_target(&self, desc: &SegmentDescriptor, selector: u16) -> ExecResult<()> {
        if !desc.is_code() {
            return Err(Fault::with_selector(EXC_GP, selector));
        }
        let rpl = (selector & 3) as u8;
        if desc.is_conforming() {
            // Conforming: enterable from equal or lesser privilege; CPL
            // does not change.
            if desc.dpl() > self.cpl {
                return Err(Fault::with_selector(EXC_GP, selector));
            }
        } else {
            if rpl > self.cpl || desc.dpl() != self.cpl {
                return Err(Fault::with_selector(EXC_GP, selector));
            }
        }
        if desc.notpresent {
            return Err(Fault::with_selector(EXC_NP, selector));
        }
        Ok(())
    }

    /// Install a verified CS and land at `offset`.
    fn load_cs_checked(
        &mut self,
        bus: &mut Bus,
        selector: u16,
        desc: SegmentDescriptor,
        offset: u32,
    ) -> ExecResult<()> {
        let offset = if self.fetch.operand_size32 {
            offset
        } else {
            offset & 0xFFFF
        };
        if !desc.limit_check(offset, 1) {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        self.mark_descriptor_accessed(bus, selector)?;
        // CPL survives a conforming transfer; the cached selector RPL
        // reflects the current privilege.
        let selector = (selector & !3) | self.cpl as u16;
        self.install_descriptor(SegReg::Cs, selector, desc);
        self.regs.eip = offset;
        bus.prefetch_flush(
            self.index,
            self.descriptors[SegReg::Cs as usize]
                .base
                .wrapping_add(offset),
        );
        Ok(())
    }

    // ========== Returns ==========

    /// RET near (C3) / RET imm16 (C2).
    fn exec_ret_near(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let target = self.pop_val(bus)?;
        if self.fetch.opcode == 0xC2 {
            let adjust = self.fetch.imm & 0xFFFF;
            let mask = if self.stack_is_32() { 0xFFFF_FFFF } else { 0xFFFF };
            let sp = self.regs.esp().wrapping_add(adjust) & mask;
            self.regs.set_esp((self.regs.esp() & !mask) | sp);
        }
        self.jump_near(bus, target)
    }

    /// RETF (CB) / RETF imm16 (CA).
    fn exec_ret_far(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let offset = self.pop_val(bus)?;
        let selector = self.pop_val(bus)? as u16;
        let adjust = if self.fetch.opcode == 0xCA {
            self.fetch.imm & 0xFFFF
        } else {
            0
        };

        if self.mode != CpuMode::Protected {
            self.install_descriptor(SegReg::Cs, selector, SegmentDescriptor::real_mode(selector));
            self.regs.eip = if self.fetch.operand_size32 {
                offset
            } else {
                offset & 0xFFFF
            };
            self.adjust_sp(adjust);
            bus.prefetch_flush(
                self.index,
                self.descriptors[SegReg::Cs as usize]
                    .base
                    .wrapping_add(self.regs.eip),
            );
            return Ok(());
        }

        let rpl = (selector & 3) as u8;
        if rpl < self.cpl {
            return Err(Fault::with_selector(EXC_GP, selector));
        }
        if selector & !3 == 0 {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let raw = self.fetch_descriptor(bus, selector)?;
        let desc = SegmentDescriptor::from_raw(raw);
        if !desc.is_code() {
            return Err(Fault::with_selector(EXC_GP, selector));
        }
        if desc.is_conforming() {
            if desc.dpl() > rpl {
                return Err(Fault::with_selector(EXC_GP, selector));
            }
        } else if desc.dpl() != rpl {
            return Err(Fault::with_selector(EXC_GP, selector));
        }
        if desc.notpresent {
            return Err(Fault::with_selector(EXC_NP, selector));
        }

        let returning_outward = rpl > self.cpl;
        self.adjust_sp(adjust);

        if returning_outward {
            let new_esp = self.pop_val(bus)?;
            let new_ss = self.pop_val(bus)? as u16;
            self.cpl = rpl;
            self.segment_written(bus, SegReg::Ss, new_ss, SegSource::StackLoad)?;
            self.regs.set_esp(new_esp);
            self.revalidate_data_segments();
        }

        self.cpl = rpl;
        self.install_descriptor(SegReg::Cs, selector, desc);
        self.regs.eip = if self.fetch.operand_size32 {
            offset
        } else {
            offset & 0xFFFF
        };
        bus.prefetch_flush(
            self.index,
            self.descriptors[SegReg::Cs as usize]
                .base
                .wrapping_add(self.regs.eip),
        );
        Ok(())
    }

    fn adjust_sp(&mut self, bytes: u32) {
        let mask = if self.stack_is_32() { 0xFFFF_FFFF } else { 0xFFFF };
        let sp = self.regs.esp().wrapping_add(bytes) & mask;
        self.regs.set_esp((self.regs.esp() & !mask) | sp);
    }

    /// After an outward return, data segments whose DPL is below the new
    /// CPL are emptied (the silicon nulls them rather than faulting).
    fn revalidate_data_segments(&mut self) {
        for seg in [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs] {
            let desc = &self.descriptors[seg as usize];
            let keep = desc.is_conforming() || desc.dpl() >= self.cpl;
            if !keep {
                let mut null = SegmentDescriptor::from_raw(0);
                null.notpresent = true;
                self.install_descriptor(seg, 0, null);
            }
        }
    }

    /// INTO (CE): INT 4 when OF is set.
    fn exec_into(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.regs.flag(flags::OF) {
            self.interrupt_entry(bus, EXC_OF, IntSource::Software, None)?;
        }
        Ok(())
    }

    /// IRET (CF): real-mode pops, protected-mode privilege unwinding,
    /// nested-task return, and V86 re-entry.
    fn exec_iret(&mut self, bus: &mut Bus) -> ExecResult<()> {
        match self.mode {
            CpuMode::Real => {
                let ip = self.pop_val(bus)?;
                let cs = self.pop_val(bus)? as u16;
                let fl = self.pop_val(bus)?;
                let old = self.regs.eflags;
                let value = if self.fetch.operand_size32 {
                    fl
                } else {
                    (old & 0xFFFF_0000) | (fl & 0xFFFF)
                };
                self.regs.write_eflags(value);
                self.install_descriptor(SegReg::Cs, cs, SegmentDescriptor::real_mode(cs));
                self.regs.eip = ip & if self.fetch.operand_size32 { 0xFFFF_FFFF } else { 0xFFFF };
                bus.prefetch_flush(
                    self.index,
                    self.descriptors[SegReg::Cs as usize]
                        .base
                        .wrapping_add(self.regs.eip),
                );
                Ok(())
            }
            CpuMode::Virtual8086 => {
                if self.regs.iopl() < 3 {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let ip = self.pop_val(bus)?;
                let cs = self.pop_val(bus)? as u16;
                let fl = self.pop_val(bus)?;
                let old = self.regs.eflags;
                // IOPL is untouchable from V86.
                let mut value = if self.fetch.operand_size32 {
                    fl
                } else {
                    (old & 0xFFFF_0000) | (fl & 0xFFFF)
                };
                value = (value & !(flags::IOPL | flags::VM)) | (old & (flags::IOPL | flags::VM));
                self.regs.write_eflags(value);
                self.install_descriptor(SegReg::Cs, cs, SegmentDescriptor::real_mode(cs));
                self.regs.eip = ip & 0xFFFF;
                bus.prefetch_flush(
                    self.index,
                    self.descriptors[SegReg::Cs as usize]
                        .base
                        .wrapping_add(self.regs.eip),
                );
                Ok(())
            }
            CpuMode::Protected => {
                if self.regs.flag(flags::NT) {
                    // Nested-task return through the back link.
                    let tss_base = self.descriptors[SegReg::Tr as usize].base;
                    let backlink = self.linear_read_word(bus, tss_base)?;
                    return self.task_switch_to(bus, backlink, TaskSwitchReason::Iret, None);
                }
                let eip = self.pop_val(bus)?;
                let cs = self.pop_val(bus)? as u16;
                let fl = self.pop_val(bus)?;

                if self.fetch.operand_size32 && fl & flags::VM != 0 && self.cpl == 0 {
                    return self.iret_to_v86(bus, eip, cs, fl);
                }

                let rpl = (cs & 3) as u8;
                if rpl < self.cpl {
                    return Err(Fault::with_selector(EXC_GP, cs));
                }
                if cs & !3 == 0 {
                    return Err(Fault::with_code(EXC_GP, 0));
                }
                let raw = self.fetch_descriptor(bus, cs)?;
                let desc = SegmentDescriptor::from_raw(raw);
                if !desc.is_code() {
                    return Err(Fault::with_selector(EXC_GP, cs));
                }
                if desc.notpresent {
                    return Err(Fault::with_selector(EXC_NP, cs));
                }

                let returning_outward = rpl > self.cpl;
                let mut new_ss = 0u16;
                let mut new_esp = 0u32;
                if returning_outward {
                    new_esp = self.pop_val(bus)?;
                    new_ss = self.pop_val(bus)? as u16;
                }

                // Privilege-filtered EFLAGS restore.
                let old = self.regs.eflags;
                let mut value = if self.fetch.operand_size32 {
                    fl
                } else {
                    (old & 0xFFFF_0000) | (fl & 0xFFFF)
                };
                if self.cpl > 0 {
                    value = (value & !flags::IOPL) | (old & flags::IOPL);
                }
                if self.cpl as u32 > (old & flags::IOPL) >> 12 {
                    value = (value & !flags::IF) | (old & flags::IF);
                }
                value &= !flags::VM;
                self.regs.write_eflags(value);

                self.cpl = rpl;
                if returning_outward {
                    self.segment_written(bus, SegReg::Ss, new_ss, SegSource::StackLoad)?;
                    self.regs.set_esp(new_esp);
                    self.revalidate_data_segments();
                }
                self.install_descriptor(SegReg::Cs, cs, desc);
                self.regs.eip = if self.fetch.operand_size32 {
                    eip
                } else {
                    eip & 0xFFFF
                };
                self.mode = derive_mode(self.regs.cr[0], self.regs.eflags);
                bus.prefetch_flush(
                    self.index,
                    self.descriptors[SegReg::Cs as usize]
                        .base
                        .wrapping_add(self.regs.eip),
                );
                Ok(())
            }
        }
    }

    /// IRETD with VM set in the popped image: restore the V86 frame.
    fn iret_to_v86(&mut self, bus: &mut Bus, eip: u32, cs: u16, fl: u32) -> ExecResult<()> {
        let esp = self.pop32(bus)?;
        let ss = self.pop32(bus)? as u16;
        let es = self.pop32(bus)? as u16;
        let ds = self.pop32(bus)? as u16;
        let fs = self.pop32(bus)? as u16;
        let gs = self.pop32(bus)? as u16;

        self.regs.write_eflags(fl | flags::VM);
        self.mode = CpuMode::Virtual8086;
        self.cpl = 3;

        for (seg, sel) in [
            (SegReg::Cs, cs),
            (SegReg::Ss, ss),
            (SegReg::Es, es),
            (SegReg::Ds, ds),
            (SegReg::Fs, fs),
            (SegReg::Gs, gs),
        ] {
            self.install_descriptor(seg, sel, SegmentDescriptor::real_mode(sel));
        }
        self.regs.set_esp(esp);
        self.regs.eip = eip & 0xFFFF;
        bus.prefetch_flush(
            self.index,
            self.descriptors[SegReg::Cs as usize]
                .base
                .wrapping_add(self.regs.eip),
        );
        Ok(())
    }

    /// SALC (D6, undocumented): AL = CF ? FF : 00.
    fn exec_salc(&mut self) -> ExecResult<()> {
        let value = if self.regs.flag(flags::CF) { 0xFF } else { 0x00 };
        self.regs.set_al(value);
        Ok(())
    }
}
