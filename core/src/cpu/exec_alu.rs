//! ALU instruction semantics: the eight arithmetic rows, INC/DEC, the
//! shift/rotate group, multiply/divide, BCD adjust, and the 0F-map bit
//! operations.
//!
//! All arithmetic goes through the shared calculators in `flags`; opcode
//! classes with divergent flag behavior (INC/DEC preserve CF, shifts set
//! OF only for a count of one) post-process with masks.

use super::interrupts::{Fault, EXC_DE, EXC_UD};
use super::modrm::Operand;
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::cpu::flags;
use crate::cpu::flags::{AF, CF, OF, PF, SF, ZF};

/// The eight ALU row operations in opcode order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Or,
    Adc,
    Sbb,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// Row index from the opcode high bits (00-3F) or a group reg field.
    pub fn from_index(index: u8) -> Self {
        match index & 7 {
            0 => AluOp::Add,
            1 => AluOp::Or,
            2 => AluOp::Adc,
            3 => AluOp::Sbb,
            4 => AluOp::And,
            5 => AluOp::Sub,
            6 => AluOp::Xor,
            _ => AluOp::Cmp,
        }
    }

    /// CMP and TEST drop their result.
    fn writes_back(self) -> bool {
        self != AluOp::Cmp
    }
}

impl Cpu {
    /// Apply an ALU row op at byte width, computing flags.
    pub fn alu_byte(&mut self, op: AluOp, a: u8, b: u8) -> u8 {
        let eflags = &mut self.regs.eflags;
        let carry = (*eflags & CF != 0) as u8;
        match op {
            AluOp::Add => self.alu.flag_add8(eflags, a, b),
            AluOp::Adc => self.alu.flag_adc8(eflags, a, b, carry),
            AluOp::Sub | AluOp::Cmp => self.alu.flag_sub8(eflags, a, b),
            AluOp::Sbb => self.alu.flag_sbb8(eflags, a, b, carry),
            AluOp::Or => self.alu.flag_log8(eflags, a | b),
            AluOp::And => self.alu.flag_log8(eflags, a & b),
            AluOp::Xor => self.alu.flag_log8(eflags, a ^ b),
        }
        match op {
            AluOp::Or => a | b,
            AluOp::And => a & b,
            AluOp::Xor => a ^ b,
            _ => self.alu.dst as u8,
        }
    }

    /// Apply an ALU row op at word width.
    pub fn alu_word(&mut self, op: AluOp, a: u16, b: u16) -> u16 {
        let eflags = &mut self.regs.eflags;
        let carry = (*eflags & CF != 0) as u16;
        match op {
            AluOp::Add => self.alu.flag_add16(eflags, a, b),
            AluOp::Adc => self.alu.flag_adc16(eflags, a, b, carry),
            AluOp::Sub | AluOp::Cmp => self.alu.flag_sub16(eflags, a, b),
            AluOp::Sbb => self.alu.flag_sbb16(eflags, a, b, carry),
            AluOp::Or => self.alu.flag_log16(eflags, a | b),
            AluOp::And => self.alu.flag_log16(eflags, a & b),
            AluOp::Xor => self.alu.flag_log16(eflags, a ^ b),
        }
        match op {
            AluOp::Or => a | b,
            AluOp::And => a & b,
            AluOp::Xor => a ^ b,
            _ => self.alu.dst as u16,
        }
    }

    /// Apply an ALU row op at dword width.
    pub fn alu_dword(&mut self, op: AluOp, a: u32, b: u32) -> u32 {
        let eflags = &mut self.regs.eflags;
        let carry = (*eflags & CF != 0) as u32;
        match op {
            AluOp::Add => self.alu.flag_add32(eflags, a, b),
            AluOp::Adc => self.alu.flag_adc32(eflags, a, b, carry),
            AluOp::Sub | AluOp::Cmp => self.alu.flag_sub32(eflags, a, b),
            AluOp::Sbb => self.alu.flag_sbb32(eflags, a, b, carry),
            AluOp::Or => self.alu.flag_log32(eflags, a | b),
            AluOp::And => self.alu.flag_log32(eflags, a & b),
            AluOp::Xor => self.alu.flag_log32(eflags, a ^ b),
        }
        match op {
            AluOp::Or => a | b,
            AluOp::And => a & b,
            AluOp::Xor => a ^ b,
            _ => self.alu.dst as u32,
        }
    }

    /// Operand-size ALU op on widened u32 values.
    fn alu_op(&mut self, op: AluOp, a: u32, b: u32) -> u32 {
        if self.fetch.operand_size32 {
            self.alu_dword(op, a, b)
        } else {
            self.alu_word(op, a as u16, b as u16) as u32
        }
    }

    /// Opcodes 00-3B: ALU r/m,r and r,r/m rows at both widths.
    pub fn exec_alu_modrm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let op = AluOp::from_index(opcode >> 3);
        let byte_op = opcode & 1 == 0;
        let reg_is_dest = opcode & 2 != 0;

        if byte_op {
            let reg = Operand::Reg8(self.modrm.reg_field());
            let rm = self.modrm.rm8();
            let (dst, src) = if reg_is_dest { (reg, rm) } else { (rm, reg) };
            let a = self.read_op8(bus, dst)?;
            let b = self.read_op8(bus, src)?;
            let result = self.alu_byte(op, a, b);
            if op.writes_back() {
                self.write_op8(bus, dst, result)?;
            }
        } else {
            let reg = self.modrm.reg_op(self.fetch.operand_size32);
            let rm = self.modrm.rm_op(self.fetch.operand_size32);
            let (dst, src) = if reg_is_dest { (reg, rm) } else { (rm, reg) };
            let a = self.read_op(bus, dst)?;
            let b = self.read_op(bus, src)?;
            let result = self.alu_op(op, a, b);
            if op.writes_back() {
                self.write_op(bus, dst, result)?;
            }
        }
        Ok(())
    }

    /// Opcodes 04-3D (x4/x5/xC/xD): ALU AL/eAX,imm.
    pub fn exec_alu_acc_imm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let _ = bus;
        let opcode = self.fetch.opcode;
        let op = AluOp::from_index(opcode >> 3);
        if opcode & 1 == 0 {
            let a = self.regs.al();
            let result = self.alu_byte(op, a, self.fetch.imm as u8);
            if op.writes_back() {
                self.regs.set_al(result);
            }
        } else if self.fetch.operand_size32 {
            let a = self.regs.eax();
            let result = self.alu_dword(op, a, self.fetch.imm);
            if op.writes_back() {
                self.regs.set_eax(result);
            }
        } else {
            let a = self.regs.ax();
            let result = self.alu_word(op, a, self.fetch.imm as u16);
            if op.writes_back() {
                self.regs.set_ax(result);
            }
        }
        Ok(())
    }

    /// Opcodes 80-83: group 1, ALU r/m,imm.
    pub fn exec_group1(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let op = AluOp::from_index(self.modrm.reg_field());
        match opcode {
            0x80 | 0x82 => {
                let dst = self.modrm.rm8();
                let a = self.read_op8(bus, dst)?;
                let result = self.alu_byte(op, a, self.fetch.imm as u8);
                if op.writes_back() {
                    self.write_op8(bus, dst, result)?;
                }
            }
            _ => {
                let dst = self.modrm.rm_op(self.fetch.operand_size32);
                let a = self.read_op(bus, dst)?;
                // 83 sign-extends its byte immediate.
                let b = if opcode == 0x83 {
                    self.fetch.imm as u8 as i8 as i32 as u32
                } else {
                    self.fetch.imm
                };
                let result = self.alu_op(op, a, b);
                if op.writes_back() {
                    self.write_op(bus, dst, result)?;
                }
            }
        }
        Ok(())
    }

    /// Opcodes 40-4F: INC/DEC reg (CF preserved).
    pub fn exec_inc_dec_reg(&mut self, _bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let reg = opcode & 7;
        let dec = opcode & 8 != 0;
        let saved_cf = self.regs.eflags & CF;
        if self.fetch.operand_size32 {
            let a = self.regs.read32(reg);
            let result = if dec {
                self.alu_dword(AluOp::Sub, a, 1)
            } else {
                self.alu_dword(AluOp::Add, a, 1)
            };
            self.regs.write32(reg, result);
        } else {
            let a = self.regs.read16(reg);
            let result = if dec {
                self.alu_word(AluOp::Sub, a, 1)
            } else {
                self.alu_word(AluOp::Add, a, 1)
            };
            self.regs.write16(reg, result);
        }
        self.regs.eflags = (self.regs.eflags & !CF) | saved_cf;
        Ok(())
    }

    /// TEST r/m,r (84/85) and TEST AL/eAX,imm (A8/A9).
    pub fn exec_test(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        match opcode {
            0x84 => {
                let a = self.read_op8(bus, self.modrm.rm8())?;
                let b = self.regs.read8(self.modrm.reg_field());
                let result = a & b;
                self.alu.flag_log8(&mut self.regs.eflags, result);
            }
            0x85 => {
                let a = self.read_op(bus, self.modrm.rm_op(self.fetch.operand_size32))?;
                let b = self.read_op(bus, self.modrm.reg_op(self.fetch.operand_size32))?;
                if self.fetch.operand_size32 {
                    self.alu.flag_log32(&mut self.regs.eflags, a & b);
                } else {
                    self.alu.flag_log16(&mut self.regs.eflags, (a & b) as u16);
                }
            }
            0xA8 => {
                let result = self.regs.al() & self.fetch.imm as u8;
                self.alu.flag_log8(&mut self.regs.eflags, result);
            }
            _ => {
                if self.fetch.operand_size32 {
                    let result = self.regs.eax() & self.fetch.imm;
                    self.alu.flag_log32(&mut self.regs.eflags, result);
                } else {
                    let result = self.regs.ax() & self.fetch.imm as u16;
                    self.alu.flag_log16(&mut self.regs.eflags, result);
                }
            }
        }
        Ok(())
    }

    // ========== Shift/rotate group (C0/C1, D0-D3) ==========

    /// Dispatch a group-2 shift/rotate; `count_src` resolves to 1, CL, or
    /// an immediate depending on the opcode.
    pub fn exec_group2(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let opcode = self.fetch.opcode;
        let count = match opcode {
            0xC0 | 0xC1 => self.fetch.imm as u8,
            0xD0 | 0xD1 => 1,
            _ => self.regs.read8(1), // CL
        };
        // 186+ masks the count; the 8086 shifts the full 8-bit count.
        let count = if self.model >= crate::config::CpuModel::NecV30 {
            count & 0x1F
        } else {
            count
        };
        let kind = self.modrm.reg_field();
        let byte_op = opcode & 1 == 0;

        if byte_op {
            let dst = self.modrm.rm8();
            let value = self.read_op8(bus, dst)?;
            let result = self.shift_rotate(kind, value as u32, count, 8);
            self.write_op8(bus, dst, result as u8)?;
        } else if self.fetch.operand_size32 {
            let dst = self.modrm.rm32();
            let value = self.read_op32(bus, dst)?;
            let result = self.shift_rotate(kind, value, count, 32);
            self.write_op32(bus, dst, result)?;
        } else {
            let dst = self.modrm.rm16();
            let value = self.read_op16(bus, dst)?;
            let result = self.shift_rotate(kind, value as u32, count, 16);
            self.write_op16(bus, dst, result as u16)?;
        }
        Ok(())
    }

    /// Shift/rotate engine. Rotates touch only CF (and OF for count 1);
    /// shifts recompute SZP and the last bit out lands in CF.
    fn shift_rotate(&mut self, kind: u8, value: u32, count: u8, bits: u32) -> u32 {
        if count == 0 {
            return value;
        }
        let msb = 1u32 << (bits - 1);
        let mask = if bits == 32 {
            0xFFFF_FFFF
        } else {
            (1u32 << bits) - 1
        };
        let value = value & mask;
        let eflags = &mut self.regs.eflags;
        let mut result = value;
        let mut cf = *eflags & CF != 0;

        match kind {
            0 => {
                // ROL
                let c = count as u32 % bits;
                result = (value << c | value.checked_shr(bits - c).unwrap_or(0)) & mask;
                cf = result & 1 != 0;
                if count == 1 {
                    let of = (result & msb != 0) ^ cf;
                    set_flag(eflags, OF, of);
                }
            }
            1 => {
                // ROR
                let c = count as u32 % bits;
                result = (value >> c | value.checked_shl(bits - c).unwrap_or(0)) & mask;
                cf = result & msb != 0;
                if count == 1 {
                    let of = (result & msb != 0) ^ (result & (msb >> 1) != 0);
                    set_flag(eflags, OF, of);
                }
            }
            2 => {
                // RCL: rotate through carry, modulo bits+1.
                let c = count as u32 % (bits + 1);
                for _ in 0..c {
                    let new_cf = result & msb != 0;
                    result = ((result << 1) | cf as u32) & mask;
                    cf = new_cf;
                }
                if count == 1 {
                    let of = (result & msb != 0) ^ cf;
                    set_flag(eflags, OF, of);
                }
            }
            3 => {
                // RCR
                let c = count as u32 % (bits + 1);
                for _ in 0..c {
                    let new_cf = result & 1 != 0;
                    result = (result >> 1) | ((cf as u32) << (bits - 1));
                    cf = new_cf;
                }
                if count == 1 {
                    let of = (result & msb != 0) ^ (result & (msb >> 1) != 0);
                    set_flag(eflags, OF, of);
                }
            }
            4 | 6 => {
                // SHL/SAL
                if count as u32 <= bits {
                    cf = count as u32 <= bits && value >> (bits - count as u32) & 1 != 0;
                    result = value.checked_shl(count as u32).unwrap_or(0) & mask;
                } else {
                    cf = false;
                    result = 0;
                }
                if count == 1 {
                    let of = (result & msb != 0) ^ cf;
                    set_flag(eflags, OF, of);
                }
                set_szp(eflags, result, bits);
                *eflags &= !AF;
            }
            5 => {
                // SHR
                if (count as u32) <= bits {
                    cf = value >> (count as u32 - 1) & 1 != 0;
                    result = value.checked_shr(count as u32).unwrap_or(0);
                } else {
                    cf = false;
                    result = 0;
                }
                if count == 1 {
                    set_flag(eflags, OF, value & msb != 0);
                }
                set_szp(eflags, result, bits);
                *eflags &= !AF;
            }
            _ => {
                // SAR
                let sign = value & msb != 0;
                let c = (count as u32).min(bits);
                cf = if (count as u32) <= bits {
                    value >> (c - 1) & 1 != 0
                } else {
                    sign
                };
                let wide = if sign {
                    ((value as u64) | ((mask as u64) << bits)) >> c
                } else {
                    (value as u64) >> c
                };
                result = (wide as u32) & mask;
                if count == 1 {
                    set_flag(eflags, OF, false);
                }
                set_szp(eflags, result, bits);
                *eflags &= !AF;
            }
        }

        set_flag(eflags, CF, cf);
        result
    }

    // ========== Group 3 (F6/F7): TEST/NOT/NEG/MUL/IMUL/DIV/IDIV ==========

    pub fn exec_group3(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let byte_op = self.fetch.opcode == 0xF6;
        let kind = self.modrm.reg_field();
        match kind {
            0 | 1 => {
                // TEST r/m,imm
                if byte_op {
                    let a = self.read_op8(bus, self.modrm.rm8())?;
                    let result = a & self.fetch.imm as u8;
                    self.alu.flag_log8(&mut self.regs.eflags, result);
                } else {
                    let a = self.read_op(bus, self.modrm.rm_op(self.fetch.operand_size32))?;
                    let result = a & self.fetch.imm;
                    if self.fetch.operand_size32 {
                        self.alu.flag_log32(&mut self.regs.eflags, result);
                    } else {
                        self.alu.flag_log16(&mut self.regs.eflags, result as u16);
                    }
                }
            }
            2 => {
                // NOT (no flags)
                if byte_op {
                    let dst = self.modrm.rm8();
                    let a = self.read_op8(bus, dst)?;
                    self.write_op8(bus, dst, !a)?;
                } else {
                    let dst = self.modrm.rm_op(self.fetch.operand_size32);
                    let a = self.read_op(bus, dst)?;
                    self.write_op(bus, dst, !a)?;
                }
            }
            3 => {
                // NEG = 0 - r/m
                if byte_op {
                    let dst = self.modrm.rm8();
                    let a = self.read_op8(bus, dst)?;
                    let result = self.alu_byte(AluOp::Sub, 0, a);
                    self.write_op8(bus, dst, result)?;
                    set_flag(&mut self.regs.eflags, CF, a != 0);
                } else {
                    let dst = self.modrm.rm_op(self.fetch.operand_size32);
                    let a = self.read_op(bus, dst)?;
                    let result = self.alu_op(AluOp::Sub, 0, a);
                    self.write_op(bus, dst, result)?;
                    set_flag(&mut self.regs.eflags, CF, a != 0);
                }
            }
            4 => self.exec_mul(bus, byte_op)?,
            5 => self.exec_imul_one_operand(bus, byte_op)?,
            6 => self.exec_div(bus, byte_op)?,
            _ => self.exec_idiv(bus, byte_op)?,
        }
        Ok(())
    }

    fn exec_mul(&mut self, bus: &mut Bus, byte_op: bool) -> ExecResult<()> {
        if byte_op {
            let src = self.read_op8(bus, self.modrm.rm8())? as u16;
            let result = self.regs.al() as u16 * src;
            self.regs.set_ax(result);
            let high = result >> 8 != 0;
            set_flag(&mut self.regs.eflags, CF | OF, high);
        } else if self.fetch.operand_size32 {
            let src = self.read_op32(bus, self.modrm.rm32())? as u64;
            let result = self.regs.eax() as u64 * src;
            self.regs.set_eax(result as u32);
            self.regs.write32(2, (result >> 32) as u32); // EDX
            set_flag(&mut self.regs.eflags, CF | OF, result >> 32 != 0);
        } else {
            let src = self.read_op16(bus, self.modrm.rm16())? as u32;
            let result = self.regs.ax() as u32 * src;
            self.regs.set_ax(result as u16);
            self.regs.write16(2, (result >> 16) as u16); // DX
            set_flag(&mut self.regs.eflags, CF | OF, result >> 16 != 0);
        }
        Ok(())
    }

    fn exec_imul_one_operand(&mut self, bus: &mut Bus, byte_op: bool) -> ExecResult<()> {
        if byte_op {
            let src = self.read_op8(bus, self.modrm.rm8())?;
            let result = self.cpu_cimul(self.regs.al() as u32, 8, src as u32, 8, 16);
            self.regs.set_ax(result as u16);
        } else if self.fetch.operand_size32 {
            let src = self.read_op32(bus, self.modrm.rm32())?;
            let wide =
                (self.regs.eax() as i32 as i64).wrapping_mul(src as i32 as i64) as u64;
            self.regs.set_eax(wide as u32);
            self.regs.write32(2, (wide >> 32) as u32);
            let overflow = wide as u64 >> 32 != ((wide as u32 as i32) >> 31) as u32 as u64;
            set_flag(&mut self.regs.eflags, CF | OF, overflow);
        } else {
            let src = self.read_op16(bus, self.modrm.rm16())?;
            let result = self.cpu_cimul(self.regs.ax() as u32, 16, src as u32, 16, 32);
            self.regs.set_ax(result as u16);
            self.regs.write16(2, (result >> 16) as u16);
        }
        Ok(())
    }

    /// Shared signed-multiply helper: sign-extends both operands from
    /// their widths, multiplies, and sets CF/OF when the high half is not
    /// a sign-extension of the low half.
    ///
    /// On the 8086/8088 a REPZ prefix on IMUL negates the result, a
    /// documented quirk of those parts.
    pub fn cpu_cimul(
        &mut self,
        base: u32,
        base_bits: u32,
        mult: u32,
        mult_bits: u32,
        result_bits: u32,
    ) -> u32 {
        let a = sign_extend(base, base_bits) as i64;
        let b = sign_extend(mult, mult_bits) as i64;
        let mut product = a.wrapping_mul(b);

        if self.model <= crate::config::CpuModel::NecV30
            && self.fetch.prefixes.rep == Some(super::decode::RepKind::Repe)
        {
            product = product.wrapping_neg();
        }

        let low_bits = result_bits / 2;
        let low = (product as u64) & ((1u64 << low_bits) - 1);
        let sign_extended = sign_extend(low as u32, low_bits) as i64;
        let overflow = sign_extended != product;
        set_flag(&mut self.regs.eflags, CF | OF, overflow);

        let mask = if result_bits >= 32 {
            0xFFFF_FFFF
        } else {
            (1u32 << result_bits) - 1
        };
        (product as u32) & mask
    }

    /// IMUL r,r/m,imm (69/6B) and IMUL r,r/m (0FAF).
    pub fn exec_imul_two_three(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let src = self.read_op(bus, self.modrm.rm_op(self.fetch.operand_size32))?;
        let multiplier = match (self.fetch.is_0f, self.fetch.opcode) {
            (false, 0x69) => self.fetch.imm,
            (false, 0x6B) => self.fetch.imm as u8 as i8 as i32 as u32,
            _ => self.read_op(bus, self.modrm.reg_op(self.fetch.operand_size32))?,
        };
        let bits = if self.fetch.operand_size32 { 32 } else { 16 };
        let result = if bits == 32 {
            let wide = (src as i32 as i64).wrapping_mul(multiplier as i32 as i64);
            let overflow = wide != wide as i32 as i64;
            set_flag(&mut self.regs.eflags, CF | OF, overflow);
            wide as u32
        } else {
            self.cpu_cimul(src, 16, multiplier, 16, 32) as u16 as u32
        };
        self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), result)?;
        Ok(())
    }

    fn exec_div(&mut self, bus: &mut Bus, byte_op: bool) -> ExecResult<()> {
        if byte_op {
            let divisor = self.read_op8(bus, self.modrm.rm8())? as u16;
            if divisor == 0 {
                return Err(Fault::new(EXC_DE));
            }
            let dividend = self.regs.ax();
            let quotient = dividend / divisor;
            if quotient > 0xFF {
                return Err(Fault::new(EXC_DE));
            }
            self.regs.set_al(quotient as u8);
            self.regs.write8(4, (dividend % divisor) as u8); // AH
        } else if self.fetch.operand_size32 {
            let divisor = self.read_op32(bus, self.modrm.rm32())? as u64;
            if divisor == 0 {
                return Err(Fault::new(EXC_DE));
            }
            let dividend = ((self.regs.read32(2) as u64) << 32) | self.regs.eax() as u64;
            let quotient = dividend / divisor;
            if quotient > 0xFFFF_FFFF {
                return Err(Fault::new(EXC_DE));
            }
            self.regs.set_eax(quotient as u32);
            self.regs.write32(2, (dividend % divisor) as u32);
        } else {
            let divisor = self.read_op16(bus, self.modrm.rm16())? as u32;
            if divisor == 0 {
                return Err(Fault::new(EXC_DE));
            }
            let dividend = ((self.regs.read16(2) as u32) << 16) | self.regs.ax() as u32;
            let quotient = dividend / divisor;
            if quotient > 0xFFFF {
                return Err(Fault::new(EXC_DE));
            }
            self.regs.set_ax(quotient as u16);
            self.regs.write16(2, (dividend % divisor) as u16);
        }
        Ok(())
    }

    fn exec_idiv(&mut self, bus: &mut Bus, byte_op: bool) -> ExecResult<()> {
        if byte_op {
            let divisor = self.read_op8(bus, self.modrm.rm8())? as i8 as i16;
            if divisor == 0 {
                return Err(Fault::new(EXC_DE));
            }
            let dividend = self.regs.ax() as i16;
            let quotient = dividend.wrapping_div(divisor);
            if quotient > 0x7F || quotient < -0x80 {
                return Err(Fault::new(EXC_DE));
            }
            self.regs.set_al(quotient as u8);
            self.regs.write8(4, dividend.wrapping_rem(divisor) as u8);
        } else if self.fetch.operand_size32 {
            let divisor = self.read_op32(bus, self.modrm.rm32())? as i32 as i64;
            if divisor == 0 {
                return Err(Fault::new(EXC_DE));
            }
            let dividend =
                (((self.regs.read32(2) as u64) << 32) | self.regs.eax() as u64) as i64;
            let quotient = dividend.wrapping_div(divisor);
            if quotient > i32::MAX as i64 || quotient < i32::MIN as i64 {
                return Err(Fault::new(EXC_DE));
            }
            self.regs.set_eax(quotient as u32);
            self.regs.write32(2, dividend.wrapping_rem(divisor) as u32);
        } else {
            let divisor = self.read_op16(bus, self.modrm.rm16())? as i16 as i32;
            if divisor == 0 {
                return Err(Fault::new(EXC_DE));
            }
            let dividend =
                (((self.regs.read16(2) as u32) << 16) | self.regs.ax() as u32) as i32;
            let quotient = dividend.wrapping_div(divisor);
            if quotient > 0x7FFF || quotient < -0x8000 {
                return Err(Fault::new(EXC_DE));
            }
            self.regs.set_ax(quotient as u16);
            self.regs.write16(2, dividend.wrapping_rem(divisor) as u16);
        }
        Ok(())
    }

    /// FE: INC/DEC r/m8. FF /0,/1 handled in the group-5 dispatcher.
    pub fn exec_inc_dec_rm8(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let kind = self.modrm.reg_field();
        if kind > 1 {
            return Err(Fault::new(EXC_UD));
        }
        let dst = self.modrm.rm8();
        let a = self.read_op8(bus, dst)?;
        let saved_cf = self.regs.eflags & CF;
        let result = if kind == 0 {
            self.alu_byte(AluOp::Add, a, 1)
        } else {
            self.alu_byte(AluOp::Sub, a, 1)
        };
        self.regs.eflags = (self.regs.eflags & !CF) | saved_cf;
        self.write_op8(bus, dst, result)
    }

    /// INC/DEC r/m of operand size (FF /0,/1).
    pub fn exec_inc_dec_rm(&mut self, bus: &mut Bus, dec: bool) -> ExecResult<()> {
        let dst = self.modrm.rm_op(self.fetch.operand_size32);
        let a = self.read_op(bus, dst)?;
        let saved_cf = self.regs.eflags & CF;
        let result = if dec {
            self.alu_op(AluOp::Sub, a, 1)
        } else {
            self.alu_op(AluOp::Add, a, 1)
        };
        self.regs.eflags = (self.regs.eflags & !CF) | saved_cf;
        self.write_op(bus, dst, result)
    }

    // ========== BCD adjust ==========

    /// DAA (27) / DAS (2F).
    pub fn exec_daa_das(&mut self, das: bool) -> ExecResult<()> {
        let mut al = self.regs.al();
        let mut cf = self.regs.flag(CF);
        let af = self.regs.flag(AF);
        let old_al = al;
        let old_cf = cf;
        cf = false;

        if al & 0x0F > 9 || af {
            al = if das {
                al.wrapping_sub(6)
            } else {
                al.wrapping_add(6)
            };
            cf = old_cf || (das && old_al < 6) || (!das && old_al > 0xF9);
            self.regs.set_flag(AF, true);
        } else {
            self.regs.set_flag(AF, false);
        }
        if old_al > 0x99 || old_cf {
            al = if das {
                al.wrapping_sub(0x60)
            } else {
                al.wrapping_add(0x60)
            };
            cf = true;
        }

        self.regs.set_al(al);
        let eflags = &mut self.regs.eflags;
        flags::szp8(eflags, al);
        set_flag(eflags, CF, cf);
        Ok(())
    }

    /// AAA (37) / AAS (3F).
    pub fn exec_aaa_aas(&mut self, aas: bool) -> ExecResult<()> {
        let al = self.regs.al();
        let af = self.regs.flag(AF);
        if al & 0x0F > 9 || af {
            let ax = self.regs.ax();
            let ax = if aas {
                ax.wrapping_sub(6).wrapping_sub(0x100)
            } else {
                ax.wrapping_add(6).wrapping_add(0x100)
            };
            self.regs.set_ax(ax);
            self.regs.set_flag(AF | CF, true);
        } else {
            self.regs.set_flag(AF | CF, false);
        }
        let al = self.regs.al() & 0x0F;
        self.regs.set_al(al);
        Ok(())
    }

    /// AAM (D4): AH = AL / base, AL = AL % base. Divide-by-zero faults.
    pub fn exec_aam(&mut self) -> ExecResult<()> {
        let base = self.fetch.imm as u8;
        if base == 0 {
            return Err(Fault::new(EXC_DE));
        }
        let al = self.regs.al();
        self.regs.write8(4, al / base);
        self.regs.set_al(al % base);
        let al = self.regs.al();
        flags::szp8(&mut self.regs.eflags, al);
        Ok(())
    }

    /// AAD (D5): AL = AL + AH * base, AH = 0.
    pub fn exec_aad(&mut self) -> ExecResult<()> {
        let base = self.fetch.imm as u8;
        let result = self
            .regs
            .al()
            .wrapping_add(self.regs.read8(4).wrapping_mul(base));
        self.regs.set_al(result);
        self.regs.write8(4, 0);
        flags::szp8(&mut self.regs.eflags, result);
        Ok(())
    }

    // ========== 0F bit operations ==========

    /// BT/BTS/BTR/BTC with a register bit index (A3/AB/B3/BB) or an
    /// immediate (BA group). Memory forms extend the effective address by
    /// the bit offset's word/dword index.
    pub fn exec_bit_op(&mut self, bus: &mut Bus, kind: u8, imm_form: bool) -> ExecResult<()> {
        let bits: u32 = if self.fetch.operand_size32 { 32 } else { 16 };
        let index = if imm_form {
            self.fetch.imm
        } else {
            self.read_op(bus, self.modrm.reg_op(self.fetch.operand_size32))?
        };

        let op = if let Some(mem) = self.modrm.mem {
            // Bit strings index beyond the operand for register indices.
            let element = if imm_form {
                0
            } else {
                (index as i32 >> if bits == 32 { 5 } else { 4 }) as i32
            };
            let byte_step = (bits / 8) as i32;
            let offset = mem
                .offset
                .wrapping_add((element * byte_step) as u32);
            let adjusted = super::modrm::MemRef { offset, ..mem };
            Operand::Mem(adjusted)
        } else {
            self.modrm.rm_op(self.fetch.operand_size32)
        };

        let bit = index % bits;
        let value = self.read_op(bus, op)?;
        let set = value >> bit & 1 != 0;
        set_flag(&mut self.regs.eflags, CF, set);

        let updated = match kind {
            0 => return Ok(()),            // BT
            1 => value | 1 << bit,         // BTS
            2 => value & !(1 << bit),      // BTR
            _ => value ^ 1 << bit,         // BTC
        };
        self.write_op(bus, op, updated)
    }

    /// BSF (0FBC) / BSR (0FBD).
    pub fn exec_bit_scan(&mut self, bus: &mut Bus, reverse: bool) -> ExecResult<()> {
        let src = self.read_op(bus, self.modrm.rm_op(self.fetch.operand_size32))?;
        let src = if self.fetch.operand_size32 {
            src
        } else {
            src & 0xFFFF
        };
        if src == 0 {
            self.regs.set_flag(ZF, true);
            return Ok(());
        }
        self.regs.set_flag(ZF, false);
        let index = if reverse {
            31 - src.leading_zeros()
        } else {
            src.trailing_zeros()
        };
        self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), index)
    }

    /// SHLD (0FA4/A5) / SHRD (0FAC/AD).
    pub fn exec_shift_double(&mut self, bus: &mut Bus, right: bool) -> ExecResult<()> {
        let count = if self.fetch.opcode & 1 == 0 {
            self.fetch.imm as u8
        } else {
            self.regs.read8(1) // CL
        } & 0x1F;
        if count == 0 {
            return Ok(());
        }
        let bits: u32 = if self.fetch.operand_size32 { 32 } else { 16 };
        let dst_op = self.modrm.rm_op(self.fetch.operand_size32);
        let dst = self.read_op(bus, dst_op)?;
        let filler = self.read_op(bus, self.modrm.reg_op(self.fetch.operand_size32))?;
        let count = count as u32;
        if count > bits {
            // Results undefined; mirror the silicon's wraparound of the
            // 64-bit internal shifter.
            return Ok(());
        }

        let (result, cf) = if right {
            let wide = (dst as u64) | ((filler as u64) << bits);
            let cf = dst >> (count - 1) & 1 != 0;
            (((wide >> count) as u32) & width_mask(bits), cf)
        } else {
            let wide = ((dst as u64) << bits) | (filler as u64);
            let shifted = wide << count;
            let cf = shifted >> (2 * bits) & 1 != 0;
            (((shifted >> bits) as u32) & width_mask(bits), cf)
        };

        let eflags = &mut self.regs.eflags;
        set_szp(eflags, result, bits);
        set_flag(eflags, CF, cf);
        if count == 1 {
            let of = ((dst ^ result) & (1 << (bits - 1))) != 0;
            set_flag(eflags, OF, of);
        }
        self.write_op(bus, dst_op, result)
    }

    /// CMPXCHG (0FB0/B1).
    pub fn exec_cmpxchg(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let byte_op = self.fetch.opcode == 0xB0;
        if byte_op {
            let dst = self.modrm.rm8();
            let current = self.read_op8(bus, dst)?;
            let acc = self.regs.al();
            self.alu_byte(AluOp::Cmp, acc, current);
            if acc == current {
                let new = self.regs.read8(self.modrm.reg_field());
                self.write_op8(bus, dst, new)?;
            } else {
                self.regs.set_al(current);
            }
        } else {
            let dst = self.modrm.rm_op(self.fetch.operand_size32);
            let current = self.read_op(bus, dst)?;
            let acc = if self.fetch.operand_size32 {
                self.regs.eax()
            } else {
                self.regs.ax() as u32
            };
            self.alu_op(AluOp::Cmp, acc, current);
            if acc == current {
                let new = self.read_op(bus, self.modrm.reg_op(self.fetch.operand_size32))?;
                self.write_op(bus, dst, new)?;
            } else if self.fetch.operand_size32 {
                self.regs.set_eax(current);
            } else {
                self.regs.set_ax(current as u16);
            }
        }
        Ok(())
    }

    /// CMPXCHG8B (0FC7 /1).
    pub fn exec_cmpxchg8b(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.modrm.reg_field() != 1 || !self.modrm.rm_is_mem() {
            return Err(Fault::new(EXC_UD));
        }
        let mem = self.modrm.mem.unwrap_or(super::modrm::MemRef {
            seg: super::registers::SegReg::Ds,
            offset: 0,
            addr16: false,
        });
        let lo_op = Operand::Mem(mem);
        let hi_op = Operand::Mem(super::modrm::MemRef {
            offset: mem.offset.wrapping_add(4),
            ..mem
        });
        let lo = self.read_op32(bus, lo_op)?;
        let hi = self.read_op32(bus, hi_op)?;
        let expected = ((self.regs.read32(2) as u64) << 32) | self.regs.eax() as u64;
        let current = ((hi as u64) << 32) | lo as u64;
        if expected == current {
            self.write_op32(bus, lo_op, self.regs.read32(3))?; // EBX
            self.write_op32(bus, hi_op, self.regs.read32(1))?; // ECX
            self.regs.set_flag(ZF, true);
        } else {
            self.regs.set_eax(current as u32);
            self.regs.write32(2, (current >> 32) as u32);
            self.regs.set_flag(ZF, false);
        }
        Ok(())
    }

    /// XADD (0FC0/C1).
    pub fn exec_xadd(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let byte_op = self.fetch.opcode == 0xC0;
        if byte_op {
            let dst = self.modrm.rm8();
            let a = self.read_op8(bus, dst)?;
            let b = self.regs.read8(self.modrm.reg_field());
            let sum = self.alu_byte(AluOp::Add, a, b);
            self.regs.write8(self.modrm.reg_field(), a);
            self.write_op8(bus, dst, sum)?;
        } else {
            let dst = self.modrm.rm_op(self.fetch.operand_size32);
            let a = self.read_op(bus, dst)?;
            let b = self.read_op(bus, self.modrm.reg_op(self.fetch.operand_size32))?;
            let sum = self.alu_op(AluOp::Add, a, b);
            self.write_op(bus, self.modrm.reg_op(self.fetch.operand_size32), a)?;
            self.write_op(bus, dst, sum)?;
        }
        Ok(())
    }

    /// BSWAP (0FC8+r), 486+.
    pub fn exec_bswap(&mut self) -> ExecResult<()> {
        if self.model < crate::config::CpuModel::I80486 {
            return Err(Fault::new(EXC_UD));
        }
        let reg = self.fetch.opcode & 7;
        let value = self.regs.read32(reg);
        self.regs.write32(reg, value.swap_bytes());
        Ok(())
    }
}

#[inline]
fn set_flag(eflags: &mut u32, mask: u32, on: bool) {
    if on {
        *eflags |= mask;
    } else {
        *eflags &= !mask;
    }
}

#[inline]
fn width_mask(bits: u32) -> u32 {
    if bits == 32 {
        0xFFFF_FFFF
    } else {
        (1 << bits) - 1
    }
}

/// SZP over an arbitrary width.
fn set_szp(eflags: &mut u32, value: u32, bits: u32) {
    *eflags &= !(SF | ZF | PF);
    if value & width_mask(bits) == 0 {
        *eflags |= ZF;
    }
    if value & (1 << (bits - 1)) != 0 {
        *eflags |= SF;
    }
    if flags::PARITY[(value & 0xFF) as usize] != 0 {
        *eflags |= PF;
    }
}

/// Sign-extend `value` from `bits` to 32 bits (as i32).
#[inline]
fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}
