//! ModR/M and SIB decoding into typed operand references.
//!
//! Decoding produces a register number or a memory reference (segment,
//! offset, addressing width); the executor asks for typed 8/16/32-bit
//! views of either. Effective-address cycle costs follow the AT-era
//! table: 5 for register-indirect, 6 for direct, 7-9 for base+index,
//! 11-12 for base+index+displacement, +2 for any segment override.

use super::registers::{SegReg, REG_EBP, REG_EBX, REG_EDI, REG_ESI, REG_ESP};
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::cpu::mmu::MemSeg;

/// A decoded memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRef {
    /// Segment after override resolution
    pub seg: SegReg,
    /// Effective offset
    pub offset: u32,
    /// 16-bit addressing (offset wraps at 64 KB)
    pub addr16: bool,
}

/// Either operand of a ModR/M pair: a typed register reference or memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Reg8(u8),
    Reg16(u8),
    Reg32(u8),
    Mem(MemRef),
}

/// Decoded ModR/M state for the current instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModrmState {
    /// The raw ModR/M byte
    pub modrm: u8,
    /// The raw SIB byte when present
    pub sib: Option<u8>,
    /// Raw displacement (sign-extended to 32 bits where applicable)
    pub disp: u32,
    /// Memory reference when mod != 3
    pub mem: Option<MemRef>,
    /// Effective-address cycle cost
    pub ea_cycles: u8,
}

impl ModrmState {
    /// The reg field (bits 3-5).
    #[inline]
    pub fn reg_field(&self) -> u8 {
        (self.modrm >> 3) & 7
    }

    /// The r/m field (bits 0-2).
    #[inline]
    pub fn rm_field(&self) -> u8 {
        self.modrm & 7
    }

    /// The mod field (bits 6-7).
    #[inline]
    pub fn mod_field(&self) -> u8 {
        self.modrm >> 6
    }

    /// Does r/m name memory?
    #[inline]
    pub fn rm_is_mem(&self) -> bool {
        self.mem.is_some()
    }

    /// r/m as an 8-bit operand.
    pub fn rm8(&self) -> Operand {
        match self.mem {
            Some(mem) => Operand::Mem(mem),
            None => Operand::Reg8(self.rm_field()),
        }
    }

    /// r/m as a 16-bit operand.
    pub fn rm16(&self) -> Operand {
        match self.mem {
            Some(mem) => Operand::Mem(mem),
            None => Operand::Reg16(self.rm_field()),
        }
    }

    /// r/m as a 32-bit operand.
    pub fn rm32(&self) -> Operand {
        match self.mem {
            Some(mem) => Operand::Mem(mem),
            None => Operand::Reg32(self.rm_field()),
        }
    }

    /// r/m as an operand of the current operand size.
    pub fn rm_op(&self, opsize32: bool) -> Operand {
        if opsize32 {
            self.rm32()
        } else {
            self.rm16()
        }
    }

    /// reg as an operand of the current operand size.
    pub fn reg_op(&self, opsize32: bool) -> Operand {
        if opsize32 {
            Operand::Reg32(self.reg_field())
        } else {
            Operand::Reg16(self.reg_field())
        }
    }
}

impl Cpu {
    /// Decode the ModR/M byte (and SIB/displacement) for the current
    /// instruction. `self.fetch` supplies prefixes and address size.
    pub fn decode_modrm(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let modrm = self.fetch_code_byte(bus)?;
        self.modrm = ModrmState {
            modrm,
            ..ModrmState::default()
        };
        if modrm >> 6 == 3 {
            return Ok(());
        }
        if self.fetch.address_size32 {
            self.decode_ea32(bus)?;
        } else {
            self.decode_ea16(bus)?;
        }
        if self.fetch.prefixes.seg_override.is_some() {
            self.modrm.ea_cycles += 2;
        }
        Ok(())
    }

    /// 16-bit effective address: the classic eight-row table.
    fn decode_ea16(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let md = self.modrm.mod_field();
        let rm = self.modrm.rm_field();

        let disp = match (md, rm) {
            (0, 6) => self.fetch_code_word(bus)? as u32,
            (0, _) => 0,
            (1, _) => self.fetch_code_byte(bus)? as i8 as i32 as u32,
            (2, _) => self.fetch_code_word(bus)? as u32,
            _ => unreachable!(),
        };
        self.modrm.disp = disp;

        let (base, default_seg, cycles) = match rm {
            0 => (
                self.regs.read16(REG_EBX as u8).wrapping_add(self.regs.read16(REG_ESI as u8)),
                SegReg::Ds,
                7,
            ),
            1 => (
                self.regs.read16(REG_EBX as u8).wrapping_add(self.regs.read16(REG_EDI as u8)),
                SegReg::Ds,
                8,
            ),
            2 => (
                self.regs.read16(REG_EBP as u8).wrapping_add(self.regs.read16(REG_ESI as u8)),
                SegReg::Ss,
                8,
            ),
            3 => (
                self.regs.read16(REG_EBP as u8).wrapping_add(self.regs.read16(REG_EDI as u8)),
                SegReg::Ss,
                7,
            ),
            4 => (self.regs.read16(REG_ESI as u8), SegReg::Ds, 5),
            5 => (self.regs.read16(REG_EDI as u8), SegReg::Ds, 5),
            6 => {
                if md == 0 {
                    // disp16 substitutes for BP.
                    (0, SegReg::Ds, 6)
                } else {
                    (self.regs.read16(REG_EBP as u8), SegReg::Ss, 5)
                }
            }
            _ => (self.regs.read16(REG_EBX as u8), SegReg::Ds, 5),
        };

        // Displacement on top of base+index raises the cost bracket.
        let cycles = match (md, rm) {
            (0, 6) => 6,
            (0, _) => cycles,
            (_, 0) | (_, 3) => 11,
            (_, 1) | (_, 2) => 12,
            _ => 9,
        };

        let offset = (base.wrapping_add(disp as u16)) as u32;
        let seg = self.fetch.prefixes.seg_override.unwrap_or(default_seg);
        self.modrm.mem = Some(MemRef {
            seg,
            offset,
            addr16: true,
        });
        self.modrm.ea_cycles = cycles;
        Ok(())
    }

    /// 32-bit effective address, including the SIB forms.
    fn decode_ea32(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let md = self.modrm.mod_field();
        let rm = self.modrm.rm_field();

        let mut base: u32 = 0;
        let mut default_seg = SegReg::Ds;
        let mut cycles: u8 = 5;
        let mut no_base = false;

        if rm == 4 {
            // SIB byte.
            let sib = self.fetch_code_byte(bus)?;
            self.modrm.sib = Some(sib);
            let scale = sib >> 6;
            let index = (sib >> 3) & 7;
            let sib_base = sib & 7;

            if index != 4 {
                base = base.wrapping_add(self.regs.read32(index) << scale);
                cycles = 7;
            }
            if sib_base == 5 && md == 0 {
                // disp32 with no base register.
                no_base = true;
            } else {
                base = base.wrapping_add(self.regs.read32(sib_base));
                if sib_base == REG_EBP as u8 || sib_base == REG_ESP as u8 {
                    default_seg = SegReg::Ss;
                }
            }
        } else if rm == 5 && md == 0 {
            no_base = true;
            cycles = 6;
        } else {
            base = self.regs.read32(rm);
            if rm == REG_EBP as u8 {
                default_seg = SegReg::Ss;
            }
        }

        let disp = match md {
            0 if no_base => self.fetch_code_dword(bus)?,
            0 => 0,
            1 => self.fetch_code_byte(bus)? as i8 as i32 as u32,
            _ => self.fetch_code_dword(bus)?,
        };
        self.modrm.disp = disp;
        if disp != 0 && !no_base {
            cycles = cycles.max(9);
        }

        let offset = base.wrapping_add(disp);
        let seg = self.fetch.prefixes.seg_override.unwrap_or(default_seg);
        self.modrm.mem = Some(MemRef {
            seg,
            offset,
            addr16: false,
        });
        self.modrm.ea_cycles = cycles;
        Ok(())
    }

    // ========== Typed operand access ==========

    /// Read an 8-bit operand.
    pub fn read_op8(&mut self, bus: &mut Bus, op: Operand) -> ExecResult<u8> {
        match op {
            Operand::Reg8(r) => Ok(self.regs.read8(r)),
            Operand::Mem(m) => self.mmu_rb(bus, MemSeg::Desc(m.seg), m.offset, false, m.addr16),
            _ => Ok(0),
        }
    }

    /// Write an 8-bit operand.
    pub fn write_op8(&mut self, bus: &mut Bus, op: Operand, value: u8) -> ExecResult<()> {
        match op {
            Operand::Reg8(r) => {
                self.regs.write8(r, value);
                Ok(())
            }
            Operand::Mem(m) => self.mmu_wb(bus, MemSeg::Desc(m.seg), m.offset, value, m.addr16),
            _ => Ok(()),
        }
    }

    /// Read a 16-bit operand.
    pub fn read_op16(&mut self, bus: &mut Bus, op: Operand) -> ExecResult<u16> {
        match op {
            Operand::Reg16(r) => Ok(self.regs.read16(r)),
            Operand::Mem(m) => self.mmu_rw(bus, MemSeg::Desc(m.seg), m.offset, false, m.addr16),
            _ => Ok(0),
        }
    }

    /// Write a 16-bit operand.
    pub fn write_op16(&mut self, bus: &mut Bus, op: Operand, value: u16) -> ExecResult<()> {
        match op {
            Operand::Reg16(r) => {
                self.regs.write16(r, value);
                Ok(())
            }
            Operand::Mem(m) => self.mmu_ww(bus, MemSeg::Desc(m.seg), m.offset, value, m.addr16),
            _ => Ok(()),
        }
    }

    /// Read a 32-bit operand.
    pub fn read_op32(&mut self, bus: &mut Bus, op: Operand) -> ExecResult<u32> {
        match op {
            Operand::Reg32(r) => Ok(self.regs.read32(r)),
            Operand::Mem(m) => self.mmu_rdw(bus, MemSeg::Desc(m.seg), m.offset, false, m.addr16),
            _ => Ok(0),
        }
    }

    /// Write a 32-bit operand.
    pub fn write_op32(&mut self, bus: &mut Bus, op: Operand, value: u32) -> ExecResult<()> {
        match op {
            Operand::Reg32(r) => {
                self.regs.write32(r, value);
                Ok(())
            }
            Operand::Mem(m) => self.mmu_wdw(bus, MemSeg::Desc(m.seg), m.offset, value, m.addr16),
            _ => Ok(()),
        }
    }

    /// Read an operand of the current operand size, widened to u32.
    pub fn read_op(&mut self, bus: &mut Bus, op: Operand) -> ExecResult<u32> {
        match op {
            Operand::Reg16(_) => Ok(self.read_op16(bus, op)? as u32),
            Operand::Mem(_) if !self.fetch.operand_size32 => Ok(self.read_op16(bus, op)? as u32),
            _ => self.read_op32(bus, op),
        }
    }

    /// Write an operand of the current operand size from a u32.
    pub fn write_op(&mut self, bus: &mut Bus, op: Operand, value: u32) -> ExecResult<()> {
        match op {
            Operand::Reg16(_) => self.write_op16(bus, op, value as u16),
            Operand::Mem(_) if !self.fetch.operand_size32 => {
                self.write_op16(bus, op, value as u16)
            }
            _ => self.write_op32(bus, op, value),
        }
    }
}
