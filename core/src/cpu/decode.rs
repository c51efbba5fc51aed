//! Instruction fetch and decode.
//!
//! Fetch is a resumable sub-state machine over phases (opcode, prefixes,
//! 0F escape, ModR/M, SIB, displacement, immediate); the current phase is
//! tracked so a fault mid-decode restarts the instruction cleanly. Prefix
//! handling is group-last-wins: LOCK/REP in group 1, segment overrides in
//! group 2, operand size (66) in group 3, address size (67) in group 4.
//! FS/GS overrides and 66/67 decode as prefixes only on 386+ parts.
//!
//! A 1024-entry information table keyed on
//! `(opcode << 2) | (is_0F << 1) | operand_size_bit` records per-opcode
//! metadata: ModR/M presence, immediate layout, LOCK legality, and the
//! base timing class.

use super::interrupts::{Fault, EXC_GP, EXC_UD};
use super::registers::SegReg;
use super::{Cpu, ExecResult};
use crate::bus::Bus;
use crate::cpu::mmu::MemSeg;

/// Hard ceiling on total instruction length, prefixes included.
pub const MAX_INSTRUCTION_BYTES: u32 = 15;

/// Fetch sub-phase, advanced as decode proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPhase {
    /// Between instructions
    #[default]
    Idle,
    /// Reading the first opcode byte
    Opcode,
    /// Reading prefix bytes (or the opcode that ends them)
    Prefixes,
    /// Reading the second byte of a 0F escape
    Escape0F,
    /// Reading the ModR/M byte
    ModRm,
    /// Reading the SIB byte
    Sib,
    /// Reading displacement bytes
    Displacement,
    /// Reading immediate bytes
    Immediate,
    /// Decode complete
    Done,
}

/// REP-class prefix in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepKind {
    /// F2
    Repne,
    /// F3
    Repe,
}

/// Prefix bit positions in `Prefixes::bitset`, one per recognized byte.
pub mod prefix_bit {
    pub const LOCK: u32 = 1 << 0; // F0
    pub const REPNE: u32 = 1 << 1; // F2
    pub const REPE: u32 = 1 << 2; // F3
    pub const ES: u32 = 1 << 3; // 26
    pub const CS: u32 = 1 << 4; // 2E
    pub const SS: u32 = 1 << 5; // 36
    pub const DS: u32 = 1 << 6; // 3E
    pub const FS: u32 = 1 << 7; // 64
    pub const GS: u32 = 1 << 8; // 65
    pub const OPSIZE: u32 = 1 << 9; // 66
    pub const ADDRSIZE: u32 = 1 << 10; // 67
}

/// Accumulated prefix state for one instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct Prefixes {
    /// One bit per recognized prefix byte
    pub bitset: u32,
    /// F0 seen
    pub lock: bool,
    /// Last group-1 REP prefix
    pub rep: Option<RepKind>,
    /// Last group-2 segment override
    pub seg_override: Option<SegReg>,
    /// 66 seen (flips operand size from the CS.D default)
    pub opsize_flip: bool,
    /// 67 seen (flips address size from the CS.D default)
    pub addrsize_flip: bool,
    /// Number of prefix bytes consumed
    pub count: u32,
}

/// Fetch/decode state of the current instruction.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchState {
    pub phase: FetchPhase,
    pub prefixes: Prefixes,
    /// Primary opcode byte
    pub opcode: u8,
    /// 0F escape seen
    pub is_0f: bool,
    /// Effective operand size for this instruction
    pub operand_size32: bool,
    /// Effective address size for this instruction
    pub address_size32: bool,
    /// Immediate value (zero-extended)
    pub imm: u32,
    /// Second immediate (far-pointer selector, ENTER level)
    pub imm2: u32,
    /// EIP of the first byte of the instruction
    pub start_eip: u32,
    /// EIP of the last prefix byte; REP resumes here (the 8086/286
    /// multi-prefix behavior returns to the last prefix, not the first)
    pub rep_resume_eip: u32,
    /// Total bytes consumed so far
    pub len: u32,
}

/// Immediate layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImmKind {
    None,
    /// One byte
    Imm8,
    /// One word regardless of operand size (RET imm16)
    Imm16,
    /// Word or dword by operand size
    ImmOp,
    /// imm16 then imm8 (ENTER)
    Imm16Imm8,
    /// Far pointer: offset by operand size, then a selector word
    FarPtr,
    /// Offset by address size (MOV moffs forms)
    Moffs,
    /// F6/F7 group: immediate only for the TEST rows (/0, /1)
    TestGroup,
}

/// LOCK-prefix legality for an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRule {
    /// #UD with LOCK
    Never,
    /// Legal when the destination is a memory operand
    WriteMem,
    /// Legal when memory destination and the reg field is in the mask
    Group(u8),
}

/// Per-opcode decode metadata.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    pub has_modrm: bool,
    pub imm: ImmKind,
    pub lock: LockRule,
    /// Base timing class in cycles
    pub base_cycles: u8,
}

const fn info(has_modrm: bool, imm: ImmKind, lock: LockRule, base_cycles: u8) -> OpcodeInfo {
    OpcodeInfo {
        has_modrm,
        imm,
        lock,
        base_cycles,
    }
}

/// Metadata for a one-byte-map opcode.
const fn one_byte_info(op: u8) -> OpcodeInfo {
    match op {
        // ALU r/m,r and r,r/m rows.
        0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B | 0x20..=0x23 | 0x28..=0x2B
        | 0x30..=0x33 => info(true, ImmKind::None, LockRule::WriteMem, 3),
        0x38..=0x3B => info(true, ImmKind::None, LockRule::Never, 3),
        // ALU AL/eAX,imm.
        0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
            info(false, ImmKind::Imm8, LockRule::Never, 4)
        }
        0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
            info(false, ImmKind::ImmOp, LockRule::Never, 4)
        }
        // Segment push/pop, DAA/DAS/AAA/AAS, INC/DEC/PUSH/POP reg.
        0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F => {
            info(false, ImmKind::None, LockRule::Never, 10)
        }
        0x27 | 0x2F | 0x37 | 0x3F => info(false, ImmKind::None, LockRule::Never, 4),
        0x40..=0x5F => info(false, ImmKind::None, LockRule::Never, 3),
        // PUSHA/POPA, BOUND, ARPL.
        0x60 | 0x61 => info(false, ImmKind::None, LockRule::Never, 19),
        0x62 => info(true, ImmKind::None, LockRule::Never, 13),
        0x63 => info(true, ImmKind::None, LockRule::Never, 10),
        // PUSH imm, IMUL imm.
        0x68 => info(false, ImmKind::ImmOp, LockRule::Never, 3),
        0x69 => info(true, ImmKind::ImmOp, LockRule::Never, 21),
        0x6A => info(false, ImmKind::Imm8, LockRule::Never, 3),
        0x6B => info(true, ImmKind::Imm8, LockRule::Never, 21),
        // INS/OUTS.
        0x6C..=0x6F => info(false, ImmKind::None, LockRule::Never, 14),
        // Jcc rel8.
        0x70..=0x7F => info(false, ImmKind::Imm8, LockRule::Never, 4),
        // Group 1 immediates.
        0x80 | 0x82 => info(true, ImmKind::Imm8, LockRule::Group(0x7F), 4),
        0x81 => info(true, ImmKind::ImmOp, LockRule::Group(0x7F), 4),
        0x83 => info(true, ImmKind::Imm8, LockRule::Group(0x7F), 4),
        // TEST, XCHG.
        0x84 | 0x85 => info(true, ImmKind::None, LockRule::Never, 3),
        0x86 | 0x87 => info(true, ImmKind::None, LockRule::WriteMem, 4),
        // MOV r/m forms, MOV Sreg, LEA, POP r/m.
        0x88..=0x8B => info(true, ImmKind::None, LockRule::Never, 2),
        0x8C | 0x8E => info(true, ImmKind::None, LockRule::Never, 2),
        0x8D => info(true, ImmKind::None, LockRule::Never, 2),
        0x8F => info(true, ImmKind::None, LockRule::Never, 5),
        // NOP/XCHG eAX, CBW/CWD, CALL far, WAIT, PUSHF/POPF, SAHF/LAHF.
        0x90..=0x97 => info(false, ImmKind::None, LockRule::Never, 3),
        0x98 | 0x99 => info(false, ImmKind::None, LockRule::Never, 2),
        0x9A => info(false, ImmKind::FarPtr, LockRule::Never, 28),
        0x9B => info(false, ImmKind::None, LockRule::Never, 4),
        0x9C | 0x9D => info(false, ImmKind::None, LockRule::Never, 10),
        0x9E | 0x9F => info(false, ImmKind::None, LockRule::Never, 4),
        // MOV moffs, string ops, TEST imm.
        0xA0..=0xA3 => info(false, ImmKind::Moffs, LockRule::Never, 10),
        0xA4..=0xA7 => info(false, ImmKind::None, LockRule::Never, 18),
        0xA8 => info(false, ImmKind::Imm8, LockRule::Never, 4),
        0xA9 => info(false, ImmKind::ImmOp, LockRule::Never, 4),
        0xAA..=0xAF => info(false, ImmKind::None, LockRule::Never, 11),
        // MOV reg,imm.
        0xB0..=0xB7 => info(false, ImmKind::Imm8, LockRule::Never, 4),
        0xB8..=0xBF => info(false, ImmKind::ImmOp, LockRule::Never, 4),
        // Shift groups, RET, LES/LDS, MOV r/m,imm.
        0xC0 | 0xC1 => info(true, ImmKind::Imm8, LockRule::Never, 5),
        0xC2 => info(false, ImmKind::Imm16, LockRule::Never, 20),
        0xC3 => info(false, ImmKind::None, LockRule::Never, 16),
        0xC4 | 0xC5 => info(true, ImmKind::None, LockRule::Never, 16),
        0xC6 => info(true, ImmKind::Imm8, LockRule::Never, 10),
        0xC7 => info(true, ImmKind::ImmOp, LockRule::Never, 10),
        // ENTER/LEAVE, RETF, INT/INTO/IRET.
        0xC8 => info(false, ImmKind::Imm16Imm8, LockRule::Never, 15),
        0xC9 => info(false, ImmKind::None, LockRule::Never, 8),
        0xCA => info(false, ImmKind::Imm16, LockRule::Never, 25),
        0xCB => info(false, ImmKind::None, LockRule::Never, 25),
        0xCC => info(false, ImmKind::None, LockRule::Never, 52),
        0xCD => info(false, ImmKind::Imm8, LockRule::Never, 51),
        0xCE => info(false, ImmKind::None, LockRule::Never, 4),
        0xCF => info(false, ImmKind::None, LockRule::Never, 32),
        // Shift groups by 1/CL, AAM/AAD, XLAT, FPU escape.
        0xD0..=0xD3 => info(true, ImmKind::None, LockRule::Never, 5),
        0xD4 | 0xD5 => info(false, ImmKind::Imm8, LockRule::Never, 83),
        0xD6 => info(false, ImmKind::None, LockRule::Never, 4),
        0xD7 => info(false, ImmKind::None, LockRule::Never, 11),
        0xD8..=0xDF => info(true, ImmKind::None, LockRule::Never, 2),
        // LOOP/JCXZ, IN/OUT, CALL/JMP.
        0xE0..=0xE3 => info(false, ImmKind::Imm8, LockRule::Never, 8),
        0xE4 | 0xE5 | 0xE6 | 0xE7 => info(false, ImmKind::Imm8, LockRule::Never, 10),
        0xE8 | 0xE9 => info(false, ImmKind::ImmOp, LockRule::Never, 15),
        0xEA => info(false, ImmKind::FarPtr, LockRule::Never, 15),
        0xEB => info(false, ImmKind::Imm8, LockRule::Never, 15),
        0xEC..=0xEF => info(false, ImmKind::None, LockRule::Never, 8),
        // HLT/CMC, group 3, CLC..STD, group 4/5.
        0xF4 => info(false, ImmKind::None, LockRule::Never, 2),
        0xF5 => info(false, ImmKind::None, LockRule::Never, 2),
        0xF6 | 0xF7 => info(true, ImmKind::TestGroup, LockRule::Group(0x0C), 3),
        0xF8..=0xFD => info(false, ImmKind::None, LockRule::Never, 2),
        0xFE => info(true, ImmKind::None, LockRule::Group(0x03), 3),
        0xFF => info(true, ImmKind::None, LockRule::Group(0x03), 3),
        _ => info(false, ImmKind::None, LockRule::Never, 3),
    }
}

/// Metadata for a 0F-map opcode.
const fn two_byte_info(op: u8) -> OpcodeInfo {
    match op {
        // System groups: SLDT/STR/LLDT/LTR/VERR/VERW and SGDT/SIDT/LGDT/
        // LIDT/SMSW/LMSW/INVLPG.
        0x00 | 0x01 => info(true, ImmKind::None, LockRule::Never, 10),
        0x02 | 0x03 => info(true, ImmKind::None, LockRule::Never, 14),
        // LOADALL (286 at 0F05, 386 at 0F07).
        0x05 | 0x07 => info(false, ImmKind::None, LockRule::Never, 195),
        0x06 => info(false, ImmKind::None, LockRule::Never, 2),
        0x08 | 0x09 => info(false, ImmKind::None, LockRule::Never, 4),
        // MOV CR/DR/TR.
        0x20..=0x26 => info(true, ImmKind::None, LockRule::Never, 6),
        // WRMSR/RDTSC/RDMSR.
        0x30..=0x32 => info(false, ImmKind::None, LockRule::Never, 20),
        // Jcc rel16/32.
        0x80..=0x8F => info(false, ImmKind::ImmOp, LockRule::Never, 4),
        // SETcc.
        0x90..=0x9F => info(true, ImmKind::None, LockRule::Never, 4),
        // PUSH/POP FS/GS, CPUID, BT, SHLD.
        0xA0 | 0xA1 | 0xA8 | 0xA9 => info(false, ImmKind::None, LockRule::Never, 10),
        0xA2 => info(false, ImmKind::None, LockRule::Never, 14),
        0xA3 => info(true, ImmKind::None, LockRule::Never, 3),
        0xA4 | 0xAC => info(true, ImmKind::Imm8, LockRule::Never, 3),
        0xA5 | 0xAD => info(true, ImmKind::None, LockRule::Never, 3),
        0xAB | 0xB3 | 0xBB => info(true, ImmKind::None, LockRule::WriteMem, 6),
        // CMPXCHG, LSS/LFS/LGS, MOVZX/MOVSX.
        0xB0 | 0xB1 => info(true, ImmKind::None, LockRule::WriteMem, 6),
        0xB2 | 0xB4 | 0xB5 => info(true, ImmKind::None, LockRule::Never, 16),
        0xB6 | 0xB7 | 0xBE | 0xBF => info(true, ImmKind::None, LockRule::Never, 3),
        // Group 8 (BT imm8), BSF/BSR.
        0xBA => info(true, ImmKind::Imm8, LockRule::Group(0xE0), 6),
        0xBC | 0xBD => info(true, ImmKind::None, LockRule::Never, 10),
        // XADD, CMPXCHG8B, BSWAP.
        0xC0 | 0xC1 => info(true, ImmKind::None, LockRule::WriteMem, 5),
        0xC7 => info(true, ImmKind::None, LockRule::Group(0x02), 10),
        0xC8..=0xCF => info(false, ImmKind::None, LockRule::Never, 1),
        0xAF => info(true, ImmKind::None, LockRule::Never, 21),
        _ => info(false, ImmKind::None, LockRule::Never, 3),
    }
}

/// The 1024-entry information table.
pub static OPCODE_INFO: [OpcodeInfo; 1024] = {
    let mut table = [info(false, ImmKind::None, LockRule::Never, 3); 1024];
    let mut op = 0usize;
    while op < 256 {
        // Operand-size bit does not change layout; both rows share the
        // entry, the immediate width is resolved through ImmKind::ImmOp.
        let one = one_byte_info(op as u8);
        let two = two_byte_info(op as u8);
        table[op << 2] = one;
        table[(op << 2) | 1] = one;
        table[(op << 2) | 2] = two;
        table[(op << 2) | 3] = two;
        op += 1;
    }
    table
};

/// Look up decode metadata for an opcode.
#[inline]
pub fn opcode_info(opcode: u8, is_0f: bool, opsize32: bool) -> &'static OpcodeInfo {
    &OPCODE_INFO[((opcode as usize) << 2) | ((is_0f as usize) << 1) | opsize32 as usize]
}

impl Cpu {
    /// Fetch one code byte at CS:EIP and advance EIP (wrapping at 64 KB in
    /// a 16-bit code segment).
    pub fn fetch_code_byte(&mut self, bus: &mut Bus) -> ExecResult<u8> {
        if self.fetch.len >= MAX_INSTRUCTION_BYTES {
            return Err(Fault::with_code(EXC_GP, 0));
        }
        let cs32 = self.descriptors[SegReg::Cs as usize].is_32bit();
        let value = self.mmu_rb(bus, MemSeg::Desc(SegReg::Cs), self.regs.eip, true, !cs32)?;
        self.regs.eip = if cs32 {
            self.regs.eip.wrapping_add(1)
        } else {
            (self.regs.eip.wrapping_add(1)) & 0xFFFF
        };
        self.fetch.len += 1;
        Ok(value)
    }

    /// Fetch a code word.
    pub fn fetch_code_word(&mut self, bus: &mut Bus) -> ExecResult<u16> {
        let lo = self.fetch_code_byte(bus)? as u16;
        let hi = self.fetch_code_byte(bus)? as u16;
        Ok(lo | hi << 8)
    }

    /// Fetch a code dword.
    pub fn fetch_code_dword(&mut self, bus: &mut Bus) -> ExecResult<u32> {
        let lo = self.fetch_code_word(bus)? as u32;
        let hi = self.fetch_code_word(bus)? as u32;
        Ok(lo | hi << 16)
    }

    /// Fetch an immediate of the current operand size.
    pub fn fetch_code_imm(&mut self, bus: &mut Bus) -> ExecResult<u32> {
        if self.fetch.operand_size32 {
            self.fetch_code_dword(bus)
        } else {
            Ok(self.fetch_code_word(bus)? as u32)
        }
    }

    /// Decode one whole instruction at CS:EIP into `self.fetch` and
    /// `self.modrm`. Faults leave EIP wherever the failing byte was; the
    /// commit checkpoint restores it.
    pub fn decode_instruction(&mut self, bus: &mut Bus) -> ExecResult<()> {
        let cs32 = self.descriptors[SegReg::Cs as usize].is_32bit();
        self.fetch = FetchState {
            phase: FetchPhase::Opcode,
            start_eip: self.regs.eip,
            rep_resume_eip: self.regs.eip,
            ..FetchState::default()
        };
        self.modrm = super::modrm::ModrmState::default();

        // Prefix loop, group-last-wins.
        let has_386_prefixes = self.model.has_386_prefixes();
        let mut opcode;
        loop {
            let byte = self.fetch_code_byte(bus)?;
            let accepted = self.accept_prefix(byte, has_386_prefixes);
            match accepted {
                Some(bit) => {
                    self.fetch.phase = FetchPhase::Prefixes;
                    self.fetch.prefixes.bitset |= bit;
                    self.fetch.prefixes.count += 1;
                    // REP resumes at the last prefix byte.
                    self.fetch.rep_resume_eip = self.regs.eip.wrapping_sub(1);
                    if !cs32 {
                        self.fetch.rep_resume_eip &= 0xFFFF;
                    }
                }
                None => {
                    opcode = byte;
                    break;
                }
            }
        }

        // 0F escape exists on the 286 and later.
        if opcode == 0x0F && self.model >= crate::config::CpuModel::I80286 {
            self.fetch.phase = FetchPhase::Escape0F;
            self.fetch.is_0f = true;
            opcode = self.fetch_code_byte(bus)?;
        }
        self.fetch.opcode = opcode;

        // Effective sizes: CS.D default flipped by 66/67.
        self.fetch.operand_size32 = cs32 ^ self.fetch.prefixes.opsize_flip;
        self.fetch.address_size32 = cs32 ^ self.fetch.prefixes.addrsize_flip;

        let info = *opcode_info(opcode, self.fetch.is_0f, self.fetch.operand_size32);

        if info.has_modrm {
            self.fetch.phase = FetchPhase::ModRm;
            self.decode_modrm(bus)?;
        }

        self.fetch.phase = FetchPhase::Immediate;
        match info.imm {
            ImmKind::None => {}
            ImmKind::Imm8 => self.fetch.imm = self.fetch_code_byte(bus)? as u32,
            ImmKind::Imm16 => self.fetch.imm = self.fetch_code_word(bus)? as u32,
            ImmKind::ImmOp => self.fetch.imm = self.fetch_code_imm(bus)?,
            ImmKind::Imm16Imm8 => {
                self.fetch.imm = self.fetch_code_word(bus)? as u32;
                self.fetch.imm2 = self.fetch_code_byte(bus)? as u32;
            }
            ImmKind::FarPtr => {
                self.fetch.imm = self.fetch_code_imm(bus)?;
                self.fetch.imm2 = self.fetch_code_word(bus)? as u32;
            }
            ImmKind::Moffs => {
                self.fetch.imm = if self.fetch.address_size32 {
                    self.fetch_code_dword(bus)?
                } else {
                    self.fetch_code_word(bus)? as u32
                };
            }
            ImmKind::TestGroup => {
                // F6/F7 carry an immediate only on the TEST rows.
                if self.modrm.reg_field() <= 1 {
                    self.fetch.imm = if opcode == 0xF6 {
                        self.fetch_code_byte(bus)? as u32
                    } else {
                        self.fetch_code_imm(bus)?
                    };
                }
            }
        }

        // LOCK legality: #UD on 186+ when the rule rejects it.
        if self.fetch.prefixes.lock && self.model >= crate::config::CpuModel::NecV30 {
            let legal = match info.lock {
                LockRule::Never => false,
                LockRule::WriteMem => info.has_modrm && self.modrm.rm_is_mem(),
                LockRule::Group(mask) => {
                    info.has_modrm
                        && self.modrm.rm_is_mem()
                        && mask >> self.modrm.reg_field() & 1 != 0
                }
            };
            if !legal {
                return Err(Fault::new(EXC_UD));
            }
        }

        self.cycles.prefix += self.fetch.prefixes.count as u64;
        self.cycles.ea += self.modrm.ea_cycles as u64;
        self.fetch.phase = FetchPhase::Done;
        Ok(())
    }

    /// Classify one byte as a prefix, returning its bitset bit.
    fn accept_prefix(&mut self, byte: u8, has_386_prefixes: bool) -> Option<u32> {
        let prefixes = &mut self.fetch.prefixes;
        match byte {
            0xF0 => {
                prefixes.lock = true;
                Some(prefix_bit::LOCK)
            }
            0xF2 => {
                prefixes.rep = Some(RepKind::Repne);
                Some(prefix_bit::REPNE)
            }
            0xF3 => {
                prefixes.rep = Some(RepKind::Repe);
                Some(prefix_bit::REPE)
            }
            0x26 => {
                prefixes.seg_override = Some(SegReg::Es);
                Some(prefix_bit::ES)
            }
            0x2E => {
                prefixes.seg_override = Some(SegReg::Cs);
                Some(prefix_bit::CS)
            }
            0x36 => {
                prefixes.seg_override = Some(SegReg::Ss);
                Some(prefix_bit::SS)
            }
            0x3E => {
                prefixes.seg_override = Some(SegReg::Ds);
                Some(prefix_bit::DS)
            }
            0x64 if has_386_prefixes => {
                prefixes.seg_override = Some(SegReg::Fs);
                Some(prefix_bit::FS)
            }
            0x65 if has_386_prefixes => {
                prefixes.seg_override = Some(SegReg::Gs);
                Some(prefix_bit::GS)
            }
            0x66 if has_386_prefixes => {
                prefixes.opsize_flip = true;
                Some(prefix_bit::OPSIZE)
            }
            0x67 if has_386_prefixes => {
                prefixes.addrsize_flip = true;
                Some(prefix_bit::ADDRSIZE)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_table_modrm_rows() {
        assert!(opcode_info(0x01, false, false).has_modrm); // ADD r/m,r
        assert!(opcode_info(0x8B, false, false).has_modrm); // MOV r,r/m
        assert!(!opcode_info(0x90, false, false).has_modrm); // NOP
        assert!(opcode_info(0x01, true, false).has_modrm); // 0F01 group
        assert!(!opcode_info(0xA2, true, false).has_modrm); // CPUID
    }

    #[test]
    fn test_info_table_immediates() {
        assert_eq!(opcode_info(0xB0, false, false).imm, ImmKind::Imm8);
        assert_eq!(opcode_info(0xB8, false, false).imm, ImmKind::ImmOp);
        assert_eq!(opcode_info(0xC2, false, true).imm, ImmKind::Imm16);
        assert_eq!(opcode_info(0xC8, false, false).imm, ImmKind::Imm16Imm8);
        assert_eq!(opcode_info(0x9A, false, false).imm, ImmKind::FarPtr);
        assert_eq!(opcode_info(0xA1, false, false).imm, ImmKind::Moffs);
        assert_eq!(opcode_info(0xF7, false, false).imm, ImmKind::TestGroup);
    }

    #[test]
    fn test_lock_rules() {
        assert!(matches!(opcode_info(0x01, false, false).lock, LockRule::WriteMem));
        assert!(matches!(opcode_info(0x90, false, false).lock, LockRule::Never));
        // Group 1 allows LOCK for everything but CMP (/7).
        assert!(matches!(
            opcode_info(0x80, false, false).lock,
            LockRule::Group(0x7F)
        ));
        // Group 3 allows only NOT/NEG.
        assert!(matches!(
            opcode_info(0xF6, false, false).lock,
            LockRule::Group(0x0C)
        ));
    }
}
