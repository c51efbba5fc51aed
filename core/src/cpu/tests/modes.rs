//! Operating modes and protection: real/protected/V86 transitions,
//! privilege rules, segment loads, and the hardware task switch.

use super::*;
use crate::cpu::descriptor::SegSource;
use crate::cpu::flags;
use crate::cpu::interrupts::{EXC_GP, EXC_SS};
use crate::cpu::registers::{REG_EAX, REG_EBX, REG_ESP};

#[test]
fn test_reset_state_8086_vs_386() {
    let cpu = Cpu::new(0, CpuModel::I8086);
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0xF000);
    assert_eq!(cpu.regs.eip, 0xFFF0);
    assert_eq!(cpu.descriptors[SegReg::Cs as usize].base, 0xF0000);

    // 386+ parts start with the CS base high bits set so the first
    // fetch reads the top of the address space.
    let cpu = Cpu::new(0, CpuModel::I80386);
    assert_eq!(cpu.descriptors[SegReg::Cs as usize].base, 0xFFFF_0000);
    assert_eq!(
        cpu.descriptors[SegReg::Cs as usize]
            .base
            .wrapping_add(cpu.regs.eip),
        0xFFFF_FFF0
    );
}

#[test]
fn test_reset_vector_reads_bios_byte() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    let mut rom = vec![0x00u8; 0x10000];
    rom[0xFFF0] = 0xEA;
    bus.mem.load_system_bios(&rom).unwrap();

    // Rebuild the power-on CS and fetch through the MMU.
    cpu.reset(crate::cpu::ResetKind::Hard);
    let byte = cpu
        .mmu_rb(
            &mut bus,
            crate::cpu::mmu::MemSeg::Desc(SegReg::Cs),
            cpu.regs.eip,
            true,
            true,
        )
        .unwrap();
    assert_eq!(byte, 0xEA);

    // The 8086 fetches the same byte through the 1 MB alias.
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    bus.mem.load_system_bios(&rom).unwrap();
    cpu.reset(crate::cpu::ResetKind::Hard);
    let byte = cpu
        .mmu_rb(
            &mut bus,
            crate::cpu::mmu::MemSeg::Desc(SegReg::Cs),
            cpu.regs.eip,
            true,
            true,
        )
        .unwrap();
    assert_eq!(byte, 0xEA);
}

#[test]
fn test_cpl_forced_by_mode() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    assert_eq!(cpu.mode, CpuMode::Real);
    assert_eq!(cpu.cpl, 0);

    enter_protected(&mut cpu, &mut bus, 0x10000);
    assert_eq!(cpu.mode, CpuMode::Protected);
    assert_eq!(cpu.cpl, 0);

    // V86 forces CPL 3.
    cpu.regs.eflags |= flags::VM;
    cpu.mode = crate::cpu::registers::derive_mode(cpu.regs.cr[0], cpu.regs.eflags);
    assert_eq!(cpu.mode, CpuMode::Virtual8086);
}

#[test]
fn test_null_ss_load_is_gp0() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    enter_protected(&mut cpu, &mut bus, 0x10000);
    let err = cpu
        .segment_written(&mut bus, SegReg::Ss, 0, SegSource::StackLoad)
        .unwrap_err();
    assert_eq!(err.vector, EXC_GP);
    assert_eq!(err.error_code, Some(0));
}

#[test]
fn test_null_data_segment_loads_but_faults_on_use() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    enter_protected(&mut cpu, &mut bus, 0x10000);
    cpu.segment_written(&mut bus, SegReg::Es, 0, SegSource::Load)
        .unwrap();
    let err = cpu
        .mmu_rb(&mut bus, crate::cpu::mmu::MemSeg::Desc(SegReg::Es), 0, false, false)
        .unwrap_err();
    assert_eq!(err.vector, EXC_GP);
}

#[test]
fn test_ss_rpl_must_match_cpl() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    let (_, data) = enter_protected(&mut cpu, &mut bus, 0x10000);
    // RPL 3 with CPL 0 is rejected.
    let err = cpu
        .segment_written(&mut bus, SegReg::Ss, data | 3, SegSource::StackLoad)
        .unwrap_err();
    assert_eq!(err.vector, EXC_GP);
}

#[test]
fn test_not_present_ss_is_ss_fault() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    enter_protected(&mut cpu, &mut bus, 0x10000);
    let mut gdt = GdtBuilder::at(0x10000);
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x9A, 0xC));
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x92, 0xC));
    let absent = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x12, 0xC));
    cpu.regs.gdtr.limit = gdt.limit();

    let err = cpu
        .segment_written(&mut bus, SegReg::Ss, absent, SegSource::StackLoad)
        .unwrap_err();
    assert_eq!(err.vector, EXC_SS);
}

#[test]
fn test_conforming_code_keeps_cpl() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    let (_, data) = enter_protected(&mut cpu, &mut bus, 0x10000);
    let mut gdt = GdtBuilder::at(0x10000);
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x9A, 0xC));
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x92, 0xC));
    // Conforming code at DPL 0.
    let conforming = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x9E, 0xC));
    // Ring-3 data for the outer stack.
    let data3 = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0xF2, 0xC));
    cpu.regs.gdtr.limit = gdt.limit();

    // Drop to CPL 3 by hand: ring-3 stack and flat ring-3 code shadow.
    cpu.cpl = 3;
    cpu.install_descriptor(
        SegReg::Cs,
        0x0B,
        SegmentDescriptor::from_raw(make_descriptor(0, 0xFFFFF, 0xFA, 0xC)),
    );
    cpu.segment_written(&mut bus, SegReg::Ss, data3 | 3, SegSource::StackLoad)
        .unwrap();
    let _ = data;

    // Far jump into the conforming DPL-0 segment: legal, CPL stays 3.
    cpu.far_jump(&mut bus, conforming | 3, 0x2000).unwrap();
    assert_eq!(cpu.cpl, 3);
    assert_eq!(cpu.regs.eip, 0x2000);
    // The live selector carries the caller's privilege.
    assert_eq!(cpu.regs.seg(SegReg::Cs) & 3, 3);
}

#[test]
fn test_nonconforming_jump_to_inner_ring_faults() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    let (code0, data) = enter_protected(&mut cpu, &mut bus, 0x10000);
    let mut gdt = GdtBuilder::at(0x10000);
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x9A, 0xC));
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x92, 0xC));
    let data3 = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0xF2, 0xC));
    cpu.regs.gdtr.limit = gdt.limit();

    cpu.cpl = 3;
    cpu.install_descriptor(
        SegReg::Cs,
        0x0B,
        SegmentDescriptor::from_raw(make_descriptor(0, 0xFFFFF, 0xFA, 0xC)),
    );
    cpu.segment_written(&mut bus, SegReg::Ss, data3 | 3, SegSource::StackLoad)
        .unwrap();
    let _ = data;

    let err = cpu.far_jump(&mut bus, code0 | 3, 0x2000).unwrap_err();
    assert_eq!(err.vector, EXC_GP);
}

#[test]
fn test_lgdt_sgdt_round_trip() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    // Pseudo-descriptor at DS:2000: limit 0x27, base 0x00345678.
    write_mem(&mut bus, 0x2000, &[0x27, 0x00, 0x78, 0x56, 0x34, 0x00]);
    write_code(&cpu, &mut bus, &[0x0F, 0x01, 0x16, 0x00, 0x20]); // LGDT [2000]
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.gdtr.limit, 0x27);
    assert_eq!(cpu.regs.gdtr.base, 0x0034_5678);

    // SGDT writes it back.
    write_mem(&mut bus, cpu.regs.eip, &[0x0F, 0x01, 0x06, 0x00, 0x30]); // SGDT [3000]
    step(&mut cpu, &mut bus);
    assert_eq!(bus.mem.peek_byte(0x3000), 0x27);
    assert_eq!(bus.mem.peek_byte(0x3002), 0x78);
    assert_eq!(bus.mem.peek_byte(0x3004), 0x34);
}

#[test]
fn test_lmsw_enters_protected_but_cannot_leave() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80286);
    cpu.regs.set_ax(0x0001);
    write_code(&cpu, &mut bus, &[0x0F, 0x01, 0xF0]); // LMSW AX
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.mode, CpuMode::Protected);

    // LMSW cannot clear PE again.
    cpu.regs.set_ax(0x0000);
    cpu.regs.eip = 0x100;
    cpu.install_descriptor(
        SegReg::Cs,
        8,
        SegmentDescriptor::from_raw(make_descriptor(0, 0xFFFF, 0x9A, 0)),
    );
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.mode, CpuMode::Protected);
}

#[test]
fn test_cli_gated_by_iopl() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    enter_protected(&mut cpu, &mut bus, 0x10000);
    cpu.cpl = 3;
    cpu.regs.write_eflags(cpu.regs.eflags & !flags::IOPL); // IOPL 0
    cpu.fetch.opcode = 0xFA; // CLI
    let err = cpu.exec_flag_op().unwrap_err();
    assert_eq!(err.vector, EXC_GP);

    // At IOPL 3 it goes through.
    cpu.regs.write_eflags(cpu.regs.eflags | flags::IOPL);
    cpu.exec_flag_op().unwrap();
    assert!(!cpu.regs.flag(flags::IF));
}

#[test]
fn test_hlt_requires_ring0() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    enter_protected(&mut cpu, &mut bus, 0x10000);
    cpu.cpl = 3;
    let err = cpu.exec_hlt().unwrap_err();
    assert_eq!(err.vector, EXC_GP);
    cpu.cpl = 0;
    cpu.exec_hlt().unwrap();
    assert!(cpu.halted);
}

#[test]
fn test_reserved_eflags_stay_canonical() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80286);
    // A run of ordinary instructions never disturbs the reserved bits.
    write_code(
        &cpu,
        &mut bus,
        &[0xB8, 0xFF, 0xFF, 0x40, 0x48, 0x31, 0xC0, 0x90],
    );
    for _ in 0..5 {
        step(&mut cpu, &mut bus);
        assert_ne!(cpu.regs.eflags & flags::RESERVED1, 0);
        assert_eq!(cpu.regs.eflags & (1 << 3), 0);
        assert_eq!(cpu.regs.eflags & (1 << 5), 0);
        assert_eq!(cpu.regs.eflags & 0x8000, 0); // 286 bit 15
    }
}

#[test]
fn test_task_switch_through_tss() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    let (code, data) = enter_protected(&mut cpu, &mut bus, 0x10000);
    let mut gdt = GdtBuilder::at(0x10000);
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x9A, 0xC));
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x92, 0xC));
    // Two 386 TSS segments: current (busy) and target (available).
    let tss_old = gdt.push(&mut bus, make_descriptor(0x30000, 0x67, 0x8B, 0));
    let tss_new = gdt.push(&mut bus, make_descriptor(0x31000, 0x67, 0x89, 0));
    cpu.regs.gdtr.limit = gdt.limit();

    cpu.install_descriptor(
        SegReg::Tr,
        tss_old,
        SegmentDescriptor::from_raw(make_descriptor(0x30000, 0x67, 0x8B, 0)),
    );

    // Fill the incoming TSS image.
    let w32 = |bus: &mut Bus, addr: u32, value: u32| {
        for i in 0..4 {
            bus.mem.poke_byte(addr + i, (value >> (8 * i)) as u8);
        }
    };
    let base = 0x31000;
    w32(&mut bus, base + 0x20, 0x4000); // EIP
    w32(&mut bus, base + 0x24, 0x0002); // EFLAGS
    w32(&mut bus, base + 0x28, 0x1111); // EAX
    w32(&mut bus, base + 0x38, 0x9000); // ESP
    w32(&mut bus, base + 0x48, data as u32); // ES
    w32(&mut bus, base + 0x4C, code as u32); // CS
    w32(&mut bus, base + 0x50, data as u32); // SS
    w32(&mut bus, base + 0x54, data as u32); // DS

    cpu.task_switch_to(
        &mut bus,
        tss_new,
        crate::cpu::tasking::TaskSwitchReason::Jmp,
        None,
    )
    .unwrap();

    assert_eq!(cpu.regs.eip, 0x4000);
    assert_eq!(cpu.regs.read32(REG_EAX as u8), 0x1111);
    assert_eq!(cpu.regs.seg(SegReg::Tr), tss_new);
    assert_eq!(cpu.regs.read32(REG_ESP as u8), 0x9000);
    // The outgoing state landed in the old TSS (EIP was 0x1000).
    let saved_eip = bus.mem.peek_byte(0x30020) as u32
        | (bus.mem.peek_byte(0x30021) as u32) << 8;
    assert_eq!(saved_eip, 0x1000);
    // CR0.TS is set after any task switch.
    assert_ne!(cpu.regs.cr[0] & crate::cpu::registers::CR0_TS, 0);
}

#[test]
fn test_lar_lsl() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    let (_, data) = enter_protected(&mut cpu, &mut bus, 0x10000);
    cpu.regs.write16(REG_EBX as u8, data);
    write_code(&cpu, &mut bus, &[0x0F, 0x03, 0xC3]); // LSL AX,BX
    step(&mut cpu, &mut bus);
    assert!(cpu.regs.flag(flags::ZF));
    assert_eq!(cpu.regs.ax(), 0xFFFF); // low word of the 4 GB limit
}

#[test]
fn test_address_wrap_at_64k_in_real_mode() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    // MOV AX,[BX+2] with BX = FFFF wraps to offset 0001.
    cpu.regs.write16(REG_EBX as u8, 0xFFFF);
    write_mem(&mut bus, 0x0001, &[0x77, 0x66]);
    write_code(&cpu, &mut bus, &[0x8B, 0x47, 0x02]); // MOV AX,[BX+2]
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.ax(), 0x6677);
}
