//! String instructions and the REP repeat machine.

use super::*;
use crate::cpu::flags;
use crate::cpu::registers::{REG_ECX, REG_EDI, REG_ESI};

#[test]
fn test_rep_movsw_down_with_wrap() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    // DS = 3000, ES = 4000; DF set; CX = 3; SI = 0000, DI = 000A.
    cpu.install_descriptor(SegReg::Ds, 0x3000, SegmentDescriptor::real_mode(0x3000));
    cpu.install_descriptor(SegReg::Es, 0x4000, SegmentDescriptor::real_mode(0x4000));
    cpu.regs.set_flag(flags::DF, true);
    cpu.regs.set_ecx(3);
    cpu.regs.gpr[REG_ESI] = 0x0000;
    cpu.regs.gpr[REG_EDI] = 0x000A;

    // Downward words read at 0000, FFFE, FFFC: the index wraps at FFFFh.
    write_mem(&mut bus, 0x30000, &[0x01, 0x02]);
    write_mem(&mut bus, 0x3FFFE, &[0x03, 0x04]);
    write_mem(&mut bus, 0x3FFFC, &[0x05, 0x06]);

    write_code(&cpu, &mut bus, &[0xF3, 0xA5]); // REP MOVSW
    // Three iterations, one step each.
    step(&mut cpu, &mut bus);
    assert!(cpu.repeating);
    assert_eq!(cpu.regs.ecx() & 0xFFFF, 2);
    step(&mut cpu, &mut bus);
    step(&mut cpu, &mut bus);
    assert!(!cpu.repeating);

    assert_eq!(cpu.regs.ecx() & 0xFFFF, 0);
    assert_eq!(cpu.regs.gpr[REG_ESI] & 0xFFFF, 0xFFFA);
    assert_eq!(cpu.regs.gpr[REG_EDI] & 0xFFFF, 0x0004);
    assert_eq!(bus.mem.peek_byte(0x4000A), 0x01);
    assert_eq!(bus.mem.peek_byte(0x4000B), 0x02);
    assert_eq!(bus.mem.peek_byte(0x40008), 0x03);
    assert_eq!(bus.mem.peek_byte(0x40009), 0x04);
    assert_eq!(bus.mem.peek_byte(0x40006), 0x05);
    assert_eq!(bus.mem.peek_byte(0x40007), 0x06);
}

#[test]
fn test_repz_cmpsb_with_zero_count() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    cpu.regs.set_ecx(0);
    cpu.regs.set_flag(flags::ZF, true);
    cpu.regs.gpr[REG_ESI] = 0x2000;
    cpu.regs.gpr[REG_EDI] = 0x3000;
    // Plant differing bytes that must NOT be compared.
    bus.mem.poke_byte(0x2000, 0x11);
    bus.mem.poke_byte(0x3000, 0x99);

    write_code(&cpu, &mut bus, &[0xF3, 0xA6]); // REPZ CMPSB
    let flags_before = cpu.regs.eflags;
    step(&mut cpu, &mut bus);

    // No iteration: flags, count and indices untouched.
    assert_eq!(cpu.regs.eflags, flags_before);
    assert_eq!(cpu.regs.ecx(), 0);
    assert_eq!(cpu.regs.gpr[REG_ESI], 0x2000);
    assert_eq!(cpu.regs.gpr[REG_EDI], 0x3000);
    assert!(!cpu.repeating);
}

#[test]
fn test_repe_cmpsb_stops_on_mismatch() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    cpu.regs.set_ecx(8);
    cpu.regs.gpr[REG_ESI] = 0x2000;
    cpu.regs.gpr[REG_EDI] = 0x3000;
    write_mem(&mut bus, 0x2000, b"abcX");
    write_mem(&mut bus, 0x3000, b"abcY");

    write_code(&cpu, &mut bus, &[0xF3, 0xA6]);
    for _ in 0..4 {
        step(&mut cpu, &mut bus);
    }
    assert!(!cpu.repeating);
    // Three equal bytes plus the mismatch consumed four counts.
    assert_eq!(cpu.regs.ecx(), 4);
    assert!(!cpu.regs.flag(flags::ZF));
}

#[test]
fn test_repne_scasb_finds_byte() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    cpu.regs.set_ecx(16);
    cpu.regs.set_al(0x2A);
    cpu.regs.gpr[REG_EDI] = 0x3000;
    write_mem(&mut bus, 0x3000, &[0x00, 0x00, 0x2A, 0x00]);

    write_code(&cpu, &mut bus, &[0xF2, 0xAE]); // REPNE SCASB
    while cpu.regs.ecx() == 16 || cpu.repeating {
        step(&mut cpu, &mut bus);
    }
    assert!(cpu.regs.flag(flags::ZF));
    assert_eq!(cpu.regs.gpr[REG_EDI], 0x3003);
    assert_eq!(cpu.regs.ecx(), 13);
}

#[test]
fn test_stos_lods_respect_df() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    cpu.regs.set_ax(0x1234);
    cpu.regs.gpr[REG_EDI] = 0x2000;
    write_code(&cpu, &mut bus, &[0xAB]); // STOSW
    step(&mut cpu, &mut bus);
    assert_eq!(bus.mem.peek_byte(0x2000), 0x34);
    assert_eq!(bus.mem.peek_byte(0x2001), 0x12);
    assert_eq!(cpu.regs.gpr[REG_EDI], 0x2002);

    cpu.regs.set_flag(flags::DF, true);
    cpu.regs.gpr[REG_ESI] = 0x2000;
    cpu.regs.eip = 0x110;
    write_mem(&mut bus, 0x110, &[0xAD]); // LODSW
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.ax(), 0x1234);
    assert_eq!(cpu.regs.gpr[REG_ESI] & 0xFFFF, 0x1FFE);
}

#[test]
fn test_movs_honors_segment_override_on_source_only() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    cpu.install_descriptor(SegReg::Es, 0x4000, SegmentDescriptor::real_mode(0x4000));
    // FS/GS don't exist on the 8086; use CS as the override.
    cpu.regs.gpr[REG_ESI] = 0x0500;
    cpu.regs.gpr[REG_EDI] = 0x0600;
    bus.mem.poke_byte(0x0500, 0xCC); // CS:0500 (CS base 0)
    write_code(&cpu, &mut bus, &[0x2E, 0xA4]); // CS: MOVSB
    step(&mut cpu, &mut bus);
    // Destination stays ES regardless of the override.
    assert_eq!(bus.mem.peek_byte(0x40600), 0xCC);
}

#[test]
fn test_rep_interrupted_resumes_at_prefix() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    // IVT vector 0x08 -> 5000:0000, where an IRET sits.
    write_mem(&mut bus, 8 * 4, &[0x00, 0x00, 0x00, 0x50]);
    bus.mem.poke_byte(0x50000, 0xCF); // IRET

    cpu.regs.set_flag(flags::IF, true);
    cpu.regs.set_ecx(4);
    cpu.regs.gpr[REG_ESI] = 0x2000;
    cpu.regs.gpr[REG_EDI] = 0x3000;
    write_mem(&mut bus, 0x2000, &[1, 2, 3, 4]);

    let rep_ip = cpu.regs.eip;
    write_code(&cpu, &mut bus, &[0xF3, 0xA4]); // REP MOVSB

    // One iteration, then an IRQ0 arrives.
    step(&mut cpu, &mut bus);
    assert!(cpu.repeating);
    assert_eq!(cpu.regs.ecx(), 3);

    bus.devices.pic.raise_irq(0);
    step(&mut cpu, &mut bus); // interrupt entry
    assert!(!cpu.repeating);
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x5000);
    // The stacked return address is the REP prefix itself.
    let sp = cpu.regs.esp();
    let ret_ip =
        bus.mem.peek_byte(sp) as u16 | (bus.mem.peek_byte(sp + 1) as u16) << 8;
    assert_eq!(ret_ip as u32, rep_ip);

    // IRET, then the loop finishes the remaining three counts.
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.eip, rep_ip);
    for _ in 0..3 {
        step(&mut cpu, &mut bus);
    }
    assert_eq!(cpu.regs.ecx(), 0);
    assert_eq!(bus.mem.peek_byte(0x3003), 4);
}

#[test]
fn test_multi_prefix_rep_resumes_at_last_prefix() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    write_mem(&mut bus, 8 * 4, &[0x00, 0x00, 0x00, 0x50]);
    bus.mem.poke_byte(0x50000, 0xCF);

    cpu.regs.set_flag(flags::IF, true);
    cpu.regs.set_ecx(4);
    cpu.regs.gpr[REG_ESI] = 0x2000;
    cpu.regs.gpr[REG_EDI] = 0x3000;

    let start = cpu.regs.eip;
    // CS: REP MOVSB - two prefixes; the resume point is the REP byte,
    // dropping the earlier segment override (the 8086/286 quirk).
    write_code(&cpu, &mut bus, &[0x2E, 0xF3, 0xA4]);
    step(&mut cpu, &mut bus);
    assert!(cpu.repeating);
    assert_eq!(cpu.regs.eip, start + 1);

    bus.devices.pic.raise_irq(0);
    step(&mut cpu, &mut bus);
    let sp = cpu.regs.esp();
    let ret_ip =
        bus.mem.peek_byte(sp) as u16 | (bus.mem.peek_byte(sp + 1) as u16) << 8;
    assert_eq!(ret_ip as u32, start + 1);
}

#[test]
fn test_outsb_insb_through_ports() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80286);
    // OUTSB to the PIT mode register is harmless; use the scratch
    // register of COM1 so the byte can be read back.
    cpu.regs.write16(2, 0x3FF); // DX = COM1 scratch
    cpu.regs.gpr[REG_ESI] = 0x2000;
    bus.mem.poke_byte(0x2000, 0x5C);
    write_code(&cpu, &mut bus, &[0x6E]); // OUTSB
    step(&mut cpu, &mut bus);
    assert_eq!(bus.devices.uarts.ports[0].read(7), 0x5C);

    // INSB pulls it back into ES:DI.
    cpu.regs.gpr[REG_EDI] = 0x3000;
    cpu.regs.eip = 0x110;
    write_mem(&mut bus, 0x110, &[0x6C]);
    step(&mut cpu, &mut bus);
    assert_eq!(bus.mem.peek_byte(0x3000), 0x5C);
}
