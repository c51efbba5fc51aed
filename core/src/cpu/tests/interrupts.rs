//! Interrupt and exception delivery: real-mode vectors, IDT gates,
//! error codes, escalation, and the interrupt-inhibit windows.

use super::*;
use crate::cpu::flags;
use crate::cpu::interrupts::EXC_NP;
use crate::cpu::mmu::MemSeg;
use crate::cpu::paging::{PF_PRESENT, PF_WRITE};
use crate::cpu::registers::{CR0_PG, REG_EBX};

#[test]
fn test_real_mode_int_and_iret() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    // IVT vector 0x21 -> 2000:0010 where an IRET waits.
    write_mem(&mut bus, 0x21 * 4, &[0x10, 0x00, 0x00, 0x20]);
    bus.mem.poke_byte(0x20010, 0xCF);
    cpu.regs.set_flag(flags::IF, true);

    let start = cpu.regs.eip;
    write_code(&cpu, &mut bus, &[0xCD, 0x21]); // INT 21h
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x2000);
    assert_eq!(cpu.regs.eip, 0x10);
    // IF and TF cleared on entry.
    assert!(!cpu.regs.flag(flags::IF));

    step(&mut cpu, &mut bus); // IRET
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x0000);
    assert_eq!(cpu.regs.eip, start + 2);
    assert!(cpu.regs.flag(flags::IF));
}

#[test]
fn test_lock_on_register_operand_is_ud() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80286);
    // IVT vector 6 -> 2000:0000.
    write_mem(&mut bus, 6 * 4, &[0x00, 0x00, 0x00, 0x20]);
    write_code(&cpu, &mut bus, &[0xF0, 0x01, 0xD8]); // LOCK ADD AX,BX
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x2000);
    // The faulting instruction did not retire.
    assert_eq!(cpu.regs.ax(), 0);
}

#[test]
fn test_lock_on_memory_operand_is_fine() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80286);
    bus.mem.poke_byte(0x2000, 5);
    cpu.regs.set_ax(3);
    // LOCK ADD [2000],AX
    write_code(&cpu, &mut bus, &[0xF0, 0x01, 0x06, 0x00, 0x20]);
    step(&mut cpu, &mut bus);
    assert_eq!(bus.mem.peek_byte(0x2000), 8);
    // The lock is released at the instruction boundary.
    assert!(!bus.holds_lock(0));
}

#[test]
fn test_not_present_gate_target_raises_np_with_ext() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    let (code_sel, _data) = enter_protected(&mut cpu, &mut bus, 0x10000);

    // GDT entry 3: a code segment with P = 0.
    let mut gdt = GdtBuilder::at(0x10000);
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x9A, 0xC));
    let _ = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x92, 0xC));
    let absent = gdt.push(&mut bus, make_descriptor(0, 0xFFFFF, 0x1A, 0xC)); // P=0
    cpu.regs.gdtr.limit = gdt.limit();

    // IDT at 0x12000: vector 0x20 -> interrupt gate to the absent
    // selector; vector 0x0B (#NP) -> a live gate at code:0x4000.
    let idt_base = 0x12000;
    cpu.regs.idtr.base = idt_base;
    cpu.regs.idtr.limit = 0xFFF;
    let gate = |selector: u16, offset: u32| -> u64 {
        (offset as u64 & 0xFFFF)
            | ((selector as u64) << 16)
            | (0x8E_u64 << 40) // present 32-bit interrupt gate
            | (((offset as u64 >> 16) & 0xFFFF) << 48)
    };
    let write_gate = |bus: &mut Bus, vector: u32, raw: u64| {
        for i in 0..8 {
            bus.mem.poke_byte(idt_base + vector * 8 + i, (raw >> (8 * i)) as u8);
        }
    };
    write_gate(&mut bus, 0x20, gate(absent, 0x1234_5678));
    write_gate(&mut bus, 0x0B, gate(code_sel, 0x4000));

    // External interrupt 0x20 arrives.
    cpu.regs.set_flag(flags::IF, true);
    let result = cpu.interrupt_entry(
        &mut bus,
        0x20,
        crate::cpu::interrupts::IntSource::External,
        None,
    );
    let fault = result.unwrap_err();
    assert_eq!(fault.vector, EXC_NP);
    // Error code: selector index with the external bit set.
    assert_eq!(fault.error_code, Some((absent & !3) as u32 | 1));

    // Let the machinery deliver it: handler at code:0x4000 with the
    // error code on the stack.
    cpu.checkpoint_now();
    assert!(cpu.fault_raised(&mut bus, fault));
    assert_eq!(cpu.regs.eip, 0x4000);
    let sp = cpu.regs.esp();
    let pushed = cpu
        .mmu_rdw(&mut bus, MemSeg::Desc(SegReg::Ss), sp, false, false)
        .unwrap();
    assert_eq!(pushed, (absent & !3) as u32 | 1);
}

#[test]
fn test_page_fault_on_straddling_dword_write() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    enter_protected(&mut cpu, &mut bus, 0x10000);

    // Page tables at 0x20000 (directory) / 0x21000 (table): map pages 1
    // and 2 present/RW, page at 0x2000 not present.
    let pde = 0x21000u32 | 0x7;
    for i in 0..4 {
        bus.mem.poke_byte(0x20000 + i, (pde >> (8 * i)) as u8);
    }
    for page in 0..16u32 {
        let pte: u32 = if page == 2 { 0 } else { (page << 12) | 0x7 };
        for i in 0..4 {
            bus.mem.poke_byte(0x21000 + page * 4 + i, (pte >> (8 * i)) as u8);
        }
    }
    cpu.regs.cr[3] = 0x20000;
    cpu.regs.write_cr0(cpu.regs.cr[0] | CR0_PG);

    // Seed the straddled bytes so the non-write is observable.
    bus.mem.poke_byte(0x1FFE, 0xAA);
    bus.mem.poke_byte(0x1FFF, 0xBB);

    let err = cpu
        .mmu_wdw(&mut bus, MemSeg::Linear, 0x1FFE, 0xDEAD_BEEF, false)
        .unwrap_err();
    assert_eq!(err.vector, crate::cpu::interrupts::EXC_PF);
    assert_eq!(err.cr2, Some(0x2000));
    // Write to a not-present page: W=1, P=0.
    assert_eq!(err.error_code, Some(PF_WRITE));
    assert_ne!(err.error_code.unwrap() & PF_WRITE, 0);
    assert_eq!(err.error_code.unwrap() & PF_PRESENT, 0);

    // Nothing was committed, not even the first two bytes.
    assert_eq!(bus.mem.peek_byte(0x1FFE), 0xAA);
    assert_eq!(bus.mem.peek_byte(0x1FFF), 0xBB);
}

#[test]
fn test_sti_shadow_delays_interrupt() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    write_mem(&mut bus, 8 * 4, &[0x00, 0x00, 0x00, 0x50]);
    bus.mem.poke_byte(0x50000, 0xCF);

    cpu.regs.set_flag(flags::IF, false);
    bus.devices.pic.raise_irq(0);
    // STI; MOV BX,1 - the MOV must run before the interrupt.
    write_code(&cpu, &mut bus, &[0xFB, 0xBB, 0x01, 0x00]);
    step(&mut cpu, &mut bus); // STI
    step(&mut cpu, &mut bus); // MOV executes despite the pending IRQ
    assert_eq!(cpu.regs.read16(REG_EBX as u8), 1);
    step(&mut cpu, &mut bus); // now the interrupt is taken
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x5000);
}

#[test]
fn test_mov_ss_inhibits_one_instruction() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    write_mem(&mut bus, 8 * 4, &[0x00, 0x00, 0x00, 0x50]);
    bus.mem.poke_byte(0x50000, 0xCF);
    cpu.regs.set_flag(flags::IF, true);
    bus.devices.pic.raise_irq(0);

    cpu.regs.set_ax(0);
    // MOV SS,AX; MOV SP,8000h must both run before delivery.
    write_code(&cpu, &mut bus, &[0x8E, 0xD0, 0xBC, 0x00, 0x80]);
    step(&mut cpu, &mut bus);
    assert!(cpu.inhibit_interrupts);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.esp() & 0xFFFF, 0x8000);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x5000);
}

#[test]
fn test_nmi_beats_intr_and_masks_itself() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    write_mem(&mut bus, 2 * 4, &[0x00, 0x00, 0x00, 0x60]); // NMI -> 6000:0
    write_mem(&mut bus, 8 * 4, &[0x00, 0x00, 0x00, 0x50]);
    cpu.regs.set_flag(flags::IF, true);

    bus.devices.pic.raise_irq(0);
    cpu.raise_nmi();
    write_code(&cpu, &mut bus, &[0x90]);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x6000);
    assert!(cpu.nmi_masked);
    // A second NMI is held off while masked.
    cpu.raise_nmi();
    let cs_before = cpu.regs.seg(SegReg::Cs);
    bus.mem.poke_byte(0x60000, 0x90); // NOP at the handler
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.seg(SegReg::Cs), cs_before);
}

#[test]
fn test_triple_fault_latches_reset() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    enter_protected(&mut cpu, &mut bus, 0x10000);
    // An empty IDT: every delivery attempt faults again.
    cpu.regs.idtr.limit = 0;

    write_mem(&mut bus, 0x1000, &[0xCD, 0x40]); // INT 40h
    cpu.step(&mut bus);
    assert_ne!(cpu.reset_pending & crate::cpu::RESET_PENDING_TRIPLE, 0);
}

#[test]
fn test_single_step_trap() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I8086);
    write_mem(&mut bus, 1 * 4, &[0x00, 0x00, 0x00, 0x70]); // #DB -> 7000:0
    cpu.regs.set_flag(flags::TF, true);
    write_code(&cpu, &mut bus, &[0x90]); // NOP
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x7000);
    // TF is cleared inside the handler.
    assert!(!cpu.regs.flag(flags::TF));
}

#[test]
fn test_instruction_breakpoint() {
    let (mut cpu, mut bus) = test_machine(CpuModel::I80386);
    write_mem(&mut bus, 1 * 4, &[0x00, 0x00, 0x00, 0x70]);
    // Arm DR0 at the next fetch address, global-enable in DR7.
    cpu.regs.dr[0] = 0x100;
    cpu.regs.dr[7] = 0x2;
    cpu.refresh_breakpoints();
    write_code(&cpu, &mut bus, &[0x90]);
    step(&mut cpu, &mut bus);
    assert_eq!(cpu.regs.seg(SegReg::Cs), 0x7000);
    assert_ne!(cpu.regs.dr[6] & 1, 0);
}
