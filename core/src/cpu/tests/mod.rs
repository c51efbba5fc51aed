//! CPU test suite.
//!
//! Shared builders live here; the themed files cover instruction
//! semantics (`instructions`), operating modes and protection (`modes`),
//! interrupt/exception delivery (`interrupts`), and the string/REP
//! machine (`string`).

mod instructions;
mod interrupts;
mod modes;
mod string;

pub(crate) use super::descriptor::SegmentDescriptor;
pub(crate) use super::registers::{CpuMode, SegReg, CR0_PE};
pub(crate) use super::{Cpu, StepResult};
pub(crate) use crate::bus::Bus;
pub(crate) use crate::config::{CpuModel, MachineConfig};

/// A CPU and bus pair for the given model, parked in real mode with flat
/// low segments and a workable stack.
pub(crate) fn test_machine(model: CpuModel) -> (Cpu, Bus) {
    let config = MachineConfig {
        cpu_model: model,
        data_bus_width: 16,
        cpu_hz: 8_000_000,
        memory_kb: 1024,
        ..MachineConfig::default()
    }
    .validate()
    .unwrap();
    let bus = Bus::new(&config);
    let mut cpu = Cpu::new(0, model);
    setup_real(&mut cpu);
    (cpu, bus)
}

/// Park the CPU at 0000:0100 with SS:SP = 0000:8000.
pub(crate) fn setup_real(cpu: &mut Cpu) {
    for seg in [SegReg::Cs, SegReg::Ds, SegReg::Es, SegReg::Ss] {
        cpu.install_descriptor(seg, 0, SegmentDescriptor::real_mode(0));
    }
    cpu.regs.eip = 0x100;
    cpu.regs.set_esp(0x8000);
}

/// Write code bytes at a physical address.
pub(crate) fn write_mem(bus: &mut Bus, addr: u32, bytes: &[u8]) {
    for (i, &byte) in bytes.iter().enumerate() {
        bus.mem.poke_byte(addr + i as u32, byte);
    }
}

/// Place code at CS:IP (assumes the flat real-mode setup).
pub(crate) fn write_code(cpu: &Cpu, bus: &mut Bus, bytes: &[u8]) {
    let linear = cpu.descriptors[SegReg::Cs as usize]
        .base
        .wrapping_add(cpu.regs.eip);
    write_mem(bus, linear, bytes);
}

/// Step once and require an executed instruction.
pub(crate) fn step(cpu: &mut Cpu, bus: &mut Bus) {
    match cpu.step(bus) {
        StepResult::Executed(_) => {}
        other => panic!("expected an executed step, got {other:?}"),
    }
}

/// A descriptor-table builder for protected-mode tests.
pub(crate) struct GdtBuilder {
    base: u32,
    next: u32,
}

impl GdtBuilder {
    pub(crate) fn at(base: u32) -> Self {
        // Slot 0 stays null.
        Self { base, next: 1 }
    }

    /// Append a descriptor; returns its selector (RPL 0).
    pub(crate) fn push(&mut self, bus: &mut Bus, raw: u64) -> u16 {
        let offset = self.base + self.next * 8;
        for i in 0..8 {
            bus.mem.poke_byte(offset + i, (raw >> (8 * i)) as u8);
        }
        let selector = (self.next * 8) as u16;
        self.next += 1;
        selector
    }

    pub(crate) fn limit(&self) -> u16 {
        (self.next * 8 - 1) as u16
    }
}

/// Build a raw descriptor from base/limit/access/flags nibble.
pub(crate) fn make_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    (limit as u64 & 0xFFFF)
        | ((base as u64 & 0xFF_FFFF) << 16)
        | ((access as u64) << 40)
        | (((limit as u64 >> 16) & 0xF) << 48)
        | ((flags as u64 & 0xF) << 52)
        | ((base as u64 >> 24) << 56)
}

/// Flip a real-mode test machine into protected mode with a flat code and
/// data segment plus a ring-0 stack. Returns (code_sel, data_sel).
pub(crate) fn enter_protected(cpu: &mut Cpu, bus: &mut Bus, gdt_base: u32) -> (u16, u16) {
    let mut gdt = GdtBuilder::at(gdt_base);
    // Flat 4 GB code and data, DPL 0.
    let code = gdt.push(bus, make_descriptor(0, 0xFFFFF, 0x9A, 0xC));
    let data = gdt.push(bus, make_descriptor(0, 0xFFFFF, 0x92, 0xC));
    cpu.regs.gdtr.base = gdt_base;
    cpu.regs.gdtr.limit = gdt.limit();

    cpu.regs.write_cr0(cpu.regs.cr[0] | CR0_PE);
    cpu.mode = CpuMode::Protected;
    cpu.cpl = 0;
    cpu.install_descriptor(
        SegReg::Cs,
        code,
        SegmentDescriptor::from_raw(make_descriptor(0, 0xFFFFF, 0x9A, 0xC)),
    );
    for seg in [SegReg::Ds, SegReg::Es, SegReg::Ss] {
        cpu.install_descriptor(
            seg,
            data,
            SegmentDescriptor::from_raw(make_descriptor(0, 0xFFFFF, 0x92, 0xC)),
        );
    }
    cpu.regs.eip = 0x1000;
    cpu.regs.set_esp(0x9000);
    (code, data)
}
