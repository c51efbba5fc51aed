//! x86 CPU core.
//!
//! One `Cpu` is one logical processor. All architectural state lives here;
//! the implementation is split by concern:
//!
//! - `registers`: aliased register file, CR/DR/TR, EFLAGS filters
//! - `flags`: flag bit constants and the shared flag calculators
//! - `descriptor`: descriptor cache, precalcs, segment loads
//! - `paging`: TLB and page-table walk
//! - `mmu`: segment-relative memory access and I/O permission checks
//! - `decode`: fetch state machine, prefixes, opcode info table
//! - `modrm`: ModR/M and SIB decoding, operand references
//! - `exec_*`: instruction semantics by family
//! - `interrupts`: exception/interrupt delivery, fault escalation
//! - `tasking`: hardware task switches
//!
//! `step` drives exactly one unit of forward progress: an interrupt entry,
//! one instruction, or one REP iteration. Faults unwind to the commit
//! checkpoint taken at instruction start, then deliver.

use crate::bus::Bus;
use crate::config::CpuModel;

pub mod decode;
pub mod descriptor;
mod exec_alu;
mod exec_control;
mod exec_data;
mod exec_string;
mod exec_system;
pub mod flags;
pub mod interrupts;
pub mod mmu;
pub mod modrm;
pub mod paging;
pub mod registers;
pub mod tasking;

#[cfg(test)]
mod tests;

use decode::FetchState;
use descriptor::SegmentDescriptor;
use interrupts::Fault;
use modrm::ModrmState;
use paging::Tlb;
use registers::{CpuMode, Registers, SegReg, TableReg};
use tasking::TaskSwitchPhase;

/// Every memory/segment helper returns this; `Err` carries the pending
/// architectural exception.
pub type ExecResult<T> = Result<T, Fault>;

/// Reset-pending flag bits.
pub const RESET_PENDING_SOFT: u8 = 1 << 0;
pub const RESET_PENDING_TRIPLE: u8 = 1 << 1;
pub const RESET_PENDING_INIT: u8 = 1 << 3;

/// How deep a reset reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Power-on: everything, including TSC and MSRs
    Hard,
    /// INIT#: architectural state only, TSC and MSRs survive
    Init,
    /// Local soft reset: like INIT but keeps pending device state intact
    SoftLocal,
}

/// Per-instruction cycle accounting, drained by the outer loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleCounters {
    /// Base operation cost
    pub op: u64,
    /// Effective-address calculation
    pub ea: u64,
    /// Prefix decode
    pub prefix: u64,
    /// Hardware interrupt entry
    pub hwop: u64,
    /// Prefetch bus activity
    pub prefetch: u64,
    /// Exception delivery
    pub exception: u64,
    /// Stalled waiting on the BIU
    pub stall_biu: u64,
    /// Stalled waiting on the external bus
    pub stall_bus: u64,
}

impl CycleCounters {
    /// Clear the per-instruction counters.
    fn begin_instruction(&mut self) {
        *self = Self::default();
    }

    /// Sum for this instruction.
    pub fn total(&self) -> u64 {
        self.op
            + self.ea
            + self.prefix
            + self.hwop
            + self.prefetch
            + self.exception
            + self.stall_biu
            + self.stall_bus
    }
}

/// Pre-instruction snapshot restored before delivering any exception.
#[derive(Debug, Clone, Default)]
struct Checkpoint {
    cs: u16,
    cs_desc: Option<SegmentDescriptor>,
    ss: u16,
    ss_desc: Option<SegmentDescriptor>,
    eip: u32,
    eflags: u32,
    esp: u32,
    ebp: u32,
    cpl: u8,
}

/// What one `step` call accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// An instruction (or interrupt entry) ran, costing this many cycles
    Executed(u64),
    /// Blocked on the bus; the cycles are stall time
    Stalled(u64),
    /// Halted, burning idle cycles until an interrupt
    Halted(u64),
    /// AP parked until a SIPI arrives
    WaitingForSipi,
}

impl StepResult {
    /// Cycles consumed by this step.
    pub fn cycles(self) -> u64 {
        match self {
            StepResult::Executed(c) | StepResult::Stalled(c) | StepResult::Halted(c) => c,
            StepResult::WaitingForSipi => 0,
        }
    }
}

/// One logical x86 processor.
pub struct Cpu {
    /// Arena index; also the BIU port number
    pub index: usize,
    /// Emulated generation
    pub model: CpuModel,
    /// CPUID reporting policy from the host configuration
    pub cpuid_mode: crate::config::CpuidMode,
    /// Architectural register file
    pub regs: Registers,
    /// Descriptor cache, one entry per segment register
    pub descriptors: [SegmentDescriptor; 8],
    /// Current privilege level
    pub cpl: u8,
    /// Operating mode derived from CR0.PE / EFLAGS.VM
    pub mode: CpuMode,
    /// Translation cache
    pub tlb: Tlb,
    /// Fetch/decode state of the current instruction
    pub fetch: FetchState,
    /// Decoded ModR/M state
    pub modrm: ModrmState,
    /// Shared flag-arithmetic temps
    pub alu: flags::Alu,
    /// Cycle accounting for the instruction in flight
    pub cycles: CycleCounters,
    /// Time-stamp counter (Pentium+)
    pub tsc: u64,
    /// Halted until interrupt
    pub halted: bool,
    /// One-boundary interrupt inhibit (MOV SS / POP SS)
    pub inhibit_interrupts: bool,
    /// NMI latch and in-service mask
    pub nmi_pending: bool,
    pub nmi_masked: bool,
    /// Set while a fault is being handled this instruction
    pub fault_raised_flag: bool,
    /// Nesting depth of exception delivery (drives #DF / triple fault)
    pub fault_level: u8,
    /// Pending reset request bits (RESET_PENDING_*)
    pub reset_pending: u8,
    /// AP parked waiting for a startup IPI
    pub waiting_for_sipi: bool,
    /// Received SIPI vector, consumed at the next step
    pub sipi_vector: Option<u8>,
    /// Instruction breakpoints armed from DR7
    pub active_breakpoints: [bool; 4],
    /// Mid-REP marker: EIP is parked on the prefix byte
    pub repeating: bool,
    /// Call-gate parameter staging buffer
    pub call_gate_stack: [u32; 256],
    /// Task-switch progress marker
    pub task_phase: TaskSwitchPhase,
    checkpoint: Checkpoint,
}

impl Cpu {
    /// Create CPU `index`. Non-zero indices are APs and park for SIPI.
    pub fn new(index: usize, model: CpuModel) -> Self {
        let mut cpu = Self {
            index,
            model,
            cpuid_mode: crate::config::CpuidMode::Modern,
            regs: Registers::new(model),
            descriptors: std::array::from_fn(|_| SegmentDescriptor::from_raw(0)),
            cpl: 0,
            mode: CpuMode::Real,
            tlb: Tlb::new(),
            fetch: FetchState::default(),
            modrm: ModrmState::default(),
            alu: flags::Alu::default(),
            cycles: CycleCounters::default(),
            tsc: 0,
            halted: false,
            inhibit_interrupts: false,
            nmi_pending: false,
            nmi_masked: false,
            fault_raised_flag: false,
            fault_level: 0,
            reset_pending: 0,
            waiting_for_sipi: index != 0,
            sipi_vector: None,
            active_breakpoints: [false; 4],
            repeating: false,
            call_gate_stack: [0; 256],
            task_phase: TaskSwitchPhase::Idle,
            checkpoint: Checkpoint::default(),
        };
        cpu.reset(ResetKind::Hard);
        cpu
    }

    /// Reset the processor. `Hard` clears the TSC and MSRs; `Init` and
    /// `SoftLocal` preserve them.
    pub fn reset(&mut self, kind: ResetKind) {
        let saved_tsc = self.tsc;
        let saved_msrs = self.regs.msrs;

        self.regs = Registers::new(self.model);
        if kind != ResetKind::Hard {
            self.tsc = saved_tsc;
            self.regs.msrs = saved_msrs;
        } else {
            self.tsc = 0;
        }

        for (i, desc) in self.descriptors.iter_mut().enumerate() {
            *desc = if i == SegReg::Cs as usize {
                SegmentDescriptor::reset_cs(self.model >= CpuModel::I80386)
            } else {
                SegmentDescriptor::real_mode(0)
            };
        }
        self.cpl = 0;
        self.mode = CpuMode::Real;
        self.tlb.clear_all();
        self.fetch = FetchState::default();
        self.modrm = ModrmState::default();
        self.cycles = CycleCounters::default();
        self.halted = false;
        self.inhibit_interrupts = false;
        self.nmi_pending = false;
        self.nmi_masked = false;
        self.fault_raised_flag = false;
        self.fault_level = 0;
        self.reset_pending = 0;
        self.repeating = false;
        self.task_phase = TaskSwitchPhase::Idle;
        self.waiting_for_sipi = self.index != 0;
        self.sipi_vector = None;
    }

    /// Deliver a startup IPI to this (AP) core.
    pub fn receive_sipi(&mut self, vector: u8) {
        if self.waiting_for_sipi {
            self.sipi_vector = Some(vector);
        }
    }

    // ========== Checkpoint ==========

    /// Snapshot the commit point at the start of an instruction.
    pub fn checkpoint_now(&mut self) {
        self.checkpoint = Checkpoint {
            cs: self.regs.seg(SegReg::Cs),
            cs_desc: Some(self.descriptors[SegReg::Cs as usize].clone()),
            ss: self.regs.seg(SegReg::Ss),
            ss_desc: Some(self.descriptors[SegReg::Ss as usize].clone()),
            eip: self.regs.eip,
            eflags: self.regs.eflags,
            esp: self.regs.esp(),
            ebp: self.regs.gpr[registers::REG_EBP],
            cpl: self.cpl,
        };
    }

    /// Roll architectural state back to the last checkpoint (exception
    /// unwind before delivery).
    pub fn restore_checkpoint(&mut self) {
        self.regs.set_seg(SegReg::Cs, self.checkpoint.cs);
        if let Some(desc) = self.checkpoint.cs_desc.clone() {
            self.descriptors[SegReg::Cs as usize] = desc;
        }
        self.regs.set_seg(SegReg::Ss, self.checkpoint.ss);
        if let Some(desc) = self.checkpoint.ss_desc.clone() {
            self.descriptors[SegReg::Ss as usize] = desc;
        }
        self.regs.eip = self.checkpoint.eip;
        self.regs.eflags = self.checkpoint.eflags;
        self.regs.set_esp(self.checkpoint.esp);
        self.regs.gpr[registers::REG_EBP] = self.checkpoint.ebp;
        self.cpl = self.checkpoint.cpl;
        self.mode = registers::derive_mode(self.regs.cr[0], self.regs.eflags);
    }

    // ========== Stack ==========

    /// Stack pointer width follows SS.D.
    #[inline]
    pub fn stack_is_32(&self) -> bool {
        self.descriptors[SegReg::Ss as usize].is_32bit()
    }

    #[inline]
    fn sp_mask(&self) -> u32 {
        if self.stack_is_32() {
            0xFFFF_FFFF
        } else {
            0xFFFF
        }
    }

    /// Push a word onto SS:(E)SP.
    pub fn push16(&mut self, bus: &mut Bus, value: u16) -> ExecResult<()> {
        let mask = self.sp_mask();
        let sp = self.regs.esp().wrapping_sub(2) & mask;
        self.mmu_ww(bus, mmu::MemSeg::Desc(SegReg::Ss), sp, value, mask == 0xFFFF)?;
        self.regs.set_esp((self.regs.esp() & !mask) | (sp & mask));
        Ok(())
    }

    /// Push a dword onto SS:(E)SP.
    pub fn push32(&mut self, bus: &mut Bus, value: u32) -> ExecResult<()> {
        let mask = self.sp_mask();
        let sp = self.regs.esp().wrapping_sub(4) & mask;
        self.mmu_wdw(bus, mmu::MemSeg::Desc(SegReg::Ss), sp, value, mask == 0xFFFF)?;
        self.regs.set_esp((self.regs.esp() & !mask) | (sp & mask));
        Ok(())
    }

    /// Push by the current operand size.
    pub fn push_val(&mut self, bus: &mut Bus, value: u32) -> ExecResult<()> {
        if self.fetch.operand_size32 {
            self.push32(bus, value)
        } else {
            self.push16(bus, value as u16)
        }
    }

    /// Pop a word from SS:(E)SP.
    pub fn pop16(&mut self, bus: &mut Bus) -> ExecResult<u16> {
        let mask = self.sp_mask();
        let sp = self.regs.esp() & mask;
        let value = self.mmu_rw(bus, mmu::MemSeg::Desc(SegReg::Ss), sp, false, mask == 0xFFFF)?;
        self.regs
            .set_esp((self.regs.esp() & !mask) | (sp.wrapping_add(2) & mask));
        Ok(value)
    }

    /// Pop a dword from SS:(E)SP.
    pub fn pop32(&mut self, bus: &mut Bus) -> ExecResult<u32> {
        let mask = self.sp_mask();
        let sp = self.regs.esp() & mask;
        let value = self.mmu_rdw(bus, mmu::MemSeg::Desc(SegReg::Ss), sp, false, mask == 0xFFFF)?;
        self.regs
            .set_esp((self.regs.esp() & !mask) | (sp.wrapping_add(4) & mask));
        Ok(value)
    }

    /// Pop by the current operand size.
    pub fn pop_val(&mut self, bus: &mut Bus) -> ExecResult<u32> {
        if self.fetch.operand_size32 {
            self.pop32(bus)
        } else {
            Ok(self.pop16(bus)? as u32)
        }
    }

    // ========== Step driver ==========

    /// Advance by one unit of work: an interrupt entry, one instruction,
    /// or one REP iteration.
    pub fn step(&mut self, bus: &mut Bus) -> StepResult {
        if self.waiting_for_sipi {
            match self.sipi_vector.take() {
                Some(vector) => {
                    // SIPI vector vv starts the AP at vv00:0000.
                    let selector = (vector as u16) << 8;
                    self.install_descriptor(
                        SegReg::Cs,
                        selector,
                        SegmentDescriptor::real_mode(selector),
                    );
                    self.regs.eip = 0;
                    self.waiting_for_sipi = false;
                }
                None => return StepResult::WaitingForSipi,
            }
        }

        if !bus.ready(self.index) {
            return StepResult::Stalled(1);
        }

        self.cycles.begin_instruction();

        // Instruction boundary: hardware interrupts, then traps.
        if self.poll_hardware_interrupts(bus) {
            let cycles = self.finish_cycles(bus);
            return StepResult::Executed(cycles);
        }

        if self.halted {
            return StepResult::Halted(4);
        }

        // Armed instruction breakpoints fire before the fetch.
        if self.instruction_breakpoint_hit() {
            self.checkpoint_now();
            self.regs.dr[6] |= self.breakpoint_hit_bits();
            let fault = Fault::new(interrupts::EXC_DB);
            self.fault_raised(bus, fault);
            let cycles = self.finish_cycles(bus);
            return StepResult::Executed(cycles);
        }

        let tf_armed = self.regs.flag(flags::TF) && !self.inhibit_interrupts;

        self.checkpoint_now();
        self.fault_raised_flag = false;

        let result = self
            .decode_instruction(bus)
            .and_then(|()| self.acquire_lock_if_needed(bus))
            .and_then(|()| self.execute_instruction(bus));

        match result {
            Ok(()) => {
                self.fault_level = 0;
                self.cycles.op += decode::opcode_info(
                    self.fetch.opcode,
                    self.fetch.is_0f,
                    self.fetch.operand_size32,
                )
                .base_cycles as u64;

                if bus.holds_lock(self.index) && !self.repeating {
                    bus.release_lock(self.index);
                }

                // Single-step trap fires after a completed instruction.
                if tf_armed && self.regs.flag(flags::TF) && !self.repeating {
                    self.checkpoint_now();
                    self.regs.dr[6] |= 1 << 14; // BS
                    if let Err(fault) = self.interrupt_entry(
                        bus,
                        interrupts::EXC_DB,
                        interrupts::IntSource::Exception,
                        None,
                    ) {
                        self.fault_raised(bus, fault);
                    }
                }
            }
            Err(fault) => {
                self.cycles.exception += 8;
                if bus.holds_lock(self.index) {
                    bus.release_lock(self.index);
                }
                self.repeating = false;
                self.fault_raised(bus, fault);
            }
        }

        let cycles = self.finish_cycles(bus);
        StepResult::Executed(cycles)
    }

    /// LOCK prefix: take the bus lock before the execute phase.
    fn acquire_lock_if_needed(&mut self, bus: &mut Bus) -> ExecResult<()> {
        if self.fetch.prefixes.lock && !bus.holds_lock(self.index) {
            bus.request_lock(self.index);
            bus.service_lock_requests();
        }
        Ok(())
    }

    /// Fold in BIU counters and return this step's cycle total.
    fn finish_cycles(&mut self, bus: &mut Bus) -> u64 {
        self.cycles.prefetch += bus.take_prefetch_cycles(self.index);
        self.cycles.stall_biu += bus.take_stall_cycles(self.index);
        self.cycles.total().max(1)
    }

    // ========== Debug registers ==========

    /// Recompute the armed-instruction-breakpoint mask from DR7.
    pub fn refresh_breakpoints(&mut self) {
        let dr7 = self.regs.dr[7];
        for i in 0..4 {
            let enabled = dr7 >> (i * 2) & 3 != 0;
            // Condition bits 00 = instruction execution.
            let kind = (dr7 >> (16 + i * 4)) & 3;
            self.active_breakpoints[i] = enabled && kind == 0;
        }
    }

    /// Does any armed breakpoint match the next fetch address?
    fn instruction_breakpoint_hit(&self) -> bool {
        if self.regs.flag(flags::RF) {
            return false;
        }
        let linear = self.descriptors[SegReg::Cs as usize]
            .base
            .wrapping_add(self.regs.eip);
        (0..4).any(|i| self.active_breakpoints[i] && self.regs.dr[i] == linear)
    }

    fn breakpoint_hit_bits(&self) -> u32 {
        let linear = self.descriptors[SegReg::Cs as usize]
            .base
            .wrapping_add(self.regs.eip);
        (0..4)
            .filter(|&i| self.active_breakpoints[i] && self.regs.dr[i] == linear)
            .fold(0, |acc, i| acc | 1 << i)
    }

    // ========== Debugger view ==========

    /// Snapshot of the architectural state for the debugger front-end.
    pub fn dump(&self) -> CpuDump {
        CpuDump {
            gpr: self.regs.gpr,
            eip: self.regs.eip,
            eflags: self.regs.eflags,
            segs: self.regs.segs,
            cr: [
                self.regs.cr[0],
                self.regs.cr[1],
                self.regs.cr[2],
                self.regs.cr[3],
                self.regs.cr[4],
            ],
            dr: self.regs.dr,
            gdtr: self.regs.gdtr,
            idtr: self.regs.idtr,
            seg_bases: std::array::from_fn(|i| self.descriptors[i].base),
            seg_limits: std::array::from_fn(|i| self.descriptors[i].limit),
            cpl: self.cpl,
            mode: self.mode,
            tsc: self.tsc,
            halted: self.halted,
            reset_pending: self.reset_pending,
        }
    }
}

/// Register dump handed to the debugger.
#[derive(Debug, Clone)]
pub struct CpuDump {
    pub gpr: [u32; 8],
    pub eip: u32,
    pub eflags: u32,
    pub segs: [u16; 8],
    pub cr: [u32; 5],
    pub dr: [u32; 8],
    pub gdtr: TableReg,
    pub idtr: TableReg,
    pub seg_bases: [u32; 8],
    pub seg_limits: [u32; 8],
    pub cpl: u8,
    pub mode: CpuMode,
    pub tsc: u64,
    pub halted: bool,
    pub reset_pending: u8,
}

// ========== State persistence ==========

impl Cpu {
    /// Size of a CPU state snapshot in bytes.
    pub const SNAPSHOT_SIZE: usize = 1024;

    /// Save architectural state to a packed byte image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::SNAPSHOT_SIZE];
        let mut pos = 0;

        for reg in self.regs.gpr {
            buf[pos..pos + 4].copy_from_slice(&reg.to_le_bytes());
            pos += 4;
        }
        buf[pos..pos + 4].copy_from_slice(&self.regs.eip.to_le_bytes());
        pos += 4;
        buf[pos..pos + 4].copy_from_slice(&self.regs.eflags.to_le_bytes());
        pos += 4;
        for seg in self.regs.segs {
            buf[pos..pos + 2].copy_from_slice(&seg.to_le_bytes());
            pos += 2;
        }
        for cr in self.regs.cr {
            buf[pos..pos + 4].copy_from_slice(&cr.to_le_bytes());
            pos += 4;
        }
        for dr in self.regs.dr {
            buf[pos..pos + 4].copy_from_slice(&dr.to_le_bytes());
            pos += 4;
        }
        for tr in self.regs.tr {
            buf[pos..pos + 4].copy_from_slice(&tr.to_le_bytes());
            pos += 4;
        }
        buf[pos..pos + 4].copy_from_slice(&self.regs.gdtr.base.to_le_bytes());
        pos += 4;
        buf[pos..pos + 2].copy_from_slice(&self.regs.gdtr.limit.to_le_bytes());
        pos += 2;
        buf[pos..pos + 4].copy_from_slice(&self.regs.idtr.base.to_le_bytes());
        pos += 4;
        buf[pos..pos + 2].copy_from_slice(&self.regs.idtr.limit.to_le_bytes());
        pos += 2;

        for desc in &self.descriptors {
            buf[pos..pos + 8].copy_from_slice(&desc.raw.to_le_bytes());
            pos += 8;
        }
        // The reset CS shadow carries a base the raw bytes cannot express;
        // store the bases alongside.
        for desc in &self.descriptors {
            buf[pos..pos + 4].copy_from_slice(&desc.base.to_le_bytes());
            pos += 4;
        }

        buf[pos] = self.cpl;
        pos += 1;
        let mut state = 0u8;
        if self.halted {
            state |= 1 << 0;
        }
        if self.nmi_pending {
            state |= 1 << 1;
        }
        if self.nmi_masked {
            state |= 1 << 2;
        }
        if self.waiting_for_sipi {
            state |= 1 << 3;
        }
        if self.inhibit_interrupts {
            state |= 1 << 4;
        }
        if self.repeating {
            state |= 1 << 5;
        }
        buf[pos] = state;
        pos += 1;
        buf[pos] = self.reset_pending;
        pos += 1;
        buf[pos] = self.fault_level;
        pos += 1;
        buf[pos..pos + 8].copy_from_slice(&self.tsc.to_le_bytes());
        pos += 8;

        for msr in self.regs.msrs {
            buf[pos..pos + 4].copy_from_slice(&msr.lo.to_le_bytes());
            pos += 4;
            buf[pos..pos + 4].copy_from_slice(&msr.hi.to_le_bytes());
            pos += 4;
        }

        debug_assert!(pos <= Self::SNAPSHOT_SIZE);
        buf
    }

    /// Restore architectural state from a packed byte image.
    pub fn from_bytes(&mut self, buf: &[u8]) -> Result<(), i32> {
        if buf.len() < Self::SNAPSHOT_SIZE {
            return Err(-105);
        }
        let mut pos = 0;
        let rd32 = |buf: &[u8], pos: &mut usize| {
            let v = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap());
            *pos += 4;
            v
        };
        let rd16 = |buf: &[u8], pos: &mut usize| {
            let v = u16::from_le_bytes(buf[*pos..*pos + 2].try_into().unwrap());
            *pos += 2;
            v
        };

        for i in 0..8 {
            self.regs.gpr[i] = rd32(buf, &mut pos);
        }
        self.regs.eip = rd32(buf, &mut pos);
        self.regs.eflags = rd32(buf, &mut pos);
        for i in 0..8 {
            self.regs.segs[i] = rd16(buf, &mut pos);
        }
        for i in 0..8 {
            self.regs.cr[i] = rd32(buf, &mut pos);
        }
        for i in 0..8 {
            self.regs.dr[i] = rd32(buf, &mut pos);
        }
        for i in 0..8 {
            self.regs.tr[i] = rd32(buf, &mut pos);
        }
        self.regs.gdtr = TableReg {
            base: rd32(buf, &mut pos),
            limit: rd16(buf, &mut pos),
        };
        self.regs.idtr = TableReg {
            base: rd32(buf, &mut pos),
            limit: rd16(buf, &mut pos),
        };

        let mut raws = [0u64; 8];
        for raw in &mut raws {
            *raw = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
        }
        let mut bases = [0u32; 8];
        for base in &mut bases {
            *base = rd32(buf, &mut pos);
        }
        for i in 0..8 {
            let mut desc = SegmentDescriptor::from_raw(raws[i]);
            desc.base = bases[i];
            self.descriptors[i] = desc;
        }

        self.cpl = buf[pos];
        pos += 1;
        let state = buf[pos];
        pos += 1;
        self.halted = state & 1 << 0 != 0;
        self.nmi_pending = state & 1 << 1 != 0;
        self.nmi_masked = state & 1 << 2 != 0;
        self.waiting_for_sipi = state & 1 << 3 != 0;
        self.inhibit_interrupts = state & 1 << 4 != 0;
        self.repeating = state & 1 << 5 != 0;
        self.reset_pending = buf[pos];
        pos += 1;
        self.fault_level = buf[pos];
        pos += 1;
        self.tsc = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;

        for msr in &mut self.regs.msrs {
            msr.lo = rd32(buf, &mut pos);
            msr.hi = rd32(buf, &mut pos);
        }

        self.mode = registers::derive_mode(self.regs.cr[0], self.regs.eflags);
        self.tlb.clear_all();
        self.refresh_breakpoints();
        Ok(())
    }
}
