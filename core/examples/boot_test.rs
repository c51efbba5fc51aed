//! Boot test - loads a BIOS image and runs a slice of emulated time to
//! watch early boot behavior.

use std::env;
use std::fs;

use pc_core::Emu;

fn main() {
    env_logger::init();

    let mut emu = Emu::with_defaults();

    match env::args().nth(1) {
        Some(path) => match fs::read(&path) {
            Ok(data) => {
                println!("Loaded BIOS: {} ({} bytes)", path, data.len());
                if let Err(e) = emu.load_system_bios(&data) {
                    eprintln!("Failed to map BIOS: {e}");
                    return;
                }
            }
            Err(e) => {
                eprintln!("Failed to read {path}: {e}");
                return;
            }
        },
        None => {
            // No BIOS given: a far jump to a HLT makes a minimal boot.
            let mut rom = vec![0x90u8; 0x10000];
            rom[0] = 0xF4;
            rom[0xFFF0..0xFFF5].copy_from_slice(&[0xEA, 0x00, 0x00, 0x00, 0xF0]);
            emu.load_system_bios(&rom).unwrap();
            println!("No BIOS path given; using the built-in HLT stub");
        }
    }

    // Run 100 ms of emulated time in 1 ms slices.
    for _ in 0..100 {
        emu.run_ns(1_000_000);
    }

    let dump = emu.dump_cpu(0);
    println!("After {} cycles ({} ns emulated):", emu.total_cycles(), emu.emulated_ns());
    println!(
        "  CS:EIP = {:04X}:{:08X}  (linear {:08X})",
        dump.segs[1],
        dump.eip,
        dump.seg_bases[1].wrapping_add(dump.eip)
    );
    println!(
        "  EAX={:08X} EBX={:08X} ECX={:08X} EDX={:08X}",
        dump.gpr[0], dump.gpr[3], dump.gpr[1], dump.gpr[2]
    );
    println!(
        "  ESP={:08X} EBP={:08X} ESI={:08X} EDI={:08X}",
        dump.gpr[4], dump.gpr[5], dump.gpr[6], dump.gpr[7]
    );
    println!("  EFLAGS={:08X} CR0={:08X} mode={:?}", dump.eflags, dump.cr[0], dump.mode);
    println!("  halted={} CPL={}", dump.halted, dump.cpl);
}
