//! Cycle-accurate x86 PC emulator core.
//!
//! This crate provides a platform-agnostic emulator core with a stable C
//! ABI. No OS APIs are used; ROMs, input, and serial traffic all move
//! through byte buffers, and the host drives emulated time explicitly.
//!
//! # Architecture
//!
//! - `config`: host machine configuration
//! - `memory`: physical RAM, ROM windows, the A20 gate
//! - `bus`: the BIU (request/response transactions, prefetch, bus lock)
//! - `cpu`: the x86 execution pipeline
//! - `peripherals`: PIC, PIT, 8042 + PS/2 devices, UARTs, CMOS, game port
//! - `clock`: the 14.318 MHz master clock fabric
//! - `emu`: the outer tick loop tying it all together
//!
//! # Physical memory map (low 1 MB)
//!
//! | Address Range   | Region                       |
//! |-----------------|------------------------------|
//! | 00000 - 9FFFF   | Conventional RAM             |
//! | A0000 - BFFFF   | Video aperture (unhandled)   |
//! | C0000 - EFFFF   | Expansion ROM windows        |
//! | F0000 - FFFFF   | System BIOS (top-aliased)    |

pub mod bus;
pub mod clock;
pub mod config;
pub mod cpu;
pub mod emu;
pub mod fifo;
pub mod memory;
pub mod peripherals;

use std::slice;

pub use config::MachineConfig;
pub use emu::Emu;

/// Create a new emulator instance with the default configuration.
/// Returns null on allocation failure.
#[no_mangle]
pub extern "C" fn emu_create() -> *mut Emu {
    let emu = Box::new(Emu::with_defaults());
    Box::into_raw(emu)
}

/// Destroy an emulator instance.
/// Safe to call with null pointer.
#[no_mangle]
pub extern "C" fn emu_destroy(emu: *mut Emu) {
    if !emu.is_null() {
        unsafe {
            drop(Box::from_raw(emu));
        }
    }
}

/// Map the system BIOS ROM.
/// Returns 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn emu_load_bios(emu: *mut Emu, data: *const u8, len: usize) -> i32 {
    if emu.is_null() || data.is_null() {
        return -1;
    }
    let emu = unsafe { &mut *emu };
    let rom = unsafe { slice::from_raw_parts(data, len) };
    match emu.load_system_bios(rom) {
        Ok(()) => 0,
        Err(_) => -3,
    }
}

/// Map an expansion ROM at a base in C0000-EFFFF.
#[no_mangle]
pub extern "C" fn emu_load_expansion_rom(
    emu: *mut Emu,
    base: u32,
    data: *const u8,
    len: usize,
) -> i32 {
    if emu.is_null() || data.is_null() {
        return -1;
    }
    let emu = unsafe { &mut *emu };
    let rom = unsafe { slice::from_raw_parts(data, len) };
    match emu.load_expansion_rom(base, rom) {
        Ok(()) => 0,
        Err(_) => -3,
    }
}

/// Run the machine for `ns` nanoseconds of emulated time.
/// Returns 1 while running, 0 once a shutdown has been requested.
#[no_mangle]
pub extern "C" fn emu_run_ns(emu: *mut Emu, ns: u64) -> i32 {
    if emu.is_null() {
        return 0;
    }
    let emu = unsafe { &mut *emu };
    match emu.run_ns(ns) {
        emu::StopReason::Terminated => 0,
        emu::StopReason::BudgetSpent => 1,
    }
}

/// Request a full power-on reset.
#[no_mangle]
pub extern "C" fn emu_reset(emu: *mut Emu) {
    if emu.is_null() {
        return;
    }
    let emu = unsafe { &mut *emu };
    emu.reset_hard();
}

/// Queue a key event (set-1 make code, down != 0 for press).
/// Callable from any host thread.
#[no_mangle]
pub extern "C" fn emu_key_event(emu: *const Emu, set1_code: u8, down: i32) {
    if emu.is_null() {
        return;
    }
    let emu = unsafe { &*emu };
    emu.queue_key_event(set1_code, down != 0);
}

/// Queue relative mouse motion and the current button state.
/// Callable from any host thread.
#[no_mangle]
pub extern "C" fn emu_mouse_event(emu: *const Emu, dx: i8, dy: i8, buttons: u8) {
    if emu.is_null() {
        return;
    }
    let emu = unsafe { &*emu };
    emu.queue_mouse_event(dx, dy, buttons);
}

/// Queue a received serial byte for a UART channel (0-3).
/// Callable from any host thread.
#[no_mangle]
pub extern "C" fn emu_uart_rx(emu: *const Emu, channel: u32, byte: u8) {
    if emu.is_null() {
        return;
    }
    let emu = unsafe { &*emu };
    emu.queue_uart_rx(channel as usize, byte);
}

/// Get the size needed for a save-state buffer.
#[no_mangle]
pub extern "C" fn emu_save_state_size(emu: *const Emu) -> usize {
    if emu.is_null() {
        return 0;
    }
    let emu = unsafe { &*emu };
    emu.save_state().len()
}

/// Save machine state to a buffer.
/// Returns bytes written on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn emu_save_state(emu: *const Emu, out: *mut u8, cap: usize) -> i32 {
    if emu.is_null() || out.is_null() {
        return -1;
    }
    let emu = unsafe { &*emu };
    let state = emu.save_state();
    if state.len() > cap {
        return -105;
    }
    let buffer = unsafe { slice::from_raw_parts_mut(out, cap) };
    buffer[..state.len()].copy_from_slice(&state);
    state.len() as i32
}

/// Load machine state from a buffer.
/// Returns 0 on success, negative error code on failure.
#[no_mangle]
pub extern "C" fn emu_load_state(emu: *mut Emu, data: *const u8, len: usize) -> i32 {
    if emu.is_null() || data.is_null() {
        return -1;
    }
    let emu = unsafe { &mut *emu };
    let buffer = unsafe { slice::from_raw_parts(data, len) };
    match emu.load_state(buffer) {
        Ok(()) => 0,
        Err(code) => code,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_destroy() {
        let emu = emu_create();
        assert!(!emu.is_null());
        emu_destroy(emu);
    }

    #[test]
    fn test_null_safety() {
        emu_destroy(std::ptr::null_mut());
        assert_eq!(emu_run_ns(std::ptr::null_mut(), 1000), 0);
        assert_eq!(emu_load_bios(std::ptr::null_mut(), std::ptr::null(), 0), -1);
        emu_key_event(std::ptr::null(), 0, 1);
    }

    #[test]
    fn test_run_until_shutdown() {
        let emu = emu_create();
        let rom = vec![0xF4u8; 16]; // HLT-filled stub lands at the vector
        assert_eq!(emu_load_bios(emu, rom.as_ptr(), rom.len()), 0);
        assert_eq!(emu_run_ns(emu, 1_000_000), 1);
        unsafe { &mut *emu }.request_shutdown();
        assert_eq!(emu_run_ns(emu, 1_000_000), 0);
        emu_destroy(emu);
    }

    #[test]
    fn test_save_state_round_trip() {
        let emu = emu_create();
        let size = emu_save_state_size(emu);
        assert!(size > 0);
        let mut buf = vec![0u8; size];
        assert_eq!(emu_save_state(emu, buf.as_mut_ptr(), buf.len()), size as i32);
        assert_eq!(emu_load_state(emu, buf.as_ptr(), buf.len()), 0);
        emu_destroy(emu);
    }
}
