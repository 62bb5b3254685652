//! The IDT loaded while the world switch runs, the monitor entry trampoline,
//! and the stubs that re-raise host interrupts.
//!
//! The switch IDT only handles `#DB`, NMI and `#MC`. Each handler records the
//! event for the current processor, indexed by APIC ID, and returns.

use core::{
    arch::global_asm,
    mem::offset_of,
    sync::atomic::{AtomicU8, Ordering},
};

use alloc::boxed::Box;
use spin::Once;

use super::{
    cross_page::{CrossPage, Dtr, HostContext, MonitorContext},
    support::zeroed_box,
    world_switch::SwitchEvents,
    x86_instructions::apic_id,
};

const DEBUG_VECTOR: usize = 1;
const NMI_VECTOR: usize = 2;
const MACHINE_CHECK_VECTOR: usize = 18;

/// Per APIC ID flags set by the handlers.
static DEBUG_TRAPS: [AtomicU8; 256] = [const { AtomicU8::new(0) }; 256];
static NMIS: [AtomicU8; 256] = [const { AtomicU8::new(0) }; 256];
static MACHINE_CHECKS: [AtomicU8; 256] = [const { AtomicU8::new(0) }; 256];

static SWITCH_IDT: Once<Box<InterruptDescriptorTableRaw>> = Once::new();

/// Returns the IDTR of the switch IDT, building the IDT on first use.
pub(crate) fn switch_idtr() -> Dtr {
    let idt = SWITCH_IDT.call_once(|| {
        let cs = x86::segmentation::cs().bits();
        let mut idt = zeroed_box::<InterruptDescriptorTableRaw>();
        idt.0[DEBUG_VECTOR] = InterruptDescriptorTableEntry::new(vmmon_debug_handler as usize, cs);
        idt.0[NMI_VECTOR] = InterruptDescriptorTableEntry::new(vmmon_nmi_handler as usize, cs);
        idt.0[MACHINE_CHECK_VECTOR] =
            InterruptDescriptorTableEntry::new(vmmon_machine_check_handler as usize, cs);
        idt
    });
    Dtr {
        limit: (core::mem::size_of::<InterruptDescriptorTableRaw>() - 1) as u16,
        base: &**idt as *const InterruptDescriptorTableRaw as u64,
    }
}

/// Returns and clears the events recorded on the current processor.
pub(crate) fn take_switch_events() -> SwitchEvents {
    let id = usize::from(apic_id());
    SwitchEvents {
        nmi: NMIS[id].swap(0, Ordering::AcqRel) != 0,
        mce: MACHINE_CHECKS[id].swap(0, Ordering::AcqRel) != 0,
        debug_trap: DEBUG_TRAPS[id].swap(0, Ordering::AcqRel) != 0,
    }
}

/// Raises `vector` through the host IDT with `int`.
pub(crate) fn raise_interrupt(vector: u8) {
    let stub = vmmon_int_stubs as usize + usize::from(vector) * INT_STUB_SIZE;
    // Safety: every stub is `int N; ret` and the table has one per vector.
    let stub: unsafe extern "sysv64" fn() = unsafe { core::mem::transmute(stub) };
    unsafe { stub() };
}

/// Enters the monitor described by `cross_page`.
///
/// # Safety
///
/// See [`ArchSwitch::enter_monitor`](super::world_switch::ArchSwitch::enter_monitor).
pub(crate) unsafe fn enter_monitor(cross_page: *mut CrossPage) {
    unsafe { vmmon_enter_monitor(cross_page) };
}

#[derive(Debug)]
#[repr(C, align(4096))]
struct InterruptDescriptorTableRaw([InterruptDescriptorTableEntry; 0x100]);
const _: () = assert!(core::mem::size_of::<InterruptDescriptorTableRaw>() == 4096);

#[derive(Debug)]
#[repr(C, align(16))]
struct InterruptDescriptorTableEntry {
    offset_low: u16,
    selector: u16,
    reserved_1: u8,
    gate_type: u8,
    offset_high: u16,
    offset_upper: u32,
    reserved_2: u32,
}
const _: () = assert!(core::mem::size_of::<InterruptDescriptorTableEntry>() == 16);

impl InterruptDescriptorTableEntry {
    fn new(handler: usize, cs: u16) -> Self {
        // P=1, DPL=00b, S=0, type=1110b => type_attr=1000_1110b => 0x8E
        const INTERRUPT_GATE: u8 = 0x8E;
        Self {
            offset_low: handler as _,
            selector: cs,
            reserved_1: 0,
            gate_type: INTERRUPT_GATE,
            offset_high: (handler >> 16) as _,
            offset_upper: (handler >> 32) as _,
            reserved_2: 0,
        }
    }
}

const INT_STUB_SIZE: usize = 8;

global_asm!(
    include_str!("switch_handlers.S"),
    host_rsp = const offset_of!(CrossPage, host) + offset_of!(HostContext, rsp),
    host_rip = const offset_of!(CrossPage, host) + offset_of!(HostContext, rip),
    monitor_cr3 = const offset_of!(CrossPage, monitor) + offset_of!(MonitorContext, cr3),
    monitor_rsp = const offset_of!(CrossPage, monitor) + offset_of!(MonitorContext, rsp),
    monitor_rip = const offset_of!(CrossPage, monitor) + offset_of!(MonitorContext, rip),
    debug_traps = sym DEBUG_TRAPS,
    nmis = sym NMIS,
    machine_checks = sym MACHINE_CHECKS,
    stub_size = const INT_STUB_SIZE,
);
unsafe extern "sysv64" {
    /// Saves the callee-saved registers, stack and return address into
    /// `cross_page.host`, then jumps to `cross_page.monitor`. Returns when
    /// the monitor jumps back to the saved address with the host CR3.
    fn vmmon_enter_monitor(cross_page: *mut CrossPage);

    fn vmmon_debug_handler();
    fn vmmon_nmi_handler();
    fn vmmon_machine_check_handler();

    /// 256 stubs of `INT_STUB_SIZE` bytes, stub N being `int N; ret`.
    fn vmmon_int_stubs();
}
