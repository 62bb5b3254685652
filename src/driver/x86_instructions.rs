//! Privileged instructions the world switch issues.
//!
//! The functions are safe because their only callers run at ring 0 with
//! interrupts off, which is all the instructions need.

use core::arch::asm;

use x86::{
    bits64::rflags::{self, RFlags},
    dtables::DescriptorTablePointer,
    segmentation::SegmentSelector,
};

use super::cross_page::Dtr;

pub(crate) fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

pub(crate) fn wrmsr(msr: u32, value: u64) {
    unsafe { x86::msr::wrmsr(msr, value) };
}

pub(crate) fn cr0() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr0", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

pub(crate) fn cr0_write(value: u64) {
    unsafe { asm!("mov cr0, {}", in(reg) value, options(nostack, preserves_flags)) };
}

pub(crate) fn cr2() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

pub(crate) fn cr2_write(value: u64) {
    unsafe { asm!("mov cr2, {}", in(reg) value, options(nostack, preserves_flags)) };
}

pub(crate) fn cr3() -> u64 {
    unsafe { x86::controlregs::cr3() }
}

/// Reads the CR4 register, including bits the `x86` crate does not name.
pub(crate) fn cr4() -> u64 {
    let value: u64;
    unsafe { asm!("mov {}, cr4", out(reg) value, options(nomem, nostack, preserves_flags)) };
    value
}

pub(crate) fn cr4_write(value: u64) {
    unsafe { asm!("mov cr4, {}", in(reg) value, options(nostack, preserves_flags)) };
}

/// Reads a debug register. DR4 and DR5 read as zero.
pub(crate) fn dr(index: usize) -> u64 {
    let value: u64;
    unsafe {
        match index {
            0 => asm!("mov {}, dr0", out(reg) value, options(nomem, nostack, preserves_flags)),
            1 => asm!("mov {}, dr1", out(reg) value, options(nomem, nostack, preserves_flags)),
            2 => asm!("mov {}, dr2", out(reg) value, options(nomem, nostack, preserves_flags)),
            3 => asm!("mov {}, dr3", out(reg) value, options(nomem, nostack, preserves_flags)),
            6 => asm!("mov {}, dr6", out(reg) value, options(nomem, nostack, preserves_flags)),
            7 => asm!("mov {}, dr7", out(reg) value, options(nomem, nostack, preserves_flags)),
            _ => value = 0,
        }
    }
    value
}

/// Writes a debug register. Writes to DR4 and DR5 are ignored.
pub(crate) fn dr_write(index: usize, value: u64) {
    unsafe {
        match index {
            0 => asm!("mov dr0, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
            1 => asm!("mov dr1, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
            2 => asm!("mov dr2, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
            3 => asm!("mov dr3, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
            6 => asm!("mov dr6, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
            7 => asm!("mov dr7, {}", in(reg) value, options(nomem, nostack, preserves_flags)),
            _ => {}
        }
    }
}

pub(crate) fn rdtsc() -> u64 {
    unsafe { x86::time::rdtsc() }
}

/// Disables interrupts and returns the previous RFLAGS.
pub(crate) fn cli() -> u64 {
    let flags = rflags::read();
    unsafe { x86::irq::disable() };
    flags.bits()
}

pub(crate) fn restore_flags(value: u64) {
    rflags::set(RFlags::from_raw(value));
}

fn to_pointer(dtr: &Dtr) -> DescriptorTablePointer<u64> {
    DescriptorTablePointer {
        limit: dtr.limit,
        base: dtr.base as *const u64,
    }
}

fn from_pointer(pointer: &DescriptorTablePointer<u64>) -> Dtr {
    Dtr {
        limit: pointer.limit,
        base: pointer.base as u64,
    }
}

pub(crate) fn lidt(idtr: &Dtr) {
    unsafe { x86::dtables::lidt(&to_pointer(idtr)) };
}

pub(crate) fn sidt() -> Dtr {
    let mut idtr = DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sidt(&mut idtr) };
    from_pointer(&idtr)
}

pub(crate) fn lgdt(gdtr: &Dtr) {
    unsafe { x86::dtables::lgdt(&to_pointer(gdtr)) };
}

pub(crate) fn sgdt() -> Dtr {
    let mut gdtr = DescriptorTablePointer::<u64>::default();
    unsafe { x86::dtables::sgdt(&mut gdtr) };
    from_pointer(&gdtr)
}

pub(crate) fn tr() -> SegmentSelector {
    unsafe { x86::task::tr() }
}

pub(crate) fn ltr(selector: SegmentSelector) {
    unsafe { x86::task::load_tr(selector) };
}

pub(crate) fn ldtr() -> SegmentSelector {
    unsafe { x86::dtables::ldtr() }
}

pub(crate) fn lldt(selector: SegmentSelector) {
    unsafe {
        asm!("lldt {0:x}", in(reg) selector.bits(), options(nostack, preserves_flags));
    }
}

/// Loads DS, ES, FS and GS. Loading FS and GS clears their base MSRs.
pub(crate) fn load_data_segments(
    ds: SegmentSelector,
    es: SegmentSelector,
    fs: SegmentSelector,
    gs: SegmentSelector,
) {
    unsafe {
        x86::segmentation::load_ds(ds);
        x86::segmentation::load_es(es);
        x86::segmentation::load_fs(fs);
        x86::segmentation::load_gs(gs);
    }
}

/// Returns the initial APIC ID of the current processor.
pub(crate) fn apic_id() -> u8 {
    (x86::cpuid::cpuid!(0x1).ebx >> 24) as u8
}
