//! [`ArchSwitch`] on the processor the caller runs on.

use core::ptr::NonNull;

use bit_field::BitField;
use x86::segmentation::SegmentSelector;

use super::{
    cross_page::{CrossPage, Dtr},
    switch_handlers,
    world_switch::{ArchSwitch, ControlRegister, Selectors, SwitchEvents},
    x86_instructions,
};

const IA32_APIC_BASE: u32 = 0x1b;
const APIC_BASE_X2APIC_ENABLE: usize = 10;
const APIC_BASE_GLOBAL_ENABLE: usize = 11;

/// Local vector table entries that can deliver an NMI, as (x2APIC MSR, xAPIC
/// MMIO offset). Bit N of an NMI source mask stands for entry N.
const NMI_LVTS: [(u32, usize); 4] = [
    // Thermal sensor.
    (0x833, 0x330),
    // Performance monitoring counters.
    (0x834, 0x340),
    // LINT0.
    (0x835, 0x350),
    // LINT1.
    (0x836, 0x360),
];
const DELIVERY_MODE_NMI: u32 = 0b100;

bitfield::bitfield! {
    /// A local vector table entry.
    #[derive(Clone, Copy)]
    struct LvtEntry(u32);
    impl Debug;
    delivery_mode, _: 10, 8;
    masked, set_masked: 16;
}

/// The processor the caller runs on.
///
/// `xapic` is where the host maps the local APIC registers, which are only
/// needed if the APIC runs in xAPIC mode.
#[derive(Clone, Copy, Debug)]
pub struct X86Cpu {
    xapic: Option<NonNull<u32>>,
}

impl X86Cpu {
    /// # Safety
    ///
    /// `xapic`, if given, must map the local APIC page of every processor
    /// the returned value is used on.
    pub unsafe fn new(xapic: Option<NonNull<u8>>) -> Self {
        Self {
            xapic: xapic.map(NonNull::cast),
        }
    }

    fn read_lvt(&self, x2apic: bool, (msr, offset): (u32, usize)) -> Option<u32> {
        if x2apic {
            return Some(x86_instructions::rdmsr(msr) as u32);
        }
        let base = self.xapic?;
        // Safety: the mapping covers the APIC page and the offset is an LVT.
        Some(unsafe { base.as_ptr().byte_add(offset).read_volatile() })
    }

    fn write_lvt(&self, x2apic: bool, (msr, offset): (u32, usize), value: u32) {
        if x2apic {
            x86_instructions::wrmsr(msr, u64::from(value));
        } else if let Some(base) = self.xapic {
            // Safety: as above.
            unsafe { base.as_ptr().byte_add(offset).write_volatile(value) };
        }
    }
}

/// Whether the APIC is on, and in x2APIC mode.
fn apic_mode() -> Option<bool> {
    let base = x86_instructions::rdmsr(IA32_APIC_BASE);
    base.get_bit(APIC_BASE_GLOBAL_ENABLE)
        .then(|| base.get_bit(APIC_BASE_X2APIC_ENABLE))
}

impl ArchSwitch for X86Cpu {
    fn mask_nmi_sources(&self) -> u32 {
        let Some(x2apic) = apic_mode() else {
            return 0;
        };
        let mut sources = 0;
        for (bit, lvt) in NMI_LVTS.into_iter().enumerate() {
            let Some(mut entry) = self.read_lvt(x2apic, lvt).map(LvtEntry) else {
                continue;
            };
            if entry.delivery_mode() == DELIVERY_MODE_NMI && !entry.masked() {
                entry.set_masked(true);
                self.write_lvt(x2apic, lvt, entry.0);
                let _ = sources.set_bit(bit, true);
            }
        }
        sources
    }

    fn unmask_nmi_sources(&self, sources: u32) {
        let Some(x2apic) = apic_mode() else {
            return;
        };
        for (bit, lvt) in NMI_LVTS.into_iter().enumerate() {
            if !sources.get_bit(bit) {
                continue;
            }
            if let Some(mut entry) = self.read_lvt(x2apic, lvt).map(LvtEntry) {
                entry.set_masked(false);
                self.write_lvt(x2apic, lvt, entry.0);
            }
        }
    }

    fn disable_interrupts(&self) -> u64 {
        x86_instructions::cli()
    }

    fn restore_flags(&self, rflags: u64) {
        x86_instructions::restore_flags(rflags);
    }

    fn read_cr(&self, cr: ControlRegister) -> u64 {
        match cr {
            ControlRegister::Cr0 => x86_instructions::cr0(),
            ControlRegister::Cr2 => x86_instructions::cr2(),
            ControlRegister::Cr3 => x86_instructions::cr3(),
            ControlRegister::Cr4 => x86_instructions::cr4(),
        }
    }

    fn write_cr(&self, cr: ControlRegister, value: u64) {
        match cr {
            ControlRegister::Cr0 => x86_instructions::cr0_write(value),
            ControlRegister::Cr2 => x86_instructions::cr2_write(value),
            ControlRegister::Cr3 => unsafe { x86::controlregs::cr3_write(value) },
            ControlRegister::Cr4 => x86_instructions::cr4_write(value),
        }
    }

    fn read_tsc(&self) -> u64 {
        x86_instructions::rdtsc()
    }

    fn sidt(&self) -> Dtr {
        x86_instructions::sidt()
    }

    fn lidt(&self, idtr: &Dtr) {
        x86_instructions::lidt(idtr);
    }

    fn switch_idtr(&self) -> Dtr {
        switch_handlers::switch_idtr()
    }

    fn take_switch_events(&self) -> SwitchEvents {
        switch_handlers::take_switch_events()
    }

    fn sgdt(&self) -> Dtr {
        x86_instructions::sgdt()
    }

    fn lgdt(&self, gdtr: &Dtr) {
        x86_instructions::lgdt(gdtr);
    }

    fn read_dr(&self, index: usize) -> u64 {
        x86_instructions::dr(index)
    }

    fn write_dr(&self, index: usize, value: u64) {
        x86_instructions::dr_write(index, value);
    }

    fn selectors(&self) -> Selectors {
        use x86::segmentation::{cs, ds, es, fs, gs, ss};
        Selectors {
            cs: cs().bits(),
            ss: ss().bits(),
            ds: ds().bits(),
            es: es().bits(),
            fs: fs().bits(),
            gs: gs().bits(),
        }
    }

    fn load_data_selectors(&self, selectors: &Selectors) {
        x86_instructions::load_data_segments(
            SegmentSelector::from_raw(selectors.ds),
            SegmentSelector::from_raw(selectors.es),
            SegmentSelector::from_raw(selectors.fs),
            SegmentSelector::from_raw(selectors.gs),
        );
    }

    fn sldt(&self) -> u16 {
        x86_instructions::ldtr().bits()
    }

    fn lldt(&self, selector: u16) {
        x86_instructions::lldt(SegmentSelector::from_raw(selector));
    }

    fn str(&self) -> u16 {
        x86_instructions::tr().bits()
    }

    fn ltr(&self, selector: u16) {
        x86_instructions::ltr(SegmentSelector::from_raw(selector));
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        x86_instructions::rdmsr(msr)
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        x86_instructions::wrmsr(msr, value);
    }

    fn raise_interrupt(&self, vector: u8) {
        switch_handlers::raise_interrupt(vector);
    }

    unsafe fn enter_monitor(&self, cross_page: *mut CrossPage) {
        unsafe { switch_handlers::enter_monitor(cross_page) };
    }
}
