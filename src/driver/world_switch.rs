//! The world switch: saves the host CPU state into the crosspage, enters the
//! monitor, and restores the host state when the monitor returns.
//!
//! The privileged CPU operations go through [`ArchSwitch`] so that the
//! sequence itself is independent of how they are carried out.

use alloc::{boxed::Box, vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, Once};
use x86::controlregs::Cr4;

use super::{
    Vmmon,
    config::TssStrategy,
    cross_gdt::CrossGdt,
    cross_page::{CrossPage, CrossPageMapping, Dtr, HostContext, ModuleCall, USERCALL_NONE},
    host_ops::HostOps,
    pseudo_tsc::{PseudoTsc, PseudoTscParams},
    segment::{self, TssDescriptor},
    vm::NO_HOST_CPU,
    vmcs_pages::{VmcsKind, VmcsPages},
};

pub const NMI_VECTOR: u8 = 2;

pub(crate) const IA32_FS_BASE: u32 = 0xc000_0100;
pub(crate) const IA32_GS_BASE: u32 = 0xc000_0101;
pub(crate) const IA32_KERNEL_GS_BASE: u32 = 0xc000_0102;

const CR4_PGE: u64 = Cr4::CR4_ENABLE_GLOBAL_PAGES.bits() as u64;
const CR4_RESERVED: u64 = !(Cr4::all().bits() as u64);

pub(crate) const DR7_ENABLED: u64 = 0xff;
pub(crate) const DR7_GD: u64 = 1 << 13;
pub(crate) const DR7_DEFAULT: u64 = 0x400;

/// Entries of the per processor GDT used to reload TR.
const TEMP_GDT_ENTRIES: usize = 512;

const SELECTOR_TI: u16 = 1 << 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRegister {
    Cr0,
    Cr2,
    Cr3,
    Cr4,
}

/// Segment selectors of the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Selectors {
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
}

/// Exceptions the switch IDT caught since the last query.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SwitchEvents {
    pub nmi: bool,
    pub mce: bool,
    /// A `#DB`, raised by reading debug registers while DR7.GD is set.
    pub debug_trap: bool,
}

impl SwitchEvents {
    fn merge(&mut self, other: Self) {
        self.nmi |= other.nmi;
        self.mce |= other.mce;
        self.debug_trap |= other.debug_trap;
    }
}

/// The privileged CPU operations the world switch is made of. Every method
/// acts on the current processor, which must not change while a switch is in
/// progress.
pub trait ArchSwitch {
    /// Masks the local APIC NMI sources and returns those that were unmasked.
    fn mask_nmi_sources(&self) -> u32;

    fn unmask_nmi_sources(&self, sources: u32);

    /// Disables interrupts and returns the previous RFLAGS.
    fn disable_interrupts(&self) -> u64;

    fn restore_flags(&self, rflags: u64);

    fn read_cr(&self, cr: ControlRegister) -> u64;

    fn write_cr(&self, cr: ControlRegister, value: u64);

    fn read_tsc(&self) -> u64;

    fn sidt(&self) -> Dtr;

    fn lidt(&self, idtr: &Dtr);

    /// The IDT loaded for the duration of the switch. It only handles
    /// `#DB`, NMI and `#MC` and records them as [`SwitchEvents`].
    fn switch_idtr(&self) -> Dtr;

    fn take_switch_events(&self) -> SwitchEvents;

    fn sgdt(&self) -> Dtr;

    fn lgdt(&self, gdtr: &Dtr);

    fn read_dr(&self, index: usize) -> u64;

    fn write_dr(&self, index: usize, value: u64);

    fn selectors(&self) -> Selectors;

    /// Loads DS, ES, FS and GS.
    fn load_data_selectors(&self, selectors: &Selectors);

    fn sldt(&self) -> u16;

    fn lldt(&self, selector: u16);

    fn str(&self) -> u16;

    fn ltr(&self, selector: u16);

    fn rdmsr(&self, msr: u32) -> u64;

    fn wrmsr(&self, msr: u32, value: u64);

    /// Raises `vector` with a software interrupt on the current thread.
    fn raise_interrupt(&self, vector: u8);

    /// Switches to the monitor described by `cross_page.monitor` and returns
    /// once the monitor switches back.
    ///
    /// # Safety
    ///
    /// Interrupts must be disabled, the host state saved into `cross_page`,
    /// and `cross_page` must stay mapped until the call returns.
    unsafe fn enter_monitor(&self, cross_page: *mut CrossPage);
}

/// Process wide state of the world switch.
#[derive(Debug)]
pub(crate) struct Task {
    strategy: TssStrategy,
    temp_gdts: Box<[Mutex<TempGdt>]>,
    pub(crate) vmcs: VmcsPages,
    pub(crate) pseudo_tsc: PseudoTsc,
    pub(crate) cross_gdt: Once<CrossGdt>,
}

/// A GDT that only holds the descriptors needed to reload TR.
#[derive(Debug)]
struct TempGdt(Box<[u64]>);

impl TempGdt {
    /// Loads TR from a copy of the host TSS descriptor with the busy bit
    /// clear. Returns `false`, loading nothing, if a needed descriptor does
    /// not fit.
    fn load_tr<A: ArchSwitch>(&mut self, cpu: &A, host: &HostContext, tss: &TssDescriptor) -> bool {
        let cs = usize::from(host.cs >> 3);
        let ss = usize::from(host.ss >> 3);
        if [cs, ss, tss.index + 1].iter().any(|&index| index >= self.0.len()) {
            return false;
        }

        // Safety: both are in the host GDT; their selectors are loaded.
        unsafe {
            self.0[cs] = segment::gdt_entry(&host.gdtr, cs);
            self.0[ss] = segment::gdt_entry(&host.gdtr, ss);
        }
        self.0[tss.index] = tss.low64_available();
        self.0[tss.index + 1] = tss.high64;

        cpu.lgdt(&Dtr {
            limit: (self.0.len() * 8 - 1) as u16,
            base: self.0.as_mut_ptr() as u64,
        });
        cpu.ltr(host.tr);
        true
    }
}

impl Task {
    pub(crate) fn new(cpu_count: usize, strategy: TssStrategy) -> Self {
        Self {
            strategy,
            temp_gdts: (0..cpu_count)
                .map(|_| Mutex::new(TempGdt(vec![0; TEMP_GDT_ENTRIES].into_boxed_slice())))
                .collect(),
            vmcs: VmcsPages::new(cpu_count),
            pseudo_tsc: PseudoTsc::new(),
            cross_gdt: Once::new(),
        }
    }

    pub(crate) fn teardown(&self, host: &dyn HostOps) {
        self.vmcs.teardown(host);
    }

    /// Runs the monitor of the VCPU whose crosspage is `mapping` until it
    /// leaves a request. Repeats the switch when an NMI or machine check hit
    /// the switch window.
    ///
    /// The processor is sampled once interrupts are off, published in
    /// `host_cpu` while the monitor runs, and returned.
    pub(crate) fn switch<A: ArchSwitch>(
        &self,
        cpu: &A,
        host: &dyn HostOps,
        host_cpu: &AtomicUsize,
        mapping: &mut CrossPageMapping,
    ) -> usize {
        loop {
            let nmi_sources = cpu.mask_nmi_sources();
            let rflags = cpu.disable_interrupts();
            let cpu_index = host.current_cpu();
            host_cpu.store(cpu_index, Ordering::Release);

            let page = mapping.get();
            page.user_call_type = USERCALL_NONE;
            page.user_call_cross = 0;
            page.retry_world_switch = 0;
            if page.needs_vmx_root != 0 {
                match self.vmcs.get(VmcsKind::Root, cpu_index) {
                    Some(mpn) => page.root_vmcs_mpn = mpn.0,
                    None => {
                        page.set_module_call(ModuleCall::AllocVmxPage);
                        host_cpu.store(NO_HOST_CPU, Ordering::Release);
                        cpu.unmask_nmi_sources(nmi_sources);
                        cpu.restore_flags(rflags);
                        return cpu_index;
                    }
                }
            }

            let mut events = self.save_host_state(cpu, host, page, nmi_sources, rflags);
            // Safety: interrupts are off, the host state is saved and the
            // mapping outlives the call.
            unsafe { cpu.enter_monitor(mapping.raw()) };
            events.merge(cpu.take_switch_events());

            let page = mapping.get();
            self.restore_host_state(cpu, page, cpu_index);
            events.merge(cpu.take_switch_events());

            if page.module_call() == Ok(ModuleCall::Intr) {
                cpu.raise_interrupt(page.intr_vector as u8);
            }
            if events.nmi {
                cpu.raise_interrupt(NMI_VECTOR);
            }
            if events.mce {
                log::warn!("Machine check during world switch on processor {cpu_index}");
            }
            host_cpu.store(NO_HOST_CPU, Ordering::Release);
            cpu.unmask_nmi_sources(nmi_sources);
            cpu.restore_flags(rflags);

            if page.retry_world_switch == 0 && !events.nmi && !events.mce {
                return cpu_index;
            }
            log::trace!("Repeating world switch on processor {cpu_index}");
        }
    }

    fn save_host_state<A: ArchSwitch>(
        &self,
        cpu: &A,
        host: &dyn HostOps,
        page: &mut CrossPage,
        nmi_sources: u32,
        rflags: u64,
    ) -> SwitchEvents {
        let mut events = SwitchEvents::default();
        let h = &mut page.host;
        h.nmi_sources = nmi_sources;
        h.rflags = rflags;

        h.cr0 = cpu.read_cr(ControlRegister::Cr0);
        h.cr2 = cpu.read_cr(ControlRegister::Cr2);
        h.cr3 = cpu.read_cr(ControlRegister::Cr3);
        h.cr4 = cpu.read_cr(ControlRegister::Cr4);
        cpu.write_cr(ControlRegister::Cr4, h.cr4 & !(CR4_PGE | CR4_RESERVED));

        self.pseudo_tsc
            .update(&mut page.pseudo_tsc, cpu.read_tsc(), host.ref_clock_ns());

        let h = &mut page.host;
        h.idtr = cpu.sidt();
        cpu.lidt(&cpu.switch_idtr());
        save_debug_registers(cpu, h, &mut events);

        h.gdtr = cpu.sgdt();
        let selectors = cpu.selectors();
        h.cs = selectors.cs;
        h.ss = selectors.ss;
        h.ds = selectors.ds;
        h.es = selectors.es;
        h.fs = selectors.fs;
        h.gs = selectors.gs;
        h.ldt = cpu.sldt();
        h.tr = cpu.str();
        for (name, selector) in [("CS", h.cs), ("SS", h.ss), ("TR", h.tr)] {
            assert!(
                selector & SELECTOR_TI == 0,
                "host {name} {selector:#x} refers to the LDT"
            );
        }
        assert!(h.tr != 0, "host TR is not loaded");

        h.fs_base = cpu.rdmsr(IA32_FS_BASE);
        h.gs_base = cpu.rdmsr(IA32_GS_BASE);
        h.kernel_gs_base = cpu.rdmsr(IA32_KERNEL_GS_BASE);
        events
    }

    fn restore_host_state<A: ArchSwitch>(&self, cpu: &A, page: &CrossPage, cpu_index: usize) {
        let h = &page.host;
        self.restore_gdt_and_tr(cpu, h, cpu_index);
        cpu.lldt(h.ldt);
        cpu.load_data_selectors(&Selectors {
            cs: h.cs,
            ss: h.ss,
            ds: h.ds,
            es: h.es,
            fs: h.fs,
            gs: h.gs,
        });
        cpu.wrmsr(IA32_FS_BASE, h.fs_base);
        cpu.wrmsr(IA32_GS_BASE, h.gs_base);
        cpu.wrmsr(IA32_KERNEL_GS_BASE, h.kernel_gs_base);

        for (cr, value) in [
            (ControlRegister::Cr0, h.cr0),
            (ControlRegister::Cr2, h.cr2),
            (ControlRegister::Cr4, h.cr4),
        ] {
            if cpu.read_cr(cr) != value {
                cpu.write_cr(cr, value);
            }
        }
        restore_debug_registers(cpu, h);
        cpu.lidt(&h.idtr);
    }

    /// Reloads the host GDT and TR. TR can only be loaded from a descriptor
    /// that is not busy, while the host one is busy since the host loaded it.
    fn restore_gdt_and_tr<A: ArchSwitch>(&self, cpu: &A, h: &HostContext, cpu_index: usize) {
        let tss = TssDescriptor::try_from_gdtr(&h.gdtr, h.tr)
            .unwrap_or_else(|err| panic!("unexpected host TSS state: {err}"));

        if self.strategy == TssStrategy::TempGdt {
            if let Some(temp) = self.temp_gdts.get(cpu_index) {
                if temp.lock().load_tr(cpu, h, &tss) {
                    cpu.lgdt(&h.gdtr);
                    return;
                }
            }
            log::warn!(
                "Host GDT does not fit the temporary GDT, clearing busy bit of TSS {:#x} in place",
                tss.base()
            );
        }

        cpu.lgdt(&h.gdtr);
        if tss.is_busy() {
            // Safety: the descriptor is in the live host GDT.
            unsafe { segment::set_gdt_entry(&h.gdtr, tss.index, tss.low64_available()) };
        }
        cpu.ltr(h.tr);
    }
}

/// Saves the host debug registers and disables its breakpoints. If DR7.GD
/// is set, the registers are left as they are and GD is rearmed on return.
fn save_debug_registers<A: ArchSwitch>(cpu: &A, h: &mut HostContext, events: &mut SwitchEvents) {
    h.dr_saved = 0;
    h.dr_preserved = 0;

    let dr7 = cpu.read_dr(7);
    events.merge(cpu.take_switch_events());
    if events.debug_trap {
        // The #DB cleared GD, so it reads back without it.
        h.dr[7] = dr7 | DR7_GD;
        h.dr_preserved = 1;
        return;
    }

    h.dr[7] = dr7;
    if dr7 & DR7_ENABLED == 0 {
        return;
    }
    for index in [0, 1, 2, 3, 6] {
        h.dr[index] = cpu.read_dr(index);
        h.dr_saved |= 1 << index;
    }
    h.dr_saved |= 1 << 7;
    cpu.write_dr(7, DR7_DEFAULT);
}

fn restore_debug_registers<A: ArchSwitch>(cpu: &A, h: &HostContext) {
    let to_restore = if h.dr_preserved != 0 {
        1 << 7
    } else {
        h.dr_saved
    };
    for index in [0, 1, 2, 3, 6, 7] {
        if to_restore & (1 << index) != 0 && cpu.read_dr(index) != h.dr[index] {
            cpu.write_dr(index, h.dr[index]);
        }
    }
}

impl Vmmon {
    /// Sets the basis of the pseudo TSC. Only the first call takes effect,
    /// except that any call can switch it to the reference clock.
    pub fn init_pseudo_tsc<A: ArchSwitch>(
        &self,
        cpu: &A,
        tsc_hz: u64,
        use_ref_clock: bool,
    ) -> PseudoTscParams {
        self.task
            .pseudo_tsc
            .init(tsc_hz, use_ref_clock, cpu.read_tsc(), self.host.ref_clock_ns())
    }

    /// Makes the pseudo TSC follow the reference clock from now on. Returns
    /// `false` if it already did.
    pub fn switch_pseudo_tsc_to_ref_clock<A: ArchSwitch>(&self, cpu: &A) -> bool {
        if !self.task.pseudo_tsc.is_initialized() {
            log::warn!("Pseudo TSC has no basis yet");
            return false;
        }
        self.task
            .pseudo_tsc
            .switch_to_ref_clock(cpu.read_tsc(), self.host.ref_clock_ns())
    }
}
