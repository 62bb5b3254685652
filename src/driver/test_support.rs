//! In-memory stand-ins for the host kernel and the processor.

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec, vec::Vec};
use core::{
    cell::{Cell, RefCell, UnsafeCell},
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};
use std::{collections::VecDeque, sync::Mutex};

use super::{
    Vmmon,
    config::DriverConfig,
    cross_page::{CROSS_PAGE_VERSION, CrossPage, CrossPageMapping, Dtr, ModuleCall},
    host_ops::{HostError, HostOps, PinnedPage, SemaphoreStatus, WaitStatus},
    segment::{self, TssDescriptor},
    support::zeroed_box,
    types::{Mpn, PAGE_SIZE, UserVa, VmId},
    world_switch::{
        ArchSwitch, ControlRegister, IA32_FS_BASE, IA32_GS_BASE, IA32_KERNEL_GS_BASE, Selectors,
        SwitchEvents,
    },
};

#[ctor::ctor]
fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Creates a driver on a fresh fake host. The host logger is never installed
/// so that `env_logger` keeps the log output.
pub(crate) fn vmmon_with(config: DriverConfig) -> (Vmmon, Arc<FakeHost>) {
    let host = FakeHost::new(2);
    let vmmon = Vmmon::init(
        DriverConfig {
            log_level: None,
            ..config
        },
        host.clone(),
    );
    (vmmon, host)
}

const PAGE: u64 = PAGE_SIZE as u64;

const USER_BASE: u64 = 0x7f00_0000_0000;
const USER_PAGES: u64 = 0x400;
const USER_MPN_BASE: u64 = 0x1000;

const CROSS_BASE: u64 = 0x7e00_0000_0000;
const CROSS_MPN_BASE: u64 = 0x2_0000;

const BUFFER_BASE: u64 = 0x7d00_0000_0000;
const BUFFER_STRIDE: u64 = 0x10_0000;

const ANON_MPN_BASE: u64 = 0x8_0000;

struct FakeCrossPage {
    va: UserVa,
    mpn: Mpn,
    page: Box<UnsafeCell<CrossPage>>,
}

#[derive(Default)]
struct HostState {
    pins: BTreeMap<Mpn, u32>,
    fail_pins: Option<HostError>,
    cross_pages: Vec<FakeCrossPage>,
    mapped: usize,
    buffers: Vec<(UserVa, Vec<u8>)>,
    anon: Vec<Mpn>,
    next_anon: u64,
    allocations_left: usize,
    lockable: u64,
    sleeps: usize,
    yields: usize,
    fast_clock_rates: Vec<u32>,
    semaphore_script: VecDeque<SemaphoreStatus>,
    semaphore_calls: Vec<(&'static str, i32)>,
    force_wakeups: Vec<(VmId, usize)>,
    ipis: Vec<usize>,
    main_thread_wakeups: usize,
    user_call_script: VecDeque<WaitStatus>,
    awakened: Vec<(VmId, usize)>,
}

type BlockingCallCheck = Box<dyn Fn() + Send + Sync>;

pub(crate) struct FakeHost {
    cpus: usize,
    current_cpu: AtomicUsize,
    state: Mutex<HostState>,
    blocking_call_check: Mutex<Option<BlockingCallCheck>>,
}

impl FakeHost {
    pub(crate) fn new(cpus: usize) -> Arc<Self> {
        Arc::new(Self {
            cpus,
            current_cpu: AtomicUsize::new(0),
            blocking_call_check: Mutex::new(None),
            state: Mutex::new(HostState {
                next_anon: ANON_MPN_BASE,
                allocations_left: usize::MAX,
                lockable: u64::MAX,
                ..HostState::default()
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    /// Runs `check` at the start of every host call that may sleep.
    pub(crate) fn on_blocking_call(&self, check: Option<BlockingCallCheck>) {
        *self.blocking_call_check.lock().unwrap() = check;
    }

    fn may_sleep(&self) {
        if let Some(check) = &*self.blocking_call_check.lock().unwrap() {
            check();
        }
    }

    /// The `index`th page of the pinnable user region.
    pub(crate) fn user_va(index: u64) -> UserVa {
        assert!(index < USER_PAGES);
        UserVa(USER_BASE + index * PAGE)
    }

    /// Moves the calling thread to processor `cpu`.
    pub(crate) fn set_current_cpu(&self, cpu: usize) {
        assert!(cpu < self.cpus);
        self.current_cpu.store(cpu, Ordering::Relaxed);
    }

    pub(crate) fn pin_count(&self, mpn: Mpn) -> u32 {
        self.state().pins.get(&mpn).copied().unwrap_or(0)
    }

    /// Pages pinned with `pin_user_page` and not yet unpinned.
    pub(crate) fn pinned_pages(&self) -> usize {
        self.state().pins.values().filter(|&&count| count > 0).count()
    }

    pub(crate) fn fail_pins_with(&self, error: Option<HostError>) {
        self.state().fail_pins = error;
    }

    /// Lets `count` more anonymous page allocations succeed.
    pub(crate) fn fail_allocations_after(&self, count: usize) {
        self.state().allocations_left = count;
    }

    pub(crate) fn anon_pages_in_use(&self) -> usize {
        self.state().anon.len()
    }

    pub(crate) fn set_lockable_estimate(&self, pages: u64) {
        self.state().lockable = pages;
    }

    /// A crosspage in user memory with a valid header.
    pub(crate) fn new_cross_page(&self) -> UserVa {
        let mut state = self.state();
        let index = state.cross_pages.len() as u64;
        let page = zeroed_box::<UnsafeCell<CrossPage>>();
        // Safety: nothing else refers to the new page.
        let cross_page = unsafe { &mut *page.get() };
        cross_page.version = CROSS_PAGE_VERSION;
        cross_page.size = core::mem::size_of::<CrossPage>() as u32;

        let va = UserVa(CROSS_BASE + index * PAGE);
        state.cross_pages.push(FakeCrossPage {
            va,
            mpn: Mpn(CROSS_MPN_BASE + index),
            page,
        });
        va
    }

    pub(crate) fn with_cross_page(&self, va: UserVa, f: impl FnOnce(&mut CrossPage)) {
        let state = self.state();
        let entry = state
            .cross_pages
            .iter()
            .find(|entry| entry.va == va)
            .expect("unknown crosspage");
        // Safety: the page is not mapped by anyone while tests edit it.
        f(unsafe { &mut *entry.page.get() });
    }

    pub(crate) fn map_new_cross_page(&self) -> CrossPageMapping {
        let va = self.new_cross_page();
        let page = self.map_user_page(va).unwrap();
        CrossPageMapping { page, va }
    }

    pub(crate) fn mapped_pages(&self) -> usize {
        self.state().mapped
    }

    /// A zero-filled user buffer of `bytes` bytes.
    pub(crate) fn new_user_buffer(&self, bytes: usize) -> UserVa {
        let mut state = self.state();
        let va = UserVa(BUFFER_BASE + state.buffers.len() as u64 * BUFFER_STRIDE);
        state.buffers.push((va, vec![0; bytes]));
        va
    }

    pub(crate) fn read_user_buffer(&self, va: UserVa) -> Vec<u8> {
        let state = self.state();
        let (_, bytes) = state
            .buffers
            .iter()
            .find(|(base, _)| *base == va)
            .expect("unknown buffer");
        bytes.clone()
    }

    pub(crate) fn sleeps(&self) -> usize {
        self.state().sleeps
    }

    pub(crate) fn yields(&self) -> usize {
        self.state().yields
    }

    pub(crate) fn fast_clock_rates(&self) -> Vec<u32> {
        self.state().fast_clock_rates.clone()
    }

    /// Results of the next semaphore operations. Later ones succeed.
    pub(crate) fn script_semaphore(&self, results: impl IntoIterator<Item = SemaphoreStatus>) {
        self.state().semaphore_script.extend(results);
    }

    pub(crate) fn semaphore_calls(&self) -> Vec<(&'static str, i32)> {
        self.state().semaphore_calls.clone()
    }

    pub(crate) fn force_wakeups(&self) -> Vec<(VmId, usize)> {
        self.state().force_wakeups.clone()
    }

    pub(crate) fn ipis(&self) -> Vec<usize> {
        self.state().ipis.clone()
    }

    /// Results of the next user call waits. Later ones are woken.
    pub(crate) fn script_user_call_waits(&self, results: impl IntoIterator<Item = WaitStatus>) {
        self.state().user_call_script.extend(results);
    }

    pub(crate) fn main_thread_wakeups(&self) -> usize {
        self.state().main_thread_wakeups
    }

    pub(crate) fn awakened(&self) -> Vec<(VmId, usize)> {
        self.state().awakened.clone()
    }

    fn buffer_range(state: &mut HostState, va: UserVa, len: usize) -> Option<&mut [u8]> {
        state.buffers.iter_mut().find_map(|(base, bytes)| {
            let start = va.0.checked_sub(base.0)? as usize;
            bytes.get_mut(start..start.checked_add(len)?)
        })
    }
}

impl HostOps for FakeHost {
    fn pin_user_page(&self, va: UserVa) -> Result<Mpn, HostError> {
        self.may_sleep();
        let mut state = self.state();
        if let Some(error) = state.fail_pins {
            return Err(error);
        }
        if !(USER_BASE..USER_BASE + USER_PAGES * PAGE).contains(&va.0) {
            return Err(HostError::Fault);
        }
        let mpn = Mpn(USER_MPN_BASE + (va.0 - USER_BASE) / PAGE);
        *state.pins.entry(mpn).or_default() += 1;
        Ok(mpn)
    }

    fn unpin_user_page(&self, mpn: Mpn) {
        self.may_sleep();
        let mut state = self.state();
        let count = state.pins.get_mut(&mpn).expect("unpinning an unknown page");
        assert!(*count > 0, "unpinning MPN {mpn} too often");
        *count -= 1;
    }

    fn map_user_page(&self, va: UserVa) -> Result<PinnedPage, HostError> {
        let mut state = self.state();
        let (mpn, ptr) = state
            .cross_pages
            .iter()
            .find(|entry| entry.va.vpn() == va.vpn())
            .map(|entry| (entry.mpn, entry.page.get()))
            .ok_or(HostError::Fault)?;
        state.mapped += 1;
        Ok(PinnedPage {
            mpn,
            kernel_va: NonNull::new(ptr).ok_or(HostError::Fault)?.cast(),
        })
    }

    fn unmap_user_page(&self, _page: PinnedPage) {
        let mut state = self.state();
        assert!(state.mapped > 0, "unmapping more pages than mapped");
        state.mapped -= 1;
    }

    fn alloc_anon_page(&self) -> Option<Mpn> {
        self.may_sleep();
        let mut state = self.state();
        if state.allocations_left == 0 {
            return None;
        }
        if state.allocations_left != usize::MAX {
            state.allocations_left -= 1;
        }
        let mpn = Mpn(state.next_anon);
        state.next_anon += 1;
        state.anon.push(mpn);
        Some(mpn)
    }

    fn free_anon_page(&self, mpn: Mpn) {
        self.may_sleep();
        let mut state = self.state();
        let position = state
            .anon
            .iter()
            .position(|&allocated| allocated == mpn)
            .expect("freeing a page that is not allocated");
        let _ = state.anon.swap_remove(position);
    }

    fn anon_page_ref_count(&self, _mpn: Mpn) -> u32 {
        1
    }

    fn copy_to_user(&self, dst: UserVa, src: &[u8]) -> Result<(), HostError> {
        self.may_sleep();
        let mut state = self.state();
        let range = Self::buffer_range(&mut state, dst, src.len()).ok_or(HostError::Fault)?;
        range.copy_from_slice(src);
        Ok(())
    }

    fn copy_from_user(&self, dst: &mut [u8], src: UserVa) -> Result<(), HostError> {
        self.may_sleep();
        let mut state = self.state();
        let range = Self::buffer_range(&mut state, src, dst.len()).ok_or(HostError::Fault)?;
        dst.copy_from_slice(range);
        Ok(())
    }

    fn pa(&self, va: *const core::ffi::c_void) -> u64 {
        va as u64
    }

    fn lockable_page_estimate(&self) -> u64 {
        self.may_sleep();
        self.state().lockable
    }

    fn current_cpu(&self) -> usize {
        self.current_cpu.load(Ordering::Relaxed)
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }

    fn ref_clock_ns(&self) -> u64 {
        1_000
    }

    fn sleep_ms(&self, _ms: u32) {
        self.state().sleeps += 1;
    }

    fn yield_now(&self) {
        self.state().yields += 1;
    }

    fn semaphore_wait(&self, _vm: VmId, fd: i32, _timeout_ms: u32) -> SemaphoreStatus {
        let mut state = self.state();
        state.semaphore_calls.push(("wait", fd));
        state
            .semaphore_script
            .pop_front()
            .unwrap_or(SemaphoreStatus::Done)
    }

    fn semaphore_signal(&self, fd: i32) -> SemaphoreStatus {
        let mut state = self.state();
        state.semaphore_calls.push(("signal", fd));
        state
            .semaphore_script
            .pop_front()
            .unwrap_or(SemaphoreStatus::Done)
    }

    fn semaphore_force_wakeup(&self, vm: VmId, vcpu: usize) {
        self.state().force_wakeups.push((vm, vcpu));
    }

    fn send_ipi(&self, cpu: usize) {
        self.state().ipis.push(cpu);
    }

    fn wake_main_thread(&self, _vm: VmId) {
        self.state().main_thread_wakeups += 1;
    }

    fn user_call_wait(&self, _vm: VmId, _vcpu: usize, _timeout_ms: u32) -> WaitStatus {
        self.state()
            .user_call_script
            .pop_front()
            .unwrap_or(WaitStatus::Woken)
    }

    fn awaken_vcpu(&self, vm: VmId, vcpu: usize) {
        self.state().awakened.push((vm, vcpu));
    }

    fn set_fast_clock_rate(&self, hz: u32) {
        self.state().fast_clock_rates.push(hz);
    }

    fn log(&self, level: log::Level, message: &str) {
        std::eprintln!("{level}: {message}");
    }
}

/// The selector of the host TSS in the fake host GDT.
pub(crate) const HOST_TR: u16 = 0x40;

const HOST_GDT: [u64; 10] = [
    0,
    0x00cf_9a00_0000_ffff,
    0x00af_9b00_0000_ffff,
    0x00cf_9300_0000_ffff,
    0x00cf_fb00_0000_ffff,
    0x00cf_f300_0000_ffff,
    0x00af_fb00_0000_ffff,
    0,
    // Busy TSS.
    0x7100_8be7_b000_0067,
    0x0000_0000_ffff_f805,
];

const TSS_BUSY: u64 = 1 << 41;
const RFLAGS_IF: u64 = 1 << 9;
const DR7_GD: u64 = 1 << 13;

const MONITOR_IDT_BASE: u64 = 0xffff_ff00_0000_2000;
const SWITCH_IDT_BASE: u64 = 0xffff_f800_0000_3000;
const MONITOR_TR: u16 = 0x18;

/// The architectural state of the fake processor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct CpuState {
    pub(crate) rflags: u64,
    /// CR0, CR2, CR3, CR4.
    pub(crate) cr: [u64; 4],
    pub(crate) dr: [u64; 8],
    pub(crate) tsc: u64,
    pub(crate) gdtr: Dtr,
    pub(crate) idtr: Dtr,
    pub(crate) selectors: Selectors,
    pub(crate) ldt: u16,
    pub(crate) tr: u16,
    pub(crate) msrs: BTreeMap<u32, u64>,
    pub(crate) nmi_masked: bool,
    /// Exceptions the switch IDT would record.
    pub(crate) events: SwitchEvents,
}

/// One trip into the monitor.
pub(crate) enum Monitor {
    /// Return at once with no request.
    Return,
    /// Run the closure as the monitor. It sees the crosspage as the driver
    /// left it, including the reply to the last module call.
    Inspect(Box<dyn FnOnce(&mut CrossPage, &mut CpuState)>),
}

impl Monitor {
    pub(crate) fn user_call(call: u32, cross: bool) -> Self {
        Self::Inspect(Box::new(move |page, _| {
            page.user_call_type = call;
            page.user_call_cross = u32::from(cross);
        }))
    }

    pub(crate) fn module_call(call: ModuleCall, args: [u64; 4]) -> Self {
        Self::Inspect(Box::new(move |page, _| {
            page.set_module_call(call);
            page.args = args;
        }))
    }
}

pub(crate) struct FakeCpu {
    host_gdt: Box<UnsafeCell<[u64; HOST_GDT.len()]>>,
    monitor_gdt: Box<UnsafeCell<[u64; 4]>>,
    state: RefCell<CpuState>,
    script: RefCell<VecDeque<Monitor>>,
    entries: Cell<usize>,
    tr_loads_from_host_gdt: Cell<usize>,
    raised: RefCell<Vec<(u8, bool)>>,
    migrate_at_cli: RefCell<Option<(Arc<FakeHost>, usize)>>,
}

impl FakeCpu {
    pub(crate) fn new() -> Self {
        let host_gdt = Box::new(UnsafeCell::new(HOST_GDT));
        let gdtr = Dtr {
            limit: (HOST_GDT.len() * 8 - 1) as u16,
            base: host_gdt.get() as u64,
        };
        let mut dr = [0; 8];
        dr[6] = 0xffff_0ff0;
        dr[7] = 0x400;
        let state = CpuState {
            rflags: 0x246,
            cr: [0x8005_0033, 0, 0x001a_d000, 0x0035_06f8],
            dr,
            tsc: 0,
            gdtr,
            idtr: Dtr {
                limit: 0xfff,
                base: 0xffff_f800_0000_1000,
            },
            selectors: Selectors {
                cs: 0x10,
                ss: 0x18,
                ds: 0x2b,
                es: 0x2b,
                fs: 0x2b,
                gs: 0,
            },
            ldt: 0,
            tr: HOST_TR,
            msrs: BTreeMap::from([
                (IA32_FS_BASE, 0),
                (IA32_GS_BASE, 0xffff_f800_1234_0000),
                (IA32_KERNEL_GS_BASE, 0x0000_7ff6_0000_0000),
            ]),
            nmi_masked: false,
            events: SwitchEvents::default(),
        };
        Self {
            host_gdt,
            monitor_gdt: Box::new(UnsafeCell::new([0; 4])),
            state: RefCell::new(state),
            script: RefCell::new(VecDeque::new()),
            entries: Cell::new(0),
            tr_loads_from_host_gdt: Cell::new(0),
            raised: RefCell::new(Vec::new()),
            migrate_at_cli: RefCell::new(None),
        }
    }

    /// Queues trips into the monitor.
    pub(crate) fn script(&self, steps: impl IntoIterator<Item = Monitor>) {
        self.script.borrow_mut().extend(steps);
    }

    /// Moves the thread to processor `cpu` of `host` right before the next
    /// `disable_interrupts` takes effect.
    pub(crate) fn migrate_at_cli(&self, host: &Arc<FakeHost>, cpu: usize) {
        *self.migrate_at_cli.borrow_mut() = Some((host.clone(), cpu));
    }

    pub(crate) fn snapshot(&self) -> CpuState {
        self.state.borrow().clone()
    }

    /// The current contents of the host GDT.
    pub(crate) fn host_gdt(&self) -> Vec<u64> {
        // Safety: no reference into the GDT is live.
        unsafe { *self.host_gdt.get() }.to_vec()
    }

    pub(crate) fn monitor_entries(&self) -> usize {
        self.entries.get()
    }

    pub(crate) fn tr_loads_from_host_gdt(&self) -> usize {
        self.tr_loads_from_host_gdt.get()
    }

    pub(crate) fn nmi_sources_unmasked(&self) -> bool {
        !self.state.borrow().nmi_masked
    }

    /// Vectors raised so far, with whether interrupts were enabled.
    pub(crate) fn raised(&self) -> Vec<(u8, bool)> {
        self.raised.borrow().clone()
    }

    pub(crate) fn set_dr(&self, index: usize, value: u64) {
        self.state.borrow_mut().dr[index] = value;
    }

    pub(crate) fn dr(&self, index: usize) -> u64 {
        self.state.borrow().dr[index]
    }

    pub(crate) fn set_tsc(&self, value: u64) {
        self.state.borrow_mut().tsc = value;
    }

    fn cr_index(cr: ControlRegister) -> usize {
        match cr {
            ControlRegister::Cr0 => 0,
            ControlRegister::Cr2 => 1,
            ControlRegister::Cr3 => 2,
            ControlRegister::Cr4 => 3,
        }
    }
}

impl ArchSwitch for FakeCpu {
    fn mask_nmi_sources(&self) -> u32 {
        self.state.borrow_mut().nmi_masked = true;
        0b11
    }

    fn unmask_nmi_sources(&self, sources: u32) {
        assert_eq!(sources, 0b11);
        self.state.borrow_mut().nmi_masked = false;
    }

    fn disable_interrupts(&self) -> u64 {
        if let Some((host, cpu)) = self.migrate_at_cli.borrow_mut().take() {
            host.set_current_cpu(cpu);
        }
        let mut state = self.state.borrow_mut();
        let rflags = state.rflags;
        state.rflags &= !RFLAGS_IF;
        rflags
    }

    fn restore_flags(&self, rflags: u64) {
        self.state.borrow_mut().rflags = rflags;
    }

    fn read_cr(&self, cr: ControlRegister) -> u64 {
        self.state.borrow().cr[Self::cr_index(cr)]
    }

    fn write_cr(&self, cr: ControlRegister, value: u64) {
        self.state.borrow_mut().cr[Self::cr_index(cr)] = value;
    }

    fn read_tsc(&self) -> u64 {
        self.state.borrow().tsc
    }

    fn sidt(&self) -> Dtr {
        self.state.borrow().idtr
    }

    fn lidt(&self, idtr: &Dtr) {
        self.state.borrow_mut().idtr = *idtr;
    }

    fn switch_idtr(&self) -> Dtr {
        Dtr {
            limit: 0xfff,
            base: SWITCH_IDT_BASE,
        }
    }

    fn take_switch_events(&self) -> SwitchEvents {
        core::mem::take(&mut self.state.borrow_mut().events)
    }

    fn sgdt(&self) -> Dtr {
        self.state.borrow().gdtr
    }

    fn lgdt(&self, gdtr: &Dtr) {
        self.state.borrow_mut().gdtr = *gdtr;
    }

    fn read_dr(&self, index: usize) -> u64 {
        let mut state = self.state.borrow_mut();
        if state.dr[7] & DR7_GD != 0 {
            // The #DB handler clears GD before the access is retried.
            state.dr[7] &= !DR7_GD;
            state.events.debug_trap = true;
        }
        state.dr[index]
    }

    fn write_dr(&self, index: usize, value: u64) {
        self.state.borrow_mut().dr[index] = value;
    }

    fn selectors(&self) -> Selectors {
        self.state.borrow().selectors
    }

    fn load_data_selectors(&self, selectors: &Selectors) {
        let mut state = self.state.borrow_mut();
        state.selectors.ds = selectors.ds;
        state.selectors.es = selectors.es;
        state.selectors.fs = selectors.fs;
        state.selectors.gs = selectors.gs;
    }

    fn sldt(&self) -> u16 {
        self.state.borrow().ldt
    }

    fn lldt(&self, selector: u16) {
        self.state.borrow_mut().ldt = selector;
    }

    fn str(&self) -> u16 {
        self.state.borrow().tr
    }

    fn ltr(&self, selector: u16) {
        let mut state = self.state.borrow_mut();
        let gdtr = state.gdtr;
        let tss = TssDescriptor::try_from_gdtr(&gdtr, selector).unwrap();
        assert!(!tss.is_busy(), "#GP: loading busy TSS {selector:#x}");
        // Safety: `try_from_gdtr` checked the index against the limit.
        unsafe { segment::set_gdt_entry(&gdtr, tss.index, tss.low64_available() | TSS_BUSY) };
        if gdtr.base == self.host_gdt.get() as u64 {
            self.tr_loads_from_host_gdt
                .set(self.tr_loads_from_host_gdt.get() + 1);
        }
        state.tr = selector;
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        *self.state.borrow().msrs.get(&msr).expect("unknown MSR")
    }

    fn wrmsr(&self, msr: u32, value: u64) {
        let _ = self.state.borrow_mut().msrs.insert(msr, value);
    }

    fn raise_interrupt(&self, vector: u8) {
        let enabled = self.state.borrow().rflags & RFLAGS_IF != 0;
        self.raised.borrow_mut().push((vector, enabled));
    }

    unsafe fn enter_monitor(&self, cross_page: *mut CrossPage) {
        self.entries.set(self.entries.get() + 1);
        let step = self
            .script
            .borrow_mut()
            .pop_front()
            .expect("monitor entered with no script left");

        // Safety: the caller keeps the crosspage mapped for the call.
        let page = unsafe { &mut *cross_page };

        let mut state = self.state.borrow_mut();
        state.gdtr = Dtr {
            limit: 4 * 8 - 1,
            base: self.monitor_gdt.get() as u64,
        };
        state.idtr = Dtr {
            limit: 0xfff,
            base: MONITOR_IDT_BASE,
        };
        state.selectors.ds = 0;
        state.selectors.es = 0;
        state.selectors.fs = 0;
        state.selectors.gs = 0;
        state.tr = MONITOR_TR;
        state.cr[1] = 0xffff_ffff_dead_0000;
        for msr in [IA32_FS_BASE, IA32_GS_BASE, IA32_KERNEL_GS_BASE] {
            let _ = state.msrs.insert(msr, 0);
        }

        match step {
            Monitor::Return => page.set_module_call(ModuleCall::None),
            Monitor::Inspect(monitor) => monitor(page, &mut *state),
        }
    }
}
