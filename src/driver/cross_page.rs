//! The page shared between the driver and the monitor for one VCPU.
//!
//! The VMX allocates the page, writes the version, size and the monitor
//! entry context into it, and passes its address at VM initialization. The
//! driver pins it for the life of the VM. On every world switch the driver
//! saves the host state into it, and the monitor leaves its requests there.

use core::{mem::size_of, ptr::NonNull};

use super::{
    host_ops::PinnedPage,
    pseudo_tsc::PseudoTscParams,
    types::{PAGE_SIZE, UserVa},
};

/// Layout version of [`CrossPage`]. Must match the monitor exactly.
pub const CROSS_PAGE_VERSION: u32 = (3 << 16) | 17;

pub const MODULECALL_NUM_ARGS: usize = 4;

/// `user_call_type` value when the monitor requests nothing from userspace.
pub const USERCALL_NONE: u32 = 0;

/// Requests the monitor leaves for the driver in `module_call_type`, and the
/// replies the driver leaves for the monitor in the same field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive)]
#[repr(u32)]
pub enum ModuleCall {
    None = 0,
    /// A host interrupt arrived while in the monitor; `intr_vector` holds it.
    Intr = 1,
    SemaWait = 2,
    SemaSignal = 3,
    SemaForceWakeup = 4,
    Ipi = 5,
    GetRecycledPage = 6,
    ReleaseAnonPages = 7,
    IsAnonPage = 8,
    SwitchToPeer = 9,
    StartVmxOp = 10,
    AllocVmxPage = 11,
    /// Driver to monitor: the cross user call was not serviced in time.
    UserTimeout = 12,
}

/// A descriptor table register image.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct Dtr {
    pub limit: u16,
    pub base: u64,
}

impl Dtr {
    /// Number of 8-byte entries covered by the limit.
    pub fn entries(&self) -> usize {
        (usize::from(self.limit) + 1) / 8
    }
}

/// Host state saved by the world switch.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct HostContext {
    pub rsp: u64,
    pub rip: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub rflags: u64,
    pub gdtr: Dtr,
    pub idtr: Dtr,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldt: u16,
    pub tr: u16,
    pub fs_base: u64,
    pub gs_base: u64,
    pub kernel_gs_base: u64,
    /// DR0-DR7; DR4 and DR5 are unused.
    pub dr: [u64; 8],
    /// Bit N set if DRN was saved and must be restored.
    pub dr_saved: u8,
    /// Non-zero if the host debug registers were left untouched.
    pub dr_preserved: u8,
    /// Local APIC NMI sources masked for the duration of the switch.
    pub nmi_sources: u32,
}

/// Where the world switch transfers control to.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct MonitorContext {
    pub cr3: u64,
    pub rsp: u64,
    pub rip: u64,
}

// Lives in the pinned page shared with the VMX process.
#[allow(missing_copy_implementations)]
#[derive(Debug)]
#[repr(C, align(4096))]
pub struct CrossPage {
    pub version: u32,
    pub size: u32,
    pub user_call_type: u32,
    /// Non-zero if the user call must be serviced by the main VMX thread.
    pub user_call_cross: u32,
    pub module_call_type: u32,
    /// Non-zero if an NMI or machine check hit the switch window and the
    /// switch must be repeated.
    pub retry_world_switch: u32,
    pub args: [u64; MODULECALL_NUM_ARGS],
    pub retval: u64,
    /// Non-zero if the VCPU runs in VMX root operation.
    pub needs_vmx_root: u32,
    pub intr_vector: u32,
    pub root_vmcs_mpn: u64,
    /// Which of the 32/64-bit monitor peers is active.
    pub run_peer: u32,
    pub pseudo_tsc: PseudoTscParams,
    pub host: HostContext,
    pub monitor: MonitorContext,
}
const _: () = assert!(size_of::<CrossPage>() == PAGE_SIZE);

impl CrossPage {
    /// Returns the module call left by the monitor, or `Err` with the raw
    /// value if it is not one the driver knows.
    pub fn module_call(&self) -> Result<ModuleCall, u32> {
        <ModuleCall as num_traits::FromPrimitive>::from_u32(self.module_call_type)
            .ok_or(self.module_call_type)
    }

    pub fn set_module_call(&mut self, call: ModuleCall) {
        self.module_call_type = call as u32;
    }

    pub(crate) fn has_valid_header(&self) -> bool {
        self.version == CROSS_PAGE_VERSION && self.size as usize == size_of::<Self>()
    }
}

/// A pinned crosspage, owned by one (VM, VCPU) pair until release.
#[derive(Debug)]
pub(crate) struct CrossPageMapping {
    pub(crate) page: PinnedPage,
    pub(crate) va: UserVa,
}

impl CrossPageMapping {
    pub(crate) fn get(&mut self) -> &mut CrossPage {
        let ptr: NonNull<CrossPage> = self.page.kernel_va.cast();
        // Safety: the page is pinned, mapped and page aligned for as long as
        // the mapping lives, and only the thread running the VCPU touches it.
        unsafe { &mut *ptr.as_ptr() }
    }

    pub(crate) fn raw(&mut self) -> *mut CrossPage {
        self.page.kernel_va.cast().as_ptr()
    }
}
