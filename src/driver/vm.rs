//! The per VM instance state.

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard, Once};

use super::{
    cross_page::{CrossPageMapping, USERCALL_NONE},
    phys_track::{PhysTracker, SharedPhysTracker},
    types::{Mpn, UserVa, VmId},
};

/// Memory sizes of a VM, in pages, as used by admission control.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmMemInfo {
    /// Guest memory plus overhead the host may page out.
    pub paged: u64,
    /// Overhead that must stay resident.
    pub nonpaged: u64,
    /// Guest RAM size.
    pub main_mem_size: u64,
    /// Pages currently locked on behalf of the VM.
    pub locked: u64,
    pub min_allocation: u64,
    pub max_allocation: u64,
    /// Whether the VM passed admission and may grow `locked`.
    pub admitted: bool,
}

/// Pages locked or allocated on behalf of a VM.
#[derive(Debug)]
pub(crate) struct VmPages {
    /// User pages this VM locked.
    locked: PhysTracker,
    /// Whether `locked` is mirrored into the shared tracker, which then
    /// refuses pages locked by any VM.
    shared: bool,
    /// Anonymous pages allocated by the driver and handed to the monitor.
    pub(crate) anon: PhysTracker,
    /// VPN to MPN of pages locked by VA. Not used for pages locked with
    /// multiple MPNs per VA allowed.
    pub(crate) va_to_mpn: BTreeMap<u64, Mpn>,
}

impl VmPages {
    fn new(shared: Option<&SharedPhysTracker>) -> Self {
        if let Some(shared) = shared {
            shared.init_shared();
        }
        Self {
            shared: shared.is_some(),
            ..Self::empty()
        }
    }

    /// Trackers that own no memory, left behind in a released VM.
    pub(crate) fn empty() -> Self {
        Self {
            locked: PhysTracker::new(),
            shared: false,
            anon: PhysTracker::new(),
            va_to_mpn: BTreeMap::new(),
        }
    }

    /// Whether this VM locked `mpn`.
    pub(crate) fn is_locked(&self, mpn: Mpn) -> bool {
        self.locked.test(mpn)
    }

    /// Whether `va` is recorded as locked by address.
    pub(crate) fn is_va_locked(&self, va: UserVa) -> bool {
        self.va_to_mpn.get(&va.vpn()).is_some_and(|mpn| mpn.is_valid())
    }

    /// Whether `mpn` cannot be locked again, that is, whether this VM or,
    /// with shared tracking, any VM locked it.
    pub(crate) fn is_lock_taken(&self, shared: &SharedPhysTracker, mpn: Mpn) -> bool {
        if self.shared {
            shared.with(|tracker| tracker.test(mpn))
        } else {
            self.locked.test(mpn)
        }
    }

    pub(crate) fn add_locked(&mut self, shared: &SharedPhysTracker, mpn: Mpn) {
        self.locked.add(mpn);
        if self.shared {
            shared.with(|tracker| tracker.add(mpn));
        }
    }

    pub(crate) fn remove_locked(&mut self, shared: &SharedPhysTracker, mpn: Mpn) {
        self.locked.remove(mpn);
        if self.shared {
            shared.with(|tracker| tracker.remove(mpn));
        }
    }

    /// Stops tracking every locked page and returns them.
    pub(crate) fn drain_locked(&mut self, shared: &SharedPhysTracker) -> Vec<Mpn> {
        let mpns: Vec<_> = self.locked.iter().collect();
        for &mpn in &mpns {
            self.remove_locked(shared, mpn);
        }
        self.va_to_mpn.clear();
        mpns
    }

    /// Releases the trackers. Panics if any page is still tracked.
    pub(crate) fn cleanup(self, shared: &SharedPhysTracker) {
        self.locked.cleanup();
        if self.shared {
            shared.cleanup();
        }
        self.anon.cleanup();
    }
}

/// State protected by the per VM lock.
#[derive(Debug)]
pub(crate) struct VmState {
    pub(crate) mem_info: VmMemInfo,
    pub(crate) pages: VmPages,
    pub(crate) fast_clock_hz: u32,
}

pub(crate) const NO_HOST_CPU: usize = usize::MAX;

/// A VCPU slot.
#[derive(Debug)]
pub(crate) struct Vcpu {
    pub(crate) cross_page: Mutex<Option<CrossPageMapping>>,
    /// The processor this VCPU is in the monitor on, or `NO_HOST_CPU`.
    pub(crate) current_host_cpu: AtomicUsize,
    /// Cross user call waiting for the main thread, or `USERCALL_NONE`.
    pub(crate) pending_user_call: AtomicU32,
}

impl Vcpu {
    fn new() -> Self {
        Self {
            cross_page: Mutex::new(None),
            current_host_cpu: AtomicUsize::new(NO_HOST_CPU),
            pending_user_call: AtomicU32::new(USERCALL_NONE),
        }
    }

    pub(crate) fn host_cpu(&self) -> Option<usize> {
        match self.current_host_cpu.load(Ordering::Acquire) {
            NO_HOST_CPU => None,
            cpu => Some(cpu),
        }
    }
}

/// One virtual machine instance.
#[derive(Debug)]
pub struct VmDriver {
    user_id: VmId,
    state: Mutex<VmState>,
    vcpus: Once<Box<[Vcpu]>>,
}

impl VmDriver {
    pub(crate) fn new(user_id: VmId, shared: Option<&SharedPhysTracker>) -> Self {
        Self {
            user_id,
            state: Mutex::new(VmState {
                mem_info: VmMemInfo::default(),
                pages: VmPages::new(shared),
                fast_clock_hz: 0,
            }),
            vcpus: Once::new(),
        }
    }

    pub fn user_id(&self) -> VmId {
        self.user_id
    }

    /// Number of VCPUs, zero until the VM is initialized.
    pub fn num_vcpus(&self) -> usize {
        self.vcpus.get().map_or(0, |vcpus| vcpus.len())
    }

    /// A snapshot of the memory information of the VM.
    pub fn mem_info(&self) -> VmMemInfo {
        self.lock().mem_info
    }

    /// Acquires the per VM lock. Callers that also need the global lock must
    /// take it first.
    pub(crate) fn lock(&self) -> MutexGuard<'_, VmState> {
        self.state.lock()
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// Creates the VCPU slots. Returns `false` if they already exist.
    pub(crate) fn init_vcpus(&self, count: usize) -> bool {
        let mut created = false;
        let _ = self.vcpus.call_once(|| {
            created = true;
            (0..count).map(|_| Vcpu::new()).collect()
        });
        created
    }

    pub(crate) fn vcpus(&self) -> &[Vcpu] {
        self.vcpus.get().map_or(&[] as &[Vcpu], |vcpus| &**vcpus)
    }

    pub(crate) fn vcpu(&self, index: usize) -> Option<&Vcpu> {
        self.vcpus().get(index)
    }
}
