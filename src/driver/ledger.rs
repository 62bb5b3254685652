//! Accounting of locked pages against the systemwide and per VM limits, and
//! admission control.
//!
//! The systemwide count of locked pages and the per VM counts only change
//! together, with both the global lock and the VM's lock held, so that the
//! systemwide count always equals the sum over registered VMs.

use alloc::{sync::Arc, vec::Vec};

use super::{
    Vmmon,
    config::DriverConfig,
    types::{Mpn, VmId},
    vm::{VmDriver, VmMemInfo},
};

/// The three independently set ceilings on locked pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LockedPageLimit {
    /// The host estimate at the last computation.
    pub host: u64,
    /// Set by the user, never lowered.
    pub configured: u64,
    /// Set by the memory management daemon.
    pub dynamic: u64,
}

/// State protected by the global lock.
#[derive(Debug)]
pub(crate) struct GlobalState {
    pub(crate) vms: Vec<Arc<VmDriver>>,
    pub(crate) limits: LockedPageLimit,
    pub(crate) num_locked_pages: u64,
    pub(crate) min_vm_mem_pct: u32,
    pub(crate) fast_clock_hz: u32,
}

impl GlobalState {
    pub(crate) fn new(config: &DriverConfig) -> Self {
        Self {
            vms: Vec::new(),
            limits: LockedPageLimit {
                host: 0,
                configured: config.initial_configured_limit,
                dynamic: config.initial_dynamic_limit,
            },
            num_locked_pages: 0,
            min_vm_mem_pct: 0,
            fast_clock_hz: 0,
        }
    }

    /// `min(configured, dynamic, host)` less the per VM overhead, with
    /// `host_estimate` as the new host ceiling.
    fn locked_page_limit(&mut self, host_estimate: u64, per_vm_overhead: u64) -> u64 {
        self.limits.host = host_estimate;
        let overall = self
            .limits
            .configured
            .min(self.limits.dynamic)
            .min(self.limits.host);
        let overhead = (self.vms.len() as u64).saturating_mul(per_vm_overhead);
        overall.saturating_sub(overhead)
    }

    /// Sum of the minimum allocations of admitted VMs, except `exclude`.
    ///
    /// Takes the lock of every other VM, so the caller must not hold any
    /// VM lock but the one of `exclude`.
    fn min_allocation_sum(&self, pct: u32, exclude: Option<&VmDriver>) -> u64 {
        self.vms
            .iter()
            .filter(|vm| exclude.is_none_or(|exclude| !core::ptr::eq(&***vm, exclude)))
            .map(|vm| vm.lock().mem_info)
            .filter(|info| info.admitted)
            .map(|info| min_allocation(info.main_mem_size, info.nonpaged, pct))
            .fold(0, u64::saturating_add)
    }
}

/// `pct` percent of guest RAM plus the nonpaged overhead.
fn min_allocation(main_mem_size: u64, nonpaged: u64, pct: u32) -> u64 {
    let ram = u128::from(main_mem_size) * u128::from(pct) / 100;
    u64::try_from(ram).unwrap_or(u64::MAX).saturating_add(nonpaged)
}

/// Per VM half of the reservation check. VMs that were not admitted are only
/// bound by the global limit.
fn per_vm_has_room(info: &VmMemInfo, pages: u64) -> bool {
    !info.admitted
        || info
            .locked
            .checked_add(pages)
            .is_some_and(|total| total <= info.max_allocation)
}

/// Sizes requested at admission, in pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AdmitRequest {
    pub paged: u64,
    pub nonpaged: u64,
    pub main_mem_size: u64,
    /// Systemwide percentage of guest RAM each VM must be able to lock.
    pub min_vm_mem_pct: u32,
}

/// Signed changes to the sizes of an admitted VM, in pages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemDelta {
    pub paged: i64,
    pub nonpaged: i64,
}

/// Systemwide accounting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalMemInfo {
    pub min_vm_mem_pct: u32,
    pub num_locked_pages: u64,
    /// The effective locked page limit.
    pub max_locked_pages: u64,
    pub limits: LockedPageLimit,
    pub global_min_allocation: u64,
    pub num_vms: usize,
}

/// Systemwide accounting with the information of every VM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemInfoSnapshot {
    pub global: GlobalMemInfo,
    pub vms: Vec<(VmId, VmMemInfo)>,
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemInfoError {
    #[error("room for {capacity} VMs, {needed} registered")]
    BufferTooSmall { capacity: usize, needed: usize },
}

impl Vmmon {
    /// The effective systemwide limit on locked pages.
    pub fn effective_locked_page_limit(&self) -> u64 {
        let estimate = self.host.lockable_page_estimate();
        let mut global = self.lock_global();
        self.limit(&mut global, estimate)
    }

    /// The host estimate can sleep, so callers sample it before taking the
    /// global lock.
    fn limit(&self, global: &mut GlobalState, host_estimate: u64) -> u64 {
        global.locked_page_limit(host_estimate, self.config.per_vm_overhead_pages)
    }

    /// Returns whether `pages` more pages may be locked for `vm`: against the
    /// VM's own limit if `check_per_vm`, otherwise against the global one.
    pub fn has_free_pages(&self, vm: &VmDriver, pages: u64, check_per_vm: bool) -> bool {
        if check_per_vm {
            return per_vm_has_room(&vm.lock().mem_info, pages);
        }
        let estimate = self.host.lockable_page_estimate();
        let mut global = self.lock_global();
        self.global_has_room(&mut global, estimate, pages)
    }

    /// The limit may have been lowered below the current count.
    fn global_has_room(&self, global: &mut GlobalState, host_estimate: u64, pages: u64) -> bool {
        let limit = self.limit(global, host_estimate);
        global.num_locked_pages <= limit && limit - global.num_locked_pages >= pages
    }

    /// Accounts `pages` to be locked for `vm`. Fails at once if the VM is at
    /// its own limit, and after a few bounded waits if the system is at the
    /// global limit.
    pub fn reserve_free_pages(&self, vm: &VmDriver, pages: u64) -> bool {
        let retries = self.config.reserve_retries;
        for attempt in 1..=retries {
            {
                let estimate = self.host.lockable_page_estimate();
                let mut global = self.lock_global();
                let mut state = vm.lock();
                if !per_vm_has_room(&state.mem_info, pages) {
                    log::debug!(
                        "VM {} over its own limit: {} + {pages} locked pages",
                        vm.user_id(),
                        state.mem_info.locked
                    );
                    return false;
                }
                if self.global_has_room(&mut global, estimate, pages) {
                    global.num_locked_pages += pages;
                    state.mem_info.locked += pages;
                    return true;
                }
            }

            log::debug!("Global locked page limit hit, attempt {attempt}/{retries}");
            if attempt < retries {
                self.host.sleep_ms(self.config.reserve_wait_ms);
            }
        }
        false
    }

    /// Returns a reservation made by [`Self::reserve_free_pages`].
    ///
    /// # Panics
    ///
    /// Panics if more pages are returned than are accounted.
    pub fn unreserve_free_pages(&self, vm: &VmDriver, pages: u64) {
        let mut global = self.lock_global();
        let mut state = vm.lock();
        assert!(
            global.num_locked_pages >= pages,
            "unreserving {pages} pages with {} locked systemwide",
            global.num_locked_pages
        );
        assert!(
            state.mem_info.locked >= pages,
            "unreserving {pages} pages with {} locked by VM {}",
            state.mem_info.locked,
            vm.user_id()
        );
        global.num_locked_pages -= pages;
        state.mem_info.locked -= pages;
    }

    /// Records the sizes of `vm` and decides whether it is admitted, that is,
    /// whether its minimum allocation fits next to those of every other
    /// admitted VM. A VM that is not admitted still runs but is only bound
    /// by the global limit.
    pub fn admit(&self, vm: &VmDriver, request: AdmitRequest) -> (VmMemInfo, GlobalMemInfo) {
        let nonpaged_ok = !self.config.verify_nonpaged_allocation
            || self.try_nonpaged_allocation(request.nonpaged);

        let estimate = self.host.lockable_page_estimate();
        let mut global = self.lock_global();
        global.min_vm_mem_pct = request.min_vm_mem_pct;
        let pct = request.min_vm_mem_pct;
        let others = global.min_allocation_sum(pct, Some(vm));
        let limit = self.limit(&mut global, estimate);

        let info = {
            let mut state = vm.lock();
            let info = &mut state.mem_info;
            info.paged = request.paged;
            info.nonpaged = request.nonpaged;
            info.main_mem_size = request.main_mem_size;
            info.min_allocation = min_allocation(request.main_mem_size, request.nonpaged, pct);
            info.max_allocation = request.paged.saturating_add(request.nonpaged);
            info.admitted = nonpaged_ok
                && request.main_mem_size <= request.paged
                && others.saturating_add(info.min_allocation) <= limit;
            *info
        };

        if info.admitted {
            log::info!(
                "VM {} admitted: min {} max {} pages",
                vm.user_id(),
                info.min_allocation,
                info.max_allocation
            );
        } else {
            log::warn!(
                "VM {} not admitted: min {} pages, {others} committed, limit {limit}",
                vm.user_id(),
                info.min_allocation
            );
        }
        (info, self.global_mem_info(&mut global, estimate))
    }

    /// Proves that `pages` anonymous pages can be allocated right now.
    fn try_nonpaged_allocation(&self, pages: u64) -> bool {
        let mut allocated: Vec<Mpn> = Vec::new();
        let ok = (0..pages).all(|_| {
            self.host
                .alloc_anon_page()
                .map(|mpn| allocated.push(mpn))
                .is_some()
        });
        for mpn in allocated {
            self.host.free_anon_page(mpn);
        }
        if !ok {
            log::warn!("Could not allocate {pages} nonpaged pages");
        }
        ok
    }

    /// Applies a change in size to `vm`. Shrinking always succeeds. Growing
    /// fails, and revokes the admission of the VM, if the new minimum
    /// allocation no longer fits.
    pub fn readmit(&self, vm: &VmDriver, delta: MemDelta) -> bool {
        let estimate = self.host.lockable_page_estimate();
        let mut global = self.lock_global();
        let pct = global.min_vm_mem_pct;
        let others = global.min_allocation_sum(pct, Some(vm));
        let limit = self.limit(&mut global, estimate);

        let mut state = vm.lock();
        let info = &mut state.mem_info;
        let paged = info.paged.saturating_add_signed(delta.paged);
        let nonpaged = info.nonpaged.saturating_add_signed(delta.nonpaged);
        let new_min = min_allocation(info.main_mem_size, nonpaged, pct);

        let growing = delta.paged > 0 || delta.nonpaged > 0;
        if growing && others.saturating_add(new_min) > limit {
            info.admitted = false;
            log::warn!(
                "VM {} readmission failed: min {new_min} pages, {others} committed, limit {limit}",
                vm.user_id()
            );
            return false;
        }

        info.paged = paged;
        info.nonpaged = nonpaged;
        info.min_allocation = new_min;
        info.max_allocation = paged.saturating_add(nonpaged);
        true
    }

    /// Returns the systemwide accounting and that of every VM, if `capacity`
    /// VM entries are enough for all registered VMs.
    pub fn get_mem_info(&self, capacity: usize) -> Result<MemInfoSnapshot, MemInfoError> {
        let estimate = self.host.lockable_page_estimate();
        let mut global = self.lock_global();
        let needed = global.vms.len();
        if needed > capacity {
            return Err(MemInfoError::BufferTooSmall { capacity, needed });
        }

        let vms = global
            .vms
            .iter()
            .map(|vm| (vm.user_id(), vm.lock().mem_info))
            .collect();
        Ok(MemInfoSnapshot {
            global: self.global_mem_info(&mut global, estimate),
            vms,
        })
    }

    fn global_mem_info(&self, global: &mut GlobalState, host_estimate: u64) -> GlobalMemInfo {
        GlobalMemInfo {
            max_locked_pages: self.limit(global, host_estimate),
            min_vm_mem_pct: global.min_vm_mem_pct,
            num_locked_pages: global.num_locked_pages,
            limits: global.limits,
            global_min_allocation: global.min_allocation_sum(global.min_vm_mem_pct, None),
            num_vms: global.vms.len(),
        }
    }

    /// Raises the user configured limit. Lowering it is refused.
    pub fn set_configured_locked_pages_limit(&self, limit: u64) -> bool {
        let mut global = self.lock_global();
        if limit < global.limits.configured {
            log::warn!(
                "Refusing to lower the configured limit from {} to {limit}",
                global.limits.configured
            );
            return false;
        }
        global.limits.configured = limit;
        true
    }

    pub fn set_dynamic_locked_pages_limit(&self, limit: u64) {
        self.lock_global().limits.dynamic = limit;
    }

    pub fn locked_page_limits(&self) -> LockedPageLimit {
        self.lock_global().limits
    }
}
