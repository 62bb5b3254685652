//! Lifecycle of VMs: creation, initialization and release.

use alloc::{sync::Arc, vec::Vec};

use super::{
    Vmmon,
    cross_page::{CROSS_PAGE_VERSION, CrossPageMapping},
    host_ops::HostError,
    types::{UserVa, VmId},
    vm::{VmDriver, VmPages},
};

/// Magic value the VMX passes at VM initialization.
pub const INIT_BLOCK_MAGIC: u32 = 0x1789 + 14;

/// Parameters of [`Vmmon::init_vm`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InitBlock {
    pub magic: u32,
    pub num_vcpus: usize,
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    #[error("all {0} VM slots are in use")]
    VmTableFull(usize),

    #[error("bad init block magic {0:#x}")]
    BadMagic(u32),

    #[error("{requested} VCPUs requested, 1 to {max} supported")]
    BadVcpuCount { requested: usize, max: usize },

    #[error("the VM is already initialized")]
    AlreadyInitialized,

    #[error("the VM is not initialized")]
    NotInitialized,

    #[error("{given} crosspages given for {expected} VCPUs")]
    CrossPageCount { given: usize, expected: usize },

    #[error("crosspage at {va} could not be mapped")]
    CrossPageMap { va: UserVa, source: HostError },

    #[error("crosspage version {version:#x} size {size}, expected version {:#x}", CROSS_PAGE_VERSION)]
    CrossPageVersion { version: u32, size: u32 },

    #[error("VCPU {0} does not exist")]
    NoSuchVcpu(usize),
}

impl Vmmon {
    /// Creates a VM with the lowest free ID and registers it.
    pub fn create_vm(&self) -> Result<Arc<VmDriver>, VmError> {
        let mut global = self.lock_global();
        let max = self.config.max_vms;
        if global.vms.len() >= max {
            log::warn!("VM table full");
            return Err(VmError::VmTableFull(max));
        }

        let id = (1..=max as u32)
            .map(VmId)
            .find(|id| global.vms.iter().all(|vm| vm.user_id() != *id))
            .ok_or(VmError::VmTableFull(max))?;
        let shared = self
            .config
            .shared_page_tracking
            .then_some(&self.shared_tracker);
        let vm = Arc::new(VmDriver::new(id, shared));
        global.vms.push(vm.clone());
        log::info!("VM {id} created, {} registered", global.vms.len());
        Ok(vm)
    }

    pub fn vm_by_id(&self, id: VmId) -> Option<Arc<VmDriver>> {
        self.lock_global()
            .vms
            .iter()
            .find(|vm| vm.user_id() == id)
            .cloned()
    }

    /// Validates the init block and creates the VCPU slots.
    pub fn init_vm(&self, vm: &VmDriver, block: &InitBlock) -> Result<(), VmError> {
        if block.magic != INIT_BLOCK_MAGIC {
            return Err(VmError::BadMagic(block.magic));
        }
        let max = self.config.max_vcpus;
        if block.num_vcpus == 0 || block.num_vcpus > max {
            return Err(VmError::BadVcpuCount {
                requested: block.num_vcpus,
                max,
            });
        }
        if !vm.init_vcpus(block.num_vcpus) {
            return Err(VmError::AlreadyInitialized);
        }
        log::info!("VM {} initialized with {} VCPUs", vm.user_id(), block.num_vcpus);
        Ok(())
    }

    /// Pins, maps and checks the crosspage of every VCPU, `vas[i]` being the
    /// one of VCPU `i`. On failure, no crosspage of this call stays mapped.
    pub fn init_cross_pages(&self, vm: &VmDriver, vas: &[UserVa]) -> Result<(), VmError> {
        let expected = vm.num_vcpus();
        if expected == 0 {
            return Err(VmError::NotInitialized);
        }
        if vas.len() != expected {
            return Err(VmError::CrossPageCount {
                given: vas.len(),
                expected,
            });
        }

        let mut mappings = Vec::with_capacity(vas.len());
        for &va in vas {
            match self.map_cross_page(va) {
                Ok(mapping) => mappings.push(mapping),
                Err(err) => {
                    log::error!("VM {}: {err}", vm.user_id());
                    self.unmap_cross_pages(mappings);
                    return Err(err);
                }
            }
        }

        let mut slots: Vec<_> = vm.vcpus().iter().map(|vcpu| vcpu.cross_page.lock()).collect();
        if slots.iter().any(|slot| slot.is_some()) {
            drop(slots);
            self.unmap_cross_pages(mappings);
            return Err(VmError::AlreadyInitialized);
        }
        for (slot, mapping) in slots.iter_mut().zip(mappings) {
            **slot = Some(mapping);
        }
        Ok(())
    }

    fn map_cross_page(&self, va: UserVa) -> Result<CrossPageMapping, VmError> {
        let page = self
            .host
            .map_user_page(va)
            .map_err(|source| VmError::CrossPageMap { va, source })?;
        let mut mapping = CrossPageMapping { page, va };
        let cross_page = mapping.get();
        if !cross_page.has_valid_header() {
            let err = VmError::CrossPageVersion {
                version: cross_page.version,
                size: cross_page.size,
            };
            self.host.unmap_user_page(mapping.page);
            return Err(err);
        }
        Ok(mapping)
    }

    fn unmap_cross_pages(&self, mappings: Vec<CrossPageMapping>) {
        for mapping in mappings {
            self.host.unmap_user_page(mapping.page);
        }
    }

    /// Unregisters `vm` and frees everything it holds. Its VCPUs must not be
    /// running.
    pub fn release_vm(&self, vm: Arc<VmDriver>) {
        {
            let mut global = self.lock_global();
            let Some(position) = global.vms.iter().position(|other| Arc::ptr_eq(other, &vm)) else {
                log::warn!("VM {} released twice", vm.user_id());
                return;
            };
            drop(global.vms.remove(position));

            let locked = vm.lock().mem_info.locked;
            assert!(
                global.num_locked_pages >= locked,
                "VM {} accounts {locked} locked pages, {} systemwide",
                vm.user_id(),
                global.num_locked_pages
            );
            global.num_locked_pages -= locked;
            self.update_fast_clock(&mut global);
        }

        let (locked, anon) = self.free_vm_pages(&vm);
        let mut unmapped = 0;
        for vcpu in vm.vcpus() {
            if let Some(mapping) = vcpu.cross_page.lock().take() {
                log::debug!("VM {}: unmapping crosspage at {}", vm.user_id(), mapping.va);
                self.host.unmap_user_page(mapping.page);
                unmapped += 1;
            }
        }
        log::info!(
            "VM {} released: {locked} locked pages, {anon} anonymous pages, {unmapped} crosspages",
            vm.user_id()
        );
    }

    /// Unpins every locked page and frees every anonymous page of an
    /// unregistered VM, then releases its trackers. The host is only called
    /// once the VM lock is dropped.
    fn free_vm_pages(&self, vm: &VmDriver) -> (usize, usize) {
        let shared = &self.shared_tracker;
        let (locked, anon) = {
            let mut state = vm.lock();
            let pages = &mut state.pages;
            let locked = pages.drain_locked(shared);
            let anon: Vec<_> = pages.anon.iter().collect();
            for &mpn in &anon {
                pages.anon.remove(mpn);
            }
            let released = core::mem::replace(pages, VmPages::empty());
            released.cleanup(shared);
            state.mem_info.locked = 0;
            (locked, anon)
        };

        for &mpn in &locked {
            self.host.unpin_user_page(mpn);
        }
        for &mpn in &anon {
            self.host.free_anon_page(mpn);
        }
        (locked.len(), anon.len())
    }
}
