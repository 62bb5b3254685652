//! Per processor VMCS pages used by VCPUs that run in VMX root operation.
//!
//! Each slot is published once, without a lock: whichever thread swaps its
//! page in first wins and the others free theirs.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

use super::{
    host_ops::HostOps,
    types::{INVALID_MPN, Mpn},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsKind {
    /// The VMCS of the host while it runs in VMX root operation.
    Root,
    /// The VMCS made current while entering VMX operation.
    Dummy,
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsAllocError {
    #[error("no page for the {kind:?} VMCS of processor {cpu}")]
    NoPage { kind: VmcsKind, cpu: usize },

    #[error("processor {0} does not exist")]
    NoSuchCpu(usize),
}

#[derive(Debug)]
pub(crate) struct VmcsPages {
    root: Box<[AtomicU64]>,
    dummy: Box<[AtomicU64]>,
}

impl VmcsPages {
    pub(crate) fn new(cpu_count: usize) -> Self {
        let slots = || (0..cpu_count).map(|_| AtomicU64::new(INVALID_MPN.0)).collect();
        Self {
            root: slots(),
            dummy: slots(),
        }
    }

    fn slot(&self, kind: VmcsKind, cpu: usize) -> Option<&AtomicU64> {
        match kind {
            VmcsKind::Root => self.root.get(cpu),
            VmcsKind::Dummy => self.dummy.get(cpu),
        }
    }

    pub(crate) fn get(&self, kind: VmcsKind, cpu: usize) -> Option<Mpn> {
        self.slot(kind, cpu)
            .map(|slot| Mpn(slot.load(Ordering::Acquire)))
            .filter(|mpn| mpn.is_valid())
    }

    /// Returns the page of the slot, allocating it if it is empty.
    pub(crate) fn provision(
        &self,
        kind: VmcsKind,
        cpu: usize,
        host: &dyn HostOps,
    ) -> Result<Mpn, VmcsAllocError> {
        let slot = self.slot(kind, cpu).ok_or(VmcsAllocError::NoSuchCpu(cpu))?;
        let current = Mpn(slot.load(Ordering::Acquire));
        if current.is_valid() {
            return Ok(current);
        }

        let mpn = host
            .alloc_anon_page()
            .ok_or(VmcsAllocError::NoPage { kind, cpu })?;
        match slot.compare_exchange(INVALID_MPN.0, mpn.0, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                log::debug!("{kind:?} VMCS of processor {cpu} is MPN {mpn}");
                Ok(mpn)
            }
            Err(winner) => {
                host.free_anon_page(mpn);
                Ok(Mpn(winner))
            }
        }
    }

    /// Frees every published page.
    pub(crate) fn teardown(&self, host: &dyn HostOps) {
        for slot in self.root.iter().chain(self.dummy.iter()) {
            let mpn = Mpn(slot.swap(INVALID_MPN.0, Ordering::AcqRel));
            if mpn.is_valid() {
                host.free_anon_page(mpn);
            }
        }
    }
}
