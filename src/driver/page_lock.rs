//! Locking of user pages and allocation of anonymous pages on behalf of a VM.
//!
//! Every page counted here is first reserved against the ledger, and the
//! reservation is returned on every failure path and when the page is
//! unlocked or freed.

use alloc::{collections::BTreeSet, vec, vec::Vec};

use super::{
    Vmmon,
    host_ops::HostError,
    phys_track::PHYSTRACK_MAX_MPN,
    types::{INVALID_MPN, Mpn, UserVa},
    vm::VmDriver,
};

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageLockError {
    #[error("the locked page limit is reached")]
    LimitExceeded,

    #[error("the page is already locked")]
    AlreadyLocked,

    #[error("the user page could not be touched")]
    TouchFailed,

    #[error("the host is out of memory")]
    NoMemory,

    #[error("the host refused to pin the page")]
    HostRefused,

    #[error("MPN {0} cannot be tracked")]
    Untrackable(Mpn),
}

impl From<HostError> for PageLockError {
    fn from(value: HostError) -> Self {
        match value {
            HostError::Fault => Self::TouchFailed,
            HostError::NoMemory => Self::NoMemory,
            HostError::Refused => Self::HostRefused,
        }
    }
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageUnlockError {
    #[error("the page was not locked by address")]
    NotTracked,

    #[error("the page was unlocked by MPN already")]
    NoMpn,

    #[error("the page is not locked")]
    NotLocked,

    #[error("the page is an anonymous page")]
    MismatchedType,
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocPagesError {
    #[error("the locked page limit is reached")]
    LimitExceeded,

    #[error("room for {capacity} MPNs, {requested} requested")]
    BufferTooSmall { capacity: usize, requested: usize },

    #[error("no page could be allocated")]
    NoMemory,

    #[error("the MPN list could not be written")]
    Fault,
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreePagesError {
    #[error("room for {capacity} MPNs, {requested} requested")]
    BufferTooSmall { capacity: usize, requested: usize },

    #[error("MPN {0} is not an anonymous page of the VM")]
    NotAnonymous(Mpn),

    #[error("MPN {0} is listed twice")]
    Duplicate(Mpn),

    #[error("the MPN list could not be read")]
    Fault,
}

/// Where allocated MPNs are written.
#[derive(Debug)]
pub enum MpnBuffer<'a> {
    Kernel(&'a mut [Mpn]),
    /// An array of 64-bit MPNs in the VMX.
    User(UserVa),
}

/// Where the MPNs to free are read from.
#[derive(Clone, Copy, Debug)]
pub enum MpnList<'a> {
    Kernel(&'a [Mpn]),
    User(UserVa),
}

const MPN_BYTES: u64 = core::mem::size_of::<u64>() as u64;

impl Vmmon {
    /// Pins the user page at `va` and tracks it as locked by `vm`.
    ///
    /// Unless `allow_multiple`, a VA may only be locked once and is
    /// recorded so that it can be unlocked by address.
    pub fn lock_page(
        &self,
        vm: &VmDriver,
        va: UserVa,
        allow_multiple: bool,
    ) -> Result<Mpn, PageLockError> {
        if !self.reserve_free_pages(vm, 1) {
            return Err(PageLockError::LimitExceeded);
        }

        let result = self.pin_and_track(vm, va, allow_multiple);
        if result.is_err() {
            self.unreserve_free_pages(vm, 1);
        }
        result
    }

    /// Pins `va` with the VM lock dropped, since pinning can fault the page
    /// in, then tracks the page or unpins it again.
    fn pin_and_track(
        &self,
        vm: &VmDriver,
        va: UserVa,
        allow_multiple: bool,
    ) -> Result<Mpn, PageLockError> {
        if !allow_multiple && vm.lock().pages.is_va_locked(va) {
            return Err(PageLockError::AlreadyLocked);
        }

        let mpn = self.host.pin_user_page(va)?;
        if let Err(error) = self.track_locked(vm, va, mpn, allow_multiple) {
            self.host.unpin_user_page(mpn);
            return Err(error);
        }
        log::trace!("VM {}: locked {va} as MPN {mpn}", vm.user_id());
        Ok(mpn)
    }

    /// Another thread may have locked `va` or `mpn` while it was pinned.
    fn track_locked(
        &self,
        vm: &VmDriver,
        va: UserVa,
        mpn: Mpn,
        allow_multiple: bool,
    ) -> Result<(), PageLockError> {
        let mut state = vm.lock();
        let pages = &mut state.pages;
        if mpn > PHYSTRACK_MAX_MPN {
            return Err(PageLockError::Untrackable(mpn));
        }
        if (!allow_multiple && pages.is_va_locked(va))
            || pages.is_lock_taken(&self.shared_tracker, mpn)
            || pages.anon.test(mpn)
        {
            return Err(PageLockError::AlreadyLocked);
        }

        pages.add_locked(&self.shared_tracker, mpn);
        if !allow_multiple {
            let _ = pages.va_to_mpn.insert(va.vpn(), mpn);
        }
        Ok(())
    }

    /// Unlocks the page `va` was locked as.
    pub fn unlock_page(&self, vm: &VmDriver, va: UserVa) -> Result<(), PageUnlockError> {
        let mpn = {
            let mut state = vm.lock();
            let pages = &mut state.pages;
            let vpn = va.vpn();
            let Some(&mpn) = pages.va_to_mpn.get(&vpn) else {
                return Err(PageUnlockError::NotTracked);
            };
            if !mpn.is_valid() {
                let _ = pages.va_to_mpn.remove(&vpn);
                return Err(PageUnlockError::NoMpn);
            }
            if !pages.is_locked(mpn) {
                return Err(if pages.anon.test(mpn) {
                    PageUnlockError::MismatchedType
                } else {
                    PageUnlockError::NotLocked
                });
            }

            pages.remove_locked(&self.shared_tracker, mpn);
            let _ = pages.va_to_mpn.remove(&vpn);
            mpn
        };
        self.host.unpin_user_page(mpn);
        self.unreserve_free_pages(vm, 1);
        Ok(())
    }

    /// Unlocks `mpn`. If `va` is not given, any address that was locked as
    /// `mpn` is left recorded without an MPN.
    pub fn unlock_page_by_mpn(
        &self,
        vm: &VmDriver,
        mpn: Mpn,
        va: Option<UserVa>,
    ) -> Result<(), PageUnlockError> {
        {
            let mut state = vm.lock();
            let pages = &mut state.pages;
            if !pages.is_locked(mpn) {
                return Err(if pages.anon.test(mpn) {
                    PageUnlockError::MismatchedType
                } else {
                    PageUnlockError::NotLocked
                });
            }

            match va {
                Some(va) => {
                    if pages.va_to_mpn.get(&va.vpn()) == Some(&mpn) {
                        let _ = pages.va_to_mpn.remove(&va.vpn());
                    }
                }
                None => pages
                    .va_to_mpn
                    .values_mut()
                    .filter(|recorded| **recorded == mpn)
                    .for_each(|recorded| *recorded = INVALID_MPN),
            }
            pages.remove_locked(&self.shared_tracker, mpn);
        }
        self.host.unpin_user_page(mpn);
        self.unreserve_free_pages(vm, 1);
        Ok(())
    }

    /// Allocates up to `count` anonymous pages for `vm` and writes their
    /// MPNs to `buffer`. Returns how many were allocated, which is less than
    /// `count` if the host ran out of pages.
    ///
    /// Pages are allocated and written out with no lock held. The VM lock is
    /// only taken to track each page.
    pub fn alloc_locked_pages(
        &self,
        vm: &VmDriver,
        count: usize,
        mut buffer: MpnBuffer<'_>,
    ) -> Result<usize, AllocPagesError> {
        if let MpnBuffer::Kernel(slice) = &buffer {
            if slice.len() < count {
                return Err(AllocPagesError::BufferTooSmall {
                    capacity: slice.len(),
                    requested: count,
                });
            }
        }
        if count == 0 {
            return Ok(0);
        }
        if !self.reserve_free_pages(vm, count as u64) {
            return Err(AllocPagesError::LimitExceeded);
        }

        let mut allocated = 0;
        let mut fault = false;
        while allocated < count {
            let Some(mpn) = self.host.alloc_anon_page() else {
                break;
            };
            let written = match &mut buffer {
                MpnBuffer::Kernel(slice) => {
                    slice[allocated] = mpn;
                    Ok(())
                }
                MpnBuffer::User(va) => self
                    .host
                    .copy_to_user(va.offset(allocated as u64 * MPN_BYTES), &mpn.0.to_ne_bytes()),
            };
            if written.is_err() {
                self.host.free_anon_page(mpn);
                fault = true;
                break;
            }
            if !self.track_anon(vm, mpn) {
                log::error!("VM {}: host returned unusable page {mpn}", vm.user_id());
                self.host.free_anon_page(mpn);
                break;
            }
            allocated += 1;
        }

        if allocated < count {
            self.unreserve_free_pages(vm, (count - allocated) as u64);
        }
        match allocated {
            0 if fault => Err(AllocPagesError::Fault),
            0 => Err(AllocPagesError::NoMemory),
            _ => Ok(allocated),
        }
    }

    fn track_anon(&self, vm: &VmDriver, mpn: Mpn) -> bool {
        let mut state = vm.lock();
        let pages = &mut state.pages;
        if mpn > PHYSTRACK_MAX_MPN || pages.anon.test(mpn) || pages.is_locked(mpn) {
            return false;
        }
        pages.anon.add(mpn);
        true
    }

    /// Frees `count` anonymous pages listed in `list`. Nothing is freed
    /// unless every page is an anonymous page of `vm`.
    pub fn free_locked_pages(
        &self,
        vm: &VmDriver,
        list: MpnList<'_>,
        count: usize,
    ) -> Result<(), FreePagesError> {
        let mpns = self.read_mpn_list(list, count)?;
        {
            let mut state = vm.lock();
            let pages = &mut state.pages;
            let mut seen = BTreeSet::new();
            for &mpn in &mpns {
                if !pages.anon.test(mpn) {
                    return Err(FreePagesError::NotAnonymous(mpn));
                }
                if !seen.insert(mpn) {
                    return Err(FreePagesError::Duplicate(mpn));
                }
            }
            for &mpn in &mpns {
                pages.anon.remove(mpn);
            }
        }

        for &mpn in &mpns {
            let refs = self.host.anon_page_ref_count(mpn);
            if refs > 1 {
                log::warn!("VM {}: freeing MPN {mpn} with {refs} references", vm.user_id());
            }
            self.host.free_anon_page(mpn);
        }
        self.unreserve_free_pages(vm, count as u64);
        Ok(())
    }

    fn read_mpn_list(&self, list: MpnList<'_>, count: usize) -> Result<Vec<Mpn>, FreePagesError> {
        match list {
            MpnList::Kernel(slice) => slice
                .get(..count)
                .map(<[Mpn]>::to_vec)
                .ok_or(FreePagesError::BufferTooSmall {
                    capacity: slice.len(),
                    requested: count,
                }),
            MpnList::User(va) => {
                let mut bytes = vec![0u8; count * MPN_BYTES as usize];
                self.host
                    .copy_from_user(&mut bytes, va)
                    .map_err(|_| FreePagesError::Fault)?;
                Ok(bytes
                    .chunks_exact(MPN_BYTES as usize)
                    .map(|chunk| {
                        let mut raw = [0u8; MPN_BYTES as usize];
                        raw.copy_from_slice(chunk);
                        Mpn(u64::from_ne_bytes(raw))
                    })
                    .collect())
            }
        }
    }

    /// Returns the smallest anonymous page of `vm` above `mpn`, or the first
    /// one if `mpn` is [`INVALID_MPN`].
    pub fn get_next_anon_page(&self, vm: &VmDriver, mpn: Mpn) -> Mpn {
        vm.lock().pages.anon.next(mpn)
    }

    pub fn is_anon_page(&self, vm: &VmDriver, mpn: Mpn) -> bool {
        vm.lock().pages.anon.test(mpn)
    }
}
