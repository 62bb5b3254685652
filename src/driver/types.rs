//! Identifiers shared by every part of the driver.

use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

pub(crate) const PAGE_SIZE: usize = BASE_PAGE_SIZE;
pub(crate) const PAGE_SHIFT: usize = BASE_PAGE_SHIFT;

/// A machine page number, that is, a host physical address shifted right by
/// the page shift.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[display("{_0:#x}")]
#[repr(transparent)]
pub struct Mpn(pub u64);

/// The sentinel for "no page". Never tracked, never allocated.
pub const INVALID_MPN: Mpn = Mpn(u64::MAX);

impl Mpn {
    /// Returns the MPN of the page containing the physical address `pa`.
    pub const fn from_pa(pa: u64) -> Self {
        Self(pa >> PAGE_SHIFT)
    }

    /// Returns the physical address of the first byte of the page.
    pub const fn pa(self) -> u64 {
        self.0 << PAGE_SHIFT
    }

    pub const fn is_valid(self) -> bool {
        self.0 != INVALID_MPN.0
    }
}

/// A virtual address in the address space of the process that opened the
/// driver (the VMX).
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[display("{_0:#x}")]
#[repr(transparent)]
pub struct UserVa(pub u64);

impl UserVa {
    /// Returns the virtual page number containing this address.
    pub const fn vpn(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    /// Returns the address `bytes` past this one.
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

/// The user visible, positive identifier of a VM.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[repr(transparent)]
pub struct VmId(pub u32);

/// A set of VCPUs of one VM, one bit per VCPU index, as passed by the monitor
/// in module call arguments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VcpuSet(pub u64);

impl VcpuSet {
    /// Iterates over the VCPU indices in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..u64::BITS as usize).filter(move |&i| self.0 & (1 << i) != 0)
    }
}
