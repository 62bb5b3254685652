//! The host OS services the driver core depends on.
//!
//! The embedding kernel module implements [`HostOps`] on top of the host
//! kernel API (page pinning, page allocator, wait queues, IPIs, timers) and
//! hands it to [`Vmmon::init`](super::Vmmon::init).

use core::ptr::NonNull;

use super::types::{Mpn, UserVa, VmId};

/// Errors reported by host primitives.
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostError {
    #[error("the host refused the request")]
    Refused,

    #[error("the user address could not be touched")]
    Fault,

    #[error("the host is out of memory")]
    NoMemory,
}

/// Result of a bounded wait on a host wait primitive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitStatus {
    /// The awaited event happened.
    Woken,
    TimedOut,
    /// A signal is pending for the waiting thread.
    Interrupted,
}

/// Result of a monitor semaphore operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SemaphoreStatus {
    Done,
    /// Wait timed out, or signal found nothing to signal.
    Nothing,
    /// A signal is pending for the calling thread.
    Interrupted,
    Failed,
}

/// A user page pinned and mapped into the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PinnedPage {
    pub mpn: Mpn,
    pub kernel_va: NonNull<u8>,
}

unsafe impl Send for PinnedPage {}

/// A set of host specific API.
pub trait HostOps: Send + Sync {
    /// Pins the user page containing `va` and returns its MPN.
    fn pin_user_page(&self, va: UserVa) -> Result<Mpn, HostError>;

    /// Releases a pin taken by `pin_user_page`.
    fn unpin_user_page(&self, mpn: Mpn);

    /// Pins the user page containing `va` and maps it into the kernel.
    fn map_user_page(&self, va: UserVa) -> Result<PinnedPage, HostError>;

    /// Unmaps and unpins a page returned by `map_user_page`.
    fn unmap_user_page(&self, page: PinnedPage);

    /// Allocates one zero-filled page that is not backed by any user mapping.
    fn alloc_anon_page(&self) -> Option<Mpn>;

    /// Frees a page returned by `alloc_anon_page`.
    fn free_anon_page(&self, mpn: Mpn);

    /// Returns the host reference count of an anonymous page.
    fn anon_page_ref_count(&self, mpn: Mpn) -> u32;

    fn copy_to_user(&self, dst: UserVa, src: &[u8]) -> Result<(), HostError>;

    fn copy_from_user(&self, dst: &mut [u8], src: UserVa) -> Result<(), HostError>;

    /// Returns a physical address of a kernel linear address specified by `va`.
    fn pa(&self, va: *const core::ffi::c_void) -> u64;

    /// Estimates how many pages can be locked systemwide without starving
    /// the host. Called on every limit computation.
    fn lockable_page_estimate(&self) -> u64;

    /// Index of the logical processor running the caller.
    fn current_cpu(&self) -> usize;

    fn cpu_count(&self) -> usize;

    /// Reads the host reference clock, in nanoseconds.
    fn ref_clock_ns(&self) -> u64;

    fn sleep_ms(&self, ms: u32);

    /// Gives up the rest of the time slice.
    fn yield_now(&self);

    /// Waits until the monitor semaphore `fd` is signalled.
    fn semaphore_wait(&self, vm: VmId, fd: i32, timeout_ms: u32) -> SemaphoreStatus;

    fn semaphore_signal(&self, fd: i32) -> SemaphoreStatus;

    /// Wakes the thread of `vcpu` if it is blocked in `semaphore_wait`.
    fn semaphore_force_wakeup(&self, vm: VmId, vcpu: usize);

    /// Sends an IPI to `cpu` so that a VCPU spinning in the monitor there
    /// notices new work.
    fn send_ipi(&self, cpu: usize);

    /// Wakes the main VMX thread of `vm` to service a cross user call.
    fn wake_main_thread(&self, vm: VmId);

    /// Blocks the thread of `vcpu` until `awaken_vcpu` or the timeout.
    fn user_call_wait(&self, vm: VmId, vcpu: usize, timeout_ms: u32) -> WaitStatus;

    fn awaken_vcpu(&self, vm: VmId, vcpu: usize);

    /// Programs the high resolution timer that wakes polling VCPUs. Zero
    /// stops it.
    fn set_fast_clock_rate(&self, hz: u32);

    /// Emits one formatted log line.
    fn log(&self, level: log::Level, message: &str);
}
