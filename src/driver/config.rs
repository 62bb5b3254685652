//! Tunables of the driver, fixed at load time.

/// Ceiling used for the `dynamic` locked page limit until a daemon sets one.
pub const MAX_LOCKED_PAGES: u64 = u32::MAX as u64;

/// How the busy bit of the host TSS descriptor is cleared before TR is
/// reloaded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TssStrategy {
    /// Load TR against a per processor copy of the relevant descriptors so
    /// that the live host GDT is never written.
    #[default]
    TempGdt,

    /// Clear the busy bit in the host GDT directly.
    HostGdt,
}

/// Load time configuration of [`Vmmon`](super::Vmmon).
#[derive(Clone, Copy, Debug)]
pub struct DriverConfig {
    /// Maximum number of concurrently registered VMs.
    pub max_vms: usize,

    /// Maximum number of VCPUs per VM.
    pub max_vcpus: usize,

    /// Pages subtracted from the effective locked page limit for each
    /// registered VM.
    pub per_vm_overhead_pages: u64,

    /// Initial value of the user configured locked page limit.
    pub initial_configured_limit: u64,

    /// Initial value of the daemon controlled locked page limit.
    pub initial_dynamic_limit: u64,

    /// Attempts made by page reservation while the global limit is hit.
    pub reserve_retries: u32,

    /// Sleep between those attempts.
    pub reserve_wait_ms: u32,

    /// How long a VCPU thread waits for the main thread to service a cross
    /// user call.
    pub user_call_timeout_ms: u32,

    pub tss_strategy: TssStrategy,

    /// Track every VM's user locked pages in the one shared tracker.
    pub shared_page_tracking: bool,

    /// Allocate and free the nonpaged portion of a VM during admission to
    /// prove it can actually be allocated.
    pub verify_nonpaged_allocation: bool,

    /// If `Some`, installs the host logger at this level.
    pub log_level: Option<log::LevelFilter>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_vms: 64,
            max_vcpus: 128,
            per_vm_overhead_pages: 0,
            initial_configured_limit: 0,
            initial_dynamic_limit: MAX_LOCKED_PAGES,
            reserve_retries: 3,
            reserve_wait_ms: 10,
            user_call_timeout_ms: 100,
            tss_strategy: TssStrategy::default(),
            shared_page_tracking: false,
            verify_nonpaged_allocation: false,
            log_level: Some(log::LevelFilter::Info),
        }
    }
}
