//! The driver core: one [`Vmmon`] instance per loaded driver.
//!
//! Every operation of the control surface is a method of [`Vmmon`]. The
//! instance owns the process wide state, so the embedding module creates it
//! on load, shares it between its entry points and tears it down on unload.
//!
//! Locks are always taken in this order: the global lock, a per VM lock, the
//! shared page tracker. Per VCPU crosspage locks are only held by the thread
//! running that VCPU and never while waiting for another lock.

pub mod config;
pub mod cross_gdt;
pub mod cross_page;
pub mod fast_clock;
pub mod host_ops;
pub mod ledger;
mod logger;
pub mod page_lock;
pub mod panic;
pub mod phys_track;
pub mod pseudo_tsc;
pub mod registry;
pub mod run_loop;
mod segment;
mod support;
mod switch_handlers;
#[cfg(test)]
mod test_support;
pub mod types;
pub mod vm;
pub mod vmcs_pages;
pub mod world_switch;
pub mod x86_cpu;
mod x86_instructions;

use alloc::sync::Arc;
use spin::{Mutex, MutexGuard};

use self::{
    config::DriverConfig,
    host_ops::HostOps,
    ledger::GlobalState,
    phys_track::SharedPhysTracker,
    world_switch::Task,
};

/// The loaded driver.
pub struct Vmmon {
    pub(crate) config: DriverConfig,
    pub(crate) host: Arc<dyn HostOps>,
    global: Mutex<GlobalState>,
    pub(crate) shared_tracker: SharedPhysTracker,
    pub(crate) task: Task,
}

impl core::fmt::Debug for Vmmon {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vmmon")
            .field("config", &self.config)
            .field("global", &self.global)
            .finish_non_exhaustive()
    }
}

impl Vmmon {
    /// Initializes the driver. Installs the host logger first if
    /// `config.log_level` is set.
    pub fn init(config: DriverConfig, host: Arc<dyn HostOps>) -> Self {
        if let Some(level) = config.log_level {
            logger::init(host.clone(), level);
        }

        let cpu_count = host.cpu_count();
        log::info!(
            "Initializing for {cpu_count} processors, {:?} TSS strategy",
            config.tss_strategy
        );
        Self {
            global: Mutex::new(GlobalState::new(&config)),
            task: Task::new(cpu_count, config.tss_strategy),
            shared_tracker: SharedPhysTracker::new(),
            config,
            host,
        }
    }

    /// Releases process wide resources on driver unload.
    ///
    /// # Panics
    ///
    /// Panics if any VM is still registered.
    pub fn teardown(self) {
        let vms = self.global.lock().vms.len();
        assert!(vms == 0, "{vms} VMs still registered at unload");
        self.task.teardown(&*self.host);
        log::info!("Unloaded");
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub(crate) fn lock_global(&self) -> MutexGuard<'_, GlobalState> {
        self.global.lock()
    }

    #[cfg(test)]
    pub(crate) fn is_global_locked(&self) -> bool {
        self.global.is_locked()
    }
}
