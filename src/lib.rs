//! The world switch and physical page accounting core of a hosted hypervisor
//! monitor driver.
//!
//! The embedding kernel module provides a [`HostOps`] implementation for the
//! host OS services and an [`ArchSwitch`] implementation (normally
//! [`X86Cpu`]) for the privileged CPU state, then drives a [`Vmmon`] instance
//! from its device control surface.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod driver;

pub use driver::config::{DriverConfig, TssStrategy};
pub use driver::cross_page::{CROSS_PAGE_VERSION, CrossPage, ModuleCall};
pub use driver::host_ops::{HostError, HostOps, SemaphoreStatus, WaitStatus};
pub use driver::panic::panic_impl;
pub use driver::types::{INVALID_MPN, Mpn, UserVa, VmId};
pub use driver::world_switch::ArchSwitch;
pub use driver::x86_cpu::X86Cpu;
pub use driver::{Vmmon, vm::VmDriver};
