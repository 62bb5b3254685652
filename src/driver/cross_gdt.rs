//! The cross-GDT: a GDT shared by every VM that stays loaded while the
//! world switch moves between the host and monitor address spaces.
//!
//! It is allocated once, seeded with the host GDT entries, and only ever
//! grows: a slot can be written while empty, and rewriting it with the value
//! it already holds is accepted.

use alloc::{boxed::Box, vec::Vec};
use spin::Mutex;

use super::{
    Vmmon,
    cross_page::Dtr,
    host_ops::HostOps,
    segment,
    support::zeroed_box,
    types::{Mpn, PAGE_SIZE},
    world_switch::ArchSwitch,
};

pub const CROSS_GDT_ENTRIES: usize = 0x2000;
const CROSS_GDT_PAGES: usize = CROSS_GDT_ENTRIES * 8 / PAGE_SIZE;

#[repr(C, align(4096))]
struct CrossGdtRaw([u64; CROSS_GDT_ENTRIES]);

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrossGdtError {
    #[error("slot {0} is outside the cross-GDT")]
    OutOfRange(usize),

    #[error("slot {index} holds {current:#x}, refusing {requested:#x}")]
    Mismatch {
        index: usize,
        current: u64,
        requested: u64,
    },
}

/// Where the monitor finds the cross-GDT.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrossGdtInfo {
    pub base: u64,
    pub mpns: Vec<Mpn>,
}

pub(crate) struct CrossGdt {
    table: Mutex<Box<CrossGdtRaw>>,
    base: u64,
    mpns: Vec<Mpn>,
}

impl core::fmt::Debug for CrossGdt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CrossGdt")
            .field("base", &format_args!("{:#x}", self.base))
            .field("mpns", &self.mpns)
            .finish_non_exhaustive()
    }
}

impl CrossGdt {
    /// Allocates the table and copies the host GDT described by `host_gdtr`
    /// into it.
    fn new(host: &dyn HostOps, host_gdtr: &Dtr) -> Self {
        let mut table = zeroed_box::<CrossGdtRaw>();
        let count = host_gdtr.entries().min(CROSS_GDT_ENTRIES);
        for (index, entry) in table.0.iter_mut().take(count).enumerate() {
            // Safety: `index` is within the live host GDT.
            *entry = unsafe { segment::gdt_entry(host_gdtr, index) };
        }

        let base = table.0.as_ptr() as u64;
        let mpns = (0..CROSS_GDT_PAGES)
            .map(|page| {
                let va = (base as usize + page * PAGE_SIZE) as *const core::ffi::c_void;
                Mpn::from_pa(host.pa(va))
            })
            .collect();
        Self {
            table: Mutex::new(table),
            base,
            mpns,
        }
    }

    fn info(&self) -> CrossGdtInfo {
        CrossGdtInfo {
            base: self.base,
            mpns: self.mpns.clone(),
        }
    }

    fn set_entry(&self, index: usize, value: u64) -> Result<(), CrossGdtError> {
        let mut table = self.table.lock();
        let slot = table
            .0
            .get_mut(index)
            .ok_or(CrossGdtError::OutOfRange(index))?;
        if *slot == 0 || *slot == value {
            *slot = value;
            return Ok(());
        }
        log::error!("Cross-GDT slot {index} holds {:#x}, refusing {value:#x}", *slot);
        Err(CrossGdtError::Mismatch {
            index,
            current: *slot,
            requested: value,
        })
    }

    #[cfg(test)]
    fn entry(&self, index: usize) -> Option<u64> {
        self.table.lock().0.get(index).copied()
    }
}

impl Vmmon {
    /// Returns the cross-GDT, allocating it from the GDT of the current
    /// processor on first use.
    pub fn cross_gdt<A: ArchSwitch>(&self, cpu: &A) -> CrossGdtInfo {
        self.cross_gdt_table(cpu).info()
    }

    /// Writes one cross-GDT slot.
    pub fn set_cross_gdt_entry<A: ArchSwitch>(
        &self,
        cpu: &A,
        index: usize,
        value: u64,
    ) -> Result<(), CrossGdtError> {
        self.cross_gdt_table(cpu).set_entry(index, value)
    }

    fn cross_gdt_table<A: ArchSwitch>(&self, cpu: &A) -> &CrossGdt {
        self.task.cross_gdt.call_once(|| {
            let gdt = CrossGdt::new(&*self.host, &cpu.sgdt());
            log::info!("Cross-GDT allocated at {:#x}", gdt.base);
            gdt
        })
    }
}
