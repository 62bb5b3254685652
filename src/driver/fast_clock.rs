//! The host timer that wakes polling VCPUs, shared by every VM.

use super::{Vmmon, ledger::GlobalState, vm::VmDriver};

impl Vmmon {
    /// Records the timer rate `vm` needs, zero for none, and reprograms the
    /// host timer to the highest rate any VM needs.
    pub fn set_fast_clock_rate(&self, vm: &VmDriver, hz: u32) {
        let mut global = self.lock_global();
        vm.lock().fast_clock_hz = hz;
        self.update_fast_clock(&mut global);
    }

    pub(crate) fn update_fast_clock(&self, global: &mut GlobalState) {
        let hz = global
            .vms
            .iter()
            .map(|vm| vm.lock().fast_clock_hz)
            .max()
            .unwrap_or(0);
        if hz != global.fast_clock_hz {
            log::debug!("Fast clock rate {} -> {hz} Hz", global.fast_clock_hz);
            global.fast_clock_hz = hz;
            self.host.set_fast_clock_rate(hz);
        }
    }
}
