//! The pseudo TSC: a monotonic cycle counter the monitor derives either from
//! the raw TSC or, once the TSC is found unreliable, from the host reference
//! clock.
//!
//! The counter is `((source * mult) >> shift) + add`, where the source is the
//! TSC or the reference clock in nanoseconds. The parameters are copied into
//! every crosspage before entering the monitor so that it can compute the
//! counter without calling host API.

use spin::{Mutex, Once};

const NSEC_PER_SEC: u128 = 1_000_000_000;
const REF_CLOCK_SHIFT: u32 = 32;

/// The conversion parameters as seen by the monitor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct PseudoTscParams {
    pub use_ref_clock: u32,
    pub shift: u32,
    pub mult: u64,
    pub add: u64,
    pub hz: u64,
    /// TSC and reference clock read right before the last world switch.
    pub tsc_sample: u64,
    pub ref_sample_ns: u64,
}

impl PseudoTscParams {
    /// Computes the pseudo TSC for the given source readings.
    pub fn value(&self, tsc: u64, ref_ns: u64) -> u64 {
        let source = if self.use_ref_clock != 0 { ref_ns } else { tsc };
        let scaled = (u128::from(source) * u128::from(self.mult)) >> self.shift;
        (scaled as u64).wrapping_add(self.add)
    }
}

#[derive(Debug, Default)]
pub(crate) struct PseudoTsc {
    basis: Once<u64>,
    params: Mutex<PseudoTscParams>,
}

impl PseudoTsc {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sets the basis of the counter. Only the first call takes effect; later
    /// callers get the parameters chosen by the first one.
    pub(crate) fn init(&self, hz: u64, use_ref_clock: bool, tsc: u64, ref_ns: u64) -> PseudoTscParams {
        let _ = self.basis.call_once(|| {
            let mut params = self.params.lock();
            *params = PseudoTscParams {
                use_ref_clock: 0,
                shift: 0,
                mult: 1,
                add: 0,
                hz,
                tsc_sample: tsc,
                ref_sample_ns: ref_ns,
            };
            log::info!("Pseudo TSC runs at {hz} Hz");
            hz
        });
        if use_ref_clock {
            let _ = self.switch_to_ref_clock(tsc, ref_ns);
        }
        *self.params.lock()
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.basis.is_completed()
    }

    /// Makes the counter follow the reference clock from now on, continuing
    /// from its current value. Returns `false` if it already did. There is no
    /// way back to the TSC.
    pub(crate) fn switch_to_ref_clock(&self, tsc: u64, ref_ns: u64) -> bool {
        let mut params = self.params.lock();
        if params.use_ref_clock != 0 {
            return false;
        }

        let now = params.value(tsc, ref_ns);
        let mult = ((u128::from(params.hz) << REF_CLOCK_SHIFT) / NSEC_PER_SEC) as u64;
        let scaled = ((u128::from(ref_ns) * u128::from(mult)) >> REF_CLOCK_SHIFT) as u64;
        params.use_ref_clock = 1;
        params.mult = mult;
        params.shift = REF_CLOCK_SHIFT;
        params.add = now.wrapping_sub(scaled);
        log::info!("Pseudo TSC switched to the reference clock");
        true
    }

    /// Copies the current parameters and the given samples to `dst`.
    pub(crate) fn update(&self, dst: &mut PseudoTscParams, tsc: u64, ref_ns: u64) {
        let params = self.params.lock();
        *dst = PseudoTscParams {
            tsc_sample: tsc,
            ref_sample_ns: ref_ns,
            ..*params
        };
    }
}
