//! Running a VCPU: world switches until the monitor needs the VMX.
//!
//! Module calls, the requests the monitor makes of the driver, are served
//! here between switches. User calls are requests for the VMX: those for the
//! VCPU's own thread end the run, cross ones are handed to the VMX main
//! thread while the VCPU thread waits.

use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use super::{
    Vmmon,
    cross_page::{CrossPage, ModuleCall, USERCALL_NONE},
    host_ops::{SemaphoreStatus, WaitStatus},
    page_lock::{MpnBuffer, MpnList},
    registry::VmError,
    types::{INVALID_MPN, Mpn, VcpuSet},
    vm::{Vcpu, VmDriver},
    vmcs_pages::{VmcsAllocError, VmcsKind},
    world_switch::ArchSwitch,
};

/// Why [`Vmmon::run_vcpu`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// The monitor made this user call; run again once it is served.
    UserCall(u32),
    /// A signal is pending for the thread; run again after delivering it.
    Restart,
}

#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunError {
    #[error("VCPU {0} does not exist")]
    NoSuchVcpu(usize),

    #[error("the crosspage of VCPU {0} is not set up")]
    NoCrossPage(usize),

    #[error("VCPU {0} is already running")]
    Busy(usize),

    #[error(transparent)]
    VmcsAlloc(#[from] VmcsAllocError),
}

/// Most MPNs one `ReleaseAnonPages` call carries.
const RELEASE_ANON_PAGES_MAX: usize = 3;

impl Vmmon {
    /// Runs VCPU `vcpu_index` of `vm` on the calling thread.
    pub fn run_vcpu<A: ArchSwitch>(
        &self,
        vm: &VmDriver,
        vcpu_index: usize,
        cpu: &A,
    ) -> Result<RunOutcome, RunError> {
        let vcpu = vm
            .vcpu(vcpu_index)
            .ok_or(RunError::NoSuchVcpu(vcpu_index))?;
        let mut slot = vcpu
            .cross_page
            .try_lock()
            .ok_or(RunError::Busy(vcpu_index))?;
        let mapping = slot.as_mut().ok_or(RunError::NoCrossPage(vcpu_index))?;

        loop {
            let cpu_index = self
                .task
                .switch(cpu, &*self.host, &vcpu.current_host_cpu, mapping);

            let page = mapping.get();
            if page.user_call_type != USERCALL_NONE {
                let call = page.user_call_type;
                if page.user_call_cross == 0 {
                    return Ok(RunOutcome::UserCall(call));
                }
                match self.cross_user_call(vm, vcpu_index, vcpu, call) {
                    WaitStatus::Woken => page.set_module_call(ModuleCall::None),
                    WaitStatus::TimedOut => page.set_module_call(ModuleCall::UserTimeout),
                    WaitStatus::Interrupted => return Ok(RunOutcome::Restart),
                }
            } else {
                match page.module_call() {
                    Ok(call) => {
                        if let Some(outcome) = self.module_call(vm, call, page, cpu_index)? {
                            return Ok(outcome);
                        }
                        if call == ModuleCall::SwitchToPeer {
                            continue;
                        }
                    }
                    Err(raw) => log::warn!("VM {}: unknown module call {raw}", vm.user_id()),
                }
            }
            self.host.yield_now();
        }
    }

    /// Serves one module call. Returns an outcome if the run must end.
    fn module_call(
        &self,
        vm: &VmDriver,
        call: ModuleCall,
        page: &mut CrossPage,
        cpu_index: usize,
    ) -> Result<Option<RunOutcome>, RunError> {
        let id = vm.user_id();
        match call {
            ModuleCall::None | ModuleCall::Intr | ModuleCall::UserTimeout => {}
            ModuleCall::GetRecycledPage => {
                let mut mpn = [INVALID_MPN];
                if let Err(err) = self.alloc_locked_pages(vm, 1, MpnBuffer::Kernel(&mut mpn)) {
                    log::warn!("VM {id}: no recycled page for the monitor: {err}");
                    mpn[0] = INVALID_MPN;
                }
                page.retval = mpn[0].0;
            }
            ModuleCall::SemaWait => {
                let status =
                    self.host
                        .semaphore_wait(id, page.args[0] as i32, page.args[1] as u32);
                match semaphore_retval(status) {
                    Some(retval) => page.retval = retval,
                    None => return Ok(Some(RunOutcome::Restart)),
                }
            }
            ModuleCall::SemaSignal => {
                let status = self.host.semaphore_signal(page.args[0] as i32);
                match semaphore_retval(status) {
                    Some(retval) => page.retval = retval,
                    None => return Ok(Some(RunOutcome::Restart)),
                }
            }
            ModuleCall::SemaForceWakeup => {
                for vcpu in VcpuSet(page.args[0]).iter() {
                    self.host.semaphore_force_wakeup(id, vcpu);
                }
            }
            ModuleCall::Ipi => {
                let mut sent = false;
                for index in VcpuSet(page.args[0]).iter() {
                    if let Some(host_cpu) = vm.vcpu(index).and_then(Vcpu::host_cpu) {
                        self.host.send_ipi(host_cpu);
                        sent = true;
                    }
                }
                page.retval = u64::from(sent);
            }
            ModuleCall::ReleaseAnonPages => {
                let mpns: Vec<Mpn> = page.args[..RELEASE_ANON_PAGES_MAX]
                    .iter()
                    .map(|&raw| Mpn(raw))
                    .filter(|mpn| mpn.is_valid())
                    .collect();
                let result = self.free_locked_pages(vm, MpnList::Kernel(&mpns), mpns.len());
                if let Err(err) = result {
                    log::warn!("VM {id}: releasing anonymous pages failed: {err}");
                }
                page.retval = u64::from(result.is_ok());
            }
            ModuleCall::IsAnonPage => {
                page.retval = u64::from(self.is_anon_page(vm, Mpn(page.args[0])));
            }
            ModuleCall::StartVmxOp => {
                let mpn = self
                    .task
                    .vmcs
                    .provision(VmcsKind::Dummy, cpu_index, &*self.host)?;
                page.retval = mpn.0;
            }
            ModuleCall::AllocVmxPage => {
                let mpn = self
                    .task
                    .vmcs
                    .provision(VmcsKind::Root, cpu_index, &*self.host)?;
                page.root_vmcs_mpn = mpn.0;
            }
            ModuleCall::SwitchToPeer => page.run_peer ^= 1,
        }
        Ok(None)
    }

    /// Hands user call `call` to the VMX main thread and waits until it is
    /// served.
    fn cross_user_call(
        &self,
        vm: &VmDriver,
        vcpu_index: usize,
        vcpu: &Vcpu,
        call: u32,
    ) -> WaitStatus {
        vcpu.pending_user_call.store(call, Ordering::Release);
        self.host.wake_main_thread(vm.user_id());
        let status =
            self.host
                .user_call_wait(vm.user_id(), vcpu_index, self.config.user_call_timeout_ms);
        if status == WaitStatus::TimedOut {
            log::warn!(
                "VM {} VCPU {vcpu_index}: user call {call} not served in {} ms",
                vm.user_id(),
                self.config.user_call_timeout_ms
            );
        }
        status
    }

    /// Cross user calls waiting for the VMX main thread, as
    /// `(vcpu, user call)`.
    pub fn pending_user_calls(&self, vm: &VmDriver) -> Vec<(usize, u32)> {
        vm.vcpus()
            .iter()
            .enumerate()
            .filter_map(|(index, vcpu)| {
                match vcpu.pending_user_call.load(Ordering::Acquire) {
                    USERCALL_NONE => None,
                    call => Some((index, call)),
                }
            })
            .collect()
    }

    /// Marks the cross user call of `vcpu_index` served and wakes its thread.
    pub fn complete_user_call(&self, vm: &VmDriver, vcpu_index: usize) -> Result<(), VmError> {
        let vcpu = vm
            .vcpu(vcpu_index)
            .ok_or(VmError::NoSuchVcpu(vcpu_index))?;
        vcpu.pending_user_call
            .store(USERCALL_NONE, Ordering::Release);
        self.host.awaken_vcpu(vm.user_id(), vcpu_index);
        Ok(())
    }
}

/// The value the monitor gets for a semaphore operation, or `None` if the
/// run must restart to deliver a signal.
fn semaphore_retval(status: SemaphoreStatus) -> Option<u64> {
    match status {
        SemaphoreStatus::Done => Some(1),
        SemaphoreStatus::Nothing => Some(0),
        SemaphoreStatus::Failed => Some(u64::MAX),
        SemaphoreStatus::Interrupted => None,
    }
}
