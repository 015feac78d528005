use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::{ax_err, ax_err_type, AxResult};
use spin::RwLock;

use crate::{
    exit::{ExitResolution, FaultAccess, VCpuExitReport},
    hal::VirtMode,
    mem::{check_mem_ranges, GuestPhysAddr, MemoryRange},
    percpu::AxPerCpuTable,
    regs::{RegMask, RegisterState},
    vcpu::VCpuState,
    vm::AxVm,
    vmx,
    vpid::VpidAllocator,
    AxVmmHal, CallerId, VCpuId, VMId,
};

/// Maximum number of vcpus in one VM.
pub const MAX_VCPUS_PER_VM: usize = 64;
/// Maximum length of a VM name, in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Largest VPID the VMX tag field holds.
const VMX_MAX_VPID: u16 = 0xffff;

/// State shared by every VM of one [`AxVmm`].
pub struct VmmContext<H: AxVmmHal> {
    hal: Arc<H>,
    mode: VirtMode,
    vpids: VpidAllocator,
    percpu: AxPerCpuTable,
    /// Fresh vcpus start at the reset vector rather than in flat protected mode.
    power_on_reset: bool,
    poisoned: AtomicBool,
}

impl<H: AxVmmHal> VmmContext<H> {
    pub fn hal(&self) -> &Arc<H> {
        &self.hal
    }

    pub const fn mode(&self) -> VirtMode {
        self.mode
    }

    pub fn vpids(&self) -> &VpidAllocator {
        &self.vpids
    }

    pub fn percpu(&self) -> &AxPerCpuTable {
        &self.percpu
    }

    /// Mark the subsystem unusable: hardware state may be inconsistent.
    pub fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::SeqCst) {
            error!("virtualization subsystem poisoned");
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// The register state a vcpu has when nobody reset it explicitly.
    pub fn default_state(&self) -> RegisterState {
        if self.power_on_reset {
            RegisterState::power_on()
        } else {
            RegisterState::flat_protected()
        }
    }
}

/// Arguments of [`AxVmm::create_vm`].
#[derive(Debug, Clone)]
pub struct VmCreateParams {
    pub name: String,
    /// Guest memory, ascending.
    pub memory_ranges: Vec<MemoryRange>,
    pub vcpu_count: usize,
}

/// Result of [`AxVmm::create_vm`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmCreated {
    pub vm_id: VMId,
    /// Total guest memory in MiB.
    pub memory_size_mb: usize,
}

/// Arguments of [`AxVmm::run_vcpu`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    pub vm_id: VMId,
    pub vcpu_id: VCpuId,
    /// Answer to the exit returned by the previous run.
    pub resume: Option<ExitResolution>,
    /// Host interrupt vector to deliver once the guest can take it.
    pub irq: Option<u8>,
}

impl RunParams {
    pub const fn new(vm_id: VMId, vcpu_id: VCpuId) -> Self {
        Self {
            vm_id,
            vcpu_id,
            resume: None,
            irq: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    pub id: VMId,
    pub name: String,
    pub memory_size_mb: usize,
    pub vcpu_count: usize,
    pub vcpu_states: Vec<VCpuState>,
    pub creator: CallerId,
}

/// Result of [`AxVmm::get_info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmInfoResult {
    /// The buffer holds fewer summaries than there are VMs to report.
    RequiredSize(usize),
    Info(Vec<VmSummary>),
}

struct Registry<H: AxVmmHal> {
    vms: BTreeMap<VMId, Arc<AxVm<H>>>,
    next_id: VMId,
}

/// The virtualization subsystem: every VM plus the state they share.
pub struct AxVmm<H: AxVmmHal> {
    ctx: VmmContext<H>,
    registry: RwLock<Registry<H>>,
    shut_down: AtomicBool,
}

impl<H: AxVmmHal> AxVmm<H> {
    /// Detect the virtualization family and enable it on every host CPU.
    pub fn new(hal: Arc<H>) -> AxResult<Self> {
        let Some(mode) = hal.virt_mode() else {
            return ax_err!(Unsupported, "no hardware virtualization");
        };
        if !mode.has_nested_paging() {
            warn!("{:?} without second-level translation is not supported", mode);
            return ax_err!(Unsupported, "second-level address translation required");
        }
        let (max_tag, power_on_reset) = if mode.is_vmx() {
            (VMX_MAX_VPID, vmx::unrestricted_guest_supported(&*hal))
        } else {
            let asids = hal.cpuid(0x8000_000a, 0).ebx;
            if asids < 2 {
                return ax_err!(Unsupported, "no ASIDs available for guests");
            }
            ((asids - 1).min(u16::MAX as u32) as u16, true)
        };

        let percpu = AxPerCpuTable::new(hal.cpu_count());
        percpu.enable_all(&*hal)?;
        info!(
            "virtualization enabled: {:?}, {} CPUs, {} tags, {} reset",
            mode,
            hal.cpu_count(),
            max_tag,
            if power_on_reset { "real-mode" } else { "protected-mode" }
        );
        Ok(Self {
            ctx: VmmContext {
                hal,
                mode,
                vpids: VpidAllocator::new(max_tag),
                percpu,
                power_on_reset,
                poisoned: AtomicBool::new(false),
            },
            registry: RwLock::new(Registry {
                vms: BTreeMap::new(),
                next_id: 1,
            }),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &VmmContext<H> {
        &self.ctx
    }

    fn check_usable(&self) -> AxResult {
        if self.ctx.is_poisoned() {
            return ax_err!(BadState, "virtualization subsystem poisoned");
        }
        if self.shut_down.load(Ordering::SeqCst) {
            return ax_err!(BadState, "virtualization subsystem shut down");
        }
        Ok(())
    }

    /// Look up `vm_id` on behalf of `caller`.
    pub(crate) fn lookup(&self, caller: CallerId, vm_id: VMId) -> AxResult<Arc<AxVm<H>>> {
        self.check_usable()?;
        let vm = self
            .registry
            .read()
            .vms
            .get(&vm_id)
            .cloned()
            .ok_or_else(|| ax_err_type!(NotFound, format!("no VM {vm_id}")))?;
        if !self.ctx.hal.may_access(caller, vm.creator()) {
            return ax_err!(PermissionDenied, format!("caller {caller} may not access VM {vm_id}"));
        }
        Ok(vm)
    }

    fn unregister(&self, vm: &Arc<AxVm<H>>) {
        let mut registry = self.registry.write();
        if registry
            .vms
            .get(&vm.id())
            .is_some_and(|cur| Arc::ptr_eq(cur, vm))
        {
            registry.vms.remove(&vm.id());
        }
    }

    /// Create a VM with its memory mapped and its vcpus reset to the
    /// power-on state.
    pub fn create_vm(&self, caller: CallerId, params: &VmCreateParams) -> AxResult<VmCreated> {
        self.check_usable()?;
        if params.name.len() > MAX_NAME_LEN {
            return ax_err!(InvalidInput, "VM name too long");
        }
        if params.vcpu_count == 0 || params.vcpu_count > MAX_VCPUS_PER_VM {
            return ax_err!(InvalidInput, format!("bad vcpu count {}", params.vcpu_count));
        }
        let memory_size_mb = check_mem_ranges(&params.memory_ranges)?;
        let state = self.ctx.default_state();

        let mut registry = self.registry.write();
        let id = registry.next_id;
        let vm = AxVm::new(&self.ctx, id, caller, params, memory_size_mb, &state)?;
        registry.vms.insert(id, Arc::new(vm));
        registry.next_id += 1;
        info!(
            "VM {} ({}) created: {} MiB, {} vcpus, creator {}",
            id, params.name, memory_size_mb, params.vcpu_count, caller
        );
        Ok(VmCreated {
            vm_id: id,
            memory_size_mb,
        })
    }

    /// Run a vcpu until the caller has to act.
    ///
    /// Returns `ResourceBusy` if the vcpu is not stopped. Any other error
    /// terminates the VM.
    pub fn run_vcpu(&self, caller: CallerId, params: &RunParams) -> AxResult<VCpuExitReport> {
        let vm = self.lookup(caller, params.vm_id)?;
        let ret = vm.run_vcpu(&self.ctx, params);
        if vm.is_terminating() {
            self.unregister(&vm);
        }
        ret
    }

    /// Summaries of the VMs `caller` may access, or the number of entries
    /// needed if more than `capacity`.
    pub fn get_info(&self, caller: CallerId, capacity: usize) -> AxResult<VmInfoResult> {
        self.check_usable()?;
        let registry = self.registry.read();
        let visible: Vec<_> = registry
            .vms
            .values()
            .filter(|vm| self.ctx.hal.may_access(caller, vm.creator()))
            .collect();
        if visible.len() > capacity {
            return Ok(VmInfoResult::RequiredSize(visible.len()));
        }
        Ok(VmInfoResult::Info(
            visible
                .into_iter()
                .map(|vm| VmSummary {
                    id: vm.id(),
                    name: vm.name().into(),
                    memory_size_mb: vm.memory_size_mb(),
                    vcpu_count: vm.vcpu_count(),
                    vcpu_states: vm.vcpu_states(),
                    creator: vm.creator(),
                })
                .collect(),
        ))
    }

    /// Terminate a VM. Running vcpus stop at their next check point and the
    /// last of them releases the VM.
    pub fn terminate_vm(&self, caller: CallerId, vm_id: VMId) -> AxResult {
        let vm = self.lookup(caller, vm_id)?;
        self.unregister(&vm);
        vm.terminate(&self.ctx);
        Ok(())
    }

    /// Reset a stopped vcpu to `state`.
    pub fn reset_vcpu(
        &self,
        caller: CallerId,
        vm_id: VMId,
        vcpu_id: VCpuId,
        state: &RegisterState,
    ) -> AxResult {
        let vm = self.lookup(caller, vm_id)?;
        let vcpu = vm.vcpu(vcpu_id)?;
        vcpu.reset(&self.ctx, &vm.setup_for(vcpu_id), state)
    }

    /// Raise or lower a vcpu's interrupt line. Raising it kicks the CPU the
    /// vcpu runs on.
    pub fn set_pending_interrupt(
        &self,
        caller: CallerId,
        vm_id: VMId,
        vcpu_id: VCpuId,
        asserted: bool,
    ) -> AxResult {
        let vm = self.lookup(caller, vm_id)?;
        let vcpu = vm.vcpu(vcpu_id)?;
        vcpu.set_interrupt_line(asserted);
        if asserted && vcpu.state() == VCpuState::Running {
            if let Some(cpu) = vcpu.last_cpu() {
                self.ctx.hal.notify_cpu(cpu);
            }
        }
        Ok(())
    }

    pub fn read_registers(
        &self,
        caller: CallerId,
        vm_id: VMId,
        vcpu_id: VCpuId,
        mask: RegMask,
    ) -> AxResult<RegisterState> {
        let vm = self.lookup(caller, vm_id)?;
        vm.vcpu(vcpu_id)?.read_registers(&self.ctx, mask)
    }

    pub fn write_registers(
        &self,
        caller: CallerId,
        vm_id: VMId,
        vcpu_id: VCpuId,
        mask: RegMask,
        state: &RegisterState,
    ) -> AxResult {
        let vm = self.lookup(caller, vm_id)?;
        vm.vcpu(vcpu_id)?.write_registers(&self.ctx, mask, state)
    }

    /// Copy guest RAM at `gpa` into `buf`. The range must lie in one page.
    pub fn read_guest_page(
        &self,
        caller: CallerId,
        vm_id: VMId,
        gpa: GuestPhysAddr,
        buf: &mut [u8],
    ) -> AxResult {
        let vm = self.lookup(caller, vm_id)?;
        vm.with_guest_page(&self.ctx, gpa, buf.len(), FaultAccess::Read, |page| {
            buf.copy_from_slice(page)
        })
    }

    /// Copy `buf` into guest RAM at `gpa`. The range must lie in one page.
    pub fn write_guest_page(
        &self,
        caller: CallerId,
        vm_id: VMId,
        gpa: GuestPhysAddr,
        buf: &[u8],
    ) -> AxResult {
        let vm = self.lookup(caller, vm_id)?;
        vm.with_guest_page(&self.ctx, gpa, buf.len(), FaultAccess::Write, |page| {
            page.copy_from_slice(buf)
        })
    }

    /// Terminate every VM and disable virtualization on every CPU.
    ///
    /// Blocks until every runner has left guest mode and released its VM.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let vms = core::mem::take(&mut self.registry.write().vms);
        for vm in vms.values() {
            vm.terminate(&self.ctx);
        }
        for vm in vms.values() {
            if !vm.is_torn_down() {
                debug!("waiting for the runners of VM {} to leave", vm.id());
            }
            while !vm.is_torn_down() {
                self.ctx.hal.yield_now();
                core::hint::spin_loop();
            }
        }
        self.ctx.percpu.disable_all(&*self.ctx.hal);
        info!("virtualization disabled, {} VMs terminated", vms.len());
    }
}

impl<H: AxVmmHal> Drop for AxVmm<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
