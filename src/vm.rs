use alloc::{string::String, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axerrno::{ax_err, ax_err_type, AxError, AxResult};
use memory_addr::{PhysAddr, PAGE_SIZE_4K};
use spin::RwLock;

use crate::{
    control_block::VCpuSetup,
    exit::{FaultAccess, VCpuExitReport},
    mem::{memtype, GuestPhysAddr, MemType, MemoryRange},
    regs::RegisterState,
    vcpu::{AxVCpu, VCpuState},
    vmm::{RunParams, VmCreateParams, VmmContext},
    AxVmmHal, CallerId, VCpuId, VMId,
};

/// A virtual machine.
pub struct AxVm<H: AxVmmHal> {
    id: VMId,
    name: String,
    creator: CallerId,
    memory_ranges: Vec<MemoryRange>,
    memory_size_mb: usize,
    /// Root of the second-level page table built by the host.
    nested_root: PhysAddr,
    vcpus: RwLock<Vec<Arc<AxVCpu<H>>>>,
    /// Number of threads running a vcpu or copying guest memory.
    running: AtomicUsize,
    terminating: AtomicBool,
    torn_down: AtomicBool,
}

/// Keeps [`AxVm::running`] raised while a vcpu runs, and tears the VM down
/// when the last runner of a terminating VM leaves.
struct RunToken<'a, H: AxVmmHal> {
    vm: &'a AxVm<H>,
    ctx: &'a VmmContext<H>,
}

impl<H: AxVmmHal> Drop for RunToken<'_, H> {
    fn drop(&mut self) {
        if self.vm.running.fetch_sub(1, Ordering::SeqCst) == 1
            && self.vm.terminating.load(Ordering::SeqCst)
        {
            self.vm.teardown(self.ctx);
        }
    }
}

impl<H: AxVmmHal> AxVm<H> {
    /// Map the guest memory and create `vcpu_count` vcpus reset to `state`.
    /// Everything acquired is released again on failure.
    pub(crate) fn new(
        ctx: &VmmContext<H>,
        id: VMId,
        creator: CallerId,
        params: &VmCreateParams,
        memory_size_mb: usize,
        state: &RegisterState,
    ) -> AxResult<Self> {
        let nested_root = ctx.hal().map_guest_memory(id, &params.memory_ranges)?;
        let mut vcpus = Vec::with_capacity(params.vcpu_count);
        for vcpu_id in 0..params.vcpu_count {
            let setup = VCpuSetup {
                vm_id: id,
                vcpu_id,
                nested_root,
            };
            match AxVCpu::new(ctx, &setup, state) {
                Ok(vcpu) => vcpus.push(Arc::new(vcpu)),
                Err(e) => {
                    warn!("VM {}: creating vcpu {} failed: {:?}", id, vcpu_id, e);
                    for vcpu in &vcpus {
                        vcpu.deinit(ctx);
                    }
                    ctx.hal().unmap_guest_memory(id);
                    return Err(e);
                }
            }
        }
        Ok(Self {
            id,
            name: params.name.clone(),
            creator,
            memory_ranges: params.memory_ranges.clone(),
            memory_size_mb,
            nested_root,
            vcpus: RwLock::new(vcpus),
            running: AtomicUsize::new(0),
            terminating: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        })
    }

    pub const fn id(&self) -> VMId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn creator(&self) -> CallerId {
        self.creator
    }

    pub fn memory_ranges(&self) -> &[MemoryRange] {
        &self.memory_ranges
    }

    pub const fn memory_size_mb(&self) -> usize {
        self.memory_size_mb
    }

    pub fn vcpu_count(&self) -> usize {
        self.vcpus.read().len()
    }

    pub fn vcpu_states(&self) -> Vec<VCpuState> {
        self.vcpus.read().iter().map(|v| v.state()).collect()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub fn vcpu(&self, vcpu_id: VCpuId) -> AxResult<Arc<AxVCpu<H>>> {
        self.vcpus
            .read()
            .get(vcpu_id)
            .cloned()
            .ok_or_else(|| ax_err_type!(NotFound, format!("VM {} has no vcpu {vcpu_id}", self.id)))
    }

    pub(crate) fn setup_for(&self, vcpu_id: VCpuId) -> VCpuSetup {
        VCpuSetup {
            vm_id: self.id,
            vcpu_id,
            nested_root: self.nested_root,
        }
    }

    fn start_run<'a>(&'a self, ctx: &'a VmmContext<H>) -> RunToken<'a, H> {
        self.running.fetch_add(1, Ordering::SeqCst);
        RunToken { vm: self, ctx }
    }

    /// Run one of this VM's vcpus. A failed run terminates the whole VM.
    pub(crate) fn run_vcpu(&self, ctx: &VmmContext<H>, params: &RunParams) -> AxResult<VCpuExitReport> {
        let _token = self.start_run(ctx);
        if self.is_terminating() {
            return ax_err!(NotFound, format!("VM {} is terminating", self.id));
        }
        let vcpu = self.vcpu(params.vcpu_id)?;
        let ret = vcpu.run(ctx, self, params);
        if let Err(e) = &ret {
            if *e != AxError::ResourceBusy {
                error!("VM {}: vcpu {} failed: {:?}, terminating", self.id, vcpu.id(), e);
                self.terminate(ctx);
            }
        }
        ret
    }

    /// Run `f` on the `len` bytes of guest RAM at `gpa`. The bytes must stay
    /// within one page. A write to a page the guest never touched asks the
    /// host to back it first; a read of one fails with `BadAddress`.
    pub(crate) fn with_guest_page<R>(
        &self,
        ctx: &VmmContext<H>,
        gpa: GuestPhysAddr,
        len: usize,
        access: FaultAccess,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> AxResult<R> {
        let _token = self.start_run(ctx);
        if self.is_terminating() {
            return ax_err!(NotFound, format!("VM {} is terminating", self.id));
        }
        if memtype(&self.memory_ranges, gpa) != MemType::Regular {
            return ax_err!(InvalidInput, format!("{:?} is not guest RAM", gpa));
        }
        let offset = gpa.as_usize() & (PAGE_SIZE_4K - 1);
        if offset + len > PAGE_SIZE_4K {
            return ax_err!(InvalidInput, "guest memory access crosses a page");
        }

        let hal = ctx.hal();
        let page = GuestPhysAddr::from_usize(gpa.as_usize() - offset);
        let frame = match hal.translate_guest(self.id, page) {
            Some(frame) => Some(frame),
            None if access == FaultAccess::Write => {
                hal.resolve_fault(self.id, page, access)?;
                hal.translate_guest(self.id, page)
            }
            None => None,
        };
        let frame =
            frame.ok_or_else(|| ax_err_type!(BadAddress, format!("{:?} not present", page)))?;
        let va = hal.phys_to_virt(frame + offset);
        // SAFETY: the host keeps the frame mapped until `unmap_guest_memory`,
        // which cannot run while `_token` is held.
        let bytes = unsafe { core::slice::from_raw_parts_mut(va.as_mut_ptr(), len) };
        Ok(f(bytes))
    }

    /// Stop every vcpu. The VM is torn down now if none is running,
    /// otherwise by the last runner to leave.
    pub(crate) fn terminate(&self, ctx: &VmmContext<H>) {
        if self.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("VM {}: terminating", self.id);
        for vcpu in self.vcpus.read().iter() {
            if vcpu.request_terminate() {
                if let Some(cpu) = vcpu.last_cpu() {
                    ctx.hal().notify_cpu(cpu);
                }
            }
        }
        if self.running.load(Ordering::SeqCst) == 0 {
            self.teardown(ctx);
        }
    }

    /// Release every vcpu and the guest memory. Runs once.
    fn teardown(&self, ctx: &VmmContext<H>) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let vcpus = core::mem::take(&mut *self.vcpus.write());
        for vcpu in &vcpus {
            vcpu.mark_terminated();
            vcpu.deinit(ctx);
        }
        ctx.hal().unmap_guest_memory(self.id);
        info!("VM {} ({}) torn down", self.id, self.name);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}
