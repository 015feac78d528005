use axerrno::{AxError, AxResult};
use memory_addr::PhysAddr;

use crate::{
    exit::{EntryFailure, Event, ExitAction},
    mem::MemoryRange,
    regs::{GuestRegs, RegMask, RegisterState},
    svm::SvmVcpu,
    vmm::VmmContext,
    vmx::VmxVcpu,
    AxVmmHal, VCpuId, VMId,
};

/// Identity a control block is reset against.
#[derive(Debug, Clone, Copy)]
pub struct VCpuSetup {
    pub vm_id: VMId,
    pub vcpu_id: VCpuId,
    /// Root of the VM's second-level page table.
    pub nested_root: PhysAddr,
}

/// What an exit handler may consult.
pub struct ExitContext<'a, H: AxVmmHal> {
    pub hal: &'a H,
    pub vm_id: VMId,
    pub vcpu_id: VCpuId,
    pub ranges: &'a [MemoryRange],
}

/// Operations every hardware family implements on its control block.
///
/// Methods documented as requiring a loaded block may only be called
/// between [`ControlBlockOps::load`] and [`ControlBlockOps::release`] on the
/// same CPU.
pub trait ControlBlockOps<H: AxVmmHal> {
    /// Host physical address of the control block.
    fn paddr(&self) -> PhysAddr;

    /// Make the block current on the calling CPU.
    fn load(&mut self, ctx: &VmmContext<H>) -> AxResult;

    /// Flush the block and make it inactive on the calling CPU.
    fn release(&mut self, ctx: &VmmContext<H>) -> AxResult;

    /// Program intercepts, controls and `state`. Nothing is written if the
    /// request is rejected. Requires a loaded block.
    fn reset_to_poweron(
        &mut self,
        ctx: &VmmContext<H>,
        setup: &VCpuSetup,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult;

    /// Reject `state` if the classes in `mask` violate fixed bits.
    fn check_registers(&self, mask: RegMask, state: &RegisterState) -> AxResult;

    /// Requires a loaded block.
    fn read_registers(&self, mask: RegMask, cache: &GuestRegs) -> AxResult<RegisterState>;

    /// Requires a loaded block and a state accepted by
    /// [`ControlBlockOps::check_registers`].
    fn write_registers(
        &mut self,
        mask: RegMask,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult;

    /// Release everything `init` and `reset_to_poweron` acquired.
    fn deinit(&mut self, ctx: &VmmContext<H>);

    /// Bring the block up to date before an entry. `moved` is set when the
    /// vcpu runs on a different CPU than last time or was just loaded.
    fn prepare_entry(&mut self, moved: bool) -> AxResult;

    fn rip(&self) -> AxResult<u64>;

    fn set_rip(&mut self, rip: u64) -> AxResult;

    fn rflags(&self) -> AxResult<u64>;

    /// Whether an external interrupt can be delivered right now.
    fn interruptible(&self) -> AxResult<bool>;

    fn inject_event(&mut self, event: Event) -> AxResult;

    /// Arm or disarm the exit taken once the guest can accept an interrupt.
    fn set_interrupt_window(&mut self, armed: bool) -> AxResult;

    /// Run the guest until the next exit.
    fn enter(&mut self, cache: &mut GuestRegs) -> Result<(), EntryFailure>;

    /// Dispatch the exit that just happened.
    fn handle_exit(&mut self, ectx: &ExitContext<H>, cache: &mut GuestRegs) -> AxResult<ExitAction>;

    /// Length of the instruction that caused the last exit.
    fn exit_instruction_len(&self) -> AxResult<u64>;

    /// Raw exit reason of the last exit, for diagnostics.
    fn exit_reason(&self) -> u64;
}

/// A control block of whichever family the host runs.
pub enum ControlBlock<H: AxVmmHal> {
    Vmx(VmxVcpu<H>),
    Svm(SvmVcpu<H>),
}

macro_rules! dispatch {
    ($self:expr, $cb:ident => $body:expr) => {
        match $self {
            ControlBlock::Vmx($cb) => $body,
            ControlBlock::Svm($cb) => $body,
        }
    };
}

impl<H: AxVmmHal> ControlBlock<H> {
    /// Allocate a control block for the family the context was set up for.
    pub fn new(ctx: &VmmContext<H>) -> AxResult<Self> {
        if ctx.mode().is_vmx() {
            VmxVcpu::new(ctx).map(ControlBlock::Vmx)
        } else {
            SvmVcpu::new(ctx).map(ControlBlock::Svm)
        }
    }

    /// Run `f` with the block loaded, releasing it afterwards whatever `f`
    /// returned. A failed release poisons the subsystem.
    pub fn with_loaded<T>(
        &mut self,
        ctx: &VmmContext<H>,
        f: impl FnOnce(&mut Self) -> AxResult<T>,
    ) -> AxResult<T> {
        self.load(ctx)?;
        let ret = f(self);
        self.release_or_poison(ctx)?;
        ret
    }

    /// [`ControlBlockOps::release`], poisoning the subsystem on failure.
    pub fn release_or_poison(&mut self, ctx: &VmmContext<H>) -> AxResult {
        if let Err(e) = self.release(ctx) {
            error!(
                "failed to release control block {:#x}: {:?}",
                self.paddr(),
                e
            );
            ctx.poison();
            return Err(AxError::BadState);
        }
        Ok(())
    }
}

impl<H: AxVmmHal> ControlBlockOps<H> for ControlBlock<H> {
    fn paddr(&self) -> PhysAddr {
        dispatch!(self, cb => cb.paddr())
    }

    fn load(&mut self, ctx: &VmmContext<H>) -> AxResult {
        dispatch!(self, cb => cb.load(ctx))
    }

    fn release(&mut self, ctx: &VmmContext<H>) -> AxResult {
        dispatch!(self, cb => cb.release(ctx))
    }

    fn reset_to_poweron(
        &mut self,
        ctx: &VmmContext<H>,
        setup: &VCpuSetup,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult {
        dispatch!(self, cb => cb.reset_to_poweron(ctx, setup, state, cache))
    }

    fn check_registers(&self, mask: RegMask, state: &RegisterState) -> AxResult {
        dispatch!(self, cb => cb.check_registers(mask, state))
    }

    fn read_registers(&self, mask: RegMask, cache: &GuestRegs) -> AxResult<RegisterState> {
        dispatch!(self, cb => cb.read_registers(mask, cache))
    }

    fn write_registers(
        &mut self,
        mask: RegMask,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult {
        dispatch!(self, cb => cb.write_registers(mask, state, cache))
    }

    fn deinit(&mut self, ctx: &VmmContext<H>) {
        dispatch!(self, cb => cb.deinit(ctx))
    }

    fn prepare_entry(&mut self, moved: bool) -> AxResult {
        dispatch!(self, cb => cb.prepare_entry(moved))
    }

    fn rip(&self) -> AxResult<u64> {
        dispatch!(self, cb => cb.rip())
    }

    fn set_rip(&mut self, rip: u64) -> AxResult {
        dispatch!(self, cb => cb.set_rip(rip))
    }

    fn rflags(&self) -> AxResult<u64> {
        dispatch!(self, cb => cb.rflags())
    }

    fn interruptible(&self) -> AxResult<bool> {
        dispatch!(self, cb => cb.interruptible())
    }

    fn inject_event(&mut self, event: Event) -> AxResult {
        dispatch!(self, cb => cb.inject_event(event))
    }

    fn set_interrupt_window(&mut self, armed: bool) -> AxResult {
        dispatch!(self, cb => cb.set_interrupt_window(armed))
    }

    fn enter(&mut self, cache: &mut GuestRegs) -> Result<(), EntryFailure> {
        dispatch!(self, cb => cb.enter(cache))
    }

    fn handle_exit(&mut self, ectx: &ExitContext<H>, cache: &mut GuestRegs) -> AxResult<ExitAction> {
        dispatch!(self, cb => cb.handle_exit(ectx, cache))
    }

    fn exit_instruction_len(&self) -> AxResult<u64> {
        dispatch!(self, cb => cb.exit_instruction_len())
    }

    fn exit_reason(&self) -> u64 {
        dispatch!(self, cb => cb.exit_reason())
    }
}
