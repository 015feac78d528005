use core::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use axerrno::{ax_err, ax_err_type, AxResult};
use spin::{Mutex, MutexGuard};

use crate::{
    control_block::{ControlBlock, ControlBlockOps, VCpuSetup},
    exit::{Event, VCpuExitReason},
    regs::{GuestRegs, RegMask, RegisterState},
    vmm::VmmContext,
    AxVmmHal, VCpuId, VMId,
};

const NO_CPU: usize = usize::MAX;

/// The state of a virtual CPU.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// Idle. The initial state, and the state between runs.
    Stopped = 0,
    /// A thread is inside the run loop.
    Running = 1,
    /// Terminated while running; the run loop stops at its next check.
    RequestTerminate = 2,
    /// Terminal.
    Terminated = 3,
}

impl VCpuState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Stopped,
            1 => Self::Running,
            2 => Self::RequestTerminate,
            _ => Self::Terminated,
        }
    }

    /// Whether `from → to` is one of the lifecycle transitions.
    pub const fn can_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Stopped, Self::Running)
                | (Self::Running, Self::RequestTerminate)
                | (Self::Stopped, Self::Terminated)
                | (Self::Running, Self::Stopped)
                | (Self::RequestTerminate, Self::Terminated)
        )
    }
}

/// The part of [`AxVCpu`] owned by whoever holds its lock: the run loop
/// while `Running`, a register operation while `Stopped`.
pub(crate) struct VCpuInner<H: AxVmmHal> {
    /// `None` once the VM is torn down.
    pub cb: Option<ControlBlock<H>>,
    pub regs: GuestRegs,
    /// Exception to deliver on the next entry.
    pub pending_event: Option<Event>,
    /// Host interrupt vector waiting for the guest to become interruptible.
    pub pending_irq: Option<u8>,
    /// The exit the caller was last asked to help with.
    pub pending_exit: Option<VCpuExitReason>,
    /// Guest RFLAGS.IF at the last exit.
    pub irq_ready: bool,
}

/// A virtual CPU.
///
/// The state is changed only by compare-and-swap, without a lock, so a
/// terminate request never waits for a running vcpu. Everything else is
/// behind `inner`.
pub struct AxVCpu<H: AxVmmHal> {
    id: VCpuId,
    vm_id: VMId,
    state: AtomicU8,
    /// Interrupt line raised by the caller.
    pub(crate) intr_asserted: AtomicBool,
    /// Host CPU the control block was last loaded on.
    pub(crate) last_cpu: AtomicUsize,
    pub(crate) inner: Mutex<VCpuInner<H>>,
}

impl<H: AxVmmHal> AxVCpu<H> {
    /// Create a vcpu and reset it to `state`.
    pub(crate) fn new(ctx: &VmmContext<H>, setup: &VCpuSetup, state: &RegisterState) -> AxResult<Self> {
        let vcpu = Self {
            id: setup.vcpu_id,
            vm_id: setup.vm_id,
            state: AtomicU8::new(VCpuState::Stopped as u8),
            intr_asserted: AtomicBool::new(false),
            last_cpu: AtomicUsize::new(NO_CPU),
            inner: Mutex::new(VCpuInner {
                cb: Some(ControlBlock::new(ctx)?),
                regs: GuestRegs::default(),
                pending_event: None,
                pending_irq: None,
                pending_exit: None,
                irq_ready: false,
            }),
        };
        if let Err(e) = vcpu.reset(ctx, setup, state) {
            vcpu.deinit(ctx);
            return Err(e);
        }
        Ok(vcpu)
    }

    pub const fn id(&self) -> VCpuId {
        self.id
    }

    pub const fn vm_id(&self) -> VMId {
        self.vm_id
    }

    pub fn state(&self) -> VCpuState {
        VCpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Host CPU the vcpu last ran on.
    pub fn last_cpu(&self) -> Option<usize> {
        match self.last_cpu.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    /// Atomically move from `from` to `to`. Fails without changing anything
    /// if the vcpu is not in `from` or the pair is not a lifecycle transition.
    pub fn transition(&self, from: VCpuState, to: VCpuState) -> bool {
        VCpuState::can_transition(from, to)
            && self
                .state
                .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    /// Ask the vcpu to terminate. Returns `true` if it was running and will
    /// stop at its next check point.
    pub(crate) fn request_terminate(&self) -> bool {
        loop {
            match self.state() {
                VCpuState::Stopped => {
                    if self.transition(VCpuState::Stopped, VCpuState::Terminated) {
                        debug!("VM {} vcpu {}: terminated", self.vm_id, self.id);
                        return false;
                    }
                }
                VCpuState::Running => {
                    if self.transition(VCpuState::Running, VCpuState::RequestTerminate) {
                        debug!("VM {} vcpu {}: terminate requested", self.vm_id, self.id);
                        return true;
                    }
                }
                VCpuState::RequestTerminate | VCpuState::Terminated => return false,
            }
        }
    }

    /// Force the terminal state after an unrecoverable run failure.
    pub(crate) fn mark_terminated(&self) {
        self.state.store(VCpuState::Terminated as u8, Ordering::Release);
    }

    pub fn set_interrupt_line(&self, asserted: bool) {
        self.intr_asserted.store(asserted, Ordering::Release);
    }

    /// Lock the vcpu for a register operation, which is only legal while
    /// it is stopped.
    fn lock_stopped(&self) -> AxResult<MutexGuard<'_, VCpuInner<H>>> {
        let busy = || {
            ax_err_type!(
                ResourceBusy,
                format!("vcpu {} is {:?}", self.id, self.state())
            )
        };
        if self.state() != VCpuState::Stopped {
            return Err(busy());
        }
        let inner = self.inner.try_lock().ok_or_else(busy)?;
        if self.state() != VCpuState::Stopped {
            return Err(busy());
        }
        Ok(inner)
    }

    /// Program the control block with `state` and drop every pending event.
    pub(crate) fn reset(
        &self,
        ctx: &VmmContext<H>,
        setup: &VCpuSetup,
        state: &RegisterState,
    ) -> AxResult {
        let mut guard = self.lock_stopped()?;
        let inner = &mut *guard;
        let cb = inner
            .cb
            .as_mut()
            .ok_or_else(|| ax_err_type!(BadState, "vcpu is torn down"))?;
        let mut regs = GuestRegs::default();
        cb.with_loaded(ctx, |cb| cb.reset_to_poweron(ctx, setup, state, &mut regs))?;
        inner.regs = regs;
        inner.pending_event = None;
        inner.pending_irq = None;
        inner.pending_exit = None;
        inner.irq_ready = state.rflags & crate::defs::RFLAGS_IF != 0;
        debug!("VM {} vcpu {}: reset, rip {:#x}", self.vm_id, self.id, state.rip);
        Ok(())
    }

    pub(crate) fn read_registers(&self, ctx: &VmmContext<H>, mask: RegMask) -> AxResult<RegisterState> {
        let mut guard = self.lock_stopped()?;
        let inner = &mut *guard;
        let regs = &inner.regs;
        match inner.cb.as_mut() {
            Some(cb) => cb.with_loaded(ctx, |cb| cb.read_registers(mask, regs)),
            None => ax_err!(BadState, "vcpu is torn down"),
        }
    }

    pub(crate) fn write_registers(
        &self,
        ctx: &VmmContext<H>,
        mask: RegMask,
        state: &RegisterState,
    ) -> AxResult {
        let mut guard = self.lock_stopped()?;
        let inner = &mut *guard;
        let regs = &mut inner.regs;
        let Some(cb) = inner.cb.as_mut() else {
            return ax_err!(BadState, "vcpu is torn down");
        };
        cb.check_registers(mask, state)?;
        cb.with_loaded(ctx, |cb| cb.write_registers(mask, state, regs))
    }

    /// Release the control block and everything it holds.
    pub(crate) fn deinit(&self, ctx: &VmmContext<H>) {
        let mut inner = self.inner.lock();
        if let Some(mut cb) = inner.cb.take() {
            cb.deinit(ctx);
            trace!("VM {} vcpu {}: control block {:#x} freed", self.vm_id, self.id, cb.paddr());
        }
    }
}
