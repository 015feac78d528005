//! The run loop: enter the guest, dispatch exits, and decide whether to
//! resume or hand control back to the caller.

use core::sync::atomic::Ordering;

use axerrno::{ax_err, AxResult};

use crate::{
    control_block::{ControlBlock, ControlBlockOps, ExitContext},
    defs::{vector, RFLAGS_IF, RFLAGS_TF},
    exit::{EntryFailure, Event, ExitOutcome, ExitResolution, VCpuExitReason, VCpuExitReport},
    regs::{GuestRegs, RegMask},
    vcpu::{AxVCpu, VCpuInner, VCpuState},
    vm::AxVm,
    vmm::{RunParams, VmmContext},
    AxVmmHal,
};

impl<H: AxVmmHal> AxVCpu<H> {
    /// Drive the vcpu from `Stopped` until it needs the caller.
    pub(crate) fn run(
        &self,
        ctx: &VmmContext<H>,
        vm: &AxVm<H>,
        params: &RunParams,
    ) -> AxResult<VCpuExitReport> {
        if !self.transition(VCpuState::Stopped, VCpuState::Running) {
            return ax_err!(
                ResourceBusy,
                format!("vcpu {} is {:?}", self.id(), self.state())
            );
        }
        let ret = {
            let mut inner = self.inner.lock();
            self.run_locked(ctx, vm, &mut inner, params)
        };
        match ret {
            Ok(mut report) => {
                if report.reason == VCpuExitReason::Terminated
                    || !self.transition(VCpuState::Running, VCpuState::Stopped)
                {
                    self.transition(VCpuState::RequestTerminate, VCpuState::Terminated);
                    report.reason = VCpuExitReason::Terminated;
                    debug!("VM {} vcpu {}: stopped for termination", self.vm_id(), self.id());
                }
                Ok(report)
            }
            Err(e) => {
                self.mark_terminated();
                Err(e)
            }
        }
    }

    fn run_locked(
        &self,
        ctx: &VmmContext<H>,
        vm: &AxVm<H>,
        inner: &mut VCpuInner<H>,
        params: &RunParams,
    ) -> AxResult<VCpuExitReport> {
        let Some(mut cb) = inner.cb.take() else {
            return ax_err!(BadState, "vcpu is torn down");
        };
        Self::apply_resolution(&mut inner.regs, inner.pending_exit.take(), params.resume);
        // Keep the vector already queued; the caller offers the other again.
        match (inner.pending_irq, params.irq) {
            (Some(old), Some(new)) => warn!(
                "vcpu {}: irq {:#x} still pending, dropping {:#x}",
                self.id(),
                old,
                new
            ),
            (None, Some(vector)) => inner.pending_irq = Some(vector),
            _ => {}
        }
        let ret = self.cycle(ctx, vm, &mut cb, inner);
        inner.cb = Some(cb);
        ret
    }

    /// Load the control block, run, snapshot the registers and release it.
    fn cycle(
        &self,
        ctx: &VmmContext<H>,
        vm: &AxVm<H>,
        cb: &mut ControlBlock<H>,
        inner: &mut VCpuInner<H>,
    ) -> AxResult<VCpuExitReport> {
        cb.load(ctx)?;
        let report = self.drive(ctx, vm, cb, inner).and_then(|reason| {
            Ok(VCpuExitReport {
                reason,
                irq_ready: inner.irq_ready,
                regs: cb.read_registers(RegMask::ALL, &inner.regs)?,
            })
        });
        cb.release_or_poison(ctx)?;
        report
    }

    /// Complete the exit the caller was helping with.
    fn apply_resolution(
        regs: &mut GuestRegs,
        pending: Option<VCpuExitReason>,
        resume: Option<ExitResolution>,
    ) {
        match (pending, resume) {
            (Some(VCpuExitReason::Io(io)), Some(ExitResolution::IoIn { data })) if io.is_in => {
                let mask = io.mask();
                regs.gprs.rax = (regs.gprs.rax & !mask) | (data as u64 & mask);
            }
            (_, Some(ExitResolution::IoIn { .. })) => {
                warn!("I/O result supplied without a pending port read, ignored");
            }
            _ => {}
        }
    }

    fn drive(
        &self,
        ctx: &VmmContext<H>,
        vm: &AxVm<H>,
        cb: &mut ControlBlock<H>,
        inner: &mut VCpuInner<H>,
    ) -> AxResult<VCpuExitReason> {
        let hal = &**ctx.hal();
        let ectx = ExitContext {
            hal,
            vm_id: self.vm_id(),
            vcpu_id: self.id(),
            ranges: vm.memory_ranges(),
        };
        let mut reloaded = true;

        loop {
            if self.state() == VCpuState::RequestTerminate {
                return Ok(VCpuExitReason::Terminated);
            }
            if hal.caller_must_stop() {
                return Ok(VCpuExitReason::None);
            }

            let cpu = hal.current_cpu();
            let moved = self.last_cpu.swap(cpu, Ordering::AcqRel) != cpu;
            cb.prepare_entry(moved || reloaded)?;
            reloaded = false;
            self.inject_pending(cb, inner)?;

            if let Err(failure) = cb.enter(&mut inner.regs) {
                let rip = cb.rip().unwrap_or(0);
                match failure {
                    EntryFailure::InvalidControlBlock => error!(
                        "VM {} vcpu {}: entry with an invalid control block, rip {:#x}",
                        self.vm_id(),
                        self.id(),
                        rip
                    ),
                    EntryFailure::ValidControlBlock { code } => error!(
                        "VM {} vcpu {}: entry failed with error {}, rip {:#x}",
                        self.vm_id(),
                        self.id(),
                        code,
                        rip
                    ),
                }
                return ax_err!(BadState, "VM entry failed");
            }

            let action = cb.handle_exit(&ectx, &mut inner.regs)?;
            inner.irq_ready = cb.rflags()? & RFLAGS_IF != 0;
            trace!(
                "VM {} vcpu {}: exit {:#x} -> {:?}",
                self.vm_id(),
                self.id(),
                cb.exit_reason(),
                action
            );

            match action.outcome {
                ExitOutcome::Handled => {}
                ExitOutcome::InjectAndRetry(event) => inner.pending_event = Some(event),
                ExitOutcome::NeedHelp(reason) => {
                    if action.advance_rip {
                        Self::advance_rip(cb, inner)?;
                    }
                    debug!("VM {} vcpu {}: needs help with {:?}", self.vm_id(), self.id(), reason);
                    inner.pending_exit = Some(reason);
                    return Ok(reason);
                }
                ExitOutcome::Fatal => {
                    error!(
                        "VM {} vcpu {}: fatal exit {:#x} at rip {:#x}",
                        self.vm_id(),
                        self.id(),
                        cb.exit_reason(),
                        cb.rip().unwrap_or(0)
                    );
                    return ax_err!(BadState, "fatal VM exit");
                }
            }
            if action.advance_rip {
                Self::advance_rip(cb, inner)?;
            }

            if self.intr_asserted.load(Ordering::Acquire)
                && inner.pending_irq.is_none()
                && cb.interruptible()?
            {
                inner.pending_exit = Some(VCpuExitReason::IrqReady);
                return Ok(VCpuExitReason::IrqReady);
            }

            if hal.should_yield() {
                cb.release_or_poison(ctx)?;
                hal.yield_now();
                cb.load(ctx)?;
                reloaded = true;
            }
        }
    }

    /// Step over the instruction that exited, raising `#DB` if the guest
    /// is single-stepping.
    fn advance_rip(cb: &mut ControlBlock<H>, inner: &mut VCpuInner<H>) -> AxResult {
        let len = cb.exit_instruction_len()?;
        let rip = cb.rip()?;
        cb.set_rip(rip.wrapping_add(len))?;
        if cb.rflags()? & RFLAGS_TF != 0 {
            inner.pending_event = Some(Event::exception(vector::DB));
        }
        Ok(())
    }

    /// Inject what is pending and arm the interrupt window if an interrupt
    /// has to wait.
    fn inject_pending(&self, cb: &mut ControlBlock<H>, inner: &mut VCpuInner<H>) -> AxResult {
        if let Some(event) = inner.pending_event.take() {
            cb.inject_event(event)?;
        } else if let Some(vector) = inner.pending_irq {
            if cb.interruptible()? {
                cb.inject_event(Event::Interrupt { vector })?;
                inner.pending_irq = None;
            }
        }
        let window = inner.pending_irq.is_some()
            || (self.intr_asserted.load(Ordering::Acquire) && !cb.interruptible()?);
        cb.set_interrupt_window(window)
    }
}
