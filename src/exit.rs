use crate::{mem::GuestPhysAddr, regs::RegisterState};

/// Access that caused a nested page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAccess {
    Read,
    Write,
    Execute,
}

/// A decoded port I/O exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccess {
    /// Port number.
    pub port: u16,
    /// Access size in bytes: 1, 2 or 4.
    pub size: u8,
    /// `IN` if true, `OUT` otherwise.
    pub is_in: bool,
    /// String instruction (`INS`/`OUTS`).
    pub string: bool,
    /// `REP` prefixed.
    pub rep: bool,
    /// Value of RAX at the exit, masked to `size` for `OUT`.
    pub data: u32,
}

impl IoAccess {
    /// Mask covering the low `size` bytes.
    pub const fn mask(&self) -> u64 {
        match self.size {
            1 => 0xff,
            2 => 0xffff,
            _ => 0xffff_ffff,
        }
    }
}

/// Why the run loop handed control back to its caller.
///
/// Everything except [`VCpuExitReason::None`] and
/// [`VCpuExitReason::Terminated`] asks the caller to act before resuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum VCpuExitReason {
    /// The run ended without a pending request.
    None,
    /// The VM was terminated while this vcpu was running.
    Terminated,
    /// The guest executed `HLT`.
    Halt,
    /// Port I/O to a device emulated by the caller. For `IN`, the result is
    /// supplied with [`ExitResolution::IoIn`] on the next run.
    Io(IoAccess),
    /// Access to the MMIO window.
    Mmio {
        gpa: GuestPhysAddr,
        access: FaultAccess,
    },
    /// Triple fault or shutdown: the guest is dead.
    Shutdown,
    /// An interrupt is asserted and the guest can now take it.
    IrqReady,
}

/// The caller's answer to a previous exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitResolution {
    /// Result of a port `IN`.
    IoIn { data: u32 },
    /// Anything else: nothing to write back.
    Acknowledged,
}

/// What [`AxVmm::run_vcpu`](crate::AxVmm::run_vcpu) returns on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VCpuExitReport {
    pub reason: VCpuExitReason,
    /// Guest RFLAGS.IF at the last exit.
    pub irq_ready: bool,
    /// Full guest register state, captured before the control block was
    /// released.
    pub regs: RegisterState,
}

/// An event to inject on the next entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Hardware exception, with its error code if it takes one.
    Exception { vector: u8, error_code: Option<u32> },
    /// External interrupt.
    Interrupt { vector: u8 },
}

impl Event {
    /// An exception with a zero error code when the vector requires one.
    pub fn exception(vector: u8) -> Self {
        let error_code = crate::defs::exception_has_error_code(vector).then_some(0);
        Event::Exception { vector, error_code }
    }

    /// Interruption-information encoding shared by VMX entry and SVM
    /// `EVENTINJ`: vector, type, error-code-valid and valid bits.
    pub fn encode(&self) -> (u32, Option<u32>) {
        const VALID: u32 = 1 << 31;
        const ERROR_CODE_VALID: u32 = 1 << 11;
        const TYPE_EXTERNAL: u32 = 0 << 8;
        const TYPE_EXCEPTION: u32 = 3 << 8;
        match *self {
            Event::Interrupt { vector } => (VALID | TYPE_EXTERNAL | vector as u32, None),
            Event::Exception { vector, error_code } => {
                let mut info = VALID | TYPE_EXCEPTION | vector as u32;
                if error_code.is_some() {
                    info |= ERROR_CODE_VALID;
                }
                (info, error_code)
            }
        }
    }
}

/// What an exit handler decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Resolved by the host; resume the guest.
    Handled,
    /// The caller must act before the guest can continue.
    NeedHelp(VCpuExitReason),
    /// Inject an exception and resume.
    InjectAndRetry(Event),
    /// Unrecoverable: the VM is terminated.
    Fatal,
}

/// A handler's outcome plus whether the exiting instruction retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitAction {
    pub outcome: ExitOutcome,
    pub advance_rip: bool,
}

impl ExitAction {
    pub const fn handled(advance_rip: bool) -> Self {
        Self {
            outcome: ExitOutcome::Handled,
            advance_rip,
        }
    }

    pub const fn need_help(reason: VCpuExitReason, advance_rip: bool) -> Self {
        Self {
            outcome: ExitOutcome::NeedHelp(reason),
            advance_rip,
        }
    }

    pub const fn inject(event: Event) -> Self {
        Self {
            outcome: ExitOutcome::InjectAndRetry(event),
            advance_rip: false,
        }
    }

    pub const fn fatal() -> Self {
        Self {
            outcome: ExitOutcome::Fatal,
            advance_rip: false,
        }
    }
}

/// Failure of the hardware entry primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFailure {
    /// The control block itself is unusable (VMfailInvalid).
    InvalidControlBlock,
    /// The control block is valid but its contents were rejected; `code`
    /// is the VM-instruction error number.
    ValidControlBlock { code: u32 },
}
