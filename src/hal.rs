use axerrno::{ax_err, AxResult};
use memory_addr::{PhysAddr, VirtAddr};

use crate::{
    exit::{EntryFailure, FaultAccess},
    mem::{GuestPhysAddr, MemoryRange},
    regs::GuestRegs,
    CallerId, VMId,
};

/// Hardware virtualization flavour of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtMode {
    /// Intel VMX with shadow paging.
    Vmx,
    /// Intel VMX with extended page tables.
    Ept,
    /// AMD SVM with shadow paging.
    Svm,
    /// AMD SVM with nested paging.
    Rvi,
}

impl VirtMode {
    pub const fn is_vmx(self) -> bool {
        matches!(self, VirtMode::Vmx | VirtMode::Ept)
    }

    /// Whether guest physical memory is translated by hardware.
    pub const fn has_nested_paging(self) -> bool {
        matches!(self, VirtMode::Ept | VirtMode::Rvi)
    }
}

/// Output of the `CPUID` instruction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Host state loaded on every VM exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HostState {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub tr: u16,
    pub gdtr_base: u64,
    pub idtr_base: u64,
    pub tr_base: u64,
    pub efer: u64,
}

/// The interfaces which the underlying host kernel must implement.
///
/// The VMX and SVM primitives stand for single instructions; their default
/// implementations report that the family is unsupported, so a host only
/// implements the family it runs on.
pub trait AxVmmHal: Send + Sync + 'static {
    /// Allocate `count` physically contiguous, zeroed 4K frames.
    fn alloc_frames(&self, count: usize) -> Option<PhysAddr>;

    /// Free frames returned by [`AxVmmHal::alloc_frames`].
    fn dealloc_frames(&self, paddr: PhysAddr, count: usize);

    /// Converts a host physical address to a host virtual address.
    fn phys_to_virt(&self, paddr: PhysAddr) -> VirtAddr;

    /// The virtualization family this host runs, if any.
    fn virt_mode(&self) -> Option<VirtMode>;

    /// Read a host MSR, including the VMX capability MSRs.
    fn rdmsr(&self, msr: u32) -> u64;

    /// Execute `CPUID` on the calling CPU.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    /// Host state of the calling CPU.
    fn host_state(&self) -> HostState;

    /// Number of host CPUs.
    fn cpu_count(&self) -> usize;

    /// Index of the calling CPU.
    fn current_cpu(&self) -> usize;

    /// Turn on VMX/SVM operation on `cpu`.
    fn hardware_enable(&self, cpu: usize) -> AxResult;

    /// Turn off VMX/SVM operation on `cpu`.
    fn hardware_disable(&self, cpu: usize) -> AxResult;

    /// Whether the scheduler wants this CPU back.
    fn should_yield(&self) -> bool {
        false
    }

    /// Give the CPU to the scheduler for a while.
    fn yield_now(&self) {}

    /// Whether the thread driving a vcpu was asked to stop, e.g. by a signal.
    fn caller_must_stop(&self) -> bool {
        false
    }

    /// Best-effort kick of `cpu` so it exits guest mode soon.
    fn notify_cpu(&self, _cpu: usize) {}

    /// Run the host handler for an external interrupt taken in guest mode.
    fn handle_host_irq(&self, vector: u8);

    /// Build the guest physical address space of a new VM and return the
    /// root of its second-level page table.
    fn map_guest_memory(&self, vm_id: VMId, ranges: &[MemoryRange]) -> AxResult<PhysAddr>;

    /// Tear down what [`AxVmmHal::map_guest_memory`] built.
    fn unmap_guest_memory(&self, vm_id: VMId);

    /// Resolve a second-level page fault inside guest RAM.
    fn resolve_fault(&self, vm_id: VMId, gpa: GuestPhysAddr, access: FaultAccess) -> AxResult;

    /// Host frame backing the guest page at `gpa`, if the page is present.
    fn translate_guest(&self, vm_id: VMId, gpa: GuestPhysAddr) -> Option<PhysAddr>;

    /// Whether `caller` may operate on a VM created by `creator`.
    fn may_access(&self, caller: CallerId, creator: CallerId) -> bool {
        caller == creator
    }

    /// `VMPTRLD`: make `vmcs` current on the calling CPU.
    fn vmptrld(&self, _vmcs: PhysAddr) -> AxResult {
        ax_err!(Unsupported)
    }

    /// `VMCLEAR`: flush `vmcs` to memory and make it inactive.
    fn vmclear(&self, _vmcs: PhysAddr) -> AxResult {
        ax_err!(Unsupported)
    }

    /// `VMREAD` from the current VMCS.
    fn vmread(&self, _field: u32) -> AxResult<u64> {
        ax_err!(Unsupported)
    }

    /// `VMWRITE` to the current VMCS.
    fn vmwrite(&self, _field: u32, _value: u64) -> AxResult {
        ax_err!(Unsupported)
    }

    /// `INVVPID` single-context invalidation.
    fn invvpid(&self, _vpid: u16) {}

    /// `INVEPT` single-context invalidation.
    fn invept(&self, _eptp: u64) {}

    /// `VMLAUNCH` (or `VMRESUME` if `launched`) on the current VMCS,
    /// switching the registers in `regs` around the guest run.
    fn vmx_enter_guest(&self, _launched: bool, _regs: &mut GuestRegs) -> Result<(), EntryFailure> {
        Err(EntryFailure::InvalidControlBlock)
    }

    /// `VMRUN` on the VMCB at `vmcb`, switching the registers in `regs`
    /// around the guest run.
    fn svm_enter_guest(&self, _vmcb: PhysAddr, _regs: &mut GuestRegs) -> Result<(), EntryFailure> {
        Err(EntryFailure::InvalidControlBlock)
    }
}
