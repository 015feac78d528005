// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVmm - VM and virtual CPU management for x86 hardware virtualization.
//!
//! This crate owns the VMs of a hypervisor and drives their virtual CPUs on
//! Intel VMX or AMD SVM. The host kernel plugs in through [`AxVmmHal`]:
//! memory, CPU identity, the single virtualization instructions and the
//! guest address-space service.
//!
//! # Features
//!
//! - A registry of VMs with authorization-aware lookup
//! - Lock-free vcpu lifecycle (Stopped → Running → Stopped, with termination)
//! - VMCS and VMCB programming behind one control-block interface
//! - Capability negotiation for the VMX control fields
//! - VPID/ASID allocation
//! - A run loop that dispatches VM exits and returns to the caller when it
//!   needs help, e.g. for port I/O to an emulated device
//!
//! [`AxVmm`] is the entry point: it enables virtualization on construction
//! and disables it on [`AxVmm::shutdown`] or drop.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

mod control_block; // Family independent control block interface
mod defs; // Architectural constants
mod emulate; // CPUID, MSR, XSETBV and port I/O completion
mod exit; // Exit reasons, outcomes and injected events
mod frame; // Host frame ownership
mod hal; // Hardware abstraction layer interfaces
mod mem; // Guest memory ranges
mod percpu; // Per-CPU virtualization state
mod regs; // Register state and the software register cache
mod run; // The run loop
mod svm; // AMD SVM
mod test; // Scenario tests against a mock host
mod vcpu; // Vcpu lifecycle
mod vm; // VM lifetime
mod vmm; // Subsystem context and command surface
mod vmx; // Intel VMX
mod vpid; // VPID/ASID allocator

pub use control_block::{ControlBlockOps, ExitContext, VCpuSetup};
pub use emulate::{PCI_IO_BAR_BASE, PCI_IO_BAR_END};
pub use exit::{
    EntryFailure, Event, ExitAction, ExitOutcome, ExitResolution, FaultAccess, IoAccess,
    VCpuExitReason, VCpuExitReport,
};
pub use hal::{AxVmmHal, CpuidResult, HostState, VirtMode};
pub use mem::{
    check_mem_ranges, memtype, GuestPhysAddr, MemType, MemoryRange, MAX_MEM_RANGES,
    MAX_VM_MEM_SIZE_MB, MMIO_BASE, MMIO_END,
};
pub use percpu::{AxPerCpu, AxPerCpuTable};
pub use regs::{
    ControlRegs, DebugRegs, DescTable, GeneralRegisters, GuestMsrs, GuestRegs, RegMask,
    RegisterState, SegReg, Segment, SEG_AR_UNUSABLE,
};
pub use vcpu::{AxVCpu, VCpuState};
pub use vm::AxVm;
pub use vmm::{
    AxVmm, RunParams, VmCreateParams, VmCreated, VmInfoResult, VmSummary, VmmContext,
    MAX_NAME_LEN, MAX_VCPUS_PER_VM,
};
pub use vmx::{compute_ctrl, ControlClass};
pub use vpid::VpidAllocator;

/// Identifies a VM.
pub type VMId = usize;
/// Index of a vcpu within its VM.
pub type VCpuId = usize;
/// Identity of the process issuing a request.
pub type CallerId = usize;
