//! Instructions the host completes on the guest's behalf, shared by both families.

use bit_field::BitField;

use crate::{
    control_block::ExitContext,
    defs::{msr, EFER_GUEST_BITS, EFER_LMA, EFER_LME, XCR0_AVX, XCR0_SSE, XCR0_X87},
    exit::{Event, ExitAction, FaultAccess, IoAccess, VCpuExitReason},
    hal::{AxVmmHal, CpuidResult},
    mem::{memtype, GuestPhysAddr, MemType},
    regs::GuestRegs,
};

/// First port of the PCI I/O BAR window.
pub const PCI_IO_BAR_BASE: u16 = 0x1000;
/// Last port of the PCI I/O BAR window.
pub const PCI_IO_BAR_END: u16 = 0xffff;

const HV_SIGNATURE: &[u8; 12] = b"AxVmmAxVmmHv";
const HV_MAX_LEAF: u32 = 0x4000_0000;

// CPUID.1:ECX
const CPUID1_ECX_HIDDEN: &[usize] = &[2, 3, 4, 5, 6, 7, 8, 10, 11, 14, 15, 17, 18, 21, 24];
const CPUID1_ECX_HYPERVISOR: usize = 31;
// CPUID.1:EDX
const CPUID1_EDX_HIDDEN: &[usize] = &[4, 9, 12, 18, 21, 22, 27, 28, 29, 31];
// CPUID.(7,0):EBX
const CPUID7_EBX_HIDDEN: &[usize] = &[2, 4, 10, 11, 12, 14, 22, 25];
// CPUID.80000001h:ECX SVM
const CPUID_EXT1_ECX_SVM: usize = 2;

fn hide(mut value: u32, bits: &[usize]) -> u32 {
    for &bit in bits {
        value.set_bit(bit, false);
    }
    value
}

/// The `CPUID` result the guest sees on vcpu `vcpu_id`.
pub fn cpuid<H: AxVmmHal>(hal: &H, vcpu_id: usize, leaf: u32, subleaf: u32) -> CpuidResult {
    match leaf {
        0x0 | 0xd => hal.cpuid(leaf, subleaf),
        0x1 => {
            let host = hal.cpuid(leaf, subleaf);
            let mut ebx = host.ebx;
            ebx.set_bits(16..32, 0);
            ebx.set_bits(24..32, vcpu_id as u32 & 0xff);
            let mut ecx = hide(host.ecx, CPUID1_ECX_HIDDEN);
            ecx.set_bit(CPUID1_ECX_HYPERVISOR, true);
            CpuidResult {
                eax: host.eax,
                ebx,
                ecx,
                edx: hide(host.edx, CPUID1_EDX_HIDDEN),
            }
        }
        0x7 if subleaf == 0 => {
            let host = hal.cpuid(leaf, subleaf);
            CpuidResult {
                eax: 0,
                ebx: hide(host.ebx, CPUID7_EBX_HIDDEN),
                ecx: 0,
                edx: 0,
            }
        }
        HV_MAX_LEAF => {
            let word = |i: usize| {
                u32::from_le_bytes([
                    HV_SIGNATURE[i],
                    HV_SIGNATURE[i + 1],
                    HV_SIGNATURE[i + 2],
                    HV_SIGNATURE[i + 3],
                ])
            };
            CpuidResult {
                eax: HV_MAX_LEAF,
                ebx: word(0),
                ecx: word(4),
                edx: word(8),
            }
        }
        0x8000_0001 => {
            let mut host = hal.cpuid(leaf, subleaf);
            host.ecx.set_bit(CPUID_EXT1_ECX_SVM, false);
            host
        }
        0x8000_0000..=0x8000_ffff => hal.cpuid(leaf, subleaf),
        _ => CpuidResult::default(),
    }
}

/// Complete a `CPUID` exit: read the leaf from RAX/RCX, write the result back.
pub fn emulate_cpuid<H: AxVmmHal>(hal: &H, vcpu_id: usize, regs: &mut GuestRegs) {
    let leaf = regs.gprs.rax as u32;
    let subleaf = regs.gprs.rcx as u32;
    let res = cpuid(hal, vcpu_id, leaf, subleaf);
    trace!("cpuid {:#x}/{:#x} -> {:x?}", leaf, subleaf, res);
    regs.gprs.rax = res.eax as u64;
    regs.gprs.rbx = res.ebx as u64;
    regs.gprs.rcx = res.ecx as u64;
    regs.gprs.rdx = res.edx as u64;
}

/// The value a `WRMSR` writes, from EDX:EAX.
pub fn wrmsr_value(regs: &GuestRegs) -> u64 {
    (regs.gprs.rdx << 32) | (regs.gprs.rax & 0xffff_ffff)
}

/// Return `value` from a `RDMSR` in EDX:EAX.
pub fn complete_rdmsr(regs: &mut GuestRegs, value: u64) {
    regs.gprs.rax = value & 0xffff_ffff;
    regs.gprs.rdx = value >> 32;
}

/// The EFER a guest `WRMSR` of `value` leaves behind, or the `#GP` to
/// inject. `LMA` belongs to the processor and keeps its old value; `LME`
/// cannot change while paging is on.
pub fn guest_efer(old: u64, value: u64, paging: bool) -> Result<u64, Event> {
    let gp = Event::exception(crate::defs::vector::GP);
    if value & !EFER_GUEST_BITS != 0 {
        return Err(gp);
    }
    if paging && (value ^ old) & EFER_LME != 0 {
        return Err(gp);
    }
    Ok((value & !EFER_LMA) | (old & EFER_LMA))
}

/// Complete a `RDMSR` of an MSR no control block holds. Only
/// `IA32_MISC_ENABLE` reads back a value.
pub fn emulate_rdmsr(regs: &mut GuestRegs) {
    let value = match regs.gprs.rcx as u32 {
        msr::IA32_MISC_ENABLE => regs.misc_enable,
        index => {
            debug!("rdmsr {:#x} reads as zero", index);
            0
        }
    };
    complete_rdmsr(regs, value);
}

/// Complete a `WRMSR` of an MSR no control block holds. Writes other than
/// to `IA32_MISC_ENABLE` are dropped.
pub fn emulate_wrmsr(regs: &mut GuestRegs) {
    let value = wrmsr_value(regs);
    match regs.gprs.rcx as u32 {
        msr::IA32_MISC_ENABLE => regs.misc_enable = value,
        index => debug!("wrmsr {:#x} <- {:#x} ignored", index, value),
    }
}

/// Complete an `XSETBV` exit, or return the `#GP` to inject.
pub fn emulate_xsetbv<H: AxVmmHal>(hal: &H, regs: &mut GuestRegs) -> Result<(), Event> {
    let gp = Event::exception(crate::defs::vector::GP);
    if regs.gprs.rcx as u32 != 0 {
        return Err(gp);
    }
    let value = wrmsr_value(regs);
    let host = hal.cpuid(0xd, 0);
    let supported = ((host.edx as u64) << 32) | host.eax as u64;
    if value & XCR0_X87 == 0
        || (value & XCR0_AVX != 0 && value & XCR0_SSE == 0)
        || value & !supported != 0
    {
        return Err(gp);
    }
    regs.xcr0 = value;
    Ok(())
}

/// Whether accesses to `port` go to a device emulated by the caller.
pub fn io_needs_helper(port: u16) -> bool {
    matches!(
        port,
        0x20..=0x21 | 0x40..=0x43 | 0x70..=0x71 | 0xa0..=0xa1 | 0x3f8..=0x3ff | 0xcf8 | 0xcfc..=0xcff
    ) || (PCI_IO_BAR_BASE..=PCI_IO_BAR_END).contains(&port)
}

/// Snapshot the `OUT` value into `io` and decide who completes the access.
///
/// Returns `true` if the caller must complete it. Unclaimed `IN`s read as
/// all ones, unclaimed `OUT`s are dropped.
pub fn complete_io(io: &mut IoAccess, regs: &mut GuestRegs) -> bool {
    if !io.is_in {
        io.data = (regs.gprs.rax & io.mask()) as u32;
    }
    if io_needs_helper(io.port) {
        return true;
    }
    if io.is_in {
        regs.gprs.rax = (regs.gprs.rax & !io.mask()) | io.mask();
    }
    false
}

/// Handle a second-level page fault at `gpa`.
///
/// Faults in guest RAM go to the address-space service, MMIO window
/// accesses go to the caller, anything else kills the VM.
pub fn nested_fault<H: AxVmmHal>(
    ectx: &ExitContext<H>,
    gpa: GuestPhysAddr,
    access: FaultAccess,
) -> ExitAction {
    match memtype(ectx.ranges, gpa) {
        MemType::Regular => match ectx.hal.resolve_fault(ectx.vm_id, gpa, access) {
            Ok(()) => ExitAction::handled(false),
            Err(e) => {
                error!(
                    "VM {}: cannot resolve {:?} fault at {:?}: {:?}",
                    ectx.vm_id, access, gpa, e
                );
                ExitAction::fatal()
            }
        },
        MemType::Mmio => ExitAction::need_help(VCpuExitReason::Mmio { gpa, access }, false),
        MemType::Unknown => {
            error!(
                "VM {} vcpu {}: {:?} access to unmapped {:?}",
                ectx.vm_id, ectx.vcpu_id, access, gpa
            );
            ExitAction::fatal()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_ports() {
        for port in [0x20, 0x43, 0x71, 0xa1, 0x3f8, 0xcf8, 0xcfc, 0x1000, 0xc000] {
            assert!(io_needs_helper(port), "{port:#x}");
        }
        for port in [0x22, 0x60, 0x80, 0x3f7, 0xcf9, 0xfff] {
            assert!(!io_needs_helper(port), "{port:#x}");
        }
    }

    #[test]
    fn unclaimed_in_reads_all_ones() {
        let mut regs = GuestRegs::default();
        regs.gprs.rax = 0x1234_5678_9abc_def0;
        let mut io = IoAccess {
            port: 0x80,
            size: 2,
            is_in: true,
            string: false,
            rep: false,
            data: 0,
        };
        assert!(!complete_io(&mut io, &mut regs));
        assert_eq!(regs.gprs.rax, 0x1234_5678_9abc_ffff);
    }

    #[test]
    fn misc_enable_is_the_only_backed_msr() {
        let mut regs = GuestRegs::default();
        regs.gprs.rcx = msr::IA32_MISC_ENABLE as u64;
        regs.gprs.rax = 0x1;
        regs.gprs.rdx = 0x2;
        emulate_wrmsr(&mut regs);
        regs.gprs.rax = 0;
        regs.gprs.rdx = 0;
        emulate_rdmsr(&mut regs);
        assert_eq!((regs.gprs.rdx, regs.gprs.rax), (0x2, 0x1));

        regs.gprs.rcx = msr::IA32_PAT as u64;
        emulate_wrmsr(&mut regs);
        emulate_rdmsr(&mut regs);
        assert_eq!((regs.gprs.rdx, regs.gprs.rax), (0, 0));
    }

    #[test]
    fn efer_writes() {
        use crate::defs::{EFER_NXE, EFER_SCE, EFER_SVME};
        assert_eq!(guest_efer(0, EFER_LME | EFER_SCE, false), Ok(EFER_LME | EFER_SCE));
        // LMA is the processor's to set.
        assert_eq!(guest_efer(0, EFER_LME | EFER_LMA, false), Ok(EFER_LME));
        let long = EFER_LME | EFER_LMA;
        assert_eq!(guest_efer(long, EFER_LME | EFER_NXE, true), Ok(long | EFER_NXE));
        assert!(guest_efer(long, 0, true).is_err());
        assert!(guest_efer(0, EFER_SVME, false).is_err());
    }
}
