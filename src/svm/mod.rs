//! AMD SVM control blocks (VMCB).

pub(crate) mod vmcb;

use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};
use bit_field::BitField;
use memory_addr::PhysAddr;

use self::vmcb::*;
use crate::{
    control_block::{ControlBlockOps, ExitContext, VCpuSetup},
    defs::*,
    emulate,
    exit::{EntryFailure, Event, ExitAction, FaultAccess, IoAccess, VCpuExitReason},
    frame::PhysFrames,
    hal::VirtMode,
    mem::GuestPhysAddr,
    regs::{DescTable, GuestRegs, RegMask, RegisterState, SegReg, Segment},
    vmm::VmmContext,
    AxVmmHal,
};

const IOPM_PAGES: usize = 3;
const MSRPM_PAGES: usize = 2;

/// MSRs the guest accesses without exiting. `VMLOAD`/`VMSAVE` switch them.
const PASSTHROUGH_MSRS: [u32; 6] = [
    msr::IA32_FS_BASE,
    msr::IA32_GS_BASE,
    msr::IA32_KERNEL_GSBASE,
    msr::IA32_SYSENTER_CS,
    msr::IA32_SYSENTER_ESP,
    msr::IA32_SYSENTER_EIP,
];

/// Every VMCB clean bit the processor defines.
const CLEAN_ALL: u32 = 0xfff;

/// CPUID.8000000Ah:EDX, next-RIP saving.
const CPUID_SVM_NRIPS: usize = 3;

/// Bit offset of `msr` in the MSR permission map, two bits per MSR.
fn msrpm_offset(msr: u32) -> Option<usize> {
    let (base, index) = match msr {
        0..=0x1fff => (0, msr),
        0xc000_0000..=0xc000_1fff => (0x800, msr - 0xc000_0000),
        0xc001_0000..=0xc001_1fff => (0x1000, msr - 0xc001_0000),
        _ => return None,
    };
    Some(base * 8 + index as usize * 2)
}

fn check_cr0(cr0: u64) -> AxResult {
    if cr0 >> 32 != 0 || (cr0 & CR0_NW != 0 && cr0 & CR0_CD == 0) {
        warn!("guest CR0 {:#x} rejected by SVM consistency checks", cr0);
        return ax_err!(InvalidInput, "CR0 invalid for VMRUN");
    }
    Ok(())
}

fn check_cr4(cr4: u64) -> AxResult {
    if cr4 & CR4_VMXE != 0 || cr4 >> 32 != 0 {
        warn!("guest CR4 {:#x} rejected by SVM consistency checks", cr4);
        return ax_err!(InvalidInput, "CR4 invalid for VMRUN");
    }
    Ok(())
}

/// A VMCB and its permission maps.
pub struct SvmVcpu<H: AxVmmHal> {
    hal: Arc<H>,
    mode: VirtMode,
    vmcb: PhysFrames<H>,
    iopm: PhysFrames<H>,
    msrpm: PhysFrames<H>,
    asid: u16,
    /// The CPU saves the next RIP on intercepts.
    nrips: bool,
    /// Fields were changed by software since the last `VMRUN`.
    dirty: bool,
    loaded_on: Option<usize>,
}

impl<H: AxVmmHal> SvmVcpu<H> {
    /// Allocate the VMCB and the permission maps.
    pub fn new(ctx: &VmmContext<H>) -> AxResult<Self> {
        let hal = ctx.hal();
        let nrips = hal.cpuid(0x8000_000a, 0).edx.get_bit(CPUID_SVM_NRIPS);
        let mut vcpu = Self {
            hal: hal.clone(),
            mode: ctx.mode(),
            vmcb: PhysFrames::alloc_zero(hal, 1)?,
            iopm: PhysFrames::alloc_zero(hal, IOPM_PAGES)?,
            msrpm: PhysFrames::alloc_zero(hal, MSRPM_PAGES)?,
            asid: 0,
            nrips,
            dirty: true,
            loaded_on: None,
        };
        vcpu.iopm.fill(0xff);
        vcpu.setup_msrpm();
        debug!(
            "VMCB {:#x} allocated, next-RIP saving {}",
            vcpu.paddr(),
            if nrips { "on" } else { "off" }
        );
        Ok(vcpu)
    }

    fn setup_msrpm(&mut self) {
        let map = self.msrpm.as_bytes_mut();
        map.fill(0xff);
        for msr in PASSTHROUGH_MSRS {
            if let Some(bit) = msrpm_offset(msr) {
                // Read intercept in the low bit, write intercept in the high one.
                map[bit / 8] &= !(0b11 << (bit % 8));
            }
        }
    }

    fn vmcb(&self) -> &Vmcb {
        // SAFETY: the frame is owned by this vcpu and exactly one `Vmcb` long.
        unsafe { &*(self.vmcb.as_mut_ptr() as *const Vmcb) }
    }

    fn vmcb_mut(&mut self) -> &mut Vmcb {
        // SAFETY: as in `vmcb`, and `&mut self` makes the access exclusive.
        unsafe { &mut *(self.vmcb.as_mut_ptr() as *mut Vmcb) }
    }

    fn seg_mut(save: &mut SaveArea, seg: SegReg) -> &mut VmcbSegment {
        match seg {
            SegReg::Es => &mut save.es,
            SegReg::Cs => &mut save.cs,
            SegReg::Ss => &mut save.ss,
            SegReg::Ds => &mut save.ds,
            SegReg::Fs => &mut save.fs,
            SegReg::Gs => &mut save.gs,
            SegReg::Ldtr => &mut save.ldtr,
            SegReg::Tr => &mut save.tr,
        }
    }

    fn seg(save: &SaveArea, seg: SegReg) -> &VmcbSegment {
        match seg {
            SegReg::Es => &save.es,
            SegReg::Cs => &save.cs,
            SegReg::Ss => &save.ss,
            SegReg::Ds => &save.ds,
            SegReg::Fs => &save.fs,
            SegReg::Gs => &save.gs,
            SegReg::Ldtr => &save.ldtr,
            SegReg::Tr => &save.tr,
        }
    }

    fn write_control_area(&mut self, setup: &VCpuSetup) {
        let nested = self.mode.has_nested_paging();
        let iopm = self.iopm.start_paddr().as_usize() as u64;
        let msrpm = self.msrpm.start_paddr().as_usize() as u64;
        let asid = self.asid;
        let ctl = &mut self.vmcb_mut().control;
        ctl.intercept_cr = 0;
        ctl.intercept_dr = 0;
        ctl.intercept_exceptions = 0;
        ctl.intercept_misc1 = (InterceptMisc1::INTR
            | InterceptMisc1::NMI
            | InterceptMisc1::CPUID
            | InterceptMisc1::HLT
            | InterceptMisc1::IOIO_PROT
            | InterceptMisc1::MSR_PROT
            | InterceptMisc1::SHUTDOWN)
            .bits();
        ctl.intercept_misc2 = (InterceptMisc2::VMRUN
            | InterceptMisc2::VMMCALL
            | InterceptMisc2::VMLOAD
            | InterceptMisc2::VMSAVE
            | InterceptMisc2::STGI
            | InterceptMisc2::CLGI
            | InterceptMisc2::SKINIT
            | InterceptMisc2::XSETBV)
            .bits();
        ctl.iopm_base_pa = iopm;
        ctl.msrpm_base_pa = msrpm;
        ctl.tsc_offset = 0;
        ctl.guest_asid = asid as u32;
        ctl.tlb_control = TLB_FLUSH_GUEST;
        ctl.int_control = V_INTR_MASKING;
        ctl.int_state = 0;
        ctl.event_inj = 0;
        if nested {
            ctl.nested_ctl = NP_ENABLE;
            ctl.nested_cr3 = setup.nested_root.as_usize() as u64;
        } else {
            ctl.nested_ctl = 0;
            ctl.nested_cr3 = 0;
        }
        ctl.clean_bits = 0;
        self.vmcb_mut().save.g_pat = PAT_POWER_ON;
        self.dirty = true;
        trace!(
            "VM {} vcpu {}: VMCB {:#x} control area written, ASID {}",
            setup.vm_id,
            setup.vcpu_id,
            self.paddr(),
            asid
        );
    }

    /// Complete an MSR exit. EFER and the syscall MSRs live in the save
    /// area; the guest never sees `EFER.SVME`, which stays set.
    fn msr_exit(&mut self, cache: &mut GuestRegs, write: bool) -> ExitAction {
        let index = cache.gprs.rcx as u32;
        if index == msr::IA32_EFER {
            let save = &self.vmcb().save;
            let (old, paging) = (save.efer & !EFER_SVME, save.cr0 & CR0_PG != 0);
            if !write {
                emulate::complete_rdmsr(cache, old);
                return ExitAction::handled(true);
            }
            return match emulate::guest_efer(old, emulate::wrmsr_value(cache), paging) {
                Ok(efer) => {
                    self.vmcb_mut().save.efer = efer | EFER_SVME;
                    self.dirty = true;
                    ExitAction::handled(true)
                }
                Err(gp) => ExitAction::inject(gp),
            };
        }

        let save = &mut self.vmcb_mut().save;
        let slot = match index {
            msr::IA32_STAR => Some(&mut save.star),
            msr::IA32_LSTAR => Some(&mut save.lstar),
            msr::IA32_CSTAR => Some(&mut save.cstar),
            msr::IA32_FMASK => Some(&mut save.sfmask),
            msr::IA32_KERNEL_GSBASE => Some(&mut save.kernel_gs_base),
            _ => None,
        };
        match (slot, write) {
            (Some(slot), true) => *slot = emulate::wrmsr_value(cache),
            (Some(slot), false) => emulate::complete_rdmsr(cache, *slot),
            (None, true) => emulate::emulate_wrmsr(cache),
            (None, false) => emulate::emulate_rdmsr(cache),
        }
        ExitAction::handled(true)
    }

    fn svm_exit_action(&mut self, ectx: &ExitContext<H>, cache: &mut GuestRegs) -> AxResult<ExitAction> {
        let ctl = &self.vmcb().control;
        let (code, info1, info2) = (ctl.exit_code, ctl.exit_info_1, ctl.exit_info_2);
        let action = match code {
            // Still pending on the host, taken once GIF is set again.
            exit_code::INTR | exit_code::NMI => ExitAction::handled(false),
            exit_code::VINTR => {
                if self.rflags()? & RFLAGS_IF == 0 {
                    error!("interrupt window exit with guest interrupts disabled");
                    ExitAction::fatal()
                } else {
                    self.set_interrupt_window(false)?;
                    ExitAction::handled(false)
                }
            }
            exit_code::NPF => {
                let access = if info1.get_bit(1) {
                    FaultAccess::Write
                } else if info1.get_bit(4) {
                    FaultAccess::Execute
                } else {
                    FaultAccess::Read
                };
                emulate::nested_fault(ectx, GuestPhysAddr::from_usize(info2 as usize), access)
            }
            exit_code::CPUID => {
                emulate::emulate_cpuid(ectx.hal, ectx.vcpu_id, cache);
                ExitAction::handled(true)
            }
            exit_code::IOIO => {
                let size = match info1.get_bits(4..7) {
                    0b001 => 1,
                    0b010 => 2,
                    _ => 4,
                };
                let mut io = IoAccess {
                    port: info1.get_bits(16..32) as u16,
                    size,
                    is_in: info1.get_bit(0),
                    string: info1.get_bit(2),
                    rep: info1.get_bit(3),
                    data: 0,
                };
                if emulate::complete_io(&mut io, cache) {
                    ExitAction::need_help(VCpuExitReason::Io(io), true)
                } else {
                    ExitAction::handled(true)
                }
            }
            exit_code::HLT => ExitAction::need_help(VCpuExitReason::Halt, true),
            exit_code::MSR => self.msr_exit(cache, info1 & 1 != 0),
            exit_code::XSETBV => match emulate::emulate_xsetbv(ectx.hal, cache) {
                Ok(()) => ExitAction::handled(true),
                Err(gp) => ExitAction::inject(gp),
            },
            exit_code::VMRUN
            | exit_code::VMMCALL
            | exit_code::VMLOAD
            | exit_code::VMSAVE
            | exit_code::STGI
            | exit_code::CLGI
            | exit_code::SKINIT => ExitAction::inject(Event::exception(vector::UD)),
            exit_code::SHUTDOWN => ExitAction::need_help(VCpuExitReason::Shutdown, false),
            other => {
                error!(
                    "VM {} vcpu {}: unhandled SVM exit code {:#x}",
                    ectx.vm_id, ectx.vcpu_id, other
                );
                ExitAction::fatal()
            }
        };
        Ok(action)
    }
}

impl<H: AxVmmHal> ControlBlockOps<H> for SvmVcpu<H> {
    fn paddr(&self) -> PhysAddr {
        self.vmcb.start_paddr()
    }

    fn load(&mut self, ctx: &VmmContext<H>) -> AxResult {
        let cpu = self.hal.current_cpu();
        if let Some(other) = self.loaded_on.filter(|&c| c != cpu) {
            return ax_err!(
                BadState,
                format!("VMCB still in use on CPU {other}, release it before loading on CPU {cpu}")
            );
        }
        ctx.percpu().get(cpu)?.set_loaded(self.paddr())?;
        self.loaded_on = Some(cpu);
        Ok(())
    }

    fn release(&mut self, ctx: &VmmContext<H>) -> AxResult {
        let Some(cpu) = self.loaded_on.take() else {
            return Ok(());
        };
        ctx.percpu().get(cpu)?.clear_loaded(self.paddr());
        Ok(())
    }

    fn reset_to_poweron(
        &mut self,
        ctx: &VmmContext<H>,
        setup: &VCpuSetup,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult {
        self.check_registers(RegMask::ALL, state)?;
        if self.asid == 0 {
            self.asid = ctx.vpids().alloc()?;
        }
        self.write_control_area(setup);
        self.write_registers(RegMask::ALL, state, cache)
    }

    fn check_registers(&self, mask: RegMask, state: &RegisterState) -> AxResult {
        if mask.contains(RegMask::CRS) {
            check_cr0(state.crs.cr0)?;
            check_cr4(state.crs.cr4)?;
        }
        Ok(())
    }

    fn read_registers(&self, mask: RegMask, cache: &GuestRegs) -> AxResult<RegisterState> {
        let save = &self.vmcb().save;
        let mut state = RegisterState::default();
        cache.store(mask, &mut state);

        if mask.contains(RegMask::GPRS) {
            state.gprs.rsp = save.rsp;
            state.rip = save.rip;
            state.rflags = save.rflags;
        }
        if mask.contains(RegMask::SREGS) {
            for seg in SegReg::ALL {
                let s = Self::seg(save, seg);
                state.segs[seg as usize] = Segment {
                    selector: s.selector,
                    limit: s.limit,
                    ar: Segment::ar_from_svm(s.attrib),
                    base: s.base,
                };
            }
            state.gdtr = DescTable {
                limit: save.gdtr.limit,
                base: save.gdtr.base,
            };
            state.idtr = DescTable {
                limit: save.idtr.limit,
                base: save.idtr.base,
            };
        }
        if mask.contains(RegMask::CRS) {
            state.crs.cr0 = save.cr0;
            state.crs.cr3 = save.cr3;
            state.crs.cr4 = save.cr4;
        }
        if mask.contains(RegMask::MSRS) {
            let m = &mut state.msrs;
            m.efer = save.efer;
            m.star = save.star;
            m.lstar = save.lstar;
            m.cstar = save.cstar;
            m.sfmask = save.sfmask;
            m.kernel_gs_base = save.kernel_gs_base;
        }
        if mask.contains(RegMask::DRS) {
            state.drs.dr7 = save.dr7;
        }
        Ok(state)
    }

    fn write_registers(
        &mut self,
        mask: RegMask,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult {
        self.check_registers(mask, state)?;
        let save = &mut self.vmcb_mut().save;
        if mask.contains(RegMask::GPRS) {
            save.rax = state.gprs.rax;
            save.rsp = state.gprs.rsp;
            save.rip = state.rip;
            save.rflags = state.rflags | RFLAGS_RESERVED_1;
        }
        if mask.contains(RegMask::SREGS) {
            for seg in SegReg::ALL {
                let s = state.seg(seg);
                *Self::seg_mut(save, seg) = VmcbSegment {
                    selector: s.selector,
                    attrib: s.svm_attrib(),
                    limit: s.limit,
                    base: s.base,
                };
            }
            save.cpl = ((state.seg(SegReg::Ss).ar >> 5) & 3) as u8;
            save.gdtr = VmcbSegment {
                limit: state.gdtr.limit,
                base: state.gdtr.base,
                ..Default::default()
            };
            save.idtr = VmcbSegment {
                limit: state.idtr.limit,
                base: state.idtr.base,
                ..Default::default()
            };
        }
        if mask.contains(RegMask::CRS) {
            save.cr0 = state.crs.cr0;
            save.cr2 = state.crs.cr2;
            save.cr3 = state.crs.cr3;
            save.cr4 = state.crs.cr4;
        }
        if mask.contains(RegMask::MSRS) {
            let m = &state.msrs;
            save.efer = m.efer | EFER_SVME;
            save.star = m.star;
            save.lstar = m.lstar;
            save.cstar = m.cstar;
            save.sfmask = m.sfmask;
            save.kernel_gs_base = m.kernel_gs_base;
        }
        if mask.contains(RegMask::DRS) {
            save.dr6 = state.drs.dr6;
            save.dr7 = state.drs.dr7;
        }
        cache.load(mask, state);
        self.dirty = true;
        Ok(())
    }

    fn deinit(&mut self, ctx: &VmmContext<H>) {
        if self.asid != 0 {
            ctx.vpids().free(self.asid);
            self.asid = 0;
        }
    }

    fn prepare_entry(&mut self, moved: bool) -> AxResult {
        let dirty = self.dirty;
        let ctl = &mut self.vmcb_mut().control;
        if moved || dirty {
            ctl.clean_bits = 0;
        }
        ctl.tlb_control = if moved { TLB_FLUSH_GUEST } else { 0 };
        Ok(())
    }

    fn rip(&self) -> AxResult<u64> {
        Ok(self.vmcb().save.rip)
    }

    fn set_rip(&mut self, rip: u64) -> AxResult {
        self.vmcb_mut().save.rip = rip;
        Ok(())
    }

    fn rflags(&self) -> AxResult<u64> {
        Ok(self.vmcb().save.rflags)
    }

    fn interruptible(&self) -> AxResult<bool> {
        let vmcb = self.vmcb();
        Ok(vmcb.save.rflags & RFLAGS_IF != 0 && vmcb.control.int_state & INTERRUPT_SHADOW == 0)
    }

    fn inject_event(&mut self, event: Event) -> AxResult {
        let (info, error_code) = event.encode();
        self.vmcb_mut().control.event_inj = info as u64 | ((error_code.unwrap_or(0) as u64) << 32);
        Ok(())
    }

    fn set_interrupt_window(&mut self, armed: bool) -> AxResult {
        let ctl = &mut self.vmcb_mut().control;
        let mut misc1 = InterceptMisc1::from_bits_retain(ctl.intercept_misc1);
        if misc1.contains(InterceptMisc1::VINTR) == armed {
            return Ok(());
        }
        misc1.set(InterceptMisc1::VINTR, armed);
        ctl.intercept_misc1 = misc1.bits();
        if armed {
            ctl.int_control |= V_IRQ | V_IGN_TPR;
        } else {
            ctl.int_control &= !(V_IRQ | V_IGN_TPR);
        }
        self.dirty = true;
        Ok(())
    }

    fn enter(&mut self, cache: &mut GuestRegs) -> Result<(), EntryFailure> {
        let pa = self.paddr();
        {
            let save = &mut self.vmcb_mut().save;
            save.rax = cache.gprs.rax;
            save.cr2 = cache.cr2;
            save.dr6 = cache.dr6;
        }
        self.hal.svm_enter_guest(pa, cache)?;

        let vmcb = self.vmcb_mut();
        cache.gprs.rax = vmcb.save.rax;
        cache.cr2 = vmcb.save.cr2;
        cache.dr6 = vmcb.save.dr6;
        vmcb.control.event_inj = 0;
        vmcb.control.clean_bits = CLEAN_ALL;
        let code = vmcb.control.exit_code;
        self.dirty = false;
        if code == exit_code::INVALID {
            return Err(EntryFailure::ValidControlBlock { code: 0 });
        }
        Ok(())
    }

    fn handle_exit(&mut self, ectx: &ExitContext<H>, cache: &mut GuestRegs) -> AxResult<ExitAction> {
        self.svm_exit_action(ectx, cache)
    }

    fn exit_instruction_len(&self) -> AxResult<u64> {
        let vmcb = self.vmcb();
        let rip = vmcb.save.rip;
        let code = vmcb.control.exit_code;
        if code == exit_code::IOIO {
            return Ok(vmcb.control.exit_info_2.wrapping_sub(rip));
        }
        if self.nrips && vmcb.control.next_rip != 0 {
            return Ok(vmcb.control.next_rip.wrapping_sub(rip));
        }
        match code {
            exit_code::CPUID | exit_code::MSR => Ok(2),
            exit_code::HLT => Ok(1),
            exit_code::XSETBV | exit_code::VMMCALL | exit_code::VMRUN => Ok(3),
            _ => ax_err!(Unsupported, "instruction length unknown without next-RIP saving"),
        }
    }

    fn exit_reason(&self) -> u64 {
        self.vmcb().control.exit_code
    }
}
