//! Intel VMX control blocks (VMCS).

mod controls;
pub(crate) mod vmcs;

use alloc::sync::Arc;

use axerrno::{ax_err, AxResult};
use bit_field::BitField;
use memory_addr::PhysAddr;

use self::controls::*;
use self::vmcs::{reason, MsrEntry};
use crate::{
    control_block::{ControlBlockOps, ExitContext, VCpuSetup},
    defs::*,
    emulate,
    exit::{EntryFailure, Event, ExitAction, FaultAccess, IoAccess, VCpuExitReason},
    frame::PhysFrames,
    hal::VirtMode,
    regs::{DescTable, GuestRegs, RegMask, RegisterState, SegReg, Segment},
    vmm::VmmContext,
    AxVmmHal,
};

pub use self::controls::{compute_ctrl, ControlClass};

/// MSRs switched through the VM-entry/VM-exit MSR areas, in area order.
const SWITCHED_MSRS: [u32; 6] = [
    msr::IA32_EFER,
    msr::IA32_STAR,
    msr::IA32_LSTAR,
    msr::IA32_CSTAR,
    msr::IA32_FMASK,
    msr::IA32_KERNEL_GSBASE,
];

/// MSRs the guest reads and writes without exiting. The processor switches
/// each of them through the VMCS or the MSR areas.
const PASSTHROUGH_MSRS: [u32; 6] = [
    msr::IA32_FS_BASE,
    msr::IA32_GS_BASE,
    msr::IA32_KERNEL_GSBASE,
    msr::IA32_SYSENTER_CS,
    msr::IA32_SYSENTER_ESP,
    msr::IA32_SYSENTER_EIP,
];

const EPT_CAP_WALK_4: usize = 6;
const EPT_CAP_WB: usize = 14;
const EPT_CAP_AD: usize = 21;

/// Interruptibility state: blocking by STI or by MOV SS.
const BLOCKING_BY_STI_OR_MOV_SS: u64 = 0b11;

/// VMX capability MSRs snapshotted when the control block is created.
#[derive(Debug, Clone, Copy)]
struct VmxCaps {
    revision: u32,
    pin: u64,
    proc: u64,
    proc2: u64,
    exit: u64,
    entry: u64,
    cr0_fixed0: u64,
    cr0_fixed1: u64,
    cr4_fixed0: u64,
    cr4_fixed1: u64,
    ept_vpid: u64,
}

impl VmxCaps {
    fn read<H: AxVmmHal>(hal: &H) -> Self {
        let basic = hal.rdmsr(msr::IA32_VMX_BASIC);
        let true_ctls = basic.get_bit(55);
        let pick = |plain: u32, truly: u32| hal.rdmsr(if true_ctls { truly } else { plain });
        let proc = pick(msr::IA32_VMX_PROCBASED_CTLS, msr::IA32_VMX_TRUE_PROCBASED_CTLS);
        let has_secondary = can_set(proc, PrimaryControls::SECONDARY_CONTROLS.bits());
        Self {
            revision: basic.get_bits(0..31) as u32,
            pin: pick(msr::IA32_VMX_PINBASED_CTLS, msr::IA32_VMX_TRUE_PINBASED_CTLS),
            proc,
            proc2: if has_secondary {
                hal.rdmsr(msr::IA32_VMX_PROCBASED_CTLS2)
            } else {
                0
            },
            exit: pick(msr::IA32_VMX_EXIT_CTLS, msr::IA32_VMX_TRUE_EXIT_CTLS),
            entry: pick(msr::IA32_VMX_ENTRY_CTLS, msr::IA32_VMX_TRUE_ENTRY_CTLS),
            cr0_fixed0: hal.rdmsr(msr::IA32_VMX_CR0_FIXED0),
            cr0_fixed1: hal.rdmsr(msr::IA32_VMX_CR0_FIXED1),
            cr4_fixed0: hal.rdmsr(msr::IA32_VMX_CR4_FIXED0),
            cr4_fixed1: hal.rdmsr(msr::IA32_VMX_CR4_FIXED1),
            ept_vpid: if has_secondary {
                hal.rdmsr(msr::IA32_VMX_EPT_VPID_CAP)
            } else {
                0
            },
        }
    }

    fn vpid_capable(&self) -> bool {
        can_set(self.proc2, SecondaryControls::ENABLE_VPID.bits())
    }

    fn ug_capable(&self) -> bool {
        can_set(self.proc2, SecondaryControls::UNRESTRICTED_GUEST.bits())
    }
}

/// Whether guests can run with paging disabled on this host.
pub fn unrestricted_guest_supported<H: AxVmmHal>(hal: &H) -> bool {
    let caps = VmxCaps::read(hal);
    can_set(caps.proc, PrimaryControls::SECONDARY_CONTROLS.bits()) && caps.ug_capable()
}

/// Whether a capability MSR allows `bits` to be 1.
fn can_set(cap: u64, bits: u32) -> bool {
    (cap >> 32) as u32 & bits == bits
}

/// Resolved values of the five control fields.
#[derive(Debug, Clone, Copy)]
struct VmxControls {
    pin: u32,
    proc: u32,
    proc2: u32,
    exit: u32,
    entry: u32,
}

impl VmxControls {
    fn unrestricted_guest(&self) -> bool {
        self.proc2 & SecondaryControls::UNRESTRICTED_GUEST.bits() != 0
    }

    fn vpid(&self) -> bool {
        self.proc2 & SecondaryControls::ENABLE_VPID.bits() != 0
    }
}

/// A VMCS and its auxiliary pages.
pub struct VmxVcpu<H: AxVmmHal> {
    hal: Arc<H>,
    mode: VirtMode,
    caps: VmxCaps,
    vmcs: PhysFrames<H>,
    msr_bitmap: PhysFrames<H>,
    /// VM-exit MSR-store and VM-entry MSR-load area, shared.
    guest_msrs: PhysFrames<H>,
    /// VM-exit MSR-load area.
    host_msrs: PhysFrames<H>,
    /// Unrestricted guest is on, so CR0.PE and CR0.PG are free.
    unrestricted: bool,
    vpid: u16,
    launched: bool,
    loaded_on: Option<usize>,
    last_exit: u32,
}

impl<H: AxVmmHal> VmxVcpu<H> {
    /// Allocate the VMCS and its auxiliary pages and write the host state.
    pub fn new(ctx: &VmmContext<H>) -> AxResult<Self> {
        let hal = ctx.hal();
        let caps = VmxCaps::read(&**hal);
        let mut vcpu = Self {
            hal: hal.clone(),
            mode: ctx.mode(),
            caps,
            vmcs: PhysFrames::alloc_zero(hal, 1)?,
            msr_bitmap: PhysFrames::alloc_zero(hal, 1)?,
            guest_msrs: PhysFrames::alloc_zero(hal, 1)?,
            host_msrs: PhysFrames::alloc_zero(hal, 1)?,
            unrestricted: false,
            vpid: 0,
            launched: false,
            loaded_on: None,
            last_exit: 0,
        };
        vcpu.vmcs.as_bytes_mut()[..4].copy_from_slice(&caps.revision.to_le_bytes());
        vcpu.setup_msr_bitmap();
        vcpu.setup_msr_areas();

        vcpu.load(ctx)?;
        let ret = vcpu.setup_host_fields();
        if let Err(e) = vcpu.release(ctx) {
            error!("VMCS {:#x}: VMCLEAR failed: {:?}", vcpu.paddr(), e);
            ctx.poison();
            return Err(e);
        }
        ret?;
        Ok(vcpu)
    }

    fn vmread(&self, field: u32) -> AxResult<u64> {
        self.hal.vmread(field)
    }

    fn vmwrite(&self, field: u32, value: u64) -> AxResult {
        self.hal.vmwrite(field, value)
    }

    /// Intercept every MSR except [`PASSTHROUGH_MSRS`].
    fn setup_msr_bitmap(&mut self) {
        let bitmap = self.msr_bitmap.as_bytes_mut();
        bitmap.fill(0xff);
        for msr in PASSTHROUGH_MSRS {
            let (base, bit) = match msr {
                0..=0x1fff => (0usize, msr as usize),
                0xc000_0000..=0xc000_1fff => (1024, (msr - 0xc000_0000) as usize),
                _ => continue,
            };
            // Read bitmap first, write bitmap 2 KiB later.
            for offset in [base, base + 2048] {
                bitmap[offset + bit / 8] &= !(1 << (bit % 8));
            }
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn msr_area(frames: &PhysFrames<H>) -> &mut [MsrEntry] {
        // SAFETY: the page is owned by this vcpu and large enough for the
        // entries; `MsrEntry` is plain data.
        unsafe {
            core::slice::from_raw_parts_mut(frames.as_mut_ptr() as *mut MsrEntry, SWITCHED_MSRS.len())
        }
    }

    fn setup_msr_areas(&mut self) {
        let guest = Self::msr_area(&self.guest_msrs);
        let host = Self::msr_area(&self.host_msrs);
        for (i, msr) in SWITCHED_MSRS.into_iter().enumerate() {
            guest[i] = MsrEntry {
                index: msr,
                ..Default::default()
            };
            host[i] = MsrEntry {
                index: msr,
                reserved: 0,
                data: self.hal.rdmsr(msr),
            };
        }
    }

    fn guest_msr(&self, msr: u32) -> u64 {
        let area = Self::msr_area(&self.guest_msrs);
        area.iter().find(|e| e.index == msr).map_or(0, |e| e.data)
    }

    fn set_guest_msr(&mut self, msr: u32, value: u64) {
        let area = Self::msr_area(&self.guest_msrs);
        if let Some(entry) = area.iter_mut().find(|e| e.index == msr) {
            entry.data = value;
        }
    }

    /// Set the VM-entry control that must match `EFER.LMA`.
    fn set_ia32e_entry(&self, lma: bool) -> AxResult {
        let mut entry = EntryControls::from_bits_retain(self.vmread(vmcs::VMENTRY_CTLS)? as u32);
        entry.set(EntryControls::IA32E_MODE_GUEST, lma);
        self.vmwrite(vmcs::VMENTRY_CTLS, entry.bits() as u64)
    }

    /// Enter or leave IA-32e mode after the guest toggled CR0.PG.
    fn set_long_mode(&mut self, lma: bool) -> AxResult {
        let mut efer = self.guest_msr(msr::IA32_EFER);
        if lma {
            efer |= EFER_LMA;
        } else {
            efer &= !EFER_LMA;
        }
        self.set_guest_msr(msr::IA32_EFER, efer);
        self.set_ia32e_entry(lma)
    }

    /// CR0 as the guest sees it: host-owned bits come from the read shadow.
    fn guest_cr0(&self) -> AxResult<u64> {
        use self::vmcs::*;
        let owned = self.vmread(CR0_GUEST_HOST_MASK)?;
        Ok((self.vmread(GUEST_CR0)? & !owned) | (self.vmread(CR0_READ_SHADOW)? & owned))
    }

    fn read_gpr(&self, cache: &GuestRegs, index: usize) -> AxResult<u64> {
        match index {
            4 => self.vmread(vmcs::GUEST_RSP),
            _ => Ok(cache.gprs.get(index)),
        }
    }

    fn write_gpr(&self, cache: &mut GuestRegs, index: usize, value: u64) -> AxResult {
        match index {
            4 => self.vmwrite(vmcs::GUEST_RSP, value),
            _ => {
                cache.gprs.set(index, value);
                Ok(())
            }
        }
    }

    /// A guest write to CR0. Turning paging on with `EFER.LME` set enters
    /// IA-32e mode, turning it off leaves it.
    fn write_guest_cr0(&mut self, value: u64) -> AxResult<ExitAction> {
        use self::vmcs::*;
        let gp = ExitAction::inject(Event::exception(vector::GP));
        let old = self.guest_cr0()?;
        let Ok(cr0) = self.fixed_cr0(value, self.unrestricted) else {
            return Ok(gp);
        };
        let efer = self.guest_msr(msr::IA32_EFER);
        let paging = value & CR0_PG != 0;
        if paging && old & CR0_PG == 0 && efer & EFER_LME != 0 {
            if self.vmread(GUEST_CR4)? & CR4_PAE == 0 {
                return Ok(gp);
            }
            self.set_long_mode(true)?;
        } else if !paging && efer & EFER_LMA != 0 {
            self.set_long_mode(false)?;
        }
        self.vmwrite(GUEST_CR0, cr0)?;
        self.vmwrite(CR0_READ_SHADOW, value)?;
        Ok(ExitAction::handled(true))
    }

    fn write_guest_cr4(&mut self, value: u64) -> AxResult<ExitAction> {
        use self::vmcs::*;
        let gp = ExitAction::inject(Event::exception(vector::GP));
        let Ok(cr4) = self.fixed_cr4(value) else {
            return Ok(gp);
        };
        if value & CR4_PAE == 0 && self.guest_msr(msr::IA32_EFER) & EFER_LMA != 0 {
            return Ok(gp);
        }
        self.vmwrite(GUEST_CR4, cr4)?;
        self.vmwrite(CR4_READ_SHADOW, value)?;
        Ok(ExitAction::handled(true))
    }

    /// Complete a control-register access exit.
    fn cr_access(&mut self, cache: &mut GuestRegs) -> AxResult<ExitAction> {
        use self::vmcs::*;
        let qual = self.vmread(EXIT_QUALIFICATION)?;
        let cr = qual.get_bits(0..4);
        let gpr = qual.get_bits(8..12) as usize;
        match (qual.get_bits(4..6), cr) {
            // MOV to CR
            (0, 0) => {
                let value = self.read_gpr(cache, gpr)?;
                self.write_guest_cr0(value)
            }
            (0, 3) => {
                let value = self.read_gpr(cache, gpr)?;
                self.vmwrite(GUEST_CR3, value)?;
                Ok(ExitAction::handled(true))
            }
            (0, 4) => {
                let value = self.read_gpr(cache, gpr)?;
                self.write_guest_cr4(value)
            }
            // MOV from CR
            (1, 3) => {
                let value = self.vmread(GUEST_CR3)?;
                self.write_gpr(cache, gpr, value)?;
                Ok(ExitAction::handled(true))
            }
            // CLTS
            (2, _) => {
                let cr0 = self.guest_cr0()?;
                self.write_guest_cr0(cr0 & !CR0_TS)
            }
            // LMSW loads PE, MP, EM and TS, but cannot clear PE.
            (3, _) => {
                let cr0 = self.guest_cr0()?;
                let low = CR0_PE | CR0_MP | CR0_EM | CR0_TS;
                let src = qual.get_bits(16..32) & low;
                self.write_guest_cr0((cr0 & !low) | src | (cr0 & CR0_PE))
            }
            (access, cr) => {
                error!("unexpected CR{} access type {}", cr, access);
                Ok(ExitAction::fatal())
            }
        }
    }

    /// Complete a `RDMSR` exit. MSRs switched through the MSR areas read
    /// from the guest area.
    fn rdmsr(&self, cache: &mut GuestRegs) {
        let index = cache.gprs.rcx as u32;
        if SWITCHED_MSRS.contains(&index) {
            emulate::complete_rdmsr(cache, self.guest_msr(index));
        } else {
            emulate::emulate_rdmsr(cache);
        }
    }

    /// Complete a `WRMSR` exit. The guest area takes switched MSRs, so the
    /// value is live on the next entry.
    fn wrmsr(&mut self, cache: &mut GuestRegs) -> AxResult<ExitAction> {
        let index = cache.gprs.rcx as u32;
        let value = emulate::wrmsr_value(cache);
        match index {
            msr::IA32_EFER => {
                let paging = self.guest_cr0()? & CR0_PG != 0;
                match emulate::guest_efer(self.guest_msr(index), value, paging) {
                    Ok(efer) => {
                        self.set_guest_msr(index, efer);
                        self.set_ia32e_entry(efer & EFER_LMA != 0)?;
                    }
                    Err(gp) => return Ok(ExitAction::inject(gp)),
                }
            }
            _ if SWITCHED_MSRS.contains(&index) => self.set_guest_msr(index, value),
            _ => emulate::emulate_wrmsr(cache),
        }
        Ok(ExitAction::handled(true))
    }

    /// Write the host state, which differs between CPUs.
    fn setup_host_fields(&self) -> AxResult {
        use self::vmcs::*;
        let host = self.hal.host_state();
        self.vmwrite(HOST_CR0, host.cr0)?;
        self.vmwrite(HOST_CR3, host.cr3)?;
        self.vmwrite(HOST_CR4, host.cr4)?;
        self.vmwrite(HOST_CS_SELECTOR, host.cs as u64)?;
        self.vmwrite(HOST_SS_SELECTOR, host.ss as u64)?;
        self.vmwrite(HOST_DS_SELECTOR, host.ds as u64)?;
        self.vmwrite(HOST_ES_SELECTOR, host.es as u64)?;
        self.vmwrite(HOST_FS_SELECTOR, host.fs as u64)?;
        self.vmwrite(HOST_GS_SELECTOR, host.gs as u64)?;
        self.vmwrite(HOST_TR_SELECTOR, host.tr as u64)?;
        self.vmwrite(HOST_GDTR_BASE, host.gdtr_base)?;
        self.vmwrite(HOST_IDTR_BASE, host.idtr_base)?;
        self.vmwrite(HOST_TR_BASE, host.tr_base)?;
        self.vmwrite(VMCS_LINK_POINTER, u64::MAX)?;
        Ok(())
    }

    /// Negotiate the control fields for a guest with `EFER.LMA == lma`.
    fn compute_controls(&self, lma: bool) -> AxResult<VmxControls> {
        let caps = &self.caps;
        let ept = self.mode == VirtMode::Ept;

        let pin_want1 = PinbasedControls::EXTERNAL_INTERRUPT_EXITING | PinbasedControls::NMI_EXITING;
        let pin = compute_ctrl(caps.pin, ControlClass::Pinbased, pin_want1.bits(), 0)?;

        let mut proc_want1 = PrimaryControls::HLT_EXITING
            | PrimaryControls::MWAIT_EXITING
            | PrimaryControls::MONITOR_EXITING
            | PrimaryControls::UNCOND_IO_EXITING
            | PrimaryControls::USE_MSR_BITMAPS;
        let mut proc_want0 = PrimaryControls::INTERRUPT_WINDOW_EXITING;
        if ept {
            proc_want1 |= PrimaryControls::SECONDARY_CONTROLS;
            proc_want0 |= PrimaryControls::CR3_LOAD_EXITING | PrimaryControls::CR3_STORE_EXITING;
        }
        let proc = compute_ctrl(
            caps.proc,
            ControlClass::Procbased,
            proc_want1.bits(),
            proc_want0.bits(),
        )?;

        let proc2 = if proc & PrimaryControls::SECONDARY_CONTROLS.bits() != 0 {
            let mut want1 = SecondaryControls::empty();
            if ept {
                want1 |= SecondaryControls::ENABLE_EPT;
                if caps.ug_capable() {
                    want1 |= SecondaryControls::UNRESTRICTED_GUEST;
                }
            }
            if caps.vpid_capable() {
                want1 |= SecondaryControls::ENABLE_VPID;
            }
            compute_ctrl(caps.proc2, ControlClass::Procbased2, want1.bits(), !want1.bits())?
        } else {
            0
        };

        let exit_want1 = ExitControls::ACK_INTERRUPT_ON_EXIT | ExitControls::HOST_ADDRESS_SPACE_SIZE;
        let exit = compute_ctrl(caps.exit, ControlClass::Exit, exit_want1.bits(), 0)?;

        let mut entry_want1 = EntryControls::empty();
        let mut entry_want0 = EntryControls::ENTRY_TO_SMM
            | EntryControls::DEACTIVATE_DUAL_MONITOR
            | EntryControls::LOAD_DEBUG_CONTROLS
            | EntryControls::LOAD_IA32_PERF_GLOBAL_CTRL;
        if lma {
            entry_want1 |= EntryControls::IA32E_MODE_GUEST;
        } else {
            entry_want0 |= EntryControls::IA32E_MODE_GUEST;
        }
        let entry = compute_ctrl(
            caps.entry,
            ControlClass::Entry,
            entry_want1.bits(),
            entry_want0.bits(),
        )?;

        Ok(VmxControls {
            pin,
            proc,
            proc2,
            exit,
            entry,
        })
    }

    /// The EPT pointer for a second-level table rooted at `root`.
    fn eptp(&self, root: PhysAddr) -> AxResult<u64> {
        let cap = self.caps.ept_vpid;
        if !cap.get_bit(EPT_CAP_WALK_4) || !cap.get_bit(EPT_CAP_WB) {
            return ax_err!(Unsupported, "EPT lacks 4-level walk or write-back");
        }
        let mut eptp = root.as_usize() as u64 | (3 << 3) | 6;
        if cap.get_bit(EPT_CAP_AD) {
            eptp |= 1 << 6;
        }
        Ok(eptp)
    }

    /// CR0 as the guest will run with it, or `InvalidInput` if it violates
    /// the fixed bits.
    fn fixed_cr0(&self, cr0: u64, unrestricted: bool) -> AxResult<u64> {
        let cr0 = cr0 | CR0_NE;
        let mut must1 = self.caps.cr0_fixed0 & self.caps.cr0_fixed1;
        let must0 = !self.caps.cr0_fixed0 & !self.caps.cr0_fixed1;
        if unrestricted {
            must1 &= !(CR0_PE | CR0_PG);
        }
        if cr0 & must1 != must1 || cr0 & must0 != 0 || (cr0 & CR0_PG != 0 && cr0 & CR0_PE == 0) {
            warn!("guest CR0 {:#x} violates VMX fixed bits", cr0);
            return ax_err!(InvalidInput, "CR0 incompatible with VMX fixed bits");
        }
        Ok(cr0)
    }

    fn fixed_cr4(&self, cr4: u64) -> AxResult<u64> {
        let must1 = self.caps.cr4_fixed0 & self.caps.cr4_fixed1;
        let must0 = !self.caps.cr4_fixed0 & !self.caps.cr4_fixed1;
        let cr4 = cr4 | must1;
        if cr4 & must0 != 0 {
            warn!("guest CR4 {:#x} violates VMX fixed bits", cr4);
            return ax_err!(InvalidInput, "CR4 incompatible with VMX fixed bits");
        }
        Ok(cr4)
    }

    fn check_with(&self, mask: RegMask, state: &RegisterState, unrestricted: bool) -> AxResult {
        if mask.contains(RegMask::CRS) {
            self.fixed_cr0(state.crs.cr0, unrestricted)?;
            self.fixed_cr4(state.crs.cr4)?;
        }
        Ok(())
    }

    fn write_controls(&self, ctls: &VmxControls) -> AxResult {
        use self::vmcs::*;
        self.vmwrite(PINBASED_CTLS, ctls.pin as u64)?;
        self.vmwrite(PROCBASED_CTLS, ctls.proc as u64)?;
        if ctls.proc & PrimaryControls::SECONDARY_CONTROLS.bits() != 0 {
            self.vmwrite(PROCBASED_CTLS2, ctls.proc2 as u64)?;
        }
        self.vmwrite(VMEXIT_CTLS, ctls.exit as u64)?;
        self.vmwrite(VMENTRY_CTLS, ctls.entry as u64)?;
        Ok(())
    }

    fn write_static_fields(&self, setup: &VCpuSetup, eptp: Option<u64>) -> AxResult {
        use self::vmcs::*;
        self.vmwrite(EXCEPTION_BITMAP, 0)?;
        self.vmwrite(CR3_TARGET_COUNT, 0)?;
        if let Some(eptp) = eptp {
            self.vmwrite(EPT_POINTER, eptp)?;
        }
        self.vmwrite(VIRTUAL_PROCESSOR_ID, self.vpid as u64)?;
        self.vmwrite(MSR_BITMAP, self.msr_bitmap.start_paddr().as_usize() as u64)?;

        let guest = self.guest_msrs.start_paddr().as_usize() as u64;
        let host = self.host_msrs.start_paddr().as_usize() as u64;
        let count = SWITCHED_MSRS.len() as u64;
        self.vmwrite(VMEXIT_MSR_STORE_ADDR, guest)?;
        self.vmwrite(VMEXIT_MSR_STORE_COUNT, count)?;
        self.vmwrite(VMENTRY_MSR_LOAD_ADDR, guest)?;
        self.vmwrite(VMENTRY_MSR_LOAD_COUNT, count)?;
        self.vmwrite(VMEXIT_MSR_LOAD_ADDR, host)?;
        self.vmwrite(VMEXIT_MSR_LOAD_COUNT, count)?;

        self.vmwrite(GUEST_ACTIVITY_STATE, 0)?;
        self.vmwrite(GUEST_INTERRUPTIBILITY_STATE, 0)?;
        self.vmwrite(VMENTRY_INTERRUPTION_INFO, 0)?;
        trace!(
            "VM {} vcpu {}: VMCS {:#x} static fields written",
            setup.vm_id,
            setup.vcpu_id,
            self.vmcs.start_paddr()
        );
        Ok(())
    }

    fn program(
        &mut self,
        ctls: &VmxControls,
        setup: &VCpuSetup,
        eptp: Option<u64>,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult {
        self.write_controls(ctls)?;
        self.write_static_fields(setup, eptp)?;
        self.write_registers(RegMask::ALL, state, cache)
    }

    fn vmx_exit_action(&mut self, ectx: &ExitContext<H>, cache: &mut GuestRegs) -> AxResult<ExitAction> {
        use self::vmcs::*;
        let raw = self.vmread(EXIT_REASON)? as u32;
        self.last_exit = raw;
        if raw & reason::ENTRY_FAILURE != 0 {
            error!(
                "VM {} vcpu {}: VM entry failed, reason {}",
                ectx.vm_id,
                ectx.vcpu_id,
                raw & 0xffff
            );
            return Ok(ExitAction::fatal());
        }

        let action = match raw & 0xffff {
            reason::EXTERNAL_INTERRUPT => {
                let info = self.vmread(VMEXIT_INTERRUPTION_INFO)?;
                if info.get_bit(31) {
                    ectx.hal.handle_host_irq(info as u8);
                }
                ExitAction::handled(false)
            }
            reason::EXCEPTION_NMI => {
                let info = self.vmread(VMEXIT_INTERRUPTION_INFO)?;
                // Only NMIs exit here: the exception bitmap is empty.
                if info.get_bits(8..11) == 2 {
                    ectx.hal.handle_host_irq(2);
                    ExitAction::handled(false)
                } else {
                    error!("unexpected exception exit, info {:#x}", info);
                    ExitAction::fatal()
                }
            }
            reason::INTERRUPT_WINDOW => {
                if self.rflags()? & RFLAGS_IF == 0 {
                    error!("interrupt window exit with guest interrupts disabled");
                    ExitAction::fatal()
                } else {
                    self.set_interrupt_window(false)?;
                    ExitAction::handled(false)
                }
            }
            reason::EPT_VIOLATION => {
                let qual = self.vmread(EXIT_QUALIFICATION)?;
                let gpa = crate::mem::GuestPhysAddr::from_usize(self.vmread(GUEST_PHYSICAL_ADDR)? as usize);
                let access = if qual.get_bit(1) {
                    FaultAccess::Write
                } else if qual.get_bit(2) {
                    FaultAccess::Execute
                } else {
                    FaultAccess::Read
                };
                emulate::nested_fault(ectx, gpa, access)
            }
            reason::CPUID => {
                emulate::emulate_cpuid(ectx.hal, ectx.vcpu_id, cache);
                ExitAction::handled(true)
            }
            reason::IO_INSTRUCTION => {
                let qual = self.vmread(EXIT_QUALIFICATION)?;
                let mut io = IoAccess {
                    port: qual.get_bits(16..32) as u16,
                    size: qual.get_bits(0..3) as u8 + 1,
                    is_in: qual.get_bit(3),
                    string: qual.get_bit(4),
                    rep: qual.get_bit(5),
                    data: 0,
                };
                if emulate::complete_io(&mut io, cache) {
                    ExitAction::need_help(VCpuExitReason::Io(io), true)
                } else {
                    ExitAction::handled(true)
                }
            }
            reason::HLT => ExitAction::need_help(VCpuExitReason::Halt, true),
            reason::CR_ACCESS => self.cr_access(cache)?,
            reason::RDMSR => {
                self.rdmsr(cache);
                ExitAction::handled(true)
            }
            reason::WRMSR => self.wrmsr(cache)?,
            reason::XSETBV => match emulate::emulate_xsetbv(ectx.hal, cache) {
                Ok(()) => ExitAction::handled(true),
                Err(gp) => ExitAction::inject(gp),
            },
            reason::VMCALL
            | reason::VMCLEAR
            | reason::VMLAUNCH
            | reason::VMPTRLD
            | reason::VMPTRST
            | reason::VMREAD
            | reason::VMRESUME
            | reason::VMWRITE
            | reason::VMXOFF
            | reason::VMXON
            | reason::INVEPT
            | reason::INVVPID
            | reason::VMFUNC => ExitAction::inject(Event::exception(vector::UD)),
            reason::TRIPLE_FAULT => ExitAction::need_help(VCpuExitReason::Shutdown, false),
            other => {
                error!(
                    "VM {} vcpu {}: unhandled VMX exit reason {}",
                    ectx.vm_id, ectx.vcpu_id, other
                );
                ExitAction::fatal()
            }
        };
        Ok(action)
    }
}

impl<H: AxVmmHal> ControlBlockOps<H> for VmxVcpu<H> {
    fn paddr(&self) -> PhysAddr {
        self.vmcs.start_paddr()
    }

    fn load(&mut self, ctx: &VmmContext<H>) -> AxResult {
        let cpu = self.hal.current_cpu();
        if let Some(other) = self.loaded_on.filter(|&c| c != cpu) {
            return ax_err!(
                BadState,
                format!("VMCS still active on CPU {other}, clear it before loading on CPU {cpu}")
            );
        }
        let percpu = ctx.percpu().get(cpu)?;
        percpu.set_loaded(self.paddr())?;
        if let Err(e) = self.hal.vmptrld(self.paddr()) {
            percpu.clear_loaded(self.paddr());
            return Err(e);
        }
        self.loaded_on = Some(cpu);
        Ok(())
    }

    fn release(&mut self, ctx: &VmmContext<H>) -> AxResult {
        let Some(cpu) = self.loaded_on else {
            return Ok(());
        };
        self.hal.vmclear(self.paddr())?;
        ctx.percpu().get(cpu)?.clear_loaded(self.paddr());
        self.loaded_on = None;
        self.launched = false;
        Ok(())
    }

    fn reset_to_poweron(
        &mut self,
        ctx: &VmmContext<H>,
        setup: &VCpuSetup,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult {
        let ctls = self.compute_controls(state.msrs.efer & EFER_LMA != 0)?;
        self.check_with(RegMask::ALL, state, ctls.unrestricted_guest())?;
        let eptp = if self.mode == VirtMode::Ept {
            Some(self.eptp(setup.nested_root)?)
        } else {
            None
        };

        let fresh_vpid = if ctls.vpid() && self.vpid == 0 {
            self.vpid = ctx.vpids().alloc()?;
            true
        } else {
            false
        };
        self.unrestricted = ctls.unrestricted_guest();

        let ret = self.program(&ctls, setup, eptp, state, cache);
        if ret.is_err() && fresh_vpid {
            ctx.vpids().free(self.vpid);
            self.vpid = 0;
        }
        ret
    }

    fn check_registers(&self, mask: RegMask, state: &RegisterState) -> AxResult {
        self.check_with(mask, state, self.unrestricted)
    }

    fn read_registers(&self, mask: RegMask, cache: &GuestRegs) -> AxResult<RegisterState> {
        use self::vmcs::*;
        let mut state = RegisterState::default();
        cache.store(mask, &mut state);

        if mask.contains(RegMask::GPRS) {
            state.gprs.rsp = self.vmread(GUEST_RSP)?;
            state.rip = self.vmread(GUEST_RIP)?;
            state.rflags = self.vmread(GUEST_RFLAGS)?;
        }
        if mask.contains(RegMask::SREGS) {
            for seg in SegReg::ALL {
                let (sel, limit, ar, base) = guest_seg_fields(seg);
                state.segs[seg as usize] = Segment {
                    selector: self.vmread(sel)? as u16,
                    limit: self.vmread(limit)? as u32,
                    ar: self.vmread(ar)? as u32,
                    base: self.vmread(base)?,
                };
            }
            state.gdtr = DescTable {
                limit: self.vmread(GUEST_GDTR_LIMIT)? as u32,
                base: self.vmread(GUEST_GDTR_BASE)?,
            };
            state.idtr = DescTable {
                limit: self.vmread(GUEST_IDTR_LIMIT)? as u32,
                base: self.vmread(GUEST_IDTR_BASE)?,
            };
        }
        if mask.contains(RegMask::CRS) {
            state.crs.cr0 = self.vmread(GUEST_CR0)?;
            state.crs.cr3 = self.vmread(GUEST_CR3)?;
            state.crs.cr4 = self.vmread(GUEST_CR4)?;
        }
        if mask.contains(RegMask::MSRS) {
            let m = &mut state.msrs;
            m.efer = self.guest_msr(msr::IA32_EFER);
            m.star = self.guest_msr(msr::IA32_STAR);
            m.lstar = self.guest_msr(msr::IA32_LSTAR);
            m.cstar = self.guest_msr(msr::IA32_CSTAR);
            m.sfmask = self.guest_msr(msr::IA32_FMASK);
            m.kernel_gs_base = self.guest_msr(msr::IA32_KERNEL_GSBASE);
        }
        if mask.contains(RegMask::DRS) {
            state.drs.dr7 = self.vmread(GUEST_DR7)?;
        }
        Ok(state)
    }

    fn write_registers(
        &mut self,
        mask: RegMask,
        state: &RegisterState,
        cache: &mut GuestRegs,
    ) -> AxResult {
        use self::vmcs::*;
        if mask.contains(RegMask::GPRS) {
            self.vmwrite(GUEST_RSP, state.gprs.rsp)?;
            self.vmwrite(GUEST_RIP, state.rip)?;
            self.vmwrite(GUEST_RFLAGS, state.rflags | RFLAGS_RESERVED_1)?;
        }
        if mask.contains(RegMask::SREGS) {
            for seg in SegReg::ALL {
                let (sel, limit, ar, base) = guest_seg_fields(seg);
                let s = state.seg(seg);
                self.vmwrite(sel, s.selector as u64)?;
                self.vmwrite(limit, s.limit as u64)?;
                self.vmwrite(ar, s.ar as u64)?;
                self.vmwrite(base, s.base)?;
            }
            self.vmwrite(GUEST_GDTR_LIMIT, state.gdtr.limit as u64)?;
            self.vmwrite(GUEST_GDTR_BASE, state.gdtr.base)?;
            self.vmwrite(GUEST_IDTR_LIMIT, state.idtr.limit as u64)?;
            self.vmwrite(GUEST_IDTR_BASE, state.idtr.base)?;
        }
        if mask.contains(RegMask::CRS) {
            let cr0 = self.fixed_cr0(state.crs.cr0, self.unrestricted)?;
            let cr4 = self.fixed_cr4(state.crs.cr4)?;
            let cr0_owned = (self.caps.cr0_fixed0 & self.caps.cr0_fixed1) | CR0_NE;
            let cr4_owned = self.caps.cr4_fixed0 & self.caps.cr4_fixed1;
            self.vmwrite(GUEST_CR0, cr0)?;
            self.vmwrite(CR0_GUEST_HOST_MASK, cr0_owned)?;
            self.vmwrite(CR0_READ_SHADOW, state.crs.cr0)?;
            self.vmwrite(GUEST_CR3, state.crs.cr3)?;
            self.vmwrite(GUEST_CR4, cr4)?;
            self.vmwrite(CR4_GUEST_HOST_MASK, cr4_owned)?;
            self.vmwrite(CR4_READ_SHADOW, state.crs.cr4)?;
        }
        if mask.contains(RegMask::MSRS) {
            let m = &state.msrs;
            self.set_guest_msr(msr::IA32_EFER, m.efer);
            self.set_guest_msr(msr::IA32_STAR, m.star);
            self.set_guest_msr(msr::IA32_LSTAR, m.lstar);
            self.set_guest_msr(msr::IA32_CSTAR, m.cstar);
            self.set_guest_msr(msr::IA32_FMASK, m.sfmask);
            self.set_guest_msr(msr::IA32_KERNEL_GSBASE, m.kernel_gs_base);
            self.set_ia32e_entry(m.efer & EFER_LMA != 0)?;
        }
        if mask.contains(RegMask::DRS) {
            self.vmwrite(GUEST_DR7, state.drs.dr7)?;
        }
        cache.load(mask, state);
        Ok(())
    }

    fn deinit(&mut self, ctx: &VmmContext<H>) {
        if self.vpid != 0 {
            ctx.vpids().free(self.vpid);
            self.vpid = 0;
        }
    }

    fn prepare_entry(&mut self, moved: bool) -> AxResult {
        if moved {
            self.setup_host_fields()?;
        }
        Ok(())
    }

    fn rip(&self) -> AxResult<u64> {
        self.vmread(vmcs::GUEST_RIP)
    }

    fn set_rip(&mut self, rip: u64) -> AxResult {
        self.vmwrite(vmcs::GUEST_RIP, rip)
    }

    fn rflags(&self) -> AxResult<u64> {
        self.vmread(vmcs::GUEST_RFLAGS)
    }

    fn interruptible(&self) -> AxResult<bool> {
        let blocking = self.vmread(vmcs::GUEST_INTERRUPTIBILITY_STATE)?;
        Ok(self.rflags()? & RFLAGS_IF != 0 && blocking & BLOCKING_BY_STI_OR_MOV_SS == 0)
    }

    fn inject_event(&mut self, event: Event) -> AxResult {
        let (info, error_code) = event.encode();
        if let Some(code) = error_code {
            self.vmwrite(vmcs::VMENTRY_EXCEPTION_ERROR_CODE, code as u64)?;
        }
        self.vmwrite(vmcs::VMENTRY_INTERRUPTION_INFO, info as u64)
    }

    fn set_interrupt_window(&mut self, armed: bool) -> AxResult {
        let mut proc = PrimaryControls::from_bits_retain(self.vmread(vmcs::PROCBASED_CTLS)? as u32);
        if proc.contains(PrimaryControls::INTERRUPT_WINDOW_EXITING) == armed {
            return Ok(());
        }
        if armed && !can_set(self.caps.proc, PrimaryControls::INTERRUPT_WINDOW_EXITING.bits()) {
            return ax_err!(Unsupported, "no interrupt-window exiting");
        }
        proc.set(PrimaryControls::INTERRUPT_WINDOW_EXITING, armed);
        self.vmwrite(vmcs::PROCBASED_CTLS, proc.bits() as u64)
    }

    fn enter(&mut self, cache: &mut GuestRegs) -> Result<(), EntryFailure> {
        if self.vpid != 0 {
            self.hal.invvpid(self.vpid);
        }
        self.hal.vmx_enter_guest(self.launched, cache)?;
        self.launched = true;
        Ok(())
    }

    fn handle_exit(&mut self, ectx: &ExitContext<H>, cache: &mut GuestRegs) -> AxResult<ExitAction> {
        self.vmx_exit_action(ectx, cache)
    }

    fn exit_instruction_len(&self) -> AxResult<u64> {
        self.vmread(vmcs::VMEXIT_INSTRUCTION_LEN)
    }

    fn exit_reason(&self) -> u64 {
        self.last_exit as u64
    }
}
