use bitflags::bitflags;

use crate::defs::*;

bitflags! {
    /// Register classes selected by a read or write request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegMask: u32 {
        /// General purpose registers, RIP and RFLAGS.
        const GPRS = 1 << 0;
        /// Segment registers and descriptor tables.
        const SREGS = 1 << 1;
        /// CR0, CR2, CR3, CR4 and XCR0.
        const CRS = 1 << 2;
        /// The saved model-specific registers.
        const MSRS = 1 << 3;
        /// Debug registers.
        const DRS = 1 << 4;
        const ALL = Self::GPRS.bits() | Self::SREGS.bits() | Self::CRS.bits()
            | Self::MSRS.bits() | Self::DRS.bits();
    }
}

/// General purpose registers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralRegisters {
    /// Register `index` in instruction encoding order (RAX, RCX, RDX, RBX,
    /// RSP, RBP, RSI, RDI, R8..R15).
    pub fn get(&self, index: usize) -> u64 {
        match index & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    pub fn set(&mut self, index: usize, value: u64) {
        let reg = match index & 0xf {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };
        *reg = value;
    }
}

/// Segment registers in the order they are stored in [`RegisterState::segs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es = 0,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

impl SegReg {
    pub const ALL: [SegReg; 8] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
        SegReg::Ldtr,
        SegReg::Tr,
    ];
}

/// Access rights bit marking a segment unusable (VMX layout).
pub const SEG_AR_UNUSABLE: u32 = 1 << 16;

/// A segment register.
///
/// `ar` uses the VMX access-rights layout: descriptor bits 40..=47 in 0..=7,
/// bits 52..=55 in 12..=15 and the unusable flag in bit 16.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub selector: u16,
    pub limit: u32,
    pub ar: u32,
    pub base: u64,
}

impl Segment {
    pub const fn new(selector: u16, base: u64, limit: u32, ar: u32) -> Self {
        Self {
            selector,
            limit,
            ar,
            base,
        }
    }

    /// Access rights in the SVM `attrib` layout.
    pub const fn svm_attrib(&self) -> u16 {
        ((self.ar & 0xff) | ((self.ar >> 4) & 0xf00)) as u16
    }

    /// Convert SVM `attrib` bits back to the VMX access-rights layout.
    pub const fn ar_from_svm(attrib: u16) -> u32 {
        let attrib = attrib as u32;
        if attrib == 0 {
            SEG_AR_UNUSABLE
        } else {
            (attrib & 0xff) | ((attrib & 0xf00) << 4)
        }
    }
}

/// GDTR or IDTR.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescTable {
    pub limit: u32,
    pub base: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlRegs {
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub xcr0: u64,
}

/// The model-specific registers carried in a [`RegisterState`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestMsrs {
    pub efer: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,
    pub misc_enable: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DebugRegs {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

/// Family independent snapshot of a vcpu's architectural state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegisterState {
    pub gprs: GeneralRegisters,
    pub rip: u64,
    pub rflags: u64,
    pub segs: [Segment; 8],
    pub gdtr: DescTable,
    pub idtr: DescTable,
    pub crs: ControlRegs,
    pub msrs: GuestMsrs,
    pub drs: DebugRegs,
}

impl RegisterState {
    /// State of a processor right after RESET: real mode at `F000:FFF0`.
    pub fn power_on() -> Self {
        let data = Segment::new(0, 0, 0xffff, 0x93);
        let mut segs = [data; 8];
        segs[SegReg::Cs as usize] = Segment::new(0xf000, 0xffff_0000, 0xffff, 0x9b);
        segs[SegReg::Ldtr as usize] = Segment::new(0, 0, 0xffff, 0x82);
        segs[SegReg::Tr as usize] = Segment::new(0, 0, 0xffff, 0x8b);
        Self {
            rip: 0xfff0,
            rflags: RFLAGS_RESERVED_1,
            segs,
            gdtr: DescTable {
                limit: 0xffff,
                base: 0,
            },
            idtr: DescTable {
                limit: 0xffff,
                base: 0,
            },
            crs: ControlRegs {
                cr0: CR0_CD | CR0_NW | CR0_ET,
                xcr0: XCR0_X87,
                ..Default::default()
            },
            drs: DebugRegs {
                dr6: DR6_RESERVED_1,
                dr7: DR7_RESERVED_1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Flat 32-bit paged protected mode, for VMX hosts that cannot run a
    /// guest with paging disabled. The loader places identity page tables
    /// at guest physical 0.
    pub fn flat_protected() -> Self {
        let data = Segment::new(0x10, 0, 0xffff_ffff, 0xc093);
        let mut segs = [data; 8];
        segs[SegReg::Cs as usize] = Segment::new(0x8, 0, 0xffff_ffff, 0xc09b);
        segs[SegReg::Ldtr as usize] = Segment::new(0, 0, 0, SEG_AR_UNUSABLE);
        segs[SegReg::Tr as usize] = Segment::new(0, 0, 0xffff, 0x8b);
        Self {
            rip: 0x10_0000,
            rflags: RFLAGS_RESERVED_1,
            segs,
            crs: ControlRegs {
                cr0: CR0_PG | CR0_NE | CR0_ET | CR0_PE,
                cr4: CR4_PAE,
                xcr0: XCR0_X87,
                ..Default::default()
            },
            drs: DebugRegs {
                dr6: DR6_RESERVED_1,
                dr7: DR7_RESERVED_1,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn seg(&self, seg: SegReg) -> &Segment {
        &self.segs[seg as usize]
    }
}

/// Registers the hardware does not switch on entry and exit, kept in
/// software for both families.
///
/// `gprs.rsp` is stale while the vcpu is live: the control block holds RSP.
/// `misc_enable` is emulated and never reaches hardware.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestRegs {
    pub gprs: GeneralRegisters,
    pub cr2: u64,
    pub xcr0: u64,
    pub db: [u64; 4],
    pub dr6: u64,
    pub misc_enable: u64,
}

impl GuestRegs {
    /// Merge the cached part of `state` selected by `mask`.
    pub fn load(&mut self, mask: RegMask, state: &RegisterState) {
        if mask.contains(RegMask::GPRS) {
            self.gprs = state.gprs;
        }
        if mask.contains(RegMask::CRS) {
            self.cr2 = state.crs.cr2;
            self.xcr0 = state.crs.xcr0;
        }
        if mask.contains(RegMask::MSRS) {
            self.misc_enable = state.msrs.misc_enable;
        }
        if mask.contains(RegMask::DRS) {
            let d = &state.drs;
            self.db = [d.dr0, d.dr1, d.dr2, d.dr3];
            self.dr6 = d.dr6;
        }
    }

    /// Copy the cached part selected by `mask` into `state`.
    pub fn store(&self, mask: RegMask, state: &mut RegisterState) {
        if mask.contains(RegMask::GPRS) {
            let rsp = state.gprs.rsp;
            state.gprs = self.gprs;
            state.gprs.rsp = rsp;
        }
        if mask.contains(RegMask::CRS) {
            state.crs.cr2 = self.cr2;
            state.crs.xcr0 = self.xcr0;
        }
        if mask.contains(RegMask::MSRS) {
            state.msrs.misc_enable = self.misc_enable;
        }
        if mask.contains(RegMask::DRS) {
            let d = &mut state.drs;
            [d.dr0, d.dr1, d.dr2, d.dr3] = self.db;
            d.dr6 = self.dr6;
        }
    }
}
