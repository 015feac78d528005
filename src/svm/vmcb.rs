//! VMCB layout (AMD APM Vol. 2, Appendix B).

#![allow(dead_code)]

use bitflags::bitflags;
use core::mem::{offset_of, size_of};

bitflags! {
    /// Intercept vector 3, VMCB offset 0x0c.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterceptMisc1: u32 {
        const INTR = 1 << 0;
        const NMI = 1 << 1;
        const SMI = 1 << 2;
        const INIT = 1 << 3;
        const VINTR = 1 << 4;
        const CPUID = 1 << 18;
        const HLT = 1 << 24;
        const IOIO_PROT = 1 << 27;
        const MSR_PROT = 1 << 28;
        const SHUTDOWN = 1 << 31;
    }
}

bitflags! {
    /// Intercept vector 4, VMCB offset 0x10.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterceptMisc2: u32 {
        const VMRUN = 1 << 0;
        const VMMCALL = 1 << 1;
        const VMLOAD = 1 << 2;
        const VMSAVE = 1 << 3;
        const STGI = 1 << 4;
        const CLGI = 1 << 5;
        const SKINIT = 1 << 6;
        const RDTSCP = 1 << 7;
        const MONITOR = 1 << 10;
        const MWAIT = 1 << 11;
        const XSETBV = 1 << 13;
    }
}

/// Exit codes.
pub mod exit_code {
    pub const INTR: u64 = 0x60;
    pub const NMI: u64 = 0x61;
    pub const VINTR: u64 = 0x64;
    pub const CPUID: u64 = 0x72;
    pub const HLT: u64 = 0x78;
    pub const IOIO: u64 = 0x7b;
    pub const MSR: u64 = 0x7c;
    pub const SHUTDOWN: u64 = 0x7f;
    pub const VMRUN: u64 = 0x80;
    pub const VMMCALL: u64 = 0x81;
    pub const VMLOAD: u64 = 0x82;
    pub const VMSAVE: u64 = 0x83;
    pub const STGI: u64 = 0x84;
    pub const CLGI: u64 = 0x85;
    pub const SKINIT: u64 = 0x86;
    pub const MONITOR: u64 = 0x8a;
    pub const MWAIT: u64 = 0x8b;
    pub const XSETBV: u64 = 0x8d;
    pub const NPF: u64 = 0x400;
    pub const INVALID: u64 = u64::MAX;
}

/// `int_control`: virtual interrupt pending.
pub const V_IRQ: u64 = 1 << 8;
/// `int_control`: ignore the virtual TPR for `V_IRQ`.
pub const V_IGN_TPR: u64 = 1 << 20;
/// `int_control`: virtualize interrupt masking.
pub const V_INTR_MASKING: u64 = 1 << 24;
/// `int_state`: the guest is in an interrupt shadow.
pub const INTERRUPT_SHADOW: u64 = 1 << 0;
/// `nested_ctl`: enable nested paging.
pub const NP_ENABLE: u64 = 1 << 0;
/// `tlb_control`: flush this guest's ASID.
pub const TLB_FLUSH_GUEST: u32 = 3;

#[repr(C)]
#[derive(Debug)]
pub struct ControlArea {
    pub intercept_cr: u32,                  // +0x000
    pub intercept_dr: u32,                  // +0x004
    pub intercept_exceptions: u32,          // +0x008
    pub intercept_misc1: u32,               // +0x00c
    pub intercept_misc2: u32,               // +0x010
    pub intercept_misc3: u32,               // +0x014
    _reserved1: [u8; 0x03c - 0x018],        // +0x018
    pub pause_filter_threshold: u16,        // +0x03c
    pub pause_filter_count: u16,            // +0x03e
    pub iopm_base_pa: u64,                  // +0x040
    pub msrpm_base_pa: u64,                 // +0x048
    pub tsc_offset: u64,                    // +0x050
    pub guest_asid: u32,                    // +0x058
    pub tlb_control: u32,                   // +0x05c
    pub int_control: u64,                   // +0x060
    pub int_state: u64,                     // +0x068
    pub exit_code: u64,                     // +0x070
    pub exit_info_1: u64,                   // +0x078
    pub exit_info_2: u64,                   // +0x080
    pub exit_int_info: u64,                 // +0x088
    pub nested_ctl: u64,                    // +0x090
    pub avic_apic_bar: u64,                 // +0x098
    pub ghcb_pa: u64,                       // +0x0a0
    pub event_inj: u64,                     // +0x0a8
    pub nested_cr3: u64,                    // +0x0b0
    pub virt_ext: u64,                      // +0x0b8
    pub clean_bits: u32,                    // +0x0c0
    _reserved2: u32,                        // +0x0c4
    pub next_rip: u64,                      // +0x0c8
    pub insn_len: u8,                       // +0x0d0
    pub insn_bytes: [u8; 15],               // +0x0d1
    _reserved3: [u8; 0x400 - 0x0e0],        // +0x0e0
}

/// A segment in the state save area.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VmcbSegment {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}

#[repr(C)]
#[derive(Debug)]
pub struct SaveArea {
    pub es: VmcbSegment,                    // +0x000
    pub cs: VmcbSegment,                    // +0x010
    pub ss: VmcbSegment,                    // +0x020
    pub ds: VmcbSegment,                    // +0x030
    pub fs: VmcbSegment,                    // +0x040
    pub gs: VmcbSegment,                    // +0x050
    pub gdtr: VmcbSegment,                  // +0x060
    pub ldtr: VmcbSegment,                  // +0x070
    pub idtr: VmcbSegment,                  // +0x080
    pub tr: VmcbSegment,                    // +0x090
    _reserved1: [u8; 0x0cb - 0x0a0],        // +0x0a0
    pub cpl: u8,                            // +0x0cb
    _reserved2: u32,                        // +0x0cc
    pub efer: u64,                          // +0x0d0
    _reserved3: [u8; 0x148 - 0x0d8],        // +0x0d8
    pub cr4: u64,                           // +0x148
    pub cr3: u64,                           // +0x150
    pub cr0: u64,                           // +0x158
    pub dr7: u64,                           // +0x160
    pub dr6: u64,                           // +0x168
    pub rflags: u64,                        // +0x170
    pub rip: u64,                           // +0x178
    _reserved4: [u8; 0x1d8 - 0x180],        // +0x180
    pub rsp: u64,                           // +0x1d8
    _reserved5: [u8; 0x1f8 - 0x1e0],        // +0x1e0
    pub rax: u64,                           // +0x1f8
    pub star: u64,                          // +0x200
    pub lstar: u64,                         // +0x208
    pub cstar: u64,                         // +0x210
    pub sfmask: u64,                        // +0x218
    pub kernel_gs_base: u64,                // +0x220
    pub sysenter_cs: u64,                   // +0x228
    pub sysenter_esp: u64,                  // +0x230
    pub sysenter_eip: u64,                  // +0x238
    pub cr2: u64,                           // +0x240
    _reserved6: [u8; 0x268 - 0x248],        // +0x248
    pub g_pat: u64,                         // +0x268
    _reserved7: [u8; 0xc00 - 0x270],        // +0x270
}

/// The whole 4 KiB VMCB.
#[repr(C)]
#[derive(Debug)]
pub struct Vmcb {
    pub control: ControlArea,
    pub save: SaveArea,
}

const _: () = assert!(size_of::<ControlArea>() == 0x400);
const _: () = assert!(size_of::<SaveArea>() == 0xc00);
const _: () = assert!(size_of::<Vmcb>() == 0x1000);
const _: () = assert!(offset_of!(ControlArea, iopm_base_pa) == 0x40);
const _: () = assert!(offset_of!(ControlArea, guest_asid) == 0x58);
const _: () = assert!(offset_of!(ControlArea, exit_code) == 0x70);
const _: () = assert!(offset_of!(ControlArea, nested_ctl) == 0x90);
const _: () = assert!(offset_of!(ControlArea, event_inj) == 0xa8);
const _: () = assert!(offset_of!(ControlArea, clean_bits) == 0xc0);
const _: () = assert!(offset_of!(ControlArea, next_rip) == 0xc8);
const _: () = assert!(offset_of!(SaveArea, cpl) == 0xcb);
const _: () = assert!(offset_of!(SaveArea, efer) == 0xd0);
const _: () = assert!(offset_of!(SaveArea, cr4) == 0x148);
const _: () = assert!(offset_of!(SaveArea, rip) == 0x178);
const _: () = assert!(offset_of!(SaveArea, rsp) == 0x1d8);
const _: () = assert!(offset_of!(SaveArea, rax) == 0x1f8);
const _: () = assert!(offset_of!(SaveArea, cr2) == 0x240);
const _: () = assert!(offset_of!(SaveArea, g_pat) == 0x268);
