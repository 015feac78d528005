use axerrno::{ax_err, AxResult};
use bitflags::bitflags;

bitflags! {
    /// Pin-based VM-execution controls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PinbasedControls: u32 {
        const EXTERNAL_INTERRUPT_EXITING = 1 << 0;
        const NMI_EXITING = 1 << 3;
        const VIRTUAL_NMIS = 1 << 5;
        const VMX_PREEMPTION_TIMER = 1 << 6;
        const POSTED_INTERRUPTS = 1 << 7;
    }
}

bitflags! {
    /// Primary processor-based VM-execution controls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrimaryControls: u32 {
        const INTERRUPT_WINDOW_EXITING = 1 << 2;
        const USE_TSC_OFFSETTING = 1 << 3;
        const HLT_EXITING = 1 << 7;
        const INVLPG_EXITING = 1 << 9;
        const MWAIT_EXITING = 1 << 10;
        const RDPMC_EXITING = 1 << 11;
        const RDTSC_EXITING = 1 << 12;
        const CR3_LOAD_EXITING = 1 << 15;
        const CR3_STORE_EXITING = 1 << 16;
        const CR8_LOAD_EXITING = 1 << 19;
        const CR8_STORE_EXITING = 1 << 20;
        const USE_TPR_SHADOW = 1 << 21;
        const NMI_WINDOW_EXITING = 1 << 22;
        const MOV_DR_EXITING = 1 << 23;
        const UNCOND_IO_EXITING = 1 << 24;
        const USE_IO_BITMAPS = 1 << 25;
        const MONITOR_TRAP_FLAG = 1 << 27;
        const USE_MSR_BITMAPS = 1 << 28;
        const MONITOR_EXITING = 1 << 29;
        const PAUSE_EXITING = 1 << 30;
        const SECONDARY_CONTROLS = 1 << 31;
    }
}

bitflags! {
    /// Secondary processor-based VM-execution controls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecondaryControls: u32 {
        const VIRTUALIZE_APIC = 1 << 0;
        const ENABLE_EPT = 1 << 1;
        const DESCRIPTOR_TABLE_EXITING = 1 << 2;
        const ENABLE_RDTSCP = 1 << 3;
        const VIRTUALIZE_X2APIC = 1 << 4;
        const ENABLE_VPID = 1 << 5;
        const WBINVD_EXITING = 1 << 6;
        const UNRESTRICTED_GUEST = 1 << 7;
        const ENABLE_INVPCID = 1 << 12;
        const ENABLE_XSAVES = 1 << 20;
    }
}

bitflags! {
    /// VM-exit controls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExitControls: u32 {
        const SAVE_DEBUG_CONTROLS = 1 << 2;
        const HOST_ADDRESS_SPACE_SIZE = 1 << 9;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 12;
        const ACK_INTERRUPT_ON_EXIT = 1 << 15;
        const SAVE_IA32_PAT = 1 << 18;
        const LOAD_IA32_PAT = 1 << 19;
        const SAVE_IA32_EFER = 1 << 20;
        const LOAD_IA32_EFER = 1 << 21;
    }
}

bitflags! {
    /// VM-entry controls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryControls: u32 {
        const LOAD_DEBUG_CONTROLS = 1 << 2;
        const IA32E_MODE_GUEST = 1 << 9;
        const ENTRY_TO_SMM = 1 << 10;
        const DEACTIVATE_DUAL_MONITOR = 1 << 11;
        const LOAD_IA32_PERF_GLOBAL_CTRL = 1 << 13;
        const LOAD_IA32_PAT = 1 << 14;
        const LOAD_IA32_EFER = 1 << 15;
    }
}

/// The five VMX control fields negotiated against capability MSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlClass {
    Pinbased,
    Procbased,
    Procbased2,
    Exit,
    Entry,
}

impl ControlClass {
    /// Bits that are reserved-to-one in the non-"true" VMX capability
    /// reporting. A bit the hardware leaves free and the host has no
    /// opinion about takes its value from here.
    pub const fn default1(self) -> u32 {
        const fn bits(list: &[u32]) -> u32 {
            let mut mask = 0;
            let mut i = 0;
            while i < list.len() {
                mask |= 1 << list[i];
                i += 1;
            }
            mask
        }
        match self {
            ControlClass::Pinbased => bits(&[1, 2, 4]),
            ControlClass::Procbased => bits(&[1, 4, 5, 6, 8, 13, 14, 15, 16, 26]),
            ControlClass::Procbased2 => 0,
            ControlClass::Exit => bits(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 13, 14, 16, 17]),
            ControlClass::Entry => bits(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 12]),
        }
    }
}

/// Resolve the value of a 32-bit VMX control field.
///
/// `cap` is the capability MSR: a 0 in bit `i` means bit `i` may be 0, a 1
/// in bit `i + 32` means bit `i` may be 1. `want1` and `want0` name the bits
/// the host needs set and clear. Every bit ends up either forced by the
/// hardware, chosen by the policy, or taken from the class default; a
/// policy that contradicts a forced bit fails with `InvalidInput`.
pub fn compute_ctrl(cap: u64, class: ControlClass, want1: u32, want0: u32) -> AxResult<u32> {
    let may_clear = !(cap as u32);
    let may_set = (cap >> 32) as u32;
    let default1 = class.default1();

    let mut out = 0u32;
    for i in 0..32 {
        let bit = 1u32 << i;
        let set = may_set & bit != 0;
        let clear = may_clear & bit != 0;
        let one = match (set, clear) {
            (false, false) => {
                return ax_err!(InvalidInput, format!("{class:?} bit {i} has no legal value"));
            }
            (true, false) if want0 & bit != 0 => {
                return ax_err!(InvalidInput, format!("{class:?} bit {i} cannot be cleared"));
            }
            (true, false) => true,
            (false, true) if want1 & bit != 0 => {
                return ax_err!(InvalidInput, format!("{class:?} bit {i} cannot be set"));
            }
            (false, true) => false,
            (true, true) if want1 & bit != 0 => true,
            (true, true) if want0 & bit != 0 => false,
            (true, true) => default1 & bit != 0,
        };
        if one {
            out |= bit;
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axerrno::AxError;

    /// Capability with `fixed1` forced on, `fixed0` forced off, rest free.
    fn cap(fixed1: u32, fixed0: u32) -> u64 {
        let allowed1 = !fixed0;
        ((allowed1 as u64) << 32) | fixed1 as u64
    }

    #[test]
    fn forced_bits_win_over_defaults() {
        let c = cap(1 << 3, 1 << 1);
        let v = compute_ctrl(c, ControlClass::Pinbased, 0, 0).unwrap();
        assert_ne!(v & (1 << 3), 0);
        assert_eq!(v & (1 << 1), 0);
        // Free defaults for the pin class.
        assert_ne!(v & (1 << 2), 0);
        assert_ne!(v & (1 << 4), 0);
        assert_eq!(v & (1 << 0), 0);
    }

    #[test]
    fn policy_is_honoured_on_free_bits() {
        let c = cap(0, 0);
        let v = compute_ctrl(c, ControlClass::Pinbased, 1 << 0, 1 << 2).unwrap();
        assert_ne!(v & 1, 0);
        assert_eq!(v & (1 << 2), 0);
    }

    #[test]
    fn contradicting_policy_fails() {
        assert_eq!(
            compute_ctrl(cap(1 << 5, 0), ControlClass::Procbased, 0, 1 << 5),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            compute_ctrl(cap(0, 1 << 5), ControlClass::Procbased, 1 << 5, 0),
            Err(AxError::InvalidInput)
        );
        // Bit that may be neither set nor cleared.
        let broken = ((!(1u64 << 7) & 0xffff_ffff) << 32) | (1 << 7);
        assert!(compute_ctrl(broken, ControlClass::Entry, 0, 0).is_err());
    }

    #[test]
    fn result_respects_hardware_for_every_bit() {
        // Sweep a few capability patterns and random-ish policies.
        let mut seed = 0x2545_f491_4f6c_dd1du64;
        for _ in 0..256 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let fixed1 = seed as u32 & 0x0f0f_0f0f;
            let fixed0 = (seed >> 32) as u32 & !fixed1 & 0xf0f0_f0f0;
            let want1 = (seed >> 8) as u32 & !fixed0;
            let want0 = (seed >> 40) as u32 & !want1 & !fixed1;
            let class = ControlClass::Exit;
            let v = compute_ctrl(cap(fixed1, fixed0), class, want1, want0).unwrap();
            assert_eq!(v & fixed1, fixed1);
            assert_eq!(v & fixed0, 0);
            let free = !fixed1 & !fixed0;
            assert_eq!(v & free & want1, want1 & free);
            assert_eq!(v & free & want0, 0);
            let neutral = free & !want1 & !want0;
            assert_eq!(v & neutral, class.default1() & neutral);
        }
    }
}
