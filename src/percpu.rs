use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axerrno::{ax_err, AxResult};
use memory_addr::PhysAddr;

use crate::AxVmmHal;

const NONE_LOADED: usize = usize::MAX;

/// Virtualization state of one host CPU.
pub struct AxPerCpu {
    /// The id of the CPU.
    cpu_id: usize,
    /// Whether VMX/SVM operation is on.
    enabled: AtomicBool,
    /// Physical address of the control block current on this CPU.
    loaded: AtomicUsize,
}

impl AxPerCpu {
    const fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            enabled: AtomicBool::new(false),
            loaded: AtomicUsize::new(NONE_LOADED),
        }
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    /// Whether the CPU has hardware virtualization enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Enable hardware virtualization on this CPU.
    pub fn hardware_enable<H: AxVmmHal>(&self, hal: &H) -> AxResult {
        if self.is_enabled() {
            return ax_err!(BadState, "virtualization already enabled");
        }
        hal.hardware_enable(self.cpu_id)?;
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    /// Disable hardware virtualization on this CPU.
    pub fn hardware_disable<H: AxVmmHal>(&self, hal: &H) -> AxResult {
        if !self.is_enabled() {
            return Ok(());
        }
        hal.hardware_disable(self.cpu_id)?;
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    /// The control block currently loaded here, if any.
    pub fn loaded(&self) -> Option<PhysAddr> {
        match self.loaded.load(Ordering::Acquire) {
            NONE_LOADED => None,
            pa => Some(PhysAddr::from_usize(pa)),
        }
    }

    /// Record `block` as loaded on this CPU.
    ///
    /// Fails if a different control block is still resident: it must be
    /// cleared before another one is loaded.
    pub fn set_loaded(&self, block: PhysAddr) -> AxResult {
        match self.loaded.compare_exchange(
            NONE_LOADED,
            block.as_usize(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(cur) if cur == block.as_usize() => Ok(()),
            Err(cur) => ax_err!(
                BadState,
                format!(
                    "CPU {} still holds control block {:#x}",
                    self.cpu_id, cur
                )
            ),
        }
    }

    /// Forget `block` after it was cleared from this CPU.
    pub fn clear_loaded(&self, block: PhysAddr) {
        let _ = self.loaded.compare_exchange(
            block.as_usize(),
            NONE_LOADED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }
}

/// Per-CPU states of every host CPU, indexed by CPU id.
pub struct AxPerCpuTable {
    cpus: Vec<AxPerCpu>,
}

impl AxPerCpuTable {
    pub fn new(cpu_count: usize) -> Self {
        Self {
            cpus: (0..cpu_count).map(AxPerCpu::new).collect(),
        }
    }

    pub fn get(&self, cpu_id: usize) -> AxResult<&AxPerCpu> {
        match self.cpus.get(cpu_id) {
            Some(cpu) => Ok(cpu),
            None => ax_err!(InvalidInput, format!("no such CPU {cpu_id}")),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &AxPerCpu> {
        self.cpus.iter()
    }

    /// Enable virtualization everywhere, rolling back on failure.
    pub fn enable_all<H: AxVmmHal>(&self, hal: &H) -> AxResult {
        for cpu in &self.cpus {
            if let Err(e) = cpu.hardware_enable(hal) {
                warn!("enabling virtualization on CPU {} failed: {:?}", cpu.cpu_id, e);
                self.disable_all(hal);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn disable_all<H: AxVmmHal>(&self, hal: &H) {
        for cpu in &self.cpus {
            if let Err(e) = cpu.hardware_disable(hal) {
                error!("disabling virtualization on CPU {} failed: {:?}", cpu.cpu_id, e);
            }
        }
    }
}
