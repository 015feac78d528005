use alloc::sync::Arc;

use axerrno::{ax_err_type, AxResult};
use memory_addr::{PhysAddr, PAGE_SIZE_4K};

use crate::AxVmmHal;

/// Physically contiguous host frames, freed on drop.
pub struct PhysFrames<H: AxVmmHal> {
    start: PhysAddr,
    count: usize,
    hal: Arc<H>,
}

impl<H: AxVmmHal> PhysFrames<H> {
    /// Allocate `count` zeroed frames.
    pub fn alloc_zero(hal: &Arc<H>, count: usize) -> AxResult<Self> {
        let start = hal
            .alloc_frames(count)
            .ok_or_else(|| ax_err_type!(NoMemory, "frame allocation failed"))?;
        let frames = Self {
            start,
            count,
            hal: hal.clone(),
        };
        frames.fill(0);
        Ok(frames)
    }

    pub const fn start_paddr(&self) -> PhysAddr {
        self.start
    }

    pub const fn size(&self) -> usize {
        self.count * PAGE_SIZE_4K
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.hal.phys_to_virt(self.start).as_mut_ptr()
    }

    /// Set every byte to `byte`.
    pub fn fill(&self, byte: u8) {
        // SAFETY: the frames are owned by `self` and mapped at `as_mut_ptr`.
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, self.size()) }
    }

    /// View the frames as a mutable byte slice.
    #[allow(clippy::mut_from_ref)]
    pub fn as_bytes_mut(&self) -> &mut [u8] {
        // SAFETY: see `fill`. Callers hold exclusive access to the owning vcpu.
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size()) }
    }
}

impl<H: AxVmmHal> Drop for PhysFrames<H> {
    fn drop(&mut self) {
        trace!("free {} frame(s) at {:#x}", self.count, self.start);
        self.hal.dealloc_frames(self.start, self.count);
    }
}
