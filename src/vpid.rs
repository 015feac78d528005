use alloc::vec::Vec;

use axerrno::{ax_err, AxResult};
use spin::Mutex;

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Allocator for VPIDs (VMX) or ASIDs (SVM).
///
/// Id 0 belongs to the host and is never handed out.
pub struct VpidAllocator {
    max: u16,
    bitmap: Mutex<Vec<u64>>,
}

impl VpidAllocator {
    /// Create an allocator issuing ids in `1..=max`.
    pub fn new(max: u16) -> Self {
        let words = (max as usize + 1).div_ceil(BITS_PER_WORD);
        let mut bitmap = vec![0u64; words];
        if let Some(first) = bitmap.first_mut() {
            *first |= 1;
        }
        Self {
            max,
            bitmap: Mutex::new(bitmap),
        }
    }

    /// Largest id this allocator may issue.
    pub const fn max(&self) -> u16 {
        self.max
    }

    /// Take the lowest free id.
    pub fn alloc(&self) -> AxResult<u16> {
        let mut bitmap = self.bitmap.lock();
        for (i, word) in bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let id = i * BITS_PER_WORD + bit;
            if id > self.max as usize {
                break;
            }
            *word |= 1 << bit;
            return Ok(id as u16);
        }
        ax_err!(NoMemory, "VPID pool exhausted")
    }

    /// Return `id` to the pool.
    pub fn free(&self, id: u16) {
        if id == 0 || id > self.max {
            warn!("freeing out-of-range VPID {}", id);
            return;
        }
        let id = id as usize;
        let mut bitmap = self.bitmap.lock();
        bitmap[id / BITS_PER_WORD] &= !(1 << (id % BITS_PER_WORD));
    }

    /// Number of ids currently handed out.
    pub fn outstanding(&self) -> usize {
        let ones: u32 = self.bitmap.lock().iter().map(|w| w.count_ones()).sum();
        ones as usize - 1
    }
}
