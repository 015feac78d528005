use axerrno::{ax_err, AxResult};
use memory_addr::{is_aligned_4k, VirtAddr};

memory_addr::def_usize_addr! {
    /// Guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// Maximum number of guest memory ranges per VM.
pub const MAX_MEM_RANGES: usize = 16;
/// Maximum guest memory per VM, in MiB.
pub const MAX_VM_MEM_SIZE_MB: usize = 32768;

const MIB: usize = 1 << 20;
const MAX_GUEST_PHYS: usize = MAX_VM_MEM_SIZE_MB * MIB;

/// Guest physical window reserved for PCI MMIO. Guest RAM never overlaps it.
pub const MMIO_BASE: usize = 0xF000_0000;
/// Last byte of the reserved MMIO window.
pub const MMIO_END: usize = 0xFFFF_FFFF;

/// One contiguous chunk of guest RAM and the host mapping backing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    /// Guest physical base.
    pub gpa: GuestPhysAddr,
    /// Host virtual base of the backing memory.
    pub va: VirtAddr,
    /// Length in bytes.
    pub size: usize,
}

impl MemoryRange {
    /// Create a range from raw values.
    pub const fn new(gpa: usize, va: usize, size: usize) -> Self {
        Self {
            gpa: GuestPhysAddr::from_usize(gpa),
            va: VirtAddr::from_usize(va),
            size,
        }
    }

    /// Guest physical address one past the end.
    pub const fn end(&self) -> usize {
        self.gpa.as_usize() + self.size
    }

    /// Whether `gpa` falls inside this range.
    pub const fn contains(&self, gpa: GuestPhysAddr) -> bool {
        gpa.as_usize() >= self.gpa.as_usize() && gpa.as_usize() < self.end()
    }
}

/// What lives at a guest physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemType {
    /// Guest RAM backed by one of the VM's ranges.
    Regular,
    /// The reserved MMIO window.
    Mmio,
    /// Neither RAM nor MMIO.
    Unknown,
}

/// Validate a guest memory layout and return its total size in MiB.
///
/// Ranges must be page aligned, non-empty, ascending, disjoint, clear of the
/// MMIO window and add up to a whole number of MiB within the per-VM limit.
pub fn check_mem_ranges(ranges: &[MemoryRange]) -> AxResult<usize> {
    if ranges.is_empty() || ranges.len() > MAX_MEM_RANGES {
        return ax_err!(InvalidInput, "bad number of memory ranges");
    }

    let mut total = 0usize;
    let mut prev_end: Option<usize> = None;
    for range in ranges {
        let gpa = range.gpa.as_usize();
        let va = range.va.as_usize();
        let size = range.size;

        if size == 0 || !is_aligned_4k(gpa) || !is_aligned_4k(va) || !is_aligned_4k(size) {
            return ax_err!(InvalidInput, "memory range not page aligned or empty");
        }
        if gpa >= MAX_GUEST_PHYS || size > MAX_GUEST_PHYS - gpa {
            return ax_err!(InvalidInput, "memory range beyond guest physical limit");
        }
        if va.checked_add(size).is_none() {
            return ax_err!(InvalidInput, "memory range wraps host address space");
        }
        // Disjoint from [MMIO_BASE, MMIO_END].
        if !(gpa > MMIO_END || gpa + size <= MMIO_BASE) {
            return ax_err!(InvalidInput, "memory range overlaps MMIO window");
        }
        if let Some(prev_end) = prev_end {
            if prev_end > gpa {
                return ax_err!(InvalidInput, "memory ranges overlap or are not ascending");
            }
        }
        prev_end = Some(gpa + size);
        total += size;
    }

    if total % MIB != 0 || total / MIB > MAX_VM_MEM_SIZE_MB {
        return ax_err!(InvalidInput, "guest memory size not a whole number of MiB");
    }
    Ok(total / MIB)
}

/// Classify `gpa` against a validated range table.
pub fn memtype(ranges: &[MemoryRange], gpa: GuestPhysAddr) -> MemType {
    let addr = gpa.as_usize();
    if (MMIO_BASE..=MMIO_END).contains(&addr) {
        return MemType::Mmio;
    }
    // Ranges are ascending, so the first one ending past `gpa` is the only candidate.
    match ranges.iter().find(|r| r.end() > addr) {
        Some(r) if r.contains(gpa) => MemType::Regular,
        _ => MemType::Unknown,
    }
}
