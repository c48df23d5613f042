//! # DMA Abstraction
//!
//! Drivers get two kinds of DMA memory from the HAL:
//!
//! - **Coherent allocations**: physically contiguous blocks owned by the
//!   driver for its whole lifetime (descriptor rings, scratch buffers).
//! - **Mappings**: a caller-owned data buffer made visible to the device for
//!   the duration of one I/O, described as a scatter/gather segment list.

use crate::{HalResult, PhysAddr, VirtAddr};
use alloc::vec::Vec;
use bitflags::bitflags;

bitflags! {
    /// Cache maintenance operations around device access
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaSync: u32 {
        /// Before the device reads memory the CPU wrote
        const PRE_WRITE = 1 << 0;
        /// After the device read memory the CPU wrote
        const POST_WRITE = 1 << 1;
        /// Before the device writes memory the CPU will read
        const PRE_READ = 1 << 2;
        /// After the device wrote memory the CPU will read
        const POST_READ = 1 << 3;
    }
}

/// Direction of a data transfer, seen from memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads from memory (SCSI write)
    ToDevice,
    /// Device writes into memory (SCSI read)
    FromDevice,
}

impl DmaDirection {
    /// Sync operation to issue before starting the transfer
    pub const fn pre_sync(self) -> DmaSync {
        match self {
            DmaDirection::ToDevice => DmaSync::PRE_WRITE,
            DmaDirection::FromDevice => DmaSync::PRE_READ,
        }
    }

    /// Sync operation to issue once the transfer finished
    pub const fn post_sync(self) -> DmaSync {
        match self {
            DmaDirection::ToDevice => DmaSync::POST_WRITE,
            DmaDirection::FromDevice => DmaSync::POST_READ,
        }
    }
}

/// One device-visible piece of a mapped buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaSegment {
    /// Bus address
    pub addr: PhysAddr,
    /// Length in bytes
    pub len: u32,
}

impl DmaSegment {
    /// Create a new segment
    pub const fn new(addr: PhysAddr, len: u32) -> Self {
        Self { addr, len }
    }
}

/// A coherent, physically contiguous allocation
#[derive(Debug)]
pub struct DmaAllocation {
    /// CPU-visible address
    pub vaddr: VirtAddr,
    /// Device-visible address
    pub paddr: PhysAddr,
    /// Size in bytes
    pub size: usize,
}

/// A loaded data buffer
#[derive(Debug)]
pub struct DmaMapping {
    /// Segments in transfer order
    pub segments: Vec<DmaSegment>,
    /// Transfer direction
    pub direction: DmaDirection,
    /// Total mapped length
    pub mapped_len: usize,
}

/// DMA engine abstraction
pub trait DmaEngine: Send + Sync {
    /// Allocate zeroed coherent memory
    fn alloc_coherent(&self, size: usize, align: usize) -> HalResult<DmaAllocation>;

    /// Release coherent memory
    fn free_coherent(&self, allocation: &DmaAllocation);

    /// Make `len` bytes at `buf` visible to the device using at most
    /// `max_segments` segments
    fn load(
        &self,
        buf: VirtAddr,
        len: usize,
        direction: DmaDirection,
        max_segments: usize,
    ) -> HalResult<DmaMapping>;

    /// Tear down a mapping created by [`DmaEngine::load`]
    fn unload(&self, mapping: DmaMapping);

    /// Cache maintenance on part of a coherent allocation
    fn sync(&self, _allocation: &DmaAllocation, _offset: usize, _len: usize, _op: DmaSync) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }

    /// Cache maintenance on a loaded data buffer
    fn sync_mapping(&self, _mapping: &DmaMapping, _op: DmaSync) {
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
    }
}

// =============================================================================
// TESTS
// =============================================================================
