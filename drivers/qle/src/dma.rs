//! # Driver DMA Regions
//!
//! Thin wrapper around a coherent allocation with bounds-checked accessors.
//! Every structure the firmware reads or writes (rings, segment lists,
//! FCP_CMND blocks, scratch) lives in one of these.

use crate::error::{QleError, QleResult};
use helix_hal::dma::{DmaAllocation, DmaEngine, DmaSync};
use helix_hal::{HalError, PhysAddr};

/// Alignment of every region handed to the firmware
pub const DMA_ALIGN: usize = 64;

/// A coherent region owned by the driver
#[derive(Debug)]
pub struct DmaRegion {
    alloc: DmaAllocation,
}

impl DmaRegion {
    /// Allocate a zeroed region of `size` bytes
    pub fn alloc<D: DmaEngine + ?Sized>(dma: &D, size: usize) -> QleResult<Self> {
        let alloc = dma.alloc_coherent(size, DMA_ALIGN)?;
        if alloc.size < size {
            dma.free_coherent(&alloc);
            return Err(QleError::Dma(HalError::OutOfMemory));
        }
        let region = Self { alloc };
        region.zero();
        Ok(region)
    }

    /// Give the memory back
    pub fn free<D: DmaEngine + ?Sized>(&self, dma: &D) {
        dma.free_coherent(&self.alloc);
    }

    /// Device address of the first byte
    pub fn paddr(&self) -> PhysAddr {
        self.alloc.paddr
    }

    /// Device address of byte `offset`
    pub fn paddr_at(&self, offset: usize) -> PhysAddr {
        self.alloc.paddr.add(offset as u64)
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.alloc.size
    }

    /// Whether the region is empty
    pub fn is_empty(&self) -> bool {
        self.alloc.size == 0
    }

    fn check(&self, offset: usize, len: usize) {
        let end = offset.checked_add(len);
        assert!(
            matches!(end, Some(end) if end <= self.alloc.size),
            "DMA access {:#x}+{:#x} outside region of {:#x}",
            offset,
            len,
            self.alloc.size
        );
    }

    /// Copy bytes into the region
    pub fn write(&self, offset: usize, data: &[u8]) {
        self.check(offset, data.len());
        let dst: *mut u8 = self.alloc.vaddr.add(offset as u64).as_mut_ptr();
        // SAFETY: the range lies inside the allocation, which stays mapped
        // until `free`; callers serialize access to each sub-range.
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    /// Copy bytes out of the region
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        self.check(offset, buf.len());
        let src: *const u8 = self.alloc.vaddr.add(offset as u64).as_ptr();
        // SAFETY: as in `write`.
        unsafe { core::ptr::copy_nonoverlapping(src, buf.as_mut_ptr(), buf.len()) };
    }

    /// Zero `len` bytes at `offset`
    pub fn fill_zero(&self, offset: usize, len: usize) {
        self.check(offset, len);
        let dst: *mut u8 = self.alloc.vaddr.add(offset as u64).as_mut_ptr();
        // SAFETY: as in `write`.
        unsafe { core::ptr::write_bytes(dst, 0, len) };
    }

    /// Zero the whole region
    pub fn zero(&self) {
        self.fill_zero(0, self.alloc.size);
    }

    /// Read a fixed-size block
    pub fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut buf = [0u8; N];
        self.read(offset, &mut buf);
        buf
    }

    /// Cache maintenance on part of the region
    pub fn sync<D: DmaEngine + ?Sized>(&self, dma: &D, offset: usize, len: usize, op: DmaSync) {
        dma.sync(&self.alloc, offset, len, op);
    }
}

// =============================================================================
// TESTS
// =============================================================================
