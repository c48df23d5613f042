//! # Scatter/Gather Segment Lists
//!
//! A command entry carries one data segment inline. Transfers that map to
//! more segments get their list written into a per-CCB slot of a shared
//! region, terminated by a zero-length entry, and the command's data segment
//! then describes the list itself.

use crate::config::QleConfig;
use crate::dma::DmaRegion;
use crate::error::{QleError, QleResult};
use crate::iocb::{IocbSeg, SEG_SIZE};
use arrayvec::ArrayVec;
use helix_hal::dma::{DmaEngine, DmaSegment, DmaSync};
use helix_hal::HalError;

/// Segments a command entry holds without a list
pub const INLINE_SEGS: usize = 1;

/// How the data phase of a command is described
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSegments {
    /// No data phase
    None,
    /// A single segment carried in the command
    Inline(IocbSeg),
    /// A list in the extended segment region
    Extended {
        /// Descriptor of the list, sentinel included
        list: IocbSeg,
        /// Data segments in the list
        count: u16,
    },
}

impl DataSegments {
    /// Segment count for the command entry
    pub const fn count(&self) -> u16 {
        match self {
            DataSegments::None => 0,
            DataSegments::Inline(_) => 1,
            DataSegments::Extended { count, .. } => *count,
        }
    }

    /// Descriptor placed in the command entry
    pub const fn descriptor(&self) -> IocbSeg {
        match self {
            DataSegments::None => IocbSeg::new(0, 0),
            DataSegments::Inline(seg) => *seg,
            DataSegments::Extended { list, .. } => *list,
        }
    }

    /// Whether the descriptor points at a list
    pub const fn is_extended(&self) -> bool {
        matches!(self, DataSegments::Extended { .. })
    }
}

/// The extended segment region
pub struct SegmentTable {
    region: DmaRegion,
    max_segs: usize,
}

impl SegmentTable {
    /// Bytes one CCB's list occupies, sentinel included
    pub const fn stride(max_segs: usize) -> usize {
        (max_segs + 1) * SEG_SIZE
    }

    /// Allocate lists for `ccbs` commands of up to `max_segs` segments
    pub fn alloc<D: DmaEngine + ?Sized>(dma: &D, ccbs: usize, max_segs: usize) -> QleResult<Self> {
        let region = DmaRegion::alloc(dma, ccbs * Self::stride(max_segs))?;
        Ok(Self { region, max_segs })
    }

    /// Release the region
    pub fn free<D: DmaEngine + ?Sized>(&self, dma: &D) {
        self.region.free(dma);
    }

    /// Byte offset of CCB `id`'s list
    pub const fn offset(&self, id: u16) -> usize {
        id as usize * Self::stride(self.max_segs)
    }

    /// Segment limit per command
    pub const fn max_segs(&self) -> usize {
        self.max_segs
    }

    /// Describe `segs` for CCB `id`, writing a list when they do not fit
    /// inline
    pub fn build<D: DmaEngine + ?Sized>(
        &self,
        dma: &D,
        id: u16,
        segs: &[DmaSegment],
    ) -> QleResult<DataSegments> {
        if segs.len() > self.max_segs {
            return Err(QleError::Dma(HalError::TooManySegments));
        }
        let mut staged: ArrayVec<IocbSeg, { QleConfig::SEGMENT_LIMIT }> = ArrayVec::new();
        for seg in segs {
            staged
                .try_push(IocbSeg::new(seg.addr.as_u64(), seg.len))
                .map_err(|_| QleError::Dma(HalError::TooManySegments))?;
        }

        match staged.len() {
            0 => Ok(DataSegments::None),
            n if n <= INLINE_SEGS => Ok(DataSegments::Inline(staged[0])),
            n => {
                let base = self.offset(id);
                for (i, seg) in staged.iter().enumerate() {
                    self.region.write(base + i * SEG_SIZE, &seg.encode());
                }
                self.region.write(base + n * SEG_SIZE, &IocbSeg::default().encode());

                let len = (n + 1) * SEG_SIZE;
                self.region.sync(dma, base, len, DmaSync::PRE_WRITE);
                Ok(DataSegments::Extended {
                    list: IocbSeg::new(self.region.paddr_at(base).as_u64(), len as u32),
                    count: n as u16,
                })
            }
        }
    }

    /// Read back entry `index` of CCB `id`'s list
    pub fn entry(&self, id: u16, index: usize) -> IocbSeg {
        let raw: [u8; SEG_SIZE] = self.region.read_array(self.offset(id) + index * SEG_SIZE);
        IocbSeg::decode(&raw)
    }
}

// =============================================================================
// TESTS
// =============================================================================
