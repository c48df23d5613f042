//! # Command Control Blocks
//!
//! A fixed array of CCBs is allocated at attach time. A CCB never moves and
//! is never freed before the adapter goes away.
//!
//! The handle the firmware echoes back in the status entry is the CCB index
//! tagged with the CCB's generation, which advances on every release:
//!
//! ```text
//!   31            16 15             0
//!  ┌────────────────┬────────────────┐
//!  │ generation     │ index          │
//!  └────────────────┴────────────────┘
//! ```
//!
//! A status for a command the driver already gave up on carries a stale
//! generation and cannot complete the next user of the same CCB.
//!
//! ```text
//!   free list (LIFO)          slots
//! ┌───┬───┬───┐        ┌──────┬──────┬──────┬──────┐
//! │ 2 │ 0 │ 3 │ ─────▶ │ 0    │ 1 xs │ 2    │ 3    │ ...
//! └───┴───┴───┘        └──────┴──────┴──────┴──────┘
//!                          in flight ⇔ xs is set
//! ```
//!
//! A [`CcbHandle`] is the only proof of ownership and can only be minted by
//! the pool, so a CCB cannot be handed out twice before it is released.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use helix_hal::dma::DmaMapping;
use helix_scsi::ScsiXfer;
use spin::Mutex;

/// Bits of a firmware handle holding the CCB index
const HANDLE_INDEX_MASK: u32 = 0xFFFF;
/// Shift of the generation within a firmware handle
const HANDLE_GENERATION_SHIFT: u32 = 16;

/// Exclusive ownership of one CCB
#[derive(Debug, PartialEq, Eq)]
pub struct CcbHandle {
    id: u16,
}

impl CcbHandle {
    /// Pool index
    pub const fn id(&self) -> u16 {
        self.id
    }
}

/// Per-slot state
#[derive(Debug, Default)]
struct CcbSlot {
    xs: Option<Box<ScsiXfer>>,
    mapping: Option<DmaMapping>,
}

/// A CCB taken back from the firmware
#[derive(Debug)]
pub struct ReclaimedCcb {
    /// Ownership of the slot
    pub handle: CcbHandle,
    /// The transfer it carried
    pub xs: Box<ScsiXfer>,
    /// Data mapping to tear down
    pub mapping: Option<DmaMapping>,
}

/// Fixed pool of CCBs
pub struct CcbPool {
    slots: Box<[Mutex<CcbSlot>]>,
    generations: Box<[AtomicU32]>,
    free: Mutex<Vec<u16>>,
}

impl CcbPool {
    /// Create `count` CCBs, all free
    pub fn new(count: u16) -> Self {
        let slots = (0..count).map(|_| Mutex::new(CcbSlot::default())).collect();
        let generations = (0..count).map(|_| AtomicU32::new(0)).collect();
        // popped from the back, so id 0 goes out first
        let free = (0..count).rev().collect();
        Self {
            slots,
            generations,
            free: Mutex::new(free),
        }
    }

    /// Number of CCBs
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of CCBs not on the free list
    pub fn in_use(&self) -> usize {
        self.capacity() - self.free.lock().len()
    }

    /// Take a CCB off the free list
    pub fn acquire(&self) -> Option<CcbHandle> {
        self.free.lock().pop().map(|id| CcbHandle { id })
    }

    /// Put a CCB back on the free list
    pub fn release(&self, handle: CcbHandle) {
        let id = handle.id;
        {
            let mut slot = self.slots[usize::from(id)].lock();
            slot.xs = None;
            slot.mapping = None;
        }
        self.generations[usize::from(id)].fetch_add(1, Ordering::Release);
        self.free.lock().push(id);
    }

    /// Hand a CCB to the firmware together with its transfer
    pub fn arm(&self, handle: CcbHandle, xs: Box<ScsiXfer>, mapping: Option<DmaMapping>) {
        let mut slot = self.slots[usize::from(handle.id)].lock();
        slot.xs = Some(xs);
        slot.mapping = mapping;
    }

    /// Times CCB `id` has been released
    pub fn generation(&self, id: u16) -> u32 {
        self.generations[usize::from(id)].load(Ordering::Acquire)
    }

    /// Firmware handle for the command `handle` is about to carry
    pub fn tag(&self, handle: &CcbHandle) -> u32 {
        let generation = self.generation(handle.id) & HANDLE_INDEX_MASK;
        (generation << HANDLE_GENERATION_SHIFT) | u32::from(handle.id)
    }

    /// Take back the CCB the firmware names by `handle`.
    ///
    /// Returns `None` for a CCB that is not in flight or that has been
    /// released since `handle` was issued.
    ///
    /// # Panics
    ///
    /// An index outside the pool means the response ring is corrupt.
    pub fn reclaim(&self, handle: u32) -> Option<ReclaimedCcb> {
        let index = handle & HANDLE_INDEX_MASK;
        if index as usize >= self.capacity() {
            panic!("qle: completion for bad handle {:#x}", handle);
        }
        let id = index as u16;
        let generation = handle >> HANDLE_GENERATION_SHIFT;
        if self.generation(id) & HANDLE_INDEX_MASK != generation {
            return None;
        }
        self.reclaim_id(id)
    }

    fn reclaim_id(&self, id: u16) -> Option<ReclaimedCcb> {
        let mut slot = self.slots[usize::from(id)].lock();
        let xs = slot.xs.take()?;
        Some(ReclaimedCcb {
            handle: CcbHandle { id },
            xs,
            mapping: slot.mapping.take(),
        })
    }

    /// Take back every CCB in flight
    pub fn reclaim_all(&self) -> Vec<ReclaimedCcb> {
        (0..self.capacity())
            .filter_map(|id| self.reclaim_id(id as u16))
            .collect()
    }

    /// Whether CCB `id` carries a transfer
    pub fn is_active(&self, id: u16) -> bool {
        self.slots
            .get(usize::from(id))
            .is_some_and(|slot| slot.lock().xs.is_some())
    }
}

// =============================================================================
// TESTS
// =============================================================================
