//! # Helix SCSI Midlayer Interfaces
//!
//! The contract between host bus adapter drivers and the generic SCSI layer.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 SCSI midlayer (disks, tapes)                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │   ScsiAdapter ▼ scsi_cmd / probe      ▲ ScsiMidlayer        │
//! │                                       │ done / probe_target  │
//! │                                       │ detach_target        │
//! ├──────────────────────────────────────────────────────────────┤
//! │        HBA driver (Fibre Channel, SAS, parallel SCSI)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! A [`ScsiXfer`] is owned by whoever currently works on it: the midlayer
//! builds it, hands it to [`ScsiAdapter::scsi_cmd`], and gets it back through
//! [`ScsiMidlayer::done`] with the result fields filled in.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod cdb;
pub mod sense;
pub mod xfer;

pub use sense::{SenseData, SenseKey};
pub use xfer::{DataBuffer, ScsiXfer, XferError, XferFlags};

use alloc::boxed::Box;

/// Maximum CDB length carried by a transfer
pub const MAX_CDB_LENGTH: usize = 32;

// =============================================================================
// ADAPTER CONTRACT
// =============================================================================

/// Static description of an adapter's SCSI link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// Commands the adapter accepts concurrently
    pub openings: u16,
    /// Target id the adapter itself occupies
    pub adapter_target: u16,
    /// Number of addressable targets
    pub adapter_buswidth: u16,
    /// World-wide port name of the initiator
    pub port_wwn: u64,
    /// World-wide node name of the initiator
    pub node_wwn: u64,
}

/// Upcalls from an adapter into the midlayer
pub trait ScsiMidlayer: Send + Sync {
    /// A transfer finished; result fields are valid
    fn done(&self, xs: Box<ScsiXfer>);

    /// A new target appeared and should be probed
    fn probe_target(&self, target: u16);

    /// A target went away and must be detached
    fn detach_target(&self, target: u16);
}

/// Downcalls from the midlayer into an adapter driver
pub trait ScsiAdapter: Send + Sync {
    /// Start a transfer.
    ///
    /// Returns the transfer with [`XferError::Busy`] when the adapter has no
    /// room for it; every other outcome is reported through
    /// [`ScsiMidlayer::done`].
    fn scsi_cmd(&self, xs: Box<ScsiXfer>) -> Result<(), Box<ScsiXfer>>;

    /// Whether a target id currently maps to a SCSI target
    fn probe(&self, target: u16) -> bool;

    /// Link parameters
    fn link_info(&self) -> LinkInfo;
}
