//! # SCSI Transfers

use crate::sense::SenseData;
use crate::MAX_CDB_LENGTH;
use bitflags::bitflags;
use core::fmt;
use helix_hal::dma::DmaDirection;
use helix_hal::VirtAddr;

bitflags! {
    /// Transfer flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XferFlags: u32 {
        /// Data moves from the target into memory
        const DATA_IN = 1 << 0;
        /// Data moves from memory to the target
        const DATA_OUT = 1 << 1;
        /// Caller waits for completion by polling the adapter
        const POLL = 1 << 2;
        /// Caller must not sleep
        const NOSLEEP = 1 << 3;
    }
}

/// Outcome of a transfer as seen by the midlayer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XferError {
    /// Completed, status byte is valid
    #[default]
    NoError,
    /// Check condition, sense data is valid
    Sense,
    /// Adapter or target out of resources, retry later
    Busy,
    /// Adapter-side failure
    DriverStuffup,
    /// Command timed out
    Timeout,
    /// Target did not respond, presumed gone
    SelectionTimeout,
    /// Command lost to a bus or firmware reset
    Reset,
}

impl fmt::Display for XferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XferError::NoError => write!(f, "No error"),
            XferError::Sense => write!(f, "Sense data available"),
            XferError::Busy => write!(f, "Adapter busy"),
            XferError::DriverStuffup => write!(f, "Driver stuffup"),
            XferError::Timeout => write!(f, "Command timeout"),
            XferError::SelectionTimeout => write!(f, "Selection timeout"),
            XferError::Reset => write!(f, "Reset"),
        }
    }
}

/// Caller-owned data buffer of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataBuffer {
    /// Start of the buffer
    pub addr: VirtAddr,
    /// Length in bytes
    pub len: usize,
}

impl DataBuffer {
    /// Create a new buffer descriptor
    pub const fn new(addr: VirtAddr, len: usize) -> Self {
        Self { addr, len }
    }
}

/// A single SCSI command and its result
#[derive(Debug, Clone)]
pub struct ScsiXfer {
    /// Target id on the adapter's bus
    pub target: u16,
    /// Logical unit
    pub lun: u32,
    /// Command descriptor block
    pub cdb: heapless::Vec<u8, MAX_CDB_LENGTH>,
    /// Transfer flags
    pub flags: XferFlags,
    /// Data buffer, if the command moves data
    pub data: Option<DataBuffer>,
    /// Timeout in milliseconds, 0 for none
    pub timeout_ms: u32,
    /// Caller cookie, untouched by adapters
    pub tag: u64,
    /// Result: error class
    pub error: XferError,
    /// Result: SCSI status byte
    pub status: u8,
    /// Result: bytes not transferred
    pub resid: u32,
    /// Result: sense data when `error` is [`XferError::Sense`]
    pub sense: SenseData,
}

impl ScsiXfer {
    /// Create a transfer without data; `None` if the CDB is too long
    pub fn new(target: u16, lun: u32, cdb: &[u8]) -> Option<Self> {
        let cdb = heapless::Vec::from_slice(cdb).ok()?;
        Some(Self {
            target,
            lun,
            cdb,
            flags: XferFlags::empty(),
            data: None,
            timeout_ms: 0,
            tag: 0,
            error: XferError::NoError,
            status: 0,
            resid: 0,
            sense: SenseData::new(),
        })
    }

    /// Attach a buffer the target writes into
    pub fn with_data_in(mut self, buf: DataBuffer) -> Self {
        self.data = Some(buf);
        self.flags.remove(XferFlags::DATA_OUT);
        self.flags.insert(XferFlags::DATA_IN);
        self
    }

    /// Attach a buffer the target reads from
    pub fn with_data_out(mut self, buf: DataBuffer) -> Self {
        self.data = Some(buf);
        self.flags.remove(XferFlags::DATA_IN);
        self.flags.insert(XferFlags::DATA_OUT);
        self
    }

    /// Add flags
    pub fn with_flags(mut self, flags: XferFlags) -> Self {
        self.flags.insert(flags);
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the caller cookie
    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Data length in bytes
    pub fn datalen(&self) -> usize {
        self.data.map_or(0, |d| d.len)
    }

    /// DMA direction of the data phase
    pub fn direction(&self) -> DmaDirection {
        if self.flags.contains(XferFlags::DATA_IN) {
            DmaDirection::FromDevice
        } else {
            DmaDirection::ToDevice
        }
    }

    /// Whether the caller polls for completion
    pub fn is_poll(&self) -> bool {
        self.flags.contains(XferFlags::POLL)
    }
}

// =============================================================================
// TESTS
// =============================================================================
