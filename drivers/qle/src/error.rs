//! # Driver Errors

use core::fmt;
use helix_hal::HalError;
use helix_scsi::XferError;

/// Result type for driver operations
pub type QleResult<T> = Result<T, QleError>;

/// Errors reported by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QleError {
    /// No free command slot
    Busy,
    /// Internal inconsistency or unexpected firmware response
    DriverStuffup,
    /// No completion within the polling budget
    Timeout,
    /// Mailbox waiter invalidated by a reset
    Aborted,
    /// A mailbox command is already outstanding
    MailboxBusy,
    /// Mailbox completed with a firmware status code
    Firmware(u16),
    /// DMA allocation or mapping failed
    Dma(HalError),
    /// Every fabric loop id is in use
    OutOfLoopIds,
    /// PLOGX completed with a non-zero status
    LoginFailed(u16),
    /// Name server query failed or was rejected
    NameServer,
    /// Firmware stopped answering
    NotResponding,
    /// Firmware image is malformed
    InvalidFirmware,
    /// Configuration rejected by validation
    InvalidConfig(&'static str),
}

impl QleError {
    /// Map onto the SCSI midlayer's error classes
    pub const fn to_xfer_error(&self) -> XferError {
        match self {
            QleError::Busy | QleError::MailboxBusy => XferError::Busy,
            QleError::Timeout => XferError::Timeout,
            QleError::Aborted => XferError::Reset,
            _ => XferError::DriverStuffup,
        }
    }
}

impl fmt::Display for QleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QleError::Busy => write!(f, "No free command slot"),
            QleError::DriverStuffup => write!(f, "Driver stuffup"),
            QleError::Timeout => write!(f, "Timed out"),
            QleError::Aborted => write!(f, "Aborted by reset"),
            QleError::MailboxBusy => write!(f, "Mailbox busy"),
            QleError::Firmware(code) => write!(f, "Firmware error {:#06x}", code),
            QleError::Dma(e) => write!(f, "DMA error: {:?}", e),
            QleError::OutOfLoopIds => write!(f, "Ran out of loop ids"),
            QleError::LoginFailed(status) => write!(f, "Login failed: {:#x}", status),
            QleError::NameServer => write!(f, "Name server query failed"),
            QleError::NotResponding => write!(f, "Firmware not responding"),
            QleError::InvalidFirmware => write!(f, "Invalid firmware image"),
            QleError::InvalidConfig(why) => write!(f, "Invalid configuration: {}", why),
        }
    }
}

impl From<HalError> for QleError {
    fn from(e: HalError) -> Self {
        QleError::Dma(e)
    }
}

// =============================================================================
// TESTS
// =============================================================================
