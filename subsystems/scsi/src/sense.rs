//! # Sense Data
//!
//! Fixed-format sense data as returned with a CHECK CONDITION status.

use core::fmt;

/// Bytes of sense data carried by a transfer
pub const SENSE_LENGTH: usize = 32;

/// Response code: current error, fixed format
pub const RESPONSE_CURRENT: u8 = 0x70;
/// Valid bit in the response code byte
pub const RESPONSE_VALID: u8 = 0x80;

/// Additional Sense Code (ASC) values used by adapters
pub mod asc {
    /// Invalid command operation code
    pub const INVALID_OPCODE: u8 = 0x20;
}

/// SCSI sense keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    /// No error or no sense information
    NoSense = 0x00,
    /// Recovered error
    RecoveredError = 0x01,
    /// Device not ready
    NotReady = 0x02,
    /// Medium error
    MediumError = 0x03,
    /// Hardware error
    HardwareError = 0x04,
    /// Illegal request
    IllegalRequest = 0x05,
    /// Unit attention
    UnitAttention = 0x06,
    /// Write protected
    DataProtect = 0x07,
    /// Blank check
    BlankCheck = 0x08,
    /// Vendor specific
    VendorSpecific = 0x09,
    /// Copy aborted
    CopyAborted = 0x0A,
    /// Aborted command
    AbortedCommand = 0x0B,
    /// Volume overflow
    VolumeOverflow = 0x0D,
    /// Miscompare
    Miscompare = 0x0E,
}

impl SenseKey {
    /// Decode the low nibble of the sense key byte
    pub fn from_byte(byte: u8) -> Self {
        match byte & 0x0F {
            0x01 => SenseKey::RecoveredError,
            0x02 => SenseKey::NotReady,
            0x03 => SenseKey::MediumError,
            0x04 => SenseKey::HardwareError,
            0x05 => SenseKey::IllegalRequest,
            0x06 => SenseKey::UnitAttention,
            0x07 => SenseKey::DataProtect,
            0x08 => SenseKey::BlankCheck,
            0x09 => SenseKey::VendorSpecific,
            0x0A => SenseKey::CopyAborted,
            0x0B => SenseKey::AbortedCommand,
            0x0D => SenseKey::VolumeOverflow,
            0x0E => SenseKey::Miscompare,
            _ => SenseKey::NoSense,
        }
    }

    /// Get human-readable description
    pub const fn description(&self) -> &'static str {
        match self {
            SenseKey::NoSense => "No sense",
            SenseKey::RecoveredError => "Recovered error",
            SenseKey::NotReady => "Not ready",
            SenseKey::MediumError => "Medium error",
            SenseKey::HardwareError => "Hardware error",
            SenseKey::IllegalRequest => "Illegal request",
            SenseKey::UnitAttention => "Unit attention",
            SenseKey::DataProtect => "Data protect",
            SenseKey::BlankCheck => "Blank check",
            SenseKey::VendorSpecific => "Vendor specific",
            SenseKey::CopyAborted => "Copy aborted",
            SenseKey::AbortedCommand => "Aborted command",
            SenseKey::VolumeOverflow => "Volume overflow",
            SenseKey::Miscompare => "Miscompare",
        }
    }
}

/// Raw fixed-format sense buffer
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    bytes: [u8; SENSE_LENGTH],
}

impl SenseData {
    /// Empty sense buffer
    pub const fn new() -> Self {
        Self {
            bytes: [0; SENSE_LENGTH],
        }
    }

    /// Build current-error sense with the given key and ASC
    pub fn current(key: SenseKey, asc: u8) -> Self {
        let mut sense = Self::new();
        sense.bytes[0] = RESPONSE_VALID | RESPONSE_CURRENT;
        sense.bytes[2] = key as u8;
        sense.bytes[7] = (SENSE_LENGTH - 8) as u8;
        sense.bytes[12] = asc;
        sense
    }

    /// Copy up to [`SENSE_LENGTH`] bytes of raw sense
    pub fn from_slice(raw: &[u8]) -> Self {
        let mut sense = Self::new();
        let n = raw.len().min(SENSE_LENGTH);
        sense.bytes[..n].copy_from_slice(&raw[..n]);
        sense
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; SENSE_LENGTH] {
        &self.bytes
    }

    /// Response code without the valid bit
    pub const fn response_code(&self) -> u8 {
        self.bytes[0] & 0x7F
    }

    /// Sense key
    pub fn sense_key(&self) -> SenseKey {
        SenseKey::from_byte(self.bytes[2])
    }

    /// Additional sense code
    pub const fn asc(&self) -> u8 {
        self.bytes[12]
    }

    /// Additional sense code qualifier
    pub const fn ascq(&self) -> u8 {
        self.bytes[13]
    }
}

impl Default for SenseData {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SenseData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenseData")
            .field("response_code", &self.response_code())
            .field("key", &self.sense_key())
            .field("asc", &self.asc())
            .field("ascq", &self.ascq())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================
