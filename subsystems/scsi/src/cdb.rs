//! # CDB Construction

use crate::MAX_CDB_LENGTH;

/// SCSI operation codes
pub mod opcode {
    /// TEST UNIT READY
    pub const TEST_UNIT_READY: u8 = 0x00;
    /// READ (10)
    pub const READ_10: u8 = 0x28;
    /// READ (16)
    pub const READ_16: u8 = 0x88;
    /// Variable length CDB (32 bytes)
    pub const VARIABLE_LENGTH_CDB: u8 = 0x7F;
}

/// Command Descriptor Block builder
#[derive(Debug, Clone)]
pub struct CdbBuilder {
    cdb: [u8; MAX_CDB_LENGTH],
    len: usize,
}

impl CdbBuilder {
    /// Create new CDB builder
    pub const fn new() -> Self {
        Self {
            cdb: [0u8; MAX_CDB_LENGTH],
            len: 0,
        }
    }

    fn start(&mut self, op: u8, len: usize) {
        self.cdb = [0u8; MAX_CDB_LENGTH];
        self.cdb[0] = op;
        self.len = len;
    }

    /// Build TEST UNIT READY command
    pub fn test_unit_ready(&mut self) -> &[u8] {
        self.start(opcode::TEST_UNIT_READY, 6);
        &self.cdb[..self.len]
    }

    /// Build READ (10) command
    pub fn read_10(&mut self, lba: u32, blocks: u16) -> &[u8] {
        self.start(opcode::READ_10, 10);
        self.cdb[2..6].copy_from_slice(&lba.to_be_bytes());
        self.cdb[7..9].copy_from_slice(&blocks.to_be_bytes());
        &self.cdb[..self.len]
    }

    /// Build READ (16) command
    pub fn read_16(&mut self, lba: u64, blocks: u32) -> &[u8] {
        self.start(opcode::READ_16, 16);
        self.cdb[2..10].copy_from_slice(&lba.to_be_bytes());
        self.cdb[10..14].copy_from_slice(&blocks.to_be_bytes());
        &self.cdb[..self.len]
    }

    /// Build a 32-byte variable length CDB with the given service action
    pub fn variable_length(&mut self, service_action: u16) -> &[u8] {
        self.start(opcode::VARIABLE_LENGTH_CDB, 32);
        self.cdb[7] = 0x18;
        self.cdb[8..10].copy_from_slice(&service_action.to_be_bytes());
        &self.cdb[..self.len]
    }
}

impl Default for CdbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
