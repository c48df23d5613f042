//! # Driver Configuration

use crate::error::{QleError, QleResult};

/// Tunables of one adapter instance
#[derive(Debug, Clone)]
pub struct QleConfig {
    /// Entries in each of the request and response rings
    pub ring_entries: u16,
    /// Scatter/gather segments per command
    pub max_segs: usize,
    /// Size of the target index (loop id space)
    pub max_targets: u16,
    /// Scratch DMA buffer for port database and name server exchanges
    pub scratch_size: usize,
    /// Mailbox polls before giving up
    pub mbox_timeout_polls: u32,
    /// Fabric operation polls before giving up
    pub fabric_timeout_polls: u32,
    /// Polls spent on a polled command that carries no timeout of its own
    pub poll_timeout_polls: u32,
    /// Delay between polls in microseconds
    pub poll_interval_us: u32,
    /// Seconds to wait for loop up during attach
    pub loop_wait_secs: u32,
    /// Longest CDB accepted from the midlayer
    pub max_cdb_len: usize,
    /// Maximum frame payload
    pub frame_len: u16,
    /// Execution throttle
    pub exec_throttle: u16,
    /// Login retry count
    pub login_retry: u8,
    /// Link down timeout (NOS)
    pub link_down_nos: u16,
    /// Hard loop address
    pub hard_address: u16,
    /// World-wide port name
    pub port_name: u64,
    /// World-wide node name, 0 to derive from the port name
    pub node_name: u64,
}

impl QleConfig {
    /// Ring slots never handed to CCBs: one marker, one fabric operation,
    /// one empty slot so producer == consumer always means empty
    pub const RESERVED_SLOTS: u16 = 3;
    /// Default ring size
    pub const DEFAULT_RING_ENTRIES: u16 = 4096;
    /// Default segments per command
    pub const DEFAULT_MAX_SEGS: usize = 16;
    /// Loop id space of 24xx firmware
    pub const DEFAULT_MAX_TARGETS: u16 = 2048;
    /// Default port name, borrowed from isp(4)
    pub const DEFAULT_PORT_NAME: u64 = 0x4000_0000_7F00_0003;
    /// Upper bound on segments per command
    pub const SEGMENT_LIMIT: usize = 256;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            ring_entries: Self::DEFAULT_RING_ENTRIES,
            max_segs: Self::DEFAULT_MAX_SEGS,
            max_targets: Self::DEFAULT_MAX_TARGETS,
            scratch_size: 0x1000,
            mbox_timeout_polls: 400_000,
            fabric_timeout_polls: 400_000,
            poll_timeout_polls: 400_000,
            poll_interval_us: 100,
            loop_wait_secs: 10,
            max_cdb_len: 16,
            frame_len: 1024,
            exec_throttle: 16,
            login_retry: 3,
            link_down_nos: 200,
            hard_address: 0,
            port_name: Self::DEFAULT_PORT_NAME,
            node_name: 0,
        }
    }

    /// Create a small configuration (short rings, quick timeouts)
    pub fn minimal() -> Self {
        Self {
            ring_entries: 16,
            max_segs: 4,
            scratch_size: 0x1000,
            mbox_timeout_polls: 2_000,
            fabric_timeout_polls: 2_000,
            poll_timeout_polls: 2_000,
            poll_interval_us: 10,
            loop_wait_secs: 1,
            ..Self::new()
        }
    }

    /// Accept 32-byte CDBs through the additional CDB field
    pub fn with_long_cdbs(mut self) -> Self {
        self.max_cdb_len = 32;
        self
    }

    /// Set the ring size
    pub fn with_ring_entries(mut self, entries: u16) -> Self {
        self.ring_entries = entries;
        self
    }

    /// Set the world-wide names
    pub fn with_names(mut self, port_name: u64, node_name: u64) -> Self {
        self.port_name = port_name;
        self.node_name = node_name;
        self
    }

    /// Commands that may be outstanding at once
    pub const fn max_cmds(&self) -> u16 {
        self.ring_entries.saturating_sub(Self::RESERVED_SLOTS)
    }

    /// Node name, derived by masking the port number nibble when unset
    pub const fn node_wwn(&self) -> u64 {
        if self.node_name != 0 {
            self.node_name
        } else {
            self.port_name & !(0xF_u64 << 56)
        }
    }

    /// Check the configuration for values the driver cannot work with
    pub fn validate(&self) -> QleResult<()> {
        if self.ring_entries <= Self::RESERVED_SLOTS {
            return Err(QleError::InvalidConfig("ring too small"));
        }
        if self.max_segs == 0 || self.max_segs > Self::SEGMENT_LIMIT {
            return Err(QleError::InvalidConfig("segment count out of range"));
        }
        if self.max_targets < 128 {
            return Err(QleError::InvalidConfig("target space smaller than a loop"));
        }
        if self.max_cdb_len < 16 || self.max_cdb_len > 32 {
            return Err(QleError::InvalidConfig("CDB length out of range"));
        }
        if self.scratch_size < 0x1000 {
            return Err(QleError::InvalidConfig("scratch buffer too small"));
        }
        if self.poll_interval_us == 0 {
            return Err(QleError::InvalidConfig("zero poll interval"));
        }
        Ok(())
    }
}

impl Default for QleConfig {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
