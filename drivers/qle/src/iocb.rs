//! # I/O Control Blocks
//!
//! Every request and response ring entry is 64 bytes, little-endian, with a
//! common four-byte header:
//!
//! ```text
//!   0        1        2        3        4 ...                        63
//! ┌────────┬────────┬────────┬────────┬──────────────────────────────┐
//! │ type   │ count  │ seqno  │ flags  │ type-specific body           │
//! └────────┴────────┴────────┴────────┴──────────────────────────────┘
//! ```
//!
//! Encoders produce a full [`Entry`]; decoders take one and pull out only the
//! fields the driver acts on.

use bitflags::bitflags;
use static_assertions::const_assert;

/// Size of one ring entry
pub const QUEUE_ENTRY_SIZE: usize = 64;

/// One raw ring entry
pub type Entry = [u8; QUEUE_ENTRY_SIZE];

/// Size of a data segment descriptor (address + length)
pub const SEG_SIZE: usize = 12;

/// Size of the per-command FCP_CMND block
pub const FCP_CMND_SIZE: usize = 64;

/// FCP_CMND bytes before the CDB (LUN, CRN, task attribute/management,
/// additional CDB length)
const FCP_CMND_HEADER: usize = 12;

/// Inline CDB field size
const FCP_CDB_INLINE: usize = 16;

/// Largest CDB an FCP_CMND block can carry
pub const FCP_MAX_CDB: usize = FCP_CMND_SIZE - FCP_CMND_HEADER - 4;

/// Offset of the data segment in a command entry
const CMD_DATA_SEG: usize = 52;

const_assert!(FCP_MAX_CDB >= 32);
const_assert!(CMD_DATA_SEG + SEG_SIZE == QUEUE_ENTRY_SIZE);

/// Entry type tags
pub mod entry_type {
    /// Command status
    pub const STATUS: u8 = 0x03;
    /// Marker
    pub const MARKER: u8 = 0x04;
    /// Status continuation
    pub const STATUS_CONT: u8 = 0x10;
    /// Command type 7
    pub const CMD_TYPE_7: u8 = 0x18;
    /// CT pass-through
    pub const CT_PASSTHROUGH: u8 = 0x29;
    /// Command type 6
    pub const CMD_TYPE_6: u8 = 0x48;
    /// Port login/logout
    pub const PLOGX: u8 = 0x52;
}

/// Decoded entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// Completion of a SCSI command
    Status,
    /// Extra sense bytes of a previous status
    StatusContinuation,
    /// Marker acknowledgement
    Marker,
    /// Command type 6 bounced back
    CmdType6,
    /// Command type 7 bounced back
    CmdType7,
    /// Login/logout completion
    Plogx,
    /// CT pass-through completion
    CtPassthrough,
    /// Anything else
    Unknown(u8),
}

impl EntryType {
    /// Decode the type byte
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            entry_type::STATUS => EntryType::Status,
            entry_type::STATUS_CONT => EntryType::StatusContinuation,
            entry_type::MARKER => EntryType::Marker,
            entry_type::CMD_TYPE_6 => EntryType::CmdType6,
            entry_type::CMD_TYPE_7 => EntryType::CmdType7,
            entry_type::PLOGX => EntryType::Plogx,
            entry_type::CT_PASSTHROUGH => EntryType::CtPassthrough,
            other => EntryType::Unknown(other),
        }
    }

    /// Type of a raw entry
    pub const fn of(entry: &Entry) -> Self {
        Self::from_byte(entry[0])
    }
}

/// Firmware completion codes in a status entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionCode {
    /// Command completed
    Complete,
    /// DMA error
    DmaError,
    /// Lost to a LIP or reset
    Reset,
    /// Aborted by the firmware
    Aborted,
    /// Exchange timed out
    Timeout,
    /// More data than the buffer holds
    DataOverrun,
    /// Less data than requested
    DataUnderrun,
    /// Target queue full
    QueueFull,
    /// Remote port unavailable
    PortUnavailable,
    /// Remote port logged out
    PortLoggedOut,
    /// Remote port configuration changed
    PortChanged,
    /// Anything else
    Other(u16),
}

impl CompletionCode {
    /// Decode a completion code
    pub const fn from_u16(code: u16) -> Self {
        match code {
            0x00 => CompletionCode::Complete,
            0x02 => CompletionCode::DmaError,
            0x04 => CompletionCode::Reset,
            0x05 => CompletionCode::Aborted,
            0x06 => CompletionCode::Timeout,
            0x07 => CompletionCode::DataOverrun,
            0x15 => CompletionCode::DataUnderrun,
            0x1C => CompletionCode::QueueFull,
            0x28 => CompletionCode::PortUnavailable,
            0x29 => CompletionCode::PortLoggedOut,
            0x2A => CompletionCode::PortChanged,
            other => CompletionCode::Other(other),
        }
    }

    /// Raw code
    pub const fn as_u16(self) -> u16 {
        match self {
            CompletionCode::Complete => 0x00,
            CompletionCode::DmaError => 0x02,
            CompletionCode::Reset => 0x04,
            CompletionCode::Aborted => 0x05,
            CompletionCode::Timeout => 0x06,
            CompletionCode::DataOverrun => 0x07,
            CompletionCode::DataUnderrun => 0x15,
            CompletionCode::QueueFull => 0x1C,
            CompletionCode::PortUnavailable => 0x28,
            CompletionCode::PortLoggedOut => 0x29,
            CompletionCode::PortChanged => 0x2A,
            CompletionCode::Other(code) => code,
        }
    }
}

bitflags! {
    /// Command type 6 control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlFlags: u16 {
        /// Data moves to the target
        const WRITE = 0x0001;
        /// Data moves from the target
        const READ = 0x0002;
        /// Data segment points at an extended segment list
        const EXT_SEG = 0x0004;
    }
}

bitflags! {
    /// SCSI status word flags in a status entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScsiStatusFlags: u16 {
        /// FCP_RSP_INFO is present
        const RSP_INFO_VALID = 0x0100;
        /// Sense bytes follow the response info
        const SENSE_VALID = 0x0200;
        /// FCP_RESID overrun
        const RESID_OVER = 0x0400;
        /// FCP_RESID underrun
        const RESID_UNDER = 0x0800;
    }
}

// =============================================================================
// FIELD HELPERS
// =============================================================================

fn put_u16(entry: &mut [u8], off: usize, v: u16) {
    entry[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(entry: &mut [u8], off: usize, v: u32) {
    entry[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(entry: &mut [u8], off: usize, v: u64) {
    entry[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn get_u16(entry: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([entry[off], entry[off + 1]])
}

fn get_u32(entry: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([entry[off], entry[off + 1], entry[off + 2], entry[off + 3]])
}

fn header(ty: u8) -> Entry {
    let mut entry = [0u8; QUEUE_ENTRY_SIZE];
    entry[0] = ty;
    entry[1] = 1;
    entry
}

/// Handle carried by any entry at offset 4
pub fn entry_handle(entry: &Entry) -> u32 {
    get_u32(entry, 4)
}

/// Data segment descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IocbSeg {
    /// Bus address
    pub addr: u64,
    /// Length in bytes
    pub len: u32,
}

impl IocbSeg {
    /// Create a descriptor
    pub const fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }

    /// Wire form
    pub fn encode(&self) -> [u8; SEG_SIZE] {
        let mut out = [0u8; SEG_SIZE];
        put_u64(&mut out, 0, self.addr);
        put_u32(&mut out, 8, self.len);
        out
    }

    /// Parse a wire descriptor
    pub fn decode(raw: &[u8]) -> Self {
        Self {
            addr: u64::from_le_bytes([
                raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
            ]),
            len: get_u32(raw, 8),
        }
    }
}

// =============================================================================
// COMMANDS
// =============================================================================

/// Split a LUN into the two 16-bit halves the command entry carries
pub fn encode_lun(lun: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    put_u16(&mut out, 0, (lun >> 16) as u16);
    put_u16(&mut out, 2, lun as u16);
    out
}

/// Command type 6: SCSI command with an external FCP_CMND block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandIocb {
    /// Firmware handle (the CCB id)
    pub handle: u32,
    /// Firmware port handle of the target
    pub nport_handle: u16,
    /// Timeout in seconds, 0 for none
    pub timeout_secs: u16,
    /// Number of data segments
    pub data_seg_count: u16,
    /// Logical unit
    pub lun: u32,
    /// Direction and segment mode
    pub ctrl_flags: CtrlFlags,
    /// Length of the FCP_CMND block
    pub fcp_cmnd_len: u16,
    /// Bus address of the FCP_CMND block
    pub fcp_cmnd_addr: u64,
    /// Total data length
    pub data_len: u32,
    /// 24-bit FC address of the target
    pub target_port_id: u32,
    /// Inline segment or extended list descriptor
    pub data_seg: IocbSeg,
}

impl CommandIocb {
    /// Wire form
    pub fn encode(&self) -> Entry {
        let mut e = header(entry_type::CMD_TYPE_6);
        put_u32(&mut e, 4, self.handle);
        put_u16(&mut e, 8, self.nport_handle);
        put_u16(&mut e, 10, self.timeout_secs);
        put_u16(&mut e, 12, self.data_seg_count);
        e[16..24].copy_from_slice(&encode_lun(self.lun));
        put_u16(&mut e, 24, self.ctrl_flags.bits());
        put_u16(&mut e, 26, self.fcp_cmnd_len);
        put_u64(&mut e, 28, self.fcp_cmnd_addr);
        put_u32(&mut e, 44, self.data_len);
        put_u32(&mut e, 48, self.target_port_id & 0x00ff_ffff);
        e[CMD_DATA_SEG..].copy_from_slice(&self.data_seg.encode());
        e
    }

    /// Parse a command entry
    pub fn decode(e: &Entry) -> Self {
        Self {
            handle: get_u32(e, 4),
            nport_handle: get_u16(e, 8),
            timeout_secs: get_u16(e, 10),
            data_seg_count: get_u16(e, 12),
            lun: (u32::from(get_u16(e, 16)) << 16) | u32::from(get_u16(e, 18)),
            ctrl_flags: CtrlFlags::from_bits_truncate(get_u16(e, 24)),
            fcp_cmnd_len: get_u16(e, 26),
            fcp_cmnd_addr: u64::from(get_u32(e, 28)) | (u64::from(get_u32(e, 32)) << 32),
            data_len: get_u32(e, 44),
            target_port_id: get_u32(e, 48),
            data_seg: IocbSeg::decode(&e[CMD_DATA_SEG..]),
        }
    }
}

/// Task attributes
pub const FCP_TASK_SIMPLE: u8 = 0x00;
/// Read data bit in the additional CDB length byte
pub const FCP_RDDATA: u8 = 0x02;
/// Write data bit in the additional CDB length byte
pub const FCP_WRDATA: u8 = 0x01;

/// FCP_CMND payload: LUN, CDB and FCP_DL
#[derive(Debug, Clone, Copy)]
pub struct FcpCmnd<'a> {
    /// Logical unit
    pub lun: u32,
    /// Command descriptor block, up to [`FCP_MAX_CDB`] bytes
    pub cdb: &'a [u8],
    /// Expected data length
    pub data_len: u32,
    /// Direction bits
    pub rw: u8,
}

impl FcpCmnd<'_> {
    /// Encode into a block, returning it and the length the firmware reads
    pub fn encode(&self) -> ([u8; FCP_CMND_SIZE], u16) {
        let mut out = [0u8; FCP_CMND_SIZE];
        let cdb = &self.cdb[..self.cdb.len().min(FCP_MAX_CDB)];
        let additional = cdb.len().saturating_sub(FCP_CDB_INLINE).div_ceil(4) * 4;

        out[0..8].copy_from_slice(&encode_lun(self.lun));
        out[9] = FCP_TASK_SIMPLE;
        out[11] = (((additional / 4) as u8) << 2) | (self.rw & 0x3);
        out[FCP_CMND_HEADER..FCP_CMND_HEADER + cdb.len()].copy_from_slice(cdb);

        let dl = FCP_CMND_HEADER + FCP_CDB_INLINE + additional;
        out[dl..dl + 4].copy_from_slice(&self.data_len.to_be_bytes());
        (out, (dl + 4) as u16)
    }
}

/// Marker entry resynchronizing every target after a reset
pub fn encode_marker() -> Entry {
    const SYNC_ALL: u8 = 2;
    let mut e = header(entry_type::MARKER);
    put_u16(&mut e, 8, 0);
    e[10] = SYNC_ALL;
    e
}

// =============================================================================
// FABRIC
// =============================================================================

/// Port login request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlogxIocb {
    /// Request handle
    pub handle: u32,
    /// Loop id to bind the login to
    pub nport_handle: u16,
    /// Remote 24-bit port id
    pub port_id: u32,
    /// Login control flags, 0 for PLOGI
    pub flags: u16,
}

impl PlogxIocb {
    /// Wire form
    pub fn encode(&self) -> Entry {
        let mut e = header(entry_type::PLOGX);
        put_u32(&mut e, 4, self.handle);
        put_u16(&mut e, 10, self.nport_handle);
        put_u16(&mut e, 12, self.flags);
        put_u16(&mut e, 16, self.port_id as u16);
        e[18] = (self.port_id >> 16) as u8;
        e
    }

    /// Parse a request entry
    pub fn decode(e: &Entry) -> Self {
        Self {
            handle: get_u32(e, 4),
            nport_handle: get_u16(e, 10),
            port_id: u32::from(get_u16(e, 16)) | (u32::from(e[18]) << 16),
            flags: get_u16(e, 12),
        }
    }

    /// Completion status of a returned entry
    pub fn status(e: &Entry) -> u16 {
        get_u16(e, 8)
    }

    /// Build a completion (simulated firmware)
    pub fn response(handle: u32, status: u16) -> Entry {
        let mut e = header(entry_type::PLOGX);
        put_u32(&mut e, 4, handle);
        put_u16(&mut e, 8, status);
        e
    }
}

/// CT pass-through request to a well-known fabric service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtPassthroughIocb {
    /// Request handle
    pub handle: u32,
    /// Fabric service handle
    pub nport_handle: u16,
    /// Timeout in seconds
    pub timeout_secs: u16,
    /// CT request payload
    pub cmd: IocbSeg,
    /// CT response buffer
    pub resp: IocbSeg,
}

impl CtPassthroughIocb {
    /// Wire form
    pub fn encode(&self) -> Entry {
        let mut e = header(entry_type::CT_PASSTHROUGH);
        put_u32(&mut e, 4, self.handle);
        put_u16(&mut e, 10, self.nport_handle);
        put_u16(&mut e, 12, 1);
        put_u16(&mut e, 16, self.timeout_secs);
        put_u16(&mut e, 20, 1);
        put_u32(&mut e, 32, self.resp.len);
        put_u32(&mut e, 36, self.cmd.len);
        e[40..52].copy_from_slice(&self.cmd.encode());
        e[52..64].copy_from_slice(&self.resp.encode());
        e
    }

    /// Parse a request entry
    pub fn decode(e: &Entry) -> Self {
        Self {
            handle: get_u32(e, 4),
            nport_handle: get_u16(e, 10),
            timeout_secs: get_u16(e, 16),
            cmd: IocbSeg::decode(&e[40..52]),
            resp: IocbSeg::decode(&e[52..64]),
        }
    }

    /// Completion status of a returned entry
    pub fn status(e: &Entry) -> u16 {
        get_u16(e, 8)
    }

    /// Build a completion (simulated firmware)
    pub fn response(handle: u32, status: u16) -> Entry {
        let mut e = header(entry_type::CT_PASSTHROUGH);
        put_u32(&mut e, 4, handle);
        put_u16(&mut e, 8, status);
        e
    }
}

// =============================================================================
// STATUS
// =============================================================================

/// Bytes of response info and sense carried inline in a status entry
pub const STATUS_DATA_LEN: usize = 28;

/// Completion of a SCSI command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusEntry {
    /// CCB id of the command
    pub handle: u32,
    /// Firmware completion code
    pub completion: CompletionCode,
    /// Bytes not transferred
    pub resid: u32,
    /// State flags
    pub state_flags: u16,
    /// SCSI status byte and FCP_RSP flags
    pub scsi_status: u16,
    /// FCP_RESID reported by the target
    pub fcp_rsp_resid: u32,
    /// Sense byte count
    pub sense_len: u32,
    /// Response info byte count
    pub rsp_len: u32,
    /// Response info followed by sense
    pub data: [u8; STATUS_DATA_LEN],
}

impl StatusEntry {
    /// Parse a status entry
    pub fn decode(e: &Entry) -> Self {
        let mut data = [0u8; STATUS_DATA_LEN];
        data.copy_from_slice(&e[36..64]);
        Self {
            handle: get_u32(e, 4),
            completion: CompletionCode::from_u16(get_u16(e, 8)),
            resid: get_u32(e, 12),
            state_flags: get_u16(e, 18),
            scsi_status: get_u16(e, 22),
            fcp_rsp_resid: get_u32(e, 24),
            sense_len: get_u32(e, 28),
            rsp_len: get_u32(e, 32),
            data,
        }
    }

    /// Wire form (simulated firmware)
    pub fn encode(&self) -> Entry {
        let mut e = header(entry_type::STATUS);
        put_u32(&mut e, 4, self.handle);
        put_u16(&mut e, 8, self.completion.as_u16());
        put_u32(&mut e, 12, self.resid);
        put_u16(&mut e, 18, self.state_flags);
        put_u16(&mut e, 22, self.scsi_status);
        put_u32(&mut e, 24, self.fcp_rsp_resid);
        put_u32(&mut e, 28, self.sense_len);
        put_u32(&mut e, 32, self.rsp_len);
        e[36..64].copy_from_slice(&self.data);
        e
    }

    /// Successful completion for `handle`
    pub fn complete(handle: u32) -> Self {
        Self {
            handle,
            completion: CompletionCode::Complete,
            resid: 0,
            state_flags: 0,
            scsi_status: 0,
            fcp_rsp_resid: 0,
            sense_len: 0,
            rsp_len: 0,
            data: [0; STATUS_DATA_LEN],
        }
    }

    /// SCSI status byte
    pub const fn status_byte(&self) -> u8 {
        self.scsi_status as u8
    }

    /// Status flags above the status byte
    pub const fn flags(&self) -> ScsiStatusFlags {
        ScsiStatusFlags::from_bits_truncate(self.scsi_status)
    }

    /// Sense bytes, with every 32-bit word swapped from the firmware's
    /// byte order
    pub fn sense(&self) -> heapless::Vec<u8, STATUS_DATA_LEN> {
        let mut out = heapless::Vec::new();
        let start = (self.rsp_len as usize).min(STATUS_DATA_LEN);
        let end = start.saturating_add(self.sense_len as usize).min(STATUS_DATA_LEN);

        let mut words = [0u8; STATUS_DATA_LEN];
        for (dst, src) in words.chunks_exact_mut(4).zip(self.data.chunks_exact(4)) {
            dst.copy_from_slice(&[src[3], src[2], src[1], src[0]]);
        }
        // capacity equals the slice bound
        let _ = out.extend_from_slice(&words[start..end]);
        out
    }
}

// =============================================================================
// TRACE
// =============================================================================

/// Dump an entry at trace level when the `iocb-trace` feature is on
#[inline]
pub fn trace_entry(_what: &str, _slot: u16, _entry: &Entry) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "iocb-trace")] {
            for (i, row) in _entry.chunks(16).enumerate() {
                log::trace!("{} [{}] {:02x}: {:02x?}", _what, _slot, i * 16, row);
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
