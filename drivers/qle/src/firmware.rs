//! # Firmware Bring-Up
//!
//! Everything between a reset RISC and a running firmware that knows where
//! its rings are:
//!
//! ```text
//!   [image] ──LOAD_RISC_RAM/VERIFY_CHECKSUM per chunk──▶ RISC RAM
//!        │
//!        ▼
//!   EXEC_FIRMWARE ──▶ ABOUT_FIRMWARE ──▶ INIT_FIRMWARE(icb) ──▶ SET_FIRMWARE_OPTIONS
//! ```
//!
//! An image is a sequence of chunks of 32-bit words. Each chunk starts with
//! a header: word 1 is zero on the last chunk, word 2 is the RISC load
//! address and word 3 the chunk length in words, header included.

use crate::config::QleConfig;
use crate::dma::DmaRegion;
use crate::error::{QleError, QleResult};
use crate::hba::{Qle, QlePlatform};
use crate::mailbox::{cmd, MboxCommand};
use crate::ring::Rings;
use bitflags::bitflags;
use core::fmt;
use helix_hal::cpu::CpuRelax;
use helix_hal::dma::DmaSync;
use helix_hal::PhysAddr;
use log::{debug, info, warn};

/// RISC address firmware starts executing at
pub const CODE_ORG: u32 = 0x0010_0000;

/// Bounce buffer for image chunks
const FW_BOUNCE_SIZE: usize = 64 * 1024;

/// Words copied per `LOAD_RISC_RAM`
const FW_CHUNK_WORDS: usize = 1024;

/// Words in a chunk header
const FW_HEADER_WORDS: usize = 4;

/// Settle time after starting the firmware
const EXEC_SETTLE_US: u32 = 250_000;

/// Entries in the priority request ring
pub const PRI_RING_ENTRIES: u16 = 8;

/// Firmware version reported by `ABOUT_FIRMWARE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Subminor version
    pub sub: u16,
    /// Attribute bits
    pub attributes: u16,
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.sub)
    }
}

bitflags! {
    /// Async notifications enabled through `SET_FIRMWARE_OPTIONS`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FwOptions: u16 {
        /// Report LIP F8
        const ASYNC_LIP_F8 = 0x0001;
        /// Report LIP reset
        const ASYNC_LIP_RESET = 0x0002;
        /// Report LIP errors
        const ASYNC_LIP_ERROR = 0x0080;
        /// Report login rejects
        const ASYNC_LOGIN_RJT = 0x0800;
    }
}

bitflags! {
    /// First word of firmware options in the control block
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IcbOptions1: u32 {
        /// Use the hard loop address
        const HARD_ADDR = 0x0000_0001;
        /// Fairness
        const FAIRNESS = 0x0000_0002;
        /// Full duplex
        const FULL_DUPLEX = 0x0000_0004;
        /// Use the node name from the control block
        const NODE_NAME = 0x0000_4000;
    }
}

bitflags! {
    /// Second word of firmware options in the control block
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IcbOptions2: u32 {
        /// Loop preferred, point to point otherwise
        const LOOP_PTP = 0x0000_0020;
    }
}

// =============================================================================
// INITIALIZATION CONTROL BLOCK
// =============================================================================

/// Initialization control block handed over by `INIT_FIRMWARE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitControlBlock {
    /// Format version
    pub version: u16,
    /// Maximum frame payload
    pub frame_len: u16,
    /// Execution throttle
    pub exec_throttle: u16,
    /// Hard loop address
    pub hard_address: u16,
    /// World-wide port name
    pub port_name: u64,
    /// World-wide node name
    pub node_name: u64,
    /// Login retry count
    pub login_retry: u16,
    /// Response ring entries
    pub resp_len: u16,
    /// Request ring entries
    pub req_len: u16,
    /// Link down timeout
    pub link_down_nos: u16,
    /// Priority request ring entries
    pub pri_req_len: u16,
    /// Request ring bus address
    pub req_addr: u64,
    /// Response ring bus address
    pub resp_addr: u64,
    /// Priority request ring bus address
    pub pri_req_addr: u64,
    /// Firmware options, first word
    pub options1: IcbOptions1,
    /// Firmware options, second word
    pub options2: IcbOptions2,
}

impl InitControlBlock {
    /// Wire size
    pub const SIZE: usize = 128;
    /// Format version understood by 24xx firmware
    pub const VERSION: u16 = 1;

    /// Control block for `config` and the given rings
    pub fn new(config: &QleConfig, rings: &Rings, pri_requests: PhysAddr) -> Self {
        Self {
            version: Self::VERSION,
            frame_len: config.frame_len,
            exec_throttle: config.exec_throttle,
            hard_address: config.hard_address,
            port_name: config.port_name,
            node_name: config.node_wwn(),
            login_retry: u16::from(config.login_retry),
            resp_len: rings.entries(),
            req_len: rings.entries(),
            link_down_nos: config.link_down_nos,
            pri_req_len: PRI_RING_ENTRIES,
            req_addr: rings.requests.paddr().as_u64(),
            resp_addr: rings.responses.paddr().as_u64(),
            pri_req_addr: pri_requests.as_u64(),
            options1: IcbOptions1::HARD_ADDR | IcbOptions1::FAIRNESS | IcbOptions1::FULL_DUPLEX,
            options2: IcbOptions2::LOOP_PTP,
        }
    }

    /// Wire form; names are big-endian, everything else little-endian
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..2].copy_from_slice(&self.version.to_le_bytes());
        b[4..6].copy_from_slice(&self.frame_len.to_le_bytes());
        b[6..8].copy_from_slice(&self.exec_throttle.to_le_bytes());
        b[10..12].copy_from_slice(&self.hard_address.to_le_bytes());
        b[12..20].copy_from_slice(&self.port_name.to_be_bytes());
        b[20..28].copy_from_slice(&self.node_name.to_be_bytes());
        b[32..34].copy_from_slice(&self.login_retry.to_le_bytes());
        b[36..38].copy_from_slice(&self.resp_len.to_le_bytes());
        b[38..40].copy_from_slice(&self.req_len.to_le_bytes());
        b[40..42].copy_from_slice(&self.link_down_nos.to_le_bytes());
        b[42..44].copy_from_slice(&self.pri_req_len.to_le_bytes());
        b[44..52].copy_from_slice(&self.req_addr.to_le_bytes());
        b[52..60].copy_from_slice(&self.resp_addr.to_le_bytes());
        b[60..68].copy_from_slice(&self.pri_req_addr.to_le_bytes());
        b[92..96].copy_from_slice(&self.options1.bits().to_le_bytes());
        b[96..100].copy_from_slice(&self.options2.bits().to_le_bytes());
        b
    }

    /// Parse the wire form (simulated firmware)
    pub fn decode(b: &[u8; Self::SIZE]) -> Self {
        let u16_at = |o: usize| u16::from_le_bytes([b[o], b[o + 1]]);
        let u32_at = |o: usize| u32::from_le_bytes([b[o], b[o + 1], b[o + 2], b[o + 3]]);
        let u64_le = |o: usize| u64::from(u32_at(o)) | (u64::from(u32_at(o + 4)) << 32);
        let u64_be = |o: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b[o..o + 8]);
            u64::from_be_bytes(raw)
        };
        Self {
            version: u16_at(0),
            frame_len: u16_at(4),
            exec_throttle: u16_at(6),
            hard_address: u16_at(10),
            port_name: u64_be(12),
            node_name: u64_be(20),
            login_retry: u16_at(32),
            resp_len: u16_at(36),
            req_len: u16_at(38),
            link_down_nos: u16_at(40),
            pri_req_len: u16_at(42),
            req_addr: u64_le(44),
            resp_addr: u64_le(52),
            pri_req_addr: u64_le(60),
            options1: IcbOptions1::from_bits_truncate(u32_at(92)),
            options2: IcbOptions2::from_bits_truncate(u32_at(96)),
        }
    }
}

// =============================================================================
// IMAGE CHUNKS
// =============================================================================

/// One chunk of a firmware image
#[derive(Debug, Clone, Copy)]
pub struct FirmwareChunk<'a> {
    /// RISC load address
    pub dest: u32,
    /// Chunk words, header included
    pub words: &'a [u32],
}

/// Split `image` into chunks, checking every header
pub fn split_chunks(mut image: &[u32]) -> QleResult<alloc::vec::Vec<FirmwareChunk<'_>>> {
    let mut chunks = alloc::vec::Vec::new();
    loop {
        if image.len() < FW_HEADER_WORDS {
            return Err(QleError::InvalidFirmware);
        }
        let len = image[3] as usize;
        if len < FW_HEADER_WORDS || len > image.len() {
            return Err(QleError::InvalidFirmware);
        }
        chunks.push(FirmwareChunk {
            dest: image[2],
            words: &image[..len],
        });
        if image[1] == 0 {
            return Ok(chunks);
        }
        image = &image[len..];
    }
}

// =============================================================================
// OPERATIONS
// =============================================================================

impl<P: QlePlatform> Qle<P> {
    /// Copy a firmware image into RISC RAM
    pub fn load_firmware(&self, image: &[u32]) -> QleResult<()> {
        let chunks = split_chunks(image)?;
        let dma = self.platform.dma();
        let bounce = DmaRegion::alloc(dma, FW_BOUNCE_SIZE)?;
        let result = chunks
            .iter()
            .try_for_each(|chunk| self.load_chunk(&bounce, chunk));
        bounce.free(dma);
        result
    }

    fn load_chunk(&self, bounce: &DmaRegion, chunk: &FirmwareChunk<'_>) -> QleResult<()> {
        let dma = self.platform.dma();
        debug!(
            "qle: loading {} words at {:#x}",
            chunk.words.len(),
            chunk.dest
        );

        let mut dest = chunk.dest;
        for words in chunk.words.chunks(FW_CHUNK_WORDS) {
            for (i, word) in words.iter().enumerate() {
                bounce.write(i * 4, &word.to_le_bytes());
            }
            let len = words.len() * 4;
            bounce.sync(dma, 0, len, DmaSync::PRE_WRITE);
            let count = words.len() as u32;
            let command = MboxCommand::new(cmd::LOAD_RISC_RAM)
                .reg(1, dest as u16)
                .dma_addr(bounce.paddr())
                .reg(4, (count >> 16) as u16)
                .reg(5, count as u16)
                .reg(8, (dest >> 16) as u16)
                .inputs(0x01ff);
            let result = self.mbox(&command);
            bounce.sync(dma, 0, len, DmaSync::POST_WRITE);
            result.map_err(|e| {
                warn!("qle: firmware load at {:#x} failed: {}", dest, e);
                e
            })?;
            dest += count;
        }

        let verify = MboxCommand::new(cmd::VERIFY_CHECKSUM)
            .reg(1, (chunk.dest >> 16) as u16)
            .reg(2, chunk.dest as u16)
            .inputs(0x0007)
            .outputs(0x0007);
        self.mbox(&verify).map_err(|e| {
            warn!("qle: firmware checksum at {:#x} failed: {}", chunk.dest, e);
            e
        })?;
        Ok(())
    }

    /// Start the firmware at [`CODE_ORG`]
    pub(crate) fn exec_firmware(&self) -> QleResult<()> {
        let command = MboxCommand::new(cmd::EXEC_FIRMWARE)
            .reg(1, (CODE_ORG >> 16) as u16)
            .reg(2, CODE_ORG as u16)
            .inputs(0x001f);
        self.mbox(&command)?;
        self.platform.cpu().delay_us(EXEC_SETTLE_US);
        Ok(())
    }

    /// Ask the running firmware for its version
    pub(crate) fn about_firmware(&self) -> QleResult<FirmwareVersion> {
        let out = self.mbox(&MboxCommand::new(cmd::ABOUT_FIRMWARE).outputs(0x004f))?;
        let version = FirmwareVersion {
            major: out.reg(1),
            minor: out.reg(2),
            sub: out.reg(3),
            attributes: out.reg(6),
        };
        info!(
            "qle: firmware {}, attributes {:#x}",
            version, version.attributes
        );
        *self.firmware.lock() = Some(version);
        Ok(version)
    }

    /// Version of the running firmware, once known
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        *self.firmware.lock()
    }

    /// Hand the control block to the firmware
    pub(crate) fn init_firmware(&self) -> QleResult<()> {
        let icb = InitControlBlock::new(&self.config, &self.rings, self.pri_requests.paddr());
        let dma = self.platform.dma();
        let scratch = self.scratch.lock();
        scratch.write(0, &icb.encode());
        scratch.sync(dma, 0, InitControlBlock::SIZE, DmaSync::PRE_WRITE);
        let command = MboxCommand::new(cmd::INIT_FIRMWARE)
            .dma_addr(scratch.paddr())
            .inputs(0x00fd);
        let result = self.mbox(&command);
        scratch.sync(dma, 0, InitControlBlock::SIZE, DmaSync::POST_WRITE);
        drop(scratch);

        result.map(|_| ()).map_err(|e| {
            warn!("qle: firmware init failed: {}", e);
            e
        })
    }

    /// Turn on the async notifications discovery depends on
    pub(crate) fn set_firmware_options(&self) -> QleResult<()> {
        let options = FwOptions::ASYNC_LIP_F8
            | FwOptions::ASYNC_LIP_RESET
            | FwOptions::ASYNC_LIP_ERROR
            | FwOptions::ASYNC_LOGIN_RJT;
        let command = MboxCommand::new(cmd::SET_FIRMWARE_OPTIONS)
            .reg(1, options.bits())
            .inputs(0x000f);
        self.mbox(&command).map(|_| ()).map_err(|e| {
            warn!("qle: setting firmware options failed: {}", e);
            e
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
