//! # Register Access
//!
//! The ISP exposes a handful of 32-bit control registers and a bank of
//! 16-bit mailbox registers. The driver reaches them through
//! [`RegisterBank`], which the bus glue implements on top of a mapped BAR.

use bitflags::bitflags;

/// Mailbox registers on 24xx and later
pub const MBOX_COUNT: usize = 32;

/// Startup signature in mailboxes 1 and 2 ("ISP ")
pub const SIGNATURE: [u16; 2] = [0x4953, 0x5020];

/// Control registers the driver touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Register {
    /// Control and status
    CtrlStatus,
    /// Interrupt enable
    IntCtrl,
    /// Interrupt pending
    IntStatus,
    /// Request ring producer
    ReqIn,
    /// Request ring consumer
    ReqOut,
    /// Response ring producer
    RespIn,
    /// Response ring consumer
    RespOut,
    /// RISC status and interrupt cause
    RiscStatus,
    /// Host command doorbell
    HostCmdCtrl,
    /// GPIO data
    GpioData,
}

impl Register {
    /// Byte offset from the register window base
    pub const fn offset(self) -> u32 {
        match self {
            Register::CtrlStatus => 0x08,
            Register::IntCtrl => 0x0C,
            Register::IntStatus => 0x10,
            Register::ReqIn => 0x1C,
            Register::ReqOut => 0x20,
            Register::RespIn => 0x24,
            Register::RespOut => 0x28,
            Register::RiscStatus => 0x44,
            Register::HostCmdCtrl => 0x48,
            Register::GpioData => 0x6C,
        }
    }
}

/// Byte offset of mailbox register `index`
pub const fn mbox_offset(index: usize) -> u32 {
    0x80 + (index as u32) * 2
}

bitflags! {
    /// Control/status register bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlStatus: u32 {
        /// Stop DMA engines
        const DMA_SHUTDOWN = 0x0000_0001;
        /// Soft reset in progress
        const RESET = 0x0001_0000;
        /// DMA engines still running
        const DMA_ACTIVE = 0x0002_0000;
    }
}

/// Interrupt enable bit in [`Register::IntCtrl`]
pub const INT_CTRL_ENABLE: u32 = 0x0000_0008;
/// RISC interrupt pending bit in [`Register::IntStatus`]
pub const INT_STATUS_RISC: u32 = 0x0000_0008;

/// Commands written to the host command doorbell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum HostCommand {
    /// Assert RISC reset
    Reset = 0x1,
    /// Deassert RISC reset
    ClearReset = 0x2,
    /// Pause the RISC
    Pause = 0x3,
    /// Release a paused RISC
    Release = 0x4,
    /// Ring the mailbox doorbell
    SetHostInt = 0x5,
    /// Clear the mailbox doorbell
    ClearHostInt = 0x6,
    /// Acknowledge a RISC interrupt
    ClearRiscInt = 0xA,
}

impl HostCommand {
    const SHIFT: u32 = 28;

    /// Register value for this command
    pub const fn value(self) -> u32 {
        (self as u32) << Self::SHIFT
    }

    /// Decode a doorbell write
    pub fn from_value(value: u32) -> Option<Self> {
        match value >> Self::SHIFT {
            0x1 => Some(HostCommand::Reset),
            0x2 => Some(HostCommand::ClearReset),
            0x3 => Some(HostCommand::Pause),
            0x4 => Some(HostCommand::Release),
            0x5 => Some(HostCommand::SetHostInt),
            0x6 => Some(HostCommand::ClearHostInt),
            0xA => Some(HostCommand::ClearRiscInt),
            _ => None,
        }
    }
}

/// Interrupt cause codes in the low byte of [`Register::RiscStatus`]
pub mod cause {
    /// Mailbox completion from the boot ROM
    pub const ROM_MBOX: u8 = 0x01;
    /// Mailbox failure from the boot ROM
    pub const ROM_MBOX_FAIL: u8 = 0x02;
    /// Mailbox completion
    pub const MBOX: u8 = 0x10;
    /// Mailbox failure
    pub const MBOX_FAIL: u8 = 0x11;
    /// Asynchronous event
    pub const ASYNC: u8 = 0x12;
    /// Response ring update
    pub const RSPQ: u8 = 0x13;
}

/// What an interrupt is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// Mailbox command finished, info holds mailbox 0
    Mailbox,
    /// Asynchronous event, info holds the event code
    Async,
    /// Response ring has new entries
    Io,
    /// Anything else
    Other(u8),
}

/// Decoded RISC status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptStatus {
    /// Cause class
    pub kind: InterruptKind,
    /// Upper half of the status register
    pub info: u16,
}

impl InterruptStatus {
    const INFO_SHIFT: u32 = 16;

    /// Decode a RISC status register value
    pub fn decode(risc_status: u32) -> Self {
        let kind = match risc_status as u8 {
            cause::ROM_MBOX | cause::ROM_MBOX_FAIL | cause::MBOX | cause::MBOX_FAIL => {
                InterruptKind::Mailbox
            }
            cause::ASYNC => InterruptKind::Async,
            cause::RSPQ => InterruptKind::Io,
            other => InterruptKind::Other(other),
        };
        Self {
            kind,
            info: (risc_status >> Self::INFO_SHIFT) as u16,
        }
    }

    /// Encode a status register value
    pub const fn encode(code: u8, info: u16) -> u32 {
        ((info as u32) << Self::INFO_SHIFT) | code as u32
    }
}

/// Access to the adapter's registers
pub trait RegisterBank: Send + Sync {
    /// Read a control register
    fn read(&self, reg: Register) -> u32;

    /// Write a control register
    fn write(&self, reg: Register, value: u32);

    /// Read mailbox register `index`
    fn read_mbox(&self, index: usize) -> u16;

    /// Write mailbox register `index`
    fn write_mbox(&self, index: usize, value: u16);
}

// =============================================================================
// TESTS
// =============================================================================
