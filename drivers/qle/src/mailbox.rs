//! # Mailbox Engine
//!
//! Synchronous firmware commands over the 16-bit mailbox registers.
//!
//! ```text
//!            begin()               ISR: deliver()
//!   Idle ──────────────▶ Pending ─────────────────▶ Delivered
//!    ▲                     │                            │
//!    │                     │ softreset: abort()         │
//!    │                     ▼                            │
//!    └──────────────── Aborted ◀────────────────────────┘
//!           finish()                  finish()
//! ```
//!
//! Before the SCSI bus is attached the issuing context polls the interrupt
//! status itself. Afterwards the interrupt handler captures the result and
//! the issuer spins on the state word. Either way, only one command is
//! outstanding: callers hold the section lock from register write to result.

use crate::error::{QleError, QleResult};
use crate::hba::{Qle, QlePlatform};
use crate::regs::{HostCommand, InterruptKind, RegisterBank, MBOX_COUNT};
use core::sync::atomic::{AtomicU32, Ordering};
use helix_hal::cpu::CpuRelax;
use helix_hal::PhysAddr;
use log::{debug, warn};
use spin::Mutex;

/// Mailbox command opcodes
pub mod cmd {
    /// No operation
    pub const NOP: u16 = 0x0000;
    /// Start firmware at an address
    pub const EXEC_FIRMWARE: u16 = 0x0002;
    /// Verify a loaded chunk
    pub const VERIFY_CHECKSUM: u16 = 0x0007;
    /// Firmware version
    pub const ABOUT_FIRMWARE: u16 = 0x0008;
    /// Copy words into RISC RAM
    pub const LOAD_RISC_RAM: u16 = 0x000B;
    /// Own loop id, port id and topology
    pub const GET_ID: u16 = 0x0020;
    /// Async event enables
    pub const SET_FIRMWARE_OPTIONS: u16 = 0x0038;
    /// Hand over the initialization control block
    pub const INIT_FIRMWARE: u16 = 0x0060;
    /// Port database entry of a loop id
    pub const GET_PORT_DB: u16 = 0x0064;
    /// Log out of a fabric port
    pub const FABRIC_PLOGO: u16 = 0x0071;
}

/// Successful completion in mailbox 0
pub const MBOX_COMPLETE: u16 = 0x4000;

/// States of the mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MboxState {
    /// No command outstanding
    Idle = 0,
    /// Command written, waiting for the firmware
    Pending = 1,
    /// Result captured by the interrupt handler
    Delivered = 2,
    /// Invalidated by a reset
    Aborted = 3,
}

impl MboxState {
    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MboxState::Idle),
            1 => Some(MboxState::Pending),
            2 => Some(MboxState::Delivered),
            3 => Some(MboxState::Aborted),
            _ => None,
        }
    }
}

/// A command and the registers it reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MboxCommand {
    regs: [u16; MBOX_COUNT],
    in_mask: u32,
    out_mask: u32,
}

impl MboxCommand {
    /// Command with only mailbox 0 in and out
    pub const fn new(opcode: u16) -> Self {
        let mut regs = [0u16; MBOX_COUNT];
        regs[0] = opcode;
        Self {
            regs,
            in_mask: 0x1,
            out_mask: 0x1,
        }
    }

    /// Set input register `index`
    pub fn reg(mut self, index: usize, value: u16) -> Self {
        self.regs[index] = value;
        self
    }

    /// Registers written to the firmware
    pub const fn inputs(mut self, mask: u32) -> Self {
        self.in_mask = mask;
        self
    }

    /// Registers read back on completion
    pub const fn outputs(mut self, mask: u32) -> Self {
        self.out_mask = mask;
        self
    }

    /// Place a 64-bit bus address in mailboxes 2, 3, 6 and 7
    pub fn dma_addr(self, addr: PhysAddr) -> Self {
        let a = addr.as_u64();
        self.reg(2, (a >> 16) as u16)
            .reg(3, a as u16)
            .reg(6, (a >> 48) as u16)
            .reg(7, (a >> 32) as u16)
    }

    /// Opcode
    pub const fn opcode(&self) -> u16 {
        self.regs[0]
    }

    /// Input register mask
    pub const fn in_mask(&self) -> u32 {
        self.in_mask
    }
}

/// Registers returned by a completed command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MboxOut {
    regs: [u16; MBOX_COUNT],
}

impl MboxOut {
    /// Output register `index`; 0 unless selected by the output mask
    pub const fn reg(&self, index: usize) -> u16 {
        self.regs[index]
    }
}

/// Mailbox bookkeeping shared between issuer and interrupt handler
pub struct Mailbox {
    section: Mutex<()>,
    state: AtomicU32,
    out_mask: AtomicU32,
    result: Mutex<[u16; MBOX_COUNT]>,
}

impl Mailbox {
    /// Idle mailbox
    pub const fn new() -> Self {
        Self {
            section: Mutex::new(()),
            state: AtomicU32::new(MboxState::Idle as u32),
            out_mask: AtomicU32::new(0),
            result: Mutex::new([0; MBOX_COUNT]),
        }
    }

    /// Current state
    pub fn state(&self) -> MboxState {
        MboxState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(MboxState::Idle)
    }

    fn transition(&self, from: MboxState, to: MboxState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim the mailbox for a command reading back `out_mask`
    pub fn begin(&self, out_mask: u32) -> QleResult<()> {
        if !self.transition(MboxState::Idle, MboxState::Pending) {
            return Err(QleError::MailboxBusy);
        }
        self.out_mask.store(out_mask, Ordering::Relaxed);
        Ok(())
    }

    /// Record a result from the interrupt handler; false if nothing waits
    pub fn deliver(&self, regs: [u16; MBOX_COUNT]) -> bool {
        if self.state() != MboxState::Pending {
            return false;
        }
        *self.result.lock() = regs;
        self.transition(MboxState::Pending, MboxState::Delivered)
    }

    /// Invalidate the outstanding command; false if nothing waits
    pub fn abort(&self) -> bool {
        self.transition(MboxState::Pending, MboxState::Aborted)
    }

    /// Collect the outcome and return to idle
    pub fn finish(&self) -> (MboxState, [u16; MBOX_COUNT]) {
        let state = self.state();
        let regs = *self.result.lock();
        self.state.store(MboxState::Idle as u32, Ordering::Release);
        (state, regs)
    }

    /// Registers the outstanding command wants back
    pub fn out_mask(&self) -> u32 {
        self.out_mask.load(Ordering::Relaxed)
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// ISSUE
// =============================================================================

impl<P: QlePlatform> Qle<P> {
    /// Run a mailbox command to completion
    pub fn mbox(&self, command: &MboxCommand) -> QleResult<MboxOut> {
        let _section = self.mailbox.section.lock();
        self.mailbox.begin(command.out_mask)?;

        let regs = self.platform.registers();
        for (i, value) in command.regs.iter().enumerate() {
            if command.in_mask & (1 << i) != 0 {
                regs.write_mbox(i, *value);
            }
        }
        self.host_cmd(HostCommand::SetHostInt);

        let result = if self.bus_attached() {
            self.mbox_wait(command)
        } else {
            self.mbox_poll(command)
        };
        if let Err(e) = result {
            debug!("qle: mailbox {:#x} failed: {}", command.opcode(), e);
        }
        result
    }

    fn mbox_poll(&self, command: &MboxCommand) -> QleResult<MboxOut> {
        let mut code = 0;
        for _ in 0..self.config.mbox_timeout_polls {
            if self.mailbox.state() != MboxState::Pending {
                // completed through the interrupt handler or aborted
                return self.mbox_wait(command);
            }
            self.platform.cpu().delay_us(self.config.poll_interval_us);
            let Some(isr) = self.read_isr() else {
                continue;
            };
            if isr.kind == InterruptKind::Mailbox {
                code = isr.info;
                break;
            }
            self.handle_intr(isr);
        }

        let out = if code == MBOX_COMPLETE {
            Ok(self.read_out_regs(command.out_mask))
        } else if code == 0 {
            warn!("qle: mailbox {:#x} timed out", command.opcode());
            Err(QleError::Timeout)
        } else {
            Err(QleError::Firmware(code))
        };
        if code != 0 {
            self.clear_isr();
        }
        if self.mailbox.state() == MboxState::Aborted {
            self.mailbox.finish();
            return Err(QleError::Aborted);
        }
        self.mailbox.finish();
        out
    }

    fn mbox_wait(&self, command: &MboxCommand) -> QleResult<MboxOut> {
        let mut polls = 0;
        while self.mailbox.state() == MboxState::Pending {
            if polls == self.config.mbox_timeout_polls {
                warn!("qle: mailbox {:#x} timed out", command.opcode());
                self.mailbox.finish();
                return Err(QleError::Timeout);
            }
            polls += 1;
            self.platform.cpu().delay_us(self.config.poll_interval_us);
        }

        let (state, regs) = self.mailbox.finish();
        match state {
            MboxState::Aborted => Err(QleError::Aborted),
            _ if regs[0] == MBOX_COMPLETE => Ok(MboxOut { regs }),
            _ => Err(QleError::Firmware(regs[0])),
        }
    }

    fn read_out_regs(&self, mask: u32) -> MboxOut {
        let regs = self.platform.registers();
        let mut out = [0u16; MBOX_COUNT];
        for (i, slot) in out.iter_mut().enumerate() {
            if mask & (1 << i) != 0 {
                *slot = regs.read_mbox(i);
            }
        }
        MboxOut { regs: out }
    }

    /// Interrupt-side mailbox completion
    pub(crate) fn mbox_interrupt(&self, code: u16) {
        let mut regs = [0u16; MBOX_COUNT];
        if code == MBOX_COMPLETE {
            regs = self.read_out_regs(self.mailbox.out_mask()).regs;
        }
        regs[0] = code;
        if !self.mailbox.deliver(regs) {
            warn!("qle: unexpected mailbox interrupt: {:#x}", code);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
