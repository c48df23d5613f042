//! # Interrupt Handling
//!
//! One entry point, [`Qle::intr`], called by the bus glue from the
//! interrupt vector. It reads the RISC status once and dispatches on the
//! cause:
//!
//! ```text
//!   IntStatus & RISC? ── no ──▶ false (not ours)
//!        │
//!        ▼ RiscStatus
//!   ┌─────────┬──────────────┬──────────────┬──────────┐
//!   │ RSPQ    │ MBOX         │ ASYNC        │ other    │
//!   │ drain   │ deliver regs │ update tasks │ log      │
//!   └─────────┴──────────────┴──────────────┴──────────┘
//!        │           │              │             │
//!        └───────────┴── ClearRiscInt ────────────┘
//! ```
//!
//! A response interrupt is only acknowledged when the ring was actually
//! drained. While a polling submitter owns the response ring the cause is
//! left pending for the poller to consume.

use crate::discovery::UpdateTasks;
use crate::hba::{Qle, QlePlatform};
use crate::regs::{
    HostCommand, InterruptKind, InterruptStatus, Register, RegisterBank, INT_CTRL_ENABLE,
    INT_STATUS_RISC,
};
use core::sync::atomic::Ordering;
use log::{debug, info, warn};

/// Asynchronous event codes reported in mailbox 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum AsyncEvent {
    /// Firmware hit an internal error
    SystemError = 0x8002,
    /// Request ring transfer error
    ReqXferError = 0x8003,
    /// Response ring transfer error
    RspXferError = 0x8004,
    /// Loop initialization started
    LipOccurred = 0x8010,
    /// Link is up
    LoopUp = 0x8011,
    /// Link is down
    LoopDown = 0x8012,
    /// A LIP reset was received
    LipReset = 0x8013,
    /// Port database changed
    PortDbChange = 0x8014,
    /// Name server registered a change
    ChangeNotify = 0x8015,
    /// LIP F8 received
    LipF8 = 0x8016,
    /// Loop initialization failed
    LoopInitError = 0x8017,
    /// Point to point connection established
    PointToPoint = 0x8030,
    /// ZIO response update
    ZioRespUpdate = 0x8040,
}

impl AsyncEvent {
    /// Decode mailbox 0 of an async interrupt
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0x8002 => Some(AsyncEvent::SystemError),
            0x8003 => Some(AsyncEvent::ReqXferError),
            0x8004 => Some(AsyncEvent::RspXferError),
            0x8010 => Some(AsyncEvent::LipOccurred),
            0x8011 => Some(AsyncEvent::LoopUp),
            0x8012 => Some(AsyncEvent::LoopDown),
            0x8013 => Some(AsyncEvent::LipReset),
            0x8014 => Some(AsyncEvent::PortDbChange),
            0x8015 => Some(AsyncEvent::ChangeNotify),
            0x8016 => Some(AsyncEvent::LipF8),
            0x8017 => Some(AsyncEvent::LoopInitError),
            0x8030 => Some(AsyncEvent::PointToPoint),
            0x8040 => Some(AsyncEvent::ZioRespUpdate),
            _ => None,
        }
    }

    /// Discovery work the event calls for
    pub const fn tasks(self) -> UpdateTasks {
        match self {
            AsyncEvent::SystemError | AsyncEvent::ReqXferError | AsyncEvent::RspXferError => {
                UpdateTasks::SOFTRESET
            }
            AsyncEvent::LoopUp => UpdateTasks::UPDATE_TOPO
                .union(UpdateTasks::SCAN_LOOP)
                .union(UpdateTasks::SCAN_FABRIC),
            AsyncEvent::LoopDown => UpdateTasks::CLEAR_ALL,
            AsyncEvent::LipReset => UpdateTasks::FABRIC_RELOGIN,
            AsyncEvent::PortDbChange => UpdateTasks::SCAN_LOOP,
            AsyncEvent::ChangeNotify => UpdateTasks::SCAN_FABRIC,
            _ => UpdateTasks::empty(),
        }
    }
}

impl<P: QlePlatform> Qle<P> {
    /// Service an interrupt; false when the adapter did not raise one
    pub fn intr(&self) -> bool {
        match self.read_isr() {
            Some(isr) => {
                self.handle_intr(isr);
                true
            }
            None => false,
        }
    }

    /// Pending interrupt cause, if any
    pub(crate) fn read_isr(&self) -> Option<InterruptStatus> {
        let regs = self.platform.registers();
        if regs.read(Register::IntStatus) & INT_STATUS_RISC == 0 {
            return None;
        }
        Some(InterruptStatus::decode(regs.read(Register::RiscStatus)))
    }

    /// Dispatch one interrupt cause
    pub(crate) fn handle_intr(&self, isr: InterruptStatus) {
        match isr.kind {
            InterruptKind::Io => {
                if self.drain_responses() {
                    self.clear_isr();
                }
            }
            InterruptKind::Mailbox => {
                self.mbox_interrupt(isr.info);
                self.clear_isr();
            }
            InterruptKind::Async => {
                self.async_event(isr.info);
                self.clear_isr();
            }
            InterruptKind::Other(cause) => {
                debug!("qle: unknown interrupt cause {:#x}, info {:#06x}", cause, isr.info);
                self.clear_isr();
            }
        }
    }

    /// Acknowledge the current RISC interrupt
    pub(crate) fn clear_isr(&self) {
        self.host_cmd(HostCommand::ClearRiscInt);
    }

    /// Enable or mask adapter interrupts
    pub(crate) fn set_ints(&self, enabled: bool) {
        let value = if enabled { INT_CTRL_ENABLE } else { 0 };
        self.platform.registers().write(Register::IntCtrl, value);
    }

    /// Ring the host command doorbell
    pub(crate) fn host_cmd(&self, command: HostCommand) {
        self.platform
            .registers()
            .write(Register::HostCmdCtrl, command.value());
    }

    /// React to an asynchronous event
    pub(crate) fn async_event(&self, code: u16) {
        let Some(event) = AsyncEvent::from_code(code) else {
            debug!("qle: unknown async {:#06x}", code);
            return;
        };

        match event {
            AsyncEvent::SystemError => warn!("qle: system error, resetting"),
            AsyncEvent::ReqXferError => warn!("qle: request queue transfer error"),
            AsyncEvent::RspXferError => warn!("qle: response queue transfer error"),
            AsyncEvent::LoopUp => {
                info!("qle: loop up");
                self.loop_up.store(true, Ordering::Release);
                self.rings.require_marker();
            }
            AsyncEvent::LoopDown => {
                info!("qle: loop down");
                self.loop_up.store(false, Ordering::Release);
            }
            AsyncEvent::LipReset => {
                info!("qle: lip reset");
                self.rings.require_marker();
            }
            AsyncEvent::PortDbChange => {
                let regs = self.platform.registers();
                debug!(
                    "qle: port db changed {:#x} {:#x}",
                    regs.read_mbox(1),
                    regs.read_mbox(2)
                );
            }
            AsyncEvent::ChangeNotify => {
                let regs = self.platform.registers();
                let port_id =
                    (u32::from(regs.read_mbox(1) & 0xFF) << 16) | u32::from(regs.read_mbox(2));
                info!("qle: fabric change notify for {:06x}", port_id);
            }
            AsyncEvent::LipOccurred => info!("qle: lip occurred"),
            AsyncEvent::LipF8 => info!("qle: lip f8"),
            AsyncEvent::LoopInitError => warn!("qle: loop initialization error"),
            AsyncEvent::PointToPoint => info!("qle: point to point"),
            AsyncEvent::ZioRespUpdate => debug!("qle: zio response update"),
        }

        let tasks = event.tasks();
        if !tasks.is_empty() {
            self.update_start(tasks);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
