//! # Adapter Instance
//!
//! [`Qle`] ties the engines together: it owns every DMA region the firmware
//! sees, the CCB pool, the port registry and the discovery state, and it
//! is what the SCSI midlayer talks to through [`ScsiAdapter`].
//!
//! ```text
//!            ┌──────────────────────── Qle ───────────────────────────┐
//!  midlayer  │  CcbPool    Rings     SegmentTable   FCP_CMND   scratch│
//!  ───────▶  │     │         │            │            │         │    │
//!  scsi_cmd  │     └──── ring engine ─────┘            │         │    │
//!            │  Mailbox ◀── intr() ──▶ FabricOp        │         │    │
//!            │  PortRegistry ◀──── discovery worker ───┴─────────┘    │
//!            └──────────────────────────┬─────────────────────────────┘
//!                                       │ QlePlatform
//!                         registers  ·  DMA  ·  delays  ·  worker wakeup
//! ```
//!
//! Bring-up is two-phase. [`Qle::attach`] resets the chip, starts the
//! firmware and runs a first discovery pass with every wait polled. Once the
//! midlayer exists, [`Qle::attach_bus`] hands it over and from then on the
//! interrupt handler completes mailbox commands and I/O.

use crate::ccb::CcbPool;
use crate::config::QleConfig;
use crate::discovery::WorkerState;
use crate::dma::DmaRegion;
use crate::error::{QleError, QleResult};
use crate::fabric::FabricOp;
use crate::firmware::{FirmwareVersion, PRI_RING_ENTRIES};
use crate::iocb::{FCP_CMND_SIZE, QUEUE_ENTRY_SIZE};
use crate::mailbox::{cmd, Mailbox, MboxCommand};
use crate::port::{PortList, PortRegistry};
use crate::regs::{CtrlStatus, HostCommand, Register, RegisterBank, SIGNATURE};
use crate::ring::Rings;
use crate::segments::SegmentTable;
use crate::topology::LinkState;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use helix_hal::cpu::CpuRelax;
use helix_hal::dma::DmaEngine;
use helix_scsi::{LinkInfo, ScsiAdapter, ScsiMidlayer, ScsiXfer, XferError};
use log::{debug, info, warn};
use spin::{Mutex, Once};

/// Polls of mailbox 0 while waiting for a reset to finish
const RESET_MBOX_POLLS: u32 = 1000;
/// Polls of the DMA active bit
const DMA_SHUTDOWN_POLLS: u32 = 1000;
/// Polls of the reset bit
const RESET_BIT_POLLS: u32 = 500_000;
/// Consecutive loop-up polls before discovery starts
const LOOP_SETTLE_POLLS: u32 = 200;

/// What the driver needs from the machine around the adapter
pub trait QlePlatform: Send + Sync {
    /// Register window of the adapter
    type Registers: RegisterBank;
    /// DMA engine of the bus the adapter sits on
    type Dma: DmaEngine;
    /// Delay source
    type Cpu: CpuRelax;

    /// The adapter's registers
    fn registers(&self) -> &Self::Registers;

    /// DMA engine
    fn dma(&self) -> &Self::Dma;

    /// Delays and barriers
    fn cpu(&self) -> &Self::Cpu;

    /// Arrange for [`Qle::do_update`] to run soon in a context that may
    /// block. Called from interrupt context.
    fn schedule_update(&self);
}

/// One ISP24xx/25xx adapter
pub struct Qle<P: QlePlatform> {
    pub(crate) platform: P,
    pub(crate) config: QleConfig,
    pub(crate) bus: Once<Arc<dyn ScsiMidlayer>>,

    pub(crate) ccbs: CcbPool,
    pub(crate) rings: Rings,
    pub(crate) segments: SegmentTable,
    pub(crate) fcp_cmnds: DmaRegion,
    pub(crate) pri_requests: DmaRegion,
    pub(crate) scratch: Mutex<DmaRegion>,

    pub(crate) mailbox: Mailbox,
    pub(crate) fabric_op: FabricOp,

    pub(crate) ports: Mutex<PortRegistry>,
    pub(crate) tasks: AtomicU32,
    pub(crate) worker: Mutex<WorkerState>,
    pub(crate) link: Mutex<LinkState>,
    pub(crate) loop_up: AtomicBool,
    pub(crate) firmware: Mutex<Option<FirmwareVersion>>,
}

impl<P: QlePlatform> Qle<P> {
    /// Allocate everything the firmware will be pointed at
    pub fn new(platform: P, config: QleConfig) -> QleResult<Self> {
        config.validate()?;
        let dma = platform.dma();
        let max_cmds = config.max_cmds();

        let rings = Rings::alloc(dma, config.ring_entries)?;
        let segments =
            SegmentTable::alloc(dma, usize::from(max_cmds), config.max_segs).map_err(|e| {
                rings.free(dma);
                e
            })?;
        let fcp_cmnds =
            DmaRegion::alloc(dma, usize::from(max_cmds) * FCP_CMND_SIZE).map_err(|e| {
                rings.free(dma);
                segments.free(dma);
                e
            })?;
        let pri_requests =
            DmaRegion::alloc(dma, usize::from(PRI_RING_ENTRIES) * QUEUE_ENTRY_SIZE).map_err(
                |e| {
                    rings.free(dma);
                    segments.free(dma);
                    fcp_cmnds.free(dma);
                    e
                },
            )?;
        let scratch = DmaRegion::alloc(dma, config.scratch_size).map_err(|e| {
            rings.free(dma);
            segments.free(dma);
            fcp_cmnds.free(dma);
            pri_requests.free(dma);
            e
        })?;

        debug!(
            "qle: {} ccbs, {} ring entries, {} segments per command",
            max_cmds, config.ring_entries, config.max_segs
        );

        Ok(Self {
            ccbs: CcbPool::new(max_cmds),
            rings,
            segments,
            fcp_cmnds,
            pri_requests,
            scratch: Mutex::new(scratch),
            mailbox: Mailbox::new(),
            fabric_op: FabricOp::new(),
            ports: Mutex::new(PortRegistry::new(config.max_targets)),
            tasks: AtomicU32::new(0),
            worker: Mutex::new(WorkerState::default()),
            link: Mutex::new(LinkState::unknown()),
            loop_up: AtomicBool::new(false),
            firmware: Mutex::new(None),
            bus: Once::new(),
            platform,
            config,
        })
    }

    /// Platform the adapter was created with
    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// Active configuration
    pub fn config(&self) -> &QleConfig {
        &self.config
    }

    /// Whether the midlayer has been attached (interrupt-driven mode)
    pub fn bus_attached(&self) -> bool {
        self.bus.is_completed()
    }

    /// Whether the firmware reported the link up
    pub fn is_loop_up(&self) -> bool {
        self.loop_up.load(Ordering::Acquire)
    }

    /// Reset the chip, start the firmware and run the first discovery pass.
    ///
    /// `firmware` is an image to load first; `None` runs what the adapter
    /// boots from flash.
    pub fn attach(&self, firmware: Option<&[u32]>) -> QleResult<()> {
        let regs = self.platform.registers();
        if [regs.read_mbox(1), regs.read_mbox(2)] != SIGNATURE {
            info!("qle: startup mailboxes don't match signature, releasing RISC");
            self.host_cmd(HostCommand::Release);
        }
        self.host_cmd(HostCommand::Pause);

        self.softreset().map_err(|e| {
            warn!("qle: softreset failed: {}", e);
            e
        })?;

        if let Some(image) = firmware {
            self.load_firmware(image)?;
        }
        self.exec_firmware().map_err(|e| {
            warn!("qle: couldn't execute firmware: {}", e);
            e
        })?;
        self.about_firmware()?;
        self.init_firmware()?;
        self.set_firmware_options()?;

        if self.wait_loop_up() {
            self.do_update();
        } else {
            info!("qle: loop still down, giving up");
        }
        Ok(())
    }

    /// Poll for a settled loop up; true once it has been up long enough
    fn wait_loop_up(&self) -> bool {
        let cpu = self.platform.cpu();
        let mut settled = 0;
        for _ in 0..self.config.loop_wait_secs.saturating_mul(1000) {
            if self.is_loop_up() {
                settled += 1;
                if settled == LOOP_SETTLE_POLLS {
                    return true;
                }
            } else {
                settled = 0;
            }
            cpu.delay_us(1000);
            if let Some(isr) = self.read_isr() {
                self.handle_intr(isr);
            }
        }
        self.is_loop_up()
    }

    /// Switch to interrupt-driven operation with `bus` as the midlayer.
    ///
    /// Targets found before the bus existed are offered to it right away.
    ///
    /// From here on [`Qle::intr`] runs in interrupt context and takes the
    /// same spin locks as thread context. The bus glue must keep the
    /// adapter's interrupt masked on the local CPU while it calls into the
    /// driver from thread context.
    pub fn attach_bus(&self, bus: Arc<dyn ScsiMidlayer>) -> LinkInfo {
        if self.bus.is_completed() {
            warn!("qle: bus already attached");
        }
        let bus = self.bus.call_once(|| bus);

        let targets: Vec<u16> = self
            .ports
            .lock()
            .ports(PortList::Ports)
            .filter(|p| p.is_target())
            .map(|p| p.loopid)
            .collect();
        for target in targets {
            bus.probe_target(target);
        }
        self.link_info()
    }

    /// Reinitialize the chip.
    ///
    /// Blocked mailbox callers and the pending fabric operation are aborted,
    /// and every command in flight fails with [`XferError::Reset`].
    pub fn softreset(&self) -> QleResult<()> {
        let regs = self.platform.registers();
        let cpu = self.platform.cpu();

        if self.mailbox.abort() {
            warn!("qle: aborting mailbox command for reset");
        }
        self.fabric_op.reset();
        self.fail_active(XferError::Reset);

        self.set_ints(false);

        regs.write(Register::CtrlStatus, CtrlStatus::DMA_SHUTDOWN.bits());
        let dma_idle = poll(cpu, DMA_SHUTDOWN_POLLS, 100, || {
            regs.read(Register::CtrlStatus) & CtrlStatus::DMA_ACTIVE.bits() == 0
        });
        if !dma_idle {
            warn!("qle: dma doesn't appear to be shutting down");
            return Err(QleError::NotResponding);
        }

        regs.write(
            Register::CtrlStatus,
            (CtrlStatus::RESET | CtrlStatus::DMA_SHUTDOWN).bits(),
        );
        cpu.delay_us(100);

        if !poll(cpu, RESET_MBOX_POLLS, 100, || regs.read_mbox(0) == 0) {
            warn!("qle: reset mbox didn't clear");
            return Err(QleError::NotResponding);
        }
        if !poll(cpu, RESET_BIT_POLLS, 5, || {
            regs.read(Register::CtrlStatus) & CtrlStatus::RESET.bits() == 0
        }) {
            warn!("qle: reset status didn't clear");
            return Err(QleError::NotResponding);
        }

        self.host_cmd(HostCommand::Reset);
        self.host_cmd(HostCommand::Release);
        self.host_cmd(HostCommand::ClearReset);

        if !poll(cpu, RESET_MBOX_POLLS, 100, || regs.read_mbox(0) == 0) {
            warn!("qle: risc not ready after reset");
            return Err(QleError::NotResponding);
        }

        for reg in [
            Register::ReqIn,
            Register::ReqOut,
            Register::RespIn,
            Register::RespOut,
        ] {
            regs.write(reg, 0);
        }
        self.rings.req.lock().reset();
        self.rings.resp.lock().reset();

        self.set_ints(true);

        self.mbox(&MboxCommand::new(cmd::NOP)).map_err(|e| {
            warn!("qle: ISP not responding after reset: {}", e);
            QleError::NotResponding
        })?;
        Ok(())
    }

    /// Whether `target` is an attached port with a target role
    pub fn probe(&self, target: u16) -> bool {
        self.ports
            .lock()
            .target(target)
            .is_some_and(|port| port.is_target())
    }

    /// Link parameters for the midlayer
    pub fn link_info(&self) -> LinkInfo {
        LinkInfo {
            openings: self.config.max_cmds(),
            adapter_target: self.config.max_targets,
            adapter_buswidth: self.config.max_targets,
            port_wwn: self.config.port_name,
            node_wwn: self.config.node_wwn(),
        }
    }
}

/// Evaluate `done` up to `polls` times, `interval_us` apart
fn poll<C: CpuRelax>(cpu: &C, polls: u32, interval_us: u32, mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..polls {
        if done() {
            return true;
        }
        cpu.delay_us(interval_us);
    }
    done()
}

impl<P: QlePlatform> Drop for Qle<P> {
    fn drop(&mut self) {
        let dma = self.platform.dma();
        self.rings.free(dma);
        self.segments.free(dma);
        self.fcp_cmnds.free(dma);
        self.pri_requests.free(dma);
        self.scratch.get_mut().free(dma);
    }
}

impl<P: QlePlatform> ScsiAdapter for Qle<P> {
    fn scsi_cmd(&self, xs: Box<ScsiXfer>) -> Result<(), Box<ScsiXfer>> {
        self.submit(xs)
    }

    fn probe(&self, target: u16) -> bool {
        Qle::probe(self, target)
    }

    fn link_info(&self) -> LinkInfo {
        Qle::link_info(self)
    }
}

// =============================================================================
// TESTS
// =============================================================================
