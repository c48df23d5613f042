//! # Fabric Services
//!
//! Name server queries and port logins. Both travel through the request
//! ring as IOCBs; their completions come back through the response ring
//! into a single pending-operation slot, since the discovery worker never
//! has more than one outstanding.
//!
//! ```text
//!   worker                     response ring
//!     │ begin()                      │
//!     ├──▶ PLOGX / CT IOCB ──▶ HBA ──┤
//!     │                              ▼
//!     │ wait (poll or sleep)   FabricOp::complete(entry)
//!     ◀──────────── take() ──────────┘
//! ```
//!
//! Every operation carries a fresh handle. A completion whose handle does
//! not match the pending operation belongs to one that already timed out
//! and is dropped.

use crate::dma::DmaRegion;
use crate::error::{QleError, QleResult};
use crate::hba::{Qle, QlePlatform};
use crate::iocb::{self, CtPassthroughIocb, Entry, IocbSeg, PlogxIocb, QUEUE_ENTRY_SIZE};
use crate::mailbox::{cmd, MboxCommand};
use crate::port::{FcPort, PortFlags};
use core::sync::atomic::{AtomicU32, Ordering};
use helix_hal::cpu::CpuRelax;
use helix_hal::dma::DmaSync;
use log::{debug, info, warn};
use spin::Mutex;

/// Handle of the fabric name server
pub const SNS_HANDLE: u16 = 0x7FC;

/// Marks fabric operation handles; the low half counts operations
const FABRIC_HANDLE_TAG: u32 = 0x0001_0000;
/// Handle no operation ever carries
const NO_HANDLE: u32 = 0;
/// Name server timeout handed to the firmware
const CT_TIMEOUT_SECS: u16 = 10;

// =============================================================================
// PENDING OPERATION
// =============================================================================

/// State of the fabric operation slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FabricState {
    /// Nothing outstanding
    Idle = 0,
    /// IOCB posted
    Pending = 1,
    /// Completion captured
    Done = 2,
}

impl FabricState {
    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(FabricState::Idle),
            1 => Some(FabricState::Pending),
            2 => Some(FabricState::Done),
            _ => None,
        }
    }
}

/// Slot for the one fabric operation in flight
pub struct FabricOp {
    state: AtomicU32,
    handle: AtomicU32,
    sequence: AtomicU32,
    response: Mutex<Entry>,
}

impl FabricOp {
    /// Idle slot
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(FabricState::Idle as u32),
            handle: AtomicU32::new(NO_HANDLE),
            sequence: AtomicU32::new(0),
            response: Mutex::new([0; QUEUE_ENTRY_SIZE]),
        }
    }

    /// Current state
    pub fn state(&self) -> FabricState {
        FabricState::from_u32(self.state.load(Ordering::Acquire)).unwrap_or(FabricState::Idle)
    }

    /// Claim the slot; returns the handle the operation's IOCB must carry
    pub fn begin(&self) -> QleResult<u32> {
        self.state
            .compare_exchange(
                FabricState::Idle as u32,
                FabricState::Pending as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| QleError::Busy)?;
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
        let handle = FABRIC_HANDLE_TAG | sequence;
        self.handle.store(handle, Ordering::Release);
        Ok(handle)
    }

    /// Capture the completion of the pending operation.
    ///
    /// Returns false, dropping `entry`, when nothing is pending or `entry`
    /// answers an earlier operation.
    pub fn complete(&self, entry: &Entry) -> bool {
        if self.state() != FabricState::Pending {
            warn!("qle: fabric completion with nothing pending");
            return false;
        }
        let handle = iocb::entry_handle(entry);
        let expected = self.handle.load(Ordering::Acquire);
        if handle != expected {
            warn!("qle: stale fabric completion {:#x}, waiting for {:#x}", handle, expected);
            return false;
        }
        *self.response.lock() = *entry;
        self.state
            .compare_exchange(
                FabricState::Pending as u32,
                FabricState::Done as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Collect a captured completion and free the slot
    pub fn take(&self) -> Option<Entry> {
        if self.state() != FabricState::Done {
            return None;
        }
        let entry = *self.response.lock();
        self.handle.store(NO_HANDLE, Ordering::Release);
        self.state.store(FabricState::Idle as u32, Ordering::Release);
        Some(entry)
    }

    /// Drop whatever is outstanding
    pub fn reset(&self) {
        self.handle.store(NO_HANDLE, Ordering::Release);
        self.state.store(FabricState::Idle as u32, Ordering::Release);
    }
}

impl Default for FabricOp {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// GA_NXT
// =============================================================================

/// Bytes of a GA_NXT request
pub const GA_NXT_REQ_LEN: usize = 20;
/// Bytes of a GA_NXT response
pub const GA_NXT_RESP_LEN: usize = 636;

/// CT revision
const CT_REVISION: u8 = 0x01;
/// Directory service
const CT_GS_TYPE: u8 = 0xFC;
/// Name server
const CT_GS_SUBTYPE: u8 = 0x02;
/// Get all next
const SNS_GA_NXT: u16 = 0x0100;
/// Accepted response code
pub const CT_ACCEPT: u16 = 0x8002;
/// Rejected response code
pub const CT_REJECT: u16 = 0x8001;

/// Build a GA_NXT request for the port after `port_id`
pub fn ga_nxt_request(port_id: u32) -> [u8; GA_NXT_REQ_LEN] {
    let mut req = [0u8; GA_NXT_REQ_LEN];
    req[0] = CT_REVISION;
    req[4] = CT_GS_TYPE;
    req[5] = CT_GS_SUBTYPE;
    req[8..10].copy_from_slice(&SNS_GA_NXT.to_be_bytes());
    req[10..12].copy_from_slice(&(((GA_NXT_RESP_LEN - 16) / 4) as u16).to_be_bytes());
    req[16..20].copy_from_slice(&port_id.to_be_bytes());
    req
}

/// Port id asked for by a GA_NXT request
pub fn ga_nxt_port(req: &[u8]) -> u32 {
    u32::from_be_bytes([req[16], req[17], req[18], req[19]])
}

/// The parts of a GA_NXT response the driver uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GaNxtResponse {
    /// CT response code
    pub response: u16,
    /// Port type in the top byte, port id below
    pub port_type_id: u32,
    /// World-wide port name
    pub port_name: u64,
    /// World-wide node name
    pub node_name: u64,
}

impl GaNxtResponse {
    const PORT_TYPE_ID: usize = 16;
    const PORT_NAME: usize = 20;
    const NODE_NAME: usize = 284;

    /// Parse a response
    pub fn decode(raw: &[u8; GA_NXT_RESP_LEN]) -> Self {
        let be64 = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[off..off + 8]);
            u64::from_be_bytes(b)
        };
        let t = Self::PORT_TYPE_ID;
        Self {
            response: u16::from_be_bytes([raw[8], raw[9]]),
            port_type_id: u32::from_be_bytes([raw[t], raw[t + 1], raw[t + 2], raw[t + 3]]),
            port_name: be64(Self::PORT_NAME),
            node_name: be64(Self::NODE_NAME),
        }
    }

    /// Produce a response (simulated name server)
    pub fn encode(&self) -> [u8; GA_NXT_RESP_LEN] {
        let mut raw = [0u8; GA_NXT_RESP_LEN];
        raw[0] = CT_REVISION;
        raw[4] = CT_GS_TYPE;
        raw[5] = CT_GS_SUBTYPE;
        raw[8..10].copy_from_slice(&self.response.to_be_bytes());
        raw[Self::PORT_TYPE_ID..Self::PORT_TYPE_ID + 4]
            .copy_from_slice(&self.port_type_id.to_be_bytes());
        raw[Self::PORT_NAME..Self::PORT_NAME + 8].copy_from_slice(&self.port_name.to_be_bytes());
        raw[Self::NODE_NAME..Self::NODE_NAME + 8].copy_from_slice(&self.node_name.to_be_bytes());
        raw
    }

    /// Accepted entry for an N_Port
    pub const fn accept(port_id: u32, port_name: u64, node_name: u64) -> Self {
        Self {
            response: CT_ACCEPT,
            port_type_id: 0x0100_0000 | (port_id & 0x00FF_FFFF),
            port_name,
            node_name,
        }
    }

    /// 24-bit port id
    pub const fn port_id(&self) -> u32 {
        self.port_type_id & 0x00FF_FFFF
    }

    /// Whether the entry carries nothing
    pub const fn is_junk(&self) -> bool {
        self.port_type_id == 0 && self.port_name == 0 && self.node_name == 0
    }
}

/// Progress of a name server walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FabricWalk {
    /// First port id the walk returned
    pub first: Option<u32>,
    /// Port id to continue after
    pub last: u32,
    /// Queries issued
    pub queries: u32,
}

impl FabricWalk {
    /// Walk starting before port 0
    pub const fn new() -> Self {
        Self {
            first: None,
            last: 0,
            queries: 0,
        }
    }
}

/// Outcome of one walk step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricStep {
    /// A port to classify
    Port(FcPort),
    /// Nothing to classify this step
    Skip,
    /// The walk is over
    Finished,
}

// =============================================================================
// OPERATIONS
// =============================================================================

impl<P: QlePlatform> Qle<P> {
    /// Post the fabric IOCB `build` makes for the operation's handle and
    /// wait for its completion
    pub(crate) fn fabric_op(&self, build: impl FnOnce(u32) -> Entry) -> QleResult<Entry> {
        let handle = self.fabric_op.begin()?;
        let entry = build(handle);
        {
            let mut q = self.rings.req.lock();
            let next = self.rings.post(self.platform.dma(), &mut q, &entry);
            self.publish_requests(next);
        }

        for _ in 0..self.config.fabric_timeout_polls {
            match self.fabric_op.state() {
                FabricState::Done => return self.fabric_op.take().ok_or(QleError::DriverStuffup),
                FabricState::Idle => return Err(QleError::Aborted),
                FabricState::Pending => {}
            }
            self.platform.cpu().delay_us(self.config.poll_interval_us);
            if !self.bus_attached() {
                if let Some(isr) = self.read_isr() {
                    self.handle_intr(isr);
                }
            }
        }

        warn!("qle: fabric operation timed out");
        self.fabric_op.reset();
        Err(QleError::Timeout)
    }

    /// Send the CT request at the start of `scratch` to the name server;
    /// the response lands right behind it
    pub(crate) fn ct_pass_through(
        &self,
        scratch: &DmaRegion,
        req_len: usize,
        resp_len: usize,
    ) -> QleResult<()> {
        let base = scratch.paddr();
        let build = |handle| {
            CtPassthroughIocb {
                handle,
                nport_handle: SNS_HANDLE,
                timeout_secs: CT_TIMEOUT_SECS,
                cmd: IocbSeg::new(base.as_u64(), req_len as u32),
                resp: IocbSeg::new(base.add(req_len as u64).as_u64(), resp_len as u32),
            }
            .encode()
        };

        let dma = self.platform.dma();
        let len = req_len + resp_len;
        scratch.sync(dma, 0, len, DmaSync::PRE_READ | DmaSync::PRE_WRITE);
        let result = self.fabric_op(build);
        scratch.sync(dma, 0, len, DmaSync::POST_READ | DmaSync::POST_WRITE);

        let status = CtPassthroughIocb::status(&result?);
        if status != 0 {
            warn!("qle: CT pass-through failed: {:#x}", status);
            return Err(QleError::NameServer);
        }
        Ok(())
    }

    /// Ask the name server for the port after `walk.last`
    pub(crate) fn next_fabric_port(&self, walk: &mut FabricWalk) -> FabricStep {
        let scratch = self.scratch.lock();
        scratch.fill_zero(0, GA_NXT_REQ_LEN + GA_NXT_RESP_LEN);
        scratch.write(0, &ga_nxt_request(walk.last));
        walk.queries += 1;

        if let Err(e) = self.ct_pass_through(&scratch, GA_NXT_REQ_LEN, GA_NXT_RESP_LEN) {
            warn!("qle: GA_NXT {:06x} failed: {}", walk.last, e);
            return FabricStep::Finished;
        }
        let gar = GaNxtResponse::decode(&scratch.read_array(GA_NXT_REQ_LEN));
        drop(scratch);

        if gar.is_junk() {
            warn!("qle: GA_NXT returned junk");
            return FabricStep::Finished;
        }
        if gar.response != CT_ACCEPT {
            warn!("qle: GA_NXT rejected: {:#x}", gar.response);
            return FabricStep::Finished;
        }

        let port_id = gar.port_id();
        if walk.first == Some(port_id) {
            info!("qle: got {:06x} again", port_id);
            return FabricStep::Finished;
        }
        walk.first.get_or_insert(port_id);
        walk.last = port_id;

        info!(
            "qle: GA_NXT: port type/id: {:x}, wwpn {:x}, wwnn {:x}",
            gar.port_type_id, gar.port_name, gar.node_name
        );

        if port_id == self.link.lock().port_id {
            return FabricStep::Skip;
        }
        FabricStep::Port(FcPort::on_fabric(port_id, gar.port_name, gar.node_name))
    }

    /// Log in to `port_id` on `loopid`
    pub(crate) fn plogx(&self, loopid: u16, port_id: u32) -> QleResult<()> {
        let build = |handle| {
            PlogxIocb {
                handle,
                nport_handle: loopid,
                port_id,
                flags: 0,
            }
            .encode()
        };
        let status = PlogxIocb::status(&self.fabric_op(build)?);
        if status != 0 {
            return Err(QleError::LoginFailed(status));
        }
        Ok(())
    }

    /// Log in to a port found on the fabric, assigning it a loop id
    pub(crate) fn fabric_plogi(&self, port: &mut FcPort) -> QleResult<()> {
        let loopid = self.ports.lock().free_loop_id().map_err(|e| {
            warn!("qle: ran out of loop ids");
            e
        })?;

        let mut result = Err(QleError::LoginFailed(0));
        for attempt in 0..self.config.login_retry.max(1) {
            result = self.plogx(loopid, port.portid);
            match result {
                Ok(()) => break,
                Err(e) => debug!("qle: plogi {:06x} attempt {} failed: {}", port.portid, attempt, e),
            }
        }
        result?;

        port.loopid = loopid;
        port.flags.remove(PortFlags::NEEDS_LOGIN);
        Ok(())
    }

    /// Log out of a fabric port; failures are only logged
    pub(crate) fn fabric_plogo(&self, port: &FcPort) {
        let command = MboxCommand::new(cmd::FABRIC_PLOGO)
            .reg(1, port.loopid)
            .reg(10, 0)
            .inputs(0x0403)
            .outputs(0x0003);
        if let Err(e) = self.mbox(&command) {
            warn!("qle: PLOGO {:#x} failed: {}", port.loopid, e);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::MIN_HANDLE;
    use crate::testing::{fabric, FABRIC_PORT_ID};

    #[test]
    fn test_slot_lifecycle() {
        let op = FabricOp::new();
        assert!(!op.complete(&PlogxIocb::response(FABRIC_HANDLE_TAG, 0)));
        let handle = op.begin().unwrap();
        let entry = PlogxIocb::response(handle, 0);
        assert_eq!(op.begin(), Err(QleError::Busy));
        assert!(op.take().is_none());
        assert!(op.complete(&entry));
        assert_eq!(op.take(), Some(entry));
        assert_eq!(op.state(), FabricState::Idle);
    }

    #[test]
    fn test_slot_drops_earlier_operation() {
        let op = FabricOp::new();
        let first = op.begin().unwrap();
        op.reset();
        let second = op.begin().unwrap();
        assert_ne!(first, second);
        assert_ne!(second, NO_HANDLE);

        assert!(!op.complete(&CtPassthroughIocb::response(first, 0)));
        assert_eq!(op.state(), FabricState::Pending);
        assert!(op.complete(&PlogxIocb::response(second, 0)));
        assert_eq!(op.take(), Some(PlogxIocb::response(second, 0)));
    }

    #[test]
    fn test_ga_nxt_request_layout() {
        let req = ga_nxt_request(0x01_02_03);
        assert_eq!(req[0], 0x01);
        assert_eq!(req[4], 0xFC);
        assert_eq!(req[5], 0x02);
        assert_eq!(&req[8..10], &[0x01, 0x00]);
        assert_eq!(u16::from_be_bytes([req[10], req[11]]), 155);
        assert_eq!(ga_nxt_port(&req), 0x01_02_03);
    }

    #[test]
    fn test_ga_nxt_response_fields() {
        let gar = GaNxtResponse::accept(0x01_0200, 0x2100_0000_0000_00AA, 0x2000_0000_0000_00AA);
        let back = GaNxtResponse::decode(&gar.encode());
        assert_eq!(back, gar);
        assert_eq!(back.port_id(), 0x01_0200);
        assert!(!back.is_junk());
        assert!(GaNxtResponse::default().is_junk());
    }

    #[test]
    fn test_walk_stops_at_first_port() {
        let t = fabric(&[
            (0x01_0100, 0xA, true),
            (0x01_0200, 0xB, true),
            (0x01_0300, 0xC, false),
            (FABRIC_PORT_ID, 0xF, false),
        ]);
        let mut walk = FabricWalk::new();
        let mut seen = alloc::vec::Vec::new();
        loop {
            match t.qle.next_fabric_port(&mut walk) {
                FabricStep::Port(p) => seen.push(p.portid),
                FabricStep::Skip => {}
                FabricStep::Finished => break,
            }
        }
        // own port id is skipped
        assert_eq!(seen, [0x01_0100, 0x01_0200, 0x01_0300]);
        assert!(!seen.contains(&FABRIC_PORT_ID));
        assert_eq!(walk.first, Some(0x01_0100));
    }

    #[test]
    fn test_walk_ends_on_reject() {
        let t = fabric(&[(0x01_0100, 0xA, true)]);
        t.hba().reject_name_server(true);
        let mut walk = FabricWalk::new();
        assert_eq!(t.qle.next_fabric_port(&mut walk), FabricStep::Finished);
    }

    #[test]
    fn test_plogi_assigns_loop_id() {
        let t = fabric(&[(0x01_0100, 0xA, true)]);
        let mut port = FcPort::on_fabric(0x01_0100, 0xA, 0xA | 1 << 60);
        t.qle.fabric_plogi(&mut port).unwrap();
        assert_eq!(port.loopid, MIN_HANDLE);
        assert!(!port.flags.contains(PortFlags::NEEDS_LOGIN));
    }

    #[test]
    fn test_plogi_failure_status() {
        let t = fabric(&[(0x01_0100, 0xA, true)]);
        t.hba().fail_logins(true);
        let mut port = FcPort::on_fabric(0x01_0100, 0xA, 0xA | 1 << 60);
        assert_eq!(
            t.qle.fabric_plogi(&mut port),
            Err(QleError::LoginFailed(0x31))
        );
        assert_eq!(t.qle.fabric_op.state(), FabricState::Idle);
    }

    #[test]
    fn test_fabric_op_times_out() {
        let t = fabric(&[]);
        t.hba().silence_ring(true);
        let build = |handle| {
            PlogxIocb {
                handle,
                nport_handle: MIN_HANDLE,
                port_id: 0x01_0100,
                flags: 0,
            }
            .encode()
        };
        assert_eq!(t.qle.fabric_op(build), Err(QleError::Timeout));
        assert_eq!(t.qle.fabric_op.state(), FabricState::Idle);
    }

    #[test]
    fn test_late_completion_after_timeout_is_dropped() {
        let t = fabric(&[(0x01_0100, 0xA, true)]);
        t.hba().silence_ring(true);
        let mut walk = FabricWalk::new();
        assert_eq!(t.qle.next_fabric_port(&mut walk), FabricStep::Finished);
        assert_eq!(t.qle.fabric_op.state(), FabricState::Idle);

        // the name server query is still queued ahead of the login and
        // completes first
        t.hba().silence_ring(false);
        t.hba().fail_logins(true);
        assert_eq!(
            t.qle.plogx(MIN_HANDLE, 0x01_0100),
            Err(QleError::LoginFailed(0x31))
        );
        assert_eq!(t.hba().name_server_queries(), 1);
        assert_eq!(t.qle.fabric_op.state(), FabricState::Idle);
    }
}
