//! # Command Ring Engine
//!
//! Submission path and completion path of SCSI commands.
//!
//! ```text
//!  submit(xs)                                   intr() / poll
//!      │                                              │
//!      ▼                                              ▼
//!  CcbPool::acquire ──▶ SegmentTable::build    RESP_IN != last?
//!      │                                              │
//!      ▼                                              ▼
//!  [marker] + CMD_TYPE_6 ──▶ request ring      complete(slot) ──▶ done(xs)
//!      │                                              │
//!      ▼                                              ▼
//!  REQ_IN := next_req_id                       RESP_OUT := last_resp_id
//! ```
//!
//! The request producer is owned by whoever holds the request queue lock.
//! The response consumer is owned by whoever holds the response queue lock;
//! a polling submitter keeps it for the whole poll so that the interrupt
//! path (which only try-locks it) cannot steal its completion.

use crate::ccb::ReclaimedCcb;
use crate::discovery::UpdateTasks;
use crate::dma::DmaRegion;
use crate::error::QleResult;
use crate::hba::{Qle, QlePlatform};
use crate::iocb::{
    self, CommandIocb, CompletionCode, CtrlFlags, Entry, EntryType, FcpCmnd, ScsiStatusFlags,
    StatusEntry, FCP_CMND_SIZE, FCP_RDDATA, FCP_WRDATA, QUEUE_ENTRY_SIZE,
};
use crate::regs::{InterruptKind, Register, RegisterBank};
use crate::segments::DataSegments;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use helix_hal::cpu::CpuRelax;
use helix_hal::dma::{DmaDirection, DmaEngine, DmaMapping, DmaSync};
use helix_scsi::sense::asc;
use helix_scsi::{ScsiXfer, SenseData, SenseKey, XferError};
use log::{debug, warn};
use spin::Mutex;

// =============================================================================
// RING STATE
// =============================================================================

/// Producer side of the request ring
#[derive(Debug)]
pub struct RequestQueue {
    next: u16,
    entries: u16,
}

impl RequestQueue {
    /// Empty queue of `entries` slots
    pub const fn new(entries: u16) -> Self {
        Self { next: 0, entries }
    }

    /// Slot the next entry goes to
    pub const fn producer(&self) -> u16 {
        self.next
    }

    /// Take the current slot and advance
    pub fn claim(&mut self) -> u16 {
        let slot = self.next;
        self.next = (self.next + 1) % self.entries;
        slot
    }

    /// Back to slot 0
    pub fn reset(&mut self) {
        self.next = 0;
    }
}

/// Consumer side of the response ring
#[derive(Debug)]
pub struct ResponseQueue {
    last: u16,
    entries: u16,
}

impl ResponseQueue {
    /// Empty queue of `entries` slots
    pub const fn new(entries: u16) -> Self {
        Self { last: 0, entries }
    }

    /// Next slot to read
    pub const fn consumer(&self) -> u16 {
        self.last
    }

    /// Move past the current slot
    pub fn advance(&mut self) {
        self.last = (self.last + 1) % self.entries;
    }

    /// Back to slot 0
    pub fn reset(&mut self) {
        self.last = 0;
    }
}

/// Ring memory and cursors
pub struct Rings {
    pub(crate) requests: DmaRegion,
    pub(crate) responses: DmaRegion,
    pub(crate) req: Mutex<RequestQueue>,
    pub(crate) resp: Mutex<ResponseQueue>,
    pub(crate) marker_required: AtomicBool,
    entries: u16,
}

impl Rings {
    /// Allocate both rings
    pub fn alloc<D: DmaEngine + ?Sized>(dma: &D, entries: u16) -> QleResult<Self> {
        let size = usize::from(entries) * QUEUE_ENTRY_SIZE;
        let requests = DmaRegion::alloc(dma, size)?;
        let responses = match DmaRegion::alloc(dma, size) {
            Ok(r) => r,
            Err(e) => {
                requests.free(dma);
                return Err(e);
            }
        };
        Ok(Self {
            requests,
            responses,
            req: Mutex::new(RequestQueue::new(entries)),
            resp: Mutex::new(ResponseQueue::new(entries)),
            marker_required: AtomicBool::new(false),
            entries,
        })
    }

    /// Release both rings
    pub fn free<D: DmaEngine + ?Sized>(&self, dma: &D) {
        self.requests.free(dma);
        self.responses.free(dma);
    }

    /// Slots per ring
    pub const fn entries(&self) -> u16 {
        self.entries
    }

    /// Write `entry` at the producer slot and advance; returns the new
    /// producer index to publish
    pub fn post<D: DmaEngine + ?Sized>(&self, dma: &D, q: &mut RequestQueue, entry: &Entry) -> u16 {
        let slot = q.claim();
        let offset = usize::from(slot) * QUEUE_ENTRY_SIZE;
        iocb::trace_entry("req", slot, entry);
        self.requests.write(offset, entry);
        self.requests.sync(dma, offset, QUEUE_ENTRY_SIZE, DmaSync::PRE_WRITE);
        q.producer()
    }

    /// Read response slot `slot`
    pub fn response<D: DmaEngine + ?Sized>(&self, dma: &D, slot: u16) -> Entry {
        let offset = usize::from(slot) * QUEUE_ENTRY_SIZE;
        self.responses.sync(dma, offset, QUEUE_ENTRY_SIZE, DmaSync::POST_READ);
        let entry = self.responses.read_array(offset);
        iocb::trace_entry("resp", slot, &entry);
        entry
    }

    /// Ask for a marker ahead of the next command
    pub fn require_marker(&self) {
        self.marker_required.store(true, Ordering::Release);
    }
}

/// Snapshot of the ring cursors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingState {
    /// Request producer
    pub producer: u16,
    /// Response consumer
    pub consumer: u16,
    /// CCBs in flight
    pub outstanding: usize,
}

/// A finished command handed back by [`Qle::complete`]
#[derive(Debug)]
pub struct CompletedCcb {
    /// CCB id the firmware named
    pub id: u16,
    /// The transfer with its result filled in
    pub xs: Box<ScsiXfer>,
}

// =============================================================================
// SUBMISSION
// =============================================================================

impl<P: QlePlatform> Qle<P> {
    /// Queue a SCSI command.
    ///
    /// Returns the transfer when no CCB is free; the request ring is left
    /// untouched in that case. Every other outcome reaches the midlayer
    /// through `done`.
    pub fn submit(&self, mut xs: Box<ScsiXfer>) -> Result<(), Box<ScsiXfer>> {
        if xs.cdb.len() > self.config.max_cdb_len {
            warn!("qle: CDB too fat ({} bytes)", xs.cdb.len());
            xs.sense = SenseData::current(SenseKey::IllegalRequest, asc::INVALID_OPCODE);
            xs.error = XferError::Sense;
            self.complete_xfer(xs);
            return Ok(());
        }

        let port_id = self.ports.lock().target(xs.target).map(|p| p.portid);
        let Some(port_id) = port_id else {
            debug!("qle: no port for target {}", xs.target);
            xs.error = XferError::DriverStuffup;
            self.complete_xfer(xs);
            return Ok(());
        };

        let Ok(datalen) = u32::try_from(xs.datalen()) else {
            warn!("qle: {} byte transfer too large", xs.datalen());
            xs.error = XferError::DriverStuffup;
            self.complete_xfer(xs);
            return Ok(());
        };

        let Some(ccb) = self.ccbs.acquire() else {
            xs.error = XferError::Busy;
            return Err(xs);
        };
        let id = ccb.id();
        let tag = self.ccbs.tag(&ccb);

        let mapping = match self.map_data(&xs) {
            Ok(m) => m,
            Err(e) => {
                warn!("qle: unable to map data for target {}: {}", xs.target, e);
                self.ccbs.release(ccb);
                xs.error = e.to_xfer_error();
                self.complete_xfer(xs);
                return Ok(());
            }
        };
        let segs = match &mapping {
            Some(m) => self.segments.build(self.platform.dma(), id, &m.segments),
            None => Ok(DataSegments::None),
        };
        let segs = match segs {
            Ok(s) => s,
            Err(e) => {
                warn!("qle: unable to build segment list: {}", e);
                if let Some(m) = mapping {
                    self.platform.dma().unload(m);
                }
                self.ccbs.release(ccb);
                xs.error = e.to_xfer_error();
                self.complete_xfer(xs);
                return Ok(());
            }
        };

        let entry = self.build_command(&xs, id, tag, datalen, port_id, &segs);
        let poll = xs.is_poll().then(|| self.poll_budget(xs.timeout_ms));
        let generation = self.ccbs.generation(id);
        self.ccbs.arm(ccb, xs, mapping);

        {
            let mut q = self.rings.req.lock();
            let dma = self.platform.dma();
            if self.rings.marker_required.swap(false, Ordering::AcqRel) {
                let next = self.rings.post(dma, &mut q, &iocb::encode_marker());
                self.publish_requests(next);
            }
            let next = self.rings.post(dma, &mut q, &entry);
            self.publish_requests(next);
        }

        if let Some(polls) = poll {
            self.poll_for(id, tag, generation, polls);
        }
        Ok(())
    }

    fn map_data(&self, xs: &ScsiXfer) -> QleResult<Option<DmaMapping>> {
        let Some(data) = xs.data.filter(|d| d.len > 0) else {
            return Ok(None);
        };
        let dma = self.platform.dma();
        let mapping = dma.load(data.addr, data.len, xs.direction(), self.config.max_segs)?;
        dma.sync_mapping(&mapping, xs.direction().pre_sync());
        Ok(Some(mapping))
    }

    fn build_command(
        &self,
        xs: &ScsiXfer,
        id: u16,
        tag: u32,
        datalen: u32,
        port_id: u32,
        segs: &DataSegments,
    ) -> Entry {
        let (mut ctrl_flags, rw) = match (segs, xs.direction()) {
            (DataSegments::None, _) => (CtrlFlags::empty(), 0),
            (_, DmaDirection::FromDevice) => (CtrlFlags::READ, FCP_RDDATA),
            (_, DmaDirection::ToDevice) => (CtrlFlags::WRITE, FCP_WRDATA),
        };
        if segs.is_extended() {
            ctrl_flags |= CtrlFlags::EXT_SEG;
        }

        let fcp = FcpCmnd {
            lun: xs.lun,
            cdb: &xs.cdb[..],
            data_len: datalen,
            rw,
        };
        let (block, fcp_len) = fcp.encode();
        let offset = usize::from(id) * FCP_CMND_SIZE;
        self.fcp_cmnds.write(offset, &block);
        self.fcp_cmnds
            .sync(self.platform.dma(), offset, FCP_CMND_SIZE, DmaSync::PRE_WRITE);

        let timeout_secs = if xs.timeout_ms == 0 {
            0
        } else {
            (xs.timeout_ms / 1000).clamp(1, u32::from(u16::MAX)) as u16
        };

        CommandIocb {
            handle: tag,
            nport_handle: xs.target,
            timeout_secs,
            data_seg_count: segs.count(),
            lun: xs.lun,
            ctrl_flags,
            fcp_cmnd_len: fcp_len,
            fcp_cmnd_addr: self.fcp_cmnds.paddr_at(offset).as_u64(),
            data_len: fcp.data_len,
            target_port_id: port_id,
            data_seg: segs.descriptor(),
        }
        .encode()
    }

    pub(crate) fn publish_requests(&self, producer: u16) {
        self.platform.cpu().memory_barrier();
        self.platform
            .registers()
            .write(Register::ReqIn, u32::from(producer));
    }

    /// Cursor positions and CCBs in flight
    pub fn ring_state(&self) -> RingState {
        RingState {
            producer: self.rings.req.lock().producer(),
            consumer: self.rings.resp.lock().consumer(),
            outstanding: self.ccbs.in_use(),
        }
    }

    /// Hand a finished transfer to the midlayer
    pub(crate) fn complete_xfer(&self, xs: Box<ScsiXfer>) {
        match self.bus.get() {
            Some(bus) => bus.done(xs),
            None => warn!("qle: completion for target {} with no bus attached", xs.target),
        }
    }
}

// =============================================================================
// COMPLETION
// =============================================================================

impl<P: QlePlatform> Qle<P> {
    /// Process response slot `slot`.
    ///
    /// Returns the finished transfer for a status entry; fabric completions
    /// go to the pending fabric operation instead.
    pub fn complete(&self, slot: u16) -> Option<CompletedCcb> {
        let entry = self.rings.response(self.platform.dma(), slot);

        match EntryType::of(&entry) {
            EntryType::Status => self.complete_status(&StatusEntry::decode(&entry)),
            EntryType::StatusContinuation => {
                debug!("qle: ignoring status continuation");
                None
            }
            EntryType::Plogx | EntryType::CtPassthrough => {
                self.fabric_op.complete(&entry);
                None
            }
            EntryType::Marker => None,
            EntryType::CmdType6 | EntryType::CmdType7 => {
                let handle = iocb::entry_handle(&entry);
                warn!("qle: request {:#x} bounced back", handle);
                let ccb = self.ccbs.reclaim(handle)?;
                Some(self.finish_ccb(ccb, |xs| xs.error = XferError::DriverStuffup))
            }
            EntryType::Unknown(ty) => {
                warn!("qle: unexpected response entry type {:#x}", ty);
                None
            }
        }
    }

    fn complete_status(&self, status: &StatusEntry) -> Option<CompletedCcb> {
        let Some(ccb) = self.ccbs.reclaim(status.handle) else {
            warn!("qle: status for inactive ccb {:#x}", status.handle);
            return None;
        };

        let mut gone = None;
        let done = self.finish_ccb(ccb, |xs| {
            xs.status = status.status_byte();
            match status.completion {
                CompletionCode::Complete
                | CompletionCode::DataOverrun
                | CompletionCode::DataUnderrun => {
                    xs.resid = if status.completion == CompletionCode::Complete {
                        0
                    } else {
                        status.resid
                    };
                    if status.flags().contains(ScsiStatusFlags::SENSE_VALID) {
                        xs.sense = SenseData::from_slice(&status.sense());
                        xs.error = XferError::Sense;
                    } else {
                        xs.error = XferError::NoError;
                    }
                }
                CompletionCode::DmaError => {
                    warn!("qle: dma error");
                    xs.error = XferError::DriverStuffup;
                }
                CompletionCode::Reset => {
                    warn!("qle: reset destroyed command");
                    self.rings.require_marker();
                    xs.error = XferError::Reset;
                }
                CompletionCode::Aborted => {
                    warn!("qle: aborted");
                    self.rings.require_marker();
                    xs.error = XferError::DriverStuffup;
                }
                CompletionCode::Timeout => {
                    warn!("qle: command timed out");
                    xs.error = XferError::Timeout;
                }
                CompletionCode::QueueFull => {
                    debug!("qle: queue full");
                    xs.error = XferError::Busy;
                }
                CompletionCode::PortUnavailable
                | CompletionCode::PortLoggedOut
                | CompletionCode::PortChanged => {
                    warn!("qle: target {} gone", xs.target);
                    xs.error = XferError::SelectionTimeout;
                    gone = Some(xs.target);
                }
                CompletionCode::Other(code) => {
                    warn!("qle: unexpected completion status {:#x}", code);
                    xs.error = XferError::DriverStuffup;
                }
            }
        });

        if let Some(target) = gone {
            if self.ports.lock().retire_target(target) {
                self.update_start(UpdateTasks::DETACH_TARGET);
            }
        }
        Some(done)
    }

    fn finish_ccb(&self, ccb: ReclaimedCcb, result: impl FnOnce(&mut ScsiXfer)) -> CompletedCcb {
        let ReclaimedCcb {
            handle,
            mut xs,
            mapping,
        } = ccb;
        if let Some(m) = mapping {
            let dma = self.platform.dma();
            dma.sync_mapping(&m, xs.direction().post_sync());
            dma.unload(m);
        }
        result(&mut xs);
        let id = handle.id();
        self.ccbs.release(handle);
        CompletedCcb { id, xs }
    }

    fn resp_in(&self) -> Option<u16> {
        let rspin = self.platform.registers().read(Register::RespIn);
        if rspin >= u32::from(self.rings.entries()) {
            warn!("qle: response producer {} out of range", rspin);
            return None;
        }
        Some(rspin as u16)
    }

    /// Process entries up to the hardware producer and publish the consumer
    /// once; returns the transfers in ring order
    fn drain_locked(&self, resp: &mut ResponseQueue) -> Vec<CompletedCcb> {
        let mut done = Vec::new();
        let Some(rspin) = self.resp_in() else {
            return done;
        };
        if rspin == resp.consumer() {
            return done;
        }
        while resp.consumer() != rspin {
            if let Some(c) = self.complete(resp.consumer()) {
                done.push(c);
            }
            resp.advance();
        }
        self.platform
            .registers()
            .write(Register::RespOut, u32::from(resp.consumer()));
        done
    }

    /// Interrupt-side drain of the response ring.
    ///
    /// Returns false without touching the ring when a poller owns it.
    pub(crate) fn drain_responses(&self) -> bool {
        let Some(mut resp) = self.rings.resp.try_lock() else {
            debug!("qle: response ring owned by a poller");
            return false;
        };
        let done = self.drain_locked(&mut resp);
        drop(resp);

        if done.is_empty() {
            debug!("qle: response interrupt with nothing new");
        }
        for c in done {
            self.complete_xfer(c.xs);
        }
        true
    }

    /// Polls a polled command may spend waiting for its status
    fn poll_budget(&self, timeout_ms: u32) -> u32 {
        if timeout_ms == 0 {
            return self.config.poll_timeout_polls;
        }
        let interval = u64::from(self.config.poll_interval_us.max(1));
        let polls = u64::from(timeout_ms) * 1000 / interval;
        u32::try_from(polls).unwrap_or(u32::MAX).max(1)
    }

    /// Spin on the hardware until CCB `id` completes, delivering everything
    /// seen meanwhile in ring order afterwards.
    ///
    /// After `polls` rounds the command fails with a timeout and a softreset
    /// is scheduled so the firmware drops it too.
    fn poll_for(&self, id: u16, tag: u32, generation: u32, polls: u32) {
        let mut deferred = Vec::new();
        let mut resp = self.rings.resp.lock();
        let mut finished = false;

        for _ in 0..polls {
            if self.ccbs.generation(id) != generation {
                // finished without going through the ring (reset)
                finished = true;
                break;
            }
            self.platform.cpu().delay_us(self.config.poll_interval_us);
            match self.read_isr() {
                Some(isr) if isr.kind == InterruptKind::Io => self.clear_isr(),
                Some(isr) => self.handle_intr(isr),
                None => {}
            }

            let batch = self.drain_locked(&mut resp);
            let ours = batch.iter().any(|c| c.id == id);
            deferred.extend(batch);
            if ours {
                finished = true;
                break;
            }
        }
        drop(resp);

        if !finished {
            warn!("qle: polled command {:#x} timed out", tag);
            if let Some(ccb) = self.ccbs.reclaim(tag) {
                deferred.push(self.finish_ccb(ccb, |xs| xs.error = XferError::Timeout));
            }
            self.update_start(UpdateTasks::SOFTRESET);
        }

        for c in deferred {
            self.complete_xfer(c.xs);
        }
    }

    /// Fail every command in flight after a reset
    pub(crate) fn fail_active(&self, error: XferError) {
        let lost = self.ccbs.reclaim_all();
        if !lost.is_empty() {
            warn!("qle: {} commands lost to reset", lost.len());
        }
        for ccb in lost {
            let done = self.finish_ccb(ccb, |xs| xs.error = error);
            self.complete_xfer(done.xs);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{attached, lun_cdb, read_xfer, StatusSpec};
    use helix_hal::VirtAddr;
    use helix_scsi::cdb::CdbBuilder;
    use helix_scsi::{DataBuffer, XferFlags};

    #[test]
    fn test_queue_wraps() {
        let mut q = RequestQueue::new(3);
        assert_eq!(q.claim(), 0);
        assert_eq!(q.claim(), 1);
        assert_eq!(q.claim(), 2);
        assert_eq!(q.producer(), 0);

        let mut r = ResponseQueue::new(2);
        r.advance();
        r.advance();
        assert_eq!(r.consumer(), 0);
    }

    #[test]
    fn test_submit_busy_leaves_ring_alone() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        t.hba().set_auto_complete(false);

        let mut held = Vec::new();
        while let Some(h) = t.qle.ccbs.acquire() {
            held.push(h);
        }
        let before = t.qle.ring_state();
        let xs = Box::new(ScsiXfer::new(1, 0, &lun_cdb()).unwrap());
        let back = t.qle.submit(xs).unwrap_err();
        assert_eq!(back.error, XferError::Busy);
        assert_eq!(t.qle.ring_state(), before);
        for h in held {
            t.qle.ccbs.release(h);
        }
    }

    #[test]
    fn test_underrun_sets_resid() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        t.hba().push_status(StatusSpec::underrun(37));

        let (xs, _buf) = read_xfer(1, 512);
        t.qle.submit(Box::new(xs.with_flags(XferFlags::POLL))).unwrap();

        let done = t.bus.take_done();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].error, XferError::NoError);
        assert_eq!(done[0].resid, 37);
        assert_eq!(t.qle.ccbs.in_use(), 0);
    }

    #[test]
    fn test_sense_completion() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        t.hba().push_status(StatusSpec::check_condition(0x06, 0x29));

        let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_flags(XferFlags::POLL);
        t.qle.submit(Box::new(xs)).unwrap();

        let done = t.bus.take_done();
        assert_eq!(done[0].error, XferError::Sense);
        assert_eq!(done[0].status, 0x02);
        assert_eq!(done[0].sense.sense_key(), SenseKey::UnitAttention);
        assert_eq!(done[0].sense.asc(), 0x29);
    }

    #[test]
    fn test_reset_completion_requires_marker() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        // the marker owed since loop up goes out with the first command
        let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_flags(XferFlags::POLL);
        t.qle.submit(Box::new(xs)).unwrap();
        t.bus.take_done();
        let markers = t.hba().markers();
        t.hba().push_status(StatusSpec::code(CompletionCode::Reset));

        let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_flags(XferFlags::POLL);
        t.qle.submit(Box::new(xs)).unwrap();
        assert_eq!(t.bus.take_done()[0].error, XferError::Reset);

        let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_flags(XferFlags::POLL);
        t.qle.submit(Box::new(xs)).unwrap();
        assert_eq!(t.bus.take_done()[0].error, XferError::NoError);
        assert_eq!(t.hba().markers(), markers + 1);
    }

    #[test]
    fn test_error_mapping() {
        let cases = [
            (CompletionCode::DmaError, XferError::DriverStuffup),
            (CompletionCode::Aborted, XferError::DriverStuffup),
            (CompletionCode::Timeout, XferError::Timeout),
            (CompletionCode::QueueFull, XferError::Busy),
            (CompletionCode::Other(0x31), XferError::DriverStuffup),
        ];
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        for (code, expected) in cases {
            t.hba().push_status(StatusSpec::code(code));
            let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_flags(XferFlags::POLL);
            t.qle.submit(Box::new(xs)).unwrap();
            assert_eq!(t.bus.take_done()[0].error, expected, "{:?}", code);
        }
    }

    #[test]
    fn test_port_gone_schedules_detach() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        t.hba().push_status(StatusSpec::code(CompletionCode::PortLoggedOut));

        let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_flags(XferFlags::POLL);
        t.qle.submit(Box::new(xs)).unwrap();
        assert_eq!(t.bus.take_done()[0].error, XferError::SelectionTimeout);
        assert!(t.qle.pending_tasks().contains(UpdateTasks::DETACH_TARGET));

        t.qle.do_update();
        assert_eq!(t.bus.detached(), [1]);
        assert!(!t.qle.probe(1));
    }

    #[test]
    fn test_fat_cdb_rejected_with_sense() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        let mut builder = CdbBuilder::new();
        let xs = ScsiXfer::new(1, 0, builder.variable_length(0x0009)).unwrap();
        t.qle.submit(Box::new(xs)).unwrap();

        let done = t.bus.take_done();
        assert_eq!(done[0].error, XferError::Sense);
        assert_eq!(done[0].sense.sense_key(), SenseKey::IllegalRequest);
        assert_eq!(done[0].sense.asc(), 0x20);
        assert_eq!(t.hba().commands().len(), 0);
    }

    #[test]
    fn test_unknown_target_is_stuffup() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        let xs = ScsiXfer::new(9, 0, &lun_cdb()).unwrap();
        t.qle.submit(Box::new(xs)).unwrap();
        assert_eq!(t.bus.take_done()[0].error, XferError::DriverStuffup);
        assert_eq!(t.qle.ccbs.in_use(), 0);
    }

    #[test]
    fn test_oversized_transfer_rejected() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        let huge = DataBuffer::new(VirtAddr::new(0x1000), u32::MAX as usize + 1);
        let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_data_in(huge);
        t.qle.submit(Box::new(xs)).unwrap();
        assert_eq!(t.bus.take_done()[0].error, XferError::DriverStuffup);
        assert_eq!(t.qle.ccbs.in_use(), 0);
        assert!(t.hba().commands().is_empty());
    }

    #[test]
    fn test_poll_gives_up_and_ignores_late_status() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        t.hba().set_auto_complete(false);

        let xs = ScsiXfer::new(1, 0, &lun_cdb())
            .unwrap()
            .with_timeout(1)
            .with_flags(XferFlags::POLL);
        t.qle.submit(Box::new(xs)).unwrap();
        let done = t.bus.take_done();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].error, XferError::Timeout);
        assert_eq!(t.qle.ccbs.in_use(), 0);
        assert!(t.qle.pending_tasks().contains(UpdateTasks::SOFTRESET));
        let stale = t.hba().commands()[0].iocb.handle;

        // the next command lands on the same CCB
        let next = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_tag(9);
        t.qle.submit(Box::new(next)).unwrap();
        let fresh = t.hba().commands()[1].iocb.handle;
        assert_eq!(fresh & 0xFFFF, stale & 0xFFFF);
        assert_ne!(fresh, stale);

        t.hba().post_status(StatusSpec::code(CompletionCode::PortLoggedOut).handle(stale));
        t.qle.intr();
        assert!(t.bus.take_done().is_empty());
        assert!(t.qle.probe(1));

        t.hba().complete_next();
        t.qle.intr();
        let done = t.bus.take_done();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].tag, 9);
        assert_eq!(done[0].error, XferError::NoError);
    }

    #[test]
    fn test_map_failure_releases_ccb() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        // more pages than segments allowed
        let pages = t.qle.config.max_segs + 1;
        let (xs, _buf) = read_xfer(1, pages * 4096);
        t.qle.submit(Box::new(xs)).unwrap();
        assert_eq!(t.bus.take_done()[0].error, XferError::DriverStuffup);
        assert_eq!(t.qle.ccbs.in_use(), 0);
        assert_eq!(t.hba().commands().len(), 0);
    }

    #[test]
    fn test_multi_segment_command_uses_list() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        let (xs, _buf) = read_xfer(1, 3 * 4096);
        let xs = xs.with_flags(XferFlags::POLL).with_timeout(30_000);
        t.qle.submit(Box::new(xs)).unwrap();
        assert_eq!(t.bus.take_done()[0].error, XferError::NoError);

        let cmd = t.hba().commands().pop().unwrap();
        assert!(cmd.iocb.ctrl_flags.contains(CtrlFlags::EXT_SEG | CtrlFlags::READ));
        assert_eq!(cmd.iocb.data_seg_count, 3);
        assert_eq!(cmd.segments.len(), 3);
        assert_eq!(cmd.iocb.data_len, 3 * 4096);
        assert_eq!(cmd.iocb.target_port_id, 0x0000_00e8);
        assert_eq!(cmd.iocb.timeout_secs, 30);
    }

    #[test]
    fn test_poll_defers_other_completions() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        t.hba().set_auto_complete(false);

        let first = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_tag(1);
        t.qle.submit(Box::new(first)).unwrap();
        let first_handle = t.hba().commands()[0].iocb.handle;

        t.hba().set_auto_complete(true);
        // the first command completes ahead of the polled one
        t.hba().post_status(StatusSpec::ok().handle(first_handle));
        let second = ScsiXfer::new(1, 0, &lun_cdb())
            .unwrap()
            .with_tag(2)
            .with_flags(XferFlags::POLL);
        t.qle.submit(Box::new(second)).unwrap();

        let tags: Vec<u64> = t.bus.take_done().iter().map(|xs| xs.tag).collect();
        assert_eq!(tags, [1, 2]);
    }

    #[test]
    fn test_ring_accounting() {
        let t = attached(&[(1, 0x2100_0000_0000_0001, true)]);
        // flush the marker owed since loop up
        let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap().with_flags(XferFlags::POLL);
        t.qle.submit(Box::new(xs)).unwrap();
        t.bus.take_done();
        t.hba().set_auto_complete(false);

        let base = t.qle.ring_state();
        let entries = t.qle.rings.entries() as usize;
        let span = |s: RingState| (s.producer as usize + entries - s.consumer as usize) % entries;
        let skew = span(base);

        for i in 0..5 {
            let xs = ScsiXfer::new(1, 0, &lun_cdb()).unwrap();
            t.qle.submit(Box::new(xs)).unwrap();
            let s = t.qle.ring_state();
            assert_eq!(s.outstanding, i + 1);
            assert_eq!(span(s) - skew, s.outstanding);
        }
        for _ in 0..5 {
            t.hba().complete_next();
            t.qle.intr();
            let s = t.qle.ring_state();
            assert_eq!(span(s) - skew, s.outstanding);
        }
        assert_eq!(t.qle.ring_state().outstanding, 0);
        assert_eq!(t.bus.take_done().len(), 5);
    }
}
