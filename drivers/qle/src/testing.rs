//! # Simulated Adapter
//!
//! Test doubles for everything below the driver: identity-mapped DMA
//! memory, a register bank backed by a scripted firmware, and a midlayer
//! that records what it is told.
//!
//! The firmware answers a mailbox command as soon as the doorbell is rung
//! and consumes request entries as soon as the producer index is written,
//! queueing the matching interrupt cause. Interrupt delivery is emulated by
//! the delay source: once a harness is attached to its bus, every delay the
//! driver takes runs the interrupt handler.

use crate::config::QleConfig;
use crate::fabric::{ga_nxt_port, GaNxtResponse, CT_REJECT, GA_NXT_REQ_LEN};
use crate::firmware::InitControlBlock;
use crate::hba::{Qle, QlePlatform};
use crate::iocb::{
    entry_type, CommandIocb, CompletionCode, CtPassthroughIocb, CtrlFlags, Entry, IocbSeg,
    PlogxIocb, ScsiStatusFlags, StatusEntry, QUEUE_ENTRY_SIZE, SEG_SIZE,
};
use crate::mailbox::{cmd, MBOX_COMPLETE};
use crate::port::PortDatabase;
use crate::regs::{
    cause, CtrlStatus, HostCommand, InterruptStatus, Register, RegisterBank, INT_STATUS_RISC,
    MBOX_COUNT, SIGNATURE,
};
use crate::topology::{Topology, F_PORT_HANDLE};
use alloc::boxed::Box;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use hashbrown::HashMap;
use helix_hal::cpu::CpuRelax;
use helix_hal::dma::{DmaAllocation, DmaDirection, DmaEngine, DmaMapping, DmaSegment};
use helix_hal::{HalError, HalResult, PhysAddr, VirtAddr};
use helix_scsi::cdb::CdbBuilder;
use helix_scsi::{DataBuffer, ScsiMidlayer, ScsiXfer};
use spin::{Mutex, Once};
use std::alloc::Layout;
use std::time::Duration;

/// Our own fabric port id
pub const FABRIC_PORT_ID: u32 = 0x01_0400;

/// Port name the fabric port reports
const SNS_PORT_NAME: u64 = 0x2000_00AA_BB00_0001;

/// Mailbox status for a command the firmware rejects
const MBOX_COMMAND_ERROR: u16 = 0x4005;

/// PLOGX status for a refused login
const PLOGX_REFUSED: u16 = 0x31;

/// Longest real sleep per delay
const MAX_SLEEP_US: u32 = 50;

/// Segment size of mapped data buffers
const PAGE: usize = 4096;

fn dma_read(addr: u64, buf: &mut [u8]) {
    // SAFETY: the driver only hands out addresses of live MockDma
    // allocations or of test-owned buffers, mapped one to one.
    unsafe { core::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len()) };
}

fn dma_write(addr: u64, data: &[u8]) {
    // SAFETY: as in `dma_read`.
    unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) };
}

// =============================================================================
// DMA
// =============================================================================

/// Heap-backed DMA with bus address == virtual address
#[derive(Debug)]
pub struct MockDma {
    live: Mutex<HashMap<u64, Layout>>,
    budget: Mutex<Option<usize>>,
}

impl MockDma {
    /// Unlimited allocator
    pub fn new() -> Self {
        Self {
            live: Mutex::new(HashMap::new()),
            budget: Mutex::new(None),
        }
    }

    /// Let `n` more allocations succeed, then fail
    pub fn fail_after(&self, n: usize) {
        *self.budget.lock() = Some(n);
    }

    /// Allocations not yet freed
    pub fn live(&self) -> usize {
        self.live.lock().len()
    }
}

impl DmaEngine for MockDma {
    fn alloc_coherent(&self, size: usize, align: usize) -> HalResult<DmaAllocation> {
        if let Some(budget) = self.budget.lock().as_mut() {
            if *budget == 0 {
                return Err(HalError::OutOfMemory);
            }
            *budget -= 1;
        }
        let layout =
            Layout::from_size_align(size.max(1), align.max(1)).map_err(|_| HalError::InvalidParameter)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(HalError::OutOfMemory);
        }
        let addr = ptr as u64;
        self.live.lock().insert(addr, layout);
        Ok(DmaAllocation {
            vaddr: VirtAddr::new(addr),
            paddr: PhysAddr::new(addr),
            size,
        })
    }

    fn free_coherent(&self, allocation: &DmaAllocation) {
        let addr = allocation.vaddr.as_u64();
        let layout = self.live.lock().remove(&addr);
        match layout {
            // SAFETY: allocated by `alloc_coherent` with this layout.
            Some(layout) => unsafe { std::alloc::dealloc(addr as *mut u8, layout) },
            None => panic!("free of unknown allocation {:#x}", addr),
        }
    }

    fn load(
        &self,
        buf: VirtAddr,
        len: usize,
        direction: DmaDirection,
        max_segments: usize,
    ) -> HalResult<DmaMapping> {
        let segments: Vec<DmaSegment> = (0..len)
            .step_by(PAGE)
            .map(|off| {
                let n = (len - off).min(PAGE);
                DmaSegment::new(PhysAddr::new(buf.as_u64() + off as u64), n as u32)
            })
            .collect();
        if segments.len() > max_segments {
            return Err(HalError::TooManySegments);
        }
        Ok(DmaMapping {
            segments,
            direction,
            mapped_len: len,
        })
    }

    fn unload(&self, _mapping: DmaMapping) {}
}

impl Drop for MockDma {
    fn drop(&mut self) {
        for (addr, layout) in self.live.get_mut().drain() {
            // SAFETY: allocated by `alloc_coherent` with this layout.
            unsafe { std::alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

// =============================================================================
// CPU
// =============================================================================

/// Delay source that doubles as the interrupt line
#[derive(Default)]
pub struct MockCpu {
    isr: Once<Weak<Qle<MockPlatform>>>,
}

impl MockCpu {
    /// Run the interrupt handler of `qle` on every delay from now on
    pub fn arm(&self, qle: &Arc<Qle<MockPlatform>>) {
        self.isr.call_once(|| Arc::downgrade(qle));
    }
}

impl CpuRelax for MockCpu {
    fn delay_us(&self, us: u32) {
        std::thread::sleep(Duration::from_micros(u64::from(us.min(MAX_SLEEP_US))));
        if let Some(qle) = self.isr.get().and_then(Weak::upgrade) {
            qle.intr();
        }
    }
}

// =============================================================================
// FIRMWARE
// =============================================================================

/// A status the firmware will return for a command
#[derive(Debug, Clone, Copy)]
pub struct StatusSpec {
    entry: StatusEntry,
    handle: Option<u32>,
}

impl StatusSpec {
    /// Good status
    pub fn ok() -> Self {
        Self {
            entry: StatusEntry::complete(0),
            handle: None,
        }
    }

    /// A firmware completion code and nothing else
    pub fn code(code: CompletionCode) -> Self {
        let mut spec = Self::ok();
        spec.entry.completion = code;
        spec
    }

    /// Short transfer of `resid` bytes
    pub fn underrun(resid: u32) -> Self {
        let mut spec = Self::code(CompletionCode::DataUnderrun);
        spec.entry.resid = resid;
        spec
    }

    /// CHECK CONDITION with fixed-format sense
    pub fn check_condition(key: u8, asc: u8) -> Self {
        let mut sense = [0u8; 20];
        sense[0] = 0x70;
        sense[2] = key;
        sense[7] = 10;
        sense[12] = asc;

        let mut spec = Self::ok();
        spec.entry.scsi_status = ScsiStatusFlags::SENSE_VALID.bits() | 0x02;
        spec.entry.sense_len = 18;
        for (dst, src) in spec.entry.data.chunks_exact_mut(4).zip(sense.chunks_exact(4)) {
            dst.copy_from_slice(&[src[3], src[2], src[1], src[0]]);
        }
        spec
    }

    /// Complete a specific command
    pub fn handle(mut self, handle: u32) -> Self {
        self.handle = Some(handle);
        self
    }

    fn entry(&self, handle: u32) -> Entry {
        let mut entry = self.entry;
        entry.handle = handle;
        entry.encode()
    }
}

/// A command the firmware received
#[derive(Debug, Clone)]
pub struct CommandRecord {
    /// The command entry
    pub iocb: CommandIocb,
    /// Data segments it described
    pub segments: Vec<IocbSeg>,
}

#[derive(Debug, Clone, Copy)]
struct RemotePort {
    port_name: u64,
    is_target: bool,
}

impl RemotePort {
    fn pdb(&self, port_id: u32) -> PortDatabase {
        PortDatabase {
            port_id,
            prli_svc_word3: if self.is_target { PortDatabase::TARGET_ROLE } else { 0 },
            port_name: self.port_name,
            node_name: self.port_name | 1 << 60,
        }
    }
}

struct HbaState {
    mbox: [u16; MBOX_COUNT],
    mbox_writes: usize,
    interrupts: VecDeque<u32>,
    host_commands: Vec<HostCommand>,
    chip_resets: usize,
    stuck_dma: bool,

    silent_mailbox: bool,
    failing: HashMap<u16, u16>,
    link_up: bool,
    topology: Topology,
    loop_ports: BTreeMap<u16, RemotePort>,
    fabric_ports: BTreeMap<u32, RemotePort>,
    logins: HashMap<u16, u32>,
    risc_ram: HashMap<u32, u32>,
    risc_loads: Vec<(u32, u32)>,
    icb: Option<InitControlBlock>,

    req_out: u16,
    resp_in: u16,
    resp_out: u16,
    silent_ring: bool,
    auto_complete: bool,
    statuses: VecDeque<StatusSpec>,
    pending: VecDeque<u32>,
    commands: Vec<CommandRecord>,
    markers: usize,
    plogx_count: usize,
    plogo_count: usize,
    ns_queries: usize,
    fail_logins: bool,
    reject_ns: bool,
}

impl HbaState {
    fn new() -> Self {
        let mut mbox = [0u16; MBOX_COUNT];
        mbox[1] = SIGNATURE[0];
        mbox[2] = SIGNATURE[1];
        Self {
            mbox,
            mbox_writes: 0,
            interrupts: VecDeque::new(),
            host_commands: Vec::new(),
            chip_resets: 0,
            stuck_dma: false,
            silent_mailbox: false,
            failing: HashMap::new(),
            link_up: true,
            topology: Topology::NlPort,
            loop_ports: BTreeMap::new(),
            fabric_ports: BTreeMap::new(),
            logins: HashMap::new(),
            risc_ram: HashMap::new(),
            risc_loads: Vec::new(),
            icb: None,
            req_out: 0,
            resp_in: 0,
            resp_out: 0,
            silent_ring: false,
            auto_complete: true,
            statuses: VecDeque::new(),
            pending: VecDeque::new(),
            commands: Vec::new(),
            markers: 0,
            plogx_count: 0,
            plogo_count: 0,
            ns_queries: 0,
            fail_logins: false,
            reject_ns: false,
        }
    }

    fn raise(&mut self, code: u8, info: u16) {
        let status = InterruptStatus::encode(code, info);
        if code == cause::RSPQ && self.interrupts.contains(&status) {
            return;
        }
        self.interrupts.push_back(status);
    }

    fn chip_reset(&mut self) {
        self.chip_resets += 1;
        self.mbox = [0; MBOX_COUNT];
        self.interrupts.clear();
        self.pending.clear();
        self.req_out = 0;
        self.resp_in = 0;
        self.resp_out = 0;
    }

    fn dma_addr(&self) -> u64 {
        u64::from(self.mbox[3])
            | (u64::from(self.mbox[2]) << 16)
            | (u64::from(self.mbox[7]) << 32)
            | (u64::from(self.mbox[6]) << 48)
    }

    // -------------------------------------------------------------------------
    // Mailbox firmware
    // -------------------------------------------------------------------------

    fn run_mailbox(&mut self) {
        if self.silent_mailbox {
            return;
        }
        let op = self.mbox[0];
        let code = match self.failing.get(&op) {
            Some(&code) => code,
            None => self.execute(op),
        };
        self.mbox[0] = code;
        let kind = if code == MBOX_COMPLETE {
            cause::MBOX
        } else {
            cause::MBOX_FAIL
        };
        self.raise(kind, code);

        if op == cmd::INIT_FIRMWARE && code == MBOX_COMPLETE && self.link_up {
            self.raise(cause::ASYNC, crate::intr::AsyncEvent::LoopUp as u16);
        }
    }

    fn execute(&mut self, op: u16) -> u16 {
        match op {
            cmd::NOP | cmd::EXEC_FIRMWARE | cmd::VERIFY_CHECKSUM | cmd::SET_FIRMWARE_OPTIONS => {
                MBOX_COMPLETE
            }
            cmd::ABOUT_FIRMWARE => {
                self.mbox[1] = 8;
                self.mbox[2] = 3;
                self.mbox[3] = 0;
                self.mbox[6] = 0x0004;
                MBOX_COMPLETE
            }
            cmd::LOAD_RISC_RAM => {
                let dest = u32::from(self.mbox[1]) | (u32::from(self.mbox[8]) << 16);
                let count = (u32::from(self.mbox[4]) << 16) | u32::from(self.mbox[5]);
                let mut raw = vec![0u8; count as usize * 4];
                dma_read(self.dma_addr(), &mut raw);
                for (i, word) in raw.chunks_exact(4).enumerate() {
                    let word = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
                    self.risc_ram.insert(dest + i as u32, word);
                }
                self.risc_loads.push((dest, count));
                MBOX_COMPLETE
            }
            cmd::GET_ID => {
                self.mbox[1] = 0;
                self.mbox[2] = FABRIC_PORT_ID as u16;
                self.mbox[3] = (FABRIC_PORT_ID >> 16) as u16;
                self.mbox[6] = self.topology as u16;
                self.mbox[7] = 0;
                MBOX_COMPLETE
            }
            cmd::INIT_FIRMWARE => {
                let mut raw = [0u8; InitControlBlock::SIZE];
                dma_read(self.dma_addr(), &mut raw);
                self.icb = Some(InitControlBlock::decode(&raw));
                MBOX_COMPLETE
            }
            cmd::GET_PORT_DB => match self.port_db(self.mbox[1]) {
                Some(pdb) => {
                    dma_write(self.dma_addr(), &pdb.encode());
                    MBOX_COMPLETE
                }
                None => MBOX_COMMAND_ERROR,
            },
            cmd::FABRIC_PLOGO => {
                self.plogo_count += 1;
                self.logins.remove(&self.mbox[1]);
                MBOX_COMPLETE
            }
            _ => MBOX_COMMAND_ERROR,
        }
    }

    fn port_db(&self, loopid: u16) -> Option<PortDatabase> {
        if self.topology.is_fabric() {
            if loopid == F_PORT_HANDLE {
                let fport = RemotePort {
                    port_name: SNS_PORT_NAME,
                    is_target: false,
                };
                return Some(fport.pdb(0xFF_FFFE));
            }
            let port_id = *self.logins.get(&loopid)?;
            return self.fabric_ports.get(&port_id).map(|p| p.pdb(port_id));
        }
        let port = self.loop_ports.get(&loopid)?;
        Some(port.pdb(0xEF_u32.saturating_sub(7 * u32::from(loopid))))
    }

    // -------------------------------------------------------------------------
    // Rings
    // -------------------------------------------------------------------------

    fn consume_requests(&mut self, producer: u16) {
        let Some(icb) = self.icb else {
            return;
        };
        if self.silent_ring {
            return;
        }
        while self.req_out != producer {
            let mut entry = [0u8; QUEUE_ENTRY_SIZE];
            dma_read(
                icb.req_addr + u64::from(self.req_out) * QUEUE_ENTRY_SIZE as u64,
                &mut entry,
            );
            self.req_out = (self.req_out + 1) % icb.req_len;
            self.request(&entry);
        }
    }

    fn request(&mut self, entry: &Entry) {
        match entry[0] {
            entry_type::CMD_TYPE_6 => self.command(entry),
            entry_type::MARKER => self.markers += 1,
            entry_type::PLOGX => {
                self.plogx_count += 1;
                let req = PlogxIocb::decode(entry);
                let known = self.fabric_ports.contains_key(&req.port_id);
                let status = if self.fail_logins || !known {
                    PLOGX_REFUSED
                } else {
                    self.logins.insert(req.nport_handle, req.port_id);
                    0
                };
                self.respond(&PlogxIocb::response(req.handle, status));
            }
            entry_type::CT_PASSTHROUGH => {
                self.ns_queries += 1;
                let req = CtPassthroughIocb::decode(entry);
                let mut ct = [0u8; GA_NXT_REQ_LEN];
                dma_read(req.cmd.addr, &mut ct);
                let resp = self.ga_nxt(ga_nxt_port(&ct)).encode();
                let len = resp.len().min(req.resp.len as usize);
                dma_write(req.resp.addr, &resp[..len]);
                self.respond(&CtPassthroughIocb::response(req.handle, 0));
            }
            _ => {}
        }
    }

    fn command(&mut self, entry: &Entry) {
        let iocb = CommandIocb::decode(entry);
        let segments = if iocb.ctrl_flags.contains(CtrlFlags::EXT_SEG) {
            (0..usize::from(iocb.data_seg_count))
                .map(|i| {
                    let mut raw = [0u8; SEG_SIZE];
                    dma_read(iocb.data_seg.addr + (i * SEG_SIZE) as u64, &mut raw);
                    IocbSeg::decode(&raw)
                })
                .collect()
        } else if iocb.data_seg_count == 1 {
            vec![iocb.data_seg]
        } else {
            Vec::new()
        };
        self.commands.push(CommandRecord { iocb, segments });

        if self.auto_complete {
            let spec = self.statuses.pop_front().unwrap_or_else(StatusSpec::ok);
            self.respond(&spec.entry(iocb.handle));
        } else {
            self.pending.push_back(iocb.handle);
        }
    }

    fn ga_nxt(&self, after: u32) -> GaNxtResponse {
        if self.reject_ns {
            return GaNxtResponse {
                response: CT_REJECT,
                ..GaNxtResponse::default()
            };
        }
        let next = self
            .fabric_ports
            .range(after + 1..)
            .next()
            .or_else(|| self.fabric_ports.iter().next());
        match next {
            Some((&id, port)) => GaNxtResponse::accept(id, port.port_name, port.port_name | 1 << 60),
            None => GaNxtResponse::default(),
        }
    }

    fn respond(&mut self, entry: &Entry) {
        let Some(icb) = self.icb else {
            return;
        };
        dma_write(
            icb.resp_addr + u64::from(self.resp_in) * QUEUE_ENTRY_SIZE as u64,
            entry,
        );
        self.resp_in = (self.resp_in + 1) % icb.resp_len;
        self.raise(cause::RSPQ, 0);
    }
}

/// Register bank of the simulated adapter
pub struct MockHba {
    state: Mutex<HbaState>,
}

impl MockHba {
    fn new() -> Self {
        Self {
            state: Mutex::new(HbaState::new()),
        }
    }

    /// Make mailbox command `op` fail with `code`
    pub fn fail_mailbox(&self, op: u16, code: u16) {
        self.state.lock().failing.insert(op, code);
    }

    /// Stop answering mailbox commands
    pub fn silence_mailbox(&self, silent: bool) {
        self.state.lock().silent_mailbox = silent;
    }

    /// Mailbox register writes so far
    pub fn mbox_writes(&self) -> usize {
        self.state.lock().mbox_writes
    }

    /// Whether loop up follows firmware initialization
    pub fn set_link(&self, up: bool) {
        self.state.lock().link_up = up;
    }

    /// Wipe the power-on signature
    pub fn clear_signature(&self) {
        let mut s = self.state.lock();
        s.mbox[1] = 0;
        s.mbox[2] = 0;
    }

    /// Host commands rung so far
    pub fn host_commands(&self) -> Vec<HostCommand> {
        self.state.lock().host_commands.clone()
    }

    /// Chip resets so far
    pub fn chip_resets(&self) -> usize {
        self.state.lock().chip_resets
    }

    /// Keep the DMA engines reporting active
    pub fn stick_dma(&self, stuck: bool) {
        self.state.lock().stuck_dma = stuck;
    }

    /// Control block received by `INIT_FIRMWARE`
    pub fn icb(&self) -> Option<InitControlBlock> {
        self.state.lock().icb
    }

    /// `(address, words)` of every RISC RAM load
    pub fn risc_loads(&self) -> Vec<(u32, u32)> {
        self.state.lock().risc_loads.clone()
    }

    /// A word of RISC RAM
    pub fn risc_word(&self, addr: u32) -> Option<u32> {
        self.state.lock().risc_ram.get(&addr).copied()
    }

    /// Queue an async event interrupt
    pub fn raise_async(&self, code: u16) {
        self.state.lock().raise(cause::ASYNC, code);
    }

    /// Topology reported by `GET_ID`
    pub fn set_topology(&self, topology: Topology) {
        self.state.lock().topology = topology;
    }

    /// Ports on the loop: `(loop id, port name, target)`
    pub fn set_loop_ports(&self, ports: &[(u16, u64, bool)]) {
        self.state.lock().loop_ports = ports
            .iter()
            .map(|&(id, port_name, is_target)| (id, RemotePort { port_name, is_target }))
            .collect();
    }

    /// Ports registered with the name server: `(port id, port name, target)`
    pub fn set_fabric_ports(&self, ports: &[(u32, u64, bool)]) {
        self.state.lock().fabric_ports = ports
            .iter()
            .map(|&(id, port_name, is_target)| (id, RemotePort { port_name, is_target }))
            .collect();
    }

    /// Drop the login bound to `loopid`
    pub fn forget_login(&self, loopid: u16) {
        self.state.lock().logins.remove(&loopid);
    }

    /// Refuse every login
    pub fn fail_logins(&self, fail: bool) {
        self.state.lock().fail_logins = fail;
    }

    /// Reject every name server query
    pub fn reject_name_server(&self, reject: bool) {
        self.state.lock().reject_ns = reject;
    }

    /// Stop consuming request entries
    pub fn silence_ring(&self, silent: bool) {
        self.state.lock().silent_ring = silent;
    }

    /// PLOGX entries received, retries included
    pub fn logins(&self) -> usize {
        self.state.lock().plogx_count
    }

    /// Logout mailbox commands received
    pub fn logouts(&self) -> usize {
        self.state.lock().plogo_count
    }

    /// Name server queries received
    pub fn name_server_queries(&self) -> usize {
        self.state.lock().ns_queries
    }

    /// Complete commands as soon as they arrive
    pub fn set_auto_complete(&self, on: bool) {
        self.state.lock().auto_complete = on;
    }

    /// Status for the next auto-completed command
    pub fn push_status(&self, spec: StatusSpec) {
        self.state.lock().statuses.push_back(spec);
    }

    /// Post a status for a held command right away
    pub fn post_status(&self, spec: StatusSpec) {
        let mut s = self.state.lock();
        let handle = match spec.handle {
            Some(h) => {
                s.pending.retain(|&p| p != h);
                Some(h)
            }
            None => s.pending.pop_front(),
        };
        if let Some(handle) = handle {
            s.respond(&spec.entry(handle));
        }
    }

    /// Complete the oldest held command with good status
    pub fn complete_next(&self) {
        self.post_status(StatusSpec::ok());
    }

    /// Commands received
    pub fn commands(&self) -> Vec<CommandRecord> {
        self.state.lock().commands.clone()
    }

    /// Markers received
    pub fn markers(&self) -> usize {
        self.state.lock().markers
    }
}

impl RegisterBank for MockHba {
    fn read(&self, reg: Register) -> u32 {
        let s = self.state.lock();
        match reg {
            Register::CtrlStatus if s.stuck_dma => CtrlStatus::DMA_ACTIVE.bits(),
            Register::IntStatus if !s.interrupts.is_empty() => INT_STATUS_RISC,
            Register::RiscStatus => s.interrupts.front().copied().unwrap_or(0),
            Register::ReqOut => u32::from(s.req_out),
            Register::RespIn => u32::from(s.resp_in),
            Register::RespOut => u32::from(s.resp_out),
            _ => 0,
        }
    }

    fn write(&self, reg: Register, value: u32) {
        let mut s = self.state.lock();
        match reg {
            Register::CtrlStatus if value & CtrlStatus::RESET.bits() != 0 => s.chip_reset(),
            Register::HostCmdCtrl => {
                let Some(command) = HostCommand::from_value(value) else {
                    return;
                };
                s.host_commands.push(command);
                match command {
                    HostCommand::SetHostInt => s.run_mailbox(),
                    HostCommand::ClearRiscInt => {
                        s.interrupts.pop_front();
                    }
                    _ => {}
                }
            }
            Register::ReqIn => s.consume_requests(value as u16),
            Register::ReqOut => s.req_out = value as u16,
            Register::RespIn => s.resp_in = value as u16,
            Register::RespOut => s.resp_out = value as u16,
            _ => {}
        }
    }

    fn read_mbox(&self, index: usize) -> u16 {
        self.state.lock().mbox[index]
    }

    fn write_mbox(&self, index: usize, value: u16) {
        let mut s = self.state.lock();
        s.mbox_writes += 1;
        s.mbox[index] = value;
    }
}

// =============================================================================
// PLATFORM AND MIDLAYER
// =============================================================================

/// Everything around the simulated adapter
pub struct MockPlatform {
    hba: MockHba,
    dma: Arc<MockDma>,
    /// Delay source and interrupt line
    pub cpu: MockCpu,
    scheduled: AtomicUsize,
}

impl MockPlatform {
    /// Fresh adapter with the power-on signature
    pub fn new() -> Self {
        Self {
            hba: MockHba::new(),
            dma: Arc::new(MockDma::new()),
            cpu: MockCpu::default(),
            scheduled: AtomicUsize::new(0),
        }
    }

    /// Shared handle on the DMA allocator
    pub fn dma_handle(&self) -> Arc<MockDma> {
        self.dma.clone()
    }

    /// Worker wakeups requested
    pub fn scheduled(&self) -> usize {
        self.scheduled.load(Ordering::Acquire)
    }
}

impl QlePlatform for MockPlatform {
    type Registers = MockHba;
    type Dma = MockDma;
    type Cpu = MockCpu;

    fn registers(&self) -> &MockHba {
        &self.hba
    }

    fn dma(&self) -> &MockDma {
        &self.dma
    }

    fn cpu(&self) -> &MockCpu {
        &self.cpu
    }

    fn schedule_update(&self) {
        self.scheduled.fetch_add(1, Ordering::AcqRel);
    }
}

/// Midlayer that records every upcall
#[derive(Default)]
pub struct RecordingBus {
    done: Mutex<Vec<Box<ScsiXfer>>>,
    probed: Mutex<Vec<u16>>,
    detached: Mutex<Vec<u16>>,
}

impl RecordingBus {
    /// Completed transfers since the last call
    pub fn take_done(&self) -> Vec<Box<ScsiXfer>> {
        core::mem::take(&mut *self.done.lock())
    }

    /// Targets probed since the last call
    pub fn probed(&self) -> Vec<u16> {
        core::mem::take(&mut *self.probed.lock())
    }

    /// Targets detached since the last call
    pub fn detached(&self) -> Vec<u16> {
        core::mem::take(&mut *self.detached.lock())
    }
}

impl ScsiMidlayer for RecordingBus {
    fn done(&self, xs: Box<ScsiXfer>) {
        self.done.lock().push(xs);
    }

    fn probe_target(&self, target: u16) {
        self.probed.lock().push(target);
    }

    fn detach_target(&self, target: u16) {
        self.detached.lock().push(target);
    }
}

// =============================================================================
// HARNESS
// =============================================================================

/// An adapter on the simulated hardware plus its midlayer
pub struct Harness {
    /// The driver
    pub qle: Arc<Qle<MockPlatform>>,
    /// The midlayer, attached or not
    pub bus: Arc<RecordingBus>,
}

impl Harness {
    /// The simulated adapter
    pub fn hba(&self) -> &MockHba {
        &self.qle.platform.hba
    }

    /// The platform
    pub fn platform(&self) -> &MockPlatform {
        &self.qle.platform
    }
}

/// Adapter allocated, chip untouched
pub fn new_adapter() -> Harness {
    let qle = Qle::new(MockPlatform::new(), QleConfig::minimal()).expect("adapter allocation");
    Harness {
        qle: Arc::new(qle),
        bus: Arc::new(RecordingBus::default()),
    }
}

/// Firmware initialized with the link still down; everything polled
pub fn powered_on() -> Harness {
    let t = new_adapter();
    t.hba().set_link(false);
    t.qle.init_firmware().expect("firmware init");
    t
}

/// Loop adapter with `ports` discovered and the bus attached
pub fn attached(ports: &[(u16, u64, bool)]) -> Harness {
    let t = new_adapter();
    t.hba().set_loop_ports(ports);
    t.qle.attach(None).expect("attach");
    t.qle.attach_bus(t.bus.clone());
    t.platform().cpu.arm(&t.qle);
    t
}

/// Fabric adapter knowing its port id, nothing discovered yet, polled
pub fn fabric(ports: &[(u32, u64, bool)]) -> Harness {
    let t = powered_on();
    t.hba().set_topology(Topology::FPort);
    t.hba().set_fabric_ports(ports);
    t.qle.update_topology();
    t
}

/// TEST UNIT READY
pub fn lun_cdb() -> [u8; 6] {
    let mut cdb = [0; 6];
    cdb.copy_from_slice(CdbBuilder::new().test_unit_ready());
    cdb
}

/// READ(10) of `len` bytes into a fresh buffer
pub fn read_xfer(target: u16, len: usize) -> (ScsiXfer, Vec<u8>) {
    let buf = vec![0u8; len];
    let mut builder = CdbBuilder::new();
    let xs = ScsiXfer::new(target, 0, builder.read_10(0, (len / 512) as u16))
        .expect("cdb fits")
        .with_data_in(DataBuffer::new(VirtAddr::from_ptr(buf.as_ptr()), len));
    (xs, buf)
}
