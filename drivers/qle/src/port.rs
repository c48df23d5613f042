//! # Port Registry
//!
//! Every remote port the driver knows about lives in one arena and is
//! referenced by key from exactly one of four lists:
//!
//! ```text
//!             classify()                 ATTACH_TARGET
//!  scan ───────────────────▶ New ────────────────────────▶ Ports
//!    │                                                      │  ▲
//!    │ fabric walk                      scan start /        │  │ Same
//!    └──────▶ Found ──PLOGI──▶ New      port gone           ▼  │
//!                                                          Gone ──DETACH_TARGET──▶ freed
//! ```
//!
//! Ports on Gone are either presumed gone by a scan in progress, which may
//! still find them, or retired: known gone because a command or a relogin
//! said so. Only retired ports may be detached while a scan is running.
//!
//! A second index maps loop ids to the port that owns them, which is how a
//! SCSI target number (the loop id) reaches the firmware port id.

use crate::error::{QleError, QleResult};
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use hashbrown::HashMap;
use log::debug;

// =============================================================================
// PORT
// =============================================================================

/// Where a port was found.
///
/// Loop ids and fabric port ids are separate address spaces; a loop port at
/// 5 and a fabric port at 0x000005 never compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    /// Arbitrated loop id
    Loop(u16),
    /// 24-bit fabric port id
    Fabric(u32),
}

/// Address space of a [`Location`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    /// Loop ids
    Loop,
    /// Fabric port ids
    Fabric,
}

impl Location {
    /// Address space
    pub const fn kind(&self) -> LocationKind {
        match self {
            Location::Loop(_) => LocationKind::Loop,
            Location::Fabric(_) => LocationKind::Fabric,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Loop(id) => write!(f, "loop {}", id),
            Location::Fabric(id) => write!(f, "fabric {:06x}", id),
        }
    }
}

bitflags! {
    /// Port flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PortFlags: u8 {
        /// Offers the FCP target role
        const IS_TARGET = 1 << 0;
        /// Found on the fabric, not yet logged in
        const NEEDS_LOGIN = 1 << 1;
        /// Known gone, awaiting detach regardless of any scan
        const RETIRED = 1 << 2;
    }
}

/// A remote Fibre Channel port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FcPort {
    /// World-wide port name
    pub port_name: u64,
    /// World-wide node name
    pub node_name: u64,
    /// Where it was found
    pub location: Location,
    /// 24-bit FC address
    pub portid: u32,
    /// Firmware handle, also the SCSI target number
    pub loopid: u16,
    /// Flags
    pub flags: PortFlags,
}

impl FcPort {
    /// Port seen at `loopid` on the loop
    pub fn on_loop(loopid: u16, pdb: &PortDatabase) -> Self {
        let mut flags = PortFlags::empty();
        flags.set(PortFlags::IS_TARGET, pdb.is_target());
        Self {
            port_name: pdb.port_name,
            node_name: pdb.node_name,
            location: Location::Loop(loopid),
            portid: pdb.port_id,
            loopid,
            flags,
        }
    }

    /// Port returned by the fabric name server; the loop id is assigned at
    /// login
    pub const fn on_fabric(portid: u32, port_name: u64, node_name: u64) -> Self {
        Self {
            port_name,
            node_name,
            location: Location::Fabric(portid),
            portid,
            loopid: 0,
            flags: PortFlags::NEEDS_LOGIN,
        }
    }

    /// Whether the port offers the target role
    pub const fn is_target(&self) -> bool {
        self.flags.contains(PortFlags::IS_TARGET)
    }

    /// Whether both world-wide names match
    pub const fn has_names(&self, port_name: u64, node_name: u64) -> bool {
        self.port_name == port_name && self.node_name == node_name
    }
}

// =============================================================================
// PORT DATABASE
// =============================================================================

/// Port database entry returned by `GET_PORT_DB`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortDatabase {
    /// 24-bit port id
    pub port_id: u32,
    /// PRLI service parameter word 3
    pub prli_svc_word3: u16,
    /// World-wide port name
    pub port_name: u64,
    /// World-wide node name
    pub node_name: u64,
}

impl PortDatabase {
    /// Bytes the firmware writes
    pub const SIZE: usize = 64;
    /// Target function bit of service parameter word 3
    pub const TARGET_ROLE: u16 = 0x0010;

    /// Parse the firmware's layout
    pub fn decode(raw: &[u8; Self::SIZE]) -> Self {
        let be64 = |off: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[off..off + 8]);
            u64::from_be_bytes(b)
        };
        Self {
            port_id: (u32::from(raw[4]) << 16) | (u32::from(raw[5]) << 8) | u32::from(raw[6]),
            prli_svc_word3: u16::from_le_bytes([raw[18], raw[19]]),
            port_name: be64(20),
            node_name: be64(28),
        }
    }

    /// Produce the firmware's layout
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut raw = [0u8; Self::SIZE];
        raw[4] = (self.port_id >> 16) as u8;
        raw[5] = (self.port_id >> 8) as u8;
        raw[6] = self.port_id as u8;
        raw[18..20].copy_from_slice(&self.prli_svc_word3.to_le_bytes());
        raw[20..28].copy_from_slice(&self.port_name.to_be_bytes());
        raw[28..36].copy_from_slice(&self.node_name.to_be_bytes());
        raw
    }

    /// Whether the port offers the target role
    pub const fn is_target(&self) -> bool {
        self.prli_svc_word3 & Self::TARGET_ROLE != 0
    }
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Arena key of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortKey(u32);

/// The four lists a port can be on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortList {
    /// Attached
    Ports = 0,
    /// Classified this scan, awaiting attach
    New = 1,
    /// Attached but not seen this scan, awaiting detach
    Gone = 2,
    /// Fabric walk results awaiting login
    Found = 3,
}

/// Result of classifying a scanned port against the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Never seen
    New,
    /// Same names at the same location as a port awaiting detach
    Same(PortKey),
    /// A different port now sits where the given one was
    Changed(PortKey),
    /// The given port reappeared at a new location
    Moved(PortKey),
    /// Already classified this scan
    Dup(PortKey),
}

impl Disposition {
    /// Whether the scanned port should be kept for attach
    pub const fn is_fresh(&self) -> bool {
        matches!(
            self,
            Disposition::New | Disposition::Changed(_) | Disposition::Moved(_)
        )
    }
}

/// Lowest loop id handed out to fabric logins
pub const MIN_HANDLE: u16 = 0x81;
/// Highest loop id handed out to fabric logins
pub const MAX_HANDLE: u16 = 0x7EF;

/// Known remote ports
#[derive(Debug)]
pub struct PortRegistry {
    arena: HashMap<PortKey, FcPort>,
    lists: [VecDeque<PortKey>; 4],
    targets: Vec<Option<PortKey>>,
    next_key: u32,
}

impl PortRegistry {
    /// Empty registry indexing loop ids below `max_targets`
    pub fn new(max_targets: u16) -> Self {
        Self {
            arena: HashMap::new(),
            lists: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            targets: vec![None; usize::from(max_targets)],
            next_key: 0,
        }
    }

    fn list(&self, list: PortList) -> &VecDeque<PortKey> {
        &self.lists[list as usize]
    }

    fn list_mut(&mut self, list: PortList) -> &mut VecDeque<PortKey> {
        &mut self.lists[list as usize]
    }

    /// Ports on `list`, in order
    pub fn ports(&self, list: PortList) -> impl Iterator<Item = &FcPort> + '_ {
        self.list(list).iter().filter_map(|k| self.arena.get(k))
    }

    /// Number of ports on `list`
    pub fn count(&self, list: PortList) -> usize {
        self.list(list).len()
    }

    /// Port by key
    pub fn get(&self, key: PortKey) -> Option<&FcPort> {
        self.arena.get(&key)
    }

    /// Which list holds `key`
    pub fn list_of(&self, key: PortKey) -> Option<PortList> {
        [PortList::Ports, PortList::New, PortList::Gone, PortList::Found]
            .into_iter()
            .find(|l| self.list(*l).contains(&key))
    }

    /// Classify a scanned port.
    ///
    /// Looks only at the New and Gone lists and changes nothing.
    pub fn classify(&self, location: Location, port_name: u64, node_name: u64) -> Disposition {
        for key in self.list(PortList::New) {
            if let Some(p) = self.arena.get(key) {
                if p.has_names(port_name, node_name) || p.location == location {
                    return Disposition::Dup(*key);
                }
            }
        }

        let mut locmatch = None;
        let mut wwnmatch = None;
        for key in self.list(PortList::Gone) {
            if let Some(p) = self.arena.get(key) {
                if p.location == location {
                    locmatch = Some(*key);
                }
                if p.has_names(port_name, node_name) {
                    wwnmatch = Some(*key);
                }
            }
        }

        match (locmatch, wwnmatch) {
            (None, None) => Disposition::New,
            (Some(l), Some(w)) if l == w => Disposition::Same(l),
            (_, Some(w)) => Disposition::Moved(w),
            (Some(l), None) => Disposition::Changed(l),
        }
    }

    /// Classify `port` and file it accordingly.
    ///
    /// Fresh ports go to `dest` (New or Found); a port seen again in place
    /// goes back to Ports and the scanned copy is dropped.
    pub fn reconcile(&mut self, port: FcPort, dest: PortList) -> Disposition {
        let disp = self.classify(port.location, port.port_name, port.node_name);
        match disp {
            Disposition::New | Disposition::Changed(_) | Disposition::Moved(_) => {
                self.insert(port, dest);
            }
            Disposition::Same(prev) => {
                self.move_to(prev, PortList::Gone, PortList::Ports);
                if let Some(p) = self.arena.get_mut(&prev) {
                    p.flags.remove(PortFlags::RETIRED);
                }
            }
            Disposition::Dup(_) => {}
        }
        disp
    }

    /// Add a port to `list`; ports on the New list claim their loop id
    pub fn insert(&mut self, port: FcPort, list: PortList) -> PortKey {
        let key = PortKey(self.next_key);
        self.next_key = self.next_key.wrapping_add(1);
        if list == PortList::New {
            self.set_target(port.loopid, key);
        }
        self.arena.insert(key, port);
        self.list_mut(list).push_back(key);
        key
    }

    fn set_target(&mut self, loopid: u16, key: PortKey) {
        match self.targets.get_mut(usize::from(loopid)) {
            Some(slot) => *slot = Some(key),
            None => debug!("qle: loop id {:#x} beyond target space", loopid),
        }
    }

    fn clear_target(&mut self, loopid: u16, key: PortKey) {
        if let Some(slot) = self.targets.get_mut(usize::from(loopid)) {
            if *slot == Some(key) {
                *slot = None;
            }
        }
    }

    fn move_to(&mut self, key: PortKey, from: PortList, to: PortList) -> bool {
        let src = self.list_mut(from);
        let Some(pos) = src.iter().position(|k| *k == key) else {
            return false;
        };
        src.remove(pos);
        self.list_mut(to).push_back(key);
        true
    }

    fn drop_port(&mut self, key: PortKey) -> Option<FcPort> {
        let port = self.arena.remove(&key)?;
        self.clear_target(port.loopid, key);
        Some(port)
    }

    /// Port owning loop id `loopid`
    pub fn target(&self, loopid: u16) -> Option<&FcPort> {
        let key = (*self.targets.get(usize::from(loopid))?)?;
        self.arena.get(&key)
    }

    /// Number of loop ids currently indexed
    pub fn indexed(&self) -> usize {
        self.targets.iter().filter(|t| t.is_some()).count()
    }

    /// Retire the attached port at `loopid`; false if there is none
    pub fn retire_target(&mut self, loopid: u16) -> bool {
        let Some(key) = self.targets.get(usize::from(loopid)).copied().flatten() else {
            return false;
        };
        self.retire(key)
    }

    fn is_retired(&self, key: &PortKey) -> bool {
        self.arena
            .get(key)
            .is_some_and(|p| p.flags.contains(PortFlags::RETIRED))
    }

    /// Forget the results of an unfinished scan: New and Found ports are
    /// dropped and ports presumed gone count as attached again. Retired
    /// ports stay on Gone.
    pub fn clear_scan_lists(&mut self) {
        for list in [PortList::Found, PortList::New] {
            while let Some(key) = self.list_mut(list).pop_front() {
                self.drop_port(key);
            }
        }
        let gone = core::mem::take(self.list_mut(PortList::Gone));
        for key in gone {
            let list = if self.is_retired(&key) {
                PortList::Gone
            } else {
                PortList::Ports
            };
            self.list_mut(list).push_back(key);
        }
    }

    /// Presume every attached port of `kind` gone until a scan sees it
    pub fn mark_gone(&mut self, kind: LocationKind) {
        let arena = &self.arena;
        let (keep, gone): (VecDeque<PortKey>, VecDeque<PortKey>) = self.lists
            [PortList::Ports as usize]
            .iter()
            .partition(|k| arena.get(*k).map_or(true, |p| p.location.kind() != kind));
        self.lists[PortList::Ports as usize] = keep;
        self.list_mut(PortList::Gone).extend(gone);
    }

    /// Take the next port to detach, releasing its loop id
    pub fn pop_gone(&mut self) -> Option<FcPort> {
        let key = self.list_mut(PortList::Gone).pop_front()?;
        self.drop_port(key)
    }

    /// Whether a retired port awaits detach
    pub fn has_retired(&self) -> bool {
        self.list(PortList::Gone).iter().any(|k| self.is_retired(k))
    }

    /// Take the next retired port, leaving ports a scan merely presumes gone
    pub fn pop_retired(&mut self) -> Option<FcPort> {
        let pos = self
            .list(PortList::Gone)
            .iter()
            .position(|k| self.is_retired(k))?;
        let key = self.list_mut(PortList::Gone).remove(pos)?;
        self.drop_port(key)
    }

    /// Move the next new port to Ports; returns a copy of it
    pub fn attach_next(&mut self) -> Option<FcPort> {
        let key = self.list_mut(PortList::New).pop_front()?;
        self.list_mut(PortList::Ports).push_back(key);
        self.arena.get(&key).copied()
    }

    /// Take the next fabric port awaiting login
    pub fn pop_found(&mut self) -> Option<FcPort> {
        let key = self.list_mut(PortList::Found).pop_front()?;
        self.arena.remove(&key)
    }

    /// Remove every port, attached or not; returns the attached ones
    pub fn take_all_attached(&mut self) -> Vec<FcPort> {
        self.clear_scan_lists();
        let mut out = Vec::with_capacity(self.count(PortList::Ports) + self.count(PortList::Gone));
        for list in [PortList::Ports, PortList::Gone] {
            while let Some(key) = self.list_mut(list).pop_front() {
                if let Some(p) = self.drop_port(key) {
                    out.push(p);
                }
            }
        }
        out
    }

    /// Lowest loop id free for a fabric login
    pub fn free_loop_id(&self) -> QleResult<u16> {
        let last = MAX_HANDLE.min(self.targets.len().saturating_sub(1) as u16);
        (MIN_HANDLE..=last)
            .find(|id| self.targets[usize::from(*id)].is_none())
            .ok_or(QleError::OutOfLoopIds)
    }

    /// Keys of attached fabric ports, for relogin
    pub fn attached_fabric(&self) -> Vec<PortKey> {
        self.list(PortList::Ports)
            .iter()
            .copied()
            .filter(|k| {
                self.arena
                    .get(k)
                    .is_some_and(|p| p.location.kind() == LocationKind::Fabric)
            })
            .collect()
    }

    /// Move an attached port to Gone as known gone
    pub fn retire(&mut self, key: PortKey) -> bool {
        if !self.move_to(key, PortList::Ports, PortList::Gone) {
            return false;
        }
        if let Some(p) = self.arena.get_mut(&key) {
            p.flags.insert(PortFlags::RETIRED);
        }
        true
    }
}

// =============================================================================
// TESTS
// =============================================================================
