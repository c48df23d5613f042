//! # Link Topology
//!
//! What the firmware says about our own place on the link, and the port
//! database query every scan is built on.

use crate::dma::DmaRegion;
use crate::error::QleResult;
use crate::hba::{Qle, QlePlatform};
use crate::mailbox::{cmd, MboxCommand};
use crate::port::PortDatabase;
use helix_hal::dma::DmaSync;
use log::{info, warn};

/// Handle of the fabric port's login
pub const F_PORT_HANDLE: u16 = 0x7FE;

/// How the adapter is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Topology {
    /// Private loop
    NlPort = 0,
    /// Public loop
    FlPort = 1,
    /// Point to point
    NPort = 2,
    /// Fabric
    FPort = 3,
    /// Point to point without a target role
    NPortNoTarget = 4,
}

impl Topology {
    /// Convert from the `GET_ID` value
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Topology::NlPort),
            1 => Some(Topology::FlPort),
            2 => Some(Topology::NPort),
            3 => Some(Topology::FPort),
            4 => Some(Topology::NPortNoTarget),
            _ => None,
        }
    }

    /// Whether a name server is reachable
    pub const fn is_fabric(self) -> bool {
        matches!(self, Topology::FlPort | Topology::FPort)
    }

    /// Highest loop id a loop scan visits
    pub const fn loop_max_id(self) -> u16 {
        match self {
            Topology::NlPort | Topology::FlPort => 126,
            Topology::NPort => 2,
            _ => 0,
        }
    }
}

/// Our own addressing on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    /// Connection type
    pub topology: Topology,
    /// Our loop id
    pub loop_id: u16,
    /// Our fabric port id
    pub port_id: u32,
    /// Highest loop id to scan
    pub loop_max_id: u16,
    /// Port name of the fabric port, 0 when unknown
    pub sns_port_name: u64,
}

impl LinkState {
    /// State before the link has been queried
    pub const fn unknown() -> Self {
        Self {
            topology: Topology::NPortNoTarget,
            loop_id: 0,
            port_id: 0,
            loop_max_id: 0,
            sns_port_name: 0,
        }
    }
}

impl Default for LinkState {
    fn default() -> Self {
        Self::unknown()
    }
}

impl<P: QlePlatform> Qle<P> {
    /// Current link addressing
    pub fn link_state(&self) -> LinkState {
        *self.link.lock()
    }

    /// Read the port database entry of `loopid` through `scratch`
    pub(crate) fn get_port_db(&self, loopid: u16, scratch: &DmaRegion) -> QleResult<PortDatabase> {
        let dma = self.platform.dma();
        scratch.sync(dma, 0, PortDatabase::SIZE, DmaSync::PRE_READ);
        let command = MboxCommand::new(cmd::GET_PORT_DB)
            .reg(1, loopid)
            .dma_addr(scratch.paddr())
            .inputs(0x00cf)
            .outputs(0x0001);
        self.mbox(&command)?;
        scratch.sync(dma, 0, PortDatabase::SIZE, DmaSync::POST_READ);
        Ok(PortDatabase::decode(&scratch.read_array(0)))
    }

    /// Ask the firmware where we are
    pub(crate) fn update_topology(&self) {
        let command = MboxCommand::new(cmd::GET_ID).outputs(0x00cf);
        let mut link = self.link.lock();
        let out = match self.mbox(&command) {
            Ok(out) => out,
            Err(e) => {
                warn!("qle: unable to get loop id: {}", e);
                link.topology = Topology::NPortNoTarget;
                link.loop_max_id = 0;
                return;
            }
        };

        link.loop_id = out.reg(1);
        link.topology = Topology::from_u16(out.reg(6)).unwrap_or(Topology::NPortNoTarget);
        match link.topology {
            Topology::NlPort | Topology::NPort => info!("qle: loop id {}", link.loop_id),
            Topology::FlPort | Topology::FPort => {
                link.port_id = u32::from(out.reg(2)) | (u32::from(out.reg(3)) << 16);
                info!("qle: fabric port id {:06x}", link.port_id);
            }
            Topology::NPortNoTarget => info!("qle: topology {:#x} not useful", out.reg(6)),
        }
        link.loop_max_id = link.topology.loop_max_id();
    }

    /// Look up the fabric port; false when the topology has no fabric
    pub(crate) fn update_fabric(&self) -> bool {
        if !self.link.lock().topology.is_fabric() {
            return false;
        }

        let scratch = self.scratch.lock();
        let name = match self.get_port_db(F_PORT_HANDLE, &scratch) {
            Ok(pdb) => {
                info!("qle: SNS port name {:x}", pdb.port_name);
                pdb.port_name
            }
            Err(e) => {
                warn!("qle: get port db for SNS failed: {}", e);
                0
            }
        };
        drop(scratch);
        self.link.lock().sns_port_name = name;
        true
    }
}

// =============================================================================
// TESTS
// =============================================================================
