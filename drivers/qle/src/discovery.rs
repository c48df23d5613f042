//! # Discovery Worker
//!
//! Topology changes reach the driver as asynchronous events. Each event only
//! sets bits in a task mask; a single worker drains the mask one step at a
//! time, always picking the highest priority bit, so a reset or a clear
//! pre-empts a scan and a scan pre-empts logins.
//!
//! ```text
//!  CLEAR_ALL ▶ SOFTRESET ▶ DETACH_TARGET ▶ ATTACH_TARGET ▶ UPDATE_TOPO
//!      ▶ SCAN_LOOP ▶ SCANNING_LOOP ▶ SCAN_FABRIC ▶ SCANNING_FABRIC
//!      ▶ FABRIC_LOGIN ▶ FABRIC_RELOGIN
//!
//!  SCANNING_LOOP (last id) ───────────────▶ ATTACH_TARGET | DETACH_TARGET
//!  SCANNING_FABRIC (walk over) ───────────▶ FABRIC_LOGIN
//!  FABRIC_LOGIN (nothing left) ───────────▶ ATTACH_TARGET | DETACH_TARGET
//! ```
//!
//! While a scan is in progress the Gone list holds ports the scan has not
//! reached yet, so attach waits for the scan to end and detach only takes
//! ports that were retired outside the scan.

use crate::error::QleResult;
use crate::fabric::{FabricStep, FabricWalk};
use crate::hba::{Qle, QlePlatform};
use crate::port::{Disposition, FcPort, LocationKind, PortFlags, PortList};
use core::sync::atomic::Ordering;
use bitflags::bitflags;
use log::{debug, info, warn};

bitflags! {
    /// Pending discovery work
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UpdateTasks: u32 {
        /// Detach everything
        const CLEAR_ALL = 1 << 0;
        /// Reinitialize the adapter
        const SOFTRESET = 1 << 1;
        /// Detach ports on the Gone list
        const DETACH_TARGET = 1 << 2;
        /// Attach ports on the New list
        const ATTACH_TARGET = 1 << 3;
        /// Refresh our own topology and address
        const UPDATE_TOPO = 1 << 4;
        /// Start a loop scan
        const SCAN_LOOP = 1 << 5;
        /// Loop scan in progress
        const SCANNING_LOOP = 1 << 6;
        /// Start a fabric scan
        const SCAN_FABRIC = 1 << 7;
        /// Name server walk in progress
        const SCANNING_FABRIC = 1 << 8;
        /// Log in to ports found on the fabric
        const FABRIC_LOGIN = 1 << 9;
        /// Check existing fabric logins
        const FABRIC_RELOGIN = 1 << 10;
    }
}

impl UpdateTasks {
    /// A scan has started and not yet handed its results to attach/detach
    pub const SCAN_IN_PROGRESS: Self = Self::SCANNING_LOOP
        .union(Self::SCANNING_FABRIC)
        .union(Self::FABRIC_LOGIN);
}

/// One discovery step, in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTask {
    /// See [`UpdateTasks::CLEAR_ALL`]
    ClearAll,
    /// See [`UpdateTasks::SOFTRESET`]
    Softreset,
    /// See [`UpdateTasks::DETACH_TARGET`]
    DetachTarget,
    /// See [`UpdateTasks::ATTACH_TARGET`]
    AttachTarget,
    /// See [`UpdateTasks::UPDATE_TOPO`]
    UpdateTopo,
    /// See [`UpdateTasks::SCAN_LOOP`]
    ScanLoop,
    /// See [`UpdateTasks::SCANNING_LOOP`]
    ScanningLoop,
    /// See [`UpdateTasks::SCAN_FABRIC`]
    ScanFabric,
    /// See [`UpdateTasks::SCANNING_FABRIC`]
    ScanningFabric,
    /// See [`UpdateTasks::FABRIC_LOGIN`]
    FabricLogin,
    /// See [`UpdateTasks::FABRIC_RELOGIN`]
    FabricRelogin,
}

impl UpdateTask {
    /// Every task, highest priority first
    pub const PRIORITY: [UpdateTask; 11] = [
        UpdateTask::ClearAll,
        UpdateTask::Softreset,
        UpdateTask::DetachTarget,
        UpdateTask::AttachTarget,
        UpdateTask::UpdateTopo,
        UpdateTask::ScanLoop,
        UpdateTask::ScanningLoop,
        UpdateTask::ScanFabric,
        UpdateTask::ScanningFabric,
        UpdateTask::FabricLogin,
        UpdateTask::FabricRelogin,
    ];

    /// Mask bit of this task
    pub const fn bit(self) -> UpdateTasks {
        match self {
            UpdateTask::ClearAll => UpdateTasks::CLEAR_ALL,
            UpdateTask::Softreset => UpdateTasks::SOFTRESET,
            UpdateTask::DetachTarget => UpdateTasks::DETACH_TARGET,
            UpdateTask::AttachTarget => UpdateTasks::ATTACH_TARGET,
            UpdateTask::UpdateTopo => UpdateTasks::UPDATE_TOPO,
            UpdateTask::ScanLoop => UpdateTasks::SCAN_LOOP,
            UpdateTask::ScanningLoop => UpdateTasks::SCANNING_LOOP,
            UpdateTask::ScanFabric => UpdateTasks::SCAN_FABRIC,
            UpdateTask::ScanningFabric => UpdateTasks::SCANNING_FABRIC,
            UpdateTask::FabricLogin => UpdateTasks::FABRIC_LOGIN,
            UpdateTask::FabricRelogin => UpdateTasks::FABRIC_RELOGIN,
        }
    }

    /// Highest priority task in `tasks`
    pub fn first(tasks: UpdateTasks) -> Option<Self> {
        Self::PRIORITY.into_iter().find(|t| tasks.contains(t.bit()))
    }
}

/// Scan cursors carried between worker steps
#[derive(Debug, Default)]
pub struct WorkerState {
    /// Next loop id to scan
    pub step: u16,
    /// Name server walk
    pub walk: FabricWalk,
}

// =============================================================================
// TASK MASK
// =============================================================================

impl<P: QlePlatform> Qle<P> {
    /// Request work and make sure the worker runs
    pub fn update_start(&self, tasks: UpdateTasks) {
        self.tasks.fetch_or(tasks.bits(), Ordering::AcqRel);
        self.platform.schedule_update();
    }

    fn update_done(&self, tasks: UpdateTasks) {
        self.tasks.fetch_and(!tasks.bits(), Ordering::AcqRel);
    }

    /// Work not yet done
    pub fn pending_tasks(&self) -> UpdateTasks {
        UpdateTasks::from_bits_truncate(self.tasks.load(Ordering::Acquire))
    }

    fn notify_attach(&self, port: &FcPort) {
        if !port.is_target() {
            return;
        }
        if let Some(bus) = self.bus.get() {
            bus.probe_target(port.loopid);
        }
    }

    fn notify_detach(&self, port: &FcPort) {
        if !port.is_target() {
            return;
        }
        if let Some(bus) = self.bus.get() {
            bus.detach_target(port.loopid);
        }
    }
}

// =============================================================================
// WORKER
// =============================================================================

impl<P: QlePlatform> Qle<P> {
    /// Run discovery until no work is left.
    ///
    /// Only one worker runs at a time; a second caller blocks until the
    /// first is done and then finds the mask empty or freshly refilled.
    pub fn do_update(&self) {
        let mut worker = self.worker.lock();
        debug!("qle: updating");

        while let Some(task) = UpdateTask::first(self.runnable_tasks()) {
            match task {
                UpdateTask::ClearAll => self.clear_all(),
                UpdateTask::Softreset => {
                    info!("qle: attempting softreset");
                    if let Err(e) = self.softreset() {
                        warn!("qle: couldn't softreset: {}", e);
                    }
                    self.update_done(UpdateTasks::SOFTRESET);
                }
                UpdateTask::DetachTarget => self.detach_next(),
                UpdateTask::AttachTarget => self.attach_next(),
                UpdateTask::UpdateTopo => {
                    info!("qle: updating topology");
                    self.update_topology();
                    self.update_done(UpdateTasks::UPDATE_TOPO);
                }
                UpdateTask::ScanLoop => {
                    info!("qle: starting loop scan");
                    {
                        let mut ports = self.ports.lock();
                        ports.clear_scan_lists();
                        ports.mark_gone(LocationKind::Loop);
                    }
                    worker.step = 0;
                    self.update_start(UpdateTasks::SCANNING_LOOP);
                    self.update_done(UpdateTasks::SCAN_LOOP);
                }
                UpdateTask::ScanningLoop => {
                    let step = worker.step;
                    debug!("qle: scanning loop id {:#x}", step);
                    if let Err(e) = self.add_loop_port(step) {
                        debug!("qle: loop id {:#x}: {}", step, e);
                    }
                    if step >= self.link.lock().loop_max_id {
                        self.update_done(UpdateTasks::SCANNING_LOOP);
                        self.update_start(UpdateTasks::ATTACH_TARGET | UpdateTasks::DETACH_TARGET);
                    } else {
                        worker.step = step + 1;
                    }
                }
                UpdateTask::ScanFabric => {
                    info!("qle: starting fabric scan");
                    {
                        let mut ports = self.ports.lock();
                        ports.clear_scan_lists();
                        ports.mark_gone(LocationKind::Fabric);
                    }
                    worker.walk = FabricWalk::new();
                    if self.update_fabric() {
                        self.update_start(UpdateTasks::SCANNING_FABRIC);
                    } else {
                        // no fabric: whatever was on it is gone
                        self.update_start(UpdateTasks::ATTACH_TARGET | UpdateTasks::DETACH_TARGET);
                    }
                    self.update_done(UpdateTasks::SCAN_FABRIC);
                }
                UpdateTask::ScanningFabric => match self.next_fabric_port(&mut worker.walk) {
                    FabricStep::Port(port) => self.found_fabric_port(port),
                    FabricStep::Skip => {}
                    FabricStep::Finished => {
                        info!("qle: fabric walk finished after {} queries", worker.walk.queries);
                        self.update_done(UpdateTasks::SCANNING_FABRIC);
                        self.update_start(UpdateTasks::FABRIC_LOGIN);
                    }
                },
                UpdateTask::FabricLogin => self.login_next(),
                UpdateTask::FabricRelogin => {
                    self.relogin_fabric();
                    self.update_done(UpdateTasks::FABRIC_RELOGIN);
                }
            }
        }

        debug!("qle: done updating");
    }

    /// Pending tasks the worker may act on now
    fn runnable_tasks(&self) -> UpdateTasks {
        let mut tasks = self.pending_tasks();
        if tasks.intersects(UpdateTasks::SCAN_IN_PROGRESS) {
            tasks.remove(UpdateTasks::ATTACH_TARGET);
            if !self.ports.lock().has_retired() {
                tasks.remove(UpdateTasks::DETACH_TARGET);
            }
        }
        tasks
    }

    fn clear_all(&self) {
        info!("qle: detaching everything");
        let detach = self.ports.lock().take_all_attached();
        for port in &detach {
            self.notify_detach(port);
            if port.location.kind() == LocationKind::Fabric {
                self.fabric_plogo(port);
            }
        }
        self.update_done(UpdateTasks::CLEAR_ALL);
    }

    fn detach_next(&self) {
        let scanning = self.pending_tasks().intersects(UpdateTasks::SCAN_IN_PROGRESS);
        let port = {
            let mut ports = self.ports.lock();
            if scanning {
                ports.pop_retired()
            } else {
                ports.pop_gone()
            }
        };
        match port {
            Some(port) => {
                info!("qle: detaching port {:06x}", port.portid);
                self.notify_detach(&port);
                if port.location.kind() == LocationKind::Fabric {
                    self.fabric_plogo(&port);
                }
            }
            // the end of the scan detaches the rest
            None if scanning => {}
            None => {
                debug!("qle: nothing to detach");
                self.update_done(UpdateTasks::DETACH_TARGET);
            }
        }
    }

    fn attach_next(&self) {
        let port = self.ports.lock().attach_next();
        match port {
            Some(port) => {
                debug!("qle: attaching {} at {:#x}", port.location, port.loopid);
                self.notify_attach(&port);
            }
            None => self.update_done(UpdateTasks::ATTACH_TARGET),
        }
    }

    /// Query loop id `loopid` and classify whatever answers
    pub(crate) fn add_loop_port(&self, loopid: u16) -> QleResult<Disposition> {
        let pdb = {
            let scratch = self.scratch.lock();
            self.get_port_db(loopid, &scratch)?
        };
        let port = FcPort::on_loop(loopid, &pdb);
        let disp = self.ports.lock().reconcile(port, PortList::New);
        if disp.is_fresh() {
            info!(
                "qle: {} {}; name {:x}",
                if port.is_target() { "target" } else { "non-target" },
                loopid,
                port.port_name
            );
        }
        Ok(disp)
    }

    fn found_fabric_port(&self, port: FcPort) {
        let disp = self.ports.lock().reconcile(port, PortList::Found);
        match disp {
            Disposition::New | Disposition::Changed(_) | Disposition::Moved(_) => {
                info!("qle: new port {:06x}", port.portid);
            }
            Disposition::Same(_) => info!("qle: existing port {:06x}", port.portid),
            Disposition::Dup(_) => debug!("qle: duplicate port {:06x}", port.portid),
        }
    }

    fn login_next(&self) {
        let port = self.ports.lock().pop_found();
        let Some(mut port) = port else {
            info!("qle: done with logins");
            self.update_done(UpdateTasks::FABRIC_LOGIN);
            self.update_start(UpdateTasks::ATTACH_TARGET | UpdateTasks::DETACH_TARGET);
            return;
        };

        info!("qle: found port {:06x}", port.portid);
        if let Err(e) = self.fabric_plogi(&mut port) {
            warn!("qle: plogi {:06x} failed: {}", port.portid, e);
            return;
        }
        if let Err(e) = self.add_fabric_port(port) {
            warn!("qle: port {:06x} vanished after login: {}", port.portid, e);
        }
    }

    /// Read back a logged-in fabric port and queue it for attach
    pub(crate) fn add_fabric_port(&self, mut port: FcPort) -> QleResult<()> {
        let pdb = {
            let scratch = self.scratch.lock();
            self.get_port_db(port.loopid, &scratch)?
        };
        port.flags.set(PortFlags::IS_TARGET, pdb.is_target());
        self.ports.lock().insert(port, PortList::New);
        info!(
            "qle: {} {}; name {:x}",
            if port.is_target() { "target" } else { "non-target" },
            port.loopid,
            port.port_name
        );
        Ok(())
    }

    /// Check that every attached fabric port is still logged in where we
    /// think it is, logging in again when it is not
    fn relogin_fabric(&self) {
        let keys = self.ports.lock().attached_fabric();
        let mut lost = false;

        for key in keys {
            let Some(port) = self.ports.lock().get(key).copied() else {
                continue;
            };
            let pdb = {
                let scratch = self.scratch.lock();
                self.get_port_db(port.loopid, &scratch)
            };
            match pdb {
                Ok(pdb) if pdb.port_name == port.port_name => continue,
                Ok(_) => debug!("qle: loop id {:#x} changed hands", port.loopid),
                Err(e) => debug!("qle: loop id {:#x} lost: {}", port.loopid, e),
            }

            info!("qle: relogin to {:06x}", port.portid);
            if let Err(e) = self.plogx(port.loopid, port.portid) {
                warn!("qle: relogin to {:06x} failed: {}", port.portid, e);
                lost |= self.ports.lock().retire(key);
            }
        }

        if lost {
            self.update_start(UpdateTasks::DETACH_TARGET);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
