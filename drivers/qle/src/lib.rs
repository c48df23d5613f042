//! # QLogic ISP24xx/25xx Fibre Channel Driver
//!
//! Drives a QLogic 24xx/25xx host bus adapter and presents every remote
//! target port it finds to the SCSI midlayer.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        SCSI midlayer                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ring         command submission, completion, polling        │
//! │  discovery    topology, loop scan, fabric scan, login        │
//! │  mailbox      synchronous firmware commands                  │
//! │  intr         interrupt dispatch, async events               │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ccb · segments · port · fabric · firmware · iocb · regs     │
//! ├──────────────────────────────────────────────────────────────┤
//! │             helix-hal: registers, DMA, delays                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The bus glue supplies a [`QlePlatform`], builds a [`Qle`] with
//! [`Qle::new`], brings the chip up with [`Qle::attach`] and then hands the
//! midlayer over with [`Qle::attach_bus`]. From then on the glue routes the
//! interrupt vector to [`Qle::intr`] and runs [`Qle::do_update`] whenever
//! [`QlePlatform::schedule_update`] asks for it.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod ccb;
pub mod config;
pub mod discovery;
pub mod dma;
pub mod error;
pub mod fabric;
pub mod firmware;
pub mod hba;
pub mod intr;
pub mod iocb;
pub mod mailbox;
pub mod port;
pub mod regs;
pub mod ring;
pub mod segments;
pub mod topology;

#[cfg(test)]
mod testing;

pub use config::QleConfig;
pub use error::{QleError, QleResult};
pub use hba::{Qle, QlePlatform};
