//! cNVMe-sim - a user-space simulation of an NVM Express storage controller.
//!
//! This crate models the *device side* of the NVMe PCI-Express protocol: a
//! host program writes commands into submission queues it owns and rings a
//! doorbell; the simulated controller observes the doorbell, fetches and
//! executes the command, moves data through PRP-described host memory, and
//! posts a completion back into a completion queue.
//!
//! # Layout
//!
//! - [`regs`] - the packed PCI configuration header, capability chain, and
//!   memory-mapped NVMe controller register block.
//! - [`payload`] - an owned, resizable byte buffer with a stable address.
//! - [`watcher`] - the looping background-activity primitive used by both the
//!   register watcher and the doorbell/command watcher.
//! - [`prp`] - the PRP gather/scatter engine.
//! - [`queue`] - submission/completion queue pair bookkeeping.
//! - [`command`] - the 64-byte command and 16-byte completion wire formats.
//! - [`identify`] - Identify Controller / Identify Namespace structures.
//! - [`namespace`] - the namespace/media layer (Format NVM, read, write).
//! - [`controller`] - the controller runtime: register engine, dispatcher,
//!   and reset coordinator tying everything together.
//! - [`facade`] - the optional flat host-driver call surface.

pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod facade;
pub mod identify;
pub mod namespace;
pub mod payload;
pub mod prp;
pub mod queue;
pub mod regs;
pub mod watcher;

pub use command::{Completion, NvmeCommand};
pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::ControllerError;
pub use facade::{DataDirection, DriverCommand, DriverStatus, HostFacade};
pub use payload::Payload;

/// Crate version, exposed for Identify and diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
