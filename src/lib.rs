//! # Shelf - Archive Scheduler for Hierarchical Storage
//!
//! `shelfd` is the scheduling core of the Shelf hierarchical storage
//! manager. Filesystem examiners compose archive requests (sets of files
//! wanting copies on secondary media) and hand them to the [`Scheduler`];
//! it decides when each request runs, which drives and volumes it gets,
//! and launches one `shelf-copy` worker per drive to write the archives.
//!
//! - **Three-queue state machine**: requests move between schedule, archive
//!   and wait queues under a single lock
//! - **Priority scheduling**: per-set base priority plus bonuses for loaded
//!   volumes, offline files and multi-volume copies
//! - **Volume overflow**: one archive file may span removable volumes when
//!   a worker runs out of space mid-copy
//! - **Pluggable edges**: volume catalogs, request composition and worker
//!   process control are traits; in-memory implementations live in [`sim`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use shelfd::sim::{MemoryCatalog, SimComposer, SimLauncher};
//! use shelfd::{SchedConfig, Scheduler};
//!
//! # fn main() -> shelfd::Result<()> {
//! let config = SchedConfig::load("shelf.toml")?;
//! let catalog = Arc::new(MemoryCatalog::new(&config));
//!
//! let mut sched = Scheduler::new(
//!     config,
//!     Arc::new(SimComposer::new()),
//!     catalog,
//!     Arc::new(SimLauncher::new()),
//! );
//! sched.start();
//!
//! // Examiners enqueue composed requests; copy workers report back
//! // through update_progress() and arcopy_complete().
//! sched.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Operator Control
//!
//! ```rust,no_run
//! use shelfd::{ExecControl, Scheduler};
//! # use std::sync::Arc;
//! # use shelfd::sim::{MemoryCatalog, SimComposer, SimLauncher};
//! # use shelfd::SchedConfig;
//!
//! # fn main() -> shelfd::Result<()> {
//! # let config = SchedConfig::default();
//! # let catalog = Arc::new(MemoryCatalog::new(&config));
//! # let sched = Scheduler::new(
//! #     config,
//! #     Arc::new(SimComposer::new()),
//! #     catalog,
//! #     Arc::new(SimLauncher::new()),
//! # );
//! // Pause removable archiving; running workers finish their file first.
//! sched.set_rm_state(ExecControl::Idle);
//!
//! // Resume everything and force a scan.
//! sched.set_rm_state(ExecControl::Run);
//! sched.run();
//!
//! println!("{}", sched.snapshot());
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod composer;
pub mod config;
pub mod devices;
pub mod error;
pub mod launcher;
pub mod queue;
pub mod request;
pub mod scheduler;
pub mod sim;
pub mod types;
pub mod volumes;

mod allocator;
mod arcopy;

// Re-export the types embedders touch day to day
pub use crate::catalog::Catalog;
pub use crate::composer::Composer;
pub use crate::config::SchedConfig;
pub use crate::error::{Result, SchedError};
pub use crate::launcher::ProcessLauncher;
pub use crate::request::ArchiveRequest;
pub use crate::scheduler::{DequeueOutcome, FsStatus, Scheduler, VolumeUser};
pub use crate::types::{
    ExecControl, ExecState, ExitStatus, InstanceName, MediaClass, MediaType, RequestName, Vsn,
};
