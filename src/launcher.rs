//! Copy-worker process control
//!
//! Workers are separate processes; the scheduler starts them with an
//! instance name on the command line and learns of their exit through
//! [`crate::scheduler::Scheduler::arcopy_complete`].

use crate::error::Result;

/// Program name workers are started under.
pub const COPY_PROG: &str = "shelf-copy";

/// Starts and stops copy workers.
pub trait ProcessLauncher: Send + Sync {
    /// Start a worker. `argv[0]` is [`COPY_PROG`], `argv[1]` the
    /// instance name. Returns the process id.
    fn start(&self, argv: &[String]) -> Result<u32>;

    /// Terminate a worker immediately.
    fn terminate(&self, pid: u32);
}
