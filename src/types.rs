//! Core identity types shared across the scheduler
//!
//! - Media identity: [`MediaType`], [`Vsn`], [`MediaClass`]
//! - Request identity: [`RequestName`] (`fs.set.seq`) and the worker wire
//!   format [`InstanceName`] (`fs.set.seq.copy`)
//! - Worker exit status and the no-restart exit code

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};

/// Exit code a copy worker uses to report a failure that must not be retried.
pub const NORESTART_EXIT: i32 = 3;

/// Two-letter media type code, e.g. `li` (LTO), `dk` (disk pool).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MediaType(String);

impl MediaType {
    pub fn new(code: impl Into<String>) -> Self {
        MediaType(code.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MediaType {
    fn from(code: &str) -> Self {
        MediaType(code.to_string())
    }
}

/// Volume serial name, the external identity of a piece of media.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vsn(String);

impl Vsn {
    pub fn new(label: impl Into<String>) -> Self {
        Vsn(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Vsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Vsn {
    fn from(label: &str) -> Self {
        Vsn(label.to_string())
    }
}

/// Archiving class a request targets.
///
/// Disk and object-store archiving share the disk run/pause control;
/// removable media has its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaClass {
    Disk,
    Object,
    Removable,
}

impl MediaClass {
    /// True for classes governed by the disk archiving control.
    pub fn is_disk_class(self) -> bool {
        matches!(self, MediaClass::Disk | MediaClass::Object)
    }
}

/// Identity of one archive request: filesystem, archive set, sequence number.
///
/// Rendered as `fs.set.seq`. The filesystem name may not contain a dot;
/// the archive set name may.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestName {
    pub fs: String,
    pub set: String,
    pub seq: u32,
}

impl RequestName {
    pub fn new(fs: impl Into<String>, set: impl Into<String>, seq: u32) -> Self {
        RequestName {
            fs: fs.into(),
            set: set.into(),
            seq,
        }
    }

    /// Name of the copy instance `copy` of this request.
    pub fn instance(&self, copy: usize) -> InstanceName {
        InstanceName {
            fs: self.fs.clone(),
            set: self.set.clone(),
            seq: self.seq,
            copy,
        }
    }
}

impl fmt::Display for RequestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.fs, self.set, self.seq)
    }
}

/// Wire identity of one copy worker: `<fs>.<archiveSet>.<seq>.<copy>`.
///
/// This string is the worker's argv\[1\] and the completion lookup key, so
/// parsing must round-trip exactly. Decomposition order matters because the
/// archive set name may itself contain dots: the copy index is everything
/// after the last dot, the sequence number after the next-to-last, and the
/// first remaining dot separates filesystem from archive set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceName {
    pub fs: String,
    pub set: String,
    pub seq: u32,
    pub copy: usize,
}

impl InstanceName {
    pub fn request(&self) -> RequestName {
        RequestName {
            fs: self.fs.clone(),
            set: self.set.clone(),
            seq: self.seq,
        }
    }

    pub fn parse(name: &str) -> Result<Self> {
        let bad = || SchedError::BadInstanceName(name.to_string());

        let (rest, copy) = name.rsplit_once('.').ok_or_else(bad)?;
        let copy: usize = copy.parse().map_err(|_| bad())?;
        let (rest, seq) = rest.rsplit_once('.').ok_or_else(bad)?;
        let seq: u32 = seq.parse().map_err(|_| bad())?;
        let (fs, set) = rest.split_once('.').ok_or_else(bad)?;
        if fs.is_empty() || set.is_empty() {
            return Err(bad());
        }
        Ok(InstanceName {
            fs: fs.to_string(),
            set: set.to_string(),
            seq,
            copy,
        })
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.fs, self.set, self.seq, self.copy)
    }
}

impl FromStr for InstanceName {
    type Err = SchedError;

    fn from_str(s: &str) -> Result<Self> {
        InstanceName::parse(s)
    }
}

/// Decoded exit status of a copy worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        ExitStatus { code, signal: None }
    }

    pub fn signaled(signal: i32) -> Self {
        ExitStatus {
            code: -1,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.signal.is_none() && self.code == 0
    }

    /// True when the worker reported a failure that must not be retried.
    pub fn no_restart(&self) -> bool {
        self.signal.is_none() && self.code == NORESTART_EXIT
    }
}

/// Execution state of an archiving class or of the whole scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    Run,
    Wait,
}

/// Control applied to an archiving class, a filesystem, or the scheduler.
///
/// `Run` resumes. `Idle` lets workers finish their current file first.
/// `Stop` terminates workers immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecControl {
    Run,
    Idle,
    Stop,
}
