//! Archive requests and their copy instances
//!
//! An [`ArchiveRequest`] is one scheduling unit: a batch of files for one
//! archive set. Each request carries one [`CopyInstance`] per drive it may
//! use; an instance is active exactly while a copy worker holds it.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::ArchSet;
use crate::devices::{DriveId, LibraryId};
use crate::types::{MediaClass, MediaType, RequestName, Vsn};

/// Lower clamp for scheduling priorities.
pub const PRIORITY_MIN: f64 = -1.0e8;
/// Upper clamp for scheduling priorities.
pub const PRIORITY_MAX: f64 = 1.0e8;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReqState {
    /// Owned by the composer; not schedulable yet.
    Compose,
    /// Queued for resource assignment.
    Schedule,
    /// Copy workers started.
    Archive,
    /// All files processed; to be returned.
    Done,
}

/// One-shot operator alerts a request may raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    NoVolumes = 0x01,
    OverflowTooLarge = 0x02,
    FileTooLarge = 0x04,
    JoinedTooLarge = 0x08,
    QueueAge = 0x10,
}

/// Set of alerts already raised for a request.
///
/// Each alert fires once per queue residency; the set clears when workers
/// start or the request goes back to the composer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlertSet(u8);

impl AlertSet {
    /// True the first time `alert` is raised, false on repeats.
    pub fn first(&mut self, alert: Alert) -> bool {
        let bit = alert as u8;
        if self.0 & bit != 0 {
            return false;
        }
        self.0 |= bit;
        true
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Volume held by an active copy instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeAssignment {
    pub media: MediaType,
    pub vsn: Vsn,
}

/// Activity state of one copy instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SlotState {
    /// No worker; the instance is free.
    #[default]
    Idle,
    /// Worker finished its volume but a more-work entry is pending for it.
    AwaitingWork,
    /// Worker holds this volume.
    Active(VolumeAssignment),
}

impl SlotState {
    /// The sole "is this instance active" predicate.
    pub fn is_active(&self) -> bool {
        !matches!(self, SlotState::Idle)
    }

    pub fn assignment(&self) -> Option<&VolumeAssignment> {
        match self {
            SlotState::Active(assignment) => Some(assignment),
            _ => None,
        }
    }
}

/// Status flags on a copy instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct CiFlags {
    /// Disk or object-store instance; holds no library drive.
    pub disk_instance: bool,
    /// More files remain that this instance could take after finishing.
    pub more: bool,
    /// Told to stop after the current file.
    pub idled: bool,
    /// Waiting on an overflow volume grant.
    pub volreq: bool,
}

/// Per-drive slot inside a request.
#[derive(Debug, Clone, Default)]
pub struct CopyInstance {
    pub slot: SlotState,
    /// Library holding the assigned volume. Cleared during an overflow
    /// volume request so the drive appears free to the searches.
    pub library: Option<LibraryId>,
    /// Catalog slot of the assigned cartridge within its library.
    pub cat_slot: Option<u32>,
    /// Physical drive held (removable media only).
    pub drive: Option<DriveId>,
    /// Worker-slot table index while running.
    pub worker: Option<usize>,
    pub pid: Option<u32>,
    /// Files selected for this instance.
    pub files: u64,
    /// Bytes selected for this instance.
    pub space: u64,
    /// Size of the smallest selected file.
    pub min_space: u64,
    /// Free space on the assigned volume at assignment time.
    pub vol_space: u64,
    /// Bytes the worker has reported written.
    pub bytes_written: u64,
    /// Owner key when the set divides work by owner.
    pub owner: String,
    /// Operator message; instance 0 carries the request-level reason.
    pub oprmsg: String,
    pub flags: CiFlags,
}

impl CopyInstance {
    pub fn clear(&mut self) {
        *self = CopyInstance::default();
    }
}

/// Request-level status flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReqFlags {
    /// Some selected files are offline and need staging.
    pub offline: bool,
    /// Files are joined into one archive file and cannot be split.
    pub joined: bool,
    /// All selected files were non-stageable when last checked.
    pub nonstage: bool,
    /// A worker exited with the no-restart code.
    pub norestart: bool,
    /// Being returned to the composer unprocessed.
    pub unqueue: bool,
    /// Workers could not be started for found resources.
    pub sched_err: bool,
    /// Removal requested while active; drain without new work.
    pub cancelling: bool,
}

/// One scheduling unit: a batch of files bound for one archive set.
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub name: RequestName,
    pub state: ReqState,
    pub class: MediaClass,
    /// Number of copy-instance slots (the set's drive limit at compose time).
    pub drives: usize,
    /// Instances the current division actually populated.
    pub drives_used: usize,
    pub sel_files: u64,
    pub sel_space: u64,
    /// Size of the smallest selected file.
    pub min_space: u64,
    /// Distinct volumes needed to stage offline files; 0 when unknown.
    pub stage_vols: u64,
    /// Base priority assigned by the composer.
    pub priority: f64,
    /// Priority used for queue ordering.
    pub sched_priority: f64,
    pub flags: ReqFlags,
    pub queued_at: DateTime<Utc>,
    pub alerts: AlertSet,
    pub instances: Vec<CopyInstance>,
}

impl ArchiveRequest {
    pub fn new(name: RequestName, class: MediaClass, drives: usize) -> Self {
        let drives = drives.max(1);
        ArchiveRequest {
            name,
            state: ReqState::Schedule,
            class,
            drives,
            drives_used: 0,
            sel_files: 0,
            sel_space: 0,
            min_space: 0,
            stage_vols: 0,
            priority: 0.0,
            sched_priority: 0.0,
            flags: ReqFlags::default(),
            queued_at: Utc::now(),
            alerts: AlertSet::default(),
            instances: vec![CopyInstance::default(); drives],
        }
    }

    /// Reset performed when the composer hands the request over.
    pub fn reset_for_schedule(&mut self) {
        self.sched_priority = self.priority;
        self.alerts.clear();
        for ci in &mut self.instances {
            ci.clear();
        }
    }

    /// Clear every instance ahead of a fresh resource assignment.
    pub fn clear_instances(&mut self) {
        for ci in &mut self.instances {
            ci.clear();
        }
    }

    pub fn active_instances(&self) -> usize {
        self.instances
            .iter()
            .filter(|ci| ci.slot.is_active())
            .count()
    }

    /// Request-level operator message lives on instance 0.
    pub fn set_oprmsg(&mut self, msg: impl Into<String>) {
        if let Some(ci) = self.instances.first_mut() {
            ci.oprmsg = msg.into();
        }
    }

    pub fn clear_oprmsg(&mut self) {
        if let Some(ci) = self.instances.first_mut() {
            ci.oprmsg.clear();
        }
    }

    pub fn oprmsg(&self) -> &str {
        self.instances.first().map(|ci| ci.oprmsg.as_str()).unwrap_or("")
    }

    /// Scheduling priority after resource assignment: base plus loaded,
    /// offline, and overflow bonuses, clamped.
    pub fn scheduling_priority(
        &self,
        set: &ArchSet,
        first_volume_loaded: bool,
        volumes_to_use: usize,
    ) -> f64 {
        let mut priority = self.priority;
        if first_volume_loaded {
            priority += set.priority_loaded;
        }
        if self.flags.offline {
            priority += set.priority_offline;
        }
        if volumes_to_use > 1 {
            priority += set.priority_overflow;
        }
        priority.clamp(PRIORITY_MIN, PRIORITY_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_set(loaded: f64, offline: f64, overflow: f64) -> ArchSet {
        ArchSet {
            name: "as1".into(),
            media: MediaType::from("li"),
            drives: None,
            drivemin: None,
            drivemax: None,
            archmax: None,
            ovflmin: None,
            fillvsns: false,
            fillvsns_min: 0,
            reserve_owner: false,
            queue_time_secs: 24 * 3600,
            priority_loaded: loaded,
            priority_offline: offline,
            priority_overflow: overflow,
            vsns: Vec::new(),
        }
    }

    fn test_request() -> ArchiveRequest {
        ArchiveRequest::new(
            RequestName::new("fs1", "as1", 1),
            MediaClass::Removable,
            2,
        )
    }

    #[test]
    fn test_priority_bonuses_and_clamp() {
        let set = test_set(10.0, 5.0, 2.5);
        let mut req = test_request();
        req.priority = 100.0;

        assert_eq!(req.scheduling_priority(&set, false, 1), 100.0);
        assert_eq!(req.scheduling_priority(&set, true, 1), 110.0);
        req.flags.offline = true;
        assert_eq!(req.scheduling_priority(&set, true, 2), 117.5);

        req.priority = PRIORITY_MAX;
        assert_eq!(req.scheduling_priority(&set, true, 2), PRIORITY_MAX);
        req.priority = PRIORITY_MIN;
        let set = test_set(-10.0, -5.0, 0.0);
        assert_eq!(req.scheduling_priority(&set, true, 1), PRIORITY_MIN);
    }

    #[test]
    fn test_alerts_fire_once() {
        let mut alerts = AlertSet::default();
        assert!(alerts.first(Alert::NoVolumes));
        assert!(!alerts.first(Alert::NoVolumes));
        assert!(alerts.first(Alert::QueueAge));
        alerts.clear();
        assert!(alerts.first(Alert::NoVolumes));
    }

    #[test]
    fn test_slot_state_activity() {
        let mut ci = CopyInstance::default();
        assert!(!ci.slot.is_active());
        ci.slot = SlotState::AwaitingWork;
        assert!(ci.slot.is_active());
        assert!(ci.slot.assignment().is_none());
        ci.slot = SlotState::Active(VolumeAssignment {
            media: MediaType::from("li"),
            vsn: Vsn::from("VOL001"),
        });
        assert!(ci.slot.is_active());
        assert_eq!(ci.slot.assignment().unwrap().vsn.as_str(), "VOL001");
    }

    #[test]
    fn test_reset_clears_instances_and_alerts() {
        let mut req = test_request();
        req.priority = 7.0;
        req.sched_priority = 99.0;
        req.alerts.first(Alert::NoVolumes);
        req.instances[1].slot = SlotState::AwaitingWork;
        req.set_oprmsg("waiting");

        req.reset_for_schedule();
        assert_eq!(req.sched_priority, 7.0);
        assert_eq!(req.active_instances(), 0);
        assert_eq!(req.oprmsg(), "");
        assert!(req.alerts.first(Alert::NoVolumes));
    }
}
