//! Resource assignment
//!
//! Decides how many drives a request may use, finds volumes for each
//! copy instance, and serves the two follow-up searches: overflow
//! volume grants for running workers and refills for instances that
//! finished a volume with files left over.
//!
//! All searches run with the scheduler lock held and work against the
//! shared candidate table, which every search resets on entry.

use crate::catalog::Catalog;
use crate::composer::Composer;
use crate::config::{ArchSet, SchedConfig};
use crate::devices::{DeviceTable, LibraryId};
use crate::queue::{EntryId, Queues};
use crate::request::{Alert, SlotState};
use crate::volumes::{CandidateTable, VolumeCandidate};

/// Outcome of a resource search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocOutcome {
    /// Resources assigned; the request can start copies.
    Ready,
    /// Drives or volumes are in use; retry on a later scan.
    Busy,
    /// No usable volumes exist right now.
    NoVolumes,
    /// The selection cannot be archived as composed.
    NotArchivable,
}

/// Operator alert deferred until the search settles.
struct PendingAlert {
    alert: Alert,
    detail: String,
}

/// Borrowed scheduler state for one search.
pub(crate) struct AllocCtx<'a> {
    pub config: &'a SchedConfig,
    pub queues: &'a mut Queues,
    pub devices: &'a mut DeviceTable,
    pub candidates: &'a mut CandidateTable,
    pub catalog: &'a dyn Catalog,
    pub composer: &'a dyn Composer,
    pending: Option<PendingAlert>,
}

/// Entry owning the volume a candidate describes, if any active copy
/// instance holds that cartridge.
fn cartridge_owner(queues: &Queues, vi: &VolumeCandidate) -> Option<EntryId> {
    for id in queues.archive.ids(&queues.pool) {
        let Some(req) = queues.pool.request(id) else { continue };
        for ci in &req.instances {
            if ci.slot.is_active()
                && ci.library == Some(vi.library)
                && ci.cat_slot == Some(vi.slot)
            {
                return Some(id);
            }
        }
    }
    None
}

/// Active copy instances drawing on the library's drives.
fn library_in_use(queues: &Queues, lib: LibraryId) -> u32 {
    let mut in_use = 0;
    for id in queues.archive.ids(&queues.pool) {
        let Some(req) = queues.pool.request(id) else { continue };
        for ci in &req.instances {
            if ci.slot.is_active() && ci.library == Some(lib) {
                in_use += 1;
            }
        }
    }
    in_use
}

/// Selected bytes queued anywhere for one archive set.
fn same_set_sel_space(queues: &Queues, set_name: &str) -> u64 {
    let mut total = 0;
    for queue in [&queues.schedule, &queues.archive, &queues.wait] {
        for id in queue.ids(&queues.pool) {
            if let Some(req) = queues.pool.request(id) {
                if req.name.set == set_name {
                    total += req.sel_space;
                }
            }
        }
    }
    total
}

impl<'a> AllocCtx<'a> {
    pub(crate) fn new(
        config: &'a SchedConfig,
        queues: &'a mut Queues,
        devices: &'a mut DeviceTable,
        candidates: &'a mut CandidateTable,
        catalog: &'a dyn Catalog,
        composer: &'a dyn Composer,
    ) -> Self {
        AllocCtx {
            config,
            queues,
            devices,
            candidates,
            catalog,
            composer,
            pending: None,
        }
    }

    /// Raise the deferred alert against `id`, once per queue residency.
    pub(crate) fn raise_pending(&mut self, id: EntryId) {
        let Some(PendingAlert { alert, detail }) = self.pending.take() else {
            return;
        };
        let Some(req) = self.queues.pool.request_mut(id) else {
            return;
        };
        if req.alerts.first(alert) {
            tracing::warn!(request = %req.name, alert = ?alert, detail = %detail, "archiving held up");
        }
    }

    /// Assign drives and volumes to a request already moved to the
    /// archive queue with cleared instances.
    pub(crate) fn find_resources(&mut self, id: EntryId, set: &ArchSet) -> AllocOutcome {
        let (class, req_drives, sel_files, sel_space, stage_vols, set_name) =
            match self.queues.pool.request(id) {
                Some(req) => (
                    req.class,
                    req.drives,
                    req.sel_files,
                    req.sel_space,
                    req.stage_vols,
                    req.name.set.clone(),
                ),
                None => return AllocOutcome::NotArchivable,
            };

        let mut drives_to_use = self.devices.class_allowance(class) as i64;

        // The set's own drive budget, one unless it spreads over drives.
        let mut as_drives = set.drives.unwrap_or(1) as i64;
        if as_drives > req_drives as i64 {
            as_drives = req_drives as i64;
        }
        if as_drives > 1 {
            if let Some(drivemin) = set.drivemin {
                if same_set_sel_space(self.queues, &set_name) < drivemin {
                    as_drives = 1;
                }
            }
        }

        // Charge drives already carrying copies of the same media class.
        for other in self.queues.archive.ids(&self.queues.pool) {
            if other == id {
                continue;
            }
            let Some(arb) = self.queues.pool.request(other) else { continue };
            if arb.class != class {
                continue;
            }
            for ci in &arb.instances {
                if !ci.slot.is_active() {
                    continue;
                }
                if arb.name.set == set_name {
                    as_drives -= 1;
                    if as_drives <= 0 {
                        if let Some(req) = self.queues.pool.request_mut(id) {
                            req.set_oprmsg("Waiting for drives: archive set busy");
                        }
                        return AllocOutcome::Busy;
                    }
                }
                drives_to_use -= 1;
                if drives_to_use <= 0 {
                    if let Some(req) = self.queues.pool.request_mut(id) {
                        req.set_oprmsg("Waiting for drives: all drives in use");
                    }
                    return AllocOutcome::Busy;
                }
            }
        }

        drives_to_use = drives_to_use.min(req_drives as i64).min(sel_files as i64);
        if stage_vols != 0 {
            drives_to_use = drives_to_use.min(stage_vols as i64);
        }
        if drives_to_use > 1 {
            // Do not spread thin streams over many drives.
            let min_size = match set.drivemin {
                Some(n) => n,
                None => set.archmax_with(None),
            };
            if min_size > 0 {
                let count = (sel_space / min_size) as i64;
                if count < drives_to_use {
                    drives_to_use = count;
                }
                if drives_to_use <= 0 {
                    drives_to_use = 1;
                }
            }
        }
        let drives_to_use = drives_to_use.max(0) as usize;

        let mut status;
        let mut drives_used = 0usize;
        if class.is_disk_class() {
            status = self.find_dk_volumes(id, set, drives_to_use);
            if status == AllocOutcome::Ready {
                if let Some(req) = self.queues.pool.request_mut(id) {
                    self.composer.divide_for_drives(req, set, drives_to_use);
                }
                let count = self.candidates.len();
                let mut vii = 0usize;
                let used = self
                    .queues
                    .pool
                    .request(id)
                    .map(|r| r.drives_used)
                    .unwrap_or(0);
                for copy in 0..used {
                    let vol = match self.candidates.get(vii) {
                        Some(v) => v.clone(),
                        None => break,
                    };
                    let Some(req) = self.queues.pool.request_mut(id) else { break };
                    let Some(ci) = req.instances.get_mut(copy) else { break };
                    if ci.files == 0 {
                        continue;
                    }
                    vii = (vii + 1) % count;
                    ci.flags.disk_instance = true;
                    ci.library = Some(vol.library);
                    ci.cat_slot = Some(vol.slot);
                    // Disk volumes grow; reserve only what the copy needs.
                    ci.vol_space = ci.space;
                    ci.slot = SlotState::Active(vol.assignment());
                    drives_used += 1;
                }
            }
        } else {
            status = AllocOutcome::Busy;
            let mut remaining = drives_to_use;
            while remaining > 0 {
                if let Some(req) = self.queues.pool.request_mut(id) {
                    self.composer.divide_for_drives(req, set, remaining);
                }
                self.pending = None;
                drives_used = 0;
                let used = self
                    .queues
                    .pool
                    .request(id)
                    .map(|r| r.drives_used)
                    .unwrap_or(0);
                for copy in 0..used {
                    let (files, space) = match self
                        .queues
                        .pool
                        .request(id)
                        .and_then(|r| r.instances.get(copy))
                    {
                        Some(ci) => (ci.files, ci.space),
                        None => break,
                    };
                    if files == 0 {
                        continue;
                    }
                    status = self.find_rm_volume(id, id, copy, set, space, false);
                    if status != AllocOutcome::Ready {
                        break;
                    }
                    let vol = match self.candidates.first() {
                        Some(v) => v.clone(),
                        None => break,
                    };
                    if let Some(ci) = self
                        .queues
                        .pool
                        .request_mut(id)
                        .and_then(|r| r.instances.get_mut(copy))
                    {
                        ci.library = Some(vol.library);
                        ci.cat_slot = Some(vol.slot);
                        ci.vol_space = vol.space;
                        ci.slot = SlotState::Active(vol.assignment());
                    }
                    drives_used += 1;
                    if drives_used >= remaining {
                        break;
                    }
                }
                if drives_used >= remaining {
                    break;
                }
                // Fewer volumes than drives; redivide over what was found.
                remaining = drives_used;
            }
        }

        if drives_used == 0 {
            self.raise_pending(id);
            return status;
        }
        if drives_used > 1 {
            if let Some(req) = self.queues.pool.request(id) {
                tracing::debug!(request = %req.name, drives = drives_used, "divided for drives");
            }
        }
        AllocOutcome::Ready
    }

    /// Fill the candidate table with disk or object volumes for the set.
    fn find_dk_volumes(&mut self, id: EntryId, set: &ArchSet, drives_to_use: usize) -> AllocOutcome {
        let min_space = self
            .queues
            .pool
            .request(id)
            .map(|r| r.min_space)
            .unwrap_or(0);
        self.candidates.clear();
        let mut tried = 0usize;
        while let Some(vi) = self.catalog.next_dk_volume(set, tried) {
            tried += 1;
            if vi.space >= min_space {
                self.candidates.push(vi);
            }
        }
        if !self.candidates.is_empty() {
            if set.fillvsns {
                // Fill the fullest volume first, one at a time.
                self.candidates.sort_disk(true);
                self.candidates.truncate(1);
            } else {
                self.candidates.sort_disk(false);
            }
            self.candidates.truncate(self.candidates.len().min(drives_to_use));
            let space_avail = self.candidates.total_space();
            if min_space < space_avail {
                return AllocOutcome::Ready;
            }
        }
        self.pending = Some(PendingAlert {
            alert: Alert::NoVolumes,
            detail: set.name.clone(),
        });
        if let Some(req) = self.queues.pool.request_mut(id) {
            req.set_oprmsg("Waiting for volumes");
        }
        AllocOutcome::NoVolumes
    }

    /// Find one removable volume with `space_required` free for instance
    /// `copy` of `source`. On `Ready` the winner is candidate 0 and
    /// `to_use` counts the volumes an overflow assignment spans.
    /// `requester` is the entry the search runs for; a reserved volume
    /// held by any other entry makes the whole search busy.
    pub(crate) fn find_rm_volume(
        &mut self,
        source: EntryId,
        requester: EntryId,
        copy: usize,
        set: &ArchSet,
        space_required: u64,
        volume_request: bool,
    ) -> AllocOutcome {
        let (min_space, owner, fs, joined) = match self
            .queues
            .pool
            .request(source)
            .and_then(|r| r.instances.get(copy).map(|ci| (ci, r)))
        {
            Some((ci, req)) => (
                ci.min_space,
                ci.owner.clone(),
                req.name.fs.clone(),
                req.flags.joined,
            ),
            None => return AllocOutcome::NotArchivable,
        };

        self.candidates.clear();
        self.pending = None;
        let mut fillvsns = false;
        let mut ovflmin: Option<u64> = None;
        let mut drives_in_use = false;
        let mut no_drives = true;
        let mut tried = 0usize;

        while let Some(vi) = self.catalog.next_rm_volume(set, tried, &owner, &fs) {
            if tried == 0 {
                fillvsns = set.fillvsns;
                ovflmin = set.ovflmin_with(self.config.find_media(&vi.media));
                if let Some(min) = ovflmin {
                    if min_space > min {
                        fillvsns = false;
                    }
                }
            }
            tried += 1;

            if fillvsns && vi.space < set.fillvsns_min {
                if let Err(err) = self.catalog.mark_volume_full(&vi) {
                    tracing::error!(vsn = %vi.vsn, %err, "cannot mark volume full");
                }
                continue;
            }
            match self.devices.library(vi.library) {
                Some(lib) if lib.avail > 0 => {}
                _ => continue,
            }
            no_drives = false;
            let in_use = library_in_use(self.queues, vi.library);
            if !self.devices.library_drive_free(vi.library, in_use) {
                drives_in_use = true;
                continue;
            }
            if vi.space < min_space && ovflmin.is_none() {
                continue;
            }

            self.candidates.push(vi);
            let idx = self.candidates.len() - 1;
            let owner_entry = self
                .candidates
                .get(idx)
                .and_then(|vi| cartridge_owner(self.queues, vi));
            if let Some(holder) = owner_entry {
                if let Some(vi) = self.candidates.get_mut(idx) {
                    vi.busy = true;
                }
                let reserved = self.candidates.get(idx).map(|v| v.reserved).unwrap_or(false);
                if holder != requester && reserved {
                    if let Some(req) = self.queues.pool.request_mut(source) {
                        req.set_oprmsg("Waiting for reserved volume in use");
                    }
                    return AllocOutcome::Busy;
                }
            }
            if fillvsns {
                continue;
            }
            let (busy, space) = match self.candidates.get(idx) {
                Some(v) => (v.busy, v.space),
                None => continue,
            };
            if !busy && space >= space_required {
                self.candidates.select_single(idx);
                return AllocOutcome::Ready;
            }
        }

        if self.candidates.is_empty() {
            if tried != 0 && drives_in_use {
                if let Some(req) = self.queues.pool.request_mut(source) {
                    req.set_oprmsg("Waiting for drives");
                }
                return AllocOutcome::Busy;
            }
            if tried != 0 && no_drives {
                if let Some(req) = self.queues.pool.request_mut(source) {
                    req.set_oprmsg("Waiting for drives to become available");
                }
                return AllocOutcome::Busy;
            }
            self.pending = Some(PendingAlert {
                alert: Alert::NoVolumes,
                detail: set.name.clone(),
            });
            if let Some(req) = self.queues.pool.request_mut(source) {
                req.set_oprmsg("Waiting for volumes");
            }
            return AllocOutcome::NoVolumes;
        }

        self.candidates.sort_removable(fillvsns);
        if self.candidates.first().map(|v| v.busy).unwrap_or(false) {
            if let Some(req) = self.queues.pool.request_mut(source) {
                req.set_oprmsg("Waiting for busy volume");
            }
            return AllocOutcome::Busy;
        }

        // No single volume held the whole stream; take the best one that
        // can still hold the smallest file.
        let pick = self
            .candidates
            .entries()
            .iter()
            .position(|v| v.space > min_space);
        if let Some(idx) = pick {
            self.candidates.select_single(idx);
            return AllocOutcome::Ready;
        }

        let req_name = self
            .queues
            .pool
            .request(source)
            .map(|r| r.name.to_string())
            .unwrap_or_default();
        if let Some(min) = ovflmin {
            // Span volumes until the stream fits.
            let mut avail_space = 0u64;
            let max_volumes = self.config.overflow_max_volumes;
            let mut satisfied = false;
            for idx in 0..self.candidates.len() {
                if self.candidates.to_use >= max_volumes {
                    break;
                }
                self.candidates.to_use += 1;
                avail_space += self.candidates.get(idx).map(|v| v.space).unwrap_or(0);
                if avail_space >= space_required {
                    satisfied = true;
                    break;
                }
            }
            if satisfied && volume_request {
                return AllocOutcome::Ready;
            }
            if !volume_request {
                if let Some(req) = self.queues.pool.request_mut(source) {
                    self.composer.select_fit(req, copy, avail_space, min);
                }
                let fits = self
                    .queues
                    .pool
                    .request(source)
                    .and_then(|r| r.instances.get(copy))
                    .map(|ci| ci.space > 0)
                    .unwrap_or(false);
                if fits {
                    return AllocOutcome::Ready;
                }
            }
            self.pending = Some(PendingAlert {
                alert: Alert::OverflowTooLarge,
                detail: req_name,
            });
            if let Some(req) = self.queues.pool.request_mut(source) {
                req.set_oprmsg("File too large for overflow volumes");
            }
            return AllocOutcome::NotArchivable;
        }

        if joined {
            self.pending = Some(PendingAlert {
                alert: Alert::JoinedTooLarge,
                detail: req_name,
            });
            if let Some(req) = self.queues.pool.request_mut(source) {
                req.set_oprmsg("Joined files too large for any volume");
            }
        } else {
            self.pending = Some(PendingAlert {
                alert: Alert::FileTooLarge,
                detail: req_name,
            });
            if let Some(req) = self.queues.pool.request_mut(source) {
                req.set_oprmsg("File too large for any volume");
            }
        }
        AllocOutcome::NotArchivable
    }

    /// Serve a worker's request for its next overflow volume. `Ready`
    /// means granted, or that the pseudo entry is stale and should go.
    pub(crate) fn find_overflow_volume(
        &mut self,
        pseudo: EntryId,
        owner: EntryId,
        copy: usize,
        pid: u32,
        set: &ArchSet,
    ) -> AllocOutcome {
        let space_required = match self
            .queues
            .pool
            .request(owner)
            .and_then(|r| r.instances.get(copy))
        {
            Some(ci) if ci.slot.is_active() && ci.pid == Some(pid) => {
                ci.space.saturating_sub(ci.bytes_written)
            }
            // Worker already gone; drop the request.
            _ => return AllocOutcome::Ready,
        };

        let status = self.find_rm_volume(owner, pseudo, copy, set, space_required, true);
        if status != AllocOutcome::Ready {
            self.raise_pending(owner);
            return status;
        }

        let vol = match self.candidates.first() {
            Some(v) => v.clone(),
            None => return AllocOutcome::Ready,
        };
        let mut drive = None;
        if let Some(ci) = self
            .queues
            .pool
            .request_mut(owner)
            .and_then(|r| r.instances.get_mut(copy))
        {
            ci.library = Some(vol.library);
            ci.cat_slot = Some(vol.slot);
            ci.slot = SlotState::Active(vol.assignment());
            ci.flags.volreq = false;
            drive = ci.drive;
        }
        if let Some(req) = self.queues.pool.request_mut(owner) {
            req.alerts.clear();
            tracing::info!(request = %req.name, copy, vsn = %vol.vsn, "overflow volume granted");
        }
        if let Some(drive) = drive {
            self.devices.mark_busy(drive, vol.assignment());
        }
        AllocOutcome::Ready
    }

    /// Refill instance `copy` of `owner` from the files its finished
    /// worker left behind and find it a volume. On failure the caller
    /// clears the instance.
    pub(crate) fn find_more_work(
        &mut self,
        owner: EntryId,
        copy: usize,
        set: &ArchSet,
    ) -> AllocOutcome {
        let Some(req) = self.queues.pool.request_mut(owner) else {
            return AllocOutcome::NotArchivable;
        };
        self.composer.select_for_copy(req, set, copy);
        self.pending = None;

        let space = match self
            .queues
            .pool
            .request(owner)
            .and_then(|r| r.instances.get(copy))
        {
            Some(ci) if ci.files != 0 => ci.space,
            _ => return AllocOutcome::NotArchivable,
        };

        let status = self.find_rm_volume(owner, owner, copy, set, space, false);
        if status != AllocOutcome::Ready {
            self.raise_pending(owner);
            return status;
        }
        let vol = match self.candidates.first() {
            Some(v) => v.clone(),
            None => return AllocOutcome::NotArchivable,
        };
        if let Some(ci) = self
            .queues
            .pool
            .request_mut(owner)
            .and_then(|r| r.instances.get_mut(copy))
        {
            ci.library = Some(vol.library);
            ci.cat_slot = Some(vol.slot);
            ci.vol_space = vol.space;
            ci.slot = SlotState::Active(vol.assignment());
        }
        AllocOutcome::Ready
    }
}
