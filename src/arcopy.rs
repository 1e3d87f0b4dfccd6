//! Copy-worker lifecycle
//!
//! Starting a worker binds a copy instance to a worker slot, a process
//! id, and (for removable media) a drive. Completion unwinds all three
//! and decides whether the request stays active, spawns a more-work
//! entry, or goes back to the composer.

use crate::composer::Composer;
use crate::config::SchedConfig;
use crate::devices::DeviceTable;
use crate::error::{Result, SchedError};
use crate::launcher::{ProcessLauncher, COPY_PROG};
use crate::queue::{EntryId, EntryKind, QueueKind, Queues};
use crate::request::{ReqState, SlotState};
use crate::types::{ExecControl, ExitStatus, InstanceName};
use crate::volumes::OverflowTable;

/// Running copy workers, indexed by slot number. Overflow rows and
/// drive bookkeeping reference workers by this slot, so a slot frees
/// only when its worker's completion is processed.
#[derive(Debug)]
pub struct WorkerTable {
    slots: Vec<Option<InstanceName>>,
}

impl WorkerTable {
    pub fn new(capacity: usize) -> Self {
        WorkerTable {
            slots: vec![None; capacity.max(1)],
        }
    }

    /// Lowest free slot, not yet committed.
    pub fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    pub fn set(&mut self, slot: usize, name: InstanceName) {
        if let Some(s) = self.slots.get_mut(slot) {
            *s = Some(name);
        }
    }

    pub fn clear(&mut self, slot: usize) -> Option<InstanceName> {
        self.slots.get_mut(slot).and_then(|s| s.take())
    }

    pub fn get(&self, slot: usize) -> Option<&InstanceName> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    pub fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn iter_active(&self) -> impl Iterator<Item = (usize, &InstanceName)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|name| (i, name)))
    }
}

/// What the scheduler owes after a completion is processed.
#[derive(Debug)]
pub(crate) enum CompleteOutcome {
    /// Other instances still run; wake the scan if follow-up work queued.
    InProgress { wake: bool },
    /// Last instance finished; hand the request back to the composer.
    Finished(crate::request::ArchiveRequest),
}

/// Borrowed scheduler state for worker control.
pub(crate) struct CopyCtx<'a> {
    pub config: &'a SchedConfig,
    pub queues: &'a mut Queues,
    pub devices: &'a mut DeviceTable,
    pub workers: &'a mut WorkerTable,
    pub overflow: &'a mut OverflowTable,
    pub composer: &'a dyn Composer,
    pub launcher: &'a dyn ProcessLauncher,
}

impl CopyCtx<'_> {
    /// Start a worker for instance `copy` of `id`. False means the
    /// instance keeps its assignment but no worker runs.
    pub(crate) fn start_arcopy(&mut self, id: EntryId, copy: usize) -> bool {
        let (name, disk_instance, library, assignment, vol_space) =
            match self.queues.pool.request(id) {
                Some(req) => match req.instances.get(copy) {
                    Some(ci) => match ci.slot.assignment() {
                        Some(assignment) => (
                            req.name.clone(),
                            ci.flags.disk_instance,
                            ci.library,
                            assignment.clone(),
                            ci.vol_space,
                        ),
                        None => return false,
                    },
                    None => return false,
                },
                None => return false,
            };

        let Some(set) = self.config.find_set(&name.set) else {
            tracing::warn!(request = %name, "archive set vanished before start");
            return false;
        };
        let Some(slot) = self.workers.free_slot() else {
            tracing::warn!(request = %name, "no free worker slot");
            return false;
        };

        let mut drive = None;
        if !disk_instance {
            let Some(lib) = library else { return false };
            match self.devices.find_free_drive(lib) {
                Some(d) => drive = Some(d),
                None => return false,
            }
        }

        let mp = self.config.find_media(&assignment.media);
        let archmax = set.archmax_with(mp);
        let ovflmin = set.ovflmin_with(mp).unwrap_or(0);
        if let Some(req) = self.queues.pool.request_mut(id) {
            self.composer.make_tarballs(req, copy, archmax, ovflmin, vol_space);
        }

        let instance = name.instance(copy);
        let argv = vec![COPY_PROG.to_string(), instance.to_string()];
        let pid = match self.launcher.start(&argv) {
            Ok(pid) => pid,
            Err(err) => {
                tracing::warn!(instance = %instance, %err, "cannot start copy worker");
                return false;
            }
        };

        if let Some(d) = drive {
            self.devices.mark_busy(d, assignment.clone());
        }
        self.workers.set(slot, instance.clone());
        if let Some(req) = self.queues.pool.request_mut(id) {
            req.state = ReqState::Archive;
            if let Some(ci) = req.instances.get_mut(copy) {
                ci.worker = Some(slot);
                ci.pid = Some(pid);
                ci.drive = drive;
            }
        }
        tracing::info!(instance = %instance, pid, slot, vsn = %assignment.vsn, "copy worker started");
        true
    }

    /// Process a worker exit reported for `name`.
    pub(crate) fn arcopy_complete(
        &mut self,
        name: &InstanceName,
        exit: ExitStatus,
    ) -> Result<CompleteOutcome> {
        let req_name = name.request();
        let Some(id) = self.queues.archive.find(&self.queues.pool, &req_name) else {
            tracing::error!(instance = %name, "completion for unknown request");
            return Err(SchedError::UnknownRequest(req_name.to_string()));
        };
        let copy = name.copy;

        let (worker, drive, disk_instance, more) = {
            let req = self
                .queues
                .pool
                .request_mut(id)
                .ok_or_else(|| SchedError::UnknownRequest(req_name.to_string()))?;
            let ci = req
                .instances
                .get_mut(copy)
                .ok_or_else(|| SchedError::BadCopyIndex {
                    request: req_name.to_string(),
                    copy,
                })?;
            ci.slot = SlotState::Idle;
            ci.pid = None;
            let worker = ci.worker.take();
            let drive = ci.drive.take();
            let disk_instance = ci.flags.disk_instance;
            let more = ci.flags.more;
            ci.oprmsg = "Copy finished".to_string();
            (worker, drive, disk_instance, more)
        };

        if let Some(slot) = worker {
            self.workers.clear(slot);
            if !disk_instance {
                self.overflow.purge(slot);
            }
        }
        if !disk_instance {
            if let Some(d) = drive {
                self.devices.release(d);
            }
        }
        tracing::info!(instance = %name, code = exit.code, signal = ?exit.signal, "copy worker finished");

        let (any_active, cancelling, disk_class, priority) = {
            let req = self
                .queues
                .pool
                .request(id)
                .ok_or_else(|| SchedError::UnknownRequest(req_name.to_string()))?;
            (
                req.active_instances() > 0,
                req.flags.cancelling,
                req.class.is_disk_class(),
                req.sched_priority,
            )
        };

        if any_active {
            if !cancelling && !disk_class && more {
                // Hold the slot open until the follow-up is scheduled.
                if let Some(ci) = self
                    .queues
                    .pool
                    .request_mut(id)
                    .and_then(|r| r.instances.get_mut(copy))
                {
                    ci.slot = SlotState::AwaitingWork;
                }
                let pseudo = self.queues.pool.insert(EntryKind::MoreWork {
                    owner: id,
                    copy,
                    priority,
                });
                self.queues.enqueue(QueueKind::Schedule, pseudo);
                tracing::debug!(instance = %name, "more work queued");
                return Ok(CompleteOutcome::InProgress { wake: true });
            }
            return Ok(CompleteOutcome::InProgress { wake: false });
        }

        self.queues.unlink(id);
        match self.queues.pool.remove(id) {
            Some(EntryKind::Normal(mut req)) => {
                if exit.no_restart() {
                    req.flags.norestart = true;
                }
                tracing::info!(request = %req.name, "request drained");
                Ok(CompleteOutcome::Finished(req))
            }
            _ => Ok(CompleteOutcome::InProgress { wake: false }),
        }
    }

    /// Stop every running worker of `id`: idle lets each finish its
    /// current file, anything else terminates outright.
    pub(crate) fn stop_arcopys(&mut self, id: EntryId, ctrl: ExecControl) {
        let Some(req) = self.queues.pool.request_mut(id) else {
            return;
        };
        for ci in req.instances.iter_mut().filter(|ci| ci.slot.is_active()) {
            match ctrl {
                ExecControl::Idle => ci.flags.idled = true,
                _ => {
                    if let Some(pid) = ci.pid {
                        self.launcher.terminate(pid);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(seq: u32, copy: usize) -> InstanceName {
        InstanceName {
            fs: "fs1".into(),
            set: "as1".into(),
            seq,
            copy,
        }
    }

    #[test]
    fn test_worker_slots_reuse_lowest_free() {
        let mut table = WorkerTable::new(3);
        assert_eq!(table.free_slot(), Some(0));
        table.set(0, name(1, 0));
        table.set(1, name(2, 0));
        assert_eq!(table.free_slot(), Some(2));

        table.clear(0);
        assert_eq!(table.free_slot(), Some(0));
        assert_eq!(table.active(), 1);
        assert_eq!(table.get(1), Some(&name(2, 0)));
    }

    #[test]
    fn test_worker_table_full() {
        let mut table = WorkerTable::new(1);
        table.set(0, name(1, 0));
        assert_eq!(table.free_slot(), None);
        assert_eq!(table.capacity(), 1);
        let drained: Vec<_> = table.iter_active().map(|(i, _)| i).collect();
        assert_eq!(drained, vec![0]);
    }
}
