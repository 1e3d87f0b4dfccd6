//! Scheduling state machine
//!
//! One mutex-guarded [`Core`] holds the three request queues, the device
//! and worker tables, and the control states. A background thread waits
//! on a condition variable with a bounded poll interval and runs a scan
//! on every wake: device refresh, wait-queue requeue when requested, the
//! scheduling pass itself, then queue-age checks. Every public operation
//! takes the same lock, so operations and scans never interleave.
//!
//! Requests handed back to the composer are collected under the lock and
//! delivered after it is released, so composer callbacks may call back
//! into the scheduler freely.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use chrono::Utc;
use parking_lot::{Condvar, Mutex};
use serde_json::json;

use crate::allocator::{AllocCtx, AllocOutcome};
use crate::arcopy::{CompleteOutcome, CopyCtx, WorkerTable};
use crate::catalog::Catalog;
use crate::composer::Composer;
use crate::config::SchedConfig;
use crate::devices::DeviceTable;
use crate::error::{Result, SchedError};
use crate::launcher::ProcessLauncher;
use crate::queue::{EntryId, EntryKind, EntryPool, Queue, QueueKind, Queues};
use crate::request::{Alert, ArchiveRequest, ReqState};
use crate::types::{
    ExecControl, ExecState, ExitStatus, InstanceName, MediaType, RequestName, Vsn,
};
use crate::volumes::{CandidateTable, OverflowTable};

/// Mount and control state of one archiving file system.
#[derive(Debug, Clone, Copy)]
pub struct FsStatus {
    pub mounted: bool,
    pub unmounting: bool,
    pub exec: ExecState,
}

/// Result of removing a request by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DequeueOutcome {
    /// Removed from a queue and returned to the composer.
    Removed,
    /// Workers are running; they were told to stop and the request
    /// drains through completion.
    Draining,
    NotFound,
}

/// Current user of a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeUser {
    pub request: RequestName,
    pub copy: usize,
    /// Pinned by a worker that overflowed past it rather than held as a
    /// live assignment.
    pub overflow: bool,
}

/// Why requests are sitting in the wait queue. Folded into the posted
/// operator message; cleared when the wait queue empties or a requeue
/// re-evaluates everything.
#[derive(Debug, Clone, Copy, Default)]
struct WaitFlags {
    /// A worker exited with the no-restart code.
    acnors: bool,
    dk_idle: bool,
    rm_idle: bool,
    /// Resources were found but no worker could be started.
    schedule: bool,
    stage_vol: bool,
}

impl WaitFlags {
    fn reasons(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.acnors {
            out.push("shelf-copy error");
        }
        if self.dk_idle {
            out.push("disk run command");
        }
        if self.rm_idle {
            out.push("removable run command");
        }
        if self.schedule {
            out.push("schedule error");
        }
        if self.stage_vol {
            out.push("stage volumes");
        }
        out
    }
}

struct WakeState {
    count: u64,
    shut_down: bool,
}

/// Wakeups posted while a scan holds the main lock must not be lost, so
/// the counter lives under its own small mutex.
struct WakeSignal {
    state: Mutex<WakeState>,
    cond: Condvar,
}

impl WakeSignal {
    fn new() -> Self {
        WakeSignal {
            state: Mutex::new(WakeState {
                count: 0,
                shut_down: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn wake(&self) {
        let mut st = self.state.lock();
        st.count += 1;
        self.cond.notify_one();
    }

    fn shutdown(&self) {
        let mut st = self.state.lock();
        st.shut_down = true;
        self.cond.notify_all();
    }

    fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Block until woken, the timeout passes, or shutdown. False means
    /// shut down.
    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = self.state.lock();
        while st.count == 0 && !st.shut_down {
            if self.cond.wait_until(&mut st, deadline).timed_out() {
                break;
            }
        }
        st.count = 0;
        !st.shut_down
    }
}

/// Everything the lock protects.
struct Core {
    queues: Queues,
    devices: DeviceTable,
    candidates: CandidateTable,
    overflow: OverflowTable,
    workers: WorkerTable,
    fs_status: AHashMap<String, FsStatus>,
    dk_state: ExecState,
    rm_state: ExecState,
    global_state: ExecState,
    /// A media robot restarted; note it on the next scan.
    robot_restart: bool,
    /// Drain the wait queue back to the composer on the next scan.
    requeue_check: bool,
    wait_flags: WaitFlags,
    /// Posted operator message for the scheduler as a whole.
    oprmsg: String,
    /// Requests left unscheduled by the last scan.
    waiting: usize,
    /// Requests to hand back to the composer once the lock is released.
    pending_requeue: Vec<ArchiveRequest>,
}

struct Shared {
    config: SchedConfig,
    composer: Arc<dyn Composer>,
    catalog: Arc<dyn Catalog>,
    launcher: Arc<dyn ProcessLauncher>,
    core: Mutex<Core>,
    wake: WakeSignal,
}

/// Handle to the scheduling state machine.
///
/// Cheap to share before [`Scheduler::start`]; all operations take
/// `&self` and are safe from any thread. Dropping the handle stops the
/// scheduling thread but leaves started copy workers to finish on their
/// own.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

fn alloc_ctx<'a>(core: &'a mut Core, shared: &'a Shared) -> AllocCtx<'a> {
    AllocCtx::new(
        &shared.config,
        &mut core.queues,
        &mut core.devices,
        &mut core.candidates,
        shared.catalog.as_ref(),
        shared.composer.as_ref(),
    )
}

fn copy_ctx<'a>(core: &'a mut Core, shared: &'a Shared) -> CopyCtx<'a> {
    CopyCtx {
        config: &shared.config,
        queues: &mut core.queues,
        devices: &mut core.devices,
        workers: &mut core.workers,
        overflow: &mut core.overflow,
        composer: shared.composer.as_ref(),
        launcher: shared.launcher.as_ref(),
    }
}

impl Scheduler {
    pub fn new(
        config: SchedConfig,
        composer: Arc<dyn Composer>,
        catalog: Arc<dyn Catalog>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let devices = DeviceTable::from_config(&config);
        let worker_slots: usize = config.libraries.iter().map(|l| l.drives as usize).sum();
        let fs_status = config
            .filesystems
            .iter()
            .map(|fs| {
                (
                    fs.name.clone(),
                    FsStatus {
                        mounted: fs.mounted,
                        unmounting: false,
                        exec: ExecState::Run,
                    },
                )
            })
            .collect();
        let core = Core {
            queues: Queues::new(),
            devices,
            candidates: CandidateTable::default(),
            overflow: OverflowTable::new(),
            workers: WorkerTable::new(worker_slots),
            fs_status,
            dk_state: ExecState::Run,
            rm_state: ExecState::Run,
            global_state: ExecState::Run,
            robot_restart: false,
            requeue_check: false,
            wait_flags: WaitFlags::default(),
            oprmsg: "Idle".to_string(),
            waiting: 0,
            pending_requeue: Vec::new(),
        };
        Scheduler {
            shared: Arc::new(Shared {
                config,
                composer,
                catalog,
                launcher,
                core: Mutex::new(core),
                wake: WakeSignal::new(),
            }),
            thread: None,
        }
    }

    /// Start the scheduling thread. Idempotent.
    pub fn start(&mut self) {
        if self.thread.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        self.thread = Some(thread::spawn(move || run_loop(&shared)));
    }

    /// Stop the scheduling thread and wait for it. Copy workers already
    /// started keep running; their completions can still be reported.
    pub fn shutdown(&mut self) {
        self.shared.wake.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Run the operation under the lock, then deliver any requests the
    /// operation handed back to the composer.
    fn exec<R>(&self, f: impl FnOnce(&mut Core, &Shared) -> R) -> R {
        let (out, pending) = {
            let mut guard = self.shared.core.lock();
            let core = &mut *guard;
            let out = f(core, &self.shared);
            (out, std::mem::take(&mut core.pending_requeue))
        };
        for req in pending {
            self.shared.composer.requeue(req);
        }
        out
    }

    /// Accept a composed request for scheduling. Requests that cannot
    /// proceed yet go straight to the wait queue with an operator
    /// message; the rest enter the schedule queue and wake the scan.
    pub fn enqueue(&self, mut req: ArchiveRequest) -> Result<()> {
        if self.shared.wake.is_shut_down() {
            return Err(SchedError::ShutDown);
        }
        let wake = self.exec(move |core, shared| {
            req.state = ReqState::Schedule;
            req.reset_for_schedule();
            let wait = wait_arch_req(
                &core.fs_status,
                core.dk_state,
                core.rm_state,
                &mut core.wait_flags,
                shared.composer.as_ref(),
                &mut req,
            );
            tracing::info!(request = %req.name, priority = req.priority, wait, "request enqueued");
            let id = core.queues.pool.insert(EntryKind::Normal(req));
            if wait {
                core.queues.enqueue(QueueKind::Wait, id);
                rebuild_wait_message(core);
                false
            } else {
                core.queues.enqueue(QueueKind::Schedule, id);
                true
            }
        });
        if wake {
            self.shared.wake.wake();
        }
        Ok(())
    }

    /// Remove a request by name. Queued requests come out immediately
    /// and return to the composer; a request with running workers is
    /// marked cancelling and drains through their completions.
    pub fn dequeue(&self, name: &RequestName) -> DequeueOutcome {
        self.exec(|core, shared| {
            if let Some(id) = core.queues.wait.find(&core.queues.pool, name) {
                if let Some(mut req) = take_request(core, id) {
                    req.flags.unqueue = true;
                    core.pending_requeue.push(req);
                }
                rebuild_wait_message(core);
                return DequeueOutcome::Removed;
            }
            if let Some(id) = core.queues.schedule.find(&core.queues.pool, name) {
                if let Some(mut req) = take_request(core, id) {
                    req.flags.unqueue = true;
                    core.pending_requeue.push(req);
                }
                return DequeueOutcome::Removed;
            }
            if let Some(id) = core.queues.archive.find(&core.queues.pool, name) {
                if let Some(req) = core.queues.pool.request_mut(id) {
                    req.flags.cancelling = true;
                }
                let mut ctx = copy_ctx(core, shared);
                ctx.stop_arcopys(id, ExecControl::Stop);
                tracing::info!(request = %name, "draining for dequeue");
                return DequeueOutcome::Draining;
            }
            DequeueOutcome::NotFound
        })
    }

    /// A worker hit the end of its volume and wants another for
    /// `file_size` bytes still to write. Policy refusals come back as
    /// [`SchedError::OverflowNotAllowed`]; on success the worker holds
    /// its drive and a volume-request entry competes in the schedule
    /// queue at the request's priority.
    pub fn request_volume(&self, instance: &InstanceName, file_size: u64) -> Result<()> {
        if self.shared.wake.is_shut_down() {
            return Err(SchedError::ShutDown);
        }
        let outcome = self.exec(|core, shared| {
            let req_name = instance.request();
            let Some(id) = core.queues.archive.find(&core.queues.pool, &req_name) else {
                return Err(SchedError::UnknownRequest(req_name.to_string()));
            };
            let set = shared
                .config
                .find_set(&instance.set)
                .ok_or_else(|| SchedError::UnknownArchSet(instance.set.clone()))?;

            let (assignment, worker, pid, priority) = {
                let req = core
                    .queues
                    .pool
                    .request(id)
                    .ok_or_else(|| SchedError::UnknownRequest(req_name.to_string()))?;
                let priority = req.sched_priority;
                let ci = req.instances.get(instance.copy).ok_or_else(|| {
                    SchedError::BadCopyIndex {
                        request: req_name.to_string(),
                        copy: instance.copy,
                    }
                })?;
                let assignment = ci
                    .slot
                    .assignment()
                    .cloned()
                    .ok_or_else(|| SchedError::UnknownRequest(instance.to_string()))?;
                let worker = ci
                    .worker
                    .ok_or_else(|| SchedError::UnknownRequest(instance.to_string()))?;
                (assignment, worker, ci.pid.unwrap_or(0), priority)
            };

            let ovflmin = set
                .ovflmin_with(shared.config.find_media(&assignment.media))
                .ok_or_else(|| SchedError::OverflowNotAllowed(instance.to_string()))?;
            if file_size < ovflmin {
                return Err(SchedError::OverflowNotAllowed(instance.to_string()));
            }

            // The full volume stays pinned to the worker until it exits.
            core.overflow
                .record(assignment.media.clone(), assignment.vsn.clone(), worker);
            if let Some(ci) = core
                .queues
                .pool
                .request_mut(id)
                .and_then(|r| r.instances.get_mut(instance.copy))
            {
                ci.library = None;
                ci.flags.volreq = true;
            }
            let pseudo = core.queues.pool.insert(EntryKind::VolumeRequest {
                owner: id,
                copy: instance.copy,
                pid,
                priority,
            });
            core.queues.enqueue(QueueKind::Schedule, pseudo);
            tracing::info!(instance = %instance, file_size, vsn = %assignment.vsn, "volume overflow requested");
            Ok(())
        });
        if outcome.is_ok() {
            self.shared.wake.wake();
        }
        outcome
    }

    /// Re-evaluate everything held in the wait queue.
    pub fn run(&self) {
        self.exec(|core, _| {
            core.requeue_check = true;
        });
        self.shared.wake.wake();
    }

    /// Control disk and object-store archiving. Anything but run pauses
    /// the class and stops its workers with `ctrl` semantics.
    pub fn set_dk_state(&self, ctrl: ExecControl) {
        self.exec(|core, shared| {
            tracing::info!(ctrl = ?ctrl, "disk archiving control");
            if ctrl == ExecControl::Run {
                core.dk_state = ExecState::Run;
                return;
            }
            core.dk_state = ExecState::Wait;
            for id in core.queues.archive.ids(&core.queues.pool) {
                let hit = core
                    .queues
                    .pool
                    .request(id)
                    .map(|req| req.class.is_disk_class())
                    .unwrap_or(false);
                if hit {
                    let mut ctx = copy_ctx(core, shared);
                    ctx.stop_arcopys(id, ctrl);
                }
            }
        });
    }

    /// Control removable-media archiving.
    pub fn set_rm_state(&self, ctrl: ExecControl) {
        self.exec(|core, shared| {
            tracing::info!(ctrl = ?ctrl, "removable archiving control");
            if ctrl == ExecControl::Run {
                core.rm_state = ExecState::Run;
                return;
            }
            core.rm_state = ExecState::Wait;
            for id in core.queues.archive.ids(&core.queues.pool) {
                let hit = core
                    .queues
                    .pool
                    .request(id)
                    .map(|req| !req.class.is_disk_class())
                    .unwrap_or(false);
                if hit {
                    let mut ctx = copy_ctx(core, shared);
                    ctx.stop_arcopys(id, ctrl);
                }
            }
        });
    }

    /// A media robot came back; device state is revalidated on the next
    /// scan.
    pub fn robot_started(&self) {
        self.exec(|core, _| {
            core.robot_restart = true;
        });
    }

    /// A media robot went away. Removable workers are terminated so
    /// they cannot hang on devices that no longer exist; the removable
    /// control state is left alone.
    pub fn robot_stopped(&self) {
        self.exec(|core, shared| {
            tracing::info!("robot stopped; terminating removable workers");
            for id in core.queues.archive.ids(&core.queues.pool) {
                let hit = core
                    .queues
                    .pool
                    .request(id)
                    .map(|req| !req.class.is_disk_class())
                    .unwrap_or(false);
                if hit {
                    let mut ctx = copy_ctx(core, shared);
                    ctx.stop_arcopys(id, ExecControl::Stop);
                }
            }
        });
    }

    /// Control archiving for one file system. Anything but run stops
    /// the file system's workers and moves its scheduled requests to
    /// the wait queue.
    pub fn set_fs_state(&self, fs: &str, ctrl: ExecControl) -> Result<()> {
        self.exec(|core, shared| {
            match core.fs_status.get_mut(fs) {
                Some(st) => {
                    st.exec = if ctrl == ExecControl::Run {
                        ExecState::Run
                    } else {
                        ExecState::Wait
                    };
                }
                None => return Err(SchedError::UnknownFileSystem(fs.to_string())),
            }
            tracing::info!(fs, ctrl = ?ctrl, "file system archiving control");
            if ctrl == ExecControl::Run {
                return Ok(());
            }
            for id in core.queues.archive.ids(&core.queues.pool) {
                let hit = core
                    .queues
                    .pool
                    .request(id)
                    .map(|req| req.name.fs == fs)
                    .unwrap_or(false);
                if hit {
                    let mut ctx = copy_ctx(core, shared);
                    ctx.stop_arcopys(id, ctrl);
                }
            }
            for id in core.queues.schedule.ids(&core.queues.pool) {
                let moved = {
                    let Some(entry) = core.queues.pool.get_mut(id) else {
                        continue;
                    };
                    let Some(req) = entry.kind.request_mut() else {
                        continue;
                    };
                    if req.name.fs != fs {
                        continue;
                    }
                    wait_arch_req(
                        &core.fs_status,
                        core.dk_state,
                        core.rm_state,
                        &mut core.wait_flags,
                        shared.composer.as_ref(),
                        req,
                    )
                };
                if moved {
                    core.queues.requeue(id, QueueKind::Wait);
                }
            }
            rebuild_wait_message(core);
            Ok(())
        })
    }

    /// Record a mount-state change observed by the daemon.
    pub fn set_fs_status(&self, fs: &str, mounted: bool, unmounting: bool) -> Result<()> {
        self.exec(|core, _| match core.fs_status.get_mut(fs) {
            Some(st) => {
                st.mounted = mounted;
                st.unmounting = unmounting;
                tracing::debug!(fs, mounted, unmounting, "file system status");
                Ok(())
            }
            None => Err(SchedError::UnknownFileSystem(fs.to_string())),
        })
    }

    /// Pause or resume the scheduler as a whole. Resuming also drains
    /// the wait queue so held requests are re-evaluated.
    pub fn set_global_state(&self, ctrl: ExecControl) {
        self.exec(|core, _| {
            if ctrl == ExecControl::Run {
                core.global_state = ExecState::Run;
                core.requeue_check = true;
            } else {
                core.global_state = ExecState::Wait;
            }
            tracing::info!(ctrl = ?ctrl, "scheduler control");
        });
        self.shared.wake.wake();
    }

    /// Who is using the volume, if anyone. Live instance assignments
    /// are checked first, then volumes pinned by overflow.
    pub fn get_vol_status(&self, media: &MediaType, vsn: &Vsn) -> Option<VolumeUser> {
        self.exec(|core, _| {
            for id in core.queues.archive.ids(&core.queues.pool) {
                let Some(req) = core.queues.pool.request(id) else {
                    continue;
                };
                for (copy, ci) in req.instances.iter().enumerate() {
                    if let Some(a) = ci.slot.assignment() {
                        if a.media == *media && a.vsn == *vsn {
                            return Some(VolumeUser {
                                request: req.name.clone(),
                                copy,
                                overflow: false,
                            });
                        }
                    }
                }
            }
            let slot = core.overflow.find(media, vsn)?;
            let name = core.workers.get(slot)?;
            Some(VolumeUser {
                request: name.request(),
                copy: name.copy,
                overflow: true,
            })
        })
    }

    /// Record bytes written as reported by a worker.
    pub fn update_progress(&self, instance: &InstanceName, bytes_written: u64) -> Result<()> {
        self.exec(|core, _| {
            let req_name = instance.request();
            let id = core
                .queues
                .archive
                .find(&core.queues.pool, &req_name)
                .ok_or_else(|| SchedError::UnknownRequest(req_name.to_string()))?;
            let req = core
                .queues
                .pool
                .request_mut(id)
                .ok_or_else(|| SchedError::UnknownRequest(req_name.to_string()))?;
            let ci = req
                .instances
                .get_mut(instance.copy)
                .ok_or_else(|| SchedError::BadCopyIndex {
                    request: req_name.to_string(),
                    copy: instance.copy,
                })?;
            ci.bytes_written = bytes_written;
            Ok(())
        })
    }

    /// Process a worker exit. The instance's drive and worker slot come
    /// free; removable instances with files left behind queue follow-up
    /// work, and the last completion hands the request back to the
    /// composer.
    pub fn arcopy_complete(&self, instance: &InstanceName, exit: ExitStatus) -> Result<()> {
        let wake = self.exec(|core, shared| -> Result<bool> {
            let outcome = {
                let mut ctx = copy_ctx(core, shared);
                ctx.arcopy_complete(instance, exit)?
            };
            match outcome {
                CompleteOutcome::Finished(req) => {
                    core.pending_requeue.push(req);
                    Ok(true)
                }
                CompleteOutcome::InProgress { wake } => Ok(wake),
            }
        })?;
        if wake {
            self.shared.wake.wake();
        }
        Ok(())
    }

    /// Run one scheduling pass synchronously. The background thread
    /// does exactly this on every wake; embedders without one can drive
    /// scans directly.
    pub fn scan_once(&self) {
        self.exec(|core, shared| {
            scan_cycle(core, shared);
            select_oprmsg(core);
        });
    }

    /// Log the full scheduler state at info level.
    pub fn trace(&self) {
        self.exec(|core, _| {
            tracing::info!(
                oprmsg = %core.oprmsg,
                waiting = core.waiting,
                workers = core.workers.active(),
                "scheduler state"
            );
            core.devices.trace();
            core.queues.schedule.trace(&core.queues.pool);
            core.queues.archive.trace(&core.queues.pool);
            core.queues.wait.trace(&core.queues.pool);
        });
    }

    /// Point-in-time view of queues, devices, and workers.
    pub fn snapshot(&self) -> serde_json::Value {
        self.exec(|core, _| {
            json!({
                "oprmsg": core.oprmsg,
                "waiting": core.waiting,
                "states": {
                    "global": core.global_state,
                    "disk": core.dk_state,
                    "removable": core.rm_state,
                },
                "queues": {
                    "schedule": queue_json(&core.queues.schedule, &core.queues.pool),
                    "archive": queue_json(&core.queues.archive, &core.queues.pool),
                    "wait": queue_json(&core.queues.wait, &core.queues.pool),
                },
                "workers": {
                    "capacity": core.workers.capacity(),
                    "active": core.workers.active(),
                    "slots": core.workers.iter_active()
                        .map(|(slot, name)| json!({"slot": slot, "instance": name.to_string()}))
                        .collect::<Vec<_>>(),
                },
                "overflow": core.overflow.rows().iter()
                    .map(|r| json!({"media": r.media, "vsn": r.vsn, "worker": r.worker}))
                    .collect::<Vec<_>>(),
                "libraries": core.devices.libraries.iter()
                    .map(|lib| json!({
                        "name": lib.name,
                        "allow": lib.allow,
                        "avail": lib.avail,
                        "drives": lib.drives.iter().map(|d| json!({
                            "name": d.name,
                            "available": d.available,
                            "busy": d.busy,
                            "loaded": d.loaded.as_ref().map(|a| a.vsn.to_string()),
                        })).collect::<Vec<_>>(),
                    }))
                    .collect::<Vec<_>>(),
            })
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: &Shared) {
    tracing::info!("scheduler running");
    loop {
        let timeout = {
            let mut guard = shared.core.lock();
            let core = &mut *guard;
            select_oprmsg(core);
            if core.global_state == ExecState::Wait {
                Duration::from_secs(shared.config.paused_poll_interval_secs)
            } else {
                Duration::from_secs(shared.config.poll_interval_secs)
            }
        };
        if !shared.wake.wait(timeout) {
            break;
        }
        let pending = {
            let mut guard = shared.core.lock();
            let core = &mut *guard;
            scan_cycle(core, shared);
            std::mem::take(&mut core.pending_requeue)
        };
        for req in pending {
            shared.composer.requeue(req);
        }
    }
    tracing::info!("scheduler stopped");
}

/// One full pass: device refresh, requeue when requested, the
/// scheduling scan, queue-age checks, wait-message upkeep.
fn scan_cycle(core: &mut Core, shared: &Shared) {
    shared.catalog.refresh_devices(&mut core.devices);
    core.devices.recompute();
    if core.robot_restart {
        core.robot_restart = false;
        tracing::info!("robot restarted; devices revalidated");
        core.devices.trace();
    }
    if core.requeue_check {
        core.requeue_check = false;
        core.wait_flags = WaitFlags::default();
        requeue_entries(core);
    }
    if core.global_state == ExecState::Run && !core.queues.schedule.is_empty() {
        core.waiting = archive_files(core, shared);
    }
    check_queue_age(core, shared);
    rebuild_wait_message(core);
}

/// Pick the operator message to show while the scheduler sleeps.
fn select_oprmsg(core: &mut Core) {
    if core.global_state == ExecState::Wait {
        core.oprmsg = "Waiting for run command".to_string();
    } else if core.waiting > 0 {
        let reasons = core.wait_flags.reasons();
        core.oprmsg = if reasons.is_empty() {
            "Waiting for resources".to_string()
        } else {
            format!("Waiting for {}", reasons.join(", "))
        };
    } else if !core.queues.archive.is_empty() {
        core.oprmsg = "Archiving files".to_string();
    } else if core.queues.schedule.is_empty() {
        core.oprmsg = "Idle".to_string();
    }
}

/// Hand every wait-queue request back to the composer for a fresh
/// look at its selection.
fn requeue_entries(core: &mut Core) {
    for id in core.queues.wait.ids(&core.queues.pool) {
        if let Some(mut req) = take_request(core, id) {
            tracing::debug!(request = %req.name, "requeued for composing");
            req.flags.unqueue = true;
            core.pending_requeue.push(req);
        }
    }
}

/// Remove a real request from its queue and the pool.
fn take_request(core: &mut Core, id: EntryId) -> Option<ArchiveRequest> {
    core.queues.unlink(id);
    match core.queues.pool.remove(id) {
        Some(EntryKind::Normal(req)) => Some(req),
        _ => None,
    }
}

fn clear_instance(core: &mut Core, owner: EntryId, copy: usize) {
    if let Some(ci) = core
        .queues
        .pool
        .request_mut(owner)
        .and_then(|req| req.instances.get_mut(copy))
    {
        ci.clear();
    }
}

/// Decide whether a request must sit in the wait queue, posting the
/// reason as its operator message. File-system conditions dominate; the
/// class run states, a prior worker error, and unstageable files follow
/// in that order.
fn wait_arch_req(
    fs_status: &AHashMap<String, FsStatus>,
    dk_state: ExecState,
    rm_state: ExecState,
    wait_flags: &mut WaitFlags,
    composer: &dyn Composer,
    req: &mut ArchiveRequest,
) -> bool {
    req.clear_oprmsg();
    match fs_status.get(&req.name.fs) {
        None => req.set_oprmsg(format!("File system {} unknown", req.name.fs)),
        Some(st) => {
            if !st.mounted {
                req.set_oprmsg("Waiting for file system mount");
            } else if st.unmounting {
                req.set_oprmsg("Waiting for file system unmount");
            } else if st.exec != ExecState::Run {
                req.set_oprmsg("Waiting for file system run command");
            }
        }
    }
    if !req.oprmsg().is_empty() {
        return true;
    }
    if req.class.is_disk_class() && dk_state != ExecState::Run {
        req.set_oprmsg("Waiting for disk archiving run command");
    } else if !req.class.is_disk_class() && rm_state != ExecState::Run {
        req.set_oprmsg("Waiting for removable archiving run command");
    } else if req.flags.norestart {
        wait_flags.acnors = true;
        req.set_oprmsg("Waiting after copy worker error");
    } else if req.flags.nonstage {
        if composer.non_stageable(req) != req.sel_files {
            // Stage volumes came back; the hold no longer applies.
            req.flags.nonstage = false;
        } else {
            wait_flags.stage_vol = true;
            req.set_oprmsg("Waiting for stage volumes");
        }
    }
    !req.oprmsg().is_empty()
}

/// Keep the wait-reason flags honest: an empty wait queue clears them,
/// and a paused class is always worth mentioning.
fn rebuild_wait_message(core: &mut Core) {
    if core.queues.wait.is_empty() {
        core.wait_flags = WaitFlags::default();
    }
    if core.dk_state == ExecState::Wait {
        core.wait_flags.dk_idle = true;
    }
    if core.rm_state == ExecState::Wait {
        core.wait_flags.rm_idle = true;
    }
}

/// Warn once per queue residency about requests queued past their
/// set's limit. Covers the schedule and wait queues alike.
fn check_queue_age(core: &mut Core, shared: &Shared) {
    let now = Utc::now();
    let mut ids = core.queues.schedule.ids(&core.queues.pool);
    ids.extend(core.queues.wait.ids(&core.queues.pool));
    for id in ids {
        let Some(req) = core.queues.pool.request_mut(id) else {
            continue;
        };
        let Some(set) = shared.config.find_set(&req.name.set) else {
            continue;
        };
        let limit = chrono::Duration::seconds(set.queue_time_secs as i64);
        if req.queued_at + limit >= now {
            continue;
        }
        if req.alerts.first(Alert::QueueAge) {
            tracing::warn!(
                request = %req.name,
                queued_secs = (now - req.queued_at).num_seconds(),
                oprmsg = req.oprmsg(),
                "request queued too long"
            );
        }
    }
}

/// The scheduling scan. Walks the schedule queue in priority order,
/// serving overflow volume requests and follow-up work for running
/// copies, assigning resources to fresh requests, then starting workers
/// for everything the archive queue holds. Returns how many requests
/// were left waiting.
fn archive_files(core: &mut Core, shared: &Shared) -> usize {
    enum ScanItem {
        Volume(EntryId, usize, u32),
        More(EntryId, usize),
        Request,
    }

    if core.devices.recompute() == 0 {
        core.oprmsg = "Waiting for drives to become available".to_string();
        for id in core.queues.schedule.ids(&core.queues.pool) {
            if let Some(req) = core.queues.pool.request_mut(id) {
                req.set_oprmsg("Waiting for drives to become available");
            }
        }
        return 1;
    }
    core.oprmsg = "Scheduling archives".to_string();

    let mut waiting = 0usize;
    for id in core.queues.schedule.ids(&core.queues.pool) {
        let item = match core.queues.pool.get(id) {
            Some(entry) => match &entry.kind {
                EntryKind::VolumeRequest {
                    owner, copy, pid, ..
                } => ScanItem::Volume(*owner, *copy, *pid),
                EntryKind::MoreWork { owner, copy, .. } => ScanItem::More(*owner, *copy),
                EntryKind::Normal(_) => ScanItem::Request,
            },
            None => continue,
        };
        match item {
            ScanItem::Volume(owner, copy, pid) => {
                scan_volume_request(core, shared, id, owner, copy, pid);
            }
            ScanItem::More(owner, copy) => {
                scan_more_work(core, shared, id, owner, copy);
            }
            ScanItem::Request => {
                waiting += scan_request(core, shared, id);
            }
        }
    }

    if !core.queues.archive.is_empty() {
        waiting += start_workers(core, shared);
        sweep_orphans(core, shared);
    }
    waiting
}

/// Serve one overflow volume request. Granted or stale requests leave
/// the queue; anything else stays for the next scan.
fn scan_volume_request(
    core: &mut Core,
    shared: &Shared,
    id: EntryId,
    owner: EntryId,
    copy: usize,
    pid: u32,
) {
    let set = core
        .queues
        .pool
        .request(owner)
        .and_then(|req| shared.config.find_set(&req.name.set));
    let Some(set) = set else {
        core.queues.discard(id);
        return;
    };
    let outcome = {
        let mut ctx = alloc_ctx(core, shared);
        ctx.find_overflow_volume(id, owner, copy, pid, set)
    };
    if outcome == AllocOutcome::Ready {
        core.queues.discard(id);
    }
}

/// Refill a finished instance with the files its worker left behind.
/// With a volume found the entry moves to the archive queue to start;
/// otherwise the instance goes idle and the entry is dropped, leaving
/// recovery to the orphan sweep.
fn scan_more_work(core: &mut Core, shared: &Shared, id: EntryId, owner: EntryId, copy: usize) {
    let set = core
        .queues
        .pool
        .request(owner)
        .and_then(|req| shared.config.find_set(&req.name.set));
    let Some(set) = set else {
        clear_instance(core, owner, copy);
        core.queues.discard(id);
        return;
    };
    let outcome = {
        let mut ctx = alloc_ctx(core, shared);
        ctx.find_more_work(owner, copy, set)
    };
    if outcome != AllocOutcome::Ready {
        clear_instance(core, owner, copy);
        core.queues.discard(id);
        return;
    }
    let loaded = core.candidates.first().map(|v| v.loaded).unwrap_or(false);
    let to_use = core.candidates.to_use;
    let priority = core
        .queues
        .pool
        .request(owner)
        .map(|req| req.scheduling_priority(set, loaded, to_use));
    match priority {
        Some(priority) => {
            if let Some(entry) = core.queues.pool.get_mut(id) {
                if let EntryKind::MoreWork { priority: p, .. } = &mut entry.kind {
                    *p = priority;
                }
            }
            core.queues.requeue(id, QueueKind::Archive);
        }
        None => {
            core.queues.discard(id);
        }
    }
}

/// Schedule one real request. Returns 1 when it ends up waiting.
fn scan_request(core: &mut Core, shared: &Shared, id: EntryId) -> usize {
    enum Held {
        No,
        NoSpace,
        NonStage,
    }

    let valid = {
        let Some(req) = core.queues.pool.request(id) else {
            return 0;
        };
        shared.config.find_set(&req.name.set).is_some() && shared.composer.request_valid(req)
    };
    if !valid {
        if let Some(mut req) = take_request(core, id) {
            req.flags.unqueue = true;
            tracing::info!(request = %req.name, "request no longer valid");
            core.pending_requeue.push(req);
        }
        return 0;
    }

    let held = {
        let Some(req) = core.queues.pool.request_mut(id) else {
            return 0;
        };
        if req.sel_space == 0 {
            tracing::debug!(request = %req.name, "no space selected");
            Held::NoSpace
        } else if req.flags.offline && shared.composer.non_stageable(req) == req.sel_files {
            req.flags.nonstage = true;
            req.set_oprmsg("Waiting for stage volumes");
            Held::NonStage
        } else {
            Held::No
        }
    };
    match held {
        Held::NoSpace => {
            core.queues.requeue(id, QueueKind::Wait);
            return 1;
        }
        Held::NonStage => {
            core.wait_flags.stage_vol = true;
            core.queues.requeue(id, QueueKind::Wait);
            return 1;
        }
        Held::No => {}
    }

    let set = match core.queues.pool.request(id) {
        Some(req) => match shared.config.find_set(&req.name.set) {
            Some(set) => set,
            None => return 0,
        },
        None => return 0,
    };

    if let Some(req) = core.queues.pool.request_mut(id) {
        req.clear_instances();
    }
    core.queues.requeue(id, QueueKind::Archive);
    let outcome = {
        let mut ctx = alloc_ctx(core, shared);
        ctx.find_resources(id, set)
    };
    match outcome {
        AllocOutcome::Ready => {
            let loaded = core.candidates.first().map(|v| v.loaded).unwrap_or(false);
            let to_use = core.candidates.to_use;
            let resort = {
                let Some(req) = core.queues.pool.request_mut(id) else {
                    return 0;
                };
                let priority = req.scheduling_priority(set, loaded, to_use);
                if priority != req.sched_priority {
                    req.sched_priority = priority;
                    true
                } else {
                    false
                }
            };
            if resort {
                core.queues.requeue(id, QueueKind::Archive);
            }
            0
        }
        outcome => {
            core.queues.unlink(id);
            let to_wait = outcome == AllocOutcome::NotArchivable;
            if let Some(req) = core.queues.pool.request_mut(id) {
                req.drives_used = 0;
                tracing::debug!(request = %req.name, outcome = ?outcome, msg = req.oprmsg(), "resources not available");
            }
            let kind = if to_wait {
                QueueKind::Wait
            } else {
                QueueKind::Schedule
            };
            core.queues.enqueue(kind, id);
            1
        }
    }
}

/// Start workers for everything the archive queue holds, in priority
/// order. A request none of whose instances could start goes back to
/// the schedule queue marked with a schedule error.
fn start_workers(core: &mut Core, shared: &Shared) -> usize {
    enum StartItem {
        More(EntryId, usize),
        Fresh,
    }

    let mut waiting = 0usize;
    for id in core.queues.archive.ids(&core.queues.pool) {
        let item = match core.queues.pool.get(id) {
            Some(entry) => match &entry.kind {
                EntryKind::MoreWork { owner, copy, .. } => StartItem::More(*owner, *copy),
                EntryKind::Normal(req) => {
                    if req.state == ReqState::Archive {
                        continue;
                    }
                    StartItem::Fresh
                }
                EntryKind::VolumeRequest { .. } => continue,
            },
            None => continue,
        };
        match item {
            StartItem::More(owner, copy) => {
                let ok = {
                    let mut ctx = copy_ctx(core, shared);
                    ctx.start_arcopy(owner, copy)
                };
                if !ok {
                    clear_instance(core, owner, copy);
                }
                core.queues.discard(id);
            }
            StartItem::Fresh => {
                let copies: Vec<usize> = core
                    .queues
                    .pool
                    .request(id)
                    .map(|req| {
                        req.instances
                            .iter()
                            .enumerate()
                            .filter(|(_, ci)| ci.slot.is_active() && ci.worker.is_none())
                            .map(|(i, _)| i)
                            .collect()
                    })
                    .unwrap_or_default();
                let mut started = 0usize;
                for copy in copies {
                    let ok = {
                        let mut ctx = copy_ctx(core, shared);
                        ctx.start_arcopy(id, copy)
                    };
                    if ok {
                        started += 1;
                    }
                }
                if started == 0 {
                    if let Some(req) = core.queues.pool.request_mut(id) {
                        req.set_oprmsg("Unable to start copy workers");
                        req.state = ReqState::Schedule;
                        req.flags.sched_err = true;
                    }
                    core.wait_flags.schedule = true;
                    core.queues.requeue(id, QueueKind::Schedule);
                    waiting += 1;
                } else if let Some(req) = core.queues.pool.request_mut(id) {
                    req.alerts.clear();
                }
            }
        }
    }
    waiting
}

/// Return archive-queue requests that lost their footing: stale against
/// the composer, or left with no active instance.
fn sweep_orphans(core: &mut Core, shared: &Shared) {
    enum Verdict {
        Invalid,
        Orphan,
    }

    for id in core.queues.archive.ids(&core.queues.pool) {
        let verdict = match core.queues.pool.request(id) {
            Some(req) => {
                if !shared.composer.request_valid(req) {
                    Some(Verdict::Invalid)
                } else if req.active_instances() == 0 {
                    Some(Verdict::Orphan)
                } else {
                    None
                }
            }
            None => None,
        };
        let Some(verdict) = verdict else {
            continue;
        };
        if let Some(mut req) = take_request(core, id) {
            match verdict {
                Verdict::Invalid => {
                    req.flags.unqueue = true;
                    tracing::info!(request = %req.name, "request no longer valid");
                }
                Verdict::Orphan => {
                    tracing::info!(request = %req.name, "orphan request returned");
                }
            }
            core.pending_requeue.push(req);
        }
    }
}

fn queue_json(queue: &Queue, pool: &EntryPool) -> serde_json::Value {
    let entries: Vec<serde_json::Value> = queue
        .ids(pool)
        .into_iter()
        .filter_map(|id| pool.get(id))
        .map(|entry| match &entry.kind {
            EntryKind::Normal(req) => json!({
                "request": req.name.to_string(),
                "state": req.state,
                "priority": req.sched_priority,
                "files": req.sel_files,
                "space": req.sel_space,
                "queued_at": req.queued_at.to_rfc3339(),
                "oprmsg": req.oprmsg(),
                "instances": req.instances.iter().map(|ci| json!({
                    "active": ci.slot.is_active(),
                    "vsn": ci.slot.assignment().map(|a| a.vsn.to_string()),
                    "worker": ci.worker,
                    "pid": ci.pid,
                    "files": ci.files,
                    "space": ci.space,
                    "written": ci.bytes_written,
                    "oprmsg": ci.oprmsg,
                })).collect::<Vec<_>>(),
            }),
            other => json!({
                "pseudo": other.label(),
                "priority": other.priority(),
            }),
        })
        .collect();
    json!(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_signal_passes_wakeups() {
        let sig = WakeSignal::new();
        sig.wake();
        assert!(sig.wait(Duration::from_millis(1)));
        // Nothing pending; a short wait times out but keeps running.
        assert!(sig.wait(Duration::from_millis(1)));
        sig.shutdown();
        assert!(!sig.wait(Duration::from_millis(1)));
    }

    #[test]
    fn test_wake_signal_coalesces_counts() {
        let sig = WakeSignal::new();
        sig.wake();
        sig.wake();
        sig.wake();
        assert!(sig.wait(Duration::from_millis(1)));
        // All three wakeups were consumed by the one wait.
        let st = sig.state.lock();
        assert_eq!(st.count, 0);
    }

    #[test]
    fn test_wait_reasons_ordered() {
        let mut flags = WaitFlags::default();
        assert!(flags.reasons().is_empty());
        flags.stage_vol = true;
        flags.dk_idle = true;
        assert_eq!(flags.reasons(), vec!["disk run command", "stage volumes"]);
    }
}
