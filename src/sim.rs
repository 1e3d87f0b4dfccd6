//! In-memory collaborators
//!
//! Catalog, composer, and launcher implementations backed by plain
//! tables. The catalog hands out volumes in the order real catalogs do
//! (drive-resident first, then reserved, then pattern matches); the
//! composer divides selections arithmetically; the launcher records
//! argv instead of forking. Tests and embedding demos build a whole
//! scheduler from these.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use regex::Regex;

use crate::catalog::Catalog;
use crate::composer::Composer;
use crate::config::{ArchSet, LibraryKind, SchedConfig};
use crate::devices::{DeviceTable, LibraryId};
use crate::error::{Result, SchedError};
use crate::launcher::ProcessLauncher;
use crate::request::ArchiveRequest;
use crate::types::{InstanceName, MediaType, RequestName, Vsn};
use crate::volumes::VolumeCandidate;

#[derive(Debug, Clone)]
struct SimVolume {
    library: LibraryId,
    kind: LibraryKind,
    slot: u32,
    media: MediaType,
    vsn: Vsn,
    capacity: u64,
    space: u64,
    loaded: bool,
    /// Reserved to this archive set, optionally narrowed to one owner.
    reserved_set: Option<String>,
    reserved_owner: Option<String>,
    full: bool,
}

#[derive(Default)]
struct CatalogState {
    volumes: Vec<SimVolume>,
    /// Drives currently out of service, applied on every refresh.
    down_drives: Vec<(LibraryId, usize)>,
    /// Compiled VSN descriptors; a pattern that fails to compile
    /// matches nothing.
    patterns: AHashMap<String, Option<Regex>>,
}

/// Catalog backed by an in-memory volume table.
///
/// Volume eligibility follows the set's VSN descriptors, full-match
/// anchored regular expressions. An empty descriptor list matches every
/// volume of the set's media type.
pub struct MemoryCatalog {
    libraries: AHashMap<String, (LibraryId, LibraryKind)>,
    state: Mutex<CatalogState>,
}

fn pattern<'p>(
    patterns: &'p mut AHashMap<String, Option<Regex>>,
    descriptor: &str,
) -> Option<&'p Regex> {
    patterns
        .entry(descriptor.to_string())
        .or_insert_with(|| Regex::new(&format!("^(?:{descriptor})$")).ok())
        .as_ref()
}

fn vsn_match(
    patterns: &mut AHashMap<String, Option<Regex>>,
    set: &ArchSet,
    vsn: &Vsn,
) -> bool {
    set.vsns.is_empty()
        || set.vsns.iter().any(|descriptor| {
            pattern(patterns, descriptor)
                .map(|re| re.is_match(vsn.as_str()))
                .unwrap_or(false)
        })
}

fn candidate(vol: &SimVolume) -> VolumeCandidate {
    VolumeCandidate {
        library: vol.library,
        slot: vol.slot,
        media: vol.media.clone(),
        vsn: vol.vsn.clone(),
        capacity: vol.capacity,
        space: vol.space,
        busy: false,
        loaded: vol.loaded,
        reserved: vol.reserved_set.is_some(),
    }
}

impl MemoryCatalog {
    pub fn new(cfg: &SchedConfig) -> Self {
        let libraries = cfg
            .libraries
            .iter()
            .enumerate()
            .map(|(i, lib)| (lib.name.clone(), (LibraryId(i), lib.kind)))
            .collect();
        MemoryCatalog {
            libraries,
            state: Mutex::new(CatalogState::default()),
        }
    }

    /// Add a volume to `library`'s catalog. Slots number up from 0 per
    /// library.
    pub fn add_volume(
        &self,
        library: &str,
        media: &str,
        vsn: &str,
        capacity: u64,
        space: u64,
    ) -> Result<()> {
        let &(id, kind) = self
            .libraries
            .get(library)
            .ok_or_else(|| SchedError::Config(format!("library {library} not configured")))?;
        let mut state = self.state.lock();
        let slot = state.volumes.iter().filter(|v| v.library == id).count() as u32;
        state.volumes.push(SimVolume {
            library: id,
            kind,
            slot,
            media: MediaType::from(media),
            vsn: Vsn::from(vsn),
            capacity,
            space,
            loaded: false,
            reserved_set: None,
            reserved_owner: None,
            full: false,
        });
        Ok(())
    }

    pub fn set_loaded(&self, vsn: &str, loaded: bool) {
        let mut state = self.state.lock();
        if let Some(vol) = state.volumes.iter_mut().find(|v| v.vsn.as_str() == vsn) {
            vol.loaded = loaded;
        }
    }

    pub fn set_space(&self, vsn: &str, space: u64) {
        let mut state = self.state.lock();
        if let Some(vol) = state.volumes.iter_mut().find(|v| v.vsn.as_str() == vsn) {
            vol.space = space;
        }
    }

    /// Reserve a volume to one archive set, optionally to one owner key
    /// within it.
    pub fn reserve(&self, vsn: &str, set: &str, owner: Option<&str>) {
        let mut state = self.state.lock();
        if let Some(vol) = state.volumes.iter_mut().find(|v| v.vsn.as_str() == vsn) {
            vol.reserved_set = Some(set.to_string());
            vol.reserved_owner = owner.map(str::to_string);
        }
    }

    pub fn set_drive_down(&self, library: &str, index: usize, down: bool) {
        let Some(&(id, _)) = self.libraries.get(library) else {
            return;
        };
        let mut state = self.state.lock();
        state.down_drives.retain(|&(l, i)| !(l == id && i == index));
        if down {
            state.down_drives.push((id, index));
        }
    }

    /// Whether a fill-mode search marked the volume full.
    pub fn marked_full(&self, vsn: &str) -> bool {
        self.state
            .lock()
            .volumes
            .iter()
            .any(|v| v.vsn.as_str() == vsn && v.full)
    }
}

impl Catalog for MemoryCatalog {
    fn refresh_devices(&self, devices: &mut DeviceTable) {
        let state = self.state.lock();
        for lib in &mut devices.libraries {
            for drive in &mut lib.drives {
                drive.available = true;
            }
        }
        for &(lib, index) in &state.down_drives {
            if let Some(drive) = devices
                .libraries
                .get_mut(lib.0)
                .and_then(|l| l.drives.get_mut(index))
            {
                drive.available = false;
            }
        }
    }

    fn next_rm_volume(
        &self,
        set: &ArchSet,
        tried: usize,
        owner: &str,
        _fs: &str,
    ) -> Option<VolumeCandidate> {
        let mut state = self.state.lock();
        let CatalogState {
            volumes, patterns, ..
        } = &mut *state;

        // Rank: loaded volumes first, then reserved, then the pool.
        let mut ranked: Vec<(u8, usize)> = Vec::new();
        for (i, vol) in volumes.iter().enumerate() {
            if vol.full || vol.kind != LibraryKind::Removable || vol.media != set.media {
                continue;
            }
            let rank = match &vol.reserved_set {
                Some(reserved_set) => {
                    if reserved_set != &set.name {
                        continue;
                    }
                    if set.reserve_owner {
                        if let Some(reserved_owner) = &vol.reserved_owner {
                            if reserved_owner != owner {
                                continue;
                            }
                        }
                    }
                    if vol.loaded {
                        0
                    } else {
                        1
                    }
                }
                None => {
                    if !vsn_match(patterns, set, &vol.vsn) {
                        continue;
                    }
                    if vol.loaded {
                        0
                    } else {
                        2
                    }
                }
            };
            ranked.push((rank, i));
        }
        ranked.sort_by_key(|&(rank, i)| (rank, i));
        let &(_, idx) = ranked.get(tried)?;
        volumes.get(idx).map(candidate)
    }

    fn next_dk_volume(&self, set: &ArchSet, tried: usize) -> Option<VolumeCandidate> {
        let mut state = self.state.lock();
        let CatalogState {
            volumes, patterns, ..
        } = &mut *state;
        let mut found = 0usize;
        for vol in volumes.iter() {
            if vol.full
                || !matches!(vol.kind, LibraryKind::Disk | LibraryKind::Object)
                || vol.media != set.media
            {
                continue;
            }
            if !vsn_match(patterns, set, &vol.vsn) {
                continue;
            }
            if found == tried {
                return Some(candidate(vol));
            }
            found += 1;
        }
        None
    }

    fn mark_volume_full(&self, vol: &VolumeCandidate) -> Result<()> {
        let mut state = self.state.lock();
        match state
            .volumes
            .iter_mut()
            .find(|v| v.media == vol.media && v.vsn == vol.vsn)
        {
            Some(v) => {
                v.full = true;
                Ok(())
            }
            None => Err(SchedError::Config(format!(
                "volume {} not cataloged",
                vol.vsn
            ))),
        }
    }
}

/// Record of one final division ahead of a worker launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballCall {
    pub request: String,
    pub copy: usize,
    pub archmax: u64,
    pub ovflmin: u64,
    pub vol_space: u64,
}

/// Composer that divides selections arithmetically and records what
/// comes back.
#[derive(Default)]
pub struct SimComposer {
    requeued: Mutex<Vec<ArchiveRequest>>,
    invalid: Mutex<AHashSet<String>>,
    non_stageable: Mutex<AHashMap<String, u64>>,
    /// Files a finished worker left behind, staged per instance name.
    more_payload: Mutex<AHashMap<String, (u64, u64)>>,
    tarballs: Mutex<Vec<TarballCall>>,
}

impl SimComposer {
    pub fn new() -> Self {
        SimComposer::default()
    }

    /// Drain the requests handed back so far.
    pub fn take_requeued(&self) -> Vec<ArchiveRequest> {
        std::mem::take(&mut *self.requeued.lock())
    }

    /// Make `request_valid` report the request stale.
    pub fn invalidate(&self, name: &RequestName) {
        self.invalid.lock().insert(name.to_string());
    }

    pub fn set_non_stageable(&self, name: &RequestName, files: u64) {
        self.non_stageable.lock().insert(name.to_string(), files);
    }

    /// Stage the selection `select_for_copy` will install when the
    /// named instance asks for more work.
    pub fn stage_more_work(&self, instance: &InstanceName, files: u64, space: u64) {
        self.more_payload
            .lock()
            .insert(instance.to_string(), (files, space));
    }

    pub fn tarball_calls(&self) -> Vec<TarballCall> {
        self.tarballs.lock().clone()
    }
}

impl Composer for SimComposer {
    fn requeue(&self, req: ArchiveRequest) {
        tracing::debug!(request = %req.name, unqueue = req.flags.unqueue, "composer took request back");
        self.requeued.lock().push(req);
    }

    fn request_valid(&self, req: &ArchiveRequest) -> bool {
        !self.invalid.lock().contains(&req.name.to_string())
    }

    fn divide_for_drives(&self, req: &mut ArchiveRequest, set: &ArchSet, drives: usize) {
        for ci in &mut req.instances {
            ci.clear();
        }
        let n = drives.clamp(1, req.instances.len()) as u64;
        let base_files = req.sel_files / n;
        let extra_files = req.sel_files % n;
        let base_space = req.sel_space / n;
        let extra_space = req.sel_space % n;
        let cap = set.drivemax.unwrap_or(u64::MAX).max(1);
        let mut used = 0usize;
        for copy in 0..(n as usize) {
            let files = base_files + u64::from((copy as u64) < extra_files);
            let space = base_space + u64::from((copy as u64) < extra_space);
            if files == 0 {
                continue;
            }
            let min_space = req.min_space.min(space.max(1));
            let owner = if set.reserve_owner {
                format!("own{copy}")
            } else {
                String::new()
            };
            if let Some(ci) = req.instances.get_mut(copy) {
                ci.files = files;
                ci.space = space.min(cap);
                ci.min_space = min_space;
                ci.owner = owner;
                if space > cap {
                    ci.flags.more = true;
                }
                used += 1;
            }
        }
        req.drives_used = used;
    }

    fn select_for_copy(&self, req: &mut ArchiveRequest, _set: &ArchSet, copy: usize) {
        let key = req.name.instance(copy).to_string();
        let payload = self.more_payload.lock().remove(&key);
        let min_space = req.min_space;
        if let Some(ci) = req.instances.get_mut(copy) {
            ci.clear();
            if let Some((files, space)) = payload {
                ci.files = files;
                ci.space = space;
                ci.min_space = min_space.min(space.max(1));
            }
        }
    }

    fn select_fit(&self, req: &mut ArchiveRequest, copy: usize, avail_space: u64, _ovflmin: u64) {
        if let Some(ci) = req.instances.get_mut(copy) {
            if avail_space >= ci.min_space.max(1) {
                ci.space = ci.space.min(avail_space);
            } else {
                ci.files = 0;
                ci.space = 0;
            }
        }
    }

    fn make_tarballs(
        &self,
        req: &mut ArchiveRequest,
        copy: usize,
        archmax: u64,
        ovflmin: u64,
        vol_space: u64,
    ) {
        self.tarballs.lock().push(TarballCall {
            request: req.name.to_string(),
            copy,
            archmax,
            ovflmin,
            vol_space,
        });
    }

    fn non_stageable(&self, req: &ArchiveRequest) -> u64 {
        self.non_stageable
            .lock()
            .get(&req.name.to_string())
            .copied()
            .unwrap_or(0)
    }
}

/// Launcher that assigns process ids without forking.
pub struct SimLauncher {
    next_pid: AtomicU32,
    fail_starts: AtomicBool,
    started: Mutex<Vec<(u32, Vec<String>)>>,
    terminated: Mutex<Vec<u32>>,
}

impl SimLauncher {
    pub fn new() -> Self {
        SimLauncher {
            next_pid: AtomicU32::new(1000),
            fail_starts: AtomicBool::new(false),
            started: Mutex::new(Vec::new()),
            terminated: Mutex::new(Vec::new()),
        }
    }

    /// Make every start attempt fail until turned off again.
    pub fn fail_starts(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    pub fn started(&self) -> Vec<(u32, Vec<String>)> {
        self.started.lock().clone()
    }

    /// Instance names started so far, in start order.
    pub fn started_instances(&self) -> Vec<InstanceName> {
        self.started
            .lock()
            .iter()
            .filter_map(|(_, argv)| argv.get(1))
            .filter_map(|arg| InstanceName::parse(arg).ok())
            .collect()
    }

    /// Most recent pid started for the instance.
    pub fn pid_of(&self, instance: &InstanceName) -> Option<u32> {
        let name = instance.to_string();
        self.started
            .lock()
            .iter()
            .rev()
            .find(|(_, argv)| argv.get(1) == Some(&name))
            .map(|&(pid, _)| pid)
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().clone()
    }
}

impl Default for SimLauncher {
    fn default() -> Self {
        SimLauncher::new()
    }
}

impl ProcessLauncher for SimLauncher {
    fn start(&self, argv: &[String]) -> Result<u32> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(SchedError::Launch("starts disabled".to_string()));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(?argv, pid, "worker start recorded");
        self.started.lock().push((pid, argv.to_vec()));
        Ok(pid)
    }

    fn terminate(&self, pid: u32) {
        tracing::debug!(pid, "worker terminate recorded");
        self.terminated.lock().push(pid);
    }
}
