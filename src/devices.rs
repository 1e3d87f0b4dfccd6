//! Library and drive accounting
//!
//! The device table mirrors the media libraries the scheduler may draw
//! drives from. Drive busy state is owned here; per-class drive
//! allowances are recomputed at the start of every scan so operator
//! changes take effect between scans.

use crate::config::{LibraryConfig, LibraryKind, SchedConfig};
use crate::request::VolumeAssignment;
use crate::types::MediaClass;

/// Index into the library table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LibraryId(pub usize);

impl std::fmt::Display for LibraryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One drive within one library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriveId {
    pub library: LibraryId,
    pub index: usize,
}

impl std::fmt::Display for DriveId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.library, self.index)
    }
}

#[derive(Debug, Clone)]
pub struct Drive {
    pub name: String,
    /// Operational and usable for archiving.
    pub available: bool,
    /// Held by a copy instance.
    pub busy: bool,
    /// Volume last loaded; kept across release so nearby work can reuse it.
    pub loaded: Option<VolumeAssignment>,
}

#[derive(Debug, Clone)]
pub struct Library {
    pub name: String,
    pub kind: LibraryKind,
    pub drives: Vec<Drive>,
    /// Configured concurrent-use limit.
    pub allow: u32,
    /// Operational drives, refreshed by [`DeviceTable::recompute`].
    pub avail: u32,
}

impl Library {
    fn from_config(cfg: &LibraryConfig) -> Self {
        let drives = (0..cfg.drives)
            .map(|i| Drive {
                name: format!("{}:{}", cfg.name, i),
                available: true,
                busy: false,
                loaded: None,
            })
            .collect();
        Library {
            name: cfg.name.clone(),
            kind: cfg.kind,
            drives,
            allow: cfg.allow.unwrap_or(cfg.drives).min(cfg.drives),
            avail: cfg.drives,
        }
    }

    /// Allowance bounded by what is actually operational.
    pub fn effective_allow(&self) -> u32 {
        self.allow.min(self.avail)
    }
}

/// All libraries plus the per-class drive allowances.
#[derive(Debug, Default)]
pub struct DeviceTable {
    pub libraries: Vec<Library>,
    pub disk_allow: u32,
    pub object_allow: u32,
    pub removable_allow: u32,
}

impl DeviceTable {
    pub fn from_config(cfg: &SchedConfig) -> Self {
        let mut table = DeviceTable {
            libraries: cfg.libraries.iter().map(Library::from_config).collect(),
            ..DeviceTable::default()
        };
        table.recompute();
        table
    }

    pub fn library(&self, id: LibraryId) -> Option<&Library> {
        self.libraries.get(id.0)
    }

    pub fn drive(&self, id: DriveId) -> Option<&Drive> {
        self.libraries.get(id.library.0)?.drives.get(id.index)
    }

    /// Refresh per-library availability and the per-class allowances.
    /// Returns the total number of operational drives. The historian
    /// library holds exported volumes and lends no drives.
    pub fn recompute(&mut self) -> u32 {
        self.disk_allow = 0;
        self.object_allow = 0;
        self.removable_allow = 0;
        let mut total = 0;
        for lib in &mut self.libraries {
            lib.avail = lib.drives.iter().filter(|d| d.available).count() as u32;
            match lib.kind {
                LibraryKind::Disk => self.disk_allow += lib.allow,
                LibraryKind::Object => self.object_allow += lib.allow,
                LibraryKind::Removable => self.removable_allow += lib.allow,
                LibraryKind::Historian => continue,
            }
            total += lib.avail;
        }
        total
    }

    pub fn class_allowance(&self, class: MediaClass) -> u32 {
        match class {
            MediaClass::Disk => self.disk_allow,
            MediaClass::Object => self.object_allow,
            MediaClass::Removable => self.removable_allow,
        }
    }

    /// First operational idle drive in the library.
    pub fn find_free_drive(&self, lib: LibraryId) -> Option<DriveId> {
        let library = self.libraries.get(lib.0)?;
        library
            .drives
            .iter()
            .position(|d| d.available && !d.busy)
            .map(|index| DriveId {
                library: lib,
                index,
            })
    }

    /// Whether the library can lend another drive given `in_use` of its
    /// drives already carry active copy instances.
    pub fn library_drive_free(&self, lib: LibraryId, in_use: u32) -> bool {
        match self.libraries.get(lib.0) {
            Some(library) => library.effective_allow() > in_use,
            None => false,
        }
    }

    pub fn mark_busy(&mut self, id: DriveId, assignment: VolumeAssignment) {
        if let Some(drive) = self
            .libraries
            .get_mut(id.library.0)
            .and_then(|l| l.drives.get_mut(id.index))
        {
            drive.busy = true;
            drive.loaded = Some(assignment);
        }
    }

    /// Release the drive. The loaded labels stay so the volume still
    /// counts as drive resident.
    pub fn release(&mut self, id: DriveId) {
        if let Some(drive) = self
            .libraries
            .get_mut(id.library.0)
            .and_then(|l| l.drives.get_mut(id.index))
        {
            drive.busy = false;
        }
    }

    /// Log library and drive status.
    pub fn trace(&self) {
        for (i, lib) in self.libraries.iter().enumerate() {
            tracing::info!(
                library = %lib.name,
                kind = ?lib.kind,
                allow = lib.allow,
                avail = lib.avail,
                "library status"
            );
            if lib.kind == LibraryKind::Removable {
                for (j, drive) in lib.drives.iter().enumerate() {
                    tracing::info!(
                        drive = %DriveId { library: LibraryId(i), index: j },
                        name = %drive.name,
                        available = drive.available,
                        busy = drive.busy,
                        loaded = drive.loaded.as_ref().map(|v| v.vsn.as_str()),
                        "drive status"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MediaType, Vsn};

    fn lib_config(name: &str, kind: LibraryKind, drives: u32, allow: Option<u32>) -> LibraryConfig {
        LibraryConfig {
            name: name.into(),
            kind,
            drives,
            allow,
        }
    }

    fn sample_table() -> DeviceTable {
        let cfg = SchedConfig {
            libraries: vec![
                lib_config("lib1", LibraryKind::Removable, 4, Some(3)),
                lib_config("dsk", LibraryKind::Disk, 2, None),
                lib_config("hist", LibraryKind::Historian, 1, None),
            ],
            ..SchedConfig::default()
        };
        DeviceTable::from_config(&cfg)
    }

    #[test]
    fn test_recompute_sums_allowances_without_historian() {
        let mut table = sample_table();
        assert_eq!(table.removable_allow, 3);
        assert_eq!(table.disk_allow, 2);
        assert_eq!(table.object_allow, 0);
        assert_eq!(table.recompute(), 6);

        table.libraries[0].drives[0].available = false;
        table.libraries[0].drives[1].available = false;
        assert_eq!(table.recompute(), 4);
        assert_eq!(table.libraries[0].avail, 2);
        // Allowance is configured, not availability bound.
        assert_eq!(table.removable_allow, 3);
        assert_eq!(table.libraries[0].effective_allow(), 2);
    }

    #[test]
    fn test_find_free_drive_skips_busy_and_down() {
        let mut table = sample_table();
        let lib = LibraryId(0);
        table.libraries[0].drives[0].available = false;
        table.mark_busy(
            DriveId {
                library: lib,
                index: 1,
            },
            VolumeAssignment {
                media: MediaType::from("li"),
                vsn: Vsn::from("VOL001"),
            },
        );

        let free = table.find_free_drive(lib).unwrap();
        assert_eq!(free.index, 2);

        for d in &mut table.libraries[0].drives {
            d.available = false;
        }
        assert!(table.find_free_drive(lib).is_none());
    }

    #[test]
    fn test_release_keeps_loaded_labels() {
        let mut table = sample_table();
        let id = DriveId {
            library: LibraryId(0),
            index: 0,
        };
        table.mark_busy(
            id,
            VolumeAssignment {
                media: MediaType::from("li"),
                vsn: Vsn::from("VOL002"),
            },
        );
        table.release(id);

        let drive = table.drive(id).unwrap();
        assert!(!drive.busy);
        assert_eq!(drive.loaded.as_ref().unwrap().vsn.as_str(), "VOL002");
    }

    #[test]
    fn test_library_drive_free_accounts_for_in_use() {
        let table = sample_table();
        let lib = LibraryId(0);
        // allow 3 of 4 drives
        assert!(table.library_drive_free(lib, 0));
        assert!(table.library_drive_free(lib, 2));
        assert!(!table.library_drive_free(lib, 3));
        assert!(!table.library_drive_free(LibraryId(9), 0));
    }
}
