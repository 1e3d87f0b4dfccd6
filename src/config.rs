//! Scheduler configuration
//!
//! One TOML document configures the scheduler: loop intervals, archive sets,
//! libraries/drives, media parameters, and filesystems. Archive-set and
//! media lookups at scheduling time go through the [`Catalog`] trait; the
//! tables here are what catalog implementations serve them from.
//!
//! [`Catalog`]: crate::catalog::Catalog

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::types::{MediaClass, MediaType};

/// Media type code for disk-pool archiving.
pub const DISK_MEDIA: &str = "dk";
/// Media type code for object-store archiving.
pub const OBJECT_MEDIA: &str = "cb";

/// Archive file size limit used when neither set nor media configures one.
pub const DEFAULT_ARCHMAX: u64 = 512 << 20;

fn default_poll_interval() -> u64 {
    30
}

fn default_paused_poll_interval() -> u64 {
    3600
}

fn default_overflow_max_volumes() -> usize {
    8
}

fn default_queue_time() -> u64 {
    24 * 3600
}

fn default_true() -> bool {
    true
}

/// Top-level scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedConfig {
    /// Bounded wait between unforced scans, seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Wait used while the scheduler is globally paused, seconds.
    #[serde(default = "default_paused_poll_interval")]
    pub paused_poll_interval_secs: u64,

    /// Most volumes one copy may span through volume overflow.
    #[serde(default = "default_overflow_max_volumes")]
    pub overflow_max_volumes: usize,

    #[serde(default, rename = "archive_set")]
    pub archive_sets: Vec<ArchSet>,

    #[serde(default, rename = "library")]
    pub libraries: Vec<LibraryConfig>,

    #[serde(default, rename = "filesystem")]
    pub filesystems: Vec<FsConfig>,

    #[serde(default, rename = "media")]
    pub media: Vec<MediaParams>,
}

impl SchedConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SchedConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn find_set(&self, name: &str) -> Option<&ArchSet> {
        self.archive_sets.iter().find(|set| set.name == name)
    }

    pub fn find_media(&self, media: &MediaType) -> Option<&MediaParams> {
        self.media.iter().find(|mp| &mp.media == media)
    }

    fn validate(&self) -> Result<()> {
        let mut names: Vec<&str> = self.archive_sets.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(SchedError::Config(format!(
                "duplicate archive set: {}",
                dup[0]
            )));
        }

        for lib in &self.libraries {
            if lib.drives == 0 {
                return Err(SchedError::Config(format!(
                    "library {} has no drives",
                    lib.name
                )));
            }
            if let Some(allow) = lib.allow {
                if allow > lib.drives {
                    return Err(SchedError::Config(format!(
                        "library {}: allow {} exceeds {} drives",
                        lib.name, allow, lib.drives
                    )));
                }
            }
        }

        for set in &self.archive_sets {
            if set.fillvsns && set.fillvsns_min == 0 {
                return Err(SchedError::Config(format!(
                    "archive set {}: fillvsns requires fillvsns_min",
                    set.name
                )));
            }
        }
        Ok(())
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        SchedConfig {
            poll_interval_secs: default_poll_interval(),
            paused_poll_interval_secs: default_paused_poll_interval(),
            overflow_max_volumes: default_overflow_max_volumes(),
            archive_sets: Vec::new(),
            libraries: Vec::new(),
            filesystems: Vec::new(),
            media: Vec::new(),
        }
    }
}

/// Named configuration governing one class of archive requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchSet {
    pub name: String,

    /// Target media type code; `dk` and `cb` select disk/object archiving.
    pub media: MediaType,

    /// Drive count limit for this set. Absent means one drive.
    #[serde(default)]
    pub drives: Option<u32>,

    /// Minimum selected bytes before a second drive is used.
    #[serde(default)]
    pub drivemin: Option<u64>,

    /// Byte ceiling per copy instance when dividing across drives.
    #[serde(default)]
    pub drivemax: Option<u64>,

    /// Archive file size limit; overrides the media parameter.
    #[serde(default)]
    pub archmax: Option<u64>,

    /// Volume overflow threshold; overrides the media parameter.
    #[serde(default)]
    pub ovflmin: Option<u64>,

    /// Prefer finishing the emptiest volume over spreading writes.
    #[serde(default)]
    pub fillvsns: bool,

    /// Under fillvsns, volumes with less free space are marked full.
    #[serde(default)]
    pub fillvsns_min: u64,

    /// Divide copy instances by owner directory (reserved-owner sets).
    #[serde(default)]
    pub reserve_owner: bool,

    /// Age at which a queued request raises an operator alert, seconds.
    #[serde(default = "default_queue_time")]
    pub queue_time_secs: u64,

    /// Priority bonus when the first assigned volume is already loaded.
    #[serde(default)]
    pub priority_loaded: f64,

    /// Priority bonus for requests holding offline files.
    #[serde(default)]
    pub priority_offline: f64,

    /// Priority bonus when the copy will span multiple volumes.
    #[serde(default)]
    pub priority_overflow: f64,

    /// VSN descriptor patterns naming this set's eligible volumes.
    #[serde(default)]
    pub vsns: Vec<String>,
}

impl ArchSet {
    /// Archiving class implied by the media type code.
    pub fn class(&self) -> MediaClass {
        match self.media.as_str() {
            DISK_MEDIA => MediaClass::Disk,
            OBJECT_MEDIA => MediaClass::Object,
            _ => MediaClass::Removable,
        }
    }

    /// Archive file size limit, falling back to the media parameter.
    pub fn archmax_with(&self, mp: Option<&MediaParams>) -> u64 {
        self.archmax
            .or_else(|| mp.and_then(|mp| mp.archmax))
            .unwrap_or(DEFAULT_ARCHMAX)
    }

    /// Volume overflow threshold, or `None` when overflow is not allowed.
    ///
    /// A configured zero means "no threshold" and becomes one byte, so the
    /// returned threshold is always usable as a lower bound.
    pub fn ovflmin_with(&self, mp: Option<&MediaParams>) -> Option<u64> {
        let ovflmin = match self.ovflmin {
            Some(min) => min,
            None => match mp {
                Some(mp) if mp.overflow => mp.ovflmin.unwrap_or(0),
                _ => return None,
            },
        };
        Some(ovflmin.max(1))
    }
}

/// Per-media-type parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaParams {
    pub media: MediaType,

    /// Archive file size limit for this media type.
    #[serde(default)]
    pub archmax: Option<u64>,

    /// Whether volume overflow is allowed for this media type.
    #[serde(default)]
    pub overflow: bool,

    /// Overflow threshold when allowed.
    #[serde(default)]
    pub ovflmin: Option<u64>,
}

/// Kind of library a drive pool belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryKind {
    Removable,
    Disk,
    Object,
    /// Catalog-only record of exported media; never schedulable.
    Historian,
}

/// One library (or disk/object drive pool) and its drive budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,

    #[serde(default = "LibraryConfig::default_kind")]
    pub kind: LibraryKind,

    /// Number of drives configured.
    pub drives: u32,

    /// Drives archiving may use; defaults to all of them.
    #[serde(default)]
    pub allow: Option<u32>,
}

impl LibraryConfig {
    fn default_kind() -> LibraryKind {
        LibraryKind::Removable
    }
}

/// One archiving filesystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub name: String,

    #[serde(default = "default_true")]
    pub mounted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        poll_interval_secs = 5

        [[library]]
        name = "lib1"
        drives = 4
        allow = 3

        [[filesystem]]
        name = "samfs1"

        [[media]]
        media = "li"
        archmax = 1073741824
        overflow = true
        ovflmin = 268435456

        [[archive_set]]
        name = "allsets.1"
        media = "li"
        drives = 2
        fillvsns = true
        fillvsns_min = 1048576
        vsns = ["VOL.*"]
    "#;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("shelf.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = SchedConfig::load(&path).unwrap();
        assert_eq!(config.poll_interval_secs, 5);
        assert!(SchedConfig::load(dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_parse_sample() {
        let config = SchedConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.overflow_max_volumes, 8);
        let set = config.find_set("allsets.1").unwrap();
        assert_eq!(set.class(), MediaClass::Removable);
        assert_eq!(set.drives, Some(2));
        assert_eq!(set.queue_time_secs, 24 * 3600);
        let mp = config.find_media(&set.media);
        assert_eq!(set.archmax_with(mp), 1 << 30);
        assert_eq!(set.ovflmin_with(mp), Some(256 << 20));
    }

    #[test]
    fn test_class_from_media() {
        let mut set = ArchSet {
            name: "s".into(),
            media: MediaType::from("dk"),
            drives: None,
            drivemin: None,
            drivemax: None,
            archmax: None,
            ovflmin: None,
            fillvsns: false,
            fillvsns_min: 0,
            reserve_owner: false,
            queue_time_secs: default_queue_time(),
            priority_loaded: 0.0,
            priority_offline: 0.0,
            priority_overflow: 0.0,
            vsns: Vec::new(),
        };
        assert_eq!(set.class(), MediaClass::Disk);
        set.media = MediaType::from("cb");
        assert_eq!(set.class(), MediaClass::Object);
        set.media = MediaType::from("lt");
        assert_eq!(set.class(), MediaClass::Removable);
    }

    #[test]
    fn test_ovflmin_resolution() {
        let mut set = ArchSet {
            name: "s".into(),
            media: MediaType::from("li"),
            drives: None,
            drivemin: None,
            drivemax: None,
            archmax: None,
            ovflmin: None,
            fillvsns: false,
            fillvsns_min: 0,
            reserve_owner: false,
            queue_time_secs: default_queue_time(),
            priority_loaded: 0.0,
            priority_offline: 0.0,
            priority_overflow: 0.0,
            vsns: Vec::new(),
        };
        // No set override, no media params: not allowed.
        assert_eq!(set.ovflmin_with(None), None);

        // Media allows overflow with no threshold: minimum one byte.
        let mp = MediaParams {
            media: MediaType::from("li"),
            archmax: None,
            overflow: true,
            ovflmin: None,
        };
        assert_eq!(set.ovflmin_with(Some(&mp)), Some(1));

        // Set override wins even when media forbids overflow.
        set.ovflmin = Some(4096);
        let no = MediaParams {
            media: MediaType::from("li"),
            archmax: None,
            overflow: false,
            ovflmin: None,
        };
        assert_eq!(set.ovflmin_with(Some(&no)), Some(4096));
    }

    #[test]
    fn test_validation_rejects_duplicates() {
        let text = r#"
            [[archive_set]]
            name = "dup"
            media = "li"

            [[archive_set]]
            name = "dup"
            media = "lt"
        "#;
        assert!(SchedConfig::from_toml_str(text).is_err());
    }

    #[test]
    fn test_validation_rejects_bad_allow() {
        let text = r#"
            [[library]]
            name = "lib1"
            drives = 2
            allow = 3
        "#;
        assert!(SchedConfig::from_toml_str(text).is_err());
    }
}
