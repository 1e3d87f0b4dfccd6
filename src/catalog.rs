//! Volume catalog interface
//!
//! The scheduler never walks media catalogs itself; it pulls candidate
//! volumes one at a time through this trait. Implementations present
//! candidates in their preferred order: drive-resident volumes first,
//! then reserved volumes, then whatever the set's volume list matches.

use crate::config::ArchSet;
use crate::devices::DeviceTable;
use crate::error::Result;
use crate::volumes::VolumeCandidate;

/// Source of archive volumes and device state.
pub trait Catalog: Send + Sync {
    /// Update drive availability ahead of a scan. Called once per scan
    /// with the scheduler lock held.
    fn refresh_devices(&self, devices: &mut DeviceTable) {
        let _ = devices;
    }

    /// The `tried`-th removable volume usable by the set, or `None` when
    /// the catalogs are exhausted. `tried` is a zero-based cursor; a
    /// search calls with 0, 1, 2... until `None`. `owner` narrows
    /// reserved volumes to one owner key when the set reserves by owner,
    /// and `fs` names the file system the request came from.
    fn next_rm_volume(
        &self,
        set: &ArchSet,
        tried: usize,
        owner: &str,
        fs: &str,
    ) -> Option<VolumeCandidate>;

    /// The `tried`-th disk or object volume usable by the set.
    fn next_dk_volume(&self, set: &ArchSet, tried: usize) -> Option<VolumeCandidate>;

    /// Record that a volume is too full for further archiving. Searches
    /// call this when fill mode rejects a volume so it stops showing up.
    fn mark_volume_full(&self, vol: &VolumeCandidate) -> Result<()>;
}
