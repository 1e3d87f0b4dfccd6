//! Volume candidate and overflow tables
//!
//! A volume search fills the candidate table, orders it, and picks from
//! the front. The table is scratch: every search starts it empty and
//! nothing outside the search reads it. The overflow table records
//! volumes a worker has filled and moved past; a row pins the volume as
//! in use until that worker finishes.

use std::cmp::Ordering;

use crate::devices::LibraryId;
use crate::request::VolumeAssignment;
use crate::types::{MediaType, Vsn};

/// One volume under consideration by a search.
#[derive(Debug, Clone)]
pub struct VolumeCandidate {
    pub library: LibraryId,
    /// Catalog slot within the library; identifies the cartridge.
    pub slot: u32,
    pub media: MediaType,
    pub vsn: Vsn,
    pub capacity: u64,
    pub space: u64,
    /// Another copy instance holds this cartridge.
    pub busy: bool,
    /// Resident in a drive.
    pub loaded: bool,
    /// Reserved to an archive set.
    pub reserved: bool,
}

impl VolumeCandidate {
    pub fn free_fraction(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.space as f64 / self.capacity as f64
        }
    }

    pub fn assignment(&self) -> VolumeAssignment {
        VolumeAssignment {
            media: self.media.clone(),
            vsn: self.vsn.clone(),
        }
    }
}

/// Scratch table of candidate volumes for the search in progress.
#[derive(Debug, Default)]
pub struct CandidateTable {
    entries: Vec<VolumeCandidate>,
    /// Volumes the final assignment will consume, in table order.
    pub to_use: usize,
}

impl CandidateTable {
    pub fn new() -> Self {
        CandidateTable::default()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.to_use = 0;
    }

    pub fn push(&mut self, candidate: VolumeCandidate) {
        self.entries.push(candidate);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn first(&self) -> Option<&VolumeCandidate> {
        self.entries.first()
    }

    pub fn get(&self, i: usize) -> Option<&VolumeCandidate> {
        self.entries.get(i)
    }

    pub fn get_mut(&mut self, i: usize) -> Option<&mut VolumeCandidate> {
        self.entries.get_mut(i)
    }

    /// Commit to the single candidate at `i`: it becomes entry 0, the
    /// rest are dropped, and `to_use` is one.
    pub fn select_single(&mut self, i: usize) {
        if i < self.entries.len() {
            self.entries.swap(0, i);
            self.entries.truncate(1);
            self.to_use = 1;
        }
    }

    pub fn entries(&self) -> &[VolumeCandidate] {
        &self.entries
    }

    pub fn truncate(&mut self, n: usize) {
        self.entries.truncate(n);
    }

    pub fn total_space(&self) -> u64 {
        self.entries.iter().map(|v| v.space).sum()
    }

    /// Order disk volumes by free fraction. Ascending packs the fullest
    /// volume first; descending spreads onto the emptiest.
    pub fn sort_disk(&mut self, ascending: bool) {
        self.entries.sort_by(|a, b| {
            let ord = a
                .free_fraction()
                .partial_cmp(&b.free_fraction())
                .unwrap_or(Ordering::Equal);
            if ascending {
                ord
            } else {
                ord.reverse()
            }
        });
    }

    /// Order removable volumes: free cartridges ahead of busy ones, then
    /// by free space, then by library and slot for a stable order.
    pub fn sort_removable(&mut self, ascending: bool) {
        self.entries.sort_by(|a, b| {
            a.busy
                .cmp(&b.busy)
                .then_with(|| {
                    let ord = a.space.cmp(&b.space);
                    if ascending {
                        ord
                    } else {
                        ord.reverse()
                    }
                })
                .then_with(|| a.library.0.cmp(&b.library.0))
                .then_with(|| a.slot.cmp(&b.slot))
        });
    }
}

/// Volume pinned by a worker that overflowed past it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowRow {
    pub media: MediaType,
    pub vsn: Vsn,
    /// Worker-slot number of the copy that filled the volume.
    pub worker: usize,
}

/// Volumes filled by still-running workers.
#[derive(Debug, Default)]
pub struct OverflowTable {
    rows: Vec<OverflowRow>,
}

impl OverflowTable {
    pub fn new() -> Self {
        OverflowTable::default()
    }

    pub fn record(&mut self, media: MediaType, vsn: Vsn, worker: usize) {
        self.rows.push(OverflowRow { media, vsn, worker });
    }

    /// Drop every row belonging to a finished worker.
    pub fn purge(&mut self, worker: usize) {
        self.rows.retain(|r| r.worker != worker);
    }

    /// Worker slot holding the volume, if any row pins it.
    pub fn find(&self, media: &MediaType, vsn: &Vsn) -> Option<usize> {
        self.rows
            .iter()
            .find(|r| r.media == *media && r.vsn == *vsn)
            .map(|r| r.worker)
    }

    pub fn rows(&self) -> &[OverflowRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vol(lib: usize, slot: u32, vsn: &str, capacity: u64, space: u64) -> VolumeCandidate {
        VolumeCandidate {
            library: LibraryId(lib),
            slot,
            media: MediaType::from("li"),
            vsn: Vsn::from(vsn),
            capacity,
            space,
            busy: false,
            loaded: false,
            reserved: false,
        }
    }

    #[test]
    fn test_disk_sort_uses_free_fraction() {
        let mut table = CandidateTable::new();
        table.push(vol(0, 0, "D1", 100, 50)); // 0.50
        table.push(vol(0, 1, "D2", 1000, 100)); // 0.10
        table.push(vol(0, 2, "D3", 100, 90)); // 0.90

        table.sort_disk(true);
        let vsns: Vec<_> = table.entries().iter().map(|v| v.vsn.as_str()).collect();
        assert_eq!(vsns, ["D2", "D1", "D3"]);

        table.sort_disk(false);
        let vsns: Vec<_> = table.entries().iter().map(|v| v.vsn.as_str()).collect();
        assert_eq!(vsns, ["D3", "D1", "D2"]);
    }

    #[test]
    fn test_removable_sort_puts_busy_last() {
        let mut table = CandidateTable::new();
        let mut busy = vol(0, 0, "BUSY", 100, 95);
        busy.busy = true;
        table.push(busy);
        table.push(vol(1, 3, "SMALL", 100, 10));
        table.push(vol(0, 2, "BIG", 100, 80));

        table.sort_removable(false);
        let vsns: Vec<_> = table.entries().iter().map(|v| v.vsn.as_str()).collect();
        assert_eq!(vsns, ["BIG", "SMALL", "BUSY"]);

        table.sort_removable(true);
        let vsns: Vec<_> = table.entries().iter().map(|v| v.vsn.as_str()).collect();
        assert_eq!(vsns, ["SMALL", "BIG", "BUSY"]);
    }

    #[test]
    fn test_removable_sort_tiebreaks_by_library_then_slot() {
        let mut table = CandidateTable::new();
        table.push(vol(1, 5, "C", 100, 40));
        table.push(vol(0, 9, "B", 100, 40));
        table.push(vol(0, 2, "A", 100, 40));

        table.sort_removable(true);
        let vsns: Vec<_> = table.entries().iter().map(|v| v.vsn.as_str()).collect();
        assert_eq!(vsns, ["A", "B", "C"]);
    }

    #[test]
    fn test_candidate_table_is_scratch() {
        let mut table = CandidateTable::new();
        table.push(vol(0, 0, "V1", 100, 50));
        table.to_use = 1;
        table.clear();
        assert!(table.is_empty());
        assert_eq!(table.to_use, 0);
        assert_eq!(table.total_space(), 0);
    }

    #[test]
    fn test_overflow_rows_follow_worker_lifetime() {
        let mut table = OverflowTable::new();
        let li = MediaType::from("li");
        table.record(li.clone(), Vsn::from("VOL001"), 2);
        table.record(li.clone(), Vsn::from("VOL002"), 2);
        table.record(li.clone(), Vsn::from("VOL003"), 5);

        assert_eq!(table.find(&li, &Vsn::from("VOL001")), Some(2));
        assert_eq!(table.find(&li, &Vsn::from("VOL004")), None);

        table.purge(2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(&li, &Vsn::from("VOL003")), Some(5));
        table.purge(5);
        assert!(table.is_empty());
    }
}
