//! Composer interface
//!
//! The composer owns file selection. It builds requests, divides their
//! files across copy instances, and takes requests back when the
//! scheduler is done with them or cannot serve them. The scheduler only
//! moves the numbers the composer wrote into each instance.

use crate::config::ArchSet;
use crate::request::ArchiveRequest;

/// File-selection collaborator.
pub trait Composer: Send + Sync {
    /// Take a request back for recomposition. The scheduler calls this
    /// with its lock released; the composer re-enqueues at its leisure.
    fn requeue(&self, req: ArchiveRequest);

    /// Whether the request still matches what the composer would build
    /// today. Stale requests are handed back instead of scheduled.
    fn request_valid(&self, req: &ArchiveRequest) -> bool;

    /// Split the selected files across `drives` instances. Clears every
    /// instance, then fills the first `drives` with files, space,
    /// smallest-file size and owner key, sets `drives_used`, and flags
    /// `more` on instances with files left beyond their share. Called
    /// repeatedly with decreasing counts when volumes run short.
    fn divide_for_drives(&self, req: &mut ArchiveRequest, set: &ArchSet, drives: usize);

    /// Refill instance `copy` from the files not yet archived, clearing
    /// it first. Used when a worker finished its volume with selected
    /// files remaining; a refill that finds nothing leaves the instance
    /// cleared and inactive.
    fn select_for_copy(&self, req: &mut ArchiveRequest, set: &ArchSet, copy: usize);

    /// Cut instance `copy`'s selection down to what fits in
    /// `avail_space` across overflow volumes with minimum piece size
    /// `ovflmin`. Leaves the instance's space at 0 when nothing fits.
    fn select_fit(&self, req: &mut ArchiveRequest, copy: usize, avail_space: u64, ovflmin: u64);

    /// Final division of instance `copy` into archive files ahead of the
    /// worker launch, honoring the archive-file size limit and the
    /// volume overflow minimum against the assigned volume's space.
    fn make_tarballs(
        &self,
        req: &mut ArchiveRequest,
        copy: usize,
        archmax: u64,
        ovflmin: u64,
        vol_space: u64,
    );

    /// How many of the request's selected files cannot be staged.
    fn non_stageable(&self, req: &ArchiveRequest) -> u64;
}
