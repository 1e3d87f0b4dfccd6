//! Request queues
//!
//! All queue entries live in one generation-checked pool; the three
//! scheduler queues are intrusive doubly linked lists over it. An entry is
//! in at most one queue at a time. Insertion keeps entries ordered by
//! scheduling priority, highest first, first-in-first-out among equals;
//! removal unlinks in constant time.
//!
//! Besides real requests the pool holds two pseudo entry kinds that carry
//! follow-up work for an active request: a volume request from a worker
//! that filled its volume, and a more-work marker for an instance whose
//! worker finished while selected files remain.

use crate::request::ArchiveRequest;
use crate::types::RequestName;

/// Handle to a pool entry. Stale handles (the slot was freed or reused)
/// resolve to `None` rather than a different entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId {
    index: u32,
    gen: u32,
}

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.gen)
    }
}

/// Which queue an entry is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Schedule,
    Archive,
    Wait,
}

impl QueueKind {
    pub fn name(self) -> &'static str {
        match self {
            QueueKind::Schedule => "schedule",
            QueueKind::Archive => "archive",
            QueueKind::Wait => "wait",
        }
    }
}

/// Payload of a queue entry.
#[derive(Debug)]
pub enum EntryKind {
    /// A real archive request.
    Normal(ArchiveRequest),
    /// A worker on `owner` filled its volume and wants another. `pid`
    /// guards against the instance slot being reused before the scan.
    VolumeRequest {
        owner: EntryId,
        copy: usize,
        pid: u32,
        priority: f64,
    },
    /// Instance `copy` of `owner` finished a volume with selected files
    /// left over; compose and start the remainder.
    MoreWork {
        owner: EntryId,
        copy: usize,
        priority: f64,
    },
}

impl EntryKind {
    pub fn priority(&self) -> f64 {
        match self {
            EntryKind::Normal(req) => req.sched_priority,
            EntryKind::VolumeRequest { priority, .. } => *priority,
            EntryKind::MoreWork { priority, .. } => *priority,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            EntryKind::Normal(_) => "request",
            EntryKind::VolumeRequest { .. } => "volume-request",
            EntryKind::MoreWork { .. } => "more-work",
        }
    }

    pub fn request(&self) -> Option<&ArchiveRequest> {
        match self {
            EntryKind::Normal(req) => Some(req),
            _ => None,
        }
    }

    pub fn request_mut(&mut self) -> Option<&mut ArchiveRequest> {
        match self {
            EntryKind::Normal(req) => Some(req),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Entry {
    pub kind: EntryKind,
    pub queue: Option<QueueKind>,
    prev: Option<EntryId>,
    next: Option<EntryId>,
}

#[derive(Debug)]
struct Slot {
    gen: u32,
    body: Option<Entry>,
}

/// Slab of queue entries with a free list.
#[derive(Debug, Default)]
pub struct EntryPool {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl EntryPool {
    pub fn new() -> Self {
        EntryPool::default()
    }

    pub fn insert(&mut self, kind: EntryKind) -> EntryId {
        let entry = Entry {
            kind,
            queue: None,
            prev: None,
            next: None,
        };
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.body = Some(entry);
                EntryId {
                    index,
                    gen: slot.gen,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    gen: 0,
                    body: Some(entry),
                });
                EntryId { index, gen: 0 }
            }
        }
    }

    /// Free an unlinked entry. Freeing while still queued is a logic error.
    pub fn remove(&mut self, id: EntryId) -> Option<EntryKind> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        let entry = slot.body.take()?;
        debug_assert!(entry.queue.is_none(), "freeing a queued entry");
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id.index);
        Some(entry.kind)
    }

    pub fn get(&self, id: EntryId) -> Option<&Entry> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.body.as_ref()
    }

    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        slot.body.as_mut()
    }

    pub fn request(&self, id: EntryId) -> Option<&ArchiveRequest> {
        self.get(id).and_then(|e| e.kind.request())
    }

    pub fn request_mut(&mut self, id: EntryId) -> Option<&mut ArchiveRequest> {
        self.get_mut(id).and_then(|e| e.kind.request_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One priority-ordered queue over the pool.
#[derive(Debug)]
pub struct Queue {
    kind: QueueKind,
    head: Option<EntryId>,
    tail: Option<EntryId>,
    len: usize,
}

impl Queue {
    pub fn new(kind: QueueKind) -> Self {
        Queue {
            kind,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert in priority order: after every entry with priority greater
    /// than or equal to the new entry's.
    pub fn push(&mut self, pool: &mut EntryPool, id: EntryId) {
        let priority = match pool.get(id) {
            Some(entry) => {
                debug_assert!(entry.queue.is_none(), "entry already queued");
                entry.kind.priority()
            }
            None => return,
        };

        let mut after = None;
        let mut cursor = self.head;
        while let Some(cur) = cursor {
            let entry = match pool.get(cur) {
                Some(entry) => entry,
                None => break,
            };
            if entry.kind.priority() < priority {
                break;
            }
            after = Some(cur);
            cursor = entry.next;
        }

        match after {
            None => {
                // New head.
                let old_head = self.head;
                if let Some(entry) = pool.get_mut(id) {
                    entry.prev = None;
                    entry.next = old_head;
                    entry.queue = Some(self.kind);
                }
                match old_head {
                    Some(h) => {
                        if let Some(entry) = pool.get_mut(h) {
                            entry.prev = Some(id);
                        }
                    }
                    None => self.tail = Some(id),
                }
                self.head = Some(id);
            }
            Some(prev) => {
                let next = pool.get(prev).and_then(|e| e.next);
                if let Some(entry) = pool.get_mut(id) {
                    entry.prev = Some(prev);
                    entry.next = next;
                    entry.queue = Some(self.kind);
                }
                if let Some(entry) = pool.get_mut(prev) {
                    entry.next = Some(id);
                }
                match next {
                    Some(n) => {
                        if let Some(entry) = pool.get_mut(n) {
                            entry.prev = Some(id);
                        }
                    }
                    None => self.tail = Some(id),
                }
            }
        }
        self.len += 1;
    }

    /// Unlink `id` from this queue. False if it was not linked here.
    pub fn remove(&mut self, pool: &mut EntryPool, id: EntryId) -> bool {
        let (prev, next) = match pool.get(id) {
            Some(entry) if entry.queue == Some(self.kind) => (entry.prev, entry.next),
            _ => return false,
        };
        match prev {
            Some(p) => {
                if let Some(entry) = pool.get_mut(p) {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(entry) = pool.get_mut(n) {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(entry) = pool.get_mut(id) {
            entry.queue = None;
            entry.prev = None;
            entry.next = None;
        }
        self.len -= 1;
        true
    }

    /// Entry ids in queue order. A snapshot, safe to hold across removals.
    pub fn ids(&self, pool: &EntryPool) -> Vec<EntryId> {
        let mut out = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            out.push(id);
            cursor = pool.get(id).and_then(|e| e.next);
        }
        out
    }

    pub fn head(&self) -> Option<EntryId> {
        self.head
    }

    /// First real request with the given name.
    pub fn find(&self, pool: &EntryPool, name: &RequestName) -> Option<EntryId> {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let entry = pool.get(id)?;
            if let Some(req) = entry.kind.request() {
                if req.name == *name {
                    return Some(id);
                }
            }
            cursor = entry.next;
        }
        None
    }

    /// Log the queue contents.
    pub fn trace(&self, pool: &EntryPool) {
        tracing::info!(queue = self.kind.name(), entries = self.len, "queue");
        for id in self.ids(pool) {
            let Some(entry) = pool.get(id) else { continue };
            match &entry.kind {
                EntryKind::Normal(req) => {
                    tracing::info!(
                        queue = self.kind.name(),
                        entry = %id,
                        name = %req.name,
                        priority = req.sched_priority,
                        state = ?req.state,
                        files = req.sel_files,
                        space = req.sel_space,
                        active = req.active_instances(),
                        "  entry"
                    );
                }
                EntryKind::VolumeRequest {
                    owner,
                    copy,
                    pid,
                    priority,
                } => {
                    tracing::info!(
                        queue = self.kind.name(),
                        entry = %id,
                        kind = "volume-request",
                        owner = %owner,
                        copy,
                        pid,
                        priority,
                        "  entry"
                    );
                }
                EntryKind::MoreWork {
                    owner,
                    copy,
                    priority,
                } => {
                    tracing::info!(
                        queue = self.kind.name(),
                        entry = %id,
                        kind = "more-work",
                        owner = %owner,
                        copy,
                        priority,
                        "  entry"
                    );
                }
            }
        }
    }
}

/// The pool plus the three scheduler queues.
#[derive(Debug)]
pub struct Queues {
    pub pool: EntryPool,
    pub schedule: Queue,
    pub archive: Queue,
    pub wait: Queue,
}

impl Queues {
    pub fn new() -> Self {
        Queues {
            pool: EntryPool::new(),
            schedule: Queue::new(QueueKind::Schedule),
            archive: Queue::new(QueueKind::Archive),
            wait: Queue::new(QueueKind::Wait),
        }
    }

    pub fn queue_mut(&mut self, kind: QueueKind) -> &mut Queue {
        match kind {
            QueueKind::Schedule => &mut self.schedule,
            QueueKind::Archive => &mut self.archive,
            QueueKind::Wait => &mut self.wait,
        }
    }

    /// Insert a pooled entry into the named queue.
    pub fn enqueue(&mut self, kind: QueueKind, id: EntryId) {
        match kind {
            QueueKind::Schedule => self.schedule.push(&mut self.pool, id),
            QueueKind::Archive => self.archive.push(&mut self.pool, id),
            QueueKind::Wait => self.wait.push(&mut self.pool, id),
        }
    }

    /// Unlink `id` from whichever queue holds it.
    pub fn unlink(&mut self, id: EntryId) -> bool {
        match self.pool.get(id).and_then(|e| e.queue) {
            Some(QueueKind::Schedule) => self.schedule.remove(&mut self.pool, id),
            Some(QueueKind::Archive) => self.archive.remove(&mut self.pool, id),
            Some(QueueKind::Wait) => self.wait.remove(&mut self.pool, id),
            None => false,
        }
    }

    /// Unlink and free, returning the payload.
    pub fn discard(&mut self, id: EntryId) -> Option<EntryKind> {
        self.unlink(id);
        self.pool.remove(id)
    }

    /// Move an entry between queues, reinserting by current priority.
    pub fn requeue(&mut self, id: EntryId, to: QueueKind) {
        self.unlink(id);
        self.enqueue(to, id);
    }
}

impl Default for Queues {
    fn default() -> Self {
        Queues::new()
    }
}
