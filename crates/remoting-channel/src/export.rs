use std::collections::{HashMap, VecDeque};
use std::panic::Location;
use std::sync::Arc;

use bytes::Bytes;
use remoting_proto::Oid;

use crate::id_allocator::IdAllocator;

/// A reference-counted entry in the export table. `pins` tracks references
/// the local side itself holds open (e.g. a pending call referencing a
/// callback argument) independently of the remote's refcount, so a pinned
/// object survives an `unexport` raced against an in-flight call.
struct Entry {
    payload: Bytes,
    refcount: u32,
    pins: u32,
    allocated_at: &'static Location<'static>,
}

/// Diagnostic record kept after an object is unexported, so a later
/// reference to a stale OID can report *why* it's gone instead of just
/// "unknown object" — including where it was originally exported from and
/// where it was released, for whichever call site triggers the lookup.
#[derive(Debug, Clone)]
pub struct UnexportRecord {
    pub oid: Oid,
    pub reason: &'static str,
    pub allocated_at: &'static Location<'static>,
    pub released_at: &'static Location<'static>,
}

/// Identity of a `Bytes` payload: its backing buffer's address plus length.
/// Two `Bytes` handles that were cloned from the same original share this,
/// the same way two references to the same Java object share identity —
/// which is what lets re-exporting "the same object" be detected at all,
/// since this core only ever sees exported objects as opaque `Bytes`.
type Identity = (usize, usize);

fn identity_of(payload: &Bytes) -> Identity {
    (payload.as_ptr() as usize, payload.len())
}

/// Tracks objects this side has exported to the peer: payload bytes keyed by
/// [`Oid`], reference counts, and a bounded audit trail of recently
/// unexported IDs.
pub(crate) struct ExportTable {
    entries: HashMap<Oid, Entry>,
    /// Reverse index from a payload's identity to the OID it was already
    /// exported under, so exporting the same object twice reuses the OID
    /// instead of minting a new one.
    by_identity: HashMap<Identity, Oid>,
    allocator: IdAllocator<Oid>,
    unexport_log: VecDeque<UnexportRecord>,
    unexport_log_size: usize,
}

impl ExportTable {
    pub(crate) fn new(unexport_log_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_identity: HashMap::new(),
            allocator: IdAllocator::new(),
            unexport_log: VecDeque::new(),
            unexport_log_size,
        }
    }

    /// Exports `payload` under a freshly allocated OID with refcount 1, or,
    /// if this exact object is already exported, increments its refcount and
    /// returns the OID it already has.
    #[track_caller]
    pub(crate) fn export(&mut self, payload: Bytes) -> Oid {
        let identity = identity_of(&payload);
        if let Some(&oid) = self.by_identity.get(&identity) {
            self.add_ref(oid);
            return oid;
        }

        let oid = self.allocator.alloc().expect("object id space exhausted");
        self.by_identity.insert(identity, oid);
        self.entries.insert(
            oid,
            Entry {
                payload,
                refcount: 1,
                pins: 0,
                allocated_at: Location::caller(),
            },
        );
        oid
    }

    pub(crate) fn get(&self, oid: Oid) -> Option<Bytes> {
        self.entries.get(&oid).map(|e| e.payload.clone())
    }

    /// Increments the remote-held refcount for `oid`, used when the same
    /// object is referenced again by a later command.
    pub(crate) fn add_ref(&mut self, oid: Oid) {
        if let Some(entry) = self.entries.get_mut(&oid) {
            entry.refcount += 1;
        }
    }

    /// Pins `oid` so a concurrent unexport can't remove it until
    /// [`ExportTable::unpin`] is called, even if the remote's refcount drops
    /// to zero in between.
    pub(crate) fn pin(&mut self, oid: Oid) {
        if let Some(entry) = self.entries.get_mut(&oid) {
            entry.pins += 1;
        }
    }

    #[track_caller]
    pub(crate) fn unpin(&mut self, oid: Oid) {
        if let Some(entry) = self.entries.get_mut(&oid) {
            entry.pins = entry.pins.saturating_sub(1);
            self.maybe_collect_with_reason(oid, "unpinned after refcount reached zero", Location::caller());
        }
    }

    /// Drops one reference; removes and logs the object once refcount and
    /// pin count both reach zero.
    #[track_caller]
    pub(crate) fn unexport(&mut self, oid: Oid, reason: &'static str) {
        if let Some(entry) = self.entries.get_mut(&oid) {
            entry.refcount = entry.refcount.saturating_sub(1);
        }
        self.maybe_collect_with_reason(oid, reason, Location::caller());
    }

    fn maybe_collect_with_reason(&mut self, oid: Oid, reason: &'static str, released_at: &'static Location<'static>) {
        let should_remove = matches!(self.entries.get(&oid), Some(e) if e.refcount == 0 && e.pins == 0);
        if should_remove {
            if let Some(entry) = self.entries.remove(&oid) {
                self.by_identity.remove(&identity_of(&entry.payload));
                self.allocator.free(oid);
                self.log_unexport(oid, reason, entry.allocated_at, released_at);
            }
        }
    }

    fn log_unexport(
        &mut self,
        oid: Oid,
        reason: &'static str,
        allocated_at: &'static Location<'static>,
        released_at: &'static Location<'static>,
    ) {
        if self.unexport_log_size == 0 {
            return;
        }
        if self.unexport_log.len() >= self.unexport_log_size {
            self.unexport_log.pop_front();
        }
        self.unexport_log.push_back(UnexportRecord {
            oid,
            reason,
            allocated_at,
            released_at,
        });
    }

    /// Explains a reference to an `oid` that is no longer exported, if it
    /// was ever exported on this table.
    pub(crate) fn diagnose_stale(&self, oid: Oid) -> Option<&UnexportRecord> {
        self.unexport_log.iter().rev().find(|rec| rec.oid == oid)
    }

    /// Unconditionally clears every exported object, logging each as
    /// unexported for `reason` regardless of outstanding refcount or pins.
    /// Used when the owning channel tears down: nothing is left to hold
    /// these objects open once there's no channel to carry their traffic.
    #[track_caller]
    pub(crate) fn abort(&mut self, reason: &'static str) {
        let released_at = Location::caller();
        let oids: Vec<Oid> = self.entries.keys().copied().collect();
        for oid in oids {
            if let Some(entry) = self.entries.remove(&oid) {
                self.by_identity.remove(&identity_of(&entry.payload));
                self.allocator.free(oid);
                self.log_unexport(oid, reason, entry.allocated_at, released_at);
            }
        }
    }
}

pub(crate) type SharedExportTable = Arc<parking_lot::Mutex<ExportTable>>;
