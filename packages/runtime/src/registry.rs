use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use switchboard_core::CandidateId;

// ---------------------------------------------------------------------------
// Registered
// ---------------------------------------------------------------------------

/// A candidate together with the id it was registered under.
pub struct Registered<T: ?Sized> {
    pub id: CandidateId,
    pub candidate: Arc<T>,
}

impl<T: ?Sized> Clone for Registered<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            candidate: Arc::clone(&self.candidate),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Registered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registered").field("id", &self.id).finish()
    }
}

// ---------------------------------------------------------------------------
// CandidateRegistry
// ---------------------------------------------------------------------------

/// Ordered, copy-on-write list of competing candidates.
///
/// Readers take a [`snapshot`](Self::snapshot) and iterate it without
/// holding any lock, so a candidate added or removed mid-iteration never
/// disturbs an in-progress fan-out. Writers rebuild the list. Registration
/// order is preserved; it breaks ties during arbitration.
pub struct CandidateRegistry<T: ?Sized> {
    entries: ArcSwap<Vec<Registered<T>>>,
    next_id: AtomicU64,
    /// Serializes writers; readers never take it.
    write_lock: Mutex<()>,
}

impl<T: ?Sized> fmt::Debug for CandidateRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CandidateRegistry")
            .field("len", &self.entries.load().len())
            .finish()
    }
}

impl<T: ?Sized> CandidateRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(1),
            write_lock: Mutex::new(()),
        }
    }

    /// Appends a candidate and returns its freshly allocated id.
    pub fn add(&self, candidate: Arc<T>) -> CandidateId {
        let id = CandidateId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _guard = self.write_lock.lock();
        let mut next = Vec::clone(&self.entries.load());
        next.push(Registered { id, candidate });
        self.entries.store(Arc::new(next));
        id
    }

    /// Removes a candidate, returning it if it was registered.
    pub fn remove(&self, id: CandidateId) -> Option<Arc<T>> {
        let _guard = self.write_lock.lock();
        let current = self.entries.load_full();
        let position = current.iter().position(|r| r.id == id)?;
        let mut next = Vec::clone(&current);
        let removed = next.remove(position);
        self.entries.store(Arc::new(next));
        Some(removed.candidate)
    }

    /// Removes every candidate, returning them in registration order.
    pub fn clear(&self) -> Vec<Registered<T>> {
        let _guard = self.write_lock.lock();
        let previous = self.entries.swap(Arc::new(Vec::new()));
        Vec::clone(&previous)
    }

    /// Looks up a candidate by id.
    pub fn get(&self, id: CandidateId) -> Option<Arc<T>> {
        self.entries
            .load()
            .iter()
            .find(|r| r.id == id)
            .map(|r| Arc::clone(&r.candidate))
    }

    /// Point-in-time view of all candidates in registration order.
    pub fn snapshot(&self) -> Arc<Vec<Registered<T>>> {
        self.entries.load_full()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

impl<T: ?Sized> Default for CandidateRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
