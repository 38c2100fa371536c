use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::claims::{IdentityClaims, Pid};

/// Process-wide mapping from process id to the most recently
/// authenticated identity for that process.
///
/// Thread-safe: a single map-wide mutex covers both reads and writes, so a
/// reader never observes a half-written binding. Entries are never evicted
/// here; a new authentication for the same pid overwrites the old one.
#[derive(Debug, Default)]
pub struct IdentityDirectory {
    bindings: Mutex<HashMap<Pid, IdentityClaims>>,
}

impl IdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `claims` to `pid`, returning the identity it replaced.
    pub fn put(&self, pid: Pid, claims: IdentityClaims) -> Option<IdentityClaims> {
        self.lock().insert(pid, claims)
    }

    /// Identity bound to `pid`, if any.
    pub fn get(&self, pid: Pid) -> Option<IdentityClaims> {
        self.lock().get(&pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // A poisoned lock only means a writer panicked between whole-value
    // inserts; the map itself is still consistent.
    fn lock(&self) -> MutexGuard<'_, HashMap<Pid, IdentityClaims>> {
        self.bindings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
