//! Lazily computed batch items.
use std::mem;

/// A derived item of a [`Batch`](super::Batch).
///
/// ```text
/// Absent --compute--> Valid --mutation--> Stale
///   ^                   ^                   |
///   |                   +-----recompute-----+
///   +------ merge with a side lacking a valid item
/// ```
///
/// Mutating a batch does not recompute or drop its caches: they are only
/// marked stale. A stale item is still returned by reads that do not ask for
/// recomputation; freshness is the caller's responsibility.
#[derive(Debug, Clone, PartialEq)]
pub enum Cache<T> {
    /// Never computed, or dropped.
    Absent,

    /// Computed from the current content of the batch.
    Valid(T),

    /// Computed before the last mutation of the batch.
    Stale(T),
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Cache::Absent
    }
}

impl<T> Cache<T> {
    /// `true` if the item reflects the current content of the batch.
    pub fn is_available(&self) -> bool {
        matches!(self, Cache::Valid(_))
    }

    /// `true` if the item was computed before the last mutation.
    pub fn is_stale(&self) -> bool {
        matches!(self, Cache::Stale(_))
    }

    /// The item, fresh or stale.
    pub fn get(&self) -> Option<&T> {
        match self {
            Cache::Absent => None,
            Cache::Valid(t) | Cache::Stale(t) => Some(t),
        }
    }

    /// Stores a freshly computed item.
    pub fn set(&mut self, item: T) {
        *self = Cache::Valid(item);
    }

    /// Marks the item stale.
    pub fn invalidate(&mut self) {
        *self = match mem::take(self) {
            Cache::Valid(t) => Cache::Stale(t),
            other => other,
        };
    }

    /// Combines the items of two batches.
    ///
    /// The result is valid only if both sides are valid and `f` succeeds;
    /// otherwise it is absent and will be recomputed on demand.
    pub fn merge(self, other: Cache<T>, f: impl FnOnce(T, T) -> Option<T>) -> Cache<T> {
        match (self, other) {
            (Cache::Valid(a), Cache::Valid(b)) => match f(a, b) {
                Some(t) => Cache::Valid(t),
                None => Cache::Absent,
            },
            _ => Cache::Absent,
        }
    }
}
