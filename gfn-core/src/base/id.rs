//! Trajectory identifiers.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle of a trajectory.
///
/// Each [`Env`](crate::Env) instance samples exactly one trajectory, and its id
/// must be unique within a [`Batch`](crate::batch::Batch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrajId(u64);

impl TrajId {
    /// Creates an id from its raw value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value of the id.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Id shifted by `by`.
    pub fn shifted(&self, by: u64) -> Self {
        Self(self.0 + by)
    }
}

impl fmt::Display for TrajId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Issues fresh trajectory ids.
///
/// Ids returned with [`TrajIdPool::release`] are handed out again before new
/// ones are minted, so long-running samplers keep ids small.
#[derive(Debug, Clone, Default)]
pub struct TrajIdPool {
    next: u64,
    free: Vec<TrajId>,
}

impl TrajIdPool {
    /// Creates a pool whose first id is `first`.
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: first,
            free: vec![],
        }
    }

    /// Takes an id out of the pool.
    pub fn issue(&mut self) -> TrajId {
        match self.free.pop() {
            Some(id) => id,
            None => {
                let id = TrajId(self.next);
                self.next += 1;
                id
            }
        }
    }

    /// Takes `n` ids out of the pool.
    pub fn issue_n(&mut self, n: usize) -> Vec<TrajId> {
        (0..n).map(|_| self.issue()).collect()
    }

    /// Gives an id back to the pool.
    ///
    /// The caller must no longer use `id` for a trajectory it keeps.
    pub fn release(&mut self, id: TrajId) {
        if id.0 + 1 == self.next {
            self.next -= 1;
        } else if id.0 < self.next && !self.free.contains(&id) {
            self.free.push(id);
        }
    }

    /// Makes sure that every id issued from now on is strictly larger than `id`.
    pub fn reserve_above(&mut self, id: TrajId) {
        self.free.retain(|f| f.0 > id.0);
        if self.next <= id.0 {
            self.next = id.0 + 1;
        }
    }
}
