//! Trajectories held by a batch.
use crate::{Env, GfnError, StateSpace, TrajId};
use std::collections::{HashMap, VecDeque};

/// A trajectory of a batch.
pub(super) struct TrajSlot<S: StateSpace> {
    pub id: TrajId,

    /// Copy of the environment as it was when the trajectory was first added.
    pub env: Env<S>,

    /// Row indices, source first.
    pub rows: VecDeque<usize>,

    /// State of the environment after the last backward step. It is the state
    /// of the next row added for this trajectory in backward mode.
    pub pending_state: Option<S::State>,
}

/// Trajectory slots with lookup by id. Slots keep the order of first insertion.
pub(super) struct TrajArena<S: StateSpace> {
    slots: Vec<TrajSlot<S>>,
    lookup: HashMap<TrajId, usize>,
}

impl<S: StateSpace> Default for TrajArena<S> {
    fn default() -> Self {
        Self {
            slots: vec![],
            lookup: HashMap::new(),
        }
    }
}

impl<S: StateSpace> TrajArena<S> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrajSlot<S>> {
        self.slots.iter()
    }

    pub fn contains(&self, id: TrajId) -> bool {
        self.lookup.contains_key(&id)
    }

    pub fn get(&self, id: TrajId) -> Option<&TrajSlot<S>> {
        self.lookup.get(&id).map(|&i| &self.slots[i])
    }

    /// The slot of `env`, created with a copy of it if the trajectory is new.
    pub fn entry(&mut self, id: TrajId, env: &Env<S>) -> &mut TrajSlot<S> {
        let i = match self.lookup.get(&id) {
            Some(&i) => i,
            None => {
                self.slots.push(TrajSlot {
                    id,
                    env: env.clone(),
                    rows: VecDeque::new(),
                    pending_state: None,
                });
                self.lookup.insert(id, self.slots.len() - 1);
                self.slots.len() - 1
            }
        };
        &mut self.slots[i]
    }

    /// Environment that sampled trajectory `id`.
    pub fn env(&self, id: TrajId) -> Result<&Env<S>, GfnError> {
        self.get(id)
            .map(|slot| &slot.env)
            .ok_or(GfnError::UnknownTrajectory(id))
    }

    pub fn max_id(&self) -> Option<TrajId> {
        self.slots.iter().map(|slot| slot.id).max()
    }

    /// Adds `by` to every id.
    pub fn shift(&mut self, by: u64) {
        self.lookup.clear();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            slot.id = slot.id.shifted(by);
            slot.env.set_id(slot.id);
            self.lookup.insert(slot.id, i);
        }
    }

    /// Moves the slots of `other` into `self`, offsetting their rows by `row_offset`.
    ///
    /// Ids of `other` must not collide with ids of `self`.
    pub fn append(&mut self, other: TrajArena<S>, row_offset: usize) {
        for mut slot in other.slots.into_iter() {
            slot.rows.iter_mut().for_each(|r| *r += row_offset);
            self.lookup.insert(slot.id, self.slots.len());
            self.slots.push(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dummy::{Grid, GridConfig},
        reward::RewardConfig,
    };
    use anyhow::Result;

    #[test]
    fn test_entry_shift_append() -> Result<()> {
        let env = Env::<Grid>::build(&GridConfig::default(), &RewardConfig::default())?;
        let mut a = TrajArena::default();
        a.entry(TrajId::new(0), &env).rows.push_back(0);
        a.entry(TrajId::new(2), &env).rows.push_back(1);
        a.entry(TrajId::new(0), &env).rows.push_back(2);
        assert_eq!(a.len(), 2);
        assert_eq!(a.max_id(), Some(TrajId::new(2)));

        let mut b = TrajArena::default();
        b.entry(TrajId::new(0), &env).rows.push_back(0);
        b.shift(3);
        assert!(b.contains(TrajId::new(3)));
        assert_eq!(b.env(TrajId::new(3))?.id(), Some(TrajId::new(3)));

        a.append(b, 3);
        assert_eq!(a.len(), 3);
        assert_eq!(a.get(TrajId::new(3)).map(|s| s.rows.clone()), Some(VecDeque::from(vec![3])));
        assert!(matches!(
            a.env(TrajId::new(7)),
            Err(GfnError::UnknownTrajectory(_))
        ));
        Ok(())
    }
}
