//! Batch of transitions of many trajectories.
use super::{
    cache::Cache,
    format::{SortBy, StateBatch, StateFormat},
    traj::TrajArena,
};
use crate::{Action, Env, GfnError, StateSpace, TrajId};
use anyhow::Result;
use itertools::Itertools;
use log::{debug, error, info, trace, warn};
use ndarray::{concatenate, Array1, Array2, Axis};
use std::{collections::HashSet, iter, mem};

/// Every parent of every row of a batch.
#[derive(Debug, Clone)]
pub struct ParentsAll<S: StateSpace> {
    /// Parent states, concatenated over rows.
    pub states: Vec<S::State>,

    /// Action leading from each parent to the state of its row.
    pub actions: Vec<Action>,

    /// Row of each parent.
    pub indices: Vec<usize>,

    /// Parents in policy format.
    pub policy: Array2<f32>,
}

/// Transitions of many trajectories, with items derived from them on demand.
///
/// Each row holds a state, the action that was applied, the done flag and the
/// trajectory it belongs to. Rows of different trajectories may interleave:
/// environments are stepped in parallel and added to the batch as they go.
/// The batch keeps, for each trajectory, its rows in source-to-terminal order
/// and a copy of the environment that sampled it.
///
/// Derived items (states in policy format, parents, masks, rewards) are
/// computed on the first request and cached. Adding rows marks them stale but
/// does not recompute them; pass `force = true` to get fresh values.
///
/// ```
/// # use anyhow::Result;
/// # use std::sync::Arc;
/// use gfn_core::{
///     batch::Batch,
///     dummy::{CornerScorer, Grid, GridConfig},
///     reward::RewardConfig,
///     Action, Env, TrajId,
/// };
///
/// # fn main() -> Result<()> {
/// let mut env = Env::<Grid>::build(&GridConfig::default(), &RewardConfig::default())?
///     .with_scorer(Arc::new(CornerScorer));
/// env.reset(Some(TrajId::new(0)));
///
/// let mut batch = Batch::new(&env);
/// for action in [Action::Discrete(0), Action::Stop] {
///     let (_, action, valid) = env.step(action);
///     batch.add_to_batch(&[env.clone()], &[action], &[valid], None, false, true)?;
/// }
/// assert_eq!(batch.len(), 2);
/// assert_eq!(batch.get_parents(false)?[1], vec![1, 0]);
/// # Ok(())
/// # }
/// ```
pub struct Batch<S: StateSpace> {
    /// Template environment. Used for conversions of non-conditional batches and for scoring.
    env: Env<S>,
    conditional: bool,
    continuous: bool,
    size: usize,
    trajs: TrajArena<S>,

    traj_indices: Vec<TrajId>,
    state_indices: Vec<usize>,
    states: Vec<S::State>,
    actions: Vec<Action>,
    done: Vec<bool>,

    /// Forward mask of each row, if recorded or computed.
    masks_forward: Vec<Option<Vec<bool>>>,

    states_policy: Cache<Array2<f32>>,
    parents: Cache<Vec<S::State>>,
    parents_policy: Cache<Array2<f32>>,
    parents_all: Cache<ParentsAll<S>>,
    masks_backward: Cache<Array2<bool>>,
    rewards: Cache<Array1<f32>>,
}

fn needs_compute<T>(cache: &Cache<T>, name: &str, force: bool) -> bool {
    match cache {
        Cache::Absent => true,
        _ if force => true,
        Cache::Stale(_) => {
            warn!("Returning stale {}; pass force = true to recompute", name);
            false
        }
        Cache::Valid(_) => false,
    }
}

fn cached<'a, T>(cache: &'a Cache<T>, name: &str) -> Result<&'a T> {
    cache
        .get()
        .ok_or_else(|| GfnError::CorruptBatch(format!("{} was not computed", name)).into())
}

fn mask_array(rows: Vec<Vec<bool>>, dim: usize) -> Result<Array2<bool>> {
    if let Some(row) = rows.iter().find(|row| row.len() != dim) {
        return Err(GfnError::InvalidArgument(format!(
            "mask has {} entries, expected {}",
            row.len(),
            dim
        ))
        .into());
    }
    let n = rows.len();
    Ok(Array2::from_shape_vec(
        (n, dim),
        rows.into_iter().flatten().collect(),
    )?)
}

fn check_len(what: &str, expected: usize, actual: usize) -> Result<(), GfnError> {
    if expected != actual {
        return Err(GfnError::InvalidArgument(format!(
            "{} has {} entries, expected {}",
            what, actual, expected
        )));
    }
    Ok(())
}

impl<S: StateSpace> Batch<S> {
    /// Creates an empty batch for environments like `env`.
    pub fn new(env: &Env<S>) -> Self {
        let mut env = env.clone();
        env.reset(None);
        Self {
            conditional: env.is_conditional(),
            continuous: env.is_continuous(),
            env,
            size: 0,
            trajs: TrajArena::default(),
            traj_indices: vec![],
            state_indices: vec![],
            states: vec![],
            actions: vec![],
            done: vec![],
            masks_forward: vec![],
            states_policy: Cache::Absent,
            parents: Cache::Absent,
            parents_policy: Cache::Absent,
            parents_all: Cache::Absent,
            masks_backward: Cache::Absent,
            rewards: Cache::Absent,
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.size
    }

    /// `true` if the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Template environment.
    pub fn env(&self) -> &Env<S> {
        &self.env
    }

    /// Whether states are converted with the environment of their trajectory.
    pub fn is_conditional(&self) -> bool {
        self.conditional
    }

    /// Whether actions are continuous.
    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// Source state of the template environment.
    pub fn source(&self) -> S::State {
        self.env.source()
    }

    /// Number of trajectories.
    pub fn get_n_trajectories(&self) -> usize {
        self.trajs.len()
    }

    /// Trajectory id of each row.
    pub fn get_trajectory_indices(&self) -> &[TrajId] {
        &self.traj_indices
    }

    /// Number of actions applied by the environment when each row was added.
    pub fn get_state_indices(&self) -> &[usize] {
        &self.state_indices
    }

    /// Trajectory ids in order of first appearance.
    pub fn trajectory_ids(&self) -> Vec<TrajId> {
        self.trajs.iter().map(|slot| slot.id).collect()
    }

    /// Rows of trajectory `id`, source first.
    pub fn trajectory_rows(&self, id: TrajId) -> Result<Vec<usize>> {
        let slot = self.trajs.get(id).ok_or(GfnError::UnknownTrajectory(id))?;
        Ok(slot.rows.iter().copied().collect())
    }

    /// States of trajectory `id`, source first. The source itself is not included.
    pub fn get_states_of_trajectory(&self, id: TrajId) -> Result<Vec<S::State>> {
        Ok(self
            .trajectory_rows(id)?
            .into_iter()
            .map(|row| self.states[row].clone())
            .collect())
    }

    /// States in native format.
    pub fn states(&self) -> &[S::State] {
        &self.states
    }

    /// Actions.
    pub fn get_actions(&self) -> &[Action] {
        &self.actions
    }

    /// Done flags.
    pub fn get_done(&self) -> &[bool] {
        &self.done
    }

    /// `true` if every row has a forward mask.
    pub fn masks_forward_available(&self) -> bool {
        self.masks_forward.iter().all(Option::is_some)
    }

    /// `true` if the states in policy format reflect the current rows.
    pub fn states_policy_available(&self) -> bool {
        self.states_policy.is_available()
    }

    /// `true` if the parents reflect the current rows.
    pub fn parents_available(&self) -> bool {
        self.parents.is_available()
    }

    /// `true` if all parents reflect the current rows.
    pub fn parents_all_available(&self) -> bool {
        self.parents_all.is_available()
    }

    /// `true` if the backward masks reflect the current rows.
    pub fn masks_backward_available(&self) -> bool {
        self.masks_backward.is_available()
    }

    /// `true` if the rewards reflect the current rows.
    pub fn rewards_available(&self) -> bool {
        self.rewards.is_available()
    }

    fn invalidate(&mut self) {
        self.states_policy.invalidate();
        self.parents.invalidate();
        self.parents_policy.invalidate();
        self.parents_all.invalidate();
        self.masks_backward.invalidate();
        self.rewards.invalidate();
    }

    /// Adds one transition per environment.
    ///
    /// `envs` are environments after they applied `actions`; `valids` tells
    /// which actions were applied. Invalid transitions are skipped. With
    /// `train = false` only done environments are added.
    ///
    /// In forward mode a row holds the state reached by its action. `masks`
    /// are then the forward masks of those states; if omitted in training they
    /// are taken from the environments.
    ///
    /// In backward mode rows are added from the terminating state towards the
    /// source, and a row holds the state *before* the backward step of its
    /// action, so that rows read source to terminal look as if sampled
    /// forward. The first row of a trajectory is its terminating state and is
    /// always done. Backward masks passed in `masks` are not recorded.
    pub fn add_to_batch(
        &mut self,
        envs: &[Env<S>],
        actions: &[Action],
        valids: &[bool],
        masks: Option<&[Vec<bool>]>,
        backward: bool,
        train: bool,
    ) -> Result<()> {
        check_len("actions", envs.len(), actions.len())?;
        check_len("valids", envs.len(), valids.len())?;
        if let Some(masks) = masks {
            check_len("masks", envs.len(), masks.len())?;
            let dim = self.env.policy_output_dim();
            for m in masks.iter() {
                check_len("mask", dim, m.len())?;
            }
        }

        let added = envs
            .iter()
            .enumerate()
            .filter(|(i, env)| valids[*i] && (train || env.is_done()))
            .collect_vec();

        // nothing is stored unless every environment can be
        for (_, env) in added.iter() {
            let id = env.id().ok_or(GfnError::MissingTrajectoryId)?;
            if backward {
                if let Some(slot) = self.trajs.get(id) {
                    if !slot.rows.is_empty() && slot.pending_state.is_none() {
                        return Err(GfnError::CorruptBatch(format!(
                            "trajectory {} has rows but no pending backward state",
                            id
                        ))
                        .into());
                    }
                }
            }
        }

        let mut n_added = 0;
        for (i, env) in added {
            let id = env.id().ok_or(GfnError::MissingTrajectoryId)?;
            let row = self.size;
            let slot = self.trajs.entry(id, env);

            let (state, done) = if backward {
                let pending = slot.pending_state.replace(env.state().clone());
                let entry = match (slot.rows.is_empty(), pending) {
                    (false, Some(state)) => (state, env.is_done()),
                    _ => (env.state().clone(), true),
                };
                slot.rows.push_front(row);
                entry
            } else {
                slot.rows.push_back(row);
                (env.state().clone(), env.is_done())
            };

            let mask = match (backward, masks) {
                (false, Some(masks)) => Some(masks[i].clone()),
                (false, None) if train => Some(env.mask_forward()),
                _ => None,
            };

            trace!(
                "Row {}: trajectory {}, action {}, done {}, state {:?}",
                row,
                id,
                actions[i],
                done,
                state
            );
            self.traj_indices.push(id);
            self.state_indices.push(env.n_actions());
            self.states.push(state);
            self.actions.push(actions[i].clone());
            self.done.push(done);
            self.masks_forward.push(mask);
            self.size += 1;
            n_added += 1;
        }

        if n_added > 0 {
            self.invalidate();
        }
        Ok(())
    }

    /// Converts states into policy format.
    ///
    /// In a conditional batch each state is converted by the environment of
    /// its trajectory in `traj_ids`; rows keep the order of `states`. Otherwise,
    /// or if `traj_ids` is omitted, the template environment converts them all.
    pub fn states2policy(
        &self,
        states: &[S::State],
        traj_ids: Option<&[TrajId]>,
    ) -> Result<Array2<f32>> {
        let traj_ids = match traj_ids {
            Some(ids) => {
                check_len("trajectory ids", states.len(), ids.len())?;
                ids
            }
            None => return self.env.statebatch2policy(states),
        };
        if !self.conditional {
            return self.env.statebatch2policy(states);
        }

        let dim = self.env.space().policy_input_dim();
        let mut out = Array2::zeros((states.len(), dim));
        let groups = traj_ids
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i))
            .into_group_map();
        for (id, positions) in groups.into_iter() {
            let block = self
                .trajs
                .env(id)?
                .statebatch2policy_iter(positions.iter().map(|&i| &states[i]), positions.len())?;
            check_len("policy row", dim, block.ncols())?;
            for (k, &i) in positions.iter().enumerate() {
                out.row_mut(i).assign(&block.row(k));
            }
        }
        Ok(out)
    }

    /// Converts states into proxy format, with the same dispatch as [`Batch::states2policy`].
    pub fn states2proxy(
        &self,
        states: &[S::State],
        traj_ids: Option<&[TrajId]>,
    ) -> Result<Vec<S::Proxy>> {
        let traj_ids = match traj_ids {
            Some(ids) => {
                check_len("trajectory ids", states.len(), ids.len())?;
                ids
            }
            None => return Ok(self.env.statebatch2proxy(states)),
        };
        if !self.conditional {
            return Ok(self.env.statebatch2proxy(states));
        }

        let mut out: Vec<Option<S::Proxy>> = vec![None; states.len()];
        for (i, (state, &id)) in states.iter().zip(traj_ids.iter()).enumerate() {
            out[i] = Some(self.trajs.env(id)?.state2proxy(state));
        }
        out.into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GfnError::CorruptBatch("unconverted proxy state".to_string()).into())
    }

    /// States in policy format, one row per batch row.
    pub fn get_states_policy(&mut self, force: bool) -> Result<&Array2<f32>> {
        if needs_compute(&self.states_policy, "states_policy", force) {
            debug!("Converting {} states to policy format", self.size);
            let policy = self.states2policy(&self.states, Some(self.traj_indices.as_slice()))?;
            self.states_policy.set(policy);
        }
        cached(&self.states_policy, "states_policy")
    }

    /// States of the batch in the requested format.
    ///
    /// `force` only matters for the policy format, which is cached.
    pub fn get_states(&mut self, format: StateFormat, force: bool) -> Result<StateBatch<S>> {
        Ok(match format {
            StateFormat::Native => StateBatch::Native(self.states.clone()),
            StateFormat::Policy => StateBatch::Policy(self.get_states_policy(force)?.clone()),
            StateFormat::Proxy => {
                StateBatch::Proxy(self.states2proxy(&self.states, Some(self.traj_indices.as_slice()))?)
            }
        })
    }

    fn compute_parents(&self) -> Result<Vec<S::State>> {
        let mut parents: Vec<Option<S::State>> = vec![None; self.size];
        for slot in self.trajs.iter() {
            let mut prev: Option<usize> = None;
            for &row in slot.rows.iter() {
                parents[row] = Some(match prev {
                    None => slot.env.source(),
                    Some(p) => self.states[p].clone(),
                });
                prev = Some(row);
            }
        }
        parents
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GfnError::CorruptBatch("row without trajectory".to_string()).into())
    }

    /// Parent of each row: the state of the previous row of its trajectory, or the source.
    pub fn get_parents(&mut self, force: bool) -> Result<&[S::State]> {
        if needs_compute(&self.parents, "parents", force) {
            debug!("Computing parents of {} rows", self.size);
            let parents = self.compute_parents()?;
            self.parents.set(parents);
        }
        Ok(cached(&self.parents, "parents")?.as_slice())
    }

    /// Parents in policy format.
    pub fn get_parents_policy(&mut self, force: bool) -> Result<&Array2<f32>> {
        if needs_compute(&self.parents_policy, "parents_policy", force) {
            let parents = self.get_parents(force)?.to_vec();
            let policy = self.states2policy(&parents, Some(self.traj_indices.as_slice()))?;
            self.parents_policy.set(policy);
        }
        cached(&self.parents_policy, "parents_policy")
    }

    fn compute_parents_all(&self) -> Result<ParentsAll<S>> {
        let mut states = vec![];
        let mut actions = vec![];
        let mut indices = vec![];
        let mut ids = vec![];
        for row in 0..self.size {
            let id = self.traj_indices[row];
            let action = &self.actions[row];
            let (ps, pa) =
                self.trajs
                    .env(id)?
                    .get_parents(&self.states[row], self.done[row], Some(action));
            if !pa.contains(action) {
                error!(
                    "Action {} of row {} does not lead from any parent to {:?}",
                    action, row, self.states[row]
                );
                return Err(GfnError::InconsistentParents {
                    row,
                    action: action.to_string(),
                }
                .into());
            }
            indices.extend(iter::repeat(row).take(ps.len()));
            ids.extend(iter::repeat(id).take(ps.len()));
            states.extend(ps);
            actions.extend(pa);
        }
        let policy = self.states2policy(&states, Some(ids.as_slice()))?;
        Ok(ParentsAll {
            states,
            actions,
            indices,
            policy,
        })
    }

    /// Every parent of every row, with the actions from the parents and their rows.
    ///
    /// Fails if the action of a row is not among the actions from its parents.
    /// Not defined for continuous environments, which have infinitely many parents.
    pub fn get_parents_all(&mut self, force: bool) -> Result<&ParentsAll<S>> {
        if self.continuous {
            return Err(GfnError::UnsupportedOperation(
                "all parents of a continuous environment".to_string(),
            )
            .into());
        }
        if needs_compute(&self.parents_all, "parents_all", force) {
            debug!("Computing all parents of {} rows", self.size);
            let parents_all = self.compute_parents_all()?;
            self.parents_all.set(parents_all);
        }
        cached(&self.parents_all, "parents_all")
    }

    /// All parents in policy format.
    pub fn get_parents_all_policy(&mut self, force: bool) -> Result<&Array2<f32>> {
        Ok(&self.get_parents_all(force)?.policy)
    }

    /// Forward masks, of the rows or of their parents.
    ///
    /// Rows without a recorded mask get one computed by the environment of
    /// their trajectory; `force` recomputes every row. The mask of the parent
    /// of a first row is the mask of the source.
    pub fn get_masks_forward(&mut self, of_parents: bool, force: bool) -> Result<Array2<bool>> {
        for row in 0..self.size {
            if force || self.masks_forward[row].is_none() {
                let env = self.trajs.env(self.traj_indices[row])?;
                self.masks_forward[row] =
                    Some(env.get_mask_invalid_actions_forward(&self.states[row], self.done[row]));
            }
        }
        let masks = self
            .masks_forward
            .iter()
            .cloned()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| GfnError::CorruptBatch("row without forward mask".to_string()))?;

        let dim = self.env.policy_output_dim();
        if !of_parents {
            return mask_array(masks, dim);
        }
        let mut parents_masks: Vec<Vec<bool>> = vec![vec![]; self.size];
        for slot in self.trajs.iter() {
            let mut prev: Option<usize> = None;
            for &row in slot.rows.iter() {
                parents_masks[row] = match prev {
                    None => slot
                        .env
                        .get_mask_invalid_actions_forward(&slot.env.source(), false),
                    Some(p) => masks[p].clone(),
                };
                prev = Some(row);
            }
        }
        mask_array(parents_masks, dim)
    }

    /// Backward masks of the rows.
    pub fn get_masks_backward(&mut self, force: bool) -> Result<&Array2<bool>> {
        if needs_compute(&self.masks_backward, "masks_backward", force) {
            debug!("Computing backward masks of {} rows", self.size);
            let rows = (0..self.size)
                .map(|row| {
                    let env = self.trajs.env(self.traj_indices[row])?;
                    Ok(env.get_mask_invalid_actions_backward(&self.states[row], self.done[row]))
                })
                .collect::<Result<Vec<_>, GfnError>>()?;
            let masks = mask_array(rows, self.env.policy_output_dim())?;
            self.masks_backward.set(masks);
        }
        cached(&self.masks_backward, "masks_backward")
    }

    fn compute_rewards(&self) -> Result<Array1<f32>> {
        let mut rewards = Array1::zeros(self.size);
        let rows = (0..self.size).filter(|&i| self.done[i]).collect_vec();
        if rows.is_empty() {
            return Ok(rewards);
        }
        let states = rows.iter().map(|&i| self.states[i].clone()).collect_vec();
        let ids = rows.iter().map(|&i| self.traj_indices[i]).collect_vec();
        let proxies = self.states2proxy(&states, Some(ids.as_slice()))?;
        let energies = self.env.score(&proxies)?;
        let transform = self.env.reward_transform();
        for (&i, e) in rows.iter().zip(energies) {
            rewards[i] = transform.proxy_to_reward(e);
        }
        Ok(rewards)
    }

    /// Reward of each row, `0` for rows that are not done.
    pub fn get_rewards(&mut self, force: bool) -> Result<&Array1<f32>> {
        if needs_compute(&self.rewards, "rewards", force) {
            debug!("Computing rewards of {} rows", self.size);
            let rewards = self.compute_rewards()?;
            self.rewards.set(rewards);
        }
        cached(&self.rewards, "rewards")
    }

    fn terminating_rows(&self, sort_by: SortBy) -> Vec<usize> {
        let mut rows = (0..self.size).filter(|&i| self.done[i]).collect_vec();
        if sort_by == SortBy::Trajectory {
            rows.sort_by_key(|&i| self.traj_indices[i]);
        }
        rows
    }

    /// Terminating states in the requested format.
    pub fn get_terminating_states(
        &self,
        sort_by: SortBy,
        format: StateFormat,
    ) -> Result<StateBatch<S>> {
        let rows = self.terminating_rows(sort_by);
        let states = rows.iter().map(|&i| self.states[i].clone()).collect_vec();
        let ids = rows.iter().map(|&i| self.traj_indices[i]).collect_vec();
        // conversions dispatch by trajectory, one terminating state each
        if self.conditional && format != StateFormat::Native && !ids.iter().all_unique() {
            return Err(GfnError::CorruptBatch(
                "trajectory with more than one terminating state".to_string(),
            )
            .into());
        }
        Ok(match format {
            StateFormat::Native => StateBatch::Native(states),
            StateFormat::Policy => StateBatch::Policy(self.states2policy(&states, Some(ids.as_slice()))?),
            StateFormat::Proxy => StateBatch::Proxy(self.states2proxy(&states, Some(ids.as_slice()))?),
        })
    }

    /// Rewards of the terminating states, in the same order as [`Batch::get_terminating_states`].
    ///
    /// Cached rewards that do not cover every row are recomputed.
    pub fn get_terminating_rewards(&mut self, sort_by: SortBy, force: bool) -> Result<Array1<f32>> {
        let rows = self.terminating_rows(sort_by);
        let short = self.rewards.get().map_or(false, |r| r.len() != self.size);
        if short && !force {
            debug!("Cached rewards do not cover {} rows, recomputing", self.size);
        }
        let rewards = self.get_rewards(force || short)?;
        rows.iter()
            .map(|&i| {
                rewards.get(i).copied().ok_or_else(|| {
                    GfnError::CorruptBatch(format!("no reward for row {}", i)).into()
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Array1::from)
    }

    /// Actions of each trajectory, source first, trajectories in order of first appearance.
    pub fn get_actions_trajectories(&self) -> Vec<Vec<Action>> {
        self.trajs
            .iter()
            .map(|slot| {
                slot.rows
                    .iter()
                    .map(|&row| self.actions[row].clone())
                    .collect()
            })
            .collect()
    }

    fn shift_traj_indices(&mut self, by: u64) {
        self.traj_indices
            .iter_mut()
            .for_each(|id| *id = id.shifted(by));
        self.trajs.shift(by);
    }

    /// Appends other batches.
    ///
    /// Trajectory ids of each incoming batch are shifted above the largest id
    /// held, and its rows are appended after the current rows. A cached item
    /// stays available only if it was available on both sides. Every batch is
    /// checked before anything is merged; on error `self` is left untouched.
    pub fn merge(&mut self, batches: Vec<Batch<S>>) -> Result<&mut Self> {
        self.check_valid()?;
        for batch in batches.iter() {
            batch.check_valid()?;
        }

        for mut batch in batches.into_iter() {
            if batch.is_empty() {
                continue;
            }
            let shift = self.trajs.max_id().map(|id| id.raw() + 1).unwrap_or(0);
            batch.shift_traj_indices(shift);
            let offset = self.size;

            self.states_policy = mem::take(&mut self.states_policy)
                .merge(batch.states_policy, |a, b| {
                    concatenate(Axis(0), &[a.view(), b.view()]).ok()
                });
            self.parents = mem::take(&mut self.parents).merge(batch.parents, |mut a, b| {
                a.extend(b);
                Some(a)
            });
            self.parents_policy = mem::take(&mut self.parents_policy)
                .merge(batch.parents_policy, |a, b| {
                    concatenate(Axis(0), &[a.view(), b.view()]).ok()
                });
            self.parents_all =
                mem::take(&mut self.parents_all).merge(batch.parents_all, |mut a, b| {
                    a.policy = concatenate(Axis(0), &[a.policy.view(), b.policy.view()]).ok()?;
                    a.states.extend(b.states);
                    a.actions.extend(b.actions);
                    a.indices.extend(b.indices.into_iter().map(|i| i + offset));
                    Some(a)
                });
            self.masks_backward = mem::take(&mut self.masks_backward)
                .merge(batch.masks_backward, |a, b| {
                    concatenate(Axis(0), &[a.view(), b.view()]).ok()
                });
            self.rewards = mem::take(&mut self.rewards).merge(batch.rewards, |a, b| {
                concatenate(Axis(0), &[a.view(), b.view()]).ok()
            });

            self.trajs.append(batch.trajs, offset);
            self.traj_indices.extend(batch.traj_indices);
            self.state_indices.extend(batch.state_indices);
            self.states.extend(batch.states);
            self.actions.extend(batch.actions);
            self.done.extend(batch.done);
            self.masks_forward.extend(batch.masks_forward);
            self.size += batch.size;
        }

        if let Err(e) = self.check_valid() {
            error!("Merged batch is not valid: {}", e);
            return Err(e.into());
        }
        info!(
            "Merged batch has {} rows of {} trajectories",
            self.size,
            self.trajs.len()
        );
        Ok(self)
    }

    /// Checks the structural invariants of the batch.
    pub fn check_valid(&self) -> Result<(), GfnError> {
        let n = self.size;
        let columns = [
            ("states", self.states.len()),
            ("actions", self.actions.len()),
            ("done", self.done.len()),
            ("traj_indices", self.traj_indices.len()),
            ("state_indices", self.state_indices.len()),
            ("masks_forward", self.masks_forward.len()),
        ];
        for (name, len) in columns.iter() {
            if *len != n {
                return Err(GfnError::CorruptBatch(format!(
                    "{} has {} rows, batch has {}",
                    name, len, n
                )));
            }
        }

        let ids = self.traj_indices.iter().copied().collect::<HashSet<_>>();
        if ids.len() != self.trajs.len() || !ids.iter().all(|&id| self.trajs.contains(id)) {
            return Err(GfnError::CorruptBatch(
                "trajectory ids of rows and trajectories differ".to_string(),
            ));
        }

        let mut seen = vec![false; n];
        for slot in self.trajs.iter() {
            if slot.env.id() != Some(slot.id) {
                return Err(GfnError::CorruptBatch(format!(
                    "environment of trajectory {} has id {:?}",
                    slot.id,
                    slot.env.id()
                )));
            }
            for &row in slot.rows.iter() {
                if row >= n || seen[row] {
                    return Err(GfnError::CorruptBatch(format!(
                        "row {} of trajectory {} is out of range or shared",
                        row, slot.id
                    )));
                }
                if self.traj_indices[row] != slot.id {
                    return Err(GfnError::CorruptBatch(format!(
                        "row {} is listed in trajectory {} but belongs to {}",
                        row, slot.id, self.traj_indices[row]
                    )));
                }
                seen[row] = true;
            }
        }
        if let Some(row) = seen.iter().position(|s| !s) {
            return Err(GfnError::CorruptBatch(format!(
                "row {} belongs to no trajectory",
                row
            )));
        }

        if let Cache::Valid(rewards) = &self.rewards {
            if rewards.len() != n {
                return Err(GfnError::CorruptBatch(format!(
                    "{} rewards for {} rows",
                    rewards.len(),
                    n
                )));
            }
            if let Some(row) = (0..n).find(|&i| !self.done[i] && rewards[i] != 0.0) {
                return Err(GfnError::CorruptBatch(format!(
                    "row {} is not done but has a non-zero reward",
                    row
                )));
            }
        }
        Ok(())
    }

    /// `true` if the structural invariants of the batch hold.
    pub fn is_valid(&self) -> bool {
        self.check_valid().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dummy::{CornerScorer, Grid, GridConfig},
        reward::RewardConfig,
    };
    use std::sync::Arc;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn grid_env(config: &GridConfig, id: u64) -> Result<Env<Grid>> {
        let mut env = Env::<Grid>::build(config, &RewardConfig::default())?
            .with_scorer(Arc::new(CornerScorer));
        env.reset(Some(TrajId::new(id)));
        Ok(env)
    }

    /// Steps `envs` forward with scripted actions, adding every step to `batch`.
    fn run_forward(
        batch: &mut Batch<Grid>,
        envs: &mut [Env<Grid>],
        script: &[Vec<Option<Action>>],
    ) -> Result<()> {
        for step in script.iter() {
            let mut stepped = vec![];
            let mut actions = vec![];
            let mut valids = vec![];
            for (env, action) in envs.iter_mut().zip(step.iter()) {
                if let Some(action) = action {
                    let (_, action, valid) = env.step(action.clone());
                    stepped.push(env.clone());
                    actions.push(action);
                    valids.push(valid);
                }
            }
            batch.add_to_batch(&stepped, &actions, &valids, None, false, true)?;
        }
        Ok(())
    }

    /// Two trajectories: `[1 0] [1 1] [1 1]*` (id 0) and `[0 1] [0 1]*` (id 1).
    fn two_trajectories() -> Result<Batch<Grid>> {
        let config = GridConfig::default();
        let mut envs = vec![grid_env(&config, 0)?, grid_env(&config, 1)?];
        let mut batch = Batch::new(&envs[0]);
        let script = vec![
            vec![Some(Action::Discrete(0)), Some(Action::Discrete(1))],
            vec![Some(Action::Discrete(1)), Some(Action::Stop)],
            vec![Some(Action::Stop), None],
        ];
        run_forward(&mut batch, &mut envs, &script)?;
        Ok(batch)
    }

    #[test]
    fn test_forward_rows() -> Result<()> {
        init();
        let mut batch = two_trajectories()?;
        assert_eq!(batch.len(), 5);
        assert!(batch.is_valid());
        assert_eq!(batch.get_n_trajectories(), 2);
        assert_eq!(batch.trajectory_rows(TrajId::new(0))?, vec![0, 2, 4]);
        assert_eq!(batch.trajectory_rows(TrajId::new(1))?, vec![1, 3]);
        assert_eq!(batch.get_done(), &[false, false, false, true, true]);
        assert_eq!(batch.get_state_indices(), &[1, 1, 2, 2, 3]);

        let parents = batch.get_parents(false)?.to_vec();
        assert_eq!(
            parents,
            vec![vec![0, 0], vec![0, 0], vec![1, 0], vec![0, 1], vec![1, 1]]
        );
        assert_eq!(batch.get_parents_policy(false)?.dim(), (5, 6));
        assert_eq!(
            batch.get_actions_trajectories(),
            vec![
                vec![Action::Discrete(0), Action::Discrete(1), Action::Stop],
                vec![Action::Discrete(1), Action::Stop],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_parents_all() -> Result<()> {
        init();
        let mut batch = two_trajectories()?;
        let parents_all = batch.get_parents_all(false)?;
        // [1 0]: 1 parent, [0 1]: 1, [1 1]: 2, [0 1]*: itself, [1 1]*: itself
        assert_eq!(parents_all.indices, vec![0, 1, 2, 2, 3, 4]);
        assert_eq!(parents_all.states[2], vec![0, 1]);
        assert_eq!(parents_all.actions[5], Action::Stop);
        assert_eq!(batch.get_parents_all_policy(false)?.nrows(), 6);
        Ok(())
    }

    #[test]
    fn test_inconsistent_parents() -> Result<()> {
        let env = {
            let mut env = grid_env(&GridConfig::default(), 0)?;
            env.step(Action::Discrete(0));
            env
        };
        let mut batch = Batch::new(&env);
        // recorded action differs from the applied one
        batch.add_to_batch(&[env], &[Action::Discrete(1)], &[true], None, false, true)?;
        let err = batch.get_parents_all(false).err().map(|e| e.to_string());
        assert_eq!(
            err,
            Some(
                GfnError::InconsistentParents {
                    row: 0,
                    action: "1".to_string()
                }
                .to_string()
            )
        );
        Ok(())
    }

    #[test]
    fn test_masks() -> Result<()> {
        let mut batch = two_trajectories()?;
        assert!(batch.masks_forward_available());
        let masks = batch.get_masks_forward(false, false)?;
        assert_eq!(masks.dim(), (5, 3));
        assert_eq!(masks.row(3).to_vec(), vec![true, true, false]);
        let masks = batch.get_masks_forward(true, false)?;
        assert_eq!(masks.row(0).to_vec(), vec![false, false, false]);
        assert_eq!(masks.row(3).to_vec(), vec![false, false, false]);

        let masks = batch.get_masks_backward(false)?;
        // [1 1] not done: both actions can be undone
        assert_eq!(masks.row(2).to_vec(), vec![false, false, true]);
        assert_eq!(masks.row(4).to_vec(), vec![true, true, false]);
        Ok(())
    }

    #[test]
    fn test_rewards_and_terminating_states() -> Result<()> {
        init();
        let mut batch = two_trajectories()?;
        let rewards = batch.get_rewards(false)?.to_vec();
        // [0 1] -> energy -2, [1 1] -> energy -1
        assert_eq!(rewards[..3], [0.0, 0.0, 0.0]);
        assert!((rewards[3] - 2.0).abs() < 1e-5);
        assert!((rewards[4] - 1.0).abs() < 1e-5);

        let states = batch
            .get_terminating_states(SortBy::Insertion, StateFormat::Native)?
            .into_native();
        assert_eq!(states, Some(vec![vec![0, 1], vec![1, 1]]));
        let states = batch
            .get_terminating_states(SortBy::Trajectory, StateFormat::Native)?
            .into_native();
        assert_eq!(states, Some(vec![vec![1, 1], vec![0, 1]]));
        let rewards = batch.get_terminating_rewards(SortBy::Trajectory, false)?;
        assert!((rewards[0] - 1.0).abs() < 1e-5);
        let proxies = batch
            .get_terminating_states(SortBy::Insertion, StateFormat::Proxy)?
            .into_proxy();
        assert_eq!(proxies, Some(vec![vec![-1.0, 0.0], vec![0.0, 0.0]]));
        Ok(())
    }

    #[test]
    fn test_stale_cache() -> Result<()> {
        init();
        let config = GridConfig::default();
        let mut env = grid_env(&config, 0)?;
        let mut batch = Batch::new(&env);
        let (_, action, valid) = env.step(Action::Discrete(0));
        batch.add_to_batch(&[env.clone()], &[action], &[valid], None, false, true)?;
        assert_eq!(batch.get_rewards(false)?.len(), 1);
        assert!(batch.rewards_available());

        let (_, action, valid) = env.step(Action::Stop);
        batch.add_to_batch(&[env.clone()], &[action], &[valid], None, false, true)?;
        assert!(!batch.rewards_available());
        assert_eq!(batch.get_rewards(false)?.len(), 1);
        assert_eq!(batch.get_rewards(true)?.len(), 2);
        assert!(batch.rewards_available());
        Ok(())
    }

    #[test]
    fn test_skips_invalid_and_unfinished() -> Result<()> {
        let config = GridConfig::default();
        let mut env = grid_env(&config, 0)?;
        let mut batch = Batch::new(&env);
        let (_, action, valid) = env.step(Action::Discrete(0));
        batch.add_to_batch(&[env.clone()], &[action.clone()], &[false], None, false, true)?;
        assert!(batch.is_empty());
        batch.add_to_batch(&[env.clone()], &[action], &[valid], None, false, false)?;
        assert!(batch.is_empty());
        let (_, action, valid) = env.step(Action::Stop);
        batch.add_to_batch(&[env.clone()], &[action], &[valid], None, false, false)?;
        assert_eq!(batch.len(), 1);
        assert!(!batch.masks_forward_available());
        Ok(())
    }

    #[test]
    fn test_missing_trajectory_id() -> Result<()> {
        let env = Env::<Grid>::build(&GridConfig::default(), &RewardConfig::default())?;
        let mut batch = Batch::new(&env);
        let err = batch
            .add_to_batch(&[env], &[Action::Stop], &[true], None, false, true)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GfnError>(),
            Some(GfnError::MissingTrajectoryId)
        ));
        Ok(())
    }

    #[test]
    fn test_backward_single_step() -> Result<()> {
        init();
        let mut env = grid_env(&GridConfig::default(), 0)?;
        env.set_state(vec![1, 1], true);
        let mut batch = Batch::new(&env);
        let (_, action, valid) = env.step_backwards(Action::Stop);
        batch.add_to_batch(&[env.clone()], &[action], &[valid], None, true, true)?;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.states(), &[vec![1, 1]]);
        assert_eq!(batch.get_done(), &[true]);
        assert_eq!(batch.get_actions(), &[Action::Stop]);
        // the rest of the trajectory is not sampled yet
        assert_eq!(batch.get_parents(false)?, &[vec![0, 0]]);
        Ok(())
    }

    #[test]
    fn test_backward_trajectory() -> Result<()> {
        init();
        let mut env = grid_env(&GridConfig::default(), 0)?;
        env.set_state(vec![1, 1], true);
        let mut batch = Batch::new(&env);
        for action in [Action::Stop, Action::Discrete(0), Action::Discrete(1)] {
            let (_, action, valid) = env.step_backwards(action);
            assert!(valid);
            batch.add_to_batch(&[env.clone()], &[action], &[valid], None, true, true)?;
        }
        assert_eq!(env.state(), &vec![0, 0]);
        assert!(batch.is_valid());
        assert_eq!(batch.trajectory_rows(TrajId::new(0))?, vec![2, 1, 0]);
        assert_eq!(
            batch.get_states_of_trajectory(TrajId::new(0))?,
            vec![vec![0, 1], vec![1, 1], vec![1, 1]]
        );
        assert_eq!(batch.get_done(), &[true, false, false]);
        assert_eq!(
            batch.get_parents(false)?,
            &[vec![1, 1], vec![0, 1], vec![0, 0]]
        );
        // read forward, every recorded action leads from the parent to the row
        assert_eq!(batch.get_parents_all(false)?.indices.len(), 4);
        assert_eq!(
            batch.get_actions_trajectories(),
            vec![vec![Action::Discrete(1), Action::Discrete(0), Action::Stop]]
        );
        Ok(())
    }

    #[test]
    fn test_merge() -> Result<()> {
        init();
        let mut a = two_trajectories()?;
        let mut b = two_trajectories()?;
        a.get_rewards(false)?;
        b.get_rewards(false)?;
        b.get_parents(false)?;

        a.merge(vec![b])?;
        assert_eq!(a.len(), 10);
        assert_eq!(a.get_n_trajectories(), 4);
        assert!(a.is_valid());
        assert!(a.rewards_available());
        assert!(!a.parents_available());
        assert_eq!(
            a.trajectory_ids(),
            vec![TrajId::new(0), TrajId::new(1), TrajId::new(2), TrajId::new(3)]
        );
        assert_eq!(a.trajectory_rows(TrajId::new(2))?, vec![5, 7, 9]);
        let ids = a.get_trajectory_indices().iter().collect::<HashSet<_>>();
        assert_eq!(ids.len(), 4);
        assert_eq!(a.get_parents(false)?[7], vec![1, 0]);
        assert_eq!(a.get_rewards(false)?.len(), 10);
        Ok(())
    }

    #[test]
    fn test_merge_rejects_corrupt_batch() -> Result<()> {
        let mut a = two_trajectories()?;
        let mut b = two_trajectories()?;
        b.states.pop();
        let err = a.merge(vec![b]).err();
        assert!(matches!(
            err.as_ref().and_then(|e| e.downcast_ref::<GfnError>()),
            Some(GfnError::CorruptBatch(_))
        ));
        assert_eq!(a.len(), 5);
        assert!(a.is_valid());
        Ok(())
    }

    /// Moves along the real line by continuous increments.
    #[derive(Debug, Clone)]
    struct Line;

    impl StateSpace for Line {
        type Config = ();
        type State = Vec<f32>;
        type Proxy = Vec<f32>;

        fn build(_config: &()) -> Result<Self> {
            Ok(Line)
        }

        fn source(&self) -> Vec<f32> {
            vec![0.0]
        }

        fn action_space_len(&self) -> usize {
            1
        }

        fn policy_input_dim(&self) -> usize {
            1
        }

        fn is_continuous(&self) -> bool {
            true
        }

        fn transition(&self, state: &Vec<f32>, action: &Action) -> Option<Vec<f32>> {
            match action {
                Action::Continuous(d) => Some(vec![state[0] + d[0]]),
                _ => None,
            }
        }

        fn state2policy(&self, state: &Vec<f32>) -> Vec<f32> {
            state.clone()
        }

        fn state2proxy(&self, state: &Vec<f32>) -> Vec<f32> {
            state.clone()
        }
    }

    #[test]
    fn test_continuous_has_no_parents_all() -> Result<()> {
        let mut env = Env::<Line>::build(&(), &RewardConfig::default())?;
        env.reset(Some(TrajId::new(0)));
        let mut batch = Batch::new(&env);
        assert!(batch.is_continuous());
        let (_, action, valid) = env.step(Action::Continuous(vec![0.5]));
        assert!(valid);
        batch.add_to_batch(&[env], &[action], &[valid], None, false, true)?;

        let err = batch.get_parents_all(false).err();
        assert!(matches!(
            err.as_ref().and_then(|e| e.downcast_ref::<GfnError>()),
            Some(GfnError::UnsupportedOperation(_))
        ));
        assert_eq!(batch.get_parents(false)?, &[vec![0.0]]);
        assert_eq!(batch.states(), &[vec![0.5]]);
        Ok(())
    }

    #[test]
    fn test_conditional_conversions_keep_row_order() -> Result<()> {
        init();
        let small = GridConfig::default().conditional(true);
        let large = GridConfig::default().length(5).conditional(true);
        let mut envs = vec![grid_env(&small, 0)?, grid_env(&large, 1)?];
        let mut batch = Batch::new(&envs[0]);
        assert!(batch.is_conditional());
        let script = vec![
            vec![Some(Action::Discrete(0)), Some(Action::Discrete(0))],
            vec![Some(Action::Discrete(1)), Some(Action::Discrete(0))],
            vec![Some(Action::Stop), Some(Action::Stop)],
        ];
        run_forward(&mut batch, &mut envs, &script)?;

        let proxies = batch
            .get_states(StateFormat::Proxy, false)?
            .into_proxy()
            .unwrap_or_default();
        for (row, proxy) in proxies.iter().enumerate() {
            let env = &envs[batch.get_trajectory_indices()[row].raw() as usize];
            assert_eq!(proxy, &env.state2proxy(&batch.states()[row]));
        }
        // [2 0] on a grid of length 5 is not a corner
        assert_eq!(proxies[3], vec![0.0, -1.0]);

        // spaces with different policy dimensions cannot share a matrix
        assert!(batch.get_states(StateFormat::Policy, false).is_err());
        Ok(())
    }

    #[test]
    fn test_terminating_rewards_from_short_cache() -> Result<()> {
        init();
        let config = GridConfig::default();
        let mut envs = vec![grid_env(&config, 0)?, grid_env(&config, 1)?];
        let mut batch = Batch::new(&envs[0]);
        run_forward(&mut batch, &mut envs[..1], &[vec![Some(Action::Stop)]])?;
        assert_eq!(batch.get_rewards(false)?.len(), 1);

        run_forward(&mut batch, &mut envs[1..], &[vec![Some(Action::Stop)]])?;
        let rewards = batch.get_terminating_rewards(SortBy::Insertion, false)?;
        assert_eq!(rewards.len(), 2);
        assert!(rewards.iter().all(|&r| r > 0.0));
        assert!(batch.rewards_available());
        assert!(batch.is_valid());
        Ok(())
    }

    #[test]
    fn test_failed_add_leaves_batch_untouched() -> Result<()> {
        init();
        let config = GridConfig::default();
        let mut env = grid_env(&config, 0)?;
        let mut batch = Batch::new(&env);
        batch.get_rewards(false)?;

        let (_, action, valid) = env.step(Action::Discrete(0));
        let no_id = Env::<Grid>::build(&config, &RewardConfig::default())?;
        let err = batch
            .add_to_batch(
                &[env.clone(), no_id],
                &[action.clone(), action],
                &[valid, true],
                None,
                false,
                true,
            )
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GfnError>(),
            Some(GfnError::MissingTrajectoryId)
        ));
        assert!(batch.is_empty());
        assert_eq!(batch.get_n_trajectories(), 0);
        assert!(batch.rewards_available());
        assert!(batch.is_valid());

        // a forward trajectory cannot be continued backward
        batch.add_to_batch(&[env.clone()], &[Action::Discrete(0)], &[true], None, false, true)?;
        let (_, action, valid) = env.step_backwards(Action::Discrete(0));
        assert!(valid);
        let err = batch
            .add_to_batch(&[env], &[action], &[valid], None, true, true)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GfnError>(),
            Some(GfnError::CorruptBatch(_))
        ));
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.trajectory_rows(TrajId::new(0))?, vec![0]);
        assert!(batch.is_valid());
        Ok(())
    }

    #[test]
    fn test_conditional_native_terminating_states() -> Result<()> {
        let config = GridConfig::default().conditional(true);
        let mut env = grid_env(&config, 0)?;
        let mut batch = Batch::new(&env);
        let (_, action, valid) = env.step(Action::Stop);
        let envs = vec![env.clone(), env];
        batch.add_to_batch(&envs, &[action.clone(), action], &[valid, true], None, false, true)?;

        let states = batch
            .get_terminating_states(SortBy::Insertion, StateFormat::Native)?
            .into_native()
            .unwrap_or_default();
        assert_eq!(states.len(), 2);
        let err = batch
            .get_terminating_states(SortBy::Insertion, StateFormat::Proxy)
            .err();
        assert!(matches!(
            err.as_ref().and_then(|e| e.downcast_ref::<GfnError>()),
            Some(GfnError::CorruptBatch(_))
        ));
        Ok(())
    }
}
