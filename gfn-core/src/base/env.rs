//! Environment instance.
use super::{Action, SamplingMethod, Scorer, StateSpace, TrajId};
use crate::{
    reward::{RewardConfig, RewardTransform},
    GfnError,
};
use anyhow::Result;
use log::trace;
use ndarray::{Array1, Array2, ArrayView2};
use rand::Rng;
use std::{fmt, sync::Arc};

/// Mutable context of one trajectory over a [`StateSpace`].
///
/// An environment is either running or done. Applying [`Action::Stop`] makes
/// it done without changing the state; there is no way back except
/// [`Env::step_backwards`], which is used when trajectories are sampled from
/// terminating states to the source.
///
/// Illegal actions are soft failures: [`Env::step`] reports them with
/// `valid = false` and leaves the environment untouched.
pub struct Env<S: StateSpace> {
    space: S,
    state: S::State,
    done: bool,
    n_actions: usize,
    id: Option<TrajId>,
    reward: RewardTransform,
    scorer: Option<Arc<dyn Scorer<S::Proxy>>>,
}

impl<S: StateSpace> Clone for Env<S> {
    fn clone(&self) -> Self {
        Self {
            space: self.space.clone(),
            state: self.state.clone(),
            done: self.done,
            n_actions: self.n_actions,
            id: self.id,
            reward: self.reward.clone(),
            scorer: self.scorer.clone(),
        }
    }
}

impl<S: StateSpace> fmt::Debug for Env<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("space", &self.space)
            .field("state", &self.state)
            .field("done", &self.done)
            .field("n_actions", &self.n_actions)
            .field("id", &self.id)
            .field("reward", &self.reward)
            .field("scorer", &self.scorer.is_some())
            .finish()
    }
}

impl<S: StateSpace> Env<S> {
    /// Creates an environment at the source state of `space`.
    pub fn new(space: S, reward: RewardTransform) -> Self {
        let state = space.source();
        Self {
            space,
            state,
            done: false,
            n_actions: 0,
            id: None,
            reward,
            scorer: None,
        }
    }

    /// Builds the state space and the reward transform from their configurations.
    pub fn build(config: &S::Config, reward_config: &RewardConfig) -> Result<Self> {
        let space = S::build(config)?;
        let reward = RewardTransform::build(reward_config)?;
        Ok(Self::new(space, reward))
    }

    /// Attaches the scorer used to compute rewards.
    pub fn with_scorer(mut self, scorer: Arc<dyn Scorer<S::Proxy>>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    /// The state space.
    pub fn space(&self) -> &S {
        &self.space
    }

    /// Current state.
    pub fn state(&self) -> &S::State {
        &self.state
    }

    /// Whether the trajectory is done.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of actions applied so far.
    pub fn n_actions(&self) -> usize {
        self.n_actions
    }

    /// Trajectory id.
    pub fn id(&self) -> Option<TrajId> {
        self.id
    }

    /// Sets the trajectory id.
    pub fn set_id(&mut self, id: TrajId) -> &mut Self {
        self.id = Some(id);
        self
    }

    /// The reward transform.
    pub fn reward_transform(&self) -> &RewardTransform {
        &self.reward
    }

    /// Mutable access to the reward transform, e.g. to set energy statistics.
    pub fn reward_transform_mut(&mut self) -> &mut RewardTransform {
        &mut self.reward
    }

    /// The source state.
    pub fn source(&self) -> S::State {
        self.space.source()
    }

    /// Number of non-terminal actions.
    pub fn action_space_len(&self) -> usize {
        self.space.action_space_len()
    }

    /// Number of columns of policy outputs and masks.
    pub fn policy_output_dim(&self) -> usize {
        self.space.policy_output_dim()
    }

    /// Whether actions are continuous.
    pub fn is_continuous(&self) -> bool {
        self.space.is_continuous()
    }

    /// Whether states must be converted with the space of the sampling environment.
    pub fn is_conditional(&self) -> bool {
        self.space.is_conditional()
    }

    /// Goes back to the source state with a new id.
    pub fn reset(&mut self, id: Option<TrajId>) -> &mut Self {
        self.state = self.space.source();
        self.done = false;
        self.n_actions = 0;
        self.id = id;
        self
    }

    /// Sets the state and the done flag.
    pub fn set_state(&mut self, state: S::State, done: bool) -> &mut Self {
        self.state = state;
        self.done = done;
        self
    }

    /// Applies an action.
    ///
    /// A done environment accepts no action. Otherwise [`Action::Stop`]
    /// only sets the done flag, and other actions must be valid in the
    /// forward mask of the current state. Invalid actions change nothing and
    /// `valid` is `false`.
    pub fn step(&mut self, action: Action) -> (S::State, Action, bool) {
        if self.done {
            trace!("Action {} on a done environment", action);
            return (self.state.clone(), action, false);
        }
        if action.is_stop() {
            self.done = true;
            self.n_actions += 1;
            return (self.state.clone(), action, true);
        }
        if let Some(ix) = action.index(self.space.action_space_len()) {
            let mask = self.space.mask_invalid_actions_forward(&self.state);
            if mask.get(ix).copied().unwrap_or(true) {
                trace!("Invalid forward action {} from {:?}", action, self.state);
                return (self.state.clone(), action, false);
            }
        }
        match self.space.transition(&self.state, &action) {
            Some(next) => {
                self.state = next;
                self.n_actions += 1;
                (self.state.clone(), action, true)
            }
            None => (self.state.clone(), action, false),
        }
    }

    /// Undoes an action, moving one step towards the source.
    ///
    /// From a done environment the only valid action is [`Action::Stop`],
    /// which clears the done flag and keeps the state. From a running one
    /// the action must be valid in the backward mask.
    pub fn step_backwards(&mut self, action: Action) -> (S::State, Action, bool) {
        if self.done {
            if action.is_stop() {
                self.done = false;
                self.n_actions += 1;
                return (self.state.clone(), action, true);
            }
            return (self.state.clone(), action, false);
        }
        if action.is_stop() {
            return (self.state.clone(), action, false);
        }
        if let Some(ix) = action.index(self.space.action_space_len()) {
            let mask = self.space.mask_invalid_actions_backward(&self.state, false);
            if mask.get(ix).copied().unwrap_or(true) {
                trace!("Invalid backward action {} from {:?}", action, self.state);
                return (self.state.clone(), action, false);
            }
        }
        match self.space.reverse_transition(&self.state, &action) {
            Some(prev) => {
                self.state = prev;
                self.n_actions += 1;
                (self.state.clone(), action, true)
            }
            None => (self.state.clone(), action, false),
        }
    }

    /// All `(parent, action)` pairs such that applying `action` to `parent` yields `state`.
    ///
    /// The only parent of a done state is the state itself, through [`Action::Stop`].
    pub fn get_parents(
        &self,
        state: &S::State,
        done: bool,
        action: Option<&Action>,
    ) -> (Vec<S::State>, Vec<Action>) {
        if done {
            (vec![state.clone()], vec![Action::Stop])
        } else {
            self.space.parents(state, action)
        }
    }

    /// Forward mask of `state`, `true` for invalid actions.
    ///
    /// Only [`Action::Stop`] is valid from a done state.
    pub fn get_mask_invalid_actions_forward(&self, state: &S::State, done: bool) -> Vec<bool> {
        if done {
            let mut mask = vec![true; self.policy_output_dim()];
            mask[self.action_space_len()] = false;
            mask
        } else {
            self.space.mask_invalid_actions_forward(state)
        }
    }

    /// Backward mask of `state`, `true` for invalid actions.
    pub fn get_mask_invalid_actions_backward(&self, state: &S::State, done: bool) -> Vec<bool> {
        self.space.mask_invalid_actions_backward(state, done)
    }

    /// Forward mask of the current state.
    pub fn mask_forward(&self) -> Vec<bool> {
        self.get_mask_invalid_actions_forward(&self.state, self.done)
    }

    /// Backward mask of the current state.
    pub fn mask_backward(&self) -> Vec<bool> {
        self.get_mask_invalid_actions_backward(&self.state, self.done)
    }

    /// Every path from `state` back to the source, with the actions along each path.
    ///
    /// Paths start with `state` and end with a state without parents.
    pub fn get_paths(&self, state: &S::State) -> (Vec<Vec<S::State>>, Vec<Vec<Action>>) {
        let mut paths = vec![];
        let mut paths_actions = vec![];
        self.collect_paths(vec![state.clone()], vec![], &mut paths, &mut paths_actions);
        (paths, paths_actions)
    }

    fn collect_paths(
        &self,
        path: Vec<S::State>,
        actions: Vec<Action>,
        paths: &mut Vec<Vec<S::State>>,
        paths_actions: &mut Vec<Vec<Action>>,
    ) {
        let last = match path.last() {
            Some(last) => last,
            None => return,
        };
        let (parents, parents_a) = self.space.parents(last, None);
        if parents.is_empty() {
            paths.push(path);
            paths_actions.push(actions);
            return;
        }
        for (p, a) in parents.into_iter().zip(parents_a) {
            let mut path_ = path.clone();
            path_.push(p);
            let mut actions_ = actions.clone();
            actions_.push(a);
            self.collect_paths(path_, actions_, paths, paths_actions);
        }
    }

    /// Uniform policy output, the baseline of a policy model.
    pub fn get_fixed_policy_output(&self) -> Array1<f32> {
        Array1::ones(self.policy_output_dim())
    }

    /// Samples actions from policy outputs, one per row.
    pub fn sample_actions<R: Rng>(
        &self,
        policy_outputs: &ArrayView2<f32>,
        method: SamplingMethod,
        mask: Option<&ArrayView2<bool>>,
        temperature: f32,
        rng: &mut R,
    ) -> Result<(Vec<Action>, Array1<f32>)> {
        self.space
            .sample_actions(policy_outputs, method, mask, temperature, rng)
    }

    /// Log-probabilities of `actions` under the masked distribution of `policy_outputs`.
    pub fn get_logprobs(
        &self,
        policy_outputs: &ArrayView2<f32>,
        actions: &[Action],
        mask: Option<&ArrayView2<bool>>,
    ) -> Result<Array1<f32>> {
        self.space.get_logprobs(policy_outputs, actions, mask)
    }

    /// Converts a state into policy format.
    pub fn state2policy(&self, state: &S::State) -> Vec<f32> {
        self.space.state2policy(state)
    }

    /// Converts states into policy format, one row per state.
    pub fn statebatch2policy(&self, states: &[S::State]) -> Result<Array2<f32>> {
        self.statebatch2policy_iter(states.iter(), states.len())
    }

    pub(crate) fn statebatch2policy_iter<'a>(
        &self,
        states: impl Iterator<Item = &'a S::State>,
        n: usize,
    ) -> Result<Array2<f32>>
    where
        S::State: 'a,
    {
        let dim = self.space.policy_input_dim();
        let mut data = Vec::with_capacity(n * dim);
        for state in states {
            let row = self.space.state2policy(state);
            if row.len() != dim {
                return Err(GfnError::InvalidArgument(format!(
                    "state2policy returned {} values, expected {}",
                    row.len(),
                    dim
                ))
                .into());
            }
            data.extend(row);
        }
        Ok(Array2::from_shape_vec((n, dim), data)?)
    }

    /// Converts a state into proxy format.
    pub fn state2proxy(&self, state: &S::State) -> S::Proxy {
        self.space.state2proxy(state)
    }

    /// Converts states into proxy format.
    pub fn statebatch2proxy(&self, states: &[S::State]) -> Vec<S::Proxy> {
        states.iter().map(|s| self.space.state2proxy(s)).collect()
    }

    /// Human-readable representation of a state.
    pub fn state2readable(&self, state: &S::State) -> String {
        self.space.state2readable(state)
    }

    /// Parses the human-readable representation of a state.
    pub fn readable2state(&self, readable: &str) -> Result<S::State> {
        self.space.readable2state(readable)
    }

    /// Human-readable representation of a sequence of actions.
    pub fn path2readable(&self, path: &[Action]) -> String {
        let items = path.iter().map(|a| a.to_string()).collect::<Vec<_>>();
        format!("[{}]", items.join(" "))
    }

    /// Energies of states in proxy format.
    pub fn score(&self, proxies: &[S::Proxy]) -> Result<Vec<f32>> {
        let scorer = self.scorer.as_ref().ok_or(GfnError::MissingScorer)?;
        let energies = scorer.score(proxies)?;
        if energies.len() != proxies.len() {
            return Err(GfnError::InvalidArgument(format!(
                "scorer returned {} energies for {} states",
                energies.len(),
                proxies.len()
            ))
            .into());
        }
        Ok(energies)
    }

    /// Reward of a state, `0` if it is not terminating.
    pub fn reward(&self, state: &S::State, done: bool) -> Result<f32> {
        if !done {
            return Ok(0.0);
        }
        let energies = self.score(&[self.space.state2proxy(state)])?;
        Ok(self.reward.proxy_to_reward(energies[0]))
    }

    /// Rewards of a batch of states. Only terminating states are scored.
    pub fn reward_batch(&self, states: &[S::State], done: &[bool]) -> Result<Vec<f32>> {
        if states.len() != done.len() {
            return Err(GfnError::InvalidArgument(format!(
                "{} states and {} done flags",
                states.len(),
                done.len()
            ))
            .into());
        }
        let proxies = states
            .iter()
            .zip(done.iter())
            .filter(|(_, &d)| d)
            .map(|(s, _)| self.space.state2proxy(s))
            .collect::<Vec<_>>();
        let mut rewards = vec![0.0; states.len()];
        if proxies.is_empty() {
            return Ok(rewards);
        }
        let energies = self.score(&proxies)?;
        let ixs = done.iter().enumerate().filter(|(_, &d)| d).map(|(i, _)| i);
        for (i, e) in ixs.zip(energies) {
            rewards[i] = self.reward.proxy_to_reward(e);
        }
        Ok(rewards)
    }
}
