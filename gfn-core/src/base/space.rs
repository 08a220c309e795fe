//! State space of a GFlowNet environment.
use super::{Action, SamplingMethod};
use crate::{sampling, GfnError};
use anyhow::Result;
use ndarray::{Array1, ArrayView2};
use rand::Rng;
use std::fmt::Debug;

/// Defines what a state and an action physically mean.
///
/// A state space is the configuration-bearing, immutable part of an
/// environment: it knows the source state, the ordered action space, the
/// transition function and its inverse, and how states are presented to the
/// policy model and to the scorer. The mutable per-trajectory part lives in
/// [`Env`](crate::Env).
///
/// Default methods implement the behaviour of a generic discrete environment:
/// non-terminal states have no parents, every action is valid going forward,
/// and actions are sampled from a masked categorical distribution.
pub trait StateSpace: Clone + Debug + Send + Sync {
    /// Configuration of the state space.
    type Config: Clone;

    /// A state in native format.
    type State: Clone + Debug + PartialEq + Send + Sync;

    /// A state in the format consumed by the scorer.
    type Proxy: Clone + Debug + Send + Sync;

    /// Builds a state space.
    fn build(config: &Self::Config) -> Result<Self>
    where
        Self: Sized;

    /// The source state, from which every trajectory starts.
    fn source(&self) -> Self::State;

    /// Number of non-terminal actions.
    fn action_space_len(&self) -> usize;

    /// Number of columns of policy outputs and masks: the action space plus `Stop`.
    fn policy_output_dim(&self) -> usize {
        self.action_space_len() + 1
    }

    /// Length of a state in policy format.
    fn policy_input_dim(&self) -> usize;

    /// Whether actions are continuous vectors.
    fn is_continuous(&self) -> bool {
        false
    }

    /// Whether trajectories may be sampled from differently configured spaces.
    ///
    /// A batch of a conditional space converts states trajectory by trajectory,
    /// with the space of the environment that sampled them.
    fn is_conditional(&self) -> bool {
        false
    }

    /// Applies a non-terminal action. Returns `None` if the action is not applicable.
    fn transition(&self, state: &Self::State, action: &Action) -> Option<Self::State>;

    /// Undoes a non-terminal action. Returns `None` if `state` cannot be reached with `action`.
    fn reverse_transition(&self, _state: &Self::State, _action: &Action) -> Option<Self::State> {
        None
    }

    /// Parents of a non-terminal state, with the action leading from each parent to `state`.
    ///
    /// `action` is the action that was actually sampled, if known.
    fn parents(
        &self,
        _state: &Self::State,
        _action: Option<&Action>,
    ) -> (Vec<Self::State>, Vec<Action>) {
        (vec![], vec![])
    }

    /// Forward mask of a non-terminal state, `true` for invalid actions.
    ///
    /// The mask has [`StateSpace::policy_output_dim`] entries, `Stop` last.
    fn mask_invalid_actions_forward(&self, _state: &Self::State) -> Vec<bool> {
        vec![false; self.policy_output_dim()]
    }

    /// Backward mask, `true` for actions that cannot be undone from `state`.
    ///
    /// Derived from the parents: from a done state only `Stop` can be undone.
    fn mask_invalid_actions_backward(&self, state: &Self::State, done: bool) -> Vec<bool> {
        let mut mask = vec![true; self.policy_output_dim()];
        let n = self.action_space_len();
        if done {
            mask[n] = false;
            return mask;
        }
        let (_, actions) = self.parents(state, None);
        for a in actions.iter() {
            if let Some(ix) = a.index(n) {
                mask[ix] = false;
            }
        }
        mask
    }

    /// Converts a state into policy format.
    fn state2policy(&self, state: &Self::State) -> Vec<f32>;

    /// Converts a state into proxy format.
    fn state2proxy(&self, state: &Self::State) -> Self::Proxy;

    /// Human-readable representation of a state.
    fn state2readable(&self, state: &Self::State) -> String {
        format!("{:?}", state)
    }

    /// Parses the human-readable representation of a state.
    fn readable2state(&self, _readable: &str) -> Result<Self::State> {
        Err(GfnError::UnsupportedOperation("readable2state".to_string()).into())
    }

    /// Samples actions from policy outputs, one per row.
    ///
    /// Returns the actions and their log-probabilities under the masked,
    /// tempered distribution they were drawn from.
    fn sample_actions<R: Rng>(
        &self,
        policy_outputs: &ArrayView2<f32>,
        method: SamplingMethod,
        mask: Option<&ArrayView2<bool>>,
        temperature: f32,
        rng: &mut R,
    ) -> Result<(Vec<Action>, Array1<f32>)> {
        if self.is_continuous() {
            return Err(GfnError::UnsupportedOperation(
                "categorical sampling of continuous actions".to_string(),
            )
            .into());
        }
        if !(temperature > 0.0) {
            return Err(GfnError::InvalidArgument(format!(
                "temperature must be positive, got {}",
                temperature
            ))
            .into());
        }
        let logits = match method {
            SamplingMethod::Uniform => policy_outputs.mapv(|_| 1.0f32),
            SamplingMethod::Policy => policy_outputs.mapv(|l| l / temperature),
        };
        let (ixs, logprobs) = sampling::sample_categorical(&logits.view(), mask, rng)?;
        let n = self.action_space_len();
        let actions = ixs
            .into_iter()
            .map(|ix| {
                Action::from_index(ix, n).ok_or_else(|| {
                    GfnError::InvalidArgument(format!(
                        "policy output has column {} beyond the action space",
                        ix
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((actions, logprobs))
    }

    /// Log-probabilities of `actions` under the masked distribution of `policy_outputs`.
    fn get_logprobs(
        &self,
        policy_outputs: &ArrayView2<f32>,
        actions: &[Action],
        mask: Option<&ArrayView2<bool>>,
    ) -> Result<Array1<f32>> {
        if self.is_continuous() {
            return Err(GfnError::UnsupportedOperation(
                "categorical log-probabilities of continuous actions".to_string(),
            )
            .into());
        }
        let n = self.action_space_len();
        let ixs = actions
            .iter()
            .map(|a| {
                a.index(n)
                    .ok_or_else(|| GfnError::InvalidArgument(format!("action {} not in space", a)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        sampling::log_probs_of(policy_outputs, &ixs, mask)
    }

    /// Every terminating state, for spaces small enough to enumerate.
    fn all_terminating_states(&self) -> Option<Vec<Self::State>> {
        None
    }

    /// `n` terminating states spread uniformly over the space.
    fn uniform_terminating_states(&self, _n: usize) -> Option<Vec<Self::State>> {
        None
    }

    /// `n` random terminating states.
    fn random_terminating_states(&self, _n: usize, _seed: u64) -> Option<Vec<Self::State>> {
        None
    }
}
