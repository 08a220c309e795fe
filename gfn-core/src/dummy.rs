//! A small hyper-grid state space, used in tests and documentation.
//!
//! States are points of `{0, .., length - 1}^n_dim`, sampled from the origin
//! by incrementing one coordinate per action. Any point can be terminating.
use crate::{Action, GfnError, Scorer, StateSpace};
use anyhow::Result;
use itertools::Itertools;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Configuration of [`Grid`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct GridConfig {
    /// Number of dimensions.
    pub n_dim: usize,

    /// Number of cells per dimension.
    pub length: usize,

    /// Convert states with the grid of each trajectory.
    pub conditional: bool,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            n_dim: 2,
            length: 3,
            conditional: false,
        }
    }
}

impl GridConfig {
    /// Sets the number of dimensions.
    pub fn n_dim(mut self, n_dim: usize) -> Self {
        self.n_dim = n_dim;
        self
    }

    /// Sets the number of cells per dimension.
    pub fn length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    /// Marks the grid as conditional.
    pub fn conditional(mut self, conditional: bool) -> Self {
        self.conditional = conditional;
        self
    }
}

/// Hyper-grid state space.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    n_dim: usize,
    length: usize,
    conditional: bool,
}

impl Grid {
    /// Number of cells per dimension.
    pub fn length(&self) -> usize {
        self.length
    }
}

impl StateSpace for Grid {
    type Config = GridConfig;
    type State = Vec<usize>;
    type Proxy = Vec<f32>;

    fn build(config: &Self::Config) -> Result<Self> {
        if config.n_dim == 0 || config.length < 2 {
            return Err(GfnError::InvalidArgument(format!(
                "grid needs n_dim >= 1 and length >= 2, got {:?}",
                config
            ))
            .into());
        }
        Ok(Self {
            n_dim: config.n_dim,
            length: config.length,
            conditional: config.conditional,
        })
    }

    fn source(&self) -> Self::State {
        vec![0; self.n_dim]
    }

    fn action_space_len(&self) -> usize {
        self.n_dim
    }

    fn policy_input_dim(&self) -> usize {
        self.n_dim * self.length
    }

    fn is_conditional(&self) -> bool {
        self.conditional
    }

    fn transition(&self, state: &Self::State, action: &Action) -> Option<Self::State> {
        match action {
            Action::Discrete(i) if *i < self.n_dim && state[*i] + 1 < self.length => {
                let mut next = state.clone();
                next[*i] += 1;
                Some(next)
            }
            _ => None,
        }
    }

    fn reverse_transition(&self, state: &Self::State, action: &Action) -> Option<Self::State> {
        match action {
            Action::Discrete(i) if *i < self.n_dim && state[*i] > 0 => {
                let mut prev = state.clone();
                prev[*i] -= 1;
                Some(prev)
            }
            _ => None,
        }
    }

    fn parents(
        &self,
        state: &Self::State,
        _action: Option<&Action>,
    ) -> (Vec<Self::State>, Vec<Action>) {
        (0..self.n_dim)
            .filter(|&i| state[i] > 0)
            .map(|i| {
                let mut parent = state.clone();
                parent[i] -= 1;
                (parent, Action::Discrete(i))
            })
            .unzip()
    }

    fn mask_invalid_actions_forward(&self, state: &Self::State) -> Vec<bool> {
        let mut mask = state
            .iter()
            .map(|&x| x + 1 >= self.length)
            .collect::<Vec<_>>();
        mask.push(false);
        mask
    }

    fn state2policy(&self, state: &Self::State) -> Vec<f32> {
        let mut v = vec![0.0; self.n_dim * self.length];
        for (d, &x) in state.iter().enumerate() {
            v[d * self.length + x] = 1.0;
        }
        v
    }

    /// Coordinates scaled to `[-1, 1]`.
    fn state2proxy(&self, state: &Self::State) -> Self::Proxy {
        let scale = (self.length - 1) as f32;
        state
            .iter()
            .map(|&x| 2.0 * x as f32 / scale - 1.0)
            .collect()
    }

    fn state2readable(&self, state: &Self::State) -> String {
        format!("[{}]", state.iter().join(" "))
    }

    fn readable2state(&self, readable: &str) -> Result<Self::State> {
        let state = readable
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split_whitespace()
            .map(|s| s.parse::<usize>())
            .collect::<Result<Vec<_>, _>>()?;
        if state.len() != self.n_dim || state.iter().any(|&x| x >= self.length) {
            return Err(GfnError::InvalidArgument(format!(
                "{} is not a state of the grid",
                readable
            ))
            .into());
        }
        Ok(state)
    }

    fn all_terminating_states(&self) -> Option<Vec<Self::State>> {
        Some(
            (0..self.n_dim)
                .map(|_| 0..self.length)
                .multi_cartesian_product()
                .collect(),
        )
    }

    fn uniform_terminating_states(&self, n: usize) -> Option<Vec<Self::State>> {
        let all = self.all_terminating_states()?;
        let step = (all.len() / n.max(1)).max(1);
        Some(all.into_iter().step_by(step).take(n).collect())
    }

    fn random_terminating_states(&self, n: usize, seed: u64) -> Option<Vec<Self::State>> {
        let mut rng = StdRng::seed_from_u64(seed);
        Some(
            (0..n)
                .map(|_| {
                    (0..self.n_dim)
                        .map(|_| rng.gen_range(0..self.length))
                        .collect()
                })
                .collect(),
        )
    }
}

/// Scores grid states by their distance from the center.
///
/// The energy of a state in proxy format `x` is `-(1 + sum |x_i|)`, so the
/// corners of the grid have the lowest energy.
#[derive(Debug, Clone, Default)]
pub struct CornerScorer;

impl Scorer<Vec<f32>> for CornerScorer {
    fn score(&self, batch: &[Vec<f32>]) -> Result<Vec<f32>> {
        Ok(batch
            .iter()
            .map(|x| -(1.0 + x.iter().map(|v| v.abs()).sum::<f32>()))
            .collect())
    }
}
