//! Selectors of state formats and orderings.
use crate::{GfnError, StateSpace};
use ndarray::Array2;
use std::str::FromStr;

/// Format of states returned by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFormat {
    /// States as held by the environment.
    Native,

    /// Rows of the policy model input.
    Policy,

    /// Input of the scorer.
    Proxy,
}

impl StateFormat {
    /// Resolves a pair of format flags.
    ///
    /// Requesting both formats at once is an error.
    pub fn from_flags(policy: bool, proxy: bool) -> Result<Self, GfnError> {
        match (policy, proxy) {
            (true, true) => Err(GfnError::AmbiguousRequest),
            (true, false) => Ok(Self::Policy),
            (false, true) => Ok(Self::Proxy),
            (false, false) => Ok(Self::Native),
        }
    }
}

/// Ordering of the rows selected from a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    /// Order in which rows were added.
    #[default]
    Insertion,

    /// Ascending trajectory id, ties in insertion order.
    Trajectory,
}

impl FromStr for SortBy {
    type Err = GfnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" | "insertion" => Ok(Self::Insertion),
            "traj" | "trajectory" => Ok(Self::Trajectory),
            _ => Err(GfnError::InvalidArgument(format!("unknown sort key {}", s))),
        }
    }
}

/// States in one of the [`StateFormat`]s.
#[derive(Debug, Clone)]
pub enum StateBatch<S: StateSpace> {
    /// Native states.
    Native(Vec<S::State>),

    /// One row per state.
    Policy(Array2<f32>),

    /// Proxy states.
    Proxy(Vec<S::Proxy>),
}

impl<S: StateSpace> StateBatch<S> {
    /// Number of states.
    pub fn len(&self) -> usize {
        match self {
            Self::Native(v) => v.len(),
            Self::Policy(a) => a.nrows(),
            Self::Proxy(v) => v.len(),
        }
    }

    /// `true` if there are no states.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Native states, if in that format.
    pub fn into_native(self) -> Option<Vec<S::State>> {
        match self {
            Self::Native(v) => Some(v),
            _ => None,
        }
    }

    /// Policy rows, if in that format.
    pub fn into_policy(self) -> Option<Array2<f32>> {
        match self {
            Self::Policy(a) => Some(a),
            _ => None,
        }
    }

    /// Proxy states, if in that format.
    pub fn into_proxy(self) -> Option<Vec<S::Proxy>> {
        match self {
            Self::Proxy(v) => Some(v),
            _ => None,
        }
    }
}
