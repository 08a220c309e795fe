//! Actions of an environment.
use serde::{Deserialize, Serialize};
use std::fmt;

/// An action applied to an environment.
///
/// Discrete actions are indices into the ordered action space declared by a
/// [`StateSpace`](crate::StateSpace). The terminal action is not part of that
/// space: it is the separate [`Action::Stop`] variant. In policy outputs and
/// masks, which have `action_space_len + 1` columns, `Stop` takes the last column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Index into the discrete action space.
    Discrete(usize),

    /// Action vector of a continuous action space.
    Continuous(Vec<f32>),

    /// End of trajectory.
    Stop,
}

impl Action {
    /// Converts a column of a policy output into an action.
    ///
    /// Returns `None` if `ix > action_space_len`.
    pub fn from_index(ix: usize, action_space_len: usize) -> Option<Self> {
        if ix < action_space_len {
            Some(Action::Discrete(ix))
        } else if ix == action_space_len {
            Some(Action::Stop)
        } else {
            None
        }
    }

    /// Column of this action in a policy output.
    ///
    /// Continuous actions have no column.
    pub fn index(&self, action_space_len: usize) -> Option<usize> {
        match self {
            Action::Discrete(ix) if *ix < action_space_len => Some(*ix),
            Action::Discrete(_) => None,
            Action::Continuous(_) => None,
            Action::Stop => Some(action_space_len),
        }
    }

    /// Returns `true` for [`Action::Stop`].
    pub fn is_stop(&self) -> bool {
        matches!(self, Action::Stop)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Discrete(ix) => write!(f, "{}", ix),
            Action::Continuous(v) => {
                write!(f, "[")?;
                for (i, x) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", x)?;
                }
                write!(f, "]")
            }
            Action::Stop => write!(f, "eos"),
        }
    }
}

/// How actions are drawn from policy outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SamplingMethod {
    /// Categorical distribution given by the (tempered) policy logits.
    Policy,

    /// All unmasked actions are equiprobable.
    Uniform,
}
