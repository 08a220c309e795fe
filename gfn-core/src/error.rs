//! Errors in the library.
use crate::TrajId;
use thiserror::Error;

/// Errors in the library.
#[derive(Error, Debug)]
pub enum GfnError {
    /// The reward shaping identifier is not known.
    #[error("Unsupported reward form: {0}")]
    UnsupportedRewardForm(String),

    /// A reward shaping parameter is out of its domain.
    #[error("Invalid reward parameter: {name} = {value} (must be > 0)")]
    InvalidRewardParameter {
        /// Name of the parameter.
        name: &'static str,
        /// Rejected value.
        value: f32,
    },

    /// Both policy and proxy formats were requested at the same time.
    #[error("Ambiguous request! Only one of policy or proxy can be requested")]
    AmbiguousRequest,

    /// Arguments do not fit together.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not defined for this kind of environment.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A sampled action is not among the actions leading to the state from its parents.
    #[error("Sampled action {action} of row {row} is not in the set of parent actions")]
    InconsistentParents {
        /// Batch row.
        row: usize,
        /// Readable form of the sampled action.
        action: String,
    },

    /// Structural invariants of a batch are violated.
    #[error("Corrupt batch: {0}")]
    CorruptBatch(String),

    /// An environment was added to a batch before it was given a trajectory id.
    #[error("Environment has no trajectory id")]
    MissingTrajectoryId,

    /// The trajectory id is not held by the batch.
    #[error("Unknown trajectory: {0}")]
    UnknownTrajectory(TrajId),

    /// Rewards were requested from an environment without a scorer.
    #[error("No scorer attached to the environment")]
    MissingScorer,
}
