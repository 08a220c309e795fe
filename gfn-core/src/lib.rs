#![warn(missing_docs)]
//! Trajectory and state bookkeeping for GFlowNet training.
//!
//! The crate defines the contract of an environment ([`StateSpace`] and its
//! per-trajectory instance [`Env`]), the [`batch::Batch`] that accumulates
//! sampled transitions of many trajectories and derives training items from
//! them, the [`reward::RewardTransform`] that maps scorer outputs to rewards,
//! and the [`buffer::ReplayBuffer`] that logs sampled terminating states.
pub mod batch;
pub mod buffer;
pub mod dummy;
pub mod error;
pub mod reward;
pub mod sampling;

mod base;
pub use base::{Action, Env, SamplingMethod, Scorer, StateSpace, TrajId, TrajIdPool};
pub use error::GfnError;
