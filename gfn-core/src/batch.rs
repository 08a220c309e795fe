//! Batches of sampled transitions.
//!
//! A [`Batch`] accumulates the transitions produced by many environments,
//! possibly out of order and in either sampling direction, and derives the
//! items a GFlowNet loss needs: parents, masks, rewards and conversions of the
//! states into policy and proxy formats.
mod base;
mod cache;
mod format;
mod traj;
pub use base::{Batch, ParentsAll};
pub use cache::Cache;
pub use format::{SortBy, StateBatch, StateFormat};
