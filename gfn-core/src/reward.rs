//! Reward shaping.
//!
//! A scorer returns energies (lower is better); training objectives need
//! strictly positive rewards. [`RewardTransform`] maps one into the other with
//! either the power form or the Boltzmann form, and back.
mod base;
mod config;
pub use base::{RewardForm, RewardTransform};
pub use config::{EnergyStats, RewardConfig};
