//! Configuration of [`RewardTransform`](super::RewardTransform).
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    default::Default,
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Summary statistics of the energies of a data set.
///
/// Used to de-normalize scorer outputs and to scale the reward norm.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone, Copy)]
pub struct EnergyStats {
    /// Mean energy.
    pub mean: f32,

    /// Sample standard deviation of the energies.
    pub std: f32,

    /// Minimum energy.
    pub min: f32,

    /// Maximum energy.
    pub max: f32,

    /// Maximum absolute z-score of the energies.
    pub max_norm: f32,
}

/// Configuration of [`RewardTransform`](super::RewardTransform).
///
/// # Examples
///
/// ```rust
/// use gfn_core::reward::{RewardConfig, RewardTransform};
///
/// let config = RewardConfig::default().func("boltzmann").beta(2.0);
/// let transform = RewardTransform::build(&config).unwrap();
/// assert!((transform.proxy_to_reward(0.0) - 1.0).abs() < 1e-6);
/// ```
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct RewardConfig {
    /// Identifier of the shaping function, `"power"` or `"boltzmann"`.
    pub func: String,

    /// Exponent of the power form, inverse temperature of the Boltzmann form.
    pub beta: f32,

    /// Normalizing constant of the power form.
    pub norm: f32,

    /// If positive, the norm is set to `norm_std_mult * std` whenever energy
    /// statistics are given.
    pub norm_std_mult: f32,

    /// Lower bound of the reward.
    pub min_reward: f32,

    /// De-normalize scorer outputs with [`EnergyStats`] before shaping.
    pub denorm_proxy: bool,

    /// Statistics used for de-normalization.
    pub energies_stats: Option<EnergyStats>,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            func: "power".to_string(),
            beta: 1.0,
            norm: 1.0,
            norm_std_mult: 0.0,
            min_reward: 1e-8,
            denorm_proxy: false,
            energies_stats: None,
        }
    }
}

impl RewardConfig {
    /// Sets the shaping function.
    pub fn func(mut self, func: impl Into<String>) -> Self {
        self.func = func.into();
        self
    }

    /// Sets `beta`.
    pub fn beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    /// Sets the norm of the power form.
    pub fn norm(mut self, norm: f32) -> Self {
        self.norm = norm;
        self
    }

    /// Sets the multiplier of the standard deviation used as norm.
    pub fn norm_std_mult(mut self, norm_std_mult: f32) -> Self {
        self.norm_std_mult = norm_std_mult;
        self
    }

    /// Sets the reward floor.
    pub fn min_reward(mut self, min_reward: f32) -> Self {
        self.min_reward = min_reward;
        self
    }

    /// Enables de-normalization of scorer outputs with the given statistics.
    pub fn denorm_proxy(mut self, energies_stats: EnergyStats) -> Self {
        self.denorm_proxy = true;
        self.energies_stats = Some(energies_stats);
        self
    }

    /// Constructs [`RewardConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`RewardConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
