//! Shaping of scorer outputs into strictly positive rewards.
use super::{EnergyStats, RewardConfig};
use crate::GfnError;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Shaping function of a [`RewardTransform`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewardForm {
    /// `(-energy / norm) ^ beta`
    Power,

    /// `exp(-beta * energy)`
    Boltzmann,
}

impl FromStr for RewardForm {
    type Err = GfnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "power" => Ok(RewardForm::Power),
            "boltzmann" => Ok(RewardForm::Boltzmann),
            _ => Err(GfnError::UnsupportedRewardForm(s.to_string())),
        }
    }
}

fn check_positive(name: &'static str, value: f32) -> Result<(), GfnError> {
    if value > 0.0 {
        Ok(())
    } else {
        Err(GfnError::InvalidRewardParameter { name, value })
    }
}

/// Invertible mapping between scorer outputs (energies) and rewards.
///
/// Rewards are never below `min_reward`, which is strictly positive, so that
/// their logarithm is always defined.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardTransform {
    form: RewardForm,
    beta: f32,
    norm: f32,
    norm_std_mult: f32,
    min_reward: f32,
    denorm_proxy: bool,
    energies_stats: Option<EnergyStats>,
}

impl Default for RewardTransform {
    fn default() -> Self {
        Self {
            form: RewardForm::Power,
            beta: 1.0,
            norm: 1.0,
            norm_std_mult: 0.0,
            min_reward: 1e-8,
            denorm_proxy: false,
            energies_stats: None,
        }
    }
}

impl RewardTransform {
    /// Builds the transform, validating the configuration.
    pub fn build(config: &RewardConfig) -> Result<Self> {
        let form = config.func.parse::<RewardForm>()?;
        check_positive("beta", config.beta)?;
        check_positive("norm", config.norm)?;
        check_positive("min_reward", config.min_reward)?;
        if config.denorm_proxy && config.energies_stats.is_none() {
            return Err(GfnError::InvalidArgument(
                "denorm_proxy requires energies_stats".to_string(),
            )
            .into());
        }
        let mut transform = Self {
            form,
            beta: config.beta,
            norm: config.norm,
            norm_std_mult: config.norm_std_mult,
            min_reward: config.min_reward,
            denorm_proxy: config.denorm_proxy,
            energies_stats: None,
        };
        if let Some(stats) = config.energies_stats {
            transform.set_energies_stats(stats)?;
        }
        Ok(transform)
    }

    /// Shaping function.
    pub fn form(&self) -> RewardForm {
        self.form
    }

    /// Current norm of the power form.
    pub fn norm(&self) -> f32 {
        self.norm
    }

    /// Reward floor.
    pub fn min_reward(&self) -> f32 {
        self.min_reward
    }

    /// Energy statistics, if any.
    pub fn energies_stats(&self) -> Option<&EnergyStats> {
        self.energies_stats.as_ref()
    }

    /// Sets energy statistics.
    ///
    /// If `norm_std_mult > 0`, the norm becomes `norm_std_mult * stats.std`.
    pub fn set_energies_stats(&mut self, stats: EnergyStats) -> Result<()> {
        if self.norm_std_mult > 0.0 {
            let norm = self.norm_std_mult * stats.std;
            check_positive("norm", norm)?;
            self.norm = norm;
        }
        self.energies_stats = Some(stats);
        Ok(())
    }

    /// Sets the norm of the power form.
    pub fn set_reward_norm(&mut self, norm: f32) -> Result<()> {
        check_positive("norm", norm)?;
        self.norm = norm;
        Ok(())
    }

    fn denormalize(&self, value: f32) -> f32 {
        match (self.denorm_proxy, &self.energies_stats) {
            (true, Some(stats)) => value * stats.std + stats.mean,
            _ => value,
        }
    }

    fn normalize(&self, value: f32) -> f32 {
        match (self.denorm_proxy, &self.energies_stats) {
            (true, Some(stats)) => (value - stats.mean) / stats.std,
            _ => value,
        }
    }

    /// Converts a scorer output into a reward.
    pub fn proxy_to_reward(&self, value: f32) -> f32 {
        let value = self.denormalize(value);
        let reward = match self.form {
            RewardForm::Power => (-value / self.norm).powf(self.beta),
            RewardForm::Boltzmann => (-self.beta * value).exp(),
        };
        // NaN (negative base with fractional beta) falls back to the floor
        reward.max(self.min_reward)
    }

    /// Converts a reward back into scorer units.
    ///
    /// Exact inverse of [`RewardTransform::proxy_to_reward`] where the floor
    /// was not active.
    pub fn reward_to_proxy(&self, reward: f32) -> f32 {
        let value = match self.form {
            RewardForm::Power => -(reward.ln() / self.beta).exp() * self.norm,
            RewardForm::Boltzmann => -reward.ln() / self.beta,
        };
        self.normalize(value)
    }

    /// Batched [`RewardTransform::proxy_to_reward`].
    pub fn proxy_to_reward_batch(&self, values: &[f32]) -> Vec<f32> {
        values.iter().map(|&v| self.proxy_to_reward(v)).collect()
    }

    /// Batched [`RewardTransform::reward_to_proxy`].
    pub fn reward_to_proxy_batch(&self, rewards: &[f32]) -> Vec<f32> {
        rewards.iter().map(|&r| self.reward_to_proxy(r)).collect()
    }
}
