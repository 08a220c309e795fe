//! Scored sets of terminating states.
use super::{DataSetConfig, DataSetKind};
use crate::{reward::EnergyStats, Env, GfnError, StateSpace};
use anyhow::Result;
use log::info;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct DataSetRow<'a> {
    samples: &'a str,
    energies: f32,
}

/// Terminating states with their energies.
#[derive(Debug, Clone)]
pub struct DataSet<S: StateSpace> {
    states: Vec<S::State>,
    energies: Vec<f32>,
}

impl<S: StateSpace> DataSet<S> {
    /// Selects states with the enumerators of the space and scores them.
    ///
    /// The data set is written to `config.output_csv` if given.
    pub fn build(env: &Env<S>, config: &DataSetConfig) -> Result<Self> {
        let space = env.space();
        let states = match &config.kind {
            DataSetKind::All => space.all_terminating_states(),
            DataSetKind::Uniform { n } => space.uniform_terminating_states(*n),
            DataSetKind::Random { n, seed } => space.random_terminating_states(*n, *seed),
        }
        .ok_or_else(|| {
            GfnError::UnsupportedOperation(format!(
                "{:?} data set: the space does not enumerate terminating states",
                config.kind
            ))
        })?;

        let data_set = Self::from_states(env, states)?;
        info!(
            "Built {:?} data set of {} states",
            config.kind,
            data_set.len()
        );
        if let Some(path) = &config.output_csv {
            data_set.write_csv(env, path)?;
        }
        Ok(data_set)
    }

    /// Scores `states`.
    pub fn from_states(env: &Env<S>, states: Vec<S::State>) -> Result<Self> {
        let energies = if states.is_empty() {
            vec![]
        } else {
            env.score(&env.statebatch2proxy(&states))?
        };
        Ok(Self { states, energies })
    }

    /// States.
    pub fn states(&self) -> &[S::State] {
        &self.states
    }

    /// Energy of each state.
    pub fn energies(&self) -> &[f32] {
        &self.energies
    }

    /// Number of states.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// `true` if there are no states.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Summary statistics of the energies.
    ///
    /// The standard deviation is the sample one; it is `0` for a single state.
    pub fn stats(&self) -> Result<EnergyStats> {
        let n = self.energies.len();
        if n == 0 {
            return Err(GfnError::InvalidArgument(
                "statistics of an empty data set".to_string(),
            )
            .into());
        }
        let mean = self.energies.iter().sum::<f32>() / n as f32;
        let std = if n > 1 {
            let ss = self
                .energies
                .iter()
                .map(|e| (e - mean).powi(2))
                .sum::<f32>();
            (ss / (n - 1) as f32).sqrt()
        } else {
            0.0
        };
        let min = self.energies.iter().copied().fold(f32::INFINITY, f32::min);
        let max = self
            .energies
            .iter()
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        let max_norm = if std > 0.0 {
            self.energies
                .iter()
                .map(|e| ((e - mean) / std).abs())
                .fold(0.0, f32::max)
        } else {
            0.0
        };
        Ok(EnergyStats {
            mean,
            std,
            min,
            max,
            max_norm,
        })
    }

    /// Writes readable states and energies as CSV with columns `samples` and `energies`.
    pub fn write_csv(&self, env: &Env<S>, path: impl AsRef<Path>) -> Result<()> {
        let mut wtr = csv::Writer::from_path(path)?;
        for (state, &energies) in self.states.iter().zip(self.energies.iter()) {
            let samples = env.state2readable(state);
            wtr.serialize(DataSetRow {
                samples: &samples,
                energies,
            })?;
        }
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dummy::{CornerScorer, Grid, GridConfig},
        reward::RewardConfig,
    };
    use std::{fs, sync::Arc};
    use tempdir::TempDir;

    fn env() -> Result<Env<Grid>> {
        Ok(Env::<Grid>::build(&GridConfig::default(), &RewardConfig::default())?
            .with_scorer(Arc::new(CornerScorer)))
    }

    #[test]
    fn test_build_all() -> Result<()> {
        let env = env()?;
        let data_set = DataSet::build(&env, &DataSetConfig::new(DataSetKind::All))?;
        assert_eq!(data_set.len(), 9);
        // center [1 1] has energy -1, corners -3
        let stats = data_set.stats()?;
        assert!((stats.min + 3.0).abs() < 1e-6);
        assert!((stats.max + 1.0).abs() < 1e-6);
        // 4 corners at -3, 4 edges at -2, the center at -1
        assert!((stats.mean + 7.0 / 3.0).abs() < 1e-5);
        assert!(stats.std > 0.0);
        assert!((stats.max_norm - (stats.max - stats.mean) / stats.std).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_build_random_is_reproducible() -> Result<()> {
        let env = env()?;
        let config = DataSetConfig::new(DataSetKind::Random { n: 6, seed: 3 });
        let a = DataSet::build(&env, &config)?;
        let b = DataSet::build(&env, &config)?;
        assert_eq!(a.len(), 6);
        assert_eq!(a.states(), b.states());
        assert_eq!(a.energies(), b.energies());
        Ok(())
    }

    #[test]
    fn test_empty_stats() -> Result<()> {
        let env = env()?;
        let data_set = DataSet::from_states(&env, vec![])?;
        assert!(data_set.is_empty());
        assert!(data_set.stats().is_err());
        Ok(())
    }

    #[test]
    fn test_write_csv() -> Result<()> {
        let env = env()?;
        let dir = TempDir::new("data_set")?;
        let path = dir.path().join("train.csv");
        let config = DataSetConfig::new(DataSetKind::Uniform { n: 3 }).output_csv(&path);
        let data_set = DataSet::build(&env, &config)?;
        let text = fs::read_to_string(&path)?;
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), data_set.len() + 1);
        assert_eq!(lines[0], "samples,energies");
        assert_eq!(lines[1], "[0 0],-3.0");
        Ok(())
    }
}
