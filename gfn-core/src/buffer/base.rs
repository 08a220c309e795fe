//! Sample log and top-reward replay reservoir.
use super::{DataSet, ReplayBufferConfig};
use crate::{Action, Env, GfnError, StateSpace};
use anyhow::Result;
use log::{debug, info};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Reward of an empty slot of the replay reservoir.
const EMPTY_SLOT_REWARD: f32 = -1.0;

/// A sampled terminating state, in readable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    /// Readable state.
    pub state: String,

    /// Readable action path.
    pub path: String,

    /// Reward.
    pub reward: f32,

    /// Energy given by the scorer.
    pub energy: f32,

    /// Training iteration.
    pub iter: usize,
}

/// Where [`ReplayBuffer::add`] puts samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTarget {
    /// The append-only log of every sample.
    Main,

    /// The reservoir of the highest-reward samples.
    Replay,
}

/// Keeps track of the samples of a training run.
///
/// The main log records every sample added to it. The replay reservoir holds
/// the `replay_capacity` samples with the highest rewards seen so far,
/// regardless of when they were added. Training and test data sets are built
/// from the configuration when the buffer is built.
pub struct ReplayBuffer<S: StateSpace> {
    replay_capacity: usize,
    main: Vec<SampleRecord>,
    replay: Vec<Option<SampleRecord>>,
    train: Option<DataSet<S>>,
    test: Option<DataSet<S>>,
}

impl<S: StateSpace> ReplayBuffer<S> {
    /// Builds a buffer and its data sets, scored with the scorer of `env`.
    pub fn build(config: &ReplayBufferConfig, env: &Env<S>) -> Result<Self> {
        let train = match &config.train {
            Some(c) => Some(DataSet::build(env, c)?),
            None => None,
        };
        let test = match &config.test {
            Some(c) => Some(DataSet::build(env, c)?),
            None => None,
        };
        info!(
            "Replay buffer with capacity {}, train set {:?}, test set {:?}",
            config.replay_capacity,
            train.as_ref().map(|d| d.len()),
            test.as_ref().map(|d| d.len())
        );
        Ok(Self {
            replay_capacity: config.replay_capacity,
            main: vec![],
            replay: vec![None; config.replay_capacity],
            train,
            test,
        })
    }

    /// Capacity of the replay reservoir.
    pub fn replay_capacity(&self) -> usize {
        self.replay_capacity
    }

    /// Every sample added to the main log.
    pub fn main(&self) -> &[SampleRecord] {
        &self.main
    }

    /// Samples in the replay reservoir. Empty slots are skipped.
    pub fn replay(&self) -> impl Iterator<Item = &SampleRecord> {
        self.replay.iter().flatten()
    }

    /// Training data set.
    pub fn train(&self) -> Option<&DataSet<S>> {
        self.train.as_ref()
    }

    /// Test data set.
    pub fn test(&self) -> Option<&DataSet<S>> {
        self.test.as_ref()
    }

    /// Adds terminating states with their paths, rewards and energies.
    ///
    /// Adding to [`BufferTarget::Replay`] with a zero capacity does nothing.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        env: &Env<S>,
        states: &[S::State],
        paths: &[Vec<Action>],
        rewards: &[f32],
        energies: &[f32],
        iter: usize,
        target: BufferTarget,
    ) -> Result<()> {
        let n = states.len();
        if paths.len() != n || rewards.len() != n || energies.len() != n {
            return Err(GfnError::InvalidArgument(format!(
                "{} states, {} paths, {} rewards and {} energies",
                n,
                paths.len(),
                rewards.len(),
                energies.len()
            ))
            .into());
        }
        if target == BufferTarget::Replay && self.replay_capacity == 0 {
            return Ok(());
        }

        let records = (0..n).map(|i| SampleRecord {
            state: env.state2readable(&states[i]),
            path: env.path2readable(&paths[i]),
            reward: rewards[i],
            energy: energies[i],
            iter,
        });
        match target {
            BufferTarget::Main => self.main.extend(records),
            BufferTarget::Replay => self.add_greater(records.collect()),
        }
        Ok(())
    }

    /// Moves the candidates with rewards above the reservoir minimum into the reservoir.
    fn add_greater(&mut self, candidates: Vec<SampleRecord>) {
        // consumed or NaN candidates are never selected
        let mut rewards = candidates
            .iter()
            .map(|r| if r.reward.is_nan() { f32::NEG_INFINITY } else { r.reward })
            .collect::<Vec<_>>();
        loop {
            let slot = self
                .replay
                .iter()
                .enumerate()
                .map(|(i, r)| (i, r.as_ref().map_or(EMPTY_SLOT_REWARD, |r| r.reward)))
                .min_by_key(|(_, r)| OrderedFloat(*r));
            let best = rewards
                .iter()
                .copied()
                .enumerate()
                .max_by_key(|(_, r)| OrderedFloat(*r));
            match (slot, best) {
                (Some((slot, slot_reward)), Some((best, best_reward)))
                    if best_reward > slot_reward =>
                {
                    debug!(
                        "Replay slot {}: reward {} replaced by {}",
                        slot, slot_reward, best_reward
                    );
                    self.replay[slot] = Some(candidates[best].clone());
                    rewards[best] = f32::NEG_INFINITY;
                }
                _ => break,
            }
        }
    }

    /// Writes the main log as CSV.
    pub fn write_main_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        write_csv(self.main.iter(), path)
    }

    /// Writes the replay reservoir as CSV.
    pub fn write_replay_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        write_csv(self.replay(), path)
    }
}

fn write_csv<'a>(
    records: impl Iterator<Item = &'a SampleRecord>,
    path: impl AsRef<Path>,
) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)?;
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::{DataSetConfig, DataSetKind},
        dummy::{CornerScorer, Grid, GridConfig},
        reward::RewardConfig,
    };
    use std::{fs, sync::Arc};
    use tempdir::TempDir;

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn env() -> Result<Env<Grid>> {
        Ok(Env::<Grid>::build(&GridConfig::default(), &RewardConfig::default())?
            .with_scorer(Arc::new(CornerScorer)))
    }

    fn add_rewards(
        buffer: &mut ReplayBuffer<Grid>,
        env: &Env<Grid>,
        rewards: &[f32],
        target: BufferTarget,
    ) -> Result<()> {
        let n = rewards.len();
        let states = (0..n).map(|i| vec![i % 3, 0]).collect::<Vec<_>>();
        let paths = vec![vec![Action::Stop]; n];
        let energies = rewards.iter().map(|r| -r).collect::<Vec<_>>();
        buffer.add(env, &states, &paths, rewards, &energies, 0, target)
    }

    fn replay_rewards(buffer: &ReplayBuffer<Grid>) -> Vec<f32> {
        let mut rewards = buffer.replay().map(|r| r.reward).collect::<Vec<_>>();
        rewards.sort_by(|a, b| b.total_cmp(a));
        rewards
    }

    #[test]
    fn test_reservoir_keeps_top_rewards() -> Result<()> {
        init();
        let env = env()?;
        let config = ReplayBufferConfig::default().replay_capacity(3);
        let mut buffer = ReplayBuffer::build(&config, &env)?;
        add_rewards(&mut buffer, &env, &[5.0, 3.0, 9.0, 1.0, 7.0], BufferTarget::Replay)?;
        assert_eq!(replay_rewards(&buffer), vec![9.0, 7.0, 5.0]);
        assert!(buffer.main().is_empty());
        Ok(())
    }

    #[test]
    fn test_reservoir_across_calls() -> Result<()> {
        let env = env()?;
        let config = ReplayBufferConfig::default().replay_capacity(3);
        let mut buffer = ReplayBuffer::build(&config, &env)?;
        add_rewards(&mut buffer, &env, &[5.0, 3.0], BufferTarget::Replay)?;
        assert_eq!(replay_rewards(&buffer), vec![5.0, 3.0]);
        add_rewards(&mut buffer, &env, &[9.0, 1.0, 7.0], BufferTarget::Replay)?;
        assert_eq!(replay_rewards(&buffer), vec![9.0, 7.0, 5.0]);
        add_rewards(&mut buffer, &env, &[2.0, f32::NAN], BufferTarget::Replay)?;
        assert_eq!(replay_rewards(&buffer), vec![9.0, 7.0, 5.0]);
        Ok(())
    }

    #[test]
    fn test_zero_capacity_and_main_log() -> Result<()> {
        let env = env()?;
        let mut buffer = ReplayBuffer::build(&ReplayBufferConfig::default(), &env)?;
        add_rewards(&mut buffer, &env, &[5.0], BufferTarget::Replay)?;
        assert_eq!(buffer.replay().count(), 0);
        add_rewards(&mut buffer, &env, &[5.0, 3.0], BufferTarget::Main)?;
        assert_eq!(buffer.main().len(), 2);
        assert_eq!(buffer.main()[1].state, "[1 0]");
        assert_eq!(buffer.main()[1].path, "[eos]");
        Ok(())
    }

    #[test]
    fn test_mismatched_lengths() -> Result<()> {
        let env = env()?;
        let mut buffer = ReplayBuffer::build(&ReplayBufferConfig::default(), &env)?;
        let err = buffer
            .add(&env, &[vec![0, 0]], &[], &[1.0], &[-1.0], 0, BufferTarget::Main)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GfnError>(),
            Some(GfnError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_data_sets_and_csv() -> Result<()> {
        let env = env()?;
        let config = ReplayBufferConfig::default()
            .replay_capacity(2)
            .train(DataSetConfig::new(DataSetKind::All))
            .test(DataSetConfig::new(DataSetKind::Uniform { n: 3 }));
        let mut buffer = ReplayBuffer::build(&config, &env)?;
        assert_eq!(buffer.train().map(|d| d.len()), Some(9));
        assert_eq!(buffer.test().map(|d| d.len()), Some(3));

        add_rewards(&mut buffer, &env, &[1.0, 2.0], BufferTarget::Main)?;
        add_rewards(&mut buffer, &env, &[1.0, 2.0], BufferTarget::Replay)?;
        let dir = TempDir::new("replay_buffer")?;
        let path = dir.path().join("main.csv");
        buffer.write_main_csv(&path)?;
        let text = fs::read_to_string(&path)?;
        assert_eq!(text.lines().next(), Some("state,path,reward,energy,iter"));
        assert_eq!(text.lines().count(), 3);

        let path = dir.path().join("replay.csv");
        buffer.write_replay_csv(&path)?;
        assert_eq!(fs::read_to_string(&path)?.lines().count(), 3);
        Ok(())
    }
}
