//! Configuration of [`ReplayBuffer`](super::ReplayBuffer).
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{
    default::Default,
    fs::File,
    io::{BufReader, Write},
    path::{Path, PathBuf},
};

/// How the states of a [`DataSet`](super::DataSet) are chosen.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum DataSetKind {
    /// Every terminating state of the space.
    All,

    /// `n` terminating states spread uniformly over the space.
    Uniform {
        /// Number of states.
        n: usize,
    },

    /// `n` random terminating states.
    Random {
        /// Number of states.
        n: usize,

        /// Seed of the random number generator.
        seed: u64,
    },
}

/// Configuration of a [`DataSet`](super::DataSet).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct DataSetConfig {
    /// Selection of the states.
    pub kind: DataSetKind,

    /// If given, the data set is written to this CSV file when built.
    pub output_csv: Option<PathBuf>,
}

impl DataSetConfig {
    /// Creates a configuration without CSV output.
    pub fn new(kind: DataSetKind) -> Self {
        Self {
            kind,
            output_csv: None,
        }
    }

    /// Sets the CSV output path.
    pub fn output_csv(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_csv = Some(path.into());
        self
    }
}

/// Configuration of [`ReplayBuffer`](super::ReplayBuffer).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ReplayBufferConfig {
    /// Number of top-reward samples kept for replay. `0` disables replay.
    pub replay_capacity: usize,

    /// Training data set.
    pub train: Option<DataSetConfig>,

    /// Test data set.
    pub test: Option<DataSetConfig>,
}

impl Default for ReplayBufferConfig {
    fn default() -> Self {
        Self {
            replay_capacity: 0,
            train: None,
            test: None,
        }
    }
}

impl ReplayBufferConfig {
    /// Sets the capacity of the replay reservoir.
    pub fn replay_capacity(mut self, replay_capacity: usize) -> Self {
        self.replay_capacity = replay_capacity;
        self
    }

    /// Sets the training data set.
    pub fn train(mut self, train: DataSetConfig) -> Self {
        self.train = Some(train);
        self
    }

    /// Sets the test data set.
    pub fn test(mut self, test: DataSetConfig) -> Self {
        self.test = Some(test);
        self
    }

    /// Constructs [`ReplayBufferConfig`] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        Ok(b)
    }

    /// Saves [`ReplayBufferConfig`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        Ok(())
    }
}
