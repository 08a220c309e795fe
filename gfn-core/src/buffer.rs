//! Log of sampled terminating states and top-reward replay.
mod base;
mod config;
mod dataset;
pub use base::{BufferTarget, ReplayBuffer, SampleRecord};
pub use config::{DataSetConfig, DataSetKind, ReplayBufferConfig};
pub use dataset::DataSet;
