//! Scoring function of terminating states.
use anyhow::Result;

/// Turns a batch of states in proxy format into energies.
///
/// Lower energies are better; rewards are obtained from energies with a
/// [`RewardTransform`](crate::reward::RewardTransform).
pub trait Scorer<P>: Send + Sync {
    /// Scores a batch. The output has one energy per input.
    fn score(&self, batch: &[P]) -> Result<Vec<f32>>;
}

impl<P, F> Scorer<P> for F
where
    F: Fn(&[P]) -> Result<Vec<f32>> + Send + Sync,
{
    fn score(&self, batch: &[P]) -> Result<Vec<f32>> {
        self(batch)
    }
}
