//! Masked categorical distributions over policy outputs.
//!
//! Invalid actions are not removed from the distribution: their logits are
//! replaced with `-LOGINF` before normalization. The resulting probabilities
//! are negligible but finite, so no NaN can come out of the log-softmax.
use crate::GfnError;
use anyhow::Result;
use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::{distributions::WeightedIndex, Rng};

/// Magnitude of the logit given to masked actions.
pub const LOGINF: f32 = 1000.0;

fn check_mask(logits: &ArrayView2<f32>, mask: Option<&ArrayView2<bool>>) -> Result<()> {
    if let Some(mask) = mask {
        if mask.dim() != logits.dim() {
            return Err(GfnError::InvalidArgument(format!(
                "mask of shape {:?} does not match policy outputs of shape {:?}",
                mask.dim(),
                logits.dim()
            ))
            .into());
        }
    }
    Ok(())
}

/// Row-wise log-softmax of `logits` where masked entries are set to `-LOGINF`.
pub fn masked_log_softmax(
    logits: &ArrayView2<f32>,
    mask: Option<&ArrayView2<bool>>,
) -> Result<Array2<f32>> {
    check_mask(logits, mask)?;
    let mut out = logits.to_owned();
    if let Some(mask) = mask {
        out.zip_mut_with(mask, |l, &m| {
            if m {
                *l = -LOGINF;
            }
        });
    }
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let lse = max + row.iter().map(|&l| (l - max).exp()).sum::<f32>().ln();
        row.mapv_inplace(|l| l - lse);
    }
    Ok(out)
}

/// Draws one column per row from the row-wise masked softmax of `logits`.
///
/// Returns the sampled columns and their log-probabilities under the very
/// distribution they were drawn from.
pub fn sample_categorical(
    logits: &ArrayView2<f32>,
    mask: Option<&ArrayView2<bool>>,
    rng: &mut impl Rng,
) -> Result<(Vec<usize>, Array1<f32>)> {
    let logprobs = masked_log_softmax(logits, mask)?;
    let mut ixs = Vec::with_capacity(logprobs.nrows());
    let mut lps = Vec::with_capacity(logprobs.nrows());
    for row in logprobs.axis_iter(Axis(0)) {
        let weights = row.iter().map(|lp| lp.exp()).collect::<Vec<_>>();
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| GfnError::InvalidArgument(format!("degenerate policy output: {}", e)))?;
        let ix = rng.sample(dist);
        ixs.push(ix);
        lps.push(row[ix]);
    }
    Ok((ixs, Array1::from(lps)))
}

/// Log-probabilities of the given columns under the row-wise masked softmax of `logits`.
pub fn log_probs_of(
    logits: &ArrayView2<f32>,
    ixs: &[usize],
    mask: Option<&ArrayView2<bool>>,
) -> Result<Array1<f32>> {
    if ixs.len() != logits.nrows() {
        return Err(GfnError::InvalidArgument(format!(
            "{} actions for {} policy outputs",
            ixs.len(),
            logits.nrows()
        ))
        .into());
    }
    let logprobs = masked_log_softmax(logits, mask)?;
    ixs.iter()
        .enumerate()
        .map(|(i, &ix)| {
            logprobs.get((i, ix)).copied().ok_or_else(|| {
                GfnError::InvalidArgument(format!("action column {} out of range", ix)).into()
            })
        })
        .collect::<Result<Vec<_>>>()
        .map(Array1::from)
}
