//! BALD acquisition: mutual information between the predicted competence level
//! and the model weights, estimated from `k` MC-dropout passes.
//!
//! For an item with per-pass log-probabilities `l[p][c]`:
//!
//! ```text
//! mean_c    = logsumexp_p(l[p][c]) - ln k
//! entropy   = -sum_c exp(mean_c) * mean_c
//! cond      = mean_p(-sum_c exp(l[p][c]) * l[p][c])
//! bald      = entropy - cond
//! ```
//!
//! Entries equal to `-inf` (padded candidates) contribute 0 to every sum.

use candle_core::{DType, Tensor};

use crate::error::SelectionError;

/// BALD score per item of a `[batch, k, max_candidates]` log-probability tensor.
pub fn bald_scores(log_probs: &Tensor) -> Result<Vec<f64>, SelectionError> {
    let items = host_log_probs(log_probs)?;
    Ok(items
        .iter()
        .map(|passes| entropy_of_mean(passes) - mean_entropy(passes))
        .collect())
}

/// Entropy of the pass-averaged distribution, per item.
pub fn predictive_entropy(log_probs: &Tensor) -> Result<Vec<f64>, SelectionError> {
    let items = host_log_probs(log_probs)?;
    Ok(items.iter().map(|passes| entropy_of_mean(passes)).collect())
}

/// Average entropy of the individual passes, per item.
pub fn expected_conditional_entropy(log_probs: &Tensor) -> Result<Vec<f64>, SelectionError> {
    let items = host_log_probs(log_probs)?;
    Ok(items.iter().map(|passes| mean_entropy(passes)).collect())
}

fn host_log_probs(log_probs: &Tensor) -> Result<Vec<Vec<Vec<f64>>>, SelectionError> {
    if log_probs.rank() != 3 {
        return Err(SelectionError::shape_mismatch(format!(
            "expected [batch, k, candidates] log-probabilities, got shape {:?}",
            log_probs.dims()
        )));
    }
    if log_probs.dims()[1] == 0 {
        return Err(SelectionError::shape_mismatch(
            "log-probabilities hold zero passes",
        ));
    }
    let values = log_probs
        .to_dtype(DType::F64)
        .and_then(|t| t.to_vec3::<f64>())
        .map_err(|e| SelectionError::runtime("copy log-probabilities to host", e))?;

    let degenerate = values
        .iter()
        .flatten()
        .flatten()
        .any(|v| v.is_nan() || *v == f64::INFINITY);
    if degenerate {
        return Err(SelectionError::numeric(
            "log-probabilities contain NaN or +inf",
        ));
    }
    Ok(values)
}

fn entropy_of_mean(passes: &[Vec<f64>]) -> f64 {
    let k = passes.len() as f64;
    let candidates = passes.first().map_or(0, Vec::len);
    (0..candidates)
        .map(|c| {
            let mean = logsumexp(passes.iter().map(|pass| pass[c])) - k.ln();
            -plogp(mean)
        })
        .sum()
}

fn mean_entropy(passes: &[Vec<f64>]) -> f64 {
    let k = passes.len() as f64;
    let total: f64 = passes
        .iter()
        .map(|pass| -pass.iter().copied().map(plogp).sum::<f64>())
        .sum();
    total / k
}

/// `p * ln p` given `ln p`, with `0 * ln 0 = 0`.
fn plogp(log_p: f64) -> f64 {
    if log_p == f64::NEG_INFINITY {
        0.0
    } else {
        log_p.exp() * log_p
    }
}

fn logsumexp(values: impl Iterator<Item = f64> + Clone) -> f64 {
    let max = values.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + values.map(|v| (v - max).exp()).sum::<f64>().ln()
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn log_tensor(probs: Vec<Vec<Vec<f64>>>) -> Tensor {
        let b = probs.len();
        let k = probs[0].len();
        let c = probs[0][0].len();
        let flat: Vec<f64> = probs.into_iter().flatten().flatten().collect();
        Tensor::from_vec(flat, (b, k, c), &Device::Cpu)
            .unwrap()
            .log()
            .unwrap()
    }

    #[test]
    fn logsumexp_handles_all_negative_infinity() {
        let values = [f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert_eq!(logsumexp(values.iter().copied()), f64::NEG_INFINITY);
        let values = [0.5f64.ln(), 0.5f64.ln()];
        assert!(logsumexp(values.iter().copied()).abs() < 1e-12);
    }

    #[test]
    fn entropies_match_closed_form() {
        let t = log_tensor(vec![vec![vec![0.5, 0.5], vec![0.5, 0.5]]]);
        let h = predictive_entropy(&t).unwrap();
        let c = expected_conditional_entropy(&t).unwrap();
        assert!((h[0] - 2f64.ln()).abs() < 1e-12);
        assert!((c[0] - 2f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn padded_candidates_contribute_nothing() {
        let padded = log_tensor(vec![vec![vec![0.7, 0.3, 0.0], vec![0.2, 0.8, 0.0]]]);
        let dense = log_tensor(vec![vec![vec![0.7, 0.3], vec![0.2, 0.8]]]);
        let a = bald_scores(&padded).unwrap();
        let b = bald_scores(&dense).unwrap();
        assert!((a[0] - b[0]).abs() < 1e-12);
    }

    #[test]
    fn rejects_wrong_rank() {
        let t = Tensor::zeros((2, 3), DType::F64, &Device::Cpu).unwrap();
        assert!(matches!(
            bald_scores(&t),
            Err(SelectionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn rejects_nan() {
        let t = Tensor::from_vec(vec![f64::NAN, 0.0], (1, 1, 2), &Device::Cpu).unwrap();
        assert!(matches!(
            bald_scores(&t),
            Err(SelectionError::NumericDegeneracy { .. })
        ));
    }
}
