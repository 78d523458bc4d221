use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::SelectionError;
use crate::types::CandidateBatch;

/// Draw `min(batch_size, scores.len())` distinct indices with probability
/// proportional to `score^alpha`, sequentially and without replacement.
///
/// The returned weights are the probabilities computed before the first draw,
/// listed in draw order.
pub fn power_bald_batch<R: Rng + ?Sized>(
    scores: &[f64],
    batch_size: usize,
    alpha: f64,
    rng: &mut R,
) -> Result<CandidateBatch, SelectionError> {
    if !alpha.is_finite() || alpha < 0.0 {
        return Err(SelectionError::configuration(format!(
            "alpha must be a finite non-negative number, got {alpha}"
        )));
    }
    if let Some(bad) = scores.iter().find(|s| !s.is_finite()) {
        return Err(SelectionError::numeric(format!(
            "acquisition score {bad} is not finite"
        )));
    }
    let draws = batch_size.min(scores.len());
    if draws == 0 {
        return Ok(CandidateBatch {
            indices: Vec::new(),
            weights: Some(Vec::new()),
        });
    }

    let probabilities = power_distribution(scores, alpha)?;
    let mut dist = WeightedIndex::new(&probabilities).map_err(|e| {
        SelectionError::configuration(format!("invalid selection distribution: {e}"))
    })?;

    let mut indices = Vec::with_capacity(draws);
    let mut weights = Vec::with_capacity(draws);
    for draw in 0..draws {
        let idx = dist.sample(rng);
        indices.push(idx);
        weights.push(probabilities[idx]);
        if draw + 1 < draws {
            dist.update_weights(&[(idx, &0.0)]).map_err(|_| {
                SelectionError::configuration(format!(
                    "only {} items have non-zero selection probability, {draws} requested",
                    draw + 1
                ))
            })?;
        }
    }

    tracing::debug!(draws, alpha, "power-BALD batch drawn");
    Ok(CandidateBatch {
        indices,
        weights: Some(weights),
    })
}

fn power_distribution(scores: &[f64], alpha: f64) -> Result<Vec<f64>, SelectionError> {
    if alpha == 0.0 {
        let uniform = 1.0 / scores.len() as f64;
        return Ok(vec![uniform; scores.len()]);
    }

    // BALD can dip slightly below zero from float noise.
    let clamped: Vec<f64> = scores.iter().map(|s| s.max(0.0)).collect();
    let max = clamped.iter().copied().fold(0.0, f64::max);
    if max <= 0.0 {
        return Err(SelectionError::configuration(
            "every acquisition score is zero; the selection distribution is empty",
        ));
    }
    let powered: Vec<f64> = clamped.iter().map(|s| (s / max).powf(alpha)).collect();
    let total: f64 = powered.iter().sum();
    Ok(powered.into_iter().map(|w| w / total).collect())
}

/// Uniform sample of `min(batch_size, n)` distinct indices out of `0..n`.
pub fn random_batch<R: Rng + ?Sized>(n: usize, batch_size: usize, rng: &mut R) -> CandidateBatch {
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(rng);
    indices.truncate(batch_size.min(n));
    CandidateBatch {
        indices,
        weights: None,
    }
}
