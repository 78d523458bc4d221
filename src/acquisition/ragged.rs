//! Ragged candidate lists packed into dense `[batch, k, max_candidates]` tensors.
//!
//! Item `b` owns `counts[b]` candidates. Its scores occupy the leading
//! `counts[b]` slots of the last axis. The remaining slots are padding, hold
//! exactly `0`, and are excluded from every normalization sum.

use candle_core::{DType, Device, Tensor, D};

use crate::error::SelectionError;
use crate::types::Normalization;

/// Per-pass candidate distributions for a batch of competence sets.
#[derive(Debug, Clone)]
pub struct ScoreTensor {
    probs: Tensor,
    candidate_counts: Vec<usize>,
}

impl ScoreTensor {
    pub(crate) fn new(probs: Tensor, candidate_counts: Vec<usize>) -> Self {
        Self {
            probs,
            candidate_counts,
        }
    }

    pub(crate) fn empty(k: usize, device: &Device) -> Result<Self, SelectionError> {
        let probs = Tensor::zeros((0, k, 0), DType::F64, device)
            .map_err(|e| SelectionError::runtime("allocate empty score tensor", e))?;
        Ok(Self::new(probs, Vec::new()))
    }

    /// `[batch, k, max_candidates]`, f64.
    pub fn probs(&self) -> &Tensor {
        &self.probs
    }

    pub fn candidate_counts(&self) -> &[usize] {
        &self.candidate_counts
    }

    /// `(batch, k, max_candidates)`.
    pub fn dims(&self) -> (usize, usize, usize) {
        let dims = self.probs.dims();
        (dims[0], dims[1], dims[2])
    }

    pub fn max_candidates(&self) -> usize {
        self.dims().2
    }

    /// Element-wise natural log. Padded entries become `-inf`.
    pub fn log_probs(&self) -> Result<Tensor, SelectionError> {
        self.probs
            .log()
            .map_err(|e| SelectionError::runtime("log of score tensor", e))
    }

    pub fn to_vec3(&self) -> Result<Vec<Vec<Vec<f64>>>, SelectionError> {
        self.probs
            .to_vec3::<f64>()
            .map_err(|e| SelectionError::runtime("copy score tensor to host", e))
    }

    /// Pad the candidate axis with zeros up to `max_candidates`.
    pub(crate) fn padded_to(self, max_candidates: usize) -> Result<Self, SelectionError> {
        let current = self.max_candidates();
        if current >= max_candidates {
            return Ok(self);
        }
        let probs = self
            .probs
            .pad_with_zeros(D::Minus1, 0, max_candidates - current)
            .map_err(|e| SelectionError::runtime("pad score tensor", e))?;
        Ok(Self::new(probs, self.candidate_counts))
    }

    pub(crate) fn concat(parts: Vec<ScoreTensor>) -> Result<Self, SelectionError> {
        let tensors: Vec<&Tensor> = parts.iter().map(|p| &p.probs).collect();
        let probs = Tensor::cat(&tensors, 0)
            .map_err(|e| SelectionError::runtime("concatenate score chunks", e))?;
        let candidate_counts = parts
            .iter()
            .flat_map(|p| p.candidate_counts.iter().copied())
            .collect();
        Ok(Self::new(probs, candidate_counts))
    }
}

pub(crate) fn check_probability_floor(floor: f64) -> Result<(), SelectionError> {
    if floor.is_finite() && floor > 0.0 && floor < 1.0 {
        Ok(())
    } else {
        Err(SelectionError::configuration(format!(
            "probability_floor must lie in (0, 1), got {floor}"
        )))
    }
}

/// `[batch, max_candidates]` validity mask, 1.0 for real candidates.
pub fn candidate_mask(
    counts: &[usize],
    max_candidates: usize,
    device: &Device,
) -> candle_core::Result<Tensor> {
    let values: Vec<f64> = counts
        .iter()
        .flat_map(|&count| (0..max_candidates).map(move |j| if j < count { 1.0 } else { 0.0 }))
        .collect();
    Tensor::from_vec(values, (counts.len(), max_candidates), device)
}

/// Scatter flat per-pair scores `[total, k]` into `[batch, k, max_candidates]`.
///
/// Implemented as a gather over the flat rows with an extra all-zero row that
/// every padded slot points at.
pub fn scatter_padded(
    flat: &Tensor,
    counts: &[usize],
    max_candidates: usize,
) -> candle_core::Result<Tensor> {
    let (total, k) = flat.dims2()?;
    let expected: usize = counts.iter().sum();
    if total != expected {
        candle_core::bail!("{total} scored pairs but candidate counts add up to {expected}");
    }

    let pad_row = Tensor::zeros((1, k), flat.dtype(), flat.device())?;
    let with_pad = Tensor::cat(&[flat, &pad_row], 0)?;

    let mut index = Vec::with_capacity(counts.len() * max_candidates);
    let mut offset = 0usize;
    for &count in counts {
        for j in 0..max_candidates {
            index.push(if j < count { (offset + j) as u32 } else { total as u32 });
        }
        offset += count;
    }
    let index = Tensor::from_vec(index, counts.len() * max_candidates, flat.device())?;

    with_pad
        .index_select(&index, 0)?
        .reshape((counts.len(), max_candidates, k))?
        .transpose(1, 2)?
        .contiguous()
}

/// Normalize every `[b, pass, :]` row over its valid candidates and clamp
/// valid entries to `floor`. Padded entries stay exactly zero.
pub fn normalize_candidates(
    scores: &Tensor,
    mask: &Tensor,
    normalization: Normalization,
    floor: f64,
) -> candle_core::Result<Tensor> {
    let mask = mask.unsqueeze(1)?;
    let weights = match normalization {
        Normalization::L1 => {
            let magnitudes = scores.abs()?.broadcast_mul(&mask)?;
            // A row whose candidates all score 0 becomes uniform instead of 0/0.
            let empty_rows = magnitudes
                .sum_keepdim(D::Minus1)?
                .eq(0f64)?
                .to_dtype(scores.dtype())?;
            (magnitudes + empty_rows.broadcast_mul(&mask)?)?
        }
        Normalization::Softmax => {
            let penalty = mask.affine(1e300, -1e300)?;
            let row_max = scores
                .broadcast_mul(&mask)?
                .broadcast_add(&penalty)?
                .max_keepdim(D::Minus1)?;
            scores.broadcast_sub(&row_max)?.exp()?.broadcast_mul(&mask)?
        }
    };
    let totals = weights.sum_keepdim(D::Minus1)?;
    weights
        .broadcast_div(&totals)?
        .clamp(floor, f64::MAX)?
        .broadcast_mul(&mask)
}

/// Flat scorer output `[total, k]` to a normalized [`ScoreTensor`].
pub(crate) fn assemble_distribution(
    flat: &Tensor,
    counts: Vec<usize>,
    normalization: Normalization,
    floor: f64,
) -> Result<ScoreTensor, SelectionError> {
    let total: usize = counts.iter().sum();
    let rows = flat
        .dims2()
        .map_err(|e| SelectionError::shape_mismatch(e.to_string()))?
        .0;
    if rows != total {
        return Err(SelectionError::shape_mismatch(format!(
            "scorer returned {rows} rows for {total} candidate pairs"
        )));
    }
    let max_candidates = counts.iter().copied().max().unwrap_or(0);
    let build = || -> candle_core::Result<Tensor> {
        let flat = flat.to_dtype(DType::F64)?;
        let dense = scatter_padded(&flat, &counts, max_candidates)?;
        let mask = candidate_mask(&counts, max_candidates, flat.device())?;
        normalize_candidates(&dense, &mask, normalization, floor)
    };
    let probs = build().map_err(|e| SelectionError::runtime("assemble score tensor", e))?;
    Ok(ScoreTensor::new(probs, counts))
}
