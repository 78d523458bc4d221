use std::sync::Arc;

use candle_core::{DType, Tensor};

use crate::acquisition::ragged::{assemble_distribution, check_probability_floor, ScoreTensor};
use crate::error::SelectionError;
use crate::model::dropout::{ConsistentMcDropout, DropoutUnit, McSession};
use crate::pipeline::traits::{CompetenceScorer, StochasticUnit};
use crate::types::{CompetenceSet, Normalization, PaddingMode};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StochasticOptions {
    /// Seed of the mask generator.
    pub seed: u64,
    pub normalization: Normalization,
    pub probability_floor: f64,
}

impl Default for StochasticOptions {
    fn default() -> Self {
        Self {
            seed: 0,
            normalization: Normalization::L1,
            probability_floor: 1e-100,
        }
    }
}

/// Wraps a competence scorer and evaluates it under consistent MC dropout.
///
/// Construction converts every non-positional dropout unit the scorer
/// registers into a [`ConsistentMcDropout`] bound to this engine's session.
/// Forward methods take `&mut self`: mask state is invocation-scoped, so one
/// engine never runs two invocations at once.
pub struct BayesianCompetenceModel {
    scorer: Box<dyn CompetenceScorer>,
    session: Arc<McSession>,
    normalization: Normalization,
    probability_floor: f64,
    converted_units: usize,
}

impl BayesianCompetenceModel {
    pub fn new(
        mut scorer: Box<dyn CompetenceScorer>,
        options: StochasticOptions,
    ) -> Result<Self, SelectionError> {
        check_probability_floor(options.probability_floor)?;
        let session = Arc::new(McSession::new(options.seed));
        let converted_units = transform_dropout(scorer.as_mut(), &session)?;
        tracing::info!(
            converted_units,
            normalization = ?options.normalization,
            "scorer wrapped for consistent MC dropout"
        );
        Ok(Self {
            scorer,
            session,
            normalization: options.normalization,
            probability_floor: options.probability_floor,
            converted_units,
        })
    }

    pub fn converted_units(&self) -> usize {
        self.converted_units
    }

    pub fn scorer(&self) -> &dyn CompetenceScorer {
        self.scorer.as_ref()
    }

    /// Give back the wrapped scorer. Its dropout units stay converted.
    pub fn into_inner(self) -> Box<dyn CompetenceScorer> {
        self.scorer
    }

    /// Stochastic score of each `(transcripts[i], competences[i])` pair under
    /// `k` passes, as an `[n, k]` tensor.
    pub fn forward_pairs(
        &mut self,
        transcripts: &[&str],
        competences: &[&str],
        k: usize,
    ) -> Result<Tensor, SelectionError> {
        if k == 0 {
            return Err(SelectionError::configuration(
                "number of stochastic passes must be at least 1",
            ));
        }
        if transcripts.len() != competences.len() {
            return Err(SelectionError::shape_mismatch(format!(
                "{} transcripts but {} competences",
                transcripts.len(),
                competences.len()
            )));
        }
        let n = transcripts.len();
        if n == 0 {
            return Tensor::zeros((0, k), DType::F32, self.scorer.device())
                .map_err(|e| SelectionError::runtime("allocate empty pass scores", e));
        }

        let expanded_t = replicate(transcripts, k);
        let expanded_c = replicate(competences, k);

        let invocation = self.session.begin_invocation(k);
        tracing::debug!(pairs = n, passes = k, invocation, "stochastic forward");
        let probs = self
            .scorer
            .score(&expanded_t, &expanded_c, PaddingMode::MaxLength)?;

        if probs.dims() != [n * k] {
            return Err(SelectionError::shape_mismatch(format!(
                "scorer returned shape {:?} for {} replicated pairs",
                probs.dims(),
                n * k
            )));
        }
        probs
            .reshape((n, k))
            .map_err(|e| SelectionError::runtime("reshape pass scores", e))
    }

    /// Per-pass candidate distributions `[batch, k, max_candidates]`.
    pub fn score_distribution(
        &mut self,
        sets: &[CompetenceSet],
        k: usize,
    ) -> Result<ScoreTensor, SelectionError> {
        if k == 0 {
            return Err(SelectionError::configuration(
                "number of stochastic passes must be at least 1",
            ));
        }
        if let Some(pos) = sets.iter().position(CompetenceSet::is_empty) {
            return Err(SelectionError::configuration(format!(
                "competence set {pos} has no candidates"
            )));
        }
        if sets.is_empty() {
            return ScoreTensor::empty(k, self.scorer.device());
        }

        let counts: Vec<usize> = sets.iter().map(CompetenceSet::len).collect();
        let (transcripts, competences): (Vec<&str>, Vec<&str>) = sets
            .iter()
            .flat_map(CompetenceSet::items)
            .map(|item| (item.transcript, item.competence))
            .unzip();

        let flat = self.forward_pairs(&transcripts, &competences, k)?;
        assemble_distribution(&flat, counts, self.normalization, self.probability_floor)
    }

    /// Same as [`score_distribution`](Self::score_distribution), scoring at
    /// most `chunk_size` sets per scorer invocation. Every chunk is padded to
    /// the pool-wide candidate maximum.
    pub fn score_distribution_chunked(
        &mut self,
        sets: &[CompetenceSet],
        k: usize,
        chunk_size: usize,
    ) -> Result<ScoreTensor, SelectionError> {
        if chunk_size == 0 {
            return Err(SelectionError::configuration("chunk_size must be at least 1"));
        }
        if sets.len() <= chunk_size {
            return self.score_distribution(sets, k);
        }
        let max_candidates = sets.iter().map(CompetenceSet::len).max().unwrap_or(0);
        let mut parts = Vec::with_capacity(sets.len().div_ceil(chunk_size));
        for chunk in sets.chunks(chunk_size) {
            parts.push(self.score_distribution(chunk, k)?.padded_to(max_candidates)?);
        }
        ScoreTensor::concat(parts)
    }
}

/// Repeat each text `k` times in place: pair-major, pass index varying fastest.
fn replicate<'a>(texts: &[&'a str], k: usize) -> Vec<&'a str> {
    texts
        .iter()
        .flat_map(|&t| std::iter::repeat(t).take(k))
        .collect()
}

/// Replace every standard, non-positional dropout unit of `scorer` with a
/// consistent MC unit bound to `session`. Returns how many were converted.
pub(crate) fn transform_dropout(
    scorer: &mut dyn CompetenceScorer,
    session: &Arc<McSession>,
) -> Result<usize, SelectionError> {
    let mut converted = 0usize;
    let mut already = 0usize;
    for StochasticUnit {
        name,
        positional,
        unit,
    } in scorer.stochastic_units()
    {
        if positional {
            continue;
        }
        if let DropoutUnit::ConsistentMc(existing) = &*unit {
            if !existing.is_bound_to(session) {
                tracing::warn!(
                    unit = %name,
                    "dropout unit already converted by another engine; masks will not follow this one"
                );
            }
            already += 1;
            continue;
        }
        let Some(drop_prob) = unit.drop_prob() else {
            return Err(SelectionError::configuration(format!(
                "dropout unit `{name}` has no usable drop probability"
            )));
        };
        *unit = DropoutUnit::ConsistentMc(ConsistentMcDropout::new(drop_prob, Arc::clone(session)));
        converted += 1;
    }

    if converted + already == 0 {
        return Err(SelectionError::configuration(
            "scorer exposes no dropout units to convert",
        ));
    }
    Ok(converted)
}
