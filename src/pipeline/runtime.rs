use rand::rngs::StdRng;
use rand::Rng;

use crate::acquisition::bald::bald_scores;
use crate::acquisition::ragged::assemble_distribution;
use crate::acquisition::sampling::{power_bald_batch, random_batch};
use crate::config::{AcquisitionStrategy, ActiveLearningParams};
use crate::error::SelectionError;
use crate::pipeline::stochastic::{BayesianCompetenceModel, StochasticOptions};
use crate::pipeline::traits::CompetenceScorer;
use crate::types::{CandidateBatch, CompetenceSet, LabelRequest, Normalization, PaddingMode, PoolItem};

/// Deterministic competence scoring plus active-learning selection over one scorer.
pub struct CompetenceSelector {
    scorer: Box<dyn CompetenceScorer>,
    params: ActiveLearningParams,
    normalization: Normalization,
    probability_floor: f64,
    rng: StdRng,
}

pub(crate) struct CompetenceSelectorParts {
    pub scorer: Box<dyn CompetenceScorer>,
    pub params: ActiveLearningParams,
    pub normalization: Normalization,
    pub probability_floor: f64,
    pub rng: StdRng,
}

impl CompetenceSelector {
    pub(crate) fn from_parts(parts: CompetenceSelectorParts) -> Self {
        Self {
            scorer: parts.scorer,
            params: parts.params,
            normalization: parts.normalization,
            probability_floor: parts.probability_floor,
            rng: parts.rng,
        }
    }

    pub fn params(&self) -> &ActiveLearningParams {
        &self.params
    }

    /// Distribution of each set over its own candidates, dropout disabled.
    pub fn predict(&self, sets: &[CompetenceSet]) -> Result<Vec<Vec<f64>>, SelectionError> {
        if let Some(pos) = sets.iter().position(CompetenceSet::is_empty) {
            return Err(SelectionError::configuration(format!(
                "competence set {pos} has no candidates"
            )));
        }
        if sets.is_empty() {
            return Ok(Vec::new());
        }

        let counts: Vec<usize> = sets.iter().map(CompetenceSet::len).collect();
        let (transcripts, competences): (Vec<&str>, Vec<&str>) = sets
            .iter()
            .flat_map(CompetenceSet::items)
            .map(|item| (item.transcript, item.competence))
            .unzip();
        let flat = self
            .scorer
            .score(&transcripts, &competences, PaddingMode::Longest)?
            .unsqueeze(1)
            .map_err(|e| SelectionError::runtime("reshape deterministic scores", e))?;

        let dist = assemble_distribution(
            &flat,
            counts.clone(),
            self.normalization,
            self.probability_floor,
        )?
        .to_vec3()?;
        Ok(dist
            .into_iter()
            .zip(counts)
            .map(|(mut passes, count)| {
                let mut row = passes.swap_remove(0);
                row.truncate(count);
                row
            })
            .collect())
    }

    /// BALD score of every pool item under `bayesian_samples` MC-dropout passes.
    ///
    /// The live scorer is left deterministic: a clone sharing its weights is
    /// wrapped in a fresh stochastic engine for this call.
    pub fn acquisition_scores<Id>(
        &mut self,
        pool: &[PoolItem<Id>],
    ) -> Result<Vec<f64>, SelectionError> {
        let sets: Vec<CompetenceSet> = pool.iter().map(|item| item.set.clone()).collect();
        let k = self.params.bayesian_samples;
        let mut engine = BayesianCompetenceModel::new(
            self.scorer.boxed_clone(),
            StochasticOptions {
                seed: self.rng.gen(),
                normalization: self.normalization,
                probability_floor: self.probability_floor,
            },
        )?;
        let dist = match self.params.chunk_size {
            Some(chunk_size) => engine.score_distribution_chunked(&sets, k, chunk_size)?,
            None => engine.score_distribution(&sets, k)?,
        };
        bald_scores(&dist.log_probs()?)
    }

    /// Choose which pool items to send for labeling next.
    pub fn select_for_labeling<Id: Clone>(
        &mut self,
        pool: &[PoolItem<Id>],
    ) -> Result<LabelRequest<Id>, SelectionError> {
        if pool.is_empty() {
            tracing::info!("unlabeled pool is empty; nothing to select");
            return Ok(LabelRequest::empty());
        }

        let batch: CandidateBatch = match self.params.strategy {
            AcquisitionStrategy::Random => {
                random_batch(pool.len(), self.params.batch_size, &mut self.rng)
            }
            AcquisitionStrategy::PowerBald => {
                let scores = self.acquisition_scores(pool)?;
                power_bald_batch(
                    &scores,
                    self.params.batch_size,
                    self.params.alpha,
                    &mut self.rng,
                )?
            }
        };

        tracing::info!(
            pool = pool.len(),
            selected = batch.len(),
            strategy = ?self.params.strategy,
            "selected items for labeling"
        );
        Ok(LabelRequest::from_batch(&batch, pool))
    }
}
