use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::SelectionError;
use crate::model::dropout::DropoutUnit;
use crate::model::tokenization::TokenBatch;
use crate::types::PaddingMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScorerKind {
    /// Encodes transcript and competence separately and compares embeddings.
    #[default]
    BiEncoder,
    /// Encodes the (transcript, competence) pair jointly and classifies it.
    CrossEncoder,
}

/// One entry of a scorer's stochastic sub-unit registry.
pub struct StochasticUnit<'a> {
    pub name: String,
    /// Dropout over relative-position embeddings, such as DeBERTa's
    /// `pos_dropout`. Never replaced by the stochastic engine.
    pub positional: bool,
    pub unit: &'a mut DropoutUnit,
}

impl<'a> StochasticUnit<'a> {
    pub fn new(name: impl Into<String>, unit: &'a mut DropoutUnit) -> Self {
        Self {
            name: name.into(),
            positional: false,
            unit,
        }
    }

    pub fn positional(name: impl Into<String>, unit: &'a mut DropoutUnit) -> Self {
        Self {
            name: name.into(),
            positional: true,
            unit,
        }
    }
}

/// Scores transcripts against competence descriptions, one probability per pair.
pub trait CompetenceScorer: Send + Sync {
    /// Element-wise match probability of `transcripts[i]` against `competences[i]`,
    /// as a rank-1 tensor of length `transcripts.len()`.
    fn score(
        &self,
        transcripts: &[&str],
        competences: &[&str],
        padding: PaddingMode,
    ) -> Result<Tensor, SelectionError>;

    fn device(&self) -> &Device;

    /// Every dropout position of the scorer, in a stable order.
    fn stochastic_units(&mut self) -> Vec<StochasticUnit<'_>>;

    /// Independent instance sharing the same weights.
    fn boxed_clone(&self) -> Box<dyn CompetenceScorer>;
}

pub trait TextTokenizer: Send + Sync {
    fn encode_batch(&self, texts: &[&str], padding: PaddingMode) -> Result<TokenBatch, SelectionError>;

    fn encode_pair_batch(
        &self,
        first: &[&str],
        second: &[&str],
        padding: PaddingMode,
    ) -> Result<TokenBatch, SelectionError>;
}
