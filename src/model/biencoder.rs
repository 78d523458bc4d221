use std::sync::Arc;

use candle_core::{Device, Tensor, D};
use candle_nn::VarBuilder;

use crate::config::EncoderModelConfig;
use crate::error::SelectionError;
use crate::model::layers::{l2_normalize, masked_mean_pool};
use crate::model::text_encoder::TextEncoder;
use crate::pipeline::traits::{CompetenceScorer, StochasticUnit, TextTokenizer};
use crate::types::PaddingMode;

/// Scores a pair by the cosine similarity of separately pooled embeddings,
/// clamped below at 0.
#[derive(Clone)]
pub struct BiEncoder {
    encoder: TextEncoder,
    tokenizer: Arc<dyn TextTokenizer>,
    device: Device,
}

impl BiEncoder {
    pub(crate) fn load(
        cfg: &EncoderModelConfig,
        tokenizer: Arc<dyn TextTokenizer>,
        vb: VarBuilder,
    ) -> Result<Self, SelectionError> {
        cfg.validate()?;
        let device = vb.device().clone();
        let encoder =
            TextEncoder::load(cfg, vb).map_err(|e| SelectionError::runtime("build bi-encoder", e))?;
        Ok(Self {
            encoder,
            tokenizer,
            device,
        })
    }

    fn embed(&self, texts: &[&str], padding: PaddingMode) -> Result<Tensor, SelectionError> {
        let batch = self.tokenizer.encode_batch(texts, padding)?;
        let (hidden, mask) = self
            .encoder
            .forward(&batch, &self.device)
            .map_err(|e| SelectionError::runtime("bi-encoder forward", e))?;
        masked_mean_pool(&hidden, &mask)
            .and_then(|pooled| l2_normalize(&pooled))
            .map_err(|e| SelectionError::runtime("bi-encoder pooling", e))
    }
}

impl CompetenceScorer for BiEncoder {
    fn score(
        &self,
        transcripts: &[&str],
        competences: &[&str],
        padding: PaddingMode,
    ) -> Result<Tensor, SelectionError> {
        if transcripts.len() != competences.len() {
            return Err(SelectionError::shape_mismatch(format!(
                "{} transcripts but {} competences",
                transcripts.len(),
                competences.len()
            )));
        }
        let embeddings_t = self.embed(transcripts, padding)?;
        let embeddings_c = self.embed(competences, padding)?;
        // Both sides are unit length, so the dot product is the cosine similarity.
        (embeddings_t * embeddings_c)
            .and_then(|prod| prod.sum(D::Minus1))
            .and_then(|cos| cos.clamp(0f32, 1f32))
            .map_err(|e| SelectionError::runtime("bi-encoder similarity", e))
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn stochastic_units(&mut self) -> Vec<StochasticUnit<'_>> {
        let mut units = Vec::new();
        self.encoder.collect_units("", &mut units);
        units
    }

    fn boxed_clone(&self) -> Box<dyn CompetenceScorer> {
        Box::new(self.clone())
    }
}
