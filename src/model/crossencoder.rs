use std::sync::Arc;

use candle_core::{Device, IndexOp, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::EncoderModelConfig;
use crate::error::SelectionError;
use crate::model::dropout::DropoutUnit;
use crate::model::text_encoder::TextEncoder;
use crate::pipeline::traits::{CompetenceScorer, StochasticUnit, TextTokenizer};
use crate::types::PaddingMode;

/// Jointly encodes `(transcript, competence)` and reports the softmax
/// probability of the "match" class (label 1).
#[derive(Clone)]
pub struct CrossEncoder {
    bert: TextEncoder,
    pooler: Linear,
    dropout: DropoutUnit,
    classifier: Linear,
    tokenizer: Arc<dyn TextTokenizer>,
    device: Device,
}

impl CrossEncoder {
    pub(crate) fn load(
        cfg: &EncoderModelConfig,
        tokenizer: Arc<dyn TextTokenizer>,
        vb: VarBuilder,
    ) -> Result<Self, SelectionError> {
        cfg.validate()?;
        if cfg.num_labels < 2 {
            return Err(SelectionError::configuration(format!(
                "cross-encoder needs at least 2 labels, config has {}",
                cfg.num_labels
            )));
        }
        let device = vb.device().clone();
        let build = || -> candle_core::Result<(TextEncoder, Linear, Linear)> {
            let bert = TextEncoder::load(cfg, vb.pp("bert"))?;
            let pooler =
                candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("bert.pooler.dense"))?;
            let classifier =
                candle_nn::linear(cfg.hidden_size, cfg.num_labels, vb.pp("classifier"))?;
            Ok((bert, pooler, classifier))
        };
        let (bert, pooler, classifier) =
            build().map_err(|e| SelectionError::runtime("build cross-encoder", e))?;
        Ok(Self {
            bert,
            pooler,
            dropout: DropoutUnit::new(cfg.classifier_dropout_prob()),
            classifier,
            tokenizer,
            device,
        })
    }

    fn logits(
        &self,
        transcripts: &[&str],
        competences: &[&str],
        padding: PaddingMode,
    ) -> Result<Tensor, SelectionError> {
        let batch = self
            .tokenizer
            .encode_pair_batch(transcripts, competences, padding)?;
        let forward = || -> candle_core::Result<Tensor> {
            let (hidden, _) = self.bert.forward(&batch, &self.device)?;
            let first = hidden.i((.., 0))?.contiguous()?;
            let pooled = self.pooler.forward(&first)?.tanh()?;
            self.classifier.forward(&self.dropout.forward(&pooled)?)
        };
        forward().map_err(|e| SelectionError::runtime("cross-encoder forward", e))
    }
}

impl CompetenceScorer for CrossEncoder {
    fn score(
        &self,
        transcripts: &[&str],
        competences: &[&str],
        padding: PaddingMode,
    ) -> Result<Tensor, SelectionError> {
        let logits = self.logits(transcripts, competences, padding)?;
        candle_nn::ops::softmax(&logits, D::Minus1)
            .and_then(|probs| probs.i((.., 1))?.contiguous())
            .map_err(|e| SelectionError::runtime("cross-encoder softmax", e))
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn stochastic_units(&mut self) -> Vec<StochasticUnit<'_>> {
        let mut units = Vec::new();
        self.bert.collect_units("bert", &mut units);
        units.push(StochasticUnit::new("dropout", &mut self.dropout));
        units
    }

    fn boxed_clone(&self) -> Box<dyn CompetenceScorer> {
        Box::new(self.clone())
    }
}
