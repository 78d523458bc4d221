use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::EncoderModelConfig;
use crate::model::embeddings::Embeddings;
use crate::model::encoder::Encoder;
use crate::model::layers::extended_attention_mask;
use crate::model::tokenization::TokenBatch;
use crate::pipeline::traits::StochasticUnit;

/// BERT-style text encoder: embeddings followed by the transformer stack.
#[derive(Clone)]
pub(crate) struct TextEncoder {
    embeddings: Embeddings,
    encoder: Encoder,
}

impl TextEncoder {
    pub(crate) fn load(cfg: &EncoderModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            embeddings: Embeddings::load(cfg, vb.pp("embeddings"))?,
            encoder: Encoder::load(cfg, vb.pp("encoder"))?,
        })
    }

    /// Returns `(hidden_states, attention_mask)` with shapes
    /// `(batch, seq, hidden)` and `(batch, seq)`.
    pub(crate) fn forward(
        &self,
        batch: &TokenBatch,
        device: &Device,
    ) -> candle_core::Result<(Tensor, Tensor)> {
        let (input_ids, type_ids, attention_mask) = batch.tensors(device)?;
        let h = self.embeddings.forward(&input_ids, &type_ids)?;
        let h = self
            .encoder
            .forward(&h, &extended_attention_mask(&attention_mask)?)?;
        Ok((h, attention_mask))
    }

    pub(crate) fn collect_units<'a>(&'a mut self, prefix: &str, units: &mut Vec<StochasticUnit<'a>>) {
        self.embeddings
            .collect_units(&scoped(prefix, "embeddings"), units);
        self.encoder.collect_units(&scoped(prefix, "encoder"), units);
    }
}

fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}
