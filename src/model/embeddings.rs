use candle_core::{Module, Tensor};
use candle_nn::{Embedding, VarBuilder};

use crate::config::EncoderModelConfig;
use crate::model::dropout::DropoutUnit;
use crate::model::layers::{layer_norm, LayerNorm};
use crate::pipeline::traits::StochasticUnit;

#[derive(Clone)]
pub(crate) struct Embeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    layer_norm: LayerNorm,
    dropout: DropoutUnit,
}

impl Embeddings {
    pub(crate) fn load(cfg: &EncoderModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            word_embeddings: candle_nn::embedding(
                cfg.vocab_size,
                cfg.hidden_size,
                vb.pp("word_embeddings"),
            )?,
            position_embeddings: candle_nn::embedding(
                cfg.max_position_embeddings,
                cfg.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type_embeddings: candle_nn::embedding(
                cfg.type_vocab_size,
                cfg.hidden_size,
                vb.pp("token_type_embeddings"),
            )?,
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
            dropout: DropoutUnit::new(cfg.hidden_dropout_prob),
        })
    }

    /// `(batch, seq)` token and type ids to `(batch, seq, hidden)` embeddings.
    pub(crate) fn forward(&self, input_ids: &Tensor, type_ids: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq_len) = input_ids.dims2()?;
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?
            .unsqueeze(0)?
            .broadcast_as((batch, seq_len))?
            .contiguous()?;

        let words = self.word_embeddings.forward(input_ids)?;
        let positions = self.position_embeddings.forward(&position_ids)?;
        let types = self.token_type_embeddings.forward(type_ids)?;

        let summed = ((words + positions)? + types)?;
        self.dropout.forward(&self.layer_norm.forward(&summed)?)
    }

    pub(crate) fn collect_units<'a>(&'a mut self, prefix: &str, units: &mut Vec<StochasticUnit<'a>>) {
        units.push(StochasticUnit::new(format!("{prefix}.dropout"), &mut self.dropout));
    }
}
