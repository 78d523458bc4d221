use candle_core::{Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::config::EncoderModelConfig;
use crate::model::dropout::DropoutUnit;
use crate::model::layers::{layer_norm, LayerNorm};
use crate::pipeline::traits::StochasticUnit;

#[derive(Clone)]
struct SelfAttention {
    q: Linear,
    k: Linear,
    v: Linear,
    probs_dropout: DropoutUnit,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl SelfAttention {
    fn load(cfg: &EncoderModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let hd = cfg.head_dim();
        Ok(Self {
            q: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("query"))?,
            k: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("key"))?,
            v: candle_nn::linear(cfg.hidden_size, cfg.hidden_size, vb.pp("value"))?,
            probs_dropout: DropoutUnit::new(cfg.attention_probs_dropout_prob),
            num_heads: cfg.num_attention_heads,
            head_dim: hd,
            scale: (hd as f64).powf(-0.5),
        })
    }

    fn forward(&self, xs: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, _) = xs.dims3()?;
        let reshape = |x: Tensor| {
            x.reshape((b, t, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };

        let q = reshape((self.q.forward(xs)? * self.scale)?)?;
        let k = reshape(self.k.forward(xs)?)?;
        let v = reshape(self.v.forward(xs)?)?;

        let scores = q
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .broadcast_add(attention_mask)?;
        let attn = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let attn = self.probs_dropout.forward(&attn)?;
        attn.matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, self.num_heads * self.head_dim))
    }
}

/// Dense projection, dropout, then residual LayerNorm.
#[derive(Clone)]
struct ResidualOutput {
    dense: Linear,
    dropout: DropoutUnit,
    layer_norm: LayerNorm,
}

impl ResidualOutput {
    fn load(
        cfg: &EncoderModelConfig,
        in_dim: usize,
        vb: VarBuilder,
    ) -> candle_core::Result<Self> {
        Ok(Self {
            dense: candle_nn::linear(in_dim, cfg.hidden_size, vb.pp("dense"))?,
            dropout: DropoutUnit::new(cfg.hidden_dropout_prob),
            layer_norm: layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, xs: &Tensor, residual: &Tensor) -> candle_core::Result<Tensor> {
        let h = self.dropout.forward(&self.dense.forward(xs)?)?;
        self.layer_norm.forward(&(h + residual)?)
    }
}

#[derive(Clone)]
struct EncoderLayer {
    attn: SelfAttention,
    attn_output: ResidualOutput,
    intermediate: Linear,
    output: ResidualOutput,
}

impl EncoderLayer {
    fn load(cfg: &EncoderModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            attn: SelfAttention::load(cfg, vb.pp("attention.self"))?,
            attn_output: ResidualOutput::load(cfg, cfg.hidden_size, vb.pp("attention.output"))?,
            intermediate: candle_nn::linear(
                cfg.hidden_size,
                cfg.intermediate_size,
                vb.pp("intermediate.dense"),
            )?,
            output: ResidualOutput::load(cfg, cfg.intermediate_size, vb.pp("output"))?,
        })
    }

    fn forward(&self, xs: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        // Post-norm:
        //   h = ln1(x + drop(attn(x)))
        //   y = ln2(h + drop(ff(h)))
        let h = self
            .attn_output
            .forward(&self.attn.forward(xs, attention_mask)?, xs)?;
        let ff = self.intermediate.forward(&h)?.gelu_erf()?;
        self.output.forward(&ff, &h)
    }

    fn collect_units<'a>(&'a mut self, prefix: &str, units: &mut Vec<StochasticUnit<'a>>) {
        units.push(StochasticUnit::new(
            format!("{prefix}.attention.self.dropout"),
            &mut self.attn.probs_dropout,
        ));
        units.push(StochasticUnit::new(
            format!("{prefix}.attention.output.dropout"),
            &mut self.attn_output.dropout,
        ));
        units.push(StochasticUnit::new(
            format!("{prefix}.output.dropout"),
            &mut self.output.dropout,
        ));
    }
}

#[derive(Clone)]
pub(crate) struct Encoder {
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    pub(crate) fn load(cfg: &EncoderModelConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        for i in 0..cfg.num_hidden_layers {
            layers.push(EncoderLayer::load(cfg, vb.pp(format!("layer.{i}")))?);
        }
        Ok(Self { layers })
    }

    pub(crate) fn forward(&self, xs: &Tensor, attention_mask: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = xs.clone();
        for layer in &self.layers {
            h = layer.forward(&h, attention_mask)?;
        }
        Ok(h)
    }

    pub(crate) fn collect_units<'a>(&'a mut self, prefix: &str, units: &mut Vec<StochasticUnit<'a>>) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.collect_units(&format!("{prefix}.layer.{i}"), units);
        }
    }
}
