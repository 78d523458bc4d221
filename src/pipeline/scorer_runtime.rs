use std::sync::Arc;

use candle_core::{DType, Device};
use candle_nn::VarBuilder;

use crate::config::{EncoderModelConfig, SelectorConfig};
use crate::error::SelectionError;
use crate::model::biencoder::BiEncoder;
use crate::model::crossencoder::CrossEncoder;
use crate::pipeline::traits::{CompetenceScorer, ScorerKind, TextTokenizer};

pub(crate) fn build_scorer(
    kind: ScorerKind,
    config: &SelectorConfig,
    model_cfg: &EncoderModelConfig,
    tokenizer: Arc<dyn TextTokenizer>,
) -> Result<Box<dyn CompetenceScorer>, SelectionError> {
    let device = select_device(&config.device)?;

    let model_data =
        std::fs::read(&config.model_path).map_err(|e| SelectionError::io("read safetensors", e))?;
    let vb = VarBuilder::from_buffered_safetensors(model_data, DType::F32, &device)
        .map_err(|e| SelectionError::runtime("load safetensors", e))?;

    let scorer: Box<dyn CompetenceScorer> = match kind {
        ScorerKind::BiEncoder => Box::new(BiEncoder::load(model_cfg, tokenizer, vb)?),
        ScorerKind::CrossEncoder => Box::new(CrossEncoder::load(model_cfg, tokenizer, vb)?),
    };

    tracing::info!(
        ?kind,
        hidden_size = model_cfg.hidden_size,
        layers = model_cfg.num_hidden_layers,
        vocab = model_cfg.vocab_size,
        ?device,
        "competence scorer loaded"
    );
    Ok(scorer)
}

pub(crate) fn select_device(name: &str) -> Result<Device, SelectionError> {
    match name {
        "cuda" => Device::new_cuda(0).map_err(|e| SelectionError::runtime("CUDA init", e)),
        "cpu" | "" => Ok(Device::Cpu),
        other => {
            tracing::warn!(device = other, "unknown device name, falling back to CPU");
            Ok(Device::Cpu)
        }
    }
}
