use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::SelectionError;
use crate::types::Normalization;

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub model_path: String,
    pub config_path: String,
    pub tokenizer_path: String,
    pub device: String,
    /// Token length used when the stochastic engine requests fixed-length padding.
    pub max_seq_len: usize,
    pub normalization: Normalization,
    /// Lower bound for every valid candidate probability before logarithms are taken.
    pub probability_floor: f64,
    pub seed: Option<u64>,
    pub active_learning: ActiveLearningParams,
}

impl SelectorConfig {
    pub const DEFAULT_MAX_SEQ_LEN: usize = 128;
    pub const DEFAULT_PROBABILITY_FLOOR: f64 = 1e-100;

    /// Point the model, config and tokenizer paths at the usual files inside `dir`.
    pub fn from_model_dir(dir: &Path) -> Self {
        let path = |name: &str| dir.join(name).to_string_lossy().to_string();
        Self {
            model_path: path("model.safetensors"),
            config_path: path("config.json"),
            tokenizer_path: path("tokenizer.json"),
            ..Self::default()
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            config_path: String::new(),
            tokenizer_path: String::new(),
            device: "cpu".to_string(),
            max_seq_len: Self::DEFAULT_MAX_SEQ_LEN,
            normalization: Normalization::L1,
            probability_floor: Self::DEFAULT_PROBABILITY_FLOOR,
            seed: None,
            active_learning: ActiveLearningParams::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionStrategy {
    #[default]
    PowerBald,
    Random,
}

/// Active-learning knobs, readable from `param_config.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveLearningParams {
    #[serde(alias = "al_batch_size", default = "default_batch_size")]
    pub batch_size: usize,
    /// Number of stochastic forward passes `k`.
    #[serde(alias = "al_bayesian_samples", default = "default_bayesian_samples")]
    pub bayesian_samples: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Score the pool in sub-batches of this many transcripts.
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub strategy: AcquisitionStrategy,
}

fn default_batch_size() -> usize {
    8
}
fn default_bayesian_samples() -> usize {
    10
}
fn default_alpha() -> f64 {
    5.0
}

impl Default for ActiveLearningParams {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            bayesian_samples: default_bayesian_samples(),
            alpha: default_alpha(),
            chunk_size: None,
            strategy: AcquisitionStrategy::PowerBald,
        }
    }
}

impl ActiveLearningParams {
    pub fn load(path: &Path) -> Result<Self, SelectionError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| SelectionError::io("read param_config.json", e))?;
        serde_json::from_str(&data).map_err(|e| SelectionError::json("parse param_config.json", e))
    }

    pub(crate) fn validate(&self) -> Result<(), SelectionError> {
        if self.bayesian_samples == 0 {
            return Err(SelectionError::configuration(
                "bayesian_samples must be at least 1",
            ));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(SelectionError::configuration(format!(
                "alpha must be a finite non-negative number, got {}",
                self.alpha
            )));
        }
        if self.chunk_size == Some(0) {
            return Err(SelectionError::configuration("chunk_size must be at least 1"));
        }
        Ok(())
    }
}

/// Transformer architecture, read from a HuggingFace BERT-style `config.json`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct EncoderModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_dropout")]
    pub hidden_dropout_prob: f64,
    #[serde(default = "default_dropout")]
    pub attention_probs_dropout_prob: f64,
    /// Cross-encoder classifier dropout; falls back to `hidden_dropout_prob`.
    #[serde(default)]
    pub classifier_dropout: Option<f64>,
    #[serde(default = "default_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_num_labels")]
    pub num_labels: usize,
}

fn default_type_vocab_size() -> usize {
    2
}
fn default_dropout() -> f64 {
    0.1
}
fn default_eps() -> f64 {
    1e-12
}
fn default_num_labels() -> usize {
    2
}

impl EncoderModelConfig {
    pub(crate) fn load(path: &Path) -> Result<Self, SelectionError> {
        let data =
            std::fs::read_to_string(path).map_err(|e| SelectionError::io("read config.json", e))?;
        serde_json::from_str(&data).map_err(|e| SelectionError::json("parse config.json", e))
    }

    pub(crate) fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub(crate) fn classifier_dropout_prob(&self) -> f64 {
        self.classifier_dropout.unwrap_or(self.hidden_dropout_prob)
    }

    pub(crate) fn validate(&self) -> Result<(), SelectionError> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(SelectionError::configuration(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TINY_CONFIG_JSON: &str = r#"{
        "vocab_size": 32,
        "hidden_size": 16,
        "num_hidden_layers": 2,
        "num_attention_heads": 4,
        "intermediate_size": 32,
        "max_position_embeddings": 64
    }"#;

    #[test]
    fn selector_config_default() {
        let config = SelectorConfig::default();
        assert!(config.model_path.is_empty());
        assert_eq!(config.device, "cpu");
        assert_eq!(config.max_seq_len, SelectorConfig::DEFAULT_MAX_SEQ_LEN);
        assert_eq!(config.normalization, Normalization::L1);
        assert_eq!(config.probability_floor, 1e-100);
        assert_eq!(config.active_learning.alpha, 5.0);
    }

    #[test]
    fn selector_config_from_model_dir() {
        let config = SelectorConfig::from_model_dir(Path::new("/models/cm"));
        assert_eq!(config.model_path, "/models/cm/model.safetensors");
        assert_eq!(config.config_path, "/models/cm/config.json");
        assert_eq!(config.tokenizer_path, "/models/cm/tokenizer.json");
    }

    #[test]
    fn params_accept_legacy_keys() {
        let json = r#"{"al_batch_size": 4, "al_bayesian_samples": 25}"#;
        let params: ActiveLearningParams = serde_json::from_str(json).expect("valid params");
        assert_eq!(params.batch_size, 4);
        assert_eq!(params.bayesian_samples, 25);
        assert_eq!(params.alpha, 5.0);
        assert_eq!(params.strategy, AcquisitionStrategy::PowerBald);
    }

    #[test]
    fn params_reject_zero_samples_and_negative_alpha() {
        let zero_k = ActiveLearningParams {
            bayesian_samples: 0,
            ..ActiveLearningParams::default()
        };
        assert!(matches!(
            zero_k.validate(),
            Err(SelectionError::Configuration { .. })
        ));
        let negative_alpha = ActiveLearningParams {
            alpha: -1.0,
            ..ActiveLearningParams::default()
        };
        assert!(negative_alpha.validate().is_err());
        assert!(ActiveLearningParams::default().validate().is_ok());
    }

    #[test]
    fn params_load_from_file() {
        let path = std::env::temp_dir().join("competence_bald_param_config.json");
        std::fs::write(&path, r#"{"batch_size": 3, "strategy": "random"}"#).expect("write");
        let params = ActiveLearningParams::load(&path).expect("load params");
        assert_eq!(params.batch_size, 3);
        assert_eq!(params.strategy, AcquisitionStrategy::Random);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn encoder_config_defaults() {
        let cfg: EncoderModelConfig =
            serde_json::from_str(TINY_CONFIG_JSON).expect("valid config json");
        assert_eq!(cfg.type_vocab_size, 2);
        assert_eq!(cfg.head_dim(), 4);
        assert!((cfg.hidden_dropout_prob - 0.1).abs() < 1e-12);
        assert!((cfg.classifier_dropout_prob() - 0.1).abs() < 1e-12);
        assert_eq!(cfg.num_labels, 2);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn encoder_config_rejects_uneven_heads() {
        let mut cfg: EncoderModelConfig =
            serde_json::from_str(TINY_CONFIG_JSON).expect("valid config json");
        cfg.num_attention_heads = 3;
        assert!(cfg.validate().is_err());
    }
}
