use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::acquisition::ragged::check_probability_floor;
use crate::config::{ActiveLearningParams, EncoderModelConfig, SelectorConfig};
use crate::error::SelectionError;
use crate::model::tokenization::HfTokenizer;
use crate::pipeline::runtime::{CompetenceSelector, CompetenceSelectorParts};
use crate::pipeline::scorer_runtime::build_scorer;
use crate::pipeline::traits::{CompetenceScorer, ScorerKind, TextTokenizer};

pub struct CompetenceSelectorBuilder {
    config: SelectorConfig,
    scorer_kind: ScorerKind,
    scorer: Option<Box<dyn CompetenceScorer>>,
    tokenizer: Option<Arc<dyn TextTokenizer>>,
    params: Option<ActiveLearningParams>,
}

impl CompetenceSelectorBuilder {
    pub fn new(config: SelectorConfig) -> Self {
        Self {
            config,
            scorer_kind: ScorerKind::BiEncoder,
            scorer: None,
            tokenizer: None,
            params: None,
        }
    }

    pub fn with_scorer_kind(mut self, scorer_kind: ScorerKind) -> Self {
        self.scorer_kind = scorer_kind;
        self
    }

    /// Use an already constructed scorer; no model files are read.
    pub fn with_scorer(mut self, scorer: Box<dyn CompetenceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn TextTokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Override `config.active_learning`.
    pub fn with_params(mut self, params: ActiveLearningParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn build(self) -> Result<CompetenceSelector, SelectionError> {
        let params = self
            .params
            .unwrap_or_else(|| self.config.active_learning.clone());
        params.validate()?;
        check_probability_floor(self.config.probability_floor)?;

        let scorer = match self.scorer {
            Some(scorer) => scorer,
            None => {
                let model_cfg = EncoderModelConfig::load(Path::new(&self.config.config_path))?;
                let tokenizer = match self.tokenizer {
                    Some(tokenizer) => tokenizer,
                    None => Arc::new(HfTokenizer::from_file(
                        Path::new(&self.config.tokenizer_path),
                        self.config.max_seq_len.min(model_cfg.max_position_embeddings),
                    )?),
                };
                build_scorer(self.scorer_kind, &self.config, &model_cfg, tokenizer)?
            }
        };

        let rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(CompetenceSelector::from_parts(CompetenceSelectorParts {
            scorer,
            params,
            normalization: self.config.normalization,
            probability_floor: self.config.probability_floor,
            rng,
        }))
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::*;
    use crate::config::tests::TINY_CONFIG_JSON;
    use crate::config::AcquisitionStrategy;
    use crate::model::biencoder::BiEncoder;
    use crate::model::dropout::DropoutUnit;
    use crate::model::tokenization::tests::WhitespaceTokenizer;
    use crate::pipeline::traits::StochasticUnit;
    use crate::types::{CompetenceSet, PaddingMode, PoolItem};

    /// Scores a pair by the length of its competence text.
    #[derive(Clone)]
    struct LengthScorer {
        dropout: DropoutUnit,
        device: Device,
    }

    impl LengthScorer {
        fn boxed() -> Box<dyn CompetenceScorer> {
            Box::new(Self {
                dropout: DropoutUnit::new(0.1),
                device: Device::Cpu,
            })
        }
    }

    impl CompetenceScorer for LengthScorer {
        fn score(
            &self,
            _transcripts: &[&str],
            competences: &[&str],
            _padding: PaddingMode,
        ) -> Result<Tensor, SelectionError> {
            let values: Vec<f32> = competences.iter().map(|c| c.len() as f32).collect();
            let n = values.len();
            Tensor::from_vec(values, n, &self.device)
                .map_err(|e| SelectionError::runtime("length scores", e))
        }

        fn device(&self) -> &Device {
            &self.device
        }

        fn stochastic_units(&mut self) -> Vec<StochasticUnit<'_>> {
            vec![StochasticUnit::new("dropout", &mut self.dropout)]
        }

        fn boxed_clone(&self) -> Box<dyn CompetenceScorer> {
            Box::new(self.clone())
        }
    }

    fn seeded_config() -> SelectorConfig {
        SelectorConfig {
            seed: Some(7),
            ..SelectorConfig::default()
        }
    }

    fn pool(n: usize) -> Vec<PoolItem<u32>> {
        (0..n as u32)
            .map(|id| PoolItem {
                id: 100 + id,
                set: CompetenceSet::new(
                    format!("transcript {id}"),
                    vec!["a1".to_string(), "b2 level".to_string()],
                ),
            })
            .collect()
    }

    #[test]
    fn builder_defaults_to_biencoder() {
        let builder = CompetenceSelectorBuilder::new(SelectorConfig::default());
        assert_eq!(builder.scorer_kind, ScorerKind::BiEncoder);
        assert!(builder.scorer.is_none());
        assert!(builder.params.is_none());
    }

    #[test]
    fn builder_scorer_kind_can_be_overridden() {
        let builder = CompetenceSelectorBuilder::new(SelectorConfig::default())
            .with_scorer_kind(ScorerKind::CrossEncoder);
        assert_eq!(builder.scorer_kind, ScorerKind::CrossEncoder);
    }

    #[test]
    fn build_with_injected_scorer_reads_no_files() {
        let selector = CompetenceSelectorBuilder::new(seeded_config())
            .with_scorer(LengthScorer::boxed())
            .build()
            .expect("build should succeed");
        let dist = selector
            .predict(&[CompetenceSet::new("x", vec!["a".into(), "bbb".into()])])
            .unwrap();
        assert_eq!(dist.len(), 1);
        assert!((dist[0][0] - 0.25).abs() < 1e-9);
        assert!((dist[0][1] - 0.75).abs() < 1e-9);
    }

    #[test]
    fn build_rejects_invalid_params() {
        let params = ActiveLearningParams {
            bayesian_samples: 0,
            ..ActiveLearningParams::default()
        };
        let result = CompetenceSelectorBuilder::new(seeded_config())
            .with_scorer(LengthScorer::boxed())
            .with_params(params)
            .build();
        assert!(matches!(result, Err(SelectionError::Configuration { .. })));
    }

    #[test]
    fn with_params_overrides_config_params() {
        let params = ActiveLearningParams {
            batch_size: 7,
            bayesian_samples: 4,
            ..ActiveLearningParams::default()
        };
        let selector = CompetenceSelectorBuilder::new(seeded_config())
            .with_scorer(LengthScorer::boxed())
            .with_params(params.clone())
            .build()
            .unwrap();
        assert_eq!(selector.params(), &params);

        let defaults = CompetenceSelectorBuilder::new(seeded_config())
            .with_scorer(LengthScorer::boxed())
            .build()
            .unwrap();
        assert_eq!(defaults.params(), &SelectorConfig::default().active_learning);
    }

    #[test]
    fn build_fails_on_invalid_config_path() {
        let config = SelectorConfig {
            config_path: "/nonexistent/config.json".to_string(),
            ..seeded_config()
        };
        let result = CompetenceSelectorBuilder::new(config).build();
        assert!(matches!(result, Err(SelectionError::Io { .. })));
    }

    #[test]
    fn build_loads_model_files_with_injected_tokenizer() {
        let temp_dir = std::env::temp_dir();
        let config_path = temp_dir.join("competence_bald_builder_config.json");
        let model_path = temp_dir.join("competence_bald_builder_model.safetensors");
        std::fs::write(&config_path, TINY_CONFIG_JSON).expect("write config");

        let cfg: EncoderModelConfig = serde_json::from_str(TINY_CONFIG_JSON).unwrap();
        let tokenizer: Arc<dyn TextTokenizer> =
            Arc::new(WhitespaceTokenizer::new(&["hello", "a1", "b2"], 8));
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        BiEncoder::load(&cfg, Arc::clone(&tokenizer), vb).unwrap();
        varmap.save(&model_path).expect("save weights");

        let config = SelectorConfig {
            model_path: model_path.to_string_lossy().to_string(),
            config_path: config_path.to_string_lossy().to_string(),
            tokenizer_path: "/nonexistent/tokenizer.json".to_string(),
            ..seeded_config()
        };
        let selector = CompetenceSelectorBuilder::new(config)
            .with_tokenizer(tokenizer)
            .build()
            .expect("build should succeed");
        let dist = selector
            .predict(&[CompetenceSet::new("hello", vec!["a1".into(), "b2".into()])])
            .unwrap();
        assert!((dist[0].iter().sum::<f64>() - 1.0).abs() < 1e-6);

        let _ = std::fs::remove_file(&config_path);
        let _ = std::fs::remove_file(&model_path);
    }

    #[test]
    fn select_returns_distinct_pool_ids() {
        let mut selector = CompetenceSelectorBuilder::new(seeded_config())
            .with_scorer(LengthScorer::boxed())
            .with_params(ActiveLearningParams {
                batch_size: 3,
                strategy: AcquisitionStrategy::Random,
                ..ActiveLearningParams::default()
            })
            .build()
            .unwrap();
        let pool = pool(5);
        let request = selector.select_for_labeling(&pool).unwrap();
        assert_eq!(request.id.len(), 3);
        assert!(request.scores.is_none());
        let mut ids = request.id.clone();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| (100..105).contains(id)));
    }

    #[test]
    fn select_on_empty_pool_is_empty() {
        let mut selector = CompetenceSelectorBuilder::new(seeded_config())
            .with_scorer(LengthScorer::boxed())
            .build()
            .unwrap();
        let request = selector.select_for_labeling::<u32>(&[]).unwrap();
        assert!(request.id.is_empty());
    }
}
