pub mod acquisition;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod types;

pub use acquisition::bald::{bald_scores, expected_conditional_entropy, predictive_entropy};
pub use acquisition::ragged::ScoreTensor;
pub use acquisition::sampling::{power_bald_batch, random_batch};
pub use config::{AcquisitionStrategy, ActiveLearningParams, SelectorConfig};
pub use error::SelectionError;
pub use model::dropout::{ConsistentMcDropout, DropoutUnit, McSession};
pub use model::tokenization::{HfTokenizer, TokenBatch, TokenRow};
pub use pipeline::builder::CompetenceSelectorBuilder;
pub use pipeline::runtime::CompetenceSelector;
pub use pipeline::stochastic::{BayesianCompetenceModel, StochasticOptions};
pub use pipeline::traits::{CompetenceScorer, ScorerKind, StochasticUnit, TextTokenizer};
pub use types::{
    CandidateBatch, CompetenceItem, CompetenceSet, LabelRequest, Normalization, PaddingMode,
    PoolItem,
};
