use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use competence_bald::{
    AcquisitionStrategy, ActiveLearningParams, CompetenceSelector, CompetenceSelectorBuilder,
    Normalization, PoolItem, ScorerKind, SelectorConfig,
};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ScorerChoice {
    #[value(name = "biencoder")]
    BiEncoder,
    #[value(name = "crossencoder")]
    CrossEncoder,
}

impl ScorerChoice {
    fn scorer_kind(self) -> ScorerKind {
        match self {
            Self::BiEncoder => ScorerKind::BiEncoder,
            Self::CrossEncoder => ScorerKind::CrossEncoder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum NormalizationChoice {
    L1,
    Softmax,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StrategyChoice {
    #[value(name = "powerbald")]
    PowerBald,
    Random,
}

#[derive(Debug, Parser)]
#[command(name = "select_to_label")]
#[command(about = "Score competence transcripts and pick the next batch to label")]
struct Args {
    #[arg(long, env = "COMPETENCE_MODEL_DIR", default_value = "models/competence")]
    model_dir: PathBuf,
    #[arg(long, value_enum, default_value = "biencoder")]
    scorer: ScorerChoice,
    #[arg(long, env = "COMPETENCE_DEVICE", default_value = "cpu")]
    device: String,
    #[arg(long, default_value_t = SelectorConfig::DEFAULT_MAX_SEQ_LEN)]
    max_seq_len: usize,
    #[arg(long, value_enum, default_value = "l1")]
    normalization: NormalizationChoice,
    #[arg(long)]
    seed: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print each transcript's distribution over its competence levels.
    Predict {
        /// JSON array of `{ "id", "transcript", "candidates" }` objects.
        #[arg(long)]
        pool: PathBuf,
    },
    /// Print `{ "id": [...], "scores": [...] }` for the items to label next.
    Select(SelectArgs),
}

#[derive(Debug, ClapArgs)]
struct SelectArgs {
    #[arg(long)]
    pool: PathBuf,
    /// `param_config.json` with `al_batch_size` / `al_bayesian_samples`.
    #[arg(long, env = "COMPETENCE_PARAMS")]
    params: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    samples: Option<usize>,
    #[arg(long)]
    alpha: Option<f64>,
    #[arg(long)]
    chunk_size: Option<usize>,
    #[arg(long, value_enum)]
    strategy: Option<StrategyChoice>,
}

impl SelectArgs {
    fn resolve_params(&self) -> Result<ActiveLearningParams, String> {
        let mut params = match &self.params {
            Some(path) => ActiveLearningParams::load(path).map_err(|e| e.to_string())?,
            None => ActiveLearningParams::default(),
        };
        if let Some(batch_size) = self.batch_size {
            params.batch_size = batch_size;
        }
        if let Some(samples) = self.samples {
            params.bayesian_samples = samples;
        }
        if let Some(alpha) = self.alpha {
            params.alpha = alpha;
        }
        if self.chunk_size.is_some() {
            params.chunk_size = self.chunk_size;
        }
        if let Some(strategy) = self.strategy {
            params.strategy = match strategy {
                StrategyChoice::PowerBald => AcquisitionStrategy::PowerBald,
                StrategyChoice::Random => AcquisitionStrategy::Random,
            };
        }
        Ok(params)
    }
}

#[derive(Debug, Serialize)]
struct Prediction<'a> {
    id: &'a Value,
    distribution: Vec<f64>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(message) = run() {
        eprintln!("error: {message}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args = Args::parse();
    require_path_exists(&args.model_dir, "model directory not found")?;

    let mut config = SelectorConfig::from_model_dir(&args.model_dir);
    config.device = args.device.clone();
    config.max_seq_len = args.max_seq_len;
    config.seed = args.seed;
    config.normalization = match args.normalization {
        NormalizationChoice::L1 => Normalization::L1,
        NormalizationChoice::Softmax => Normalization::Softmax,
    };

    match &args.command {
        Command::Predict { pool } => {
            let pool = load_pool(pool)?;
            let selector = build_selector(&args, config, None)?;
            let sets: Vec<_> = pool.iter().map(|item| item.set.clone()).collect();
            let distributions = selector.predict(&sets).map_err(|e| e.to_string())?;
            let predictions: Vec<Prediction<'_>> = pool
                .iter()
                .zip(distributions)
                .map(|(item, distribution)| Prediction {
                    id: &item.id,
                    distribution,
                })
                .collect();
            print_json(&predictions)
        }
        Command::Select(select) => {
            let pool = load_pool(&select.pool)?;
            let params = select.resolve_params()?;
            let mut selector = build_selector(&args, config, Some(params))?;
            let request = selector
                .select_for_labeling(&pool)
                .map_err(|e| e.to_string())?;
            print_json(&request)
        }
    }
}

fn build_selector(
    args: &Args,
    config: SelectorConfig,
    params: Option<ActiveLearningParams>,
) -> Result<CompetenceSelector, String> {
    let mut builder =
        CompetenceSelectorBuilder::new(config).with_scorer_kind(args.scorer.scorer_kind());
    if let Some(params) = params {
        builder = builder.with_params(params);
    }
    builder.build().map_err(|e| e.to_string())
}

fn load_pool(path: &Path) -> Result<Vec<PoolItem<Value>>, String> {
    let data = fs::read_to_string(path)
        .map_err(|e| format!("failed to read pool {}: {e}", path.display()))?;
    serde_json::from_str(&data).map_err(|e| format!("failed to parse pool {}: {e}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{json}");
    Ok(())
}

fn require_path_exists(path: &Path, message: &str) -> Result<(), String> {
    if path.exists() {
        Ok(())
    } else {
        Err(format!("{message}: {}", path.display()))
    }
}
