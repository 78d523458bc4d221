use std::collections::HashMap;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::bald::bald_scores;
use super::sampling::{power_bald_batch, random_batch};
use crate::error::SelectionError;
use crate::model::dropout::DropoutUnit;
use crate::pipeline::stochastic::{BayesianCompetenceModel, StochasticOptions};
use crate::pipeline::traits::{CompetenceScorer, StochasticUnit};
use crate::types::{CompetenceSet, PaddingMode};

/// Returns a fixed probability per (transcript, competence, pass), reading the
/// pass index from the replica position.
#[derive(Clone)]
struct FixedPass {
    table: HashMap<(String, String), Vec<f32>>,
    passes: usize,
    dropout: DropoutUnit,
    device: Device,
}

impl FixedPass {
    fn new(passes: usize, entries: &[(&str, &str, &[f32])]) -> Self {
        let table = entries
            .iter()
            .map(|(t, c, per_pass)| ((t.to_string(), c.to_string()), per_pass.to_vec()))
            .collect();
        Self {
            table,
            passes,
            dropout: DropoutUnit::new(0.1),
            device: Device::Cpu,
        }
    }
}

impl CompetenceScorer for FixedPass {
    fn score(
        &self,
        transcripts: &[&str],
        competences: &[&str],
        _padding: PaddingMode,
    ) -> Result<Tensor, SelectionError> {
        let values: Vec<f32> = transcripts
            .iter()
            .zip(competences)
            .enumerate()
            .map(|(row, (t, c))| {
                self.table[&(t.to_string(), c.to_string())][row % self.passes]
            })
            .collect();
        let n = values.len();
        Tensor::from_vec(values, n, &self.device)
            .map_err(|e| SelectionError::runtime("stub scores", e))
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

fn set(transcript: &str, candidates: &[&str]) -> CompetenceSet {
    CompetenceSet::new(transcript, candidates.iter().map(|c| c.to_string()).collect())
}

fn probs_tensor(items: &[Vec<Vec<f64>>]) -> Tensor {
    let (b, k, c) = (items.len(), items[0].len(), items[0][0].len());
    let flat: Vec<f64> = items.iter().flatten().flatten().copied().collect();
    Tensor::from_vec(flat, (b, k, c), &Device::Cpu).unwrap()
}

#[test]
fn two_items_three_passes_end_to_end() {
    let stub = FixedPass::new(
        3,
        &[
            ("t0", "A", &[0.9, 0.8, 0.85]),
            ("t0", "B", &[0.1, 0.2, 0.15]),
            ("t1", "A", &[0.5, 0.4, 0.45]),
            ("t1", "B", &[0.3, 0.4, 0.35]),
            ("t1", "C", &[0.2, 0.2, 0.2]),
        ],
    );
    let mut engine =
        BayesianCompetenceModel::new(Box::new(stub), StochasticOptions::default()).unwrap();
    let sets = vec![set("t0", &["A", "B"]), set("t1", &["A", "B", "C"])];

    let dist = engine.score_distribution(&sets, 3).unwrap();
    assert_eq!(dist.dims(), (2, 3, 3));
    let values = dist.to_vec3().unwrap();
    for pass in &values[0] {
        assert_eq!(pass[2], 0.0);
    }
    assert!((values[0][1][0] - 0.8).abs() < 1e-6);
    assert!((values[1][2][1] - 0.35).abs() < 1e-6);

    let scores = bald_scores(&dist.log_probs().unwrap()).unwrap();
    // H(mean) - mean(H) worked by hand from the per-pass tables.
    assert!((scores[0] - 0.006_644_259_6).abs() < 1e-7, "{}", scores[0]);
    assert!((scores[1] - 0.004_244_798_9).abs() < 1e-7, "{}", scores[1]);
}

#[test]
fn identical_passes_have_zero_bald() {
    let same = vec![vec![0.3, 0.7]; 4];
    let scores = bald_scores(&probs_tensor(&[same]).log().unwrap()).unwrap();
    assert!(scores[0].abs() < 1e-12);
}

#[test]
fn disagreeing_passes_score_higher() {
    let floor = 1e-100;
    let agree = vec![vec![0.5, 0.5]; 4];
    let disagree = vec![
        vec![1.0, floor],
        vec![floor, 1.0],
        vec![1.0, floor],
        vec![floor, 1.0],
    ];
    let scores = bald_scores(&probs_tensor(&[agree, disagree]).log().unwrap()).unwrap();
    assert!(scores[1] > scores[0]);
    assert!((scores[1] - 2f64.ln()).abs() < 1e-9);
}

#[test]
fn power_bald_never_repeats_an_index() {
    let mut rng = StdRng::seed_from_u64(17);
    for n in 1..12 {
        let scores: Vec<f64> = (0..n).map(|i| 0.05 + 0.1 * i as f64).collect();
        for batch_size in 0..15 {
            for alpha in [0.0, 1.0, 5.0] {
                let batch = power_bald_batch(&scores, batch_size, alpha, &mut rng).unwrap();
                assert_eq!(batch.len(), batch_size.min(n));
                let mut seen = batch.indices.clone();
                seen.sort_unstable();
                seen.dedup();
                assert_eq!(seen.len(), batch.len());
                assert!(seen.iter().all(|&i| i < n));
            }
        }
    }
}

#[test]
fn raising_a_score_raises_its_selection_frequency() {
    let draws = 2000;
    let frequency = |first: f64, seed: u64| {
        let scores = [first, 0.3, 0.25, 0.4];
        let mut rng = StdRng::seed_from_u64(seed);
        (0..draws)
            .filter(|_| power_bald_batch(&scores, 1, 5.0, &mut rng).unwrap().indices[0] == 0)
            .count()
    };
    let low = frequency(0.2, 1);
    let mid = frequency(0.3, 2);
    let high = frequency(0.35, 3);
    assert!(low < mid, "{low} vs {mid}");
    assert!(mid < high, "{mid} vs {high}");
}

#[test]
fn random_sampler_is_uniform() {
    let n = 10;
    let draws = 10_000;
    let mut rng = StdRng::seed_from_u64(2024);
    let mut counts = vec![0usize; n];
    for _ in 0..draws {
        let batch = random_batch(n, 1, &mut rng);
        counts[batch.indices[0]] += 1;
    }
    let expected = draws as f64 / n as f64;
    let chi_square: f64 = counts
        .iter()
        .map(|&c| (c as f64 - expected).powi(2) / expected)
        .sum();
    // 9 degrees of freedom, p = 0.0001.
    assert!(chi_square < 33.7, "chi-square {chi_square} for counts {counts:?}");
}
