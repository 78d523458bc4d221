use serde::{Deserialize, Serialize};

/// One scoring unit: a transcript paired with a single competence description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompetenceItem<'a> {
    pub transcript: &'a str,
    pub competence: &'a str,
}

/// A transcript together with the competence-level descriptions it is scored against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompetenceSet {
    pub transcript: String,
    pub candidates: Vec<String>,
    /// Index into `candidates` of the human-assigned level, when labeled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<usize>,
}

impl CompetenceSet {
    pub fn new(transcript: impl Into<String>, candidates: Vec<String>) -> Self {
        Self {
            transcript: transcript.into(),
            candidates,
            label: None,
        }
    }

    pub fn with_label(mut self, label: usize) -> Self {
        self.label = Some(label);
        self
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn items(&self) -> impl Iterator<Item = CompetenceItem<'_>> {
        self.candidates.iter().map(move |competence| CompetenceItem {
            transcript: &self.transcript,
            competence,
        })
    }
}

/// An unlabeled pool entry keyed by a caller-side identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolItem<Id> {
    pub id: Id,
    #[serde(flatten)]
    pub set: CompetenceSet,
}

/// Indices drawn from the pool, in draw order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CandidateBatch {
    pub indices: Vec<usize>,
    /// Selection probability of each drawn index, as computed before any draw.
    pub weights: Option<Vec<f64>>,
}

impl CandidateBatch {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Caller-facing selection result: `{ "id": [...], "scores": [...] }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelRequest<Id> {
    pub id: Vec<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scores: Option<Vec<f64>>,
}

impl<Id: Clone> LabelRequest<Id> {
    pub fn from_batch(batch: &CandidateBatch, pool: &[PoolItem<Id>]) -> Self {
        Self {
            id: batch
                .indices
                .iter()
                .filter_map(|&idx| pool.get(idx).map(|item| item.id.clone()))
                .collect(),
            scores: batch.weights.clone(),
        }
    }
}

impl<Id> LabelRequest<Id> {
    pub fn empty() -> Self {
        Self {
            id: Vec::new(),
            scores: None,
        }
    }
}

/// How the tokenizer pads a batch of sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingMode {
    /// Pad to the longest sequence in the batch.
    Longest,
    /// Pad every sequence to the tokenizer's configured maximum length.
    MaxLength,
}

/// Per-row normalization applied to candidate scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    #[default]
    L1,
    Softmax,
}
