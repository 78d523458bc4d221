use std::path::Path;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor};
use tokenizers::{EncodeInput, Encoding, TruncationParams, TruncationStrategy};

use crate::error::SelectionError;
use crate::pipeline::traits::TextTokenizer;
use crate::types::PaddingMode;

/// Token ids of a padded batch, laid out row-major as `(batch_size, seq_len)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    pub input_ids: Vec<u32>,
    pub type_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl TokenBatch {
    /// Pad every row to `target_len`, or to the longest row when no target is
    /// given. Rows are never cut; truncation belongs to the tokenizer.
    pub fn from_rows(rows: Vec<TokenRow>, target_len: Option<usize>, pad_id: u32) -> Self {
        let longest = rows.iter().map(|r| r.ids.len()).max().unwrap_or(0);
        let seq_len = target_len.unwrap_or(0).max(longest).max(1);
        let batch_size = rows.len();

        let mut input_ids = Vec::with_capacity(batch_size * seq_len);
        let mut type_ids = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask = Vec::with_capacity(batch_size * seq_len);
        for row in rows {
            let kept = row.ids.len();
            input_ids.extend_from_slice(&row.ids);
            type_ids.extend_from_slice(&row.type_ids[..kept.min(row.type_ids.len())]);
            type_ids.resize(input_ids.len(), 0);
            attention_mask.extend(std::iter::repeat(1).take(kept));

            let pad = seq_len - kept;
            input_ids.extend(std::iter::repeat(pad_id).take(pad));
            type_ids.extend(std::iter::repeat(0).take(pad));
            attention_mask.extend(std::iter::repeat(0).take(pad));
        }

        Self {
            input_ids,
            type_ids,
            attention_mask,
            batch_size,
            seq_len,
        }
    }

    /// `(input_ids, type_ids, attention_mask)`; the mask is f32 for additive masking.
    pub(crate) fn tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor, Tensor)> {
        let shape = (self.batch_size, self.seq_len);
        let input_ids = Tensor::from_vec(self.input_ids.clone(), shape, device)?;
        let type_ids = Tensor::from_vec(self.type_ids.clone(), shape, device)?;
        let attention_mask =
            Tensor::from_vec(self.attention_mask.clone(), shape, device)?.to_dtype(DType::F32)?;
        Ok((input_ids, type_ids, attention_mask))
    }
}

/// One tokenized sequence before padding.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenRow {
    pub ids: Vec<u32>,
    pub type_ids: Vec<u32>,
}

impl From<&Encoding> for TokenRow {
    fn from(encoding: &Encoding) -> Self {
        Self {
            ids: encoding.get_ids().to_vec(),
            type_ids: encoding.get_type_ids().to_vec(),
        }
    }
}

/// HuggingFace `tokenizer.json` tokenizer with explicit padding control.
///
/// Sequences longer than `max_length` are truncated longest-first, so a pair
/// keeps part of both texts and its special tokens.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    max_length: usize,
    pad_id: u32,
}

impl HfTokenizer {
    pub fn new(mut inner: tokenizers::Tokenizer, max_length: usize) -> Result<Self, SelectionError> {
        let max_length = max_length.max(1);
        let pad_id = ["[PAD]", "<pad>"]
            .iter()
            .find_map(|token| inner.token_to_id(token))
            .unwrap_or(0);
        inner.with_padding(None);
        inner
            .with_truncation(Some(TruncationParams {
                max_length,
                strategy: TruncationStrategy::LongestFirst,
                ..TruncationParams::default()
            }))
            .map_err(|e| SelectionError::runtime("configure tokenizer truncation", e))?;
        Ok(Self {
            inner,
            max_length,
            pad_id,
        })
    }

    pub fn from_file(path: &Path, max_length: usize) -> Result<Self, SelectionError> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| SelectionError::runtime("load tokenizer.json", e))?;
        Self::new(inner, max_length)
    }

    pub fn from_json(json: &str, max_length: usize) -> Result<Self, SelectionError> {
        let inner = tokenizers::Tokenizer::from_str(json)
            .map_err(|e| SelectionError::runtime("parse tokenizer json", e))?;
        Self::new(inner, max_length)
    }

    pub fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn encode_inputs<'s>(
        &self,
        inputs: Vec<EncodeInput<'s>>,
        padding: PaddingMode,
    ) -> Result<TokenBatch, SelectionError> {
        let encodings = self
            .inner
            .encode_batch(inputs, true)
            .map_err(|e| SelectionError::runtime("tokenize batch", e))?;
        let truncated = encodings
            .iter()
            .filter(|e| !e.get_overflowing().is_empty())
            .count();
        if truncated > 0 {
            tracing::debug!(
                truncated,
                max_length = self.max_length,
                "sequences truncated to tokenizer max length"
            );
        }
        let rows: Vec<TokenRow> = encodings.iter().map(TokenRow::from).collect();
        let target = match padding {
            PaddingMode::Longest => None,
            PaddingMode::MaxLength => Some(self.max_length),
        };
        Ok(TokenBatch::from_rows(rows, target, self.pad_id))
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode_batch(&self, texts: &[&str], padding: PaddingMode) -> Result<TokenBatch, SelectionError> {
        let inputs = texts.iter().map(|&t| EncodeInput::from(t)).collect();
        self.encode_inputs(inputs, padding)
    }

    fn encode_pair_batch(
        &self,
        first: &[&str],
        second: &[&str],
        padding: PaddingMode,
    ) -> Result<TokenBatch, SelectionError> {
        if first.len() != second.len() {
            return Err(SelectionError::shape_mismatch(format!(
                "pair batch has {} first sequences but {} second sequences",
                first.len(),
                second.len()
            )));
        }
        let inputs = first
            .iter()
            .zip(second)
            .map(|(&a, &b)| EncodeInput::from((a, b)))
            .collect();
        self.encode_inputs(inputs, padding)
    }
}
