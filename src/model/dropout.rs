//! Dropout units that a scorer registers as stochastic sub-units.
//!
//! A scorer keeps every dropout position as a [`DropoutUnit`]. In its standard
//! form the unit is the identity at inference time, so the scorer is
//! deterministic. The stochastic engine swaps each registered unit for a
//! [`ConsistentMcDropout`] bound to its [`McSession`]:
//!
//! ```text
//! input (n * k, features..)  pass index p = row % k
//!   → view as (n, k, features..)
//!   → multiply by mask (1, k, features..) / keep_prob
//!   → (n * k, features..)
//! ```
//!
//! One mask is drawn per unit per invocation, so every element evaluated under
//! pass `p` sees the same network realization, while different passes see
//! independent ones.

use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Invocation-scoped mask state shared between one engine and the units it converted.
#[derive(Debug)]
pub struct McSession {
    state: Mutex<SessionState>,
}

#[derive(Debug)]
struct SessionState {
    passes: usize,
    invocation: u64,
    rng: StdRng,
}

impl McSession {
    pub fn new(seed: u64) -> Self {
        Self {
            state: Mutex::new(SessionState {
                passes: 1,
                invocation: 0,
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    /// Start a new forward invocation evaluating `passes` replicas per element.
    /// Masks cached by converted units become stale.
    pub fn begin_invocation(&self, passes: usize) -> u64 {
        let mut state = self.lock();
        state.passes = passes.max(1);
        state.invocation += 1;
        state.invocation
    }

    pub fn passes(&self) -> usize {
        self.lock().passes
    }

    fn current(&self) -> (usize, u64) {
        let state = self.lock();
        (state.passes, state.invocation)
    }

    fn sample_mask(&self, keep_prob: f64, len: usize) -> Vec<f32> {
        let scale = (1.0 / keep_prob) as f32;
        let mut state = self.lock();
        (0..len)
            .map(|_| {
                if state.rng.gen::<f64>() < keep_prob {
                    scale
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone)]
struct CachedMask {
    invocation: u64,
    dims: Vec<usize>,
    mask: Tensor,
}

/// Dropout whose mask is drawn once per invocation and shared by every element of a pass.
#[derive(Debug)]
pub struct ConsistentMcDropout {
    drop_prob: f64,
    session: Arc<McSession>,
    cached: Mutex<Option<CachedMask>>,
}

impl ConsistentMcDropout {
    pub fn new(drop_prob: f64, session: Arc<McSession>) -> Self {
        Self {
            drop_prob,
            session,
            cached: Mutex::new(None),
        }
    }

    pub fn drop_prob(&self) -> f64 {
        self.drop_prob
    }

    pub fn is_bound_to(&self, session: &Arc<McSession>) -> bool {
        Arc::ptr_eq(&self.session, session)
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        if self.drop_prob <= 0.0 {
            return Ok(xs.clone());
        }
        let (passes, invocation) = self.session.current();
        let dims = xs.dims().to_vec();
        let Some((&rows, features)) = dims.split_first() else {
            return Err(candle_core::Error::Msg(
                "consistent MC dropout expects at least one dimension".to_string(),
            ));
        };
        if rows % passes != 0 {
            return Err(candle_core::Error::Msg(format!(
                "consistent MC dropout: {rows} rows are not a multiple of {passes} passes"
            )));
        }

        let mask_dims: Vec<usize> = std::iter::once(passes)
            .chain(features.iter().copied())
            .collect();
        let mask = self.mask_for(invocation, &mask_dims, xs)?;

        let grouped_dims: Vec<usize> = [rows / passes, passes]
            .into_iter()
            .chain(features.iter().copied())
            .collect();
        xs.reshape(grouped_dims)?
            .broadcast_mul(&mask.unsqueeze(0)?)?
            .reshape(dims)
    }

    fn mask_for(
        &self,
        invocation: u64,
        mask_dims: &[usize],
        xs: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let mut cached = self
            .cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(hit) = cached.as_ref() {
            if hit.invocation == invocation && hit.dims == mask_dims {
                return Ok(hit.mask.clone());
            }
        }

        let len = mask_dims.iter().product();
        let values = self.session.sample_mask(1.0 - self.drop_prob, len);
        let mask = Tensor::from_vec(values, mask_dims.to_vec(), xs.device())?;
        let mask = if xs.dtype() == DType::F32 {
            mask
        } else {
            mask.to_dtype(xs.dtype())?
        };
        *cached = Some(CachedMask {
            invocation,
            dims: mask_dims.to_vec(),
            mask: mask.clone(),
        });
        Ok(mask)
    }
}

impl Clone for ConsistentMcDropout {
    fn clone(&self) -> Self {
        Self::new(self.drop_prob, Arc::clone(&self.session))
    }
}

/// A dropout position inside a scorer.
#[derive(Debug, Clone)]
pub enum DropoutUnit {
    /// Regular dropout: identity at inference time.
    Standard { drop_prob: f64 },
    ConsistentMc(ConsistentMcDropout),
}

impl DropoutUnit {
    pub fn new(drop_prob: f64) -> Self {
        Self::Standard { drop_prob }
    }

    /// Drop probability, or `None` when it is not a usable probability in `[0, 1)`.
    pub fn drop_prob(&self) -> Option<f64> {
        let p = match self {
            Self::Standard { drop_prob } => *drop_prob,
            Self::ConsistentMc(unit) => unit.drop_prob(),
        };
        (p.is_finite() && (0.0..1.0).contains(&p)).then_some(p)
    }

    pub fn is_consistent_mc(&self) -> bool {
        matches!(self, Self::ConsistentMc(_))
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Standard { .. } => Ok(xs.clone()),
            Self::ConsistentMc(unit) => unit.forward(xs),
        }
    }
}
