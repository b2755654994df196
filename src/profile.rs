use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{GruError, Result};

/// Per-timestep active batch counts of a packed batch.
///
/// Sequences are sorted longest first, so the counts never increase and the
/// rows active at timestep `t` are always the first `count(t)` sequences.
/// Trailing timesteps may have no active rows.
/// Rows are packed timestep after timestep: timestep `t` occupies packed rows
/// `row_offset(t)..row_offset(t) + count(t)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct BatchProfile {
    counts: Vec<usize>,
    offsets: Vec<usize>,
}

impl BatchProfile {
    pub fn new(counts: Vec<usize>) -> Result<Self> {
        if counts.is_empty() {
            return Err(GruError::InvalidProfile {
                message: "profile must cover at least one timestep".to_string(),
            });
        }
        if let Some(t) = counts.windows(2).position(|w| w[1] > w[0]) {
            return Err(GruError::InvalidProfile {
                message: format!(
                    "batch count grows from {} to {} at timestep {}",
                    counts[t],
                    counts[t + 1],
                    t + 1
                ),
            });
        }

        let offsets = counts
            .iter()
            .scan(0usize, |acc, &n| {
                let start = *acc;
                *acc += n;
                Some(start)
            })
            .collect();

        Ok(Self { counts, offsets })
    }

    /// Uniform profile: every sequence spans all timesteps
    pub fn uniform(batch: usize, seq_len: usize) -> Result<Self> {
        Self::new(vec![batch; seq_len])
    }

    /// Random non-increasing profile starting at `batch`; each later timestep
    /// keeps between one row and all rows of the previous one.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, batch: usize, seq_len: usize) -> Result<Self> {
        if batch == 0 {
            return Err(GruError::InvalidProfile {
                message: "random profiles need a positive batch size".to_string(),
            });
        }
        let mut counts = Vec::with_capacity(seq_len);
        let mut current = batch;
        for t in 0..seq_len {
            if t > 0 {
                current = rng.random_range(1..=current);
            }
            counts.push(current);
        }
        Self::new(counts)
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn seq_len(&self) -> usize {
        self.counts.len()
    }

    /// Active rows at timestep `t`
    pub fn count(&self, t: usize) -> usize {
        self.counts[t]
    }

    /// First packed row of timestep `t`
    pub fn row_offset(&self, t: usize) -> usize {
        self.offsets[t]
    }

    /// Total packed rows (`batch_n`)
    pub fn total(&self) -> usize {
        self.offsets[self.counts.len() - 1] + self.counts[self.counts.len() - 1]
    }

    /// Rows active at timestep 0, the batch dimension of the hidden-state tensors
    pub fn max_batch(&self) -> usize {
        self.counts[0]
    }

    /// Rows active at the last timestep
    pub fn min_batch(&self) -> usize {
        self.counts[self.counts.len() - 1]
    }
}

impl TryFrom<Vec<usize>> for BatchProfile {
    type Error = GruError;

    fn try_from(counts: Vec<usize>) -> Result<Self> {
        Self::new(counts)
    }
}

impl From<BatchProfile> for Vec<usize> {
    fn from(profile: BatchProfile) -> Self {
        profile.counts
    }
}
