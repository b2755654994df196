//! Randomly generated end-to-end cases for checking an accelerated
//! implementation against the reference passes.

use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::compare::{Tolerance, verify};
use crate::config::GruConfig;
use crate::engine::GruReference;
use crate::errors::{GruError, Result};
use crate::profile::BatchProfile;

/// Inputs of one forward/backward run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCase {
    pub config: GruConfig,
    pub profile: BatchProfile,
    pub weights: Vec<f32>,
    pub input: Vec<f32>,
    pub hx: Vec<f32>,
    pub dout: Vec<f32>,
    pub dhy: Vec<f32>,
}

/// Results of [`ReferenceCase::run`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseOutputs {
    pub output: Vec<f32>,
    pub hy: Vec<f32>,
    pub dinput: Vec<f32>,
    pub dhx: Vec<f32>,
    pub dweights: Vec<f32>,
}

impl CaseOutputs {
    /// Checks every buffer against `expected`, returning the largest error
    pub fn verify_against(&self, expected: &CaseOutputs, tolerance: Tolerance) -> Result<f64> {
        let pairs = [
            ("output", &expected.output, &self.output),
            ("hy", &expected.hy, &self.hy),
            ("dinput", &expected.dinput, &self.dinput),
            ("dhx", &expected.dhx, &self.dhx),
            ("dweights", &expected.dweights, &self.dweights),
        ];
        let mut worst = 0.0_f64;
        for (name, expected, actual) in pairs {
            worst = worst.max(verify(name, expected, actual, tolerance)?);
        }
        Ok(worst)
    }
}

fn draw<R: Rng + ?Sized>(rng: &mut R, len: usize, signed: bool) -> Result<Vec<f32>> {
    let steps = Uniform::new(0u32, 100).map_err(|e| GruError::InvalidConfig {
        message: e.to_string(),
    })?;
    Ok((0..len)
        .map(|_| {
            let magnitude = 0.001 * steps.sample(rng) as f32;
            if signed && rng.random_bool(0.5) {
                -magnitude
            } else {
                magnitude
            }
        })
        .collect())
}

impl ReferenceCase {
    /// Fills every buffer with multiples of 0.001 below 0.1; weights also
    /// take a random sign.
    pub fn random<R: Rng + ?Sized>(
        config: GruConfig,
        profile: BatchProfile,
        rng: &mut R,
    ) -> Result<Self> {
        let gru = GruReference::new(config.clone(), &profile)?;
        Ok(Self {
            weights: draw(rng, gru.params_len(), true)?,
            input: draw(rng, gru.input_len(), false)?,
            hx: draw(rng, gru.hidden_len(), false)?,
            dout: draw(rng, gru.output_len(), false)?,
            dhy: draw(rng, gru.hidden_len(), false)?,
            config,
            profile,
        })
    }

    pub fn engine(&self) -> Result<GruReference> {
        GruReference::new(self.config.clone(), &self.profile)
    }

    /// Forward (training), backward-data and backward-weights in sequence,
    /// each consuming the previous pass's cache
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<CaseOutputs> {
        let gru = self.engine()?;
        let fwd = gru.forward(&self.weights, &self.input, &self.hx)?;
        let mut bwd =
            gru.backward_data(&self.weights, &self.dout, &self.dhy, &self.hx, &fwd.reserve)?;
        let mut dweights = vec![0.0; gru.params_len()];
        gru.backward_weights(
            &self.input,
            &self.hx,
            &fwd.reserve,
            &mut bwd.workspace,
            &mut dweights,
        )?;

        info!(
            batch_n = self.profile.total(),
            params = dweights.len(),
            "reference case complete"
        );

        Ok(CaseOutputs {
            output: fwd.output,
            hy: fwd.hy,
            dinput: bwd.dinput,
            dhx: bwd.dhx,
            dweights,
        })
    }
}
