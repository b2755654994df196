use tracing::{info, instrument};

use crate::backward_data::{BackwardDataBuffers, BackwardDataInputs, backward_data};
use crate::backward_weights::backward_weights;
use crate::config::GruConfig;
use crate::errors::Result;
use crate::forward::{ForwardBuffers, forward};
use crate::layout::Layout;
use crate::profile::BatchProfile;

/// Everything a training-mode forward pass produces
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub output: Vec<f32>,
    pub hy: Vec<f32>,
    /// Activation cache for [`GruReference::backward_data`] and
    /// [`GruReference::backward_weights`]
    pub reserve: Vec<f32>,
}

/// Result of an inference pass; no activation cache is kept
#[derive(Debug, Clone)]
pub struct Inference {
    pub output: Vec<f32>,
    pub hy: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct BackwardDataPass {
    pub dinput: Vec<f32>,
    pub dhx: Vec<f32>,
    /// Gate gradients; [`GruReference::backward_weights`] consumes and rewrites them
    pub workspace: Vec<f32>,
}

/// A GRU stack bound to one batch profile, allocating its own result buffers.
///
/// The flat-buffer engines in [`forward`](crate::forward),
/// [`backward_data`](crate::backward_data) and
/// [`backward_weights`](crate::backward_weights) remain available for callers
/// that manage their own memory.
#[derive(Debug, Clone)]
pub struct GruReference {
    config: GruConfig,
    layout: Layout,
}

impl GruReference {
    pub fn new(config: GruConfig, profile: &BatchProfile) -> Result<Self> {
        let layout = Layout::new(&config, profile)?;
        info!(
            hidden_size = config.hidden_size,
            num_layers = config.num_layers,
            bidirectional = config.direction.is_bidirectional(),
            biased = config.biased,
            seq_len = profile.seq_len(),
            batch_n = profile.total(),
            params = layout.params_len(),
            "GRU reference initialized"
        );
        Ok(Self { config, layout })
    }

    pub fn config(&self) -> &GruConfig {
        &self.config
    }

    pub fn profile(&self) -> &BatchProfile {
        self.layout.profile()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn params_len(&self) -> usize {
        self.layout.params_len()
    }

    pub fn reserve_len(&self) -> usize {
        self.layout.reserve_len()
    }

    pub fn workspace_len(&self) -> usize {
        self.layout.workspace_len()
    }

    pub fn hidden_len(&self) -> usize {
        self.layout.hidden_len()
    }

    pub fn input_len(&self) -> usize {
        self.layout.input_len()
    }

    pub fn output_len(&self) -> usize {
        self.layout.output_len()
    }

    /// Forward pass that keeps the activation cache for training
    pub fn forward(&self, weights: &[f32], input: &[f32], hx: &[f32]) -> Result<ForwardPass> {
        let mut pass = ForwardPass {
            output: vec![0.0; self.output_len()],
            hy: vec![0.0; self.hidden_len()],
            reserve: vec![0.0; self.reserve_len()],
        };
        forward(
            &self.layout,
            weights,
            input,
            hx,
            ForwardBuffers {
                output: &mut pass.output,
                hy: &mut pass.hy,
                reserve: &mut pass.reserve,
            },
        )?;
        Ok(pass)
    }

    /// Forward pass whose activation cache is dropped on return
    #[instrument(skip(self, weights, input, hx))]
    pub fn infer(&self, weights: &[f32], input: &[f32], hx: &[f32]) -> Result<Inference> {
        let ForwardPass { output, hy, .. } = self.forward(weights, input, hx)?;
        Ok(Inference { output, hy })
    }

    pub fn backward_data(
        &self,
        weights: &[f32],
        dout: &[f32],
        dhy: &[f32],
        hx: &[f32],
        reserve: &[f32],
    ) -> Result<BackwardDataPass> {
        let mut pass = BackwardDataPass {
            dinput: vec![0.0; self.input_len()],
            dhx: vec![0.0; self.hidden_len()],
            workspace: vec![0.0; self.workspace_len()],
        };
        backward_data(
            &self.layout,
            weights,
            BackwardDataInputs {
                dout,
                dhy,
                hx,
                reserve,
            },
            BackwardDataBuffers {
                dinput: &mut pass.dinput,
                dhx: &mut pass.dhx,
                workspace: &mut pass.workspace,
            },
        )?;
        Ok(pass)
    }

    /// Adds this batch's weight gradients to `dweights`
    pub fn backward_weights(
        &self,
        input: &[f32],
        hx: &[f32],
        reserve: &[f32],
        workspace: &mut [f32],
        dweights: &mut [f32],
    ) -> Result<()> {
        backward_weights(&self.layout, input, hx, reserve, workspace, dweights)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_matches_training_forward() {
        let config = GruConfig::new(3, 2, 2).with_bias(true);
        let profile = BatchProfile::new(vec![2, 2, 1]).unwrap();
        let gru = GruReference::new(config, &profile).unwrap();

        let weights: Vec<f32> = (0..gru.params_len()).map(|i| (i % 7) as f32 * 0.01).collect();
        let input: Vec<f32> = (0..gru.input_len()).map(|i| (i % 5) as f32 * 0.1).collect();
        let hx = vec![0.05; gru.hidden_len()];

        let pass = gru.forward(&weights, &input, &hx).unwrap();
        let inference = gru.infer(&weights, &input, &hx).unwrap();
        assert_eq!(pass.output, inference.output);
        assert_eq!(pass.hy, inference.hy);
        assert_eq!(pass.reserve.len(), gru.reserve_len());
    }
}
