//! Gradient propagation from the outputs back to the input and initial state.
//!
//! Layers are visited top-down and every direction walks its timesteps in the
//! opposite order of the forward walk. The workspace mirrors the first half of
//! the reserve space: the gate slots end up holding the pre-activation
//! gradients of z, r and n, and the scratch slots hold the hidden-state
//! gradient of each row and timestep.

use ndarray::Array2;
use tracing::{debug, instrument};

use crate::activations::{sigmoid_derivative, tanh_derivative};
use crate::errors::Result;
use crate::layout::{Direction, Gate, Layout};
use crate::strided::affine;

/// Read-only inputs of a backward-data pass
pub struct BackwardDataInputs<'a> {
    /// Gradient of the loss w.r.t. the output, `batch_n × output_width`
    pub dout: &'a [f32],
    /// Gradient of the loss w.r.t. hy
    pub dhy: &'a [f32],
    pub hx: &'a [f32],
    /// Reserve space written by the forward pass over the same batch
    pub reserve: &'a [f32],
}

/// Caller-owned destinations of a backward-data pass
pub struct BackwardDataBuffers<'a> {
    pub dinput: &'a mut [f32],
    pub dhx: &'a mut [f32],
    /// Gate gradients, later consumed by the backward-weight pass
    pub workspace: &'a mut [f32],
}

/// Computes dinput, dhx and the workspace from the output and final-state
/// gradients. All three destinations are overwritten.
#[instrument(
    skip(layout, weights, inputs, buffers),
    fields(layers = layout.layers(), seq_len = layout.seq_len(), batch_n = layout.batch_n())
)]
pub fn backward_data(
    layout: &Layout,
    weights: &[f32],
    inputs: BackwardDataInputs<'_>,
    buffers: BackwardDataBuffers<'_>,
) -> Result<()> {
    let BackwardDataInputs {
        dout,
        dhy,
        hx,
        reserve,
    } = inputs;
    let BackwardDataBuffers {
        dinput,
        dhx,
        workspace,
    } = buffers;

    layout.check_len("weights", layout.params_len(), weights)?;
    layout.check_len("dout", layout.output_len(), dout)?;
    layout.check_len("dhy", layout.hidden_len(), dhy)?;
    layout.check_len("hx", layout.hidden_len(), hx)?;
    layout.check_len("reserve", layout.reserve_len(), reserve)?;
    layout.check_len("dinput", layout.input_len(), dinput)?;
    layout.check_len("dhx", layout.hidden_len(), dhx)?;
    layout.check_len("workspace", layout.workspace_len(), workspace)?;

    workspace.fill(0.0);
    dinput.fill(0.0);
    dhx.fill(0.0);

    for layer in (0..layout.layers()).rev() {
        seed_layer(layout, layer, weights, dout, workspace)?;

        for dir in layout.directions() {
            for ti in (0..layout.seq_len()).rev() {
                let t = layout.timestep(dir, ti);
                add_recurrent_gradient(layout, layer, dir, t, weights, dhy, reserve, workspace)?;
                gate_gradients(layout, layer, dir, t, weights, hx, reserve, workspace)?;
            }
            initial_state_gradient(layout, layer, dir, weights, reserve, workspace, dhx)?;
        }

        debug!(layer, "backward-data layer complete");
    }

    input_gradient(layout, weights, workspace, dinput)
}

/// Hidden-output gradient arriving from above: dout for the top layer, the
/// gate gradients of the next layer through its inter-layer block otherwise
fn seed_layer(
    layout: &Layout,
    layer: usize,
    weights: &[f32],
    dout: &[f32],
    workspace: &mut [f32],
) -> Result<()> {
    if layer + 1 == layout.layers() {
        let out_w = layout.output_width();
        let first = layout.scratch_col(Direction::Forward);
        for (row, grad) in dout.chunks_exact(out_w).enumerate() {
            let start = layout.cell(layer, row, first);
            for (dst, &g) in workspace[start..start + out_w].iter_mut().zip(grad) {
                *dst += g;
            }
        }
        return Ok(());
    }

    let Some(block) = layout.input_weights(layer + 1) else {
        return Ok(());
    };
    let above = layout.all_gates_view(layer + 1).view(workspace)?.to_owned();
    affine(
        1.0,
        above.view(),
        block.view(weights)?,
        1.0,
        &mut layout.layer_output_view(layer).view_mut(workspace)?,
    )
}

/// Adds the gradient flowing into h_t from the rest of its own walk: dhy at
/// the end of the walk, the next timestep's gate gradients otherwise
#[allow(clippy::too_many_arguments)]
fn add_recurrent_gradient(
    layout: &Layout,
    layer: usize,
    dir: Direction,
    t: usize,
    weights: &[f32],
    dhy: &[f32],
    reserve: &[f32],
    workspace: &mut [f32],
) -> Result<()> {
    let profile = layout.profile();
    let h = layout.hidden();
    let col_h = layout.scratch_col(dir);
    let row = profile.row_offset(t);

    let Some(next) = layout.next_timestep(dir, t) else {
        for bs in 0..profile.count(t) {
            for j in 0..h {
                workspace[layout.cell(layer, row + bs, col_h + j)] +=
                    dhy[layout.hidden_index(layer, dir, bs, j)];
            }
        }
        return Ok(());
    };

    let rows = layout.carried_rows(dir, next);
    let next_row = profile.row_offset(next);
    let dh_t = layout.scratch_view(layer, row, rows, dir);

    // through the z and r projections
    let dzr = layout
        .gates_view(layer, next_row, rows, dir, Gate::Update, 2)
        .view(workspace)?
        .to_owned();
    affine(
        1.0,
        dzr.view(),
        layout
            .hidden_weights(layer, dir, Gate::Update, 2)
            .view(weights)?,
        1.0,
        &mut dh_t.view_mut(workspace)?,
    )?;

    // through the σ(z)·h_prev term, and collect dn·σ(r) for the n projection
    let act = layout.activated_base();
    let col_z = layout.gate_col(dir, Gate::Update);
    let col_r = layout.gate_col(dir, Gate::Reset);
    let col_n = layout.gate_col(dir, Gate::Candidate);
    let mut reset_scaled = Array2::<f32>::zeros((rows, h));
    for bs in 0..rows {
        for j in 0..h {
            let dh_next = workspace[layout.cell(layer, next_row + bs, col_h + j)];
            let z_next = reserve[act + layout.cell(layer, next_row + bs, col_z + j)];
            workspace[layout.cell(layer, row + bs, col_h + j)] += dh_next * z_next;

            let dn_next = workspace[layout.cell(layer, next_row + bs, col_n + j)];
            let r_next = reserve[act + layout.cell(layer, next_row + bs, col_r + j)];
            reset_scaled[[bs, j]] = dn_next * r_next;
        }
    }

    affine(
        1.0,
        reset_scaled.view(),
        layout
            .hidden_weights(layer, dir, Gate::Candidate, 1)
            .view(weights)?,
        1.0,
        &mut dh_t.view_mut(workspace)?,
    )
}

/// Turns the hidden-state gradient of timestep `t` into gate pre-activation
/// gradients
#[allow(clippy::too_many_arguments)]
fn gate_gradients(
    layout: &Layout,
    layer: usize,
    dir: Direction,
    t: usize,
    weights: &[f32],
    hx: &[f32],
    reserve: &[f32],
    workspace: &mut [f32],
) -> Result<()> {
    let profile = layout.profile();
    let h = layout.hidden();
    let row = profile.row_offset(t);
    let prev = layout.prev_timestep(dir, t);
    let carried = layout.carried_rows(dir, t);

    // the r slot first receives W_hn·h_prev; the recurrent n bias takes no part
    // in the reset-gate gradient, and rows without a previous state keep dr = 0
    let h_prev = match prev {
        None => layout.hidden_view(layer, dir, carried).view(hx)?,
        Some(p) => layout
            .scratch_view(layer, profile.row_offset(p), carried, dir)
            .view(reserve)?,
    };
    affine(
        1.0,
        h_prev,
        layout
            .hidden_weights(layer, dir, Gate::Candidate, 1)
            .t()
            .view(weights)?,
        0.0,
        &mut layout
            .gates_view(layer, row, carried, dir, Gate::Reset, 1)
            .view_mut(workspace)?,
    )?;

    let act = layout.activated_base();
    let col_z = layout.gate_col(dir, Gate::Update);
    let col_r = layout.gate_col(dir, Gate::Reset);
    let col_n = layout.gate_col(dir, Gate::Candidate);
    let col_h = layout.scratch_col(dir);

    for bs in 0..profile.count(t) {
        for j in 0..h {
            let z_idx = layout.cell(layer, row + bs, col_z + j);
            let r_idx = layout.cell(layer, row + bs, col_r + j);
            let n_idx = layout.cell(layer, row + bs, col_n + j);
            let dh = workspace[layout.cell(layer, row + bs, col_h + j)];
            let z = reserve[act + z_idx];
            let r = reserve[act + r_idx];
            let n = reserve[act + n_idx];

            let dn = dh * (1.0 - z) * tanh_derivative(n);
            workspace[n_idx] = dn;

            workspace[r_idx] *= dn * sigmoid_derivative(r);

            // rows joining the reverse walk late keep a zero z gradient
            if bs < carried {
                let h_prev = match prev {
                    None => hx[layout.hidden_index(layer, dir, bs, j)],
                    Some(p) => {
                        reserve[layout.cell(layer, profile.row_offset(p) + bs, col_h + j)]
                    }
                };
                workspace[z_idx] += dh * (h_prev - n) * sigmoid_derivative(z);
            }
        }
    }
    Ok(())
}

/// dhx of one direction, taken from the first timestep of its walk
fn initial_state_gradient(
    layout: &Layout,
    layer: usize,
    dir: Direction,
    weights: &[f32],
    reserve: &[f32],
    workspace: &[f32],
    dhx: &mut [f32],
) -> Result<()> {
    let profile = layout.profile();
    let h = layout.hidden();
    let t = layout.timestep(dir, 0);
    let rows = profile.count(t);
    let row = profile.row_offset(t);
    let target = layout.hidden_view(layer, dir, rows);

    affine(
        1.0,
        layout
            .gates_view(layer, row, rows, dir, Gate::Update, 2)
            .view(workspace)?,
        layout
            .hidden_weights(layer, dir, Gate::Update, 2)
            .view(weights)?,
        1.0,
        &mut target.view_mut(dhx)?,
    )?;

    let act = layout.activated_base();
    let col_z = layout.gate_col(dir, Gate::Update);
    let col_r = layout.gate_col(dir, Gate::Reset);
    let col_n = layout.gate_col(dir, Gate::Candidate);
    let col_h = layout.scratch_col(dir);
    let mut reset_scaled = Array2::<f32>::zeros((rows, h));
    for bs in 0..rows {
        for j in 0..h {
            let dh = workspace[layout.cell(layer, row + bs, col_h + j)];
            let z = reserve[act + layout.cell(layer, row + bs, col_z + j)];
            dhx[layout.hidden_index(layer, dir, bs, j)] += dh * z;

            let dn = workspace[layout.cell(layer, row + bs, col_n + j)];
            let r = reserve[act + layout.cell(layer, row + bs, col_r + j)];
            reset_scaled[[bs, j]] = dn * r;
        }
    }

    affine(
        1.0,
        reset_scaled.view(),
        layout
            .hidden_weights(layer, dir, Gate::Candidate, 1)
            .view(weights)?,
        1.0,
        &mut target.view_mut(dhx)?,
    )
}

fn input_gradient(
    layout: &Layout,
    weights: &[f32],
    workspace: &[f32],
    dinput: &mut [f32],
) -> Result<()> {
    match layout.input_weights(0) {
        Some(block) => affine(
            1.0,
            layout.all_gates_view(0).view(workspace)?,
            block.view(weights)?,
            1.0,
            &mut layout.input_view().view_mut(dinput)?,
        ),
        None => {
            // SKIP: the input reached every gate of every direction unchanged
            let h = layout.hidden();
            let stride = layout.input_stride();
            for row in 0..layout.batch_n() {
                for gate in Gate::ALL {
                    for dir in layout.directions() {
                        let start = layout.cell(0, row, layout.gate_col(dir, gate));
                        for j in 0..h {
                            dinput[row * stride + j] += workspace[start + j];
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;
    use crate::case::ReferenceCase;
    use crate::config::GruConfig;
    use crate::engine::GruReference;
    use crate::profile::BatchProfile;

    #[test]
    fn test_reset_gradient_uses_hidden_projection_only() {
        let config = GruConfig::new(1, 1, 1).with_bias(true);
        let gru = GruReference::new(config, &BatchProfile::uniform(1, 1).unwrap()).unwrap();
        let layout = gru.layout();

        let mut weights = vec![0.1; gru.params_len()];
        let w_hn = layout.hidden_weights(0, Direction::Forward, Gate::Candidate, 1);
        weights[w_hn.offset] = 0.6;
        let rb = layout.recurrent_bias(0).unwrap();
        weights[layout.bias_index(rb, Direction::Forward, Gate::Candidate, 0)] = 2.0;

        let hx = [0.5];
        let fwd = gru.forward(&weights, &[1.0], &hx).unwrap();
        let bwd = gru
            .backward_data(&weights, &[1.0], &[0.0], &hx, &fwd.reserve)
            .unwrap();

        let act = layout.activated_base();
        let (z, r, n) = (fwd.reserve[act], fwd.reserve[act + 1], fwd.reserve[act + 2]);
        let dn = (1.0 - z) * (1.0 - n * n);
        let r_slot = layout.cell(0, 0, layout.gate_col(Direction::Forward, Gate::Reset));

        assert_abs_diff_eq!(bwd.workspace[r_slot], 0.6 * 0.5 * dn * r * (1.0 - r), epsilon = 1e-7);
        let with_bias = (0.6 * 0.5 + 2.0) * dn * r * (1.0 - r);
        assert!((bwd.workspace[r_slot] - with_bias).abs() > 1e-3);
    }

    #[test]
    fn test_late_reverse_rows_have_zero_update_and_reset_gradients() {
        let config = GruConfig::new(2, 1, 2).bidirectional().with_bias(true);
        let profile = BatchProfile::new(vec![3, 2, 1]).unwrap();
        let case =
            ReferenceCase::random(config, profile.clone(), &mut StdRng::seed_from_u64(17)).unwrap();
        let gru = case.engine().unwrap();
        let layout = gru.layout();
        let fwd = gru.forward(&case.weights, &case.input, &case.hx).unwrap();
        let bwd = gru
            .backward_data(&case.weights, &case.dout, &case.dhy, &case.hx, &fwd.reserve)
            .unwrap();

        let col_z = layout.gate_col(Direction::Reverse, Gate::Update);
        let col_r = layout.gate_col(Direction::Reverse, Gate::Reset);
        let mut carried_nonzero = false;
        for t in 0..profile.seq_len() - 1 {
            for bs in 0..profile.count(t) {
                let row = profile.row_offset(t) + bs;
                for j in 0..layout.hidden() {
                    let dz = bwd.workspace[layout.cell(0, row, col_z + j)];
                    let dr = bwd.workspace[layout.cell(0, row, col_r + j)];
                    if bs >= profile.count(t + 1) {
                        assert_eq!(dz, 0.0, "t={} bs={} j={}", t, bs, j);
                        assert_eq!(dr, 0.0, "t={} bs={} j={}", t, bs, j);
                    } else {
                        carried_nonzero |= dz != 0.0;
                    }
                }
            }
        }
        assert!(carried_nonzero);
    }
}
