//! Forward propagation over a packed batch.
//!
//! Each layer first adds its input contribution for every packed row at once,
//! then walks the timesteps of each direction. A timestep adds the hidden
//! projection of the previous state and finishes the gates row by row. The
//! reserve space keeps the pre-activations and hidden outputs in its first
//! half and the activated gates in its second half for the backward passes.

use tracing::{debug, instrument};

use crate::activations::sigmoid;
use crate::errors::Result;
use crate::layout::{Direction, Gate, Layout};
use crate::strided::affine;

/// Caller-owned destinations of a forward pass
pub struct ForwardBuffers<'a> {
    /// `batch_n × output_width`
    pub output: &'a mut [f32],
    /// Final hidden state of every row, same shape as hx
    pub hy: &'a mut [f32],
    /// Activation cache consumed by the backward passes
    pub reserve: &'a mut [f32],
}

/// Runs the stack over the packed `input`, starting from `hx`.
///
/// `output`, `hy` and `reserve` are overwritten. Every buffer must have
/// exactly the length reported by the matching [`Layout`] size query.
#[instrument(
    skip(layout, weights, input, hx, buffers),
    fields(layers = layout.layers(), seq_len = layout.seq_len(), batch_n = layout.batch_n())
)]
pub fn forward(
    layout: &Layout,
    weights: &[f32],
    input: &[f32],
    hx: &[f32],
    buffers: ForwardBuffers<'_>,
) -> Result<()> {
    let ForwardBuffers {
        output,
        hy,
        reserve,
    } = buffers;

    layout.check_len("weights", layout.params_len(), weights)?;
    layout.check_len("input", layout.input_len(), input)?;
    layout.check_len("hx", layout.hidden_len(), hx)?;
    layout.check_len("output", layout.output_len(), output)?;
    layout.check_len("hy", layout.hidden_len(), hy)?;
    layout.check_len("reserve", layout.reserve_len(), reserve)?;

    reserve.fill(0.0);
    hy.fill(0.0);

    let profile = layout.profile();
    let h = layout.hidden();

    for layer in 0..layout.layers() {
        add_layer_input(layout, layer, weights, input, reserve)?;

        for dir in layout.directions() {
            for ti in 0..layout.seq_len() {
                let t = layout.timestep(dir, ti);
                let source: &[f32] = if ti == 0 { hx } else { &*hy };
                add_hidden_projection(layout, layer, dir, t, weights, source, reserve)?;
                finish_timestep(layout, layer, dir, t, weights, hx, hy, reserve);
            }
        }

        // rows that ended before the last timestep report no forward final state
        let base = layout.hidden_base(layer, Direction::Forward);
        hy[base + profile.min_batch() * h..base + profile.max_batch() * h].fill(0.0);

        debug!(layer, "forward layer complete");
    }

    let out_w = layout.output_width();
    let top = layout.layers() - 1;
    let first = layout.scratch_col(Direction::Forward);
    for (row, out) in output.chunks_exact_mut(out_w).enumerate() {
        let start = layout.cell(top, row, first);
        out.copy_from_slice(&reserve[start..start + out_w]);
    }

    Ok(())
}

/// Adds the layer's input contribution to the gate pre-activations of every
/// packed row
fn add_layer_input(
    layout: &Layout,
    layer: usize,
    weights: &[f32],
    input: &[f32],
    reserve: &mut [f32],
) -> Result<()> {
    let gates = layout.all_gates_view(layer);
    match layout.input_weights(layer) {
        None => {
            // SKIP: the input row goes straight into z, r and n of each direction
            let h = layout.hidden();
            let stride = layout.input_stride();
            for row in 0..layout.batch_n() {
                let x = &input[row * stride..row * stride + h];
                for dir in layout.directions() {
                    for gate in Gate::ALL {
                        let start = layout.cell(layer, row, layout.gate_col(dir, gate));
                        for (pre, &xj) in reserve[start..start + h].iter_mut().zip(x) {
                            *pre += xj;
                        }
                    }
                }
            }
        }
        Some(block) if layer == 0 => {
            let x = layout.input_view().view(input)?;
            affine(
                1.0,
                x,
                block.t().view(weights)?,
                1.0,
                &mut gates.view_mut(reserve)?,
            )?;
        }
        Some(block) => {
            let below = layout.layer_output_view(layer - 1).view(reserve)?.to_owned();
            affine(
                1.0,
                below.view(),
                block.t().view(weights)?,
                1.0,
                &mut gates.view_mut(reserve)?,
            )?;
        }
    }
    Ok(())
}

/// Projects the previous hidden state of the carried rows through the hidden
/// block: z and r into their pre-activations, n into the scratch slot
fn add_hidden_projection(
    layout: &Layout,
    layer: usize,
    dir: Direction,
    t: usize,
    weights: &[f32],
    source: &[f32],
    reserve: &mut [f32],
) -> Result<()> {
    let rows = layout.carried_rows(dir, t);
    let row = layout.profile().row_offset(t);
    let h_prev = layout.hidden_view(layer, dir, rows).view(source)?;

    let zr = layout.hidden_weights(layer, dir, Gate::Update, 2);
    affine(
        1.0,
        h_prev,
        zr.t().view(weights)?,
        1.0,
        &mut layout
            .gates_view(layer, row, rows, dir, Gate::Update, 2)
            .view_mut(reserve)?,
    )?;

    let n = layout.hidden_weights(layer, dir, Gate::Candidate, 1);
    affine(
        1.0,
        h_prev,
        n.t().view(weights)?,
        1.0,
        &mut layout.scratch_view(layer, row, rows, dir).view_mut(reserve)?,
    )?;
    Ok(())
}

/// Elementwise part of a timestep: biases, gates, new hidden state
#[allow(clippy::too_many_arguments)]
fn finish_timestep(
    layout: &Layout,
    layer: usize,
    dir: Direction,
    t: usize,
    weights: &[f32],
    hx: &[f32],
    hy: &mut [f32],
    reserve: &mut [f32],
) {
    let h = layout.hidden();
    let profile = layout.profile();
    let prev = layout.prev_timestep(dir, t);
    let carried = layout.carried_rows(dir, t);
    let act = layout.activated_base();

    let col_z = layout.gate_col(dir, Gate::Update);
    let col_r = layout.gate_col(dir, Gate::Reset);
    let col_n = layout.gate_col(dir, Gate::Candidate);
    let col_h = layout.scratch_col(dir);
    let input_bias = layout.input_bias(layer);
    let recurrent_bias = layout.recurrent_bias(layer);

    for bs in 0..profile.count(t) {
        let row = profile.row_offset(t) + bs;
        for j in 0..h {
            let z_idx = layout.cell(layer, row, col_z + j);
            let r_idx = layout.cell(layer, row, col_r + j);
            let n_idx = layout.cell(layer, row, col_n + j);
            let h_idx = layout.cell(layer, row, col_h + j);

            if let Some(ib) = input_bias {
                reserve[z_idx] += weights[layout.bias_index(ib, dir, Gate::Update, j)];
                reserve[r_idx] += weights[layout.bias_index(ib, dir, Gate::Reset, j)];
                reserve[n_idx] += weights[layout.bias_index(ib, dir, Gate::Candidate, j)];
            }
            if let Some(rb) = recurrent_bias {
                reserve[z_idx] += weights[layout.bias_index(rb, dir, Gate::Update, j)];
                reserve[r_idx] += weights[layout.bias_index(rb, dir, Gate::Reset, j)];
                reserve[h_idx] += weights[layout.bias_index(rb, dir, Gate::Candidate, j)];
            }

            let r = sigmoid(reserve[r_idx]);
            reserve[n_idx] += r * reserve[h_idx];
            let z = sigmoid(reserve[z_idx]);
            let n = reserve[n_idx].tanh();

            let mut h_t = (1.0 - z) * n;
            if bs < carried {
                let h_prev = match prev {
                    None => hx[layout.hidden_index(layer, dir, bs, j)],
                    Some(p) => {
                        reserve[layout.cell(layer, profile.row_offset(p) + bs, col_h + j)]
                    }
                };
                h_t += z * h_prev;
            }

            reserve[h_idx] = h_t;
            reserve[act + z_idx] = z;
            reserve[act + r_idx] = r;
            reserve[act + n_idx] = n;
            hy[layout.hidden_index(layer, dir, bs, j)] = h_t;
        }
    }
}
