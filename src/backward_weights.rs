//! Weight-gradient accumulation from the workspace of a backward-data pass.
//!
//! Gradients are added to `dweights`, never assigned, so several batches can
//! be accumulated into the same buffer. On return the n slots of the
//! workspace hold `dn·σ(r)`, the gradient seen by the hidden n block.

use tracing::{debug, instrument};

use crate::errors::Result;
use crate::layout::{Direction, Gate, Layout};
use crate::strided::affine;

#[instrument(
    skip(layout, input, hx, reserve, workspace, dweights),
    fields(layers = layout.layers(), seq_len = layout.seq_len(), batch_n = layout.batch_n())
)]
pub fn backward_weights(
    layout: &Layout,
    input: &[f32],
    hx: &[f32],
    reserve: &[f32],
    workspace: &mut [f32],
    dweights: &mut [f32],
) -> Result<()> {
    layout.check_len("input", layout.input_len(), input)?;
    layout.check_len("hx", layout.hidden_len(), hx)?;
    layout.check_len("reserve", layout.reserve_len(), reserve)?;
    layout.check_len("workspace", layout.workspace_len(), workspace)?;
    layout.check_len("dweights", layout.params_len(), dweights)?;

    for layer in 0..layout.layers() {
        input_block_gradient(layout, layer, input, reserve, workspace, dweights)?;

        for dir in layout.directions() {
            for ti in 0..layout.seq_len() {
                let t = layout.timestep(dir, ti);
                scale_candidate_by_reset(layout, layer, dir, t, reserve, workspace);
                hidden_block_gradient(layout, layer, dir, t, hx, reserve, workspace, dweights)?;
            }
        }

        if let Some(rb) = layout.recurrent_bias(layer) {
            sum_rows_into(layout, layer, workspace, &mut dweights[rb..rb + layout.wei_stride()]);
        }

        debug!(layer, "backward-weights layer complete");
    }
    Ok(())
}

/// Input (or inter-layer) block and input bias of one layer, from the raw
/// gate gradients
fn input_block_gradient(
    layout: &Layout,
    layer: usize,
    input: &[f32],
    reserve: &[f32],
    workspace: &[f32],
    dweights: &mut [f32],
) -> Result<()> {
    if let Some(block) = layout.input_weights(layer) {
        let layer_input = if layer == 0 {
            layout.input_view().view(input)?
        } else {
            layout.layer_output_view(layer - 1).view(reserve)?
        };
        affine(
            1.0,
            layout.all_gates_view(layer).t().view(workspace)?,
            layer_input,
            1.0,
            &mut block.view_mut(dweights)?,
        )?;
    }

    if let Some(ib) = layout.input_bias(layer) {
        sum_rows_into(layout, layer, workspace, &mut dweights[ib..ib + layout.wei_stride()]);
    }
    Ok(())
}

/// `dn ← dn·σ(r)` for the rows of timestep `t`
fn scale_candidate_by_reset(
    layout: &Layout,
    layer: usize,
    dir: Direction,
    t: usize,
    reserve: &[f32],
    workspace: &mut [f32],
) {
    let profile = layout.profile();
    let act = layout.activated_base();
    let col_r = layout.gate_col(dir, Gate::Reset);
    let col_n = layout.gate_col(dir, Gate::Candidate);
    for bs in 0..profile.count(t) {
        let row = profile.row_offset(t) + bs;
        for j in 0..layout.hidden() {
            let r = reserve[act + layout.cell(layer, row, col_r + j)];
            workspace[layout.cell(layer, row, col_n + j)] *= r;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn hidden_block_gradient(
    layout: &Layout,
    layer: usize,
    dir: Direction,
    t: usize,
    hx: &[f32],
    reserve: &[f32],
    workspace: &[f32],
    dweights: &mut [f32],
) -> Result<()> {
    let profile = layout.profile();
    let rows = layout.carried_rows(dir, t);
    let h_prev = match layout.prev_timestep(dir, t) {
        None => layout.hidden_view(layer, dir, rows).view(hx)?,
        Some(p) => layout
            .scratch_view(layer, profile.row_offset(p), rows, dir)
            .view(reserve)?,
    };
    affine(
        1.0,
        layout
            .gates_view(layer, profile.row_offset(t), rows, dir, Gate::Update, 3)
            .t()
            .view(workspace)?,
        h_prev,
        1.0,
        &mut layout
            .hidden_weights(layer, dir, Gate::Update, 3)
            .view_mut(dweights)?,
    )
}

/// Adds the column sums of a layer's gate gradients over every packed row
fn sum_rows_into(layout: &Layout, layer: usize, workspace: &[f32], bias: &mut [f32]) {
    for row in 0..layout.batch_n() {
        let start = layout.cell(layer, row, 0);
        for (b, &g) in bias.iter_mut().zip(&workspace[start..start + layout.wei_stride()]) {
            *b += g;
        }
    }
}
