//! Addressing of the flat buffers shared by the three passes.
//!
//! Everything here is pure integer arithmetic over the hyperparameters and the
//! batch profile. The forward, backward-data and backward-weight engines never
//! compute an offset themselves; they ask a [`Layout`] for a
//! [`StridedView`] or a scalar index.
//!
//! Cache row layout (`hy_stride = directions * 4 * H` columns):
//!
//! ```text
//! | z_f r_f n_f | z_r r_r n_r | h_f | h_r |
//!   0   H  2H     3H  4H  5H   D*3H  D*3H+H
//! ```
//!
//! where the `_r` columns and `h_r` exist only for bidirectional stacks.

use crate::config::{GruConfig, InputMode};
use crate::errors::{GruError, Result};
use crate::profile::BatchProfile;
use crate::strided::StridedView;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// z
    Update,
    /// r
    Reset,
    /// n
    Candidate,
}

impl Gate {
    pub const ALL: [Gate; 3] = [Gate::Update, Gate::Reset, Gate::Candidate];

    pub fn index(self) -> usize {
        match self {
            Gate::Update => 0,
            Gate::Reset => 1,
            Gate::Candidate => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    hidden: usize,
    layers: usize,
    dirs: usize,
    biased: bool,
    skip: bool,
    /// Width of the caller's input rows
    input_stride: usize,
    /// Columns of the layer-0 input block (0 in SKIP mode)
    input_width: usize,
    output_width: usize,
    profile: BatchProfile,
}

impl Layout {
    pub fn new(config: &GruConfig, profile: &BatchProfile) -> Result<Self> {
        config.validate()?;
        let skip = config.input_mode == InputMode::Skip;
        Ok(Self {
            hidden: config.hidden_size,
            layers: config.num_layers,
            dirs: config.directions(),
            biased: config.biased,
            skip,
            input_stride: config.input_width,
            input_width: if skip { 0 } else { config.input_width },
            output_width: config.resolved_output_width(),
            profile: profile.clone(),
        })
    }

    pub fn profile(&self) -> &BatchProfile {
        &self.profile
    }

    pub fn hidden(&self) -> usize {
        self.hidden
    }

    pub fn layers(&self) -> usize {
        self.layers
    }

    pub fn is_bidirectional(&self) -> bool {
        self.dirs == 2
    }

    pub fn is_biased(&self) -> bool {
        self.biased
    }

    pub fn is_skip(&self) -> bool {
        self.skip
    }

    pub fn directions(&self) -> impl Iterator<Item = Direction> {
        [Direction::Forward, Direction::Reverse]
            .into_iter()
            .take(self.dirs)
    }

    pub fn input_stride(&self) -> usize {
        self.input_stride
    }

    pub fn output_width(&self) -> usize {
        self.output_width
    }

    pub fn seq_len(&self) -> usize {
        self.profile.seq_len()
    }

    pub fn batch_n(&self) -> usize {
        self.profile.total()
    }

    // ---- walk order ----

    /// Timestep visited at iteration `ti` of a direction's walk
    pub fn timestep(&self, dir: Direction, ti: usize) -> usize {
        match dir {
            Direction::Forward => ti,
            Direction::Reverse => self.seq_len() - 1 - ti,
        }
    }

    /// Timestep whose hidden state feeds `t`; `None` where the walk starts from hx
    pub fn prev_timestep(&self, dir: Direction, t: usize) -> Option<usize> {
        match dir {
            Direction::Forward => t.checked_sub(1),
            Direction::Reverse => (t + 1 < self.seq_len()).then_some(t + 1),
        }
    }

    /// Timestep fed by the hidden state of `t`; `None` at the end of the walk
    pub fn next_timestep(&self, dir: Direction, t: usize) -> Option<usize> {
        match dir {
            Direction::Forward => (t + 1 < self.seq_len()).then_some(t + 1),
            Direction::Reverse => t.checked_sub(1),
        }
    }

    /// Leading rows of timestep `t` that carry a previous hidden state.
    ///
    /// Every active row does in the forward walk. In the reverse walk, rows
    /// that become active after the walk has started have none and begin
    /// from zero.
    pub fn carried_rows(&self, dir: Direction, t: usize) -> usize {
        match self.prev_timestep(dir, t) {
            None => self.profile.count(t),
            Some(prev) => self.profile.count(t).min(self.profile.count(prev)),
        }
    }

    // ---- strides ----

    /// Rows of one weight block: three gates per direction
    pub fn wei_stride(&self) -> usize {
        self.dirs * 3 * self.hidden
    }

    /// Columns of one cache/workspace row
    pub fn hy_stride(&self) -> usize {
        self.dirs * 4 * self.hidden
    }

    /// Width of one layer's concatenated hidden output
    pub fn h_stride(&self) -> usize {
        self.dirs * self.hidden
    }

    // ---- columns within a cache row ----

    pub fn gate_col(&self, dir: Direction, gate: Gate) -> usize {
        dir.index() * 3 * self.hidden + gate.index() * self.hidden
    }

    pub fn scratch_col(&self, dir: Direction) -> usize {
        self.dirs * 3 * self.hidden + dir.index() * self.hidden
    }

    // ---- cache / workspace ----

    pub fn layer_base(&self, layer: usize) -> usize {
        layer * self.batch_n() * self.hy_stride()
    }

    /// Index of `col` in packed row `row` of `layer`
    pub fn cell(&self, layer: usize, row: usize, col: usize) -> usize {
        self.layer_base(layer) + row * self.hy_stride() + col
    }

    /// Offset of the activated half of the reserve space
    pub fn activated_base(&self) -> usize {
        self.workspace_len()
    }

    /// `rows` packed rows starting at `row`, columns `col..col + cols`
    pub fn rows_view(
        &self,
        layer: usize,
        row: usize,
        rows: usize,
        col: usize,
        cols: usize,
    ) -> StridedView {
        StridedView::new(self.cell(layer, row, col), rows, cols, self.hy_stride())
    }

    /// Pre-activation (or gradient) columns of `count` consecutive gates
    pub fn gates_view(
        &self,
        layer: usize,
        row: usize,
        rows: usize,
        dir: Direction,
        first: Gate,
        count: usize,
    ) -> StridedView {
        self.rows_view(layer, row, rows, self.gate_col(dir, first), count * self.hidden)
    }

    /// Hidden-output (scratch) column of one direction
    pub fn scratch_view(
        &self,
        layer: usize,
        row: usize,
        rows: usize,
        dir: Direction,
    ) -> StridedView {
        self.rows_view(layer, row, rows, self.scratch_col(dir), self.hidden)
    }

    /// Gate columns of every direction over all packed rows of a layer
    pub fn all_gates_view(&self, layer: usize) -> StridedView {
        self.rows_view(layer, 0, self.batch_n(), 0, self.wei_stride())
    }

    /// Concatenated hidden output of a layer over all packed rows
    pub fn layer_output_view(&self, layer: usize) -> StridedView {
        self.rows_view(
            layer,
            0,
            self.batch_n(),
            self.scratch_col(Direction::Forward),
            self.h_stride(),
        )
    }

    // ---- weight blob ----

    /// Columns of the input block of `layer`
    pub fn layer_input_width(&self, layer: usize) -> usize {
        if layer == 0 {
            self.input_width
        } else {
            self.h_stride()
        }
    }

    fn layer_weight_base(&self, layer: usize) -> usize {
        if layer == 0 {
            0
        } else {
            (self.input_width + self.hidden + (layer - 1) * (self.h_stride() + self.hidden))
                * self.wei_stride()
        }
    }

    /// Input (or inter-layer) block, stored `wei_stride × layer_input_width`.
    /// `None` for layer 0 in SKIP mode.
    pub fn input_weights(&self, layer: usize) -> Option<StridedView> {
        let width = self.layer_input_width(layer);
        if width == 0 {
            return None;
        }
        Some(StridedView::contiguous(
            self.layer_weight_base(layer),
            self.wei_stride(),
            width,
        ))
    }

    /// `count` consecutive gate rows of the hidden block of one direction,
    /// stored `(count * H) × H`
    pub fn hidden_weights(
        &self,
        layer: usize,
        dir: Direction,
        first: Gate,
        count: usize,
    ) -> StridedView {
        let base = self.layer_weight_base(layer)
            + self.layer_input_width(layer) * self.wei_stride()
            + (dir.index() * 3 + first.index()) * self.hidden * self.hidden;
        StridedView::contiguous(base, count * self.hidden, self.hidden)
    }

    /// Offset of the first bias block
    pub fn weight_len(&self) -> usize {
        (self.input_width + self.hidden + (self.h_stride() + self.hidden) * (self.layers - 1))
            * self.wei_stride()
    }

    fn bias_len(&self) -> usize {
        if !self.biased {
            return 0;
        }
        let first_layer_blocks = if self.skip { 1 } else { 2 };
        (first_layer_blocks + (self.layers - 1) * 2) * self.wei_stride()
    }

    /// Input bias block of `layer` (`wei_stride` long). Absent when unbiased,
    /// and for layer 0 in SKIP mode, whose single block is recurrent.
    pub fn input_bias(&self, layer: usize) -> Option<usize> {
        if !self.biased {
            return None;
        }
        let base = self.weight_len();
        match (self.skip, layer) {
            (true, 0) => None,
            (true, l) => Some(base + self.wei_stride() + (l - 1) * 2 * self.wei_stride()),
            (false, l) => Some(base + l * 2 * self.wei_stride()),
        }
    }

    /// Recurrent bias block of `layer` (`wei_stride` long)
    pub fn recurrent_bias(&self, layer: usize) -> Option<usize> {
        if !self.biased {
            return None;
        }
        let base = self.weight_len();
        Some(match (self.skip, layer) {
            (true, l) => base + l * 2 * self.wei_stride(),
            (false, l) => base + l * 2 * self.wei_stride() + self.wei_stride(),
        })
    }

    /// Element of a bias block for one direction/gate/unit
    pub fn bias_index(&self, block: usize, dir: Direction, gate: Gate, unit: usize) -> usize {
        block + self.gate_col(dir, gate) + unit
    }

    // ---- hidden-state tensors (layers × dirs × max_batch × H) ----

    pub fn hidden_base(&self, layer: usize, dir: Direction) -> usize {
        let max_batch = self.profile.max_batch();
        layer * max_batch * self.h_stride() + dir.index() * max_batch * self.hidden
    }

    pub fn hidden_view(&self, layer: usize, dir: Direction, rows: usize) -> StridedView {
        StridedView::contiguous(self.hidden_base(layer, dir), rows, self.hidden)
    }

    pub fn hidden_index(&self, layer: usize, dir: Direction, row: usize, unit: usize) -> usize {
        self.hidden_base(layer, dir) + row * self.hidden + unit
    }

    // ---- external tensors ----

    pub fn input_view(&self) -> StridedView {
        StridedView::contiguous(0, self.batch_n(), self.input_stride)
    }

    // ---- size queries ----

    /// Length of the weight blob including bias blocks
    pub fn params_len(&self) -> usize {
        self.weight_len() + self.bias_len()
    }

    pub fn workspace_len(&self) -> usize {
        self.layers * self.batch_n() * self.hy_stride()
    }

    pub fn reserve_len(&self) -> usize {
        2 * self.workspace_len()
    }

    pub fn hidden_len(&self) -> usize {
        self.layers * self.h_stride() * self.profile.max_batch()
    }

    pub fn input_len(&self) -> usize {
        self.batch_n() * self.input_stride
    }

    pub fn output_len(&self) -> usize {
        self.batch_n() * self.output_width
    }

    pub(crate) fn check_len(&self, name: &'static str, expected: usize, buf: &[f32]) -> Result<()> {
        GruError::check_len(name, expected, buf.len())
    }
}
