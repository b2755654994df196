//! Strided matrix views over flat buffers and the affine primitive every pass
//! is built from.

use ndarray::{ArrayView2, ArrayViewMut2, ShapeBuilder, Zip};

use crate::errors::{GruError, Result};

/// A row-major matrix window inside a flat buffer.
///
/// `rows`/`cols`/`ld` describe the stored matrix; `transposed` flips the
/// logical shape without touching storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StridedView {
    pub offset: usize,
    pub rows: usize,
    pub cols: usize,
    /// Distance between the starts of consecutive stored rows
    pub ld: usize,
    pub transposed: bool,
}

impl StridedView {
    pub fn new(offset: usize, rows: usize, cols: usize, ld: usize) -> Self {
        Self {
            offset,
            rows,
            cols,
            ld,
            transposed: false,
        }
    }

    /// Densely packed rows
    pub fn contiguous(offset: usize, rows: usize, cols: usize) -> Self {
        Self::new(offset, rows, cols, cols)
    }

    /// Same storage, transposed logical shape
    pub fn t(self) -> Self {
        Self {
            transposed: !self.transposed,
            ..self
        }
    }

    pub fn with_rows(self, rows: usize) -> Self {
        Self { rows, ..self }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Logical (rows, cols) after applying the transpose flag
    pub fn shape(&self) -> (usize, usize) {
        if self.transposed {
            (self.cols, self.rows)
        } else {
            (self.rows, self.cols)
        }
    }

    /// Smallest buffer length that contains the whole window; an empty
    /// window fits any buffer
    pub fn required_len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            self.offset + (self.rows - 1) * self.ld + self.cols
        }
    }

    fn check(&self, available: usize) -> Result<()> {
        if self.rows > 1 && self.ld < self.cols {
            return Err(GruError::ShapeMismatch {
                op: "strided view",
                message: format!(
                    "leading stride {} is shorter than the row length {}",
                    self.ld, self.cols
                ),
            });
        }
        let required = self.required_len();
        if required > available {
            return Err(GruError::ViewOutOfBounds {
                required,
                available,
            });
        }
        Ok(())
    }

    pub fn view<'a>(&self, buf: &'a [f32]) -> Result<ArrayView2<'a, f32>> {
        self.check(buf.len())?;
        let view = if self.is_empty() {
            ArrayView2::from_shape((self.rows, self.cols), &buf[..0])
        } else {
            ArrayView2::from_shape(
                (self.rows, self.cols).strides((self.ld, 1)),
                &buf[self.offset..],
            )
        }
        .map_err(|e| GruError::ShapeMismatch {
            op: "strided view",
            message: e.to_string(),
        })?;
        Ok(if self.transposed {
            view.reversed_axes()
        } else {
            view
        })
    }

    pub fn view_mut<'a>(&self, buf: &'a mut [f32]) -> Result<ArrayViewMut2<'a, f32>> {
        self.check(buf.len())?;
        let view = if self.is_empty() {
            ArrayViewMut2::from_shape((self.rows, self.cols), &mut buf[..0])
        } else {
            ArrayViewMut2::from_shape(
                (self.rows, self.cols).strides((self.ld, 1)),
                &mut buf[self.offset..],
            )
        }
        .map_err(|e| GruError::ShapeMismatch {
            op: "strided view",
            message: e.to_string(),
        })?;
        Ok(if self.transposed {
            view.reversed_axes()
        } else {
            view
        })
    }
}

/// `c = alpha * (a · b) + beta * c`
///
/// Every element of `c` is one dot product of a row of `a` with a column of
/// `b`, so its value depends only on that row and column. With `beta == 0`
/// the previous contents of `c` are ignored.
pub fn affine(
    alpha: f32,
    a: ArrayView2<'_, f32>,
    b: ArrayView2<'_, f32>,
    beta: f32,
    c: &mut ArrayViewMut2<'_, f32>,
) -> Result<()> {
    if a.ncols() != b.nrows() || c.nrows() != a.nrows() || c.ncols() != b.ncols() {
        return Err(GruError::ShapeMismatch {
            op: "affine",
            message: format!(
                "({}x{}) · ({}x{}) into ({}x{})",
                a.nrows(),
                a.ncols(),
                b.nrows(),
                b.ncols(),
                c.nrows(),
                c.ncols()
            ),
        });
    }

    Zip::from(c.rows_mut())
        .and(a.rows())
        .for_each(|mut c_row, a_row| {
            Zip::from(&mut c_row)
                .and(b.columns())
                .for_each(|c, b_col| {
                    let product = alpha * a_row.dot(&b_col);
                    *c = if beta == 0.0 {
                        product
                    } else {
                        product + beta * *c
                    };
                });
        });
    Ok(())
}
