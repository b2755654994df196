//! Tolerance comparison between two result buffers.

use serde::{Deserialize, Serialize};

use crate::errors::{GruError, Result};

/// Root-mean-square difference scaled by the largest magnitude on either side:
///
/// `sqrt(Σ(a−b)²) / (sqrt(n) · max(max|a|, max|b|))`
///
/// Two all-zero buffers compare as 0. The sum is carried in `f64`.
pub fn relative_rms_error(a: &[f32], b: &[f32]) -> Result<f64> {
    if a.len() != b.len() {
        return Err(GruError::ShapeMismatch {
            op: "relative rms error",
            message: format!("{} elements against {}", a.len(), b.len()),
        });
    }
    if a.is_empty() {
        return Ok(0.0);
    }

    let square_sum: f64 = a
        .iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = f64::from(x) - f64::from(y);
            d * d
        })
        .sum();
    let peak = a
        .iter()
        .chain(b)
        .fold(0.0_f64, |m, &v| m.max(f64::from(v).abs()));

    if peak == 0.0 {
        return Ok(0.0);
    }
    Ok(square_sum.sqrt() / ((a.len() as f64).sqrt() * peak))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub threshold: f64,
}

impl Default for Tolerance {
    /// 80 ulps at 1.0
    fn default() -> Self {
        Self {
            threshold: 80.0 * f64::from(f32::EPSILON),
        }
    }
}

impl Tolerance {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Bit-identical buffers only
    pub fn exact() -> Self {
        Self { threshold: 0.0 }
    }

    pub fn accepts(&self, error: f64) -> bool {
        error <= self.threshold
    }
}

/// Compares `actual` against `expected` and names the buffer on failure
pub fn verify(name: &str, expected: &[f32], actual: &[f32], tolerance: Tolerance) -> Result<f64> {
    let error = relative_rms_error(expected, actual)?;
    if !tolerance.accepts(error) {
        tracing::warn!(
            buffer = name,
            error,
            threshold = tolerance.threshold,
            "buffer outside tolerance"
        );
        return Err(GruError::Verification {
            message: format!(
                "{} differs by {:e}, above the threshold {:e}",
                name, error, tolerance.threshold
            ),
        });
    }
    tracing::debug!(buffer = name, error, "buffer within tolerance");
    Ok(error)
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_identical_buffers_have_zero_error() {
        let a = [0.5_f32, -1.0, 2.0];
        assert_eq!(relative_rms_error(&a, &a).unwrap(), 0.0);
        assert_eq!(relative_rms_error(&[0.0; 4], &[0.0; 4]).unwrap(), 0.0);
    }

    #[test]
    fn test_error_is_scaled_by_peak_magnitude() {
        // diff (0, 0, 0, 2): sqrt(4) / (sqrt(4) * 4)
        let a = [1.0_f32, 2.0, 3.0, 4.0];
        let b = [1.0_f32, 2.0, 3.0, 2.0];
        assert_abs_diff_eq!(relative_rms_error(&a, &b).unwrap(), 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_verify_reports_buffer_name() {
        let err = verify("dhx", &[1.0], &[1.5], Tolerance::default()).unwrap_err();
        assert!(err.to_string().contains("dhx"));
        assert!(verify("dhx", &[1.0], &[1.0], Tolerance::exact()).is_ok());
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        assert!(relative_rms_error(&[1.0], &[1.0, 2.0]).is_err());
    }
}
