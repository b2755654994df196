//! Gate activations and their derivatives.
//!
//! Derivatives take the *activated* value, since the activation cache keeps
//! σ(z), σ(r) and tanh(n) and the backward passes never go back to the
//! pre-activations.

/// Logistic sigmoid: 1 / (1 + e^{-x})
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// d/dx σ(x) written in terms of s = σ(x)
#[inline]
pub fn sigmoid_derivative(s: f32) -> f32 {
    s * (1.0 - s)
}

/// d/dx tanh(x) written in terms of t = tanh(x)
#[inline]
pub fn tanh_derivative(t: f32) -> f32 {
    1.0 - t * t
}
