//! Utilities to approximate equality of floating point values.
//!
//! Kernels that reorder or vectorise arithmetic do not produce bit-identical
//! results, and GPU candidates compute in `f32` even for `f64` problems, so
//! outputs and throughput figures are compared with a tolerance.

use crate::element::Element;

/// Tolerance for comparing `f32` kernel outputs.
pub const F32_TOLERANCE: f64 = 1e-5;

/// Tolerance for comparing `f64` kernel outputs.
pub const F64_TOLERANCE: f64 = 1e-12;

/// `|a - b| <= tol * max(1, |a|, |b|)`: absolute near zero, relative elsewhere.
///
/// `NaN` is never close to anything; equal infinities are close.
pub fn close(a: f64, b: f64, tol: f64) -> bool {
    if a == b {
        return true;
    }
    let scale = 1.0f64.max(a.abs()).max(b.abs());
    (a - b).abs() <= tol * scale
}

/// Index of the first element pair that is not [`close`], if any.
///
/// Slices of different length mismatch at the shorter length.
pub fn first_mismatch<T: Element>(a: &[T], b: &[T], tol: f64) -> Option<usize> {
    if let Some(i) = a
        .iter()
        .zip(b)
        .position(|(&x, &y)| !close(x.to_f64(), y.to_f64(), tol))
    {
        return Some(i);
    }
    (a.len() != b.len()).then(|| a.len().min(b.len()))
}

/// Whether every element pair of `a` and `b` is [`close`].
pub fn all_close<T: Element>(a: &[T], b: &[T], tol: f64) -> bool {
    first_mismatch(a, b, tol).is_none()
}
