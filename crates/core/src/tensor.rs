//! Tensor types and low-level operations.

use ndarray::{ArrayView, Axis, IxDyn};

use crate::error::{DpError, Result};

/// Scalar type of every tensor.
pub type Scalar = f64;

/// Dynamic-dimensional tensor.
pub type Tensor = ndarray::ArrayD<Scalar>;

/// L2 norm of a tensor; NaN if any entry is NaN, infinite if any entry is.
///
/// Entries are scaled by the largest magnitude first, so finite tensors whose
/// sum of squares exceeds `f64::MAX` still get a finite norm.
pub fn l2_norm(t: &Tensor) -> f64 {
    scaled_l2_norm(t.iter().copied())
}

/// L2 norm of a sequence of values, computed without overflow or underflow.
pub(crate) fn scaled_l2_norm<I>(values: I) -> f64
where
    I: Iterator<Item = f64> + Clone,
{
    let mut max_abs = 0.0_f64;
    for v in values.clone() {
        if v.is_nan() {
            return f64::NAN;
        }
        max_abs = max_abs.max(v.abs());
    }
    if max_abs == 0.0 || max_abs.is_infinite() {
        return max_abs;
    }
    let sum_sq: f64 = values
        .map(|v| {
            let r = v / max_abs;
            r * r
        })
        .sum();
    max_abs * sum_sq.sqrt()
}

/// Stack equally shaped tensors along a new leading axis.
pub fn stack_leading(tensors: &[Tensor]) -> Result<Tensor> {
    if tensors.is_empty() {
        return Err(DpError::invalid("cannot stack an empty list of tensors"));
    }
    let views: Vec<ArrayView<'_, Scalar, IxDyn>> = tensors.iter().map(|t| t.view()).collect();
    ndarray::stack(Axis(0), &views).map_err(|e| {
        DpError::shape(format!(
            "per-example outputs have differing shapes ({:?} first): {e}",
            tensors[0].shape()
        ))
    })
}
