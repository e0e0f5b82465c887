//! Elementwise kernels over fixed-length `f64` vectors.
//!
//! Every binary operation checks that its operands share one length and fails
//! with [`VectorError::LengthMismatch`] otherwise. Operand roles follow the
//! classic BLAS-style names; note that [`aypx`] scales the *destination*, not
//! the source, which is the opposite of [`axpy`].

use ndarray::{Array1, Zip};

/// Contract violations raised by the vector kernels.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VectorError {
    #[error("vector length mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },
}

#[inline]
fn same_len(expected: usize, found: usize) -> Result<(), VectorError> {
    if expected == found {
        Ok(())
    } else {
        Err(VectorError::LengthMismatch { expected, found })
    }
}

/// `v *= alpha`
pub fn scale(alpha: f64, v: &mut Array1<f64>) {
    v.mapv_inplace(|vi| vi * alpha);
}

/// Fills `v` with `value`.
pub fn set(value: f64, v: &mut Array1<f64>) {
    v.fill(value);
}

/// `dst = src`
pub fn copy(src: &Array1<f64>, dst: &mut Array1<f64>) -> Result<(), VectorError> {
    same_len(dst.len(), src.len())?;
    dst.assign(src);
    Ok(())
}

/// `y += alpha * x`
pub fn axpy(alpha: f64, x: &Array1<f64>, y: &mut Array1<f64>) -> Result<(), VectorError> {
    same_len(y.len(), x.len())?;
    Zip::from(y).and(x).for_each(|yi, &xi| *yi += alpha * xi);
    Ok(())
}

/// `y = x + alpha * y`
pub fn aypx(alpha: f64, x: &Array1<f64>, y: &mut Array1<f64>) -> Result<(), VectorError> {
    same_len(y.len(), x.len())?;
    Zip::from(y).and(x).for_each(|yi, &xi| *yi = xi + alpha * *yi);
    Ok(())
}

/// `w = y + alpha * x`
pub fn waxpy(
    alpha: f64,
    x: &Array1<f64>,
    y: &Array1<f64>,
    w: &mut Array1<f64>,
) -> Result<(), VectorError> {
    same_len(x.len(), y.len())?;
    same_len(x.len(), w.len())?;
    Zip::from(w)
        .and(x)
        .and(y)
        .for_each(|wi, &xi, &yi| *wi = yi + alpha * xi);
    Ok(())
}

/// `sum_i x_i * y_i`
pub fn dot(x: &Array1<f64>, y: &Array1<f64>) -> Result<f64, VectorError> {
    same_len(x.len(), y.len())?;
    Ok(x.dot(y))
}

/// `x_i = min(x_i, b_i)`; a NaN in `x` is kept.
pub fn pointwise_min(x: &mut Array1<f64>, b: &Array1<f64>) -> Result<(), VectorError> {
    same_len(x.len(), b.len())?;
    Zip::from(x).and(b).for_each(|xi, &bi| {
        if bi < *xi {
            *xi = bi;
        }
    });
    Ok(())
}

/// `x_i = max(x_i, b_i)`; a NaN in `x` is kept.
pub fn pointwise_max(x: &mut Array1<f64>, b: &Array1<f64>) -> Result<(), VectorError> {
    same_len(x.len(), b.len())?;
    Zip::from(x).and(b).for_each(|xi, &bi| {
        if bi > *xi {
            *xi = bi;
        }
    });
    Ok(())
}

/// Clamps `x` into `[lower, upper]` coordinate-wise: a pointwise minimum with
/// the upper bound, then a pointwise maximum with the lower one.
pub fn clamp(
    x: &mut Array1<f64>,
    lower: &Array1<f64>,
    upper: &Array1<f64>,
) -> Result<(), VectorError> {
    same_len(x.len(), lower.len())?;
    same_len(x.len(), upper.len())?;
    pointwise_min(x, upper)?;
    pointwise_max(x, lower)
}

/// Zeroes the components of `g` that would push `x` out of the box: a positive
/// component at the lower bound, or a negative one at the upper bound.
pub fn project_gradient(
    lower: &Array1<f64>,
    x: &Array1<f64>,
    upper: &Array1<f64>,
    g: &mut Array1<f64>,
) -> Result<(), VectorError> {
    same_len(x.len(), lower.len())?;
    same_len(x.len(), upper.len())?;
    same_len(x.len(), g.len())?;
    Zip::from(g)
        .and(x)
        .and(lower)
        .and(upper)
        .for_each(|gi, &xi, &lo, &hi| {
            if (*gi > 0.0 && xi <= lo) || (*gi < 0.0 && xi >= hi) {
                *gi = 0.0;
            }
        });
    Ok(())
}
