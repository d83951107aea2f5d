//! Proximal operators and the finite-difference operator `Ψ` used by the total
//! variation penalty. All functions are stateless and keep shape and precision.

use crate::float::ReconFloat;
use ndarray::{s, Array, Array4, Array5, ArrayBase, ArrayView4, ArrayView5, Axis, Data, Dimension, Zip};
use serde::{Deserialize, Serialize};

/// `sign(v)·max(|v| − τ, 0)`, elementwise.
pub fn soft_threshold<T, S, D>(v: &ArrayBase<S, D>, tau: T) -> Array<T, D>
where
    T: ReconFloat,
    S: Data<Elem = T>,
    D: Dimension,
{
    v.mapv(|x| {
        let magnitude = x.abs() - tau;
        if magnitude > T::zero() {
            x.signum() * magnitude
        } else if magnitude.is_nan() {
            magnitude
        } else {
            T::zero()
        }
    })
}

/// `max(v, 0)`, elementwise. NaN passes through so that divergence stays visible.
pub fn non_negative<T, S, D>(v: &ArrayBase<S, D>) -> Array<T, D>
where
    T: ReconFloat,
    S: Data<Elem = T>,
    D: Dimension,
{
    v.mapv(|x| if x < T::zero() { T::zero() } else { x })
}

/// Derivative of [`soft_threshold`] with respect to its input: 1 where `|v| > τ`.
pub fn soft_threshold_mask<T, S, D>(v: &ArrayBase<S, D>, tau: T) -> Array<T, D>
where
    T: ReconFloat,
    S: Data<Elem = T>,
    D: Dimension,
{
    v.mapv(|x| if x.abs() > tau { T::one() } else { T::zero() })
}

/// Derivative of [`non_negative`]: 1 where `v > 0`.
pub fn non_negative_mask<T, S, D>(v: &ArrayBase<S, D>) -> Array<T, D>
where
    T: ReconFloat,
    S: Data<Elem = T>,
    D: Dimension,
{
    v.mapv(|x| if x > T::zero() { T::one() } else { T::zero() })
}

/// Circular forward differences along height and width.
///
/// `(N, H, W, C) → (N, H, W, C, 2)` with `out[.., 0] = roll(x, 1, H) − x` and
/// `out[.., 1] = roll(x, 1, W) − x`.
pub fn finite_diff<T: ReconFloat>(x: ArrayView4<T>) -> Array5<T> {
    let (n, h, w, c) = x.dim();
    let mut out = Array5::zeros((n, h, w, c, 2));
    Zip::indexed(out.slice_mut(s![.., .., .., .., 0])).for_each(|(b, i, j, k), o| {
        *o = x[[b, (i + h - 1) % h, j, k]] - x[[b, i, j, k]];
    });
    Zip::indexed(out.slice_mut(s![.., .., .., .., 1])).for_each(|(b, i, j, k), o| {
        *o = x[[b, i, (j + w - 1) % w, k]] - x[[b, i, j, k]];
    });
    out
}

/// Adjoint of [`finite_diff`] (negative divergence): `(N, H, W, C, 2) → (N, H, W, C)`.
pub fn finite_diff_adjoint<T: ReconFloat>(u: ArrayView5<T>) -> Array4<T> {
    let (n, h, w, c, _) = u.dim();
    let dy = u.index_axis(Axis(4), 0);
    let dx = u.index_axis(Axis(4), 1);
    Array4::from_shape_fn((n, h, w, c), |(b, i, j, k)| {
        dy[[b, (i + 1) % h, j, k]] - dy[[b, i, j, k]] + dx[[b, i, (j + 1) % w, k]]
            - dx[[b, i, j, k]]
    })
}

/// Isotropic total variation `Σ ‖(Ψx)_p‖₂`.
pub fn total_variation<T: ReconFloat>(x: ArrayView4<T>) -> T {
    let grad = finite_diff(x);
    let dy = grad.index_axis(Axis(4), 0);
    let dx = grad.index_axis(Axis(4), 1);
    Zip::from(&dy)
        .and(&dx)
        .fold(T::zero(), |acc, &a, &b| acc + (a * a + b * b).sqrt())
}

/// Approximate proximal operator of `λ·TV` by projected gradient on the dual.
///
/// The dual field `p` (one 2-vector per pixel) is updated with step `1 / (8λ)`
/// and clamped to the unit ball; the primal is `v − λ·Ψᵀp`.
pub fn tv_prox<T: ReconFloat>(v: ArrayView4<T>, lambda: T, n_inner: usize) -> Array4<T> {
    if lambda <= T::zero() || n_inner == 0 {
        return v.to_owned();
    }
    let (n, h, w, c) = v.dim();
    let step = T::one() / (T::cast(8.0) * lambda);
    let mut p = Array5::<T>::zeros((n, h, w, c, 2));
    for _ in 0..n_inner {
        let primal = &v - &(finite_diff_adjoint(p.view()) * lambda);
        let grad = finite_diff(primal.view());
        p.zip_mut_with(&grad, |q, &g| *q = *q + step * g);
        for mut vector in p.lanes_mut(Axis(4)) {
            let magnitude = (vector[0] * vector[0] + vector[1] * vector[1]).sqrt();
            if magnitude > T::one() {
                vector.mapv_inplace(|q| q / magnitude);
            }
        }
    }
    &v - &(finite_diff_adjoint(p.view()) * lambda)
}

/// Regulariser of the gradient-descent family, applied through its proximal operator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Prior {
    /// projection onto the non-negative orthant
    #[default]
    NonNegative,
    /// `weight·‖x‖₁`
    L1 { weight: f64 },
    /// `weight·‖x‖₁` restricted to non-negative images
    NonNegativeL1 { weight: f64 },
    /// `weight·TV(x)` restricted to non-negative images
    TotalVariation { weight: f64, inner_iter: usize },
}

impl Prior {
    /// `prox_{step·g}(v)` for the penalty `g` of this prior.
    pub fn proximal<T: ReconFloat>(&self, v: ArrayView4<T>, step: T) -> Array4<T> {
        match *self {
            Prior::NonNegative => non_negative(&v),
            Prior::L1 { weight } => soft_threshold(&v, step * T::cast(weight)),
            Prior::NonNegativeL1 { weight } => {
                non_negative(&soft_threshold(&v, step * T::cast(weight)))
            }
            Prior::TotalVariation { weight, inner_iter } => {
                non_negative(&tv_prox(v, step * T::cast(weight), inner_iter))
            }
        }
    }

    pub fn enforces_non_negativity(&self) -> bool {
        !matches!(self, Prior::L1 { .. })
    }

    /// Weights must be finite and non-negative.
    pub fn is_valid(&self) -> bool {
        match *self {
            Prior::NonNegative => true,
            Prior::L1 { weight } | Prior::NonNegativeL1 { weight } => {
                weight.is_finite() && weight >= 0.0
            }
            Prior::TotalVariation { weight, .. } => weight.is_finite() && weight >= 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math_tools::inner;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn ramp(shape: (usize, usize, usize, usize)) -> Array4<f64> {
        Array4::from_shape_fn(shape, |(d, i, j, k)| {
            ((d * 7 + i * 13 + j * 5 + k * 3) % 11) as f64 / 11.0 - 0.3
        })
    }

    #[test]
    fn test_soft_threshold() {
        let v = array![-2.0_f64, -0.5, 0.0, 0.3, 1.5];
        let out = soft_threshold(&v, 0.5);
        assert_eq!(out, array![-1.5, 0.0, 0.0, 0.0, 1.0]);
        // zero threshold is the identity
        assert_eq!(soft_threshold(&v, 0.0), v);
    }

    #[test]
    fn test_non_negative() {
        let v = array![-1.0_f32, 0.0, 2.0];
        assert_eq!(non_negative(&v), array![0.0, 0.0, 2.0]);
        // idempotent
        assert_eq!(non_negative(&non_negative(&v)), non_negative(&v));
        let nan = array![f32::NAN];
        assert!(non_negative(&nan)[0].is_nan());
    }

    #[test]
    fn test_masks() {
        let v = array![-1.0_f64, -0.1, 0.0, 0.2, 3.0];
        assert_eq!(soft_threshold_mask(&v, 0.15), array![1.0, 0.0, 0.0, 1.0, 1.0]);
        assert_eq!(non_negative_mask(&v), array![0.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_finite_diff_adjoint() {
        let x = ramp((2, 5, 4, 3));
        let u = Array5::from_shape_fn((2, 5, 4, 3, 2), |(d, i, j, k, a)| {
            ((d + 2 * i + 3 * j + 5 * k + 7 * a) % 5) as f64 - 2.0
        });
        let lhs = inner(&finite_diff(x.view()), &u);
        let rhs = inner(&x, &finite_diff_adjoint(u.view()));
        assert_relative_eq!(lhs, rhs, epsilon = 1e-12);
    }

    #[test]
    fn test_finite_diff_of_constant_is_zero() {
        let x = Array4::<f32>::from_elem((1, 3, 3, 1), 0.7);
        assert!(finite_diff(x.view()).iter().all(|&d| d == 0.0));
        assert_eq!(total_variation(x.view()), 0.0);
    }

    #[test]
    fn test_tv_prox_reduces_total_variation() {
        let v = ramp((1, 8, 8, 1));
        let denoised = tv_prox(v.view(), 0.2, 50);
        assert_eq!(denoised.shape(), v.shape());
        assert!(total_variation(denoised.view()) < total_variation(v.view()));
        // mean is preserved since Ψᵀp has zero sum
        assert_relative_eq!(denoised.sum(), v.sum(), epsilon = 1e-9);
    }

    #[test]
    fn test_tv_prox_zero_weight_is_identity() {
        let v = ramp((1, 4, 4, 3));
        assert_eq!(tv_prox(v.view(), 0.0, 10), v);
    }

    #[test]
    fn test_prior_proximal() {
        let v = ramp((1, 4, 4, 1));
        let nn = Prior::NonNegative.proximal(v.view(), 1.0);
        assert!(nn.iter().all(|&x| x >= 0.0));
        let l1 = Prior::L1 { weight: 0.1 }.proximal(v.view(), 0.5);
        assert_eq!(l1, soft_threshold(&v, 0.05));
        assert!(l1.iter().any(|&x| x < 0.0));
        let tv = Prior::TotalVariation {
            weight: 0.1,
            inner_iter: 5,
        }
        .proximal(v.view(), 1.0);
        assert!(tv.iter().all(|&x| x >= 0.0));
        assert!(!Prior::L1 { weight: 1.0 }.enforces_non_negativity());
        assert!(!Prior::L1 { weight: -1.0 }.is_valid());
    }
}
