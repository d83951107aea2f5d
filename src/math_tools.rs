//! Small numerical helpers shared by the forward model, the proximal operators
//! and the solvers: FFT size selection, circular shifts, inner products, norms.

use crate::float::ReconFloat;
use ndarray::{Array2, ArrayBase, ArrayView2, Data, Dimension, Zip};

/// Returns the smallest integer `>= n` whose only prime factors are 2, 3 and 5.
///
/// Such lengths are the fast path of `rustfft`.
pub fn next_fast_len(n: usize) -> usize {
    if n <= 1 {
        return 1;
    }
    let mut candidate = n;
    loop {
        let mut rest = candidate;
        for p in [2, 3, 5] {
            while rest % p == 0 {
                rest /= p;
            }
        }
        if rest == 1 {
            return candidate;
        }
        candidate += 1;
    }
}

/// Circularly shifts a 2-D array so that the element at `(h/2, w/2)` moves to
/// the origin (numpy's `ifftshift` over both axes).
pub fn ifftshift_2d<T: Copy>(plane: ArrayView2<T>) -> Array2<T> {
    let (h, w) = plane.dim();
    Array2::from_shape_fn((h, w), |(i, j)| plane[[(i + h / 2) % h, (j + w / 2) % w]])
}

/// Real inner product of two arrays of equal shape.
pub fn inner<T, S1, S2, D>(a: &ArrayBase<S1, D>, b: &ArrayBase<S2, D>) -> T
where
    T: ReconFloat,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    D: Dimension,
{
    Zip::from(a)
        .and(b)
        .fold(T::zero(), |acc, &x, &y| acc + x * y)
}

/// Euclidean (Frobenius) norm.
pub fn norm<T, S, D>(a: &ArrayBase<S, D>) -> T
where
    T: ReconFloat,
    S: Data<Elem = T>,
    D: Dimension,
{
    a.fold(T::zero(), |acc, &x| acc + x * x).sqrt()
}

/// `‖new − old‖ / max(‖old‖, ε)`, the relative change used as stopping metric.
pub fn relative_change<T, S1, S2, D>(new: &ArrayBase<S1, D>, old: &ArrayBase<S2, D>) -> T
where
    T: ReconFloat,
    S1: Data<Elem = T>,
    S2: Data<Elem = T>,
    D: Dimension,
{
    let diff = Zip::from(new).and(old).fold(T::zero(), |acc, &x, &y| {
        let d = x - y;
        acc + d * d
    });
    diff.sqrt() / norm(old).max(T::epsilon())
}

/// True when no element is NaN or infinite.
pub fn all_finite<T, S, D>(a: &ArrayBase<S, D>) -> bool
where
    T: ReconFloat,
    S: Data<Elem = T>,
    D: Dimension,
{
    a.iter().all(|x| x.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array4};

    #[test]
    fn test_next_fast_len() {
        assert_eq!(next_fast_len(0), 1);
        assert_eq!(next_fast_len(1), 1);
        assert_eq!(next_fast_len(7), 8);
        assert_eq!(next_fast_len(11), 12);
        assert_eq!(next_fast_len(63), 64);
        assert_eq!(next_fast_len(127), 128);
        assert_eq!(next_fast_len(97), 100);
    }

    #[test]
    fn test_ifftshift_moves_center_to_origin() {
        let mut plane = Array2::<f64>::zeros((5, 4));
        plane[[2, 2]] = 1.0;
        let shifted = ifftshift_2d(plane.view());
        assert_eq!(shifted[[0, 0]], 1.0);
        assert_eq!(shifted.sum(), 1.0);
    }

    #[test]
    fn test_inner_and_norm() {
        let a = array![[1.0_f64, 2.0], [3.0, 4.0]];
        let b = array![[0.5_f64, -1.0], [2.0, 0.0]];
        assert_relative_eq!(inner(&a, &b), 0.5 - 2.0 + 6.0);
        assert_relative_eq!(norm(&a), 30.0_f64.sqrt());
    }

    #[test]
    fn test_relative_change_guards_zero_reference() {
        let zero = Array4::<f32>::zeros((1, 2, 2, 1));
        let ones = Array4::<f32>::ones((1, 2, 2, 1));
        assert!(relative_change(&ones, &zero).is_finite());
        assert_relative_eq!(relative_change(&ones, &ones), 0.0);
    }

    #[test]
    fn test_all_finite() {
        let mut a = Array4::<f64>::zeros((1, 2, 2, 1));
        assert!(all_finite(&a));
        a[[0, 1, 0, 0]] = f64::NAN;
        assert!(!all_finite(&a));
        a[[0, 1, 0, 0]] = f64::INFINITY;
        assert!(!all_finite(&a));
    }
}
