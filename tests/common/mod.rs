#![allow(dead_code)]

use lensless_recon::ReconFloat;
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic values in `[0, 1)`.
pub fn pseudo_random<T: ReconFloat>(shape: (usize, usize, usize, usize), seed: u64) -> Array4<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array4::from_shape_fn(shape, |_| T::cast(rng.gen::<f64>()))
}

/// Gaussian spot slightly off centre, shifted per channel.
pub fn spot_psf<T: ReconFloat>(shape: (usize, usize, usize, usize)) -> Array4<T> {
    let (_, h, w, _) = shape;
    Array4::from_shape_fn(shape, |(d, i, j, c)| {
        let dy = i as f64 - h as f64 / 2.0 + d as f64;
        let dx = j as f64 - w as f64 / 2.0 - c as f64;
        T::cast((-(dy * dy + dx * dx) / (0.05 * (h * w) as f64)).exp() + 0.01)
    })
}
