//! Fixtures for unit tests.

use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use ndarray::Array4;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Uniform values in `[0, 1)` from a seeded generator.
pub fn pseudo_random<T: ReconFloat>(shape: (usize, usize, usize, usize), seed: u64) -> Array4<T> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array4::from_shape_fn(shape, |_| T::cast(rng.gen::<f64>()))
}

/// A blurry, mostly positive PSF: a Gaussian spot plus a little noise.
pub fn blob_psf<T: ReconFloat>(shape: (usize, usize, usize, usize), seed: u64) -> Array4<T> {
    let (_, h, w, _) = shape;
    let noise = pseudo_random::<f64>(shape, seed);
    Array4::from_shape_fn(shape, |(d, i, j, c)| {
        let dy = i as f64 - h as f64 / 2.0 - d as f64;
        let dx = j as f64 - w as f64 / 2.0 + c as f64;
        let spot = (-(dy * dy + dx * dx) / (0.1 * (h * w) as f64)).exp();
        T::cast(spot + 0.05 * noise[[d, i, j, c]])
    })
}

/// Forward model of a blob PSF and a measurement simulated from a random scene.
pub fn problem<T: ReconFloat>(
    shape: (usize, usize, usize, usize),
    seed: u64,
) -> (Arc<ForwardModel<T>>, Array4<T>) {
    let psf = blob_psf::<T>(shape, seed);
    let model = Arc::new(ForwardModel::new(psf.view(), true).unwrap());
    let scene = pseudo_random::<T>(shape, seed + 1);
    let measurement = model.forward(scene.view()).unwrap();
    (model, measurement)
}
