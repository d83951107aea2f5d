//! Unrolled reconstruction: a fixed number of FISTA or ADMM iterations with their
//! own scalars per iteration, run as a differentiable map from a batch of
//! measurements to a batch of images.
//!
//! The forward pass is the ordinary update code of [`crate::solver`]. The reverse
//! pass replays the recorded iterates of a [`Tape`] and applies the
//! vector-Jacobian product of every iteration in reverse order.

pub mod admm;
pub mod checkpoint;
pub mod fista;

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use ndarray::{Array4, Array5, ArrayView4, ArrayView5, Axis};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

pub use admm::{AdmmTapeEntry, UnrolledAdmm};
pub use fista::{FistaStepParams, FistaTapeEntry, UnrolledFista, UnrolledFistaState};

/// A differentiable image-to-image map applied before or after the iterations.
///
/// `vjp` returns `Jᵀ·grad_output` where `J` is the Jacobian of `forward` at `input`.
pub trait ImageTransform<T: ReconFloat>: Send + Sync {
    fn forward(&self, input: ArrayView4<'_, T>) -> Result<Array4<T>>;

    fn vjp(&self, input: ArrayView4<'_, T>, grad_output: ArrayView4<'_, T>) -> Result<Array4<T>>;
}

/// `gain·x + offset`, elementwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine<T> {
    pub gain: T,
    pub offset: T,
}

impl<T: ReconFloat> ImageTransform<T> for Affine<T> {
    fn forward(&self, input: ArrayView4<'_, T>) -> Result<Array4<T>> {
        Ok(input.mapv(|x| self.gain * x + self.offset))
    }

    fn vjp(&self, _input: ArrayView4<'_, T>, grad_output: ArrayView4<'_, T>) -> Result<Array4<T>> {
        Ok(grad_output.mapv(|g| self.gain * g))
    }
}

/// Optional pre- and post-processing around the iterations.
#[derive(Clone, Default)]
pub struct Transforms<T: ReconFloat> {
    pub pre_process: Option<Arc<dyn ImageTransform<T>>>,
    pub post_process: Option<Arc<dyn ImageTransform<T>>>,
}

impl<T: ReconFloat> Debug for Transforms<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transforms")
            .field("pre_process", &self.pre_process.is_some())
            .field("post_process", &self.post_process.is_some())
            .finish()
    }
}

impl<T: ReconFloat> Transforms<T> {
    pub(crate) fn pre(&self, input: ArrayView4<T>) -> Result<Array4<T>> {
        let output = match &self.pre_process {
            Some(transform) => transform.forward(input)?,
            None => input.to_owned(),
        };
        if output.shape() != input.shape() {
            return Err(ReconError::shape("pre_process", input.shape(), output.shape()));
        }
        Ok(output)
    }

    pub(crate) fn post(&self, input: ArrayView4<T>) -> Result<Array4<T>> {
        let output = match &self.post_process {
            Some(transform) => transform.forward(input)?,
            None => input.to_owned(),
        };
        if output.shape() != input.shape() {
            return Err(ReconError::shape("post_process", input.shape(), output.shape()));
        }
        Ok(output)
    }

    pub(crate) fn pre_vjp(&self, input: ArrayView4<T>, grad: ArrayView4<T>) -> Result<Array4<T>> {
        match &self.pre_process {
            Some(transform) => transform.vjp(input, grad),
            None => Ok(grad.to_owned()),
        }
    }

    pub(crate) fn post_vjp(&self, input: ArrayView4<T>, grad: ArrayView4<T>) -> Result<Array4<T>> {
        match &self.post_process {
            Some(transform) => transform.vjp(input, grad),
            None => Ok(grad.to_owned()),
        }
    }
}

/// The learnable scalars of one unrolled iteration.
pub trait StepParams<T: ReconFloat>: Copy + Send + Sync + Debug {
    /// Column names, in checkpoint order.
    const NAMES: &'static [&'static str];

    fn to_row(&self) -> Vec<T>;

    /// Inverse of `to_row`; `row` has `NAMES.len()` entries.
    fn from_row(row: &[T]) -> Self;

    fn zero() -> Self {
        Self::from_row(&vec![T::zero(); Self::NAMES.len()])
    }

    fn accumulate(&mut self, other: &Self) {
        let sum: Vec<T> = self
            .to_row()
            .into_iter()
            .zip(other.to_row())
            .map(|(a, b)| a + b)
            .collect();
        *self = Self::from_row(&sum);
    }
}

/// Iterates recorded by `batch_call_with_tape`, one entry per batch element.
#[derive(Debug, Clone)]
pub struct Tape<E> {
    pub(crate) entries: Vec<E>,
}

impl<E> Tape<E> {
    pub fn batch_size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[E] {
        &self.entries
    }
}

/// Gradient of `⟨grad_output, output⟩`.
#[derive(Debug, Clone)]
pub struct Gradients<P, T> {
    /// per iteration, summed over the batch
    pub params: Vec<P>,
    /// with respect to the input batch `(B, 1, H, W, C)`
    pub data: Array5<T>,
}

/// The stages of a single unrolled reconstruction.
#[derive(Debug, Clone)]
pub struct Intermediates<T> {
    /// measurement after pre-processing, `(1, H, W, C)`
    pub pre_processed: Array4<T>,
    /// image after the last iteration, before post-processing, `(D, H, W, C)`
    pub formed: Array4<T>,
    pub output: Array4<T>,
}

pub(crate) fn check_batch<T: ReconFloat>(model: &ForwardModel<T>, data: ArrayView5<T>) -> Result<()> {
    let [_, h, w, c] = model.psf_shape();
    let (b, d, dh, dw, dc) = data.dim();
    if b == 0 || (d, dh, dw, dc) != (1, h, w, c) {
        return Err(ReconError::shape("batch_call", &[b.max(1), 1, h, w, c], data.shape()));
    }
    Ok(())
}

pub(crate) fn check_grad_output<T: ReconFloat>(
    model: &ForwardModel<T>,
    batch: usize,
    grad_output: ArrayView5<T>,
) -> Result<()> {
    let [d, h, w, c] = model.psf_shape();
    let expected = [batch, d, h, w, c];
    if grad_output.shape() != expected {
        return Err(ReconError::shape("backward", &expected, grad_output.shape()));
    }
    Ok(())
}

pub(crate) fn stack_batch<T: ReconFloat>(images: &[Array4<T>]) -> Result<Array5<T>> {
    let views: Vec<ArrayView4<T>> = images.iter().map(|image| image.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

pub(crate) fn sum_params<T: ReconFloat, P: StepParams<T>>(per_element: &[Vec<P>], n_iter: usize) -> Vec<P> {
    let mut total = vec![P::zero(); n_iter];
    for element in per_element {
        for (acc, g) in total.iter_mut().zip(element) {
            acc.accumulate(g);
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_vjp() {
        let transform = Affine {
            gain: 2.0_f64,
            offset: -1.0,
        };
        let x = Array4::from_elem((1, 2, 2, 1), 3.0);
        assert_eq!(transform.forward(x.view()).unwrap()[[0, 1, 1, 0]], 5.0);
        let g = Array4::from_elem((1, 2, 2, 1), 0.5);
        assert_eq!(transform.vjp(x.view(), g.view()).unwrap()[[0, 0, 0, 0]], 1.0);
    }

    #[test]
    fn test_identity_transforms() {
        let transforms = Transforms::<f32>::default();
        let x = Array4::from_elem((1, 2, 3, 1), 0.25_f32);
        assert_eq!(transforms.pre(x.view()).unwrap(), x);
        assert_eq!(transforms.post_vjp(x.view(), x.view()).unwrap(), x);
    }

    #[test]
    fn test_check_batch() {
        let psf = Array4::<f64>::ones((1, 4, 5, 3));
        let model = ForwardModel::new(psf.view(), true).unwrap();
        assert!(check_batch(&model, Array5::zeros((2, 1, 4, 5, 3)).view()).is_ok());
        assert!(check_batch(&model, Array5::zeros((2, 2, 4, 5, 3)).view()).is_err());
        assert!(check_batch(&model, Array5::zeros((0, 1, 4, 5, 3)).view()).is_err());
    }
}
