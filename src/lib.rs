//! Image reconstruction for lensless cameras.
//!
//! A measurement is the convolution of the scene with the camera's point spread
//! function (PSF), cropped to the sensor. [`ForwardModel`] implements that
//! operator and its adjoint with real FFTs. The classic solvers in [`solver`]
//! (gradient descent, Nesterov, FISTA, ADMM) invert it iteratively, and
//! [`unrolled`] runs a fixed number of FISTA or ADMM iterations with learnable
//! scalars as a differentiable map over a batch.
//!
//! All arrays are 4-D `(depth, height, width, channels)`; measurements have a
//! depth of 1. Batches add a leading axis.

pub mod config;
pub mod error;
pub mod float;
pub mod forward_model;
pub mod math_tools;
pub mod observer;
pub mod prox;
pub mod reconstructor;
pub mod solver;
pub mod unrolled;

#[cfg(test)]
mod testing;

pub use config::{Algorithm, ReconConfig};
pub use error::{ReconError, Result};
pub use float::{Precision, ReconFloat};
pub use forward_model::ForwardModel;
pub use observer::{ChannelObserver, IterationObserver, IterationSnapshot, LogObserver};
pub use prox::Prior;
pub use reconstructor::{build_unrolled, Reconstructor, Unrolled};
pub use solver::{ApplyOptions, DivergencePolicy, Reconstruct, SolverStatus};
