//! Error type shared by the forward model, the solvers and the unrolled variants.

use std::path::PathBuf;
use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ReconError>;

/// Errors that can occur while building or running a reconstruction.
#[derive(Error, Debug)]
pub enum ReconError {
    /// PSF, measurement or image shapes are incompatible
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Unknown algorithm name in the configuration
    #[error("unsupported algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    /// NaN or Inf detected in the primal estimate
    #[error("numerical divergence detected at iteration {iteration}")]
    NumericalDivergence { iteration: usize },

    /// Checkpoint path does not resolve to a file
    #[error("checkpoint not found: {}", .0.display())]
    MissingCheckpoint(PathBuf),

    /// `apply` was called before `set_data`
    #[error("no measurement set, call set_data first")]
    MissingData,

    /// The PSF cannot be used to build a forward model
    #[error("invalid PSF: {0}")]
    InvalidPsf(String),

    /// Hyperparameters or options out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// FFT length mismatch or invalid spectrum
    #[error("FFT error: {0}")]
    Fft(#[from] realfft::FftError),

    /// Array could not be reshaped or stacked
    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    /// Reading a checkpoint failed
    #[error("failed to read checkpoint: {0}")]
    CheckpointRead(#[from] ndarray_npy::ReadNpyError),

    /// Writing a checkpoint failed
    #[error("failed to write checkpoint: {0}")]
    CheckpointWrite(#[from] ndarray_npy::WriteNpyError),

    /// Loading or saving a configuration preset failed
    #[error("preset persistence failed: {0}")]
    Preferences(#[from] preferences::PreferencesError),
}

impl ReconError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        ReconError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }

    /// Check if this error is recoverable.
    ///
    /// A divergent reconstruction only invalidates the current run: a training
    /// loop can drop the batch and continue. Everything else is a setup error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ReconError::NumericalDivergence { .. })
    }
}
