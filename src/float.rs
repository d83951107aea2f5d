//! Floating point precision handling.
//!
//! Every array in a reconstruction has the same element type, chosen once by the
//! type parameter of the forward model. The serde tag [`Precision`] lets a
//! configuration name the precision it was written for.

use ndarray::NdFloat;
use ndarray_npy::{ReadableElement, WritableElement};
use rustfft::FftNum;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Precision tag as it appears in configuration files.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Float32,
    Float64,
}

impl Display for Precision {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Precision::Float32 => write!(f, "float32"),
            Precision::Float64 => write!(f, "float64"),
        }
    }
}

/// Scalar type of all tensors: implemented for `f32` and `f64`.
pub trait ReconFloat:
    NdFloat + FftNum + ReadableElement + WritableElement + Default
{
    /// Tag matching this type.
    const PRECISION: Precision;

    /// Converts a literal or configuration value.
    fn cast(value: f64) -> Self;

    /// Widens to `f64` for logging and tolerance checks.
    fn as_f64(self) -> f64;
}

impl ReconFloat for f32 {
    const PRECISION: Precision = Precision::Float32;

    fn cast(value: f64) -> Self {
        value as f32
    }

    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl ReconFloat for f64 {
    const PRECISION: Precision = Precision::Float64;

    fn cast(value: f64) -> Self {
        value
    }

    fn as_f64(self) -> f64 {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precision_tags() {
        assert_eq!(<f32 as ReconFloat>::PRECISION, Precision::Float32);
        assert_eq!(<f64 as ReconFloat>::PRECISION, Precision::Float64);
        assert_eq!(Precision::Float64.to_string(), "float64");
    }

    #[test]
    fn test_cast_round_trip() {
        assert_eq!(f32::cast(0.25).as_f64(), 0.25);
        assert_eq!(f64::cast(1e-6), 1e-6);
    }
}
