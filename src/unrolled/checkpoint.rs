//! Learnable scalars stored as an `(n_iter, k)` `.npy` matrix, one row per
//! iteration and one column per entry of [`StepParams::NAMES`].

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::unrolled::StepParams;
use ndarray::Array2;
use ndarray_npy::{read_npy, write_npy};
use std::path::Path;

pub fn save_params<T: ReconFloat, P: StepParams<T>>(path: &Path, params: &[P]) -> Result<()> {
    let columns = P::NAMES.len();
    let flat: Vec<T> = params.iter().flat_map(|p| p.to_row()).collect();
    let matrix = Array2::from_shape_vec((params.len(), columns), flat)?;
    write_npy(path, &matrix)?;
    log::info!(
        "saved {} x {} checkpoint ({}) to {:?}",
        params.len(),
        columns,
        P::NAMES.join(", "),
        path
    );
    Ok(())
}

/// Reads `n_iter` rows back. A missing file is reported before anything is parsed.
pub fn load_params<T: ReconFloat, P: StepParams<T>>(path: &Path, n_iter: usize) -> Result<Vec<P>> {
    if !path.is_file() {
        return Err(ReconError::MissingCheckpoint(path.to_path_buf()));
    }
    let matrix: Array2<T> = read_npy(path)?;
    let expected = [n_iter, P::NAMES.len()];
    if matrix.shape() != expected {
        return Err(ReconError::shape("checkpoint", &expected, matrix.shape()));
    }
    let params = matrix
        .rows()
        .into_iter()
        .map(|row| P::from_row(&row.to_vec()))
        .collect();
    log::info!("loaded checkpoint {path:?}");
    Ok(params)
}
