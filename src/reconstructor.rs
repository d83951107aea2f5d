//! Builds a solver from a [`ReconConfig`] and dispatches over the closed set of
//! variants.

use crate::config::{Algorithm, ReconConfig};
use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use crate::observer::IterationObserver;
use crate::solver::{
    Admm, AdmmStepParams, ApplyOptions, Fista, GradientDescent, NesterovGradientDescent,
    Reconstruct, SolverStatus,
};
use crate::unrolled::{Intermediates, Transforms, UnrolledAdmm, UnrolledFista};
use ndarray::{Array4, Array5, ArrayView4, ArrayView5};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum Reconstructor<T: ReconFloat> {
    GradientDescent(GradientDescent<T>),
    NesterovGradientDescent(NesterovGradientDescent<T>),
    Fista(Fista<T>),
    Admm(Admm<T>),
    UnrolledFista(UnrolledFista<T>),
    UnrolledAdmm(UnrolledAdmm<T>),
}

macro_rules! dispatch {
    ($value:expr, $solver:ident => $body:expr) => {
        match $value {
            Reconstructor::GradientDescent($solver) => $body,
            Reconstructor::NesterovGradientDescent($solver) => $body,
            Reconstructor::Fista($solver) => $body,
            Reconstructor::Admm($solver) => $body,
            Reconstructor::UnrolledFista($solver) => $body,
            Reconstructor::UnrolledAdmm($solver) => $body,
        }
    };
}

fn check_precision<T: ReconFloat>(config: &ReconConfig) -> Result<()> {
    if config.precision != T::PRECISION {
        return Err(ReconError::InvalidConfig(format!(
            "configured precision {} does not match {}",
            config.precision,
            T::PRECISION
        )));
    }
    Ok(())
}

fn admm_params<T: ReconFloat>(config: &ReconConfig) -> AdmmStepParams<T> {
    AdmmStepParams {
        mu1: T::cast(config.admm.mu1),
        mu2: T::cast(config.admm.mu2),
        mu3: T::cast(config.admm.mu3),
        tau: T::cast(config.admm.tau),
    }
}

impl<T: ReconFloat> Reconstructor<T> {
    /// Builds the forward model of `psf` `(D, H, W, C)` and the configured solver.
    pub fn from_config(psf: ArrayView4<T>, config: &ReconConfig) -> Result<Self> {
        config.validate()?;
        check_precision::<T>(config)?;
        let model = Arc::new(ForwardModel::new(psf, config.normalize_psf)?);
        Self::with_model(model, config)
    }

    /// Like [`Self::from_config`] with an existing forward model, so that several
    /// solvers share one set of FFT plans and transfer functions.
    pub fn with_model(model: Arc<ForwardModel<T>>, config: &ReconConfig) -> Result<Self> {
        config.validate()?;
        check_precision::<T>(config)?;
        let n_iter = config.n_iter;
        let policy = config.divergence;

        let mut reconstructor = match config.algorithm {
            Algorithm::GradientDescent => {
                let section = &config.gradient_descent;
                let mut solver = GradientDescent::new(model)
                    .with_prior(section.prior)?
                    .with_line_search(section.line_search)
                    .with_n_iter(n_iter);
                if let Some(alpha) = section.alpha {
                    solver = solver.with_alpha(T::cast(alpha))?;
                }
                Reconstructor::GradientDescent(solver)
            }
            Algorithm::NesterovGradientDescent => {
                let section = &config.nesterov;
                let mut solver = NesterovGradientDescent::new(model)
                    .with_prior(section.prior)?
                    .with_momentum(T::cast(section.momentum))?
                    .with_n_iter(n_iter);
                if let Some(alpha) = section.alpha {
                    solver = solver.with_alpha(T::cast(alpha))?;
                }
                Reconstructor::NesterovGradientDescent(solver)
            }
            Algorithm::Fista => {
                let section = &config.fista;
                let mut solver = Fista::new(model)
                    .with_prior(section.prior)?
                    .with_tk(T::cast(section.tk))?
                    .with_n_iter(n_iter);
                if let Some(alpha) = section.alpha {
                    solver = solver.with_alpha(T::cast(alpha))?;
                }
                Reconstructor::Fista(solver)
            }
            Algorithm::Admm => Reconstructor::Admm(
                Admm::new(model)
                    .with_params(admm_params(config))?
                    .with_n_iter(n_iter),
            ),
            Algorithm::UnrolledFista => {
                let section = &config.fista;
                let mut solver = UnrolledFista::new(model, n_iter)?
                    .with_tk(T::cast(section.tk))?
                    .with_learn_tk(section.learn_tk);
                if let Some(alpha) = section.alpha {
                    solver = solver.with_alpha(T::cast(alpha))?;
                }
                if let Some(path) = &config.unrolled.checkpoint {
                    solver.load_checkpoint(path)?;
                }
                Reconstructor::UnrolledFista(solver)
            }
            Algorithm::UnrolledAdmm => {
                let mut solver =
                    UnrolledAdmm::new(model, n_iter)?.with_params(admm_params(config))?;
                if let Some(path) = &config.unrolled.checkpoint {
                    solver.load_checkpoint(path)?;
                }
                Reconstructor::UnrolledAdmm(solver)
            }
        };
        if !config.algorithm.is_unrolled() && config.unrolled.checkpoint.is_some() {
            log::warn!("{}: checkpoint ignored by classic solvers", config.algorithm);
        }
        dispatch!(&mut reconstructor, solver => solver.core_mut().set_divergence_policy(policy));
        log::debug!("built {} solver with {} iterations", config.algorithm, n_iter);
        Ok(reconstructor)
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Reconstructor::GradientDescent(_) => Algorithm::GradientDescent,
            Reconstructor::NesterovGradientDescent(_) => Algorithm::NesterovGradientDescent,
            Reconstructor::Fista(_) => Algorithm::Fista,
            Reconstructor::Admm(_) => Algorithm::Admm,
            Reconstructor::UnrolledFista(_) => Algorithm::UnrolledFista,
            Reconstructor::UnrolledAdmm(_) => Algorithm::UnrolledAdmm,
        }
    }

    pub fn name(&self) -> &'static str {
        dispatch!(self, solver => solver.name())
    }

    pub fn model(&self) -> &Arc<ForwardModel<T>> {
        dispatch!(self, solver => solver.core().model())
    }

    /// Stores the measurement `(1, H, W, C)` and resets the iterates.
    pub fn set_data(&mut self, data: Array4<T>) -> Result<()> {
        dispatch!(self, solver => solver.set_data(data))
    }

    pub fn apply(
        &mut self,
        options: &ApplyOptions,
        observer: Option<&mut dyn IterationObserver<T>>,
    ) -> Result<Array4<T>> {
        dispatch!(self, solver => solver.apply(options, observer))
    }

    pub fn reset(&mut self) {
        dispatch!(self, solver => solver.reset())
    }

    pub fn status(&self) -> SolverStatus {
        dispatch!(self, solver => solver.status())
    }

    pub fn iterations(&self) -> usize {
        dispatch!(self, solver => solver.iterations())
    }

    pub fn n_iter(&self) -> usize {
        dispatch!(self, solver => solver.n_iter())
    }
}

/// An unrolled solver with its pre- and post-processing attached.
#[derive(Debug, Clone)]
pub enum Unrolled<T: ReconFloat> {
    Fista(UnrolledFista<T>),
    Admm(UnrolledAdmm<T>),
}

impl<T: ReconFloat> Unrolled<T> {
    pub fn batch_call(&self, data: ArrayView5<T>) -> Result<Array5<T>> {
        match self {
            Unrolled::Fista(solver) => solver.batch_call(data),
            Unrolled::Admm(solver) => solver.batch_call(data),
        }
    }

    pub fn apply_with_intermediates(&self, measurement: ArrayView4<T>) -> Result<Intermediates<T>> {
        match self {
            Unrolled::Fista(solver) => solver.apply_with_intermediates(measurement),
            Unrolled::Admm(solver) => solver.apply_with_intermediates(measurement),
        }
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        match self {
            Unrolled::Fista(solver) => solver.save_checkpoint(path),
            Unrolled::Admm(solver) => solver.save_checkpoint(path),
        }
    }

    pub fn n_iter(&self) -> usize {
        match self {
            Unrolled::Fista(solver) => solver.n_iter(),
            Unrolled::Admm(solver) => solver.n_iter(),
        }
    }
}

/// Builds an unrolled variant from `config` and attaches `transforms`.
///
/// # Errors
/// `InvalidConfig` when `config` selects a classic algorithm, plus everything
/// [`Reconstructor::from_config`] reports.
pub fn build_unrolled<T: ReconFloat>(
    psf: ArrayView4<T>,
    config: &ReconConfig,
    transforms: Transforms<T>,
) -> Result<Unrolled<T>> {
    if !config.algorithm.is_unrolled() {
        return Err(ReconError::InvalidConfig(format!(
            "{} is not an unrolled algorithm",
            config.algorithm
        )));
    }
    let Transforms {
        pre_process,
        post_process,
    } = transforms;
    let unrolled = match Reconstructor::from_config(psf, config)? {
        Reconstructor::UnrolledFista(mut solver) => {
            if let Some(t) = pre_process {
                solver = solver.with_pre_process(t);
            }
            if let Some(t) = post_process {
                solver = solver.with_post_process(t);
            }
            Unrolled::Fista(solver)
        }
        Reconstructor::UnrolledAdmm(mut solver) => {
            if let Some(t) = pre_process {
                solver = solver.with_pre_process(t);
            }
            if let Some(t) = post_process {
                solver = solver.with_post_process(t);
            }
            Unrolled::Admm(solver)
        }
        other => {
            return Err(ReconError::InvalidConfig(format!(
                "{} is not an unrolled algorithm",
                other.name()
            )))
        }
    };
    Ok(unrolled)
}
