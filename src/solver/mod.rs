//! The iterative reconstruction contract shared by every algorithm.
//!
//! A solver owns a [`SolverCore`] (shared forward model, measurement, status and
//! counters) and a variant specific state struct. The provided
//! [`Reconstruct::apply`] method drives the loop: update, divergence check,
//! observer hook, stopping test.

pub mod admm;
pub mod fista;
pub mod gradient_descent;

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use crate::math_tools::{all_finite, relative_change};
use crate::observer::{IterationEvent, IterationObserver};
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub use admm::{Admm, AdmmState, AdmmStepParams};
pub use fista::{Fista, FistaState};
pub use gradient_descent::{
    GradientDescent, GradientDescentState, NesterovGradientDescent, NesterovState,
};

/// Default number of iterations of every classic variant.
pub const DEFAULT_N_ITER: usize = 100;

/// Lifecycle of a solver.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverStatus {
    Uninitialized,
    DataSet,
    Iterating,
    Converged,
    MaxIterReached,
    /// a non-finite iterate was rolled back under [`DivergencePolicy::Abandon`]
    Abandoned,
    /// the last `apply` failed with `NumericalDivergence`
    Diverged,
    /// an update returned an error; the state holds the iterates reached so far
    Failed,
}

/// What `apply` does when the primal estimate stops being finite.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DivergencePolicy {
    /// return `NumericalDivergence`
    #[default]
    Fail,
    /// restore the last finite state and return its image
    Abandon,
}

/// Options of a single `apply` call.
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// overrides the solver's default iteration count
    pub n_iter: Option<usize>,
    /// observer period in iterations
    pub disp_iter: Option<usize>,
    /// stop once the relative change of the primal estimate falls below this value
    pub stopping_tolerance: Option<f64>,
    pub plot: bool,
    /// directory handed to the observer
    pub save: Option<PathBuf>,
}

impl ApplyOptions {
    pub fn iterations(n_iter: usize) -> Self {
        ApplyOptions {
            n_iter: Some(n_iter),
            ..Default::default()
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.stopping_tolerance = Some(tolerance);
        self
    }

    pub fn with_display(mut self, disp_iter: usize, plot: bool, save: Option<PathBuf>) -> Self {
        self.disp_iter = Some(disp_iter);
        self.plot = plot;
        self.save = save;
        self
    }

    fn wants_observer(&self, iteration: usize) -> bool {
        match self.disp_iter {
            Some(period) if period > 0 => {
                (iteration + 1) % period == 0 && (self.plot || self.save.is_some())
            }
            _ => false,
        }
    }
}

/// State every solver carries besides its iterates.
#[derive(Debug, Clone)]
pub struct SolverCore<T: ReconFloat> {
    model: Arc<ForwardModel<T>>,
    data: Option<Array4<T>>,
    n_iter: usize,
    divergence: DivergencePolicy,
    status: SolverStatus,
    iterations: usize,
}

impl<T: ReconFloat> SolverCore<T> {
    pub fn new(model: Arc<ForwardModel<T>>, n_iter: usize) -> Self {
        SolverCore {
            model,
            data: None,
            n_iter,
            divergence: DivergencePolicy::default(),
            status: SolverStatus::Uninitialized,
            iterations: 0,
        }
    }

    pub fn model(&self) -> &Arc<ForwardModel<T>> {
        &self.model
    }

    /// The measurement, `(1, H, W, C)`.
    pub fn data(&self) -> Result<&Array4<T>> {
        self.data.as_ref().ok_or(ReconError::MissingData)
    }

    pub fn n_iter(&self) -> usize {
        self.n_iter
    }

    pub fn set_n_iter(&mut self, n_iter: usize) {
        self.n_iter = n_iter;
    }

    pub fn divergence_policy(&self) -> DivergencePolicy {
        self.divergence
    }

    pub fn set_divergence_policy(&mut self, policy: DivergencePolicy) {
        self.divergence = policy;
    }

    pub fn status(&self) -> SolverStatus {
        self.status
    }

    /// Iterations performed by the last `apply`.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    fn store_data(&mut self, data: Array4<T>) -> Result<()> {
        self.model.check_measurement(data.view())?;
        self.data = Some(data);
        self.status = SolverStatus::DataSet;
        self.iterations = 0;
        Ok(())
    }

    fn mark_reset(&mut self) {
        self.status = if self.data.is_some() {
            SolverStatus::DataSet
        } else {
            SolverStatus::Uninitialized
        };
        self.iterations = 0;
    }
}

/// Common interface of all reconstruction algorithms.
pub trait Reconstruct<T: ReconFloat> {
    /// Iterates, auxiliaries, duals and momentum of the variant.
    type State: Clone;

    fn name(&self) -> &'static str;

    fn core(&self) -> &SolverCore<T>;

    fn core_mut(&mut self) -> &mut SolverCore<T>;

    fn state(&self) -> Option<&Self::State>;

    fn replace_state(&mut self, state: Option<Self::State>);

    /// Fresh state for the measurement `data`.
    fn initial_state(&self, data: &Array4<T>) -> Result<Self::State>;

    /// One iteration; `iteration` is 0-based within the current `apply`.
    fn update(&mut self, iteration: usize) -> Result<()>;

    /// Estimate whose change drives the stopping test and divergence check.
    fn primal(&self) -> Option<ArrayView4<'_, T>>;

    /// Final image `(D, H, W, C)` from the current state.
    fn form_image(&self) -> Result<Array4<T>>;

    fn supports_early_stopping(&self) -> bool {
        true
    }

    /// Upper bound on the iterations a single `apply` can run, if any.
    fn max_iterations(&self) -> Option<usize> {
        None
    }

    fn status(&self) -> SolverStatus {
        self.core().status()
    }

    fn iterations(&self) -> usize {
        self.core().iterations()
    }

    fn n_iter(&self) -> usize {
        self.core().n_iter()
    }

    /// Stores the measurement `(1, H, W, C)` and resets the state.
    fn set_data(&mut self, data: Array4<T>) -> Result<()> {
        self.core_mut().store_data(data)?;
        let state = self.initial_state(self.core().data()?)?;
        self.replace_state(Some(state));
        Ok(())
    }

    /// Drops the iterates. The forward model and the measurement are kept; the next
    /// `apply` starts again from the initial state.
    fn reset(&mut self) {
        self.replace_state(None);
        self.core_mut().mark_reset();
    }

    /// Runs the reconstruction and returns the formed image.
    ///
    /// # Arguments
    /// - `options`: iteration count, stopping tolerance and observer settings.
    /// - `observer`: called every `disp_iter` iterations if `plot` or `save` is set.
    ///
    /// # Errors
    /// `MissingData` before `set_data`; `NumericalDivergence` when the estimate
    /// becomes non-finite under [`DivergencePolicy::Fail`]; `InvalidConfig` when more
    /// iterations are requested than [`Reconstruct::max_iterations`] allows, before
    /// any state is touched.
    fn apply(
        &mut self,
        options: &ApplyOptions,
        mut observer: Option<&mut dyn IterationObserver<T>>,
    ) -> Result<Array4<T>> {
        let n_iter = options.n_iter.unwrap_or_else(|| self.core().n_iter());
        if let Some(max) = self.max_iterations().filter(|&max| n_iter > max) {
            return Err(ReconError::InvalidConfig(format!(
                "{} runs at most {max} iterations, {n_iter} requested",
                self.name()
            )));
        }
        if self.state().is_none() {
            let state = self.initial_state(self.core().data()?)?;
            self.replace_state(Some(state));
        }
        let tolerance = options
            .stopping_tolerance
            .filter(|_| self.supports_early_stopping())
            .map(T::cast);
        let policy = self.core().divergence_policy();
        let name = self.name();

        let start = Instant::now();
        self.core_mut().status = SolverStatus::Iterating;
        self.core_mut().iterations = 0;
        let mut status = SolverStatus::MaxIterReached;

        for i in 0..n_iter {
            let previous = match tolerance {
                Some(_) => self.primal().map(|p| p.to_owned()),
                None => None,
            };
            let backup = match policy {
                DivergencePolicy::Abandon => self.state().cloned(),
                DivergencePolicy::Fail => None,
            };

            if let Err(err) = self.update(i) {
                log::error!("{name}: update failed at iteration {i}: {err}");
                self.core_mut().status = SolverStatus::Failed;
                return Err(err);
            }

            if !self.primal().is_some_and(|p| all_finite(&p)) {
                if let Some(state) = backup {
                    log::warn!("{name}: non-finite estimate at iteration {i}, run abandoned");
                    self.replace_state(Some(state));
                    status = SolverStatus::Abandoned;
                    break;
                }
                log::error!("{name}: numerical divergence at iteration {i}");
                self.core_mut().status = SolverStatus::Diverged;
                return Err(ReconError::NumericalDivergence { iteration: i });
            }
            self.core_mut().iterations = i + 1;

            if options.wants_observer(i) {
                if let Some(observer) = observer.as_deref_mut() {
                    log::debug!("{name}: iteration {}", i + 1);
                    let event = IterationEvent {
                        algorithm: name,
                        plot: options.plot,
                        save: options.save.as_deref(),
                    };
                    match self.form_image() {
                        Ok(image) => {
                            if let Err(err) = observer.on_iteration(i + 1, image.view(), &event) {
                                log::warn!("{name}: observer failed at iteration {}: {err}", i + 1);
                            }
                        }
                        Err(err) => {
                            log::warn!("{name}: no image for observer at iteration {}: {err}", i + 1)
                        }
                    }
                }
            }

            if let (Some(tolerance), Some(previous), Some(current)) =
                (tolerance, previous.as_ref(), self.primal())
            {
                if relative_change(&current, previous) < tolerance {
                    status = SolverStatus::Converged;
                    break;
                }
            }
        }

        self.core_mut().status = status;
        log::info!(
            "{name}: {} iterations in {:.3?} ({:?})",
            self.core().iterations(),
            start.elapsed(),
            status
        );
        self.form_image()
    }
}
