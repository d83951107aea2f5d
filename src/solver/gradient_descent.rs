//! Proximal gradient descent and its Nesterov-accelerated variant.
//!
//! Both minimise `½‖Ax − y‖² + g(x)` where `g` is the configured [`Prior`], taking
//! a gradient step on the data term followed by the proximal operator of `g`.

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use crate::math_tools::{inner, norm};
use crate::prox::{non_negative, Prior};
use crate::solver::{DivergencePolicy, Reconstruct, SolverCore, DEFAULT_N_ITER};
use ndarray::{Array4, ArrayView4};
use std::sync::Arc;

/// Upper bound on step halvings per iteration of the line search.
const MAX_BACKTRACK: usize = 30;

/// Default step is `1.8 / L`, inside the `2 / L` stability bound.
pub const DEFAULT_STEP_FACTOR: f64 = 1.8;

/// Default Nesterov momentum.
pub const DEFAULT_MOMENTUM: f64 = 0.9;

/// `(Aᵀ(Ax − y), Ax − y)`
pub(crate) fn data_gradient<T: ReconFloat>(
    model: &ForwardModel<T>,
    x: ArrayView4<T>,
    y: &Array4<T>,
) -> Result<(Array4<T>, Array4<T>)> {
    let residual = model.forward(x)? - y;
    let gradient = model.adjoint(residual.view())?;
    Ok((gradient, residual))
}

/// Clamps the estimate when the prior restricts it to non-negative values.
pub(crate) fn finish_image<T: ReconFloat>(prior: &Prior, x: &Array4<T>) -> Array4<T> {
    if prior.enforces_non_negativity() {
        non_negative(x)
    } else {
        x.clone()
    }
}

pub(crate) fn check_step<T: ReconFloat>(name: &str, value: T) -> Result<T> {
    if value.is_finite() && value > T::zero() {
        Ok(value)
    } else {
        Err(ReconError::InvalidConfig(format!(
            "{name} must be positive and finite, got {}",
            value.as_f64()
        )))
    }
}

pub(crate) fn check_initial<T: ReconFloat>(
    model: &ForwardModel<T>,
    estimate: &Array4<T>,
) -> Result<()> {
    let expected = model.psf_shape();
    if estimate.shape() != expected {
        return Err(ReconError::shape("initial_estimate", &expected, estimate.shape()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct GradientDescentState<T> {
    /// current estimate `(D, H, W, C)`
    pub image_est: Array4<T>,
    /// step accepted by the last line search (or the fixed step)
    pub step: T,
}

/// `x ← P(x − α·Aᵀ(Ax − y))`
#[derive(Debug, Clone)]
pub struct GradientDescent<T: ReconFloat> {
    core: SolverCore<T>,
    prior: Prior,
    alpha: T,
    line_search: bool,
    initial_estimate: Option<Array4<T>>,
    state: Option<GradientDescentState<T>>,
}

impl<T: ReconFloat> GradientDescent<T> {
    pub fn new(model: Arc<ForwardModel<T>>) -> Self {
        let alpha = T::cast(DEFAULT_STEP_FACTOR) / model.lipschitz();
        GradientDescent {
            core: SolverCore::new(model, DEFAULT_N_ITER),
            prior: Prior::default(),
            alpha,
            line_search: false,
            initial_estimate: None,
            state: None,
        }
    }

    pub fn with_prior(mut self, prior: Prior) -> Result<Self> {
        if !prior.is_valid() {
            return Err(ReconError::InvalidConfig(format!("invalid prior {prior:?}")));
        }
        self.prior = prior;
        Ok(self)
    }

    pub fn with_alpha(mut self, alpha: T) -> Result<Self> {
        self.alpha = check_step("alpha", alpha)?;
        Ok(self)
    }

    /// Enables backtracking: the step is halved until the quadratic upper bound
    /// of the data term holds at the new point.
    pub fn with_line_search(mut self, enabled: bool) -> Self {
        self.line_search = enabled;
        self
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.core.set_n_iter(n_iter);
        self
    }

    pub fn with_divergence_policy(mut self, policy: DivergencePolicy) -> Self {
        self.core.set_divergence_policy(policy);
        self
    }

    /// Starting point instead of the half-intensity image.
    pub fn with_initial_estimate(mut self, estimate: Array4<T>) -> Result<Self> {
        check_initial(self.core.model(), &estimate)?;
        self.initial_estimate = Some(estimate);
        Ok(self)
    }

    pub fn alpha(&self) -> T {
        self.alpha
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    /// `‖A x − y‖` at the current estimate.
    pub fn residual_norm(&self) -> Result<T> {
        let state = self.state.as_ref().ok_or(ReconError::MissingData)?;
        let residual = self.core.model().forward(state.image_est.view())? - self.core.data()?;
        Ok(norm(&residual))
    }
}

impl<T: ReconFloat> Reconstruct<T> for GradientDescent<T> {
    type State = GradientDescentState<T>;

    fn name(&self) -> &'static str {
        "gradient_descent"
    }

    fn core(&self) -> &SolverCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SolverCore<T> {
        &mut self.core
    }

    fn state(&self) -> Option<&Self::State> {
        self.state.as_ref()
    }

    fn replace_state(&mut self, state: Option<Self::State>) {
        self.state = state;
    }

    fn initial_state(&self, _data: &Array4<T>) -> Result<Self::State> {
        let image_est = match &self.initial_estimate {
            Some(estimate) => estimate.clone(),
            None => self.core.model().half_intensity_image(),
        };
        Ok(GradientDescentState {
            image_est,
            step: self.alpha,
        })
    }

    fn update(&mut self, _iteration: usize) -> Result<()> {
        let model = self.core.model();
        let data = self.core.data()?;
        let state = self.state.as_mut().ok_or(ReconError::MissingData)?;
        let (gradient, residual) = data_gradient(model, state.image_est.view(), data)?;

        if !self.line_search {
            let step = self.alpha;
            let moved = &state.image_est - &(&gradient * step);
            state.image_est = self.prior.proximal(moved.view(), step);
            return Ok(());
        }

        let half = T::cast(0.5);
        let objective = half * inner(&residual, &residual);
        let mut step = state.step;
        let mut attempts = 0;
        let candidate = loop {
            let moved = &state.image_est - &(&gradient * step);
            let candidate = self.prior.proximal(moved.view(), step);
            let diff = &candidate - &state.image_est;
            let candidate_residual = model.forward(candidate.view())? - data;
            let value = half * inner(&candidate_residual, &candidate_residual);
            let bound = objective
                + inner(&gradient, &diff)
                + inner(&diff, &diff) / (T::cast(2.0) * step);
            attempts += 1;
            if value <= bound || attempts >= MAX_BACKTRACK {
                break candidate;
            }
            step = step * half;
        };
        if attempts > 1 {
            log::debug!(
                "gradient_descent: line search reduced step to {:e}",
                step.as_f64()
            );
        }
        state.image_est = candidate;
        state.step = step;
        Ok(())
    }

    fn primal(&self) -> Option<ArrayView4<'_, T>> {
        self.state.as_ref().map(|s| s.image_est.view())
    }

    fn form_image(&self) -> Result<Array4<T>> {
        let state = self.state.as_ref().ok_or(ReconError::MissingData)?;
        Ok(finish_image(&self.prior, &state.image_est))
    }
}

#[derive(Debug, Clone)]
pub struct NesterovState<T> {
    pub image_est: Array4<T>,
    /// momentum `p`
    pub momentum: Array4<T>,
}

/// Gradient descent with Nesterov momentum:
/// `p ← β·p − α·∇f(x)`, `x ← P(x − β·p_prev + (1 + β)·p)`.
#[derive(Debug, Clone)]
pub struct NesterovGradientDescent<T: ReconFloat> {
    core: SolverCore<T>,
    prior: Prior,
    alpha: T,
    momentum: T,
    initial_estimate: Option<Array4<T>>,
    state: Option<NesterovState<T>>,
}

impl<T: ReconFloat> NesterovGradientDescent<T> {
    pub fn new(model: Arc<ForwardModel<T>>) -> Self {
        let alpha = T::cast(DEFAULT_STEP_FACTOR) / model.lipschitz();
        NesterovGradientDescent {
            core: SolverCore::new(model, DEFAULT_N_ITER),
            prior: Prior::default(),
            alpha,
            momentum: T::cast(DEFAULT_MOMENTUM),
            initial_estimate: None,
            state: None,
        }
    }

    pub fn with_prior(mut self, prior: Prior) -> Result<Self> {
        if !prior.is_valid() {
            return Err(ReconError::InvalidConfig(format!("invalid prior {prior:?}")));
        }
        self.prior = prior;
        Ok(self)
    }

    pub fn with_alpha(mut self, alpha: T) -> Result<Self> {
        self.alpha = check_step("alpha", alpha)?;
        Ok(self)
    }

    /// `β` must lie in `[0, 1)`.
    pub fn with_momentum(mut self, momentum: T) -> Result<Self> {
        if !(momentum >= T::zero() && momentum < T::one()) {
            return Err(ReconError::InvalidConfig(format!(
                "momentum must lie in [0, 1), got {}",
                momentum.as_f64()
            )));
        }
        self.momentum = momentum;
        Ok(self)
    }

    pub fn with_n_iter(mut self, n_iter: usize) -> Self {
        self.core.set_n_iter(n_iter);
        self
    }

    pub fn with_divergence_policy(mut self, policy: DivergencePolicy) -> Self {
        self.core.set_divergence_policy(policy);
        self
    }

    pub fn with_initial_estimate(mut self, estimate: Array4<T>) -> Result<Self> {
        check_initial(self.core.model(), &estimate)?;
        self.initial_estimate = Some(estimate);
        Ok(self)
    }

    pub fn alpha(&self) -> T {
        self.alpha
    }

    pub fn momentum(&self) -> T {
        self.momentum
    }
}

impl<T: ReconFloat> Reconstruct<T> for NesterovGradientDescent<T> {
    type State = NesterovState<T>;

    fn name(&self) -> &'static str {
        "nesterov_gradient_descent"
    }

    fn core(&self) -> &SolverCore<T> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut SolverCore<T> {
        &mut self.core
    }

    fn state(&self) -> Option<&Self::State> {
        self.state.as_ref()
    }

    fn replace_state(&mut self, state: Option<Self::State>) {
        self.state = state;
    }

    fn initial_state(&self, _data: &Array4<T>) -> Result<Self::State> {
        let image_est = match &self.initial_estimate {
            Some(estimate) => estimate.clone(),
            None => self.core.model().half_intensity_image(),
        };
        let momentum = Array4::zeros(image_est.raw_dim());
        Ok(NesterovState {
            image_est,
            momentum,
        })
    }

    fn update(&mut self, _iteration: usize) -> Result<()> {
        let data = self.core.data()?;
        let state = self.state.as_mut().ok_or(ReconError::MissingData)?;
        let (gradient, _) = data_gradient(self.core.model(), state.image_est.view(), data)?;
        let (alpha, beta) = (self.alpha, self.momentum);

        let previous = std::mem::replace(
            &mut state.momentum,
            Array4::zeros(state.image_est.raw_dim()),
        );
        state.momentum = &previous * beta - &(gradient * alpha);
        let moved = &state.image_est - &(&previous * beta) + &(&state.momentum * (T::one() + beta));
        state.image_est = self.prior.proximal(moved.view(), alpha);
        Ok(())
    }

    fn primal(&self) -> Option<ArrayView4<'_, T>> {
        self.state.as_ref().map(|s| s.image_est.view())
    }

    fn form_image(&self) -> Result<Array4<T>> {
        let state = self.state.as_ref().ok_or(ReconError::MissingData)?;
        Ok(finish_image(&self.prior, &state.image_est))
    }
}
