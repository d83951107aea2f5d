//! FISTA: proximal gradient with the momentum sequence of Beck and Teboulle.

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use crate::prox::Prior;
use crate::solver::gradient_descent::{check_initial, check_step, data_gradient, finish_image};
use crate::solver::{DivergencePolicy, Reconstruct, SolverCore, DEFAULT_N_ITER};
use ndarray::{Array4, ArrayView4};
use std::sync::Arc;

/// Next element of the momentum sequence, `(1 + √(1 + 4t²)) / 2`.
pub fn next_momentum<T: ReconFloat>(tk: T) -> T {
    let one = T::one();
    (one + (one + T::cast(4.0) * tk * tk).sqrt()) / T::cast(2.0)
}

/// One iteration from the extrapolated point `v` and the previous proximal output
/// `xk`, with step `alpha` and momentum pair `(t_k, t_{k+1})`.
///
/// Returns the next extrapolated point and the new proximal output.
#[allow(clippy::too_many_arguments)]
pub(crate) fn fista_step<T: ReconFloat>(
    model: &ForwardModel<T>,
    prior: &Prior,
    v: &Array4<T>,
    xk: &Array4<T>,
    y: &Array4<T>,
    alpha: T,
    tk: T,
    t_next: T,
) -> Result<(Array4<T>, Array4<T>)> {
    let (gradient, _) = data_gradient(model, v.view(), y)?;
    let moved = v - &(gradient * alpha);
    let x = prior.proximal(moved.view(), alpha);
    let beta = (tk - T::one()) / t_next;
    let v_next = &x + &((&x - xk) * beta);
    Ok((v_next, x))
}

#[derive(Debug, Clone)]
pub struct FistaState<T> {
    /// extrapolated point `v` where the gradient is evaluated
    pub image_est: Array4<T>,
    /// last proximal output `x_k`
    pub xk: Array4<T>,
    pub tk: T,
}

/// `x_k = P(v − α∇f(v))`, `v ← x_k + ((t_k − 1)/t_{k+1})·(x_k − x_{k−1})`
#[derive(Debug, Clone)]
pub struct Fista<T: ReconFloat> {
    core: SolverCore<T>,
    prior: Prior,
    alpha: T,
    tk: T,
    initial_estimate: Option<Array4<T>>,
    state: Option<FistaState<T>>,
}

impl<T: ReconFloat> Fista<T> {
    /// Step `1 / L`, `t_0 = 1`, non-negativity prior.
    pub fn new(model: Arc<ForwardModel<T>>) -> Self {
        let alpha = T::one() / model.lipschitz();
        Fista {
            core: SolverCore::new(model, DEFAULT_N_ITER),
            prior: Prior::default(),
            alpha,
            tk: T::one(),
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

    /// Initial momentum parameter `t_0 >= 1`.
    pub fn with_tk(mut self, tk: T) -> Result<Self> {
        if !(tk >= T::one() && tk.is_finite()) {
            return Err(ReconError::InvalidConfig(format!(
                "tk must be at least 1, got {}",
                tk.as_f64()
            )));
        }
        self.tk = tk;
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

    pub fn tk(&self) -> T {
        self.tk
    }
}

impl<T: ReconFloat> Reconstruct<T> for Fista<T> {
    type State = FistaState<T>;

    fn name(&self) -> &'static str {
        "fista"
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
        Ok(FistaState {
            xk: image_est.clone(),
            image_est,
            tk: self.tk,
        })
    }

    fn update(&mut self, _iteration: usize) -> Result<()> {
        let data = self.core.data()?;
        let state = self.state.as_mut().ok_or(ReconError::MissingData)?;
        let t_next = next_momentum(state.tk);
        let (v_next, x) = fista_step(
            self.core.model(),
            &self.prior,
            &state.image_est,
            &state.xk,
            data,
            self.alpha,
            state.tk,
            t_next,
        )?;
        state.image_est = v_next;
        state.xk = x;
        state.tk = t_next;
        Ok(())
    }

    fn primal(&self) -> Option<ArrayView4<'_, T>> {
        self.state.as_ref().map(|s| s.xk.view())
    }

    fn form_image(&self) -> Result<Array4<T>> {
        let state = self.state.as_ref().ok_or(ReconError::MissingData)?;
        Ok(finish_image(&self.prior, &state.xk))
    }
}
