//! ADMM on the padded grid with three splits:
//!
//! * `X = Hv`: data fidelity, weight `μ1`, only the crop window sees the measurement
//! * `U = Ψv`: total variation, weight `μ2`, threshold `τ`
//! * `W = v`: non-negativity, weight `μ3`
//!
//! with duals `ξ`, `η`, `ρ`. The primal update inverts
//! `μ1·HᵀH + μ2·ΨᵀΨ + μ3·I` through [`ForwardModel::solve_normal`].

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use crate::prox::{finite_diff, finite_diff_adjoint, non_negative, soft_threshold};
use crate::solver::{DivergencePolicy, Reconstruct, SolverCore, DEFAULT_N_ITER};
use ndarray::{Array4, Array5, ArrayView4, Zip};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const DEFAULT_MU1: f64 = 1e-6;
pub const DEFAULT_MU2: f64 = 1e-5;
pub const DEFAULT_MU3: f64 = 4e-5;
pub const DEFAULT_TAU: f64 = 1e-4;

/// Penalty weights and TV threshold of one ADMM iteration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct AdmmStepParams<T> {
    pub mu1: T,
    pub mu2: T,
    pub mu3: T,
    pub tau: T,
}

impl<T: ReconFloat> Default for AdmmStepParams<T> {
    fn default() -> Self {
        AdmmStepParams {
            mu1: T::cast(DEFAULT_MU1),
            mu2: T::cast(DEFAULT_MU2),
            mu3: T::cast(DEFAULT_MU3),
            tau: T::cast(DEFAULT_TAU),
        }
    }
}

impl<T: ReconFloat> AdmmStepParams<T> {
    /// All weights positive and finite, `τ` non-negative.
    pub fn validate(&self) -> Result<()> {
        let positive = [self.mu1, self.mu2, self.mu3]
            .iter()
            .all(|&w| w.is_finite() && w > T::zero());
        if !positive || !self.tau.is_finite() || self.tau < T::zero() {
            return Err(ReconError::InvalidConfig(format!(
                "ADMM weights must be positive (mu1 {:e}, mu2 {:e}, mu3 {:e}, tau {:e})",
                self.mu1.as_f64(),
                self.mu2.as_f64(),
                self.mu3.as_f64(),
                self.tau.as_f64()
            )));
        }
        Ok(())
    }
}

/// Iterates of ADMM, all on the padded grid.
#[derive(Debug, Clone)]
pub struct AdmmState<T> {
    /// primal `v`, `(D, Hp, Wp, C)`
    pub image_est: Array4<T>,
    /// cached `Hv`, `(1, Hp, Wp, C)`
    pub forward_out: Array4<T>,
    /// cached `Ψv`, `(D, Hp, Wp, C, 2)`
    pub psi_out: Array5<T>,
    /// dual of `X = Hv`
    pub xi: Array4<T>,
    /// dual of `U = Ψv`
    pub eta: Array5<T>,
    /// dual of `W = v`
    pub rho: Array4<T>,
    /// zero-padded measurement `Cᵀy`
    pub padded_data: Array4<T>,
}

impl<T: ReconFloat> AdmmState<T> {
    /// All iterates zero.
    pub fn zeros(model: &ForwardModel<T>, padded_data: Array4<T>) -> Self {
        let [depth, _, _, channels] = model.psf_shape();
        let [ph, pw] = model.padded_shape();
        AdmmState {
            image_est: Array4::zeros((depth, ph, pw, channels)),
            forward_out: Array4::zeros((1, ph, pw, channels)),
            psi_out: Array5::zeros((depth, ph, pw, channels, 2)),
            xi: Array4::zeros((1, ph, pw, channels)),
            eta: Array5::zeros((depth, ph, pw, channels, 2)),
            rho: Array4::zeros((depth, ph, pw, channels)),
            padded_data,
        }
    }
}

/// Auxiliary variables of one iteration.
#[derive(Debug, Clone)]
pub(crate) struct Splits<T> {
    pub u: Array5<T>,
    pub x: Array4<T>,
    pub w: Array4<T>,
}

/// `(CᵀC·1 + μ1)` broadcast over `(1, Hp, Wp, C)`.
pub(crate) fn data_denominator<T: ReconFloat>(model: &ForwardModel<T>, mu1: T) -> Array4<T> {
    let mask = model.crop_mask();
    let [ph, pw] = model.padded_shape();
    Array4::from_shape_fn((1, ph, pw, model.channels()), |(_, i, j, _)| {
        mask[[i, j]] + mu1
    })
}

/// Updates of `U`, `X` and `W` from the previous primal and duals.
pub(crate) fn split_update<T: ReconFloat>(
    model: &ForwardModel<T>,
    state: &AdmmState<T>,
    p: &AdmmStepParams<T>,
) -> Splits<T> {
    let u_arg = &state.psi_out + &(&state.eta / p.mu2);
    let u = soft_threshold(&u_arg, p.tau / p.mu2);

    let mut x = &state.xi + &(&state.forward_out * p.mu1) + &state.padded_data;
    x /= &data_denominator(model, p.mu1);

    let w = non_negative(&(&(&state.rho / p.mu3) + &state.image_est));
    Splits { u, x, w }
}

/// `μ3W − ρ + Ψᵀ(μ2U − η) + Hᵀ(μ1X − ξ)`
pub(crate) fn primal_rhs<T: ReconFloat>(
    model: &ForwardModel<T>,
    state: &AdmmState<T>,
    splits: &Splits<T>,
    p: &AdmmStepParams<T>,
) -> Result<Array4<T>> {
    let tv_term = finite_diff_adjoint((&splits.u * p.mu2 - &state.eta).view());
    let data_term = model.correlate_padded((&splits.x * p.mu1 - &state.xi).view())?;
    Ok(&splits.w * p.mu3 - &state.rho + tv_term + data_term)
}

/// One full ADMM iteration in place.
pub(crate) fn admm_step<T: ReconFloat>(
    model: &ForwardModel<T>,
    state: &mut AdmmState<T>,
    p: &AdmmStepParams<T>,
) -> Result<()> {
    let splits = split_update(model, state, p);
    let rhs = primal_rhs(model, state, &splits, p)?;
    state.image_est = model.solve_normal(rhs.view(), p.mu1, p.mu2, p.mu3)?;
    state.forward_out = model.convolve_padded(state.image_est.view())?;
    state.psi_out = finite_diff(state.image_est.view());

    // dual ascent
    Zip::from(&mut state.xi)
        .and(&state.forward_out)
        .and(&splits.x)
        .for_each(|xi, &hv, &x| *xi = *xi + p.mu1 * (hv - x));
    Zip::from(&mut state.eta)
        .and(&state.psi_out)
        .and(&splits.u)
        .for_each(|eta, &psi, &u| *eta = *eta + p.mu2 * (psi - u));
    Zip::from(&mut state.rho)
        .and(&state.image_est)
        .and(&splits.w)
        .for_each(|rho, &v, &w| *rho = *rho + p.mu3 * (v - w));
    Ok(())
}

/// Cropped primal clamped at zero, `(D, H, W, C)`.
pub(crate) fn admm_image<T: ReconFloat>(
    model: &ForwardModel<T>,
    state: &AdmmState<T>,
) -> Result<Array4<T>> {
    Ok(non_negative(&model.crop(state.image_est.view())?))
}

/// Classic ADMM with fixed weights.
#[derive(Debug, Clone)]
pub struct Admm<T: ReconFloat> {
    core: SolverCore<T>,
    params: AdmmStepParams<T>,
    state: Option<AdmmState<T>>,
}

impl<T: ReconFloat> Admm<T> {
    pub fn new(model: Arc<ForwardModel<T>>) -> Self {
        Admm {
            core: SolverCore::new(model, DEFAULT_N_ITER),
            params: AdmmStepParams::default(),
            state: None,
        }
    }

    pub fn with_params(mut self, params: AdmmStepParams<T>) -> Result<Self> {
        params.validate()?;
        self.params = params;
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

    pub fn params(&self) -> &AdmmStepParams<T> {
        &self.params
    }
}

impl<T: ReconFloat> Reconstruct<T> for Admm<T> {
    type State = AdmmState<T>;

    fn name(&self) -> &'static str {
        "admm"
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

    fn initial_state(&self, data: &Array4<T>) -> Result<Self::State> {
        let model = self.core.model();
        Ok(AdmmState::zeros(model, model.pad(data.view())?))
    }

    fn update(&mut self, _iteration: usize) -> Result<()> {
        let state = self.state.as_mut().ok_or(ReconError::MissingData)?;
        admm_step(self.core.model(), state, &self.params)
    }

    fn primal(&self) -> Option<ArrayView4<'_, T>> {
        self.state.as_ref().map(|s| s.image_est.view())
    }

    fn form_image(&self) -> Result<Array4<T>> {
        let state = self.state.as_ref().ok_or(ReconError::MissingData)?;
        admm_image(self.core.model(), state)
    }
}
