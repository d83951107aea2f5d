//! Unrolled ADMM with learnable `μ1`, `μ2`, `μ3` and `τ` per iteration.
//!
//! The reverse pass uses `forward_out = Hv` and `psi_out = Ψv`, which every
//! recorded state satisfies, so the adjoint of a state reduces to the adjoints of
//! `v`, `ξ`, `η` and `ρ`.

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use crate::math_tools::{all_finite, inner};
use crate::prox::{finite_diff, finite_diff_adjoint, non_negative_mask, soft_threshold_mask};
use crate::solver::admm::{admm_image, admm_step, data_denominator, split_update};
use crate::solver::{AdmmState, AdmmStepParams, Reconstruct, SolverCore};
use crate::unrolled::checkpoint::{load_params, save_params};
use crate::unrolled::{
    check_batch, check_grad_output, stack_batch, sum_params, Gradients, ImageTransform,
    Intermediates, StepParams, Tape, Transforms,
};
use ndarray::{Array4, Array5, ArrayView4, ArrayView5, Axis, Zip};
use rayon::prelude::*;
use std::path::Path;
use std::sync::Arc;

impl<T: ReconFloat> StepParams<T> for AdmmStepParams<T> {
    const NAMES: &'static [&'static str] = &["mu1", "mu2", "mu3", "tau"];

    fn to_row(&self) -> Vec<T> {
        vec![self.mu1, self.mu2, self.mu3, self.tau]
    }

    fn from_row(row: &[T]) -> Self {
        AdmmStepParams {
            mu1: row[0],
            mu2: row[1],
            mu3: row[2],
            tau: row[3],
        }
    }
}

/// States `S_0..=S_N` of one batch element.
#[derive(Debug, Clone)]
pub struct AdmmTapeEntry<T> {
    input: Array4<T>,
    states: Vec<AdmmState<T>>,
    formed: Array4<T>,
}

impl<T> AdmmTapeEntry<T> {
    pub fn states(&self) -> &[AdmmState<T>] {
        &self.states
    }
}

/// Adjoint of an ADMM state.
struct AdmmAdjoint<T> {
    v: Array4<T>,
    xi: Array4<T>,
    eta: Array5<T>,
    rho: Array4<T>,
}

/// Pulls the adjoint of `next = step(prev)` back to `prev`.
///
/// Returns the adjoint of `prev`, the gradient of the step parameters and the
/// adjoint of the padded measurement.
fn step_vjp<T: ReconFloat>(
    model: &ForwardModel<T>,
    prev: &AdmmState<T>,
    next: &AdmmState<T>,
    p: &AdmmStepParams<T>,
    adj: AdmmAdjoint<T>,
) -> Result<(AdmmAdjoint<T>, AdmmStepParams<T>, Array4<T>)> {
    let splits = split_update(model, prev, p);
    let mut g = AdmmStepParams::<T>::zero();

    // dual ascent and the cached Hv', Ψv'
    let mut total = &adj.v + &(&adj.rho * p.mu3);
    total += &(model.correlate_padded(adj.xi.view())? * p.mu1);
    total += &(finite_diff_adjoint(adj.eta.view()) * p.mu2);
    let mut x_bar = &adj.xi * (-p.mu1);
    let mut u_bar = &adj.eta * (-p.mu2);
    let mut w_bar = &adj.rho * (-p.mu3);
    g.mu1 += inner(&adj.xi, &(&next.forward_out - &splits.x));
    g.mu2 += inner(&adj.eta, &(&next.psi_out - &splits.u));
    g.mu3 += inner(&adj.rho, &(&next.image_est - &splits.w));

    // v' = M⁻¹·rhs with M symmetric
    let r_bar = model.solve_normal(total.view(), p.mu1, p.mu2, p.mu3)?;
    let h_r = model.convolve_padded(r_bar.view())?;
    let psi_r = finite_diff(r_bar.view());
    g.mu1 -= inner(&h_r, &next.forward_out);
    g.mu2 -= inner(&psi_r, &next.psi_out);
    g.mu3 -= inner(&r_bar, &next.image_est);

    // rhs = μ3W − ρ + Ψᵀ(μ2U − η) + Hᵀ(μ1X − ξ)
    w_bar += &(&r_bar * p.mu3);
    let mut rho_bar = &adj.rho - &r_bar;
    g.mu3 += inner(&r_bar, &splits.w);
    u_bar += &(&psi_r * p.mu2);
    let mut eta_bar = &adj.eta - &psi_r;
    g.mu2 += inner(&psi_r, &splits.u);
    x_bar += &(&h_r * p.mu1);
    let mut xi_bar = &adj.xi - &h_r;
    g.mu1 += inner(&h_r, &splits.x);

    // W = max(ρ/μ3 + v, 0)
    let a_w = &(&prev.rho / p.mu3) + &prev.image_est;
    let a_w_bar = w_bar * non_negative_mask(&a_w);
    rho_bar += &(&a_w_bar / p.mu3);
    g.mu3 -= inner(&a_w_bar, &prev.rho) / (p.mu3 * p.mu3);
    let mut v_bar = a_w_bar;

    // X = (ξ + μ1·Hv + Cᵀy) / (CᵀC + μ1)
    let q = x_bar / &data_denominator(model, p.mu1);
    xi_bar += &q;
    v_bar += &(model.correlate_padded(q.view())? * p.mu1);
    g.mu1 += inner(&q, &(&prev.forward_out - &splits.x));

    // U = soft(Ψv + η/μ2, τ/μ2)
    let a_u = &prev.psi_out + &(&prev.eta / p.mu2);
    let mask = soft_threshold_mask(&a_u, p.tau / p.mu2);
    let a_u_bar = &u_bar * &mask;
    let theta_bar = -Zip::from(&u_bar)
        .and(&a_u)
        .and(&mask)
        .fold(T::zero(), |acc, &ub, &a, &m| acc + ub * a.signum() * m);
    g.tau += theta_bar / p.mu2;
    g.mu2 -= theta_bar * p.tau / (p.mu2 * p.mu2);
    v_bar += &finite_diff_adjoint(a_u_bar.view());
    eta_bar += &(&a_u_bar / p.mu2);
    g.mu2 -= inner(&a_u_bar, &prev.eta) / (p.mu2 * p.mu2);

    let adjoint = AdmmAdjoint {
        v: v_bar,
        xi: xi_bar,
        eta: eta_bar,
        rho: rho_bar,
    };
    Ok((adjoint, g, q))
}

struct ElementRun<T> {
    output: Array4<T>,
    pre_processed: Array4<T>,
    formed: Array4<T>,
    states: Vec<AdmmState<T>>,
}

#[derive(Debug, Clone)]
pub struct UnrolledAdmm<T: ReconFloat> {
    core: SolverCore<T>,
    params: Vec<AdmmStepParams<T>>,
    transforms: Transforms<T>,
    state: Option<AdmmState<T>>,
}

impl<T: ReconFloat> UnrolledAdmm<T> {
    /// `n_iter` iterations with the default weights.
    pub fn new(model: Arc<ForwardModel<T>>, n_iter: usize) -> Result<Self> {
        if n_iter == 0 {
            return Err(ReconError::InvalidConfig(
                "unrolled ADMM needs at least one iteration".to_string(),
            ));
        }
        Ok(UnrolledAdmm {
            core: SolverCore::new(model, n_iter),
            params: vec![AdmmStepParams::default(); n_iter],
            transforms: Transforms::default(),
            state: None,
        })
    }

    /// Uses `params` for every iteration.
    pub fn with_params(mut self, params: AdmmStepParams<T>) -> Result<Self> {
        params.validate()?;
        self.params.iter_mut().for_each(|p| *p = params);
        Ok(self)
    }

    pub fn with_pre_process(mut self, transform: Arc<dyn ImageTransform<T>>) -> Self {
        self.transforms.pre_process = Some(transform);
        self
    }

    pub fn with_post_process(mut self, transform: Arc<dyn ImageTransform<T>>) -> Self {
        self.transforms.post_process = Some(transform);
        self
    }

    pub fn parameters(&self) -> &[AdmmStepParams<T>] {
        &self.params
    }

    pub fn set_parameters(&mut self, params: Vec<AdmmStepParams<T>>) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(ReconError::shape(
                "set_parameters",
                &[self.params.len()],
                &[params.len()],
            ));
        }
        params.iter().try_for_each(|p| p.validate())?;
        self.params = params;
        Ok(())
    }

    pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
        save_params(path, &self.params)
    }

    pub fn load_checkpoint(&mut self, path: &Path) -> Result<()> {
        let params = load_params(path, self.params.len())?;
        self.set_parameters(params)
    }

    fn run_element(&self, measurement: ArrayView4<T>, record: bool) -> Result<ElementRun<T>> {
        let model = self.core.model();
        let pre_processed = self.transforms.pre(measurement)?;
        let mut state = AdmmState::zeros(model, model.pad(pre_processed.view())?);
        let mut states = Vec::new();
        for (k, p) in self.params.iter().enumerate() {
            if record {
                states.push(state.clone());
            }
            admm_step(model, &mut state, p)?;
            if !all_finite(&state.image_est) {
                log::error!("unrolled_admm: numerical divergence at iteration {k}");
                return Err(ReconError::NumericalDivergence { iteration: k });
            }
        }
        let formed = admm_image(model, &state)?;
        let output = self.transforms.post(formed.view())?;
        if record {
            states.push(state);
        }
        Ok(ElementRun {
            output,
            pre_processed,
            formed,
            states,
        })
    }

    /// `(B, 1, H, W, C)` measurements to `(B, D, H, W, C)` images.
    pub fn batch_call(&self, data: ArrayView5<T>) -> Result<Array5<T>> {
        check_batch(self.core.model(), data)?;
        let outputs = data
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|measurement| self.run_element(measurement, false).map(|run| run.output))
            .collect::<Result<Vec<_>>>()?;
        stack_batch(&outputs)
    }

    pub fn batch_call_with_tape(
        &self,
        data: ArrayView5<T>,
    ) -> Result<(Array5<T>, Tape<AdmmTapeEntry<T>>)> {
        check_batch(self.core.model(), data)?;
        let runs = data
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|measurement| {
                self.run_element(measurement, true).map(|run| {
                    let entry = AdmmTapeEntry {
                        input: measurement.to_owned(),
                        states: run.states,
                        formed: run.formed,
                    };
                    (run.output, entry)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let (outputs, entries): (Vec<_>, Vec<_>) = runs.into_iter().unzip();
        Ok((stack_batch(&outputs)?, Tape { entries }))
    }

    /// Gradient of `⟨grad_output, batch_call(data)⟩` for the recorded batch.
    pub fn backward(
        &self,
        tape: &Tape<AdmmTapeEntry<T>>,
        grad_output: ArrayView5<T>,
    ) -> Result<Gradients<AdmmStepParams<T>, T>> {
        check_grad_output(self.core.model(), tape.batch_size(), grad_output)?;
        let per_element = (0..tape.batch_size())
            .into_par_iter()
            .map(|b| self.backward_element(&tape.entries[b], grad_output.index_axis(Axis(0), b)))
            .collect::<Result<Vec<_>>>()?;
        let (params, data): (Vec<_>, Vec<_>) = per_element.into_iter().unzip();
        Ok(Gradients {
            params: sum_params::<T, _>(&params, self.params.len()),
            data: stack_batch(&data)?,
        })
    }

    fn backward_element(
        &self,
        entry: &AdmmTapeEntry<T>,
        grad_output: ArrayView4<T>,
    ) -> Result<(Vec<AdmmStepParams<T>>, Array4<T>)> {
        let model = self.core.model();
        let n_iter = self.params.len();
        if entry.states.len() != n_iter + 1 {
            return Err(ReconError::shape(
                "backward",
                &[n_iter + 1],
                &[entry.states.len()],
            ));
        }

        // formed = max(crop(v_N), 0)
        let grad_formed = self.transforms.post_vjp(entry.formed.view(), grad_output)?;
        let last = &entry.states[n_iter];
        let cropped = model.crop(last.image_est.view())?;
        let mut adjoint = AdmmAdjoint {
            v: model.pad((grad_formed * non_negative_mask(&cropped)).view())?,
            xi: Array4::zeros(last.xi.raw_dim()),
            eta: Array5::zeros(last.eta.raw_dim()),
            rho: Array4::zeros(last.rho.raw_dim()),
        };
        let mut padded_data_bar = Array4::<T>::zeros(last.padded_data.raw_dim());
        let mut grads = vec![AdmmStepParams::<T>::zero(); n_iter];

        for k in (0..n_iter).rev() {
            let (prev_adjoint, g, q) = step_vjp(
                model,
                &entry.states[k],
                &entry.states[k + 1],
                &self.params[k],
                adjoint,
            )?;
            adjoint = prev_adjoint;
            grads[k] = g;
            padded_data_bar += &q;
        }

        let y_bar = model.crop(padded_data_bar.view())?;
        let data_bar = self.transforms.pre_vjp(entry.input.view(), y_bar.view())?;
        Ok((grads, data_bar))
    }

    pub fn apply_with_intermediates(&self, measurement: ArrayView4<T>) -> Result<Intermediates<T>> {
        self.core.model().check_measurement(measurement)?;
        let run = self.run_element(measurement, false)?;
        Ok(Intermediates {
            pre_processed: run.pre_processed,
            formed: run.formed,
            output: run.output,
        })
    }
}

impl<T: ReconFloat> Reconstruct<T> for UnrolledAdmm<T> {
    type State = AdmmState<T>;

    fn name(&self) -> &'static str {
        "unrolled_admm"
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
        let pre_processed = self.transforms.pre(data.view())?;
        Ok(AdmmState::zeros(model, model.pad(pre_processed.view())?))
    }

    fn update(&mut self, iteration: usize) -> Result<()> {
        let p = *self.params.get(iteration).ok_or_else(|| {
            ReconError::InvalidConfig(format!(
                "unrolled ADMM has {} iterations, iteration {iteration} requested",
                self.params.len()
            ))
        })?;
        let state = self.state.as_mut().ok_or(ReconError::MissingData)?;
        admm_step(self.core.model(), state, &p)
    }

    fn primal(&self) -> Option<ArrayView4<'_, T>> {
        self.state.as_ref().map(|s| s.image_est.view())
    }

    fn form_image(&self) -> Result<Array4<T>> {
        let state = self.state.as_ref().ok_or(ReconError::MissingData)?;
        let formed = admm_image(self.core.model(), state)?;
        self.transforms.post(formed.view())
    }

    fn supports_early_stopping(&self) -> bool {
        false
    }

    fn max_iterations(&self) -> Option<usize> {
        Some(self.params.len())
    }
}
