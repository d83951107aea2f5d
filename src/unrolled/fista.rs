//! Unrolled FISTA with a learnable step `α_k` and momentum value `t_{k+1}` per
//! iteration. The proximal step is the non-negativity projection.

use crate::error::{ReconError, Result};
use crate::float::ReconFloat;
use crate::forward_model::ForwardModel;
use crate::math_tools::{all_finite, inner};
use crate::prox::{non_negative, non_negative_mask, Prior};
use crate::solver::fista::{fista_step, next_momentum};
use crate::solver::gradient_descent::{check_step, data_gradient};
use crate::solver::{Reconstruct, SolverCore};
use crate::unrolled::checkpoint::{load_params, save_params};
use crate::unrolled::{
    check_batch, check_grad_output, stack_batch, sum_params, Gradients, ImageTransform,
    Intermediates, StepParams, Tape, Transforms,
};
use ndarray::{Array4, Array5, ArrayView4, ArrayView5, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

/// Scalars of one FISTA iteration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct FistaStepParams<T> {
    /// gradient step
    pub alpha: T,
    /// momentum value `t_{k+1}` reached after this iteration
    pub t_next: T,
}

impl<T: ReconFloat> StepParams<T> for FistaStepParams<T> {
    const NAMES: &'static [&'static str] = &["alpha", "t_next"];

    fn to_row(&self) -> Vec<T> {
        vec![self.alpha, self.t_next]
    }

    fn from_row(row: &[T]) -> Self {
        FistaStepParams {
            alpha: row[0],
            t_next: row[1],
        }
    }
}

/// Iterates of a single-measurement run.
#[derive(Debug, Clone)]
pub struct UnrolledFistaState<T> {
    pub image_est: Array4<T>,
    pub xk: Array4<T>,
    /// pre-processed measurement
    pub measurement: Array4<T>,
}

/// Iterates of one batch element: `(v_k, x_k)` for `k = 0..=n_iter`.
#[derive(Debug, Clone)]
pub struct FistaTapeEntry<T> {
    input: Array4<T>,
    pre_processed: Array4<T>,
    iterates: Vec<(Array4<T>, Array4<T>)>,
    formed: Array4<T>,
}

struct ElementRun<T> {
    output: Array4<T>,
    pre_processed: Array4<T>,
    formed: Array4<T>,
    iterates: Vec<(Array4<T>, Array4<T>)>,
}

#[derive(Debug, Clone)]
pub struct UnrolledFista<T: ReconFloat> {
    core: SolverCore<T>,
    params: Vec<FistaStepParams<T>>,
    t0: T,
    learn_tk: bool,
    transforms: Transforms<T>,
    state: Option<UnrolledFistaState<T>>,
}

impl<T: ReconFloat> UnrolledFista<T> {
    /// `n_iter` iterations initialised like classic FISTA: `α = 1/L` and the
    /// momentum sequence starting from `t_0 = 1`.
    pub fn new(model: Arc<ForwardModel<T>>, n_iter: usize) -> Result<Self> {
        if n_iter == 0 {
            return Err(ReconError::InvalidConfig(
                "unrolled FISTA needs at least one iteration".to_string(),
            ));
        }
        let alpha = T::one() / model.lipschitz();
        let mut solver = UnrolledFista {
            core: SolverCore::new(model, n_iter),
            params: Vec::with_capacity(n_iter),
            t0: T::one(),
            learn_tk: true,
            transforms: Transforms::default(),
            state: None,
        };
        solver.params = default_params(alpha, solver.t0, n_iter);
        Ok(solver)
    }

    /// Restarts the momentum sequence from `t0` and keeps the steps.
    pub fn with_tk(mut self, t0: T) -> Result<Self> {
        if !(t0 >= T::one() && t0.is_finite()) {
            return Err(ReconError::InvalidConfig(format!(
                "tk must be at least 1, got {}",
                t0.as_f64()
            )));
        }
        self.t0 = t0;
        let mut t = t0;
        for p in self.params.iter_mut() {
            t = next_momentum(t);
            p.t_next = t;
        }
        Ok(self)
    }

    /// Sets the same step for every iteration.
    pub fn with_alpha(mut self, alpha: T) -> Result<Self> {
        let alpha = check_step("alpha", alpha)?;
        self.params.iter_mut().for_each(|p| p.alpha = alpha);
        Ok(self)
    }

    /// When false the momentum sequence is frozen and its gradients are zero.
    pub fn with_learn_tk(mut self, learn_tk: bool) -> Self {
        self.learn_tk = learn_tk;
        self
    }

    pub fn with_pre_process(mut self, transform: Arc<dyn ImageTransform<T>>) -> Self {
        self.transforms.pre_process = Some(transform);
        self
    }

    pub fn with_post_process(mut self, transform: Arc<dyn ImageTransform<T>>) -> Self {
        self.transforms.post_process = Some(transform);
        self
    }

    pub fn learn_tk(&self) -> bool {
        self.learn_tk
    }

    pub fn t0(&self) -> T {
        self.t0
    }

    pub fn parameters(&self) -> &[FistaStepParams<T>] {
        &self.params
    }

    /// Replaces the learnable scalars; the count must equal `n_iter`.
    pub fn set_parameters(&mut self, params: Vec<FistaStepParams<T>>) -> Result<()> {
        if params.len() != self.params.len() {
            return Err(ReconError::shape(
                "set_parameters",
                &[self.params.len()],
                &[params.len()],
            ));
        }
        for p in &params {
            let valid = |x: T| x.is_finite() && x > T::zero();
            if !(valid(p.alpha) && valid(p.t_next)) {
                return Err(ReconError::InvalidConfig(format!(
                    "invalid FISTA step parameters {p:?}"
                )));
            }
        }
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

    /// `t_k` for iteration `k`.
    fn t_at(&self, k: usize) -> T {
        if k == 0 {
            self.t0
        } else {
            self.params[k - 1].t_next
        }
    }

    fn run_element(&self, measurement: ArrayView4<T>, record: bool) -> Result<ElementRun<T>> {
        let model = self.core.model();
        let pre_processed = self.transforms.pre(measurement)?;
        let mut v = model.half_intensity_image();
        let mut xk = v.clone();
        let mut iterates = Vec::new();
        for (k, p) in self.params.iter().enumerate() {
            if record {
                iterates.push((v.clone(), xk.clone()));
            }
            let (v_next, x) = fista_step(
                model,
                &Prior::NonNegative,
                &v,
                &xk,
                &pre_processed,
                p.alpha,
                self.t_at(k),
                p.t_next,
            )?;
            if !all_finite(&x) {
                log::error!("unrolled_fista: numerical divergence at iteration {k}");
                return Err(ReconError::NumericalDivergence { iteration: k });
            }
            v = v_next;
            xk = x;
        }
        let formed = non_negative(&xk);
        let output = self.transforms.post(formed.view())?;
        if record {
            iterates.push((v, xk));
        }
        Ok(ElementRun {
            output,
            pre_processed,
            formed,
            iterates,
        })
    }

    /// Runs the pipeline on every element of `(B, 1, H, W, C)`, returning `(B, D, H, W, C)`.
    pub fn batch_call(&self, data: ArrayView5<T>) -> Result<Array5<T>> {
        check_batch(self.core.model(), data)?;
        let outputs = data
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|measurement| self.run_element(measurement, false).map(|run| run.output))
            .collect::<Result<Vec<_>>>()?;
        stack_batch(&outputs)
    }

    /// Like [`Self::batch_call`] and records the iterates needed by [`Self::backward`].
    pub fn batch_call_with_tape(
        &self,
        data: ArrayView5<T>,
    ) -> Result<(Array5<T>, Tape<FistaTapeEntry<T>>)> {
        check_batch(self.core.model(), data)?;
        let runs = data
            .axis_iter(Axis(0))
            .into_par_iter()
            .map(|measurement| {
                self.run_element(measurement, true).map(|run| {
                    let entry = FistaTapeEntry {
                        input: measurement.to_owned(),
                        pre_processed: run.pre_processed,
                        iterates: run.iterates,
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
        tape: &Tape<FistaTapeEntry<T>>,
        grad_output: ArrayView5<T>,
    ) -> Result<Gradients<FistaStepParams<T>, T>> {
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
        entry: &FistaTapeEntry<T>,
        grad_output: ArrayView4<T>,
    ) -> Result<(Vec<FistaStepParams<T>>, Array4<T>)> {
        let model = self.core.model();
        let n_iter = self.params.len();
        if entry.iterates.len() != n_iter + 1 {
            return Err(ReconError::shape(
                "backward",
                &[n_iter + 1],
                &[entry.iterates.len()],
            ));
        }
        let y = &entry.pre_processed;
        let mut grads = vec![FistaStepParams::<T>::zero(); n_iter];

        // formed = max(x_N, 0)
        let grad_formed = self.transforms.post_vjp(entry.formed.view(), grad_output)?;
        let (_, x_last) = &entry.iterates[n_iter];
        let mut xk_bar = grad_formed * non_negative_mask(x_last);
        let mut v_bar = Array4::<T>::zeros(xk_bar.raw_dim());
        let mut y_bar = Array4::<T>::zeros(y.raw_dim());

        for k in (0..n_iter).rev() {
            let (v, xk_prev) = &entry.iterates[k];
            let (_, x) = &entry.iterates[k + 1];
            let p = self.params[k];
            let (tk, t_next) = (self.t_at(k), p.t_next);
            let beta = (tk - T::one()) / t_next;

            // v' = x + β(x − x_{k−1}), x_k' = x
            let x_bar = &xk_bar + &(&v_bar * (T::one() + beta));
            let beta_bar = inner(&v_bar, &(x - xk_prev));
            let xk_prev_bar = &v_bar * (-beta);

            // x = max(z, 0), z = v − α·Aᵀ(Av − y)
            let (gradient, _) = data_gradient(model, v.view(), y)?;
            let z = v - &(&gradient * p.alpha);
            let z_bar = x_bar * non_negative_mask(&z);
            grads[k].alpha = -inner(&z_bar, &gradient);
            let a_z = model.forward(z_bar.view())?;
            let ata_z = model.adjoint(a_z.view())?;
            y_bar = y_bar + &(&a_z * p.alpha);
            v_bar = &z_bar - &(ata_z * p.alpha);
            xk_bar = xk_prev_bar;

            if self.learn_tk {
                grads[k].t_next -= beta_bar * (tk - T::one()) / (t_next * t_next);
                if k > 0 {
                    grads[k - 1].t_next += beta_bar / t_next;
                }
            }
        }

        let data_bar = self
            .transforms
            .pre_vjp(entry.input.view(), y_bar.view())?;
        Ok((grads, data_bar))
    }

    /// Single-measurement run returning every stage of the pipeline.
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

fn default_params<T: ReconFloat>(alpha: T, t0: T, n_iter: usize) -> Vec<FistaStepParams<T>> {
    let mut t = t0;
    (0..n_iter)
        .map(|_| {
            t = next_momentum(t);
            FistaStepParams { alpha, t_next: t }
        })
        .collect()
}

impl<T: ReconFloat> Reconstruct<T> for UnrolledFista<T> {
    type State = UnrolledFistaState<T>;

    fn name(&self) -> &'static str {
        "unrolled_fista"
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
        let image_est = self.core.model().half_intensity_image();
        Ok(UnrolledFistaState {
            xk: image_est.clone(),
            image_est,
            measurement: self.transforms.pre(data.view())?,
        })
    }

    fn update(&mut self, iteration: usize) -> Result<()> {
        let p = *self.params.get(iteration).ok_or_else(|| {
            ReconError::InvalidConfig(format!(
                "unrolled FISTA has {} iterations, iteration {iteration} requested",
                self.params.len()
            ))
        })?;
        let tk = self.t_at(iteration);
        let state = self.state.as_mut().ok_or(ReconError::MissingData)?;
        let (v_next, x) = fista_step(
            self.core.model(),
            &Prior::NonNegative,
            &state.image_est,
            &state.xk,
            &state.measurement,
            p.alpha,
            tk,
            p.t_next,
        )?;
        state.image_est = v_next;
        state.xk = x;
        Ok(())
    }

    fn primal(&self) -> Option<ArrayView4<'_, T>> {
        self.state.as_ref().map(|s| s.xk.view())
    }

    fn form_image(&self) -> Result<Array4<T>> {
        let state = self.state.as_ref().ok_or(ReconError::MissingData)?;
        self.transforms.post(non_negative(&state.xk).view())
    }

    fn supports_early_stopping(&self) -> bool {
        false
    }

    fn max_iterations(&self) -> Option<usize> {
        Some(self.params.len())
    }
}
