mod common;

use common::{pseudo_random, spot_psf};
use lensless_recon::observer::{IterationEvent, ObserverError};
use lensless_recon::{
    Algorithm, ApplyOptions, ChannelObserver, DivergencePolicy, ForwardModel, IterationObserver,
    Precision, Prior, ReconConfig, ReconError, ReconFloat, Reconstructor, SolverStatus,
};
use ndarray::{Array4, ArrayView4};
use std::sync::Arc;

const CLASSIC: [Algorithm; 4] = [
    Algorithm::GradientDescent,
    Algorithm::NesterovGradientDescent,
    Algorithm::Fista,
    Algorithm::Admm,
];

fn config<T: ReconFloat>(algorithm: Algorithm, n_iter: usize) -> ReconConfig {
    ReconConfig {
        algorithm,
        precision: T::PRECISION,
        n_iter,
        ..Default::default()
    }
}

fn measurement<T: ReconFloat>(
    psf: &Array4<T>,
    seed: u64,
) -> (Arc<ForwardModel<T>>, Array4<T>) {
    let model = Arc::new(ForwardModel::new(psf.view(), true).unwrap());
    let scene = pseudo_random::<T>(psf.dim(), seed);
    let y = model.forward(scene.view()).unwrap();
    (model, y)
}

/// Records how often it was called and the last image it saw.
#[derive(Default)]
struct Recorder {
    calls: Vec<usize>,
    last: Option<Array4<f64>>,
}

impl IterationObserver<f64> for Recorder {
    fn on_iteration(
        &mut self,
        iteration: usize,
        estimate: ArrayView4<'_, f64>,
        _event: &IterationEvent<'_>,
    ) -> Result<(), ObserverError> {
        self.calls.push(iteration);
        self.last = Some(estimate.to_owned());
        Ok(())
    }
}

fn check_all_algorithms<T: ReconFloat>() {
    let psf = spot_psf::<T>((1, 12, 16, 3));
    let (model, y) = measurement(&psf, 3);
    for algorithm in Algorithm::ALL {
        let mut reconstructor = Reconstructor::with_model(model.clone(), &config::<T>(algorithm, 5)).unwrap();
        reconstructor.set_data(y.clone()).unwrap();
        assert_eq!(reconstructor.status(), SolverStatus::DataSet);
        let out = reconstructor.apply(&ApplyOptions::default(), None).unwrap();
        assert_eq!(out.shape(), &[1, 12, 16, 3], "{algorithm}");
        assert!(out.iter().all(|&x| x >= T::zero()), "{algorithm}");
        assert_eq!(reconstructor.iterations(), 5);
        assert_eq!(reconstructor.status(), SolverStatus::MaxIterReached);
    }
}

#[test]
fn test_every_algorithm_in_single_precision() {
    check_all_algorithms::<f32>();
}

#[test]
fn test_every_algorithm_in_double_precision() {
    check_all_algorithms::<f64>();
}

#[test]
fn test_admm_on_camera_sized_input() {
    let psf = spot_psf::<f32>((1, 32, 64, 3));
    let (_, y) = measurement(&psf, 5);
    let mut reconstructor =
        Reconstructor::from_config(psf.view(), &config::<f32>(Algorithm::Admm, 5)).unwrap();
    reconstructor.set_data(y).unwrap();
    let out = reconstructor.apply(&ApplyOptions::default(), None).unwrap();
    assert_eq!(out.shape(), &[1, 32, 64, 3]);
    assert!(out.iter().all(|&x| x.is_finite() && x >= 0.0));
}

#[test]
fn test_depth_psf() {
    let psf = spot_psf::<f64>((2, 10, 12, 1));
    let (model, y) = measurement(&psf, 7);
    assert_eq!(y.shape(), &[1, 10, 12, 1]);
    for algorithm in CLASSIC {
        let mut reconstructor = Reconstructor::with_model(model.clone(), &config::<f64>(algorithm, 4)).unwrap();
        reconstructor.set_data(y.clone()).unwrap();
        let out = reconstructor.apply(&ApplyOptions::default(), None).unwrap();
        assert_eq!(out.shape(), &[2, 10, 12, 1], "{algorithm}");
    }
}

#[test]
fn test_runs_are_deterministic() {
    let psf = spot_psf::<f32>((1, 9, 11, 3));
    let (model, y) = measurement(&psf, 9);
    for algorithm in Algorithm::ALL {
        let run = || {
            let mut r = Reconstructor::with_model(model.clone(), &config::<f32>(algorithm, 6)).unwrap();
            r.set_data(y.clone()).unwrap();
            r.apply(&ApplyOptions::default(), None).unwrap()
        };
        assert_eq!(run(), run(), "{algorithm}");
    }
}

#[test]
fn test_reset_matches_fresh_solver() {
    let psf = spot_psf::<f64>((1, 8, 8, 1));
    let (model, y) = measurement(&psf, 11);
    let other = pseudo_random::<f64>((1, 8, 8, 1), 21);
    for algorithm in Algorithm::ALL {
        let cfg = config::<f64>(algorithm, 3);
        let mut r = Reconstructor::with_model(model.clone(), &cfg).unwrap();
        r.set_data(other.clone()).unwrap();
        r.apply(&ApplyOptions::default(), None).unwrap();
        r.reset();
        assert_eq!(r.status(), SolverStatus::DataSet);
        assert_eq!(r.iterations(), 0);
        r.set_data(y.clone()).unwrap();
        let after_reset = r.apply(&ApplyOptions::default(), None).unwrap();

        let mut fresh = Reconstructor::with_model(model.clone(), &cfg).unwrap();
        fresh.set_data(y.clone()).unwrap();
        let expected = fresh.apply(&ApplyOptions::default(), None).unwrap();
        assert_eq!(after_reset, expected, "{algorithm}");
    }
}

#[test]
fn test_apply_continues_without_reset() {
    let psf = spot_psf::<f64>((1, 8, 8, 1));
    let (model, y) = measurement(&psf, 12);
    let mut r = Reconstructor::with_model(model.clone(), &config::<f64>(Algorithm::GradientDescent, 4)).unwrap();
    r.set_data(y.clone()).unwrap();
    r.apply(&ApplyOptions::iterations(2), None).unwrap();
    let resumed = r.apply(&ApplyOptions::iterations(2), None).unwrap();

    let mut straight = Reconstructor::with_model(model, &config::<f64>(Algorithm::GradientDescent, 4)).unwrap();
    straight.set_data(y).unwrap();
    let expected = straight.apply(&ApplyOptions::default(), None).unwrap();
    assert_eq!(resumed, expected);
}

#[test]
fn test_apply_before_set_data() {
    let psf = spot_psf::<f32>((1, 6, 6, 1));
    let mut r = Reconstructor::from_config(psf.view(), &config::<f32>(Algorithm::Fista, 3)).unwrap();
    assert!(matches!(
        r.apply(&ApplyOptions::default(), None),
        Err(ReconError::MissingData)
    ));
}

#[test]
fn test_measurement_shape_is_checked() {
    let psf = spot_psf::<f32>((1, 6, 6, 3));
    let mut r = Reconstructor::from_config(psf.view(), &config::<f32>(Algorithm::Admm, 3)).unwrap();
    let err = r.set_data(Array4::zeros((1, 6, 6, 1))).unwrap_err();
    assert!(matches!(err, ReconError::ShapeMismatch { .. }));
}

#[test]
fn test_divergence_fails_by_default() {
    let psf = spot_psf::<f64>((1, 6, 7, 1));
    let mut y = Array4::<f64>::zeros((1, 6, 7, 1));
    y[[0, 2, 3, 0]] = f64::NAN;
    for algorithm in CLASSIC {
        let mut r = Reconstructor::from_config(psf.view(), &config::<f64>(algorithm, 10)).unwrap();
        r.set_data(y.clone()).unwrap();
        let err = r.apply(&ApplyOptions::default(), None).unwrap_err();
        assert!(matches!(err, ReconError::NumericalDivergence { iteration: 0 }), "{algorithm}");
        assert!(err.is_recoverable());
        assert_eq!(r.status(), SolverStatus::Diverged);
    }
}

#[test]
fn test_divergence_can_be_abandoned() {
    let psf = spot_psf::<f64>((1, 6, 7, 1));
    let mut y = Array4::<f64>::zeros((1, 6, 7, 1));
    y[[0, 1, 1, 0]] = f64::INFINITY;
    let mut cfg = config::<f64>(Algorithm::Fista, 10);
    cfg.divergence = DivergencePolicy::Abandon;
    let mut r = Reconstructor::from_config(psf.view(), &cfg).unwrap();
    r.set_data(y).unwrap();
    let out = r.apply(&ApplyOptions::default(), None).unwrap();
    assert_eq!(r.status(), SolverStatus::Abandoned);
    assert_eq!(r.iterations(), 0);
    assert!(out.iter().all(|x| x.is_finite()));
}

#[test]
fn test_observer_does_not_change_result() {
    let psf = spot_psf::<f64>((1, 8, 9, 1));
    let (model, y) = measurement(&psf, 13);
    for algorithm in CLASSIC {
        let mut quiet = Reconstructor::with_model(model.clone(), &config::<f64>(algorithm, 6)).unwrap();
        quiet.set_data(y.clone()).unwrap();
        let expected = quiet.apply(&ApplyOptions::default(), None).unwrap();

        let mut observed = Reconstructor::with_model(model.clone(), &config::<f64>(algorithm, 6)).unwrap();
        observed.set_data(y.clone()).unwrap();
        let mut recorder = Recorder::default();
        let options = ApplyOptions::default().with_display(2, true, None);
        let out = observed.apply(&options, Some(&mut recorder)).unwrap();

        assert_eq!(out, expected, "{algorithm}");
        assert_eq!(recorder.calls, vec![2, 4, 6]);
        assert_eq!(recorder.last.as_ref(), Some(&out));
    }
}

#[test]
fn test_observer_needs_plot_or_save() {
    let psf = spot_psf::<f64>((1, 6, 6, 1));
    let (model, y) = measurement(&psf, 14);
    let mut r = Reconstructor::with_model(model, &config::<f64>(Algorithm::Fista, 4)).unwrap();
    r.set_data(y).unwrap();
    let mut recorder = Recorder::default();
    let options = ApplyOptions::default().with_display(1, false, None);
    r.apply(&options, Some(&mut recorder)).unwrap();
    assert!(recorder.calls.is_empty());
}

#[test]
fn test_channel_observer_feeds_another_thread() {
    let psf = spot_psf::<f32>((1, 6, 6, 3));
    let (model, y) = measurement(&psf, 15);
    let (tx, rx) = crossbeam_channel::unbounded();
    let consumer = std::thread::spawn(move || rx.iter().map(|s: lensless_recon::observer::IterationSnapshot<f32>| s.iteration).collect::<Vec<_>>());

    let mut r = Reconstructor::with_model(model, &config::<f32>(Algorithm::Admm, 6)).unwrap();
    r.set_data(y).unwrap();
    let mut observer = ChannelObserver::new(tx);
    let options = ApplyOptions::default().with_display(3, true, None);
    r.apply(&options, Some(&mut observer)).unwrap();
    drop(observer);
    assert_eq!(consumer.join().unwrap(), vec![3, 6]);
}

#[test]
fn test_config_selects_algorithm() {
    let json = r#"{ "algorithm": "nesterov_gradient_descent", "n_iter": 3, "precision": "float64" }"#;
    let cfg = ReconConfig::from_reader(&mut json.as_bytes()).unwrap();
    assert_eq!(cfg.precision, Precision::Float64);
    let psf = spot_psf::<f64>((1, 6, 6, 1));
    let r = Reconstructor::from_config(psf.view(), &cfg).unwrap();
    assert_eq!(r.algorithm(), Algorithm::NesterovGradientDescent);
    assert_eq!(r.n_iter(), 3);

    let err = "apgd".parse::<Algorithm>().unwrap_err();
    assert!(matches!(err, ReconError::UnsupportedAlgorithm(_)));
}

#[test]
fn test_precision_must_match() {
    let psf = spot_psf::<f32>((1, 6, 6, 1));
    let cfg = config::<f64>(Algorithm::Fista, 3);
    assert!(matches!(
        Reconstructor::from_config(psf.view(), &cfg),
        Err(ReconError::InvalidConfig(_))
    ));
}

#[test]
fn test_invalid_psf() {
    let psf = Array4::<f32>::zeros((1, 6, 6, 1));
    let cfg = config::<f32>(Algorithm::GradientDescent, 3);
    assert!(matches!(
        Reconstructor::from_config(psf.view(), &cfg),
        Err(ReconError::InvalidPsf(_))
    ));
}

fn residual(model: &ForwardModel<f64>, image: &Array4<f64>, y: &Array4<f64>) -> f64 {
    let diff = model.forward(image.view()).unwrap() - y;
    diff.iter().map(|d| d * d).sum::<f64>().sqrt()
}

#[test]
fn test_gradient_priors_from_config() {
    let psf = spot_psf::<f64>((1, 10, 12, 1));
    let (model, y) = measurement(&psf, 17);
    let priors = [
        r#"{ "kind": "total_variation", "weight": 0.0001, "inner_iter": 5 }"#,
        r#"{ "kind": "non_negative_l1", "weight": 0.0001 }"#,
    ];
    for prior in priors {
        for algorithm in ["gradient_descent", "fista"] {
            let json = format!(
                r#"{{ "algorithm": "{algorithm}", "precision": "float64", "{algorithm}": {{ "prior": {prior} }} }}"#
            );
            let mut cfg = ReconConfig::from_reader(&mut json.as_bytes()).unwrap();
            let parsed = match cfg.algorithm {
                Algorithm::Fista => cfg.fista.prior,
                _ => cfg.gradient_descent.prior,
            };
            assert!(matches!(
                parsed,
                Prior::TotalVariation { inner_iter: 5, .. } | Prior::NonNegativeL1 { .. }
            ));

            let run = |cfg: &ReconConfig| {
                let mut r = Reconstructor::with_model(model.clone(), cfg).unwrap();
                r.set_data(y.clone()).unwrap();
                r.apply(&ApplyOptions::default(), None).unwrap()
            };
            cfg.n_iter = 1;
            let early = run(&cfg);
            cfg.n_iter = 40;
            let late = run(&cfg);

            assert!(late.iter().all(|&x| x >= 0.0), "{algorithm} {prior}");
            assert!(
                residual(&model, &late, &y) < residual(&model, &early, &y),
                "{algorithm} {prior}"
            );
        }
    }
}
