mod common;

use approx::assert_relative_eq;
use common::{pseudo_random, spot_psf};
use lensless_recon::solver::AdmmStepParams;
use lensless_recon::unrolled::{Affine, FistaStepParams, Transforms, UnrolledAdmm, UnrolledFista};
use lensless_recon::{
    build_unrolled, Algorithm, ApplyOptions, ForwardModel, Precision, Reconstruct, ReconConfig,
    ReconError, Reconstructor, Unrolled,
};
use ndarray::{stack, Array4, Array5, Axis};
use std::sync::Arc;
use tempfile::TempDir;

fn batch_from(psf: &Array4<f32>, seeds: &[u64]) -> (Arc<ForwardModel<f32>>, Array5<f32>) {
    let model = Arc::new(ForwardModel::new(psf.view(), true).unwrap());
    let measurements: Vec<Array4<f32>> = seeds
        .iter()
        .map(|&seed| {
            let scene = pseudo_random::<f32>(psf.dim(), seed);
            model.forward(scene.view()).unwrap()
        })
        .collect();
    let views: Vec<_> = measurements.iter().map(|m| m.view()).collect();
    (model.clone(), stack(Axis(0), &views).unwrap())
}

#[test]
fn test_admm_batch_matches_single_calls() {
    let psf = spot_psf::<f32>((1, 32, 64, 3));
    let (model, data) = batch_from(&psf, &[1, 2]);
    let solver = UnrolledAdmm::new(model, 5).unwrap();
    let batched = solver.batch_call(data.view()).unwrap();
    assert_eq!(batched.shape(), &[2, 1, 32, 64, 3]);

    for (b, measurement) in data.axis_iter(Axis(0)).enumerate() {
        let mut single = solver.clone();
        single.set_data(measurement.to_owned()).unwrap();
        let out = single.apply(&ApplyOptions::default(), None).unwrap();
        for (x, y) in batched.index_axis(Axis(0), b).iter().zip(out.iter()) {
            assert_relative_eq!(*x, *y, epsilon = 1e-5, max_relative = 1e-5);
        }
    }
}

#[test]
fn test_fista_batch_is_order_independent() {
    let psf = spot_psf::<f32>((1, 10, 12, 3));
    let (model, data) = batch_from(&psf, &[3, 4, 5]);
    let solver = UnrolledFista::new(model, 4).unwrap();
    let forward = solver.batch_call(data.view()).unwrap();
    let reversed_input = data.slice(ndarray::s![..;-1, .., .., .., ..]).to_owned();
    let reversed = solver.batch_call(reversed_input.view()).unwrap();
    assert_eq!(forward.index_axis(Axis(0), 0), reversed.index_axis(Axis(0), 2));
    assert_eq!(forward.index_axis(Axis(0), 2), reversed.index_axis(Axis(0), 0));
}

#[test]
fn test_backward_shapes() {
    let psf = spot_psf::<f32>((1, 8, 8, 3));
    let (model, data) = batch_from(&psf, &[6, 7]);
    let solver = UnrolledFista::new(model.clone(), 3).unwrap();
    let (out, tape) = solver.batch_call_with_tape(data.view()).unwrap();
    assert_eq!(tape.batch_size(), 2);
    let grads = solver.backward(&tape, out.view()).unwrap();
    assert_eq!(grads.params.len(), 3);
    assert_eq!(grads.data.shape(), data.shape());
    assert!(grads.data.iter().all(|x| x.is_finite()));

    let wrong = Array5::<f32>::zeros((3, 1, 8, 8, 3));
    assert!(matches!(
        solver.backward(&tape, wrong.view()),
        Err(ReconError::ShapeMismatch { .. })
    ));

    let admm = UnrolledAdmm::new(model, 2).unwrap();
    let (out, tape) = admm.batch_call_with_tape(data.view()).unwrap();
    let grads = admm.backward(&tape, out.view()).unwrap();
    assert_eq!(grads.params.len(), 2);
    assert!(grads.params.iter().all(|p| p.mu1.is_finite() && p.tau.is_finite()));
}

#[test]
fn test_divergent_element_is_recoverable() {
    let psf = spot_psf::<f32>((1, 6, 6, 1));
    let (model, mut data) = batch_from(&psf, &[8, 9]);
    data[[1, 0, 2, 2, 0]] = f32::NAN;
    let solver = UnrolledAdmm::new(model, 3).unwrap();
    let err = solver.batch_call(data.view()).unwrap_err();
    assert!(matches!(err, ReconError::NumericalDivergence { iteration: 0 }));
    assert!(err.is_recoverable());
}

#[test]
fn test_transforms_and_intermediates() {
    let psf = spot_psf::<f32>((1, 8, 10, 3));
    let (_, data) = batch_from(&psf, &[10]);
    let measurement = data.index_axis(Axis(0), 0).to_owned();
    let config = ReconConfig {
        algorithm: Algorithm::UnrolledFista,
        n_iter: 4,
        ..Default::default()
    };
    let pre = Affine {
        gain: 2.0_f32,
        offset: 0.0,
    };
    let post = Affine {
        gain: 0.5_f32,
        offset: 1.0,
    };
    let transforms = Transforms {
        pre_process: Some(Arc::new(pre)),
        post_process: Some(Arc::new(post)),
    };
    let unrolled = build_unrolled(psf.view(), &config, transforms).unwrap();
    let stages = unrolled.apply_with_intermediates(measurement.view()).unwrap();

    assert_eq!(stages.pre_processed, measurement.mapv(|x| 2.0 * x));
    assert!(stages.formed.iter().all(|&x| x >= 0.0));
    assert_eq!(stages.output, stages.formed.mapv(|x| 0.5 * x + 1.0));

    let batched = unrolled.batch_call(data.view()).unwrap();
    assert_eq!(batched.index_axis(Axis(0), 0), stages.output);
}

#[test]
fn test_checkpoint_round_trip_through_config() {
    let psf = spot_psf::<f64>((1, 6, 8, 1));
    let model = Arc::new(ForwardModel::new(psf.view(), true).unwrap());
    let mut trained = UnrolledAdmm::new(model, 3).unwrap();
    let learned: Vec<_> = (1..=3)
        .map(|k| AdmmStepParams {
            mu1: 0.1 * k as f64,
            mu2: 0.01 * k as f64,
            mu3: 0.2 * k as f64,
            tau: 1e-3,
        })
        .collect();
    trained.set_parameters(learned.clone()).unwrap();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("admm.npy");
    trained.save_checkpoint(&path).unwrap();

    let mut config = ReconConfig {
        algorithm: Algorithm::UnrolledAdmm,
        precision: Precision::Float64,
        n_iter: 3,
        ..Default::default()
    };
    config.unrolled.checkpoint = Some(path.clone());
    match Reconstructor::from_config(psf.view(), &config).unwrap() {
        Reconstructor::UnrolledAdmm(solver) => assert_eq!(solver.parameters(), &learned[..]),
        other => panic!("unexpected variant {}", other.name()),
    }

    // wrong iteration count
    config.n_iter = 4;
    assert!(matches!(
        Reconstructor::from_config(psf.view(), &config),
        Err(ReconError::ShapeMismatch { .. })
    ));
}

#[test]
fn test_fista_checkpoint_and_missing_file() {
    let psf = spot_psf::<f32>((1, 6, 6, 1));
    let config = ReconConfig {
        algorithm: Algorithm::UnrolledFista,
        n_iter: 2,
        ..Default::default()
    };
    let unrolled = build_unrolled(psf.view(), &config, Transforms::default()).unwrap();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("fista.npy");
    unrolled.save_checkpoint(&path).unwrap();

    let mut with_checkpoint = config.clone();
    with_checkpoint.unrolled.checkpoint = Some(path.clone());
    let reloaded = build_unrolled(psf.view(), &with_checkpoint, Transforms::default()).unwrap();
    match (&unrolled, &reloaded) {
        (Unrolled::Fista(a), Unrolled::Fista(b)) => {
            let expected: &[FistaStepParams<f32>] = a.parameters();
            assert_eq!(b.parameters(), expected);
        }
        _ => panic!("expected unrolled FISTA"),
    }
    std::fs::remove_file(&path).unwrap();

    let err = build_unrolled(psf.view(), &with_checkpoint, Transforms::default()).unwrap_err();
    assert!(matches!(err, ReconError::MissingCheckpoint(p) if p == path));
}
