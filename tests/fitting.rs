use anyhow::Result;
use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, Ix2};
use parafit::kernels::DynBackend;
use parafit::optimizer::{
    ErrorMeasures, LevenbergMarquardt, NMSimplex, Optimizer, PolynomialModel, ResidualCalculator,
    Status,
};
use parafit::{Engine, EngineOptions, MetaOptimizer, MetaOptimizerConfig, Model, Precision, SampleRequest};
use parafit_backend_cpu::{CpuBackend, CpuBackendOptions};
use std::sync::Arc;

fn engine(single_batch_length: Option<usize>) -> Engine {
    let cpu: DynBackend = Arc::new(CpuBackend::new(CpuBackendOptions { threads: Some(4) }).unwrap());
    let options = EngineOptions {
        single_batch_length,
        ..EngineOptions::default()
    };
    Engine::with_backends(vec![cpu], options).unwrap()
}

/// `1.5 - 2t + 0.5t^2` observed on 12 points in `[-2, 3]`, for every instance.
fn quadratic(instances: usize) -> Result<PolynomialModel> {
    let truth = Array2::from_shape_fn((instances, 3), |(_, k)| [1.5, -2.0, 0.5][k]);
    PolynomialModel::from_coefficients(Array1::linspace(-2.0, 3.0, 12), &truth)
}

fn random_starts(engine: &Engine, instances: usize) -> Result<Array2<f64>> {
    Ok(engine
        .rand(SampleRequest::new(instances, 3).seed(2024), -5.0, 5.0)?
        .to_f64()
        .into_dimensionality::<Ix2>()?)
}

#[test]
fn levenberg_marquardt_converges_from_random_starts() -> Result<()> {
    let engine = engine(Some(3));
    let model = quadratic(10)?;
    let start = random_starts(&engine, 10)?;

    let result = LevenbergMarquardt::default().minimize(&engine, &model, &start, Precision::Double)?;
    assert_eq!(result.converged(), 10);
    for row in result.parameters.rows() {
        assert_abs_diff_eq!(row[0], 1.5, epsilon = 1e-6);
        assert_abs_diff_eq!(row[1], -2.0, epsilon = 1e-6);
        assert_abs_diff_eq!(row[2], 0.5, epsilon = 1e-6);
    }
    Ok(())
}

#[test]
fn optimizer_results_do_not_depend_on_batching() -> Result<()> {
    let model = quadratic(10)?;
    let start = random_starts(&engine(None), 10)?;
    let optimizer = NMSimplex::default();
    let whole = optimizer.minimize(&engine(None), &model, &start, Precision::Double)?;
    let batched = optimizer.minimize(&engine(Some(1)), &model, &start, Precision::Double)?;
    assert_eq!(whole, batched);
    Ok(())
}

#[test]
fn pipeline_without_extras_matches_the_primary_optimizer() -> Result<()> {
    let engine = engine(None);
    let model = quadratic(4)?;
    let start = random_starts(&engine, 4)?;

    let meta = MetaOptimizer::new(MetaOptimizerConfig::default())?
        .with_optimizer(Arc::new(LevenbergMarquardt::default()));
    let fit = meta.minimize(&engine, &model, Some(&start))?;
    let direct = LevenbergMarquardt::default().minimize(&engine, &model, &start, Precision::Double)?;

    assert_eq!(fit.parameters, direct.parameters);
    assert_eq!(fit.status, direct.status);
    assert!(fit.status.iter().all(|code| *code == Status::Success.code()));

    let residuals = ResidualCalculator::calculate(&engine, &model, &fit.parameters, Precision::Double)?;
    assert_eq!(residuals.dim(), (4, 12));
    let errors = ErrorMeasures::calculate(&residuals);
    assert_eq!(fit.maps["Errors.sse"], errors["Errors.sse"]);
    for name in model.parameter_names() {
        assert_eq!(fit.maps[&name].len(), 4);
    }
    Ok(())
}

#[test]
fn single_precision_fits_stay_close() -> Result<()> {
    let engine = engine(Some(2));
    let model = quadratic(3)?;
    let result = LevenbergMarquardt::default().minimize(
        &engine,
        &model,
        &model.initial_parameters(),
        Precision::Single,
    )?;
    for row in result.parameters.rows() {
        assert_abs_diff_eq!(row[0], 1.5, epsilon = 1e-2);
        assert_abs_diff_eq!(row[2], 0.5, epsilon = 1e-2);
    }
    Ok(())
}
