//! Coarse grid search, used to seed the primary optimizer.

use crate::model::{Model, Objective};
use crate::optimizer::{optimizer_routine, run_optimizer, OptimizationResult, Optimizer, Status, DATA_OFFSET};
use anyhow::{bail, Result};
use ndarray::Array2;
use parafit_engine::Engine;
use parafit_ir::Precision;

/// Evaluates the objective on a regular grid and keeps the best point.
///
/// The grid spans the model's parameter bounds when it has them, otherwise
/// `x +- span * max(|x|, 1)` around each instance's starting point. The
/// starting point itself competes with the grid points.
#[derive(Debug, Clone)]
pub struct GridSearch {
    points: usize,
    span: f64,
}

impl Default for GridSearch {
    fn default() -> Self {
        Self {
            points: 5,
            span: 0.5,
        }
    }
}

impl GridSearch {
    pub fn new(points: usize, span: f64) -> Self {
        Self { points, span }
    }
}

impl Optimizer for GridSearch {
    fn name(&self) -> &str {
        "grid_search"
    }

    fn minimize(
        &self,
        engine: &Engine,
        model: &dyn Model,
        start: &Array2<f64>,
        precision: Precision,
    ) -> Result<OptimizationResult> {
        if self.points < 2 {
            bail!("grid search needs at least two points per parameter");
        }
        let bounds = model.parameter_bounds();
        if let Some(bounds) = &bounds {
            if bounds.len() != model.parameter_count() {
                bail!(
                    "model `{}` gives {} bounds for {} parameters",
                    model.name(),
                    bounds.len(),
                    model.parameter_count()
                );
            }
        }

        let objective = Objective::new(model, DATA_OFFSET)?;
        let (points, span) = (self.points, self.span);
        let routine = optimizer_routine("grid_search", model)
            .native(move |record| {
                let x0 = record.floats(0)?.to_vec();
                let axes: Vec<Vec<f64>> = x0
                    .iter()
                    .enumerate()
                    .map(|(i, x)| {
                        let (lo, hi) = match &bounds {
                            Some(bounds) => bounds[i],
                            None => {
                                let half = span * x.abs().max(1.0);
                                (x - half, x + half)
                            }
                        };
                        (0..points)
                            .map(|k| lo + (hi - lo) * k as f64 / (points - 1) as f64)
                            .collect()
                    })
                    .collect();

                let mut best = x0.clone();
                let mut best_value = objective.sse(record, &x0)?;
                let mut index = vec![0; axes.len()];
                let mut point = vec![0.0; axes.len()];
                'grid: loop {
                    for (slot, (axis, k)) in point.iter_mut().zip(axes.iter().zip(&index)) {
                        *slot = axis[*k];
                    }
                    let value = objective.sse(record, &point)?;
                    if value < best_value {
                        best_value = value;
                        best.copy_from_slice(&point);
                    }
                    // Odometer increment over the grid axes.
                    for (digit, axis) in index.iter_mut().zip(&axes) {
                        *digit += 1;
                        if *digit < axis.len() {
                            continue 'grid;
                        }
                        *digit = 0;
                    }
                    break;
                }

                let status = if best_value.is_finite() {
                    Status::Success
                } else {
                    Status::NumericalFailure
                };
                let rounded: Vec<f64> = best.iter().map(|v| record.round(*v)).collect();
                record.set_floats(0, &rounded)?;
                record.words_mut(1)?[0] = status.code();
                Ok(None)
            })
            .build()?;
        run_optimizer(engine, model, &routine, start, precision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PolynomialModel;
    use ndarray::{array, Array1};
    use parafit_backend_cpu::{CpuBackend, CpuBackendOptions};
    use parafit_engine::EngineOptions;
    use parafit_kernels::DynBackend;
    use std::sync::Arc;

    #[test]
    fn test_grid_hits_exact_points_within_bounds() {
        let cpu: DynBackend =
            Arc::new(CpuBackend::new(CpuBackendOptions { threads: Some(1) }).unwrap());
        let engine = Engine::with_backends(vec![cpu], EngineOptions::default()).unwrap();
        let model = PolynomialModel::from_coefficients(
            Array1::linspace(-1.0, 1.0, 5),
            &array![[0.0, 5.0], [-5.0, 10.0]],
        )
        .unwrap();

        let result = GridSearch::default()
            .minimize(&engine, &model, &model.initial_parameters(), Precision::Double)
            .unwrap();
        assert_eq!(result.parameters, array![[0.0, 5.0], [-5.0, 10.0]]);
        assert_eq!(result.converged(), 2);
    }

    #[test]
    fn test_grid_needs_two_points() {
        let cpu: DynBackend =
            Arc::new(CpuBackend::new(CpuBackendOptions { threads: Some(1) }).unwrap());
        let engine = Engine::with_backends(vec![cpu], EngineOptions::default()).unwrap();
        let model =
            PolynomialModel::from_coefficients(Array1::linspace(0.0, 1.0, 3), &array![[1.0]])
                .unwrap();
        assert!(GridSearch::new(1, 0.5)
            .minimize(&engine, &model, &model.initial_parameters(), Precision::Double)
            .is_err());
    }
}
