//! Levenberg-Marquardt least squares over the model residuals.
//!
//! The Jacobian is taken by forward differences. Each step solves the damped
//! normal equations `(J'J + lambda * diag(J'J)) dx = -J'r` and is limited to
//! `step_bound * max(|x|, 1)`.

use crate::linalg::solve;
use crate::model::{Model, Objective};
use crate::nmsimplex::tolerance;
use crate::optimizer::{
    iteration_budget, optimizer_routine, run_optimizer, OptimizationResult, Optimizer, Status,
    DATA_OFFSET,
};
use anyhow::{bail, Result};
use ndarray::Array2;
use parafit_engine::Engine;
use parafit_ir::Precision;

pub const DEFAULT_PATIENCE: usize = 250;
pub const DEFAULT_STEP_BOUND: f64 = 100.0;

const INITIAL_DAMPING: f64 = 1e-3;
const MAX_DAMPING: f64 = 1e16;

#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    patience: usize,
    step_bound: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            patience: DEFAULT_PATIENCE,
            step_bound: DEFAULT_STEP_BOUND,
        }
    }
}

impl LevenbergMarquardt {
    pub fn with_patience(patience: usize) -> Self {
        Self {
            patience: patience.max(1),
            ..Self::default()
        }
    }

    pub fn step_bound(mut self, step_bound: f64) -> Self {
        self.step_bound = step_bound;
        self
    }
}

impl Optimizer for LevenbergMarquardt {
    fn name(&self) -> &str {
        "levenberg_marquardt"
    }

    fn minimize(
        &self,
        engine: &Engine,
        model: &dyn Model,
        start: &Array2<f64>,
        precision: Precision,
    ) -> Result<OptimizationResult> {
        if model.observations() < model.parameter_count() {
            bail!(
                "Levenberg-Marquardt needs at least as many observations as parameters: model `{}` has {} observations for {} parameters",
                model.name(),
                model.observations(),
                model.parameter_count()
            );
        }
        if !(self.step_bound.is_finite() && self.step_bound > 0.0) {
            bail!("step bound must be positive, got {}", self.step_bound);
        }

        let objective = Objective::new(model, DATA_OFFSET)?;
        let settings = Settings {
            step_bound: self.step_bound,
            patience: self.patience,
        };
        let routine = optimizer_routine("levenberg_marquardt", model)
            .native(move |record| {
                let x0 = record.floats(0)?.to_vec();
                let single = record.precision() == Precision::Single;
                let tolerance = tolerance(record.precision());
                let (x, status) = least_squares(
                    |x| objective.residuals(record, x),
                    &x0,
                    &settings,
                    tolerance,
                    if single {
                        f64::from(f32::EPSILON)
                    } else {
                        f64::EPSILON
                    },
                )?;
                let rounded: Vec<f64> = x.iter().map(|v| record.round(*v)).collect();
                record.set_floats(0, &rounded)?;
                record.words_mut(1)?[0] = status.code();
                Ok(None)
            })
            .build()?;
        run_optimizer(engine, model, &routine, start, precision)
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    step_bound: f64,
    patience: usize,
}

fn sum_of_squares(values: &[f64]) -> f64 {
    let sse: f64 = values.iter().map(|v| v * v).sum();
    if sse.is_finite() {
        sse
    } else {
        f64::INFINITY
    }
}

fn norm(values: &[f64]) -> f64 {
    values.iter().map(|v| v * v).sum::<f64>().sqrt()
}

fn least_squares<F>(
    mut residuals: F,
    x0: &[f64],
    settings: &Settings,
    tolerance: f64,
    epsilon: f64,
) -> Result<(Vec<f64>, Status)>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>>,
{
    let n = x0.len();
    let mut x = x0.to_vec();
    let mut r = residuals(&x)?;
    let mut sse = sum_of_squares(&r);
    if !sse.is_finite() {
        return Ok((x, Status::NumericalFailure));
    }
    let m = r.len();
    let mut damping = INITIAL_DAMPING;

    for _ in 0..iteration_budget(settings.patience, n) {
        if sse <= f64::MIN_POSITIVE {
            return Ok((x, Status::Success));
        }

        // Forward-difference Jacobian, column per parameter.
        let mut jacobian = vec![vec![0.0; m]; n];
        for (j, column) in jacobian.iter_mut().enumerate() {
            let h = epsilon.sqrt() * x[j].abs().max(1.0);
            let mut shifted = x.clone();
            shifted[j] += h;
            let r_shifted = residuals(&shifted)?;
            for (entry, (a, b)) in column.iter_mut().zip(r_shifted.iter().zip(&r)) {
                *entry = (a - b) / h;
            }
        }

        let mut normal = vec![vec![0.0; n]; n];
        let mut gradient = vec![0.0; n];
        for a in 0..n {
            gradient[a] = jacobian[a].iter().zip(&r).map(|(j, r)| j * r).sum();
            for b in 0..n {
                normal[a][b] = jacobian[a].iter().zip(&jacobian[b]).map(|(p, q)| p * q).sum();
            }
        }
        if gradient.iter().any(|g| !g.is_finite()) {
            return Ok((x, Status::NumericalFailure));
        }
        if gradient.iter().fold(0.0_f64, |acc, g| acc.max(g.abs())) <= tolerance * tolerance {
            return Ok((x, Status::Success));
        }

        let mut accepted = None;
        while damping <= MAX_DAMPING {
            let mut damped = normal.clone();
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] += damping * normal[i][i].max(1e-12);
            }
            let rhs: Vec<f64> = gradient.iter().map(|g| -g).collect();
            let Some(mut step) = solve(damped, rhs) else {
                damping *= 10.0;
                continue;
            };

            let limit = settings.step_bound * norm(&x).max(1.0);
            let length = norm(&step);
            if length > limit {
                step.iter_mut().for_each(|s| *s *= limit / length);
            }

            let candidate: Vec<f64> = x.iter().zip(&step).map(|(a, b)| a + b).collect();
            let r_candidate = residuals(&candidate)?;
            let sse_candidate = sum_of_squares(&r_candidate);
            if sse_candidate < sse {
                damping = (damping / 10.0).max(1e-15);
                accepted = Some((candidate, r_candidate, sse_candidate, norm(&step)));
                break;
            }
            damping *= 10.0;
        }

        let Some((candidate, r_candidate, sse_candidate, step_length)) = accepted else {
            // No damped step reduces the objective: a local minimum.
            return Ok((x, Status::Success));
        };
        let reduction = (sse - sse_candidate) / sse;
        let scale = norm(&candidate);
        x = candidate;
        r = r_candidate;
        sse = sse_candidate;

        if reduction <= tolerance || step_length <= tolerance * (scale + tolerance) {
            return Ok((x, Status::Success));
        }
    }
    Ok((x, Status::PatienceExhausted))
}
