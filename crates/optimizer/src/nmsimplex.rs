//! Nelder-Mead simplex with dimension-adaptive coefficients.

use crate::model::{Model, Objective};
use crate::optimizer::{
    iteration_budget, optimizer_routine, run_optimizer, OptimizationResult, Optimizer, Status,
    DATA_OFFSET,
};
use anyhow::Result;
use ndarray::Array2;
use parafit_engine::Engine;
use parafit_ir::Precision;

pub const DEFAULT_PATIENCE: usize = 200;

/// Reflection, expansion, contraction and shrink coefficients for `n` parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimplexCoefficients {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
    pub delta: f64,
}

impl SimplexCoefficients {
    pub fn adaptive(n: usize) -> Self {
        let n = n.max(1) as f64;
        Self {
            alpha: 1.0,
            beta: 0.75 - 1.0 / (2.0 * n),
            gamma: 1.0 + 2.0 / n,
            delta: 1.0 - 1.0 / n,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NMSimplex {
    patience: usize,
}

impl Default for NMSimplex {
    fn default() -> Self {
        Self {
            patience: DEFAULT_PATIENCE,
        }
    }
}

impl NMSimplex {
    pub fn with_patience(patience: usize) -> Self {
        Self {
            patience: patience.max(1),
        }
    }

    pub fn patience(&self) -> usize {
        self.patience
    }
}

impl Optimizer for NMSimplex {
    fn name(&self) -> &str {
        "nmsimplex"
    }

    fn minimize(
        &self,
        engine: &Engine,
        model: &dyn Model,
        start: &Array2<f64>,
        precision: Precision,
    ) -> Result<OptimizationResult> {
        let objective = Objective::new(model, DATA_OFFSET)?;
        let patience = self.patience;
        let routine = optimizer_routine("nmsimplex", model)
            .native(move |record| {
                let x0 = record.floats(0)?.to_vec();
                let tolerance = tolerance(record.precision());
                let mut failure = None;
                let (x, status) = simplex(
                    |x| match objective.sse(record, x) {
                        Ok(value) => value,
                        Err(err) => {
                            failure.get_or_insert(err);
                            f64::INFINITY
                        }
                    },
                    &x0,
                    iteration_budget(patience, x0.len()),
                    tolerance,
                );
                if let Some(err) = failure {
                    return Err(err);
                }
                let rounded: Vec<f64> = x.iter().map(|v| record.round(*v)).collect();
                record.set_floats(0, &rounded)?;
                record.words_mut(1)?[0] = status.code();
                Ok(None)
            })
            .build()?;
        run_optimizer(engine, model, &routine, start, precision)
    }
}

pub(crate) fn tolerance(precision: Precision) -> f64 {
    match precision {
        Precision::Single => 1e-6,
        Precision::Double => 1e-10,
    }
}

/// Minimises `f` from `x0`. Returns the best vertex and how the search ended.
pub fn simplex<F>(mut f: F, x0: &[f64], max_iterations: usize, tolerance: f64) -> (Vec<f64>, Status)
where
    F: FnMut(&[f64]) -> f64,
{
    let n = x0.len();
    let f0 = f(x0);
    if !f0.is_finite() {
        return (x0.to_vec(), Status::NumericalFailure);
    }
    if n == 0 {
        return (Vec::new(), Status::Success);
    }
    let coefficients = SimplexCoefficients::adaptive(n);

    let mut vertices = vec![x0.to_vec()];
    let mut values = vec![f0];
    for i in 0..n {
        let mut vertex = x0.to_vec();
        vertex[i] += if x0[i] != 0.0 { 0.05 * x0[i] } else { 0.00025 };
        values.push(f(&vertex));
        vertices.push(vertex);
    }

    let mut iterations = 0;
    loop {
        order(&mut vertices, &mut values);
        if converged(&vertices, &values, tolerance) {
            return (vertices.swap_remove(0), Status::Success);
        }
        if iterations >= max_iterations {
            return (vertices.swap_remove(0), Status::PatienceExhausted);
        }
        iterations += 1;

        let centroid = centroid(&vertices[..n]);
        let worst = values[n];
        let reflected = along(&centroid, &vertices[n], -coefficients.alpha);
        let f_reflected = f(&reflected);

        if f_reflected < values[0] {
            let expanded = along(&centroid, &reflected, coefficients.gamma);
            let f_expanded = f(&expanded);
            if f_expanded < f_reflected {
                vertices[n] = expanded;
                values[n] = f_expanded;
            } else {
                vertices[n] = reflected;
                values[n] = f_reflected;
            }
            continue;
        }
        if f_reflected < values[n - 1] {
            vertices[n] = reflected;
            values[n] = f_reflected;
            continue;
        }

        let (contracted, limit) = if f_reflected < worst {
            (along(&centroid, &reflected, coefficients.beta), f_reflected)
        } else {
            (along(&centroid, &vertices[n], coefficients.beta), worst)
        };
        let f_contracted = f(&contracted);
        if f_contracted < limit {
            vertices[n] = contracted;
            values[n] = f_contracted;
            continue;
        }

        let best = vertices[0].clone();
        for i in 1..=n {
            vertices[i] = along(&best, &vertices[i], coefficients.delta);
            values[i] = f(&vertices[i]);
        }
    }
}

/// `origin + scale * (towards - origin)`.
fn along(origin: &[f64], towards: &[f64], scale: f64) -> Vec<f64> {
    origin
        .iter()
        .zip(towards)
        .map(|(o, t)| o + scale * (t - o))
        .collect()
}

fn centroid(vertices: &[Vec<f64>]) -> Vec<f64> {
    let mut sum = vec![0.0; vertices[0].len()];
    for vertex in vertices {
        for (acc, v) in sum.iter_mut().zip(vertex) {
            *acc += v;
        }
    }
    let count = vertices.len() as f64;
    sum.iter().map(|v| v / count).collect()
}

fn order(vertices: &mut Vec<Vec<f64>>, values: &mut Vec<f64>) {
    let mut pairs: Vec<(f64, Vec<f64>)> = values.drain(..).zip(vertices.drain(..)).collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
    for (value, vertex) in pairs {
        values.push(value);
        vertices.push(vertex);
    }
}

fn converged(vertices: &[Vec<f64>], values: &[f64], tolerance: f64) -> bool {
    let best = values[0];
    let worst = values[values.len() - 1];
    if !worst.is_finite() {
        return false;
    }
    if worst - best <= tolerance * (best.abs() + worst.abs()) + f64::MIN_POSITIVE {
        return true;
    }
    let scale = 1.0 + vertices[0].iter().fold(0.0_f64, |m, v| m.max(v.abs()));
    let diameter = vertices[1..]
        .iter()
        .flat_map(|vertex| vertex.iter().zip(&vertices[0]).map(|(a, b)| (a - b).abs()))
        .fold(0.0_f64, f64::max);
    diameter <= tolerance * scale
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn bowl(x: &[f64]) -> f64 {
        (x[0] - 1.5).powi(2) + 4.0 * (x[1] + 0.5).powi(2)
    }

    #[test]
    fn test_adaptive_coefficients() {
        let c = SimplexCoefficients::adaptive(4);
        assert_abs_diff_eq!(c.alpha, 1.0);
        assert_abs_diff_eq!(c.beta, 0.625);
        assert_abs_diff_eq!(c.gamma, 1.5);
        assert_abs_diff_eq!(c.delta, 0.75);
    }

    #[test]
    fn test_simplex_finds_bowl_minimum() {
        let (x, status) = simplex(bowl, &[0.0, 0.0], 600, 1e-10);
        assert_eq!(status, Status::Success);
        assert_abs_diff_eq!(x[0], 1.5, epsilon = 1e-4);
        assert_abs_diff_eq!(x[1], -0.5, epsilon = 1e-4);
    }

    #[test]
    fn test_simplex_reports_exhausted_patience() {
        let (_, status) = simplex(bowl, &[10.0, 10.0], 3, 1e-10);
        assert_eq!(status, Status::PatienceExhausted);
    }

    #[test]
    fn test_simplex_rejects_non_finite_start() {
        let (x, status) = simplex(|_| f64::NAN, &[1.0], 10, 1e-10);
        assert_eq!(status, Status::NumericalFailure);
        assert_eq!(x, vec![1.0]);
    }
}
