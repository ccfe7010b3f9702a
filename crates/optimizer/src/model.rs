//! Model collaborators consumed by the fitting routines.
//!
//! A model supplies a residual routine with the signature
//! `(x, residuals, data...)`: `x` holds one instance's parameter row,
//! `residuals` receives observation minus prediction for every observation,
//! and the remaining parameters carry the model's per-instance or shared data.

use anyhow::{anyhow, bail, Result};
use ndarray::{Array1, Array2};
use parafit_ir::{
    input, output, ElementType, FunctionBuilder, FunctionDescriptor, InstanceRecord,
    NativeRoutine, Parameter, Slot,
};
use parafit_kernels::{KernelData, KernelInputs};
use std::sync::Arc;

/// Position of the parameter row in a residual routine.
pub const X_SLOT: usize = 0;
/// Position of the residual row in a residual routine.
pub const RESIDUALS_SLOT: usize = 1;

pub trait Model: Send + Sync {
    fn name(&self) -> &str;

    fn parameter_names(&self) -> Vec<String>;

    fn instances(&self) -> usize;

    fn observations(&self) -> usize;

    /// Routine `(x, residuals, data...)`, built once per model.
    fn residual_function(&self) -> Arc<FunctionDescriptor>;

    /// Inputs for the data parameters of the residual routine.
    fn data(&self) -> KernelInputs;

    /// Starting point, `instances x parameters`.
    fn initial_parameters(&self) -> Array2<f64>;

    /// Inclusive search range per parameter, if the model has one.
    fn parameter_bounds(&self) -> Option<Vec<(f64, f64)>> {
        None
    }

    fn parameter_count(&self) -> usize {
        self.parameter_names().len()
    }
}

/// Data parameters of a model's residual routine, in declaration order.
pub fn data_parameters(model: &dyn Model) -> Vec<Parameter> {
    model
        .residual_function()
        .parameters()
        .iter()
        .skip(RESIDUALS_SLOT + 1)
        .cloned()
        .collect()
}

/// Checks that a parameter matrix matches the model's geometry.
pub fn check_parameters(model: &dyn Model, parameters: &Array2<f64>) -> Result<()> {
    let expected = (model.instances(), model.parameter_count());
    if parameters.dim() != expected {
        bail!(
            "model `{}` expects a {}x{} parameter matrix, got {}x{}",
            model.name(),
            expected.0,
            expected.1,
            parameters.nrows(),
            parameters.ncols()
        );
    }
    Ok(())
}

/// Host evaluation of a model's residual routine from inside another routine.
///
/// The enclosing routine's record carries the model data from
/// `data_offset` onwards, in the residual routine's declaration order.
#[derive(Clone)]
pub struct Objective {
    native: NativeRoutine,
    observations: usize,
    data_offset: usize,
}

impl Objective {
    pub fn new(model: &dyn Model, data_offset: usize) -> Result<Self> {
        let function = model.residual_function();
        let parameters = function.parameters();
        if parameters.len() < RESIDUALS_SLOT + 1 {
            bail!(
                "residual routine `{}` must take the parameter and residual rows first",
                function.name()
            );
        }
        let native = function.native().cloned().ok_or_else(|| {
            anyhow!(
                "residual routine `{}` has no native implementation",
                function.name()
            )
        })?;
        Ok(Self {
            native,
            observations: model.observations(),
            data_offset,
        })
    }

    pub fn observations(&self) -> usize {
        self.observations
    }

    /// Residuals at `x` for the instance behind `record`.
    pub fn residuals(&self, record: &InstanceRecord, x: &[f64]) -> Result<Vec<f64>> {
        let data = record.slots().get(self.data_offset..).unwrap_or(&[]);
        let mut slots = Vec::with_capacity(data.len() + 2);
        slots.push(Slot::Floats(x.to_vec()));
        slots.push(Slot::Floats(vec![0.0; self.observations]));
        slots.extend(data.iter().cloned());

        let mut inner = InstanceRecord::new(record.index(), record.precision(), slots);
        (self.native)(&mut inner)?;
        match inner.into_slots().swap_remove(RESIDUALS_SLOT) {
            Slot::Floats(values) => Ok(values),
            other => bail!("residual routine replaced its residual row with {other:?}"),
        }
    }

    /// Sum of squared residuals; non-finite residuals give `+inf`.
    pub fn sse(&self, record: &InstanceRecord, x: &[f64]) -> Result<f64> {
        let sse: f64 = self.residuals(record, x)?.iter().map(|r| r * r).sum();
        Ok(if sse.is_finite() { sse } else { f64::INFINITY })
    }
}

/// Polynomial `sum_k x_k t^k` observed at shared design points.
///
/// Each instance has its own observation row; all instances share the design.
pub struct PolynomialModel {
    degree: usize,
    design: Array1<f64>,
    observations: Array2<f64>,
    start: Array2<f64>,
    residuals: Arc<FunctionDescriptor>,
}

impl PolynomialModel {
    pub fn new(degree: usize, design: Array1<f64>, observations: Array2<f64>) -> Result<Self> {
        if observations.ncols() != design.len() {
            bail!(
                "observation rows hold {} values for {} design points",
                observations.ncols(),
                design.len()
            );
        }
        let start = Array2::zeros((observations.nrows(), degree + 1));
        let residuals = polynomial_residuals(degree + 1, design.len())?;
        Ok(Self {
            degree,
            design,
            observations,
            start,
            residuals,
        })
    }

    /// Noise-free observations of the given coefficient rows.
    pub fn from_coefficients(design: Array1<f64>, coefficients: &Array2<f64>) -> Result<Self> {
        let observations = Array2::from_shape_fn(
            (coefficients.nrows(), design.len()),
            |(i, j)| evaluate_polynomial(coefficients.row(i).as_slice().unwrap_or(&[]), design[j]),
        );
        Self::new(coefficients.ncols().saturating_sub(1), design, observations)
    }

    pub fn with_start(mut self, start: Array2<f64>) -> Self {
        self.start = start;
        self
    }

    pub fn degree(&self) -> usize {
        self.degree
    }
}

fn evaluate_polynomial(coefficients: &[f64], t: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * t + c)
}

fn polynomial_residuals(parameters: usize, observations: usize) -> Result<Arc<FunctionDescriptor>> {
    FunctionBuilder::new("polynomial_residuals")
        .param(input("x", ElementType::Float))
        .param(output("residuals", ElementType::Float))
        .param(input("observed", ElementType::Float))
        .param(input("design", ElementType::Float))
        .source(format!(
            "fn polynomial_residuals(x: ptr<function, x_record>, residuals: ptr<function, residuals_record>, observed: ptr<function, observed_record>, design: ptr<function, design_record>) {{\n  for (var j: u32 = 0u; j < {observations}u; j = j + 1u) {{\n    var prediction = 0.0;\n    for (var k: i32 = {last}; k >= 0; k = k - 1) {{\n      prediction = prediction * (*design)[j] + (*x)[k];\n    }}\n    (*residuals)[j] = (*observed)[j] - prediction;\n  }}\n}}",
            last = parameters as i64 - 1
        ))
        .native(|record| {
            let x = record.floats(0)?.to_vec();
            let observed = record.floats(2)?.to_vec();
            let design = record.floats(3)?.to_vec();
            let residuals: Vec<f64> = observed
                .iter()
                .zip(&design)
                .map(|(y, t)| record.round(y - evaluate_polynomial(&x, *t)))
                .collect();
            record.set_floats(1, &residuals)?;
            Ok(None)
        })
        .build()
}

impl Model for PolynomialModel {
    fn name(&self) -> &str {
        "polynomial"
    }

    fn parameter_names(&self) -> Vec<String> {
        (0..=self.degree).map(|k| format!("c{k}")).collect()
    }

    fn instances(&self) -> usize {
        self.observations.nrows()
    }

    fn observations(&self) -> usize {
        self.design.len()
    }

    fn residual_function(&self) -> Arc<FunctionDescriptor> {
        Arc::clone(&self.residuals)
    }

    fn data(&self) -> KernelInputs {
        let design = self.design.clone().insert_axis(ndarray::Axis(0));
        [
            (
                "observed".to_string(),
                KernelData::read_only(self.observations.clone()).into(),
            ),
            ("design".to_string(), KernelData::read_only(design).into()),
        ]
        .into_iter()
        .collect()
    }

    fn initial_parameters(&self) -> Array2<f64> {
        self.start.clone()
    }

    fn parameter_bounds(&self) -> Option<Vec<(f64, f64)>> {
        Some(vec![(-10.0, 10.0); self.degree + 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use parafit_ir::Precision;

    fn model() -> PolynomialModel {
        PolynomialModel::from_coefficients(array![-1.0, 0.0, 1.0, 2.0], &array![[1.0, 2.0, 3.0]])
            .unwrap()
    }

    #[test]
    fn test_polynomial_observations() {
        let model = model();
        assert_eq!(model.parameter_names(), vec!["c0", "c1", "c2"]);
        assert_eq!(model.observations(), 4);
        assert_eq!(model.observations.row(0).to_vec(), vec![2.0, 1.0, 6.0, 17.0]);
        assert_eq!(data_parameters(&model).len(), 2);
    }

    #[test]
    fn test_objective_evaluates_residual_routine() {
        let model = model();
        let objective = Objective::new(&model, 2).unwrap();
        let record = InstanceRecord::new(
            0,
            Precision::Double,
            vec![
                Slot::Floats(vec![0.0; 3]),
                Slot::Words(vec![0]),
                Slot::Floats(vec![2.0, 1.0, 6.0, 17.0]),
                Slot::Floats(vec![-1.0, 0.0, 1.0, 2.0]),
            ],
        );
        assert_abs_diff_eq!(objective.sse(&record, &[1.0, 2.0, 3.0]).unwrap(), 0.0);
        let residuals = objective.residuals(&record, &[1.0, 2.0, 2.0]).unwrap();
        assert_eq!(residuals, vec![1.0, 0.0, 1.0, 4.0]);
    }

    #[test]
    fn test_parameter_shape_check() {
        let model = model();
        assert!(check_parameters(&model, &Array2::zeros((1, 3))).is_ok());
        assert!(check_parameters(&model, &Array2::zeros((2, 3))).is_err());
    }
}
