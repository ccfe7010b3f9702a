//! Residuals of a fitted parameter map and the error measures derived from them.

use crate::model::{check_parameters, Model};
use crate::optimizer::take_buffer;
use anyhow::Result;
use ndarray::{Array1, Array2, Axis, Ix2};
use parafit_engine::{Engine, EvaluateOptions};
use parafit_ir::{ElementType, Precision};
use parafit_kernels::KernelData;
use std::collections::BTreeMap;

pub struct ResidualCalculator;

impl ResidualCalculator {
    /// Dispatches the model's residual routine at `parameters`.
    /// Returns the `instances x observations` residual matrix.
    pub fn calculate(
        engine: &Engine,
        model: &dyn Model,
        parameters: &Array2<f64>,
        precision: Precision,
    ) -> Result<Array2<f64>> {
        check_parameters(model, parameters)?;
        let mut inputs = model.data();
        inputs.insert(
            "x".to_string(),
            KernelData::read_only(parameters.clone()).into(),
        );
        inputs.insert(
            "residuals".to_string(),
            KernelData::zeros(&[model.instances(), model.observations()], ElementType::Float)
                .into(),
        );
        engine.evaluate(
            &model.residual_function(),
            &mut inputs,
            &EvaluateOptions::with_precision(precision),
        )?;
        Ok(take_buffer(&mut inputs, "residuals")?
            .to_f64()
            .into_dimensionality::<Ix2>()?)
    }
}

pub struct ErrorMeasures;

impl ErrorMeasures {
    /// Per-instance `Errors.sse`, `Errors.mse` and `Errors.rmse`.
    pub fn calculate(residuals: &Array2<f64>) -> BTreeMap<String, Array1<f64>> {
        let observations = residuals.ncols().max(1) as f64;
        let sse = residuals.map_axis(Axis(1), |row| row.iter().map(|r| r * r).sum::<f64>());
        let mse = sse.mapv(|v| v / observations);
        let rmse = mse.mapv(f64::sqrt);

        let mut measures = BTreeMap::new();
        measures.insert("Errors.sse".to_string(), sse);
        measures.insert("Errors.mse".to_string(), mse);
        measures.insert("Errors.rmse".to_string(), rmse);
        measures
    }
}
