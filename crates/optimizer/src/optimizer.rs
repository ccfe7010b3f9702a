//! Optimizer trait and the shared dispatch path of optimizer routines.
//!
//! Every optimizer is a routine with the signature `(x, status, data...)`
//! that depends on the model's residual routine. It is dispatched through the
//! engine like any other routine: one instance per parameter row.

use crate::model::{check_parameters, data_parameters, Model};
use anyhow::{anyhow, Result};
use ndarray::{Array1, Array2, Ix1, Ix2};
use parafit_engine::{Engine, EvaluateOptions};
use parafit_ir::{inout, output, ElementType, FunctionBuilder, FunctionDescriptor, Precision};
use parafit_kernels::{HostBuffer, Input, KernelData, KernelInputs};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Data parameters of the model follow the parameter row and the status word.
pub(crate) const DATA_OFFSET: usize = 2;

/// Per-instance outcome of an optimizer routine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum Status {
    Success = 0,
    /// The iteration budget ran out before convergence.
    PatienceExhausted = 1,
    /// The objective became non-finite or the step could not be solved.
    NumericalFailure = 2,
}

impl Status {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Status::Success),
            1 => Some(Status::PatienceExhausted),
            2 => Some(Status::NumericalFailure),
            _ => None,
        }
    }
}

/// Fitted parameter matrix and per-instance status codes.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimizationResult {
    pub parameters: Array2<f64>,
    pub status: Array1<u32>,
}

impl OptimizationResult {
    pub fn converged(&self) -> usize {
        self.status
            .iter()
            .filter(|code| **code == Status::Success.code())
            .count()
    }
}

/// Proposes a fitted parameter matrix for a model from a starting matrix.
pub trait Optimizer: Send + Sync {
    fn name(&self) -> &str;

    fn minimize(
        &self,
        engine: &Engine,
        model: &dyn Model,
        start: &Array2<f64>,
        precision: Precision,
    ) -> Result<OptimizationResult>;
}

/// Starts an optimizer routine named `name` over the model's residual routine.
pub(crate) fn optimizer_routine(name: &str, model: &dyn Model) -> FunctionBuilder {
    FunctionBuilder::new(name)
        .param(inout("x", ElementType::Float))
        .param(output("status", ElementType::U32))
        .params(data_parameters(model))
        .depends_on(model.residual_function())
}

/// Inputs shared by every routine over a model: the parameter rows plus the model data.
pub(crate) fn routine_inputs(model: &dyn Model, parameters: &Array2<f64>) -> KernelInputs {
    let mut inputs = model.data();
    inputs.insert(
        "x".to_string(),
        KernelData::array(parameters.clone()).into(),
    );
    inputs
}

pub(crate) fn run_optimizer(
    engine: &Engine,
    model: &dyn Model,
    routine: &Arc<FunctionDescriptor>,
    start: &Array2<f64>,
    precision: Precision,
) -> Result<OptimizationResult> {
    check_parameters(model, start)?;
    let mut inputs = routine_inputs(model, start);
    inputs.insert(
        "status".to_string(),
        KernelData::zeros(&[model.instances()], ElementType::U32).into(),
    );

    engine.evaluate(routine, &mut inputs, &EvaluateOptions::with_precision(precision))?;

    let parameters = take_buffer(&mut inputs, "x")?
        .to_f64()
        .into_dimensionality::<Ix2>()?;
    let status = take_buffer(&mut inputs, "status")?
        .as_u32()
        .ok_or_else(|| anyhow!("status buffer is not u32"))?
        .clone()
        .into_dimensionality::<Ix1>()?;

    let result = OptimizationResult { parameters, status };
    info!(
        routine = routine.name(),
        model = model.name(),
        instances = model.instances(),
        converged = result.converged(),
        "optimizer finished"
    );
    Ok(result)
}

/// Removes the evaluated buffer of an explicit `KernelData` input.
pub(crate) fn take_buffer(inputs: &mut KernelInputs, key: &str) -> Result<HostBuffer> {
    inputs
        .remove(key)
        .and_then(|input| match input {
            Input::Data(data) => data.into_buffer(),
            _ => None,
        })
        .ok_or_else(|| anyhow!("routine left no buffer for `{key}`"))
}

/// Iteration budget `patience * (parameters + 1)`.
pub(crate) fn iteration_budget(patience: usize, parameters: usize) -> usize {
    patience.saturating_mul(parameters + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Status::Success.code(), 0);
        assert_eq!(Status::PatienceExhausted.code(), 1);
        assert_eq!(Status::NumericalFailure.code(), 2);
        assert_eq!(Status::from_code(2), Some(Status::NumericalFailure));
        assert_eq!(Status::from_code(7), None);
    }

    #[test]
    fn test_iteration_budget() {
        assert_eq!(iteration_budget(200, 3), 800);
        assert_eq!(iteration_budget(usize::MAX, 1), usize::MAX);
    }
}
