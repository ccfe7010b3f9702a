use anyhow::{bail, Result};
use ndarray::{Array1, Array2};
use parafit::engine::CancellationToken;
use parafit::ir::{compose, Program};
use parafit::kernels::{
    BackendInfo, BackendKind, BatchOutput, BoundCall, ComputeBackend, DynBackend, HostValue,
};
use parafit::{
    engine_error, inout, input, output, scalar, ElementType, Engine, EngineError, EngineOptions,
    EvaluateOptions, FunctionBuilder, FunctionDescriptor, Input, KernelData, KernelInputs,
    SampleRequest,
};
use parafit_backend_cpu::{CpuBackend, CpuBackendOptions};
use std::ops::Range;
use std::sync::Arc;

fn cpu() -> DynBackend {
    Arc::new(CpuBackend::new(CpuBackendOptions { threads: Some(4) }).unwrap())
}

fn cpu_engine(single_batch_length: Option<usize>) -> Engine {
    let options = EngineOptions {
        single_batch_length,
        ..EngineOptions::default()
    };
    Engine::with_backends(vec![cpu()], options).unwrap()
}

/// `y = x * gain + offset[i]`, returning `y`.
fn gain() -> Arc<FunctionDescriptor> {
    FunctionBuilder::new("gain")
        .returns(ElementType::Float)
        .param(input("x", ElementType::Float))
        .param(input("offset", ElementType::Float))
        .scalar("gain", ElementType::Float)
        .param(output("y", ElementType::Float))
        .native(|record| {
            let y = record.floats(0)?[0] * record.scalar(2)? + record.floats(1)?[0];
            let y = record.round(y);
            record.set_floats(3, &[y])?;
            Ok(Some(y))
        })
        .build()
        .unwrap()
}

fn gain_inputs(n: usize) -> KernelInputs {
    [
        (
            "x".to_string(),
            Input::from(Array1::from_iter((0..n).map(|i| (i as f64).sqrt()))),
        ),
        ("offset".to_string(), Input::Scalar(0.5)),
        ("gain".to_string(), Input::Scalar(-2.0)),
        ("y".to_string(), KernelData::zeros(&[n], ElementType::Float).into()),
    ]
    .into_iter()
    .collect()
}

#[test]
fn seeded_rand_is_reproducible_across_batch_caps() -> Result<()> {
    let request = SampleRequest::new(5, 100).seed(42);
    let reference = Engine::new(EngineOptions::default())?.rand(request, 0.0, 1.0)?;
    let again = Engine::new(EngineOptions::default())?.rand(request, 0.0, 1.0)?;
    let capped_one = cpu_engine(Some(1)).rand(request, 0.0, 1.0)?;
    let capped_five = cpu_engine(Some(5)).rand(request, 0.0, 1.0)?;

    assert_eq!(reference.shape(), &[5, 100]);
    assert_eq!(reference, again);
    assert_eq!(reference, capped_one);
    assert_eq!(reference, capped_five);

    let gaussian = cpu_engine(Some(2)).randn(request, 0.0, 1.0)?;
    assert_eq!(gaussian, cpu_engine(None).randn(request, 0.0, 1.0)?);
    Ok(())
}

#[test]
fn scalars_broadcast_to_the_instance_count() -> Result<()> {
    let engine = cpu_engine(None);
    let mut inputs = gain_inputs(37);
    let options = EvaluateOptions {
        return_inputs: true,
        ..EvaluateOptions::default()
    };
    let evaluation = engine.evaluate(&gain(), &mut inputs, &options)?;

    assert_eq!(evaluation.results.as_ref().map(|r| r.len()), Some(37));
    let values = evaluation.inputs.unwrap_or_default();
    match &values["offset"] {
        HostValue::Array(buffer) => {
            assert_eq!(buffer.shape(), &[37]);
            assert!(buffer.to_f64().iter().all(|v| *v == 0.5));
        }
        other => bail!("offset was not broadcast: {other:?}"),
    }
    assert_eq!(values["gain"], HostValue::Scalar(-2.0));
    Ok(())
}

#[test]
fn mismatched_leading_dimensions_are_shape_errors() {
    let engine = cpu_engine(None);
    let mut inputs = gain_inputs(10);
    inputs.insert(
        "y".to_string(),
        KernelData::zeros(&[11], ElementType::Float).into(),
    );
    let err = engine
        .evaluate(&gain(), &mut inputs, &EvaluateOptions::default())
        .unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::Shape { .. })));
}

#[test]
fn diamond_dependencies_compose_once() -> Result<()> {
    let leaf = |name: &str, deps: Vec<Arc<FunctionDescriptor>>| {
        FunctionBuilder::new(name)
            .source(format!("fn {name}() {{}}"))
            .dependencies(deps)
            .build()
    };
    let d = leaf("d", vec![])?;
    let b = leaf("b", vec![Arc::clone(&d)])?;
    let c = leaf("c", vec![Arc::clone(&d)])?;
    let a = leaf("a", vec![b, c])?;

    let composed = compose(&a)?;
    assert_eq!(composed.order, vec!["d", "b", "c", "a"]);
    assert_eq!(composed.text.matches("fn d()").count(), 1);
    Ok(())
}

#[test]
fn batching_does_not_change_results() -> Result<()> {
    let function = gain();
    let mut whole = gain_inputs(1000);
    let mut batched = gain_inputs(1000);
    let a = cpu_engine(None).evaluate(&function, &mut whole, &EvaluateOptions::default())?;
    let b = cpu_engine(Some(100)).evaluate(&function, &mut batched, &EvaluateOptions::default())?;

    assert_eq!(a.results, b.results);
    assert_eq!(whole["y"], batched["y"]);
    Ok(())
}

#[test]
fn written_buffers_round_trip_and_read_only_ones_stay() -> Result<()> {
    let accumulate = FunctionBuilder::new("accumulate")
        .param(inout("total", ElementType::Float))
        .param(input("step", ElementType::Float))
        .native(|record| {
            let step = record.floats(1)?.to_vec();
            for (total, step) in record.floats_mut(0)?.iter_mut().zip(&step) {
                *total += step;
            }
            Ok(None)
        })
        .build()?;

    let total = Array2::from_shape_fn((4, 3), |(i, j)| (i * 3 + j) as f64);
    let step = Array2::from_elem((4, 3), 0.5);
    let mut inputs: KernelInputs = [
        ("total".to_string(), KernelData::array(total.clone()).into()),
        ("step".to_string(), KernelData::read_only(step.clone()).into()),
    ]
    .into_iter()
    .collect();
    cpu_engine(Some(3)).evaluate(&accumulate, &mut inputs, &EvaluateOptions::default())?;

    let after = |key: &str| {
        inputs[key]
            .kernel_data()
            .and_then(KernelData::buffer)
            .map(|buffer| buffer.to_f64())
    };
    assert_eq!(after("total"), Some((&total + 0.5).into_dyn()));
    assert_eq!(after("step"), Some(step.into_dyn()));
    Ok(())
}

/// Runs natively like the CPU backend, except for batches holding `poison`.
struct FlakyBackend {
    info: BackendInfo,
    poison: usize,
}

impl ComputeBackend for FlakyBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn supports(&self, _program: &Program) -> bool {
        true
    }

    fn run_batch(&self, program: &Program, call: &BoundCall, range: Range<usize>) -> Result<BatchOutput> {
        if range.contains(&self.poison) {
            bail!("out of device memory");
        }
        let Some(native) = program.entry.native() else {
            bail!("no native routine");
        };
        let mut collector = call.collector(range.clone());
        for index in range {
            let mut record = call.record(index)?;
            let result = native(&mut record)?;
            collector.push(record, result)?;
        }
        collector.finish()
    }
}

#[test]
fn a_failed_batch_fails_the_whole_call() {
    let flaky: DynBackend = Arc::new(FlakyBackend {
        info: BackendInfo {
            name: "flaky".to_string(),
            kind: BackendKind::Gpu,
            device: "test".to_string(),
            parallelism: 1,
        },
        poison: 990,
    });
    let engine = Engine::with_backends(
        vec![cpu(), flaky],
        EngineOptions::default().with_batch_length(20),
    )
    .unwrap();

    let mut inputs = gain_inputs(1000);
    let before = inputs.clone();
    let err = engine
        .evaluate(&gain(), &mut inputs, &EvaluateOptions::default())
        .unwrap_err();
    match engine_error(&err) {
        Some(EngineError::Dispatch {
            backend, start, end, ..
        }) => {
            assert_eq!(backend, "flaky");
            assert_eq!((*start, *end), (980, 1000));
        }
        other => panic!("expected a dispatch error, got {other:?}"),
    }
    assert_eq!(inputs, before);
}

#[test]
fn cancelled_calls_discard_results() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut inputs = gain_inputs(8);
    let before = inputs.clone();
    let options = EvaluateOptions {
        cancel: Some(cancel),
        ..EvaluateOptions::default()
    };
    let err = cpu_engine(Some(2))
        .evaluate(&gain(), &mut inputs, &options)
        .unwrap_err();
    assert!(matches!(engine_error(&err), Some(EngineError::Cancelled)));
    assert_eq!(inputs, before);
}

#[test]
fn scalar_only_routines_run_once() -> Result<()> {
    let sum = FunctionBuilder::new("sum")
        .returns(ElementType::F64)
        .param(scalar("a", ElementType::F64))
        .param(scalar("b", ElementType::F64))
        .native(|record| Ok(Some(record.scalar(0)? + record.scalar(1)?)))
        .build()?;
    let mut inputs: KernelInputs = [
        ("a".to_string(), Input::Scalar(1.25)),
        ("b".to_string(), Input::Scalar(2.0)),
    ]
    .into_iter()
    .collect();
    let evaluation = cpu_engine(None).evaluate(&sum, &mut inputs, &EvaluateOptions::default())?;
    let results = evaluation.results.map(|r| r.to_f64().into_raw_vec());
    assert_eq!(results, Some(vec![3.25]));
    Ok(())
}
