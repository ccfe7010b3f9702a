//! Data-parallel CPU execution of native routines.

use anyhow::{anyhow, Context, Result};
use parafit_ir::Program;
use parafit_kernels::{BackendInfo, BackendKind, BatchOutput, BoundCall, ComputeBackend};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;
use tracing::{debug, info};

#[derive(Debug, Clone, Default)]
pub struct CpuBackendOptions {
    /// Worker threads; defaults to the number of logical cores.
    pub threads: Option<usize>,
}

/// Runs each instance of a batch through the routine's native implementation
/// on a dedicated rayon pool.
pub struct CpuBackend {
    info: BackendInfo,
    pool: ThreadPool,
}

impl CpuBackend {
    pub fn new(options: CpuBackendOptions) -> Result<Self> {
        let mut builder =
            ThreadPoolBuilder::new().thread_name(|index| format!("parafit-cpu-{index}"));
        if let Some(threads) = options.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .context("failed to build CPU worker pool")?;

        let info = BackendInfo {
            name: "cpu".to_string(),
            kind: BackendKind::Cpu,
            device: format!("host ({} threads)", pool.current_num_threads()),
            parallelism: pool.current_num_threads(),
        };
        info!(threads = info.parallelism, "initialised CPU backend");
        Ok(Self { info, pool })
    }
}

impl ComputeBackend for CpuBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn supports(&self, program: &Program) -> bool {
        program.entry.native().is_some()
    }

    fn run_batch(
        &self,
        program: &Program,
        call: &BoundCall,
        range: Range<usize>,
    ) -> Result<BatchOutput> {
        let native = program
            .entry
            .native()
            .ok_or_else(|| anyhow!("routine `{}` has no native implementation", program.name()))?;

        debug!(
            routine = program.name(),
            start = range.start,
            end = range.end,
            "running CPU batch"
        );

        let evaluated = self.pool.install(|| {
            range
                .clone()
                .into_par_iter()
                .map(|index| -> Result<_> {
                    let mut record = call.record(index)?;
                    let result = native(&mut record)
                        .with_context(|| format!("routine failed on instance {index}"))?;
                    Ok((record, result))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut collector = call.collector(range);
        for (record, result) in evaluated {
            collector.push(record, result)?;
        }
        collector.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array1;
    use parafit_ir::{compose, inout, ElementType, FunctionBuilder, Precision, RecordLayout};
    use parafit_kernels::{bind, Input, KernelInputs};
    use std::sync::Arc;

    fn program_for(call: &BoundCall, entry: Arc<parafit_ir::FunctionDescriptor>) -> Program {
        let composed = Arc::new(compose(&entry).unwrap());
        let layout: RecordLayout = call.layout().clone();
        Program::lower(entry, composed, layout, call.precision())
    }

    #[test]
    fn batch_runs_every_instance_in_range() {
        let square = FunctionBuilder::new("square")
            .returns(ElementType::Float)
            .param(inout("x", ElementType::Float))
            .native(|record| {
                let x = record.scalar(0)?;
                record.set_floats(0, &[x * x])?;
                Ok(Some(x + 1.0))
            })
            .build()
            .unwrap();
        let inputs: KernelInputs = [(
            "x".to_string(),
            Input::from(Array1::from_iter((0..10).map(f64::from))),
        )]
        .into_iter()
        .collect();
        let call = bind(&square, &inputs, Precision::Double).unwrap();
        let program = program_for(&call, square);

        let backend = CpuBackend::new(CpuBackendOptions { threads: Some(2) }).unwrap();
        assert!(backend.supports(&program));
        let output = backend.run_batch(&program, &call, 3..7).unwrap();
        assert_eq!((output.start, output.end), (3, 7));
        match &output.columns[0].1 {
            parafit_kernels::FlatBuffer::F64(values) => {
                assert_eq!(values, &vec![9.0, 16.0, 25.0, 36.0])
            }
            other => panic!("unexpected block {other:?}"),
        }
        match &output.results {
            Some(parafit_kernels::FlatBuffer::F64(values)) => {
                assert_abs_diff_eq!(values[0], 4.0)
            }
            other => panic!("unexpected results {other:?}"),
        }
    }

    #[test]
    fn routine_errors_fail_the_batch() {
        let failing = FunctionBuilder::new("failing")
            .param(inout("x", ElementType::Float))
            .native(|record| {
                if record.index() == 2 {
                    anyhow::bail!("diverged");
                }
                Ok(None)
            })
            .build()
            .unwrap();
        let inputs: KernelInputs = [("x".to_string(), Input::from(Array1::<f64>::zeros(4)))]
            .into_iter()
            .collect();
        let call = bind(&failing, &inputs, Precision::Double).unwrap();
        let program = program_for(&call, failing);
        let backend = CpuBackend::new(CpuBackendOptions::default()).unwrap();

        let err = backend.run_batch(&program, &call, 0..4).unwrap_err();
        assert!(format!("{err:#}").contains("instance 2"));
        assert!(backend.run_batch(&program, &call, 0..2).is_ok());
    }

    #[test]
    fn routines_without_native_code_are_unsupported() {
        let device_only = FunctionBuilder::new("device_only").build().unwrap();
        let call = bind(&device_only, &KernelInputs::new(), Precision::Single).unwrap();
        let program = program_for(&call, device_only);
        let backend = CpuBackend::new(CpuBackendOptions { threads: Some(1) }).unwrap();
        assert!(!backend.supports(&program));
    }
}
