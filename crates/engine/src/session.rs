//! Evaluation sessions: bind, lower, balance and merge.

use crate::backends::enumerate_backends;
use crate::options::EngineOptions;
use crate::scheduler::{CancellationToken, LoadBalancer};
use anyhow::{bail, Context, Result};
use parafit_autotune::{CalibrationCache, Calibrator};
use parafit_ir::{EngineError, FunctionDescriptor, FunctionRegistry, Precision, Program};
use parafit_kernels::{bind, DynBackend, HostBuffer, HostValue, KernelInputs, LibraryRegistry};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Per-call settings of [`Engine::evaluate`].
#[derive(Debug, Clone, Default)]
pub struct EvaluateOptions {
    pub precision: Precision,
    /// Also return the post-call value of every bound parameter.
    pub return_inputs: bool,
    pub cancel: Option<CancellationToken>,
}

impl EvaluateOptions {
    pub fn with_precision(precision: Precision) -> Self {
        Self {
            precision,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    /// One value per instance for non-void routines.
    pub results: Option<HostBuffer>,
    /// Bound values keyed by sanitized parameter name, if requested.
    pub inputs: Option<BTreeMap<String, HostValue>>,
}

pub struct Engine {
    backends: Vec<DynBackend>,
    weights: Vec<f64>,
    options: EngineOptions,
    registry: FunctionRegistry,
    library: LibraryRegistry,
    routines: Mutex<HashMap<(String, usize), Arc<FunctionDescriptor>>>,
}

impl Engine {
    /// Enumerates backends once, as selected by `options`.
    pub fn new(options: EngineOptions) -> Result<Self> {
        options.validate()?;
        let backends = enumerate_backends(&options)?;
        Self::with_backends(backends, options)
    }

    pub fn with_backends(backends: Vec<DynBackend>, options: EngineOptions) -> Result<Self> {
        options.validate()?;
        if backends.is_empty() {
            return Err(EngineError::unavailable("engine created without backends").into());
        }
        let weights = match &options.backend_weights {
            Some(weights) if weights.len() == backends.len() => weights.clone(),
            Some(weights) => bail!(
                "{} backend weights given for {} backends",
                weights.len(),
                backends.len()
            ),
            None => vec![1.0; backends.len()],
        };

        Ok(Self {
            backends,
            weights,
            options,
            registry: FunctionRegistry::new(),
            library: LibraryRegistry::with_default_routines(),
            routines: Mutex::new(HashMap::new()),
        })
    }

    pub fn backends(&self) -> &[DynBackend] {
        &self.backends
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn library(&self) -> &LibraryRegistry {
        &self.library
    }

    /// Composed units cached for routines that are still alive.
    pub fn composed_routines(&self) -> usize {
        self.registry.len()
    }

    /// Library routine `name` for rows of `length`, built once per engine.
    pub fn routine(&self, name: &str, length: usize) -> Result<Arc<FunctionDescriptor>> {
        let key = (name.to_string(), length);
        if let Ok(cache) = self.routines.lock() {
            if let Some(routine) = cache.get(&key) {
                return Ok(Arc::clone(routine));
            }
        }
        let routine = self.library.instantiate(name, length)?;
        if let Ok(mut cache) = self.routines.lock() {
            cache.insert(key, Arc::clone(&routine));
        }
        Ok(routine)
    }

    /// Runs `function` once per instance over `inputs`.
    ///
    /// Explicit `KernelData` inputs that were written by the routine are
    /// updated in place, and only if every batch succeeded.
    pub fn evaluate(
        &self,
        function: &Arc<FunctionDescriptor>,
        inputs: &mut KernelInputs,
        options: &EvaluateOptions,
    ) -> Result<Evaluation> {
        let composed = self
            .registry
            .compose(function)
            .map_err(EngineError::from)?;
        let mut call = bind(function, inputs, options.precision)?;
        let program = Program::lower(
            Arc::clone(function),
            composed,
            call.layout().clone(),
            options.precision,
        );
        let (backends, weights) = self.supporting(&program)?;

        let cancel = options.cancel.clone().unwrap_or_default();
        let outputs = LoadBalancer::new(weights, self.options.single_batch_length).run(
            &backends,
            &program,
            &call,
            &cancel,
        )?;

        // Every batch ran; a cancellation arriving now no longer discards work.
        for output in &outputs {
            call.merge(output)
                .with_context(|| format!("failed to merge batch [{}, {})", output.start, output.end))?;
        }
        call.copy_back(inputs);
        debug!(
            routine = function.name(),
            instances = call.instances(),
            batches = outputs.len(),
            "evaluation complete"
        );

        let values = options.return_inputs.then(|| call.values());
        Ok(Evaluation {
            results: call.take_results(),
            inputs: values,
        })
    }

    /// Times `function` on every supporting backend and adopts throughput
    /// weights for later calls. Profiles persist to the configured cache file.
    pub fn calibrate(
        &mut self,
        function: &Arc<FunctionDescriptor>,
        inputs: &KernelInputs,
        precision: Precision,
    ) -> Result<Vec<f64>> {
        let composed = self
            .registry
            .compose(function)
            .map_err(EngineError::from)?;
        let call = bind(function, inputs, precision)?;
        let program = Program::lower(
            Arc::clone(function),
            composed,
            call.layout().clone(),
            precision,
        );

        let cache = match &self.options.calibration_cache {
            Some(path) => CalibrationCache::load_from_file(path).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "ignoring unreadable calibration cache");
                CalibrationCache::new()
            }),
            None => CalibrationCache::new(),
        };
        let mut calibrator = Calibrator::new(cache);

        let supporting: Vec<usize> = (0..self.backends.len())
            .filter(|&i| self.backends[i].supports(&program))
            .collect();
        if supporting.is_empty() {
            return Err(self.unsupported(&program).into());
        }
        let probed: Vec<DynBackend> = supporting
            .iter()
            .map(|&i| Arc::clone(&self.backends[i]))
            .collect();
        let measured = calibrator.calibrate(&probed, &program, &call)?;

        // Backends that cannot run this routine keep their previous weight.
        let mut weights = self.weights.clone();
        for (index, weight) in supporting.iter().zip(measured) {
            weights[*index] = weight;
        }

        if let Some(path) = &self.options.calibration_cache {
            calibrator.cache().save_to_file(path)?;
        }
        info!(routine = function.name(), ?weights, "adopted calibrated backend weights");
        self.weights = weights.clone();
        Ok(weights)
    }

    fn supporting(&self, program: &Program) -> Result<(Vec<DynBackend>, Vec<f64>)> {
        let (backends, weights): (Vec<DynBackend>, Vec<f64>) = self
            .backends
            .iter()
            .zip(&self.weights)
            .filter(|(backend, _)| backend.supports(program))
            .map(|(backend, weight)| (Arc::clone(backend), *weight))
            .unzip();
        if backends.is_empty() {
            return Err(self.unsupported(program).into());
        }
        Ok((backends, weights))
    }

    fn unsupported(&self, program: &Program) -> EngineError {
        EngineError::unavailable(format!(
            "no backend can run routine `{}` at {:?} precision",
            program.name(),
            program.precision
        ))
    }
}
