//! Binding of host inputs to a routine's formal parameters.
//!
//! Binding copies every input in, so the bound call owns its buffers for the
//! whole dispatch. Batch outputs are merged into those copies and only handed
//! back to the caller once the evaluation has succeeded.

use crate::backend::BatchOutput;
use crate::kernel_data::{FlatBuffer, HostBuffer, HostValue, Input, KernelData, KernelInputs};
use anyhow::{anyhow, bail, Result};
use parafit_ir::{
    sanitize_name, DataType, EngineError, FunctionDescriptor, InstanceRecord, Parameter,
    Precision, RecordLayout, ReturnType, Slot, SlotLayout,
};
use std::collections::BTreeMap;
use std::ops::Range;
use tracing::debug;

/// One formal parameter paired with the storage bound to it.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Key of the caller's input map entry.
    pub key: String,
    pub parameter: Parameter,
    /// Either a `HostArray` or a `HostScalar`; zeroed outputs are allocated at bind time.
    pub data: KernelData,
}

/// A routine's parameters bound for one evaluation over `instances` instances.
#[derive(Debug, Clone)]
pub struct BoundCall {
    instances: usize,
    precision: Precision,
    bindings: Vec<Binding>,
    layout: RecordLayout,
    results: Option<HostBuffer>,
}

/// Binds `inputs` to the parameters of `function`, in declaration order.
///
/// Inputs are looked up by parameter name, then by sanitized name. The instance
/// count is the largest leading dimension among non-scalar inputs (1 if there
/// are none); every other non-scalar input must have that leading dimension or 1.
pub fn bind(
    function: &FunctionDescriptor,
    inputs: &KernelInputs,
    precision: Precision,
) -> Result<BoundCall> {
    let mut resolved = Vec::with_capacity(function.parameters().len());
    for parameter in function.parameters() {
        let (key, input) = lookup(inputs, parameter).ok_or_else(|| {
            anyhow!(
                "parameter `{}` of routine `{}` is not bound",
                parameter.name,
                function.name()
            )
        })?;
        resolved.push((parameter, key, input));
    }

    let instances = instance_count(resolved.iter().map(|(p, _, input)| (*p, *input)))?;

    let mut bindings = Vec::with_capacity(resolved.len());
    let mut slots = Vec::with_capacity(resolved.len());
    for (parameter, key, input) in resolved {
        let (data, broadcast) = resolve(parameter, input, instances, precision)?;
        slots.push(slot_layout(parameter, &data, broadcast, precision));
        bindings.push(Binding {
            key: key.clone(),
            parameter: parameter.clone(),
            data,
        });
    }

    let result = match function.return_type() {
        ReturnType::Void => None,
        ReturnType::Scalar(element) => Some(element.resolve(precision)),
    };
    let results = result.map(|dtype| HostBuffer::zeros(&[instances], dtype));

    debug!(
        routine = function.name(),
        instances,
        parameters = bindings.len(),
        "bound routine inputs"
    );

    Ok(BoundCall {
        instances,
        precision,
        bindings,
        layout: RecordLayout { slots, result },
        results,
    })
}

fn lookup<'a>(inputs: &'a KernelInputs, parameter: &Parameter) -> Option<(&'a String, &'a Input)> {
    inputs.get_key_value(parameter.name.as_str()).or_else(|| {
        let sanitized = parameter.source_name();
        inputs.iter().find(|(key, _)| sanitize_name(key) == sanitized)
    })
}

fn instance_count<'a, I>(inputs: I) -> Result<usize>
where
    I: Iterator<Item = (&'a Parameter, &'a Input)>,
{
    let dims: Vec<(&str, usize)> = inputs
        .filter_map(|(parameter, input)| {
            input
                .leading_dim()
                .map(|dim| (parameter.name.as_str(), dim))
        })
        .collect();

    let instances = dims.iter().map(|(_, dim)| *dim).max().unwrap_or(1);
    if let Some((name, dim)) = dims
        .iter()
        .find(|(_, dim)| *dim != instances && *dim != 1)
    {
        return Err(EngineError::shape(format!(
            "parameter `{name}` has leading dimension {dim}, expected {instances} or 1"
        ))
        .into());
    }
    Ok(instances)
}

fn resolve(
    parameter: &Parameter,
    input: &Input,
    instances: usize,
    precision: Precision,
) -> Result<(KernelData, bool)> {
    let dtype = parameter.element.resolve(precision);
    match input {
        Input::Data(KernelData::HostArray {
            buffer,
            readable,
            writable,
        }) => array_binding(parameter, buffer.standardized(), *readable, *writable, instances),
        Input::Data(KernelData::HostScalar(value)) => Ok((KernelData::HostScalar(*value), false)),
        Input::Data(KernelData::ZeroedOutput { shape, dtype, .. }) => {
            let buffer = HostBuffer::zeros(shape, dtype.resolve(precision)).standardized();
            array_binding(parameter, buffer, true, true, instances)
        }
        Input::Scalar(value) if !parameter.is_array() => {
            Ok((KernelData::HostScalar(*value), false))
        }
        Input::Scalar(value) => Ok((
            KernelData::array(HostBuffer::filled(instances, *value, dtype)),
            false,
        )),
        Input::Array(buffer) => {
            let mut buffer = buffer.convert(dtype).standardized();
            if buffer.leading_dim() == 1 && instances > 1 {
                if parameter.is_array() && parameter.direction.is_written() {
                    return Err(single_row_error(parameter, instances));
                }
                buffer = buffer.repeat_rows(instances)?;
            }
            Ok((KernelData::array(buffer), false))
        }
    }
}

fn array_binding(
    parameter: &Parameter,
    buffer: HostBuffer,
    readable: bool,
    writable: bool,
    instances: usize,
) -> Result<(KernelData, bool)> {
    let broadcast = buffer.leading_dim() == 1 && instances > 1;
    if broadcast && writable && parameter.is_array() && parameter.direction.is_written() {
        return Err(single_row_error(parameter, instances));
    }
    Ok((
        KernelData::HostArray {
            buffer,
            readable,
            writable,
        },
        broadcast,
    ))
}

fn single_row_error(parameter: &Parameter, instances: usize) -> anyhow::Error {
    EngineError::shape(format!(
        "writable parameter `{}` has a single row for {instances} instances",
        parameter.name
    ))
    .into()
}

fn slot_layout(
    parameter: &Parameter,
    data: &KernelData,
    broadcast: bool,
    precision: Precision,
) -> SlotLayout {
    let by_value = !parameter.is_array();
    match data {
        KernelData::HostArray {
            buffer, writable, ..
        } => SlotLayout {
            name: parameter.source_name(),
            storage: buffer.dtype(),
            width: buffer.row_width(),
            broadcast,
            by_value,
            host_scalar: false,
            writable: *writable && !by_value && !broadcast && parameter.direction.is_written(),
        },
        _ => SlotLayout {
            name: parameter.source_name(),
            storage: parameter.element.resolve(precision),
            width: 1,
            broadcast: false,
            by_value,
            host_scalar: true,
            writable: false,
        },
    }
}

impl BoundCall {
    pub fn instances(&self) -> usize {
        self.instances
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn results(&self) -> Option<&HostBuffer> {
        self.results.as_ref()
    }

    pub fn take_results(&mut self) -> Option<HostBuffer> {
        self.results.take()
    }

    /// Record for instance `index`: row `index` of every bound buffer, row 0 of broadcast ones.
    pub fn record(&self, index: usize) -> Result<InstanceRecord> {
        let mut slots = Vec::with_capacity(self.bindings.len());
        for (binding, layout) in self.bindings.iter().zip(&self.layout.slots) {
            let slot = match &binding.data {
                KernelData::HostScalar(value) => match (layout.by_value, layout.storage) {
                    (true, _) => Slot::Scalar(*value),
                    (false, DataType::U32) => Slot::Words(vec![*value as u32]),
                    (false, _) => Slot::Floats(vec![*value]),
                },
                KernelData::HostArray { buffer, .. } => {
                    let row = if layout.broadcast { 0 } else { index };
                    let flat = buffer.flat_row(row, layout.width)?;
                    if layout.by_value {
                        Slot::Scalar(first_value(&flat).ok_or_else(|| {
                            anyhow!("parameter `{}` has an empty row", binding.parameter.name)
                        })?)
                    } else {
                        match flat {
                            FlatBuffer::F32(values) => {
                                Slot::Floats(values.into_iter().map(f64::from).collect())
                            }
                            FlatBuffer::F64(values) => Slot::Floats(values),
                            FlatBuffer::U32(values) => Slot::Words(values),
                        }
                    }
                }
                KernelData::ZeroedOutput { .. } => {
                    bail!("parameter `{}` was never allocated", binding.parameter.name)
                }
            };
            slots.push(slot);
        }
        Ok(InstanceRecord::new(index, self.precision, slots))
    }

    /// Collects the writable slots of records for the instances in `range`.
    pub fn collector(&self, range: Range<usize>) -> BatchCollector<'_> {
        let len = range.len();
        let columns = self
            .layout
            .writable_slots()
            .map(|(position, slot)| {
                (
                    position,
                    FlatBuffer::with_capacity(slot.storage, len * slot.width),
                )
            })
            .collect();
        let results = self
            .layout
            .result
            .map(|dtype| FlatBuffer::with_capacity(dtype, len));

        BatchCollector {
            call: self,
            next: range.start,
            range,
            columns,
            results,
        }
    }

    /// Writes one batch's output rows into the bound buffers.
    pub fn merge(&mut self, output: &BatchOutput) -> Result<()> {
        for (position, block) in &output.columns {
            let width = self
                .layout
                .slots
                .get(*position)
                .map(|slot| slot.width)
                .ok_or_else(|| anyhow!("batch output names unknown slot {position}"))?;
            if block.len() != output.len() * width {
                bail!(
                    "slot {position} block holds {} values for {} instances of width {width}",
                    block.len(),
                    output.len()
                );
            }
            match &mut self.bindings[*position].data {
                KernelData::HostArray { buffer, .. } => buffer.write_rows(output.start, block)?,
                _ => bail!("slot {position} is not backed by a buffer"),
            }
        }

        match (&mut self.results, &output.results) {
            (Some(results), Some(block)) if block.len() == output.len() => {
                results.write_rows(output.start, block)
            }
            (None, None) => Ok(()),
            _ => bail!(
                "batch [{}, {}) result block does not match the routine's return type",
                output.start,
                output.end
            ),
        }
    }

    /// Mirrors written buffers into the caller's explicit `KernelData` inputs.
    pub fn copy_back(&self, inputs: &mut KernelInputs) {
        for (binding, slot) in self.bindings.iter().zip(&self.layout.slots) {
            let KernelData::HostArray { buffer: bound, .. } = &binding.data else {
                continue;
            };
            let Some(Input::Data(data)) = inputs.get_mut(&binding.key) else {
                continue;
            };
            match data {
                KernelData::HostArray { buffer, .. } if slot.writable => *buffer = bound.clone(),
                KernelData::ZeroedOutput { buffer, .. } => *buffer = Some(bound.clone()),
                _ => {}
            }
        }
    }

    /// Post-call values of every binding keyed by sanitized parameter name.
    pub fn values(&self) -> BTreeMap<String, HostValue> {
        self.bindings
            .iter()
            .filter_map(|binding| {
                let value = match &binding.data {
                    KernelData::HostArray { buffer, .. } => HostValue::Array(buffer.clone()),
                    KernelData::HostScalar(value) => HostValue::Scalar(*value),
                    KernelData::ZeroedOutput { .. } => return None,
                };
                Some((binding.parameter.source_name(), value))
            })
            .collect()
    }
}

fn first_value(flat: &FlatBuffer) -> Option<f64> {
    match flat {
        FlatBuffer::F32(values) => values.first().map(|v| f64::from(*v)),
        FlatBuffer::F64(values) => values.first().copied(),
        FlatBuffer::U32(values) => values.first().map(|v| f64::from(*v)),
    }
}

/// Accumulates instance records of one batch, in index order.
pub struct BatchCollector<'a> {
    call: &'a BoundCall,
    range: Range<usize>,
    next: usize,
    columns: Vec<(usize, FlatBuffer)>,
    results: Option<FlatBuffer>,
}

impl BatchCollector<'_> {
    pub fn push(&mut self, record: InstanceRecord, result: Option<f64>) -> Result<()> {
        if record.index() != self.next {
            bail!(
                "instance {} collected out of order, expected {}",
                record.index(),
                self.next
            );
        }

        let call = self.call;
        let slots = record.into_slots();
        for (position, column) in &mut self.columns {
            let layout = &call.layout.slots[*position];
            match slots.get(*position) {
                Some(Slot::Floats(values)) if values.len() == layout.width => {
                    column.extend_floats(values)?
                }
                Some(Slot::Words(values)) if values.len() == layout.width => {
                    column.extend_words(values)?
                }
                Some(other) => bail!(
                    "routine left slot `{}` with {} values, expected {}",
                    layout.name,
                    other.len(),
                    layout.width
                ),
                None => bail!("record is missing slot `{}`", layout.name),
            }
        }

        if let Some(results) = &mut self.results {
            let value = result
                .ok_or_else(|| anyhow!("routine returned no value for instance {}", self.next))?;
            results.push_float(value)?;
        }
        self.next += 1;
        Ok(())
    }

    pub fn finish(self) -> Result<BatchOutput> {
        if self.next != self.range.end {
            bail!(
                "batch [{}, {}) collected only {} instances",
                self.range.start,
                self.range.end,
                self.next - self.range.start
            );
        }
        Ok(BatchOutput {
            start: self.range.start,
            end: self.range.end,
            columns: self.columns,
            results: self.results,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array2};
    use parafit_ir::{engine_error, inout, input, output, ElementType, FunctionBuilder};
    use std::sync::Arc;

    fn axpy() -> Arc<FunctionDescriptor> {
        FunctionBuilder::new("axpy")
            .returns(ElementType::Float)
            .param(input("x", ElementType::Float))
            .param(input("offset", ElementType::Float))
            .scalar("scale", ElementType::Float)
            .param(output("y", ElementType::Float))
            .build()
            .unwrap()
    }

    fn inputs(entries: Vec<(&str, Input)>) -> KernelInputs {
        entries
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect()
    }

    #[test]
    fn scalar_against_array_broadcasts_to_instance_count() {
        let call = bind(
            &axpy(),
            &inputs(vec![
                ("x", Array1::<f64>::zeros(37).into()),
                ("offset", Input::Scalar(2.0)),
                ("scale", Input::Scalar(3.0)),
                ("y", KernelData::zeros(&[37], ElementType::Float).into()),
            ]),
            Precision::Double,
        )
        .unwrap();

        assert_eq!(call.instances(), 37);
        let offset = call.bindings()[1].data.buffer().unwrap();
        assert_eq!(offset.shape(), &[37]);
        assert!(matches!(call.bindings()[2].data, KernelData::HostScalar(v) if v == 3.0));
        assert_eq!(call.results().map(|r| r.shape().to_vec()), Some(vec![37]));
    }

    #[test]
    fn mismatched_leading_dimensions_are_shape_errors() {
        let err = bind(
            &axpy(),
            &inputs(vec![
                ("x", Array1::<f64>::zeros(10).into()),
                ("offset", Array1::<f64>::zeros(11).into()),
                ("scale", Input::Scalar(1.0)),
                ("y", KernelData::zeros(&[10], ElementType::Float).into()),
            ]),
            Precision::Double,
        )
        .unwrap_err();
        assert!(matches!(engine_error(&err), Some(EngineError::Shape { .. })));
    }

    #[test]
    fn missing_parameters_are_reported() {
        let err = bind(
            &axpy(),
            &inputs(vec![("x", Array1::<f64>::zeros(3).into())]),
            Precision::Double,
        )
        .unwrap_err();
        assert!(err.to_string().contains("offset"));
    }

    #[test]
    fn arrays_follow_call_precision() {
        let call = bind(
            &axpy(),
            &inputs(vec![
                ("x", Array1::<f64>::from_elem(4, 0.5).into()),
                ("offset", Input::Scalar(0.0)),
                ("scale", Input::Scalar(1.0)),
                ("y", KernelData::zeros(&[4], ElementType::Float).into()),
            ]),
            Precision::Single,
        )
        .unwrap();
        assert_eq!(call.bindings()[0].data.buffer().unwrap().dtype(), DataType::F32);
        assert_eq!(call.layout().slots[3].storage, DataType::F32);
        assert_eq!(call.layout().result, Some(DataType::F32));
    }

    #[test]
    fn dotted_names_bind_by_sanitized_key() {
        let function = FunctionBuilder::new("f")
            .param(input("model.x", ElementType::Float))
            .build()
            .unwrap();
        let call = bind(
            &function,
            &inputs(vec![("model_x", Array1::<f64>::zeros(2).into())]),
            Precision::Double,
        )
        .unwrap();
        assert_eq!(call.layout().slots[0].name, "model_x");
        assert!(call.values().contains_key("model_x"));
    }

    #[test]
    fn single_row_inputs_broadcast_read_only() {
        let function = FunctionBuilder::new("shift")
            .param(input("origin", ElementType::Float))
            .param(inout("points", ElementType::Float))
            .build()
            .unwrap();
        let call = bind(
            &function,
            &inputs(vec![
                ("origin", KernelData::read_only(array![[1.0, 2.0]]).into()),
                ("points", Array2::<f64>::zeros((5, 2)).into()),
            ]),
            Precision::Double,
        )
        .unwrap();
        assert!(call.layout().slots[0].broadcast);
        assert_eq!(call.record(4).unwrap().floats(0).unwrap(), &[1.0, 2.0]);

        let err = bind(
            &function,
            &inputs(vec![
                ("origin", Array2::<f64>::zeros((5, 2)).into()),
                ("points", KernelData::array(array![[0.0, 0.0]]).into()),
            ]),
            Precision::Double,
        )
        .unwrap_err();
        assert!(matches!(engine_error(&err), Some(EngineError::Shape { .. })));
    }

    #[test]
    fn raw_single_row_arrays_do_not_broadcast_into_written_slots() {
        let function = FunctionBuilder::new("shift")
            .param(input("origin", ElementType::Float))
            .param(inout("points", ElementType::Float))
            .build()
            .unwrap();
        let err = bind(
            &function,
            &inputs(vec![
                ("origin", Array2::<f64>::zeros((5, 2)).into()),
                ("points", array![[0.0, 0.0]].into()),
            ]),
            Precision::Double,
        )
        .unwrap_err();
        assert!(matches!(engine_error(&err), Some(EngineError::Shape { .. })));
        assert!(err.to_string().contains("points"));

        let call = bind(
            &function,
            &inputs(vec![
                ("origin", array![[1.0, 2.0]].into()),
                ("points", Array2::<f64>::zeros((5, 2)).into()),
            ]),
            Precision::Double,
        )
        .unwrap();
        assert_eq!(call.record(4).unwrap().floats(0).unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn collected_batches_merge_by_instance_index() {
        let function = axpy();
        let mut caller = inputs(vec![
            ("x", array![1.0, 2.0, 3.0, 4.0].into()),
            ("offset", Input::Scalar(0.5)),
            ("scale", Input::Scalar(2.0)),
            ("y", KernelData::zeros(&[4], ElementType::Float).into()),
        ]);
        let mut call = bind(&function, &caller, Precision::Double).unwrap();

        let mut outputs = Vec::new();
        for range in [0..3, 3..4] {
            let mut collector = call.collector(range.clone());
            for index in range {
                let mut record = call.record(index).unwrap();
                let value = record.scalar(2).unwrap() * record.floats(0).unwrap()[0]
                    + record.floats(1).unwrap()[0];
                record.set_floats(3, &[value]).unwrap();
                collector.push(record, Some(-value)).unwrap();
            }
            outputs.push(collector.finish().unwrap());
        }
        for output in &outputs {
            call.merge(output).unwrap();
        }
        call.copy_back(&mut caller);

        let y = caller["y"]
            .kernel_data()
            .and_then(KernelData::buffer)
            .and_then(HostBuffer::as_f64)
            .unwrap()
            .clone();
        for (value, expected) in y.iter().zip([2.5, 4.5, 6.5, 8.5]) {
            assert_abs_diff_eq!(*value, expected);
        }
        let results = call.take_results().unwrap();
        assert_abs_diff_eq!(results.as_f64().unwrap()[[3]], -8.5);
    }

    #[test]
    fn collector_rejects_resized_slots_and_missing_results() {
        let call = bind(
            &axpy(),
            &inputs(vec![
                ("x", Array1::<f64>::zeros(2).into()),
                ("offset", Input::Scalar(0.0)),
                ("scale", Input::Scalar(1.0)),
                ("y", KernelData::zeros(&[2], ElementType::Float).into()),
            ]),
            Precision::Double,
        )
        .unwrap();

        let mut collector = call.collector(0..2);
        assert!(collector.push(call.record(1).unwrap(), Some(0.0)).is_err());
        assert!(collector.push(call.record(0).unwrap(), None).is_err());

        let mut collector = call.collector(0..2);
        collector.push(call.record(0).unwrap(), Some(0.0)).unwrap();
        assert!(collector.finish().is_err());
    }
}
