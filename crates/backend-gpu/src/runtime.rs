//! GPU runtime for lowered programs, using wgpu.
//!
//! Every batch uploads the rows it covers, runs the generated `evaluate`
//! entry point once per instance, and reads back the writable slots and
//! results. Nothing survives between batches.

use crate::planner::{GpuBatchPlan, GpuPlanner};
use anyhow::{anyhow, bail, Result};
use bytemuck::{cast_slice, Pod, Zeroable};
use parafit_ir::{DataType, Program, SlotLayout, WRAPPER_ENTRY};
use parafit_kernels::{
    BackendInfo, BackendKind, BatchOutput, BoundCall, ComputeBackend, FlatBuffer, KernelData,
};
use pollster::block_on;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::mpsc;
use tracing::{debug, info, warn};
use wgpu::util::DeviceExt;

/// Opens every usable hardware adapter as a backend. Adapters that fail to
/// initialise are skipped with a warning.
pub fn enumerate_gpu_backends() -> Vec<GpuBackend> {
    let instance = wgpu::Instance::default();
    instance
        .enumerate_adapters(wgpu::Backends::all())
        .into_iter()
        .filter(|adapter| adapter.get_info().device_type != wgpu::DeviceType::Cpu)
        .enumerate()
        .filter_map(|(index, adapter)| match GpuBackend::from_adapter(adapter, index) {
            Ok(backend) => Some(backend),
            Err(err) => {
                warn!(index, error = %err, "skipping GPU adapter");
                None
            }
        })
        .collect()
}

pub struct GpuBackend {
    info: BackendInfo,
    context: GpuContext,
    planner: GpuPlanner,
}

struct GpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

impl GpuBackend {
    pub fn from_adapter(adapter: wgpu::Adapter, index: usize) -> Result<Self> {
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = block_on(adapter.request_device(
            &wgpu::DeviceDescriptor {
                label: Some("parafit GPU device"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
            },
            None,
        ))?;

        let info = BackendInfo {
            name: format!("gpu{index}"),
            kind: BackendKind::Gpu,
            device: format!("{} ({:?})", adapter_info.name, adapter_info.backend),
            parallelism: limits.max_compute_invocations_per_workgroup as usize,
        };
        info!(backend = %info.name, device = %info.device, "initialised GPU backend");

        Ok(Self {
            info,
            context: GpuContext { device, queue },
            planner: GpuPlanner::new(&limits),
        })
    }
}

impl ComputeBackend for GpuBackend {
    fn info(&self) -> &BackendInfo {
        &self.info
    }

    fn supports(&self, program: &Program) -> bool {
        program.device_source.is_some() && self.planner.fits(&program.layout)
    }

    fn run_batch(
        &self,
        program: &Program,
        call: &BoundCall,
        range: Range<usize>,
    ) -> Result<BatchOutput> {
        let source = program
            .device_source
            .as_deref()
            .ok_or_else(|| anyhow!("routine `{}` has no device source", program.name()))?;
        if range.is_empty() {
            return call.collector(range).finish();
        }

        let plan = self.planner.plan_batch(call.layout(), range.len())?;
        debug!(
            backend = %self.info.name,
            routine = program.name(),
            start = range.start,
            end = range.end,
            workgroups = plan.workgroups,
            "running GPU batch"
        );
        self.context.run(source, call, &plan, range)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct BatchInfo {
    count: u32,
    _pad: [u32; 3],
}

impl GpuContext {
    fn run(
        &self,
        source: &str,
        call: &BoundCall,
        plan: &GpuBatchPlan,
        range: Range<usize>,
    ) -> Result<BatchOutput> {
        let layout = call.layout();
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);

        let info_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("batch_info"),
                contents: cast_slice(&[BatchInfo {
                    count: plan.count,
                    _pad: [0; 3],
                }]),
                usage: wgpu::BufferUsages::UNIFORM,
            });

        let mut slot_buffers = Vec::with_capacity(layout.slots.len());
        for (position, (slot, slot_plan)) in layout.slots.iter().zip(&plan.slots).enumerate() {
            let contents = upload_bytes(call, position, slot, &range)?;
            let mut usage = wgpu::BufferUsages::STORAGE;
            if slot_plan.read_back {
                usage |= wgpu::BufferUsages::COPY_SRC;
            }
            slot_buffers.push(
                self.device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(slot.name.as_str()),
                        contents: &contents,
                        usage,
                    }),
            );
        }

        let result_buffer = plan.result_bytes.map(|size| {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("results"),
                size,
                usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        });

        let mut layout_entries = vec![wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: NonZeroU64::new(std::mem::size_of::<BatchInfo>() as u64),
            },
            count: None,
        }];
        for (index, slot) in layout.slots.iter().enumerate() {
            layout_entries.push(storage_entry(index as u32 + 1, !slot.writable));
        }
        if result_buffer.is_some() {
            layout_entries.push(storage_entry(layout.slots.len() as u32 + 1, false));
        }

        let bind_group_layout =
            self.device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("record_layout"),
                    entries: &layout_entries,
                });

        let mut group_entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: info_buffer.as_entire_binding(),
        }];
        for (index, buffer) in slot_buffers.iter().enumerate() {
            group_entries.push(wgpu::BindGroupEntry {
                binding: index as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }
        if let Some(buffer) = &result_buffer {
            group_entries.push(wgpu::BindGroupEntry {
                binding: slot_buffers.len() as u32 + 1,
                resource: buffer.as_entire_binding(),
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("record_bind_group"),
            layout: &bind_group_layout,
            entries: &group_entries,
        });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("record_pipeline_layout"),
                bind_group_layouts: &[&bind_group_layout],
                push_constant_ranges: &[],
            });
        let shader_module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("record_shader"),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("record_pipeline"),
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: WRAPPER_ENTRY,
            });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("record_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("record_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(plan.workgroups, 1, 1);
        }

        let mut staged = Vec::new();
        for (position, slot_plan) in plan.slots.iter().enumerate() {
            if slot_plan.read_back {
                let staging = self.staging_buffer(slot_plan.bytes);
                encoder.copy_buffer_to_buffer(
                    &slot_buffers[position],
                    0,
                    &staging,
                    0,
                    slot_plan.bytes,
                );
                staged.push((position, staging));
            }
        }
        let staged_results = match (&result_buffer, plan.result_bytes) {
            (Some(buffer), Some(bytes)) => {
                let staging = self.staging_buffer(bytes);
                encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, bytes);
                Some(staging)
            }
            _ => None,
        };

        self.queue.submit(Some(encoder.finish()));
        if let Some(error) = block_on(self.device.pop_error_scope()) {
            bail!("device rejected the batch: {error}");
        }

        let mut columns = Vec::with_capacity(staged.len());
        for (position, staging) in staged {
            let slot = &layout.slots[position];
            let values = self.read_back(&staging, slot.storage, plan.slots[position].elements)?;
            columns.push((position, values));
        }
        let results = match (staged_results, layout.result) {
            (Some(staging), Some(dtype)) => Some(self.read_back(&staging, dtype, range.len())?),
            _ => None,
        };

        Ok(BatchOutput {
            start: range.start,
            end: range.end,
            columns,
            results,
        })
    }

    fn staging_buffer(&self, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn read_back(
        &self,
        staging: &wgpu::Buffer,
        dtype: DataType,
        elements: usize,
    ) -> Result<FlatBuffer> {
        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = sender.send(res);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|_| anyhow!("failed to receive GPU map signal"))??;

        let data = slice.get_mapped_range();
        let values = match dtype {
            DataType::F32 => {
                let words: &[f32] = cast_slice(&data);
                FlatBuffer::F32(words[..elements].to_vec())
            }
            DataType::U32 => {
                let words: &[u32] = cast_slice(&data);
                FlatBuffer::U32(words[..elements].to_vec())
            }
            DataType::F64 => bail!("f64 buffers cannot be read back from the device"),
        };
        drop(data);
        staging.unmap();
        Ok(values)
    }
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// Bytes uploaded for one slot: the batch's rows, row 0 when broadcast, or the host scalar.
fn upload_bytes(
    call: &BoundCall,
    position: usize,
    slot: &SlotLayout,
    range: &Range<usize>,
) -> Result<Vec<u8>> {
    let flat = match &call.bindings()[position].data {
        KernelData::HostScalar(value) => match slot.storage {
            DataType::F32 => FlatBuffer::F32(vec![*value as f32]),
            DataType::U32 => FlatBuffer::U32(vec![*value as u32]),
            DataType::F64 => FlatBuffer::F64(vec![*value]),
        },
        KernelData::HostArray { buffer, .. } if slot.broadcast => buffer.flat_rows(0, 1)?,
        KernelData::HostArray { buffer, .. } => buffer.flat_rows(range.start, range.end)?,
        KernelData::ZeroedOutput { .. } => bail!("slot `{}` was never allocated", slot.name),
    };
    let mut bytes = match &flat {
        FlatBuffer::F32(values) => cast_slice::<f32, u8>(values).to_vec(),
        FlatBuffer::U32(values) => cast_slice::<u32, u8>(values).to_vec(),
        FlatBuffer::F64(_) => bail!("slot `{}` holds f64 values", slot.name),
    };
    if bytes.is_empty() {
        bytes.resize(4, 0);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use parafit_ir::{input, ElementType, FunctionBuilder, Precision};
    use parafit_kernels::{bind, Input, KernelInputs};

    #[test]
    fn uploads_cover_only_the_batch_rows() {
        let function = FunctionBuilder::new("f")
            .param(input("x", ElementType::Float))
            .param(input("origin", ElementType::Float))
            .scalar("scale", ElementType::Float)
            .build()
            .unwrap();
        let inputs: KernelInputs = [
            ("x".to_string(), Input::from(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]])),
            (
                "origin".to_string(),
                Input::Data(KernelData::read_only(array![[7.0f32, 8.0]])),
            ),
            ("scale".to_string(), Input::Scalar(0.5)),
        ]
        .into_iter()
        .collect();
        let call = bind(&function, &inputs, Precision::Single).unwrap();
        let floats = |bytes: Vec<u8>| -> Vec<f32> {
            bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect()
        };
        let slots = &call.layout().slots;

        let rows = upload_bytes(&call, 0, &slots[0], &(1..3)).unwrap();
        assert_eq!(floats(rows), vec![3.0, 4.0, 5.0, 6.0]);
        let origin = upload_bytes(&call, 1, &slots[1], &(1..3)).unwrap();
        assert_eq!(floats(origin), vec![7.0, 8.0]);
        let scale = upload_bytes(&call, 2, &slots[2], &(1..3)).unwrap();
        assert_eq!(floats(scale), vec![0.5]);
    }
}
