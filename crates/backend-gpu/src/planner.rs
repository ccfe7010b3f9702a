//! Buffer and workgroup planning for one device batch.

use anyhow::{bail, Result};
use parafit_ir::{RecordLayout, WORKGROUP_SIZE};

/// Smallest buffer wgpu will bind.
const MIN_BINDING_BYTES: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPlan {
    /// Elements uploaded for this slot.
    pub elements: usize,
    pub bytes: u64,
    pub read_back: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuBatchPlan {
    pub count: u32,
    pub workgroups: u32,
    pub slots: Vec<SlotPlan>,
    pub result_bytes: Option<u64>,
}

pub struct GpuPlanner {
    max_storage_buffers: u32,
    max_workgroups: u32,
    max_buffer_bytes: u64,
}

impl GpuPlanner {
    pub fn new(limits: &wgpu::Limits) -> Self {
        Self {
            max_storage_buffers: limits.max_storage_buffers_per_shader_stage,
            max_workgroups: limits.max_compute_workgroups_per_dimension,
            max_buffer_bytes: limits.max_storage_buffer_binding_size as u64,
        }
    }

    /// Whether a record layout fits the device's binding limits.
    pub fn fits(&self, layout: &RecordLayout) -> bool {
        let buffers = layout.slots.len() + usize::from(layout.result.is_some());
        layout.device_compatible() && buffers as u64 <= u64::from(self.max_storage_buffers)
    }

    pub fn plan_batch(&self, layout: &RecordLayout, count: usize) -> Result<GpuBatchPlan> {
        if !self.fits(layout) {
            bail!("record layout exceeds the device binding limits");
        }

        let workgroups = workgroups_for(count);
        if workgroups > self.max_workgroups {
            bail!(
                "batch of {count} instances needs {workgroups} workgroups, device allows {}",
                self.max_workgroups
            );
        }

        let mut slots = Vec::with_capacity(layout.slots.len());
        for slot in &layout.slots {
            let elements = if slot.host_scalar || slot.broadcast {
                slot.width
            } else {
                slot.width * count
            };
            let bytes = padded_bytes(elements, slot.storage.element_size_bytes());
            if bytes > self.max_buffer_bytes {
                bail!(
                    "slot `{}` needs {bytes} bytes, device allows {}",
                    slot.name,
                    self.max_buffer_bytes
                );
            }
            slots.push(SlotPlan {
                elements,
                bytes,
                read_back: slot.writable,
            });
        }

        let result_bytes = layout
            .result
            .map(|dtype| padded_bytes(count, dtype.element_size_bytes()));

        Ok(GpuBatchPlan {
            count: count as u32,
            workgroups,
            slots,
            result_bytes,
        })
    }
}

pub fn workgroups_for(count: usize) -> u32 {
    (count as u32).div_ceil(WORKGROUP_SIZE).max(1)
}

fn padded_bytes(elements: usize, element_size: usize) -> u64 {
    ((elements * element_size) as u64).max(MIN_BINDING_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parafit_ir::{DataType, SlotLayout};

    fn slot(name: &str, storage: DataType, width: usize) -> SlotLayout {
        SlotLayout {
            name: name.into(),
            storage,
            width,
            broadcast: false,
            by_value: false,
            host_scalar: false,
            writable: false,
        }
    }

    #[test]
    fn plans_buffers_per_slot_kind() {
        let planner = GpuPlanner::new(&wgpu::Limits::default());
        let layout = RecordLayout {
            slots: vec![
                SlotLayout {
                    writable: true,
                    ..slot("x", DataType::F32, 3)
                },
                SlotLayout {
                    broadcast: true,
                    ..slot("origin", DataType::F32, 3)
                },
                SlotLayout {
                    host_scalar: true,
                    by_value: true,
                    ..slot("scale", DataType::F32, 1)
                },
                slot("state", DataType::U32, 0),
            ],
            result: Some(DataType::F32),
        };

        let plan = planner.plan_batch(&layout, 100).unwrap();
        assert_eq!(plan.workgroups, 2);
        assert_eq!(plan.slots[0].elements, 300);
        assert!(plan.slots[0].read_back);
        assert_eq!(plan.slots[1].bytes, 12);
        assert_eq!(plan.slots[2].elements, 1);
        assert_eq!(plan.slots[3].bytes, 4);
        assert_eq!(plan.result_bytes, Some(400));
    }

    #[test]
    fn double_precision_layouts_do_not_fit() {
        let planner = GpuPlanner::new(&wgpu::Limits::default());
        let layout = RecordLayout {
            slots: vec![slot("x", DataType::F64, 2)],
            result: None,
        };
        assert!(!planner.fits(&layout));
        assert!(planner.plan_batch(&layout, 4).is_err());
    }

    #[test]
    fn workgroups_round_up() {
        assert_eq!(workgroups_for(0), 1);
        assert_eq!(workgroups_for(64), 1);
        assert_eq!(workgroups_for(65), 2);
    }
}
