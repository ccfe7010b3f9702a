//! Lowering of a bound routine into a dispatchable program.
//!
//! A program pairs the composed routine unit with the wrapper that unpacks the
//! flat per-instance record into the routine's call signature. The host form of
//! the wrapper is the routine's native implementation driven by the backend;
//! the device form is emitted here as WGSL.

use crate::dialect::{DataType, FunctionDescriptor, Precision};
use crate::registry::ComposedSource;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};
use std::sync::Arc;

/// Name of the generated entry point.
pub const WRAPPER_ENTRY: &str = "evaluate";

pub const WORKGROUP_SIZE: u32 = 64;

/// Layout of one bound parameter inside the per-instance record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotLayout {
    /// Sanitized parameter name.
    pub name: String,
    pub storage: DataType,
    /// Elements per instance.
    pub width: usize,
    /// Every instance reads row 0.
    pub broadcast: bool,
    /// The formal parameter is a scalar, passed by value.
    pub by_value: bool,
    /// Bound to a host scalar rather than a buffer.
    pub host_scalar: bool,
    pub writable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    pub slots: Vec<SlotLayout>,
    /// Storage type of the dedicated result slot for non-void routines.
    pub result: Option<DataType>,
}

impl RecordLayout {
    pub fn writable_slots(&self) -> impl Iterator<Item = (usize, &SlotLayout)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.writable)
    }

    pub fn record_width(&self) -> usize {
        self.slots.iter().map(|slot| slot.width).sum::<usize>()
            + usize::from(self.result.is_some())
    }

    pub fn device_compatible(&self) -> bool {
        self.slots
            .iter()
            .map(|slot| slot.storage)
            .chain(self.result)
            .all(|storage| storage.wgsl_type().is_some())
    }
}

/// A routine ready for dispatch on any backend.
#[derive(Debug, Clone)]
pub struct Program {
    pub entry: Arc<FunctionDescriptor>,
    pub composed: Arc<ComposedSource>,
    pub layout: RecordLayout,
    pub precision: Precision,
    /// Device source, present when every slot has a WGSL element type.
    pub device_source: Option<String>,
}

impl Program {
    pub fn lower(
        entry: Arc<FunctionDescriptor>,
        composed: Arc<ComposedSource>,
        layout: RecordLayout,
        precision: Precision,
    ) -> Self {
        let device_source = if layout.device_compatible() && !entry.source().is_empty() {
            emit_device_source(&entry, &composed, &layout).ok()
        } else {
            None
        };

        Self {
            entry,
            composed,
            layout,
            precision,
            device_source,
        }
    }

    pub fn name(&self) -> &str {
        self.entry.name()
    }
}

fn emit_device_source(
    entry: &FunctionDescriptor,
    composed: &ComposedSource,
    layout: &RecordLayout,
) -> Result<String, fmt::Error> {
    let mut text = String::new();

    for slot in layout.slots.iter().filter(|slot| !slot.by_value) {
        writeln!(
            text,
            "alias {}_record = array<{}, {}>;",
            slot.name,
            wgsl(slot.storage),
            slot.width
        )?;
    }
    text.push('\n');
    text.push_str(&composed.text);

    text.push_str("struct BatchInfo {\n  count: u32,\n  _pad0: u32,\n  _pad1: u32,\n  _pad2: u32,\n}\n\n");
    text.push_str("@group(0) @binding(0)\nvar<uniform> batch: BatchInfo;\n\n");

    for (index, slot) in layout.slots.iter().enumerate() {
        let access = if slot.writable { "read_write" } else { "read" };
        writeln!(
            text,
            "@group(0) @binding({})\nvar<storage, {}> buf_{}: array<{}>;\n",
            index + 1,
            access,
            slot.name,
            wgsl(slot.storage)
        )?;
    }
    if let Some(result) = layout.result {
        writeln!(
            text,
            "@group(0) @binding({})\nvar<storage, read_write> buf_results: array<{}>;\n",
            layout.slots.len() + 1,
            wgsl(result)
        )?;
    }

    writeln!(
        text,
        "@compute @workgroup_size({WORKGROUP_SIZE}, 1, 1)\nfn {WRAPPER_ENTRY}(@builtin(global_invocation_id) gid: vec3<u32>) {{"
    )?;
    text.push_str("  let instance = gid.x;\n  if (instance >= batch.count) {\n    return;\n  }\n");

    let mut call_args = Vec::with_capacity(layout.slots.len());
    for slot in &layout.slots {
        let row = if slot.broadcast || slot.host_scalar {
            "0u".to_string()
        } else {
            format!("instance * {}u", slot.width)
        };

        if slot.by_value {
            writeln!(
                text,
                "  let rec_{}: {} = buf_{}[{}];",
                slot.name,
                wgsl(slot.storage),
                slot.name,
                row
            )?;
            call_args.push(format!("rec_{}", slot.name));
        } else {
            writeln!(
                text,
                "  var rec_{name}: {name}_record;\n  for (var j: u32 = 0u; j < {width}u; j = j + 1u) {{\n    rec_{name}[j] = buf_{name}[{row} + j];\n  }}",
                name = slot.name,
                width = slot.width,
                row = row
            )?;
            call_args.push(format!("&rec_{}", slot.name));
        }
    }

    let call = format!("{}({})", entry.name(), call_args.join(", "));
    if layout.result.is_some() {
        writeln!(text, "  buf_results[instance] = {call};")?;
    } else {
        writeln!(text, "  {call};")?;
    }

    for slot in layout
        .slots
        .iter()
        .filter(|slot| slot.writable && !slot.by_value && !slot.broadcast)
    {
        writeln!(
            text,
            "  for (var j: u32 = 0u; j < {width}u; j = j + 1u) {{\n    buf_{name}[instance * {width}u + j] = rec_{name}[j];\n  }}",
            name = slot.name,
            width = slot.width
        )?;
    }
    text.push_str("}\n");
    Ok(text)
}

fn wgsl(storage: DataType) -> &'static str {
    storage.wgsl_type().unwrap_or("f32")
}
