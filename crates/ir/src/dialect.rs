//! Function descriptor vocabulary: element types, parameters and routines.

use crate::record::InstanceRecord;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Floating point precision requested for one evaluation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Single,
    #[default]
    Double,
}

impl Precision {
    pub fn float_type(&self) -> DataType {
        match self {
            Precision::Single => DataType::F32,
            Precision::Double => DataType::F64,
        }
    }
}

/// Concrete storage type of a host buffer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    F32,
    F64,
    U32,
}

impl DataType {
    pub fn element_size_bytes(&self) -> usize {
        match self {
            DataType::F32 | DataType::U32 => 4,
            DataType::F64 => 8,
        }
    }

    pub fn wgsl_type(&self) -> Option<&'static str> {
        match self {
            DataType::F32 => Some("f32"),
            DataType::U32 => Some("u32"),
            DataType::F64 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::U32 => "u32",
        }
    }
}

/// Declared element type of a parameter. `Float` follows the call precision.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    #[default]
    Float,
    F32,
    F64,
    U32,
}

impl ElementType {
    pub fn resolve(&self, precision: Precision) -> DataType {
        match self {
            ElementType::Float => precision.float_type(),
            ElementType::F32 => DataType::F32,
            ElementType::F64 => DataType::F64,
            ElementType::U32 => DataType::U32,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    pub fn is_written(&self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Scalar,
    Array,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Parameter {
    pub name: String,
    pub direction: Direction,
    pub kind: ParamKind,
    pub element: ElementType,
}

impl Parameter {
    pub fn new<N: Into<String>>(
        name: N,
        direction: Direction,
        kind: ParamKind,
        element: ElementType,
    ) -> Self {
        Self {
            name: name.into(),
            direction,
            kind,
            element,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ParamKind::Array)
    }

    /// Name usable as an identifier in generated source.
    pub fn source_name(&self) -> String {
        sanitize_name(&self.name)
    }
}

pub fn sanitize_name(name: &str) -> String {
    name.replace('.', "_")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum ReturnType {
    #[default]
    Void,
    Scalar(ElementType),
}

impl ReturnType {
    pub fn is_void(&self) -> bool {
        matches!(self, ReturnType::Void)
    }
}

/// Host implementation of a routine, invoked once per instance with its record.
///
/// Returns the scalar result for non-void routines, `None` otherwise.
pub type NativeRoutine = Arc<dyn Fn(&mut InstanceRecord) -> Result<Option<f64>> + Send + Sync>;

/// Immutable description of one numeric routine and its dependencies.
pub struct FunctionDescriptor {
    pub(crate) name: String,
    pub(crate) return_type: ReturnType,
    pub(crate) parameters: Vec<Parameter>,
    pub(crate) source: String,
    pub(crate) dependencies: Vec<Arc<FunctionDescriptor>>,
    pub(crate) native: Option<NativeRoutine>,
}

impl FunctionDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn return_type(&self) -> ReturnType {
        self.return_type
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|param| param.name == name)
    }

    /// Full definition text of this routine, excluding dependencies.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dependencies(&self) -> &[Arc<FunctionDescriptor>] {
        &self.dependencies
    }

    pub fn native(&self) -> Option<&NativeRoutine> {
        self.native.as_ref()
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("return_type", &self.return_type)
            .field("parameters", &self.parameters)
            .field(
                "dependencies",
                &self
                    .dependencies
                    .iter()
                    .map(|dep| dep.name.as_str())
                    .collect::<Vec<_>>(),
            )
            .field("native", &self.native.is_some())
            .finish()
    }
}
