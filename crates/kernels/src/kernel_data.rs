//! Host-side storage bound to routine parameters.

use anyhow::{anyhow, bail, Result};
use ndarray::{ArrayD, Axis, Dimension, IxDyn};
use parafit_ir::{DataType, ElementType};
use std::collections::BTreeMap;

/// Owned host buffer of one concrete element type.
#[derive(Debug, Clone, PartialEq)]
pub enum HostBuffer {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    U32(ArrayD<u32>),
}

impl HostBuffer {
    pub fn zeros(shape: &[usize], dtype: DataType) -> Self {
        let dim = IxDyn(shape);
        match dtype {
            DataType::F32 => HostBuffer::F32(ArrayD::zeros(dim)),
            DataType::F64 => HostBuffer::F64(ArrayD::zeros(dim)),
            DataType::U32 => HostBuffer::U32(ArrayD::zeros(dim)),
        }
    }

    /// One-dimensional buffer of `len` copies of `value`.
    pub fn filled(len: usize, value: f64, dtype: DataType) -> Self {
        let dim = IxDyn(&[len]);
        match dtype {
            DataType::F32 => HostBuffer::F32(ArrayD::from_elem(dim, value as f32)),
            DataType::F64 => HostBuffer::F64(ArrayD::from_elem(dim, value)),
            DataType::U32 => HostBuffer::U32(ArrayD::from_elem(dim, value as u32)),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            HostBuffer::F32(_) => DataType::F32,
            HostBuffer::F64(_) => DataType::F64,
            HostBuffer::U32(_) => DataType::U32,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            HostBuffer::F32(data) => data.shape(),
            HostBuffer::F64(data) => data.shape(),
            HostBuffer::U32(data) => data.shape(),
        }
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of instance rows; zero-dimensional buffers count as one row.
    pub fn leading_dim(&self) -> usize {
        self.shape().first().copied().unwrap_or(1)
    }

    /// Elements per instance row.
    pub fn row_width(&self) -> usize {
        self.shape().iter().skip(1).product()
    }

    pub fn convert(&self, dtype: DataType) -> HostBuffer {
        if self.dtype() == dtype {
            return self.clone();
        }
        let values = self.to_f64();
        match dtype {
            DataType::F32 => HostBuffer::F32(values.mapv(|v| v as f32)),
            DataType::F64 => HostBuffer::F64(values),
            DataType::U32 => HostBuffer::U32(values.mapv(|v| v as u32)),
        }
    }

    pub fn to_f64(&self) -> ArrayD<f64> {
        match self {
            HostBuffer::F32(data) => data.mapv(f64::from),
            HostBuffer::F64(data) => data.clone(),
            HostBuffer::U32(data) => data.mapv(f64::from),
        }
    }

    pub fn as_f32(&self) -> Option<&ArrayD<f32>> {
        match self {
            HostBuffer::F32(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&ArrayD<f64>> {
        match self {
            HostBuffer::F64(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<&ArrayD<u32>> {
        match self {
            HostBuffer::U32(data) => Some(data),
            _ => None,
        }
    }

    /// Contiguous row-major copy, with zero-dimensional buffers lifted to one row.
    pub(crate) fn standardized(&self) -> HostBuffer {
        fn lift<T: Clone>(data: &ArrayD<T>) -> ArrayD<T> {
            let owned = data.as_standard_layout().into_owned();
            if owned.ndim() == 0 {
                owned.insert_axis(Axis(0))
            } else {
                owned
            }
        }
        match self {
            HostBuffer::F32(data) => HostBuffer::F32(lift(data)),
            HostBuffer::F64(data) => HostBuffer::F64(lift(data)),
            HostBuffer::U32(data) => HostBuffer::U32(lift(data)),
        }
    }

    /// Repeats a single-row buffer `rows` times along the leading axis.
    pub(crate) fn repeat_rows(&self, rows: usize) -> Result<HostBuffer> {
        fn repeat<T: Clone>(data: &ArrayD<T>, rows: usize) -> Result<ArrayD<T>> {
            let mut shape = data.shape().to_vec();
            if shape.first() != Some(&1) {
                bail!("only single-row buffers can be repeated, got shape {shape:?}");
            }
            shape[0] = rows;
            Ok(data
                .broadcast(IxDyn(&shape))
                .ok_or_else(|| anyhow!("cannot broadcast to {shape:?}"))?
                .as_standard_layout()
                .into_owned())
        }
        Ok(match self {
            HostBuffer::F32(data) => HostBuffer::F32(repeat(data, rows)?),
            HostBuffer::F64(data) => HostBuffer::F64(repeat(data, rows)?),
            HostBuffer::U32(data) => HostBuffer::U32(repeat(data, rows)?),
        })
    }

    pub(crate) fn flat_row(&self, row: usize, width: usize) -> Result<FlatBuffer> {
        let range = row * width..(row + 1) * width;
        Ok(match self {
            HostBuffer::F32(data) => FlatBuffer::F32(contiguous(data)?[range].to_vec()),
            HostBuffer::F64(data) => FlatBuffer::F64(contiguous(data)?[range].to_vec()),
            HostBuffer::U32(data) => FlatBuffer::U32(contiguous(data)?[range].to_vec()),
        })
    }

    /// Contiguous rows `[start, end)` as a flat buffer.
    pub fn flat_rows(&self, start: usize, end: usize) -> Result<FlatBuffer> {
        let width = self.row_width();
        let range = start * width..end * width;
        Ok(match self {
            HostBuffer::F32(data) => FlatBuffer::F32(contiguous(data)?[range].to_vec()),
            HostBuffer::F64(data) => FlatBuffer::F64(contiguous(data)?[range].to_vec()),
            HostBuffer::U32(data) => FlatBuffer::U32(contiguous(data)?[range].to_vec()),
        })
    }

    /// Overwrites rows starting at `start_row` with a flat block.
    pub fn write_rows(&mut self, start_row: usize, block: &FlatBuffer) -> Result<()> {
        let width = self.row_width();
        let offset = start_row * width;
        match (self, block) {
            (HostBuffer::F32(data), FlatBuffer::F32(values)) => {
                write_slice(contiguous_mut(data)?, offset, values)
            }
            (HostBuffer::F64(data), FlatBuffer::F64(values)) => {
                write_slice(contiguous_mut(data)?, offset, values)
            }
            (HostBuffer::U32(data), FlatBuffer::U32(values)) => {
                write_slice(contiguous_mut(data)?, offset, values)
            }
            (target, block) => bail!(
                "cannot write a {} block into a {} buffer",
                block.dtype().as_str(),
                target.dtype().as_str()
            ),
        }
    }
}

fn contiguous<T>(data: &ArrayD<T>) -> Result<&[T]> {
    data.as_slice()
        .ok_or_else(|| anyhow!("host buffer is not in standard layout"))
}

fn contiguous_mut<T>(data: &mut ArrayD<T>) -> Result<&mut [T]> {
    data.as_slice_mut()
        .ok_or_else(|| anyhow!("host buffer is not in standard layout"))
}

fn write_slice<T: Copy>(target: &mut [T], offset: usize, values: &[T]) -> Result<()> {
    let end = offset + values.len();
    if end > target.len() {
        bail!(
            "block of {} values at offset {offset} overruns buffer of {}",
            values.len(),
            target.len()
        );
    }
    target[offset..end].copy_from_slice(values);
    Ok(())
}

macro_rules! impl_host_buffer_from {
    ($elem:ty, $variant:ident) => {
        impl<D: Dimension> From<ndarray::Array<$elem, D>> for HostBuffer {
            fn from(data: ndarray::Array<$elem, D>) -> Self {
                HostBuffer::$variant(data.into_dyn())
            }
        }
    };
}

impl_host_buffer_from!(f32, F32);
impl_host_buffer_from!(f64, F64);
impl_host_buffer_from!(u32, U32);

/// Flat block of values, used for batch transfers.
#[derive(Debug, Clone, PartialEq)]
pub enum FlatBuffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
    U32(Vec<u32>),
}

impl FlatBuffer {
    pub fn with_capacity(dtype: DataType, capacity: usize) -> Self {
        match dtype {
            DataType::F32 => FlatBuffer::F32(Vec::with_capacity(capacity)),
            DataType::F64 => FlatBuffer::F64(Vec::with_capacity(capacity)),
            DataType::U32 => FlatBuffer::U32(Vec::with_capacity(capacity)),
        }
    }

    pub fn dtype(&self) -> DataType {
        match self {
            FlatBuffer::F32(_) => DataType::F32,
            FlatBuffer::F64(_) => DataType::F64,
            FlatBuffer::U32(_) => DataType::U32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FlatBuffer::F32(values) => values.len(),
            FlatBuffer::F64(values) => values.len(),
            FlatBuffer::U32(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_float(&mut self, value: f64) -> Result<()> {
        match self {
            FlatBuffer::F32(values) => values.push(value as f32),
            FlatBuffer::F64(values) => values.push(value),
            FlatBuffer::U32(_) => bail!("cannot store a float in a u32 block"),
        }
        Ok(())
    }

    pub fn extend_floats(&mut self, row: &[f64]) -> Result<()> {
        match self {
            FlatBuffer::F32(values) => values.extend(row.iter().map(|v| *v as f32)),
            FlatBuffer::F64(values) => values.extend_from_slice(row),
            FlatBuffer::U32(_) => bail!("cannot store floats in a u32 block"),
        }
        Ok(())
    }

    pub fn extend_words(&mut self, row: &[u32]) -> Result<()> {
        match self {
            FlatBuffer::U32(values) => values.extend_from_slice(row),
            _ => bail!("cannot store words in a float block"),
        }
        Ok(())
    }
}

/// Storage bound to one parameter for one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum KernelData {
    HostArray {
        buffer: HostBuffer,
        readable: bool,
        writable: bool,
    },
    HostScalar(f64),
    /// Zero-filled output, allocated at bind time in the call's element type.
    ZeroedOutput {
        shape: Vec<usize>,
        dtype: ElementType,
        buffer: Option<HostBuffer>,
    },
}

impl KernelData {
    /// Read/write wrapper around a host array.
    pub fn array<B: Into<HostBuffer>>(buffer: B) -> Self {
        KernelData::HostArray {
            buffer: buffer.into(),
            readable: true,
            writable: true,
        }
    }

    pub fn read_only<B: Into<HostBuffer>>(buffer: B) -> Self {
        KernelData::HostArray {
            buffer: buffer.into(),
            readable: true,
            writable: false,
        }
    }

    pub fn zeros(shape: &[usize], dtype: ElementType) -> Self {
        KernelData::ZeroedOutput {
            shape: shape.to_vec(),
            dtype,
            buffer: None,
        }
    }

    pub fn scalar(value: f64) -> Self {
        KernelData::HostScalar(value)
    }

    /// Current host buffer; zeroed outputs have one once evaluated.
    pub fn buffer(&self) -> Option<&HostBuffer> {
        match self {
            KernelData::HostArray { buffer, .. } => Some(buffer),
            KernelData::ZeroedOutput { buffer, .. } => buffer.as_ref(),
            KernelData::HostScalar(_) => None,
        }
    }

    pub fn into_buffer(self) -> Option<HostBuffer> {
        match self {
            KernelData::HostArray { buffer, .. } => Some(buffer),
            KernelData::ZeroedOutput { buffer, .. } => buffer,
            KernelData::HostScalar(_) => None,
        }
    }

    pub fn is_writable(&self) -> bool {
        match self {
            KernelData::HostArray { writable, .. } => *writable,
            KernelData::ZeroedOutput { .. } => true,
            KernelData::HostScalar(_) => false,
        }
    }

    /// Leading dimension for instance counting; `None` for scalars.
    pub(crate) fn leading_dim(&self) -> Option<usize> {
        match self {
            KernelData::HostArray { buffer, .. } => Some(buffer.leading_dim()),
            KernelData::ZeroedOutput { shape, .. } => Some(shape.first().copied().unwrap_or(1)),
            KernelData::HostScalar(_) => None,
        }
    }
}

/// A caller-supplied value for one parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Scalar(f64),
    /// Raw array, bound read/write after conversion to the parameter's element type.
    Array(HostBuffer),
    Data(KernelData),
}

impl Input {
    pub(crate) fn leading_dim(&self) -> Option<usize> {
        match self {
            Input::Scalar(_) => None,
            Input::Array(buffer) => Some(buffer.leading_dim()),
            Input::Data(data) => data.leading_dim(),
        }
    }

    pub fn kernel_data(&self) -> Option<&KernelData> {
        match self {
            Input::Data(data) => Some(data),
            _ => None,
        }
    }
}

impl From<f64> for Input {
    fn from(value: f64) -> Self {
        Input::Scalar(value)
    }
}

impl From<KernelData> for Input {
    fn from(data: KernelData) -> Self {
        Input::Data(data)
    }
}

impl From<HostBuffer> for Input {
    fn from(buffer: HostBuffer) -> Self {
        Input::Array(buffer)
    }
}

impl<D: Dimension> From<ndarray::Array<f64, D>> for Input {
    fn from(data: ndarray::Array<f64, D>) -> Self {
        Input::Array(data.into())
    }
}

impl<D: Dimension> From<ndarray::Array<f32, D>> for Input {
    fn from(data: ndarray::Array<f32, D>) -> Self {
        Input::Array(data.into())
    }
}

/// Inputs keyed by parameter name.
pub type KernelInputs = BTreeMap<String, Input>;

/// Post-call value of a bound parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    Array(HostBuffer),
    Scalar(f64),
}

impl HostValue {
    pub fn buffer(&self) -> Option<&HostBuffer> {
        match self {
            HostValue::Array(buffer) => Some(buffer),
            HostValue::Scalar(_) => None,
        }
    }
}
