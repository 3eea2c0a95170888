//! Named tensor records
//!
//! Each feature in a shard file is one serialized tensor message. The field
//! numbers and encodings match the ONNX `TensorProto` message for the fields
//! this loader reads, so corpora produced by existing tooling decode as-is.

use bytes::{BufMut, Bytes, BytesMut};

/// Element type of a tensor, numbered as in ONNX `TensorProto.DataType`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum DataType {
    Undefined = 0,
    Float = 1,
    Uint8 = 2,
    Int8 = 3,
    Uint16 = 4,
    Int16 = 5,
    Int32 = 6,
    Int64 = 7,
    String = 8,
    Bool = 9,
    Float16 = 10,
    Double = 11,
    Uint32 = 12,
    Uint64 = 13,
    Complex64 = 14,
    Complex128 = 15,
    Bfloat16 = 16,
}

impl DataType {
    /// Map a wire value to a known element type
    pub fn from_i32(value: i32) -> Option<Self> {
        let dtype = match value {
            0 => DataType::Undefined,
            1 => DataType::Float,
            2 => DataType::Uint8,
            3 => DataType::Int8,
            4 => DataType::Uint16,
            5 => DataType::Int16,
            6 => DataType::Int32,
            7 => DataType::Int64,
            8 => DataType::String,
            9 => DataType::Bool,
            10 => DataType::Float16,
            11 => DataType::Double,
            12 => DataType::Uint32,
            13 => DataType::Uint64,
            14 => DataType::Complex64,
            15 => DataType::Complex128,
            16 => DataType::Bfloat16,
            _ => return None,
        };
        Some(dtype)
    }

    /// Width of one element in `raw_data`, if fixed
    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DataType::Uint8 | DataType::Int8 | DataType::Bool => Some(1),
            DataType::Uint16 | DataType::Int16 | DataType::Float16 | DataType::Bfloat16 => Some(2),
            DataType::Float | DataType::Int32 | DataType::Uint32 => Some(4),
            DataType::Int64 | DataType::Uint64 | DataType::Double | DataType::Complex64 => Some(8),
            DataType::Complex128 => Some(16),
            DataType::Undefined | DataType::String => None,
        }
    }
}

/// One named tensor: name, element type, shape and element data
///
/// Element data arrives either as `raw_data` or in the typed repeated field
/// ONNX assigns to the element type. [`normalize_payload`] folds the typed
/// form into `raw_data`, which is the only form the rest of the loader reads.
///
/// [`normalize_payload`]: TensorRecord::normalize_payload
#[derive(Clone, PartialEq, prost::Message)]
pub struct TensorRecord {
    /// Shape
    #[prost(int64, repeated, packed = "false", tag = "1")]
    pub dims: Vec<i64>,
    /// Element type, see [`DataType`]
    #[prost(int32, tag = "2")]
    pub data_type: i32,
    /// FLOAT and COMPLEX64 elements
    #[prost(float, repeated, tag = "4")]
    pub float_data: Vec<f32>,
    /// INT32, INT16, INT8, UINT16, UINT8, BOOL, FLOAT16 and BFLOAT16 elements,
    /// each widened to an int32 (16-bit floats as their bit pattern)
    #[prost(int32, repeated, tag = "5")]
    pub int32_data: Vec<i32>,
    /// STRING elements
    #[prost(bytes = "vec", repeated, tag = "6")]
    pub string_data: Vec<Vec<u8>>,
    #[prost(int64, repeated, tag = "7")]
    pub int64_data: Vec<i64>,
    /// Logical name used to route the feature into a sample slot
    #[prost(string, tag = "8")]
    pub name: String,
    /// Element data, little-endian, row-major
    #[prost(bytes = "bytes", tag = "9")]
    pub raw_data: Bytes,
    /// DOUBLE and COMPLEX128 elements
    #[prost(double, repeated, tag = "10")]
    pub double_data: Vec<f64>,
    /// UINT32 and UINT64 elements
    #[prost(uint64, repeated, tag = "11")]
    pub uint64_data: Vec<u64>,
    #[prost(string, tag = "12")]
    pub doc_string: String,
}

impl TensorRecord {
    /// Create a record from its parts
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        dims: Vec<i64>,
        raw_data: Bytes,
    ) -> Self {
        Self {
            dims,
            data_type: data_type as i32,
            name: name.into(),
            raw_data,
            ..Default::default()
        }
    }

    /// Build a float tensor from host values
    pub fn from_f32(name: impl Into<String>, dims: Vec<i64>, values: &[f32]) -> Self {
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(name, DataType::Float, dims, Bytes::from(raw))
    }

    /// Build an int64 tensor from host values
    pub fn from_i64(name: impl Into<String>, dims: Vec<i64>, values: &[i64]) -> Self {
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(name, DataType::Int64, dims, Bytes::from(raw))
    }

    /// Element type, if the wire value is known
    pub fn element_type(&self) -> Option<DataType> {
        DataType::from_i32(self.data_type)
    }

    /// Product of the dims (1 for a scalar)
    pub fn num_elements(&self) -> i64 {
        self.dims.iter().product()
    }

    fn has_typed_payload(&self) -> bool {
        !(self.float_data.is_empty()
            && self.int32_data.is_empty()
            && self.string_data.is_empty()
            && self.int64_data.is_empty()
            && self.double_data.is_empty()
            && self.uint64_data.is_empty())
    }

    /// Move typed element data into `raw_data` and check its size
    ///
    /// After this, fixed-width tensors hold exactly
    /// `num_elements * size_in_bytes` bytes of `raw_data` and no typed data.
    /// STRING tensors keep `string_data`, one entry per element.
    pub fn normalize_payload(&mut self) -> Result<(), String> {
        let dtype = match self.element_type() {
            Some(DataType::Undefined) | None => {
                return Err(format!(
                    "tensor '{}' has unknown data type {}",
                    self.name, self.data_type
                ));
            }
            Some(dtype) => dtype,
        };
        if self.dims.iter().any(|d| *d < 0) {
            return Err(format!("tensor '{}' has negative dims {:?}", self.name, self.dims));
        }
        let elements = self.num_elements() as usize;

        let Some(width) = dtype.size_in_bytes() else {
            if self.string_data.len() != elements {
                return Err(format!(
                    "tensor '{}' holds {} strings, dims {:?} need {}",
                    self.name,
                    self.string_data.len(),
                    self.dims,
                    elements
                ));
            }
            return Ok(());
        };

        if self.has_typed_payload() {
            if !self.raw_data.is_empty() {
                return Err(format!(
                    "tensor '{}' carries both raw_data and typed data",
                    self.name
                ));
            }
            self.raw_data = self.take_typed_payload(dtype, width)?;
        }

        let expected = elements * width;
        if self.raw_data.len() != expected {
            return Err(format!(
                "tensor '{}' has {} payload bytes, dims {:?} of {:?} need {}",
                self.name,
                self.raw_data.len(),
                self.dims,
                dtype,
                expected
            ));
        }
        Ok(())
    }

    /// Drain the typed field that belongs to `dtype` into little-endian bytes
    fn take_typed_payload(&mut self, dtype: DataType, width: usize) -> Result<Bytes, String> {
        let mut raw = BytesMut::new();
        match dtype {
            DataType::Float | DataType::Complex64 => {
                for v in std::mem::take(&mut self.float_data) {
                    raw.put_f32_le(v);
                }
            }
            DataType::Double | DataType::Complex128 => {
                for v in std::mem::take(&mut self.double_data) {
                    raw.put_f64_le(v);
                }
            }
            DataType::Int64 => {
                for v in std::mem::take(&mut self.int64_data) {
                    raw.put_i64_le(v);
                }
            }
            DataType::Uint32 | DataType::Uint64 => {
                for v in std::mem::take(&mut self.uint64_data) {
                    raw.put_slice(&v.to_le_bytes()[..width]);
                }
            }
            DataType::Int32
            | DataType::Int16
            | DataType::Int8
            | DataType::Uint16
            | DataType::Uint8
            | DataType::Bool
            | DataType::Float16
            | DataType::Bfloat16 => {
                for v in std::mem::take(&mut self.int32_data) {
                    raw.put_slice(&v.to_le_bytes()[..width]);
                }
            }
            DataType::Undefined | DataType::String => {}
        }

        if self.has_typed_payload() {
            return Err(format!(
                "tensor '{}' of type {:?} carries data in a field for another type",
                self.name, dtype
            ));
        }
        Ok(raw.freeze())
    }

    /// Decode `raw_data` as float values
    pub fn to_f32(&self) -> Option<Vec<f32>> {
        if self.element_type() != Some(DataType::Float) {
            return None;
        }
        if self.raw_data.is_empty() && !self.float_data.is_empty() {
            return Some(self.float_data.clone());
        }
        if self.raw_data.len() % 4 != 0 {
            return None;
        }
        Some(
            self.raw_data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    /// Decode `raw_data` as int64 values
    pub fn to_i64(&self) -> Option<Vec<i64>> {
        if self.element_type() != Some(DataType::Int64) {
            return None;
        }
        if self.raw_data.is_empty() && !self.int64_data.is_empty() {
            return Some(self.int64_data.clone());
        }
        if self.raw_data.len() % 8 != 0 {
            return None;
        }
        Some(
            self.raw_data
                .chunks_exact(8)
                .map(|c| {
                    let mut buf = [0u8; 8];
                    buf.copy_from_slice(c);
                    i64::from_le_bytes(buf)
                })
                .collect(),
        )
    }
}
