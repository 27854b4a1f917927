use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Element type of a packed tensor payload.
///
/// The byte codes are part of the chunk format and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl DType {
    pub fn code(self) -> u8 {
        match self {
            DType::U8 => 0,
            DType::I8 => 1,
            DType::U16 => 2,
            DType::I16 => 3,
            DType::U32 => 4,
            DType::I32 => 5,
            DType::U64 => 6,
            DType::I64 => 7,
            DType::F32 => 8,
            DType::F64 => 9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DType::U8),
            1 => Some(DType::I8),
            2 => Some(DType::U16),
            3 => Some(DType::I16),
            4 => Some(DType::U32),
            5 => Some(DType::I32),
            6 => Some(DType::U64),
            7 => Some(DType::I64),
            8 => Some(DType::F32),
            9 => Some(DType::F64),
            _ => None,
        }
    }

    pub fn size_bytes(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }
}

/// Decoded raster image. Pixels are row-major, `channels` interleaved, 8 bits
/// per channel (1 = luma, 3 = rgb, 4 = rgba).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageValue {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub pixels: Vec<u8>,
}

impl ImageValue {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// Packed n-dimensional array: element dtype, shape, and the little-endian
/// element bytes in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    pub dtype: DType,
    pub shape: Vec<u64>,
    pub data: Vec<u8>,
}

impl TensorValue {
    pub fn element_count(&self) -> u64 {
        self.shape.iter().product()
    }

    pub fn expected_data_len(&self) -> Option<usize> {
        let elems = usize::try_from(self.element_count()).ok()?;
        elems.checked_mul(self.dtype.size_bytes())
    }
}

/// One field value of a training sample.
///
/// Samples are tree-shaped byte-serializable records; reference-bearing or
/// cyclic values are unrepresentable here on purpose.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Image(ImageValue),
    Tensor(TensorValue),
    TokensU16(Vec<u16>),
    TokensU32(Vec<u32>),
    /// Opaque envelope for values only the producing runtime understands.
    Opaque(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Image(_) => "image",
            Value::Tensor(_) => "tensor",
            Value::TokensU16(_) => "tokens:u16",
            Value::TokensU32(_) => "tokens:u32",
            Value::Opaque(_) => "opaque",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            Value::Opaque(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// A materialized sample: field name to value, in schema order when iterated
/// through the schema. A `BTreeMap` keeps lookup and debug output stable.
pub type Sample = BTreeMap<String, Value>;

/// Builds a sample from `(name, value)` pairs; convenience for producers.
pub fn sample_from_pairs<I, S>(pairs: I) -> Sample
where
    I: IntoIterator<Item = (S, Value)>,
    S: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
