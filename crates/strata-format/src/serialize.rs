use std::collections::BTreeMap;
use std::sync::Arc;

use image::ImageEncoder;
use serde::{Deserialize, Serialize};

use strata_core::error::StrataError;
use strata_core::sample::{DType, ImageValue, Sample, TensorValue, Value};

/// A bidirectional field codec keyed by a short ASCII id.
///
/// `encode` must be pure and deterministic; `decode` must be its inverse for
/// every value `encode` accepts (the `jpeg` codec is the documented lossy
/// exception).
pub trait Codec: Send + Sync {
    fn id(&self) -> &str;
    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError>;
}

fn wrong_type(codec: &str, value: &Value) -> StrataError {
    StrataError::config(format!(
        "codec {codec:?} cannot encode a {} value",
        value.type_name()
    ))
}

fn truncated(codec: &str) -> StrataError {
    StrataError::format(format!("truncated {codec} field"), "<field>")
}

struct IntCodec;

impl Codec for IntCodec {
    fn id(&self) -> &str {
        "int"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        match value {
            Value::Int(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(wrong_type("int", other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| truncated("int"))?;
        Ok(Value::Int(i64::from_le_bytes(arr)))
    }
}

struct FloatCodec;

impl Codec for FloatCodec {
    fn id(&self) -> &str {
        "float"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        match value {
            Value::Float(v) => Ok(v.to_le_bytes().to_vec()),
            other => Err(wrong_type("float", other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        let arr: [u8; 8] = bytes.try_into().map_err(|_| truncated("float"))?;
        Ok(Value::Float(f64::from_le_bytes(arr)))
    }
}

struct StrCodec;

impl Codec for StrCodec {
    fn id(&self) -> &str {
        "str"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        let s = match value {
            Value::Str(s) => s,
            other => return Err(wrong_type("str", other)),
        };
        let len = u32::try_from(s.len())
            .map_err(|_| StrataError::config("str field exceeds u32 length"))?;
        let mut out = Vec::with_capacity(4 + s.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(s.as_bytes());
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        if bytes.len() < 4 {
            return Err(truncated("str"));
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let body = bytes.get(4..4 + len).ok_or_else(|| truncated("str"))?;
        let s = std::str::from_utf8(body)
            .map_err(|e| StrataError::format(format!("str field not utf-8: {e}"), "<field>"))?;
        Ok(Value::Str(s.to_string()))
    }
}

struct BytesCodec;

impl Codec for BytesCodec {
    fn id(&self) -> &str {
        "bytes"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        match value {
            Value::Bytes(b) => Ok(b.clone()),
            other => Err(wrong_type("bytes", other)),
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        Ok(Value::Bytes(bytes.to_vec()))
    }
}

fn image_color_type(channels: u8) -> Result<image::ExtendedColorType, StrataError> {
    match channels {
        1 => Ok(image::ExtendedColorType::L8),
        3 => Ok(image::ExtendedColorType::Rgb8),
        4 => Ok(image::ExtendedColorType::Rgba8),
        other => Err(StrataError::config(format!(
            "image fields support 1/3/4 channels, got {other}"
        ))),
    }
}

fn check_image(img: &ImageValue) -> Result<(), StrataError> {
    if img.pixels.len() != img.expected_len() {
        return Err(StrataError::config(format!(
            "image pixel buffer is {} bytes, expected {} ({}x{}x{})",
            img.pixels.len(),
            img.expected_len(),
            img.width,
            img.height,
            img.channels
        )));
    }
    Ok(())
}

fn image_from_dynamic(img: image::DynamicImage) -> Value {
    match img {
        image::DynamicImage::ImageLuma8(buf) => Value::Image(ImageValue {
            width: buf.width(),
            height: buf.height(),
            channels: 1,
            pixels: buf.into_raw(),
        }),
        image::DynamicImage::ImageRgba8(buf) => Value::Image(ImageValue {
            width: buf.width(),
            height: buf.height(),
            channels: 4,
            pixels: buf.into_raw(),
        }),
        other => {
            let buf = other.to_rgb8();
            Value::Image(ImageValue {
                width: buf.width(),
                height: buf.height(),
                channels: 3,
                pixels: buf.into_raw(),
            })
        }
    }
}

/// Lossless image codec: stores a PNG.
struct PilCodec;

impl Codec for PilCodec {
    fn id(&self) -> &str {
        "pil"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        let img = match value {
            Value::Image(img) => img,
            other => return Err(wrong_type("pil", other)),
        };
        check_image(img)?;
        let color = image_color_type(img.channels)?;
        let mut out = Vec::new();
        image::codecs::png::PngEncoder::new(&mut out)
            .write_image(&img.pixels, img.width, img.height, color)
            .map_err(|e| StrataError::config(format!("png encode failed: {e}")))?;
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| StrataError::format(format!("png decode failed: {e}"), "<field>"))?;
        Ok(image_from_dynamic(img))
    }
}

/// Lossy image codec: stores a JPEG. `decode(encode(x))` is close to but not
/// equal to `x`; fields opt in at schema declaration.
struct JpegCodec;

const JPEG_QUALITY: u8 = 90;

impl Codec for JpegCodec {
    fn id(&self) -> &str {
        "jpeg"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        let img = match value {
            Value::Image(img) => img,
            other => return Err(wrong_type("jpeg", other)),
        };
        check_image(img)?;
        if img.channels == 4 {
            return Err(StrataError::config(
                "jpeg codec does not support alpha; use pil for rgba images",
            ));
        }
        let color = image_color_type(img.channels)?;
        let mut out = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
            .write_image(&img.pixels, img.width, img.height, color)
            .map_err(|e| StrataError::config(format!("jpeg encode failed: {e}")))?;
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        let img = image::load_from_memory(bytes)
            .map_err(|e| StrataError::format(format!("jpeg decode failed: {e}"), "<field>"))?;
        Ok(image_from_dynamic(img))
    }
}

/// Packed tensor codec: dtype byte, ndim byte, `ndim` u64 dims, raw
/// little-endian element bytes.
struct TensorCodec;

impl Codec for TensorCodec {
    fn id(&self) -> &str {
        "tensor"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        let t = match value {
            Value::Tensor(t) => t,
            other => return Err(wrong_type("tensor", other)),
        };
        let expected = t.expected_data_len().ok_or_else(|| {
            StrataError::config("tensor element count overflows host usize")
        })?;
        if t.data.len() != expected {
            return Err(StrataError::config(format!(
                "tensor data is {} bytes, expected {} for dtype {:?} shape {:?}",
                t.data.len(),
                expected,
                t.dtype,
                t.shape
            )));
        }
        let ndim = u8::try_from(t.shape.len())
            .map_err(|_| StrataError::config("tensor rank exceeds 255"))?;
        let mut out = Vec::with_capacity(2 + t.shape.len() * 8 + t.data.len());
        out.push(t.dtype.code());
        out.push(ndim);
        for dim in &t.shape {
            out.extend_from_slice(&dim.to_le_bytes());
        }
        out.extend_from_slice(&t.data);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        if bytes.len() < 2 {
            return Err(truncated("tensor"));
        }
        let dtype = DType::from_code(bytes[0]).ok_or_else(|| {
            StrataError::format(format!("unknown tensor dtype code {}", bytes[0]), "<field>")
        })?;
        let ndim = bytes[1] as usize;
        let shape_end = 2 + ndim * 8;
        let shape_bytes = bytes.get(2..shape_end).ok_or_else(|| truncated("tensor"))?;
        let shape: Vec<u64> = shape_bytes
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        let data = bytes.get(shape_end..).ok_or_else(|| truncated("tensor"))?;
        let tensor = TensorValue {
            dtype,
            shape,
            data: data.to_vec(),
        };
        let expected = tensor
            .expected_data_len()
            .ok_or_else(|| StrataError::format("tensor shape overflow", "<field>"))?;
        if tensor.data.len() != expected {
            return Err(StrataError::format(
                format!(
                    "tensor payload is {} bytes, expected {}",
                    tensor.data.len(),
                    expected
                ),
                "<field>",
            ));
        }
        Ok(Value::Tensor(tensor))
    }
}

/// Views a tensor payload as typed elements (little-endian hosts reinterpret
/// in place; this copies to stay portable).
pub fn tensor_elements_f32(t: &TensorValue) -> Result<Vec<f32>, StrataError> {
    if t.dtype != DType::F32 {
        return Err(StrataError::config(format!(
            "expected f32 tensor, got {:?}",
            t.dtype
        )));
    }
    Ok(t.data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Builds an f32 tensor from host values.
pub fn tensor_from_f32(shape: Vec<u64>, values: &[f32]) -> TensorValue {
    let mut data = Vec::with_capacity(values.len() * 4);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    TensorValue {
        dtype: DType::F32,
        shape,
        data,
    }
}

struct TokensU16Codec;

impl Codec for TokensU16Codec {
    fn id(&self) -> &str {
        "tokens:u16"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        let tokens = match value {
            Value::TokensU16(t) => t,
            other => return Err(wrong_type("tokens:u16", other)),
        };
        let mut out = Vec::with_capacity(tokens.len() * 2);
        for t in tokens {
            out.extend_from_slice(&t.to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        if bytes.len() % 2 != 0 {
            return Err(truncated("tokens:u16"));
        }
        Ok(Value::TokensU16(
            bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect(),
        ))
    }
}

struct TokensU32Codec;

impl Codec for TokensU32Codec {
    fn id(&self) -> &str {
        "tokens:u32"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        let tokens = match value {
            Value::TokensU32(t) => t,
            other => return Err(wrong_type("tokens:u32", other)),
        };
        let mut out = Vec::with_capacity(tokens.len() * 4);
        for t in tokens {
            out.extend_from_slice(&t.to_le_bytes());
        }
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        if bytes.len() % 4 != 0 {
            return Err(truncated("tokens:u32"));
        }
        Ok(Value::TokensU32(
            bytes
                .chunks_exact(4)
                .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        ))
    }
}

/// Cross-language envelope for runtime-specific serialized objects: a u32
/// length prefix and opaque bytes. The id is retained for compatibility with
/// datasets produced elsewhere; consumers treat the payload as bytes.
struct PickleCodec;

impl Codec for PickleCodec {
    fn id(&self) -> &str {
        "pickle"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, StrataError> {
        let body = match value {
            Value::Opaque(b) => b,
            other => return Err(wrong_type("pickle", other)),
        };
        let len = u32::try_from(body.len())
            .map_err(|_| StrataError::config("pickle field exceeds u32 length"))?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(body);
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, StrataError> {
        if bytes.len() < 4 {
            return Err(truncated("pickle"));
        }
        let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let body = bytes.get(4..4 + len).ok_or_else(|| truncated("pickle"))?;
        Ok(Value::Opaque(body.to_vec()))
    }
}

fn valid_codec_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 16
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b':' || b == b'_')
}

/// Explicit codec registry threaded through writer and reader constructors.
/// There is no process-global registry on purpose.
#[derive(Clone)]
pub struct Registry {
    codecs: BTreeMap<String, Arc<dyn Codec>>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            codecs: BTreeMap::new(),
        }
    }

    /// The built-in codecs with reserved, stable ids.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        let builtins: Vec<Arc<dyn Codec>> = vec![
            Arc::new(IntCodec),
            Arc::new(FloatCodec),
            Arc::new(StrCodec),
            Arc::new(BytesCodec),
            Arc::new(PilCodec),
            Arc::new(JpegCodec),
            Arc::new(TensorCodec),
            Arc::new(TokensU16Codec),
            Arc::new(TokensU32Codec),
            Arc::new(PickleCodec),
        ];
        for codec in builtins {
            // Builtin ids are valid and unique by construction.
            let _ = registry.register(codec);
        }
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Result<(), StrataError> {
        let id = codec.id().to_string();
        if !valid_codec_id(&id) {
            return Err(StrataError::config(format!(
                "invalid codec id {id:?} (lowercase ascii, digits, ':', '_', max 16 bytes)"
            )));
        }
        if self.codecs.contains_key(&id) {
            return Err(StrataError::config(format!(
                "codec id {id:?} already registered"
            )));
        }
        self.codecs.insert(id, codec);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<&Arc<dyn Codec>, StrataError> {
        self.codecs
            .get(id)
            .ok_or_else(|| StrataError::config(format!("unknown codec id {id:?}")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.codecs.contains_key(id)
    }
}

/// One schema entry: field name plus the codec id used for its payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub codec: String,
}

/// The fixed, ordered field list shared by every sample of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>, registry: &Registry) -> Result<Self, StrataError> {
        if fields.is_empty() {
            return Err(StrataError::config("schema must declare at least one field"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for field in &fields {
            if field.name.trim().is_empty() {
                return Err(StrataError::config("schema field name must be non-empty"));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(StrataError::config(format!(
                    "duplicate schema field {:?}",
                    field.name
                )));
            }
            registry.get(&field.codec)?;
        }
        Ok(Self { fields })
    }

    /// Derives the schema from one sample using the default codec per value
    /// type. Field order is the sample's key order, fixed from then on.
    pub fn infer(sample: &Sample, registry: &Registry) -> Result<Self, StrataError> {
        let fields = sample
            .iter()
            .map(|(name, value)| Field {
                name: name.clone(),
                codec: default_codec_for(value).to_string(),
            })
            .collect();
        Self::new(fields, registry)
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Serializes a sample into one blob: per field in declared order, a u32
    /// little-endian length then the codec output.
    pub fn encode_sample(
        &self,
        registry: &Registry,
        sample: &Sample,
    ) -> Result<Vec<u8>, StrataError> {
        if sample.len() != self.fields.len() {
            return Err(StrataError::config(format!(
                "sample has {} fields, schema declares {}",
                sample.len(),
                self.fields.len()
            )));
        }
        let mut out = Vec::new();
        for field in &self.fields {
            let value = sample.get(&field.name).ok_or_else(|| {
                StrataError::config(format!("sample is missing field {:?}", field.name))
            })?;
            let codec = registry.get(&field.codec)?;
            let encoded = codec.encode(value)?;
            let len = u32::try_from(encoded.len()).map_err(|_| {
                StrataError::config(format!("field {:?} exceeds u32 length", field.name))
            })?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&encoded);
        }
        Ok(out)
    }

    /// Inverse of `encode_sample`.
    pub fn decode_sample(
        &self,
        registry: &Registry,
        mut blob: &[u8],
    ) -> Result<Sample, StrataError> {
        let mut sample = Sample::new();
        for field in &self.fields {
            if blob.len() < 4 {
                return Err(StrataError::format(
                    format!("sample blob truncated before field {:?}", field.name),
                    "<chunk>",
                ));
            }
            let len = u32::from_le_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
            let body = blob.get(4..4 + len).ok_or_else(|| {
                StrataError::format(
                    format!("sample blob truncated inside field {:?}", field.name),
                    "<chunk>",
                )
            })?;
            let codec = registry.get(&field.codec)?;
            sample.insert(field.name.clone(), codec.decode(body)?);
            blob = &blob[4 + len..];
        }
        if !blob.is_empty() {
            return Err(StrataError::format(
                format!("{} trailing bytes after last field", blob.len()),
                "<chunk>",
            ));
        }
        Ok(sample)
    }
}

fn default_codec_for(value: &Value) -> &'static str {
    match value {
        Value::Int(_) => "int",
        Value::Float(_) => "float",
        Value::Str(_) => "str",
        Value::Bytes(_) => "bytes",
        Value::Image(_) => "pil",
        Value::Tensor(_) => "tensor",
        Value::TokensU16(_) => "tokens:u16",
        Value::TokensU32(_) => "tokens:u32",
        Value::Opaque(_) => "pickle",
    }
}
