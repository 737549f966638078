use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{Error, Result};

/// Nested string-keyed metadata attached to resets and steps.
///
/// Key order carries no meaning; a `BTreeMap` keeps encoding deterministic.
pub type ScalarMap = BTreeMap<String, ScalarValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Number(f64),
    String(String),
    Map(ScalarMap),
}

impl From<bool> for ScalarValue {
    fn from(value: bool) -> Self {
        ScalarValue::Bool(value)
    }
}

impl From<f64> for ScalarValue {
    fn from(value: f64) -> Self {
        ScalarValue::Number(value)
    }
}

impl From<i64> for ScalarValue {
    fn from(value: i64) -> Self {
        ScalarValue::Number(value as f64)
    }
}

impl From<&str> for ScalarValue {
    fn from(value: &str) -> Self {
        ScalarValue::String(value.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(value: String) -> Self {
        ScalarValue::String(value)
    }
}

impl From<ScalarMap> for ScalarValue {
    fn from(value: ScalarMap) -> Self {
        ScalarValue::Map(value)
    }
}

impl ScalarValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Number(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ScalarMap> {
        match self {
            ScalarValue::Map(v) => Some(v),
            _ => None,
        }
    }
}

/// Element types understood when an array has to be looked into.
///
/// Names follow numpy's `str(dtype)` spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl DType {
    pub fn parse(name: &str) -> Option<Self> {
        let dtype = match name {
            "bool" => DType::Bool,
            "int8" => DType::I8,
            "int16" => DType::I16,
            "int32" => DType::I32,
            "int64" => DType::I64,
            "uint8" => DType::U8,
            "uint16" => DType::U16,
            "uint32" => DType::U32,
            "uint64" => DType::U64,
            "float32" => DType::F32,
            "float64" => DType::F64,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::Bool => "bool",
            DType::I8 => "int8",
            DType::I16 => "int16",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::F32 => "float32",
            DType::F64 => "float64",
        }
    }

    pub fn item_size(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 => 8,
        }
    }
}

/// A single decoded element.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl Scalar {
    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(v) => f64::from(u8::from(v)),
            Scalar::Int(v) => v as f64,
            Scalar::UInt(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }
}

/// Opaque numerical buffer plus what is needed to reinterpret it.
///
/// Element bytes are little-endian, row-major. The transport never looks
/// inside except to reduce single-element actions to a [`Scalar`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ArrayPayload {
    pub data: Vec<u8>,
    pub shape: Vec<i64>,
    pub dtype: String,
}

impl ArrayPayload {
    pub fn new(data: Vec<u8>, shape: Vec<i64>, dtype: impl Into<String>) -> Self {
        Self {
            data,
            shape,
            dtype: dtype.into(),
        }
    }

    pub fn from_f64s(values: &[f64], shape: &[i64]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(data, shape.to_vec(), DType::F64.name())
    }

    pub fn from_i64s(values: &[i64], shape: &[i64]) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(data, shape.to_vec(), DType::I64.name())
    }

    /// A one-element `int64` array of shape `[1]`, the usual encoding of a
    /// discrete action.
    pub fn discrete(value: i64) -> Self {
        Self::from_i64s(&[value], &[1])
    }

    pub fn dtype(&self) -> Option<DType> {
        DType::parse(&self.dtype)
    }

    /// Product of the shape; an empty shape is a 0-d array of one element.
    /// `None` for negative dimensions or overflow.
    pub fn element_count(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &dim| {
            usize::try_from(dim).ok().and_then(|d| acc.checked_mul(d))
        })
    }

    /// Checks that the buffer length matches shape and a known dtype.
    pub fn validate(&self) -> Result<DType> {
        let dtype = self
            .dtype()
            .ok_or(Error::Unsupported("unknown array dtype"))?;
        let count = self
            .element_count()
            .ok_or(Error::Corrupt("invalid array shape"))?;
        let expected = count
            .checked_mul(dtype.item_size())
            .ok_or(Error::Corrupt("array size overflow"))?;
        if expected != self.data.len() {
            return Err(Error::Corrupt("array data does not match shape"));
        }
        Ok(dtype)
    }

    /// Decodes the only element of a single-element array with a known dtype.
    pub fn as_scalar(&self) -> Option<Scalar> {
        if self.element_count() != Some(1) {
            return None;
        }
        let dtype = self.validate().ok()?;
        Some(decode_element(dtype, &self.data))
    }

    /// Decodes every element as `f64`.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let dtype = self.validate()?;
        Ok(self
            .data
            .chunks_exact(dtype.item_size())
            .map(|chunk| decode_element(dtype, chunk).as_f64())
            .collect())
    }
}

fn decode_element(dtype: DType, bytes: &[u8]) -> Scalar {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    match dtype {
        DType::Bool => Scalar::Bool(bytes[0] != 0),
        DType::I8 => Scalar::Int(i64::from(bytes[0] as i8)),
        DType::I16 => Scalar::Int(i64::from(i16::from_le_bytes([buf[0], buf[1]]))),
        DType::I32 => Scalar::Int(i64::from(i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))),
        DType::I64 => Scalar::Int(i64::from_le_bytes(buf)),
        DType::U8 => Scalar::UInt(u64::from(bytes[0])),
        DType::U16 => Scalar::UInt(u64::from(u16::from_le_bytes([buf[0], buf[1]]))),
        DType::U32 => Scalar::UInt(u64::from(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))),
        DType::U64 => Scalar::UInt(u64::from_le_bytes(buf)),
        DType::F32 => Scalar::Float(f64::from(f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]))),
        DType::F64 => Scalar::Float(f64::from_le_bytes(buf)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_element_arrays_reduce_to_scalars() {
        assert_eq!(ArrayPayload::discrete(3).as_scalar(), Some(Scalar::Int(3)));
        assert_eq!(
            ArrayPayload::from_f64s(&[0.5], &[1, 1]).as_scalar(),
            Some(Scalar::Float(0.5))
        );
        let zero_d = ArrayPayload::new(vec![1], vec![], "bool");
        assert_eq!(zero_d.as_scalar(), Some(Scalar::Bool(true)));
        let small = ArrayPayload::new((-2i32).to_le_bytes().to_vec(), vec![1], "int32");
        assert_eq!(small.as_scalar(), Some(Scalar::Int(-2)));
    }

    #[test]
    fn multi_element_or_unknown_arrays_do_not_reduce() {
        assert_eq!(ArrayPayload::from_f64s(&[1.0, 2.0], &[2]).as_scalar(), None);
        let unknown = ArrayPayload::new(vec![0, 0], vec![1], "float16");
        assert_eq!(unknown.as_scalar(), None);
    }

    #[test]
    fn validate_checks_buffer_against_shape() {
        let ok = ArrayPayload::from_f64s(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        assert_eq!(ok.validate().unwrap(), DType::F64);
        assert_eq!(ok.to_f64_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);

        let short = ArrayPayload::new(vec![0; 7], vec![1], "float64");
        assert!(matches!(short.validate(), Err(Error::Corrupt(_))));
        let negative = ArrayPayload::new(vec![], vec![-1], "int64");
        assert_eq!(negative.element_count(), None);
    }

    #[test]
    fn scalar_map_round_trips_through_json() {
        let mut inner = ScalarMap::new();
        inner.insert("depth".into(), 2.0.into());
        let mut map = ScalarMap::new();
        map.insert("render".into(), false.into());
        map.insert("mode".into(), "fast".into());
        map.insert("nested".into(), inner.into());

        let json = serde_json::to_string(&map).unwrap();
        let back: ScalarMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
        assert_eq!(back["nested"].as_map().unwrap()["depth"].as_f64(), Some(2.0));
    }
}
