//! Little-endian binary encoding of [`Message`].
//!
//! Layout: one tag byte followed by the variant body. Strings and byte
//! buffers are u32-length-prefixed, shapes are a u32 count of i64 dims, and
//! a `ScalarMap` is a u32 entry count of (key, value-tag, value).

use crate::core::{Error, Result};
use crate::protocol::{
    ArrayPayload, Message, MessageTag, ScalarMap, ScalarValue, StepReturn, SEED_NONE,
};

/// Deepest `ScalarMap` nesting accepted by the codec.
pub const MAX_NESTING_DEPTH: usize = 256;

const VALUE_NUMBER: u8 = 0;
const VALUE_STRING: u8 = 1;
const VALUE_BOOL: u8 = 2;
const VALUE_MAP: u8 = 3;

#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuses `buf` (cleared) as the output buffer.
    pub fn with_buffer(mut buf: Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_len(&mut self, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| Error::Unsupported("field longer than u32::MAX"))?;
        self.put_u32(len);
        Ok(())
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.put_len(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn put_str(&mut self, value: &str) -> Result<()> {
        self.put_bytes(value.as_bytes())
    }

    pub fn put_array(&mut self, array: &ArrayPayload) -> Result<()> {
        self.put_str(&array.dtype)?;
        self.put_len(array.shape.len())?;
        for &dim in &array.shape {
            self.put_i64(dim);
        }
        self.put_bytes(&array.data)
    }

    pub fn put_map(&mut self, map: &ScalarMap) -> Result<()> {
        self.put_map_at(map, 1)
    }

    fn put_map_at(&mut self, map: &ScalarMap, depth: usize) -> Result<()> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::Unsupported("scalar map nested too deeply"));
        }
        self.put_len(map.len())?;
        for (key, value) in map {
            self.put_str(key)?;
            match value {
                ScalarValue::Number(v) => {
                    self.put_u8(VALUE_NUMBER);
                    self.put_f64(*v);
                }
                ScalarValue::String(v) => {
                    self.put_u8(VALUE_STRING);
                    self.put_str(v)?;
                }
                ScalarValue::Bool(v) => {
                    self.put_u8(VALUE_BOOL);
                    self.put_bool(*v);
                }
                ScalarValue::Map(v) => {
                    self.put_u8(VALUE_MAP);
                    self.put_map_at(v, depth + 1)?;
                }
            }
        }
        Ok(())
    }
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn finish(self) -> Result<()> {
        if self.remaining() != 0 {
            return Err(Error::Corrupt("trailing bytes after message"));
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Corrupt("message truncated"));
        }
        let out = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::Corrupt("invalid bool byte")),
        }
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    pub fn get_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::Corrupt("string is not utf-8"))
    }

    pub fn get_array(&mut self) -> Result<ArrayPayload> {
        let dtype = self.get_string()?;
        let dims = self.get_u32()? as usize;
        if dims.saturating_mul(8) > self.remaining() {
            return Err(Error::Corrupt("message truncated"));
        }
        let mut shape = Vec::with_capacity(dims);
        for _ in 0..dims {
            shape.push(self.get_i64()?);
        }
        let data = self.get_bytes()?.to_vec();
        Ok(ArrayPayload { data, shape, dtype })
    }

    pub fn get_map(&mut self) -> Result<ScalarMap> {
        self.get_map_at(1)
    }

    fn get_map_at(&mut self, depth: usize) -> Result<ScalarMap> {
        if depth > MAX_NESTING_DEPTH {
            return Err(Error::Corrupt("scalar map nested too deeply"));
        }
        let entries = self.get_u32()?;
        let mut map = ScalarMap::new();
        for _ in 0..entries {
            let key = self.get_string()?;
            let value = match self.get_u8()? {
                VALUE_NUMBER => ScalarValue::Number(self.get_f64()?),
                VALUE_STRING => ScalarValue::String(self.get_string()?),
                VALUE_BOOL => ScalarValue::Bool(self.get_bool()?),
                VALUE_MAP => ScalarValue::Map(self.get_map_at(depth + 1)?),
                _ => return Err(Error::Corrupt("unknown scalar value tag")),
            };
            if map.insert(key, value).is_some() {
                return Err(Error::Corrupt("duplicate scalar map key"));
            }
        }
        Ok(map)
    }
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Encodes into `buf`, replacing its contents and keeping its allocation.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<()> {
        let mut enc = Encoder::with_buffer(std::mem::take(buf));
        let result = self.encode_body(&mut enc);
        *buf = enc.finish();
        result
    }

    fn encode_body(&self, enc: &mut Encoder) -> Result<()> {
        enc.put_u8(self.tag().as_u8());
        match self {
            Message::Request | Message::Close | Message::Status => {}
            Message::ResetArgs { seed, options } => {
                let wire_seed = match seed {
                    None => SEED_NONE,
                    Some(SEED_NONE) => {
                        return Err(Error::Unsupported("seed -1 is reserved for 'no seed'"))
                    }
                    Some(seed) => *seed,
                };
                enc.put_i64(wire_seed);
                enc.put_map(options)?;
            }
            Message::ResetReturn { observation, info } => {
                enc.put_array(observation)?;
                enc.put_map(info)?;
            }
            Message::Action(payload) => enc.put_array(payload)?,
            Message::StepReturn(step) => {
                enc.put_array(&step.observation)?;
                enc.put_f64(step.reward);
                enc.put_bool(step.terminated);
                enc.put_bool(step.truncated);
                enc.put_map(&step.info)?;
            }
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes);
        let tag = MessageTag::from_u8(dec.get_u8()?).ok_or(Error::Corrupt("unknown message tag"))?;
        let message = match tag {
            MessageTag::Request => Message::Request,
            MessageTag::Close => Message::Close,
            MessageTag::Status => Message::Status,
            MessageTag::ResetArgs => {
                let seed = dec.get_i64()?;
                let options = dec.get_map()?;
                Message::ResetArgs {
                    seed: (seed != SEED_NONE).then_some(seed),
                    options,
                }
            }
            MessageTag::ResetReturn => {
                let observation = dec.get_array()?;
                let info = dec.get_map()?;
                Message::ResetReturn { observation, info }
            }
            MessageTag::Action => Message::Action(dec.get_array()?),
            MessageTag::StepReturn => {
                let observation = dec.get_array()?;
                let reward = dec.get_f64()?;
                let terminated = dec.get_bool()?;
                let truncated = dec.get_bool()?;
                let info = dec.get_map()?;
                Message::StepReturn(StepReturn {
                    observation,
                    reward,
                    terminated,
                    truncated,
                    info,
                })
            }
        };
        dec.finish()?;
        Ok(message)
    }
}
