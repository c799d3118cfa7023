//! AMQP 1.0 primitive type encoding and decoding.
//!
//! Values are modelled as a small dynamic tree ([`Value`]) rather than
//! one generated flyweight per wire type: performatives are described
//! lists whose fields the caller maps positionally, so a generic value
//! reader keeps the codec compact while still rejecting malformed
//! bytes precisely.

use bytes::{BufMut, Bytes, BytesMut};

use super::error::CodecError;

/// Constructor bytes for the encodings the codec understands.
mod ctor {
    pub const DESCRIBED: u8 = 0x00;
    pub const NULL: u8 = 0x40;
    pub const TRUE: u8 = 0x41;
    pub const FALSE: u8 = 0x42;
    pub const BOOL: u8 = 0x56;
    pub const UBYTE: u8 = 0x50;
    pub const USHORT: u8 = 0x60;
    pub const UINT: u8 = 0x70;
    pub const SMALL_UINT: u8 = 0x52;
    pub const UINT0: u8 = 0x43;
    pub const ULONG: u8 = 0x80;
    pub const SMALL_ULONG: u8 = 0x53;
    pub const ULONG0: u8 = 0x44;
    pub const VBIN8: u8 = 0xa0;
    pub const VBIN32: u8 = 0xb0;
    pub const STR8: u8 = 0xa1;
    pub const STR32: u8 = 0xb1;
    pub const SYM8: u8 = 0xa3;
    pub const SYM32: u8 = 0xb3;
    pub const LIST0: u8 = 0x45;
    pub const LIST8: u8 = 0xc0;
    pub const LIST32: u8 = 0xd0;
    pub const MAP8: u8 = 0xc1;
    pub const MAP32: u8 = 0xd1;
}

/// A decoded AMQP primitive value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Ubyte(u8),
    Ushort(u16),
    Uint(u32),
    Ulong(u64),
    Binary(Bytes),
    Str(String),
    Symbol(String),
    List(Vec<Value>),
    Map(Vec<(Value, Value)>),
    Described(u64, Box<Value>),
}

impl Value {
    pub(crate) fn as_u16(&self) -> Option<u16> {
        match self {
            Self::Ushort(v) => Some(*v),
            Self::Ubyte(v) => Some(u16::from(*v)),
            _ => None,
        }
    }

    pub(crate) fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Uint(v) => Some(*v),
            Self::Ushort(v) => Some(u32::from(*v)),
            Self::Ubyte(v) => Some(u32::from(*v)),
            _ => None,
        }
    }

    pub(crate) fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Ulong(v) => Some(*v),
            other => other.as_u32().map(u64::from),
        }
    }

    pub(crate) fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub(crate) fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) | Self::Symbol(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Self::Binary(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) const fn is_null(&self) -> bool { matches!(self, Self::Null) }
}

/// Cursor over a byte slice with bounds-checked primitive reads.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Self { Self { buf, pos: 0 } }

    pub(crate) const fn remaining(&self) -> usize { self.buf.len() - self.pos }

    /// The unconsumed suffix of the input.
    pub(crate) fn rest(&self) -> &'a [u8] { &self.buf[self.pos..] }

    fn take(&mut self, n: usize, context: &'static str) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated { context });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self, context: &'static str) -> Result<u8, CodecError> {
        Ok(self.take(1, context)?[0])
    }

    fn u16_be(&mut self, context: &'static str) -> Result<u16, CodecError> {
        let bytes = self.take(2, context)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32_be(&mut self, context: &'static str) -> Result<u32, CodecError> {
        let bytes = self.take(4, context)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_be(&mut self, context: &'static str) -> Result<u64, CodecError> {
        let bytes = self.take(8, context)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    fn text(&mut self, len: usize, context: &'static str) -> Result<String, CodecError> {
        let bytes = self.take(len, context)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::InvalidUtf8 { context })
    }

    /// Decode the next complete value, including described prefixes.
    pub(crate) fn value(&mut self, context: &'static str) -> Result<Value, CodecError> {
        let constructor = self.u8(context)?;
        match constructor {
            ctor::DESCRIBED => {
                let descriptor = self
                    .value(context)?
                    .as_u64()
                    .ok_or(CodecError::Truncated { context })?;
                let body = self.value(context)?;
                Ok(Value::Described(descriptor, Box::new(body)))
            }
            ctor::NULL => Ok(Value::Null),
            ctor::TRUE => Ok(Value::Bool(true)),
            ctor::FALSE => Ok(Value::Bool(false)),
            ctor::BOOL => Ok(Value::Bool(self.u8(context)? != 0)),
            ctor::UBYTE => Ok(Value::Ubyte(self.u8(context)?)),
            ctor::USHORT => Ok(Value::Ushort(self.u16_be(context)?)),
            ctor::UINT0 => Ok(Value::Uint(0)),
            ctor::SMALL_UINT => Ok(Value::Uint(u32::from(self.u8(context)?))),
            ctor::UINT => Ok(Value::Uint(self.u32_be(context)?)),
            ctor::ULONG0 => Ok(Value::Ulong(0)),
            ctor::SMALL_ULONG => Ok(Value::Ulong(u64::from(self.u8(context)?))),
            ctor::ULONG => Ok(Value::Ulong(self.u64_be(context)?)),
            ctor::VBIN8 => {
                let len = self.u8(context)? as usize;
                Ok(Value::Binary(Bytes::copy_from_slice(
                    self.take(len, context)?,
                )))
            }
            ctor::VBIN32 => {
                let len = self.u32_be(context)? as usize;
                Ok(Value::Binary(Bytes::copy_from_slice(
                    self.take(len, context)?,
                )))
            }
            ctor::STR8 => {
                let len = self.u8(context)? as usize;
                Ok(Value::Str(self.text(len, context)?))
            }
            ctor::STR32 => {
                let len = self.u32_be(context)? as usize;
                Ok(Value::Str(self.text(len, context)?))
            }
            ctor::SYM8 => {
                let len = self.u8(context)? as usize;
                Ok(Value::Symbol(self.text(len, context)?))
            }
            ctor::SYM32 => {
                let len = self.u32_be(context)? as usize;
                Ok(Value::Symbol(self.text(len, context)?))
            }
            ctor::LIST0 => Ok(Value::List(Vec::new())),
            ctor::LIST8 => {
                let size = self.u8(context)? as usize;
                let body = self.take(size, context)?;
                let mut inner = Reader::new(body);
                let count = inner.u8(context)? as usize;
                inner.compound(count, context).map(Value::List)
            }
            ctor::LIST32 => {
                let size = self.u32_be(context)? as usize;
                let body = self.take(size, context)?;
                let mut inner = Reader::new(body);
                let count = inner.u32_be(context)? as usize;
                inner.compound(count, context).map(Value::List)
            }
            ctor::MAP8 => {
                let size = self.u8(context)? as usize;
                let body = self.take(size, context)?;
                let mut inner = Reader::new(body);
                let count = inner.u8(context)? as usize;
                inner.entries(count, context).map(Value::Map)
            }
            ctor::MAP32 => {
                let size = self.u32_be(context)? as usize;
                let body = self.take(size, context)?;
                let mut inner = Reader::new(body);
                let count = inner.u32_be(context)? as usize;
                inner.entries(count, context).map(Value::Map)
            }
            other => Err(CodecError::UnexpectedConstructor {
                constructor: other,
                context,
            }),
        }
    }

    fn compound(&mut self, count: usize, context: &'static str) -> Result<Vec<Value>, CodecError> {
        let mut items = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            items.push(self.value(context)?);
        }
        Ok(items)
    }

    fn entries(
        &mut self,
        count: usize,
        context: &'static str,
    ) -> Result<Vec<(Value, Value)>, CodecError> {
        if count % 2 != 0 {
            return Err(CodecError::Truncated { context });
        }
        let mut entries = Vec::with_capacity((count / 2).min(64));
        for _ in 0..count / 2 {
            let key = self.value(context)?;
            let value = self.value(context)?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}

/// Append the wire encoding of `value` to `dst`.
///
/// The encoder always emits a canonical form: the smallest fixed-width
/// encoding for integers and the 8-bit compound forms whenever size and
/// count both fit.
pub(crate) fn encode_value(value: &Value, dst: &mut BytesMut) {
    match value {
        Value::Null => dst.put_u8(ctor::NULL),
        Value::Bool(true) => dst.put_u8(ctor::TRUE),
        Value::Bool(false) => dst.put_u8(ctor::FALSE),
        Value::Ubyte(v) => {
            dst.put_u8(ctor::UBYTE);
            dst.put_u8(*v);
        }
        Value::Ushort(v) => {
            dst.put_u8(ctor::USHORT);
            dst.put_u16(*v);
        }
        Value::Uint(0) => dst.put_u8(ctor::UINT0),
        Value::Uint(v) if *v <= u32::from(u8::MAX) => {
            dst.put_u8(ctor::SMALL_UINT);
            dst.put_u8(*v as u8);
        }
        Value::Uint(v) => {
            dst.put_u8(ctor::UINT);
            dst.put_u32(*v);
        }
        Value::Ulong(0) => dst.put_u8(ctor::ULONG0),
        Value::Ulong(v) if *v <= u64::from(u8::MAX) => {
            dst.put_u8(ctor::SMALL_ULONG);
            dst.put_u8(*v as u8);
        }
        Value::Ulong(v) => {
            dst.put_u8(ctor::ULONG);
            dst.put_u64(*v);
        }
        Value::Binary(bytes) => {
            if bytes.len() <= usize::from(u8::MAX) {
                dst.put_u8(ctor::VBIN8);
                dst.put_u8(bytes.len() as u8);
            } else {
                dst.put_u8(ctor::VBIN32);
                dst.put_u32(bytes.len() as u32);
            }
            dst.put_slice(bytes);
        }
        Value::Str(text) => encode_text(ctor::STR8, ctor::STR32, text, dst),
        Value::Symbol(text) => encode_text(ctor::SYM8, ctor::SYM32, text, dst),
        Value::List(items) => {
            if items.is_empty() {
                dst.put_u8(ctor::LIST0);
                return;
            }
            let mut body = BytesMut::new();
            for item in items {
                encode_value(item, &mut body);
            }
            encode_compound(ctor::LIST8, ctor::LIST32, items.len(), &body, dst);
        }
        Value::Map(entries) => {
            let mut body = BytesMut::new();
            for (key, value) in entries {
                encode_value(key, &mut body);
                encode_value(value, &mut body);
            }
            encode_compound(ctor::MAP8, ctor::MAP32, entries.len() * 2, &body, dst);
        }
        Value::Described(descriptor, body) => {
            dst.put_u8(ctor::DESCRIBED);
            encode_value(&Value::Ulong(*descriptor), dst);
            encode_value(body, dst);
        }
    }
}

fn encode_text(small: u8, large: u8, text: &str, dst: &mut BytesMut) {
    if text.len() <= usize::from(u8::MAX) {
        dst.put_u8(small);
        dst.put_u8(text.len() as u8);
    } else {
        dst.put_u8(large);
        dst.put_u32(text.len() as u32);
    }
    dst.put_slice(text.as_bytes());
}

fn encode_compound(small: u8, large: u8, count: usize, body: &BytesMut, dst: &mut BytesMut) {
    // Size covers the count field plus the encoded items.
    if count <= usize::from(u8::MAX) && body.len() + 1 <= usize::from(u8::MAX) {
        dst.put_u8(small);
        dst.put_u8((body.len() + 1) as u8);
        dst.put_u8(count as u8);
    } else {
        dst.put_u8(large);
        dst.put_u32((body.len() + 4) as u32);
        dst.put_u32(count as u32);
    }
    dst.put_slice(body);
}

/// Drop trailing null fields so optional suffixes encode compactly.
pub(crate) fn trim_trailing_nulls(mut fields: Vec<Value>) -> Vec<Value> {
    while fields.last().is_some_and(Value::is_null) {
        fields.pop();
    }
    fields
}
