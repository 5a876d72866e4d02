//! External data representation (RFC 4506 subset).
//!
//! Everything is big-endian and padded to a multiple of four bytes. Decoding
//! never trusts a length word: every variable-length item is checked against
//! both the bytes left in the buffer and [`MESSAGE_MAX`](crate::MESSAGE_MAX)
//! before anything is allocated.

use crate::MESSAGE_MAX;
use crate::error::ProtoError;

fn padding(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[derive(Debug, Default)]
pub struct XdrEncoder {
    buf: Vec<u8>,
}

impl XdrEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bool(&mut self, v: bool) {
        self.put_u32(v as u32);
    }

    pub fn put_opaque(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.buf.extend_from_slice(data);
        self.buf.resize(self.buf.len() + padding(data.len()), 0);
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_opaque(s.as_bytes());
    }

    pub fn put_string_list(&mut self, list: &[String]) {
        self.put_u32(list.len() as u32);
        for s in list {
            self.put_string(s);
        }
    }
}

#[derive(Debug)]
pub struct XdrDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrDecoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtoError> {
        if n > self.remaining() {
            return Err(ProtoError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], ProtoError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u32(&mut self) -> Result<u32, ProtoError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> Result<i32, ProtoError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_u64(&mut self) -> Result<u64, ProtoError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> Result<i64, ProtoError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_bool(&mut self) -> Result<bool, ProtoError> {
        match self.get_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtoError::InvalidBool(other)),
        }
    }

    /// Decode a variable-length opaque of at most `max` bytes.
    pub fn get_opaque_max(&mut self, max: usize) -> Result<&'a [u8], ProtoError> {
        let len = self.get_u32()? as usize;
        if len > max || len > i32::MAX as usize {
            return Err(ProtoError::TooLong {
                len: len as u64,
                max,
            });
        }
        let data = self.take(len)?;
        self.take(padding(len))?;
        Ok(data)
    }

    pub fn get_opaque(&mut self) -> Result<&'a [u8], ProtoError> {
        self.get_opaque_max(MESSAGE_MAX)
    }

    pub fn get_string(&mut self) -> Result<String, ProtoError> {
        let bytes = self.get_opaque()?;
        if bytes.contains(&0) {
            return Err(ProtoError::EmbeddedNul);
        }
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtoError::InvalidUtf8)
    }

    pub fn get_string_list(&mut self) -> Result<Vec<String>, ProtoError> {
        let count = self.get_u32()? as usize;
        // Every element needs at least its own length word.
        if count > self.remaining() / 4 {
            return Err(ProtoError::TooLong {
                len: count as u64,
                max: self.remaining() / 4,
            });
        }
        let mut list = Vec::with_capacity(count);
        for _ in 0..count {
            list.push(self.get_string()?);
        }
        Ok(list)
    }
}

/// Types with a fixed XDR encoding.
pub trait XdrEncode {
    fn encode(&self, enc: &mut XdrEncoder);

    fn to_xdr(&self) -> Vec<u8> {
        let mut enc = XdrEncoder::new();
        self.encode(&mut enc);
        enc.into_inner()
    }
}

pub trait XdrDecode: Sized {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError>;

    fn from_xdr(buf: &[u8]) -> Result<Self, ProtoError> {
        Self::decode(&mut XdrDecoder::new(buf))
    }
}

/// Variable-length binary buffer (`opaque<>`), kept distinct from `Vec<String>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Opaque(pub Vec<u8>);

impl XdrEncode for () {
    fn encode(&self, _enc: &mut XdrEncoder) {}
}

impl XdrDecode for () {
    fn decode(_dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError> {
        Ok(())
    }
}

macro_rules! xdr_primitive {
    ($ty:ty, $put:ident, $get:ident) => {
        impl XdrEncode for $ty {
            fn encode(&self, enc: &mut XdrEncoder) {
                enc.$put(*self);
            }
        }

        impl XdrDecode for $ty {
            fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError> {
                dec.$get()
            }
        }
    };
}

xdr_primitive!(u32, put_u32, get_u32);
xdr_primitive!(i32, put_i32, get_i32);
xdr_primitive!(u64, put_u64, get_u64);
xdr_primitive!(i64, put_i64, get_i64);
xdr_primitive!(bool, put_bool, get_bool);

impl XdrEncode for String {
    fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_string(self);
    }
}

impl XdrDecode for String {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError> {
        dec.get_string()
    }
}

impl XdrEncode for Vec<String> {
    fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_string_list(self);
    }
}

impl XdrDecode for Vec<String> {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError> {
        dec.get_string_list()
    }
}

impl XdrEncode for Opaque {
    fn encode(&self, enc: &mut XdrEncoder) {
        enc.put_opaque(&self.0);
    }
}

impl XdrDecode for Opaque {
    fn decode(dec: &mut XdrDecoder<'_>) -> Result<Self, ProtoError> {
        Ok(Opaque(dec.get_opaque()?.to_vec()))
    }
}

/// Declare a plain struct whose XDR form is its fields in order.
#[macro_export]
macro_rules! xdr_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($fvis:vis $field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $($fvis $field: $ty),*
        }

        impl $crate::xdr::XdrEncode for $name {
            #[allow(unused_variables)]
            fn encode(&self, enc: &mut $crate::xdr::XdrEncoder) {
                $($crate::xdr::XdrEncode::encode(&self.$field, enc);)*
            }
        }

        impl $crate::xdr::XdrDecode for $name {
            #[allow(unused_variables)]
            fn decode(
                dec: &mut $crate::xdr::XdrDecoder<'_>,
            ) -> Result<Self, $crate::ProtoError> {
                Ok(Self {
                    $($field: <$ty as $crate::xdr::XdrDecode>::decode(dec)?),*
                })
            }
        }
    };
}
