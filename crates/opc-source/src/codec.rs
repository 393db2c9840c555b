//! OPC UA Binary Encoding
//!
//! Little-endian primitives plus the built-in types a subscription client
//! reads and writes. Decoding borrows the message buffer; built-in types the
//! client has no use for are read past so the enclosing structure stays in
//! step.

use crate::error::SourceError;
use crate::node::{Identifier, NodeId};
use crate::notification::DataValue;
use crate::status::StatusCode;
use crate::variant::Variant;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// 100 ns ticks between 1601-01-01 and the Unix epoch
const EPOCH_OFFSET_TICKS: i64 = 116_444_736_000_000_000;

const TICKS_PER_SECOND: i64 = 10_000_000;

/// Nesting limit for variants, data values and diagnostic infos
const MAX_DEPTH: usize = 16;

fn malformed(what: impl Into<String>) -> SourceError {
    SourceError::Protocol(what.into())
}

/// Growable output buffer
#[derive(Debug, Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(u8::from(v))
    }

    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn f64(&mut self, v: f64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Length-prefixed UTF-8; `None` is the null string
    pub fn string(&mut self, v: Option<&str>) -> &mut Self {
        self.byte_string(v.map(str::as_bytes))
    }

    /// Length-prefixed bytes; `None` is the null byte string
    pub fn byte_string(&mut self, v: Option<&[u8]>) -> &mut Self {
        match v {
            Some(bytes) => {
                self.i32(bytes.len() as i32);
                self.bytes(bytes)
            }
            None => self.i32(-1),
        }
    }

    pub fn array_len(&mut self, len: usize) -> &mut Self {
        self.i32(len as i32)
    }

    pub fn date_time(&mut self, v: DateTime<Utc>) -> &mut Self {
        self.i64(to_ticks(v))
    }

    /// Node id in the most compact encoding that fits
    pub fn node_id(&mut self, id: &NodeId) -> Result<&mut Self, SourceError> {
        match &id.identifier {
            Identifier::Numeric(value) if id.namespace == 0 && *value <= 0xFF => {
                self.u8(0x00).u8(*value as u8);
            }
            Identifier::Numeric(value) if id.namespace <= 0xFF && *value <= 0xFFFF => {
                self.u8(0x01).u8(id.namespace as u8).u16(*value as u16);
            }
            Identifier::Numeric(value) => {
                self.u8(0x02).u16(id.namespace).u32(*value);
            }
            Identifier::String(value) => {
                self.u8(0x03).u16(id.namespace).string(Some(value));
            }
            Identifier::Guid(value) => {
                let (d1, d2, d3, d4) = value.as_fields();
                self.u8(0x04).u16(id.namespace).u32(d1).u16(d2).u16(d3).bytes(d4);
            }
            Identifier::Opaque(text) => {
                let raw = decode_base64(text)
                    .ok_or_else(|| malformed(format!("opaque identifier {:?} is not base64", text)))?;
                self.u8(0x05).u16(id.namespace).byte_string(Some(&raw));
            }
        }
        Ok(self)
    }

    /// Type id of a standard structure's binary encoding (namespace 0)
    pub fn encoding_id(&mut self, id: u32) -> &mut Self {
        if id <= 0xFF {
            self.u8(0x00).u8(id as u8)
        } else if id <= 0xFFFF {
            self.u8(0x01).u8(0).u16(id as u16)
        } else {
            self.u8(0x02).u16(0).u32(id)
        }
    }

    /// Extension object with a binary body
    pub fn extension_object(&mut self, type_id: u32, body: &[u8]) -> &mut Self {
        self.encoding_id(type_id).u8(0x01);
        self.byte_string(Some(body))
    }

    /// Extension object with no body
    pub fn null_extension_object(&mut self) -> &mut Self {
        self.u8(0x00).u8(0x00).u8(0x00)
    }
}

/// Cursor over a received message body
#[derive(Debug)]
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], SourceError> {
        if self.remaining() < n {
            return Err(malformed(format!(
                "needed {} bytes at offset {}, {} left",
                n,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], SourceError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, SourceError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, SourceError> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16, SourceError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, SourceError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, SourceError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, SourceError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, SourceError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, SourceError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, SourceError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn f64(&mut self) -> Result<f64, SourceError> {
        Ok(f64::from_le_bytes(self.array()?))
    }

    pub fn status_code(&mut self) -> Result<StatusCode, SourceError> {
        Ok(StatusCode(self.u32()?))
    }

    pub fn byte_string(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?.to_vec()))
    }

    pub fn string(&mut self) -> Result<Option<String>, SourceError> {
        match self.byte_string()? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| malformed("string is not valid UTF-8")),
            None => Ok(None),
        }
    }

    /// Element count of an array; a null array has none
    pub fn array_len(&mut self) -> Result<usize, SourceError> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(0);
        }
        // Every element takes at least one byte
        let len = len as usize;
        if len > self.remaining() {
            return Err(malformed(format!("array of {} elements exceeds message", len)));
        }
        Ok(len)
    }

    pub fn sequence<T>(
        &mut self,
        mut element: impl FnMut(&mut Self) -> Result<T, SourceError>,
    ) -> Result<Vec<T>, SourceError> {
        let len = self.array_len()?;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(element(self)?);
        }
        Ok(out)
    }

    /// Zero and the maximum tick count mean "no timestamp"
    pub fn date_time(&mut self) -> Result<Option<DateTime<Utc>>, SourceError> {
        let ticks = self.i64()?;
        if ticks <= 0 || ticks == i64::MAX {
            return Ok(None);
        }
        Ok(from_ticks(ticks))
    }

    pub fn guid(&mut self) -> Result<Uuid, SourceError> {
        let d1 = self.u32()?;
        let d2 = self.u16()?;
        let d3 = self.u16()?;
        let d4: [u8; 8] = self.array()?;
        Ok(Uuid::from_fields(d1, d2, d3, &d4))
    }

    pub fn node_id(&mut self) -> Result<NodeId, SourceError> {
        let encoding = self.u8()?;
        self.node_id_body(encoding & 0x3F)
    }

    fn node_id_body(&mut self, encoding: u8) -> Result<NodeId, SourceError> {
        let id = match encoding {
            0x00 => NodeId::numeric(0, u32::from(self.u8()?)),
            0x01 => {
                let namespace = u16::from(self.u8()?);
                NodeId::numeric(namespace, u32::from(self.u16()?))
            }
            0x02 => {
                let namespace = self.u16()?;
                NodeId::numeric(namespace, self.u32()?)
            }
            0x03 => {
                let namespace = self.u16()?;
                NodeId::string(namespace, self.string()?.unwrap_or_default())
            }
            0x04 => NodeId {
                namespace: self.u16()?,
                identifier: Identifier::Guid(self.guid()?),
            },
            0x05 => NodeId {
                namespace: self.u16()?,
                identifier: Identifier::Opaque(encode_base64(
                    &self.byte_string()?.unwrap_or_default(),
                )),
            },
            other => return Err(malformed(format!("unknown node id encoding 0x{:02X}", other))),
        };
        Ok(id)
    }

    /// Expanded node id; the namespace URI and server index are dropped
    pub fn expanded_node_id(&mut self) -> Result<NodeId, SourceError> {
        let encoding = self.u8()?;
        let id = self.node_id_body(encoding & 0x3F)?;
        if encoding & 0x80 != 0 {
            self.string()?;
        }
        if encoding & 0x40 != 0 {
            self.u32()?;
        }
        Ok(id)
    }

    /// Text of a localized text; the locale is dropped
    pub fn localized_text(&mut self) -> Result<Option<String>, SourceError> {
        let mask = self.u8()?;
        if mask & 0x01 != 0 {
            self.string()?;
        }
        if mask & 0x02 != 0 {
            return self.string();
        }
        Ok(None)
    }

    pub fn qualified_name(&mut self) -> Result<(u16, Option<String>), SourceError> {
        Ok((self.u16()?, self.string()?))
    }

    /// Read past a diagnostic info
    pub fn skip_diagnostic_info(&mut self) -> Result<(), SourceError> {
        self.diagnostic_info(0)
    }

    fn diagnostic_info(&mut self, depth: usize) -> Result<(), SourceError> {
        if depth > MAX_DEPTH {
            return Err(malformed("diagnostic info nested too deeply"));
        }
        let mask = self.u8()?;
        // symbolic id, namespace uri, localized text, locale
        for bit in [0x01, 0x02, 0x04, 0x08] {
            if mask & bit != 0 {
                self.i32()?;
            }
        }
        if mask & 0x10 != 0 {
            self.string()?;
        }
        if mask & 0x20 != 0 {
            self.u32()?;
        }
        if mask & 0x40 != 0 {
            self.diagnostic_info(depth + 1)?;
        }
        Ok(())
    }

    /// Extension object as its type id and binary or XML body
    pub fn extension_object(&mut self) -> Result<(NodeId, Option<&'a [u8]>), SourceError> {
        let type_id = self.node_id()?;
        let body = match self.u8()? {
            0x00 => None,
            0x01 | 0x02 => {
                let len = self.i32()?;
                if len < 0 {
                    None
                } else {
                    Some(self.take(len as usize)?)
                }
            }
            other => {
                return Err(malformed(format!(
                    "unknown extension object encoding 0x{:02X}",
                    other
                )))
            }
        };
        Ok((type_id, body))
    }

    pub fn variant(&mut self) -> Result<Variant, SourceError> {
        self.variant_at(0)
    }

    fn variant_at(&mut self, depth: usize) -> Result<Variant, SourceError> {
        if depth > MAX_DEPTH {
            return Err(malformed("variant nested too deeply"));
        }
        let mask = self.u8()?;
        let type_id = mask & 0x3F;

        if mask & 0x80 == 0 {
            return self.scalar(type_id, depth);
        }

        let len = self.array_len()?;
        let mut items = Vec::with_capacity(len);
        for _ in 0..len {
            items.push(self.scalar(type_id, depth)?);
        }
        if mask & 0x40 != 0 {
            self.sequence(|d| d.i32())?;
        }
        Ok(Variant::Array(items))
    }

    fn scalar(&mut self, type_id: u8, depth: usize) -> Result<Variant, SourceError> {
        let value = match type_id {
            0 => Variant::Empty,
            1 => Variant::Boolean(self.bool()?),
            2 => Variant::SByte(self.u8()? as i8),
            3 => Variant::Byte(self.u8()?),
            4 => Variant::Int16(self.i16()?),
            5 => Variant::UInt16(self.u16()?),
            6 => Variant::Int32(self.i32()?),
            7 => Variant::UInt32(self.u32()?),
            8 => Variant::Int64(self.i64()?),
            9 => Variant::UInt64(self.u64()?),
            10 => Variant::Float(self.f32()?),
            11 => Variant::Double(self.f64()?),
            12 => self.string()?.map(Variant::String).unwrap_or(Variant::Empty),
            13 => self.date_time()?.map(Variant::DateTime).unwrap_or(Variant::Empty),
            15 => self
                .byte_string()?
                .map(Variant::ByteString)
                .unwrap_or(Variant::Empty),
            _ => {
                self.skip_scalar(type_id, depth)?;
                Variant::Other(type_id)
            }
        };
        Ok(value)
    }

    fn skip_scalar(&mut self, type_id: u8, depth: usize) -> Result<(), SourceError> {
        match type_id {
            14 => {
                self.take(16)?;
            }
            16 => {
                self.byte_string()?;
            }
            17 => {
                self.node_id()?;
            }
            18 => {
                self.expanded_node_id()?;
            }
            19 => {
                self.u32()?;
            }
            20 => {
                self.qualified_name()?;
            }
            21 => {
                self.localized_text()?;
            }
            22 => {
                self.extension_object()?;
            }
            23 => {
                self.data_value_at(depth + 1)?;
            }
            24 => {
                self.variant_at(depth + 1)?;
            }
            25 => self.diagnostic_info(depth + 1)?,
            other => return Err(malformed(format!("unknown built-in type {}", other))),
        }
        Ok(())
    }

    pub fn data_value(&mut self) -> Result<DataValue, SourceError> {
        self.data_value_at(0)
    }

    fn data_value_at(&mut self, depth: usize) -> Result<DataValue, SourceError> {
        let mask = self.u8()?;
        let mut value = DataValue::default();
        if mask & 0x01 != 0 {
            value.value = self.variant_at(depth)?;
        }
        if mask & 0x02 != 0 {
            value.status = self.status_code()?;
        }
        if mask & 0x04 != 0 {
            value.source_timestamp = self.date_time()?;
        }
        if mask & 0x10 != 0 {
            self.u16()?;
        }
        if mask & 0x08 != 0 {
            value.server_timestamp = self.date_time()?;
        }
        if mask & 0x20 != 0 {
            self.u16()?;
        }
        Ok(value)
    }
}

fn to_ticks(v: DateTime<Utc>) -> i64 {
    v.timestamp() * TICKS_PER_SECOND
        + i64::from(v.timestamp_subsec_nanos() / 100)
        + EPOCH_OFFSET_TICKS
}

fn from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let unix = ticks - EPOCH_OFFSET_TICKS;
    let secs = unix.div_euclid(TICKS_PER_SECOND);
    let nanos = (unix.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    DateTime::from_timestamp(secs, nanos)
}

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

fn encode_base64(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len().div_ceil(3) * 4);
    for chunk in raw.chunks(3) {
        let n = chunk
            .iter()
            .enumerate()
            .fold(0u32, |acc, (i, b)| acc | u32::from(*b) << (16 - 8 * i));
        for i in 0..4 {
            if i <= chunk.len() {
                out.push(char::from(BASE64_ALPHABET[(n >> (18 - 6 * i) & 0x3F) as usize]));
            } else {
                out.push('=');
            }
        }
    }
    out
}

fn decode_base64(text: &str) -> Option<Vec<u8>> {
    let text = text.trim_end_matches('=');
    let mut out = Vec::with_capacity(text.len() * 3 / 4);
    let mut acc = 0u32;
    let mut bits = 0;
    for c in text.bytes() {
        let value = BASE64_ALPHABET.iter().position(|&a| a == c)? as u32;
        acc = acc << 6 | value;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits & 0xFF) as u8);
        }
    }
    Some(out)
}
