//! The v1.0 payload: a map-keyed format with an inline string table.
//!
//! Every string position is either an inline msgpack string, which appends
//! the string to the payload's table, or a `u32` index referencing an
//! earlier occurrence. The table starts with the empty string at index 0 on
//! both sides, so the encoder never writes `""` inline and the decoder can
//! resolve index 0 from the start.
//!
//! The payload is a msgpack map keyed by integer field ids; only fields
//! marked present in the encoder's bitmap are emitted. Trace chunks stream
//! into the trailing chunks field through the same 8-byte header-slot trick
//! as the v0.4 payload.

use super::intern::StringInterner;
use super::{EncodeError, Payload, PayloadMeta};
use crate::span::SpanInner;
use crate::trace::Chunk;
use std::collections::HashMap;
use std::io;

// Top-level field ids.
const FIELD_CONTAINER_ID: u64 = 2;
const FIELD_LANGUAGE_NAME: u64 = 3;
const FIELD_LANGUAGE_VERSION: u64 = 4;
const FIELD_TRACER_VERSION: u64 = 5;
const FIELD_RUNTIME_ID: u64 = 6;
const FIELD_ENV: u64 = 7;
const FIELD_HOSTNAME: u64 = 8;
const FIELD_APP_VERSION: u64 = 9;
const FIELD_ATTRIBUTES: u64 = 10;
const FIELD_CHUNKS: u64 = 11;

// Value type codes.
const TYPE_STRING: u64 = 1;
const TYPE_BOOL: u64 = 2;
const TYPE_F64: u64 = 3;
const TYPE_I64: u64 = 4;
const TYPE_BYTES: u64 = 5;
const TYPE_ARRAY: u64 = 6;
const TYPE_KV: u64 = 7;

// Chunk field ids.
const CHUNK_PRIORITY: u64 = 1;
const CHUNK_ORIGIN: u64 = 2;
const CHUNK_ATTRIBUTES: u64 = 3;
const CHUNK_SPANS: u64 = 4;
const CHUNK_DROPPED: u64 = 5;
const CHUNK_TRACE_ID: u64 = 6;
const CHUNK_SAMPLING_MECHANISM: u64 = 7;

// Span field ids.
const SPAN_SERVICE: u64 = 1;
const SPAN_NAME: u64 = 2;
const SPAN_RESOURCE: u64 = 3;
const SPAN_SPAN_ID: u64 = 4;
const SPAN_PARENT_ID: u64 = 5;
const SPAN_START: u64 = 6;
const SPAN_DURATION: u64 = 7;
const SPAN_ERROR: u64 = 8;
const SPAN_ATTRIBUTES: u64 = 9;
const SPAN_TYPE: u64 = 10;
const SPAN_LINKS: u64 = 11;
const SPAN_EVENTS: u64 = 12;
const SPAN_ENV: u64 = 13;
const SPAN_VERSION: u64 = 14;
const SPAN_COMPONENT: u64 = 15;
const SPAN_KIND: u64 = 16;
const SPAN_FIELD_COUNT: u32 = 16;

// Link and event field ids.
const LINK_TRACE_ID: u64 = 1;
const LINK_SPAN_ID: u64 = 2;
const LINK_ATTRIBUTES: u64 = 3;
const LINK_TRACESTATE: u64 = 4;
const LINK_FLAGS: u64 = 5;
const EVENT_TIME: u64 = 1;
const EVENT_NAME: u64 = 2;
const EVENT_ATTRIBUTES: u64 = 3;

pub(crate) struct PayloadV1 {
    /// Map header, metadata fields and the chunks key, written once.
    head: Vec<u8>,
    chunk_header: [u8; 8],
    off: usize,
    count: usize,
    buf: Vec<u8>,
    table: StringInterner,
    env: String,
    app_version: String,
    pos: usize,
}

impl PayloadV1 {
    pub(crate) fn new(meta: &PayloadMeta) -> Self {
        let mut table = StringInterner::new();
        let mut head = Vec::with_capacity(256);

        let metadata: [(u64, &str); 8] = [
            (FIELD_CONTAINER_ID, &meta.container_id),
            (FIELD_LANGUAGE_NAME, &meta.language_name),
            (FIELD_LANGUAGE_VERSION, &meta.language_version),
            (FIELD_TRACER_VERSION, &meta.tracer_version),
            (FIELD_RUNTIME_ID, &meta.runtime_id),
            (FIELD_ENV, &meta.env),
            (FIELD_HOSTNAME, &meta.hostname),
            (FIELD_APP_VERSION, &meta.app_version),
        ];
        let mut presence = 1u16 << FIELD_CHUNKS;
        for (id, value) in &metadata {
            if !value.is_empty() {
                presence |= 1 << id;
            }
        }
        if !meta.attributes.is_empty() {
            presence |= 1 << FIELD_ATTRIBUTES;
        }

        // Building the head cannot fail on a Vec; unreachable errors are
        // swallowed to keep construction infallible.
        let _ = (|| -> Result<(), EncodeError> {
            rmp::encode::write_map_len(&mut head, presence.count_ones())?;
            for (id, value) in &metadata {
                if presence & (1 << id) != 0 {
                    rmp::encode::write_uint(&mut head, *id)?;
                    write_string(&mut head, &mut table, value)?;
                }
            }
            if presence & (1 << FIELD_ATTRIBUTES) != 0 {
                rmp::encode::write_uint(&mut head, FIELD_ATTRIBUTES)?;
                rmp::encode::write_map_len(&mut head, meta.attributes.len() as u32)?;
                for (key, value) in &meta.attributes {
                    write_string(&mut head, &mut table, key)?;
                    rmp::encode::write_uint(&mut head, TYPE_STRING)?;
                    write_string(&mut head, &mut table, value)?;
                }
            }
            rmp::encode::write_uint(&mut head, FIELD_CHUNKS)?;
            Ok(())
        })();

        let mut payload = PayloadV1 {
            head,
            chunk_header: [0; 8],
            off: 8,
            count: 0,
            buf: Vec::with_capacity(4096),
            table,
            env: meta.env.clone(),
            app_version: meta.app_version.clone(),
            pos: 0,
        };
        payload.update_header();
        payload
    }

    fn update_header(&mut self) {
        let n = self.count;
        if n <= 15 {
            self.chunk_header[7] = 0x90 | n as u8;
            self.off = 7;
        } else if n <= 0xffff {
            self.chunk_header[5] = 0xdc;
            self.chunk_header[6..8].copy_from_slice(&(n as u16).to_be_bytes());
            self.off = 5;
        } else {
            self.chunk_header[3] = 0xdd;
            self.chunk_header[4..8].copy_from_slice(&(n as u32).to_be_bytes());
            self.off = 3;
        }
    }

    fn encode_span(&mut self, span: &SpanInner) -> Result<(), EncodeError> {
        let PayloadV1 {
            buf,
            table,
            env,
            app_version,
            ..
        } = self;
        span.with_fields(|f| {
            rmp::encode::write_map_len(buf, SPAN_FIELD_COUNT)?;

            rmp::encode::write_uint(buf, SPAN_SERVICE)?;
            write_string(buf, table, &f.service)?;
            rmp::encode::write_uint(buf, SPAN_NAME)?;
            write_string(buf, table, &f.name)?;
            rmp::encode::write_uint(buf, SPAN_RESOURCE)?;
            write_string(buf, table, &f.resource)?;
            rmp::encode::write_uint(buf, SPAN_SPAN_ID)?;
            rmp::encode::write_u64(buf, f.span_id)?;
            rmp::encode::write_uint(buf, SPAN_PARENT_ID)?;
            rmp::encode::write_u64(buf, f.parent_id)?;
            rmp::encode::write_uint(buf, SPAN_START)?;
            rmp::encode::write_i64(buf, f.start)?;
            rmp::encode::write_uint(buf, SPAN_DURATION)?;
            rmp::encode::write_i64(buf, f.duration)?;
            rmp::encode::write_uint(buf, SPAN_ERROR)?;
            rmp::encode::write_bool(buf, f.error != 0)?;

            rmp::encode::write_uint(buf, SPAN_ATTRIBUTES)?;
            let attr_len = f.meta.len() + f.metrics.len() + f.meta_struct.len();
            rmp::encode::write_map_len(buf, attr_len as u32)?;
            for (key, value) in &f.meta {
                write_string(buf, table, key)?;
                rmp::encode::write_uint(buf, TYPE_STRING)?;
                write_string(buf, table, value)?;
            }
            for (key, value) in &f.metrics {
                write_string(buf, table, key)?;
                rmp::encode::write_uint(buf, TYPE_F64)?;
                rmp::encode::write_f64(buf, *value)?;
            }
            for (key, value) in &f.meta_struct {
                write_string(buf, table, key)?;
                rmp::encode::write_uint(buf, TYPE_BYTES)?;
                rmp::encode::write_bin(buf, value)?;
            }

            rmp::encode::write_uint(buf, SPAN_TYPE)?;
            write_string(buf, table, &f.span_type)?;

            rmp::encode::write_uint(buf, SPAN_LINKS)?;
            rmp::encode::write_array_len(buf, f.span_links.len() as u32)?;
            for link in &f.span_links {
                rmp::encode::write_map_len(buf, 5)?;
                rmp::encode::write_uint(buf, LINK_TRACE_ID)?;
                rmp::encode::write_bin(buf, &trace_id_bytes(link.trace_id))?;
                rmp::encode::write_uint(buf, LINK_SPAN_ID)?;
                rmp::encode::write_u64(buf, link.span_id)?;
                rmp::encode::write_uint(buf, LINK_ATTRIBUTES)?;
                rmp::encode::write_map_len(buf, link.attributes.len() as u32)?;
                for (key, value) in &link.attributes {
                    write_string(buf, table, key)?;
                    rmp::encode::write_uint(buf, TYPE_STRING)?;
                    write_string(buf, table, value)?;
                }
                rmp::encode::write_uint(buf, LINK_TRACESTATE)?;
                write_string(buf, table, &link.trace_state)?;
                rmp::encode::write_uint(buf, LINK_FLAGS)?;
                rmp::encode::write_u32(buf, link.flags)?;
            }

            rmp::encode::write_uint(buf, SPAN_EVENTS)?;
            rmp::encode::write_array_len(buf, f.span_events.len() as u32)?;
            for event in &f.span_events {
                rmp::encode::write_map_len(buf, 3)?;
                rmp::encode::write_uint(buf, EVENT_TIME)?;
                rmp::encode::write_i64(buf, event.time_unix_nano)?;
                rmp::encode::write_uint(buf, EVENT_NAME)?;
                write_string(buf, table, &event.name)?;
                rmp::encode::write_uint(buf, EVENT_ATTRIBUTES)?;
                rmp::encode::write_map_len(buf, event.attributes.len() as u32)?;
                for (key, value) in &event.attributes {
                    write_string(buf, table, key)?;
                    rmp::encode::write_uint(buf, TYPE_STRING)?;
                    write_string(buf, table, value)?;
                }
            }

            rmp::encode::write_uint(buf, SPAN_ENV)?;
            write_string(buf, table, env)?;
            rmp::encode::write_uint(buf, SPAN_VERSION)?;
            write_string(buf, table, app_version)?;
            rmp::encode::write_uint(buf, SPAN_COMPONENT)?;
            write_string(buf, table, &f.integration)?;
            rmp::encode::write_uint(buf, SPAN_KIND)?;
            rmp::encode::write_uint(buf, span_kind(f.meta.get("span.kind")))?;
            Ok(())
        })
    }
}

impl Payload for PayloadV1 {
    fn push(&mut self, chunk: &Chunk) -> Result<(), EncodeError> {
        rmp::encode::write_map_len(&mut self.buf, 7)?;
        rmp::encode::write_uint(&mut self.buf, CHUNK_PRIORITY)?;
        rmp::encode::write_i32(&mut self.buf, chunk.priority.unwrap_or(0))?;
        rmp::encode::write_uint(&mut self.buf, CHUNK_ORIGIN)?;
        write_string(&mut self.buf, &mut self.table, &chunk.origin)?;
        // Chunk-common attributes ride on the first span's tag stores.
        rmp::encode::write_uint(&mut self.buf, CHUNK_ATTRIBUTES)?;
        rmp::encode::write_map_len(&mut self.buf, 0)?;
        rmp::encode::write_uint(&mut self.buf, CHUNK_SPANS)?;
        rmp::encode::write_array_len(&mut self.buf, chunk.spans.len() as u32)?;
        for span in &chunk.spans {
            self.encode_span(span)?;
        }
        rmp::encode::write_uint(&mut self.buf, CHUNK_DROPPED)?;
        rmp::encode::write_bool(&mut self.buf, chunk.dropped)?;
        rmp::encode::write_uint(&mut self.buf, CHUNK_TRACE_ID)?;
        rmp::encode::write_bin(&mut self.buf, &trace_id_bytes(chunk.trace_id))?;
        rmp::encode::write_uint(&mut self.buf, CHUNK_SAMPLING_MECHANISM)?;
        rmp::encode::write_u32(&mut self.buf, chunk.mechanism.unwrap_or(0))?;

        self.count += 1;
        self.update_header();
        Ok(())
    }

    fn size(&self) -> usize {
        self.head.len() + (8 - self.off) + self.buf.len()
    }

    fn count(&self) -> usize {
        self.count
    }

    fn reset(&mut self) {
        self.update_header();
        self.pos = 0;
    }

    fn clear(&mut self) {
        self.buf = Vec::new();
        self.count = 0;
        self.pos = 0;
        self.update_header();
    }
}

impl io::Read for PayloadV1 {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let header = &self.chunk_header[self.off..];
        let sections: [&[u8]; 3] = [self.head.as_slice(), header, self.buf.as_slice()];
        let mut written = 0;
        while written < out.len() {
            let mut pos = self.pos;
            let mut src = None;
            for section in sections {
                if pos < section.len() {
                    src = Some((section, pos));
                    break;
                }
                pos -= section.len();
            }
            let Some((section, section_pos)) = src else {
                break;
            };
            let n = (out.len() - written).min(section.len() - section_pos);
            out[written..written + n].copy_from_slice(&section[section_pos..section_pos + n]);
            written += n;
            self.pos += n;
        }
        Ok(written)
    }
}

fn write_string(
    buf: &mut Vec<u8>,
    table: &mut StringInterner,
    value: &str,
) -> Result<(), EncodeError> {
    if let Some(idx) = table.get(value) {
        rmp::encode::write_u32(buf, idx)?;
    } else {
        table.intern(value);
        rmp::encode::write_str(buf, value)?;
    }
    Ok(())
}

fn trace_id_bytes(trace_id: crate::ids::TraceId) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&trace_id.upper().to_be_bytes());
    bytes[8..].copy_from_slice(&trace_id.lower().to_be_bytes());
    bytes
}

fn span_kind(kind: Option<&String>) -> u64 {
    match kind.map(String::as_str) {
        Some("internal") => 1,
        Some("server") => 2,
        Some("client") => 3,
        Some("producer") => 4,
        Some("consumer") => 5,
        _ => 0,
    }
}

/// A decoded v1 value.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum DecodedValue {
    Str(String),
    Bool(bool),
    F64(f64),
    I64(i64),
    Bytes(Vec<u8>),
    Array(Vec<DecodedValue>),
    KeyValue(Vec<(String, DecodedValue)>),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DecodedSpan {
    pub service: String,
    pub name: String,
    pub resource: String,
    pub span_id: u64,
    pub parent_id: u64,
    pub start: i64,
    pub duration: i64,
    pub error: bool,
    pub attributes: HashMap<String, DecodedValue>,
    pub span_type: String,
    pub links: Vec<HashMap<u64, DecodedValue>>,
    pub events: Vec<HashMap<u64, DecodedValue>>,
    pub env: String,
    pub version: String,
    pub component: String,
    pub kind: u64,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DecodedChunk {
    pub priority: i32,
    pub origin: String,
    pub attributes: HashMap<String, DecodedValue>,
    pub spans: Vec<DecodedSpan>,
    pub dropped: bool,
    pub trace_id: [u8; 16],
    pub sampling_mechanism: u32,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct DecodedPayload {
    pub metadata: HashMap<u64, String>,
    pub attributes: HashMap<String, DecodedValue>,
    pub chunks: Vec<DecodedChunk>,
}

/// Decodes a complete v1 payload, rebuilding the string table from inline
/// strings as they appear.
pub(crate) fn decode(data: &[u8]) -> Result<DecodedPayload, EncodeError> {
    let mut reader = Reader::new(data);
    let mut payload = DecodedPayload::default();

    let entries = reader.read_map_len()?;
    for _ in 0..entries {
        let id = reader.read_uint()?;
        match id {
            FIELD_ATTRIBUTES => payload.attributes = reader.read_kv_map()?,
            FIELD_CHUNKS => {
                let n = reader.read_array_len()?;
                for _ in 0..n {
                    payload.chunks.push(reader.read_chunk()?);
                }
            }
            _ => {
                payload.metadata.insert(id, reader.read_string()?);
            }
        }
    }
    Ok(payload)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    table: Vec<String>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader {
            data,
            pos: 0,
            table: vec![String::new()],
        }
    }

    fn byte(&mut self) -> Result<u8, EncodeError> {
        let b = *self.data.get(self.pos).ok_or(EncodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn peek(&self) -> Result<u8, EncodeError> {
        self.data.get(self.pos).copied().ok_or(EncodeError::Truncated)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], EncodeError> {
        if self.pos + n > self.data.len() {
            return Err(EncodeError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_be(&mut self, n: usize) -> Result<u64, EncodeError> {
        let bytes = self.take(n)?;
        let mut value = 0u64;
        for b in bytes {
            value = value << 8 | *b as u64;
        }
        Ok(value)
    }

    fn read_uint(&mut self) -> Result<u64, EncodeError> {
        let marker = self.byte()?;
        match marker {
            0x00..=0x7f => Ok(marker as u64),
            0xcc => self.read_be(1),
            0xcd => self.read_be(2),
            0xce => self.read_be(4),
            0xcf => self.read_be(8),
            other => Err(EncodeError::UnexpectedMarker(other)),
        }
    }

    fn read_int(&mut self) -> Result<i64, EncodeError> {
        let marker = self.peek()?;
        match marker {
            0xe0..=0xff => {
                self.pos += 1;
                Ok(marker as i8 as i64)
            }
            0xd0 => {
                self.pos += 1;
                Ok(self.read_be(1)? as u8 as i8 as i64)
            }
            0xd1 => {
                self.pos += 1;
                Ok(self.read_be(2)? as u16 as i16 as i64)
            }
            0xd2 => {
                self.pos += 1;
                Ok(self.read_be(4)? as u32 as i32 as i64)
            }
            0xd3 => {
                self.pos += 1;
                Ok(self.read_be(8)? as i64)
            }
            _ => Ok(self.read_uint()? as i64),
        }
    }

    fn read_bool(&mut self) -> Result<bool, EncodeError> {
        match self.byte()? {
            0xc2 => Ok(false),
            0xc3 => Ok(true),
            other => Err(EncodeError::UnexpectedMarker(other)),
        }
    }

    fn read_f64(&mut self) -> Result<f64, EncodeError> {
        match self.byte()? {
            0xcb => Ok(f64::from_bits(self.read_be(8)?)),
            0xca => Ok(f32::from_bits(self.read_be(4)? as u32) as f64),
            other => Err(EncodeError::UnexpectedMarker(other)),
        }
    }

    fn read_bin(&mut self) -> Result<Vec<u8>, EncodeError> {
        let len = match self.byte()? {
            0xc4 => self.read_be(1)? as usize,
            0xc5 => self.read_be(2)? as usize,
            0xc6 => self.read_be(4)? as usize,
            other => return Err(EncodeError::UnexpectedMarker(other)),
        };
        Ok(self.take(len)?.to_vec())
    }

    fn read_array_len(&mut self) -> Result<usize, EncodeError> {
        match self.byte()? {
            m @ 0x90..=0x9f => Ok((m & 0x0f) as usize),
            0xdc => Ok(self.read_be(2)? as usize),
            0xdd => Ok(self.read_be(4)? as usize),
            other => Err(EncodeError::UnexpectedMarker(other)),
        }
    }

    fn read_map_len(&mut self) -> Result<usize, EncodeError> {
        match self.byte()? {
            m @ 0x80..=0x8f => Ok((m & 0x0f) as usize),
            0xde => Ok(self.read_be(2)? as usize),
            0xdf => Ok(self.read_be(4)? as usize),
            other => Err(EncodeError::UnexpectedMarker(other)),
        }
    }

    /// A string position: either a u32 index into the table or an inline
    /// string that extends it.
    fn read_string(&mut self) -> Result<String, EncodeError> {
        let marker = self.peek()?;
        match marker {
            0xce => {
                self.pos += 1;
                let idx = self.read_be(4)? as u32;
                self.table
                    .get(idx as usize)
                    .cloned()
                    .ok_or(EncodeError::BadStringIndex(idx))
            }
            0xa0..=0xbf | 0xd9 | 0xda | 0xdb => {
                let len = match self.byte()? {
                    m @ 0xa0..=0xbf => (m & 0x1f) as usize,
                    0xd9 => self.read_be(1)? as usize,
                    0xda => self.read_be(2)? as usize,
                    _ => self.read_be(4)? as usize,
                };
                let value = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| EncodeError::MessagePack)?
                    .to_string();
                self.table.push(value.clone());
                Ok(value)
            }
            other => Err(EncodeError::UnexpectedMarker(other)),
        }
    }

    fn read_value(&mut self) -> Result<DecodedValue, EncodeError> {
        match self.read_uint()? {
            TYPE_STRING => Ok(DecodedValue::Str(self.read_string()?)),
            TYPE_BOOL => Ok(DecodedValue::Bool(self.read_bool()?)),
            TYPE_F64 => Ok(DecodedValue::F64(self.read_f64()?)),
            TYPE_I64 => Ok(DecodedValue::I64(self.read_int()?)),
            TYPE_BYTES => Ok(DecodedValue::Bytes(self.read_bin()?)),
            TYPE_ARRAY => {
                let n = self.read_array_len()?;
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    values.push(self.read_value()?);
                }
                Ok(DecodedValue::Array(values))
            }
            TYPE_KV => {
                let n = self.read_map_len()?;
                let mut values = Vec::with_capacity(n);
                for _ in 0..n {
                    let key = self.read_string()?;
                    values.push((key, self.read_value()?));
                }
                Ok(DecodedValue::KeyValue(values))
            }
            other => Err(EncodeError::UnexpectedMarker(other as u8)),
        }
    }

    fn read_kv_map(&mut self) -> Result<HashMap<String, DecodedValue>, EncodeError> {
        let n = self.read_map_len()?;
        let mut map = HashMap::with_capacity(n);
        for _ in 0..n {
            let key = self.read_string()?;
            map.insert(key, self.read_value()?);
        }
        Ok(map)
    }

    fn read_chunk(&mut self) -> Result<DecodedChunk, EncodeError> {
        let mut chunk = DecodedChunk::default();
        let entries = self.read_map_len()?;
        for _ in 0..entries {
            match self.read_uint()? {
                CHUNK_PRIORITY => chunk.priority = self.read_int()? as i32,
                CHUNK_ORIGIN => chunk.origin = self.read_string()?,
                CHUNK_ATTRIBUTES => chunk.attributes = self.read_kv_map()?,
                CHUNK_SPANS => {
                    let n = self.read_array_len()?;
                    for _ in 0..n {
                        chunk.spans.push(self.read_span()?);
                    }
                }
                CHUNK_DROPPED => chunk.dropped = self.read_bool()?,
                CHUNK_TRACE_ID => {
                    let bytes = self.read_bin()?;
                    if bytes.len() != 16 {
                        return Err(EncodeError::MessagePack);
                    }
                    chunk.trace_id.copy_from_slice(&bytes);
                }
                CHUNK_SAMPLING_MECHANISM => {
                    chunk.sampling_mechanism = self.read_uint()? as u32
                }
                other => return Err(EncodeError::UnexpectedMarker(other as u8)),
            }
        }
        Ok(chunk)
    }

    fn read_id_value_map(&mut self) -> Result<HashMap<u64, DecodedValue>, EncodeError> {
        let entries = self.read_map_len()?;
        let mut map = HashMap::with_capacity(entries);
        for _ in 0..entries {
            let id = self.read_uint()?;
            let value = match id {
                LINK_TRACE_ID => DecodedValue::Bytes(self.read_bin()?),
                LINK_SPAN_ID | LINK_FLAGS => DecodedValue::I64(self.read_uint()? as i64),
                LINK_ATTRIBUTES => {
                    DecodedValue::KeyValue(self.read_kv_map()?.into_iter().collect())
                }
                LINK_TRACESTATE => DecodedValue::Str(self.read_string()?),
                other => return Err(EncodeError::UnexpectedMarker(other as u8)),
            };
            map.insert(id, value);
        }
        Ok(map)
    }

    fn read_event_map(&mut self) -> Result<HashMap<u64, DecodedValue>, EncodeError> {
        let entries = self.read_map_len()?;
        let mut map = HashMap::with_capacity(entries);
        for _ in 0..entries {
            let id = self.read_uint()?;
            let value = match id {
                EVENT_TIME => DecodedValue::I64(self.read_int()?),
                EVENT_NAME => DecodedValue::Str(self.read_string()?),
                EVENT_ATTRIBUTES => {
                    DecodedValue::KeyValue(self.read_kv_map()?.into_iter().collect())
                }
                other => return Err(EncodeError::UnexpectedMarker(other as u8)),
            };
            map.insert(id, value);
        }
        Ok(map)
    }

    fn read_span(&mut self) -> Result<DecodedSpan, EncodeError> {
        let mut span = DecodedSpan::default();
        let entries = self.read_map_len()?;
        for _ in 0..entries {
            match self.read_uint()? {
                SPAN_SERVICE => span.service = self.read_string()?,
                SPAN_NAME => span.name = self.read_string()?,
                SPAN_RESOURCE => span.resource = self.read_string()?,
                SPAN_SPAN_ID => span.span_id = self.read_uint()?,
                SPAN_PARENT_ID => span.parent_id = self.read_uint()?,
                SPAN_START => span.start = self.read_int()?,
                SPAN_DURATION => span.duration = self.read_int()?,
                SPAN_ERROR => span.error = self.read_bool()?,
                SPAN_ATTRIBUTES => span.attributes = self.read_kv_map()?,
                SPAN_TYPE => span.span_type = self.read_string()?,
                SPAN_LINKS => {
                    let n = self.read_array_len()?;
                    for _ in 0..n {
                        span.links.push(self.read_id_value_map()?);
                    }
                }
                SPAN_EVENTS => {
                    let n = self.read_array_len()?;
                    for _ in 0..n {
                        span.events.push(self.read_event_map()?);
                    }
                }
                SPAN_ENV => span.env = self.read_string()?,
                SPAN_VERSION => span.version = self.read_string()?,
                SPAN_COMPONENT => span.component = self.read_string()?,
                SPAN_KIND => span.kind = self.read_uint()?,
                other => return Err(EncodeError::UnexpectedMarker(other as u8)),
            }
        }
        Ok(span)
    }
}
