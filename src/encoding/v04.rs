//! The v0.4 payload: a streamed msgpack array of arrays of spans.
//!
//! The stream opens with an 8-byte header slot. The msgpack array prefix is
//! written into the slot's tail at flush time, once the final trace count is
//! known: `0x90 | n` for up to 15 items, `0xdc` plus a big-endian u16 up to
//! 65535, `0xdd` plus a u32 beyond. Reading starts at the slot offset the
//! prefix occupies.

use super::{EncodeError, Payload};
use crate::span::SpanInner;
use crate::trace::Chunk;
use std::io;

pub(crate) struct PayloadV04 {
    header: [u8; 8],
    off: usize,
    count: usize,
    buf: Vec<u8>,
    /// Reader position across the virtual header+buffer stream.
    pos: usize,
}

impl PayloadV04 {
    pub(crate) fn new() -> Self {
        let mut payload = PayloadV04 {
            header: [0; 8],
            off: 8,
            count: 0,
            buf: Vec::with_capacity(4096),
            pos: 0,
        };
        payload.update_header();
        payload
    }

    fn update_header(&mut self) {
        let n = self.count;
        if n <= 15 {
            self.header[7] = 0x90 | n as u8;
            self.off = 7;
        } else if n <= 0xffff {
            self.header[5] = 0xdc;
            self.header[6..8].copy_from_slice(&(n as u16).to_be_bytes());
            self.off = 5;
        } else {
            self.header[3] = 0xdd;
            self.header[4..8].copy_from_slice(&(n as u32).to_be_bytes());
            self.off = 3;
        }
    }
}

impl Payload for PayloadV04 {
    fn push(&mut self, chunk: &Chunk) -> Result<(), EncodeError> {
        rmp::encode::write_array_len(&mut self.buf, chunk.spans.len() as u32)?;
        for span in &chunk.spans {
            encode_span(&mut self.buf, span)?;
        }
        self.count += 1;
        self.update_header();
        Ok(())
    }

    fn size(&self) -> usize {
        (8 - self.off) + self.buf.len()
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

impl io::Read for PayloadV04 {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let header = &self.header[self.off..];
        let mut written = 0;
        while written < out.len() {
            let (src, src_pos) = if self.pos < header.len() {
                (header, self.pos)
            } else if self.pos - header.len() < self.buf.len() {
                (self.buf.as_slice(), self.pos - header.len())
            } else {
                break;
            };
            let n = (out.len() - written).min(src.len() - src_pos);
            out[written..written + n].copy_from_slice(&src[src_pos..src_pos + n]);
            written += n;
            self.pos += n;
        }
        Ok(written)
    }
}

fn encode_span(buf: &mut Vec<u8>, span: &SpanInner) -> Result<(), EncodeError> {
    span.with_fields(|f| {
        let mut fields = 12u32;
        if !f.meta_struct.is_empty() {
            fields += 1;
        }
        if !f.span_links.is_empty() {
            fields += 1;
        }
        if !f.span_events.is_empty() {
            fields += 1;
        }
        rmp::encode::write_map_len(buf, fields)?;

        rmp::encode::write_str(buf, "service")?;
        rmp::encode::write_str(buf, &f.service)?;
        rmp::encode::write_str(buf, "name")?;
        rmp::encode::write_str(buf, &f.name)?;
        rmp::encode::write_str(buf, "resource")?;
        rmp::encode::write_str(buf, &f.resource)?;
        rmp::encode::write_str(buf, "trace_id")?;
        rmp::encode::write_u64(buf, f.trace_id.lower())?;
        rmp::encode::write_str(buf, "span_id")?;
        rmp::encode::write_u64(buf, f.span_id)?;
        rmp::encode::write_str(buf, "parent_id")?;
        rmp::encode::write_u64(buf, f.parent_id)?;
        rmp::encode::write_str(buf, "start")?;
        rmp::encode::write_i64(buf, f.start)?;
        rmp::encode::write_str(buf, "duration")?;
        rmp::encode::write_i64(buf, f.duration)?;
        rmp::encode::write_str(buf, "error")?;
        rmp::encode::write_i32(buf, f.error)?;

        rmp::encode::write_str(buf, "meta")?;
        rmp::encode::write_map_len(buf, f.meta.len() as u32)?;
        for (key, value) in &f.meta {
            rmp::encode::write_str(buf, key)?;
            rmp::encode::write_str(buf, value)?;
        }

        rmp::encode::write_str(buf, "metrics")?;
        rmp::encode::write_map_len(buf, f.metrics.len() as u32)?;
        for (key, value) in &f.metrics {
            rmp::encode::write_str(buf, key)?;
            rmp::encode::write_f64(buf, *value)?;
        }

        rmp::encode::write_str(buf, "type")?;
        rmp::encode::write_str(buf, &f.span_type)?;

        if !f.meta_struct.is_empty() {
            rmp::encode::write_str(buf, "meta_struct")?;
            rmp::encode::write_map_len(buf, f.meta_struct.len() as u32)?;
            for (key, value) in &f.meta_struct {
                rmp::encode::write_str(buf, key)?;
                rmp::encode::write_bin(buf, value)?;
            }
        }

        if !f.span_links.is_empty() {
            rmp::encode::write_str(buf, "span_links")?;
            rmp::encode::write_array_len(buf, f.span_links.len() as u32)?;
            for link in &f.span_links {
                let mut entries = 2u32;
                if link.trace_id.upper() != 0 {
                    entries += 1;
                }
                if !link.attributes.is_empty() {
                    entries += 1;
                }
                if !link.trace_state.is_empty() {
                    entries += 1;
                }
                if link.flags != 0 {
                    entries += 1;
                }
                rmp::encode::write_map_len(buf, entries)?;
                rmp::encode::write_str(buf, "trace_id")?;
                rmp::encode::write_u64(buf, link.trace_id.lower())?;
                if link.trace_id.upper() != 0 {
                    rmp::encode::write_str(buf, "trace_id_high")?;
                    rmp::encode::write_u64(buf, link.trace_id.upper())?;
                }
                rmp::encode::write_str(buf, "span_id")?;
                rmp::encode::write_u64(buf, link.span_id)?;
                if !link.attributes.is_empty() {
                    rmp::encode::write_str(buf, "attributes")?;
                    rmp::encode::write_map_len(buf, link.attributes.len() as u32)?;
                    for (key, value) in &link.attributes {
                        rmp::encode::write_str(buf, key)?;
                        rmp::encode::write_str(buf, value)?;
                    }
                }
                if !link.trace_state.is_empty() {
                    rmp::encode::write_str(buf, "tracestate")?;
                    rmp::encode::write_str(buf, &link.trace_state)?;
                }
                if link.flags != 0 {
                    rmp::encode::write_str(buf, "flags")?;
                    rmp::encode::write_u32(buf, link.flags)?;
                }
            }
        }

        if !f.span_events.is_empty() {
            rmp::encode::write_str(buf, "span_events")?;
            rmp::encode::write_array_len(buf, f.span_events.len() as u32)?;
            for event in &f.span_events {
                rmp::encode::write_map_len(buf, 3)?;
                rmp::encode::write_str(buf, "time_unix_nano")?;
                rmp::encode::write_i64(buf, event.time_unix_nano)?;
                rmp::encode::write_str(buf, "name")?;
                rmp::encode::write_str(buf, &event.name)?;
                rmp::encode::write_str(buf, "attributes")?;
                rmp::encode::write_map_len(buf, event.attributes.len() as u32)?;
                for (key, value) in &event.attributes {
                    rmp::encode::write_str(buf, key)?;
                    rmp::encode::write_str(buf, value)?;
                }
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TraceId;
    use crate::span::SpanFields;
    use crate::trace::ChunkKind;
    use std::io::Read;
    use std::sync::Arc;

    fn chunk_of(n_spans: usize) -> Chunk {
        let spans = (0..n_spans)
            .map(|i| {
                let fields = SpanFields {
                    name: "web.request".to_string(),
                    service: "svc".to_string(),
                    resource: "GET /".to_string(),
                    span_type: "web".to_string(),
                    span_id: i as u64 + 1,
                    trace_id: TraceId::new(0, 99),
                    start: 1_000,
                    duration: 500,
                    ..SpanFields::default()
                };
                Arc::new(SpanInner::new(fields))
            })
            .collect();
        Chunk {
            spans,
            trace_id: TraceId::new(0, 99),
            origin: String::new(),
            priority: Some(1),
            mechanism: None,
            dropped: false,
            kind: ChunkKind::Finished,
        }
    }

    fn read_all(payload: &mut PayloadV04) -> Vec<u8> {
        let mut out = Vec::new();
        payload.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn header_markers_across_count_boundaries() {
        let cases: [(usize, Vec<u8>); 5] = [
            (0, vec![0x90]),
            (15, vec![0x9f]),
            (16, vec![0xdc, 0x00, 0x10]),
            (65535, vec![0xdc, 0xff, 0xff]),
            (65536, vec![0xdd, 0x00, 0x01, 0x00, 0x00]),
        ];
        for (count, expected_prefix) in cases {
            let mut payload = PayloadV04::new();
            let empty = chunk_of(0);
            for _ in 0..count {
                payload.push(&empty).unwrap();
            }
            payload.reset();
            let bytes = read_all(&mut payload);
            assert_eq!(
                &bytes[..expected_prefix.len()],
                expected_prefix.as_slice(),
                "count {count}"
            );
            assert_eq!(payload.count(), count);
        }
    }

    #[test]
    fn push_appends_trace_arrays() {
        let mut payload = PayloadV04::new();
        payload.push(&chunk_of(2)).unwrap();
        payload.reset();
        let bytes = read_all(&mut payload);

        // One trace of two spans: fixarray(1), then fixarray(2).
        assert_eq!(bytes[0], 0x91);
        assert_eq!(bytes[1], 0x92);
        // The span map carries the service string inline.
        let needle = b"\xa7service\xa3svc";
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn size_tracks_header_and_buffer() {
        let mut payload = PayloadV04::new();
        assert_eq!(payload.size(), 1);
        payload.push(&chunk_of(1)).unwrap();
        payload.reset();
        let bytes = read_all(&mut payload);
        assert_eq!(bytes.len(), payload.size());
    }

    #[test]
    fn reset_replays_identical_bytes() {
        let mut payload = PayloadV04::new();
        payload.push(&chunk_of(3)).unwrap();
        payload.push(&chunk_of(1)).unwrap();

        payload.reset();
        let first = read_all(&mut payload);
        // Reader is exhausted until the next reset.
        assert!(read_all(&mut payload).is_empty());

        payload.reset();
        let second = read_all(&mut payload);
        assert_eq!(first, second);
    }

    #[test]
    fn clear_discards_everything() {
        let mut payload = PayloadV04::new();
        payload.push(&chunk_of(2)).unwrap();
        payload.clear();
        assert_eq!(payload.count(), 0);
        assert_eq!(payload.size(), 1);
        payload.reset();
        assert_eq!(read_all(&mut payload), vec![0x90]);
    }

    #[test]
    fn optional_sections_only_when_present() {
        let mut payload = PayloadV04::new();
        payload.push(&chunk_of(1)).unwrap();
        payload.reset();
        let bytes = read_all(&mut payload);
        let needle = b"meta_struct";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));

        let chunk = chunk_of(1);
        chunk.spans[0].with_fields_mut(|f| {
            f.meta_struct
                .insert("appsec".to_string(), vec![0xde, 0xad]);
        });
        let mut payload = PayloadV04::new();
        payload.push(&chunk).unwrap();
        payload.reset();
        let bytes = read_all(&mut payload);
        assert!(bytes.windows(needle.len()).any(|w| w == needle));
    }
}
