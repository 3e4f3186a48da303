//! Binary payload encoders for the agent trace endpoints.
//!
//! Both encoders build a payload incrementally: completed trace chunks are
//! appended as they arrive and the finished buffer is streamed to the agent
//! through [`std::io::Read`]. [`v04`] produces the classic msgpack
//! array-of-arrays accepted at `/v0.4/traces` (and unchanged at `/v0.3`);
//! [`v1`] produces the string-table format accepted at `/v1.0/traces`.

mod intern;
pub(crate) mod v04;
pub(crate) mod v1;

use crate::config::{ApiVersion, Config};
use crate::trace::Chunk;
use std::io;
use thiserror::Error;

/// Payload encoding failures.
#[derive(Debug, Error)]
pub(crate) enum EncodeError {
    #[error("message pack error")]
    MessagePack,
    #[error("truncated payload")]
    Truncated,
    #[error("string table index {0} out of range")]
    BadStringIndex(u32),
    #[error("unexpected marker 0x{0:02x}")]
    UnexpectedMarker(u8),
}

impl From<rmp::encode::ValueWriteError> for EncodeError {
    fn from(_: rmp::encode::ValueWriteError) -> Self {
        EncodeError::MessagePack
    }
}

impl From<io::Error> for EncodeError {
    fn from(_: io::Error) -> Self {
        EncodeError::MessagePack
    }
}

/// A write-once batch of trace chunks. `reset` rewinds the reader for a
/// retry of the same bytes; `clear` discards the buffer once the payload is
/// done.
pub(crate) trait Payload: io::Read + Send {
    fn push(&mut self, chunk: &Chunk) -> Result<(), EncodeError>;

    /// Encoded size in bytes, header included.
    fn size(&self) -> usize;

    /// Number of chunks pushed.
    fn count(&self) -> usize;

    /// Recomputes the header and rewinds the reader to the start.
    fn reset(&mut self);

    /// Discards the buffered bytes.
    fn clear(&mut self);
}

/// Tracer identity stamped into v1 payloads.
#[derive(Clone, Debug, Default)]
pub(crate) struct PayloadMeta {
    pub container_id: String,
    pub language_name: String,
    pub language_version: String,
    pub tracer_version: String,
    pub runtime_id: String,
    pub env: String,
    pub hostname: String,
    pub app_version: String,
    pub attributes: Vec<(String, String)>,
}

impl PayloadMeta {
    pub(crate) fn from_config(config: &Config) -> Self {
        let mut attributes: Vec<(String, String)> = config
            .global_tags
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        attributes.sort();
        PayloadMeta {
            container_id: config.container_id.clone(),
            language_name: "rust".to_string(),
            language_version: config.language_version.clone(),
            tracer_version: config.tracer_version.clone(),
            runtime_id: config.runtime_id.clone(),
            env: config.env.clone(),
            hostname: config.hostname.clone(),
            app_version: config.version.clone(),
            attributes,
        }
    }
}

/// Builds an empty payload for the selected protocol version.
pub(crate) fn new_payload(version: ApiVersion, meta: &PayloadMeta) -> Box<dyn Payload> {
    match version {
        ApiVersion::Version04 => Box::new(v04::PayloadV04::new()),
        ApiVersion::Version10 => Box::new(v1::PayloadV1::new(meta)),
    }
}
