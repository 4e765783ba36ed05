//! Codec module - framing of `(Header, Body)` pairs on a byte stream.
//!
//! A codec owns one full-duplex stream and splits it into a read half
//! and a write half so that a connection's reader loop and its
//! response writers can run concurrently. Frame pairs are never
//! interleaved: callers serialize [`CodecWriter::write`] behind a send
//! mutex, and a single `write` call emits exactly one header frame
//! followed by exactly one body frame.
//!
//! Codecs are pluggable by short name through a global table; the
//! default is the MessagePack codec ([`MSGPACK_CODEC`]).

mod msgpack;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

pub use msgpack::{new_msgpack_codec, MsgPack, MsgpackCodecReader, MsgpackCodecWriter};

/// Short name of the default MessagePack codec.
pub const MSGPACK_CODEC: &str = "application/msgpack";

/// Maximum accepted frame length (1 GB).
pub const MAX_FRAME_LEN: usize = 1_073_741_824;

/// Per-message envelope, framed by the codec on both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Dispatch target of form `"<Service>.<Method>"`.
    #[serde(rename = "ServiceMethod")]
    pub service_method: String,

    /// Client-assigned sequence id, monotonically increasing per
    /// connection starting at 1. 0 is reserved and never assigned.
    #[serde(rename = "SeqId")]
    pub seq: u64,

    /// Empty on success; otherwise the server-side error message for
    /// this sequence id.
    #[serde(rename = "Error")]
    pub error: String,
}

/// Anything a codec can be built over.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed byte stream handed to codec constructors.
pub type IoStream = Box<dyn Connection>;

/// Inbound half of a codec.
#[async_trait]
pub trait CodecReader: Send {
    /// Decode the next header. Fails with [`WirecallError::Eof`] at
    /// stream end and a decode error on malformed input.
    ///
    /// [`WirecallError::Eof`]: crate::error::WirecallError::Eof
    async fn read_header(&mut self) -> Result<Header>;

    /// Read the next body frame as raw payload bytes. Discarding a
    /// body is reading it and dropping the result.
    async fn read_body(&mut self) -> Result<Bytes>;
}

/// Outbound half of a codec.
#[async_trait]
pub trait CodecWriter: Send {
    /// Encode one header frame followed by one body frame and flush.
    /// On error the codec shuts the stream down; the stream is assumed
    /// irrecoverable.
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()>;

    /// Flush and shut the stream down.
    async fn close(&mut self) -> Result<()>;
}

/// Constructor signature stored in the codec table.
pub type NewCodecFn = fn(IoStream) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>);

static CODECS: Lazy<HashMap<&'static str, NewCodecFn>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, NewCodecFn> = HashMap::new();
    table.insert(MSGPACK_CODEC, new_msgpack_codec);
    table
});

/// Look up a codec constructor by its short name.
pub fn lookup(name: &str) -> Option<NewCodecFn> {
    CODECS.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_default_codec() {
        assert!(lookup(MSGPACK_CODEC).is_some());
    }

    #[test]
    fn test_lookup_unknown_codec() {
        assert!(lookup("application/bogus").is_none());
    }

    #[test]
    fn test_header_default_is_invalid_seq() {
        let h = Header::default();
        assert_eq!(h.seq, 0);
        assert!(h.service_method.is_empty());
        assert!(h.error.is_empty());
    }
}
