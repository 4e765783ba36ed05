//! MessagePack codec using `rmp-serde`.
//!
//! Wire format: every frame is a u32 big-endian length prefix followed
//! by that many bytes. The header frame carries the [`Header`] as a
//! named MessagePack map (`to_vec_named`, struct-as-map, so the frame
//! is self-describing); the body frame carries the payload bytes
//! verbatim. One `write` call buffers header and body and flushes
//! once.
//!
//! [`MsgPack`] holds the payload encode/decode helpers used by the
//! typed layers on both sides of a connection.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{
    AsyncReadExt, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};

use super::{CodecReader, CodecWriter, Header, IoStream, MAX_FRAME_LEN};
use crate::error::{Result, WirecallError};

/// MessagePack payload codec for argument and reply values.
///
/// Uses `rmp_serde::to_vec_named` so structs are serialized as maps
/// (with field names) rather than positional arrays.
pub struct MsgPack;

impl MsgPack {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Split a stream into the MessagePack codec halves.
pub fn new_msgpack_codec(stream: IoStream) -> (Box<dyn CodecReader>, Box<dyn CodecWriter>) {
    let (reader, writer) = tokio::io::split(stream);
    (
        Box::new(MsgpackCodecReader {
            reader: BufReader::new(reader),
        }),
        Box::new(MsgpackCodecWriter {
            writer: BufWriter::new(writer),
        }),
    )
}

/// Inbound half of the MessagePack codec.
pub struct MsgpackCodecReader {
    reader: BufReader<ReadHalf<IoStream>>,
}

impl MsgpackCodecReader {
    async fn read_frame(&mut self) -> Result<Bytes> {
        let len = self.reader.read_u32().await.map_err(map_eof)? as usize;
        if len > MAX_FRAME_LEN {
            return Err(WirecallError::Protocol(format!(
                "frame length {} exceeds maximum {}",
                len, MAX_FRAME_LEN
            )));
        }
        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await.map_err(map_eof)?;
        Ok(Bytes::from(buf))
    }
}

#[async_trait]
impl CodecReader for MsgpackCodecReader {
    async fn read_header(&mut self) -> Result<Header> {
        let frame = self.read_frame().await?;
        Ok(rmp_serde::from_slice(&frame)?)
    }

    async fn read_body(&mut self) -> Result<Bytes> {
        self.read_frame().await
    }
}

/// Outbound half of the MessagePack codec.
pub struct MsgpackCodecWriter {
    writer: BufWriter<WriteHalf<IoStream>>,
}

impl MsgpackCodecWriter {
    async fn write_inner(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header_bytes = rmp_serde::to_vec_named(header)?;
        self.writer.write_u32(header_bytes.len() as u32).await?;
        self.writer.write_all(&header_bytes).await?;
        self.writer.write_u32(body.len() as u32).await?;
        self.writer.write_all(body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl CodecWriter for MsgpackCodecWriter {
    async fn write(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let res = self.write_inner(header, body).await;
        if res.is_err() {
            let _ = self.writer.shutdown().await;
        }
        res
    }

    async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Both clean EOF and a stream truncated mid-frame end the read loop.
fn map_eof(err: std::io::Error) -> WirecallError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        WirecallError::Eof
    } else {
        WirecallError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    fn codec_pair(
        buffer: usize,
    ) -> (
        Box<dyn CodecReader>,
        Box<dyn CodecWriter>,
        Box<dyn CodecReader>,
        Box<dyn CodecWriter>,
    ) {
        let (a, b) = tokio::io::duplex(buffer);
        let (ar, aw) = new_msgpack_codec(Box::new(a));
        let (br, bw) = new_msgpack_codec(Box::new(b));
        (ar, aw, br, bw)
    }

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        id: u32,
        name: String,
    }

    #[test]
    fn test_msgpack_roundtrip_struct() {
        let value = Payload {
            id: 7,
            name: "seven".to_string(),
        };
        let encoded = MsgPack::encode(&value).unwrap();
        let decoded: Payload = MsgPack::decode(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_msgpack_named_map_format() {
        let value = Payload {
            id: 1,
            name: "x".to_string(),
        };
        let encoded = MsgPack::encode(&value).unwrap();
        // struct-as-map: fixmap marker, not fixarray
        assert_eq!(encoded[0] & 0xF0, 0x80);
    }

    #[test]
    fn test_msgpack_decode_invalid() {
        let result: Result<Payload> = MsgPack::decode(b"not msgpack at all");
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_write_then_read_pair() {
        let (_ar, mut aw, mut br, _bw) = codec_pair(4096);

        let header = Header {
            service_method: "Echo.Say".to_string(),
            seq: 3,
            error: String::new(),
        };
        let body = MsgPack::encode(&"hello").unwrap();
        aw.write(&header, &body).await.unwrap();

        let got = br.read_header().await.unwrap();
        assert_eq!(got, header);
        let got_body = br.read_body().await.unwrap();
        let text: String = MsgPack::decode(&got_body).unwrap();
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn test_empty_body_frame() {
        let (_ar, mut aw, mut br, _bw) = codec_pair(4096);

        let header = Header {
            service_method: "Echo.Say".to_string(),
            seq: 9,
            error: "boom".to_string(),
        };
        aw.write(&header, &[]).await.unwrap();

        let got = br.read_header().await.unwrap();
        assert_eq!(got.error, "boom");
        let body = br.read_body().await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_read_header_eof_on_closed_stream() {
        let (_ar, aw, mut br, _bw) = codec_pair(4096);
        drop(aw);
        drop(_ar);

        let err = br.read_header().await.unwrap_err();
        assert!(matches!(err, WirecallError::Eof));
    }

    #[tokio::test]
    async fn test_frames_survive_fragmented_transport() {
        // A tiny duplex buffer forces the writer to hand the bytes
        // over in many small chunks.
        let (_ar, mut aw, mut br, _bw) = codec_pair(16);

        let header = Header {
            service_method: "Blob.Take".to_string(),
            seq: 1,
            error: String::new(),
        };
        let body: Vec<u8> = (0..1024u32).map(|i| (i % 251) as u8).collect();

        let write = tokio::spawn(async move {
            aw.write(&header, &body).await.unwrap();
            aw
        });

        let got = br.read_header().await.unwrap();
        assert_eq!(got.seq, 1);
        let got_body = br.read_body().await.unwrap();
        assert_eq!(got_body.len(), 1024);
        assert_eq!(got_body[250], 250u8);

        write.await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_pairs_stay_aligned() {
        let (_ar, mut aw, mut br, _bw) = codec_pair(4096);

        for seq in 1..=5u64 {
            let header = Header {
                service_method: "Count.Up".to_string(),
                seq,
                error: String::new(),
            };
            let body = MsgPack::encode(&seq).unwrap();
            aw.write(&header, &body).await.unwrap();
        }

        for seq in 1..=5u64 {
            let header = br.read_header().await.unwrap();
            assert_eq!(header.seq, seq);
            let body = br.read_body().await.unwrap();
            let value: u64 = MsgPack::decode(&body).unwrap();
            assert_eq!(value, seq);
        }
    }
}
