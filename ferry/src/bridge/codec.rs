//! Framed codec for context channels.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (pipes, sockets, in-memory duplex).
//!
//! A frame whose payload fails to deserialize is still consumed whole, and is
//! yielded as `Ok(Some(Err(_)))` so the stream stays aligned and usable for the
//! next frame. Only framing faults (oversized length prefix, I/O) end the stream.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{0}")]
    Io(#[from] io::Error),
    /// The length prefix is invalid (e.g. exceeds the configured maximum).
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("failed to encode frame payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Codec that frames messages with a 4-byte length prefix and serializes with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(max)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, serde_json::Error>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let frame = self.inner.decode(src).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                CodecError::Malformed(e.to_string())
            } else {
                CodecError::Io(e)
            }
        })?;

        Ok(frame.map(|bytes| serde_json::from_slice(&bytes)))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // Serialize fully before touching `dst` so a failure leaves no partial frame.
        let json = serde_json::to_vec(&item).map_err(CodecError::Encode)?;
        let json_len = json.len();
        tracing::trace!(json_size_bytes = json_len, "Encoding frame");
        if json_len > LARGE_FRAME_BYTES {
            tracing::debug!(
                json_size_bytes = json_len,
                json_size_kb = json_len / 1024,
                "Large frame being encoded"
            );
        }
        self.inner
            .encode(Bytes::from(json), dst)
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Frame, JobId, JobPacket};
    use serde::Serializer;

    #[test]
    fn codec_roundtrip_job_packet() {
        let mut codec = JsonCodec::<JobPacket>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(JobPacket::Cancel { job_id: JobId(3) }, &mut buf)
            .unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();

        assert!(matches!(decoded, JobPacket::Cancel { job_id: JobId(3) }));
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = JsonCodec::<Frame>::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::data(serde_json::json!({"x": [1, 2, 3]})), &mut buf)
            .unwrap();

        let mut head = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut head).unwrap().is_none());

        head.unsplit(buf);
        let frame = codec.decode(&mut head).unwrap().unwrap().unwrap();
        assert!(matches!(frame, Frame::Data { .. }));
    }

    #[test]
    fn undecodable_payload_consumes_one_frame_only() {
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"{not json"), &mut buf).unwrap();

        let mut codec = JsonCodec::<Frame>::new();
        codec
            .encode(Frame::data(serde_json::json!("after")), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert!(first.is_err());

        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        match second {
            Frame::Data { value } => assert_eq!(value, serde_json::json!("after")),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn oversized_length_prefix_is_malformed() {
        let mut codec = JsonCodec::<Frame>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1024u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("live handles cannot be serialized"))
        }
    }

    #[test]
    fn encode_failure_writes_nothing() {
        let mut codec = JsonCodec::<Unserializable>::new();
        let mut buf = BytesMut::new();

        let err = codec.encode(Unserializable, &mut buf).unwrap_err();
        assert!(matches!(err, CodecError::Encode(_)));
        assert!(buf.is_empty());
    }
}
