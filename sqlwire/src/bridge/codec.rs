//! Length-prefixed JSON framing for every sqlwire link.
//!
//! Frames are a 4-byte big-endian length followed by a serde_json document.
//! The same codec runs over worker stdin/stdout and over session sockets.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound for a single frame. Query results are the only large payloads.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const LARGE_FRAME_LEN: usize = 1024 * 1024;

/// Codec that frames `T` with a length prefix and serializes it as JSON.
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
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max: usize) -> Self {
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
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        // Never shipped to the coordinator: WorkerTracingLayer drops this target,
        // otherwise encoding a Log event would produce another Log event.
        tracing::trace!(frame_bytes = json.len(), "Encoding frame");
        if json.len() > LARGE_FRAME_LEN {
            tracing::debug!(frame_kb = json.len() / 1024, "Large frame being encoded");
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{
        PushFrame, ReplyFrame, RequestFrame, RequestId, SessionId, WorkerControl, WorkerFrame,
    };

    #[test]
    fn decodes_control_frame() {
        let mut codec = JsonCodec::<WorkerControl>::new();
        let mut buf = BytesMut::new();

        let session_id = SessionId::new();
        codec
            .encode(WorkerControl::Close { session_id }, &mut buf)
            .unwrap();

        match codec.decode(&mut buf).unwrap().unwrap() {
            WorkerControl::Close { session_id: decoded } => assert_eq!(decoded, session_id),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut encoder = JsonCodec::<RequestFrame>::new();
        let mut full = BytesMut::new();
        encoder
            .encode(
                RequestFrame {
                    id: RequestId::new(),
                    name: "listTables".to_string(),
                    args: serde_json::json!({}),
                },
                &mut full,
            )
            .unwrap();

        let mut decoder = JsonCodec::<RequestFrame>::new();
        let mut partial = full.split_to(full.len() - 3);
        assert!(decoder.decode(&mut partial).unwrap().is_none());

        partial.unsplit(full);
        let frame = decoder.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.name, "listTables");
    }

    #[test]
    fn reply_and_push_share_one_stream() {
        let mut writer = JsonCodec::<WorkerFrame>::new();
        let mut buf = BytesMut::new();
        let id = RequestId::new();

        writer
            .encode(
                WorkerFrame::Push(PushFrame {
                    event: "notice".to_string(),
                    input: serde_json::json!("vacuum done"),
                }),
                &mut buf,
            )
            .unwrap();
        writer
            .encode(ReplyFrame::reply(id, serde_json::json!(1)).into(), &mut buf)
            .unwrap();

        let mut reader = JsonCodec::<WorkerFrame>::new();
        assert!(matches!(
            reader.decode(&mut buf).unwrap(),
            Some(WorkerFrame::Push(_))
        ));
        match reader.decode(&mut buf).unwrap() {
            Some(WorkerFrame::Reply(reply)) => assert_eq!(reply.id(), id),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_is_invalid_data() {
        let mut raw = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .new_codec();
        let mut buf = BytesMut::new();
        raw.encode(Bytes::from_static(b"{not json"), &mut buf).unwrap();

        let mut codec = JsonCodec::<RequestFrame>::new();
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<serde_json::Value>::with_max_frame_len(16);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(serde_json::json!({"payload": "x".repeat(64)}), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
