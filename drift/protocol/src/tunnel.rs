//! Framing for the bytes piped through the forwarder's duplex stream
//! (spec §4.7, §6 "Tunnel"). The manager-side transport is the `Tunnel`
//! gRPC stream (see [`crate::pb`]); this module only defines the local
//! length-delimited encoding used to hand a connection's bytes to/from that
//! stream, analogous to the teacher's own choice of `bincode` for its wire
//! messages instead of reusing protobuf framing for raw payloads.

use bincode::{Decode, Encode};
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ProtocolError;

#[derive(Encode, Decode, Debug, Clone, PartialEq, Eq)]
pub struct TunnelFrame {
    pub connection_id: u64,
    pub payload: Vec<u8>,
    pub close: bool,
}

impl TunnelFrame {
    pub fn data(connection_id: u64, payload: Vec<u8>) -> Self {
        Self {
            connection_id,
            payload,
            close: false,
        }
    }

    pub fn close(connection_id: u64) -> Self {
        Self {
            connection_id,
            payload: Vec::new(),
            close: true,
        }
    }
}

/// Length-prefixed bincode codec: a 4-byte big-endian length followed by the
/// bincode-encoded [`TunnelFrame`].
#[derive(Default)]
pub struct TunnelCodec;

const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
const CONFIG: bincode::config::Configuration = bincode::config::standard();

impl Encoder<TunnelFrame> for TunnelCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: TunnelFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = bincode::encode_to_vec(&item, CONFIG)?;
        dst.reserve(4 + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for TunnelCodec {
    type Item = TunnelFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes(src[..4].try_into().expect("checked above")) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::Decode(bincode::error::DecodeError::Other(
                "tunnel frame exceeds maximum size",
            )));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(len);
        let (frame, _) = bincode::decode_from_slice(&body, CONFIG)?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_the_codec() {
        let mut codec = TunnelCodec;
        let mut buf = BytesMut::new();

        let frame = TunnelFrame::data(7, b"hello".to_vec());
        codec.encode(frame.clone(), &mut buf).unwrap();

        // Simulate a split read: only part of the frame is available yet.
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(partial.is_empty());
    }

    #[test]
    fn close_frame_carries_no_payload() {
        let frame = TunnelFrame::close(3);
        assert!(frame.payload.is_empty());
        assert!(frame.close);
    }
}
