//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format (all integers big-endian):
//! ```text
//! +--------+--------+--------+--------+
//! |      Endpoint IPv4 address (4B)   |
//! +--------+--------+--------+--------+
//! |  Endpoint port (2B)  | Kind (1B)  |
//! +--------+--------+--------+--------+
//! |  Payload length (2B) |  Payload   |
//! +--------+--------+--------+--------+
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::TunnelError;
use crate::wire::{self, Endpoint};
use crate::MAX_PAYLOAD_SIZE;

/// Frame header size in bytes: address (4) + port (2) + kind (1) + length (2)
pub const FRAME_HEADER_SIZE: usize = 9;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// A new real-client connection was accepted by the forwarder
    Syn = 0x00,
    /// Payload chunk for an existing connection
    Psh = 0x01,
    /// The connection has ended
    Fin = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameKind::Syn),
            0x01 => Ok(FrameKind::Psh),
            0x02 => Ok(FrameKind::Fin),
            other => Err(TunnelError::UnknownFrameKind(other)),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Endpoint this frame belongs to
    pub endpoint: Endpoint,
    /// Frame kind
    pub kind: FrameKind,
    /// Payload data (empty for SYN/FIN)
    pub payload: Bytes,
}

impl Frame {
    /// Create a SYN frame announcing a new connection
    pub fn syn(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            kind: FrameKind::Syn,
            payload: Bytes::new(),
        }
    }

    /// Create a PSH frame carrying a payload chunk
    pub fn psh(endpoint: Endpoint, payload: Bytes) -> Self {
        Self {
            endpoint,
            kind: FrameKind::Psh,
            payload,
        }
    }

    /// Create a FIN frame announcing the end of a connection
    pub fn fin(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            kind: FrameKind::Fin,
            payload: Bytes::new(),
        }
    }

    /// Encode this frame to its wire representation.
    ///
    /// Fails with [`TunnelError::PayloadTooLarge`] when the payload does not
    /// fit the 16-bit length field; callers must chunk larger data first.
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::PayloadTooLarge(self.payload.len()));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&wire::encode_u32(self.endpoint.addr));
        buf.extend_from_slice(&wire::encode_u16(self.endpoint.port));
        buf.extend_from_slice(&[self.kind as u8]);
        buf.extend_from_slice(&wire::encode_u16(self.payload.len() as u16));
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode one frame from the front of `buf`, consuming exactly the bytes
    /// it occupies.
    ///
    /// Returns `Ok(None)` when fewer than a full frame is buffered; the
    /// caller retains `buf` and retries after the next read. Multiple
    /// coalesced frames drain via repeated calls.
    ///
    /// An unrecognized kind byte yields [`TunnelError::UnknownFrameKind`]
    /// after consuming the whole frame (the length field is still trusted),
    /// so reassembly resumes at the next frame boundary.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let Some(payload_len) = wire::decode_u16(buf, 7) else {
            return Ok(None);
        };
        let payload_len = payload_len as usize;

        let total_len = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < total_len {
            return Ok(None);
        }

        let (Some(addr), Some(port)) = (wire::decode_u32(buf, 0), wire::decode_u16(buf, 4))
        else {
            return Ok(None);
        };

        let kind = match FrameKind::try_from(buf[6]) {
            Ok(kind) => kind,
            Err(e) => {
                buf.advance(total_len);
                return Err(e);
            }
        };

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            endpoint: Endpoint::new(addr, port),
            kind,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame::psh(
            Endpoint::from_text("192.168.1.10", 4444).unwrap(),
            Bytes::from_static(b"ABCD"),
        )
    }

    #[test]
    fn test_known_wire_representation() {
        let encoded = sample_frame().encode().unwrap();
        assert_eq!(
            &encoded[..],
            &[0xc0, 0xa8, 0x01, 0x0a, 0x11, 0x5c, 0x01, 0x00, 0x04, 0x41, 0x42, 0x43, 0x44]
        );
    }

    #[test]
    fn test_roundtrip() {
        let original = sample_frame();
        let mut buf = original.encode().unwrap();

        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
        assert!(buf.is_empty()); // consumed exactly 13 bytes
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        for frame in [
            Frame::syn(Endpoint::new(0x0a000001, 1000)),
            Frame::fin(Endpoint::new(0x0a000002, 2000)),
        ] {
            let mut buf = frame.encode().unwrap();
            assert_eq!(buf.len(), FRAME_HEADER_SIZE);
            let decoded = Frame::decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_partial_buffer_is_incomplete() {
        let encoded = sample_frame().encode().unwrap();
        for k in 0..encoded.len() {
            let mut partial = BytesMut::from(&encoded[..k]);
            assert!(
                Frame::decode(&mut partial).unwrap().is_none(),
                "prefix of {} bytes parsed as a frame",
                k
            );
            // nothing consumed while incomplete
            assert_eq!(partial.len(), k);
        }
    }

    #[test]
    fn test_coalesced_frames() {
        let first = sample_frame();
        let second = Frame::fin(Endpoint::from_text("10.0.0.2", 2000).unwrap());

        let mut buf = first.encode().unwrap();
        buf.extend_from_slice(&second.encode().unwrap());

        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), second);
        assert!(Frame::decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_split_frame_reassembles() {
        let frame = sample_frame();
        let encoded = frame.encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..6]);
        assert!(Frame::decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[6..]);
        assert_eq!(Frame::decode(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_unknown_kind_consumes_frame() {
        let mut encoded = sample_frame().encode().unwrap();
        encoded[6] = 0x7f;
        let next = Frame::syn(Endpoint::new(1, 1));
        encoded.extend_from_slice(&next.encode().unwrap());

        match Frame::decode(&mut encoded) {
            Err(TunnelError::UnknownFrameKind(0x7f)) => {}
            other => panic!("expected UnknownFrameKind, got {:?}", other),
        }
        // reassembly continues at the next frame boundary
        assert_eq!(Frame::decode(&mut encoded).unwrap().unwrap(), next);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let frame = Frame::psh(
            Endpoint::new(1, 1),
            Bytes::from(vec![0u8; MAX_PAYLOAD_SIZE + 1]),
        );
        assert!(matches!(
            frame.encode(),
            Err(TunnelError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_max_payload_accepted() {
        let frame = Frame::psh(Endpoint::new(1, 1), Bytes::from(vec![0xaa; MAX_PAYLOAD_SIZE]));
        let mut buf = frame.encode().unwrap();
        assert_eq!(buf.len(), FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload.len(), MAX_PAYLOAD_SIZE);
    }
}
