use crate::core::packet::MIN_PACKET_SIZE;
use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

/// Hands each received datagram to the dispatcher as one frame.
///
/// Datagrams are not length-prefixed, so the whole read buffer is one packet.
/// Structural checks belong to the packet validator, which also keeps a
/// diagnostic record of every discard; this codec only drops runts that could
/// not even hold a common header.
#[derive(Debug, Default, Clone, Copy)]
pub struct GecoCodec;

impl GecoCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for GecoCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let frame = src.split().freeze();
        if frame.len() < MIN_PACKET_SIZE {
            trace!(len = frame.len(), "Dropping runt datagram");
            return Ok(None);
        }
        Ok(Some(frame))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_buffer_is_one_frame() {
        let mut codec = GecoCodec::new();
        let mut buf = BytesMut::from(&[0u8; 32][..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 32);
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_runt_is_consumed_and_dropped() {
        let mut codec = GecoCodec::new();
        let mut buf = BytesMut::from(&[1u8; 6][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }
}
