//! Framing: length-prefix (4 bytes LE) + bincode payload.

use crate::protocol::Packet;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a packet into a single frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(packet).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    let len = payload.len() as u32;
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Error encoding a packet into a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Read the payload length from a frame header. Errors if the header is incomplete or over the limit.
pub fn frame_len(header: &[u8]) -> Result<usize, FrameDecodeError> {
    if header.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Decode one frame from the front of `bytes`. Returns the packet and the number of bytes consumed.
/// Call with partial buffer; returns error if not enough bytes (caller should try again after more data).
pub fn decode_frame(bytes: &[u8]) -> Result<(Packet, usize), FrameDecodeError> {
    let len = frame_len(bytes)?;
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    let packet = decode_payload(&bytes[LEN_SIZE..LEN_SIZE + len])?;
    Ok((packet, LEN_SIZE + len))
}

/// Decode a frame body whose length prefix has already been consumed.
pub fn decode_payload(payload: &[u8]) -> Result<Packet, FrameDecodeError> {
    bincode::deserialize(payload).map_err(FrameDecodeError::Decode)
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity;
    use crate::name::Name;
    use crate::protocol::{Reply, ResourceMeta, Response};

    fn sample_response() -> Packet {
        let payload = b"segment bytes".to_vec();
        Packet::Response {
            handle: 7,
            response: Response {
                name: Name::from("/test/file/v=3/seg=0"),
                final_segment: 4,
                meta: Some(ResourceMeta {
                    total_size: 20_000,
                    version: Some(3),
                }),
                reply: Reply::Data {
                    digest: integrity::digest(&payload),
                    payload,
                },
            },
        }
    }

    #[test]
    fn roundtrip_response() {
        let packet = sample_response();
        let frame = encode_frame(&packet).unwrap();
        let (decoded, n) = decode_frame(&frame).unwrap();
        assert_eq!(n, frame.len());
        assert_eq!(decoded, packet);
    }

    #[test]
    fn partial_read_need_more() {
        let frame = encode_frame(&sample_response()).unwrap();
        assert!(matches!(
            decode_frame(&frame[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&frame[..frame.len() - 1]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_header_rejected() {
        let header = (MAX_FRAME_LEN + 1).to_le_bytes();
        assert!(matches!(frame_len(&header), Err(FrameDecodeError::TooLarge)));
    }

    #[test]
    fn multiple_packets() {
        let a = Packet::Request {
            handle: 1,
            name: Name::from("/test/file"),
        };
        let b = sample_response();
        let fa = encode_frame(&a).unwrap();
        let fb = encode_frame(&b).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&fa);
        buf.extend_from_slice(&fb);
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!(n1, fa.len());
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(n2, fb.len());
        assert!(matches!(m1, Packet::Request { handle: 1, .. }));
        assert!(matches!(m2, Packet::Response { handle: 7, .. }));
    }
}
