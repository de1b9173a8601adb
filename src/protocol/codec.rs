//! Packet framing and primitive SFTP wire encoding helpers.
//!
//! A full SFTP packet on the wire is `length:u32 | type:u8 | payload`, where
//! `length` counts everything after itself. `try_decode` extracts one
//! complete frame from a buffer that may hold a partial frame, multiple
//! frames, or both — CHANNEL_DATA boundaries do not align with SFTP packet
//! boundaries, so callers must keep feeding bytes into a persistent buffer
//! rather than assume one channel read equals one packet.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Encode a full SFTP packet: length prefix, message type byte, and body.
/// `body` must already contain the request id (if any) and the rest of the
/// payload.
pub fn encode_packet(message_type: u8, body: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(5 + body.len());
    out.put_u32((1 + body.len()) as u32);
    out.put_u8(message_type);
    out.extend_from_slice(body);
    out
}

/// Try to extract one complete, length-prefixed SFTP packet from the front
/// of `buf`. Returns `None` when fewer than a full frame is buffered so far
/// without consuming anything; on `Some`, the frame's bytes (length prefix
/// stripped) are returned and removed from `buf`.
pub fn try_decode(buf: &mut BytesMut) -> crate::Result<Option<Bytes>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len == 0 {
        return Err(crate::Error::Protocol("zero-length SFTP packet".into()));
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(len).freeze()))
}

/// Encode a string as an SFTP string: `length:u32 | utf8 bytes`.
pub fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Decode an SFTP string, advancing `buf` past the consumed bytes.
pub fn get_string(buf: &mut Bytes) -> crate::Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|e| crate::Error::Protocol(format!("invalid UTF-8 string: {e}")))
}

/// Encode an opaque byte string (used for handles and file data):
/// `length:u32 | bytes`.
pub fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Decode an opaque byte string, advancing `buf` past the consumed bytes.
pub fn get_bytes(buf: &mut Bytes) -> crate::Result<Bytes> {
    if buf.remaining() < 4 {
        return Err(crate::Error::Protocol("insufficient data for length prefix".into()));
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(crate::Error::Protocol("insufficient data for byte string".into()));
    }
    Ok(buf.split_to(len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_frame_yields_none_without_consuming() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]); // far short of 10 bytes of body
        let before = buf.len();
        assert!(try_decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), before);
    }

    #[test]
    fn two_packets_back_to_back_decode_one_at_a_time() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_packet(1, b"aa"));
        buf.extend_from_slice(&encode_packet(2, b"bbb"));

        let first = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(&first[..], &[1, b'a', b'a']);

        let second = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(&second[..], &[2, b'b', b'b', b'b']);

        assert!(try_decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn packet_split_across_two_feeds_decodes_once_complete() {
        let full = encode_packet(6, b"write-payload");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..full.len() - 3]);
        assert!(try_decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[full.len() - 3..]);
        let decoded = try_decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[1..], b"write-payload");
    }

    #[test]
    fn string_round_trips() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "/tmp/example");
        let mut frozen = buf.freeze();
        assert_eq!(get_string(&mut frozen).unwrap(), "/tmp/example");
    }
}
