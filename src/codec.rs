//! Framing primitives for the game server status protocol.
//!
//! Every packet on the wire is `VarInt(length) || VarInt(packet id) || body`,
//! where `length` covers the packet id and the body. VarInts are little-endian
//! groups of 7 bits with the high bit of each byte flagging a continuation,
//! at most 5 bytes for a 32-bit value. Nothing in here touches the network.

use thiserror::Error;

/// Longest legal VarInt encoding of an `i32`.
pub const MAX_VARINT_LEN: usize = 5;

/// Largest frame accepted from a peer (the 3-byte VarInt limit used by servers).
pub const MAX_FRAME_LEN: usize = 2_097_151;

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const STATUS_REQUEST_PACKET_ID: i32 = 0x00;
pub const STATUS_RESPONSE_PACKET_ID: i32 = 0x00;

/// `next state` value of a handshake that asks for the status exchange.
pub const NEXT_STATE_STATUS: i32 = 1;

/// Malformed, truncated or unsupported data received from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("varint longer than {MAX_VARINT_LEN} bytes")]
    VarIntTooLong,
    #[error("unexpected end of data")]
    Truncated,
    #[error("negative length prefix {0}")]
    NegativeLength(i32),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(usize),
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacketId(i32),
    #[error("string field is not valid utf-8")]
    InvalidUtf8,
    #[error("invalid status document: {0}")]
    InvalidStatus(String),
}

/// Append the VarInt encoding of `value` to `out`.
///
/// Negative values are encoded through their two's complement bit pattern and
/// therefore always take the full five bytes.
pub fn encode_varint(value: i32, out: &mut Vec<u8>) {
    let mut v = value as u32;
    loop {
        if v & !0x7f == 0 {
            out.push(v as u8);
            return;
        }
        out.push((v & 0x7f) as u8 | 0x80);
        v >>= 7;
    }
}

/// Number of bytes `encode_varint` produces for `value`.
pub fn varint_len(value: i32) -> usize {
    let v = value as u32;
    match v {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0x0fff_ffff => 4,
        _ => 5,
    }
}

/// Decode a VarInt from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode_varint(buf: &[u8]) -> Result<(i32, usize), ProtocolError> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().take(MAX_VARINT_LEN).enumerate() {
        value |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value as i32, i + 1));
        }
    }
    if buf.len() >= MAX_VARINT_LEN {
        Err(ProtocolError::VarIntTooLong)
    } else {
        Err(ProtocolError::Truncated)
    }
}

/// Append a length-prefixed UTF-8 string.
pub fn encode_string(s: &str, out: &mut Vec<u8>) {
    encode_varint(s.len() as i32, out);
    out.extend_from_slice(s.as_bytes());
}

/// Decode a length-prefixed UTF-8 string from the front of `buf`.
pub fn decode_string(buf: &[u8]) -> Result<(String, usize), ProtocolError> {
    let (len, used) = decode_varint(buf)?;
    let len = checked_len(len)?;
    let end = used + len;
    let bytes = buf.get(used..end).ok_or(ProtocolError::Truncated)?;
    let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok((s.to_owned(), end))
}

/// Validate a decoded length prefix against the frame limit.
pub fn checked_len(len: i32) -> Result<usize, ProtocolError> {
    if len < 0 {
        return Err(ProtocolError::NegativeLength(len));
    }
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Wrap a packet id and body into a length-prefixed frame.
pub fn frame(packet_id: i32, body: &[u8]) -> Vec<u8> {
    let inner = varint_len(packet_id) + body.len();
    let mut out = Vec::with_capacity(varint_len(inner as i32) + inner);
    encode_varint(inner as i32, &mut out);
    encode_varint(packet_id, &mut out);
    out.extend_from_slice(body);
    out
}

/// Split one complete frame off the front of `buf`.
///
/// Returns the packet id, the packet body and the total number of bytes the
/// frame occupied (prefix included).
pub fn split_frame(buf: &[u8]) -> Result<(i32, &[u8], usize), ProtocolError> {
    let (len, prefix) = decode_varint(buf)?;
    let len = checked_len(len)?;
    let payload = buf
        .get(prefix..prefix + len)
        .ok_or(ProtocolError::Truncated)?;
    let (packet_id, id_len) = decode_varint(payload)?;
    Ok((packet_id, &payload[id_len..], prefix + len))
}

/// Handshake packet announcing the status exchange.
pub fn handshake_packet(protocol_version: i32, host: &str, port: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(host.len() + 16);
    encode_varint(protocol_version, &mut body);
    encode_string(host, &mut body);
    body.extend_from_slice(&port.to_be_bytes());
    encode_varint(NEXT_STATE_STATUS, &mut body);
    frame(HANDSHAKE_PACKET_ID, &body)
}

/// The empty status request packet.
pub fn status_request_packet() -> Vec<u8> {
    frame(STATUS_REQUEST_PACKET_ID, &[])
}

/// Frame a status response carrying `json`, as a server would send it.
pub fn status_response_packet(json: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(json.len() + MAX_VARINT_LEN);
    encode_string(json, &mut body);
    frame(STATUS_RESPONSE_PACKET_ID, &body)
}

/// Extract the JSON document from the payload of a status response frame.
///
/// `payload` is everything after the frame length prefix: packet id and body.
pub fn decode_status_payload(payload: &[u8]) -> Result<String, ProtocolError> {
    let (packet_id, id_len) = decode_varint(payload)?;
    if packet_id != STATUS_RESPONSE_PACKET_ID {
        return Err(ProtocolError::UnexpectedPacketId(packet_id));
    }
    let (json, _) = decode_string(&payload[id_len..])?;
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(v: i32) -> Vec<u8> {
        let mut out = Vec::new();
        encode_varint(v, &mut out);
        out
    }

    #[test]
    fn varint_known_vectors() {
        let cases: &[(i32, &[u8])] = &[
            (0, &[0x00]),
            (1, &[0x01]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (255, &[0xff, 0x01]),
            (25565, &[0xdd, 0xc7, 0x01]),
            (2_097_151, &[0xff, 0xff, 0x7f]),
            (i32::MAX, &[0xff, 0xff, 0xff, 0xff, 0x07]),
            (-1, &[0xff, 0xff, 0xff, 0xff, 0x0f]),
            (i32::MIN, &[0x80, 0x80, 0x80, 0x80, 0x08]),
        ];
        for &(value, bytes) in cases {
            assert_eq!(enc(value), bytes, "encoding {value}");
            assert_eq!(varint_len(value), bytes.len(), "length of {value}");
            assert_eq!(decode_varint(bytes).unwrap(), (value, bytes.len()));
        }
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        assert_eq!(decode_varint(&[0xac, 0x02, 0xff, 0xff]).unwrap(), (300, 2));
    }

    #[test]
    fn decode_rejects_overlong_varint() {
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert_eq!(decode_varint(&bytes), Err(ProtocolError::VarIntTooLong));
    }

    #[test]
    fn decode_reports_truncation() {
        assert_eq!(decode_varint(&[]), Err(ProtocolError::Truncated));
        assert_eq!(decode_varint(&[0x80, 0x80]), Err(ProtocolError::Truncated));
    }

    #[test]
    fn handshake_layout() {
        let pkt = handshake_packet(47, "a.b", 25565);
        let (id, body, used) = split_frame(&pkt).unwrap();
        assert_eq!(used, pkt.len());
        assert_eq!(id, HANDSHAKE_PACKET_ID);

        let (version, n) = decode_varint(body).unwrap();
        assert_eq!(version, 47);
        let (host, m) = decode_string(&body[n..]).unwrap();
        assert_eq!(host, "a.b");
        let rest = &body[n + m..];
        assert_eq!(u16::from_be_bytes([rest[0], rest[1]]), 25565);
        assert_eq!(&rest[2..], &[NEXT_STATE_STATUS as u8]);
    }

    #[test]
    fn status_request_is_two_bytes() {
        assert_eq!(status_request_packet(), vec![0x01, 0x00]);
    }

    #[test]
    fn status_response_with_multibyte_prefix() {
        // Long enough that both the frame and the string prefix need 2+ bytes.
        let json = format!("{{\"description\":\"{}\"}}", "x".repeat(20_000));
        let pkt = status_response_packet(&json);
        let (len, prefix) = decode_varint(&pkt).unwrap();
        assert_eq!(prefix, 3);
        assert_eq!(len as usize + prefix, pkt.len());
        assert_eq!(decode_status_payload(&pkt[prefix..]).unwrap(), json);
    }

    #[test]
    fn status_payload_rejects_wrong_packet_id() {
        let pkt = frame(0x01, &[0x00]);
        assert_eq!(
            decode_status_payload(&pkt[1..]),
            Err(ProtocolError::UnexpectedPacketId(0x01))
        );
    }

    #[test]
    fn string_longer_than_buffer_is_truncated() {
        let mut buf = Vec::new();
        encode_varint(10, &mut buf);
        buf.extend_from_slice(b"abc");
        assert_eq!(decode_string(&buf), Err(ProtocolError::Truncated));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let buf = [0x02, 0xc3, 0x28];
        assert_eq!(decode_string(&buf), Err(ProtocolError::InvalidUtf8));
    }

    #[test]
    fn length_limits() {
        assert_eq!(checked_len(-3), Err(ProtocolError::NegativeLength(-3)));
        assert_eq!(
            checked_len(MAX_FRAME_LEN as i32 + 1),
            Err(ProtocolError::FrameTooLarge(MAX_FRAME_LEN + 1))
        );
        assert_eq!(checked_len(5).unwrap(), 5);
    }
}
