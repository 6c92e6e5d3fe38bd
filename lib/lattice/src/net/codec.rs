//! Frame headers and their wire form. All multi-byte fields travel
//! big-endian; the host-resident structs are native. Decoding tolerates
//! arbitrary read fragmentation: a frame is only surfaced once the header
//! and the full payload are buffered.

use crate::net::buffer::Buffer;
use byteorder::{BigEndian, ByteOrder};

pub const REQUEST_HEADER_LEN: usize = 24;
pub const RESPONSE_HEADER_LEN: usize = 32;

/// Fixed request frame header: kind, request id, issuer timestamp, payload
/// length (header excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: u32,
    pub request_id: u64,
    pub start_time: u64,
    pub payload_len: u32,
}

impl RequestHeader {
    #[inline]
    pub fn packet_len(&self) -> usize {
        REQUEST_HEADER_LEN + self.payload_len as usize
    }

    fn write(&self, out: &mut [u8; REQUEST_HEADER_LEN]) {
        BigEndian::write_u32(&mut out[0..4], self.kind);
        BigEndian::write_u64(&mut out[4..12], self.request_id);
        BigEndian::write_u64(&mut out[12..20], self.start_time);
        BigEndian::write_u32(&mut out[20..24], self.payload_len);
    }

    fn read(raw: &[u8]) -> RequestHeader {
        RequestHeader {
            kind: BigEndian::read_u32(&raw[0..4]),
            request_id: BigEndian::read_u64(&raw[4..12]),
            start_time: BigEndian::read_u64(&raw[12..20]),
            payload_len: BigEndian::read_u32(&raw[20..24]),
        }
    }
}

/// Fixed response frame header. The first three fields echo the triggering
/// request verbatim; `processing_time` is the replying node's receive-to-send
/// span in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub kind: u32,
    pub request_id: u64,
    pub start_time: u64,
    pub processing_time: u64,
    pub payload_len: u32,
}

impl ResponseHeader {
    #[inline]
    pub fn packet_len(&self) -> usize {
        RESPONSE_HEADER_LEN + self.payload_len as usize
    }

    fn write(&self, out: &mut [u8; RESPONSE_HEADER_LEN]) {
        BigEndian::write_u32(&mut out[0..4], self.kind);
        BigEndian::write_u64(&mut out[4..12], self.request_id);
        BigEndian::write_u64(&mut out[12..20], self.start_time);
        BigEndian::write_u64(&mut out[20..28], self.processing_time);
        BigEndian::write_u32(&mut out[28..32], self.payload_len);
    }

    fn read(raw: &[u8]) -> ResponseHeader {
        ResponseHeader {
            kind: BigEndian::read_u32(&raw[0..4]),
            request_id: BigEndian::read_u64(&raw[4..12]),
            start_time: BigEndian::read_u64(&raw[12..20]),
            processing_time: BigEndian::read_u64(&raw[20..28]),
            payload_len: BigEndian::read_u32(&raw[28..32]),
        }
    }
}

/// Enqueues one request frame (header then payload) at the buffer tail.
pub fn encode_request(out: &mut Buffer, header: &RequestHeader, payload: &[u8]) {
    debug_assert_eq!(header.payload_len as usize, payload.len());

    let mut raw = [0u8; REQUEST_HEADER_LEN];
    header.write(&mut raw);
    out.extend(&raw);
    out.extend(payload);
}

/// Enqueues one response frame at the buffer tail.
pub fn encode_response(out: &mut Buffer, header: &ResponseHeader, payload: &[u8]) {
    debug_assert_eq!(header.payload_len as usize, payload.len());

    let mut raw = [0u8; RESPONSE_HEADER_LEN];
    header.write(&mut raw);
    out.extend(&raw);
    out.extend(payload);
}

/// Pops one complete request frame off the buffer head, if present. The
/// payload is copied out so the frame outlives the receive buffer.
pub fn decode_request(input: &mut Buffer) -> Option<(RequestHeader, Vec<u8>)> {
    let header = {
        let buffered = input.peek();
        if buffered.len() < REQUEST_HEADER_LEN {
            return None;
        }
        RequestHeader::read(buffered)
    };

    let total = header.packet_len();
    if input.len() < total {
        return None;
    }

    let payload = input.peek()[REQUEST_HEADER_LEN..total].to_vec();
    input.consume(total);
    Some((header, payload))
}

/// Pops one complete response frame off the buffer head, if present.
pub fn decode_response(input: &mut Buffer) -> Option<(ResponseHeader, Vec<u8>)> {
    let header = {
        let buffered = input.peek();
        if buffered.len() < RESPONSE_HEADER_LEN {
            return None;
        }
        ResponseHeader::read(buffered)
    };

    let total = header.packet_len();
    if input.len() < total {
        return None;
    }

    let payload = input.peek()[RESPONSE_HEADER_LEN..total].to_vec();
    input.consume(total);
    Some((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_header(payload: &[u8]) -> RequestHeader {
        RequestHeader {
            kind: 7,
            request_id: 0xDEAD_BEEF_0042,
            start_time: 123_456_789,
            payload_len: payload.len() as u32,
        }
    }

    #[test]
    fn test_request_roundtrip() {
        let payload = b"ping";
        let header = request_header(payload);

        let mut buf = Buffer::with_capacity(64);
        encode_request(&mut buf, &header, payload);
        assert_eq!(buf.len(), REQUEST_HEADER_LEN + payload.len());

        let (decoded, body) = decode_request(&mut buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_response_roundtrip_echoes_request_identity() {
        let req = request_header(b"x");
        let resp = ResponseHeader {
            kind: req.kind,
            request_id: req.request_id,
            start_time: req.start_time,
            processing_time: 42_000,
            payload_len: 4,
        };

        let mut buf = Buffer::with_capacity(64);
        encode_response(&mut buf, &resp, b"pong");

        let (decoded, body) = decode_response(&mut buf).unwrap();
        assert_eq!(decoded.kind, req.kind);
        assert_eq!(decoded.request_id, req.request_id);
        assert_eq!(decoded.start_time, req.start_time);
        assert_eq!(decoded.processing_time, 42_000);
        assert_eq!(body, b"pong");
    }

    #[test]
    fn test_decode_waits_for_split_header() {
        let payload = b"fragmented";
        let header = request_header(payload);

        let mut whole = Buffer::with_capacity(64);
        encode_request(&mut whole, &header, payload);
        let bytes = whole.peek().to_vec();

        let mut buf = Buffer::with_capacity(64);
        // Header arrives one byte at a time; no frame until it is whole and
        // the payload followed.
        for (i, chunk) in bytes.chunks(1).enumerate() {
            buf.extend(chunk);
            let complete = i + 1 == bytes.len();
            match decode_request(&mut buf) {
                Some((decoded, body)) => {
                    assert!(complete, "frame surfaced after {} bytes", i + 1);
                    assert_eq!(decoded, header);
                    assert_eq!(body, payload);
                }
                None => assert!(!complete, "complete frame not surfaced"),
            }
        }
    }

    #[test]
    fn test_decode_waits_for_split_payload() {
        let payload = [9u8; 1000];
        let header = request_header(&payload);

        let mut buf = Buffer::with_capacity(2048);
        let mut raw = Buffer::with_capacity(2048);
        encode_request(&mut raw, &header, &payload);
        let bytes = raw.peek().to_vec();

        buf.extend(&bytes[..REQUEST_HEADER_LEN + 500]);
        assert!(decode_request(&mut buf).is_none());

        buf.extend(&bytes[REQUEST_HEADER_LEN + 500..]);
        let (decoded, body) = decode_request(&mut buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(body.len(), payload.len());
    }

    #[test]
    fn test_back_to_back_frames_decode_individually() {
        let mut buf = Buffer::with_capacity(256);

        for id in 0..3u64 {
            let payload = vec![id as u8; 8];
            let header = RequestHeader {
                kind: 1,
                request_id: id,
                start_time: 0,
                payload_len: 8,
            };
            encode_request(&mut buf, &header, &payload);
        }

        for id in 0..3u64 {
            let (header, body) = decode_request(&mut buf).unwrap();
            assert_eq!(header.request_id, id);
            assert_eq!(body, vec![id as u8; 8]);
        }
        assert!(decode_request(&mut buf).is_none());
    }

    #[test]
    fn test_empty_payload_frame() {
        let header = RequestHeader {
            kind: 3,
            request_id: 1,
            start_time: 5,
            payload_len: 0,
        };

        let mut buf = Buffer::with_capacity(64);
        encode_request(&mut buf, &header, &[]);

        let (decoded, body) = decode_request(&mut buf).unwrap();
        assert_eq!(decoded, header);
        assert!(body.is_empty());
    }
}
