//! Segment record encoding

use std::io::{self, Read};

use crate::message::OutboundMessage;

pub(crate) const HEADER_LEN: u64 = 8;
pub(crate) const TRAILER_LEN: u64 = 4;

/// On-disk size of a record
pub(crate) fn encoded_len(msg: &OutboundMessage) -> u64 {
    HEADER_LEN + msg.routing_key().len() as u64 + msg.payload_len() + TRAILER_LEN
}

pub(crate) fn encode(msg: &OutboundMessage) -> Vec<u8> {
    let key = msg.routing_key().as_bytes();
    let payload = msg.payload();

    let mut buf = Vec::with_capacity(encoded_len(msg) as usize);
    buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(payload);

    let checksum = crc32fast::hash(&buf);
    buf.extend_from_slice(&checksum.to_le_bytes());
    buf
}

/// Result of reading one record from a segment
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A valid record and its on-disk length
    Record(OutboundMessage, u64),
    /// Clean end of segment at a record boundary
    End,
    /// Partially written or damaged record; nothing after it is trusted
    Torn(&'static str),
}

/// Read the next record. `remaining` bounds the record length so a damaged
/// header cannot trigger a huge allocation.
pub(crate) fn decode_next<R: Read>(reader: &mut R, remaining: u64) -> io::Result<Decoded> {
    let mut header = [0u8; HEADER_LEN as usize];
    let n = read_full(reader, &mut header)?;
    if n == 0 {
        return Ok(Decoded::End);
    }
    if n < header.len() {
        return Ok(Decoded::Torn("truncated header"));
    }

    let key_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as u64;
    let payload_len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;
    let total = HEADER_LEN + key_len + payload_len + TRAILER_LEN;
    if total > remaining {
        return Ok(Decoded::Torn("record extends past end of segment"));
    }

    let mut body = vec![0u8; (key_len + payload_len + TRAILER_LEN) as usize];
    if read_full(reader, &mut body)? < body.len() {
        return Ok(Decoded::Torn("truncated record body"));
    }

    let crc_at = body.len() - TRAILER_LEN as usize;
    let stored = u32::from_le_bytes([
        body[crc_at],
        body[crc_at + 1],
        body[crc_at + 2],
        body[crc_at + 3],
    ]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&body[..crc_at]);
    if hasher.finalize() != stored {
        return Ok(Decoded::Torn("checksum mismatch"));
    }

    body.truncate(crc_at);
    let payload = body.split_off(key_len as usize);
    let Ok(routing_key) = String::from_utf8(body) else {
        return Ok(Decoded::Torn("routing key is not valid UTF-8"));
    };

    Ok(Decoded::Record(
        OutboundMessage::new(routing_key, payload),
        total,
    ))
}

/// Like `read_exact`, but reports how much was read before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_encoded_len_matches_encoding() {
        let msg = OutboundMessage::new("meter/7/power", b"{\"v\":12.5}".to_vec());
        assert_eq!(encode(&msg).len() as u64, encoded_len(&msg));
    }

    #[test]
    fn test_decode_sequence_then_end() {
        let a = OutboundMessage::new("a", b"first".to_vec());
        let b = OutboundMessage::new("b", Vec::new());
        let mut bytes = encode(&a);
        bytes.extend(encode(&b));
        let total = bytes.len() as u64;
        let mut reader = Cursor::new(bytes);

        match decode_next(&mut reader, total).unwrap() {
            Decoded::Record(msg, len) => {
                assert_eq!(msg, a);
                assert_eq!(len, encoded_len(&a));
            },
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            decode_next(&mut reader, total).unwrap(),
            Decoded::Record(ref msg, _) if *msg == b
        ));
        assert!(matches!(decode_next(&mut reader, total).unwrap(), Decoded::End));
    }

    #[test]
    fn test_truncated_record_is_torn() {
        let msg = OutboundMessage::new("topic", b"payload".to_vec());
        let mut bytes = encode(&msg);
        bytes.truncate(bytes.len() - 3);
        let mut reader = Cursor::new(bytes);

        assert!(matches!(
            decode_next(&mut reader, 1024).unwrap(),
            Decoded::Torn("truncated record body")
        ));
    }

    #[test]
    fn test_flipped_bit_fails_checksum() {
        let msg = OutboundMessage::new("topic", b"payload".to_vec());
        let mut bytes = encode(&msg);
        bytes[10] ^= 0x01;
        let mut reader = Cursor::new(bytes);

        assert!(matches!(
            decode_next(&mut reader, 1024).unwrap(),
            Decoded::Torn("checksum mismatch")
        ));
    }

    #[test]
    fn test_oversized_length_rejected_without_allocation() {
        let mut bytes = vec![0xFF; 8];
        bytes.extend_from_slice(b"junk");
        let mut reader = Cursor::new(bytes);

        assert!(matches!(
            decode_next(&mut reader, 64).unwrap(),
            Decoded::Torn("record extends past end of segment")
        ));
    }
}
