// Copyright The NRDOT Authors
// SPDX-License-Identifier: Apache-2.0

//! Record framing within a segment file.
//!
//! `{u32 len, u8 kind, payload[len], u32 crc32}`, integers little-endian.
//! The crc covers the kind byte and the payload, so a record cannot be
//! silently re-typed.

use std::io::{self, Read};

/// Record kind: a spilled batch payload.
pub const KIND_BATCH: u8 = 1;
/// Record kind: the segment footer.
pub const KIND_FOOTER: u8 = 2;

/// Fixed framing overhead per record (len + kind + crc).
pub const RECORD_OVERHEAD: u64 = 4 + 1 + 4;

/// Footer payload length: record count (u32) + overall crc (u32).
pub const FOOTER_PAYLOAD_LEN: usize = 8;

/// A record read back from a segment.
#[derive(Debug)]
pub struct RawRecord {
    /// Record kind byte.
    pub kind: u8,
    /// The payload bytes.
    pub payload: Vec<u8>,
    /// Whether the stored crc matched the recomputed one.
    pub crc_ok: bool,
    /// The stored crc value.
    pub crc: u32,
}

/// Computes the crc stored with a record.
#[must_use]
pub fn record_crc(kind: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[kind]);
    hasher.update(payload);
    hasher.finalize()
}

/// Encodes one framed record.
#[must_use]
pub fn encode_record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + RECORD_OVERHEAD as usize);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.push(kind);
    out.extend_from_slice(payload);
    out.extend_from_slice(&record_crc(kind, payload).to_le_bytes());
    out
}

/// Encodes the footer payload: record count plus the overall crc chained
/// over every record crc in append order.
#[must_use]
pub fn encode_footer(record_count: u32, overall_crc: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(FOOTER_PAYLOAD_LEN);
    payload.extend_from_slice(&record_count.to_le_bytes());
    payload.extend_from_slice(&overall_crc.to_le_bytes());
    encode_record(KIND_FOOTER, &payload)
}

/// Decodes a footer payload into (record count, overall crc).
#[must_use]
pub fn decode_footer(payload: &[u8]) -> Option<(u32, u32)> {
    if payload.len() != FOOTER_PAYLOAD_LEN {
        return None;
    }
    let count = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
    let crc = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Some((count, crc))
}

/// Outcome of reading one record from a segment stream.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete record (crc may still have failed; see
    /// [`RawRecord::crc_ok`]).
    Record(RawRecord),
    /// Clean end of file at a record boundary.
    Eof,
    /// The file ends inside a record: the byte offset where the partial
    /// record starts, for truncation.
    Partial,
}

/// Sanity bound on a single record payload; a larger length prefix is
/// treated as corruption (truncation point), not an allocation request.
pub const MAX_RECORD_LEN: u32 = 64 * 1024 * 1024;

/// Reads one framed record from the stream.
pub fn read_record<R: Read>(reader: &mut R) -> io::Result<ReadOutcome> {
    let mut len_buf = [0u8; 4];
    match read_exact_or_eof(reader, &mut len_buf)? {
        Fill::Empty => return Ok(ReadOutcome::Eof),
        Fill::Partial => return Ok(ReadOutcome::Partial),
        Fill::Full => {}
    }
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_RECORD_LEN {
        return Ok(ReadOutcome::Partial);
    }

    let mut kind = [0u8; 1];
    if !matches!(read_exact_or_eof(reader, &mut kind)?, Fill::Full) {
        return Ok(ReadOutcome::Partial);
    }
    let mut payload = vec![0u8; len as usize];
    if !matches!(read_exact_or_eof(reader, &mut payload)?, Fill::Full) {
        return Ok(ReadOutcome::Partial);
    }
    let mut crc_buf = [0u8; 4];
    if !matches!(read_exact_or_eof(reader, &mut crc_buf)?, Fill::Full) {
        return Ok(ReadOutcome::Partial);
    }
    let crc = u32::from_le_bytes(crc_buf);
    let crc_ok = record_crc(kind[0], &payload) == crc;
    Ok(ReadOutcome::Record(RawRecord {
        kind: kind[0],
        payload,
        crc_ok,
        crc,
    }))
}

enum Fill {
    Full,
    Partial,
    Empty,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<Fill> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(if filled == 0 { Fill::Empty } else { Fill::Partial });
        }
        filled += n;
    }
    Ok(Fill::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip() {
        let encoded = encode_record(KIND_BATCH, b"hello");
        let mut cursor = Cursor::new(encoded);
        match read_record(&mut cursor).expect("read") {
            ReadOutcome::Record(record) => {
                assert_eq!(record.kind, KIND_BATCH);
                assert_eq!(record.payload, b"hello");
                assert!(record.crc_ok);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(matches!(
            read_record(&mut cursor).expect("read"),
            ReadOutcome::Eof
        ));
    }

    #[test]
    fn flipped_bit_fails_crc() {
        let mut encoded = encode_record(KIND_BATCH, b"hello");
        encoded[6] ^= 0x01;
        let mut cursor = Cursor::new(encoded);
        match read_record(&mut cursor).expect("read") {
            ReadOutcome::Record(record) => assert!(!record.crc_ok),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn kind_is_covered_by_crc() {
        let mut encoded = encode_record(KIND_BATCH, b"hello");
        encoded[4] = KIND_FOOTER;
        let mut cursor = Cursor::new(encoded);
        match read_record(&mut cursor).expect("read") {
            ReadOutcome::Record(record) => assert!(!record.crc_ok),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn truncated_tail_is_partial() {
        let encoded = encode_record(KIND_BATCH, b"hello world");
        let mut cursor = Cursor::new(&encoded[..encoded.len() - 2]);
        assert!(matches!(
            read_record(&mut cursor).expect("read"),
            ReadOutcome::Partial
        ));
    }

    #[test]
    fn absurd_length_is_partial() {
        let mut encoded = encode_record(KIND_BATCH, b"x");
        encoded[0..4].copy_from_slice(&(MAX_RECORD_LEN + 1).to_le_bytes());
        let mut cursor = Cursor::new(encoded);
        assert!(matches!(
            read_record(&mut cursor).expect("read"),
            ReadOutcome::Partial
        ));
    }

    #[test]
    fn footer_roundtrip() {
        let encoded = encode_footer(42, 0xdead_beef);
        let mut cursor = Cursor::new(encoded);
        match read_record(&mut cursor).expect("read") {
            ReadOutcome::Record(record) => {
                assert_eq!(record.kind, KIND_FOOTER);
                assert!(record.crc_ok);
                assert_eq!(decode_footer(&record.payload), Some((42, 0xdead_beef)));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
