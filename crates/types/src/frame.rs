//! Length-prefixed framing shared by the local tx journal and the
//! `PUSH_TXS` wire payload.
//!
//! Each record is `{u64 little-endian length}{payload}`.

use crate::CodecError;
use std::io::{self, BufRead, Write};

/// Byte width of the length prefix.
pub const FRAME_PREFIX_LEN: usize = 8;

/// Write one framed record.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&(payload.len() as u64).to_le_bytes())?;
    writer.write_all(payload)
}

/// Read one framed record.
///
/// Returns `Ok(None)` on a clean end of stream (no prefix bytes at all)
/// and an error for a short prefix or a truncated payload.
pub fn read_frame<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; FRAME_PREFIX_LEN];
    let mut read = 0;
    while read < FRAME_PREFIX_LEN {
        let n = reader.read(&mut prefix[read..])?;
        if n == 0 {
            if read == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short length prefix",
            ));
        }
        read += n;
    }
    let length = u64::from_le_bytes(prefix) as usize;
    let mut payload = vec![0u8; length];
    io::Read::read_exact(reader, &mut payload)?;
    Ok(Some(payload))
}

/// Concatenate payloads into a framed byte string.
pub fn encode_frames(payloads: &[Vec<u8>]) -> Vec<u8> {
    let total: usize = payloads
        .iter()
        .map(|p| FRAME_PREFIX_LEN + p.len())
        .sum();
    let mut out = Vec::with_capacity(total);
    for payload in payloads {
        out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        out.extend_from_slice(payload);
    }
    out
}

/// Split a framed byte string back into payloads. Strict: a truncated
/// record is an error, unlike journal loading which skips and continues.
pub fn decode_frames(mut bytes: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let mut out = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < FRAME_PREFIX_LEN {
            return Err(CodecError::TruncatedFrame {
                expected: FRAME_PREFIX_LEN,
                got: bytes.len(),
            });
        }
        let (prefix, rest) = bytes.split_at(FRAME_PREFIX_LEN);
        let length = u64::from_le_bytes(prefix.try_into().expect("prefix width")) as usize;
        if rest.len() < length {
            return Err(CodecError::TruncatedFrame {
                expected: length,
                got: rest.len(),
            });
        }
        let (payload, rest) = rest.split_at(length);
        out.push(payload.to_vec());
        bytes = rest;
    }
    Ok(out)
}
