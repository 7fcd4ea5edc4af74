//! Record framing for bag files.
//!
//! Every record is framed as:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][payload: N bytes JSON][crc32: 4 bytes LE]
//! ```
//! Files start with a magic + version header.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Serialize};

/// Current record version.
pub const RECORD_VERSION: u8 = 1;

/// Magic bytes identifying bag files.
pub const MAGIC: [u8; 4] = *b"BFLW";

/// Size of the file header in bytes.
pub const HEADER_LEN: u64 = 5;

/// Records above this size are treated as corruption.
const MAX_RECORD_LEN: usize = 64 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Frames a value into a byte vector.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let payload =
        serde_json::to_vec(value).map_err(|e| invalid(format!("serialization failed: {e}")))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|l| (*l as usize) <= MAX_RECORD_LEN)
        .ok_or_else(|| invalid(format!("record of {} bytes is too large", payload.len())))?;

    let mut out = Vec::with_capacity(payload.len() + 9);
    out.push(RECORD_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum(&payload).to_le_bytes());
    Ok(out)
}

/// Reads one framed value.
///
/// # Errors
/// - `UnexpectedEof` if the stream ends mid-record
/// - `InvalidData` on version, size, checksum or payload errors
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    let mut prefix = [0u8; 5];
    reader.read_exact(&mut prefix)?;
    if prefix[0] != RECORD_VERSION {
        return Err(invalid(format!(
            "unsupported record version {} (expected {RECORD_VERSION})",
            prefix[0]
        )));
    }

    let len = u32::from_le_bytes([prefix[1], prefix[2], prefix[3], prefix[4]]) as usize;
    if len > MAX_RECORD_LEN {
        return Err(invalid(format!("record size {len} exceeds maximum {MAX_RECORD_LEN}")));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    let mut crc = [0u8; 4];
    reader.read_exact(&mut crc)?;
    let stored = u32::from_le_bytes(crc);
    let computed = checksum(&payload);
    if stored != computed {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored:08x}, computed={computed:08x}"
        )));
    }

    serde_json::from_slice(&payload).map_err(|e| invalid(format!("deserialization failed: {e}")))
}

/// Writes the file header.
pub fn write_header(writer: &mut impl Write) -> IoResult<()> {
    writer.write_all(&MAGIC)?;
    writer.write_all(&[RECORD_VERSION])
}

/// Reads and validates the file header, returning its version.
pub fn read_header(reader: &mut impl Read) -> IoResult<u8> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    if header[..4] != MAGIC {
        return Err(invalid(format!("bad magic bytes {:?}", &header[..4])));
    }
    Ok(header[4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::solution::Tuple;

    #[test]
    fn decodes_what_it_encodes() {
        let tuple = Tuple::new("alice", "age", 34);
        let mut cursor = Cursor::new(encode(&tuple).unwrap());
        let back: Tuple = decode(&mut cursor).unwrap();
        assert_eq!(back, tuple);
    }

    #[test]
    fn detects_corruption() {
        let mut bytes = encode(&"some payload".to_string()).unwrap();
        bytes[8] ^= 0xFF;
        let err = decode::<String>(&mut Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_record_is_unexpected_eof() {
        let bytes = encode(&"some payload".to_string()).unwrap();
        let err = decode::<String>(&mut Cursor::new(&bytes[..bytes.len() - 2])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }

    #[test]
    fn rejects_oversized_length() {
        let mut bytes = vec![RECORD_VERSION];
        bytes.extend_from_slice(&(200_000_000u32).to_le_bytes());
        let err = decode::<String>(&mut Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn header_validates_magic() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        assert_eq!(read_header(&mut Cursor::new(&buf)).unwrap(), RECORD_VERSION);
        assert!(read_header(&mut Cursor::new(b"NOPE1".to_vec())).is_err());
    }
}
