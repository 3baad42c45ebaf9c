// SPDX-License-Identifier: MIT
//
// Author: Johannes Leupolz <dev@leupolz.eu>

use std::io::{self, ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FramingError;
use crate::record::LogRecord;

pub const FRAME_SEPARATOR: [u8; 2] = *b"  ";

const LENGTH_PREFIX_LEN: usize = 4;

/// Wraps an already serialized payload into a frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_LEN + FRAME_SEPARATOR.len() + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    if !payload.is_empty() {
        frame.extend_from_slice(&FRAME_SEPARATOR);
        frame.extend_from_slice(payload);
    }
    frame
}

/// Serializes a log record into a complete frame.
pub fn encode(record: &LogRecord) -> Result<Vec<u8>, FramingError> {
    encode_with_limit(record, u32::MAX as usize)
}

/// Like [`encode`], but refuses payloads a receiver reading with `max_len`
/// would reject.
pub fn encode_with_limit(record: &LogRecord, max_len: usize) -> Result<Vec<u8>, FramingError> {
    let json = serde_json::to_vec(record)?;
    let max = max_len.min(u32::MAX as usize);
    if json.len() > max {
        return Err(FramingError::TooLarge { len: json.len(), max });
    }
    Ok(encode_frame(&json))
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    writer.write_all(&encode_frame(payload))?;
    writer.flush()
}

pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), FramingError> {
    let json = serde_json::to_vec(message)?;
    write_frame(writer, &json)?;
    Ok(())
}

/// Reads into `buf` until it is full or the stream ends. Returns the number of
/// bytes read, which is only smaller than `buf.len()` on end of stream.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Reads the payload of the next frame.
///
/// Returns `Ok(None)` when the stream ends before a complete length prefix
/// was received; that is the regular end of a connection. A zero length
/// yields an empty payload without touching the stream any further.
pub fn read_frame<R: Read>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, FramingError> {
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    if fill(reader, &mut prefix)? < LENGTH_PREFIX_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Ok(Some(Vec::new()));
    }
    if len > max_len {
        return Err(FramingError::TooLarge { len, max: max_len });
    }

    let mut separator = [0u8; 2];
    let received = fill(reader, &mut separator)?;
    if received < separator.len() {
        return Err(FramingError::Truncated {
            expected: len + separator.len(),
            received,
        });
    }
    if separator != FRAME_SEPARATOR {
        return Err(FramingError::BadSeparator(separator));
    }

    let mut payload = vec![0u8; len];
    let received = fill(reader, &mut payload)?;
    if received < len {
        return Err(FramingError::Truncated {
            expected: len,
            received,
        });
    }
    Ok(Some(payload))
}

/// Reads and deserializes the next non-empty frame.
pub fn read_message<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    max_len: usize,
) -> Result<Option<T>, FramingError> {
    loop {
        match read_frame(reader, max_len)? {
            None => return Ok(None),
            Some(payload) if payload.is_empty() => continue,
            Some(payload) => return Ok(Some(serde_json::from_slice(&payload)?)),
        }
    }
}

/// Reads the next log record from the stream. Empty frames are skipped.
pub fn decode<R: Read>(reader: &mut R, max_len: usize) -> Result<Option<LogRecord>, FramingError> {
    read_message(reader, max_len)
}
