// Copyright 2023 The Wrangle Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pkt-line framing for the upload-pack and receive-pack control streams.
//!
//! Each record is 4 lowercase hex digits holding the total length (the 4
//! digits included), then the payload. `0000` is the flush packet.

use std::io::Read;
use std::io::Write;

use thiserror::Error;

// 0xfff0 - 4, the largest payload that fits the 4-digit length.
pub const MAX_PAYLOAD: usize = 65516;

#[derive(Debug, Error)]
pub enum PktLineError {
    #[error("invalid pkt-line length {length:?}")]
    InvalidLength { length: String },
    #[error("pkt-line payload too long: {0} bytes")]
    PayloadTooLong(usize),
    #[error("unexpected end of pkt-line stream")]
    UnexpectedEof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single parsed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PktLine {
    Flush,
    Data(Vec<u8>),
}

impl PktLine {
    pub fn text(s: &str) -> Self {
        Self::Data(s.as_bytes().to_vec())
    }

    /// Payload as a string with one trailing newline removed, the way
    /// command lines are compared.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Flush => None,
            Self::Data(payload) => {
                let payload = payload.strip_suffix(b"\n").unwrap_or(payload);
                std::str::from_utf8(payload).ok()
            }
        }
    }
}

pub fn write_pkt_line<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), PktLineError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(PktLineError::PayloadTooLong(payload.len()));
    }
    write!(writer, "{:04x}", payload.len() + 4)?;
    writer.write_all(payload)?;
    Ok(())
}

pub fn write_text_line<W: Write>(writer: &mut W, line: &str) -> Result<(), PktLineError> {
    let mut payload = line.as_bytes().to_vec();
    payload.push(b'\n');
    write_pkt_line(writer, &payload)
}

pub fn write_flush<W: Write>(writer: &mut W) -> Result<(), PktLineError> {
    writer.write_all(b"0000")?;
    Ok(())
}

/// Reads one record. Returns `None` at a clean end of stream.
pub fn read_pkt_line<R: Read>(reader: &mut R) -> Result<Option<PktLine>, PktLineError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let count = reader.read(&mut len_buf[filled..])?;
        if count == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(PktLineError::UnexpectedEof);
        }
        filled += count;
    }
    let len_str = std::str::from_utf8(&len_buf).map_err(|_| PktLineError::InvalidLength {
        length: String::from_utf8_lossy(&len_buf).into_owned(),
    })?;
    let length = usize::from_str_radix(len_str, 16).map_err(|_| PktLineError::InvalidLength {
        length: len_str.to_owned(),
    })?;
    if length == 0 {
        return Ok(Some(PktLine::Flush));
    }
    if length < 4 || length > MAX_PAYLOAD + 4 {
        return Err(PktLineError::InvalidLength {
            length: len_str.to_owned(),
        });
    }
    let mut payload = vec![0; length - 4];
    let mut filled = 0;
    while filled < payload.len() {
        let count = reader.read(&mut payload[filled..])?;
        if count == 0 {
            return Err(PktLineError::UnexpectedEof);
        }
        filled += count;
    }
    Ok(Some(PktLine::Data(payload)))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_round_trip() {
        let mut buf = Vec::new();
        write_text_line(&mut buf, "want 0123").unwrap();
        write_flush(&mut buf).unwrap();
        write_pkt_line(&mut buf, b"done\n").unwrap();

        let mut reader = &buf[..];
        let line = read_pkt_line(&mut reader).unwrap().unwrap();
        assert_eq!(line.as_text(), Some("want 0123"));
        assert_eq!(read_pkt_line(&mut reader).unwrap(), Some(PktLine::Flush));
        let line = read_pkt_line(&mut reader).unwrap().unwrap();
        assert_eq!(line.as_text(), Some("done"));
        assert_eq!(read_pkt_line(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_length_includes_prefix() {
        let mut buf = Vec::new();
        write_pkt_line(&mut buf, b"a").unwrap();
        assert_eq!(buf, b"0005a");
    }

    #[test]
    fn test_invalid_length() {
        let mut reader = &b"00zz"[..];
        assert_matches!(
            read_pkt_line(&mut reader),
            Err(PktLineError::InvalidLength { .. })
        );
        // 1..=3 are impossible lengths
        let mut reader = &b"0003"[..];
        assert_matches!(
            read_pkt_line(&mut reader),
            Err(PktLineError::InvalidLength { .. })
        );
    }

    #[test]
    fn test_truncated_payload() {
        let mut reader = &b"0008abc"[..];
        assert_matches!(read_pkt_line(&mut reader), Err(PktLineError::UnexpectedEof));
    }
}
