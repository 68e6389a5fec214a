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

//! Low-level binary codecs shared by all object serializations.
//!
//! Integers are big-endian. A "string list" is `u32 count` followed by
//! `u32 len` + bytes per string; it is the canonical encoding for column
//! lists and rows, and the unit over which row digests are computed.

use std::io::Read;

use thiserror::Error;

use crate::content_hash::HASH_LEN;
use crate::content_hash::HashSum;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Input ended at a record boundary or inside a record.
    #[error("unexpected end of input at position {pos}")]
    Eof { pos: usize },
    #[error("parse error at position {pos}: {message}")]
    Parse { pos: usize, message: String },
    #[error("read error at position {pos}")]
    Io {
        pos: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Tracks the read position so decode errors can point at the offending
/// byte.
#[derive(Debug)]
pub struct Parser<R> {
    pos: usize,
    buf: Vec<u8>,
    reader: R,
}

impl<R: Read> Parser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            pos: 0,
            buf: Vec::new(),
            reader,
        }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn parse_error(&self, message: impl Into<String>) -> DecodeError {
        DecodeError::Parse {
            pos: self.pos,
            message: message.into(),
        }
    }

    /// Reads exactly `n` bytes into the internal buffer. The returned slice
    /// is valid until the next read.
    pub fn next_bytes(&mut self, n: usize) -> Result<&[u8], DecodeError> {
        self.buf.resize(n, 0);
        let mut filled = 0;
        while filled < n {
            let count = self
                .reader
                .read(&mut self.buf[filled..])
                .map_err(|source| DecodeError::Io {
                    pos: self.pos,
                    source,
                })?;
            if count == 0 {
                return Err(DecodeError::Eof { pos: self.pos });
            }
            filled += count;
            self.pos += count;
        }
        Ok(&self.buf[..n])
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.next_bytes(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.next_bytes(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_sum(&mut self) -> Result<HashSum, DecodeError> {
        let bytes = self.next_bytes(HASH_LEN)?;
        Ok(bytes.try_into().unwrap())
    }

    /// Consumes `expected` or fails, anchoring label-based formats.
    pub fn consume_str(&mut self, expected: &str) -> Result<(), DecodeError> {
        let bytes = self.next_bytes(expected.len())?;
        if bytes != expected.as_bytes() {
            let actual = String::from_utf8_lossy(bytes).into_owned();
            return Err(self.parse_error(format!("expected {expected:?}, received {actual:?}")));
        }
        Ok(())
    }

    /// Reads bytes up to (and consuming) the next `delim`.
    pub fn read_until(&mut self, delim: u8) -> Result<Vec<u8>, DecodeError> {
        let mut out = Vec::new();
        loop {
            let byte = self.read_u8()?;
            if byte == delim {
                return Ok(out);
            }
            out.push(byte);
        }
    }

    pub fn read_str_list(&mut self) -> Result<Vec<String>, DecodeError> {
        let count = self.read_u32()? as usize;
        let mut strs = Vec::with_capacity(count);
        for _ in 0..count {
            let len = self.read_u32()? as usize;
            let pos_before = self.pos;
            let bytes = self.next_bytes(len)?;
            let s = std::str::from_utf8(bytes)
                .map_err(|err| DecodeError::Parse {
                    pos: pos_before + len,
                    message: format!("invalid utf-8 in string list: {err}"),
                })?
                .to_owned();
            strs.push(s);
        }
        Ok(strs)
    }
}

/// Encodes string lists into a reused buffer. One encoder instance serves a
/// whole ingest run so row encoding does not allocate per row.
#[derive(Default)]
pub struct StrListEncoder {
    buf: Vec<u8>,
}

impl StrListEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encode<S: AsRef<str>>(&mut self, strs: &[S]) -> &[u8] {
        self.buf.clear();
        self.buf
            .extend_from_slice(&(strs.len() as u32).to_be_bytes());
        for s in strs {
            let bytes = s.as_ref().as_bytes();
            self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            self.buf.extend_from_slice(bytes);
        }
        &self.buf
    }

    /// Encodes only the cells selected by `indices`, in that order. Used to
    /// compute primary-key digests.
    pub fn encode_subset<S: AsRef<str>>(&mut self, strs: &[S], indices: &[u32]) -> &[u8] {
        self.buf.clear();
        self.buf
            .extend_from_slice(&(indices.len() as u32).to_be_bytes());
        for &i in indices {
            let bytes = strs[i as usize].as_ref().as_bytes();
            self.buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            self.buf.extend_from_slice(bytes);
        }
        &self.buf
    }
}
