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

//! The packfile transport container.
//!
//! A packfile is the magic `WRGL`, a version byte, then a sequence of
//! `u8 type` + `u32 size` + payload records terminated by end of stream.
//! A stream may carry several concatenated packfiles; the reader treats an
//! inner magic as the start of the next one.

use std::io::Read;
use std::io::Write;

use thiserror::Error;

use crate::encoding::DecodeError;
use crate::encoding::Parser;

pub const MAGIC: &[u8; 4] = b"WRGL";
pub const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Commit = 1,
    Table = 2,
    Block = 3,
}

impl ObjectType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Commit),
            2 => Some(Self::Table),
            3 => Some(Self::Block),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PackfileError {
    #[error("not a packfile")]
    BadMagic,
    #[error("unsupported packfile version {0}")]
    BadVersion(u8),
    #[error("unknown object type tag {0}")]
    BadType(u8),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

pub struct PackfileWriter<W> {
    writer: W,
}

impl<W: Write> PackfileWriter<W> {
    pub fn new(mut writer: W) -> std::io::Result<Self> {
        writer.write_all(MAGIC)?;
        writer.write_all(&[VERSION])?;
        Ok(Self { writer })
    }

    /// Writes one record and returns the number of bytes it occupies.
    pub fn write_object(&mut self, typ: ObjectType, payload: &[u8]) -> std::io::Result<usize> {
        self.writer.write_all(&[typ as u8])?;
        self.writer.write_all(&(payload.len() as u32).to_be_bytes())?;
        self.writer.write_all(payload)?;
        Ok(1 + 4 + payload.len())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[derive(Debug)]
pub struct PackfileReader<R> {
    parser: Parser<R>,
    pub version: u8,
}

impl<R: Read> PackfileReader<R> {
    pub fn new(reader: R) -> Result<Self, PackfileError> {
        let mut parser = Parser::new(reader);
        let version = read_header(&mut parser)?;
        Ok(Self { parser, version })
    }

    /// Reads the next record; `None` at a clean end of stream.
    pub fn read_object(&mut self) -> Result<Option<(ObjectType, Vec<u8>)>, PackfileError> {
        let record_start = self.parser.pos();
        let mut tag = match self.parser.read_u8() {
            Ok(tag) => tag,
            Err(DecodeError::Eof { pos }) if pos == record_start => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if tag == MAGIC[0] {
            // A concatenated packfile follows; consume its header.
            self.parser.consume_str("RGL")?;
            let version = self.parser.read_u8()?;
            if version != VERSION {
                return Err(PackfileError::BadVersion(version));
            }
            tag = self.parser.read_u8()?;
        }
        let typ = ObjectType::from_tag(tag).ok_or(PackfileError::BadType(tag))?;
        let size = self.parser.read_u32()? as usize;
        let payload = self.parser.next_bytes(size)?.to_vec();
        Ok(Some((typ, payload)))
    }
}

fn read_header<R: Read>(parser: &mut Parser<R>) -> Result<u8, PackfileError> {
    let magic = parser.next_bytes(MAGIC.len()).map_err(|err| match err {
        DecodeError::Eof { .. } => PackfileError::BadMagic,
        other => PackfileError::Decode(other),
    })?;
    if magic != MAGIC {
        return Err(PackfileError::BadMagic);
    }
    let version = parser.read_u8()?;
    if version != VERSION {
        return Err(PackfileError::BadVersion(version));
    }
    Ok(version)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_round_trip() {
        let mut writer = PackfileWriter::new(Vec::new()).unwrap();
        writer.write_object(ObjectType::Commit, b"commit one").unwrap();
        writer.write_object(ObjectType::Commit, b"commit two").unwrap();
        writer.write_object(ObjectType::Table, b"a table").unwrap();
        let n = writer.write_object(ObjectType::Block, b"block!").unwrap();
        assert_eq!(n, 1 + 4 + 6);
        let buf = writer.into_inner();

        let mut reader = PackfileReader::new(&buf[..]).unwrap();
        assert_eq!(reader.version, 1);
        let expected = [
            (ObjectType::Commit, b"commit one".to_vec()),
            (ObjectType::Commit, b"commit two".to_vec()),
            (ObjectType::Table, b"a table".to_vec()),
            (ObjectType::Block, b"block!".to_vec()),
        ];
        for (typ, payload) in &expected {
            let (t, p) = reader.read_object().unwrap().unwrap();
            assert_eq!(t, *typ);
            assert_eq!(p, *payload);
        }
        assert_matches!(reader.read_object(), Ok(None));
    }

    #[test]
    fn test_not_a_packfile() {
        assert_matches!(
            PackfileReader::new(&b"notapackfile"[..]),
            Err(PackfileError::BadMagic)
        );
        assert_matches!(PackfileReader::new(&b"WR"[..]), Err(PackfileError::BadMagic));
    }

    #[test]
    fn test_bad_version() {
        assert_matches!(
            PackfileReader::new(&b"WRGL\x02"[..]),
            Err(PackfileError::BadVersion(2))
        );
    }

    #[test]
    fn test_bad_type_tag() {
        let mut buf = b"WRGL\x01".to_vec();
        buf.push(9);
        buf.extend_from_slice(&0u32.to_be_bytes());
        let mut reader = PackfileReader::new(&buf[..]).unwrap();
        assert_matches!(reader.read_object(), Err(PackfileError::BadType(9)));
    }

    #[test]
    fn test_concatenated_packfiles() {
        let mut writer = PackfileWriter::new(Vec::new()).unwrap();
        writer.write_object(ObjectType::Block, b"first").unwrap();
        let mut buf = writer.into_inner();
        let mut writer = PackfileWriter::new(Vec::new()).unwrap();
        writer.write_object(ObjectType::Block, b"second").unwrap();
        buf.extend_from_slice(&writer.into_inner());

        let mut reader = PackfileReader::new(&buf[..]).unwrap();
        let (_, p) = reader.read_object().unwrap().unwrap();
        assert_eq!(p, b"first");
        let (_, p) = reader.read_object().unwrap().unwrap();
        assert_eq!(p, b"second");
        assert_matches!(reader.read_object(), Ok(None));
    }

    #[test]
    fn test_truncated_record() {
        let mut writer = PackfileWriter::new(Vec::new()).unwrap();
        writer.write_object(ObjectType::Block, b"payload").unwrap();
        let buf = writer.into_inner();
        let mut reader = PackfileReader::new(&buf[..buf.len() - 2]).unwrap();
        assert_matches!(
            reader.read_object(),
            Err(PackfileError::Decode(DecodeError::Eof { .. }))
        );
    }
}
