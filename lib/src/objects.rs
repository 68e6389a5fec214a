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

//! The persisted object model: commits, tables and blocks, together with
//! their canonical byte serializations. An object's id is the digest of the
//! exact bytes produced here, so these codecs are format-stable.

use std::fmt;
use std::io::Cursor;

use crate::content_hash::HashSum;
use crate::content_hash::hash_bytes;
use crate::encoding::DecodeError;
use crate::encoding::Parser;
use crate::encoding::StrListEncoder;
use crate::object_id::id_type;

/// Maximum number of rows stored in one block.
pub const BLOCK_SIZE: usize = 255;

id_type!(
    /// Identifier for a [`Commit`], the digest of its serialization.
    pub CommitId
);
id_type!(
    /// Identifier for a [`Table`] manifest.
    pub TableId
);
id_type!(pub BlockId);
id_type!(pub BlockIndexId);

pub type Row = Vec<String>;

/// A point in time with the author's UTC offset, seconds precision.
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    /// Offset from UTC in minutes, east positive.
    pub tz_offset: i32,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = chrono::offset::Local::now();
        Self {
            seconds: now.timestamp(),
            tz_offset: now.offset().local_minus_utc() / 60,
        }
    }

    /// Renders the offset in `+0700` form.
    pub fn tz_string(&self) -> String {
        let sign = if self.tz_offset < 0 { '-' } else { '+' };
        let minutes = self.tz_offset.abs();
        format!("{sign}{:02}{:02}", minutes / 60, minutes % 60)
    }

    pub fn parse_tz(s: &str) -> Option<i32> {
        let bytes = s.as_bytes();
        if bytes.len() != 5 {
            return None;
        }
        let sign = match bytes[0] {
            b'+' => 1,
            b'-' => -1,
            _ => return None,
        };
        let hours: i32 = s[1..3].parse().ok()?;
        let minutes: i32 = s[3..5].parse().ok()?;
        Some(sign * (hours * 60 + minutes))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seconds, self.tz_string())
    }
}

/// An ordered group of up to [`BLOCK_SIZE`] rows, stored as one object.
/// Within a block, rows are sorted by their primary-key digest.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Block {
    pub rows: Vec<Row>,
}

impl Block {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    pub fn encode(&self, enc: &mut StrListEncoder) -> Vec<u8> {
        let column_count = self.rows.first().map_or(0, Vec::len);
        let mut out = vec![column_count as u8];
        for row in &self.rows {
            out.extend_from_slice(enc.encode(row));
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut parser = Parser::new(Cursor::new(bytes));
        let column_count = parser.read_u8()? as usize;
        let mut rows = Vec::new();
        loop {
            let row_start = parser.pos();
            match parser.read_str_list() {
                Ok(row) => {
                    if row.len() != column_count {
                        return Err(parser.parse_error(format!(
                            "row {} has {} cells, expected {column_count}",
                            rows.len(),
                            row.len(),
                        )));
                    }
                    rows.push(row);
                }
                // Clean end of input between rows; anything else is a
                // truncated row.
                Err(DecodeError::Eof { pos }) if pos == row_start => break,
                Err(err) => return Err(err),
            }
        }
        Ok(Self { rows })
    }
}

/// The manifest of one table version: column names, primary-key column
/// indices, and the ordered block / block-index ids.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Table {
    pub columns: Vec<String>,
    pub pk: Vec<u32>,
    pub rows_count: u32,
    pub blocks: Vec<BlockId>,
    pub block_indices: Vec<BlockIndexId>,
}

/// Number of blocks a table with `rows_count` rows occupies.
pub fn blocks_count(rows_count: u32) -> usize {
    (rows_count as usize).div_ceil(BLOCK_SIZE)
}

impl Table {
    pub fn new(columns: Vec<String>, pk: Vec<u32>, rows_count: u32) -> Self {
        let count = blocks_count(rows_count);
        Self {
            columns,
            pk,
            rows_count,
            blocks: vec![BlockId::new([0; 16]); count],
            block_indices: vec![BlockIndexId::new([0; 16]); count],
        }
    }

    /// Names of the primary-key columns, in key order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.pk
            .iter()
            .map(|&i| self.columns[i as usize].as_str())
            .collect()
    }

    pub fn encode(&self, enc: &mut StrListEncoder) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(enc.encode(&self.columns));
        out.extend_from_slice(&(self.pk.len() as u32).to_be_bytes());
        for &i in &self.pk {
            out.extend_from_slice(&i.to_be_bytes());
        }
        out.extend_from_slice(&self.rows_count.to_be_bytes());
        out.extend_from_slice(&(self.blocks.len() as u32).to_be_bytes());
        for id in &self.blocks {
            out.extend_from_slice(&id.sum());
        }
        for id in &self.block_indices {
            out.extend_from_slice(&id.sum());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut parser = Parser::new(Cursor::new(bytes));
        let columns = parser.read_str_list()?;
        let pk_len = parser.read_u32()? as usize;
        let mut pk = Vec::with_capacity(pk_len);
        for _ in 0..pk_len {
            pk.push(parser.read_u32()?);
        }
        let rows_count = parser.read_u32()?;
        let block_count = parser.read_u32()? as usize;
        let mut blocks = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            blocks.push(BlockId::new(parser.read_sum()?));
        }
        let mut block_indices = Vec::with_capacity(block_count);
        for _ in 0..block_count {
            block_indices.push(BlockIndexId::new(parser.read_sum()?));
        }
        let table = Self {
            columns,
            pk,
            rows_count,
            blocks,
            block_indices,
        };
        table.validate().map_err(|message| DecodeError::Parse {
            pos: parser.pos(),
            message,
        })?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), String> {
        if self.pk.len() > self.columns.len() {
            return Err("more primary-key indices than columns".into());
        }
        let mut seen = vec![false; self.columns.len()];
        for &i in &self.pk {
            let Some(slot) = seen.get_mut(i as usize) else {
                return Err(format!("primary-key index {i} out of range"));
            };
            if *slot {
                return Err(format!("duplicate primary-key index {i}"));
            }
            *slot = true;
        }
        if self.blocks.len() != blocks_count(self.rows_count) {
            return Err(format!(
                "table with {} rows must have {} blocks, found {}",
                self.rows_count,
                blocks_count(self.rows_count),
                self.blocks.len(),
            ));
        }
        if self.blocks.len() != self.block_indices.len() {
            return Err("blocks and block indices differ in length".into());
        }
        Ok(())
    }
}

/// A named snapshot: one table plus parent commits.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Commit {
    pub table: TableId,
    pub author_name: String,
    pub author_email: String,
    pub message: String,
    pub time: Timestamp,
    pub parents: Vec<CommitId>,
}

impl Commit {
    /// First line of the message, used in reflog entries.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn encode(&self) -> Vec<u8> {
        use crate::object_id::ObjectId as _;
        let mut out = Vec::new();
        out.extend_from_slice(format!("table {}\n", self.table.hex()).as_bytes());
        out.extend_from_slice(format!("authorName {}\n", escape(&self.author_name)).as_bytes());
        out.extend_from_slice(format!("authorEmail {}\n", escape(&self.author_email)).as_bytes());
        out.extend_from_slice(format!("time {}\n", self.time).as_bytes());
        out.extend_from_slice(format!("message {}\n", escape(&self.message)).as_bytes());
        for parent in &self.parents {
            out.extend_from_slice(format!("parent {}\n", parent.hex()).as_bytes());
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut parser = Parser::new(Cursor::new(bytes));
        let table = read_id_line(&mut parser, "table ", |s| TableId::try_from_hex(s))?;
        let author_name = read_text_line(&mut parser, "authorName ")?;
        let author_email = read_text_line(&mut parser, "authorEmail ")?;
        parser.consume_str("time ")?;
        let time_line = String::from_utf8_lossy(&parser.read_until(b'\n')?).into_owned();
        let time = parse_time(&time_line)
            .ok_or_else(|| parser.parse_error(format!("invalid time {time_line:?}")))?;
        let message = read_text_line(&mut parser, "message ")?;
        let mut parents = Vec::new();
        loop {
            let line_start = parser.pos();
            match parser.consume_str("parent ") {
                Ok(()) => parents.push(read_hex_until_newline(&mut parser, |s| {
                    CommitId::try_from_hex(s)
                })?),
                Err(DecodeError::Eof { pos }) if pos == line_start => break,
                Err(err) => return Err(err),
            }
        }
        Ok(Self {
            table,
            author_name,
            author_email,
            message,
            time,
            parents,
        })
    }
}

fn parse_time(line: &str) -> Option<Timestamp> {
    let (seconds, tz) = line.split_once(' ')?;
    Some(Timestamp {
        seconds: seconds.parse().ok()?,
        tz_offset: Timestamp::parse_tz(tz)?,
    })
}

fn read_id_line<T>(
    parser: &mut Parser<Cursor<&[u8]>>,
    label: &str,
    from_hex: impl Fn(&str) -> Option<T>,
) -> Result<T, DecodeError> {
    parser.consume_str(label)?;
    read_hex_until_newline(parser, from_hex)
}

fn read_hex_until_newline<T>(
    parser: &mut Parser<Cursor<&[u8]>>,
    from_hex: impl Fn(&str) -> Option<T>,
) -> Result<T, DecodeError> {
    let bytes = parser.read_until(b'\n')?;
    let hex = std::str::from_utf8(&bytes)
        .map_err(|_| parser.parse_error("invalid utf-8 in id"))?
        .to_owned();
    from_hex(&hex).ok_or_else(|| parser.parse_error(format!("invalid id {hex:?}")))
}

fn read_text_line(
    parser: &mut Parser<Cursor<&[u8]>>,
    label: &str,
) -> Result<String, DecodeError> {
    parser.consume_str(label)?;
    let bytes = parser.read_until(b'\n')?;
    let escaped = std::str::from_utf8(&bytes)
        .map_err(|_| parser.parse_error("invalid utf-8 in text field"))?;
    Ok(unescape(escaped))
}

// Text fields are single lines on disk; literal newlines and backslashes
// are escaped.
fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\n', "\\n")
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// Digest of a row's primary-key cells. With an empty key the whole row is
/// the key, so any edit reads as delete + insert.
pub fn pk_sum(enc: &mut StrListEncoder, row: &[String], pk: &[u32]) -> HashSum {
    if pk.is_empty() {
        hash_bytes(enc.encode(row))
    } else {
        hash_bytes(enc.encode_subset(row, pk))
    }
}

/// Digest of a row's full contents.
pub fn row_sum(enc: &mut StrListEncoder, row: &[String]) -> HashSum {
    hash_bytes(enc.encode(row))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::content_hash::hash_bytes;

    fn sample_commit() -> Commit {
        Commit {
            table: TableId::new(hash_bytes(b"t")),
            author_name: "Alice".to_owned(),
            author_email: "alice@example.com".to_owned(),
            message: "initial commit\n\nwith a body".to_owned(),
            time: Timestamp {
                seconds: 1700000000,
                tz_offset: -300,
            },
            parents: vec![
                CommitId::new(hash_bytes(b"p1")),
                CommitId::new(hash_bytes(b"p2")),
            ],
        }
    }

    #[test]
    fn test_commit_round_trip() {
        let commit = sample_commit();
        let decoded = Commit::decode(&commit.encode()).unwrap();
        assert_eq!(decoded, commit);
    }

    #[test]
    fn test_commit_root_has_no_parents() {
        let mut commit = sample_commit();
        commit.parents = vec![];
        let decoded = Commit::decode(&commit.encode()).unwrap();
        assert_eq!(decoded.parents, vec![]);
    }

    #[test]
    fn test_commit_summary() {
        assert_eq!(sample_commit().summary(), "initial commit");
    }

    #[test]
    fn test_block_round_trip() {
        let block = Block::new(vec![
            vec!["1".to_owned(), "q".to_owned(), "".to_owned()],
            vec!["2".to_owned(), "a".to_owned(), "s".to_owned()],
        ]);
        let mut enc = StrListEncoder::new();
        let decoded = Block::decode(&block.encode(&mut enc)).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_block_rejects_ragged_rows() {
        let mut enc = StrListEncoder::new();
        let mut bytes = vec![2u8];
        bytes.extend_from_slice(enc.encode(&["a", "b"]));
        bytes.extend_from_slice(enc.encode(&["c"]));
        assert_matches!(Block::decode(&bytes), Err(DecodeError::Parse { .. }));
    }

    #[test]
    fn test_table_round_trip() {
        let mut table = Table::new(
            vec!["a".to_owned(), "b".to_owned(), "c".to_owned()],
            vec![0, 2],
            300,
        );
        table.blocks = vec![
            BlockId::new(hash_bytes(b"b1")),
            BlockId::new(hash_bytes(b"b2")),
        ];
        table.block_indices = vec![
            BlockIndexId::new(hash_bytes(b"i1")),
            BlockIndexId::new(hash_bytes(b"i2")),
        ];
        let mut enc = StrListEncoder::new();
        let decoded = Table::decode(&table.encode(&mut enc)).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.primary_key(), vec!["a", "c"]);
    }

    #[test]
    fn test_table_validation() {
        let mut enc = StrListEncoder::new();
        let mut table = Table::new(vec!["a".to_owned()], vec![1], 1);
        table.blocks = vec![BlockId::new([1; 16])];
        table.block_indices = vec![BlockIndexId::new([2; 16])];
        let bytes = table.encode(&mut enc);
        assert_matches!(Table::decode(&bytes), Err(DecodeError::Parse { .. }));

        let mut table = Table::new(vec!["a".to_owned(), "b".to_owned()], vec![0, 0], 1);
        table.blocks = vec![BlockId::new([1; 16])];
        table.block_indices = vec![BlockIndexId::new([2; 16])];
        let bytes = table.encode(&mut enc);
        assert_matches!(Table::decode(&bytes), Err(DecodeError::Parse { .. }));
    }

    #[test]
    fn test_blocks_count() {
        assert_eq!(blocks_count(0), 0);
        assert_eq!(blocks_count(1), 1);
        assert_eq!(blocks_count(255), 1);
        assert_eq!(blocks_count(256), 2);
        assert_eq!(blocks_count(700), 3);
    }

    #[test]
    fn test_pk_sum_empty_key_hashes_whole_row() {
        let mut enc = StrListEncoder::new();
        let row = vec!["x".to_owned(), "y".to_owned()];
        assert_eq!(pk_sum(&mut enc, &row, &[]), row_sum(&mut enc, &row));
        assert_ne!(pk_sum(&mut enc, &row, &[0]), row_sum(&mut enc, &row));
    }

    #[test]
    fn test_tz_round_trip() {
        for offset in [0, 60, -300, 330, -765] {
            let ts = Timestamp {
                seconds: 0,
                tz_offset: offset,
            };
            assert_eq!(Timestamp::parse_tz(&ts.tz_string()), Some(offset));
        }
    }
}
