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

//! External sort of CSV rows by primary-key digest.
//!
//! Rows stream into an in-memory run; when the run exceeds the configured
//! byte budget it is sorted and spilled to a temp file. Draining merges all
//! runs and yields 255-row chunks in globally sorted order. Rows with equal
//! key digests collapse to the most recently read one, so re-uploading a
//! row overwrites it.

use std::fs::File;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Read;
use std::io::Seek as _;
use std::io::Write as _;

use tracing::instrument;

use crate::content_hash::HashSum;
use crate::encoding::DecodeError;
use crate::encoding::Parser;
use crate::encoding::StrListEncoder;
use crate::ingest::CancelToken;
use crate::ingest::IngestError;
use crate::objects::BLOCK_SIZE;
use crate::objects::Row;
use crate::objects::pk_sum;

/// Default in-memory run budget, in bytes of cell data.
pub const DEFAULT_RUN_SIZE: u64 = 64 << 20;

pub struct Sorter {
    run_size: u64,
    current: Vec<(HashSum, Row)>,
    current_bytes: u64,
    runs: Vec<File>,
    enc: StrListEncoder,
    pub columns: Vec<String>,
    pub pk: Vec<u32>,
}

/// A chunk of rows ready to become one block. `offset` is the block's
/// position in the table; `first_pk` holds the primary-key cells of its
/// first row for the table index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortedBlock {
    pub offset: usize,
    pub rows: Vec<Row>,
    pub first_pk: Vec<String>,
}

impl Sorter {
    pub fn new(run_size: u64) -> Self {
        Self {
            run_size: run_size.max(1),
            current: Vec::new(),
            current_bytes: 0,
            runs: Vec::new(),
            enc: StrListEncoder::new(),
            columns: Vec::new(),
            pk: Vec::new(),
        }
    }

    /// Parses `reader` as CSV (gzip-compressed input is detected from its
    /// magic bytes), resolves `pk_names` against the header, and sorts all
    /// rows. Must be called exactly once before [`Sorter::sorted_blocks`].
    #[instrument(skip_all)]
    pub fn sort_csv(
        &mut self,
        reader: impl Read,
        pk_names: &[&str],
        cancel: &CancelToken,
    ) -> Result<(), IngestError> {
        let reader = maybe_gunzip(reader)?;
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut records = csv_reader.records();
        let header = match records.next() {
            Some(record) => record.map_err(csv_err)?,
            None => {
                return Err(IngestError::Csv {
                    line: 1,
                    column: 0,
                    message: "empty input: no header row".to_owned(),
                });
            }
        };
        self.columns = header.iter().map(str::to_owned).collect();
        self.pk = resolve_pk(&self.columns, pk_names)?;

        for (i, record) in records.enumerate() {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }
            let record = record.map_err(csv_err)?;
            if record.len() != self.columns.len() {
                return Err(IngestError::Csv {
                    // header is line 1
                    line: i as u64 + 2,
                    column: record.len() as u64,
                    message: format!(
                        "wrong number of fields: expected {}, found {}",
                        self.columns.len(),
                        record.len(),
                    ),
                });
            }
            let row: Row = record.iter().map(str::to_owned).collect();
            self.push_row(row)?;
        }
        Ok(())
    }

    /// Feeds one pre-parsed row. Callers constructing tables from rows
    /// (merge results, transactions) set `columns` and `pk` themselves.
    pub fn add_row(&mut self, row: Row) -> Result<(), IngestError> {
        self.push_row(row)
    }

    fn push_row(&mut self, row: Row) -> Result<(), IngestError> {
        self.current_bytes += row.iter().map(|cell| cell.len() as u64 + 8).sum::<u64>();
        let sum = pk_sum(&mut self.enc, &row, &self.pk);
        self.current.push((sum, row));
        if self.current_bytes >= self.run_size {
            self.spill()?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    fn spill(&mut self) -> Result<(), IngestError> {
        sort_run(&mut self.current);
        let mut file = tempfile::tempfile()?;
        {
            let mut writer = BufWriter::new(&mut file);
            for (sum, row) in self.current.drain(..) {
                writer.write_all(&sum)?;
                writer.write_all(self.enc.encode(&row))?;
            }
            writer.flush()?;
        }
        file.rewind()?;
        self.runs.push(file);
        self.current_bytes = 0;
        Ok(())
    }

    /// Drains the sorter into an iterator of sorted row chunks.
    pub fn sorted_blocks(mut self) -> Result<SortedBlocks, IngestError> {
        sort_run(&mut self.current);
        let mut cursors = Vec::with_capacity(self.runs.len() + 1);
        for file in self.runs {
            let mut cursor = RunCursor::Spilled {
                parser: Parser::new(BufReader::new(file)),
                next: None,
            };
            cursor.advance()?;
            cursors.push(cursor);
        }
        let mut cursor = RunCursor::Memory {
            rows: self.current.into_iter(),
            next: None,
        };
        cursor.advance()?;
        cursors.push(cursor);
        Ok(SortedBlocks {
            cursors,
            pk: self.pk,
            next_offset: 0,
        })
    }
}

// Stable, so later duplicates of a key stay behind earlier ones and the
// dedup pass below can keep the last.
fn sort_run(run: &mut [(HashSum, Row)]) {
    run.sort_by(|(a, _), (b, _)| a.cmp(b));
}

enum RunCursor {
    Spilled {
        parser: Parser<BufReader<File>>,
        next: Option<(HashSum, Row)>,
    },
    Memory {
        rows: std::vec::IntoIter<(HashSum, Row)>,
        next: Option<(HashSum, Row)>,
    },
}

impl RunCursor {
    fn peek(&self) -> Option<&(HashSum, Row)> {
        match self {
            Self::Spilled { next, .. } | Self::Memory { next, .. } => next.as_ref(),
        }
    }

    fn advance(&mut self) -> Result<(), IngestError> {
        match self {
            Self::Spilled { parser, next } => {
                let record_start = parser.pos();
                match parser.read_sum() {
                    Ok(sum) => {
                        let row = parser
                            .read_str_list()
                            .map_err(|err| IngestError::Io(decode_to_io(err)))?;
                        *next = Some((sum, row));
                    }
                    Err(DecodeError::Eof { pos }) if pos == record_start => *next = None,
                    Err(err) => return Err(IngestError::Io(decode_to_io(err))),
                }
            }
            Self::Memory { rows, next } => *next = rows.next(),
        }
        Ok(())
    }

    fn take(&mut self) -> Result<Option<(HashSum, Row)>, IngestError> {
        let taken = match self {
            Self::Spilled { next, .. } | Self::Memory { next, .. } => next.take(),
        };
        if taken.is_some() {
            self.advance()?;
        }
        Ok(taken)
    }
}

fn decode_to_io(err: DecodeError) -> std::io::Error {
    std::io::Error::other(err)
}

/// Merging iterator over all runs. The last cursor holds the most recently
/// read rows, and for equal key digests a higher cursor index wins.
pub struct SortedBlocks {
    cursors: Vec<RunCursor>,
    pk: Vec<u32>,
    next_offset: usize,
}

impl SortedBlocks {
    fn next_row(&mut self) -> Result<Option<(HashSum, Row)>, IngestError> {
        let min_sum = self
            .cursors
            .iter()
            .filter_map(|cursor| cursor.peek().map(|(sum, _)| *sum))
            .min();
        let Some(min_sum) = min_sum else {
            return Ok(None);
        };
        let mut winner = None;
        for cursor in &mut self.cursors {
            while cursor.peek().is_some_and(|(sum, _)| *sum == min_sum) {
                winner = cursor.take()?;
            }
        }
        Ok(winner)
    }

    pub fn next_block(&mut self) -> Result<Option<SortedBlock>, IngestError> {
        let mut rows = Vec::new();
        while rows.len() < BLOCK_SIZE {
            match self.next_row()? {
                Some((_, row)) => rows.push(row),
                None => break,
            }
        }
        if rows.is_empty() {
            return Ok(None);
        }
        let first_pk = self
            .pk
            .iter()
            .map(|&i| rows[0][i as usize].clone())
            .collect();
        let offset = self.next_offset;
        self.next_offset += 1;
        Ok(Some(SortedBlock {
            offset,
            rows,
            first_pk,
        }))
    }
}

fn resolve_pk(columns: &[String], pk_names: &[&str]) -> Result<Vec<u32>, IngestError> {
    pk_names
        .iter()
        .map(|name| {
            columns
                .iter()
                .position(|column| column == name)
                .map(|i| i as u32)
                .ok_or_else(|| IngestError::Pk((*name).to_owned()))
        })
        .collect()
}

fn csv_err(err: csv::Error) -> IngestError {
    let (line, column) = match err.position() {
        Some(position) => (position.line(), position.byte()),
        None => (0, 0),
    };
    IngestError::Csv {
        line,
        column,
        message: err.to_string(),
    }
}

// Sniffs the gzip magic and transparently decompresses when present.
fn maybe_gunzip<'a>(mut reader: impl Read + 'a) -> std::io::Result<Box<dyn Read + 'a>> {
    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < 2 {
        let count = reader.read(&mut magic[filled..])?;
        if count == 0 {
            break;
        }
        filled += count;
    }
    let head = std::io::Cursor::new(magic[..filled].to_vec());
    let chained = head.chain(reader);
    if magic == [0x1f, 0x8b] {
        Ok(Box::new(flate2::read::GzDecoder::new(chained)))
    } else {
        Ok(Box::new(chained))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use assert_matches::assert_matches;

    use super::*;

    fn drain(mut blocks: SortedBlocks) -> Vec<SortedBlock> {
        let mut out = Vec::new();
        while let Some(block) = blocks.next_block().unwrap() {
            out.push(block);
        }
        out
    }

    fn sort_all(csv: &str, pk: &[&str], run_size: u64) -> (Vec<String>, Vec<SortedBlock>) {
        let mut sorter = Sorter::new(run_size);
        sorter
            .sort_csv(csv.as_bytes(), pk, &CancelToken::new())
            .unwrap();
        let columns = sorter.columns.clone();
        (columns, drain(sorter.sorted_blocks().unwrap()))
    }

    #[test]
    fn test_sorted_by_key_digest() {
        let (columns, blocks) = sort_all("a,b\n1,q\n2,a\n3,z\n", &["a"], DEFAULT_RUN_SIZE);
        assert_eq!(columns, vec!["a", "b"]);
        assert_eq!(blocks.len(), 1);
        let block = &blocks[0];
        assert_eq!(block.rows.len(), 3);
        let mut enc = StrListEncoder::new();
        let sums: Vec<HashSum> = block
            .rows
            .iter()
            .map(|row| pk_sum(&mut enc, row, &[0]))
            .collect();
        let mut sorted = sums.clone();
        sorted.sort();
        assert_eq!(sums, sorted);
        assert_eq!(block.first_pk, vec![block.rows[0][0].clone()]);
    }

    #[test]
    fn test_spill_and_merge() {
        let mut csv = String::from("a,b\n");
        for i in 0..1000 {
            csv.push_str(&format!("{i},{}\n", i * 7));
        }
        // Tiny run budget forces many spills.
        let (_, blocks) = sort_all(&csv, &["a"], 256);
        let total: usize = blocks.iter().map(|b| b.rows.len()).sum();
        assert_eq!(total, 1000);
        assert_eq!(blocks.len(), 4);
        assert!(blocks[..3].iter().all(|b| b.rows.len() == BLOCK_SIZE));
        // Offsets are dense and ordered
        for (i, block) in blocks.iter().enumerate() {
            assert_eq!(block.offset, i);
        }
        // Globally sorted across block boundaries
        let mut enc = StrListEncoder::new();
        let sums: Vec<HashSum> = blocks
            .iter()
            .flat_map(|b| b.rows.iter())
            .map(|row| pk_sum(&mut enc, row, &[0]))
            .collect();
        let mut sorted = sums.clone();
        sorted.sort();
        assert_eq!(sums, sorted);
    }

    #[test]
    fn test_duplicate_key_keeps_last_row() {
        let (_, blocks) = sort_all("a,b\n1,old\n2,x\n1,new\n", &["a"], DEFAULT_RUN_SIZE);
        let rows: Vec<&Row> = blocks.iter().flat_map(|b| b.rows.iter()).collect();
        assert_eq!(rows.len(), 2);
        let one = rows.iter().find(|row| row[0] == "1").unwrap();
        assert_eq!(one[1], "new");
    }

    #[test]
    fn test_duplicate_key_across_runs() {
        let mut csv = String::from("a,b\n");
        for i in 0..300 {
            csv.push_str(&format!("{i},first\n"));
        }
        for i in 0..300 {
            csv.push_str(&format!("{i},second\n"));
        }
        let (_, blocks) = sort_all(&csv, &["a"], 512);
        let rows: Vec<&Row> = blocks.iter().flat_map(|b| b.rows.iter()).collect();
        assert_eq!(rows.len(), 300);
        assert!(rows.iter().all(|row| row[1] == "second"));
    }

    #[test]
    fn test_arity_mismatch() {
        let mut sorter = Sorter::new(DEFAULT_RUN_SIZE);
        let err = sorter
            .sort_csv("a,b\n1,q\n2\n".as_bytes(), &["a"], &CancelToken::new())
            .unwrap_err();
        assert_matches!(err, IngestError::Csv { line: 3, .. });
    }

    #[test]
    fn test_unknown_pk_column() {
        let mut sorter = Sorter::new(DEFAULT_RUN_SIZE);
        let err = sorter
            .sort_csv("a,b\n1,q\n".as_bytes(), &["missing"], &CancelToken::new())
            .unwrap_err();
        assert_matches!(err, IngestError::Pk(name) if name == "missing");
    }

    #[test]
    fn test_gzip_input() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"a,b\n1,q\n2,a\n").unwrap();
        let compressed = encoder.finish().unwrap();
        let mut sorter = Sorter::new(DEFAULT_RUN_SIZE);
        sorter
            .sort_csv(&compressed[..], &["a"], &CancelToken::new())
            .unwrap();
        let blocks = drain(sorter.sorted_blocks().unwrap());
        assert_eq!(blocks[0].rows.len(), 2);
    }

    #[test]
    fn test_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut sorter = Sorter::new(DEFAULT_RUN_SIZE);
        let err = sorter
            .sort_csv("a,b\n1,q\n".as_bytes(), &["a"], &cancel)
            .unwrap_err();
        assert_matches!(err, IngestError::Cancelled);
    }
}
