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

//! Row-level diff between two table versions.
//!
//! Column events come first: columns added, columns removed, then a
//! primary-key change, which stops row diffing (row identity is gone).
//! Rows are merge-joined in key-digest order; blocks with identical ids
//! are skipped wholesale. Events are emitted in key-digest ascending
//! order, which keeps the output stable.

use std::sync::Arc;
use std::sync::mpsc;

use itertools::Itertools as _;
use thiserror::Error;

use crate::content_hash::HashSum;
use crate::encoding::StrListEncoder;
use crate::objects::Block;
use crate::objects::Row;
use crate::objects::Table;
use crate::objects::TableId;
use crate::objects::pk_sum;
use crate::objects::row_sum;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Where a row lives in its table, plus its content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLocation {
    pub sum: HashSum,
    /// Block position in the table.
    pub block: u32,
    /// Row offset within the block.
    pub offset: u32,
}

/// One changed row. `new` is absent for deletions, `old` for insertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowDiff {
    pub pk: HashSum,
    pub new: Option<RowLocation>,
    pub old: Option<RowLocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffEvent {
    /// Columns present only in the new side, in its column order.
    ColumnAdd { columns: Vec<String> },
    /// Columns present only in the old side, in its column order.
    ColumnRem { columns: Vec<String> },
    /// Primary-key definitions differ; carries the old side's key columns.
    PkChange { columns: Vec<String> },
    Row(RowDiff),
}

impl RowDiff {
    /// The same event seen from the opposite direction.
    pub fn inverted(self) -> Self {
        Self {
            pk: self.pk,
            new: self.old,
            old: self.new,
        }
    }
}

/// Streams rows of one table in key-digest order.
struct TableRows<'a> {
    store: &'a ObjectStore,
    table: &'a Table,
    enc: StrListEncoder,
    block_idx: usize,
    // (digest, row offset) pairs of the current block, sorted, with the
    // decoded block itself
    entries: Vec<(HashSum, u32)>,
    block: Option<Block>,
    entry_idx: usize,
}

impl<'a> TableRows<'a> {
    fn new(store: &'a ObjectStore, table: &'a Table) -> Self {
        Self {
            store,
            table,
            enc: StrListEncoder::new(),
            block_idx: 0,
            entries: Vec::new(),
            block: None,
            entry_idx: 0,
        }
    }

    /// Id of the block the cursor is about to enter, when at a block
    /// boundary.
    fn pending_block(&self) -> Option<usize> {
        (self.block.is_none() && self.block_idx < self.table.blocks.len())
            .then_some(self.block_idx)
    }

    fn skip_pending_block(&mut self) {
        debug_assert!(self.block.is_none());
        self.block_idx += 1;
    }

    fn load_block(&mut self) -> Result<(), DiffError> {
        let index = self
            .store
            .get_block_index(&self.table.block_indices[self.block_idx])?;
        self.entries = index.entries().map(|(sum, offset)| (*sum, offset)).collect();
        self.block = Some(self.store.get_block(&self.table.blocks[self.block_idx])?);
        self.entry_idx = 0;
        Ok(())
    }

    fn peek(&mut self) -> Result<Option<(HashSum, RowLocation)>, DiffError> {
        loop {
            if self.block.is_none() {
                if self.block_idx >= self.table.blocks.len() {
                    return Ok(None);
                }
                self.load_block()?;
            }
            if self.entry_idx < self.entries.len() {
                let (pk, offset) = self.entries[self.entry_idx];
                let block = self.block.as_ref().unwrap();
                let sum = row_sum(&mut self.enc, &block.rows[offset as usize]);
                return Ok(Some((
                    pk,
                    RowLocation {
                        sum,
                        block: self.block_idx as u32,
                        offset,
                    },
                )));
            }
            self.block = None;
            self.block_idx += 1;
        }
    }

    fn bump(&mut self) {
        self.entry_idx += 1;
    }
}

/// Compares `new_table` against `old_table` and returns all events, in
/// order. See [`diff_tables_streamed`] for the channel-based form.
pub fn diff_tables(
    new_store: &ObjectStore,
    new_table: &Table,
    old_store: &ObjectStore,
    old_table: &Table,
) -> Result<Vec<DiffEvent>, DiffError> {
    let mut events = Vec::new();
    diff_column_events(new_table, old_table, &mut |event| events.push(event));
    if pk_changed(new_table, old_table) {
        events.push(DiffEvent::PkChange {
            columns: old_table
                .primary_key()
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        });
        return Ok(events);
    }
    diff_rows(new_store, new_table, old_store, old_table, &mut |event| {
        events.push(event);
    })?;
    Ok(events)
}

/// Channel-streaming variant: a producer thread walks both tables and the
/// receiver can be drained concurrently.
pub fn diff_tables_streamed(
    new_store: Arc<ObjectStore>,
    new_table: TableId,
    old_store: Arc<ObjectStore>,
    old_table: TableId,
) -> mpsc::Receiver<Result<DiffEvent, DiffError>> {
    let (tx, rx) = mpsc::sync_channel(1024);
    std::thread::spawn(move || {
        let run = || -> Result<(), DiffError> {
            let new_table = new_store.get_table(&new_table)?;
            let old_table = old_store.get_table(&old_table)?;
            let mut send = |event: DiffEvent| {
                // Receiver hung up; stop producing.
                tx.send(Ok(event)).ok();
            };
            diff_column_events(&new_table, &old_table, &mut send);
            if pk_changed(&new_table, &old_table) {
                send(DiffEvent::PkChange {
                    columns: old_table
                        .primary_key()
                        .iter()
                        .map(|s| (*s).to_owned())
                        .collect(),
                });
                return Ok(());
            }
            diff_rows(&new_store, &new_table, &old_store, &old_table, &mut send)
        };
        if let Err(err) = run() {
            tx.send(Err(err)).ok();
        }
    });
    rx
}

fn diff_column_events(
    new_table: &Table,
    old_table: &Table,
    emit: &mut impl FnMut(DiffEvent),
) {
    let added = new_table
        .columns
        .iter()
        .filter(|column| !old_table.columns.contains(column))
        .cloned()
        .collect_vec();
    if !added.is_empty() {
        emit(DiffEvent::ColumnAdd { columns: added });
    }
    let removed = old_table
        .columns
        .iter()
        .filter(|column| !new_table.columns.contains(column))
        .cloned()
        .collect_vec();
    if !removed.is_empty() {
        emit(DiffEvent::ColumnRem { columns: removed });
    }
}

// Key definitions are compared as ordered column-name lists, so moving a
// key column to another position in the table does not count as a change.
fn pk_changed(new_table: &Table, old_table: &Table) -> bool {
    new_table.primary_key() != old_table.primary_key()
}

fn diff_rows(
    new_store: &ObjectStore,
    new_table: &Table,
    old_store: &ObjectStore,
    old_table: &Table,
    emit: &mut impl FnMut(DiffEvent),
) -> Result<(), DiffError> {
    let mut new_rows = TableRows::new(new_store, new_table);
    let mut old_rows = TableRows::new(old_store, old_table);
    loop {
        // Identical blocks at both cursors contain identical rows.
        if let (Some(i), Some(j)) = (new_rows.pending_block(), old_rows.pending_block()) {
            if new_table.blocks[i] == old_table.blocks[j] {
                new_rows.skip_pending_block();
                old_rows.skip_pending_block();
                continue;
            }
        }
        match (new_rows.peek()?, old_rows.peek()?) {
            (None, None) => return Ok(()),
            (Some((pk, new)), None) => {
                new_rows.bump();
                emit(DiffEvent::Row(RowDiff {
                    pk,
                    new: Some(new),
                    old: None,
                }));
            }
            (None, Some((pk, old))) => {
                old_rows.bump();
                emit(DiffEvent::Row(RowDiff {
                    pk,
                    new: None,
                    old: Some(old),
                }));
            }
            (Some((new_pk, new)), Some((old_pk, old))) => {
                if new_pk < old_pk {
                    new_rows.bump();
                    emit(DiffEvent::Row(RowDiff {
                        pk: new_pk,
                        new: Some(new),
                        old: None,
                    }));
                } else if old_pk < new_pk {
                    old_rows.bump();
                    emit(DiffEvent::Row(RowDiff {
                        pk: old_pk,
                        new: None,
                        old: Some(old),
                    }));
                } else {
                    new_rows.bump();
                    old_rows.bump();
                    if new.sum != old.sum {
                        emit(DiffEvent::Row(RowDiff {
                            pk: new_pk,
                            new: Some(new),
                            old: Some(old),
                        }));
                    }
                }
            }
        }
    }
}

/// Reads the row a [`RowLocation`] points to.
pub fn read_row(
    store: &ObjectStore,
    table: &Table,
    location: &RowLocation,
) -> Result<Row, DiffError> {
    let block = store.get_block(&table.blocks[location.block as usize])?;
    Ok(block.rows[location.offset as usize].clone())
}

/// Finds a row by its primary-key cell values, binary-searching the table
/// index for the right block and the block index for the offset.
pub fn find_row(
    store: &ObjectStore,
    table_id: &TableId,
    table: &Table,
    pk_values: &[String],
) -> Result<Option<Row>, DiffError> {
    if table.blocks.is_empty() {
        return Ok(None);
    }
    let mut enc = StrListEncoder::new();
    let target = pk_sum(&mut enc, pk_values, &[]);
    let table_index = store.get_table_index(table_id)?;
    // First block whose first-row key is beyond the target, minus one.
    let mut lo = 0usize;
    let mut hi = table_index.rows.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        let first = pk_sum(&mut enc, &table_index.rows[mid], &[]);
        if first <= target {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let Some(block_idx) = lo.checked_sub(1) else {
        return Ok(None);
    };
    let index = store.get_block_index(&table.block_indices[block_idx])?;
    let Some(offset) = index.lookup(&target) else {
        return Ok(None);
    };
    let block = store.get_block(&table.blocks[block_idx])?;
    Ok(Some(block.rows[offset as usize].clone()))
}
