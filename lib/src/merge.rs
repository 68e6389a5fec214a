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

//! Three-way merge of two table versions against a common base.
//!
//! Rows are matched by primary-key digest across base and both sides; each
//! cell resolves independently. A cell is clean when both sides agree or
//! only one of them changed it; everything else lands in the row's
//! unresolved column set. A merge commit can only be created once every
//! row's unresolved set is empty.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::instrument;

use crate::config::FastForward;
use crate::content_hash::HashSum;
use crate::dag_walk;
use crate::encoding::StrListEncoder;
use crate::ingest::IngestError;
use crate::ingest::IngestOptions;
use crate::ingest::ingest_table_from_blocks;
use crate::objects::Commit;
use crate::objects::CommitId;
use crate::objects::Row;
use crate::objects::Table;
use crate::objects::TableId;
use crate::objects::Timestamp;
use crate::objects::pk_sum;
use crate::sorter::Sorter;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("refusing to merge unrelated histories")]
    NoCommonAncestor,
    #[error("primary keys differ between the merged versions")]
    PkMismatch,
    #[error("cannot fast-forward and merge.fastForward is \"only\"")]
    NotFastForward,
    #[error("merge left {0} rows with conflicts")]
    Unresolved(usize),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// The merge of one row. `resolved_row` is `None` when the row is removed;
/// `unresolved_cols` holds indices into the merged column list for cells
/// that need manual resolution (the row carries the base value there as a
/// placeholder, or an empty cell when the row has no base).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowMerge {
    pub pk: HashSum,
    pub resolved_row: Option<Row>,
    pub unresolved_cols: BTreeSet<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// Union of both sides' columns: left side order first, then the right
    /// side's extras.
    pub columns: Vec<String>,
    /// Primary-key indices into `columns`.
    pub pk: Vec<u32>,
    /// All surviving and removed rows, key-digest ascending.
    pub rows: Vec<RowMerge>,
}

impl MergeResult {
    pub fn conflicted_rows(&self) -> usize {
        self.rows
            .iter()
            .filter(|row| !row.unresolved_cols.is_empty())
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.conflicted_rows() == 0
    }
}

/// Cell-level three-way resolution: `Some(value)` when the conflict is
/// trivial, `None` when both sides changed the cell to different values.
fn trivial_merge<'a>(
    a: Option<&'a str>,
    base: Option<&'a str>,
    b: Option<&'a str>,
) -> Option<Option<&'a str>> {
    if a == b {
        Some(a)
    } else if a == base {
        Some(b)
    } else if b == base {
        Some(a)
    } else {
        None
    }
}

// Maps each merged column to the matching column of one input table, by
// name.
fn column_mapping(merged: &[String], table: &Table) -> Vec<Option<usize>> {
    merged
        .iter()
        .map(|name| table.columns.iter().position(|column| column == name))
        .collect()
}

fn cell<'a>(row: Option<&'a Row>, mapping: &[Option<usize>], col: usize) -> Option<&'a str> {
    let row = row?;
    let idx = mapping[col]?;
    Some(row[idx].as_str())
}

/// Streams one table's rows in key-digest order.
struct RowCursor<'a> {
    store: &'a ObjectStore,
    table: &'a Table,
    enc: StrListEncoder,
    block_idx: usize,
    rows: Vec<(HashSum, Row)>,
    row_idx: usize,
}

impl<'a> RowCursor<'a> {
    fn new(store: &'a ObjectStore, table: &'a Table) -> Self {
        Self {
            store,
            table,
            enc: StrListEncoder::new(),
            block_idx: 0,
            rows: Vec::new(),
            row_idx: 0,
        }
    }

    fn peek(&mut self) -> Result<Option<&(HashSum, Row)>, MergeError> {
        while self.row_idx >= self.rows.len() {
            if self.block_idx >= self.table.blocks.len() {
                return Ok(None);
            }
            let block = self.store.get_block(&self.table.blocks[self.block_idx])?;
            self.block_idx += 1;
            let pk = &self.table.pk;
            self.rows = block
                .rows
                .into_iter()
                .map(|row| (pk_sum(&mut self.enc, &row, pk), row))
                .collect();
            // Blocks are stored sorted by key digest already.
            self.rows.sort_by(|(a, _), (b, _)| a.cmp(b));
            self.row_idx = 0;
        }
        Ok(Some(&self.rows[self.row_idx]))
    }

    fn take_if(&mut self, key: &HashSum) -> Result<Option<Row>, MergeError> {
        match self.peek()? {
            Some((pk, _)) if pk == key => {
                let (_, row) = std::mem::take(&mut self.rows[self.row_idx]);
                self.row_idx += 1;
                Ok(Some(row))
            }
            _ => Ok(None),
        }
    }
}

/// Merges `a_table` and `b_table` against their common base `base_table`.
/// All three must share primary-key column names.
#[instrument(skip_all)]
pub fn merge_tables(
    store: &ObjectStore,
    base_table: &Table,
    a_table: &Table,
    b_table: &Table,
) -> Result<MergeResult, MergeError> {
    if a_table.primary_key() != b_table.primary_key() {
        return Err(MergeError::PkMismatch);
    }
    let mut columns = a_table.columns.clone();
    for column in &b_table.columns {
        if !columns.contains(column) {
            columns.push(column.clone());
        }
    }
    let pk: Vec<u32> = a_table
        .primary_key()
        .iter()
        .map(|name| columns.iter().position(|c| c == name).unwrap() as u32)
        .collect();
    let base_map = column_mapping(&columns, base_table);
    let a_map = column_mapping(&columns, a_table);
    let b_map = column_mapping(&columns, b_table);

    let mut base_rows = RowCursor::new(store, base_table);
    let mut a_rows = RowCursor::new(store, a_table);
    let mut b_rows = RowCursor::new(store, b_table);
    let mut rows = Vec::new();
    loop {
        let next_key = [
            base_rows.peek()?.map(|(pk, _)| *pk),
            a_rows.peek()?.map(|(pk, _)| *pk),
            b_rows.peek()?.map(|(pk, _)| *pk),
        ]
        .into_iter()
        .flatten()
        .min();
        let Some(key) = next_key else {
            break;
        };
        let base = base_rows.take_if(&key)?;
        let a = a_rows.take_if(&key)?;
        let b = b_rows.take_if(&key)?;
        rows.push(merge_row(
            key,
            base.as_ref(),
            a.as_ref(),
            b.as_ref(),
            &columns,
            &base_map,
            &a_map,
            &b_map,
        ));
    }
    Ok(MergeResult { columns, pk, rows })
}

#[allow(clippy::too_many_arguments)]
fn merge_row(
    key: HashSum,
    base: Option<&Row>,
    a: Option<&Row>,
    b: Option<&Row>,
    columns: &[String],
    base_map: &[Option<usize>],
    a_map: &[Option<usize>],
    b_map: &[Option<usize>],
) -> RowMerge {
    let changed = |side: Option<&Row>, side_map: &[Option<usize>]| {
        (0..columns.len()).any(|col| cell(side, side_map, col) != cell(base, base_map, col))
    };
    // A row disappears only when both sides deleted it, or one side deleted
    // it and the other left it untouched. Deleting while the other side
    // modified keeps the row: the deleter abstains cell by cell below and
    // the modifier's values win.
    let removed = match (a, b) {
        (None, None) => true,
        (None, Some(_)) => base.is_some() && !changed(b, b_map),
        (Some(_), None) => base.is_some() && !changed(a, a_map),
        (Some(_), Some(_)) => false,
    };
    if removed {
        return RowMerge {
            pk: key,
            resolved_row: None,
            unresolved_cols: BTreeSet::new(),
        };
    }

    let mut resolved = Vec::with_capacity(columns.len());
    let mut unresolved = BTreeSet::new();
    for col in 0..columns.len() {
        let base_value = cell(base, base_map, col);
        // A side that deleted the row, or lacks the column, did not touch
        // the cell.
        let a_value = match a {
            Some(_) if a_map[col].is_some() => cell(a, a_map, col),
            _ => base_value,
        };
        let b_value = match b {
            Some(_) if b_map[col].is_some() => cell(b, b_map, col),
            _ => base_value,
        };
        match trivial_merge(a_value, base_value, b_value) {
            Some(value) => {
                resolved.push(value.unwrap_or("").to_owned());
            }
            None => {
                unresolved.insert(col as u32);
                // The base value stands in until the cell is resolved;
                // with no base the cell starts out empty.
                resolved.push(base_value.unwrap_or("").to_owned());
            }
        }
    }
    RowMerge {
        pk: key,
        resolved_row: Some(resolved),
        unresolved_cols: unresolved,
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// One head already contained the other; no new commit was created.
    FastForward(CommitId),
    /// A merge commit was created.
    Commit(CommitId),
    /// The row merge left conflicts; nothing was committed.
    Conflicts(MergeResult),
}

/// Merges commit `theirs` into `ours`, creating a merge commit when rows
/// resolve cleanly.
#[instrument(skip(store, author_name, author_email))]
pub fn merge_commits(
    store: &ObjectStore,
    ours: &CommitId,
    theirs: &CommitId,
    fast_forward: FastForward,
    author_name: &str,
    author_email: &str,
) -> Result<MergeOutcome, MergeError> {
    let base = dag_walk::merge_base(store, ours, theirs)?.ok_or(MergeError::NoCommonAncestor)?;
    if fast_forward != FastForward::Never {
        if base == *theirs {
            return Ok(MergeOutcome::FastForward(*ours));
        }
        if base == *ours {
            return Ok(MergeOutcome::FastForward(*theirs));
        }
    }
    if fast_forward == FastForward::Only {
        return Err(MergeError::NotFastForward);
    }

    let base_commit = store.get_commit(&base)?;
    let our_commit = store.get_commit(ours)?;
    let their_commit = store.get_commit(theirs)?;
    let base_table = store.get_table(&base_commit.table)?;
    let our_table = store.get_table(&our_commit.table)?;
    let their_table = store.get_table(&their_commit.table)?;

    let result = merge_tables(store, &base_table, &our_table, &their_table)?;
    if !result.is_clean() {
        return Ok(MergeOutcome::Conflicts(result));
    }
    let table = save_merged_table(store, &result)?;
    let commit = Commit {
        table,
        author_name: author_name.to_owned(),
        author_email: author_email.to_owned(),
        message: format!("Merge commit {theirs:.7} into {ours:.7}"),
        time: Timestamp::now(),
        parents: vec![*ours, *theirs],
    };
    let id = store.save_commit(&commit.encode())?;
    Ok(MergeOutcome::Commit(id))
}

/// Persists a clean merge result as a new table.
pub fn save_merged_table(
    store: &ObjectStore,
    result: &MergeResult,
) -> Result<TableId, MergeError> {
    if !result.is_clean() {
        return Err(MergeError::Unresolved(result.conflicted_rows()));
    }
    let mut sorter = Sorter::new(crate::sorter::DEFAULT_RUN_SIZE);
    sorter.columns = result.columns.clone();
    sorter.pk = result.pk.clone();
    for row in &result.rows {
        if let Some(resolved) = &row.resolved_row {
            sorter.add_row(resolved.clone())?;
        }
    }
    let blocks = sorter.sorted_blocks()?;
    let table = ingest_table_from_blocks(
        store,
        result.columns.clone(),
        result.pk.clone(),
        blocks,
        &IngestOptions::default(),
    )?;
    Ok(table)
}
