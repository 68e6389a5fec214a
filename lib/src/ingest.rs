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

//! Turns a CSV stream into a persisted table.
//!
//! The pipeline: sort rows by primary-key digest, chunk into blocks, fan
//! blocks out to worker threads that persist block + block index, then
//! assemble and persist the table manifest and table index. If anything
//! fails mid-way, already-written objects stay behind (GC reclaims them)
//! and no table manifest is persisted.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::bounded;
use thiserror::Error;
use tracing::debug;
use tracing::instrument;

use crate::block_index::BlockIndex;
use crate::encoding::StrListEncoder;
use crate::objects::Block;
use crate::objects::BlockId;
use crate::objects::BlockIndexId;
use crate::objects::Row;
use crate::objects::Table;
use crate::objects::TableId;
use crate::sorter::SortedBlock;
use crate::sorter::Sorter;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("csv error at line {line}, column {column}: {message}")]
    Csv {
        line: u64,
        column: u64,
        message: String,
    },
    #[error("unknown primary key column {0:?}")]
    Pk(String),
    #[error("ingest cancelled")]
    Cancelled,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Cooperative cancellation flag shared between an ingest caller and its
/// worker threads. Workers finish their in-flight write and stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct IngestOptions {
    /// Byte budget of one in-memory sort run before it spills to disk.
    pub run_size: u64,
    /// Number of block-persisting worker threads, at least 1.
    pub num_workers: usize,
    pub cancel: CancelToken,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            run_size: crate::sorter::DEFAULT_RUN_SIZE,
            num_workers: 4,
            cancel: CancelToken::new(),
        }
    }
}

/// Rebuilds and persists the block indices and table index for a table
/// whose blocks are already present, verifying that each index id matches
/// the manifest. Used after receiving a table over the wire, since packs
/// carry only commits, tables and blocks.
pub fn index_table(
    store: &ObjectStore,
    table_id: &TableId,
    table: &Table,
) -> Result<(), IngestError> {
    let mut enc = StrListEncoder::new();
    let mut index_rows = Vec::with_capacity(table.blocks.len());
    for (i, block_id) in table.blocks.iter().enumerate() {
        let block = store.get_block(block_id)?;
        index_rows.push(
            table
                .pk
                .iter()
                .map(|&col| block.rows[0][col as usize].clone())
                .collect::<Row>(),
        );
        let index = BlockIndex::build(&mut enc, &block, &table.pk);
        let index_id = store.save_block_index(&index.encode())?;
        if index_id != table.block_indices[i] {
            return Err(IngestError::Io(std::io::Error::other(format!(
                "block index at offset {i} has different sum: {index_id} != {}",
                table.block_indices[i],
            ))));
        }
    }
    let index_bytes = Block::new(index_rows).encode(&mut enc);
    store.save_table_index(table_id, &index_bytes)?;
    Ok(())
}

struct PersistedBlock {
    offset: usize,
    rows_count: u32,
    block: BlockId,
    block_index: BlockIndexId,
    first_pk: Vec<String>,
}

/// Ingests `reader` as a new table keyed by the `pk_names` columns and
/// returns the persisted table's id.
#[instrument(skip(store, reader, options))]
pub fn ingest_table(
    store: &ObjectStore,
    reader: impl std::io::Read,
    pk_names: &[&str],
    options: &IngestOptions,
) -> Result<TableId, IngestError> {
    let mut sorter = Sorter::new(options.run_size);
    sorter.sort_csv(reader, pk_names, &options.cancel)?;
    let columns = sorter.columns.clone();
    let pk = sorter.pk.clone();
    let blocks = sorter.sorted_blocks()?;
    ingest_table_from_blocks(store, columns, pk, blocks, options)
}

/// Persists pre-sorted blocks as a table. Split from [`ingest_table`] so
/// merge-commit creation can reuse the worker pipeline.
pub fn ingest_table_from_blocks(
    store: &ObjectStore,
    columns: Vec<String>,
    pk: Vec<u32>,
    mut blocks: crate::sorter::SortedBlocks,
    options: &IngestOptions,
) -> Result<TableId, IngestError> {
    let num_workers = options.num_workers.max(1);
    let cancel = &options.cancel;
    let (block_tx, block_rx) = bounded::<SortedBlock>(num_workers * 2);
    let (done_tx, done_rx) = bounded::<Result<PersistedBlock, IngestError>>(num_workers * 2);

    let persisted = std::thread::scope(|scope| -> Result<Vec<PersistedBlock>, IngestError> {
        for _ in 0..num_workers {
            let block_rx = block_rx.clone();
            let done_tx = done_tx.clone();
            let pk = pk.clone();
            scope.spawn(move || persist_blocks(store, &pk, &block_rx, &done_tx));
        }
        drop(block_rx);
        drop(done_tx);

        let producer = scope.spawn(move || -> Result<(), IngestError> {
            loop {
                if cancel.is_cancelled() {
                    return Err(IngestError::Cancelled);
                }
                match blocks.next_block()? {
                    Some(block) => {
                        // Workers stopped on an error; the collector below
                        // reports it.
                        if block_tx.send(block).is_err() {
                            return Ok(());
                        }
                    }
                    None => return Ok(()),
                }
            }
        });

        let mut persisted = Vec::new();
        let mut first_err = None;
        for result in done_rx {
            match result {
                Ok(block) => persisted.push(block),
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                    cancel.cancel();
                }
            }
        }
        let produce_result = producer.join().expect("producer thread panicked");
        if let Some(err) = first_err {
            return Err(err);
        }
        produce_result?;
        Ok(persisted)
    })?;
    if cancel.is_cancelled() {
        return Err(IngestError::Cancelled);
    }

    let mut table = assemble_table(columns, pk, persisted);
    let mut enc = StrListEncoder::new();
    let table_index = std::mem::take(&mut table.index_rows);
    let table_id = store.save_table(&table.manifest.encode(&mut enc))?;
    let index_bytes = Block::new(table_index).encode(&mut enc);
    store.save_table_index(&table_id, &index_bytes)?;
    debug!(table = %table_id, rows = table.manifest.rows_count, "ingested table");
    Ok(table_id)
}

struct AssembledTable {
    manifest: Table,
    index_rows: Vec<Row>,
}

fn assemble_table(
    columns: Vec<String>,
    pk: Vec<u32>,
    mut persisted: Vec<PersistedBlock>,
) -> AssembledTable {
    persisted.sort_by_key(|block| block.offset);
    let rows_count = persisted.iter().map(|block| block.rows_count).sum();
    let manifest = Table {
        columns,
        pk,
        rows_count,
        blocks: persisted.iter().map(|block| block.block).collect(),
        block_indices: persisted.iter().map(|block| block.block_index).collect(),
    };
    let index_rows = persisted.into_iter().map(|block| block.first_pk).collect();
    AssembledTable {
        manifest,
        index_rows,
    }
}

fn persist_blocks(
    store: &ObjectStore,
    pk: &[u32],
    blocks: &Receiver<SortedBlock>,
    done: &Sender<Result<PersistedBlock, IngestError>>,
) {
    let mut enc = StrListEncoder::new();
    for sorted in blocks {
        let result = persist_one(store, pk, &mut enc, sorted);
        let failed = result.is_err();
        if done.send(result).is_err() || failed {
            return;
        }
    }
}

fn persist_one(
    store: &ObjectStore,
    pk: &[u32],
    enc: &mut StrListEncoder,
    sorted: SortedBlock,
) -> Result<PersistedBlock, IngestError> {
    let rows_count = sorted.rows.len() as u32;
    let block = Block::new(sorted.rows);
    let block_id = store.save_block(&block.encode(enc))?;
    let index = BlockIndex::build(enc, &block, pk);
    let index_id = store.save_block_index(&index.encode())?;
    Ok(PersistedBlock {
        offset: sorted.offset,
        rows_count,
        block: block_id,
        block_index: index_id,
        first_pk: sorted.first_pk,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::objects::blocks_count;
    use testutils::new_object_store;

    #[test]
    fn test_ingest_small_table() {
        let (_dir, store) = new_object_store();
        let table_id = ingest_table(
            &store,
            "a,b,c\n1,q,w\n2,a,s\n3,z,x\n".as_bytes(),
            &["a"],
            &IngestOptions::default(),
        )
        .unwrap();
        let table = store.get_table(&table_id).unwrap();
        assert_eq!(table.columns, vec!["a", "b", "c"]);
        assert_eq!(table.pk, vec![0]);
        assert_eq!(table.rows_count, 3);
        assert_eq!(table.blocks.len(), 1);
        let block = store.get_block(&table.blocks[0]).unwrap();
        assert_eq!(block.rows.len(), 3);
        // Every row is found at its indexed offset
        let index = store.get_block_index(&table.block_indices[0]).unwrap();
        let mut enc = StrListEncoder::new();
        for (offset, row) in block.rows.iter().enumerate() {
            let sum = crate::objects::pk_sum(&mut enc, row, &table.pk);
            assert_eq!(index.lookup(&sum), Some(offset as u32));
        }
        // Table index holds one row per block
        let table_index = store.get_table_index(&table_id).unwrap();
        assert_eq!(table_index.rows.len(), 1);
        assert_eq!(table_index.rows[0], vec![block.rows[0][0].clone()]);
    }

    #[test]
    fn test_ingest_is_deterministic() {
        let (_dir, store) = new_object_store();
        let csv = "a,b\n3,x\n1,y\n2,z\n";
        let options = IngestOptions::default();
        let id1 = ingest_table(&store, csv.as_bytes(), &["a"], &options).unwrap();
        let id2 = ingest_table(&store, csv.as_bytes(), &["a"], &options).unwrap();
        assert_eq!(id1, id2);
        let t1 = store.get_table(&id1).unwrap();
        let t2 = store.get_table(&id2).unwrap();
        assert_eq!(t1.blocks, t2.blocks);
    }

    #[test]
    fn test_ingest_many_blocks() {
        let (_dir, store) = new_object_store();
        let mut csv = String::from("a,b\n");
        for i in 0..700 {
            csv.push_str(&format!("{i},{}\n", i * 3));
        }
        let options = IngestOptions {
            run_size: 1024,
            num_workers: 3,
            ..Default::default()
        };
        let table_id = ingest_table(&store, csv.as_bytes(), &["a"], &options).unwrap();
        let table = store.get_table(&table_id).unwrap();
        assert_eq!(table.rows_count, 700);
        assert_eq!(table.blocks.len(), blocks_count(700));
        assert!(store.table_is_complete(&table));
    }

    #[test]
    fn test_cancelled_ingest_leaves_no_manifest() {
        let (_dir, store) = new_object_store();
        let cancel = CancelToken::new();
        cancel.cancel();
        let options = IngestOptions {
            cancel,
            ..Default::default()
        };
        let err = ingest_table(&store, "a,b\n1,q\n".as_bytes(), &["a"], &options).unwrap_err();
        assert_matches!(err, IngestError::Cancelled);
        assert!(store.list_tables().unwrap().is_empty());
    }

    #[test]
    fn test_empty_table() {
        let (_dir, store) = new_object_store();
        let table_id = ingest_table(
            &store,
            "a,b\n".as_bytes(),
            &["a"],
            &IngestOptions::default(),
        )
        .unwrap();
        let table = store.get_table(&table_id).unwrap();
        assert_eq!(table.rows_count, 0);
        assert!(table.blocks.is_empty());
    }
}
