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

//! Assembles packfiles from a set of commits to send.
//!
//! Objects the peer already holds (anything referenced by the common
//! commits) are excluded. Within the stream, a table's missing blocks come
//! before the table, tables before the commits. Output is chunked at the
//! configured packfile size; each call to [`ObjectSender::write_objects`]
//! emits one chunk and reports whether more remain.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::encoding::StrListEncoder;
use crate::objects::BlockId;
use crate::objects::Commit;
use crate::objects::CommitId;
use crate::objects::TableId;
use crate::packfile::ObjectType;
use crate::packfile::PackfileWriter;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum SendError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cannot write packfile")]
    Io(#[from] std::io::Error),
}

enum QueuedObject {
    /// Block payloads are fetched lazily so a chunked send does not hold
    /// every block in memory.
    Block(BlockId),
    Inline(ObjectType, Vec<u8>),
}

pub struct ObjectSender {
    store: Arc<ObjectStore>,
    commits: VecDeque<Commit>,
    tables: VecDeque<TableId>,
    objs: VecDeque<QueuedObject>,
    common_tables: HashSet<TableId>,
    common_blocks: HashSet<BlockId>,
    max_packfile_size: u64,
}

fn common_tables(
    store: &ObjectStore,
    common_commits: &HashSet<CommitId>,
) -> Result<HashSet<TableId>, SendError> {
    let mut tables = HashSet::new();
    for id in common_commits {
        let commit = store.get_commit(id)?;
        tables.insert(commit.table);
    }
    Ok(tables)
}

fn common_blocks(
    store: &ObjectStore,
    tables: &HashSet<TableId>,
) -> Result<HashSet<BlockId>, SendError> {
    let mut blocks = HashSet::new();
    for id in tables {
        match store.get_table(id) {
            Ok(table) => blocks.extend(table.blocks),
            // The table of a shallow common commit is fine to skip; the
            // peer cannot be assumed to have it either way.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(blocks)
}

impl ObjectSender {
    pub fn new(
        store: Arc<ObjectStore>,
        to_send: Vec<(CommitId, Commit)>,
        common_commits: &HashSet<CommitId>,
        max_packfile_size: u64,
    ) -> Result<Self, SendError> {
        let mut tables = VecDeque::new();
        let mut seen_tables = HashSet::new();
        for (_, commit) in &to_send {
            if seen_tables.insert(commit.table) {
                tables.push_back(commit.table);
            }
        }
        let common_tables = common_tables(&store, common_commits)?;
        let common_blocks = common_blocks(&store, &common_tables)?;
        let mut sender = Self {
            store,
            commits: to_send.into_iter().map(|(_, commit)| commit).collect(),
            tables,
            objs: VecDeque::new(),
            common_tables,
            common_blocks,
            max_packfile_size: max_packfile_size.max(1),
        };
        sender.enqueue_front_table()?;
        Ok(sender)
    }

    // Pops tables until one is not already common, then queues its missing
    // blocks followed by the table object itself.
    fn enqueue_front_table(&mut self) -> Result<(), SendError> {
        let mut next = None;
        while let Some(id) = self.tables.pop_front() {
            if self.common_tables.insert(id) {
                next = Some(id);
                break;
            }
        }
        let Some(id) = next else {
            return Ok(());
        };
        let table = match self.store.get_table(&id) {
            Ok(table) => table,
            // Shallow commit: no table to send.
            Err(err) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for block in &table.blocks {
            if self.common_blocks.insert(*block) {
                self.objs.push_back(QueuedObject::Block(*block));
            }
        }
        let mut enc = StrListEncoder::new();
        self.objs
            .push_back(QueuedObject::Inline(ObjectType::Table, table.encode(&mut enc)));
        Ok(())
    }

    fn enqueue_all_commits(&mut self) {
        while let Some(commit) = self.commits.pop_front() {
            self.objs
                .push_back(QueuedObject::Inline(ObjectType::Commit, commit.encode()));
        }
    }

    /// Writes one packfile chunk. Returns `true` when everything has been
    /// sent; `false` means call again for the next chunk.
    pub fn write_objects<W: Write>(&mut self, writer: W) -> Result<bool, SendError> {
        let mut pack = PackfileWriter::new(writer)?;
        let mut size = 0u64;
        while let Some(obj) = self.objs.pop_front() {
            let written = match obj {
                QueuedObject::Block(id) => {
                    let payload = self.store.get_block_bytes(&id)?;
                    pack.write_object(ObjectType::Block, &payload)?
                }
                QueuedObject::Inline(typ, payload) => pack.write_object(typ, &payload)?,
            };
            size += written as u64;
            if self.objs.is_empty() {
                if !self.tables.is_empty() {
                    self.enqueue_front_table()?;
                } else if !self.commits.is_empty() {
                    self.enqueue_all_commits();
                }
            }
            if size >= self.max_packfile_size {
                break;
            }
        }
        let done = self.objs.is_empty() && self.commits.is_empty();
        debug!(size, done, "wrote packfile chunk");
        Ok(done)
    }
}
