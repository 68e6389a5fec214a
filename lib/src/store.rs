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

//! Content-addressed object storage.
//!
//! Two backends compose under the repository directory: large immutable
//! payloads (blocks, block indices, tables, table indices) live as files at
//! `objects/<kind>/<hex[0:2]>/<hex[2:32]>`, written through a temp file and
//! an atomic rename; commits live in an embedded KV database so history
//! scans do not touch thousands of small files.

use std::fs;
use std::fs::File;
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use redb::ReadableTable as _;
use redb::TableDefinition;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::block_index::BlockIndex;
use crate::content_hash::HashSum;
use crate::content_hash::hash_bytes;
use crate::encoding::DecodeError;
use crate::object_id::ObjectId;
use crate::objects::Block;
use crate::objects::BlockId;
use crate::objects::BlockIndexId;
use crate::objects::Commit;
use crate::objects::CommitId;
use crate::objects::Table;
use crate::objects::TableId;

const COMMITS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("commits");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{object_type} {hash} not found")]
    NotFound { object_type: String, hash: String },
    #[error("corrupt {object_type} {hash}")]
    Corrupt {
        object_type: String,
        hash: String,
        #[source]
        source: DecodeError,
    },
    #[error("error accessing {object_type} {hash}")]
    Io {
        object_type: String,
        hash: String,
        #[source]
        source: std::io::Error,
    },
    #[error("storage error")]
    Storage(#[source] std::io::Error),
    #[error("kv engine error")]
    Kv(#[source] Box<redb::Error>),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn map_not_found_err(err: std::io::Error, id: &impl ObjectId) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound {
            object_type: id.object_type(),
            hash: id.hex(),
        }
    } else {
        StoreError::Io {
            object_type: id.object_type(),
            hash: id.hex(),
            source: err,
        }
    }
}

fn kv_err(err: impl Into<redb::Error>) -> StoreError {
    StoreError::Kv(Box::new(err.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Block,
    BlockIndex,
    Table,
    TableIndex,
}

impl Kind {
    fn dir(self) -> &'static str {
        match self {
            Self::Block => "blocks",
            Self::BlockIndex => "blockindices",
            Self::Table => "tables",
            Self::TableIndex => "tableindices",
        }
    }
}

/// The content-addressed store rooted at a repository's `.wrgl` directory.
///
/// Safe for concurrent readers and writers: file saves go through a temp
/// file and rename, and identical content maps to identical keys, so racing
/// writers of the same object are benign.
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
    kv: redb::Database,
}

impl ObjectStore {
    /// Creates the storage layout under `root` and opens it.
    pub fn init(root: &Path) -> StoreResult<Self> {
        for kind in [Kind::Block, Kind::BlockIndex, Kind::Table, Kind::TableIndex] {
            fs::create_dir_all(root.join("objects").join(kind.dir()))
                .map_err(StoreError::Storage)?;
        }
        let store = Self::load(root)?;
        // Make sure the commits table exists so readers never race its
        // creation.
        let tx = store.kv.begin_write().map_err(kv_err)?;
        tx.open_table(COMMITS).map_err(kv_err)?;
        tx.commit().map_err(kv_err)?;
        Ok(store)
    }

    pub fn load(root: &Path) -> StoreResult<Self> {
        let kv = redb::Database::create(root.join("kv.redb")).map_err(kv_err)?;
        Ok(Self {
            root: root.to_path_buf(),
            kv,
        })
    }

    fn object_path(&self, kind: Kind, sum: &HashSum) -> PathBuf {
        let hex = hex::encode(sum);
        self.root
            .join("objects")
            .join(kind.dir())
            .join(&hex[..2])
            .join(&hex[2..])
    }

    fn save_file(&self, kind: Kind, sum: &HashSum, payload: &[u8]) -> StoreResult<()> {
        let path = self.object_path(kind, sum);
        if path.exists() {
            // Content-addressed: identical key means identical bytes.
            return Ok(());
        }
        let dir = path.parent().unwrap();
        fs::create_dir_all(dir).map_err(StoreError::Storage)?;
        let mut temp_file = NamedTempFile::new_in(dir).map_err(StoreError::Storage)?;
        temp_file.write_all(payload).map_err(StoreError::Storage)?;
        temp_file.as_file().sync_data().map_err(StoreError::Storage)?;
        match temp_file.persist(&path) {
            Ok(_) => Ok(()),
            // A racing writer beat us to it with the same content.
            Err(_) if path.exists() => Ok(()),
            Err(err) => Err(StoreError::Storage(err.error)),
        }
    }

    fn get_file(&self, kind: Kind, id: &impl ObjectId) -> StoreResult<Vec<u8>> {
        let sum: HashSum = id.as_bytes().try_into().unwrap();
        let path = self.object_path(kind, &sum);
        let mut file = File::open(path).map_err(|err| map_not_found_err(err, id))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|err| map_not_found_err(err, id))?;
        Ok(buf)
    }

    fn file_exists(&self, kind: Kind, sum: &HashSum) -> bool {
        self.object_path(kind, sum).exists()
    }

    fn delete_file(&self, kind: Kind, id: &impl ObjectId) -> StoreResult<()> {
        let sum: HashSum = id.as_bytes().try_into().unwrap();
        fs::remove_file(self.object_path(kind, &sum))
            .map_err(|err| map_not_found_err(err, id))
    }

    fn list_files(&self, kind: Kind) -> StoreResult<Vec<HashSum>> {
        let dir = self.root.join("objects").join(kind.dir());
        let mut sums = Vec::new();
        for prefix_entry in dir.read_dir().map_err(StoreError::Storage)? {
            let prefix_entry = prefix_entry.map_err(StoreError::Storage)?;
            let prefix = prefix_entry.file_name();
            if !prefix_entry.path().is_dir() {
                continue;
            }
            for entry in prefix_entry.path().read_dir().map_err(StoreError::Storage)? {
                let entry = entry.map_err(StoreError::Storage)?;
                let mut hex = prefix.to_string_lossy().into_owned();
                hex.push_str(&entry.file_name().to_string_lossy());
                if let Some(sum) = crate::object_id::sum_from_hex(&hex) {
                    sums.push(sum);
                }
            }
        }
        sums.sort();
        Ok(sums)
    }

    // Blocks

    pub fn save_block(&self, payload: &[u8]) -> StoreResult<BlockId> {
        let id = BlockId::new(hash_bytes(payload));
        self.save_file(Kind::Block, &id.sum(), payload)?;
        Ok(id)
    }

    pub fn get_block_bytes(&self, id: &BlockId) -> StoreResult<Vec<u8>> {
        self.get_file(Kind::Block, id)
    }

    pub fn get_block(&self, id: &BlockId) -> StoreResult<Block> {
        let bytes = self.get_block_bytes(id)?;
        Block::decode(&bytes).map_err(|source| StoreError::Corrupt {
            object_type: id.object_type(),
            hash: id.hex(),
            source,
        })
    }

    pub fn block_exists(&self, id: &BlockId) -> bool {
        self.file_exists(Kind::Block, &id.sum())
    }

    pub fn delete_block(&self, id: &BlockId) -> StoreResult<()> {
        self.delete_file(Kind::Block, id)
    }

    pub fn list_blocks(&self) -> StoreResult<Vec<BlockId>> {
        Ok(self.list_files(Kind::Block)?.into_iter().map(BlockId::new).collect())
    }

    // Block indices

    pub fn save_block_index(&self, payload: &[u8]) -> StoreResult<BlockIndexId> {
        let id = BlockIndexId::new(hash_bytes(payload));
        self.save_file(Kind::BlockIndex, &id.sum(), payload)?;
        Ok(id)
    }

    pub fn get_block_index(&self, id: &BlockIndexId) -> StoreResult<BlockIndex> {
        let bytes = self.get_file(Kind::BlockIndex, id)?;
        BlockIndex::decode(&bytes).map_err(|source| StoreError::Corrupt {
            object_type: id.object_type(),
            hash: id.hex(),
            source,
        })
    }

    pub fn block_index_exists(&self, id: &BlockIndexId) -> bool {
        self.file_exists(Kind::BlockIndex, &id.sum())
    }

    pub fn delete_block_index(&self, id: &BlockIndexId) -> StoreResult<()> {
        self.delete_file(Kind::BlockIndex, id)
    }

    pub fn list_block_indices(&self) -> StoreResult<Vec<BlockIndexId>> {
        Ok(self
            .list_files(Kind::BlockIndex)?
            .into_iter()
            .map(BlockIndexId::new)
            .collect())
    }

    // Tables

    pub fn save_table(&self, payload: &[u8]) -> StoreResult<TableId> {
        let id = TableId::new(hash_bytes(payload));
        self.save_file(Kind::Table, &id.sum(), payload)?;
        Ok(id)
    }

    pub fn get_table_bytes(&self, id: &TableId) -> StoreResult<Vec<u8>> {
        self.get_file(Kind::Table, id)
    }

    pub fn get_table(&self, id: &TableId) -> StoreResult<Table> {
        let bytes = self.get_table_bytes(id)?;
        Table::decode(&bytes).map_err(|source| StoreError::Corrupt {
            object_type: id.object_type(),
            hash: id.hex(),
            source,
        })
    }

    pub fn table_exists(&self, id: &TableId) -> bool {
        self.file_exists(Kind::Table, &id.sum())
    }

    pub fn delete_table(&self, id: &TableId) -> StoreResult<()> {
        self.delete_file(Kind::Table, id)
    }

    pub fn list_tables(&self) -> StoreResult<Vec<TableId>> {
        Ok(self.list_files(Kind::Table)?.into_iter().map(TableId::new).collect())
    }

    // Table indices, keyed by the table they belong to.

    pub fn save_table_index(&self, table: &TableId, payload: &[u8]) -> StoreResult<()> {
        self.save_file(Kind::TableIndex, &table.sum(), payload)
    }

    pub fn get_table_index(&self, table: &TableId) -> StoreResult<Block> {
        let bytes = self.get_file(Kind::TableIndex, table)?;
        Block::decode(&bytes).map_err(|source| StoreError::Corrupt {
            object_type: "tableindex".to_owned(),
            hash: table.hex(),
            source,
        })
    }

    pub fn table_index_exists(&self, table: &TableId) -> bool {
        self.file_exists(Kind::TableIndex, &table.sum())
    }

    pub fn delete_table_index(&self, table: &TableId) -> StoreResult<()> {
        self.delete_file(Kind::TableIndex, table)
    }

    /// Ids of the tables that have a stored table index.
    pub fn list_table_indices(&self) -> StoreResult<Vec<TableId>> {
        Ok(self
            .list_files(Kind::TableIndex)?
            .into_iter()
            .map(TableId::new)
            .collect())
    }

    // Commits

    pub fn save_commit(&self, payload: &[u8]) -> StoreResult<CommitId> {
        let id = CommitId::new(hash_bytes(payload));
        let tx = self.kv.begin_write().map_err(kv_err)?;
        {
            let mut table = tx.open_table(COMMITS).map_err(kv_err)?;
            table
                .insert(id.as_bytes(), payload)
                .map_err(kv_err)?;
        }
        tx.commit().map_err(kv_err)?;
        Ok(id)
    }

    pub fn get_commit_bytes(&self, id: &CommitId) -> StoreResult<Vec<u8>> {
        let tx = self.kv.begin_read().map_err(kv_err)?;
        let table = tx.open_table(COMMITS).map_err(kv_err)?;
        let value = table.get(id.as_bytes()).map_err(kv_err)?;
        match value {
            Some(guard) => Ok(guard.value().to_vec()),
            None => Err(StoreError::NotFound {
                object_type: id.object_type(),
                hash: id.hex(),
            }),
        }
    }

    pub fn get_commit(&self, id: &CommitId) -> StoreResult<Commit> {
        let bytes = self.get_commit_bytes(id)?;
        Commit::decode(&bytes).map_err(|source| StoreError::Corrupt {
            object_type: id.object_type(),
            hash: id.hex(),
            source,
        })
    }

    pub fn commit_exists(&self, id: &CommitId) -> bool {
        self.get_commit_bytes(id).is_ok()
    }

    pub fn delete_commit(&self, id: &CommitId) -> StoreResult<()> {
        let tx = self.kv.begin_write().map_err(kv_err)?;
        {
            let mut table = tx.open_table(COMMITS).map_err(kv_err)?;
            table.remove(id.as_bytes()).map_err(kv_err)?;
        }
        tx.commit().map_err(kv_err)?;
        Ok(())
    }

    pub fn list_commits(&self) -> StoreResult<Vec<CommitId>> {
        let tx = self.kv.begin_read().map_err(kv_err)?;
        let table = tx.open_table(COMMITS).map_err(kv_err)?;
        let mut ids = Vec::new();
        for entry in table.iter().map_err(kv_err)? {
            let (key, _) = entry.map_err(kv_err)?;
            if let Some(id) = CommitId::try_from_bytes(key.value()) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Whether all of a table's blocks and block indices are present.
    pub fn table_is_complete(&self, table: &Table) -> bool {
        table.blocks.iter().all(|id| self.block_exists(id))
            && table
                .block_indices
                .iter()
                .all(|id| self.block_index_exists(id))
    }

    /// Whether a commit's table and all its payload objects are present.
    /// A commit failing this check is shallow.
    pub fn commit_is_complete(&self, commit: &Commit) -> bool {
        match self.get_table(&commit.table) {
            Ok(table) => self.table_is_complete(&table),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::encoding::StrListEncoder;
    use crate::objects::Timestamp;

    fn new_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::init(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_save_block() {
        let (_dir, store) = new_store();
        let block = Block::new(vec![vec!["1".to_owned(), "q".to_owned()]]);
        let mut enc = StrListEncoder::new();
        let payload = block.encode(&mut enc);

        let id = store.save_block(&payload).unwrap();
        assert!(store.block_exists(&id));
        assert_eq!(store.get_block(&id).unwrap(), block);
        // Idempotent
        assert_eq!(store.save_block(&payload).unwrap(), id);
        assert_eq!(store.list_blocks().unwrap(), vec![id]);

        store.delete_block(&id).unwrap();
        assert!(!store.block_exists(&id));
        assert_matches!(store.get_block(&id), Err(StoreError::NotFound { .. }));
    }

    #[test]
    fn test_key_matches_content_hash() {
        let (_dir, store) = new_store();
        let payload = b"\x01\x00\x00\x00\x01\x00\x00\x00\x01a".to_vec();
        let id = store.save_block(&payload).unwrap();
        assert_eq!(id.sum(), hash_bytes(&payload));
        assert_eq!(hash_bytes(&store.get_block_bytes(&id).unwrap()), id.sum());
    }

    #[test]
    fn test_save_commit() {
        let (_dir, store) = new_store();
        let commit = Commit {
            table: TableId::new(hash_bytes(b"t")),
            author_name: "a".to_owned(),
            author_email: "a@b.c".to_owned(),
            message: "m".to_owned(),
            time: Timestamp {
                seconds: 1,
                tz_offset: 0,
            },
            parents: vec![],
        };
        let id = store.save_commit(&commit.encode()).unwrap();
        assert!(store.commit_exists(&id));
        assert_eq!(store.get_commit(&id).unwrap(), commit);
        assert_eq!(store.list_commits().unwrap(), vec![id]);
        store.delete_commit(&id).unwrap();
        assert!(!store.commit_exists(&id));
    }

    #[test]
    fn test_corrupt_block() {
        let (_dir, store) = new_store();
        // A one-column block with a truncated row
        let id = store.save_block(b"\x01\x00\x00\x00\x01\x00\x00").unwrap();
        assert_matches!(store.get_block(&id), Err(StoreError::Corrupt { .. }));
    }

    #[test]
    fn test_table_index_keyed_by_table() {
        let (_dir, store) = new_store();
        let table_id = TableId::new(hash_bytes(b"some table"));
        let mut enc = StrListEncoder::new();
        let index = Block::new(vec![vec!["1".to_owned()]]).encode(&mut enc);
        store.save_table_index(&table_id, &index).unwrap();
        assert!(store.table_index_exists(&table_id));
        assert_eq!(store.get_table_index(&table_id).unwrap().rows.len(), 1);
        store.delete_table_index(&table_id).unwrap();
        assert!(!store.table_index_exists(&table_id));
    }

    #[test]
    fn test_reload_preserves_objects(){
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ObjectStore::init(dir.path()).unwrap();
            store.save_commit(b"table 00000000000000000000000000000000\nauthorName a\nauthorEmail b\ntime 0 +0000\nmessage m\n").unwrap()
        };
        let store = ObjectStore::load(dir.path()).unwrap();
        assert!(store.commit_exists(&id));
    }
}
