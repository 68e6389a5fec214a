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

//! Parses packfile streams and persists their objects.
//!
//! Blocks and commits are stored as-is; a table additionally gets its
//! block indices and table index rebuilt locally, since packs do not carry
//! index objects. After the stream ends, received commits whose tables or
//! blocks are absent are reported shallow; a later depth-unlimited fetch
//! completes them.

use thiserror::Error;
use tracing::debug;

use crate::ingest::IngestError;
use crate::ingest::index_table;
use crate::objects::Commit;
use crate::objects::CommitId;
use crate::objects::Table;
use crate::packfile::ObjectType;
use crate::packfile::PackfileError;
use crate::packfile::PackfileReader;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Protocol(#[from] PackfileError),
    #[error("received corrupt {object_type}: {message}")]
    CorruptObject {
        object_type: &'static str,
        message: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
}

/// What a packfile stream contained once persisted.
#[derive(Debug, Default)]
pub struct ReceiveSummary {
    /// Received commits, in stream order.
    pub commits: Vec<CommitId>,
    /// Subset of `commits` whose table payloads are still missing.
    pub shallow: Vec<CommitId>,
}

/// Reads every object from `reader` (one packfile or several concatenated
/// ones) and persists them.
pub fn receive_objects(
    store: &ObjectStore,
    reader: impl std::io::Read,
) -> Result<ReceiveSummary, ReceiveError> {
    let mut pack = PackfileReader::new(reader)?;
    let mut summary = ReceiveSummary::default();
    while let Some((typ, payload)) = pack.read_object()? {
        match typ {
            ObjectType::Block => {
                store.save_block(&payload)?;
            }
            ObjectType::Table => {
                let table = Table::decode(&payload).map_err(|err| {
                    ReceiveError::CorruptObject {
                        object_type: "table",
                        message: err.to_string(),
                    }
                })?;
                let id = store.save_table(&payload)?;
                if store.table_is_complete(&table) {
                    index_table(store, &id, &table)?;
                }
            }
            ObjectType::Commit => {
                let commit = Commit::decode(&payload).map_err(|err| {
                    ReceiveError::CorruptObject {
                        object_type: "commit",
                        message: err.to_string(),
                    }
                })?;
                let id = store.save_commit(&payload)?;
                if !store.commit_is_complete(&commit) {
                    summary.shallow.push(id);
                }
                summary.commits.push(id);
            }
        }
    }
    debug!(
        commits = summary.commits.len(),
        shallow = summary.shallow.len(),
        "received objects"
    );
    Ok(summary)
}
