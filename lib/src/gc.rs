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

//! Garbage collection: mark from every ref and reflog-retained tip, then
//! sweep unreachable commits, tables, blocks and indices. Objects written
//! by aborted ingests or partial fetches are reclaimed here; nothing
//! reachable from a ref is ever touched.

use std::collections::HashSet;

use thiserror::Error;
use tracing::info;
use tracing::instrument;

use crate::dag_walk;
use crate::objects::BlockId;
use crate::objects::BlockIndexId;
use crate::objects::CommitId;
use crate::objects::TableId;
use crate::refs::RefError;
use crate::refs::RefStore;
use crate::refs::list_all_refs;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum GcError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ref(#[from] RefError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct GcStats {
    pub commits_removed: usize,
    pub tables_removed: usize,
    pub blocks_removed: usize,
    pub block_indices_removed: usize,
}

/// Removes every object unreachable from any ref or reflog entry.
#[instrument(skip_all)]
pub fn collect_garbage(store: &ObjectStore, refs: &RefStore) -> Result<GcStats, GcError> {
    // Mark phase: ref values plus everything their reflogs ever pointed
    // at, then the full reachable closure.
    let mut tips: Vec<CommitId> = list_all_refs(refs)?.into_values().collect();
    for name in refs.filter_keys("")? {
        for entry in refs.read_log(&name)? {
            tips.push(entry.new_oid);
            if let Some(old) = entry.old_oid {
                tips.push(old);
            }
        }
    }
    let live_commits = dag_walk::reachable(store, &tips)?;

    let mut live_tables: HashSet<TableId> = HashSet::new();
    let mut live_blocks: HashSet<BlockId> = HashSet::new();
    let mut live_block_indices: HashSet<BlockIndexId> = HashSet::new();
    for id in &live_commits {
        let commit = store.get_commit(id)?;
        match store.get_table(&commit.table) {
            Ok(table) => {
                live_tables.insert(commit.table);
                live_blocks.extend(table.blocks.iter().copied());
                live_block_indices.extend(table.block_indices.iter().copied());
            }
            // Shallow commit: nothing further to mark.
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err.into()),
        }
    }

    // Sweep phase.
    let mut stats = GcStats::default();
    for id in store.list_commits()? {
        if !live_commits.contains(&id) {
            store.delete_commit(&id)?;
            stats.commits_removed += 1;
        }
    }
    for id in store.list_tables()? {
        if !live_tables.contains(&id) {
            store.delete_table(&id)?;
            stats.tables_removed += 1;
        }
    }
    for id in store.list_table_indices()? {
        if !live_tables.contains(&id) {
            store.delete_table_index(&id)?;
        }
    }
    for id in store.list_blocks()? {
        if !live_blocks.contains(&id) {
            store.delete_block(&id)?;
            stats.blocks_removed += 1;
        }
    }
    for id in store.list_block_indices()? {
        if !live_block_indices.contains(&id) {
            store.delete_block_index(&id)?;
            stats.block_indices_removed += 1;
        }
    }
    info!(
        commits = stats.commits_removed,
        tables = stats.tables_removed,
        blocks = stats.blocks_removed,
        "garbage collected"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refs::save_ref;
    use testutils::create_random_commit;
    use testutils::new_object_store;
    use testutils::new_ref_store;

    #[test]
    fn test_unreachable_objects_removed() {
        let (_d1, store) = new_object_store();
        let (_d2, refs) = new_ref_store();
        let (kept, _) = create_random_commit(&store, 3, 30, &[]);
        let (dropped, _) = create_random_commit(&store, 3, 30, &[]);
        save_ref(&refs, "heads/main", &kept, "a", "a@b.c", "commit", "m").unwrap();

        let stats = collect_garbage(&store, &refs).unwrap();
        assert_eq!(stats.commits_removed, 1);
        assert_eq!(stats.tables_removed, 1);
        assert!(stats.blocks_removed >= 1);
        assert!(!store.commit_exists(&dropped));

        let commit = store.get_commit(&kept).unwrap();
        assert!(store.commit_is_complete(&commit));
        assert!(store.table_index_exists(&commit.table));
    }

    #[test]
    fn test_reflog_retains_old_tips() {
        let (_d1, store) = new_object_store();
        let (_d2, refs) = new_ref_store();
        let (old_tip, _) = create_random_commit(&store, 3, 10, &[]);
        let (new_tip, _) = create_random_commit(&store, 3, 10, &[]);
        save_ref(&refs, "heads/main", &old_tip, "a", "a@b.c", "commit", "one").unwrap();
        // Not a descendant; the old tip stays reachable only via the log.
        save_ref(&refs, "heads/main", &new_tip, "a", "a@b.c", "reset", "two").unwrap();

        let stats = collect_garbage(&store, &refs).unwrap();
        assert_eq!(stats.commits_removed, 0);
        assert!(store.commit_exists(&old_tip));
        assert!(store.commit_exists(&new_tip));
    }

    #[test]
    fn test_shared_blocks_survive() {
        let (_d1, store) = new_object_store();
        let (_d2, refs) = new_ref_store();
        let (c1, commit1) = create_random_commit(&store, 3, 10, &[]);
        // A second commit over the same table
        let (_, _) = testutils::save_commit(&store, commit1.table, &[c1]);
        save_ref(&refs, "heads/main", &c1, "a", "a@b.c", "commit", "m").unwrap();

        let stats = collect_garbage(&store, &refs).unwrap();
        // The child commit is unreachable, but the shared table survives.
        assert_eq!(stats.commits_removed, 1);
        assert_eq!(stats.tables_removed, 0);
        assert_eq!(stats.blocks_removed, 0);
    }
}
