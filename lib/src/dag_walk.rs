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

//! Traversals over the commit DAG.
//!
//! The graph can be deep, so everything here is an explicit queue plus a
//! visited set. Commits referenced but not present locally (shallow
//! boundaries) terminate their branch of the walk instead of failing.

use std::collections::HashSet;
use std::collections::VecDeque;

use crate::objects::Commit;
use crate::objects::CommitId;
use crate::store::ObjectStore;
use crate::store::StoreResult;

/// All commits reachable from `starts` that are present locally, including
/// the starts themselves.
pub fn reachable(store: &ObjectStore, starts: &[CommitId]) -> StoreResult<HashSet<CommitId>> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<CommitId> = starts.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        match store.get_commit(&id) {
            Ok(commit) => queue.extend(commit.parents),
            Err(err) if err.is_not_found() => {
                seen.remove(&id);
            }
            Err(err) => return Err(err),
        }
    }
    Ok(seen)
}

/// Breadth-first walk from `starts`, yielding each present commit once,
/// parents after children.
pub fn walk_ancestors(
    store: &ObjectStore,
    starts: &[CommitId],
) -> StoreResult<Vec<(CommitId, Commit)>> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<CommitId> = starts.iter().copied().collect();
    let mut out = Vec::new();
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        match store.get_commit(&id) {
            Ok(commit) => {
                queue.extend(commit.parents.iter().copied());
                out.push((id, commit));
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}

/// Whether `ancestor` is reachable from `descendant` (a ref move from
/// `ancestor` to `descendant` is then a fast-forward). A commit is its own
/// ancestor.
pub fn is_ancestor_of(
    store: &ObjectStore,
    ancestor: &CommitId,
    descendant: &CommitId,
) -> StoreResult<bool> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*descendant]);
    while let Some(id) = queue.pop_front() {
        if id == *ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        match store.get_commit(&id) {
            Ok(commit) => queue.extend(commit.parents),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(false)
}

/// The first ancestor of `b` (in breadth-first order) that is also an
/// ancestor of `a`; the base for a three-way merge of the two heads.
pub fn merge_base(
    store: &ObjectStore,
    a: &CommitId,
    b: &CommitId,
) -> StoreResult<Option<CommitId>> {
    let ancestors_of_a = reachable(store, &[*a])?;
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*b]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if ancestors_of_a.contains(&id) {
            return Ok(Some(id));
        }
        match store.get_commit(&id) {
            Ok(commit) => queue.extend(commit.parents),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use testutils::commit_chain;
    use testutils::new_object_store;
    use testutils::save_commit_with_parents;

    #[test]
    fn test_reachable_stops_at_missing_commits() {
        let (_dir, store) = new_object_store();
        let chain = commit_chain(&store, 3);
        let reached = reachable(&store, &[chain[2]]).unwrap();
        assert_eq!(reached.len(), 3);

        // Simulate a shallow boundary by dropping the root.
        store.delete_commit(&chain[0]).unwrap();
        let reached = reachable(&store, &[chain[2]]).unwrap();
        assert_eq!(reached.len(), 2);
        assert!(!reached.contains(&chain[0]));
    }

    #[test]
    fn test_is_ancestor_of() {
        let (_dir, store) = new_object_store();
        let chain = commit_chain(&store, 3);
        assert!(is_ancestor_of(&store, &chain[0], &chain[2]).unwrap());
        assert!(is_ancestor_of(&store, &chain[2], &chain[2]).unwrap());
        assert!(!is_ancestor_of(&store, &chain[2], &chain[0]).unwrap());

        let side = save_commit_with_parents(&store, &[]);
        assert!(!is_ancestor_of(&store, &side, &chain[2]).unwrap());
    }

    #[test]
    fn test_merge_base() {
        let (_dir, store) = new_object_store();
        let root = save_commit_with_parents(&store, &[]);
        let a = save_commit_with_parents(&store, &[root]);
        let b = save_commit_with_parents(&store, &[root]);
        assert_eq!(merge_base(&store, &a, &b).unwrap(), Some(root));
        // Fast-forward shape: base is the older head itself
        let c = save_commit_with_parents(&store, &[a]);
        assert_eq!(merge_base(&store, &a, &c).unwrap(), Some(a));

        let lone = save_commit_with_parents(&store, &[]);
        assert_eq!(merge_base(&store, &a, &lone).unwrap(), None);
    }

    #[test]
    fn test_walk_ancestors_children_first() {
        let (_dir, store) = new_object_store();
        let chain = commit_chain(&store, 4);
        let walked: Vec<CommitId> = walk_ancestors(&store, &[chain[3]])
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(walked, vec![chain[3], chain[2], chain[1], chain[0]]);
    }
}
