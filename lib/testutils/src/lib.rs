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

//! Shared fixtures for wrangle-lib tests: temp stores, random tables and
//! commit factories.

#![allow(missing_docs)]

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use rand::Rng as _;
use tempfile::TempDir;
use wrangle_lib::content_hash::HashSum;
use wrangle_lib::ingest::IngestOptions;
use wrangle_lib::ingest::ingest_table;
use wrangle_lib::objects::Commit;
use wrangle_lib::objects::CommitId;
use wrangle_lib::objects::TableId;
use wrangle_lib::objects::Timestamp;
use wrangle_lib::refs::RefStore;
use wrangle_lib::repo::Repo;
use wrangle_lib::store::ObjectStore;

static COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("wrangle-test-")
        .tempdir()
        .unwrap()
}

pub fn new_object_store() -> (TempDir, ObjectStore) {
    let dir = new_temp_dir();
    let store = ObjectStore::init(dir.path()).unwrap();
    (dir, store)
}

pub fn new_ref_store() -> (TempDir, RefStore) {
    let dir = new_temp_dir();
    let store = RefStore::new(dir.path());
    (dir, store)
}

pub fn new_repo() -> (TempDir, Repo) {
    let dir = new_temp_dir();
    let repo = Repo::init(dir.path()).unwrap();
    (dir, repo)
}

pub fn random_sum() -> HashSum {
    rand::thread_rng().r#gen()
}

/// A CSV string with header `c0,c1,...` and random single-token cells. The
/// first column is unique and usable as a primary key.
pub fn build_raw_csv(columns: usize, rows: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut out = (0..columns)
        .map(|i| format!("c{i}"))
        .collect::<Vec<_>>()
        .join(",");
    out.push('\n');
    for row in 0..rows {
        let mut cells = vec![format!("k{row}")];
        for _ in 1..columns {
            cells.push(format!("{}", rng.gen_range(0..100000)));
        }
        out.push_str(&cells.join(","));
        out.push('\n');
    }
    out
}

/// Ingests a random table and commits it on top of `parents`.
pub fn create_random_commit(
    store: &ObjectStore,
    columns: usize,
    rows: usize,
    parents: &[CommitId],
) -> (CommitId, Commit) {
    let csv = build_raw_csv(columns, rows);
    let table = ingest_table(store, csv.as_bytes(), &["c0"], &IngestOptions::default()).unwrap();
    save_commit(store, table, parents)
}

/// Saves a commit pointing at a table that is not present locally, i.e. a
/// shallow commit. Enough for DAG and negotiation tests.
pub fn save_commit_with_parents(store: &ObjectStore, parents: &[CommitId]) -> CommitId {
    save_commit(store, TableId::new(random_sum()), parents).0
}

pub fn save_commit(
    store: &ObjectStore,
    table: TableId,
    parents: &[CommitId],
) -> (CommitId, Commit) {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let commit = Commit {
        table,
        author_name: "Test Author".to_owned(),
        author_email: "test@example.com".to_owned(),
        message: format!("commit {n}"),
        time: Timestamp {
            seconds: 1700000000 + n as i64,
            tz_offset: 0,
        },
        parents: parents.to_vec(),
    };
    let id = store.save_commit(&commit.encode()).unwrap();
    (id, commit)
}

/// A chain of `n` shallow commits, root first.
pub fn commit_chain(store: &ObjectStore, n: usize) -> Vec<CommitId> {
    let mut chain: Vec<CommitId> = Vec::with_capacity(n);
    for _ in 0..n {
        let parents: Vec<CommitId> = chain.last().copied().into_iter().collect();
        chain.push(save_commit_with_parents(store, &parents));
    }
    chain
}

/// A chain of `n` complete commits (tables and blocks present), root first.
pub fn complete_commit_chain(store: &ObjectStore, n: usize) -> Vec<CommitId> {
    let mut chain: Vec<CommitId> = Vec::with_capacity(n);
    for _ in 0..n {
        let parents: Vec<CommitId> = chain.last().copied().into_iter().collect();
        let (id, _) = create_random_commit(store, 3, 10, &parents);
        chain.push(id);
    }
    chain
}
