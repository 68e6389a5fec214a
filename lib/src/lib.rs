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

//! Wrangle is a version control system for tabular data. This crate is the
//! engine: content-addressed object storage, references with reflogs, CSV
//! ingestion, row-level diff and three-way merge, and the pack-based
//! fetch/push transport.

#![allow(missing_docs)]

pub mod block_index;
pub mod client;
pub mod config;
pub mod content_hash;
pub mod dag_walk;
pub mod diff;
pub mod encoding;
pub mod fetch;
pub mod gc;
pub mod ingest;
pub mod merge;
pub mod negotiator;
pub mod object_id;
pub mod objects;
pub mod packfile;
pub mod pktline;
pub mod push;
pub mod receive_pack;
pub mod receiver;
pub mod refs;
pub mod refspec;
pub mod repo;
pub mod sender;
pub mod server;
pub mod sorter;
pub mod store;
pub mod upload_pack;
