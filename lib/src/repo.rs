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

//! Repository directory layout and wiring.
//!
//! A repository is a `.wrgl` directory holding the object store, the ref
//! store and the config file. The repository is single-writer at the ref
//! level; object writes may happen concurrently.

use std::path::Path;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::Config;
use crate::config::ConfigError;
use crate::refs::RefStore;
use crate::store::ObjectStore;
use crate::store::StoreError;

pub const REPO_DIR_NAME: &str = ".wrgl";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("repository already initialized at {0}")]
    AlreadyExists(PathBuf),
    #[error("no repository found at or above {0}")]
    NotFound(PathBuf),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot access repository directory")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct Repo {
    root: PathBuf,
    pub store: ObjectStore,
    pub refs: RefStore,
    pub config: Config,
}

impl Repo {
    /// Creates a `.wrgl` directory under `parent` and opens it.
    pub fn init(parent: &Path) -> Result<Self, RepoError> {
        let root = parent.join(REPO_DIR_NAME);
        if root.exists() {
            return Err(RepoError::AlreadyExists(root));
        }
        std::fs::create_dir_all(&root)?;
        let store = ObjectStore::init(&root)?;
        let refs = RefStore::new(&root);
        let config = Config::default();
        config.save(&root.join("config.toml"))?;
        Ok(Self {
            root,
            store,
            refs,
            config,
        })
    }

    /// Opens the repository whose `.wrgl` directory lives under `parent`.
    pub fn open(parent: &Path) -> Result<Self, RepoError> {
        let root = parent.join(REPO_DIR_NAME);
        if !root.is_dir() {
            return Err(RepoError::NotFound(parent.to_path_buf()));
        }
        let store = ObjectStore::load(&root)?;
        let refs = RefStore::new(&root);
        let config = Config::load(&root.join("config.toml"))?;
        Ok(Self {
            root,
            store,
            refs,
            config,
        })
    }

    /// Walks up from `start` to find an enclosing repository.
    pub fn discover(start: &Path) -> Result<Self, RepoError> {
        let mut dir = start;
        loop {
            if dir.join(REPO_DIR_NAME).is_dir() {
                return Self::open(dir);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => return Err(RepoError::NotFound(start.to_path_buf())),
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn save_config(&self) -> Result<(), RepoError> {
        self.config.save(&self.config_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_init_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repo::init(dir.path()).unwrap();
        assert!(repo.root().ends_with(REPO_DIR_NAME));
        assert_matches!(Repo::init(dir.path()), Err(RepoError::AlreadyExists(_)));
        // The embedded KV engine holds an exclusive lock; release it first.
        drop(repo);
        let reopened = Repo::open(dir.path()).unwrap();
        assert_eq!(reopened.config, Config::default());
    }

    #[test]
    fn test_discover_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        Repo::init(dir.path()).unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        let repo = Repo::discover(&nested).unwrap();
        assert_eq!(repo.root(), dir.path().join(REPO_DIR_NAME));
    }

    #[test]
    fn test_discover_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert_matches!(Repo::discover(dir.path()), Err(RepoError::NotFound(_)));
    }
}
