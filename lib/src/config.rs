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

//! Repository configuration, stored as TOML at `.wrgl/config.toml`.
//!
//! The schema is statically typed: every option lives in a named section
//! struct with a typed accessor and a serde representation, so there is no
//! runtime reflection over option paths.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::refspec::Refspec;

/// Default cap for one packfile chunk, pre-compression: 2 GiB.
pub const DEFAULT_MAX_PACKFILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write config file {path}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}")]
    Parse {
        path: String,
        #[source]
        source: Box<toml::de::Error>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Recorded in commits and reflog entries. Always required for
    /// operations that move refs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remote {
    pub url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fetch: Vec<Refspec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub push: Vec<Refspec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receive {
    /// When true, pushes may only fast-forward refs. On by default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_non_fast_forwards: Option<bool>,
    /// When true, pushes may not delete refs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deny_deletes: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pack {
    /// Maximum packfile chunk size in bytes, pre-compression. Zero or
    /// absent means [`DEFAULT_MAX_PACKFILE_SIZE`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FastForward {
    /// Fast-forward when possible, otherwise create a merge commit.
    #[default]
    Default,
    /// Refuse merges that cannot fast-forward.
    Only,
    /// Always create a merge commit.
    Never,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Merge {
    #[serde(default, skip_serializing_if = "is_default_ff")]
    pub fast_forward: FastForward,
}

fn is_default_ff(ff: &FastForward) -> bool {
    *ff == FastForward::Default
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    /// Upstream remote; with `merge` set, pulls need no arguments.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    /// Upstream ref this branch merges from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_key: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote: BTreeMap<String, Remote>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive: Option<Receive>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branch: BTreeMap<String, Branch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pack: Option<Pack>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<Merge>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source: Box::new(source),
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self).expect("config serializes to toml");
        std::fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user.as_ref()?.name.as_deref()
    }

    pub fn user_email(&self) -> Option<&str> {
        self.user.as_ref()?.email.as_deref()
    }

    pub fn max_packfile_size(&self) -> u64 {
        match self.pack.as_ref().and_then(|pack| pack.max_file_size) {
            None | Some(0) => DEFAULT_MAX_PACKFILE_SIZE,
            Some(size) => size,
        }
    }

    pub fn deny_non_fast_forwards(&self) -> bool {
        self.receive
            .as_ref()
            .and_then(|receive| receive.deny_non_fast_forwards)
            .unwrap_or(true)
    }

    pub fn deny_deletes(&self) -> bool {
        self.receive
            .as_ref()
            .and_then(|receive| receive.deny_deletes)
            .unwrap_or(false)
    }

    pub fn merge_fast_forward(&self) -> FastForward {
        self.merge
            .as_ref()
            .map(|merge| merge.fast_forward)
            .unwrap_or_default()
    }

    /// Fetch refspecs for `remote`, falling back to the default mirror
    /// mapping when none are configured.
    pub fn fetch_refspecs(&self, remote: &str) -> Vec<Refspec> {
        match self.remote.get(remote) {
            Some(config) if !config.fetch.is_empty() => config.fetch.clone(),
            _ => vec![Refspec::default_fetch(remote)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config {
            user: Some(User {
                name: Some("Alice".to_owned()),
                email: Some("alice@example.com".to_owned()),
            }),
            ..Default::default()
        };
        config.remote.insert(
            "origin".to_owned(),
            Remote {
                url: "http://localhost:8000".to_owned(),
                fetch: vec![Refspec::default_fetch("origin")],
                push: vec![],
            },
        );
        config.receive = Some(Receive {
            deny_non_fast_forwards: Some(false),
            deny_deletes: Some(true),
        });
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(!loaded.deny_non_fast_forwards());
        assert!(loaded.deny_deletes());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.deny_non_fast_forwards());
        assert!(!config.deny_deletes());
        assert_eq!(config.max_packfile_size(), DEFAULT_MAX_PACKFILE_SIZE);
    }

    #[test]
    fn test_parse_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[user]
name = "Bob"
email = "bob@example.com"

[remote.origin]
url = "http://localhost:8000"
fetch = ["+refs/heads/*:refs/remotes/origin/*"]

[pack]
maxFileSize = 1024

[merge]
fastForward = "only"
"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.user_name(), Some("Bob"));
        assert_eq!(config.max_packfile_size(), 1024);
        assert_eq!(config.merge_fast_forward(), FastForward::Only);
        let specs = config.fetch_refspecs("origin");
        assert_eq!(specs.len(), 1);
        assert!(specs[0].force);
    }

    #[test]
    fn test_default_fetch_refspec() {
        let config = Config::default();
        let specs = config.fetch_refspecs("origin");
        assert_eq!(specs[0].to_string(), "+refs/heads/*:refs/remotes/origin/*");
    }
}
