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

//! Named references and their reflogs.
//!
//! A ref is a file `refs/<name>` holding a lowercase hex commit id; its
//! reflog is an append-only file `logs/refs/<name>`, one line per update:
//!
//! ```text
//! <old-hex> <new-hex> <name> <email> <unix-ts> <tz>\t<action>: <message>
//! ```
//!
//! Head updates always log; tag updates may skip the log. All mutations are
//! serialized under one store-wide lock, so updates to a single ref are
//! totally ordered.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;
use thiserror::Error;

use crate::objects::Commit;
use crate::objects::CommitId;
use crate::objects::Timestamp;

pub const HEAD_PREFIX: &str = "heads/";
pub const TAG_PREFIX: &str = "tags/";
pub const REMOTE_PREFIX: &str = "remotes/";

#[derive(Debug, Error)]
pub enum RefError {
    #[error("ref {name:?} not found")]
    NotFound { name: String },
    #[error("invalid ref name {name:?}")]
    InvalidName { name: String },
    #[error("corrupt ref {name:?}: {message}")]
    Corrupt { name: String, message: String },
    #[error("error accessing ref {name:?}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub type RefResult<T> = Result<T, RefError>;

pub fn head_ref(name: &str) -> String {
    format!("{HEAD_PREFIX}{name}")
}

pub fn tag_ref(name: &str) -> String {
    format!("{TAG_PREFIX}{name}")
}

pub fn remote_ref(remote: &str, name: &str) -> String {
    format!("{REMOTE_PREFIX}{remote}/{name}")
}

/// One reflog line. `old_oid` is `None` for the ref's first entry, rendered
/// as 32 zero digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    pub old_oid: Option<CommitId>,
    pub new_oid: CommitId,
    pub author_name: String,
    pub author_email: String,
    pub time: Timestamp,
    pub action: String,
    pub message: String,
}

impl ReflogEntry {
    fn format(&self) -> String {
        use crate::object_id::ObjectId as _;
        let old = match &self.old_oid {
            Some(id) => id.hex(),
            None => "0".repeat(32),
        };
        format!(
            "{old} {new} {name} {email} {time}\t{action}: {message}\n",
            new = self.new_oid.hex(),
            name = self.author_name,
            email = self.author_email,
            time = self.time,
            action = self.action,
            message = self.message.replace('\n', " "),
        )
    }

    fn parse(line: &str) -> Option<Self> {
        let (header, trailer) = line.split_once('\t')?;
        let (action, message) = trailer.split_once(": ")?;
        let fields: Vec<&str> = header.split(' ').collect();
        // old, new, name..., email, seconds, tz; the author name may
        // itself contain spaces.
        if fields.len() < 6 {
            return None;
        }
        let old_hex = fields[0];
        let old_oid = if old_hex.bytes().all(|b| b == b'0') {
            None
        } else {
            Some(CommitId::try_from_hex(old_hex)?)
        };
        let new_oid = CommitId::try_from_hex(fields[1])?;
        let tz_offset = Timestamp::parse_tz(fields[fields.len() - 1])?;
        let seconds: i64 = fields[fields.len() - 2].parse().ok()?;
        let author_email = fields[fields.len() - 3].to_owned();
        let author_name = fields[2..fields.len() - 3].join(" ");
        Some(Self {
            old_oid,
            new_oid,
            author_name,
            author_email,
            time: Timestamp {
                seconds,
                tz_offset,
            },
            action: action.to_owned(),
            message: message.to_owned(),
        })
    }
}

#[derive(Debug)]
pub struct RefStore {
    root: PathBuf,
    mutex: Mutex<()>,
}

fn io_err(name: &str, source: std::io::Error) -> RefError {
    RefError::Io {
        name: name.to_owned(),
        source,
    }
}

fn validate_name(name: &str) -> RefResult<()> {
    let invalid = name.is_empty()
        || name.starts_with('/')
        || name.ends_with('/')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..")
        || name.bytes().any(|b| b.is_ascii_control() || b == b'\\' || b == b' ');
    if invalid {
        return Err(RefError::InvalidName {
            name: name.to_owned(),
        });
    }
    Ok(())
}

impl RefStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            mutex: Mutex::new(()),
        }
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join("refs").join(name)
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.root.join("logs").join("refs").join(name)
    }

    pub fn get(&self, name: &str) -> RefResult<CommitId> {
        let content = match fs::read_to_string(self.ref_path(name)) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RefError::NotFound {
                    name: name.to_owned(),
                });
            }
            Err(err) => return Err(io_err(name, err)),
        };
        CommitId::try_from_hex(content.trim_end()).ok_or_else(|| RefError::Corrupt {
            name: name.to_owned(),
            message: format!("invalid commit id {:?}", content.trim_end()),
        })
    }

    /// Sets the ref without logging. Tags and internal bookkeeping only;
    /// head updates go through [`RefStore::set_with_log`].
    pub fn set(&self, name: &str, sum: &CommitId) -> RefResult<()> {
        validate_name(name)?;
        let _guard = self.mutex.lock().unwrap();
        self.write_ref_file(name, sum)
    }

    /// Sets the ref and appends a reflog entry; both persist or neither.
    pub fn set_with_log(&self, name: &str, sum: &CommitId, entry: &ReflogEntry) -> RefResult<()> {
        validate_name(name)?;
        let _guard = self.mutex.lock().unwrap();
        let log_path = self.log_path(name);
        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir).map_err(|err| io_err(name, err))?;
        }
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|err| io_err(name, err))?;
        let old_len = log.metadata().map_err(|err| io_err(name, err))?.len();
        log.write_all(entry.format().as_bytes())
            .map_err(|err| io_err(name, err))?;
        if let Err(err) = self.write_ref_file(name, sum) {
            // Roll the log back so the pair stays consistent.
            log.set_len(old_len).ok();
            return Err(err);
        }
        Ok(())
    }

    fn write_ref_file(&self, name: &str, sum: &CommitId) -> RefResult<()> {
        use crate::object_id::ObjectId as _;
        let path = self.ref_path(name);
        let dir = path.parent().unwrap();
        fs::create_dir_all(dir).map_err(|err| io_err(name, err))?;
        let mut temp_file = NamedTempFile::new_in(dir).map_err(|err| io_err(name, err))?;
        writeln!(temp_file, "{}", sum.hex()).map_err(|err| io_err(name, err))?;
        temp_file
            .persist(&path)
            .map_err(|err| io_err(name, err.error))?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> RefResult<()> {
        let _guard = self.mutex.lock().unwrap();
        match fs::remove_file(self.ref_path(name)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(RefError::NotFound {
                    name: name.to_owned(),
                });
            }
            Err(err) => return Err(io_err(name, err)),
        }
        match fs::remove_file(self.log_path(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(name, err)),
        }
    }

    /// All refs whose name starts with `prefix`, keyed by the name with the
    /// prefix stripped.
    pub fn filter(&self, prefix: &str) -> RefResult<BTreeMap<String, CommitId>> {
        let mut result = BTreeMap::new();
        for name in self.filter_keys(prefix)? {
            let sum = self.get(&name)?;
            result.insert(name[prefix.len()..].to_owned(), sum);
        }
        Ok(result)
    }

    /// Full names of all refs starting with `prefix`, sorted.
    pub fn filter_keys(&self, prefix: &str) -> RefResult<Vec<String>> {
        let base = self.root.join("refs");
        let mut names = Vec::new();
        if base.is_dir() {
            collect_ref_names(&base, String::new(), &mut names)
                .map_err(|err| io_err(prefix, err))?;
        }
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    pub fn rename(&self, old: &str, new: &str) -> RefResult<()> {
        validate_name(new)?;
        let _guard = self.mutex.lock().unwrap();
        if !self.ref_path(old).exists() {
            return Err(RefError::NotFound {
                name: old.to_owned(),
            });
        }
        move_file(&self.ref_path(old), &self.ref_path(new)).map_err(|err| io_err(new, err))?;
        if self.log_path(old).exists() {
            move_file(&self.log_path(old), &self.log_path(new))
                .map_err(|err| io_err(new, err))?;
        }
        Ok(())
    }

    pub fn copy(&self, src: &str, dst: &str) -> RefResult<()> {
        validate_name(dst)?;
        let _guard = self.mutex.lock().unwrap();
        if !self.ref_path(src).exists() {
            return Err(RefError::NotFound {
                name: src.to_owned(),
            });
        }
        copy_file(&self.ref_path(src), &self.ref_path(dst)).map_err(|err| io_err(dst, err))?;
        if self.log_path(src).exists() {
            copy_file(&self.log_path(src), &self.log_path(dst))
                .map_err(|err| io_err(dst, err))?;
        }
        Ok(())
    }

    /// The ref's reflog, oldest entry first. Empty if the ref was never
    /// logged.
    pub fn read_log(&self, name: &str) -> RefResult<Vec<ReflogEntry>> {
        let content = match fs::read_to_string(self.log_path(name)) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_err(name, err)),
        };
        let mut entries = Vec::new();
        for line in content.lines() {
            let entry = ReflogEntry::parse(line).ok_or_else(|| RefError::Corrupt {
                name: name.to_owned(),
                message: format!("invalid reflog line {line:?}"),
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(dir) = to.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::rename(from, to)
}

fn copy_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(dir) = to.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::copy(from, to)?;
    Ok(())
}

fn collect_ref_names(
    dir: &Path,
    prefix: String,
    names: &mut Vec<String>,
) -> std::io::Result<()> {
    for entry in dir.read_dir()? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let name = if prefix.is_empty() {
            file_name
        } else {
            format!("{prefix}/{file_name}")
        };
        if entry.file_type()?.is_dir() {
            collect_ref_names(&entry.path(), name, names)?;
        } else {
            names.push(name);
        }
    }
    Ok(())
}

/// Records a ref update with a log entry, reading the previous value for
/// the entry's old oid.
pub fn save_ref(
    store: &RefStore,
    name: &str,
    sum: &CommitId,
    author_name: &str,
    author_email: &str,
    action: &str,
    message: &str,
) -> RefResult<()> {
    let entry = ReflogEntry {
        old_oid: store.get(name).ok(),
        new_oid: *sum,
        author_name: author_name.to_owned(),
        author_email: author_email.to_owned(),
        time: Timestamp::now(),
        action: action.to_owned(),
        message: message.to_owned(),
    };
    store.set_with_log(name, sum, &entry)
}

/// Points `heads/<name>` at a freshly created commit.
pub fn commit_head(
    store: &RefStore,
    name: &str,
    sum: &CommitId,
    commit: &Commit,
) -> RefResult<()> {
    save_ref(
        store,
        &head_ref(name),
        sum,
        &commit.author_name,
        &commit.author_email,
        "commit",
        commit.summary(),
    )
}

/// Points `heads/<name>` at a merge commit.
pub fn commit_merge(
    store: &RefStore,
    name: &str,
    sum: &CommitId,
    commit: &Commit,
) -> RefResult<()> {
    let parents = commit
        .parents
        .iter()
        .map(|parent| {
            use crate::object_id::ObjectId as _;
            parent.hex()[..7].to_owned()
        })
        .collect::<Vec<_>>()
        .join(", ");
    save_ref(
        store,
        &head_ref(name),
        sum,
        &commit.author_name,
        &commit.author_email,
        "merge",
        &format!("merge {parents}"),
    )
}

pub fn save_tag(store: &RefStore, name: &str, sum: &CommitId) -> RefResult<()> {
    store.set(&tag_ref(name), sum)
}

pub fn save_remote_ref(
    store: &RefStore,
    remote: &str,
    name: &str,
    sum: &CommitId,
    author_name: &str,
    author_email: &str,
    action: &str,
    message: &str,
) -> RefResult<()> {
    save_ref(
        store,
        &remote_ref(remote, name),
        sum,
        author_name,
        author_email,
        action,
        message,
    )
}

pub fn get_head(store: &RefStore, name: &str) -> RefResult<CommitId> {
    store.get(&head_ref(name))
}

pub fn get_tag(store: &RefStore, name: &str) -> RefResult<CommitId> {
    store.get(&tag_ref(name))
}

pub fn get_remote_ref(store: &RefStore, remote: &str, name: &str) -> RefResult<CommitId> {
    store.get(&remote_ref(remote, name))
}

pub fn list_heads(store: &RefStore) -> RefResult<BTreeMap<String, CommitId>> {
    store.filter(HEAD_PREFIX)
}

pub fn list_tags(store: &RefStore) -> RefResult<BTreeMap<String, CommitId>> {
    store.filter(TAG_PREFIX)
}

pub fn list_remote_refs(store: &RefStore, remote: &str) -> RefResult<BTreeMap<String, CommitId>> {
    store.filter(&remote_ref(remote, ""))
}

pub fn list_all_refs(store: &RefStore) -> RefResult<BTreeMap<String, CommitId>> {
    store.filter("")
}

/// All refs except remote-tracking ones.
pub fn list_local_refs(store: &RefStore) -> RefResult<BTreeMap<String, CommitId>> {
    let mut refs = list_all_refs(store)?;
    refs.retain(|name, _| !name.starts_with(REMOTE_PREFIX));
    Ok(refs)
}

pub fn delete_tag(store: &RefStore, name: &str) -> RefResult<()> {
    store.delete(&tag_ref(name))
}

pub fn delete_head(store: &RefStore, name: &str) -> RefResult<()> {
    store.delete(&head_ref(name))
}

pub fn delete_remote_ref(store: &RefStore, remote: &str, name: &str) -> RefResult<()> {
    store.delete(&remote_ref(remote, name))
}

pub fn delete_all_remote_refs(store: &RefStore, remote: &str) -> RefResult<()> {
    for name in store.filter_keys(&remote_ref(remote, ""))? {
        store.delete(&name)?;
    }
    Ok(())
}

pub fn rename_all_remote_refs(
    store: &RefStore,
    old_remote: &str,
    new_remote: &str,
) -> RefResult<()> {
    let prefix = remote_ref(old_remote, "");
    for name in store.filter_keys(&prefix)? {
        let suffix = &name[prefix.len()..];
        store.rename(&name, &remote_ref(new_remote, suffix))?;
    }
    Ok(())
}

pub fn rename_ref(store: &RefStore, old: &str, new: &str) -> RefResult<CommitId> {
    let sum = store.get(old)?;
    store.rename(old, new)?;
    Ok(sum)
}

pub fn copy_ref(store: &RefStore, src: &str, dst: &str) -> RefResult<CommitId> {
    let sum = store.get(src)?;
    store.copy(src, dst)?;
    Ok(sum)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::content_hash::hash_bytes;

    fn new_store() -> (tempfile::TempDir, RefStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RefStore::new(dir.path());
        (dir, store)
    }

    fn id(n: u8) -> CommitId {
        CommitId::new(hash_bytes(&[n]))
    }

    #[test]
    fn test_set_get_delete() {
        let (_dir, store) = new_store();
        assert_matches!(store.get("heads/main"), Err(RefError::NotFound { .. }));
        store.set("heads/main", &id(1)).unwrap();
        assert_eq!(store.get("heads/main").unwrap(), id(1));
        store.delete("heads/main").unwrap();
        assert_matches!(store.get("heads/main"), Err(RefError::NotFound { .. }));
    }

    #[test]
    fn test_invalid_names() {
        let (_dir, store) = new_store();
        for name in ["", "/x", "x/", "a//b", "a/../b", "a b"] {
            assert_matches!(
                store.set(name, &id(1)),
                Err(RefError::InvalidName { .. }),
                "{name:?}"
            );
        }
    }

    #[test]
    fn test_reflog_chain() {
        let (_dir, store) = new_store();
        save_ref(&store, "heads/main", &id(1), "a", "a@b.c", "commit", "one").unwrap();
        save_ref(&store, "heads/main", &id(2), "a", "a@b.c", "commit", "two").unwrap();
        save_ref(&store, "heads/main", &id(3), "a", "a@b.c", "reset", "back").unwrap();

        let log = store.read_log("heads/main").unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].old_oid, None);
        for pair in log.windows(2) {
            assert_eq!(Some(pair[1].old_oid.unwrap()), Some(pair[0].new_oid));
        }
        assert_eq!(log[2].action, "reset");
        assert_eq!(log[2].message, "back");
    }

    #[test]
    fn test_reflog_author_name_with_spaces() {
        let entry = ReflogEntry {
            old_oid: None,
            new_oid: id(1),
            author_name: "Ada Lovelace Jr".to_owned(),
            author_email: "ada@example.com".to_owned(),
            time: Timestamp {
                seconds: 1700000000,
                tz_offset: 90,
            },
            action: "commit".to_owned(),
            message: "first: with colon".to_owned(),
        };
        let parsed = ReflogEntry::parse(entry.format().trim_end()).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn test_filter_and_namespaces() {
        let (_dir, store) = new_store();
        store.set("heads/main", &id(1)).unwrap();
        store.set("heads/dev", &id(2)).unwrap();
        store.set("tags/v1", &id(3)).unwrap();
        store.set("remotes/origin/main", &id(4)).unwrap();

        let heads = list_heads(&store).unwrap();
        assert_eq!(heads.len(), 2);
        assert_eq!(heads["main"], id(1));
        assert_eq!(heads["dev"], id(2));

        let local = list_local_refs(&store).unwrap();
        assert!(local.contains_key("heads/main"));
        assert!(local.contains_key("tags/v1"));
        assert!(!local.contains_key("remotes/origin/main"));

        assert_eq!(
            store.filter_keys("remotes/origin/").unwrap(),
            vec!["remotes/origin/main".to_owned()]
        );
    }

    #[test]
    fn test_delete_all_remote_refs() {
        let (_dir, store) = new_store();
        store.set("remotes/origin/main", &id(1)).unwrap();
        store.set("remotes/origin/dev", &id(2)).unwrap();
        store.set("remotes/backup/main", &id(3)).unwrap();
        delete_all_remote_refs(&store, "origin").unwrap();
        assert!(list_remote_refs(&store, "origin").unwrap().is_empty());
        assert_eq!(list_remote_refs(&store, "backup").unwrap().len(), 1);
    }

    #[test]
    fn test_rename_moves_log() {
        let (_dir, store) = new_store();
        save_ref(&store, "heads/old", &id(1), "a", "a@b.c", "commit", "m").unwrap();
        let sum = rename_ref(&store, "heads/old", "heads/new").unwrap();
        assert_eq!(sum, id(1));
        assert_matches!(store.get("heads/old"), Err(RefError::NotFound { .. }));
        assert_eq!(store.get("heads/new").unwrap(), id(1));
        assert_eq!(store.read_log("heads/new").unwrap().len(), 1);
        assert!(store.read_log("heads/old").unwrap().is_empty());
    }

    #[test]
    fn test_copy_keeps_source() {
        let (_dir, store) = new_store();
        save_ref(&store, "heads/a", &id(1), "a", "a@b.c", "commit", "m").unwrap();
        copy_ref(&store, "heads/a", "heads/b").unwrap();
        assert_eq!(store.get("heads/a").unwrap(), id(1));
        assert_eq!(store.get("heads/b").unwrap(), id(1));
        assert_eq!(store.read_log("heads/b").unwrap().len(), 1);
    }
}
