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

//! The fetch driver: refspec matching, object transfer and local ref
//! updates.
//!
//! Advertised refs are matched against the configured refspecs (negated
//! specs exclude), the wanted commits are fetched, then each destination
//! ref is updated under the usual policy: new refs are created, tags are
//! only clobbered with force, fast-forwards apply silently, and anything
//! else needs force or is rejected. Remote tags pointing at commits we now
//! hold are saved opportunistically.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::info;
use tracing::instrument;

use crate::client::ClientError;
use crate::client::Transport;
use crate::client::fetch_objects;
use crate::dag_walk;
use crate::objects::CommitId;
use crate::refs::RefStore;
use crate::refs::save_ref;
use crate::refspec::Refspec;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ref(#[from] crate::refs::RefError),
    #[error("failed to fetch some refs: {0}")]
    SomeRefsFailed(String),
}

/// How one destination ref fared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    New,
    FastForward,
    Forced,
    TagUpdate,
    UpToDate,
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRef {
    /// Remote name, e.g. `heads/main`.
    pub src: String,
    /// Local name, e.g. `remotes/origin/main`.
    pub dst: String,
    pub sum: CommitId,
    pub status: FetchStatus,
}

struct PlannedRef {
    src: String,
    dst: String,
    sum: CommitId,
    force: bool,
}

// Matches advertised refs against the refspecs. Returns planned updates
// plus tags not covered by any spec.
fn plan_refs(
    remote_refs: &BTreeMap<String, CommitId>,
    specs: &[Refspec],
) -> (Vec<PlannedRef>, BTreeMap<String, CommitId>) {
    let mut planned: Vec<PlannedRef> = Vec::new();
    let mut uncovered_tags = BTreeMap::new();
    for (name, sum) in remote_refs {
        let full = format!("refs/{name}");
        if specs.iter().any(|spec| spec.exclude(&full)) {
            continue;
        }
        let mut covered = false;
        for spec in specs.iter().filter(|spec| !spec.negate) {
            if let Some(dst) = spec.dst_for_ref(&full) {
                let dst = dst.trim_start_matches("refs/").to_owned();
                planned.push(PlannedRef {
                    src: name.clone(),
                    dst,
                    sum: *sum,
                    force: spec.force,
                });
                covered = true;
            }
        }
        if !covered && name.starts_with("tags/") {
            uncovered_tags.insert(name.clone(), *sum);
        }
    }
    planned.sort_by(|a, b| (&a.src, &a.dst).cmp(&(&b.src, &b.dst)));
    (planned, uncovered_tags)
}

/// Fetches from a remote: matches `specs` against the advertised refs,
/// transfers missing objects, then applies ref updates. `force` overrides
/// per-spec force.
#[instrument(skip_all, fields(remote = remote))]
pub fn fetch(
    store: &ObjectStore,
    refs: &RefStore,
    transport: &dyn Transport,
    remote: &str,
    specs: &[Refspec],
    author_name: &str,
    author_email: &str,
    force: bool,
    depth: u32,
) -> Result<Vec<FetchedRef>, FetchError> {
    let remote_refs = transport.get_refs()?;
    let (mut planned, uncovered_tags) = plan_refs(&remote_refs, specs);
    let advertised: Vec<CommitId> = planned.iter().map(|planned| planned.sum).collect();
    let summary = fetch_objects(store, refs, transport, &advertised, depth)?;
    info!(commits = summary.commits.len(), "fetched objects");

    // Save uncovered remote tags whose commits we now hold, unless the tag
    // already exists locally.
    for (name, sum) in uncovered_tags {
        if store.commit_exists(&sum) && refs.get(&name).is_err() {
            planned.push(PlannedRef {
                src: name.clone(),
                dst: name,
                sum,
                force: false,
            });
        }
    }

    let mut results = Vec::new();
    let mut failed = Vec::new();
    for plan in planned {
        let status = apply_ref(
            store,
            refs,
            &plan,
            author_name,
            author_email,
            force || plan.force,
        )?;
        if let FetchStatus::Rejected(_) = &status {
            failed.push(plan.dst.clone());
        }
        if status != FetchStatus::UpToDate {
            info!(src = plan.src, dst = plan.dst, ?status, "fetched ref");
            results.push(FetchedRef {
                src: plan.src,
                dst: plan.dst,
                sum: plan.sum,
                status,
            });
        }
    }
    if !failed.is_empty() {
        return Err(FetchError::SomeRefsFailed(failed.join(", ")));
    }
    Ok(results)
}

fn apply_ref(
    store: &ObjectStore,
    refs: &RefStore,
    plan: &PlannedRef,
    author_name: &str,
    author_email: &str,
    force: bool,
) -> Result<FetchStatus, FetchError> {
    let old = refs.get(&plan.dst).ok();
    if old == Some(plan.sum) {
        return Ok(FetchStatus::UpToDate);
    }
    if plan.dst.starts_with("tags/") && old.is_some() {
        if !force {
            return Ok(FetchStatus::Rejected(
                "would clobber existing tag".to_owned(),
            ));
        }
        save_ref(
            refs,
            &plan.dst,
            &plan.sum,
            author_name,
            author_email,
            "fetch",
            "updating tag",
        )?;
        return Ok(FetchStatus::TagUpdate);
    }
    let Some(old) = old else {
        let message = if plan.src.starts_with("tags/") {
            "storing tag"
        } else if plan.src.starts_with("heads/") {
            "storing head"
        } else {
            "storing ref"
        };
        save_ref(
            refs,
            &plan.dst,
            &plan.sum,
            author_name,
            author_email,
            "fetch",
            message,
        )?;
        return Ok(FetchStatus::New);
    };
    if dag_walk::is_ancestor_of(store, &old, &plan.sum)? {
        save_ref(
            refs,
            &plan.dst,
            &plan.sum,
            author_name,
            author_email,
            "fetch",
            "fast-forward",
        )?;
        Ok(FetchStatus::FastForward)
    } else if force {
        save_ref(
            refs,
            &plan.dst,
            &plan.sum,
            author_name,
            author_email,
            "fetch",
            "forced-update",
        )?;
        Ok(FetchStatus::Forced)
    } else {
        Ok(FetchStatus::Rejected("non-fast-forward".to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::client::LocalTransport;
    use crate::config::Config;
    use crate::server::NoAuth;
    use crate::server::PackServer;
    use testutils::create_random_commit;
    use testutils::new_object_store;
    use testutils::new_ref_store;

    struct Remote {
        _dirs: Vec<tempfile::TempDir>,
        store: Arc<ObjectStore>,
        refs: Arc<RefStore>,
    }

    fn new_remote() -> (Remote, LocalTransport) {
        let (d1, store) = new_object_store();
        let (d2, refs) = new_ref_store();
        let store = Arc::new(store);
        let refs = Arc::new(refs);
        let server = Arc::new(PackServer::new(
            store.clone(),
            refs.clone(),
            Config::default(),
            Arc::new(NoAuth),
        ));
        (
            Remote {
                _dirs: vec![d1, d2],
                store,
                refs,
            },
            LocalTransport::new(server),
        )
    }

    fn glob_specs() -> Vec<Refspec> {
        vec![Refspec::default_fetch("origin")]
    }

    #[test]
    fn test_fetch_glob_updates_remote_tracking_ref() {
        let (remote, transport) = new_remote();
        let (c1, _) = create_random_commit(&remote.store, 3, 30, &[]);
        crate::refs::save_ref(&remote.refs, "heads/main", &c1, "s", "s@e.c", "commit", "m")
            .unwrap();

        let (_cd, store) = new_object_store();
        let (_cr, refs) = new_ref_store();
        let results = fetch(
            &store,
            &refs,
            &transport,
            "origin",
            &glob_specs(),
            "c",
            "c@e.c",
            false,
            0,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].dst, "remotes/origin/main");
        assert_eq!(results[0].status, FetchStatus::New);
        assert_eq!(refs.get("remotes/origin/main").unwrap(), c1);
        let commit = store.get_commit(&c1).unwrap();
        assert!(store.commit_is_complete(&commit));
    }

    #[test]
    fn test_fetch_fast_forward_then_reject() {
        let (remote, transport) = new_remote();
        let (c1, _) = create_random_commit(&remote.store, 3, 10, &[]);
        crate::refs::save_ref(&remote.refs, "heads/main", &c1, "s", "s@e.c", "commit", "m")
            .unwrap();

        let (_cd, store) = new_object_store();
        let (_cr, refs) = new_ref_store();
        fetch(
            &store, &refs, &transport, "origin", &glob_specs(), "c", "c@e.c", false, 0,
        )
        .unwrap();

        // Remote advances; fetching again fast-forwards.
        let (c2, _) = create_random_commit(&remote.store, 3, 10, &[c1]);
        crate::refs::save_ref(&remote.refs, "heads/main", &c2, "s", "s@e.c", "commit", "m")
            .unwrap();
        let results = fetch(
            &store, &refs, &transport, "origin", &glob_specs(), "c", "c@e.c", false, 0,
        )
        .unwrap();
        assert_eq!(results[0].status, FetchStatus::FastForward);
        assert_eq!(refs.get("remotes/origin/main").unwrap(), c2);

        // Remote rewinds to an unrelated commit; a plain refspec would
        // reject, but the default fetch spec is forced.
        let (c3, _) = create_random_commit(&remote.store, 3, 10, &[]);
        crate::refs::save_ref(&remote.refs, "heads/main", &c3, "s", "s@e.c", "commit", "m")
            .unwrap();
        let plain: Vec<Refspec> = vec![
            "refs/heads/*:refs/remotes/origin/*".parse().unwrap(),
        ];
        let err = fetch(
            &store, &refs, &transport, "origin", &plain, "c", "c@e.c", false, 0,
        )
        .unwrap_err();
        assert!(matches!(err, FetchError::SomeRefsFailed(_)));
        assert_eq!(refs.get("remotes/origin/main").unwrap(), c2);

        let results = fetch(
            &store, &refs, &transport, "origin", &glob_specs(), "c", "c@e.c", false, 0,
        )
        .unwrap();
        assert_eq!(results[0].status, FetchStatus::Forced);
        assert_eq!(refs.get("remotes/origin/main").unwrap(), c3);
    }

    #[test]
    fn test_fetch_saves_reachable_tags() {
        let (remote, transport) = new_remote();
        let (c1, _) = create_random_commit(&remote.store, 3, 10, &[]);
        crate::refs::save_ref(&remote.refs, "heads/main", &c1, "s", "s@e.c", "commit", "m")
            .unwrap();
        crate::refs::save_tag(&remote.refs, "v1", &c1).unwrap();

        let (_cd, store) = new_object_store();
        let (_cr, refs) = new_ref_store();
        fetch(
            &store, &refs, &transport, "origin", &glob_specs(), "c", "c@e.c", false, 0,
        )
        .unwrap();
        // The tag points at a fetched commit, so it was stored too.
        assert_eq!(refs.get("tags/v1").unwrap(), c1);
    }

    #[test]
    fn test_negated_spec_excludes() {
        let (remote, transport) = new_remote();
        let (c1, _) = create_random_commit(&remote.store, 3, 10, &[]);
        let (c2, _) = create_random_commit(&remote.store, 3, 10, &[]);
        crate::refs::save_ref(&remote.refs, "heads/main", &c1, "s", "s@e.c", "commit", "m")
            .unwrap();
        crate::refs::save_ref(&remote.refs, "heads/wip-x", &c2, "s", "s@e.c", "commit", "m")
            .unwrap();

        let (_cd, store) = new_object_store();
        let (_cr, refs) = new_ref_store();
        let specs: Vec<Refspec> = vec![
            Refspec::default_fetch("origin"),
            "^refs/heads/wip*".parse().unwrap(),
        ];
        fetch(
            &store, &refs, &transport, "origin", &specs, "c", "c@e.c", false, 0,
        )
        .unwrap();
        assert_eq!(refs.get("remotes/origin/main").unwrap(), c1);
        assert!(refs.get("remotes/origin/wip-x").is_err());
    }
}
