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

//! The push driver.
//!
//! Local refs matching the refspecs are compared with the remote's
//! advertisement; for each changed destination the driver sends an update
//! triple plus the packfile of commits the remote lacks, then reads the
//! per-ref report. Remote-tracking refs are updated for every accepted
//! ref.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;
use tracing::instrument;

use crate::client::ClientError;
use crate::client::Transport;
use crate::dag_walk;
use crate::object_id::ObjectId as _;
use crate::objects::Commit;
use crate::objects::CommitId;
use crate::pktline;
use crate::pktline::PktLine;
use crate::pktline::PktLineError;
use crate::refs::RefStore;
use crate::refs::list_local_refs;
use crate::refs::save_remote_ref;
use crate::refspec::Refspec;
use crate::sender::ObjectSender;
use crate::sender::SendError;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ref(#[from] crate::refs::RefError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    PktLine(#[from] PktLineError),
    #[error("server rejected the pack: {0}")]
    UnpackFailed(String),
    #[error("nothing to push")]
    NothingToPush,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedRef {
    /// Local source ref, e.g. `heads/main`; empty for deletions.
    pub src: String,
    /// Remote destination ref.
    pub dst: String,
    pub new: Option<CommitId>,
    /// `None` when accepted, otherwise the server's reason.
    pub rejected: Option<String>,
}

struct PlannedPush {
    src: String,
    dst: String,
    old: Option<CommitId>,
    new: Option<CommitId>,
    force: bool,
}

fn plan_pushes(
    local_refs: &BTreeMap<String, CommitId>,
    remote_refs: &BTreeMap<String, CommitId>,
    specs: &[Refspec],
) -> Vec<PlannedPush> {
    let mut planned = Vec::new();
    for spec in specs.iter().filter(|spec| !spec.negate) {
        // An empty source pushes a deletion of the destination.
        if spec.src().is_empty() && !spec.dst().is_empty() {
            let dst = spec.dst().trim_start_matches("refs/").to_owned();
            if let Some(old) = remote_refs.get(&dst) {
                planned.push(PlannedPush {
                    src: String::new(),
                    dst,
                    old: Some(*old),
                    new: None,
                    force: spec.force,
                });
            }
            continue;
        }
        for (name, sum) in local_refs {
            let full = format!("refs/{name}");
            if specs.iter().any(|other| other.exclude(&full)) {
                continue;
            }
            let Some(dst) = spec.dst_for_ref(&full) else {
                continue;
            };
            let dst = dst.trim_start_matches("refs/").to_owned();
            let old = remote_refs.get(&dst).copied();
            if old == Some(*sum) {
                continue;
            }
            planned.push(PlannedPush {
                src: name.clone(),
                dst,
                old,
                new: Some(*sum),
                force: spec.force,
            });
        }
    }
    planned.sort_by(|a, b| (&a.src, &a.dst).cmp(&(&b.src, &b.dst)));
    planned.dedup_by(|a, b| a.dst == b.dst);
    planned
}

// Commits reachable from the new tips but not from anything the remote
// advertises (restricted to what exists locally).
fn commits_to_send(
    store: &ObjectStore,
    tips: &[CommitId],
    remote_refs: &BTreeMap<String, CommitId>,
) -> Result<(Vec<(CommitId, Commit)>, HashSet<CommitId>), PushError> {
    let known: Vec<CommitId> = remote_refs
        .values()
        .filter(|sum| store.commit_exists(sum))
        .copied()
        .collect();
    let common = dag_walk::reachable(store, &known)?;
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for tip in tips {
        let mut queue = VecDeque::from([*tip]);
        while let Some(id) = queue.pop_front() {
            if common.contains(&id) || !seen.insert(id) {
                continue;
            }
            match store.get_commit(&id) {
                Ok(commit) => {
                    queue.extend(commit.parents.iter().copied());
                    out.push((id, commit));
                }
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
    Ok((out, common))
}

fn parse_report(body: &[u8]) -> Result<(String, Vec<(String, Option<String>)>), PushError> {
    let mut reader = body;
    let mut unpack = String::new();
    let mut refs = Vec::new();
    while let Some(line) = pktline::read_pkt_line(&mut reader)? {
        let PktLine::Data(_) = &line else {
            break;
        };
        let text = line
            .as_text()
            .ok_or_else(|| ClientError::Protocol("binary pkt-line in report".to_owned()))?;
        if let Some(status) = text.strip_prefix("unpack ") {
            unpack = status.to_owned();
        } else if let Some(name) = text.strip_prefix("ok ") {
            refs.push((name.to_owned(), None));
        } else if let Some(rest) = text.strip_prefix("ng ") {
            let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
            refs.push((name.to_owned(), Some(reason.to_owned())));
        } else if text == "continue" {
            // Acknowledgement of the update triples alone.
        } else {
            return Err(ClientError::Protocol(format!("unexpected line {text:?}")).into());
        }
    }
    Ok((unpack, refs))
}

/// Pushes refs matching `specs` to a remote. On success the matching
/// `remotes/<remote>/` tracking refs move too.
#[instrument(skip_all, fields(remote = remote))]
pub fn push(
    store: Arc<ObjectStore>,
    refs: &RefStore,
    transport: &dyn Transport,
    remote: &str,
    specs: &[Refspec],
    author_name: &str,
    author_email: &str,
    force: bool,
) -> Result<Vec<PushedRef>, PushError> {
    let remote_refs = transport.get_refs()?;
    let local_refs = list_local_refs(refs)?;
    let planned = plan_pushes(&local_refs, &remote_refs, specs);
    if planned.is_empty() {
        return Err(PushError::NothingToPush);
    }

    let tips: Vec<CommitId> = planned.iter().filter_map(|plan| plan.new).collect();
    let (to_send, common) = commits_to_send(&store, &tips, &remote_refs)?;

    let mut body = Vec::new();
    for plan in &planned {
        let hex = |id: &Option<CommitId>| match id {
            Some(id) => id.hex(),
            None => "0".repeat(32),
        };
        let mut line = format!("{} {} {}", hex(&plan.old), hex(&plan.new), plan.dst);
        if force || plan.force {
            line.push_str(" force");
        }
        pktline::write_text_line(&mut body, &line)?;
    }
    pktline::write_flush(&mut body)?;

    let mut sender = ObjectSender::new(store.clone(), to_send, &common, u64::MAX)?;
    let mut done = false;
    while !done {
        done = sender.write_objects(&mut body)?;
    }
    let report = transport.receive_pack(body)?;
    let (unpack, ref_reports) = parse_report(&report)?;
    if unpack != "ok" {
        return Err(PushError::UnpackFailed(unpack));
    }

    let mut results = Vec::new();
    for plan in planned {
        let rejected = ref_reports
            .iter()
            .find(|(name, _)| *name == plan.dst)
            .and_then(|(_, reason)| reason.clone());
        if rejected.is_none() {
            if let (Some(new), Some(branch)) = (&plan.new, plan.dst.strip_prefix("heads/")) {
                save_remote_ref(
                    refs,
                    remote,
                    branch,
                    new,
                    author_name,
                    author_email,
                    "push",
                    "update by push",
                )?;
            }
        }
        info!(dst = plan.dst, ok = rejected.is_none(), "pushed ref");
        results.push(PushedRef {
            src: plan.src,
            dst: plan.dst,
            new: plan.new,
            rejected,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LocalTransport;
    use crate::config::Config;
    use crate::config::Receive;
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

    fn new_remote(config: Config) -> (Remote, LocalTransport) {
        let (d1, store) = new_object_store();
        let (d2, refs) = new_ref_store();
        let store = Arc::new(store);
        let refs = Arc::new(refs);
        let server = Arc::new(PackServer::new(
            store.clone(),
            refs.clone(),
            config,
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

    fn head_spec() -> Vec<Refspec> {
        vec!["refs/heads/main:refs/heads/main".parse().unwrap()]
    }

    #[test]
    fn test_push_new_branch() {
        let (remote, transport) = new_remote(Config::default());
        let (_cd, client_store) = new_object_store();
        let (_cr, client_refs) = new_ref_store();
        let client_store = Arc::new(client_store);
        let (c1, _) = create_random_commit(&client_store, 3, 40, &[]);
        crate::refs::save_ref(&client_refs, "heads/main", &c1, "c", "c@e.c", "commit", "m")
            .unwrap();

        let results = push(
            client_store.clone(),
            &client_refs,
            &transport,
            "origin",
            &head_spec(),
            "c",
            "c@e.c",
            false,
        )
        .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].rejected, None);
        assert_eq!(remote.refs.get("heads/main").unwrap(), c1);
        let commit = remote.store.get_commit(&c1).unwrap();
        assert!(remote.store.commit_is_complete(&commit));
        // Remote-tracking ref moved too
        assert_eq!(client_refs.get("remotes/origin/main").unwrap(), c1);
    }

    #[test]
    fn test_push_incremental_excludes_known_objects() {
        let (remote, transport) = new_remote(Config::default());
        let (_cd, client_store) = new_object_store();
        let (_cr, client_refs) = new_ref_store();
        let client_store = Arc::new(client_store);

        let (c1, _) = create_random_commit(&client_store, 3, 10, &[]);
        crate::refs::save_ref(&client_refs, "heads/main", &c1, "c", "c@e.c", "commit", "m")
            .unwrap();
        push(
            client_store.clone(),
            &client_refs,
            &transport,
            "origin",
            &head_spec(),
            "c",
            "c@e.c",
            false,
        )
        .unwrap();

        let (c2, _) = create_random_commit(&client_store, 3, 10, &[c1]);
        crate::refs::save_ref(&client_refs, "heads/main", &c2, "c", "c@e.c", "commit", "m")
            .unwrap();
        push(
            client_store.clone(),
            &client_refs,
            &transport,
            "origin",
            &head_spec(),
            "c",
            "c@e.c",
            false,
        )
        .unwrap();
        assert_eq!(remote.refs.get("heads/main").unwrap(), c2);

        // Pushing again with nothing new fails fast.
        let err = push(
            client_store.clone(),
            &client_refs,
            &transport,
            "origin",
            &head_spec(),
            "c",
            "c@e.c",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, PushError::NothingToPush));
    }

    #[test]
    fn test_push_non_fast_forward_rejected() {
        let (remote, transport) = new_remote(Config {
            receive: Some(Receive {
                deny_non_fast_forwards: Some(true),
                deny_deletes: None,
            }),
            ..Default::default()
        });
        let (_cd, client_store) = new_object_store();
        let (_cr, client_refs) = new_ref_store();
        let client_store = Arc::new(client_store);

        let (c1, _) = create_random_commit(&client_store, 3, 10, &[]);
        crate::refs::save_ref(&client_refs, "heads/main", &c1, "c", "c@e.c", "commit", "m")
            .unwrap();
        push(
            client_store.clone(),
            &client_refs,
            &transport,
            "origin",
            &head_spec(),
            "c",
            "c@e.c",
            false,
        )
        .unwrap();

        // Rewrite history locally: c2 is a sibling of c1, not a child.
        let (c2, _) = create_random_commit(&client_store, 3, 10, &[]);
        crate::refs::save_ref(&client_refs, "heads/main", &c2, "c", "c@e.c", "reset", "m")
            .unwrap();
        let results = push(
            client_store.clone(),
            &client_refs,
            &transport,
            "origin",
            &head_spec(),
            "c",
            "c@e.c",
            false,
        )
        .unwrap();
        assert_eq!(results[0].rejected.as_deref(), Some("non-fast-forward"));
        // Server ref unchanged
        assert_eq!(remote.refs.get("heads/main").unwrap(), c1);
    }
}
