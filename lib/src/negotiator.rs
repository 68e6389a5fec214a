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

//! Server side of the wants/haves negotiation.
//!
//! Each round the client offers commits it already holds; the server ACKs
//! the ones it recognizes as reachable from the wants and grows the common
//! set with their ancestors. Negotiation finishes when the client signals
//! `done`, offers nothing new, or every want's history is fenced off by
//! common commits, at which point the commits to send form a closed set.

use std::collections::HashSet;
use std::collections::VecDeque;

use thiserror::Error;
use tracing::debug;

use crate::dag_walk;
use crate::object_id::ObjectId as _;
use crate::objects::Commit;
use crate::objects::CommitId;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("empty wants list")]
    EmptyWants,
    #[error("unrecognized wants: {0}")]
    UnrecognizedWants(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default)]
pub struct Negotiator {
    wants: Vec<CommitId>,
    common: HashSet<CommitId>,
    finished: bool,
}

impl Negotiator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn common(&self) -> &HashSet<CommitId> {
        &self.common
    }

    /// Handles one round. Returns the ACKs for `haves`, in the order they
    /// were received; an empty list means negotiation is finished and the
    /// send phase may begin.
    pub fn handle_upload_pack_request(
        &mut self,
        store: &ObjectStore,
        wants: &[CommitId],
        haves: &[CommitId],
        done: bool,
    ) -> Result<Vec<CommitId>, NegotiationError> {
        if self.wants.is_empty() {
            if wants.is_empty() {
                return Err(NegotiationError::EmptyWants);
            }
            let missing: Vec<String> = wants
                .iter()
                .filter(|want| !store.commit_exists(want))
                .map(|want| want.hex())
                .collect();
            if !missing.is_empty() {
                return Err(NegotiationError::UnrecognizedWants(missing.join(", ")));
            }
            self.wants = wants.to_vec();
        }

        let mut acks = Vec::new();
        for have in haves {
            if self.common.contains(have) {
                continue;
            }
            if store.commit_exists(have) && self.reachable_from_wants(store, have)? {
                acks.push(*have);
                for ancestor in dag_walk::reachable(store, &[*have])? {
                    self.common.insert(ancestor);
                }
            }
        }
        debug!(acks = acks.len(), common = self.common.len(), "negotiation round");

        if done || acks.is_empty() || self.closed_set_found(store)? {
            self.finished = true;
            return Ok(Vec::new());
        }
        Ok(acks)
    }

    fn reachable_from_wants(
        &self,
        store: &ObjectStore,
        target: &CommitId,
    ) -> Result<bool, NegotiationError> {
        for want in &self.wants {
            if dag_walk::is_ancestor_of(store, target, want)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    // Every path from a want must end in a common commit before running
    // off the root or a shallow boundary; only then does the common set
    // fence the history to send.
    fn closed_set_found(&self, store: &ObjectStore) -> Result<bool, NegotiationError> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<CommitId> = self.wants.iter().copied().collect();
        while let Some(id) = queue.pop_front() {
            if self.common.contains(&id) || !seen.insert(id) {
                continue;
            }
            match store.get_commit(&id) {
                Ok(commit) => {
                    if commit.parents.is_empty() {
                        return Ok(false);
                    }
                    queue.extend(commit.parents);
                }
                Err(err) if err.is_not_found() => return Ok(false),
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }

    /// The closed set of commits to send: reachable from the wants, fenced
    /// by the common set, within `depth` generations of a want (0 means
    /// unlimited). Ordered want by want, children before parents.
    pub fn commits_to_send(
        &self,
        store: &ObjectStore,
        depth: u32,
    ) -> Result<Vec<(CommitId, Commit)>, NegotiationError> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for want in &self.wants {
            let mut queue = VecDeque::from([(*want, 0u32)]);
            while let Some((id, distance)) = queue.pop_front() {
                if self.common.contains(&id) || !seen.insert(id) {
                    continue;
                }
                if depth > 0 && distance >= depth {
                    continue;
                }
                match store.get_commit(&id) {
                    Ok(commit) => {
                        queue.extend(
                            commit
                                .parents
                                .iter()
                                .map(|parent| (*parent, distance + 1)),
                        );
                        out.push((id, commit));
                    }
                    Err(err) if err.is_not_found() => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::object_id::ObjectId as _;
    use testutils::new_object_store;
    use testutils::random_sum;
    use testutils::save_commit_with_parents;

    // Two independent chains: 1 <- 3 <- 5 and 2 <- 4 <- 6
    fn two_chains(store: &ObjectStore) -> Vec<CommitId> {
        let c1 = save_commit_with_parents(store, &[]);
        let c2 = save_commit_with_parents(store, &[]);
        let c3 = save_commit_with_parents(store, &[c1]);
        let c4 = save_commit_with_parents(store, &[c2]);
        let c5 = save_commit_with_parents(store, &[c3]);
        let c6 = save_commit_with_parents(store, &[c4]);
        vec![c1, c2, c3, c4, c5, c6]
    }

    #[test]
    fn test_send_everything_when_haves_empty() {
        let (_dir, store) = new_object_store();
        let c = two_chains(&store);
        let mut neg = Negotiator::new();
        let acks = neg
            .handle_upload_pack_request(&store, &[c[4], c[5]], &[], false)
            .unwrap();
        assert!(acks.is_empty());
        assert!(neg.finished());
        let commits: HashSet<CommitId> = neg
            .commits_to_send(&store, 0)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(commits, c.iter().copied().collect());
    }

    #[test]
    fn test_closed_set_in_one_round() {
        let (_dir, store) = new_object_store();
        let c = two_chains(&store);
        let mut neg = Negotiator::new();
        let acks = neg
            .handle_upload_pack_request(&store, &[c[2], c[3]], &[c[0], c[1]], false)
            .unwrap();
        // Closed set found immediately, so no more negotiation is needed.
        assert!(acks.is_empty());
        assert!(neg.finished());
        let commits: Vec<CommitId> = neg
            .commits_to_send(&store, 0)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(commits, vec![c[2], c[3]]);
    }

    #[test]
    fn test_acks_then_closed_set() {
        let (_dir, store) = new_object_store();
        let c = two_chains(&store);
        let mut neg = Negotiator::new();
        let acks = neg
            .handle_upload_pack_request(&store, &[c[4], c[5]], &[c[0]], false)
            .unwrap();
        assert_eq!(acks, vec![c[0]]);
        assert!(!neg.finished());

        let acks = neg
            .handle_upload_pack_request(&store, &[], &[c[1]], false)
            .unwrap();
        assert!(acks.is_empty());
        assert!(neg.finished());
        let commits: Vec<CommitId> = neg
            .commits_to_send(&store, 0)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        // Want by want, children before parents.
        assert_eq!(commits, vec![c[4], c[2], c[5], c[3]]);
    }

    #[test]
    fn test_irrelevant_haves_are_not_acked() {
        let (_dir, store) = new_object_store();
        let c = two_chains(&store);
        let lone = save_commit_with_parents(&store, &[]);
        let mut neg = Negotiator::new();
        let acks = neg
            .handle_upload_pack_request(&store, &[c[4]], &[lone], false)
            .unwrap();
        assert!(acks.is_empty());
        assert!(neg.finished());
    }

    #[test]
    fn test_empty_and_unrecognized_wants() {
        let (_dir, store) = new_object_store();
        let c = two_chains(&store);
        let mut neg = Negotiator::new();
        assert_matches!(
            neg.handle_upload_pack_request(&store, &[], &[c[0]], false),
            Err(NegotiationError::EmptyWants)
        );
        let missing = CommitId::new(random_sum());
        let mut neg = Negotiator::new();
        assert_matches!(
            neg.handle_upload_pack_request(&store, &[missing], &[], false),
            Err(NegotiationError::UnrecognizedWants(list)) if list == missing.hex()
        );
    }

    #[test]
    fn test_done_finishes_early() {
        let (_dir, store) = new_object_store();
        let c = two_chains(&store);
        let mut neg = Negotiator::new();
        let acks = neg
            .handle_upload_pack_request(&store, &[c[4], c[5]], &[c[0]], true)
            .unwrap();
        assert!(acks.is_empty());
        assert!(neg.finished());
        // Common still excludes what the client proved it has.
        let commits: Vec<CommitId> = neg
            .commits_to_send(&store, 0)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(commits, vec![c[4], c[2], c[5], c[3], c[1]]);
    }

    #[test]
    fn test_depth_limits_generations() {
        let (_dir, store) = new_object_store();
        let c = two_chains(&store);
        let mut neg = Negotiator::new();
        neg.handle_upload_pack_request(&store, &[c[4]], &[], false)
            .unwrap();
        let commits: Vec<CommitId> = neg
            .commits_to_send(&store, 2)
            .unwrap()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(commits, vec![c[4], c[2]]);

        let commits = neg.commits_to_send(&store, 1).unwrap();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].0, c[4]);
    }
}
