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

//! Server-side receive-pack session (push).
//!
//! The client sends `<old-hex> <new-hex> <ref>` pkt-lines (a trailing
//! `force` token marks a forced update), a flush, then the packfile. The
//! packfile may share the first request body or arrive in a follow-up
//! request. Updates are validated before unpacking (stale old value,
//! fast-forward and delete policy), re-validated for completeness after,
//! then applied one by one with reflog entries. Failures are per-ref; a
//! failed ref never blocks the others.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::info;

use crate::config::Config;
use crate::content_hash::is_zero;
use crate::dag_walk;
use crate::object_id::ObjectId as _;
use crate::object_id::sum_from_hex;
use crate::objects::CommitId;
use crate::pktline;
use crate::pktline::PktLine;
use crate::pktline::PktLineError;
use crate::receiver::ReceiveError;
use crate::receiver::receive_objects;
use crate::objects::Timestamp;
use crate::refs::RefStore;
use crate::refs::ReflogEntry;
use crate::store::ObjectStore;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReceivePackError {
    #[error("bad receive-pack request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    PktLine(#[from] PktLineError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub name: String,
    /// Expected current value; `None` when the ref should not exist yet.
    pub old: Option<CommitId>,
    /// Desired value; `None` deletes the ref.
    pub new: Option<CommitId>,
    pub force: bool,
    status: Option<String>,
}

impl RefUpdate {
    fn rejected(&self) -> bool {
        self.status.is_some()
    }

    fn reject(&mut self, reason: &str) {
        if self.status.is_none() {
            self.status = Some(reason.to_owned());
        }
    }
}

fn parse_update_line(text: &str) -> Result<RefUpdate, ReceivePackError> {
    let bad = || ReceivePackError::BadRequest(format!("invalid update line {text:?}"));
    let mut fields = text.split(' ');
    let old = fields.next().ok_or_else(bad)?;
    let new = fields.next().ok_or_else(bad)?;
    let name = fields.next().ok_or_else(bad)?.to_owned();
    let force = match fields.next() {
        None => false,
        Some("force") => true,
        Some(_) => return Err(bad()),
    };
    let parse = |hex: &str| -> Result<Option<CommitId>, ReceivePackError> {
        let sum = sum_from_hex(hex).ok_or_else(bad)?;
        Ok((!is_zero(&sum)).then(|| CommitId::new(sum)))
    };
    Ok(RefUpdate {
        name,
        old: parse(old)?,
        new: parse(new)?,
        force,
        status: None,
    })
}

enum Phase {
    AwaitUpdates,
    AwaitPackfile,
    Done,
}

pub struct ReceivePackSession {
    store: Arc<ObjectStore>,
    refs: Arc<RefStore>,
    config: Config,
    updates: Vec<RefUpdate>,
    phase: Phase,
    unpack_status: String,
    last_active: Instant,
}

impl ReceivePackSession {
    pub fn new(store: Arc<ObjectStore>, refs: Arc<RefStore>, config: Config) -> Self {
        Self {
            store,
            refs,
            config,
            updates: Vec::new(),
            phase: Phase::AwaitUpdates,
            unpack_status: "ok".to_owned(),
            last_active: Instant::now(),
        }
    }

    pub fn idle_since(&self) -> Instant {
        self.last_active
    }

    /// Handles one request body; returns the response payload and whether
    /// the session is complete.
    pub fn handle(&mut self, body: &[u8]) -> Result<(Vec<u8>, bool), ReceivePackError> {
        self.last_active = Instant::now();
        let mut reader = body;
        if matches!(self.phase, Phase::AwaitUpdates) {
            self.read_updates(&mut reader)?;
            self.validate_updates();
            self.phase = Phase::AwaitPackfile;
            if reader.is_empty() {
                // Packfile comes in a follow-up request.
                let mut payload = Vec::new();
                pktline::write_text_line(&mut payload, "continue")?;
                pktline::write_flush(&mut payload)?;
                return Ok((payload, false));
            }
        }
        if !reader.is_empty() {
            match receive_objects(&self.store, reader) {
                Ok(_) => {}
                Err(ReceiveError::Store(err)) => return Err(err.into()),
                Err(err) => {
                    self.unpack_status = err.to_string();
                }
            }
        }
        let payload = self.finish()?;
        self.phase = Phase::Done;
        Ok((payload, true))
    }

    fn read_updates(&mut self, reader: &mut &[u8]) -> Result<(), ReceivePackError> {
        loop {
            match pktline::read_pkt_line(reader)? {
                None | Some(PktLine::Flush) => return Ok(()),
                Some(line) => {
                    let text = line.as_text().ok_or_else(|| {
                        ReceivePackError::BadRequest("binary pkt-line".to_owned())
                    })?;
                    self.updates.push(parse_update_line(text)?);
                }
            }
        }
    }

    // Policy checks that do not need the pushed objects. Fast-forward
    // checks need the new commits, so they run after unpacking.
    fn validate_updates(&mut self) {
        let deny_deletes = self.config.deny_deletes();
        for update in &mut self.updates {
            let current = self.refs.get(&update.name).ok();
            if current != update.old {
                update.reject("remote ref updated since checkout");
                continue;
            }
            if update.new.is_none() && deny_deletes {
                update.reject("deletion prohibited");
            }
        }
    }

    fn finish(&mut self) -> Result<Vec<u8>, ReceivePackError> {
        let mut payload = Vec::new();
        pktline::write_text_line(&mut payload, &format!("unpack {}", self.unpack_status))?;
        if self.unpack_status != "ok" {
            for update in &self.updates {
                pktline::write_text_line(
                    &mut payload,
                    &format!("ng {} unpacker error", update.name),
                )?;
            }
            pktline::write_flush(&mut payload)?;
            return Ok(payload);
        }
        let deny_nonff = self.config.deny_non_fast_forwards();
        for i in 0..self.updates.len() {
            let mut update = self.updates[i].clone();
            if !update.rejected() {
                self.check_new_commit(&mut update)?;
            }
            if !update.rejected() {
                self.check_fast_forward(&mut update, deny_nonff)?;
            }
            if !update.rejected() {
                if let Err(err) = self.apply(&update) {
                    update.reject(&err.to_string());
                }
            }
            let line = match &update.status {
                None => format!("ok {}", update.name),
                Some(reason) => format!("ng {} {}", update.name, reason),
            };
            info!(name = update.name, ok = !update.rejected(), "ref update");
            pktline::write_text_line(&mut payload, &line)?;
            self.updates[i] = update;
        }
        pktline::write_flush(&mut payload)?;
        Ok(payload)
    }

    // The pushed tip must now be a complete commit.
    fn check_new_commit(&self, update: &mut RefUpdate) -> Result<(), ReceivePackError> {
        let Some(new) = &update.new else {
            return Ok(());
        };
        match self.store.get_commit(new) {
            Ok(commit) => {
                if !self.store.commit_is_complete(&commit) {
                    update.reject("missing necessary objects");
                }
                Ok(())
            }
            Err(err) if err.is_not_found() => {
                update.reject("missing necessary objects");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn check_fast_forward(
        &self,
        update: &mut RefUpdate,
        deny_nonff: bool,
    ) -> Result<(), ReceivePackError> {
        let (Some(old), Some(new)) = (&update.old, &update.new) else {
            return Ok(());
        };
        if !dag_walk::is_ancestor_of(&self.store, old, new)? && (deny_nonff || !update.force) {
            update.reject("non-fast-forward");
        }
        Ok(())
    }

    fn apply(&self, update: &RefUpdate) -> Result<(), crate::refs::RefError> {
        match &update.new {
            None => self.refs.delete(&update.name),
            Some(new) => {
                let entry = ReflogEntry {
                    old_oid: update.old,
                    new_oid: *new,
                    author_name: self.config.user_name().unwrap_or("wrangle").to_owned(),
                    author_email: self
                        .config
                        .user_email()
                        .unwrap_or("wrangle@localhost")
                        .to_owned(),
                    time: Timestamp::now(),
                    action: "receive-pack".to_owned(),
                    message: "update by push".to_owned(),
                };
                self.refs.set_with_log(&update.name, new, &entry)
            }
        }
    }
}
