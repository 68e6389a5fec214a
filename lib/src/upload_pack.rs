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

//! Server-side upload-pack session: one per fetching client, spanning the
//! negotiation rounds and the packfile send phase.
//!
//! Request bodies are pkt-line streams of `want <hex>`, `have <hex>` and
//! optionally `depth <n>` lines, finalized by `done` or a flush packet.
//! Responses are either ACK/NAK pkt-lines (negotiation continues) or a
//! packfile chunk; `more` flags that further chunks remain and the client
//! should post again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::negotiator::NegotiationError;
use crate::negotiator::Negotiator;
use crate::object_id::ObjectId as _;
use crate::objects::CommitId;
use crate::pktline;
use crate::pktline::PktLine;
use crate::pktline::PktLineError;
use crate::sender::ObjectSender;
use crate::sender::SendError;
use crate::store::ObjectStore;

#[derive(Debug, Error)]
pub enum UploadPackError {
    #[error("bad upload-pack request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    PktLine(#[from] PktLineError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Send(#[from] SendError),
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UploadPackRequest {
    pub wants: Vec<CommitId>,
    pub haves: Vec<CommitId>,
    pub depth: u32,
    pub done: bool,
}

/// Parses one request body.
pub fn parse_upload_pack_request(bytes: &[u8]) -> Result<UploadPackRequest, UploadPackError> {
    let mut reader = bytes;
    let mut request = UploadPackRequest::default();
    loop {
        let line = match pktline::read_pkt_line(&mut reader)? {
            // Absent trailer behaves like a flush: negotiation continues.
            None | Some(PktLine::Flush) => return Ok(request),
            Some(line) => line,
        };
        let text = line
            .as_text()
            .ok_or_else(|| UploadPackError::BadRequest("binary pkt-line".to_owned()))?
            .to_owned();
        if let Some(hex) = text.strip_prefix("want ") {
            request.wants.push(parse_id(hex)?);
        } else if let Some(hex) = text.strip_prefix("have ") {
            request.haves.push(parse_id(hex)?);
        } else if let Some(n) = text.strip_prefix("depth ") {
            request.depth = n
                .parse()
                .map_err(|_| UploadPackError::BadRequest(format!("bad depth {n:?}")))?;
        } else if text == "done" {
            request.done = true;
            return Ok(request);
        } else {
            return Err(UploadPackError::BadRequest(format!(
                "unexpected line {text:?}"
            )));
        }
    }
}

fn parse_id(hex: &str) -> Result<CommitId, UploadPackError> {
    CommitId::try_from_hex(hex)
        .ok_or_else(|| UploadPackError::BadRequest(format!("invalid commit id {hex:?}")))
}

/// What one round produced: either negotiation pkt-lines or a packfile
/// chunk.
#[derive(Debug, PartialEq, Eq)]
pub enum UploadPackResponse {
    /// ACK/NAK pkt-line payload; the session expects more rounds.
    Acks(Vec<u8>),
    /// One packfile chunk; `more` means the client must request the next
    /// chunk, `false` that the session is finished.
    Packfile { chunk: Vec<u8>, more: bool },
}

pub struct UploadPackSession {
    store: Arc<ObjectStore>,
    negotiator: Negotiator,
    sender: Option<ObjectSender>,
    max_packfile_size: u64,
    depth: u32,
    last_active: Instant,
}

impl UploadPackSession {
    pub fn new(store: Arc<ObjectStore>, max_packfile_size: u64) -> Self {
        Self {
            store,
            negotiator: Negotiator::new(),
            sender: None,
            max_packfile_size,
            depth: 0,
            last_active: Instant::now(),
        }
    }

    pub fn idle_since(&self) -> Instant {
        self.last_active
    }

    /// Handles one request body. The boolean is true when the session is
    /// complete and can be evicted.
    pub fn handle(&mut self, body: &[u8]) -> Result<(UploadPackResponse, bool), UploadPackError> {
        self.last_active = Instant::now();
        if self.sender.is_some() {
            return self.next_chunk();
        }
        let request = parse_upload_pack_request(body)?;
        if request.depth > 0 {
            self.depth = request.depth;
        }
        let acks = self.negotiator.handle_upload_pack_request(
            &self.store,
            &request.wants,
            &request.haves,
            request.done,
        )?;
        if self.negotiator.finished() {
            let to_send = self.negotiator.commits_to_send(&self.store, self.depth)?;
            let common: HashSet<CommitId> = self.negotiator.common().clone();
            self.sender = Some(ObjectSender::new(
                self.store.clone(),
                to_send,
                &common,
                self.max_packfile_size,
            )?);
            return self.next_chunk();
        }
        let mut payload = Vec::new();
        if acks.is_empty() {
            pktline::write_text_line(&mut payload, "NAK")?;
        }
        for ack in acks {
            pktline::write_text_line(&mut payload, &format!("ACK {}", ack.hex()))?;
        }
        pktline::write_flush(&mut payload)?;
        Ok((UploadPackResponse::Acks(payload), false))
    }

    fn next_chunk(&mut self) -> Result<(UploadPackResponse, bool), UploadPackError> {
        let sender = self.sender.as_mut().expect("send phase started");
        let mut chunk = Vec::new();
        let done = sender.write_objects(&mut chunk)?;
        Ok((
            UploadPackResponse::Packfile { chunk, more: !done },
            done,
        ))
    }
}
